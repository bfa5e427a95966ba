use crate::database::Database;
use crate::types::*;
use dashmap::DashMap;
use log::{debug, error};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// A human typing produces a save flood; storing every intermediate
// version is waste. The first overwrite of a burst snapshots the
// pre-image right away (that is the content the burst destroys), then a
// debounce window swallows the rest. Pre-images held during the window
// are only written out if the note is deleted or renamed mid-burst, or
// the server shuts down, so the content about to vanish is not lost.

struct Held {
    generation: u64,
    pre_image: Option<HistoryRecord>,
}

pub struct HistoryKeeper {
    db: Arc<Database>,
    delay: Duration,
    keep: u32,
    pending: DashMap<(Uid, NoteId), Held>,
    generation: AtomicU64,
}

impl HistoryKeeper {
    pub fn new(db: Arc<Database>, delay: Duration, keep: u32) -> Arc<HistoryKeeper> {
        Arc::new(HistoryKeeper {
            db,
            delay,
            keep,
            pending: DashMap::new(),
            generation: AtomicU64::new(0),
        })
    }

    /// Called by the resolver with the row image an update is about to
    /// overwrite.
    pub fn record(self: &Arc<Self>, pre_image: &NoteRecord) {
        let key = (pre_image.uid, pre_image.id);
        let entry = snapshot_of(pre_image);
        match self.pending.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut held) => {
                // Mid-burst: remember the latest pre-image but do not
                // write. The burst is already summarized by its first
                // capture; this one only matters if the note goes away
                // before the window closes.
                held.get_mut().pre_image = Some(entry);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst);
                vacant.insert(Held {
                    generation,
                    pre_image: None,
                });
                self.write_entry(&entry);

                let keeper = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(keeper.delay).await;
                    // Only close the window we opened; a flush may have
                    // replaced it with a newer burst already.
                    keeper
                        .pending
                        .remove_if(&key, |_, held| held.generation == generation);
                });
            }
        }
    }

    /// Flush the held pre-image for one note, if any. Called on delete
    /// and rename, before the row moves or dies.
    pub fn flush(&self, uid: Uid, note_id: NoteId) {
        if let Some((_, held)) = self.pending.remove(&(uid, note_id)) {
            if let Some(entry) = held.pre_image {
                self.write_entry(&entry);
            }
        }
    }

    /// Flush every held pre-image. Called on server shutdown.
    pub fn flush_all(&self) {
        let keys: Vec<(Uid, NoteId)> = self.pending.iter().map(|entry| *entry.key()).collect();
        for (uid, note_id) in keys {
            self.flush(uid, note_id);
        }
    }

    fn write_entry(&self, entry: &HistoryRecord) {
        if let Err(err) = self.db.insert_history(entry) {
            error!("history write for note {} failed: {}", entry.note_id, err);
            return;
        }
        match self.db.trim_history(entry.note_id, self.keep) {
            Ok(0) => {}
            Ok(trimmed) => debug!("trimmed {} history row(s) for note {}", trimmed, entry.note_id),
            Err(err) => error!("history trim for note {} failed: {}", entry.note_id, err),
        }
    }
}

fn snapshot_of(note: &NoteRecord) -> HistoryRecord {
    HistoryRecord {
        id: 0,
        note_id: note.id,
        uid: note.uid,
        content: note.content.clone(),
        content_hash: note.content_hash.clone(),
        version: note.version,
        captured_at: now_millis(),
        client_name: note.client_name.clone(),
    }
}
