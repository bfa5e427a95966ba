//! Multi-tenant note and attachment synchronization service. Clients
//! hold a WebSocket open, send typed mutation frames, and every accepted
//! write is resolved, persisted, and fanned out to the owner's other
//! live sessions.

pub mod blob;
pub mod database;
pub mod history;
pub mod hub;
pub mod message;
pub mod reaper;
pub mod resolver;
pub mod token;
pub mod types;
pub mod upload;
pub mod write_queue;
