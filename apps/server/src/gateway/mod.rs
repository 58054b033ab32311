//! WebSocket transport: upgrade handling, per-connection read loops, and
//! translation of client envelopes into Hub calls.

pub mod dispatch;
pub mod server;
