//! Async message streams: a single-type duplex layer over one
//! byte stream, one instance per direction. Specialising to a single
//! message type per instance — rather than a tagged union of every message
//! kind the protocol can carry — avoids a per-message type tag and keeps the
//! per-queued-object footprint small, which matters because the
//! anticipated-message buffer sizes the worst-case memory during reconnect.

mod input;
mod output;

pub use input::AsyncInputStream;
pub use output::AsyncOutputStream;
