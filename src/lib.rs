// sequin moves sequence-numbered messages through a consistent-hash routed
// broker and checks, on both ends, that every position arrives exactly once
// and in order.
//
// The publisher side keeps one broker link at a time. Every publish is
// tracked until the broker confirms or rejects it, and publishing backs off
// whenever too many confirmations are outstanding. Link failures walk the
// node roster and eventually cool down before starting over, so a publisher
// survives any single node going away.
//
// The consumer side relays messages between queues, dropping duplicates, and
// validates the final per-key sequence, reporting every gap or regression.
// Consumer state is reset after idle periods, which is when one demo burst is
// assumed to have ended and the next one not yet started.
//
// Everything speaks to the broker through `broker::Connection`, an ordered
// stream of events paired with a command sender. The in-process cluster and
// the QUIC link both produce the same connection type.

pub mod broker;
pub mod client;
pub mod config;
mod hex;
pub mod signals;

pub use hex::{Hex, HexDisplayExt};
