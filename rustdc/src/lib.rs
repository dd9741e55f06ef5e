//! DataCapsule: an append-only, content-addressed log shared between a
//! writer and many readers through a server that is not trusted.
//!
//! The writer seals records into hash blocks and signs a commit root for
//! every batch. Readers only accept data that is reachable from a signed
//! root, so a server that forges, drops or reorders records is detected.

pub mod client;
pub mod server;
pub mod shared;
