//! Core data-plane of a cloud storage client SDK.
//!
//! cumulo turns a byte stream from a remote API into a live, queryable,
//! mutable node tree while coordinating concurrent uploads, integrity
//! checks, and authenticated access. It is the engine under a sync client:
//! transport and UI live elsewhere and talk to this crate through narrow
//! seams.
//!
//! # Subsystems
//! - [`json`] / [`splitter`] — a linear non-validating scanner and a
//!   streaming push-parser that fires path-keyed callbacks as network bytes
//!   arrive, with pause/resume and exact byte accounting
//! - [`commands`] — command batching, one-request-in-flight dispatch, and
//!   idempotent retry under a frozen request id
//! - [`actionpackets`] — server-pushed mutation events applied atomically to
//!   the cache, sequence number tracking
//! - [`cache`] — the SQLite-backed node cache: schema migration, virtual
//!   columns, recursive filtered search, tag aggregation, natural
//!   case-insensitive collation, cancellable queries
//! - [`throttle`] — bounded-rate scheduling of sync uploads with per-file
//!   counters
//! - [`ipc`] — the local shell↔server agent channel over UNIX sockets,
//!   loopback TCP, or named pipes
//! - [`transport`] — the abstract streaming-HTTP contract and the pump
//!   wiring chunks into the dispatcher
//! - [`hashcash`] / [`totp`] — the login proof-of-work solver and RFC-6238
//!   one-time passwords for stored credentials
//! - [`engine`] — the context object owning the single-writer core
//!
//! # Concurrency model
//! One engine thread runs parser, dispatcher, and cache mutators
//! sequentially. Transport threads deliver bytes through an event queue;
//! the HashCash pool is the only CPU-parallel piece and shares nothing but
//! an atomic stop flag and a winner slot.

/// Action-packet dispatch into the node cache.
pub mod actionpackets;

/// SQLite-backed node cache and generic state storage.
pub mod cache;

/// Command batching and the request/response dispatcher.
pub mod commands;

/// Engine context and lifecycle.
pub mod engine;

/// Error types shared across the crate.
pub mod error;

/// Login proof-of-work solver and validator.
pub mod hashcash;

/// Shell↔server local IPC.
pub mod ipc;

/// Linear non-validating JSON scanner.
pub mod json;

/// Node data model and blob codec.
pub mod node;

/// Streaming JSON splitter with path-keyed filters.
pub mod splitter;

/// Upload throttling for the sync engine.
pub mod throttle;

/// Tracing bootstrap (feature `trace-init`).
#[cfg(feature = "trace-init")]
pub mod trace;

/// RFC-6238 time-based one-time passwords.
pub mod totp;

/// Streaming transport contracts and glue.
pub mod transport;

/// User attribute records and their TLV wire form.
pub mod userattrs;

pub use bytes::Bytes;
pub use cache::{CancelToken, DbConfig, NodeStore};
pub use engine::{Engine, EngineConfig, TransportEvent};
pub use error::{ApiError, DbError, OutCode};
pub use node::{Handle, Node, NodeType};
pub use splitter::{FilterOutcome, JsonSplitter};
