//! Kite protocol: dnode message envelopes, kite identities, queries,
//! and token claims.
//!
//! A kite is a process that is both an RPC server and an RPC client. On
//! the wire a single SockJS text frame carries one JSON dnode message
//! with callback-by-reference marshaling: callable values are replaced
//! by `{"[Function]": <id>}` placeholders and the message records where
//! each placeholder sits so the receiving side can re-attach callable
//! stubs.
//!
//! This crate is pure data — no I/O, no runtime. The `kite` crate binds
//! these types to live sessions.

pub mod claims;
pub mod error;
pub mod kite;
pub mod message;
pub mod query;
pub mod rpc;

pub use claims::KiteClaims;
pub use error::WireError;
pub use kite::Kite;
pub use message::{
    scrub, walk_path, Authentication, CallOptions, FunctionRef, Message, MethodId,
    ResponsePayload,
};
pub use query::{KiteQuery, QueryError};
pub use rpc::{
    EventAction, GetKitesArgs, GetKitesResult, KiteEvent, KiteWithToken, RegisterArgs,
    RegisterHttpRequest, RegisterMachineArgs, RegisterResult,
};

use std::time::Duration;

/// How long a call token is valid.
pub const TOKEN_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// Clock leeway applied when validating `exp` / `nbf`.
pub const TOKEN_LEEWAY: Duration = Duration::from_secs(60);

/// Storage TTL for a registered kite record. A record that is not
/// refreshed within this window is gone.
pub const KEY_TTL: Duration = Duration::from_secs(90);

/// Interval at which registered kites are expected to heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Grace period on top of [`HEARTBEAT_INTERVAL`] before a silent kite
/// is deregistered.
pub const HEARTBEAT_DELAY: Duration = Duration::from_secs(20);

/// Default port kontrol listens on.
pub const KONTROL_PORT: u16 = 4000;

/// How long a kite waits before retrying a failed kontrol operation.
pub const KONTROL_RETRY_INTERVAL: Duration = Duration::from_secs(10);
