//! Kite: a peer-to-peer RPC framework.
//!
//! Every kite is both a server and a client. Sessions ride on SockJS
//! frames carrying dnode messages, so either side can hand the other a
//! callable by reference. Kites discover each other through kontrol,
//! the registry/authentication kite, and trust each other via RS256
//! JWTs kontrol signs: a long-lived kite key asserting identity and a
//! short-lived call token scoped by an audience path.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! let kite = kite::Kite::new("mathworker", "1.0.0");
//! kite.handle_func("square", |req| async move {
//!     let n: f64 = req.one()?;
//!     Ok(serde_json::json!(n * n))
//! });
//! kite.serve().await
//! # }
//! ```

mod auth;
mod backoff;
mod callbacks;
mod client;
mod config;
mod error;
pub mod kitekey;
mod kontrol;
mod method;
mod registration;
mod renewer;
mod request;
mod restart;
mod runtime;
mod server;

pub use kite_protocol as protocol;
pub use kite_sockjs::Transport;

pub use auth::{Authenticator, KeyVerifier, VerifyCache, VERIFY_TTL};
pub use backoff::DialBackoff;
pub use client::{Client, ConnState, RemoteFunction};
pub use config::{init_logging, Config, TlsConfig};
pub use error::KiteError;
pub use kontrol::{EventHandler, KontrolClient, WatcherHandle};
pub use method::{Handler, LeakyBucket, MethodHandle, MethodHandling};
pub use request::Request;
pub use runtime::Kite;
