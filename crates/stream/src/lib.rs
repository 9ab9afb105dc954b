//! Durable Streams Server
//!
//! A server for append-only, offset-addressed, content-typed byte
//! streams over HTTP, with exactly-once producer semantics and
//! low-latency live delivery.
//!
//! # Features
//!
//! - **Append-only streams**: byte logs addressed by URL path, with
//!   monotonic decimal byte offsets
//! - **Replay**: read from any offset to catch up on missed bytes
//! - **Long-polling**: suspend at the tail until new bytes arrive
//! - **Server-Sent Events**: continuous delivery, one event per append
//!   (or per top-level JSON value)
//! - **Exactly-once producers**: per-producer epoch/sequence ledger with
//!   zombie fencing and duplicate replay detection
//! - **JSON mode**: `application/json` streams flatten array batches
//!   one level
//! - **TTL/expiration**: relative or absolute stream expiry
//! - **Proxy profile**: forward requests to allowlisted upstreams and
//!   multiplex the response through a framed stream behind a signed URL
//! - **File-backed persistence**: optional journal that survives restart
//!
//! # Example
//!
//! ```rust,no_run
//! use durable_stream::{server, types::ServerOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = ServerOptions {
//!         port: 4437,
//!         host: "127.0.0.1".to_string(),
//!         ..Default::default()
//!     };
//!
//!     server::start_server(options).await.unwrap();
//! }
//! ```
//!
//! # Protocol
//!
//! ## Creating a stream
//!
//! ```text
//! PUT /my-events HTTP/1.1
//! Content-Type: application/json
//! Stream-TTL: 3600
//!
//! Response: 201 Created
//! Stream-Next-Offset: 0
//! ```
//!
//! ## Appending
//!
//! ```text
//! POST /my-events HTTP/1.1
//! Content-Type: application/json
//! Producer-Id: writer-1
//! Producer-Epoch: 0
//! Producer-Seq: 0
//!
//! {"event":"user_created","id":123}
//!
//! Response: 200 OK
//! Stream-Next-Offset: 33
//! ```
//!
//! Replaying the same `(Producer-Id, Producer-Epoch, Producer-Seq)`
//! answers `204 No Content` with the original offset; a stale epoch is
//! fenced with `403`.
//!
//! ## Reading
//!
//! ```text
//! GET /my-events?offset=-1 HTTP/1.1
//!
//! Response: 200 OK
//! Stream-Next-Offset: 33
//! Stream-Up-To-Date: true
//!
//! {"event":"user_created","id":123}
//! ```
//!
//! ## Live tailing
//!
//! ```text
//! GET /my-events?offset=33&live=long-poll HTTP/1.1
//! (suspends until new bytes or the server timeout)
//!
//! GET /my-events?offset=-1&live=sse HTTP/1.1
//!
//! event: data
//! data: {"event":"user_created","id":123}
//!
//! event: control
//! data: {"streamNextOffset":"33","streamCursor":"815210","upToDate":true}
//! ```

pub mod cursor;
pub mod error;
pub mod json;
pub mod ledger;
pub mod maintenance;
pub mod offset;
pub mod persist;
pub mod proxy;
pub mod server;
pub mod sse;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use error::ApiError;
pub use ledger::{ProducerClaim, ProducerRecord};
pub use offset::Offset;
pub use persist::Persister;
pub use proxy::{ProxyConfig, ProxyState};
pub use server::{create_router, start_server, AppState};
pub use store::{AppendOutcome, CreateOutcome, StoreError, StreamStore};
pub use types::{
    ReadResult, ServerOptions, StreamConfig, StreamLifecycleEvent, StreamMeta, StreamState,
};
