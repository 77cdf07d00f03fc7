//! HTTP/1.x wire layer of the proxy.
//!
//! # Architecture
//!
//! - **`connection`**: per-client state machine driving requests through the dispatcher
//! - **`parser`**: request/response head parsing on top of `httparse`
//! - **`headers`**: ordered, case-insensitive header map
//! - **`request`**: request head representation
//! - **`response`**: locally generated responses and relayed response heads
//! - **`body`**: body framing detection and streaming relay
//! - **`stream`**: buffered socket wrapper with idle timeouts
//! - **`writer`**: head and response serialization
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for the next request head
//!        └──────┬──────┘
//!               │ Head received
//!               ▼
//!        ┌──────────────────┐
//!        │   Dispatching    │ ← Route, authenticate, forward, relay response
//!        └──────┬───────────┘
//!               ├─ Keep-Alive → Reading (same connection)
//!               ├─ 101 Switching Protocols → Tunnelling → Closed
//!               └─ Close → Closed
//! ```
//!
//! # Example
//!
//! ```ignore
//! let stream = BufferedStream::new(socket, idle_timeout);
//! let mut conn = Connection::new(stream, peer, dispatcher.clone());
//! if let Err(e) = conn.run().await {
//!     tracing::error!("Connection error: {}", e);
//! }
//! ```

pub mod body;
pub mod connection;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod stream;
pub mod writer;
