//! Reverse proxy functionality
//!
//! This module implements the core reverse proxy logic: header rewriting,
//! upstream connections, the per-request dispatch pipeline and raw
//! tunnelling for upgraded connections.

pub mod dispatcher;
pub mod rewrite;
pub mod tunnel;
pub mod upstream;

pub use dispatcher::{Dispatcher, Outcome};
pub use rewrite::{HeaderAction, HeaderOp, HeaderRewriter, RewriteContext, ValueTemplate};
pub use upstream::UpstreamClient;
