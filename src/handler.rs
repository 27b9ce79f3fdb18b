//! The request-handling capability injected into a [`Listener`](crate::Listener).
//!
//! # Shape
//!
//! One synchronous operation: a parsed head and body in, a [`HandleResult`]
//! out. Implement the trait on your own type, or pass any closure or `fn`
//! with the matching signature:
//!
//! ```rust
//! use ctlsock::{HandleResult, RequestBody, RequestHead};
//!
//! fn handle(head: &RequestHead, body: &RequestBody) -> HandleResult {
//!     match head.path() {
//!         "/ping" => HandleResult::ok("pong\n"),
//!         _ => HandleResult::ok(format!("got {} bytes\n", body.len())),
//!     }
//! }
//! ```
//!
//! Closures need their parameter types spelled out so they are generic over
//! the borrow lifetimes:
//!
//! ```rust
//! use ctlsock::{HandleResult, RequestBody, RequestHead};
//! let handler = |_head: &RequestHead, _body: &RequestBody| HandleResult::ok("ok\n");
//! ```
//!
//! # Concurrency
//!
//! A single handler instance is shared by every connection and may be called
//! from several threads at once, hence `Send + Sync`. Each call runs on the
//! blocking pool, so a slow handler stalls its own connection only. It
//! should still return promptly or hand long work off elsewhere.

use std::sync::Arc;

use crate::request::{RequestBody, RequestHead};
use crate::response::HandleResult;

/// Maps one parsed request onto a response descriptor.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, head: &RequestHead, body: &RequestBody) -> HandleResult;
}

impl<F> RequestHandler for F
where
    F: Fn(&RequestHead, &RequestBody) -> HandleResult + Send + Sync + 'static,
{
    fn handle(&self, head: &RequestHead, body: &RequestBody) -> HandleResult {
        self(head, body)
    }
}

/// A handler shared across connection tasks.
pub type SharedHandler = Arc<dyn RequestHandler>;
