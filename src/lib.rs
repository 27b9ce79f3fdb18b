//! # ctlsock
//!
//! A local HTTP/1.1 control endpoint on a Unix domain socket.
//!
//! A desktop process exposes a small command surface to local tools
//! (`curl --unix-socket`, scripts, a CLI) without opening a TCP port. The
//! socket lives in a private directory; filesystem permissions are the only
//! access control.
//!
//! ## What it does
//!
//! - Recreates the socket directory on every start, refusing to clobber a
//!   live instance's socket
//! - Frames HTTP/1.1 requests: `Content-Length`, chunked and absent bodies
//! - Hands every request to one injected [`RequestHandler`]
//! - Writes plain-text responses with an exact `Content-Length`
//! - Graceful shutdown: in-flight requests finish, idle connections close
//!
//! Routing is not its business: the handler gets the raw path and decides.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use ctlsock::{ControlSocketConfig, HandleResult, Listener, RequestBody, RequestHead};
//! use http::StatusCode;
//!
//! fn on_request(head: &RequestHead, body: &RequestBody) -> HandleResult {
//!     match (head.method().as_str(), head.path()) {
//!         ("POST", "/cmd") => HandleResult::ok(format!("got {} bytes\n", body.len())),
//!         _ => HandleResult::new(StatusCode::NOT_FOUND),
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ControlSocketConfig::browsermux().ok_or("no home directory")?;
//!     let (handle, completion) = Listener::bind(config, on_request)?;
//!     tokio::pin!(completion);
//!
//!     tokio::select! {
//!         res = &mut completion => return Ok(res?),
//!         () = ctlsock::shutdown_signal() => handle.shutdown(),
//!     }
//!     // Waits for in-flight requests.
//!     completion.await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Errors
//!
//! Two tiers. A [`StartupError`] means the listener never started and is
//! meant for the operator: it carries a summary, an explanation and the OS
//! error. A [`TransportError`] only ever closes the one connection it
//! happened on, after logging it.

mod config;
mod connection;
mod dispatch;
mod error;
mod framer;
mod handler;
mod listener;
mod request;
mod response;
mod socket_dir;

pub use config::{ClosePolicy, ControlSocketConfig, StalePolicy};
pub use dispatch::dispatch;
pub use error::{ListenerError, StartupError, StartupStage, TransportError};
pub use framer::{Frame, HttpFramer};
pub use handler::{RequestHandler, SharedHandler};
pub use listener::{Completion, Listener, ListenerHandle, shutdown_signal};
pub use request::{RequestBody, RequestHead};
pub use response::{HandleResult, Outgoing, Reply, ResponseWriter};
pub use socket_dir::prepare;
