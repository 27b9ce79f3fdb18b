//! Hands a framed request to the injected handler.

use std::sync::Arc;

use http::StatusCode;
use tracing::error;

use crate::handler::SharedHandler;
use crate::request::{RequestBody, RequestHead};
use crate::response::HandleResult;

/// Calls `handler` once for the request and returns its result.
///
/// The call is synchronous from the connection's point of view: nothing else
/// happens on that connection until it returns. It runs on tokio's blocking
/// pool so other connections keep moving. No timeout is imposed.
///
/// A panicking handler becomes `500 Internal Server Error`; the request still
/// gets exactly one result.
pub async fn dispatch(head: RequestHead, body: RequestBody, handler: &SharedHandler) -> HandleResult {
    let handler = Arc::clone(handler);
    let method = head.method().clone();
    let path = head.path().to_owned();

    match tokio::task::spawn_blocking(move || handler.handle(&head, &body)).await {
        Ok(result) => result,
        Err(e) => {
            error!(%method, %path, "request handler failed: {e}");
            HandleResult::new(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
