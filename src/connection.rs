//! One accepted connection, from first byte to close.
//!
//! Each connection runs in its own task with its own [`HttpFramer`]. Requests
//! on a connection are handled strictly one after another, and a response is
//! flushed before the next request is even looked at.
//!
//! Shutdown is cooperative: an idle connection closes as soon as shutdown is
//! requested; one that is mid-request finishes that request and its response
//! first.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use http::{Method, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ClosePolicy, ControlSocketConfig};
use crate::dispatch::dispatch;
use crate::error::TransportError;
use crate::framer::{Frame, HttpFramer};
use crate::handler::SharedHandler;
use crate::request::RequestHead;
use crate::response::{Outgoing, Reply, ResponseWriter};

const CONNECTION_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::connection");

/// The slice of [`ControlSocketConfig`] a connection task needs.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ConnectionSettings {
    pub max_head_bytes: usize,
    pub max_body_bytes: usize,
    pub idle_timeout: Option<Duration>,
    pub close_policy: ClosePolicy,
}

impl From<&ControlSocketConfig> for ConnectionSettings {
    fn from(config: &ControlSocketConfig) -> Self {
        Self {
            max_head_bytes: config.max_head_bytes,
            max_body_bytes: config.max_body_bytes,
            idle_timeout: config.idle_timeout,
            close_policy: config.close_policy,
        }
    }
}

/// Serves requests on `stream` until the peer leaves, the close policy says
/// stop, a transport fault occurs, or shutdown is requested.
///
/// Transport faults are logged here and never propagate.
pub(crate) async fn serve_connection(
    stream: UnixStream,
    handler: SharedHandler,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut requests = FramedRead::new(
        read_half,
        HttpFramer::new(settings.max_head_bytes, settings.max_body_bytes),
    );
    let mut responses = FramedWrite::new(write_half, ResponseWriter);

    match serve_requests(&mut requests, &mut responses, &handler, settings, &shutdown).await {
        Ok(served) => debug!(target: CONNECTION_TARGET, served, "connection closed"),
        Err(e @ TransportError::IdleTimeout { .. }) => {
            debug!(target: CONNECTION_TARGET, "closing connection: {e}");
        }
        Err(e) => {
            warn!(target: CONNECTION_TARGET, "closing connection: {e}");
            if let Some(status) = e.status()
                && let Err(write_err) = responses.send(Outgoing::Response(Reply::rejection(status))).await
            {
                debug!(target: CONNECTION_TARGET, "rejection not delivered: {write_err}");
            }
        }
    }
}

async fn serve_requests<R, W>(
    requests: &mut FramedRead<R, HttpFramer>,
    responses: &mut FramedWrite<W, ResponseWriter>,
    handler: &SharedHandler,
    settings: ConnectionSettings,
    shutdown: &CancellationToken,
) -> Result<usize, TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut served = 0;
    let mut draining = false;

    loop {
        let next = tokio::select! {
            biased;

            () = shutdown.cancelled(), if !draining => {
                if requests.decoder().is_idle() && requests.read_buffer().is_empty() {
                    debug!(target: CONNECTION_TARGET, "closing idle connection for shutdown");
                    return Ok(served);
                }
                draining = true;
                continue;
            }

            next = next_frame(requests, settings.idle_timeout) => next?,
        };

        let (head, body) = match next {
            None => return Ok(served),
            Some(Frame::ContinueExpected) => {
                responses.send(Outgoing::Continue).await?;
                continue;
            }
            Some(Frame::Request(head, body)) => (head, body),
        };

        debug!(
            target: CONNECTION_TARGET,
            method = %head.method(),
            path = head.path(),
            body_bytes = body.len(),
            "request"
        );

        let version = head.version();
        let omit_body = head.method() == Method::HEAD;
        let keep_alive = keep_alive(&head, settings.close_policy);

        let result = dispatch(head, body, handler).await;
        let close = !keep_alive || shutdown.is_cancelled();

        responses
            .send(Outgoing::Response(Reply { version, result, omit_body, close }))
            .await?;
        served += 1;

        if close {
            return Ok(served);
        }
    }
}

/// Waits for the next frame, bounded by the idle timeout.
async fn next_frame<R: AsyncRead + Unpin>(
    requests: &mut FramedRead<R, HttpFramer>,
    idle_timeout: Option<Duration>,
) -> Result<Option<Frame>, TransportError> {
    let next = match idle_timeout {
        Some(after) => tokio::time::timeout(after, requests.next())
            .await
            .map_err(|_| TransportError::IdleTimeout { after })?,
        None => requests.next().await,
    };
    next.transpose()
}

/// Whether the connection stays open after answering `head`.
fn keep_alive(head: &RequestHead, policy: ClosePolicy) -> bool {
    match policy {
        ClosePolicy::SingleShot => false,
        ClosePolicy::Persistent if head.version() == Version::HTTP_10 => {
            head.connection_has("keep-alive")
        }
        ClosePolicy::Persistent => !head.connection_has("close"),
    }
}
