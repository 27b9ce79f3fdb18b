//! Fault taxonomy.
//!
//! Two tiers, never mixed:
//!
//! - [`StartupError`]: the listener could not be brought up. Fatal; carries
//!   everything an operator-facing layer needs to present the failure.
//! - [`TransportError`]: one connection misbehaved. Logged, that connection is
//!   closed, nothing else notices.
//!
//! A third type, [`ListenerError`], is what the [`Completion`](crate::Completion)
//! future resolves to when the accept loop itself dies after a successful start.
//!
//! Handler failures are none of these. A handler always returns a
//! [`HandleResult`](crate::HandleResult); mapping its own failures onto a
//! status code is its job.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

// ── StartupError ──────────────────────────────────────────────────────────────

/// Where in the startup sequence a [`StartupError`] happened.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartupStage {
    /// The previous socket directory could not be removed.
    RemoveDirectory,
    /// The fresh socket directory could not be created.
    CreateDirectory,
    /// Probing an existing socket file for a live owner failed.
    ProbeSocket,
    /// Another process is still accepting on the socket path.
    AlreadyRunning,
    /// The socket could not be created, bound or put into listening mode.
    Bind,
}

/// A fatal listener-initialisation fault.
///
/// `summary` is a one-line headline ("BrowserMux failed to start"),
/// `explanation` names the path and step that failed, and
/// [`source`](std::error::Error::source) is the underlying OS error.
#[derive(Debug, Error)]
#[error("{summary}: {explanation}")]
pub struct StartupError {
    stage: StartupStage,
    summary: String,
    explanation: String,
    #[source]
    source: io::Error,
}

impl StartupError {
    pub(crate) fn new(
        stage: StartupStage,
        app_name: &str,
        explanation: impl Into<String>,
        source: io::Error,
    ) -> Self {
        Self {
            stage,
            summary: format!("{app_name} failed to start"),
            explanation: explanation.into(),
            source,
        }
    }

    /// Which startup step failed.
    pub fn stage(&self) -> StartupStage { self.stage }
    /// Short headline, e.g. `BrowserMux failed to start`.
    pub fn summary(&self) -> &str { &self.summary }
    /// One sentence naming the path and what was attempted.
    pub fn explanation(&self) -> &str { &self.explanation }

    /// The underlying system fault.
    pub fn io_error(&self) -> &io::Error { &self.source }
}

// ── TransportError ────────────────────────────────────────────────────────────

/// A per-connection fault. Closes that connection only.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection i/o: {0}")]
    Io(#[from] io::Error),

    #[error("malformed request head: {0}")]
    MalformedHead(String),

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("payload too large: body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("malformed chunked body: {0}")]
    MalformedChunk(String),

    #[error("connection idle for {after:?}")]
    IdleTimeout { after: Duration },

    #[error("peer closed the connection mid-request")]
    UnexpectedEof,
}

impl TransportError {
    /// The rejection status worth sending before closing, if any.
    ///
    /// I/O faults, timeouts and EOF get no response: either the peer is gone
    /// or it has not asked for anything yet.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::MalformedHead(_) | Self::MalformedChunk(_) => Some(StatusCode::BAD_REQUEST),
            Self::HeadTooLarge { .. } => Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
            Self::PayloadTooLarge { .. } => Some(StatusCode::PAYLOAD_TOO_LARGE),
            Self::Io(_) | Self::IdleTimeout { .. } | Self::UnexpectedEof => None,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedHead(reason.into())
    }
}

// ── ListenerError ─────────────────────────────────────────────────────────────

/// Why a running listener stopped on its own.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("accept loop on {path} failed: {source}")]
    Accept {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("accept loop task panicked")]
    TaskPanicked,
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn startup_error_surfaces_all_three_parts() {
        let err = StartupError::new(
            StartupStage::CreateDirectory,
            "BrowserMux",
            "Failed to create directory /tmp/x on startup.",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );

        assert_eq!(err.summary(), "BrowserMux failed to start");
        assert_eq!(err.explanation(), "Failed to create directory /tmp/x on startup.");
        assert_eq!(err.stage(), StartupStage::CreateDirectory);
        assert_eq!(err.io_error().kind(), io::ErrorKind::PermissionDenied);
        assert!(err.source().is_some());
        assert_eq!(
            err.to_string(),
            "BrowserMux failed to start: Failed to create directory /tmp/x on startup."
        );
    }

    #[test]
    fn only_protocol_faults_earn_a_rejection() {
        assert_eq!(
            TransportError::malformed("bad version").status(),
            Some(StatusCode::BAD_REQUEST)
        );
        assert_eq!(
            TransportError::PayloadTooLarge { limit: 4 }.status(),
            Some(StatusCode::PAYLOAD_TOO_LARGE)
        );
        assert_eq!(
            TransportError::HeadTooLarge { limit: 4 }.status(),
            Some(StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE)
        );
        assert!(TransportError::UnexpectedEof.status().is_none());
        assert!(
            TransportError::IdleTimeout { after: Duration::from_secs(1) }
                .status()
                .is_none()
        );
        assert!(TransportError::from(io::Error::from(io::ErrorKind::BrokenPipe))
            .status()
            .is_none());
    }

    #[test]
    fn payload_too_large_is_distinct_in_its_message() {
        let msg = TransportError::PayloadTooLarge { limit: 1024 }.to_string();
        assert!(msg.starts_with("payload too large"), "{msg}");
    }
}
