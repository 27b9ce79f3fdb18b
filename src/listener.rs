//! Unix socket listener and graceful shutdown.
//!
//! [`Listener::bind`] prepares the socket directory, binds the socket and
//! spawns the accept loop. It hands back two things:
//!
//! - a [`ListenerHandle`] for requesting shutdown, and
//! - a [`Completion`] future that resolves once the listener has stopped.
//!
//! On shutdown the listener:
//! 1. Stops accepting immediately.
//! 2. Closes connections that are idle between requests.
//! 3. Lets connections that are mid-request write their response first.
//! 4. Removes the socket file, then resolves the [`Completion`].

use std::fs;
use std::future::Future;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};
use tokio::net::UnixListener;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ControlSocketConfig;
use crate::connection::{ConnectionSettings, serve_connection};
use crate::error::{ListenerError, StartupError, StartupStage};
use crate::handler::{RequestHandler, SharedHandler};
use crate::socket_dir;

const LISTENER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::listener");

const SOCKET_MODE: u32 = 0o600;
const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// Binds control sockets.
#[derive(Debug)]
pub struct Listener;

impl Listener {
    /// Prepares the socket directory, binds the socket and starts accepting.
    ///
    /// Either the listener is fully accepting when this returns, or it failed
    /// and left no socket file behind.
    ///
    /// # Errors
    ///
    /// A [`StartupError`] when the directory cannot be prepared, another
    /// instance is live on the socket, or the socket cannot be bound.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use ctlsock::{ControlSocketConfig, HandleResult, Listener, RequestBody, RequestHead};
    ///
    /// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = ControlSocketConfig::new("/tmp/myapp");
    /// let (handle, completion) = Listener::bind(config, |_: &RequestHead, _: &RequestBody| {
    ///     HandleResult::ok("ok\n")
    /// })?;
    /// handle.shutdown();
    /// completion.await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn bind(
        config: ControlSocketConfig,
        handler: impl RequestHandler,
    ) -> Result<(ListenerHandle, Completion), StartupError> {
        let socket_path = socket_dir::prepare(&config)?;
        let listener = bind_socket(&config, &socket_path).map_err(|e| {
            StartupError::new(
                StartupStage::Bind,
                &config.app_name,
                format!("Failed to listen on socket {} on startup.", socket_path.display()),
                e,
            )
        })?;

        info!(
            target: LISTENER_TARGET,
            path = %socket_path.display(),
            backlog = config.backlog,
            low_latency = config.low_latency,
            "control socket listening"
        );

        let shutdown = CancellationToken::new();
        let accept_loop = AcceptLoop {
            listener,
            handler: Arc::new(handler),
            settings: ConnectionSettings::from(&config),
            shutdown: shutdown.clone(),
            socket_path: socket_path.clone(),
        };
        let task = tokio::spawn(accept_loop.run());

        Ok((
            ListenerHandle { shutdown, socket_path },
            Completion { task },
        ))
    }
}

/// Binds and listens on `path`.
///
/// The socket file is only removed on failure once this call created it; a
/// path someone else already holds is left alone.
fn bind_socket(config: &ControlSocketConfig, path: &Path) -> io::Result<UnixListener> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_reuse_address(config.reuse_address)?;
    socket.bind(&SockAddr::unix(path)?)?;

    listen_on(config, path, socket).inspect_err(|_| remove_socket_file(path))
}

fn listen_on(config: &ControlSocketConfig, path: &Path, socket: Socket) -> io::Result<UnixListener> {
    fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE))?;

    let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    UnixListener::from_std(std::os::unix::net::UnixListener::from(OwnedFd::from(socket)))
}

fn remove_socket_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            target: LISTENER_TARGET,
            path = %path.display(),
            "failed to remove socket file: {e}"
        ),
    }
}

// ── Handle and completion ─────────────────────────────────────────────────────

/// Requests shutdown of a running listener.
///
/// Clones share the same listener. Dropping every handle does not stop it.
#[derive(Clone, Debug)]
pub struct ListenerHandle {
    shutdown: CancellationToken,
    socket_path: PathBuf,
}

impl ListenerHandle {
    /// Starts a graceful shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Where the listener is bound.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// Resolves once the listener has stopped and every connection has drained.
///
/// `Ok(())` after a requested shutdown; an error when the accept loop died
/// on its own.
#[derive(Debug)]
#[must_use = "a Completion reports why the listener stopped"]
pub struct Completion {
    task: JoinHandle<Result<(), ListenerError>>,
}

impl Future for Completion {
    type Output = Result<(), ListenerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) => {
                error!(target: LISTENER_TARGET, "accept loop task failed: {e}");
                Err(ListenerError::TaskPanicked)
            }
        })
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

struct AcceptLoop {
    listener: UnixListener,
    handler: SharedHandler,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
    socket_path: PathBuf,
}

impl AcceptLoop {
    async fn run(self) -> Result<(), ListenerError> {
        let Self { listener, handler, settings, shutdown, socket_path } = self;

        let mut tasks = JoinSet::new();
        let mut next_id: u64 = 0;
        let mut last_error = None::<io::ErrorKind>;

        let outcome = loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    info!(
                        target: LISTENER_TARGET,
                        in_flight = tasks.len(),
                        "shutdown requested, draining connections"
                    );
                    break Ok(());
                }

                res = listener.accept() => {
                    let stream = match res {
                        Ok((stream, _)) => stream,
                        Err(e) if is_fatal_accept_error(&e) => {
                            error!(target: LISTENER_TARGET, "accept failed: {e}");
                            break Err(ListenerError::Accept { path: socket_path.clone(), source: e });
                        }
                        Err(e) => {
                            if last_error != Some(e.kind()) {
                                warn!(target: LISTENER_TARGET, error = %e, "socket accept error");
                            }
                            last_error = Some(e.kind());
                            tokio::time::sleep(ERROR_BACKOFF).await;
                            continue;
                        }
                    };
                    last_error = None;

                    next_id += 1;
                    debug!(target: LISTENER_TARGET, id = next_id, "accepted connection");
                    tasks.spawn(
                        serve_connection(stream, Arc::clone(&handler), settings, shutdown.clone())
                            .instrument(info_span!("connection", id = next_id)),
                    );
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_connection_exit(joined),
            }
        };

        // Connection tasks watch the same token.
        shutdown.cancel();
        drop(listener);
        while let Some(joined) = tasks.join_next().await {
            log_connection_exit(joined);
        }

        remove_socket_file(&socket_path);
        info!(target: LISTENER_TARGET, path = %socket_path.display(), "control socket stopped");
        outcome
    }
}

fn log_connection_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(target: LISTENER_TARGET, "connection task failed: {e}");
    }
}

/// Accept errors that mean the listening socket itself is unusable.
///
/// Everything else (aborted handshakes, interrupts, descriptor exhaustion)
/// clears up on its own and only earns a backoff.
fn is_fatal_accept_error(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected)
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGINT (Ctrl-C) or SIGTERM the process receives.
///
/// A signal whose handler cannot be installed is logged and never fires.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(target: LISTENER_TARGET, "failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(target: LISTENER_TARGET, "failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}
