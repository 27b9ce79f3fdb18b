//! Listener configuration.
//!
//! Every location and limit is explicit. Nothing here reads the environment
//! behind the caller's back; [`ControlSocketConfig::in_home`] is the one
//! convenience that looks up the home directory, and only when asked.

use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SOCKET_NAME: &str = "ctl.sock";
const DEFAULT_APP_NAME: &str = "control socket";
const DEFAULT_BACKLOG: u32 = 256;
const DEFAULT_MAX_HEAD_BYTES: usize = 64 * 1024;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// What happens to a connection after a response has been flushed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ClosePolicy {
    /// Keep serving sequential requests on the connection (HTTP/1.1 default).
    #[default]
    Persistent,
    /// Close after exactly one response. Debug aid only.
    SingleShot,
}

/// How an existing socket directory is treated at startup.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StalePolicy {
    /// Connect to any existing socket first; refuse to start if it answers.
    #[default]
    Probe,
    /// Wipe the directory unconditionally.
    AlwaysWipe,
}

/// Configuration for a control socket [`Listener`](crate::Listener).
#[derive(Clone, Debug)]
pub struct ControlSocketConfig {
    pub(crate) directory: PathBuf,
    pub(crate) socket_name: String,
    pub(crate) app_name: String,
    pub(crate) backlog: u32,
    pub(crate) reuse_address: bool,
    pub(crate) low_latency: bool,
    pub(crate) max_head_bytes: usize,
    pub(crate) max_body_bytes: usize,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) close_policy: ClosePolicy,
    pub(crate) stale_policy: StalePolicy,
}

impl ControlSocketConfig {
    /// A config whose socket lives at `<directory>/ctl.sock`.
    ///
    /// `directory` is deleted and recreated at startup. Point it at something
    /// the control socket owns exclusively.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            socket_name: DEFAULT_SOCKET_NAME.to_owned(),
            app_name: DEFAULT_APP_NAME.to_owned(),
            backlog: DEFAULT_BACKLOG,
            reuse_address: true,
            low_latency: true,
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            close_policy: ClosePolicy::Persistent,
            stale_policy: StalePolicy::Probe,
        }
    }

    /// `<home>/<dir_name>`, or `None` when the platform reports no home.
    pub fn in_home(dir_name: impl AsRef<Path>) -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(dir_name)))
    }

    /// The BrowserMux layout: `<home>/.browsermux/ctl.sock`.
    pub fn browsermux() -> Option<Self> {
        Self::in_home(".browsermux").map(|config| config.with_app_name("BrowserMux"))
    }

    /// Socket file name inside the directory. Defaults to `ctl.sock`.
    #[must_use]
    pub fn with_socket_name(mut self, name: impl Into<String>) -> Self {
        self.socket_name = name.into();
        self
    }

    /// Name used in [`StartupError`](crate::StartupError) summaries.
    #[must_use]
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Accept backlog handed to `listen(2)`.
    #[must_use]
    pub const fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Sets `SO_REUSEADDR` on the listening socket.
    #[must_use]
    pub const fn with_reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    /// Per-connection low-latency flag. Unix stream sockets never coalesce
    /// small writes, so this has no effect on this transport.
    #[must_use]
    pub const fn with_low_latency(mut self, enabled: bool) -> Self {
        self.low_latency = enabled;
        self
    }

    /// Largest request line plus headers accepted.
    #[must_use]
    pub const fn with_max_head_bytes(mut self, limit: usize) -> Self {
        self.max_head_bytes = limit;
        self
    }

    /// Largest request body accepted. Larger bodies fail the connection with
    /// [`TransportError::PayloadTooLarge`](crate::TransportError::PayloadTooLarge).
    #[must_use]
    pub const fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Close a connection that sends nothing for `timeout`. `None` waits forever.
    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// What happens to a connection after each response.
    #[must_use]
    pub const fn with_close_policy(mut self, policy: ClosePolicy) -> Self {
        self.close_policy = policy;
        self
    }

    /// How a leftover socket file is treated at startup.
    #[must_use]
    pub const fn with_stale_policy(mut self, policy: StalePolicy) -> Self {
        self.stale_policy = policy;
        self
    }

    /// The socket directory, recreated at every start.
    pub fn directory(&self) -> &Path { &self.directory }
    /// Socket file name inside [`directory`](Self::directory).
    pub fn socket_name(&self) -> &str { &self.socket_name }
    /// Close policy applied to every connection.
    pub fn close_policy(&self) -> ClosePolicy { self.close_policy }
    /// Per-connection idle timeout; `None` waits forever.
    pub fn idle_timeout(&self) -> Option<Duration> { self.idle_timeout }
    /// Request body cap in bytes.
    pub fn max_body_bytes(&self) -> usize { self.max_body_bytes }

    /// Full path of the socket file.
    pub fn socket_path(&self) -> PathBuf {
        self.directory.join(&self.socket_name)
    }
}
