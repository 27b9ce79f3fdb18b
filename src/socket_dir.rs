//! Socket directory preparation.
//!
//! The socket directory is owned outright by the control socket: it is wiped
//! and recreated on every start so that nothing from a previous run survives.
//! Under [`StalePolicy::Probe`] the wipe is preceded by a connect attempt on
//! the old socket, so a second instance refuses to start instead of
//! silently unlinking a live peer's socket.

use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt};
use std::path::{Path, PathBuf};

use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{debug, info};

use crate::config::{ControlSocketConfig, StalePolicy};
use crate::error::{StartupError, StartupStage};

const DIRECTORY_MODE: u32 = 0o700;

/// Recreates the socket directory empty and returns the socket path inside it.
///
/// # Errors
///
/// A [`StartupError`] when a live listener already owns the socket, or when
/// the directory cannot be removed or created.
pub fn prepare(config: &ControlSocketConfig) -> Result<PathBuf, StartupError> {
    let directory = config.directory();
    let socket_path = config.socket_path();

    if config.stale_policy == StalePolicy::Probe {
        ensure_not_live(config, &socket_path)?;
    }

    match fs::remove_dir_all(directory) {
        Ok(()) => debug!(path = %directory.display(), "removed previous socket directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(StartupError::new(
                StartupStage::RemoveDirectory,
                &config.app_name,
                format!("Failed to delete directory {} on startup.", directory.display()),
                e,
            ));
        }
    }

    create_private_dir(directory).map_err(|e| {
        StartupError::new(
            StartupStage::CreateDirectory,
            &config.app_name,
            format!("Failed to create directory {} on startup.", directory.display()),
            e,
        )
    })?;

    info!(path = %directory.display(), "socket directory ready");
    Ok(socket_path)
}

/// Non-recursive: a missing parent is an error, not something to paper over.
fn create_private_dir(path: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(false).mode(DIRECTORY_MODE).create(path)
}

fn ensure_not_live(config: &ControlSocketConfig, socket_path: &Path) -> Result<(), StartupError> {
    let is_socket = fs::symlink_metadata(socket_path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false);
    if !is_socket {
        return Ok(());
    }

    match connect_nonblocking(socket_path) {
        // A peer whose accept backlog is full answers `WouldBlock`; it is
        // still alive.
        Ok(()) => Err(already_running(config, socket_path)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            debug!(path = %socket_path.display(), "live socket has a full backlog");
            Err(already_running(config, socket_path))
        }
        Err(e) if is_stale(&e) => {
            debug!(path = %socket_path.display(), "found stale socket");
            Ok(())
        }
        Err(e) => Err(StartupError::new(
            StartupStage::ProbeSocket,
            &config.app_name,
            format!("Failed to probe existing socket {} on startup.", socket_path.display()),
            e,
        )),
    }
}

/// Never waits on the peer.
fn connect_nonblocking(socket_path: &Path) -> io::Result<()> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.connect(&SockAddr::unix(socket_path)?)
}

fn already_running(config: &ControlSocketConfig, socket_path: &Path) -> StartupError {
    StartupError::new(
        StartupStage::AlreadyRunning,
        &config.app_name,
        format!(
            "Another instance is already listening on {}.",
            socket_path.display()
        ),
        io::Error::from(io::ErrorKind::AddrInUse),
    )
}

/// Nobody is accepting on the path.
fn is_stale(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
    )
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixListener;

    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    fn config_in(root: &TempDir) -> ControlSocketConfig {
        ControlSocketConfig::new(root.path().join(".ctl")).with_app_name("test")
    }

    #[test]
    fn creates_missing_directory_with_private_mode() {
        let root = TempDir::new().expect("temp dir");
        let config = config_in(&root);

        let socket_path = prepare(&config).expect("prepare");

        assert_eq!(socket_path, root.path().join(".ctl").join("ctl.sock"));
        let meta = fs::metadata(config.directory()).expect("directory exists");
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, DIRECTORY_MODE);
    }

    #[test]
    fn wipes_leftover_contents() {
        let root = TempDir::new().expect("temp dir");
        let config = config_in(&root);
        fs::create_dir(config.directory()).expect("mkdir");
        fs::write(config.directory().join("leftover"), b"x").expect("write");

        prepare(&config).expect("prepare");

        let entries = fs::read_dir(config.directory()).expect("read dir").count();
        assert_eq!(entries, 0);
    }

    #[test]
    fn discards_stale_socket_from_crashed_run() {
        let root = TempDir::new().expect("temp dir");
        let config = config_in(&root);
        fs::create_dir(config.directory()).expect("mkdir");
        drop(UnixListener::bind(config.socket_path()).expect("bind stale"));
        assert!(config.socket_path().exists());

        prepare(&config).expect("prepare over stale socket");

        assert!(!config.socket_path().exists());
    }

    #[test]
    fn refuses_to_wipe_a_live_socket() {
        let root = TempDir::new().expect("temp dir");
        let config = config_in(&root);
        fs::create_dir(config.directory()).expect("mkdir");
        let _live = UnixListener::bind(config.socket_path()).expect("bind live");

        let err = prepare(&config).expect_err("live socket must block startup");

        assert_eq!(err.stage(), StartupStage::AlreadyRunning);
        assert_eq!(err.summary(), "test failed to start");
        assert!(config.socket_path().exists(), "live socket must survive");
    }

    #[test]
    fn live_socket_with_a_full_backlog_is_refused_without_waiting() {
        let root = TempDir::new().expect("temp dir");
        let config = config_in(&root);
        fs::create_dir(config.directory()).expect("mkdir");

        let peer = Socket::new(Domain::UNIX, Type::STREAM, None).expect("peer socket");
        let addr = SockAddr::unix(config.socket_path()).expect("peer addr");
        peer.bind(&addr).expect("peer bind");
        peer.listen(0).expect("peer listen");

        // Nobody accepts, so pending connections pile up until the backlog is full.
        let mut pending = Vec::new();
        for _ in 0..64 {
            let client = Socket::new(Domain::UNIX, Type::STREAM, None).expect("client socket");
            client.set_nonblocking(true).expect("nonblocking");
            match client.connect(&addr) {
                Ok(()) => pending.push(client),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("unexpected connect error: {e}"),
            }
        }

        let (tx, rx) = std::sync::mpsc::channel();
        let prepared = config.clone();
        std::thread::spawn(move || {
            let _ = tx.send(prepare(&prepared));
        });
        let outcome = rx
            .recv_timeout(std::time::Duration::from_secs(3))
            .expect("prepare must not wait on a busy peer");

        let err = outcome.expect_err("busy peer is still live");
        assert_eq!(err.stage(), StartupStage::AlreadyRunning);
        assert!(config.socket_path().exists());
        drop(pending);
        drop(peer);
    }

    #[test]
    fn always_wipe_ignores_a_live_socket() {
        let root = TempDir::new().expect("temp dir");
        let config = config_in(&root).with_stale_policy(StalePolicy::AlwaysWipe);
        fs::create_dir(config.directory()).expect("mkdir");
        let _live = UnixListener::bind(config.socket_path()).expect("bind live");

        prepare(&config).expect("legacy wipe");

        assert!(!config.socket_path().exists());
    }

    #[test]
    fn missing_parent_is_not_created() {
        let root = TempDir::new().expect("temp dir");
        let config = ControlSocketConfig::new(root.path().join("absent").join(".ctl"));

        let err = prepare(&config).expect_err("non-recursive create");

        assert_eq!(err.stage(), StartupStage::CreateDirectory);
        assert_eq!(err.io_error().kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn path_occupied_by_a_file_fails() {
        let root = TempDir::new().expect("temp dir");
        let config = config_in(&root);
        fs::write(config.directory(), b"not a directory").expect("write");

        assert!(prepare(&config).is_err());
    }

    #[rstest]
    #[case::refused(io::ErrorKind::ConnectionRefused, true)]
    #[case::not_found(io::ErrorKind::NotFound, true)]
    #[case::denied(io::ErrorKind::PermissionDenied, false)]
    #[case::timed_out(io::ErrorKind::TimedOut, false)]
    fn classifies_probe_errors(#[case] kind: io::ErrorKind, #[case] stale: bool) {
        assert_eq!(is_stale(&io::Error::from(kind)), stale);
    }
}
