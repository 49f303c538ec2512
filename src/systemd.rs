use std::collections::HashMap;
use std::env;
use std::os::fd::RawFd;
use std::os::unix::net::UnixDatagram;
use std::path::Path;

use thiserror::Error;

const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";
const READY_MESSAGE: &str = "READY=1";
const STOPPING_MESSAGE: &str = "STOPPING=1";
/// First file descriptor passed by socket activation.
const SD_LISTEN_FDS_START: RawFd = 3;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to create an unbound UNIX domain socket: {0}")]
    FailedCreate(std::io::Error),
    #[error("Failed to connect to the systemd notify socket: {0}")]
    FailedConnect(std::io::Error),
    #[error("Failed to send a notification to the systemd notify socket: {0}")]
    FailedSend(std::io::Error),
    #[error("Abstract notify socket `{0}` is not supported")]
    AbstractSocket(String),
}

/// Notify systemd about things.
///
/// Returns `Ok(false)` when the process was not started with a notify
/// socket, which is the normal case outside of a `Type=notify` unit.
pub fn sd_notify(state: &str) -> Result<bool, NotifyError> {
    let Some(path) = env::var_os(NOTIFY_SOCKET_ENV) else {
        return Ok(false);
    };
    sd_notify_to(Path::new(&path), state)?;
    Ok(true)
}

fn sd_notify_to(path: &Path, state: &str) -> Result<(), NotifyError> {
    let path_str = path.to_string_lossy();
    if path_str.starts_with('@') {
        return Err(NotifyError::AbstractSocket(path_str.into_owned()));
    }

    let sock = UnixDatagram::unbound().map_err(NotifyError::FailedCreate)?;
    sock.connect(path).map_err(NotifyError::FailedConnect)?;
    sock.send(state.as_bytes()).map_err(NotifyError::FailedSend)?;
    Ok(())
}

#[inline]
pub fn sd_notify_ready() -> Result<bool, NotifyError> {
    sd_notify(READY_MESSAGE)
}

#[inline]
pub fn sd_notify_stopping() -> Result<bool, NotifyError> {
    sd_notify(STOPPING_MESSAGE)
}

/// Sockets passed by systemd socket activation, keyed by their
/// `FileDescriptorName=`.
pub fn listen_fds_named() -> HashMap<String, RawFd> {
    parse_listen_fds(
        std::process::id(),
        env::var("LISTEN_PID").ok().as_deref(),
        env::var("LISTEN_FDS").ok().as_deref(),
        env::var("LISTEN_FDNAMES").ok().as_deref(),
    )
}

fn parse_listen_fds(
    pid: u32,
    listen_pid: Option<&str>,
    listen_fds: Option<&str>,
    listen_fdnames: Option<&str>,
) -> HashMap<String, RawFd> {
    let pid_ok = listen_pid
        .map(|v| v == pid.to_string())
        .unwrap_or(false);
    if !pid_ok {
        return HashMap::new();
    }

    let n_fds = listen_fds
        .and_then(|v| v.parse::<RawFd>().ok())
        .unwrap_or(0);

    // FDNAMES are colon-separated
    let names: Vec<&str> = listen_fdnames.unwrap_or_default().split(':').collect();

    let mut map = HashMap::new();
    for i in 0..n_fds.max(0) {
        let fd = SD_LISTEN_FDS_START + i;
        let name = names
            .get(i as usize)
            .filter(|name| !name.is_empty())
            .map(|name| name.to_string())
            .unwrap_or_else(|| format!("fd{fd}"));
        map.insert(name, fd);
    }
    map
}
