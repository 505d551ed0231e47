//! Graceful restart (unix): on SIGUSR2 the process spawns its
//! successor with the listener fd, waits for it to report readiness
//! over a pipe, then drains and exits. The successor adopts the
//! listener via `KITE_LISTEN_FD` and reports back via
//! `KITE_READY_FD`.

use std::sync::Arc;

use crate::runtime::KiteCore;

const LISTEN_FD_ENV: &str = "KITE_LISTEN_FD";
const READY_FD_ENV: &str = "KITE_READY_FD";

/// The listener a predecessor handed over, if any.
pub(crate) fn inherited_listener() -> std::io::Result<Option<std::net::TcpListener>> {
    #[cfg(unix)]
    {
        use std::os::unix::io::FromRawFd;

        if let Ok(raw) = std::env::var(LISTEN_FD_ENV) {
            std::env::remove_var(LISTEN_FD_ENV);
            let fd: i32 = raw
                .parse()
                .map_err(|_| std::io::Error::other(format!("bad {LISTEN_FD_ENV}: {raw}")))?;
            // The fd number came from the parent and is ours alone.
            let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
            return Ok(Some(listener));
        }
    }
    Ok(None)
}

/// Report readiness to a waiting predecessor, if there is one.
pub(crate) fn notify_ready() {
    #[cfg(unix)]
    {
        if let Ok(raw) = std::env::var(READY_FD_ENV) {
            std::env::remove_var(READY_FD_ENV);
            if let Ok(fd) = raw.parse::<i32>() {
                unsafe {
                    let byte = 1u8;
                    libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
                    libc::close(fd);
                }
            }
        }
    }
}

/// Watch for SIGUSR2 and hand the listener over to a successor.
#[cfg(unix)]
pub(crate) fn spawn_restart_handler(
    core: Arc<KiteCore>,
    listener: &std::net::TcpListener,
) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let listener_fd = unsafe { libc::dup(listener.as_raw_fd()) };
    if listener_fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    tokio::spawn(async move {
        let mut sigusr2 =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined2()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot install SIGUSR2 handler");
                    return;
                }
            };
        tokio::select! {
            _ = sigusr2.recv() => {}
            _ = core.shutdown.cancelled() => return,
        }
        tracing::info!("SIGUSR2: starting successor");
        match hand_over(listener_fd).await {
            Ok(()) => {
                tracing::info!("successor ready, draining");
                core.shutdown.cancel();
            }
            Err(e) => {
                tracing::error!(error = %e, "graceful restart failed, continuing to serve");
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn spawn_restart_handler(
    _core: Arc<KiteCore>,
    _listener: &std::net::TcpListener,
) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn hand_over(listener_fd: i32) -> std::io::Result<()> {
    use std::time::Duration;

    // Readiness pipe: the successor writes one byte once it serves.
    let mut pipe_fds = [0i32; 2];
    if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let (read_fd, write_fd) = (pipe_fds[0], pipe_fds[1]);

    // Both inherited fds must survive exec.
    for fd in [listener_fd, write_fd] {
        if unsafe { libc::fcntl(fd, libc::F_SETFD, 0) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            return Err(err);
        }
    }

    let exe = std::env::current_exe()?;
    let spawned = std::process::Command::new(exe)
        .args(std::env::args().skip(1))
        .env(LISTEN_FD_ENV, listener_fd.to_string())
        .env(READY_FD_ENV, write_fd.to_string())
        .spawn();
    unsafe { libc::close(write_fd) };
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            unsafe { libc::close(read_fd) };
            return Err(e);
        }
    };

    // Wait (bounded) for the readiness byte; EOF means the child died.
    let ready = tokio::task::spawn_blocking(move || {
        let mut byte = 0u8;
        let n = unsafe { libc::read(read_fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        unsafe { libc::close(read_fd) };
        n == 1
    });
    match tokio::time::timeout(Duration::from_secs(30), ready).await {
        Ok(Ok(true)) => Ok(()),
        Ok(_) => {
            let _ = child.kill();
            Err(std::io::Error::other("successor exited before readiness"))
        }
        Err(_) => {
            let _ = child.kill();
            Err(std::io::Error::other("successor readiness timed out"))
        }
    }
}
