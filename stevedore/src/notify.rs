//! Supervisor notifications.
//!
//! On platforms with a supervisor notification channel (the datagram socket
//! named by `NOTIFY_SOCKET`), endpoints report `STATUS=`, `READY=1` and
//! `STOPPING=1` over their lifetime. Everywhere else these are no-ops. A
//! parent process identified by pid can additionally be poked with a user
//! signal once serving begins.

use tracing::debug;

/// Report the listening status line.
pub fn send_status(status: &str) {
    sd_notify(&format!("STATUS={status}"));
}

/// Report readiness.
pub fn send_ready() {
    sd_notify("READY=1");
}

/// Report the beginning of shutdown.
pub fn send_stopping() {
    sd_notify("STOPPING=1");
}

#[cfg(unix)]
fn sd_notify(state: &str) {
    let Ok(path) = std::env::var("NOTIFY_SOCKET") else {
        return;
    };
    // Abstract-namespace sockets are not supported here.
    if path.starts_with('@') {
        debug!("abstract NOTIFY_SOCKET is not supported");
        return;
    }
    match std::os::unix::net::UnixDatagram::unbound() {
        Ok(socket) => {
            if let Err(error) = socket.send_to(state.as_bytes(), &path) {
                debug!(%error, "supervisor notification failed");
            }
        }
        Err(error) => debug!(%error, "could not open notification socket"),
    }
}

#[cfg(not(unix))]
fn sd_notify(_state: &str) {}

/// Signal a parent process that serving has begun.
#[cfg(unix)]
pub fn send_start_signal(pid: i32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(error) = kill(Pid::from_raw(pid), Signal::SIGUSR1) {
        debug!(%error, pid, "start signal failed");
    }
}

#[cfg(not(unix))]
pub fn send_start_signal(_pid: i32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn notifications_reach_the_supervisor_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let receiver = std::os::unix::net::UnixDatagram::bind(&path).unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(1)))
            .unwrap();
        std::env::set_var("NOTIFY_SOCKET", &path);

        // Another endpoint in this process may notify concurrently; scan
        // until the expected message arrives.
        let expect = |receiver: &std::os::unix::net::UnixDatagram, wanted: &[u8]| {
            let mut buf = [0u8; 256];
            for _ in 0..16 {
                let n = receiver.recv(&mut buf).unwrap();
                if &buf[..n] == wanted {
                    return;
                }
            }
            panic!("notification not observed");
        };

        send_ready();
        expect(&receiver, b"READY=1");
        send_stopping();
        expect(&receiver, b"STOPPING=1");

        std::env::remove_var("NOTIFY_SOCKET");
    }
}
