//! The service-manager notification socket (`sd_notify` protocol).

use std::env;
use std::ffi::OsString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixDatagram;

/// The environment variable the service manager hands the notification
/// socket address in.
pub(crate) const NOTIFY_SOCKET: &str = "NOTIFY_SOCKET";

/// A connected notification socket to the service manager.
pub(crate) struct NotifySocket {
    socket: UnixDatagram,
}

impl NotifySocket {
    /// Connects to the socket named by `NOTIFY_SOCKET`, or reports `None`
    /// when the manager did not provide one.
    pub(crate) fn from_env() -> io::Result<Option<Self>> {
        match env::var_os(NOTIFY_SOCKET) {
            Some(address) => Self::connect(&address).map(Some),
            None => Ok(None),
        }
    }

    fn connect(address: &OsString) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        let bytes = address.as_bytes();
        // A leading '@' designates the abstract socket namespace.
        if let Some(name) = bytes.strip_prefix(b"@") {
            use std::os::linux::net::SocketAddrExt;
            let address = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
            socket.connect_addr(&address)?;
        } else {
            socket.connect(address)?;
        }
        Ok(Self { socket })
    }

    /// Sends one state datagram, e.g. `READY=1`.
    pub(crate) fn send(&self, state: &str) -> io::Result<()> {
        self.socket.send(state.as_bytes()).map(|_| ())
    }
}

/// Renders the final state line reported when the service has stopped.
pub(crate) fn stopped_status(exit_code: i32) -> String {
    if exit_code == 0 {
        "STATUS=Stopped.".to_owned()
    } else {
        format!("STATUS=Stopped with the result: '{exit_code}'.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn sends_state_datagrams_to_a_path_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let manager = UnixDatagram::bind(&path).unwrap();

        let socket = NotifySocket::connect(&path.as_os_str().to_os_string()).unwrap();
        socket.send("READY=1").unwrap();

        let mut buffer = [0_u8; 64];
        let received = manager.recv(&mut buffer).unwrap();
        assert_eq!(&buffer[..received], b"READY=1");
    }

    #[test]
    fn stopped_status_carries_the_exit_code() {
        assert_eq!(stopped_status(0), "STATUS=Stopped.");
        assert_eq!(stopped_status(3), "STATUS=Stopped with the result: '3'.");
    }
}
