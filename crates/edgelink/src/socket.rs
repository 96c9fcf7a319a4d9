use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use edgelink_object::{Error, Result};
use tracing::{debug, warn};

pub(crate) fn connect(path: &Path) -> Result<UnixStream> {
    UnixStream::connect(path).map_err(|err| {
        warn!(?path, %err, "couldn't connect to ipc socket");
        Error::NoConn
    })
}

/// Reads exactly `buf.len()` bytes, retrying transparently on interruption.
/// A peer hangup partway through is `NoConn`.
pub(crate) fn read_exact(mut stream: &UnixStream, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(Error::NoConn),
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => {
                debug!(%err, "socket read failed");
                return Err(Error::Failure);
            }
        }
    }
    Ok(())
}

/// Writes all of `buf`, retrying transparently on interruption.
pub(crate) fn write_all(mut stream: &UnixStream, buf: &[u8]) -> Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        match stream.write(&buf[sent..]) {
            Ok(0) => return Err(Error::NoConn),
            Ok(n) => sent += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => {
                debug!(%err, "socket write failed");
                return Err(Error::Failure);
            }
        }
    }
    Ok(())
}

/// Pid of the socket's peer process.
#[cfg(target_os = "linux")]
pub(crate) fn peer_pid(stream: &UnixStream) -> Result<i32> {
    use std::os::unix::io::AsRawFd;

    let mut ucred = libc::ucred { pid: 0, uid: 0, gid: 0 };
    let mut len = size_of::<libc::ucred>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&raw mut ucred).cast(),
            &raw mut len,
        )
    };
    if rc != 0 || len as usize != size_of::<libc::ucred>() {
        warn!(fd = stream.as_raw_fd(), "couldn't read peer credentials");
        return Err(Error::Failure);
    }

    Ok(ucred.pid)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn peer_pid(_stream: &UnixStream) -> Result<i32> {
    Err(Error::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_read_write_round_trip() {
        let (a, b) = UnixStream::pair().unwrap();

        write_all(&a, b"twelve bytes").unwrap();
        let mut buf = [0u8; 12];
        read_exact(&b, &mut buf).unwrap();
        assert_eq!(&buf, b"twelve bytes");
    }

    #[test]
    fn eof_is_noconn() {
        let (a, b) = UnixStream::pair().unwrap();
        write_all(&a, b"part").unwrap();
        drop(a);

        let mut buf = [0u8; 16];
        assert_eq!(read_exact(&b, &mut buf).unwrap_err(), Error::NoConn);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn peer_pid_is_this_process() {
        let (a, _b) = UnixStream::pair().unwrap();
        assert_eq!(peer_pid(&a).unwrap(), std::process::id() as i32);
    }
}
