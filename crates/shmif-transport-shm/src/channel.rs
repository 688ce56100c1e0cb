//! Per-segment control channel: descriptor passing and the doorbell.
//!
//! Each segment owns one Unix stream socketpair. The two directions never
//! mix:
//!
//! - server → client: descriptors for descriptor-carrying target events,
//!   sent as `SCM_RIGHTS` ancillary data before the event is enqueued
//! - client → server: single doorbell bytes rung after every enqueue, so an
//!   async server can await readiness instead of polling the ring
//!
//! ```ignore
//! let (server, client_fd) = channel::pair()?;
//! // client_fd travels to the frameserver in its ConnectionInfo
//! let client = ClientChannel::from_fd(client_fd)?;
//!
//! client.ring();
//! server.readable().await?;
//! ```

use std::io::{self, ErrorKind};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use passfd::FdPassingExt;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

/// Create a connected channel. The client end comes back as a plain
/// descriptor so it can be handed to another process.
pub fn pair() -> io::Result<(ServerChannel, OwnedFd)> {
    let (server, client) = UnixStream::pair()?;
    server.set_nonblocking(true)?;
    Ok((ServerChannel::new(server), OwnedFd::from(client)))
}

// =============================================================================
// Server End
// =============================================================================

/// The server's end: sends descriptors, receives doorbell rings.
pub struct ServerChannel {
    // Declared before `stream` so the registration is dropped while the
    // descriptor is still open.
    async_fd: Option<AsyncFd<RawFd>>,
    stream: UnixStream,
    hangup: bool,
}

impl ServerChannel {
    fn new(stream: UnixStream) -> Self {
        Self {
            async_fd: None,
            stream,
            hangup: false,
        }
    }

    /// Push one descriptor to the client. The descriptor stays open on
    /// this side; the client receives its own duplicate.
    pub fn send_descriptor(&self, fd: RawFd) -> io::Result<()> {
        self.stream.as_raw_fd().send_fd(fd)
    }

    /// Wait until the client rings, then drain every pending ring.
    ///
    /// Never returns once the client end has been closed; callers bound it
    /// with a timeout.
    pub async fn readable(&mut self) -> io::Result<()> {
        if self.hangup {
            std::future::pending::<()>().await;
        }
        if self.async_fd.is_none() {
            self.async_fd = Some(AsyncFd::with_interest(
                self.stream.as_raw_fd(),
                Interest::READABLE,
            )?);
        }
        let Some(async_fd) = self.async_fd.as_ref() else {
            return Ok(());
        };

        loop {
            let mut guard = async_fd.readable().await?;
            match try_drain(self.stream.as_raw_fd()) {
                Drain::Rung => return Ok(()),
                Drain::Empty => guard.clear_ready(),
                Drain::Closed => {
                    tracing::debug!("control channel closed by client");
                    self.hangup = true;
                    drop(guard);
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    /// Drain pending rings without waiting. Returns whether any were seen.
    pub fn drain(&self) -> bool {
        matches!(try_drain(self.stream.as_raw_fd()), Drain::Rung)
    }

    /// Whether the client end is known to be closed.
    #[inline]
    pub fn is_hung_up(&self) -> bool {
        self.hangup
    }
}

impl std::fmt::Debug for ServerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerChannel")
            .field("fd", &self.stream.as_raw_fd())
            .field("registered", &self.async_fd.is_some())
            .field("hangup", &self.hangup)
            .finish()
    }
}

enum Drain {
    Rung,
    Empty,
    Closed,
}

fn try_drain(fd: RawFd) -> Drain {
    let mut buf = [0u8; 64];
    let mut rung = false;

    loop {
        // SAFETY: fd is open for the lifetime of the channel and buf is a
        // valid writable buffer of the given length.
        let ret = unsafe {
            libc::recv(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };

        if ret > 0 {
            rung = true;
        } else if ret == 0 {
            return if rung { Drain::Rung } else { Drain::Closed };
        } else {
            let err = io::Error::last_os_error();
            match err.kind() {
                ErrorKind::WouldBlock => break,
                ErrorKind::Interrupted => continue,
                _ => {
                    tracing::warn!(error = %err, "doorbell drain failed");
                    break;
                }
            }
        }
    }

    if rung {
        Drain::Rung
    } else {
        Drain::Empty
    }
}

// =============================================================================
// Client End
// =============================================================================

/// The client's end: rings the doorbell, receives descriptors.
#[derive(Debug)]
pub struct ClientChannel {
    stream: UnixStream,
}

impl ClientChannel {
    /// Wrap an inherited or received client end.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let stream = UnixStream::from(fd);
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }

    /// Wrap a raw descriptor number taken over from the environment.
    ///
    /// # Safety
    ///
    /// `fd` must be an open socketpair end owned by nobody else.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        // SAFETY: upheld by the caller.
        Self::from_fd(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Pull the next descriptor without blocking.
    ///
    /// The server sends a descriptor before enqueueing the event that
    /// announces it, so by the time the event is seen the descriptor is
    /// already queued. `WouldBlock` therefore means the peer lied.
    pub fn recv_descriptor(&self) -> io::Result<OwnedFd> {
        let fd = self.stream.as_raw_fd().recv_fd()?;
        // SAFETY: recv_fd returns a freshly installed descriptor we own.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Ring the server. A full socket buffer means a ring is already
    /// pending, so the byte is dropped.
    pub fn ring(&self) {
        let buf = [1u8];
        // SAFETY: the stream is open and buf is valid for one byte.
        let ret = unsafe {
            libc::send(
                self.stream.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT | MSG_NOSIGNAL,
            )
        };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::WouldBlock {
                tracing::debug!(error = %err, "doorbell ring failed");
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const MSG_NOSIGNAL: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MSG_NOSIGNAL: libc::c_int = 0;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::time::Duration;

    #[tokio::test]
    async fn ring_wakes_server() {
        let (mut server, client_fd) = pair().unwrap();
        let client = ClientChannel::from_fd(client_fd).unwrap();

        client.ring();
        client.ring();
        client.ring();

        tokio::time::timeout(Duration::from_millis(500), server.readable())
            .await
            .expect("timeout waiting for doorbell")
            .expect("readable failed");

        // Everything was drained by the first wakeup.
        assert!(!server.drain());
    }

    #[tokio::test]
    async fn closed_client_parks_readable() {
        let (mut server, client_fd) = pair().unwrap();
        drop(client_fd);

        let res = tokio::time::timeout(Duration::from_millis(50), server.readable()).await;
        assert!(res.is_err());
        assert!(server.is_hung_up());
    }

    #[test]
    fn descriptor_arrives_in_order() {
        let (server, client_fd) = pair().unwrap();
        let client = ClientChannel::from_fd(client_fd).unwrap();

        let mut first = tempfile();
        first.write_all(b"first").unwrap();
        let mut second = tempfile();
        second.write_all(b"second").unwrap();

        server.send_descriptor(first.as_raw_fd()).unwrap();
        server.send_descriptor(second.as_raw_fd()).unwrap();

        for expected in [&b"first"[..], &b"second"[..]] {
            let mut file = std::fs::File::from(client.recv_descriptor().unwrap());
            file.seek(SeekFrom::Start(0)).unwrap();
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).unwrap();
            assert_eq!(buf, expected);
        }

        let err = client.recv_descriptor().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    fn tempfile() -> std::fs::File {
        let path = std::env::temp_dir().join(format!(
            "shmif-channel-{}-{}",
            std::process::id(),
            crate::key::test_key().as_str().trim_start_matches('/')
        ));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .unwrap();
        std::fs::remove_file(&path).unwrap();
        file
    }
}
