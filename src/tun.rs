//! Tun device seam
//!
//! The router never acquires a tun fd itself (the VPN permission dance
//! belongs to a collaborator); it receives something that yields whole
//! IPv4 frames. [`FdTun`] adapts a raw tun fd; [`ChannelTun`] is an
//! in-memory twin used by tests and demos.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, Mutex};

/// Largest frame the router accepts off the tun device
pub const MAX_FRAME: usize = 16_384;

/// A source and sink of whole IPv4 frames (no link-layer header)
#[async_trait]
pub trait TunInterface: Send + Sync {
    /// Read one frame; `Ok(0)` means the device is gone
    async fn recv_frame(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one synthesized frame back to the device
    async fn send_frame(&self, frame: &[u8]) -> io::Result<()>;
}

/// Tun device backed by a raw file descriptor
pub struct FdTun {
    fd: AsyncFd<OwnedFd>,
}

impl FdTun {
    /// Take ownership of a tun fd
    ///
    /// The fd is switched to non-blocking mode and closed on drop (the
    /// router closes it last during shutdown by dropping the interface).
    ///
    /// # Safety
    ///
    /// `fd` must be an open file descriptor the caller transfers ownership
    /// of; nothing else may use or close it afterwards.
    ///
    /// # Errors
    ///
    /// Fails when the fd cannot be made non-blocking or registered with
    /// the reactor.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        let owned = OwnedFd::from_raw_fd(fd);
        set_nonblocking(owned.as_raw_fd())?;
        Ok(Self {
            fd: AsyncFd::new(owned)?,
        })
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // Safety: fcntl on an fd we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[async_trait]
impl TunInterface for FdTun {
    async fn recv_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                // Safety: reading into a buffer we own, fd is valid.
                let n = unsafe {
                    libc::read(inner.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(read) => return read,
                Err(_would_block) => continue,
            }
        }
    }

    async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                // Safety: writing from a buffer we own, fd is valid.
                let n = unsafe {
                    libc::write(inner.as_raw_fd(), frame.as_ptr().cast(), frame.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

/// In-memory tun twin for tests and demos
///
/// Frames written by the router come out of the paired [`TunPeer`];
/// frames injected into the peer come out of `recv_frame`.
pub struct ChannelTun {
    incoming: Mutex<mpsc::Receiver<Bytes>>,
    outgoing: mpsc::Sender<Bytes>,
}

/// The client side of a [`ChannelTun`]
pub struct TunPeer {
    inject_tx: mpsc::Sender<Bytes>,
    written_rx: Mutex<mpsc::Receiver<Bytes>>,
}

impl ChannelTun {
    /// Create a connected tun/peer pair
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, TunPeer) {
        let (inject_tx, inject_rx) = mpsc::channel(capacity);
        let (written_tx, written_rx) = mpsc::channel(capacity);
        (
            Self {
                incoming: Mutex::new(inject_rx),
                outgoing: written_tx,
            },
            TunPeer {
                inject_tx,
                written_rx: Mutex::new(written_rx),
            },
        )
    }
}

#[async_trait]
impl TunInterface for ChannelTun {
    async fn recv_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.incoming.lock().await.recv().await {
            Some(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(len)
            }
            // Peer dropped: behave like a closed tun fd.
            None => Ok(0),
        }
    }

    async fn send_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.outgoing
            .send(Bytes::copy_from_slice(frame))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tun peer gone"))
    }
}

impl TunPeer {
    /// Inject a frame as if an application inside the tun had sent it
    ///
    /// # Errors
    ///
    /// Fails when the router side has shut down.
    pub async fn inject(&self, frame: impl Into<Bytes>) -> io::Result<()> {
        self.inject_tx
            .send(frame.into())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "router gone"))
    }

    /// Next frame the router wrote back to the tun
    pub async fn next_frame(&self) -> Option<Bytes> {
        self.written_rx.lock().await.recv().await
    }

    /// Non-blocking variant of [`next_frame`](Self::next_frame)
    pub fn try_next_frame(&self) -> Option<Bytes> {
        self.written_rx.try_lock().ok()?.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_tun_roundtrip() {
        let (tun, peer) = ChannelTun::pair(8);

        peer.inject(Bytes::from_static(b"frame-in")).await.unwrap();
        let mut buf = [0u8; 64];
        let n = tun.recv_frame(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"frame-in");

        tun.send_frame(b"frame-out").await.unwrap();
        assert_eq!(peer.next_frame().await.unwrap(), Bytes::from_static(b"frame-out"));
    }

    #[tokio::test]
    async fn test_channel_tun_reports_closed_peer() {
        let (tun, peer) = ChannelTun::pair(1);
        drop(peer);
        let mut buf = [0u8; 16];
        assert_eq!(tun.recv_frame(&mut buf).await.unwrap(), 0);
        assert!(tun.send_frame(b"x").await.is_err());
    }
}
