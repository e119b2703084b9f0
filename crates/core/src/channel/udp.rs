use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;

use super::{Channel, ChannelDesc, ChannelKind, timeout_duration};

/// A connected UDP socket serving one direction pair of an RTP session:
/// either the RTP out-channel or the bidirectional RTCP channel.
pub struct UdpChannel {
    socket: UdpSocket,
    local_port: u16,
    remote_port: u16,
    closed: AtomicBool,
}

impl UdpChannel {
    /// Bind an ephemeral local socket and connect it to `remote`.
    pub fn connect(remote: SocketAddr) -> Result<Self> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(remote)?;
        let local_port = socket.local_addr()?.port();
        tracing::debug!(local_port, remote = %remote, "UDP channel connected");
        Ok(UdpChannel {
            socket,
            local_port,
            remote_port: remote.port(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }
}

impl Channel for UdpChannel {
    fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(crate::KgdError::ChannelClosed);
        }
        Ok(self.socket.recv(buf)?)
    }

    fn write_some(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(crate::KgdError::ChannelClosed);
        }
        Ok(self.socket.send(buf)?)
    }

    fn set_read_blocking(&self, blocking: bool) -> Result<()> {
        Ok(self.socket.set_nonblocking(!blocking)?)
    }

    fn set_read_timeout(&self, secs: Option<f64>) -> Result<()> {
        Ok(self.socket.set_read_timeout(timeout_duration(secs))?)
    }

    fn set_write_blocking(&self, blocking: bool) -> Result<()> {
        Ok(self.socket.set_nonblocking(!blocking)?)
    }

    fn set_write_timeout(&self, secs: Option<f64>) -> Result<()> {
        Ok(self.socket.set_write_timeout(timeout_duration(secs))?)
    }

    fn set_write_buffer(&self, bytes: usize) -> Result<()> {
        set_send_buffer(&self.socket, bytes)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // A tiny read timeout unblocks a reader stuck in recv.
        let _ = self
            .socket
            .set_read_timeout(Some(std::time::Duration::from_millis(1)));
    }

    fn description(&self) -> ChannelDesc {
        ChannelDesc {
            kind: ChannelKind::Owned,
            ports: (self.local_port, self.remote_port),
        }
    }
}

pub(crate) fn set_send_buffer(socket: &impl AsRawFd, bytes: usize) -> Result<()> {
    let value = bytes as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_over_localhost() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote = receiver.local_addr().unwrap();

        let chan = UdpChannel::connect(remote).unwrap();
        assert_eq!(chan.write_some(b"hello").unwrap(), 5);

        let mut buf = [0u8; 16];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from.port(), chan.local_port());
    }

    #[test]
    fn read_timeout_is_would_block() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let chan = UdpChannel::connect(receiver.local_addr().unwrap()).unwrap();
        chan.set_read_timeout(Some(0.05)).unwrap();

        let mut buf = [0u8; 16];
        let err = chan.read_some(&mut buf).unwrap_err();
        assert!(err.would_block(), "expected would-block, got {err}");
    }

    #[test]
    fn closed_channel_rejects_io() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let chan = UdpChannel::connect(receiver.local_addr().unwrap()).unwrap();
        chan.close();
        assert!(matches!(
            chan.write_some(b"x"),
            Err(crate::KgdError::ChannelClosed)
        ));
    }

    #[test]
    fn describes_owned_ports() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote = receiver.local_addr().unwrap();
        let chan = UdpChannel::connect(remote).unwrap();
        let desc = chan.description();
        assert_eq!(desc.kind, ChannelKind::Owned);
        assert_eq!(desc.ports, (chan.local_port(), remote.port()));
    }
}
