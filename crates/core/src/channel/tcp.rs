use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;

use super::{Channel, ChannelDesc, ChannelKind, timeout_duration};

/// Keepalive tuning applied to every RTSP connection socket: probe after 5s
/// idle, 3 probes, 10s apart.
const KEEPALIVE_IDLE_SECS: libc::c_int = 5;
const KEEPALIVE_PROBES: libc::c_int = 3;
const KEEPALIVE_INTERVAL_SECS: libc::c_int = 10;

/// A TCP stream wrapped as a [`Channel`].
///
/// Backs the RTSP connection socket; the interleaving multiplexer writes
/// through it under its own lock.
pub struct TcpChannel {
    stream: TcpStream,
    local_port: u16,
    remote_port: u16,
    closed: AtomicBool,
}

impl TcpChannel {
    /// Wrap an accepted stream, enabling keepalive.
    pub fn new(stream: TcpStream) -> Result<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        enable_keepalive(&stream)?;
        Ok(TcpChannel {
            stream,
            local_port: local.port(),
            remote_port: remote.port(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_host(&self) -> String {
        self.stream
            .local_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default()
    }

    pub fn remote_host(&self) -> String {
        self.stream
            .peer_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default()
    }

    /// Write the whole buffer, looping over short writes.
    pub fn write_all(&self, mut buf: &[u8]) -> Result<usize> {
        let total = buf.len();
        while !buf.is_empty() {
            let n = self.write_some(buf)?;
            buf = &buf[n..];
        }
        Ok(total)
    }
}

impl Channel for TcpChannel {
    fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(crate::KgdError::ChannelClosed);
        }
        let n = (&self.stream).read(buf)?;
        if n == 0 && !buf.is_empty() {
            return Err(crate::KgdError::ChannelClosed);
        }
        Ok(n)
    }

    fn write_some(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(crate::KgdError::ChannelClosed);
        }
        Ok((&self.stream).write(buf)?)
    }

    fn set_read_blocking(&self, blocking: bool) -> Result<()> {
        Ok(self.stream.set_nonblocking(!blocking)?)
    }

    fn set_read_timeout(&self, secs: Option<f64>) -> Result<()> {
        Ok(self.stream.set_read_timeout(timeout_duration(secs))?)
    }

    fn set_write_blocking(&self, blocking: bool) -> Result<()> {
        Ok(self.stream.set_nonblocking(!blocking)?)
    }

    fn set_write_timeout(&self, secs: Option<f64>) -> Result<()> {
        Ok(self.stream.set_write_timeout(timeout_duration(secs))?)
    }

    fn set_write_buffer(&self, bytes: usize) -> Result<()> {
        super::udp::set_send_buffer(&self.stream, bytes)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn description(&self) -> ChannelDesc {
        ChannelDesc {
            kind: ChannelKind::Owned,
            ports: (self.local_port, self.remote_port),
        }
    }
}

fn enable_keepalive(stream: &TcpStream) -> Result<()> {
    let fd = stream.as_raw_fd();
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, KEEPALIVE_IDLE_SECS)?;
        setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, KEEPALIVE_PROBES)?;
        setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_KEEPINTVL,
            KEEPALIVE_INTERVAL_SECS,
        )?;
    }
    Ok(())
}

fn setsockopt(fd: i32, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
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
    use std::net::TcpListener;

    fn pair() -> (TcpChannel, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (TcpChannel::new(server).unwrap(), client)
    }

    #[test]
    fn write_reaches_peer() {
        let (chan, mut peer) = pair();
        chan.write_all(b"RTSP/1.0 200 OK\r\n").unwrap();
        let mut buf = [0u8; 32];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"RTSP/1.0 200 OK\r\n");
    }

    #[test]
    fn peer_close_is_channel_closed() {
        let (chan, peer) = pair();
        drop(peer);
        let mut buf = [0u8; 8];
        assert!(matches!(
            chan.read_some(&mut buf),
            Err(crate::KgdError::ChannelClosed)
        ));
    }

    #[test]
    fn read_timeout_is_would_block() {
        let (chan, _peer) = pair();
        chan.set_read_timeout(Some(0.05)).unwrap();
        let mut buf = [0u8; 8];
        let err = chan.read_some(&mut buf).unwrap_err();
        assert!(err.would_block());
    }
}
