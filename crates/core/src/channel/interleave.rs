//! TCP interleaving: N logical channels multiplexed on one RTSP connection
//! using the `$ <channel> <length:u16be> <payload>` framing (RFC 2326 §10.12).

use std::collections::{BTreeSet, HashMap};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{KgdError, Result};

use super::{Channel, ChannelDesc, ChannelKind, TcpChannel};

/// Reusable pool of one-byte interleave channel ids.
struct PortPool {
    free: BTreeSet<u8>,
}

impl PortPool {
    fn new() -> Self {
        PortPool {
            free: (0..=u8::MAX).collect(),
        }
    }

    /// Take two consecutive ids, RTP on the even one.
    fn take_pair(&mut self) -> Result<(u8, u8)> {
        let pair = self
            .free
            .iter()
            .copied()
            .find(|p| p % 2 == 0 && self.free.contains(&(p + 1)));
        let Some(a) = pair else {
            return Err(KgdError::NotFound("free interleave channel pair".into()));
        };
        self.free.remove(&a);
        self.free.remove(&(a + 1));
        Ok((a, a + 1))
    }

    fn release(&mut self, port: u8) {
        self.free.insert(port);
    }
}

struct MuxState {
    channels: HashMap<u8, Weak<InterleavedChannel>>,
    ports: PortPool,
    closed: bool,
}

/// The interleaving multiplexer owning one RTSP TCP socket.
///
/// Every outbound write, framed or not, goes through [`write_message`]
/// under one lock so interleave records never tear RTSP replies apart.
///
/// [`write_message`]: TcpMux::write_message
pub struct TcpMux {
    sock: TcpChannel,
    write_lock: Mutex<()>,
    state: Mutex<MuxState>,
    drained: Condvar,
}

impl TcpMux {
    pub fn new(sock: TcpChannel) -> Arc<Self> {
        Arc::new(TcpMux {
            sock,
            write_lock: Mutex::new(()),
            state: Mutex::new(MuxState {
                channels: HashMap::new(),
                ports: PortPool::new(),
                closed: false,
            }),
            drained: Condvar::new(),
        })
    }

    pub fn local_host(&self) -> String {
        self.sock.local_host()
    }

    pub fn remote_host(&self) -> String {
        self.sock.remote_host()
    }

    /// Read raw bytes from the underlying socket (the connection's listen
    /// loop is the only caller).
    pub fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        self.sock.read_some(buf)
    }

    pub fn set_read_timeout(&self, secs: Option<f64>) -> Result<()> {
        self.sock.set_read_timeout(secs)
    }

    pub fn set_write_timeout(&self, secs: Option<f64>) -> Result<()> {
        self.sock.set_write_timeout(secs)
    }

    pub fn set_write_buffer(&self, bytes: usize) -> Result<()> {
        self.sock.set_write_buffer(bytes)
    }

    /// Write an unframed RTSP message on the shared socket.
    pub fn write_message(&self, data: &[u8]) -> Result<usize> {
        let _wl = self.write_lock.lock();
        self.sock.write_all(data)
    }

    /// Allocate a local channel pair mirroring the client's `interleaved=`
    /// pair and register both logical channels.
    pub fn add_channel_pair(
        self: &Arc<Self>,
        remote: (u8, u8),
    ) -> Result<(Arc<InterleavedChannel>, Arc<InterleavedChannel>)> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(KgdError::ChannelClosed);
        }
        let (a, b) = state.ports.take_pair()?;
        let rtp = InterleavedChannel::new(a, remote.0, Arc::downgrade(self));
        let rtcp = InterleavedChannel::new(b, remote.1, Arc::downgrade(self));
        state.channels.insert(a, Arc::downgrade(&rtp));
        state.channels.insert(b, Arc::downgrade(&rtcp));
        tracing::debug!(rtp_channel = a, rtcp_channel = b, "interleave pair added");
        Ok((rtp, rtcp))
    }

    /// Deliver an inbound interleave record to the matching channel FIFO.
    pub fn push_inbound(&self, channel: u8, payload: &[u8]) -> Result<()> {
        let chan = {
            let state = self.state.lock();
            state.channels.get(&channel).and_then(Weak::upgrade)
        };
        match chan {
            Some(chan) => {
                chan.push_inbound(payload);
                Ok(())
            }
            None => Err(KgdError::NotFound(format!("interleaved channel {channel}"))),
        }
    }

    fn release(&self, port: u8) {
        let mut state = self.state.lock();
        if state.channels.remove(&port).is_some() {
            state.ports.release(port);
            tracing::debug!(channel = port, remaining = state.channels.len(), "interleave released");
        }
        if state.channels.is_empty() {
            self.drained.notify_all();
        }
    }

    /// Close every logical channel, wait for all of them to be released,
    /// then close the TCP socket.
    pub fn close(&self) {
        let chans: Vec<Arc<InterleavedChannel>> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.channels.values().filter_map(Weak::upgrade).collect()
        };
        for chan in &chans {
            chan.stop();
        }
        drop(chans);
        {
            let mut state = self.state.lock();
            while !state.channels.is_empty() {
                self.drained.wait(&mut state);
            }
        }
        self.sock.close();
    }
}

/// Wrap `payload` in the `$ channel length` framing.
pub fn encode_frame(channel: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= u16::MAX as usize);
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.push(b'$');
    frame.push(channel);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Parse one complete `$`-framed record from the front of `data`, returning
/// `(channel, payload, consumed)`; `None` when the record is incomplete.
pub fn decode_frame(data: &[u8]) -> Option<(u8, &[u8], usize)> {
    if data.len() < 4 || data[0] != b'$' {
        return None;
    }
    let len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < 4 + len {
        return None;
    }
    Some((data[1], &data[4..4 + len], 4 + len))
}

struct Inbound {
    queue: VecDeque<Vec<u8>>,
    running: bool,
}

struct ReadMode {
    blocking: bool,
    timeout: Option<f64>,
}

/// One logical bidirectional channel on an RTSP connection, identified by a
/// local and a remote one-byte port.
pub struct InterleavedChannel {
    local: u8,
    remote: u8,
    mux: Weak<TcpMux>,
    inbound: Mutex<Inbound>,
    not_empty: Condvar,
    read_mode: Mutex<ReadMode>,
}

impl InterleavedChannel {
    fn new(local: u8, remote: u8, mux: Weak<TcpMux>) -> Arc<Self> {
        Arc::new(InterleavedChannel {
            local,
            remote,
            mux,
            inbound: Mutex::new(Inbound {
                queue: VecDeque::new(),
                running: true,
            }),
            not_empty: Condvar::new(),
            read_mode: Mutex::new(ReadMode {
                blocking: true,
                timeout: None,
            }),
        })
    }

    pub fn local_port(&self) -> u8 {
        self.local
    }

    fn push_inbound(&self, payload: &[u8]) {
        {
            let mut inbound = self.inbound.lock();
            inbound.queue.push_back(payload.to_vec());
        }
        self.not_empty.notify_all();
    }

    /// Flip the running flag and wake blocked readers so they exit cleanly.
    pub fn stop(&self) {
        {
            let mut inbound = self.inbound.lock();
            if !inbound.running {
                return;
            }
            inbound.running = false;
        }
        self.not_empty.notify_all();
    }

    fn write_framed(&self, data: &[u8], last: bool) -> Result<usize> {
        let Some(mux) = self.mux.upgrade() else {
            return Err(KgdError::ChannelClosed);
        };
        let frame = encode_frame(self.remote, data);
        let _wl = mux.write_lock.lock();
        if last {
            mux.sock.write_last(&frame)?;
        } else {
            mux.sock.write_all(&frame)?;
        }
        // Framing header bytes are not the caller's payload.
        Ok(frame.len() - 4)
    }
}

impl Drop for InterleavedChannel {
    fn drop(&mut self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.release(self.local);
        }
    }
}

impl Channel for InterleavedChannel {
    fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        let (blocking, timeout) = {
            let mode = self.read_mode.lock();
            (mode.blocking, mode.timeout)
        };

        let mut inbound = self.inbound.lock();
        loop {
            if !inbound.running {
                return Err(KgdError::ChannelClosed);
            }
            if let Some(front) = inbound.queue.front_mut() {
                let n = front.len().min(buf.len());
                buf[..n].copy_from_slice(&front[..n]);
                if n == front.len() {
                    inbound.queue.pop_front();
                } else {
                    front.drain(..n);
                }
                return Ok(n);
            }
            if !blocking {
                return Ok(0);
            }
            match timeout {
                Some(secs) => {
                    let deadline = Duration::from_secs_f64(secs);
                    if self.not_empty.wait_for(&mut inbound, deadline).timed_out()
                        && inbound.queue.is_empty()
                        && inbound.running
                    {
                        return Err(std::io::Error::from(std::io::ErrorKind::WouldBlock).into());
                    }
                }
                None => self.not_empty.wait(&mut inbound),
            }
        }
    }

    fn write_some(&self, buf: &[u8]) -> Result<usize> {
        self.write_framed(buf, false)
    }

    fn write_last(&self, buf: &[u8]) -> Result<usize> {
        self.write_framed(buf, true)
    }

    fn set_read_blocking(&self, blocking: bool) -> Result<()> {
        self.read_mode.lock().blocking = blocking;
        Ok(())
    }

    fn set_read_timeout(&self, secs: Option<f64>) -> Result<()> {
        self.read_mode.lock().timeout = secs.filter(|s| *s > 0.0);
        Ok(())
    }

    fn set_write_blocking(&self, _blocking: bool) -> Result<()> {
        Ok(())
    }

    fn set_write_timeout(&self, secs: Option<f64>) -> Result<()> {
        match self.mux.upgrade() {
            Some(mux) => mux.sock.set_write_timeout(secs),
            None => Err(KgdError::ChannelClosed),
        }
    }

    fn set_write_buffer(&self, bytes: usize) -> Result<()> {
        match self.mux.upgrade() {
            Some(mux) => mux.sock.set_write_buffer(bytes),
            None => Err(KgdError::ChannelClosed),
        }
    }

    fn close(&self) {
        self.stop();
    }

    fn description(&self) -> ChannelDesc {
        ChannelDesc {
            kind: ChannelKind::Shared,
            ports: (self.local as u16, self.remote as u16),
        }
    }
}
