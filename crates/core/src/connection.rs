//! One RTSP client connection: the listen loop that peels requests,
//! responses and interleave records off the TCP stream, dispatches methods,
//! and owns the RTSP sessions created through it.

use std::collections::{BTreeMap, HashMap};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rand::RngExt;

use crate::channel::interleave::decode_frame;
use crate::channel::{TcpChannel, TcpMux};
use crate::config::{Config, SharedConfig};
use crate::error::{KgdError, Result};
use crate::media::{Container, DescriptionCache};
use crate::methods::{self, AfterReply};
use crate::protocol::request::parse_response;
use crate::protocol::{RtspRequest, RtspResponse, UserAgent, next_packet_len};
use crate::session::RtspSession;

/// A cached description reference and whether it came from the global pool.
struct DescriptionRef {
    container: Arc<Container>,
    shared: bool,
}

/// Server side of one accepted TCP connection.
pub struct Connection {
    id: u32,
    mux: Arc<TcpMux>,
    config: SharedConfig,
    user_agent: Mutex<UserAgent>,
    sessions: Mutex<BTreeMap<u32, Arc<RtspSession>>>,
    descriptions: Mutex<HashMap<String, DescriptionRef>>,
    last_response: Mutex<Option<(u16, u32)>>,
}

impl Connection {
    /// Entry point: wrap an accepted stream and run its listen loop to
    /// completion.
    pub fn handle(stream: TcpStream, config: SharedConfig, running: Arc<AtomicBool>) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let chan = match TcpChannel::new(stream) {
            Ok(chan) => chan,
            Err(e) => {
                tracing::warn!(error = %e, "connection setup failed");
                return;
            }
        };
        let conn = Connection {
            id: rand::rng().random(),
            mux: TcpMux::new(chan),
            config,
            user_agent: Mutex::new(UserAgent::Generic),
            sessions: Mutex::new(BTreeMap::new()),
            descriptions: Mutex::new(HashMap::new()),
            last_response: Mutex::new(None),
        };
        tracing::info!(conn_id = conn.id, %peer, "client connected");

        let reason = conn.run(&running);
        conn.cleanup();
        tracing::info!(conn_id = conn.id, %peer, reason, "client disconnected");
    }

    pub fn config(&self) -> Config {
        self.config.get()
    }

    pub fn mux(&self) -> &Arc<TcpMux> {
        &self.mux
    }

    pub fn local_host(&self) -> String {
        self.mux.local_host()
    }

    pub fn remote_host(&self) -> String {
        self.mux.remote_host()
    }

    pub fn user_agent(&self) -> UserAgent {
        *self.user_agent.lock()
    }

    pub fn set_user_agent(&self, ua: UserAgent) {
        *self.user_agent.lock() = ua;
    }

    /// The response most recently pushed by the peer, if any.
    pub fn last_response(&self) -> Option<(u16, u32)> {
        *self.last_response.lock()
    }

    /// Resolve a container for `file`, loading it on first use: through the
    /// global pool when descriptor sharing is on, privately otherwise.
    pub fn load_description(&self, file: &str) -> Result<Arc<Container>> {
        if let Some(held) = self.descriptions.lock().get(file) {
            return Ok(held.container.clone());
        }
        let config = self.config.get();
        let (container, shared) = if config.share_descriptors {
            (DescriptionCache::global().load(&config, file)?, true)
        } else {
            (Container::load(&config, file)?, false)
        };
        self.descriptions.lock().insert(
            file.to_string(),
            DescriptionRef {
                container: container.clone(),
                shared,
            },
        );
        Ok(container)
    }

    /// A container this connection already holds.
    pub fn description(&self, file: &str) -> Result<Arc<Container>> {
        self.descriptions
            .lock()
            .get(file)
            .map(|held| held.container.clone())
            .ok_or_else(|| KgdError::NotFound(format!("description for {file}")))
    }

    pub fn session(&self, id: u32) -> Result<Arc<RtspSession>> {
        self.sessions
            .lock()
            .get(&id)
            .cloned()
            .ok_or(KgdError::SessionNotFound(id))
    }

    pub fn get_or_create_session(&self, id: u32) -> Arc<RtspSession> {
        self.sessions
            .lock()
            .entry(id)
            .or_insert_with(|| RtspSession::new(id))
            .clone()
    }

    pub fn has_sessions(&self) -> bool {
        !self.sessions.lock().is_empty()
    }

    pub fn remove_session(&self, id: u32) {
        if let Some(session) = self.sessions.lock().remove(&id) {
            session.teardown();
        }
    }

    fn run(&self, running: &Arc<AtomicBool>) -> &'static str {
        let config = self.config.get();
        let _ = self.mux.set_read_timeout(Some(config.read_timeout));
        let _ = self.mux.set_write_timeout(Some(config.write_timeout));
        let _ = self.mux.set_write_buffer(config.write_buffer);
        let mut input: Vec<u8> = Vec::new();
        let mut scratch = [0u8; 2048];

        while running.load(Ordering::SeqCst) {
            match self.mux.read_some(&mut scratch) {
                Ok(0) => continue,
                Ok(n) => {
                    input.extend_from_slice(&scratch[..n]);
                    self.drain_input(&mut input);
                }
                Err(e) if e.would_block() => continue,
                Err(KgdError::ChannelClosed) => return "connection closed by client",
                Err(e) => {
                    tracing::warn!(conn_id = self.id, error = %e, "socket failed");
                    return "read error";
                }
            }
        }
        "server shutting down"
    }

    fn drain_input(&self, input: &mut Vec<u8>) {
        while let Some(len) = next_packet_len(input) {
            let packet: Vec<u8> = input.drain(..len).collect();
            self.handle_packet(&packet);
        }
    }

    fn handle_packet(&self, packet: &[u8]) {
        // interleave record
        if packet.first() == Some(&b'$') {
            match decode_frame(packet) {
                Some((channel, payload, _)) => {
                    if let Err(e) = self.mux.push_inbound(channel, payload) {
                        tracing::error!(conn_id = self.id, error = %e, "inbound record dropped");
                    }
                }
                None => tracing::error!(conn_id = self.id, "malformed interleave record"),
            }
            return;
        }

        let Ok(text) = std::str::from_utf8(packet) else {
            tracing::error!(conn_id = self.id, len = packet.len(), "non-text packet dropped");
            return;
        };

        // a peer-pushed response is stashed, not interpreted
        if text.starts_with("RTSP/") {
            match parse_response(text) {
                Ok((code, cseq)) => {
                    tracing::debug!(conn_id = self.id, code, cseq, "response stashed");
                    *self.last_response.lock() = Some((code, cseq));
                }
                Err(e) => tracing::warn!(conn_id = self.id, error = %e, "unparsable response"),
            }
            return;
        }

        match RtspRequest::parse(text) {
            Ok(rq) => {
                tracing::debug!(
                    conn_id = self.id,
                    method = ?rq.method,
                    cseq = rq.cseq,
                    url = %rq.url.to_url_string(),
                    "request"
                );
                match methods::dispatch(self, &rq) {
                    Ok(reply) => {
                        self.write_response(&reply.response);
                        self.run_after(reply.after);
                    }
                    Err(e) => {
                        tracing::warn!(conn_id = self.id, error = %e, "method failed");
                        self.write_error(e.status(), rq.cseq);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(conn_id = self.id, error = %e, "request rejected");
                self.write_error(e.status(), scan_cseq(text));
            }
        }
    }

    fn run_after(&self, after: AfterReply) {
        match after {
            AfterReply::None => {}
            AfterReply::SetUserAgent(ua) => self.set_user_agent(ua),
            AfterReply::StartSession(session) => session.start(),
            AfterReply::StartTrack(track) => track.start(),
            AfterReply::UnpauseSession(session, rq) => session.unpause(&rq),
            AfterReply::UnpauseTrack(track, rq) => track.unpause(&rq),
            AfterReply::TeardownSession(id) => self.remove_session(id),
            AfterReply::TeardownTrack(session, track) => {
                if let Err(e) = session.remove_track(&track) {
                    tracing::warn!(conn_id = self.id, error = %e, "track teardown failed");
                }
            }
        }
    }

    fn write_response(&self, response: &RtspResponse) {
        tracing::debug!(conn_id = self.id, status = response.status.code(), "response");
        if let Err(e) = self.mux.write_message(response.serialize().as_bytes()) {
            tracing::warn!(conn_id = self.id, error = %e, "reply write failed");
        }
    }

    fn write_error(&self, status: crate::status::Status, cseq: u32) {
        let config = self.config.get();
        self.write_response(&RtspResponse::error(status, cseq, &config.server_name));
    }

    /// Tear down everything this connection owns, then close the socket.
    fn cleanup(&self) {
        let sessions: Vec<_> = {
            let mut sessions = self.sessions.lock();
            std::mem::take(&mut *sessions).into_values().collect()
        };
        for session in sessions {
            session.teardown();
        }

        let descriptions: Vec<(String, DescriptionRef)> = {
            let mut held = self.descriptions.lock();
            held.drain().collect()
        };
        for (file, held) in descriptions {
            drop(held.container);
            if held.shared {
                DescriptionCache::global().release(&file);
            }
        }

        self.mux.close();
    }
}

/// Best-effort CSeq extraction from an unparsable request, for the error
/// reply.
fn scan_cseq(text: &str) -> u32 {
    text.lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("CSeq"))
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0)
}
