//! RTSP method handlers: OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN.
//!
//! Each handler prepares state and produces the reply; side effects that
//! must happen only after the reply is on the wire (kicking send loops,
//! removing sessions) come back as an [`AfterReply`] action the connection
//! runs post-write.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rand::RngExt;

use crate::channel::{Channel, ChannelKind, UdpChannel};
use crate::config::Config;
use crate::connection::Connection;
use crate::error::{KgdError, Result};
use crate::protocol::{
    PlayRequest, RtspRequest, RtspResponse, TransportSpec, UserAgent, request::Method, sdp,
};
use crate::rtp::{RtpSession, SessionSettings};
use crate::session::RtspSession;
use crate::status::Status;

/// Methods advertised by OPTIONS.
pub const PUBLIC_METHODS: &str = "OPTIONS,DESCRIBE,SETUP,PLAY,PAUSE,TEARDOWN";

/// Deferred action to run once the reply has been written.
pub enum AfterReply {
    None,
    SetUserAgent(UserAgent),
    StartSession(Arc<RtspSession>),
    StartTrack(Arc<RtpSession>),
    UnpauseSession(Arc<RtspSession>, PlayRequest),
    UnpauseTrack(Arc<RtpSession>, PlayRequest),
    TeardownSession(u32),
    TeardownTrack(Arc<RtspSession>, String),
}

pub struct Reply {
    pub response: RtspResponse,
    pub after: AfterReply,
}

impl Reply {
    fn done(response: RtspResponse) -> Self {
        Reply {
            response,
            after: AfterReply::None,
        }
    }
}

/// Route a request to its handler.
pub fn dispatch(conn: &Connection, rq: &RtspRequest) -> Result<Reply> {
    match rq.method {
        Method::Options => options(conn, rq),
        Method::Describe => describe(conn, rq),
        Method::Setup => setup(conn, rq),
        Method::Play => play(conn, rq),
        Method::Pause => pause(conn, rq),
        Method::Teardown => teardown(conn, rq),
        other => Err(KgdError::managed(
            Status::NOT_IMPLEMENTED,
            format!("{other:?} is not implemented"),
        )),
    }
}

fn base_reply(config: &Config, rq: &RtspRequest) -> RtspResponse {
    RtspResponse::ok().cseq(rq.cseq).server(&config.server_name)
}

fn options(conn: &Connection, rq: &RtspRequest) -> Result<Reply> {
    let config = conn.config();
    tracing::debug!(cseq = rq.cseq, "OPTIONS");
    Ok(Reply {
        response: base_reply(&config, rq)
            .header("Public", PUBLIC_METHODS)
            .header("Accept-Charset", "ISO-8859-1;q=1"),
        after: AfterReply::SetUserAgent(rq.user_agent()),
    })
}

fn describe(conn: &Connection, rq: &RtspRequest) -> Result<Reply> {
    let config = conn.config();
    tracing::debug!(cseq = rq.cseq, file = %rq.url.file, "DESCRIBE");
    rq.check_accept()?;
    rq.check_require()?;
    check_url(&config, rq)?;

    let container = conn.load_description(&rq.url.file)?;
    let sdp = sdp::describe(&container, &config, &rq.url.host, None);

    Ok(Reply::done(
        base_reply(&config, rq)
            .date()
            .header("Content-Type", "application/sdp")
            .header("Content-Base", rq.url.to_url_string())
            .body(sdp),
    ))
}

fn setup(conn: &Connection, rq: &RtspRequest) -> Result<Reply> {
    let config = conn.config();
    tracing::debug!(cseq = rq.cseq, file = %rq.url.file, track = ?rq.url.track, "SETUP");
    check_url(&config, rq)?;

    let track = rq.url.track.clone().ok_or_else(|| {
        KgdError::managed(Status::AGGREGATE_NOT_ALLOWED, "SETUP requires a track")
    })?;
    let index: usize = track
        .parse()
        .map_err(|_| KgdError::managed(Status::NOT_FOUND, format!("track {track}")))?;

    let container = conn.load_description(&rq.url.file)?;
    let medium = container.medium(index)?;

    let (transport, ssrc_hint) = rq.transport()?;
    let session_id = rq.session_id().unwrap_or_else(|_| random_session_id());
    let rtsp_session = conn.get_or_create_session(session_id);

    let (rtp_chan, rtcp_chan): (Arc<dyn Channel>, Arc<dyn Channel>) = match transport {
        TransportSpec::Udp {
            client_rtp,
            client_rtcp,
        } => {
            let client_ip: IpAddr = conn
                .remote_host()
                .parse()
                .map_err(|_| KgdError::managed(Status::INTERNAL_SERVER_ERROR, "peer address"))?;
            let rtp = UdpChannel::connect(SocketAddr::new(client_ip, client_rtp))?;
            let rtcp = UdpChannel::connect(SocketAddr::new(client_ip, client_rtcp))?;
            rtp.set_write_timeout(Some(config.write_timeout))?;
            rtp.set_write_buffer(config.write_buffer)?;
            rtcp.set_write_timeout(Some(config.write_timeout))?;
            (Arc::new(rtp), Arc::new(rtcp))
        }
        TransportSpec::Interleaved { rtp, rtcp } => {
            let (a, b) = conn.mux().add_channel_pair((rtp, rtcp))?;
            (a, b)
        }
    };

    let rtp_session = RtpSession::new(
        rq.url.with_track(&track),
        medium,
        rtp_chan,
        rtcp_chan,
        conn.user_agent(),
        ssrc_hint,
        SessionSettings::from(&config),
    );
    let transport_line = transport_reply(conn, &rtp_session);
    rtsp_session.add_track(&track, rtp_session);
    tracing::info!(
        session_id,
        file = %rq.url.file,
        track = %track,
        transport = %transport_line,
        "session created via SETUP"
    );

    Ok(Reply::done(
        base_reply(&config, rq)
            .date()
            .header("Session", session_id)
            .header("Transport", transport_line),
    ))
}

fn play(conn: &Connection, rq: &RtspRequest) -> Result<Reply> {
    let config = conn.config();
    let session = lookup_session(conn, rq)?;
    let container = conn.description(&rq.url.file)?;
    let is_live = container.is_live_cast();

    let rq_range = rq.play_request()?;
    tracing::debug!(cseq = rq.cseq, request = %rq_range, is_live, "PLAY");
    if !is_live {
        if rq_range.has_scale && rq_range.speed == 0.0 {
            return Err(KgdError::managed(Status::BAD_REQUEST, "scale 0.0"));
        }
        if rq_range.has_range && (rq_range.to - rq_range.from) * rq_range.speed.signum() < 0.0 {
            return Err(KgdError::managed(
                Status::BAD_REQUEST,
                format!("misordered range {rq_range}"),
            ));
        }
    }

    // A live cast that has already played keeps its timeline: PLAY just
    // toggles pause. Everything else routes through play(): a stopped
    // track needs its send loop spawned even when the request carries no
    // Range or Scale.
    let addressed_stopped = match &rq.url.track {
        Some(track) => session.track(track)?.is_stopped(),
        None => session.any_track_stopped(),
    };
    let must_play = !(is_live && session.has_played())
        && (addressed_stopped || rq_range.has_range || rq_range.has_scale);

    let reply_range = if must_play {
        match &rq.url.track {
            Some(track) => session.track(track)?.play(&rq_range)?,
            None => session.play(&rq_range)?,
        }
    } else {
        match &rq.url.track {
            Some(track) => session.track_play_range(track)?,
            None => session.play_range()?,
        }
    };

    let mut response = base_reply(&config, rq).date();
    if reply_range.has_range {
        let mut range = format!("npt={:.3}-", reply_range.from);
        if reply_range.speed < 0.0 {
            range.push_str("0.000");
        } else if reply_range.to.is_finite() {
            range.push_str(&format!("{:.3}", reply_range.to));
        }
        response = response.header("Range", range);
    }
    if reply_range.has_scale {
        response = response.header("Scale", format!("{:.3}", reply_range.speed));
    }
    response = response.header("Session", session.id());

    let info_sessions = match &rq.url.track {
        Some(track) => vec![session.track(track)?],
        None => session.tracks(),
    };
    let rtp_info = info_sessions
        .iter()
        .map(|s| {
            format!(
                "url={};seq={};rtptime={}",
                s.url().to_url_string(),
                s.start_sequence(),
                s.timeline().rtp_time(reply_range.from, reply_range.time)
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    response = response.header("RTP-Info", rtp_info);

    let after = match (&rq.url.track, must_play) {
        (Some(track), true) => AfterReply::StartTrack(session.track(track)?),
        (None, true) => AfterReply::StartSession(session),
        (Some(track), false) => AfterReply::UnpauseTrack(session.track(track)?, rq_range),
        (None, false) => AfterReply::UnpauseSession(session, rq_range),
    };
    Ok(Reply { response, after })
}

fn pause(conn: &Connection, rq: &RtspRequest) -> Result<Reply> {
    let config = conn.config();
    let session = lookup_session(conn, rq)?;
    tracing::debug!(cseq = rq.cseq, session_id = session.id(), "PAUSE");

    let now = PlayRequest::new();
    match &rq.url.track {
        Some(track) => session.track(track)?.pause(&now),
        None => session.pause(&now),
    }

    Ok(Reply::done(
        base_reply(&config, rq).date().header("Session", session.id()),
    ))
}

fn teardown(conn: &Connection, rq: &RtspRequest) -> Result<Reply> {
    let config = conn.config();
    if !conn.has_sessions() {
        return Err(KgdError::SessionNotFound(0));
    }
    let session = lookup_session(conn, rq)?;
    tracing::debug!(cseq = rq.cseq, session_id = session.id(), track = ?rq.url.track, "TEARDOWN");

    let after = match &rq.url.track {
        Some(track) => {
            session.track(track)?;
            AfterReply::TeardownTrack(session.clone(), track.clone())
        }
        None => AfterReply::TeardownSession(session.id()),
    };

    Ok(Reply {
        response: base_reply(&config, rq).date().header("Session", session.id()),
        after,
    })
}

fn lookup_session(conn: &Connection, rq: &RtspRequest) -> Result<Arc<RtspSession>> {
    let id = rq
        .session_id()
        .map_err(|_| KgdError::SessionNotFound(0))?;
    conn.session(id)
}

/// The requested file must exist under the media base directory, unless it
/// names a capture device.
fn check_url(config: &Config, rq: &RtspRequest) -> Result<()> {
    if rq.url.file.starts_with("dev.video") {
        return Ok(());
    }
    let path = format!("{}{}", config.base_dir, rq.url.file);
    if std::path::Path::new(&path).exists() {
        Ok(())
    } else {
        Err(KgdError::NotFound(rq.url.file.clone()))
    }
}

fn transport_reply(conn: &Connection, session: &RtpSession) -> String {
    let rtp = session.rtp_description();
    let rtcp = session.rtcp_description();
    match rtp.kind {
        ChannelKind::Owned => format!(
            "RTP/AVP;unicast;source={};destination={};client_port={}-{};server_port={}-{};ssrc={:08x}",
            conn.local_host(),
            conn.remote_host(),
            rtp.ports.1,
            rtcp.ports.1,
            rtp.ports.0,
            rtcp.ports.0,
            session.ssrc()
        ),
        ChannelKind::Shared => format!(
            "RTP/AVP/TCP;source={};destination={};interleaved={}-{};ssrc={:08x}",
            conn.local_host(),
            conn.remote_host(),
            rtp.ports.0,
            rtcp.ports.0,
            session.ssrc()
        ),
    }
}

fn random_session_id() -> u32 {
    let mut rng = rand::rng();
    loop {
        let id: u32 = rng.random();
        if id != 0 {
            return id;
        }
    }
}
