//! RTSP request parsing and header extraction (RFC 2326 §6).

use crate::error::{KgdError, Result};
use crate::status::Status;

use super::{PlayRequest, UserAgent};

/// RTSP methods the parser recognizes. Everything past TEARDOWN is
/// advertised as not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Options,
    Describe,
    Setup,
    Play,
    Pause,
    Teardown,
    Announce,
    Redirect,
    Record,
    GetParameter,
    SetParameter,
}

impl Method {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "OPTIONS" => Method::Options,
            "DESCRIBE" => Method::Describe,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "PAUSE" => Method::Pause,
            "TEARDOWN" => Method::Teardown,
            "ANNOUNCE" => Method::Announce,
            "REDIRECT" => Method::Redirect,
            "RECORD" => Method::Record,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            _ => return None,
        })
    }
}

/// A request URL broken into host, port, file identifier and optional
/// `tk=<track>` component.
#[derive(Debug, Clone)]
pub struct RtspUrl {
    pub host: String,
    pub port: u16,
    /// The file identifier: every path component except `tk=`.
    pub file: String,
    /// Track addressed by a `tk=<n>` path component, if any.
    pub track: Option<String>,
}

impl RtspUrl {
    /// Parse a decoded `rtsp://host[:port]/path` URL. `*` and other
    /// non-URL request targets come back with empty host and file.
    pub fn parse(url: &str) -> Self {
        let mut out = RtspUrl {
            host: String::new(),
            port: 554,
            file: String::new(),
            track: None,
        };
        let Some(rest) = url.strip_prefix("rtsp://") else {
            return out;
        };
        let (host_port, path) = match rest.split_once('/') {
            Some((hp, p)) => (hp, p),
            None => (rest, ""),
        };
        match host_port.split_once(':') {
            Some((host, port)) => {
                out.host = host.to_string();
                out.port = port.parse().unwrap_or(554);
            }
            None => out.host = host_port.to_string(),
        }
        let mut parts = Vec::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            match component.strip_prefix("tk=") {
                Some(track) => out.track = Some(track.to_string()),
                None => parts.push(component),
            }
        }
        out.file = parts.join("/");
        out
    }

    /// The canonical form used in `Content-Base` and `RTP-Info` headers.
    /// The default RTSP port stays implicit.
    pub fn to_url_string(&self) -> String {
        let mut s = if self.port == 554 {
            format!("rtsp://{}/{}", self.host, self.file)
        } else {
            format!("rtsp://{}:{}/{}", self.host, self.port, self.file)
        };
        if let Some(track) = &self.track {
            s.push_str("/tk=");
            s.push_str(track);
        }
        s
    }

    /// Same URL addressing a specific track.
    pub fn with_track(&self, track: &str) -> RtspUrl {
        let mut url = self.clone();
        url.track = Some(track.to_string());
        url
    }
}

/// Client transport alternative accepted during SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSpec {
    /// `RTP/AVP[/UDP];unicast;client_port=a-b`
    Udp { client_rtp: u16, client_rtcp: u16 },
    /// `RTP/AVP/TCP;interleaved=a-b`
    Interleaved { rtp: u8, rtcp: u8 },
}

/// A parsed RTSP request.
#[derive(Debug)]
pub struct RtspRequest {
    pub method: Method,
    pub url: RtspUrl,
    pub cseq: u32,
    headers: Vec<(String, String)>,
}

impl RtspRequest {
    /// Parse a complete request: request line, headers, trailing blank
    /// line. Managed errors carry the RTSP status the reply must use.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.lines();
        let request_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| KgdError::managed(Status::BAD_REQUEST, "empty request"))?;

        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(KgdError::managed(Status::BAD_REQUEST, "malformed request line"));
        };
        if version != "RTSP/1.0" {
            return Err(KgdError::managed(
                Status::VERSION_NOT_SUPPORTED,
                format!("version {version}"),
            ));
        }
        let method = Method::from_name(method).ok_or_else(|| {
            KgdError::managed(Status::NOT_IMPLEMENTED, format!("method {method}"))
        })?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some(colon) = line.find(':') else {
                return Err(KgdError::managed(Status::BAD_REQUEST, "malformed header"));
            };
            headers.push((
                line[..colon].trim().to_string(),
                line[colon + 1..].trim().to_string(),
            ));
        }

        let request = RtspRequest {
            method,
            url: RtspUrl::parse(&url_decode(target)),
            cseq: 0,
            headers,
        };
        let cseq = request
            .header("CSeq")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| KgdError::managed(Status::BAD_REQUEST, "missing CSeq"))?;
        Ok(RtspRequest { cseq, ..request })
    }

    /// Case-insensitive header lookup (RFC 2326 §4.2).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// `Session: <u32>`; its absence is a client error.
    pub fn session_id(&self) -> Result<u32> {
        let value = self
            .header("Session")
            .ok_or_else(|| KgdError::managed(Status::BAD_REQUEST, "missing Session header"))?;
        value
            .split(';')
            .next()
            .unwrap_or(value)
            .trim()
            .parse()
            .map_err(|_| KgdError::managed(Status::BAD_REQUEST, "malformed Session header"))
    }

    /// `Scale: [+-]<f>`, when present.
    pub fn scale(&self) -> Option<f64> {
        let value = self.header("Scale")?;
        value.trim().parse::<f64>().ok()
    }

    /// `Range: npt=<from>-[<to>]`. `now` maps to the open sentinel. A
    /// non-npt unit is not implemented.
    pub fn range(&self) -> Result<Option<(f64, f64)>> {
        let Some(value) = self.header("Range") else {
            return Ok(None);
        };
        let (unit, times) = value
            .split_once('=')
            .ok_or_else(|| KgdError::managed(Status::BAD_REQUEST, "malformed Range header"))?;
        if unit.trim() != "npt" {
            return Err(KgdError::managed(
                Status::NOT_IMPLEMENTED,
                format!("range unit {unit}"),
            ));
        }
        let (from, to) = times
            .split_once('-')
            .ok_or_else(|| KgdError::managed(Status::BAD_REQUEST, "malformed Range header"))?;
        let from = match from.trim() {
            "now" => f64::INFINITY,
            t => t
                .parse()
                .map_err(|_| KgdError::managed(Status::BAD_REQUEST, "malformed Range start"))?,
        };
        let to = match to.trim() {
            "" => f64::INFINITY,
            t => t
                .parse()
                .map_err(|_| KgdError::managed(Status::BAD_REQUEST, "malformed Range end"))?,
        };
        Ok(Some((from, to)))
    }

    /// Combined `Range`/`Scale` view of a PLAY or PAUSE request.
    pub fn play_request(&self) -> Result<PlayRequest> {
        let mut rq = PlayRequest::new();
        if let Some(speed) = self.scale() {
            rq.speed = speed;
            rq.has_scale = true;
        }
        if let Some((from, to)) = self.range()? {
            rq.from = from;
            rq.to = to;
            rq.has_range = true;
        }
        Ok(rq)
    }

    /// Recognized client software.
    pub fn user_agent(&self) -> UserAgent {
        self.header("User-Agent")
            .map(UserAgent::from_header)
            .unwrap_or(UserAgent::Generic)
    }

    /// A `Require:` header names extensions this server does not have.
    pub fn check_require(&self) -> Result<()> {
        match self.header("Require") {
            Some(feature) => Err(KgdError::managed(
                Status::OPTION_NOT_SUPPORTED,
                format!("required option {feature}"),
            )),
            None => Ok(()),
        }
    }

    /// An `Accept:` header must list `application/sdp`; no other
    /// description format exists here.
    pub fn check_accept(&self) -> Result<()> {
        let Some(accept) = self.header("Accept") else {
            return Ok(());
        };
        if accept
            .split(',')
            .any(|mime| mime.trim() == "application/sdp")
        {
            Ok(())
        } else {
            Err(KgdError::managed(
                Status::NOT_IMPLEMENTED,
                format!("acceptable types {accept}"),
            ))
        }
    }

    /// Choose the first acceptable alternative from the `Transport:`
    /// header, with the client's optional `ssrc=<hex>` hint.
    pub fn transport(&self) -> Result<(TransportSpec, Option<u32>)> {
        let value = self
            .header("Transport")
            .ok_or_else(|| KgdError::managed(Status::BAD_REQUEST, "missing Transport header"))?;

        for alternative in value.split(',') {
            let parts: Vec<&str> = alternative.split(';').map(str::trim).collect();
            let Some(&proto) = parts.first() else {
                continue;
            };
            let ssrc = parts
                .iter()
                .find_map(|p| p.strip_prefix("ssrc="))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok());

            match proto {
                "RTP/AVP" | "RTP/AVP/UDP" => {
                    if !parts.contains(&"unicast") {
                        tracing::warn!(alternative, "skipping non-unicast transport");
                        continue;
                    }
                    let Some((rtp, rtcp)) = port_pair(&parts, "client_port=") else {
                        tracing::warn!(alternative, "no client_port in transport");
                        continue;
                    };
                    return Ok((
                        TransportSpec::Udp {
                            client_rtp: rtp,
                            client_rtcp: rtcp,
                        },
                        ssrc,
                    ));
                }
                "RTP/AVP/TCP" => {
                    let Some((rtp, rtcp)) = port_pair(&parts, "interleaved=") else {
                        tracing::warn!(alternative, "no interleaved pair in transport");
                        continue;
                    };
                    if rtp > u8::MAX as u16 || rtcp > u8::MAX as u16 {
                        continue;
                    }
                    return Ok((
                        TransportSpec::Interleaved {
                            rtp: rtp as u8,
                            rtcp: rtcp as u8,
                        },
                        ssrc,
                    ));
                }
                other => {
                    tracing::warn!(transport = other, "skipping unsupported transport");
                }
            }
        }
        Err(KgdError::managed(
            Status::UNSUPPORTED_TRANSPORT,
            "no acceptable transport alternative",
        ))
    }
}

fn port_pair(parts: &[&str], key: &str) -> Option<(u16, u16)> {
    let spec = parts.iter().find_map(|p| p.strip_prefix(key))?;
    let (a, b) = spec.split_once('-')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// Percent-decode a URL.
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16)
        {
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Minimal response recognition: status code and CSeq. The connection
/// stashes these without further interpretation.
pub fn parse_response(raw: &str) -> Result<(u16, u32)> {
    let mut lines = raw.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| KgdError::managed(Status::BAD_REQUEST, "empty response"))?;
    let mut parts = status_line.split_whitespace();
    let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
        return Err(KgdError::managed(Status::BAD_REQUEST, "malformed status line"));
    };
    if !version.starts_with("RTSP/") {
        return Err(KgdError::managed(Status::BAD_REQUEST, "not a response"));
    }
    let code: u16 = code
        .parse()
        .map_err(|_| KgdError::managed(Status::BAD_REQUEST, "malformed status code"))?;
    let cseq = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("CSeq"))
        .and_then(|(_, v)| v.trim().parse().ok())
        .ok_or_else(|| KgdError::managed(Status::BAD_REQUEST, "response without CSeq"))?;
    Ok((code, cseq))
}
