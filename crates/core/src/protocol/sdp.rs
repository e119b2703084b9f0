//! SDP session descriptions for DESCRIBE replies (RFC 4566).

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;

use crate::clock;
use crate::config::Config;
use crate::media::{Container, Medium};

/// Build the SDP document for a container as seen from `host`.
///
/// `session_name` overrides the container description in the `s=` line;
/// DESCRIBE passes `None`, a description generated for an existing session
/// names it `Session #<id>`.
pub fn describe(
    container: &Container,
    config: &Config,
    host: &str,
    session_name: Option<&str>,
) -> String {
    let now = clock::now();
    let duration = container.duration();
    let end = if duration.is_finite() {
        clock::ntp_secs(now) + duration.round() as u64
    } else {
        clock::ntp_secs(now)
    };

    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!(
        "o=- {} {} IN IP4 {}\r\n",
        clock::ntp_secs(now),
        end,
        host
    ));
    let name = session_name
        .map(str::to_string)
        .unwrap_or_else(|| container.description());
    sdp.push_str(&format!("s={}\r\n", name));
    sdp.push_str(&format!("c=IN IP4 {}\r\n", host));
    sdp.push_str("t=0 0\r\n");
    sdp.push_str("a=type:broadcast\r\n");
    sdp.push_str(&format!("a=tool:{}\r\n", config.server_name));
    if config.aggregate_control {
        sdp.push_str("a=control:*\r\n");
    }
    if config.support_seek && !container.is_live_cast() && duration.is_finite() {
        sdp.push_str(&format!("a=range:npt=0-{:.3}\r\n", duration));
    } else {
        sdp.push_str("a=range:npt=0-\r\n");
    }
    for medium in container.media() {
        sdp.push_str(&medium_block(&medium));
    }
    sdp
}

fn medium_block(medium: &Medium) -> String {
    let mut block = String::new();
    block.push_str(&format!(
        "m={} 0 RTP/AVP {}\r\n",
        medium.kind().sdp_name(),
        medium.payload_type()
    ));
    let mut rtpmap = format!(
        "a=rtpmap:{} {}/{}",
        medium.payload_type(),
        medium.codec(),
        medium.rate()
    );
    if let Some(channels) = medium.channels() {
        rtpmap.push_str(&format!("/{}", channels));
    }
    block.push_str(&rtpmap);
    block.push_str("\r\n");
    if !medium.extradata().is_empty() {
        // H.264 wants base64 parameter sets (RFC 6184 §8.1); other codecs
        // take their extradata hex-encoded in `config`
        if medium.codec() == "H264" {
            block.push_str(&format!(
                "a=fmtp:{} packetization-mode=1;sprop-parameter-sets={}\r\n",
                medium.payload_type(),
                BASE64_STANDARD.encode(medium.extradata())
            ));
        } else {
            block.push_str(&format!(
                "a=fmtp:{} config={}\r\n",
                medium.payload_type(),
                hex::encode_upper(medium.extradata())
            ));
        }
    }
    block.push_str(&format!("a=control:tk={}\r\n", medium.index()));
    block
}
