//! End-to-end RTSP flow: OPTIONS → DESCRIBE → SETUP → PLAY → PAUSE →
//! PLAY → TEARDOWN against a real server on the loopback, with a
//! synthetic demuxer feeding deterministic media.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Once};
use std::time::Duration;

use kgd::media::{
    DemuxPacket, Demuxer, DemuxerFactory, MediaKind, MediumSpec, MemoryDemuxer,
    set_demuxer_factory,
};
use kgd::rtp::RtpHeader;
use kgd::{Config, Server};

/// Serves any path ending in `clip.mp4` as a 10-second clip with one video
/// track (pt 96) and one audio track (pt 14), and any `/dev/video*` path as
/// an open-ended single-video-track capture source.
struct ClipFactory;

impl DemuxerFactory for ClipFactory {
    fn open(&self, path: &str, live: bool) -> kgd::Result<Box<dyn Demuxer>> {
        if path.starts_with("/dev/video") {
            assert!(live, "device paths must open live");
            let streams = vec![MediumSpec {
                kind: MediaKind::Video,
                payload_type: 96,
                clock_rate: 90_000,
                index: 0,
                codec: "MP4V-ES".into(),
                ..MediumSpec::default()
            }];
            let packets = (0..50)
                .map(|i| DemuxPacket {
                    stream: 0,
                    time: i as f64 / 20.0,
                    is_key: i % 10 == 0,
                    data: vec![0xB6, i as u8],
                })
                .collect();
            return Ok(Box::new(MemoryDemuxer::new(streams, packets, 0.0, 0)));
        }
        if !path.ends_with("clip.mp4") {
            return Err(kgd::KgdError::NotFound(path.to_string()));
        }
        let streams = vec![
            MediumSpec {
                kind: MediaKind::Video,
                payload_type: 96,
                clock_rate: 90_000,
                index: 0,
                codec: "MP4V-ES".into(),
                extradata: vec![0x00, 0x00, 0x01, 0xB0],
                ..MediumSpec::default()
            },
            MediumSpec {
                kind: MediaKind::Audio,
                payload_type: 14,
                clock_rate: 90_000,
                index: 1,
                codec: "MPA".into(),
                channels: Some(2),
                ..MediumSpec::default()
            },
        ];
        let mut packets = Vec::new();
        for i in 0..100 {
            packets.push(DemuxPacket {
                stream: 0,
                time: i as f64 * 0.1,
                is_key: i % 10 == 0,
                data: vec![0xB6, i as u8],
            });
        }
        for i in 0..200 {
            packets.push(DemuxPacket {
                stream: 1,
                time: i as f64 * 0.05,
                is_key: true,
                data: vec![0xA0, i as u8],
            });
        }
        Ok(Box::new(MemoryDemuxer::new(streams, packets, 10.0, 500_000)))
    }
}

static INIT: Once = Once::new();

fn start_server(port: u16) -> Server {
    INIT.call_once(|| {
        set_demuxer_factory(Arc::new(ClipFactory));
    });

    let dir = std::env::temp_dir().join(format!("kgd-it-{port}"));
    std::fs::create_dir_all(&dir).unwrap();
    // the URL check wants the file on disk; content comes from the demuxer
    std::fs::write(dir.join("clip.mp4"), b"stub").unwrap();

    let mut config = Config::default();
    config.host = "127.0.0.1".into();
    config.port = port;
    config.server_name = "test-kgd/1".into();
    config.base_dir = format!("{}/", dir.display());
    config.read_timeout = 0.2;

    let mut server = Server::new(config);
    server.start().expect("server start");
    server
}

fn connect(port: u16) -> TcpStream {
    let addr = format!("127.0.0.1:{port}")
        .to_socket_addrs()
        .unwrap()
        .next()
        .unwrap();
    let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    stream
}

fn rtsp_request(stream: &mut TcpStream, request: &str) -> String {
    stream.write_all(request.as_bytes()).unwrap();
    stream.flush().unwrap();

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut response = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap() == 0 {
            break;
        }
        response.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }
    if let Some(len) = response
        .lines()
        .find(|l| l.to_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
        && len > 0
    {
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).unwrap();
        response.push_str(&String::from_utf8_lossy(&body));
    }
    response
}

fn header_value<'a>(response: &'a str, name: &str) -> &'a str {
    response
        .lines()
        .find(|l| l.to_lowercase().starts_with(&format!("{}:", name.to_lowercase())))
        .and_then(|l| l.split_once(':'))
        .map(|(_, v)| v.trim())
        .unwrap_or_else(|| panic!("missing {name} header in:\n{response}"))
}

#[test]
fn full_udp_session_flow() {
    let mut server = start_server(18554);
    let mut stream = connect(18554);
    let base = "rtsp://127.0.0.1:18554/clip.mp4";

    // OPTIONS
    let resp = rtsp_request(
        &mut stream,
        &format!("OPTIONS {base} RTSP/1.0\r\nCSeq: 1\r\n\r\n"),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
    assert_eq!(header_value(&resp, "CSeq"), "1");
    assert_eq!(header_value(&resp, "Server"), "test-kgd/1");
    assert_eq!(
        header_value(&resp, "Public"),
        "OPTIONS,DESCRIBE,SETUP,PLAY,PAUSE,TEARDOWN"
    );
    assert_eq!(header_value(&resp, "Accept-Charset"), "ISO-8859-1;q=1");

    // DESCRIBE
    let resp = rtsp_request(
        &mut stream,
        &format!("DESCRIBE {base} RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n"),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
    assert_eq!(header_value(&resp, "Content-Type"), "application/sdp");
    assert!(header_value(&resp, "Content-Base").contains("clip.mp4"));
    assert!(resp.contains("a=range:npt=0-10.000"));
    assert!(resp.contains("m=video 0 RTP/AVP 96"));
    assert!(resp.contains("m=audio 0 RTP/AVP 14"));
    assert!(resp.contains("a=control:tk=0"));
    assert!(resp.contains("a=control:tk=1"));

    // SETUP tk=0 over UDP
    let rtp_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let rtcp_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    rtp_sock
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    rtcp_sock
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let resp = rtsp_request(
        &mut stream,
        &format!(
            "SETUP {base}/tk=0 RTSP/1.0\r\nCSeq: 3\r\n\
             Transport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
            rtp_sock.local_addr().unwrap().port(),
            rtcp_sock.local_addr().unwrap().port()
        ),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
    let session_id: u32 = header_value(&resp, "Session")
        .split(';')
        .next()
        .unwrap()
        .parse()
        .expect("numeric session id");
    assert_ne!(session_id, 0);
    let transport = header_value(&resp, "Transport");
    assert!(transport.starts_with("RTP/AVP;unicast;"), "{transport}");
    assert!(transport.contains("source=127.0.0.1"));
    assert!(transport.contains("destination=127.0.0.1"));
    assert!(transport.contains(&format!(
        "client_port={}-{}",
        rtp_sock.local_addr().unwrap().port(),
        rtcp_sock.local_addr().unwrap().port()
    )));
    assert!(transport.contains("server_port="));
    let ssrc_hex = transport
        .split("ssrc=")
        .nth(1)
        .expect("ssrc in transport")
        .trim();
    assert_eq!(ssrc_hex.len(), 8, "ssrc must be 8 hex digits");
    let ssrc = u32::from_str_radix(ssrc_hex, 16).unwrap();

    // PLAY with an explicit range
    let resp = rtsp_request(
        &mut stream,
        &format!(
            "PLAY {base} RTSP/1.0\r\nCSeq: 4\r\nSession: {session_id}\r\n\
             Range: npt=0.000-5.000\r\nScale: 1.0\r\n\r\n"
        ),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
    assert_eq!(header_value(&resp, "Range"), "npt=0.000-5.000");
    assert_eq!(header_value(&resp, "Scale"), "1.000");
    let rtp_info = header_value(&resp, "RTP-Info");
    assert!(rtp_info.contains("url="));
    assert!(rtp_info.contains("seq="));
    assert!(rtp_info.contains("rtptime="));
    let announced_seq: u16 = rtp_info
        .split("seq=")
        .nth(1)
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .parse()
        .unwrap();

    // media flows: sequences count up from the announced start
    let mut buf = [0u8; 2048];
    let mut last_seq = None;
    for i in 0..3 {
        let n = rtp_sock.recv(&mut buf).expect("RTP packet");
        let header = RtpHeader::parse(&buf[..n]).expect("RTP header");
        assert_eq!(header.ssrc, ssrc);
        assert_eq!(header.payload_type, 96);
        if i == 0 {
            assert_eq!(header.sequence, announced_seq);
        }
        if let Some(prev) = last_seq {
            assert_eq!(header.sequence, u16::wrapping_add(prev, 1));
        }
        last_seq = Some(header.sequence);
    }

    // PAUSE quiets the stream
    let resp = rtsp_request(
        &mut stream,
        &format!("PAUSE {base} RTSP/1.0\r\nCSeq: 5\r\nSession: {session_id}\r\n\r\n"),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
    rtp_sock
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    while rtp_sock.recv(&mut buf).is_ok() {}
    assert!(rtp_sock.recv(&mut buf).is_err(), "no RTP while paused");

    // PLAY without Range/Scale resumes where it left off
    let resp = rtsp_request(
        &mut stream,
        &format!("PLAY {base} RTSP/1.0\r\nCSeq: 6\r\nSession: {session_id}\r\n\r\n"),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
    rtp_sock
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let n = rtp_sock.recv(&mut buf).expect("RTP after resume");
    let resumed = RtpHeader::parse(&buf[..n]).unwrap();
    let advance = resumed.sequence.wrapping_sub(last_seq.unwrap());
    assert!(
        (1..u16::MAX / 2).contains(&advance),
        "sequence keeps increasing across a pause"
    );

    // TEARDOWN stops everything and says goodbye on RTCP
    let resp = rtsp_request(
        &mut stream,
        &format!("TEARDOWN {base} RTSP/1.0\r\nCSeq: 7\r\nSession: {session_id}\r\n\r\n"),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");

    let mut saw_bye = false;
    let mut rtcp_buf = [0u8; 2048];
    while let Ok(n) = rtcp_sock.recv(&mut rtcp_buf) {
        let (packets, _) = kgd::rtcp::packets::parse_buffer(&rtcp_buf[..n]);
        if packets
            .iter()
            .any(|p| matches!(p, kgd::rtcp::RtcpPacket::Bye(_)))
        {
            saw_bye = true;
            break;
        }
    }
    assert!(saw_bye, "RTCP BYE expected on teardown");

    rtp_sock
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    while rtp_sock.recv(&mut buf).is_ok() {}
    assert!(rtp_sock.recv(&mut buf).is_err(), "no RTP after teardown");

    server.stop();
}

/// Request/response over one persistent reader, so interleave records
/// buffered alongside a reply are not lost between calls.
fn rtsp_request_on(
    stream: &mut TcpStream,
    reader: &mut BufReader<TcpStream>,
    request: &str,
) -> String {
    stream.write_all(request.as_bytes()).unwrap();
    stream.flush().unwrap();

    let mut response = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap() == 0 {
            break;
        }
        response.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }
    response
}

#[test]
fn interleaved_setup_and_play() {
    let mut server = start_server(18555);
    let mut stream = connect(18555);
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let base = "rtsp://127.0.0.1:18555/clip.mp4";

    let resp = rtsp_request_on(
        &mut stream,
        &mut reader,
        &format!("DESCRIBE {base} RTSP/1.0\r\nCSeq: 1\r\n\r\n"),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
    // drain the SDP body so the next reply starts clean
    if let Some(len) = resp
        .lines()
        .find(|l| l.to_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).unwrap();
    }

    let resp = rtsp_request_on(
        &mut stream,
        &mut reader,
        &format!(
            "SETUP {base}/tk=0 RTSP/1.0\r\nCSeq: 2\r\n\
             Transport: RTP/AVP/TCP;interleaved=0-1\r\n\r\n"
        ),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
    let session_id = header_value(&resp, "Session")
        .split(';')
        .next()
        .unwrap()
        .to_string();
    let transport = header_value(&resp, "Transport");
    assert!(transport.starts_with("RTP/AVP/TCP;"), "{transport}");
    assert!(transport.contains("interleaved=0-1"));

    let resp = rtsp_request_on(
        &mut stream,
        &mut reader,
        &format!(
            "PLAY {base} RTSP/1.0\r\nCSeq: 3\r\nSession: {session_id}\r\n\
             Range: npt=0.000-\r\n\r\n"
        ),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");

    // RTP and RTCP arrive as $-framed records on this very socket
    let mut saw_rtp = false;
    for _ in 0..10 {
        let mut head = [0u8; 4];
        reader.read_exact(&mut head).expect("interleave header");
        assert_eq!(head[0], b'$');
        let len = u16::from_be_bytes([head[2], head[3]]) as usize;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).expect("interleave payload");
        if head[1] == 0 {
            let header = RtpHeader::parse(&payload).expect("framed RTP");
            assert_eq!(header.payload_type, 96);
            saw_rtp = true;
            break;
        }
    }
    assert!(saw_rtp, "expected an interleaved RTP record");

    let _ = stream.write_all(
        format!("TEARDOWN {base} RTSP/1.0\r\nCSeq: 4\r\nSession: {session_id}\r\n\r\n").as_bytes(),
    );

    server.stop();
}

/// A first PLAY with only a `Session:` header must still spawn the send
/// loops: the defaults (`from=0.0`, `speed=1.0`) apply, not an unpause
/// no-op.
#[test]
fn bare_first_play_starts_media() {
    let mut server = start_server(18557);
    let mut stream = connect(18557);
    let base = "rtsp://127.0.0.1:18557/clip.mp4";

    let resp = rtsp_request(
        &mut stream,
        &format!("DESCRIBE {base} RTSP/1.0\r\nCSeq: 1\r\n\r\n"),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");

    let rtp_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let rtcp_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    rtp_sock
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let resp = rtsp_request(
        &mut stream,
        &format!(
            "SETUP {base}/tk=0 RTSP/1.0\r\nCSeq: 2\r\n\
             Transport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
            rtp_sock.local_addr().unwrap().port(),
            rtcp_sock.local_addr().unwrap().port()
        ),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
    let session_id = header_value(&resp, "Session")
        .split(';')
        .next()
        .unwrap()
        .to_string();

    // no Range, no Scale
    let resp = rtsp_request(
        &mut stream,
        &format!("PLAY {base} RTSP/1.0\r\nCSeq: 3\r\nSession: {session_id}\r\n\r\n"),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
    assert_eq!(header_value(&resp, "Range"), "npt=0.000-");
    assert_eq!(header_value(&resp, "Scale"), "1.000");
    let announced_seq: u16 = header_value(&resp, "RTP-Info")
        .split("seq=")
        .nth(1)
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .parse()
        .unwrap();

    let mut buf = [0u8; 2048];
    let n = rtp_sock.recv(&mut buf).expect("media must flow on a bare PLAY");
    let header = RtpHeader::parse(&buf[..n]).expect("RTP header");
    assert_eq!(header.sequence, announced_seq);
    assert_eq!(header.payload_type, 96);

    let resp = rtsp_request(
        &mut stream,
        &format!("TEARDOWN {base} RTSP/1.0\r\nCSeq: 4\r\nSession: {session_id}\r\n\r\n"),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");

    server.stop();
}

/// Live clients cannot seek, so a plain PLAY on a capture device must start
/// the stream.
#[test]
fn bare_play_on_live_cast_flows() {
    let mut server = start_server(18558);
    let mut stream = connect(18558);
    let base = "rtsp://127.0.0.1:18558/dev.video0";

    let resp = rtsp_request(
        &mut stream,
        &format!("DESCRIBE {base} RTSP/1.0\r\nCSeq: 1\r\n\r\n"),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
    // open-ended range: live casts have no bounded duration
    assert!(resp.contains("a=range:npt=0-\r\n"), "{resp}");

    let rtp_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let rtcp_sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    rtp_sock
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let resp = rtsp_request(
        &mut stream,
        &format!(
            "SETUP {base}/tk=0 RTSP/1.0\r\nCSeq: 2\r\n\
             Transport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
            rtp_sock.local_addr().unwrap().port(),
            rtcp_sock.local_addr().unwrap().port()
        ),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");
    let session_id = header_value(&resp, "Session")
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let resp = rtsp_request(
        &mut stream,
        &format!("PLAY {base} RTSP/1.0\r\nCSeq: 3\r\nSession: {session_id}\r\n\r\n"),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");

    let mut buf = [0u8; 2048];
    let n = rtp_sock
        .recv(&mut buf)
        .expect("live media must flow on a bare PLAY");
    let header = RtpHeader::parse(&buf[..n]).expect("RTP header");
    assert_eq!(header.payload_type, 96);

    let resp = rtsp_request(
        &mut stream,
        &format!("TEARDOWN {base} RTSP/1.0\r\nCSeq: 4\r\nSession: {session_id}\r\n\r\n"),
    );
    assert!(resp.starts_with("RTSP/1.0 200 OK\r\n"), "{resp}");

    server.stop();
}

#[test]
fn protocol_errors_are_terse_replies() {
    let mut server = start_server(18556);
    let mut stream = connect(18556);
    let base = "rtsp://127.0.0.1:18556";

    // unknown file
    let resp = rtsp_request(
        &mut stream,
        &format!("DESCRIBE {base}/nope.mp4 RTSP/1.0\r\nCSeq: 1\r\n\r\n"),
    );
    assert!(resp.starts_with("RTSP/1.0 404 Not Found\r\n"), "{resp}");

    // PLAY without a session
    let resp = rtsp_request(
        &mut stream,
        &format!("PLAY {base}/clip.mp4 RTSP/1.0\r\nCSeq: 2\r\nSession: 99\r\n\r\n"),
    );
    assert!(
        resp.starts_with("RTSP/1.0 454 Session Not Found\r\n"),
        "{resp}"
    );

    // unsupported transport
    let resp = rtsp_request(
        &mut stream,
        &format!(
            "SETUP {base}/clip.mp4/tk=0 RTSP/1.0\r\nCSeq: 3\r\n\
             Transport: RTP/AVP;multicast;port=3456-3457\r\n\r\n"
        ),
    );
    assert!(
        resp.starts_with("RTSP/1.0 461 Unsupported transport\r\n"),
        "{resp}"
    );

    // Require header names an extension this server lacks
    let resp = rtsp_request(
        &mut stream,
        &format!(
            "DESCRIBE {base}/clip.mp4 RTSP/1.0\r\nCSeq: 4\r\nRequire: fancy-feature\r\n\r\n"
        ),
    );
    assert!(
        resp.starts_with("RTSP/1.0 551 Option not supported\r\n"),
        "{resp}"
    );

    // unknown method
    let resp = rtsp_request(
        &mut stream,
        &format!("RECORD {base}/clip.mp4 RTSP/1.0\r\nCSeq: 5\r\n\r\n"),
    );
    assert!(
        resp.starts_with("RTSP/1.0 501 Not Implemented\r\n"),
        "{resp}"
    );

    server.stop();
}
