//! RTSP response building (RFC 2326 §7).

use crate::clock;
use crate::status::Status;

/// An outgoing RTSP response.
///
/// Builder-style: chain [`header`](Self::header) and
/// [`body`](Self::body), then [`serialize`](Self::serialize).
/// `Content-Length` is computed automatically when a body is present.
#[must_use]
pub struct RtspResponse {
    pub status: Status,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

impl RtspResponse {
    pub fn new(status: Status) -> Self {
        RtspResponse {
            status,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(Status::OK)
    }

    /// The terse error reply used by the connection's failure path.
    pub fn error(status: Status, cseq: u32, server: &str) -> Self {
        Self::new(status).cseq(cseq).server(server)
    }

    pub fn header(mut self, name: &str, value: impl std::fmt::Display) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn cseq(self, cseq: u32) -> Self {
        self.header("CSeq", cseq)
    }

    pub fn server(self, name: &str) -> Self {
        self.header("Server", name)
    }

    /// RFC 1123 `Date:` header stamped with the current wall clock.
    pub fn date(self) -> Self {
        self.header("Date", clock::http_date(clock::now()))
    }

    pub fn body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize to the wire format.
    pub fn serialize(&self) -> String {
        let mut out = format!(
            "RTSP/1.0 {} {}\r\n",
            self.status.code(),
            self.status.reason()
        );
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        match &self.body {
            Some(body) => {
                out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
                out.push_str(body);
            }
            None => out.push_str("\r\n"),
        }
        out
    }
}
