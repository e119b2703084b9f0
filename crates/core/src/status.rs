//! RTSP status codes (RFC 2326 §7.1.1).

use std::fmt;

/// An RTSP status code with its canonical reason phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u16);

impl Status {
    pub const OK: Status = Status(200);
    pub const BAD_REQUEST: Status = Status(400);
    pub const NOT_FOUND: Status = Status(404);
    pub const SESSION_NOT_FOUND: Status = Status(454);
    pub const METHOD_NOT_VALID: Status = Status(455);
    pub const HEADER_FIELD_NOT_VALID: Status = Status(456);
    pub const INVALID_RANGE: Status = Status(457);
    pub const PARAMETER_READ_ONLY: Status = Status(458);
    pub const AGGREGATE_NOT_ALLOWED: Status = Status(459);
    pub const AGGREGATE_ONLY: Status = Status(460);
    pub const UNSUPPORTED_TRANSPORT: Status = Status(461);
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);
    pub const NOT_IMPLEMENTED: Status = Status(501);
    pub const VERSION_NOT_SUPPORTED: Status = Status(505);
    pub const OPTION_NOT_SUPPORTED: Status = Status(551);

    pub fn code(&self) -> u16 {
        self.0
    }

    /// Canonical reason phrase for this code.
    pub fn reason(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            454 => "Session Not Found",
            455 => "Method Not Valid in This State",
            456 => "Header Field Not Valid for Resource",
            457 => "Invalid Range",
            458 => "Parameter Is Read-Only",
            459 => "Aggregate operation not allowed",
            460 => "Only aggregate operation allowed",
            461 => "Unsupported transport",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            505 => "RTSP Version not supported",
            551 => "Option not supported",
            _ => "Unknown",
        }
    }

    /// Whether this status signals a failure (200 OK does not).
    pub fn is_error(&self) -> bool {
        self.0 != 200
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason())
    }
}
