//! `.kls` playlist files.
//!
//! Line-oriented: an optional first-line `loop` header, then one media file
//! name per line.
//!
//! ```text
//! loop 2
//! intro.mp4
//! feature.mp4
//! ```
//!
//! `loop` alone means forever; `loop N` runs N iterations (1..=999). A loop
//! declaration on any later line is logged and ignored.

use std::fs;
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Playlist {
    /// Iterations to run; 0 means forever.
    loops: u16,
    media: Vec<String>,
}

impl Playlist {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut loops = 1u16;
        let mut media = Vec::new();

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if line == "loop" {
                if line_no > 0 {
                    tracing::warn!(line_no, "ignoring loop declaration past the header line");
                } else {
                    loops = 0;
                }
                continue;
            }
            if let Some(count) = line.strip_prefix("loop ") {
                match count.trim().parse::<u16>() {
                    Ok(n @ 1..=999) if line_no == 0 => loops = n,
                    Ok(_) if line_no > 0 => {
                        tracing::warn!(line_no, "ignoring loop declaration past the header line")
                    }
                    _ => tracing::warn!(line_no, count, "invalid loop count"),
                }
                continue;
            }
            media.push(line.to_string());
        }

        Playlist { loops, media }
    }

    /// Iterations to run; 0 means forever.
    pub fn loops(&self) -> u16 {
        self.loops
    }

    pub fn media(&self) -> &[String] {
        &self.media
    }
}
