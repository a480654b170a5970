//! Negotiated media descriptions.
//!
//! A [`Media`] is one `m=` section of the session description agreed on
//! during DESCRIBE/ANNOUNCE and SETUP. It carries the list of [`Format`]s
//! (payload types) that may appear in its RTP stream.
//!
//! ## Payload types (RFC 3551)
//!
//! | Range | Meaning |
//! |-------|---------|
//! | 0–95 | Static assignments (e.g. 0 = PCMU, 8 = PCMA, 26 = JPEG) |
//! | 96–127 | Dynamic, bound by `a=rtpmap` |
//!
//! Payload types are 7-bit; anything above 127 cannot appear on the wire.

use std::fmt;

/// Kind of a media section (`m=<kind> ...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Application,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::Application => write!(f, "application"),
        }
    }
}

/// One codec entry of a media section, identified by its RTP payload type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    payload_type: u8,
    encoding: String,
    clock_rate: u32,
}

impl Format {
    /// Create a format. The payload type is masked to 7 bits.
    pub fn new(payload_type: u8, encoding: &str, clock_rate: u32) -> Self {
        Self {
            payload_type: payload_type & 0x7f,
            encoding: encoding.to_string(),
            clock_rate,
        }
    }

    /// RTP payload type (RFC 3551).
    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    /// Encoding name from `a=rtpmap` (e.g. `"H264"`).
    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// RTP clock rate in Hz.
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }
}

/// A negotiated media section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    kind: MediaKind,
    control: String,
    formats: Vec<Format>,
}

impl Media {
    pub fn new(kind: MediaKind, control: &str, formats: Vec<Format>) -> Self {
        Self {
            kind,
            control: control.to_string(),
            formats,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Value of the `a=control` attribute (e.g. `"trackID=0"`).
    pub fn control(&self) -> &str {
        &self.control
    }

    pub fn formats(&self) -> &[Format] {
        &self.formats
    }

    /// Look up a format by payload type.
    pub fn format(&self, payload_type: u8) -> Option<&Format> {
        self.formats
            .iter()
            .find(|format| format.payload_type == payload_type)
    }
}
