//! Framing and message types for the threatd unix sockets.
//!
//! Every socket the daemon owns speaks the same framing: a 4-byte big-endian
//! length followed by a JSON document.
//!
//! ```text
//! +----------------+------------------+
//! | length (4 BE)  |  JSON payload    |
//! +----------------+------------------+
//! ```
//!
//! Control commands are wrapped in an [`Envelope`] so that replies can be
//! correlated; the high-volume scan sockets exchange bare messages.
//!
//! ```rust
//! use threatd_protocol::{ControlCode, ControlRequest, Envelope, decode_message, encode_message};
//!
//! let request = Envelope::new("req-1", ControlRequest::new(ControlCode::Reload));
//! let bytes = encode_message(&request).unwrap();
//! let decoded: Envelope<ControlRequest> = decode_message(&bytes).unwrap();
//! assert_eq!(decoded.payload.command(), Some(ControlCode::Reload));
//! ```

mod error;
mod framing;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FrameReader, FrameWriter, decode_message, encode_message};
pub use types::{
    ControlCode, ControlRequest, ControlResponse, Envelope, MetadataRescanRequest,
    MetadataRescanResponse, RescanRequest, ScanRequest, ScanResponse, ThreatReport,
    UpdateComplete, Verdict,
};

/// Protocol version constant.
pub const PROTOCOL_VERSION: &str = "1";

/// Maximum frame payload (64 KiB). Messages only carry paths and digests.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024;
