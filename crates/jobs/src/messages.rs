//! Job status frame parser.
//!
//! The push channel and the polling endpoint both carry the flat
//! [`JobUpdate`] JSON object. This module is the single place frames are
//! decoded so both transports agree on what counts as malformed.

use lumina_core::types::JobUpdate;

/// Parse a raw status frame into a [`JobUpdate`].
///
/// Returns `Err` for malformed JSON, a missing `status`, or an unknown
/// status value. Callers should log and keep waiting for the next frame.
pub fn parse_update(text: &str) -> Result<JobUpdate, serde_json::Error> {
    serde_json::from_str(text)
}
