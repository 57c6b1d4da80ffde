use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

/// Failure to decode a snapshot data URI.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataUriError {
    /// No `,` separating the metadata from the payload.
    #[error("data URI has no payload separator")]
    MissingSeparator,
    /// Only base64 payloads are produced by the clients.
    #[error("data URI payload is not base64-encoded")]
    NotBase64,
    /// Payload failed to decode.
    #[error("invalid base64 payload: {0}")]
    Decode(String),
}

/// Decodes a `data:<mime>;base64,<payload>` string into raw bytes.
///
/// The metadata part is split at the last comma, so payloads never contain
/// one while metadata might.
pub fn decode_data_uri(data: &str) -> Result<Vec<u8>, DataUriError> {
    let (meta, encoded) = data.rsplit_once(',').ok_or(DataUriError::MissingSeparator)?;
    if !meta.ends_with(";base64") {
        return Err(DataUriError::NotBase64);
    }
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| DataUriError::Decode(e.to_string()))
}
