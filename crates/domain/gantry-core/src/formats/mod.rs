use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Older protocol variant: resources wrapped in a status envelope where a
/// non-zero `status` is an application-level error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: i32,
    #[serde(default)]
    pub status_message: String,
    pub data: Option<T>,
}

/// Decode a response body that is either a bare JSON value of the resource's
/// schema or the legacy `{status, status_message, data}` envelope.
///
/// Some servers prepend a UTF-8 BOM or whitespace; both are stripped before
/// parsing.
pub fn decode_body<T: DeserializeOwned>(body: &str) -> Result<T> {
    let trimmed = body.trim_start_matches('\u{feff}').trim();

    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Ok(value);
    }

    let envelope: Envelope<T> = serde_json::from_str(trimmed)
        .map_err(|e| anyhow::anyhow!("unrecognized response body: {e}"))?;

    if envelope.status != 0 {
        anyhow::bail!(
            "server reported application error {}: {}",
            envelope.status,
            envelope.status_message
        );
    }

    envelope
        .data
        .ok_or_else(|| anyhow::anyhow!("envelope with status 0 but no data"))
}
