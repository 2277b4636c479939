//! Bearer-token handling: decode the claims payload and resolve the
//! effective upload parameters from claims plus operator overrides.
//!
//! The token is never verified cryptographically here; the ingestion
//! service does that. The client only needs the claims.

use crate::{Error, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use serde_json::Value;
use std::{fs, path::Path};

pub const CLAIM_PUBLIC_KEY: &str = "x-public-key";
pub const CLAIM_UPLOAD_SERVER: &str = "x-upload-server";
pub const CLAIM_PROJECT_UUID: &str = "x-uuid-project";
pub const CLAIM_CHALLENGE: &str = "x-challenge";
pub const CLAIM_EXPIRY: &str = "exp";

/// The decoded claims object. Immutable after parse; decode once and pass
/// it around.
#[derive(Debug, Clone)]
pub struct Claims {
    values: serde_json::Map<String, Value>,
}

/// Accept either the token itself or a path to a file containing it.
///
/// # Errors
/// `InvalidToken` if the file cannot be read or the payload does not decode
pub fn resolve_token(arg: &str) -> Result<String> {
    let path = Path::new(arg);

    let token = if path.is_file() {
        fs::read_to_string(path)
            .map_err(|e| Error::InvalidToken(format!("cannot read {}: {e}", path.display())))?
            .trim_matches(|c: char| c.is_ascii_whitespace())
            .to_string()
    } else {
        arg.to_string()
    };

    // fail early on a token that will never resolve
    decode_payload(&token)?;

    Ok(token)
}

/// Decode the middle segment of a dot-separated token into a claims object.
///
/// # Errors
/// `InvalidToken` on any shape, base64 or JSON failure
pub fn decode_payload(token: &str) -> Result<Claims> {
    let mut segments = token.split('.');

    let payload = match (segments.next(), segments.next()) {
        (Some(_), Some(payload)) => payload,
        _ => {
            return Err(Error::InvalidToken(
                "expected at least two dot-separated segments".to_string(),
            ));
        }
    };

    // tolerate padded and unpadded encodings alike
    let payload = payload.trim_end_matches('=');
    let bytes = Base64UrlUnpadded::decode_vec(payload)
        .map_err(|_| Error::InvalidToken("payload is not valid base64url".to_string()))?;

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(values)) => Ok(Claims { values }),
        Ok(_) => Err(Error::InvalidToken(
            "payload is not a JSON object".to_string(),
        )),
        Err(e) => Err(Error::InvalidToken(format!("payload is not JSON: {e}"))),
    }
}

impl Claims {
    /// The claim value iff present and textual.
    #[must_use]
    pub fn string_claim(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    /// The claim value iff present and numeric, `-1` otherwise.
    #[must_use]
    pub fn long_claim(&self, name: &str) -> i64 {
        self.values.get(name).and_then(Value::as_i64).unwrap_or(-1)
    }

    /// # Errors
    /// `MissingClaim` when the key claim is absent and not skipped
    pub fn resolve_public_key(&self, skip_key: bool) -> Result<Option<String>> {
        if skip_key {
            return Ok(None);
        }

        self.string_claim(CLAIM_PUBLIC_KEY)
            .map(|pem| Some(pem.to_string()))
            .ok_or(Error::MissingClaim(CLAIM_PUBLIC_KEY))
    }

    /// Only meaningful when an upload will occur.
    ///
    /// # Errors
    /// `MissingClaim` when the server claim is absent
    pub fn resolve_server(&self) -> Result<String> {
        self.string_claim(CLAIM_UPLOAD_SERVER)
            .map(str::to_string)
            .ok_or(Error::MissingClaim(CLAIM_UPLOAD_SERVER))
    }

    /// The claim wins over the operator override; under `skip_key` neither
    /// applies and the caller falls back to `plaintext_upload`.
    ///
    /// # Errors
    /// `MissingClaim` when both sources are absent
    pub fn resolve_uuid(&self, skip_key: bool, fallback: Option<&str>) -> Result<Option<String>> {
        if skip_key {
            return Ok(None);
        }

        self.string_claim(CLAIM_PROJECT_UUID)
            .or(fallback)
            .map(|uuid| Some(uuid.to_string()))
            .ok_or(Error::MissingClaim(CLAIM_PROJECT_UUID))
    }

    #[must_use]
    pub fn resolve_challenge(&self) -> Option<String> {
        self.string_claim(CLAIM_CHALLENGE).map(str::to_string)
    }

    /// Require a numeric `exp` strictly in the future. Only meaningful when
    /// an upload will occur.
    ///
    /// # Errors
    /// `ExpInvalid` when expiry is missing, non-numeric or not in the future
    pub fn not_expired(&self) -> Result<()> {
        let exp = self.long_claim(CLAIM_EXPIRY);
        if exp <= 0 {
            return Err(Error::ExpInvalid);
        }

        if exp > Utc::now().timestamp() {
            Ok(())
        } else {
            Err(Error::ExpInvalid)
        }
    }
}
