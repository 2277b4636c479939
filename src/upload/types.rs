//! Wire types for the three-phase upload protocol.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub sha256: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_challenge: Option<String>,
}

/// One presigned byte range of the artifact.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPart {
    pub part_number: u32,
    pub presigned_url: String,
    pub offset: u64,
    pub size: u64,
}

// Deserialized leniently so a short response can be reported with the
// names of everything it is missing, not just the first.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInitResponse {
    pub upload_id: Option<String>,
    pub blob_key: Option<String>,
    pub bundle_id: Option<String>,
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub parts: Vec<UploadPart>,
}

#[derive(Debug)]
pub struct InitResponse {
    pub upload_id: String,
    pub blob_key: String,
    pub bundle_id: String,
    pub expires_in: Option<u64>,
    pub parts: Vec<UploadPart>,
}

impl RawInitResponse {
    /// # Errors
    /// `Protocol` naming every missing mandatory field
    pub fn validate(self) -> Result<InitResponse> {
        let mut missing = Vec::new();

        if self.upload_id.is_none() {
            missing.push("uploadId");
        }
        if self.blob_key.is_none() {
            missing.push("blobKey");
        }
        if self.bundle_id.is_none() {
            missing.push("bundleId");
        }
        if self.parts.is_empty() {
            missing.push("parts");
        }

        if !missing.is_empty() {
            return Err(Error::Protocol(format!(
                "init response is missing: {}",
                missing.join(", ")
            )));
        }

        match (self.upload_id, self.blob_key, self.bundle_id) {
            (Some(upload_id), Some(blob_key), Some(bundle_id)) => Ok(InitResponse {
                upload_id,
                blob_key,
                bundle_id,
                expires_in: self.expires_in,
                parts: self.parts,
            }),
            _ => unreachable!("checked above"),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub upload_id: String,
    pub blob_key: String,
    pub sha256: String,
    pub parts: Vec<CompletedPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub status: Option<String>,
    pub bundle_id: Option<String>,
    pub message: Option<String>,
}
