//! Three-phase multipart upload: init, parallel part PUTs, complete.
//!
//! The engine is self-contained: given a base URL, a bearer token and a
//! sealed artifact it drives the whole protocol. Up to four parts are in
//! flight at a time; each part retries independently through the shared
//! harness and rewinds its progress contribution before every retry. The
//! complete manifest is strictly ordered by part number.

pub mod client;
pub mod progress;
pub mod request;
pub mod types;

use crate::{Error, Result, crypto};
use base64ct::{Base64, Encoding};
use bytesize::ByteSize;
use futures::{StreamExt, TryStreamExt, stream::FuturesUnordered};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use self::client::http_client;
use self::progress::Progress;
use self::request::{check_response, with_retries};
use self::types::{
    CompleteRequest, CompleteResponse, CompletedPart, InitRequest, InitResponse, RawInitResponse,
    UploadPart,
};
use std::{
    collections::BTreeMap,
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::codec::{BytesCodec, FramedRead};

// parts in flight at once
const MAX_CONCURRENT_PARTS: usize = 4;

// part bodies leave in 256k frames
const FRAME_SIZE: usize = 256 * 1024;

pub struct UploadRequest<'a> {
    pub base_url: &'a str,
    pub token: &'a str,
    pub artifact: &'a Path,
    pub sha256: &'a str,
    pub size: u64,
    pub filename: Option<String>,
    pub public_key_pem: Option<&'a str>,
    pub challenge: Option<&'a str>,
}

#[derive(Debug)]
pub struct UploadOutcome {
    pub response: CompleteResponse,
    pub bundle_id: String,
    pub bytes_uploaded: u64,
}

/// Drive the full protocol against `{base}/init` and `{base}/complete`.
///
/// # Errors
/// `BadInput` for a challenge without a key, `Protocol`/`Server`/`Network`
/// per the wire contract
pub async fn upload(req: &UploadRequest<'_>) -> Result<UploadOutcome> {
    let base = normalize_base_url(req.base_url);

    // the liveness challenge must go back RSA-encrypted, which is
    // impossible without a key; refuse before any traffic
    let encrypted_challenge = match (req.challenge, req.public_key_pem) {
        (Some(challenge), Some(pem)) => Some(Base64::encode_string(&crypto::rsa_oaep_wrap(
            pem,
            challenge.as_bytes(),
        )?)),
        (Some(_), None) => {
            return Err(Error::BadInput(
                "token carries a challenge but no public key to encrypt it with".to_string(),
            ));
        }
        (None, _) => None,
    };

    let init = init_upload(
        &base,
        req.token,
        &InitRequest {
            sha256: req.sha256.to_string(),
            size_bytes: req.size,
            filename: req.filename.clone(),
            encrypted_challenge,
        },
    )
    .await?;

    log::info!(
        "upload {} started: {} parts, {}",
        init.upload_id,
        init.parts.len(),
        ByteSize(req.size)
    );
    log::debug!("bundle id: {}, expires in: {:?}", init.bundle_id, init.expires_in);

    let progress = Arc::new(Progress::new(req.size));
    let etags = upload_parts(req.artifact, &init.parts, &progress).await?;

    let parts = etags
        .into_iter()
        .map(|(part_number, etag)| CompletedPart { part_number, etag })
        .collect();

    let response = complete_upload(
        &base,
        req.token,
        &CompleteRequest {
            upload_id: init.upload_id,
            blob_key: init.blob_key,
            sha256: req.sha256.to_string(),
            parts,
        },
    )
    .await?;

    Ok(UploadOutcome {
        bundle_id: init.bundle_id,
        bytes_uploaded: progress.uploaded(),
        response,
    })
}

// exactly one slash between the base and the phase path
fn normalize_base_url(base: &str) -> String {
    base.trim_end_matches('/').to_string()
}

async fn init_upload(base: &str, token: &str, request: &InitRequest) -> Result<InitResponse> {
    let url = format!("{base}/init");

    let raw: RawInitResponse = with_retries(
        "init",
        || {
            let url = url.clone();
            async move {
                let response = http_client()
                    .post(&url)
                    .bearer_auth(token)
                    .json(request)
                    .send()
                    .await?;
                let response = check_response(response).await?;

                response
                    .json::<RawInitResponse>()
                    .await
                    .map_err(|e| Error::Protocol(format!("init: invalid response body: {e}")))
            }
        },
        || {},
    )
    .await?;

    raw.validate()
}

async fn upload_parts(
    artifact: &Path,
    parts: &[UploadPart],
    progress: &Arc<Progress>,
) -> Result<BTreeMap<u32, String>> {
    let limit = parts.len().clamp(1, MAX_CONCURRENT_PARTS);

    let mut tasks = FuturesUnordered::new();
    let mut etags = BTreeMap::new();

    for part in parts {
        tasks.push(upload_part(artifact, part, Arc::clone(progress)));

        while tasks.len() >= limit {
            collect_part(&mut tasks, &mut etags).await?;
        }
    }

    while !tasks.is_empty() {
        collect_part(&mut tasks, &mut etags).await?;
    }

    Ok(etags)
}

async fn collect_part<T>(
    tasks: &mut FuturesUnordered<T>,
    etags: &mut BTreeMap<u32, String>,
) -> Result<()>
where
    T: Future<Output = Result<(u32, String)>>,
{
    if let Some(finished) = tasks.next().await {
        match finished {
            Ok((part_number, etag)) => {
                etags.insert(part_number, etag);
            }
            Err(err) => {
                // first cause wins; in-flight siblings are dropped with the set
                log::debug!("aborting {} in-flight part uploads", tasks.len());
                return Err(err);
            }
        }
    }

    Ok(())
}

async fn upload_part(
    artifact: &Path,
    part: &UploadPart,
    progress: Arc<Progress>,
) -> Result<(u32, String)> {
    let sent = Arc::new(AtomicU64::new(0));
    let what = format!("part {}", part.part_number);

    let etag = with_retries(
        &what,
        || {
            let artifact: PathBuf = artifact.to_path_buf();
            let part = part.clone();
            let progress = Arc::clone(&progress);
            let sent = Arc::clone(&sent);
            async move { put_part(&artifact, &part, &progress, &sent).await }
        },
        || {
            // this attempt's bytes never made it; rewind the shared counter
            progress.rollback(sent.swap(0, Ordering::SeqCst));
        },
    )
    .await
    .map_err(|err| {
        log::error!("upload of part {} failed: {err}", part.part_number);

        match err {
            Error::Server { status, body } => Error::Server {
                status,
                body: format!("part {} failed: {body}", part.part_number),
            },
            other => other,
        }
    })?;

    Ok((part.part_number, etag))
}

// PUT the byte range [offset, offset + size) to the part's presigned URL.
// Every part opens its own descriptor so there is no shared file position.
async fn put_part(
    artifact: &Path,
    part: &UploadPart,
    progress: &Arc<Progress>,
    sent: &Arc<AtomicU64>,
) -> Result<String> {
    let mut file = tokio::fs::File::open(artifact).await?;
    file.seek(SeekFrom::Start(part.offset)).await?;
    let range = file.take(part.size);

    let frames = FramedRead::with_capacity(range, BytesCodec::new(), FRAME_SIZE);

    let progress = Arc::clone(progress);
    let sent = Arc::clone(sent);
    let counted = frames.inspect_ok(move |chunk| {
        progress.add(chunk.len() as u64);
        sent.fetch_add(chunk.len() as u64, Ordering::SeqCst);
    });

    let response = http_client()
        .put(&part.presigned_url)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, part.size)
        .body(reqwest::Body::wrap_stream(counted))
        .send()
        .await?;
    let response = check_response(response).await?;

    let etag = response
        .headers()
        .get(ETAG)
        .ok_or_else(|| Error::Protocol(format!("part {}: no ETag in response", part.part_number)))?
        .to_str()
        .map_err(|_| Error::Protocol(format!("part {}: unreadable ETag", part.part_number)))?
        .trim_matches('"')
        .to_string();

    Ok(etag)
}

async fn complete_upload(
    base: &str,
    token: &str,
    request: &CompleteRequest,
) -> Result<CompleteResponse> {
    let url = format!("{base}/complete");

    with_retries(
        "complete",
        || {
            let url = url.clone();
            async move {
                let response = http_client()
                    .post(&url)
                    .bearer_auth(token)
                    .json(request)
                    .send()
                    .await?;
                let response = check_response(response).await?;

                response
                    .json::<CompleteResponse>()
                    .await
                    .map_err(|e| Error::Protocol(format!("complete: invalid response body: {e}")))
            }
        },
        || {},
    )
    .await
}
