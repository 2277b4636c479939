use crate::{
    Error, Result,
    bundle::{self, BundleOptions},
    cli::actions::Action,
    crypto, payload, token,
    upload::{self, UploadRequest},
};
use bytesize::ByteSize;
use std::fs;
use tokio::task;

/// Resolve claims, stream the payload into a sealed bundle, then upload it
/// unless `--encrypt-only` was given.
///
/// # Errors
/// Will return an error if any stage fails
pub async fn handle(action: Action) -> Result<()> {
    let Action::Seal {
        jwt,
        uuid,
        input,
        mime,
        encrypt_only,
        skip_key,
        comment,
        output,
        version,
    } = action;

    let claims = jwt.as_deref().map(token::decode_payload).transpose()?;

    let (public_key, bundle_uuid, challenge, server) = match &claims {
        Some(claims) => {
            let public_key = claims.resolve_public_key(skip_key)?;
            let bundle_uuid = claims.resolve_uuid(skip_key, uuid.as_deref())?;
            let challenge = claims.resolve_challenge();

            let server = if encrypt_only {
                None
            } else {
                claims.not_expired()?;
                Some(claims.resolve_server()?)
            };

            (public_key, bundle_uuid, challenge, server)
        }
        // only reachable under --skip-key --encrypt-only
        None => (None, None, None, None),
    };

    log::info!("sealing {} as {mime}", input.display());

    let payload = payload::open(&input, version)?;

    let options = BundleOptions {
        uuid: bundle_uuid,
        public_key_pem: public_key.clone(),
        mime: mime.to_string(),
        comment,
        output_dir: output,
        version,
    };

    // archiving and encryption are blocking work
    let artifact = task::spawn_blocking(move || bundle::build(&options, payload))
        .await
        .map_err(join_error)??;

    let sha256 = crypto::sha256_hex_file(&artifact)?;
    let size = fs::metadata(&artifact)?.len();

    log::info!(
        "artifact {} ({}), sha256 {sha256}",
        artifact.display(),
        ByteSize(size)
    );

    if encrypt_only {
        println!("{}", artifact.display());
        return Ok(());
    }

    let (Some(server), Some(jwt)) = (server, jwt) else {
        return Err(Error::BadInput("--jwt is required to upload".to_string()));
    };

    let filename = artifact
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());

    let outcome = upload::upload(&UploadRequest {
        base_url: &server,
        token: &jwt,
        artifact: &artifact,
        sha256: &sha256,
        size,
        filename,
        public_key_pem: public_key.as_deref(),
        challenge: challenge.as_deref(),
    })
    .await?;

    // finish the dot line before the summary
    eprintln!();

    log::info!(
        "upload complete: bundle {}, status {}, {} sent",
        outcome.bundle_id,
        outcome.response.status.as_deref().unwrap_or("unknown"),
        ByteSize(outcome.bytes_uploaded)
    );

    if let Some(message) = outcome.response.message {
        log::info!("server: {message}");
    }

    println!("{}", outcome.bundle_id);

    Ok(())
}

fn join_error(err: task::JoinError) -> Error {
    if err.is_cancelled() {
        Error::Cancelled
    } else {
        Error::Io(std::io::Error::other(err))
    }
}
