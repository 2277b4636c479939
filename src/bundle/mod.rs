//! Assemble the sealed bundle: a ZIP container holding the metadata
//! entries, the wrapped AES key material, and the (optionally encrypted)
//! payload streamed in as the final entry.

use crate::{
    Result, crypto,
    payload::{BundleVersion, Payload},
};
use base64ct::{Base64, Encoding};
use chrono::{SecondsFormat, Utc};
use std::{
    env,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

/// Project id written into `uuid.txt` when no project UUID is available.
pub const PLAINTEXT_UPLOAD: &str = "plaintext_upload";

// artifacts land in <output>/spicepack/
const ARTIFACT_SUBDIR: &str = "spicepack";

// raw payload copy buffer when no key is present
const COPY_CHUNK: usize = 4 * 1024;

// plaintext length of the known-answer probe in test.txt
const PROBE_LEN: usize = 128;

/// Everything the builder needs besides the payload itself. Owned values
/// so a build can run on a blocking worker.
#[derive(Debug, Default)]
pub struct BundleOptions {
    pub uuid: Option<String>,
    pub public_key_pem: Option<String>,
    pub mime: String,
    pub comment: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub version: BundleVersion,
}

/// Build the bundle and return the artifact path.
///
/// Entries are written in a fixed order, `payload.enc` always last. When a
/// public key is present the payload is stream-encrypted with a fresh
/// AES-256 key that is RSA-wrapped into `key.txt`; without one the payload
/// goes in as-is and `uuid.txt` falls back to `plaintext_upload`.
///
/// # Errors
/// `BadKey` on an unparseable PEM, `CryptoFail`/`Io` on crypto or
/// filesystem failures. A partial artifact is deleted before returning an
/// error.
pub fn build(options: &BundleOptions, payload: Payload) -> Result<PathBuf> {
    let dir = options
        .output_dir
        .clone()
        .unwrap_or_else(env::temp_dir)
        .join(ARTIFACT_SUBDIR);
    fs::create_dir_all(&dir)?;

    let name = format!(
        "{}-{}.zip",
        options.uuid.as_deref().unwrap_or(PLAINTEXT_UPLOAD),
        Utc::now().timestamp_millis()
    );
    let path = dir.join(name);

    log::debug!("writing bundle: {}", path.display());

    if let Err(err) = write_bundle(&path, options, payload) {
        // never leave a half-written artifact behind
        let _ = fs::remove_file(&path);
        return Err(err);
    }

    Ok(path)
}

fn write_bundle(path: &Path, options: &BundleOptions, payload: Payload) -> Result<()> {
    let mut zip = ZipWriter::new(File::create(path)?);
    let text = SimpleFileOptions::default();

    let uuid = options.uuid.as_deref().unwrap_or(PLAINTEXT_UPLOAD);
    write_entry(&mut zip, "uuid.txt", text, uuid.as_bytes())?;

    let date = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    write_entry(&mut zip, "bundle_date.txt", text, date.as_bytes())?;

    write_entry(
        &mut zip,
        "payload_container_type.txt",
        text,
        payload.container.as_str().as_bytes(),
    )?;

    if let Some(comment) = &options.comment {
        write_entry(&mut zip, "comment.txt", text, comment.as_bytes())?;
    }

    write_entry(
        &mut zip,
        "bundle_format_version.txt",
        text,
        options.version.as_str().as_bytes(),
    )?;

    let sealing = match &options.public_key_pem {
        Some(pem) => Some(write_key_entries(&mut zip, text, pem)?),
        None => None,
    };

    write_entry(&mut zip, "mime.txt", text, options.mime.as_bytes())?;

    // ciphertext does not deflate, and the payload may not fit 32-bit sizes
    let stored = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(true);
    zip.start_file("payload.enc", stored)?;

    let mut stream = payload.stream;
    match sealing {
        Some((key, iv)) => {
            crypto::aes_gcm_encrypt_stream(&key, &iv, &mut stream, &mut zip)?;
        }
        None => {
            copy_raw(&mut stream, &mut zip)?;
        }
    }
    stream.finish()?;

    let file = zip.finish()?;
    file.sync_all()?;

    Ok(())
}

// key.txt, pubkey.pem, test.txt and iv.txt travel together; returns the
// AES key and the payload IV for the payload.enc entry.
fn write_key_entries<W>(
    zip: &mut ZipWriter<W>,
    text: SimpleFileOptions,
    pem: &str,
) -> Result<([u8; crypto::AES_KEY_LEN], [u8; crypto::GCM_IV_LEN])>
where
    W: Write + std::io::Seek,
{
    let key = crypto::generate_aes_key()?;
    let wrapped = crypto::rsa_oaep_wrap(pem, &key)?;
    write_entry(zip, "key.txt", text, Base64::encode_string(&wrapped).as_bytes())?;

    write_entry(zip, "pubkey.pem", text, pem.as_bytes())?;

    // known-answer probe: IV, plaintext and ciphertext under the same key,
    // so the receiver can verify the unwrapped key before touching the payload
    let probe_iv = crypto::generate_iv()?;
    let probe = crypto::random_bytes(PROBE_LEN)?;
    let sealed_probe = crypto::aes_gcm_encrypt(&key, &probe_iv, &probe)?;
    let probe_entry = [
        Base64::encode_string(&probe_iv),
        Base64::encode_string(&probe),
        Base64::encode_string(&sealed_probe),
    ]
    .join("\n");
    write_entry(zip, "test.txt", text, probe_entry.as_bytes())?;

    // independent of the probe IV, never reused under this key
    let payload_iv = crypto::generate_iv()?;
    write_entry(zip, "iv.txt", text, Base64::encode_string(&payload_iv).as_bytes())?;

    Ok((key, payload_iv))
}

fn write_entry<W>(
    zip: &mut ZipWriter<W>,
    name: &str,
    options: SimpleFileOptions,
    contents: &[u8],
) -> Result<()>
where
    W: Write + std::io::Seek,
{
    zip.start_file(name, options)?;
    zip.write_all(contents)?;
    Ok(())
}

fn copy_raw<R, W>(input: &mut R, output: &mut W) -> Result<u64>
where
    R: Read,
    W: Write,
{
    let mut buf = [0_u8; COPY_CHUNK];
    let mut copied: u64 = 0;

    loop {
        let got = input.read(&mut buf)?;
        if got == 0 {
            break;
        }
        output.write_all(&buf[..got])?;
        copied += got as u64;
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, payload};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn seal_file(contents: &[u8], options: &BundleOptions) -> PathBuf {
        let input = TempDir::new().unwrap();
        let path = input.path().join("payload.json");
        fs::write(&path, contents).unwrap();

        let payload = payload::open(&path, options.version).unwrap();
        build(options, payload).unwrap()
    }

    fn entry_names(path: &Path) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    fn entry(path: &Path, name: &str) -> Vec<u8> {
        let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut out = Vec::new();
        archive.by_name(name).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_cleartext_bundle_entry_set_and_order() {
        let out = TempDir::new().unwrap();
        let options = BundleOptions {
            mime: "application/vnd.info.deployevent".to_string(),
            output_dir: Some(out.path().to_path_buf()),
            ..Default::default()
        };

        let artifact = seal_file(b"hello", &options);

        assert_eq!(
            entry_names(&artifact),
            [
                "uuid.txt",
                "bundle_date.txt",
                "payload_container_type.txt",
                "bundle_format_version.txt",
                "mime.txt",
                "payload.enc",
            ]
        );
        assert_eq!(entry(&artifact, "uuid.txt"), PLAINTEXT_UPLOAD.as_bytes());
        assert_eq!(entry(&artifact, "payload_container_type.txt"), b"file");
        assert_eq!(entry(&artifact, "bundle_format_version.txt"), b"2");
        assert_eq!(entry(&artifact, "payload.enc"), b"hello");
    }

    #[test]
    fn test_artifact_filename_shape() {
        let out = TempDir::new().unwrap();
        let options = BundleOptions {
            uuid: Some("proj-42".to_string()),
            mime: "application/vnd.cc.bigtent".to_string(),
            output_dir: Some(out.path().to_path_buf()),
            ..Default::default()
        };

        let artifact = seal_file(b"x", &options);
        let name = artifact.file_name().unwrap().to_str().unwrap();

        let rest = name.strip_prefix("proj-42-").unwrap();
        let millis = rest.strip_suffix(".zip").unwrap();
        assert!(!millis.is_empty());
        assert!(millis.bytes().all(|b| b.is_ascii_digit()));
        assert_eq!(artifact.parent().unwrap().file_name().unwrap(), "spicepack");
    }

    #[test]
    fn test_comment_entry_present_when_given() {
        let out = TempDir::new().unwrap();
        let options = BundleOptions {
            mime: "application/vnd.cc.bigtent".to_string(),
            comment: Some("release 1.2".to_string()),
            output_dir: Some(out.path().to_path_buf()),
            ..Default::default()
        };

        let artifact = seal_file(b"x", &options);
        assert_eq!(entry(&artifact, "comment.txt"), b"release 1.2");
        assert_eq!(
            entry_names(&artifact)[3],
            "comment.txt",
            "comment sits between container type and format version"
        );
    }

    #[test]
    fn test_bundle_date_is_rfc3339_utc() {
        let out = TempDir::new().unwrap();
        let options = BundleOptions {
            mime: "application/vnd.cc.bigtent".to_string(),
            output_dir: Some(out.path().to_path_buf()),
            ..Default::default()
        };

        let artifact = seal_file(b"x", &options);
        let date = String::from_utf8(entry(&artifact, "bundle_date.txt")).unwrap();
        assert!(date.ends_with('Z'));
        assert!(date.contains('T'));
        chrono::DateTime::parse_from_rfc3339(&date).unwrap();
    }

    #[test]
    fn test_encrypted_bundle_key_entries_travel_together() {
        use openssl::rsa::Rsa;

        let rsa = Rsa::generate(2048).unwrap();
        let pem = String::from_utf8(rsa.public_key_to_pem().unwrap()).unwrap();

        let out = TempDir::new().unwrap();
        let options = BundleOptions {
            uuid: Some("proj".to_string()),
            public_key_pem: Some(pem.clone()),
            mime: "application/vnd.cc.bigtent".to_string(),
            output_dir: Some(out.path().to_path_buf()),
            ..Default::default()
        };

        let artifact = seal_file(b"secret payload", &options);

        assert_eq!(
            entry_names(&artifact),
            [
                "uuid.txt",
                "bundle_date.txt",
                "payload_container_type.txt",
                "bundle_format_version.txt",
                "key.txt",
                "pubkey.pem",
                "test.txt",
                "iv.txt",
                "mime.txt",
                "payload.enc",
            ]
        );
        assert_eq!(entry(&artifact, "pubkey.pem"), pem.as_bytes());

        // sealed payload is ciphertext plus the 16-byte tag
        let sealed = entry(&artifact, "payload.enc");
        assert_eq!(sealed.len(), b"secret payload".len() + crypto::GCM_TAG_LEN);
        assert_ne!(&sealed[..b"secret payload".len()], b"secret payload".as_slice());

        let probe = String::from_utf8(entry(&artifact, "test.txt")).unwrap();
        assert_eq!(probe.lines().count(), 3);
    }

    #[test]
    fn test_encrypted_payload_opens_under_wrapped_key() {
        use openssl::{
            encrypt::Decrypter,
            hash::MessageDigest,
            pkey::PKey,
            rsa::{Padding, Rsa},
            symm::{Cipher, decrypt_aead},
        };

        let rsa = Rsa::generate(2048).unwrap();
        let pem = String::from_utf8(rsa.public_key_to_pem().unwrap()).unwrap();

        let out = TempDir::new().unwrap();
        let options = BundleOptions {
            uuid: Some("proj".to_string()),
            public_key_pem: Some(pem),
            mime: "application/vnd.cc.bigtent".to_string(),
            output_dir: Some(out.path().to_path_buf()),
            ..Default::default()
        };

        let artifact = seal_file(b"round trip me", &options);

        // unwrap the AES key with the private half
        let wrapped =
            Base64::decode_vec(&String::from_utf8(entry(&artifact, "key.txt")).unwrap()).unwrap();
        let pkey = PKey::from_rsa(rsa).unwrap();
        let mut decrypter = Decrypter::new(&pkey).unwrap();
        decrypter.set_rsa_padding(Padding::PKCS1_OAEP).unwrap();
        decrypter.set_rsa_oaep_md(MessageDigest::sha256()).unwrap();
        decrypter.set_rsa_mgf1_md(MessageDigest::sha256()).unwrap();
        let mut key = vec![0_u8; decrypter.decrypt_len(&wrapped).unwrap()];
        let n = decrypter.decrypt(&wrapped, &mut key).unwrap();
        key.truncate(n);
        assert_eq!(key.len(), crypto::AES_KEY_LEN);

        let iv =
            Base64::decode_vec(&String::from_utf8(entry(&artifact, "iv.txt")).unwrap()).unwrap();
        let sealed = entry(&artifact, "payload.enc");
        let (ciphertext, tag) = sealed.split_at(sealed.len() - crypto::GCM_TAG_LEN);

        let opened =
            decrypt_aead(Cipher::aes_256_gcm(), &key, Some(&iv), &[], ciphertext, tag).unwrap();
        assert_eq!(opened, b"round trip me");

        // the probe IV must be independent of the payload IV
        let probe = String::from_utf8(entry(&artifact, "test.txt")).unwrap();
        let probe_iv = Base64::decode_vec(probe.lines().next().unwrap()).unwrap();
        assert_ne!(probe_iv, iv);
    }

    #[test]
    fn test_bad_pem_fails_and_removes_partial_artifact() {
        let input = TempDir::new().unwrap();
        let path = input.path().join("p.json");
        fs::write(&path, b"x").unwrap();

        let out = TempDir::new().unwrap();
        let options = BundleOptions {
            public_key_pem: Some("garbage".to_string()),
            mime: "application/vnd.cc.bigtent".to_string(),
            output_dir: Some(out.path().to_path_buf()),
            ..Default::default()
        };

        let payload = payload::open(&path, options.version).unwrap();
        let err = build(&options, payload).unwrap_err();
        assert!(matches!(err, Error::BadKey(_)));

        let leftovers: Vec<_> = fs::read_dir(out.path().join(ARTIFACT_SUBDIR))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty(), "partial artifact was not removed");
    }

    #[test]
    fn test_copy_raw_moves_everything() {
        let data = vec![7_u8; 3 * COPY_CHUNK + 17];
        let mut out = Vec::new();
        let copied = copy_raw(&mut Cursor::new(&data), &mut out).unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(out, data);
    }
}
