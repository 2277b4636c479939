//! AES-256-GCM and RSA-OAEP primitives used to seal a bundle.
//!
//! The payload cipher is streaming: plaintext is consumed in chunks and the
//! 16-byte authentication tag is appended after the last ciphertext byte,
//! so a multi-gigabyte payload never has to exist in memory.

use crate::{Error, Result};
use base64ct::{Base64, Encoding};
use openssl::{
    encrypt::Encrypter,
    hash::MessageDigest,
    pkey::PKey,
    rand::rand_bytes,
    rsa::{Padding, Rsa},
    symm::{Cipher, Crypter, Mode, encrypt_aead},
};
use ring::digest::{Context, SHA256};
use std::{
    fmt::Write as _,
    fs::File,
    io::{Read, Write},
    path::Path,
};

pub const AES_KEY_LEN: usize = 32;
pub const GCM_IV_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;

// payload is read in 64k chunks while encrypting
const STREAM_CHUNK: usize = 64 * 1024;

/// # Errors
/// Will return an error if the system CSPRNG fails
pub fn generate_aes_key() -> Result<[u8; AES_KEY_LEN]> {
    let mut key = [0_u8; AES_KEY_LEN];
    rand_bytes(&mut key)?;
    Ok(key)
}

/// # Errors
/// Will return an error if the system CSPRNG fails
pub fn generate_iv() -> Result<[u8; GCM_IV_LEN]> {
    let mut iv = [0_u8; GCM_IV_LEN];
    rand_bytes(&mut iv)?;
    Ok(iv)
}

/// # Errors
/// Will return an error if the system CSPRNG fails
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0_u8; len];
    rand_bytes(&mut bytes)?;
    Ok(bytes)
}

// Accept both pretty-printed and single-line PEM: drop the armor lines,
// squeeze out whitespace, then parse the base64 body as SPKI DER.
fn decode_spki_pem(pem: &str) -> Result<Vec<u8>> {
    let body = pem
        .lines()
        .filter(|line| !line.trim_start().starts_with("-----"))
        .collect::<String>();
    let body = body.split_whitespace().collect::<String>();

    Base64::decode_vec(&body).map_err(|_| Error::BadKey("PEM body is not valid base64".to_string()))
}

/// Encrypt `data` under the given public key with RSA-OAEP, SHA-256 for
/// both the digest and the MGF1 mask.
///
/// # Errors
/// `BadKey` if the PEM cannot be parsed, `CryptoFail` if encryption fails
pub fn rsa_oaep_wrap(pem: &str, data: &[u8]) -> Result<Vec<u8>> {
    let der = decode_spki_pem(pem)?;
    let rsa = Rsa::public_key_from_der(&der).map_err(|e| Error::BadKey(e.to_string()))?;
    let pkey = PKey::from_rsa(rsa).map_err(|e| Error::BadKey(e.to_string()))?;

    let mut encrypter = Encrypter::new(&pkey)?;
    encrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
    encrypter.set_rsa_oaep_md(MessageDigest::sha256())?;
    encrypter.set_rsa_mgf1_md(MessageDigest::sha256())?;

    let mut wrapped = vec![0_u8; encrypter.encrypt_len(data)?];
    let written = encrypter.encrypt(data, &mut wrapped)?;
    wrapped.truncate(written);

    Ok(wrapped)
}

/// Stream `input` through AES-256-GCM into `output`, appending the
/// authentication tag after the final ciphertext block. Returns the number
/// of bytes written, tag included.
///
/// The IV must be fresh for every call under the same key, see
/// [`generate_iv`].
///
/// # Errors
/// Will return an error if reading, writing or the cipher fails
pub fn aes_gcm_encrypt_stream<R, W>(
    key: &[u8; AES_KEY_LEN],
    iv: &[u8; GCM_IV_LEN],
    input: &mut R,
    output: &mut W,
) -> Result<u64>
where
    R: Read,
    W: Write,
{
    let cipher = Cipher::aes_256_gcm();
    let mut crypter = Crypter::new(cipher, Mode::Encrypt, key, Some(iv))?;

    let mut plain = vec![0_u8; STREAM_CHUNK];
    let mut sealed = vec![0_u8; STREAM_CHUNK + cipher.block_size()];
    let mut written: u64 = 0;

    loop {
        let got = input.read(&mut plain)?;
        if got == 0 {
            break;
        }

        let out = crypter.update(&plain[..got], &mut sealed)?;
        output.write_all(&sealed[..out])?;
        written += out as u64;
    }

    let out = crypter.finalize(&mut sealed)?;
    output.write_all(&sealed[..out])?;
    written += out as u64;

    let mut tag = [0_u8; GCM_TAG_LEN];
    crypter.get_tag(&mut tag)?;
    output.write_all(&tag)?;
    written += GCM_TAG_LEN as u64;

    Ok(written)
}

/// One-shot AES-256-GCM, ciphertext with the tag appended. Used for the
/// known-answer probe written into the bundle.
///
/// # Errors
/// Will return an error if the cipher fails
pub fn aes_gcm_encrypt(
    key: &[u8; AES_KEY_LEN],
    iv: &[u8; GCM_IV_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let mut tag = [0_u8; GCM_TAG_LEN];
    let mut sealed = encrypt_aead(Cipher::aes_256_gcm(), key, Some(iv), &[], plaintext, &mut tag)?;
    sealed.extend_from_slice(&tag);
    Ok(sealed)
}

/// Lowercase hex SHA-256 of a file, streamed in 256k frames.
///
/// # Errors
/// Will return an error if the file cannot be read
pub fn sha256_hex_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut context = Context::new(&SHA256);
    let mut buf = vec![0_u8; 256 * 1024];

    loop {
        let got = file.read(&mut buf)?;
        if got == 0 {
            break;
        }
        context.update(&buf[..got]);
    }

    Ok(write_hex_bytes(context.finish().as_ref()))
}

#[must_use]
pub fn write_hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut output, byte| {
        let _ = write!(output, "{byte:02x}");
        output
    })
}
