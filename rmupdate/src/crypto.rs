// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

use pkcs8::DecodePublicKey;
use ring::digest::SHA256_OUTPUT_LEN;
use rsa::{Pkcs1v15Sign, RsaPublicKey, traits::PublicKeyParts};
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("RSA key size ({}) not supported", .0 * 8)]
    UnsupportedKeySize(usize),
    #[error("Invalid digest length ({0} bytes) for SHA-256")]
    InvalidDigestLength(usize),
    #[error("Failed to load RSA public key")]
    LoadPubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to RSA verify signature")]
    RsaVerify(#[source] Box<rsa::Error>),
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn check_key_size(size: usize) -> Result<()> {
    // RustCrypto does not support 8192-bit keys.
    if size > 4096 / 8 {
        return Err(Error::UnsupportedKeySize(size));
    }

    Ok(())
}

pub trait RsaPublicKeyExt {
    /// Verify a PKCS#1 v1.5 signature over a precomputed SHA-256 digest.
    fn verify_sha256(&self, digest: &[u8], signature: &[u8]) -> Result<()>;
}

impl RsaPublicKeyExt for RsaPublicKey {
    fn verify_sha256(&self, digest: &[u8], signature: &[u8]) -> Result<()> {
        // Check this explicitly so we can provide a better error message.
        if digest.len() != SHA256_OUTPUT_LEN {
            return Err(Error::InvalidDigestLength(digest.len()));
        }

        check_key_size(self.size())?;

        let scheme = Pkcs1v15Sign::new::<Sha256>();

        self.verify(scheme, digest, signature)
            .map_err(|e| Error::RsaVerify(Box::new(e)))
    }
}

/// Parse a PEM-encoded PKCS8 (SubjectPublicKeyInfo) public key.
pub fn parse_pem_public_key(data: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(data.trim()).map_err(Error::LoadPubKey)
}

/// Read PEM-encoded PKCS8 public key from a reader.
pub fn read_pem_public_key(path: &Path, mut reader: impl Read) -> Result<RsaPublicKey> {
    let mut data = String::new();
    reader
        .read_to_string(&mut data)
        .map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    parse_pem_public_key(&data)
}

/// Read PEM-encoded PKCS8 public key from a file.
pub fn read_pem_public_key_file(path: &Path) -> Result<RsaPublicKey> {
    let reader = File::open(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    read_pem_public_key(path, reader)
}
