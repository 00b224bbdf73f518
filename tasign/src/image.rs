// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use rsa::RsaPublicKey;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    crypto::{self, EncryptionKey, RsaPublicKeyExt, SignatureAlgorithm},
    format::shdr::{self, Container, EncryptionInfo, Header, ImageType},
    util::NumBytes,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Image size exceeds 32-bit limit: {0}")]
    ImageTooLarge(usize),
    #[error("Signature size exceeds 16-bit limit: {0}")]
    SignatureLenTooLarge(usize),
    #[error("Failed to encrypt image")]
    Encrypt(#[source] crypto::Error),
    #[error("Failed to decrypt image")]
    Decrypt(#[source] crypto::Error),
    #[error("Image is encrypted, but no encryption key was provided")]
    MissingEncryptionKey,
    #[error("Stored digest does not match the computed digest")]
    DigestMismatch,
    #[error("Signature does not match the digest")]
    BadSignature(#[source] crypto::Error),
    #[error("Container error")]
    Container(#[from] shdr::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Fields that identify an image independently of its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageParams {
    pub uuid: Uuid,
    pub version: u32,
    pub algorithm: SignatureAlgorithm,
}

/// An image whose header and digest have been computed, but which has not been
/// signed yet.
#[derive(Clone)]
pub struct UnsignedImage {
    header: Header,
    uuid: Uuid,
    version: u32,
    encryption: Option<EncryptionInfo>,
    /// Ciphertext for encrypted images and plaintext otherwise.
    payload: Vec<u8>,
    digest: Vec<u8>,
}

impl fmt::Debug for UnsignedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsignedImage")
            .field("header", &self.header)
            .field("uuid", &self.uuid)
            .field("version", &self.version)
            .field("encryption", &self.encryption)
            .field("payload", &NumBytes(self.payload.len()))
            .field("digest", &hex::encode(&self.digest))
            .finish()
    }
}

impl UnsignedImage {
    /// Build the header and compute the digest for `plaintext`. If `enc_key`
    /// is set, the payload is encrypted with a fresh nonce. `signature_len` is
    /// the value declared in the header.
    pub fn build(
        params: &ImageParams,
        plaintext: Vec<u8>,
        enc_key: Option<&EncryptionKey>,
        signature_len: usize,
    ) -> Result<Self> {
        let image_size =
            u32::try_from(plaintext.len()).map_err(|_| Error::ImageTooLarge(plaintext.len()))?;
        let signature_len =
            u16::try_from(signature_len).map_err(|_| Error::SignatureLenTooLarge(signature_len))?;
        let digest_len = params.algorithm.digest_len() as u16;

        let (image_type, encryption, ciphertext) = match enc_key {
            Some(key) => {
                let sealed = key.encrypt(&plaintext).map_err(Error::Encrypt)?;
                let info = EncryptionInfo::aes_gcm(sealed.nonce, sealed.tag);

                (ImageType::Encrypted, Some(info), Some(sealed.ciphertext))
            }
            None => (ImageType::Bootstrap, None, None),
        };

        let header = Header {
            image_type,
            image_size,
            algorithm: params.algorithm,
            digest_len,
            signature_len,
        };

        let digest = shdr::compute_digest(
            &header,
            &params.uuid,
            params.version,
            encryption.as_ref(),
            &plaintext,
        )?;

        debug!("Computed digest for {header:?}: {}", hex::encode(&digest));

        Ok(Self {
            header,
            uuid: params.uuid,
            version: params.version,
            encryption,
            payload: ciphertext.unwrap_or(plaintext),
            digest,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    pub fn encryption(&self) -> Option<&EncryptionInfo> {
        self.encryption.as_ref()
    }

    /// Attach the signature. No length checks are performed here.
    pub fn into_container(self, signature: Vec<u8>) -> Container {
        Container {
            header: self.header,
            digest: self.digest,
            signature,
            uuid: self.uuid,
            version: self.version,
            encryption: self.encryption,
            payload: self.payload,
        }
    }
}

/// Recompute the digest of a container and verify its signature. Returns the
/// plaintext payload on success.
pub fn verify_container(
    container: &Container,
    public_key: &RsaPublicKey,
    enc_key: Option<&EncryptionKey>,
) -> Result<Vec<u8>> {
    container.validate()?;

    let plaintext = container
        .plaintext(enc_key)
        .map_err(Error::Decrypt)?
        .ok_or(Error::MissingEncryptionKey)?;

    let digest = shdr::compute_digest(
        &container.header,
        &container.uuid,
        container.version,
        container.encryption.as_ref(),
        &plaintext,
    )?;

    if digest != container.digest {
        return Err(Error::DigestMismatch);
    }

    public_key
        .verify_sig(container.header.algorithm, &digest, &container.signature)
        .map_err(Error::BadSignature)?;

    Ok(plaintext)
}
