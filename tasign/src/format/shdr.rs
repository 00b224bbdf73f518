// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Signed TA container. The layout is:
//!
//! ```text
//! RawHeader | digest | signature | uuid | version
//!     | RawEncHeader | nonce | tag | ciphertext   (encrypted images)
//!     | plaintext                               (bootstrap images)
//! ```
//!
//! All integers are little-endian and there is no padding between fields.

use std::{
    fmt,
    io::{self, Read, Write},
    mem,
};

use serde::{Deserialize, Serialize};
use sha2::Digest;
use thiserror::Error;
use uuid::Uuid;
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    crypto::{self, SignatureAlgorithm},
    stream::{FromReader, ReadFixedSizeExt, ReadToEndLimitExt, ToWriter},
    util::NumBytes,
};

/// Magic value for [`RawHeader::magic`].
pub const SHDR_MAGIC: u32 = 0x4f545348;

/// [`RawHeader::img_type`] for plain images.
const SHDR_BOOTSTRAP_TA: u32 = 1;
/// [`RawHeader::img_type`] for images followed by a [`RawEncHeader`].
const SHDR_ENCRYPTED_TA: u32 = 2;

/// GlobalPlatform algorithm ID for AES-GCM.
pub const ENC_ALGO_AES_GCM: u32 = 0x40000810;

/// The payload is encrypted with a key derived on the device.
pub const SHDR_ENC_KEY_DEV_SPECIFIC: u32 = 0;

/// Sanity limit for the digest, signature, nonce, and tag fields.
const MAX_FIELD_SIZE: u16 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Invalid image type: {0}")]
    InvalidImageType(u32),
    #[error("Unsupported encryption algorithm: {0:#010x}")]
    UnsupportedEncryptionAlgorithm(u32),
    #[error("{0:?} field length exceeds {MAX_FIELD_SIZE}: {1}")]
    FieldTooLarge(&'static str, usize),
    #[error("{field:?} field is {actual} bytes, but header declares {expected}")]
    FieldLengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Image type {image_type:?} does not agree with presence of encryption header")]
    EncryptionMismatch { image_type: ImageType },
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("Failed to read container data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Failed to write container data: {0}")]
    DataWrite(&'static str, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`SHDR_MAGIC`].
    magic: little_endian::U32,
    /// [`SHDR_BOOTSTRAP_TA`] or [`SHDR_ENCRYPTED_TA`].
    img_type: little_endian::U32,
    /// Size of the plaintext payload.
    img_size: little_endian::U32,
    /// Signature algorithm ID.
    algo: little_endian::U32,
    /// Size of the digest that follows this header.
    hash_size: little_endian::U16,
    /// Size of the signature that follows the digest.
    sig_size: little_endian::U16,
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &format_args!("{:#010x}", self.magic.get()))
            .field("img_type", &self.img_type.get())
            .field("img_size", &self.img_size.get())
            .field("algo", &format_args!("{:#010x}", self.algo.get()))
            .field("hash_size", &self.hash_size.get())
            .field("sig_size", &self.sig_size.get())
            .finish()
    }
}

/// Raw on-disk layout for the encryption header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawEncHeader {
    /// Encryption algorithm ID. Only [`ENC_ALGO_AES_GCM`] is supported.
    enc_algo: little_endian::U32,
    /// Key derivation flags.
    flags: little_endian::U32,
    /// Size of the nonce that follows this header.
    iv_size: little_endian::U16,
    /// Size of the tag that follows the nonce.
    tag_size: little_endian::U16,
}

impl fmt::Debug for RawEncHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawEncHeader")
            .field("enc_algo", &format_args!("{:#010x}", self.enc_algo.get()))
            .field("flags", &format_args!("{:#010x}", self.flags.get()))
            .field("iv_size", &self.iv_size.get())
            .field("tag_size", &self.tag_size.get())
            .finish()
    }
}

/// Size of the serialized [`Header`].
pub const HEADER_SIZE: usize = mem::size_of::<RawHeader>();

/// Size of the serialized encryption header, excluding the nonce and tag.
pub const ENC_HEADER_SIZE: usize = mem::size_of::<RawEncHeader>();

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ImageType {
    Bootstrap,
    Encrypted,
}

impl ImageType {
    fn from_raw(value: u32) -> Result<Self> {
        match value {
            SHDR_BOOTSTRAP_TA => Ok(Self::Bootstrap),
            SHDR_ENCRYPTED_TA => Ok(Self::Encrypted),
            v => Err(Error::InvalidImageType(v)),
        }
    }

    fn to_raw(self) -> u32 {
        match self {
            Self::Bootstrap => SHDR_BOOTSTRAP_TA,
            Self::Encrypted => SHDR_ENCRYPTED_TA,
        }
    }
}

/// Unencrypted image header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Header {
    pub image_type: ImageType,
    /// Size of the plaintext payload.
    pub image_size: u32,
    pub algorithm: SignatureAlgorithm,
    pub digest_len: u16,
    /// Declared signature size. This is the RSA modulus size, except for
    /// token-signed images where the key size is not known up front.
    pub signature_len: u16,
}

impl Header {
    fn to_raw(self) -> RawHeader {
        RawHeader {
            magic: SHDR_MAGIC.into(),
            img_type: self.image_type.to_raw().into(),
            img_size: self.image_size.into(),
            algo: self.algorithm.id().into(),
            hash_size: self.digest_len.into(),
            sig_size: self.signature_len.into(),
        }
    }

    fn from_raw(raw: &RawHeader) -> Result<Self> {
        if raw.magic.get() != SHDR_MAGIC {
            return Err(Error::InvalidMagic(raw.magic.get()));
        }

        let header = Self {
            image_type: ImageType::from_raw(raw.img_type.get())?,
            image_size: raw.img_size.get(),
            algorithm: SignatureAlgorithm::from_id(raw.algo.get())?,
            digest_len: raw.hash_size.get(),
            signature_len: raw.sig_size.get(),
        };

        for (name, size) in [
            ("digest", header.digest_len),
            ("signature", header.signature_len),
        ] {
            if size > MAX_FIELD_SIZE {
                return Err(Error::FieldTooLarge(name, size.into()));
            }
        }

        Ok(header)
    }

    /// Serialize the header exactly as it appears in the container.
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf.copy_from_slice(self.to_raw().as_bytes());
        buf
    }
}

/// Encryption header along with the nonce and tag that follow it.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EncryptionInfo {
    pub algorithm: u32,
    pub flags: u32,
    #[serde(with = "hex")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex")]
    pub tag: Vec<u8>,
}

impl fmt::Debug for EncryptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionInfo")
            .field("algorithm", &format_args!("{:#010x}", self.algorithm))
            .field("flags", &format_args!("{:#010x}", self.flags))
            .field("nonce", &hex::encode(&self.nonce))
            .field("tag", &hex::encode(&self.tag))
            .finish()
    }
}

impl EncryptionInfo {
    /// AES-GCM with a device-specific key.
    pub fn aes_gcm(nonce: Vec<u8>, tag: Vec<u8>) -> Self {
        Self {
            algorithm: ENC_ALGO_AES_GCM,
            flags: SHDR_ENC_KEY_DEV_SPECIFIC,
            nonce,
            tag,
        }
    }

    fn to_raw(&self) -> Result<RawEncHeader> {
        let iv_size = field_len("nonce", &self.nonce)?;
        let tag_size = field_len("tag", &self.tag)?;

        Ok(RawEncHeader {
            enc_algo: self.algorithm.into(),
            flags: self.flags.into(),
            iv_size: iv_size.into(),
            tag_size: tag_size.into(),
        })
    }

    /// Serialize the encryption header, nonce, and tag exactly as they appear
    /// in the container.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let raw = self.to_raw()?;

        let mut buf = Vec::with_capacity(ENC_HEADER_SIZE + self.nonce.len() + self.tag.len());
        buf.extend_from_slice(raw.as_bytes());
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.tag);

        Ok(buf)
    }
}

fn field_len(name: &'static str, data: &[u8]) -> Result<u16> {
    match u16::try_from(data.len()) {
        Ok(n) if n <= MAX_FIELD_SIZE => Ok(n),
        _ => Err(Error::FieldTooLarge(name, data.len())),
    }
}

/// Compute the digest that gets signed. The digest always covers the
/// plaintext, even for encrypted images.
pub fn compute_digest(
    header: &Header,
    uuid: &Uuid,
    version: u32,
    encryption: Option<&EncryptionInfo>,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let mut hasher = header.algorithm.hasher();

    hasher.update(header.to_bytes());
    hasher.update(uuid.as_bytes());
    hasher.update(version.to_le_bytes());
    if let Some(e) = encryption {
        hasher.update(e.to_bytes()?);
    }
    hasher.update(plaintext);

    Ok(hasher.finalize().to_vec())
}

/// A complete signed image.
#[derive(Clone, PartialEq, Eq)]
pub struct Container {
    pub header: Header,
    pub digest: Vec<u8>,
    pub signature: Vec<u8>,
    pub uuid: Uuid,
    pub version: u32,
    pub encryption: Option<EncryptionInfo>,
    /// Ciphertext for encrypted images and plaintext otherwise.
    pub payload: Vec<u8>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("header", &self.header)
            .field("digest", &hex::encode(&self.digest))
            .field("signature", &hex::encode(&self.signature))
            .field("uuid", &self.uuid)
            .field("version", &self.version)
            .field("encryption", &self.encryption)
            .field("payload", &NumBytes(self.payload.len()))
            .finish()
    }
}

impl Container {
    /// Check the header against the fields that follow it. The signature
    /// length is not checked because token-signed images may carry a
    /// placeholder value.
    pub fn validate(&self) -> Result<()> {
        let has_encryption = self.encryption.is_some();
        if has_encryption != (self.header.image_type == ImageType::Encrypted) {
            return Err(Error::EncryptionMismatch {
                image_type: self.header.image_type,
            });
        }

        if usize::from(self.header.digest_len) != self.digest.len() {
            return Err(Error::FieldLengthMismatch {
                field: "digest",
                expected: self.header.digest_len.into(),
                actual: self.digest.len(),
            });
        }

        // AES-GCM does not change the payload size.
        if self.header.image_size as usize != self.payload.len() {
            return Err(Error::FieldLengthMismatch {
                field: "payload",
                expected: self.header.image_size as usize,
                actual: self.payload.len(),
            });
        }

        if let Some(e) = &self.encryption {
            if e.algorithm != ENC_ALGO_AES_GCM {
                return Err(Error::UnsupportedEncryptionAlgorithm(e.algorithm));
            }
        }

        Ok(())
    }

    /// Get the plaintext payload, decrypting it if needed. Returns [`None`] if
    /// the payload is encrypted and no key was given.
    pub fn plaintext(
        &self,
        key: Option<&crypto::EncryptionKey>,
    ) -> std::result::Result<Option<Vec<u8>>, crypto::Error> {
        match (&self.encryption, key) {
            (None, _) => Ok(Some(self.payload.clone())),
            (Some(e), Some(k)) => k.decrypt(&e.nonce, &self.payload, &e.tag).map(Some),
            (Some(_), None) => Ok(None),
        }
    }
}

impl<R: Read> FromReader<R> for Container {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let raw_header =
            RawHeader::read_from_io(&mut reader).map_err(|e| Error::DataRead("header", e))?;
        let header = Header::from_raw(&raw_header)?;

        let digest = reader
            .read_vec_exact(header.digest_len.into())
            .map_err(|e| Error::DataRead("digest", e))?;
        let signature = reader
            .read_vec_exact(header.signature_len.into())
            .map_err(|e| Error::DataRead("signature", e))?;
        let uuid = reader
            .read_array_exact::<16>()
            .map(Uuid::from_bytes)
            .map_err(|e| Error::DataRead("uuid", e))?;
        let version = little_endian::U32::read_from_io(&mut reader)
            .map_err(|e| Error::DataRead("version", e))?
            .get();

        let encryption = match header.image_type {
            ImageType::Bootstrap => None,
            ImageType::Encrypted => {
                let raw = RawEncHeader::read_from_io(&mut reader)
                    .map_err(|e| Error::DataRead("encryption header", e))?;

                for (name, size) in [("nonce", raw.iv_size.get()), ("tag", raw.tag_size.get())] {
                    if size > MAX_FIELD_SIZE {
                        return Err(Error::FieldTooLarge(name, size.into()));
                    }
                }

                let nonce = reader
                    .read_vec_exact(raw.iv_size.get().into())
                    .map_err(|e| Error::DataRead("nonce", e))?;
                let tag = reader
                    .read_vec_exact(raw.tag_size.get().into())
                    .map_err(|e| Error::DataRead("tag", e))?;

                Some(EncryptionInfo {
                    algorithm: raw.enc_algo.get(),
                    flags: raw.flags.get(),
                    nonce,
                    tag,
                })
            }
        };

        let payload = reader
            .read_to_end_limit(header.image_size.into())
            .map_err(|e| Error::DataRead("payload", e))?;

        let container = Self {
            header,
            digest,
            signature,
            uuid,
            version,
            encryption,
            payload,
        };

        container.validate()?;

        Ok(container)
    }
}

impl<W: Write> ToWriter<W> for Container {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        self.validate()?;

        // Serialize everything first so that a validation failure never
        // results in a partial write.
        let encryption = self
            .encryption
            .as_ref()
            .map(EncryptionInfo::to_bytes)
            .transpose()?;

        writer
            .write_all(&self.header.to_bytes())
            .map_err(|e| Error::DataWrite("header", e))?;
        writer
            .write_all(&self.digest)
            .map_err(|e| Error::DataWrite("digest", e))?;
        writer
            .write_all(&self.signature)
            .map_err(|e| Error::DataWrite("signature", e))?;
        writer
            .write_all(self.uuid.as_bytes())
            .map_err(|e| Error::DataWrite("uuid", e))?;
        writer
            .write_all(&self.version.to_le_bytes())
            .map_err(|e| Error::DataWrite("version", e))?;
        if let Some(data) = encryption {
            writer
                .write_all(&data)
                .map_err(|e| Error::DataWrite("encryption header", e))?;
        }
        writer
            .write_all(&self.payload)
            .map_err(|e| Error::DataWrite("payload", e))?;

        Ok(())
    }
}
