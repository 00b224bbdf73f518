// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Signing workflows. Every workflow builds the image header and digest from
//! scratch, so an image produced by [`Operation::SignEnc`] is byte-identical to
//! one produced by [`Operation::Digest`] followed by [`Operation::Stitch`] with
//! the same signature.

use std::{
    ffi::OsStr,
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    crypto::{self, EncryptionKey, PassphraseSource, RsaKey, RsaPublicKeyExt},
    format::shdr::{self, Container},
    image::{self, ImageParams, UnsignedImage},
    stream::ToWriter,
    token::{self, PLACEHOLDER_SIGNATURE_LEN, TokenSigner},
    util,
};

/// Broad classification of [`Error`] for reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Contradictory arguments.
    Config,
    /// Missing or unreadable input.
    Input,
    /// Unusable encryption key.
    Encryption,
    /// Key unusable for signing or signature length mismatch.
    Signing,
    /// Signature does not validate against the digest.
    Verification,
    /// No signature file for stitching.
    MissingArtifact,
    /// Failure writing an artifact.
    Output,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("A digest was requested, but an output file was given; did you mean --dig {0:?}?")]
    DigestWithOutput(PathBuf),
    #[error("Failed to read input file: {0:?}")]
    ReadInput(PathBuf, #[source] io::Error),
    #[error("Failed to load key: {0:?}")]
    LoadKey(PathBuf, #[source] crypto::Error),
    #[error("Invalid encryption key")]
    InvalidEncryptionKey(#[source] crypto::Error),
    #[error("Provided key cannot be used for signing; use the offline signing workflow instead")]
    NoPrivateKey,
    #[error("Failed to sign digest")]
    Sign(#[source] crypto::Error),
    #[error("Actual signature length ({actual}) does not match the header ({expected})")]
    SignatureLengthMismatch { expected: usize, actual: usize },
    #[error("Failed to sign digest with token")]
    Token(#[source] token::Error),
    #[error("Failed to read signature file: {0:?}")]
    ReadSignature(PathBuf, #[source] io::Error),
    #[error("Signature file is not valid base64: {0:?}")]
    DecodeSignature(PathBuf, #[source] base64::DecodeError),
    #[error("Verification failed; ignoring signature: {0:?}")]
    Verification(PathBuf, #[source] crypto::Error),
    #[error(
        "No signature file found. Sign {digest:?} offline and place the signature at \
         {signature:?}, or pass a different location with --sig"
    )]
    MissingSignature { digest: PathBuf, signature: PathBuf },
    #[error("Failed to write file: {0:?}")]
    WriteOutput(PathBuf, #[source] io::Error),
    #[error("Image error")]
    Image(#[from] image::Error),
    #[error("Container error")]
    Container(#[from] shdr::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DigestWithOutput(_) => ErrorKind::Config,
            Self::ReadInput(_, _) | Self::LoadKey(_, _) | Self::ReadSignature(_, _) => {
                ErrorKind::Input
            }
            Self::InvalidEncryptionKey(_) => ErrorKind::Encryption,
            Self::NoPrivateKey
            | Self::Sign(_)
            | Self::SignatureLengthMismatch { .. }
            | Self::Token(_) => ErrorKind::Signing,
            Self::DecodeSignature(_, _) | Self::Verification(_, _) => ErrorKind::Verification,
            Self::MissingSignature { .. } => ErrorKind::MissingArtifact,
            Self::WriteOutput(_, _) | Self::Container(_) => ErrorKind::Output,
            Self::Image(e) => match e {
                image::Error::ImageTooLarge(_) => ErrorKind::Input,
                image::Error::Encrypt(_) | image::Error::Decrypt(_) => ErrorKind::Encryption,
                image::Error::MissingEncryptionKey => ErrorKind::Encryption,
                image::Error::SignatureLenTooLarge(_) => ErrorKind::Signing,
                image::Error::DigestMismatch | image::Error::BadSignature(_) => {
                    ErrorKind::Verification
                }
                image::Error::Container(_) => ErrorKind::Output,
            },
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    SignEnc,
    Digest,
    Stitch,
    Pkcs11Sign,
}

/// Paths explicitly provided by the user.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathOverrides {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub digest: Option<PathBuf>,
    pub signature: Option<PathBuf>,
}

/// Files read or written by a workflow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactPaths {
    /// Raw TA binary.
    pub input: PathBuf,
    /// Signed container.
    pub output: PathBuf,
    /// Base64-encoded digest for offline signing.
    pub digest: PathBuf,
    /// Base64-encoded signature produced offline.
    pub signature: PathBuf,
}

impl ArtifactPaths {
    /// Paths derived from the UUID: `<uuid>.stripped.elf`, `<uuid>.ta`,
    /// `<uuid>.dig`, and `<uuid>.sig`.
    pub fn from_uuid(uuid: &Uuid) -> Self {
        Self {
            input: format!("{uuid}.stripped.elf").into(),
            output: format!("{uuid}.ta").into(),
            digest: format!("{uuid}.dig").into(),
            signature: format!("{uuid}.sig").into(),
        }
    }

    /// Fill in unset paths with the UUID-derived defaults. The digest workflow
    /// rejects an output path unless a digest path is also given, in which
    /// case the output path is ignored.
    pub fn resolve(uuid: &Uuid, kind: OperationKind, overrides: PathOverrides) -> Result<Self> {
        if kind == OperationKind::Digest {
            match (&overrides.digest, &overrides.output) {
                (None, Some(o)) => return Err(Error::DigestWithOutput(o.clone())),
                (Some(_), Some(o)) => {
                    warn!("A digest was requested, but both a digest and output path were given; ignoring output path: {o:?}");
                }
                _ => {}
            }
        }

        let defaults = Self::from_uuid(uuid);

        Ok(Self {
            input: overrides.input.unwrap_or(defaults.input),
            output: overrides.output.unwrap_or(defaults.output),
            digest: overrides.digest.unwrap_or(defaults.digest),
            signature: overrides.signature.unwrap_or(defaults.signature),
        })
    }
}

/// Fully resolved inputs shared by all workflows.
#[derive(Clone, Debug)]
pub struct Config {
    pub params: ImageParams,
    pub enc_key: Option<EncryptionKey>,
    pub paths: ArtifactPaths,
}

/// A signing workflow along with the key material it needs.
pub enum Operation<'a> {
    /// Sign with a local private key and write the container.
    SignEnc { key: &'a RsaKey },
    /// Write the digest for offline signing.
    Digest { key: &'a RsaKey },
    /// Verify an offline signature and write the container.
    Stitch { key: &'a RsaKey },
    /// Sign with an external token and write the container.
    Pkcs11Sign { signer: &'a mut dyn TokenSigner },
}

impl fmt::Debug for Operation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SignEnc { key } => f.debug_struct("SignEnc").field("key", key).finish(),
            Self::Digest { key } => f.debug_struct("Digest").field("key", key).finish(),
            Self::Stitch { key } => f.debug_struct("Stitch").field("key", key).finish(),
            Self::Pkcs11Sign { signer } => f
                .debug_struct("Pkcs11Sign")
                .field("signature_len", &signer.signature_len())
                .finish(),
        }
    }
}

impl Operation<'_> {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::SignEnc { .. } => OperationKind::SignEnc,
            Self::Digest { .. } => OperationKind::Digest,
            Self::Stitch { .. } => OperationKind::Stitch,
            Self::Pkcs11Sign { .. } => OperationKind::Pkcs11Sign,
        }
    }
}

/// What a successful workflow produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Image(PathBuf),
    Digest(PathBuf),
}

/// Write a file by writing to a temporary file in the same directory and then
/// renaming it over the target. The target is never left partially written.
fn write_file_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut temp_writer = NamedTempFile::with_prefix_in(
        path.file_name().unwrap_or_else(|| OsStr::new("tasign.tmp")),
        util::parent_path(path),
    )
    .map_err(|e| Error::WriteOutput(path.to_owned(), e))?;

    temp_writer
        .write_all(data)
        .and_then(|()| temp_writer.flush())
        .map_err(|e| Error::WriteOutput(path.to_owned(), e))?;

    // NamedTempFile forces 600 permissions on temp files because it's the safe
    // option for a shared /tmp. Since we're writing to the output file's
    // directory, just mimic umask.
    #[cfg(unix)]
    {
        use std::{fs::Permissions, os::unix::prelude::PermissionsExt};

        use rustix::{fs::Mode, process::umask};

        let mask = umask(Mode::empty());
        umask(mask);

        // Mac uses a 16-bit value.
        #[allow(clippy::useless_conversion)]
        let mode = u32::from(0o666 & !mask.bits());

        temp_writer
            .as_file()
            .set_permissions(Permissions::from_mode(mode))
            .map_err(|e| Error::WriteOutput(path.to_owned(), e))?;
    }

    temp_writer
        .persist(path)
        .map_err(|e| Error::WriteOutput(path.to_owned(), e.error))?;

    Ok(())
}

/// Load a PEM-encoded signing or verification key.
pub fn load_key(path: &Path, source: &PassphraseSource) -> Result<RsaKey> {
    crypto::read_pem_key_file(path, source).map_err(|e| Error::LoadKey(path.to_owned(), e))
}

/// Parse a hex-encoded AES key.
pub fn parse_enc_key(hex: &str) -> Result<EncryptionKey> {
    EncryptionKey::from_hex(hex).map_err(Error::InvalidEncryptionKey)
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::ReadInput(path.to_owned(), e))
}

fn write_container(path: &Path, container: &Container) -> Result<()> {
    let mut data = vec![];
    container.to_writer(&mut data)?;

    write_file_atomic(path, &data)
}

fn write_digest(path: &Path, digest: &[u8]) -> Result<()> {
    write_file_atomic(path, STANDARD.encode(digest).as_bytes())
}

/// Decode a base64 signature file. Whitespace, like the line wrapping added by
/// `base64(1)`, is ignored.
fn decode_signature(path: &Path, data: &[u8]) -> Result<Vec<u8>> {
    let filtered = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect::<Vec<_>>();

    STANDARD
        .decode(filtered)
        .map_err(|e| Error::DecodeSignature(path.to_owned(), e))
}

fn sign_enc(config: &Config, key: &RsaKey) -> Result<Outcome> {
    if !key.has_private() {
        return Err(Error::NoPrivateKey);
    }

    let plaintext = read_input(&config.paths.input)?;
    let image = UnsignedImage::build(&config.params, plaintext, config.enc_key.as_ref(), key.size())?;

    let signature = key
        .sign(config.params.algorithm, image.digest())
        .map_err(Error::Sign)?;

    let expected = usize::from(image.header().signature_len);
    if signature.len() != expected {
        return Err(Error::SignatureLengthMismatch {
            expected,
            actual: signature.len(),
        });
    }

    write_container(&config.paths.output, &image.into_container(signature))?;
    info!("Successfully signed application: {:?}", config.paths.output);

    Ok(Outcome::Image(config.paths.output.clone()))
}

fn digest(config: &Config, key: &RsaKey) -> Result<Outcome> {
    let plaintext = read_input(&config.paths.input)?;
    let image = UnsignedImage::build(&config.params, plaintext, config.enc_key.as_ref(), key.size())?;

    write_digest(&config.paths.digest, image.digest())?;
    info!("Wrote digest for offline signing: {:?}", config.paths.digest);

    Ok(Outcome::Digest(config.paths.digest.clone()))
}

fn stitch(config: &Config, key: &RsaKey) -> Result<Outcome> {
    let paths = &config.paths;
    let plaintext = read_input(&paths.input)?;
    let image = UnsignedImage::build(&config.params, plaintext, config.enc_key.as_ref(), key.size())?;

    let encoded = match fs::read(&paths.signature) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if !paths.digest.exists() {
                write_digest(&paths.digest, image.digest())?;
            }

            return Err(Error::MissingSignature {
                digest: paths.digest.clone(),
                signature: paths.signature.clone(),
            });
        }
        Err(e) => return Err(Error::ReadSignature(paths.signature.clone(), e)),
    };

    let signature = decode_signature(&paths.signature, &encoded)?;

    key.to_public_key()
        .verify_sig(config.params.algorithm, image.digest(), &signature)
        .map_err(|e| Error::Verification(paths.signature.clone(), e))?;

    write_container(&paths.output, &image.into_container(signature))?;
    info!("Successfully applied signature: {:?}", paths.output);

    Ok(Outcome::Image(paths.output.clone()))
}

fn pkcs11_sign(config: &Config, signer: &mut dyn TokenSigner) -> Result<Outcome> {
    let known_len = signer.signature_len();
    let signature_len = known_len.unwrap_or_else(|| {
        warn!(
            "Token key size is unknown; declaring placeholder signature length \
             of {PLACEHOLDER_SIGNATURE_LEN} bytes"
        );
        PLACEHOLDER_SIGNATURE_LEN
    });

    let plaintext = read_input(&config.paths.input)?;
    let image =
        UnsignedImage::build(&config.params, plaintext, config.enc_key.as_ref(), signature_len)?;

    let signature = signer
        .sign(image.digest(), config.params.algorithm)
        .map_err(Error::Token)?;

    if let Some(expected) = known_len {
        if signature.len() != expected {
            return Err(Error::SignatureLengthMismatch {
                expected,
                actual: signature.len(),
            });
        }
    }

    write_container(&config.paths.output, &image.into_container(signature))?;
    info!(
        "Successfully signed application with PKCS#11 token: {:?}",
        config.paths.output
    );

    Ok(Outcome::Image(config.paths.output.clone()))
}

/// Run a workflow to completion. Output files are only created once every
/// field has been computed.
pub fn run(config: &Config, operation: Operation<'_>) -> Result<Outcome> {
    match operation {
        Operation::SignEnc { key } => sign_enc(config, key),
        Operation::Digest { key } => digest(config, key),
        Operation::Stitch { key } => stitch(config, key),
        Operation::Pkcs11Sign { signer } => pkcs11_sign(config, signer),
    }
}
