/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{ffi::OsString, num::ParseIntError, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser};
use uuid::Uuid;

use crate::{
    cli::{status, warning},
    crypto::{EncryptionKey, PassphraseSource, RsaKey, SignatureAlgorithm},
    image::ImageParams,
    sign::{self, ArtifactPaths, Config, ErrorKind, Operation, Outcome, PathOverrides},
    token::{self, HelperSigner, TokenConfig},
};

/// Parse an integer with an optional `0x`, `0o`, or `0b` radix prefix.
pub(crate) fn parse_int(value: &str) -> std::result::Result<u32, ParseIntError> {
    let lower = value.to_ascii_lowercase();

    if let Some(v) = lower.strip_prefix("0x") {
        u32::from_str_radix(v, 16)
    } else if let Some(v) = lower.strip_prefix("0o") {
        u32::from_str_radix(v, 8)
    } else if let Some(v) = lower.strip_prefix("0b") {
        u32::from_str_radix(v, 2)
    } else {
        lower.parse()
    }
}

pub(crate) fn load_enc_key(hex: Option<&str>) -> Result<Option<EncryptionKey>> {
    let key = hex.map(sign::parse_enc_key).transpose()?;

    Ok(key)
}

pub(crate) fn load_key(group: &KeyGroup) -> Result<RsaKey> {
    let source = PassphraseSource::new(
        &group.key,
        group.pass_file.as_deref(),
        group.pass_env_var.as_deref(),
    );

    let key = sign::load_key(&group.key, &source)?;

    Ok(key)
}

#[derive(Debug, Args)]
pub(crate) struct ImageGroup {
    /// String UUID of the TA.
    #[arg(long, value_name = "UUID")]
    uuid: Uuid,

    /// Path to input TA binary [default: <UUID>.stripped.elf].
    #[arg(long = "in", value_name = "FILE", value_parser)]
    input: Option<PathBuf>,

    /// TA version, used for rollback protection.
    ///
    /// The value is stored as a 32-bit unsigned integer. A `0x` prefix can be
    /// used for hex values.
    #[arg(long, value_name = "N", default_value = "0", value_parser = parse_int)]
    ta_version: u32,

    /// Hash and signature algorithm.
    #[arg(long, value_name = "ALGO", default_value_t, value_enum)]
    algo: SignatureAlgorithm,
}

impl ImageGroup {
    fn params(&self) -> ImageParams {
        ImageParams {
            uuid: self.uuid,
            version: self.ta_version,
            algorithm: self.algo,
        }
    }
}

#[derive(Debug, Args)]
pub(crate) struct KeyGroup {
    /// Path to signing key (PEM format).
    ///
    /// A public key is sufficient for computing digests and stitching
    /// signatures.
    #[arg(long, value_name = "FILE", value_parser)]
    pub(crate) key: PathBuf,

    /// Environment variable containing private key passphrase.
    #[arg(long, value_name = "ENV_VAR", value_parser, group = "pass")]
    pub(crate) pass_env_var: Option<OsString>,

    /// File containing private key passphrase.
    #[arg(long, value_name = "FILE", value_parser, group = "pass")]
    pub(crate) pass_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct EncryptionGroup {
    /// AES key for encrypting the TA, as a hex string.
    ///
    /// The key size (128, 192, or 256 bits) is inferred from the length.
    #[arg(long, value_name = "HEX")]
    enc_key: Option<String>,
}

#[derive(Debug, Args)]
struct TokenGroup {
    /// Program that signs digests with the PKCS#11 token.
    ///
    /// The program is invoked with the algorithm name as the last argument and
    /// the PKCS11_* environment variables set. It receives the raw digest on
    /// stdin and must write the raw signature to stdout.
    #[arg(long, value_name = "PROGRAM", value_parser)]
    signing_helper: PathBuf,

    /// Extra argument to pass to the signing helper.
    #[arg(long, value_name = "ARG", value_parser, allow_hyphen_values = true)]
    signing_helper_arg: Vec<OsString>,

    /// Public key of the token's signing key (PEM format).
    ///
    /// If specified, the real signature size is declared in the header and the
    /// token's signature is verified before writing the image.
    #[arg(long, value_name = "FILE", value_parser)]
    public_key: Option<PathBuf>,

    /// Path to the PKCS#11 module.
    #[arg(long, value_name = "FILE", value_parser, env = "PKCS11_MODULE")]
    pkcs11_module: Option<PathBuf>,

    /// Label of the token containing the signing key.
    #[arg(long, value_name = "LABEL", env = "PKCS11_TOKEN_LABEL", default_value = token::DEFAULT_TOKEN_LABEL)]
    token_label: String,

    /// User PIN of the token. The token is not logged into if unset.
    #[arg(long, value_name = "PIN", env = "PKCS11_TOKEN_PIN", hide_env_values = true)]
    token_pin: Option<String>,

    /// Label of the signing key.
    #[arg(long, value_name = "LABEL", env = "PKCS11_KEY_LABEL")]
    key_label: Option<String>,

    /// ID of the signing key, as a hex string.
    #[arg(long, value_name = "HEX", env = "PKCS11_KEY_ID")]
    key_id: Option<String>,
}

impl TokenGroup {
    fn config(&self) -> Result<TokenConfig> {
        let key_id = self
            .key_id
            .as_deref()
            .map(hex::decode)
            .transpose()
            .context("Failed to parse PKCS#11 key ID")?;

        Ok(TokenConfig {
            module: self.pkcs11_module.clone(),
            token_label: self.token_label.clone(),
            pin: self.token_pin.clone(),
            key_label: self.key_label.clone(),
            key_id,
        })
    }
}

fn run(
    image: &ImageGroup,
    enc_key: Option<&str>,
    overrides: PathOverrides,
    operation: Operation<'_>,
) -> Result<()> {
    let paths = ArtifactPaths::resolve(&image.uuid, operation.kind(), overrides)?;
    let config = Config {
        params: image.params(),
        enc_key: load_enc_key(enc_key)?,
        paths,
    };

    match sign::run(&config, operation) {
        Ok(Outcome::Image(path)) => status!("Wrote signed image: {path:?}"),
        Ok(Outcome::Digest(path)) => status!("Wrote digest: {path:?}"),
        Err(e) => {
            match e.kind() {
                ErrorKind::MissingArtifact => {
                    warning!(
                        "Sign {:?} offline and place the base64-encoded signature at {:?}",
                        config.paths.digest,
                        config.paths.signature,
                    );
                }
                ErrorKind::Verification => {
                    warning!(
                        "Signature {:?} does not match the digest of {:?}",
                        config.paths.signature,
                        config.paths.input,
                    );
                }
                _ => {}
            }

            return Err(e).context("Failed to run signing workflow");
        }
    }

    Ok(())
}

pub fn sign_enc_main(cli: &SignEncCli) -> Result<()> {
    let key = load_key(&cli.key)?;

    run(
        &cli.image,
        cli.encryption.enc_key.as_deref(),
        PathOverrides {
            input: cli.image.input.clone(),
            output: cli.output.clone(),
            ..Default::default()
        },
        Operation::SignEnc { key: &key },
    )
}

pub fn digest_main(cli: &DigestCli) -> Result<()> {
    let key = load_key(&cli.key)?;

    run(
        &cli.image,
        cli.encryption.enc_key.as_deref(),
        PathOverrides {
            input: cli.image.input.clone(),
            output: cli.output.clone(),
            digest: cli.digest.clone(),
            ..Default::default()
        },
        Operation::Digest { key: &key },
    )
}

pub fn stitch_main(cli: &StitchCli) -> Result<()> {
    let key = load_key(&cli.key)?;

    run(
        &cli.image,
        cli.encryption.enc_key.as_deref(),
        PathOverrides {
            input: cli.image.input.clone(),
            output: cli.output.clone(),
            digest: cli.digest.clone(),
            signature: cli.signature.clone(),
        },
        Operation::Stitch { key: &key },
    )
}

pub fn pkcs11_sign_main(cli: &Pkcs11SignCli) -> Result<()> {
    let mut signer = HelperSigner::new(
        cli.token.signing_helper.clone(),
        cli.token.signing_helper_arg.clone(),
        cli.token.config()?,
    );

    if let Some(path) = &cli.token.public_key {
        let source = PassphraseSource::new(path, None, None);
        let key = sign::load_key(path, &source)?;

        signer = signer.with_public_key(key.to_public_key());
    }

    run(
        &cli.image,
        None,
        PathOverrides {
            input: cli.image.input.clone(),
            output: cli.output.clone(),
            ..Default::default()
        },
        Operation::Pkcs11Sign {
            signer: &mut signer,
        },
    )
}

/// Generate a signed and optionally encrypted TA image.
#[derive(Debug, Parser)]
pub struct SignEncCli {
    #[command(flatten)]
    image: ImageGroup,

    #[command(flatten)]
    key: KeyGroup,

    #[command(flatten)]
    encryption: EncryptionGroup,

    /// Path to output TA image [default: <UUID>.ta].
    #[arg(long = "out", value_name = "FILE", value_parser)]
    output: Option<PathBuf>,
}

/// Generate the TA image digest for offline signing.
#[derive(Debug, Parser)]
pub struct DigestCli {
    #[command(flatten)]
    image: ImageGroup,

    #[command(flatten)]
    key: KeyGroup,

    #[command(flatten)]
    encryption: EncryptionGroup,

    /// Path to output base64-encoded digest [default: <UUID>.dig].
    #[arg(long = "dig", value_name = "FILE", value_parser)]
    digest: Option<PathBuf>,

    /// Not used. Only accepted alongside --dig.
    #[arg(long = "out", value_name = "FILE", value_parser, hide = true)]
    output: Option<PathBuf>,
}

/// Generate a signed TA image from the raw TA and an offline signature.
///
/// If the signature file does not exist, the digest file is generated (if it
/// does not already exist) and the command fails.
#[derive(Debug, Parser)]
pub struct StitchCli {
    #[command(flatten)]
    image: ImageGroup,

    #[command(flatten)]
    key: KeyGroup,

    #[command(flatten)]
    encryption: EncryptionGroup,

    /// Path to input base64-encoded signature [default: <UUID>.sig].
    #[arg(long = "sig", value_name = "FILE", value_parser)]
    signature: Option<PathBuf>,

    /// Path to output base64-encoded digest [default: <UUID>.dig].
    #[arg(long = "dig", value_name = "FILE", value_parser)]
    digest: Option<PathBuf>,

    /// Path to output TA image [default: <UUID>.ta].
    #[arg(long = "out", value_name = "FILE", value_parser)]
    output: Option<PathBuf>,
}

/// Generate a signed TA image using a key stored in a PKCS#11 token.
#[derive(Debug, Parser)]
pub struct Pkcs11SignCli {
    #[command(flatten)]
    image: ImageGroup,

    #[command(flatten)]
    token: TokenGroup,

    /// Path to output TA image [default: <UUID>.ta].
    #[arg(long = "out", value_name = "FILE", value_parser)]
    output: Option<PathBuf>,
}
