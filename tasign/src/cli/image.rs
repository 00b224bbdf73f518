/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use crate::{
    cli::{
        sign::{self as sign_cli, KeyGroup},
        status,
    },
    format::shdr::{Container, EncryptionInfo, Header},
    image,
    stream::FromReader,
};

/// Container fields in a form suitable for display.
#[derive(Serialize)]
struct ContainerInfo<'a> {
    uuid: String,
    version: u32,
    #[serde(with = "hex")]
    digest: &'a [u8],
    #[serde(with = "hex")]
    signature: &'a [u8],
    payload_size: usize,
    header: &'a Header,
    #[serde(skip_serializing_if = "Option::is_none")]
    encryption: Option<&'a EncryptionInfo>,
}

impl<'a> From<&'a Container> for ContainerInfo<'a> {
    fn from(container: &'a Container) -> Self {
        Self {
            uuid: container.uuid.to_string(),
            version: container.version,
            digest: &container.digest,
            signature: &container.signature,
            payload_size: container.payload.len(),
            header: &container.header,
            encryption: container.encryption.as_ref(),
        }
    }
}

fn read_container(path: &Path) -> Result<Container> {
    let file = File::open(path).with_context(|| format!("Failed to open for reading: {path:?}"))?;

    Container::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse TA image: {path:?}"))
}

pub fn info_main(cli: &InfoCli) -> Result<()> {
    let container = read_container(&cli.input)?;

    let data = toml_edit::ser::to_string_pretty(&ContainerInfo::from(&container))
        .with_context(|| format!("Failed to serialize TA image info: {:?}", cli.input))?;
    print!("{data}");

    Ok(())
}

pub fn verify_main(cli: &VerifyCli) -> Result<()> {
    let container = read_container(&cli.input)?;
    let key = sign_cli::load_key(&cli.key)?;
    let enc_key = sign_cli::load_enc_key(cli.enc_key.as_deref())?;

    let plaintext = image::verify_container(&container, &key.to_public_key(), enc_key.as_ref())
        .with_context(|| format!("Failed to verify TA image: {:?}", cli.input))?;

    status!(
        "Successfully verified {} TA image ({} byte payload)",
        container.uuid,
        plaintext.len(),
    );

    Ok(())
}

/// Display TA image header information.
#[derive(Debug, Parser)]
pub struct InfoCli {
    /// Path to input TA image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

/// Verify the digest and signature of a TA image.
#[derive(Debug, Parser)]
pub struct VerifyCli {
    /// Path to input TA image.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    #[command(flatten)]
    key: KeyGroup,

    /// AES key the TA image was encrypted with, as a hex string.
    #[arg(long, value_name = "HEX")]
    enc_key: Option<String>,
}
