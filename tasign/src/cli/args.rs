/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;

use crate::cli::{image, sign};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
pub enum Command {
    SignEnc(sign::SignEncCli),
    #[command(alias = "generate-digest")]
    Digest(sign::DigestCli),
    #[command(alias = "stitch-ta")]
    Stitch(sign::StitchCli),
    Pkcs11Sign(sign::Pkcs11SignCli),
    Info(image::InfoCli),
    Verify(image::VerifyCli),
}

/// Sign and optionally encrypt a Trusted Application.
///
/// Offline signing with OpenSSL, for TEE_ALG_RSASSA_PKCS1_PSS_MGF1_SHA256:
///
///   base64 -d <UUID>.dig | openssl pkeyutl -sign -inkey <KEY>.pem
///   -pkeyopt digest:sha256 -pkeyopt rsa_padding_mode:pss
///   -pkeyopt rsa_pss_saltlen:digest -pkeyopt rsa_mgf1_md:sha256
///   | base64 > <UUID>.sig
///
/// For TEE_ALG_RSASSA_PKCS1_V1_5_SHA256, use `-pkeyopt rsa_padding_mode:pkcs1`
/// instead of the PSS options.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log level to show.
    #[arg(long, global = true, value_name = "LEVEL", default_value_t, value_enum)]
    pub log_level: LogLevel,
}

fn init_logging(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(Level::from(level))
        .with_target(false)
        .without_time()
        .init();
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level);
    logging_initialized.store(true, Ordering::SeqCst);

    match cli.command {
        Command::SignEnc(c) => sign::sign_enc_main(&c),
        Command::Digest(c) => sign::digest_main(&c),
        Command::Stitch(c) => sign::stitch_main(&c),
        Command::Pkcs11Sign(c) => sign::pkcs11_sign_main(&c),
        Command::Info(c) => image::info_main(&c),
        Command::Verify(c) => image::verify_main(&c),
    }
}
