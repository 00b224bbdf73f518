// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsString,
    fmt,
    io::{self, Write},
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
};

use rsa::{RsaPublicKey, traits::PublicKeyParts};
use thiserror::Error;
use tracing::debug;

use crate::{
    crypto::{self, RsaPublicKeyExt, SignatureAlgorithm},
    util::DebugString,
};

/// Token label used when `PKCS11_TOKEN_LABEL` is not set.
pub const DEFAULT_TOKEN_LABEL: &str = "OP-TEE TA authentication";

/// Signature length declared in the header when the token's key size is not
/// known before signing. This value is not authoritative.
pub const PLACEHOLDER_SIGNATURE_LEN: usize = 28;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to run command: {0:?}")]
    CommandSpawn(DebugString, #[source] io::Error),
    #[error("Command failed with status: {1}: {0:?}")]
    CommandExecution(DebugString, ExitStatus),
    #[error("Failed to send digest to signing helper")]
    WriteDigest(#[source] io::Error),
    #[error("Signing helper returned an empty signature")]
    EmptySignature,
    #[error("Invalid signature length ({actual} bytes); expected {expected} bytes")]
    InvalidSignatureLength { expected: usize, actual: usize },
    #[error("Signature from signing helper does not match public key")]
    BadSignature(#[source] crypto::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Location of the signing key inside a PKCS#11 token.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenConfig {
    /// Path to the PKCS#11 module.
    pub module: Option<PathBuf>,
    pub token_label: String,
    /// User PIN. The token is not logged into if this is unset.
    pub pin: Option<String>,
    pub key_label: Option<String>,
    pub key_id: Option<Vec<u8>>,
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("module", &self.module)
            .field("token_label", &self.token_label)
            .field("pin", &self.pin.as_ref().map(|_| "<redacted>"))
            .field("key_label", &self.key_label)
            .field("key_id", &self.key_id.as_ref().map(hex::encode))
            .finish()
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            module: None,
            token_label: DEFAULT_TOKEN_LABEL.to_owned(),
            pin: None,
            key_label: None,
            key_id: None,
        }
    }
}

impl TokenConfig {
    /// Export the configuration as the `PKCS11_*` environment variables. Unset
    /// fields are removed from the inherited environment.
    fn apply_env(&self, command: &mut Command) {
        let vars: [(&str, Option<OsString>); 5] = [
            ("PKCS11_MODULE", self.module.clone().map(OsString::from)),
            ("PKCS11_TOKEN_LABEL", Some(self.token_label.clone().into())),
            ("PKCS11_TOKEN_PIN", self.pin.clone().map(OsString::from)),
            ("PKCS11_KEY_LABEL", self.key_label.clone().map(OsString::from)),
            ("PKCS11_KEY_ID", self.key_id.as_ref().map(|id| hex::encode(id).into())),
        ];

        for (name, value) in vars {
            match value {
                Some(v) => command.env(name, v),
                None => command.env_remove(name),
            };
        }
    }
}

/// A signer whose private key lives outside of this process.
pub trait TokenSigner {
    /// Size of the signature in bytes, if it is known before signing.
    fn signature_len(&self) -> Option<usize> {
        None
    }

    /// Sign the raw digest. A session is opened and closed for each call.
    fn sign(&mut self, digest: &[u8], algo: SignatureAlgorithm) -> Result<Vec<u8>>;
}

/// Delegates signing to an external program that talks to the token.
///
/// The program is invoked as `<program> [args...] <algorithm>` with the
/// [`TokenConfig`] exported as `PKCS11_*` environment variables. It receives
/// the raw digest on stdin and must write the raw signature to stdout.
pub struct HelperSigner {
    program: PathBuf,
    args: Vec<OsString>,
    config: TokenConfig,
    public_key: Option<RsaPublicKey>,
}

impl fmt::Debug for HelperSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperSigner")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("config", &self.config)
            .field("public_key", &self.public_key.as_ref().map(|k| k.size() * 8))
            .finish()
    }
}

impl HelperSigner {
    pub fn new(program: PathBuf, args: Vec<OsString>, config: TokenConfig) -> Self {
        Self {
            program,
            args,
            config,
            public_key: None,
        }
    }

    /// Set the public key of the token's signing key. This makes the
    /// signature size known up front and enables checking the helper's output.
    pub fn with_public_key(mut self, public_key: RsaPublicKey) -> Self {
        self.public_key = Some(public_key);
        self
    }
}

impl TokenSigner for HelperSigner {
    fn signature_len(&self) -> Option<usize> {
        self.public_key.as_ref().map(|k| k.size())
    }

    fn sign(&mut self, digest: &[u8], algo: SignatureAlgorithm) -> Result<Vec<u8>> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.arg(algo.to_string());
        self.config.apply_env(&mut command);

        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::inherit());

        debug!("Running signing helper: {command:?}");

        let mut child = command
            .spawn()
            .map_err(|e| Error::CommandSpawn(DebugString::new(&command), e))?;

        // The pipe capacity on all major OSs is significantly larger than the
        // digest, so this cannot deadlock even if the helper never reads it.
        if let Err(e) = child.stdin.as_mut().unwrap().write_all(digest) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::WriteDigest(e));
        }

        let child = child
            .wait_with_output()
            .map_err(|e| Error::CommandSpawn(DebugString::new(&command), e))?;

        if !child.status.success() {
            return Err(Error::CommandExecution(
                DebugString::new(&command),
                child.status,
            ));
        } else if child.stdout.is_empty() {
            return Err(Error::EmptySignature);
        }

        if let Some(public_key) = &self.public_key {
            if child.stdout.len() != public_key.size() {
                return Err(Error::InvalidSignatureLength {
                    expected: public_key.size(),
                    actual: child.stdout.len(),
                });
            }

            // Check that the helper signed with the proper key.
            public_key
                .verify_sig(algo, digest, &child.stdout)
                .map_err(Error::BadSignature)?;
        }

        Ok(child.stdout)
    }
}
