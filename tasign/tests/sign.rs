/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs,
    io::Cursor,
    path::{Path, PathBuf},
};

use assert_matches::assert_matches;
use base64::{Engine, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use uuid::Uuid;

use tasign::{
    crypto::{self, EncryptionKey, PassphraseSource, RsaKey, RsaPublicKeyExt, SignatureAlgorithm},
    format::shdr::{self, Container, ImageType},
    image::{self, ImageParams},
    sign::{self, ArtifactPaths, Config, Error, ErrorKind, Operation, Outcome},
    stream::FromReader,
    token::{self, PLACEHOLDER_SIGNATURE_LEN, TokenSigner},
};

const TEST_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_567812345678);

fn data_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join(name)
}

fn load_key(name: &str) -> RsaKey {
    let path = data_path(name);
    let source = PassphraseSource::new(&path, None, None);

    crypto::read_pem_key_file(&path, &source).unwrap()
}

fn get_test_key() -> RsaKey {
    load_key("TEST_KEY_DO_NOT_USE.key")
}

fn get_enc_key() -> EncryptionKey {
    EncryptionKey::from_hex("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")
        .unwrap()
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new(payload: &[u8]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Self { dir };
        fs::write(workspace.paths().input, payload).unwrap();
        workspace
    }

    fn paths(&self) -> ArtifactPaths {
        let defaults = ArtifactPaths::from_uuid(&TEST_UUID);
        let join = |p: PathBuf| self.dir.path().join(p);

        ArtifactPaths {
            input: join(defaults.input),
            output: join(defaults.output),
            digest: join(defaults.digest),
            signature: join(defaults.signature),
        }
    }

    fn config(&self, algorithm: SignatureAlgorithm, enc_key: Option<EncryptionKey>) -> Config {
        Config {
            params: ImageParams {
                uuid: TEST_UUID,
                version: 0,
                algorithm,
            },
            enc_key,
            paths: self.paths(),
        }
    }

    fn read_output(&self) -> Vec<u8> {
        fs::read(self.paths().output).unwrap()
    }
}

fn parse(data: &[u8]) -> Container {
    Container::from_reader(Cursor::new(data)).unwrap()
}

#[test]
fn sign_enc_empty_bootstrap_image() {
    let workspace = Workspace::new(b"");
    let config = workspace.config(SignatureAlgorithm::RsaPssMgf1Sha256, None);
    let key = get_test_key();

    let outcome = sign::run(&config, Operation::SignEnc { key: &key }).unwrap();
    assert_eq!(outcome, Outcome::Image(config.paths.output.clone()));

    let data = workspace.read_output();
    assert_eq!(data.len(), shdr::HEADER_SIZE + 32 + 256 + 16 + 4);

    // magic | img_type | img_size | algo | hash_size | sig_size
    assert_eq!(&data[0..4], b"HSTO");
    assert_eq!(&data[4..8], &1u32.to_le_bytes());
    assert_eq!(&data[8..12], &0u32.to_le_bytes());
    assert_eq!(&data[12..16], &0x70414930u32.to_le_bytes());
    assert_eq!(&data[16..18], &32u16.to_le_bytes());
    assert_eq!(&data[18..20], &256u16.to_le_bytes());

    let uuid_offset = shdr::HEADER_SIZE + 32 + 256;
    assert_eq!(
        &data[uuid_offset..uuid_offset + 16],
        &[
            0x12, 0x34, 0x56, 0x78, 0x12, 0x34, 0x56, 0x78, 0x12, 0x34, 0x56, 0x78, 0x12, 0x34,
            0x56, 0x78,
        ],
    );
    assert_eq!(&data[uuid_offset + 16..], &[0, 0, 0, 0]);

    let mut hasher = Sha256::new();
    hasher.update(&data[..shdr::HEADER_SIZE]);
    hasher.update(&data[uuid_offset..]);
    let expected_digest = hasher.finalize();
    assert_eq!(&data[shdr::HEADER_SIZE..shdr::HEADER_SIZE + 32], expected_digest.as_slice());

    let container = parse(&data);
    assert_eq!(container.header.image_type, ImageType::Bootstrap);
    assert_eq!(container.uuid, TEST_UUID);
    assert!(container.payload.is_empty());

    let plaintext = image::verify_container(&container, &key.to_public_key(), None).unwrap();
    assert!(plaintext.is_empty());
}

#[test]
fn sign_enc_encrypted_image() {
    let payload = b"\x7fELF test application";
    let workspace = Workspace::new(payload);
    let config = workspace.config(SignatureAlgorithm::RsaPssMgf1Sha256, Some(get_enc_key()));
    let key = get_test_key();

    sign::run(&config, Operation::SignEnc { key: &key }).unwrap();

    let data = workspace.read_output();
    assert_eq!(&data[4..8], &2u32.to_le_bytes());
    assert_eq!(&data[8..12], &(payload.len() as u32).to_le_bytes());

    let container = parse(&data);
    assert_eq!(container.header.image_type, ImageType::Encrypted);
    assert_eq!(container.payload.len(), payload.len());
    assert_ne!(container.payload, payload);

    let encryption = container.encryption.as_ref().unwrap();
    assert_eq!(encryption.algorithm, shdr::ENC_ALGO_AES_GCM);
    assert_eq!(encryption.flags, 0);
    assert_eq!(encryption.nonce.len(), 12);
    assert_eq!(encryption.tag.len(), 16);

    let plaintext =
        image::verify_container(&container, &key.to_public_key(), Some(&get_enc_key())).unwrap();
    assert_eq!(plaintext, payload);

    assert_matches!(
        image::verify_container(&container, &key.to_public_key(), None),
        Err(image::Error::MissingEncryptionKey)
    );

    let wrong_key = EncryptionKey::from_hex(&"ff".repeat(16)).unwrap();
    assert_matches!(
        image::verify_container(&container, &key.to_public_key(), Some(&wrong_key)),
        Err(image::Error::Decrypt(_))
    );
}

#[test]
fn sign_enc_requires_private_key() {
    let workspace = Workspace::new(b"payload");
    let config = workspace.config(SignatureAlgorithm::RsaPssMgf1Sha256, None);
    let key = load_key("TEST_KEY_DO_NOT_USE.pub");
    assert!(!key.has_private());

    let err = sign::run(&config, Operation::SignEnc { key: &key }).unwrap_err();
    assert_matches!(err, Error::NoPrivateKey);
    assert_eq!(err.kind(), ErrorKind::Signing);
    assert!(!config.paths.output.exists());
}

#[test]
fn offline_signing_matches_sign_enc() {
    for algorithm in [
        SignatureAlgorithm::RsaPssMgf1Sha256,
        SignatureAlgorithm::RsaPkcs1V15Sha256,
    ] {
        let workspace = Workspace::new(b"\x7fELF offline");
        let config = workspace.config(algorithm, None);
        let private_key = get_test_key();
        let public_key = load_key("TEST_KEY_DO_NOT_USE.pub");

        sign::run(&config, Operation::SignEnc { key: &private_key }).unwrap();
        let expected = workspace.read_output();
        fs::remove_file(&config.paths.output).unwrap();

        // Computing the digest only needs the public key.
        let outcome = sign::run(&config, Operation::Digest { key: &public_key }).unwrap();
        assert_eq!(outcome, Outcome::Digest(config.paths.digest.clone()));
        assert!(!config.paths.output.exists());

        let encoded = fs::read_to_string(&config.paths.digest).unwrap();
        assert!(!encoded.ends_with('\n'));
        let digest = STANDARD.decode(&encoded).unwrap();

        let container = parse(&expected);
        assert_eq!(digest, container.digest);

        // PSS is randomized, so reuse the signature from the first image.
        let signature = match algorithm {
            SignatureAlgorithm::RsaPssMgf1Sha256 => container.signature.clone(),
            SignatureAlgorithm::RsaPkcs1V15Sha256 => private_key.sign(algorithm, &digest).unwrap(),
        };

        // Emulate the line wrapping of base64(1).
        let mut wrapped = STANDARD.encode(&signature);
        wrapped.insert(76, '\n');
        wrapped.push('\n');
        fs::write(&config.paths.signature, wrapped).unwrap();

        let outcome = sign::run(&config, Operation::Stitch { key: &public_key }).unwrap();
        assert_eq!(outcome, Outcome::Image(config.paths.output.clone()));
        assert_eq!(workspace.read_output(), expected, "{algorithm}");
    }
}

#[test]
fn stitch_without_signature_writes_digest() {
    let workspace = Workspace::new(b"\x7fELF missing");
    let config = workspace.config(SignatureAlgorithm::RsaPssMgf1Sha256, None);
    let key = load_key("TEST_KEY_DO_NOT_USE.pub");

    let err = sign::run(&config, Operation::Stitch { key: &key }).unwrap_err();
    assert_matches!(err, Error::MissingSignature { .. });
    assert_eq!(err.kind(), ErrorKind::MissingArtifact);
    assert!(!config.paths.output.exists());

    let encoded = fs::read_to_string(&config.paths.digest).unwrap();
    assert_eq!(STANDARD.decode(encoded).unwrap().len(), 32);

    // An existing digest file is left alone.
    fs::write(&config.paths.digest, "existing").unwrap();
    let err = sign::run(&config, Operation::Stitch { key: &key }).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MissingArtifact);
    assert_eq!(fs::read_to_string(&config.paths.digest).unwrap(), "existing");
}

#[test]
fn stitch_rejects_foreign_signature() {
    let workspace = Workspace::new(b"\x7fELF foreign");
    let config = workspace.config(SignatureAlgorithm::RsaPssMgf1Sha256, None);
    let key = load_key("TEST_KEY_DO_NOT_USE.pub");
    let other_key = load_key("TEST_KEY_OTHER_DO_NOT_USE.key");

    sign::run(&config, Operation::Digest { key: &key }).unwrap();
    let digest = STANDARD
        .decode(fs::read_to_string(&config.paths.digest).unwrap())
        .unwrap();

    let signature = other_key
        .sign(SignatureAlgorithm::RsaPssMgf1Sha256, &digest)
        .unwrap();
    fs::write(&config.paths.signature, STANDARD.encode(&signature)).unwrap();

    let err = sign::run(&config, Operation::Stitch { key: &key }).unwrap_err();
    assert_matches!(err, Error::Verification(_, _));
    assert_eq!(err.kind(), ErrorKind::Verification);
    assert!(!config.paths.output.exists());

    // A previous output is not touched.
    fs::write(&config.paths.output, b"previous").unwrap();
    let err = sign::run(&config, Operation::Stitch { key: &key }).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Verification);
    assert_eq!(workspace.read_output(), b"previous");
}

#[test]
fn stitch_rejects_corrupted_signature() {
    let workspace = Workspace::new(b"\x7fELF corrupted");
    let config = workspace.config(SignatureAlgorithm::RsaPkcs1V15Sha256, None);
    let key = get_test_key();

    sign::run(&config, Operation::Digest { key: &key }).unwrap();
    let digest = STANDARD
        .decode(fs::read_to_string(&config.paths.digest).unwrap())
        .unwrap();

    let mut signature = key
        .sign(SignatureAlgorithm::RsaPkcs1V15Sha256, &digest)
        .unwrap();
    signature[0] ^= 0x01;
    fs::write(&config.paths.signature, STANDARD.encode(&signature)).unwrap();

    let err = sign::run(&config, Operation::Stitch { key: &key }).unwrap_err();
    assert_matches!(err, Error::Verification(_, _));

    fs::write(&config.paths.signature, "not base64!").unwrap();
    let err = sign::run(&config, Operation::Stitch { key: &key }).unwrap_err();
    assert_matches!(err, Error::DecodeSignature(_, _));
    assert!(!config.paths.output.exists());
}

#[test]
fn missing_input_is_reported() {
    let workspace = Workspace::new(b"");
    let config = workspace.config(SignatureAlgorithm::RsaPssMgf1Sha256, None);
    fs::remove_file(&config.paths.input).unwrap();

    let err = sign::run(&config, Operation::SignEnc { key: &get_test_key() }).unwrap_err();
    assert_matches!(err, Error::ReadInput(_, _));
    assert_eq!(err.kind(), ErrorKind::Input);
}

/// Signs in-process, optionally hiding the key size like a token without a
/// known public key.
struct StubSigner {
    key: RsaKey,
    expose_len: bool,
    digests: Vec<Vec<u8>>,
}

impl TokenSigner for StubSigner {
    fn signature_len(&self) -> Option<usize> {
        self.expose_len.then(|| self.key.size())
    }

    fn sign(&mut self, digest: &[u8], algo: SignatureAlgorithm) -> Result<Vec<u8>, token::Error> {
        self.digests.push(digest.to_vec());
        Ok(self.key.sign(algo, digest).unwrap())
    }
}

#[test]
fn pkcs11_sign_with_placeholder_length() {
    let payload = b"\x7fELF token";
    let workspace = Workspace::new(payload);
    let config = workspace.config(SignatureAlgorithm::RsaPssMgf1Sha256, None);
    let mut signer = StubSigner {
        key: get_test_key(),
        expose_len: false,
        digests: vec![],
    };

    sign::run(&config, Operation::Pkcs11Sign { signer: &mut signer }).unwrap();
    assert_eq!(signer.digests.len(), 1);

    let data = workspace.read_output();
    assert_eq!(
        &data[18..20],
        &(PLACEHOLDER_SIGNATURE_LEN as u16).to_le_bytes(),
    );
    // The real signature is written even though the header disagrees.
    assert_eq!(data.len(), shdr::HEADER_SIZE + 32 + 256 + 16 + 4 + payload.len());

    let digest = &data[shdr::HEADER_SIZE..shdr::HEADER_SIZE + 32];
    let signature = &data[shdr::HEADER_SIZE + 32..shdr::HEADER_SIZE + 32 + 256];
    assert_eq!(digest, signer.digests[0]);
    signer
        .key
        .to_public_key()
        .verify_sig(SignatureAlgorithm::RsaPssMgf1Sha256, digest, signature)
        .unwrap();
}

#[test]
fn pkcs11_sign_with_known_length() {
    let payload = b"\x7fELF token";
    let workspace = Workspace::new(payload);
    let config = workspace.config(SignatureAlgorithm::RsaPkcs1V15Sha256, None);
    let mut signer = StubSigner {
        key: get_test_key(),
        expose_len: true,
        digests: vec![],
    };

    sign::run(&config, Operation::Pkcs11Sign { signer: &mut signer }).unwrap();

    let container = parse(&workspace.read_output());
    assert_eq!(container.header.signature_len, 256);
    assert_eq!(container.header.algorithm, SignatureAlgorithm::RsaPkcs1V15Sha256);

    let plaintext =
        image::verify_container(&container, &signer.key.to_public_key(), None).unwrap();
    assert_eq!(plaintext, payload);
}

#[test]
fn load_all_key_formats() {
    let pkcs8 = get_test_key();
    assert!(pkcs8.has_private());
    assert_eq!(pkcs8.size(), 256);

    let pkcs1 = load_key("TEST_KEY_DO_NOT_USE_pkcs1.key");
    assert!(pkcs1.has_private());
    assert_eq!(pkcs1.to_public_key(), pkcs8.to_public_key());

    let public = load_key("TEST_KEY_DO_NOT_USE.pub");
    assert!(!public.has_private());
    assert_eq!(public.to_public_key(), pkcs8.to_public_key());

    let path = data_path("TEST_KEY_DO_NOT_USE_encrypted.key");
    let source = PassphraseSource::new(
        &path,
        Some(&data_path("TEST_KEY_DO_NOT_USE.passphrase")),
        None,
    );
    let encrypted = crypto::read_pem_key_file(&path, &source).unwrap();
    assert!(encrypted.has_private());
    assert_eq!(encrypted.to_public_key(), pkcs8.to_public_key());

    let other = load_key("TEST_KEY_OTHER_DO_NOT_USE.key");
    assert_ne!(other.to_public_key(), pkcs8.to_public_key());
}

#[test]
fn reject_encrypted_key_with_wrong_passphrase() {
    let dir = tempfile::tempdir().unwrap();
    let pass_file = dir.path().join("passphrase");
    fs::write(&pass_file, "wrong\n").unwrap();

    let path = data_path("TEST_KEY_DO_NOT_USE_encrypted.key");
    let source = PassphraseSource::new(&path, Some(&pass_file), None);

    assert_matches!(
        crypto::read_pem_key_file(&path, &source),
        Err(crypto::Error::LoadKeyEncrypted(_))
    );
}

#[test]
fn malformed_encryption_key_is_encryption_error() {
    let err = sign::parse_enc_key(&"00".repeat(20)).unwrap_err();
    assert_matches!(
        err,
        Error::InvalidEncryptionKey(crypto::Error::InvalidEncryptionKeySize(20))
    );
    assert_eq!(err.kind(), ErrorKind::Encryption);

    let err = sign::parse_enc_key("not hex").unwrap_err();
    assert_matches!(
        err,
        Error::InvalidEncryptionKey(crypto::Error::InvalidEncryptionKeyHex(_))
    );
    assert_eq!(err.kind(), ErrorKind::Encryption);

    assert_matches!(sign::parse_enc_key(&"00".repeat(16)), Ok(EncryptionKey::Aes128(_)));
}

#[test]
fn missing_key_file_is_input_error() {
    let path = data_path("TEST_KEY_MISSING.key");
    let source = PassphraseSource::new(&path, None, None);

    let err = sign::load_key(&path, &source).unwrap_err();
    assert_matches!(err, Error::LoadKey(ref p, crypto::Error::ReadFile(_, _)) if *p == path);
    assert_eq!(err.kind(), ErrorKind::Input);

    let key = sign::load_key(&data_path("TEST_KEY_DO_NOT_USE.pub"), &source).unwrap();
    assert!(!key.has_private());
}
