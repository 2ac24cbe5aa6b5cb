//! ---
//! hatch_section: "06-integrity"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Checksum and signature verification of staged artifacts."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::str::FromStr;

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, VerifyingKey};
use pgp::{Deserializable, SignedPublicKey, StandaloneSignature};
use ring::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_ASN1};

use crate::armor;
use crate::{Result, VerifyError};

/// DER prefix of a P-256 `SubjectPublicKeyInfo` ahead of the SEC1 point.
const P256_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08, 0x2a,
    0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

/// DER prefix of an Ed25519 `SubjectPublicKeyInfo` ahead of the raw key.
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

const PGP_SIGNATURE_LABEL: &str = "PGP SIGNATURE";
const ECDSA_SIGNATURE_LABEL: &str = "ECDSA DETACHED SIGNATURE";

/// Signature schemes accepted on release descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// Ed25519 over the artifact bytes; 32-byte key, 64-byte signature.
    Ed25519,
    /// ECDSA P-256 with SHA-256; SEC1 or SPKI key, ASN.1 DER signature,
    /// optionally armored as an `ECDSA DETACHED SIGNATURE` block.
    EcdsaP256,
    /// OpenPGP detached signature with an armored public key block.
    Pgp,
}

impl SignatureScheme {
    /// Name used in descriptors and key maps.
    pub fn as_str(self) -> &'static str {
        match self {
            SignatureScheme::Ed25519 => "ed25519",
            SignatureScheme::EcdsaP256 => "ecdsa-p256",
            SignatureScheme::Pgp => "pgp",
        }
    }

    /// Scheme implied by the armor label of `signature`, if it is armored.
    pub fn detect(signature: &str) -> Option<Self> {
        match armor::label(signature)? {
            PGP_SIGNATURE_LABEL => Some(SignatureScheme::Pgp),
            ECDSA_SIGNATURE_LABEL => Some(SignatureScheme::EcdsaP256),
            _ => None,
        }
    }
}

impl FromStr for SignatureScheme {
    type Err = VerifyError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ed25519" => Ok(SignatureScheme::Ed25519),
            "ecdsa-p256" | "ecdsa_p256" | "p256" | "x509" => Ok(SignatureScheme::EcdsaP256),
            "pgp" | "openpgp" | "gpg" => Ok(SignatureScheme::Pgp),
            other => Err(VerifyError::SignatureInvalid(format!(
                "unsupported signature type `{other}`"
            ))),
        }
    }
}

fn decode(label: &str, raw: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|err| VerifyError::SignatureInvalid(format!("{label} must be base64 encoded: {err}")))
}

/// Raw key bytes from base64 or a PEM `PUBLIC KEY` block, with any
/// `SubjectPublicKeyInfo` wrapper for `prefix` removed.
fn public_key_bytes(raw: &str, prefix: &[u8]) -> Result<Vec<u8>> {
    let der = match armor::parse(raw)? {
        Some(block) if block.label == "PUBLIC KEY" => block.body,
        Some(block) => {
            return Err(VerifyError::SignatureInvalid(format!(
                "expected a PUBLIC KEY block, found {}",
                block.label
            )))
        }
        None => decode("public key", raw)?,
    };
    match der.strip_prefix(prefix) {
        Some(key) => Ok(key.to_vec()),
        None => Ok(der),
    }
}

fn ecdsa_signature_bytes(raw: &str) -> Result<Vec<u8>> {
    let Some(block) = armor::parse(raw)? else {
        return decode("signature", raw);
    };
    if block.label != ECDSA_SIGNATURE_LABEL {
        return Err(VerifyError::SignatureInvalid(format!(
            "unexpected signature block {}",
            block.label
        )));
    }
    match block.header("Hash") {
        None => Ok(block.body),
        Some(hash) if hash.eq_ignore_ascii_case("SHA-256") => Ok(block.body),
        Some(hash) => Err(VerifyError::SignatureInvalid(format!(
            "unsupported signature hash {hash}"
        ))),
    }
}

fn verify_pgp(public_key: &str, signature: &str, payload: &[u8]) -> Result<()> {
    let (key, _) = SignedPublicKey::from_string(public_key)
        .map_err(|err| VerifyError::SignatureInvalid(format!("invalid pgp public key: {err}")))?;
    let (signature, _) = StandaloneSignature::from_string(signature)
        .map_err(|err| VerifyError::SignatureInvalid(format!("invalid pgp signature: {err}")))?;

    if signature.verify(&key, payload).is_ok() {
        return Ok(());
    }
    let by_subkey = key
        .public_subkeys
        .iter()
        .any(|subkey| signature.verify(subkey, payload).is_ok());
    if by_subkey {
        Ok(())
    } else {
        Err(VerifyError::SignatureInvalid("pgp verification failed".into()))
    }
}

/// Check `signature` over `payload` with `public_key`.
///
/// Ed25519 takes base64 keys and signatures. ECDSA P-256 also takes PEM keys
/// and armored signatures. PGP takes armored key and signature blocks.
pub fn verify_signature(
    scheme: SignatureScheme,
    public_key: &str,
    signature: &str,
    payload: &[u8],
) -> Result<()> {
    if let Some(armored) = SignatureScheme::detect(signature) {
        if armored != scheme {
            return Err(VerifyError::SignatureInvalid(format!(
                "{} signature supplied for signature type {}",
                armored.as_str(),
                scheme.as_str()
            )));
        }
    }
    match scheme {
        SignatureScheme::Ed25519 => {
            let key = public_key_bytes(public_key, &ED25519_SPKI_PREFIX)?;
            let signature = decode("signature", signature)?;
            let key: [u8; 32] = key
                .as_slice()
                .try_into()
                .map_err(|_| VerifyError::SignatureInvalid("invalid ed25519 public key length".into()))?;
            let signature: [u8; 64] = signature
                .as_slice()
                .try_into()
                .map_err(|_| VerifyError::SignatureInvalid("invalid ed25519 signature length".into()))?;
            let key = VerifyingKey::from_bytes(&key)
                .map_err(|err| VerifyError::SignatureInvalid(format!("invalid ed25519 public key: {err}")))?;
            key.verify_strict(payload, &Signature::from_bytes(&signature))
                .map_err(|err| VerifyError::SignatureInvalid(format!("ed25519 verification failed: {err}")))
        }
        SignatureScheme::EcdsaP256 => {
            let key = public_key_bytes(public_key, &P256_SPKI_PREFIX)?;
            let signature = ecdsa_signature_bytes(signature)?;
            UnparsedPublicKey::new(&ECDSA_P256_SHA256_ASN1, &key)
                .verify(payload, &signature)
                .map_err(|_| VerifyError::SignatureInvalid("ecdsa-p256 verification failed".into()))
        }
        SignatureScheme::Pgp => verify_pgp(public_key, signature, payload),
    }
}
