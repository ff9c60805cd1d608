//! Artifact trust verification.
//!
//! An artifact is trusted when its stored BLAKE3 hash is well-formed, its
//! detached Ed25519 signature has the right shape, the signing key id is in
//! the configured trusted set, and the signature verifies over the signing
//! context built from the stored hash. The artifact body is never read.

use std::collections::HashMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use safeedge_state::{Artifact, ArtifactType};
use tracing::{debug, warn};

use crate::error::{RolloutError, RolloutResult};

/// Domain separation prefix of the artifact signing context.
pub const SIGNING_CONTEXT: &[u8] = b"safeedge.artifact.v1\0";

const HASH_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;

/// BLAKE3-256 of `bytes`, lowercase hex. The content address of an artifact.
pub fn hash_content(bytes: &[u8]) -> String {
    hex::encode(blake3::hash(bytes).as_bytes())
}

/// The message an artifact signature covers.
///
/// `SIGNING_CONTEXT || artifact_type || 0x00 || raw hash bytes`.
pub fn signing_message(artifact_type: ArtifactType, hash: &[u8; HASH_LEN]) -> Vec<u8> {
    let kind = artifact_type.as_str().as_bytes();
    let mut msg = Vec::with_capacity(SIGNING_CONTEXT.len() + kind.len() + 1 + HASH_LEN);
    msg.extend_from_slice(SIGNING_CONTEXT);
    msg.extend_from_slice(kind);
    msg.push(0);
    msg.extend_from_slice(hash);
    msg
}

/// Parse a stored content hash: exactly 64 lowercase hex characters.
pub fn parse_content_hash(content_hash: &str) -> Result<[u8; HASH_LEN], String> {
    if content_hash.len() != HASH_LEN * 2 {
        return Err(format!(
            "content hash must be {} hex characters, got {}",
            HASH_LEN * 2,
            content_hash.len()
        ));
    }
    if !content_hash
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err("content hash must be lowercase hex".to_string());
    }
    let bytes = hex::decode(content_hash).map_err(|e| format!("content hash: {e}"))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| "content hash has wrong length".to_string())
}

/// Sign an artifact's hash. Returns the hex signature.
pub fn sign_artifact(
    signing_key: &SigningKey,
    artifact_type: ArtifactType,
    content_hash: &str,
) -> Result<String, String> {
    let hash = parse_content_hash(content_hash)?;
    let signature = signing_key.sign(&signing_message(artifact_type, &hash));
    Ok(hex::encode(signature.to_bytes()))
}

/// Signing keys accepted for artifacts, by key id.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: HashMap<String, VerifyingKey>,
}

impl TrustedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_id: &str, key: VerifyingKey) {
        self.keys.insert(key_id.to_string(), key);
    }

    /// Add a key from its hex-encoded 32-byte public key.
    pub fn insert_hex(&mut self, key_id: &str, public_key_hex: &str) -> Result<(), String> {
        let bytes = hex::decode(public_key_hex.trim())
            .map_err(|e| format!("trusted key {key_id}: {e}"))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("trusted key {key_id}: expected 32 bytes, got {}", bytes.len()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| format!("trusted key {key_id}: {e}"))?;
        self.insert(key_id, key);
        Ok(())
    }

    pub fn get(&self, key_id: &str) -> Option<&VerifyingKey> {
        self.keys.get(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Checks artifacts against a trusted key set.
#[derive(Debug, Clone, Default)]
pub struct ArtifactVerifier {
    trusted: TrustedKeys,
}

impl ArtifactVerifier {
    pub fn new(trusted: TrustedKeys) -> Self {
        Self { trusted }
    }

    /// Verify an artifact record. Any failed check is `UntrustedArtifact`.
    pub fn verify(&self, artifact: &Artifact) -> RolloutResult<()> {
        let result = self.check(artifact);
        match &result {
            Ok(()) => debug!(artifact_id = %artifact.id, key_id = %artifact.signing_key_id, "artifact trusted"),
            Err(e) => warn!(artifact_id = %artifact.id, error = %e, "artifact rejected"),
        }
        result
    }

    fn check(&self, artifact: &Artifact) -> RolloutResult<()> {
        let id = artifact.id.as_str();

        let hash = parse_content_hash(&artifact.content_hash)
            .map_err(|reason| RolloutError::untrusted(id, reason))?;

        if artifact.signature.is_empty() {
            return Err(RolloutError::untrusted(id, "artifact has no signature"));
        }
        let sig_bytes = hex::decode(&artifact.signature)
            .map_err(|e| RolloutError::untrusted(id, format!("signature is not hex: {e}")))?;
        let sig_bytes: [u8; SIGNATURE_LEN] = sig_bytes.as_slice().try_into().map_err(|_| {
            RolloutError::untrusted(
                id,
                format!(
                    "signature must be {SIGNATURE_LEN} bytes, got {}",
                    sig_bytes.len()
                ),
            )
        })?;
        let signature = Signature::from_bytes(&sig_bytes);

        if artifact.signing_key_id.is_empty() {
            return Err(RolloutError::untrusted(id, "artifact has no signing key id"));
        }
        let key = self.trusted.get(&artifact.signing_key_id).ok_or_else(|| {
            RolloutError::untrusted(
                id,
                format!("signing key '{}' is not trusted", artifact.signing_key_id),
            )
        })?;

        key.verify(&signing_message(artifact.artifact_type, &hash), &signature)
            .map_err(|_| RolloutError::untrusted(id, "signature does not verify"))
    }
}
