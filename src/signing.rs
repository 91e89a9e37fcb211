use async_trait::async_trait;
use blake3::Hasher;
use hex::ToHex;
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::Digest as _;
use thiserror::Error;

use crate::hashing::Digest;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("signing unavailable: {0}")]
pub struct SigningUnavailable(pub String);

/// Domain separation between receipt and batch-root signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningNamespace {
    Receipt,
    MerkleRoot,
}

impl SigningNamespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningNamespace::Receipt => "swarm-receipt",
            SigningNamespace::MerkleRoot => "swarm-merkle",
        }
    }
}

/// Produces opaque signatures over hashes. Implementations hold the key;
/// callers never do.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, namespace: SigningNamespace, hash: &Digest) -> Result<String, SigningUnavailable>;

    /// Identifies the key used, e.g. a compressed public key.
    fn key_ref(&self) -> String;
}

pub struct Secp { sk: SigningKey }

impl Secp {
    pub fn from_hex(sk_hex: &str) -> Result<Self, SigningUnavailable> {
        let bytes = hex::decode(sk_hex).map_err(|e| SigningUnavailable(format!("bad key hex: {e}")))?;
        let sk = SigningKey::from_slice(&bytes).map_err(|e| SigningUnavailable(format!("bad key: {e}")))?;
        Ok(Self { sk })
    }

    pub fn pubkey_hex_compressed(&self) -> String {
        let vk = self.sk.verifying_key();
        let ep = vk.to_encoded_point(true);
        hex::encode(ep.as_bytes())
    }

    // sha256(blake3(namespace || 0x00 || hash))
    fn prehash(namespace: SigningNamespace, hash: &Digest) -> [u8; 32] {
        let mut h = Hasher::new();
        h.update(namespace.as_str().as_bytes());
        h.update(&[0u8]);
        h.update(hash.as_bytes());
        let b3 = h.finalize();
        sha2::Sha256::digest(b3.as_bytes()).into()
    }

    pub fn verify(pubkey_hex: &str, namespace: SigningNamespace, hash: &Digest, sig_hex: &str) -> bool {
        let Ok(pk) = hex::decode(pubkey_hex) else { return false };
        let Ok(vk) = VerifyingKey::from_sec1_bytes(&pk) else { return false };
        let Ok(sig_bytes) = hex::decode(sig_hex) else { return false };
        let Ok(sig) = Signature::from_slice(&sig_bytes) else { return false };
        vk.verify_prehash(&Self::prehash(namespace, hash), &sig).is_ok()
    }
}

#[async_trait]
impl Signer for Secp {
    async fn sign(&self, namespace: SigningNamespace, hash: &Digest) -> Result<String, SigningUnavailable> {
        let digest = Self::prehash(namespace, hash);
        let sig: Signature = self
            .sk
            .sign_prehash(&digest)
            .map_err(|e| SigningUnavailable(e.to_string()))?;
        Ok(sig.to_vec().encode_hex::<String>())
    }

    fn key_ref(&self) -> String {
        self.pubkey_hex_compressed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::hash_bytes;

    const SK: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[tokio::test]
    async fn signature_verifies_under_its_namespace_only() {
        let secp = Secp::from_hex(SK).unwrap();
        let h = hash_bytes(b"root");
        let sig = secp.sign(SigningNamespace::MerkleRoot, &h).await.unwrap();
        let pk = secp.key_ref();

        assert!(Secp::verify(&pk, SigningNamespace::MerkleRoot, &h, &sig));
        assert!(!Secp::verify(&pk, SigningNamespace::Receipt, &h, &sig));
        assert!(!Secp::verify(&pk, SigningNamespace::MerkleRoot, &hash_bytes(b"other"), &sig));
    }

    #[test]
    fn rejects_malformed_key() {
        assert!(Secp::from_hex("zz").is_err());
        assert!(Secp::from_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn compressed_pubkey_is_33_bytes() {
        let secp = Secp::from_hex(SK).unwrap();
        assert_eq!(secp.pubkey_hex_compressed().len(), 66);
    }
}
