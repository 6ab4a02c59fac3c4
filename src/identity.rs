use crate::error::{Error, Result};
use ed25519_dalek::hazmat::{raw_sign, ExpandedSecretKey};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use tracing::warn;

/// Length of an Ed25519 signature
pub const ED25519_SIGNATURE_LEN: usize = 64;

/// Length of an Ed25519 public key
pub const ED25519_PUBLIC_KEY_LEN: usize = 32;

/// Offline-signature header: expiry timestamp (4) + transient key type (2)
pub const OFFLINE_SIGNATURE_HEADER_LEN: usize = 6;

/// Signature algorithm of a destination identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigType {
    Ed25519,
    Rsa2048Sha256,
    Rsa3072Sha384,
    Rsa4096Sha512,
}

impl SigType {
    pub fn from_code(code: u16) -> Result<Self> {
        match code {
            4 => Ok(SigType::Rsa2048Sha256),
            5 => Ok(SigType::Rsa3072Sha384),
            6 => Ok(SigType::Rsa4096Sha512),
            7 => Ok(SigType::Ed25519),
            other => Err(Error::UnsupportedSignatureType(other)),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            SigType::Rsa2048Sha256 => 4,
            SigType::Rsa3072Sha384 => 5,
            SigType::Rsa4096Sha512 => 6,
            SigType::Ed25519 => 7,
        }
    }

    pub fn public_key_len(&self) -> usize {
        match self {
            SigType::Rsa2048Sha256 => 256,
            SigType::Rsa3072Sha384 => 384,
            SigType::Rsa4096Sha512 => 512,
            SigType::Ed25519 => ED25519_PUBLIC_KEY_LEN,
        }
    }

    pub fn signature_len(&self) -> usize {
        match self {
            SigType::Rsa2048Sha256 => 256,
            SigType::Rsa3072Sha384 => 384,
            SigType::Rsa4096Sha512 => 512,
            SigType::Ed25519 => ED25519_SIGNATURE_LEN,
        }
    }

    pub fn is_rsa(&self) -> bool {
        matches!(
            self,
            SigType::Rsa2048Sha256 | SigType::Rsa3072Sha384 | SigType::Rsa4096Sha512
        )
    }
}

/// SHA-256 hash of a serialized identity
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentHash([u8; 32]);

impl IdentHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for IdentHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for IdentHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for IdentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// A destination identity: signature type plus public key.
///
/// Wire form: `[sigType: u16][public key: sigType-dependent]`. RSA identities
/// parse (so their full length can be skipped in an options block) but cannot
/// verify; the stream rejects them outright.
#[derive(Clone)]
pub struct Identity {
    sig_type: SigType,
    verifying_key: Option<VerifyingKey>,
    serialized: Vec<u8>,
    hash: IdentHash,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("sig_type", &self.sig_type)
            .field("hash", &self.hash)
            .finish()
    }
}

impl Identity {
    pub fn from_verifying_key(key: VerifyingKey) -> Self {
        let mut serialized = Vec::with_capacity(2 + ED25519_PUBLIC_KEY_LEN);
        serialized.extend_from_slice(&SigType::Ed25519.code().to_be_bytes());
        serialized.extend_from_slice(key.as_bytes());
        let hash = IdentHash(Sha256::digest(&serialized).into());
        Self {
            sig_type: SigType::Ed25519,
            verifying_key: Some(key),
            serialized,
            hash,
        }
    }

    /// Parse an identity from the head of `buf`, returning it with the number
    /// of bytes consumed.
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 2 {
            return Err(Error::InvalidIdentity("missing signature type".into()));
        }
        let sig_type = SigType::from_code(u16::from_be_bytes([buf[0], buf[1]]))?;
        let full_len = 2 + sig_type.public_key_len();
        if buf.len() < full_len {
            return Err(Error::InvalidIdentity(format!(
                "truncated public key: need {} bytes, have {}",
                full_len,
                buf.len()
            )));
        }
        let serialized = buf[..full_len].to_vec();
        let verifying_key = match sig_type {
            SigType::Ed25519 => {
                let mut key = [0u8; ED25519_PUBLIC_KEY_LEN];
                key.copy_from_slice(&buf[2..2 + ED25519_PUBLIC_KEY_LEN]);
                Some(
                    VerifyingKey::from_bytes(&key)
                        .map_err(|e| Error::InvalidIdentity(e.to_string()))?,
                )
            }
            _ => None,
        };
        let hash = IdentHash(Sha256::digest(&serialized).into());
        Ok((
            Self {
                sig_type,
                verifying_key,
                serialized,
                hash,
            },
            full_len,
        ))
    }

    pub fn sig_type(&self) -> SigType {
        self.sig_type
    }

    pub fn is_rsa(&self) -> bool {
        self.sig_type.is_rsa()
    }

    pub fn full_len(&self) -> usize {
        self.serialized.len()
    }

    pub fn signature_len(&self) -> usize {
        self.sig_type.signature_len()
    }

    pub fn to_bytes(&self) -> &[u8] {
        &self.serialized
    }

    pub fn ident_hash(&self) -> &IdentHash {
        &self.hash
    }

    pub fn verify(&self, buf: &[u8], signature: &[u8]) -> bool {
        let Some(key) = &self.verifying_key else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(buf, &signature).is_ok()
    }
}

enum Ed25519Signer {
    Standard(SigningKey),
    /// Older-key fallback: the declared public key was derived with the
    /// third-highest scalar bit dropped, so sign with the matching expanded key.
    Expanded {
        key: ExpandedSecretKey,
        public: VerifyingKey,
    },
}

impl Ed25519Signer {
    fn sign(&self, buf: &[u8]) -> Signature {
        match self {
            Ed25519Signer::Standard(key) => key.sign(buf),
            Ed25519Signer::Expanded { key, public } => raw_sign::<Sha512>(key, buf, public),
        }
    }

    fn verifying_key(&self) -> VerifyingKey {
        match self {
            Ed25519Signer::Standard(key) => key.verifying_key(),
            Ed25519Signer::Expanded { public, .. } => *public,
        }
    }
}

/// Transient key material advertised through an offline-signature block
struct OfflineInfo {
    block: Vec<u8>,
    signer: SigningKey,
}

/// Local signing keys: the long-term identity plus, optionally, an
/// offline-signed transient key that signs packets in its place.
pub struct PrivateKeys {
    identity: Identity,
    signer: Ed25519Signer,
    offline: Option<OfflineInfo>,
}

impl PrivateKeys {
    pub fn generate<R: rand::CryptoRng + rand::RngCore>(rng: &mut R) -> Self {
        let key = SigningKey::generate(rng);
        let identity = Identity::from_verifying_key(key.verifying_key());
        Self {
            identity,
            signer: Ed25519Signer::Standard(key),
            offline: None,
        }
    }

    /// Build signing keys from a raw secret and the public key the destination
    /// declares. When they disagree the key predates scalar normalization:
    /// re-derive with the third-highest bit of the expanded scalar dropped.
    pub fn from_secret(secret: [u8; 32], declared_public: Option<[u8; 32]>) -> Result<Self> {
        let key = SigningKey::from_bytes(&secret);
        let derived = key.verifying_key();
        let signer = match declared_public {
            Some(declared) if declared != *derived.as_bytes() => {
                warn!("Older Ed25519 key detected, using expanded-scalar fallback");
                let mut expanded: [u8; 64] = Sha512::digest(secret).into();
                expanded[31] &= 0xDF;
                let expanded_key = ExpandedSecretKey::from_bytes(&expanded);
                let public = VerifyingKey::from(&expanded_key);
                if *public.as_bytes() != declared {
                    return Err(Error::InvalidIdentity(
                        "declared public key matches neither derivation".into(),
                    ));
                }
                Ed25519Signer::Expanded {
                    key: expanded_key,
                    public,
                }
            }
            _ => Ed25519Signer::Standard(key),
        };
        let identity = Identity::from_verifying_key(signer.verifying_key());
        Ok(Self {
            identity,
            signer,
            offline: None,
        })
    }

    /// Attach an offline-signed transient key. The block is
    /// `[expires: u32][keyType: u16][transient public key][identity signature]`
    /// and packets are signed by the transient key from then on.
    pub fn with_offline_signature(mut self, expires: u32, transient: SigningKey) -> Self {
        let mut block =
            Vec::with_capacity(OFFLINE_SIGNATURE_HEADER_LEN + ED25519_PUBLIC_KEY_LEN + ED25519_SIGNATURE_LEN);
        block.extend_from_slice(&expires.to_be_bytes());
        block.extend_from_slice(&SigType::Ed25519.code().to_be_bytes());
        block.extend_from_slice(transient.verifying_key().as_bytes());
        let signature = self.signer.sign(&block);
        block.extend_from_slice(&signature.to_bytes());
        self.offline = Some(OfflineInfo {
            block,
            signer: transient,
        });
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_offline_signature(&self) -> bool {
        self.offline.is_some()
    }

    pub fn offline_signature_block(&self) -> Option<&[u8]> {
        self.offline.as_ref().map(|o| o.block.as_slice())
    }

    /// Length of the signatures this key produces
    pub fn signature_len(&self) -> usize {
        ED25519_SIGNATURE_LEN
    }

    /// Sign `buf`, with the transient key when one is attached
    pub fn sign(&self, buf: &[u8]) -> Vec<u8> {
        match &self.offline {
            Some(offline) => offline.signer.sign(buf).to_bytes().to_vec(),
            None => self.signer.sign(buf).to_bytes().to_vec(),
        }
    }
}

/// Verifier for a transient (offline-signed) key
pub struct TransientVerifier {
    expires: u32,
    verifying_key: VerifyingKey,
}

impl TransientVerifier {
    /// Parse an offline-signature block from the head of `buf` and check the
    /// identity's endorsement of the transient key. Returns the verifier and
    /// the number of bytes consumed.
    pub fn from_bytes(identity: &Identity, buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < OFFLINE_SIGNATURE_HEADER_LEN {
            return Err(Error::InvalidOfflineSignature("truncated header".into()));
        }
        let expires = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let sig_type = SigType::from_code(u16::from_be_bytes([buf[4], buf[5]]))?;
        if sig_type != SigType::Ed25519 {
            return Err(Error::UnsupportedSignatureType(sig_type.code()));
        }
        let signed_len = OFFLINE_SIGNATURE_HEADER_LEN + sig_type.public_key_len();
        let total_len = signed_len + identity.signature_len();
        if buf.len() < total_len {
            return Err(Error::InvalidOfflineSignature(format!(
                "need {} bytes, have {}",
                total_len,
                buf.len()
            )));
        }
        if !identity.verify(&buf[..signed_len], &buf[signed_len..total_len]) {
            return Err(Error::InvalidOfflineSignature(
                "identity endorsement did not verify".into(),
            ));
        }
        let mut key = [0u8; ED25519_PUBLIC_KEY_LEN];
        key.copy_from_slice(&buf[OFFLINE_SIGNATURE_HEADER_LEN..signed_len]);
        let verifying_key = VerifyingKey::from_bytes(&key)
            .map_err(|e| Error::InvalidOfflineSignature(e.to_string()))?;
        Ok((
            Self {
                expires,
                verifying_key,
            },
            total_len,
        ))
    }

    pub fn expires(&self) -> u32 {
        self.expires
    }

    pub fn signature_len(&self) -> usize {
        ED25519_SIGNATURE_LEN
    }

    pub fn verify(&self, buf: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        self.verifying_key.verify(buf, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_roundtrip() {
        let keys = PrivateKeys::generate(&mut rand::thread_rng());
        let bytes = keys.identity().to_bytes().to_vec();
        let (parsed, consumed) = Identity::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed.ident_hash(), keys.identity().ident_hash());
        assert_eq!(parsed.sig_type(), SigType::Ed25519);
        assert!(!parsed.is_rsa());
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let keys = PrivateKeys::generate(&mut rand::thread_rng());
        let msg = b"ordered reliable bytes";
        let sig = keys.sign(msg);
        assert_eq!(sig.len(), ED25519_SIGNATURE_LEN);
        assert!(keys.identity().verify(msg, &sig));
        assert!(!keys.identity().verify(b"other bytes", &sig));
    }

    #[test]
    fn test_older_key_fallback_signs_consistently() {
        let secret = [7u8; 32];
        // declare the public key the fallback derivation produces
        let mut expanded: [u8; 64] = Sha512::digest(secret).into();
        expanded[31] &= 0xDF;
        let expanded_key = ExpandedSecretKey::from_bytes(&expanded);
        let declared = VerifyingKey::from(&expanded_key);

        let keys = PrivateKeys::from_secret(secret, Some(*declared.as_bytes())).unwrap();
        let msg = b"fallback path";
        let sig = keys.sign(msg);
        assert!(keys.identity().verify(msg, &sig));
        assert_eq!(&keys.identity().to_bytes()[2..], declared.as_bytes());
    }

    #[test]
    fn test_from_secret_rejects_unrelated_public() {
        let err = PrivateKeys::from_secret([7u8; 32], Some([0x42; 32]));
        assert!(matches!(err, Err(Error::InvalidIdentity(_))));
    }

    #[test]
    fn test_rsa_identity_parses_but_cannot_verify() {
        let mut buf = vec![0u8; 2 + 256];
        buf[..2].copy_from_slice(&SigType::Rsa2048Sha256.code().to_be_bytes());
        let (identity, consumed) = Identity::from_bytes(&buf).unwrap();
        assert_eq!(consumed, 258);
        assert!(identity.is_rsa());
        assert!(!identity.verify(b"anything", &[0u8; 256]));
    }

    #[test]
    fn test_unknown_sig_type_rejected() {
        let buf = [0u8, 99u8, 0, 0];
        assert!(matches!(
            Identity::from_bytes(&buf),
            Err(Error::UnsupportedSignatureType(_))
        ));
    }

    #[test]
    fn test_offline_signature_roundtrip() {
        let mut rng = rand::thread_rng();
        let transient = SigningKey::generate(&mut rng);
        let keys = PrivateKeys::generate(&mut rng).with_offline_signature(1_700_000, transient);
        let block = keys.offline_signature_block().unwrap().to_vec();

        let (verifier, consumed) = TransientVerifier::from_bytes(keys.identity(), &block).unwrap();
        assert_eq!(consumed, block.len());
        assert_eq!(verifier.expires(), 1_700_000);

        // packets are signed by the transient key now
        let msg = b"signed by transient";
        let sig = keys.sign(msg);
        assert!(verifier.verify(msg, &sig));
        assert!(!keys.identity().verify(msg, &sig));
    }

    #[test]
    fn test_offline_signature_bad_endorsement() {
        let mut rng = rand::thread_rng();
        let transient = SigningKey::generate(&mut rng);
        let keys = PrivateKeys::generate(&mut rng).with_offline_signature(1_700_000, transient);
        let mut block = keys.offline_signature_block().unwrap().to_vec();
        let last = block.len() - 1;
        block[last] ^= 0xFF;
        let other = PrivateKeys::generate(&mut rng);
        assert!(TransientVerifier::from_bytes(keys.identity(), &block).is_err());
        assert!(TransientVerifier::from_bytes(other.identity(), &block).is_err());
    }
}
