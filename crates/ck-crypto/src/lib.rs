use ck_types::{ChainId, InternalErrorKind, WalletAddress, WalletServiceError};
use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Opaque key material handed back by a deriver. The secret half stays
/// zeroized on drop; only the registry save path ever needs it.
pub struct KeyMaterial {
    pub address: WalletAddress,
    pub public_key: [u8; 32],
    secret: Zeroizing<[u8; 32]>,
}

impl KeyMaterial {
    pub fn new(address: WalletAddress, public_key: [u8; 32], secret: [u8; 32]) -> Self {
        Self {
            address,
            public_key,
            secret: Zeroizing::new(secret),
        }
    }

    pub fn public_key_hex(&self) -> String {
        to_hex(&self.public_key)
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl Clone for KeyMaterial {
    fn clone(&self) -> Self {
        Self {
            address: self.address.clone(),
            public_key: self.public_key,
            secret: Zeroizing::new(*self.secret),
        }
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("address", &self.address)
            .field("public_key", &self.public_key_hex())
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// External key-derivation capability. Real deployments inject a
/// chain-specific implementation; [`Ed25519KeyDeriver`] is the reference.
pub trait KeyDeriver: Send + Sync {
    fn derive(&self, secret: &str, chain: &ChainId) -> Result<KeyMaterial, WalletServiceError>;
}

/// Deterministic Ed25519 deriver: the same secret and chain always yield
/// the same keypair, so a wallet re-derives identically on every login.
#[derive(Default)]
pub struct Ed25519KeyDeriver;

impl KeyDeriver for Ed25519KeyDeriver {
    fn derive(&self, secret: &str, chain: &ChainId) -> Result<KeyMaterial, WalletServiceError> {
        if secret.trim().is_empty() {
            return Err(WalletServiceError::InternalError(
                InternalErrorKind::KeyDerivation,
            ));
        }

        let mut hasher = Sha256::new();
        hasher.update(b"coinkeeper:v1:");
        hasher.update(chain.0.as_bytes());
        hasher.update(b":");
        hasher.update(secret.as_bytes());
        let seed: [u8; 32] = hasher.finalize().into();

        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = signing_key.verifying_key().to_bytes();

        let digest = Sha256::digest(public_key);
        let address = WalletAddress(format!("0x{}", to_hex(&digest[..20])));

        Ok(KeyMaterial::new(address, public_key, seed))
    }
}

fn to_hex(input: &[u8]) -> String {
    let mut output = String::with_capacity(input.len() * 2);
    for byte in input {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
