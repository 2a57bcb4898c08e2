//! Node identity: one persistent ed25519 key that is both the QUIC endpoint
//! identity and the envelope signing key.

use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};
use courier_keys::{PeerId, SigningKey};
use tracing::info;

use crate::codec::Codec;

const KEY_FILE: &str = "identity.key";
const KEY_LEN: usize = 32;

pub struct NodeIdentity {
    signing_key: SigningKey,
    peer_id: PeerId,
}

impl NodeIdentity {
    /// Load from `<data_dir>/identity.key`, or generate and save a new key.
    pub fn load_or_generate(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(KEY_FILE);

        match std::fs::read(&path) {
            Ok(bytes) => {
                let seed: [u8; KEY_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
                    anyhow::anyhow!(
                        "identity key {} must be {} bytes, got {}",
                        path.display(),
                        KEY_LEN,
                        v.len()
                    )
                })?;
                let identity = Self::from_signing_key(SigningKey::from_bytes(seed));
                info!(peer = %identity.peer_id.short(), "loaded node identity");
                Ok(identity)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let identity = Self::generate();
                identity.save(&path)?;
                info!(peer = %identity.peer_id.short(), "generated new node identity");
                Ok(identity)
            }
            Err(e) => {
                Err(e).with_context(|| format!("failed to read identity key: {}", path.display()))
            }
        }
    }

    /// Fresh in-memory identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut rand::rng()))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let peer_id = PeerId::from(signing_key.public_key());
        Self { signing_key, peer_id }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Envelope codec signing with this identity.
    pub fn codec(&self) -> Codec {
        Codec::new(self.signing_key.clone())
    }

    /// The iroh `SecretKey` for this node's QUIC endpoint.
    pub fn iroh_secret_key(&self) -> iroh::SecretKey {
        iroh::SecretKey::from_bytes(&self.signing_key.to_bytes())
    }

    fn save(&self, path: &Path) -> Result<()> {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(path)
            .with_context(|| format!("failed to create identity key: {}", path.display()))?;
        file.write_all(&self.signing_key.to_bytes())
            .with_context(|| format!("failed to write identity key: {}", path.display()))?;
        Ok(())
    }
}
