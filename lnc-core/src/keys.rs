use core::fmt;

use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use lightning::ln::chan_utils::build_commitment_secret;
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::error::{internal_error, Result};
use crate::util::crypto_utils::{generate_seed, hkdf_sha256, hkdf_sha256_keys};
use crate::util::INITIAL_COMMITMENT_NUMBER;

/// Identifies the key set of one channel, persisted with the channel
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeysId(#[serde_as(as = "Hex")] pub [u8; 32]);

impl KeysId {
    /// A fresh random id
    pub fn random() -> Self {
        KeysId(generate_seed())
    }
}

impl fmt::Debug for KeysId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Public keys and basepoints one side contributes to a channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPoints {
    /// Key in the 2-of-2 funding output
    pub funding_pubkey: PublicKey,
    /// Basepoint for revocation keys the *other* side may use against us
    pub revocation_basepoint: PublicKey,
    /// Key receiving the to-remote output of the other side's commitment
    pub payment_point: PublicKey,
    /// Basepoint for the delayed to-local key
    pub delayed_payment_basepoint: PublicKey,
}

/// Secret keys of one channel
pub struct ChannelKeys {
    /// Funding key
    pub funding_key: SecretKey,
    /// Revocation base secret
    pub revocation_base_key: SecretKey,
    /// Payment key, used untweaked
    pub payment_key: SecretKey,
    /// Delayed payment base secret
    pub delayed_payment_base_key: SecretKey,
    commitment_seed: [u8; 32],
}

fn secret_key(bytes: &[u8]) -> Result<SecretKey> {
    SecretKey::from_slice(bytes).map_err(|_| internal_error("derived an invalid secret key"))
}

impl ChannelKeys {
    /// The public counterparts
    pub fn points(&self, secp_ctx: &Secp256k1<All>) -> ChannelPoints {
        ChannelPoints {
            funding_pubkey: PublicKey::from_secret_key(secp_ctx, &self.funding_key),
            revocation_basepoint: PublicKey::from_secret_key(secp_ctx, &self.revocation_base_key),
            payment_point: PublicKey::from_secret_key(secp_ctx, &self.payment_key),
            delayed_payment_basepoint: PublicKey::from_secret_key(
                secp_ctx,
                &self.delayed_payment_base_key,
            ),
        }
    }

    /// The per-commitment secret of our commitment number `commitment_number`
    pub fn per_commitment_secret(&self, commitment_number: u64) -> [u8; 32] {
        build_commitment_secret(&self.commitment_seed, INITIAL_COMMITMENT_NUMBER - commitment_number)
    }

    /// The per-commitment point of our commitment number `commitment_number`
    pub fn per_commitment_point(
        &self,
        secp_ctx: &Secp256k1<All>,
        commitment_number: u64,
    ) -> Result<PublicKey> {
        let secret = secret_key(&self.per_commitment_secret(commitment_number))?;
        Ok(PublicKey::from_secret_key(secp_ctx, &secret))
    }
}

/// Derives the node identity and channel keys from wallet seed material.
///
/// The password is mixed into every derivation, a wrong password yields a
/// different identity rather than an error.
pub struct KeysManager {
    node_secret: SecretKey,
    node_id: PublicKey,
    channel_master: [u8; 32],
}

impl KeysManager {
    /// Derive keys from the seed and password
    pub fn new(seed: &[u8; 32], password: &str) -> Result<Self> {
        let secp_ctx = Secp256k1::signing_only();
        let node_secret = secret_key(&hkdf_sha256(seed, b"nodeid", password.as_bytes()))?;
        let node_id = PublicKey::from_secret_key(&secp_ctx, &node_secret);
        let channel_master = hkdf_sha256(seed, b"channels", password.as_bytes());
        Ok(KeysManager { node_secret, node_id, channel_master })
    }

    /// The node identity
    pub fn node_id(&self) -> PublicKey {
        self.node_id
    }

    /// The node identity secret, used by the transport handshake
    pub fn node_secret(&self) -> &SecretKey {
        &self.node_secret
    }

    /// The key set for a channel
    pub fn channel_keys(&self, keys_id: &KeysId) -> Result<ChannelKeys> {
        let keys = hkdf_sha256_keys(&self.channel_master, b"per-channel", &keys_id.0);
        let mut commitment_seed = [0u8; 32];
        commitment_seed.copy_from_slice(&keys[128..160]);
        Ok(ChannelKeys {
            funding_key: secret_key(&keys[0..32])?,
            revocation_base_key: secret_key(&keys[32..64])?,
            payment_key: secret_key(&keys[64..96])?,
            delayed_payment_base_key: secret_key(&keys[96..128])?,
            commitment_seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn password_changes_identity_test() {
        let seed = [3u8; 32];
        let a = KeysManager::new(&seed, "hunter2").unwrap();
        let b = KeysManager::new(&seed, "hunter2").unwrap();
        let c = KeysManager::new(&seed, "hunter3").unwrap();
        assert_eq!(a.node_id(), b.node_id());
        assert_ne!(a.node_id(), c.node_id());
    }

    #[test]
    fn channel_keys_are_distinct_test() {
        let secp_ctx = Secp256k1::new();
        let manager = KeysManager::new(&[1u8; 32], "").unwrap();
        let k1 = manager.channel_keys(&KeysId([1; 32])).unwrap().points(&secp_ctx);
        let k2 = manager.channel_keys(&KeysId([2; 32])).unwrap().points(&secp_ctx);
        assert_ne!(k1.funding_pubkey, k2.funding_pubkey);
        assert_ne!(k1.funding_pubkey, k1.revocation_basepoint);
        let again = manager.channel_keys(&KeysId([1; 32])).unwrap().points(&secp_ctx);
        assert_eq!(k1, again);
    }

    #[test]
    fn per_commitment_points_test() {
        let secp_ctx = Secp256k1::new();
        let keys = KeysManager::new(&[1u8; 32], "").unwrap().channel_keys(&KeysId([9; 32])).unwrap();
        let secret = SecretKey::from_slice(&keys.per_commitment_secret(4)).unwrap();
        assert_eq!(
            PublicKey::from_secret_key(&secp_ctx, &secret),
            keys.per_commitment_point(&secp_ctx, 4).unwrap()
        );
        assert_ne!(keys.per_commitment_secret(4), keys.per_commitment_secret(5));
    }

    #[test]
    fn keys_id_serde_test() {
        let id = KeysId([0xab; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        assert_eq!(serde_json::from_str::<KeysId>(&json).unwrap(), id);
    }
}
