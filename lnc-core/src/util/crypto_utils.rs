use bitcoin::hashes::sha256::Hash as BitcoinSha256;
use bitcoin::hashes::{Hash, HashEngine, Hmac, HmacEngine};
use bitcoin::secp256k1::{self, ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::EcdsaSighashType;

fn hkdf_extract_expand(salt: &[u8], secret: &[u8], info: &[u8], output: &mut [u8]) {
    let mut hmac = HmacEngine::<BitcoinSha256>::new(salt);
    hmac.input(secret);
    let prk = Hmac::from_engine(hmac).to_byte_array();

    let mut t = [0; 32];
    let mut n: u8 = 0;

    for chunk in output.chunks_mut(32) {
        let mut hmac = HmacEngine::<BitcoinSha256>::new(&prk[..]);
        // outputs are a handful of 32 byte blocks
        n += 1;
        if n != 1 {
            hmac.input(&t);
        }
        hmac.input(info);
        hmac.input(&[n]);
        t = Hmac::from_engine(hmac).to_byte_array();
        chunk.copy_from_slice(&t[..chunk.len()]);
    }
}

/// derive a secret from another secret using HKDF-SHA256
pub fn hkdf_sha256(secret: &[u8], info: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut result = [0u8; 32];
    hkdf_extract_expand(salt, secret, info, &mut result);
    result
}

/// derive five 32 byte secrets in one pass
pub(crate) fn hkdf_sha256_keys(secret: &[u8], info: &[u8], salt: &[u8]) -> [u8; 32 * 5] {
    let mut result = [0u8; 32 * 5];
    hkdf_extract_expand(salt, secret, info, &mut result);
    result
}

/// Convert a [Signature] to Bitcoin signature bytes, with SIGHASH_ALL
pub fn signature_to_bitcoin_vec(sig: Signature) -> Vec<u8> {
    let mut sigvec = sig.serialize_der().to_vec();
    sigvec.push(EcdsaSighashType::All as u8);
    sigvec
}

/// Sign a 32 byte sighash
pub(crate) fn sign_digest(
    secp_ctx: &Secp256k1<secp256k1::All>,
    digest: [u8; 32],
    key: &SecretKey,
) -> Signature {
    secp_ctx.sign_ecdsa(&Message::from_digest(digest), key)
}

/// Verify a signature over a 32 byte sighash
pub(crate) fn verify_digest(
    secp_ctx: &Secp256k1<secp256k1::All>,
    digest: [u8; 32],
    sig: &Signature,
    pubkey: &PublicKey,
) -> bool {
    secp_ctx.verify_ecdsa(&Message::from_digest(digest), sig, pubkey).is_ok()
}

/// Generate 32 random bytes
pub fn generate_seed() -> [u8; 32] {
    use secp256k1::rand::RngCore;
    let mut seed = [0; 32];
    let mut rng = secp256k1::rand::rngs::OsRng;
    rng.fill_bytes(&mut seed);
    seed
}

/// Hash arbitrary bytes to a signing message, with a domain tag
pub fn tagged_message(tag: &str, data: &[&[u8]]) -> Message {
    let mut sha = BitcoinSha256::engine();
    sha.input(tag.as_bytes());
    for d in data {
        sha.input(d);
    }
    Message::from_digest(BitcoinSha256::from_engine(sha).to_byte_array())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf() {
        let secret = [1u8];
        let info = [2u8];
        let salt = [3u8];
        let mut output = [0u8; 32];
        hkdf_extract_expand(&salt, &secret, &info, &mut output);
        assert_eq!(
            hex::encode(output),
            "13a04658302cc5173a8077f2f296662a7a3ddb2359be92770b13e0b9e63a23d0"
        );
        // the first block of a longer expansion is the same
        let keys = hkdf_sha256_keys(&secret, &info, &salt);
        assert_eq!(keys[..32], output);
        assert_ne!(keys[32..64], output);
    }

    #[test]
    fn sign_verify_digest_test() {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[5; 32]).unwrap();
        let pubkey = PublicKey::from_secret_key(&secp, &key);
        let sig = sign_digest(&secp, [9; 32], &key);
        assert!(verify_digest(&secp, [9; 32], &sig, &pubkey));
        assert!(!verify_digest(&secp, [8; 32], &sig, &pubkey));
        let bitcoin_sig = signature_to_bitcoin_vec(sig);
        assert_eq!(*bitcoin_sig.last().unwrap(), 0x01);
    }
}
