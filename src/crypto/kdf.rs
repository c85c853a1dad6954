//! Key Derivation Functions.
//!
//! - Password to master key: the MD5 `EVP_BytesToKey` construction used by
//!   Shadowsocks deployments.
//! - Master key to per-session subkey: HKDF-SHA1 keyed by the random salt
//!   that opens every encrypted stream.
//! - Preliminary key diversification: HKDF-SHA256 over key and nonce prefix.

use hkdf::Hkdf as HkdfImpl;
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// HKDF info label for Shadowsocks session subkeys.
pub const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// HKDF info label for key diversification.
pub const DIVERSIFICATION_INFO: &[u8] = b"key diversification";

/// Derive a `key_len`-byte master key from a password.
///
/// Repeatedly hashes `previous_digest || password` with MD5 and concatenates
/// the digests until enough bytes are produced.
pub fn password_to_key(password: &str, key_len: usize) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(Vec::with_capacity(key_len + 16));
    let mut previous: Option<[u8; 16]> = None;

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if let Some(prev) = previous {
            hasher.update(prev);
        }
        hasher.update(password.as_bytes());
        let digest: [u8; 16] = hasher.finalize().into();
        key.extend_from_slice(&digest);
        previous = Some(digest);
    }

    key.truncate(key_len);
    key
}

/// Derive the per-session subkey from the master key and stream salt.
pub fn session_subkey(master_key: &[u8], salt: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let mut okm = Zeroizing::new(vec![0u8; master_key.len()]);
    HkdfImpl::<Sha1>::new(Some(salt), master_key)
        .expand(SUBKEY_INFO, &mut okm)
        .map_err(|_| Error::crypto("HKDF expansion failed"))?;
    Ok(okm)
}

/// Diversify a preliminary key and nonce prefix with a 32-byte nonce.
///
/// Returns `(key, nonce_prefix)` with the same lengths as the inputs.
pub fn diversify(
    key: &[u8],
    nonce_prefix: &[u8],
    nonce: &[u8; 32],
    key_len: usize,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let ikm = Zeroizing::new([key, nonce_prefix].concat());
    let mut okm = Zeroizing::new(vec![0u8; key_len + nonce_prefix.len()]);
    HkdfImpl::<Sha256>::new(Some(&nonce[..]), &ikm)
        .expand(DIVERSIFICATION_INFO, &mut okm)
        .map_err(|_| Error::crypto("HKDF expansion failed"))?;
    let (k, p) = okm.split_at(key_len);
    Ok((k.to_vec(), p.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_to_key_known_answer() {
        // MD5("foobar") seeds the first block.
        let key = password_to_key("foobar", 32);
        assert_eq!(key.len(), 32);
        assert_eq!(hex::encode(&key[..16]), "3858f62230ac3c915f300c664312c63f");

        let mut second = Md5::new();
        second.update(&key[..16]);
        second.update(b"foobar");
        let second: [u8; 16] = second.finalize().into();
        assert_eq!(&key[16..], &second);
    }

    #[test]
    fn test_password_to_key_truncates() {
        let short = password_to_key("secret", 16);
        let long = password_to_key("secret", 24);
        assert_eq!(&long[..16], &short[..]);
        assert_eq!(long.len(), 24);
    }

    #[test]
    fn test_session_subkey_depends_on_salt() {
        let master = password_to_key("secret", 32);
        let a = session_subkey(&master, &[1u8; 32]).unwrap();
        let b = session_subkey(&master, &[2u8; 32]).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert_eq!(a, session_subkey(&master, &[1u8; 32]).unwrap());
    }

    #[test]
    fn test_diversify_lengths_and_determinism() {
        let (k1, p1) = diversify(&[7u8; 16], &[1u8; 4], &[9u8; 32], 16).unwrap();
        let (k2, p2) = diversify(&[7u8; 16], &[1u8; 4], &[9u8; 32], 16).unwrap();
        assert_eq!(k1.len(), 16);
        assert_eq!(p1.len(), 4);
        assert_eq!((k1.clone(), p1), (k2, p2));
        let (k3, _) = diversify(&[7u8; 16], &[1u8; 4], &[8u8; 32], 16).unwrap();
        assert_ne!(k1, k3);
    }
}
