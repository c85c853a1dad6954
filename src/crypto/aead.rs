//! Packet-numbered authenticated encryption.
//!
//! An [`Encrypter`] / [`Decrypter`] pair holds the key material for one
//! direction of one connection. Every packet is sealed under a nonce built
//! from the fixed nonce material plus a 64-bit packet number; the encrypter
//! refuses to reuse or rewind a packet number so a nonce can never repeat
//! under the same key.
//!
//! The unauthenticated stream-cipher suites (`salsa20`, `chacha20`,
//! `chacha20-ietf`) follow the same contract with a zero-length tag: each
//! packet gets a fresh keystream derived from its own nonce.

use aes::{Aes128, Aes192};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{AeadInPlace, KeyInit, Nonce as AeadNonce, Tag};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha20, ChaCha20Legacy};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use salsa20::Salsa20;
use zeroize::Zeroizing;

use crate::crypto::kdf;
use crate::crypto::suite::{CipherSuite, NonceScheme};
use crate::crypto::{MAX_KEY_SIZE, MAX_NONCE_SIZE};
use crate::error::{Error, Result};

type Aes128Gcm12 = AesGcm<Aes128, U12, U12>;
type Aes192Gcm = AesGcm<Aes192, U12>;

/// Calculate the ciphertext length for a given plaintext length.
pub const fn ciphertext_size(suite: CipherSuite, plaintext_len: usize) -> usize {
    plaintext_len + suite.tag_size()
}

/// Calculate the maximum plaintext length for a given ciphertext length.
pub const fn max_plaintext_size(suite: CipherSuite, ciphertext_len: usize) -> usize {
    ciphertext_len.saturating_sub(suite.tag_size())
}

enum Primitive {
    Plaintext,
    Aes128Gcm(Box<Aes128Gcm>),
    Aes128Gcm12(Box<Aes128Gcm12>),
    Aes192Gcm(Box<Aes192Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
    XChaCha20Poly1305(Box<XChaCha20Poly1305>),
    Keystream(CipherSuite, Zeroizing<Vec<u8>>),
}

fn bad_key<E>(_: E) -> Error {
    Error::crypto("invalid key length")
}

fn seal<A: AeadInPlace>(
    cipher: &A,
    nonce: &[u8],
    aad: &[u8],
    data: &mut [u8],
    tag_out: &mut [u8],
) -> Result<()> {
    let tag = cipher
        .encrypt_in_place_detached(AeadNonce::<A>::from_slice(nonce), aad, data)
        .map_err(|_| Error::crypto("encryption failed"))?;
    tag_out.copy_from_slice(&tag);
    Ok(())
}

fn open<A: AeadInPlace>(
    cipher: &A,
    nonce: &[u8],
    aad: &[u8],
    data: &mut [u8],
    tag: &[u8],
) -> Result<()> {
    cipher
        .decrypt_in_place_detached(
            AeadNonce::<A>::from_slice(nonce),
            aad,
            data,
            Tag::<A>::from_slice(tag),
        )
        .map_err(|_| Error::crypto("decryption/authentication failed"))
}

fn apply_keystream(suite: CipherSuite, key: &[u8], nonce: &[u8], data: &mut [u8]) -> Result<()> {
    match suite {
        CipherSuite::Salsa20 => Salsa20::new_from_slices(key, nonce)
            .map_err(bad_key)?
            .apply_keystream(data),
        CipherSuite::ChaCha20 => ChaCha20Legacy::new_from_slices(key, nonce)
            .map_err(bad_key)?
            .apply_keystream(data),
        CipherSuite::ChaCha20Ietf => ChaCha20::new_from_slices(key, nonce)
            .map_err(bad_key)?
            .apply_keystream(data),
        other => return Err(Error::crypto(format!("{} is not a stream cipher", other))),
    }
    Ok(())
}

impl Primitive {
    fn new(suite: CipherSuite, key: &[u8]) -> Result<Self> {
        Ok(match suite {
            CipherSuite::Plaintext => Primitive::Plaintext,
            CipherSuite::Aes128Gcm => {
                Primitive::Aes128Gcm(Box::new(Aes128Gcm::new_from_slice(key).map_err(bad_key)?))
            }
            CipherSuite::Aes128Gcm12 => Primitive::Aes128Gcm12(Box::new(
                Aes128Gcm12::new_from_slice(key).map_err(bad_key)?,
            )),
            CipherSuite::Aes192Gcm => {
                Primitive::Aes192Gcm(Box::new(Aes192Gcm::new_from_slice(key).map_err(bad_key)?))
            }
            CipherSuite::Aes256Gcm => {
                Primitive::Aes256Gcm(Box::new(Aes256Gcm::new_from_slice(key).map_err(bad_key)?))
            }
            CipherSuite::ChaCha20Poly1305 => Primitive::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new_from_slice(key).map_err(bad_key)?,
            )),
            CipherSuite::XChaCha20Poly1305 => Primitive::XChaCha20Poly1305(Box::new(
                XChaCha20Poly1305::new_from_slice(key).map_err(bad_key)?,
            )),
            CipherSuite::Salsa20 | CipherSuite::ChaCha20 | CipherSuite::ChaCha20Ietf => {
                Primitive::Keystream(suite, Zeroizing::new(key.to_vec()))
            }
        })
    }

    fn seal(&self, nonce: &[u8], aad: &[u8], data: &mut [u8], tag_out: &mut [u8]) -> Result<()> {
        match self {
            Primitive::Plaintext => Ok(()),
            Primitive::Aes128Gcm(c) => seal(c.as_ref(), nonce, aad, data, tag_out),
            Primitive::Aes128Gcm12(c) => seal(c.as_ref(), nonce, aad, data, tag_out),
            Primitive::Aes192Gcm(c) => seal(c.as_ref(), nonce, aad, data, tag_out),
            Primitive::Aes256Gcm(c) => seal(c.as_ref(), nonce, aad, data, tag_out),
            Primitive::ChaCha20Poly1305(c) => seal(c.as_ref(), nonce, aad, data, tag_out),
            Primitive::XChaCha20Poly1305(c) => seal(c.as_ref(), nonce, aad, data, tag_out),
            Primitive::Keystream(suite, key) => apply_keystream(*suite, key, nonce, data),
        }
    }

    fn open(&self, nonce: &[u8], aad: &[u8], data: &mut [u8], tag: &[u8]) -> Result<()> {
        match self {
            Primitive::Plaintext => Ok(()),
            Primitive::Aes128Gcm(c) => open(c.as_ref(), nonce, aad, data, tag),
            Primitive::Aes128Gcm12(c) => open(c.as_ref(), nonce, aad, data, tag),
            Primitive::Aes192Gcm(c) => open(c.as_ref(), nonce, aad, data, tag),
            Primitive::Aes256Gcm(c) => open(c.as_ref(), nonce, aad, data, tag),
            Primitive::ChaCha20Poly1305(c) => open(c.as_ref(), nonce, aad, data, tag),
            Primitive::XChaCha20Poly1305(c) => open(c.as_ref(), nonce, aad, data, tag),
            Primitive::Keystream(suite, key) => apply_keystream(*suite, key, nonce, data),
        }
    }
}

/// Key material and nonce state shared by both directions' contexts.
struct CrypterCore {
    suite: CipherSuite,
    key: Zeroizing<Vec<u8>>,
    fixed_nonce: [u8; MAX_NONCE_SIZE],
    primitive: Option<Primitive>,
    nonce_set: bool,
}

impl CrypterCore {
    fn new(suite: CipherSuite) -> Self {
        Self {
            suite,
            key: Zeroizing::new(Vec::new()),
            fixed_nonce: [0u8; MAX_NONCE_SIZE],
            primitive: None,
            nonce_set: false,
        }
    }

    fn install_key(&mut self, key: &[u8]) -> Result<()> {
        if key.len() != self.suite.key_size() || key.len() > MAX_KEY_SIZE {
            return Err(Error::crypto(format!(
                "{} requires a {}-byte key, got {}",
                self.suite,
                self.suite.key_size(),
                key.len()
            )));
        }
        self.primitive = Some(Primitive::new(self.suite, key)?);
        self.key = Zeroizing::new(key.to_vec());
        Ok(())
    }

    fn set_key(&mut self, key: &[u8]) -> Result<()> {
        if self.primitive.is_some() {
            return Err(Error::crypto("key already set"));
        }
        self.install_key(key)
    }

    fn set_fixed_nonce(&mut self, scheme: NonceScheme, material: &[u8]) -> Result<()> {
        if self.suite.nonce_scheme() != scheme {
            return Err(Error::crypto(format!(
                "{} uses {:?} nonces",
                self.suite,
                self.suite.nonce_scheme()
            )));
        }
        if self.nonce_set {
            return Err(Error::crypto("nonce material already set"));
        }
        let expected = self.suite.fixed_nonce_size();
        if material.len() != expected {
            return Err(Error::Buffer {
                expected,
                actual: material.len(),
            });
        }
        self.fixed_nonce[..expected].copy_from_slice(material);
        self.nonce_set = true;
        Ok(())
    }

    fn fixed_nonce(&self) -> &[u8] {
        &self.fixed_nonce[..self.suite.fixed_nonce_size()]
    }

    fn nonce(&self, packet_number: u64) -> [u8; MAX_NONCE_SIZE] {
        let size = self.suite.nonce_size();
        let mut nonce = [0u8; MAX_NONCE_SIZE];
        nonce[..size].copy_from_slice(&self.fixed_nonce[..size]);
        match self.suite.nonce_scheme() {
            NonceScheme::Prefix => {
                if size >= 8 {
                    nonce[size - 8..size].copy_from_slice(&packet_number.to_be_bytes());
                }
            }
            NonceScheme::Iv => {
                for (b, p) in nonce.iter_mut().zip(packet_number.to_le_bytes()) {
                    *b ^= p;
                }
            }
        }
        nonce
    }

    fn primitive(&self) -> Result<&Primitive> {
        self.primitive
            .as_ref()
            .ok_or_else(|| Error::crypto("key not set"))
    }
}

/// Encrypting context for one direction of one connection.
pub struct Encrypter {
    core: CrypterCore,
    last_packet: Option<u64>,
}

impl Encrypter {
    /// Create an encrypter for `suite`; a key must be installed before use.
    pub fn new(suite: CipherSuite) -> Self {
        Self {
            core: CrypterCore::new(suite),
            last_packet: None,
        }
    }

    /// The suite this context was built for.
    pub fn suite(&self) -> CipherSuite {
        self.core.suite
    }

    /// Install the key. Fails on a size mismatch or if a key is already set.
    pub fn set_key(&mut self, key: &[u8]) -> Result<()> {
        self.core.set_key(key)
    }

    /// Install the fixed nonce prefix (`nonce_size - 8` bytes) for prefix-form suites.
    ///
    /// Defaults to all zeros when never called.
    pub fn set_nonce_prefix(&mut self, prefix: &[u8]) -> Result<()> {
        self.core.set_fixed_nonce(NonceScheme::Prefix, prefix)
    }

    /// Install the full-size IV for IV-form suites.
    pub fn set_iv(&mut self, iv: &[u8]) -> Result<()> {
        self.core.set_fixed_nonce(NonceScheme::Iv, iv)
    }

    /// The installed key bytes.
    pub fn key(&self) -> &[u8] {
        &self.core.key
    }

    /// The fixed nonce material (prefix or IV).
    pub fn nonce_prefix(&self) -> &[u8] {
        self.core.fixed_nonce()
    }

    /// `n + tag_size`
    pub fn ciphertext_size(&self, plaintext_len: usize) -> usize {
        ciphertext_size(self.core.suite, plaintext_len)
    }

    /// `n - min(n, tag_size)`
    pub fn max_plaintext_size(&self, ciphertext_len: usize) -> usize {
        max_plaintext_size(self.core.suite, ciphertext_len)
    }

    /// Encrypt one packet into `out`, returning the number of bytes written.
    ///
    /// `packet_number` must be strictly greater than every packet number
    /// previously used with this context. Nothing is written on failure.
    pub fn encrypt_packet_into(
        &mut self,
        packet_number: u64,
        associated_data: &[u8],
        plaintext: &[u8],
        out: &mut [u8],
    ) -> Result<usize> {
        let needed = self.ciphertext_size(plaintext.len());
        if out.len() < needed {
            return Err(Error::Buffer {
                expected: needed,
                actual: out.len(),
            });
        }
        if let Some(last) = self.last_packet {
            if packet_number <= last {
                return Err(Error::crypto(format!(
                    "packet number {} does not advance past {}",
                    packet_number, last
                )));
            }
        }

        let primitive = self.core.primitive()?;
        let nonce = self.core.nonce(packet_number);
        let nonce = &nonce[..self.core.suite.nonce_size()];

        let (body, rest) = out.split_at_mut(plaintext.len());
        body.copy_from_slice(plaintext);
        let tag = &mut rest[..self.core.suite.tag_size()];
        if let Err(e) = primitive.seal(nonce, associated_data, body, tag) {
            out[..needed].fill(0);
            return Err(e);
        }

        self.last_packet = Some(packet_number);
        Ok(needed)
    }

    /// Encrypt one packet, returning `ciphertext || tag`.
    pub fn encrypt_packet(
        &mut self,
        packet_number: u64,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.ciphertext_size(plaintext.len())];
        self.encrypt_packet_into(packet_number, associated_data, plaintext, &mut out)?;
        Ok(out)
    }
}

/// Decrypting context for one direction of one connection.
///
/// Unlike [`Encrypter`], packet numbers are not required to increase: any
/// number may be opened, in any order and more than once. Callers that need
/// replay protection track the expected number themselves, as
/// [`ChunkDecoder`](crate::crypto::ChunkDecoder) does.
pub struct Decrypter {
    core: CrypterCore,
    preliminary: bool,
}

impl Decrypter {
    /// Create a decrypter for `suite`; a key must be installed before use.
    pub fn new(suite: CipherSuite) -> Self {
        Self {
            core: CrypterCore::new(suite),
            preliminary: false,
        }
    }

    /// The suite this context was built for.
    pub fn suite(&self) -> CipherSuite {
        self.core.suite
    }

    /// Install the final key.
    pub fn set_key(&mut self, key: &[u8]) -> Result<()> {
        self.core.set_key(key)
    }

    /// Install the fixed nonce prefix for prefix-form suites.
    pub fn set_nonce_prefix(&mut self, prefix: &[u8]) -> Result<()> {
        self.core.set_fixed_nonce(NonceScheme::Prefix, prefix)
    }

    /// Install the full-size IV for IV-form suites.
    pub fn set_iv(&mut self, iv: &[u8]) -> Result<()> {
        self.core.set_fixed_nonce(NonceScheme::Iv, iv)
    }

    /// Install a key that only becomes usable after
    /// [`set_diversification_nonce`](Self::set_diversification_nonce).
    pub fn set_preliminary_key(&mut self, key: &[u8]) -> Result<()> {
        self.core.set_key(key)?;
        self.preliminary = true;
        Ok(())
    }

    /// Finish key diversification, replacing the preliminary key and nonce
    /// material with values derived from `nonce`.
    pub fn set_diversification_nonce(&mut self, nonce: &[u8; 32]) -> Result<()> {
        if !self.preliminary {
            return Err(Error::crypto("no preliminary key to diversify"));
        }
        let (key, prefix) = kdf::diversify(
            &self.core.key,
            self.core.fixed_nonce(),
            nonce,
            self.core.suite.key_size(),
        )?;
        self.core.install_key(&key)?;
        let len = prefix.len();
        self.core.fixed_nonce[..len].copy_from_slice(&prefix);
        self.preliminary = false;
        Ok(())
    }

    /// Whether decryption is blocked on key diversification.
    pub fn is_diversification_pending(&self) -> bool {
        self.preliminary
    }

    /// `n + tag_size`
    pub fn ciphertext_size(&self, plaintext_len: usize) -> usize {
        ciphertext_size(self.core.suite, plaintext_len)
    }

    /// `n - min(n, tag_size)`
    pub fn max_plaintext_size(&self, ciphertext_len: usize) -> usize {
        max_plaintext_size(self.core.suite, ciphertext_len)
    }

    /// Decrypt one packet into `out`, returning the plaintext length.
    ///
    /// `packet_number` is not checked against earlier calls.
    pub fn decrypt_packet_into(
        &mut self,
        packet_number: u64,
        associated_data: &[u8],
        ciphertext: &[u8],
        out: &mut [u8],
    ) -> Result<usize> {
        if self.preliminary {
            return Err(Error::KeyDiversificationPending);
        }
        let tag_size = self.core.suite.tag_size();
        if ciphertext.len() < tag_size {
            return Err(Error::Buffer {
                expected: tag_size,
                actual: ciphertext.len(),
            });
        }
        let plain_len = ciphertext.len() - tag_size;
        if out.len() < plain_len {
            return Err(Error::Buffer {
                expected: plain_len,
                actual: out.len(),
            });
        }

        let primitive = self.core.primitive()?;
        let nonce = self.core.nonce(packet_number);
        let nonce = &nonce[..self.core.suite.nonce_size()];

        let (body, tag) = ciphertext.split_at(plain_len);
        let dest = &mut out[..plain_len];
        dest.copy_from_slice(body);
        if let Err(e) = primitive.open(nonce, associated_data, dest, tag) {
            dest.fill(0);
            return Err(e);
        }
        Ok(plain_len)
    }

    /// Decrypt one packet, returning the plaintext.
    pub fn decrypt_packet(
        &mut self,
        packet_number: u64,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.max_plaintext_size(ciphertext.len())];
        let n = self.decrypt_packet_into(packet_number, associated_data, ciphertext, &mut out)?;
        out.truncate(n);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(suite: CipherSuite) -> Vec<u8> {
        (0..suite.key_size() as u8).collect()
    }

    fn pair(suite: CipherSuite) -> (Encrypter, Decrypter) {
        let key = test_key(suite);
        let mut enc = Encrypter::new(suite);
        let mut dec = Decrypter::new(suite);
        enc.set_key(&key).unwrap();
        dec.set_key(&key).unwrap();
        (enc, dec)
    }

    #[test]
    fn test_round_trip_all_suites() {
        for suite in CipherSuite::ALL {
            let (mut enc, mut dec) = pair(suite);
            for (pn, msg) in [(0u64, &b""[..]), (1, b"hello"), (7, &[0xabu8; 1500][..])] {
                let ct = enc.encrypt_packet(pn, b"aad", msg).unwrap();
                assert_eq!(ct.len(), msg.len() + suite.tag_size(), "{}", suite);
                let pt = dec.decrypt_packet(pn, b"aad", &ct).unwrap();
                assert_eq!(pt, msg, "{}", suite);
            }
        }
    }

    #[test]
    fn test_wrong_packet_number_fails() {
        for suite in CipherSuite::ALL.into_iter().filter(|s| s.is_aead()) {
            let (mut enc, mut dec) = pair(suite);
            let ct1 = enc.encrypt_packet(1, b"", b"first").unwrap();
            let ct2 = enc.encrypt_packet(2, b"", b"second").unwrap();
            assert!(dec.decrypt_packet(2, b"", &ct1).is_err(), "{}", suite);
            assert!(dec.decrypt_packet(1, b"", &ct2).is_err(), "{}", suite);
        }
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        for suite in CipherSuite::ALL.into_iter().filter(|s| s.is_aead()) {
            let (mut enc, mut dec) = pair(suite);
            let mut ct = enc.encrypt_packet(5, b"", b"secret data").unwrap();
            ct[0] ^= 0x01;
            assert!(dec.decrypt_packet(5, b"", &ct).is_err(), "{}", suite);
        }
    }

    #[test]
    fn test_wrong_aad_fails() {
        let (mut enc, mut dec) = pair(CipherSuite::Aes256Gcm);
        let ct = enc.encrypt_packet(0, b"context1", b"secret").unwrap();
        assert!(dec.decrypt_packet(0, b"context2", &ct).is_err());
    }

    #[test]
    fn test_packet_number_must_advance() {
        let (mut enc, _) = pair(CipherSuite::ChaCha20Poly1305);
        enc.encrypt_packet(3, b"", b"a").unwrap();
        assert!(enc.encrypt_packet(3, b"", b"b").is_err());
        assert!(enc.encrypt_packet(2, b"", b"c").is_err());
        assert!(enc.encrypt_packet(4, b"", b"d").is_ok());
    }

    #[test]
    fn test_decrypt_order_unchecked() {
        let (mut enc, mut dec) = pair(CipherSuite::Aes128Gcm);
        let ct1 = enc.encrypt_packet(1, b"", b"one").unwrap();
        let ct2 = enc.encrypt_packet(2, b"", b"two").unwrap();
        assert_eq!(dec.decrypt_packet(2, b"", &ct2).unwrap(), b"two");
        assert_eq!(dec.decrypt_packet(1, b"", &ct1).unwrap(), b"one");
        assert_eq!(dec.decrypt_packet(1, b"", &ct1).unwrap(), b"one");
    }

    #[test]
    fn test_stream_cipher_keystream_differs_per_packet() {
        let (mut enc, _) = pair(CipherSuite::Salsa20);
        let a = enc.encrypt_packet(0, b"", &[0u8; 64]).unwrap();
        let b = enc.encrypt_packet(1, b"", &[0u8; 64]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_size_enforced_and_immutable() {
        let mut enc = Encrypter::new(CipherSuite::Aes128Gcm);
        assert!(enc.set_key(&[0u8; 32]).is_err());
        enc.set_key(&[0u8; 16]).unwrap();
        assert!(enc.set_key(&[1u8; 16]).is_err());

        enc.set_nonce_prefix(&[9u8; 4]).unwrap();
        assert!(enc.set_nonce_prefix(&[8u8; 4]).is_err());
        assert_eq!(enc.nonce_prefix(), &[9u8; 4]);
    }

    #[test]
    fn test_nonce_scheme_mismatch_rejected() {
        let mut enc = Encrypter::new(CipherSuite::Aes256Gcm);
        assert!(enc.set_iv(&[0u8; 12]).is_err());
        let mut enc = Encrypter::new(CipherSuite::XChaCha20Poly1305);
        assert!(enc.set_nonce_prefix(&[0u8; 16]).is_err());
        assert!(enc.set_iv(&[0u8; 24]).is_ok());
    }

    #[test]
    fn test_encrypt_before_key_fails() {
        let mut enc = Encrypter::new(CipherSuite::Aes256Gcm);
        assert!(enc.encrypt_packet(0, b"", b"x").is_err());
    }

    #[test]
    fn test_prefix_nonce_layout() {
        let mut core = CrypterCore::new(CipherSuite::Aes128Gcm);
        core.set_fixed_nonce(NonceScheme::Prefix, &[1, 2, 3, 4]).unwrap();
        let nonce = core.nonce(0x0102);
        assert_eq!(&nonce[..12], &[1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0x01, 0x02]);
    }

    #[test]
    fn test_iv_nonce_layout() {
        let mut core = CrypterCore::new(CipherSuite::XChaCha20Poly1305);
        core.set_fixed_nonce(NonceScheme::Iv, &[0xffu8; 24]).unwrap();
        let nonce = core.nonce(1);
        assert_eq!(nonce[0], 0xfe);
        assert_eq!(&nonce[1..24], &[0xffu8; 23]);
    }

    #[test]
    fn test_destination_too_small() {
        let (mut enc, _) = pair(CipherSuite::Aes128Gcm);
        let mut out = [0u8; 20];
        let err = enc.encrypt_packet_into(0, b"", &[7u8; 5], &mut out).unwrap_err();
        assert!(matches!(err, Error::Buffer { expected: 21, actual: 20 }));
        assert_eq!(out, [0u8; 20]);
        // A failed call must not consume the packet number.
        assert!(enc.encrypt_packet_into(0, b"", &[7u8; 4], &mut out).is_ok());
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let (_, mut dec) = pair(CipherSuite::Aes256Gcm);
        assert!(matches!(
            dec.decrypt_packet(0, b"", &[0u8; 15]),
            Err(Error::Buffer { expected: 16, actual: 15 })
        ));
    }

    #[test]
    fn test_key_diversification() {
        let suite = CipherSuite::Aes128Gcm;
        let preliminary = [0x11u8; 16];
        let prefix = [0x22u8; 4];
        let div_nonce = [0x33u8; 32];

        let mut dec = Decrypter::new(suite);
        dec.set_nonce_prefix(&prefix).unwrap();
        dec.set_preliminary_key(&preliminary).unwrap();
        assert!(dec.is_diversification_pending());

        let (key, new_prefix) = kdf::diversify(&preliminary, &prefix, &div_nonce, 16).unwrap();
        let mut enc = Encrypter::new(suite);
        enc.set_key(&key).unwrap();
        enc.set_nonce_prefix(&new_prefix).unwrap();
        let ct = enc.encrypt_packet(1, b"", b"diversified").unwrap();

        let err = dec.decrypt_packet(1, b"", &ct).unwrap_err();
        assert!(err.is_retry_later());

        dec.set_diversification_nonce(&div_nonce).unwrap();
        assert!(!dec.is_diversification_pending());
        assert_eq!(dec.decrypt_packet(1, b"", &ct).unwrap(), b"diversified");
    }

    #[test]
    fn test_size_arithmetic() {
        let enc = Encrypter::new(CipherSuite::Aes128Gcm12);
        assert_eq!(enc.ciphertext_size(0), 12);
        assert_eq!(enc.ciphertext_size(100), 112);
        assert_eq!(enc.max_plaintext_size(112), 100);
        assert_eq!(enc.max_plaintext_size(5), 0);
        assert_eq!(max_plaintext_size(CipherSuite::Plaintext, 5), 5);
    }
}
