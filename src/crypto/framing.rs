//! Chunked AEAD framing for encrypted streams.
//!
//! An encrypted stream opens with a random salt (`key_size` bytes) from
//! which both ends derive the session subkey. The payload follows as a
//! sequence of chunks:
//!
//! ```text
//! [encrypted length (2 bytes BE)][tag][encrypted payload][tag]
//! ```
//!
//! Length and payload are sealed under consecutive packet numbers starting
//! at zero. With padding enabled every chunk is wrapped in a
//! [`PaddingCodec`](crate::padding::PaddingCodec) frame before it reaches
//! the wire.

use bytes::BytesMut;

use crate::crypto::aead::{Decrypter, Encrypter};
use crate::crypto::kdf;
use crate::crypto::random::SecureRandom;
use crate::crypto::suite::CipherSuite;
use crate::error::{Error, Result};
use crate::padding::PaddingCodec;

/// Largest payload carried by one chunk.
pub const MAX_CHUNK_SIZE: usize = 0x3fff;

const LENGTH_FIELD_SIZE: usize = 2;

fn check_master_key(suite: CipherSuite, master_key: &[u8]) -> Result<()> {
    if master_key.len() != suite.key_size() {
        return Err(Error::crypto(format!(
            "{} requires a {}-byte key, got {}",
            suite,
            suite.key_size(),
            master_key.len()
        )));
    }
    Ok(())
}

fn subkey(suite: CipherSuite, master_key: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
    if suite.key_size() == 0 {
        return Ok(Vec::new());
    }
    Ok(kdf::session_subkey(master_key, salt)?.to_vec())
}

/// Encrypting half of a framed stream.
pub struct ChunkEncoder {
    suite: CipherSuite,
    encrypter: Encrypter,
    salt: Vec<u8>,
    salt_sent: bool,
    next_packet: u64,
    padding: Option<PaddingCodec>,
}

impl ChunkEncoder {
    /// Create an encoder with a fresh random salt.
    pub fn new(suite: CipherSuite, master_key: &[u8], padded: bool) -> Result<Self> {
        check_master_key(suite, master_key)?;
        let salt = SecureRandom::vec(suite.key_size());
        let mut encrypter = Encrypter::new(suite);
        let mut key = subkey(suite, master_key, &salt)?;
        let installed = encrypter.set_key(&key);
        zeroize::Zeroize::zeroize(&mut key);
        installed?;

        Ok(Self {
            suite,
            encrypter,
            salt,
            salt_sent: false,
            next_packet: 0,
            padding: padded.then(|| PaddingCodec::new(true)),
        })
    }

    /// The salt that opens this stream.
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Packet numbers consumed so far.
    pub fn packets_sealed(&self) -> u64 {
        self.next_packet
    }

    fn seal(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        out.resize(start + self.encrypter.ciphertext_size(plaintext.len()), 0);
        self.encrypter
            .encrypt_packet_into(self.next_packet, &[], plaintext, &mut out[start..])?;
        self.next_packet += 1;
        Ok(())
    }

    /// Encrypt `data`, appending wire bytes to `out`.
    pub fn encode(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if !self.salt_sent {
            out.extend_from_slice(&self.salt);
            self.salt_sent = true;
        }

        let tag = self.suite.tag_size();
        let mut chunk = Vec::with_capacity(LENGTH_FIELD_SIZE + MAX_CHUNK_SIZE + 2 * tag);
        for payload in data.chunks(MAX_CHUNK_SIZE) {
            chunk.clear();
            let len = (payload.len() as u16).to_be_bytes();
            self.seal(&len, &mut chunk)?;
            self.seal(payload, &mut chunk)?;

            match self.padding.as_mut() {
                Some(padding) => padding.add_padding(&chunk, out)?,
                None => out.extend_from_slice(&chunk),
            }
        }
        Ok(())
    }
}

/// Decrypting half of a framed stream.
///
/// Accepts arbitrarily fragmented input; incomplete salts, padding frames
/// and chunks are buffered until the rest arrives.
pub struct ChunkDecoder {
    suite: CipherSuite,
    master_key: zeroize::Zeroizing<Vec<u8>>,
    decrypter: Option<Decrypter>,
    padded: bool,
    wire: BytesMut,
    sealed: BytesMut,
    pending_len: Option<usize>,
    next_packet: u64,
}

impl ChunkDecoder {
    /// Create a decoder; the subkey is derived once the peer's salt arrives.
    pub fn new(suite: CipherSuite, master_key: &[u8], padded: bool) -> Self {
        Self {
            suite,
            master_key: zeroize::Zeroizing::new(master_key.to_vec()),
            decrypter: None,
            padded,
            wire: BytesMut::new(),
            sealed: BytesMut::new(),
            pending_len: None,
            next_packet: 0,
        }
    }

    /// Bytes received but not yet turned into plaintext.
    pub fn buffered(&self) -> usize {
        self.wire.len() + self.sealed.len()
    }

    /// Check the stream ended on a chunk boundary.
    ///
    /// Called once the peer has closed; a partial salt, padding frame or
    /// chunk left behind means the stream was cut short.
    pub fn finish(&self) -> Result<()> {
        if self.buffered() != 0 || self.pending_len.is_some() {
            return Err(Error::invalid("truncated chunk at EOF"));
        }
        Ok(())
    }

    fn open(&mut self, len: usize) -> Result<Vec<u8>> {
        let block = self.sealed.split_to(len);
        let decrypter = self
            .decrypter
            .as_mut()
            .ok_or_else(|| Error::crypto("stream salt not received"))?;
        let plain = decrypter.decrypt_packet(self.next_packet, &[], &block)?;
        self.next_packet += 1;
        Ok(plain)
    }

    /// Feed wire bytes, appending any completed plaintext to `out`.
    pub fn decode(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.wire.extend_from_slice(data);

        if self.decrypter.is_none() {
            check_master_key(self.suite, &self.master_key)?;
            let salt_len = self.suite.key_size();
            if self.wire.len() < salt_len {
                return Ok(());
            }
            let salt = self.wire.split_to(salt_len);
            let mut decrypter = Decrypter::new(self.suite);
            let mut key = subkey(self.suite, &self.master_key, &salt)?;
            let installed = decrypter.set_key(&key);
            zeroize::Zeroize::zeroize(&mut key);
            installed?;
            self.decrypter = Some(decrypter);
        }

        if self.padded {
            while let Some(frame) = PaddingCodec::remove_padding(&mut self.wire)? {
                self.sealed.extend_from_slice(&frame);
            }
        } else {
            self.sealed.extend_from_slice(&self.wire);
            self.wire.clear();
        }

        let tag = self.suite.tag_size();
        loop {
            match self.pending_len {
                None => {
                    if self.sealed.len() < LENGTH_FIELD_SIZE + tag {
                        break;
                    }
                    let len = self.open(LENGTH_FIELD_SIZE + tag)?;
                    let len = u16::from_be_bytes([len[0], len[1]]) as usize;
                    if len > MAX_CHUNK_SIZE {
                        return Err(Error::invalid(format!("chunk length {} too large", len)));
                    }
                    self.pending_len = Some(len);
                }
                Some(len) => {
                    if self.sealed.len() < len + tag {
                        break;
                    }
                    let plain = self.open(len + tag)?;
                    out.extend_from_slice(&plain);
                    self.pending_len = None;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master(suite: CipherSuite) -> Vec<u8> {
        kdf::password_to_key("framing-test", suite.key_size()).to_vec()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    #[test]
    fn test_round_trip_all_suites() {
        for suite in CipherSuite::ALL {
            for padded in [false, true] {
                let key = master(suite);
                let mut enc = ChunkEncoder::new(suite, &key, padded).unwrap();
                let mut dec = ChunkDecoder::new(suite, &key, padded);

                let data = payload(40_000);
                let mut wire = Vec::new();
                enc.encode(&data[..10], &mut wire).unwrap();
                enc.encode(&data[10..], &mut wire).unwrap();

                let mut plain = Vec::new();
                dec.decode(&wire, &mut plain).unwrap();
                assert_eq!(plain, data, "{} padded={}", suite, padded);
                assert_eq!(dec.buffered(), 0);
            }
        }
    }

    #[test]
    fn test_single_byte_fragmentation() {
        let suite = CipherSuite::ChaCha20Poly1305;
        let key = master(suite);
        let mut enc = ChunkEncoder::new(suite, &key, true).unwrap();
        let mut dec = ChunkDecoder::new(suite, &key, true);

        let data = payload(3000);
        let mut wire = Vec::new();
        enc.encode(&data, &mut wire).unwrap();

        let mut plain = Vec::new();
        for b in &wire {
            dec.decode(std::slice::from_ref(b), &mut plain).unwrap();
        }
        assert_eq!(plain, data);
    }

    #[test]
    fn test_salt_prefix_and_packet_numbers() {
        let suite = CipherSuite::Aes256Gcm;
        let key = master(suite);
        let mut enc = ChunkEncoder::new(suite, &key, false).unwrap();

        let mut wire = Vec::new();
        enc.encode(&payload(MAX_CHUNK_SIZE + 1), &mut wire).unwrap();
        assert_eq!(&wire[..32], enc.salt());
        // Two chunks, two seals each.
        assert_eq!(enc.packets_sealed(), 4);
        assert_eq!(wire.len(), 32 + 2 * (2 + 16 + 16) + MAX_CHUNK_SIZE + 1);
    }

    #[test]
    fn test_tampered_chunk_fails() {
        let suite = CipherSuite::Aes128Gcm;
        let key = master(suite);
        let mut enc = ChunkEncoder::new(suite, &key, false).unwrap();
        let mut dec = ChunkDecoder::new(suite, &key, false);

        let mut wire = Vec::new();
        enc.encode(b"attack at dawn", &mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x40;

        let mut plain = Vec::new();
        assert!(dec.decode(&wire, &mut plain).is_err());
        assert!(plain.is_empty());
    }

    #[test]
    fn test_replayed_chunk_fails() {
        let suite = CipherSuite::ChaCha20Poly1305;
        let key = master(suite);
        let mut enc = ChunkEncoder::new(suite, &key, false).unwrap();
        let mut wire = Vec::new();
        enc.encode(b"once", &mut wire).unwrap();
        let chunk = wire[suite.key_size()..].to_vec();
        wire.extend_from_slice(&chunk);

        let mut dec = ChunkDecoder::new(suite, &key, false);
        let mut plain = Vec::new();
        assert!(dec.decode(&wire, &mut plain).is_err());
        assert_eq!(plain, b"once");
    }

    #[test]
    fn test_wrong_password_fails() {
        let suite = CipherSuite::XChaCha20Poly1305;
        let mut enc = ChunkEncoder::new(suite, &master(suite), false).unwrap();
        let other = kdf::password_to_key("not-it", suite.key_size());
        let mut dec = ChunkDecoder::new(suite, &other, false);

        let mut wire = Vec::new();
        enc.encode(b"hello", &mut wire).unwrap();
        assert!(dec.decode(&wire, &mut Vec::new()).is_err());
    }

    #[test]
    fn test_finish_rejects_truncated_stream() {
        let suite = CipherSuite::Aes256Gcm;
        let key = master(suite);
        for padded in [false, true] {
            let mut enc = ChunkEncoder::new(suite, &key, padded).unwrap();
            let mut wire = Vec::new();
            enc.encode(b"complete", &mut wire).unwrap();
            let boundary = wire.len();
            enc.encode(b"cut short", &mut wire).unwrap();

            let mut dec = ChunkDecoder::new(suite, &key, padded);
            let mut plain = Vec::new();
            dec.decode(&wire[..boundary], &mut plain).unwrap();
            assert!(dec.finish().is_ok());

            dec.decode(&wire[boundary..boundary + 10], &mut plain).unwrap();
            assert_eq!(plain, b"complete");
            assert!(matches!(dec.finish(), Err(Error::InvalidMessage(_))));
        }

        // Length decoded, payload missing.
        let mut enc = ChunkEncoder::new(suite, &key, false).unwrap();
        let mut wire = Vec::new();
        enc.encode(b"payload", &mut wire).unwrap();
        let mut dec = ChunkDecoder::new(suite, &key, false);
        dec.decode(&wire[..32 + 2 + 16], &mut Vec::new()).unwrap();
        assert_eq!(dec.buffered(), 0);
        assert!(dec.finish().is_err());

        // Partial salt.
        let mut dec = ChunkDecoder::new(suite, &key, false);
        dec.decode(&wire[..5], &mut Vec::new()).unwrap();
        assert!(dec.finish().is_err());

        // Nothing at all is a clean close.
        assert!(ChunkDecoder::new(suite, &key, false).finish().is_ok());
    }

    #[test]
    fn test_master_key_length_checked() {
        assert!(ChunkEncoder::new(CipherSuite::Aes256Gcm, &[0u8; 16], false).is_err());
        let mut dec = ChunkDecoder::new(CipherSuite::Aes256Gcm, &[0u8; 16], false);
        assert!(dec.decode(&[0u8; 64], &mut Vec::new()).is_err());
    }

    #[test]
    fn test_plaintext_suite_framing() {
        let mut enc = ChunkEncoder::new(CipherSuite::Plaintext, &[], false).unwrap();
        let mut wire = Vec::new();
        enc.encode(b"abc", &mut wire).unwrap();
        assert_eq!(wire, vec![0x00, 0x03, b'a', b'b', b'c']);
    }
}
