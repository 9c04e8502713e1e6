//! AEAD cipher suite
//!
//! Each direction of a connection or session owns one [`Cipher`]: an AEAD
//! keyed by a BLAKE3-derived session subkey plus a 96-bit little-endian
//! counter nonce. The raw AES block cipher for the UDP separate header is
//! keyed by the pre-shared key directly, without derivation.

use aes::cipher::{BlockDecrypt, BlockEncrypt};
use aes::{Aes128, Aes256};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use parking_lot::Mutex;
use rand::RngCore;

use crate::config::CipherMethod;
use crate::error::{Error, Result};

/// BLAKE3 derive-key context for session subkeys.
const SUBKEY_CONTEXT: &str = "shadowsocks 2022 session subkey";

/// AEAD nonce length shared by all three constructions.
pub const NONCE_LEN: usize = 12;

/// AEAD tag length shared by all three constructions.
pub const TAG_LEN: usize = 16;

/// Generate a fresh random salt of the given length.
pub fn new_salt(len: usize) -> Vec<u8> {
    let mut salt = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// `subkey = BLAKE3-derive-key("shadowsocks 2022 session subkey",
/// key || salt)`, output length equal to the key length.
fn derive_subkey(key: &[u8], salt: &[u8]) -> Vec<u8> {
    let mut material = Vec::with_capacity(key.len() + salt.len());
    material.extend_from_slice(key);
    material.extend_from_slice(salt);

    let mut subkey = vec![0u8; key.len()];
    let mut hasher = blake3::Hasher::new_derive_key(SUBKEY_CONTEXT);
    hasher.update(&material);
    hasher.finalize_xof().fill(&mut subkey);
    subkey
}

enum AeadVariant {
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

impl AeadVariant {
    fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        match self {
            AeadVariant::Aes128Gcm(c) => c.encrypt(nonce, plaintext),
            AeadVariant::Aes256Gcm(c) => c.encrypt(nonce, plaintext),
            AeadVariant::ChaCha20Poly1305(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|_| Error::AeadSealFailed)
    }

    fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = GenericArray::from_slice(nonce);
        match self {
            AeadVariant::Aes128Gcm(c) => c.decrypt(nonce, ciphertext),
            AeadVariant::Aes256Gcm(c) => c.decrypt(nonce, ciphertext),
            AeadVariant::ChaCha20Poly1305(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| Error::AeadOpenFailed)
    }
}

/// One direction's cipher context: derived subkey, AEAD, counter nonce.
///
/// The counter is mutex-guarded although each context is used from a single
/// direction only.
pub struct Cipher {
    aead: AeadVariant,
    counter: Mutex<[u8; NONCE_LEN]>,
    key: Vec<u8>,
    salt: Vec<u8>,
    method: CipherMethod,
}

impl Cipher {
    /// Build a context from the pre-shared key and a salt.
    pub fn new(key: &[u8], salt: &[u8], method: CipherMethod) -> Result<Self> {
        let expected = method.key_len();
        if key.len() != expected {
            return Err(Error::InvalidKeySize {
                expected,
                got: key.len(),
            });
        }

        let subkey = derive_subkey(key, salt);
        let aead = match method {
            CipherMethod::Aes128Gcm => {
                AeadVariant::Aes128Gcm(Aes128Gcm::new(GenericArray::from_slice(&subkey)))
            }
            CipherMethod::Aes256Gcm => {
                AeadVariant::Aes256Gcm(Aes256Gcm::new(GenericArray::from_slice(&subkey)))
            }
            CipherMethod::Chacha20Poly1305 => {
                AeadVariant::ChaCha20Poly1305(ChaCha20Poly1305::new(GenericArray::from_slice(
                    &subkey,
                )))
            }
        };

        Ok(Self {
            aead,
            counter: Mutex::new([0u8; NONCE_LEN]),
            key: key.to_vec(),
            salt: salt.to_vec(),
            method,
        })
    }

    /// A new context with the same key and method, a freshly derived subkey
    /// and a zeroed counter.
    pub fn renew(&self, salt: &[u8]) -> Result<Cipher> {
        Cipher::new(&self.key, salt, self.method)
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Ciphertext expansion per sealed chunk.
    pub fn overhead(&self) -> usize {
        TAG_LEN
    }

    /// Snapshot of the current counter nonce.
    pub fn nonce(&self) -> [u8; NONCE_LEN] {
        *self.counter.lock()
    }

    /// Seal with the current counter nonce, then advance the counter.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut counter = self.counter.lock();
        let nonce = *counter;
        let ciphertext = self.aead.seal(&nonce, plaintext)?;
        increment_le(&mut counter);
        Ok(ciphertext)
    }

    /// Seal and append to `out`. The client stream handshake seals several
    /// consecutive chunks into one record.
    pub fn seal_into(&self, out: &mut Vec<u8>, plaintext: &[u8]) -> Result<()> {
        let sealed = self.seal(plaintext)?;
        out.extend_from_slice(&sealed);
        Ok(())
    }

    /// Open with the current counter nonce, advancing it only on success.
    /// A failed open leaves the context unusable; callers drop it.
    pub fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut counter = self.counter.lock();
        let nonce = *counter;
        let plaintext = self.aead.open(&nonce, ciphertext)?;
        increment_le(&mut counter);
        Ok(plaintext)
    }

    /// Seal with an explicit nonce (UDP separate-header scheme). The
    /// counter still advances afterwards; the UDP path derives packet
    /// nonces from the header, so the advance only feeds the next packet
    /// counter.
    pub fn seal_with_nonce(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = self.aead.seal(nonce, plaintext)?;
        increment_le(&mut self.counter.lock());
        Ok(ciphertext)
    }

    /// Open with an explicit nonce, advancing the counter on success.
    pub fn open_with_nonce(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plaintext = self.aead.open(nonce, ciphertext)?;
        increment_le(&mut self.counter.lock());
        Ok(plaintext)
    }
}

/// Little-endian increment: byte 0 first, carry upward, wrapping.
fn increment_le(counter: &mut [u8; NONCE_LEN]) {
    for byte in counter.iter_mut() {
        let (next, overflow) = byte.overflowing_add(1);
        *byte = next;
        if !overflow {
            break;
        }
    }
}

/// Raw AES block cipher for the UDP separate header, keyed by the
/// pre-shared key (16 bytes selects AES-128, 32 bytes AES-256).
pub enum BlockCipher {
    Aes128(Aes128),
    Aes256(Aes256),
}

impl BlockCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Ok(BlockCipher::Aes128(Aes128::new(GenericArray::from_slice(
                key,
            )))),
            32 => Ok(BlockCipher::Aes256(Aes256::new(GenericArray::from_slice(
                key,
            )))),
            got => Err(Error::InvalidKeySize { expected: 32, got }),
        }
    }

    pub fn encrypt_block(&self, block: &mut [u8; 16]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            BlockCipher::Aes128(c) => c.encrypt_block(block),
            BlockCipher::Aes256(c) => c.encrypt_block(block),
        }
    }

    pub fn decrypt_block(&self, block: &mut [u8; 16]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            BlockCipher::Aes128(c) => c.decrypt_block(block),
            BlockCipher::Aes256(c) => c.decrypt_block(block),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use rand::RngCore;

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }

    fn pair(method: CipherMethod) -> (Cipher, Cipher) {
        let key = random_bytes(method.key_len());
        let salt = random_bytes(method.key_len());
        (
            Cipher::new(&key, &salt, method).unwrap(),
            Cipher::new(&key, &salt, method).unwrap(),
        )
    }

    #[test]
    fn test_subkey_known_answer() {
        let key = BASE64
            .decode("Lc3tTx0BY6ZJ/fCwOx3JvF0I/anhwJBO5p2+FA5Vce4=")
            .unwrap();
        let salt = BASE64
            .decode("3oFO0VyLyGI4nFN0M9P+62vPND/L6v8IingaPJWTbJA=")
            .unwrap();
        let subkey = derive_subkey(&key, &salt);
        assert_eq!(
            BASE64.encode(&subkey),
            "EdNE+4U8dVnHT0+poAFDK2bdlwfrHT61sUNr9WYPh+E="
        );
    }

    #[test]
    fn test_seal_open_1000() {
        for method in [
            CipherMethod::Aes128Gcm,
            CipherMethod::Aes256Gcm,
            CipherMethod::Chacha20Poly1305,
        ] {
            let (enc, dec) = pair(method);
            for _ in 0..1000 {
                let data = random_bytes(1000);
                let sealed = enc.seal(&data).unwrap();
                assert_eq!(sealed.len(), data.len() + TAG_LEN);
                let opened = dec.open(&sealed).unwrap();
                assert_eq!(opened, data);
            }
        }
    }

    #[test]
    fn test_nonce_monotonic() {
        let (enc, _) = pair(CipherMethod::Aes256Gcm);
        for _ in 0..300 {
            enc.seal(b"x").unwrap();
        }
        // 300 = 0x012c, little-endian
        let mut expected = [0u8; NONCE_LEN];
        expected[0] = 0x2c;
        expected[1] = 0x01;
        assert_eq!(enc.nonce(), expected);
    }

    #[test]
    fn test_counter_desync_detected() {
        let (enc, dec) = pair(CipherMethod::Aes256Gcm);
        // Encrypt side advances one extra time
        enc.seal(b"skipped").unwrap();
        let sealed = enc.seal(b"payload").unwrap();
        assert!(matches!(dec.open(&sealed), Err(Error::AeadOpenFailed)));
        // A failed open does not advance the counter
        assert_eq!(dec.nonce(), [0u8; NONCE_LEN]);
    }

    #[test]
    fn test_seal_with_nonce_advances_counter() {
        let (enc, _) = pair(CipherMethod::Aes256Gcm);
        let nonce = [7u8; NONCE_LEN];
        enc.seal_with_nonce(&nonce, b"datagram").unwrap();
        let mut expected = [0u8; NONCE_LEN];
        expected[0] = 1;
        assert_eq!(enc.nonce(), expected);
    }

    #[test]
    fn test_explicit_nonce_roundtrip() {
        let (enc, dec) = pair(CipherMethod::Chacha20Poly1305);
        let nonce = [0x42u8; NONCE_LEN];
        let sealed = enc.seal_with_nonce(&nonce, b"hello").unwrap();
        assert_eq!(dec.open_with_nonce(&nonce, &sealed).unwrap(), b"hello");
    }

    #[test]
    fn test_renew_resets_counter_and_subkey() {
        let key = random_bytes(32);
        let salt = random_bytes(32);
        let enc = Cipher::new(&key, &salt, CipherMethod::Aes256Gcm).unwrap();
        enc.seal(b"advance").unwrap();

        let fresh_salt = random_bytes(32);
        let renewed = enc.renew(&fresh_salt).unwrap();
        assert_eq!(renewed.nonce(), [0u8; NONCE_LEN]);
        assert_eq!(renewed.salt(), &fresh_salt[..]);

        let peer = Cipher::new(&key, &fresh_salt, CipherMethod::Aes256Gcm).unwrap();
        let sealed = renewed.seal(b"renewed").unwrap();
        assert_eq!(peer.open(&sealed).unwrap(), b"renewed");
    }

    #[test]
    fn test_invalid_key_size() {
        let err = Cipher::new(&[0u8; 16], &[0u8; 16], CipherMethod::Aes256Gcm);
        assert!(matches!(err, Err(Error::InvalidKeySize { .. })));
        let err = Cipher::new(&[0u8; 32], &[0u8; 32], CipherMethod::Aes128Gcm);
        assert!(matches!(err, Err(Error::InvalidKeySize { .. })));
        assert!(matches!(
            BlockCipher::new(&[0u8; 24]),
            Err(Error::InvalidKeySize { .. })
        ));
    }

    #[test]
    fn test_block_cipher_roundtrip() {
        for key_len in [16usize, 32] {
            let key = random_bytes(key_len);
            let block_cipher = BlockCipher::new(&key).unwrap();
            let mut block = [0u8; 16];
            block.copy_from_slice(&random_bytes(16));
            let original = block;
            block_cipher.encrypt_block(&mut block);
            assert_ne!(block, original);
            block_cipher.decrypt_block(&mut block);
            assert_eq!(block, original);
        }
    }

    #[test]
    fn test_increment_carry() {
        let mut counter = [0xFF, 0xFF, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        increment_le(&mut counter);
        assert_eq!(&counter[..3], &[0x00, 0x00, 0x01]);

        let mut wrapped = [0xFFu8; NONCE_LEN];
        increment_le(&mut wrapped);
        assert_eq!(wrapped, [0u8; NONCE_LEN]);
    }
}
