//! Encryption pipes. Two distinct primitives, matching the two distinct
//! jobs described in the component design: ChaCha20-Poly1305 is an
//! all-at-once AEAD used for the small, buffer-friendly catalogue and
//! snapshot bodies; XChaCha20 is a true streaming cipher used for content
//! files, where integrity comes from the embedded (keyed) checksum
//! instead of an authentication tag.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::XChaCha20;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{KeyInit, XChaCha20Poly1305, XNonce};

use super::{Sink, Source};
use crate::error::{ArchivariusError, Result};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

/// Derives the 32-byte archive key from a user password. No stretching
/// beyond one BLAKE2b-256 pass, matching the source archive's KDF.
pub fn derive_key(password: &str) -> [u8; KEY_LEN] {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(password.as_bytes());
    let out = hasher.finalize();
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&out);
    key
}

/// Buffers all plaintext pumped in; on `finish`, encrypts the whole blob
/// and writes ciphertext+tag to `next` (the nonce itself is persisted
/// separately, in the catalogue/snapshot header).
pub struct ChaPolyEncryptSink {
    key: [u8; KEY_LEN],
    nonce: [u8; NONCE_LEN],
    buffer: Vec<u8>,
    next: Box<dyn Sink>,
}

impl ChaPolyEncryptSink {
    pub fn new(next: Box<dyn Sink>, key: [u8; KEY_LEN], nonce: [u8; NONCE_LEN]) -> Self {
        ChaPolyEncryptSink {
            key,
            nonce,
            buffer: Vec::new(),
            next,
        }
    }
}

impl Sink for ChaPolyEncryptSink {
    fn pump(&mut self, buf: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(buf);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let cipher = XChaCha20Poly1305::new((&self.key).into());
        let nonce = XNonce::from_slice(&self.nonce);
        let ciphertext = cipher
            .encrypt(nonce, self.buffer.as_slice())
            .map_err(|_| ArchivariusError::WrongPassword)?;
        self.next.pump(&ciphertext)?;
        self.next.finish()
    }
}

/// Reads every remaining byte from `next`, verifies the AEAD tag, and
/// serves the plaintext out of an in-memory buffer.
pub struct ChaPolyDecryptSource {
    plaintext: Vec<u8>,
    pos: usize,
}

impl ChaPolyDecryptSource {
    pub fn new(mut next: Box<dyn Source>, key: [u8; KEY_LEN], nonce: [u8; NONCE_LEN]) -> Result<Self> {
        let ciphertext = next.read_to_end()?;
        let cipher = XChaCha20Poly1305::new((&key).into());
        let nonce = XNonce::from_slice(&nonce);
        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_slice())
            .map_err(|_| ArchivariusError::WrongPassword)?;
        Ok(ChaPolyDecryptSource { plaintext, pos: 0 })
    }
}

impl Source for ChaPolyDecryptSource {
    fn pump(&mut self, buf: &mut [u8]) -> Result<(usize, bool)> {
        let remaining = &self.plaintext[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok((n, self.pos == self.plaintext.len()))
    }
}

/// True streaming XChaCha20: no buffering, no tag. Used for content
/// files, where a keyed BLAKE2b-512 checksum (see
/// [`crate::pipes::checksum::Checksummer::blake2b512_keyed`]) stands in
/// for authentication.
pub struct XChaChaSink {
    cipher: XChaCha20,
    next: Box<dyn Sink>,
    scratch: Vec<u8>,
}

impl XChaChaSink {
    pub fn new(next: Box<dyn Sink>, key: [u8; KEY_LEN], nonce: [u8; NONCE_LEN]) -> Self {
        let cipher = XChaCha20::new((&key).into(), (&nonce).into());
        XChaChaSink {
            cipher,
            next,
            scratch: Vec::new(),
        }
    }
}

impl Sink for XChaChaSink {
    fn pump(&mut self, buf: &[u8]) -> Result<()> {
        self.scratch.clear();
        self.scratch.extend_from_slice(buf);
        self.cipher.apply_keystream(&mut self.scratch);
        self.next.pump(&self.scratch)
    }

    fn finish(&mut self) -> Result<()> {
        self.next.finish()
    }
}

pub struct XChaChaSource {
    cipher: XChaCha20,
    next: Box<dyn Source>,
}

impl XChaChaSource {
    pub fn new(next: Box<dyn Source>, key: [u8; KEY_LEN], nonce: [u8; NONCE_LEN]) -> Self {
        let cipher = XChaCha20::new((&key).into(), (&nonce).into());
        XChaChaSource { cipher, next }
    }
}

impl Source for XChaChaSource {
    fn pump(&mut self, buf: &mut [u8]) -> Result<(usize, bool)> {
        let (n, eof) = self.next.pump(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        Ok((n, eof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipes::{FileSink, FileSource};

    #[test]
    fn xchacha_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let key = derive_key("hunter2");
        let nonce = [3u8; NONCE_LEN];
        {
            let file_sink = FileSink::create(&path).unwrap();
            let mut enc = XChaChaSink::new(Box::new(file_sink), key, nonce);
            enc.pump(b"plaintext bytes").unwrap();
            enc.finish().unwrap();
        }
        let file_source = FileSource::open(&path).unwrap();
        let mut dec = XChaChaSource::new(Box::new(file_source), key, nonce);
        let data = dec.read_to_end().unwrap();
        assert_eq!(&data, b"plaintext bytes");
    }

    #[derive(Clone, Default)]
    struct SharedBuf(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);
    impl Sink for SharedBuf {
        fn pump(&mut self, b: &[u8]) -> Result<()> {
            self.0.borrow_mut().extend_from_slice(b);
            Ok(())
        }
        fn finish(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct VecSource(Vec<u8>, usize);
    impl Source for VecSource {
        fn pump(&mut self, buf: &mut [u8]) -> Result<(usize, bool)> {
            let remaining = &self.0[self.1..];
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.1 += n;
            Ok((n, self.1 == self.0.len()))
        }
    }

    #[test]
    fn chapoly_roundtrip() {
        let key = derive_key("hunter2");
        let nonce = [9u8; NONCE_LEN];
        let shared = SharedBuf::default();
        {
            let mut enc = ChaPolyEncryptSink::new(Box::new(shared.clone()), key, nonce);
            enc.pump(b"catalogue body bytes").unwrap();
            enc.finish().unwrap();
        }
        let ciphertext = shared.0.borrow().clone();

        let src = VecSource(ciphertext, 0);
        let dec = ChaPolyDecryptSource::new(Box::new(src), key, nonce).unwrap();
        assert_eq!(&dec.plaintext, b"catalogue body bytes");
    }

    #[test]
    fn chapoly_wrong_key_fails() {
        let key = derive_key("hunter2");
        let wrong_key = derive_key("not-hunter2");
        let nonce = [9u8; NONCE_LEN];
        let shared = SharedBuf::default();
        {
            let mut enc = ChaPolyEncryptSink::new(Box::new(shared.clone()), key, nonce);
            enc.pump(b"secret").unwrap();
            enc.finish().unwrap();
        }
        let ciphertext = shared.0.borrow().clone();

        let src = VecSource(ciphertext, 0);
        assert!(ChaPolyDecryptSource::new(Box::new(src), wrong_key, nonce).is_err());
    }
}
