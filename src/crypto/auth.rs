use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use crate::error::CryptoError;

type Result<T> = std::result::Result<T, CryptoError>;

/// Yields the next nonce (or additional data) for a sealed chunk.
pub trait BytesSource: Send {
    fn next(&mut self) -> &[u8];
}

pub struct StaticBytes(pub Vec<u8>);

impl BytesSource for StaticBytes {
    fn next(&mut self) -> &[u8] {
        &self.0
    }
}

/// Little-endian counter nonce. Seeded all-ones so the first nonce handed
/// out is all zero; both directions seed identically to stay in lockstep.
pub struct IncreasingNonce {
    nonce: [u8; 12],
}

impl IncreasingNonce {
    pub fn new() -> Self {
        Self { nonce: [0xFF; 12] }
    }
}

impl Default for IncreasingNonce {
    fn default() -> Self {
        Self::new()
    }
}

impl BytesSource for IncreasingNonce {
    fn next(&mut self) -> &[u8] {
        for b in self.nonce.iter_mut() {
            *b = b.wrapping_add(1);
            if *b != 0 {
                break;
            }
        }
        &self.nonce
    }
}

pub enum AeadCipher {
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

impl AeadCipher {
    pub fn aes_128_gcm(key: &[u8]) -> Result<Self> {
        Aes128Gcm::new_from_slice(key)
            .map(Self::Aes128Gcm)
            .map_err(|_| CryptoError::BadKey(key.len()))
    }

    pub fn aes_256_gcm(key: &[u8]) -> Result<Self> {
        Aes256Gcm::new_from_slice(key)
            .map(Self::Aes256Gcm)
            .map_err(|_| CryptoError::BadKey(key.len()))
    }

    pub fn chacha20_poly1305(key: &[u8]) -> Result<Self> {
        ChaCha20Poly1305::new_from_slice(key)
            .map(Self::ChaCha20Poly1305)
            .map_err(|_| CryptoError::BadKey(key.len()))
    }

    pub fn nonce_size(&self) -> usize {
        12
    }

    pub fn tag_size(&self) -> usize {
        16
    }

    pub fn seal(&self, nonce: &[u8], plain: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg: plain, aad };
        match self {
            Self::Aes128Gcm(c) => c.encrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            Self::Aes256Gcm(c) => c.encrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            Self::ChaCha20Poly1305(c) => {
                c.encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
            }
        }
        .map_err(|_| CryptoError::AuthenticationFailed)
    }

    pub fn open(&self, nonce: &[u8], cipher_text: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg: cipher_text, aad };
        match self {
            Self::Aes128Gcm(c) => c.decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            Self::Aes256Gcm(c) => c.decrypt(aes_gcm::Nonce::from_slice(nonce), payload),
            Self::ChaCha20Poly1305(c) => {
                c.decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
            }
        }
        .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

/// Seals and opens chunk payloads; the chunk codec stays agnostic of the
/// underlying primitive.
pub trait Authenticator: Send {
    fn overhead(&self) -> usize;
    fn seal(&mut self, plain: &[u8]) -> Result<Vec<u8>>;
    fn open(&mut self, cipher_text: &[u8]) -> Result<Vec<u8>>;
}

pub struct AeadAuthenticator {
    cipher: AeadCipher,
    nonce: Box<dyn BytesSource>,
    additional_data: Option<Box<dyn BytesSource>>,
}

impl AeadAuthenticator {
    pub fn new(cipher: AeadCipher, nonce: Box<dyn BytesSource>) -> Self {
        Self {
            cipher,
            nonce,
            additional_data: None,
        }
    }

    pub fn with_additional_data(mut self, source: Box<dyn BytesSource>) -> Self {
        self.additional_data = Some(source);
        self
    }

    fn next_nonce(&mut self) -> Result<Vec<u8>> {
        let nonce = self.nonce.next();
        if nonce.len() != self.cipher.nonce_size() {
            return Err(CryptoError::BadNonce(nonce.len()));
        }
        Ok(nonce.to_vec())
    }

    fn next_aad(&mut self) -> Vec<u8> {
        self.additional_data
            .as_mut()
            .map(|g| g.next().to_vec())
            .unwrap_or_default()
    }
}

impl Authenticator for AeadAuthenticator {
    fn overhead(&self) -> usize {
        self.cipher.tag_size()
    }

    fn seal(&mut self, plain: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        let aad = self.next_aad();
        self.cipher.seal(&nonce, plain, &aad)
    }

    fn open(&mut self, cipher_text: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        let aad = self.next_aad();
        self.cipher.open(&nonce, cipher_text, &aad)
    }
}
