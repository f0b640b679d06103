use std::io;
use bytes::BytesMut;
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncWrite};
use crate::buffer::{IoReader, IoWriter, Reader, TransferType, Writer};
use crate::crypto::auth::{AeadAuthenticator, AeadCipher, IncreasingNonce};
use crate::crypto::chunk::{AuthenticationReader, AuthenticationWriter, PlainChunkSizeParser};
use crate::error::ShadowsocksError;

const SUBKEY_INFO: &[u8] = b"ss-subkey";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    /// Plaintext carrier. The only non-AEAD variant, used where one-time
    /// authentication provides the integrity layer.
    None,
}

impl CipherKind {
    pub fn key_size(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
            CipherKind::ChaCha20Poly1305 => 32,
            CipherKind::None => 16,
        }
    }

    pub fn iv_size(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
            CipherKind::ChaCha20Poly1305 => 32,
            CipherKind::None => 0,
        }
    }

    pub fn is_aead(&self) -> bool {
        !matches!(self, CipherKind::None)
    }

    /// Session subkey per SIP004: `HKDF-SHA1(key, salt, "ss-subkey")`.
    fn session_cipher(&self, key: &[u8], salt: &[u8]) -> io::Result<AeadCipher> {
        let hk = Hkdf::<Sha1>::new(Some(salt), key);
        let mut subkey = vec![0u8; self.key_size()];
        hk.expand(SUBKEY_INFO, &mut subkey)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad subkey length"))?;

        let cipher = match self {
            CipherKind::Aes128Gcm => AeadCipher::aes_128_gcm(&subkey),
            CipherKind::Aes256Gcm => AeadCipher::aes_256_gcm(&subkey),
            CipherKind::ChaCha20Poly1305 => AeadCipher::chacha20_poly1305(&subkey),
            CipherKind::None => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "not an AEAD cipher"))
            }
        };
        cipher.map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    pub fn new_encryption_writer(
        &self,
        key: &[u8],
        iv: &[u8],
        writer: impl AsyncWrite + Unpin + Send + 'static,
    ) -> io::Result<Box<dyn Writer>> {
        if !self.is_aead() {
            return Ok(Box::new(IoWriter::new(writer)));
        }
        let auth = AeadAuthenticator::new(
            self.session_cipher(key, iv)?,
            Box::new(IncreasingNonce::new()),
        );
        Ok(Box::new(AuthenticationWriter::new(
            Box::new(auth),
            PlainChunkSizeParser,
            writer,
            TransferType::Stream,
        )))
    }

    pub fn new_decryption_reader(
        &self,
        key: &[u8],
        iv: &[u8],
        reader: impl AsyncRead + Unpin + Send + 'static,
    ) -> io::Result<Box<dyn Reader>> {
        if !self.is_aead() {
            return Ok(Box::new(IoReader::new(reader)));
        }
        let auth = AeadAuthenticator::new(
            self.session_cipher(key, iv)?,
            Box::new(IncreasingNonce::new()),
        );
        Ok(Box::new(AuthenticationReader::new(
            Box::new(auth),
            PlainChunkSizeParser,
            reader,
        )))
    }

    /// Encrypts a UDP packet in place. The buffer must start with the IV
    /// for AEAD variants; the remainder is sealed with a zero nonce.
    pub fn encode_packet(&self, key: &[u8], buf: &mut BytesMut) -> Result<(), ShadowsocksError> {
        if !self.is_aead() {
            return Ok(());
        }
        let iv_len = self.iv_size();
        if buf.len() < iv_len {
            return Err(ShadowsocksError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        let cipher = self.session_cipher(key, &buf[..iv_len])?;
        let sealed = cipher
            .seal(&[0u8; 12], &buf[iv_len..], &[])
            .map_err(ShadowsocksError::Crypto)?;
        buf.truncate(iv_len);
        buf.extend_from_slice(&sealed);
        Ok(())
    }

    /// Decrypts a UDP packet in place, stripping the IV for AEAD variants.
    pub fn decode_packet(&self, key: &[u8], buf: &mut BytesMut) -> Result<(), ShadowsocksError> {
        if !self.is_aead() {
            return Ok(());
        }
        let iv_len = self.iv_size();
        if buf.len() < iv_len {
            return Err(ShadowsocksError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        let cipher = self.session_cipher(key, &buf[..iv_len])?;
        let plain = cipher
            .open(&[0u8; 12], &buf[iv_len..], &[])
            .map_err(ShadowsocksError::Crypto)?;
        buf.clear();
        buf.extend_from_slice(&plain);
        Ok(())
    }
}

/// OpenSSL `EVP_BytesToKey` with MD5, the historical shadowsocks
/// password-to-key derivation.
pub fn password_to_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut h = Md5::new();
        h.update(&prev);
        h.update(password.as_bytes());
        prev = h.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}
