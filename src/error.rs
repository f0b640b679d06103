use fast_socks5::SocksError;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid AEAD nonce size `{0}`")]
    BadNonce(usize),
    #[error("invalid key size `{0}`")]
    BadKey(usize),
    #[error("authentication failed")]
    AuthenticationFailed,
}

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown session status `{0}`")]
    UnknownStatus(u8),
    #[error("unknown network `{0}`")]
    UnknownNetwork(u8),
    #[error("invalid address type `{0}`")]
    InvalidAddressType(u8),
    #[error("truncated frame metadata")]
    TruncatedMetadata,
}

#[derive(Debug, Error)]
pub enum ShadowsocksError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("invalid address type `{0}`")]
    InvalidAddressType(u8),
    #[error("invalid OTA")]
    InvalidOta,
    #[error("rejecting connection with OTA enabled, while server disables OTA")]
    OtaForbidden,
    #[error("rejecting connection with OTA disabled, while server enables OTA")]
    OtaRequired,
    #[error("request without a remote address")]
    MissingAddress,
}

#[derive(Debug, Error)]
pub enum PolyrayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SOCKS error: {0}")]
    Socks(#[from] SocksError),
    #[error("mux error: {0}")]
    Mux(#[from] MuxError),
    #[error("shadowsocks error: {0}")]
    Shadowsocks(#[from] ShadowsocksError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("feature `{0}` is not registered")]
    FeatureNotSet(&'static str),
    #[error("missing required feature `{0}`")]
    MissingFeature(&'static str),
    #[error("unknown config type `{0}`")]
    UnknownConfigType(String),
    #[error("handler not found: `{0}`")]
    HandlerNotFound(String),
    #[error("duplicate handler tag `{0}`")]
    DuplicateTag(String),
    #[error("invalid mux concurrency `{0}`")]
    InvalidConcurrency(u32),
    #[error("no outbound handler available")]
    NoOutbound,
    #[error("no target for this connection")]
    NoTarget,
    #[error("network `{0}` not supported")]
    UnsupportedNetwork(crate::net::Network),
    #[error("instance is closed")]
    Closed,
    #[error("Thread error: {0}")]
    Thread(#[from] JoinError),
    #[error("Timed out")]
    Timeout,
    #[error("Failed to connect")]
    Connection,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PolyrayError {
    /// True when the error is plain end-of-stream rather than a failure.
    pub fn is_eof(&self) -> bool {
        match self {
            PolyrayError::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}
