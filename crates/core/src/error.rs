//! Error types for the relay server library.

/// Errors that can occur anywhere in the relay server library.
///
/// Variants map to the failure modes a session, listener or background
/// reporter can raise:
///
/// - **Transport**: [`Io`](Self::Io), [`TransportWrite`](Self::TransportWrite).
/// - **Peer protocol**: [`PeerMalformed`](Self::PeerMalformed),
///   [`VersionMismatch`](Self::VersionMismatch).
/// - **Admission**: [`PeerBanned`](Self::PeerBanned),
///   [`IdentityFailed`](Self::IdentityFailed), [`AdmissionFull`](Self::AdmissionFull).
/// - **Mod transfer**: [`TransferFailed`](Self::TransferFailed).
/// - **Directory / heartbeat**: [`DirectoryUnreachable`](Self::DirectoryUnreachable).
/// - **Configuration**: [`Config`](Self::Config).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame header or payload violated the codec's framing rules
    /// (non-positive length, oversize length, truncated body).
    #[error("malformed frame from peer: {0}")]
    PeerMalformed(String),

    /// Source address is currently serving out a rate-limiter ban.
    #[error("peer banned: {0}")]
    PeerBanned(String),

    /// The identity service rejected or could not resolve the presented key.
    #[error("identity resolution failed: {0}")]
    IdentityFailed(String),

    /// Client/server `VC` handshake reported an incompatible major version.
    #[error("version mismatch: client {client}, server {server}")]
    VersionMismatch { client: String, server: String },

    /// Registry has no free slot left for a new session.
    #[error("admission full: {0}/{1} players")]
    AdmissionFull(usize, usize),

    /// A mod-sync or split-download transfer failed or timed out.
    #[error("mod transfer failed: {0}")]
    TransferFailed(String),

    /// None of the configured mirrors accepted the heartbeat.
    #[error("directory unreachable: {0}")]
    DirectoryUnreachable(String),

    /// Write to a session's reliable or datagram transport failed.
    #[error("transport write error: {0}")]
    TransportWrite(String),

    /// Malformed configuration document.
    #[error("configuration error: {0}")]
    Config(String),

    /// Deserializing a YAML configuration document failed.
    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A call to an external HTTP service (identity, heartbeat mirror) failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// [`Server::start`](crate::server::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// An operation that requires a running server was attempted before `start`.
    #[error("server not started")]
    NotStarted,
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;
