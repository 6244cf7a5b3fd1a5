use thiserror::Error;

/// Errors surfaced across the core crate boundary.
///
/// Dimension and store constructors fail with [`EtlError::Configuration`];
/// everything below the driver (store I/O, database errors, wire protocol
/// errors) is folded into [`EtlError::Other`] via `anyhow`.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("write attempted on a readonly store")]
    ReadonlyViolation,

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("key server I/O error: {0}")]
    KeyServer(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EtlError>;
