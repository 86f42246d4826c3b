use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to connect to NSP: {0}")]
    ConnectionFailed(String),

    #[error("clock has no offset estimate yet; at least one monitor sample is required")]
    ClockUnsynchronized,

    #[error("unknown sample group: {0}")]
    UnknownGroup(u8),
}

pub type Result<T> = std::result::Result<T, SourceError>;
