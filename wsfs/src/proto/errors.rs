use thiserror::Error;

/// Faults in the framing of a single message. Unlike engine failures these
/// leave the connection desynchronized.
#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("message truncated: needed {needed} more bytes, {remaining} left")]
    TruncatedMessage { needed: usize, remaining: usize },

    #[error("packet writer used after finalize")]
    UseAfterFinalize,

    #[error("buffer of {0} bytes exceeds the 65535 byte field limit")]
    BufferTooLarge(usize),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown setattr field tag {0}")]
    UnknownSetattrTag(u8),

    #[error("fixed block codec failed: {0}")]
    Deku(#[from] deku::DekuError),
}

pub type ProtoResult<T> = Result<T, ProtoError>;
