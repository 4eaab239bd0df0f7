use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("no such entry")]
    NoSuchEntry,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("not a symbolic link")]
    NotASymlink,
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("no such attribute")]
    NoSuchAttribute,
    #[error("operation not supported")]
    Unsupported,
    #[error("result out of range")]
    OutOfRange,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("name too long")]
    NameTooLong,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("file too large")]
    FileTooLarge,
    #[error("too many links")]
    TooManyLinks,
    #[error("stored record is corrupt")]
    InvalidData,
    #[error("store failure")]
    StoreFailure,
}

impl FsError {
    pub fn to_errno(self) -> i32 {
        match self {
            FsError::NoSuchEntry => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NotASymlink | FsError::InvalidArgument => libc::EINVAL,
            FsError::BadDescriptor => libc::EBADF,
            FsError::NoSuchAttribute => libc::ENODATA,
            FsError::Unsupported => libc::EOPNOTSUPP,
            FsError::OutOfRange => libc::ERANGE,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::NotPermitted => libc::EPERM,
            FsError::FileTooLarge => libc::EFBIG,
            FsError::TooManyLinks => libc::EMLINK,
            FsError::InvalidData | FsError::StoreFailure => libc::EIO,
        }
    }
}

impl From<crate::db::StoreError> for FsError {
    fn from(e: crate::db::StoreError) -> Self {
        tracing::error!("store operation failed: {}", e);
        FsError::StoreFailure
    }
}
