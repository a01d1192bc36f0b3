use std::io;

use thiserror::Error;

/// Specialized [`Result`] type for decoding and reading RAR archives.
pub type RarResult<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
/// A fatal error that may occur while decoding or reading a RAR archive.
pub enum Error {
    /// The stream did not start with the RAR15 signature.
    #[error("not a RAR archive")]
    NotRarFile,

    /// Tried to read after the end of the stream while decoding.
    #[error("expected more data")]
    UnexpectedEof,

    /// A block header reported a size equal to 0 or exceeding the EOF.
    #[error("header reported sizes are 0 or exceed the EOF")]
    CorruptHeader,

    /// A volume referenced by the archive (continuation, or next volume in
    /// sequence) could not be named or does not exist.
    #[error("cannot locate volume: {0}")]
    BadVolumeName(String),

    /// No entry with the given name exists in the archive.
    #[error("no such entry in archive: {0:?}")]
    NoSuchEntry(String),

    /// `read_partial` was called against a non-store-method entry.
    #[error("entry {0:?} is compressed, partial reads require the store method")]
    NotStoreMethod(String),

    /// The CRC32 of data read back from the archive did not match the
    /// entry's recorded CRC32.
    #[error("CRC check failed for entry {0:?}")]
    CrcMismatch(String),

    /// The external extractor exited with a non-zero status.
    #[error("extractor exited with status {0}")]
    ExtractorFailed(i32),

    /// The filesystem surface refused a mutating operation (§4.4, §7).
    #[error("read-only filesystem")]
    ReadOnly,

    /// An extraction-cache read landed past the currently materialized
    /// extent of a compressed entry; the caller should retry (§4.3, §7).
    #[error("data not yet available, try again")]
    TryAgain,

    /// A partial read of a non-store entry was requested without the
    /// extraction cache enabled (§4.4, §7).
    #[error("compressed entries require the extraction cache")]
    NotSupported,

    /// Unknown I/O error.
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::UnexpectedEof => Self::UnexpectedEof,
            io::ErrorKind::NotFound => Self::NoSuchEntry(String::new()),
            _ => Self::Io(value),
        }
    }
}

impl Error {
    /// Map this error onto the `errno` taxonomy the FS boundary returns
    /// (§7).
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Error::NoSuchEntry(_) => libc::ENOENT,
            Error::ReadOnly => libc::EROFS,
            Error::TryAgain => libc::EAGAIN,
            Error::NotSupported => libc::ENOSYS,
            Error::CrcMismatch(_)
            | Error::ExtractorFailed(_)
            | Error::CorruptHeader
            | Error::UnexpectedEof
            | Error::NotRarFile
            | Error::BadVolumeName(_) => libc::EIO,
            Error::NotStoreMethod(_) => libc::ENOSYS,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
