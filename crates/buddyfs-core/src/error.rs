/// POSIX-flavored error kinds returned from filesystem operations (§7).
///
/// Each variant maps to the errno a mount adapter would surface to the
/// kernel, and to the `i16` code the wire protocol carries in `FS_RESP`/
/// `OPEN_RESP` payloads.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PosixError {
    #[error("no such file or directory")]
    Enoent,
    #[error("file exists")]
    Eexist,
    #[error("not a directory")]
    Enotdir,
    #[error("is a directory")]
    Eisdir,
    #[error("directory not empty")]
    Enotempty,
    #[error("permission denied")]
    Eacces,
    #[error("I/O error")]
    Eio,
    #[error("invalid argument")]
    Einval,
    #[error("operation timed out")]
    Etimedout,
}

impl PosixError {
    /// Stable errno-style numeric code carried on the wire.
    pub const fn errno(self) -> i16 {
        match self {
            Self::Enoent => 2,
            Self::Eio => 5,
            Self::Eacces => 13,
            Self::Eexist => 17,
            Self::Enotdir => 20,
            Self::Eisdir => 21,
            Self::Einval => 22,
            Self::Enotempty => 39,
            Self::Etimedout => 110,
        }
    }

    pub const fn from_errno(code: i16) -> Option<Self> {
        Some(match code {
            2 => Self::Enoent,
            5 => Self::Eio,
            13 => Self::Eacces,
            17 => Self::Eexist,
            20 => Self::Enotdir,
            21 => Self::Eisdir,
            22 => Self::Einval,
            39 => Self::Enotempty,
            110 => Self::Etimedout,
            _ => return None,
        })
    }
}

pub type PosixResult<T> = Result<T, PosixError>;
