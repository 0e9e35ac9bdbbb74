//! Error reporting for mpool
//!
//! Every fallible operation returns [`Result`]. An [`Error`] carries the
//! failure kind, the source location where it was raised, the equivalent
//! backend errno, and (for *overflow*) the buffer length the caller needs.
//! [`Error::code`] packs kind, line, and errno into the opaque 64-bit value
//! used across the library boundary; zero at that boundary means success.

use std::fmt;
use std::io;
use std::panic::Location;

/// Common result type for mpool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    /// Malformed inputs, misaligned offsets, wrong object kind
    InvalidArgument = 1,
    /// Unknown object ID or map index
    NotFound = 2,
    /// ID collision on allocate
    AlreadyExists = 3,
    /// Backend capacity exhausted
    NoSpace = 4,
    /// Exclusive/shared conflict, delete-while-mapped, outstanding refs
    Busy = 5,
    /// Caller buffer too small on read
    Overflow = 6,
    /// Read beyond object end
    OutOfRange = 7,
    /// Recovery invariant violated
    Corrupt = 8,
    /// Backend reported errno
    Io = 9,
    /// Operation illegal in the current lifecycle state
    InvalidState = 10,
}

impl ErrorKind {
    /// Equivalent errno for this kind
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument => libc::EINVAL,
            Self::NotFound => libc::ENOENT,
            Self::AlreadyExists => libc::EEXIST,
            Self::NoSpace => libc::ENOSPC,
            Self::Busy => libc::EBUSY,
            Self::Overflow => libc::EOVERFLOW,
            Self::OutOfRange => libc::ERANGE,
            Self::Corrupt => libc::EBADMSG,
            Self::Io => libc::EIO,
            Self::InvalidState => libc::EPROTO,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid-argument",
            Self::NotFound => "not-found",
            Self::AlreadyExists => "already-exists",
            Self::NoSpace => "no-space",
            Self::Busy => "busy",
            Self::Overflow => "overflow",
            Self::OutOfRange => "out-of-range",
            Self::Corrupt => "corrupt",
            Self::Io => "io",
            Self::InvalidState => "invalid-state",
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::InvalidArgument),
            2 => Some(Self::NotFound),
            3 => Some(Self::AlreadyExists),
            4 => Some(Self::NoSpace),
            5 => Some(Self::Busy),
            6 => Some(Self::Overflow),
            7 => Some(Self::OutOfRange),
            8 => Some(Self::Corrupt),
            9 => Some(Self::Io),
            10 => Some(Self::InvalidState),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An mpool failure: kind + origin + backend errno
#[derive(Debug, thiserror::Error)]
#[error("{}", self.render())]
pub struct Error {
    kind: ErrorKind,
    errno: i32,
    file: &'static str,
    line: u32,
    /// Kind-specific payload; for [`ErrorKind::Overflow`] the required length
    aux: u64,
    detail: Option<Box<str>>,
}

impl Error {
    /// Create an error of the given kind at the caller's source location
    #[track_caller]
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        let loc = Location::caller();
        Self {
            kind,
            errno: kind.errno(),
            file: loc.file(),
            line: loc.line(),
            aux: 0,
            detail: None,
        }
    }

    /// Create an error with a human-readable detail message
    #[track_caller]
    #[must_use]
    pub fn with_detail(kind: ErrorKind, detail: impl fmt::Display) -> Self {
        let loc = Location::caller();
        Self {
            kind,
            errno: kind.errno(),
            file: loc.file(),
            line: loc.line(),
            aux: 0,
            detail: Some(detail.to_string().into_boxed_str()),
        }
    }

    /// Short-buffer failure carrying the length the caller must supply
    #[track_caller]
    #[must_use]
    pub fn overflow(need: u64) -> Self {
        let loc = Location::caller();
        Self {
            kind: ErrorKind::Overflow,
            errno: ErrorKind::Overflow.errno(),
            file: loc.file(),
            line: loc.line(),
            aux: need,
            detail: None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Equivalent backend errno
    #[must_use]
    pub fn errno(&self) -> i32 {
        self.errno
    }

    /// Required buffer length, present on [`ErrorKind::Overflow`] only
    #[must_use]
    pub fn required_len(&self) -> Option<u64> {
        (self.kind == ErrorKind::Overflow).then_some(self.aux)
    }

    /// Source file that raised the error
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.file
    }

    /// Source line that raised the error
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Pack kind, line, and errno into the opaque 64-bit boundary code.
    ///
    /// Layout: `[63:48]` line, `[47:40]` kind, `[39:32]` reserved,
    /// `[31:0]` errno. Kinds start at 1, so the code is never zero.
    #[must_use]
    pub fn code(&self) -> u64 {
        (u64::from(self.line as u16) << 48)
            | (u64::from(self.kind as u8) << 40)
            | u64::from(self.errno as u32)
    }

    /// Render kind, origin, detail, and errno text
    #[must_use]
    pub fn render(&self) -> String {
        let errtext = io::Error::from_raw_os_error(self.errno);
        match &self.detail {
            Some(d) => format!(
                "{} at {}:{}: {d}: {errtext}",
                self.kind, self.file, self.line
            ),
            None => format!("{} at {}:{}: {errtext}", self.kind, self.file, self.line),
        }
    }
}

impl From<io::Error> for Error {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        let loc = Location::caller();
        let errno = err.raw_os_error().unwrap_or(libc::EIO);
        Self {
            kind: ErrorKind::Io,
            errno,
            file: loc.file(),
            line: loc.line(),
            aux: 0,
            detail: Some(err.to_string().into_boxed_str()),
        }
    }
}

/// Extract the backend errno from a packed boundary code; 0 for success
#[must_use]
pub fn errno_from_code(code: u64) -> i32 {
    if code == 0 { 0 } else { (code & 0xffff_ffff) as u32 as i32 }
}

/// Extract the failure kind from a packed boundary code; `None` for success
#[must_use]
pub fn kind_from_code(code: u64) -> Option<ErrorKind> {
    if code == 0 {
        return None;
    }
    ErrorKind::from_u8(((code >> 40) & 0xff) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_errno_mapping() {
        assert_eq!(ErrorKind::NotFound.errno(), libc::ENOENT);
        assert_eq!(ErrorKind::Busy.errno(), libc::EBUSY);
        assert_eq!(ErrorKind::Overflow.errno(), libc::EOVERFLOW);
    }

    #[test]
    fn code_roundtrip() {
        let err = Error::new(ErrorKind::NoSpace);
        let code = err.code();
        assert_ne!(code, 0);
        assert_eq!(errno_from_code(code), libc::ENOSPC);
        assert_eq!(kind_from_code(code), Some(ErrorKind::NoSpace));
        assert_eq!(errno_from_code(0), 0);
        assert_eq!(kind_from_code(0), None);
    }

    #[test]
    fn overflow_carries_required_len() {
        let err = Error::overflow(4096);
        assert_eq!(err.kind(), ErrorKind::Overflow);
        assert_eq!(err.required_len(), Some(4096));
        assert_eq!(Error::new(ErrorKind::Io).required_len(), None);
    }

    #[test]
    fn render_names_origin() {
        let err = Error::with_detail(ErrorKind::Corrupt, "mlog pair disagrees");
        let text = err.to_string();
        assert!(text.contains("corrupt"));
        assert!(text.contains("error.rs"));
        assert!(text.contains("mlog pair disagrees"));
    }

    #[test]
    fn io_error_preserves_errno() {
        let err: Error = io::Error::from_raw_os_error(libc::EACCES).into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.errno(), libc::EACCES);
    }
}
