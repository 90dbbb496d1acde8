//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::num;

/// Customized error type for the consensus core.
///
/// The variant decides how the caller must react: `Fatal` means the local
/// log or the caller contract is broken and the replica has to stop,
/// `Byzantine` carries evidence of a misbehaving peer and only rejects the
/// offending input, and `Msg` covers everything else (parsing, encoding,
/// configuration).
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MirError {
    Fatal(String),
    Byzantine(String),
    Msg(String),
}

impl MirError {
    pub fn msg(msg: impl ToString) -> Self {
        MirError::Msg(msg.to_string())
    }

    pub fn fatal(msg: impl ToString) -> Self {
        MirError::Fatal(msg.to_string())
    }

    pub fn byzantine(msg: impl ToString) -> Self {
        MirError::Byzantine(msg.to_string())
    }

    /// Returns true if this error must abort the replica.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, MirError::Fatal(_))
    }

    /// Returns true if this error is evidence against a remote node.
    #[inline]
    pub fn is_byzantine(&self) -> bool {
        matches!(self, MirError::Byzantine(_))
    }
}

impl fmt::Display for MirError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MirError::Fatal(s) => write!(f, "fatal: {}", s),
            MirError::Byzantine(s) => write!(f, "byzantine: {}", s),
            MirError::Msg(s) => write!(f, "{}", s), // do not display literal quotes
        }
    }
}

impl error::Error for MirError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `MirError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for MirError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                MirError::Msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(num::TryFromIntError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = MirError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
        let e = MirError::fatal("log is corrupt");
        assert_eq!(format!("{}", e), String::from("fatal: log is corrupt"));
    }

    #[test]
    fn error_classes() {
        assert!(MirError::fatal("x").is_fatal());
        assert!(!MirError::fatal("x").is_byzantine());
        assert!(MirError::byzantine("x").is_byzantine());
        assert!(!MirError::msg("x").is_fatal());
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = MirError::from(io_error);
        assert!(!e.is_fatal());
        assert!(format!("{}", e).contains("oh no!"));
    }
}
