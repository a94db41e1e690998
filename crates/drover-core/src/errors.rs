//! Engine error taxonomy.
//!
//! Errors are split along the recovery boundaries the engine cares about:
//! - Per-file errors (Io) are reported and do not stop other files.
//! - Share-level errors (MountTimeout, CredentialsUnavailable) abort the
//!   whole operation because every remaining file on that share would fail
//!   the same way.
//! - Cancelled is not an error condition; it unwinds workers promptly.

use std::io;

/// An engine-level failure.
#[derive(Debug)]
pub enum CopyError {
    /// A network-share path that does not contain a server and share segment.
    InvalidPath(String),
    /// A mount attempt or mount-wait exceeded its deadline.
    MountTimeout { server: String, share: String },
    /// The caller declined or failed to supply credentials.
    CredentialsUnavailable,
    /// The shared cancel flag was observed set.
    Cancelled,
    /// An underlying I/O failure.
    Io(io::Error),
}

impl CopyError {
    /// Share-level failures cancel the whole operation (fail-fast): every
    /// other file on the same share would fail identically.
    pub fn is_share_fatal(&self) -> bool {
        matches!(
            self,
            CopyError::MountTimeout { .. } | CopyError::CredentialsUnavailable
        )
    }
}

impl std::fmt::Display for CopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyError::InvalidPath(path) => write!(f, "invalid network share path: {path}"),
            CopyError::MountTimeout { server, share } => {
                write!(f, "timed out mounting //{server}/{share}")
            }
            CopyError::CredentialsUnavailable => write!(f, "credentials unavailable"),
            CopyError::Cancelled => write!(f, "operation cancelled"),
            CopyError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CopyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CopyError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CopyError {
    fn from(err: io::Error) -> Self {
        CopyError::Io(err)
    }
}

/// Result type for engine operations.
pub type CopyResult<T> = std::result::Result<T, CopyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_fatal_classification() {
        assert!(CopyError::MountTimeout {
            server: "nas".into(),
            share: "media".into()
        }
        .is_share_fatal());
        assert!(CopyError::CredentialsUnavailable.is_share_fatal());
        assert!(!CopyError::Cancelled.is_share_fatal());
        assert!(!CopyError::Io(io::Error::new(io::ErrorKind::NotFound, "gone")).is_share_fatal());
    }

    #[test]
    fn display_includes_share() {
        let err = CopyError::MountTimeout {
            server: "nas".into(),
            share: "media".into(),
        };
        assert!(err.to_string().contains("//nas/media"));
    }
}
