//! Process exit codes
//!
//! Scripts depend on these values; never renumber an existing code.

use sd_core::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    /// Bad arguments, locator or chunk size
    UsageError = 2,
    /// Network failure or retries exhausted
    NetworkError = 3,
    AuthError = 4,
    NotFound = 5,
    /// Local and remote digests differ
    ChecksumError = 6,
    /// Cancelled by the user
    Interrupted = 130,
}

impl ExitCode {
    /// Exit code for the error that ended a transfer
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::EmptyFile(_)
            | Error::InvalidChunkSize { .. }
            | Error::InvalidLocator(_)
            | Error::Config(_) => ExitCode::UsageError,
            Error::Transient(_) => ExitCode::NetworkError,
            Error::RetryExhausted { source, .. } => match ExitCode::from_error(source) {
                ExitCode::GeneralError => ExitCode::NetworkError,
                code => code,
            },
            Error::Auth(_) => ExitCode::AuthError,
            Error::NotFound(_) => ExitCode::NotFound,
            Error::ChecksumMismatch { .. } | Error::SizeMismatch { .. } => ExitCode::ChecksumError,
            Error::Cancelled => ExitCode::Interrupted,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ExitCode::NotFound,
            Error::Provider(_)
            | Error::PartialObjectCleanup { .. }
            | Error::SessionClosed(_)
            | Error::Io(_)
            | Error::General(_) => ExitCode::GeneralError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sd_core::RetryScope;

    #[test]
    fn test_code_values() {
        assert_eq!(i32::from(ExitCode::Success), 0);
        assert_eq!(i32::from(ExitCode::UsageError), 2);
        assert_eq!(i32::from(ExitCode::ChecksumError), 6);
        assert_eq!(i32::from(ExitCode::Interrupted), 130);
    }

    #[test]
    fn test_from_error() {
        assert_eq!(
            ExitCode::from_error(&Error::EmptyFile("a.bin".to_string())),
            ExitCode::UsageError
        );
        assert_eq!(ExitCode::from_error(&Error::Cancelled), ExitCode::Interrupted);
        assert_eq!(
            ExitCode::from_error(&Error::ChecksumMismatch {
                object_index: 0,
                expected: "a".to_string(),
                actual: "b".to_string(),
            }),
            ExitCode::ChecksumError
        );
        assert_eq!(
            ExitCode::from_error(&Error::SizeMismatch {
                object_index: 1,
                expected: 64,
                actual: 32,
            }),
            ExitCode::ChecksumError
        );
    }

    #[test]
    fn test_exhausted_retries_keep_cause() {
        let exhausted = |source: Error| Error::RetryExhausted {
            scope: RetryScope::Chunk,
            chunk_index: Some(3),
            attempts: 5,
            source: Box::new(source),
        };

        assert_eq!(
            ExitCode::from_error(&exhausted(Error::Transient("503".to_string()))),
            ExitCode::NetworkError
        );
        assert_eq!(
            ExitCode::from_error(&exhausted(Error::General("odd".to_string()))),
            ExitCode::NetworkError
        );
        assert_eq!(
            ExitCode::from_error(&exhausted(Error::Auth("expired".to_string()))),
            ExitCode::AuthError
        );
    }
}
