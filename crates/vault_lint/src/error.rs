//! Error taxonomy.
//!
//! Only [`LintError`] is fatal to a run. Everything else is recovered where it
//! happens and surfaces as a [`ProcessingError`] in the run's result.

use crate::conflict::ConflictGroup;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fatal errors. Both variants are raised before any file is mutated.
#[derive(Debug, Error)]
pub enum LintError {
    #[error("configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("rule conflicts prevent execution: {summary}")]
    RuleConflict {
        summary: String,
        conflicts: Vec<ConflictGroup>,
    },
}

impl LintError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// A rule's lint or fix capability failed (returned an error or panicked).
#[derive(Debug, Error)]
#[error("rule `{rule}` failed on {}: {source}", path.display())]
pub struct RuleExecutionError {
    pub rule: String,
    pub path: PathBuf,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl RuleExecutionError {
    pub fn new(rule: impl Into<String>, path: &Path, source: anyhow::Error) -> Self {
        Self {
            rule: rule.into(),
            path: path.to_path_buf(),
            source: source.into(),
        }
    }
}

/// Closed taxonomy of OS-level file failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FsErrorKind {
    NotFound,
    AccessDenied,
    OutOfSpace,
    TooManyOpenFiles,
    Generic,
}

impl FsErrorKind {
    pub fn from_io(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => return FsErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => return FsErrorKind::AccessDenied,
            _ => {}
        }
        match error.raw_os_error() {
            Some(code) => Self::from_os_code(code),
            None => FsErrorKind::Generic,
        }
    }

    #[cfg(unix)]
    fn from_os_code(code: i32) -> Self {
        match code {
            libc::ENOENT => FsErrorKind::NotFound,
            libc::EACCES | libc::EPERM | libc::EROFS => FsErrorKind::AccessDenied,
            libc::ENOSPC | libc::EDQUOT => FsErrorKind::OutOfSpace,
            libc::EMFILE | libc::ENFILE => FsErrorKind::TooManyOpenFiles,
            _ => FsErrorKind::Generic,
        }
    }

    #[cfg(windows)]
    fn from_os_code(code: i32) -> Self {
        // ERROR_FILE_NOT_FOUND, ERROR_PATH_NOT_FOUND, ERROR_ACCESS_DENIED,
        // ERROR_TOO_MANY_OPEN_FILES, ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
        match code {
            2 | 3 => FsErrorKind::NotFound,
            5 => FsErrorKind::AccessDenied,
            4 => FsErrorKind::TooManyOpenFiles,
            39 | 112 => FsErrorKind::OutOfSpace,
            _ => FsErrorKind::Generic,
        }
    }

    #[cfg(not(any(unix, windows)))]
    fn from_os_code(_code: i32) -> Self {
        FsErrorKind::Generic
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FsErrorKind::NotFound => "not-found",
            FsErrorKind::AccessDenied => "access-denied",
            FsErrorKind::OutOfSpace => "out-of-space",
            FsErrorKind::TooManyOpenFiles => "too-many-open-files",
            FsErrorKind::Generic => "generic",
        }
    }
}

/// Failure of a durable file operation.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("{operation} failed for {} ({}): {source}", path.display(), kind.as_str())]
    Io {
        operation: &'static str,
        path: PathBuf,
        kind: FsErrorKind,
        #[source]
        source: io::Error,
    },

    #[error("written content for {} did not validate: {reason}", path.display())]
    ValidationFailed { path: PathBuf, reason: String },

    #[error("checksum mismatch for {} and no backup to fall back to", path.display())]
    ChecksumMismatch { path: PathBuf },

    #[error("refusing to overwrite existing {}", path.display())]
    TargetExists { path: PathBuf },

    #[error("{} is only available from backup {}", path.display(), backup.display())]
    OnlyInBackup { path: PathBuf, backup: PathBuf },
}

impl FileError {
    pub fn io(operation: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.to_path_buf(),
            kind: FsErrorKind::from_io(&source),
            source,
        }
    }

    pub fn kind(&self) -> FsErrorKind {
        match self {
            FileError::Io { kind, .. } => *kind,
            _ => FsErrorKind::Generic,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            FileError::Io { path, .. }
            | FileError::ValidationFailed { path, .. }
            | FileError::ChecksumMismatch { path }
            | FileError::TargetExists { path }
            | FileError::OnlyInBackup { path, .. } => path,
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FileError::Io { kind, .. } => !matches!(kind, FsErrorKind::NotFound),
            FileError::ValidationFailed { .. } => true,
            FileError::ChecksumMismatch { .. }
            | FileError::TargetExists { .. }
            | FileError::OnlyInBackup { .. } => false,
        }
    }
}

/// Failures of the task dispatcher, as seen by a submitting caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("task {task_id} timed out after {timeout_ms}ms")]
    Timeout { task_id: u64, timeout_ms: u64 },

    #[error("task {task_id} was cancelled")]
    Cancelled { task_id: u64 },

    #[error("task {task_id} failed: {message}")]
    TaskFailed { task_id: u64, message: String },

    #[error("dispatcher is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingErrorKind {
    RuleExecution,
    FileSystem,
    FixConflict,
    Dispatch,
}

/// A non-fatal failure collected into a run's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingError {
    pub kind: ProcessingErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_kind: Option<FsErrorKind>,
    pub message: String,
}

impl ProcessingError {
    pub fn rule_execution(error: &RuleExecutionError) -> Self {
        Self {
            kind: ProcessingErrorKind::RuleExecution,
            rule: Some(error.rule.clone()),
            file: Some(error.path.clone()),
            fs_kind: None,
            message: error.to_string(),
        }
    }

    pub fn file_system(error: &FileError) -> Self {
        Self {
            kind: ProcessingErrorKind::FileSystem,
            rule: None,
            file: Some(error.path().to_path_buf()),
            fs_kind: Some(error.kind()),
            message: error.to_string(),
        }
    }

    pub fn fix_conflict(rule: &str, file: &Path, message: impl Into<String>) -> Self {
        Self {
            kind: ProcessingErrorKind::FixConflict,
            rule: Some(rule.to_string()),
            file: Some(file.to_path_buf()),
            fs_kind: None,
            message: message.into(),
        }
    }

    pub fn dispatch(rule: &str, file: &Path, error: &DispatchError) -> Self {
        Self {
            kind: ProcessingErrorKind::Dispatch,
            rule: Some(rule.to_string()),
            file: Some(file.to_path_buf()),
            fs_kind: None,
            message: error.to_string(),
        }
    }

    pub fn with_rule(mut self, rule: &str) -> Self {
        self.rule = Some(rule.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_error_kind_mapping() {
        let not_found = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(FsErrorKind::from_io(&not_found), FsErrorKind::NotFound);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(FsErrorKind::from_io(&denied), FsErrorKind::AccessDenied);

        let other = io::Error::other("weird");
        assert_eq!(FsErrorKind::from_io(&other), FsErrorKind::Generic);
    }

    #[cfg(unix)]
    #[test]
    fn test_fs_error_kind_from_raw_os_codes() {
        let full = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(FsErrorKind::from_io(&full), FsErrorKind::OutOfSpace);

        let too_many = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(FsErrorKind::from_io(&too_many), FsErrorKind::TooManyOpenFiles);
    }

    #[test]
    fn test_rule_execution_error_keeps_context() {
        let error = RuleExecutionError::new(
            "x.a",
            Path::new("/vault/note.md"),
            anyhow::anyhow!("boom"),
        );
        let message = error.to_string();
        assert!(message.contains("x.a"));
        assert!(message.contains("/vault/note.md"));
        assert!(message.contains("boom"));
        assert!(std::error::Error::source(&error).is_some());

        let processing = ProcessingError::rule_execution(&error);
        assert_eq!(processing.kind, ProcessingErrorKind::RuleExecution);
        assert_eq!(processing.rule.as_deref(), Some("x.a"));
    }
}
