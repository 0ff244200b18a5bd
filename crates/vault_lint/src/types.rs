//! Core data model shared by the cache, executor, writer and orchestrator.

use crate::error::ProcessingError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Identity of a rule: `major` names the concern, `minor` the mutually
/// exclusive variant implementing it. Serialized as `"major.minor"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuleIdentity {
    pub major: String,
    pub minor: String,
    pub full: String,
}

impl RuleIdentity {
    pub fn new(major: impl Into<String>, minor: impl Into<String>) -> Self {
        let major = major.into();
        let minor = minor.into();
        let full = format!("{major}.{minor}");
        Self { major, minor, full }
    }

    /// Parse `major.minor`. The split happens at the first dot so a minor may
    /// itself contain dots.
    pub fn parse(full: &str) -> Result<Self, String> {
        let full = full.trim();
        match full.split_once('.') {
            Some((major, minor)) if !major.is_empty() && !minor.is_empty() => {
                Ok(Self::new(major, minor))
            }
            _ => Err(format!(
                "invalid rule identity `{full}`, expected `major.minor`"
            )),
        }
    }
}

impl TryFrom<String> for RuleIdentity {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RuleIdentity> for String {
    fn from(identity: RuleIdentity) -> Self {
        identity.full
    }
}

impl fmt::Display for RuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Severity::Error),
            "warning" | "warn" => Some(Severity::Warning),
            "info" => Some(Severity::Info),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected violation, after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    pub file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
    pub fixable: bool,
}

/// An issue as a rule reports it. Every field may be missing or malformed;
/// the executor fills defaults before anything else sees it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawIssue {
    pub rule_id: Option<String>,
    pub severity: Option<String>,
    pub message: Option<String>,
    pub file: Option<PathBuf>,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub fixable: Option<bool>,
}

impl RawIssue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = Some(severity.into());
        self
    }

    pub fn at(mut self, line: usize, column: Option<usize>) -> Self {
        self.line = Some(line);
        self.column = column;
        self
    }

    pub fn fixable(mut self, fixable: bool) -> Self {
        self.fixable = Some(fixable);
        self
    }
}

/// 1-based line/column position inside a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextPosition {
    pub line: usize,
    pub column: usize,
}

impl TextPosition {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FileChange {
    Replace {
        line: usize,
        old_text: String,
        new_text: String,
    },
    Insert {
        line: usize,
        column: usize,
        text: String,
    },
    Delete {
        start: TextPosition,
        end: TextPosition,
    },
    Move {
        from: PathBuf,
        to: PathBuf,
        #[serde(default)]
        update_links: bool,
    },
}

impl FileChange {
    pub fn is_move(&self) -> bool {
        matches!(self, FileChange::Move { .. })
    }
}

/// A concrete remediation for one or more issues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fix {
    pub rule_id: String,
    pub file: PathBuf,
    pub description: String,
    pub changes: Vec<FileChange>,
}

/// A fix as a rule reports it, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFix {
    pub rule_id: Option<String>,
    pub file: Option<PathBuf>,
    pub description: Option<String>,
    pub changes: Vec<FileChange>,
}

impl RawFix {
    pub fn new(description: impl Into<String>, changes: Vec<FileChange>) -> Self {
        Self {
            description: Some(description.into()),
            changes,
            ..Default::default()
        }
    }
}

/// Last known disk state of a file, as recorded by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: PathBuf,
    pub size: u64,
    /// Milliseconds since the unix epoch.
    pub modified_at: u64,
    #[serde(default)]
    pub content_hash: Option<String>,
    pub last_processed_at: u64,
}

/// Output of one rule over one file. Superseded, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleExecutionResult {
    pub rule_identity: RuleIdentity,
    pub issues: Vec<Issue>,
    pub fixes: Vec<Fix>,
    pub execution_time_ms: u64,
    pub file_hash: String,
}

/// Terminal summary of one orchestration run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LintResult {
    pub files_processed: usize,
    pub issues_found: Vec<Issue>,
    pub fixes_applied: Vec<Fix>,
    pub errors: Vec<ProcessingError>,
    pub duration_ms: u64,
}

impl LintResult {
    pub fn error_count(&self) -> usize {
        self.issues_found
            .iter()
            .filter(|issue| issue.severity == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.issues_found
            .iter()
            .filter(|issue| issue.severity == Severity::Warning)
            .count()
    }

    pub fn issues_for(&self, file: &std::path::Path) -> impl Iterator<Item = &Issue> {
        self.issues_found
            .iter()
            .filter(move |issue| issue.file == file)
    }
}

pub(crate) fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn now_millis() -> u64 {
    unix_millis(SystemTime::now())
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

/// Hex-encoded sha256 of `content`.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
