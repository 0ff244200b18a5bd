//! Crash-safe file mutations with backups, checksums and bounded retries.
//!
//! Writes go to a sibling temporary file that is renamed over the target, so
//! the target only ever holds its old or its new content. Concurrent writers
//! to different files are safe; callers must not write the same file twice
//! concurrently.

use crate::error::{FileError, FsErrorKind};
use crate::types::content_hash;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);
static BACKUP_COUNTER: AtomicU64 = AtomicU64::new(0);
const BACKUP_KEY_HASH_LEN: usize = 16;

/// Blocks the current thread between retries.
pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Extra check run against freshly written content before it replaces the
/// target. Returning `Err` rejects the write.
pub type ContentValidator = Arc<dyn Fn(&Path, &str) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub backup_dir: PathBuf,
    /// Backups retained per original file.
    pub keep_backups: usize,
    /// Total attempts per operation, including the first.
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub validate_writes: bool,
    pub verify_checksums: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            backup_dir: std::env::temp_dir().join("vault-lint-backups"),
            keep_backups: 5,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            validate_writes: true,
            verify_checksums: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    pub backup: bool,
    pub atomic: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            backup: true,
            atomic: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOptions {
    pub backup: bool,
    pub overwrite: bool,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self {
            backup: true,
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOptions {
    pub backup: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self { backup: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub backup: Option<PathBuf>,
    pub attempts: u32,
}

impl WriteOutcome {
    pub fn backup_created(&self) -> bool {
        self.backup.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub content: String,
    /// Set when the content came from a backup instead of the file itself.
    pub from_backup: Option<PathBuf>,
}

pub struct DurableFileWriter {
    config: WriterConfig,
    sleeper: Sleeper,
    validator: Option<ContentValidator>,
    checksums: Mutex<HashMap<PathBuf, String>>,
}

impl DurableFileWriter {
    pub fn new(config: WriterConfig) -> Self {
        Self {
            config,
            sleeper: Arc::new(std::thread::sleep),
            validator: None,
            checksums: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_validator(mut self, validator: ContentValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn read(&self, path: &Path) -> Result<ReadOutcome, FileError> {
        match fs::read_to_string(path) {
            Ok(content) => {
                if self.config.verify_checksums && !self.checksum_matches(path, &content) {
                    log::warn!("Checksum mismatch for {}", path.display());
                    return self
                        .read_latest_backup(path)
                        .ok_or_else(|| FileError::ChecksumMismatch {
                            path: path.to_path_buf(),
                        });
                }
                Ok(ReadOutcome {
                    content,
                    from_backup: None,
                })
            }
            Err(error) => {
                let error = FileError::io("read", path, error);
                match self.read_latest_backup(path) {
                    Some(outcome) => {
                        log::warn!("{error}; using backup instead");
                        Ok(outcome)
                    }
                    None => Err(error),
                }
            }
        }
    }

    pub fn write(
        &self,
        path: &Path,
        content: &str,
        options: WriteOptions,
    ) -> Result<WriteOutcome, FileError> {
        let backup = if options.backup && path.exists() {
            Some(self.create_backup(path)?)
        } else {
            None
        };

        let attempts = self.with_retry("write", path, || {
            if options.atomic {
                self.write_atomic(path, content)
            } else {
                fs::write(path, content).map_err(|error| FileError::io("write", path, error))
            }
        })?;

        self.record_checksum(path, content);
        Ok(WriteOutcome { backup, attempts })
    }

    pub fn move_file(
        &self,
        from: &Path,
        to: &Path,
        options: MoveOptions,
    ) -> Result<WriteOutcome, FileError> {
        if to.exists() && !options.overwrite {
            return Err(FileError::TargetExists {
                path: to.to_path_buf(),
            });
        }
        if !from.exists() {
            return Err(FileError::io(
                "move",
                from,
                io::Error::new(io::ErrorKind::NotFound, "source does not exist"),
            ));
        }

        let backup = if options.backup {
            if to.exists() {
                self.create_backup(to)?;
            }
            Some(self.create_backup(from)?)
        } else {
            None
        };

        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| FileError::io("create directory", parent, error))?;
        }

        let attempts = self.with_retry("move", from, || match fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(error) if FsErrorKind::from_io(&error) == FsErrorKind::NotFound => {
                Err(FileError::io("move", from, error))
            }
            Err(error) => {
                log::debug!(
                    "Rename {} -> {} failed ({error}), copying instead",
                    from.display(),
                    to.display()
                );
                fs::copy(from, to).map_err(|error| FileError::io("copy", to, error))?;
                fs::remove_file(from).map_err(|error| FileError::io("delete", from, error))
            }
        })?;

        let mut checksums = self.checksums.lock();
        if let Some(checksum) = checksums.remove(from) {
            checksums.insert(to.to_path_buf(), checksum);
        }
        Ok(WriteOutcome { backup, attempts })
    }

    pub fn delete(&self, path: &Path, options: DeleteOptions) -> Result<WriteOutcome, FileError> {
        let backup = if options.backup && path.exists() {
            Some(self.create_backup(path)?)
        } else {
            None
        };
        let attempts = self.with_retry("delete", path, || {
            fs::remove_file(path).map_err(|error| FileError::io("delete", path, error))
        })?;
        self.checksums.lock().remove(path);
        Ok(WriteOutcome { backup, attempts })
    }

    pub fn record_checksum(&self, path: &Path, content: &str) {
        self.checksums
            .lock()
            .insert(path.to_path_buf(), content_hash(content.as_bytes()));
    }

    /// Drop every recorded checksum, so whatever is on disk now becomes the
    /// baseline for later reads.
    pub fn forget_checksums(&self) {
        self.checksums.lock().clear();
    }

    fn checksum_matches(&self, path: &Path, content: &str) -> bool {
        match self.checksums.lock().get(path) {
            Some(expected) => *expected == content_hash(content.as_bytes()),
            None => true,
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts. Returns the number of attempts used.
    fn with_retry(
        &self,
        operation: &str,
        path: &Path,
        mut attempt: impl FnMut() -> Result<(), FileError>,
    ) -> Result<u32, FileError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut delay = self.config.retry_base_delay;
        let mut attempt_number = 1;
        loop {
            match attempt() {
                Ok(()) => return Ok(attempt_number),
                Err(error) if error.is_retryable() && attempt_number < max_attempts => {
                    log::warn!(
                        "{operation} of {} failed (attempt {attempt_number}/{max_attempts}), retrying in {delay:?}: {error}",
                        path.display()
                    );
                    (self.sleeper)(delay);
                    delay = delay.saturating_mul(2);
                    attempt_number += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn write_atomic(&self, path: &Path, content: &str) -> Result<(), FileError> {
        let temp = temp_path(path);
        let result = self.write_temp_and_rename(&temp, path, content);
        if result.is_err() && temp.exists() {
            fs::remove_file(&temp).ok();
        }
        result
    }

    fn write_temp_and_rename(
        &self,
        temp: &Path,
        path: &Path,
        content: &str,
    ) -> Result<(), FileError> {
        let mut file =
            fs::File::create(temp).map_err(|error| FileError::io("create", temp, error))?;
        file.write_all(content.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|error| FileError::io("write", temp, error))?;
        drop(file);

        if self.config.validate_writes {
            let written = fs::read(temp).map_err(|error| FileError::io("verify", temp, error))?;
            if written != content.as_bytes() {
                return Err(FileError::ValidationFailed {
                    path: path.to_path_buf(),
                    reason: "re-read content differs from what was written".to_string(),
                });
            }
        }
        if let Some(validator) = &self.validator {
            validator(path, content).map_err(|reason| FileError::ValidationFailed {
                path: path.to_path_buf(),
                reason,
            })?;
        }

        fs::rename(temp, path).map_err(|error| FileError::io("rename", path, error))
    }

    /// Copy `path` into the backup store and prune its old backups.
    pub fn create_backup(&self, path: &Path) -> Result<PathBuf, FileError> {
        let dir = &self.config.backup_dir;
        fs::create_dir_all(dir)
            .map_err(|error| FileError::io("create backup directory", dir, error))?;

        let key = backup_key(path);
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
        let seq = BACKUP_COUNTER.fetch_add(1, Ordering::SeqCst);
        let backup = dir.join(format!("{key}.{stamp}-{seq:06}.bak"));
        fs::copy(path, &backup).map_err(|error| FileError::io("backup", path, error))?;
        log::debug!("Backed up {} to {}", path.display(), backup.display());

        self.prune_backups(&key);
        Ok(backup)
    }

    /// Backups of the file at `path`, oldest first.
    pub fn backups_for(&self, path: &Path) -> Vec<PathBuf> {
        self.backups_keyed(&backup_key(path))
    }

    fn backups_keyed(&self, key: &str) -> Vec<PathBuf> {
        let prefix = format!("{key}.");
        let Ok(entries) = fs::read_dir(&self.config.backup_dir) else {
            return Vec::new();
        };
        let mut backups: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| name.strip_prefix(&prefix))
                    .and_then(|rest| rest.strip_suffix(".bak"))
                    .is_some_and(is_backup_stamp)
            })
            .collect();
        backups.sort();
        backups
    }

    fn prune_backups(&self, key: &str) {
        let backups = self.backups_keyed(key);
        let excess = backups.len().saturating_sub(self.config.keep_backups.max(1));
        for old in &backups[..excess] {
            if let Err(error) = fs::remove_file(old) {
                log::warn!("Failed to prune backup {}: {error}", old.display());
            }
        }
    }

    fn read_latest_backup(&self, path: &Path) -> Option<ReadOutcome> {
        let latest = self.backups_for(path).pop()?;
        match fs::read_to_string(&latest) {
            Ok(content) => Some(ReadOutcome {
                content,
                from_backup: Some(latest),
            }),
            Err(error) => {
                log::warn!("Failed to read backup {}: {error}", latest.display());
                None
            }
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string())
}

/// `<file name>.<path hash>`. Files that share a name in different folders,
/// or different vaults, never share backups.
fn backup_key(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let hash = content_hash(absolute.as_os_str().as_encoded_bytes());
    format!("{}.{}", file_name(path), &hash[..BACKUP_KEY_HASH_LEN])
}

/// `YYYYMMDDTHHMMSSmmm-NNNNNN`
fn is_backup_stamp(stamp: &str) -> bool {
    match stamp.split_once('-') {
        Some((time, seq)) => {
            time.len() == 18
                && time.chars().all(|ch| ch.is_ascii_digit() || ch == 'T')
                && !seq.is_empty()
                && seq.chars().all(|ch| ch.is_ascii_digit())
        }
        None => false,
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::SeqCst);
    path.with_file_name(format!(
        ".{}.tmp.{}.{counter}",
        file_name(path),
        std::process::id()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Fixture {
        dir: tempfile::TempDir,
        delays: Arc<Mutex<Vec<Duration>>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                delays: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn writer(&self, keep_backups: usize) -> DurableFileWriter {
            let delays = self.delays.clone();
            DurableFileWriter::new(WriterConfig {
                backup_dir: self.dir.path().join("backups"),
                keep_backups,
                max_attempts: 3,
                retry_base_delay: Duration::from_millis(10),
                validate_writes: true,
                verify_checksums: true,
            })
            .with_sleeper(Arc::new(move |delay| delays.lock().push(delay)))
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn temp_files(&self) -> Vec<String> {
            fs::read_dir(self.dir.path())
                .unwrap()
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .filter(|name| name.contains(".tmp."))
                .collect()
        }
    }

    #[test]
    fn test_atomic_write_with_backup() {
        let fixture = Fixture::new();
        let writer = fixture.writer(5);
        let path = fixture.path("note.md");
        fs::write(&path, "old").unwrap();

        let outcome = writer.write(&path, "new", WriteOptions::default()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        assert_eq!(outcome.attempts, 1);
        let backup = outcome.backup.unwrap();
        assert_eq!(fs::read_to_string(&backup).unwrap(), "old");
        assert!(fixture.temp_files().is_empty());
    }

    #[test]
    fn test_failed_validation_leaves_target_untouched() {
        let fixture = Fixture::new();
        let writer = fixture
            .writer(5)
            .with_validator(Arc::new(|_, _| Err("rejected".to_string())));
        let path = fixture.path("note.md");
        fs::write(&path, "original").unwrap();

        let error = writer.write(&path, "replacement", WriteOptions::default()).unwrap_err();
        assert!(matches!(error, FileError::ValidationFailed { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "original");
        assert!(fixture.temp_files().is_empty());
        assert_eq!(
            *fixture.delays.lock(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[test]
    fn test_backups_are_pruned() {
        let fixture = Fixture::new();
        let writer = fixture.writer(2);
        let path = fixture.path("note.md");
        fs::write(&path, "v0").unwrap();
        for version in 1..=4 {
            writer
                .write(&path, &format!("v{version}"), WriteOptions::default())
                .unwrap();
        }

        let backups = writer.backups_for(&path);
        assert_eq!(backups.len(), 2);
        assert_eq!(fs::read_to_string(&backups[0]).unwrap(), "v2");
        assert_eq!(fs::read_to_string(&backups[1]).unwrap(), "v3");
    }

    #[test]
    fn test_read_falls_back_to_backup() {
        let fixture = Fixture::new();
        let writer = fixture.writer(5);
        let path = fixture.path("note.md");
        writer.write(&path, "v1", WriteOptions::default()).unwrap();
        writer.write(&path, "v2", WriteOptions::default()).unwrap();

        assert_eq!(writer.read(&path).unwrap().content, "v2");

        fs::write(&path, "tampered").unwrap();
        let outcome = writer.read(&path).unwrap();
        assert_eq!(outcome.content, "v1");
        assert!(outcome.from_backup.is_some());

        fs::remove_file(&path).unwrap();
        assert_eq!(writer.read(&path).unwrap().content, "v1");
    }

    #[test]
    fn test_checksum_mismatch_without_backup() {
        let fixture = Fixture::new();
        let writer = fixture.writer(5);
        let path = fixture.path("note.md");
        writer.write(&path, "v1", WriteOptions::default()).unwrap();
        fs::write(&path, "tampered").unwrap();
        assert!(matches!(writer.read(&path), Err(FileError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_forgotten_checksums_accept_external_edits() {
        let fixture = Fixture::new();
        let writer = fixture.writer(5);
        let path = fixture.path("note.md");
        writer.write(&path, "v1", WriteOptions::default()).unwrap();
        writer.write(&path, "v2", WriteOptions::default()).unwrap();
        fs::write(&path, "edited elsewhere").unwrap();

        writer.forget_checksums();
        let outcome = writer.read(&path).unwrap();
        assert_eq!(outcome.content, "edited elsewhere");
        assert_eq!(outcome.from_backup, None);
    }

    #[test]
    fn test_backups_of_same_named_files_stay_apart() {
        let fixture = Fixture::new();
        let writer = fixture.writer(1);
        let a = fixture.path("a/index.md");
        let b = fixture.path("b/index.md");
        fs::create_dir_all(a.parent().unwrap()).unwrap();
        fs::create_dir_all(b.parent().unwrap()).unwrap();

        fs::write(&b, "B secret\n").unwrap();
        writer.write(&b, "B public\n", WriteOptions::default()).unwrap();
        assert!(writer.backups_for(&a).is_empty());
        let error = writer.read(&a).unwrap_err();
        assert_eq!(error.kind(), FsErrorKind::NotFound);

        fs::write(&a, "A\n").unwrap();
        writer.write(&a, "A new\n", WriteOptions::default()).unwrap();
        let a_backups = writer.backups_for(&a);
        let b_backups = writer.backups_for(&b);
        assert_eq!(a_backups.len(), 1);
        assert_eq!(b_backups.len(), 1);
        assert_eq!(fs::read_to_string(&a_backups[0]).unwrap(), "A\n");
        assert_eq!(fs::read_to_string(&b_backups[0]).unwrap(), "B secret\n");
    }

    #[test]
    fn test_move_and_delete() {
        let fixture = Fixture::new();
        let writer = fixture.writer(5);
        let from = fixture.path("Old Name.md");
        let to = fixture.path("sub/old-name.md");
        fs::write(&from, "body").unwrap();

        let outcome = writer.move_file(&from, &to, MoveOptions::default()).unwrap();
        assert!(outcome.backup_created());
        assert!(!from.exists());
        assert_eq!(fs::read_to_string(&to).unwrap(), "body");

        fs::write(&from, "again").unwrap();
        assert!(matches!(
            writer.move_file(&from, &to, MoveOptions::default()),
            Err(FileError::TargetExists { .. })
        ));
        writer
            .move_file(&from, &to, MoveOptions { backup: false, overwrite: true })
            .unwrap();
        assert_eq!(fs::read_to_string(&to).unwrap(), "again");

        let outcome = writer.delete(&to, DeleteOptions::default()).unwrap();
        assert!(!to.exists());
        assert_eq!(fs::read_to_string(outcome.backup.unwrap()).unwrap(), "again");
    }

    #[test]
    fn test_missing_file_is_not_retried() {
        let fixture = Fixture::new();
        let writer = fixture.writer(5);
        let error = writer
            .delete(&fixture.path("missing.md"), DeleteOptions::default())
            .unwrap_err();
        assert_eq!(error.kind(), FsErrorKind::NotFound);
        assert!(fixture.delays.lock().is_empty());
    }
}
