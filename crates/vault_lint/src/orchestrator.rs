//! The end-to-end lint pipeline.
//!
//! A run loads the profile's rules, rejects conflicting rule sets, enumerates
//! the vault, skips files the modification cache knows are unchanged, and
//! then lints the rest in memory-governed batches. Fixes are applied through
//! the durable writer, one mutation per path at a time. Renames are deferred
//! until every file has been processed so that link rewriting never races a
//! file that is still being linted.

use crate::cache::{CacheStats, ModificationCache};
use crate::config::ResolvedProfile;
use crate::conflict::{ConflictSeverity, detect_conflicts};
use crate::dispatcher::{TaskDispatcher, cpu_count, run_bounded};
use crate::error::{FileError, LintError, ProcessingError, ProcessingErrorKind};
use crate::file_writer::{DurableFileWriter, MoveOptions, WriteOptions};
use crate::fix_applier::{apply_text_changes, rewrite_wiki_links};
use crate::lint_task::{LINT_FILE_TASK, LintFileTask, LintTaskHandler, RuleOutcome, run_rules};
use crate::memory_governor::{MemoryGovernor, MemoryProbe, MemorySample, MemoryStats};
use crate::parser::{FileParser, MarkdownParser};
use crate::rule::{Rule, RuleContext, RuleFactory, RuleSpec, load_rule_specs, relative_to_vault};
use crate::rule_executor::{RuleExecutor, glob_matches};
use crate::types::{
    FileChange, Fix, Issue, LintResult, RuleExecutionResult, content_hash, duration_millis,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

const MEMORY_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const LOW_HIT_RATE: f64 = 0.1;
const MIN_LOOKUPS_FOR_HIT_RATE: u64 = 100;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    pub dry_run: bool,
    pub fix: bool,
    pub parallel: bool,
    pub incremental: bool,
    pub verbose: bool,
    pub max_concurrency: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            fix: false,
            parallel: true,
            incremental: true,
            verbose: false,
            max_concurrency: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Idle,
    ConflictChecked,
    Scanning,
    Dispatching,
    Aggregating,
    Done,
    Error,
}

/// Called with `(current, total, message)` after every file.
pub type ProgressCallback = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// Requests that a run stop dispatching new files. Files already in flight
/// finish normally.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorMetrics {
    pub max_concurrency: usize,
    pub cpu_count: usize,
    pub recommended_concurrency: usize,
    pub cache_stats: CacheStats,
    pub memory_stats: MemoryStats,
}

/// A rename requested by a fix, applied once every file has been linted.
struct PendingMove {
    fix: Fix,
    from: PathBuf,
    to: PathBuf,
    update_links: bool,
}

#[derive(Default)]
struct FileOutcome {
    processed: bool,
    issues: Vec<Issue>,
    fixes_applied: Vec<Fix>,
    errors: Vec<ProcessingError>,
    moves: Vec<PendingMove>,
}

#[derive(Default)]
struct RunTotals {
    files_processed: usize,
    issues: Vec<Issue>,
    fixes_applied: Vec<Fix>,
    errors: Vec<ProcessingError>,
    moves: Vec<PendingMove>,
}

impl RunTotals {
    fn absorb(&mut self, outcome: FileOutcome) {
        if outcome.processed {
            self.files_processed += 1;
        }
        self.issues.extend(outcome.issues);
        self.fixes_applied.extend(outcome.fixes_applied);
        self.errors.extend(outcome.errors);
        self.moves.extend(outcome.moves);
    }
}

/// Releases a path reserved by [`LintOrchestrator::reserve_path`].
struct PathReservation<'a> {
    paths: &'a Mutex<HashSet<PathBuf>>,
    path: PathBuf,
}

impl Drop for PathReservation<'_> {
    fn drop(&mut self) {
        self.paths.lock().remove(&self.path);
    }
}

struct Progress {
    current: usize,
    total: usize,
}

pub struct LintOrchestrator {
    profile: ResolvedProfile,
    factory: RuleFactory,
    parser: Arc<dyn FileParser>,
    executor: Arc<RuleExecutor>,
    cache: Arc<ModificationCache>,
    governor: Arc<MemoryGovernor>,
    writer: Arc<DurableFileWriter>,
    dispatcher: Mutex<Option<Arc<TaskDispatcher>>>,
    state: Mutex<RunState>,
    stop: StopHandle,
    progress_callback: Mutex<Option<ProgressCallback>>,
    progress: Mutex<Progress>,
    mutating: Mutex<HashSet<PathBuf>>,
    cache_loaded: AtomicBool,
}

impl LintOrchestrator {
    pub fn new(profile: ResolvedProfile) -> Self {
        let cache = Arc::new(ModificationCache::new(profile.cache.clone()));
        let governor = Arc::new(MemoryGovernor::new(profile.memory.clone()));
        let writer = Arc::new(DurableFileWriter::new(profile.writer.clone()));
        install_relief_hook(&governor, &cache);
        Self {
            profile,
            factory: RuleFactory::with_builtin_rules(),
            parser: Arc::new(MarkdownParser),
            executor: Arc::new(RuleExecutor::new()),
            cache,
            governor,
            writer,
            dispatcher: Mutex::new(None),
            state: Mutex::new(RunState::Idle),
            stop: StopHandle::default(),
            progress_callback: Mutex::new(None),
            progress: Mutex::new(Progress {
                current: 0,
                total: 0,
            }),
            mutating: Mutex::new(HashSet::new()),
            cache_loaded: AtomicBool::new(false),
        }
    }

    pub fn with_factory(mut self, factory: RuleFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn FileParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.governor = Arc::new(MemoryGovernor::with_probe(self.profile.memory.clone(), probe));
        install_relief_hook(&self.governor, &self.cache);
        self
    }

    pub fn with_writer(mut self, writer: DurableFileWriter) -> Self {
        self.writer = Arc::new(writer);
        self
    }

    pub fn on_progress(&self, callback: ProgressCallback) {
        *self.progress_callback.lock() = Some(callback);
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub fn profile(&self) -> &ResolvedProfile {
        &self.profile
    }

    pub fn cache(&self) -> &ModificationCache {
        &self.cache
    }

    pub fn writer(&self) -> &DurableFileWriter {
        &self.writer
    }

    fn set_state(&self, state: RunState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        if previous != state {
            log::debug!("Run state {previous:?} -> {state:?}");
        }
    }

    /// Lint every note in `vault_path`.
    pub async fn process_vault(
        &self,
        vault_path: &Path,
        options: RunOptions,
    ) -> Result<LintResult, LintError> {
        let started = Instant::now();
        let (specs, rules) = self.prepare_rules()?;

        self.set_state(RunState::Scanning);
        let files = self.scan_vault(vault_path).await;
        log::info!("Found {} note(s) in {}", files.len(), vault_path.display());

        Ok(self.run(vault_path, &specs, &rules, files, options, started).await)
    }

    /// Lint a fixed subset of files. Relative paths resolve against
    /// `vault_path`.
    pub async fn process_files(
        &self,
        vault_path: &Path,
        paths: &[PathBuf],
        options: RunOptions,
    ) -> Result<LintResult, LintError> {
        let started = Instant::now();
        let (specs, rules) = self.prepare_rules()?;

        self.set_state(RunState::Scanning);
        let files = paths
            .iter()
            .map(|path| vault_path.join(path))
            .filter(|path| !self.is_ignored(vault_path, path))
            .collect();

        Ok(self.run(vault_path, &specs, &rules, files, options, started).await)
    }

    /// Load rule specs, reject conflicting sets and build live rules. Nothing
    /// on disk has been touched when this fails.
    fn prepare_rules(&self) -> Result<(Vec<RuleSpec>, Vec<Arc<dyn Rule>>), LintError> {
        self.set_state(RunState::Idle);
        let prepared = self.load_and_check_rules();
        match &prepared {
            Ok(_) => self.set_state(RunState::ConflictChecked),
            Err(error) => {
                log::error!("{error}");
                self.set_state(RunState::Error);
            }
        }
        prepared
    }

    fn load_and_check_rules(&self) -> Result<(Vec<RuleSpec>, Vec<Arc<dyn Rule>>), LintError> {
        let specs = load_rule_specs(&self.profile.rules_dir)?;
        let report = detect_conflicts(&specs);
        for warning in &report.warnings {
            log::warn!("{warning}");
        }
        if !report.valid {
            let conflicts = report.critical().cloned().collect();
            return Err(LintError::RuleConflict {
                summary: report.summary,
                conflicts,
            });
        }
        let rules = self.factory.create_all(&specs)?;
        Ok((specs, rules))
    }

    fn is_ignored(&self, vault_path: &Path, path: &Path) -> bool {
        let relative = relative_to_vault(vault_path, path);
        self.profile
            .ignore_patterns
            .iter()
            .any(|pattern| glob_matches(pattern, &relative))
    }

    /// Every markdown note under `vault_path`, sorted, skipping hidden
    /// directories and ignored paths.
    async fn scan_vault(&self, vault_path: &Path) -> Vec<PathBuf> {
        let vault = vault_path.to_path_buf();
        let ignore_patterns = self.profile.ignore_patterns.clone();
        smol::unblock(move || {
            WalkDir::new(&vault)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()))
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(error) => {
                        log::warn!("Skipping unreadable vault entry: {error}");
                        None
                    }
                })
                .filter(|entry| entry.file_type().is_file() && is_note(entry.path()))
                .map(|entry| entry.into_path())
                .filter(|path| {
                    let relative = relative_to_vault(&vault, path);
                    !ignore_patterns
                        .iter()
                        .any(|pattern| glob_matches(pattern, &relative))
                })
                .collect()
        })
        .await
    }

    async fn run(
        &self,
        vault_path: &Path,
        specs: &[RuleSpec],
        rules: &[Arc<dyn Rule>],
        files: Vec<PathBuf>,
        options: RunOptions,
        started: Instant,
    ) -> LintResult {
        self.stop.reset();
        // Checksums only vouch for writes made during this run.
        self.writer.forget_checksums();
        self.load_cache();
        self.governor.start();
        *self.progress.lock() = Progress {
            current: 0,
            total: files.len(),
        };
        log::info!(
            "Linting {} file(s) with {} rule(s) (fix: {}, dry run: {})",
            files.len(),
            rules.len(),
            options.fix,
            options.dry_run
        );

        let mut totals = RunTotals::default();
        let mut remaining = Vec::with_capacity(files.len());
        for path in files {
            if options.incremental && !self.cache.needs_processing(&path) {
                totals.files_processed += 1;
                self.report_progress(vault_path, &path, "unchanged");
            } else {
                remaining.push(path);
            }
        }

        self.set_state(RunState::Dispatching);
        let dispatcher = options.parallel.then(|| self.dispatcher());
        let concurrency = options
            .max_concurrency
            .unwrap_or(self.profile.dispatcher.max_workers)
            .max(1);
        let average_mb = average_size_mb(&remaining);

        let mut queue = remaining.into_iter().peekable();
        while queue.peek().is_some() {
            if self.stop.is_stopped() {
                log::info!("Stop requested; not dispatching remaining files");
                break;
            }
            let strategy = self.governor.batching_strategy();
            if strategy.should_pause && !self.governor.wait_for_memory(MEMORY_WAIT_TIMEOUT).await {
                log::warn!("Continuing one file at a time under memory pressure");
            }
            let batch_size = strategy
                .recommended_batch_size
                .min(self.governor.calculate_optimal_batch_size(average_mb, queue.len()))
                .max(1);
            let batch: Vec<PathBuf> = queue.by_ref().take(batch_size).collect();
            log::debug!("Dispatching batch of {} file(s)", batch.len());

            let outcomes = run_bounded(
                batch.iter().map(|path| {
                    self.process_file(vault_path, path, specs, rules, options, dispatcher.clone())
                }),
                concurrency,
            )
            .await;
            for outcome in outcomes {
                totals.absorb(outcome);
            }
        }

        self.set_state(RunState::Aggregating);
        let moves = std::mem::take(&mut totals.moves);
        if !moves.is_empty() {
            self.apply_moves(vault_path, moves, &mut totals).await;
        }
        if self.profile.cache.persist_path.is_some() {
            let cache = self.cache.clone();
            if let Err(error) = smol::unblock(move || cache.flush()).await {
                log::error!("Failed to persist cache: {error:#}");
            }
        }
        self.governor.stop();

        let result = LintResult {
            files_processed: totals.files_processed,
            issues_found: totals.issues,
            fixes_applied: totals.fixes_applied,
            errors: totals.errors,
            duration_ms: duration_millis(started.elapsed()),
        };
        self.set_state(RunState::Done);
        log::info!(
            "Processed {} file(s): {} issue(s), {} fix(es) applied, {} error(s) in {}ms",
            result.files_processed,
            result.issues_found.len(),
            result.fixes_applied.len(),
            result.errors.len(),
            result.duration_ms
        );
        result
    }

    fn load_cache(&self) {
        if !self.cache_loaded.swap(true, Ordering::SeqCst) {
            self.cache.initialize();
        }
    }

    fn dispatcher(&self) -> Arc<TaskDispatcher> {
        let mut dispatcher = self.dispatcher.lock();
        match dispatcher.as_ref() {
            Some(existing) if !existing.is_shut_down() => existing.clone(),
            _ => {
                let handler =
                    Arc::new(LintTaskHandler::new(self.factory.clone(), self.parser.clone()));
                let created =
                    Arc::new(TaskDispatcher::new(self.profile.dispatcher.clone(), handler));
                *dispatcher = Some(created.clone());
                created
            }
        }
    }

    fn report_progress(&self, vault_path: &Path, path: &Path, status: &str) {
        let callback = self.progress_callback.lock().clone();
        let mut progress = self.progress.lock();
        progress.current = (progress.current + 1).min(progress.total.max(1));
        let message = format!("{} ({status})", relative_to_vault(vault_path, path));
        log::debug!("[{}/{}] {message}", progress.current, progress.total);
        if let Some(callback) = callback {
            callback(progress.current, progress.total, &message);
        }
    }

    async fn process_file(
        &self,
        vault_path: &Path,
        path: &Path,
        specs: &[RuleSpec],
        rules: &[Arc<dyn Rule>],
        options: RunOptions,
        dispatcher: Option<Arc<TaskDispatcher>>,
    ) -> FileOutcome {
        if self.stop.is_stopped() {
            return FileOutcome::default();
        }
        let outcome = self
            .lint_file(vault_path, path, specs, rules, options, dispatcher)
            .await;
        let status = if outcome.processed { "done" } else { "failed" };
        self.report_progress(vault_path, path, status);
        outcome
    }

    async fn lint_file(
        &self,
        vault_path: &Path,
        path: &Path,
        specs: &[RuleSpec],
        rules: &[Arc<dyn Rule>],
        options: RunOptions,
        dispatcher: Option<Arc<TaskDispatcher>>,
    ) -> FileOutcome {
        let mut outcome = FileOutcome::default();

        let read = {
            let writer = self.writer.clone();
            let path = path.to_path_buf();
            smol::unblock(move || read_current(&writer, &path)).await
        };
        let content = match read {
            Ok(content) => content,
            Err(error) => {
                log::warn!("{error}");
                outcome.errors.push(ProcessingError::file_system(&error));
                return outcome;
            }
        };
        let hash = content_hash(content.as_bytes());

        let relative = relative_to_vault(vault_path, path);
        let applicable: Vec<usize> = rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| self.executor.matches(rule.as_ref(), &relative))
            .map(|(index, _)| index)
            .collect();
        if applicable.is_empty() {
            self.cache.mark_processed(path, Some(&content));
            outcome.processed = true;
            return outcome;
        }

        let mut results: Vec<Option<RuleOutcome>> = Vec::with_capacity(applicable.len());
        let mut pending = Vec::new();
        for &index in &applicable {
            let rule = &rules[index];
            match self.cache.get_result(path, &rule.identity().full) {
                Some(cached) if is_reusable(&cached, &hash, options.fix) => {
                    results.push(Some(RuleOutcome::from_cached(cached)));
                }
                _ => {
                    pending.push(results.len());
                    results.push(None);
                }
            }
        }

        if !pending.is_empty() {
            let pending_rules: Vec<usize> = pending.iter().map(|&slot| applicable[slot]).collect();
            let fresh = match dispatcher {
                Some(dispatcher) => {
                    self.lint_in_worker(
                        &dispatcher,
                        vault_path,
                        path,
                        &content,
                        specs,
                        &pending_rules,
                        options,
                    )
                    .await
                }
                None => {
                    self.lint_in_process(vault_path, path, &content, rules, &pending_rules, options)
                        .await
                }
            };
            for (slot, result) in pending.into_iter().zip(fresh) {
                results[slot] = Some(result);
            }
        }

        let mut fixes = Vec::new();
        for result in results.into_iter().flatten() {
            if !result.cached && result.error.is_none() {
                self.cache.cache_result(
                    path,
                    &result.rule,
                    result.issues.clone(),
                    result.fixes.clone(),
                    result.execution_time_ms,
                    Some(&content),
                );
            }
            outcome.errors.extend(result.error);
            outcome.issues.extend(result.issues);
            fixes.extend(result.fixes);
        }
        outcome.processed = true;

        if options.fix && !fixes.is_empty() {
            if options.dry_run {
                log::info!(
                    "Dry run: would apply {} fix(es) to {}",
                    fixes.len(),
                    path.display()
                );
            } else {
                self.apply_fixes(vault_path, path, &content, fixes, &mut outcome)
                    .await;
            }
        }
        outcome
    }

    async fn lint_in_process(
        &self,
        vault_path: &Path,
        path: &Path,
        content: &str,
        rules: &[Arc<dyn Rule>],
        indices: &[usize],
        options: RunOptions,
    ) -> Vec<RuleOutcome> {
        let selected: Vec<Arc<dyn Rule>> =
            indices.iter().map(|&index| rules[index].clone()).collect();
        let mut context = RuleContext::new(self.parser.parse(path, content), vault_path);
        context.dry_run = options.dry_run;
        context.verbose = options.verbose;
        let executor = self.executor.clone();
        smol::unblock(move || run_rules(&executor, &selected, &context, options.fix)).await
    }

    async fn lint_in_worker(
        &self,
        dispatcher: &TaskDispatcher,
        vault_path: &Path,
        path: &Path,
        content: &str,
        specs: &[RuleSpec],
        indices: &[usize],
        options: RunOptions,
    ) -> Vec<RuleOutcome> {
        let selected: Vec<RuleSpec> = indices.iter().map(|&index| specs[index].clone()).collect();
        let task = LintFileTask {
            path: path.to_path_buf(),
            content: content.to_string(),
            vault_path: vault_path.to_path_buf(),
            rules: selected.clone(),
            fix: options.fix,
            dry_run: options.dry_run,
            verbose: options.verbose,
        };

        let failure = |message: String| -> Vec<RuleOutcome> {
            selected
                .iter()
                .map(|spec| RuleOutcome {
                    rule: spec.identity.clone(),
                    issues: Vec::new(),
                    fixes: Vec::new(),
                    execution_time_ms: 0,
                    error: Some(ProcessingError {
                        kind: ProcessingErrorKind::Dispatch,
                        rule: Some(spec.identity.full.clone()),
                        file: Some(path.to_path_buf()),
                        fs_kind: None,
                        message: message.clone(),
                    }),
                    cached: false,
                })
                .collect()
        };

        let data = match serde_json::to_value(&task) {
            Ok(data) => data,
            Err(error) => return failure(format!("could not encode lint task: {error}")),
        };
        match dispatcher.submit(LINT_FILE_TASK, data, 0).await {
            Ok(value) => match serde_json::from_value::<Vec<RuleOutcome>>(value) {
                Ok(outcomes) if outcomes.len() == selected.len() => outcomes,
                Ok(outcomes) => failure(format!(
                    "worker returned {} result(s) for {} rule(s)",
                    outcomes.len(),
                    selected.len()
                )),
                Err(error) => failure(format!("could not decode worker result: {error}")),
            },
            Err(error) => {
                log::warn!("Lint task for {} failed: {error}", path.display());
                failure(error.to_string())
            }
        }
    }

    /// Claim `path` for mutation. `None` when another mutation holds it.
    fn reserve_path(&self, path: &Path) -> Option<PathReservation<'_>> {
        let mut paths = self.mutating.lock();
        if !paths.insert(path.to_path_buf()) {
            return None;
        }
        Some(PathReservation {
            paths: &self.mutating,
            path: path.to_path_buf(),
        })
    }

    /// Apply `fixes` to one file in order, each against the result of the
    /// ones before it. A fix whose changes no longer apply is skipped and
    /// reported. Renames are queued for after the run.
    async fn apply_fixes(
        &self,
        vault_path: &Path,
        path: &Path,
        original: &str,
        fixes: Vec<Fix>,
        outcome: &mut FileOutcome,
    ) {
        let Some(_reservation) = self.reserve_path(path) else {
            for fix in &fixes {
                outcome.errors.push(ProcessingError::fix_conflict(
                    &fix.rule_id,
                    path,
                    "another mutation of this file is in flight",
                ));
            }
            return;
        };

        let mut content = original.to_string();
        let mut text_fixes = Vec::new();
        let mut moves = Vec::new();
        for fix in fixes {
            let next = match apply_text_changes(&content, &fix.changes) {
                Ok(next) => next,
                Err(error) => {
                    log::warn!(
                        "Skipping fix `{}` from {} on {}: {error}",
                        fix.description,
                        fix.rule_id,
                        path.display()
                    );
                    outcome.errors.push(ProcessingError::fix_conflict(
                        &fix.rule_id,
                        path,
                        format!("skipped fix `{}`: {error}", fix.description),
                    ));
                    continue;
                }
            };
            content = next;
            let requested_move = fix.changes.iter().find_map(|change| match change {
                FileChange::Move {
                    from,
                    to,
                    update_links,
                } => Some((vault_path.join(from), vault_path.join(to), *update_links)),
                _ => None,
            });
            match requested_move {
                Some((from, to, update_links)) => moves.push(PendingMove {
                    fix,
                    from,
                    to,
                    update_links,
                }),
                None => text_fixes.push(fix),
            }
        }

        if content != original {
            let written = {
                let writer = self.writer.clone();
                let path = path.to_path_buf();
                smol::unblock(move || writer.write(&path, &content, WriteOptions::default())).await
            };
            match written {
                Ok(write) => {
                    log::info!(
                        "Applied {} fix(es) to {}{}",
                        text_fixes.len() + moves.len(),
                        path.display(),
                        if write.backup_created() { " (backed up)" } else { "" }
                    );
                    self.cache.invalidate(path);
                }
                Err(error) => {
                    log::error!("{error}");
                    let error = ProcessingError::file_system(&error);
                    for fix in text_fixes.iter().chain(moves.iter().map(|pending| &pending.fix)) {
                        outcome.errors.push(error.clone().with_rule(&fix.rule_id));
                    }
                    return;
                }
            }
        }
        outcome.fixes_applied.extend(text_fixes);
        outcome.moves.extend(moves);
    }

    /// Apply queued renames one at a time, then point links at the new names.
    async fn apply_moves(
        &self,
        vault_path: &Path,
        moves: Vec<PendingMove>,
        totals: &mut RunTotals,
    ) {
        for pending in moves {
            let Some(_from) = self.reserve_path(&pending.from) else {
                totals.errors.push(ProcessingError::fix_conflict(
                    &pending.fix.rule_id,
                    &pending.from,
                    "another mutation of this file is in flight",
                ));
                continue;
            };
            let moved = {
                let writer = self.writer.clone();
                let (from, to) = (pending.from.clone(), pending.to.clone());
                smol::unblock(move || writer.move_file(&from, &to, MoveOptions::default())).await
            };
            if let Err(error) = moved {
                log::error!("{error}");
                totals
                    .errors
                    .push(ProcessingError::file_system(&error).with_rule(&pending.fix.rule_id));
                continue;
            }
            log::info!("Moved {} to {}", pending.from.display(), pending.to.display());
            self.cache.invalidate(&pending.from);
            self.cache.invalidate(&pending.to);

            if pending.update_links {
                let errors = self.update_links(vault_path, &pending.from, &pending.to).await;
                totals
                    .errors
                    .extend(errors.into_iter().map(|error| error.with_rule(&pending.fix.rule_id)));
            }
            totals.fixes_applied.push(pending.fix);
        }
    }

    async fn update_links(
        &self,
        vault_path: &Path,
        from: &Path,
        to: &Path,
    ) -> Vec<ProcessingError> {
        let (Some(old_stem), Some(new_stem)) = (file_stem(from), file_stem(to)) else {
            return Vec::new();
        };
        let mut errors = Vec::new();
        for note in self.scan_vault(vault_path).await {
            if note == to {
                continue;
            }
            let Some(_reservation) = self.reserve_path(&note) else {
                continue;
            };
            let writer = self.writer.clone();
            let (old_stem, new_stem, path) = (old_stem.clone(), new_stem.clone(), note.clone());
            let rewritten = smol::unblock(move || -> Result<bool, FileError> {
                let content = read_current(&writer, &path)?;
                match rewrite_wiki_links(&content, &old_stem, &new_stem) {
                    Some(updated) => {
                        writer.write(&path, &updated, WriteOptions::default())?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
            .await;
            match rewritten {
                Ok(true) => {
                    log::debug!("Updated links in {}", note.display());
                    self.cache.invalidate(&note);
                }
                Ok(false) => {}
                Err(error) => {
                    log::warn!("{error}");
                    errors.push(ProcessingError::file_system(&error));
                }
            }
        }
        errors
    }

    pub fn validate_health(&self) -> HealthReport {
        let mut report = HealthReport::default();

        match load_rule_specs(&self.profile.rules_dir) {
            Ok(specs) => {
                let conflicts = detect_conflicts(&specs);
                if !conflicts.valid {
                    report.issues.push(conflicts.summary.clone());
                }
                report.warnings.extend(
                    conflicts
                        .conflicts
                        .iter()
                        .filter(|group| group.severity == ConflictSeverity::Warning)
                        .map(|group| group.resolution.clone()),
                );
                if let Err(error) = self.factory.create_all(&specs) {
                    report.issues.push(error.to_string());
                }
            }
            Err(error) => report.issues.push(error.to_string()),
        }

        if !self.governor.is_memory_safe() {
            report
                .warnings
                .push(format!("memory pressure is {:?}", self.governor.pressure()));
        }

        let stats = self.cache.stats();
        if stats.lookups() >= MIN_LOOKUPS_FOR_HIT_RATE && stats.hit_rate < LOW_HIT_RATE {
            report.warnings.push(format!(
                "cache hit rate is {:.1}% over {} lookups",
                stats.hit_rate * 100.0,
                stats.lookups()
            ));
        }

        if let Err(error) = probe_writable(&self.writer.config().backup_dir) {
            report.issues.push(format!(
                "backup directory {} is not writable: {error}",
                self.writer.config().backup_dir.display()
            ));
        }

        report.healthy = report.issues.is_empty();
        report
    }

    pub fn get_metrics(&self) -> OrchestratorMetrics {
        let cpus = cpu_count();
        let max_concurrency = self
            .profile
            .options
            .max_concurrency
            .unwrap_or(self.profile.dispatcher.max_workers)
            .max(1);
        let strategy = self.governor.batching_strategy();
        OrchestratorMetrics {
            max_concurrency,
            cpu_count: cpus,
            recommended_concurrency: cpus
                .min(max_concurrency)
                .min(strategy.recommended_batch_size)
                .max(1),
            cache_stats: self.cache.stats(),
            memory_stats: self.governor.stats(),
        }
    }

    /// Persist the cache and release the worker pool and sampler.
    pub fn shutdown(&self) {
        self.stop.stop();
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.shutdown();
        }
        self.governor.stop();
        self.cache.shutdown();
    }
}

fn install_relief_hook(governor: &MemoryGovernor, cache: &Arc<ModificationCache>) {
    let cache = Arc::downgrade(cache);
    governor.on_relief(Arc::new(move |sample: &MemorySample| {
        if let Some(cache) = cache.upgrade() {
            let released = cache.relieve_pressure();
            log::info!(
                "Memory at {:.1}%, released {released} cache entries",
                sample.percent()
            );
        }
    }));
}

/// The file's own content. Content only a backup could supply is an error,
/// never something to lint or rewrite.
fn read_current(writer: &DurableFileWriter, path: &Path) -> Result<String, FileError> {
    let read = writer.read(path)?;
    match read.from_backup {
        Some(backup) => Err(FileError::OnlyInBackup {
            path: path.to_path_buf(),
            backup,
        }),
        None => Ok(read.content),
    }
}

fn is_reusable(cached: &RuleExecutionResult, hash: &str, fix: bool) -> bool {
    cached.file_hash == hash
        && (!fix || !cached.fixes.is_empty() || !cached.issues.iter().any(|issue| issue.fixable))
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|name| name.starts_with('.'))
}

fn is_note(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("md"))
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
}

fn average_size_mb(paths: &[PathBuf]) -> f64 {
    if paths.is_empty() {
        return 0.0;
    }
    let total: u64 = paths
        .iter()
        .filter_map(|path| std::fs::metadata(path).ok())
        .map(|metadata| metadata.len())
        .sum();
    total as f64 / paths.len() as f64 / BYTES_PER_MB
}

fn probe_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(format!(".vault-lint-probe-{}", std::process::id()));
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)
}
