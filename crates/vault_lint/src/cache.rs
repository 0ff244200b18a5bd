//! Per-file modification cache with per-rule results.
//!
//! All bookkeeping (entries, access order, hit counters) lives behind one
//! mutex so concurrent file completions never observe a half-updated state.

use crate::types::{
    FileRecord, Fix, Issue, RuleExecutionResult, RuleIdentity, content_hash, duration_millis,
    now_millis, unix_millis,
};
use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const PERSISTED_VERSION: u32 = 1;

/// Milliseconds since the unix epoch. Injectable so TTL behavior is testable.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_memory_mb: f64,
    pub ttl: Duration,
    /// Where the cache is persisted; `None` keeps it in memory only.
    pub persist_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_memory_mb: 100.0,
            ttl: Duration::from_secs(24 * 60 * 60),
            persist_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub record: FileRecord,
    /// Keyed by full rule identity.
    pub results: BTreeMap<String, RuleExecutionResult>,
    pub cached_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub memory_bytes: u64,
    pub oldest_entry_age_ms: Option<u64>,
    pub newest_entry_age_ms: Option<u64>,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

/// On-disk form of the cache.
#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedCache {
    #[serde(default)]
    version: u32,
    entries: HashMap<PathBuf, CacheEntry>,
    /// Least recently used first.
    access_order: Vec<PathBuf>,
    hits: u64,
    misses: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<PathBuf, CacheEntry>,
    /// Last access tick of every cached path.
    ticks: HashMap<PathBuf, u64>,
    /// Paths by access tick, least recently used first.
    order: BTreeMap<u64, PathBuf>,
    next_tick: u64,
    memory_bytes: u64,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn from_persisted(persisted: PersistedCache) -> Self {
        let mut state = Self {
            hits: persisted.hits,
            misses: persisted.misses,
            ..Self::default()
        };
        state.memory_bytes = persisted.entries.values().map(estimate_entry_bytes).sum();
        state.entries = persisted.entries;
        for path in &persisted.access_order {
            if state.entries.contains_key(path) {
                state.touch(path);
            }
        }
        // Entries missing from the order list go after the known ones.
        let mut missing: Vec<PathBuf> = state
            .entries
            .keys()
            .filter(|path| !state.ticks.contains_key(*path))
            .cloned()
            .collect();
        missing.sort();
        for path in &missing {
            state.touch(path);
        }
        state
    }

    fn to_persisted(&self) -> PersistedCache {
        PersistedCache {
            version: PERSISTED_VERSION,
            entries: self.entries.clone(),
            access_order: self.order.values().cloned().collect(),
            hits: self.hits,
            misses: self.misses,
        }
    }

    fn touch(&mut self, path: &Path) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(previous) = self.ticks.insert(path.to_path_buf(), tick) {
            self.order.remove(&previous);
        }
        self.order.insert(tick, path.to_path_buf());
    }

    fn entry_bytes(&self, path: &Path) -> u64 {
        self.entries.get(path).map_or(0, estimate_entry_bytes)
    }

    fn replace_bytes(&mut self, before: u64, after: u64) {
        self.memory_bytes = self.memory_bytes.saturating_sub(before) + after;
    }

    fn remove(&mut self, path: &Path) -> Option<CacheEntry> {
        if let Some(tick) = self.ticks.remove(path) {
            self.order.remove(&tick);
        }
        let entry = self.entries.remove(path)?;
        self.replace_bytes(estimate_entry_bytes(&entry), 0);
        Some(entry)
    }

    fn pop_least_recent(&mut self) -> Option<CacheEntry> {
        let (_, path) = self.order.first_key_value()?;
        let path = path.clone();
        self.remove(&path)
    }
}

fn estimate_issue_bytes(issue: &Issue) -> u64 {
    (96 + issue.rule_id.len() + issue.message.len() + issue.file.as_os_str().len()) as u64
}

fn estimate_fix_bytes(fix: &Fix) -> u64 {
    (96 + fix.rule_id.len() + fix.description.len() + fix.changes.len() * 128) as u64
}

fn estimate_entry_bytes(entry: &CacheEntry) -> u64 {
    let record = 128 + entry.record.path.as_os_str().len() as u64;
    let results: u64 = entry
        .results
        .iter()
        .map(|(key, result)| {
            64 + key.len() as u64
                + result.file_hash.len() as u64
                + result.issues.iter().map(estimate_issue_bytes).sum::<u64>()
                + result.fixes.iter().map(estimate_fix_bytes).sum::<u64>()
        })
        .sum();
    record + results
}

pub struct ModificationCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    clock: Clock,
}

impl ModificationCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            clock: Arc::new(now_millis),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }

    fn is_expired(&self, entry: &CacheEntry, now: u64) -> bool {
        now.saturating_sub(entry.cached_at) > duration_millis(self.config.ttl)
    }

    /// Reload the persisted cache, if any. A missing, unreadable or corrupt
    /// file leaves the cache empty.
    pub fn initialize(&self) {
        let Some(path) = self.config.persist_path.as_ref() else {
            return;
        };
        let loaded = match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<PersistedCache>(&bytes) {
                Ok(persisted) if persisted.version == PERSISTED_VERSION => Some(persisted),
                Ok(persisted) => {
                    log::warn!(
                        "Ignoring persisted cache {} with unsupported version {}",
                        path.display(),
                        persisted.version
                    );
                    None
                }
                Err(error) => {
                    log::warn!(
                        "Persisted cache {} is corrupt, starting empty: {error}",
                        path.display()
                    );
                    None
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => {
                log::warn!("Failed to read persisted cache {}: {error}", path.display());
                None
            }
        };

        let mut state = self.state.lock();
        if let Some(persisted) = loaded {
            *state = CacheState::from_persisted(persisted);
            log::info!(
                "Loaded {} cache entries from {}",
                state.entries.len(),
                path.display()
            );
        }
        let now = self.now();
        self.purge_expired(&mut state, now);
    }

    /// Write the cache to its persistence file (write-temp-then-rename).
    pub fn flush(&self) -> Result<()> {
        let Some(path) = self.config.persist_path.as_ref() else {
            return Ok(());
        };
        let persisted = self.state.lock().to_persisted();
        let bytes = serde_json::to_vec(&persisted).context("failed to serialize cache")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let temp = path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&temp, &bytes)
            .with_context(|| format!("failed to write {}", temp.display()))?;
        if let Err(error) = std::fs::rename(&temp, path) {
            std::fs::remove_file(&temp).ok();
            return Err(error)
                .with_context(|| format!("failed to persist cache to {}", path.display()));
        }
        log::debug!("Persisted cache to {}", path.display());
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Err(error) = self.flush() {
            log::error!("Failed to persist cache: {error:#}");
        }
    }

    /// True when `path` is unknown, changed on disk since it was cached, or
    /// its entry outlived the TTL.
    pub fn needs_processing(&self, path: &Path) -> bool {
        let modified_at = match std::fs::metadata(path).and_then(|meta| meta.modified()) {
            Ok(modified) => unix_millis(modified),
            Err(_) => return true,
        };
        let now = self.now();

        let mut state = self.state.lock();
        let Some(entry) = state.entries.get(path) else {
            return true;
        };
        let stale = modified_at > entry.record.modified_at || self.is_expired(entry, now);
        if !stale {
            state.touch(path);
        }
        stale
    }

    /// Store (or replace) the result of `rule` for `path` and refresh the
    /// file's recorded metadata.
    pub fn cache_result(
        &self,
        path: &Path,
        rule: &RuleIdentity,
        issues: Vec<Issue>,
        fixes: Vec<Fix>,
        execution_time_ms: u64,
        content: Option<&str>,
    ) -> RuleExecutionResult {
        let now = self.now();
        let mut state = self.state.lock();
        let before = state.entry_bytes(path);
        let entry = self.refresh_entry(&mut state, path, content, now);
        let result = RuleExecutionResult {
            rule_identity: rule.clone(),
            issues,
            fixes,
            execution_time_ms,
            file_hash: entry.record.content_hash.clone().unwrap_or_default(),
        };
        entry.results.insert(rule.full.clone(), result.clone());
        let after = estimate_entry_bytes(entry);
        state.replace_bytes(before, after);
        state.touch(path);
        self.enforce_limits(&mut state, now);
        result
    }

    /// Record that `path` was processed without storing any rule result.
    pub fn mark_processed(&self, path: &Path, content: Option<&str>) {
        let now = self.now();
        let mut state = self.state.lock();
        let before = state.entry_bytes(path);
        let after = estimate_entry_bytes(self.refresh_entry(&mut state, path, content, now));
        state.replace_bytes(before, after);
        state.touch(path);
        self.enforce_limits(&mut state, now);
    }

    fn refresh_entry<'a>(
        &self,
        state: &'a mut CacheState,
        path: &Path,
        content: Option<&str>,
        now: u64,
    ) -> &'a mut CacheEntry {
        // The file may be gone by now; fall back to what the caller knows.
        let (size, modified_at) = match std::fs::metadata(path) {
            Ok(meta) => (
                meta.len(),
                meta.modified().map(unix_millis).unwrap_or(now),
            ),
            Err(_) => (content.map_or(0, |content| content.len() as u64), now),
        };
        let hash = content.map(|content| content_hash(content.as_bytes()));

        let entry = state
            .entries
            .entry(path.to_path_buf())
            .or_insert_with(|| CacheEntry {
                record: FileRecord {
                    path: path.to_path_buf(),
                    size,
                    modified_at,
                    content_hash: None,
                    last_processed_at: now,
                },
                results: BTreeMap::new(),
                cached_at: now,
            });

        if hash.is_some() && hash != entry.record.content_hash {
            // Results computed against other content are superseded.
            entry.results.clear();
        }
        entry.record.size = size;
        entry.record.modified_at = modified_at;
        if hash.is_some() {
            entry.record.content_hash = hash;
        }
        entry.record.last_processed_at = now;
        entry.cached_at = now;
        entry
    }

    pub fn get_result(&self, path: &Path, rule: &str) -> Option<RuleExecutionResult> {
        let mut state = self.state.lock();
        let result = state
            .entries
            .get(path)
            .and_then(|entry| entry.results.get(rule))
            .cloned();
        match result {
            Some(result) => {
                state.hits += 1;
                state.touch(path);
                Some(result)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    pub fn record(&self, path: &Path) -> Option<FileRecord> {
        self.state
            .lock()
            .entries
            .get(path)
            .map(|entry| entry.record.clone())
    }

    pub fn invalidate(&self, path: &Path) -> bool {
        self.state.lock().remove(path).is_some()
    }

    pub fn clear(&self) {
        *self.state.lock() = CacheState::default();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Purge expired entries and evict the least recently used quarter.
    /// Returns how many entries were dropped.
    pub fn relieve_pressure(&self) -> usize {
        let now = self.now();
        let mut state = self.state.lock();
        let before = state.entries.len();
        self.purge_expired(&mut state, now);
        let quarter = state.entries.len().div_ceil(4);
        for _ in 0..quarter {
            if state.pop_least_recent().is_none() {
                break;
            }
        }
        let dropped = before - state.entries.len();
        if dropped > 0 {
            log::info!("Dropped {dropped} cache entries to relieve memory pressure");
        }
        dropped
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.now();
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        let ages = state
            .entries
            .values()
            .map(|entry| now.saturating_sub(entry.cached_at));
        CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
            memory_bytes: state.memory_bytes,
            oldest_entry_age_ms: ages.clone().max(),
            newest_entry_age_ms: ages.min(),
        }
    }

    fn purge_expired(&self, state: &mut CacheState, now: u64) {
        let expired: Vec<PathBuf> = state
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &expired {
            state.remove(path);
        }
        if !expired.is_empty() {
            log::debug!("Purged {} expired cache entries", expired.len());
        }
    }

    fn enforce_limits(&self, state: &mut CacheState, now: u64) {
        self.purge_expired(state, now);

        let max_bytes = (self.config.max_memory_mb * 1024.0 * 1024.0) as u64;
        let mut evicted = 0;
        while state.entries.len() > self.config.max_entries || state.memory_bytes > max_bytes {
            if state.pop_least_recent().is_none() {
                break;
            }
            evicted += 1;
        }
        if evicted > 0 {
            log::debug!("Evicted {evicted} least recently used cache entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::SystemTime;

    fn manual_clock() -> (Arc<AtomicU64>, Clock) {
        let time = Arc::new(AtomicU64::new(now_millis()));
        let clock_time = time.clone();
        (time, Arc::new(move || clock_time.load(Ordering::SeqCst)))
    }

    fn rule() -> RuleIdentity {
        RuleIdentity::new("x", "a")
    }

    fn issue(file: &Path) -> Issue {
        Issue {
            rule_id: "x.a".into(),
            severity: Severity::Warning,
            message: "m".into(),
            file: file.to_path_buf(),
            line: Some(1),
            column: None,
            fixable: false,
        }
    }

    #[test]
    fn test_needs_processing_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.md");
        std::fs::write(&path, "hello").unwrap();

        let (time, clock) = manual_clock();
        let cache = ModificationCache::new(CacheConfig {
            ttl: Duration::from_secs(60),
            ..Default::default()
        })
        .with_clock(clock);

        assert!(cache.needs_processing(&path));
        cache.cache_result(&path, &rule(), vec![issue(&path)], vec![], 3, Some("hello"));
        assert!(!cache.needs_processing(&path));

        let later = SystemTime::now() + Duration::from_secs(10);
        File::options().write(true).open(&path).unwrap().set_modified(later).unwrap();
        assert!(cache.needs_processing(&path));

        cache.cache_result(&path, &rule(), vec![], vec![], 1, Some("hello"));
        assert!(!cache.needs_processing(&path));
        time.fetch_add(61_000, Ordering::SeqCst);
        assert!(cache.needs_processing(&path));
    }

    #[test]
    fn test_get_result_counts_hits_and_misses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.md");
        std::fs::write(&path, "hello").unwrap();
        let cache = ModificationCache::new(CacheConfig::default());

        assert!(cache.get_result(&path, "x.a").is_none());
        let stored =
            cache.cache_result(&path, &rule(), vec![issue(&path)], vec![], 3, Some("hello"));
        assert_eq!(stored.file_hash, content_hash(b"hello"));
        assert_eq!(cache.get_result(&path, "x.a"), Some(stored));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_rate, 0.5);
        assert!(stats.memory_bytes > 0);
    }

    #[test]
    fn test_deleted_file_falls_back_to_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.md");
        let cache = ModificationCache::new(CacheConfig::default());
        cache.cache_result(&path, &rule(), vec![], vec![], 0, Some("12345"));
        let record = cache.record(&path).unwrap();
        assert_eq!(record.size, 5);
        assert!(cache.needs_processing(&path));
    }

    #[test]
    fn test_lru_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = ["a.md", "b.md", "c.md"]
            .iter()
            .map(|name| {
                let path = dir.path().join(name);
                std::fs::write(&path, name).unwrap();
                path
            })
            .collect();

        let cache = ModificationCache::new(CacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        cache.cache_result(&paths[0], &rule(), vec![], vec![], 0, None);
        cache.cache_result(&paths[1], &rule(), vec![], vec![], 0, None);
        // Touch `a` so `b` becomes least recently used.
        assert!(cache.get_result(&paths[0], "x.a").is_some());
        cache.cache_result(&paths[2], &rule(), vec![], vec![], 0, None);

        assert_eq!(cache.len(), 2);
        assert!(cache.get_result(&paths[1], "x.a").is_none());
        assert!(cache.get_result(&paths[0], "x.a").is_some());
        assert!(cache.get_result(&paths[2], "x.a").is_some());
    }

    #[test]
    fn test_changed_content_supersedes_results() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.md");
        std::fs::write(&path, "one").unwrap();
        let cache = ModificationCache::new(CacheConfig::default());
        cache.cache_result(&path, &rule(), vec![], vec![], 0, Some("one"));
        cache.cache_result(&path, &RuleIdentity::new("y", "b"), vec![], vec![], 0, Some("two"));
        assert!(cache.get_result(&path, "x.a").is_none());
        assert!(cache.get_result(&path, "y.b").is_some());
    }

    #[test]
    fn test_persistence_round_trip_and_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let note = dir.path().join("a.md");
        std::fs::write(&note, "hello").unwrap();
        let persist_path = dir.path().join("cache/state.json");
        let config = CacheConfig {
            persist_path: Some(persist_path.clone()),
            ..Default::default()
        };

        let cache = ModificationCache::new(config.clone());
        cache.cache_result(&note, &rule(), vec![issue(&note)], vec![], 2, Some("hello"));
        cache.shutdown();
        assert!(persist_path.exists());

        let reloaded = ModificationCache::new(config.clone());
        reloaded.initialize();
        assert!(!reloaded.needs_processing(&note));
        assert_eq!(reloaded.get_result(&note, "x.a").unwrap().issues.len(), 1);

        std::fs::write(&persist_path, "{ not json").unwrap();
        let degraded = ModificationCache::new(config);
        degraded.initialize();
        assert!(degraded.is_empty());
    }

    #[test]
    fn test_initialize_drops_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let note = dir.path().join("a.md");
        std::fs::write(&note, "hello").unwrap();
        let config = CacheConfig {
            ttl: Duration::from_secs(60),
            persist_path: Some(dir.path().join("state.json")),
            ..Default::default()
        };
        let cache = ModificationCache::new(config.clone());
        cache.cache_result(&note, &rule(), vec![], vec![], 0, None);
        cache.flush().unwrap();

        let (time, clock) = manual_clock();
        time.fetch_add(120_000, Ordering::SeqCst);
        let reloaded = ModificationCache::new(config).with_clock(clock);
        reloaded.initialize();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_memory_accounting_tracks_every_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModificationCache::new(CacheConfig::default());
        let recomputed = |cache: &ModificationCache| -> u64 {
            cache
                .state
                .lock()
                .entries
                .values()
                .map(estimate_entry_bytes)
                .sum()
        };

        let a = dir.path().join("a.md");
        let b = dir.path().join("b.md");
        cache.cache_result(&a, &rule(), vec![issue(&a)], vec![], 0, Some("one"));
        let other = RuleIdentity::new("y", "b");
        cache.cache_result(&a, &other, vec![issue(&a)], vec![], 0, Some("one"));
        cache.mark_processed(&b, Some("two"));
        assert_eq!(cache.stats().memory_bytes, recomputed(&cache));

        // New content supersedes both results of `a`.
        cache.cache_result(&a, &rule(), vec![], vec![], 0, Some("changed"));
        assert_eq!(cache.stats().memory_bytes, recomputed(&cache));

        cache.invalidate(&b);
        cache.relieve_pressure();
        assert_eq!(cache.stats().memory_bytes, recomputed(&cache));
        assert_eq!(cache.stats().memory_bytes, 0);
    }

    #[test]
    fn test_persisted_access_order_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = ["a.md", "b.md", "c.md"]
            .iter()
            .map(|name| dir.path().join(name))
            .collect();
        let config = CacheConfig {
            persist_path: Some(dir.path().join("state.json")),
            ..Default::default()
        };
        let cache = ModificationCache::new(config.clone());
        for path in &paths {
            cache.cache_result(path, &rule(), vec![], vec![], 0, Some("x"));
        }
        // `a` becomes the most recently used.
        assert!(cache.get_result(&paths[0], "x.a").is_some());
        cache.flush().unwrap();

        let reloaded = ModificationCache::new(CacheConfig {
            max_entries: 2,
            ..config
        });
        reloaded.initialize();
        reloaded.mark_processed(&dir.path().join("d.md"), Some("y"));
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.record(&paths[0]).is_some());
        assert!(reloaded.record(&paths[1]).is_none());
        assert!(reloaded.record(&paths[2]).is_none());
    }

    #[test]
    fn test_relieve_pressure_drops_a_quarter() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModificationCache::new(CacheConfig::default());
        for index in 0..8 {
            let path = dir.path().join(format!("{index}.md"));
            cache.cache_result(&path, &rule(), vec![], vec![], 0, Some("x"));
        }
        assert_eq!(cache.relieve_pressure(), 2);
        assert!(cache.record(&dir.path().join("0.md")).is_none());
        assert!(cache.record(&dir.path().join("7.md")).is_some());
        assert!(cache.invalidate(&dir.path().join("7.md")));
        assert_eq!(cache.len(), 5);
    }
}
