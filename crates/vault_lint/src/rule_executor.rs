//! Rule matching and guarded rule execution.
//!
//! Patterns are matched against the vault-relative path with `/` separators.
//! Matching is anchored: `*` and `?` never cross a `/`, while `**` spans zero
//! or more whole segments.

use crate::error::RuleExecutionError;
use crate::rule::{Rule, RuleConfig, RuleContext};
use crate::types::{Fix, Issue, RawFix, RawIssue, RuleIdentity, Severity};
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

fn build_glob(pattern: &str) -> Result<Glob, globset::Error> {
    GlobBuilder::new(pattern).literal_separator(true).build()
}

fn build_set(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(build_glob(pattern)?);
    }
    builder.build()
}

/// Whether a single glob matches the whole of `path`. Invalid globs never match.
pub fn glob_matches(pattern: &str, path: &str) -> bool {
    build_glob(pattern)
        .map(|glob| glob.compile_matcher().is_match(path))
        .unwrap_or(false)
}

/// The compiled applicability of one rule.
#[derive(Debug)]
pub struct PathFilter {
    deny: GlobSet,
    allow: Option<GlobSet>,
    include: GlobSet,
    exclude: GlobSet,
}

impl PathFilter {
    pub fn new(config: &RuleConfig) -> Result<Self, globset::Error> {
        Ok(Self {
            deny: build_set(&config.path_denylist)?,
            allow: if config.path_allowlist.is_empty() {
                None
            } else {
                Some(build_set(&config.path_allowlist)?)
            },
            include: build_set(&config.include_patterns)?,
            exclude: build_set(&config.exclude_patterns)?,
        })
    }

    /// Deny wins over everything. A non-empty allowlist replaces the
    /// include/exclude pair.
    pub fn matches(&self, relative_path: &str) -> bool {
        if self.deny.is_match(relative_path) {
            return false;
        }
        if let Some(allow) = &self.allow {
            return allow.is_match(relative_path);
        }
        self.include.is_match(relative_path) && !self.exclude.is_match(relative_path)
    }
}

/// Identifies a compiled filter. Two rules sharing an identity but not their
/// patterns get separate filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FilterKey {
    identity: String,
    allow: Vec<String>,
    deny: Vec<String>,
    include: Vec<String>,
    exclude: Vec<String>,
}

impl FilterKey {
    fn new(identity: &RuleIdentity, config: &RuleConfig) -> Self {
        Self {
            identity: identity.full.clone(),
            allow: config.path_allowlist.clone(),
            deny: config.path_denylist.clone(),
            include: config.include_patterns.clone(),
            exclude: config.exclude_patterns.clone(),
        }
    }
}

/// Matches rules to paths and runs their lint and fix capabilities,
/// turning whatever a rule returns into well-formed issues and fixes.
#[derive(Default)]
pub struct RuleExecutor {
    filters: Mutex<HashMap<FilterKey, Option<Arc<PathFilter>>>>,
}

impl RuleExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn filter_for(&self, rule: &dyn Rule) -> Option<Arc<PathFilter>> {
        let mut filters = self.filters.lock();
        filters
            .entry(FilterKey::new(rule.identity(), rule.config()))
            .or_insert_with(|| match PathFilter::new(rule.config()) {
                Ok(filter) => Some(Arc::new(filter)),
                Err(error) => {
                    log::warn!(
                        "Rule {} has an invalid path pattern and will match nothing: {error}",
                        rule.identity()
                    );
                    None
                }
            })
            .clone()
    }

    pub fn matches(&self, rule: &dyn Rule, relative_path: &str) -> bool {
        self.filter_for(rule)
            .is_some_and(|filter| filter.matches(relative_path))
    }

    /// The subset of `rules` applicable to `relative_path`, in input order.
    pub fn filter_rules_by_path(
        &self,
        rules: &[Arc<dyn Rule>],
        relative_path: &str,
    ) -> Vec<Arc<dyn Rule>> {
        rules
            .iter()
            .filter(|rule| self.matches(rule.as_ref(), relative_path))
            .cloned()
            .collect()
    }

    pub fn execute_rule(
        &self,
        rule: &dyn Rule,
        context: &RuleContext,
    ) -> Result<Vec<Issue>, RuleExecutionError> {
        if !self.matches(rule, &context.relative_path()) {
            return Ok(Vec::new());
        }

        let raw = guarded(rule, &context.file.path, || rule.lint(context))?;
        Ok(raw
            .into_iter()
            .map(|issue| normalize_issue(issue, rule.identity(), &context.file.path))
            .collect())
    }

    pub fn execute_fix(
        &self,
        rule: &dyn Rule,
        context: &RuleContext,
        issues: &[Issue],
    ) -> Result<Vec<Fix>, RuleExecutionError> {
        if !rule.can_fix() || !self.matches(rule, &context.relative_path()) {
            return Ok(Vec::new());
        }

        let owned: Vec<Issue> = issues
            .iter()
            .filter(|issue| issue.fixable && issue.rule_id == rule.identity().full)
            .cloned()
            .collect();
        if owned.is_empty() {
            return Ok(Vec::new());
        }

        let raw = guarded(rule, &context.file.path, || rule.fix(context, &owned))?;
        Ok(raw
            .into_iter()
            .filter_map(|fix| normalize_fix(fix, rule.identity(), &context.file.path))
            .collect())
    }
}

/// Run a rule capability, converting both errors and panics into
/// [`RuleExecutionError`].
fn guarded<T>(
    rule: &dyn Rule,
    path: &Path,
    f: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T, RuleExecutionError> {
    let identity = &rule.identity().full;
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(RuleExecutionError::new(identity, path, error)),
        Err(payload) => Err(RuleExecutionError::new(
            identity,
            path,
            anyhow::anyhow!("rule panicked: {}", panic_message(payload.as_ref())),
        )),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn normalize_issue(raw: RawIssue, rule: &RuleIdentity, file: &Path) -> Issue {
    Issue {
        rule_id: raw
            .rule_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| rule.full.clone()),
        severity: raw
            .severity
            .as_deref()
            .and_then(Severity::parse)
            .unwrap_or(Severity::Warning),
        message: raw
            .message
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| format!("{rule} reported an issue")),
        file: raw.file.unwrap_or_else(|| file.to_path_buf()),
        line: raw.line.filter(|line| *line > 0),
        column: raw.column.filter(|column| *column > 0),
        fixable: raw.fixable.unwrap_or(false),
    }
}

fn normalize_fix(raw: RawFix, rule: &RuleIdentity, file: &Path) -> Option<Fix> {
    if raw.changes.is_empty() {
        log::debug!("Dropping empty fix from {rule} for {}", file.display());
        return None;
    }
    Some(Fix {
        rule_id: raw
            .rule_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| rule.full.clone()),
        file: raw.file.unwrap_or_else(|| file.to_path_buf()),
        description: raw
            .description
            .filter(|description| !description.trim().is_empty())
            .unwrap_or_else(|| format!("fix from {rule}")),
        changes: raw.changes,
    })
}
