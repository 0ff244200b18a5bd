//! Per-file rule execution, shared by the in-process path and the worker
//! pool. Work crossing into a worker is a plain [`LintFileTask`] record; the
//! worker rebuilds live rules from their specs with the factory.

use crate::dispatcher::{TaskHandler, WorkerTask};
use crate::error::{ProcessingError, ProcessingErrorKind};
use crate::parser::FileParser;
use crate::rule::{Rule, RuleContext, RuleFactory, RuleSpec};
use crate::rule_executor::RuleExecutor;
use crate::types::{Fix, Issue, RuleExecutionResult, RuleIdentity, duration_millis};
use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

pub const LINT_FILE_TASK: &str = "lint-file";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LintFileTask {
    pub path: PathBuf,
    pub content: String,
    pub vault_path: PathBuf,
    pub rules: Vec<RuleSpec>,
    pub fix: bool,
    pub dry_run: bool,
    pub verbose: bool,
}

/// What one rule produced for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleOutcome {
    pub rule: RuleIdentity,
    pub issues: Vec<Issue>,
    pub fixes: Vec<Fix>,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProcessingError>,
    /// Set when the outcome was served from the modification cache.
    #[serde(skip)]
    pub cached: bool,
}

impl RuleOutcome {
    fn failed(rule: RuleIdentity, error: ProcessingError, execution_time_ms: u64) -> Self {
        Self {
            rule,
            issues: Vec::new(),
            fixes: Vec::new(),
            execution_time_ms,
            error: Some(error),
            cached: false,
        }
    }

    pub fn from_cached(result: RuleExecutionResult) -> Self {
        Self {
            rule: result.rule_identity,
            issues: result.issues,
            fixes: result.fixes,
            execution_time_ms: result.execution_time_ms,
            error: None,
            cached: true,
        }
    }
}

/// Lint one file with one rule, then ask it for fixes when `fix` is set.
/// Failures end up in [`RuleOutcome::error`]; issues found before a failing
/// fix are kept.
pub fn run_rule(
    executor: &RuleExecutor,
    rule: &dyn Rule,
    context: &RuleContext,
    fix: bool,
) -> RuleOutcome {
    let started = Instant::now();
    let identity = rule.identity().clone();
    let issues = match executor.execute_rule(rule, context) {
        Ok(issues) => issues,
        Err(error) => {
            log::warn!("{error}");
            return RuleOutcome::failed(
                identity,
                ProcessingError::rule_execution(&error),
                duration_millis(started.elapsed()),
            );
        }
    };

    let mut outcome = RuleOutcome {
        rule: identity,
        issues,
        fixes: Vec::new(),
        execution_time_ms: 0,
        error: None,
        cached: false,
    };
    if fix {
        match executor.execute_fix(rule, context, &outcome.issues) {
            Ok(fixes) => outcome.fixes = fixes,
            Err(error) => {
                log::warn!("{error}");
                outcome.error = Some(ProcessingError::rule_execution(&error));
            }
        }
    }
    outcome.execution_time_ms = duration_millis(started.elapsed());
    outcome
}

/// Run `rules` over one file in order.
pub fn run_rules(
    executor: &RuleExecutor,
    rules: &[Arc<dyn Rule>],
    context: &RuleContext,
    fix: bool,
) -> Vec<RuleOutcome> {
    rules
        .iter()
        .map(|rule| run_rule(executor, rule.as_ref(), context, fix))
        .collect()
}

/// Worker-side handler for [`LINT_FILE_TASK`] tasks.
pub struct LintTaskHandler {
    factory: RuleFactory,
    executor: RuleExecutor,
    parser: Arc<dyn FileParser>,
}

impl LintTaskHandler {
    pub fn new(factory: RuleFactory, parser: Arc<dyn FileParser>) -> Self {
        Self {
            factory,
            executor: RuleExecutor::new(),
            parser,
        }
    }

    pub fn run(&self, task: LintFileTask) -> Vec<RuleOutcome> {
        let parsed = self.parser.parse(&task.path, &task.content);
        let mut context = RuleContext::new(parsed, task.vault_path);
        context.dry_run = task.dry_run;
        context.verbose = task.verbose;

        task.rules
            .into_iter()
            .map(|spec| {
                let identity = spec.identity.clone();
                match self.factory.create(spec) {
                    Ok(rule) => run_rule(&self.executor, rule.as_ref(), &context, task.fix),
                    Err(error) => {
                        let message = format!("could not build rule `{identity}`: {error:#}");
                        let error = ProcessingError {
                            kind: ProcessingErrorKind::RuleExecution,
                            rule: Some(identity.full.clone()),
                            file: Some(task.path.clone()),
                            fs_kind: None,
                            message,
                        };
                        RuleOutcome::failed(identity, error, 0)
                    }
                }
            })
            .collect()
    }
}

impl TaskHandler for LintTaskHandler {
    fn handle(&self, task: &WorkerTask) -> Result<Value> {
        if task.task_type != LINT_FILE_TASK {
            bail!("unsupported task type `{}`", task.task_type);
        }
        let payload: LintFileTask = serde_json::from_value(task.data.clone())
            .context("malformed lint task payload")?;
        let outcomes = self.run(payload);
        Ok(serde_json::to_value(outcomes)?)
    }
}
