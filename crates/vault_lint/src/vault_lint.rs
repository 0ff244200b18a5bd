//! Vault Lint: lints a vault of markdown notes against a pluggable rule set
//! and applies fixes without risking the files on disk.
//!
//! The pieces compose leaf-first:
//! - [`ModificationCache`] remembers what each file looked like and what each
//!   rule found, so unchanged work is skipped
//! - [`detect_conflicts`] rejects rule sets where two rules claim one family
//! - [`RuleExecutor`] matches rules to paths and normalizes what they return
//! - [`MemoryGovernor`] shrinks batches or pauses under memory pressure
//! - [`TaskDispatcher`] runs lint tasks on a bounded worker pool
//! - [`DurableFileWriter`] writes atomically, with backups and retries
//! - [`LintOrchestrator`] drives a whole run

pub mod builtin_rules;
mod cache;
mod config;
mod conflict;
mod dispatcher;
mod error;
mod file_writer;
mod fix_applier;
mod lint_task;
mod memory_governor;
mod orchestrator;
mod parser;
mod rule;
mod rule_executor;
mod types;

pub use cache::*;
pub use config::*;
pub use conflict::*;
pub use dispatcher::*;
pub use error::*;
pub use file_writer::*;
pub use fix_applier::*;
pub use lint_task::*;
pub use memory_governor::*;
pub use orchestrator::*;
pub use parser::*;
pub use rule::*;
pub use rule_executor::*;
pub use types::*;
