use anyhow::{Context as _, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use vault_lint::{
    CONFIG_FILE_NAME, LintOrchestrator, LintResult, ResolvedProfile, RunOptions, VaultLintConfig,
};

#[derive(Parser)]
#[command(name = "vault-lint")]
#[command(about = "Lint and fix a vault of markdown notes.", long_about = None)]
struct Cli {
    /// Log debug output.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lint the vault, optionally applying fixes.
    Lint(LintArgs),
    /// Check that the profile, rules and environment are usable.
    Health(ProfileArgs),
    /// Print concurrency, cache and memory metrics as JSON.
    Metrics(ProfileArgs),
}

#[derive(Args)]
struct ProfileArgs {
    /// Vault root. Defaults to the configured root, then the current directory.
    vault: Option<PathBuf>,

    /// Configuration file. Searched for upwards from the vault when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Profile to use instead of the configured active one.
    #[arg(long)]
    profile: Option<String>,

    /// Rules directory to use without any configuration file.
    #[arg(long, conflicts_with_all = ["config", "profile"])]
    rules: Option<PathBuf>,
}

#[derive(Args)]
struct LintArgs {
    #[command(flatten)]
    profile: ProfileArgs,

    /// Apply fixes.
    #[arg(long)]
    fix: bool,

    /// Report what would be fixed without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Lint every file, ignoring the modification cache.
    #[arg(long)]
    no_incremental: bool,

    /// Lint on the current thread instead of the worker pool.
    #[arg(long)]
    no_parallel: bool,

    #[arg(long, value_name = "N")]
    max_concurrency: Option<usize>,

    /// Print the result as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Command::Lint(args) => lint(args, cli.verbose),
        Command::Health(args) => health(args),
        Command::Metrics(args) => metrics(args),
    }
}

fn resolve(args: &ProfileArgs) -> Result<(ResolvedProfile, PathBuf)> {
    let cwd = std::env::current_dir().context("failed to read the current directory")?;

    if let Some(rules) = &args.rules {
        let vault = args.vault.clone().unwrap_or_else(|| cwd.clone());
        let mut profile = ResolvedProfile::with_rules_dir(rules);
        profile.vault_root = Some(vault.clone());
        return Ok((profile, vault));
    }

    let search_from = args.vault.as_deref().unwrap_or(&cwd);
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => VaultLintConfig::discover(search_from).ok_or_else(|| {
            anyhow!(
                "no {CONFIG_FILE_NAME} found from {}; pass --config or --rules",
                search_from.display()
            )
        })?,
    };
    let config = VaultLintConfig::load(&config_path)?;
    let profile = config.resolve(args.profile.as_deref())?;
    let vault = args
        .vault
        .clone()
        .or_else(|| profile.vault_root.clone())
        .unwrap_or(cwd);
    Ok((profile, vault))
}

fn lint(args: LintArgs, verbose: bool) -> Result<ExitCode> {
    let (profile, vault) = resolve(&args.profile)?;
    let defaults = profile.options;
    let options = RunOptions {
        fix: args.fix || defaults.fix,
        dry_run: args.dry_run || defaults.dry_run,
        incremental: defaults.incremental && !args.no_incremental,
        parallel: defaults.parallel && !args.no_parallel,
        verbose: verbose || defaults.verbose,
        max_concurrency: args.max_concurrency.or(defaults.max_concurrency),
    };

    let orchestrator = LintOrchestrator::new(profile);
    if !args.json {
        orchestrator.on_progress(Arc::new(|current: usize, total: usize, message: &str| {
            log::debug!("[{current}/{total}] {message}");
        }));
    }

    let outcome = smol::block_on(orchestrator.process_vault(&vault, options));
    orchestrator.shutdown();
    let result = outcome?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&vault, &result, options);
    }

    if result.error_count() > 0 || !result.errors.is_empty() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn print_summary(vault: &Path, result: &LintResult, options: RunOptions) {
    for issue in &result.issues_found {
        let file = issue.file.strip_prefix(vault).unwrap_or(&issue.file);
        let location = match (issue.line, issue.column) {
            (Some(line), Some(column)) => format!(":{line}:{column}"),
            (Some(line), None) => format!(":{line}"),
            _ => String::new(),
        };
        println!(
            "{}{location}: {} [{}] {}",
            file.display(),
            issue.severity,
            issue.rule_id,
            issue.message
        );
    }
    for error in &result.errors {
        let file = error
            .file
            .as_deref()
            .map(|file| file.strip_prefix(vault).unwrap_or(file).display().to_string())
            .unwrap_or_default();
        eprintln!("error: {file} {}", error.message);
    }

    let fixes = if options.dry_run {
        "dry run, no fixes written".to_string()
    } else {
        format!("{} fix(es) applied", result.fixes_applied.len())
    };
    println!(
        "{} file(s), {} error(s), {} warning(s), {fixes}, {} processing error(s) in {}ms",
        result.files_processed,
        result.error_count(),
        result.warning_count(),
        result.errors.len(),
        result.duration_ms
    );
}

fn health(args: ProfileArgs) -> Result<ExitCode> {
    let (profile, _) = resolve(&args)?;
    let orchestrator = LintOrchestrator::new(profile);
    let report = orchestrator.validate_health();
    for issue in &report.issues {
        println!("issue: {issue}");
    }
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    if report.healthy {
        println!("healthy");
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn metrics(args: ProfileArgs) -> Result<ExitCode> {
    let (profile, _) = resolve(&args)?;
    let orchestrator = LintOrchestrator::new(profile);
    println!("{}", serde_json::to_string_pretty(&orchestrator.get_metrics())?);
    Ok(ExitCode::SUCCESS)
}
