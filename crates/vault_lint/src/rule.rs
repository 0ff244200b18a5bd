//! Rule contract, rule definitions and the identity-keyed rule factory.
//!
//! A [`RuleSpec`] is the plain, serializable description of a configured rule.
//! It is what gets loaded from a profile's rules directory and what crosses
//! the worker boundary; the live [`Rule`] is always rebuilt from it by a
//! [`RuleFactory`].

use crate::builtin_rules;
use crate::error::LintError;
use crate::parser::ParsedFile;
use crate::types::{Issue, RawFix, RawIssue, RuleIdentity};
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// Path applicability and free-form settings of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    pub path_allowlist: Vec<String>,
    pub path_denylist: Vec<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub settings: Value,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            path_allowlist: Vec::new(),
            path_denylist: Vec::new(),
            include_patterns: vec!["**/*".to_string()],
            exclude_patterns: Vec::new(),
            settings: Value::Object(Map::new()),
        }
    }
}

impl RuleConfig {
    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    pub fn string_list_setting(&self, key: &str) -> Option<Vec<String>> {
        let items = self.setting(key)?.as_array()?;
        Some(
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(rename = "id")]
    pub identity: RuleIdentity,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: RuleConfig,
}

fn default_enabled() -> bool {
    true
}

impl RuleSpec {
    pub fn new(identity: RuleIdentity, category: impl Into<String>) -> Self {
        Self {
            name: identity.full.clone(),
            identity,
            description: String::new(),
            category: category.into(),
            enabled: true,
            config: RuleConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RuleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_settings(mut self, settings: Value) -> Self {
        self.config.settings = settings;
        self
    }
}

/// Everything a rule sees while linting or fixing one file.
#[derive(Debug, Clone)]
pub struct RuleContext {
    pub file: ParsedFile,
    pub vault_path: PathBuf,
    pub dry_run: bool,
    pub verbose: bool,
    pub metadata: Map<String, Value>,
}

impl RuleContext {
    pub fn new(file: ParsedFile, vault_path: impl Into<PathBuf>) -> Self {
        Self {
            file,
            vault_path: vault_path.into(),
            dry_run: false,
            verbose: false,
            metadata: Map::new(),
        }
    }

    /// Path of the file relative to the vault root, with `/` separators.
    pub fn relative_path(&self) -> String {
        relative_to_vault(&self.vault_path, &self.file.path)
    }
}

pub(crate) fn relative_to_vault(vault: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(vault).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// The capability set every rule implementation provides.
pub trait Rule: Send + Sync {
    fn spec(&self) -> &RuleSpec;

    fn identity(&self) -> &RuleIdentity {
        &self.spec().identity
    }

    fn category(&self) -> &str {
        &self.spec().category
    }

    fn config(&self) -> &RuleConfig {
        &self.spec().config
    }

    fn lint(&self, context: &RuleContext) -> Result<Vec<RawIssue>>;

    /// Whether [`Rule::fix`] is implemented.
    fn can_fix(&self) -> bool {
        false
    }

    fn fix(&self, _context: &RuleContext, _issues: &[Issue]) -> Result<Vec<RawFix>> {
        Ok(Vec::new())
    }
}

pub type RuleConstructor = Arc<dyn Fn(RuleSpec) -> Result<Arc<dyn Rule>> + Send + Sync>;

/// Builds live rules from specs. Constructors are keyed either by a full
/// identity (`major.minor`) or by a `major` family; the full key wins.
#[derive(Clone, Default)]
pub struct RuleFactory {
    constructors: HashMap<String, RuleConstructor>,
}

impl RuleFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory with every built-in rule family registered.
    pub fn with_builtin_rules() -> Self {
        let mut factory = Self::new();
        builtin_rules::register(&mut factory);
        factory
    }

    pub fn register<F>(&mut self, key: impl Into<String>, constructor: F)
    where
        F: Fn(RuleSpec) -> Result<Arc<dyn Rule>> + Send + Sync + 'static,
    {
        self.constructors.insert(key.into(), Arc::new(constructor));
    }

    pub fn is_registered(&self, identity: &RuleIdentity) -> bool {
        self.constructors.contains_key(&identity.full)
            || self.constructors.contains_key(&identity.major)
    }

    pub fn create(&self, spec: RuleSpec) -> Result<Arc<dyn Rule>> {
        let constructor = self
            .constructors
            .get(&spec.identity.full)
            .or_else(|| self.constructors.get(&spec.identity.major))
            .with_context(|| format!("no rule implementation registered for `{}`", spec.identity))?;
        let identity = spec.identity.full.clone();
        constructor(spec).with_context(|| format!("failed to construct rule `{identity}`"))
    }

    /// Build every spec, failing the whole set on the first unknown or
    /// misconfigured rule.
    pub fn create_all(&self, specs: &[RuleSpec]) -> Result<Vec<Arc<dyn Rule>>, LintError> {
        specs
            .iter()
            .map(|spec| {
                self.create(spec.clone()).map_err(|error| {
                    LintError::config_with_source(
                        format!("cannot load rule `{}`", spec.identity),
                        error,
                    )
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RuleDocument {
    rule: RuleHeader,
    #[serde(default)]
    config: Option<RuleConfig>,
    #[serde(default)]
    settings: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RuleHeader {
    id: RuleIdentity,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

/// Parse one rule definition file.
pub fn parse_rule_file(path: &Path, contents: &str) -> Result<RuleSpec> {
    let document: RuleDocument = toml::from_str(contents)
        .with_context(|| format!("failed to parse rule definition {}", path.display()))?;

    let mut config = document.config.unwrap_or_default();
    if let Some(settings) = document.settings {
        config.settings = settings;
    }
    let header = document.rule;
    Ok(RuleSpec {
        name: header.name.unwrap_or_else(|| header.id.full.clone()),
        identity: header.id,
        description: header.description,
        category: header.category,
        enabled: header.enabled,
        config,
    })
}

/// Load every enabled rule definition under `rules_dir`, in sorted path
/// order. Anything below a `disabled/` directory is skipped.
pub fn load_rule_specs(rules_dir: &Path) -> Result<Vec<RuleSpec>, LintError> {
    if !rules_dir.is_dir() {
        return Err(LintError::config(format!(
            "rules directory {} does not exist",
            rules_dir.display()
        )));
    }

    let mut specs = Vec::new();
    let walker = WalkDir::new(rules_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !(entry.file_type().is_dir() && entry.file_name() == "disabled"));

    for entry in walker {
        let entry = entry.map_err(|error| {
            LintError::config_with_source(
                format!("failed to read rules directory {}", rules_dir.display()),
                error.into(),
            )
        })?;
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|ext| ext.to_str()) != Some("toml")
        {
            continue;
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read rule definition {}", path.display()))
            .and_then(|contents| parse_rule_file(path, &contents))
            .map_err(|error| {
                LintError::config_with_source(
                    format!("invalid rule file {}", path.display()),
                    error,
                )
            })?;

        if contents.enabled {
            specs.push(contents);
        } else {
            log::debug!("Skipping disabled rule {}", contents.identity);
        }
    }

    log::info!("Loaded {} rule(s) from {}", specs.len(), rules_dir.display());
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{FileParser, MarkdownParser};
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    struct Noop(RuleSpec);

    impl Rule for Noop {
        fn spec(&self) -> &RuleSpec {
            &self.0
        }

        fn lint(&self, _context: &RuleContext) -> Result<Vec<RawIssue>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_parse_rule_file() {
        let spec = parse_rule_file(
            Path::new("required.toml"),
            indoc! {r#"
                [rule]
                id = "frontmatter-required-fields.strict"
                name = "Required frontmatter"
                category = "frontmatter"

                [config]
                include_patterns = ["notes/**/*.md"]
                exclude_patterns = ["notes/drafts/**"]

                [settings]
                required_fields = ["title", "tags"]
            "#},
        )
        .unwrap();

        assert_eq!(spec.identity.major, "frontmatter-required-fields");
        assert_eq!(spec.name, "Required frontmatter");
        assert!(spec.enabled);
        assert_eq!(spec.config.include_patterns, vec!["notes/**/*.md"]);
        assert_eq!(
            spec.config.string_list_setting("required_fields"),
            Some(vec!["title".to_string(), "tags".to_string()])
        );
    }

    #[test]
    fn test_missing_config_section_uses_defaults() {
        let spec = parse_rule_file(Path::new("r.toml"), "[rule]\nid = \"a.b\"\n").unwrap();
        assert_eq!(spec.config, RuleConfig::default());
        assert_eq!(spec.name, "a.b");
    }

    #[test]
    fn test_load_rule_specs_skips_disabled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.toml"), "[rule]\nid = \"b.one\"\n").unwrap();
        std::fs::write(dir.path().join("a.toml"), "[rule]\nid = \"a.one\"\n").unwrap();
        std::fs::write(
            dir.path().join("off.toml"),
            "[rule]\nid = \"c.one\"\nenabled = false\n",
        )
        .unwrap();
        std::fs::create_dir(dir.path().join("disabled")).unwrap();
        std::fs::write(dir.path().join("disabled/d.toml"), "[rule]\nid = \"d.one\"\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let specs = load_rule_specs(dir.path()).unwrap();
        let ids: Vec<_> = specs.iter().map(|spec| spec.identity.full.as_str()).collect();
        assert_eq!(ids, vec!["a.one", "b.one"]);
    }

    #[test]
    fn test_load_rule_specs_reports_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.toml"), "[rule]\nid = \"nodot\"\n").unwrap();
        assert!(matches!(load_rule_specs(dir.path()), Err(LintError::Config { .. })));
        assert!(matches!(
            load_rule_specs(&dir.path().join("missing")),
            Err(LintError::Config { .. })
        ));
    }

    #[test]
    fn test_factory_prefers_full_identity() {
        let mut factory = RuleFactory::new();
        factory.register("x", |spec| Ok(Arc::new(Noop(spec)) as Arc<dyn Rule>));
        factory.register("x.special", |mut spec| {
            spec.description = "special".into();
            Ok(Arc::new(Noop(spec)) as Arc<dyn Rule>)
        });

        let generic = factory
            .create(RuleSpec::new(RuleIdentity::new("x", "plain"), "test"))
            .unwrap();
        assert_eq!(generic.spec().description, "");

        let special = factory
            .create(RuleSpec::new(RuleIdentity::new("x", "special"), "test"))
            .unwrap();
        assert_eq!(special.spec().description, "special");

        let unknown = RuleSpec::new(RuleIdentity::new("y", "a"), "test");
        assert!(factory.create(unknown.clone()).is_err());
        assert!(matches!(factory.create_all(&[unknown]), Err(LintError::Config { .. })));
    }

    #[test]
    fn test_relative_path() {
        let parsed = MarkdownParser.parse(Path::new("/vault/notes/a.md"), "");
        let context = RuleContext::new(parsed, "/vault");
        assert_eq!(context.relative_path(), "notes/a.md");
    }
}
