use super::with_default_category;
use crate::rule::{Rule, RuleContext, RuleSpec};
use crate::types::{FileChange, Issue, RawFix, RawIssue};
use anyhow::{Result, bail};

pub(super) const MAJOR: &str = "file-naming";
const CATEGORY: &str = "file-naming";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingStyle {
    KebabCase,
    SnakeCase,
    Lowercase,
}

impl NamingStyle {
    pub fn from_minor(minor: &str) -> Option<Self> {
        match minor {
            "kebab-case" => Some(NamingStyle::KebabCase),
            "snake-case" => Some(NamingStyle::SnakeCase),
            "lowercase" => Some(NamingStyle::Lowercase),
            _ => None,
        }
    }

    pub fn apply(&self, stem: &str) -> String {
        match self {
            NamingStyle::KebabCase => split_words(stem).join("-"),
            NamingStyle::SnakeCase => split_words(stem).join("_"),
            NamingStyle::Lowercase => stem.to_lowercase(),
        }
    }
}

/// Lowercased words, split on non-alphanumerics and on lower-to-upper case
/// transitions (`myNote` is two words).
fn split_words(stem: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut previous_lower = false;

    for ch in stem.chars() {
        if !ch.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            previous_lower = false;
            continue;
        }
        if ch.is_uppercase() && previous_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        previous_lower = ch.is_lowercase() || ch.is_numeric();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

pub struct FileNamingRule {
    spec: RuleSpec,
    style: NamingStyle,
}

impl FileNamingRule {
    pub fn new(spec: RuleSpec) -> Result<Self> {
        let Some(style) = NamingStyle::from_minor(&spec.identity.minor) else {
            bail!(
                "unknown naming style `{}`, expected kebab-case, snake-case or lowercase",
                spec.identity.minor
            );
        };
        Ok(Self {
            spec: with_default_category(spec, CATEGORY),
            style,
        })
    }

    fn expected_stem(&self, context: &RuleContext) -> Option<String> {
        let stem = context.file.stem();
        let expected = self.style.apply(stem);
        (!expected.is_empty() && expected != stem).then_some(expected)
    }
}

impl Rule for FileNamingRule {
    fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    fn lint(&self, context: &RuleContext) -> Result<Vec<RawIssue>> {
        Ok(self
            .expected_stem(context)
            .map(|expected| {
                RawIssue::new(format!(
                    "file name `{}` should be `{expected}`",
                    context.file.stem()
                ))
                .severity("warning")
                .fixable(true)
            })
            .into_iter()
            .collect())
    }

    fn can_fix(&self) -> bool {
        true
    }

    fn fix(&self, context: &RuleContext, issues: &[Issue]) -> Result<Vec<RawFix>> {
        let Some(expected) = self.expected_stem(context).filter(|_| !issues.is_empty()) else {
            return Ok(Vec::new());
        };
        let from = context.file.path.clone();
        let file_name = match from.extension().and_then(|ext| ext.to_str()) {
            Some(ext) => format!("{expected}.{ext}"),
            None => expected,
        };
        let to = from.with_file_name(file_name);
        Ok(vec![RawFix::new(
            format!("rename to {}", to.display()),
            vec![FileChange::Move {
                from,
                to,
                update_links: true,
            }],
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{FileParser, MarkdownParser};
    use crate::types::{RuleIdentity, Severity};
    use std::path::{Path, PathBuf};

    #[test]
    fn test_naming_styles() {
        assert_eq!(NamingStyle::KebabCase.apply("My Great Note"), "my-great-note");
        assert_eq!(NamingStyle::KebabCase.apply("meetingNotes_2024"), "meeting-notes-2024");
        assert_eq!(NamingStyle::SnakeCase.apply("My-Great Note"), "my_great_note");
        assert_eq!(NamingStyle::Lowercase.apply("README"), "readme");
        assert_eq!(NamingStyle::KebabCase.apply("already-fine"), "already-fine");
    }

    #[test]
    fn test_rename_fix() {
        let spec = RuleSpec::new(RuleIdentity::new(MAJOR, "kebab-case"), "");
        let rule = FileNamingRule::new(spec).unwrap();
        let context = RuleContext::new(
            MarkdownParser.parse(Path::new("/vault/notes/Project Plan.md"), "body"),
            "/vault",
        );

        let issues = rule.lint(&context).unwrap();
        assert_eq!(issues.len(), 1);

        let issue = Issue {
            rule_id: "file-naming.kebab-case".into(),
            severity: Severity::Warning,
            message: String::new(),
            file: context.file.path.clone(),
            line: None,
            column: None,
            fixable: true,
        };
        let fixes = rule.fix(&context, &[issue]).unwrap();
        assert_eq!(
            fixes[0].changes,
            vec![FileChange::Move {
                from: PathBuf::from("/vault/notes/Project Plan.md"),
                to: PathBuf::from("/vault/notes/project-plan.md"),
                update_links: true,
            }]
        );
    }

    #[test]
    fn test_conforming_name_passes() {
        let spec = RuleSpec::new(RuleIdentity::new(MAJOR, "snake-case"), "");
        let rule = FileNamingRule::new(spec).unwrap();
        let context = RuleContext::new(
            MarkdownParser.parse(Path::new("/vault/good_name.md"), ""),
            "/vault",
        );
        assert!(rule.lint(&context).unwrap().is_empty());
    }
}
