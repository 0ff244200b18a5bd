use super::with_default_category;
use crate::rule::{Rule, RuleContext, RuleSpec};
use crate::types::{FileChange, Issue, RawFix, RawIssue};
use anyhow::{Result, bail};

pub(super) const MAJOR: &str = "frontmatter-required-fields";
const CATEGORY: &str = "frontmatter";

/// Requires a frontmatter block carrying every field in
/// `settings.required_fields` (default: `title`).
pub struct RequiredFieldsRule {
    spec: RuleSpec,
    required_fields: Vec<String>,
}

impl RequiredFieldsRule {
    pub fn new(spec: RuleSpec) -> Result<Self> {
        let required_fields = match spec.config.setting("required_fields") {
            None => vec!["title".to_string()],
            Some(value) if value.is_array() => spec
                .config
                .string_list_setting("required_fields")
                .unwrap_or_default(),
            Some(other) => bail!("`required_fields` must be a list of strings, got {other}"),
        };
        Ok(Self {
            spec: with_default_category(spec, CATEGORY),
            required_fields,
        })
    }

    fn missing_fields<'a>(&'a self, context: &RuleContext) -> Vec<&'a str> {
        self.required_fields
            .iter()
            .filter(|field| context.file.frontmatter_field(field).is_none())
            .map(String::as_str)
            .collect()
    }

    fn field_line(field: &str, context: &RuleContext) -> String {
        if field == "title" {
            format!("title: {}\n", context.file.stem())
        } else {
            format!("{field}:\n")
        }
    }
}

impl Rule for RequiredFieldsRule {
    fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    fn lint(&self, context: &RuleContext) -> Result<Vec<RawIssue>> {
        let Some(frontmatter) = context.file.frontmatter.as_ref() else {
            if self.required_fields.is_empty() {
                return Ok(Vec::new());
            }
            return Ok(vec![
                RawIssue::new("missing frontmatter block")
                    .severity("error")
                    .at(1, Some(1))
                    .fixable(true),
            ]);
        };

        Ok(self
            .missing_fields(context)
            .into_iter()
            .map(|field| {
                RawIssue::new(format!("missing required frontmatter field `{field}`"))
                    .severity("error")
                    .at(frontmatter.start_line, None)
                    .fixable(true)
            })
            .collect())
    }

    fn can_fix(&self) -> bool {
        true
    }

    fn fix(&self, context: &RuleContext, issues: &[Issue]) -> Result<Vec<RawFix>> {
        if issues.is_empty() {
            return Ok(Vec::new());
        }
        let missing = self.missing_fields(context);
        if missing.is_empty() {
            return Ok(Vec::new());
        }
        let fields: String = missing
            .iter()
            .map(|field| Self::field_line(field, context))
            .collect();

        let fix = match context.file.frontmatter.as_ref() {
            None => RawFix::new(
                "add frontmatter block",
                vec![FileChange::Insert {
                    line: 1,
                    column: 1,
                    text: format!("---\n{fields}---\n"),
                }],
            ),
            Some(frontmatter) => RawFix::new(
                format!("add frontmatter fields: {}", missing.join(", ")),
                vec![FileChange::Insert {
                    line: frontmatter.end_line,
                    column: 1,
                    text: fields,
                }],
            ),
        };
        Ok(vec![fix])
    }
}
