use super::with_default_category;
use crate::rule::{Rule, RuleContext, RuleSpec};
use crate::types::{FileChange, Issue, RawFix, RawIssue};
use anyhow::Result;
use std::collections::BTreeSet;

pub(super) const MAJOR: &str = "trailing-whitespace";
const CATEGORY: &str = "formatting";

pub struct TrailingWhitespaceRule {
    spec: RuleSpec,
}

impl TrailingWhitespaceRule {
    pub fn new(spec: RuleSpec) -> Self {
        Self {
            spec: with_default_category(spec, CATEGORY),
        }
    }
}

fn trim_trailing(line: &str) -> &str {
    line.trim_end_matches([' ', '\t'])
}

impl Rule for TrailingWhitespaceRule {
    fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    fn lint(&self, context: &RuleContext) -> Result<Vec<RawIssue>> {
        Ok(context
            .file
            .lines()
            .enumerate()
            .filter(|(_, line)| trim_trailing(line).len() != line.len())
            .map(|(index, line)| {
                let column = trim_trailing(line).chars().count() + 1;
                RawIssue::new("trailing whitespace")
                    .severity("warning")
                    .at(index + 1, Some(column))
                    .fixable(true)
            })
            .collect())
    }

    fn can_fix(&self) -> bool {
        true
    }

    fn fix(&self, context: &RuleContext, issues: &[Issue]) -> Result<Vec<RawFix>> {
        let lines: Vec<&str> = context.file.lines().collect();
        let flagged: BTreeSet<usize> = issues.iter().filter_map(|issue| issue.line).collect();

        let changes: Vec<FileChange> = flagged
            .into_iter()
            .filter_map(|line| {
                let text = *lines.get(line.checked_sub(1)?)?;
                let trimmed = trim_trailing(text);
                (trimmed.len() != text.len()).then(|| FileChange::Replace {
                    line,
                    old_text: text.to_string(),
                    new_text: trimmed.to_string(),
                })
            })
            .collect();

        if changes.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![RawFix::new("remove trailing whitespace", changes)])
    }
}
