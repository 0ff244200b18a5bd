//! Validation of a loaded rule set before anything executes.

use crate::rule::RuleSpec;
use crate::types::RuleIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Categories whose rules touch the same files or metadata and therefore
/// interact when they cover the same paths.
const INTERACTING_CATEGORIES: &[&str] =
    &["file-organization", "attachment", "frontmatter", "linking"];
const MOVING_FAMILIES: &[&str] = &["file-organization", "attachment-organization"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    DuplicateMajorId,
    PathOverlap,
    IncompatibleSettings,
    ResourceContention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictGroup {
    pub major_id: String,
    pub rules: Vec<RuleIdentity>,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub resolution: String,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    /// False iff at least one critical conflict exists.
    pub valid: bool,
    pub conflicts: Vec<ConflictGroup>,
    pub warnings: Vec<String>,
    pub summary: String,
}

impl ConflictReport {
    pub fn critical(&self) -> impl Iterator<Item = &ConflictGroup> {
        self.conflicts
            .iter()
            .filter(|group| group.severity == ConflictSeverity::Critical)
    }
}

pub fn detect_conflicts(rules: &[RuleSpec]) -> ConflictReport {
    let mut conflicts = Vec::new();
    conflicts.extend(duplicate_major_ids(rules));
    conflicts.extend(path_overlaps(rules));
    conflicts.extend(resource_contention(rules));
    conflicts.extend(incompatible_settings(rules));

    let valid = !conflicts
        .iter()
        .any(|group| group.severity == ConflictSeverity::Critical);
    let warnings = conflicts
        .iter()
        .filter(|group| group.severity == ConflictSeverity::Warning)
        .map(|group| format!("{}: {}", group.major_id, group.resolution))
        .collect();
    let summary = summarize(&conflicts);

    ConflictReport {
        valid,
        conflicts,
        warnings,
        summary,
    }
}

fn summarize(conflicts: &[ConflictGroup]) -> String {
    if conflicts.is_empty() {
        return "no conflicts detected".to_string();
    }
    let critical = conflicts
        .iter()
        .filter(|group| group.severity == ConflictSeverity::Critical)
        .count();
    let details = conflicts
        .iter()
        .filter(|group| group.severity == ConflictSeverity::Critical)
        .map(|group| {
            let ids: Vec<&str> = group.rules.iter().map(|rule| rule.full.as_str()).collect();
            format!("`{}` is claimed by {}", group.major_id, ids.join(", "))
        })
        .collect::<Vec<_>>();
    let mut summary = format!(
        "{critical} critical and {} warning conflict(s)",
        conflicts.len() - critical
    );
    if !details.is_empty() {
        summary.push_str(": ");
        summary.push_str(&details.join("; "));
    }
    summary
}

fn duplicate_major_ids(rules: &[RuleSpec]) -> Vec<ConflictGroup> {
    let mut by_major: BTreeMap<&str, Vec<RuleIdentity>> = BTreeMap::new();
    for rule in rules {
        by_major
            .entry(rule.identity.major.as_str())
            .or_default()
            .push(rule.identity.clone());
    }

    by_major
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(major, members)| {
            let suggestions = members
                .iter()
                .map(|identity| format!("keep only `{identity}` and disable the others"))
                .collect();
            ConflictGroup {
                major_id: major.to_string(),
                rules: members,
                conflict_type: ConflictType::DuplicateMajorId,
                severity: ConflictSeverity::Critical,
                resolution: format!(
                    "only one `{major}` variant may be enabled; move the others into a `disabled/` directory"
                ),
                suggestions,
            }
        })
        .collect()
}

fn pattern_key(rule: &RuleSpec) -> String {
    let sorted = |patterns: &[String]| {
        let mut patterns = patterns.to_vec();
        patterns.sort();
        patterns.join(",")
    };
    let config = &rule.config;
    format!(
        "allow[{}]deny[{}]include[{}]exclude[{}]",
        sorted(&config.path_allowlist),
        sorted(&config.path_denylist),
        sorted(&config.include_patterns),
        sorted(&config.exclude_patterns),
    )
}

fn path_overlaps(rules: &[RuleSpec]) -> Vec<ConflictGroup> {
    let mut groups: BTreeMap<(String, &str), Vec<RuleIdentity>> = BTreeMap::new();
    for rule in rules {
        if INTERACTING_CATEGORIES.contains(&rule.category.as_str()) {
            groups
                .entry((pattern_key(rule), rule.category.as_str()))
                .or_default()
                .push(rule.identity.clone());
        }
    }

    groups
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|((_, category), members)| ConflictGroup {
            major_id: category.to_string(),
            rules: members,
            conflict_type: ConflictType::PathOverlap,
            severity: ConflictSeverity::Warning,
            resolution: format!("several `{category}` rules apply to exactly the same paths"),
            suggestions: vec![
                "narrow each rule's include patterns so they cover distinct folders".to_string(),
                "check that the rules' fixes do not undo each other".to_string(),
            ],
        })
        .collect()
}

fn resource_contention(rules: &[RuleSpec]) -> Option<ConflictGroup> {
    let movers: Vec<RuleIdentity> = rules
        .iter()
        .filter(|rule| {
            MOVING_FAMILIES
                .iter()
                .any(|family| rule.identity.major.contains(family))
        })
        .map(|rule| rule.identity.clone())
        .collect();

    (movers.len() > 1).then(|| ConflictGroup {
        major_id: movers[0].major.clone(),
        rules: movers,
        conflict_type: ConflictType::ResourceContention,
        severity: ConflictSeverity::Warning,
        resolution: "multiple rules may try to move the same files".to_string(),
        suggestions: vec!["enable a single organization rule per vault".to_string()],
    })
}

fn incompatible_settings(rules: &[RuleSpec]) -> Vec<ConflictGroup> {
    let pairings: [(&str, &str, &[&str]); 2] = [
        (
            "file-naming",
            "file naming rules disagree on the expected name format",
            &["choose one naming convention for the whole vault"],
        ),
        (
            "attachment-organization",
            "attachment rules disagree on where attachments live",
            &[
                "choose a single attachment folder strategy",
                "exclude the folders managed by the other rule",
            ],
        ),
    ];

    pairings
        .iter()
        .filter_map(|(family, resolution, suggestions)| {
            let members: Vec<RuleIdentity> = rules
                .iter()
                .filter(|rule| rule.identity.major.contains(family) || rule.category == *family)
                .map(|rule| rule.identity.clone())
                .collect();
            (members.len() > 1).then(|| ConflictGroup {
                major_id: family.to_string(),
                rules: members,
                conflict_type: ConflictType::IncompatibleSettings,
                severity: ConflictSeverity::Warning,
                resolution: resolution.to_string(),
                suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
            })
        })
        .collect()
}
