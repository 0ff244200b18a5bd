//! Applying text changes to file content, and rewriting links after renames.

use crate::types::{FileChange, TextPosition};
use regex::{Captures, Regex};
use std::sync::LazyLock;
use thiserror::Error;

static WIKI_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[([^\]\|#]*)((?:#[^\]\|]*)?(?:\|[^\]]*)?)\]\]").expect("valid wiki link regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangeError {
    #[error("line {line} is outside the file ({lines} lines)")]
    LineOutOfRange { line: usize, lines: usize },
    #[error("column {column} is outside line {line}")]
    ColumnOutOfRange { line: usize, column: usize },
    #[error("expected text {text:?} is no longer on line {line}")]
    TextNotFound { line: usize, text: String },
    #[error("range {start:?}..{end:?} is inverted")]
    InvertedRange { start: TextPosition, end: TextPosition },
    #[error("moves cannot be applied to file content")]
    NotATextChange,
}

fn line_count(content: &str) -> usize {
    content.lines().count()
}

/// Byte range of 1-based `line`, excluding its line terminator.
fn line_bounds(content: &str, line: usize) -> Result<(usize, usize), ChangeError> {
    let lines = line_count(content);
    if line == 0 || line > lines {
        return Err(ChangeError::LineOutOfRange { line, lines });
    }
    let mut start = 0;
    for _ in 1..line {
        start += content[start..]
            .find('\n')
            .map(|index| index + 1)
            .ok_or(ChangeError::LineOutOfRange { line, lines })?;
    }
    let mut end = content[start..]
        .find('\n')
        .map_or(content.len(), |index| start + index);
    if end > start && content.as_bytes()[end - 1] == b'\r' {
        end -= 1;
    }
    Ok((start, end))
}

/// Byte offset of a 1-based position. Column `len + 1` is the end of the
/// line; line `count + 1` (column 1) is the end of the content.
fn offset_of(content: &str, position: TextPosition) -> Result<usize, ChangeError> {
    let TextPosition { line, column } = position;
    if line == line_count(content) + 1 && column == 1 {
        return Ok(content.len());
    }
    let (start, end) = line_bounds(content, line)?;
    let text = &content[start..end];
    if column == 0 {
        return Err(ChangeError::ColumnOutOfRange { line, column });
    }
    let chars = text.chars().count();
    if column == chars + 1 {
        return Ok(end);
    }
    text.char_indices()
        .nth(column - 1)
        .map(|(index, _)| start + index)
        .ok_or(ChangeError::ColumnOutOfRange { line, column })
}

pub fn apply_change(content: &str, change: &FileChange) -> Result<String, ChangeError> {
    match change {
        FileChange::Replace {
            line,
            old_text,
            new_text,
        } => {
            let (start, end) = line_bounds(content, *line)?;
            let found = content[start..end]
                .find(old_text.as_str())
                .ok_or_else(|| ChangeError::TextNotFound {
                    line: *line,
                    text: old_text.clone(),
                })?;
            let at = start + found;
            let mut result = String::with_capacity(content.len() + new_text.len());
            result.push_str(&content[..at]);
            result.push_str(new_text);
            result.push_str(&content[at + old_text.len()..]);
            Ok(result)
        }
        FileChange::Insert { line, column, text } => {
            let mut offset = offset_of(content, TextPosition::new(*line, *column))?;
            let mut result = content.to_string();
            let appending = *column == 1 && *line > line_count(content);
            if appending && !content.is_empty() && !content.ends_with('\n') {
                result.push('\n');
                offset += 1;
            }
            result.insert_str(offset, text);
            Ok(result)
        }
        FileChange::Delete { start, end } => {
            if end < start {
                return Err(ChangeError::InvertedRange {
                    start: *start,
                    end: *end,
                });
            }
            let from = offset_of(content, *start)?;
            let to = offset_of(content, *end)?;
            let mut result = content.to_string();
            result.replace_range(from..to, "");
            Ok(result)
        }
        FileChange::Move { .. } => Err(ChangeError::NotATextChange),
    }
}

/// Apply every text change of one fix, in order, each against the result of
/// the previous one. Moves are skipped; they are applied on disk separately.
pub fn apply_text_changes(content: &str, changes: &[FileChange]) -> Result<String, ChangeError> {
    changes
        .iter()
        .filter(|change| !change.is_move())
        .try_fold(content.to_string(), |current, change| apply_change(&current, change))
}

/// Point wiki links at `old_stem` to `new_stem`, keeping any folder prefix,
/// `.md` suffix, section and alias. Returns `None` when nothing changed.
pub fn rewrite_wiki_links(content: &str, old_stem: &str, new_stem: &str) -> Option<String> {
    let mut changed = false;
    let rewritten = WIKI_LINK.replace_all(content, |captures: &Captures| {
        let target = &captures[1];
        let (folder, name) = match target.rfind('/') {
            Some(index) => target.split_at(index + 1),
            None => ("", target),
        };
        let (stem, extension) = match name.strip_suffix(".md") {
            Some(stem) => (stem, ".md"),
            None => (name, ""),
        };
        if stem == old_stem {
            changed = true;
            format!("[[{folder}{new_stem}{extension}{}]]", &captures[2])
        } else {
            captures[0].to_string()
        }
    });
    changed.then(|| rewritten.into_owned())
}
