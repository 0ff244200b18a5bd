//! Note parsing. Turns raw markdown text into the structured record rules
//! inspect. Parsing is lenient: malformed input yields a partial record,
//! never an error.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.*?)\s*#*\s*$").expect("valid heading regex"));
static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+").expect("valid list regex"));
static WIKI_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(!?)\[\[([^\]\|#]*)(?:#([^\]\|]*))?(?:\|([^\]]*))?\]\]").expect("valid wiki regex")
});
static MARKDOWN_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(!?)\[([^\]]*)\]\(([^)\s]+)(?:\s+"[^"]*")?\)"#).expect("valid link regex")
});

/// Parser contract: given a path and raw text, produce a [`ParsedFile`].
pub trait FileParser: Send + Sync {
    fn parse(&self, path: &Path, content: &str) -> ParsedFile;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedFile {
    pub path: PathBuf,
    pub content: String,
    pub frontmatter: Option<Frontmatter>,
    pub headings: Vec<Heading>,
    pub links: Vec<Link>,
    pub attachments: Vec<Attachment>,
    pub ast: Vec<AstNode>,
}

impl ParsedFile {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.content.lines()
    }

    /// File name without its extension.
    pub fn stem(&self) -> &str {
        self.path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
    }

    pub fn frontmatter_field(&self, key: &str) -> Option<&Value> {
        self.frontmatter.as_ref()?.fields.get(key)
    }
}

/// The leading `---` block. Lines are 1-based and point at the fences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frontmatter {
    pub fields: Map<String, Value>,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heading {
    pub level: u8,
    pub text: String,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Wiki,
    Markdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub kind: LinkKind,
    pub target: String,
    pub section: Option<String>,
    pub alias: Option<String>,
    pub embed: bool,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub target: String,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AstNodeKind {
    Frontmatter,
    Heading,
    Paragraph,
    ListItem,
    CodeBlock,
    Blank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AstNode {
    pub kind: AstNodeKind,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownParser;

impl FileParser for MarkdownParser {
    fn parse(&self, path: &Path, content: &str) -> ParsedFile {
        let lines: Vec<&str> = content.lines().collect();
        let frontmatter = parse_frontmatter(&lines);

        let mut parsed = ParsedFile {
            path: path.to_path_buf(),
            content: content.to_string(),
            frontmatter: None,
            headings: Vec::new(),
            links: Vec::new(),
            attachments: Vec::new(),
            ast: Vec::new(),
        };

        let body_start = match &frontmatter {
            Some(frontmatter) => {
                parsed.ast.push(AstNode {
                    kind: AstNodeKind::Frontmatter,
                    start_line: frontmatter.start_line,
                    end_line: frontmatter.end_line,
                });
                frontmatter.end_line
            }
            None => 0,
        };
        parsed.frontmatter = frontmatter;

        let mut code_start: Option<usize> = None;
        for (index, line) in lines.iter().enumerate().skip(body_start) {
            let line_number = index + 1;
            let trimmed = line.trim_start();

            if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
                match code_start.take() {
                    Some(start) => {
                        push_node(&mut parsed.ast, AstNodeKind::CodeBlock, start, line_number)
                    }
                    None => code_start = Some(line_number),
                }
                continue;
            }
            if code_start.is_some() {
                continue;
            }

            if line.trim().is_empty() {
                push_node(&mut parsed.ast, AstNodeKind::Blank, line_number, line_number);
                continue;
            }

            if let Some(captures) = HEADING.captures(line) {
                parsed.headings.push(Heading {
                    level: captures[1].len() as u8,
                    text: captures[2].to_string(),
                    line: line_number,
                });
                push_node(&mut parsed.ast, AstNodeKind::Heading, line_number, line_number);
            } else if LIST_ITEM.is_match(line) {
                push_node(&mut parsed.ast, AstNodeKind::ListItem, line_number, line_number);
            } else {
                push_node(&mut parsed.ast, AstNodeKind::Paragraph, line_number, line_number);
            }

            extract_links(line, line_number, &mut parsed.links, &mut parsed.attachments);
        }

        // An unterminated fence runs to the end of the file.
        if let Some(start) = code_start {
            push_node(&mut parsed.ast, AstNodeKind::CodeBlock, start, lines.len().max(start));
        }

        parsed
    }
}

/// Adjacent paragraph lines and adjacent blank lines collapse into one node.
fn push_node(ast: &mut Vec<AstNode>, kind: AstNodeKind, start_line: usize, end_line: usize) {
    if matches!(kind, AstNodeKind::Paragraph | AstNodeKind::Blank) {
        if let Some(last) = ast.last_mut() {
            if last.kind == kind && last.end_line + 1 == start_line {
                last.end_line = end_line;
                return;
            }
        }
    }
    ast.push(AstNode {
        kind,
        start_line,
        end_line,
    });
}

fn parse_frontmatter(lines: &[&str]) -> Option<Frontmatter> {
    if lines.first().map(|line| line.trim_end()) != Some("---") {
        return None;
    }
    let end_index = lines
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, line)| matches!(line.trim_end(), "---" | "..."))
        .map(|(index, _)| index)?;

    let mut fields = Map::new();
    let mut pending_list: Option<(String, Vec<Value>)> = None;

    for line in &lines[1..end_index] {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(item) = trimmed.strip_prefix("- ") {
            if let Some((_, items)) = pending_list.as_mut() {
                items.push(scalar_value(item));
            }
            continue;
        }

        if let Some((key, items)) = pending_list.take() {
            fields.insert(key, Value::Array(items));
        }

        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim();
        if value.is_empty() {
            pending_list = Some((key, Vec::new()));
        } else if let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
            let items = inner
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(scalar_value)
                .collect();
            fields.insert(key, Value::Array(items));
        } else {
            fields.insert(key, scalar_value(value));
        }
    }

    if let Some((key, items)) = pending_list.take() {
        let value = if items.is_empty() {
            Value::Null
        } else {
            Value::Array(items)
        };
        fields.insert(key, value);
    }

    Some(Frontmatter {
        fields,
        start_line: 1,
        end_line: end_index + 1,
    })
}

fn scalar_value(raw: &str) -> Value {
    let raw = raw.trim();
    let unquoted = raw
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| raw.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')));
    if let Some(text) = unquoted {
        return Value::String(text.to_string());
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" | "~" => Value::Null,
        _ => {
            if let Ok(number) = raw.parse::<i64>() {
                Value::from(number)
            } else if let Some(number) = raw
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
            {
                Value::Number(number)
            } else {
                Value::String(raw.to_string())
            }
        }
    }
}

fn extract_links(
    line: &str,
    line_number: usize,
    links: &mut Vec<Link>,
    attachments: &mut Vec<Attachment>,
) {
    for captures in WIKI_LINK.captures_iter(line) {
        let embed = !captures[1].is_empty();
        let target = captures[2].trim().to_string();
        if embed && is_attachment_target(&target) {
            attachments.push(Attachment {
                target: target.clone(),
                line: line_number,
            });
        }
        links.push(Link {
            kind: LinkKind::Wiki,
            target,
            section: captures.get(3).map(|m| m.as_str().to_string()),
            alias: captures.get(4).map(|m| m.as_str().to_string()),
            embed,
            line: line_number,
        });
    }

    for captures in MARKDOWN_LINK.captures_iter(line) {
        let embed = !captures[1].is_empty();
        let target = captures[3].to_string();
        let is_remote = target.contains("://");
        if embed && !is_remote && is_attachment_target(&target) {
            attachments.push(Attachment {
                target: target.clone(),
                line: line_number,
            });
        }
        let alias = captures[2].to_string();
        links.push(Link {
            kind: LinkKind::Markdown,
            target,
            section: None,
            alias: (!alias.is_empty()).then_some(alias),
            embed,
            line: line_number,
        });
    }
}

fn is_attachment_target(target: &str) -> bool {
    match Path::new(target).extension().and_then(|ext| ext.to_str()) {
        Some(ext) => !ext.eq_ignore_ascii_case("md"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn parse(content: &str) -> ParsedFile {
        MarkdownParser.parse(Path::new("/vault/My Note.md"), content)
    }

    #[test]
    fn test_frontmatter_fields() {
        let parsed = parse(indoc! {"
            ---
            title: \"Hello\"
            draft: true
            count: 3
            tags: [a, b]
            aliases:
              - one
              - two
            ---
            body
        "});

        let frontmatter = parsed.frontmatter.as_ref().unwrap();
        assert_eq!(frontmatter.start_line, 1);
        assert_eq!(frontmatter.end_line, 9);
        assert_eq!(frontmatter.fields["title"], Value::from("Hello"));
        assert_eq!(frontmatter.fields["draft"], Value::Bool(true));
        assert_eq!(frontmatter.fields["count"], Value::from(3));
        assert_eq!(frontmatter.fields["tags"], serde_json::json!(["a", "b"]));
        assert_eq!(frontmatter.fields["aliases"], serde_json::json!(["one", "two"]));
        assert_eq!(parsed.ast[0].kind, AstNodeKind::Frontmatter);
    }

    #[test]
    fn test_unterminated_frontmatter_is_ignored() {
        let parsed = parse("---\ntitle: x\nno closing fence\n");
        assert!(parsed.frontmatter.is_none());
    }

    #[test]
    fn test_headings_links_and_attachments() {
        let parsed = parse(indoc! {"
            # Title
            See [[Other Note#Section|alias]] and [site](https://example.com).
            ![[diagram.png]]
            ![local](images/photo.jpg)

            ```
            # not a heading [[not-a-link]]
            ```
            ## Second ##
        "});

        assert_eq!(
            parsed.headings,
            vec![
                Heading { level: 1, text: "Title".into(), line: 1 },
                Heading { level: 2, text: "Second".into(), line: 9 },
            ]
        );

        let wiki = &parsed.links[0];
        assert_eq!(wiki.kind, LinkKind::Wiki);
        assert_eq!(wiki.target, "Other Note");
        assert_eq!(wiki.section.as_deref(), Some("Section"));
        assert_eq!(wiki.alias.as_deref(), Some("alias"));
        assert!(parsed.links.iter().all(|link| link.target != "not-a-link"));

        let targets: Vec<_> = parsed.attachments.iter().map(|a| a.target.as_str()).collect();
        assert_eq!(targets, vec!["diagram.png", "images/photo.jpg"]);
        assert!(parsed.ast.iter().any(|node| node.kind == AstNodeKind::CodeBlock
            && node.start_line == 6
            && node.end_line == 8));
    }

    #[test]
    fn test_paragraph_lines_collapse() {
        let parsed = parse("one\ntwo\n\n- item\n");
        let kinds: Vec<_> = parsed.ast.iter().map(|node| node.kind).collect();
        assert_eq!(
            kinds,
            vec![AstNodeKind::Paragraph, AstNodeKind::Blank, AstNodeKind::ListItem]
        );
        assert_eq!(parsed.ast[0].end_line, 2);
        assert_eq!(parsed.stem(), "My Note");
    }
}
