//! Diagram rendering collaborator.
//!
//! The lifecycle code only needs something that turns diagram source into SVG
//! or a syntax error, so the backend depends on [`DiagramRenderer`].
//! [`OutlineRenderer`] is the built-in implementation: it recognises the
//! diagram kind from the header line, checks bracket balance and lays the
//! source out as a text outline.

use diagrammer_protocol::{RenderedDiagram, SyntaxIssue, ValidationReport};

use crate::error::{LifecycleError, Result};

const KINDS: &[&str] = &[
    "graph",
    "flowchart",
    "sequenceDiagram",
    "classDiagram",
    "stateDiagram",
    "stateDiagram-v2",
    "erDiagram",
    "gantt",
    "pie",
    "journey",
    "gitGraph",
    "mindmap",
    "timeline",
];

const LINE_HEIGHT: usize = 20;
const PADDING: usize = 16;
const CHAR_WIDTH: usize = 8;
const MIN_WIDTH: usize = 320;

pub trait DiagramRenderer: Send + Sync {
    /// Checks the source and returns its diagram kind.
    fn validate(&self, source: &str) -> Result<String>;

    fn render(&self, source: &str) -> Result<RenderedDiagram>;

    fn report(&self, source: &str) -> ValidationReport {
        match self.validate(source) {
            Ok(kind) => ValidationReport {
                valid: true,
                kind: Some(kind),
                error: None,
            },
            Err(LifecycleError::Syntax { message, line }) => ValidationReport {
                valid: false,
                kind: None,
                error: Some(SyntaxIssue { message, line }),
            },
            Err(err) => ValidationReport {
                valid: false,
                kind: None,
                error: Some(SyntaxIssue {
                    message: err.to_string(),
                    line: None,
                }),
            },
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OutlineRenderer;

impl DiagramRenderer for OutlineRenderer {
    fn validate(&self, source: &str) -> Result<String> {
        let kind = detect_kind(source)?;
        check_brackets(source)?;
        Ok(kind.to_string())
    }

    fn render(&self, source: &str) -> Result<RenderedDiagram> {
        let kind = self.validate(source)?;
        let lines: Vec<&str> = source
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .collect();

        let longest = lines.iter().map(|line| line.chars().count()).max().unwrap_or(0);
        let width = (longest * CHAR_WIDTH + PADDING * 2).max(MIN_WIDTH);
        let height = lines.len() * LINE_HEIGHT + PADDING * 2;

        let mut svg = format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\" data-kind=\"{kind}\">",
            w = width,
            h = height,
            kind = escape(&kind)
        );
        svg.push_str("<rect width=\"100%\" height=\"100%\" fill=\"white\"/>");
        for (index, line) in lines.iter().enumerate() {
            let indent = line.len() - line.trim_start().len();
            svg.push_str(&format!(
                "<text x=\"{}\" y=\"{}\" font-family=\"monospace\" font-size=\"13\">{}</text>",
                PADDING + indent * CHAR_WIDTH,
                PADDING + (index + 1) * LINE_HEIGHT - 6,
                escape(line.trim_start())
            ));
        }
        svg.push_str("</svg>");

        Ok(RenderedDiagram { kind, svg })
    }
}

fn detect_kind(source: &str) -> Result<&'static str> {
    let (line_no, header) = source
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .find(|(_, line)| !line.is_empty() && !line.starts_with("%%"))
        .ok_or_else(|| LifecycleError::Syntax {
            message: "diagram source is empty".to_string(),
            line: None,
        })?;

    let keyword = header.split_whitespace().next().unwrap_or_default();
    KINDS
        .iter()
        .copied()
        .find(|kind| *kind == keyword)
        .ok_or_else(|| LifecycleError::Syntax {
            message: format!("unknown diagram type '{}'", keyword),
            line: Some(line_no),
        })
}

fn check_brackets(source: &str) -> Result<()> {
    let mut open: Vec<(char, usize)> = Vec::new();

    for (index, line) in source.lines().enumerate() {
        let line_no = index + 1;
        if line.trim_start().starts_with("%%") {
            continue;
        }
        let mut quoted = false;
        for ch in line.chars() {
            match ch {
                '"' => quoted = !quoted,
                _ if quoted => {}
                '(' | '[' | '{' => open.push((ch, line_no)),
                ')' | ']' | '}' => match open.pop() {
                    Some((opener, _)) if closes(opener) == ch => {}
                    Some((opener, opened_on)) => {
                        return Err(LifecycleError::Syntax {
                            message: format!(
                                "'{}' does not close '{}' opened on line {}",
                                ch, opener, opened_on
                            ),
                            line: Some(line_no),
                        })
                    }
                    None => {
                        return Err(LifecycleError::Syntax {
                            message: format!("unexpected '{}'", ch),
                            line: Some(line_no),
                        })
                    }
                },
                _ => {}
            }
        }
        if quoted {
            return Err(LifecycleError::Syntax {
                message: "unterminated string".to_string(),
                line: Some(line_no),
            });
        }
    }

    match open.pop() {
        Some((opener, line)) => Err(LifecycleError::Syntax {
            message: format!("unbalanced '{}'", opener),
            line: Some(line),
        }),
        None => Ok(()),
    }
}

fn closes(opener: char) -> char {
    match opener {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_kind_after_comments() {
        let source = "%% title\n\nsequenceDiagram\n  A->>B: hi";
        assert_eq!(OutlineRenderer.validate(source).unwrap(), "sequenceDiagram");
    }

    #[test]
    fn unknown_header_reports_line() {
        let err = OutlineRenderer.validate("\nboxes LR\nA-->B").unwrap_err();
        match err {
            LifecycleError::Syntax { message, line } => {
                assert!(message.contains("boxes"));
                assert_eq!(line, Some(2));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unbalanced_bracket_points_at_opener() {
        let report = OutlineRenderer.report("graph TD\n  A[Start --> B\n  B --> C");
        assert!(!report.valid);
        let issue = report.error.unwrap();
        assert_eq!(issue.line, Some(2));
        assert!(issue.message.contains('['));
    }

    #[test]
    fn mismatched_closer_is_rejected() {
        let err = OutlineRenderer.validate("graph TD\n  A(Start] --> B").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn brackets_inside_labels_are_ignored() {
        let source = "flowchart LR\n  A[\"uses ( and [\"] --> B";
        assert_eq!(OutlineRenderer.validate(source).unwrap(), "flowchart");
    }

    #[test]
    fn render_escapes_source() {
        let rendered = OutlineRenderer
            .render("graph TD\n  A[a < b] --> B{\"x & y\"}")
            .unwrap();
        assert_eq!(rendered.kind, "graph");
        assert!(rendered.svg.starts_with("<svg"));
        assert!(rendered.svg.contains("a &lt; b"));
        assert!(rendered.svg.contains("&quot;x &amp; y&quot;"));
        assert!(!rendered.svg.contains("a < b"));
    }
}
