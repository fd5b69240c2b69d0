//! Text protocol for models without native tool calling.
//!
//! A response names its destination with a `TARGET <channel>` line. Text
//! routed to `system` is a single call expression such as
//!
//! ```text
//! write_file("notes.md", `first line
//! second line`)
//! ```
//!
//! where backtick blocks carry raw multi-line strings. Everything here is
//! pure; the provider adapter in `bridge` owns the conversation state.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

/// Routing keyword opening the target line.
pub const TARGET_KEYWORD: &str = "TARGET";
/// Channel for a final answer addressed to the user.
pub const USER_CHANNEL: &str = "user";
/// Channel for a tool call addressed to the host.
pub const SYSTEM_CHANNEL: &str = "system";
/// Prefix of a successful tool result fed back to the model.
pub const RESULT_PREFIX: &str = "RESULT";
/// Prefix of a failed tool result or protocol error fed back to the model.
pub const ERROR_PREFIX: &str = "ERROR";

/// A response split around its first `TARGET` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetBody {
    pub preamble: Option<String>,
    pub target: Option<String>,
    pub body: String,
}

/// A decoded call expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedCall {
    pub name: String,
    pub arguments: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid call syntax: {0}")]
    InvalidCallSyntax(String),
    #[error("Could not decode call arguments: {0}")]
    ArgumentDecodeError(String),
}

fn target_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^[ \t]*TARGET[ \t]+([A-Za-z_][A-Za-z0-9_]*)[ \t]*\r?$")
            .expect("target line pattern compiles")
    })
}

fn fenced_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\A```[A-Za-z0-9_+.-]*[ \t]*\r?\n(.*?)\r?\n?```\z")
            .expect("fence pattern compiles")
    })
}

fn call_shape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\A([A-Za-z_][A-Za-z0-9_]*)\s*\((.*)\)\z").expect("call pattern compiles")
    })
}

/// Split `text` at the first `TARGET <identifier>` line.
///
/// Without such a line the whole (trimmed) text is the body and both
/// `preamble` and `target` are `None`.
pub fn split_preamble_target_body(text: &str) -> TargetBody {
    let untargeted = || TargetBody {
        preamble: None,
        target: None,
        body: text.trim().to_string(),
    };
    let Some(caps) = target_line().captures(text) else {
        return untargeted();
    };
    let (Some(line), Some(target)) = (caps.get(0), caps.get(1)) else {
        return untargeted();
    };
    let preamble = text[..line.start()].trim();
    TargetBody {
        preamble: (!preamble.is_empty()).then(|| preamble.to_string()),
        target: Some(target.as_str().to_string()),
        body: text[line.end()..].trim().to_string(),
    }
}

/// Inner content of a text wholly wrapped in a (optionally tagged) code fence,
/// or `None` when the text is not fenced. A fenced but empty block yields
/// `Some("")`.
pub fn fenced_content(text: &str) -> Option<String> {
    fenced_block()
        .captures(text.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Like [`fenced_content`], but falls back to the trimmed original.
pub fn unwrap_fence(text: &str) -> String {
    fenced_content(text).unwrap_or_else(|| text.trim().to_string())
}

/// Decode `name(arg, arg, ...)`.
///
/// Arguments are JSON literals or backtick raw blocks (single or triple
/// backticks). A raw block may not contain its own delimiter and its
/// content is kept verbatim. In quoted literals a literal `\n` sequence
/// becomes a newline.
pub fn parse_call_expression(text: &str) -> Result<ParsedCall, ProtocolError> {
    let trimmed = text.trim();
    let caps = call_shape().captures(trimmed).ok_or_else(|| {
        ProtocolError::InvalidCallSyntax(format!(
            "expected `name(arguments)`, got `{}`",
            preview(trimmed)
        ))
    })?;
    let (Some(name), Some(inner)) = (caps.get(1), caps.get(2)) else {
        return Err(ProtocolError::InvalidCallSyntax(
            "missing tool name or argument list".to_string(),
        ));
    };

    let mut raw_blocks = RawBlocks::new();
    let substituted = substitute_raw_blocks(inner.as_str(), &mut raw_blocks)?;
    let decoded: Vec<Value> = serde_json::from_str(&format!("[{substituted}]"))
        .map_err(|e| ProtocolError::ArgumentDecodeError(e.to_string()))?;

    Ok(ParsedCall {
        name: name.as_str().to_string(),
        arguments: decoded
            .into_iter()
            .map(|value| finish_strings(value, &raw_blocks))
            .collect(),
    })
}

/// Raw block contents set aside while the argument list is decoded. Each
/// block is stood in for by a string literal made of a per-parse marker and
/// its index.
struct RawBlocks {
    marker: String,
    contents: Vec<String>,
}

impl RawBlocks {
    fn new() -> Self {
        Self {
            marker: format!("{}:", uuid::Uuid::new_v4().simple()),
            contents: Vec::new(),
        }
    }

    fn placeholder(&mut self, content: &str) -> String {
        let literal = format!("\"{}{}\"", self.marker, self.contents.len());
        self.contents.push(content.to_string());
        literal
    }

    fn lookup(&self, s: &str) -> Option<&str> {
        let index: usize = s.strip_prefix(&self.marker)?.parse().ok()?;
        self.contents.get(index).map(String::as_str)
    }
}

/// Replace raw blocks with placeholder literals and check that parentheses
/// outside string literals balance.
fn substitute_raw_blocks(
    args: &str,
    raw_blocks: &mut RawBlocks,
) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(args.len() + 16);
    let mut depth: usize = 0;
    let mut rest = args;

    while let Some(c) = rest.chars().next() {
        match c {
            '"' => {
                let end = quoted_len(rest);
                out.push_str(&rest[..end]);
                rest = &rest[end..];
            }
            '`' => {
                let delimiter = if rest.starts_with("```") { "```" } else { "`" };
                let after_open = &rest[delimiter.len()..];
                let close = after_open.find(delimiter).ok_or_else(|| {
                    ProtocolError::InvalidCallSyntax("unterminated raw block".to_string())
                })?;
                let mut raw = &after_open[..close];
                if delimiter.len() == 3 {
                    raw = raw.strip_prefix('\n').unwrap_or(raw);
                    raw = raw.strip_suffix('\n').unwrap_or(raw);
                }
                out.push_str(&raw_blocks.placeholder(raw));
                rest = &after_open[close + delimiter.len()..];
            }
            '(' | ')' => {
                if c == '(' {
                    depth += 1;
                } else {
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        ProtocolError::InvalidCallSyntax("unbalanced ')'".to_string())
                    })?;
                }
                out.push(c);
                rest = &rest[1..];
            }
            _ => {
                out.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
    }

    if depth != 0 {
        return Err(ProtocolError::InvalidCallSyntax("unbalanced '('".to_string()));
    }
    Ok(out)
}

/// Byte length of the double-quoted literal at the start of `s`, including
/// both quotes. An unterminated literal runs to the end; the JSON decoder
/// reports it.
fn quoted_len(s: &str) -> usize {
    let mut escaped = false;
    for (i, c) in s.char_indices().skip(1) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return i + 1,
            _ => {}
        }
    }
    s.len()
}

/// Put raw block contents back verbatim and turn literal two-character `\n`
/// sequences in every other string value into newlines.
fn finish_strings(value: Value, raw_blocks: &RawBlocks) -> Value {
    match value {
        Value::String(s) => match raw_blocks.lookup(&s) {
            Some(raw) => Value::String(raw.to_string()),
            None => Value::String(s.replace("\\n", "\n")),
        },
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| finish_strings(v, raw_blocks))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let key = raw_blocks.lookup(&k).map(str::to_string).unwrap_or(k);
                    (key, finish_strings(v, raw_blocks))
                })
                .collect(),
        ),
        other => other,
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 80;
    match text.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
