//! Rendering of assistant text for the chat surface.

use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::util::truncate_with_ellipsis;

pub trait TextFormatter: Send + Sync {
    fn format(&self, text: &str) -> String;
}

/// Which formatter renders assistant text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageFormat {
    #[default]
    Plain,
    Html,
}

impl MessageFormat {
    pub fn formatter(self) -> Arc<dyn TextFormatter> {
        match self {
            MessageFormat::Plain => Arc::new(PlainText),
            MessageFormat::Html => Arc::new(HtmlFormatter),
        }
    }
}

impl FromStr for MessageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(MessageFormat::Plain),
            "html" => Ok(MessageFormat::Html),
            other => Err(format!("unknown message format '{}'", other)),
        }
    }
}

/// Passes text through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainText;

impl TextFormatter for PlainText {
    fn format(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Renders the common markdown subset (fenced code, inline code, bold) as
/// the small HTML dialect chat surfaces accept.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlFormatter;

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```([A-Za-z0-9_+-]*)\n?(.*?)```").expect("fence pattern is valid")
    })
}

fn inline_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"`([^`\n]+)`").expect("inline code pattern is valid"))
}

fn bold_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*([^*\n]+)\*\*").expect("bold pattern is valid"))
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

fn render_prose(text: &str) -> String {
    bold_re()
        .replace_all(&escape_html(text), "<b>$1</b>")
        .into_owned()
}

fn render_inline(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in inline_code_re().captures_iter(text) {
        let (Some(whole), Some(code)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&render_prose(&text[last..whole.start()]));
        out.push_str("<code>");
        out.push_str(&escape_html(code.as_str()));
        out.push_str("</code>");
        last = whole.end();
    }
    out.push_str(&render_prose(&text[last..]));
    out
}

impl TextFormatter for HtmlFormatter {
    fn format(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in fence_re().captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let lang = caps.get(1).map_or("", |m| m.as_str());
            let code = caps.get(2).map_or("", |m| m.as_str());
            out.push_str(&render_inline(&text[last..whole.start()]));
            if lang.is_empty() {
                out.push_str("<pre><code>");
            } else {
                out.push_str(&format!("<pre><code class=\"language-{}\">", lang));
            }
            out.push_str(&escape_html(code.trim_end_matches('\n')));
            out.push_str("</code></pre>");
            last = whole.end();
        }
        out.push_str(&render_inline(&text[last..]));
        out
    }
}

/// Split `text` into chunks of at most `limit` characters, cutting at the
/// last newline of each window when there is one.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > limit {
        let byte_at = |n: usize| rest.char_indices().nth(n).map_or(rest.len(), |(i, _)| i);
        let cut = byte_at(limit);
        // A newline right after the limit still ends a full-size chunk.
        let search_end = byte_at(limit + 1);
        match rest[..search_end].rfind('\n').filter(|&i| i > 0) {
            Some(newline) => {
                chunks.push(rest[..newline].to_string());
                rest = &rest[newline + 1..];
            }
            None => {
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
        }
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Close a code fence left open at the end of a chunk and reopen it, with
/// the same info string, at the start of the next one.
fn balance_fences(chunks: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(chunks.len());
    let mut open: Option<String> = None;
    for chunk in chunks {
        let mut piece = String::with_capacity(chunk.len());
        if let Some(opener) = &open {
            piece.push_str(opener);
            piece.push('\n');
        }
        for line in chunk.lines() {
            let line = line.trim();
            if line.starts_with("```") {
                open = match open {
                    Some(_) => None,
                    None => Some(line.to_string()),
                };
            }
        }
        piece.push_str(&chunk);
        if open.is_some() {
            piece.push_str("\n```");
        }
        out.push(piece);
    }
    out
}

/// Next raw-text budget after a formatted rendering of `len` characters
/// overflowed `limit`.
fn shrink(budget: usize, len: usize, limit: usize) -> usize {
    (budget * limit / len.max(1)).min(budget - 1).max(1)
}

/// Split `text` into formatted messages of at most `limit` characters each.
///
/// Formatting can lengthen text (escaping, tags), so the raw chunk size is
/// reduced until every formatted chunk fits. Code fences cut by a split are
/// closed and reopened so each chunk renders on its own.
pub fn split_formatted(formatter: &dyn TextFormatter, text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut budget = limit;
    loop {
        let chunks: Vec<String> = balance_fences(split_message(text, budget))
            .iter()
            .map(|chunk| formatter.format(chunk))
            .collect();
        let longest = chunks.iter().map(|c| c.chars().count()).max().unwrap_or(0);
        if longest <= limit || budget == 1 {
            return chunks;
        }
        budget = shrink(budget, longest, limit);
    }
}

/// Formatted `text`, truncated with an ellipsis until it fits in `limit`
/// characters.
pub fn truncate_formatted(formatter: &dyn TextFormatter, text: &str, limit: usize) -> String {
    let limit = limit.max(1);
    let formatted = formatter.format(text);
    if formatted.chars().count() <= limit {
        return formatted;
    }
    let mut budget = limit;
    loop {
        let cut = balance_fences(vec![truncate_with_ellipsis(text, budget)]).concat();
        let candidate = formatter.format(&cut);
        let len = candidate.chars().count();
        if len <= limit || budget == 1 {
            return candidate;
        }
        budget = shrink(budget, len, limit);
    }
}
