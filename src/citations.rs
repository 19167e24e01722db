use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::models::{CitationMeta, PageNumber, ResolvedCitation};

/// Leading segments of a stored citation path that locate the blob rather
/// than name the document: scheme, the empty segment after `//`, storage
/// host and container.
pub const STORAGE_PREFIX_SEGMENTS: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedAnswer {
    pub markup: String,
    /// Short names in first-seen order; position + 1 is the visible index.
    pub citations: Vec<String>,
    pub source_files: HashMap<String, String>,
    pub page_numbers: HashMap<String, PageNumber>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CitationLink {
    pub index: usize,
    pub title: String,
    pub path: String,
    pub source_path: String,
    pub page_number: PageNumber,
    pub label: String,
}

impl ParsedAnswer {
    pub fn resolved(&self) -> Vec<ResolvedCitation> {
        self.citations
            .iter()
            .enumerate()
            .map(|(idx, short_name)| ResolvedCitation {
                short_name: short_name.clone(),
                index: idx + 1,
                source_path: self.source_files.get(short_name).cloned().unwrap_or_default(),
                page_number: self
                    .page_numbers
                    .get(short_name)
                    .copied()
                    .unwrap_or(PageNumber::Unresolved),
            })
            .collect()
    }

    /// Numbered links shown under an answer, e.g. `1. report.pdf (Page 3)`.
    pub fn citation_links(&self) -> Vec<CitationLink> {
        self.resolved()
            .into_iter()
            .map(|citation| {
                let title = citation
                    .short_name
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_string();
                let label = match citation.page_number.as_number() {
                    Some(page) => format!("{}. {} (Page {})", citation.index, title, page),
                    None => format!("{}. {}", citation.index, title),
                };
                CitationLink {
                    index: citation.index,
                    path: citation_file_path(&citation.short_name),
                    title,
                    source_path: citation.source_path,
                    page_number: citation.page_number,
                    label,
                }
            })
            .collect()
    }

    /// Link labels one per line, the shape the export endpoint expects.
    pub fn citation_links_text(&self) -> String {
        self.citation_links()
            .into_iter()
            .map(|link| link.label)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Answer text with the citation anchors removed, for clipboard copies.
    pub fn plain_text(&self) -> String {
        match anchor_regex() {
            Some(re) => re.replace_all(&self.markup, "").into_owned(),
            None => self.markup.clone(),
        }
    }

    /// Answer text with each citation anchor shown as `[n]`.
    pub fn text_with_markers(&self) -> String {
        let Some(re) = anchor_regex() else {
            return self.markup.clone();
        };
        re.replace_all(&self.markup, |caps: &regex::Captures<'_>| {
            caps.get(1)
                .map(|index| format!("[{}]", index.as_str()))
                .unwrap_or_default()
        })
        .into_owned()
    }
}

/// Renders `answer` with inline superscript markers for every reference
/// token found in `citation_lookup`.
///
/// While `streaming` is set, a trailing `[...` that has not been closed yet
/// is cut off so partial tokens never reach the screen.
pub fn parse_answer(
    answer: &str,
    streaming: bool,
    citation_lookup: &HashMap<String, CitationMeta>,
) -> ParsedAnswer {
    let mut text = answer.trim();
    if streaming {
        text = truncate_incomplete_citation(text);
    }

    let mut parsed = ParsedAnswer::default();
    let token_re = match token_regex() {
        Some(re) if !citation_lookup.is_empty() => re,
        _ => {
            parsed.markup = text.to_string();
            return parsed;
        }
    };

    let mut markup = String::with_capacity(text.len());
    let mut last_end = 0;
    for captures in token_re.captures_iter(text) {
        let (Some(whole), Some(token)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        markup.push_str(&text[last_end..whole.start()]);
        last_end = whole.end();

        let Some(meta) = citation_lookup.get(token.as_str()) else {
            tracing::warn!(token = token.as_str(), "citation not found for reference");
            continue;
        };

        let short_name = short_name_or_empty(&meta.citation);
        let index = register_citation(&mut parsed, token.as_str(), &short_name, meta);
        markup.push_str(&citation_anchor(meta, &short_name, index));
    }
    markup.push_str(&text[last_end..]);

    parsed.markup = markup;
    parsed
}

/// Drops an unterminated trailing `[` and everything after it. Text whose
/// last bracket is `]`, or that has no brackets, is returned unchanged.
pub fn truncate_incomplete_citation(text: &str) -> &str {
    match text.rfind(['[', ']']) {
        Some(pos) if text.as_bytes()[pos] == b'[' => &text[..pos],
        _ => text,
    }
}

/// Relative document path of a stored citation, or `None` when the path is
/// too short to carry the storage prefix.
///
/// Expects at least `STORAGE_PREFIX_SEGMENTS + 1` slash-separated segments,
/// e.g. `https://account.blob.core.windows.net/content/folder/doc.pdf`
/// yields `folder/doc.pdf`.
pub fn citation_short_name(citation_path: &str) -> Option<&str> {
    let mut offset = 0;
    for _ in 0..STORAGE_PREFIX_SEGMENTS {
        let next = citation_path[offset..].find('/')?;
        offset += next + 1;
    }
    Some(&citation_path[offset..])
}

/// URL-escaped short name used as the `data-path` of a citation anchor.
///
/// Follows `encodeURIComponent`: the marks `!'()*` stay literal.
pub fn citation_file_path(short_name: &str) -> String {
    const UNRESERVED_MARKS: [(&str, &str); 5] = [
        ("%21", "!"),
        ("%27", "'"),
        ("%28", "("),
        ("%29", ")"),
        ("%2A", "*"),
    ];

    let mut encoded = urlencoding::encode(short_name).into_owned();
    for (escaped, mark) in UNRESERVED_MARKS {
        if encoded.contains(escaped) {
            encoded = encoded.replace(escaped, mark);
        }
    }
    encoded
}

fn register_citation(
    parsed: &mut ParsedAnswer,
    token: &str,
    short_name: &str,
    meta: &CitationMeta,
) -> usize {
    if let Some(pos) = parsed.citations.iter().position(|name| *name == short_name) {
        return pos + 1;
    }

    let page_number = PageNumber::parse(&meta.page_number);
    if !page_number.is_resolved() {
        tracing::warn!(token, page = %meta.page_number, "page not found for citation");
    }

    parsed
        .source_files
        .insert(short_name.to_string(), meta.source_path.clone());
    parsed
        .page_numbers
        .insert(short_name.to_string(), page_number);
    parsed.citations.push(short_name.to_string());
    parsed.citations.len()
}

fn short_name_or_empty(citation_path: &str) -> String {
    match citation_short_name(citation_path) {
        Some(name) => name.to_string(),
        None => {
            tracing::warn!(
                citation = citation_path,
                "citation path shorter than storage prefix"
            );
            String::new()
        }
    }
}

fn citation_anchor(meta: &CitationMeta, short_name: &str, index: usize) -> String {
    let title = anchor_title(&meta.citation)
        .map(|title| format!(" title=\"{}\"", escape_attr(title)))
        .unwrap_or_default();

    format!(
        "<a class=\"supContainer\"{title} data-path=\"{}\" data-source-path=\"{}\" data-page-number=\"{}\"><sup>{index}</sup></a>",
        escape_attr(&citation_file_path(short_name)),
        escape_attr(&meta.source_path),
        escape_attr(&meta.page_number),
    )
}

/// Second-to-last path segment, normally the folder holding the document.
fn anchor_title(citation_path: &str) -> Option<&str> {
    let mut segments = citation_path.rsplit('/');
    segments.next()?;
    segments.next()
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn token_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]+)\]").ok()).as_ref()
}

fn anchor_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<a\b[^>]*>(?:<sup>(\d+)</sup>)?.*?</a>").ok())
        .as_ref()
}
