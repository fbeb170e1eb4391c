//! Rule 3: heading normalisation, plus the anchor slugs headings produce.
//!
//! Every heading leaves this rule as a canonical ATX line (`## Text`) with
//! exactly one blank line before and after it. Attribute blocks, closing
//! hash sequences, empty anchor spans and whole-heading bold markup are
//! stripped from the text; headings left with no text are dropped.

use crate::pipeline::cleanup::{join_lines, split_lines, CodeFence};
use once_cell::sync::Lazy;
use regex::Regex;

static RE_ATX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ {0,3}(#{1,6})(?:[ \t]+(.*?))?[ \t]*$").unwrap());

static RE_SETEXT_UNDERLINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ {0,3}(=+|-{2,})[ \t]*$").unwrap());

/// `{#id .class key=value}` or the unnumbered marker `{-}` at end of text.
static RE_HEADING_ATTRS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[ \t]*\{(?:[#.\-][^{}]*|[^{}]*=[^{}]*)\}[ \t]*$").unwrap()
});

static RE_EXPLICIT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{#([^\s{}]+)[^{}]*\}[ \t]*$").unwrap());

static RE_EMPTY_SPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\s*\]\{[^{}\n]*\}").unwrap());

static RE_CLOSING_HASHES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[ \t]+)#+[ \t]*$").unwrap());

static RE_ORDERED_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+[.)](?:\s|$)").unwrap());

static RE_INLINE_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!?\[([^\[\]]*)\]\([^()]*\)").unwrap());

/// Split an ATX heading line into `(level, raw text)`.
pub(crate) fn parse_atx(line: &str) -> Option<(usize, &str)> {
    let caps = RE_ATX.captures(line)?;
    let level = caps.get(1)?.as_str().len();
    let text = caps.get(2).map_or("", |m| m.as_str());
    Some((level, text))
}

/// The `id` of a trailing `{#id ...}` attribute block, if the heading still
/// carries one.
pub(crate) fn explicit_id(text: &str) -> Option<&str> {
    RE_EXPLICIT_ID
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// GitHub-style anchor slug: lower-case, alphanumerics plus `-` and `_`,
/// whitespace becomes `-`, everything else is dropped.
pub(crate) fn slugify(text: &str) -> String {
    let text = RE_INLINE_LINK.replace_all(text, "$1");
    let text = RE_HEADING_ATTRS.replace(&text, "");
    let mut slug = String::with_capacity(text.len());
    for c in text.trim().chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() || c == '-' || c == '_' {
            slug.push(c);
        } else if c.is_whitespace() {
            slug.push('-');
        }
    }
    slug
}

/// Strip converter residue from heading text until nothing changes.
fn clean_heading_text(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    loop {
        let mut next = RE_EMPTY_SPAN.replace_all(&text, "").into_owned();
        next = RE_HEADING_ATTRS.replace(&next, "").into_owned();
        next = RE_CLOSING_HASHES.replace(&next, "").trim().to_string();

        if let Some(inner) = next.strip_prefix("**").and_then(|r| r.strip_suffix("**")) {
            if !inner.contains("**") && !inner.trim().is_empty() {
                next = inner.trim().to_string();
            }
        }

        if next == text {
            return text;
        }
        text = next;
    }
}

/// Could this line be the text of a setext heading?
fn is_setext_text(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || line.len() - trimmed.len() > 3 {
        return false;
    }
    let first = trimmed.chars().next().unwrap_or(' ');
    !matches!(first, '>' | '|' | '<' | '-' | '*' | '+' | '#' | '`' | '~' | ':' | '=')
        && !RE_ORDERED_ITEM.is_match(trimmed)
}

/// Returns the rewritten text and the number of headings that changed.
pub(crate) fn fix_headers(input: &str) -> (String, usize) {
    let (lines, trailing) = split_lines(input);
    let mut fence = CodeFence::default();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut after_heading = false;
    let mut fixed = 0;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if !fence.is_code(line) {
            if let Some((level, text)) = parse_atx(line) {
                let text = clean_heading_text(text);
                if text.is_empty() || format!("{} {}", "#".repeat(level), text) != line {
                    fixed += 1;
                }
                emit_heading(&mut out, &mut after_heading, level, &text);
                i += 1;
                continue;
            }

            let follows_break = after_heading || out.last().is_none_or(|l| l.trim().is_empty());
            if follows_break && is_setext_text(line) {
                if let Some(underline) = lines.get(i + 1).and_then(|n| RE_SETEXT_UNDERLINE.captures(n)) {
                    let level = if underline[1].starts_with('=') { 1 } else { 2 };
                    emit_heading(&mut out, &mut after_heading, level, &clean_heading_text(line));
                    fixed += 1;
                    i += 2;
                    continue;
                }
            }

            if after_heading && line.trim().is_empty() {
                i += 1;
                continue;
            }
        }

        if after_heading {
            out.push(String::new());
            after_heading = false;
        }
        out.push(line.to_string());
        i += 1;
    }

    (join_lines(&out, trailing), fixed)
}

fn emit_heading(out: &mut Vec<String>, after_heading: &mut bool, level: usize, text: &str) {
    if text.is_empty() {
        // An empty heading still separates what came before from what follows.
        if !*after_heading {
            out.push(String::new());
        }
        return;
    }
    while out.last().is_some_and(|l| l.trim().is_empty()) {
        out.pop();
    }
    if !out.is_empty() {
        out.push(String::new());
    }
    out.push(format!("{} {}", "#".repeat(level), text));
    *after_heading = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(input: &str) -> String {
        fix_headers(input).0
    }

    #[test]
    fn closing_hashes_and_attributes_stripped() {
        assert_eq!(fix("# Heading #"), "# Heading");
        assert_eq!(fix("## Title ##   "), "## Title");
        assert_eq!(fix("# Title {#title .header}"), "# Title");
        assert_eq!(fix("### Notes {-}"), "### Notes");
        assert_eq!(fix("# Part {.unnumbered style=\"x\"} #"), "# Part");
    }

    #[test]
    fn braces_that_are_not_attributes_are_kept() {
        assert_eq!(fix("# Sets {x}"), "# Sets {x}");
        assert_eq!(fix("# Using C#"), "# Using C#");
    }

    #[test]
    fn empty_spans_and_bold_wrappers_removed() {
        assert_eq!(fix("# []{#ch1}Chapter One"), "# Chapter One");
        assert_eq!(fix("## **Bold title**"), "## Bold title");
        assert_eq!(fix("## **A** and **B**"), "## **A** and **B**");
    }

    #[test]
    fn heading_gets_one_blank_line_each_side() {
        assert_eq!(
            fix("para\n# Title\nbody"),
            "para\n\n# Title\n\nbody"
        );
        assert_eq!(
            fix("para\n\n\n\n# Title\n\n\n\nbody"),
            "para\n\n# Title\n\nbody"
        );
        assert_eq!(fix("# A\n## B\n"), "# A\n\n## B\n");
    }

    #[test]
    fn no_blank_line_before_first_heading() {
        assert_eq!(fix("\n\n# Title\ntext"), "# Title\n\ntext");
    }

    #[test]
    fn empty_headings_dropped() {
        assert_eq!(fix("one\n#\ntwo"), "one\n\ntwo");
        assert_eq!(fix("# []{#x}\ntext"), "\ntext");
        assert_eq!(fix("## {#only-id}"), "");
    }

    #[test]
    fn setext_headings_become_atx() {
        assert_eq!(fix("Title\n=====\n\nText"), "# Title\n\nText");
        assert_eq!(fix("intro\n\nSection\n-------\nbody"), "intro\n\n## Section\n\nbody");
    }

    #[test]
    fn setext_requires_paragraph_start() {
        let input = "a line\nanother line\n---";
        assert_eq!(fix(input), input);
        let list = "- item\n---";
        assert_eq!(fix(list), list);
    }

    #[test]
    fn text_after_heading_can_start_setext() {
        let once = fix("# A\nText\n===\n");
        assert_eq!(once, "# A\n\n# Text\n");
        assert_eq!(fix(&once), once);
    }

    #[test]
    fn hashtags_and_deep_levels_are_not_headings() {
        assert_eq!(fix("#hashtag"), "#hashtag");
        assert_eq!(fix("####### seven"), "####### seven");
        assert_eq!(fix("    # indented code"), "    # indented code");
    }

    #[test]
    fn code_blocks_untouched() {
        let input = "```\n# comment #\nx\n===\n```";
        assert_eq!(fix(input), input);
    }

    #[test]
    fn slug_rules() {
        assert_eq!(slugify("Chapter One"), "chapter-one");
        assert_eq!(slugify("What's New?"), "whats-new");
        assert_eq!(slugify("[Link](#x) text {#id}"), "link-text");
        assert_eq!(slugify("snake_case-Title"), "snake_case-title");
        assert_eq!(slugify("Émile Zola"), "émile-zola");
    }

    #[test]
    fn explicit_ids_are_found() {
        assert_eq!(explicit_id("Title {#title .h1}"), Some("title"));
        assert_eq!(explicit_id("Title"), None);
    }

    #[test]
    fn changed_headings_are_counted() {
        assert_eq!(fix_headers("# Clean\n\ntext\n").1, 0);
        assert_eq!(fix_headers("# A {#a}\n\n## B ##\n").1, 2);
        assert_eq!(fix_headers("Title\n=====\n").1, 1);
        assert_eq!(fix_headers("#\n").1, 1);
    }
}
