//! Cleanup: deterministic rewriting of converter-generated Markdown.
//!
//! ## Why is cleanup necessary?
//!
//! pandoc's EPUB reader preserves every structural detail of the source
//! XHTML, which is exactly what a human editor does *not* want to see:
//!
//! - `::: {#chapter01 .calibre}` fenced-div markers around every container
//! - `[]{#filepos1234}` empty anchor spans sprinkled through paragraphs
//! - `# Title {#title .h1 align="center"}` attribute blocks on headings
//! - `[Chapter 1](#index_split_001.html_filepos42)` links whose targets only
//!   made sense inside the archive
//!
//! ## Rule order
//!
//! The rules run in a fixed order because later rules assume earlier
//! artefacts are gone: fences are dropped before headings are detected, spans
//! before heading text is cleaned and before repeated images are compared,
//! headings are normalised before link targets are matched against their
//! anchors, and whitespace is settled last. Each rule is a pure function of
//! its input, reports how many artefacts it rewrote, and can be disabled on
//! its own through [`CleanupOptions`].
//!
//! Lines inside fenced code blocks are never rewritten (only their trailing
//! whitespace is trimmed).
//!
//! The whole sequence is repeated until the text stops changing, so the
//! result is a fixed point: cleaning already-cleaned output returns it
//! unchanged.

use crate::config::CleanupOptions;
use crate::pipeline::{headings, links};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Upper bound on full passes; real documents settle in two.
const MAX_PASSES: usize = 6;

/// One named, pure, idempotent text transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupRule {
    /// Drop fenced-div markers and other block container delimiters.
    DivBlocks,
    /// Drop empty anchor spans and inline attribute residue.
    Spans,
    /// Drop a standalone image line that repeats an earlier one.
    DuplicateImages,
    /// Canonical ATX headings with one blank line around them.
    Headers,
    /// Point internal links at the anchors of the normalised headings.
    Links,
    /// Collapse blank lines, trim trailing whitespace, one final newline.
    Whitespace,
}

impl CleanupRule {
    /// All rules in execution order.
    pub const ORDER: [CleanupRule; 6] = [
        CleanupRule::DivBlocks,
        CleanupRule::Spans,
        CleanupRule::DuplicateImages,
        CleanupRule::Headers,
        CleanupRule::Links,
        CleanupRule::Whitespace,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CleanupRule::DivBlocks => "remove_div_blocks",
            CleanupRule::Spans => "remove_spans",
            CleanupRule::DuplicateImages => "remove_duplicate_images",
            CleanupRule::Headers => "fix_headers",
            CleanupRule::Links => "fix_links",
            CleanupRule::Whitespace => "normalize_whitespace",
        }
    }

    pub fn is_enabled(self, options: &CleanupOptions) -> bool {
        match self {
            CleanupRule::DivBlocks => options.remove_div_blocks,
            CleanupRule::Spans => options.remove_spans,
            CleanupRule::DuplicateImages => options.remove_duplicate_images,
            CleanupRule::Headers => options.fix_headers,
            CleanupRule::Links => options.fix_links,
            CleanupRule::Whitespace => options.normalize_whitespace,
        }
    }

    pub fn apply(self, input: &str) -> String {
        self.apply_counted(input).0
    }

    /// Like [`CleanupRule::apply`], also returning how many artefacts the
    /// rule removed or rewrote.
    pub fn apply_counted(self, input: &str) -> (String, usize) {
        match self {
            CleanupRule::DivBlocks => remove_div_blocks(input),
            CleanupRule::Spans => remove_span_artifacts(input),
            CleanupRule::DuplicateImages => remove_duplicate_images(input),
            CleanupRule::Headers => headings::fix_headers(input),
            CleanupRule::Links => links::fix_links(input),
            CleanupRule::Whitespace => (normalise_whitespace(input), 0),
        }
    }
}

/// What the cleanup rules did to one document, summed over all passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub divs_removed: usize,
    pub spans_removed: usize,
    pub duplicate_images_removed: usize,
    pub headers_fixed: usize,
    pub links_fixed: usize,
}

impl CleanupStats {
    fn record(&mut self, rule: CleanupRule, count: usize) {
        match rule {
            CleanupRule::DivBlocks => self.divs_removed += count,
            CleanupRule::Spans => self.spans_removed += count,
            CleanupRule::DuplicateImages => self.duplicate_images_removed += count,
            CleanupRule::Headers => self.headers_fixed += count,
            CleanupRule::Links => self.links_fixed += count,
            CleanupRule::Whitespace => {}
        }
    }
}

/// Apply every enabled rule, in order, until the text is a fixed point.
///
/// Line endings are always normalised to `\n` first.
pub fn clean_markdown(input: &str, options: &CleanupOptions) -> String {
    clean_markdown_with_stats(input, options).0
}

/// [`clean_markdown`] plus per-rule counts.
pub fn clean_markdown_with_stats(input: &str, options: &CleanupOptions) -> (String, CleanupStats) {
    let rules: Vec<CleanupRule> = CleanupRule::ORDER
        .into_iter()
        .filter(|r| r.is_enabled(options))
        .collect();

    let mut stats = CleanupStats::default();
    let mut text = normalise_line_endings(input);
    for pass in 1..=MAX_PASSES {
        let before = text.clone();
        for rule in &rules {
            let (next, count) = rule.apply_counted(&text);
            if next != text {
                debug!(rule = rule.name(), pass, count, "cleanup rule rewrote text");
            }
            stats.record(*rule, count);
            text = next;
        }
        if text == before {
            return (text, stats);
        }
    }
    warn!("cleanup did not settle after {MAX_PASSES} passes; output may not be stable");
    (text, stats)
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Line helpers shared by the rules ─────────────────────────────────────────

/// Split into lines, remembering whether the text ended with a newline.
pub(crate) fn split_lines(input: &str) -> (Vec<&str>, bool) {
    match input.strip_suffix('\n') {
        Some(body) => (body.split('\n').collect(), true),
        None => (input.split('\n').collect(), false),
    }
}

pub(crate) fn join_lines<S: AsRef<str>>(lines: &[S], trailing_newline: bool) -> String {
    let mut out = String::with_capacity(lines.iter().map(|l| l.as_ref().len() + 1).sum());
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(line.as_ref());
    }
    if trailing_newline {
        out.push('\n');
    }
    out
}

/// Tracks ``` / ~~~ fenced code blocks while scanning line by line.
#[derive(Debug, Default)]
pub(crate) struct CodeFence {
    open: Option<(char, usize)>,
}

impl CodeFence {
    /// Feed the next line; `true` when it belongs to a code block
    /// (fence lines included).
    pub(crate) fn is_code(&mut self, line: &str) -> bool {
        let trimmed = line.trim_start_matches(' ');
        let marker = if line.len() - trimmed.len() <= 3 {
            fence_marker(trimmed)
        } else {
            None
        };

        match (self.open, marker) {
            (None, Some((ch, len))) => {
                self.open = Some((ch, len));
                true
            }
            (Some((ch, len)), Some((c, n))) if c == ch && n >= len => {
                if trimmed[n..].trim().is_empty() {
                    self.open = None;
                }
                true
            }
            (Some(_), _) => true,
            (None, None) => false,
        }
    }
}

fn fence_marker(trimmed: &str) -> Option<(char, usize)> {
    let ch = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let len = trimmed.chars().take_while(|c| *c == ch).count();
    if len < 3 {
        return None;
    }
    if ch == '`' && trimmed[len..].contains('`') {
        return None;
    }
    Some((ch, len))
}

// ── Rule 1: Remove fenced-div markers ────────────────────────────────────────

static RE_DIV_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[ \t]{0,3}:{3,}[ \t]*(?:\{[^}\n]*\}|[^\s:{}]\S*)?[ \t]*:*[ \t]*$").unwrap()
});

static RE_HTML_DIV: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[ \t]*</?div(?:\s[^>]*)?/?>[ \t]*$").unwrap());

/// `\*\*\*` or `\* \* \*`: a scene break whose asterisks pandoc escaped.
static RE_ESCAPED_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[ \t]*\\\*(?:[ \t]*\\\*){2,}[ \t]*$").unwrap());

fn remove_div_blocks(input: &str) -> (String, usize) {
    let (lines, trailing) = split_lines(input);
    let mut fence = CodeFence::default();
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut removed = 0;

    for line in lines {
        if fence.is_code(line) {
            out.push(line);
        } else if RE_DIV_FENCE.is_match(line) || RE_HTML_DIV.is_match(line) {
            // Blank, not deleted: the marker may be the only thing
            // separating two paragraphs.
            out.push("");
            removed += 1;
        } else if RE_ESCAPED_BREAK.is_match(line) {
            out.extend(["", "---", ""]);
        } else {
            out.push(line);
        }
    }

    (join_lines(&out, trailing), removed)
}

// ── Rule 2: Remove span artefacts ────────────────────────────────────────────

static RE_EMPTY_SPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\s*\]\{[^{}\n]*\}").unwrap());

static RE_ATTR_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\[\]\n]+)\]\{[^{}\n]*\}").unwrap());

static RE_LINK_ATTRS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\]\([^()\n]*\))\{[^{}\n]*\}").unwrap());

static RE_SPAN_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</?span\b[^>]*>").unwrap());

fn remove_span_artifacts(input: &str) -> (String, usize) {
    let (lines, trailing) = split_lines(input);
    let mut fence = CodeFence::default();
    let mut removed = 0;
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for line in lines {
        if fence.is_code(line) {
            out.push(line.to_string());
        } else {
            let (line, n) = strip_spans(line);
            removed += n;
            out.push(line);
        }
    }
    (join_lines(&out, trailing), removed)
}

/// Strip inline residue until nothing matches; nested spans unwrap from the
/// inside out. Returns the line and the number of artefacts removed.
fn strip_spans(line: &str) -> (String, usize) {
    let mut current = line.to_string();
    let mut removed = 0;
    loop {
        let mut next = current.clone();
        for (re, with) in [
            (&*RE_EMPTY_SPAN, ""),
            (&*RE_ATTR_SPAN, "$1"),
            (&*RE_LINK_ATTRS, "$1"),
            (&*RE_SPAN_TAG, ""),
        ] {
            removed += re.find_iter(&next).count();
            next = re.replace_all(&next, with).into_owned();
        }
        if next == current {
            return (current, removed);
        }
        current = next;
    }
}

// ── Rule 2b: Remove repeated standalone images ───────────────────────────────

/// A line holding nothing but one Markdown image; group 1 is the target.
static RE_STANDALONE_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^[ \t]*!\[[^\]\n]*\]\(\s*(<[^<>\n]*>|[^\s()<>]+)(?:\s+"[^"\n]*")?\s*\)[ \t]*$"#)
        .unwrap()
});

/// The cover is often emitted twice (cover page plus title page). Later
/// whole-line copies of an image already shown are blanked.
fn remove_duplicate_images(input: &str) -> (String, usize) {
    let (lines, trailing) = split_lines(input);
    let mut fence = CodeFence::default();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut removed = 0;

    for line in lines {
        if !fence.is_code(line) {
            if let Some(target) = RE_STANDALONE_IMAGE.captures(line).and_then(|c| c.get(1)) {
                let target = target.as_str().trim_start_matches('<').trim_end_matches('>');
                if !seen.insert(target) {
                    out.push("");
                    removed += 1;
                    continue;
                }
            }
        }
        out.push(line);
    }

    (join_lines(&out, trailing), removed)
}

// ── Rule 5: Normalise whitespace ─────────────────────────────────────────────

const INVISIBLE: [char; 6] = [
    '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
];

fn normalise_whitespace(input: &str) -> String {
    let cleaned = input.replace(INVISIBLE, "");
    let (lines, _) = split_lines(&cleaned);
    let mut fence = CodeFence::default();
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());

    for line in lines {
        let in_code = fence.is_code(line);
        let line = line.trim_end();
        if !in_code && line.is_empty() {
            // No leading blanks, never two in a row.
            if out.last().is_none_or(|l: &&str| l.is_empty()) {
                continue;
            }
        }
        out.push(line);
    }

    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    if out.is_empty() {
        return String::from("\n");
    }
    join_lines(&out, true)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> CleanupOptions {
        CleanupOptions::default()
    }

    fn divs(input: &str) -> String {
        remove_div_blocks(input).0
    }

    fn strip(line: &str) -> String {
        strip_spans(line).0
    }

    #[test]
    fn test_reference_scenario() {
        let input = ":::div\n# Heading #\n:::\n\n[]{#anchor}Text";
        assert_eq!(clean_markdown(input, &all()), "# Heading\n\nText\n");
    }

    #[test]
    fn test_div_fences_removed_content_kept() {
        let input = "::: {#id .class1 .class2 style=\"color:red\"}\nContent here\n:::";
        let result = divs(input);
        assert!(!result.contains(":::"));
        assert!(result.contains("Content here"));
    }

    #[test]
    fn test_div_fence_keeps_paragraph_boundary() {
        let input = "First paragraph.\n:::\nSecond paragraph.";
        let result = clean_markdown(input, &all());
        assert_eq!(result, "First paragraph.\n\nSecond paragraph.\n");
    }

    #[test]
    fn test_div_fence_variants() {
        for fence in [":::", "::::", "::: section", "::: {.calibre}", "  :::  ", "::: note :::"] {
            assert_eq!(divs(fence), "", "fence {fence:?} not removed");
        }
        assert_eq!(divs("::: not a fence here"), "::: not a fence here");
    }

    #[test]
    fn test_html_div_lines_removed() {
        let result = divs("<div class=\"x\">\nBody\n</div>");
        assert_eq!(result, "\nBody\n");
    }

    #[test]
    fn test_escaped_scene_break_becomes_rule() {
        let result = clean_markdown("End of scene.\n\\*\\*\\*\nNext scene.", &all());
        assert_eq!(result, "End of scene.\n\n---\n\nNext scene.\n");
    }

    #[test]
    fn test_fences_inside_code_blocks_untouched() {
        let input = "```\n:::\n[]{#a}\n```";
        assert_eq!(clean_markdown(input, &all()), "```\n:::\n[]{#a}\n```\n");
    }

    #[test]
    fn test_empty_spans_removed() {
        assert_eq!(strip("[]{#anchor} Some text"), " Some text");
        assert_eq!(strip("[ ]{#anchor} More text"), " More text");
        assert_eq!(strip("a[]{#x .y}b"), "ab");
    }

    #[test]
    fn test_attributed_spans_unwrapped() {
        assert_eq!(strip("[Chapter]{.underline}"), "Chapter");
        assert_eq!(
            strip("[[Chapter 1]{.underline}](#ch1)"),
            "[Chapter 1](#ch1)"
        );
        assert_eq!(strip("[[]{#a}]{#b}text"), "text");
    }

    #[test]
    fn test_link_and_image_attributes_stripped() {
        assert_eq!(
            strip("![Cover](images/cover.jpg){#cover width=\"100%\"}"),
            "![Cover](images/cover.jpg)"
        );
        assert_eq!(strip("[site](https://a.b){.ext}"), "[site](https://a.b)");
    }

    #[test]
    fn test_span_tags_removed() {
        assert_eq!(strip("<span class=\"x\">word</span>"), "word");
    }

    #[test]
    fn test_plain_links_survive_span_rule() {
        let line = "[text](#target) and [other](http://x.y)";
        assert_eq!(strip(line), line);
    }

    #[test]
    fn test_repeated_cover_image_removed() {
        let input = "![Cover](images/cover.jpg)\n\nText\n\n![](<images/cover.jpg>)\n\n![Map](images/map.png)\n";
        let (out, removed) = remove_duplicate_images(input);
        assert_eq!(removed, 1);
        assert_eq!(out, "![Cover](images/cover.jpg)\n\nText\n\n\n\n![Map](images/map.png)\n");
    }

    #[test]
    fn test_inline_and_fenced_repeats_kept() {
        let input = "![a](x.png)\nsee ![a](x.png) inline\n```\n![a](x.png)\n```\n";
        assert_eq!(remove_duplicate_images(input), (input.to_string(), 0));
    }

    #[test]
    fn test_stats_count_each_rule() {
        let input = "::: wrap\n# Title {#t}\n\n![c](c.jpg)\n\n![c](c.jpg)\n\n[]{#a}[go](#filepos9)\n:::\n";
        let (out, stats) = clean_markdown_with_stats(input, &all());
        assert_eq!(out, "# Title\n\n![c](c.jpg)\n\ngo\n");
        assert_eq!(
            stats,
            CleanupStats {
                divs_removed: 2,
                spans_removed: 1,
                duplicate_images_removed: 1,
                headers_fixed: 1,
                links_fixed: 1,
            }
        );
    }

    #[test]
    fn test_whitespace_collapses_blank_runs() {
        assert_eq!(normalise_whitespace("a\n\n\n\n\nb"), "a\n\nb\n");
        assert_eq!(normalise_whitespace("a\n\nb"), "a\n\nb\n");
    }

    #[test]
    fn test_whitespace_trims_lines_and_edges() {
        assert_eq!(normalise_whitespace("\n\n  hello   \nworld  \n\n\n"), "  hello\nworld\n");
        assert_eq!(normalise_whitespace(""), "\n");
    }

    #[test]
    fn test_whitespace_keeps_blank_lines_in_code() {
        let input = "```\nfn a() {}\n\n\n\nfn b() {}\n```\n";
        assert_eq!(normalise_whitespace(input), input);
    }

    #[test]
    fn test_invisible_characters_removed() {
        assert_eq!(
            normalise_whitespace("hel\u{00AD}lo\u{200B} world\u{FEFF}"),
            "hello world\n"
        );
    }

    #[test]
    fn test_line_endings_normalised() {
        assert_eq!(clean_markdown("a\r\nb\rc", &all()), "a\nb\nc\n");
    }

    #[test]
    fn test_disabled_rules_pass_through() {
        let input = "::: x\n[]{#a}Text  \n";
        assert_eq!(clean_markdown(input, &CleanupOptions::none()), input);

        let only_spans = CleanupOptions {
            remove_spans: true,
            ..CleanupOptions::none()
        };
        assert_eq!(clean_markdown(input, &only_spans), "::: x\nText  \n");
    }

    #[test]
    fn test_each_rule_is_idempotent() {
        let samples = [
            ":::div\n# Heading #\n:::\n\n[]{#anchor}Text",
            "Title\n=====\nbody [x](#title) [y](ch2.xhtml#z)\n\n\n\n## **Bold** {#b}\n",
            "[[]{#a}]{#b}one\n\\* \\* \\*\n<div>\n```\n# code\n```\n",
            "#\n\n## \n[](#nowhere)\n",
            "![a](x.png)\n![b](x.png)\n![a](x.png)\n",
        ];
        for sample in samples {
            for rule in CleanupRule::ORDER {
                let once = rule.apply(sample);
                assert_eq!(rule.apply(&once), once, "rule {} not idempotent", rule.name());
            }
        }
    }

    #[test]
    fn test_pipeline_is_idempotent() {
        let samples = [
            "",
            "\n\n\n",
            ":::div\n# Heading #\n:::\n\n[]{#anchor}Text",
            "::: {#wrapper .container}\n# Title {#title .header}\n\n[]{#anchor}Some paragraph text.\n\n![](OEBPS/images/img.png)\n:::",
            "[]{#x}# Late heading\ntext\n===\nmore\n",
            "# A\nText\n===\n",
            "[:::](#gone)\n[Contents](#toc.xhtml_1)\n\n# Contents\n",
            "   # Indented #   \n\n\n\n\n```rust\nlet x = 1;   \n\n\n```\n~~~\n:::\n~~~\n",
        ];
        for options in [all(), CleanupOptions::none(), CleanupOptions { fix_headers: false, ..all() }] {
            for sample in samples {
                let once = clean_markdown(sample, &options);
                let twice = clean_markdown(&once, &options);
                assert_eq!(twice, once, "not idempotent for {sample:?} with {options:?}");
            }
        }
    }

    #[test]
    fn test_no_structural_artifacts_survive() {
        let input = "::: {#a}\n:::: {.b}\n[]{#c}Hello []{#d .e}world\n::::\n:::\n";
        let result = clean_markdown(input, &all());
        assert!(!result.contains(":::"));
        assert!(!result.contains("]{"));
        assert_eq!(result, "Hello world\n");
    }

    #[test]
    fn test_code_fence_tracking() {
        let mut f = CodeFence::default();
        let flags: Vec<bool> = ["a", "````md", "```", "x", "````", "b", "~~~", "y", "~~~"]
            .iter()
            .map(|l| f.is_code(l))
            .collect();
        assert_eq!(flags, [false, true, true, true, true, false, true, true, true]);
    }
}
