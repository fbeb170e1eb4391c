//! Rule 4: internal link repair.
//!
//! Targets inside the archive (`#filepos123`, `ch02.xhtml#sec4`) stop making
//! sense once the book is one Markdown file. Each such link is pointed at a
//! heading anchor of the document when one can be matched, by fragment or by
//! the link's own text, and otherwise reduced to its text. External links and
//! images are left alone.

use crate::pipeline::cleanup::{join_lines, split_lines, CodeFence};
use crate::pipeline::headings::{explicit_id, parse_atx, slugify};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};

static RE_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(!?)\[([^\[\]\n]*)\]\(\s*(<[^<>\n]*>|[^\s()<>]*)(\s+"[^"\n]*")?\s*\)"#).unwrap()
});

static RE_SCHEME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:").unwrap());

const DOCUMENT_EXTENSIONS: [&str; 3] = [".xhtml", ".html", ".htm"];

/// Returns the rewritten text and the number of links that changed.
pub(crate) fn fix_links(input: &str) -> (String, usize) {
    let anchors = collect_anchors(input);
    let (lines, trailing) = split_lines(input);
    let mut fence = CodeFence::default();
    let mut fixed = 0;
    let mut out: Vec<String> = Vec::with_capacity(lines.len());

    for line in lines {
        if fence.is_code(line) || !line.contains("](") {
            out.push(line.to_string());
            continue;
        }
        let rewritten = RE_LINK.replace_all(line, |caps: &Captures| {
            let link = rewrite_link(caps, &anchors);
            if link != caps[0] {
                fixed += 1;
            }
            link
        });
        out.push(rewritten.into_owned());
    }

    (join_lines(&out, trailing), fixed)
}

/// Every anchor the document defines: explicit heading ids plus generated
/// slugs, de-duplicated the way GitHub does (`intro`, `intro-1`, ...).
fn collect_anchors(input: &str) -> HashSet<String> {
    let mut anchors = HashSet::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut fence = CodeFence::default();

    for line in input.lines() {
        if fence.is_code(line) {
            continue;
        }
        let Some((_, text)) = parse_atx(line) else {
            continue;
        };
        if let Some(id) = explicit_id(text) {
            anchors.insert(id.to_string());
        }
        let slug = slugify(text);
        if slug.is_empty() {
            continue;
        }
        let unique = match counts.get_mut(&slug) {
            None => {
                counts.insert(slug.clone(), 0);
                slug
            }
            Some(n) => {
                *n += 1;
                format!("{slug}-{n}")
            }
        };
        anchors.insert(unique);
    }

    anchors
}

fn rewrite_link(caps: &Captures, anchors: &HashSet<String>) -> String {
    let whole = &caps[0];
    if !caps[1].is_empty() {
        return whole.to_string();
    }
    let text = &caps[2];
    let target = caps[3].trim_start_matches('<').trim_end_matches('>');
    let title = caps.get(4).map_or("", |m| m.as_str());

    let Some(fragment) = internal_fragment(target) else {
        return whole.to_string();
    };

    match resolve(fragment, text, anchors) {
        Some(anchor) => format!("[{text}](#{anchor}{title})"),
        None => text.to_string(),
    }
}

/// The fragment of a link that points inside the book, or `None` for
/// external and non-document targets.
fn internal_fragment(target: &str) -> Option<&str> {
    if let Some(fragment) = target.strip_prefix('#') {
        return Some(fragment);
    }
    if RE_SCHEME.is_match(target) {
        return None;
    }
    let (path, fragment) = target.split_once('#').unwrap_or((target, ""));
    let path = path.to_ascii_lowercase();
    DOCUMENT_EXTENSIONS
        .iter()
        .any(|ext| path.ends_with(ext))
        .then_some(fragment)
}

fn resolve(fragment: &str, text: &str, anchors: &HashSet<String>) -> Option<String> {
    if !fragment.is_empty() && anchors.contains(fragment) {
        return Some(fragment.to_string());
    }
    [slugify(text), slugify(fragment)]
        .into_iter()
        .find(|candidate| !candidate.is_empty() && anchors.contains(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(input: &str) -> String {
        fix_links(input).0
    }

    #[test]
    fn valid_fragment_links_are_kept() {
        let input = "# Intro\n\nSee [the intro](#intro).";
        assert_eq!(fix(input), input);
    }

    #[test]
    fn archive_links_resolve_by_text() {
        let input = "[Chapter One](#index_split_001.html_filepos42)\n\n# Chapter One\n";
        assert_eq!(
            fix(input),
            "[Chapter One](#chapter-one)\n\n# Chapter One\n"
        );
    }

    #[test]
    fn cross_file_links_resolve_by_fragment() {
        let input = "[next](ch02.xhtml#chapter-two)\n\n## Chapter Two\n";
        assert_eq!(fix(input), "[next](#chapter-two)\n\n## Chapter Two\n");
    }

    #[test]
    fn unresolvable_internal_links_become_text() {
        assert_eq!(fix("go to [page 12](#filepos99) now"), "go to page 12 now");
        assert_eq!(fix("[Notes](notes.html)"), "Notes");
        assert_eq!(fix("a [](#gone) b"), "a  b");
    }

    #[test]
    fn external_links_and_images_untouched() {
        let input = "[site](https://example.com/a.html#x) [mail](mailto:a@b.c) \
                     ![cover](images/cover.jpg) [pdf](files/a.pdf)";
        assert_eq!(fix(input), input);
    }

    #[test]
    fn explicit_ids_are_valid_targets() {
        let input = "# Title {#t1}\n\n[back](#t1)";
        assert_eq!(fix(input), input);
    }

    #[test]
    fn duplicate_headings_get_numbered_anchors() {
        let input = "# Notes\n\n# Notes\n\n[second](#notes-1) [third](#notes-2)";
        assert_eq!(
            fix(input),
            "# Notes\n\n# Notes\n\n[second](#notes-1) third"
        );
    }

    #[test]
    fn titles_survive_rewriting() {
        let input = "# Part\n\n[p](part.xhtml#part \"Go\")";
        assert_eq!(fix(input), "# Part\n\n[p](#part \"Go\")");
    }

    #[test]
    fn links_in_code_untouched() {
        let input = "```\n[x](#nowhere)\n```";
        assert_eq!(fix(input), input);
    }

    #[test]
    fn rewriting_is_stable() {
        let input = "[Chapter One](#x.html_1) [gone](#y)\n\n# Chapter One\n";
        let once = fix(input);
        assert_eq!(fix(&once), once);
    }

    #[test]
    fn changed_links_are_counted() {
        let input = "# Chapter One\n\n[Chapter One](#filepos1) [ok](#chapter-one) [x](#gone)";
        assert_eq!(fix_links(input).1, 2);
        assert_eq!(fix_links("[site](https://example.com)").1, 0);
    }
}
