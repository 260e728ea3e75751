//! Structural validation of markdown documents such as change proposals.
//!
//! A document is valid when every required section appears as a heading
//! (case-insensitive) and it carries at least N checklist acceptance items
//! (`- [ ] ...` or `- [x] ...`). Items are counted inside the acceptance
//! section when one exists, otherwise across the whole document.

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

use super::CheckOutcome;

const CHECK: &str = "structural_document";

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s{0,3}(#{1,6})\s+(.+?)\s*#*\s*$").expect("valid regex"));
static CHECKLIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*+]\s+\[[ xX]\]\s+\S").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
struct Heading {
    level: usize,
    title: String,
    line: usize,
}

fn normalize_title(title: &str) -> String {
    title.trim().trim_end_matches(':').trim().to_lowercase()
}

fn headings(content: &str) -> Vec<Heading> {
    content
        .lines()
        .enumerate()
        .filter_map(|(line, text)| {
            HEADING.captures(text).map(|caps| Heading {
                level: caps[1].len(),
                title: normalize_title(&caps[2]),
                line,
            })
        })
        .collect()
}

/// Count checklist items, scoped to the acceptance section when present.
fn count_acceptance_items(content: &str, headings: &[Heading]) -> usize {
    let lines: Vec<&str> = content.lines().collect();
    let section = headings
        .iter()
        .enumerate()
        .find(|(_, h)| h.title.contains("acceptance"));

    let (start, end) = match section {
        Some((i, heading)) => {
            let end = headings[i + 1..]
                .iter()
                .find(|h| h.level <= heading.level)
                .map(|h| h.line)
                .unwrap_or(lines.len());
            (heading.line + 1, end)
        }
        None => (0, lines.len()),
    };

    lines[start..end]
        .iter()
        .filter(|l| CHECKLIST_ITEM.is_match(l))
        .count()
}

/// Validate the markdown at `path`. `None` means the document was not found.
pub fn check_document(
    path: Option<&Path>,
    display: &str,
    required_sections: &[String],
    min_items: usize,
) -> Vec<CheckOutcome> {
    let subject = Some(display.to_string());
    let Some(path) = path else {
        return vec![CheckOutcome::fail(
            CHECK,
            subject,
            format!("document {} not found", display),
        )];
    };
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            return vec![CheckOutcome::fail(
                CHECK,
                subject,
                format!("failed to read {}: {}", display, e),
            )];
        }
    };
    check_content(&content, display, required_sections, min_items)
}

/// Validate markdown content: one outcome for sections, one for acceptance items.
pub fn check_content(
    content: &str,
    display: &str,
    required_sections: &[String],
    min_items: usize,
) -> Vec<CheckOutcome> {
    let subject = Some(display.to_string());
    let found = headings(content);

    let missing: Vec<&str> = required_sections
        .iter()
        .filter(|required| {
            let wanted = normalize_title(required);
            !found.iter().any(|h| h.title == wanted)
        })
        .map(|s| s.as_str())
        .collect();

    let sections = if missing.is_empty() {
        CheckOutcome::pass(
            CHECK,
            subject.clone(),
            format!("all {} required sections present", required_sections.len()),
        )
    } else {
        CheckOutcome::fail(
            CHECK,
            subject.clone(),
            format!("missing required sections: {}", missing.join(", ")),
        )
    };

    let items = count_acceptance_items(content, &found);
    let acceptance = if items >= min_items {
        CheckOutcome::pass(
            CHECK,
            subject,
            format!("{} acceptance items (minimum {})", items, min_items),
        )
    } else {
        CheckOutcome::fail(
            CHECK,
            subject,
            format!(
                "only {} acceptance items, at least {} required",
                items, min_items
            ),
        )
    };

    vec![sections, acceptance]
}
