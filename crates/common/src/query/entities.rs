//! Entity extraction
//!
//! Pulls literal entities out of question text: batch/lot ids, component
//! names, date mentions, production thresholds and metric mentions.

use super::dates::{DateExpression, RelativePeriod};
use regex_lite::Regex;
use std::sync::LazyLock;

static SINGLE_QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\W)'([^'\n]+)'(?:\W|$)").expect("single-quote regex is valid")
});
static DOUBLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"\n]+)""#).expect("double-quote regex is valid"));
static ASTERISKED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*\n]+)\*").expect("asterisk regex is valid"));

static BATCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:batch|lot)\b(?:\s+(?:id|number|no)\b)?\s*[:#]?\s*([A-Za-z0-9][A-Za-z0-9_:\-]*)")
        .expect("batch regex is valid")
});
static COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:component|part)\b(?:\s+(?:name|id)\b)?\s*[:#]?\s*([A-Za-z0-9][A-Za-z0-9_\-]*)")
        .expect("component regex is valid")
});
static RELATIVE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(today|yesterday|this\s+week|last\s+week|this\s+month|last\s+month)\b")
        .expect("relative date regex is valid")
});
static ABSOLUTE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|\D)(\d{1,2}[_/\-]\d{1,2}[_/\-]\d{4})(?:\D|$)")
        .expect("absolute date regex is valid")
});
static THRESHOLD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:production|quantity)\b(?:\s+(?:of|above|over|exceeding|at\s+least|greater\s+than|more\s+than))?\s*(?:>=|>)?\s*(\d+)",
    )
    .expect("threshold regex is valid")
});
static METRICS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:performance|efficiency|quality)\b").expect("metrics regex is valid")
});

/// Words that follow "batch"/"component" in ordinary phrasing without naming anything
const STOP_WORDS: &[&str] = &[
    "a", "all", "an", "and", "are", "at", "by", "count", "data", "details", "for", "from",
    "had", "has", "have", "in", "info", "information", "is", "last", "list", "name", "names",
    "ng", "not", "of", "on", "or", "per", "production", "quality", "report", "reports", "that",
    "the", "this", "to", "today", "was", "were", "which", "with", "yesterday",
];

/// Everything the condition builder needs from the question
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedEntities {
    pub batch: Option<String>,
    pub component: Option<String>,
    pub date: Option<DateExpression>,
    pub production_threshold: Option<u64>,
    pub mentions_metrics: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EntityExtractor;

impl EntityExtractor {
    pub fn extract(&self, question: &str) -> ExtractedEntities {
        ExtractedEntities {
            batch: capture_entity(&BATCH, question)
                .map(|b| b.trim_end_matches([':', '-', '_']).to_string())
                .filter(|b| !b.is_empty()),
            component: capture_entity(&COMPONENT, question),
            date: extract_date(question),
            production_threshold: extract_threshold(question),
            mentions_metrics: METRICS.is_match(question),
        }
    }
}

/// Delimited component name: single quotes, else double quotes, else asterisks.
pub fn extract_component_name(question: &str) -> Option<String> {
    [&*SINGLE_QUOTED, &*DOUBLE_QUOTED, &*ASTERISKED]
        .into_iter()
        .find_map(|pattern| {
            pattern
                .captures(question)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
                .filter(|name| !name.is_empty())
        })
}

/// Relative keywords win over absolute digit dates.
pub fn extract_date(question: &str) -> Option<DateExpression> {
    if let Some(period) = RELATIVE_DATE
        .captures(question)
        .and_then(|caps| caps.get(1))
        .and_then(|m| RelativePeriod::parse(m.as_str()))
    {
        return Some(DateExpression::Relative(period));
    }

    ABSOLUTE_DATE
        .captures(question)
        .and_then(|caps| caps.get(1))
        .map(|m| DateExpression::Absolute(m.as_str().to_string()))
}

fn extract_threshold(question: &str) -> Option<u64> {
    THRESHOLD.captures_iter(question).find_map(|caps| {
        let number = caps.get(1)?;
        // "production 24_02_2025" names a day, not a quantity
        let next = question[number.end()..].chars().next();
        if matches!(next, Some('_' | '/' | '-')) {
            return None;
        }
        number.as_str().parse().ok()
    })
}

fn capture_entity(pattern: &Regex, question: &str) -> Option<String> {
    pattern.captures_iter(question).find_map(|caps| {
        let token = caps.get(1)?.as_str();
        if STOP_WORDS.contains(&token.to_lowercase().as_str()) {
            None
        } else {
            Some(token.to_string())
        }
    })
}
