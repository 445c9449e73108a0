//! Intent classification
//!
//! Each flag is an independent case-insensitive vocabulary test over the
//! question. The rules live in one table and are evaluated once per question;
//! several flags may be set at the same time.

use super::entities::extract_component_name;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Independent signals derived from question text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentFlag {
    NgQuery,
    NeedsAggregation,
    Comparative,
    ComponentList,
    GeneralQuery,
}

static INTENT_RULES: LazyLock<Vec<(IntentFlag, Regex)>> = LazyLock::new(|| {
    [
        (IntentFlag::NgQuery, r"(?i)\b(?:ng|not\s+good|defect\w*|reject\w*)\b"),
        (
            IntentFlag::NeedsAggregation,
            r"(?i)\b(?:most|max|maximum|highest|lowest|min|minimum|average|sum|total)\b",
        ),
        (IntentFlag::Comparative, r"(?i)\b(?:more|less|greater|than|compare\w*)\b"),
        (
            IntentFlag::ComponentList,
            r"(?i)\b(?:components|parts)\b|\b(?:what|which|list)\b.*\bcomponents?\b",
        ),
        (
            IntentFlag::GeneralQuery,
            r"(?i)\b(?:what|which)\b.*\bdata\b|\bavailable\s+data\b",
        ),
    ]
    .into_iter()
    .map(|(flag, pattern)| (flag, Regex::new(pattern).expect("intent regex is valid")))
    .collect()
});

/// Classified question
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryIntent {
    pub is_ng_query: bool,
    pub needs_aggregation: bool,
    pub is_comparative: bool,
    pub is_component_list: bool,
    pub is_general_query: bool,

    /// Quoted or asterisk-delimited component name, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_name: Option<String>,
}

impl QueryIntent {
    fn set(&mut self, flag: IntentFlag) {
        match flag {
            IntentFlag::NgQuery => self.is_ng_query = true,
            IntentFlag::NeedsAggregation => self.needs_aggregation = true,
            IntentFlag::Comparative => self.is_comparative = true,
            IntentFlag::ComponentList => self.is_component_list = true,
            IntentFlag::GeneralQuery => self.is_general_query = true,
        }
    }

    pub fn has(&self, flag: IntentFlag) -> bool {
        match flag {
            IntentFlag::NgQuery => self.is_ng_query,
            IntentFlag::NeedsAggregation => self.needs_aggregation,
            IntentFlag::Comparative => self.is_comparative,
            IntentFlag::ComponentList => self.is_component_list,
            IntentFlag::GeneralQuery => self.is_general_query,
        }
    }

    /// Whether the question should be answered through an aggregation pipeline
    pub fn wants_pipeline(&self) -> bool {
        self.is_ng_query || self.is_component_list || self.needs_aggregation || self.is_general_query
    }

    /// Flags that are set, in table order
    pub fn flags(&self) -> Vec<IntentFlag> {
        INTENT_RULES
            .iter()
            .map(|(flag, _)| *flag)
            .filter(|flag| self.has(*flag))
            .collect()
    }
}

/// Pure classifier over question text
#[derive(Debug, Clone, Copy, Default)]
pub struct IntentClassifier;

impl IntentClassifier {
    pub fn classify(&self, question: &str) -> QueryIntent {
        let mut intent = QueryIntent::default();

        for (flag, pattern) in INTENT_RULES.iter() {
            if pattern.is_match(question) {
                intent.set(*flag);
            }
        }

        intent.component_name = extract_component_name(question);
        intent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(q: &str) -> QueryIntent {
        IntentClassifier.classify(q)
    }

    #[test]
    fn test_ng_vocabulary() {
        assert!(classify("show NG parts").is_ng_query);
        assert!(classify("which batches were Not Good").is_ng_query);
        assert!(classify("defects in lot 7").is_ng_query);
        assert!(classify("how many rejected units").is_ng_query);
        assert!(!classify("morning shift output").is_ng_query);
    }

    #[test]
    fn test_flags_are_not_exclusive() {
        let intent = classify("show batches with most ng parts");

        assert!(intent.is_ng_query);
        assert!(intent.needs_aggregation);
        assert!(intent.is_component_list);
        assert!(!intent.is_comparative);
        assert_eq!(
            intent.flags(),
            vec![IntentFlag::NgQuery, IntentFlag::NeedsAggregation, IntentFlag::ComponentList]
        );
    }

    #[test]
    fn test_comparative_and_general() {
        let intent = classify("Which data has production greater than 500?");
        assert!(intent.is_comparative);
        assert!(intent.is_general_query);

        assert!(classify("list available data").is_general_query);
    }

    #[test]
    fn test_component_list_needs_list_phrasing() {
        assert!(classify("what components were produced").is_component_list);
        assert!(classify("list all parts").is_component_list);
        assert!(!classify("production of component BRKT-7").is_component_list);
    }

    #[test]
    fn test_component_name_is_carried() {
        let intent = classify("inspect 'ABC_1' images");
        assert_eq!(intent.component_name.as_deref(), Some("ABC_1"));
        assert!(!intent.wants_pipeline());
    }
}
