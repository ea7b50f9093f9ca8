use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Category of pressure language forbidden in approval prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCategory {
    Urgency,
    Fear,
    Authority,
    Optimization,
}

impl ViolationCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Urgency => "urgency",
            Self::Fear => "fear",
            Self::Authority => "authority",
            Self::Optimization => "optimization",
        }
    }
}

impl fmt::Display for ViolationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A forbidden term found in prompt text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageViolation {
    pub category: ViolationCategory,
    pub term: String,
    /// Word offset of the first matched word.
    pub position: usize,
}

const URGENCY: &[&str] = &[
    "urgent",
    "urgently",
    "immediately",
    "immediate",
    "now",
    "hurry",
    "deadline",
    "last chance",
];

const FEAR: &[&str] = &[
    "dangerous",
    "danger",
    "risk",
    "risks",
    "risky",
    "warning",
    "problem",
    "problems",
];

const AUTHORITY: &[&str] = &[
    "recommend",
    "recommends",
    "recommended",
    "should",
    "best option",
    "advised",
    "advise",
];

const OPTIMIZATION: &[&str] = &[
    "save money",
    "optimize",
    "optimise",
    "better rate",
    "improve",
    "improves",
];

/// Scans approval prompt text for pressure language.
///
/// Matching is case-insensitive over whole words; phrases match consecutive
/// words, so "know" never matches "now".
#[derive(Debug, Clone)]
pub struct LanguageChecker {
    rules: Vec<(ViolationCategory, Vec<Vec<String>>)>,
}

impl LanguageChecker {
    pub fn new() -> Self {
        let rules = [
            (ViolationCategory::Urgency, URGENCY),
            (ViolationCategory::Fear, FEAR),
            (ViolationCategory::Authority, AUTHORITY),
            (ViolationCategory::Optimization, OPTIMIZATION),
        ]
        .into_iter()
        .map(|(category, terms)| {
            let phrases = terms.iter().map(|term| tokenize(term)).collect();
            (category, phrases)
        })
        .collect();

        Self { rules }
    }

    /// Return every violation in `text`, ordered by position.
    pub fn check(&self, text: &str) -> Vec<LanguageViolation> {
        let words = tokenize(text);
        let mut violations = Vec::new();

        for (category, phrases) in &self.rules {
            for phrase in phrases {
                if phrase.is_empty() || phrase.len() > words.len() {
                    continue;
                }
                for (position, window) in words.windows(phrase.len()).enumerate() {
                    if window == phrase.as_slice() {
                        violations.push(LanguageViolation {
                            category: *category,
                            term: phrase.join(" "),
                            position,
                        });
                    }
                }
            }
        }

        violations.sort_by_key(|v| v.position);
        if !violations.is_empty() {
            warn!(
                count = violations.len(),
                first = %violations[0].term,
                "Pressure language detected in prompt"
            );
        }
        violations
    }

    pub fn is_clean(&self, text: &str) -> bool {
        self.check(text).is_empty()
    }
}

impl Default for LanguageChecker {
    fn default() -> Self {
        Self::new()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|word| word.trim_matches('\'').to_lowercase())
        .filter(|word| !word.is_empty())
        .collect()
}
