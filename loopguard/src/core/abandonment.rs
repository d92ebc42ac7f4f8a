//! Lexical detection of give-up, deflection, and permission-seeking language.
//!
//! Tiers are checked in priority order and the first match wins. Matching is a
//! case-insensitive substring search with no semantic understanding, so false
//! positives are expected; the dispatcher decides what a match means.

use serde::Serialize;

/// Category assigned to a piece of agent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    LegitimateCompletion,
    DirectAbandonment,
    PassiveDeflection,
    PermissionSeeking,
    None,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::LegitimateCompletion => "legitimate_completion",
            Category::DirectAbandonment => "direct_abandonment",
            Category::PassiveDeflection => "passive_deflection",
            Category::PermissionSeeking => "permission_seeking",
            Category::None => "none",
        }
    }
}

/// Category plus the pattern that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub category: Category,
    pub matched: Option<String>,
}

impl Classification {
    fn none() -> Self {
        Self {
            category: Category::None,
            matched: None,
        }
    }
}

/// Inputs that change how text is classified.
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext<'a> {
    /// Permission-seeking is only meaningful while a task is in flight.
    pub task_active: bool,
    /// Operator-configured completion markers on top of the built-ins.
    pub extra_completion_markers: &'a [String],
}

/// Narrow seam so the pattern table can be swapped for another classifier.
pub trait Classifier {
    fn classify(&self, text: &str, ctx: &ClassifyContext<'_>) -> Classification;
}

pub const COMPLETION_MARKERS: &[&str] = &[
    "exit_signal: true",
    "exit_signal:true",
    "<promise>complete</promise>",
    "<promise>done</promise>",
    "task_complete",
    "all_tasks_complete",
];

const DIRECT_ABANDONMENT: &[&str] = &[
    "i give up",
    "i'm giving up",
    "i am giving up",
    "i'm stuck",
    "i am stuck",
    "i cannot complete",
    "i can't complete",
    "i'm unable to complete",
    "i am unable to complete",
    "unable to proceed",
    "i'll stop here",
    "i will stop here",
    "this is beyond my",
    "not possible to complete",
    "abandoning this",
];

const PASSIVE_DEFLECTION: &[&str] = &[
    "you may want to",
    "you might want to",
    "you could try",
    "you'll need to",
    "you will need to",
    "you can manually",
    "would require manual",
    "left as an exercise",
    "the user should",
    "i'll leave this",
    "i'll leave that",
    "outside the scope of what i can",
];

const PERMISSION_SEEKING: &[&str] = &[
    "let me know if you'd like",
    "let me know if you would like",
    "let me know how you'd like",
    "would you like me to",
    "do you want me to",
    "shall i continue",
    "shall i proceed",
    "should i continue",
    "should i proceed",
    "want me to continue",
];

/// Default classifier backed by fixed phrase tables.
#[derive(Debug, Clone, Default)]
pub struct PatternClassifier;

impl Classifier for PatternClassifier {
    fn classify(&self, text: &str, ctx: &ClassifyContext<'_>) -> Classification {
        let haystack = normalize(text);

        let extra = ctx
            .extra_completion_markers
            .iter()
            .map(|marker| normalize(marker))
            .find(|marker| !marker.is_empty() && haystack.contains(marker.as_str()));
        if let Some(marker) = extra {
            return Classification {
                category: Category::LegitimateCompletion,
                matched: Some(marker),
            };
        }

        let tiers: [(Category, &[&str], bool); 4] = [
            (Category::LegitimateCompletion, COMPLETION_MARKERS, true),
            (Category::DirectAbandonment, DIRECT_ABANDONMENT, true),
            (Category::PassiveDeflection, PASSIVE_DEFLECTION, true),
            (
                Category::PermissionSeeking,
                PERMISSION_SEEKING,
                ctx.task_active,
            ),
        ];
        for (category, patterns, enabled) in tiers {
            if !enabled {
                continue;
            }
            if let Some(pattern) = patterns.iter().find(|p| haystack.contains(**p)) {
                return Classification {
                    category,
                    matched: Some((*pattern).to_string()),
                };
            }
        }
        Classification::none()
    }
}

/// Lowercase and fold typographic apostrophes so "I’m stuck" matches "i'm stuck".
fn normalize(text: &str) -> String {
    text.to_lowercase().replace(['\u{2019}', '\u{2018}'], "'")
}
