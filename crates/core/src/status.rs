//! Lifecycle status enums for iterations and images.
//!
//! Wire values are lowercase snake_case strings stored in the documents.

use serde::{Deserialize, Serialize};

/// Lifecycle of a project iteration.
///
/// The status advances through a monotone sequence and never leaves a
/// terminal state:
///
/// ```text
/// Downloading -> CutoutExtraction -> Analyzing -> Annotating -> Completed
///       \______________\______________\______________\-------> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Downloading,
    CutoutExtraction,
    Analyzing,
    Annotating,
    Completed,
    Failed,
}

impl IterationStatus {
    /// Terminal states accept no further mutation.
    pub fn is_terminal(self) -> bool {
        matches!(self, IterationStatus::Completed | IterationStatus::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// `Failed` is reachable from every non-terminal state; otherwise only
    /// the next stage in the sequence is allowed.
    pub fn can_transition_to(self, next: IterationStatus) -> bool {
        use IterationStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) => true,
            (Downloading, CutoutExtraction) => true,
            (CutoutExtraction, Analyzing) => true,
            (Analyzing, Annotating) => true,
            (Annotating, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IterationStatus::Downloading => "downloading",
            IterationStatus::CutoutExtraction => "cutout_extraction",
            IterationStatus::Analyzing => "analyzing",
            IterationStatus::Annotating => "annotating",
            IterationStatus::Completed => "completed",
            IterationStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a dataset image within an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetImageStatus {
    Pending,
    Downloaded,
    Extracted,
    Annotated,
}

/// Lifecycle of a product image within an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductImageStatus {
    Pending,
    Downloaded,
    Analyzed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_monotone() {
        use IterationStatus::*;
        assert!(Downloading.can_transition_to(CutoutExtraction));
        assert!(CutoutExtraction.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Annotating));
        assert!(Annotating.can_transition_to(Completed));
        assert!(!Downloading.can_transition_to(Analyzing));
        assert!(!Analyzing.can_transition_to(Downloading));
    }

    #[test]
    fn failed_reachable_from_any_non_terminal() {
        use IterationStatus::*;
        for s in [Downloading, CutoutExtraction, Analyzing, Annotating] {
            assert!(s.can_transition_to(Failed));
        }
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Downloading));
    }

    #[test]
    fn wire_format_is_snake_case() {
        let s = serde_json::to_string(&IterationStatus::CutoutExtraction).unwrap();
        assert_eq!(s, "\"cutout_extraction\"");
        let back: IterationStatus = serde_json::from_str("\"downloading\"").unwrap();
        assert_eq!(back, IterationStatus::Downloading);
    }
}
