//! The fixed pipeline stage sequence.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of the content pipeline.
///
/// Every entity moves through the same four stages in order. There is no
/// branching and no skipping; the only variation is how each stage resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Resolve and validate the content source.
    Prospect,
    /// Pull clean text and derive summaries, highlights and insights.
    Extract,
    /// Draft the transmuted content and persist the draft.
    Transmute,
    /// Render the requested output formats.
    Confer,
}

/// All stages in pipeline order.
pub const STAGE_SEQUENCE: [Stage; 4] = [
    Stage::Prospect,
    Stage::Extract,
    Stage::Transmute,
    Stage::Confer,
];

impl Stage {
    /// The entry stage of the pipeline.
    #[must_use]
    pub const fn first() -> Self {
        Self::Prospect
    }

    /// The stage that follows this one, or `None` after `Confer`.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Prospect => Some(Self::Extract),
            Self::Extract => Some(Self::Transmute),
            Self::Transmute => Some(Self::Confer),
            Self::Confer => None,
        }
    }

    /// Returns true for the final stage of the pipeline.
    #[must_use]
    pub const fn is_last(self) -> bool {
        matches!(self, Self::Confer)
    }

    /// Zero-based position in the pipeline order.
    #[must_use]
    pub const fn position(self) -> usize {
        match self {
            Self::Prospect => 0,
            Self::Extract => 1,
            Self::Transmute => 2,
            Self::Confer => 3,
        }
    }

    /// Stable lowercase name used in keys, logs and serialized records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prospect => "prospect",
            Self::Extract => "extract",
            Self::Transmute => "transmute",
            Self::Confer => "confer",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::first(), Stage::Prospect);
        assert_eq!(Stage::Prospect.next(), Some(Stage::Extract));
        assert_eq!(Stage::Extract.next(), Some(Stage::Transmute));
        assert_eq!(Stage::Transmute.next(), Some(Stage::Confer));
        assert_eq!(Stage::Confer.next(), None);
    }

    #[test]
    fn test_stage_is_last() {
        assert!(Stage::Confer.is_last());
        assert!(!Stage::Prospect.is_last());
    }

    #[test]
    fn test_stage_sequence_matches_next() {
        for pair in STAGE_SEQUENCE.windows(2) {
            assert_eq!(pair[0].next(), Some(pair[1]));
        }
        assert_eq!(STAGE_SEQUENCE[0], Stage::first());
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Prospect.to_string(), "prospect");
        assert_eq!(Stage::Confer.to_string(), "confer");
    }

    #[test]
    fn test_stage_serialize() {
        let json = serde_json::to_string(&Stage::Transmute).unwrap();
        assert_eq!(json, r#""transmute""#);

        let back: Stage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Stage::Transmute);
    }

    #[test]
    fn test_stage_position() {
        assert_eq!(Stage::Prospect.position(), 0);
        assert_eq!(Stage::Confer.position(), 3);
    }
}
