//! Assertions over entity status, stage records and emitted events.

use crate::coordinator::StatusView;
use crate::core::{CompensationReport, RecordStatus, Stage, StageRecord};
use crate::events::CollectingEventSink;

/// Asserts the history covers exactly `expected` stages, oldest first.
pub fn assert_history_stages(status: &StatusView, expected: &[Stage]) {
    let actual: Vec<Stage> = status.history.iter().map(|r| r.stage).collect();
    assert_eq!(
        actual, expected,
        "Expected history stages {:?}, got {:?}",
        expected, actual
    );
}

/// Asserts the record resolved with the expected status.
pub fn assert_record_status(record: &StageRecord, expected: RecordStatus) {
    assert_eq!(
        record.status, expected,
        "Expected record status {:?}, got {:?}",
        expected, record.status
    );
}

/// Asserts exactly these activities completed, in record order.
pub fn assert_completed_activities(record: &StageRecord, expected: &[&str]) {
    let actual: Vec<&str> = record
        .activities
        .iter()
        .filter(|o| o.is_completed())
        .map(|o| o.name.as_str())
        .collect();
    assert_eq!(
        actual, expected,
        "Expected completed activities {:?}, got {:?}",
        expected, actual
    );
}

/// Asserts which activities the compensation walk undid, in walk order.
pub fn assert_compensated(report: &CompensationReport, expected: &[&str]) {
    assert_eq!(
        report.compensated, expected,
        "Expected compensated activities {:?}, got {:?}",
        expected, report.compensated
    );
}

/// Asserts an event type was emitted exactly `expected` times.
pub fn assert_event_count(events: &CollectingEventSink, event_type: &str, expected: usize) {
    let actual = events.count_of(event_type);
    assert_eq!(
        actual, expected,
        "Expected {} '{}' events, got {}",
        expected, event_type, actual
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ActivityOutcome;
    use crate::events::EventSink;

    fn record_with(names: &[(&str, bool)]) -> StageRecord {
        let mut record = StageRecord::begin(Stage::Extract, 0);
        for (name, completed) in names {
            let outcome = ActivityOutcome::planned(*name, "idem:x");
            let outcome = if *completed {
                outcome.completed(1, serde_json::json!({}))
            } else {
                outcome
            };
            record.activities.push(outcome);
        }
        record
    }

    #[test]
    fn test_assert_completed_activities() {
        let record = record_with(&[("a", true), ("b", false), ("c", true)]);
        assert_completed_activities(&record, &["a", "c"]);
    }

    #[test]
    #[should_panic(expected = "Expected completed activities")]
    fn test_assert_completed_activities_fails() {
        let record = record_with(&[("a", false)]);
        assert_completed_activities(&record, &["a"]);
    }

    #[test]
    fn test_assert_compensated() {
        let report = CompensationReport::clean(
            vec!["c".to_string(), "a".to_string()],
            vec!["b".to_string()],
        );
        assert_compensated(&report, &["c", "a"]);
    }

    #[test]
    fn test_assert_event_count() {
        let events = CollectingEventSink::new();
        events.try_emit("stage.completed", None);
        events.try_emit("stage.completed", None);
        assert_event_count(&events, "stage.completed", 2);
    }

    #[test]
    #[should_panic(expected = "Expected record status")]
    fn test_assert_record_status_fails() {
        let record = record_with(&[]);
        assert_record_status(&record, RecordStatus::Completed);
    }
}
