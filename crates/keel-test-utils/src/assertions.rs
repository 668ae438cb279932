//! Custom assertion helpers for integration tests.

use keel_core::api::config::{InstallPhase, ModelStatus};
use keel_core::id::TargetId;
use keel_core::record::{HasConditions, Record, ResourceKind};
use keel_reconcile::engine::{INVALID_CONDITION, Outcome};

/// Asserts that a record carries `finalizer`.
///
/// # Panics
///
/// Panics if the finalizer is absent.
pub fn assert_has_finalizer<K: ResourceKind>(record: &Record<K>, finalizer: &str) {
    assert!(
        record.meta.has_finalizer(finalizer),
        "Expected {} {} to carry finalizer {finalizer}, found {:?}",
        K::KIND,
        record.key(),
        record.meta.finalizers
    );
}

/// Asserts that a record is flagged `Invalid` with `reason`.
///
/// # Panics
///
/// Panics if the condition is absent or has another reason.
pub fn assert_invalid<K>(record: &Record<K>, reason: &str)
where
    K: ResourceKind,
    K::Status: HasConditions,
{
    let condition = record
        .status
        .condition(INVALID_CONDITION)
        .unwrap_or_else(|| panic!("Expected {} {} to be Invalid", K::KIND, record.key()));
    assert_eq!(condition.reason, reason, "unexpected Invalid reason");
    assert_eq!(
        condition.observed_generation, record.meta.generation,
        "Invalid condition must reflect the current generation"
    );
}

/// Asserts that a record is not flagged `Invalid`.
///
/// # Panics
///
/// Panics if the condition is present.
pub fn assert_not_invalid<K>(record: &Record<K>)
where
    K: ResourceKind,
    K::Status: HasConditions,
{
    assert!(
        record.status.condition(INVALID_CONDITION).is_none(),
        "Expected {} {} not to be Invalid, found {:?}",
        K::KIND,
        record.key(),
        record.status.conditions()
    );
}

/// Asserts the per-replica install phases of a model, in order.
///
/// # Panics
///
/// Panics if the entries differ.
pub fn assert_phases(status: &ModelStatus, expected: &[(&str, InstallPhase)]) {
    let actual: Vec<(TargetId, InstallPhase)> = status
        .registry_statuses
        .iter()
        .map(|s| (s.target.clone(), s.phase))
        .collect();
    let expected: Vec<(TargetId, InstallPhase)> = expected
        .iter()
        .map(|(target, phase)| (TargetId::new(*target), *phase))
        .collect();
    assert_eq!(actual, expected, "unexpected registry statuses");
}

/// Asserts that every outcome but the last requested a requeue.
///
/// # Panics
///
/// Panics if a run stopped early or never terminated.
pub fn assert_settled(outcomes: &[Outcome], expected_invocations: usize) {
    assert_eq!(
        outcomes.len(),
        expected_invocations,
        "unexpected invocation count: {outcomes:?}"
    );
    let (last, rest) = outcomes.split_last().expect("at least one outcome");
    assert!(rest.iter().all(|o| o.requeue), "run stopped early: {outcomes:?}");
    assert!(!last.requeue, "run did not terminate: {outcomes:?}");
}
