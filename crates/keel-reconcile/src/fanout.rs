//! Fan-out status tracking.
//!
//! A record realized against many independently changing targets keeps one
//! status entry per target. [`FanoutTracker`] holds those entries keyed by
//! target identity, in insertion order (oldest target first), and plans the
//! single next edit a reconcile should make.
//!
//! Each entry also names the artifact last committed on its target, so a
//! change of the desired artifact is visible per target.
//!
//! ## Install
//!
//! ```text
//! (new eligible target)  -> Pending
//! Pending    -- reachable -->  Installing
//! Installing -- push ok   -->  Installed
//! Installing -- unreachable -> Pending
//! Installed  -- artifact changed -> Installing (or Pending if unreachable)
//! (holds desired artifact) -> Installed
//! (target gone)          -> entry dropped
//! ```
//!
//! Pure list edits (add, advance, drop) are folded into one [`FanoutStep::Sync`].
//! Otherwise the first `Installing` entry is served: an outdated artifact it
//! still holds is retired first, then the desired one is pushed. With N
//! reachable targets and an empty list this converges in N + 1 steps.
//!
//! ## Teardown
//!
//! Vanished targets and entries holding nothing are dropped first. Then the
//! remaining entries are removed one per step, each after a remote delete of
//! the artifact they hold, oldest first.

use indexmap::IndexMap;

use keel_core::api::config::{InstallPhase, RegistryStatus};
use keel_core::id::TargetId;
use keel_core::locator::Endpoint;

/// The next edit to apply to a fan-out list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanoutStep {
    /// Persist this list; no remote call.
    Sync(FanoutTracker),
    /// Push the desired artifact to this target, then mark it installed.
    Push(TargetId),
    /// Delete an outdated artifact from a target that is being upgraded.
    Retire {
        /// Target holding the outdated artifact.
        target: TargetId,
        /// Filename to delete.
        artifact: String,
    },
    /// Delete the artifact a target holds, then drop its entry.
    Remove {
        /// Target to clean up.
        target: TargetId,
        /// Filename to delete.
        artifact: String,
    },
    /// Nothing left to do.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    phase: InstallPhase,
    artifact: Option<String>,
}

impl Entry {
    const fn pending() -> Self {
        Self {
            phase: InstallPhase::Pending,
            artifact: None,
        }
    }

    /// Filename this target may hold. An entry past `Pending` without a
    /// recorded artifact may still hold the desired one from an unrecorded
    /// push.
    fn held<'a>(&'a self, desired: Option<&'a str>) -> Option<&'a str> {
        match (&self.artifact, self.phase) {
            (Some(artifact), _) => Some(artifact),
            (None, InstallPhase::Pending) => None,
            (None, _) => desired,
        }
    }
}

/// Per-target status entries keyed by target identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutTracker {
    entries: IndexMap<TargetId, Entry>,
}

impl FanoutTracker {
    /// Builds a tracker from the stored list. Duplicate targets keep their
    /// first entry.
    #[must_use]
    pub fn from_statuses(statuses: &[RegistryStatus]) -> Self {
        let mut entries = IndexMap::with_capacity(statuses.len());
        for status in statuses {
            entries.entry(status.target.clone()).or_insert_with(|| Entry {
                phase: status.phase,
                artifact: status.artifact.clone(),
            });
        }
        Self { entries }
    }

    /// Serializes the tracker back into the stored list.
    #[must_use]
    pub fn to_statuses(&self) -> Vec<RegistryStatus> {
        self.entries
            .iter()
            .map(|(target, entry)| RegistryStatus {
                target: target.clone(),
                phase: entry.phase,
                artifact: entry.artifact.clone(),
            })
            .collect()
    }

    /// Returns the phase of one target.
    #[must_use]
    pub fn phase(&self, target: &TargetId) -> Option<InstallPhase> {
        self.entries.get(target).map(|e| e.phase)
    }

    /// Returns the artifact last committed on one target.
    #[must_use]
    pub fn artifact(&self, target: &TargetId) -> Option<&str> {
        self.entries.get(target).and_then(|e| e.artifact.as_deref())
    }

    /// Returns the number of entries in `phase`.
    #[must_use]
    pub fn count(&self, phase: InstallPhase) -> usize {
        self.entries.values().filter(|e| e.phase == phase).count()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if any entry still awaits a push.
    #[must_use]
    pub fn has_pending_push(&self) -> bool {
        self.count(InstallPhase::Installing) > 0
    }

    /// Marks a target installed with `artifact`.
    pub fn mark_installed(&mut self, target: &TargetId, artifact: &str) {
        if let Some(entry) = self.entries.get_mut(target) {
            entry.phase = InstallPhase::Installed;
            entry.artifact = Some(artifact.to_string());
        }
    }

    /// Records that a target no longer holds any artifact.
    pub fn mark_retired(&mut self, target: &TargetId) {
        if let Some(entry) = self.entries.get_mut(target) {
            entry.artifact = None;
        }
    }

    /// Drops a target's entry, keeping the order of the others.
    pub fn remove(&mut self, target: &TargetId) {
        self.entries.shift_remove(target);
    }

    /// Plans the next install edit of `desired` against the current eligible
    /// targets.
    #[must_use]
    pub fn plan_install(&self, targets: &[Endpoint], desired: &str) -> FanoutStep {
        let mut next = Self {
            entries: self
                .entries
                .iter()
                .filter(|(target, _)| targets.iter().any(|e| &e.target == *target))
                .map(|(target, entry)| (target.clone(), entry.clone()))
                .collect(),
        };
        for endpoint in targets {
            let entry = next
                .entries
                .entry(endpoint.target.clone())
                .or_insert_with(Entry::pending);
            let current = entry.artifact.as_deref() == Some(desired);
            entry.phase = match (entry.phase, endpoint.reachable, current) {
                (_, _, true) => InstallPhase::Installed,
                (InstallPhase::Pending | InstallPhase::Installed, true, false) => {
                    InstallPhase::Installing
                }
                (InstallPhase::Installing | InstallPhase::Installed, false, false) => {
                    InstallPhase::Pending
                }
                (phase, _, _) => phase,
            };
        }
        if next != *self {
            return FanoutStep::Sync(next);
        }
        self.entries
            .iter()
            .find(|(_, entry)| entry.phase == InstallPhase::Installing)
            .map_or(FanoutStep::Idle, |(target, entry)| match &entry.artifact {
                Some(outdated) => FanoutStep::Retire {
                    target: target.clone(),
                    artifact: outdated.clone(),
                },
                None => FanoutStep::Push(target.clone()),
            })
    }

    /// Plans the next teardown edit against the current eligible targets.
    ///
    /// `desired` is the artifact a push would have sent, if the record still
    /// names one.
    #[must_use]
    pub fn plan_teardown(&self, targets: &[Endpoint], desired: Option<&str>) -> FanoutStep {
        let next = Self {
            entries: self
                .entries
                .iter()
                .filter(|(target, entry)| {
                    entry.held(desired).is_some() && targets.iter().any(|e| &e.target == *target)
                })
                .map(|(target, entry)| (target.clone(), entry.clone()))
                .collect(),
        };
        if next != *self {
            return FanoutStep::Sync(next);
        }
        self.entries
            .iter()
            .find_map(|(target, entry)| {
                entry.held(desired).map(|artifact| FanoutStep::Remove {
                    target: target.clone(),
                    artifact: artifact.to_string(),
                })
            })
            .unwrap_or(FanoutStep::Idle)
    }
}
