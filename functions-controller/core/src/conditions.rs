//! Status conditions and their aggregation.
//!
//! Each resource kind declares a fixed set of dependent condition types. The
//! synthesized `Ready` condition is True iff every dependent is True, False
//! if any dependent is False, and Unknown otherwise -- including when a
//! dependent has never been set.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const READY: &str = "Ready";

#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema,
)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A named health signal with an optional reason and message.
///
/// Invariant: for a fixed resource, at most one condition per type exists.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// The fixed universe of dependent condition types for a resource kind.
///
/// A set is an explicit value constructed once per kind and passed into each
/// `ConditionManager`; it is never process-global state.
#[derive(Clone, Debug)]
pub struct ConditionSet {
    dependents: Vec<&'static str>,
}

impl ConditionSet {
    pub fn new(dependents: impl IntoIterator<Item = &'static str>) -> Self {
        let dependents = dependents.into_iter().filter(|t| *t != READY).collect();
        Self { dependents }
    }

    pub fn dependents(&self) -> &[&'static str] {
        &self.dependents
    }
}

/// Upserts conditions on a resource's status and recomputes readiness.
///
/// The manager has no knowledge of why a condition holds; callers supply
/// reason and message strings.
pub struct ConditionManager<'a> {
    set: &'a ConditionSet,
    conditions: &'a mut Vec<Condition>,
}

impl<'a> ConditionManager<'a> {
    pub fn new(set: &'a ConditionSet, conditions: &'a mut Vec<Condition>) -> Self {
        Self { set, conditions }
    }

    /// First-touch initialization: any dependent (and the Ready aggregate)
    /// that has never been set becomes Unknown. Conditions already present
    /// are left untouched so re-entry never reverts recorded outcomes.
    pub fn init_unset(&mut self) {
        for type_ in self
            .set
            .dependents
            .iter()
            .copied()
            .chain(std::iter::once(READY))
        {
            if self.get(type_).is_none() {
                self.upsert(Condition {
                    type_: type_.to_string(),
                    status: ConditionStatus::Unknown,
                    reason: None,
                    message: None,
                    last_transition_time: Some(Utc::now()),
                });
            }
        }
    }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn mark_true(&mut self, type_: &'static str) {
        self.mark(type_, ConditionStatus::True, None, None);
    }

    pub fn mark_false(&mut self, type_: &'static str, reason: &str, message: impl ToString) {
        self.mark(
            type_,
            ConditionStatus::False,
            Some(reason.to_string()),
            Some(message.to_string()),
        );
    }

    pub fn mark_unknown(&mut self, type_: &'static str, reason: &str, message: impl ToString) {
        self.mark(
            type_,
            ConditionStatus::Unknown,
            Some(reason.to_string()),
            Some(message.to_string()),
        );
    }

    /// Recomputes the aggregate readiness from the dependents and refreshes
    /// the stored Ready condition. The aggregate is always derived; it is
    /// never marked directly.
    pub fn ready(&mut self) -> ConditionStatus {
        let mut status = ConditionStatus::True;
        let mut blocking = None;
        for type_ in &self.set.dependents {
            match self.get(type_) {
                Some(c) if c.status == ConditionStatus::True => {}
                Some(c) if c.status == ConditionStatus::False => {
                    status = ConditionStatus::False;
                    blocking = Some(c.clone());
                    break;
                }
                other => {
                    status = ConditionStatus::Unknown;
                    blocking = other.cloned();
                }
            }
        }

        let (reason, message) = blocking
            .map(|c| (c.reason, c.message))
            .unwrap_or((None, None));
        self.upsert_preserving_transition(Condition {
            type_: READY.to_string(),
            status,
            reason,
            message,
            last_transition_time: Some(Utc::now()),
        });
        status
    }

    fn mark(
        &mut self,
        type_: &'static str,
        status: ConditionStatus,
        reason: Option<String>,
        message: Option<String>,
    ) {
        self.upsert_preserving_transition(Condition {
            type_: type_.to_string(),
            status,
            reason,
            message,
            last_transition_time: Some(Utc::now()),
        });
        self.ready();
    }

    /// Replaces the condition with the same type, or inserts it. The
    /// transition time is carried over whenever the status value is
    /// unchanged, so a repeated identical outcome leaves the condition
    /// byte-for-byte equal.
    fn upsert_preserving_transition(&mut self, mut condition: Condition) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
    }

    fn upsert(&mut self, condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG_SYNCED: &str = "ConfigMapSynced";
    const SERVICE_SYNCED: &str = "ServiceSynced";

    fn set() -> ConditionSet {
        ConditionSet::new([CONFIG_SYNCED, SERVICE_SYNCED])
    }

    #[test]
    fn ready_filtered_from_dependents() {
        let set = ConditionSet::new([READY, CONFIG_SYNCED]);
        assert_eq!(set.dependents(), [CONFIG_SYNCED]);
    }

    #[test]
    fn ready_aggregation_truth_table() {
        let set = set();

        // {A=True, B=True} => True
        let mut conditions = Vec::new();
        let mut mgr = ConditionManager::new(&set, &mut conditions);
        mgr.mark_true(CONFIG_SYNCED);
        mgr.mark_true(SERVICE_SYNCED);
        assert_eq!(mgr.ready(), ConditionStatus::True);

        // {A=True, B=False} => False
        let mut conditions = Vec::new();
        let mut mgr = ConditionManager::new(&set, &mut conditions);
        mgr.mark_true(CONFIG_SYNCED);
        mgr.mark_false(SERVICE_SYNCED, "SyncFailed", "boom");
        assert_eq!(mgr.ready(), ConditionStatus::False);

        // {A=True, B=Unknown} => Unknown
        let mut conditions = Vec::new();
        let mut mgr = ConditionManager::new(&set, &mut conditions);
        mgr.mark_true(CONFIG_SYNCED);
        mgr.mark_unknown(SERVICE_SYNCED, "Pending", "");
        assert_eq!(mgr.ready(), ConditionStatus::Unknown);

        // {A=True, B never set} => Unknown
        let mut conditions = Vec::new();
        let mut mgr = ConditionManager::new(&set, &mut conditions);
        mgr.mark_true(CONFIG_SYNCED);
        assert_eq!(mgr.ready(), ConditionStatus::Unknown);
    }

    #[test]
    fn ready_reports_blocking_reason() {
        let set = set();
        let mut conditions = Vec::new();
        let mut mgr = ConditionManager::new(&set, &mut conditions);
        mgr.mark_true(CONFIG_SYNCED);
        mgr.mark_false(SERVICE_SYNCED, "SyncFailed", "remote create failed");
        mgr.ready();

        let ready = mgr.get(READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason.as_deref(), Some("SyncFailed"));
        assert_eq!(ready.message.as_deref(), Some("remote create failed"));
    }

    #[test]
    fn init_unset_is_first_touch_only() {
        let set = set();
        let mut conditions = Vec::new();
        let mut mgr = ConditionManager::new(&set, &mut conditions);
        mgr.mark_true(CONFIG_SYNCED);
        mgr.init_unset();

        assert_eq!(
            mgr.get(CONFIG_SYNCED).unwrap().status,
            ConditionStatus::True,
            "already-set conditions must not be overwritten",
        );
        assert_eq!(
            mgr.get(SERVICE_SYNCED).unwrap().status,
            ConditionStatus::Unknown,
        );
        assert_eq!(mgr.get(READY).unwrap().status, ConditionStatus::Unknown);
    }

    #[test]
    fn transition_time_preserved_for_unchanged_status() {
        let set = set();
        let mut conditions = Vec::new();
        let mut mgr = ConditionManager::new(&set, &mut conditions);

        mgr.mark_false(CONFIG_SYNCED, "SyncFailed", "first");
        let first = mgr.get(CONFIG_SYNCED).unwrap().clone();

        // Same status, different message: the message is replaced but the
        // transition time must not move.
        mgr.mark_false(CONFIG_SYNCED, "SyncFailed", "second");
        let second = mgr.get(CONFIG_SYNCED).unwrap();
        assert_eq!(second.message.as_deref(), Some("second"));
        assert_eq!(second.last_transition_time, first.last_transition_time);

        mgr.mark_true(CONFIG_SYNCED);
        assert_eq!(mgr.get(CONFIG_SYNCED).unwrap().status, ConditionStatus::True);
    }

    #[test]
    fn repeated_identical_marks_are_idempotent() {
        let set = set();
        let mut conditions = Vec::new();
        let mut mgr = ConditionManager::new(&set, &mut conditions);
        mgr.init_unset();
        mgr.mark_true(CONFIG_SYNCED);
        mgr.mark_true(SERVICE_SYNCED);
        mgr.ready();
        let snapshot = conditions.clone();

        let mut mgr = ConditionManager::new(&set, &mut conditions);
        mgr.init_unset();
        mgr.mark_true(CONFIG_SYNCED);
        mgr.mark_true(SERVICE_SYNCED);
        mgr.ready();
        assert_eq!(conditions, snapshot);
    }
}
