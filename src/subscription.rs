//! Records per-AE-title interest in workitem events.

use crate::event::{UpsEvent, UpsEventType};
use crate::types::AeTitle;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// One AE title's interest in one workitem (or, with `workitem_uid == None`,
/// in all of them).
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub ae_title: AeTitle,
    pub workitem_uid: Option<String>,
    pub deletion_lock: bool,
    pub event_types: Vec<UpsEventType>,
    pub suspended: bool,
}

impl Subscription {
    pub fn is_global(&self) -> bool {
        self.workitem_uid.is_none()
    }

    /// Not suspended, scope matches, and the event type passes the filter
    /// (an empty filter admits every type).
    pub fn is_interested_in(&self, event: &UpsEvent) -> bool {
        !self.suspended
            && self
                .workitem_uid
                .as_deref()
                .is_none_or(|uid| uid == event.workitem_uid())
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type()))
    }
}

type SubscriptionKey = (AeTitle, Option<String>);

/// The single authority on subscription state.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    inner: Mutex<BTreeMap<SubscriptionKey, Subscription>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or refresh) interest in a single workitem.
    pub fn subscribe(
        &self,
        ae_title: AeTitle,
        workitem_uid: String,
        deletion_lock: bool,
        event_types: Vec<UpsEventType>,
    ) -> Subscription {
        self.insert(ae_title, Some(workitem_uid), deletion_lock, event_types)
    }

    /// Register (or refresh) interest in every workitem.
    pub fn subscribe_global(
        &self,
        ae_title: AeTitle,
        deletion_lock: bool,
        event_types: Vec<UpsEventType>,
    ) -> Subscription {
        self.insert(ae_title, None, deletion_lock, event_types)
    }

    fn insert(
        &self,
        ae_title: AeTitle,
        workitem_uid: Option<String>,
        deletion_lock: bool,
        event_types: Vec<UpsEventType>,
    ) -> Subscription {
        let subscription = Subscription {
            ae_title: ae_title.clone(),
            workitem_uid: workitem_uid.clone(),
            deletion_lock,
            event_types,
            suspended: false,
        };
        let mut inner = self.inner.lock().unwrap();
        inner.insert((ae_title, workitem_uid), subscription.clone());
        subscription
    }

    /// Remove a subscription. Removing an absent key is not an error.
    pub fn unsubscribe(&self, ae_title: &AeTitle, workitem_uid: Option<&str>) -> bool {
        let key = (ae_title.clone(), workitem_uid.map(str::to_string));
        self.inner.lock().unwrap().remove(&key).is_some()
    }

    /// Keep the interest registered but skip it during delivery.
    pub fn suspend(&self, ae_title: &AeTitle, workitem_uid: Option<&str>) -> bool {
        self.set_suspended(ae_title, workitem_uid, true)
    }

    pub fn resume(&self, ae_title: &AeTitle, workitem_uid: Option<&str>) -> bool {
        self.set_suspended(ae_title, workitem_uid, false)
    }

    fn set_suspended(
        &self,
        ae_title: &AeTitle,
        workitem_uid: Option<&str>,
        suspended: bool,
    ) -> bool {
        let key = (ae_title.clone(), workitem_uid.map(str::to_string));
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(&key) {
            Some(subscription) => {
                subscription.suspended = suspended;
                true
            }
            None => false,
        }
    }

    /// Whether any subscriber (workitem-scoped or global) holds a deletion
    /// lock covering `workitem_uid`. Storage consults this before deleting.
    pub fn has_delete_lock(&self, workitem_uid: &str) -> bool {
        self.inner.lock().unwrap().values().any(|s| {
            s.deletion_lock && s.workitem_uid.as_deref().is_none_or(|uid| uid == workitem_uid)
        })
    }

    pub fn subscriptions_for_workitem(&self, workitem_uid: &str) -> Vec<Subscription> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.workitem_uid.as_deref() == Some(workitem_uid))
            .cloned()
            .collect()
    }

    pub fn subscriptions_for_ae_title(&self, ae_title: &AeTitle) -> Vec<Subscription> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|s| &s.ae_title == ae_title)
            .cloned()
            .collect()
    }

    /// Matching workitem-scoped subscriptions plus matching global ones.
    pub fn subscriptions_for_event(&self, event: &UpsEvent) -> Vec<Subscription> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.is_interested_in(event))
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workitem::ProcedureStepState;
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn state_report(workitem_uid: &str) -> UpsEvent {
        UpsEvent::StateReport {
            workitem_uid: workitem_uid.to_string(),
            transaction_uid: None,
            previous_state: ProcedureStepState::Scheduled,
            new_state: ProcedureStepState::InProgress,
        }
    }

    #[fixture]
    fn manager() -> SubscriptionManager {
        SubscriptionManager::new()
    }

    #[rstest]
    fn test_subscribe_unsubscribe_restores_prior_state(manager: SubscriptionManager) {
        let aet = AeTitle::from_static("SCU1");
        manager.subscribe(aet.clone(), "1.2.3".to_string(), false, vec![]);
        assert_eq!(manager.count(), 1);
        assert!(manager.unsubscribe(&aet, Some("1.2.3")));
        assert_eq!(manager.count(), 0);
        // absent key succeeds
        assert!(!manager.unsubscribe(&aet, Some("1.2.3")));
    }

    #[rstest]
    fn test_global_subscription_matches_any_workitem(manager: SubscriptionManager) {
        manager.subscribe_global(AeTitle::from_static("SCU1"), false, vec![]);
        let matched = manager.subscriptions_for_event(&state_report("9.9.9"));
        assert_eq!(matched.len(), 1);
        assert!(matched[0].is_global());
    }

    #[rstest]
    fn test_event_type_filter(manager: SubscriptionManager) {
        manager.subscribe(
            AeTitle::from_static("SCU1"),
            "1.2.3".to_string(),
            false,
            vec![UpsEventType::Canceled],
        );
        assert!(manager.subscriptions_for_event(&state_report("1.2.3")).is_empty());
        let canceled = UpsEvent::Canceled {
            workitem_uid: "1.2.3".to_string(),
            transaction_uid: None,
            reason: None,
        };
        assert_eq!(manager.subscriptions_for_event(&canceled).len(), 1);
    }

    #[rstest]
    fn test_suspended_subscription_receives_nothing(manager: SubscriptionManager) {
        let aet = AeTitle::from_static("SCU1");
        manager.subscribe(aet.clone(), "1.2.3".to_string(), false, vec![]);
        assert!(manager.suspend(&aet, Some("1.2.3")));
        assert!(manager.subscriptions_for_event(&state_report("1.2.3")).is_empty());
        assert!(manager.resume(&aet, Some("1.2.3")));
        assert_eq!(manager.subscriptions_for_event(&state_report("1.2.3")).len(), 1);
    }

    #[rstest]
    fn test_delete_lock(manager: SubscriptionManager) {
        assert!(!manager.has_delete_lock("1.2.3"));
        manager.subscribe(AeTitle::from_static("SCU1"), "1.2.3".to_string(), true, vec![]);
        assert!(manager.has_delete_lock("1.2.3"));
        assert!(!manager.has_delete_lock("4.5.6"));
        manager.subscribe_global(AeTitle::from_static("SCU2"), true, vec![]);
        assert!(manager.has_delete_lock("4.5.6"));
    }

    #[rstest]
    fn test_scoped_and_global_union(manager: SubscriptionManager) {
        manager.subscribe(AeTitle::from_static("SCU1"), "1.2.3".to_string(), false, vec![]);
        manager.subscribe_global(AeTitle::from_static("SCU2"), false, vec![]);
        manager.subscribe(AeTitle::from_static("SCU3"), "7.7.7".to_string(), false, vec![]);
        let matched = manager.subscriptions_for_event(&state_report("1.2.3"));
        let mut ae_titles: Vec<&str> = matched.iter().map(|s| s.ae_title.as_str()).collect();
        ae_titles.sort();
        assert_eq!(ae_titles, vec!["SCU1", "SCU2"]);
    }
}
