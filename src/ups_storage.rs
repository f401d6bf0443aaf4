//! The UPS storage provider contract and its in-memory reference
//! implementation, which owns atomic workitem state transitions.

use crate::dicom_json::JsonDataset;
use crate::event::{EventDispatcher, UpsEvent};
use crate::subscription::SubscriptionManager;
use crate::types::new_uid;
use crate::workitem::{
    ProcedureStepState, ProgressInformation, UpsPriority, Workitem, WorkitemValidationError,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use time::macros::format_description;

#[derive(thiserror::Error, Debug)]
pub enum UpsStorageError {
    #[error("workitem {0} does not exist")]
    NotFound(String),

    #[error("workitem {0} already exists")]
    Duplicate(String),

    #[error("a workitem can only be created in the SCHEDULED state")]
    InvalidInitialState,

    #[error("illegal state transition from {from} to {to}")]
    IllegalTransition {
        from: ProcedureStepState,
        to: ProcedureStepState,
    },

    #[error("transaction UID does not match the workitem lock")]
    TransactionUidMismatch,

    #[error("the current transaction UID is required while the workitem is IN PROGRESS")]
    MissingTransactionUid,

    #[error("workitem {0} is delete-locked by a subscriber")]
    DeleteLocked(String),

    #[error(transparent)]
    Validation(#[from] WorkitemValidationError),
}

/// Filter for `search_workitems`.
#[derive(Debug, Clone, Default)]
pub struct WorkitemFilter {
    pub state: Option<ProcedureStepState>,
    pub priority: Option<UpsPriority>,
    /// Tag-keyed equality filters applied to the workitem's dataset form.
    pub additional: BTreeMap<String, String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Persists workitems and owns their state transitions.
#[async_trait]
pub trait UpsStorageProvider: Send + Sync {
    async fn create_workitem(&self, workitem: Workitem) -> Result<(), UpsStorageError>;

    async fn get_workitem(&self, workitem_uid: &str) -> Result<Option<Workitem>, UpsStorageError>;

    /// Merge an update dataset. Allowed while SCHEDULED, or while IN PROGRESS
    /// when the caller presents the current transaction UID.
    async fn update_workitem(
        &self,
        workitem_uid: &str,
        update: &JsonDataset,
        transaction_uid: Option<&str>,
    ) -> Result<Workitem, UpsStorageError>;

    /// Atomically check the transition, compare the transaction UID, apply
    /// the new state, and enqueue the resulting events. Returns the updated
    /// workitem; on entry into IN PROGRESS its `transaction_uid` carries the
    /// freshly assigned lock token.
    async fn change_workitem_state(
        &self,
        workitem_uid: &str,
        new_state: ProcedureStepState,
        transaction_uid: Option<&str>,
    ) -> Result<Workitem, UpsStorageError>;

    async fn update_progress(
        &self,
        workitem_uid: &str,
        progress: ProgressInformation,
        transaction_uid: Option<&str>,
    ) -> Result<(), UpsStorageError>;

    /// For a SCHEDULED workitem: transition straight to CANCELED. For one
    /// IN PROGRESS: leave the state alone and notify subscribers that
    /// cancellation was requested. Returns the state after the call.
    async fn request_cancellation(
        &self,
        workitem_uid: &str,
        reason: Option<String>,
    ) -> Result<ProcedureStepState, UpsStorageError>;

    async fn delete_workitem(&self, workitem_uid: &str) -> Result<(), UpsStorageError>;

    async fn search_workitems(
        &self,
        filter: &WorkitemFilter,
    ) -> Result<Vec<Workitem>, UpsStorageError>;

    /// Wire up the dispatcher so mutations can emit events.
    fn set_event_dispatcher(&self, dispatcher: Arc<EventDispatcher>);
}

/// In-memory reference implementation. One mutex over the workitem map is
/// the critical section for every transition, so the transition check, the
/// transaction-UID comparison, the state write, and the event enqueue are
/// indivisible.
pub struct InMemoryUpsStorage {
    workitems: Mutex<BTreeMap<String, Workitem>>,
    subscriptions: Arc<SubscriptionManager>,
    dispatcher: RwLock<Option<Arc<EventDispatcher>>>,
}

impl InMemoryUpsStorage {
    pub fn new(subscriptions: Arc<SubscriptionManager>) -> Self {
        Self {
            workitems: Mutex::new(BTreeMap::new()),
            subscriptions,
            dispatcher: RwLock::new(None),
        }
    }

    fn publish(&self, event: UpsEvent) {
        if let Some(dispatcher) = self.dispatcher.read().unwrap().as_ref() {
            dispatcher.publish(event);
        }
    }

    fn check_lock(
        workitem: &Workitem,
        transaction_uid: Option<&str>,
    ) -> Result<(), UpsStorageError> {
        let Some(current) = workitem.transaction_uid.as_deref() else {
            return Ok(());
        };
        match transaction_uid {
            None => Err(UpsStorageError::MissingTransactionUid),
            Some(presented) if presented != current => {
                Err(UpsStorageError::TransactionUidMismatch)
            }
            Some(_) => Ok(()),
        }
    }
}

#[async_trait]
impl UpsStorageProvider for InMemoryUpsStorage {
    async fn create_workitem(&self, workitem: Workitem) -> Result<(), UpsStorageError> {
        workitem.validate()?;
        if workitem.state != ProcedureStepState::Scheduled {
            return Err(UpsStorageError::InvalidInitialState);
        }
        let mut workitems = self.workitems.lock().unwrap();
        if workitems.contains_key(&workitem.workitem_uid) {
            return Err(UpsStorageError::Duplicate(workitem.workitem_uid));
        }
        tracing::info!(workitem = workitem.workitem_uid, "created workitem");
        workitems.insert(workitem.workitem_uid.clone(), workitem);
        Ok(())
    }

    async fn get_workitem(&self, workitem_uid: &str) -> Result<Option<Workitem>, UpsStorageError> {
        Ok(self.workitems.lock().unwrap().get(workitem_uid).cloned())
    }

    async fn update_workitem(
        &self,
        workitem_uid: &str,
        update: &JsonDataset,
        transaction_uid: Option<&str>,
    ) -> Result<Workitem, UpsStorageError> {
        let mut workitems = self.workitems.lock().unwrap();
        let workitem = workitems
            .get_mut(workitem_uid)
            .ok_or_else(|| UpsStorageError::NotFound(workitem_uid.to_string()))?;
        match workitem.state {
            ProcedureStepState::Scheduled => {}
            ProcedureStepState::InProgress => Self::check_lock(workitem, transaction_uid)?,
            _ => return Err(WorkitemValidationError::FinalStateViolation.into()),
        }
        workitem.merge_update(update)?;
        Ok(workitem.clone())
    }

    async fn change_workitem_state(
        &self,
        workitem_uid: &str,
        new_state: ProcedureStepState,
        transaction_uid: Option<&str>,
    ) -> Result<Workitem, UpsStorageError> {
        let mut workitems = self.workitems.lock().unwrap();
        let workitem = workitems
            .get_mut(workitem_uid)
            .ok_or_else(|| UpsStorageError::NotFound(workitem_uid.to_string()))?;
        let previous = workitem.state;
        if !previous.can_transition_to(new_state) {
            return Err(UpsStorageError::IllegalTransition {
                from: previous,
                to: new_state,
            });
        }
        if previous == ProcedureStepState::InProgress {
            Self::check_lock(workitem, transaction_uid)?;
        }
        if new_state == ProcedureStepState::InProgress {
            workitem.transaction_uid = Some(new_uid());
        }
        workitem.state = new_state;
        if new_state == ProcedureStepState::Canceled {
            workitem.cancellation_datetime = Some(now_dt());
        }
        tracing::info!(
            workitem = workitem_uid,
            from = previous.as_str(),
            to = new_state.as_str(),
            "workitem state changed"
        );

        let transaction = workitem.transaction_uid.clone();
        self.publish(UpsEvent::StateReport {
            workitem_uid: workitem_uid.to_string(),
            transaction_uid: transaction.clone(),
            previous_state: previous,
            new_state,
        });
        if previous == ProcedureStepState::Scheduled && new_state == ProcedureStepState::InProgress
        {
            if let Some(performer) = workitem
                .scheduled_performers
                .iter()
                .find_map(|p| p.label())
            {
                self.publish(UpsEvent::Assigned {
                    workitem_uid: workitem_uid.to_string(),
                    transaction_uid: transaction.clone(),
                    performer,
                });
            }
        }
        match new_state {
            ProcedureStepState::Completed => self.publish(UpsEvent::Completed {
                workitem_uid: workitem_uid.to_string(),
                transaction_uid: transaction.clone(),
            }),
            ProcedureStepState::Canceled => self.publish(UpsEvent::Canceled {
                workitem_uid: workitem_uid.to_string(),
                transaction_uid: transaction.clone(),
                reason: workitem.cancellation_reason.clone(),
            }),
            _ => {}
        }
        Ok(workitem.clone())
    }

    async fn update_progress(
        &self,
        workitem_uid: &str,
        progress: ProgressInformation,
        transaction_uid: Option<&str>,
    ) -> Result<(), UpsStorageError> {
        let mut workitems = self.workitems.lock().unwrap();
        let workitem = workitems
            .get_mut(workitem_uid)
            .ok_or_else(|| UpsStorageError::NotFound(workitem_uid.to_string()))?;
        if workitem.state != ProcedureStepState::InProgress {
            return Err(UpsStorageError::IllegalTransition {
                from: workitem.state,
                to: workitem.state,
            });
        }
        Self::check_lock(workitem, transaction_uid)?;
        workitem.progress = Some(progress.clone());
        self.publish(UpsEvent::ProgressReport {
            workitem_uid: workitem_uid.to_string(),
            transaction_uid: workitem.transaction_uid.clone(),
            progress,
        });
        Ok(())
    }

    async fn request_cancellation(
        &self,
        workitem_uid: &str,
        reason: Option<String>,
    ) -> Result<ProcedureStepState, UpsStorageError> {
        let mut workitems = self.workitems.lock().unwrap();
        let workitem = workitems
            .get_mut(workitem_uid)
            .ok_or_else(|| UpsStorageError::NotFound(workitem_uid.to_string()))?;
        match workitem.state {
            ProcedureStepState::Scheduled => {
                workitem.state = ProcedureStepState::Canceled;
                workitem.cancellation_reason = reason;
                workitem.cancellation_datetime = Some(now_dt());
                self.publish(UpsEvent::StateReport {
                    workitem_uid: workitem_uid.to_string(),
                    transaction_uid: None,
                    previous_state: ProcedureStepState::Scheduled,
                    new_state: ProcedureStepState::Canceled,
                });
                self.publish(UpsEvent::Canceled {
                    workitem_uid: workitem_uid.to_string(),
                    transaction_uid: None,
                    reason: workitem.cancellation_reason.clone(),
                });
                Ok(ProcedureStepState::Canceled)
            }
            ProcedureStepState::InProgress => {
                // the performer owns the workitem; subscribers are asked to honor
                // the request
                self.publish(UpsEvent::CancelRequested {
                    workitem_uid: workitem_uid.to_string(),
                    transaction_uid: workitem.transaction_uid.clone(),
                    reason,
                });
                Ok(ProcedureStepState::InProgress)
            }
            _ => Err(WorkitemValidationError::FinalStateViolation.into()),
        }
    }

    async fn delete_workitem(&self, workitem_uid: &str) -> Result<(), UpsStorageError> {
        if self.subscriptions.has_delete_lock(workitem_uid) {
            return Err(UpsStorageError::DeleteLocked(workitem_uid.to_string()));
        }
        let mut workitems = self.workitems.lock().unwrap();
        workitems
            .remove(workitem_uid)
            .map(|_| ())
            .ok_or_else(|| UpsStorageError::NotFound(workitem_uid.to_string()))
    }

    async fn search_workitems(
        &self,
        filter: &WorkitemFilter,
    ) -> Result<Vec<Workitem>, UpsStorageError> {
        let workitems = self.workitems.lock().unwrap();
        let results = workitems
            .values()
            .filter(|w| filter.state.is_none_or(|s| w.state == s))
            .filter(|w| filter.priority.is_none_or(|p| w.priority == p))
            .filter(|w| {
                if filter.additional.is_empty() {
                    return true;
                }
                let dataset = w.to_dataset();
                filter.additional.iter().all(|(tag, expected)| {
                    crate::dicom_json::string_of(&dataset, tag).as_deref() == Some(expected)
                })
            })
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(results)
    }

    fn set_event_dispatcher(&self, dispatcher: Arc<EventDispatcher>) {
        *self.dispatcher.write().unwrap() = Some(dispatcher);
    }
}

fn now_dt() -> String {
    time::OffsetDateTime::now_utc()
        .format(format_description!(
            "[year][month][day][hour][minute][second]"
        ))
        .unwrap_or_default()
}
