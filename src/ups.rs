//! UPS-RS: workitem creation, retrieval, update, state changes,
//! cancellation requests, and subscription management.

use crate::dicom_json::{JsonAttribute, JsonDataset, string_of};
use crate::error::DicomWebError;
use crate::event::UpsEventType;
use crate::qido::require_json_acceptable;
use crate::server::{AppState, HandlerResponse, RequestContext};
use crate::types::{AeTitle, is_valid_uid, new_uid};
use crate::ups_storage::{UpsStorageError, UpsStorageProvider, WorkitemFilter};
use crate::workitem::{
    ProcedureStepState, ProgressInformation, TAG_PROCEDURE_STEP_STATE, TAG_TRANSACTION_UID,
    UpsPriority, Workitem,
};
use axum::http::StatusCode;
use std::sync::Arc;

/// The well-known UID addressing the global subscription target.
pub const GLOBAL_SUBSCRIPTION_UID: &str = "1.2.840.10008.5.1.4.34.5";

const TAG_SOP_INSTANCE_UID: &str = "00080018";
const TAG_SPS_PRIORITY: &str = "00741200";
const TAG_CANCELLATION_REASON: &str = "00741238";
const TAG_PROGRESS_SEQ: &str = "00741002";
const TAG_PROGRESS: &str = "00741004";
const TAG_PROGRESS_DESCRIPTION: &str = "00741006";

fn ups_storage(state: &AppState) -> Result<&Arc<dyn UpsStorageProvider>, DicomWebError> {
    state.ups_storage.as_ref().ok_or_else(|| {
        DicomWebError::NotImplemented("no UPS storage is configured".to_string())
    })
}

fn map_ups_error(error: UpsStorageError) -> DicomWebError {
    match error {
        UpsStorageError::NotFound(uid) => DicomWebError::NotFound(format!("workitem {uid}")),
        UpsStorageError::Validation(e) => DicomWebError::Validation(e),
        other => DicomWebError::Conflict(other.to_string()),
    }
}

/// Accepts either a DICOM+JSON dataset (tag-keyed attributes) or the plain
/// shorthand object some clients send (`{"state": ..., "transactionUID": ...}`);
/// both are normalized to a dataset.
fn parse_body_dataset(body: &[u8]) -> Result<JsonDataset, DicomWebError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| DicomWebError::BadRequest(format!("malformed JSON body: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| DicomWebError::BadRequest("JSON body must be an object".to_string()))?;
    let is_dataset = object.values().all(|v| v.is_object() && v.get("vr").is_some());
    if is_dataset && !object.is_empty() {
        return serde_json::from_value(value.clone())
            .map_err(|e| DicomWebError::BadRequest(format!("malformed dataset: {e}")));
    }
    let mut dataset = JsonDataset::new();
    for (key, value) in object {
        let Some(text) = value.as_str() else {
            return Err(DicomWebError::BadRequest(format!(
                "unexpected value for {key:?}"
            )));
        };
        let (tag, vr) = match key.as_str() {
            "workitemUID" => (TAG_SOP_INSTANCE_UID, "UI"),
            "state" => (TAG_PROCEDURE_STEP_STATE, "CS"),
            "transactionUID" => (TAG_TRANSACTION_UID, "UI"),
            "priority" => (TAG_SPS_PRIORITY, "CS"),
            "reason" => (TAG_CANCELLATION_REASON, "LT"),
            other => {
                return Err(DicomWebError::BadRequest(format!(
                    "unrecognized field {other:?}"
                )));
            }
        };
        dataset.insert(tag.to_string(), JsonAttribute::string(vr, text));
    }
    Ok(dataset)
}

pub(crate) async fn create_workitem(
    state: &AppState,
    ctx: &RequestContext,
    uid_from_path: Option<String>,
) -> Result<HandlerResponse, DicomWebError> {
    let storage = ups_storage(state)?;
    let mut workitem = if ctx.body.is_empty() {
        Workitem::new(String::new())
    } else {
        let dataset = parse_body_dataset(&ctx.body)?;
        Workitem::from_dataset(&dataset)?
    };
    if let Some(uid) = uid_from_path {
        workitem.workitem_uid = uid;
    } else if workitem.workitem_uid.is_empty() {
        workitem.workitem_uid = new_uid();
    }
    if !is_valid_uid(&workitem.workitem_uid) {
        return Err(DicomWebError::BadRequest(format!(
            "malformed workitem UID {:?}",
            workitem.workitem_uid
        )));
    }
    let uid = workitem.workitem_uid.clone();
    storage
        .create_workitem(workitem)
        .await
        .map_err(map_ups_error)?;
    Ok(HandlerResponse::new(StatusCode::CREATED)
        .with_header("Location", format!("{}/workitems/{uid}", state.base_url)))
}

pub(crate) async fn retrieve_workitem(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    require_json_acceptable(ctx)?;
    let storage = ups_storage(state)?;
    let uid = ctx.param("workitemUID")?;
    let workitem = storage
        .get_workitem(uid)
        .await
        .map_err(map_ups_error)?
        .ok_or_else(|| DicomWebError::NotFound(format!("workitem {uid}")))?;
    let mut dataset = workitem.to_dataset();
    // the lock token is never disclosed on retrieval
    dataset.remove(TAG_TRANSACTION_UID);
    HandlerResponse::json(StatusCode::OK, &dataset)
}

pub(crate) async fn search_workitems(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    require_json_acceptable(ctx)?;
    let storage = ups_storage(state)?;
    let filter = build_filter(&ctx.query_pairs)?;
    let workitems = storage
        .search_workitems(&filter)
        .await
        .map_err(map_ups_error)?;
    let datasets: Vec<JsonDataset> = workitems
        .into_iter()
        .map(|w| {
            let mut dataset = w.to_dataset();
            dataset.remove(TAG_TRANSACTION_UID);
            dataset
        })
        .collect();
    let count = datasets.len();
    Ok(HandlerResponse::json(StatusCode::OK, &datasets)?
        .with_header("X-Total-Count", count.to_string()))
}

fn build_filter(pairs: &[(String, String)]) -> Result<WorkitemFilter, DicomWebError> {
    let mut filter = WorkitemFilter::default();
    for (key, value) in pairs {
        match key.to_ascii_lowercase().as_str() {
            "limit" => {
                filter.limit = Some(value.parse().map_err(|_| {
                    DicomWebError::BadRequest(format!("invalid limit {value:?}"))
                })?);
            }
            "offset" => {
                filter.offset = value.parse().map_err(|_| {
                    DicomWebError::BadRequest(format!("invalid offset {value:?}"))
                })?;
            }
            "fuzzymatching" | "includefield" => {}
            _ => {
                let tag = key.to_ascii_uppercase();
                match tag.as_str() {
                    TAG_PROCEDURE_STEP_STATE => {
                        filter.state = Some(ProcedureStepState::parse(value).ok_or_else(|| {
                            DicomWebError::BadRequest(format!("invalid state {value:?}"))
                        })?);
                    }
                    TAG_SPS_PRIORITY => {
                        filter.priority = Some(UpsPriority::parse(value).ok_or_else(|| {
                            DicomWebError::BadRequest(format!("invalid priority {value:?}"))
                        })?);
                    }
                    _ if tag.len() == 8 && tag.chars().all(|c| c.is_ascii_hexdigit()) => {
                        filter.additional.insert(tag, value.clone());
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(filter)
}

pub(crate) async fn update_workitem(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    let storage = ups_storage(state)?;
    let uid = ctx.param("workitemUID")?;
    if ctx.body.is_empty() {
        return Err(DicomWebError::BadRequest("empty update body".to_string()));
    }
    let mut dataset = parse_body_dataset(&ctx.body)?;
    let transaction_uid = dataset
        .remove(TAG_TRANSACTION_UID)
        .and_then(|a| a.first_string())
        .or_else(|| ctx.query("transaction-uid").map(str::to_string));

    // progress-only updates go through the dedicated storage operation so
    // subscribers see a ProgressReport
    if dataset.len() == 1 {
        if let Some(progress) = progress_of(&dataset) {
            storage
                .update_progress(uid, progress, transaction_uid.as_deref())
                .await
                .map_err(map_ups_error)?;
            return Ok(HandlerResponse::new(StatusCode::NO_CONTENT));
        }
    }

    storage
        .update_workitem(uid, &dataset, transaction_uid.as_deref())
        .await
        .map_err(map_ups_error)?;
    Ok(HandlerResponse::new(StatusCode::NO_CONTENT))
}

fn progress_of(dataset: &JsonDataset) -> Option<ProgressInformation> {
    let item = dataset.get(TAG_PROGRESS_SEQ)?.items().next()?;
    Some(ProgressInformation {
        progress: item.get(TAG_PROGRESS).and_then(|a| a.first_integer()),
        description: string_of(item, TAG_PROGRESS_DESCRIPTION),
    })
}

pub(crate) async fn change_workitem_state(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    let storage = ups_storage(state)?;
    let uid = ctx.param("workitemUID")?;
    if ctx.body.is_empty() {
        return Err(DicomWebError::BadRequest(
            "state change requires a body".to_string(),
        ));
    }
    let dataset = parse_body_dataset(&ctx.body)?;
    let requested = string_of(&dataset, TAG_PROCEDURE_STEP_STATE).ok_or_else(|| {
        DicomWebError::BadRequest("missing procedure step state".to_string())
    })?;
    let new_state = ProcedureStepState::parse(&requested)
        .ok_or_else(|| DicomWebError::BadRequest(format!("invalid state {requested:?}")))?;
    let transaction_uid = string_of(&dataset, TAG_TRANSACTION_UID);

    let workitem = storage
        .change_workitem_state(uid, new_state, transaction_uid.as_deref())
        .await
        .map_err(map_ups_error)?;

    let mut response = JsonDataset::new();
    response.insert(
        TAG_PROCEDURE_STEP_STATE.to_string(),
        JsonAttribute::string("CS", workitem.state.as_str()),
    );
    if new_state == ProcedureStepState::InProgress {
        if let Some(transaction) = &workitem.transaction_uid {
            response.insert(
                TAG_TRANSACTION_UID.to_string(),
                JsonAttribute::uid(transaction),
            );
        }
    }
    HandlerResponse::json(StatusCode::OK, &response)
}

pub(crate) async fn request_cancellation(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    let storage = ups_storage(state)?;
    let uid = ctx.param("workitemUID")?;
    let reason = if ctx.body.is_empty() {
        None
    } else {
        string_of(&parse_body_dataset(&ctx.body)?, TAG_CANCELLATION_REASON)
    };
    storage
        .request_cancellation(uid, reason)
        .await
        .map_err(map_ups_error)?;
    Ok(HandlerResponse::new(StatusCode::ACCEPTED))
}

pub(crate) async fn subscribe(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    let storage = ups_storage(state)?;
    let uid = ctx.param("workitemUID")?.to_string();
    let ae_title = AeTitle::from(ctx.param("aeTitle")?.to_string());
    let deletion_lock = ctx
        .query("deletionlock")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let event_types = parse_event_types(ctx.query("eventtypes"))?;

    if uid == GLOBAL_SUBSCRIPTION_UID {
        state
            .subscriptions
            .subscribe_global(ae_title, deletion_lock, event_types);
    } else {
        storage
            .get_workitem(&uid)
            .await
            .map_err(map_ups_error)?
            .ok_or_else(|| DicomWebError::NotFound(format!("workitem {uid}")))?;
        state
            .subscriptions
            .subscribe(ae_title, uid, deletion_lock, event_types);
    }
    Ok(HandlerResponse::new(StatusCode::CREATED))
}

pub(crate) async fn unsubscribe(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    ups_storage(state)?;
    let uid = ctx.param("workitemUID")?;
    let ae_title = AeTitle::from(ctx.param("aeTitle")?.to_string());
    let scope = (uid != GLOBAL_SUBSCRIPTION_UID).then_some(uid);
    // unsubscribing an absent key is not an error
    state.subscriptions.unsubscribe(&ae_title, scope);
    Ok(HandlerResponse::new(StatusCode::OK))
}

pub(crate) async fn suspend_subscription(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    ups_storage(state)?;
    let uid = ctx.param("workitemUID")?;
    let ae_title = AeTitle::from(ctx.param("aeTitle")?.to_string());
    let scope = (uid != GLOBAL_SUBSCRIPTION_UID).then_some(uid);
    if state.subscriptions.suspend(&ae_title, scope) {
        Ok(HandlerResponse::new(StatusCode::OK))
    } else {
        Err(DicomWebError::NotFound(format!(
            "no subscription of {} covers {uid}",
            ae_title.as_str()
        )))
    }
}

fn parse_event_types(raw: Option<&str>) -> Result<Vec<UpsEventType>, DicomWebError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(|name| match name.trim() {
            "StateReport" => Ok(UpsEventType::StateReport),
            "ProgressReport" => Ok(UpsEventType::ProgressReport),
            "CancelRequested" => Ok(UpsEventType::CancelRequested),
            "Assigned" => Ok(UpsEventType::Assigned),
            "Completed" => Ok(UpsEventType::Completed),
            "Canceled" => Ok(UpsEventType::Canceled),
            other => Err(DicomWebError::BadRequest(format!(
                "unknown event type {other:?}"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_body_dataset_accepts_both_shapes() {
        let dataset = parse_body_dataset(
            br#"{"00741000": {"vr": "CS", "Value": ["IN PROGRESS"]}}"#,
        )
        .unwrap();
        assert_eq!(
            string_of(&dataset, TAG_PROCEDURE_STEP_STATE).as_deref(),
            Some("IN PROGRESS")
        );

        let dataset =
            parse_body_dataset(br#"{"state": "COMPLETED", "transactionUID": "2.25.9"}"#).unwrap();
        assert_eq!(
            string_of(&dataset, TAG_PROCEDURE_STEP_STATE).as_deref(),
            Some("COMPLETED")
        );
        assert_eq!(
            string_of(&dataset, TAG_TRANSACTION_UID).as_deref(),
            Some("2.25.9")
        );
    }

    #[test]
    fn test_parse_body_dataset_rejects_junk() {
        assert!(parse_body_dataset(b"not json").is_err());
        assert!(parse_body_dataset(b"[1,2]").is_err());
        assert!(parse_body_dataset(br#"{"bogus": "x"}"#).is_err());
    }

    #[test]
    fn test_parse_event_types() {
        assert_eq!(parse_event_types(None).unwrap(), Vec::new());
        assert_eq!(
            parse_event_types(Some("StateReport,Canceled")).unwrap(),
            vec![UpsEventType::StateReport, UpsEventType::Canceled]
        );
        assert!(parse_event_types(Some("Nope")).is_err());
    }
}
