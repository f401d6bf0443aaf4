//! QIDO-RS: search for studies, series and instances as DICOM+JSON.

use crate::dicom_json::{JsonAttribute, JsonDataset, string_of};
use crate::error::DicomWebError;
use crate::negotiation::negotiate_media_type;
use crate::server::{AppState, HandlerResponse, RequestContext};
use crate::storage::{DateRange, StorageError, StorageQuery};
use axum::http::StatusCode;

const TAG_STUDY_DATE: &str = "00080020";
const TAG_ACCESSION_NUMBER: &str = "00080050";
const TAG_MODALITY: &str = "00080060";
const TAG_RETRIEVE_URL: &str = "00081190";
const TAG_PATIENT_NAME: &str = "00100010";
const TAG_PATIENT_ID: &str = "00100020";
const TAG_STUDY_INSTANCE_UID: &str = "0020000D";
const TAG_SERIES_INSTANCE_UID: &str = "0020000E";
const TAG_SOP_INSTANCE_UID: &str = "00080018";

pub(crate) async fn search_studies(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    require_json_acceptable(ctx)?;
    let query = build_query(&ctx.query_pairs)?;
    let mut results = state
        .storage
        .search_studies(&query)
        .await
        .map_err(storage_error)?;
    for dataset in &mut results {
        if let Some(uid) = string_of(dataset, TAG_STUDY_INSTANCE_UID) {
            dataset.insert(
                TAG_RETRIEVE_URL.to_string(),
                JsonAttribute::string("UR", format!("{}/studies/{uid}", state.base_url)),
            );
        }
    }
    respond_datasets(results)
}

pub(crate) async fn search_series(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    require_json_acceptable(ctx)?;
    let study_uid = ctx.param("studyUID")?;
    let query = build_query(&ctx.query_pairs)?;
    let mut results = state
        .storage
        .search_series(study_uid, &query)
        .await
        .map_err(storage_error)?;
    for dataset in &mut results {
        if let Some(uid) = string_of(dataset, TAG_SERIES_INSTANCE_UID) {
            dataset.insert(
                TAG_RETRIEVE_URL.to_string(),
                JsonAttribute::string(
                    "UR",
                    format!("{}/studies/{study_uid}/series/{uid}", state.base_url),
                ),
            );
        }
    }
    respond_datasets(results)
}

pub(crate) async fn search_instances(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    require_json_acceptable(ctx)?;
    let study_uid = ctx.param("studyUID")?;
    let series_uid = ctx.param("seriesUID")?;
    let query = build_query(&ctx.query_pairs)?;
    let mut results = state
        .storage
        .search_instances(study_uid, series_uid, &query)
        .await
        .map_err(storage_error)?;
    for dataset in &mut results {
        if let Some(uid) = string_of(dataset, TAG_SOP_INSTANCE_UID) {
            dataset.insert(
                TAG_RETRIEVE_URL.to_string(),
                JsonAttribute::string(
                    "UR",
                    format!(
                        "{}/studies/{study_uid}/series/{series_uid}/instances/{uid}",
                        state.base_url
                    ),
                ),
            );
        }
    }
    respond_datasets(results)
}

fn respond_datasets(results: Vec<JsonDataset>) -> Result<HandlerResponse, DicomWebError> {
    let count = results.len();
    Ok(HandlerResponse::json(StatusCode::OK, &results)?
        .with_header("X-Total-Count", count.to_string()))
}

pub(crate) fn require_json_acceptable(ctx: &RequestContext) -> Result<(), DicomWebError> {
    negotiate_media_type(
        ctx.header("accept"),
        &["application/dicom+json", "application/json"],
    )
    .map(|_| ())
    .ok_or_else(|| {
        DicomWebError::NotAcceptable("this resource is only offered as application/dicom+json".to_string())
    })
}

pub(crate) fn storage_error(e: StorageError) -> DicomWebError {
    DicomWebError::Internal(e.to_string())
}

/// Assemble a storage query from QIDO match parameters. Recognized keys are
/// DICOM tag strings plus `limit`, `offset`, `fuzzymatching` and
/// `includefield`; unrecognized keys are ignored.
pub(crate) fn build_query(pairs: &[(String, String)]) -> Result<StorageQuery, DicomWebError> {
    let mut query = StorageQuery::default();
    for (key, value) in pairs {
        match key.to_ascii_lowercase().as_str() {
            "limit" => {
                query.limit = Some(value.parse().map_err(|_| {
                    DicomWebError::BadRequest(format!("invalid limit {value:?}"))
                })?);
            }
            "offset" => {
                query.offset = value.parse().map_err(|_| {
                    DicomWebError::BadRequest(format!("invalid offset {value:?}"))
                })?;
            }
            "fuzzymatching" => {
                query.fuzzy_matching = value.eq_ignore_ascii_case("true");
            }
            "includefield" => {
                // every attribute the index holds is returned anyway
            }
            _ => {
                let Some(tag) = normalize_tag(key) else {
                    continue;
                };
                match tag.as_str() {
                    TAG_PATIENT_NAME => query.patient_name = Some(value.clone()),
                    TAG_PATIENT_ID => query.patient_id = Some(value.clone()),
                    TAG_MODALITY => query.modality = Some(value.clone()),
                    TAG_ACCESSION_NUMBER => query.accession_number = Some(value.clone()),
                    TAG_STUDY_INSTANCE_UID => query.study_instance_uid = Some(value.clone()),
                    TAG_STUDY_DATE => {
                        query.study_date = Some(DateRange::parse(value).ok_or_else(|| {
                            DicomWebError::BadRequest(format!("invalid date range {value:?}"))
                        })?);
                    }
                    _ => {
                        query.additional.insert(tag, value.clone());
                    }
                }
            }
        }
    }
    Ok(query)
}

fn normalize_tag(key: &str) -> Option<String> {
    (key.len() == 8 && key.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| key.to_ascii_uppercase())
}
