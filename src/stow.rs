//! STOW-RS: parse the request body into DICOM parts, validate each part,
//! apply the duplicate policy, and report a per-instance outcome sequence.

use crate::dicom_json::{JsonAttribute, JsonDataset, dataset_from_object};
use crate::error::DicomWebError;
use crate::multipart;
use crate::part10;
use crate::server::{AppState, HandlerResponse, RequestContext};
use crate::settings::{DuplicatePolicy, StowSettings};
use crate::storage::StoredInstance;
use crate::types::{InstanceKey, is_valid_uid, new_uid};
use axum::http::StatusCode;
use bytes::Bytes;
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::DefaultDicomObject;
use std::collections::BTreeSet;

const TAG_SOP_INSTANCE_UID: &str = "00080018";
const TAG_RETRIEVE_URL: &str = "00081190";
const TAG_FAILURE_REASON: &str = "00081197";
const TAG_FAILED_SOP_SEQUENCE: &str = "00081198";
const TAG_REFERENCED_SOP_SEQUENCE: &str = "00081199";
const TAG_REFERENCED_SOP_CLASS_UID: &str = "00081150";
const TAG_REFERENCED_SOP_INSTANCE_UID: &str = "00081155";
const TAG_STUDY_INSTANCE_UID: &str = "0020000D";
const TAG_SERIES_INSTANCE_UID: &str = "0020000E";

// PS3.18 store-instances failure reasons
const REASON_PROCESSING_FAILURE: u16 = 0xA700;
const REASON_DATASET_MISMATCH: u16 = 0xA900;
const REASON_CANNOT_UNDERSTAND: u16 = 0xC000;
const REASON_SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;

struct StoredRef {
    sop_class_uid: String,
    sop_instance_uid: String,
    study_uid: String,
    retrieve_url: String,
}

struct FailedRef {
    sop_class_uid: String,
    sop_instance_uid: String,
    reason: u16,
    message: String,
}

pub(crate) async fn store_instances(
    state: &AppState,
    ctx: &RequestContext,
    study_scope: Option<String>,
) -> Result<HandlerResponse, DicomWebError> {
    if ctx.body.is_empty() {
        return Err(DicomWebError::BadRequest("empty request body".to_string()));
    }
    let content_type = ctx.header("content-type").ok_or_else(|| {
        DicomWebError::UnsupportedMediaType("missing Content-Type header".to_string())
    })?;
    let media = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let inputs: Vec<(Option<String>, Bytes)> = match media.as_str() {
        "application/dicom" => vec![(None, ctx.body.clone())],
        "multipart/related" => {
            let boundary = multipart::boundary_param(content_type).ok_or_else(|| {
                DicomWebError::BadRequest(
                    "multipart/related without a boundary parameter".to_string(),
                )
            })?;
            let parts = multipart::parse_related(&ctx.body, &boundary)
                .map_err(|e| DicomWebError::BadRequest(e.to_string()))?;
            if parts.is_empty() {
                return Err(DicomWebError::BadRequest(
                    "multipart body contains no parts".to_string(),
                ));
            }
            parts
                .into_iter()
                .map(|p| (p.content_type().map(str::to_string), p.body))
                .collect()
        }
        other => {
            return Err(DicomWebError::UnsupportedMediaType(format!(
                "cannot store content type {other:?}"
            )));
        }
    };

    let total = inputs.len();
    let mut stored = Vec::new();
    let mut failed = Vec::new();
    for (declared_type, bytes) in inputs {
        match process_part(
            state,
            &state.settings.stow,
            study_scope.as_deref(),
            declared_type.as_deref(),
            bytes,
        )
        .await
        {
            Ok(reference) => stored.push(reference),
            Err(failure) => {
                tracing::warn!(
                    SOPInstanceUID = failure.sop_instance_uid,
                    reason = failure.reason,
                    message = failure.message,
                    "rejected STOW part"
                );
                failed.push(failure);
            }
        }
    }

    let status = if failed.is_empty() {
        StatusCode::OK
    } else if stored.is_empty() {
        StatusCode::CONFLICT
    } else {
        StatusCode::ACCEPTED
    };
    let dataset = response_dataset(state, &stored, &failed);
    let mut response = HandlerResponse::json(status, &dataset)?;
    if status == StatusCode::ACCEPTED {
        response = response.with_header(
            "Warning",
            format!(
                "299 {}: {} of {} instances were not stored",
                state.settings.server_name,
                failed.len(),
                total
            ),
        );
    }
    Ok(response)
}

async fn process_part(
    state: &AppState,
    settings: &StowSettings,
    study_scope: Option<&str>,
    declared_type: Option<&str>,
    bytes: Bytes,
) -> Result<StoredRef, FailedRef> {
    if let Some(declared) = declared_type {
        let media = declared.split(';').next().unwrap_or("").trim();
        if !media.eq_ignore_ascii_case("application/dicom") {
            return Err(FailedRef {
                sop_class_uid: String::new(),
                sop_instance_uid: String::new(),
                reason: REASON_CANNOT_UNDERSTAND,
                message: format!("part content type {media:?} is not application/dicom"),
            });
        }
    }
    let object = part10::read_object(&bytes).map_err(|e| FailedRef {
        sop_class_uid: String::new(),
        sop_instance_uid: String::new(),
        reason: REASON_CANNOT_UNDERSTAND,
        message: format!("unparseable DICOM part: {e}"),
    })?;

    let sop_class_uid = element_str(&object, tags::SOP_CLASS_UID);
    let sop_instance_uid = element_str(&object, tags::SOP_INSTANCE_UID);
    let study_uid = element_str(&object, tags::STUDY_INSTANCE_UID);
    let series_uid = element_str(&object, tags::SERIES_INSTANCE_UID);

    let failure = |reason: u16, message: String| FailedRef {
        sop_class_uid: sop_class_uid.clone().unwrap_or_default(),
        sop_instance_uid: sop_instance_uid.clone().unwrap_or_default(),
        reason,
        message,
    };

    if settings.validate_required_attributes {
        for (value, name) in [
            (&study_uid, "StudyInstanceUID"),
            (&series_uid, "SeriesInstanceUID"),
            (&sop_instance_uid, "SOPInstanceUID"),
            (&sop_class_uid, "SOPClassUID"),
        ] {
            if value.is_none() {
                return Err(failure(
                    REASON_CANNOT_UNDERSTAND,
                    format!("missing required attribute {name}"),
                ));
            }
        }
        for raw_tag in &settings.additional_required_tags {
            let Some(tag) = parse_tag(raw_tag) else {
                tracing::warn!(tag = raw_tag, "ignoring unparseable required tag");
                continue;
            };
            if object.element(tag).is_err() {
                return Err(failure(
                    REASON_CANNOT_UNDERSTAND,
                    format!("missing required attribute {raw_tag}"),
                ));
            }
        }
    }

    // an unindexable object is minted identity when validation is off
    let study_uid = study_uid.unwrap_or_else(new_uid);
    let series_uid = series_uid.unwrap_or_else(new_uid);
    let sop_instance_uid = sop_instance_uid.unwrap_or_else(new_uid);
    let sop_class_uid = sop_class_uid.unwrap_or_default();

    let failure = |reason: u16, message: String| FailedRef {
        sop_class_uid: sop_class_uid.clone(),
        sop_instance_uid: sop_instance_uid.clone(),
        reason,
        message,
    };

    if settings.validate_uid_format {
        for (value, name) in [
            (&study_uid, "StudyInstanceUID"),
            (&series_uid, "SeriesInstanceUID"),
            (&sop_instance_uid, "SOPInstanceUID"),
            (&sop_class_uid, "SOPClassUID"),
        ] {
            if !is_valid_uid(value) {
                return Err(failure(
                    REASON_CANNOT_UNDERSTAND,
                    format!("malformed {name} {value:?}"),
                ));
            }
        }
    }

    if settings.validate_sop_classes
        && !settings.allowed_sop_classes.is_empty()
        && !settings.allowed_sop_classes.contains(&sop_class_uid)
    {
        return Err(failure(
            REASON_SOP_CLASS_NOT_SUPPORTED,
            format!("SOP class {sop_class_uid} is not accepted"),
        ));
    }

    if let Some(scope) = study_scope {
        if scope != study_uid {
            return Err(failure(
                REASON_DATASET_MISMATCH,
                format!("object belongs to study {study_uid}, not {scope}"),
            ));
        }
    }

    let key = InstanceKey::new(
        study_uid.clone(),
        series_uid.clone(),
        sop_instance_uid.clone(),
    );
    let exists = state
        .storage
        .contains_instance(&key)
        .await
        .map_err(|e| failure(REASON_PROCESSING_FAILURE, e.to_string()))?;
    let retrieve_url = format!(
        "{}/studies/{}/series/{}/instances/{}",
        state.base_url, study_uid, series_uid, sop_instance_uid
    );
    if exists {
        match settings.duplicate_policy {
            DuplicatePolicy::Reject => {
                return Err(failure(
                    REASON_PROCESSING_FAILURE,
                    format!("instance {sop_instance_uid} already exists"),
                ));
            }
            DuplicatePolicy::Accept => {
                // keep what is stored, report success
                return Ok(StoredRef {
                    sop_class_uid,
                    sop_instance_uid,
                    study_uid,
                    retrieve_url,
                });
            }
            DuplicatePolicy::Replace => {}
        }
    }

    let mut attributes = dataset_from_object(&object);
    attributes.insert(
        TAG_STUDY_INSTANCE_UID.to_string(),
        JsonAttribute::uid(&study_uid),
    );
    attributes.insert(
        TAG_SERIES_INSTANCE_UID.to_string(),
        JsonAttribute::uid(&series_uid),
    );
    attributes.insert(
        TAG_SOP_INSTANCE_UID.to_string(),
        JsonAttribute::uid(&sop_instance_uid),
    );
    let instance = StoredInstance {
        key,
        sop_class_uid: sop_class_uid.clone(),
        transfer_syntax_uid: Some(object.meta().transfer_syntax().to_string()),
        received_at: time::OffsetDateTime::now_utc(),
        attributes,
        payload: bytes,
    };
    state
        .storage
        .store_instance(instance)
        .await
        .map_err(|e| failure(REASON_PROCESSING_FAILURE, e.to_string()))?;
    Ok(StoredRef {
        sop_class_uid,
        sop_instance_uid,
        study_uid,
        retrieve_url,
    })
}

fn response_dataset(state: &AppState, stored: &[StoredRef], failed: &[FailedRef]) -> JsonDataset {
    let mut dataset = JsonDataset::new();
    if !stored.is_empty() {
        let items = stored
            .iter()
            .map(|s| {
                JsonDataset::from([
                    (
                        TAG_REFERENCED_SOP_CLASS_UID.to_string(),
                        JsonAttribute::uid(&s.sop_class_uid),
                    ),
                    (
                        TAG_REFERENCED_SOP_INSTANCE_UID.to_string(),
                        JsonAttribute::uid(&s.sop_instance_uid),
                    ),
                    (
                        TAG_RETRIEVE_URL.to_string(),
                        JsonAttribute::string("UR", &s.retrieve_url),
                    ),
                ])
            })
            .collect();
        dataset.insert(
            TAG_REFERENCED_SOP_SEQUENCE.to_string(),
            JsonAttribute::sequence(items),
        );
    }
    if !failed.is_empty() {
        let items = failed
            .iter()
            .map(|f| {
                let mut item = JsonDataset::from([(
                    TAG_FAILURE_REASON.to_string(),
                    JsonAttribute::integer("US", f.reason as i64),
                )]);
                if !f.sop_class_uid.is_empty() {
                    item.insert(
                        TAG_REFERENCED_SOP_CLASS_UID.to_string(),
                        JsonAttribute::uid(&f.sop_class_uid),
                    );
                }
                if !f.sop_instance_uid.is_empty() {
                    item.insert(
                        TAG_REFERENCED_SOP_INSTANCE_UID.to_string(),
                        JsonAttribute::uid(&f.sop_instance_uid),
                    );
                }
                item
            })
            .collect();
        dataset.insert(
            TAG_FAILED_SOP_SEQUENCE.to_string(),
            JsonAttribute::sequence(items),
        );
    }
    let studies: BTreeSet<&str> = stored.iter().map(|s| s.study_uid.as_str()).collect();
    if studies.len() == 1 {
        if let Some(study_uid) = studies.first() {
            dataset.insert(
                TAG_RETRIEVE_URL.to_string(),
                JsonAttribute::string(
                    "UR",
                    format!("{}/studies/{study_uid}", state.base_url),
                ),
            );
        }
    }
    dataset
}

fn element_str(object: &DefaultDicomObject, tag: Tag) -> Option<String> {
    object
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).to_string())
        .filter(|s| !s.is_empty())
}

fn parse_tag(raw: &str) -> Option<Tag> {
    if raw.len() != 8 {
        return None;
    }
    let group = u16::from_str_radix(&raw[..4], 16).ok()?;
    let element = u16::from_str_radix(&raw[4..], 16).ok()?;
    Some(Tag(group, element))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::DicomWebServer;
    use crate::settings::DicomWebEnvOptions;
    use axum::http::{HeaderMap, HeaderValue, Method};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn context(content_type: Option<&str>, body: Bytes) -> crate::server::RequestContext {
        let mut headers = HeaderMap::new();
        if let Some(ct) = content_type {
            headers.insert("content-type", HeaderValue::from_str(ct).unwrap());
        }
        crate::server::RequestContext {
            method: Method::POST,
            path: "/dicom-web/studies".to_string(),
            query_pairs: Vec::new(),
            headers,
            params: HashMap::new(),
            body,
        }
    }

    #[tokio::test]
    async fn test_empty_body_is_bad_request() {
        let server = DicomWebServer::in_memory(DicomWebEnvOptions::default());
        let ctx = context(Some("application/dicom"), Bytes::new());
        let result = store_instances(server.state(), &ctx, None).await;
        assert!(matches!(result, Err(DicomWebError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_missing_content_type_is_unsupported() {
        let server = DicomWebServer::in_memory(DicomWebEnvOptions::default());
        let ctx = context(None, Bytes::from_static(b"x"));
        let result = store_instances(server.state(), &ctx, None).await;
        assert!(matches!(result, Err(DicomWebError::UnsupportedMediaType(_))));
    }

    #[tokio::test]
    async fn test_multipart_without_boundary_is_bad_request() {
        let server = DicomWebServer::in_memory(DicomWebEnvOptions::default());
        let ctx = context(Some("multipart/related"), Bytes::from_static(b"--x\r\n"));
        let result = store_instances(server.state(), &ctx, None).await;
        assert!(matches!(result, Err(DicomWebError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_unknown_content_type_is_unsupported() {
        let server = DicomWebServer::in_memory(DicomWebEnvOptions::default());
        let ctx = context(Some("text/plain"), Bytes::from_static(b"x"));
        let result = store_instances(server.state(), &ctx, None).await;
        assert!(matches!(result, Err(DicomWebError::UnsupportedMediaType(_))));
    }

    #[tokio::test]
    async fn test_garbage_part_reports_failed_sequence() {
        let server = DicomWebServer::in_memory(DicomWebEnvOptions::default());
        let ctx = context(Some("application/dicom"), Bytes::from_static(b"not dicom"));
        let response = store_instances(server.state(), &ctx, None).await.unwrap();
        assert_eq!(response.status, StatusCode::CONFLICT);
        let dataset: JsonDataset = serde_json::from_slice(&response.body).unwrap();
        let failures = dataset.get(TAG_FAILED_SOP_SEQUENCE).unwrap();
        assert_eq!(failures.items().count(), 1);
        let reason = failures
            .items()
            .next()
            .unwrap()
            .get(TAG_FAILURE_REASON)
            .unwrap()
            .first_integer();
        assert_eq!(reason, Some(REASON_CANNOT_UNDERSTAND as i64));
    }

    #[test]
    fn test_parse_tag() {
        assert_eq!(parse_tag("00100010"), Some(Tag(0x0010, 0x0010)));
        assert_eq!(parse_tag("7FE00010"), Some(Tag(0x7FE0, 0x0010)));
        assert_eq!(parse_tag("123"), None);
        assert_eq!(parse_tag("zzzz0010"), None);
    }
}
