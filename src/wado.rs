//! WADO-RS: retrieve instances, metadata and frames, plus the delete
//! operations on the same tree.

use crate::dicom_json::{JsonAttribute, JsonDataset};
use crate::error::DicomWebError;
use crate::multipart;
use crate::negotiation::{ByteRange, negotiate_media_type, parse_range};
use crate::part10;
use crate::qido::{require_json_acceptable, storage_error};
use crate::server::{AppState, HandlerResponse, RequestContext};
use crate::storage::StoredInstance;
use crate::types::InstanceKey;
use axum::http::StatusCode;
use bytes::Bytes;
use dicom::core::value::Value;
use dicom::dictionary_std::tags;

const TAG_NUMBER_OF_FRAMES: &str = "00280008";
const TAG_PIXEL_DATA: &str = "7FE00010";

pub(crate) async fn retrieve_study(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    let study_uid = ctx.param("studyUID")?;
    let instances = state
        .storage
        .study_instances(study_uid)
        .await
        .map_err(storage_error)?;
    if instances.is_empty() {
        return Err(DicomWebError::NotFound(format!("study {study_uid}")));
    }
    multipart_dicom_response(ctx, instances)
}

pub(crate) async fn retrieve_series(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    let study_uid = ctx.param("studyUID")?;
    let series_uid = ctx.param("seriesUID")?;
    let instances = state
        .storage
        .series_instances(study_uid, series_uid)
        .await
        .map_err(storage_error)?;
    if instances.is_empty() {
        return Err(DicomWebError::NotFound(format!(
            "series {series_uid} in study {study_uid}"
        )));
    }
    multipart_dicom_response(ctx, instances)
}

fn multipart_dicom_response(
    ctx: &RequestContext,
    instances: Vec<StoredInstance>,
) -> Result<HandlerResponse, DicomWebError> {
    negotiate_media_type(ctx.header("accept"), &["multipart/related"]).ok_or_else(|| {
        DicomWebError::NotAcceptable(
            "bulk retrieval is offered as multipart/related; type=\"application/dicom\""
                .to_string(),
        )
    })?;
    let parts: Vec<(String, Bytes)> = instances
        .into_iter()
        .map(|i| ("application/dicom".to_string(), i.payload))
        .collect();
    let boundary = multipart::make_boundary();
    let body = multipart::build_related(&parts, &boundary);
    Ok(HandlerResponse::new(StatusCode::OK).with_body(
        body,
        multipart::related_content_type("application/dicom", &boundary),
    ))
}

pub(crate) async fn retrieve_instance(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    let instance = required_instance(state, ctx).await?;
    negotiate_media_type(
        ctx.header("accept"),
        &["application/dicom", "multipart/related"],
    )
    .ok_or_else(|| {
        DicomWebError::NotAcceptable("instances are offered as application/dicom".to_string())
    })?;
    let payload = instance.payload;
    let total = payload.len() as u64;

    match ctx.header("range") {
        None => Ok(HandlerResponse::new(StatusCode::OK)
            .with_body(payload, "application/dicom")
            .with_header("Accept-Ranges", "bytes")),
        Some(header) => {
            let range = parse_range(header).ok_or_else(|| {
                DicomWebError::BadRequest(format!("malformed Range header {header:?}"))
            })?;
            if range.start >= total {
                return Err(DicomWebError::RangeNotSatisfiable {
                    start: range.start,
                    total,
                });
            }
            let ByteRange { start, end } = range;
            let end = end.min(total - 1);
            let slice = payload.slice(start as usize..=end as usize);
            Ok(HandlerResponse::new(StatusCode::PARTIAL_CONTENT)
                .with_body(slice, "application/dicom")
                .with_header("Accept-Ranges", "bytes")
                .with_header("Content-Range", format!("bytes {start}-{end}/{total}")))
        }
    }
}

pub(crate) async fn retrieve_study_metadata(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    require_json_acceptable(ctx)?;
    let study_uid = ctx.param("studyUID")?;
    let instances = state
        .storage
        .study_instances(study_uid)
        .await
        .map_err(storage_error)?;
    if instances.is_empty() {
        return Err(DicomWebError::NotFound(format!("study {study_uid}")));
    }
    metadata_response(state, instances)
}

pub(crate) async fn retrieve_series_metadata(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    require_json_acceptable(ctx)?;
    let study_uid = ctx.param("studyUID")?;
    let series_uid = ctx.param("seriesUID")?;
    let instances = state
        .storage
        .series_instances(study_uid, series_uid)
        .await
        .map_err(storage_error)?;
    if instances.is_empty() {
        return Err(DicomWebError::NotFound(format!(
            "series {series_uid} in study {study_uid}"
        )));
    }
    metadata_response(state, instances)
}

pub(crate) async fn retrieve_instance_metadata(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    require_json_acceptable(ctx)?;
    let instance = required_instance(state, ctx).await?;
    metadata_response(state, vec![instance])
}

fn metadata_response(
    state: &AppState,
    instances: Vec<StoredInstance>,
) -> Result<HandlerResponse, DicomWebError> {
    let datasets: Vec<JsonDataset> = instances
        .into_iter()
        .map(|instance| {
            let mut dataset = instance.attributes;
            // pixel data is served from the instance resource, not inline
            dataset.insert(
                TAG_PIXEL_DATA.to_string(),
                JsonAttribute::bulk_data_uri(
                    "OW",
                    format!(
                        "{}/studies/{}/series/{}/instances/{}",
                        state.base_url,
                        instance.key.StudyInstanceUID,
                        instance.key.SeriesInstanceUID,
                        instance.key.SOPInstanceUID
                    ),
                ),
            );
            dataset
        })
        .collect();
    HandlerResponse::json(StatusCode::OK, &datasets)
}

pub(crate) async fn retrieve_frames(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    let instance = required_instance(state, ctx).await?;
    let frame_list = parse_frame_list(ctx.param("frames")?)?;
    let frame_count = instance
        .attributes
        .get(TAG_NUMBER_OF_FRAMES)
        .and_then(|a| a.first_integer())
        .unwrap_or(1)
        .max(1) as usize;

    let object = part10::read_object(&instance.payload).map_err(|e| {
        DicomWebError::Internal(format!("stored instance no longer parses: {e}"))
    })?;
    let frames: Vec<Bytes> = match object.element(tags::PIXEL_DATA) {
        Err(_) => Vec::new(),
        Ok(element) => match element.value() {
            Value::PixelSequence(sequence) => sequence
                .fragments()
                .iter()
                .map(|f| Bytes::copy_from_slice(f))
                .collect(),
            Value::Primitive(primitive) => {
                let data = primitive.to_bytes().into_owned();
                split_frames(data, frame_count)
            }
            Value::Sequence(_) => Vec::new(),
        },
    };

    let mut parts = Vec::with_capacity(frame_list.len());
    for number in &frame_list {
        let frame = frames.get(number - 1).ok_or_else(|| {
            DicomWebError::NotFound(format!(
                "frame {number} (instance has {} frames)",
                frames.len()
            ))
        })?;
        parts.push(("application/octet-stream".to_string(), frame.clone()));
    }
    let boundary = multipart::make_boundary();
    let body = multipart::build_related(&parts, &boundary);
    Ok(HandlerResponse::new(StatusCode::OK).with_body(
        body,
        multipart::related_content_type("application/octet-stream", &boundary),
    ))
}

pub(crate) async fn delete_study(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    let study_uid = ctx.param("studyUID")?;
    let removed = state
        .storage
        .delete_study(study_uid)
        .await
        .map_err(storage_error)?;
    if removed == 0 {
        return Err(DicomWebError::NotFound(format!("study {study_uid}")));
    }
    tracing::info!(StudyInstanceUID = study_uid, ndicom = removed, "deleted study");
    Ok(HandlerResponse::new(StatusCode::NO_CONTENT))
}

pub(crate) async fn delete_series(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    let study_uid = ctx.param("studyUID")?;
    let series_uid = ctx.param("seriesUID")?;
    let removed = state
        .storage
        .delete_series(study_uid, series_uid)
        .await
        .map_err(storage_error)?;
    if removed == 0 {
        return Err(DicomWebError::NotFound(format!(
            "series {series_uid} in study {study_uid}"
        )));
    }
    Ok(HandlerResponse::new(StatusCode::NO_CONTENT))
}

pub(crate) async fn delete_instance(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    let key = instance_key(ctx)?;
    let removed = state
        .storage
        .delete_instance(&key)
        .await
        .map_err(storage_error)?;
    if !removed {
        return Err(DicomWebError::NotFound(format!("instance {key}")));
    }
    Ok(HandlerResponse::new(StatusCode::NO_CONTENT))
}

fn instance_key(ctx: &RequestContext) -> Result<InstanceKey, DicomWebError> {
    Ok(InstanceKey::new(
        ctx.param("studyUID")?,
        ctx.param("seriesUID")?,
        ctx.param("instanceUID")?,
    ))
}

async fn required_instance(
    state: &AppState,
    ctx: &RequestContext,
) -> Result<StoredInstance, DicomWebError> {
    let key = instance_key(ctx)?;
    state
        .storage
        .get_instance(&key)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| DicomWebError::NotFound(format!("instance {key}")))
}

/// `frames` is a comma-separated list of 1-based frame numbers.
fn parse_frame_list(raw: &str) -> Result<Vec<usize>, DicomWebError> {
    let frames: Vec<usize> = raw
        .split(',')
        .map(|n| n.trim().parse::<usize>())
        .collect::<Result<_, _>>()
        .map_err(|_| DicomWebError::BadRequest(format!("invalid frame list {raw:?}")))?;
    if frames.is_empty() || frames.contains(&0) {
        return Err(DicomWebError::BadRequest(format!(
            "invalid frame list {raw:?}"
        )));
    }
    Ok(frames)
}

/// Equal-size split of native pixel data.
fn split_frames(data: Vec<u8>, frame_count: usize) -> Vec<Bytes> {
    if data.is_empty() {
        return Vec::new();
    }
    let frame_size = data.len() / frame_count;
    if frame_size == 0 {
        return vec![Bytes::from(data)];
    }
    let data = Bytes::from(data);
    (0..frame_count)
        .map(|i| {
            let start = i * frame_size;
            let end = if i + 1 == frame_count {
                data.len()
            } else {
                start + frame_size
            };
            data.slice(start..end)
        })
        .collect()
}
