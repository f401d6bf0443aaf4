//! The storage provider contract for the study/series/instance tree.

use crate::dicom_json::JsonDataset;
use crate::types::InstanceKey;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use time::macros::format_description;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// A stored DICOM instance: the opaque Part-10 payload plus the attribute
/// dictionary extracted at store time.
#[derive(Debug, Clone)]
pub struct StoredInstance {
    pub key: InstanceKey,
    pub sop_class_uid: String,
    pub transfer_syntax_uid: Option<String>,
    pub received_at: time::OffsetDateTime,
    pub attributes: JsonDataset,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageCounts {
    pub studies: usize,
    pub series: usize,
    pub instances: usize,
}

/// An inclusive date interval, open-ended on either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<time::Date>,
    pub end: Option<time::Date>,
}

impl DateRange {
    /// Parse `YYYYMMDD`, `YYYYMMDD-YYYYMMDD`, `YYYYMMDD-` or `-YYYYMMDD`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some((start, end)) = s.split_once('-') {
            let start = if start.is_empty() {
                None
            } else {
                Some(parse_da(start)?)
            };
            let end = if end.is_empty() {
                None
            } else {
                Some(parse_da(end)?)
            };
            if start.is_none() && end.is_none() {
                return None;
            }
            Some(Self { start, end })
        } else {
            let date = parse_da(s)?;
            Some(Self {
                start: Some(date),
                end: Some(date),
            })
        }
    }

    pub fn contains(&self, date: time::Date) -> bool {
        self.start.is_none_or(|start| date >= start) && self.end.is_none_or(|end| date <= end)
    }
}

pub fn parse_da(s: &str) -> Option<time::Date> {
    time::Date::parse(s.trim(), format_description!("[year][month][day]")).ok()
}

/// A query over the study/series/instance index, assembled by the QIDO
/// handlers from request query parameters.
#[derive(Debug, Clone, Default)]
pub struct StorageQuery {
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub modality: Option<String>,
    pub study_instance_uid: Option<String>,
    pub accession_number: Option<String>,
    pub study_date: Option<DateRange>,
    /// Further tag-keyed match parameters, matched against the stored
    /// attributes of the queried level.
    pub additional: BTreeMap<String, String>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub fuzzy_matching: bool,
}

/// Persists and indexes DICOM instances.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn store_instance(&self, instance: StoredInstance) -> Result<(), StorageError>;

    async fn contains_instance(&self, key: &InstanceKey) -> Result<bool, StorageError>;

    async fn get_instance(&self, key: &InstanceKey) -> Result<Option<StoredInstance>, StorageError>;

    async fn delete_instance(&self, key: &InstanceKey) -> Result<bool, StorageError>;

    /// Returns the number of deleted instances.
    async fn delete_series(&self, study_uid: &str, series_uid: &str)
    -> Result<usize, StorageError>;

    /// Returns the number of deleted instances.
    async fn delete_study(&self, study_uid: &str) -> Result<usize, StorageError>;

    async fn search_studies(&self, query: &StorageQuery) -> Result<Vec<JsonDataset>, StorageError>;

    async fn search_series(
        &self,
        study_uid: &str,
        query: &StorageQuery,
    ) -> Result<Vec<JsonDataset>, StorageError>;

    async fn search_instances(
        &self,
        study_uid: &str,
        series_uid: &str,
        query: &StorageQuery,
    ) -> Result<Vec<JsonDataset>, StorageError>;

    async fn study_instances(&self, study_uid: &str) -> Result<Vec<StoredInstance>, StorageError>;

    async fn series_instances(
        &self,
        study_uid: &str,
        series_uid: &str,
    ) -> Result<Vec<StoredInstance>, StorageError>;

    async fn count_series(&self, study_uid: &str) -> Result<usize, StorageError>;

    async fn counts(&self) -> Result<StorageCounts, StorageError>;
}
