//! In-memory reference implementation of the storage provider contract.

use crate::dicom_json::{JsonAttribute, JsonDataset, string_of};
use crate::storage::{
    DateRange, StorageCounts, StorageError, StorageProvider, StorageQuery, StoredInstance,
    parse_da,
};
use crate::types::InstanceKey;
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

const TAG_STUDY_DATE: &str = "00080020";
const TAG_ACCESSION_NUMBER: &str = "00080050";
const TAG_MODALITY: &str = "00080060";
const TAG_MODALITIES_IN_STUDY: &str = "00080061";
const TAG_SERIES_DESCRIPTION: &str = "0008103E";
const TAG_PATIENT_NAME: &str = "00100010";
const TAG_PATIENT_ID: &str = "00100020";
const TAG_STUDY_INSTANCE_UID: &str = "0020000D";
const TAG_SERIES_INSTANCE_UID: &str = "0020000E";
const TAG_STUDY_ID: &str = "00200010";
const TAG_SERIES_NUMBER: &str = "00200011";
const TAG_NUM_SERIES: &str = "00201206";
const TAG_NUM_STUDY_INSTANCES: &str = "00201208";
const TAG_NUM_SERIES_INSTANCES: &str = "00201209";

type InstanceMap = BTreeMap<String, StoredInstance>;
type SeriesMap = BTreeMap<String, InstanceMap>;

/// Keeps the whole study/series/instance tree behind one `RwLock`. A series
/// exists while it holds at least one instance, a study while it holds at
/// least one series; deletes prune empty branches.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    inner: RwLock<BTreeMap<String, SeriesMap>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorage {
    async fn store_instance(&self, instance: StoredInstance) -> Result<(), StorageError> {
        let mut inner = self.inner.write().unwrap();
        let key = instance.key.clone();
        inner
            .entry(key.StudyInstanceUID.clone())
            .or_default()
            .entry(key.SeriesInstanceUID.clone())
            .or_default()
            .insert(key.SOPInstanceUID.clone(), instance);
        tracing::debug!(
            StudyInstanceUID = key.StudyInstanceUID,
            SeriesInstanceUID = key.SeriesInstanceUID,
            SOPInstanceUID = key.SOPInstanceUID,
            "stored instance"
        );
        Ok(())
    }

    async fn contains_instance(&self, key: &InstanceKey) -> Result<bool, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(lookup(&inner, key).is_some())
    }

    async fn get_instance(&self, key: &InstanceKey) -> Result<Option<StoredInstance>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(lookup(&inner, key).cloned())
    }

    async fn delete_instance(&self, key: &InstanceKey) -> Result<bool, StorageError> {
        let mut inner = self.inner.write().unwrap();
        let Some(series) = inner.get_mut(&key.StudyInstanceUID) else {
            return Ok(false);
        };
        let Some(instances) = series.get_mut(&key.SeriesInstanceUID) else {
            return Ok(false);
        };
        let removed = instances.remove(&key.SOPInstanceUID).is_some();
        if instances.is_empty() {
            series.remove(&key.SeriesInstanceUID);
        }
        if series.is_empty() {
            inner.remove(&key.StudyInstanceUID);
        }
        Ok(removed)
    }

    async fn delete_series(
        &self,
        study_uid: &str,
        series_uid: &str,
    ) -> Result<usize, StorageError> {
        let mut inner = self.inner.write().unwrap();
        let Some(series) = inner.get_mut(study_uid) else {
            return Ok(0);
        };
        let removed = series.remove(series_uid).map(|m| m.len()).unwrap_or(0);
        if series.is_empty() {
            inner.remove(study_uid);
        }
        Ok(removed)
    }

    async fn delete_study(&self, study_uid: &str) -> Result<usize, StorageError> {
        let mut inner = self.inner.write().unwrap();
        let removed = inner
            .remove(study_uid)
            .map(|series| series.values().map(|m| m.len()).sum())
            .unwrap_or(0);
        Ok(removed)
    }

    async fn search_studies(&self, query: &StorageQuery) -> Result<Vec<JsonDataset>, StorageError> {
        let inner = self.inner.read().unwrap();
        let results = inner
            .iter()
            .map(|(study_uid, series)| study_dataset(study_uid, series))
            .filter(|dataset| study_matches(dataset, query))
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(results)
    }

    async fn search_series(
        &self,
        study_uid: &str,
        query: &StorageQuery,
    ) -> Result<Vec<JsonDataset>, StorageError> {
        let inner = self.inner.read().unwrap();
        let Some(series) = inner.get(study_uid) else {
            return Ok(Vec::new());
        };
        let results = series
            .iter()
            .map(|(series_uid, instances)| series_dataset(series_uid, instances))
            .filter(|dataset| {
                query
                    .modality
                    .as_deref()
                    .is_none_or(|m| attr_matches(dataset, TAG_MODALITY, m, query.fuzzy_matching))
                    && additional_match(dataset, query)
            })
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(results)
    }

    async fn search_instances(
        &self,
        study_uid: &str,
        series_uid: &str,
        query: &StorageQuery,
    ) -> Result<Vec<JsonDataset>, StorageError> {
        let inner = self.inner.read().unwrap();
        let Some(instances) = inner.get(study_uid).and_then(|s| s.get(series_uid)) else {
            return Ok(Vec::new());
        };
        let results = instances
            .values()
            .map(|instance| instance.attributes.clone())
            .filter(|dataset| additional_match(dataset, query))
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(results)
    }

    async fn study_instances(&self, study_uid: &str) -> Result<Vec<StoredInstance>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .get(study_uid)
            .map(|series| {
                series
                    .values()
                    .flat_map(|instances| instances.values().cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn series_instances(
        &self,
        study_uid: &str,
        series_uid: &str,
    ) -> Result<Vec<StoredInstance>, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .get(study_uid)
            .and_then(|series| series.get(series_uid))
            .map(|instances| instances.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn count_series(&self, study_uid: &str) -> Result<usize, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(inner.get(study_uid).map(|s| s.len()).unwrap_or(0))
    }

    async fn counts(&self) -> Result<StorageCounts, StorageError> {
        let inner = self.inner.read().unwrap();
        Ok(StorageCounts {
            studies: inner.len(),
            series: inner.values().map(|s| s.len()).sum(),
            instances: inner
                .values()
                .flat_map(|s| s.values())
                .map(|m| m.len())
                .sum(),
        })
    }
}

fn lookup<'a>(
    tree: &'a BTreeMap<String, SeriesMap>,
    key: &InstanceKey,
) -> Option<&'a StoredInstance> {
    tree.get(&key.StudyInstanceUID)?
        .get(&key.SeriesInstanceUID)?
        .get(&key.SOPInstanceUID)
}

/// Build the study-level result dataset out of the study's instances.
fn study_dataset(study_uid: &str, series: &SeriesMap) -> JsonDataset {
    let mut dataset = JsonDataset::new();
    dataset.insert(
        TAG_STUDY_INSTANCE_UID.to_string(),
        JsonAttribute::uid(study_uid),
    );
    let instance_count: usize = series.values().map(|m| m.len()).sum();
    dataset.insert(
        TAG_NUM_SERIES.to_string(),
        JsonAttribute::integer("IS", series.len() as i64),
    );
    dataset.insert(
        TAG_NUM_STUDY_INSTANCES.to_string(),
        JsonAttribute::integer("IS", instance_count as i64),
    );
    let modalities: BTreeSet<String> = series
        .values()
        .flat_map(|m| m.values())
        .filter_map(|i| string_of(&i.attributes, TAG_MODALITY))
        .collect();
    if !modalities.is_empty() {
        dataset.insert(
            TAG_MODALITIES_IN_STUDY.to_string(),
            JsonAttribute::strings("CS", modalities.into_iter().collect()),
        );
    }
    if let Some(first) = series.values().flat_map(|m| m.values()).next() {
        for tag in [
            TAG_STUDY_DATE,
            "00080030",
            TAG_ACCESSION_NUMBER,
            TAG_PATIENT_NAME,
            TAG_PATIENT_ID,
            "00100030",
            "00100040",
            TAG_STUDY_ID,
            "00081030",
        ] {
            if let Some(attr) = first.attributes.get(tag) {
                dataset.insert(tag.to_string(), attr.clone());
            }
        }
    }
    dataset
}

/// Build the series-level result dataset out of the series' instances.
fn series_dataset(series_uid: &str, instances: &InstanceMap) -> JsonDataset {
    let mut dataset = JsonDataset::new();
    dataset.insert(
        TAG_SERIES_INSTANCE_UID.to_string(),
        JsonAttribute::uid(series_uid),
    );
    dataset.insert(
        TAG_NUM_SERIES_INSTANCES.to_string(),
        JsonAttribute::integer("IS", instances.len() as i64),
    );
    if let Some(first) = instances.values().next() {
        for tag in [TAG_MODALITY, TAG_SERIES_NUMBER, TAG_SERIES_DESCRIPTION] {
            if let Some(attr) = first.attributes.get(tag) {
                dataset.insert(tag.to_string(), attr.clone());
            }
        }
    }
    dataset
}

fn study_matches(dataset: &JsonDataset, query: &StorageQuery) -> bool {
    if let Some(uid) = &query.study_instance_uid {
        if string_of(dataset, TAG_STUDY_INSTANCE_UID).as_deref() != Some(uid.as_str()) {
            return false;
        }
    }
    if let Some(pattern) = &query.patient_name {
        if !attr_matches(dataset, TAG_PATIENT_NAME, pattern, query.fuzzy_matching) {
            return false;
        }
    }
    if let Some(pattern) = &query.patient_id {
        if !attr_matches(dataset, TAG_PATIENT_ID, pattern, query.fuzzy_matching) {
            return false;
        }
    }
    if let Some(pattern) = &query.accession_number {
        if !attr_matches(dataset, TAG_ACCESSION_NUMBER, pattern, query.fuzzy_matching) {
            return false;
        }
    }
    if let Some(modality) = &query.modality {
        let in_study = dataset
            .get(TAG_MODALITIES_IN_STUDY)
            .map(|attr| {
                attr.value.iter().any(|v| match v {
                    crate::dicom_json::JsonValue::Str(s) => s.eq_ignore_ascii_case(modality),
                    _ => false,
                })
            })
            .unwrap_or(false);
        if !in_study {
            return false;
        }
    }
    if let Some(range) = &query.study_date {
        let within = string_of(dataset, TAG_STUDY_DATE)
            .and_then(|s| parse_da(&s))
            .map(|date| range.contains(date))
            .unwrap_or(false);
        if !within {
            return false;
        }
    }
    additional_match(dataset, query)
}

fn additional_match(dataset: &JsonDataset, query: &StorageQuery) -> bool {
    query
        .additional
        .iter()
        .all(|(tag, pattern)| attr_matches(dataset, tag, pattern, query.fuzzy_matching))
}

/// Match one attribute value against a QIDO match parameter. `*` and `?`
/// wildcards apply to text values; fuzzy matching relaxes to a
/// case-insensitive substring test.
fn attr_matches(dataset: &JsonDataset, tag: &str, pattern: &str, fuzzy: bool) -> bool {
    let Some(value) = string_of(dataset, tag) else {
        return false;
    };
    value_matches(&value, pattern, fuzzy)
}

fn value_matches(value: &str, pattern: &str, fuzzy: bool) -> bool {
    if fuzzy {
        let needle = pattern.replace(['*', '?'], "").to_lowercase();
        return value.to_lowercase().contains(&needle);
    }
    if pattern.contains('*') || pattern.contains('?') {
        match wildcard_regex(pattern) {
            Some(re) => re.is_match(value),
            None => false,
        }
    } else {
        value == pattern
    }
}

fn wildcard_regex(pattern: &str) -> Option<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn instance(study: &str, series: &str, sop: &str, attrs: &[(&str, JsonAttribute)]) -> StoredInstance {
        let mut attributes = JsonDataset::new();
        attributes.insert(
            TAG_STUDY_INSTANCE_UID.to_string(),
            JsonAttribute::uid(study),
        );
        attributes.insert(
            TAG_SERIES_INSTANCE_UID.to_string(),
            JsonAttribute::uid(series),
        );
        attributes.insert("00080018".to_string(), JsonAttribute::uid(sop));
        for (tag, attr) in attrs {
            attributes.insert(tag.to_string(), attr.clone());
        }
        StoredInstance {
            key: InstanceKey::new(study, series, sop),
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            transfer_syntax_uid: Some("1.2.840.10008.1.2.1".to_string()),
            received_at: time::OffsetDateTime::UNIX_EPOCH,
            attributes,
            payload: Bytes::from_static(b"\x00\x01"),
        }
    }

    #[fixture]
    fn storage() -> InMemoryStorage {
        InMemoryStorage::new()
    }

    #[rstest]
    #[tokio::test]
    async fn test_store_then_get_is_byte_identical(storage: InMemoryStorage) {
        let stored = instance("1.2.3", "1.2.3.4", "1.2.3.4.5", &[]);
        storage.store_instance(stored.clone()).await.unwrap();
        let fetched = storage
            .get_instance(&InstanceKey::new("1.2.3", "1.2.3.4", "1.2.3.4.5"))
            .await
            .unwrap()
            .expect("instance should exist");
        assert_eq!(fetched.payload, stored.payload);
    }

    #[rstest]
    #[tokio::test]
    async fn test_empty_series_and_studies_disappear(storage: InMemoryStorage) {
        storage
            .store_instance(instance("1.2.3", "1.2.3.4", "1.2.3.4.5", &[]))
            .await
            .unwrap();
        storage
            .delete_instance(&InstanceKey::new("1.2.3", "1.2.3.4", "1.2.3.4.5"))
            .await
            .unwrap();
        let counts = storage.counts().await.unwrap();
        assert_eq!(counts, StorageCounts::default());
    }

    #[rstest]
    #[tokio::test]
    async fn test_search_studies_with_filters(storage: InMemoryStorage) {
        storage
            .store_instance(instance(
                "1.2.3",
                "1.2.3.4",
                "1.2.3.4.5",
                &[
                    ("00100010", JsonAttribute::person_name("Doe^John")),
                    ("00080060", JsonAttribute::string("CS", "CT")),
                    ("00080020", JsonAttribute::string("DA", "20240110")),
                ],
            ))
            .await
            .unwrap();
        storage
            .store_instance(instance(
                "9.8.7",
                "9.8.7.6",
                "9.8.7.6.5",
                &[
                    ("00100010", JsonAttribute::person_name("Roe^Jane")),
                    ("00080060", JsonAttribute::string("CS", "MR")),
                    ("00080020", JsonAttribute::string("DA", "20240220")),
                ],
            ))
            .await
            .unwrap();

        let query = StorageQuery {
            patient_name: Some("Doe*".to_string()),
            ..Default::default()
        };
        let results = storage.search_studies(&query).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            string_of(&results[0], TAG_STUDY_INSTANCE_UID).as_deref(),
            Some("1.2.3")
        );

        let query = StorageQuery {
            modality: Some("MR".to_string()),
            ..Default::default()
        };
        let results = storage.search_studies(&query).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            string_of(&results[0], TAG_STUDY_INSTANCE_UID).as_deref(),
            Some("9.8.7")
        );

        let query = StorageQuery {
            study_date: DateRange::parse("20240201-"),
            ..Default::default()
        };
        let results = storage.search_studies(&query).await.unwrap();
        assert_eq!(results.len(), 1);

        let query = StorageQuery {
            limit: Some(1),
            ..Default::default()
        };
        assert_eq!(storage.search_studies(&query).await.unwrap().len(), 1);
        let query = StorageQuery {
            offset: 5,
            ..Default::default()
        };
        assert!(storage.search_studies(&query).await.unwrap().is_empty());
    }

    #[rstest]
    #[case("Doe^John", "Doe*", false, true)]
    #[case("Doe^John", "D?e^John", false, true)]
    #[case("Doe^John", "doe*", false, false)]
    #[case("Doe^John", "doe", true, true)]
    #[case("Doe^John", "Smith*", false, false)]
    #[case("CT", "CT", false, true)]
    fn test_value_matching(
        #[case] value: &str,
        #[case] pattern: &str,
        #[case] fuzzy: bool,
        #[case] expected: bool,
    ) {
        assert_eq!(value_matches(value, pattern, fuzzy), expected);
    }

    #[rstest]
    #[tokio::test]
    async fn test_series_dataset_counts(storage: InMemoryStorage) {
        for sop in ["1.1", "1.2", "1.3"] {
            storage
                .store_instance(instance("1.2.3", "1.2.3.4", sop, &[]))
                .await
                .unwrap();
        }
        let series = storage
            .search_series("1.2.3", &StorageQuery::default())
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(
            series[0].get(TAG_NUM_SERIES_INSTANCES).unwrap().first_integer(),
            Some(3)
        );
    }
}
