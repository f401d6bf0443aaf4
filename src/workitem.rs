//! The UPS workitem record, its state machine, and its DICOM+JSON codec.

use crate::dicom_json::{JsonAttribute, JsonDataset, string_of};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const TAG_SOP_INSTANCE_UID: &str = "00080018";
pub const TAG_PROCEDURE_STEP_STATE: &str = "00741000";
pub const TAG_TRANSACTION_UID: &str = "00081195";
const TAG_SPS_PRIORITY: &str = "00741200";
const TAG_PATIENT_NAME: &str = "00100010";
const TAG_PATIENT_ID: &str = "00100020";
const TAG_SPS_START_DATETIME: &str = "00404005";
const TAG_EXPECTED_COMPLETION_DATETIME: &str = "00404011";
const TAG_STUDY_INSTANCE_UID: &str = "0020000D";
const TAG_PROCEDURE_STEP_LABEL: &str = "00741204";
const TAG_WORKLIST_LABEL: &str = "00741202";
const TAG_SCHEDULED_WORKITEM_CODE_SEQ: &str = "00404018";
const TAG_SCHEDULED_HUMAN_PERFORMERS_SEQ: &str = "00404034";
const TAG_HUMAN_PERFORMER_CODE_SEQ: &str = "00404009";
const TAG_HUMAN_PERFORMER_NAME: &str = "00404037";
const TAG_INPUT_INFORMATION_SEQ: &str = "00404021";
const TAG_OUTPUT_INFORMATION_SEQ: &str = "00404033";
const TAG_PROGRESS_INFORMATION_SEQ: &str = "00741002";
const TAG_PROGRESS: &str = "00741004";
const TAG_PROGRESS_DESCRIPTION: &str = "00741006";
const TAG_CANCELLATION_REASON: &str = "00741238";
const TAG_CANCELLATION_DATETIME: &str = "00404052";
const TAG_CODE_VALUE: &str = "00080100";
const TAG_CODING_SCHEME_DESIGNATOR: &str = "00080102";
const TAG_CODE_MEANING: &str = "00080104";
const TAG_REFERENCED_SOP_CLASS_UID: &str = "00081150";
const TAG_REFERENCED_SOP_INSTANCE_UID: &str = "00081155";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkitemValidationError {
    #[error("workitem UID must not be empty")]
    EmptyWorkitemUid,

    #[error("a workitem in IN PROGRESS must carry a transaction UID")]
    MissingTransactionUid,

    #[error("a workitem in a final state admits no further changes")]
    FinalStateViolation,

    #[error("invalid workitem field: {0}")]
    InvalidField(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcedureStepState {
    Scheduled,
    InProgress,
    Completed,
    Canceled,
}

impl ProcedureStepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::InProgress => "IN PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "SCHEDULED" => Some(Self::Scheduled),
            "IN PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled)
    }

    /// The legal transitions of the UPS state machine. Everything else is a
    /// conflict.
    pub fn can_transition_to(&self, to: ProcedureStepState) -> bool {
        matches!(
            (self, to),
            (Self::Scheduled, Self::InProgress)
                | (Self::Scheduled, Self::Canceled)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Canceled)
        )
    }
}

impl std::fmt::Display for ProcedureStepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpsPriority {
    Low,
    #[default]
    Medium,
    High,
    Stat,
}

impl UpsPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Stat => "STAT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "STAT" => Some(Self::Stat),
            _ => None,
        }
    }
}

/// A coded entry (code value, scheme, meaning) as used by workitem code and
/// performer code sequences.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodedEntry {
    pub code_value: Option<String>,
    pub coding_scheme_designator: Option<String>,
    pub code_meaning: Option<String>,
}

impl CodedEntry {
    fn to_dataset(&self) -> JsonDataset {
        let mut item = JsonDataset::new();
        if let Some(v) = &self.code_value {
            item.insert(TAG_CODE_VALUE.to_string(), JsonAttribute::string("SH", v));
        }
        if let Some(v) = &self.coding_scheme_designator {
            item.insert(
                TAG_CODING_SCHEME_DESIGNATOR.to_string(),
                JsonAttribute::string("SH", v),
            );
        }
        if let Some(v) = &self.code_meaning {
            item.insert(TAG_CODE_MEANING.to_string(), JsonAttribute::string("LO", v));
        }
        item
    }

    fn from_dataset(item: &JsonDataset) -> Self {
        Self {
            code_value: string_of(item, TAG_CODE_VALUE),
            coding_scheme_designator: string_of(item, TAG_CODING_SCHEME_DESIGNATOR),
            code_meaning: string_of(item, TAG_CODE_MEANING),
        }
    }
}

/// A scheduled human performer: a name, a code, or both.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HumanPerformer {
    pub name: Option<String>,
    pub code: Option<CodedEntry>,
}

impl HumanPerformer {
    /// The most descriptive label available for event payloads.
    pub fn label(&self) -> Option<String> {
        self.name
            .clone()
            .or_else(|| self.code.as_ref().and_then(|c| c.code_meaning.clone()))
    }
}

/// A reference into the study/series/instance tree, used by the input and
/// output information sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencedSop {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgressInformation {
    pub progress: Option<i64>,
    pub description: Option<String>,
}

/// A UPS procedure-step record.
#[derive(Debug, Clone, PartialEq)]
pub struct Workitem {
    pub workitem_uid: String,
    pub state: ProcedureStepState,
    pub priority: UpsPriority,
    pub transaction_uid: Option<String>,
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub scheduled_start: Option<String>,
    pub expected_completion: Option<String>,
    pub study_instance_uid: Option<String>,
    pub procedure_step_label: Option<String>,
    pub worklist_label: Option<String>,
    pub workitem_code: Option<CodedEntry>,
    pub scheduled_performers: Vec<HumanPerformer>,
    pub input_information: Vec<ReferencedSop>,
    pub output_information: Vec<ReferencedSop>,
    pub progress: Option<ProgressInformation>,
    pub cancellation_reason: Option<String>,
    pub cancellation_datetime: Option<String>,
    /// Attributes this model does not interpret; they round-trip untouched.
    pub extra: JsonDataset,
}

impl Workitem {
    pub fn new<S: Into<String>>(workitem_uid: S) -> Self {
        Self {
            workitem_uid: workitem_uid.into(),
            state: ProcedureStepState::Scheduled,
            priority: UpsPriority::default(),
            transaction_uid: None,
            patient_name: None,
            patient_id: None,
            scheduled_start: None,
            expected_completion: None,
            study_instance_uid: None,
            procedure_step_label: None,
            worklist_label: None,
            workitem_code: None,
            scheduled_performers: Vec::new(),
            input_information: Vec::new(),
            output_information: Vec::new(),
            progress: None,
            cancellation_reason: None,
            cancellation_datetime: None,
            extra: JsonDataset::new(),
        }
    }

    pub fn validate(&self) -> Result<(), WorkitemValidationError> {
        if self.workitem_uid.is_empty() {
            return Err(WorkitemValidationError::EmptyWorkitemUid);
        }
        if self.state == ProcedureStepState::InProgress && self.transaction_uid.is_none() {
            return Err(WorkitemValidationError::MissingTransactionUid);
        }
        Ok(())
    }

    pub fn to_dataset(&self) -> JsonDataset {
        let mut ds = self.extra.clone();
        ds.insert(
            TAG_SOP_INSTANCE_UID.to_string(),
            JsonAttribute::uid(&self.workitem_uid),
        );
        ds.insert(
            TAG_PROCEDURE_STEP_STATE.to_string(),
            JsonAttribute::string("CS", self.state.as_str()),
        );
        ds.insert(
            TAG_SPS_PRIORITY.to_string(),
            JsonAttribute::string("CS", self.priority.as_str()),
        );
        if let Some(v) = &self.transaction_uid {
            ds.insert(TAG_TRANSACTION_UID.to_string(), JsonAttribute::uid(v));
        }
        if let Some(v) = &self.patient_name {
            ds.insert(TAG_PATIENT_NAME.to_string(), JsonAttribute::person_name(v));
        }
        if let Some(v) = &self.patient_id {
            ds.insert(TAG_PATIENT_ID.to_string(), JsonAttribute::string("LO", v));
        }
        if let Some(v) = &self.scheduled_start {
            ds.insert(
                TAG_SPS_START_DATETIME.to_string(),
                JsonAttribute::string("DT", v),
            );
        }
        if let Some(v) = &self.expected_completion {
            ds.insert(
                TAG_EXPECTED_COMPLETION_DATETIME.to_string(),
                JsonAttribute::string("DT", v),
            );
        }
        if let Some(v) = &self.study_instance_uid {
            ds.insert(TAG_STUDY_INSTANCE_UID.to_string(), JsonAttribute::uid(v));
        }
        if let Some(v) = &self.procedure_step_label {
            ds.insert(
                TAG_PROCEDURE_STEP_LABEL.to_string(),
                JsonAttribute::string("LO", v),
            );
        }
        if let Some(v) = &self.worklist_label {
            ds.insert(TAG_WORKLIST_LABEL.to_string(), JsonAttribute::string("LO", v));
        }
        if let Some(code) = &self.workitem_code {
            ds.insert(
                TAG_SCHEDULED_WORKITEM_CODE_SEQ.to_string(),
                JsonAttribute::sequence(vec![code.to_dataset()]),
            );
        }
        if !self.scheduled_performers.is_empty() {
            let items = self
                .scheduled_performers
                .iter()
                .map(|p| {
                    let mut item = JsonDataset::new();
                    if let Some(name) = &p.name {
                        item.insert(
                            TAG_HUMAN_PERFORMER_NAME.to_string(),
                            JsonAttribute::person_name(name),
                        );
                    }
                    if let Some(code) = &p.code {
                        item.insert(
                            TAG_HUMAN_PERFORMER_CODE_SEQ.to_string(),
                            JsonAttribute::sequence(vec![code.to_dataset()]),
                        );
                    }
                    item
                })
                .collect();
            ds.insert(
                TAG_SCHEDULED_HUMAN_PERFORMERS_SEQ.to_string(),
                JsonAttribute::sequence(items),
            );
        }
        if !self.input_information.is_empty() {
            ds.insert(
                TAG_INPUT_INFORMATION_SEQ.to_string(),
                JsonAttribute::sequence(referenced_sop_items(&self.input_information)),
            );
        }
        if !self.output_information.is_empty() {
            ds.insert(
                TAG_OUTPUT_INFORMATION_SEQ.to_string(),
                JsonAttribute::sequence(referenced_sop_items(&self.output_information)),
            );
        }
        if let Some(progress) = &self.progress {
            let mut item = JsonDataset::new();
            if let Some(v) = progress.progress {
                item.insert(TAG_PROGRESS.to_string(), JsonAttribute::integer("DS", v));
            }
            if let Some(v) = &progress.description {
                item.insert(
                    TAG_PROGRESS_DESCRIPTION.to_string(),
                    JsonAttribute::string("ST", v),
                );
            }
            ds.insert(
                TAG_PROGRESS_INFORMATION_SEQ.to_string(),
                JsonAttribute::sequence(vec![item]),
            );
        }
        if let Some(v) = &self.cancellation_reason {
            ds.insert(
                TAG_CANCELLATION_REASON.to_string(),
                JsonAttribute::string("LT", v),
            );
        }
        if let Some(v) = &self.cancellation_datetime {
            ds.insert(
                TAG_CANCELLATION_DATETIME.to_string(),
                JsonAttribute::string("DT", v),
            );
        }
        ds
    }

    pub fn from_dataset(ds: &JsonDataset) -> Result<Self, WorkitemValidationError> {
        let state = match string_of(ds, TAG_PROCEDURE_STEP_STATE) {
            Some(s) => ProcedureStepState::parse(&s).ok_or_else(|| {
                WorkitemValidationError::InvalidField(format!("procedure step state {s:?}"))
            })?,
            None => ProcedureStepState::Scheduled,
        };
        let priority = match string_of(ds, TAG_SPS_PRIORITY) {
            Some(s) => UpsPriority::parse(&s).ok_or_else(|| {
                WorkitemValidationError::InvalidField(format!("priority {s:?}"))
            })?,
            None => UpsPriority::default(),
        };
        let progress = ds.get(TAG_PROGRESS_INFORMATION_SEQ).and_then(|attr| {
            attr.items().next().map(|item| ProgressInformation {
                progress: item.get(TAG_PROGRESS).and_then(|a| a.first_integer()),
                description: string_of(item, TAG_PROGRESS_DESCRIPTION),
            })
        });
        let workitem = Self {
            workitem_uid: string_of(ds, TAG_SOP_INSTANCE_UID).unwrap_or_default(),
            state,
            priority,
            transaction_uid: string_of(ds, TAG_TRANSACTION_UID),
            patient_name: string_of(ds, TAG_PATIENT_NAME),
            patient_id: string_of(ds, TAG_PATIENT_ID),
            scheduled_start: string_of(ds, TAG_SPS_START_DATETIME),
            expected_completion: string_of(ds, TAG_EXPECTED_COMPLETION_DATETIME),
            study_instance_uid: string_of(ds, TAG_STUDY_INSTANCE_UID),
            procedure_step_label: string_of(ds, TAG_PROCEDURE_STEP_LABEL),
            worklist_label: string_of(ds, TAG_WORKLIST_LABEL),
            workitem_code: ds
                .get(TAG_SCHEDULED_WORKITEM_CODE_SEQ)
                .and_then(|attr| attr.items().next().map(CodedEntry::from_dataset)),
            scheduled_performers: ds
                .get(TAG_SCHEDULED_HUMAN_PERFORMERS_SEQ)
                .map(|attr| {
                    attr.items()
                        .map(|item| HumanPerformer {
                            name: string_of(item, TAG_HUMAN_PERFORMER_NAME),
                            code: item
                                .get(TAG_HUMAN_PERFORMER_CODE_SEQ)
                                .and_then(|a| a.items().next().map(CodedEntry::from_dataset)),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            input_information: referenced_sops_of(ds, TAG_INPUT_INFORMATION_SEQ),
            output_information: referenced_sops_of(ds, TAG_OUTPUT_INFORMATION_SEQ),
            progress,
            cancellation_reason: string_of(ds, TAG_CANCELLATION_REASON),
            cancellation_datetime: string_of(ds, TAG_CANCELLATION_DATETIME),
            extra: ds
                .iter()
                .filter(|(key, _)| !KNOWN_TAGS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect::<BTreeMap<_, _>>(),
        };
        Ok(workitem)
    }

    /// Merge an update dataset into this workitem. The state and the
    /// transaction UID cannot be changed through update.
    pub fn merge_update(&mut self, ds: &JsonDataset) -> Result<(), WorkitemValidationError> {
        if let Some(requested) = string_of(ds, TAG_PROCEDURE_STEP_STATE) {
            if ProcedureStepState::parse(&requested) != Some(self.state) {
                return Err(WorkitemValidationError::InvalidField(
                    "procedure step state cannot be modified by update".to_string(),
                ));
            }
        }
        if ds.contains_key(TAG_TRANSACTION_UID) {
            return Err(WorkitemValidationError::InvalidField(
                "transaction UID cannot be modified by update".to_string(),
            ));
        }
        let mut merged = self.to_dataset();
        for (key, value) in ds {
            if key == TAG_SOP_INSTANCE_UID {
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }
        let mut updated = Self::from_dataset(&merged)?;
        updated.workitem_uid = self.workitem_uid.clone();
        updated.state = self.state;
        updated.transaction_uid = self.transaction_uid.clone();
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

fn referenced_sop_items(refs: &[ReferencedSop]) -> Vec<JsonDataset> {
    refs.iter()
        .map(|r| {
            JsonDataset::from([
                (
                    TAG_REFERENCED_SOP_CLASS_UID.to_string(),
                    JsonAttribute::uid(&r.sop_class_uid),
                ),
                (
                    TAG_REFERENCED_SOP_INSTANCE_UID.to_string(),
                    JsonAttribute::uid(&r.sop_instance_uid),
                ),
            ])
        })
        .collect()
}

fn referenced_sops_of(ds: &JsonDataset, tag: &str) -> Vec<ReferencedSop> {
    ds.get(tag)
        .map(|attr| {
            attr.items()
                .map(|item| ReferencedSop {
                    sop_class_uid: string_of(item, TAG_REFERENCED_SOP_CLASS_UID)
                        .unwrap_or_default(),
                    sop_instance_uid: string_of(item, TAG_REFERENCED_SOP_INSTANCE_UID)
                        .unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default()
}

const KNOWN_TAGS: [&str; 18] = [
    TAG_SOP_INSTANCE_UID,
    TAG_PROCEDURE_STEP_STATE,
    TAG_SPS_PRIORITY,
    TAG_TRANSACTION_UID,
    TAG_PATIENT_NAME,
    TAG_PATIENT_ID,
    TAG_SPS_START_DATETIME,
    TAG_EXPECTED_COMPLETION_DATETIME,
    TAG_STUDY_INSTANCE_UID,
    TAG_PROCEDURE_STEP_LABEL,
    TAG_WORKLIST_LABEL,
    TAG_SCHEDULED_WORKITEM_CODE_SEQ,
    TAG_SCHEDULED_HUMAN_PERFORMERS_SEQ,
    TAG_INPUT_INFORMATION_SEQ,
    TAG_OUTPUT_INFORMATION_SEQ,
    TAG_PROGRESS_INFORMATION_SEQ,
    TAG_CANCELLATION_REASON,
    TAG_CANCELLATION_DATETIME,
];

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    use ProcedureStepState::*;

    #[rstest]
    #[case(Scheduled, InProgress, true)]
    #[case(Scheduled, Canceled, true)]
    #[case(InProgress, Completed, true)]
    #[case(InProgress, Canceled, true)]
    #[case(Scheduled, Completed, false)]
    #[case(Scheduled, Scheduled, false)]
    #[case(InProgress, Scheduled, false)]
    #[case(InProgress, InProgress, false)]
    #[case(Completed, Scheduled, false)]
    #[case(Completed, InProgress, false)]
    #[case(Completed, Canceled, false)]
    #[case(Canceled, Scheduled, false)]
    #[case(Canceled, InProgress, false)]
    #[case(Canceled, Completed, false)]
    fn test_state_machine(
        #[case] from: ProcedureStepState,
        #[case] to: ProcedureStepState,
        #[case] legal: bool,
    ) {
        assert_eq!(from.can_transition_to(to), legal);
    }

    #[test]
    fn test_state_strings_roundtrip() {
        for state in [Scheduled, InProgress, Completed, Canceled] {
            assert_eq!(ProcedureStepState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ProcedureStepState::parse("IN_PROGRESS"), None);
    }

    #[fixture]
    fn full_workitem() -> Workitem {
        let mut w = Workitem::new("1.2.3.4.5");
        w.priority = UpsPriority::High;
        w.patient_name = Some("Doe^Jane".to_string());
        w.patient_id = Some("PAT-7".to_string());
        w.scheduled_start = Some("20260801T120000".to_string());
        w.study_instance_uid = Some("1.2.3".to_string());
        w.procedure_step_label = Some("CT Head".to_string());
        w.worklist_label = Some("Neuro".to_string());
        w.workitem_code = Some(CodedEntry {
            code_value: Some("110005".to_string()),
            coding_scheme_designator: Some("DCM".to_string()),
            code_meaning: Some("Interpretation".to_string()),
        });
        w.scheduled_performers = vec![HumanPerformer {
            name: Some("Smith^Alex".to_string()),
            code: None,
        }];
        w.input_information = vec![ReferencedSop {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
            sop_instance_uid: "1.2.3.4".to_string(),
        }];
        w.progress = Some(ProgressInformation {
            progress: Some(40),
            description: Some("reconstructing".to_string()),
        });
        w
    }

    #[rstest]
    fn test_json_roundtrip_is_identity(full_workitem: Workitem) {
        let ds = full_workitem.to_dataset();
        let back = Workitem::from_dataset(&ds).unwrap();
        assert_eq!(back, full_workitem);
    }

    #[rstest]
    fn test_roundtrip_preserves_unknown_attributes(mut full_workitem: Workitem) {
        full_workitem.extra.insert(
            "00081080".to_string(),
            JsonAttribute::string("LO", "Acute appendicitis"),
        );
        let ds = full_workitem.to_dataset();
        let back = Workitem::from_dataset(&ds).unwrap();
        assert_eq!(back, full_workitem);
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            Workitem::new("").validate(),
            Err(WorkitemValidationError::EmptyWorkitemUid)
        );
        let mut w = Workitem::new("1.2");
        w.state = InProgress;
        assert_eq!(
            w.validate(),
            Err(WorkitemValidationError::MissingTransactionUid)
        );
        w.transaction_uid = Some("2.25.1".to_string());
        assert_eq!(w.validate(), Ok(()));
    }

    #[rstest]
    fn test_update_cannot_change_state(mut full_workitem: Workitem) {
        let mut ds = JsonDataset::new();
        ds.insert(
            TAG_PROCEDURE_STEP_STATE.to_string(),
            JsonAttribute::string("CS", "COMPLETED"),
        );
        let result = full_workitem.merge_update(&ds);
        assert!(matches!(
            result,
            Err(WorkitemValidationError::InvalidField(_))
        ));
    }

    #[rstest]
    fn test_update_merges_fields(mut full_workitem: Workitem) {
        let mut ds = JsonDataset::new();
        ds.insert(
            TAG_PROCEDURE_STEP_LABEL.to_string(),
            JsonAttribute::string("LO", "MR Head"),
        );
        full_workitem.merge_update(&ds).unwrap();
        assert_eq!(full_workitem.procedure_step_label.as_deref(), Some("MR Head"));
        assert_eq!(full_workitem.patient_id.as_deref(), Some("PAT-7"));
    }
}
