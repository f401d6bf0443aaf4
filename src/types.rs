#![allow(non_snake_case)]

use aliri_braid::braid;
use regex::Regex;
use std::sync::LazyLock;

/// The AE title of a peer subscribing to worklist events or pushing DICOMs at us.
#[braid(serde)]
pub struct AeTitle;

/// The set of UIDs which uniquely identifies a DICOM instance.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstanceKey {
    pub StudyInstanceUID: String,
    pub SeriesInstanceUID: String,
    pub SOPInstanceUID: String,
}

impl InstanceKey {
    pub fn new<S: Into<String>>(study: S, series: S, sop: S) -> Self {
        Self {
            StudyInstanceUID: study.into(),
            SeriesInstanceUID: series.into(),
            SOPInstanceUID: sop.into(),
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.StudyInstanceUID, self.SeriesInstanceUID, self.SOPInstanceUID
        )
    }
}

/// Whether `s` is a valid DICOM UID: dotted decimal, no component longer
/// than 39 digits, at most 64 characters overall. Compared byte-wise,
/// never canonicalized.
pub fn is_valid_uid<S: AsRef<str>>(s: S) -> bool {
    let s = s.as_ref();
    s.len() <= 64 && UID_RE.is_match(s) && s.split('.').all(|c| c.len() <= 39)
}

static UID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)*$").unwrap());

/// Mint a fresh UID under the UUID-derived `2.25` root.
pub fn new_uid() -> String {
    format!("2.25.{}", u128::from(ulid::Ulid::new()))
}
