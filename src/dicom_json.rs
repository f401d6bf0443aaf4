//! The DICOM+JSON (PS3.18 annex F) attribute model.
//!
//! Attribute payloads are heterogeneous: `{"vr": ..., "Value": [...]}` where
//! a value may be a string, a number, a person-name object, or a nested
//! sequence item. Binary content appears as `InlineBinary` (base64) or as a
//! `BulkDataURI` reference next to the `vr` key instead of inside `Value`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dicom::core::VR;
use dicom::core::header::Header;
use dicom::core::value::Value;
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::InMemDicomObject;
use dicom::object::mem::InMemElement;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A dataset is an ordered map keyed by 8-hex-digit tag strings.
pub type JsonDataset = BTreeMap<String, JsonAttribute>;

/// One DICOM attribute in its PS3.18 JSON shape. The VR is always explicit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonAttribute {
    pub vr: String,
    #[serde(rename = "Value", default, skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<JsonValue>,
    #[serde(rename = "InlineBinary", default, skip_serializing_if = "Option::is_none")]
    pub inline_binary: Option<String>,
    #[serde(rename = "BulkDataURI", default, skip_serializing_if = "Option::is_none")]
    pub bulk_data_uri: Option<String>,
}

/// A single entry of an attribute's `Value` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonValue {
    Str(String),
    Number(serde_json::Number),
    PersonName(PersonName),
    Item(JsonDataset),
}

/// The three component groups of a PN value.
///
/// `deny_unknown_fields` keeps serde's untagged resolution from mistaking a
/// sequence item (whose keys are tag strings) for a person name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersonName {
    #[serde(rename = "Alphabetic", default, skip_serializing_if = "Option::is_none")]
    pub alphabetic: Option<String>,
    #[serde(rename = "Ideographic", default, skip_serializing_if = "Option::is_none")]
    pub ideographic: Option<String>,
    #[serde(rename = "Phonetic", default, skip_serializing_if = "Option::is_none")]
    pub phonetic: Option<String>,
}

impl JsonAttribute {
    pub fn empty<V: Into<String>>(vr: V) -> Self {
        Self {
            vr: vr.into(),
            value: Vec::new(),
            inline_binary: None,
            bulk_data_uri: None,
        }
    }

    pub fn string<V: Into<String>, S: Into<String>>(vr: V, value: S) -> Self {
        Self {
            value: vec![JsonValue::Str(value.into())],
            ..Self::empty(vr)
        }
    }

    pub fn strings<V: Into<String>>(vr: V, values: Vec<String>) -> Self {
        Self {
            value: values.into_iter().map(JsonValue::Str).collect(),
            ..Self::empty(vr)
        }
    }

    pub fn uid<S: Into<String>>(value: S) -> Self {
        Self::string("UI", value)
    }

    pub fn integer<V: Into<String>>(vr: V, value: i64) -> Self {
        Self {
            value: vec![JsonValue::Number(serde_json::Number::from(value))],
            ..Self::empty(vr)
        }
    }

    pub fn person_name<S: Into<String>>(value: S) -> Self {
        Self {
            value: vec![JsonValue::PersonName(PersonName {
                alphabetic: Some(value.into()),
                ..Default::default()
            })],
            ..Self::empty("PN")
        }
    }

    pub fn sequence(items: Vec<JsonDataset>) -> Self {
        Self {
            value: items.into_iter().map(JsonValue::Item).collect(),
            ..Self::empty("SQ")
        }
    }

    pub fn bulk_data_uri<V: Into<String>, S: Into<String>>(vr: V, uri: S) -> Self {
        Self {
            bulk_data_uri: Some(uri.into()),
            ..Self::empty(vr)
        }
    }

    /// The first `Value` entry rendered as a string, if any. Person names
    /// yield their alphabetic group.
    pub fn first_string(&self) -> Option<String> {
        match self.value.first()? {
            JsonValue::Str(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::PersonName(pn) => pn.alphabetic.clone(),
            JsonValue::Item(_) => None,
        }
    }

    /// The first `Value` entry as an integer, if it is numeric.
    pub fn first_integer(&self) -> Option<i64> {
        match self.value.first()? {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn items(&self) -> impl Iterator<Item = &JsonDataset> {
        self.value.iter().filter_map(|v| match v {
            JsonValue::Item(item) => Some(item),
            _ => None,
        })
    }
}

/// The 8-hex-digit JSON key of a tag.
pub fn tag_key(tag: dicom::core::Tag) -> String {
    format!("{:04X}{:04X}", tag.group(), tag.element())
}

/// Look up the first string value of `tag` in a dataset.
pub fn string_of<'a>(dataset: &'a JsonDataset, tag: &str) -> Option<String> {
    dataset.get(tag).and_then(|a| a.first_string())
}

const TAG_PIXEL_DATA: &str = "7FE00010";

/// Extract the attribute dictionary of a parsed DICOM object.
///
/// Pixel data is deliberately left out: metadata responses reference it
/// through a `BulkDataURI` pointing back at the instance resource.
pub fn dataset_from_object(obj: &InMemDicomObject<StandardDataDictionary>) -> JsonDataset {
    let mut dataset = JsonDataset::new();
    for elem in obj {
        let key = tag_key(elem.tag());
        if key == TAG_PIXEL_DATA {
            continue;
        }
        dataset.insert(key, attribute_from_element(elem));
    }
    dataset
}

fn attribute_from_element(elem: &InMemElement<StandardDataDictionary>) -> JsonAttribute {
    let vr: String = elem.vr().to_string().to_owned();
    match elem.value() {
        Value::Sequence(seq) => {
            JsonAttribute::sequence(seq.items().iter().map(dataset_from_object).collect())
        }
        Value::PixelSequence(_) => JsonAttribute::empty(vr),
        Value::Primitive(primitive) => {
            if matches!(primitive, dicom::core::value::PrimitiveValue::Empty) {
                return JsonAttribute::empty(vr);
            }
            let value = match elem.vr() {
                VR::PN => primitive
                    .to_multi_str()
                    .iter()
                    .map(|s| {
                        JsonValue::PersonName(PersonName {
                            alphabetic: Some(s.to_string()),
                            ..Default::default()
                        })
                    })
                    .collect(),
                VR::IS | VR::SL | VR::SS | VR::UL | VR::US | VR::SV | VR::UV => {
                    match primitive.to_multi_int::<i64>() {
                        Ok(ints) => ints
                            .into_iter()
                            .map(|i| JsonValue::Number(serde_json::Number::from(i)))
                            .collect(),
                        Err(_) => strings_of(primitive),
                    }
                }
                VR::DS | VR::FL | VR::FD => match primitive.to_multi_float64() {
                    Ok(floats) => floats
                        .into_iter()
                        .filter_map(serde_json::Number::from_f64)
                        .map(JsonValue::Number)
                        .collect(),
                    Err(_) => strings_of(primitive),
                },
                VR::OB | VR::OW | VR::OD | VR::OF | VR::OL | VR::OV | VR::UN => {
                    return JsonAttribute {
                        inline_binary: Some(BASE64.encode(primitive.to_bytes())),
                        ..JsonAttribute::empty(vr)
                    };
                }
                _ => strings_of(primitive),
            };
            JsonAttribute {
                value,
                ..JsonAttribute::empty(vr)
            }
        }
    }
}

fn strings_of(primitive: &dicom::core::value::PrimitiveValue) -> Vec<JsonValue> {
    primitive
        .to_multi_str()
        .iter()
        .map(|s| JsonValue::Str(s.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_attribute_serialization_shape() {
        let mut dataset = JsonDataset::new();
        dataset.insert("00100010".to_string(), JsonAttribute::person_name("Doe^John"));
        dataset.insert("0020000D".to_string(), JsonAttribute::uid("1.2.3"));
        dataset.insert("00201208".to_string(), JsonAttribute::integer("IS", 42));
        let json = serde_json::to_value(&dataset).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "00100010": {"vr": "PN", "Value": [{"Alphabetic": "Doe^John"}]},
                "0020000D": {"vr": "UI", "Value": ["1.2.3"]},
                "00201208": {"vr": "IS", "Value": [42]},
            })
        );
    }

    #[test]
    fn test_empty_value_omitted() {
        let json = serde_json::to_value(JsonAttribute::empty("SQ")).unwrap();
        assert_eq!(json, serde_json::json!({"vr": "SQ"}));
    }

    #[test]
    fn test_sequence_items_do_not_parse_as_person_names() {
        let raw = serde_json::json!({
            "vr": "SQ",
            "Value": [{"00081150": {"vr": "UI", "Value": ["1.2.840.10008.5.1.4.1.1.2"]}}]
        });
        let attribute: JsonAttribute = serde_json::from_value(raw).unwrap();
        let item = attribute.items().next().expect("one sequence item");
        assert_eq!(
            string_of(item, "00081150").as_deref(),
            Some("1.2.840.10008.5.1.4.1.1.2")
        );
    }

    #[test]
    fn test_roundtrip_through_json_text() {
        let mut dataset = JsonDataset::new();
        dataset.insert(
            "00081199".to_string(),
            JsonAttribute::sequence(vec![JsonDataset::from([(
                "00081155".to_string(),
                JsonAttribute::uid("1.2.3.4.5"),
            )])]),
        );
        dataset.insert("00100010".to_string(), JsonAttribute::person_name("A^B"));
        let text = serde_json::to_string(&dataset).unwrap();
        let back: JsonDataset = serde_json::from_str(&text).unwrap();
        assert_eq!(back, dataset);
    }

    #[test]
    fn test_bulk_data_uri_sits_next_to_vr() {
        let attribute = JsonAttribute::bulk_data_uri("OW", "http://x/instances/1.2");
        let json = serde_json::to_value(&attribute).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"vr": "OW", "BulkDataURI": "http://x/instances/1.2"})
        );
    }
}
