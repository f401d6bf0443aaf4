//! Shared helpers: a server on an ephemeral port and in-process DICOM
//! payload construction.
#![allow(dead_code)]

use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicomweb_server::{
    DicomWebEnvOptions, DicomWebServer, InMemoryStorage, InMemoryUpsStorage,
    RecordingEventDelivery, SubscriptionManager,
};
use std::sync::Arc;

pub struct TestServer {
    pub server: DicomWebServer,
    pub base: String,
    pub delivery: Arc<RecordingEventDelivery>,
    pub client: reqwest::Client,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

pub async fn start_server<F: FnOnce(&mut DicomWebEnvOptions)>(configure: F) -> TestServer {
    let mut settings = DicomWebEnvOptions {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    };
    configure(&mut settings);
    let path_prefix = settings.path_prefix.clone();
    let subscriptions = Arc::new(SubscriptionManager::new());
    let ups_storage = Arc::new(InMemoryUpsStorage::new(Arc::clone(&subscriptions)));
    let delivery = Arc::new(RecordingEventDelivery::new());
    let server = DicomWebServer::new(
        settings,
        Arc::new(InMemoryStorage::new()),
        Some(ups_storage),
        subscriptions,
        Arc::clone(&delivery) as Arc<dyn dicomweb_server::EventDeliveryService>,
    );
    let addr = server.start().await.expect("server should bind");
    TestServer {
        server,
        base: format!("http://{addr}{path_prefix}"),
        delivery,
        client: reqwest::Client::new(),
    }
}

pub async fn start_default() -> TestServer {
    start_server(|_| {}).await
}

pub const SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";

/// Build a complete Part-10 file for the given identity.
pub fn dicom_bytes(study_uid: &str, series_uid: &str, sop_uid: &str) -> Vec<u8> {
    dicom_bytes_with(study_uid, series_uid, sop_uid, |_| {})
}

pub fn dicom_bytes_with<F: FnOnce(&mut InMemDicomObject)>(
    study_uid: &str,
    series_uid: &str,
    sop_uid: &str,
    extend: F,
) -> Vec<u8> {
    let mut obj = InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, dicom_value!(Str, SECONDARY_CAPTURE)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, sop_uid)),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, study_uid)),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, dicom_value!(Str, series_uid)),
        DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Doe^John")),
        DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "PAT001")),
        DataElement::new(tags::MODALITY, VR::CS, dicom_value!(Str, "OT")),
        DataElement::new(tags::STUDY_DATE, VR::DA, dicom_value!(Str, "20240115")),
    ]);
    extend(&mut obj);
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(SECONDARY_CAPTURE)
        .media_storage_sop_instance_uid(sop_uid)
        .transfer_syntax("1.2.840.10008.1.2.1")
        .build()
        .expect("file meta should build");
    let file_obj = obj.with_exact_meta(meta);
    let mut out = Vec::new();
    file_obj.write_all(&mut out).expect("serialization should succeed");
    out
}

/// Wrap payloads into a `multipart/related` STOW body.
pub fn multipart_body(parts: &[Vec<u8>], boundary: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Type: application/dicom\r\n\r\n");
        body.extend_from_slice(part);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}
