mod cache;
mod delivery;
mod dicom_json;
mod error;
mod event;
mod memory_storage;
mod multipart;
mod negotiation;
mod part10;
mod qido;
mod rate_limit;
mod router;
mod run_from_env;
mod server;
mod settings;
mod storage;
mod stow;
mod subscription;
mod types;
mod ups;
mod ups_storage;
mod wado;
mod workitem;

pub use cache::{CacheLookup, CacheStats, ResponseCache};
pub use delivery::{DeliveryError, EventDeliveryService, LoggingEventDelivery, RecordingEventDelivery};
pub use dicom_json::{JsonAttribute, JsonDataset, JsonValue, PersonName, string_of, tag_key};
pub use error::DicomWebError;
pub use event::{EventDispatcher, EventEnvelope, EventQueue, UpsEvent, UpsEventType};
pub use memory_storage::InMemoryStorage;
pub use multipart::{MultipartError, MultipartPart, boundary_param, build_related, parse_related};
pub use negotiation::{
    ByteRange, CharsetPreference, MediaRange, negotiate_charset, negotiate_media_type,
    parse_accept, parse_accept_charset, parse_range,
};
pub use rate_limit::RateLimiter;
pub use router::{HandlerType, RouteMatch, Router};
pub use run_from_env::run_server_from_env;
pub use server::{AppState, DicomWebServer, HandlerResponse, RequestContext};
pub use settings::{
    CacheSettings, CorsSettings, DicomWebEnvOptions, DuplicatePolicy, LimitBy,
    RateLimitSettings, StowSettings, TlsSettings,
};
pub use storage::{
    DateRange, StorageCounts, StorageError, StorageProvider, StorageQuery, StoredInstance,
};
pub use subscription::{Subscription, SubscriptionManager};
pub use types::{AeTitle, InstanceKey, is_valid_uid, new_uid};
pub use ups::GLOBAL_SUBSCRIPTION_UID;
pub use ups_storage::{InMemoryUpsStorage, UpsStorageError, UpsStorageProvider, WorkitemFilter};
pub use workitem::{
    CodedEntry, HumanPerformer, ProcedureStepState, ProgressInformation, ReferencedSop,
    UpsPriority, Workitem, WorkitemValidationError,
};
