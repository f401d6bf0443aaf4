//! Server settings, which are configurable using environment variables.
use camino::Utf8PathBuf;
use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct DicomWebEnvOptions {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_max_request_body_size")]
    pub max_request_body_size: usize,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    #[serde(default = "default_event_queue_size")]
    pub event_queue_size: usize,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
    #[serde(default)]
    pub cors: Option<CorsSettings>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,
    #[serde(default)]
    pub stow: StowSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

impl Default for DicomWebEnvOptions {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path_prefix: default_path_prefix(),
            server_name: default_server_name(),
            max_request_body_size: default_max_request_body_size(),
            max_concurrent_requests: default_max_concurrent_requests(),
            request_timeout: default_request_timeout(),
            event_queue_size: default_event_queue_size(),
            tls: None,
            cors: None,
            rate_limit: None,
            stow: StowSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

impl DicomWebEnvOptions {
    /// Load settings from `DICOMWEB_*` environment variables.
    ///
    /// Nested keys split on underscores (`DICOMWEB_CACHE_ENABLED` →
    /// `cache.enabled`); the second pass keeps flat keys whose names
    /// themselves contain underscores (`DICOMWEB_PATH_PREFIX`) working.
    pub fn from_env() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Env::prefixed("DICOMWEB_").split("_"))
            .merge(Env::prefixed("DICOMWEB_"))
            .extract()
    }

    /// `scheme://host:port<pathPrefix>`, with the wildcard bind address
    /// substituted by `localhost` and scheme `https` iff TLS is configured.
    pub fn base_url(&self) -> String {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let host = if self.host == "0.0.0.0" {
            "localhost"
        } else {
            &self.host
        };
        format!("{}://{}:{}{}", scheme, host, self.port, self.path_prefix)
    }
}

/// Presence of TLS material forces the `https` scheme in the base URL.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    pub certificate_path: Utf8PathBuf,
    pub private_key_path: Utf8PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_cors_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default = "default_cors_headers")]
    pub allowed_headers: Vec<String>,
    #[serde(default = "default_cors_exposed")]
    pub exposed_headers: Vec<String>,
}

impl CorsSettings {
    /// Grants origin `*` with the standard methods and `X-Total-Count` exposed.
    pub fn allow_all() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: default_cors_methods(),
            allowed_headers: default_cors_headers(),
            exposed_headers: default_cors_exposed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitBy {
    ClientIp,
    ApiKey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    pub max_requests: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    #[serde(default = "default_limit_by")]
    pub limit_by: LimitBy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    Reject,
    Replace,
    Accept,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StowSettings {
    #[serde(default = "default_duplicate_policy")]
    pub duplicate_policy: DuplicatePolicy,
    #[serde(default = "default_true")]
    pub validate_required_attributes: bool,
    #[serde(default)]
    pub validate_sop_classes: bool,
    #[serde(default)]
    pub allowed_sop_classes: Vec<String>,
    #[serde(default = "default_true")]
    pub validate_uid_format: bool,
    #[serde(default)]
    pub additional_required_tags: Vec<String>,
}

impl Default for StowSettings {
    /// Replace duplicates, validate required attributes and UID format,
    /// no SOP class restriction.
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::Replace,
            validate_required_attributes: true,
            validate_sop_classes: false,
            allowed_sop_classes: Vec::new(),
            validate_uid_format: true,
            additional_required_tags: Vec::new(),
        }
    }
}

impl StowSettings {
    /// Reject duplicates and run every validation.
    pub fn strict() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::Reject,
            validate_required_attributes: true,
            validate_sop_classes: true,
            allowed_sop_classes: Vec::new(),
            validate_uid_format: true,
            additional_required_tags: Vec::new(),
        }
    }

    /// Accept duplicates silently and skip all validation.
    pub fn permissive() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::Accept,
            validate_required_attributes: false,
            validate_sop_classes: false,
            allowed_sop_classes: Vec::new(),
            validate_uid_format: false,
            additional_required_tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(with = "humantime_serde", default = "default_cache_ttl")]
    pub default_ttl: Duration,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: default_cache_ttl(),
            max_entries: default_cache_max_entries(),
            max_bytes: default_cache_max_bytes(),
        }
    }
}

impl CacheSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8042
}

fn default_path_prefix() -> String {
    "/dicom-web".to_string()
}

fn default_server_name() -> String {
    "DICOMKit/1.0".to_string()
}

fn default_max_request_body_size() -> usize {
    500 * 1024 * 1024
}

fn default_max_concurrent_requests() -> usize {
    100
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_event_queue_size() -> usize {
    1024
}

fn default_cors_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
        .map(String::from)
        .to_vec()
}

fn default_cors_headers() -> Vec<String> {
    [
        "Content-Type",
        "Accept",
        "Accept-Charset",
        "Authorization",
        "X-Api-Key",
        "If-None-Match",
        "Range",
    ]
    .map(String::from)
    .to_vec()
}

fn default_cors_exposed() -> Vec<String> {
    [
        "X-Total-Count",
        "ETag",
        "X-Cache",
        "Location",
        "Content-Range",
        "Warning",
    ]
    .map(String::from)
    .to_vec()
}

fn default_limit_by() -> LimitBy {
    LimitBy::ClientIp
}

fn default_duplicate_policy() -> DuplicatePolicy {
    DuplicatePolicy::Replace
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_cache_max_entries() -> usize {
    1024
}

fn default_cache_max_bytes() -> usize {
    256 * 1024 * 1024
}
