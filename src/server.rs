//! The HTTP front: listener lifecycle, request dispatch through the cache
//! middleware and the router, and error-to-response mapping.

use crate::cache::{CacheLookup, ResponseCache};
use crate::delivery::EventDeliveryService;
use crate::error::DicomWebError;
use crate::event::{EventDispatcher, EventQueue};
use crate::memory_storage::InMemoryStorage;
use crate::negotiation::negotiate_charset;
use crate::rate_limit::RateLimiter;
use crate::router::{HandlerType, Router};
use crate::settings::{CorsSettings, DicomWebEnvOptions, LimitBy};
use crate::storage::StorageProvider;
use crate::subscription::SubscriptionManager;
use crate::ups_storage::{InMemoryUpsStorage, UpsStorageProvider};
use crate::{qido, stow, ups, wado};
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Everything a handler can reach: configuration, collaborators, and the
/// middleware state. Constructor-scoped, never process-global.
pub struct AppState {
    pub settings: DicomWebEnvOptions,
    pub base_url: String,
    pub storage: Arc<dyn StorageProvider>,
    pub ups_storage: Option<Arc<dyn UpsStorageProvider>>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub dispatcher: Arc<EventDispatcher>,
    pub delivery: Arc<dyn EventDeliveryService>,
    pub cache: ResponseCache,
    pub router: Router,
    pub rate_limiter: Option<RateLimiter>,
}

/// The parsed pieces of one request handed to a handler.
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query_pairs: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub params: HashMap<&'static str, String>,
    pub body: Bytes,
}

impl RequestContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn param(&self, name: &str) -> Result<&str, DicomWebError> {
        self.params
            .get(name)
            .map(|s| s.as_str())
            .ok_or_else(|| DicomWebError::Internal(format!("route parameter {name} not captured")))
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query_pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// What handlers produce; the server front turns it into the wire response.
#[derive(Debug)]
pub struct HandlerResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HandlerResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Self, DicomWebError> {
        let body = serde_json::to_vec(value)
            .map_err(|e| DicomWebError::Internal(format!("response serialization failed: {e}")))?;
        Ok(Self::new(status)
            .with_body(Bytes::from(body), "application/dicom+json"))
    }

    pub fn with_body<C: Into<String>>(mut self, body: Bytes, content_type: C) -> Self {
        self.headers
            .push(("Content-Type".to_string(), content_type.into()));
        self.body = body;
        self
    }

    pub fn with_header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// The DICOMweb server: binds the listener, runs the dispatcher, owns the
/// lifecycle of both.
pub struct DicomWebServer {
    state: Arc<AppState>,
    shutdown: watch::Sender<bool>,
    listener_task: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl DicomWebServer {
    pub fn new(
        settings: DicomWebEnvOptions,
        storage: Arc<dyn StorageProvider>,
        ups_storage: Option<Arc<dyn UpsStorageProvider>>,
        subscriptions: Arc<SubscriptionManager>,
        delivery: Arc<dyn EventDeliveryService>,
    ) -> Self {
        let queue = Arc::new(EventQueue::new(settings.event_queue_size));
        let dispatcher = Arc::new(EventDispatcher::new(
            queue,
            Arc::clone(&subscriptions),
            Arc::clone(&delivery),
        ));
        if let Some(ups_storage) = &ups_storage {
            ups_storage.set_event_dispatcher(Arc::clone(&dispatcher));
        }
        let (shutdown, _) = watch::channel(false);
        let state = AppState {
            base_url: settings.base_url(),
            cache: ResponseCache::new(settings.cache.clone()),
            router: Router::new(settings.path_prefix.clone()),
            rate_limiter: settings
                .rate_limit
                .clone()
                .map(RateLimiter::new),
            storage,
            ups_storage,
            subscriptions,
            dispatcher,
            delivery,
            settings,
        };
        Self {
            state: Arc::new(state),
            shutdown,
            listener_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// In-memory storage backends and log-only event delivery.
    pub fn in_memory(settings: DicomWebEnvOptions) -> Self {
        let subscriptions = Arc::new(SubscriptionManager::new());
        let ups_storage = Arc::new(InMemoryUpsStorage::new(Arc::clone(&subscriptions)));
        Self::new(
            settings,
            Arc::new(InMemoryStorage::new()),
            Some(ups_storage),
            subscriptions,
            Arc::new(crate::delivery::LoggingEventDelivery),
        )
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Bind the listener and start serving. Returns the bound address
    /// (useful when the configured port is 0).
    pub async fn start(&self) -> std::io::Result<SocketAddr> {
        let settings = &self.state.settings;
        let ip: IpAddr = settings
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let listener = tokio::net::TcpListener::bind(SocketAddr::new(ip, settings.port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap() = Some(addr);
        if settings.tls.is_some() {
            tracing::warn!(
                "TLS material configured; expecting TLS termination in front of this listener"
            );
        }

        self.state.delivery.start().await;
        self.state.dispatcher.start();

        let app = build_app(Arc::clone(&self.state));
        let _ = self.shutdown.send(false);
        let mut shutdown_rx = self.shutdown.subscribe();
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        });
        let task = tokio::spawn(async move { serve.await });
        *self.listener_task.lock().unwrap() = Some(task);
        tracing::info!(address = addr.to_string(), "listening for DICOMweb requests");
        Ok(addr)
    }

    /// Cooperative shutdown: close the listener, stop the dispatcher, clear
    /// the event queue. In-flight responses are allowed to complete.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.listener_task.lock().unwrap().take();
        if let Some(task) = task {
            match task.await {
                Ok(Err(e)) => tracing::error!("listener ended with error: {e}"),
                Err(e) => tracing::warn!("listener task ended abnormally: {e}"),
                Ok(Ok(())) => {}
            }
        }
        self.state.dispatcher.stop().await;
        self.state.delivery.stop().await;
        *self.local_addr.lock().unwrap() = None;
        tracing::info!("server stopped");
    }

    pub fn running(&self) -> bool {
        self.listener_task
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }
}

fn build_app(state: Arc<AppState>) -> axum::Router {
    let mut app = axum::Router::new()
        .fallback(dispatch)
        .with_state(Arc::clone(&state))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(state.settings.request_timeout))
        .layer(GlobalConcurrencyLimitLayer::new(
            state.settings.max_concurrent_requests,
        ));
    if let Some(cors) = cors_layer(&state.settings.cors) {
        app = app.layer(cors);
    }
    app
}

fn cors_layer(settings: &Option<CorsSettings>) -> Option<tower_http::cors::CorsLayer> {
    use tower_http::cors::{Any, CorsLayer};
    let settings = settings.as_ref()?;
    let mut layer = CorsLayer::new();
    layer = if settings.allowed_origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(
            settings
                .allowed_origins
                .iter()
                .filter_map(|o| o.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        )
    };
    layer = layer.allow_methods(
        settings
            .allowed_methods
            .iter()
            .filter_map(|m| m.parse::<Method>().ok())
            .collect::<Vec<_>>(),
    );
    layer = if settings.allowed_headers.iter().any(|h| h == "*") {
        layer.allow_headers(Any)
    } else {
        layer.allow_headers(
            settings
                .allowed_headers
                .iter()
                .filter_map(|h| h.parse::<HeaderName>().ok())
                .collect::<Vec<_>>(),
        )
    };
    layer = layer.expose_headers(
        settings
            .exposed_headers
            .iter()
            .filter_map(|h| h.parse::<HeaderName>().ok())
            .collect::<Vec<_>>(),
    );
    Some(layer)
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let is_head = parts.method == Method::HEAD;
    let method = if is_head {
        Method::GET
    } else {
        parts.method.clone()
    };
    let path = parts.uri.path().to_string();
    let query_pairs: Vec<(String, String)> =
        url::form_urlencoded::parse(parts.uri.query().unwrap_or("").as_bytes())
            .into_owned()
            .collect();
    let headers = parts.headers;

    if let Some(limiter) = &state.rate_limiter {
        let key = rate_limit_key(&state, &headers, &peer);
        if let Err(retry_after) = limiter.check(&key) {
            return error_response(&state, &DicomWebError::TooManyRequests { retry_after });
        }
    }

    let accept = header_str(&headers, header::ACCEPT);
    let accept_charset = header_str(&headers, header::ACCEPT_CHARSET);
    if accept_charset.is_some() && negotiate_charset(accept_charset, &["utf-8"]).is_none() {
        return error_response(
            &state,
            &DicomWebError::NotAcceptable("no acceptable charset; responses are utf-8".to_string()),
        );
    }

    let Some(matched) = state.router.resolve(&method, &path) else {
        tracing::debug!(method = method.as_str(), path, "no route");
        return error_response(
            &state,
            &DicomWebError::NotFound(format!("no resource at {path}")),
        );
    };

    let fingerprint =
        ResponseCache::fingerprint(&method, &path, &query_pairs, accept, accept_charset);
    // partial-content responses bypass the cache: the fingerprint does not
    // discriminate on Range
    let cacheable = method == Method::GET && !headers.contains_key(header::RANGE);
    if cacheable {
        let if_none_match = header_str(&headers, header::IF_NONE_MATCH);
        match state.cache.lookup(&fingerprint, if_none_match) {
            CacheLookup::NotModified(etag) => {
                let response = HandlerResponse::new(StatusCode::NOT_MODIFIED)
                    .with_header("ETag", etag);
                return finalize(&state, response, is_head);
            }
            CacheLookup::Hit(cached) => {
                let mut response = HandlerResponse::new(
                    StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK),
                );
                response.headers = cached.headers;
                response.body = cached.body;
                response = response.with_header("X-Cache", "HIT");
                return finalize(&state, response, is_head);
            }
            CacheLookup::Miss => {}
        }
    }

    let body = match axum::body::to_bytes(body, state.settings.max_request_body_size).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                &state,
                &DicomWebError::PayloadTooLarge {
                    limit: state.settings.max_request_body_size,
                },
            );
        }
    };

    let ctx = RequestContext {
        method: method.clone(),
        path: path.clone(),
        query_pairs,
        headers,
        params: matched.params,
        body,
    };
    let result = handle(&state, matched.handler, &ctx).await;
    state.cache.invalidate_for(&method, &path);
    match result {
        Ok(mut response) => {
            if cacheable {
                if let Some(entry) = state.cache.store(
                    &fingerprint,
                    response.status.as_u16(),
                    &response.headers,
                    &response.body,
                ) {
                    response = response
                        .with_header("ETag", entry.etag)
                        .with_header(
                            "Cache-Control",
                            format!("public, max-age={}", state.cache.ttl().as_secs()),
                        )
                        .with_header("X-Cache", "MISS");
                }
            }
            finalize(&state, response, is_head)
        }
        Err(e) => error_response(&state, &e),
    }
}

async fn handle(
    state: &AppState,
    handler: HandlerType,
    ctx: &RequestContext,
) -> Result<HandlerResponse, DicomWebError> {
    use HandlerType::*;
    match handler {
        SearchStudies => qido::search_studies(state, ctx).await,
        SearchSeriesInStudy => qido::search_series(state, ctx).await,
        SearchInstancesInSeries => qido::search_instances(state, ctx).await,
        RetrieveStudy => wado::retrieve_study(state, ctx).await,
        RetrieveStudyMetadata => wado::retrieve_study_metadata(state, ctx).await,
        RetrieveSeries => wado::retrieve_series(state, ctx).await,
        RetrieveSeriesMetadata => wado::retrieve_series_metadata(state, ctx).await,
        RetrieveInstance => wado::retrieve_instance(state, ctx).await,
        RetrieveInstanceMetadata => wado::retrieve_instance_metadata(state, ctx).await,
        RetrieveFrames => wado::retrieve_frames(state, ctx).await,
        DeleteStudy => wado::delete_study(state, ctx).await,
        DeleteSeries => wado::delete_series(state, ctx).await,
        DeleteInstance => wado::delete_instance(state, ctx).await,
        StoreInstances => stow::store_instances(state, ctx, None).await,
        StoreInstancesToStudy => {
            let study_uid = ctx.param("studyUID")?.to_string();
            stow::store_instances(state, ctx, Some(study_uid)).await
        }
        SearchWorkitems => ups::search_workitems(state, ctx).await,
        CreateWorkitem => ups::create_workitem(state, ctx, None).await,
        CreateWorkitemWithUid => {
            let uid = ctx.param("workitemUID")?.to_string();
            ups::create_workitem(state, ctx, Some(uid)).await
        }
        RetrieveWorkitem => ups::retrieve_workitem(state, ctx).await,
        UpdateWorkitem => ups::update_workitem(state, ctx).await,
        ChangeWorkitemState => ups::change_workitem_state(state, ctx).await,
        RequestWorkitemCancellation => ups::request_cancellation(state, ctx).await,
        SubscribeWorkitem => ups::subscribe(state, ctx).await,
        UnsubscribeWorkitem => ups::unsubscribe(state, ctx).await,
        SuspendSubscription => ups::suspend_subscription(state, ctx).await,
    }
}

fn rate_limit_key(state: &AppState, headers: &HeaderMap, peer: &SocketAddr) -> String {
    match state.settings.rate_limit.as_ref().map(|r| r.limit_by) {
        Some(LimitBy::ApiKey) => headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("anonymous")
            .to_string(),
        _ => peer.ip().to_string(),
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Map a handler error onto its wire shape: fixed status plus a JSON body
/// `{"error", "message"}`. Internal details are logged, not leaked.
fn error_response(state: &AppState, error: &DicomWebError) -> Response {
    if let DicomWebError::Internal(detail) = error {
        tracing::error!(detail, "internal error while handling request");
    }
    let body = serde_json::json!({
        "error": error.kind(),
        "message": error.public_message(),
    });
    let mut response = HandlerResponse::new(error.status()).with_body(
        Bytes::from(body.to_string()),
        "application/json",
    );
    match error {
        DicomWebError::RangeNotSatisfiable { total, .. } => {
            response = response.with_header("Content-Range", format!("bytes */{total}"));
        }
        DicomWebError::TooManyRequests { retry_after } => {
            response = response.with_header("Retry-After", retry_after.to_string());
        }
        _ => {}
    }
    finalize(state, response, false)
}

fn finalize(state: &AppState, response: HandlerResponse, is_head: bool) -> Response {
    let mut builder = Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        if let Ok(server) = HeaderValue::from_str(&state.settings.server_name) {
            headers.insert(header::SERVER, server);
        }
        for (name, value) in &response.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                tracing::warn!(header = name, "dropping invalid response header name");
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                tracing::warn!(header = name.as_str(), "dropping invalid response header value");
                continue;
            };
            headers.append(name, value);
        }
    }
    let body = if is_head {
        Body::empty()
    } else {
        Body::from(response.body)
    };
    builder.body(body).unwrap_or_else(|e| {
        tracing::error!("failed to materialize response: {e}");
        Response::new(Body::empty())
    })
}
