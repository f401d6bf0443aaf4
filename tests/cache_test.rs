//! Conditional-request behavior of the response cache, end to end.

mod util;

use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use util::{dicom_bytes, start_default, start_server};

#[tokio::test(flavor = "multi_thread")]
async fn test_cache_miss_then_hit_then_not_modified() {
    let ts = start_default().await;
    let url = ts.url("/studies");

    // first request populates the cache
    let first = ts.client.get(&url).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header(&first, "x-cache"), Some("MISS".to_string()));
    let etag = header(&first, "etag").expect("cacheable response carries an ETag");
    assert!(etag.starts_with("W/\""));
    assert!(header(&first, "cache-control").unwrap().contains("max-age"));
    assert_eq!(first.text().await.unwrap(), "[]");

    // second request is served from the cache
    let second = ts.client.get(&url).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(header(&second, "x-cache"), Some("HIT".to_string()));
    assert_eq!(header(&second, "etag"), Some(etag.clone()));
    assert_eq!(second.text().await.unwrap(), "[]");

    // a conditional request with the ETag collapses to 304
    let third = ts
        .client
        .get(&url)
        .header("If-None-Match", &etag)
        .send()
        .await
        .unwrap();
    assert_eq!(third.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(header(&third, "etag"), Some(etag));
    assert_eq!(third.text().await.unwrap(), "");

    // If-None-Match: * matches whenever an entry exists
    let wildcard = ts
        .client
        .get(&url)
        .header("If-None-Match", "*")
        .send()
        .await
        .unwrap();
    assert_eq!(wildcard.status(), StatusCode::NOT_MODIFIED);

    ts.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_store_invalidates_search_cache() {
    let ts = start_default().await;
    let url = ts.url("/studies");

    let before = ts.client.get(&url).send().await.unwrap();
    assert_eq!(before.text().await.unwrap(), "[]");

    let response = ts
        .client
        .post(&url)
        .header("Content-Type", "application/dicom")
        .body(dicom_bytes("1.2.3", "1.2.3.4", "1.2.3.4.5"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // the mutation threw the stale listing out
    let after = ts.client.get(&url).send().await.unwrap();
    assert_eq!(header(&after, "x-cache"), Some("MISS".to_string()));
    let listing: serde_json::Value = after.json().await.unwrap();
    assert_eq!(listing.as_array().unwrap().len(), 1);

    ts.server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disabled_cache_adds_no_headers() {
    let ts = start_server(|settings| {
        settings.cache = dicomweb_server::CacheSettings::disabled();
    })
    .await;
    let url = ts.url("/studies");
    let response = ts.client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-cache"), None);
    assert_eq!(header(&response, "etag"), None);
    ts.server.stop().await;
}

fn header(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
