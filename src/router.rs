//! Maps `(method, path)` onto a handler type plus captured parameters.
//!
//! Routes are a fixed table matched first-declared-wins after stripping the
//! configured path prefix. Dynamic `{name}` segments capture the (percent
//! decoded) path segment under that name.

use axum::http::Method;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerType {
    SearchStudies,
    RetrieveStudy,
    RetrieveStudyMetadata,
    SearchSeriesInStudy,
    RetrieveSeries,
    RetrieveSeriesMetadata,
    SearchInstancesInSeries,
    RetrieveInstance,
    RetrieveInstanceMetadata,
    RetrieveFrames,
    DeleteStudy,
    DeleteSeries,
    DeleteInstance,
    StoreInstances,
    StoreInstancesToStudy,
    SearchWorkitems,
    CreateWorkitem,
    RetrieveWorkitem,
    CreateWorkitemWithUid,
    UpdateWorkitem,
    ChangeWorkitemState,
    RequestWorkitemCancellation,
    SubscribeWorkitem,
    UnsubscribeWorkitem,
    SuspendSubscription,
}

static ROUTES: [(Method, &str, HandlerType); 25] = [
    (Method::GET, "/studies", HandlerType::SearchStudies),
    (Method::GET, "/studies/{studyUID}", HandlerType::RetrieveStudy),
    (
        Method::GET,
        "/studies/{studyUID}/metadata",
        HandlerType::RetrieveStudyMetadata,
    ),
    (
        Method::GET,
        "/studies/{studyUID}/series",
        HandlerType::SearchSeriesInStudy,
    ),
    (
        Method::GET,
        "/studies/{studyUID}/series/{seriesUID}",
        HandlerType::RetrieveSeries,
    ),
    (
        Method::GET,
        "/studies/{studyUID}/series/{seriesUID}/metadata",
        HandlerType::RetrieveSeriesMetadata,
    ),
    (
        Method::GET,
        "/studies/{studyUID}/series/{seriesUID}/instances",
        HandlerType::SearchInstancesInSeries,
    ),
    (
        Method::GET,
        "/studies/{studyUID}/series/{seriesUID}/instances/{instanceUID}",
        HandlerType::RetrieveInstance,
    ),
    (
        Method::GET,
        "/studies/{studyUID}/series/{seriesUID}/instances/{instanceUID}/metadata",
        HandlerType::RetrieveInstanceMetadata,
    ),
    (
        Method::GET,
        "/studies/{studyUID}/series/{seriesUID}/instances/{instanceUID}/frames/{frames}",
        HandlerType::RetrieveFrames,
    ),
    (Method::DELETE, "/studies/{studyUID}", HandlerType::DeleteStudy),
    (
        Method::DELETE,
        "/studies/{studyUID}/series/{seriesUID}",
        HandlerType::DeleteSeries,
    ),
    (
        Method::DELETE,
        "/studies/{studyUID}/series/{seriesUID}/instances/{instanceUID}",
        HandlerType::DeleteInstance,
    ),
    (Method::POST, "/studies", HandlerType::StoreInstances),
    (
        Method::POST,
        "/studies/{studyUID}",
        HandlerType::StoreInstancesToStudy,
    ),
    (Method::GET, "/workitems", HandlerType::SearchWorkitems),
    (Method::POST, "/workitems", HandlerType::CreateWorkitem),
    (
        Method::GET,
        "/workitems/{workitemUID}",
        HandlerType::RetrieveWorkitem,
    ),
    (
        Method::POST,
        "/workitems/{workitemUID}",
        HandlerType::CreateWorkitemWithUid,
    ),
    (
        Method::PUT,
        "/workitems/{workitemUID}",
        HandlerType::UpdateWorkitem,
    ),
    (
        Method::PUT,
        "/workitems/{workitemUID}/state",
        HandlerType::ChangeWorkitemState,
    ),
    (
        Method::PUT,
        "/workitems/{workitemUID}/cancelrequest",
        HandlerType::RequestWorkitemCancellation,
    ),
    (
        Method::POST,
        "/workitems/{workitemUID}/subscribers/{aeTitle}",
        HandlerType::SubscribeWorkitem,
    ),
    (
        Method::DELETE,
        "/workitems/{workitemUID}/subscribers/{aeTitle}",
        HandlerType::UnsubscribeWorkitem,
    ),
    (
        Method::POST,
        "/workitems/{workitemUID}/subscribers/{aeTitle}/suspend",
        HandlerType::SuspendSubscription,
    ),
];

#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub handler: HandlerType,
    pub params: HashMap<&'static str, String>,
}

impl RouteMatch {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    prefix: String,
}

impl Router {
    pub fn new<S: Into<String>>(prefix: S) -> Self {
        let mut prefix = prefix.into();
        while prefix.ends_with('/') {
            prefix.pop();
        }
        Self { prefix }
    }

    /// Resolve a request path. `None` means the server answers 404.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let path = self.strip_prefix(path)?;
        let segments: Vec<&str> = path
            .trim_start_matches('/')
            .trim_end_matches('/')
            .split('/')
            .collect();
        ROUTES
            .iter()
            .find_map(|(m, pattern, handler)| {
                (m == method)
                    .then(|| match_pattern(pattern, &segments))
                    .flatten()
                    .map(|params| RouteMatch {
                        handler: *handler,
                        params,
                    })
            })
    }

    fn strip_prefix<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            return Some(path);
        }
        let rest = path.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() {
            Some("/")
        } else {
            rest.starts_with('/').then_some(rest)
        }
    }
}

fn match_pattern(
    pattern: &'static str,
    segments: &[&str],
) -> Option<HashMap<&'static str, String>> {
    let pattern_segments: Vec<&'static str> =
        pattern.trim_start_matches('/').split('/').collect();
    if pattern_segments.len() != segments.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (expected, actual) in pattern_segments.iter().zip(segments) {
        if actual.is_empty() {
            return None;
        }
        if let Some(name) = expected
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
        {
            let decoded = percent_decode_str(actual).decode_utf8().ok()?;
            params.insert(name, decoded.into_owned());
        } else if expected != actual {
            return None;
        }
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[fixture]
    fn router() -> Router {
        Router::new("/dicom-web")
    }

    #[rstest]
    #[case(Method::GET, "/studies", HandlerType::SearchStudies)]
    #[case(Method::GET, "/studies/1.2.3", HandlerType::RetrieveStudy)]
    #[case(Method::GET, "/studies/1.2.3/metadata", HandlerType::RetrieveStudyMetadata)]
    #[case(Method::GET, "/studies/1.2.3/series", HandlerType::SearchSeriesInStudy)]
    #[case(Method::GET, "/studies/1.2.3/series/4.5", HandlerType::RetrieveSeries)]
    #[case(Method::GET, "/studies/1.2.3/series/4.5/metadata", HandlerType::RetrieveSeriesMetadata)]
    #[case(Method::GET, "/studies/1.2.3/series/4.5/instances", HandlerType::SearchInstancesInSeries)]
    #[case(Method::GET, "/studies/1.2.3/series/4.5/instances/6.7", HandlerType::RetrieveInstance)]
    #[case(Method::GET, "/studies/1.2.3/series/4.5/instances/6.7/metadata", HandlerType::RetrieveInstanceMetadata)]
    #[case(Method::GET, "/studies/1.2.3/series/4.5/instances/6.7/frames/1,2", HandlerType::RetrieveFrames)]
    #[case(Method::DELETE, "/studies/1.2.3", HandlerType::DeleteStudy)]
    #[case(Method::DELETE, "/studies/1.2.3/series/4.5", HandlerType::DeleteSeries)]
    #[case(Method::DELETE, "/studies/1.2.3/series/4.5/instances/6.7", HandlerType::DeleteInstance)]
    #[case(Method::POST, "/studies", HandlerType::StoreInstances)]
    #[case(Method::POST, "/studies/1.2.3", HandlerType::StoreInstancesToStudy)]
    #[case(Method::GET, "/workitems", HandlerType::SearchWorkitems)]
    #[case(Method::POST, "/workitems", HandlerType::CreateWorkitem)]
    #[case(Method::GET, "/workitems/9.8.7", HandlerType::RetrieveWorkitem)]
    #[case(Method::POST, "/workitems/9.8.7", HandlerType::CreateWorkitemWithUid)]
    #[case(Method::PUT, "/workitems/9.8.7", HandlerType::UpdateWorkitem)]
    #[case(Method::PUT, "/workitems/9.8.7/state", HandlerType::ChangeWorkitemState)]
    #[case(Method::PUT, "/workitems/9.8.7/cancelrequest", HandlerType::RequestWorkitemCancellation)]
    #[case(Method::POST, "/workitems/9.8.7/subscribers/SCU1", HandlerType::SubscribeWorkitem)]
    #[case(Method::DELETE, "/workitems/9.8.7/subscribers/SCU1", HandlerType::UnsubscribeWorkitem)]
    #[case(Method::POST, "/workitems/9.8.7/subscribers/SCU1/suspend", HandlerType::SuspendSubscription)]
    fn test_every_route_resolves(
        router: Router,
        #[case] method: Method,
        #[case] path: &str,
        #[case] expected: HandlerType,
    ) {
        let full = format!("/dicom-web{path}");
        let matched = router.resolve(&method, &full).expect("route should match");
        assert_eq!(matched.handler, expected);
    }

    #[rstest]
    fn test_captures_are_literal(router: Router) {
        let matched = router
            .resolve(
                &Method::GET,
                "/dicom-web/studies/1.2.3/series/4.5/instances/6.7",
            )
            .unwrap();
        assert_eq!(matched.param("studyUID"), Some("1.2.3"));
        assert_eq!(matched.param("seriesUID"), Some("4.5"));
        assert_eq!(matched.param("instanceUID"), Some("6.7"));
    }

    #[rstest]
    fn test_percent_decoded_captures(router: Router) {
        let matched = router
            .resolve(&Method::POST, "/dicom-web/workitems/1.2.3/subscribers/MY%20AET")
            .unwrap();
        assert_eq!(matched.param("aeTitle"), Some("MY AET"));
    }

    #[rstest]
    fn test_trailing_slash_matches(router: Router) {
        let matched = router.resolve(&Method::GET, "/dicom-web/studies/").unwrap();
        assert_eq!(matched.handler, HandlerType::SearchStudies);
    }

    #[rstest]
    #[case(Method::GET, "/dicom-web/nope")]
    #[case(Method::GET, "/other-prefix/studies")]
    #[case(Method::GET, "/dicom-webx/studies")]
    #[case(Method::PUT, "/dicom-web/studies")]
    #[case(Method::GET, "/dicom-web/studies/1.2.3/series/4.5/instances/6.7/extra")]
    fn test_no_match(router: Router, #[case] method: Method, #[case] path: &str) {
        assert!(router.resolve(&method, path).is_none());
    }
}
