//! Cache decision engine.
//!
//! For every rewritten request the engine picks one of five states:
//!
//! | stored | online | fresh and not invalidated | state                  |
//! |--------|--------|---------------------------|------------------------|
//! | no     | no     | -                         | `OFFLINE_MISS` (error) |
//! | no     | yes    | -                         | `MISS`                 |
//! | yes    | no     | -                         | `OFFLINE_HIT`          |
//! | yes    | yes    | yes                       | `FRESH_VALID`          |
//! | yes    | yes    | no                        | `STALE_OR_INVALIDATED` |
//!
//! With no invalidation set loaded every stored entry counts as invalidated.

pub mod freshness;

use axum::http::header;
use chrono::Utc;
use std::sync::Arc;
use telemetry::metrics::{EDGE_CACHE_DECISIONS, EDGE_CACHE_STORE_WRITE_FAILURES};
use tracing::{debug, warn};

use crate::bloom::InvalidationSetHandle;
use crate::connectivity::Connectivity;
use crate::error::EngineError;
use crate::fetch::{CacheMode, FetchRequest, Fetcher};
use crate::message::{RequestIdentity, StoredResponse};
use crate::rewrite::RewrittenRequest;
use crate::store::ResponseStore;

pub use freshness::is_fresh;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Miss,
    FreshValid,
    StaleOrInvalidated,
    OfflineHit,
    OfflineMiss,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Miss => "MISS",
            CacheOutcome::FreshValid => "FRESH_VALID",
            CacheOutcome::StaleOrInvalidated => "STALE_OR_INVALIDATED",
            CacheOutcome::OfflineHit => "OFFLINE_HIT",
            CacheOutcome::OfflineMiss => "OFFLINE_MISS",
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            CacheOutcome::Miss => "miss",
            CacheOutcome::FreshValid => "fresh_valid",
            CacheOutcome::StaleOrInvalidated => "stale_or_invalidated",
            CacheOutcome::OfflineHit => "offline_hit",
            CacheOutcome::OfflineMiss => "offline_miss",
        }
    }

    fn record(self) {
        EDGE_CACHE_DECISIONS
            .with_label_values(&[self.metric_label()])
            .inc();
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub outcome: CacheOutcome,
    pub response: StoredResponse,
}

pub struct CacheDecisionEngine {
    store: Arc<dyn ResponseStore>,
    fetcher: Arc<dyn Fetcher>,
    invalidation: InvalidationSetHandle,
    connectivity: Connectivity,
}

impl CacheDecisionEngine {
    pub fn new(
        store: Arc<dyn ResponseStore>,
        fetcher: Arc<dyn Fetcher>,
        invalidation: InvalidationSetHandle,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            store,
            fetcher,
            invalidation,
            connectivity,
        }
    }

    pub fn invalidation(&self) -> &InvalidationSetHandle {
        &self.invalidation
    }

    pub async fn handle_request(&self, request: &RewrittenRequest) -> Result<Resolution, EngineError> {
        let identity = request.identity();
        let stored = self.store.get(&identity).await?;
        let online = self.connectivity.is_online();

        let (outcome, response) = match stored {
            None if !online => {
                CacheOutcome::OfflineMiss.record();
                return Err(EngineError::OfflineNoCache {
                    url: request.url.clone(),
                });
            }
            None => {
                let response = self
                    .fetch_and_store(request, &identity, CacheMode::Default, None)
                    .await?;
                (CacheOutcome::Miss, response)
            }
            Some(entry) if !online => (CacheOutcome::OfflineHit, entry),
            Some(entry) => {
                let fresh = is_fresh(&entry.headers, Utc::now());
                let invalidated = self
                    .invalidation
                    .may_contain(&request.invalidation_key)
                    .await
                    .unwrap_or(true);

                if fresh && !invalidated {
                    (CacheOutcome::FreshValid, entry)
                } else {
                    let mode = if invalidated {
                        CacheMode::Reload
                    } else {
                        CacheMode::Default
                    };
                    debug!(url = %request.url, fresh, invalidated, "revalidating");
                    let response = self
                        .fetch_and_store(request, &identity, mode, Some(&entry))
                        .await?;
                    (CacheOutcome::StaleOrInvalidated, response)
                }
            }
        };

        outcome.record();
        debug!(url = %request.url, outcome = outcome.as_str(), status = response.status, "cache decision");
        Ok(Resolution { outcome, response })
    }

    async fn fetch_and_store(
        &self,
        request: &RewrittenRequest,
        identity: &RequestIdentity,
        mode: CacheMode,
        stored: Option<&StoredResponse>,
    ) -> Result<StoredResponse, EngineError> {
        let mut headers = request.headers.clone();
        if let (CacheMode::Default, Some(entry)) = (mode, stored) {
            let validators = [
                (header::ETAG, header::IF_NONE_MATCH),
                (header::LAST_MODIFIED, header::IF_MODIFIED_SINCE),
            ];
            for (stored_name, conditional) in validators {
                if let Some(value) = entry.headers.get(&stored_name) {
                    if !headers.contains_key(&conditional) {
                        headers.insert(conditional, value.clone());
                    }
                }
            }
        }

        let fetched = self
            .fetcher
            .fetch(FetchRequest {
                method: request.method.clone(),
                url: request.url.clone(),
                headers,
                body: Default::default(),
                mode,
            })
            .await?;

        let response = match stored {
            Some(entry) if fetched.is_not_modified() => entry.refreshed_by(&fetched),
            _ => fetched,
        };

        if response.status != 206 && !response.is_not_modified() {
            self.store_response(identity, &response).await;
        }
        Ok(response)
    }

    async fn store_response(&self, identity: &RequestIdentity, response: &StoredResponse) {
        if let Err(err) = self.store.put(identity, response).await {
            EDGE_CACHE_STORE_WRITE_FAILURES.inc();
            warn!(url = %identity.url, error = %err, "failed to store response");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bloom::filter_with_keys;
    use crate::fetch::FetchError;
    use crate::message::header_map;
    use crate::rewrite::invalidation_key;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use axum::http::{HeaderMap, HeaderValue, Method};
    use chrono::Duration;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records what was asked for.
    #[derive(Default)]
    pub(crate) struct ScriptedFetcher {
        responses: Mutex<VecDeque<Result<StoredResponse, FetchError>>>,
        pub(crate) requests: Mutex<Vec<FetchRequest>>,
    }

    impl ScriptedFetcher {
        pub(crate) fn respond(&self, response: StoredResponse) {
            self.responses.lock().unwrap().push_back(Ok(response));
        }

        pub(crate) fn fail(&self) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Err(FetchError::InvalidUrl("scripted failure".into())));
        }

        pub(crate) fn requests(&self) -> Vec<FetchRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, request: FetchRequest) -> Result<StoredResponse, FetchError> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::InvalidUrl("no scripted response".into())))
        }
    }

    struct ReadOnlyStore(MemoryStore);

    #[async_trait]
    impl ResponseStore for ReadOnlyStore {
        async fn get(&self, identity: &RequestIdentity) -> Result<Option<StoredResponse>, StoreError> {
            self.0.get(identity).await
        }

        async fn put(&self, _: &RequestIdentity, _: &StoredResponse) -> Result<(), StoreError> {
            Err(StoreError::Rejected("quota exceeded".into()))
        }

        async fn delete(&self, identity: &RequestIdentity) -> Result<bool, StoreError> {
            self.0.delete(identity).await
        }
    }

    const ORIGINAL: &str = "https://example.com/a.png";
    const PROXIED: &str = "https://acme.app.baqend.com/v1/asset/example.com/a.png";

    fn request() -> RewrittenRequest {
        RewrittenRequest {
            method: Method::GET,
            original_url: ORIGINAL.into(),
            target_url: ORIGINAL.into(),
            url: PROXIED.into(),
            headers: HeaderMap::new(),
            invalidation_key: invalidation_key(ORIGINAL),
        }
    }

    fn http_date(seconds_ago: i64) -> String {
        (Utc::now() - Duration::seconds(seconds_ago))
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string()
    }

    /// `max-age=60`, `age: 10`, served 30 s ago: fresh by its headers.
    fn fresh_entry() -> StoredResponse {
        StoredResponse::new(
            200,
            header_map(&[
                ("cache-control", "max-age=60".to_string()),
                ("age", "10".to_string()),
                ("date", http_date(30)),
                ("etag", "\"v1\"".to_string()),
            ]),
            "stored",
        )
    }

    fn stale_entry() -> StoredResponse {
        let mut entry = fresh_entry();
        entry
            .headers
            .insert(header::DATE, HeaderValue::from_str(&http_date(600)).unwrap());
        entry
    }

    fn origin_response(body: &'static str) -> StoredResponse {
        StoredResponse::new(
            200,
            header_map(&[
                ("cache-control", "max-age=60".to_string()),
                ("date", http_date(0)),
            ]),
            body,
        )
    }

    struct Harness {
        store: Arc<MemoryStore>,
        fetcher: Arc<ScriptedFetcher>,
        invalidation: InvalidationSetHandle,
        connectivity: Connectivity,
        engine: CacheDecisionEngine,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(ScriptedFetcher::default());
        let invalidation = InvalidationSetHandle::new();
        let connectivity = Connectivity::default();
        let engine = CacheDecisionEngine::new(
            store.clone(),
            fetcher.clone(),
            invalidation.clone(),
            connectivity.clone(),
        );
        Harness {
            store,
            fetcher,
            invalidation,
            connectivity,
            engine,
        }
    }

    async fn publish_filter(harness: &Harness, keys: &[&str]) {
        harness
            .invalidation
            .publish(filter_with_keys(keys, 4096, 4))
            .await;
    }

    #[tokio::test]
    async fn miss_fetches_with_default_mode_and_stores() {
        let h = harness();
        h.fetcher.respond(origin_response("fetched"));

        let resolution = h.engine.handle_request(&request()).await.unwrap();
        assert_eq!(resolution.outcome, CacheOutcome::Miss);
        assert_eq!(resolution.response.body, bytes::Bytes::from("fetched"));

        let requests = h.fetcher.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, PROXIED);
        assert_eq!(requests[0].mode, CacheMode::Default);

        let stored = h.store.get(&request().identity()).await.unwrap().unwrap();
        assert_eq!(stored.body, bytes::Bytes::from("fetched"));
    }

    #[tokio::test]
    async fn fresh_and_not_invalidated_is_served_from_store() {
        let h = harness();
        h.store.put(&request().identity(), &fresh_entry()).await.unwrap();
        publish_filter(&h, &["/file/_bq_assets/something-else"]).await;

        let resolution = h.engine.handle_request(&request()).await.unwrap();
        assert_eq!(resolution.outcome, CacheOutcome::FreshValid);
        assert_eq!(resolution.response.body, bytes::Bytes::from("stored"));
        assert!(h.fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn invalidated_fresh_entry_is_reloaded() {
        let h = harness();
        h.store.put(&request().identity(), &fresh_entry()).await.unwrap();
        let key = invalidation_key(ORIGINAL);
        publish_filter(&h, &[key.as_str()]).await;
        h.fetcher.respond(origin_response("reloaded"));

        let resolution = h.engine.handle_request(&request()).await.unwrap();
        assert_eq!(resolution.outcome, CacheOutcome::StaleOrInvalidated);
        assert_eq!(resolution.response.body, bytes::Bytes::from("reloaded"));

        let requests = h.fetcher.requests();
        assert_eq!(requests[0].mode, CacheMode::Reload);
        assert!(!requests[0].headers.contains_key(header::IF_NONE_MATCH));
    }

    #[tokio::test]
    async fn no_filter_loaded_fails_open_to_reload() {
        let h = harness();
        h.store.put(&request().identity(), &fresh_entry()).await.unwrap();
        h.fetcher.respond(origin_response("reloaded"));

        let resolution = h.engine.handle_request(&request()).await.unwrap();
        assert_eq!(resolution.outcome, CacheOutcome::StaleOrInvalidated);
        assert_eq!(h.fetcher.requests()[0].mode, CacheMode::Reload);
    }

    #[tokio::test]
    async fn stale_entry_is_revalidated_conditionally() {
        let h = harness();
        h.store.put(&request().identity(), &stale_entry()).await.unwrap();
        publish_filter(&h, &[]).await;
        h.fetcher.respond(StoredResponse::new(
            304,
            header_map(&[("date", http_date(0)), ("cache-control", "max-age=120".to_string())]),
            bytes::Bytes::new(),
        ));

        let resolution = h.engine.handle_request(&request()).await.unwrap();
        assert_eq!(resolution.outcome, CacheOutcome::StaleOrInvalidated);
        assert_eq!(resolution.response.status, 200);
        assert_eq!(resolution.response.body, bytes::Bytes::from("stored"));
        assert_eq!(resolution.response.header(header::CACHE_CONTROL), Some("max-age=120"));

        let requests = h.fetcher.requests();
        assert_eq!(requests[0].mode, CacheMode::Default);
        assert_eq!(requests[0].headers[header::IF_NONE_MATCH], "\"v1\"");

        // The refreshed entry is fresh again.
        let stored = h.store.get(&request().identity()).await.unwrap().unwrap();
        assert!(is_fresh(&stored.headers, Utc::now()));
        let again = h.engine.handle_request(&request()).await.unwrap();
        assert_eq!(again.outcome, CacheOutcome::FreshValid);
    }

    #[tokio::test]
    async fn offline_hit_ignores_freshness() {
        let h = harness();
        h.store.put(&request().identity(), &stale_entry()).await.unwrap();
        h.connectivity.set_online(false);

        let resolution = h.engine.handle_request(&request()).await.unwrap();
        assert_eq!(resolution.outcome, CacheOutcome::OfflineHit);
        assert_eq!(resolution.response.body, bytes::Bytes::from("stored"));
        assert!(h.fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn offline_miss_is_terminal() {
        let h = harness();
        h.connectivity.set_online(false);

        let err = h.engine.handle_request(&request()).await.unwrap_err();
        assert!(matches!(err, EngineError::OfflineNoCache { .. }));
        assert!(h.fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn network_errors_propagate() {
        let h = harness();
        h.fetcher.fail();
        let err = h.engine.handle_request(&request()).await.unwrap_err();
        assert!(matches!(err, EngineError::Fetch(_)));
    }

    #[tokio::test]
    async fn store_write_failure_still_returns_response() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.respond(origin_response("fetched"));
        let engine = CacheDecisionEngine::new(
            Arc::new(ReadOnlyStore(MemoryStore::new())),
            fetcher,
            InvalidationSetHandle::new(),
            Connectivity::default(),
        );

        let before = EDGE_CACHE_STORE_WRITE_FAILURES.get();
        let resolution = engine.handle_request(&request()).await.unwrap();
        assert_eq!(resolution.outcome, CacheOutcome::Miss);
        assert_eq!(resolution.response.body, bytes::Bytes::from("fetched"));
        assert!(EDGE_CACHE_STORE_WRITE_FAILURES.get() > before);
    }

    #[tokio::test]
    async fn partial_content_is_not_stored() {
        let h = harness();
        h.fetcher.respond(StoredResponse::new(206, HeaderMap::new(), "part"));

        let resolution = h.engine.handle_request(&request()).await.unwrap();
        assert_eq!(resolution.response.status, 206);
        assert!(h.store.is_empty().await);
    }
}
