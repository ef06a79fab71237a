//! Maps intercepted requests onto the tenant endpoint.
//!
//! A [`RequestRewriter`] answers three questions for a request: whether the
//! worker should handle it at all, which URL the cache should fetch and key it
//! under, and which key represents it in the invalidation set.

pub mod context;
pub mod lists;

use axum::http::{HeaderMap, Method};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use percent_encoding::percent_decode_str;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::RewriteError;
use crate::message::{without_hop_by_hop, InterceptedRequest, RequestIdentity};
use crate::store::{is_sentinel, read_sentinel, write_sentinel, ResponseStore, BASE_PATH_SENTINEL_URL};

pub use context::{strip_scheme, RewriteContext};
pub use lists::AllowDenyList;

/// Path prefix of invalidation keys.
pub const INVALIDATION_KEY_PREFIX: &str = "/file/_bq_assets/";

const URL_PARAM: &str = "?url=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RewriteStrategy {
    /// Cache requests under their own URL.
    Passthrough,
    /// Proxy any origin through the tenant's asset endpoint.
    #[default]
    AbsoluteProxy,
    /// Requests arrive relative to the tenant and are resolved against a
    /// learned base host before being proxied.
    RelativeBase,
}

impl RewriteStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewriteStrategy::Passthrough => "passthrough",
            RewriteStrategy::AbsoluteProxy => "absolute",
            RewriteStrategy::RelativeBase => "relative",
        }
    }
}

impl FromStr for RewriteStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "passthrough" => Ok(RewriteStrategy::Passthrough),
            "absolute" => Ok(RewriteStrategy::AbsoluteProxy),
            "relative" => Ok(RewriteStrategy::RelativeBase),
            other => Err(format!("unknown rewrite mode: {other}")),
        }
    }
}

/// The canonical form of an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenRequest {
    pub method: Method,
    /// URL as intercepted.
    pub original_url: String,
    /// Absolute URL the resource is identified by before proxying. The
    /// invalidation key is derived from it.
    pub target_url: String,
    /// URL the cache fetches and stores under.
    pub url: String,
    pub headers: HeaderMap,
    pub invalidation_key: String,
}

impl RewrittenRequest {
    pub fn identity(&self) -> RequestIdentity {
        RequestIdentity::new(&self.method, self.url.clone())
    }
}

/// `/file/_bq_assets/<url-safe base64 of url>`, padding kept.
pub fn invalidation_key(url: &str) -> String {
    format!("{INVALIDATION_KEY_PREFIX}{}", URL_SAFE.encode(url.as_bytes()))
}

pub struct RequestRewriter {
    context: RewriteContext,
    strategy: RewriteStrategy,
    lists: AllowDenyList,
    max_url_length: Option<usize>,
    store: Arc<dyn ResponseStore>,
    base: RwLock<Option<String>>,
}

impl RequestRewriter {
    pub fn new(
        context: RewriteContext,
        strategy: RewriteStrategy,
        lists: AllowDenyList,
        store: Arc<dyn ResponseStore>,
    ) -> Self {
        Self {
            context,
            strategy,
            lists,
            max_url_length: None,
            store,
            base: RwLock::new(None),
        }
    }

    pub fn with_max_url_length(mut self, max: Option<usize>) -> Self {
        self.max_url_length = max;
        self
    }

    pub fn context(&self) -> &RewriteContext {
        &self.context
    }

    pub fn strategy(&self) -> RewriteStrategy {
        self.strategy
    }

    pub fn lists(&self) -> &AllowDenyList {
        &self.lists
    }

    pub fn should_handle(&self, request: &InterceptedRequest) -> bool {
        let url = request.url.as_str();

        if request.method != Method::GET && request.method != Method::HEAD {
            return false;
        }
        if !is_http(url) {
            return false;
        }
        if url.starts_with(self.context.script_url()) || url.starts_with(self.context.bloom_filter_url()) {
            return false;
        }
        if is_sentinel(url) {
            return false;
        }
        if self.max_url_length.is_some_and(|max| url.len() > max) {
            return false;
        }
        if self.strategy == RewriteStrategy::RelativeBase && url == self.context.tenant_prefix() {
            return false;
        }
        self.lists.permits(url)
    }

    /// Never fails: input that cannot be resolved is kept as is.
    pub async fn rewrite_request(&self, request: &InterceptedRequest) -> RewrittenRequest {
        let original_url = request.url.clone();

        let (target_url, url) = if original_url.starts_with(self.context.api_prefix()) {
            (original_url.clone(), original_url.clone())
        } else {
            match self.strategy {
                RewriteStrategy::Passthrough => (original_url.clone(), original_url.clone()),
                RewriteStrategy::AbsoluteProxy => {
                    let target = self.absolutize(&original_url);
                    let url = self.context.asset_url(&target);
                    (target, url)
                }
                RewriteStrategy::RelativeBase => match self.resolve_relative(&original_url).await {
                    Ok(target) => {
                        let url = self.context.asset_url(&target);
                        (target, url)
                    }
                    Err(err) => {
                        debug!(url = %original_url, error = %err, "leaving request un-rewritten");
                        (original_url.clone(), original_url.clone())
                    }
                },
            }
        };

        RewrittenRequest {
            method: request.method.clone(),
            invalidation_key: invalidation_key(&target_url),
            headers: without_hop_by_hop(&request.headers),
            original_url,
            target_url,
            url,
        }
    }

    /// Original URL, minus its scheme, of a URL produced by the asset rewrite.
    pub fn extract_url<'a>(&self, url: &'a str) -> &'a str {
        self.context.extract_url(url)
    }

    /// The exact absolute URL a rewritten request stands for: the proxied
    /// path with its target's scheme put back. Requests left un-rewritten
    /// come back unchanged.
    pub fn recover_url(&self, rewritten: &RewrittenRequest) -> String {
        if rewritten.url == rewritten.original_url {
            return rewritten.original_url.clone();
        }
        match rewritten.url.strip_prefix(self.context.asset_prefix()) {
            Some(rest) => {
                let scheme = scheme_of(&rewritten.target_url).unwrap_or(self.context.scheme());
                format!("{scheme}://{rest}")
            }
            None => rewritten.url.clone(),
        }
    }

    /// Current relative-mode base origin (`scheme://host`), falling back to
    /// the persisted one.
    pub async fn base(&self) -> String {
        if let Some(base) = self.base.read().await.as_ref().filter(|b| !b.is_empty()) {
            return base.clone();
        }

        match read_sentinel(self.store.as_ref(), BASE_PATH_SENTINEL_URL).await {
            Ok(Some(base)) => {
                *self.base.write().await = Some(base.clone());
                base
            }
            Ok(None) => String::new(),
            Err(err) => {
                warn!(error = %err, "failed to read persisted base path");
                String::new()
            }
        }
    }

    async fn remember_base(&self, base: &str) {
        *self.base.write().await = Some(base.to_string());
        if let Err(err) = write_sentinel(self.store.as_ref(), BASE_PATH_SENTINEL_URL, base).await {
            warn!(error = %err, base, "failed to persist base path");
        }
    }

    /// Resolves a tenant-relative request to an absolute target. Both the
    /// `?url=` form and a path under the learned base produce the same
    /// scheme-carrying URL for the same resource.
    async fn resolve_relative(&self, url: &str) -> Result<String, RewriteError> {
        let Some(relative) = url.strip_prefix(self.context.tenant_prefix()) else {
            return Ok(self.absolutize(url));
        };

        if let Some(encoded) = relative.strip_prefix(URL_PARAM) {
            let mut target = self.absolutize(&decode_component(encoded)?);
            if !target.contains('?') {
                target = target.replacen('&', "?", 1);
            }
            self.remember_base(origin_of(&target)).await;
            return Ok(target);
        }

        let base = self.base().await;
        let scheme = scheme_of(&base).unwrap_or(self.context.scheme());
        let host = strip_scheme(&base);
        if starts_with_base(relative, host) {
            Ok(format!("{scheme}://{relative}"))
        } else {
            Ok(format!("{scheme}://{host}/{relative}"))
        }
    }

    /// Gives scheme-less and scheme-relative URLs the tenant's scheme.
    fn absolutize(&self, url: &str) -> String {
        if is_http(url) {
            url.to_string()
        } else if url.starts_with("//") {
            format!("{}:{url}", self.context.scheme())
        } else {
            format!("{}://{url}", self.context.scheme())
        }
    }
}

fn is_http(url: &str) -> bool {
    ["http://", "https://"].iter().any(|scheme| {
        url.get(..scheme.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(scheme))
    })
}

fn scheme_of(url: &str) -> Option<&str> {
    url.split_once("://")
        .map(|(scheme, _)| scheme)
        .filter(|scheme| scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https"))
}

/// `scheme://host` of an absolute URL, cut at the first `/`, `?` or `#`
/// after the host.
fn origin_of(url: &str) -> &str {
    let host_start = url.len() - strip_scheme(url).len();
    let end = url[host_start..]
        .find(['/', '?', '#'])
        .map_or(url.len(), |end| host_start + end);
    &url[..end]
}

fn starts_with_base(url: &str, base: &str) -> bool {
    let rest = strip_scheme(url);
    rest.get(..base.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(base))
}

/// Strict percent-decoding: every `%` must start a valid escape and the
/// result must be UTF-8.
fn decode_component(encoded: &str) -> Result<String, RewriteError> {
    let bytes = encoded.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes
                .get(i + 1..i + 3)
                .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return Err(RewriteError::MalformedEncoding(encoded.to_string()));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    percent_decode_str(encoded)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| RewriteError::MalformedEncoding(encoded.to_string()))
}
