use common::handshake::ConfigHandshake;
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics::EDGE_CACHE_PASSTHROUGH;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::bloom::InvalidationSetHandle;
use crate::config::WorkerConfig;
use crate::connectivity::Connectivity;
use crate::engine::{CacheDecisionEngine, CacheOutcome};
use crate::error::{EngineError, RewriteError};
use crate::fetch::{CacheMode, FetchRequest, Fetcher};
use crate::message::{InterceptedRequest, StoredResponse};
use crate::refresher::{BloomFilterRefresher, DEFAULT_BACKOFF, DEFAULT_REFRESH_INTERVAL};
use crate::rewrite::{AllowDenyList, RequestRewriter, RewriteContext, RewriteStrategy};
use crate::store::{read_sentinel, write_sentinel, ResponseStore, CONFIG_SENTINEL_URL};

pub const DEFAULT_TENANT_URL_TEMPLATE: &str = "https://{app}.app.baqend.com/";
pub const DEFAULT_SCRIPT_NAME: &str = "sw.js";

#[derive(Debug, Clone)]
pub struct InterceptorSettings {
    pub tenant_url_template: String,
    pub script_name: String,
    pub strategy: RewriteStrategy,
    pub refresh_interval: Duration,
    pub backoff: Duration,
    pub max_url_length: Option<usize>,
}

impl Default for InterceptorSettings {
    fn default() -> Self {
        Self {
            tenant_url_template: DEFAULT_TENANT_URL_TEMPLATE.to_string(),
            script_name: DEFAULT_SCRIPT_NAME.to_string(),
            strategy: RewriteStrategy::default(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            backoff: DEFAULT_BACKOFF,
            max_url_length: None,
        }
    }
}

impl From<&WorkerConfig> for InterceptorSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            tenant_url_template: config.tenant_url_template.clone(),
            script_name: config.script_name.clone(),
            strategy: config.rewrite_mode,
            refresh_interval: config.bloom_refresh_interval,
            backoff: config.bloom_backoff,
            max_url_length: config.max_url_length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Registered,
    Installed,
    Active,
}

/// Everything built from one configuration handshake.
pub struct ActiveConfig {
    pub handshake: ConfigHandshake,
    pub rewriter: Arc<RequestRewriter>,
    pub engine: Arc<CacheDecisionEngine>,
    pub refresher: Arc<BloomFilterRefresher>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughReason {
    NotActive,
    NotConfigured,
    NotHandled,
    EngineFailure,
}

impl PassthroughReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassthroughReason::NotActive => "not_active",
            PassthroughReason::NotConfigured => "not_configured",
            PassthroughReason::NotHandled => "not_handled",
            PassthroughReason::EngineFailure => "engine_failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Cache(CacheOutcome),
    Passthrough(PassthroughReason),
}

#[derive(Debug, Clone)]
pub struct InterceptOutcome {
    pub response: StoredResponse,
    pub disposition: Disposition,
}

/// Entry point for every intercepted request.
///
/// Owns the install/activate lifecycle and the configuration built from the
/// handshake. The configuration is persisted to the store so a restarted
/// worker picks it up on its first request.
pub struct RequestInterceptor {
    settings: InterceptorSettings,
    store: Arc<dyn ResponseStore>,
    fetcher: Arc<dyn Fetcher>,
    connectivity: Connectivity,
    lifecycle: RwLock<Lifecycle>,
    active: RwLock<Option<Arc<ActiveConfig>>>,
}

impl RequestInterceptor {
    pub fn new(
        settings: InterceptorSettings,
        store: Arc<dyn ResponseStore>,
        fetcher: Arc<dyn Fetcher>,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            settings,
            store,
            fetcher,
            connectivity,
            lifecycle: RwLock::new(Lifecycle::Registered),
            active: RwLock::new(None),
        }
    }

    pub fn settings(&self) -> &InterceptorSettings {
        &self.settings
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().await
    }

    /// Installing never waits for older instances; activation follows
    /// immediately.
    pub async fn install(&self) {
        *self.lifecycle.write().await = Lifecycle::Installed;
        debug!("installed");
        self.activate().await;
    }

    pub async fn activate(&self) {
        *self.lifecycle.write().await = Lifecycle::Active;
        info!(strategy = self.settings.strategy.as_str(), "activated");
    }

    /// Builds a fresh configuration from `handshake`, persists it and makes
    /// it current.
    pub async fn configure(&self, handshake: ConfigHandshake) -> Result<Arc<ActiveConfig>, RewriteError> {
        let config = Arc::new(self.build(handshake)?);

        match config.handshake.to_sentinel() {
            Ok(raw) => {
                if let Err(err) = write_sentinel(self.store.as_ref(), CONFIG_SENTINEL_URL, &raw).await {
                    warn!(error = %err, "failed to persist configuration");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize configuration"),
        }

        *self.active.write().await = Some(config.clone());
        info!(
            app = %config.handshake.app_name,
            tenant = config.rewriter.context().tenant_prefix(),
            "configuration accepted"
        );
        config.refresher.ensure_freshness().await;
        Ok(config)
    }

    /// Current configuration, rebuilt from the store sentinel when none has
    /// been received since start-up.
    pub async fn current(&self) -> Option<Arc<ActiveConfig>> {
        if let Some(config) = self.active.read().await.clone() {
            return Some(config);
        }

        let raw = match read_sentinel(self.store.as_ref(), CONFIG_SENTINEL_URL).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, "failed to read persisted configuration");
                return None;
            }
        };
        let config = match ConfigHandshake::from_sentinel(&raw).map_err(|err| err.to_string()) {
            Ok(handshake) => self.build(handshake).map_err(|err| err.to_string()),
            Err(err) => Err(err),
        };
        let config = match config {
            Ok(config) => Arc::new(config),
            Err(err) => {
                warn!(error = %err, "persisted configuration is unusable");
                return None;
            }
        };

        let mut active = self.active.write().await;
        if let Some(existing) = active.as_ref() {
            return Some(existing.clone());
        }
        *active = Some(config.clone());
        info!(app = %config.handshake.app_name, "configuration restored from store");
        Some(config)
    }

    pub async fn handle(&self, request: InterceptedRequest) -> Result<InterceptOutcome, EngineError> {
        if self.lifecycle().await != Lifecycle::Active {
            return self.passthrough(request, PassthroughReason::NotActive).await;
        }
        let Some(config) = self.current().await else {
            return self.passthrough(request, PassthroughReason::NotConfigured).await;
        };
        if !config.rewriter.should_handle(&request) {
            return self.passthrough(request, PassthroughReason::NotHandled).await;
        }

        config.refresher.ensure_freshness().await;

        let task_config = config.clone();
        let task_request = request.clone();
        let task = tokio::spawn(async move {
            let rewritten = task_config.rewriter.rewrite_request(&task_request).await;
            task_config.engine.handle_request(&rewritten).await
        });

        match task.await {
            Ok(Ok(resolution)) => Ok(InterceptOutcome {
                response: resolution.response,
                disposition: Disposition::Cache(resolution.outcome),
            }),
            Ok(Err(err)) if err.is_terminal() => Err(err),
            Ok(Err(err)) => {
                warn!(url = %request.url, error = %err, "cache failed, falling back to network");
                self.passthrough(request, PassthroughReason::EngineFailure).await
            }
            Err(err) => {
                warn!(url = %request.url, error = %err, "cache task aborted, falling back to network");
                self.passthrough(request, PassthroughReason::EngineFailure).await
            }
        }
    }

    fn build(&self, handshake: ConfigHandshake) -> Result<ActiveConfig, RewriteError> {
        let context = RewriteContext::for_app(
            &self.settings.tenant_url_template,
            &handshake.app_name,
            &self.settings.script_name,
        )?;
        let rewriter = RequestRewriter::new(
            context.clone(),
            self.settings.strategy,
            AllowDenyList::from_handshake(&handshake),
            self.store.clone(),
        )
        .with_max_url_length(self.settings.max_url_length);

        let invalidation = InvalidationSetHandle::new();
        let refresher = BloomFilterRefresher::new(
            context.bloom_filter_url(),
            self.fetcher.clone(),
            invalidation.clone(),
        )
        .with_interval(self.settings.refresh_interval)
        .with_backoff(self.settings.backoff);
        let engine = CacheDecisionEngine::new(
            self.store.clone(),
            self.fetcher.clone(),
            invalidation,
            self.connectivity.clone(),
        );

        Ok(ActiveConfig {
            handshake,
            rewriter: Arc::new(rewriter),
            engine: Arc::new(engine),
            refresher: Arc::new(refresher),
        })
    }

    async fn passthrough(
        &self,
        request: InterceptedRequest,
        reason: PassthroughReason,
    ) -> Result<InterceptOutcome, EngineError> {
        EDGE_CACHE_PASSTHROUGH
            .with_label_values(&[reason.as_str()])
            .inc();
        debug!(url = %request.url, reason = reason.as_str(), "passing request through");

        let response = self
            .fetcher
            .fetch(FetchRequest {
                method: request.method,
                url: request.url,
                headers: request.headers,
                body: request.body,
                mode: CacheMode::Default,
            })
            .await?;
        Ok(InterceptOutcome {
            response,
            disposition: Disposition::Passthrough(reason),
        })
    }
}
