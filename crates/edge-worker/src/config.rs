use anyhow::{anyhow, Context, Result};
use common::handshake::ConfigHandshake;
use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use crate::interceptor::{DEFAULT_SCRIPT_NAME, DEFAULT_TENANT_URL_TEMPLATE};
use crate::rewrite::RewriteStrategy;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub bind_addr: SocketAddr,
    pub tenant_url_template: String,
    pub rewrite_mode: RewriteStrategy,
    pub script_name: String,
    pub bloom_refresh_interval: Duration,
    pub bloom_backoff: Duration,
    pub store_dir: Option<PathBuf>,
    pub max_url_length: Option<usize>,
    pub probe_url: Option<String>,
    pub probe_interval: Duration,
    /// Handshake applied at start-up, when `EDGE_APP_NAME` is set.
    pub bootstrap: Option<ConfigHandshake>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind = var("EDGE_WORKER_ADDR").unwrap_or_else(|| "0.0.0.0:8090".to_string());
        let bind_addr: SocketAddr = bind.parse().context("invalid EDGE_WORKER_ADDR")?;

        let tenant_url_template = var("EDGE_TENANT_URL_TEMPLATE")
            .unwrap_or_else(|| DEFAULT_TENANT_URL_TEMPLATE.to_string());
        if !tenant_url_template.contains("{app}") {
            return Err(anyhow!("EDGE_TENANT_URL_TEMPLATE must contain {{app}}"));
        }

        let rewrite_mode = match var("EDGE_REWRITE_MODE") {
            Some(mode) => mode
                .parse::<RewriteStrategy>()
                .map_err(|err| anyhow!(err))
                .context("invalid EDGE_REWRITE_MODE")?,
            None => RewriteStrategy::default(),
        };

        let script_name = var("EDGE_WORKER_SCRIPT").unwrap_or_else(|| DEFAULT_SCRIPT_NAME.to_string());

        let bloom_refresh_interval = millis(&var, "EDGE_BLOOM_REFRESH_INTERVAL_MS", 60_000)?;
        let bloom_backoff = millis(&var, "EDGE_BLOOM_BACKOFF_MS", 5_000)?;

        let store_dir = var("EDGE_STORE_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);

        let max_url_length = var("EDGE_MAX_URL_LENGTH").and_then(|v| v.parse::<usize>().ok());

        let probe_url = var("EDGE_CONNECTIVITY_PROBE_URL").filter(|url| !url.trim().is_empty());
        let probe_interval = millis(&var, "EDGE_CONNECTIVITY_PROBE_INTERVAL_MS", 10_000)?;

        let bootstrap = var("EDGE_APP_NAME")
            .filter(|app| !app.trim().is_empty())
            .map(|app| {
                ConfigHandshake::new(app.trim())
                    .with_white_list(list(&var, "EDGE_WHITE_LIST"))
                    .with_black_list(list(&var, "EDGE_BLACK_LIST"))
            });

        Ok(Self {
            bind_addr,
            tenant_url_template,
            rewrite_mode,
            script_name,
            bloom_refresh_interval,
            bloom_backoff,
            store_dir,
            max_url_length,
            probe_url,
            probe_interval,
            bootstrap,
        })
    }
}

/// Unparsable values fall back to `default`; zero is rejected.
fn millis(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    let millis = var(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default);
    if millis == 0 {
        return Err(anyhow!("{key} must be greater than zero"));
    }
    Ok(Duration::from_millis(millis))
}

fn list(var: &impl Fn(&str) -> Option<String>, key: &str) -> Vec<String> {
    var(key)
        .map(|s| {
            s.split(',')
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
