use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Process-wide online/offline flag.
///
/// Starts online. Flipped by the optional probe and by the manual override
/// endpoint.
#[derive(Clone, Debug)]
pub struct Connectivity {
    online: Arc<AtomicBool>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::AcqRel);
        if previous != online {
            info!(online, "connectivity changed");
        }
    }

    /// Periodically issues a HEAD request to `url`; any response counts as
    /// online, a transport failure as offline.
    pub fn spawn_probe(&self, url: String, interval: Duration) -> anyhow::Result<JoinHandle<()>> {
        if interval.is_zero() {
            anyhow::bail!("connectivity probe interval must be greater than zero");
        }
        let client = reqwest::Client::builder().timeout(interval).build()?;
        let connectivity = self.clone();
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let online = match client.head(&url).send().await {
                    Ok(_) => true,
                    Err(err) => {
                        debug!(error = %err, "connectivity probe failed");
                        false
                    }
                };
                connectivity.set_online(online);
            }
        }))
    }
}
