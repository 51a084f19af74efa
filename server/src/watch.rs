//! Polling file watch with debounced reload
//!
//! Config files on Proxmox live on a FUSE mount where inotify is unreliable,
//! so files are polled and compared by SHA-256 of their content. A change
//! arms a quiet period; further changes push it back, and the reload runs
//! once the file has been still for the whole period.

use ldap_gateway_core::{Metrics, ProviderError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(500);

/// Content fingerprint, `None` when the file cannot be read.
pub async fn fingerprint(path: &Path) -> Option<String> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(hex::encode(hasher.finalize()))
}

/// Trailing-edge debounce state.
#[derive(Debug)]
pub struct Debouncer {
    quiet: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            deadline: None,
        }
    }

    /// Record a change seen at `now`, restarting the quiet period.
    pub fn touch(&mut self, now: Instant) {
        self.deadline = Some(now + self.quiet);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once, when the quiet period has elapsed at `now`.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(d) if now >= d => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

type Parser<T> = fn(&str) -> Result<T, ProviderError>;

/// A parsed file kept in memory and swapped atomically on reload.
pub struct WatchedFile<T> {
    path: PathBuf,
    source: &'static str,
    parse: Parser<T>,
    current: RwLock<Arc<T>>,
    metrics: Option<Arc<Metrics>>,
}

impl<T: Send + Sync + 'static> WatchedFile<T> {
    /// Read and parse the file; failure here is fatal to the caller.
    pub async fn load(
        path: impl Into<PathBuf>,
        source: &'static str,
        parse: Parser<T>,
    ) -> Result<Self, ProviderError> {
        let path = path.into();
        let parsed = read_and_parse(&path, parse).await?;
        info!("Loaded {} from {}", source, path.display());
        Ok(Self {
            path,
            source,
            parse,
            current: RwLock::new(Arc::new(parsed)),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn current(&self) -> Arc<T> {
        self.current.read().await.clone()
    }

    /// Re-read the file. On failure the previous snapshot stays in place.
    pub async fn reload(&self) -> Result<(), ProviderError> {
        match read_and_parse(&self.path, self.parse).await {
            Ok(parsed) => {
                *self.current.write().await = Arc::new(parsed);
                info!("Reloaded {} from {}", self.source, self.path.display());
                self.record_reload("success");
                Ok(())
            }
            Err(e) => {
                error!(
                    "Reload of {} failed, keeping previous data: {}",
                    self.path.display(),
                    e
                );
                self.record_reload("failure");
                Err(e)
            }
        }
    }

    /// Poll the file and reload after it settles. The task ends when the
    /// last strong reference to `self` is dropped.
    pub fn watch(self: &Arc<Self>, poll: Duration, quiet: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let path = self.path.clone();
        tokio::spawn(async move {
            let mut last = fingerprint(&path).await;
            let mut debouncer = Debouncer::new(quiet);
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                let deadline = debouncer.deadline();
                tokio::select! {
                    _ = ticker.tick() => {
                        if weak.strong_count() == 0 {
                            break;
                        }
                        let now = fingerprint(&path).await;
                        if now != last {
                            debug!("Change detected in {}", path.display());
                            last = now;
                            debouncer.touch(Instant::now());
                        }
                    }
                    _ = wait_until(deadline) => {
                        if !debouncer.take_due(Instant::now()) {
                            continue;
                        }
                        let Some(file) = weak.upgrade() else {
                            break;
                        };
                        let _ = file.reload().await;
                    }
                }
            }
            debug!("Stopped watching {}", path.display());
        })
    }

    fn record_reload(&self, result: &str) {
        if let Some(m) = &self.metrics {
            m.directory_reloads_total
                .with_label_values(&[self.source, result])
                .inc();
        }
    }
}

async fn read_and_parse<T>(path: &Path, parse: Parser<T>) -> Result<T, ProviderError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse(&content)
}
