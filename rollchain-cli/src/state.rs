//! On-disk state for CLI runs
//!
//! Each invocation locks the state directory, loads the store snapshot (and,
//! for the local bridges, their own snapshots), starts the service, runs one
//! command and writes everything back. The lock is held for the whole
//! load-modify-save cycle, so overlapping runs are serialized instead of
//! overwriting each other's blocks and records.

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use rollchain_core::bridge::{
    content_store_from_config, ContentStore, LocalContentStore, LocalTrustAnchor,
    ProcessTrustAnchor, TrustAnchor,
};
use rollchain_core::clock::SystemClock;
use rollchain_core::config::{ContentStoreBackend, TrustAnchorBackend};
use rollchain_core::store::MemoryStore;
use rollchain_core::{CheckinConfig, CheckinService};

const STORE_FILE: &str = "store.json";
const ANCHOR_FILE: &str = "anchor.json";
const CONTENT_FILE: &str = "content.json";
const LOCK_FILE: &str = ".rollchain.lock";

const LOCK_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct StatePaths {
    pub store: PathBuf,
    pub anchor: PathBuf,
    pub content: PathBuf,
    pub lock: PathBuf,
}

impl StatePaths {
    /// `--state` wins, then `store.path` from config, then the platform data dir
    pub fn resolve(state_dir: Option<&Path>, config: &CheckinConfig) -> Result<Self> {
        if let Some(dir) = state_dir {
            return Ok(Self::in_dir(dir, dir.join(STORE_FILE)));
        }
        if let Some(store) = &config.store.path {
            let dir = store
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            return Ok(Self::in_dir(dir, store.clone()));
        }

        let dirs = ProjectDirs::from("", "", "rollchain")
            .context("Could not determine a data directory; pass --state")?;
        let dir = dirs.data_dir();
        Ok(Self::in_dir(dir, dir.join(STORE_FILE)))
    }

    fn in_dir(dir: &Path, store: PathBuf) -> Self {
        Self {
            store,
            anchor: dir.join(ANCHOR_FILE),
            content: dir.join(CONTENT_FILE),
            lock: dir.join(LOCK_FILE),
        }
    }
}

/// Exclusive advisory lock on a state directory, released on drop
pub struct StateLock {
    _file: File,
}

impl StateLock {
    /// Take the lock, polling until `wait` has elapsed
    pub async fn acquire(path: &Path, wait: Duration) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        let deadline = Instant::now() + wait;
        let mut announced = false;
        loop {
            let acquired = try_flock_exclusive(&file)
                .with_context(|| format!("Failed to lock {}", path.display()))?;
            if acquired {
                debug!("Acquired state lock {}", path.display());
                return Ok(Self { _file: file });
            }
            if Instant::now() >= deadline {
                bail!(
                    "State at {} is in use by another rollchain process",
                    path.parent().unwrap_or(path).display()
                );
            }
            if !announced {
                info!("Waiting for another rollchain process to release the state");
                announced = true;
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }
}

/// Try to acquire an exclusive flock on a file without blocking
///
/// `Ok(false)` means another open file description holds it.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

pub struct Workspace {
    paths: StatePaths,
    store: Arc<MemoryStore>,
    local_anchor: Option<Arc<LocalTrustAnchor>>,
    local_content: Option<Arc<LocalContentStore>>,
    pub service: CheckinService,
    // Dropped last, after everything that reads or writes the state
    _lock: StateLock,
}

impl Workspace {
    /// Lock the state directory (waiting up to `lock_wait`), then load it
    pub async fn open(
        config: CheckinConfig,
        paths: StatePaths,
        lock_wait: Duration,
    ) -> Result<Self> {
        let lock = StateLock::acquire(&paths.lock, lock_wait).await?;
        debug!("Opening state at {}", paths.store.display());
        let store = Arc::new(
            MemoryStore::load(&paths.store)
                .await
                .with_context(|| format!("Failed to load store from {}", paths.store.display()))?,
        );

        let (anchor, local_anchor): (Arc<dyn TrustAnchor>, _) =
            match config.bridges.trust_anchor.backend {
                TrustAnchorBackend::Local => {
                    let local = Arc::new(LocalTrustAnchor::load(&paths.anchor).await.with_context(
                        || format!("Failed to load anchor state from {}", paths.anchor.display()),
                    )?);
                    (local.clone() as Arc<dyn TrustAnchor>, Some(local))
                }
                TrustAnchorBackend::Process => {
                    let runner = &config.bridges.trust_anchor;
                    let process = ProcessTrustAnchor::new(
                        runner.command.clone(),
                        runner.args.clone(),
                        config.bridges.timeout(),
                    );
                    (Arc::new(process) as Arc<dyn TrustAnchor>, None)
                }
            };

        let (content, local_content): (Option<Arc<dyn ContentStore>>, _) =
            match config.bridges.content_store.backend {
                ContentStoreBackend::Local => {
                    let local = Arc::new(LocalContentStore::load(&paths.content).await.with_context(
                        || format!("Failed to load content from {}", paths.content.display()),
                    )?);
                    (Some(local.clone() as Arc<dyn ContentStore>), Some(local))
                }
                _ => (
                    content_store_from_config(
                        &config.bridges.content_store,
                        config.bridges.timeout(),
                    )?,
                    None,
                ),
            };

        let service =
            CheckinService::start(config, store.clone(), anchor, content, Arc::new(SystemClock))
                .await
                .context("Service failed to start")?;

        Ok(Self {
            paths,
            store,
            local_anchor,
            local_content,
            service,
            _lock: lock,
        })
    }

    pub async fn save(&self) -> Result<()> {
        self.store
            .save(&self.paths.store)
            .await
            .context("Failed to save store snapshot")?;
        if let Some(anchor) = &self.local_anchor {
            anchor
                .save(&self.paths.anchor)
                .await
                .context("Failed to save anchor state")?;
        }
        if let Some(content) = &self.local_content {
            content
                .save(&self.paths.content)
                .await
                .context("Failed to save content store")?;
        }
        debug!("State saved to {}", self.paths.store.display());
        Ok(())
    }
}
