//! State store — the on-disk source of truth.
//!
//! A thin facade over the state directory (default `~/.llama-fleet`,
//! override `LLF_STATE_DIR`):
//!
//! ```text
//! config.json          global settings
//! servers/<id>.json    one file per backend
//! router.json          router singleton
//! admin.json           admin singleton (contains the API key)
//! agents/              launchd plists
//! logs/                supervised process stdout/stderr/http + router.log
//! history/<id>.json    bounded observability snapshots
//! ```
//!
//! Every write is atomic: serialize to `<path>.tmp`, then rename. The rename
//! is the linearization point — readers see the previous complete file or
//! the new complete file, never a partial one. Enumeration tolerates corrupt
//! files: they are logged and skipped, never fatal.

use std::{
    collections::HashSet,
    fs,
    io::Read as _,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    config::{AdminConfig, BackendConfig, BackendPaths, GlobalConfig, RouterConfig},
    error::Error,
};

/// How many history snapshots are retained per backend.
const HISTORY_CAP: usize = 100;

/// How much of a log file the tail reader inspects, from the end.
const TAIL_READ_CAP: u64 = 256 * 1024;

/// Seam between the model catalog and whoever knows where models live.
/// The store implements it by reading the global config.
pub trait ModelsDirProvider: Send + Sync {
    fn models_dir(&self) -> PathBuf;
}

/// One observability snapshot appended on lifecycle transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub status: String,
}

pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open (and create, if needed) the state directory tree.
    pub fn open(root: PathBuf) -> Result<Self, Error> {
        for dir in ["servers", "agents", "logs", "history"] {
            fs::create_dir_all(root.join(dir))
                .with_context(|| format!("creating {}/{dir}", root.display()))?;
        }
        Ok(Self { root })
    }

    /// Resolve the state directory: `LLF_STATE_DIR` override, else
    /// `~/.llama-fleet`.
    pub fn default_root() -> PathBuf {
        if let Ok(dir) = std::env::var("LLF_STATE_DIR") {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".llama-fleet")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    pub fn router_log_path(&self) -> PathBuf {
        self.logs_dir().join("router.log")
    }

    /// Filesystem locations for a backend id.
    pub fn backend_paths(&self, id: &str) -> BackendPaths {
        BackendPaths {
            plist: self.agents_dir().join(format!("com.llamafleet.{id}.plist")),
            stdout: self.logs_dir().join(format!("{id}.stdout")),
            stderr: self.logs_dir().join(format!("{id}.stderr")),
            http_log: self.logs_dir().join(format!("{id}.http")),
        }
    }

    // -------------------------------------------------------------------
    // Atomic JSON persistence
    // -------------------------------------------------------------------

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), Error> {
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(value)?;
        fs::write(&tmp, data).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("renaming {} into place", tmp.display()))?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, Error> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Internal(
                    anyhow::Error::from(e).context(format!("reading {}", path.display())),
                ))
            }
        };
        let value = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    // -------------------------------------------------------------------
    // Singletons
    // -------------------------------------------------------------------

    /// Load the global config, creating it with defaults on first access.
    pub fn global(&self) -> Result<GlobalConfig, Error> {
        let path = self.root.join("config.json");
        if let Some(config) = self.read_json(&path)? {
            return Ok(config);
        }
        let config = GlobalConfig::with_defaults(self.root.join("models"));
        self.write_json(&path, &config)?;
        Ok(config)
    }

    pub fn save_global(&self, config: &GlobalConfig) -> Result<(), Error> {
        self.write_json(&self.root.join("config.json"), config)
    }

    pub fn router_config(&self) -> Result<RouterConfig, Error> {
        let path = self.root.join("router.json");
        if let Some(config) = self.read_json(&path)? {
            return Ok(config);
        }
        let config = RouterConfig::with_defaults(
            self.agents_dir().join("com.llamafleet.router.plist"),
            self.logs_dir().join("router.stdout"),
            self.logs_dir().join("router.stderr"),
        );
        self.write_json(&path, &config)?;
        Ok(config)
    }

    pub fn save_router_config(&self, config: &RouterConfig) -> Result<(), Error> {
        let mut config = config.clone();
        config.updated_at = Utc::now();
        self.write_json(&self.root.join("router.json"), &config)
    }

    /// Load the admin singleton, generating the API key on first access.
    pub fn admin_config(&self) -> Result<AdminConfig, Error> {
        let path = self.root.join("admin.json");
        if let Some(config) = self.read_json(&path)? {
            return Ok(config);
        }
        let config = AdminConfig::with_defaults(
            self.agents_dir().join("com.llamafleet.admin.plist"),
            self.logs_dir().join("admin.stdout"),
            self.logs_dir().join("admin.stderr"),
        );
        self.write_json(&path, &config)?;
        Ok(config)
    }

    pub fn save_admin_config(&self, config: &AdminConfig) -> Result<(), Error> {
        let mut config = config.clone();
        config.updated_at = Utc::now();
        self.write_json(&self.root.join("admin.json"), &config)
    }

    // -------------------------------------------------------------------
    // Backends
    // -------------------------------------------------------------------

    fn backend_file(&self, id: &str) -> PathBuf {
        self.root.join("servers").join(format!("{id}.json"))
    }

    pub fn load_backend(&self, id: &str) -> Result<Option<BackendConfig>, Error> {
        self.read_json(&self.backend_file(id))
    }

    pub fn backend_exists(&self, id: &str) -> bool {
        self.backend_file(id).exists()
    }

    pub fn save_backend(&self, backend: &BackendConfig) -> Result<(), Error> {
        let mut backend = backend.clone();
        backend.updated_at = Utc::now();
        self.write_json(&self.backend_file(&backend.id), &backend)
    }

    pub fn delete_backend(&self, id: &str) -> Result<(), Error> {
        let path = self.backend_file(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Internal(
                anyhow::Error::from(e).context(format!("deleting {}", path.display())),
            )),
        }
    }

    /// Enumerate all persisted backends, sorted by id. Corrupt files are
    /// logged and skipped.
    pub fn list_backends(&self) -> Vec<BackendConfig> {
        let dir = self.root.join("servers");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "cannot read servers directory");
                return Vec::new();
            }
        };

        let mut backends: Vec<BackendConfig> = entries
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                if path.extension().is_none_or(|ext| ext != "json") {
                    return None;
                }
                match self.read_json::<BackendConfig>(&path) {
                    Ok(backend) => backend,
                    Err(e) => {
                        tracing::warn!(file = %path.display(), error = %e, "skipping corrupt backend config");
                        None
                    }
                }
            })
            .collect();
        backends.sort_by(|a, b| a.id.cmp(&b.id));
        backends
    }

    /// Resolve an operator-supplied identifier to a backend. Tries, in
    /// order: numeric port match, exact id, exact alias, case-insensitive
    /// substring on model name or id.
    pub fn find_by_identifier(&self, identifier: &str) -> Option<BackendConfig> {
        let backends = self.list_backends();

        if let Ok(port) = identifier.parse::<u16>() {
            if let Some(backend) = backends.iter().find(|b| b.port == port) {
                return Some(backend.clone());
            }
        }
        if let Some(backend) = backends.iter().find(|b| b.id == identifier) {
            return Some(backend.clone());
        }
        if let Some(backend) = backends
            .iter()
            .find(|b| b.alias.as_deref() == Some(identifier))
        {
            return Some(backend.clone());
        }

        let needle = identifier.to_lowercase();
        backends
            .iter()
            .find(|b| {
                b.model_name.to_lowercase().contains(&needle)
                    || b.id.to_lowercase().contains(&needle)
            })
            .cloned()
    }

    /// Ports held by persisted backends, for the allocator.
    pub fn used_ports(&self) -> HashSet<u16> {
        self.list_backends().iter().map(|b| b.port).collect()
    }

    /// Whether any backend references this exact model path. Path-exact:
    /// basename matching is forbidden.
    pub fn server_exists_for_model(&self, path: &Path) -> bool {
        self.list_backends().iter().any(|b| b.model_path == path)
    }

    // -------------------------------------------------------------------
    // History + logs
    // -------------------------------------------------------------------

    fn history_file(&self, id: &str) -> PathBuf {
        self.root.join("history").join(format!("{id}.json"))
    }

    /// Append a lifecycle snapshot, keeping the newest [`HISTORY_CAP`].
    pub fn append_history(&self, id: &str, event: HistoryEvent) -> Result<(), Error> {
        let path = self.history_file(id);
        let mut events: Vec<HistoryEvent> = self.read_json(&path)?.unwrap_or_default();
        events.push(event);
        if events.len() > HISTORY_CAP {
            let drop = events.len() - HISTORY_CAP;
            events.drain(..drop);
        }
        self.write_json(&path, &events)
    }

    /// Read a backend's history snapshots, retrying to tolerate a
    /// concurrent writer mid-rename.
    pub async fn read_history(&self, id: &str) -> Result<Vec<HistoryEvent>, Error> {
        let path = self.history_file(id);
        retry_read(|| self.read_json::<Vec<HistoryEvent>>(&path))
            .await
            .map(Option::unwrap_or_default)
    }

    pub fn delete_history(&self, id: &str) {
        let _ = fs::remove_file(self.history_file(id));
    }

    /// Last `lines` lines of a log file, reading at most 256 KB from the
    /// end. Retries to tolerate concurrent rotation.
    pub async fn read_log_tail(&self, path: &Path, lines: usize) -> Result<Vec<String>, Error> {
        retry_read(|| tail_lines(path, lines)).await
    }
}

impl ModelsDirProvider for StateStore {
    fn models_dir(&self) -> PathBuf {
        self.global()
            .map(|g| g.models_directory)
            .unwrap_or_else(|_| self.root.join("models"))
    }
}

/// Bounded exponential-backoff retry for reads racing a concurrent writer:
/// 3 attempts, 50 ms doubling.
async fn retry_read<T>(mut read: impl FnMut() -> Result<T, Error>) -> Result<T, Error> {
    let mut delay = Duration::from_millis(50);
    let mut last_err = None;
    for attempt in 0..3 {
        match read() {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < 2 {
                    tracing::debug!(error = %e, attempt, "read failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("retry loop ran at least once"))
}

fn tail_lines(path: &Path, lines: usize) -> Result<Vec<String>, Error> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Error::Internal(
                anyhow::Error::from(e).context(format!("opening {}", path.display())),
            ))
        }
    };

    let len = file.metadata()?.len();
    if len > TAIL_READ_CAP {
        use std::io::Seek as _;
        file.seek(std::io::SeekFrom::End(-(TAIL_READ_CAP as i64)))?;
    }
    let mut buf = String::new();
    file.read_to_string(&mut buf)
        .or_else(|_| -> std::io::Result<usize> {
            // Seek may have landed mid-UTF-8; fall back to lossy.
            buf.clear();
            let mut bytes = Vec::new();
            let mut f = fs::File::open(path)?;
            if len > TAIL_READ_CAP {
                use std::io::Seek as _;
                f.seek(std::io::SeekFrom::End(-(TAIL_READ_CAP as i64)))?;
            }
            f.read_to_end(&mut bytes)?;
            buf.push_str(&String::from_utf8_lossy(&bytes));
            Ok(buf.len())
        })?;

    let collected: Vec<String> = buf.lines().map(str::to_string).collect();
    let skip = collected.len().saturating_sub(lines);
    Ok(collected.into_iter().skip(skip).collect())
}
