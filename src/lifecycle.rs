//! Service lifecycle engine — start/stop/restart for supervised processes.
//!
//! Both the admin API and the CLI funnel through this component. A
//! process-wide map keyed by backend id holds the in-flight operation;
//! concurrent callers targeting the same backend are rejected with
//! `OPERATION_IN_PROGRESS` rather than queued — the supervisor operations
//! are idempotent, so callers simply retry with full information.
//! Different backends proceed in parallel.
//!
//! Poll intervals and timeouts are constructor parameters so tests can run
//! in milliseconds; production uses [`Timings::default`].

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::{
    config::{BackendConfig, ServiceStatus},
    error::Error,
    store::{HistoryEvent, StateStore},
    supervisor::{remove_unit, Supervisor, UnitSpec},
};

/// Stdout/stderr logs above this size are rotated before a start.
const LOG_ROTATE_THRESHOLD: u64 = 100 * 1024 * 1024;
/// How much of the stderr log the metal-memory scan reads.
const METAL_SCAN_CAP: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Starting,
    Stopping,
}

/// Timeouts and grace periods for lifecycle verification.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Supervisor must report the unit running within this long.
    pub start_timeout: Duration,
    /// The bound port must accept a TCP connection within this long.
    pub port_timeout: Duration,
    /// Supervisor must report the unit stopped within this long.
    pub stop_timeout: Duration,
    /// Wait before scanning stderr for the metal buffer line.
    pub metal_grace: Duration,
    /// Settle time after recovering a throttled unit.
    pub throttle_settle: Duration,
    /// Port probe poll interval.
    pub port_poll: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(5),
            port_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
            metal_grace: Duration::from_secs(8),
            throttle_settle: Duration::from_secs(1),
            port_poll: Duration::from_millis(250),
        }
    }
}

pub struct LifecycleEngine {
    store: Arc<StateStore>,
    supervisor: Arc<dyn Supervisor>,
    /// Absolute path of the llama-server binary placed in unit argv[0].
    inference_binary: PathBuf,
    inflight: DashMap<String, Op>,
    timings: Timings,
}

/// Releases the in-flight slot when the operation ends, however it ends.
struct OpGuard<'a> {
    map: &'a DashMap<String, Op>,
    key: String,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<StateStore>,
        supervisor: Arc<dyn Supervisor>,
        inference_binary: PathBuf,
    ) -> Self {
        Self::with_timings(store, supervisor, inference_binary, Timings::default())
    }

    pub fn with_timings(
        store: Arc<StateStore>,
        supervisor: Arc<dyn Supervisor>,
        inference_binary: PathBuf,
        timings: Timings,
    ) -> Self {
        Self {
            store,
            supervisor,
            inference_binary,
            inflight: DashMap::new(),
            timings,
        }
    }

    pub fn supervisor(&self) -> &Arc<dyn Supervisor> {
        &self.supervisor
    }

    /// Unit description for a backend, derived from the current config.
    pub fn unit_spec(&self, backend: &BackendConfig) -> UnitSpec {
        UnitSpec::for_backend(&self.inference_binary, backend)
    }

    fn acquire(&self, key: &str, op: Op) -> Result<OpGuard<'_>, Error> {
        use dashmap::mapref::entry::Entry;
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(_) => Err(Error::OperationInProgress(key.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(op);
                Ok(OpGuard {
                    map: &self.inflight,
                    key: key.to_string(),
                })
            }
        }
    }

    fn resolve(&self, identifier: &str) -> Result<BackendConfig, Error> {
        self.store
            .find_by_identifier(identifier)
            .ok_or_else(|| Error::NotFound(format!("no server matches `{identifier}`")))
    }

    // -------------------------------------------------------------------
    // Backend operations
    // -------------------------------------------------------------------

    pub async fn start(&self, identifier: &str) -> Result<BackendConfig, Error> {
        let backend = self.resolve(identifier)?;
        let _guard = self.acquire(&backend.id, Op::Starting)?;
        self.start_locked(backend).await
    }

    pub async fn stop(&self, identifier: &str) -> Result<BackendConfig, Error> {
        let backend = self.resolve(identifier)?;
        let _guard = self.acquire(&backend.id, Op::Stopping)?;
        self.stop_locked(backend).await
    }

    /// Stop (tolerating "already stopped") then start, under one interlock
    /// slot. Any other stop error is fatal.
    pub async fn restart(&self, identifier: &str) -> Result<BackendConfig, Error> {
        let backend = self.resolve(identifier)?;
        let id = backend.id.clone();
        let _guard = self.acquire(&id, Op::Starting)?;

        if backend.status != ServiceStatus::Stopped {
            self.stop_locked(backend).await?;
        }
        let reloaded = self
            .store
            .load_backend(&id)?
            .ok_or_else(|| Error::NotFound(format!("server {id} vanished during restart")))?;
        self.start_locked(reloaded).await
    }

    pub(crate) async fn start_locked(
        &self,
        mut backend: BackendConfig,
    ) -> Result<BackendConfig, Error> {
        if backend.status == ServiceStatus::Running {
            return Err(Error::Conflict(format!(
                "server {} is already running",
                backend.id
            )));
        }

        rotate_log_if_needed(&backend.stdout_path, LOG_ROTATE_THRESHOLD)?;
        rotate_log_if_needed(&backend.stderr_path, LOG_ROTATE_THRESHOLD)?;

        self.ensure_unit_loaded(&backend).await?;

        self.supervisor.start(&backend.label).await?;

        let status = self
            .supervisor
            .wait_for_start(&backend.label, self.timings.start_timeout)
            .await
            .map_err(|_| {
                Error::Internal(anyhow::anyhow!("server {} failed to start", backend.id))
            })?;

        let probe_host = connect_host(&backend.host);
        wait_for_port(&probe_host, backend.port, &self.timings)
            .await
            .map_err(|_| {
                Error::Internal(anyhow::anyhow!(
                    "server {} started but port {} is not responding",
                    backend.id,
                    backend.port
                ))
            })?;

        if !self.timings.metal_grace.is_zero() {
            tokio::time::sleep(self.timings.metal_grace).await;
        }
        if let Some(mib) = scan_metal_memory_file(&backend.stderr_path) {
            backend.metal_memory_mb = Some(mib);
        }

        backend.status = ServiceStatus::Running;
        backend.pid = status.pid;
        backend.last_started = Some(Utc::now());
        self.store.save_backend(&backend)?;
        self.record_history(&backend.id, "start", ServiceStatus::Running);

        info!(id = %backend.id, port = backend.port, pid = ?backend.pid, "server started");
        Ok(backend)
    }

    pub(crate) async fn stop_locked(
        &self,
        mut backend: BackendConfig,
    ) -> Result<BackendConfig, Error> {
        if backend.status == ServiceStatus::Stopped {
            return Err(Error::Conflict(format!(
                "server {} is already stopped",
                backend.id
            )));
        }

        // Both calls are best-effort: a unit the supervisor no longer knows
        // about is already in the state we want.
        if let Err(e) = self.supervisor.stop(&backend.label).await {
            warn!(id = %backend.id, error = %e, "supervisor stop failed");
        }
        if let Err(e) = self.supervisor.unload(&backend.plist_path).await {
            warn!(id = %backend.id, error = %e, "supervisor unload failed");
        }

        self.supervisor
            .wait_for_stop(&backend.label, self.timings.stop_timeout)
            .await
            .map_err(|_| {
                Error::Internal(anyhow::anyhow!("server {} failed to stop", backend.id))
            })?;

        backend.status = ServiceStatus::Stopped;
        backend.pid = None;
        backend.last_stopped = Some(Utc::now());
        self.store.save_backend(&backend)?;
        self.record_history(&backend.id, "stop", ServiceStatus::Stopped);

        info!(id = %backend.id, "server stopped");
        Ok(backend)
    }

    /// Regenerate the unit file if absent or out-of-date, recover a
    /// throttled unit, and make sure the supervisor has the current
    /// definition loaded.
    async fn ensure_unit_loaded(&self, backend: &BackendConfig) -> Result<(), Error> {
        let spec = UnitSpec::for_backend(&self.inference_binary, backend);

        let status = self.supervisor.status(&backend.label).await?;
        if status.is_throttled() {
            warn!(id = %backend.id, "unit is throttled; recreating");
            self.supervisor.unload(&backend.plist_path).await?;
            remove_unit(&backend.plist_path)?;
            tokio::time::sleep(self.timings.throttle_settle).await;
        }

        let on_disk = std::fs::read_to_string(&backend.plist_path).ok();
        if on_disk.as_deref() != Some(spec.render().as_str()) {
            self.supervisor.unload(&backend.plist_path).await?;
            spec.write()?;
        }
        self.supervisor.load(&backend.plist_path).await?;
        Ok(())
    }

    fn record_history(&self, id: &str, event: &str, status: ServiceStatus) {
        let snapshot = HistoryEvent {
            timestamp: Utc::now(),
            event: event.to_string(),
            status: status.to_string(),
        };
        if let Err(e) = self.store.append_history(id, snapshot) {
            warn!(id, error = %e, "could not append history snapshot");
        }
    }

    // -------------------------------------------------------------------
    // Router singleton
    // -------------------------------------------------------------------

    pub async fn start_router(&self) -> Result<(), Error> {
        let _guard = self.acquire("router:singleton", Op::Starting)?;
        let mut router = self.store.router_config()?;
        if router.status == ServiceStatus::Running {
            return Err(Error::Conflict("router is already running".into()));
        }

        let self_binary =
            std::env::current_exe().context("resolving the llama-fleet binary path")?;
        let spec = UnitSpec::for_router(&self_binary, &router);
        let on_disk = std::fs::read_to_string(&router.plist_path).ok();
        if on_disk.as_deref() != Some(spec.render().as_str()) {
            self.supervisor.unload(&router.plist_path).await?;
            spec.write()?;
        }
        self.supervisor.load(&router.plist_path).await?;
        self.supervisor.start(&router.label).await?;

        let status = self
            .supervisor
            .wait_for_start(&router.label, self.timings.start_timeout)
            .await
            .map_err(|_| Error::Internal(anyhow::anyhow!("router failed to start")))?;
        wait_for_port(&connect_host(&router.host), router.port, &self.timings)
            .await
            .map_err(|_| {
                Error::Internal(anyhow::anyhow!(
                    "router started but port {} is not responding",
                    router.port
                ))
            })?;

        router.status = ServiceStatus::Running;
        router.pid = status.pid;
        self.store.save_router_config(&router)?;
        info!(port = router.port, "router started");
        Ok(())
    }

    pub async fn stop_router(&self) -> Result<(), Error> {
        let _guard = self.acquire("router:singleton", Op::Stopping)?;
        let mut router = self.store.router_config()?;
        if router.status == ServiceStatus::Stopped {
            return Err(Error::Conflict("router is already stopped".into()));
        }

        if let Err(e) = self.supervisor.stop(&router.label).await {
            warn!(error = %e, "router stop failed");
        }
        if let Err(e) = self.supervisor.unload(&router.plist_path).await {
            warn!(error = %e, "router unload failed");
        }
        self.supervisor
            .wait_for_stop(&router.label, self.timings.stop_timeout)
            .await
            .map_err(|_| Error::Internal(anyhow::anyhow!("router failed to stop")))?;

        router.status = ServiceStatus::Stopped;
        router.pid = None;
        self.store.save_router_config(&router)?;
        info!("router stopped");
        Ok(())
    }

    pub async fn restart_router(&self) -> Result<(), Error> {
        match self.stop_router().await {
            Ok(()) => {}
            Err(Error::Conflict(_)) => {}
            Err(e) => return Err(e),
        }
        self.start_router().await
    }
}

/// Rewrite the wildcard bind address for outbound probes: 0.0.0.0 accepts
/// connections but is not connectable itself.
pub fn connect_host(host: &str) -> String {
    if host == "0.0.0.0" {
        "127.0.0.1".to_string()
    } else {
        host.to_string()
    }
}

async fn wait_for_port(host: &str, port: u16, timings: &Timings) -> Result<(), Error> {
    let deadline = tokio::time::Instant::now() + timings.port_timeout;
    loop {
        if tokio::net::TcpStream::connect((host, port)).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Internal(anyhow::anyhow!(
                "port {port} not accepting connections"
            )));
        }
        tokio::time::sleep(timings.port_poll).await;
    }
}

/// Rename an oversized log aside with a timestamp suffix; the supervisor
/// recreates the file on next write.
pub(crate) fn rotate_log_if_needed(path: &Path, threshold: u64) -> Result<(), Error> {
    let Ok(meta) = std::fs::metadata(path) else {
        return Ok(());
    };
    if meta.len() <= threshold {
        return Ok(());
    }
    let archived = path.with_extension(format!(
        "{}.{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or("log"),
        Utc::now().format("%Y%m%d%H%M%S"),
    ));
    std::fs::rename(path, &archived)
        .with_context(|| format!("rotating {}", path.display()))?;
    info!(from = %path.display(), to = %archived.display(), "rotated oversized log");
    Ok(())
}

/// Scan the early stderr lines for the metal buffer size reported by the
/// inference process, e.g. `Metal_Mapped model buffer size = 4096.00 MiB`.
pub(crate) fn scan_metal_memory(text: &str) -> Option<f64> {
    let re = regex::Regex::new(r"Metal\S*\s+model buffer size\s*=\s*([0-9]+(?:\.[0-9]+)?)\s*MiB")
        .expect("metal pattern is valid");
    re.captures(text)
        .and_then(|caps| caps[1].parse::<f64>().ok())
}

fn scan_metal_memory_file(path: &Path) -> Option<f64> {
    use std::io::Read as _;
    let mut file = std::fs::File::open(path).ok()?;
    let mut buf = vec![0u8; METAL_SCAN_CAP];
    let n = file.read(&mut buf).ok()?;
    buf.truncate(n);
    scan_metal_memory(&String::from_utf8_lossy(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendPaths, TuningDefaults};
    use crate::supervisor::mock::MockSupervisor;

    fn fast_timings() -> Timings {
        Timings {
            start_timeout: Duration::from_millis(300),
            port_timeout: Duration::from_millis(300),
            stop_timeout: Duration::from_millis(300),
            metal_grace: Duration::ZERO,
            throttle_settle: Duration::from_millis(10),
            port_poll: Duration::from_millis(20),
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<StateStore>,
        supervisor: Arc<MockSupervisor>,
        engine: LifecycleEngine,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().to_path_buf()).unwrap());
        let supervisor = Arc::new(MockSupervisor::new());
        let engine = LifecycleEngine::with_timings(
            Arc::clone(&store),
            Arc::clone(&supervisor) as Arc<dyn Supervisor>,
            PathBuf::from("/usr/local/bin/llama-server"),
            fast_timings(),
        );
        Fixture { _dir: dir, store, supervisor, engine }
    }

    fn make_backend(store: &StateStore, name: &str, port: u16) -> BackendConfig {
        let id = crate::config::sanitize_model_name(name);
        let backend = BackendConfig::new(
            name,
            Path::new(&format!("/models/{name}")),
            port,
            store.backend_paths(&id),
            &TuningDefaults::default(),
        );
        store.save_backend(&backend).unwrap();
        backend
    }

    fn bind_port() -> (std::net::TcpListener, u16) {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn start_verifies_and_persists_running_state() {
        let f = fixture();
        let (_listener, port) = bind_port();
        let backend = make_backend(&f.store, "m.gguf", port);

        let started = f.engine.start("m").await.unwrap();
        assert_eq!(started.status, ServiceStatus::Running);
        assert!(started.pid.is_some());
        assert!(started.last_started.is_some());
        assert!(backend.plist_path.exists(), "plist must be generated");

        let persisted = f.store.load_backend("m").unwrap().unwrap();
        assert_eq!(persisted.status, ServiceStatus::Running);

        let history = f.store.read_history("m").await.unwrap();
        assert_eq!(history.last().unwrap().event, "start");
    }

    #[tokio::test]
    async fn start_of_running_backend_conflicts() {
        let f = fixture();
        let (_listener, port) = bind_port();
        make_backend(&f.store, "m.gguf", port);
        f.engine.start("m").await.unwrap();

        let err = f.engine.start("m").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(err.to_string().contains("already running"));
    }

    #[tokio::test]
    async fn start_of_unknown_identifier_is_not_found() {
        let f = fixture();
        assert!(matches!(f.engine.start("ghost").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn start_fails_when_supervisor_never_reports_running() {
        let f = fixture();
        let (_listener, port) = bind_port();
        let backend = make_backend(&f.store, "m.gguf", port);
        f.supervisor.wedge(&backend.label);

        let err = f.engine.start("m").await.unwrap_err();
        assert!(err.to_string().contains("failed to start"));
        // Status must not have been flipped.
        let persisted = f.store.load_backend("m").unwrap().unwrap();
        assert_eq!(persisted.status, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn start_fails_when_port_never_responds() {
        let f = fixture();
        // No listener bound: choose a port and keep it closed.
        let (listener, port) = bind_port();
        drop(listener);
        make_backend(&f.store, "m.gguf", port);

        let err = f.engine.start("m").await.unwrap_err();
        assert!(err.to_string().contains("not responding"));
    }

    #[tokio::test]
    async fn concurrent_starts_on_one_backend_reject_the_loser() {
        let f = fixture();
        let (_listener, port) = bind_port();
        let backend = make_backend(&f.store, "m.gguf", port);
        // Wedge so the winner stays in flight long enough for the loser
        // to hit the interlock.
        f.supervisor.wedge(&backend.label);

        let (a, b) = tokio::join!(f.engine.start("m"), f.engine.start("m"));
        let in_progress = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(Error::OperationInProgress(_))))
            .count();
        assert_eq!(in_progress, 1, "exactly one caller must be rejected: {a:?} / {b:?}");
    }

    #[tokio::test]
    async fn operations_on_different_backends_run_in_parallel() {
        let f = fixture();
        let (_l1, p1) = bind_port();
        let (_l2, p2) = bind_port();
        make_backend(&f.store, "a.gguf", p1);
        make_backend(&f.store, "b.gguf", p2);

        let (a, b) = tokio::join!(f.engine.start("a"), f.engine.start("b"));
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn throttled_unit_is_recreated_before_start() {
        let f = fixture();
        let (_listener, port) = bind_port();
        let backend = make_backend(&f.store, "m.gguf", port);
        // Simulate a throttled unit: loaded with exit code 78, not running.
        f.supervisor.load(&backend.plist_path).await.unwrap();
        f.supervisor
            .set_exit_code(&backend.label, crate::supervisor::THROTTLED_EXIT_CODE);

        f.engine.start("m").await.unwrap();
        let calls = f.supervisor.calls();
        let unloads = calls.iter().filter(|c| c.starts_with("unload")).count();
        assert!(unloads >= 1, "throttle recovery must unload: {calls:?}");
        assert!(backend.plist_path.exists(), "unit must be recreated");
    }

    // -----------------------------------------------------------------------
    // Stop / restart
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn stop_persists_stopped_state_and_clears_pid() {
        let f = fixture();
        let (_listener, port) = bind_port();
        make_backend(&f.store, "m.gguf", port);
        f.engine.start("m").await.unwrap();

        let stopped = f.engine.stop("m").await.unwrap();
        assert_eq!(stopped.status, ServiceStatus::Stopped);
        assert!(stopped.pid.is_none());
        assert!(stopped.last_stopped.is_some());
        assert!(!f.supervisor.is_running(&stopped.label));
    }

    #[tokio::test]
    async fn stop_of_stopped_backend_conflicts() {
        let f = fixture();
        let (_listener, port) = bind_port();
        make_backend(&f.store, "m.gguf", port);
        let err = f.engine.stop("m").await.unwrap_err();
        assert!(err.to_string().contains("already stopped"));
    }

    #[tokio::test]
    async fn restart_from_stopped_just_starts() {
        let f = fixture();
        let (_listener, port) = bind_port();
        make_backend(&f.store, "m.gguf", port);

        let restarted = f.engine.restart("m").await.unwrap();
        assert_eq!(restarted.status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn restart_of_running_backend_cycles_it() {
        let f = fixture();
        let (_listener, port) = bind_port();
        make_backend(&f.store, "m.gguf", port);
        f.engine.start("m").await.unwrap();

        let restarted = f.engine.restart("m").await.unwrap();
        assert_eq!(restarted.status, ServiceStatus::Running);
        assert!(restarted.last_stopped.is_some());
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    #[test]
    fn rotation_moves_only_oversized_logs() {
        let dir = tempfile::tempdir().unwrap();
        let small = dir.path().join("small.stdout");
        let big = dir.path().join("big.stdout");
        std::fs::write(&small, b"tiny").unwrap();
        std::fs::write(&big, vec![0u8; 2048]).unwrap();

        rotate_log_if_needed(&small, 1024).unwrap();
        rotate_log_if_needed(&big, 1024).unwrap();

        assert!(small.exists());
        assert!(!big.exists(), "oversized log must be renamed aside");
        let archived: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("big"))
            .collect();
        assert_eq!(archived.len(), 1);
    }

    #[test]
    fn metal_memory_line_is_parsed() {
        let log = "\
llama_model_load: loading model\n\
ggml_metal_init: found device\n\
llama_new_context: Metal_Mapped model buffer size = 4096.50 MiB\n";
        assert_eq!(scan_metal_memory(log), Some(4096.50));
    }

    #[test]
    fn metal_memory_absent_yields_none() {
        assert_eq!(scan_metal_memory("no metal here"), None);
    }

    #[test]
    fn connect_host_rewrites_wildcard_only() {
        assert_eq!(connect_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(connect_host("127.0.0.1"), "127.0.0.1");
        assert_eq!(connect_host("192.168.1.5"), "192.168.1.5");
    }

    // -----------------------------------------------------------------------
    // Router singleton
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn router_stop_without_running_router_conflicts() {
        let f = fixture();
        let err = f.engine.stop_router().await.unwrap_err();
        assert!(err.to_string().contains("already stopped"));
    }
}
