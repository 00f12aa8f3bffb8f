//! Persisted configuration types.
//!
//! Everything the control plane writes to disk lives here: one
//! [`BackendConfig`] per supervised llama-server process, the
//! [`RouterConfig`] / [`AdminConfig`] singletons, and the [`GlobalConfig`]
//! defaults. The wire format is camelCase JSON, matching the files under
//! the state directory (`servers/<id>.json`, `router.json`, `admin.json`,
//! `config.json`).
//!
//! Invariants enforced across the set of backends (by the store and the
//! config service, not by these types): unique `id`, unique `alias`,
//! unique `port`, unique `modelPath`, and `id == sanitize(modelName)`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Aliases that collide with route segments or CLI verbs and are therefore
/// never accepted as backend aliases.
const RESERVED_ALIASES: &[&str] = &[
    "router", "admin", "server", "servers", "models", "all", "status", "health",
];

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    #[default]
    Stopped,
    Crashed,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        })
    }
}

/// Derive the stable backend identifier from a model file name.
///
/// Lowercases, strips a trailing `.gguf`, collapses every run of
/// non-alphanumeric characters to a single `-`, and trims leading/trailing
/// `-`. Idempotent: `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize_model_name(name: &str) -> String {
    let lower = name.to_lowercase();
    let stem = lower.strip_suffix(".gguf").unwrap_or(&lower);

    let mut id = String::with_capacity(stem.len());
    let mut last_dash = true; // suppress a leading dash
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() {
            id.push(c);
            last_dash = false;
        } else if !last_dash {
            id.push('-');
            last_dash = true;
        }
    }
    while id.ends_with('-') {
        id.pop();
    }
    id
}

/// Validate a human-chosen alias: 1–64 chars, alphanumerics plus `-` and
/// `_`, and not one of the reserved names. Uniqueness against other
/// backends is the store's job.
pub fn validate_alias(alias: &str) -> Result<(), Error> {
    if alias.is_empty() || alias.len() > 64 {
        return Err(Error::Validation(format!(
            "alias must be 1-64 characters, got {}",
            alias.len()
        )));
    }
    if !alias.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(Error::Validation(format!(
            "alias `{alias}` may only contain letters, digits, `-` and `_`"
        )));
    }
    let lower = alias.to_lowercase();
    if RESERVED_ALIASES.contains(&lower.as_str()) {
        return Err(Error::Validation(format!("alias `{alias}` is reserved")));
    }
    Ok(())
}

/// Validate a TCP port for a backend or singleton service.
pub fn validate_port(port: u16) -> Result<(), Error> {
    if port < 1024 {
        return Err(Error::Validation(format!(
            "port {port} is below 1024; ports under 1024 require privileges"
        )));
    }
    Ok(())
}

/// Generate a fresh admin API key: 32 bytes of entropy as 64 hex chars.
pub fn generate_api_key() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Filesystem locations derived for one backend at creation time.
///
/// Computed by the state store from the backend id; rewritten wholesale on
/// identity migration.
#[derive(Debug, Clone)]
pub struct BackendPaths {
    pub plist: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub http_log: PathBuf,
}

/// One supervised llama-server process bound to one model on one port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Stable identifier, always `sanitize(model_name)`.
    pub id: String,
    /// Optional human-chosen alias; unique case-insensitively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Absolute path to the model file (entry-point shard for sharded sets).
    pub model_path: PathBuf,
    /// Display name, usually the model file name.
    pub model_name: String,
    pub port: u16,
    #[serde(default = "defaults::host")]
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_layers: Option<u32>,

    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub embeddings: bool,
    #[serde(default)]
    pub jinja: bool,

    /// Extra llama-server flags appended verbatim, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_flags: Vec<String>,

    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stopped: Option<DateTime<Utc>>,
    /// Metal buffer size captured from the early stderr log, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metal_memory_mb: Option<f64>,

    /// launchd label, unique per backend.
    pub label: String,
    pub plist_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub http_log_path: PathBuf,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackendConfig {
    /// Construct a fresh backend from a resolved model and allocated port.
    pub fn new(
        model_name: &str,
        model_path: &Path,
        port: u16,
        paths: BackendPaths,
        defaults: &TuningDefaults,
    ) -> Self {
        let id = sanitize_model_name(model_name);
        let now = Utc::now();
        Self {
            label: label_for(&id),
            id,
            alias: None,
            model_path: model_path.to_path_buf(),
            model_name: model_name.to_string(),
            port,
            host: defaults::host(),
            threads: defaults.threads,
            ctx_size: defaults.ctx_size,
            gpu_layers: defaults.gpu_layers,
            verbose: false,
            embeddings: false,
            jinja: false,
            custom_flags: Vec::new(),
            status: ServiceStatus::Stopped,
            pid: None,
            last_started: None,
            last_stopped: None,
            metal_memory_mb: None,
            plist_path: paths.plist,
            stdout_path: paths.stdout,
            stderr_path: paths.stderr,
            http_log_path: paths.http_log,
            created_at: now,
            updated_at: now,
        }
    }

    /// llama-server argv derived from this config (binary path excluded).
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "--model".into(),
            self.model_path.display().to_string(),
            "--host".into(),
            self.host.clone(),
            "--port".into(),
            self.port.to_string(),
        ];
        if let Some(threads) = self.threads {
            args.push("--threads".into());
            args.push(threads.to_string());
        }
        if let Some(ctx) = self.ctx_size {
            args.push("--ctx-size".into());
            args.push(ctx.to_string());
        }
        if let Some(layers) = self.gpu_layers {
            args.push("--gpu-layers".into());
            args.push(layers.to_string());
        }
        if self.verbose {
            args.push("--verbose".into());
        }
        if self.embeddings {
            args.push("--embeddings".into());
        }
        if self.jinja {
            args.push("--jinja".into());
        }
        args.extend(self.custom_flags.iter().cloned());
        args
    }
}

/// launchd label for a backend id.
pub fn label_for(id: &str) -> String {
    format!("com.llamafleet.{id}")
}

/// Router singleton — the front-door HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    #[serde(default = "defaults::router_port")]
    pub port: u16,
    #[serde(default = "defaults::host")]
    pub host: String,
    #[serde(default = "defaults::router_label")]
    pub label: String,
    pub plist_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// Upstream request timeout in seconds for non-streaming proxying.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout: u64,
    /// When true, the per-request JSON log is appended to `logs/router.log`.
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RouterConfig {
    pub fn with_defaults(plist: PathBuf, stdout: PathBuf, stderr: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            port: defaults::router_port(),
            host: defaults::host(),
            label: defaults::router_label(),
            plist_path: plist,
            stdout_path: stdout,
            stderr_path: stderr,
            request_timeout: defaults::request_timeout_secs(),
            verbose: false,
            status: ServiceStatus::Stopped,
            pid: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Admin singleton — the control-plane HTTP server. Carries the shared
/// secret every `/api/*` request must present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConfig {
    #[serde(default = "defaults::admin_port")]
    pub port: u16,
    #[serde(default = "defaults::host")]
    pub host: String,
    #[serde(default = "defaults::admin_label")]
    pub label: String,
    pub plist_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout: u64,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// 64 hex characters (32 bytes of entropy), generated on first start.
    pub api_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AdminConfig {
    pub fn with_defaults(plist: PathBuf, stdout: PathBuf, stderr: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            port: defaults::admin_port(),
            host: defaults::host(),
            label: defaults::admin_label(),
            plist_path: plist,
            stdout_path: stdout,
            stderr_path: stderr,
            request_timeout: defaults::request_timeout_secs(),
            verbose: false,
            status: ServiceStatus::Stopped,
            pid: None,
            api_key: generate_api_key(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Default tuning values applied to newly created backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_layers: Option<u32>,
}

/// Global settings singleton (`config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Directory scanned for `.gguf` model files.
    pub models_directory: PathBuf,
    /// First port the allocator hands out.
    #[serde(default = "defaults::port_base")]
    pub port_base: u16,
    /// Tuning defaults for new backends.
    #[serde(default)]
    pub defaults: TuningDefaults,
}

impl GlobalConfig {
    pub fn with_defaults(models_directory: PathBuf) -> Self {
        Self {
            models_directory,
            port_base: defaults::port_base(),
            defaults: TuningDefaults::default(),
        }
    }
}

mod defaults {
    pub fn host() -> String { "127.0.0.1".into() }
    pub fn router_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn port_base() -> u16 { 9000 }
    pub fn request_timeout_secs() -> u64 { 120 }
    pub fn router_label() -> String { "com.llamafleet.router".into() }
    pub fn admin_label() -> String { "com.llamafleet.admin".into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // sanitize_model_name
    // -----------------------------------------------------------------------

    #[test]
    fn sanitize_lowercases_and_strips_extension() {
        assert_eq!(sanitize_model_name("Qwen2.5-7B-Instruct.gguf"), "qwen2-5-7b-instruct");
    }

    #[test]
    fn sanitize_collapses_nonalphanumeric_runs() {
        assert_eq!(sanitize_model_name("my  weird__model!!.gguf"), "my-weird-model");
    }

    #[test]
    fn sanitize_trims_leading_and_trailing_dashes() {
        assert_eq!(sanitize_model_name("--edge-.gguf"), "edge");
        assert_eq!(sanitize_model_name(".hidden.gguf"), "hidden");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let names = [
            "Qwen2.5-7B-Instruct.gguf",
            "llama-3.1-8B.Q4_K_M.gguf",
            "plain",
            "--messy__name--",
        ];
        for name in names {
            let once = sanitize_model_name(name);
            assert_eq!(sanitize_model_name(&once), once, "not idempotent for {name}");
        }
    }

    #[test]
    fn sanitize_only_strips_gguf_suffix_case_insensitively() {
        assert_eq!(sanitize_model_name("model.GGUF"), "model");
        // A .bin extension is not the model extension; it is collapsed instead.
        assert_eq!(sanitize_model_name("model.bin"), "model-bin");
    }

    // -----------------------------------------------------------------------
    // Alias validation
    // -----------------------------------------------------------------------

    #[test]
    fn alias_accepts_alphanumerics_dash_underscore() {
        assert!(validate_alias("fast-7b_v2").is_ok());
        assert!(validate_alias("a").is_ok());
        assert!(validate_alias(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn alias_rejects_empty_and_overlong() {
        assert!(validate_alias("").is_err());
        assert!(validate_alias(&"x".repeat(65)).is_err());
    }

    #[test]
    fn alias_rejects_bad_characters() {
        for bad in ["has space", "slash/", "dot.", "emoji🦙"] {
            assert!(validate_alias(bad).is_err(), "accepted: {bad}");
        }
    }

    #[test]
    fn alias_rejects_reserved_names_case_insensitively() {
        for reserved in ["router", "Admin", "ALL", "servers"] {
            assert!(validate_alias(reserved).is_err(), "accepted reserved: {reserved}");
        }
    }

    // -----------------------------------------------------------------------
    // Port validation
    // -----------------------------------------------------------------------

    #[test]
    fn port_validation_rejects_privileged() {
        assert!(validate_port(80).is_err());
        assert!(validate_port(1023).is_err());
        assert!(validate_port(1024).is_ok());
        assert!(validate_port(9000).is_ok());
        assert!(validate_port(65535).is_ok());
    }

    // -----------------------------------------------------------------------
    // API key generation
    // -----------------------------------------------------------------------

    #[test]
    fn api_key_is_64_hex_chars_and_unique() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    // -----------------------------------------------------------------------
    // Backend argv
    // -----------------------------------------------------------------------

    fn backend_fixture() -> BackendConfig {
        BackendConfig::new(
            "m.gguf",
            Path::new("/models/m.gguf"),
            9000,
            BackendPaths {
                plist: "/tmp/com.llamafleet.m.plist".into(),
                stdout: "/tmp/m.stdout".into(),
                stderr: "/tmp/m.stderr".into(),
                http_log: "/tmp/m.http".into(),
            },
            &TuningDefaults::default(),
        )
    }

    #[test]
    fn command_args_include_model_host_and_port() {
        let backend = backend_fixture();
        let args = backend.command_args();
        assert_eq!(args[0], "--model");
        assert_eq!(args[1], "/models/m.gguf");
        assert!(args.windows(2).any(|w| w == ["--port", "9000"]));
        assert!(args.windows(2).any(|w| w == ["--host", "127.0.0.1"]));
    }

    #[test]
    fn command_args_append_toggles_and_custom_flags() {
        let mut backend = backend_fixture();
        backend.embeddings = true;
        backend.jinja = true;
        backend.custom_flags = vec!["--flash-attn".into(), "on".into()];
        let args = backend.command_args();
        assert!(args.contains(&"--embeddings".to_string()));
        assert!(args.contains(&"--jinja".to_string()));
        // Custom flags come last, in order.
        assert_eq!(&args[args.len() - 2..], ["--flash-attn", "on"]);
    }

    #[test]
    fn command_args_omit_unset_tuning() {
        let backend = backend_fixture();
        let args = backend.command_args();
        assert!(!args.contains(&"--threads".to_string()));
        assert!(!args.contains(&"--ctx-size".to_string()));
    }

    // -----------------------------------------------------------------------
    // Serde shape
    // -----------------------------------------------------------------------

    #[test]
    fn backend_round_trips_through_camel_case_json() {
        let backend = backend_fixture();
        let json = serde_json::to_value(&backend).unwrap();
        assert!(json.get("modelPath").is_some());
        assert!(json.get("modelName").is_some());
        assert_eq!(json["status"], "stopped");
        let back: BackendConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, backend.id);
        assert_eq!(back.port, backend.port);
    }

    #[test]
    fn new_backend_id_matches_sanitized_name() {
        let backend = backend_fixture();
        assert_eq!(backend.id, sanitize_model_name(&backend.model_name));
        assert_eq!(backend.label, "com.llamafleet.m");
    }
}
