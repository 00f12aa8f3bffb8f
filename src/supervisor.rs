//! Host service-supervisor adapter (launchd).
//!
//! The control plane never keeps child processes itself — it writes a unit
//! file describing the process and asks the host supervisor to run it with
//! crash-only restart. [`Supervisor`] is the seam: the shipped
//! implementation drives `launchctl`, tests substitute an in-memory mock.
//!
//! Unit files are plists with `KeepAlive = {Crashed: true, SuccessfulExit:
//! false}` and a 10 s throttle interval. launchd signals a throttled unit
//! through a known exit status; recovery (unload, delete, settle,
//! recreate) is the lifecycle engine's job.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;

use crate::{
    config::{BackendConfig, RouterConfig},
    error::Error,
};

/// Exit status launchd reports for a unit it refuses to respawn because it
/// crashed faster than the throttle interval.
pub const THROTTLED_EXIT_CODE: i32 = 78;

/// Poll cadence of the blocking wait helpers.
const WAIT_POLL: Duration = Duration::from_millis(500);

/// Snapshot of one unit as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitStatus {
    /// The unit is known to the supervisor at all.
    pub loaded: bool,
    pub running: bool,
    pub pid: Option<u32>,
    pub last_exit_code: Option<i32>,
}

impl UnitStatus {
    pub fn is_throttled(&self) -> bool {
        self.loaded && !self.running && self.last_exit_code == Some(THROTTLED_EXIT_CODE)
    }
}

/// Declarative description of one supervised process.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub label: String,
    /// Full argv, `argv[0]` being the absolute binary path.
    pub program_args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub plist_path: PathBuf,
}

impl UnitSpec {
    /// Unit for a backend: the inference binary plus flags from the config.
    pub fn for_backend(inference_binary: &Path, backend: &BackendConfig) -> Self {
        let mut program_args = vec![inference_binary.display().to_string()];
        program_args.extend(backend.command_args());
        Self {
            label: backend.label.clone(),
            program_args,
            working_dir: backend.model_path.parent().map(Path::to_path_buf),
            stdout_path: backend.stdout_path.clone(),
            stderr_path: backend.stderr_path.clone(),
            plist_path: backend.plist_path.clone(),
        }
    }

    /// Unit for the router singleton: this binary's `router` subcommand.
    pub fn for_router(self_binary: &Path, router: &RouterConfig) -> Self {
        Self {
            label: router.label.clone(),
            program_args: vec![self_binary.display().to_string(), "router".into()],
            working_dir: None,
            stdout_path: router.stdout_path.clone(),
            stderr_path: router.stderr_path.clone(),
            plist_path: router.plist_path.clone(),
        }
    }

    /// Render the launchd plist XML.
    pub fn render(&self) -> String {
        let args = self
            .program_args
            .iter()
            .map(|a| format!("        <string>{}</string>\n", xml_escape(a)))
            .collect::<String>();
        let working_dir = self
            .working_dir
            .as_ref()
            .map(|dir| {
                format!(
                    "    <key>WorkingDirectory</key>\n    <string>{}</string>\n",
                    xml_escape(&dir.display().to_string())
                )
            })
            .unwrap_or_default();

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
{args}    </array>
{working_dir}    <key>StandardOutPath</key>
    <string>{stdout}</string>
    <key>StandardErrorPath</key>
    <string>{stderr}</string>
    <key>KeepAlive</key>
    <dict>
        <key>Crashed</key>
        <true/>
        <key>SuccessfulExit</key>
        <false/>
    </dict>
    <key>ThrottleInterval</key>
    <integer>10</integer>
</dict>
</plist>
"#,
            label = xml_escape(&self.label),
            args = args,
            working_dir = working_dir,
            stdout = xml_escape(&self.stdout_path.display().to_string()),
            stderr = xml_escape(&self.stderr_path.display().to_string()),
        )
    }

    /// Write the plist to its configured path.
    pub fn write(&self) -> Result<(), Error> {
        if let Some(parent) = self.plist_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&self.plist_path, self.render())
            .with_context(|| format!("writing {}", self.plist_path.display()))?;
        Ok(())
    }
}

/// Remove a unit file; missing files are fine.
pub fn remove_unit(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Internal(
            anyhow::Error::from(e).context(format!("removing unit {}", path.display())),
        )),
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// The supervisor seam. `unload` and `stop` are idempotent: asking to
/// unload a unit that isn't loaded (or stop one that isn't running) is not
/// an error.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn load(&self, plist: &Path) -> Result<(), Error>;
    async fn unload(&self, plist: &Path) -> Result<(), Error>;
    async fn start(&self, label: &str) -> Result<(), Error>;
    async fn stop(&self, label: &str) -> Result<(), Error>;
    async fn status(&self, label: &str) -> Result<UnitStatus, Error>;

    /// Poll every 500 ms until the unit reports running, or time out.
    async fn wait_for_start(&self, label: &str, timeout: Duration) -> Result<UnitStatus, Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status(label).await?;
            if status.running {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Internal(anyhow::anyhow!(
                    "{label} did not report running within {timeout:?}"
                )));
            }
            tokio::time::sleep(WAIT_POLL.min(timeout)).await;
        }
    }

    /// Poll every 500 ms until the unit is no longer running, or time out.
    async fn wait_for_stop(&self, label: &str, timeout: Duration) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status(label).await?;
            if !status.running {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Internal(anyhow::anyhow!(
                    "{label} still running after {timeout:?}"
                )));
            }
            tokio::time::sleep(WAIT_POLL.min(timeout)).await;
        }
    }
}

/// `launchctl`-backed supervisor.
pub struct Launchd;

impl Launchd {
    async fn run(&self, args: &[&str]) -> Result<std::process::Output, Error> {
        Command::new("launchctl")
            .args(args)
            .output()
            .await
            .with_context(|| format!("invoking launchctl {}", args.join(" ")))
            .map_err(Error::Internal)
    }
}

#[async_trait]
impl Supervisor for Launchd {
    async fn load(&self, plist: &Path) -> Result<(), Error> {
        let path = plist.display().to_string();
        let out = self.run(&["load", "-w", &path]).await?;
        let stderr = String::from_utf8_lossy(&out.stderr);
        // Re-loading an already-loaded unit is not a failure.
        if !out.status.success() && !stderr.contains("already loaded") {
            return Err(Error::Internal(anyhow::anyhow!(
                "launchctl load {path} failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn unload(&self, plist: &Path) -> Result<(), Error> {
        let path = plist.display().to_string();
        let out = self.run(&["unload", &path]).await?;
        let stderr = String::from_utf8_lossy(&out.stderr);
        if !out.status.success()
            && !stderr.contains("not loaded")
            && !stderr.contains("Could not find")
            && !stderr.contains("No such file")
        {
            return Err(Error::Internal(anyhow::anyhow!(
                "launchctl unload {path} failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn start(&self, label: &str) -> Result<(), Error> {
        let out = self.run(&["start", label]).await?;
        if !out.status.success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "launchctl start {label} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn stop(&self, label: &str) -> Result<(), Error> {
        let out = self.run(&["stop", label]).await?;
        let stderr = String::from_utf8_lossy(&out.stderr);
        if !out.status.success()
            && !stderr.contains("No such process")
            && !stderr.contains("Could not find")
        {
            return Err(Error::Internal(anyhow::anyhow!(
                "launchctl stop {label} failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn status(&self, label: &str) -> Result<UnitStatus, Error> {
        let out = self.run(&["list"]).await?;
        if !out.status.success() {
            return Err(Error::Internal(anyhow::anyhow!(
                "launchctl list failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(parse_list_output(&String::from_utf8_lossy(&out.stdout), label))
    }
}

/// Parse `launchctl list` output: tab-separated `PID  Status  Label`
/// rows, `-` standing for "no pid".
fn parse_list_output(output: &str, label: &str) -> UnitStatus {
    for line in output.lines().skip(1) {
        let mut cols = line.split_whitespace();
        let (Some(pid_col), Some(status_col), Some(label_col)) =
            (cols.next(), cols.next(), cols.next())
        else {
            continue;
        };
        if label_col != label {
            continue;
        }
        let pid = pid_col.parse::<u32>().ok();
        return UnitStatus {
            loaded: true,
            running: pid.is_some(),
            pid,
            last_exit_code: status_col.parse::<i32>().ok(),
        };
    }
    UnitStatus::default()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, BackendPaths, TuningDefaults};

    // -----------------------------------------------------------------------
    // launchctl list parsing
    // -----------------------------------------------------------------------

    const LIST_OUTPUT: &str = "\
PID\tStatus\tLabel
312\t0\tcom.llamafleet.qwen
-\t78\tcom.llamafleet.crashy
-\t0\tcom.llamafleet.idle
";

    #[test]
    fn parses_running_unit_with_pid() {
        let status = parse_list_output(LIST_OUTPUT, "com.llamafleet.qwen");
        assert!(status.loaded);
        assert!(status.running);
        assert_eq!(status.pid, Some(312));
        assert_eq!(status.last_exit_code, Some(0));
    }

    #[test]
    fn parses_throttled_unit() {
        let status = parse_list_output(LIST_OUTPUT, "com.llamafleet.crashy");
        assert!(status.loaded);
        assert!(!status.running);
        assert!(status.is_throttled());
    }

    #[test]
    fn unknown_label_is_not_loaded() {
        let status = parse_list_output(LIST_OUTPUT, "com.llamafleet.ghost");
        assert!(!status.loaded);
        assert!(!status.running);
    }

    // -----------------------------------------------------------------------
    // Plist rendering
    // -----------------------------------------------------------------------

    fn spec_fixture() -> UnitSpec {
        let backend = BackendConfig::new(
            "m.gguf",
            Path::new("/models/m.gguf"),
            9000,
            BackendPaths {
                plist: "/tmp/agents/com.llamafleet.m.plist".into(),
                stdout: "/tmp/logs/m.stdout".into(),
                stderr: "/tmp/logs/m.stderr".into(),
                http_log: "/tmp/logs/m.http".into(),
            },
            &TuningDefaults::default(),
        );
        UnitSpec::for_backend(Path::new("/usr/local/bin/llama-server"), &backend)
    }

    #[test]
    fn plist_contains_label_argv_and_keepalive() {
        let xml = spec_fixture().render();
        assert!(xml.contains("<string>com.llamafleet.m</string>"));
        assert!(xml.contains("<string>/usr/local/bin/llama-server</string>"));
        assert!(xml.contains("<string>--model</string>"));
        assert!(xml.contains("<string>/models/m.gguf</string>"));
        assert!(xml.contains("<key>Crashed</key>\n        <true/>"));
        assert!(xml.contains("<key>SuccessfulExit</key>\n        <false/>"));
        assert!(xml.contains("<key>ThrottleInterval</key>\n    <integer>10</integer>"));
    }

    #[test]
    fn plist_escapes_xml_metacharacters() {
        let mut spec = spec_fixture();
        spec.program_args.push("/models/a&b<c>.gguf".into());
        let xml = spec.render();
        assert!(xml.contains("a&amp;b&lt;c&gt;"));
        assert!(!xml.contains("a&b<c>"));
    }

    #[test]
    fn router_unit_invokes_the_router_subcommand() {
        let router = crate::config::RouterConfig::with_defaults(
            "/tmp/agents/com.llamafleet.router.plist".into(),
            "/tmp/logs/router.stdout".into(),
            "/tmp/logs/router.stderr".into(),
        );
        let spec = UnitSpec::for_router(Path::new("/usr/local/bin/llama-fleet"), &router);
        assert_eq!(spec.program_args, vec!["/usr/local/bin/llama-fleet", "router"]);
        assert_eq!(spec.label, "com.llamafleet.router");
    }

    #[test]
    fn write_and_remove_unit_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec_fixture();
        spec.plist_path = dir.path().join("com.llamafleet.m.plist");
        spec.write().unwrap();
        assert!(spec.plist_path.exists());
        remove_unit(&spec.plist_path).unwrap();
        assert!(!spec.plist_path.exists());
        // Removing again is fine.
        remove_unit(&spec.plist_path).unwrap();
    }

    // -----------------------------------------------------------------------
    // Wait helpers against the mock
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn wait_for_start_returns_once_running() {
        let supervisor = mock::MockSupervisor::new();
        supervisor.start("x").await.unwrap();
        let status = supervisor
            .wait_for_start("x", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(status.running);
        assert!(status.pid.is_some());
    }

    #[tokio::test]
    async fn wait_for_start_times_out_on_wedged_unit() {
        let supervisor = mock::MockSupervisor::new();
        supervisor.wedge("x");
        supervisor.start("x").await.unwrap();
        let err = supervisor
            .wait_for_start("x", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not report running"));
    }

    #[tokio::test]
    async fn wait_for_stop_observes_stop() {
        let supervisor = mock::MockSupervisor::new();
        supervisor.start("x").await.unwrap();
        supervisor.stop("x").await.unwrap();
        supervisor
            .wait_for_stop("x", Duration::from_secs(1))
            .await
            .unwrap();
    }
}
