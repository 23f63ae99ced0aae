#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use vreserve::core::config::{ResolverConfig, ServerConfig};
use vreserve::daemon::server::{ServiceHandle, VolumeService};
use vreserve::ledger::registry::LedgerRegistry;
use vreserve::logger::activity::{
    ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger,
};
use vreserve::logger::jsonl::{JsonlConfig, Severity};
use vreserve::platform::pal::MockPlatform;

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_vreserve"))
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    run_cli_case_with_env(case_name, args, &[])
}

/// Run the binary, keeping a transcript under the temp dir for post-mortems.
pub fn run_cli_case_with_env(case_name: &str, args: &[&str], env: &[(&str, &str)]) -> CmdResult {
    let root = std::env::temp_dir().join("vreserve-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    command
        .args(args)
        .env_remove("VRESERVE_OUTPUT_FORMAT")
        .env("RUST_BACKTRACE", "1");
    for (key, value) in env {
        command.env(key, value);
    }
    let output = command.output().expect("execute vreserve command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// A service on an ephemeral loopback port backed by a [`MockPlatform`].
pub struct TestService {
    pub platform: Arc<MockPlatform>,
    pub registry: Arc<LedgerRegistry>,
    pub base_url: String,
    pub log_path: PathBuf,
    handle: Option<ServiceHandle>,
    activity: ActivityLoggerHandle,
    logger: Option<JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl TestService {
    pub fn start(mounts: &[(&str, u64)]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("activity.jsonl");
        let (activity, logger) = spawn_logger(ActivityLoggerConfig {
            jsonl: JsonlConfig {
                path: Some(log_path.clone()),
                fallback_path: None,
                min_severity: Severity::Info,
                max_size_bytes: 4 << 20,
                max_rotated_files: 1,
                fsync_interval_secs: 60,
            },
            channel_capacity: 4096,
        })
        .expect("spawn logger");

        let platform = Arc::new(MockPlatform::with_mounts(mounts));
        let registry = Arc::new(
            LedgerRegistry::new(platform.clone(), &ResolverConfig::default())
                .with_activity_logger(activity.clone()),
        );
        let server_config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            worker_threads: 4,
            recv_timeout_ms: 50,
        };
        let handle = VolumeService::bind(&server_config, Arc::clone(&registry), activity.clone())
            .expect("bind service")
            .spawn()
            .expect("spawn service");
        let base_url = format!("http://{}", handle.local_addr());

        Self {
            platform,
            registry,
            base_url,
            log_path,
            handle: Some(handle),
            activity,
            logger: Some(logger),
            _dir: dir,
        }
    }

    /// Stop the workers and the logger, then return every logged line.
    pub fn stop(mut self) -> Vec<serde_json::Value> {
        self.shutdown_inner();
        read_log(&self.log_path)
    }

    fn shutdown_inner(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().expect("service shutdown");
        }
        if let Some(logger) = self.logger.take() {
            self.activity.shutdown();
            let _ = logger.join();
        }
    }
}

impl Drop for TestService {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

pub fn read_log(path: &Path) -> Vec<serde_json::Value> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("log line is JSON"))
        .collect()
}

/// Poll `f` until it returns true or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    f()
}
