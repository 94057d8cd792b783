use beacon_core::signer::create_signature;
use std::fs;
use std::path::PathBuf;
use std::process::Output;
use tempfile::TempDir;

/// Nothing listens on the discard port, so every send fails fast
const UNREACHABLE_ENDPOINT: &str = "http://127.0.0.1:9/v1/events";

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_cache: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_cache = base.join("xdg-cache");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state, &xdg_cache] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_cache,
        }
    }

    /// Same environment with a config file pointing at an unreachable endpoint
    fn configured() -> Self {
        Self::configured_with_batch_size(10)
    }

    fn configured_with_batch_size(batch_size: usize) -> Self {
        let env = Self::new();
        env.write_config(&format!(
            r#"
[tracker]
api_key = "bk_test_secret"
project_id = "cli-tests"
environment = "dev"
batch_size = {batch_size}
max_retries = 0
timeout_secs = 2
endpoint = "{UNREACHABLE_ENDPOINT}"
"#
        ));
        env
    }

    fn write_config(&self, content: &str) {
        let dir = self.xdg_config.join("beacon");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), content).expect("failed to write config");
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("beacon/offline.db")
    }
}

fn command(env: &CliTestEnv, args: &[&str]) -> assert_cmd::Command {
    let mut command = assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("beacon"));
    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_CACHE_HOME", &env.xdg_cache)
        .env_remove("BEACON_API_KEY")
        .env_remove("RUST_LOG");
    command
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    command(env, args)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute beacon: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "beacon {} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        args.join(" "),
        output.status,
        stdout,
        stderr
    );
}

fn stdout_of(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run_bin(env, args);
    assert_success(args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn status_reports_defaults_without_config() {
    let env = CliTestEnv::new();

    let stdout = stdout_of(&env, &["status"]);
    assert!(stdout.contains("Beacon Tracker Configuration"));
    assert!(stdout.contains("Endpoint:        https://ingest.beacon.dev/v1/events"));
    assert!(stdout.contains("Batch size:      10"));
    assert!(
        stdout.contains("Configuration is incomplete"),
        "missing credentials should be reported, got:\n{stdout}"
    );
    assert!(stdout.contains("Cached events:   0"));
}

#[test]
fn status_reads_config_file_and_env_override() {
    let env = CliTestEnv::configured();

    let output = command(&env, &["status"])
        .env("BEACON_API_KEY", "bk_from_environment")
        .output()
        .expect("failed to execute beacon");
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Project:         cli-tests"));
    assert!(stdout.contains("API key:         bk_f****"));
    assert!(stdout.contains("Environment:     dev"));
    assert!(!stdout.contains("Configuration is incomplete"));
}

#[test]
fn cache_show_on_empty_cache() {
    let env = CliTestEnv::configured();

    let stdout = stdout_of(&env, &["cache", "show"]);
    assert!(stdout.contains("Offline cache is empty"));
}

#[test]
fn undeliverable_event_lands_in_offline_cache() {
    let env = CliTestEnv::configured();
    let event = r#"{"type":"page_viewed","data":{"path":"/pricing"}}"#;

    let stdout = stdout_of(&env, &["track", event]);
    assert!(stdout.contains("Tracked page_viewed in session"));
    assert!(
        stdout.contains("1 event(s) waiting in the offline cache"),
        "expected the event to be cached, got:\n{stdout}"
    );
    assert!(env.db_path().exists(), "SQLite cache should be created");

    let shown = stdout_of(&env, &["cache", "show"]);
    assert!(shown.contains("1 cached event(s) in sqlite storage"));
    assert!(shown.contains("\"/pricing\""));
    assert!(shown.contains("\"sessionId\""));

    // Still unreachable: the cached event is restored, fails again, and is cached again
    let flushed = stdout_of(&env, &["flush"]);
    assert!(flushed.contains("Delivered 0 of 1 cached event(s)"));
    assert!(flushed.contains("1 event(s) waiting in the offline cache"));

    let cleared = stdout_of(&env, &["cache", "clear"]);
    assert!(cleared.contains("Offline cache cleared"));
    let status = stdout_of(&env, &["status"]);
    assert!(status.contains("Cached events:   0"));
}

#[test]
fn cached_events_survive_repeated_runs_beyond_batch_size() {
    let env = CliTestEnv::configured_with_batch_size(2);

    // Each run restores the cache, fills a batch, fails to send and caches again
    for i in 0..5 {
        let event = format!(r#"{{"type":"page_viewed","data":{{"path":"/step/{i}"}}}}"#);
        let stdout = stdout_of(&env, &["track", &event]);
        assert!(
            stdout.contains(&format!("{} event(s) waiting in the offline cache", i + 1)),
            "run {i} lost cached events, got:\n{stdout}"
        );
    }

    let flushed = stdout_of(&env, &["flush"]);
    assert!(flushed.contains("Delivered 0 of 5 cached event(s)"));
    assert!(flushed.contains("5 event(s) waiting in the offline cache"));

    let shown = stdout_of(&env, &["cache", "show"]);
    assert!(shown.contains("5 cached event(s)"));
    for i in 0..5 {
        assert!(shown.contains(&format!("\"/step/{i}\"")));
    }
}

#[test]
fn track_rejects_unknown_event_type() {
    let env = CliTestEnv::configured();

    let output = run_bin(&env, &["track", r#"{"type":"teleported","data":{}}"#]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid event JSON"), "got:\n{stderr}");
}

#[test]
fn flush_with_empty_cache_is_a_no_op() {
    let env = CliTestEnv::configured();

    let stdout = stdout_of(&env, &["flush"]);
    assert!(stdout.contains("nothing to flush"));
}

#[test]
fn sign_matches_library_signature() {
    let env = CliTestEnv::configured();
    let payload = r#"{"events":[]}"#;

    let output = command(&env, &["sign"])
        .write_stdin(payload)
        .output()
        .expect("failed to execute beacon");
    assert_success(&["sign"], &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), create_signature(payload, "bk_test_secret"));

    let output = command(&env, &["sign", "--key", "other"])
        .write_stdin(payload)
        .output()
        .expect("failed to execute beacon");
    assert_success(&["sign", "--key", "other"], &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), create_signature(payload, "other"));
}

#[test]
fn sign_without_key_fails() {
    let env = CliTestEnv::new();

    let output = command(&env, &["sign"])
        .write_stdin("payload")
        .output()
        .expect("failed to execute beacon");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no signing key"));
}
