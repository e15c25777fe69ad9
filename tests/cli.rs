use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tempfile::TempDir;

const SECRET: &str = "integration-secret";

fn msync_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("msync");
    path
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn setup_test_env(port: u16) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Create project files
    let src = root.join("proj/src");
    fs::create_dir_all(&src).unwrap();
    fs::write(
        src.join("alpha.ts"),
        "export function alpha() {\n  return 'a';\n}\n",
    )
    .unwrap();
    fs::write(
        src.join("beta.ts"),
        "export function beta() {\n  return 'b';\n}\n",
    )
    .unwrap();
    fs::write(root.join("proj/README.md"), "# not tracked\n").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/msync.sqlite"

[project]
id = "demo"
root = "{root}/proj"
extensions = ["ts"]

[client]
server_url = "http://127.0.0.1:{port}"
timeout_secs = 10

[server]
bind = "127.0.0.1:{port}"
"#,
        root = root.display(),
        port = port
    );

    let config_path = config_dir.join("msync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn command(config_path: &Path, args: &[&str], envs: &[(&str, &str)]) -> Command {
    let mut cmd = Command::new(msync_binary());
    cmd.arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("MSYNC_TOKEN")
        .env_remove("MSYNC_AUTH_SECRET")
        .env("RUST_LOG", "warn");
    for (k, v) in envs {
        cmd.env(k, v);
    }
    cmd
}

fn run_msync(config_path: &Path, args: &[&str], envs: &[(&str, &str)]) -> (String, String, bool) {
    let output = command(config_path, args, envs)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run msync binary at {:?}: {}", msync_binary(), e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

struct ServerGuard(Child);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env(find_free_port());

    let (stdout, stderr, success) = run_msync(&config_path, &["init"], &[]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Database initialized"));

    let (_, _, success) = run_msync(&config_path, &["init"], &[]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_status_before_snapshot() {
    let (_tmp, config_path) = setup_test_env(find_free_port());
    let (stdout, _, success) = run_msync(&config_path, &["status"], &[]);
    assert!(success);
    assert!(stdout.contains("No snapshot yet"));
}

#[test]
fn test_snapshot_marks_every_file_dirty() {
    let (_tmp, config_path) = setup_test_env(find_free_port());

    let (stdout, stderr, success) = run_msync(&config_path, &["snapshot"], &[]);
    assert!(success, "snapshot failed: {}", stderr);
    assert!(stdout.contains("files:   2"), "got: {}", stdout);
    assert!(stdout.contains("dirty:   2"));

    let (stdout, _, _) = run_msync(&config_path, &["status"], &[]);
    assert!(stdout.contains("src/alpha.ts"));
    assert!(stdout.contains("src/beta.ts"));
    assert!(!stdout.contains("README.md"));
    assert!(stdout.contains("synced:  never"));
}

#[test]
fn test_mark_applies_edit_and_delete() {
    let (tmp, config_path) = setup_test_env(find_free_port());
    run_msync(&config_path, &["snapshot"], &[]);
    let (before, _, _) = run_msync(&config_path, &["status"], &[]);

    fs::write(
        tmp.path().join("proj/src/alpha.ts"),
        "export function alpha() {\n  return 'A';\n}\n",
    )
    .unwrap();
    fs::remove_file(tmp.path().join("proj/src/beta.ts")).unwrap();

    let (stdout, stderr, success) = run_msync(
        &config_path,
        &["mark", "src/alpha.ts", "src/beta.ts"],
        &[],
    );
    assert!(success, "mark failed: {}", stderr);
    assert!(stdout.contains("changed: 2"), "got: {}", stdout);

    let (after, _, _) = run_msync(&config_path, &["status"], &[]);
    assert!(after.contains("files:   1"));
    assert_ne!(
        before.lines().find(|l| l.starts_with("root:")),
        after.lines().find(|l| l.starts_with("root:"))
    );

    // Unchanged content is not a change
    let (stdout, _, _) = run_msync(&config_path, &["mark", "src/alpha.ts"], &[]);
    assert!(stdout.contains("changed: 0"));
}

#[test]
fn test_token_requires_secret() {
    let (_tmp, config_path) = setup_test_env(find_free_port());

    let (_, stderr, success) = run_msync(&config_path, &["token", "alice"], &[]);
    assert!(!success);
    assert!(stderr.contains("MSYNC_AUTH_SECRET"));

    let (stdout, _, success) = run_msync(
        &config_path,
        &["token", "alice"],
        &[("MSYNC_AUTH_SECRET", SECRET)],
    );
    assert!(success);
    let token = stdout.trim();
    let (caller, signature) = token.rsplit_once('.').unwrap();
    assert_eq!(caller, "alice");
    assert_eq!(signature.len(), 64);
}

#[test]
fn test_sync_requires_credential() {
    let (_tmp, config_path) = setup_test_env(find_free_port());
    let (_, stderr, success) = run_msync(&config_path, &["sync"], &[]);
    assert!(!success);
    assert!(stderr.contains("MSYNC_TOKEN"));
}

/// Serve, full index, no-op, incremental, then cache maintenance.
#[tokio::test]
async fn test_serve_and_sync_end_to_end() {
    let port = find_free_port();
    let (tmp, config_path) = setup_test_env(port);
    run_msync(&config_path, &["init"], &[]);

    let child = command(&config_path, &["serve"], &[("MSYNC_AUTH_SECRET", SECRET)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to start msync serve");
    let _server = ServerGuard(child);
    wait_for_server(port).await;

    let (token, _, _) = run_msync(
        &config_path,
        &["token", "alice"],
        &[("MSYNC_AUTH_SECRET", SECRET)],
    );
    let env = [("MSYNC_TOKEN", token.trim())];

    let (stdout, stderr, success) = run_msync(&config_path, &["sync"], &env);
    assert!(success, "first sync failed: {}", stderr);
    assert!(stdout.contains("Full index: 2 fragments sent"), "got: {}", stdout);

    let (stdout, _, success) = run_msync(&config_path, &["sync"], &env);
    assert!(success);
    assert!(stdout.contains("Up to date"), "got: {}", stdout);

    fs::write(
        tmp.path().join("proj/src/beta.ts"),
        "export function beta() {\n  return 'B';\n}\n",
    )
    .unwrap();
    run_msync(&config_path, &["mark", "src/beta.ts"], &[]);
    let (stdout, stderr, success) = run_msync(&config_path, &["sync"], &env);
    assert!(success, "incremental sync failed: {}", stderr);
    assert!(
        stdout.contains("Synced: 1 fragments checked, 1 sent"),
        "got: {}",
        stdout
    );

    let (stdout, _, success) = run_msync(&config_path, &["cache", "stats"], &[]);
    assert!(success);
    assert!(stdout.contains("fragments: 3"), "got: {}", stdout);
    assert!(stdout.contains("projects:  1"));

    let (stdout, _, success) = run_msync(&config_path, &["cache", "sweep"], &[]);
    assert!(success);
    assert!(stdout.contains("Removed 0 expired entries."));
}
