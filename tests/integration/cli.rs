use std::fs;
use std::process::{Command, Output};

fn taskloom(
    dir: &tempfile::TempDir,
    args: &[&str],
) -> Output {
    let config = dir.path().join("config.toml");
    if !config.exists() {
        fs::write(&config, "thread_name = \"cli-worker\"\n").unwrap();
    }
    Command::new(env!("CARGO_BIN_EXE_taskloom"))
        .arg("--config")
        .arg(&config)
        .args(args)
        .env_remove("TASKLOOM_MAX_THREADS")
        .env_remove("TASKLOOM_DEFAULT_TIMEOUT_MS")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to spawn taskloom")
}

#[test]
fn test_config_command_prints_effective_config() {
    let dir = tempfile::TempDir::new().unwrap();
    let output = taskloom(&dir, &["--max-threads", "3", "config"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("max_threads = 3"), "{}", stdout);
    assert!(stdout.contains("thread_name = \"cli-worker\""), "{}", stdout);
}

#[test]
fn test_missing_plan_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let output = taskloom(&dir, &["run", "no-such-plan.toml"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to load plan"));
}

#[cfg(unix)]
#[test]
fn test_run_plan() {
    let dir = tempfile::TempDir::new().unwrap();
    let plan = dir.path().join("plan.toml");
    fs::write(
        &plan,
        r#"
        [[task]]
        tag = "parser"
        command = "true"

        [[task]]
        tag = "write-json"
        command = "true"
        depends_on = ["parser"]
        priority = 5
        "#,
    )
    .unwrap();

    let output = taskloom(&dir, &["run", plan.to_str().unwrap()]);
    assert!(output.status.success(), "{:?}", output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("parser"));
    assert!(lines[1].starts_with("write-json"));
    assert!(lines.iter().all(|line| line.contains("Completed")));
}

#[cfg(unix)]
#[test]
fn test_failing_plan_exits_nonzero() {
    let dir = tempfile::TempDir::new().unwrap();
    let plan = dir.path().join("plan.toml");
    fs::write(&plan, "[[task]]\ntag = \"broken\"\ncommand = \"false\"\n").unwrap();

    let output = taskloom(&dir, &["run", plan.to_str().unwrap()]);
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("broken"));
    assert!(stdout.contains("Failed"));
    assert!(String::from_utf8_lossy(&output.stderr).contains("1 of 1 tasks did not complete"));
}
