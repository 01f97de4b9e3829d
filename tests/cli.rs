use assert_cmd::Command;
use tempfile::tempdir;

const FRAGMENT_SCRIPT: &str = r#"printf '{"version":1,"files":{"app.py":{"statements":[1,2,3,4],"executed":[1,2]}}}' > .coverage.ci.$1.$$.000001"#;

fn relay() -> Command {
    Command::cargo_bin("coverage-relay").expect("binary present")
}

#[test]
fn produce_then_collect_round_trip() {
    let temp = tempdir().unwrap();
    let share = temp.path().join("share");

    for host in ["alpha", "beta"] {
        let container = temp.path().join(host);
        std::fs::create_dir_all(&container).unwrap();
        relay()
            .current_dir(&container)
            .args(["produce", "--store"])
            .arg(&share)
            .args(["--run-segment", "build-7", "--", "sh", "-c", FRAGMENT_SCRIPT, "sh", host])
            .assert()
            .success();
    }

    let output = relay()
        .current_dir(temp.path())
        .args(["collect", "--store"])
        .arg(&share)
        .args(["--workdir"])
        .arg(temp.path().join("report"))
        .args(["--run-segment", "build-7", "--show-missing"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let text = String::from_utf8(output).unwrap();
    let row: Vec<_> = text
        .lines()
        .find(|line| line.starts_with("app.py"))
        .expect("app.py row")
        .split_whitespace()
        .collect();
    assert_eq!(row, vec!["app.py", "4", "2", "50%", "3-4"]);
    assert!(temp.path().join("report").join(".coverage").is_file());
}

#[test]
fn failing_tests_fail_the_step() {
    let temp = tempdir().unwrap();
    let share = temp.path().join("share");

    relay()
        .current_dir(temp.path())
        .args(["produce", "--store"])
        .arg(&share)
        .args(["--tick", "0", "--", "sh", "-c", "exit 3"])
        .assert()
        .failure();

    assert!(
        std::fs::read_dir(&share)
            .map(|entries| entries.count() == 0)
            .unwrap_or(true)
    );
}

#[test]
fn collect_reports_missing_tick() {
    let temp = tempdir().unwrap();
    let output = relay()
        .current_dir(temp.path())
        .args(["collect", "--store"])
        .arg(temp.path().join("share"))
        .args(["--expected", "2"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();

    let stderr = String::from_utf8_lossy(&output);
    assert!(stderr.contains("coverage.0"), "{stderr}");
}

#[test]
fn strategy_flags_are_mutually_exclusive() {
    let temp = tempdir().unwrap();
    relay()
        .current_dir(temp.path())
        .args([
            "produce",
            "--store",
            "share",
            "--tick",
            "1",
            "--run-segment",
            "x",
            "--",
            "true",
        ])
        .assert()
        .failure();
}

#[test]
fn validate_accepts_bundled_pipeline() {
    relay()
        .args(["validate", "pipelines/python-matrix.yaml"])
        .assert()
        .success();
}

#[test]
fn alias_forwards_arguments_and_status() {
    Command::cargo_bin("crelay")
        .expect("alias binary present")
        .args(["validate", "pipelines/python-matrix-ticks.yaml"])
        .assert()
        .success();

    Command::cargo_bin("crelay")
        .expect("alias binary present")
        .args(["validate", "pipelines/does-not-exist.yaml"])
        .assert()
        .failure();
}
