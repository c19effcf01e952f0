//! CLI contract tests.

use assert_cmd::Command;

fn cmd_with_data_dir(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("shoebox").expect("binary builds");
    cmd.env("SHOEBOX_DATA_DIR", dir);
    // Point at a config path that does not exist so host configs never leak in.
    cmd.env("SHOEBOX_CONFIG_PATH", dir.join("no-such-config.toml"));
    cmd
}

#[test]
fn help_lists_every_subcommand() {
    let mut cmd = Command::cargo_bin("shoebox").expect("binary builds");
    let assert = cmd.arg("--help").assert().success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    for subcommand in [
        "start-processor",
        "view-events",
        "view-prompts",
        "reprocess",
        "search",
    ] {
        assert!(output.contains(subcommand), "--help missing {subcommand}");
    }
}

#[test]
fn start_processor_flags_are_accepted() {
    let mut cmd = Command::cargo_bin("shoebox").expect("binary builds");
    let assert = cmd.args(["start-processor", "--help"]).assert().success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    assert!(output.contains("--once"));
    assert!(output.contains("--doc-id"));
}

#[test]
fn start_processor_without_api_key_refuses_to_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cmd = cmd_with_data_dir(dir.path());
    cmd.env_remove("SHOEBOX_ANTHROPIC_API_KEY");
    cmd.args(["start-processor", "--once"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("no LLM API key configured"));
}

#[test]
fn view_events_on_unknown_document_reports_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    cmd_with_data_dir(dir.path())
        .args(["view-events", "00000000-0000-0000-0000-000000000042"])
        .assert()
        .success()
        .stdout(predicates::str::contains("no events"));
}

#[test]
fn view_events_rejects_unknown_category() {
    let dir = tempfile::tempdir().expect("tempdir");
    cmd_with_data_dir(dir.path())
        .args([
            "view-events",
            "00000000-0000-0000-0000-000000000042",
            "--category",
            "nonsense",
        ])
        .assert()
        .failure()
        .stderr(predicates::str::contains("unknown event category"));
}

#[test]
fn view_prompts_on_fresh_database_reports_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    cmd_with_data_dir(dir.path())
        .args(["view-prompts"])
        .assert()
        .success()
        .stdout(predicates::str::contains("no prompts"));
}

#[test]
fn reprocess_requires_a_failed_document() {
    let dir = tempfile::tempdir().expect("tempdir");
    cmd_with_data_dir(dir.path())
        .args(["reprocess", "00000000-0000-0000-0000-000000000042"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("not a failed document"));
}

#[test]
fn search_on_fresh_database_reports_no_matches() {
    let dir = tempfile::tempdir().expect("tempdir");
    cmd_with_data_dir(dir.path())
        .args(["search", "pacific"])
        .assert()
        .success()
        .stdout(predicates::str::contains("no matches"));
}
