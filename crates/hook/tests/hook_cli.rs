use assert_cmd::Command;

fn bin() -> Command {
    Command::cargo_bin("appear-hook").unwrap()
}

fn stdout_of(assert: &assert_cmd::assert::Assert) -> String {
    String::from_utf8_lossy(&assert.get_output().stdout).into_owned()
}

#[test]
fn empty_stdin_is_rejected() {
    let assert = bin().write_stdin("").assert().failure();
    assert!(stdout_of(&assert).contains("invalid hook input"));
}

#[test]
fn malformed_hook_line_is_rejected() {
    let assert = bin().write_stdin("one two\n").assert().failure();
    assert!(stdout_of(&assert).contains("invalid hook input"));
}

#[test]
fn unreachable_relay_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let assert = bin()
        .current_dir(dir.path())
        .env("APPEAR_RELAY_ADDR", "127.0.0.1:1")
        .write_stdin("aaaa bbbb refs/heads/master\n")
        .assert()
        .failure();
    assert!(stdout_of(&assert).contains("internal TCP server error"));
}
