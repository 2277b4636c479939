//! End-to-end tests running the actual spicepack binary.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Output},
};
use tempfile::TempDir;

fn run_spicepack(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_spicepack"))
        .args(args)
        .output()
        .expect("Failed to execute spicepack")
}

fn entry(artifact: &Path, name: &str) -> Vec<u8> {
    let mut archive = zip::ZipArchive::new(fs::File::open(artifact).unwrap()).unwrap();
    let mut out = Vec::new();
    archive
        .by_name(name)
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    out
}

#[test]
fn help_exits_zero_and_names_the_default_version() {
    let output = run_spicepack(&["--help"]);
    assert!(output.status.success());

    let help = String::from_utf8_lossy(&output.stdout);
    assert!(help.contains("--bundle-format-version"));
    assert!(help.contains("default 2"));
}

#[test]
fn version_exits_zero() {
    let output = run_spicepack(&["--version"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("spicepack"));
}

#[test]
fn missing_mode_exits_one_with_error() {
    let output = run_spicepack(&["--skip-key", "-e"]);
    assert_eq!(output.status.code(), Some(1));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--adg") || stderr.contains("--deployment-events"));
}

#[test]
fn both_modes_exit_one() {
    let input = TempDir::new().unwrap();
    let file = input.path().join("events.json");
    fs::write(&file, "{}").unwrap();

    let output = run_spicepack(&[
        "--skip-key",
        "-e",
        "--adg",
        input.path().to_str().unwrap(),
        "--deployment-events",
        file.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("mutually exclusive"));
}

#[test]
fn missing_token_without_skip_key_exits_one() {
    let input = TempDir::new().unwrap();
    let output = run_spicepack(&["-e", "--adg", input.path().to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--jwt"));
}

#[test]
fn encrypt_only_skip_key_prints_the_artifact_path() {
    let input = TempDir::new().unwrap();
    let file = input.path().join("events.json");
    fs::write(&file, "[{\"event\":\"deploy\"}]").unwrap();

    let out = TempDir::new().unwrap();

    let output = run_spicepack(&[
        "--skip-key",
        "--encrypt-only",
        "--deployment-events",
        file.to_str().unwrap(),
        "--output",
        out.path().to_str().unwrap(),
        "--comment-no-sensitive-info",
        "smoke test",
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let artifact = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
    assert!(artifact.exists());
    assert!(artifact.starts_with(out.path()));

    assert_eq!(entry(&artifact, "uuid.txt"), b"plaintext_upload");
    assert_eq!(entry(&artifact, "payload_container_type.txt"), b"file");
    assert_eq!(
        entry(&artifact, "mime.txt"),
        b"application/vnd.info.deployevent"
    );
    assert_eq!(entry(&artifact, "comment.txt"), b"smoke test");
    assert_eq!(entry(&artifact, "payload.enc"), b"[{\"event\":\"deploy\"}]");
}

#[test]
fn extra_args_are_expanded() {
    let input = TempDir::new().unwrap();
    fs::write(input.path().join("a.adg"), "x").unwrap();

    let out = TempDir::new().unwrap();

    let output = run_spicepack(&[
        "--adg",
        input.path().to_str().unwrap(),
        "--extra-args",
        &format!(
            "--skip-key,--encrypt-only,--output,{},--bundle-format-version,1",
            out.path().to_str().unwrap()
        ),
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let artifact = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
    assert_eq!(entry(&artifact, "bundle_format_version.txt"), b"1");
    assert_eq!(entry(&artifact, "payload_container_type.txt"), b"tar");
}
