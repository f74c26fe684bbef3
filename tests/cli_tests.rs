use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

fn shipped_formulas() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("Formula")
}

/// A scratch directory with a config file pointing at `formula_dir`.
fn setup(formula_dir: &Path) -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.toml");
    let content = format!(
        "formula_dir = {:?}\nprefix = {:?}\ncache_sources = false\n",
        formula_dir.to_string_lossy(),
        dir.path().join("Cellar").to_string_lossy(),
    );
    fs::write(&config, content).unwrap();
    (dir, config)
}

fn formulary(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("formulary").unwrap();
    cmd.arg("--config").arg(config);
    cmd
}

#[test]
fn test_check_lists_aliases() {
    let (_dir, config) = setup(&shipped_formulas());
    let output = formulary(&config)
        .arg("check")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let output_str = String::from_utf8_lossy(&output);
    assert!(output_str.contains("namzd: 1.4.6 (alias of zipcmt)"));
    assert!(output_str.contains("zipcmt: 1.4.6 (alias of namzd)"));
    assert!(output_str.contains("2 formulas registered"));
}

#[test]
fn test_check_fails_on_integrity_conflict() {
    let formulas = tempdir().unwrap();
    let original = fs::read_to_string(shipped_formulas().join("zipcmt.toml")).unwrap();
    let rerelease = original.replace(
        "d5558cd419c8d46bdc958064cb97f963d1ea793866414c025906ec15033512ed",
        "d5558cd419c8d46bdc958064cb97f963d1ea793866414c025906ec15033510d3",
    );
    fs::write(formulas.path().join("zipcmt.toml"), format!("{original}\n{rerelease}")).unwrap();
    let (_dir, config) = setup(formulas.path());

    let output = formulary(&config)
        .arg("check")
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8_lossy(&output);
    assert!(stderr.contains("integrity conflict for zipcmt 1.4.6"));
}

#[test]
fn test_aliases_and_info() {
    let (_dir, config) = setup(&shipped_formulas());
    formulary(&config)
        .args(["aliases", "zipcmt"])
        .assert()
        .success()
        .stdout("namzd\n");

    let output = formulary(&config)
        .args(["info", "namzd", "--version", "1.4.6"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let output_str = String::from_utf8_lossy(&output);
    assert!(output_str.contains("https://github.com/bengarrett/namzd/archive/refs/tags/v1.4.6.tar.gz"));
    assert!(output_str.contains("aliases:  zipcmt"));
    assert!(output_str.contains("not installed"));
}

#[test]
fn test_unknown_formula_fails() {
    let (_dir, config) = setup(&shipped_formulas());
    let output = formulary(&config)
        .args(["info", "ripgrep"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&output).contains("formula not found: ripgrep"));
}

#[test]
fn test_flags_embed_version_metadata() {
    let (_dir, config) = setup(&shipped_formulas());
    let output = formulary(&config)
        .args(["flags", "zipcmt"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let output_str = String::from_utf8_lossy(&output);
    assert!(output_str.contains("-trimpath"));
    assert!(output_str.contains(
        "-ldflags=-s -w -X main.version=1.4.6 -X main.commit=4bb4c718fb9825efb22539b9311165837faacddc -X main.date=2026-02-06T20:58:46+11:00"
    ));
}

#[test]
fn test_install_requires_a_name_or_all() {
    let (_dir, config) = setup(&shipped_formulas());
    formulary(&config).arg("install").assert().failure();
}

#[cfg(unix)]
#[test]
fn test_verify_artifact() {
    let (dir, config) = setup(&shipped_formulas());
    let artifact = dir.path().join("zipcmt");
    fs::write(&artifact, "#!/bin/sh\necho \"zipcmt version 1.4.6\"\n").unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&artifact, fs::Permissions::from_mode(0o755)).unwrap();
    }

    formulary(&config)
        .arg("verify")
        .arg(&artifact)
        .arg("zipcmt")
        .assert()
        .success();

    formulary(&config)
        .arg("verify")
        .arg(&artifact)
        .arg("namzd")
        .assert()
        .failure();
}
