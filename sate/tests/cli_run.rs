//! CLI tests for `sate run` and `sate export-config`.
//!
//! Spawns the sate binary and verifies exit codes and written files. No test
//! here runs a real external tool.

use std::fs;
use std::process::Command;

use sate::exit_codes;
use sate::io::config::load_config;

#[test]
fn export_config_writes_resolved_settings() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = temp.path().join("settings.toml");
    fs::write(&settings, "[commandline]\njob = \"my job!\"\n[sate]\niter_limit = 4\n")
        .expect("write settings");
    let output = temp.path().join("resolved.toml");

    let status = Command::new(env!("CARGO_BIN_EXE_sate"))
        .arg("export-config")
        .arg(&settings)
        .args(["--set", "sate.max_subproblem_size=50"])
        .arg("--output")
        .arg(&output)
        .status()
        .expect("sate export-config");

    assert_eq!(status.code(), Some(exit_codes::OK));
    let cfg = load_config(&[output], &[]).expect("reload exported config");
    assert_eq!(cfg.commandline.job, "myjob");
    assert_eq!(cfg.sate.iter_limit, Some(4));
    assert_eq!(cfg.sate.max_subproblem_size, 50);
}

#[test]
fn unknown_setting_is_rejected_before_running() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = temp.path().join("settings.toml");
    fs::write(&settings, "[sate]\nmax_subproblem_sise = 3\n").expect("write settings");

    let output = Command::new(env!("CARGO_BIN_EXE_sate"))
        .arg("run")
        .arg(&settings)
        .output()
        .expect("sate run");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("max_subproblem_sise"), "{stderr}");
}

#[test]
fn run_without_input_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = temp.path().join("settings.toml");
    fs::write(&settings, "[sate]\niter_limit = 1\n").expect("write settings");

    let status = Command::new(env!("CARGO_BIN_EXE_sate"))
        .arg("run")
        .arg(&settings)
        .current_dir(temp.path())
        .status()
        .expect("sate run");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn invalid_value_combination_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = temp.path().join("settings.toml");
    fs::write(
        &settings,
        "[commandline]\nraxml_search_after = true\n[sate]\ntree_estimator = \"raxml\"\n",
    )
    .expect("write settings");

    let status = Command::new(env!("CARGO_BIN_EXE_sate"))
        .arg("run")
        .arg(&settings)
        .status()
        .expect("sate run");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
}

#[test]
fn run_writes_run_and_error_logs_to_output_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let input = temp.path().join("in.fasta");
    fs::write(&input, ">a\nACGTAC\n>b\nACGTTAC\n>c\nACGAC\n>d\nACGTACG\n").expect("write input");
    let out = temp.path().join("out");
    let settings = temp.path().join("settings.toml");
    fs::write(
        &settings,
        format!(
            "[commandline]\njob = \"logjob\"\ninput = {:?}\noutput_directory = {:?}\n\
             temporaries = {:?}\n[sate]\niter_limit = 1\n[tools]\nmafft = \"/nonexistent/mafft\"\n",
            input.display().to_string(),
            out.display().to_string(),
            temp.path().join("tmp").display().to_string(),
        ),
    )
    .expect("write settings");

    let status = Command::new(env!("CARGO_BIN_EXE_sate"))
        .arg("run")
        .arg(&settings)
        .status()
        .expect("sate run");

    assert_eq!(status.code(), Some(exit_codes::INVALID));
    let run_log = fs::read_to_string(out.join("logjob_log.txt")).expect("run log");
    assert!(run_log.contains("entering phase"), "{run_log}");
    let err_log = fs::read_to_string(out.join("logjob_err.txt")).expect("err log");
    assert!(err_log.contains("mafft"), "{err_log}");
    assert!(!err_log.contains("entering phase"), "{err_log}");
}
