//! End-to-end pipeline scenarios driven through the scripted tool team.
//!
//! Every test runs `run_sate` against data written into a temp directory, with
//! outputs and temporaries kept under the same directory, and inspects the
//! recorded tool calls, the returned summary, and the written products.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use sate::core::dataset::{Alignment, Datatype, Sequence};
use sate::core::score::{IdentityTransform, Score};
use sate::core::state::StopReason;
use sate::io::config::SateConfig;
use sate::io::fasta::{read_fasta, write_fasta};
use sate::io::newick::read_tree_file;
use sate::pipeline::{LAST_USED_CONFIG, Phase, RunSummary, run_sate};
use sate::sched::cancel::{Cancellation, CancelledError};
use sate::sched::job::JobStatus;
use sate::test_support::{Script, ToolKind, dir_entries, residues, test_config, write_input};

fn run_with(cfg: SateConfig, script: &Arc<Script>, post_search: bool) -> Result<RunSummary> {
    let team = if post_search {
        script.team_with_post_search()
    } else {
        script.team()
    };
    run_sate(
        cfg,
        &move |_: &SateConfig, _: Datatype| team.clone(),
        &IdentityTransform,
        Cancellation::new(),
    )
}

fn run(cfg: SateConfig, script: &Arc<Script>) -> Result<RunSummary> {
    run_with(cfg, script, false)
}

fn score_text(work: &Path) -> String {
    fs::read_to_string(work.join("out").join("testjob.score.txt")).expect("score file")
}

fn values(score: Option<Score>) -> Option<f64> {
    score.map(Score::value)
}

#[test]
fn two_phase_with_starting_tree_runs_one_tree_search() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path();
    let input = write_input(work, 6, 1, 20, true);
    let tree_path = work.join("start.tre");
    fs::write(&tree_path, "((t0,t1),(t2,t3),(t4,t5));\n").expect("write tree");

    let mut cfg = test_config(&input, work);
    cfg.commandline.two_phase = true;
    cfg.commandline.aligned = true;
    cfg.commandline.treefile = Some(tree_path);
    let script = Script::new().tree_scores([-42.5]);

    let summary = run(cfg, &script).expect("run");

    assert!(script.calls_of(ToolKind::Align).is_empty());
    let trees = script.calls_of(ToolKind::Tree);
    assert_eq!(trees.len(), 1);
    assert!(trees[0].seeded, "supplied tree seeds the search");
    assert_eq!(summary.stop, StopReason::TwoPhase);
    assert_eq!(
        summary.phases,
        vec![Phase::Init, Phase::InitialTreeSearch, Phase::Done]
    );
    assert_eq!(summary.iterations, 0);
    assert_eq!(values(summary.final_score), Some(-42.5));

    let out = work.join("out");
    let tree = read_tree_file(&out.join("testjob.tre")).expect("result tree");
    let mut leaves = tree.leaf_labels().expect("labels");
    leaves.sort();
    assert_eq!(leaves, vec!["t0", "t1", "t2", "t3", "t4", "t5"]);
    let alignment = read_fasta(&out.join("testjob.marker001.aln")).expect("result alignment");
    assert!(alignment.get("t3").is_some(), "original names restored");
    assert!(out.join("testjob_config.txt").is_file());
    assert!(out.join("testjob_name_translation.txt").is_file());
    assert!(score_text(work).starts_with("-42.5"));
}

#[test]
fn multilocus_initial_phases_align_each_locus_then_search_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path();
    let input = write_input(work, 5, 3, 12, false);
    let mut cfg = test_config(&input, work);
    cfg.commandline.two_phase = true;
    let script = Script::new();

    let summary = run(cfg, &script).expect("run");

    let calls = script.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[..3].iter().all(|c| c.kind == ToolKind::Align));
    assert_eq!(calls[3].kind, ToolKind::Tree);
    assert!(!calls[3].seeded);
    assert_eq!(
        summary.phases,
        vec![
            Phase::Init,
            Phase::InitialAlignment,
            Phase::InitialTreeSearch,
            Phase::Done
        ]
    );

    let out = work.join("out");
    for marker in 1..=3 {
        let alignment = read_fasta(&out.join(format!("testjob.marker{marker:03}.aln")))
            .expect("locus alignment");
        assert_eq!(alignment.len(), 5);
        assert!(alignment.is_aligned());
    }
}

#[test]
fn multilocus_run_aligns_every_locus_before_the_first_iteration() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path();
    let input = write_input(work, 5, 3, 12, false);
    let cfg = test_config(&input, work);
    let script = Script::new().tree_scores([-100.0, -90.0]);

    let summary = run(cfg, &script).expect("run");

    assert_eq!(summary.iterations, 1);
    let calls = script.calls();
    assert!(calls.len() > 4);
    assert!(
        calls[..3]
            .iter()
            .all(|c| c.kind == ToolKind::Align && c.label.starts_with("initalign_l"))
    );
    assert_eq!(calls[3].kind, ToolKind::Tree);
    assert_eq!(calls[3].label, "inittree");
    assert!(calls[..4].iter().all(|c| !c.label.starts_with("iter")));
    assert!(calls[4..].iter().all(|c| c.label.starts_with("iter1_")));
}

#[test]
fn improving_iteration_becomes_best() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path();
    let input = write_input(work, 8, 1, 16, false);
    let cfg = test_config(&input, work);
    let script = Script::new().tree_scores([-100.0, -90.0]);

    let summary = run(cfg, &script).expect("run");

    assert_eq!(summary.stop, StopReason::IterationLimit);
    assert_eq!(summary.iterations, 1);
    assert_eq!(values(summary.best_score), Some(-90.0));
    assert_eq!(values(summary.final_score), Some(-90.0));
    let trees = script.calls_of(ToolKind::Tree);
    assert_eq!(trees.len(), 2);
    assert!(trees[1].seeded, "refined search starts from the current tree");
    assert!(score_text(work).starts_with("-90"));
    assert!(summary.phases.contains(&Phase::Refining));
}

#[test]
fn worse_iterations_revert_and_keep_best() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path();
    let input = write_input(work, 8, 1, 16, false);
    let mut cfg = test_config(&input, work);
    cfg.sate.iter_limit = Some(5);
    cfg.sate.after_blind_iter_without_imp_limit = 1;
    cfg.sate.blind_restarts = 0;
    let script = Script::new().tree_scores([-100.0, -110.0, -120.0, -130.0]);

    let summary = run(cfg, &script).expect("run");

    assert_eq!(summary.stop, StopReason::NoImprovement);
    assert_eq!(summary.iterations, 1);
    assert_eq!(values(summary.best_score), Some(-100.0));
    assert_eq!(values(summary.final_score), Some(-100.0));
    assert!(score_text(work).starts_with("-100"));
}

#[test]
fn failed_realignment_falls_back_to_current_sub_alignment() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path();
    let input = write_input(work, 8, 1, 16, false);
    let mut cfg = test_config(&input, work);
    cfg.sate.max_subproblem_frac = 0.5;
    let script = Script::new().tree_scores([-100.0, -95.0]).fail("iter1_p0_");

    let summary = run(cfg, &script).expect("run");

    let realigned: Vec<String> = script
        .calls_of(ToolKind::Align)
        .into_iter()
        .map(|c| c.label)
        .filter(|l| l.starts_with("iter1_"))
        .collect();
    assert!(realigned.iter().any(|l| l.starts_with("iter1_p0_")));
    assert!(realigned.iter().any(|l| l.starts_with("iter1_p1_")));
    assert_eq!(summary.iterations, 1);
    assert_eq!(values(summary.best_score), Some(-95.0));
    let alignment = read_fasta(&work.join("out").join("testjob.marker001.aln")).expect("alignment");
    assert_eq!(alignment.len(), 8);
    assert!(alignment.is_aligned());
}

#[test]
fn every_realignment_failing_aborts_the_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path();
    let input = write_input(work, 8, 1, 16, false);
    let mut cfg = test_config(&input, work);
    cfg.sate.max_subproblem_frac = 0.5;
    let script = Script::new().fail("iter1_p");

    let err = run(cfg, &script).expect_err("run must fail");

    assert!(format!("{err:#}").contains("every realignment"), "{err:#}");
    assert!(dir_entries(&work.join("tmp")).is_empty(), "run temp directory removed");
}

#[test]
fn failed_merge_discards_the_iteration() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path();
    let input = write_input(work, 8, 1, 16, false);
    let mut cfg = test_config(&input, work);
    cfg.sate.max_subproblem_frac = 0.5;
    let script = Script::new().tree_scores([-100.0]).fail("iter1_m");

    let summary = run(cfg, &script).expect("run");

    assert_eq!(script.calls_of(ToolKind::Tree).len(), 1, "no tree search after a failed merge");
    assert_eq!(summary.iterations, 1);
    assert_eq!(values(summary.final_score), Some(-100.0));
}

#[test]
fn starting_tree_skips_initial_phases() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path();
    let input = write_input(work, 6, 1, 16, false);
    let tree_path = work.join("start.tre");
    fs::write(&tree_path, "(t0,(t1,(t2,(t3,(t4,t5)))));\n").expect("write tree");
    let mut cfg = test_config(&input, work);
    cfg.commandline.treefile = Some(tree_path);
    let script = Script::new().tree_scores([-70.0]);

    let summary = run(cfg, &script).expect("run");

    assert!(!summary.phases.contains(&Phase::InitialAlignment));
    assert!(!summary.phases.contains(&Phase::InitialTreeSearch));
    assert!(
        script
            .calls_of(ToolKind::Align)
            .iter()
            .all(|c| c.label.starts_with("iter1_"))
    );
    assert_eq!(values(summary.best_score), Some(-70.0));
}

#[test]
fn starting_tree_with_unknown_taxon_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path();
    let input = write_input(work, 4, 1, 16, true);
    let tree_path = work.join("start.tre");
    fs::write(&tree_path, "((t0,t1),(t2,stranger));\n").expect("write tree");
    let mut cfg = test_config(&input, work);
    cfg.commandline.treefile = Some(tree_path);
    let script = Script::new();

    assert!(run(cfg, &script).is_err());
    assert!(script.calls().is_empty());
}

#[test]
fn post_search_is_used_only_when_it_improves() {
    for (post, expected) in [(-50.0, -50.0), (-200.0, -90.0)] {
        let temp = tempfile::tempdir().expect("tempdir");
        let work = temp.path();
        let input = write_input(work, 8, 1, 16, false);
        let mut cfg = test_config(&input, work);
        cfg.commandline.raxml_search_after = true;
        let script = Script::new().tree_scores([-100.0, -90.0]).post_scores([post]);

        let summary = run_with(cfg, &script, true).expect("run");

        assert_eq!(script.calls_of(ToolKind::PostTree).len(), 1);
        assert_eq!(summary.phases.last(), Some(&Phase::Done));
        assert!(summary.phases.contains(&Phase::PostSearch));
        assert_eq!(values(summary.final_score), Some(expected));
    }
}

#[test]
fn rna_input_is_written_back_as_rna() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path();
    let input = work.join("rna.fasta");
    let rows = (0..5)
        .map(|i| Sequence::new(format!("r{i}"), residues(i, 0, 14).replace('T', "U")))
        .collect();
    write_fasta(&input, &Alignment::new(rows)).expect("write input");
    let mut cfg = test_config(&input, work);
    cfg.commandline.datatype = Datatype::Rna;
    cfg.commandline.two_phase = true;
    let script = Script::new();

    run(cfg, &script).expect("run");

    let text = fs::read_to_string(work.join("out").join("testjob.marker001.aln"))
        .expect("alignment");
    let residues: String = text.lines().filter(|l| !l.starts_with('>')).collect();
    assert!(residues.contains('U'));
    assert!(!residues.contains('T'));
}

#[test]
fn keeptemp_leaves_the_run_directory_with_config_snapshot() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path();
    let input = write_input(work, 6, 1, 16, false);
    let mut cfg = test_config(&input, work);
    cfg.commandline.keeptemp = true;
    let script = Script::new();

    run(cfg, &script).expect("run");

    let runs = dir_entries(&work.join("tmp"));
    assert_eq!(runs.len(), 1);
    assert!(runs[0].join(LAST_USED_CONFIG).is_file());
}

#[test]
fn completed_run_removes_its_temporaries() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path();
    let input = write_input(work, 8, 2, 16, false);
    let mut cfg = test_config(&input, work);
    cfg.sate.iter_limit = Some(3);
    cfg.sate.max_subproblem_frac = 0.3;
    let script = Script::new().tree_scores([-100.0, -90.0, -80.0, -70.0]);

    let summary = run(cfg, &script).expect("run");

    assert_eq!(summary.iterations, 3);
    let aligns = script.calls_of(ToolKind::Align);
    assert!(aligns.iter().any(|c| c.label.starts_with("iter3_p1_")));
    assert!(aligns.iter().any(|c| c.label.starts_with("iter1_") && c.label.ends_with("_l1")));
    assert!(dir_entries(&work.join("tmp")).is_empty());
}

#[test]
fn cancel_during_refinement_kills_jobs_and_removes_temporaries() {
    let temp = tempfile::tempdir().expect("tempdir");
    let work = temp.path().to_path_buf();
    let input = write_input(&work, 8, 1, 16, false);
    let mut cfg = test_config(&input, &work);
    cfg.sate.max_subproblem_frac = 0.5;
    let script = Script::new();
    let started = script.block("iter1_p0_");
    let cancellation = Cancellation::new();

    let runner = {
        let team = script.team();
        let cancellation = cancellation.clone();
        thread::spawn(move || {
            run_sate(
                cfg,
                &move |_: &SateConfig, _: Datatype| team.clone(),
                &IdentityTransform,
                cancellation,
            )
        })
    };

    let label = started
        .recv_timeout(Duration::from_secs(10))
        .expect("blocking job started");
    assert!(label.starts_with("iter1_p0_"));
    assert!(cancellation.cancel("test interrupt") >= 1);

    let err = runner
        .join()
        .expect("join")
        .expect_err("cancelled run must fail");
    assert!(err.downcast_ref::<CancelledError>().is_some(), "{err:#}");
    let blocked = script
        .handles()
        .into_iter()
        .find(|h| h.label() == label)
        .expect("blocked job handle");
    assert_eq!(blocked.status(), JobStatus::Killed);
    assert!(dir_entries(&work.join("tmp")).is_empty(), "run temp directory removed");
    assert!(!work.join("out").join("testjob.tre").exists());
}
