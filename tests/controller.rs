mod common;

use std::sync::mpsc;

use skeleton_trainer::config::{Phase, RunConfig};
use skeleton_trainer::error::TrainError;
use skeleton_trainer::feeder::tta::TtaView;
use skeleton_trainer::metrics::sink::{MemorySink, MetricsChannels};
use skeleton_trainer::optim::scheduler::SchedulerKind;
use skeleton_trainer::train::controller::{Stage, TerminationReason, TrainingController};

use common::{alternating_data, config, file_names, network, zero_label_data, ScriptedModel};

fn channels(train: &MemorySink, val: &MemorySink) -> MetricsChannels {
    MetricsChannels { train: Box::new(train.clone()), val: Box::new(val.clone()) }
}

#[test]
fn saves_every_epoch_and_counts_steps() {
    let dir = tempfile::tempdir().unwrap();
    let (train, val) = (MemorySink::new(), MemorySink::new());
    let mut controller =
        TrainingController::new(config(dir.path(), 3), network(1), alternating_data(), channels(&train, &val)).unwrap();
    assert_eq!(controller.stage(), Stage::Initializing);

    let summary = controller.run().unwrap();
    assert_eq!(summary.reason, TerminationReason::MaxEpochs);
    assert_eq!(summary.epochs_run, 3);
    assert_eq!(summary.state.global_step, 6);
    assert_eq!(controller.stage(), Stage::Terminated);
    assert_eq!(controller.optimizer().step_count(), 6);

    assert_eq!(
        file_names(&dir.path().join("checkpoints")),
        vec!["checkpoint-1-fwbz2-2.json", "checkpoint-2-fwbz2-4.json", "checkpoint-3-fwbz2-6.json"]
    );
    assert_eq!(
        file_names(&dir.path().join("weights")),
        vec!["weights-1.json", "weights-2.json", "weights-3.json"]
    );
    assert_eq!(train.values("epoch"), vec![1.0, 2.0, 3.0]);
    assert_eq!(val.values("acc").len(), 3);
}

#[test]
fn save_interval_still_saves_final_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RunConfig { save_interval: 2, ..config(dir.path(), 3) };
    let mut controller = TrainingController::new(cfg, network(2), alternating_data(), MetricsChannels::null()).unwrap();
    controller.run().unwrap();
    assert_eq!(file_names(&dir.path().join("weights")), vec!["weights-2.json", "weights-3.json"]);
}

#[test]
fn eval_interval_skips_epochs_but_not_the_last() {
    let dir = tempfile::tempdir().unwrap();
    let (train, val) = (MemorySink::new(), MemorySink::new());
    let cfg = RunConfig { eval_interval: 2, ..config(dir.path(), 3) };
    let mut controller = TrainingController::new(cfg, network(3), alternating_data(), channels(&train, &val)).unwrap();
    let (tx, rx) = mpsc::channel();
    controller = controller.with_progress(tx);
    controller.run().unwrap();

    let evaluated: Vec<bool> = rx.try_iter().map(|s| s.val_loss.is_some()).collect();
    assert_eq!(evaluated, vec![false, true, true]);
    assert_eq!(val.values("loss").len(), 2);
}

#[test]
fn early_stopping_ends_run_after_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RunConfig { early_stopping: 2, ..config(dir.path(), 10) };
    let model = Box::new(ScriptedModel::new(vec![1.0, 1.2, 1.3, 1.1]));
    let (tx, rx) = mpsc::channel();
    let mut controller = TrainingController::new(cfg, model, zero_label_data(), MetricsChannels::null())
        .unwrap()
        .with_progress(tx);

    let summary = controller.run().unwrap();
    assert_eq!(summary.reason, TerminationReason::EarlyStopping);
    assert_eq!(summary.epochs_run, 3);
    assert_eq!(summary.state.early_stop_counter, 2);
    let best = summary.state.best_validation_loss.unwrap();
    assert!((best - 1.0).abs() < 1e-9, "best loss {best}");

    let losses: Vec<f64> = rx.try_iter().filter_map(|s| s.val_loss).collect();
    assert_eq!(losses.len(), 3);
    assert!((losses[2] - 1.3).abs() < 1e-9);
    // The stopping epoch is still saved.
    assert!(dir.path().join("weights").join("weights-3.json").exists());
    assert!(!dir.path().join("weights").join("weights-4.json").exists());
}

#[test]
fn plateau_schedule_follows_validation_loss() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RunConfig {
        lr_scheduler: SchedulerKind::ReduceLROnPlateau,
        factor: 0.5,
        patience: 1,
        ..config(dir.path(), 3)
    };
    let model = Box::new(ScriptedModel::new(vec![1.0, 1.2, 1.3]));
    let mut controller = TrainingController::new(cfg, model, zero_label_data(), MetricsChannels::null()).unwrap();
    let summary = controller.run().unwrap();
    assert!((summary.state.learning_rate - 0.005).abs() < 1e-12);
}

#[test]
fn evaluate_only_requires_weights() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RunConfig { phase: Phase::Test, ..config(dir.path(), 1) };
    let data = skeleton_trainer::train::controller::Datasets { train: None, ..alternating_data() };
    let result = TrainingController::new(cfg, network(1), data, MetricsChannels::null());
    assert!(matches!(result, Err(TrainError::MissingWeights)));
}

#[test]
fn indivisible_batch_fails_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RunConfig { batch_size: 5, ..config(dir.path(), 1) };
    let result = TrainingController::new(cfg, network(1), alternating_data(), MetricsChannels::null());
    assert!(matches!(result, Err(TrainError::BatchSizeMismatch { batch_size: 5, forward_batch_size: 2 })));
    assert!(!dir.path().join("checkpoints").exists());
}

#[test]
fn resume_restores_epoch_step_and_optimizer() {
    let dir = tempfile::tempdir().unwrap();
    TrainingController::new(config(dir.path(), 2), network(7), alternating_data(), MetricsChannels::null())
        .unwrap()
        .run()
        .unwrap();

    let checkpoint = dir.path().join("checkpoints").join("checkpoint-2-fwbz2-4.json");
    let cfg = RunConfig { checkpoint: Some(checkpoint.clone()), ..config(dir.path(), 3) };
    let mut resumed = TrainingController::new(cfg, network(7), alternating_data(), MetricsChannels::null()).unwrap();
    assert_eq!(resumed.state().current_epoch, 2);
    assert_eq!(resumed.state().global_step, 4);
    assert_eq!(resumed.optimizer().step_count(), 4);

    let summary = resumed.run().unwrap();
    assert_eq!(summary.epochs_run, 1);
    assert!(dir.path().join("checkpoints").join("checkpoint-3-fwbz2-6.json").exists());

    let plateau = RunConfig {
        checkpoint: Some(checkpoint),
        lr_scheduler: SchedulerKind::ReduceLROnPlateau,
        ..config(dir.path(), 3)
    };
    let mismatch = TrainingController::new(plateau, network(7), alternating_data(), MetricsChannels::null());
    assert!(matches!(mismatch, Err(TrainError::SchedulerMismatch { .. })));
}

#[test]
fn tta_views_follow_use_tta() {
    let dir = tempfile::tempdir().unwrap();
    let views = vec![TtaView::default(), TtaView { mirror: true, scale: 1.0 }];

    let single = RunConfig { tta: views.clone(), use_tta: false, ..config(dir.path(), 1) }.resolve();
    let controller = TrainingController::new(single, network(1), alternating_data(), MetricsChannels::null()).unwrap();
    assert_eq!(controller.view_count(), 1);

    let multi = RunConfig { tta: views, use_tta: true, ..config(dir.path(), 1) }.resolve();
    let mut controller = TrainingController::new(multi, network(1), alternating_data(), MetricsChannels::null()).unwrap();
    assert_eq!(controller.view_count(), 2);
    let summary = controller.run().unwrap();
    assert_eq!(summary.last_eval.unwrap().view_losses.len(), 2);
}

#[test]
fn evaluate_only_writes_sample_reports() {
    let dir = tempfile::tempdir().unwrap();
    TrainingController::new(config(dir.path(), 1), network(5), alternating_data(), MetricsChannels::null())
        .unwrap()
        .run()
        .unwrap();

    let cfg = RunConfig {
        phase: Phase::Test,
        weights: Some(dir.path().join("weights").join("weights-1.json")),
        ..config(dir.path(), 1)
    };
    let data = skeleton_trainer::train::controller::Datasets { train: None, ..alternating_data() };
    let mut controller = TrainingController::new(cfg, network(99), data, MetricsChannels::null()).unwrap();
    let summary = controller.run().unwrap();
    assert_eq!(summary.reason, TerminationReason::EvaluateOnly);
    assert_eq!(summary.epochs_run, 0);

    let report = summary.last_eval.unwrap();
    let right = std::fs::read_to_string(dir.path().join("right-samples.txt")).unwrap();
    let wrong = std::fs::read_to_string(dir.path().join("wrong-samples.txt")).unwrap();
    assert_eq!(right.lines().count(), 6);
    let expected_wrong = (6.0 * (1.0 - report.fused_accuracy)).round() as usize;
    assert_eq!(wrong.lines().count(), expected_wrong);
    for line in wrong.lines() {
        assert_eq!(line.split(',').count(), 3);
    }
}

#[test]
fn debug_evaluation_skips_sample_reports() {
    let dir = tempfile::tempdir().unwrap();
    TrainingController::new(config(dir.path(), 1), network(5), alternating_data(), MetricsChannels::null())
        .unwrap()
        .run()
        .unwrap();

    let mut cfg = RunConfig {
        phase: Phase::Test,
        weights: Some(dir.path().join("weights").join("weights-1.json")),
        ..config(dir.path(), 1)
    };
    cfg.test_feeder_args.debug = true;
    let data = skeleton_trainer::train::controller::Datasets { train: None, ..alternating_data() };
    TrainingController::new(cfg, network(99), data, MetricsChannels::null()).unwrap().run().unwrap();
    assert!(!dir.path().join("wrong-samples.txt").exists());
}
