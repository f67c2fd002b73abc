//! Run configuration.
//!
//! Priority: command line > TOML file > defaults. The resolved configuration
//! is written back to `work_dir/config.toml` so every run can be reproduced.

use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::feeder::csv::FeederArgs;
use crate::feeder::tta::TtaView;
use crate::network::spec::ModelArgs;
use crate::optim::optimizer::OptimizerKind;
use crate::optim::scheduler::{LrScheduler, SchedulerKind};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Train,
    /// Evaluate-only: load weights, run one evaluation pass, stop.
    Test,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub work_dir: PathBuf,
    pub dataset: String,
    pub stream: String,
    pub num_classes: usize,
    pub phase: Phase,

    pub seed: u64,
    pub log_interval: u64,
    pub save_interval: usize,
    pub eval_interval: usize,
    pub eval_start: usize,
    pub save_score: bool,
    pub print_log: bool,
    pub show_progress: bool,
    pub show_topk: Vec<usize>,
    pub debug: bool,

    pub num_worker: usize,
    pub train_feeder_args: FeederArgs,
    pub test_feeder_args: FeederArgs,
    pub random_flip: bool,
    /// Directory for `train_normalization.json`; normalization is off when unset.
    pub use_train_normalization: Option<PathBuf>,
    pub use_tta: bool,
    pub tta: Vec<TtaView>,

    pub model: String,
    pub model_args: ModelArgs,
    pub weights: Option<PathBuf>,
    pub ignore_weights: Vec<String>,
    pub checkpoint: Option<PathBuf>,

    pub optimizer: OptimizerKind,
    pub base_lr: f64,
    pub momentum: f64,
    pub nesterov: bool,
    pub weight_decay: f64,
    pub half: bool,

    pub batch_size: usize,
    pub forward_batch_size: usize,
    pub test_batch_size: usize,
    pub start_epoch: usize,
    pub num_epoch: usize,
    pub early_stopping: usize,

    pub lr_scheduler: SchedulerKind,
    /// MultiStepLR milestones.
    pub step: Vec<usize>,
    pub gamma: f64,
    pub factor: f64,
    pub patience: usize,
    pub cooldown: usize,
    pub tmax: usize,
    pub eta_min: f64,
    /// Epoch-driven schedules hold until this epoch.
    pub epoch_warn: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            work_dir: PathBuf::from("work_dir"),
            dataset: String::new(),
            stream: "joint_xyz".to_string(),
            num_classes: 0,
            phase: Phase::Train,

            seed: 1,
            log_interval: 100,
            save_interval: 1,
            eval_interval: 1,
            eval_start: 1,
            save_score: false,
            print_log: true,
            show_progress: true,
            show_topk: vec![1, 5],
            debug: false,

            num_worker: 0,
            train_feeder_args: FeederArgs::default(),
            test_feeder_args: FeederArgs::default(),
            random_flip: true,
            use_train_normalization: None,
            use_tta: false,
            tta: vec![TtaView::default()],

            model: "mlp".to_string(),
            model_args: ModelArgs::default(),
            weights: None,
            ignore_weights: Vec::new(),
            checkpoint: None,

            optimizer: OptimizerKind::Sgd,
            base_lr: 0.01,
            momentum: 0.9,
            nesterov: false,
            weight_decay: 0.0005,
            half: false,

            batch_size: 32,
            forward_batch_size: 16,
            test_batch_size: 256,
            start_epoch: 0,
            num_epoch: 80,
            early_stopping: 0,

            lr_scheduler: SchedulerKind::MultiStepLR,
            step: vec![20, 40, 60],
            gamma: 0.1,
            factor: 0.1,
            patience: 10,
            cooldown: 0,
            tmax: 0,
            eta_min: 0.0001,
            epoch_warn: 0,
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(text: &str) -> Result<RunConfig> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<RunConfig> {
        let text = fs::read_to_string(path).map_err(|e| {
            TrainError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        RunConfig::from_toml_str(&text)
    }

    /// Writes the configuration to `work_dir/config.toml`.
    pub fn save(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.work_dir)?;
        let path = self.work_dir.join(CONFIG_FILE);
        fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(path)
    }

    /// Fills in values derived from other fields.
    ///
    /// - `$STREAM` / `$DATASET` in feeder paths are substituted
    /// - `model_args.num_class` and `model_args.in_channels` follow
    ///   `num_classes` and `stream`
    /// - with `use_tta = false` only the first TTA entry is kept
    /// - `debug` turns on training feeder truncation
    pub fn resolve(mut self) -> RunConfig {
        for args in [&mut self.train_feeder_args, &mut self.test_feeder_args] {
            args.data_path = substitute(&args.data_path, &self.stream, &self.dataset);
            args.label_path = substitute(&args.label_path, &self.stream, &self.dataset);
        }
        self.train_feeder_args.debug |= self.debug;

        self.model_args.num_class = self.num_classes;
        self.model_args.in_channels = in_channels_for_stream(&self.stream);

        if !self.use_tta {
            self.tta.truncate(1);
        }
        self
    }

    /// Checks everything that must hold before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.phase == Phase::Test && self.weights.is_none() {
            return Err(TrainError::MissingWeights);
        }
        if self.forward_batch_size == 0 || self.batch_size % self.forward_batch_size != 0 {
            return Err(TrainError::BatchSizeMismatch {
                batch_size: self.batch_size,
                forward_batch_size: self.forward_batch_size,
            });
        }

        let mut errors = Vec::new();
        if self.batch_size == 0 {
            errors.push("batch_size must be positive".to_string());
        }
        if self.test_batch_size == 0 {
            errors.push("test_batch_size must be positive".to_string());
        }
        if self.num_classes == 0 {
            errors.push("num_classes must be positive".to_string());
        }
        if self.save_interval == 0 {
            errors.push("save_interval must be positive".to_string());
        }
        if self.eval_interval == 0 {
            errors.push("eval_interval must be positive".to_string());
        }
        if self.tta.is_empty() {
            errors.push("tta needs at least one entry".to_string());
        }
        if self.show_topk.iter().any(|&k| k == 0) {
            errors.push("show_topk entries must be positive".to_string());
        }
        if self.lr_scheduler == SchedulerKind::CosineAnnealingLR && self.tmax == 0 {
            errors.push("CosineAnnealingLR needs tmax > 0".to_string());
        }
        if self.base_lr <= 0.0 {
            errors.push("base_lr must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainError::Config(errors.join("; ")))
        }
    }

    pub fn build_scheduler(&self) -> LrScheduler {
        match self.lr_scheduler {
            SchedulerKind::MultiStepLR => LrScheduler::multi_step(self.base_lr, self.step.clone(), self.gamma),
            SchedulerKind::ReduceLROnPlateau => {
                LrScheduler::reduce_on_plateau(self.factor, self.patience, self.cooldown)
            }
            SchedulerKind::CosineAnnealingLR => {
                LrScheduler::cosine_annealing(self.base_lr, self.tmax, self.eta_min)
            }
        }
    }

    /// Name of the `idx`-th evaluation view.
    pub fn view_name(idx: usize) -> String {
        format!("test_tta_{idx}")
    }
}

fn substitute(path: &Path, stream: &str, dataset: &str) -> PathBuf {
    let text = path.to_string_lossy();
    if !text.contains('$') {
        return path.to_path_buf();
    }
    PathBuf::from(text.replace("$STREAM", stream).replace("$DATASET", dataset))
}

/// Coordinates per joint for a data stream name.
///
/// `angles_extended` carries 4 values per joint, other `angles` streams 1;
/// everything else is named after its axes (`joint_xyz` has 3).
pub fn in_channels_for_stream(stream: &str) -> usize {
    if stream.contains("angles_extended") {
        4
    } else if stream.contains("angles") {
        1
    } else {
        stream.rsplit('_').next().map(str::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_override_defaults() {
        let cfg = RunConfig::from_toml_str(
            r#"
            num_classes = 40
            optimizer = "Adam"
            lr_scheduler = "ReduceLROnPlateau"

            [[tta]]
            mirror = false
            scale = 1.0

            [[tta]]
            mirror = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.num_classes, 40);
        assert_eq!(cfg.optimizer, OptimizerKind::Adam);
        assert_eq!(cfg.tta.len(), 2);
        assert_eq!(cfg.tta[1], TtaView { mirror: true, scale: 1.0 });
        assert_eq!(cfg.batch_size, 32);
    }

    #[test]
    fn unknown_keys_and_names_are_rejected() {
        assert!(RunConfig::from_toml_str("bogus = 1").is_err());
        assert!(RunConfig::from_toml_str("optimizer = \"RMSprop\"").is_err());
        assert!(RunConfig::from_toml_str("lr_scheduler = \"StepLR\"").is_err());
    }

    #[test]
    fn resolve_substitutes_and_derives() {
        let mut cfg = RunConfig {
            dataset: "lse".into(),
            stream: "joint_xy".into(),
            num_classes: 7,
            ..RunConfig::default()
        };
        cfg.train_feeder_args.data_path = PathBuf::from("data/$DATASET/train_$STREAM.csv");
        cfg.tta = vec![TtaView::default(), TtaView { mirror: true, scale: 1.0 }];

        let cfg = cfg.resolve();
        assert_eq!(cfg.train_feeder_args.data_path, PathBuf::from("data/lse/train_joint_xy.csv"));
        assert_eq!(cfg.model_args.in_channels, 2);
        assert_eq!(cfg.model_args.num_class, 7);
        assert_eq!(cfg.tta.len(), 1);
    }

    #[test]
    fn stream_names_map_to_channels() {
        assert_eq!(in_channels_for_stream("angles_extended"), 4);
        assert_eq!(in_channels_for_stream("bone_angles"), 1);
        assert_eq!(in_channels_for_stream("joint_xyz"), 3);
    }

    #[test]
    fn validation_catches_fatal_settings() {
        let base = RunConfig { num_classes: 3, ..RunConfig::default() };
        assert!(base.validate().is_ok());

        let test = RunConfig { phase: Phase::Test, ..base.clone() };
        assert!(matches!(test.validate(), Err(TrainError::MissingWeights)));

        let uneven = RunConfig { batch_size: 30, forward_batch_size: 16, ..base.clone() };
        assert!(matches!(uneven.validate(), Err(TrainError::BatchSizeMismatch { .. })));

        let cosine = RunConfig { lr_scheduler: SchedulerKind::CosineAnnealingLR, ..base };
        assert!(matches!(cosine.validate(), Err(TrainError::Config(_))));
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RunConfig {
            work_dir: dir.path().to_path_buf(),
            num_classes: 5,
            weights: Some(PathBuf::from("w.json")),
            ..RunConfig::default()
        };
        let path = cfg.save().unwrap();
        assert_eq!(RunConfig::load(&path).unwrap(), cfg);
    }
}
