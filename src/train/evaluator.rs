use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, TrainError};
use crate::feeder::feeder::{argmax, top_k_accuracy};
use crate::feeder::loader::DataLoader;
use crate::loss::cross_entropy::CrossEntropyLoss;
use crate::math::matrix::Matrix;
use crate::metrics::accumulator::mean;
use crate::metrics::sink::MetricsSink;
use crate::network::model::Model;
use crate::train::progress::batch_bar;

/// One named evaluation loader (a TTA variant of the test split).
pub struct EvalView {
    pub name: String,
    pub loader: DataLoader,
}

impl EvalView {
    pub fn new(name: impl Into<String>, loader: DataLoader) -> EvalView {
        EvalView { name: name.into(), loader }
    }
}

/// Optional per-sample text reports.
///
/// `wrong` receives `index,predicted,true` for every misclassified sample;
/// `result` receives `predicted,true` for every sample. Lines are written
/// for each view in turn.
#[derive(Default)]
pub struct EvalOutputs<'a> {
    pub wrong: Option<&'a mut dyn Write>,
    pub result: Option<&'a mut dyn Write>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    /// 0-based epoch the evaluation belongs to.
    pub epoch: usize,
    /// Top-1 accuracy of the fused scores.
    pub fused_accuracy: f64,
    /// Mean of the per-view losses.
    pub mean_loss: f64,
    pub view_losses: Vec<f64>,
    pub mean_aux: f64,
    /// `(k, accuracy)` for every requested k.
    pub topk: Vec<(usize, f64)>,
    pub fused_scores: Matrix,
    /// Sample names in row order of `fused_scores`.
    pub sample_names: Vec<String>,
}

/// Collected output of one view.
struct ViewPass {
    scores: Matrix,
    labels: Vec<usize>,
    indices: Vec<usize>,
    mean_loss: f64,
    mean_aux: f64,
}

/// Runs the model over every view and fuses the scores.
#[derive(Debug, Clone)]
pub struct MultiViewEvaluator {
    show_topk: Vec<usize>,
    eval_start: usize,
    score_dir: Option<PathBuf>,
    show_progress: bool,
}

impl MultiViewEvaluator {
    pub fn new(show_topk: Vec<usize>) -> MultiViewEvaluator {
        MultiViewEvaluator { show_topk, eval_start: 0, score_dir: None, show_progress: true }
    }

    /// Epochs with `epoch + 1 < eval_start` are skipped.
    pub fn eval_start(mut self, eval_start: usize) -> Self {
        self.eval_start = eval_start;
        self
    }

    /// Writes `epoch{N}_test_score.json` into `dir` after each evaluation.
    pub fn save_scores_to(mut self, dir: Option<PathBuf>) -> Self {
        self.score_dir = dir;
        self
    }

    pub fn show_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn should_evaluate(&self, epoch: usize) -> bool {
        epoch + 1 >= self.eval_start
    }

    /// Evaluates `views` in order. Returns `None` when the epoch is before
    /// `eval_start`.
    ///
    /// # Errors
    /// `ViewMisaligned` if the views disagree on sample count or order.
    pub fn evaluate(
        &self,
        epoch: usize,
        model: &mut dyn Model,
        views: &mut [EvalView],
        sink: &mut dyn MetricsSink,
        global_step: u64,
        mut outputs: EvalOutputs<'_>,
    ) -> Result<Option<EvalReport>> {
        if !self.should_evaluate(epoch) {
            return Ok(None);
        }
        if views.is_empty() {
            return Err(TrainError::ViewMisaligned("no evaluation views configured".into()));
        }

        model.set_training(false);
        tracing::info!(epoch = epoch + 1, views = views.len(), "evaluating");

        let mut passes = Vec::with_capacity(views.len());
        for view in views.iter_mut() {
            let pass = self.run_view(model, view, &mut outputs)?;
            if let Some(first) = passes.first() {
                check_alignment(&view.name, first, &pass)?;
            }
            tracing::info!(
                "\tMean {} loss of {} batches: {}.",
                view.name,
                view.loader.len(),
                pass.mean_loss
            );
            passes.push(pass);
        }
        model.release_cache();

        let score_views: Vec<Matrix> = passes.iter().map(|p| p.scores.clone()).collect();
        let fused = fuse_view_scores(&score_views)?;
        let view_losses: Vec<f64> = passes.iter().map(|p| p.mean_loss).collect();
        let mean_loss = mean(&view_losses);
        let mean_aux = mean(&passes.iter().map(|p| p.mean_aux).collect::<Vec<_>>());

        let labels = &passes[0].labels;
        let fused_accuracy = top_k_accuracy(&fused, labels, 1);
        let topk: Vec<(usize, f64)> = self.show_topk.iter()
            .map(|&k| (k, top_k_accuracy(&fused, labels, k)))
            .collect();
        for (k, acc) in &topk {
            tracing::info!("\tTop {}: {:.2}%", k, 100.0 * acc);
        }

        sink.add_scalar("loss", mean_loss, global_step);
        sink.add_scalar("loss_l1", mean_aux, global_step);
        sink.add_scalar("acc", fused_accuracy, global_step);

        let feeder = views[0].loader.feeder();
        let sample_names: Vec<String> = passes[0].indices.iter().map(|&i| feeder.sample_name(i)).collect();

        if let Some(dir) = &self.score_dir {
            save_scores(dir, epoch, &sample_names, &fused)?;
        }

        Ok(Some(EvalReport {
            epoch,
            fused_accuracy,
            mean_loss,
            view_losses,
            mean_aux,
            topk,
            fused_scores: fused,
            sample_names,
        }))
    }

    fn run_view(&self, model: &mut dyn Model, view: &mut EvalView, outputs: &mut EvalOutputs<'_>) -> Result<ViewPass> {
        let bar = batch_bar(view.loader.len(), &view.name, self.show_progress);
        let mut score_batches = Vec::new();
        let mut losses = Vec::new();
        let mut aux = Vec::new();
        let mut labels = Vec::new();
        let mut indices = Vec::new();

        for batch in view.loader.iter() {
            let batch = batch?;
            let output = model.forward(&batch.features);
            aux.push(output.aux_mean());
            let scores = output.into_scores();
            losses.push(CrossEntropyLoss::loss(&scores, &batch.labels));

            if outputs.wrong.is_some() || outputs.result.is_some() {
                for ((row, &truth), &index) in scores.data.iter().zip(&batch.labels).zip(&batch.indices) {
                    let predicted = argmax(row);
                    if let Some(result) = outputs.result.as_deref_mut() {
                        writeln!(result, "{predicted},{truth}")?;
                    }
                    if predicted != truth {
                        if let Some(wrong) = outputs.wrong.as_deref_mut() {
                            writeln!(wrong, "{index},{predicted},{truth}")?;
                        }
                    }
                }
            }

            labels.extend_from_slice(&batch.labels);
            indices.extend_from_slice(&batch.indices);
            score_batches.push(scores);
            bar.inc(1);
        }
        bar.finish_and_clear();

        Ok(ViewPass {
            scores: Matrix::concat_rows(&score_batches),
            labels,
            indices,
            mean_loss: mean(&losses),
            mean_aux: mean(&aux),
        })
    }
}

fn check_alignment(name: &str, first: &ViewPass, pass: &ViewPass) -> Result<()> {
    if pass.indices.len() != first.indices.len() {
        return Err(TrainError::ViewMisaligned(format!(
            "view {name} has {} samples, the first view has {}",
            pass.indices.len(),
            first.indices.len()
        )));
    }
    if pass.indices != first.indices || pass.labels != first.labels {
        return Err(TrainError::ViewMisaligned(format!(
            "view {name} enumerates samples in a different order than the first view"
        )));
    }
    Ok(())
}

/// Element-wise arithmetic mean of per-view score matrices.
///
/// # Errors
/// `ViewMisaligned` if there are no views or their shapes differ.
pub fn fuse_view_scores(views: &[Matrix]) -> Result<Matrix> {
    let first = views.first()
        .ok_or_else(|| TrainError::ViewMisaligned("no view scores to fuse".into()))?;
    for (i, view) in views.iter().enumerate().skip(1) {
        if view.shape() != first.shape() {
            return Err(TrainError::ViewMisaligned(format!(
                "view {i} scores have shape {:?}, view 0 has {:?}",
                view.shape(),
                first.shape()
            )));
        }
    }
    if views.len() == 1 {
        return Ok(first.clone());
    }
    let mut sum = first.clone();
    for view in &views[1..] {
        sum += view;
    }
    Ok(sum.scale(1.0 / views.len() as f64))
}

/// Path of the fused score artifact for a 0-based epoch.
pub fn score_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("epoch{}_test_score.json", epoch + 1))
}

fn save_scores(dir: &Path, epoch: usize, names: &[String], fused: &Matrix) -> Result<()> {
    let scores: BTreeMap<&str, &Vec<f64>> = names.iter().map(String::as_str).zip(fused.data.iter()).collect();
    fs::create_dir_all(dir)?;
    let path = score_path(dir, epoch);
    fs::write(&path, serde_json::to_string(&scores)?)?;
    tracing::debug!(path = %path.display(), "saved fused scores");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::feeder::feeder::Feeder;
    use crate::feeder::memory::InMemoryFeeder;
    use crate::feeder::tta::{TtaView, ViewFeeder};
    use crate::layers::parameter::Parameter;
    use crate::metrics::sink::MemorySink;
    use crate::network::model::ModelOutput;

    /// Scores are the raw features: evaluation output is fully predictable.
    struct Passthrough;

    impl Model for Passthrough {
        fn forward(&mut self, input: &Matrix) -> ModelOutput {
            ModelOutput::Prediction(input.clone())
        }
        fn backward(&mut self, _scores_grad: &Matrix) {}
        fn named_parameters(&self) -> Vec<(String, &Parameter)> { Vec::new() }
        fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> { Vec::new() }
        fn set_training(&mut self, _training: bool) {}
    }

    fn base() -> Arc<dyn Feeder> {
        Arc::new(InMemoryFeeder::new(
            vec![vec![2.0, 1.0], vec![-1.0, 3.0], vec![0.5, 0.0]],
            vec![0, 1, 1],
        ))
    }

    fn view(name: &str, tta: TtaView, batch: usize) -> EvalView {
        let feeder: Arc<dyn Feeder> = Arc::new(ViewFeeder::new(base(), tta, 2));
        EvalView::new(name, DataLoader::new(feeder, batch))
    }

    #[test]
    fn fusing_identical_views_is_identity() {
        let m = Matrix::from_data(vec![vec![0.1, 0.9], vec![0.4, 0.6]]);
        let fused = fuse_view_scores(&[m.clone(), m.clone(), m.clone()]).unwrap();
        for (a, b) in fused.data.iter().flatten().zip(m.data.iter().flatten()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn fusing_disjoint_views_averages() {
        let a = Matrix::from_data(vec![vec![1.0, 0.0]]);
        let b = Matrix::from_data(vec![vec![0.0, 1.0]]);
        assert_eq!(fuse_view_scores(&[a, b]).unwrap().data, vec![vec![0.5, 0.5]]);
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let a = Matrix::zeros(2, 3);
        let b = Matrix::zeros(3, 3);
        assert!(matches!(fuse_view_scores(&[a, b]), Err(TrainError::ViewMisaligned(_))));
    }

    #[test]
    fn single_view_fused_scores_equal_raw_scores() {
        let evaluator = MultiViewEvaluator::new(vec![1, 2]).show_progress(false);
        let mut views = vec![view("test_tta_0", TtaView::default(), 2)];
        let sink = MemorySink::new();
        let report = evaluator
            .evaluate(0, &mut Passthrough, &mut views, &mut sink.clone(), 7, EvalOutputs::default())
            .unwrap()
            .unwrap();
        assert_eq!(report.fused_scores.data, vec![vec![2.0, 1.0], vec![-1.0, 3.0], vec![0.5, 0.0]]);
        assert!((report.fused_accuracy - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(report.topk, vec![(1, report.fused_accuracy), (2, 1.0)]);
        assert_eq!(sink.values("acc"), vec![report.fused_accuracy]);
    }

    #[test]
    fn views_are_averaged_and_reports_written() {
        let evaluator = MultiViewEvaluator::new(vec![1]).show_progress(false);
        let mut views = vec![
            view("test_tta_0", TtaView::default(), 2),
            view("test_tta_1", TtaView { mirror: false, scale: 3.0 }, 3),
        ];
        let mut wrong = Vec::new();
        let mut result = Vec::new();
        let report = evaluator
            .evaluate(
                0,
                &mut Passthrough,
                &mut views,
                &mut MemorySink::new(),
                0,
                EvalOutputs { wrong: Some(&mut wrong), result: Some(&mut result) },
            )
            .unwrap()
            .unwrap();

        assert_eq!(report.fused_scores.data[0], vec![4.0, 2.0]);
        assert_eq!(report.view_losses.len(), 2);
        assert!((report.mean_loss - (report.view_losses[0] + report.view_losses[1]) / 2.0).abs() < 1e-12);

        let wrong = String::from_utf8(wrong).unwrap();
        assert_eq!(wrong, "2,0,1\n2,0,1\n");
        assert_eq!(String::from_utf8(result).unwrap().lines().count(), 6);
    }

    #[test]
    fn skipped_before_eval_start() {
        let evaluator = MultiViewEvaluator::new(vec![1]).eval_start(3).show_progress(false);
        let mut views = vec![view("v", TtaView::default(), 2)];
        let out = evaluator
            .evaluate(1, &mut Passthrough, &mut views, &mut MemorySink::new(), 0, EvalOutputs::default())
            .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn differing_sample_counts_are_fatal() {
        let evaluator = MultiViewEvaluator::new(vec![1]).show_progress(false);
        let short: Arc<dyn Feeder> = Arc::new(InMemoryFeeder::new(vec![vec![1.0, 0.0]], vec![0]));
        let mut views = vec![
            view("a", TtaView::default(), 2),
            EvalView::new("b", DataLoader::new(short, 2)),
        ];
        let err = evaluator
            .evaluate(0, &mut Passthrough, &mut views, &mut MemorySink::new(), 0, EvalOutputs::default())
            .unwrap_err();
        assert!(matches!(err, TrainError::ViewMisaligned(_)));
    }

    #[test]
    fn score_artifact_maps_names_to_fused_rows() {
        let dir = tempfile::tempdir().unwrap();
        let evaluator = MultiViewEvaluator::new(vec![1])
            .save_scores_to(Some(dir.path().to_path_buf()))
            .show_progress(false);
        let mut views = vec![view("v", TtaView::default(), 3)];
        evaluator
            .evaluate(4, &mut Passthrough, &mut views, &mut MemorySink::new(), 0, EvalOutputs::default())
            .unwrap();
        let text = fs::read_to_string(dir.path().join("epoch5_test_score.json")).unwrap();
        let scores: BTreeMap<String, Vec<f64>> = serde_json::from_str(&text).unwrap();
        assert_eq!(scores["sample_1"], vec![-1.0, 3.0]);
    }
}
