use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data::loader::BatchSource;
use crate::error::{Result, Stage, TrainError};
use crate::loss::cross_entropy::{softmax, CrossEntropyLoss};
use crate::metrics::average::RunningAverage;
use crate::metrics::average_precision::{AveragePrecisionMeter, TopKErrorMeter};
use crate::metrics::confusion::ConfusionMatrix;
use crate::metrics::sink::MetricsSink;
use crate::network::model::{argmax, Model};

/// Everything one evaluation pass measures. Built from scratch on every
/// call; nothing carries over between passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    /// Mean cross-entropy per sample.
    pub loss_avg: f64,
    /// Top-1 accuracy in `[0, 1]`.
    pub accuracy: f64,
    pub per_class_ap: Vec<f64>,
    pub mean_ap: f64,
    pub confusion_matrix: ConfusionMatrix,
    /// k → fraction of samples whose label is outside the top k.
    pub top_k_error: BTreeMap<usize, f64>,
    pub samples: usize,
}

impl EvalResult {
    /// Writes `test/loss`, `test/accuracy`, `test/mAP` and one
    /// `test/top{k}_error` per k at `step`.
    pub fn emit(&self, sink: &mut dyn MetricsSink, step: usize) -> Result<()> {
        sink.add_scalar("test/loss", self.loss_avg, step)?;
        sink.add_scalar("test/accuracy", self.accuracy, step)?;
        sink.add_scalar("test/mAP", self.mean_ap, step)?;
        for (k, err) in &self.top_k_error {
            sink.add_scalar(&format!("test/top{k}_error"), *err, step)?;
        }
        Ok(())
    }
}

/// One full pass over `source` in inference mode.
///
/// Scores for mAP and top-k are softmax probabilities; predictions are the
/// first maximal logit. The loss average is weighted by batch size. An
/// empty evaluation set is a data-load error; a failing sink only warns.
pub fn evaluate<M: Model + ?Sized>(
    model: &M,
    source: &dyn BatchSource,
    top_k: &[usize],
    sink: &mut dyn MetricsSink,
    step: usize,
) -> Result<EvalResult> {
    let num_classes = model.num_classes();
    let mut losses = RunningAverage::new();
    let mut confusion = ConfusionMatrix::new(num_classes);
    let mut ap = AveragePrecisionMeter::new(num_classes);
    let mut topk = TopKErrorMeter::new(top_k);

    debug!(batches = source.batches_per_epoch(), step, "running validation");

    for batch in source.iter_epoch(0) {
        let batch = batch?;
        if batch.is_empty() {
            continue;
        }
        if let Some(&bad) = batch.labels.iter().find(|&&l| l >= num_classes) {
            return Err(TrainError::stage(
                Stage::DataLoad,
                format!("evaluation label {bad} out of range for {num_classes} classes"),
            ));
        }
        let logits = model.forward(&batch.inputs)?;
        let (loss, _) = CrossEntropyLoss::batch(&logits, &batch.labels);
        losses.update(loss, batch.len() as f64);

        for (row, &label) in logits.data.iter().zip(batch.labels.iter()) {
            let probs = softmax(row);
            confusion.add(label, argmax(row));
            ap.add(&probs, label);
            topk.add(&probs, label);
        }
    }

    let samples = confusion.total();
    if samples == 0 {
        return Err(TrainError::stage(Stage::DataLoad, "evaluation set is empty"));
    }

    let result = EvalResult {
        loss_avg: losses.average(),
        accuracy: confusion.accuracy(),
        per_class_ap: ap.per_class(),
        mean_ap: ap.mean(),
        confusion_matrix: confusion,
        top_k_error: topk.value(),
        samples,
    };
    info!(
        step,
        loss = result.loss_avg,
        accuracy = result.accuracy,
        mean_ap = result.mean_ap,
        "validation results"
    );
    debug!(per_class_ap = ?result.per_class_ap, top_k_error = ?result.top_k_error, "ranking metrics");
    debug!("confusion matrix\n{}", result.confusion_matrix);
    if let Err(e) = result.emit(sink, step) {
        warn!(error = %e, step, "failed to record validation metrics");
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::{Batch, Dataset};
    use crate::data::loader::DataLoader;
    use crate::layers::dense::Parameter;
    use crate::math::matrix::Matrix;
    use crate::metrics::sink::MemorySink;
    use std::sync::Arc;

    /// Returns a fixed logit row per sample; the single input feature is
    /// the sample's index into the table.
    struct Lookup {
        table: Vec<Vec<f64>>,
        classes: usize,
    }

    impl Model for Lookup {
        fn forward(&self, inputs: &Matrix) -> Result<Matrix> {
            Ok(Matrix::from_data(inputs.data.iter().map(|r| self.table[r[0] as usize].clone()).collect()))
        }

        fn accumulate_gradients(&mut self, _batch: &Batch, _grad_scale: f64) -> Result<f64> {
            Ok(0.0)
        }

        fn num_classes(&self) -> usize {
            self.classes
        }

        fn named_parameters(&self) -> Vec<(String, &Parameter)> {
            Vec::new()
        }

        fn named_parameters_mut(&mut self) -> Vec<(String, &mut Parameter)> {
            Vec::new()
        }
    }

    /// 100 samples, 4 classes, label `i % 4`. Every fifth sample is
    /// misclassified as the next class, with its true class ranked second.
    fn fixture() -> (Lookup, DataLoader) {
        let mut table = Vec::new();
        let mut labels = Vec::new();
        for i in 0..100 {
            let y = i % 4;
            let mut row = vec![0.0; 4];
            if i % 5 == 0 {
                row[(y + 1) % 4] = 1.0;
                row[y] = 0.5;
            } else {
                row[y] = 3.0;
            }
            table.push(row);
            labels.push(y);
        }
        let samples = (0..100).map(|i| vec![i as f64]).collect();
        let data = Dataset::new(samples, labels, 4).unwrap();
        (Lookup { table, classes: 4 }, DataLoader::new(Arc::new(data), 32))
    }

    #[test]
    fn hundred_sample_reference_values() {
        let (model, loader) = fixture();
        let mut sink = MemorySink::new();
        let r = evaluate(&model, &loader, &[1, 2, 5], &mut sink, 7).unwrap();

        assert_eq!(r.samples, 100);
        assert!((r.accuracy - 0.8).abs() < 1e-12);

        for c in 0..4 {
            assert_eq!(r.confusion_matrix.get(c, c), 20);
            assert_eq!(r.confusion_matrix.get(c, (c + 1) % 4), 5);
            assert_eq!(r.confusion_matrix.support(c), 25);
        }

        // Per class: 20 confident positives, then the 5 negatives predicted
        // as this class, then its 5 misclassified positives, then the rest.
        let tail: f64 = (1..=5).map(|j| (20.0 + j as f64) / (25.0 + j as f64)).sum();
        let expected_ap = (20.0 + tail) / 25.0;
        for ap in &r.per_class_ap {
            assert!((ap - expected_ap).abs() < 1e-12);
        }
        assert!((r.mean_ap - expected_ap).abs() < 1e-12);

        let e = std::f64::consts::E;
        let confident = (3f64.exp() + 3.0).ln() - 3.0;
        let wrong = (e + 0.5f64.exp() + 2.0).ln() - 0.5;
        assert!((r.loss_avg - (80.0 * confident + 20.0 * wrong) / 100.0).abs() < 1e-9);

        assert!((r.top_k_error[&1] - 0.2).abs() < 1e-12);
        assert_eq!(r.top_k_error[&2], 0.0);
        assert_eq!(r.top_k_error[&5], 0.0);

        assert_eq!(sink.series("test/accuracy"), vec![(7, r.accuracy)]);
        assert_eq!(sink.series("test/mAP").len(), 1);
        assert_eq!(sink.series("test/top5_error").len(), 1);
    }

    #[test]
    fn repeated_passes_do_not_merge() {
        let (model, loader) = fixture();
        let mut sink = MemorySink::new();
        let a = evaluate(&model, &loader, &[1], &mut sink, 1).unwrap();
        let b = evaluate(&model, &loader, &[1], &mut sink, 2).unwrap();
        assert_eq!(a, b);
        assert_eq!(b.confusion_matrix.total(), 100);
    }

    #[test]
    fn empty_evaluation_set_is_an_error() {
        let model = Lookup { table: Vec::new(), classes: 2 };
        let loader = DataLoader::new(Arc::new(Dataset::new(Vec::new(), Vec::new(), 2).unwrap()), 4);
        let err = evaluate(&model, &loader, &[1], &mut MemorySink::new(), 0).unwrap_err();
        assert!(err.to_string().contains("evaluation set is empty"));
    }
}
