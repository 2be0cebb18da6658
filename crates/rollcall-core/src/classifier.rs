//! Probabilistic identity classifier.
//!
//! Pipeline: per-feature standardization, optional PCA reduction (variance
//! driven component count), then a class-balanced RBF-kernel multinomial
//! logistic regression whose softmax outputs are the identity probabilities.

use crate::embedding::fix_length;
use crate::identity::Gallery;
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Minimum arg-max probability for a prediction to count.
pub const PROBABILITY_THRESHOLD: f32 = 0.40;
/// Minimum training-set accuracy for a retrained model to go live.
pub const ACCEPT_ACCURACY: f32 = 0.70;

const EXPLAINED_VARIANCE: f64 = 0.90;
const MIN_COMPONENTS: usize = 20;
const EIGEN_EPS: f64 = 1e-10;

const ITERATIONS: usize = 500;
const REGULARIZATION: f64 = 1e-3;

/// Zero-mean, unit-variance scaling per feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl StandardScaler {
    pub fn fit(x: &Array2<f64>) -> Self {
        let n = x.nrows().max(1) as f64;
        let mean = x.sum_axis(Axis(0)) / n;
        let mut scale = Array1::<f64>::zeros(x.ncols());
        for (j, col) in x.axis_iter(Axis(1)).enumerate() {
            let var = col.iter().map(|v| (v - mean[j]).powi(2)).sum::<f64>() / n;
            let std = var.sqrt();
            scale[j] = if std > 0.0 { std } else { 1.0 };
        }
        Self { mean, scale }
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        (x - &self.mean) / &self.scale
    }
}

/// Principal component projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pca {
    mean: Array1<f64>,
    /// One unit-length component per row.
    components: Array2<f64>,
    explained_ratio: Vec<f64>,
}

impl Pca {
    /// Fit on `x` (rows = samples) through the sample Gram matrix, which is
    /// small because there are far fewer samples than features.
    pub fn fit(x: &Array2<f64>) -> Option<Self> {
        let (n, d) = x.dim();
        if n < 2 {
            return None;
        }
        let mean = x.sum_axis(Axis(0)) / n as f64;
        let centered = x - &mean;
        let gram = centered.dot(&centered.t());
        let (values, vectors) = gram_eigen(&gram);

        let total: f64 = values.iter().filter(|&&v| v > 0.0).sum();
        if total <= 0.0 {
            return None;
        }
        let top = values[0].max(0.0);
        let usable: Vec<usize> = (0..n)
            .filter(|&i| values[i] > EIGEN_EPS * top.max(1.0))
            .collect();

        let max_components = d.min(n - 1).min(usable.len());
        if max_components == 0 {
            return None;
        }
        let ratios: Vec<f64> = usable.iter().map(|&i| values[i] / total).collect();
        let count = component_count(&ratios, max_components);

        let mut components = Array2::<f64>::zeros((count, d));
        for (row, &i) in usable.iter().take(count).enumerate() {
            let u = vectors.column(i);
            let component = centered.t().dot(&u) / values[i].sqrt();
            components.row_mut(row).assign(&component);
        }

        Some(Self {
            mean,
            components,
            explained_ratio: ratios[..count].to_vec(),
        })
    }

    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    pub fn explained_variance(&self) -> f64 {
        self.explained_ratio.iter().sum()
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        (x - &self.mean).dot(&self.components.t())
    }
}

/// Eigenpairs of a symmetric matrix, largest eigenvalue first, eigenvectors
/// as columns.
fn gram_eigen(gram: &Array2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = gram.nrows();
    let eigen = SymmetricEigen::new(DMatrix::from_fn(n, n, |i, j| gram[[i, j]]));
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let values = Array1::from_iter(order.iter().map(|&i| eigen.eigenvalues[i]));
    let vectors = Array2::from_shape_fn((n, n), |(row, col)| eigen.eigenvectors[(row, order[col])]);
    (values, vectors)
}

/// Smallest count reaching the explained-variance target, floored at
/// `MIN_COMPONENTS` when that many exist, capped at `max_components`.
fn component_count(ratios: &[f64], max_components: usize) -> usize {
    let mut cumulative = 0.0;
    let mut count = ratios.len();
    for (i, r) in ratios.iter().enumerate() {
        cumulative += r;
        if cumulative >= EXPLAINED_VARIANCE {
            count = i + 1;
            break;
        }
    }
    if max_components >= MIN_COMPONENTS {
        count = count.max(MIN_COMPONENTS);
    }
    count.clamp(1, max_components)
}

/// RBF-kernel multinomial logistic regression in dual form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelClassifier {
    classes: Vec<String>,
    support: Array2<f64>,
    /// Dual coefficients, one column per class.
    alpha: Array2<f64>,
    bias: Array1<f64>,
    gamma: f64,
}

impl KernelClassifier {
    /// Fit with class-balanced sample weights. `labels[i]` indexes `classes`.
    pub fn fit(x: &Array2<f64>, labels: &[usize], classes: Vec<String>) -> Self {
        let n = x.nrows();
        let k = classes.len();

        let var = variance(x);
        let gamma = if var > 0.0 { 1.0 / (x.ncols() as f64 * var) } else { 1.0 };
        let kernel = rbf_matrix(x, x, gamma);

        let mut counts = vec![0usize; k];
        for &y in labels {
            counts[y] += 1;
        }
        let weights: Vec<f64> = labels
            .iter()
            .map(|&y| n as f64 / (k as f64 * counts[y] as f64))
            .collect();

        // Gershgorin bound on the kernel spectrum keeps the step stable.
        let row_bound = kernel
            .axis_iter(Axis(0))
            .map(|row| row.iter().map(|v| v.abs()).sum::<f64>())
            .fold(1.0_f64, f64::max);
        let max_weight = weights.iter().copied().fold(1.0_f64, f64::max);
        let step = 1.0 / (row_bound * max_weight);

        let mut alpha = Array2::<f64>::zeros((n, k));
        let mut bias = Array1::<f64>::zeros(k);
        for _ in 0..ITERATIONS {
            let scores = kernel.dot(&alpha) + &bias;
            let mut grad = softmax_rows(scores);
            for (i, &y) in labels.iter().enumerate() {
                grad[[i, y]] -= 1.0;
                grad.row_mut(i).mapv_inplace(|g| g * weights[i]);
            }
            let bias_grad = grad.sum_axis(Axis(0)) / n as f64;
            alpha = &alpha - &((&grad + &(&alpha * REGULARIZATION)) * step);
            bias = &bias - &(bias_grad * step);
        }

        Self {
            classes,
            support: x.clone(),
            alpha,
            bias,
            gamma,
        }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Class probabilities for each row of `x`.
    pub fn predict_proba(&self, x: &Array2<f64>) -> Array2<f64> {
        let kernel = rbf_matrix(x, &self.support, self.gamma);
        softmax_rows(kernel.dot(&self.alpha) + &self.bias)
    }
}

fn variance(x: &Array2<f64>) -> f64 {
    let count = x.len();
    if count == 0 {
        return 0.0;
    }
    let mean = x.sum() / count as f64;
    x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64
}

fn rbf_matrix(a: &Array2<f64>, b: &Array2<f64>, gamma: f64) -> Array2<f64> {
    let mut k = Array2::<f64>::zeros((a.nrows(), b.nrows()));
    for (i, ra) in a.axis_iter(Axis(0)).enumerate() {
        for (j, rb) in b.axis_iter(Axis(0)).enumerate() {
            let d2: f64 = ra.iter().zip(rb.iter()).map(|(x, y)| (x - y).powi(2)).sum();
            k[[i, j]] = (-gamma * d2).exp();
        }
    }
    k
}

fn softmax_rows(mut scores: Array2<f64>) -> Array2<f64> {
    for mut row in scores.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|s| (s - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|s| s / sum);
        }
    }
    scores
}

/// A label with its probability.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

/// Trained scaler + reducer + classifier bundle. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierModel {
    pub scaler: StandardScaler,
    pub reducer: Option<Pca>,
    pub classifier: KernelClassifier,
}

impl ClassifierModel {
    pub fn n_features(&self) -> usize {
        self.scaler.n_features()
    }

    /// Arg-max label and probability, without a threshold.
    pub fn classify(&self, v: &[f32]) -> Option<Prediction> {
        if v.len() != self.n_features() || v.iter().any(|x| !x.is_finite()) {
            return None;
        }
        let row = Array2::from_shape_fn((1, v.len()), |(_, j)| v[j] as f64);
        let mut x = self.scaler.transform(&row);
        if let Some(pca) = &self.reducer {
            x = pca.transform(&x);
        }
        let proba = self.classifier.predict_proba(&x);
        let (best, p) = proba
            .row(0)
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        Some(Prediction {
            label: self.classifier.classes.get(best)?.clone(),
            confidence: p as f32,
        })
    }

    /// Prediction accepted only when its probability reaches `threshold`.
    pub fn predict(&self, v: &[f32], threshold: f32) -> Option<Prediction> {
        self.classify(v).filter(|p| p.confidence >= threshold)
    }
}

/// One averaged row per identity.
#[derive(Debug, Clone, Default)]
pub struct TrainingSet {
    pub features: Vec<Vec<f32>>,
    pub labels: Vec<String>,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Average each identity's usable per-angle vectors (length-fixed to `dim`).
/// Identities with no usable angle are skipped.
pub fn build_training_matrix(gallery: &Gallery, dim: usize) -> TrainingSet {
    let mut set = TrainingSet::default();
    for (name, record) in gallery {
        let usable: Vec<Vec<f32>> = record
            .available()
            .filter(|(_, v)| !v.is_empty() && v.iter().all(|x| x.is_finite()))
            .map(|(_, v)| fix_length(v, dim))
            .collect();
        if usable.is_empty() {
            tracing::warn!(name = %name, "no usable samples for training, skipping");
            continue;
        }
        let mut mean = vec![0.0f32; dim];
        for v in &usable {
            for (m, x) in mean.iter_mut().zip(v) {
                *m += x;
            }
        }
        let count = usable.len() as f32;
        mean.iter_mut().for_each(|m| *m /= count);
        set.features.push(mean);
        set.labels.push(name.clone());
    }
    set
}

/// Fit a model, or `None` with no samples or fewer than two distinct labels.
pub fn train(set: &TrainingSet) -> Option<ClassifierModel> {
    let classes: Vec<String> = set
        .labels
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if set.is_empty() || classes.len() < 2 {
        return None;
    }
    let dim = set.features.first()?.len();
    if dim == 0 || set.features.iter().any(|f| f.len() != dim) {
        tracing::warn!("inconsistent training vector lengths");
        return None;
    }

    let x = Array2::from_shape_fn((set.len(), dim), |(i, j)| set.features[i][j] as f64);
    let labels: Vec<usize> = set
        .labels
        .iter()
        .filter_map(|l| classes.iter().position(|c| c == l))
        .collect();

    let scaler = StandardScaler::fit(&x);
    let mut reduced = scaler.transform(&x);
    let reducer = Pca::fit(&reduced);
    if let Some(pca) = &reducer {
        tracing::debug!(
            components = pca.n_components(),
            explained = pca.explained_variance(),
            "fitted PCA reduction"
        );
        reduced = pca.transform(&reduced);
    }

    let classifier = KernelClassifier::fit(&reduced, &labels, classes);
    Some(ClassifierModel {
        scaler,
        reducer,
        classifier,
    })
}

/// Accuracy of a model on the re-derived training matrix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub accuracy: f32,
    pub samples: usize,
    pub per_class: BTreeMap<String, usize>,
}

/// Exact-match accuracy on the gallery's training matrix. Never fails:
/// anything unusable yields the zero evaluation.
pub fn evaluate(model: &ClassifierModel, gallery: &Gallery) -> Evaluation {
    let set = build_training_matrix(gallery, model.n_features());
    if set.is_empty() {
        return Evaluation::default();
    }
    let mut per_class = BTreeMap::new();
    let mut correct = 0usize;
    for (features, label) in set.features.iter().zip(&set.labels) {
        *per_class.entry(label.clone()).or_insert(0) += 1;
        match model.classify(features) {
            Some(p) if &p.label == label => correct += 1,
            Some(_) => {}
            None => return Evaluation::default(),
        }
    }
    Evaluation {
        accuracy: correct as f32 / set.len() as f32,
        samples: set.len(),
        per_class,
    }
}

/// Result of retraining against the current gallery.
#[derive(Debug, Clone)]
pub enum RetrainOutcome {
    Accepted { model: ClassifierModel, accuracy: f32 },
    /// Below the acceptance bar; the caller archives the candidate.
    Rejected { candidate: ClassifierModel, accuracy: f32 },
    Insufficient,
}

pub fn retrain(gallery: &Gallery, dim: usize, accept: f32) -> RetrainOutcome {
    let set = build_training_matrix(gallery, dim);
    let Some(model) = train(&set) else {
        tracing::info!(identities = set.len(), "not enough identities to train");
        return RetrainOutcome::Insufficient;
    };
    let eval = evaluate(&model, gallery);
    tracing::info!(accuracy = eval.accuracy, samples = eval.samples, "evaluated retrained model");
    if eval.accuracy >= accept {
        RetrainOutcome::Accepted {
            model,
            accuracy: eval.accuracy,
        }
    } else {
        RetrainOutcome::Rejected {
            candidate: model,
            accuracy: eval.accuracy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityRecord;
    use crate::types::{Angle, Samples};

    fn record(frontal: Vec<f32>, right: Option<Vec<f32>>) -> IdentityRecord {
        let mut samples = Samples::new();
        samples.insert(Angle::Frontal, Some(frontal));
        samples.insert(Angle::Right, right);
        samples.insert(Angle::Left, None);
        IdentityRecord::new("-", "7O", "ML", samples)
    }

    fn pattern(seed: usize, dim: usize) -> Vec<f32> {
        (0..dim)
            .map(|j| (((seed + 1) * (j + 3)) % 7) as f32 - 3.0 + seed as f32 * 0.1)
            .collect()
    }

    fn gallery(n: usize, dim: usize) -> Gallery {
        (0..n)
            .map(|i| (format!("person{i}"), record(pattern(i, dim), None)))
            .collect()
    }

    #[test]
    fn test_gram_eigen_sorted_descending() {
        let m = ndarray::array![[1.0, 0.0], [0.0, 3.0]];
        let (values, vectors) = gram_eigen(&m);
        assert!((values[0] - 3.0).abs() < 1e-12);
        assert!((values[1] - 1.0).abs() < 1e-12);
        assert!((vectors[[1, 0]].abs() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_gram_eigen_pairs_satisfy_definition() {
        let m = ndarray::array![[4.0, 1.0, 2.0], [1.0, 3.0, 0.5], [2.0, 0.5, 5.0]];
        let (values, vectors) = gram_eigen(&m);
        for i in 0..3 {
            let v = vectors.column(i);
            let mv = m.dot(&v);
            for k in 0..3 {
                assert!((mv[k] - values[i] * v[k]).abs() < 1e-9);
            }
            assert!((v.dot(&v) - 1.0).abs() < 1e-9);
        }
        assert!(values[0] >= values[1] && values[1] >= values[2]);
    }

    #[test]
    fn test_training_matrix_averages_angles() {
        let mut g = Gallery::new();
        g.insert("Ana".into(), record(vec![1.0, 2.0], Some(vec![3.0, 4.0, 9.0])));
        g.insert("Bad".into(), record(vec![f32::NAN, 1.0], None));
        let set = build_training_matrix(&g, 2);
        assert_eq!(set.labels, vec!["Ana".to_string()]);
        assert_eq!(set.features[0], vec![2.0, 3.0]);
    }

    #[test]
    fn test_train_requires_two_labels() {
        assert!(train(&TrainingSet::default()).is_none());
        let set = build_training_matrix(&gallery(1, 8), 8);
        assert!(train(&set).is_none());
    }

    #[test]
    fn test_component_count_rules() {
        assert_eq!(component_count(&[0.5, 0.3, 0.15, 0.05], 4), 3);
        assert_eq!(component_count(&[0.95, 0.05], 1), 1);
        let mut steep = vec![0.91];
        steep.extend(vec![0.09 / 24.0; 24]);
        assert_eq!(component_count(&steep, 25), 20);
    }

    #[test]
    fn test_pca_skipped_for_single_sample() {
        let x = Array2::<f64>::ones((1, 4));
        assert!(Pca::fit(&x).is_none());
    }

    #[test]
    fn test_separated_identities_recognized() {
        let dim = 16;
        let g = gallery(3, dim);
        let set = build_training_matrix(&g, dim);
        let model = train(&set).unwrap();
        assert_eq!(model.n_features(), dim);
        assert!(model.reducer.is_some());

        for (features, label) in set.features.iter().zip(&set.labels) {
            let p = model.predict(features, PROBABILITY_THRESHOLD).unwrap();
            assert_eq!(&p.label, label);
        }
        let eval = evaluate(&model, &g);
        assert_eq!(eval.accuracy, 1.0);
        assert_eq!(eval.samples, 3);
        assert_eq!(eval.per_class.len(), 3);
    }

    #[test]
    fn test_predict_rejects_wrong_length() {
        let g = gallery(2, 8);
        let model = train(&build_training_matrix(&g, 8)).unwrap();
        assert!(model.predict(&[0.0; 7], 0.0).is_none());
        assert!(model.predict(&[f32::NAN; 8], 0.0).is_none());
    }

    #[test]
    fn test_predict_threshold() {
        let g = gallery(2, 8);
        let model = train(&build_training_matrix(&g, 8)).unwrap();
        let v = pattern(0, 8);
        assert!(model.predict(&v, 1.01).is_none());
        assert!(model.predict(&v, 0.0).is_some());
    }

    #[test]
    fn test_retrain_outcomes() {
        assert!(matches!(retrain(&gallery(1, 8), 8, ACCEPT_ACCURACY), RetrainOutcome::Insufficient));
        match retrain(&gallery(3, 8), 8, ACCEPT_ACCURACY) {
            RetrainOutcome::Accepted { accuracy, .. } => assert_eq!(accuracy, 1.0),
            other => panic!("expected acceptance, got {other:?}"),
        }
        assert!(matches!(retrain(&gallery(3, 8), 8, 1.5), RetrainOutcome::Rejected { .. }));
    }

    #[test]
    fn test_model_serializes() {
        let g = gallery(2, 8);
        let model = train(&build_training_matrix(&g, 8)).unwrap();
        let json = serde_json::to_string(&model).unwrap();
        let back: ClassifierModel = serde_json::from_str(&json).unwrap();
        let v = pattern(1, 8);
        assert_eq!(model.classify(&v).unwrap().label, back.classify(&v).unwrap().label);
    }
}
