//! Binary risk classifier over aggregated customer rows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::aggregator::AggregatedCustomerRow;
use crate::forest::RandomForest;

pub const MODEL_FEATURES: [&str; 4] = [
    "TotalTransactionAmount",
    "AverageTransactionAmount",
    "TransactionCount",
    "StdTransactionAmount",
];

const ZERO_SCALE_EPSILON: f64 = 10.0 * f64::EPSILON;
const DEFAULT_THRESHOLD: f64 = 0.5;

/// Classifier input for one customer. A null sample std (single transaction)
/// is fed as 0.0.
pub fn feature_vector(row: &AggregatedCustomerRow) -> Vec<f64> {
    vec![
        row.total_transaction_amount,
        row.average_transaction_amount,
        row.transaction_count as f64,
        row.std_transaction_amount.unwrap_or(0.0),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomerRiskScore {
    pub customer_id: String,
    pub risk_probability: f64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClassifierError {
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("got {rows} rows but {labels} labels")]
    LengthMismatch { rows: usize, labels: usize },
    #[error("labels must be 0 or 1, got {0}")]
    InvalidLabel(u8),
    #[error("training labels contain a single class ({0})")]
    SingleClass(u8),
    #[error("expected {expected} features, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid classifier config: {0}")]
    InvalidConfig(String),
    #[error("non-finite value in {0}")]
    NonFinite(String),
}

pub trait RiskClassifier: Send + Sync {
    fn feature_names(&self) -> &[String];

    /// Probability of the positive (high-risk) class for each row.
    fn predict_proba(&self, rows: &[AggregatedCustomerRow]) -> Result<Vec<f64>, ClassifierError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub learning_rate: f64,
    pub max_iterations: usize,
    pub l2_penalty: f64,
    /// Stop once every gradient component is below this.
    pub tolerance: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.5,
            max_iterations: 2_000,
            l2_penalty: 1e-3,
            tolerance: 1e-6,
        }
    }
}

/// L2-regularized logistic regression trained by batch gradient descent on
/// internally standardized features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    pub feature_names: Vec<String>,
    pub feature_means: Vec<f64>,
    pub feature_scales: Vec<f64>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
    pub iterations: usize,
}

impl LogisticRegression {
    pub fn fit(
        rows: &[AggregatedCustomerRow],
        labels: &[u8],
        config: &ClassifierConfig,
    ) -> Result<Self, ClassifierError> {
        validate_config(config)?;
        let raw = training_matrix(rows, labels)?;

        let width = MODEL_FEATURES.len();
        let n = raw.len() as f64;
        let mut feature_means = vec![0.0; width];
        let mut feature_scales = vec![1.0; width];
        for j in 0..width {
            let mean = raw.iter().map(|x| x[j]).sum::<f64>() / n;
            let variance = raw.iter().map(|x| (x[j] - mean).powi(2)).sum::<f64>() / n;
            let std = variance.sqrt();
            feature_means[j] = mean;
            feature_scales[j] = if std < ZERO_SCALE_EPSILON { 1.0 } else { std };
        }
        let standardized: Vec<Vec<f64>> = raw
            .iter()
            .map(|x| standardize(x, &feature_means, &feature_scales))
            .collect();
        let targets: Vec<f64> = labels.iter().map(|label| f64::from(*label)).collect();

        let mut coefficients = vec![0.0; width];
        let mut intercept = 0.0;
        let mut iterations = 0;
        while iterations < config.max_iterations {
            iterations += 1;

            let mut grad_w = vec![0.0; width];
            let mut grad_b = 0.0;
            for (x, y) in standardized.iter().zip(&targets) {
                let err = sigmoid(dot(&coefficients, x) + intercept) - y;
                for (g, xj) in grad_w.iter_mut().zip(x) {
                    *g += err * xj;
                }
                grad_b += err;
            }
            for (g, w) in grad_w.iter_mut().zip(&coefficients) {
                *g = *g / n + config.l2_penalty * w;
            }
            grad_b /= n;

            for (w, g) in coefficients.iter_mut().zip(&grad_w) {
                *w -= config.learning_rate * g;
            }
            intercept -= config.learning_rate * grad_b;

            let max_grad = grad_w.iter().fold(grad_b.abs(), |acc, g| acc.max(g.abs()));
            if max_grad < config.tolerance {
                break;
            }
        }

        info!(
            component = "classifier",
            event = "classifier.fit.finish",
            rows = rows.len(),
            positives = labels.iter().filter(|label| **label == 1).count(),
            iterations
        );

        Ok(Self {
            feature_names: MODEL_FEATURES.iter().map(|name| name.to_string()).collect(),
            feature_means,
            feature_scales,
            coefficients,
            intercept,
            iterations,
        })
    }

    /// Checks internal consistency of a deserialized model.
    pub fn validate(&self) -> Result<(), ClassifierError> {
        let expected = self.feature_names.len();
        for len in [
            self.feature_means.len(),
            self.feature_scales.len(),
            self.coefficients.len(),
        ] {
            if len != expected {
                return Err(ClassifierError::DimensionMismatch {
                    expected,
                    actual: len,
                });
            }
        }
        check_feature_names(&self.feature_names)?;
        let finite = self
            .feature_means
            .iter()
            .chain(&self.coefficients)
            .chain(std::iter::once(&self.intercept))
            .all(|v| v.is_finite());
        if !finite || self.feature_scales.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(ClassifierError::NonFinite("model parameters".to_string()));
        }
        Ok(())
    }

    pub fn decision_function(&self, features: &[f64]) -> Result<f64, ClassifierError> {
        if features.len() != self.coefficients.len() {
            return Err(ClassifierError::DimensionMismatch {
                expected: self.coefficients.len(),
                actual: features.len(),
            });
        }
        let x = standardize(features, &self.feature_means, &self.feature_scales);
        Ok(dot(&self.coefficients, &x) + self.intercept)
    }
}

impl RiskClassifier for LogisticRegression {
    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn predict_proba(&self, rows: &[AggregatedCustomerRow]) -> Result<Vec<f64>, ClassifierError> {
        rows.iter()
            .map(|row| self.decision_function(&feature_vector(row)).map(sigmoid))
            .collect()
    }
}

/// Model families the training job can fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    LogisticRegression,
    RandomForest,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [Self::LogisticRegression, Self::RandomForest];

    pub fn name(self) -> &'static str {
        match self {
            Self::LogisticRegression => "logistic_regression",
            Self::RandomForest => "random_forest",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = ClassifierError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == normalized)
            .ok_or_else(|| ClassifierError::InvalidConfig(format!("unknown model kind '{raw}'")))
    }
}

/// A fitted classifier of any supported kind, as stored in model artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainedClassifier {
    LogisticRegression(LogisticRegression),
    RandomForest(RandomForest),
}

impl TrainedClassifier {
    pub fn kind(&self) -> ModelKind {
        match self {
            Self::LogisticRegression(_) => ModelKind::LogisticRegression,
            Self::RandomForest(_) => ModelKind::RandomForest,
        }
    }

    pub fn validate(&self) -> Result<(), ClassifierError> {
        match self {
            Self::LogisticRegression(model) => model.validate(),
            Self::RandomForest(model) => model.validate(),
        }
    }

    /// Feeds the kind, feature names and every fitted parameter into `hasher`.
    pub(crate) fn hash_parameters(&self, hasher: &mut Sha256) {
        hasher.update(format!("kind:{};features:", self.kind()));
        for name in self.feature_names() {
            hasher.update(name.as_bytes());
            hasher.update(",");
        }
        hasher.update(";parameters:");
        match self {
            Self::LogisticRegression(model) => {
                for value in model
                    .feature_means
                    .iter()
                    .chain(&model.feature_scales)
                    .chain(&model.coefficients)
                    .chain(std::iter::once(&model.intercept))
                {
                    hasher.update(format!("{:016x},", value.to_bits()));
                }
            }
            Self::RandomForest(model) => model.hash_parameters(hasher),
        }
    }
}

impl RiskClassifier for TrainedClassifier {
    fn feature_names(&self) -> &[String] {
        match self {
            Self::LogisticRegression(model) => model.feature_names(),
            Self::RandomForest(model) => model.feature_names(),
        }
    }

    fn predict_proba(&self, rows: &[AggregatedCustomerRow]) -> Result<Vec<f64>, ClassifierError> {
        match self {
            Self::LogisticRegression(model) => model.predict_proba(rows),
            Self::RandomForest(model) => model.predict_proba(rows),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// `None` when only one class is present in `labels`.
    pub roc_auc: Option<f64>,
}

impl ClassificationMetrics {
    /// Scores probabilities against labels at a 0.5 threshold. Undefined
    /// ratios (no predicted or no actual positives) are reported as 0.
    pub fn evaluate(labels: &[u8], probabilities: &[f64]) -> Result<Self, ClassifierError> {
        if labels.len() != probabilities.len() {
            return Err(ClassifierError::LengthMismatch {
                rows: probabilities.len(),
                labels: labels.len(),
            });
        }
        if labels.is_empty() {
            return Err(ClassifierError::EmptyTrainingSet);
        }

        let (mut tp, mut fp, mut tn, mut fn_) = (0_u64, 0_u64, 0_u64, 0_u64);
        for (label, p) in labels.iter().zip(probabilities) {
            match (*label == 1, *p >= DEFAULT_THRESHOLD) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (false, false) => tn += 1,
                (true, false) => fn_ += 1,
            }
        }

        let ratio = |num: u64, den: u64| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };

        Ok(Self {
            accuracy: ratio(tp + tn, tp + fp + tn + fn_),
            precision,
            recall,
            f1,
            roc_auc: roc_auc(labels, probabilities),
        })
    }
}

/// Rank-based (Mann-Whitney) ROC AUC with average ranks for tied scores.
fn roc_auc(labels: &[u8], scores: &[f64]) -> Option<f64> {
    let positives = labels.iter().filter(|label| **label == 1).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*a].total_cmp(&scores[*b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && scores[order[end]] == scores[order[start]] {
            end += 1;
        }
        // 1-based ranks start..end share their average.
        let average = (start + 1 + end) as f64 / 2.0;
        for idx in &order[start..end] {
            ranks[*idx] = average;
        }
        start = end;
    }

    let positive_rank_sum: f64 = labels
        .iter()
        .zip(&ranks)
        .filter(|(label, _)| **label == 1)
        .map(|(_, rank)| rank)
        .sum();
    let p = positives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64))
}

/// Checks labels against rows and returns the raw feature matrix.
pub(crate) fn training_matrix(
    rows: &[AggregatedCustomerRow],
    labels: &[u8],
) -> Result<Vec<Vec<f64>>, ClassifierError> {
    if rows.is_empty() {
        return Err(ClassifierError::EmptyTrainingSet);
    }
    if rows.len() != labels.len() {
        return Err(ClassifierError::LengthMismatch {
            rows: rows.len(),
            labels: labels.len(),
        });
    }
    if let Some(bad) = labels.iter().find(|label| **label > 1) {
        return Err(ClassifierError::InvalidLabel(*bad));
    }
    if labels.iter().all(|label| *label == labels[0]) {
        return Err(ClassifierError::SingleClass(labels[0]));
    }

    let raw: Vec<Vec<f64>> = rows.iter().map(feature_vector).collect();
    if raw.iter().flatten().any(|v| !v.is_finite()) {
        return Err(ClassifierError::NonFinite("training features".to_string()));
    }
    Ok(raw)
}

pub(crate) fn check_feature_names(names: &[String]) -> Result<(), ClassifierError> {
    if names
        .iter()
        .map(String::as_str)
        .ne(MODEL_FEATURES.iter().copied())
    {
        return Err(ClassifierError::InvalidConfig(format!(
            "feature names {names:?} do not match model inputs"
        )));
    }
    Ok(())
}

fn validate_config(config: &ClassifierConfig) -> Result<(), ClassifierError> {
    if !(config.learning_rate.is_finite() && config.learning_rate > 0.0) {
        return Err(ClassifierError::InvalidConfig(
            "learning_rate must be positive".to_string(),
        ));
    }
    if config.max_iterations == 0 {
        return Err(ClassifierError::InvalidConfig(
            "max_iterations must be at least 1".to_string(),
        ));
    }
    if !(config.l2_penalty.is_finite() && config.l2_penalty >= 0.0) {
        return Err(ClassifierError::InvalidConfig(
            "l2_penalty must be non-negative".to_string(),
        ));
    }
    Ok(())
}

fn standardize(x: &[f64], means: &[f64], scales: &[f64]) -> Vec<f64> {
    x.iter()
        .zip(means.iter().zip(scales))
        .map(|(v, (mean, scale))| (v - mean) / scale)
        .collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}
