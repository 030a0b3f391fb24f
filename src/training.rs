//! Offline training job: join labels, split customers, fit the pipeline and
//! the classifier, evaluate, and assemble a model artifact.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregator::AggregatedCustomerRow;
use crate::classifier::{
    ClassificationMetrics, ClassifierConfig, ClassifierError, LogisticRegression, ModelKind,
    RiskClassifier, TrainedClassifier,
};
use crate::forest::{ForestConfig, RandomForest};
use crate::pipeline::{FeaturePipeline, PipelineConfig, PipelineError, PipelineRunReport};
use crate::record::{RecordError, TransactionRecord};
use crate::registry::ModelArtifact;

pub const DEFAULT_MODEL_NAME: &str = "CreditRiskModel";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerLabel {
    #[serde(rename = "CustomerId")]
    pub customer_id: String,
    #[serde(rename = "is_high_risk")]
    pub is_high_risk: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub model_name: String,
    pub pipeline: PipelineConfig,
    pub classifier: ClassifierConfig,
    pub forest: ForestConfig,
    /// Fitted in order; the best test ROC AUC wins and ties keep the earlier one.
    pub candidates: Vec<ModelKind>,
    /// Share of customers held out for evaluation.
    pub test_fraction: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL_NAME.to_string(),
            pipeline: PipelineConfig::default(),
            classifier: ClassifierConfig::default(),
            forest: ForestConfig::default(),
            candidates: ModelKind::ALL.to_vec(),
            test_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub train_customers: u64,
    pub test_customers: u64,
    pub unlabeled_customers: u64,
    pub pipeline: PipelineRunReport,
    pub selected_model: ModelKind,
    /// Metrics of the selected model.
    pub metrics: ClassificationMetrics,
    pub candidates: Vec<CandidateReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateReport {
    pub model: ModelKind,
    pub metrics: ClassificationMetrics,
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub artifact: ModelArtifact,
    pub report: TrainingReport,
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training config: {0}")]
    InvalidConfig(String),
    #[error("labels CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error("no customer in the batch has a label")]
    NoLabeledCustomers,
    #[error("customer split left the {0} set empty")]
    EmptySplit(&'static str),
}

pub fn load_labels_csv(path: &Path) -> Result<Vec<CustomerLabel>, TrainingError> {
    let file = File::open(path)?;
    let labels = read_labels_csv(file)?;
    info!(
        component = "training",
        event = "training.labels.loaded",
        path = %path.display(),
        rows = labels.len()
    );
    Ok(labels)
}

/// Reads `CustomerId,is_high_risk` rows; other columns are ignored.
pub fn read_labels_csv<R: Read>(reader: R) -> Result<Vec<CustomerLabel>, TrainingError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut labels: Vec<CustomerLabel> = Vec::new();
    for row in reader.deserialize() {
        labels.push(row?);
    }
    Ok(labels)
}

/// Collapses labels to one per customer, keeping the maximum.
pub fn max_label_per_customer(labels: &[CustomerLabel]) -> HashMap<String, u8> {
    let mut out: HashMap<String, u8> = HashMap::new();
    for label in labels {
        out.entry(label.customer_id.clone())
            .and_modify(|current| *current = (*current).max(label.is_high_risk))
            .or_insert(label.is_high_risk);
    }
    out
}

/// Inner join of aggregated rows against per-customer labels. Row order is
/// preserved; unlabeled customers are dropped.
pub fn join_labels(
    rows: Vec<AggregatedCustomerRow>,
    labels: &HashMap<String, u8>,
) -> (Vec<AggregatedCustomerRow>, Vec<u8>) {
    rows.into_iter()
        .filter_map(|row| labels.get(&row.customer_id).map(|label| (row, *label)))
        .unzip()
}

/// Deterministically assigns a customer to the test split by hashing its id.
pub fn is_test_customer(customer_id: &str, test_fraction: f64) -> bool {
    let digest = Sha256::digest(customer_id.as_bytes());
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let unit = u64::from_be_bytes(prefix) as f64 / u64::MAX as f64;
    unit < test_fraction
}

/// Partitions transactions by customer so no customer straddles both sets.
pub fn split_by_customer(
    batch: &[TransactionRecord],
    test_fraction: f64,
) -> (Vec<TransactionRecord>, Vec<TransactionRecord>) {
    batch
        .iter()
        .cloned()
        .partition(|record| !is_test_customer(&record.customer_id, test_fraction))
}

pub fn train_risk_model(
    transactions: &[TransactionRecord],
    labels: &[CustomerLabel],
    config: &TrainingConfig,
) -> Result<TrainingOutcome, TrainingError> {
    if !(config.test_fraction > 0.0 && config.test_fraction < 1.0) {
        return Err(TrainingError::InvalidConfig(format!(
            "test_fraction must be in (0, 1), got {}",
            config.test_fraction
        )));
    }
    if config.model_name.trim().is_empty() {
        return Err(TrainingError::InvalidConfig(
            "model_name must not be empty".to_string(),
        ));
    }
    if config.candidates.is_empty() {
        return Err(TrainingError::InvalidConfig(
            "at least one candidate model is required".to_string(),
        ));
    }

    info!(
        component = "training",
        event = "training.start",
        model_name = %config.model_name,
        transactions = transactions.len(),
        labels = labels.len(),
        test_fraction = config.test_fraction
    );

    let label_map = max_label_per_customer(labels);
    let (train_batch, test_batch) = split_by_customer(transactions, config.test_fraction);
    if train_batch.is_empty() {
        return Err(TrainingError::EmptySplit("train"));
    }
    if test_batch.is_empty() {
        return Err(TrainingError::EmptySplit("test"));
    }

    let mut pipeline = FeaturePipeline::new(config.pipeline);
    let (train_rows, pipeline_report) = pipeline.fit_transform(&train_batch)?;
    let (test_rows, _) = pipeline.transform(&test_batch)?;

    let customers = train_rows.len() + test_rows.len();
    let (train_rows, train_labels) = join_labels(train_rows, &label_map);
    let (test_rows, test_labels) = join_labels(test_rows, &label_map);
    let unlabeled = customers - train_rows.len() - test_rows.len();
    if train_rows.is_empty() && test_rows.is_empty() {
        return Err(TrainingError::NoLabeledCustomers);
    }
    if unlabeled > 0 {
        warn!(
            component = "training",
            event = "training.unlabeled_customers",
            unlabeled
        );
    }
    if train_rows.is_empty() {
        return Err(TrainingError::EmptySplit("labeled train"));
    }
    if test_rows.is_empty() {
        return Err(TrainingError::EmptySplit("labeled test"));
    }

    let mut candidates = Vec::with_capacity(config.candidates.len());
    let mut best: Option<(TrainedClassifier, ClassificationMetrics)> = None;
    for kind in &config.candidates {
        let classifier = fit_candidate(*kind, &train_rows, &train_labels, config)?;
        let probabilities = classifier.predict_proba(&test_rows)?;
        let metrics = ClassificationMetrics::evaluate(&test_labels, &probabilities)?;
        info!(
            component = "training",
            event = "training.candidate.evaluated",
            model = %kind,
            accuracy = metrics.accuracy,
            f1 = metrics.f1,
            roc_auc = ?metrics.roc_auc
        );
        candidates.push(CandidateReport {
            model: *kind,
            metrics,
        });
        let improves = match &best {
            Some((_, current)) => ranks_above(&metrics, current),
            None => true,
        };
        if improves {
            best = Some((classifier, metrics));
        }
    }
    let Some((classifier, metrics)) = best else {
        return Err(TrainingError::InvalidConfig(
            "at least one candidate model is required".to_string(),
        ));
    };
    let selected_model = classifier.kind();

    info!(
        component = "training",
        event = "training.finish",
        model_name = %config.model_name,
        selected_model = %selected_model,
        train_customers = train_rows.len(),
        test_customers = test_rows.len(),
        accuracy = metrics.accuracy,
        precision = metrics.precision,
        recall = metrics.recall,
        f1 = metrics.f1,
        roc_auc = ?metrics.roc_auc
    );

    let artifact = ModelArtifact::new(
        config.model_name.clone(),
        pipeline.state()?,
        classifier,
        Some(metrics),
    );
    Ok(TrainingOutcome {
        artifact,
        report: TrainingReport {
            train_customers: train_rows.len() as u64,
            test_customers: test_rows.len() as u64,
            unlabeled_customers: unlabeled as u64,
            pipeline: pipeline_report,
            selected_model,
            metrics,
            candidates,
        },
    })
}

fn fit_candidate(
    kind: ModelKind,
    rows: &[AggregatedCustomerRow],
    labels: &[u8],
    config: &TrainingConfig,
) -> Result<TrainedClassifier, ClassifierError> {
    Ok(match kind {
        ModelKind::LogisticRegression => TrainedClassifier::LogisticRegression(
            LogisticRegression::fit(rows, labels, &config.classifier)?,
        ),
        ModelKind::RandomForest => {
            TrainedClassifier::RandomForest(RandomForest::fit(rows, labels, &config.forest)?)
        }
    })
}

/// Strictly higher ROC AUC wins. An undefined AUC ranks below any defined one.
fn ranks_above(candidate: &ClassificationMetrics, current: &ClassificationMetrics) -> bool {
    match (candidate.roc_auc, current.roc_auc) {
        (Some(candidate), Some(current)) => candidate > current,
        (Some(_), None) => true,
        (None, _) => false,
    }
}
