//! Two-phase feature pipeline: extract time features, encode columns, then
//! aggregate per customer.
//!
//! `fit_transform` learns encoder state and links the aggregator to the
//! encoder's output schema; `transform` replays the same steps with the frozen
//! state. A fitted pipeline is never mutated by `transform`, so it can be moved
//! into an `Arc` and shared across request handlers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::aggregator::{AggregateError, AggregatedCustomerRow, CustomerAggregator};
use crate::encoder::{
    ColumnWiseEncoder, EncodedFeatureMatrix, EncodedSchema, EncoderConfig, EncoderError,
    FittedEncoderState,
};
use crate::record::TransactionRecord;
use crate::time_features::{
    TimeFeatureError, TimeFeatureExtractor, TimeFeatureReport, TimestampPolicy,
};

pub const PIPELINE_STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub timestamp_policy: TimestampPolicy,
    pub encoder: EncoderConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRunReport {
    pub input_rows: u64,
    pub customers: u64,
    pub time_features: TimeFeatureReport,
}

/// Serialized form of a fitted pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub version: u32,
    pub fingerprint: String,
    pub config: PipelineConfig,
    pub encoder: FittedEncoderState,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("malformed timestamp at row {row}: '{value}'")]
    MalformedTimestamp { row: usize, value: String },
    #[error("pipeline is not fitted; call fit_transform first")]
    NotFitted,
    #[error("pipeline configuration error: {0}")]
    Configuration(String),
    #[error("pipeline schema error: {0}")]
    Schema(String),
    #[error("cannot fit pipeline on an empty batch")]
    EmptyBatch,
    #[error("incompatible pipeline state: {0}")]
    IncompatibleState(String),
    #[error("column {column} produced non-finite statistics during fit")]
    NonFiniteStatistics { column: String },
    #[error("pipeline state version mismatch: expected {expected}, got {actual}")]
    StateVersionMismatch { expected: u32, actual: u32 },
    #[error("pipeline state fingerprint mismatch: expected {expected}, got {actual}")]
    StateFingerprintMismatch { expected: String, actual: String },
}

impl From<TimeFeatureError> for PipelineError {
    fn from(err: TimeFeatureError) -> Self {
        match err {
            TimeFeatureError::MalformedTimestamp { row, value } => {
                Self::MalformedTimestamp { row, value }
            }
        }
    }
}

impl From<EncoderError> for PipelineError {
    fn from(err: EncoderError) -> Self {
        match err {
            EncoderError::NotFitted => Self::NotFitted,
            EncoderError::EmptyBatch => Self::EmptyBatch,
            EncoderError::IncompatibleState(message) => Self::IncompatibleState(message),
            EncoderError::NonFiniteStatistics { column } => Self::NonFiniteStatistics {
                column: column.to_string(),
            },
        }
    }
}

impl From<AggregateError> for PipelineError {
    fn from(err: AggregateError) -> Self {
        match err {
            AggregateError::Configuration(message) => Self::Configuration(message),
            AggregateError::Schema(message) => Self::Schema(message),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeaturePipeline {
    config: PipelineConfig,
    extractor: TimeFeatureExtractor,
    encoder: ColumnWiseEncoder,
    aggregator: CustomerAggregator,
}

impl FeaturePipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            extractor: TimeFeatureExtractor::new(config.timestamp_policy),
            encoder: ColumnWiseEncoder::new(config.encoder),
            aggregator: CustomerAggregator::new(),
        }
    }

    /// Rebuilds a fitted pipeline from persisted state after checking its
    /// version and fingerprint.
    pub fn from_state(state: PipelineState) -> Result<Self, PipelineError> {
        assert_state_compatible(
            PIPELINE_STATE_VERSION,
            &pipeline_fingerprint(&state.config, &state.encoder),
            &state,
        )?;
        if state.config.encoder != state.encoder.config {
            return Err(PipelineError::IncompatibleState(
                "encoder config differs from pipeline config".to_string(),
            ));
        }

        let encoder = ColumnWiseEncoder::from_state(state.encoder)?;
        let mut aggregator = CustomerAggregator::new();
        aggregator.configure(encoder.schema()?);

        Ok(Self {
            config: state.config,
            extractor: TimeFeatureExtractor::new(state.config.timestamp_policy),
            encoder,
            aggregator,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        self.encoder.is_fitted() && self.aggregator.is_configured()
    }

    pub fn schema(&self) -> Result<&EncodedSchema, PipelineError> {
        Ok(self.encoder.schema()?)
    }

    pub fn state(&self) -> Result<PipelineState, PipelineError> {
        let encoder = self.encoder.state()?.clone();
        Ok(PipelineState {
            version: PIPELINE_STATE_VERSION,
            fingerprint: pipeline_fingerprint(&self.config, &encoder),
            config: self.config,
            encoder,
        })
    }

    pub fn fit_transform(
        &mut self,
        batch: &[TransactionRecord],
    ) -> Result<(Vec<AggregatedCustomerRow>, PipelineRunReport), PipelineError> {
        info!(
            component = "pipeline",
            event = "pipeline.fit.start",
            rows = batch.len(),
            timestamp_policy = ?self.config.timestamp_policy,
            include_time_features = self.config.encoder.include_time_features
        );

        let (timed, time_report) = self.extractor.transform(batch)?;
        let (matrix, schema) = self.encoder.fit_transform(&timed)?;
        self.aggregator.configure(&schema);
        let rows = self.aggregator.fit_transform(&matrix)?;

        let report = run_report(batch.len(), rows.len(), time_report);
        info!(
            component = "pipeline",
            event = "pipeline.fit.finish",
            input_rows = report.input_rows,
            customers = report.customers,
            malformed_timestamps = report.time_features.malformed_rows,
            fingerprint = %schema.fingerprint
        );
        Ok((rows, report))
    }

    pub fn transform(
        &self,
        batch: &[TransactionRecord],
    ) -> Result<(Vec<AggregatedCustomerRow>, PipelineRunReport), PipelineError> {
        let (matrix, time_report) = self.encode(batch)?;
        let rows = self.aggregator.transform(&matrix)?;
        let report = run_report(batch.len(), rows.len(), time_report);
        Ok((rows, report))
    }

    /// Runs extraction and encoding only, returning the per-transaction matrix.
    pub fn encode(
        &self,
        batch: &[TransactionRecord],
    ) -> Result<(EncodedFeatureMatrix, TimeFeatureReport), PipelineError> {
        if !self.is_fitted() {
            return Err(PipelineError::NotFitted);
        }
        let (timed, time_report) = self.extractor.transform(batch)?;
        let (matrix, _) = self.encoder.transform(&timed)?;
        Ok((matrix, time_report))
    }
}

pub fn assert_state_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &PipelineState,
) -> Result<(), PipelineError> {
    if expected_version != actual.version {
        return Err(PipelineError::StateVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(PipelineError::StateFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn run_report(
    input_rows: usize,
    customers: usize,
    time_features: TimeFeatureReport,
) -> PipelineRunReport {
    PipelineRunReport {
        input_rows: input_rows as u64,
        customers: customers as u64,
        time_features,
    }
}

fn pipeline_fingerprint(config: &PipelineConfig, encoder: &FittedEncoderState) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{PIPELINE_STATE_VERSION};"));
    hasher.update(format!("timestamp_policy:{:?};", config.timestamp_policy));
    hasher.update(format!(
        "include_time_features:{};",
        config.encoder.include_time_features
    ));
    hasher.update(format!("encoder_version:{};", encoder.version));
    hasher.update("numeric:");
    for stats in &encoder.numeric {
        hasher.update(format!(
            "{}:{:016x}:{:016x}:{:016x};",
            stats.column.name(),
            stats.impute_value.to_bits(),
            stats.mean.to_bits(),
            stats.scale.to_bits()
        ));
    }
    hasher.update("categorical:");
    for vocab in &encoder.categorical {
        hasher.update(format!("{}:{}=", vocab.column.name(), vocab.impute_value));
        for category in &vocab.categories {
            hasher.update(format!("{},", category.len()));
            hasher.update(category.as_bytes());
        }
        hasher.update(";");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(customer: &str, amount: f64, ts: &str) -> TransactionRecord {
        TransactionRecord {
            customer_id: customer.to_string(),
            currency_code: "UGX".to_string(),
            country_code: "256".to_string(),
            provider_id: "P1".to_string(),
            product_category: "airtime".to_string(),
            channel_id: "web".to_string(),
            amount,
            value: amount.abs(),
            transaction_start_time: ts.to_string(),
            pricing_strategy: "2".to_string(),
        }
    }

    fn batch() -> Vec<TransactionRecord> {
        vec![
            tx("100", 50.0, "2025-06-01 12:00:00"),
            tx("100", 60.0, "2025-06-01 13:00:00"),
            tx("200", 70.0, "2025-06-02 09:30:00"),
        ]
    }

    #[test]
    fn transform_before_fit_is_not_fitted() {
        let pipeline = FeaturePipeline::default();
        assert_eq!(
            pipeline.transform(&batch()).expect_err("not fitted"),
            PipelineError::NotFitted
        );
        assert_eq!(
            pipeline.encode(&batch()).expect_err("not fitted"),
            PipelineError::NotFitted
        );
        assert!(matches!(pipeline.state(), Err(PipelineError::NotFitted)));
    }

    #[test]
    fn state_fingerprint_is_stable_and_detects_tampering() {
        let mut pipeline = FeaturePipeline::default();
        pipeline.fit_transform(&batch()).expect("fit succeeds");

        let state = pipeline.state().expect("fitted");
        assert_eq!(state.fingerprint, pipeline.state().expect("fitted").fingerprint);
        assert_eq!(state.fingerprint.len(), 64);

        let mut tampered = state.clone();
        tampered.encoder.numeric[0].mean += 1.0;
        assert!(matches!(
            FeaturePipeline::from_state(tampered),
            Err(PipelineError::StateFingerprintMismatch { .. })
        ));

        let mut future = state;
        future.version = PIPELINE_STATE_VERSION + 1;
        assert_eq!(
            FeaturePipeline::from_state(future).expect_err("version bumped"),
            PipelineError::StateVersionMismatch {
                expected: PIPELINE_STATE_VERSION,
                actual: PIPELINE_STATE_VERSION + 1
            }
        );
    }

    #[test]
    fn run_report_counts_rows_customers_and_bad_timestamps() {
        let mut records = batch();
        records.push(tx("300", 10.0, "garbage"));
        let mut pipeline = FeaturePipeline::default();

        let (rows, report) = pipeline.fit_transform(&records).expect("lenient fit");

        assert_eq!(rows.len(), 3);
        assert_eq!(report.input_rows, 4);
        assert_eq!(report.customers, 3);
        assert_eq!(report.time_features.malformed_rows, 1);
        assert_eq!(report.time_features.malformed[0].row, 3);
    }

    #[test]
    fn sub_stage_errors_map_onto_pipeline_errors() {
        assert_eq!(
            PipelineError::from(AggregateError::Schema("x".to_string())),
            PipelineError::Schema("x".to_string())
        );
        assert_eq!(
            PipelineError::from(EncoderError::EmptyBatch),
            PipelineError::EmptyBatch
        );
        let mut pipeline = FeaturePipeline::default();
        assert_eq!(
            pipeline.fit_transform(&[]).expect_err("empty"),
            PipelineError::EmptyBatch
        );
    }
}
