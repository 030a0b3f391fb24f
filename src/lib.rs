//! Credit-risk feature pipeline, classifier and scoring service.
//!
//! Current implemented scope:
//! - transaction records, CSV loading and payload validation
//! - calendar features from transaction timestamps
//! - column-wise imputation, one-hot encoding and scaling with a typed schema
//! - per-customer aggregation linked to the encoder schema
//! - two-phase pipeline with persisted, fingerprinted state
//! - logistic-regression and random-forest risk classifiers with evaluation metrics
//! - training job, SQLite model registry and the `/predict` HTTP route

mod aggregator;
mod classifier;
mod config;
mod encoder;
mod forest;
mod observability;
mod pipeline;
mod record;
mod registry;
mod service;
mod time_features;
mod training;

pub use aggregator::{
    resolve_by_suffix, AggregateError, AggregatedCustomerRow, AggregatorLinkage,
    CustomerAggregator, AGGREGATE_COLUMNS,
};
pub use classifier::{
    feature_vector, ClassificationMetrics, ClassifierConfig, ClassifierError, CustomerRiskScore,
    LogisticRegression, ModelKind, RiskClassifier, TrainedClassifier, MODEL_FEATURES,
};
pub use config::{ConfigError, ServiceConfig, TrainingJobConfig};
pub use encoder::{
    build_encoded_schema, CategoricalColumn, CategoryVocabulary, ColumnGroup, ColumnRef,
    ColumnWiseEncoder, EncodedCell, EncodedFeatureMatrix, EncodedRow, EncodedSchema,
    EncoderConfig, EncoderError, FittedEncoderState, NumericColumn, NumericStats,
    SyntheticColumn, ENCODER_STATE_VERSION,
};
pub use forest::{DecisionTree, ForestConfig, RandomForest, TreeNode};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_model_loaded, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    assert_state_compatible, FeaturePipeline, PipelineConfig, PipelineError, PipelineRunReport,
    PipelineState, PIPELINE_STATE_VERSION,
};
pub use record::{
    load_transactions_csv, read_transactions_csv, validate_payloads, FieldValue, RecordError,
    TransactionPayload, TransactionRecord, REQUIRED_COLUMNS,
};
pub use registry::{
    LoadedModel, ModelArtifact, ModelRegistry, ModelVersion, RegisteredModel, RegistryError,
    ScoringError, SqliteModelRegistry,
};
pub use service::{
    scoring_router, ErrorBody, HealthResponse, ModelSource, PredictResponse, ServiceError,
    SharedModelSource,
};
pub use time_features::{
    parse_timestamp, MalformedTimestamp, TimeFeatureError, TimeFeatureExtractor,
    TimeFeatureReport, TimeFeatures, TimedTransaction, TimestampPolicy, TIME_FEATURE_COLUMNS,
};
pub use training::{
    is_test_customer, join_labels, load_labels_csv, max_label_per_customer, read_labels_csv,
    split_by_customer, train_risk_model, CandidateReport, CustomerLabel, TrainingConfig,
    TrainingError, TrainingOutcome, TrainingReport, DEFAULT_MODEL_NAME,
};
