//! Versioned model artifacts and the SQLite-backed registry that stores them.
//!
//! An artifact bundles the fitted pipeline state with the classifier trained
//! alongside it. Its fingerprint covers both halves, so a registry row whose
//! JSON was edited after registration fails to load instead of scoring with
//! a mismatched pipeline.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::classifier::{
    ClassificationMetrics, ClassifierError, CustomerRiskScore, ModelKind, RiskClassifier,
    TrainedClassifier,
};
use crate::pipeline::{FeaturePipeline, PipelineError, PipelineState};
use crate::record::TransactionRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_name: String,
    pub created_at: DateTime<Utc>,
    pub pipeline: PipelineState,
    pub classifier: TrainedClassifier,
    pub metrics: Option<ClassificationMetrics>,
    pub fingerprint: String,
}

impl ModelArtifact {
    pub fn new(
        model_name: impl Into<String>,
        pipeline: PipelineState,
        classifier: TrainedClassifier,
        metrics: Option<ClassificationMetrics>,
    ) -> Self {
        let fingerprint = artifact_fingerprint(&pipeline, &classifier);
        Self {
            model_name: model_name.into(),
            created_at: Utc::now(),
            pipeline,
            classifier,
            metrics,
            fingerprint,
        }
    }

    /// Checks the fingerprint, the classifier parameters and that the
    /// pipeline state rebuilds.
    pub fn verify(&self) -> Result<(), RegistryError> {
        self.check().map(|_| ())
    }

    /// Verifies the artifact and rebuilds a ready-to-score model.
    pub fn load(self, version: u32) -> Result<LoadedModel, RegistryError> {
        let pipeline = self.check()?;
        Ok(LoadedModel {
            model_name: self.model_name,
            version,
            fingerprint: self.fingerprint,
            pipeline,
            classifier: Box::new(self.classifier),
        })
    }

    fn check(&self) -> Result<FeaturePipeline, RegistryError> {
        let expected = artifact_fingerprint(&self.pipeline, &self.classifier);
        if expected != self.fingerprint {
            return Err(RegistryError::FingerprintMismatch {
                expected,
                actual: self.fingerprint.clone(),
            });
        }
        self.classifier.validate()?;
        Ok(FeaturePipeline::from_state(self.pipeline.clone())?)
    }

    pub fn model_kind(&self) -> ModelKind {
        self.classifier.kind()
    }
}

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

/// A fitted pipeline paired with its classifier. Read-only once built.
pub struct LoadedModel {
    pub model_name: String,
    pub version: u32,
    pub fingerprint: String,
    pipeline: FeaturePipeline,
    classifier: Box<dyn RiskClassifier>,
}

impl LoadedModel {
    pub fn new(
        model_name: impl Into<String>,
        version: u32,
        fingerprint: impl Into<String>,
        pipeline: FeaturePipeline,
        classifier: Box<dyn RiskClassifier>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            version,
            fingerprint: fingerprint.into(),
            pipeline,
            classifier,
        }
    }

    pub fn pipeline(&self) -> &FeaturePipeline {
        &self.pipeline
    }

    /// One score per distinct customer, in order of first appearance.
    pub fn score(&self, batch: &[TransactionRecord]) -> Result<Vec<CustomerRiskScore>, ScoringError> {
        let (rows, _) = self.pipeline.transform(batch)?;
        let probabilities = self.classifier.predict_proba(&rows)?;
        Ok(rows
            .into_iter()
            .zip(probabilities)
            .map(|(row, risk_probability)| CustomerRiskScore {
                customer_id: row.customer_id,
                risk_probability,
            })
            .collect())
    }
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model_name", &self.model_name)
            .field("version", &self.version)
            .field("fingerprint", &self.fingerprint)
            .field("features", &self.classifier.feature_names())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModelVersion {
    #[default]
    Latest,
    Exact(u32),
}

impl FromStr for ModelVersion {
    type Err = RegistryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        match trimmed.parse::<u32>() {
            Ok(version) if version > 0 => Ok(Self::Exact(version)),
            _ => Err(RegistryError::InvalidVersion(raw.to_string())),
        }
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Exact(version) => write!(f, "{version}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredModel {
    pub version: u32,
    pub artifact: ModelArtifact,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("model {name} version {version} not found")]
    NotFound { name: String, version: ModelVersion },
    #[error("invalid model version '{0}'; expected 'latest' or a positive integer")]
    InvalidVersion(String),
    #[error("artifact fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
    #[error("artifact pipeline rejected: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("artifact classifier rejected: {0}")]
    Classifier(#[from] ClassifierError),
}

pub trait ModelRegistry: Send + Sync {
    /// Stores `artifact` under its model name and returns the new version.
    fn register(&self, artifact: &ModelArtifact) -> Result<u32, RegistryError>;

    fn fetch(&self, name: &str, version: ModelVersion) -> Result<RegisteredModel, RegistryError>;

    fn versions(&self, name: &str) -> Result<Vec<u32>, RegistryError>;

    fn load(&self, name: &str, version: ModelVersion) -> Result<LoadedModel, RegistryError> {
        let registered = self.fetch(name, version)?;
        let kind = registered.artifact.model_kind();
        let loaded = registered.artifact.load(registered.version)?;
        info!(
            component = "registry",
            event = "registry.model.loaded",
            model_name = %loaded.model_name,
            version = loaded.version,
            model_kind = %kind,
            fingerprint = %loaded.fingerprint
        );
        Ok(loaded)
    }
}

pub struct SqliteModelRegistry {
    conn: Mutex<Connection>,
}

impl SqliteModelRegistry {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RegistryError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS model_versions (
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                created_at TEXT NOT NULL,
                artifact_json TEXT NOT NULL,
                PRIMARY KEY (name, version)
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ModelRegistry for SqliteModelRegistry {
    fn register(&self, artifact: &ModelArtifact) -> Result<u32, RegistryError> {
        artifact.verify()?;
        let artifact_json = serde_json::to_string(artifact)?;

        let mut conn = self
            .conn
            .lock()
            .expect("registry connection lock should not be poisoned");
        let tx = conn.transaction()?;
        let version: u32 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM model_versions WHERE name = ?1",
            params![artifact.model_name],
            |row| row.get(0),
        )?;
        tx.execute(
            "
            INSERT INTO model_versions (name, version, fingerprint, created_at, artifact_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                artifact.model_name,
                version,
                artifact.fingerprint,
                artifact.created_at.to_rfc3339(),
                artifact_json,
            ],
        )?;
        tx.commit()?;

        info!(
            component = "registry",
            event = "registry.model.registered",
            model_name = %artifact.model_name,
            version,
            fingerprint = %artifact.fingerprint
        );
        Ok(version)
    }

    fn fetch(&self, name: &str, version: ModelVersion) -> Result<RegisteredModel, RegistryError> {
        let conn = self
            .conn
            .lock()
            .expect("registry connection lock should not be poisoned");
        let row: Option<(u32, String, String)> = match version {
            ModelVersion::Latest => conn
                .query_row(
                    "
                    SELECT version, fingerprint, artifact_json
                    FROM model_versions
                    WHERE name = ?1
                    ORDER BY version DESC
                    LIMIT 1
                    ",
                    params![name],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?,
            ModelVersion::Exact(exact) => conn
                .query_row(
                    "
                    SELECT version, fingerprint, artifact_json
                    FROM model_versions
                    WHERE name = ?1 AND version = ?2
                    ",
                    params![name, exact],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?,
        };
        drop(conn);

        let (found_version, stored_fingerprint, artifact_json) =
            row.ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
                version,
            })?;
        let artifact: ModelArtifact = serde_json::from_str(&artifact_json)?;
        if artifact.fingerprint != stored_fingerprint {
            return Err(RegistryError::FingerprintMismatch {
                expected: stored_fingerprint,
                actual: artifact.fingerprint,
            });
        }
        artifact.verify()?;

        Ok(RegisteredModel {
            version: found_version,
            artifact,
        })
    }

    fn versions(&self, name: &str) -> Result<Vec<u32>, RegistryError> {
        let conn = self
            .conn
            .lock()
            .expect("registry connection lock should not be poisoned");
        let mut stmt =
            conn.prepare("SELECT version FROM model_versions WHERE name = ?1 ORDER BY version ASC")?;
        let versions = stmt
            .query_map(params![name], |row| row.get(0))?
            .collect::<Result<Vec<u32>, _>>()?;
        Ok(versions)
    }
}

fn artifact_fingerprint(pipeline: &PipelineState, classifier: &TrainedClassifier) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("pipeline:{};", pipeline.fingerprint));
    classifier.hash_parameters(&mut hasher);
    hex::encode(hasher.finalize())
}
