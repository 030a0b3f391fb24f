//! Environment-driven configuration for the server and training binaries.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::classifier::ModelKind;
use crate::observability::non_blank;
use crate::registry::ModelVersion;
use crate::time_features::TimestampPolicy;
use crate::training::{TrainingConfig, DEFAULT_MODEL_NAME};

pub const API_ADDR_ENV: &str = "RISK_API_ADDR";
pub const REGISTRY_PATH_ENV: &str = "RISK_REGISTRY_PATH";
pub const MODEL_NAME_ENV: &str = "RISK_MODEL_NAME";
pub const MODEL_VERSION_ENV: &str = "RISK_MODEL_VERSION";
pub const TRAIN_TRANSACTIONS_ENV: &str = "RISK_TRAIN_TRANSACTIONS";
pub const TRAIN_LABELS_ENV: &str = "RISK_TRAIN_LABELS";
pub const TEST_FRACTION_ENV: &str = "RISK_TEST_FRACTION";
pub const TIMESTAMP_POLICY_ENV: &str = "RISK_TIMESTAMP_POLICY";
pub const MODEL_CANDIDATES_ENV: &str = "RISK_MODEL_CANDIDATES";

const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_REGISTRY_PATH: &str = "data/model_registry.sqlite";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} is required")]
    Missing { key: &'static str },
    #[error("invalid {key}='{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub addr: SocketAddr,
    pub registry_path: PathBuf,
    pub model_name: String,
    pub model_version: ModelVersion,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw_addr =
            non_blank(lookup(API_ADDR_ENV)).unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
        let addr = raw_addr.parse::<SocketAddr>().map_err(|err| ConfigError::Invalid {
            key: API_ADDR_ENV,
            value: raw_addr.clone(),
            reason: format!("{err}"),
        })?;

        let model_version = match non_blank(lookup(MODEL_VERSION_ENV)) {
            Some(raw) => raw.parse::<ModelVersion>().map_err(|_| ConfigError::Invalid {
                key: MODEL_VERSION_ENV,
                value: raw.clone(),
                reason: "expected 'latest' or a positive integer".to_string(),
            })?,
            None => ModelVersion::Latest,
        };

        Ok(Self {
            addr,
            registry_path: registry_path(&lookup),
            model_name: model_name(&lookup),
            model_version,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingJobConfig {
    pub registry_path: PathBuf,
    pub transactions_path: PathBuf,
    pub labels_path: PathBuf,
    pub training: TrainingConfig,
}

impl TrainingJobConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let transactions_path = non_blank(lookup(TRAIN_TRANSACTIONS_ENV))
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing {
                key: TRAIN_TRANSACTIONS_ENV,
            })?;
        let labels_path = non_blank(lookup(TRAIN_LABELS_ENV))
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing {
                key: TRAIN_LABELS_ENV,
            })?;

        let mut training = TrainingConfig {
            model_name: model_name(&lookup),
            ..TrainingConfig::default()
        };
        if let Some(raw) = non_blank(lookup(TEST_FRACTION_ENV)) {
            training.test_fraction = match raw.parse::<f64>() {
                Ok(fraction) if fraction > 0.0 && fraction < 1.0 => fraction,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: TEST_FRACTION_ENV,
                        value: raw,
                        reason: "expected a number strictly between 0 and 1".to_string(),
                    })
                }
            };
        }
        if let Some(raw) = non_blank(lookup(TIMESTAMP_POLICY_ENV)) {
            training.pipeline.timestamp_policy = parse_timestamp_policy(&raw).ok_or_else(|| {
                ConfigError::Invalid {
                    key: TIMESTAMP_POLICY_ENV,
                    value: raw.clone(),
                    reason: "expected 'strict' or 'null_and_report'".to_string(),
                }
            })?;
        }

        if let Some(raw) = non_blank(lookup(MODEL_CANDIDATES_ENV)) {
            training.candidates = parse_candidates(&raw).map_err(|reason| ConfigError::Invalid {
                key: MODEL_CANDIDATES_ENV,
                value: raw.clone(),
                reason,
            })?;
        }

        Ok(Self {
            registry_path: registry_path(&lookup),
            transactions_path,
            labels_path,
            training,
        })
    }
}

fn registry_path(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    non_blank(lookup(REGISTRY_PATH_ENV))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY_PATH))
}

fn model_name(lookup: &impl Fn(&str) -> Option<String>) -> String {
    non_blank(lookup(MODEL_NAME_ENV)).unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string())
}

/// Comma-separated model kinds, e.g. `logistic_regression,random_forest`.
fn parse_candidates(raw: &str) -> Result<Vec<ModelKind>, String> {
    let mut kinds: Vec<ModelKind> = Vec::new();
    for part in raw.split(',').filter(|part| !part.trim().is_empty()) {
        let kind = part.parse::<ModelKind>().map_err(|err| err.to_string())?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    if kinds.is_empty() {
        return Err("expected at least one model kind".to_string());
    }
    Ok(kinds)
}

fn parse_timestamp_policy(raw: &str) -> Option<TimestampPolicy> {
    match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "strict" => Some(TimestampPolicy::Strict),
        "null_and_report" | "lenient" => Some(TimestampPolicy::NullAndReport),
        _ => None,
    }
}
