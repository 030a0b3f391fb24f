//! Column-wise imputation, one-hot encoding and scaling.
//!
//! Three disjoint column groups are transformed independently and concatenated
//! in a fixed order: numeric, categorical, passthrough. Output columns carry
//! synthetic names derived from group and source field, and the encoder hands
//! back an [`EncodedSchema`] that points at the identifier and amount columns
//! directly, so downstream stages never have to guess them from names.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::time_features::TimedTransaction;

pub const ENCODER_STATE_VERSION: u32 = 1;

const ZERO_SCALE_EPSILON: f64 = 10.0 * f64::EPSILON;
const MISSING_CATEGORY: &str = "missing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnGroup {
    Numeric,
    Categorical,
    Passthrough,
}

impl ColumnGroup {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Numeric => "num",
            Self::Categorical => "cat",
            Self::Passthrough => "passthrough",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumericColumn {
    Amount,
    Value,
    TransactionHour,
    TransactionDay,
    TransactionMonth,
    TransactionYear,
}

impl NumericColumn {
    pub const BASE: [NumericColumn; 2] = [Self::Amount, Self::Value];
    pub const TIME: [NumericColumn; 4] = [
        Self::TransactionHour,
        Self::TransactionDay,
        Self::TransactionMonth,
        Self::TransactionYear,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Amount => "Amount",
            Self::Value => "Value",
            Self::TransactionHour => "TransactionHour",
            Self::TransactionDay => "TransactionDay",
            Self::TransactionMonth => "TransactionMonth",
            Self::TransactionYear => "TransactionYear",
        }
    }

    /// Reads the cell, treating non-finite values and null time fields as missing.
    fn read(self, tx: &TimedTransaction) -> Option<f64> {
        let raw = match self {
            Self::Amount => Some(tx.record.amount),
            Self::Value => Some(tx.record.value),
            Self::TransactionHour => tx.time.map(|t| t.hour as f64),
            Self::TransactionDay => tx.time.map(|t| t.day as f64),
            Self::TransactionMonth => tx.time.map(|t| t.month as f64),
            Self::TransactionYear => tx.time.map(|t| t.year as f64),
        };
        raw.filter(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CategoricalColumn {
    CurrencyCode,
    CountryCode,
    ProviderId,
    ProductCategory,
    ChannelId,
    PricingStrategy,
}

impl CategoricalColumn {
    pub const ALL: [CategoricalColumn; 6] = [
        Self::CurrencyCode,
        Self::CountryCode,
        Self::ProviderId,
        Self::ProductCategory,
        Self::ChannelId,
        Self::PricingStrategy,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::CurrencyCode => "CurrencyCode",
            Self::CountryCode => "CountryCode",
            Self::ProviderId => "ProviderId",
            Self::ProductCategory => "ProductCategory",
            Self::ChannelId => "ChannelId",
            Self::PricingStrategy => "PricingStrategy",
        }
    }

    /// Reads the cell; blank strings count as missing.
    fn read(self, tx: &TimedTransaction) -> Option<&str> {
        let raw = match self {
            Self::CurrencyCode => &tx.record.currency_code,
            Self::CountryCode => &tx.record.country_code,
            Self::ProviderId => &tx.record.provider_id,
            Self::ProductCategory => &tx.record.product_category,
            Self::ChannelId => &tx.record.channel_id,
            Self::PricingStrategy => &tx.record.pricing_strategy,
        };
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

pub const PASSTHROUGH_COLUMN: &str = "CustomerId";
pub const IDENTIFIER_SOURCE: &str = "CustomerId";
pub const AMOUNT_SOURCE: &str = "Amount";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Feed the four calendar fields through the numeric group. On by default,
    /// unlike the two-column numeric layout (`Amount`, `Value`) that off gives.
    pub include_time_features: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            include_time_features: true,
        }
    }
}

impl EncoderConfig {
    pub fn numeric_columns(&self) -> Vec<NumericColumn> {
        let mut columns = NumericColumn::BASE.to_vec();
        if self.include_time_features {
            columns.extend(NumericColumn::TIME);
        }
        columns
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericStats {
    pub column: NumericColumn,
    pub impute_value: f64,
    pub mean: f64,
    pub scale: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryVocabulary {
    pub column: CategoricalColumn,
    pub impute_value: String,
    /// Sorted, distinct.
    pub categories: Vec<String>,
}

/// Everything the encoder learns during fit. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedEncoderState {
    pub version: u32,
    pub config: EncoderConfig,
    pub numeric: Vec<NumericStats>,
    pub categorical: Vec<CategoryVocabulary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticColumn {
    pub name: String,
    pub group: ColumnGroup,
    pub source: String,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub position: usize,
    pub name: String,
}

/// Output layout of a fitted encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<SyntheticColumn>,
    pub identifier: ColumnRef,
    pub amount: ColumnRef,
}

impl EncodedSchema {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedRow {
    /// Numeric then one-hot cells, in schema order.
    pub features: Vec<f64>,
    /// Passthrough cells, in schema order, after all feature cells.
    pub passthrough: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncodedCell<'a> {
    Number(f64),
    Text(&'a str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedFeatureMatrix {
    pub columns: Vec<String>,
    pub fingerprint: String,
    pub rows: Vec<EncodedRow>,
}

impl EncodedFeatureMatrix {
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Cell at schema position `position`, or `None` when out of range.
    pub fn cell<'a>(&self, row: &'a EncodedRow, position: usize) -> Option<EncodedCell<'a>> {
        let feature_width = row.features.len();
        if position < feature_width {
            Some(EncodedCell::Number(row.features[position]))
        } else {
            row.passthrough
                .get(position - feature_width)
                .map(|text| EncodedCell::Text(text.as_str()))
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncoderError {
    #[error("encoder is not fitted; call fit_transform first")]
    NotFitted,
    #[error("cannot fit encoder on an empty batch")]
    EmptyBatch,
    #[error("incompatible encoder state: {0}")]
    IncompatibleState(String),
    #[error("column {column} produced non-finite statistics during fit")]
    NonFiniteStatistics { column: &'static str },
}

#[derive(Debug, Clone)]
struct Fitted {
    state: FittedEncoderState,
    schema: EncodedSchema,
}

#[derive(Debug, Clone, Default)]
pub struct ColumnWiseEncoder {
    config: EncoderConfig,
    fitted: Option<Fitted>,
}

impl ColumnWiseEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    pub fn from_state(state: FittedEncoderState) -> Result<Self, EncoderError> {
        validate_state(&state)?;
        let schema = build_encoded_schema(&state);
        Ok(Self {
            config: state.config,
            fitted: Some(Fitted { state, schema }),
        })
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    pub fn state(&self) -> Result<&FittedEncoderState, EncoderError> {
        self.fitted
            .as_ref()
            .map(|fitted| &fitted.state)
            .ok_or(EncoderError::NotFitted)
    }

    pub fn schema(&self) -> Result<&EncodedSchema, EncoderError> {
        self.fitted
            .as_ref()
            .map(|fitted| &fitted.schema)
            .ok_or(EncoderError::NotFitted)
    }

    /// Learns imputation values, scaling statistics and vocabularies from
    /// `batch`, replacing any earlier fit, then transforms `batch`.
    pub fn fit_transform(
        &mut self,
        batch: &[TimedTransaction],
    ) -> Result<(EncodedFeatureMatrix, EncodedSchema), EncoderError> {
        if batch.is_empty() {
            return Err(EncoderError::EmptyBatch);
        }

        let numeric = self
            .config
            .numeric_columns()
            .into_iter()
            .map(|column| fit_numeric(column, batch))
            .collect::<Result<Vec<_>, _>>()?;
        let categorical = CategoricalColumn::ALL
            .iter()
            .map(|column| fit_categorical(*column, batch))
            .collect();

        let state = FittedEncoderState {
            version: ENCODER_STATE_VERSION,
            config: self.config,
            numeric,
            categorical,
        };
        let schema = build_encoded_schema(&state);

        info!(
            component = "encoder",
            event = "encoder.fit.finish",
            rows = batch.len(),
            column_count = schema.columns.len(),
            fingerprint = %schema.fingerprint
        );

        self.fitted = Some(Fitted { state, schema });
        self.transform(batch)
    }

    pub fn transform(
        &self,
        batch: &[TimedTransaction],
    ) -> Result<(EncodedFeatureMatrix, EncodedSchema), EncoderError> {
        let fitted = self.fitted.as_ref().ok_or(EncoderError::NotFitted)?;
        let state = &fitted.state;
        let feature_width = fitted.schema.columns.len() - 1;

        let mut unseen_categories = 0_u64;
        let mut rows = Vec::with_capacity(batch.len());
        for tx in batch {
            let mut features = Vec::with_capacity(feature_width);
            for stats in &state.numeric {
                let raw = stats.column.read(tx).unwrap_or(stats.impute_value);
                features.push((raw - stats.mean) / stats.scale);
            }
            for vocab in &state.categorical {
                let value = vocab
                    .column
                    .read(tx)
                    .unwrap_or(vocab.impute_value.as_str());
                let hot = vocab
                    .categories
                    .binary_search_by(|category| category.as_str().cmp(value))
                    .ok();
                if hot.is_none() {
                    unseen_categories += 1;
                }
                features.extend((0..vocab.categories.len()).map(|idx| {
                    if Some(idx) == hot {
                        1.0
                    } else {
                        0.0
                    }
                }));
            }
            rows.push(EncodedRow {
                features,
                passthrough: vec![tx.record.customer_id.clone()],
            });
        }

        if unseen_categories > 0 {
            debug!(
                component = "encoder",
                event = "encoder.transform.unseen_categories",
                rows = batch.len(),
                unseen_categories
            );
        }

        let matrix = EncodedFeatureMatrix {
            columns: fitted.schema.column_names(),
            fingerprint: fitted.schema.fingerprint.clone(),
            rows,
        };
        Ok((matrix, fitted.schema.clone()))
    }
}

/// Builds the output schema implied by a fitted state. Deterministic: the
/// same state always yields the same names, order and fingerprint.
pub fn build_encoded_schema(state: &FittedEncoderState) -> EncodedSchema {
    let mut columns = Vec::new();

    for stats in &state.numeric {
        columns.push(SyntheticColumn {
            name: format!("{}__{}", ColumnGroup::Numeric.prefix(), stats.column.name()),
            group: ColumnGroup::Numeric,
            source: stats.column.name().to_string(),
            category: None,
        });
    }
    for vocab in &state.categorical {
        for category in &vocab.categories {
            columns.push(SyntheticColumn {
                name: format!(
                    "{}__{}_{}",
                    ColumnGroup::Categorical.prefix(),
                    vocab.column.name(),
                    category
                ),
                group: ColumnGroup::Categorical,
                source: vocab.column.name().to_string(),
                category: Some(category.clone()),
            });
        }
    }
    columns.push(SyntheticColumn {
        name: format!(
            "{}__{}",
            ColumnGroup::Passthrough.prefix(),
            PASSTHROUGH_COLUMN
        ),
        group: ColumnGroup::Passthrough,
        source: PASSTHROUGH_COLUMN.to_string(),
        category: None,
    });

    let identifier_position = columns.len() - 1;
    let amount_position = state
        .numeric
        .iter()
        .position(|stats| stats.column == NumericColumn::Amount)
        .unwrap_or(0);

    let fingerprint = schema_fingerprint(state.version, &columns);
    EncodedSchema {
        version: state.version,
        identifier: ColumnRef {
            position: identifier_position,
            name: columns[identifier_position].name.clone(),
        },
        amount: ColumnRef {
            position: amount_position,
            name: columns[amount_position].name.clone(),
        },
        fingerprint,
        columns,
    }
}

fn fit_numeric(
    column: NumericColumn,
    batch: &[TimedTransaction],
) -> Result<NumericStats, EncoderError> {
    let observed: Vec<f64> = batch.iter().filter_map(|tx| column.read(tx)).collect();
    let impute_value = if observed.is_empty() {
        warn!(
            component = "encoder",
            event = "encoder.fit.all_missing",
            column = column.name(),
            impute_value = 0.0
        );
        0.0
    } else {
        mean(&observed)
    };

    let imputed: Vec<f64> = batch
        .iter()
        .map(|tx| column.read(tx).unwrap_or(impute_value))
        .collect();
    let mean = mean(&imputed);
    let std = population_std(&imputed, mean);
    let scale = if std < ZERO_SCALE_EPSILON { 1.0 } else { std };

    if !(impute_value.is_finite() && mean.is_finite() && scale.is_finite()) {
        return Err(EncoderError::NonFiniteStatistics {
            column: column.name(),
        });
    }

    Ok(NumericStats {
        column,
        impute_value,
        mean,
        scale,
    })
}

fn fit_categorical(column: CategoricalColumn, batch: &[TimedTransaction]) -> CategoryVocabulary {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for value in batch.iter().filter_map(|tx| column.read(tx)) {
        *counts.entry(value).or_default() += 1;
    }

    // Ties resolve to the smallest category because the map iterates in order.
    let mut most_frequent: Option<(&str, usize)> = None;
    for (value, count) in &counts {
        if most_frequent.map_or(true, |(_, best)| *count > best) {
            most_frequent = Some((*value, *count));
        }
    }
    let impute_value = most_frequent
        .map(|(value, _)| value.to_string())
        .unwrap_or_else(|| MISSING_CATEGORY.to_string());

    let mut categories: BTreeSet<String> = counts.keys().map(|value| value.to_string()).collect();
    categories.insert(impute_value.clone());

    CategoryVocabulary {
        column,
        impute_value,
        categories: categories.into_iter().collect(),
    }
}

fn validate_state(state: &FittedEncoderState) -> Result<(), EncoderError> {
    if state.version != ENCODER_STATE_VERSION {
        return Err(EncoderError::IncompatibleState(format!(
            "version {} (expected {ENCODER_STATE_VERSION})",
            state.version
        )));
    }

    let expected_numeric = state.config.numeric_columns();
    let actual_numeric: Vec<NumericColumn> =
        state.numeric.iter().map(|stats| stats.column).collect();
    if actual_numeric != expected_numeric {
        return Err(EncoderError::IncompatibleState(format!(
            "numeric columns {actual_numeric:?} do not match config {expected_numeric:?}"
        )));
    }
    if let Some(bad) = state
        .numeric
        .iter()
        .find(|stats| !(stats.scale.is_finite() && stats.scale > 0.0 && stats.mean.is_finite()))
    {
        return Err(EncoderError::IncompatibleState(format!(
            "invalid scaling statistics for {}",
            bad.column.name()
        )));
    }

    let actual_categorical: Vec<CategoricalColumn> =
        state.categorical.iter().map(|vocab| vocab.column).collect();
    if actual_categorical != CategoricalColumn::ALL {
        return Err(EncoderError::IncompatibleState(format!(
            "categorical columns {actual_categorical:?} do not match schema"
        )));
    }
    for vocab in &state.categorical {
        let sorted_unique = vocab.categories.windows(2).all(|pair| pair[0] < pair[1]);
        if !sorted_unique || vocab.categories.binary_search(&vocab.impute_value).is_err() {
            return Err(EncoderError::IncompatibleState(format!(
                "vocabulary for {} must be sorted, distinct and contain its impute value",
                vocab.column.name()
            )));
        }
    }

    Ok(())
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Deviations are divided by the largest one before squaring so wide but
/// finite columns do not overflow.
fn population_std(values: &[f64], mean: f64) -> f64 {
    let max_dev = values
        .iter()
        .fold(0.0_f64, |acc, v| acc.max((v - mean).abs()));
    if !(max_dev > 0.0 && max_dev.is_finite()) {
        return max_dev;
    }
    let sum_sq = values
        .iter()
        .map(|v| ((v - mean) / max_dev).powi(2))
        .sum::<f64>();
    max_dev * (sum_sq / values.len() as f64).sqrt()
}

fn schema_fingerprint(version: u32, columns: &[SyntheticColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{};", column.group.prefix()));
    }
    hex::encode(hasher.finalize())
}
