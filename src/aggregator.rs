//! Per-customer aggregation of the encoded transaction matrix.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::encoder::{
    ColumnRef, EncodedCell, EncodedFeatureMatrix, EncodedSchema, AMOUNT_SOURCE,
    IDENTIFIER_SOURCE,
};

pub const AGGREGATE_COLUMNS: [&str; 5] = [
    "CustomerId",
    "TotalTransactionAmount",
    "AverageTransactionAmount",
    "TransactionCount",
    "StdTransactionAmount",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AggregatedCustomerRow {
    pub customer_id: String,
    pub total_transaction_amount: f64,
    pub average_transaction_amount: f64,
    pub transaction_count: u64,
    /// Sample standard deviation; `None` for a single transaction.
    pub std_transaction_amount: Option<f64>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("aggregator configuration error: {0}")]
    Configuration(String),
    #[error("aggregator schema error: {0}")]
    Schema(String),
}

/// Which encoded columns hold the customer identifier and the amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorLinkage {
    pub identifier: ColumnRef,
    pub amount: ColumnRef,
    /// Set when the linkage came from a typed schema; the matrix must match it.
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CustomerAggregator {
    linkage: Option<AggregatorLinkage>,
}

impl CustomerAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        self.linkage.is_some()
    }

    pub fn linkage(&self) -> Option<&AggregatorLinkage> {
        self.linkage.as_ref()
    }

    pub fn configure(&mut self, schema: &EncodedSchema) {
        self.linkage = Some(AggregatorLinkage {
            identifier: schema.identifier.clone(),
            amount: schema.amount.clone(),
            fingerprint: Some(schema.fingerprint.clone()),
        });
    }

    /// Resolves the identifier and amount columns from a bare list of
    /// synthetic names by suffix. Exactly one name must match each suffix.
    pub fn configure_from_column_names(&mut self, names: &[String]) -> Result<(), AggregateError> {
        let identifier = resolve_by_suffix(names, IDENTIFIER_SOURCE)?;
        let amount = resolve_by_suffix(names, AMOUNT_SOURCE)?;
        self.linkage = Some(AggregatorLinkage {
            identifier,
            amount,
            fingerprint: None,
        });
        Ok(())
    }

    /// Aggregation learns nothing; this exists so the pipeline can drive every
    /// stage through the same two operations.
    pub fn fit_transform(
        &self,
        matrix: &EncodedFeatureMatrix,
    ) -> Result<Vec<AggregatedCustomerRow>, AggregateError> {
        self.transform(matrix)
    }

    /// Groups rows by customer in first-appearance order.
    pub fn transform(
        &self,
        matrix: &EncodedFeatureMatrix,
    ) -> Result<Vec<AggregatedCustomerRow>, AggregateError> {
        let linkage = self.linkage.as_ref().ok_or_else(|| {
            AggregateError::Configuration(
                "encoded column names were never supplied to the aggregator".to_string(),
            )
        })?;
        check_linkage(linkage, matrix)?;

        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(String, Vec<f64>)> = Vec::new();

        for (row_idx, row) in matrix.rows.iter().enumerate() {
            let customer_id = match matrix.cell(row, linkage.identifier.position) {
                Some(EncodedCell::Text(text)) => text.to_string(),
                Some(EncodedCell::Number(n)) => n.to_string(),
                None => {
                    return Err(AggregateError::Schema(format!(
                        "row {row_idx} has no cell for {}",
                        linkage.identifier.name
                    )))
                }
            };
            let amount = match matrix.cell(row, linkage.amount.position) {
                Some(EncodedCell::Number(n)) => n,
                _ => {
                    return Err(AggregateError::Schema(format!(
                        "row {row_idx} has no numeric cell for {}",
                        linkage.amount.name
                    )))
                }
            };

            match index.get(&customer_id) {
                Some(&slot) => groups[slot].1.push(amount),
                None => {
                    index.insert(customer_id.clone(), groups.len());
                    groups.push((customer_id, vec![amount]));
                }
            }
        }

        let out: Vec<AggregatedCustomerRow> = groups
            .into_iter()
            .map(|(customer_id, amounts)| summarize(customer_id, &amounts))
            .collect();

        debug!(
            component = "aggregator",
            event = "aggregator.transform.finish",
            rows = matrix.rows.len(),
            customers = out.len()
        );

        Ok(out)
    }
}

pub fn resolve_by_suffix(names: &[String], suffix: &str) -> Result<ColumnRef, AggregateError> {
    let matches: Vec<(usize, &String)> = names
        .iter()
        .enumerate()
        .filter(|(_, name)| name.ends_with(suffix))
        .collect();

    match matches.as_slice() {
        [(position, name)] => Ok(ColumnRef {
            position: *position,
            name: (*name).clone(),
        }),
        [] => Err(AggregateError::Schema(format!(
            "no encoded column ends with '{suffix}'"
        ))),
        many => Err(AggregateError::Schema(format!(
            "ambiguous columns for '{suffix}': {:?}",
            many.iter().map(|(_, name)| name.as_str()).collect::<Vec<_>>()
        ))),
    }
}

fn check_linkage(
    linkage: &AggregatorLinkage,
    matrix: &EncodedFeatureMatrix,
) -> Result<(), AggregateError> {
    if let Some(expected) = &linkage.fingerprint {
        if *expected != matrix.fingerprint {
            return Err(AggregateError::Schema(format!(
                "matrix fingerprint {} does not match configured schema {expected}",
                matrix.fingerprint
            )));
        }
    }

    for column in [&linkage.identifier, &linkage.amount] {
        match matrix.columns.get(column.position) {
            Some(name) if *name == column.name => {}
            Some(name) => {
                return Err(AggregateError::Schema(format!(
                    "expected column {} at position {}, found {name}",
                    column.name, column.position
                )))
            }
            None => {
                return Err(AggregateError::Schema(format!(
                    "column {} at position {} is outside a {}-column matrix",
                    column.name,
                    column.position,
                    matrix.width()
                )))
            }
        }
    }

    Ok(())
}

fn summarize(customer_id: String, amounts: &[f64]) -> AggregatedCustomerRow {
    let count = amounts.len();
    let total = amounts.iter().sum::<f64>();
    let mean = total / count as f64;
    let std = (count > 1).then(|| {
        let sum_sq = amounts
            .iter()
            .map(|v| {
                let d = *v - mean;
                d * d
            })
            .sum::<f64>();
        (sum_sq / (count - 1) as f64).sqrt()
    });

    AggregatedCustomerRow {
        customer_id,
        total_transaction_amount: total,
        average_transaction_amount: mean,
        transaction_count: count as u64,
        std_transaction_amount: std,
    }
}
