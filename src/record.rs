//! Transaction records and boundary validation.
//!
//! A batch reaches the pipeline only after every one of the ten schema fields
//! is present on every row. Cell-level gaps are a different matter: an empty
//! categorical cell or a `NaN` amount is a missing value the encoder imputes.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const REQUIRED_COLUMNS: [&str; 10] = [
    "CustomerId",
    "CurrencyCode",
    "CountryCode",
    "ProviderId",
    "ProductCategory",
    "ChannelId",
    "Amount",
    "Value",
    "TransactionStartTime",
    "PricingStrategy",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransactionRecord {
    pub customer_id: String,
    pub currency_code: String,
    pub country_code: String,
    pub provider_id: String,
    pub product_category: String,
    pub channel_id: String,
    pub amount: f64,
    pub value: f64,
    pub transaction_start_time: String,
    pub pricing_strategy: String,
}

/// Scalar accepted for any field of an inbound JSON transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(f64),
}

impl FieldValue {
    fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", n as i64),
            Self::Number(n) => n.to_string(),
        }
    }

    fn into_number(self, row: usize, field: &'static str) -> Result<f64, RecordError> {
        match self {
            Self::Number(n) => Ok(n),
            Self::Text(text) => parse_f64(&text, row, field),
        }
    }
}

/// Inbound transaction as posted to the scoring endpoint. Every field is
/// optional here so absent fields can be reported together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TransactionPayload {
    pub customer_id: Option<FieldValue>,
    pub currency_code: Option<FieldValue>,
    pub country_code: Option<FieldValue>,
    pub provider_id: Option<FieldValue>,
    pub product_category: Option<FieldValue>,
    pub channel_id: Option<FieldValue>,
    pub amount: Option<FieldValue>,
    pub value: Option<FieldValue>,
    pub transaction_start_time: Option<FieldValue>,
    pub pricing_strategy: Option<FieldValue>,
}

impl TransactionPayload {
    fn missing_columns(&self) -> Vec<&'static str> {
        let present = [
            self.customer_id.is_some(),
            self.currency_code.is_some(),
            self.country_code.is_some(),
            self.provider_id.is_some(),
            self.product_category.is_some(),
            self.channel_id.is_some(),
            self.amount.is_some(),
            self.value.is_some(),
            self.transaction_start_time.is_some(),
            self.pricing_strategy.is_some(),
        ];
        REQUIRED_COLUMNS
            .iter()
            .zip(present)
            .filter(|(_, is_present)| !is_present)
            .map(|(name, _)| *name)
            .collect()
    }
}

impl From<&TransactionRecord> for TransactionPayload {
    fn from(record: &TransactionRecord) -> Self {
        let text = |value: &str| Some(FieldValue::Text(value.to_string()));
        Self {
            customer_id: text(&record.customer_id),
            currency_code: text(&record.currency_code),
            country_code: text(&record.country_code),
            provider_id: text(&record.provider_id),
            product_category: text(&record.product_category),
            channel_id: text(&record.channel_id),
            amount: Some(FieldValue::Number(record.amount)),
            value: Some(FieldValue::Number(record.value)),
            transaction_start_time: text(&record.transaction_start_time),
            pricing_strategy: text(&record.pricing_strategy),
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Missing columns: {0:?}")]
    MissingColumns(Vec<String>),
    #[error("row {row}: failed to parse field {field} value '{value}'")]
    ParseField {
        row: usize,
        field: &'static str,
        value: String,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Checks that every payload carries all required fields and converts the
/// batch into typed records. Absent fields are collected across the whole
/// batch and reported once, in schema order.
pub fn validate_payloads(
    payloads: Vec<TransactionPayload>,
) -> Result<Vec<TransactionRecord>, RecordError> {
    let mut missing: Vec<&'static str> = Vec::new();
    for payload in &payloads {
        for column in payload.missing_columns() {
            if !missing.contains(&column) {
                missing.push(column);
            }
        }
    }
    if !missing.is_empty() {
        missing.sort_by_key(|column| column_position(column));
        return Err(RecordError::MissingColumns(
            missing.into_iter().map(str::to_string).collect(),
        ));
    }

    payloads
        .into_iter()
        .enumerate()
        .map(|(row, payload)| payload_into_record(row, payload))
        .collect()
}

pub fn load_transactions_csv(path: &Path) -> Result<Vec<TransactionRecord>, RecordError> {
    let file = File::open(path)?;
    let records = read_transactions_csv(file)?;
    info!(
        component = "record",
        event = "record.csv.loaded",
        path = %path.display(),
        rows = records.len()
    );
    Ok(records)
}

/// Reads a headed CSV of transactions. Extra columns are ignored; a missing
/// required header fails the whole file. Empty numeric cells load as `NaN`
/// and empty text cells as `""` so the encoder can impute them.
pub fn read_transactions_csv<R: Read>(reader: R) -> Result<Vec<TransactionRecord>, RecordError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    let mut positions = [0_usize; REQUIRED_COLUMNS.len()];
    let mut missing = Vec::new();
    for (idx, column) in REQUIRED_COLUMNS.iter().enumerate() {
        match headers.iter().position(|header| header == *column) {
            Some(pos) => positions[idx] = pos,
            None => missing.push((*column).to_string()),
        }
    }
    if !missing.is_empty() {
        return Err(RecordError::MissingColumns(missing));
    }

    let mut out = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        out.push(parse_csv_record(row, &record, &positions)?);
    }
    Ok(out)
}

fn parse_csv_record(
    row: usize,
    record: &StringRecord,
    positions: &[usize; REQUIRED_COLUMNS.len()],
) -> Result<TransactionRecord, RecordError> {
    let cell = |idx: usize| record.get(positions[idx]).unwrap_or("");
    Ok(TransactionRecord {
        customer_id: cell(0).to_string(),
        currency_code: cell(1).to_string(),
        country_code: cell(2).to_string(),
        provider_id: cell(3).to_string(),
        product_category: cell(4).to_string(),
        channel_id: cell(5).to_string(),
        amount: parse_optional_f64(cell(6), row, "Amount")?,
        value: parse_optional_f64(cell(7), row, "Value")?,
        transaction_start_time: cell(8).to_string(),
        pricing_strategy: cell(9).to_string(),
    })
}

fn payload_into_record(
    row: usize,
    payload: TransactionPayload,
) -> Result<TransactionRecord, RecordError> {
    let missing = payload.missing_columns();
    let TransactionPayload {
        customer_id: Some(customer_id),
        currency_code: Some(currency_code),
        country_code: Some(country_code),
        provider_id: Some(provider_id),
        product_category: Some(product_category),
        channel_id: Some(channel_id),
        amount: Some(amount),
        value: Some(value),
        transaction_start_time: Some(transaction_start_time),
        pricing_strategy: Some(pricing_strategy),
    } = payload
    else {
        return Err(RecordError::MissingColumns(
            missing.into_iter().map(str::to_string).collect(),
        ));
    };

    Ok(TransactionRecord {
        customer_id: customer_id.into_text(),
        currency_code: currency_code.into_text(),
        country_code: country_code.into_text(),
        provider_id: provider_id.into_text(),
        product_category: product_category.into_text(),
        channel_id: channel_id.into_text(),
        amount: amount.into_number(row, "Amount")?,
        value: value.into_number(row, "Value")?,
        transaction_start_time: transaction_start_time.into_text(),
        pricing_strategy: pricing_strategy.into_text(),
    })
}

fn column_position(column: &str) -> usize {
    REQUIRED_COLUMNS
        .iter()
        .position(|candidate| *candidate == column)
        .unwrap_or(REQUIRED_COLUMNS.len())
}

fn parse_optional_f64(raw: &str, row: usize, field: &'static str) -> Result<f64, RecordError> {
    if raw.trim().is_empty() {
        return Ok(f64::NAN);
    }
    parse_f64(raw, row, field)
}

fn parse_f64(raw: &str, row: usize, field: &'static str) -> Result<f64, RecordError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| RecordError::ParseField {
            row,
            field,
            value: raw.to_string(),
        })
}
