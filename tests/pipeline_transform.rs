mod common;

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use std::thread;

use common::{scenario_batch, tx};
use credit_risk::{
    load_transactions_csv, AggregateError, CustomerAggregator, EncoderConfig, FeaturePipeline,
    PipelineConfig, PipelineError, PipelineState, TimestampPolicy,
};
use tempfile::NamedTempFile;

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn scenario_collapses_three_transactions_into_two_customers() {
    let mut pipeline = FeaturePipeline::default();
    let (rows, report) = pipeline
        .fit_transform(&scenario_batch())
        .expect("fit succeeds");

    assert_eq!(rows.len(), 2);
    assert_eq!(report.input_rows, 3);
    assert_eq!(report.customers, 2);

    // 50, 60, 70 standardize to -s, 0, +s with s = 10 / sqrt(200 / 3).
    let s = 10.0 / (200.0_f64 / 3.0).sqrt();

    let first = &rows[0];
    assert_eq!(first.customer_id, "100");
    assert_eq!(first.transaction_count, 2);
    assert_close(first.total_transaction_amount, -s);
    assert_close(first.average_transaction_amount, -s / 2.0);
    assert_close(
        first.std_transaction_amount.expect("two transactions"),
        s / 2.0_f64.sqrt(),
    );

    let second = &rows[1];
    assert_eq!(second.customer_id, "200");
    assert_eq!(second.transaction_count, 1);
    assert_close(second.total_transaction_amount, s);
    assert_eq!(second.std_transaction_amount, None);
}

#[test]
fn fresh_pipeline_transform_is_not_fitted() {
    let pipeline = FeaturePipeline::default();
    assert_eq!(
        pipeline.transform(&scenario_batch()).expect_err("never fit"),
        PipelineError::NotFitted
    );
    assert!(!pipeline.is_fitted());
}

#[test]
fn transform_after_fit_matches_fit_transform_output() {
    let batch = scenario_batch();
    let mut pipeline = FeaturePipeline::default();
    let (fitted_rows, _) = pipeline.fit_transform(&batch).expect("fit succeeds");
    let state_before = pipeline.state().expect("fitted");

    let (replayed_rows, _) = pipeline.transform(&batch).expect("transform succeeds");

    assert_eq!(fitted_rows, replayed_rows);
    assert_eq!(pipeline.state().expect("fitted"), state_before);
}

#[test]
fn output_ids_are_exactly_the_distinct_input_ids_in_first_seen_order() {
    let batch = vec![
        tx("C3", 1.0, "2025-06-01 10:00:00"),
        tx("C1", 2.0, "2025-06-01 11:00:00"),
        tx("C3", 3.0, "2025-06-01 12:00:00"),
        tx("C2", 4.0, "2025-06-01 13:00:00"),
        tx("C1", 5.0, "2025-06-01 14:00:00"),
    ];
    let mut pipeline = FeaturePipeline::default();
    let (rows, _) = pipeline.fit_transform(&batch).expect("fit succeeds");

    let ids: Vec<&str> = rows.iter().map(|row| row.customer_id.as_str()).collect();
    assert_eq!(ids, vec!["C3", "C1", "C2"]);
    let distinct: BTreeSet<&str> = batch.iter().map(|tx| tx.customer_id.as_str()).collect();
    assert_eq!(ids.iter().copied().collect::<BTreeSet<_>>(), distinct);
    let total: u64 = rows.iter().map(|row| row.transaction_count).sum();
    assert_eq!(total, batch.len() as u64);
}

#[test]
fn unseen_category_at_transform_time_does_not_fail() {
    let mut pipeline = FeaturePipeline::default();
    pipeline
        .fit_transform(&scenario_batch())
        .expect("fit succeeds");

    let mut drifted = tx("300", 55.0, "2018-11-20 10:00:00");
    drifted.currency_code = "EUR".to_string();
    drifted.channel_id = "ChannelId_9".to_string();

    let (matrix, _) = pipeline
        .encode(std::slice::from_ref(&drifted))
        .expect("encode succeeds");
    let schema = pipeline.schema().expect("fitted");
    for (position, column) in schema.columns.iter().enumerate() {
        if column.source == "CurrencyCode" || column.source == "ChannelId" {
            assert_eq!(matrix.rows[0].features[position], 0.0, "{}", column.name);
        }
    }

    let (rows, _) = pipeline.transform(&[drifted]).expect("transform succeeds");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].customer_id, "300");
}

#[test]
fn persisted_state_reproduces_the_post_fit_matrix_exactly() {
    let batch = scenario_batch();
    let mut pipeline = FeaturePipeline::default();
    pipeline.fit_transform(&batch).expect("fit succeeds");
    let (original, _) = pipeline.encode(&batch).expect("encode succeeds");

    let json = serde_json::to_string(&pipeline.state().expect("fitted")).expect("serialize");
    let restored_state: PipelineState = serde_json::from_str(&json).expect("deserialize");
    let restored = FeaturePipeline::from_state(restored_state).expect("state is compatible");
    let (replayed, _) = restored.encode(&batch).expect("encode succeeds");

    assert_eq!(original.columns, replayed.columns);
    assert_eq!(original.fingerprint, replayed.fingerprint);
    assert_eq!(original.rows.len(), replayed.rows.len());
    for (a, b) in original.rows.iter().zip(&replayed.rows) {
        assert_eq!(a.passthrough, b.passthrough);
        let a_bits: Vec<u64> = a.features.iter().map(|v| v.to_bits()).collect();
        let b_bits: Vec<u64> = b.features.iter().map(|v| v.to_bits()).collect();
        assert_eq!(a_bits, b_bits);
    }
    assert_eq!(
        pipeline.transform(&batch).expect("original"),
        restored.transform(&batch).expect("restored")
    );
}

#[test]
fn strict_timestamp_policy_aborts_and_lenient_policy_reports() {
    let mut batch = scenario_batch();
    batch[1].transaction_start_time = "15/11/2018 03:32".to_string();

    let mut strict = FeaturePipeline::new(PipelineConfig {
        timestamp_policy: TimestampPolicy::Strict,
        encoder: EncoderConfig::default(),
    });
    assert_eq!(
        strict.fit_transform(&batch).expect_err("strict policy"),
        PipelineError::MalformedTimestamp {
            row: 1,
            value: "15/11/2018 03:32".to_string()
        }
    );
    assert!(!strict.is_fitted());

    let mut lenient = FeaturePipeline::default();
    let (rows, report) = lenient.fit_transform(&batch).expect("lenient policy");
    assert_eq!(rows.len(), 2);
    assert_eq!(report.time_features.malformed_rows, 1);
    assert_eq!(rows[0].transaction_count, 2);
}

#[test]
fn name_list_linkage_rejects_ambiguous_amount_columns() {
    let mut pipeline = FeaturePipeline::default();
    pipeline
        .fit_transform(&scenario_batch())
        .expect("fit succeeds");
    let mut names = pipeline.schema().expect("fitted").column_names();

    let mut aggregator = CustomerAggregator::new();
    aggregator
        .configure_from_column_names(&names)
        .expect("generated names resolve uniquely");

    names.insert(1, "num__ValueAmount".to_string());
    let err = CustomerAggregator::new()
        .configure_from_column_names(&names)
        .expect_err("two columns end with Amount");
    assert!(matches!(err, AggregateError::Schema(_)));
}

#[test]
fn fitted_pipeline_is_shared_across_threads_without_locks() {
    let mut pipeline = FeaturePipeline::default();
    let (expected, _) = pipeline
        .fit_transform(&scenario_batch())
        .expect("fit succeeds");
    let shared = Arc::new(pipeline);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pipeline = Arc::clone(&shared);
            thread::spawn(move || pipeline.transform(&scenario_batch()).map(|(rows, _)| rows))
        })
        .collect();

    for handle in handles {
        let rows = handle
            .join()
            .expect("worker should not panic")
            .expect("transform succeeds");
        assert_eq!(rows, expected);
    }
}

#[test]
fn csv_batches_feed_the_pipeline() {
    let mut file = NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        "TransactionId,BatchId,AccountId,SubscriptionId,CustomerId,CurrencyCode,CountryCode,ProviderId,ProductId,ProductCategory,ChannelId,Amount,Value,TransactionStartTime,PricingStrategy,FraudResult"
    )
    .expect("write header");
    writeln!(file, "T1,B1,A1,S1,CustomerId_1,UGX,256,ProviderId_6,ProductId_10,airtime,ChannelId_3,1000.0,1000,2018-11-15T02:18:49Z,2,0")
        .expect("write row");
    writeln!(file, "T2,B2,A1,S1,CustomerId_1,UGX,256,ProviderId_4,ProductId_6,financial_services,ChannelId_2,-20.0,20,2018-11-15T02:19:08Z,2,0")
        .expect("write row");
    writeln!(file, "T3,B3,A2,S2,CustomerId_2,UGX,256,ProviderId_1,ProductId_1,airtime,ChannelId_3,,500,2018-11-15T02:44:21Z,,0")
        .expect("write row");

    let records = load_transactions_csv(file.path()).expect("csv loads");
    assert_eq!(records.len(), 3);

    let mut pipeline = FeaturePipeline::default();
    let (rows, _) = pipeline.fit_transform(&records).expect("fit succeeds");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].customer_id, "CustomerId_1");
    assert_eq!(rows[1].customer_id, "CustomerId_2");
    assert!(rows
        .iter()
        .all(|row| row.total_transaction_amount.is_finite()));
}
