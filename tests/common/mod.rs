//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use credit_risk::{train_risk_model, CustomerLabel, LoadedModel, TrainingConfig, TransactionRecord};

pub fn tx(customer: &str, amount: f64, ts: &str) -> TransactionRecord {
    TransactionRecord {
        customer_id: customer.to_string(),
        currency_code: "UGX".to_string(),
        country_code: "256".to_string(),
        provider_id: "ProviderId_6".to_string(),
        product_category: "airtime".to_string(),
        channel_id: "ChannelId_3".to_string(),
        amount,
        value: amount.abs(),
        transaction_start_time: ts.to_string(),
        pricing_strategy: "2".to_string(),
    }
}

/// Two transactions for "100" (50, 60) and one for "200" (70).
pub fn scenario_batch() -> Vec<TransactionRecord> {
    vec![
        tx("100", 50.0, "2018-11-15T02:18:49Z"),
        tx("100", 60.0, "2018-11-15T03:32:55Z"),
        tx("200", 70.0, "2018-11-16T08:00:00Z"),
    ]
}

/// Twenty customers C01..C20. Odd ids make one small transaction and are
/// labeled high risk; even ids make five large ones and are labeled low risk.
/// With a 0.3 test fraction the hash split holds out C01-C05, C09 and C11.
pub fn training_fixture() -> (Vec<TransactionRecord>, Vec<CustomerLabel>) {
    let mut transactions = Vec::new();
    let mut labels = Vec::new();
    for idx in 1..=20 {
        let customer = format!("C{idx:02}");
        let high_risk = idx % 2 == 1;
        if high_risk {
            transactions.push(tx(&customer, 10.0, "2019-01-05 09:00:00"));
        } else {
            for (day, amount) in [500.0, 600.0, 700.0, 800.0, 900.0].iter().enumerate() {
                transactions.push(tx(
                    &customer,
                    *amount,
                    &format!("2019-01-{:02} 14:30:00", day + 1),
                ));
            }
        }
        labels.push(CustomerLabel {
            customer_id: customer,
            is_high_risk: u8::from(high_risk),
        });
    }
    (transactions, labels)
}

pub fn training_config() -> TrainingConfig {
    TrainingConfig {
        test_fraction: 0.3,
        ..TrainingConfig::default()
    }
}

pub fn trained_model() -> LoadedModel {
    let (transactions, labels) = training_fixture();
    let outcome = train_risk_model(&transactions, &labels, &training_config())
        .expect("fixture trains");
    outcome.artifact.load(1).expect("fresh artifact loads")
}
