use credit_risk::{
    init_logging, load_labels_csv, load_transactions_csv, log_app_start, logging_config_from_env,
    train_risk_model, ModelRegistry, SqliteModelRegistry, TrainingJobConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("train_risk_model", &logging_cfg);

    let cfg = TrainingJobConfig::from_env()?;
    let transactions = load_transactions_csv(&cfg.transactions_path)?;
    let labels = load_labels_csv(&cfg.labels_path)?;

    let outcome = train_risk_model(&transactions, &labels, &cfg.training)?;
    let registry = SqliteModelRegistry::open(&cfg.registry_path)?;
    let version = registry.register(&outcome.artifact)?;

    let report = &outcome.report;
    println!(
        "Registered {} version {} (train customers: {}, test customers: {}, unlabeled: {})",
        outcome.artifact.model_name,
        version,
        report.train_customers,
        report.test_customers,
        report.unlabeled_customers
    );
    for candidate in &report.candidates {
        let marker = if candidate.model == report.selected_model {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {:<20} accuracy={:.4} precision={:.4} recall={:.4} f1={:.4} roc_auc={}",
            candidate.model.name(),
            candidate.metrics.accuracy,
            candidate.metrics.precision,
            candidate.metrics.recall,
            candidate.metrics.f1,
            candidate
                .metrics
                .roc_auc
                .map(|auc| format!("{auc:.4}"))
                .unwrap_or_else(|| "n/a".to_string())
        );
    }
    println!("selected model: {}", report.selected_model);
    if report.pipeline.time_features.malformed_rows > 0 {
        println!(
            "malformed timestamps during fit: {}",
            report.pipeline.time_features.malformed_rows
        );
    }

    Ok(())
}
