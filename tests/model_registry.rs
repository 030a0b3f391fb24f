mod common;

use common::{training_config, training_fixture, tx};
use credit_risk::{
    train_risk_model, ModelArtifact, ModelKind, ModelRegistry, ModelVersion, RegistryError,
    SqliteModelRegistry, TrainedClassifier, TrainingConfig, TrainingError, TreeNode,
};
use rusqlite::{params, Connection};
use tempfile::tempdir;

fn trained_artifact() -> ModelArtifact {
    let (transactions, labels) = training_fixture();
    train_risk_model(&transactions, &labels, &training_config())
        .expect("fixture trains")
        .artifact
}

#[test]
fn training_reports_split_and_metrics() {
    let (transactions, labels) = training_fixture();
    let outcome =
        train_risk_model(&transactions, &labels, &training_config()).expect("fixture trains");
    let report = &outcome.report;

    assert_eq!(report.test_customers, 7);
    assert_eq!(report.train_customers, 13);
    assert_eq!(report.unlabeled_customers, 0);
    assert_eq!(report.metrics.accuracy, 1.0);
    assert_eq!(report.metrics.roc_auc, Some(1.0));
    assert_eq!(report.candidates.len(), 2);
    assert_eq!(report.candidates[0].model, ModelKind::LogisticRegression);
    assert_eq!(report.candidates[1].model, ModelKind::RandomForest);
    // Both separate the held-out customers; the tie keeps the first candidate.
    assert_eq!(report.selected_model, ModelKind::LogisticRegression);
    assert_eq!(report.metrics, report.candidates[0].metrics);
    assert_eq!(outcome.artifact.model_kind(), report.selected_model);
    assert_eq!(outcome.artifact.model_name, "CreditRiskModel");
    assert_eq!(outcome.artifact.metrics, Some(report.metrics));
    outcome.artifact.verify().expect("fresh artifact verifies");
}

#[test]
fn unlabeled_customers_are_dropped_from_the_join() {
    let (mut transactions, labels) = training_fixture();
    transactions.push(tx("C99", 42.0, "2019-01-07 10:00:00"));

    let outcome =
        train_risk_model(&transactions, &labels, &training_config()).expect("fixture trains");
    assert_eq!(outcome.report.unlabeled_customers, 1);
}

#[test]
fn training_without_any_labels_fails() {
    let (transactions, _) = training_fixture();
    let err = train_risk_model(&transactions, &[], &training_config()).expect_err("no labels");
    assert!(matches!(err, TrainingError::NoLabeledCustomers));
}

#[test]
fn versions_increase_per_model_name() {
    let dir = tempdir().expect("temp dir");
    let registry =
        SqliteModelRegistry::open(&dir.path().join("registry.sqlite")).expect("registry opens");
    let artifact = trained_artifact();

    assert_eq!(registry.register(&artifact).expect("first"), 1);
    assert_eq!(registry.register(&artifact).expect("second"), 2);

    let mut shadow = artifact.clone();
    shadow.model_name = "ShadowModel".to_string();
    assert_eq!(registry.register(&shadow).expect("other name"), 1);

    assert_eq!(
        registry.versions("CreditRiskModel").expect("query runs"),
        vec![1, 2]
    );
    let latest = registry
        .fetch("CreditRiskModel", ModelVersion::Latest)
        .expect("latest exists");
    assert_eq!(latest.version, 2);
    assert_eq!(latest.artifact, artifact);

    let pinned = registry
        .fetch("CreditRiskModel", ModelVersion::Exact(1))
        .expect("version 1 exists");
    assert_eq!(pinned.version, 1);
    assert!(matches!(
        registry.fetch("CreditRiskModel", ModelVersion::Exact(3)),
        Err(RegistryError::NotFound { .. })
    ));
}

#[test]
fn loaded_model_scores_one_row_per_customer() {
    let registry = SqliteModelRegistry::open_in_memory().expect("registry opens");
    registry
        .register(&trained_artifact())
        .expect("register succeeds");

    let model = registry
        .load("CreditRiskModel", ModelVersion::Latest)
        .expect("model loads");
    assert_eq!(model.version, 1);

    let batch = vec![
        tx("A", 10.0, "2019-02-01 09:00:00"),
        tx("B", 700.0, "2019-02-01 10:00:00"),
        tx("B", 800.0, "2019-02-02 10:00:00"),
        tx("B", 900.0, "2019-02-03 10:00:00"),
        tx("B", 600.0, "2019-02-04 10:00:00"),
        tx("B", 500.0, "2019-02-05 10:00:00"),
    ];
    let scores = model.score(&batch).expect("scoring succeeds");

    assert_eq!(scores.len(), 2);
    assert_eq!(scores[0].customer_id, "A");
    assert_eq!(scores[1].customer_id, "B");
    assert!(scores[0].risk_probability > 0.5);
    assert!(scores[1].risk_probability < 0.5);
}

#[test]
fn tampered_artifacts_are_rejected() {
    let artifact = trained_artifact();

    let mut edited = artifact.clone();
    match &mut edited.classifier {
        TrainedClassifier::LogisticRegression(model) => model.intercept += 0.25,
        TrainedClassifier::RandomForest(model) => {
            model.trees[0].nodes[0] = TreeNode::Leaf { positive_rate: 0.5 }
        }
    }
    let registry = SqliteModelRegistry::open_in_memory().expect("registry opens");
    assert!(matches!(
        registry.register(&edited),
        Err(RegistryError::FingerprintMismatch { .. })
    ));

    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("registry.sqlite");
    {
        let registry = SqliteModelRegistry::open(&path).expect("registry opens");
        registry.register(&artifact).expect("register succeeds");
    }

    let mut stored = artifact.clone();
    stored.pipeline.encoder.numeric[0].mean += 1.0;
    let json = serde_json::to_string(&stored).expect("serialize");
    let conn = Connection::open(&path).expect("raw connection");
    conn.execute(
        "UPDATE model_versions SET artifact_json = ?1 WHERE name = ?2 AND version = 1",
        params![json, "CreditRiskModel"],
    )
    .expect("update runs");
    drop(conn);

    let registry = SqliteModelRegistry::open(&path).expect("registry reopens");
    let err = registry
        .load("CreditRiskModel", ModelVersion::Latest)
        .expect_err("pipeline state was edited");
    assert!(matches!(
        err,
        RegistryError::FingerprintMismatch { .. } | RegistryError::Pipeline(_)
    ));
}

#[test]
fn artifacts_whose_pipeline_cannot_rebuild_are_not_registered() {
    let artifact = trained_artifact();
    let registry = SqliteModelRegistry::open_in_memory().expect("registry opens");

    let mut future = artifact.pipeline.clone();
    future.version += 1;
    let mut overflowed = artifact.pipeline.clone();
    overflowed.encoder.numeric[0].scale = f64::INFINITY;

    for pipeline in [future, overflowed] {
        // Re-fingerprinting makes the outer hash consistent again.
        let rebuilt = ModelArtifact::new(
            artifact.model_name.clone(),
            pipeline,
            artifact.classifier.clone(),
            artifact.metrics,
        );
        assert!(matches!(rebuilt.verify(), Err(RegistryError::Pipeline(_))));
        assert!(matches!(
            registry.register(&rebuilt),
            Err(RegistryError::Pipeline(_))
        ));
    }
    assert!(registry
        .versions("CreditRiskModel")
        .expect("query runs")
        .is_empty());
}

#[test]
fn forest_only_training_stores_a_tagged_forest() {
    let (transactions, labels) = training_fixture();
    let config = TrainingConfig {
        candidates: vec![ModelKind::RandomForest],
        ..training_config()
    };
    let outcome = train_risk_model(&transactions, &labels, &config).expect("fixture trains");
    assert_eq!(outcome.report.selected_model, ModelKind::RandomForest);
    assert_eq!(outcome.report.candidates.len(), 1);

    let json = serde_json::to_value(&outcome.artifact).expect("serialize");
    assert_eq!(json["classifier"]["kind"], "random_forest");

    let registry = SqliteModelRegistry::open_in_memory().expect("registry opens");
    registry.register(&outcome.artifact).expect("register succeeds");
    let model = registry
        .load("CreditRiskModel", ModelVersion::Latest)
        .expect("forest loads");
    let scores = model
        .score(&[tx("A", 10.0, "2019-02-01 09:00:00")])
        .expect("scoring succeeds");
    assert_eq!(scores.len(), 1);
    assert!((0.0..=1.0).contains(&scores[0].risk_probability));
}
