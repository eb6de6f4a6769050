mod common;

use common::harness::TestHarness;
use common::vectors::synthetic_records;

use cumulus::error::BuildError;
use cumulus::lifecycle::deployer::DeployOutcome;
use cumulus::types::{Horizon, StagedGeneration, Strategy, ValidationReport};

const H6: Horizon = Horizon(6);

// ── Build + validate ──

#[tokio::test]
async fn test_cold_build_and_validate() {
    let harness = TestHarness::new(&[6]);
    harness.seed_horizon(H6, 1000, 64);

    let staged = harness
        .builder()
        .build(H6, &[Strategy::Exact, Strategy::Approximate])
        .await
        .unwrap();
    assert_eq!(staged.len(), 2);

    let exact = staged
        .iter()
        .find(|s| s.generation.strategy == Strategy::Exact)
        .unwrap();
    assert_eq!(exact.generation.vector_count, 1000);
    assert_eq!(exact.generation.dimension, 64);

    let report = harness.validator().validate(exact, None).unwrap();
    assert!(report.passed, "failed checks: {:?}", report.checks);
    assert_eq!(report.checks.len(), 3); // structural, functional, performance
}

#[tokio::test]
async fn test_approximate_validation_needs_baseline() {
    let harness = TestHarness::new(&[6]);
    harness.seed_horizon(H6, 400, 32);

    let staged = harness
        .builder()
        .build(H6, &[Strategy::Approximate])
        .await
        .unwrap();
    let report = harness.validator().validate(&staged[0], None).unwrap();
    assert!(!report.passed);
    assert!(report
        .failed_checks()
        .any(|c| c.name == "recall" && c.detail.contains("baseline")));
}

#[tokio::test]
async fn test_source_drift_fails_build() {
    let harness = TestHarness::new(&[6]);
    let (mut embeddings, outcomes) = synthetic_records(1000, 64, 1);
    embeddings.pop(); // 999 embeddings vs 1000 outcomes
    harness.write_horizon(H6, &embeddings, &outcomes);

    let err = harness
        .builder()
        .build(H6, &[Strategy::Exact])
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::SourceDataInconsistent(_)));
}

#[tokio::test]
async fn test_concurrent_build_is_rejected() {
    let harness = TestHarness::new(&[6]);
    harness.seed_horizon(H6, 100, 16);

    // Simulate an in-flight build by holding the build lock.
    let layout = harness.layout();
    let _held = layout
        .try_lock(&layout.build_lock_path(H6))
        .unwrap()
        .unwrap();

    let err = harness
        .builder()
        .build(H6, &[Strategy::Exact])
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::AlreadyInProgress { .. }));
}

#[tokio::test]
async fn test_timed_out_build_leaves_no_staging_artifacts() {
    let mut harness = TestHarness::new(&[6]);
    harness.config.build.timeout_secs = 0;
    harness.seed_horizon(H6, 2000, 64);

    let err = harness
        .builder()
        .build(H6, &[Strategy::Exact, Strategy::Approximate])
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::Timeout { .. }));

    // The abandoned blocking task observes cancellation and removes its
    // own output; give it time to exit before inspecting the tree.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let layout = harness.layout();
    for strategy in [Strategy::Exact, Strategy::Approximate] {
        let leftovers = layout
            .staging_root(H6, strategy)
            .read_dir()
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0, "orphaned staging dirs for {strategy}");
    }
}

// ── Full pipeline via the engine ──

#[tokio::test]
async fn test_pipeline_deploys_and_serves() {
    let harness = TestHarness::new(&[6]);
    let embeddings = harness.seed_horizon(H6, 500, 32);

    let engine = harness.engine();
    engine.rebuild_and_wait(H6).await.unwrap();

    // Both strategies are live on disk and in the registry.
    let layout = harness.layout();
    assert!(layout.live_index(H6, Strategy::Exact).exists());
    assert!(layout.live_index(H6, Strategy::Approximate).exists());
    assert_eq!(engine.registry().generations().len(), 2);

    // Staging was swept.
    for strategy in [Strategy::Exact, Strategy::Approximate] {
        let staging = layout.staging_root(H6, strategy);
        let leftovers = staging
            .read_dir()
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0, "staging not swept for {strategy}");
    }

    // Self-match: a stored embedding retrieves its own outcome.
    let probe = &embeddings[42];
    let forecast = engine.retrieve(H6, &probe.vector, 1).unwrap();
    assert_eq!(forecast.neighbor_count, 1);
    assert!(forecast.confidence > 0.9);
}

#[tokio::test]
async fn test_bootstrap_republishes_live_generations() {
    let harness = TestHarness::new(&[6]);
    let embeddings = harness.seed_horizon(H6, 300, 16);

    {
        let engine = harness.engine();
        engine.rebuild_and_wait(H6).await.unwrap();
    }

    // A fresh engine over the same data root picks the generations up.
    let engine = harness.engine();
    assert_eq!(engine.registry().generations().len(), 2);
    let forecast = engine.retrieve(H6, &embeddings[0].vector, 3).unwrap();
    assert_eq!(forecast.horizon, H6);
}

// ── Atomicity and rollback ──

#[tokio::test]
async fn test_reader_keeps_old_generation_across_deploy() {
    let harness = TestHarness::new(&[6]);
    let embeddings = harness.seed_horizon(H6, 300, 16);

    let engine = harness.engine();
    engine.rebuild_and_wait(H6).await.unwrap();

    // A "query in flight" holds a snapshot of the live generation.
    let held = engine.registry().get(H6, Strategy::Exact).unwrap();
    let held_id = held.generation.id;

    engine.rebuild_and_wait(H6).await.unwrap();

    let current = engine.registry().get(H6, Strategy::Exact).unwrap();
    assert_ne!(current.generation.id, held_id, "deploy did not swap");

    // The held snapshot still answers queries in full.
    let hits = held.index.search(&embeddings[7].vector, 5).unwrap();
    assert_eq!(hits.len(), 5);
    assert_eq!(hits[0].sample_id, embeddings[7].sample_id);
}

#[tokio::test]
async fn test_failed_smoke_rolls_back_byte_for_byte() {
    let harness = TestHarness::new(&[6]);
    harness.seed_horizon(H6, 200, 16);

    let engine = harness.engine();
    engine.rebuild_and_wait(H6).await.unwrap();

    let layout = harness.layout();
    let live_path = layout.live_index(H6, Strategy::Exact);
    let before = std::fs::read(&live_path).unwrap();
    let live_gen = engine.registry().get(H6, Strategy::Exact).unwrap();

    // Forge a staged generation whose artifact is garbage but whose report
    // claims validation passed; the smoke check must catch it post-swap.
    let mut generation = live_gen.generation.clone();
    generation.id = ulid::Ulid::new();
    let dir = layout.staging_dir(H6, Strategy::Exact, generation.id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("index.bin"), b"not an index").unwrap();
    std::fs::write(
        dir.join("generation.json"),
        serde_json::to_vec(&generation).unwrap(),
    )
    .unwrap();
    let staged = StagedGeneration {
        generation: generation.clone(),
        dir,
    };
    let report = ValidationReport {
        generation_id: generation.id,
        passed: true,
        checks: vec![],
        recall_estimate: None,
        latency_p95_ms: 0.1,
    };

    let (deployer, _registry) = harness.deployer();
    let outcome = deployer.deploy(&staged, &report).unwrap();
    match outcome {
        DeployOutcome::RolledBack { attempted, reason } => {
            assert_eq!(attempted.id, generation.id);
            assert!(reason.contains("unreadable"), "reason: {reason}");
        }
        other => panic!("expected RolledBack, got {other:?}"),
    }

    // The live artifact is identical to what it was before the call.
    let after = std::fs::read(&live_path).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_rollback_restores_previous_generation() {
    let harness = TestHarness::new(&[6]);
    harness.seed_horizon(H6, 200, 16);

    let engine = harness.engine();
    engine.rebuild_and_wait(H6).await.unwrap();
    let first = engine
        .registry()
        .get(H6, Strategy::Exact)
        .unwrap()
        .generation
        .clone();

    engine.rebuild_and_wait(H6).await.unwrap();
    let second = engine
        .registry()
        .get(H6, Strategy::Exact)
        .unwrap()
        .generation
        .clone();
    assert_ne!(first.id, second.id);

    // Roll back: the first generation (the latest backup) returns to live.
    let outcome = engine.rollback(H6, Strategy::Exact).unwrap();
    match outcome {
        DeployOutcome::Deployed(generation) => assert_eq!(generation.id, first.id),
        other => panic!("expected Deployed, got {other:?}"),
    }
    let live = engine.registry().get(H6, Strategy::Exact).unwrap();
    assert_eq!(live.generation.id, first.id);
}

// ── Backup retention ──

#[tokio::test]
async fn test_prune_keeps_newest_backup() {
    let mut harness = TestHarness::new(&[6]);
    harness.config.backup.max_count = 1;
    harness.seed_horizon(H6, 150, 16);

    let engine = harness.engine();
    // Three deploys: the second and third take a backup, then prune down
    // to max_count while keeping the newest.
    for _ in 0..3 {
        engine.rebuild_and_wait(H6).await.unwrap();
    }

    let backups = harness
        .backup_manager()
        .list(H6, Strategy::Exact)
        .unwrap();
    assert_eq!(backups.len(), 1);

    // The sole remaining backup is never pruned.
    let pruned = harness
        .backup_manager()
        .prune(H6, Strategy::Exact)
        .unwrap();
    assert_eq!(pruned, 0);
    assert_eq!(
        harness
            .backup_manager()
            .list(H6, Strategy::Exact)
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_horizons_are_independent() {
    let harness = TestHarness::new(&[6, 24]);
    harness.seed_horizon(H6, 100, 16);
    harness.seed_horizon(Horizon(24), 100, 16);

    let engine = harness.engine();
    engine.rebuild_and_wait(H6).await.unwrap();

    // Only 6h is live; 24h queries fall back to unavailable.
    assert!(engine.registry().get(H6, Strategy::Exact).is_some());
    assert!(engine.registry().get(Horizon(24), Strategy::Exact).is_none());

    engine.rebuild_and_wait(Horizon(24)).await.unwrap();
    assert!(engine.registry().get(Horizon(24), Strategy::Exact).is_some());
}
