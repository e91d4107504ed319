mod common;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::json;
use sessionflow::db::{
    Database, DbThrottle, ExampleShape, Interaction, InteractionKind, ProcessingStatus,
    SessionStatus,
};
use sessionflow::store::AppendPolicy;
use sessionflow::{JobOutcome, JobOutput, JobType, PipelineSettings, Runtime, SessionStore};

use common::{calls, fast_settings, next_update_for, wait_for_status, Fakes};

async fn start(settings: PipelineSettings, fakes: &Fakes) -> Runtime {
    let database = Database::open_in_memory().unwrap();
    Runtime::start(settings, database, fakes.collaborators())
        .await
        .unwrap()
}

/// Start a session with one interaction and fire the completion signal.
async fn complete_one(runtime: &Runtime, session_id: &str) -> sessionflow::ProcessingUpdate {
    let ingestor = runtime.ingestor();
    let mut stream = runtime.notifier().stream();
    ingestor
        .start_session(Some(session_id.to_string()))
        .await
        .unwrap();
    ingestor
        .record_interaction(
            session_id,
            Interaction::new(1, InteractionKind::Click, Utc::now()),
        )
        .await
        .unwrap();
    let job_id = ingestor.complete_session(session_id).await.unwrap();
    next_update_for(&mut stream, &job_id).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn both_training_shapes_persist_two_examples() {
    for (field, shape) in [
        ("examples", ExampleShape::Examples),
        ("messages", ExampleShape::Messages),
    ] {
        let fakes = Fakes::new(80.0, json!({ field: ["a", "b"] }));
        let runtime = start(fast_settings(), &fakes).await;

        let update = complete_one(&runtime, "s1").await;
        assert!(update.is_completed(), "{field}: {update:?}");

        let examples = runtime.store().training_examples("s1").await.unwrap();
        assert_eq!(examples.len(), 2);
        assert!(examples.iter().all(|example| example.shape == shape));
        assert_eq!(examples[0].payload, json!("a"));

        runtime.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_training_output_fails_explicitly() {
    let fakes = Fakes::new(80.0, json!({}));
    let runtime = start(fast_settings(), &fakes).await;

    let update = complete_one(&runtime, "s1").await;
    match &update.outcome {
        JobOutcome::Failed { error } => assert!(error.contains("no examples"), "{error}"),
        other => panic!("expected failure, got {other:?}"),
    }
    // One retry allowed by the settings.
    assert_eq!(update.retry_count, 1);
    assert_eq!(calls(&fakes.trainer.calls), 2);

    let session = runtime.store().get_session("s1").await.unwrap();
    assert_eq!(session.status, SessionStatus::Processing);
    assert_eq!(session.processing_status, ProcessingStatus::Training);
    assert!(runtime.store().training_examples("s1").await.unwrap().is_empty());

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn low_validation_score_fails_session_without_retry() {
    let fakes = Fakes::new(12.0, json!({ "examples": ["a"] }));
    let runtime = start(fast_settings(), &fakes).await;

    let update = complete_one(&runtime, "s1").await;
    assert!(!update.is_completed());
    assert_eq!(update.retry_count, 0);
    assert_eq!(calls(&fakes.validator.calls), 1);
    assert_eq!(calls(&fakes.quality.calls), 0);
    assert_eq!(calls(&fakes.trainer.calls), 0);

    let session = runtime.store().get_session("s1").await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.processing_status, ProcessingStatus::Failed);
    assert!(session.quality.is_none());

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_flag_above_floor_still_completes() {
    // The fake marks anything below 50 invalid; 45 is above the default floor.
    let fakes = Fakes::new(45.0, json!({ "examples": ["a"] }));
    let runtime = start(fast_settings(), &fakes).await;

    let update = complete_one(&runtime, "s1").await;
    assert!(update.is_completed(), "{update:?}");

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_archiving_is_skipped() {
    let fakes = Fakes::healthy();
    let settings = PipelineSettings {
        archive_enabled: false,
        ..fast_settings()
    };
    let runtime = start(settings, &fakes).await;

    let update = complete_one(&runtime, "s1").await;
    assert!(update.is_completed(), "{update:?}");
    assert_eq!(calls(&fakes.archiver.calls), 0);

    let session = runtime.store().get_session("s1").await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.archive_ref.is_none());

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hung_collaborator_times_out_and_is_retried() {
    let mut fakes = Fakes::healthy();
    fakes.enhancer = Arc::new(common::FakeEnhancer {
        delay: Duration::from_secs(5),
        calls: Default::default(),
    });
    let settings = PipelineSettings {
        stage_timeout_ms: 50,
        ..fast_settings()
    };
    let runtime = start(settings, &fakes).await;

    let update = complete_one(&runtime, "s1").await;
    match &update.outcome {
        JobOutcome::Failed { error } => {
            assert!(error.contains("enhancement stage timed out"), "{error}")
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(calls(&fakes.enhancer.calls), 2);
    // Whole-job retry restarts from validation.
    assert_eq!(calls(&fakes.validator.calls), 2);

    let session = runtime.store().get_session("s1").await.unwrap();
    assert_eq!(session.processing_status, ProcessingStatus::Enhancing);

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failure_recovers_on_retry() {
    let mut fakes = Fakes::healthy();
    fakes.trainer = Arc::new(common::FakeTrainer {
        output: json!({ "examples": ["a", "b"] }),
        failures: 1,
        calls: Default::default(),
    });
    let runtime = start(fast_settings(), &fakes).await;

    let update = complete_one(&runtime, "s1").await;
    assert!(update.is_completed(), "{update:?}");
    assert_eq!(update.retry_count, 1);
    // Quality stays as first written across the rerun.
    assert_eq!(calls(&fakes.quality.calls), 2);
    let session = runtime.store().get_session("s1").await.unwrap();
    assert_eq!(session.quality.map(|q| q.quality_score), Some(72.0));

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn high_value_interaction_triggers_interim_quality_check() {
    let fakes = Fakes::healthy();
    let runtime = start(fast_settings(), &fakes).await;
    let ingestor = runtime.ingestor();
    let mut stream = runtime.notifier().stream();

    ingestor.start_session(Some("s1".into())).await.unwrap();
    let mut nav = Interaction::new(1, InteractionKind::Navigation, Utc::now());
    nav.url = Some("https://shop.example/checkout".into());
    ingestor.record_interaction("s1", nav).await.unwrap();

    let update = tokio::time::timeout(Duration::from_secs(10), stream.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.job_type, JobType::QualityCheck);
    match update.outcome {
        JobOutcome::Completed {
            result: JobOutput::QualityAssessed { quality },
        } => assert_eq!(quality.quality_score, 72.0),
        other => panic!("unexpected outcome {other:?}"),
    }

    // Interim checks leave the write-once quality fields alone.
    let session = runtime.store().get_session("s1").await.unwrap();
    assert!(session.quality.is_none());
    assert_eq!(session.status, SessionStatus::Active);

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_sessions_are_requeued_on_start() {
    let database = Database::open_in_memory().unwrap();
    let settings = fast_settings();
    let store = SessionStore::new(
        database.clone(),
        Arc::new(DbThrottle::new(2)),
        AppendPolicy::from_settings(&settings),
    );
    store.create_session(Some("stuck".into())).await.unwrap();
    store.begin_processing("stuck").await.unwrap();
    store
        .update_processing_status("stuck", ProcessingStatus::Training)
        .await
        .unwrap();
    store.create_session(Some("idle".into())).await.unwrap();

    let fakes = Fakes::healthy();
    let runtime = Runtime::start(settings, database, fakes.collaborators())
        .await
        .unwrap();

    let session = wait_for_status(runtime.store(), "stuck", SessionStatus::Completed).await;
    assert_eq!(session.processing_status, ProcessingStatus::Completed);
    assert_eq!(
        runtime.store().get_session("idle").await.unwrap().status,
        SessionStatus::Active
    );

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_screenshot_and_training_jobs_run() {
    let fakes = Fakes::healthy();
    let runtime = start(fast_settings(), &fakes).await;
    let ingestor = runtime.ingestor();
    let mut stream = runtime.notifier().stream();
    ingestor.start_session(Some("s1".into())).await.unwrap();

    let shot_job = ingestor.enqueue_screenshot(sessionflow::db::Screenshot {
        id: "shot-1".into(),
        session_id: "s1".into(),
        captured_at: Utc::now(),
        blob_ref: "blob://shot-1".into(),
        width: Some(1280),
        height: Some(720),
    });
    let update = next_update_for(&mut stream, &shot_job).await;
    assert!(update.is_completed(), "{update:?}");
    assert_eq!(runtime.store().screenshots("s1").await.unwrap().len(), 1);

    let training_job = ingestor.request_training_data("s1");
    let update = next_update_for(&mut stream, &training_job).await;
    match update.outcome {
        JobOutcome::Completed {
            result: JobOutput::TrainingGenerated { examples },
        } => assert_eq!(examples, 2),
        other => panic!("unexpected outcome {other:?}"),
    }

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn appends_for_a_session_keep_submission_order() {
    let fakes = Fakes::healthy();
    let settings = PipelineSettings {
        batch_window_ms: 2_000,
        ..fast_settings()
    };
    let runtime = start(settings, &fakes).await;
    let ingestor = runtime.ingestor();

    let sessions: Vec<String> = (0..20).map(|i| format!("s{i}")).collect();
    for session_id in &sessions {
        ingestor.start_session(Some(session_id.clone())).await.unwrap();
    }

    let bursts = sessions.iter().map(|session_id| {
        let ingestor = ingestor.clone();
        async move {
            let appends = (1..=5).map(|sequence| {
                ingestor.record_interaction(
                    session_id,
                    Interaction::new(sequence, InteractionKind::Click, Utc::now()),
                )
            });
            futures::future::join_all(appends).await
        }
    });
    for results in futures::future::join_all(bursts).await {
        assert!(results.iter().all(|result| result.is_ok()), "{results:?}");
    }

    for session_id in &sessions {
        let session = runtime.store().get_session(session_id).await.unwrap();
        let order: Vec<u64> = session
            .interaction_log
            .iter()
            .map(|interaction| interaction.sequence)
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5], "{session_id}");
        assert_eq!(session.version, 5);
    }

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_completion_joins_the_running_pipeline() {
    let mut fakes = Fakes::healthy();
    fakes.enhancer = Arc::new(common::FakeEnhancer {
        delay: Duration::from_millis(200),
        calls: Default::default(),
    });
    let runtime = start(fast_settings(), &fakes).await;
    let ingestor = runtime.ingestor();
    let mut stream = runtime.notifier().stream();

    ingestor.start_session(Some("s1".into())).await.unwrap();
    let first = ingestor.complete_session("s1").await.unwrap();
    let second = ingestor.complete_session("s1").await.unwrap();
    assert_eq!(first, second);

    let update = next_update_for(&mut stream, &first).await;
    assert!(update.is_completed(), "{update:?}");
    assert_eq!(calls(&fakes.validator.calls), 1);
    assert_eq!(calls(&fakes.enhancer.calls), 1);
    assert_eq!(calls(&fakes.trainer.calls), 1);

    let session = runtime.store().get_session("s1").await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(runtime.stats().pending, 0);

    runtime.shutdown().await;
}
