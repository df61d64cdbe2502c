mod common;

use batch::{BatchError, BatchJob, CheckpointState, JobState};
use common::{MemoryStore, ScriptedBackend, body, build_pipeline, insight, long_record, record, records, settings};
use extract::InsightType;
use ingest::RequestKey;
use pipeline::{PipelineError, RunMode};
use serde_json::json;
use std::collections::BTreeSet;

fn key(id: &str) -> RequestKey {
    RequestKey::new(id, 0)
}

#[tokio::test]
async fn test_full_run_loads_and_skips_processed() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(5));
    let backend = ScriptedBackend::new();

    let report = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Full)
        .await
        .unwrap();
    assert_eq!(report.transcripts, 5);
    assert_eq!(report.requests, 5);
    assert_eq!(report.inserted, 5);
    assert_eq!(report.pending_after, 0);
    assert_eq!(report.jobs, vec!["batch_0".to_string()]);
    assert_eq!(store.insights().len(), 5);
    assert!(store.insights().iter().all(|i| i.batch_id.as_deref() == Some("batch_0")));
    assert_eq!(store.checkpoint().unwrap().job.unwrap().state, JobState::Completed);

    let again = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Full)
        .await
        .unwrap();
    assert_eq!(again.requests, 0);
    assert_eq!(backend.submitted().len(), 1);
    assert_eq!(store.insights().len(), 5);
}

#[tokio::test]
async fn test_forced_rerun_inserts_nothing_new() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(5));
    let backend = ScriptedBackend::new();
    build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Full)
        .await
        .unwrap();

    let mut forced = settings(dir.path());
    forced.force = true;
    let report = build_pipeline(&store, Some(backend.clone()), forced)
        .run(RunMode::Full)
        .await
        .unwrap();

    assert_eq!(report.requests, 5);
    assert_eq!(report.inserted, 0);
    assert_eq!(report.skipped_duplicate, 5);
    assert_eq!(store.insights().len(), 5);
}

#[tokio::test]
async fn test_partial_failure_then_resume_submits_only_failures() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(100));
    let backend = ScriptedBackend::new();
    let failing = vec![key("t010"), key("t020"), key("t030")];
    backend.fail(failing.clone());

    let report = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Full)
        .await
        .unwrap();
    assert_eq!(report.requests, 100);
    assert_eq!(report.inserted, 97);
    assert_eq!(report.request_errors, 3);
    assert_eq!(report.pending_after, 3);

    let state = store.checkpoint().unwrap();
    assert_eq!(state.job.as_ref().unwrap().state, JobState::PartiallyFailed);
    assert_eq!(
        state.pending_request_keys,
        failing.iter().cloned().collect::<BTreeSet<_>>()
    );

    backend.heal();
    let resumed = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Resume)
        .await
        .unwrap();

    let submitted = backend.submitted();
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[1], failing);
    assert_eq!(resumed.inserted, 3);
    assert_eq!(resumed.pending_after, 0);
    assert_eq!(store.insights().len(), 100);

    let after = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Full)
        .await
        .unwrap();
    assert_eq!(after.requests, 0);
    assert_eq!(backend.submitted().len(), 2);
}

#[tokio::test]
async fn test_taxonomy_closure_and_novel_feature() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(2));
    let backend = ScriptedBackend::new();

    let mut gap = insight("product_gap", "missing_capability", "Wants contracts reviewed automatically.");
    gap["module"] = json!("security_and_privacy");
    gap["feature_name"] = json!("ai_legal_reviewer");
    gap["gap_priority"] = json!("must_have");
    gap["confidence"] = json!(1.4);
    let mut faq = insight("faq", "pricing", "Asked how licences are priced.");
    faq["faq_topic"] = json!("pricing");
    backend.respond(
        key("t000"),
        body(vec![
            insight("pain", "not_a_real_code", "Something the taxonomy does not know."),
            gap,
            faq,
        ]),
    );

    let report = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Full)
        .await
        .unwrap();

    assert_eq!(report.insights_dropped, 1);
    assert_eq!(report.drop_reasons.get("unknown_subtype"), Some(&1));
    assert_eq!(report.confidence_clamped, 1);
    assert_eq!(report.new_features, vec!["ai_legal_reviewer".to_string()]);
    // a dropped insight does not hold its request back
    assert_eq!(report.pending_after, 0);

    let insights = store.insights();
    assert_eq!(insights.len(), 3);
    assert!(insights.iter().all(|i| i.insight_subtype != "not_a_real_code"));
    assert!(insights.iter().all(|i| (0.0..=1.0).contains(&i.confidence)));
    let stored_gap = insights
        .iter()
        .find(|i| i.insight_type == InsightType::ProductGap)
        .unwrap();
    assert_eq!(stored_gap.feature_name.as_deref(), Some("ai_legal_reviewer"));
    assert_eq!(stored_gap.confidence, 1.0);

    let features = store.features();
    assert_eq!(features.len(), 1);
    assert_eq!(features[0].code, "ai_legal_reviewer");
    assert_eq!(features[0].suggested_module.as_deref(), Some("security_and_privacy"));
    assert!(!features[0].is_seed);

    let mut forced = settings(dir.path());
    forced.force = true;
    let second = build_pipeline(&store, Some(backend.clone()), forced)
        .run(RunMode::Full)
        .await
        .unwrap();
    assert!(second.new_features.is_empty());
    assert_eq!(store.features().len(), 1);
}

#[tokio::test]
async fn test_malformed_response_stays_pending_until_resume() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(3));
    let backend = ScriptedBackend::new();
    backend.respond(key("t001"), "Sorry, I cannot help with that.".into());

    let report = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Full)
        .await
        .unwrap();
    assert_eq!(report.malformed_responses, 1);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.pending_after, 1);

    backend.respond(
        key("t001"),
        body(vec![insight("pain", "low_adoption", "Nobody reads the intranet.")]),
    );
    let resumed = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Resume)
        .await
        .unwrap();

    assert_eq!(backend.submitted()[1], vec![key("t001")]);
    assert_eq!(resumed.inserted, 1);
    assert_eq!(resumed.pending_after, 0);
    assert_eq!(store.insights().len(), 3);
}

#[tokio::test]
async fn test_dry_run_writes_batch_input() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(3));

    let report = build_pipeline(&store, None, settings(dir.path()))
        .run(RunMode::DryRun)
        .await
        .unwrap();

    let path = report.jsonl_path.unwrap();
    assert!(path.file_name().unwrap().to_string_lossy().starts_with("batch_input_"));
    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["custom_id"], "t000__0");
    assert_eq!(lines[0]["body"]["model"], "test-model");
    assert!(store.checkpoint().is_none());
    assert!(store.insights().is_empty());
}

#[tokio::test]
async fn test_sample_runs_direct_without_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(5));
    let backend = ScriptedBackend::new();

    let report = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Sample(2))
        .await
        .unwrap();
    assert_eq!(report.requests, 2);
    assert_eq!(report.inserted, 2);
    assert_eq!(backend.complete_count(), 2);
    assert!(backend.submitted().is_empty());
    assert!(store.checkpoint().is_none());
    assert!(store.insights().iter().all(|i| i.batch_id.is_none()));

    // samples ignore what was already processed; the sink still dedupes
    let again = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Sample(2))
        .await
        .unwrap();
    assert_eq!(again.requests, 2);
    assert_eq!(again.skipped_duplicate, 2);
    assert_eq!(store.insights().len(), 2);
}

#[tokio::test]
async fn test_requests_split_into_sub_batches() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(5));
    let backend = ScriptedBackend::new();
    let mut small = settings(dir.path());
    small.batch.max_requests_per_batch = 2;

    let report = build_pipeline(&store, Some(backend.clone()), small)
        .run(RunMode::Full)
        .await
        .unwrap();

    let sizes: Vec<usize> = backend.submitted().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(report.jobs.len(), 3);
    assert_eq!(report.inserted, 5);
    assert_eq!(report.pending_after, 0);
}

#[tokio::test]
async fn test_full_run_refuses_while_job_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(2));
    let mut job = BatchJob::new(vec![key("t000")]);
    job.mark_submitted("batch_live".into()).unwrap();
    store.set_checkpoint(CheckpointState {
        prompt_version: Some("v2.0".into()),
        pending_request_keys: [key("t000")].into_iter().collect(),
        job: Some(job),
        ..Default::default()
    });

    let err = build_pipeline(&store, Some(ScriptedBackend::new()), settings(dir.path()))
        .run(RunMode::Full)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::JobInFlight { job_id } if job_id == "batch_live"));
}

#[tokio::test]
async fn test_resume_rejects_other_prompt_version() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(1));
    store.set_checkpoint(CheckpointState {
        prompt_version: Some("v1.3".into()),
        pending_request_keys: [key("t000")].into_iter().collect(),
        ..Default::default()
    });

    let err = build_pipeline(&store, Some(ScriptedBackend::new()), settings(dir.path()))
        .run(RunMode::Resume)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::PromptVersionMismatch { checkpoint, current }
            if checkpoint == "v1.3" && current == "v2.0"
    ));
}

#[tokio::test]
async fn test_resume_drops_keys_without_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(1));
    let backend = ScriptedBackend::new();
    store.set_checkpoint(CheckpointState {
        prompt_version: Some("v2.0".into()),
        pending_request_keys: [key("t000"), key("ghost")].into_iter().collect(),
        ..Default::default()
    });

    let report = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Resume)
        .await
        .unwrap();

    assert_eq!(report.unresolvable, 1);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.pending_after, 0);
    assert_eq!(backend.submitted(), vec![vec![key("t000")]]);
}

#[tokio::test]
async fn test_batch_run_without_backend_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(1));

    let err = build_pipeline(&store, None, settings(dir.path()))
        .run(RunMode::Full)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
    assert!(!err.is_resumable());
}

#[tokio::test]
async fn test_status_reports_checkpoint_and_count() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(4));
    let backend = ScriptedBackend::new();
    backend.fail([key("t002")]);
    let pipeline = build_pipeline(&store, Some(backend.clone()), settings(dir.path()));
    pipeline.run(RunMode::Full).await.unwrap();

    let status = pipeline.status().await.unwrap();
    assert_eq!(status.insight_count, 3);
    assert!(status.live.is_none());
    let checkpoint = status.checkpoint.as_ref().unwrap();
    assert_eq!(checkpoint.pending_request_keys.len(), 1);

    let text = status.to_string();
    assert!(text.contains("partially_failed"));
    assert!(text.contains("Pending requests: 1"));
}

#[tokio::test]
async fn test_full_run_carries_earlier_pending_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(vec![long_record("long"), record("other")]);
    let backend = ScriptedBackend::new();
    let tail = RequestKey::new("long", 1);
    backend.fail([tail.clone(), key("other")]);
    let small = || {
        let mut s = settings(dir.path());
        s.chunker.max_tokens = 100;
        s
    };

    let first = build_pipeline(&store, Some(backend.clone()), small())
        .run(RunMode::Full)
        .await
        .unwrap();
    assert_eq!(first.requests, 3);
    assert_eq!(first.inserted, 1);
    assert_eq!(first.pending_after, 2);

    // "long" already has a row, so only the carried key brings its tail back
    backend.heal();
    let second = build_pipeline(&store, Some(backend.clone()), small())
        .run(RunMode::Full)
        .await
        .unwrap();
    assert_eq!(second.requests, 2);
    assert_eq!(second.inserted, 2);
    assert_eq!(second.pending_after, 0);
    assert_eq!(backend.submitted()[1], vec![key("other"), tail]);

    let mut chunks: Vec<u32> = store
        .insights()
        .iter()
        .filter(|i| i.transcript_id == "long")
        .map(|i| i.transcript_chunk)
        .collect();
    chunks.sort();
    assert_eq!(chunks, vec![0, 1]);
}

#[tokio::test]
async fn test_resume_aborts_when_recorded_job_failed() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(1));
    let backend = ScriptedBackend::new();
    backend.kill("batch_dead");
    let mut job = BatchJob::new(vec![key("t000")]);
    job.mark_submitted("batch_dead".into()).unwrap();
    job.advance(JobState::Polling).unwrap();
    store.set_checkpoint(CheckpointState {
        prompt_version: Some("v2.0".into()),
        pending_request_keys: [key("t000")].into_iter().collect(),
        job: Some(job),
        ..Default::default()
    });

    let err = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Resume)
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        PipelineError::Batch(BatchError::JobFailed { job_id, .. }) if job_id == "batch_dead"
    ));
    assert!(err.is_resumable());
    assert!(backend.submitted().is_empty());

    let state = store.checkpoint().unwrap();
    assert_eq!(state.job.unwrap().state, JobState::Failed);
    assert!(state.pending_request_keys.contains(&key("t000")));

    // the next resume skips the failed job and resubmits its keys
    let report = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Resume)
        .await
        .unwrap();
    assert_eq!(backend.submitted(), vec![vec![key("t000")]]);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.pending_after, 0);
}

#[tokio::test]
async fn test_resume_polls_submitted_job_without_resubmitting() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(2));
    let backend = ScriptedBackend::new();
    let keys = vec![key("t000"), key("t001")];
    backend.existing_job("batch_7", &keys);
    let mut job = BatchJob::new(keys.clone());
    job.mark_submitted("batch_7".into()).unwrap();
    store.set_checkpoint(CheckpointState {
        prompt_version: Some("v2.0".into()),
        pending_request_keys: keys.iter().cloned().collect(),
        job: Some(job),
        ..Default::default()
    });

    let report = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Resume)
        .await
        .unwrap();

    assert!(backend.submitted().is_empty());
    assert!(backend.poll_count() >= 1);
    assert_eq!(report.jobs, vec!["batch_7".to_string()]);
    assert_eq!(report.inserted, 2);
    assert_eq!(report.pending_after, 0);
    assert!(store.insights().iter().all(|i| i.batch_id.as_deref() == Some("batch_7")));
    assert_eq!(store.checkpoint().unwrap().job.unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn test_write_failure_keeps_request_pending() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(3));
    let backend = ScriptedBackend::new();
    store.break_writes("t001");

    let report = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Full)
        .await
        .unwrap();
    assert_eq!(report.inserted, 2);
    assert_eq!(report.load_failed, 1);
    assert_eq!(report.pending_after, 1);
    assert_eq!(
        store.checkpoint().unwrap().pending_request_keys,
        BTreeSet::from([key("t001")])
    );

    // re-collecting the settled job is enough once the sink recovers
    store.repair_writes();
    let resumed = build_pipeline(&store, Some(backend.clone()), settings(dir.path()))
        .run(RunMode::Resume)
        .await
        .unwrap();
    assert_eq!(backend.submitted().len(), 1);
    assert_eq!(resumed.inserted, 1);
    assert_eq!(resumed.pending_after, 0);
    assert_eq!(store.insights().len(), 3);
}

#[tokio::test]
async fn test_reset_clears_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::with_records(records(2));
    let backend = ScriptedBackend::new();
    backend.fail([key("t001")]);
    let pipeline = build_pipeline(&store, Some(backend.clone()), settings(dir.path()));
    pipeline.run(RunMode::Full).await.unwrap();
    assert!(store.checkpoint().is_some());

    pipeline.reset().await.unwrap();
    assert!(store.checkpoint().is_none());
    assert!(pipeline.status().await.unwrap().to_string().contains("Checkpoint:       none"));
}
