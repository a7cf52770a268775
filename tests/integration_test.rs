mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    document, eventually, new_items, test_config, FlakyResultStore, FlakyStatusStore, Harness,
    Probe,
};
use docflow_pipeline::infrastructure::{
    FileResultStore, FileStatusStore, InMemoryResultStore, InMemoryStatusStore, InMemoryTraceSink,
};
use docflow_pipeline::models::{FailureKind, RunState, SpanStatus, Stage, StageRunState};
use docflow_pipeline::{BatchItem, Orchestrator, PipelineError};
use tokio::sync::Semaphore;

#[tokio::test]
async fn test_five_files_with_limit_four_queue_one() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::new(test_config(&dir, 4), Probe::gated(gate.clone()));

    let receipt = h
        .orchestrator
        .submit_batch(new_items(&["a.txt", "b.txt", "c.txt", "d.txt", "e.txt"]))
        .await;
    assert_eq!(receipt.accepted.len(), 5);
    assert!(receipt.rejected.is_empty());

    // 四个进入 RUNNING 并卡在 INGEST，第五个保持 PENDING
    let orch = &h.orchestrator;
    eventually(|| async move {
        let rows = orch.list_status().await.unwrap();
        rows.iter().filter(|r| r.run_state == RunState::Running).count() == 4
    })
    .await;
    let rows = h.orchestrator.list_status().await.unwrap();
    assert_eq!(rows.len(), 5);
    assert_eq!(
        rows.iter().filter(|r| r.run_state == RunState::Pending).count(),
        1
    );
    let stats = h.orchestrator.scheduler_stats();
    assert_eq!(stats.running, 4);
    assert_eq!(stats.queued, 1);

    gate.add_permits(5);
    let outcomes = receipt.wait().await;
    assert!(outcomes.iter().all(|o| o.as_ref().unwrap().is_success()));

    let traces = h.sink.traces().await;
    assert_eq!(traces.len(), 5);
    for trace in &traces {
        assert_eq!(trace.root.name, "process_file_pipeline");
        assert_eq!(trace.root.status, SpanStatus::Ok);
        assert_eq!(trace.children.len(), 5);
        assert!(trace.is_well_nested());
    }
    assert_eq!(h.orchestrator.scheduler_stats().peak, 4);
}

#[tokio::test]
async fn test_reprocess_resumes_from_parse_after_categorize_failure() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(test_config(&dir, 4), Probe::new());
    h.probe.fail(Stage::Categorize, "b.txt");

    let receipt = h
        .orchestrator
        .submit_batch(new_items(&["a.txt", "b.txt"]))
        .await;
    let file_id = receipt.accepted[1].file_id.clone();
    let outcomes = receipt.wait().await;
    assert!(outcomes[0].as_ref().unwrap().is_success());

    let failed = outcomes[1].as_ref().unwrap();
    assert_eq!(failed.run_state, RunState::Failed);
    assert_eq!(failed.failed_stage, Some(Stage::Categorize));
    assert_eq!(failed.error_kind, Some(FailureKind::Adapter));
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .contains("scripted failure"));

    let results = h.orchestrator.get_results(&file_id).await.unwrap();
    let stages: Vec<Stage> = results.iter().map(|r| r.stage).collect();
    assert_eq!(stages, vec![Stage::Ingest, Stage::Parse]);

    // 修复后重新处理
    h.probe.clear_failures();
    let run = h.orchestrator.reprocess(&file_id, false).await.unwrap();
    assert_eq!(run.attempt, 2);
    assert_eq!(run.resume, Stage::Parse);
    let outcome = run.wait().await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(h.probe.calls(Stage::Ingest, "b.txt"), 1);
    assert_eq!(h.probe.calls(Stage::Parse, "b.txt"), 2);

    // 结果只追加，不覆盖
    let results = h.orchestrator.get_results(&file_id).await.unwrap();
    let rows: Vec<(Stage, u32)> = results.iter().map(|r| (r.stage, r.attempt)).collect();
    assert_eq!(
        rows,
        vec![
            (Stage::Ingest, 1),
            (Stage::Parse, 1),
            (Stage::Parse, 2),
            (Stage::Categorize, 2),
            (Stage::Extract, 2),
            (Stage::Deidentify, 2),
        ]
    );

    let row = h.orchestrator.get_status(&file_id).await.unwrap().unwrap();
    assert_eq!(row.run_state, RunState::Succeeded);
    assert_eq!(row.attempt, 2);
    assert_eq!(row.failed_stage, None);
    assert_eq!(row.error_message, None);
    assert_eq!(row.stage_states.get(&Stage::Categorize), Some(&StageRunState::Completed));

    let traces = h.sink.traces().await;
    let retry = traces
        .iter()
        .find(|t| t.root.name == "reprocess_file_pipeline")
        .unwrap();
    assert_eq!(
        retry.child_names(),
        vec!["stage_2_parse", "stage_3_categorize", "stage_4_extract", "stage_5_deidentify"]
    );
    assert_eq!(Some(retry.trace_id.clone()), row.trace_id);
}

async fn run_forced_failure(max_concurrent: usize) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir, max_concurrent);
    config.force_failure_stage = Some("extract".to_string());
    let h = Harness::new(config, Probe::new());

    let receipt = h
        .orchestrator
        .submit_batch(new_items(&["a.txt", "b.txt", "c.txt"]))
        .await;
    let ids = receipt.file_ids();
    for outcome in receipt.wait().await {
        let outcome = outcome.unwrap();
        assert_eq!(outcome.run_state, RunState::Failed);
        assert_eq!(outcome.failed_stage, Some(Stage::Extract));
        assert_eq!(outcome.error_kind, Some(FailureKind::Adapter));
    }
    for id in &ids {
        assert_eq!(h.orchestrator.get_results(id).await.unwrap().len(), 3);
    }
    // 强制失败时不调用适配器
    assert_eq!(h.probe.calls(Stage::Extract, "a.txt"), 0);

    let traces = h.sink.traces().await;
    assert_eq!(traces.len(), 3);
    for trace in &traces {
        assert!(matches!(trace.root.status, SpanStatus::Error(_)));
        assert_eq!(trace.children.len(), 3);
        assert!(matches!(trace.children[2].status, SpanStatus::Error(_)));
        assert!(trace.is_well_nested());
    }
}

#[tokio::test]
async fn test_forced_failure_sequential() {
    run_forced_failure(1).await;
}

#[tokio::test]
async fn test_forced_failure_concurrent() {
    run_forced_failure(4).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_never_exceeds_limit() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(
        test_config(&dir, 3),
        Probe::with_delay(Duration::from_millis(2)),
    );

    let names: Vec<String> = (0..10).map(|i| format!("doc-{}.txt", i)).collect();
    let items = names.iter().map(|n| BatchItem::New(document(n))).collect();
    let outcomes = h.orchestrator.submit_batch(items).await.wait().await;

    assert_eq!(outcomes.len(), 10);
    assert!(outcomes.iter().all(|o| o.as_ref().unwrap().is_success()));
    assert!(h.probe.peak_in_flight() <= 3);

    // 槽位在结果送出之后才归还
    let orch = &h.orchestrator;
    eventually(|| async move { orch.scheduler_stats().completed == 10 }).await;
    let stats = h.orchestrator.scheduler_stats();
    assert!(stats.peak <= 3);
    assert_eq!(stats.running, 0);
}

#[tokio::test]
async fn test_rejected_requests_change_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::new(test_config(&dir, 4), Probe::gated(gate.clone()));

    let done = h
        .orchestrator
        .submit_file(document("done.txt"))
        .await
        .unwrap();
    let done_id = done.file_id.clone();
    gate.add_permits(1);
    assert!(done.wait().await.unwrap().is_success());

    // 第二个文件卡在 INGEST，保持 RUNNING
    let running = h
        .orchestrator
        .submit_file(document("running.txt"))
        .await
        .unwrap();
    let running_id = running.file_id.clone();
    let (orch, id) = (&h.orchestrator, running_id.as_str());
    eventually(|| async move {
        let row = orch.get_status(id).await.unwrap().unwrap();
        row.run_state == RunState::Running
    })
    .await;

    let done_before = h.orchestrator.get_status(&done_id).await.unwrap();
    let running_before = h.orchestrator.get_status(&running_id).await.unwrap();
    let traces_before = h.sink.traces().await.len();

    let receipt = h
        .orchestrator
        .submit_batch(vec![
            BatchItem::reprocess(done_id.clone()),
            BatchItem::reprocess(running_id.clone()),
            BatchItem::reprocess("no-such-file"),
            BatchItem::New(document("script.exe")),
        ])
        .await;
    assert!(receipt.accepted.is_empty());
    let errors: Vec<&PipelineError> = receipt.rejected.iter().map(|r| &r.error).collect();
    assert!(matches!(
        errors[0],
        PipelineError::InvalidReprocess {
            state: Some(RunState::Succeeded),
            ..
        }
    ));
    assert!(matches!(errors[1], PipelineError::ConcurrencyViolation { .. }));
    assert!(matches!(errors[2], PipelineError::InvalidReprocess { state: None, .. }));
    assert!(matches!(errors[3], PipelineError::InvalidSubmission { .. }));
    assert!(errors.iter().all(|e| e.is_rejection()));

    assert_eq!(h.orchestrator.get_status(&done_id).await.unwrap(), done_before);
    assert_eq!(h.orchestrator.get_status(&running_id).await.unwrap(), running_before);
    assert_eq!(h.orchestrator.list_status().await.unwrap().len(), 2);
    assert_eq!(h.sink.traces().await.len(), traces_before);

    gate.add_permits(1);
    assert!(running.wait().await.unwrap().is_success());
}

#[tokio::test]
async fn test_failed_at_ingest_cannot_be_reprocessed() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(test_config(&dir, 2), Probe::new());
    h.probe.fail(Stage::Ingest, "a.txt");

    let run = h.orchestrator.submit_file(document("a.txt")).await.unwrap();
    let file_id = run.file_id.clone();
    let outcome = run.wait().await.unwrap();
    assert_eq!(outcome.failed_stage, Some(Stage::Ingest));

    let err = h.orchestrator.reprocess(&file_id, false).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidReprocess {
            state: Some(RunState::Failed),
            ..
        }
    ));
    let row = h.orchestrator.get_status(&file_id).await.unwrap().unwrap();
    assert_eq!(row.attempt, 1);
    assert_eq!(row.run_state, RunState::Failed);
}

#[tokio::test]
async fn test_panicking_adapter_fails_run_and_releases_slot() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(test_config(&dir, 1), Probe::new());
    h.probe.panic_on(Stage::Parse, "a.txt");

    let outcomes = h
        .orchestrator
        .submit_batch(new_items(&["a.txt", "b.txt"]))
        .await
        .wait()
        .await;

    let first = outcomes[0].as_ref().unwrap();
    assert_eq!(first.run_state, RunState::Failed);
    assert_eq!(first.failed_stage, Some(Stage::Parse));
    assert!(first
        .error_message
        .as_deref()
        .unwrap()
        .contains("scripted panic"));
    assert!(outcomes[1].as_ref().unwrap().is_success());
    let orch = &h.orchestrator;
    eventually(|| async move { orch.scheduler_stats().running == 0 }).await;
}

#[tokio::test]
async fn test_file_stores_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let config = test_config(&dir, 2);
    let probe = Probe::new();
    probe.fail(Stage::Extract, "a.txt");

    let open = |config: docflow_pipeline::Config, probe: Arc<Probe>| {
        let state_dir = state_dir.clone();
        async move {
            let adapters = common::probed_adapters(&config, &probe);
            Orchestrator::new(
                config,
                Arc::new(FileStatusStore::open(&state_dir).await.unwrap()),
                Arc::new(FileResultStore::open(&state_dir).await.unwrap()),
                adapters,
                Arc::new(InMemoryTraceSink::new()),
            )
            .unwrap()
        }
    };

    let file_id = {
        let orch = open(config.clone(), probe.clone()).await;
        let run = orch.submit_file(document("a.txt")).await.unwrap();
        let file_id = run.file_id.clone();
        assert_eq!(run.wait().await.unwrap().failed_stage, Some(Stage::Extract));
        file_id
    };

    probe.clear_failures();
    let orch = open(config, probe.clone()).await;
    let row = orch.get_status(&file_id).await.unwrap().unwrap();
    assert_eq!(row.run_state, RunState::Failed);
    assert_eq!(row.failed_stage, Some(Stage::Extract));
    assert_eq!(orch.get_results(&file_id).await.unwrap().len(), 3);

    let outcome = orch
        .reprocess(&file_id, true)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(orch.get_results(&file_id).await.unwrap().len(), 7);
    assert_eq!(probe.calls(Stage::Ingest, "a.txt"), 1);
}

#[tokio::test]
async fn test_status_events_and_run_log() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::new(test_config(&dir, 2), Probe::new());
    let mut events = h.orchestrator.subscribe();

    let run = h.orchestrator.submit_file(document("a.txt")).await.unwrap();
    let file_id = run.file_id.clone();
    assert!(run.wait().await.unwrap().is_success());

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.file_id, file_id);
        states.push(event.run_state);
    }
    assert_eq!(states.first(), Some(&RunState::Pending));
    assert_eq!(states.last(), Some(&RunState::Succeeded));
    assert!(states.contains(&RunState::Running));

    let row = h.orchestrator.get_status(&file_id).await.unwrap().unwrap();
    let log_path = row.log_path.unwrap();
    let log = tokio::fs::read_to_string(&log_path).await.unwrap();
    assert!(log.lines().count() >= 2);
    assert!(log.contains(&file_id));
}

#[tokio::test]
async fn test_list_status_most_recent_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir, 1);
    config.status_display_limit = 2;
    let h = Harness::new(config, Probe::new());

    let receipt = h
        .orchestrator
        .submit_batch(new_items(&["a.txt", "b.txt", "c.txt"]))
        .await;
    let ids = receipt.file_ids();
    receipt.wait().await;

    let rows = h.orchestrator.list_status().await.unwrap();
    let listed: Vec<&str> = rows.iter().map(|r| r.file_id.as_str()).collect();
    assert_eq!(listed, vec![ids[2].as_str(), ids[1].as_str()]);
}

#[tokio::test]
async fn test_result_store_failure_is_recorded_as_store_failure() {
    let dir = tempfile::tempdir().unwrap();
    let results = FlakyResultStore::failing_at(Stage::Extract);
    let h = Harness::with_stores(
        test_config(&dir, 2),
        Probe::new(),
        Arc::new(InMemoryStatusStore::new()),
        results.clone(),
    );

    let run = h.orchestrator.submit_file(document("a.txt")).await.unwrap();
    let file_id = run.file_id.clone();
    let outcome = run.wait().await.unwrap();
    assert_eq!(outcome.run_state, RunState::Failed);
    assert_eq!(outcome.failed_stage, Some(Stage::Extract));
    assert_eq!(outcome.error_kind, Some(FailureKind::Store));
    assert!(outcome.error_message.as_deref().unwrap().contains("down"));

    // 之前阶段的结果保留
    let stages: Vec<Stage> = h
        .orchestrator
        .get_results(&file_id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.stage)
        .collect();
    assert_eq!(stages, vec![Stage::Ingest, Stage::Parse, Stage::Categorize]);

    let traces = h.sink.traces().await;
    assert_eq!(traces.len(), 1);
    assert!(traces[0].is_well_nested());
    assert_eq!(traces[0].children.len(), 4);
    assert!(matches!(traces[0].children[3].status, SpanStatus::Error(_)));

    // 存储恢复后重新处理
    results.recover();
    let outcome = h
        .orchestrator
        .reprocess(&file_id, false)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.attempt, 2);
    assert_eq!(h.orchestrator.get_results(&file_id).await.unwrap().len(), 7);
}

#[tokio::test]
async fn test_status_store_failure_when_marking_stage() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::with_stores(
        test_config(&dir, 2),
        Probe::new(),
        FlakyStatusStore::failing_at(Stage::Parse),
        Arc::new(InMemoryResultStore::new()),
    );

    let run = h.orchestrator.submit_file(document("a.txt")).await.unwrap();
    let file_id = run.file_id.clone();
    let outcome = run.wait().await.unwrap();
    assert_eq!(outcome.run_state, RunState::Failed);
    assert_eq!(outcome.failed_stage, Some(Stage::Parse));
    assert_eq!(outcome.error_kind, Some(FailureKind::Store));

    // PARSE 没有开始：没有结果，也没有子 span
    assert_eq!(h.probe.calls(Stage::Parse, "a.txt"), 0);
    assert_eq!(h.orchestrator.get_results(&file_id).await.unwrap().len(), 1);
    let row = h.orchestrator.get_status(&file_id).await.unwrap().unwrap();
    assert_eq!(row.run_state, RunState::Failed);

    let traces = h.sink.traces().await;
    assert!(traces[0].is_well_nested());
    assert_eq!(traces[0].child_names(), vec!["stage_1_ingest"]);
    assert!(matches!(traces[0].root.status, SpanStatus::Error(_)));
}
