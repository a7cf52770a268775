//! 集成测试共用的工具：包一层本地适配器，记录调用、注入失败和阻塞

#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use docflow_pipeline::error::{StoreError, StoreResult};
use docflow_pipeline::infrastructure::{
    InMemoryResultStore, InMemoryStatusStore, InMemoryTraceSink, ResultStore, StatusStore,
};
use docflow_pipeline::models::{
    FileProcessingStatus, RunState, Stage, StageOutput, StageResult, StatusVersion, UploadedFile,
};
use docflow_pipeline::services::{
    local_adapters, StageAdapter, StageAdapters, StageFailure, StageInput,
};
use docflow_pipeline::{BatchItem, Config, Orchestrator};
use tempfile::TempDir;
use tokio::sync::Semaphore;

/// 所有阶段共享的探针
#[derive(Default)]
pub struct Probe {
    calls: Mutex<Vec<(Stage, String)>>,
    failing: Mutex<HashSet<(Stage, String)>>,
    panicking: Mutex<HashSet<(Stage, String)>>,
    ingest_gate: Option<Arc<Semaphore>>,
    delay: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// INGEST 在拿到许可前一直阻塞
    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            ingest_gate: Some(gate),
            ..Self::default()
        })
    }

    /// 每次调用都睡眠一段时间
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn fail(&self, stage: Stage, filename: &str) {
        self.failing.lock().unwrap().insert((stage, filename.to_string()));
    }

    pub fn panic_on(&self, stage: Stage, filename: &str) {
        self.panicking.lock().unwrap().insert((stage, filename.to_string()));
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
        self.panicking.lock().unwrap().clear();
    }

    pub fn calls(&self, stage: Stage, filename: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, f)| *s == stage && f == filename)
            .count()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a Probe);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ProbeAdapter {
    inner: Arc<dyn StageAdapter>,
    probe: Arc<Probe>,
}

#[async_trait]
impl StageAdapter for ProbeAdapter {
    fn stage(&self) -> Stage {
        self.inner.stage()
    }

    async fn run(&self, input: &StageInput<'_>) -> Result<StageOutput, StageFailure> {
        let stage = self.stage();
        let key = (stage, input.filename.to_string());
        self.probe.calls.lock().unwrap().push(key.clone());

        let now = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.probe);

        if stage == Stage::Ingest {
            if let Some(gate) = &self.probe.ingest_gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
        }
        if !self.probe.delay.is_zero() {
            tokio::time::sleep(self.probe.delay).await;
        }

        if self.probe.panicking.lock().unwrap().contains(&key) {
            panic!("scripted panic in {}", stage);
        }
        if self.probe.failing.lock().unwrap().contains(&key) {
            return Err(StageFailure::new(stage, format!("scripted failure in {}", stage)));
        }
        self.inner.run(input).await
    }
}

/// 用探针包住本地适配器
pub fn probed_adapters(config: &Config, probe: &Arc<Probe>) -> StageAdapters {
    let local = local_adapters(config).unwrap();
    let wrap = |stage: Stage| -> Arc<dyn StageAdapter> {
        Arc::new(ProbeAdapter {
            inner: local.get(stage).clone(),
            probe: probe.clone(),
        })
    };
    StageAdapters::new(
        wrap(Stage::Ingest),
        wrap(Stage::Parse),
        wrap(Stage::Categorize),
        wrap(Stage::Extract),
        wrap(Stage::Deidentify),
    )
    .unwrap()
}

/// 测试配置：所有输出都在临时目录下
pub fn test_config(dir: &TempDir, max_concurrent: usize) -> Config {
    Config {
        max_concurrent_files: max_concurrent,
        volume_path: dir.path().join("volume").display().to_string(),
        logs_dir: Some(dir.path().join("logs").display().to_string()),
        state_dir: None,
        traces_file: dir.path().join("traces.jsonl").display().to_string(),
        ..Config::default()
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub probe: Arc<Probe>,
    pub sink: Arc<InMemoryTraceSink>,
}

impl Harness {
    /// 内存存储 + 内存 trace
    pub fn new(config: Config, probe: Arc<Probe>) -> Self {
        Self::with_stores(
            config,
            probe,
            Arc::new(InMemoryStatusStore::new()),
            Arc::new(InMemoryResultStore::new()),
        )
    }

    pub fn with_stores(
        config: Config,
        probe: Arc<Probe>,
        status_store: Arc<dyn StatusStore>,
        result_store: Arc<dyn ResultStore>,
    ) -> Self {
        let sink = Arc::new(InMemoryTraceSink::new());
        let adapters = probed_adapters(&config, &probe);
        let orchestrator =
            Orchestrator::new(config, status_store, result_store, adapters, sink.clone()).unwrap();
        Self {
            orchestrator,
            probe,
            sink,
        }
    }
}

/// 结果存储：指定阶段的写入返回 `Unavailable`
#[derive(Default)]
pub struct FlakyResultStore {
    inner: InMemoryResultStore,
    failing: Mutex<Option<Stage>>,
}

impl FlakyResultStore {
    pub fn failing_at(stage: Stage) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryResultStore::new(),
            failing: Mutex::new(Some(stage)),
        })
    }

    pub fn recover(&self) {
        *self.failing.lock().unwrap() = None;
    }
}

#[async_trait]
impl ResultStore for FlakyResultStore {
    async fn append_result(&self, row: StageResult) -> StoreResult<()> {
        let failing = *self.failing.lock().unwrap();
        if failing == Some(row.stage) {
            return Err(StoreError::Unavailable("down".into()));
        }
        self.inner.append_result(row).await
    }

    async fn get_results(&self, file_id: &str) -> StoreResult<Vec<StageResult>> {
        self.inner.get_results(file_id).await
    }
}

/// 状态存储：把某个阶段标记为 RUNNING 的写入返回 `Unavailable`，其余写入正常
#[derive(Default)]
pub struct FlakyStatusStore {
    inner: InMemoryStatusStore,
    failing: Mutex<Option<Stage>>,
}

impl FlakyStatusStore {
    pub fn failing_at(stage: Stage) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStatusStore::new(),
            failing: Mutex::new(Some(stage)),
        })
    }
}

#[async_trait]
impl StatusStore for FlakyStatusStore {
    async fn insert_status(&self, row: FileProcessingStatus) -> StoreResult<FileProcessingStatus> {
        self.inner.insert_status(row).await
    }

    async fn upsert_status(&self, row: FileProcessingStatus) -> StoreResult<FileProcessingStatus> {
        let failing = *self.failing.lock().unwrap();
        if row.run_state == RunState::Running && failing == Some(row.current_stage) {
            return Err(StoreError::Unavailable("down".into()));
        }
        self.inner.upsert_status(row).await
    }

    async fn compare_and_set(
        &self,
        expected: StatusVersion,
        next: FileProcessingStatus,
    ) -> StoreResult<FileProcessingStatus> {
        self.inner.compare_and_set(expected, next).await
    }

    async fn get_status(&self, file_id: &str) -> StoreResult<Option<FileProcessingStatus>> {
        self.inner.get_status(file_id).await
    }

    async fn list_status(&self, limit: usize) -> StoreResult<Vec<FileProcessingStatus>> {
        self.inner.list_status(limit).await
    }
}

pub fn document(filename: &str) -> UploadedFile {
    UploadedFile::new(
        filename,
        format!(
            "LOAN APPLICATION for {}\x0cApplicant contact: jane.doe@example.com, 555-123-4567. \
             Amount requested $12,500.00",
            filename
        ),
    )
}

pub fn new_items(filenames: &[&str]) -> Vec<BatchItem> {
    filenames.iter().map(|f| BatchItem::New(document(f))).collect()
}

/// 轮询直到条件成立，最多 5 秒
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}
