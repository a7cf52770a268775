//! 文件持久化存储 - 基础设施层
//!
//! - `FileStatusStore`：整表 JSON 快照，每次修改写临时文件再 rename
//! - `FileResultStore`：JSON lines 追加日志
//!
//! 两者在打开时重新加载，规则与内存存储完全一致。持久化失败时内存中的表保持不变。
//! 结果日志末尾被截断的一行（写入时进程退出）在打开时丢弃；中间行损坏仍然报错。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::infrastructure::result_store::{ResultStore, ResultTable};
use crate::infrastructure::status_store::{StatusStore, StatusTable};
use crate::models::{FileProcessingStatus, StageResult, StatusVersion};

const STATUS_FILE: &str = "file_processing_status.json";
const RESULTS_FILE: &str = "stage_results.jsonl";

/// 基于 JSON 快照文件的状态存储
pub struct FileStatusStore {
    path: PathBuf,
    table: Mutex<StatusTable>,
}

impl FileStatusStore {
    /// 打开（或创建）目录下的状态文件
    pub async fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        let path = dir.join(STATUS_FILE);

        let table = if fs::try_exists(&path).await? {
            let content = fs::read(&path).await?;
            serde_json::from_slice(&content)?
        } else {
            StatusTable::default()
        };

        info!("状态存储已加载: {}", path.display());
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    /// 在表的副本上执行修改，持久化成功后才替换
    async fn mutate<F>(&self, op: F) -> StoreResult<FileProcessingStatus>
    where
        F: FnOnce(&mut StatusTable) -> StoreResult<FileProcessingStatus>,
    {
        let mut guard = self.table.lock().await;
        let mut next = guard.clone();
        let row = op(&mut next)?;
        self.persist(&next).await?;
        *guard = next;
        Ok(row)
    }

    async fn persist(&self, table: &StatusTable) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(table)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        debug!("状态快照已写入: {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl StatusStore for FileStatusStore {
    async fn insert_status(&self, row: FileProcessingStatus) -> StoreResult<FileProcessingStatus> {
        self.mutate(|table| table.insert(row)).await
    }

    async fn upsert_status(&self, row: FileProcessingStatus) -> StoreResult<FileProcessingStatus> {
        self.mutate(|table| table.upsert(row)).await
    }

    async fn compare_and_set(
        &self,
        expected: StatusVersion,
        next: FileProcessingStatus,
    ) -> StoreResult<FileProcessingStatus> {
        self.mutate(|table| table.compare_and_set(expected, next)).await
    }

    async fn get_status(&self, file_id: &str) -> StoreResult<Option<FileProcessingStatus>> {
        Ok(self.table.lock().await.get(file_id))
    }

    async fn list_status(&self, limit: usize) -> StoreResult<Vec<FileProcessingStatus>> {
        Ok(self.table.lock().await.list(limit))
    }
}

/// 基于 JSON lines 的结果存储
pub struct FileResultStore {
    path: PathBuf,
    table: Mutex<ResultTable>,
}

impl FileResultStore {
    pub async fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        let path = dir.join(RESULTS_FILE);

        let mut rows = Vec::new();
        if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            let (parsed, valid_len) = parse_log(&content)?;
            if valid_len < content.len() {
                warn!(
                    "⚠️ 结果日志末尾有不完整的行，截断到 {} 字节: {}",
                    valid_len,
                    path.display()
                );
                let file = OpenOptions::new().write(true).open(&path).await?;
                file.set_len(valid_len as u64).await?;
                file.sync_data().await?;
            }
            if !content[..valid_len].is_empty() && !content[..valid_len].ends_with('\n') {
                // 最后一行完整但缺少换行，补上以免下一行接在后面
                let mut file = OpenOptions::new().append(true).open(&path).await?;
                write_line(&mut file, b"\n").await?;
            }
            rows = parsed;
        }
        let count = rows.len();
        let table = ResultTable::from_rows(rows)?;

        info!("结果存储已加载: {} ({} 行)", path.display(), count);
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }
}

#[async_trait]
impl ResultStore for FileResultStore {
    async fn append_result(&self, row: StageResult) -> StoreResult<()> {
        let mut table = self.table.lock().await;
        table.check(&row)?;

        let mut line = serde_json::to_string(&row)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let before = file.metadata().await?.len();
        if let Err(e) = write_line(&mut file, line.as_bytes()).await {
            // 写入失败时撤回这一行，磁盘与内存保持一致
            if let Err(undo) = file.set_len(before).await {
                warn!("⚠️ 无法撤回未完成的结果行 {}: {}", self.path.display(), undo);
            }
            return Err(e.into());
        }

        table.append(row)
    }

    async fn get_results(&self, file_id: &str) -> StoreResult<Vec<StageResult>> {
        Ok(self.table.lock().await.for_file(file_id))
    }
}

async fn write_line(file: &mut fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.sync_data().await
}

/// 解析结果日志，返回有效的行和有效内容的字节长度
///
/// 只有最后一行可以不完整；不完整的最后一行不计入有效长度。
fn parse_log(content: &str) -> StoreResult<(Vec<StageResult>, usize)> {
    let mut rows = Vec::new();
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        if !line.trim().is_empty() {
            match serde_json::from_str::<StageResult>(line) {
                Ok(row) => rows.push(row),
                Err(e) if content[offset + line.len()..].trim().is_empty() => {
                    debug!("丢弃不完整的最后一行: {}", e);
                    return Ok((rows, offset));
                }
                Err(e) => return Err(StoreError::from(e)),
            }
        }
        offset += line.len();
    }
    Ok((rows, offset))
}
