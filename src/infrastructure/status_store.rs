//! 状态存储 - 基础设施层
//!
//! 每个 file_id 一行，支持 compare-and-set 更新。
//! RUNNING 唯一性在这里强制：一行处于 RUNNING 时，只有同一次尝试的写入者可以继续更新它。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::models::{FileProcessingStatus, RunState, StatusVersion};

/// 文件处理状态存储
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// 创建新记录；file_id 已存在时返回 `AlreadyExists`
    async fn insert_status(&self, row: FileProcessingStatus) -> StoreResult<FileProcessingStatus>;

    /// 按 file_id 原子地创建或更新
    ///
    /// 已有 RUNNING 行且尝试次数不同，或写入的尝试次数落后于已存储的，返回 `Conflict`。
    async fn upsert_status(&self, row: FileProcessingStatus) -> StoreResult<FileProcessingStatus>;

    /// 仅当当前版本等于 `expected` 时替换
    async fn compare_and_set(
        &self,
        expected: StatusVersion,
        next: FileProcessingStatus,
    ) -> StoreResult<FileProcessingStatus>;

    async fn get_status(&self, file_id: &str) -> StoreResult<Option<FileProcessingStatus>>;

    /// 最近更新的在前，最多 `limit` 行
    async fn list_status(&self, limit: usize) -> StoreResult<Vec<FileProcessingStatus>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusEntry {
    seq: u64,
    row: FileProcessingStatus,
}

/// 状态表的规则核心，内存存储和文件存储共用
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct StatusTable {
    rows: HashMap<String, StatusEntry>,
    next_seq: u64,
}

impl StatusTable {
    pub(crate) fn insert(
        &mut self,
        row: FileProcessingStatus,
    ) -> StoreResult<FileProcessingStatus> {
        if self.rows.contains_key(&row.file_id) {
            return Err(StoreError::AlreadyExists {
                file_id: row.file_id,
            });
        }
        Ok(self.write(row, None))
    }

    pub(crate) fn upsert(
        &mut self,
        row: FileProcessingStatus,
    ) -> StoreResult<FileProcessingStatus> {
        let created_at = match self.rows.get(&row.file_id) {
            None => None,
            Some(existing) => {
                let current = existing.row.version();
                let stale = row.attempt < current.attempt;
                let foreign_run =
                    current.run_state == RunState::Running && row.attempt != current.attempt;
                if stale || foreign_run {
                    return Err(StoreError::Conflict {
                        file_id: row.file_id,
                        expected: format!("attempt {}", row.attempt),
                        found: current,
                    });
                }
                Some(existing.row.created_at)
            }
        };
        Ok(self.write(row, created_at))
    }

    pub(crate) fn compare_and_set(
        &mut self,
        expected: StatusVersion,
        next: FileProcessingStatus,
    ) -> StoreResult<FileProcessingStatus> {
        let existing = self
            .rows
            .get(&next.file_id)
            .ok_or_else(|| StoreError::NotFound {
                file_id: next.file_id.clone(),
            })?;

        let found = existing.row.version();
        if found != expected {
            return Err(StoreError::Conflict {
                file_id: next.file_id,
                expected: expected.to_string(),
                found,
            });
        }
        let created_at = existing.row.created_at;
        Ok(self.write(next, Some(created_at)))
    }

    pub(crate) fn get(&self, file_id: &str) -> Option<FileProcessingStatus> {
        self.rows.get(file_id).map(|entry| entry.row.clone())
    }

    pub(crate) fn list(&self, limit: usize) -> Vec<FileProcessingStatus> {
        let mut entries: Vec<&StatusEntry> = self.rows.values().collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        entries
            .into_iter()
            .take(limit)
            .map(|entry| entry.row.clone())
            .collect()
    }

    fn write(
        &mut self,
        mut row: FileProcessingStatus,
        created_at: Option<chrono::DateTime<Utc>>,
    ) -> FileProcessingStatus {
        if let Some(created_at) = created_at {
            row.created_at = created_at;
        }
        row.updated_at = Utc::now();
        self.next_seq += 1;
        self.rows.insert(
            row.file_id.clone(),
            StatusEntry {
                seq: self.next_seq,
                row: row.clone(),
            },
        );
        row
    }
}

/// 内存状态存储（测试和嵌入使用）
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    table: Mutex<StatusTable>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn insert_status(&self, row: FileProcessingStatus) -> StoreResult<FileProcessingStatus> {
        self.table.lock().await.insert(row)
    }

    async fn upsert_status(&self, row: FileProcessingStatus) -> StoreResult<FileProcessingStatus> {
        self.table.lock().await.upsert(row)
    }

    async fn compare_and_set(
        &self,
        expected: StatusVersion,
        next: FileProcessingStatus,
    ) -> StoreResult<FileProcessingStatus> {
        self.table.lock().await.compare_and_set(expected, next)
    }

    async fn get_status(&self, file_id: &str) -> StoreResult<Option<FileProcessingStatus>> {
        Ok(self.table.lock().await.get(file_id))
    }

    async fn list_status(&self, limit: usize) -> StoreResult<Vec<FileProcessingStatus>> {
        Ok(self.table.lock().await.list(limit))
    }
}
