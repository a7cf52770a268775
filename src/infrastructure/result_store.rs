//! 结果存储 - 基础设施层
//!
//! 只追加：同一个 (file_id, stage, attempt) 只能写入一次，已有行永不修改。

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::models::{Stage, StageResult};

/// 阶段结果存储
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// 插入一行；重复键返回 `DuplicateResult`
    async fn append_result(&self, row: StageResult) -> StoreResult<()>;

    /// 某个文件的全部结果，按写入顺序
    async fn get_results(&self, file_id: &str) -> StoreResult<Vec<StageResult>>;
}

/// 结果表的规则核心
#[derive(Debug, Default, Clone)]
pub(crate) struct ResultTable {
    rows: Vec<StageResult>,
    keys: HashSet<(String, Stage, u32)>,
}

impl ResultTable {
    pub(crate) fn from_rows(rows: Vec<StageResult>) -> StoreResult<Self> {
        let mut table = Self::default();
        for row in rows {
            table.append(row)?;
        }
        Ok(table)
    }

    /// 检查是否可以追加（不修改表）
    pub(crate) fn check(&self, row: &StageResult) -> StoreResult<()> {
        if self.keys.contains(&row.key()) {
            return Err(StoreError::DuplicateResult {
                file_id: row.file_id.clone(),
                stage: row.stage,
                attempt: row.attempt,
            });
        }
        Ok(())
    }

    pub(crate) fn append(&mut self, row: StageResult) -> StoreResult<()> {
        self.check(&row)?;
        self.keys.insert(row.key());
        self.rows.push(row);
        Ok(())
    }

    pub(crate) fn for_file(&self, file_id: &str) -> Vec<StageResult> {
        self.rows
            .iter()
            .filter(|row| row.file_id == file_id)
            .cloned()
            .collect()
    }
}

/// 内存结果存储
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    table: Mutex<ResultTable>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn append_result(&self, row: StageResult) -> StoreResult<()> {
        self.table.lock().await.append(row)
    }

    async fn get_results(&self, file_id: &str) -> StoreResult<Vec<StageResult>> {
        Ok(self.table.lock().await.for_file(file_id))
    }
}
