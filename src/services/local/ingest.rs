//! 本地 INGEST：把上传内容写入存储卷

use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::models::{IngestPayload, Stage, StageOutput, StagePayload};
use crate::services::stage_adapter::{StageAdapter, StageFailure, StageInput};

static RE_UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\-]").expect("valid filename regex"));

/// 文件名规范化：空格换成下划线，主名中非字母数字/下划线/连字符的字符换成下划线，保留扩展名
pub fn sanitize_filename(filename: &str) -> String {
    let filename = filename.replace(' ', "_");
    let (name, ext) = match filename.rfind('.') {
        Some(idx) if idx > 0 => filename.split_at(idx),
        _ => (filename.as_str(), ""),
    };
    format!("{}{}", RE_UNSAFE_CHARS.replace_all(name, "_"), ext)
}

/// 写入本地目录的 INGEST 适配器
#[derive(Debug, Clone)]
pub struct LocalIngestAdapter {
    volume_root: PathBuf,
}

impl LocalIngestAdapter {
    pub fn new(volume_root: impl Into<PathBuf>) -> Self {
        Self {
            volume_root: volume_root.into(),
        }
    }
}

#[async_trait]
impl StageAdapter for LocalIngestAdapter {
    fn stage(&self) -> Stage {
        Stage::Ingest
    }

    async fn run(&self, input: &StageInput<'_>) -> Result<StageOutput, StageFailure> {
        let content = input
            .content
            .ok_or_else(|| StageFailure::new(Stage::Ingest, "缺少上传文件内容"))?;

        let file_hash = format!("{:x}", Sha256::digest(content));
        let safe_filename = sanitize_filename(input.filename);
        debug!("文件名规范化: {} -> {}", input.filename, safe_filename);

        // 每个文件一个子目录，同名文件互不覆盖
        let dir = self.volume_root.join(input.file_id);
        let target = dir.join(&safe_filename);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StageFailure::new(Stage::Ingest, format!("创建目录失败: {}", e)))?;
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| StageFailure::new(Stage::Ingest, format!("写入存储卷失败: {}", e)))?;

        info!("[文件 {}] 已写入存储卷: {}", input.file_id, target.display());

        Ok(StageOutput::new(StagePayload::Ingest(IngestPayload {
            original_filename: input.filename.to_string(),
            safe_filename,
            volume_path: target.display().to_string(),
            size_bytes: content.len() as u64,
            file_hash_sha256: file_hash,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("loan app (v2).pdf"), "loan_app__v2_.pdf");
        assert_eq!(sanitize_filename("report-2024.final.txt"), "report-2024_final.txt");
        assert_eq!(sanitize_filename(".env"), "_env");
    }

    #[tokio::test]
    async fn test_ingest_writes_file_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = LocalIngestAdapter::new(dir.path());
        let prior = BTreeMap::new();
        let input = StageInput {
            file_id: "f1",
            filename: "my doc.txt",
            content: Some(b"abc".as_slice()),
            prior: &prior,
            prompt_template: None,
            taxonomy: &[],
        };

        let output = adapter.run(&input).await.unwrap();
        let StagePayload::Ingest(payload) = output.payload else {
            panic!("unexpected payload");
        };
        assert_eq!(payload.safe_filename, "my_doc.txt");
        assert_eq!(payload.size_bytes, 3);
        assert_eq!(
            payload.file_hash_sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let stored = tokio::fs::read(&payload.volume_path).await.unwrap();
        assert_eq!(stored, b"abc");
    }

    #[tokio::test]
    async fn test_ingest_without_content_fails() {
        let adapter = LocalIngestAdapter::new("unused");
        let prior = BTreeMap::new();
        let input = StageInput {
            file_id: "f1",
            filename: "a.txt",
            content: None,
            prior: &prior,
            prompt_template: None,
            taxonomy: &[],
        };
        let err = adapter.run(&input).await.unwrap_err();
        assert_eq!(err.stage, Stage::Ingest);
    }
}
