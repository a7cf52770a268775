use crate::models::upload::UploadedFile;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 读取单个文件为 UploadedFile
pub async fn load_upload(path: &Path) -> Result<UploadedFile> {
    let content = fs::read(path)
        .await
        .with_context(|| format!("无法读取文件: {}", path.display()))?;

    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .with_context(|| format!("无效的文件路径: {}", path.display()))?;

    Ok(UploadedFile::new(filename, content))
}

/// 从文件夹中加载所有支持类型的文件，按文件名排序以保证提交顺序稳定
pub async fn load_all_uploads(
    folder_path: &str,
    supported_types: &[String],
) -> Result<Vec<UploadedFile>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut paths = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| format!(".{}", ext.to_lowercase()));
        match ext {
            Some(ext) if supported_types.iter().any(|t| t.eq_ignore_ascii_case(&ext)) => {
                paths.push(path)
            }
            _ => tracing::debug!("跳过不支持的文件: {}", path.display()),
        }
    }

    paths.sort();

    let mut uploads = Vec::with_capacity(paths.len());
    for path in paths {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );
        match load_upload(&path).await {
            Ok(upload) => uploads.push(upload),
            Err(e) => tracing::warn!("加载文件失败 {}: {}", path.display(), e),
        }
    }

    Ok(uploads)
}
