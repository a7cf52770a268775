/// 待处理的上传文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// 原始文件名
    pub filename: String,
    /// 文件内容（不会写入 trace）
    pub content: Vec<u8>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.content.len() as u64
    }

    /// 小写扩展名（含点），例如 `.pdf`
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.filename)
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| format!(".{}", ext.to_lowercase()))
    }
}
