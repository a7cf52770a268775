use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::models::Stage;

const CATEGORIZE_PROMPT_DEFAULT: &str = r#"Analyze the following financial document and categorize it according to the taxonomy below.
Provide a primary classification with confidence score and justification, and a secondary classification.

Document Content:
{document_text}

Taxonomy Categories:
{taxonomy}

Respond in JSON format with primary_category, primary_confidence, primary_justification,
secondary_category, secondary_confidence."#;

const EXTRACT_PROMPT_DEFAULT: &str = r#"Extract structured entities from the following financial document.
Entity types: person, organization, account_number, ssn_tax_id, amount, date, address, email, phone.

Document Content:
{document_text}

Respond in JSON format with {"entities": [{"type": "...", "value": "...", "confidence": 0.XX}]}"#;

const DEIDENTIFY_PROMPT_DEFAULT: &str = r#"Identify personally identifiable information (PII) and sensitive financial data
in the following document that should be redacted or masked (GLBA, CCPA).

Document Content:
{document_text}

For each PII item give type, value, strategy (REDACT|MASK|GENERALIZE) and replacement."#;

/// 程序配置
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 同时处理的文件数量
    pub max_concurrent_files: usize,
    /// 待处理文件所在目录
    pub input_folder: String,
    /// 原始文件存储卷根目录
    pub volume_path: String,
    /// 每次运行的日志目录，`None` 表示不写日志文件
    pub logs_dir: Option<String>,
    /// 状态/结果持久化目录，`None` 表示使用内存存储
    pub state_dir: Option<String>,
    /// trace 导出文件（JSON lines）
    pub traces_file: String,
    /// 状态查询最多返回的行数
    pub status_display_limit: usize,
    pub max_file_size_mb: u64,
    pub supported_file_types: Vec<String>,
    /// 测试用：强制某个阶段失败
    pub force_failure_stage: Option<String>,
    // --- 提示词配置 ---
    pub categorize_prompt: String,
    pub extract_prompt: String,
    pub deidentify_prompt: String,
    pub taxonomy: Vec<String>,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 批处理结束后是否自动重新处理失败的文件
    pub reprocess_failed: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_files: 4,
            input_folder: "input_files".to_string(),
            volume_path: "volume".to_string(),
            logs_dir: Some("logs".to_string()),
            state_dir: Some("state".to_string()),
            traces_file: "traces.jsonl".to_string(),
            status_display_limit: 100,
            max_file_size_mb: 100,
            supported_file_types: [".pdf", ".docx", ".txt", ".html", ".md"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            force_failure_stage: None,
            categorize_prompt: CATEGORIZE_PROMPT_DEFAULT.to_string(),
            extract_prompt: EXTRACT_PROMPT_DEFAULT.to_string(),
            deidentify_prompt: DEIDENTIFY_PROMPT_DEFAULT.to_string(),
            taxonomy: [
                "Loan Application",
                "Financial Statement",
                "Investment Document",
                "Credit Report",
                "Banking Statement",
                "Tax Document",
                "Insurance Policy",
                "Compliance Document",
                "Contract Agreement",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            verbose_logging: false,
            reprocess_failed: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_concurrent_files: parsed_var("MAX_CONCURRENT_FILES", default.max_concurrent_files),
            input_folder: string_var("INPUT_FOLDER", default.input_folder),
            volume_path: string_var("VOLUME_PATH", default.volume_path),
            logs_dir: optional_var("LOGS_DIR", default.logs_dir),
            state_dir: optional_var("STATE_DIR", default.state_dir),
            traces_file: string_var("TRACES_FILE", default.traces_file),
            status_display_limit: parsed_var("STATUS_DISPLAY_LIMIT", default.status_display_limit),
            max_file_size_mb: parsed_var("MAX_FILE_SIZE_MB", default.max_file_size_mb),
            supported_file_types: default.supported_file_types,
            force_failure_stage: optional_var("TEST_FORCE_FAILURE_STAGE", None),
            categorize_prompt: string_var("CATEGORIZE_PROMPT", default.categorize_prompt),
            extract_prompt: string_var("EXTRACT_PROMPT", default.extract_prompt),
            deidentify_prompt: string_var("DEIDENTIFY_PROMPT", default.deidentify_prompt),
            taxonomy: default.taxonomy,
            verbose_logging: parsed_var("VERBOSE_LOGGING", default.verbose_logging),
            reprocess_failed: parsed_var("REPROCESS_FAILED", default.reprocess_failed),
        }
    }

    /// 从 TOML 文件加载，缺失的键使用默认值
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_files == 0 {
            return Err(invalid("max_concurrent_files", "0", "至少为 1"));
        }
        if self.status_display_limit == 0 {
            return Err(invalid("status_display_limit", "0", "至少为 1"));
        }
        if self.max_file_size_mb == 0 {
            return Err(invalid("max_file_size_mb", "0", "至少为 1"));
        }
        if let Some(name) = &self.force_failure_stage {
            if Stage::from_name(name).is_none() {
                return Err(invalid(
                    "force_failure_stage",
                    name,
                    "应为 ingest / parse / categorize / extract / deidentify",
                ));
            }
        }
        for (key, prompt) in [
            ("categorize_prompt", &self.categorize_prompt),
            ("extract_prompt", &self.extract_prompt),
            ("deidentify_prompt", &self.deidentify_prompt),
        ] {
            if !prompt.contains("{document_text}") {
                return Err(invalid(key, "<prompt>", "必须包含 {document_text} 占位符"));
            }
        }
        Ok(())
    }

    /// 解析后的强制失败阶段
    pub fn forced_failure_stage(&self) -> Option<Stage> {
        self.force_failure_stage.as_deref().and_then(Stage::from_name)
    }

    /// 某个阶段使用的提示词模板（INGEST / PARSE 不使用提示词）
    pub fn prompt_for(&self, stage: Stage) -> Option<&str> {
        match stage {
            Stage::Categorize => Some(&self.categorize_prompt),
            Stage::Extract => Some(&self.extract_prompt),
            Stage::Deidentify => Some(&self.deidentify_prompt),
            Stage::Ingest | Stage::Parse => None,
        }
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

/// 空字符串表示关闭该功能
fn parsed_var<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn string_var(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn optional_var(name: &str, default: Option<String>) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => None,
        Ok(value) => Some(value),
        Err(_) => default,
    }
}

fn invalid(key: &str, value: &str, expected: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        expected: expected.to_string(),
    }
}
