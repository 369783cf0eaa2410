use std::path::PathBuf;

use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 结果缓存错误
    #[error("缓存错误: {0}")]
    Cache(#[from] CacheError),
    /// 检查点错误
    #[error("检查点错误: {0}")]
    Checkpoint(#[from] CheckpointError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// LLM 服务错误
    #[error("LLM错误: {0}")]
    Llm(#[from] LlmError),
    /// 批处理编排错误
    #[error("批处理错误: {0}")]
    Executor(#[from] ExecutorError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// 结果缓存错误
///
/// 缓存只是性能优化，这些错误在 `ContentCache` 内部记录后吞掉，
/// 只有维护操作（清理、统计）会向上返回。
#[derive(Debug, Error)]
pub enum CacheError {
    /// 创建缓存目录失败
    #[error("无法创建缓存目录 ({path}): {source}")]
    CreateDirFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    /// 读取缓存条目失败
    #[error("读取缓存条目失败 ({path}): {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    /// 写入缓存条目失败
    #[error("写入缓存条目失败 ({path}): {source}")]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    /// 缓存条目格式损坏
    #[error("缓存条目已损坏 ({path}): {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// 检查点错误
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// 获取文件锁超时（可重试）
    #[error("获取检查点文件锁超时 ({path}), 已等待 {waited_secs} 秒")]
    LockTimeout { path: PathBuf, waited_secs: u64 },
    /// 文件读写失败
    #[error("检查点文件操作失败 ({path}): {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// 序列化失败
    #[error("检查点序列化失败: {0}")]
    Serialize(#[from] serde_json::Error),
    /// 原子替换失败
    #[error("检查点原子替换失败 ({path}): {source}")]
    PersistFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    /// 多次重试后仍然无法写入
    #[error("检查点连续 {attempts} 次保存失败: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置文件读取失败
    #[error("读取配置文件失败 ({path}): {source}")]
    FileReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    /// 配置文件解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// 配置值不合法
    #[error("配置项 {field} 不合法: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// LLM 服务错误
#[derive(Debug, Error)]
pub enum LlmError {
    /// 请求构建失败
    #[error("LLM 请求构建失败 (模型: {model}): {message}")]
    RequestBuildFailed { model: String, message: String },
    /// API 调用失败
    #[error("LLM API调用失败 (模型: {model}): {message}")]
    ApiCallFailed { model: String, message: String },
    /// 返回内容为空
    #[error("LLM返回内容为空 (模型: {model})")]
    EmptyContent { model: String },
    /// 提示词模板引用了不存在的字段
    #[error("提示词模板引用了条目 {index} 中不存在的字段: {field}")]
    MissingField { index: usize, field: String },
}

/// 批处理编排错误
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// 选项不合法
    #[error("批处理选项 {option} 不合法: {reason}")]
    InvalidOptions { option: String, reason: String },
    /// 条目索引与位置不一致
    #[error("条目索引不连续: 位置 {position} 的条目索引为 {index}")]
    IndexMismatch { position: usize, index: usize },
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建选项不合法错误
    pub fn invalid_options(option: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Executor(ExecutorError::InvalidOptions {
            option: option.into(),
            reason: reason.into(),
        })
    }

    /// 创建配置值不合法错误
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Config(ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        })
    }

    /// 创建 LLM API 调用错误
    pub fn llm_api_failed(model: impl Into<String>, source: impl std::fmt::Display) -> Self {
        AppError::Llm(LlmError::ApiCallFailed {
            model: model.into(),
            message: source.to_string(),
        })
    }
}

impl CheckpointError {
    /// 是否为获取文件锁超时
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, CheckpointError::LockTimeout { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Io {
            path: path.into(),
            source,
        }
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
