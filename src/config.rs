use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AppError, AppResult, ConfigError};

/// 程序配置文件
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 同时分析的条目数量
    pub max_workers: usize,
    /// 单个条目的超时时间（秒）
    pub task_timeout_secs: u64,
    /// 每完成多少个条目保存一次检查点
    pub checkpoint_interval: usize,
    /// 是否启用结果缓存
    pub enable_cache: bool,
    /// 缓存有效期（天）
    pub cache_ttl_days: u64,
    /// 缓存目录
    pub cache_dir: PathBuf,
    /// 是否启用检查点
    pub enable_checkpoints: bool,
    /// 写检查点时等待文件锁的时间（秒）
    pub checkpoint_write_lock_timeout_secs: u64,
    /// 读检查点时等待文件锁的时间（秒）
    pub checkpoint_read_lock_timeout_secs: u64,
    /// 检查点保存的最大尝试次数
    pub checkpoint_max_attempts: u32,
    /// 任务类型标签，参与缓存键计算
    pub task_type: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    pub llm_temperature: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 3,
            task_timeout_secs: 600,
            checkpoint_interval: 5,
            enable_cache: true,
            cache_ttl_days: 30,
            cache_dir: default_cache_dir(),
            enable_checkpoints: true,
            checkpoint_write_lock_timeout_secs: 30,
            checkpoint_read_lock_timeout_secs: 10,
            checkpoint_max_attempts: 3,
            task_type: "abstract_screening".to_string(),
            verbose_logging: false,
            output_log_file: "litscreen.log".to_string(),
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
            llm_temperature: 0.3,
        }
    }
}

impl Config {
    /// 从环境变量读取配置，未设置的项使用默认值
    pub fn from_env() -> AppResult<Self> {
        Self::default().with_env_overrides()
    }

    /// 从 TOML 文件读取配置
    pub fn from_toml_file(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::TomlParseFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    /// 按 "默认值 → 配置文件 → 环境变量" 的顺序加载配置并校验
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let base = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        let config = base.with_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// 用环境变量覆盖当前配置
    pub fn with_env_overrides(mut self) -> AppResult<Self> {
        override_parsed(&mut self.max_workers, "MAX_WORKERS")?;
        override_parsed(&mut self.task_timeout_secs, "TASK_TIMEOUT_SECONDS")?;
        override_parsed(&mut self.checkpoint_interval, "CHECKPOINT_INTERVAL")?;
        override_parsed(&mut self.enable_cache, "ENABLE_CACHE")?;
        override_parsed(&mut self.cache_ttl_days, "CACHE_TTL_DAYS")?;
        override_parsed(&mut self.enable_checkpoints, "ENABLE_PROGRESS_CHECKPOINTS")?;
        override_parsed(&mut self.checkpoint_max_attempts, "CHECKPOINT_MAX_ATTEMPTS")?;
        override_parsed(&mut self.verbose_logging, "VERBOSE_LOGGING")?;
        override_parsed(&mut self.llm_temperature, "LLM_TEMPERATURE")?;
        if let Ok(dir) = std::env::var("CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        self.task_type = std::env::var("TASK_TYPE").unwrap_or(self.task_type);
        self.output_log_file = std::env::var("OUTPUT_LOG_FILE").unwrap_or(self.output_log_file);
        self.llm_api_key = std::env::var("LLM_API_KEY").unwrap_or(self.llm_api_key);
        self.llm_api_base_url = std::env::var("LLM_API_BASE_URL").unwrap_or(self.llm_api_base_url);
        self.llm_model_name = std::env::var("LLM_MODEL_NAME").unwrap_or(self.llm_model_name);
        Ok(self)
    }

    /// 校验配置
    pub fn validate(&self) -> AppResult<()> {
        if self.max_workers == 0 {
            return Err(AppError::invalid_config("max_workers", "必须至少为 1"));
        }
        if self.checkpoint_interval == 0 {
            return Err(AppError::invalid_config("checkpoint_interval", "必须至少为 1"));
        }
        if self.task_timeout_secs == 0 {
            return Err(AppError::invalid_config("task_timeout_secs", "必须大于 0"));
        }
        if self.checkpoint_max_attempts == 0 {
            return Err(AppError::invalid_config("checkpoint_max_attempts", "必须至少为 1"));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_days.saturating_mul(24 * 60 * 60))
    }

    pub fn checkpoint_write_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.checkpoint_write_lock_timeout_secs)
    }

    pub fn checkpoint_read_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.checkpoint_read_lock_timeout_secs)
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".litrx")
        .join("cache")
}

fn override_parsed<T: FromStr>(target: &mut T, var_name: &str) -> AppResult<()> {
    if let Ok(value) = std::env::var(var_name) {
        *target = value.trim().parse().map_err(|_| ConfigError::EnvVarParseFailed {
            var_name: var_name.to_string(),
            value: value.clone(),
            expected_type: std::any::type_name::<T>().to_string(),
        })?;
    }
    Ok(())
}
