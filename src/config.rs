//! 配置模块
//!
//! 读取优先级（后者覆盖前者）：
//! 1. 默认值
//! 2. 配置文件 `~/.config/app-blast/config.json`
//! 3. 环境变量 `APP_BLAST_PROJECT_KEY` / `APP_BLAST_API_BASE`

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::BlastError;

/// 服务默认地址
pub const DEFAULT_API_BASE: &str = "http://api.pushpanel.io/v1";

/// 默认传输超时（秒）
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// 轮询器首次检查前的延迟（毫秒）
pub const DEFAULT_POLL_INITIAL_DELAY_MS: u64 = 2000;

/// 轮询器检查间隔（毫秒）
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogLevel {
    /// 关闭所有日志
    Off,
    /// 只输出错误
    Error,
    /// 输出所有日志
    #[default]
    All,
}

impl LogLevel {
    /// 对应的 tracing EnvFilter 指令
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "app_blast=error,blast=error",
            LogLevel::All => "app_blast=info,blast=info",
        }
    }
}

/// 运行配置
#[derive(Debug, Clone)]
pub struct BlastSettings {
    /// 项目 key，所有请求都要带上
    pub project_key: String,
    /// API 基础 URL（不带末尾 `/`）
    pub api_base: String,
    /// 传输超时（秒），协调器自身不再做超时管理
    pub timeout_secs: u64,
    /// 轮询器首次检查延迟
    pub poll_initial_delay: Duration,
    /// 轮询器检查间隔
    pub poll_interval: Duration,
    /// 本地数据目录（存放 user id）
    pub data_dir: PathBuf,
}

impl Default for BlastSettings {
    fn default() -> Self {
        Self {
            project_key: String::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            poll_initial_delay: Duration::from_millis(DEFAULT_POLL_INITIAL_DELAY_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            data_dir: default_data_dir(),
        }
    }
}

/// 配置文件格式，所有字段可选
#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    project_key: Option<String>,
    api_base: Option<String>,
    timeout_secs: Option<u64>,
    poll_initial_delay_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
}

/// `~/.config/app-blast`
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("app-blast")
}

impl BlastSettings {
    /// 用给定项目 key 创建，其余取默认值
    pub fn new(project_key: impl Into<String>) -> Self {
        Self {
            project_key: project_key.into(),
            ..Default::default()
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_timing(mut self, initial_delay: Duration, interval: Duration) -> Self {
        self.poll_initial_delay = initial_delay;
        self.poll_interval = interval;
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// 从配置文件和环境变量自动加载
    pub fn auto_load() -> Result<Self> {
        let path = default_data_dir().join("config.json");
        let mut settings = Self::load_from(&path)?;

        if let Ok(key) = std::env::var("APP_BLAST_PROJECT_KEY") {
            if !key.is_empty() {
                debug!("Using APP_BLAST_PROJECT_KEY from environment");
                settings.project_key = key;
            }
        }
        if let Ok(base) = std::env::var("APP_BLAST_API_BASE") {
            if !base.is_empty() {
                debug!(api_base = %base, "Using APP_BLAST_API_BASE from environment");
                settings.api_base = base.trim_end_matches('/').to_string();
            }
        }

        Ok(settings)
    }

    /// 从指定配置文件加载；文件不存在时返回默认值
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut settings = Self::default();
        if !path.exists() {
            return Ok(settings);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file: SettingsFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        if let Some(key) = file.project_key {
            settings.project_key = key;
        }
        if let Some(base) = file.api_base {
            settings.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(secs) = file.timeout_secs {
            settings.timeout_secs = secs;
        }
        if let Some(ms) = file.poll_initial_delay_ms {
            settings.poll_initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = file.poll_interval_ms {
            settings.poll_interval = Duration::from_millis(ms);
        }

        debug!(path = %path.display(), "Loaded settings file");
        Ok(settings)
    }

    /// 校验必填项
    pub fn validate(&self) -> Result<(), BlastError> {
        if self.project_key.trim().is_empty() {
            return Err(BlastError::InvalidSettings(
                "project_key must not be empty".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(BlastError::InvalidSettings(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn mark_url(&self) -> String {
        format!("{}/notification/mark", self.api_base)
    }

    pub fn user_set_url(&self) -> String {
        format!("{}/user/set", self.api_base)
    }

    pub fn user_unset_url(&self) -> String {
        format!("{}/user/device/del", self.api_base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_settings_default() {
        let settings = BlastSettings::default();
        assert_eq!(settings.api_base, DEFAULT_API_BASE);
        assert_eq!(settings.timeout_secs, 30);
        assert_eq!(settings.poll_initial_delay, Duration::from_millis(2000));
        assert_eq!(settings.poll_interval, Duration::from_millis(5000));
        assert!(settings.data_dir.ends_with("app-blast"));
    }

    #[test]
    fn test_log_level_directive() {
        assert_eq!(LogLevel::default(), LogLevel::All);
        assert_eq!(LogLevel::Off.directive(), "off");
        assert!(LogLevel::Error.directive().contains("app_blast=error"));
    }

    #[test]
    fn test_validate_rejects_empty_project_key() {
        let err = BlastSettings::default().validate().unwrap_err();
        assert!(err.to_string().contains("project_key"));
        assert!(BlastSettings::new("proj").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let settings =
            BlastSettings::new("proj").with_poll_timing(Duration::ZERO, Duration::ZERO);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_urls() {
        let settings = BlastSettings::new("proj").with_api_base("http://localhost:1234/v1/");
        assert_eq!(settings.api_base, "http://localhost:1234/v1");
        assert_eq!(settings.mark_url(), "http://localhost:1234/v1/notification/mark");
        assert_eq!(settings.user_set_url(), "http://localhost:1234/v1/user/set");
        assert_eq!(settings.user_unset_url(), "http://localhost:1234/v1/user/device/del");
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"project_key": "abc", "api_base": "http://h/v1/", "poll_interval_ms": 100}"#,
        )
        .unwrap();

        let settings = BlastSettings::load_from(&path).unwrap();
        assert_eq!(settings.project_key, "abc");
        assert_eq!(settings.api_base, "http://h/v1");
        assert_eq!(settings.poll_interval, Duration::from_millis(100));
        assert_eq!(settings.poll_initial_delay, Duration::from_millis(2000));
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = TempDir::new().unwrap();
        let settings = BlastSettings::load_from(&dir.path().join("nope.json")).unwrap();
        assert!(settings.project_key.is_empty());
    }
}
