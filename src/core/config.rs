//! 内核配置
//!
//! 定义内核的配置结构和加载逻辑。配置文件支持 YAML 与 JSON：
//!
//! ```yaml
//! logging:
//!   level: debug
//! registry:
//!   duplicate_policy: replace
//!   generation_guard: true
//! loader:
//!   cache_capacity: 64
//! manifest_dirs:
//!   - ./agentlets
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::module::registry::DuplicatePolicy;
use crate::utils::{CoreError, Result};

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略（never / hourly / daily）
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
        }
    }
}

/// 注册表配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// 重名注册策略
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    /// 是否丢弃已被新导航取代的 init 结果
    #[serde(default)]
    pub generation_guard: bool,
}

/// 远程加载配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// 源码缓存容量
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// HTTP 超时（秒），不设置则不限制
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// HTTP User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_cache_capacity() -> usize {
    32
}

fn default_user_agent() -> String {
    format!("agentlet-core/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            timeout_secs: None,
            user_agent: default_user_agent(),
        }
    }
}

/// 内核配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,

    /// 注册表配置
    #[serde(default)]
    pub registry: RegistryConfig,

    /// 远程加载配置
    #[serde(default)]
    pub loader: LoaderConfig,

    /// 启动时扫描的本地清单目录
    #[serde(default)]
    pub manifest_dirs: Vec<PathBuf>,

    /// 是否为开发模式
    #[serde(default)]
    pub dev_mode: bool,
}

impl CoreConfig {
    /// 创建配置构建器
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::new()
    }

    /// 从文件加载配置
    ///
    /// `.json` 后缀按 JSON 解析，其余按 YAML 解析。加载后会执行 [`CoreConfig::validate`]。
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            CoreError::ConfigLoadFailed(format!("无法读取配置文件 {:?}: {}", path, e))
        })?;

        let mut config: CoreConfig = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.validate()?;
        config.config_path = Some(path);
        Ok(config)
    }

    /// 校验配置值
    pub fn validate(&self) -> Result<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(CoreError::InvalidConfigValue {
                key: "logging.level".to_string(),
                reason: format!("未知的日志级别 '{}'", self.logging.level),
            });
        }

        if !matches!(
            self.logging.rotation.to_ascii_lowercase().as_str(),
            "never" | "hourly" | "daily"
        ) {
            return Err(CoreError::InvalidConfigValue {
                key: "logging.rotation".to_string(),
                reason: format!("未知的轮转策略 '{}'", self.logging.rotation),
            });
        }

        if self.logging.file_output && self.logging.log_dir.is_none() {
            return Err(CoreError::InvalidConfigValue {
                key: "logging.log_dir".to_string(),
                reason: "启用文件日志时必须指定目录".to_string(),
            });
        }

        if self.loader.cache_capacity == 0 {
            return Err(CoreError::InvalidConfigValue {
                key: "loader.cache_capacity".to_string(),
                reason: "缓存容量必须大于 0".to_string(),
            });
        }

        Ok(())
    }

    /// 合并另一个配置（用于覆盖）
    pub fn merge(&mut self, other: CoreConfig) {
        // 只覆盖非默认值的配置
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
        if other.logging.rotation != default_rotation() {
            self.logging.rotation = other.logging.rotation;
        }
        if other.registry.duplicate_policy != DuplicatePolicy::default() {
            self.registry.duplicate_policy = other.registry.duplicate_policy;
        }
        if other.registry.generation_guard {
            self.registry.generation_guard = true;
        }
        if other.loader.cache_capacity != default_cache_capacity() {
            self.loader.cache_capacity = other.loader.cache_capacity;
        }
        if other.loader.timeout_secs.is_some() {
            self.loader.timeout_secs = other.loader.timeout_secs;
        }
        if other.loader.user_agent != default_user_agent() {
            self.loader.user_agent = other.loader.user_agent;
        }
        self.manifest_dirs.extend(other.manifest_dirs);
        if other.dev_mode {
            self.dev_mode = true;
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 启用 JSON 格式日志
    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    /// 设置重名注册策略
    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.config.registry.duplicate_policy = policy;
        self
    }

    /// 启用导航代数保护
    pub fn generation_guard(mut self, enabled: bool) -> Self {
        self.config.registry.generation_guard = enabled;
        self
    }

    /// 设置源码缓存容量
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.loader.cache_capacity = capacity;
        self
    }

    /// 设置 HTTP 超时
    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.loader.timeout_secs = Some(secs);
        self
    }

    /// 添加清单目录
    pub fn manifest_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.manifest_dirs.push(dir.into());
        self
    }

    /// 启用开发模式
    pub fn dev_mode(mut self) -> Self {
        self.config.dev_mode = true;
        self
    }

    /// 构建配置
    pub fn build(self) -> CoreConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert!(!config.dev_mode);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.registry.duplicate_policy, DuplicatePolicy::Reject);
        assert!(!config.registry.generation_guard);
        assert_eq!(config.loader.cache_capacity, 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = CoreConfig::builder()
            .log_level("debug")
            .duplicate_policy(DuplicatePolicy::Replace)
            .generation_guard(true)
            .manifest_dir("./agentlets")
            .dev_mode()
            .build();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.registry.duplicate_policy, DuplicatePolicy::Replace);
        assert!(config.registry.generation_guard);
        assert_eq!(config.manifest_dirs.len(), 1);
        assert!(config.dev_mode);
    }

    #[test]
    fn test_config_merge() {
        let mut base = CoreConfig::builder().manifest_dir("a").build();
        let override_config = CoreConfig::builder()
            .log_level("debug")
            .generation_guard(true)
            .cache_capacity(8)
            .manifest_dir("b")
            .build();

        base.merge(override_config);

        assert_eq!(base.logging.level, "debug");
        assert!(base.registry.generation_guard);
        assert_eq!(base.loader.cache_capacity, 8);
        assert_eq!(base.manifest_dirs, vec![PathBuf::from("a"), PathBuf::from("b")]);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = CoreConfig::builder().log_level("loud").build();
        assert!(matches!(
            config.validate(),
            Err(CoreError::InvalidConfigValue { ref key, .. }) if key == "logging.level"
        ));

        let config = CoreConfig::builder().cache_capacity(0).build();
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.logging.file_output = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserialization() {
        let yaml = "registry:\n  duplicate_policy: replace\nloader:\n  timeout_secs: 5\n";
        let config: CoreConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.registry.duplicate_policy, DuplicatePolicy::Replace);
        assert_eq!(config.loader.timeout_secs, Some(5));
        assert_eq!(config.loader.cache_capacity, 32);
        assert_eq!(config.logging.level, "info");
    }
}
