//! Agentlet 内核错误类型定义
//!
//! 本模块定义了内核中使用的所有错误类型。

use thiserror::Error;

/// Agentlet 内核核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    // ==================== 模块配置错误 ====================

    /// 模块配置校验失败（构造期致命错误，模块不会被创建）
    #[error("模块配置无效: {}", .errors.join("; "))]
    ConfigValidation {
        /// 所有校验失败项
        errors: Vec<String>,
    },

    // ==================== 生命周期错误 ====================

    /// 生命周期钩子执行失败
    #[error("模块 '{module}' 的 {phase} 阶段失败: {reason}")]
    LifecycleHook {
        /// 模块名
        module: String,
        /// 失败阶段（init / activate / ...）
        phase: String,
        /// 失败原因
        reason: String,
    },

    // ==================== 注册表错误 ====================

    /// 模块名已被注册
    #[error("模块已注册: '{0}'")]
    ModuleAlreadyRegistered(String),

    /// 模块未找到
    #[error("模块未找到: '{0}'")]
    ModuleNotFound(String),

    // ==================== 远程加载错误 ====================

    /// 远程源码未通过安全校验
    #[error("源码安全校验失败 ({origin}): {}", .violations.join(", "))]
    SecurityValidation {
        /// 源码来源
        origin: String,
        /// 命中的危险结构
        violations: Vec<String>,
    },

    /// 远程源码拉取失败
    #[error("远程模块拉取失败: '{url}' - {reason}")]
    Fetch {
        /// 请求地址
        url: String,
        /// 失败原因
        reason: String,
    },

    /// 源码求值失败
    #[error("模块源码求值失败 ({origin}): {reason}")]
    Evaluation {
        /// 源码来源
        origin: String,
        /// 失败原因
        reason: String,
    },

    // ==================== 事件系统错误 ====================

    /// request 调用时没有任何响应者
    #[error("事件 '{0}' 没有响应者")]
    NoResponder(String),

    /// 订阅未找到
    #[error("订阅未找到: '{0}'")]
    SubscriptionNotFound(String),

    /// 订阅者处理失败
    #[error("订阅者处理失败: {0}")]
    HandlerFailed(String),

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        /// 配置项
        key: String,
        /// 原因
        reason: String,
    },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // ==================== 通用错误 ====================

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 内核操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 错误码常量
pub mod error_code {
    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_VALIDATION: &str = "CONFIG-001";
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-002";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-003";

    // 生命周期错误 (LIFECYCLE-xxx)
    pub const LIFECYCLE_HOOK_FAILED: &str = "LIFECYCLE-001";

    // 注册表错误 (REGISTRY-xxx)
    pub const REGISTRY_DUPLICATE: &str = "REGISTRY-001";
    pub const REGISTRY_NOT_FOUND: &str = "REGISTRY-002";

    // 远程加载错误 (LOADER-xxx)
    pub const LOADER_SECURITY: &str = "LOADER-001";
    pub const LOADER_FETCH: &str = "LOADER-002";
    pub const LOADER_EVALUATION: &str = "LOADER-003";

    // 事件错误 (EVENT-xxx)
    pub const EVENT_NO_RESPONDER: &str = "EVENT-001";
    pub const EVENT_SUBSCRIPTION_NOT_FOUND: &str = "EVENT-002";
    pub const EVENT_HANDLER_FAILED: &str = "EVENT-003";

    // 通用错误
    pub const INTERNAL: &str = "CORE-001";
}

impl CoreError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::ConfigValidation { .. } => error_code::CONFIG_VALIDATION,
            CoreError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            CoreError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            CoreError::LifecycleHook { .. } => error_code::LIFECYCLE_HOOK_FAILED,
            CoreError::ModuleAlreadyRegistered(_) => error_code::REGISTRY_DUPLICATE,
            CoreError::ModuleNotFound(_) => error_code::REGISTRY_NOT_FOUND,
            CoreError::SecurityValidation { .. } => error_code::LOADER_SECURITY,
            CoreError::Fetch { .. } => error_code::LOADER_FETCH,
            CoreError::Evaluation { .. } => error_code::LOADER_EVALUATION,
            CoreError::NoResponder(_) => error_code::EVENT_NO_RESPONDER,
            CoreError::SubscriptionNotFound(_) => error_code::EVENT_SUBSCRIPTION_NOT_FOUND,
            CoreError::HandlerFailed(_) => error_code::EVENT_HANDLER_FAILED,
            _ => error_code::INTERNAL,
        }
    }

    /// 构造生命周期钩子错误
    pub fn hook(module: &str, phase: &str, reason: impl ToString) -> Self {
        CoreError::LifecycleHook {
            module: module.to_string(),
            phase: phase.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::ModuleNotFound("dashboard".to_string());
        assert!(err.to_string().contains("dashboard"));
    }

    #[test]
    fn test_config_validation_display_joins_errors() {
        let err = CoreError::ConfigValidation {
            errors: vec!["名称不能为空".to_string(), "版本号无效".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("名称不能为空"));
        assert!(text.contains("版本号无效"));
    }

    #[test]
    fn test_error_code() {
        let err = CoreError::hook("crm", "init", "boom");
        assert_eq!(err.error_code(), error_code::LIFECYCLE_HOOK_FAILED);

        let err = CoreError::NoResponder("ui:ask".to_string());
        assert_eq!(err.error_code(), error_code::EVENT_NO_RESPONDER);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let core_err: CoreError = io_err.into();
        assert!(matches!(core_err, CoreError::Io(_)));
    }
}
