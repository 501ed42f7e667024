//! 事件数据结构
//!
//! 定义事件总线上流转的事件，以及内核产生的事件名称。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::utils::generate_uuid;

/// 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// 事件唯一标识
    pub event_id: String,

    /// 事件名（如 `module:activated`）
    pub name: String,

    /// 事件数据
    #[serde(default)]
    pub data: Value,

    /// 事件时间戳
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// 创建新事件
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            event_id: generate_uuid(),
            name: name.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// 读取数据中的字符串字段
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// 内核产生的事件名
pub mod names {
    /// 模块注册成功
    pub const MODULE_REGISTERED: &str = "module:registered";
    /// 模块注册失败（含安全校验失败、拉取失败、init 失败）
    pub const MODULE_REGISTRATION_FAILED: &str = "module:registrationFailed";
    /// 模块被选为活动模块
    pub const MODULE_ACTIVATED: &str = "module:activated";
    /// 活动模块被停用
    pub const MODULE_DEACTIVATED: &str = "module:deactivated";
    /// 模块被卸载
    pub const MODULE_UNLOADED: &str = "module:unloaded";
    /// 生命周期：init 完成
    pub const LIFECYCLE_INIT: &str = "lifecycle:init";
    /// 生命周期：URL 更新
    pub const LIFECYCLE_ACTIVATE: &str = "lifecycle:activate";
    /// 生命周期：清理完成
    pub const LIFECYCLE_CLEANUP: &str = "lifecycle:cleanup";
    /// 子模块激活
    pub const SUBMODULE_ACTIVATED: &str = "submoduleActivated";
    /// 子模块停用
    pub const SUBMODULE_DEACTIVATED: &str = "submoduleDeactivated";
    /// 当前 URL 已不匹配模块
    pub const APPLICATION_LEFT: &str = "applicationLeft";
    /// 错误（数据含 phase / error）
    pub const ERROR: &str = "error";
    /// 通配订阅
    pub const WILDCARD: &str = "*";
}

/// 构造 `error` 事件数据
pub fn error_payload(module: &str, phase: &str, error: impl std::fmt::Display) -> Value {
    json!({
        "module": module,
        "phase": phase,
        "error": error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = Event::new(names::MODULE_ACTIVATED, json!({"module": "crm"}));
        assert!(!event.event_id.is_empty());
        assert_eq!(event.name, "module:activated");
        assert_eq!(event.str_field("module"), Some("crm"));
        assert_eq!(event.str_field("missing"), None);
    }

    #[test]
    fn test_error_payload() {
        let payload = error_payload("crm", "init", "boom");
        assert_eq!(payload["phase"], "init");
        assert_eq!(payload["error"], "boom");
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::new("custom", json!({"k": 1}));
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, event.name);
        assert_eq!(parsed.data, event.data);
    }
}
