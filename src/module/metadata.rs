//! 模块数据结构
//!
//! 定义模块配置（清单文件 / 代码构造共用）、运行状态、页面与导航上下文，
//! 以及对外暴露的模块元数据快照。

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::module::pattern::MatchMode;

/// 模块配置
///
/// 既可以从 YAML/JSON 清单解析，也可以在代码中构造。
/// `Module::export_config()` 返回的正是这个结构。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// 模块名（注册表内唯一）
    pub name: String,

    /// 模块版本（semver 格式）
    pub version: String,

    /// 模块描述
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// URL 模式列表（有序）
    #[serde(default)]
    pub patterns: Vec<String>,

    /// 匹配模式
    #[serde(default)]
    pub match_mode: MatchMode,

    /// 能力标签
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,

    /// 权限标签
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,

    /// 依赖标签
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// 模块设置（key 有序）
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub settings: Map<String, Value>,

    /// 激活时注入的样式
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub styles: Option<String>,

    /// 渲染失败时的兜底内容
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_content: Option<String>,

    /// 子模块配置（有序）
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub submodules: Vec<ModuleConfig>,
}

impl ModuleConfig {
    /// 创建最小配置
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            patterns: Vec::new(),
            match_mode: MatchMode::default(),
            capabilities: Vec::new(),
            permissions: Vec::new(),
            dependencies: Vec::new(),
            settings: Map::new(),
            styles: None,
            fallback_content: None,
            submodules: Vec::new(),
        }
    }

    /// 追加 URL 模式
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    /// 设置匹配模式
    pub fn match_mode(mut self, mode: MatchMode) -> Self {
        self.match_mode = mode;
        self
    }

    /// 设置描述
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// 设置一项配置
    pub fn setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// 追加能力标签
    pub fn capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.push(tag.into());
        self
    }

    /// 追加权限标签
    pub fn permission(mut self, tag: impl Into<String>) -> Self {
        self.permissions.push(tag.into());
        self
    }

    /// 追加依赖标签
    pub fn dependency(mut self, tag: impl Into<String>) -> Self {
        self.dependencies.push(tag.into());
        self
    }

    /// 设置样式
    pub fn styles(mut self, css: impl Into<String>) -> Self {
        self.styles = Some(css.into());
        self
    }

    /// 设置兜底内容
    pub fn fallback_content(mut self, content: impl Into<String>) -> Self {
        self.fallback_content = Some(content.into());
        self
    }

    /// 追加子模块配置
    pub fn submodule(mut self, config: ModuleConfig) -> Self {
        self.submodules.push(config);
        self
    }
}

/// 模块运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    /// 已构造/注册，尚未初始化
    #[default]
    Registered,
    /// 已初始化，处于活动状态
    Active,
    /// 已清理
    Inactive,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Registered => "registered",
            ModuleState::Active => "active",
            ModuleState::Inactive => "inactive",
        };
        f.write_str(s)
    }
}

/// 页面上下文（init / 渲染时传入）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    /// 当前 URL
    pub url: String,

    /// 宿主附带的页面数据
    #[serde(default)]
    pub data: Value,
}

impl PageContext {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// 导航触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationTrigger {
    /// 首次加载
    Initial,
    /// 宿主检测到的 URL 变化
    #[default]
    Navigation,
    /// 手动刷新
    Manual,
}

/// 导航上下文（activate 时传入）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationContext {
    /// 变化前的 URL
    pub old_url: Option<String>,
    /// 变化后的 URL
    pub new_url: String,
    /// 触发来源
    #[serde(default)]
    pub trigger: NavigationTrigger,
}

impl NavigationContext {
    pub fn new(old_url: Option<String>, new_url: impl Into<String>, trigger: NavigationTrigger) -> Self {
        Self {
            old_url,
            new_url: new_url.into(),
            trigger,
        }
    }

    /// 转换为页面上下文
    pub fn page(&self) -> PageContext {
        PageContext::new(self.new_url.clone())
    }
}

/// 模块来源
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModuleSource {
    /// 宿主内置
    #[default]
    Builtin,
    /// 本地清单文件
    Local { path: PathBuf },
    /// 远程加载
    Remote { url: String },
}

/// 模块耗时统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleTimings {
    /// 最近一次 init 耗时（微秒）
    pub init_us: Option<u64>,
    /// activate 调用次数
    pub activate_count: u64,
    /// 最近一次 activate 耗时（微秒）
    pub last_activate_us: Option<u64>,
    /// 渲染次数
    pub render_count: u64,
    /// 最近一次渲染耗时（微秒）
    pub last_render_us: Option<u64>,
}

/// 模块元数据快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleMetadata {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub patterns: Vec<String>,
    pub match_mode: MatchMode,
    pub capabilities: Vec<String>,
    pub permissions: Vec<String>,
    pub dependencies: Vec<String>,
    pub state: ModuleState,
    /// 子模块名（有序）
    pub submodules: Vec<String>,
    /// 当前活动子模块
    pub active_submodule: Option<String>,
    /// 页面分析钩子的结果
    pub page_analysis: Option<Value>,
    pub timings: ModuleTimings,
    /// 最近一次进入 Active 的时间
    pub activated_at: Option<DateTime<Utc>>,
}
