//! # Agentlet Core - Agentlet 运行时内核
//!
//! Agentlet 是按页面 URL 激活的小型页面助手。内核负责：
//!
//! - **模式匹配**: 按 includes / regex / exact / custom 规则判断 URL 归属
//! - **生命周期编排**: init / activate / cleanup / render 钩子的调用与错误隔离
//! - **子模块互斥激活**: 每个模块最多一个活动子模块，随 URL 变化重新选举
//! - **模块注册表**: 按注册顺序选举活动模块，支持远程加载与安全校验
//! - **事件总线**: 同步发布/订阅与单响应者请求
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use agentlet_core::{AgentletCore, CoreConfig, ModuleConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut core = AgentletCore::new(CoreConfig::default()).await?;
//!     core.start().await?;
//!
//!     let module = core
//!         .module_builder(ModuleConfig::new("dashboard", "1.0.0").pattern("/dashboard"))
//!         .build()?;
//!     core.register_module(module).await?;
//!     core.navigate("https://app.example.com/dashboard").await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `event` - 事件与事件总线
//! - `module` - 模式匹配、模块、子模块、注册表、远程加载
//! - `utils` - 错误类型、ID、日志、指标
//! - `core` - 内核配置
//! - `api` - 公共 API 接口

#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod core;
pub mod event;
pub mod module;
pub mod utils;

// 重导出常用类型，方便使用
pub use event::{names as event_names, Event, EventBus};

pub use module::{
    AgentletModule, AppContext, DuplicatePolicy, HookScope, LifecycleHooks, LoadOptions,
    MatchMode, Module, ModuleConfig, ModuleMetadata, ModuleRegistry, ModuleSource, ModuleState,
    NavigationContext, NavigationTrigger, PageContext, RenderSurface,
};

pub use utils::logger::{LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
pub use utils::{error_code, generate_id, generate_uuid, CoreError, Result};

pub use api::sdk::{AgentletCore, CoreState};
pub use core::config::{CoreConfig, CoreConfigBuilder, LoaderConfig, LogConfig, RegistryConfig};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
