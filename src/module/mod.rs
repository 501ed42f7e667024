//! 模块系统
//!
//! 包含模块系统的核心组件：
//! - URL 模式匹配
//! - 模块配置与元数据
//! - 生命周期钩子与模块实现
//! - 子模块状态机
//! - 注册表、远程加载与安全校验

pub mod agentlet;
pub mod lifecycle;
pub mod loader;
pub mod metadata;
pub mod parser;
pub mod pattern;
pub mod registry;
pub mod security;
pub mod submodule;
pub mod surface;

// 重导出常用类型
pub use agentlet::{AgentletModule, AppContext, Module, ModuleBuilder};
pub use lifecycle::{HookScope, LifecycleHooks, NoopHooks};
pub use loader::{
    EvaluationEnv, HttpSourceFetcher, LoadOptions, LoaderStats, ManifestEvaluator, RemoteLoader,
    SourceEvaluator, SourceFetcher,
};
pub use metadata::{
    ModuleConfig, ModuleMetadata, ModuleSource, ModuleState, ModuleTimings, NavigationContext,
    NavigationTrigger, PageContext,
};
pub use parser::ModuleParser;
pub use pattern::{CustomMatcher, MatchMode, PatternMatcher};
pub use registry::{
    DuplicatePolicy, ModuleChangeCallback, ModuleRegistry, RegistryEntryInfo, RegistryStats,
};
pub use security::{SecurityGate, Violation};
pub use submodule::{SubmoduleChangeCallback, SubmoduleMachine};
pub use surface::{MemorySurface, NoopSurface, RenderSurface};
