//! Agentlet 模块
//!
//! [`AgentletModule`] 是注册表看到的唯一接口；[`Module`] 是其标准实现：
//! 模式匹配器 + 生命周期钩子 + 设置 + 子模块状态机。
//!
//! # 使用示例
//!
//! ```no_run
//! use std::sync::Arc;
//! use agentlet_core::event::EventBus;
//! use agentlet_core::module::{AgentletModule, AppContext, Module, ModuleConfig};
//!
//! # fn main() -> agentlet_core::utils::Result<()> {
//! let module = Module::builder(ModuleConfig::new("crm", "1.0.0").pattern("/crm"))
//!     .context(AppContext::new(Arc::new(EventBus::new())))
//!     .build()?;
//!
//! assert!(module.check_pattern("https://app.example.com/crm/contacts"));
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::event::{error_payload, names, EventBus};
use crate::module::lifecycle::{run_hook, HookScope, LifecycleHooks, NoopHooks};
use crate::module::metadata::{
    ModuleConfig, ModuleMetadata, ModuleState, ModuleTimings, NavigationContext, NavigationTrigger,
    PageContext,
};
use crate::module::parser::ModuleParser;
use crate::module::pattern::{CustomMatcher, MatchMode, PatternMatcher};
use crate::module::submodule::{SubmoduleChangeCallback, SubmoduleMachine};
use crate::module::surface::{NoopSurface, RenderSurface};
use crate::utils::{CoreError, Result};

/// 模块能力接口
///
/// 注册表和子模块状态机只通过这个接口操作模块。
#[async_trait]
pub trait AgentletModule: Send + Sync {
    /// 模块名（注册表内唯一）
    fn name(&self) -> &str;

    /// 模块版本
    fn version(&self) -> &str;

    /// URL 模式
    fn patterns(&self) -> &[String];

    /// 匹配模式
    fn match_mode(&self) -> MatchMode;

    /// URL 是否属于该模块
    fn check_pattern(&self, url: &str) -> bool;

    /// 是否处于活动状态
    fn is_active(&self) -> bool;

    /// 初始化：`Registered/Inactive -> Active`
    async fn init(&self, page: &PageContext) -> Result<()>;

    /// URL 变化时刷新（不改变活动状态）
    async fn activate(&self, ctx: &NavigationContext) -> Result<()>;

    /// 清理：`Active -> Inactive`，幂等，不返回错误
    async fn cleanup(&self);

    /// 生成内容，失败时返回兜底内容
    async fn get_content(&self, page: &PageContext) -> String;

    /// 元数据快照
    fn metadata(&self) -> ModuleMetadata;
}

/// 模块运行所需的外部协作者
#[derive(Clone)]
pub struct AppContext {
    pub event_bus: Arc<EventBus>,
    pub surface: Arc<dyn RenderSurface>,
}

impl AppContext {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            event_bus,
            surface: Arc::new(NoopSurface),
        }
    }

    pub fn with_surface(mut self, surface: Arc<dyn RenderSurface>) -> Self {
        self.surface = surface;
        self
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new(Arc::new(EventBus::new()))
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("event_bus", &self.event_bus)
            .finish_non_exhaustive()
    }
}

/// 模块运行时状态
#[derive(Debug, Default)]
struct RuntimeState {
    state: ModuleState,
    page_analysis: Option<Value>,
    activated_at: Option<DateTime<Utc>>,
    styles_injected: bool,
}

/// 标准模块实现
pub struct Module {
    config: ModuleConfig,
    matcher: PatternMatcher,
    hooks: Arc<dyn LifecycleHooks>,
    scope: HookScope,
    context: AppContext,
    children: Vec<Arc<Module>>,
    submodules: SubmoduleMachine,
    runtime: RwLock<RuntimeState>,
    timings: Mutex<ModuleTimings>,
}

impl Module {
    /// 创建构建器
    pub fn builder(config: ModuleConfig) -> ModuleBuilder {
        ModuleBuilder::new(config)
    }

    /// 读取一项设置
    pub fn setting(&self, key: &str) -> Option<Value> {
        self.scope.setting(key)
    }

    /// 合并设置
    pub fn update_settings(&self, updates: Map<String, Value>) {
        debug!(module = %self.config.name, keys = updates.len(), "更新模块设置");
        self.scope.merge_settings(updates);
    }

    /// 导出配置
    ///
    /// 包含当前设置与全部子模块配置，可直接用于重新构造模块。
    pub fn export_config(&self) -> ModuleConfig {
        let mut config = self.config.clone();
        config.settings = self.scope.settings();
        config.submodules = self.children.iter().map(|c| c.export_config()).collect();
        config
    }

    /// 当前活动子模块名
    pub fn active_submodule(&self) -> Option<String> {
        self.submodules.active_name()
    }

    /// 子模块（有序）
    pub fn submodules(&self) -> &[Arc<Module>] {
        &self.children
    }

    /// 钩子作用域
    pub fn scope(&self) -> &HookScope {
        &self.scope
    }

    /// 当前状态
    pub fn state(&self) -> ModuleState {
        self.runtime.read().unwrap_or_else(PoisonError::into_inner).state
    }

    fn bus(&self) -> &EventBus {
        &self.context.event_bus
    }

    fn fallback_content(&self) -> String {
        self.config.fallback_content.clone().unwrap_or_else(|| {
            format!(
                "<div class=\"agentlet-fallback\" data-module=\"{}\"></div>",
                self.config.name
            )
        })
    }

    /// 报告钩子失败并构造错误
    fn hook_failed(&self, phase: &str, reason: String) -> CoreError {
        warn!(module = %self.config.name, phase = %phase, error = %reason, "生命周期钩子失败");
        self.bus()
            .emit(names::ERROR, error_payload(&self.config.name, phase, &reason));
        CoreError::hook(&self.config.name, phase, reason)
    }

    fn timings(&self) -> std::sync::MutexGuard<'_, ModuleTimings> {
        self.timings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_init(&self, page: &PageContext) -> std::result::Result<u64, String> {
        let mut elapsed = 0;

        let (result, us) = run_hook(self.hooks.on_init(&self.scope, page)).await;
        elapsed += us;
        result?;

        let (analysis, us) = run_hook(self.hooks.analyze_page(&self.scope, page)).await;
        elapsed += us;
        let analysis = analysis?;
        self.runtime
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .page_analysis = analysis;

        let (result, us) = run_hook(self.hooks.launch(&self.scope, page)).await;
        elapsed += us;
        result?;

        if let Some(css) = &self.config.styles {
            self.context
                .surface
                .inject_styles(&self.config.name, css)
                .map_err(|e| format!("样式注入失败: {:#}", e))?;
            self.runtime
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .styles_injected = true;
        }

        Ok(elapsed)
    }
}

#[async_trait]
impl AgentletModule for Module {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn version(&self) -> &str {
        &self.config.version
    }

    fn patterns(&self) -> &[String] {
        self.matcher.patterns()
    }

    fn match_mode(&self) -> MatchMode {
        self.matcher.mode()
    }

    fn check_pattern(&self, url: &str) -> bool {
        self.matcher.matches(url)
    }

    fn is_active(&self) -> bool {
        self.state() == ModuleState::Active
    }

    async fn init(&self, page: &PageContext) -> Result<()> {
        info!(module = %self.config.name, url = %page.url, "开始初始化模块");

        let elapsed = match self.run_init(page).await {
            Ok(elapsed) => elapsed,
            Err(reason) => {
                // init 失败时释放已注册的监听器
                self.scope.release_listeners();
                return Err(self.hook_failed("init", reason));
            }
        };

        let ctx = NavigationContext::new(None, page.url.clone(), NavigationTrigger::Initial);
        self.submodules.elect(&ctx, page).await;

        {
            let mut runtime = self.runtime.write().unwrap_or_else(PoisonError::into_inner);
            runtime.state = ModuleState::Active;
            runtime.activated_at = Some(Utc::now());
        }
        self.timings().init_us = Some(elapsed);

        self.bus().emit(
            names::LIFECYCLE_INIT,
            json!({ "module": self.config.name, "url": page.url }),
        );
        info!(module = %self.config.name, duration_us = elapsed, "模块初始化完成");
        Ok(())
    }

    async fn activate(&self, ctx: &NavigationContext) -> Result<()> {
        self.bus().emit(
            names::LIFECYCLE_ACTIVATE,
            json!({
                "module": self.config.name,
                "old_url": ctx.old_url,
                "new_url": ctx.new_url,
                "trigger": ctx.trigger,
            }),
        );

        let (result, us) = run_hook(self.hooks.on_activate(&self.scope, ctx)).await;
        {
            let mut timings = self.timings();
            timings.activate_count += 1;
            timings.last_activate_us = Some(us);
        }
        result.map_err(|reason| self.hook_failed("activate", reason))?;

        if self.check_pattern(&ctx.new_url) {
            self.submodules.elect(ctx, &ctx.page()).await;
        } else {
            debug!(module = %self.config.name, url = %ctx.new_url, "URL 已不属于模块");
            self.bus().emit(
                names::APPLICATION_LEFT,
                json!({ "module": self.config.name, "url": ctx.new_url }),
            );
        }
        Ok(())
    }

    async fn cleanup(&self) {
        if !self.is_active() {
            debug!(module = %self.config.name, "模块未激活，跳过清理");
            return;
        }

        let (result, _) = run_hook(self.hooks.on_cleanup(&self.scope)).await;
        if let Err(reason) = result {
            // cleanup 不向上传播错误
            let _ = self.hook_failed("cleanup", reason);
        }

        self.submodules.deactivate().await;
        self.scope.release_listeners();

        let transitioned = {
            let mut runtime = self.runtime.write().unwrap_or_else(PoisonError::into_inner);
            if runtime.styles_injected {
                self.context.surface.remove_styles(&self.config.name);
                runtime.styles_injected = false;
            }
            let was_active = runtime.state == ModuleState::Active;
            runtime.state = ModuleState::Inactive;
            was_active
        };

        if transitioned {
            self.bus()
                .emit(names::LIFECYCLE_CLEANUP, json!({ "module": self.config.name }));
            info!(module = %self.config.name, "模块已清理");
        }
    }

    async fn get_content(&self, page: &PageContext) -> String {
        let (result, us) = run_hook(self.hooks.render(&self.scope, page)).await;
        {
            let mut timings = self.timings();
            timings.render_count += 1;
            timings.last_render_us = Some(us);
        }

        match result {
            Ok(content) => content,
            Err(reason) => {
                let _ = self.hook_failed("render", reason);
                self.fallback_content()
            }
        }
    }

    fn metadata(&self) -> ModuleMetadata {
        let runtime = self.runtime.read().unwrap_or_else(PoisonError::into_inner);
        ModuleMetadata {
            name: self.config.name.clone(),
            version: self.config.version.clone(),
            description: self.config.description.clone(),
            patterns: self.config.patterns.clone(),
            match_mode: self.config.match_mode,
            capabilities: self.config.capabilities.clone(),
            permissions: self.config.permissions.clone(),
            dependencies: self.config.dependencies.clone(),
            state: runtime.state,
            submodules: self.children.iter().map(|c| c.config.name.clone()).collect(),
            active_submodule: self.submodules.active_name(),
            page_analysis: runtime.page_analysis.clone(),
            timings: self.timings().clone(),
            activated_at: runtime.activated_at,
        }
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.config.name)
            .field("version", &self.config.version)
            .field("matcher", &self.matcher)
            .field("state", &self.state())
            .field("submodules", &self.submodules)
            .finish()
    }
}

/// 模块构建器
///
/// 钩子、自定义匹配器与外部协作者都在构造时确定。
pub struct ModuleBuilder {
    config: ModuleConfig,
    hooks: Option<Arc<dyn LifecycleHooks>>,
    custom_matcher: Option<CustomMatcher>,
    context: Option<AppContext>,
    submodule_hooks: Vec<(String, Arc<dyn LifecycleHooks>)>,
    extra_submodules: Vec<Module>,
    on_submodule_change: Option<SubmoduleChangeCallback>,
}

impl ModuleBuilder {
    fn new(config: ModuleConfig) -> Self {
        Self {
            config,
            hooks: None,
            custom_matcher: None,
            context: None,
            submodule_hooks: Vec::new(),
            extra_submodules: Vec::new(),
            on_submodule_change: None,
        }
    }

    /// 设置生命周期钩子（默认 [`NoopHooks`]）
    pub fn hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// 设置自定义匹配谓词（`custom` 模式必需）
    pub fn custom_matcher(mut self, matcher: CustomMatcher) -> Self {
        self.custom_matcher = Some(matcher);
        self
    }

    /// 设置外部协作者
    pub fn context(mut self, context: AppContext) -> Self {
        self.context = Some(context);
        self
    }

    /// 为配置中声明的子模块指定钩子
    pub fn submodule_hooks(mut self, name: impl Into<String>, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.submodule_hooks.push((name.into(), hooks));
        self
    }

    /// 追加一个已构造的子模块（排在配置声明的子模块之后）
    pub fn submodule(mut self, module: Module) -> Self {
        self.extra_submodules.push(module);
        self
    }

    /// 子模块变化回调
    pub fn on_submodule_change(mut self, callback: SubmoduleChangeCallback) -> Self {
        self.on_submodule_change = Some(callback);
        self
    }

    /// 校验配置并构造模块
    ///
    /// # Errors
    ///
    /// 配置无效、`custom` 模式缺少匹配谓词或子模块名重复时返回 `ConfigValidation`
    pub fn build(self) -> Result<Module> {
        ModuleParser::validate(&self.config)?;

        let mut errors = Vec::new();
        if self.config.match_mode == MatchMode::Custom && self.custom_matcher.is_none() {
            errors.push(format!(
                "模块 '{}': custom 模式必须提供自定义匹配函数",
                self.config.name
            ));
        }

        let mut seen: HashSet<&str> = self.config.submodules.iter().map(|s| s.name.as_str()).collect();
        for extra in &self.extra_submodules {
            if !seen.insert(extra.config.name.as_str()) {
                errors.push(format!(
                    "模块 '{}': 子模块名重复 '{}'",
                    self.config.name, extra.config.name
                ));
            }
        }
        for (name, _) in &self.submodule_hooks {
            if !self.config.submodules.iter().any(|s| &s.name == name) {
                errors.push(format!(
                    "模块 '{}': 未声明的子模块 '{}' 不能指定钩子",
                    self.config.name, name
                ));
            }
        }
        if !errors.is_empty() {
            return Err(CoreError::ConfigValidation { errors });
        }

        let context = self.context.unwrap_or_default();

        let mut children = Vec::with_capacity(self.config.submodules.len() + self.extra_submodules.len());
        for sub_config in &self.config.submodules {
            let mut builder = Module::builder(sub_config.clone()).context(context.clone());
            if let Some((_, hooks)) = self.submodule_hooks.iter().find(|(n, _)| n == &sub_config.name) {
                builder = builder.hooks(hooks.clone());
            }
            children.push(Arc::new(builder.build()?));
        }
        children.extend(self.extra_submodules.into_iter().map(Arc::new));

        let mut matcher = PatternMatcher::new(self.config.patterns.clone(), self.config.match_mode);
        if let Some(custom) = self.custom_matcher {
            matcher = matcher.with_custom(custom);
        }

        let scope = HookScope::new(
            &self.config.name,
            self.config.settings.clone(),
            context.event_bus.clone(),
        );

        let submodules = SubmoduleMachine::new(
            self.config.name.clone(),
            children.iter().map(|c| c.clone() as Arc<dyn AgentletModule>).collect(),
            context.event_bus.clone(),
        )
        .with_callback(self.on_submodule_change);

        // 子模块配置由 children 导出，这里不再保留
        let mut config = self.config;
        config.submodules.clear();

        debug!(module = %config.name, submodules = children.len(), "模块构造完成");

        Ok(Module {
            config,
            matcher,
            hooks: self.hooks.unwrap_or_else(|| Arc::new(NoopHooks)),
            scope,
            context,
            children,
            submodules,
            runtime: RwLock::new(RuntimeState::default()),
            timings: Mutex::new(ModuleTimings::default()),
        })
    }
}
