//! AgentletCore SDK
//!
//! 宿主使用内核的主要入口。统一持有并协调：
//!
//! - 事件总线：发布/订阅、单响应者请求
//! - 模块注册表：注册、导航选举、卸载
//! - 远程加载器：拉取、校验、求值远程模块
//! - 渲染表面与生命周期指标
//!
//! # 示例
//!
//! ```rust,no_run
//! use agentlet_core::{AgentletCore, CoreConfig, ModuleConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut core = AgentletCore::new(CoreConfig::default()).await?;
//!     core.start().await?;
//!
//!     let crm = core.module_builder(ModuleConfig::new("crm", "1.0.0").pattern("/crm")).build()?;
//!     core.register_module(crm).await?;
//!
//!     let active = core.navigate("https://app.example.com/crm/contacts").await?;
//!     assert_eq!(active.as_deref(), Some("crm"));
//!
//!     core.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::config::CoreConfig;
use crate::event::{names, DispatchStats, Event, EventBus};
use crate::module::{
    AgentletModule, AppContext, LoadOptions, LoaderStats, ManifestEvaluator, Module,
    ModuleBuilder, ModuleChangeCallback, ModuleConfig, ModuleMetadata, ModuleParser,
    ModuleRegistry, ModuleSource, NavigationTrigger, NoopSurface, PageContext, RegistryEntryInfo,
    RegistryStats, RemoteLoader, RenderSurface, SourceEvaluator, SourceFetcher,
};
use crate::module::loader::HttpSourceFetcher;
use crate::utils::{CoreError, MetricsReport, Result};

/// 内核启动事件
pub const CORE_STARTED: &str = "core:started";
/// 内核关闭事件
pub const CORE_SHUTTING_DOWN: &str = "core:shuttingDown";

// ============================================================================
// 内核状态
// ============================================================================

/// 内核状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoreState {
    /// 已初始化
    Initialized,
    /// 运行中
    Running,
    /// 正在关闭
    ShuttingDown,
    /// 已关闭
    Shutdown,
}

impl CoreState {
    /// 检查是否可以启动
    pub fn can_start(&self) -> bool {
        matches!(self, CoreState::Initialized)
    }

    /// 检查是否可以关闭
    pub fn can_shutdown(&self) -> bool {
        matches!(self, CoreState::Running)
    }

    /// 检查是否正在运行
    pub fn is_running(&self) -> bool {
        matches!(self, CoreState::Running)
    }
}

// ============================================================================
// AgentletCore 主结构体
// ============================================================================

/// Agentlet 内核
///
/// 内核不使用全局单例，所有协作者都通过 [`AppContext`] 显式传递给模块。
///
/// # 生命周期
///
/// 1. `new()` / `builder()` - 创建内核
/// 2. `start()` - 扫描本地清单目录，进入运行状态
/// 3. `navigate()` / `load_from_url()` / `content()` - 运行期操作
/// 4. `shutdown()` - 清理全部模块
pub struct AgentletCore {
    config: CoreConfig,
    state: Arc<RwLock<CoreState>>,
    context: AppContext,
    registry: Arc<ModuleRegistry>,
    loader: RemoteLoader,
    started_at: Option<Instant>,
}

impl AgentletCore {
    /// 使用默认协作者创建内核
    pub async fn new(config: CoreConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// 创建内核构建器
    pub fn builder(config: CoreConfig) -> AgentletCoreBuilder {
        AgentletCoreBuilder::new(config)
    }

    // ========================================================================
    // 生命周期
    // ========================================================================

    /// 启动内核
    ///
    /// 扫描配置中的清单目录并注册其中的模块。单个清单失败不会中断启动。
    ///
    /// # Errors
    ///
    /// 内核不处于 `Initialized` 状态时返回 `InitFailed`
    pub async fn start(&mut self) -> Result<()> {
        let mut state = self.state.write().await;

        if !state.can_start() {
            return Err(CoreError::InitFailed(format!(
                "内核当前状态 {:?} 不允许启动",
                *state
            )));
        }

        info!("启动 Agentlet 内核...");

        let mut loaded = 0;
        for dir in self.config.manifest_dirs.clone() {
            loaded += self.scan_manifest_dir(&dir).await;
        }
        debug!(modules = loaded, "本地清单扫描完成");

        self.context.event_bus.emit(
            CORE_STARTED,
            json!({
                "version": crate::VERSION,
                "modules": loaded,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        );

        *state = CoreState::Running;
        self.started_at = Some(Instant::now());

        info!("Agentlet 内核已启动");
        Ok(())
    }

    /// 关闭内核
    ///
    /// 清理并卸载全部模块，清空远程源码缓存。未运行时静默返回。
    pub async fn shutdown(&mut self) -> Result<()> {
        let mut state = self.state.write().await;

        if !state.can_shutdown() {
            return Ok(());
        }

        info!("正在关闭 Agentlet 内核...");
        *state = CoreState::ShuttingDown;

        self.context.event_bus.emit(
            CORE_SHUTTING_DOWN,
            json!({ "timestamp": chrono::Utc::now().to_rfc3339() }),
        );

        self.registry.clear().await;
        self.loader.clear_cache();
        debug!("所有模块已卸载");

        *state = CoreState::Shutdown;
        info!("Agentlet 内核已关闭");
        Ok(())
    }

    async fn ensure_running(&self) -> Result<()> {
        let state = *self.state.read().await;
        if state.is_running() {
            Ok(())
        } else {
            Err(CoreError::InitFailed(format!("内核未运行（当前状态 {:?}）", state)))
        }
    }

    /// 扫描清单目录，返回注册成功的模块数
    async fn scan_manifest_dir(&self, dir: &Path) -> usize {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = ?dir, error = %e, "清单目录不可读，跳过");
                return 0;
            }
        };

        let mut paths: Vec<PathBuf> = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    let is_manifest = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| matches!(e, "yaml" | "yml" | "json"));
                    if is_manifest {
                        paths.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(path = ?dir, error = %e, "读取清单目录失败");
                    break;
                }
            }
        }
        // 按文件名排序，保证注册顺序稳定
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            match self.register_manifest(&path).await {
                Ok(name) => {
                    debug!(module = %name, path = ?path, "注册本地模块");
                    loaded += 1;
                }
                Err(CoreError::ModuleAlreadyRegistered(name)) => {
                    // 注册表已上报
                    warn!(module = %name, path = ?path, "本地清单模块重名");
                }
                Err(e) => {
                    warn!(path = ?path, error = %e, "本地清单注册失败");
                    self.context.event_bus.emit(
                        names::MODULE_REGISTRATION_FAILED,
                        json!({
                            "path": path.display().to_string(),
                            "code": e.error_code(),
                            "error": e.to_string(),
                        }),
                    );
                }
            }
        }
        loaded
    }

    async fn register_manifest(&self, path: &Path) -> Result<String> {
        let config = ModuleParser::parse_file(path).await?;
        let name = config.name.clone();
        let module = self.module_builder(config).build()?;
        self.registry
            .register(
                Arc::new(module),
                ModuleSource::Local {
                    path: path.to_path_buf(),
                },
            )
            .await?;
        Ok(name)
    }

    // ========================================================================
    // 模块 API
    // ========================================================================

    /// 预设了内核协作者的模块构建器
    pub fn module_builder(&self, config: ModuleConfig) -> ModuleBuilder {
        Module::builder(config).context(self.context.clone())
    }

    /// 注册内置模块
    pub async fn register_module(&self, module: Module) -> Result<()> {
        self.register(Arc::new(module), ModuleSource::Builtin).await
    }

    /// 注册任意实现了 [`AgentletModule`] 的模块
    pub async fn register(&self, module: Arc<dyn AgentletModule>, source: ModuleSource) -> Result<()> {
        self.registry.register(module, source).await
    }

    /// 卸载模块
    pub async fn unload(&self, name: &str) -> Result<()> {
        self.registry.unload(name).await
    }

    /// 通知 URL 变化，返回选举后的活动模块名
    ///
    /// 第一次导航的触发来源为 `Initial`，之后为 `Navigation`。
    pub async fn navigate(&self, url: &str) -> Result<Option<String>> {
        self.ensure_running().await?;
        let trigger = if self.registry.current_url().await.is_none() {
            NavigationTrigger::Initial
        } else {
            NavigationTrigger::Navigation
        };
        Ok(self.registry.handle_url_change(url, trigger).await)
    }

    /// 用最近一次的 URL 重新选举
    pub async fn refresh(&self) -> Result<Option<String>> {
        self.ensure_running().await?;
        Ok(self.registry.refresh().await)
    }

    /// 从 URL 加载远程模块
    pub async fn load_from_url(&self, url: &str, options: LoadOptions) -> Result<Vec<String>> {
        self.ensure_running().await?;
        self.loader.load_from_url(url, options).await
    }

    /// 活动模块的内容；没有活动模块时返回 `None`
    pub async fn content(&self, page: &PageContext) -> Option<String> {
        let module = self.registry.active_module().await?;
        let start = Instant::now();
        let content = module.get_content(page).await;
        self.registry.record_render(start.elapsed().as_micros() as u64);
        Some(content)
    }

    /// 当前活动模块
    pub async fn active_module(&self) -> Option<Arc<dyn AgentletModule>> {
        self.registry.active_module().await
    }

    /// 指定模块的元数据
    pub async fn module_metadata(&self, name: &str) -> Result<ModuleMetadata> {
        self.registry
            .get(name)
            .await
            .map(|m| m.metadata())
            .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))
    }

    /// 已注册模块列表
    pub async fn list_modules(&self) -> Vec<RegistryEntryInfo> {
        self.registry.list().await
    }

    /// 活动模块变化回调
    pub fn on_module_change(&self, callback: ModuleChangeCallback) {
        self.registry.set_on_change(callback);
    }

    // ========================================================================
    // 事件 API
    // ========================================================================

    /// 订阅事件
    pub fn on<F>(&self, event: &str, handler: F) -> String
    where
        F: Fn(&Event) -> Result<Value> + Send + Sync + 'static,
    {
        self.context.event_bus.on(event, handler)
    }

    /// 取消订阅
    pub fn off(&self, subscription_id: &str) -> Result<()> {
        self.context.event_bus.off(subscription_id)
    }

    /// 发布事件
    pub fn emit(&self, event: &str, data: Value) -> usize {
        self.context.event_bus.emit(event, data)
    }

    /// 单响应者请求
    pub fn request(&self, event: &str, data: Value) -> Result<Value> {
        self.context.event_bus.request(event, data)
    }

    // ========================================================================
    // 访问器
    // ========================================================================

    /// 获取内核状态
    pub async fn state(&self) -> CoreState {
        *self.state.read().await
    }

    /// 检查内核是否正在运行
    pub async fn is_running(&self) -> bool {
        self.state.read().await.is_running()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// 模块协作者
    pub fn context(&self) -> &AppContext {
        &self.context
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.context.event_bus
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &RemoteLoader {
        &self.loader
    }

    /// 运行时长
    pub fn uptime(&self) -> Option<std::time::Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// 生命周期耗时报告
    pub fn metrics(&self) -> MetricsReport {
        self.registry.metrics()
    }

    /// 统计信息
    pub async fn stats(&self) -> CoreStats {
        CoreStats {
            registry: self.registry.stats().await,
            loader: self.loader.stats(),
            events: self.context.event_bus.stats(),
        }
    }

    /// 获取健康状态
    pub async fn health(&self) -> HealthInfo {
        let registry = self.registry.stats().await;
        HealthInfo {
            state: self.state().await,
            uptime_secs: self.uptime().map(|d| d.as_secs()),
            modules: registry.total,
            active_module: registry.active_module,
            event_subscriptions: self.context.event_bus.subscription_count(),
        }
    }
}

impl Drop for AgentletCore {
    fn drop(&mut self) {
        debug!("Agentlet 内核实例被释放");
    }
}

// ============================================================================
// 构建器
// ============================================================================

/// 内核构建器
///
/// 用于替换默认协作者（渲染表面、源码拉取、源码求值）。
pub struct AgentletCoreBuilder {
    config: CoreConfig,
    surface: Option<Arc<dyn RenderSurface>>,
    fetcher: Option<Arc<dyn SourceFetcher>>,
    evaluator: Option<Arc<dyn SourceEvaluator>>,
}

impl AgentletCoreBuilder {
    fn new(config: CoreConfig) -> Self {
        Self {
            config,
            surface: None,
            fetcher: None,
            evaluator: None,
        }
    }

    /// 渲染表面（默认 [`NoopSurface`]）
    pub fn surface(mut self, surface: Arc<dyn RenderSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    /// 源码拉取（默认 [`HttpSourceFetcher`]）
    pub fn fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// 源码求值（默认 [`ManifestEvaluator`]）
    pub fn evaluator(mut self, evaluator: Arc<dyn SourceEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// 构建内核
    ///
    /// # Errors
    ///
    /// 配置校验失败或 HTTP 客户端创建失败时返回错误
    pub async fn build(self) -> Result<AgentletCore> {
        info!("初始化 Agentlet 内核 v{}", crate::VERSION);
        self.config.validate()?;

        let event_bus = Arc::new(EventBus::new());
        let surface = self.surface.unwrap_or_else(|| Arc::new(NoopSurface));
        let context = AppContext::new(event_bus.clone()).with_surface(surface);

        let registry = Arc::new(ModuleRegistry::new(
            self.config.registry.clone(),
            event_bus,
        ));

        let fetcher: Arc<dyn SourceFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpSourceFetcher::new(&self.config.loader)?),
        };
        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(ManifestEvaluator::new()));
        let loader = RemoteLoader::with_parts(
            registry.clone(),
            context.clone(),
            self.config.loader.cache_capacity,
            fetcher,
            evaluator,
        );

        info!("Agentlet 内核初始化完成");
        Ok(AgentletCore {
            config: self.config,
            state: Arc::new(RwLock::new(CoreState::Initialized)),
            context,
            registry,
            loader,
            started_at: None,
        })
    }
}

// ============================================================================
// 统计与健康信息
// ============================================================================

/// 内核统计信息
#[derive(Debug, Clone, Serialize)]
pub struct CoreStats {
    pub registry: RegistryStats,
    pub loader: LoaderStats,
    pub events: DispatchStats,
}

/// 健康状态信息
#[derive(Debug, Clone, Serialize)]
pub struct HealthInfo {
    /// 内核状态
    pub state: CoreState,
    /// 运行时间（秒）
    pub uptime_secs: Option<u64>,
    /// 已注册模块数
    pub modules: usize,
    /// 当前活动模块
    pub active_module: Option<String>,
    /// 事件订阅数
    pub event_subscriptions: usize,
}

// ============================================================================
// 单元测试
// ============================================================================
