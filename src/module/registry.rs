//! 模块注册表
//!
//! 按注册顺序保存模块，并在 URL 变化时选举活动模块。
//!
//! # 选举规则
//!
//! 按注册顺序扫描，第一个匹配当前 URL 的模块当选：
//!
//! - 与上一个活动模块相同：调用其 `activate`
//! - 不同：上一个活动模块先 `activate`（URL 不再匹配时会发出 `applicationLeft`），
//!   再 `cleanup` 并发出 `module:deactivated`；新模块 `init` 后成为活动模块，
//!   发出 `module:activated`
//! - 新模块 init 失败：发出 `module:registrationFailed`，不设置活动模块
//!
//! 锁只在短临界区内持有，钩子执行期间不持锁，因此多次导航可以交错执行。
//! 开启 `generation_guard` 后，完成时已被新导航取代的 init 会被丢弃。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::config::RegistryConfig;
use crate::event::{names, EventBus};
use crate::module::agentlet::AgentletModule;
use crate::module::metadata::{ModuleSource, NavigationContext, NavigationTrigger, PageContext};
use crate::utils::{CoreError, LifecycleMetrics, MetricsReport, Phase, Result};

/// 活动模块变化回调，参数为当前活动模块名
pub type ModuleChangeCallback = Arc<dyn Fn(Option<&str>) + Send + Sync>;

/// 重名注册策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// 拒绝重名注册
    #[default]
    Reject,
    /// 清理旧模块并原位替换（保留注册顺序）
    Replace,
}

/// 注册表条目
struct RegistryEntry {
    module: Arc<dyn AgentletModule>,
    source: ModuleSource,
    registered_at: DateTime<Utc>,
}

/// 对外暴露的条目信息
#[derive(Debug, Clone, Serialize)]
pub struct RegistryEntryInfo {
    pub name: String,
    pub version: String,
    pub source: ModuleSource,
    pub registered_at: DateTime<Utc>,
    pub active: bool,
}

/// 注册表统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    /// 已注册模块数
    pub total: usize,
    /// 内置模块数
    pub builtin: usize,
    /// 本地清单模块数
    pub local: usize,
    /// 远程模块数
    pub remote: usize,
    /// 当前活动模块
    pub active_module: Option<String>,
    /// 最近一次的 URL
    pub current_url: Option<String>,
    /// 导航代数
    pub generation: u64,
    /// init 失败次数
    pub init_failures: u64,
    /// 被丢弃的过期 init 次数
    pub stale_discards: u64,
    /// 成功注册次数（含替换）
    pub registrations: u64,
}

/// 模块注册表
pub struct ModuleRegistry {
    /// 有序条目
    entries: RwLock<Vec<RegistryEntry>>,

    /// 当前活动模块
    active: RwLock<Option<Arc<dyn AgentletModule>>>,

    /// 最近一次的 URL
    current_url: RwLock<Option<String>>,

    /// 导航代数（每次 URL 变化 +1）
    generation: AtomicU64,

    config: RegistryConfig,
    event_bus: Arc<EventBus>,
    on_change: std::sync::RwLock<Option<ModuleChangeCallback>>,
    metrics: LifecycleMetrics,
    init_failures: AtomicU64,
    stale_discards: AtomicU64,
    registrations: AtomicU64,
}

impl ModuleRegistry {
    /// 创建注册表
    pub fn new(config: RegistryConfig, event_bus: Arc<EventBus>) -> Self {
        info!(
            duplicate_policy = ?config.duplicate_policy,
            generation_guard = config.generation_guard,
            "创建模块注册表"
        );
        Self {
            entries: RwLock::new(Vec::new()),
            active: RwLock::new(None),
            current_url: RwLock::new(None),
            generation: AtomicU64::new(0),
            config,
            event_bus,
            on_change: std::sync::RwLock::new(None),
            metrics: LifecycleMetrics::new(),
            init_failures: AtomicU64::new(0),
            stale_discards: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
        }
    }

    /// 设置活动模块变化回调
    pub fn set_on_change(&self, callback: ModuleChangeCallback) {
        *self.on_change.write().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn notify_change(&self, active: Option<&str>) {
        let callback = self
            .on_change
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(active);
        }
    }

    // ==================== 注册 ====================

    /// 注册模块
    ///
    /// # Errors
    ///
    /// `Reject` 策略下重名时返回 `ModuleAlreadyRegistered`，并发出 `module:registrationFailed`
    pub async fn register(&self, module: Arc<dyn AgentletModule>, source: ModuleSource) -> Result<()> {
        let name = module.name().to_string();
        let version = module.version().to_string();

        let replaced = {
            let mut entries = self.entries.write().await;
            match entries.iter().position(|e| e.module.name() == name) {
                Some(_) if self.config.duplicate_policy == DuplicatePolicy::Reject => None,
                Some(pos) => {
                    let old = std::mem::replace(
                        &mut entries[pos],
                        RegistryEntry {
                            module,
                            source: source.clone(),
                            registered_at: Utc::now(),
                        },
                    );
                    Some(Some(old.module))
                }
                None => {
                    entries.push(RegistryEntry {
                        module,
                        source: source.clone(),
                        registered_at: Utc::now(),
                    });
                    Some(None)
                }
            }
        };

        let Some(replaced) = replaced else {
            warn!(module = %name, "模块重名，拒绝注册");
            let err = CoreError::ModuleAlreadyRegistered(name.clone());
            self.event_bus.emit(
                names::MODULE_REGISTRATION_FAILED,
                json!({ "module": name, "source": source, "error": err.to_string() }),
            );
            return Err(err);
        };

        if let Some(old) = &replaced {
            info!(module = %name, "替换同名模块");
            self.retire(old).await;
        }

        self.registrations.fetch_add(1, Ordering::SeqCst);
        info!(module = %name, version = %version, "模块注册成功");
        self.event_bus.emit(
            names::MODULE_REGISTERED,
            json!({
                "module": name,
                "version": version,
                "source": source,
                "replaced": replaced.is_some(),
            }),
        );
        Ok(())
    }

    /// 清理被替换/卸载的模块；若它是活动模块则清空活动模块
    async fn retire(&self, module: &Arc<dyn AgentletModule>) -> bool {
        let was_active = {
            let mut active = self.active.write().await;
            if active.as_ref().is_some_and(|a| a.name() == module.name()) {
                *active = None;
                true
            } else {
                false
            }
        };

        if module.is_active() {
            let start = Instant::now();
            module.cleanup().await;
            self.metrics
                .record(Phase::Cleanup, true, start.elapsed().as_micros() as u64);
        }

        if was_active {
            self.event_bus
                .emit(names::MODULE_DEACTIVATED, json!({ "module": module.name() }));
            self.notify_change(None);
        }
        was_active
    }

    /// 卸载模块
    ///
    /// # Errors
    ///
    /// 模块不存在时返回 `ModuleNotFound`
    pub async fn unload(&self, name: &str) -> Result<()> {
        let entry = {
            let mut entries = self.entries.write().await;
            let pos = entries
                .iter()
                .position(|e| e.module.name() == name)
                .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))?;
            entries.remove(pos)
        };

        let was_active = self.retire(&entry.module).await;
        self.event_bus
            .emit(names::MODULE_UNLOADED, json!({ "module": name }));
        if !was_active {
            let active = self.active_name().await;
            self.notify_change(active.as_deref());
        }

        info!(module = %name, "模块已卸载");
        Ok(())
    }

    /// 卸载全部模块
    pub async fn clear(&self) {
        let names: Vec<String> = self
            .entries
            .read()
            .await
            .iter()
            .map(|e| e.module.name().to_string())
            .collect();

        for name in names {
            if let Err(e) = self.unload(&name).await {
                debug!(module = %name, error = %e, "卸载时模块已不存在");
            }
        }
    }

    // ==================== 选举 ====================

    /// 处理 URL 变化，返回选举后的活动模块名
    pub async fn handle_url_change(&self, url: &str, trigger: NavigationTrigger) -> Option<String> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let old_url = self.current_url.write().await.replace(url.to_string());
        let ctx = NavigationContext::new(old_url, url, trigger);

        let elected = self
            .entries
            .read()
            .await
            .iter()
            .find(|e| e.module.check_pattern(url))
            .map(|e| e.module.clone());
        let previous = self.active.read().await.clone();

        debug!(
            url = %url,
            generation,
            elected = ?elected.as_ref().map(|m| m.name().to_string()),
            previous = ?previous.as_ref().map(|m| m.name().to_string()),
            "开始选举活动模块"
        );

        match (previous, elected) {
            (Some(prev), Some(next)) if prev.name() == next.name() => {
                self.activate_module(&prev, &ctx).await;
            }
            (previous, elected) => {
                if let Some(prev) = previous {
                    self.deactivate_previous(&prev, &ctx).await;
                }
                if let Some(next) = elected {
                    self.install(next, &ctx, generation).await;
                }
            }
        }

        let active = self.active_name().await;
        self.notify_change(active.as_deref());
        active
    }

    /// 用最近一次的 URL 重新选举
    pub async fn refresh(&self) -> Option<String> {
        let url = self.current_url.read().await.clone()?;
        self.handle_url_change(&url, NavigationTrigger::Manual).await
    }

    async fn activate_module(&self, module: &Arc<dyn AgentletModule>, ctx: &NavigationContext) {
        let start = Instant::now();
        let result = module.activate(ctx).await;
        self.metrics.record(
            Phase::Activate,
            result.is_ok(),
            start.elapsed().as_micros() as u64,
        );
        if let Err(e) = result {
            warn!(module = %module.name(), error = %e, "活动模块 activate 失败");
        }
    }

    async fn deactivate_previous(&self, prev: &Arc<dyn AgentletModule>, ctx: &NavigationContext) {
        self.activate_module(prev, ctx).await;

        let start = Instant::now();
        prev.cleanup().await;
        self.metrics
            .record(Phase::Cleanup, true, start.elapsed().as_micros() as u64);

        {
            let mut active = self.active.write().await;
            if active.as_ref().is_some_and(|a| a.name() == prev.name()) {
                *active = None;
            }
        }

        info!(module = %prev.name(), "模块停用");
        self.event_bus
            .emit(names::MODULE_DEACTIVATED, json!({ "module": prev.name() }));
    }

    async fn install(&self, next: Arc<dyn AgentletModule>, ctx: &NavigationContext, generation: u64) {
        let page = PageContext::new(ctx.new_url.clone());
        let start = Instant::now();
        let result = next.init(&page).await;
        let elapsed = start.elapsed().as_micros() as u64;
        self.metrics.record(Phase::Init, result.is_ok(), elapsed);

        if let Err(e) = result {
            self.init_failures.fetch_add(1, Ordering::Relaxed);
            warn!(module = %next.name(), error = %e, "模块初始化失败");
            self.event_bus.emit(
                names::MODULE_REGISTRATION_FAILED,
                json!({ "module": next.name(), "phase": "init", "error": e.to_string() }),
            );
            return;
        }

        if self.config.generation_guard {
            let current = self.generation.load(Ordering::SeqCst);
            if current != generation {
                self.stale_discards.fetch_add(1, Ordering::Relaxed);
                info!(
                    module = %next.name(),
                    generation,
                    current,
                    "导航已过期，丢弃初始化结果"
                );
                // 较新的导航已装入同一模块时，模块归它所有
                let owned_by_newer = self
                    .active
                    .read()
                    .await
                    .as_ref()
                    .is_some_and(|a| a.name() == next.name());
                if !owned_by_newer {
                    next.cleanup().await;
                }
                return;
            }
        }

        *self.active.write().await = Some(next.clone());
        info!(module = %next.name(), url = %ctx.new_url, duration_us = elapsed, "模块激活");
        self.event_bus.emit(
            names::MODULE_ACTIVATED,
            json!({ "module": next.name(), "url": ctx.new_url }),
        );
    }

    // ==================== 查询 ====================

    /// 按名称获取模块
    pub async fn get(&self, name: &str) -> Option<Arc<dyn AgentletModule>> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.module.name() == name)
            .map(|e| e.module.clone())
    }

    /// 是否已注册
    pub async fn contains(&self, name: &str) -> bool {
        self.get(name).await.is_some()
    }

    /// 按注册顺序列出模块名
    pub async fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| e.module.name().to_string())
            .collect()
    }

    /// 条目信息
    pub async fn list(&self) -> Vec<RegistryEntryInfo> {
        let active = self.active_name().await;
        self.entries
            .read()
            .await
            .iter()
            .map(|e| RegistryEntryInfo {
                name: e.module.name().to_string(),
                version: e.module.version().to_string(),
                source: e.source.clone(),
                registered_at: e.registered_at,
                active: active.as_deref() == Some(e.module.name()),
            })
            .collect()
    }

    /// 已注册模块数
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 当前活动模块
    pub async fn active_module(&self) -> Option<Arc<dyn AgentletModule>> {
        self.active.read().await.clone()
    }

    /// 当前活动模块名
    pub async fn active_name(&self) -> Option<String> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|m| m.name().to_string())
    }

    /// 最近一次的 URL
    pub async fn current_url(&self) -> Option<String> {
        self.current_url.read().await.clone()
    }

    /// 当前导航代数
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// 成功注册次数，用于判断一次加载是否改动了注册表
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }

    /// 统计信息
    pub async fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            active_module: self.active_name().await,
            current_url: self.current_url().await,
            generation: self.generation(),
            init_failures: self.init_failures.load(Ordering::Relaxed),
            stale_discards: self.stale_discards.load(Ordering::Relaxed),
            registrations: self.registrations(),
            ..Default::default()
        };

        for entry in self.entries.read().await.iter() {
            stats.total += 1;
            match entry.source {
                ModuleSource::Builtin => stats.builtin += 1,
                ModuleSource::Local { .. } => stats.local += 1,
                ModuleSource::Remote { .. } => stats.remote += 1,
            }
        }
        stats
    }

    /// 生命周期耗时报告
    pub fn metrics(&self) -> MetricsReport {
        self.metrics.export()
    }

    /// 记录远程加载耗时（由加载器调用）
    pub(crate) fn record_remote_load(&self, success: bool, latency_us: u64) {
        self.metrics.record(Phase::RemoteLoad, success, latency_us);
    }

    /// 记录渲染耗时
    pub(crate) fn record_render(&self, latency_us: u64) {
        self.metrics.record(Phase::Render, true, latency_us);
    }

    /// 事件总线
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// 注册表配置
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("config", &self.config)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}
