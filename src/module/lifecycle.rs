//! 生命周期钩子
//!
//! 模块的行为通过 [`LifecycleHooks`] 注入，在模块构造时一次性确定。
//! 钩子通过 [`HookScope`] 访问模块名、设置和事件总线；
//! 经 `HookScope::listen` 注册的监听器会在模块 cleanup 时统一释放。
//!
//! # 钩子调用顺序
//!
//! ```text
//! init:     on_init -> analyze_page -> launch
//! activate: on_activate
//! cleanup:  on_cleanup
//! render:   render
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::trace;

use crate::event::{Event, EventBus};
use crate::module::metadata::{NavigationContext, PageContext};
use crate::utils::{generate_id, Result};

/// 模块生命周期钩子
///
/// 所有方法都有空实现，模块只需覆盖关心的阶段。
/// 钩子返回 `anyhow::Result`，错误会被转换为 `CoreError::LifecycleHook`
/// 或 `error` 事件，panic 同样会被捕获。
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// 初始化
    async fn on_init(&self, _scope: &HookScope, _page: &PageContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// 页面分析，结果保存在模块元数据中
    async fn analyze_page(
        &self,
        _scope: &HookScope,
        _page: &PageContext,
    ) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }

    /// 启动
    async fn launch(&self, _scope: &HookScope, _page: &PageContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// URL 变化（模块保持活动时）
    async fn on_activate(&self, _scope: &HookScope, _ctx: &NavigationContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// 清理
    async fn on_cleanup(&self, _scope: &HookScope) -> anyhow::Result<()> {
        Ok(())
    }

    /// 生成内容
    async fn render(&self, _scope: &HookScope, _page: &PageContext) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

/// 不做任何事情的钩子
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl LifecycleHooks for NoopHooks {}

/// 钩子作用域
///
/// 每个模块实例持有一个作用域。设置存放在这里，`Module::update_settings`
/// 与钩子看到的是同一份数据。
pub struct HookScope {
    module: String,
    /// 监听器 owner（模块名 + 随机后缀，同名模块替换时互不影响）
    owner: String,
    settings: RwLock<Map<String, Value>>,
    event_bus: Arc<EventBus>,
}

impl HookScope {
    pub(crate) fn new(module: &str, settings: Map<String, Value>, event_bus: Arc<EventBus>) -> Self {
        Self {
            module: module.to_string(),
            owner: format!("{}#{}", module, generate_id()),
            settings: RwLock::new(settings),
            event_bus,
        }
    }

    /// 模块名
    pub fn module_name(&self) -> &str {
        &self.module
    }

    /// 读取一项设置
    pub fn setting(&self, key: &str) -> Option<Value> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// 全部设置的副本
    pub fn settings(&self) -> Map<String, Value> {
        self.settings.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// 合并设置（同名 key 覆盖）
    pub(crate) fn merge_settings(&self, updates: Map<String, Value>) {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in updates {
            settings.insert(key, value);
        }
    }

    /// 事件总线
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// 发布事件
    pub fn emit(&self, event: &str, data: Value) -> usize {
        self.event_bus.emit(event, data)
    }

    /// 单响应者请求
    pub fn request(&self, event: &str, data: Value) -> Result<Value> {
        self.event_bus.request(event, data)
    }

    /// 注册监听器，模块 cleanup 时自动释放
    pub fn listen<F>(&self, event: &str, handler: F) -> String
    where
        F: Fn(&Event) -> Result<Value> + Send + Sync + 'static,
    {
        self.event_bus.on_owned(&self.owner, event, Arc::new(handler))
    }

    /// 当前持有的监听器数量
    pub fn listener_count(&self) -> usize {
        self.event_bus.owner_subscription_count(&self.owner)
    }

    /// 释放全部监听器
    pub(crate) fn release_listeners(&self) -> usize {
        let released = self.event_bus.off_all(&self.owner);
        if released > 0 {
            trace!(module = %self.module, released, "释放模块监听器");
        }
        released
    }
}

impl std::fmt::Debug for HookScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookScope")
            .field("module", &self.module)
            .field("owner", &self.owner)
            .finish()
    }
}

/// 执行一个钩子 future，统一捕获错误与 panic
///
/// 返回结果与耗时（微秒）。
pub(crate) async fn run_hook<T, F>(fut: F) -> (std::result::Result<T, String>, u64)
where
    F: Future<Output = anyhow::Result<T>>,
{
    let start = Instant::now();
    let result = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(format!("panic: {}", panic_message(payload.as_ref()))),
    };
    (result, start.elapsed().as_micros() as u64)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
