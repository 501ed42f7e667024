//! 事件总线
//!
//! 模块与宿主之间的同步发布/订阅通道，外加单响应者的请求/响应调用。
//!
//! # 主要功能
//!
//! - **emit**: 按订阅顺序同步调用该事件的全部订阅者，以及 `*` 通配订阅者
//! - **request**: 只调用第一个订阅者并返回其结果；没有订阅者时返回 `NoResponder`
//! - **订阅者隔离**: 单个订阅者返回错误或 panic 只记录日志，不影响其他订阅者
//!
//! `request` 只问第一个订阅者，而 `emit` 广播给所有订阅者。这种不对称是有意保留的，
//! 调用方若需要广播语义应使用 `emit`。
//!
//! # 使用示例
//!
//! ```
//! use agentlet_core::event::EventBus;
//! use serde_json::json;
//!
//! let bus = EventBus::new();
//! let id = bus.observe("module:activated", |event| {
//!     println!("激活: {:?}", event.data);
//! });
//!
//! assert_eq!(bus.emit("module:activated", json!({"module": "crm"})), 1);
//! bus.off(&id).unwrap();
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::event::event::{names, Event};
use crate::utils::{generate_id, CoreError, Result};

/// 订阅者回调
///
/// 返回值只对 `request` 有意义；`emit` 会忽略成功值，只记录错误。
pub type EventHandler = Arc<dyn Fn(&Event) -> Result<Value> + Send + Sync>;

/// 没有归属的订阅使用的 owner
const HOST_OWNER: &str = "host";

/// 内部订阅条目
#[derive(Clone)]
struct SubscriptionEntry {
    subscription_id: String,
    owner: String,
    handler: EventHandler,
    #[allow(dead_code)]
    subscribed_at: DateTime<Utc>,
}

/// 分发统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    /// emit 次数
    pub emitted: u64,
    /// 成功送达次数
    pub delivered: u64,
    /// 订阅者返回错误次数
    pub failed: u64,
    /// 订阅者 panic 次数
    pub panicked: u64,
    /// request 次数
    pub requests: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    emitted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    requests: AtomicU64,
}

/// 单个订阅者的调用结果
enum DispatchResult {
    Success(Value),
    Failed(String),
    Panicked,
}

/// 事件总线
///
/// 订阅表只在短暂的临界区内加锁，回调执行时不持有锁，
/// 因此订阅者可以在回调中再次调用 `on` / `off` / `emit`。
pub struct EventBus {
    /// 订阅列表：事件名 -> 按订阅顺序排列的条目
    subscriptions: RwLock<HashMap<String, Vec<SubscriptionEntry>>>,

    /// 订阅 ID -> (事件名, owner)
    index: RwLock<HashMap<String, (String, String)>>,

    stats: StatsCounters,
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new() -> Self {
        debug!("创建事件总线");
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            stats: StatsCounters::default(),
        }
    }

    /// 订阅事件，返回订阅 ID
    pub fn on<F>(&self, event: &str, handler: F) -> String
    where
        F: Fn(&Event) -> Result<Value> + Send + Sync + 'static,
    {
        self.on_owned(HOST_OWNER, event, Arc::new(handler))
    }

    /// 订阅事件，回调不需要返回值
    pub fn observe<F>(&self, event: &str, handler: F) -> String
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.on(event, move |e| {
            handler(e);
            Ok(Value::Null)
        })
    }

    /// 以指定 owner 订阅事件，便于之后用 [`EventBus::off_all`] 批量释放
    pub fn on_owned(&self, owner: &str, event: &str, handler: EventHandler) -> String {
        let entry = SubscriptionEntry {
            subscription_id: generate_id(),
            owner: owner.to_string(),
            handler,
            subscribed_at: Utc::now(),
        };
        let subscription_id = entry.subscription_id.clone();

        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push(entry);

        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscription_id.clone(), (event.to_string(), owner.to_string()));

        trace!(subscription_id = %subscription_id, owner = %owner, event = %event, "事件订阅成功");
        subscription_id
    }

    /// 取消订阅
    ///
    /// # 错误
    ///
    /// 订阅不存在时返回 `CoreError::SubscriptionNotFound`
    pub fn off(&self, subscription_id: &str) -> Result<()> {
        let (event, _) = self
            .index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subscription_id)
            .ok_or_else(|| CoreError::SubscriptionNotFound(subscription_id.to_string()))?;

        let mut subscriptions = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(subs) = subscriptions.get_mut(&event) {
            subs.retain(|s| s.subscription_id != subscription_id);
            if subs.is_empty() {
                subscriptions.remove(&event);
            }
        }

        trace!(subscription_id = %subscription_id, event = %event, "取消订阅成功");
        Ok(())
    }

    /// 取消某个 owner 的全部订阅，返回取消数量
    pub fn off_all(&self, owner: &str) -> usize {
        let ids: Vec<String> = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            index
                .iter()
                .filter(|(_, (_, o))| o == owner)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let removed = ids.iter().filter(|id| self.off(id).is_ok()).count();
        if removed > 0 {
            debug!(owner = %owner, removed, "取消 owner 的全部订阅");
        }
        removed
    }

    /// 同步发布事件
    ///
    /// 依次调用该事件的所有订阅者，再调用 `*` 通配订阅者。
    /// 返回被调用的订阅者数量。
    pub fn emit(&self, event: &str, data: Value) -> usize {
        let event = Event::new(event, data);
        self.stats.emitted.fetch_add(1, Ordering::Relaxed);

        let targets = self.snapshot(&event.name, true);
        if targets.is_empty() {
            trace!(event = %event.name, "没有匹配的订阅者");
            return 0;
        }

        for sub in &targets {
            match Self::invoke(sub, &event) {
                DispatchResult::Success(_) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                DispatchResult::Failed(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription_id = %sub.subscription_id,
                        event = %event.name,
                        error = %e,
                        "事件处理失败"
                    );
                }
                DispatchResult::Panicked => {
                    self.stats.panicked.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription_id = %sub.subscription_id,
                        event = %event.name,
                        "事件处理 panic"
                    );
                }
            }
        }

        targets.len()
    }

    /// 单响应者请求
    ///
    /// 只调用该事件的**第一个**订阅者并返回其结果，其余订阅者不会被调用。
    /// 通配订阅者不参与响应。
    ///
    /// # 错误
    ///
    /// - 没有订阅者时返回 `CoreError::NoResponder`
    /// - 响应者返回错误时原样返回；panic 时返回 `HandlerFailed`
    pub fn request(&self, event: &str, data: Value) -> Result<Value> {
        let event = Event::new(event, data);
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let responder = self
            .snapshot(&event.name, false)
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::NoResponder(event.name.clone()))?;

        let result = catch_unwind(AssertUnwindSafe(|| (responder.handler)(&event)));
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                debug!(event = %event.name, error = %e, "响应者返回错误");
                Err(e)
            }
            Err(_) => Err(CoreError::HandlerFailed(format!(
                "事件 '{}' 的响应者 panic",
                event.name
            ))),
        }
    }

    /// 复制当前订阅者列表（不持锁调用回调）
    fn snapshot(&self, event: &str, include_wildcard: bool) -> Vec<SubscriptionEntry> {
        let subscriptions = self.subscriptions.read().unwrap_or_else(PoisonError::into_inner);
        let mut targets: Vec<SubscriptionEntry> =
            subscriptions.get(event).cloned().unwrap_or_default();

        if include_wildcard && event != names::WILDCARD {
            if let Some(wildcard) = subscriptions.get(names::WILDCARD) {
                targets.extend(wildcard.iter().cloned());
            }
        }
        targets
    }

    fn invoke(sub: &SubscriptionEntry, event: &Event) -> DispatchResult {
        match catch_unwind(AssertUnwindSafe(|| (sub.handler)(event))) {
            Ok(Ok(value)) => DispatchResult::Success(value),
            Ok(Err(e)) => DispatchResult::Failed(e.to_string()),
            Err(_) => DispatchResult::Panicked,
        }
    }

    /// 总订阅数量
    pub fn subscription_count(&self) -> usize {
        self.index.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// 指定事件的订阅数量（不含通配订阅）
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }

    /// 是否有订阅者（含通配订阅）
    pub fn has_subscribers(&self, event: &str) -> bool {
        !self.snapshot(event, true).is_empty()
    }

    /// 某个 owner 持有的订阅数量
    pub fn owner_subscription_count(&self, owner: &str) -> usize {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(_, o)| o == owner)
            .count()
    }

    /// 分发统计
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            emitted: self.stats.emitted.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            panicked: self.stats.panicked.load(Ordering::Relaxed),
            requests: self.stats.requests.load(Ordering::Relaxed),
        }
    }

    /// 重置统计信息
    pub fn reset_stats(&self) {
        self.stats.emitted.store(0, Ordering::Relaxed);
        self.stats.delivered.store(0, Ordering::Relaxed);
        self.stats.failed.store(0, Ordering::Relaxed);
        self.stats.panicked.store(0, Ordering::Relaxed);
        self.stats.requests.store(0, Ordering::Relaxed);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}
