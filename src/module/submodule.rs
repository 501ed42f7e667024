//! 子模块激活状态机
//!
//! 每个模块最多有一个活动子模块。每次 URL 变化时按以下规则重新选举：
//!
//! 1. 当前活动子模块不再匹配：cleanup 并清空，发出 `submoduleDeactivated`
//! 2. 按列表顺序扫描，第一个匹配的子模块为候选：
//!    - 与当前活动子模块相同：只调用 `activate`
//!    - 否则：cleanup 当前活动子模块，init 候选并设为活动，发出 `submoduleActivated`
//!    - 候选 init 失败：发出 `error{phase: "submodule"}`，不设置活动子模块
//! 3. 无论结果如何都调用父模块的变化回调
//!
//! 子模块按名称比较（同一父模块下名称唯一）。

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::event::{error_payload, names, EventBus};
use crate::module::agentlet::AgentletModule;
use crate::module::metadata::{NavigationContext, PageContext};

/// 子模块变化回调：`(父模块名, 当前活动子模块名)`
pub type SubmoduleChangeCallback = Arc<dyn Fn(&str, Option<&str>) + Send + Sync>;

/// 子模块状态机
pub struct SubmoduleMachine {
    parent: String,
    children: Vec<Arc<dyn AgentletModule>>,
    active: Mutex<Option<Arc<dyn AgentletModule>>>,
    on_change: Option<SubmoduleChangeCallback>,
    event_bus: Arc<EventBus>,
}

impl SubmoduleMachine {
    pub fn new(
        parent: impl Into<String>,
        children: Vec<Arc<dyn AgentletModule>>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            parent: parent.into(),
            children,
            active: Mutex::new(None),
            on_change: None,
            event_bus,
        }
    }

    /// 设置变化回调
    pub fn with_callback(mut self, callback: Option<SubmoduleChangeCallback>) -> Self {
        self.on_change = callback;
        self
    }

    /// 子模块列表（有序）
    pub fn children(&self) -> &[Arc<dyn AgentletModule>] {
        &self.children
    }

    /// 当前活动子模块
    pub fn active(&self) -> Option<Arc<dyn AgentletModule>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// 当前活动子模块名
    pub fn active_name(&self) -> Option<String> {
        self.active().map(|m| m.name().to_string())
    }

    fn set_active(&self, module: Option<Arc<dyn AgentletModule>>) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = module;
    }

    /// 按当前导航上下文重新选举活动子模块，返回选举后的活动子模块名
    pub async fn elect(&self, ctx: &NavigationContext, page: &PageContext) -> Option<String> {
        let url = ctx.new_url.as_str();

        // 1. 当前活动子模块不再匹配
        if let Some(current) = self.active() {
            if !current.check_pattern(url) {
                self.deactivate_current(&current).await;
            }
        }

        // 2. 第一个匹配者
        let candidate = self.children.iter().find(|c| c.check_pattern(url)).cloned();
        if let Some(candidate) = candidate {
            let current = self.active();
            let same = current
                .as_ref()
                .is_some_and(|c| c.name() == candidate.name());

            if same {
                if let Err(e) = candidate.activate(ctx).await {
                    warn!(module = %self.parent, submodule = %candidate.name(), error = %e, "子模块 activate 失败");
                }
            } else {
                if let Some(current) = current {
                    self.deactivate_current(&current).await;
                }
                self.activate_candidate(candidate, page).await;
            }
        }

        // 3. 回调
        let active = self.active_name();
        if let Some(callback) = &self.on_change {
            callback(&self.parent, active.as_deref());
        }
        active
    }

    async fn deactivate_current(&self, current: &Arc<dyn AgentletModule>) {
        current.cleanup().await;
        self.set_active(None);

        debug!(module = %self.parent, submodule = %current.name(), "子模块停用");
        self.event_bus.emit(
            names::SUBMODULE_DEACTIVATED,
            json!({ "module": self.parent, "submodule": current.name() }),
        );
    }

    async fn activate_candidate(&self, candidate: Arc<dyn AgentletModule>, page: &PageContext) {
        match candidate.init(page).await {
            Ok(()) => {
                info!(module = %self.parent, submodule = %candidate.name(), "子模块激活");
                let name = candidate.name().to_string();
                self.set_active(Some(candidate));
                self.event_bus.emit(
                    names::SUBMODULE_ACTIVATED,
                    json!({ "module": self.parent, "submodule": name }),
                );
            }
            Err(e) => {
                warn!(module = %self.parent, submodule = %candidate.name(), error = %e, "子模块初始化失败");
                let mut payload = error_payload(&self.parent, "submodule", &e);
                payload["submodule"] = json!(candidate.name());
                self.event_bus.emit(names::ERROR, payload);
            }
        }
    }

    /// 停用当前活动子模块（父模块 cleanup 时调用）
    pub async fn deactivate(&self) {
        if let Some(current) = self.active() {
            self.deactivate_current(&current).await;
        }
    }
}

impl std::fmt::Debug for SubmoduleMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmoduleMachine")
            .field("parent", &self.parent)
            .field("children", &self.children.iter().map(|c| c.name()).collect::<Vec<_>>())
            .field("active", &self.active_name())
            .finish()
    }
}
