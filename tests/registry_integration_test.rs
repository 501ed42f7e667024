//! # 注册表集成测试
//!
//! 覆盖活动模块选举的完整流程：
//! - 按注册顺序选举、离开匹配范围时停用
//! - 重名注册的两种策略
//! - init 失败的处理
//! - 并发导航下的过期写入与代际保护

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentlet_core::core::config::RegistryConfig;
use agentlet_core::event::{names, EventBus};
use agentlet_core::module::{
    AgentletModule, AppContext, DuplicatePolicy, HookScope, LifecycleHooks, Module, ModuleConfig,
    ModuleRegistry, ModuleSource, ModuleState, NavigationContext, NavigationTrigger, PageContext,
};
use agentlet_core::CoreError;
use async_trait::async_trait;

// ============================================================================
// 测试辅助
// ============================================================================

/// 记录各钩子调用次数
#[derive(Default)]
struct CountingHooks {
    inits: AtomicUsize,
    activates: AtomicUsize,
    cleanups: AtomicUsize,
}

#[async_trait]
impl LifecycleHooks for CountingHooks {
    async fn on_init(&self, _scope: &HookScope, _page: &PageContext) -> anyhow::Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_activate(&self, _scope: &HookScope, _ctx: &NavigationContext) -> anyhow::Result<()> {
        self.activates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_cleanup(&self, _scope: &HookScope) -> anyhow::Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// init 时睡眠一段时间
struct SlowInit(Duration);

#[async_trait]
impl LifecycleHooks for SlowInit {
    async fn on_init(&self, _scope: &HookScope, _page: &PageContext) -> anyhow::Result<()> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

/// init 总是失败
struct FailingInit;

#[async_trait]
impl LifecycleHooks for FailingInit {
    async fn on_init(&self, _scope: &HookScope, _page: &PageContext) -> anyhow::Result<()> {
        anyhow::bail!("backend unavailable")
    }
}

fn setup(config: RegistryConfig) -> (Arc<EventBus>, ModuleRegistry) {
    let bus = Arc::new(EventBus::new());
    let registry = ModuleRegistry::new(config, bus.clone());
    (bus, registry)
}

fn module(bus: &Arc<EventBus>, name: &str, version: &str, pattern: &str) -> Arc<Module> {
    module_with(bus, name, version, pattern, Arc::new(CountingHooks::default()))
}

fn module_with(
    bus: &Arc<EventBus>,
    name: &str,
    version: &str,
    pattern: &str,
    hooks: Arc<dyn LifecycleHooks>,
) -> Arc<Module> {
    Arc::new(
        Module::builder(ModuleConfig::new(name, version).pattern(pattern))
            .context(AppContext::new(bus.clone()))
            .hooks(hooks)
            .build()
            .unwrap(),
    )
}

/// 收集指定事件的 `module` 字段
fn collect(bus: &EventBus, event: &str) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.observe(event, move |e| {
        sink.lock()
            .unwrap()
            .push(e.str_field("module").unwrap_or_default().to_string());
    });
    seen
}

// ============================================================================
// 选举
// ============================================================================

#[tokio::test]
async fn test_leaving_all_patterns_clears_active_module() {
    let (bus, registry) = setup(RegistryConfig::default());
    let crm = module(&bus, "crm", "1.0.0", "/crm");
    registry.register(crm.clone(), ModuleSource::Builtin).await.unwrap();

    let deactivated = collect(&bus, names::MODULE_DEACTIVATED);

    let active = registry
        .handle_url_change("https://x.com/crm/contacts", NavigationTrigger::Initial)
        .await;
    assert_eq!(active.as_deref(), Some("crm"));
    assert_eq!(crm.state(), ModuleState::Active);

    let active = registry
        .handle_url_change("https://x.com/home", NavigationTrigger::Navigation)
        .await;
    assert_eq!(active, None);
    assert!(registry.active_module().await.is_none());
    assert_eq!(crm.state(), ModuleState::Inactive);
    assert_eq!(*deactivated.lock().unwrap(), vec!["crm".to_string()]);

    // 仍然不匹配时不会重复停用
    registry
        .handle_url_change("https://x.com/about", NavigationTrigger::Navigation)
        .await;
    assert_eq!(deactivated.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_first_registered_match_wins() {
    let (bus, registry) = setup(RegistryConfig::default());
    registry
        .register(module(&bus, "broad", "1.0.0", "example.com"), ModuleSource::Builtin)
        .await
        .unwrap();
    registry
        .register(module(&bus, "narrow", "1.0.0", "/crm"), ModuleSource::Builtin)
        .await
        .unwrap();

    let active = registry
        .handle_url_change("https://example.com/crm", NavigationTrigger::Initial)
        .await;
    assert_eq!(active.as_deref(), Some("broad"));
    assert_eq!(registry.names().await, vec!["broad", "narrow"]);
}

#[tokio::test]
async fn test_same_module_stays_active_and_receives_activate() {
    let (bus, registry) = setup(RegistryConfig::default());
    let hooks = Arc::new(CountingHooks::default());
    registry
        .register(module_with(&bus, "crm", "1.0.0", "/crm", hooks.clone()), ModuleSource::Builtin)
        .await
        .unwrap();
    let activated = collect(&bus, names::MODULE_ACTIVATED);

    for url in ["https://x.com/crm/1", "https://x.com/crm/2", "https://x.com/crm/3"] {
        registry.handle_url_change(url, NavigationTrigger::Navigation).await;
    }

    assert_eq!(hooks.inits.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.activates.load(Ordering::SeqCst), 2);
    assert_eq!(activated.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_switching_modules_cleans_up_previous() {
    let (bus, registry) = setup(RegistryConfig::default());
    let crm_hooks = Arc::new(CountingHooks::default());
    let crm = module_with(&bus, "crm", "1.0.0", "/crm", crm_hooks.clone());
    let mail = module(&bus, "mail", "1.0.0", "/mail");
    registry.register(crm.clone(), ModuleSource::Builtin).await.unwrap();
    registry.register(mail.clone(), ModuleSource::Builtin).await.unwrap();

    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    registry.set_on_change(Arc::new(move |active| {
        sink.lock().unwrap().push(active.map(str::to_string));
    }));

    registry.handle_url_change("https://x.com/crm", NavigationTrigger::Initial).await;
    registry.handle_url_change("https://x.com/mail", NavigationTrigger::Navigation).await;

    assert_eq!(crm.state(), ModuleState::Inactive);
    assert_eq!(mail.state(), ModuleState::Active);
    assert_eq!(crm_hooks.cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(
        *changes.lock().unwrap(),
        vec![Some("crm".to_string()), Some("mail".to_string())]
    );
    assert_eq!(registry.current_url().await.as_deref(), Some("https://x.com/mail"));
}

#[tokio::test]
async fn test_refresh_reuses_last_url() {
    let (bus, registry) = setup(RegistryConfig::default());
    assert_eq!(registry.refresh().await, None);

    registry.handle_url_change("https://x.com/crm", NavigationTrigger::Initial).await;
    assert_eq!(registry.active_name().await, None);

    registry
        .register(module(&bus, "crm", "1.0.0", "/crm"), ModuleSource::Builtin)
        .await
        .unwrap();
    assert_eq!(registry.refresh().await.as_deref(), Some("crm"));
}

// ============================================================================
// 重名策略
// ============================================================================

#[tokio::test]
async fn test_duplicate_rejected_by_default() {
    let (bus, registry) = setup(RegistryConfig::default());
    let failures = collect(&bus, names::MODULE_REGISTRATION_FAILED);

    registry
        .register(module(&bus, "crm", "1.0.0", "/crm"), ModuleSource::Builtin)
        .await
        .unwrap();
    let result = registry
        .register(module(&bus, "crm", "2.0.0", "/crm"), ModuleSource::Builtin)
        .await;

    assert!(matches!(result, Err(CoreError::ModuleAlreadyRegistered(ref n)) if n == "crm"));
    assert_eq!(registry.len().await, 1);
    assert_eq!(registry.get("crm").await.unwrap().version(), "1.0.0");
    assert_eq!(*failures.lock().unwrap(), vec!["crm".to_string()]);
}

#[tokio::test]
async fn test_duplicate_replaces_when_configured() {
    let config = RegistryConfig {
        duplicate_policy: DuplicatePolicy::Replace,
        ..Default::default()
    };
    let (bus, registry) = setup(config);
    let deactivated = collect(&bus, names::MODULE_DEACTIVATED);

    let replaced = Arc::new(Mutex::new(Vec::new()));
    let sink = replaced.clone();
    bus.observe(names::MODULE_REGISTERED, move |e| {
        sink.lock().unwrap().push(e.data["replaced"].as_bool().unwrap_or(false));
    });

    let v1 = module(&bus, "crm", "1.0.0", "/crm");
    registry.register(v1.clone(), ModuleSource::Builtin).await.unwrap();
    registry.handle_url_change("https://x.com/crm", NavigationTrigger::Initial).await;

    registry
        .register(module(&bus, "crm", "2.0.0", "/crm"), ModuleSource::Builtin)
        .await
        .unwrap();

    assert_eq!(registry.len().await, 1);
    assert_eq!(registry.get("crm").await.unwrap().version(), "2.0.0");
    assert_eq!(v1.state(), ModuleState::Inactive);
    assert_eq!(registry.active_name().await, None);
    assert_eq!(deactivated.lock().unwrap().len(), 1);
    assert_eq!(*replaced.lock().unwrap(), vec![false, true]);

    // 新版本在下一次选举中接管
    assert_eq!(registry.refresh().await.as_deref(), Some("crm"));
    assert_eq!(registry.active_module().await.unwrap().version(), "2.0.0");
}

// ============================================================================
// 卸载与失败
// ============================================================================

#[tokio::test]
async fn test_unload_active_module() {
    let (bus, registry) = setup(RegistryConfig::default());
    let crm = module(&bus, "crm", "1.0.0", "/crm");
    registry.register(crm.clone(), ModuleSource::Builtin).await.unwrap();
    registry.handle_url_change("https://x.com/crm", NavigationTrigger::Initial).await;

    let unloaded = collect(&bus, names::MODULE_UNLOADED);
    registry.unload("crm").await.unwrap();

    assert!(registry.is_empty().await);
    assert_eq!(registry.active_name().await, None);
    assert_eq!(crm.state(), ModuleState::Inactive);
    assert_eq!(*unloaded.lock().unwrap(), vec!["crm".to_string()]);

    assert!(matches!(
        registry.unload("crm").await,
        Err(CoreError::ModuleNotFound(_))
    ));
}

#[tokio::test]
async fn test_init_failure_leaves_no_active_module() {
    let (bus, registry) = setup(RegistryConfig::default());
    registry
        .register(
            module_with(&bus, "crm", "1.0.0", "/crm", Arc::new(FailingInit)),
            ModuleSource::Builtin,
        )
        .await
        .unwrap();

    let phases = Arc::new(Mutex::new(Vec::new()));
    let sink = phases.clone();
    bus.observe(names::MODULE_REGISTRATION_FAILED, move |e| {
        sink.lock().unwrap().push(e.str_field("phase").unwrap_or_default().to_string());
    });

    let active = registry
        .handle_url_change("https://x.com/crm", NavigationTrigger::Initial)
        .await;

    assert_eq!(active, None);
    assert_eq!(*phases.lock().unwrap(), vec!["init".to_string()]);
    let stats = registry.stats().await;
    assert_eq!(stats.init_failures, 1);
    assert_eq!(stats.active_module, None);
    assert_eq!(registry.metrics().phases["init"].failed, 1);
}

// ============================================================================
// 并发导航
// ============================================================================

async fn race(config: RegistryConfig) -> (ModuleRegistry, Arc<Module>) {
    let (bus, registry) = setup(config);
    let slow = module_with(
        &bus,
        "slow",
        "1.0.0",
        "/slow",
        Arc::new(SlowInit(Duration::from_millis(50))),
    );
    registry.register(slow.clone(), ModuleSource::Builtin).await.unwrap();
    registry
        .register(module(&bus, "fast", "1.0.0", "/fast"), ModuleSource::Builtin)
        .await
        .unwrap();

    tokio::join!(
        registry.handle_url_change("https://x.com/slow", NavigationTrigger::Navigation),
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            registry
                .handle_url_change("https://x.com/fast", NavigationTrigger::Navigation)
                .await
        },
    );
    (registry, slow)
}

#[tokio::test]
async fn test_unguarded_stale_init_wins() {
    let (registry, slow) = race(RegistryConfig::default()).await;

    // 没有代际保护时，较慢的旧导航最后写入
    assert_eq!(registry.active_name().await.as_deref(), Some("slow"));
    assert_eq!(slow.state(), ModuleState::Active);
    assert_eq!(registry.current_url().await.as_deref(), Some("https://x.com/fast"));
}

#[tokio::test]
async fn test_generation_guard_discards_stale_init() {
    let config = RegistryConfig {
        generation_guard: true,
        ..Default::default()
    };
    let (registry, slow) = race(config).await;

    assert_eq!(registry.active_name().await.as_deref(), Some("fast"));
    assert_eq!(slow.state(), ModuleState::Inactive);
    assert_eq!(registry.generation(), 2);
    assert_eq!(registry.stats().await.stale_discards, 1);
}

/// 第一次 init 较慢，之后的 init 较快，并注册一个监听器
#[derive(Default)]
struct SlowFirstInit {
    calls: AtomicUsize,
}

#[async_trait]
impl LifecycleHooks for SlowFirstInit {
    async fn on_init(&self, scope: &HookScope, _page: &PageContext) -> anyhow::Result<()> {
        let delay = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 { 80 } else { 10 };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        scope.listen("crm:lookup", |_| Ok(serde_json::Value::Null));
        Ok(())
    }
}

#[tokio::test]
async fn test_generation_guard_keeps_module_installed_by_newer_navigation() {
    let config = RegistryConfig {
        generation_guard: true,
        ..Default::default()
    };
    let (bus, registry) = setup(config);
    let crm = module_with(&bus, "crm", "1.0.0", "/crm", Arc::new(SlowFirstInit::default()));
    registry.register(crm.clone(), ModuleSource::Builtin).await.unwrap();

    tokio::join!(
        registry.handle_url_change("https://x.com/crm/1", NavigationTrigger::Navigation),
        async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            registry
                .handle_url_change("https://x.com/crm/2", NavigationTrigger::Navigation)
                .await
        },
    );

    // 较新的导航先完成并装入 crm，过期的 init 不能再把它清理掉
    assert_eq!(registry.active_name().await.as_deref(), Some("crm"));
    assert_eq!(crm.state(), ModuleState::Active);
    assert!(crm.is_active());
    assert!(bus.has_subscribers("crm:lookup"));
    assert_eq!(registry.stats().await.stale_discards, 1);
}
