//! 事件总线集成测试
//!
//! 测试模块间通过事件总线协作：
//! - 发布/订阅与单响应者请求
//! - 模块监听器随生命周期释放
//! - 并发发布

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agentlet_core::core::config::RegistryConfig;
use agentlet_core::event::{names, EventBus};
use agentlet_core::module::{
    AgentletModule, AppContext, HookScope, LifecycleHooks, Module, ModuleConfig, ModuleRegistry,
    ModuleSource, NavigationTrigger, PageContext,
};
use agentlet_core::CoreError;
use async_trait::async_trait;
use serde_json::{json, Value};

/// 提供联系人查询服务
struct DirectoryHooks;

#[async_trait]
impl LifecycleHooks for DirectoryHooks {
    async fn on_init(&self, scope: &HookScope, _page: &PageContext) -> anyhow::Result<()> {
        scope.listen("directory:lookup", |e| {
            let id = e.data["id"].as_u64().unwrap_or_default();
            Ok(json!({ "id": id, "name": format!("contact-{}", id) }))
        });
        Ok(())
    }
}

/// 在 init 时向其他模块请求数据，并把结果存入页面分析
struct ConsumerHooks;

#[async_trait]
impl LifecycleHooks for ConsumerHooks {
    async fn analyze_page(
        &self,
        scope: &HookScope,
        _page: &PageContext,
    ) -> anyhow::Result<Option<Value>> {
        let contact = scope.request("directory:lookup", json!({ "id": 7 }))?;
        Ok(Some(contact))
    }
}

fn build(bus: &Arc<EventBus>, name: &str, pattern: &str, hooks: Arc<dyn LifecycleHooks>) -> Arc<Module> {
    Arc::new(
        Module::builder(ModuleConfig::new(name, "1.0.0").pattern(pattern))
            .context(AppContext::new(bus.clone()))
            .hooks(hooks)
            .build()
            .unwrap(),
    )
}

#[test]
fn test_emit_and_request_semantics() {
    let bus = EventBus::new();

    assert!(matches!(
        bus.request("ui:confirm", json!({})),
        Err(CoreError::NoResponder(_))
    ));

    let calls = Arc::new(AtomicUsize::new(0));
    let c1 = calls.clone();
    bus.on("ui:confirm", move |_| {
        c1.fetch_add(1, Ordering::SeqCst);
        Ok(json!("first"))
    });
    let c2 = calls.clone();
    bus.on("ui:confirm", move |_| {
        c2.fetch_add(1, Ordering::SeqCst);
        Ok(json!("second"))
    });

    assert_eq!(bus.request("ui:confirm", json!({})).unwrap(), json!("first"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(bus.emit("ui:confirm", json!({})), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let stats = bus.stats();
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.emitted, 1);
}

#[tokio::test]
async fn test_modules_cooperate_through_requests() {
    let bus = Arc::new(EventBus::new());
    let registry = ModuleRegistry::new(RegistryConfig::default(), bus.clone());

    let directory = build(&bus, "directory", "/app", Arc::new(DirectoryHooks));
    let consumer = build(&bus, "consumer", "/app/consumer", Arc::new(ConsumerHooks));
    registry.register(directory.clone(), ModuleSource::Builtin).await.unwrap();
    registry.register(consumer.clone(), ModuleSource::Builtin).await.unwrap();

    // directory 先被激活并注册监听器
    registry.handle_url_change("https://x.com/app", NavigationTrigger::Initial).await;
    assert_eq!(directory.scope().listener_count(), 1);

    // 宿主也可以直接请求 directory 的服务
    assert_eq!(
        bus.request("directory:lookup", json!({ "id": 3 })).unwrap()["name"],
        "contact-3"
    );

    // consumer 作为独立模块初始化时可以访问 directory 的服务
    consumer.init(&PageContext::new("https://x.com/app/consumer")).await.unwrap();
    let analysis = consumer.metadata().page_analysis.unwrap();
    assert_eq!(analysis["name"], "contact-7");
    consumer.cleanup().await;

    // 离开后 directory 的监听器被释放
    registry.handle_url_change("https://x.com/home", NavigationTrigger::Navigation).await;
    assert_eq!(directory.scope().listener_count(), 0);
    assert!(!bus.has_subscribers("directory:lookup"));
}

#[tokio::test]
async fn test_init_failure_from_missing_responder() {
    let bus = Arc::new(EventBus::new());
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    bus.observe(names::ERROR, move |e| {
        sink.lock().unwrap().push(e.data.clone());
    });

    let consumer = build(&bus, "consumer", "/consumer", Arc::new(ConsumerHooks));
    let result = consumer.init(&PageContext::new("https://x.com/consumer")).await;

    assert!(matches!(
        result,
        Err(CoreError::LifecycleHook { ref phase, .. }) if phase == "init"
    ));
    assert!(!consumer.is_active());

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["module"], "consumer");
    assert_eq!(errors[0]["phase"], "init");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_emits() {
    let bus = Arc::new(EventBus::new());
    let received = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let r = received.clone();
        bus.observe("tick", move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
    }

    let mut handles = Vec::new();
    for i in 0..8 {
        let bus = bus.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..25 {
                bus.emit("tick", json!({ "task": i, "seq": j }));
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(received.load(Ordering::SeqCst), 8 * 25 * 3);
    assert_eq!(bus.stats().emitted, 200);
    assert_eq!(bus.stats().delivered, 600);
}
