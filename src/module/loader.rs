//! 远程模块加载器
//!
//! 加载流程：
//!
//! 1. 通过 [`SourceFetcher`] 拉取源码（LRU 缓存）
//! 2. [`SecurityGate`] 校验，未通过则发出 `module:registrationFailed` 并返回，不求值
//! 3. 通过 [`SourceEvaluator`] 求值，求值过程中模块经 `ModuleRegistry::register` 自行注册
//! 4. 可选：按最近一次的 URL 重新选举活动模块

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::core::config::LoaderConfig;
use crate::event::names;
use crate::module::agentlet::{AgentletModule, AppContext, Module};
use crate::module::lifecycle::LifecycleHooks;
use crate::module::metadata::{ModuleConfig, ModuleSource};
use crate::module::parser::ModuleParser;
use crate::module::registry::ModuleRegistry;
use crate::module::security::SecurityGate;
use crate::utils::{CoreError, Result};

/// 源码拉取
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// 基于 reqwest 的 HTTP 拉取
#[derive(Debug, Clone)]
pub struct HttpSourceFetcher {
    client: reqwest::Client,
}

impl HttpSourceFetcher {
    /// 按加载器配置创建
    pub fn new(config: &LoaderConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(config.user_agent.clone());
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder
            .build()
            .map_err(|e| CoreError::InitFailed(format!("HTTP 客户端创建失败: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let fetch_error = |e: reqwest::Error| CoreError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(fetch_error)?;
        response.text().await.map_err(fetch_error)
    }
}

/// 求值环境
pub struct EvaluationEnv<'a> {
    /// 源码地址
    pub origin: &'a str,
    /// 模块注册入口
    pub registry: &'a ModuleRegistry,
    /// 新模块使用的外部协作者
    pub context: &'a AppContext,
}

/// 源码求值
///
/// 求值结果是若干模块，它们通过 `env.registry.register` 自行注册。
/// 返回注册成功的模块名。
#[async_trait]
pub trait SourceEvaluator: Send + Sync {
    async fn evaluate(&self, source: &str, env: &EvaluationEnv<'_>) -> Result<Vec<String>>;
}

/// 清单求值器
///
/// 源码是 YAML/JSON 模块清单（单个对象或数组）。
/// 钩子不能通过清单传输，由宿主按模块名预先绑定。
#[derive(Default)]
pub struct ManifestEvaluator {
    hooks: HashMap<String, Arc<dyn LifecycleHooks>>,
}

impl ManifestEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为指定模块名绑定钩子
    pub fn with_hooks(mut self, module: impl Into<String>, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks.insert(module.into(), hooks);
        self
    }

    /// 解析清单
    pub fn parse(origin: &str, source: &str) -> Result<Vec<ModuleConfig>> {
        let evaluation_error = |reason: String| CoreError::Evaluation {
            origin: origin.to_string(),
            reason,
        };

        let value: serde_yaml::Value =
            serde_yaml::from_str(source).map_err(|e| evaluation_error(e.to_string()))?;
        let configs: Vec<ModuleConfig> = match value {
            serde_yaml::Value::Sequence(_) => serde_yaml::from_value(value),
            other => serde_yaml::from_value(other).map(|c| vec![c]),
        }
        .map_err(|e| evaluation_error(e.to_string()))?;

        if configs.is_empty() {
            return Err(evaluation_error("清单中没有模块".to_string()));
        }
        for config in &configs {
            ModuleParser::validate(config)?;
        }
        Ok(configs)
    }
}

#[async_trait]
impl SourceEvaluator for ManifestEvaluator {
    async fn evaluate(&self, source: &str, env: &EvaluationEnv<'_>) -> Result<Vec<String>> {
        let configs = Self::parse(env.origin, source)?;

        // 先构建全部模块，构建失败时不注册任何模块
        let modules = configs
            .into_iter()
            .map(|config| {
                let hooks = self.hooks.get(&config.name).cloned();
                let mut builder = Module::builder(config).context(env.context.clone());
                if let Some(hooks) = hooks {
                    builder = builder.hooks(hooks);
                }
                builder.build().map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut registered = Vec::with_capacity(modules.len());
        for module in modules {
            let name = module.name().to_string();
            env.registry
                .register(
                    module,
                    ModuleSource::Remote {
                        url: env.origin.to_string(),
                    },
                )
                .await?;
            registered.push(name);
        }
        Ok(registered)
    }
}

/// 加载选项
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// 忽略缓存重新拉取
    pub force_refresh: bool,
    /// 加载后按最近一次的 URL 重新选举
    pub reelect: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            force_refresh: false,
            reelect: true,
        }
    }
}

/// 加载器统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoaderStats {
    /// 实际发起的拉取次数
    pub fetches: u64,
    /// 缓存命中次数
    pub cache_hits: u64,
    /// 安全校验拒绝次数
    pub rejected: u64,
    /// 当前缓存条目数
    pub cached: usize,
}

/// 远程模块加载器
pub struct RemoteLoader {
    fetcher: Arc<dyn SourceFetcher>,
    evaluator: Arc<dyn SourceEvaluator>,
    gate: SecurityGate,
    cache: Mutex<LruCache<String, Arc<str>>>,
    registry: Arc<ModuleRegistry>,
    context: AppContext,
    fetches: AtomicU64,
    cache_hits: AtomicU64,
    rejected: AtomicU64,
}

impl RemoteLoader {
    /// 使用默认的 HTTP 拉取与清单求值创建
    pub fn new(registry: Arc<ModuleRegistry>, context: AppContext, config: &LoaderConfig) -> Result<Self> {
        let fetcher = Arc::new(HttpSourceFetcher::new(config)?);
        Ok(Self::with_parts(
            registry,
            context,
            config.cache_capacity,
            fetcher,
            Arc::new(ManifestEvaluator::new()),
        ))
    }

    /// 指定拉取与求值实现
    pub fn with_parts(
        registry: Arc<ModuleRegistry>,
        context: AppContext,
        cache_capacity: usize,
        fetcher: Arc<dyn SourceFetcher>,
        evaluator: Arc<dyn SourceEvaluator>,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            fetcher,
            evaluator,
            gate: SecurityGate::new(),
            cache: Mutex::new(LruCache::new(capacity)),
            registry,
            context,
            fetches: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// 替换求值器
    pub fn with_evaluator(mut self, evaluator: Arc<dyn SourceEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// 替换安全校验器
    pub fn with_gate(mut self, gate: SecurityGate) -> Self {
        self.gate = gate;
        self
    }

    /// 从 URL 加载模块，返回注册的模块名
    pub async fn load_from_url(&self, url: &str, options: LoadOptions) -> Result<Vec<String>> {
        info!(url = %url, "开始加载远程模块");
        let start = Instant::now();

        let result = self.load_inner(url, options).await;
        let elapsed = start.elapsed().as_micros() as u64;
        self.registry.record_remote_load(result.is_ok(), elapsed);

        match &result {
            Ok(modules) => {
                info!(url = %url, modules = ?modules, duration_us = elapsed, "远程模块加载完成");
            }
            Err(e) => {
                warn!(url = %url, error = %e, "远程模块加载失败");
            }
        }
        result
    }

    async fn load_inner(&self, url: &str, options: LoadOptions) -> Result<Vec<String>> {
        let source = match self.source(url, options.force_refresh).await {
            Ok(source) => source,
            Err(e) => {
                self.report_failure(url, "fetch", &e);
                return Err(e);
            }
        };

        if let Err(e) = self.gate.validate(url, &source) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            self.report_failure(url, "security", &e);
            return Err(e);
        }

        let env = EvaluationEnv {
            origin: url,
            registry: &self.registry,
            context: &self.context,
        };
        let registrations = self.registry.registrations();
        let result = self.evaluator.evaluate(&source, &env).await;

        // 清单中靠前的模块可能已注册成功
        if options.reelect && (result.is_ok() || self.registry.registrations() != registrations) {
            self.registry.refresh().await;
        }

        result.inspect_err(|e| {
            // 重名已由注册表上报
            if !matches!(e, CoreError::ModuleAlreadyRegistered(_)) {
                self.report_failure(url, "evaluate", e);
            }
        })
    }

    /// 读取源码（优先缓存）
    async fn source(&self, url: &str, force_refresh: bool) -> Result<Arc<str>> {
        if !force_refresh {
            let cached = self
                .cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(url)
                .cloned();
            if let Some(source) = cached {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(url = %url, "远程源码缓存命中");
                return Ok(source);
            }
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let source: Arc<str> = self.fetcher.fetch(url).await?.into();
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(url.to_string(), source.clone());
        Ok(source)
    }

    fn report_failure(&self, url: &str, phase: &str, error: &CoreError) {
        self.registry.event_bus().emit(
            names::MODULE_REGISTRATION_FAILED,
            json!({
                "url": url,
                "phase": phase,
                "code": error.error_code(),
                "error": error.to_string(),
            }),
        );
    }

    /// 清空源码缓存
    pub fn clear_cache(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(entries = cache.len(), "清空远程源码缓存");
        cache.clear();
    }

    /// 统计信息
    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cached: self.cache.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }
}

impl std::fmt::Debug for RemoteLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteLoader")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RegistryConfig;
    use crate::event::EventBus;
    use crate::module::metadata::NavigationTrigger;
    use std::sync::atomic::AtomicUsize;

    /// 内存拉取，记录调用次数
    struct MapFetcher {
        sources: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl MapFetcher {
        fn new(entries: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                sources: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SourceFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sources.get(url).cloned().ok_or_else(|| CoreError::Fetch {
                url: url.to_string(),
                reason: "404".to_string(),
            })
        }
    }

    /// 记录是否被调用的求值器
    #[derive(Default)]
    struct SpyEvaluator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SourceEvaluator for SpyEvaluator {
        async fn evaluate(&self, _source: &str, _env: &EvaluationEnv<'_>) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    const CRM: &str = "name: crm\nversion: 1.0.0\npatterns: [\"/crm\"]\n";

    fn loader(fetcher: Arc<MapFetcher>) -> (RemoteLoader, Arc<ModuleRegistry>) {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(ModuleRegistry::new(RegistryConfig::default(), bus.clone()));
        let loader = RemoteLoader::with_parts(
            registry.clone(),
            AppContext::new(bus),
            4,
            fetcher,
            Arc::new(ManifestEvaluator::new()),
        );
        (loader, registry)
    }

    #[tokio::test]
    async fn test_load_registers_and_reelects() {
        let fetcher = MapFetcher::new(&[("https://cdn/crm.yaml", CRM)]);
        let (loader, registry) = loader(fetcher);
        registry.handle_url_change("/crm/1", NavigationTrigger::Initial).await;

        let modules = loader
            .load_from_url("https://cdn/crm.yaml", LoadOptions::default())
            .await
            .unwrap();
        assert_eq!(modules, vec!["crm"]);
        assert_eq!(registry.active_name().await.as_deref(), Some("crm"));
        assert_eq!(registry.stats().await.remote, 1);
    }

    #[tokio::test]
    async fn test_cache_and_clear() {
        let fetcher = MapFetcher::new(&[("u", "[]")]);
        let (loader, _) = loader(fetcher.clone());
        let loader = loader.with_evaluator(Arc::new(SpyEvaluator::default()));

        for _ in 0..2 {
            loader.load_from_url("u", LoadOptions::default()).await.unwrap();
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(loader.stats().cache_hits, 1);

        loader.clear_cache();
        loader.load_from_url("u", LoadOptions::default()).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        let forced = LoadOptions {
            force_refresh: true,
            ..Default::default()
        };
        loader.load_from_url("u", forced).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_security_rejection_skips_evaluation() {
        let fetcher = MapFetcher::new(&[("evil", "name: x\nhtml: \"<script>alert(1)</script>\"\n")]);
        let (loader, registry) = loader(fetcher);
        let spy = Arc::new(SpyEvaluator::default());
        let loader = loader.with_evaluator(spy.clone());

        let failures = Arc::new(Mutex::new(Vec::new()));
        let f = failures.clone();
        registry
            .event_bus()
            .observe(names::MODULE_REGISTRATION_FAILED, move |e| {
                f.lock().unwrap().push(e.data["phase"].clone());
            });

        let result = loader.load_from_url("evil", LoadOptions::default()).await;
        assert!(matches!(result, Err(CoreError::SecurityValidation { .. })));
        assert_eq!(spy.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*failures.lock().unwrap(), vec![json!("security")]);
        assert_eq!(loader.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure() {
        let (loader, registry) = loader(MapFetcher::new(&[]));
        let result = loader.load_from_url("missing", LoadOptions::default()).await;
        assert!(matches!(result, Err(CoreError::Fetch { .. })));
        assert_eq!(registry.metrics().phases["remote_load"].failed, 1);
    }

    #[test]
    fn test_manifest_parse_list_and_errors() {
        let list = "- name: a\n  version: 1.0.0\n  patterns: [a]\n- name: b\n  version: 1.0.0\n  patterns: [b]\n";
        assert_eq!(ManifestEvaluator::parse("o", list).unwrap().len(), 2);

        assert!(matches!(
            ManifestEvaluator::parse("o", "[]"),
            Err(CoreError::Evaluation { .. })
        ));
        assert!(matches!(
            ManifestEvaluator::parse("o", "name: a\nversion: bad\npatterns: [a]\n"),
            Err(CoreError::ConfigValidation { .. })
        ));
        assert!(matches!(
            ManifestEvaluator::parse("o", "just a string"),
            Err(CoreError::Evaluation { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_remote_module_rejected() {
        let fetcher = MapFetcher::new(&[("one", CRM), ("two", CRM)]);
        let (loader, registry) = loader(fetcher);
        let failures = Arc::new(AtomicUsize::new(0));
        let f = failures.clone();
        registry
            .event_bus()
            .observe(names::MODULE_REGISTRATION_FAILED, move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            });

        loader.load_from_url("one", LoadOptions::default()).await.unwrap();
        let result = loader.load_from_url("two", LoadOptions::default()).await;
        assert!(matches!(result, Err(CoreError::ModuleAlreadyRegistered(_))));
        // 只上报一次
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_bundle_still_reelects() {
        let bundle = "- name: billing\n  version: 1.0.0\n  patterns: [\"/billing\"]\n\
                      - name: crm\n  version: 2.0.0\n  patterns: [\"/crm\"]\n";
        let fetcher = MapFetcher::new(&[("one", CRM), ("bundle", bundle)]);
        let (loader, registry) = loader(fetcher);
        registry.handle_url_change("/billing/7", NavigationTrigger::Initial).await;
        loader.load_from_url("one", LoadOptions::default()).await.unwrap();
        assert_eq!(registry.active_name().await, None);

        let result = loader.load_from_url("bundle", LoadOptions::default()).await;
        assert!(matches!(result, Err(CoreError::ModuleAlreadyRegistered(_))));

        // billing 在 crm 重名之前已注册，仍会参与重新选举
        assert_eq!(registry.names().await, vec!["crm", "billing"]);
        assert_eq!(registry.active_name().await.as_deref(), Some("billing"));
        assert_eq!(registry.stats().await.registrations, 2);
    }
}
