//! 日志系统与生命周期指标集成测试
//!
//! 测试日志文件输出，以及内核运行过程中各阶段指标的收集与导出

use std::sync::Arc;
use std::thread;

use agentlet_core::utils::metrics::{LifecycleMetrics, MetricsReport, Phase};
use agentlet_core::{
    AgentletCore, CoreConfig, Logger, LoggerConfig, ModuleConfig, PageContext, RotationStrategy,
};
use tempfile::TempDir;

// ============================================================================
// 日志测试
// ============================================================================

/// 测试日志写入文件（本测试二进制中唯一初始化全局日志的地方）
#[test]
fn test_file_logging() {
    let temp_dir = TempDir::new().unwrap();
    let config = LoggerConfig::builder()
        .level("info")
        .console_output(false)
        .file_output(temp_dir.path())
        .file_prefix("agentlet-test")
        .rotation(RotationStrategy::Never)
        .build();

    let guard = Logger::init(config).unwrap();
    tracing::info!(module = "crm", "文件日志测试");
    drop(guard);

    let content = std::fs::read_to_string(temp_dir.path().join("agentlet-test.log")).unwrap();
    assert!(content.contains("文件日志测试"));
    assert!(content.contains("crm"));

    // 重复初始化失败，try_init 不会失败
    assert!(Logger::init(LoggerConfig::default()).is_err());
    let _guard = Logger::try_init(LoggerConfig::default());
}

// ============================================================================
// 指标测试
// ============================================================================

/// 测试并发记录
#[test]
fn test_concurrent_phase_recording() {
    let metrics = Arc::new(LifecycleMetrics::new());
    let mut handles = vec![];

    for _ in 0..8 {
        let m = metrics.clone();
        handles.push(thread::spawn(move || {
            for j in 0..100 {
                m.record(Phase::Activate, j % 4 != 0, 50 + j);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let report = metrics.export();
    let activate = &report.phases["activate"];
    assert_eq!(activate.total, 800);
    assert_eq!(activate.failed, 200);
    assert!((activate.success_rate - 0.75).abs() < 1e-9);
    assert_eq!(activate.min_latency_us, 50);
    assert_eq!(activate.max_latency_us, 149);
}

/// 测试内核运行时的阶段指标
#[tokio::test]
async fn test_core_records_lifecycle_phases() {
    let mut core = AgentletCore::new(CoreConfig::default()).await.unwrap();
    core.start().await.unwrap();

    for (name, pattern) in [("crm", "/crm"), ("mail", "/mail")] {
        let module = core
            .module_builder(ModuleConfig::new(name, "1.0.0").pattern(pattern))
            .build()
            .unwrap();
        core.register_module(module).await.unwrap();
    }

    for url in ["https://x.com/crm/1", "https://x.com/crm/2", "https://x.com/mail"] {
        core.navigate(url).await.unwrap();
        core.content(&PageContext::new(url)).await;
    }

    let report = core.metrics();
    assert_eq!(report.phases["init"].total, 2);
    // crm 内部刷新一次，离开时再通知一次
    assert_eq!(report.phases["activate"].total, 2);
    assert_eq!(report.phases["cleanup"].total, 1);
    assert_eq!(report.phases["render"].total, 3);
    assert_eq!(report.phases["remote_load"].total, 0);

    let metadata = core.module_metadata("crm").await.unwrap();
    assert_eq!(metadata.timings.activate_count, 2);
    assert!(metadata.timings.init_us.is_some());

    // 导出的报告可以被外部工具读取
    let json = report.to_json_pretty().unwrap();
    let parsed: MetricsReport = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.phases["render"].total, 3);

    core.shutdown().await.unwrap();
}
