//! 性能监控
//!
//! 收集生命周期各阶段（init / activate / cleanup / render / remote-load）的
//! 调用次数、成功率与耗时分布，并导出可序列化的报告。
//!
//! # 示例
//!
//! ```rust
//! use agentlet_core::utils::metrics::{LifecycleMetrics, Phase};
//!
//! let metrics = LifecycleMetrics::new();
//! metrics.record(Phase::Init, true, 1500); // 成功，耗时 1500 微秒
//!
//! let report = metrics.export();
//! assert_eq!(report.phases["init"].total, 1);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// 延迟样本的最大数量（防止内存无限增长）
const MAX_LATENCY_SAMPLES: usize = 10_000;

// ============================================================================
// MetricsCollector - 单一指标收集器
// ============================================================================

/// 指标收集器
///
/// 计数器使用 `AtomicU64`，延迟样本使用 `Mutex<Vec<u64>>` 保护。
#[derive(Debug)]
pub struct MetricsCollector {
    total_count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    total_latency_us: AtomicU64,
    min_latency_us: AtomicU64,
    max_latency_us: AtomicU64,

    /// 延迟样本 - 用于计算百分位数
    latency_samples: Mutex<Vec<u64>>,
}

impl MetricsCollector {
    /// 创建新的指标收集器
    pub fn new() -> Self {
        Self {
            total_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            min_latency_us: AtomicU64::new(u64::MAX),
            max_latency_us: AtomicU64::new(0),
            latency_samples: Mutex::new(Vec::with_capacity(256)),
        }
    }

    /// 记录一次调用
    pub fn record(&self, success: bool, latency_us: u64) {
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us.fetch_add(latency_us, Ordering::Relaxed);

        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }

        self.min_latency_us.fetch_min(latency_us, Ordering::Relaxed);
        self.max_latency_us.fetch_max(latency_us, Ordering::Relaxed);

        if let Ok(mut samples) = self.latency_samples.lock() {
            // 滑动窗口：超限时丢弃前半部分
            if samples.len() >= MAX_LATENCY_SAMPLES {
                let half = samples.len() / 2;
                samples.drain(0..half);
            }
            samples.push(latency_us);
        }
    }

    /// 计算指定百分位数的延迟（微秒），没有样本时返回 0
    pub fn percentile(&self, p: f64) -> u64 {
        let p = p.clamp(0.0, 1.0);

        match self.latency_samples.lock() {
            Ok(samples) if !samples.is_empty() => {
                let mut sorted = samples.clone();
                sorted.sort_unstable();

                // 最近等级法
                let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
                sorted[idx.min(sorted.len() - 1)]
            }
            _ => 0,
        }
    }

    /// 平均延迟（微秒）
    pub fn average_latency(&self) -> u64 {
        let total = self.total_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        self.total_latency_us.load(Ordering::Relaxed) / total
    }

    /// 调用总数
    pub fn total(&self) -> u64 {
        self.total_count.load(Ordering::Relaxed)
    }

    /// 失败次数
    pub fn failures(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// 成功率（没有调用时为 1.0）
    pub fn success_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 1.0;
        }
        self.success_count.load(Ordering::Relaxed) as f64 / total as f64
    }

    /// 导出当前快照
    pub fn snapshot(&self) -> PhaseReport {
        let min = self.min_latency_us.load(Ordering::Relaxed);
        PhaseReport {
            total: self.total(),
            successful: self.success_count.load(Ordering::Relaxed),
            failed: self.failures(),
            success_rate: self.success_rate(),
            avg_latency_us: self.average_latency(),
            min_latency_us: if min == u64::MAX { 0 } else { min },
            max_latency_us: self.max_latency_us.load(Ordering::Relaxed),
            p50_latency_us: self.percentile(0.50),
            p95_latency_us: self.percentile(0.95),
        }
    }

    /// 重置所有统计数据
    pub fn reset(&self) {
        self.total_count.store(0, Ordering::Relaxed);
        self.success_count.store(0, Ordering::Relaxed);
        self.failure_count.store(0, Ordering::Relaxed);
        self.total_latency_us.store(0, Ordering::Relaxed);
        self.min_latency_us.store(u64::MAX, Ordering::Relaxed);
        self.max_latency_us.store(0, Ordering::Relaxed);

        if let Ok(mut samples) = self.latency_samples.lock() {
            samples.clear();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// LifecycleMetrics - 按阶段聚合
// ============================================================================

/// 被计时的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// 模块初始化
    Init,
    /// URL 更新 / 激活
    Activate,
    /// 清理
    Cleanup,
    /// 内容生成
    Render,
    /// 远程加载
    RemoteLoad,
}

impl Phase {
    /// 阶段名称
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Activate => "activate",
            Phase::Cleanup => "cleanup",
            Phase::Render => "render",
            Phase::RemoteLoad => "remote_load",
        }
    }

    const ALL: [Phase; 5] = [
        Phase::Init,
        Phase::Activate,
        Phase::Cleanup,
        Phase::Render,
        Phase::RemoteLoad,
    ];
}

/// 生命周期指标
#[derive(Debug)]
pub struct LifecycleMetrics {
    init: MetricsCollector,
    activate: MetricsCollector,
    cleanup: MetricsCollector,
    render: MetricsCollector,
    remote_load: MetricsCollector,
    start_time: DateTime<Utc>,
}

impl LifecycleMetrics {
    /// 创建新的生命周期指标
    pub fn new() -> Self {
        Self {
            init: MetricsCollector::new(),
            activate: MetricsCollector::new(),
            cleanup: MetricsCollector::new(),
            render: MetricsCollector::new(),
            remote_load: MetricsCollector::new(),
            start_time: Utc::now(),
        }
    }

    /// 获取阶段对应的收集器
    pub fn phase(&self, phase: Phase) -> &MetricsCollector {
        match phase {
            Phase::Init => &self.init,
            Phase::Activate => &self.activate,
            Phase::Cleanup => &self.cleanup,
            Phase::Render => &self.render,
            Phase::RemoteLoad => &self.remote_load,
        }
    }

    /// 记录一次阶段调用
    pub fn record(&self, phase: Phase, success: bool, latency_us: u64) {
        self.phase(phase).record(success, latency_us);
    }

    /// 导出报告
    pub fn export(&self) -> MetricsReport {
        let now = Utc::now();
        MetricsReport {
            timestamp: now,
            uptime_seconds: now.signed_duration_since(self.start_time).num_seconds().max(0) as u64,
            phases: Phase::ALL
                .iter()
                .map(|p| (p.as_str().to_string(), self.phase(*p).snapshot()))
                .collect(),
        }
    }

    /// 重置所有阶段
    pub fn reset(&self) {
        for phase in Phase::ALL {
            self.phase(phase).reset();
        }
    }
}

impl Default for LifecycleMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 报告结构
// ============================================================================

/// 单个阶段的统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    /// 调用总数
    pub total: u64,
    /// 成功次数
    pub successful: u64,
    /// 失败次数
    pub failed: u64,
    /// 成功率（0.0 到 1.0）
    pub success_rate: f64,
    /// 平均延迟（微秒）
    pub avg_latency_us: u64,
    /// 最小延迟（微秒）
    pub min_latency_us: u64,
    /// 最大延迟（微秒）
    pub max_latency_us: u64,
    /// P50 延迟（微秒）
    pub p50_latency_us: u64,
    /// P95 延迟（微秒）
    pub p95_latency_us: u64,
}

/// 完整的监控报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    /// 报告生成时间
    pub timestamp: DateTime<Utc>,
    /// 运行时长（秒）
    pub uptime_seconds: u64,
    /// 各阶段统计
    pub phases: BTreeMap<String, PhaseReport>,
}

impl MetricsReport {
    /// 序列化为格式化的 JSON 字符串
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
