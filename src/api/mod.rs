//! API 模块
//!
//! 对外提供的 SDK 接口。
//!
//! # 示例
//!
//! ```rust,no_run
//! use agentlet_core::{AgentletCore, CoreConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoreConfig::builder()
//!         .log_level("info")
//!         .generation_guard(true)
//!         .build();
//!
//!     let mut core = AgentletCore::new(config).await?;
//!     core.start().await?;
//!     Ok(())
//! }
//! ```

pub mod sdk;

// 重导出主要类型
pub use sdk::{AgentletCore, AgentletCoreBuilder, CoreState, CoreStats, HealthInfo};
