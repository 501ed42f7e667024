//! 事件模块
//!
//! - 事件数据结构与内核事件名
//! - 同步事件总线（emit / on / off / request）

#[allow(clippy::module_inception)]
pub mod event;
pub mod event_bus;

// 重导出常用类型
pub use event::{error_payload, names, Event};
pub use event_bus::{DispatchStats, EventBus, EventHandler};
