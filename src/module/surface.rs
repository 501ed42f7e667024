//! 渲染表面
//!
//! 内核本身不操作 DOM。模块声明的样式通过 [`RenderSurface`] 交给宿主注入和移除。

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// 宿主提供的渲染表面
pub trait RenderSurface: Send + Sync {
    /// 注入样式，`owner` 为模块名
    fn inject_styles(&self, owner: &str, css: &str) -> anyhow::Result<()>;

    /// 移除 `owner` 注入的样式
    fn remove_styles(&self, owner: &str);
}

/// 空实现
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSurface;

impl RenderSurface for NoopSurface {
    fn inject_styles(&self, _owner: &str, _css: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn remove_styles(&self, _owner: &str) {}
}

/// 内存实现，记录当前注入的样式（CLI 模拟和测试使用）
#[derive(Debug, Default)]
pub struct MemorySurface {
    styles: Mutex<BTreeMap<String, String>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前注入的样式
    pub fn injected(&self) -> BTreeMap<String, String> {
        self.styles.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// 指定 owner 是否有样式
    pub fn has_styles(&self, owner: &str) -> bool {
        self.styles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(owner)
    }
}

impl RenderSurface for MemorySurface {
    fn inject_styles(&self, owner: &str, css: &str) -> anyhow::Result<()> {
        self.styles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(owner.to_string(), css.to_string());
        Ok(())
    }

    fn remove_styles(&self, owner: &str) {
        self.styles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_surface() {
        let surface = MemorySurface::new();
        surface.inject_styles("crm", ".crm { color: red }").unwrap();
        assert!(surface.has_styles("crm"));

        surface.remove_styles("crm");
        surface.remove_styles("crm");
        assert!(surface.injected().is_empty());
    }
}
