//! URL 模式匹配
//!
//! 每个模块持有一个 [`PatternMatcher`]，决定当前 URL 是否属于该模块。
//!
//! | 模式 | 规则 |
//! |------|------|
//! | `includes` | 任一模式是 URL 的子串 |
//! | `exact` | URL 与任一模式完全相同 |
//! | `regex` | 任一正则匹配 URL（构造时编译，非法正则记录警告后跳过） |
//! | `custom` | 调用注入的谓词 `(url, patterns) -> bool` |
//!
//! 匹配永远不会 panic，也不会向调用方返回错误。

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// 匹配模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// 子串匹配
    #[default]
    Includes,
    /// 正则匹配
    Regex,
    /// 完全相等
    Exact,
    /// 自定义谓词
    Custom,
}

impl MatchMode {
    /// 模式名称
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Includes => "includes",
            MatchMode::Regex => "regex",
            MatchMode::Exact => "exact",
            MatchMode::Custom => "custom",
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 自定义匹配谓词
pub type CustomMatcher = Arc<dyn Fn(&str, &[String]) -> bool + Send + Sync>;

/// URL 模式匹配器
#[derive(Clone)]
pub struct PatternMatcher {
    patterns: Vec<String>,
    mode: MatchMode,
    compiled: Vec<Regex>,
    custom: Option<CustomMatcher>,
}

impl PatternMatcher {
    /// 创建匹配器
    ///
    /// `regex` 模式下在这里一次性编译所有模式。
    pub fn new(patterns: Vec<String>, mode: MatchMode) -> Self {
        let compiled = if mode == MatchMode::Regex {
            Self::compile(&patterns)
        } else {
            Vec::new()
        };

        Self {
            patterns,
            mode,
            compiled,
            custom: None,
        }
    }

    /// 设置自定义谓词（仅 `custom` 模式使用）
    pub fn with_custom(mut self, matcher: CustomMatcher) -> Self {
        self.custom = Some(matcher);
        self
    }

    fn compile(patterns: &[String]) -> Vec<Regex> {
        patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "正则模式无效，已跳过");
                    None
                }
            })
            .collect()
    }

    /// 判断 URL 是否匹配
    pub fn matches(&self, url: &str) -> bool {
        match self.mode {
            MatchMode::Includes => self.patterns.iter().any(|p| url.contains(p.as_str())),
            MatchMode::Exact => self.patterns.iter().any(|p| p == url),
            MatchMode::Regex => self.compiled.iter().any(|re| re.is_match(url)),
            MatchMode::Custom => self.matches_custom(url),
        }
    }

    fn matches_custom(&self, url: &str) -> bool {
        let Some(predicate) = &self.custom else {
            return false;
        };

        catch_unwind(AssertUnwindSafe(|| predicate(url, &self.patterns))).unwrap_or_else(|_| {
            warn!(url = %url, "自定义匹配函数 panic，按不匹配处理");
            false
        })
    }

    /// 原始模式列表
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// 匹配模式
    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// 是否设置了自定义谓词
    pub fn has_custom(&self) -> bool {
        self.custom.is_some()
    }

    /// 成功编译的正则数量
    pub fn compiled_count(&self) -> usize {
        self.compiled.len()
    }
}

impl fmt::Debug for PatternMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternMatcher")
            .field("patterns", &self.patterns)
            .field("mode", &self.mode)
            .field("compiled", &self.compiled.len())
            .field("custom", &self.custom.is_some())
            .finish()
    }
}
