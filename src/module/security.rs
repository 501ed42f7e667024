//! 远程源码安全校验
//!
//! 在求值之前扫描远程模块源码，发现以下结构即拒绝：
//!
//! - 动态求值：`eval(`、`['eval']`、`Function(`、以字符串调用的 `setTimeout` / `setInterval`
//! - 不安全的 HTML 注入：`innerHTML =`、`outerHTML =`、`insertAdjacentHTML(`
//! - `document.write`
//! - `<script` 字符串
//! - `javascript:`、`data:`、`vbscript:` URI

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::utils::{CoreError, Result};

/// 内置规则：(规则名, 正则)
static DEFAULT_RULES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("dynamic-eval", r"\beval\s*\("),
        ("dynamic-eval", r#"\[\s*["'`]eval["'`]\s*\]"#),
        ("function-constructor", r"\b(?:new\s+)?Function\s*\("),
        ("string-timer", r#"\bset(?:Timeout|Interval)\s*\(\s*["'`]"#),
        ("html-injection", r"\.(?:innerHTML|outerHTML)\s*\+?="),
        ("html-injection", r"\binsertAdjacentHTML\s*\("),
        ("document-write", r"\bdocument\s*\.\s*write(?:ln)?\s*\("),
        ("script-tag", r"(?i)<\s*script"),
        ("javascript-uri", r"(?i)\bjavascript\s*:"),
        ("data-uri", r"(?i)\bdata:[a-z0-9/.+-]*[;,]"),
        ("vbscript-uri", r"(?i)\bvbscript\s*:"),
    ]
    .into_iter()
    .map(|(label, pattern)| (label, Regex::new(pattern).expect("Invalid security rule regex")))
    .collect()
});

/// 一次命中
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// 规则名
    pub rule: String,
    /// 行号（从 1 开始）
    pub line: usize,
    /// 命中的片段
    pub snippet: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (第 {} 行: {})", self.rule, self.line, self.snippet)
    }
}

/// 安全校验器
#[derive(Debug, Clone, Default)]
pub struct SecurityGate {
    extra_rules: Vec<(String, Regex)>,
}

impl SecurityGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加自定义规则
    pub fn with_rule(mut self, label: impl Into<String>, pattern: Regex) -> Self {
        self.extra_rules.push((label.into(), pattern));
        self
    }

    /// 扫描源码，返回全部命中
    pub fn scan(&self, source: &str) -> Vec<Violation> {
        let rules = DEFAULT_RULES
            .iter()
            .map(|(label, re)| (*label, re))
            .chain(self.extra_rules.iter().map(|(label, re)| (label.as_str(), re)));

        let mut violations = Vec::new();
        for (label, re) in rules {
            for m in re.find_iter(source) {
                violations.push(Violation {
                    rule: label.to_string(),
                    line: source[..m.start()].matches('\n').count() + 1,
                    snippet: m.as_str().to_string(),
                });
            }
        }
        violations.sort_by_key(|v| v.line);
        violations
    }

    /// 校验源码
    ///
    /// # Errors
    ///
    /// 有任何命中时返回 `SecurityValidation`
    pub fn validate(&self, origin: &str, source: &str) -> Result<()> {
        let violations = self.scan(source);
        if violations.is_empty() {
            return Ok(());
        }

        warn!(url = %origin, count = violations.len(), "远程源码未通过安全校验");
        Err(CoreError::SecurityValidation {
            origin: origin.to_string(),
            violations: violations.iter().map(ToString::to_string).collect(),
        })
    }
}
