//! 模块配置解析与校验
//!
//! 负责从 YAML/JSON 清单解析 [`ModuleConfig`]，并在模块构造前做同步校验。
//! 校验会收集所有问题后一次性返回 `CoreError::ConfigValidation`。

use std::collections::HashSet;
use std::path::Path;

use crate::module::metadata::ModuleConfig;
use crate::module::pattern::MatchMode;
use crate::utils::{CoreError, Result};

/// 模块配置解析器
#[derive(Debug, Clone, Default)]
pub struct ModuleParser;

impl ModuleParser {
    pub fn new() -> Self {
        Self
    }

    /// 从文件解析模块配置
    ///
    /// `.json` 后缀按 JSON 解析，其余按 YAML 解析。
    ///
    /// # Errors
    ///
    /// - 文件无法读取时返回 IO 错误
    /// - 内容格式错误时返回 JSON / YAML 错误
    /// - 校验失败时返回 `ConfigValidation`
    pub async fn parse_file(path: &Path) -> Result<ModuleConfig> {
        let content = tokio::fs::read_to_string(path).await?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        if is_json {
            Self::parse_json(&content)
        } else {
            Self::parse_string(&content)
        }
    }

    /// 从 YAML 字符串解析（JSON 也是合法的 YAML）
    pub fn parse_string(content: &str) -> Result<ModuleConfig> {
        let config: ModuleConfig = serde_yaml::from_str(content)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// 从 JSON 字符串解析
    pub fn parse_json(content: &str) -> Result<ModuleConfig> {
        let config: ModuleConfig = serde_json::from_str(content)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// 校验模块配置
    ///
    /// 执行以下校验：
    /// - 模块名格式
    /// - 版本号格式（semver）
    /// - 非 custom 模式下 patterns 不能为空，也不能包含空串
    /// - 子模块名在同一父模块下唯一，子模块递归校验
    pub fn validate(config: &ModuleConfig) -> Result<()> {
        let mut errors = Vec::new();
        Self::collect_errors(config, "", &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::ConfigValidation { errors })
        }
    }

    fn collect_errors(config: &ModuleConfig, prefix: &str, errors: &mut Vec<String>) {
        let label = if prefix.is_empty() {
            format!("模块 '{}'", config.name)
        } else {
            format!("子模块 '{}{}'", prefix, config.name)
        };

        // 1. 名称
        if config.name.is_empty() {
            errors.push(format!("{}: 名称不能为空", label));
        } else if !Self::is_valid_module_name(&config.name) {
            errors.push(format!(
                "{}: 名称格式无效，只允许字母开头的字母、数字、下划线、连字符和点",
                label
            ));
        }

        // 2. 版本号
        if config.version.is_empty() {
            errors.push(format!("{}: 版本号不能为空", label));
        } else if semver::Version::parse(&config.version).is_err() {
            errors.push(format!(
                "{}: 无效的版本号格式 '{}'，请使用 semver 格式 (如 1.0.0)",
                label, config.version
            ));
        }

        // 3. 模式
        if config.match_mode != MatchMode::Custom {
            if config.patterns.is_empty() {
                errors.push(format!(
                    "{}: {} 模式下 patterns 不能为空",
                    label, config.match_mode
                ));
            }
            if config.patterns.iter().any(|p| p.is_empty()) {
                errors.push(format!("{}: patterns 中包含空字符串", label));
            }
        }

        // 4. 子模块
        let mut seen = HashSet::new();
        for sub in &config.submodules {
            if !sub.name.is_empty() && !seen.insert(sub.name.as_str()) {
                errors.push(format!("{}: 子模块名重复 '{}'", label, sub.name));
            }
        }

        let child_prefix = format!("{}{}/", prefix, config.name);
        for sub in &config.submodules {
            Self::collect_errors(sub, &child_prefix, errors);
        }
    }

    /// 检查模块名格式
    fn is_valid_module_name(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {}
            _ => return false,
        }

        chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    }
}
