//! Agentlet Core 命令行入口
//!
//! 提供配置检查、源码安全扫描和导航模拟等调试功能。
//!
//! # 命令概览
//!
//! - `version` - 显示版本信息
//! - `check-config` - 验证配置文件
//! - `check-source` - 对模块清单执行安全扫描与解析
//! - `simulate` - 加载清单并按顺序模拟导航
//!
//! # 使用示例
//!
//! ```bash
//! # 检查配置文件
//! agentlet-core check-config -c config.yaml
//!
//! # 扫描一个远程清单
//! agentlet-core check-source modules/remote.yaml
//!
//! # 模拟导航
//! agentlet-core simulate -m modules/dashboard.yaml \
//!     -u https://app.example.com/dashboard -u https://app.example.com/settings
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use agentlet_core::module::{ManifestEvaluator, SecurityGate};
use agentlet_core::{AgentletCore, CoreConfig, Logger, LoggerConfig, PageContext};

/// Agentlet Core - Agentlet 运行时内核
#[derive(Parser)]
#[command(name = "agentlet-core")]
#[command(version, about = "按 URL 激活页面助手的运行时内核", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// 开发模式（显示文件名和行号）
    #[arg(long, global = true)]
    dev: bool,

    /// 子命令
    #[command(subcommand)]
    command: Commands,
}

/// 可用的子命令
#[derive(Subcommand)]
enum Commands {
    /// 查看版本信息
    Version,

    /// 验证配置文件
    CheckConfig {
        /// 配置文件路径（不指定则使用全局 -c 选项）
        #[arg(long = "file")]
        file: Option<PathBuf>,
    },

    /// 对模块清单执行安全扫描并解析
    CheckSource {
        /// 清单文件路径
        path: PathBuf,
    },

    /// 加载清单并模拟一系列导航
    Simulate {
        /// 清单文件（可重复）
        #[arg(short, long = "manifest", required = true)]
        manifests: Vec<PathBuf>,

        /// 依次导航的 URL（可重复）
        #[arg(short, long = "url", required = true)]
        urls: Vec<String>,

        /// 打印每个事件
        #[arg(long)]
        trace_events: bool,
    },
}

/// 打印版本信息
fn print_version() {
    println!();
    println!("Agentlet Core");
    println!("═══════════════════════════════════════");
    println!("  版本:             {}", agentlet_core::VERSION);
    println!();
    println!("构建信息:");
    println!("  目标平台:         {}", std::env::consts::ARCH);
    println!("  操作系统:         {}", std::env::consts::OS);
    println!("═══════════════════════════════════════");
    println!();
}

/// 检查配置文件
async fn check_config(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("检查配置文件: {}", path.display());
    println!();

    if !path.exists() {
        println!("⚠️  警告: 配置文件不存在，将使用默认配置");
        println!();
        print_config(&CoreConfig::default());
        return Ok(());
    }

    match CoreConfig::from_file(path).await {
        Ok(config) => {
            println!("✅ 配置文件有效！");
            println!();
            print_config(&config);
            Ok(())
        }
        Err(e) => {
            println!("❌ 配置文件无效: {}", e);
            Err(Box::new(e))
        }
    }
}

fn print_config(config: &CoreConfig) {
    println!("配置内容:");
    println!("────────────────────────────────────────");
    println!("  [日志配置]");
    println!("    日志级别:       {}", config.logging.level);
    println!("    文件输出:       {}", if config.logging.file_output { "是" } else { "否" });
    println!("    JSON 格式:      {}", if config.logging.json_format { "是" } else { "否" });
    println!();
    println!("  [注册表配置]");
    println!("    重名策略:       {:?}", config.registry.duplicate_policy);
    println!("    代际保护:       {}", if config.registry.generation_guard { "启用" } else { "禁用" });
    println!();
    println!("  [加载器配置]");
    println!("    缓存容量:       {}", config.loader.cache_capacity);
    match config.loader.timeout_secs {
        Some(secs) => println!("    拉取超时:       {} 秒", secs),
        None => println!("    拉取超时:       无"),
    }
    println!();
    println!("  [其他]");
    println!("    清单目录:       {:?}", config.manifest_dirs);
    println!("    开发模式:       {}", if config.dev_mode { "是" } else { "否" });
    println!("────────────────────────────────────────");
}

/// 扫描并解析清单
async fn check_source(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let origin = path.display().to_string();
    let source = tokio::fs::read_to_string(path).await?;

    println!("检查清单: {}", origin);
    println!();

    let violations = SecurityGate::new().scan(&source);
    if !violations.is_empty() {
        println!("❌ 安全扫描未通过:");
        for v in &violations {
            println!("    第 {} 行 [{}] {}", v.line, v.rule, v.snippet);
        }
        return Err(format!("{} 处违规", violations.len()).into());
    }
    println!("✅ 安全扫描通过");

    let configs = ManifestEvaluator::parse(&origin, &source)?;
    println!("✅ 解析成功，共 {} 个模块:", configs.len());
    for config in &configs {
        println!(
            "    {} v{} ({} 模式, {} 条规则, {} 个子模块)",
            config.name,
            config.version,
            config.match_mode,
            config.patterns.len(),
            config.submodules.len()
        );
    }
    Ok(())
}

/// 模拟导航
async fn simulate(
    config: CoreConfig,
    manifests: &[PathBuf],
    urls: &[String],
    trace_events: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut core = AgentletCore::new(config).await?;
    core.start().await?;

    if trace_events {
        core.event_bus().observe("*", |event| {
            println!("  · {} {}", event.name, event.data);
        });
    }

    for path in manifests {
        let origin = path.display().to_string();
        let source = tokio::fs::read_to_string(path).await?;
        for module_config in ManifestEvaluator::parse(&origin, &source)? {
            let module = core.module_builder(module_config).build()?;
            core.register_module(module).await?;
        }
    }
    info!(modules = core.registry().len().await, "清单加载完成");

    for url in urls {
        println!("→ {}", url);
        let active = core.navigate(url).await?;
        match active {
            Some(name) => {
                let content = core.content(&PageContext::new(url.as_str())).await.unwrap_or_default();
                println!("  活动模块: {}", name);
                if !content.is_empty() {
                    println!("  内容: {}", content);
                }
            }
            None => println!("  活动模块: 无"),
        }
    }

    let stats = core.stats().await;
    println!();
    println!("事件: 发布 {} / 投递 {} / 失败 {}",
        stats.events.emitted, stats.events.delivered, stats.events.failed);

    core.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let _guard = match cli.command {
        Commands::Version | Commands::CheckConfig { .. } => None,
        _ => Some(Logger::try_init(
            LoggerConfig::builder()
                .level(cli.log_level.as_str())
                .show_file_line(cli.dev)
                .build(),
        )),
    };

    match cli.command {
        Commands::Version => print_version(),

        Commands::CheckConfig { file } => {
            let path = file.unwrap_or(cli.config);
            check_config(&path).await?;
        }

        Commands::CheckSource { path } => check_source(&path).await?,

        Commands::Simulate { manifests, urls, trace_events } => {
            let mut config = load_config(&cli.config).await?;
            config.dev_mode |= cli.dev;
            simulate(config, &manifests, &urls, trace_events).await?;
        }
    }

    Ok(())
}

/// 加载配置文件，不存在时使用默认配置
async fn load_config(config_path: &PathBuf) -> Result<CoreConfig, Box<dyn std::error::Error>> {
    if config_path.exists() {
        info!("已加载配置文件: {}", config_path.display());
        Ok(CoreConfig::from_file(config_path).await?)
    } else {
        info!("配置文件不存在 ({})，使用默认配置", config_path.display());
        Ok(CoreConfig::default())
    }
}
