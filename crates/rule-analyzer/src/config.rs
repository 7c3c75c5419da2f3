//! 配置管理
//!
//! 支持可选的 TOML 配置文件与环境变量覆盖
//! （`RULE_ANALYZER__SHORT_CIRCUIT=false` -> `short_circuit`，
//! `RULE_ANALYZER__REGEX__SIZE_LIMIT=1048576` -> `regex.size_limit`）。

use crate::error::Result;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// 正则配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegexConfig {
    /// 编译后状态机的大小上限（字节），缺省使用 regex crate 的默认值
    pub size_limit: Option<usize>,
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// 规则引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// 表达式求值是否短路
    pub short_circuit: bool,
    /// 批量评估的工作线程数，缺省为可用并行度
    pub workers: Option<usize>,
    /// 是否记录评估追踪
    pub trace: bool,
    pub regex: RegexConfig,
    pub logging: LogConfig,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            short_circuit: true,
            workers: None,
            trace: false,
            regex: RegexConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

impl AnalyzerConfig {
    /// 加载配置
    ///
    /// `path` 指向的文件不存在时忽略，环境变量优先于文件。
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("RULE_ANALYZER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// 实际使用的工作线程数
    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|n| *n > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
    }
}
