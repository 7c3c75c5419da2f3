//! 日志与指标
//!
//! 日志基于 tracing-subscriber，指标通过 metrics 门面记录，
//! 由宿主程序安装具体的 recorder。

use crate::config::LogConfig;
use anyhow::Result;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// 初始化日志
///
/// `RUST_LOG` 优先于配置中的日志级别。重复初始化返回错误。
pub fn init(config: &LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if config.json_logs {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}

/// 描述引擎产生的指标
pub fn describe_metrics() {
    metrics::describe_counter!("rule_evaluations_total", "规则评估次数，按匹配结果区分");
    metrics::describe_counter!("clause_evaluations_total", "子句评估次数，按操作区分");
    metrics::describe_counter!(
        "clause_evaluation_failures_total",
        "子句评估中发生异常的次数"
    );
    metrics::describe_counter!(
        "rule_target_failures_total",
        "读取状态类型名时发生异常的次数"
    );
    metrics::describe_counter!("regex_cache_compilations_total", "正则实际编译次数");
}
