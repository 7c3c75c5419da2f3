//! 规则引擎错误类型
//!
//! 规则定义缺陷不走这里，而是由校验器收集为 `Violation`；
//! 这里只描述加载转换、表达式解析与运行时求值过程中出现的错误。

use crate::compiler::ExpressionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("表达式解析失败: '{expression}': {source}")]
    InvalidExpression {
        expression: String,
        #[source]
        source: ExpressionError,
    },

    #[error("标签 '{0}' 未匹配任何子句，也不是有效的子句下标")]
    UnknownLabel(String),

    #[error("标签 '{0}' 匹配了多个子句")]
    AmbiguousLabel(String),

    #[error("子句操作数无效: {0}")]
    InvalidOperand(String),

    #[error("自定义操作 {name} 执行失败: {message}")]
    CustomOperation { name: String, message: String },

    #[error("配置加载失败: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, RuleError>;
