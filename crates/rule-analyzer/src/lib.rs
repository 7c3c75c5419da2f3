//! 声明式对象规则引擎
//!
//! 提供可复用的规则评估能力，支持：
//! - 子句操作库（相等、包含、比较、正则、时间、结构差异等）与自定义操作
//! - 标签化布尔表达式的编译、缓存与短路求值
//! - 匹配数据的捕获
//! - 规则定义的静态校验
//! - 批量并行评估

pub mod analyzer;
pub mod compiler;
pub mod config;
pub mod custom;
pub mod diff;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod extract;
pub mod models;
pub mod observability;
pub mod operators;
pub mod regex_cache;
pub mod validator;
pub mod value;

pub use analyzer::Analyzer;
pub use compiler::{Expression, ExpressionCompiler, ExpressionError};
pub use config::{AnalyzerConfig, LogConfig, RegexConfig};
pub use custom::CustomOperation;
pub use diff::{Comparison, Difference};
pub use error::{Result, RuleError};
pub use executor::RuleExecutor;
pub use extract::{Extracted, PropertyExtractor, ValueExtractor};
pub use models::{
    CaptureValue, Clause, ClauseCapture, Operand, OperationResult, RegexMatch, Rule, RuleCapture,
    RuleEvaluation,
};
pub use operators::{BoolOperator, Operation};
pub use regex_cache::RegexCache;
pub use validator::{RuleValidator, Violation, ViolationKind};
pub use value::{FieldAccessor, FlagSet, Record, Value};
