//! 自定义操作扩展点
//!
//! 内置操作覆盖不到的语义由调用方实现 [`CustomOperation`] 并注册到
//! `Analyzer`。评估 `Operation::Custom` 子句时，按注册顺序找到第一个
//! 声明适用的实现来给出结果；校验时同样由它负责检查子句。

use crate::analyzer::Analyzer;
use crate::error::Result;
use crate::models::{Clause, ClauseCapture, OperationResult, Rule};
use crate::validator::Violation;
use crate::value::Value;

/// 自定义操作
pub trait CustomOperation: Send + Sync {
    /// 操作名，对应子句的 `custom_operation`
    fn name(&self) -> &str;

    /// 是否处理该子句
    fn applies_to(&self, clause: &Clause) -> bool {
        clause.custom_operation.as_deref() == Some(self.name())
    }

    /// 评估子句
    ///
    /// `captures` 是同一条规则中此前已产生的捕获，`analyzer`
    /// 可用于复用值提取等能力。返回错误时子句按不匹配处理。
    fn evaluate<'r>(
        &self,
        clause: &'r Clause,
        state1: Option<&Value>,
        state2: Option<&Value>,
        captures: &[ClauseCapture<'r>],
        analyzer: &Analyzer,
    ) -> Result<OperationResult<'r>>;

    /// 校验子句，默认不报告问题
    fn validate<'r>(&self, rule: &'r Rule, clause: &'r Clause) -> Vec<Violation<'r>> {
        let _ = (rule, clause);
        Vec::new()
    }
}
