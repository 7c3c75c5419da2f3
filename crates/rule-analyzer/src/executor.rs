//! 规则执行器
//!
//! 在表达式语法树上求值，支持短路并沿途累积子句捕获。
//! 没有表达式的规则要求全部子句成立。

use crate::analyzer::Analyzer;
use crate::compiler::Expression;
use crate::error::{Result, RuleError};
use crate::models::{Clause, Rule, RuleEvaluation};
use crate::value::Value;
use std::time::Instant;

/// 规则执行器
pub struct RuleExecutor<'a> {
    analyzer: &'a Analyzer,
    /// 是否允许短路
    short_circuit: bool,
    /// 是否记录详细评估追踪
    trace_enabled: bool,
}

impl<'a> RuleExecutor<'a> {
    pub fn new(analyzer: &'a Analyzer) -> Self {
        let config = analyzer.config();
        Self {
            analyzer,
            short_circuit: config.short_circuit,
            trace_enabled: config.trace,
        }
    }

    /// 启用评估追踪
    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    pub fn with_short_circuit(mut self, enabled: bool) -> Self {
        self.short_circuit = enabled;
        self
    }

    /// 执行规则评估
    ///
    /// 表达式无法解析或标签无法解析时返回错误，由调用方按不匹配处理。
    pub fn execute<'r>(
        &self,
        rule: &'r Rule,
        state1: Option<&Value>,
        state2: Option<&Value>,
    ) -> Result<RuleEvaluation<'r>> {
        let start = Instant::now();
        let mut result = RuleEvaluation::new(rule);

        let matched = match &rule.expression {
            None => self.evaluate_all(rule, state1, state2, &mut result),
            Some(expression) => {
                let tree = self.analyzer.compiler().compile(expression)?;
                self.evaluate_node(rule, &tree, state1, state2, &mut result)?
            }
        };

        result.matched = matched;
        result.evaluation_time_us = start.elapsed().as_micros() as i64;

        Ok(result)
    }

    /// 无表达式：全部子句成立才匹配，遇到不成立立即返回
    fn evaluate_all<'r>(
        &self,
        rule: &'r Rule,
        state1: Option<&Value>,
        state2: Option<&Value>,
        result: &mut RuleEvaluation<'r>,
    ) -> bool {
        for (index, clause) in rule.clauses.iter().enumerate() {
            let applies = self.evaluate_clause(clause, &index.to_string(), state1, state2, result);
            if !applies {
                if self.trace_enabled {
                    result
                        .evaluation_trace
                        .push(format!("子句 {} 不成立，规则不匹配", index));
                }
                return false;
            }
        }
        true
    }

    /// 递归评估语法树节点
    fn evaluate_node<'r>(
        &self,
        rule: &'r Rule,
        node: &Expression,
        state1: Option<&Value>,
        state2: Option<&Value>,
        result: &mut RuleEvaluation<'r>,
    ) -> Result<bool> {
        match node {
            Expression::Operand(label) => {
                let clause = resolve_label(rule, label)?;
                Ok(self.evaluate_clause(clause, label, state1, state2, result))
            }
            Expression::Not(inner) => {
                let value = self.evaluate_node(rule, inner, state1, state2, result)?;
                Ok(!value)
            }
            Expression::Group(inner) => {
                // 组整体不成立时丢弃组内捕获
                let mark = result.captures.len();
                let value = self.evaluate_node(rule, inner, state1, state2, result)?;
                if !value {
                    result.captures.truncate(mark);
                }
                Ok(value)
            }
            Expression::Chain { first, rest } => {
                let mut current = self.evaluate_node(rule, first, state1, state2, result)?;

                // 同层操作数逐个折叠，递归只发生在括号与 NOT 内
                for (op, operand) in rest {
                    if self.short_circuit && !captures_in(rule, operand) {
                        if let Some(value) = op.short_circuit(current) {
                            result.short_circuits += 1;
                            if self.trace_enabled {
                                result.evaluation_trace.push(format!(
                                    "{} 短路 - 左侧为 {}，结果为 {}",
                                    op, current, value
                                ));
                            }
                            current = value;
                            continue;
                        }
                    }

                    let next = self.evaluate_node(rule, operand, state1, state2, result)?;
                    current = op.apply(current, next);
                }

                Ok(current)
            }
        }
    }

    /// 评估单个子句，成立且有捕获时追加到结果
    fn evaluate_clause<'r>(
        &self,
        clause: &'r Clause,
        name: &str,
        state1: Option<&Value>,
        state2: Option<&Value>,
        result: &mut RuleEvaluation<'r>,
    ) -> bool {
        result.clauses_evaluated += 1;
        let outcome = self
            .analyzer
            .evaluate_clause(clause, state1, state2, &result.captures);

        if self.trace_enabled {
            result.evaluation_trace.push(format!(
                "{}: {} => {}",
                name,
                clause.operation,
                if outcome.applies { "MATCHED" } else { "NOT_MATCHED" }
            ));
        }

        if outcome.applies {
            if let Some(capture) = outcome.capture {
                result.captures.push(capture);
            }
        }
        outcome.applies
    }
}

/// 按标签解析子句：标签须唯一匹配，否则退回为子句下标
pub fn resolve_label<'r>(rule: &'r Rule, label: &str) -> Result<&'r Clause> {
    let mut matches = rule
        .clauses
        .iter()
        .filter(|c| c.label.as_deref() == Some(label));

    match (matches.next(), matches.next()) {
        (Some(_), Some(_)) => Err(RuleError::AmbiguousLabel(label.to_string())),
        (Some(clause), None) => Ok(clause),
        (None, _) => label
            .parse::<usize>()
            .ok()
            .and_then(|index| rule.clauses.get(index))
            .ok_or_else(|| RuleError::UnknownLabel(label.to_string())),
    }
}

/// 子树中是否有请求捕获的子句
fn captures_in(rule: &Rule, node: &Expression) -> bool {
    node.operands()
        .into_iter()
        .filter_map(|label| resolve_label(rule, label).ok())
        .any(|clause| clause.capture)
}
