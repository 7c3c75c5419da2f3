//! 规则校验器
//!
//! 对规则定义做纯静态检查，不依赖任何运行时状态，也不修改规则。
//! 发现的问题以 [`Violation`] 返回，不作为错误抛出。

use crate::compiler::{Expression, ExpressionError, TokenShape, tokenize};
use crate::custom::CustomOperation;
use crate::models::{Clause, Operand, Rule};
use crate::operators::{BoolOperator, Operation};
use crate::regex_cache::RegexCache;
use crate::value::parse_timestamp;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// 规则缺陷种类，`Display` 即缺陷描述
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViolationKind {
    // ==================== 子句操作数 ====================
    #[error("规则 {rule} 的子句 {clause} 缺少 data")]
    NoData { rule: String, clause: String },

    #[error("规则 {rule} 的子句 {clause} 使用 {operation} 操作，不应设置 dict_data")]
    DictDataUnexpected {
        rule: String,
        clause: String,
        operation: Operation,
    },

    #[error("规则 {rule} 的子句 {clause} 必须设置 data 或 dict_data 之一")]
    NoDataOrDictData { rule: String, clause: String },

    #[error("规则 {rule} 的子句 {clause} 需要恰好一个整数 data，实际为 {found:?}")]
    ExpectedInt {
        rule: String,
        clause: String,
        found: Vec<String>,
    },

    #[error("规则 {rule} 的子句 {clause} 需要恰好一个可解析的时间戳 data，实际为 {found:?}")]
    ExpectedDateTime {
        rule: String,
        clause: String,
        found: Vec<String>,
    },

    #[error("规则 {rule} 的子句 {clause} 包含无效的正则表达式 '{pattern}'")]
    InvalidRegex {
        rule: String,
        clause: String,
        pattern: String,
    },

    #[error("规则 {rule} 的子句 {clause} 使用 {operation} 操作，不需要 data")]
    RedundantData {
        rule: String,
        clause: String,
        operation: Operation,
    },

    #[error("规则 {rule} 的子句 {clause} 使用 {operation} 操作，不需要 dict_data")]
    RedundantDictData {
        rule: String,
        clause: String,
        operation: Operation,
    },

    #[error("规则 {rule} 的子句 {clause} 使用了不受支持的操作 {operation}（自定义操作: {custom:?}）")]
    UnsupportedOperation {
        rule: String,
        clause: String,
        operation: Operation,
        custom: Option<String>,
    },

    // ==================== 标签 ====================
    #[error("规则 {rule} 中存在重复的子句标签 '{label}'")]
    DuplicateLabel { rule: String, label: String },

    #[error("规则 {rule} 的子句标签 '{label}' 含有非法字符（空格或括号）")]
    InvalidLabel { rule: String, label: String },

    #[error("规则 {rule} 的子句标签 '{label}' 未在表达式中使用")]
    UnusedLabel { rule: String, label: String },

    #[error("规则 {rule} 中部分子句有标签、部分没有，标签必须全部设置或全部省略")]
    MissingLabels { rule: String },

    #[error("规则 {rule} 设置了表达式，但存在没有标签的子句")]
    ExpressionButMissingLabels { rule: String },

    // ==================== 表达式 ====================
    #[error("规则 {rule} 的表达式 '{expression}' 中右括号多于左括号")]
    UnbalancedParentheses { rule: String, expression: String },

    #[error("规则 {rule} 的表达式 '{expression}' 存在未闭合的左括号")]
    UnclosedParentheses { rule: String, expression: String },

    #[error("规则 {rule} 的表达式 '{expression}' 中词元 '{token}' 的左括号前有其他字符")]
    CharactersBeforeOpenParenthesis {
        rule: String,
        expression: String,
        token: String,
    },

    #[error("规则 {rule} 的表达式 '{expression}' 中词元 '{token}' 的右括号后有其他字符")]
    CharactersAfterClosedParenthesis {
        rule: String,
        expression: String,
        token: String,
    },

    #[error("规则 {rule} 的表达式 '{expression}' 中词元 '{token}' 的标签内含有括号")]
    ParenthesisInLabel {
        rule: String,
        expression: String,
        token: String,
    },

    #[error("规则 {rule} 的表达式 '{expression}' 中 NOT 词元 '{token}' 不能带右括号")]
    CloseParenthesisInNot {
        rule: String,
        expression: String,
        token: String,
    },

    #[error("规则 {rule} 的表达式 '{expression}' 引用了未定义的标签 '{label}'")]
    UndefinedLabel {
        rule: String,
        expression: String,
        label: String,
    },

    #[error("规则 {rule} 的表达式 '{expression}' 中 '{token}' 不是有效的布尔操作符")]
    InvalidOperator {
        rule: String,
        expression: String,
        token: String,
    },

    #[error("规则 {rule} 的表达式 '{expression}' 中 NOT 不能作为二元操作符")]
    InvalidNotOperator { rule: String, expression: String },

    #[error("规则 {rule} 的表达式 '{expression}' 必须以操作数结尾")]
    EndsWithOperator { rule: String, expression: String },

    #[error("规则 {rule} 的表达式 '{expression}' 无法解析: {source}")]
    MalformedExpression {
        rule: String,
        expression: String,
        source: ExpressionError,
    },

    // ==================== 自定义 ====================
    #[error("规则 {rule} 的子句 {clause}: {message}")]
    Custom {
        rule: String,
        clause: String,
        message: String,
    },
}

/// 规则缺陷
#[derive(Debug, Clone)]
pub struct Violation<'r> {
    pub kind: ViolationKind,
    pub rule: &'r Rule,
    pub clauses: Vec<&'r Clause>,
}

impl<'r> Violation<'r> {
    pub fn new(kind: ViolationKind, rule: &'r Rule) -> Self {
        Self {
            kind,
            rule,
            clauses: Vec::new(),
        }
    }

    pub fn for_clause(kind: ViolationKind, rule: &'r Rule, clause: &'r Clause) -> Self {
        Self {
            kind,
            rule,
            clauses: vec![clause],
        }
    }

    pub fn description(&self) -> String {
        self.kind.to_string()
    }
}

/// 子句在诊断信息中的名称：标签，缺省时为下标
pub fn clause_name(rule: &Rule, clause: &Clause) -> String {
    if let Some(label) = &clause.label {
        return label.clone();
    }
    rule.clauses
        .iter()
        .position(|c| std::ptr::eq(c, clause))
        .map(|index| index.to_string())
        .unwrap_or_default()
}

/// 规则校验器
pub struct RuleValidator<'a> {
    custom_operations: &'a [Arc<dyn CustomOperation>],
    /// 与评估时一致的正则大小上限
    regex_size_limit: Option<usize>,
}

impl<'a> RuleValidator<'a> {
    pub fn new(custom_operations: &'a [Arc<dyn CustomOperation>]) -> Self {
        Self {
            custom_operations,
            regex_size_limit: None,
        }
    }

    pub fn with_regex_size_limit(mut self, size_limit: Option<usize>) -> Self {
        self.regex_size_limit = size_limit;
        self
    }

    /// 校验一组规则
    #[instrument(skip_all, fields(rules = rules.len()))]
    pub fn enumerate_issues<'r>(&self, rules: &'r [Rule]) -> Vec<Violation<'r>> {
        let violations: Vec<Violation<'r>> =
            rules.iter().flat_map(|rule| self.rule_issues(rule)).collect();

        info!(
            rules = rules.len(),
            violations = violations.len(),
            "规则校验完成"
        );
        violations
    }

    /// 校验单条规则
    pub fn rule_issues<'r>(&self, rule: &'r Rule) -> Vec<Violation<'r>> {
        let mut out = Vec::new();

        self.check_labels(rule, &mut out);
        for clause in &rule.clauses {
            self.check_clause(rule, clause, &mut out);
        }
        if let Some(expression) = &rule.expression {
            check_expression(rule, expression, &mut out);
        }
        check_label_coverage(rule, &mut out);

        if !out.is_empty() {
            debug!(rule = %rule.name, violations = out.len(), "规则存在缺陷");
        }
        out
    }

    fn check_labels<'r>(&self, rule: &'r Rule, out: &mut Vec<Violation<'r>>) {
        let mut groups: BTreeMap<&str, Vec<&'r Clause>> = BTreeMap::new();
        for clause in &rule.clauses {
            if let Some(label) = &clause.label {
                groups.entry(label.as_str()).or_default().push(clause);
            }
        }

        for (label, clauses) in groups {
            if clauses.len() > 1 {
                out.push(Violation {
                    kind: ViolationKind::DuplicateLabel {
                        rule: rule.name.clone(),
                        label: label.to_string(),
                    },
                    rule,
                    clauses,
                });
            }
        }

        for clause in &rule.clauses {
            if let Some(label) = &clause.label {
                if label.contains([' ', '(', ')']) {
                    out.push(Violation::for_clause(
                        ViolationKind::InvalidLabel {
                            rule: rule.name.clone(),
                            label: label.clone(),
                        },
                        rule,
                        clause,
                    ));
                }
            }
        }
    }

    /// 按操作检查操作数形态
    fn check_clause<'r>(&self, rule: &'r Rule, clause: &'r Clause, out: &mut Vec<Violation<'r>>) {
        let name = clause_name(rule, clause);

        if clause.operation == Operation::Custom {
            match self
                .custom_operations
                .iter()
                .find(|op| op.applies_to(clause))
            {
                Some(op) => out.extend(op.validate(rule, clause)),
                None => out.push(Violation::for_clause(
                    ViolationKind::UnsupportedOperation {
                        rule: rule.name.clone(),
                        clause: name,
                        operation: clause.operation,
                        custom: clause.custom_operation.clone(),
                    },
                    rule,
                    clause,
                )),
            }
            return;
        }

        let mut push = |kind: ViolationKind| out.push(Violation::for_clause(kind, rule, clause));
        let rule_name = || rule.name.clone();

        match clause.operation {
            Operation::Equals
            | Operation::StartsWith
            | Operation::EndsWith
            | Operation::Regex
            | Operation::ContainsKey => {
                if clause.data().is_empty() {
                    push(ViolationKind::NoData {
                        rule: rule_name(),
                        clause: name.clone(),
                    });
                }
                if matches!(clause.operand, Operand::Dict(_)) {
                    push(ViolationKind::DictDataUnexpected {
                        rule: rule_name(),
                        clause: name.clone(),
                        operation: clause.operation,
                    });
                }
                if clause.operation == Operation::Regex {
                    let limit = self.regex_size_limit;
                    let mut all_valid = true;
                    for pattern in clause.data() {
                        if pattern.is_empty() || !RegexCache::is_valid(pattern, limit) {
                            all_valid = false;
                            push(ViolationKind::InvalidRegex {
                                rule: rule_name(),
                                clause: name.clone(),
                                pattern: pattern.clone(),
                            });
                        }
                    }

                    // 评估时编译的是合并后的模式
                    let joined = clause.data().join("|");
                    if all_valid && clause.data().len() > 1 && !RegexCache::is_valid(&joined, limit) {
                        push(ViolationKind::InvalidRegex {
                            rule: rule_name(),
                            clause: name.clone(),
                            pattern: joined,
                        });
                    }
                }
            }
            Operation::Contains | Operation::ContainsAny => {
                if clause.data().is_empty() && clause.dict_data().is_empty() {
                    push(ViolationKind::NoDataOrDictData {
                        rule: rule_name(),
                        clause: name,
                    });
                }
            }
            Operation::LessThan | Operation::GreaterThan => {
                let data = clause.data();
                let valid = data.len() == 1 && data[0].trim().parse::<i64>().is_ok();
                if !valid {
                    push(ViolationKind::ExpectedInt {
                        rule: rule_name(),
                        clause: name.clone(),
                        found: data.to_vec(),
                    });
                }
                if matches!(clause.operand, Operand::Dict(_)) {
                    push(ViolationKind::DictDataUnexpected {
                        rule: rule_name(),
                        clause: name,
                        operation: clause.operation,
                    });
                }
            }
            Operation::IsBefore | Operation::IsAfter => {
                let data = clause.data();
                let valid = data.len() == 1 && parse_timestamp(&data[0]).is_some();
                if !valid {
                    push(ViolationKind::ExpectedDateTime {
                        rule: rule_name(),
                        clause: name.clone(),
                        found: data.to_vec(),
                    });
                }
                if matches!(clause.operand, Operand::Dict(_)) {
                    push(ViolationKind::DictDataUnexpected {
                        rule: rule_name(),
                        clause: name,
                        operation: clause.operation,
                    });
                }
            }
            Operation::IsNull | Operation::IsTrue | Operation::IsExpired | Operation::WasModified => {
                match clause.operand {
                    Operand::List(_) => push(ViolationKind::RedundantData {
                        rule: rule_name(),
                        clause: name,
                        operation: clause.operation,
                    }),
                    Operand::Dict(_) => push(ViolationKind::RedundantDictData {
                        rule: rule_name(),
                        clause: name,
                        operation: clause.operation,
                    }),
                    Operand::None => {}
                }
            }
            Operation::Custom => {}
        }
    }
}

/// 逐词元检查表达式：括号形态、操作数与操作符交替、标签引用
fn check_expression<'r>(rule: &'r Rule, expression: &str, out: &mut Vec<Violation<'r>>) {
    let before = out.len();
    let rule_name = || rule.name.clone();
    let expr = || expression.to_string();

    let mut depth: i64 = 0;
    let mut unbalanced_reported = false;
    let mut expecting_operator = false;

    for token in tokenize(expression) {
        let shape = TokenShape::of(token);

        if !expecting_operator {
            if let Some(kind) = token_shape_issue(&shape) {
                out.push(Violation::new(
                    kind(rule_name(), expr(), token.to_string()),
                    rule,
                ));
            }

            let variable: String = token.chars().filter(|c| *c != '(' && *c != ')').collect();

            if variable.is_empty() && !(shape.opens > 0 && shape.closes > 0) {
                // 独立的括号词元，不改变期望
            } else if variable == BoolOperator::Not.as_str() {
                if token.contains(')') {
                    out.push(Violation::new(
                        ViolationKind::CloseParenthesisInNot {
                            rule: rule_name(),
                            expression: expr(),
                            token: token.to_string(),
                        },
                        rule,
                    ));
                }
            } else {
                if !label_resolves(rule, &variable) {
                    out.push(Violation::new(
                        ViolationKind::UndefinedLabel {
                            rule: rule_name(),
                            expression: expr(),
                            label: variable,
                        },
                        rule,
                    ));
                }
                expecting_operator = true;
            }
        } else if shape.core.is_empty() && shape.opens == 0 {
            // 操作数之后的独立右括号
        } else {
            match token.parse::<BoolOperator>() {
                Ok(BoolOperator::Not) => out.push(Violation::new(
                    ViolationKind::InvalidNotOperator {
                        rule: rule_name(),
                        expression: expr(),
                    },
                    rule,
                )),
                Ok(_) => {}
                Err(_) => out.push(Violation::new(
                    ViolationKind::InvalidOperator {
                        rule: rule_name(),
                        expression: expr(),
                        token: token.to_string(),
                    },
                    rule,
                )),
            }
            expecting_operator = false;
        }

        depth += token.matches('(').count() as i64 - token.matches(')').count() as i64;
        if depth < 0 && !unbalanced_reported {
            unbalanced_reported = true;
            out.push(Violation::new(
                ViolationKind::UnbalancedParentheses {
                    rule: rule_name(),
                    expression: expr(),
                },
                rule,
            ));
        }
    }

    if !expecting_operator {
        out.push(Violation::new(
            ViolationKind::EndsWithOperator {
                rule: rule_name(),
                expression: expr(),
            },
            rule,
        ));
    }

    if depth > 0 {
        out.push(Violation::new(
            ViolationKind::UnclosedParentheses {
                rule: rule_name(),
                expression: expr(),
            },
            rule,
        ));
    }

    // 逐词元检查未发现问题时，再以解析器兜底
    if out.len() == before {
        if let Err(source) = Expression::parse(expression) {
            out.push(Violation::new(
                ViolationKind::MalformedExpression {
                    rule: rule_name(),
                    expression: expr(),
                    source,
                },
                rule,
            ));
        }
    }
}

type ShapeIssue = fn(String, String, String) -> ViolationKind;

/// 操作数位置词元的括号形态问题
fn token_shape_issue(shape: &TokenShape<'_>) -> Option<ShapeIssue> {
    let open = shape.core.find('(');
    let close = shape.core.find(')');

    let issue: ShapeIssue = match (open, close) {
        (None, None) => return None,
        (Some(o), Some(c)) if c < o => |rule, expression, token| ViolationKind::ParenthesisInLabel {
            rule,
            expression,
            token,
        },
        (Some(_), _) => |rule, expression, token| ViolationKind::CharactersBeforeOpenParenthesis {
            rule,
            expression,
            token,
        },
        (None, Some(_)) => |rule, expression, token| ViolationKind::CharactersAfterClosedParenthesis {
            rule,
            expression,
            token,
        },
    };
    Some(issue)
}

/// 标签能否解析为子句：精确匹配标签，或是有效下标
fn label_resolves(rule: &Rule, label: &str) -> bool {
    if label.trim().is_empty() {
        return false;
    }
    rule.clauses
        .iter()
        .any(|c| c.label.as_deref() == Some(label))
        || label
            .parse::<usize>()
            .is_ok_and(|index| index < rule.clauses.len())
}

/// 标签覆盖：声明的标签都被引用，标签全有或全无
fn check_label_coverage<'r>(rule: &'r Rule, out: &mut Vec<Violation<'r>>) {
    let labeled = rule.clauses.iter().filter(|c| c.label.is_some()).count();
    let unlabeled = rule.clauses.len() - labeled;

    if let Some(expression) = &rule.expression {
        let referenced: HashSet<String> = tokenize(expression)
            .into_iter()
            .map(|token| token.chars().filter(|c| *c != '(' && *c != ')').collect())
            .collect();

        for clause in &rule.clauses {
            if let Some(label) = &clause.label {
                if !referenced.contains(label) {
                    out.push(Violation::for_clause(
                        ViolationKind::UnusedLabel {
                            rule: rule.name.clone(),
                            label: label.clone(),
                        },
                        rule,
                        clause,
                    ));
                }
            }
        }

        if unlabeled > 0 {
            out.push(Violation::new(
                ViolationKind::ExpressionButMissingLabels {
                    rule: rule.name.clone(),
                },
                rule,
            ));
        }
    }

    if labeled > 0 && unlabeled > 0 {
        out.push(Violation::new(
            ViolationKind::MissingLabels {
                rule: rule.name.clone(),
            },
            rule,
        ));
    }
}
