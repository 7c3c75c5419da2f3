//! 规则引擎领域模型

use crate::diff::Comparison;
use crate::error::RuleError;
use crate::operators::Operation;
use crate::value::{FlagSet, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// 规则定义
///
/// 由规则加载方构造，之后只读。若设置了 `expression`，
/// 每个子句都必须带有唯一的 `label`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default = "new_rule_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 目标类型名，设置后只对运行时类型名相同（不区分大小写）的对象生效
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default)]
    pub severity: i32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

fn new_rule_id() -> String {
    Uuid::new_v4().to_string()
}

impl Rule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_rule_id(),
            name: name.into(),
            description: None,
            target: None,
            clauses: Vec::new(),
            expression: None,
            severity: 0,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_clause(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn with_severity(mut self, severity: i32) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// 是否有子句请求捕获
    pub fn has_capturing_clause(&self) -> bool {
        self.clauses.iter().any(|c| c.capture)
    }
}

/// 子句操作数
///
/// 列表与键值对互斥，"两者同时存在"在内存中无法表示。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Operand {
    #[default]
    None,
    List(Vec<String>),
    Dict(Vec<(String, String)>),
}

impl Operand {
    pub fn data(&self) -> &[String] {
        match self {
            Self::List(data) => data,
            _ => &[],
        }
    }

    pub fn dict_data(&self) -> &[(String, String)] {
        match self {
            Self::Dict(pairs) => pairs,
            _ => &[],
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// 子句：单个可测试的条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ClauseDef", into = "ClauseDef")]
pub struct Clause {
    pub operation: Operation,
    /// 点号分隔的字段路径，缺省时使用整个状态
    pub field: Option<String>,
    pub operand: Operand,
    /// 仅在 `operation == Custom` 时有意义
    pub custom_operation: Option<String>,
    pub invert: bool,
    pub capture: bool,
    pub label: Option<String>,
    /// 自定义操作的附加参数
    pub arguments: Vec<String>,
}

impl Clause {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            field: None,
            operand: Operand::None,
            custom_operation: None,
            invert: false,
            capture: false,
            label: None,
            arguments: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_data<I, S>(mut self, data: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operand = Operand::List(data.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_dict_data<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.operand = Operand::Dict(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_custom_operation(mut self, name: impl Into<String>) -> Self {
        self.operation = Operation::Custom;
        self.custom_operation = Some(name.into());
        self
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    pub fn capturing(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn data(&self) -> &[String] {
        self.operand.data()
    }

    pub fn dict_data(&self) -> &[(String, String)] {
        self.operand.dict_data()
    }
}

/// 子句的序列化形态，保留 `data` / `dict_data` 两个字段名
#[derive(Serialize, Deserialize)]
struct ClauseDef {
    operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dict_data: Option<Vec<(String, String)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    custom_operation: Option<String>,
    #[serde(default)]
    invert: bool,
    #[serde(default)]
    capture: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    arguments: Vec<String>,
}

impl TryFrom<ClauseDef> for Clause {
    type Error = RuleError;

    fn try_from(def: ClauseDef) -> Result<Self, Self::Error> {
        let operand = match (def.data, def.dict_data) {
            (Some(_), Some(_)) => {
                return Err(RuleError::InvalidOperand(format!(
                    "{} 子句不能同时设置 data 与 dict_data",
                    def.operation
                )));
            }
            (Some(data), None) => Operand::List(data),
            (None, Some(pairs)) => Operand::Dict(pairs),
            (None, None) => Operand::None,
        };

        Ok(Self {
            operation: def.operation,
            field: def.field,
            operand,
            custom_operation: def.custom_operation,
            invert: def.invert,
            capture: def.capture,
            label: def.label,
            arguments: def.arguments,
        })
    }
}

impl From<Clause> for ClauseDef {
    fn from(clause: Clause) -> Self {
        let (data, dict_data) = match clause.operand {
            Operand::None => (None, None),
            Operand::List(data) => (Some(data), None),
            Operand::Dict(pairs) => (None, Some(pairs)),
        };

        Self {
            operation: clause.operation,
            field: clause.field,
            data,
            dict_data,
            custom_operation: clause.custom_operation,
            invert: clause.invert,
            capture: clause.capture,
            label: clause.label,
            arguments: clause.arguments,
        }
    }
}

/// 正则命中片段
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegexMatch {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// 捕获到的结果值
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureValue {
    Scalar(String),
    List(Vec<String>),
    Pairs(Vec<(String, String)>),
    Int(i64),
    Bool(bool),
    DateTime(DateTime<Utc>),
    Flags(FlagSet),
    Matches(Vec<RegexMatch>),
    Comparison(Comparison),
    Value(Value),
}

/// 子句捕获：子句与使其成立的状态值
#[derive(Debug, Clone)]
pub struct ClauseCapture<'r> {
    pub clause: &'r Clause,
    pub state1: Option<Value>,
    pub state2: Option<Value>,
    pub result: Option<CaptureValue>,
}

impl<'r> ClauseCapture<'r> {
    pub fn new(
        clause: &'r Clause,
        result: Option<CaptureValue>,
        state1: Option<&Value>,
        state2: Option<&Value>,
    ) -> Self {
        Self {
            clause,
            state1: state1.cloned(),
            state2: state2.cloned(),
            result,
        }
    }
}

/// 单个操作的结果
#[derive(Debug, Clone)]
pub struct OperationResult<'r> {
    pub applies: bool,
    pub capture: Option<ClauseCapture<'r>>,
}

impl<'r> OperationResult<'r> {
    pub fn new(applies: bool, capture: Option<ClauseCapture<'r>>) -> Self {
        Self { applies, capture }
    }

    pub fn no_match() -> Self {
        Self::new(false, None)
    }
}

/// 规则捕获：规则与参与匹配的子句捕获（按求值顺序）
#[derive(Debug, Clone)]
pub struct RuleCapture<'r> {
    pub rule: &'r Rule,
    pub captures: Vec<ClauseCapture<'r>>,
}

/// 单条规则的评估结果
#[derive(Debug, Clone)]
pub struct RuleEvaluation<'r> {
    pub rule: &'r Rule,
    pub matched: bool,
    pub captures: Vec<ClauseCapture<'r>>,
    /// 实际执行的子句数
    pub clauses_evaluated: usize,
    /// 发生短路的次数
    pub short_circuits: usize,
    pub evaluation_trace: Vec<String>,
    pub evaluation_time_us: i64,
}

impl<'r> RuleEvaluation<'r> {
    pub fn new(rule: &'r Rule) -> Self {
        Self {
            rule,
            matched: false,
            captures: Vec::new(),
            clauses_evaluated: 0,
            short_circuits: 0,
            evaluation_trace: Vec::new(),
            evaluation_time_us: 0,
        }
    }

    pub fn into_capture(self) -> Option<RuleCapture<'r>> {
        self.matched.then_some(RuleCapture {
            rule: self.rule,
            captures: self.captures,
        })
    }
}
