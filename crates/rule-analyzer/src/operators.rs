//! 子句操作与布尔操作符定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 子句操作
///
/// 除 `Custom` 外，每个变体都有固定的操作数形态约束，由校验器检查。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    // 比较
    Equals,
    LessThan,
    GreaterThan,

    // 包含检查
    Contains,
    ContainsAny,
    ContainsKey,

    // 字符串操作
    StartsWith,
    EndsWith,
    Regex,

    // 状态检查
    IsNull,
    IsTrue,
    WasModified,

    // 时间操作
    IsBefore,
    IsAfter,
    IsExpired,

    // 调用方注册的自定义操作
    Custom,
}

impl Operation {
    pub const ALL: [Operation; 16] = [
        Self::Equals,
        Self::LessThan,
        Self::GreaterThan,
        Self::Contains,
        Self::ContainsAny,
        Self::ContainsKey,
        Self::StartsWith,
        Self::EndsWith,
        Self::Regex,
        Self::IsNull,
        Self::IsTrue,
        Self::WasModified,
        Self::IsBefore,
        Self::IsAfter,
        Self::IsExpired,
        Self::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "Equals",
            Self::LessThan => "LessThan",
            Self::GreaterThan => "GreaterThan",
            Self::Contains => "Contains",
            Self::ContainsAny => "ContainsAny",
            Self::ContainsKey => "ContainsKey",
            Self::StartsWith => "StartsWith",
            Self::EndsWith => "EndsWith",
            Self::Regex => "Regex",
            Self::IsNull => "IsNull",
            Self::IsTrue => "IsTrue",
            Self::WasModified => "WasModified",
            Self::IsBefore => "IsBefore",
            Self::IsAfter => "IsAfter",
            Self::IsExpired => "IsExpired",
            Self::Custom => "Custom",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 表达式中的布尔操作符
///
/// `NOT` 只能作为操作数前缀出现，不能作为二元操作符使用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BoolOperator {
    And,
    Or,
    Xor,
    Nand,
    Nor,
    Not,
}

impl BoolOperator {
    /// 组合左右两个操作数
    pub fn apply(self, first: bool, second: bool) -> bool {
        match self {
            Self::And => first && second,
            Self::Or => first || second,
            Self::Xor => first ^ second,
            Self::Nand => !(first && second),
            Self::Nor => !(first || second),
            Self::Not => !first,
        }
    }

    /// 尝试短路：仅凭左操作数即可确定结果时返回该结果
    ///
    /// - `AND` 左侧为 false、`NOR` 左侧为 true 时结果恒为 false
    /// - `OR` 左侧为 true、`NAND` 左侧为 false 时结果恒为 true
    pub fn short_circuit(self, current: bool) -> Option<bool> {
        match (self, current) {
            (Self::And, false) | (Self::Nor, true) => Some(false),
            (Self::Or, true) | (Self::Nand, false) => Some(true),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::Xor => "XOR",
            Self::Nand => "NAND",
            Self::Nor => "NOR",
            Self::Not => "NOT",
        }
    }
}

impl fmt::Display for BoolOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 操作符解析区分大小写，只接受全大写写法
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownBoolOperator(pub String);

impl fmt::Display for UnknownBoolOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "未知的布尔操作符: '{}'", self.0)
    }
}

impl std::error::Error for UnknownBoolOperator {}

impl FromStr for BoolOperator {
    type Err = UnknownBoolOperator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AND" => Ok(Self::And),
            "OR" => Ok(Self::Or),
            "XOR" => Ok(Self::Xor),
            "NAND" => Ok(Self::Nand),
            "NOR" => Ok(Self::Nor),
            "NOT" => Ok(Self::Not),
            _ => Err(UnknownBoolOperator(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_operator() {
        assert_eq!("AND".parse::<BoolOperator>(), Ok(BoolOperator::And));
        assert_eq!("NOR".parse::<BoolOperator>(), Ok(BoolOperator::Nor));
        assert!("and".parse::<BoolOperator>().is_err());
        assert!("".parse::<BoolOperator>().is_err());
    }

    #[test]
    fn test_apply_truth_tables() {
        use BoolOperator::*;
        for (a, b) in [(false, false), (false, true), (true, false), (true, true)] {
            assert_eq!(And.apply(a, b), a && b);
            assert_eq!(Or.apply(a, b), a || b);
            assert_eq!(Xor.apply(a, b), a ^ b);
            assert_eq!(Nand.apply(a, b), !(a && b));
            assert_eq!(Nor.apply(a, b), !(a || b));
        }
    }

    #[test]
    fn test_short_circuit_agrees_with_apply() {
        for op in [
            BoolOperator::And,
            BoolOperator::Or,
            BoolOperator::Xor,
            BoolOperator::Nand,
            BoolOperator::Nor,
        ] {
            for current in [false, true] {
                if let Some(value) = op.short_circuit(current) {
                    assert_eq!(op.apply(current, false), value);
                    assert_eq!(op.apply(current, true), value);
                }
            }
        }
        assert_eq!(BoolOperator::Xor.short_circuit(true), None);
        assert_eq!(BoolOperator::And.short_circuit(true), None);
    }

    #[test]
    fn test_operation_serde_names() {
        let json = serde_json::to_string(&Operation::ContainsAny).unwrap();
        assert_eq!(json, "\"ContainsAny\"");
        let parsed: Operation = serde_json::from_str("\"WasModified\"").unwrap();
        assert_eq!(parsed, Operation::WasModified);
        assert_eq!(Operation::IsExpired.to_string(), "IsExpired");
    }
}
