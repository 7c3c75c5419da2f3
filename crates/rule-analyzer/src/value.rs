//! 状态值模型
//!
//! 规则评估的输入是一棵显式的值树。宿主程序的领域对象通过实现
//! [`FieldAccessor`] 接入，字段查找在编译期由接口决定，而不是运行时反射。

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// 状态值
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Flags(FlagSet),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// 预先成形的键值对列表，允许重复键
    Pairs(Vec<(String, String)>),
    Object(Arc<dyn FieldAccessor>),
}

/// 领域对象的字段访问接口
pub trait FieldAccessor: fmt::Debug + Send + Sync {
    /// 运行时类型名，用于 `Rule::target` 过滤
    fn kind(&self) -> &str;

    /// 按名称读取字段，字段不存在时返回 `None`
    fn field(&self, name: &str) -> Option<Value>;

    /// 全部字段名，深度比较时使用
    fn field_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn render(&self) -> String {
        format!("{:?}", self)
    }
}

impl Value {
    pub fn object(accessor: impl FieldAccessor + 'static) -> Self {
        Self::Object(Arc::new(accessor))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// 运行时类型名
    pub fn kind_name(&self) -> &str {
        match self {
            Self::Null => "Null",
            Self::Bool(_) => "Bool",
            Self::Int(_) => "Int",
            Self::Float(_) => "Float",
            Self::String(_) => "String",
            Self::DateTime(_) => "DateTime",
            Self::Flags(flags) => flags.kind(),
            Self::List(_) => "List",
            Self::Map(_) => "Map",
            Self::Pairs(_) => "Pairs",
            Self::Object(obj) => obj.kind(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// 日期时间值；字符串按时间戳格式解析
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::DateTime(dt) => Some(*dt),
            Self::String(s) => parse_timestamp(s),
            _ => None,
        }
    }

    /// 是否为标量（可直接渲染为单个字符串）
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Self::Bool(_)
                | Self::Int(_)
                | Self::Float(_)
                | Self::String(_)
                | Self::DateTime(_)
                | Self::Flags(_)
        )
    }

    /// 默认字符串渲染
    pub fn render(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::String(s) => s.clone(),
            Self::DateTime(dt) => dt.to_rfc3339(),
            Self::Flags(flags) => flags.to_string(),
            Self::List(items) => {
                let rendered: Vec<String> = items.iter().map(Value::render).collect();
                format!("[{}]", rendered.join(", "))
            }
            Self::Map(map) => {
                let rendered: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k, v.render()))
                    .collect();
                format!("{{{}}}", rendered.join(", "))
            }
            Self::Pairs(pairs) => {
                let rendered: Vec<String> =
                    pairs.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
                format!("{{{}}}", rendered.join(", "))
            }
            Self::Object(obj) => obj.render(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        crate::diff::compare(self, other, 1).are_equal()
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::DateTime(dt)
    }
}

impl From<FlagSet> for Value {
    fn from(flags: FlagSet) -> Self {
        Self::Flags(flags)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(map: BTreeMap<String, T>) -> Self {
        Self::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// 通用领域对象：类型名 + 有序字段表
#[derive(Debug, Clone, Default)]
pub struct Record {
    kind: String,
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn into_value(self) -> Value {
        Value::object(self)
    }
}

impl FieldAccessor for Record {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn field(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }

    fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    fn render(&self) -> String {
        let rendered: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v.render()))
            .collect();
        format!("{} {{{}}}", self.kind, rendered.join(", "))
    }
}

/// 位标志集合
///
/// 保存标志名定义与当前位值，操作库据此把操作数按标志名解析并做包含判断。
#[derive(Debug, Clone)]
pub struct FlagSet {
    kind: String,
    definitions: Arc<[(String, u64)]>,
    bits: u64,
}

impl FlagSet {
    pub fn new<N: Into<String>>(
        kind: impl Into<String>,
        definitions: impl IntoIterator<Item = (N, u64)>,
        bits: u64,
    ) -> Self {
        Self {
            kind: kind.into(),
            definitions: definitions
                .into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
            bits,
        }
    }

    /// 由 `bitflags` 类型构造
    pub fn from_bitflags<F>(kind: impl Into<String>, flags: &F) -> Self
    where
        F: bitflags::Flags,
        F::Bits: Into<u64>,
    {
        let definitions: Vec<(String, u64)> = F::FLAGS
            .iter()
            .map(|flag| (flag.name().to_string(), flag.value().bits().into()))
            .collect();
        Self::new(kind, definitions, flags.bits().into())
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// 解析标志文本：逗号分隔的标志名或十进制数值
    pub fn parse(&self, text: &str) -> Option<u64> {
        let mut bits = 0;
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            let value = match self.definitions.iter().find(|(name, _)| name == part) {
                Some((_, value)) => *value,
                None => part.parse::<u64>().ok()?,
            };
            bits |= value;
        }
        Some(bits)
    }

    /// 是否包含给定的全部位
    pub fn contains(&self, bits: u64) -> bool {
        self.bits & bits == bits
    }

    /// 当前已置位的标志名
    pub fn names(&self) -> Vec<&str> {
        self.definitions
            .iter()
            .filter(|(_, value)| *value != 0 && self.contains(*value))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl PartialEq for FlagSet {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.bits == other.bits
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        if names.is_empty() {
            let zero = self
                .definitions
                .iter()
                .find(|(_, value)| *value == 0)
                .map(|(name, _)| name.clone());
            return match zero {
                Some(name) if self.bits == 0 => f.write_str(&name),
                _ => write!(f, "{}", self.bits),
            };
        }
        f.write_str(&names.join(", "))
    }
}

/// 解析时间戳字符串
///
/// 依次尝试 RFC3339、不带时区的日期时间（按 UTC 处理）与纯日期。
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
