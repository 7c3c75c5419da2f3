//! 值树的深度结构比较

use crate::value::Value;
use serde::Serialize;
use std::collections::BTreeSet;

/// 单处差异，`before`/`after` 为 `None` 表示该侧不存在此路径
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Difference {
    pub path: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// 比较结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Comparison {
    pub differences: Vec<Difference>,
}

impl Comparison {
    pub fn are_equal(&self) -> bool {
        self.differences.is_empty()
    }
}

/// 比较两个值，最多收集 `max_differences` 处差异
pub fn compare(before: &Value, after: &Value, max_differences: usize) -> Comparison {
    let mut comparison = Comparison::default();
    if max_differences > 0 {
        walk(before, after, "", max_differences, &mut comparison);
    }
    comparison
}

/// 比较两个可能缺失的状态
pub fn compare_states(
    before: Option<&Value>,
    after: Option<&Value>,
    max_differences: usize,
) -> Comparison {
    let null = Value::Null;
    compare(
        before.unwrap_or(&null),
        after.unwrap_or(&null),
        max_differences,
    )
}

fn child_path(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", path, segment)
    }
}

fn record(out: &mut Comparison, path: &str, before: Option<&Value>, after: Option<&Value>) {
    out.differences.push(Difference {
        path: path.to_string(),
        before: before.filter(|v| !v.is_null()).map(Value::render),
        after: after.filter(|v| !v.is_null()).map(Value::render),
    });
}

fn walk(before: &Value, after: &Value, path: &str, max: usize, out: &mut Comparison) {
    if out.differences.len() >= max {
        return;
    }

    match (before, after) {
        (Value::Null, Value::Null) => {}
        (Value::Bool(a), Value::Bool(b)) if a == b => {}
        (Value::Int(a), Value::Int(b)) if a == b => {}
        (Value::Float(a), Value::Float(b)) if a == b => {}
        (Value::String(a), Value::String(b)) if a == b => {}
        (Value::DateTime(a), Value::DateTime(b)) if a == b => {}
        (Value::Flags(a), Value::Flags(b)) if a == b => {}
        (Value::List(a), Value::List(b)) => {
            for index in 0..a.len().max(b.len()) {
                if out.differences.len() >= max {
                    return;
                }
                let segment = child_path(path, &index.to_string());
                match (a.get(index), b.get(index)) {
                    (Some(x), Some(y)) => walk(x, y, &segment, max, out),
                    (x, y) => record(out, &segment, x, y),
                }
            }
        }
        (Value::Map(a), Value::Map(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                if out.differences.len() >= max {
                    return;
                }
                let segment = child_path(path, key);
                match (a.get(key), b.get(key)) {
                    (Some(x), Some(y)) => walk(x, y, &segment, max, out),
                    (x, y) => record(out, &segment, x, y),
                }
            }
        }
        (Value::Pairs(a), Value::Pairs(b)) => {
            for index in 0..a.len().max(b.len()) {
                if out.differences.len() >= max {
                    return;
                }
                let x = a.get(index);
                let y = b.get(index);
                if x != y {
                    let key = x.or(y).map(|(k, _)| k.as_str()).unwrap_or_default();
                    out.differences.push(Difference {
                        path: child_path(path, key),
                        before: x.map(|(k, v)| format!("{}: {}", k, v)),
                        after: y.map(|(k, v)| format!("{}: {}", k, v)),
                    });
                }
            }
        }
        (Value::Object(a), Value::Object(b)) if a.kind() == b.kind() => {
            let names: BTreeSet<String> =
                a.field_names().into_iter().chain(b.field_names()).collect();
            if names.is_empty() {
                if a.render() != b.render() {
                    record(out, path, Some(before), Some(after));
                }
                return;
            }
            for name in names {
                if out.differences.len() >= max {
                    return;
                }
                let segment = child_path(path, &name);
                let x = a.field(&name).unwrap_or(Value::Null);
                let y = b.field(&name).unwrap_or(Value::Null);
                walk(&x, &y, &segment, max, out);
            }
        }
        _ => record(out, path, Some(before), Some(after)),
    }
}
