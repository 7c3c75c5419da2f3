//! 值提取
//!
//! 负责两件事：
//! - 按点号路径从状态对象中取出嵌套值
//! - 把任意值归一化为标量列表或键值对列表，供操作库比较
//!
//! 内置规则无法处理的形态交给调用方注册的提取器链，首个成功者胜出。

use crate::value::Value;
use std::borrow::Cow;
use std::sync::Arc;

/// 值提取器：无法处理时返回 `None`，交给链上的下一个
pub type ValueExtractor = Arc<dyn Fn(&Value) -> Option<Extracted> + Send + Sync>;

/// 属性提取器：在字段访问失败后按字段名兜底查找
pub type PropertyExtractor = Arc<dyn Fn(&Value, &str) -> Option<Value> + Send + Sync>;

/// 归一化后的值
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    pub values: Vec<String>,
    pub pairs: Vec<(String, String)>,
}

impl Extracted {
    pub fn from_values(values: Vec<String>) -> Self {
        Self {
            values,
            pairs: Vec::new(),
        }
    }

    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self {
            values: Vec::new(),
            pairs,
        }
    }

    pub fn scalar(value: impl Into<String>) -> Self {
        Self::from_values(vec![value.into()])
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.pairs.is_empty()
    }
}

/// 把值归一化为字符串列表或键值对列表
pub fn to_values(value: &Value, extractors: &[ValueExtractor]) -> Extracted {
    if let Some(extracted) = normalize_builtin(value) {
        return extracted;
    }

    extractors
        .iter()
        .find_map(|extractor| extractor(value))
        .unwrap_or_else(|| Extracted::scalar(value.render()))
}

fn normalize_builtin(value: &Value) -> Option<Extracted> {
    match value {
        Value::Null => Some(Extracted::default()),
        v if v.is_scalar() => Some(Extracted::scalar(v.render())),
        Value::List(items) if items.iter().all(Value::is_scalar) => Some(Extracted::from_values(
            items.iter().map(Value::render).collect(),
        )),
        Value::Map(map) => {
            let mut pairs = Vec::with_capacity(map.len());
            for (key, entry) in map {
                match entry {
                    v if v.is_scalar() => pairs.push((key.clone(), v.render())),
                    // 多值映射展开为重复键
                    Value::List(items) if items.iter().all(Value::is_scalar) => {
                        pairs.extend(items.iter().map(|item| (key.clone(), item.render())));
                    }
                    _ => return None,
                }
            }
            Some(Extracted::from_pairs(pairs))
        }
        Value::Pairs(pairs) => Some(Extracted::from_pairs(pairs.clone())),
        _ => None,
    }
}

/// 按点号路径取值
///
/// 空路径返回状态本身。途中任一段无法解析则返回 `None`，
/// 解析结果为 `Value::Null` 时同样视为缺失。
pub fn value_at<'a>(
    state: &'a Value,
    path: &str,
    extractors: &[PropertyExtractor],
) -> Option<Cow<'a, Value>> {
    let mut current = Cow::Borrowed(state);

    if !path.is_empty() {
        for segment in path.split('.') {
            current = match current {
                Cow::Borrowed(value) => step(value, segment, extractors)?,
                Cow::Owned(value) => Cow::Owned(step(&value, segment, extractors)?.into_owned()),
            };
        }
    }

    if current.is_null() { None } else { Some(current) }
}

fn step<'a>(
    value: &'a Value,
    segment: &str,
    extractors: &[PropertyExtractor],
) -> Option<Cow<'a, Value>> {
    match value {
        Value::Map(map) => map.get(segment).map(Cow::Borrowed),
        Value::List(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index))
            .map(Cow::Borrowed),
        Value::Pairs(pairs) => pairs
            .iter()
            .find(|(key, _)| key == segment)
            .map(|(_, v)| Cow::Owned(Value::String(v.clone()))),
        _ => {
            if let Value::Object(obj) = value {
                if let Some(field) = obj.field(segment) {
                    return Some(Cow::Owned(field));
                }
            }
            extractors
                .iter()
                .find_map(|extractor| extractor(value, segment))
                .map(Cow::Owned)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Record;
    use serde_json::json;

    #[test]
    fn test_scalar_and_list() {
        assert_eq!(to_values(&Value::from("abc"), &[]), Extracted::scalar("abc"));
        assert_eq!(to_values(&Value::Int(5), &[]), Extracted::scalar("5"));
        assert_eq!(
            to_values(&Value::from(vec!["a", "b"]), &[]).values,
            vec!["a", "b"]
        );
        assert!(to_values(&Value::Null, &[]).is_empty());
    }

    #[test]
    fn test_multi_valued_map_flattens() {
        let value = Value::from(json!({"a": ["1", "2"], "b": "3"}));
        let extracted = to_values(&value, &[]);
        assert_eq!(
            extracted.pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("a".to_string(), "2".to_string()),
                ("b".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn test_extractor_chain_then_render() {
        let record = Record::new("Port").with("number", 22).into_value();
        assert_eq!(
            to_values(&record, &[]).values,
            vec!["Port {number: 22}".to_string()]
        );

        let skip: ValueExtractor = Arc::new(|_: &Value| -> Option<Extracted> { None });
        let port: ValueExtractor = Arc::new(|v: &Value| match v {
            Value::Object(obj) if obj.kind() == "Port" => obj
                .field("number")
                .map(|n| Extracted::scalar(n.render())),
            _ => None,
        });
        assert_eq!(to_values(&record, &[skip, port]).values, vec!["22"]);
    }

    #[test]
    fn test_value_at_paths() {
        let state = Value::from(json!({
            "user": {"name": "alice", "roles": ["admin", "dev"], "manager": null}
        }));

        let name = value_at(&state, "user.name", &[]).unwrap();
        assert_eq!(name.as_str(), Some("alice"));
        assert!(matches!(name, Cow::Borrowed(_)));

        let role = value_at(&state, "user.roles.1", &[]).unwrap();
        assert_eq!(role.as_str(), Some("dev"));

        assert!(value_at(&state, "user.missing", &[]).is_none());
        assert!(value_at(&state, "user.roles.x", &[]).is_none());
        assert!(value_at(&state, "user.manager", &[]).is_none());
        assert!(value_at(&state, "", &[]).is_some());
    }

    #[test]
    fn test_value_at_through_objects() {
        let inner = Record::new("Owner").with("name", "root");
        let state = Record::new("File")
            .with("owner", inner.into_value())
            .into_value();

        let owner = value_at(&state, "owner.name", &[]).unwrap();
        assert_eq!(owner.as_str(), Some("root"));

        let fallback: PropertyExtractor = Arc::new(|v: &Value, name: &str| {
            (v.kind_name() == "Owner" && name == "uid").then(|| Value::Int(0))
        });
        assert!(value_at(&state, "owner.uid", &[]).is_none());
        let uid = value_at(&state, "owner.uid", &[fallback]).unwrap();
        assert!(matches!(uid.as_ref(), Value::Int(0)));
    }
}
