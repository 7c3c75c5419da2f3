//! 内置操作库
//!
//! 每个内置操作都是 `(子句, 状态1, 状态2) -> 操作结果` 的纯函数。
//! 操作先判断自身是否"可判定"：两个状态都缺失、缺少所需类型、
//! 阈值或正则无法解析时，无论是否取反都返回不匹配。
//! 可判定时 `invert` 只是对结果取反。
//!
//! 捕获值只在子句请求捕获时才构造。

use crate::diff::compare_states;
use crate::extract::{Extracted, ValueExtractor, to_values};
use crate::models::{CaptureValue, Clause, ClauseCapture, Operand, OperationResult, RegexMatch};
use crate::operators::Operation;
use crate::regex_cache::RegexCache;
use crate::value::{Value, parse_timestamp};
use chrono::{DateTime, Utc};
use tracing::debug;

/// 未取反的判定结果
struct Verdict {
    matched: bool,
    capture: Option<CaptureValue>,
}

impl Verdict {
    fn new(matched: bool, capture: Option<CaptureValue>) -> Self {
        Self { matched, capture }
    }
}

/// 内置操作评估器
pub struct OperationEvaluator<'a> {
    extractors: &'a [ValueExtractor],
    regex_cache: &'a RegexCache,
}

impl<'a> OperationEvaluator<'a> {
    pub fn new(extractors: &'a [ValueExtractor], regex_cache: &'a RegexCache) -> Self {
        Self {
            extractors,
            regex_cache,
        }
    }

    /// 评估内置操作
    ///
    /// `Custom` 不在这里处理，调用方应转交自定义操作注册表。
    pub fn evaluate<'r>(
        &self,
        clause: &'r Clause,
        state1: Option<&Value>,
        state2: Option<&Value>,
    ) -> OperationResult<'r> {
        let states = [state1, state2];
        let verdict = match clause.operation {
            Operation::Equals => self.equals(clause, &states),
            Operation::Contains => self.contains(clause, &states, true),
            Operation::ContainsAny => self.contains(clause, &states, false),
            Operation::ContainsKey => self.contains_key(clause, &states),
            Operation::StartsWith => self.affix(clause, &states, |v, d| v.starts_with(d)),
            Operation::EndsWith => self.affix(clause, &states, |v, d| v.ends_with(d)),
            Operation::LessThan => self.compare_int(clause, &states, |v, t| v < t),
            Operation::GreaterThan => self.compare_int(clause, &states, |v, t| v > t),
            Operation::Regex => self.regex(clause, &states),
            Operation::IsNull => Some(Verdict::new(all_absent(&states), None)),
            Operation::IsTrue => is_true(clause, &states),
            Operation::WasModified => Some(was_modified(clause, &states)),
            Operation::IsBefore => compare_time(clause, &states, |v, t| v < t),
            Operation::IsAfter => compare_time(clause, &states, |v, t| v > t),
            Operation::IsExpired => is_expired(clause, &states),
            Operation::Custom => {
                debug!(operation = %clause.operation, "内置操作库不处理自定义操作");
                None
            }
        };

        metrics::counter!(
            "clause_evaluations_total",
            "operation" => clause.operation.as_str()
        )
        .increment(1);

        conclude(clause, verdict, state1, state2)
    }

    fn extract(&self, state: &Value) -> Extracted {
        to_values(state, self.extractors)
    }

    /// 所有状态归一化后的值，取反捕获时记录
    fn examined(&self, states: &[Option<&Value>; 2]) -> CaptureValue {
        let values = states
            .iter()
            .flatten()
            .flat_map(|state| self.extract(state).values)
            .collect();
        CaptureValue::List(values)
    }

    fn equals(&self, clause: &Clause, states: &[Option<&Value>; 2]) -> Option<Verdict> {
        let data = clause.data();
        if data.is_empty() || all_absent(states) {
            return None;
        }

        for state in states.iter().flatten() {
            let hits: Vec<String> = self
                .extract(state)
                .values
                .into_iter()
                .filter(|value| data.contains(value))
                .collect();

            if !hits.is_empty() {
                return Some(Verdict::new(
                    true,
                    clause.capture.then(|| scalar_or_list(state, hits)),
                ));
            }
        }

        Some(Verdict::new(
            false,
            clause.capture.then(|| self.examined(states)),
        ))
    }

    fn contains(
        &self,
        clause: &Clause,
        states: &[Option<&Value>; 2],
        require_all: bool,
    ) -> Option<Verdict> {
        if (clause.data().is_empty() && clause.dict_data().is_empty()) || all_absent(states) {
            return None;
        }

        for state in states.iter().flatten() {
            if let Some(capture) = self.contains_in(clause, state, require_all) {
                return Some(Verdict::new(true, clause.capture.then_some(capture)));
            }
        }

        Some(Verdict::new(
            false,
            clause.capture.then(|| self.examined(states)),
        ))
    }

    /// 单个状态上的包含判断，成立时返回捕获值
    fn contains_in(&self, clause: &Clause, state: &Value, require_all: bool) -> Option<CaptureValue> {
        let satisfied = |hits: usize, total: usize| {
            if require_all {
                hits == total && total > 0
            } else {
                hits > 0
            }
        };

        match (&clause.operand, state) {
            (Operand::List(data), Value::Flags(flags)) => {
                let hits = data
                    .iter()
                    .filter(|d| flags.parse(d).is_some_and(|bits| flags.contains(bits)))
                    .count();
                satisfied(hits, data.len()).then(|| CaptureValue::Flags(flags.clone()))
            }
            (Operand::List(data), Value::String(s)) => {
                let hits = data.iter().filter(|d| s.contains(d.as_str())).count();
                satisfied(hits, data.len()).then(|| CaptureValue::Scalar(s.clone()))
            }
            (Operand::List(data), _) => {
                let values = self.extract(state).values;
                let hits: Vec<String> = data
                    .iter()
                    .filter(|d| values.contains(d))
                    .cloned()
                    .collect();
                satisfied(hits.len(), data.len()).then_some(CaptureValue::List(hits))
            }
            (Operand::Dict(pairs), _) => {
                let extracted = self.extract(state).pairs;
                let hits: Vec<(String, String)> = pairs
                    .iter()
                    .filter(|pair| extracted.contains(pair))
                    .cloned()
                    .collect();
                satisfied(hits.len(), pairs.len()).then_some(CaptureValue::Pairs(hits))
            }
            (Operand::None, _) => None,
        }
    }

    fn contains_key(&self, clause: &Clause, states: &[Option<&Value>; 2]) -> Option<Verdict> {
        let data = clause.data();
        if data.is_empty() {
            return None;
        }

        let keyed: Vec<Vec<String>> = states
            .iter()
            .flatten()
            .map(|state| self.keys_of(state))
            .filter(|keys| !keys.is_empty())
            .collect();

        if keyed.is_empty() {
            return None;
        }

        for keys in &keyed {
            let hits: Vec<String> = keys.iter().filter(|k| data.contains(k)).cloned().collect();
            if !hits.is_empty() {
                return Some(Verdict::new(true, clause.capture.then_some(CaptureValue::List(hits))));
            }
        }

        Some(Verdict::new(
            false,
            clause
                .capture
                .then(|| CaptureValue::List(keyed.into_iter().flatten().collect())),
        ))
    }

    /// 字典形状状态的键
    fn keys_of(&self, state: &Value) -> Vec<String> {
        match state {
            Value::Map(map) => map.keys().cloned().collect(),
            Value::Object(obj) if !obj.field_names().is_empty() => obj.field_names(),
            _ => self
                .extract(state)
                .pairs
                .into_iter()
                .map(|(key, _)| key)
                .collect(),
        }
    }

    fn affix(
        &self,
        clause: &Clause,
        states: &[Option<&Value>; 2],
        test: impl Fn(&str, &str) -> bool,
    ) -> Option<Verdict> {
        let data = clause.data();
        if data.is_empty() || all_absent(states) {
            return None;
        }

        for state in states.iter().flatten() {
            let hits: Vec<String> = self
                .extract(state)
                .values
                .into_iter()
                .filter(|value| data.iter().any(|d| test(value, d)))
                .collect();

            if !hits.is_empty() {
                return Some(Verdict::new(
                    true,
                    clause.capture.then(|| scalar_or_list(state, hits)),
                ));
            }
        }

        Some(Verdict::new(
            false,
            clause.capture.then(|| self.examined(states)),
        ))
    }

    fn compare_int(
        &self,
        clause: &Clause,
        states: &[Option<&Value>; 2],
        cmp: impl Fn(i64, i64) -> bool,
    ) -> Option<Verdict> {
        let threshold = clause.data().first()?.trim().parse::<i64>().ok()?;

        let numbers: Vec<i64> = states
            .iter()
            .flatten()
            .flat_map(|state| self.extract(state).values)
            .filter_map(|value| value.trim().parse::<i64>().ok())
            .collect();

        if numbers.is_empty() {
            return None;
        }

        match numbers.iter().find(|n| cmp(**n, threshold)) {
            Some(n) => Some(Verdict::new(true, clause.capture.then_some(CaptureValue::Int(*n)))),
            None => Some(Verdict::new(
                false,
                clause.capture.then(|| CaptureValue::Int(numbers[0])),
            )),
        }
    }

    fn regex(&self, clause: &Clause, states: &[Option<&Value>; 2]) -> Option<Verdict> {
        let data = clause.data();
        if data.is_empty() || all_absent(states) {
            return None;
        }

        let pattern = data.join("|");
        let regex = self.regex_cache.get_or_compile(&pattern)?;

        for state in states.iter().flatten() {
            let matches: Vec<RegexMatch> = self
                .extract(state)
                .values
                .iter()
                .flat_map(|value| {
                    regex.find_iter(value).map(|m| RegexMatch {
                        text: m.as_str().to_string(),
                        start: m.start(),
                        end: m.end(),
                    })
                })
                .collect();

            if !matches.is_empty() {
                return Some(Verdict::new(
                    true,
                    clause.capture.then_some(CaptureValue::Matches(matches)),
                ));
            }
        }

        Some(Verdict::new(
            false,
            clause.capture.then(|| self.examined(states)),
        ))
    }
}

fn all_absent(states: &[Option<&Value>; 2]) -> bool {
    states.iter().all(Option::is_none)
}

/// 标量字符串状态捕获首个命中值，其余捕获命中列表
fn scalar_or_list(state: &Value, mut hits: Vec<String>) -> CaptureValue {
    if matches!(state, Value::String(_)) && !hits.is_empty() {
        CaptureValue::Scalar(hits.swap_remove(0))
    } else {
        CaptureValue::List(hits)
    }
}

fn is_true(clause: &Clause, states: &[Option<&Value>; 2]) -> Option<Verdict> {
    let flags: Vec<bool> = states
        .iter()
        .flatten()
        .filter_map(|state| state.as_bool())
        .collect();

    if flags.is_empty() {
        return None;
    }

    let matched = flags.contains(&true);
    Some(Verdict::new(
        matched,
        clause.capture.then_some(CaptureValue::Bool(matched)),
    ))
}

fn was_modified(clause: &Clause, states: &[Option<&Value>; 2]) -> Verdict {
    // 只有捕获时才枚举全部差异
    let max = if clause.capture { usize::MAX } else { 1 };
    let comparison = compare_states(states[0], states[1], max);
    let matched = !comparison.are_equal();
    Verdict::new(
        matched,
        clause.capture.then_some(CaptureValue::Comparison(comparison)),
    )
}

fn datetimes(states: &[Option<&Value>; 2]) -> Vec<DateTime<Utc>> {
    states
        .iter()
        .flatten()
        .filter_map(|state| state.as_datetime())
        .collect()
}

fn compare_time(
    clause: &Clause,
    states: &[Option<&Value>; 2],
    cmp: impl Fn(DateTime<Utc>, DateTime<Utc>) -> bool,
) -> Option<Verdict> {
    let thresholds: Vec<DateTime<Utc>> = clause
        .data()
        .iter()
        .filter_map(|d| parse_timestamp(d))
        .collect();
    let values = datetimes(states);

    if thresholds.is_empty() || values.is_empty() {
        return None;
    }

    let hit = values
        .iter()
        .find(|value| thresholds.iter().any(|t| cmp(**value, *t)));

    Some(match hit {
        Some(value) => Verdict::new(true, clause.capture.then_some(CaptureValue::DateTime(*value))),
        None => Verdict::new(
            false,
            clause.capture.then(|| CaptureValue::DateTime(values[0])),
        ),
    })
}

fn is_expired(clause: &Clause, states: &[Option<&Value>; 2]) -> Option<Verdict> {
    let values = datetimes(states);
    if values.is_empty() {
        return None;
    }

    let now = Utc::now();
    let hit = values.iter().find(|value| **value < now);

    Some(match hit {
        Some(value) => Verdict::new(true, clause.capture.then_some(CaptureValue::DateTime(*value))),
        None => Verdict::new(
            false,
            clause.capture.then(|| CaptureValue::DateTime(values[0])),
        ),
    })
}

/// 应用取反并按需构造捕获
fn conclude<'r>(
    clause: &'r Clause,
    verdict: Option<Verdict>,
    state1: Option<&Value>,
    state2: Option<&Value>,
) -> OperationResult<'r> {
    let Some(verdict) = verdict else {
        debug!(operation = %clause.operation, "操作不可判定，视为不匹配");
        return OperationResult::no_match();
    };

    let applies = verdict.matched != clause.invert;
    let capture = (applies && clause.capture)
        .then(|| ClauseCapture::new(clause, verdict.capture, state1, state2));

    OperationResult::new(applies, capture)
}
