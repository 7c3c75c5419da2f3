//! 规则分析器
//!
//! 对外入口：单条规则的匹配、批量评估（匹配规则、标签、捕获）、
//! 规则校验，以及自定义操作和值提取器的注册。
//!
//! 运行时故障一律在子句边界被捕获并记录日志，按不匹配处理，
//! 不会中断批量评估。

use crate::compiler::ExpressionCompiler;
use crate::config::AnalyzerConfig;
use crate::custom::CustomOperation;
use crate::evaluator::OperationEvaluator;
use crate::executor::RuleExecutor;
use crate::extract::{self, Extracted, PropertyExtractor, ValueExtractor};
use crate::models::{Clause, ClauseCapture, OperationResult, Rule, RuleCapture, RuleEvaluation};
use crate::operators::Operation;
use crate::regex_cache::RegexCache;
use crate::validator::{RuleValidator, Violation};
use crate::value::Value;
use parking_lot::RwLock;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// 规则分析器
pub struct Analyzer {
    config: AnalyzerConfig,
    regex_cache: RegexCache,
    compiler: ExpressionCompiler,
    custom_operations: RwLock<Vec<Arc<dyn CustomOperation>>>,
    value_extractors: RwLock<Vec<ValueExtractor>>,
    property_extractors: RwLock<Vec<PropertyExtractor>>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::with_config(AnalyzerConfig::default())
    }
}

impl Analyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: AnalyzerConfig) -> Self {
        Self {
            regex_cache: RegexCache::with_size_limit(config.regex.size_limit),
            compiler: ExpressionCompiler::new(),
            custom_operations: RwLock::new(Vec::new()),
            value_extractors: RwLock::new(Vec::new()),
            property_extractors: RwLock::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn compiler(&self) -> &ExpressionCompiler {
        &self.compiler
    }

    pub fn regex_cache(&self) -> &RegexCache {
        &self.regex_cache
    }

    // ==================== 注册 ====================

    pub fn with_custom_operation(self, operation: impl CustomOperation + 'static) -> Self {
        self.register_custom_operation(operation);
        self
    }

    /// 注册自定义操作，按注册顺序匹配
    pub fn register_custom_operation(&self, operation: impl CustomOperation + 'static) {
        debug!(operation = operation.name(), "注册自定义操作");
        self.custom_operations.write().push(Arc::new(operation));
    }

    pub fn clear_custom_operations(&self) {
        self.custom_operations.write().clear();
    }

    pub fn with_value_extractor<F>(self, extractor: F) -> Self
    where
        F: Fn(&Value) -> Option<Extracted> + Send + Sync + 'static,
    {
        self.register_value_extractor(extractor);
        self
    }

    /// 注册值提取器，内置归一化无法处理的值依次交给它们
    pub fn register_value_extractor<F>(&self, extractor: F)
    where
        F: Fn(&Value) -> Option<Extracted> + Send + Sync + 'static,
    {
        self.value_extractors.write().push(Arc::new(extractor));
    }

    pub fn with_property_extractor<F>(self, extractor: F) -> Self
    where
        F: Fn(&Value, &str) -> Option<Value> + Send + Sync + 'static,
    {
        self.register_property_extractor(extractor);
        self
    }

    /// 注册属性提取器，字段路径中内置方式无法解析的段依次交给它们
    pub fn register_property_extractor<F>(&self, extractor: F)
    where
        F: Fn(&Value, &str) -> Option<Value> + Send + Sync + 'static,
    {
        self.property_extractors.write().push(Arc::new(extractor));
    }

    // ==================== 值提取 ====================

    /// 按点号路径取值，空路径返回状态本身
    pub fn value_at(&self, state: &Value, path: &str) -> Option<Value> {
        let extractors = self.property_extractors.read().clone();
        extract::value_at(state, path, &extractors).map(Cow::into_owned)
    }

    /// 把值归一化为字符串列表或键值对
    pub fn to_values(&self, value: &Value) -> Extracted {
        let extractors = self.value_extractors.read().clone();
        extract::to_values(value, &extractors)
    }

    // ==================== 子句 ====================

    /// 评估单个子句
    ///
    /// `captures` 为同一规则中此前产生的捕获，只转交给自定义操作。
    pub fn evaluate_clause<'r>(
        &self,
        clause: &'r Clause,
        state1: Option<&Value>,
        state2: Option<&Value>,
        captures: &[ClauseCapture<'r>],
    ) -> OperationResult<'r> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.dispatch(clause, state1, state2, captures)
        }));

        match outcome {
            Ok(result) => result,
            Err(_) => {
                let clause_json = serde_json::to_string(clause).unwrap_or_default();
                error!(
                    operation = %clause.operation,
                    clause = %clause_json,
                    state1 = ?state1,
                    state2 = ?state2,
                    "子句评估发生异常，按不匹配处理"
                );
                metrics::counter!(
                    "clause_evaluation_failures_total",
                    "operation" => clause.operation.as_str()
                )
                .increment(1);
                OperationResult::no_match()
            }
        }
    }

    /// 不带前序捕获评估单个子句
    pub fn analyze_clause<'r>(
        &self,
        clause: &'r Clause,
        state1: Option<&Value>,
        state2: Option<&Value>,
    ) -> OperationResult<'r> {
        self.evaluate_clause(clause, state1, state2, &[])
    }

    fn dispatch<'r>(
        &self,
        clause: &'r Clause,
        state1: Option<&Value>,
        state2: Option<&Value>,
        captures: &[ClauseCapture<'r>],
    ) -> OperationResult<'r> {
        let path = clause.field.as_deref().unwrap_or_default();
        let properties = self.property_extractors.read().clone();
        let resolved1 = state1.and_then(|s| extract::value_at(s, path, &properties));
        let resolved2 = state2.and_then(|s| extract::value_at(s, path, &properties));
        let (state1, state2) = (resolved1.as_deref(), resolved2.as_deref());

        if clause.operation != Operation::Custom {
            let extractors = self.value_extractors.read().clone();
            return OperationEvaluator::new(&extractors, &self.regex_cache)
                .evaluate(clause, state1, state2);
        }

        let operation = self
            .custom_operations
            .read()
            .iter()
            .find(|op| op.applies_to(clause))
            .cloned();

        match operation {
            Some(operation) => operation
                .evaluate(clause, state1, state2, captures, self)
                .unwrap_or_else(|e| {
                    warn!(
                        operation = operation.name(),
                        error = %e,
                        "自定义操作执行失败，按不匹配处理"
                    );
                    OperationResult::no_match()
                }),
            None => {
                debug!(
                    custom_operation = clause.custom_operation.as_deref().unwrap_or_default(),
                    "没有适用的自定义操作"
                );
                OperationResult::no_match()
            }
        }
    }

    // ==================== 单条规则 ====================

    /// 评估单条规则
    ///
    /// 目标类型不符时直接返回不匹配；表达式或标签无法解析时记录告警并按不匹配处理。
    pub fn evaluate<'r>(
        &self,
        rule: &'r Rule,
        state1: Option<&Value>,
        state2: Option<&Value>,
    ) -> RuleEvaluation<'r> {
        // 类型名来自调用方的 FieldAccessor 实现
        match catch_unwind(AssertUnwindSafe(|| targets(rule, state1, state2))) {
            Ok(true) => {}
            Ok(false) => {
                debug!(rule = %rule.name, target = ?rule.target, "目标类型不符，跳过规则");
                return RuleEvaluation::new(rule);
            }
            Err(_) => {
                error!(
                    rule = %rule.name,
                    target = ?rule.target,
                    "读取状态类型名时发生异常，按不匹配处理"
                );
                metrics::counter!("rule_target_failures_total").increment(1);
                return RuleEvaluation::new(rule);
            }
        }

        let evaluation = match RuleExecutor::new(self).execute(rule, state1, state2) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                warn!(rule = %rule.name, error = %e, "规则评估失败，按不匹配处理");
                RuleEvaluation::new(rule)
            }
        };

        metrics::counter!(
            "rule_evaluations_total",
            "matched" => if evaluation.matched { "true" } else { "false" }
        )
        .increment(1);

        evaluation
    }

    pub fn applies(&self, rule: &Rule, state1: Option<&Value>, state2: Option<&Value>) -> bool {
        self.evaluate(rule, state1, state2).matched
    }

    /// 规则匹配时返回其捕获
    pub fn get_capture<'r>(
        &self,
        rule: &'r Rule,
        state1: Option<&Value>,
        state2: Option<&Value>,
    ) -> Option<RuleCapture<'r>> {
        self.evaluate(rule, state1, state2).into_capture()
    }

    // ==================== 批量 ====================

    /// 返回匹配的规则，不保证顺序
    #[instrument(skip_all, fields(rules = rules.len()))]
    pub fn analyze<'r>(
        &self,
        rules: &'r [Rule],
        state1: Option<&Value>,
        state2: Option<&Value>,
    ) -> Vec<&'r Rule> {
        self.fan_out(rules, |rule| {
            self.applies(rule, state1, state2).then_some(rule)
        })
    }

    /// 匹配规则的标签并集
    #[instrument(skip_all, fields(rules = rules.len()))]
    pub fn get_tags(
        &self,
        rules: &[Rule],
        state1: Option<&Value>,
        state2: Option<&Value>,
    ) -> BTreeSet<String> {
        self.fan_out(rules, |rule| {
            self.applies(rule, state1, state2)
                .then(|| rule.tags.clone())
        })
        .into_iter()
        .flatten()
        .collect()
    }

    /// 所有匹配规则的捕获，不保证顺序
    #[instrument(skip_all, fields(rules = rules.len()))]
    pub fn get_captures<'r>(
        &self,
        rules: &'r [Rule],
        state1: Option<&Value>,
        state2: Option<&Value>,
    ) -> Vec<RuleCapture<'r>> {
        self.fan_out(rules, |rule| self.get_capture(rule, state1, state2))
    }

    /// 把规则按工作线程数分块并行评估，各线程结果在汇合后拼接
    fn fan_out<'r, T, F>(&self, rules: &'r [Rule], evaluate: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&'r Rule) -> Option<T> + Sync,
    {
        let workers = self.config.worker_count().min(rules.len());
        if workers <= 1 {
            return rules.iter().filter_map(&evaluate).collect();
        }

        let chunk_size = rules.len().div_ceil(workers);
        let evaluate = &evaluate;

        let joined = crossbeam_utils::thread::scope(|scope| {
            let handles: Vec<_> = rules
                .chunks(chunk_size)
                .map(|chunk| scope.spawn(move |_| chunk.iter().filter_map(evaluate).collect::<Vec<T>>()))
                .collect();

            handles
                .into_iter()
                .flat_map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        error!("规则评估线程异常退出，丢弃该分块结果");
                        Vec::new()
                    })
                })
                .collect::<Vec<T>>()
        });

        joined.unwrap_or_else(|_| {
            error!("批量评估线程作用域异常结束");
            Vec::new()
        })
    }

    // ==================== 校验 ====================

    /// 校验规则定义
    pub fn enumerate_rule_issues<'r>(&self, rules: &'r [Rule]) -> Vec<Violation<'r>> {
        let operations = self.custom_operations.read().clone();
        RuleValidator::new(&operations)
            .with_regex_size_limit(self.regex_cache.size_limit())
            .enumerate_issues(rules)
    }

    pub fn is_rule_valid(&self, rule: &Rule) -> bool {
        self.enumerate_rule_issues(std::slice::from_ref(rule)).is_empty()
    }

    /// 以告警级别输出每条违规
    pub fn print_violations(&self, violations: &[Violation<'_>]) {
        for violation in violations {
            warn!(rule = %violation.rule.name, "{}", violation.description());
        }
    }
}

/// 规则目标类型过滤：取第一个非空状态的类型名，不区分大小写比较
fn targets(rule: &Rule, state1: Option<&Value>, state2: Option<&Value>) -> bool {
    let Some(target) = rule.target.as_deref() else {
        return true;
    };

    let sample = [state1, state2]
        .into_iter()
        .flatten()
        .find(|state| !state.is_null());

    match sample {
        Some(state) => state.kind_name().eq_ignore_ascii_case(target),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegexConfig;
    use crate::error::Result;
    use crate::models::CaptureValue;
    use crate::value::{FieldAccessor, Record};
    use serde_json::json;

    fn contains(word: &str) -> Clause {
        Clause::new(Operation::Contains).with_data([word])
    }

    // ==================== 子句评估 ====================

    #[test]
    fn test_field_path_resolution() {
        let analyzer = Analyzer::new();
        let state = Value::from(json!({"owner": {"name": "root"}}));
        let clause = Clause::new(Operation::Equals)
            .with_field("owner.name")
            .with_data(["root"]);

        assert!(analyzer.analyze_clause(&clause, Some(&state), None).applies);
        assert_eq!(analyzer.value_at(&state, "owner.name"), Some(Value::from("root")));
        assert_eq!(analyzer.value_at(&state, "owner.uid"), None);
    }

    #[test]
    fn test_null_field_treated_as_absent() {
        let analyzer = Analyzer::new();
        let state = Value::from(json!({"owner": null}));
        let clause = Clause::new(Operation::IsNull).with_field("owner");
        assert!(analyzer.analyze_clause(&clause, Some(&state), None).applies);
    }

    #[test]
    fn test_property_extractor() {
        let analyzer = Analyzer::new().with_property_extractor(|value: &Value, name: &str| {
            match (value, name) {
                (Value::String(s), "len") => Some(Value::Int(s.len() as i64)),
                _ => None,
            }
        });
        let clause = Clause::new(Operation::GreaterThan)
            .with_field("len")
            .with_data(["3"]);

        assert!(analyzer.analyze_clause(&clause, Some(&Value::from("abcdef")), None).applies);
        assert!(!analyzer.analyze_clause(&clause, Some(&Value::from("ab")), None).applies);
    }

    #[test]
    fn test_value_extractor() {
        let analyzer = Analyzer::new().with_value_extractor(|value: &Value| match value {
            Value::Object(obj) if obj.kind() == "Certificate" => {
                obj.field("Subject").map(|s| Extracted::scalar(s.render()))
            }
            _ => None,
        });
        let cert = Record::new("Certificate").with("Subject", "CN=example").into_value();

        assert_eq!(analyzer.to_values(&cert), Extracted::scalar("CN=example"));
        let clause = Clause::new(Operation::Equals).with_data(["CN=example"]);
        assert!(analyzer.analyze_clause(&clause, Some(&cert), None).applies);
    }

    struct Exploding;

    impl CustomOperation for Exploding {
        fn name(&self) -> &str {
            "Exploding"
        }

        fn evaluate<'r>(
            &self,
            _clause: &'r Clause,
            _state1: Option<&Value>,
            _state2: Option<&Value>,
            _captures: &[ClauseCapture<'r>],
            _analyzer: &Analyzer,
        ) -> Result<OperationResult<'r>> {
            panic!("boom");
        }
    }

    #[test]
    fn test_panic_is_contained() {
        let analyzer = Analyzer::new().with_custom_operation(Exploding);
        let clause = Clause::new(Operation::Custom).with_custom_operation("Exploding");
        let rule = Rule::new("explodes").with_clause(clause.clone());

        assert!(!analyzer.analyze_clause(&clause, Some(&Value::from("x")), None).applies);
        assert!(!analyzer.applies(&rule, Some(&Value::from("x")), None));
    }

    #[test]
    fn test_clear_custom_operations() {
        let analyzer = Analyzer::new().with_custom_operation(Exploding);
        analyzer.clear_custom_operations();
        let rule = Rule::new("r")
            .with_clause(Clause::new(Operation::Custom).with_custom_operation("Exploding"));
        assert!(!analyzer.is_rule_valid(&rule));
    }

    // ==================== 规则评估 ====================

    #[test]
    fn test_target_filter() {
        let analyzer = Analyzer::new();
        let rule = Rule::new("files")
            .with_target("filesystemobject")
            .with_clause(contains("passwd").with_field("Path"));

        let file = Record::new("FileSystemObject").with("Path", "/etc/passwd").into_value();
        let user = Record::new("UserAccount").with("Path", "/etc/passwd").into_value();

        assert!(analyzer.applies(&rule, Some(&file), None));
        assert!(!analyzer.applies(&rule, Some(&user), None));
        assert!(analyzer.applies(&rule, Some(&Value::Null), Some(&file)));
    }

    /// 读取类型名即崩溃的状态对象
    #[derive(Debug)]
    struct Faulty;

    impl FieldAccessor for Faulty {
        fn kind(&self) -> &str {
            panic!("kind unavailable");
        }

        fn field(&self, name: &str) -> Option<Value> {
            (name == "name").then(|| Value::from("x"))
        }
    }

    #[test]
    fn test_target_panic_is_contained() {
        let analyzer = Analyzer::with_config(AnalyzerConfig {
            workers: Some(2),
            ..AnalyzerConfig::default()
        });
        let state = Value::object(Faulty);
        let name_is_x = || Clause::new(Operation::Equals).with_field("name").with_data(["x"]);

        let mut rules = vec![Rule::new("targeted").with_target("Faulty").with_clause(name_is_x())];
        rules.extend((0..5).map(|i| Rule::new(format!("plain-{i}")).with_clause(name_is_x())));

        assert!(!analyzer.applies(&rules[0], Some(&state), None));

        let mut matched: Vec<_> = analyzer
            .analyze(&rules, Some(&state), None)
            .iter()
            .map(|r| r.name.clone())
            .collect();
        matched.sort();
        let expected: Vec<_> = (0..5).map(|i| format!("plain-{i}")).collect();
        assert_eq!(matched, expected);
    }

    #[test]
    fn test_invalid_expression_fails_closed() {
        let analyzer = Analyzer::new();
        let rule = Rule::new("broken")
            .with_clause(contains("x").with_label("a"))
            .with_expression("a AND");
        assert!(!analyzer.applies(&rule, Some(&Value::from("x")), None));
    }

    #[test]
    fn test_get_capture() {
        let analyzer = Analyzer::new();
        let rule = Rule::new("speech").with_clause(contains("free").capturing());

        let capture = analyzer
            .get_capture(&rule, Some(&Value::from("free speech")), None)
            .unwrap();
        assert_eq!(capture.captures.len(), 1);
        assert_eq!(
            capture.captures[0].result,
            Some(CaptureValue::Scalar("free speech".to_string()))
        );
        assert!(analyzer.get_capture(&rule, Some(&Value::from("quiet")), None).is_none());
    }

    // ==================== 批量 ====================

    fn ruleset() -> Vec<Rule> {
        (0..40)
            .map(|i| {
                let word = if i % 2 == 0 { "free" } else { "closed" };
                Rule::new(format!("rule-{i}"))
                    .with_clause(contains(word).capturing())
                    .with_tag(format!("tag-{}", i % 4))
            })
            .collect()
    }

    #[test]
    fn test_batch_matches_sequential() {
        let rules = ruleset();
        let state = Value::from("free speech");

        let parallel = Analyzer::with_config(AnalyzerConfig {
            workers: Some(4),
            ..AnalyzerConfig::default()
        });
        let sequential = Analyzer::with_config(AnalyzerConfig {
            workers: Some(1),
            ..AnalyzerConfig::default()
        });

        let mut a: Vec<_> = parallel.analyze(&rules, Some(&state), None).iter().map(|r| r.name.clone()).collect();
        let mut b: Vec<_> = sequential.analyze(&rules, Some(&state), None).iter().map(|r| r.name.clone()).collect();
        a.sort();
        b.sort();
        assert_eq!(a.len(), 20);
        assert_eq!(a, b);

        let tags = parallel.get_tags(&rules, Some(&state), None);
        assert_eq!(
            tags,
            BTreeSet::from(["tag-0".to_string(), "tag-2".to_string()])
        );

        assert_eq!(parallel.get_captures(&rules, Some(&state), None).len(), 20);
    }

    #[test]
    fn test_empty_batch() {
        let analyzer = Analyzer::new();
        assert!(analyzer.analyze(&[], Some(&Value::from("x")), None).is_empty());
        assert!(analyzer.get_tags(&[], None, None).is_empty());
    }

    // ==================== 校验 ====================

    #[test]
    fn test_is_rule_valid() {
        let analyzer = Analyzer::new();
        let good = Rule::new("good").with_clause(Clause::new(Operation::Equals).with_data(["x"]));
        let bad = Rule::new("bad").with_clause(Clause::new(Operation::Equals));

        assert!(analyzer.is_rule_valid(&good));
        assert!(!analyzer.is_rule_valid(&bad));

        let rules = [good, bad];
        let violations = analyzer.enumerate_rule_issues(&rules);
        assert_eq!(violations.len(), 1);
        analyzer.print_violations(&violations);
    }

    #[test]
    fn test_validation_uses_configured_regex_limit() {
        let rule = Rule::new("wide").with_clause(Clause::new(Operation::Regex).with_data([r"\w{200}"]));
        let limited = Analyzer::with_config(AnalyzerConfig {
            regex: RegexConfig {
                size_limit: Some(1024),
            },
            ..AnalyzerConfig::default()
        });

        assert!(Analyzer::new().is_rule_valid(&rule));
        assert!(!limited.is_rule_valid(&rule));
        assert!(!limited.applies(&rule, Some(&Value::from("x".repeat(200))), None));
    }
}
