//! 规则引擎集成测试
//!
//! 覆盖规则加载、校验、评估与批量接口的完整工作流。

use chrono::{Duration, Utc};
use rule_analyzer::{
    Analyzer, AnalyzerConfig, CaptureValue, Clause, ExpressionError, Operation, Record, Rule,
    RuleExecutor, Value, ViolationKind,
};
use serde_json::json;

fn s(text: &str) -> Value {
    Value::from(text)
}

/// 三个子句：a、c 对 "x" 成立，b 不成立
fn abc_rule(expression: &str) -> Rule {
    Rule::new(expression)
        .with_clause(Clause::new(Operation::Equals).with_data(["x"]).with_label("a"))
        .with_clause(Clause::new(Operation::Equals).with_data(["y"]).with_label("b"))
        .with_clause(Clause::new(Operation::StartsWith).with_data(["x"]).with_label("c"))
        .with_expression(expression)
}

/// 创建一个文件对象状态
fn file(path: &str, mode: i64) -> Value {
    Record::new("FileSystemObject")
        .with("Path", path)
        .with("Mode", mode)
        .with("Owner", Value::from(json!({"name": "root", "uid": 0})))
        .into_value()
}

// ==================== 操作场景 ====================

#[test]
fn test_contains_scalar_with_capture() {
    let analyzer = Analyzer::new();
    let clause = Clause::new(Operation::Contains).with_data(["free"]).capturing();

    let result = analyzer.analyze_clause(&clause, Some(&s("free speech")), None);
    assert!(result.applies);
    assert_eq!(
        result.capture.unwrap().result,
        Some(CaptureValue::Scalar("free speech".to_string()))
    );
}

#[test]
fn test_less_than() {
    let analyzer = Analyzer::new();
    let clause = Clause::new(Operation::LessThan).with_data(["10"]);

    assert!(analyzer.analyze_clause(&clause, Some(&s("5")), None).applies);
    assert!(!analyzer.analyze_clause(&clause, Some(&s("15")), None).applies);

    let inverted = clause.clone().inverted();
    assert!(analyzer.analyze_clause(&inverted, Some(&s("15")), None).applies);
}

#[test]
fn test_was_modified() {
    let analyzer = Analyzer::new();
    let clause = Clause::new(Operation::WasModified).capturing();
    let before = Value::from(json!({"x": 1}));
    let after = Value::from(json!({"x": 2}));

    let result = analyzer.analyze_clause(&clause, Some(&before), Some(&after));
    assert!(result.applies);
    match result.capture.unwrap().result {
        Some(CaptureValue::Comparison(comparison)) => {
            assert_eq!(comparison.differences.len(), 1);
            assert_eq!(comparison.differences[0].path, "x");
        }
        other => panic!("unexpected capture: {:?}", other),
    }

    assert!(
        !analyzer
            .analyze_clause(&clause, Some(&before), Some(&before.clone()))
            .applies
    );
}

#[test]
fn test_field_paths_on_objects() {
    let analyzer = Analyzer::new();
    let state = file("/etc/shadow", 0o644);

    let owner = Clause::new(Operation::Equals)
        .with_field("Owner.name")
        .with_data(["root"]);
    let mode = Clause::new(Operation::GreaterThan)
        .with_field("Mode")
        .with_data(["384"]);
    let missing = Clause::new(Operation::IsNull).with_field("Owner.group");

    assert!(analyzer.analyze_clause(&owner, Some(&state), None).applies);
    assert!(analyzer.analyze_clause(&mode, Some(&state), None).applies);
    assert!(analyzer.analyze_clause(&missing, Some(&state), None).applies);
}

#[test]
fn test_regex_and_time_operations() {
    let analyzer = Analyzer::new();

    let regex = Clause::new(Operation::Regex)
        .with_data(["^/etc/", "\\.conf$"])
        .capturing();
    let result = analyzer.analyze_clause(&regex, Some(&s("/etc/passwd")), None);
    assert!(result.applies);
    assert!(matches!(
        result.capture.unwrap().result,
        Some(CaptureValue::Matches(ref m)) if m[0].text == "/etc/"
    ));

    let yesterday = Value::DateTime(Utc::now() - Duration::days(1));
    let expired = Clause::new(Operation::IsExpired);
    let before = Clause::new(Operation::IsBefore).with_data(["2999-01-01T00:00:00Z"]);
    assert!(analyzer.analyze_clause(&expired, Some(&yesterday), None).applies);
    assert!(analyzer.analyze_clause(&before, Some(&yesterday), None).applies);
}

#[test]
fn test_invert_symmetry() {
    let analyzer = Analyzer::new();
    let state = Value::from(json!({"name": "svc", "tags": ["a", "b"], "enabled": true}));

    let clauses = [
        Clause::new(Operation::Equals).with_field("name").with_data(["svc"]),
        Clause::new(Operation::Contains).with_field("tags").with_data(["a", "c"]),
        Clause::new(Operation::ContainsAny).with_field("tags").with_data(["a", "c"]),
        Clause::new(Operation::ContainsKey).with_data(["enabled"]),
        Clause::new(Operation::StartsWith).with_field("name").with_data(["sv"]),
        Clause::new(Operation::EndsWith).with_field("name").with_data(["zz"]),
        Clause::new(Operation::Regex).with_field("name").with_data(["^s"]),
        Clause::new(Operation::IsNull).with_field("owner"),
        Clause::new(Operation::IsTrue).with_field("enabled"),
    ];

    for clause in &clauses {
        let plain = analyzer.analyze_clause(clause, Some(&state), None).applies;
        let inverted = clause.clone().inverted();
        assert_eq!(
            analyzer.analyze_clause(&inverted, Some(&state), None).applies,
            !plain,
            "{}",
            clause.operation
        );
    }
}

// ==================== 表达式测试 ====================

#[test]
fn test_parenthesized_expressions() {
    let analyzer = Analyzer::new();
    let state = s("x");

    assert!(analyzer.applies(&abc_rule("(a OR b) AND c"), Some(&state), None));
    assert!(analyzer.applies(&abc_rule("a AND (b OR c)"), Some(&state), None));
    assert!(!analyzer.applies(&abc_rule("(a AND b)"), Some(&state), None));
}

#[test]
fn test_label_resolution() {
    let analyzer = Analyzer::new();

    for (value, a, b) in [("x", true, false), ("y", false, true), ("z", false, false)] {
        let state = s(value);
        let both = abc_rule("a AND b");
        let not_b = abc_rule("a AND NOT b");
        assert_eq!(analyzer.applies(&both, Some(&state), None), a && b);
        assert_eq!(analyzer.applies(&not_b, Some(&state), None), a && !b);
    }
}

#[test]
fn test_short_circuit_equivalence() {
    let analyzer = Analyzer::new();
    let expressions = [
        "a AND b",
        "b AND a",
        "a OR b",
        "b OR (a AND c)",
        "a NAND b",
        "b NOR c",
        "a XOR c",
        "NOT a OR (b AND NOT c)",
        "(a OR b) AND (b OR c) AND NOT b",
    ];

    for value in ["x", "y"] {
        let state = s(value);
        for expression in expressions {
            let rule = abc_rule(expression);
            let run = |short_circuit: bool| {
                RuleExecutor::new(&analyzer)
                    .with_short_circuit(short_circuit)
                    .execute(&rule, Some(&state), None)
                    .unwrap()
            };
            let fast = run(true);
            let slow = run(false);
            assert_eq!(fast.matched, slow.matched, "{} on {}", expression, value);
            assert!(fast.clauses_evaluated <= slow.clauses_evaluated);
        }
    }
}

#[test]
fn test_long_flat_expression() {
    let analyzer = Analyzer::new();
    let state = s("x");

    let mut terms = vec!["b"; 10_000];
    terms.extend(["a", "c"]);
    let rule = abc_rule(&terms.join(" OR "));
    assert!(analyzer.applies(&rule, Some(&state), None));
    assert!(analyzer.enumerate_rule_issues(std::slice::from_ref(&rule)).is_empty());

    let all = abc_rule(&vec!["a"; 10_000].join(" AND "));
    assert!(analyzer.applies(&all, Some(&state), None));
}

#[test]
fn test_deep_nesting_fails_closed() {
    let analyzer = Analyzer::new();
    let depth = 10_000;
    let rule = abc_rule(&format!("{}a{}", "(".repeat(depth), ")".repeat(depth)));

    assert!(!analyzer.applies(&rule, Some(&s("x")), None));
    let violations = analyzer.enumerate_rule_issues(std::slice::from_ref(&rule));
    assert!(violations.iter().any(|v| matches!(
        v.kind,
        ViolationKind::MalformedExpression {
            source: ExpressionError::TooDeep(_),
            ..
        }
    )));
}

// ==================== 正则缓存测试 ====================

#[test]
fn test_regex_cache_idempotence() {
    let analyzer = Analyzer::new();
    let valid = Clause::new(Operation::Regex).with_data(["ab+c"]);
    let invalid = Clause::new(Operation::Regex).with_data(["ab(c"]);
    let state = s("xxabbbc");

    for _ in 0..3 {
        assert!(analyzer.analyze_clause(&valid, Some(&state), None).applies);
        assert!(!analyzer.analyze_clause(&invalid, Some(&state), None).applies);
        assert!(
            !analyzer
                .analyze_clause(&invalid.clone().inverted(), Some(&state), None)
                .applies
        );
    }
    assert_eq!(analyzer.regex_cache().compilations(), 2);
}

// ==================== 校验测试 ====================

#[test]
fn test_validator_completeness() {
    let analyzer = Analyzer::new();
    let empty = Rule::new("empty").with_clause(Clause::new(Operation::Equals));
    let single = Rule::new("single").with_clause(Clause::new(Operation::Equals).with_data(["x"]));

    assert!(!analyzer.enumerate_rule_issues(std::slice::from_ref(&empty)).is_empty());
    assert!(analyzer.enumerate_rule_issues(std::slice::from_ref(&single)).is_empty());
}

#[test]
fn test_validator_reports_expression_defects() {
    let analyzer = Analyzer::new();
    let rules = vec![
        abc_rule("a AND"),
        abc_rule("a AND (b OR c"),
        abc_rule("a AND d"),
        abc_rule("a NOT b"),
        abc_rule("a AND b OR c"),
    ];

    let violations = analyzer.enumerate_rule_issues(&rules);
    let of = |name: &str| -> Vec<&ViolationKind> {
        violations
            .iter()
            .filter(|v| v.rule.name == name)
            .map(|v| &v.kind)
            .collect()
    };

    assert!(of("a AND").iter().any(|k| matches!(k, ViolationKind::EndsWithOperator { .. })));
    assert!(
        of("a AND (b OR c")
            .iter()
            .any(|k| matches!(k, ViolationKind::UnclosedParentheses { .. }))
    );
    assert!(of("a AND d").iter().any(|k| matches!(k, ViolationKind::UndefinedLabel { .. })));
    assert!(!of("a NOT b").is_empty());
    assert!(of("a AND b OR c").is_empty());
}

// ==================== 完整工作流测试 ====================

#[test]
fn test_full_workflow_from_json() {
    let rules: Vec<Rule> = serde_json::from_value(json!([
        {
            "name": "World writable config",
            "target": "FileSystemObject",
            "severity": 3,
            "tags": ["files", "permissions"],
            "expression": "conf AND writable",
            "clauses": [
                {"operation": "EndsWith", "field": "Path", "data": [".conf"], "label": "conf"},
                {"operation": "GreaterThan", "field": "Mode", "data": ["256"], "label": "writable", "capture": true}
            ]
        },
        {
            "name": "Root owned",
            "tags": ["ownership"],
            "clauses": [
                {"operation": "Equals", "field": "Owner.name", "data": ["root"]}
            ]
        },
        {
            "name": "Registry only",
            "target": "RegistryObject",
            "tags": ["registry"],
            "clauses": [
                {"operation": "IsNull", "field": "Value"}
            ]
        }
    ]))
    .unwrap();

    let analyzer = Analyzer::with_config(AnalyzerConfig {
        workers: Some(2),
        ..AnalyzerConfig::default()
    });
    assert!(analyzer.enumerate_rule_issues(&rules).is_empty());

    let state = file("/etc/app.conf", 0o777);
    let matched: Vec<&str> = analyzer
        .analyze(&rules, Some(&state), None)
        .iter()
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(matched.len(), 2);
    assert!(matched.contains(&"World writable config"));
    assert!(matched.contains(&"Root owned"));

    let tags = analyzer.get_tags(&rules, Some(&state), None);
    assert!(tags.contains("permissions"));
    assert!(!tags.contains("registry"));

    let captures = analyzer.get_captures(&rules, Some(&state), None);
    let writable = captures
        .iter()
        .find(|c| c.rule.name == "World writable config")
        .unwrap();
    assert_eq!(writable.captures.len(), 1);
    assert_eq!(writable.captures[0].result, Some(CaptureValue::Int(0o777)));
}

#[test]
fn test_rule_with_both_operands_is_rejected() {
    let result: Result<Rule, _> = serde_json::from_value(json!({
        "name": "both",
        "clauses": [
            {"operation": "Contains", "data": ["a"], "dict_data": [["k", "v"]]}
        ]
    }));
    assert!(result.is_err());
}
