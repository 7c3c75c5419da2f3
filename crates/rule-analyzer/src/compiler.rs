//! 表达式编译器
//!
//! 把规则的布尔表达式字符串解析为语法树，只解析一次并缓存。
//!
//! 表达式按空白切分为词元，每个词元满足：
//!
//! ```text
//! token := "("* core ")"*
//! core  := 不含括号的字符序列（可为空，但不能同时有左右括号而 core 为空）
//! ```
//!
//! 词元展开为 `(`、单词、`)` 三类词素后按下述文法解析，
//! 二元操作符无优先级，从左到右结合：
//!
//! ```text
//! expr    := unary (OPERATOR unary)*
//! unary   := "NOT" unary | primary
//! primary := "(" expr ")" | LABEL
//! ```
//!
//! 同一层的操作数序列保存为扁平的 [`Expression::Chain`]，只有括号和
//! `NOT` 会加深语法树，其嵌套层数不超过 [`MAX_NESTING`]。

use crate::error::{Result, RuleError};
use crate::operators::BoolOperator;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// 表达式解析错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("表达式为空")]
    Empty,

    #[error("期望操作数，实际为 '{0}'")]
    ExpectedOperand(String),

    #[error("期望布尔操作符，实际为 '{0}'")]
    ExpectedOperator(String),

    #[error("NOT 只能作为操作数前缀，不能作为二元操作符")]
    NotAsOperator,

    #[error("多余的右括号")]
    UnbalancedClose,

    #[error("存在未闭合的左括号")]
    Unclosed,

    #[error("词元 '{0}' 的括号位置非法")]
    MalformedToken(String),

    #[error("词元 '{0}' 的括号内没有操作数")]
    EmptyOperand(String),

    #[error("括号与 NOT 的嵌套超过 {0} 层")]
    TooDeep(usize),
}

/// 括号与 `NOT` 的最大嵌套层数
pub const MAX_NESTING: usize = 128;

const END: &str = "<结尾>";

/// 词素
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lexeme<'e> {
    Open,
    Close,
    Word(&'e str),
}

/// 单个词元的结构：前导左括号数、核心文本、后缀右括号数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenShape<'e> {
    pub opens: usize,
    pub core: &'e str,
    pub closes: usize,
}

impl<'e> TokenShape<'e> {
    /// 拆分词元，不做合法性判断
    pub fn of(token: &'e str) -> Self {
        let rest = token.trim_start_matches('(');
        let opens = token.len() - rest.len();
        let core = rest.trim_end_matches(')');
        let closes = rest.len() - core.len();
        Self {
            opens,
            core,
            closes,
        }
    }
}

/// 切分表达式为词元
pub fn tokenize(expression: &str) -> Vec<&str> {
    expression.split_whitespace().collect()
}

/// 把单个词元展开为词素
pub fn lex_token(token: &str) -> std::result::Result<Vec<Lexeme<'_>>, ExpressionError> {
    let shape = TokenShape::of(token);

    if shape.core.contains(['(', ')']) {
        return Err(ExpressionError::MalformedToken(token.to_string()));
    }
    if shape.core.is_empty() && shape.opens > 0 && shape.closes > 0 {
        return Err(ExpressionError::EmptyOperand(token.to_string()));
    }

    let mut lexemes = Vec::with_capacity(shape.opens + shape.closes + 1);
    lexemes.extend(std::iter::repeat_n(Lexeme::Open, shape.opens));
    if !shape.core.is_empty() {
        lexemes.push(Lexeme::Word(shape.core));
    }
    lexemes.extend(std::iter::repeat_n(Lexeme::Close, shape.closes));
    Ok(lexemes)
}

/// 表达式语法树
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    /// 子句标签或子句下标
    Operand(String),
    Not(Box<Expression>),
    Group(Box<Expression>),
    /// 同一层按从左到右顺序结合的操作数序列
    Chain {
        first: Box<Expression>,
        rest: Vec<(BoolOperator, Expression)>,
    },
}

impl Expression {
    pub fn parse(expression: &str) -> std::result::Result<Self, ExpressionError> {
        let mut lexemes = Vec::new();
        for token in tokenize(expression) {
            lexemes.extend(lex_token(token)?);
        }

        if lexemes.is_empty() {
            return Err(ExpressionError::Empty);
        }

        let mut parser = Parser {
            lexemes: &lexemes,
            pos: 0,
            depth: 0,
        };
        let tree = parser.expr()?;

        match parser.peek() {
            None => Ok(tree),
            Some(Lexeme::Close) => Err(ExpressionError::UnbalancedClose),
            Some(other) => Err(ExpressionError::ExpectedOperator(describe(other))),
        }
    }

    /// 表达式引用的全部操作数（按出现顺序）
    pub fn operands(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_operands(&mut out);
        out
    }

    fn collect_operands<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Operand(label) => out.push(label),
            Self::Not(inner) | Self::Group(inner) => inner.collect_operands(out),
            Self::Chain { first, rest } => {
                first.collect_operands(out);
                for (_, operand) in rest {
                    operand.collect_operands(out);
                }
            }
        }
    }
}

fn describe(lexeme: Lexeme<'_>) -> String {
    match lexeme {
        Lexeme::Open => "(".to_string(),
        Lexeme::Close => ")".to_string(),
        Lexeme::Word(word) => word.to_string(),
    }
}

struct Parser<'l, 'e> {
    lexemes: &'l [Lexeme<'e>],
    pos: usize,
    /// 当前括号与 NOT 的嵌套层数
    depth: usize,
}

impl<'l, 'e> Parser<'l, 'e> {
    fn peek(&self) -> Option<Lexeme<'e>> {
        self.lexemes.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Lexeme<'e>> {
        let lexeme = self.peek();
        if lexeme.is_some() {
            self.pos += 1;
        }
        lexeme
    }

    fn expr(&mut self) -> std::result::Result<Expression, ExpressionError> {
        let first = self.unary()?;
        let mut rest = Vec::new();

        while let Some(Lexeme::Word(word)) = self.peek() {
            let op = match word.parse::<BoolOperator>() {
                Ok(BoolOperator::Not) => return Err(ExpressionError::NotAsOperator),
                Ok(op) => op,
                Err(_) => return Err(ExpressionError::ExpectedOperator(word.to_string())),
            };
            self.pos += 1;
            rest.push((op, self.unary()?));
        }

        if rest.is_empty() {
            return Ok(first);
        }
        Ok(Expression::Chain {
            first: Box::new(first),
            rest,
        })
    }

    fn unary(&mut self) -> std::result::Result<Expression, ExpressionError> {
        match self.next() {
            None => Err(ExpressionError::ExpectedOperand(END.to_string())),
            Some(Lexeme::Close) => Err(ExpressionError::ExpectedOperand(")".to_string())),
            Some(Lexeme::Open) => {
                let inner = self.nested(Self::expr)?;
                match self.next() {
                    Some(Lexeme::Close) => Ok(Expression::Group(Box::new(inner))),
                    None => Err(ExpressionError::Unclosed),
                    Some(other) => Err(ExpressionError::ExpectedOperator(describe(other))),
                }
            }
            Some(Lexeme::Word(word)) => match word.parse::<BoolOperator>() {
                Ok(BoolOperator::Not) => Ok(Expression::Not(Box::new(self.nested(Self::unary)?))),
                Ok(_) => Err(ExpressionError::ExpectedOperand(word.to_string())),
                Err(_) => Ok(Expression::Operand(word.to_string())),
            },
        }
    }

    /// 进入一层括号或 NOT
    fn nested(
        &mut self,
        parse: fn(&mut Self) -> std::result::Result<Expression, ExpressionError>,
    ) -> std::result::Result<Expression, ExpressionError> {
        if self.depth >= MAX_NESTING {
            return Err(ExpressionError::TooDeep(MAX_NESTING));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }
}

/// 表达式编译器，按表达式文本缓存解析结果（包括失败结果）
#[derive(Debug, Default)]
pub struct ExpressionCompiler {
    cache: DashMap<String, std::result::Result<Arc<Expression>, ExpressionError>>,
    compile_count: AtomicU64,
}

impl ExpressionCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 编译表达式
    pub fn compile(&self, expression: &str) -> Result<Arc<Expression>> {
        if let Some(entry) = self.cache.get(expression) {
            return Self::to_result(expression, entry.value());
        }

        let entry = self
            .cache
            .entry(expression.to_string())
            .or_insert_with(|| {
                self.compile_count.fetch_add(1, Ordering::Relaxed);
                Expression::parse(expression).map(Arc::new)
            });
        Self::to_result(expression, entry.value())
    }

    fn to_result(
        expression: &str,
        cached: &std::result::Result<Arc<Expression>, ExpressionError>,
    ) -> Result<Arc<Expression>> {
        cached
            .as_ref()
            .map(Arc::clone)
            .map_err(|e| RuleError::InvalidExpression {
                expression: expression.to_string(),
                source: e.clone(),
            })
    }

    /// 实际解析次数
    pub fn compile_count(&self) -> u64 {
        self.compile_count.load(Ordering::Relaxed)
    }
}
