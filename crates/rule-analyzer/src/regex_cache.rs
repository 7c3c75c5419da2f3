//! 正则表达式编译缓存
//!
//! 使用 DashMap 实现并发的"不存在才插入"。语法无效的模式同样缓存，
//! 以 `None` 记录，之后的调用直接视为永不匹配，不再重复编译。
//! 缓存条目不会淘汰，由持有它的 `Analyzer` 决定生命周期。

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// 正则缓存，克隆后共享同一份存储
#[derive(Debug, Clone, Default)]
pub struct RegexCache {
    patterns: Arc<DashMap<String, Option<Arc<Regex>>>>,
    /// 编译后的状态机大小上限（字节）
    size_limit: Option<usize>,
    /// 实际编译次数
    compilations: Arc<AtomicUsize>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size_limit(size_limit: Option<usize>) -> Self {
        Self {
            size_limit,
            ..Self::default()
        }
    }

    /// 获取已编译的正则，首次访问时编译
    ///
    /// 模式无效时返回 `None`。
    pub fn get_or_compile(&self, pattern: &str) -> Option<Arc<Regex>> {
        if let Some(entry) = self.patterns.get(pattern) {
            return entry.value().clone();
        }

        self.patterns
            .entry(pattern.to_string())
            .or_insert_with(|| self.compile(pattern))
            .value()
            .clone()
    }

    fn compile(&self, pattern: &str) -> Option<Arc<Regex>> {
        self.compilations.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("regex_cache_compilations_total").increment(1);

        match Self::build(pattern, self.size_limit) {
            Ok(regex) => {
                debug!(pattern = %pattern, "正则已编译并缓存");
                Some(Arc::new(regex))
            }
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "正则编译失败，缓存为永不匹配");
                None
            }
        }
    }

    /// 按给定大小上限编译，不写入缓存
    pub fn build(pattern: &str, size_limit: Option<usize>) -> Result<Regex, regex::Error> {
        let mut builder = RegexBuilder::new(pattern);
        if let Some(limit) = size_limit {
            builder.size_limit(limit);
        }
        builder.build()
    }

    /// 校验模式能否在给定大小上限内编译，不写入缓存
    pub fn is_valid(pattern: &str, size_limit: Option<usize>) -> bool {
        Self::build(pattern, size_limit).is_ok()
    }

    pub fn size_limit(&self) -> Option<usize> {
        self.size_limit
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.patterns.contains_key(pattern)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }
}
