//! 诊断信息收集
//!
//! 表达式回退、缺失变量、数据一致性问题都以 [`Diagnostic`] 的形式写入可注入的 sink，
//! 测试可以直接断言诊断内容，而不必依赖日志输出。

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use tracing::{error, warn};

/// 诊断级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Warning,
    Error,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// 一条诊断信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<u8>,
    /// 行号（从 0 开始）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            stage: None,
            row: None,
            rule_id: None,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            ..Self::warning(message)
        }
    }

    pub fn at_stage(mut self, stage: u8) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn at_row(mut self, row: usize) -> Self {
        self.row = Some(row);
        self
    }

    pub fn for_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.level)?;
        if let Some(stage) = self.stage {
            write!(f, " step {}", stage)?;
        }
        if let Some(row) = self.row {
            write!(f, " row {}", row + 1)?;
        }
        if let Some(rule_id) = &self.rule_id {
            write!(f, " rule {}", rule_id)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// 诊断信息接收端
#[cfg_attr(test, mockall::automock)]
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, diagnostic: Diagnostic);
}

/// 默认 sink：保存全部诊断并同步输出到 tracing
#[derive(Debug, Default)]
pub struct DiagnosticCollector {
    entries: Mutex<Vec<Diagnostic>>,
}

impl DiagnosticCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前已收集的诊断快照
    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.entries.lock().clone()
    }

    /// 取出并清空已收集的诊断
    pub fn drain(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn count(&self, level: DiagnosticLevel) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|d| d.level == level)
            .count()
    }
}

impl DiagnosticSink for DiagnosticCollector {
    fn record(&self, diagnostic: Diagnostic) {
        match diagnostic.level {
            DiagnosticLevel::Warning => warn!(
                stage = ?diagnostic.stage,
                row = ?diagnostic.row,
                rule_id = ?diagnostic.rule_id,
                "{}",
                diagnostic.message
            ),
            DiagnosticLevel::Error => error!(
                stage = ?diagnostic.stage,
                row = ?diagnostic.row,
                rule_id = ?diagnostic.rule_id,
                "{}",
                diagnostic.message
            ),
        }
        self.entries.lock().push(diagnostic);
    }
}

/// 丢弃所有诊断的 sink（仍输出 tracing 日志）
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlySink;

impl DiagnosticSink for LogOnlySink {
    fn record(&self, diagnostic: Diagnostic) {
        warn!("{}", diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_records_and_drains() {
        let collector = DiagnosticCollector::new();
        collector.record(Diagnostic::warning("missing variable RATE").at_row(2));
        collector.record(Diagnostic::error("negative arrears").at_stage(2).for_rule("r1"));

        assert_eq!(collector.len(), 2);
        assert_eq!(collector.count(DiagnosticLevel::Error), 1);

        let drained = collector.drain();
        assert_eq!(drained.len(), 2);
        assert!(collector.is_empty());
    }

    #[test]
    fn test_display_is_one_based() {
        let diagnostic = Diagnostic::warning("bad date").at_stage(4).at_row(0);
        assert_eq!(diagnostic.to_string(), "[warning] step 4 row 1: bad date");
    }
}
