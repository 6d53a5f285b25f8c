//! 规则引擎错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("规则解析失败: {0}")]
    ParseError(String),

    #[error("表达式求值失败 '{expression}': {reason}")]
    EvaluationError { expression: String, reason: String },

    #[error("无效的操作符: {0}")]
    InvalidOperator(String),

    #[error("字段名不能为空: {0}")]
    EmptyField(String),

    #[error("字段 {field} 含嵌套值，行数据只允许标量")]
    NestedValue { field: String },

    #[error("行数变化: 规则 {rule_id} 执行前 {before} 行, 执行后 {after} 行")]
    RowCountMismatch {
        rule_id: String,
        before: usize,
        after: usize,
    },

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("文件读取失败: {0}")]
    IoError(#[from] std::io::Error),
}

impl RuleError {
    pub(crate) fn evaluation(expression: &str, reason: impl Into<String>) -> Self {
        Self::EvaluationError {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuleError>;
