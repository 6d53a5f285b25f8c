//! 规则操作符定义

use crate::error::RuleError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 批量更新条件的比较操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = "=", alias = "==")]
    Eq,
    #[serde(rename = "!=", alias = "<>")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=", alias = "=<")]
    Lte,
    #[serde(rename = ">=", alias = "=>")]
    Gte,
}

impl ComparisonOperator {
    /// 表达式中识别的比较符号，双字符在前，避免把 `<=` 拆成 `<`
    ///
    /// 与反序列化接受的别名保持一致。
    pub const EXPRESSION_TOKENS: [(&'static str, ComparisonOperator); 10] = [
        ("<=", Self::Lte),
        (">=", Self::Gte),
        ("==", Self::Eq),
        ("!=", Self::Neq),
        ("<>", Self::Neq),
        ("=<", Self::Lte),
        ("=>", Self::Gte),
        ("<", Self::Lt),
        (">", Self::Gt),
        ("=", Self::Eq),
    ];

    /// 数值比较
    pub fn compare_numbers(self, left: f64, right: f64) -> bool {
        match self {
            Self::Eq => (left - right).abs() < f64::EPSILON,
            Self::Neq => (left - right).abs() >= f64::EPSILON,
            Self::Lt => left < right,
            Self::Gt => left > right,
            Self::Lte => left <= right,
            Self::Gte => left >= right,
        }
    }

    /// 字符串比较
    pub fn compare_strings(self, left: &str, right: &str) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Neq => left != right,
            Self::Lt => left < right,
            Self::Gt => left > right,
            Self::Lte => left <= right,
            Self::Gte => left >= right,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Neq => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Lte => "<=",
            Self::Gte => ">=",
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ComparisonOperator {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "=" | "==" => Ok(Self::Eq),
            "!=" | "<>" => Ok(Self::Neq),
            "<" => Ok(Self::Lt),
            ">" => Ok(Self::Gt),
            "<=" | "=<" => Ok(Self::Lte),
            ">=" | "=>" => Ok(Self::Gte),
            other => Err(RuleError::InvalidOperator(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_serde_aliases() {
        let op: ComparisonOperator = serde_json::from_str(r#""==""#).unwrap();
        assert_eq!(op, ComparisonOperator::Eq);
        let op: ComparisonOperator = serde_json::from_str(r#""=<""#).unwrap();
        assert_eq!(op, ComparisonOperator::Lte);
        assert_eq!(serde_json::to_string(&ComparisonOperator::Gte).unwrap(), r#"">=""#);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("<>".parse::<ComparisonOperator>().unwrap(), ComparisonOperator::Neq);
        assert!("~".parse::<ComparisonOperator>().is_err());
    }

    #[test]
    fn test_expression_tokens_cover_every_alias() {
        for alias in ["=", "==", "!=", "<>", "<", ">", "<=", "=<", ">=", "=>"] {
            let parsed: ComparisonOperator = alias.parse().unwrap();
            let token = ComparisonOperator::EXPRESSION_TOKENS
                .iter()
                .find(|(t, _)| *t == alias)
                .map(|(_, op)| *op);
            assert_eq!(token, Some(parsed), "alias {}", alias);
        }
    }

    #[test]
    fn test_compare_numbers() {
        assert!(ComparisonOperator::Eq.compare_numbers(100.0, 100.0));
        assert!(ComparisonOperator::Lte.compare_numbers(5.0, 5.0));
        assert!(!ComparisonOperator::Gt.compare_numbers(5.0, 5.0));
        assert!(ComparisonOperator::Neq.compare_numbers(1.0, 2.0));
    }
}
