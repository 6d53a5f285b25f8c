//! 表达式与条件评估器
//!
//! [`ExpressionEvaluator`] 对一行数据求值规则中的字符串表达式，按以下顺序逐遍改写：
//!
//! 1. `${NAME}` 变量替换（缺失变量替换为 0 并记录警告）
//! 2. `WORDS(...)` / `INT(...)` 函数调用
//! 3. 一元取负的 `-(FIELD)`
//! 4. 行内字段替换为数值
//! 5. 数字字面量、纯文本直接返回；比较表达式返回布尔；其余按算术求值
//!
//! 求值失败不会中断流水线：[`ExpressionEvaluator::evaluate`] 记录诊断后返回原始表达式文本。
//!
//! [`ConditionEvaluator`] 负责批量更新操作上的单一比较条件。

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::error::{Result, RuleError};
use crate::expression::{eval_arithmetic, is_arithmetic};
use crate::models::{
    CellValue, Row, SimpleCondition, VariableTable, format_number, parse_numeric_literal,
};
use crate::operators::ComparisonOperator;
use crate::words::amount_to_words;
use billing_shared::observability::metrics;
use regex::{Captures, Regex};
use std::sync::OnceLock;

fn variable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid variable regex"))
}

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("valid identifier regex"))
}

fn negated_field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"-\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*\)").expect("valid negation regex")
    })
}

/// 运算符字符：出现任意一个即不再视为纯文本
const OPERATOR_CHARS: &[char] = &['+', '-', '*', '/', '<', '>', '=', '!', '(', ')', '&', '|'];

/// 支持的函数
const FUNCTIONS: [&str; 2] = ["WORDS", "INT"];

fn is_identifier(s: &str) -> bool {
    identifier_regex()
        .find(s)
        .is_some_and(|m| m.start() == 0 && m.end() == s.len())
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// 单引号或双引号包裹的文本字面量
fn quoted_literal(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' || first == b'"') && first == last {
            return Some(&s[1..s.len() - 1]);
        }
    }
    None
}

/// 去掉包裹整个表达式的一层或多层括号
fn strip_outer_parens(s: &str) -> &str {
    let mut current = s.trim();
    while current.starts_with('(') && current.ends_with(')') {
        if matching_close(current, 0) != Some(current.len() - 1) {
            break;
        }
        current = current[1..current.len() - 1].trim();
    }
    current
}

/// 从 `open`（必须是 '('）开始找到匹配的右括号位置
fn matching_close(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// 在括号外按分隔符切分
fn split_top_level<'s>(s: &'s str, separator: &str) -> Vec<&'s str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    let mut i = 0;
    let bytes = s.as_bytes();

    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {}
        }
        if depth == 0 && bytes[i..].starts_with(separator.as_bytes()) {
            parts.push(&s[start..i]);
            i += separator.len();
            start = i;
            continue;
        }
        i += 1;
    }
    parts.push(&s[start..]);
    parts
}

/// 表达式中引用的字段名（不含变量、函数名和引号内文本）
pub fn referenced_fields(expression: &str) -> Vec<String> {
    let trimmed = expression.trim();
    if quoted_literal(trimmed).is_some() {
        return Vec::new();
    }

    let without_variables = variable_regex().replace_all(trimmed, "");
    let mut fields: Vec<String> = identifier_regex()
        .find_iter(&without_variables)
        .map(|m| m.as_str())
        .filter(|token| !FUNCTIONS.contains(token))
        .map(str::to_string)
        .collect();
    fields.dedup();
    fields
}

/// 单独作为表达式出现的字段：数字字符串转为数字，其余原样返回
fn bare_field_value(value: &CellValue) -> CellValue {
    match value {
        CellValue::Text(s) => parse_numeric_literal(s)
            .map(CellValue::Number)
            .unwrap_or_else(|| value.clone()),
        other => other.clone(),
    }
}

/// 表达式评估器
///
/// 只借用变量表和诊断 sink，复制成本很低；引擎为每条规则、每一行生成带上下文的副本。
#[derive(Clone, Copy)]
pub struct ExpressionEvaluator<'a> {
    variables: &'a VariableTable,
    sink: &'a dyn DiagnosticSink,
    row_index: Option<usize>,
    rule_id: Option<&'a str>,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(variables: &'a VariableTable, sink: &'a dyn DiagnosticSink) -> Self {
        Self {
            variables,
            sink,
            row_index: None,
            rule_id: None,
        }
    }

    /// 绑定诊断上下文（行号、规则 ID）
    pub fn scoped(&self, row_index: usize, rule_id: &'a str) -> Self {
        Self {
            row_index: Some(row_index),
            rule_id: Some(rule_id),
            ..*self
        }
    }

    fn warn(&self, message: String) {
        let mut diagnostic = Diagnostic::warning(message);
        if let Some(row) = self.row_index {
            diagnostic = diagnostic.at_row(row);
        }
        if let Some(rule_id) = self.rule_id {
            diagnostic = diagnostic.for_rule(rule_id);
        }
        self.sink.record(diagnostic);
    }

    /// 求值表达式，失败时记录诊断并返回原始文本
    pub fn evaluate(&self, expression: &str, row: &Row) -> CellValue {
        match self.try_evaluate(expression, row) {
            Ok(value) => value,
            Err(e) => {
                self.warn(format!("表达式求值失败，保留原文: {}", e));
                metrics::record_expression_fallback();
                CellValue::Text(expression.to_string())
            }
        }
    }

    /// 求值规则中的值：数字等非文本值原样使用，文本按表达式求值
    pub fn evaluate_value(&self, value: &CellValue, row: &Row) -> CellValue {
        match value {
            CellValue::Text(expression) => self.evaluate(expression, row),
            other => other.clone(),
        }
    }

    /// 求值条件表达式并转为布尔
    pub fn evaluate_condition(&self, expression: &str, row: &Row) -> Result<bool> {
        self.try_evaluate(expression, row).map(|v| v.is_truthy())
    }

    /// 求值表达式，错误向上传播
    pub fn try_evaluate(&self, expression: &str, row: &Row) -> Result<CellValue> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Ok(CellValue::empty());
        }

        if let Some(text) = quoted_literal(trimmed) {
            return Ok(CellValue::Text(text.to_string()));
        }

        if is_identifier(trimmed) {
            if let Some(value) = row.get(trimmed) {
                return Ok(bare_field_value(value));
            }
        }

        let substituted = self.substitute_variables(trimmed);
        let substituted = self.apply_functions(&substituted, row)?;
        let substituted = self.negate_fields(&substituted, row);
        let substituted = self.substitute_fields(&substituted, row);

        self.evaluate_substituted(&substituted)
    }

    /// 第 1 遍：`${NAME}` 替换为变量值
    fn substitute_variables(&self, expression: &str) -> String {
        variable_regex()
            .replace_all(expression, |caps: &Captures| {
                let name = &caps[1];
                match self.lookup_variable(name) {
                    Some(CellValue::Null) => "0".to_string(),
                    Some(value) => value.to_string(),
                    None => {
                        self.warn(format!("变量 {} 未定义，按 0 处理", name));
                        "0".to_string()
                    }
                }
            })
            .into_owned()
    }

    /// 先精确匹配，再不区分大小写匹配（配置文件来源的键名可能被转为小写）
    fn lookup_variable(&self, name: &str) -> Option<&CellValue> {
        self.variables.get(name).or_else(|| {
            self.variables
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }

    /// 第 2 遍：函数调用，参数先递归求值
    fn apply_functions(&self, expression: &str, row: &Row) -> Result<String> {
        let mut result = expression.to_string();
        let mut search_from = 0;

        while let Some((name, start, open)) = Self::find_function(&result, search_from) {
            let close = matching_close(&result, open)
                .ok_or_else(|| RuleError::evaluation(expression, format!("{} 缺少右括号", name)))?;
            let argument = result[open + 1..close].trim().to_string();

            let replacement = match name {
                "INT" => {
                    let value = self.try_evaluate(&argument, row)?;
                    let number = match &value {
                        CellValue::Text(s) if parse_numeric_literal(s).is_none() => {
                            return Err(RuleError::evaluation(
                                expression,
                                format!("INT 的参数不是数字: '{}'", s),
                            ));
                        }
                        other => other.to_number(),
                    };
                    format_number((number + 0.5).floor())
                }
                _ => {
                    let amount = match row.get(&argument) {
                        Some(value) => value.to_number(),
                        None => self.try_evaluate(&argument, row)?.to_number(),
                    };
                    amount_to_words(amount)
                }
            };

            result.replace_range(start..=close, &replacement);
            search_from = start + replacement.len();
        }

        Ok(result)
    }

    /// 查找下一个函数调用，返回 (函数名, 起始位置, 左括号位置)
    fn find_function(s: &str, from: usize) -> Option<(&'static str, usize, usize)> {
        let mut best: Option<(&'static str, usize, usize)> = None;

        for name in FUNCTIONS {
            let pattern = format!("{}(", name);
            let mut offset = from;
            while let Some(pos) = s[offset..].find(&pattern) {
                let start = offset + pos;
                let preceded_by_ident = s[..start]
                    .chars()
                    .next_back()
                    .is_some_and(is_identifier_char);
                if !preceded_by_ident {
                    if best.is_none_or(|(_, b, _)| start < b) {
                        best = Some((name, start, start + name.len()));
                    }
                    break;
                }
                offset = start + pattern.len();
            }
        }

        best
    }

    /// 第 3 遍：一元 `-(FIELD)` 改写为取负后的数值
    fn negate_fields(&self, expression: &str, row: &Row) -> String {
        let mut result = String::with_capacity(expression.len());
        let mut last = 0;

        for caps in negated_field_regex().captures_iter(expression) {
            let (Some(whole), Some(value)) = (caps.get(0), row.get(&caps[1])) else {
                continue;
            };

            // 前面是操作数时这是减法，交给后续字段替换处理
            let unary = expression[..whole.start()]
                .trim_end()
                .chars()
                .next_back()
                .is_none_or(|c| "+-*/(<>=!&|".contains(c));
            if !unary {
                continue;
            }

            result.push_str(&expression[last..whole.start()]);
            result.push('(');
            result.push_str(&format_number(-value.to_number()));
            result.push(')');
            last = whole.end();
        }

        result.push_str(&expression[last..]);
        result
    }

    /// 第 4 遍：字段名替换为数值
    ///
    /// 标识符按最长匹配切分，`REC_AMT1` 不会被当成 `REC_AMT` 加上 `1`。
    fn substitute_fields(&self, expression: &str, row: &Row) -> String {
        identifier_regex()
            .replace_all(expression, |caps: &Captures| {
                let token = &caps[0];
                match row.get(token) {
                    Some(value) => format_number(value.to_number()),
                    None => token.to_string(),
                }
            })
            .into_owned()
    }

    /// 第 5 遍：替换完成后的分派
    fn evaluate_substituted(&self, expression: &str) -> Result<CellValue> {
        let trimmed = expression.trim();

        if let Some(number) = parse_numeric_literal(trimmed) {
            return Ok(CellValue::Number(number));
        }

        if !trimmed.contains(OPERATOR_CHARS) {
            return Ok(CellValue::Text(trimmed.to_string()));
        }

        self.evaluate_logical(trimmed)
    }

    fn evaluate_logical(&self, expression: &str) -> Result<CellValue> {
        let expression = strip_outer_parens(expression);

        let any_parts = split_top_level(expression, "||");
        if any_parts.len() > 1 {
            for part in any_parts {
                if self.evaluate_logical(part)?.is_truthy() {
                    return Ok(CellValue::Bool(true));
                }
            }
            return Ok(CellValue::Bool(false));
        }

        let all_parts = split_top_level(expression, "&&");
        if all_parts.len() > 1 {
            for part in all_parts {
                if !self.evaluate_logical(part)?.is_truthy() {
                    return Ok(CellValue::Bool(false));
                }
            }
            return Ok(CellValue::Bool(true));
        }

        if let Some(result) = self.evaluate_comparison(expression)? {
            return Ok(CellValue::Bool(result));
        }

        self.evaluate_arithmetic(expression)
    }

    /// 比较表达式：在第一个比较符处切分，双字符比较符优先
    fn evaluate_comparison(&self, expression: &str) -> Result<Option<bool>> {
        for (token, operator) in ComparisonOperator::EXPRESSION_TOKENS {
            let Some(pos) = expression.find(token) else {
                continue;
            };

            let left = strip_outer_parens(&expression[..pos]);
            let right = strip_outer_parens(&expression[pos + token.len()..]);

            return match (Self::side_number(left), Self::side_number(right)) {
                (Some(l), Some(r)) => Ok(Some(operator.compare_numbers(l, r))),
                _ if matches!(operator, ComparisonOperator::Eq | ComparisonOperator::Neq) => {
                    let l = quoted_literal(left).unwrap_or(left);
                    let r = quoted_literal(right).unwrap_or(right);
                    Ok(Some(operator.compare_strings(l, r)))
                }
                _ => Err(RuleError::evaluation(
                    expression,
                    format!("比较符 {} 两侧必须是数字", token.trim()),
                )),
            };
        }

        Ok(None)
    }

    fn side_number(side: &str) -> Option<f64> {
        if side.is_empty() {
            return Some(0.0);
        }
        if let Some(n) = parse_numeric_literal(side) {
            return Some(n);
        }
        if is_arithmetic(side) {
            return eval_arithmetic(side).ok().filter(|n| n.is_finite());
        }
        None
    }

    fn evaluate_arithmetic(&self, expression: &str) -> Result<CellValue> {
        let value = eval_arithmetic(expression)?;
        if value.is_finite() {
            Ok(CellValue::Number(value))
        } else {
            self.warn(format!("表达式 '{}' 结果不是有限数，按 0 处理", expression));
            Ok(CellValue::Number(0.0))
        }
    }
}

/// 单一比较条件评估器
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// 评估批量更新操作上的条件
    ///
    /// 条件值如果恰好是本行的字段名，则与该字段比较。
    pub fn matches(condition: &SimpleCondition, row: &Row) -> bool {
        let expected = match &condition.value {
            CellValue::Text(name) if row.contains(name) && is_identifier(name) => {
                row.get(name).cloned().unwrap_or_default()
            }
            other => other.clone(),
        };

        Self::evaluate(row.get(&condition.field), condition.operator, &expected)
    }

    /// 评估条件
    ///
    /// 两侧都可作为数字时按数值比较（空值视为 0），否则按字符串比较。
    pub fn evaluate(
        field_value: Option<&CellValue>,
        operator: ComparisonOperator,
        expected_value: &CellValue,
    ) -> bool {
        let field_value = field_value.cloned().unwrap_or_default();

        let numeric_side = |v: &CellValue| v.as_number().or_else(|| v.is_blank().then_some(0.0));

        match (numeric_side(&field_value), expected_value.as_number()) {
            (Some(actual), Some(expected)) => operator.compare_numbers(actual, expected),
            _ => operator.compare_strings(&field_value.to_string(), &expected_value.to_string()),
        }
    }
}
