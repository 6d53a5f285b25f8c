//! 规则文本转换器
//!
//! 把逐行书写的规则文本转换为规则集 JSON，供规则作者使用，运行时不依赖。
//!
//! ```text
//! UPDATE [ALL] FIELD WITH value [FOR condition]
//! ```
//!
//! 连续的无条件行如果类别相同，合并为一条 `batch_update`；每个带条件的行单独成为一条
//! `conditional_logic`，便于逐条检查和启停。

use crate::evaluator::referenced_fields;
use crate::models::{Action, CellValue, ConditionBranch, Operation, Rule, RuleSet, parse_numeric_literal};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*UPDATE\s+(?:ALL\s+)?([A-Za-z_][A-Za-z0-9_]*)\s+WITH\s+(.*?)(?:\s+FOR\s+(.+?))?\s*;?\s*$",
        )
        .expect("valid rule line regex")
    })
}

fn clamp_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*<\s*0\s*$").expect("valid clamp regex")
    })
}

fn logical_word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\s+(AND|OR)\s+").expect("valid logical word regex"))
}

/// 触发冲突抑制的字段
const CONFLICT_MARKER_FIELD: &str = "INT_ARREAR";

/// 规则行类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    /// 清空或置零
    Clear,
    /// 算术计算
    Calculate,
    /// 函数调用（WORDS / INT）
    FunctionCall,
    /// 直接赋值
    Assign,
}

impl RuleCategory {
    /// 按赋值内容推断类别
    pub fn infer(value: &str) -> Self {
        let v = value.trim();
        if v.is_empty() || v == "0" || v == "''" || v == "\"\"" {
            return Self::Clear;
        }

        let upper = v.to_ascii_uppercase();
        if upper.contains("WORDS(") || upper.contains("INT(") {
            return Self::FunctionCall;
        }

        let quoted = v.len() >= 2 && (v.starts_with('\'') || v.starts_with('"'));
        if !quoted && parse_numeric_literal(v).is_none() && v.contains(['+', '-', '*', '/']) {
            return Self::Calculate;
        }

        Self::Assign
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Clear => "clear",
            Self::Calculate => "calculate",
            Self::FunctionCall => "function_call",
            Self::Assign => "assign",
        };
        write!(f, "{}", name)
    }
}

/// 解析后的一行规则
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    /// 行号（从 1 开始）
    pub line: usize,
    pub field: String,
    pub value: String,
    /// 已规范化的条件表达式
    pub condition: Option<String>,
    pub category: RuleCategory,
    pub source: String,
}

impl ParsedLine {
    /// 规则中的赋值：清空类为空串或 0，纯数字为数值，其余为表达式文本
    fn cell_value(&self) -> CellValue {
        let v = self.value.trim();
        match self.category {
            RuleCategory::Clear if v == "0" => CellValue::Number(0.0),
            RuleCategory::Clear => CellValue::empty(),
            _ => parse_numeric_literal(v)
                .map(CellValue::Number)
                .unwrap_or_else(|| CellValue::Text(v.to_string())),
        }
    }
}

/// 无法解析的行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedLine {
    pub line: usize,
    pub text: String,
}

/// 被冲突启发式跳过的行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuppressedLine {
    pub line: usize,
    pub field: String,
    pub reason: String,
}

/// 转换结果
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub rule_set: RuleSet,
    pub skipped: Vec<SkippedLine>,
    pub suppressed: Vec<SuppressedLine>,
}

/// 条件表达式中的操作符规范化
///
/// `=<` → `<=`，`=>` → `>=`，`<>` → `!=`，单独的 `=` → `==`，`AND`/`OR` → `&&`/`||`。
pub fn normalize_operators(condition: &str) -> String {
    let replaced = condition
        .replace("=<", "<=")
        .replace("=>", ">=")
        .replace("<>", "!=");
    let replaced = logical_word_regex().replace_all(&replaced, |caps: &regex::Captures| {
        if caps[1].eq_ignore_ascii_case("AND") {
            " && ".to_string()
        } else {
            " || ".to_string()
        }
    });

    let chars: Vec<char> = replaced.chars().collect();
    let mut result = String::with_capacity(replaced.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c == '=' {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let part_of_operator =
                matches!(prev, Some('<' | '>' | '=' | '!')) || next == Some('=');
            if !part_of_operator {
                result.push_str("==");
                continue;
            }
        }
        result.push(c);
    }

    result.trim().to_string()
}

/// 解析一行规则文本
pub fn parse_line(line_number: usize, text: &str) -> Option<ParsedLine> {
    let caps = line_regex().captures(text)?;
    let field = caps[1].to_string();
    let value = caps[2].trim().to_string();
    let condition = caps
        .get(3)
        .map(|c| normalize_operators(c.as_str()))
        .filter(|c| !c.is_empty());

    Some(ParsedLine {
        line: line_number,
        category: RuleCategory::infer(&value),
        field,
        value,
        condition,
        source: text.trim().to_string(),
    })
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with('#') || trimmed.starts_with("//")
}

/// 规则文本转换器
pub struct RuleTextConverter {
    name: String,
    description: String,
    step: Option<u8>,
}

impl RuleTextConverter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            step: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_step(mut self, step: u8) -> Self {
        self.step = Some(step);
        self
    }

    /// 转换整段规则文本
    pub fn convert(&self, text: &str) -> ConversionReport {
        let mut skipped = Vec::new();
        let mut suppressed = Vec::new();
        let mut rules: Vec<Rule> = Vec::new();

        // 当前正在累积的无条件批次
        let mut batch: Option<(RuleCategory, Vec<ParsedLine>)> = None;
        // 已有 `FIELD < 0` 置零规则的字段
        let mut clamped_fields: HashSet<String> = HashSet::new();

        let next_id = |rules: &Vec<Rule>| format!("rule_{}", rules.len() + 1);

        for (index, raw) in text.lines().enumerate() {
            let line_number = index + 1;
            if raw.trim().is_empty() || is_comment(raw) {
                continue;
            }

            let Some(parsed) = parse_line(line_number, raw) else {
                warn!(line = line_number, "无法解析的规则行: {}", raw.trim());
                skipped.push(SkippedLine {
                    line: line_number,
                    text: raw.trim().to_string(),
                });
                continue;
            };

            match &parsed.condition {
                Some(condition) => {
                    Self::flush(&mut batch, &mut rules);

                    if parsed.category == RuleCategory::Clear
                        && clamp_regex()
                            .captures(condition)
                            .is_some_and(|c| c[1] == parsed.field)
                    {
                        clamped_fields.insert(parsed.field.clone());
                    }

                    let action = Action::new(parsed.field.clone(), parsed.cell_value());
                    let rule = Rule::conditional(
                        next_id(&rules),
                        vec![ConditionBranch::if_(condition.clone(), vec![action])],
                    )
                    .with_description(parsed.source.clone());
                    rules.push(rule);
                }
                None => {
                    let conflicts = clamped_fields.contains(&parsed.field)
                        && referenced_fields(&parsed.value)
                            .iter()
                            .any(|f| f == CONFLICT_MARKER_FIELD);
                    if conflicts {
                        let reason = format!(
                            "会覆盖前面 {0} < 0 时置零的规则，已跳过",
                            parsed.field
                        );
                        warn!(line = parsed.line, field = %parsed.field, "{}", reason);
                        suppressed.push(SuppressedLine {
                            line: parsed.line,
                            field: parsed.field.clone(),
                            reason,
                        });
                        continue;
                    }

                    match &mut batch {
                        Some((category, lines)) if *category == parsed.category => {
                            lines.push(parsed);
                        }
                        _ => {
                            Self::flush(&mut batch, &mut rules);
                            batch = Some((parsed.category, vec![parsed]));
                        }
                    }
                }
            }
        }
        Self::flush(&mut batch, &mut rules);

        info!(
            rules = rules.len(),
            skipped = skipped.len(),
            suppressed = suppressed.len(),
            "规则文本转换完成"
        );

        let mut rule_set = RuleSet::new(self.name.clone(), self.step, rules);
        rule_set.metadata.description = self.description.clone();

        ConversionReport {
            rule_set,
            skipped,
            suppressed,
        }
    }

    fn flush(batch: &mut Option<(RuleCategory, Vec<ParsedLine>)>, rules: &mut Vec<Rule>) {
        let Some((category, lines)) = batch.take() else {
            return;
        };

        let first_line = lines.first().map(|l| l.line).unwrap_or_default();
        let operations: Vec<Operation> = lines
            .iter()
            .map(|l| Operation::new(l.field.clone(), l.cell_value()))
            .collect();

        debug!(%category, operations = operations.len(), first_line, "合并无条件规则");

        let id = format!("rule_{}", rules.len() + 1);
        rules.push(
            Rule::batch(id, operations)
                .with_description(format!("{} (line {})", category, first_line)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(text: &str) -> ConversionReport {
        RuleTextConverter::new("test").with_step(2).convert(text)
    }

    #[test]
    fn test_parse_line() {
        let parsed = parse_line(1, "UPDATE ALL ARREARS WITH 0 FOR ARREARS=<0").unwrap();
        assert_eq!(parsed.field, "ARREARS");
        assert_eq!(parsed.value, "0");
        assert_eq!(parsed.condition.as_deref(), Some("ARREARS<=0"));
        assert_eq!(parsed.category, RuleCategory::Clear);

        let parsed = parse_line(2, "update rec_word with WORDS(REC_AMT);").unwrap();
        assert_eq!(parsed.field, "rec_word");
        assert_eq!(parsed.value, "WORDS(REC_AMT)");
        assert_eq!(parsed.condition, None);
        assert_eq!(parsed.category, RuleCategory::FunctionCall);

        assert!(parse_line(3, "SET A = 1").is_none());
    }

    #[test]
    fn test_normalize_operators() {
        assert_eq!(normalize_operators("A=<0"), "A<=0");
        assert_eq!(normalize_operators("A=>0"), "A>=0");
        assert_eq!(normalize_operators("A<>B"), "A!=B");
        assert_eq!(normalize_operators("MODE=CASH"), "MODE==CASH");
        assert_eq!(normalize_operators("A==1"), "A==1");
        assert_eq!(normalize_operators("A!=1"), "A!=1");
        assert_eq!(normalize_operators("A>0 and B=1"), "A>0 && B==1");
        assert_eq!(normalize_operators("A>0 OR B<1"), "A>0 || B<1");
    }

    #[test]
    fn test_infer_category() {
        assert_eq!(RuleCategory::infer("''"), RuleCategory::Clear);
        assert_eq!(RuleCategory::infer("GR_TOTAL-REC_AMT"), RuleCategory::Calculate);
        assert_eq!(RuleCategory::infer("INT(ARREARS*2)"), RuleCategory::FunctionCall);
        assert_eq!(RuleCategory::infer("-5"), RuleCategory::Assign);
        assert_eq!(RuleCategory::infer("'A-1'"), RuleCategory::Assign);
        assert_eq!(RuleCategory::infer("CASH"), RuleCategory::Assign);
    }

    #[test]
    fn test_grouping_and_conditionals() {
        let report = convert(
            "# financial rules\n\
             UPDATE OUTST_BAL WITH GR_TOTAL-REC_AMT\n\
             UPDATE ARREARS WITH OUTST_BAL-ADVANCE\n\
             // clear stale values\n\
             UPDATE ALL REC_WORD WITH ''\n\
             UPDATE BANK1 WITH ''\n\
             UPDATE ADVANCE WITH -(ARREARS) FOR ARREARS<0\n\
             UPDATE ARREARS WITH 0 FOR ARREARS<0\n\
             UPDATE INTEREST WITH INT(ARREARS*${RATE}/1200)\n",
        );

        let rules = &report.rule_set.rules;
        assert_eq!(rules.len(), 5);
        assert!(report.skipped.is_empty());

        let ids: Vec<&str> = rules.iter().map(Rule::id).collect();
        assert_eq!(ids, vec!["rule_1", "rule_2", "rule_3", "rule_4", "rule_5"]);

        match &rules[0] {
            Rule::BatchUpdate(batch) => assert_eq!(batch.operations.len(), 2),
            other => panic!("unexpected rule {:?}", other),
        }
        match &rules[1] {
            Rule::BatchUpdate(batch) => {
                assert_eq!(batch.operations.len(), 2);
                assert_eq!(batch.operations[0].value, CellValue::empty());
            }
            other => panic!("unexpected rule {:?}", other),
        }
        match &rules[3] {
            Rule::ConditionalLogic(logic) => {
                assert_eq!(logic.conditions.len(), 1);
                assert_eq!(logic.conditions[0].expression(), Some("ARREARS<0"));
                assert_eq!(
                    logic.conditions[0].actions()[0],
                    Action::new("ARREARS", 0)
                );
            }
            other => panic!("unexpected rule {:?}", other),
        }
        assert_eq!(rules[4].kind(), "batch_update");
        assert_eq!(report.rule_set.metadata.step, Some(2));
    }

    #[test]
    fn test_unparseable_lines_are_reported() {
        let report = convert("UPDATE A WITH 1\nthis is not a rule\n");
        assert_eq!(report.rule_set.rules.len(), 1);
        assert_eq!(
            report.skipped,
            vec![SkippedLine {
                line: 2,
                text: "this is not a rule".to_string()
            }]
        );
    }

    #[test]
    fn test_conflicting_recompute_is_suppressed() {
        let report = convert(
            "UPDATE ARREARS WITH 0 FOR ARREARS<0\n\
             UPDATE ARREARS WITH ARREARS-INT_ARREAR\n\
             UPDATE TOTAL WITH TOTAL+INT_ARREAR\n",
        );

        assert_eq!(report.rule_set.rules.len(), 2);
        assert_eq!(report.suppressed.len(), 1);
        assert_eq!(report.suppressed[0].line, 2);
        assert_eq!(report.suppressed[0].field, "ARREARS");
    }

    #[test]
    fn test_output_is_valid_rule_set_json() {
        let report = convert("UPDATE X WITH 5+3\nUPDATE Y WITH 1 FOR X=8\n");
        let json = report.rule_set.to_json_pretty().unwrap();
        let parsed = RuleSet::from_json(&json).unwrap();
        assert_eq!(parsed.rules.len(), 2);
        assert!(crate::compiler::RuleSetCompiler::validate(&parsed).is_ok());
    }
}
