//! 规则执行器
//!
//! 按顺序对整张表执行规则：每条规则逐行独立应用，条件逻辑首个命中的分支生效。
//! 单行执行失败时该行对这条规则保持不变，失败信息记录在 [`ExecutionOutcome`] 中。

use crate::compiler::{CompiledRuleSet, RuleSetCompiler};
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::error::{Result, RuleError};
use crate::evaluator::{ConditionEvaluator, ExpressionEvaluator};
use crate::models::{
    BatchUpdateRule, ConditionalLogicRule, Row, Rule, RuleSet, Table, VariableTable,
};
use billing_shared::observability::metrics;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// 单行执行失败记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowFailure {
    /// 行号（从 0 开始）
    pub row: usize,
    pub rule_id: String,
    pub error: String,
}

/// 规则集执行结果
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub table: Table,
    /// 实际执行的规则数
    pub rules_applied: usize,
    pub failed_rows: Vec<RowFailure>,
    /// 分支命中记录，仅在启用追踪时填充
    pub trace: Vec<String>,
}

/// 规则执行器
pub struct RuleEngine {
    /// 是否记录每行的分支命中情况
    trace_enabled: bool,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            trace_enabled: false,
        }
    }

    /// 启用分支追踪，命中记录写入 [`ExecutionOutcome::trace`]
    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    /// 编译并执行未编译的规则集（不带配置变量）
    pub fn execute_rule_set(
        &self,
        table: &Table,
        rule_set: &RuleSet,
        sink: &dyn DiagnosticSink,
    ) -> Result<ExecutionOutcome> {
        let compiled = RuleSetCompiler::new().compile(rule_set, &VariableTable::new())?;
        self.execute(table, &compiled, sink)
    }

    /// 执行编译后的规则集
    ///
    /// 输入表不会被修改；返回的表与输入行数相同、顺序相同。
    pub fn execute(
        &self,
        table: &Table,
        compiled: &CompiledRuleSet,
        sink: &dyn DiagnosticSink,
    ) -> Result<ExecutionOutcome> {
        let start = Instant::now();

        let mut outcome = ExecutionOutcome {
            table: table.clone(),
            rules_applied: 0,
            failed_rows: Vec::new(),
            trace: Vec::new(),
        };

        if table.is_empty() || compiled.is_empty() {
            return Ok(outcome);
        }

        let evaluator = ExpressionEvaluator::new(&compiled.variables, sink);

        for rule in &compiled.rules {
            let before = outcome.table.len();
            let mut rows = Vec::with_capacity(before);
            let mut rule_failures = 0;

            for (index, row) in outcome.table.iter().enumerate() {
                let scoped = evaluator.scoped(index, rule.id());
                match self.apply_rule(rule, row, index, &scoped, &mut outcome.trace) {
                    Ok(updated) => rows.push(updated),
                    Err(e) => {
                        warn!(rule_id = %rule.id(), row = index, error = %e, "规则在该行执行失败，保留原行");
                        sink.record(
                            Diagnostic::warning(format!("规则执行失败，该行保持不变: {}", e))
                                .at_row(index)
                                .for_rule(rule.id()),
                        );
                        outcome.failed_rows.push(RowFailure {
                            row: index,
                            rule_id: rule.id().to_string(),
                            error: e.to_string(),
                        });
                        rule_failures += 1;
                        rows.push(row.clone());
                    }
                }
            }

            if rows.len() != before {
                error!(rule_id = %rule.id(), before, after = rows.len(), "规则执行后行数变化");
                return Err(RuleError::RowCountMismatch {
                    rule_id: rule.id().to_string(),
                    before,
                    after: rows.len(),
                });
            }

            outcome.table = Table::new(rows);
            outcome.rules_applied += 1;
            metrics::record_rule_application(rule.kind(), rule_failures);

            debug!(
                rule_id = %rule.id(),
                kind = rule.kind(),
                failed_rows = rule_failures,
                "规则执行完成"
            );
        }

        info!(
            rule_set = %compiled.name(),
            rules = outcome.rules_applied,
            rows = outcome.table.len(),
            failed_rows = outcome.failed_rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "规则集执行完成"
        );

        Ok(outcome)
    }

    /// 在工作副本上对单行应用规则
    fn apply_rule(
        &self,
        rule: &Rule,
        row: &Row,
        index: usize,
        evaluator: &ExpressionEvaluator<'_>,
        trace: &mut Vec<String>,
    ) -> Result<Row> {
        let mut working = row.clone();
        match rule {
            Rule::BatchUpdate(batch) => self.apply_batch(batch, &mut working, evaluator),
            Rule::ConditionalLogic(logic) => {
                self.apply_conditional(logic, &mut working, index, evaluator, trace)?
            }
        }
        Ok(working)
    }

    /// 批量更新：操作按顺序执行，后面的操作能看到前面的结果
    fn apply_batch(&self, rule: &BatchUpdateRule, row: &mut Row, evaluator: &ExpressionEvaluator<'_>) {
        for op in &rule.operations {
            if let Some(condition) = &op.condition {
                if !ConditionEvaluator::matches(condition, row) {
                    continue;
                }
            }
            let value = evaluator.evaluate_value(&op.value, row);
            row.set(op.field.clone(), value);
        }
    }

    /// 条件逻辑：首个命中的分支执行后立即停止
    fn apply_conditional(
        &self,
        rule: &ConditionalLogicRule,
        row: &mut Row,
        index: usize,
        evaluator: &ExpressionEvaluator<'_>,
        trace: &mut Vec<String>,
    ) -> Result<()> {
        for (i, branch) in rule.conditions.iter().enumerate() {
            let matched = match branch.expression() {
                Some(expression) => evaluator.evaluate_condition(expression, row)?,
                None => true,
            };

            if !matched {
                continue;
            }

            if self.trace_enabled {
                debug!(rule_id = %rule.id, branch = i, keyword = branch.keyword(), "分支命中");
                trace.push(format!(
                    "rows[{}] {}: {} 分支 {} 命中",
                    index,
                    rule.id,
                    branch.keyword(),
                    i
                ));
            }

            for action in branch.actions() {
                let value = evaluator.evaluate_value(&action.value, row);
                row.set(action.field.clone(), value);
            }
            return Ok(());
        }

        if self.trace_enabled {
            trace.push(format!("rows[{}] {}: 无分支命中", index, rule.id));
        }
        Ok(())
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{DiagnosticCollector, LogOnlySink};
    use crate::models::{Action, CellValue, ConditionBranch, Operation, SimpleCondition};
    use crate::operators::ComparisonOperator;
    use serde_json::json;

    fn table(value: serde_json::Value) -> Table {
        Table::from_json_value(&value).unwrap()
    }

    fn run(table: &Table, rules: Vec<Rule>) -> ExecutionOutcome {
        let rule_set = RuleSet::new("test", None, rules);
        RuleEngine::new()
            .execute_rule_set(table, &rule_set, &LogOnlySink)
            .unwrap()
    }

    #[test]
    fn test_empty_table_and_empty_rules() {
        let outcome = run(&Table::default(), vec![Rule::batch("r", vec![Operation::new("A", 1)])]);
        assert!(outcome.table.is_empty());

        let input = table(json!([{"A": 1}]));
        let outcome = run(&input, vec![]);
        assert_eq!(outcome.table, input);
        assert_eq!(outcome.rules_applied, 0);
    }

    #[test]
    fn test_batch_operations_see_earlier_results() {
        let input = table(json!([
            {"GR_TOTAL": 1000, "REC_AMT": 400},
            {"GR_TOTAL": 500, "REC_AMT": 600}
        ]));
        let outcome = run(
            &input,
            vec![Rule::batch(
                "outstanding",
                vec![
                    Operation::new("OUTST_BAL", "GR_TOTAL-REC_AMT"),
                    Operation::new("ARREARS", "OUTST_BAL"),
                ],
            )],
        );

        assert_eq!(outcome.table[0].get("ARREARS"), Some(&CellValue::Number(600.0)));
        assert_eq!(outcome.table[1].get("ARREARS"), Some(&CellValue::Number(-100.0)));
        // 输入表保持不变
        assert!(!input[0].contains("OUTST_BAL"));
    }

    #[test]
    fn test_batch_operation_condition() {
        let input = table(json!([{"ARREARS": -20}, {"ARREARS": 30}]));
        let outcome = run(
            &input,
            vec![Rule::batch(
                "clamp",
                vec![
                    Operation::new("ARREARS", 0)
                        .when(SimpleCondition::new("ARREARS", ComparisonOperator::Lt, 0)),
                ],
            )],
        );

        assert_eq!(outcome.table[0].number("ARREARS"), 0.0);
        assert_eq!(outcome.table[1].number("ARREARS"), 30.0);
    }

    #[test]
    fn test_first_match_wins() {
        let input = table(json!([{"A": 15}, {"A": 5}, {"A": -1}]));
        let outcome = run(
            &input,
            vec![Rule::conditional(
                "bands",
                vec![
                    ConditionBranch::if_("A>10", vec![Action::new("BAND", "HIGH")]),
                    ConditionBranch::else_if("A>0", vec![Action::new("BAND", "LOW")]),
                    ConditionBranch::else_if("A>-100", vec![Action::new("BAND", "NEG")]),
                    ConditionBranch::else_(vec![Action::new("BAND", "NONE")]),
                ],
            )],
        );

        let bands: Vec<String> = outcome.table.iter().map(|r| r.text("BAND")).collect();
        assert_eq!(bands, vec!["HIGH", "LOW", "NEG"]);
    }

    #[test]
    fn test_trace_records_matched_branch() {
        let input = table(json!([{"A": 15}, {"A": 5}, {"A": -1}]));
        let rule_set = RuleSet::new(
            "test",
            None,
            vec![
                Rule::batch("seed", vec![Operation::new("SEEN", "Y")]),
                Rule::conditional(
                    "bands",
                    vec![
                        ConditionBranch::if_("A>10", vec![Action::new("BAND", "HIGH")]),
                        ConditionBranch::else_if("A>0", vec![Action::new("BAND", "LOW")]),
                    ],
                ),
            ],
        );

        let outcome = RuleEngine::new()
            .with_trace()
            .execute_rule_set(&input, &rule_set, &LogOnlySink)
            .unwrap();

        // 批量更新不产生分支记录
        assert_eq!(
            outcome.trace,
            vec![
                "rows[0] bands: if 分支 0 命中",
                "rows[1] bands: elseif 分支 1 命中",
                "rows[2] bands: 无分支命中",
            ]
        );

        let untraced = run(&input, rule_set.rules.clone());
        assert!(untraced.trace.is_empty());
    }

    #[test]
    fn test_actions_see_earlier_actions() {
        let input = table(json!([{"ARREARS": -250}]));
        let outcome = run(
            &input,
            vec![Rule::conditional(
                "advance",
                vec![ConditionBranch::if_(
                    "ARREARS<0",
                    vec![Action::new("ADVANCE", "-(ARREARS)"), Action::new("ARREARS", 0)],
                )],
            )],
        );

        assert_eq!(outcome.table[0].number("ADVANCE"), 250.0);
        assert_eq!(outcome.table[0].number("ARREARS"), 0.0);
    }

    #[test]
    fn test_failed_row_is_left_untouched() {
        let input = table(json!([{"A": 1}, {"A": 2}]));
        let sink = DiagnosticCollector::new();
        let rule_set = RuleSet::new(
            "test",
            None,
            vec![
                Rule::batch("mark", vec![Operation::new("SEEN", "Y")]),
                Rule::conditional(
                    "broken",
                    vec![ConditionBranch::if_("A > ?", vec![Action::new("B", 1)])],
                ),
            ],
        );

        let outcome = RuleEngine::new()
            .execute_rule_set(&input, &rule_set, &sink)
            .unwrap();

        assert_eq!(outcome.table.len(), 2);
        assert_eq!(outcome.rules_applied, 2);
        assert_eq!(outcome.failed_rows.len(), 2);
        assert_eq!(outcome.failed_rows[0].rule_id, "broken");
        assert_eq!(outcome.table[0].text("SEEN"), "Y");
        assert!(!outcome.table[0].contains("B"));
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_disabled_rules_are_skipped() {
        let input = table(json!([{"A": 1}]));
        let outcome = run(
            &input,
            vec![Rule::batch("off", vec![Operation::new("A", 99)]).disabled()],
        );
        assert_eq!(outcome.table[0].number("A"), 1.0);
        assert_eq!(outcome.rules_applied, 0);
    }

    #[test]
    fn test_row_count_preserved() {
        let rows: Vec<serde_json::Value> = (0..50).map(|i| json!({"N": i})).collect();
        let input = table(serde_json::Value::Array(rows));
        let outcome = run(
            &input,
            vec![
                Rule::batch("double", vec![Operation::new("N", "N*2")]),
                Rule::conditional(
                    "flag",
                    vec![ConditionBranch::if_("N>=50", vec![Action::new("BIG", true)])],
                ),
            ],
        );
        assert_eq!(outcome.table.len(), 50);
        assert_eq!(outcome.table[49].number("N"), 98.0);
        assert_eq!(outcome.table[49].get("BIG"), Some(&CellValue::Bool(true)));
    }
}
