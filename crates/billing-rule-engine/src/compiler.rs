//! 规则集编译器
//!
//! 校验规则集结构、过滤禁用规则、合并变量，并预先提取规则涉及的字段。

use crate::error::{Result, RuleError};
use crate::evaluator::referenced_fields;
use crate::models::{CellValue, ConditionBranch, Rule, RuleSet, RuleSetMetadata, VariableTable};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

/// 编译后的规则集
#[derive(Debug, Clone)]
pub struct CompiledRuleSet {
    pub metadata: RuleSetMetadata,
    /// 启用的规则，保持原顺序
    pub rules: Vec<Rule>,
    /// 配置基础变量叠加规则集自身变量后的结果
    pub variables: VariableTable,
    /// 规则赋值或引用的全部字段
    pub required_fields: BTreeSet<String>,
    /// 被过滤掉的禁用规则数
    pub disabled_rules: usize,
}

impl CompiledRuleSet {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// 规则集编译器
pub struct RuleSetCompiler;

impl RuleSetCompiler {
    pub fn new() -> Self {
        Self
    }

    /// 从 JSON 字符串编译规则集
    pub fn compile_from_json(
        &self,
        json: &str,
        base_variables: &VariableTable,
    ) -> Result<CompiledRuleSet> {
        let rule_set = RuleSet::from_json(json)?;
        self.compile(&rule_set, base_variables)
    }

    /// 编译规则集
    ///
    /// 调用方的规则集不会被修改，变量表是新建的副本。
    pub fn compile(
        &self,
        rule_set: &RuleSet,
        base_variables: &VariableTable,
    ) -> Result<CompiledRuleSet> {
        Self::validate(rule_set)?;

        let mut variables = base_variables.clone();
        variables.extend(
            rule_set
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let rules: Vec<Rule> = rule_set
            .rules
            .iter()
            .filter(|r| r.enabled())
            .cloned()
            .collect();
        let disabled_rules = rule_set.rules.len() - rules.len();

        let required_fields = Self::extract_fields(&rules);

        debug!(
            rule_set = %rule_set.metadata.name,
            rules = rules.len(),
            disabled = disabled_rules,
            "规则集编译完成"
        );

        Ok(CompiledRuleSet {
            metadata: rule_set.metadata.clone(),
            rules,
            variables,
            required_fields,
            disabled_rules,
        })
    }

    /// 校验规则集结构
    pub fn validate(rule_set: &RuleSet) -> Result<()> {
        let mut seen = HashSet::new();

        for (i, rule) in rule_set.rules.iter().enumerate() {
            let path = format!("rules[{}]", i);

            if rule.id().trim().is_empty() {
                return Err(RuleError::ParseError(format!("规则 '{}' 的 ID 不能为空", path)));
            }

            if !seen.insert(rule.id()) {
                warn!(rule_id = %rule.id(), "规则 ID 重复");
            }

            match rule {
                Rule::BatchUpdate(batch) => {
                    for (j, op) in batch.operations.iter().enumerate() {
                        let op_path = format!("{}.operations[{}]", path, j);
                        Self::validate_field(&op.field, &op_path)?;
                        if let Some(condition) = &op.condition {
                            Self::validate_field(&condition.field, &format!("{}.condition", op_path))?;
                        }
                    }
                }
                Rule::ConditionalLogic(logic) => {
                    Self::validate_branches(&logic.conditions, &path)?;
                }
            }
        }

        Ok(())
    }

    fn validate_field(field: &str, path: &str) -> Result<()> {
        if field.trim().is_empty() {
            return Err(RuleError::EmptyField(path.to_string()));
        }
        Ok(())
    }

    /// 分支顺序：if 开头，else 至多一个且只能在最后
    fn validate_branches(branches: &[ConditionBranch], path: &str) -> Result<()> {
        if branches.is_empty() {
            return Err(RuleError::ParseError(format!(
                "条件规则 '{}' 至少需要一个分支",
                path
            )));
        }

        let last = branches.len() - 1;
        for (i, branch) in branches.iter().enumerate() {
            let branch_path = format!("{}.conditions[{}]", path, i);

            match branch {
                ConditionBranch::If { .. } if i != 0 => {
                    return Err(RuleError::ParseError(format!(
                        "'{}': if 只能作为第一个分支",
                        branch_path
                    )));
                }
                ConditionBranch::ElseIf { .. } | ConditionBranch::Else { .. } if i == 0 => {
                    return Err(RuleError::ParseError(format!(
                        "'{}': 第一个分支必须是 if，当前是 {}",
                        branch_path,
                        branch.keyword()
                    )));
                }
                ConditionBranch::Else { .. } if i != last => {
                    return Err(RuleError::ParseError(format!(
                        "'{}': else 只能作为最后一个分支",
                        branch_path
                    )));
                }
                _ => {}
            }

            if let Some(expression) = branch.expression() {
                if expression.trim().is_empty() {
                    return Err(RuleError::ParseError(format!(
                        "'{}': 条件表达式不能为空",
                        branch_path
                    )));
                }
            }

            for (j, action) in branch.actions().iter().enumerate() {
                Self::validate_field(&action.field, &format!("{}.then[{}]", branch_path, j))?;
            }
        }

        Ok(())
    }

    /// 提取规则赋值和引用的字段
    fn extract_fields(rules: &[Rule]) -> BTreeSet<String> {
        fn collect_value(fields: &mut BTreeSet<String>, value: &CellValue) {
            if let CellValue::Text(expression) = value {
                fields.extend(referenced_fields(expression));
            }
        }

        let mut fields = BTreeSet::new();

        for rule in rules {
            match rule {
                Rule::BatchUpdate(batch) => {
                    for op in &batch.operations {
                        fields.insert(op.field.clone());
                        collect_value(&mut fields, &op.value);
                        if let Some(condition) = &op.condition {
                            fields.insert(condition.field.clone());
                        }
                    }
                }
                Rule::ConditionalLogic(logic) => {
                    for branch in &logic.conditions {
                        if let Some(expression) = branch.expression() {
                            fields.extend(referenced_fields(expression));
                        }
                        for action in branch.actions() {
                            fields.insert(action.field.clone());
                            collect_value(&mut fields, &action.value);
                        }
                    }
                }
            }
        }

        fields
    }
}

impl Default for RuleSetCompiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, Operation};

    fn sample_rule_set_json() -> &'static str {
        r#"
        {
            "metadata": { "name": "financial", "step": 2 },
            "variables": { "INTEREST_RATE": 21 },
            "rules": [
                {
                    "type": "batch_update",
                    "id": "outstanding",
                    "operations": [
                        { "field": "OUTST_BAL", "value": "GR_TOTAL-REC_AMT" }
                    ]
                },
                {
                    "type": "conditional_logic",
                    "id": "interest",
                    "conditions": [
                        {
                            "if": { "expression": "ARREARS>0" },
                            "then": [ { "field": "INTEREST", "value": "INT(ARREARS*${INTEREST_RATE}/1200)" } ]
                        },
                        { "else": [ { "field": "INTEREST", "value": 0 } ] }
                    ]
                },
                {
                    "type": "batch_update",
                    "id": "unused",
                    "enabled": false,
                    "operations": [ { "field": "NOTE", "value": "x" } ]
                }
            ]
        }
        "#
    }

    #[test]
    fn test_compile_from_json() {
        let compiler = RuleSetCompiler::new();
        let compiled = compiler
            .compile_from_json(sample_rule_set_json(), &VariableTable::new())
            .unwrap();

        assert_eq!(compiled.name(), "financial");
        assert_eq!(compiled.len(), 2);
        assert_eq!(compiled.disabled_rules, 1);
        assert_eq!(compiled.rules[0].id(), "outstanding");

        for field in ["OUTST_BAL", "GR_TOTAL", "REC_AMT", "ARREARS", "INTEREST"] {
            assert!(compiled.required_fields.contains(field), "missing {}", field);
        }
        assert!(!compiled.required_fields.contains("INTEREST_RATE"));
        assert!(!compiled.required_fields.contains("NOTE"));
    }

    #[test]
    fn test_rule_set_variables_override_base() {
        let mut base = VariableTable::new();
        base.insert("INTEREST_RATE".to_string(), CellValue::Number(18.0));
        base.insert("DUE_DAYS".to_string(), CellValue::Number(30.0));

        let rule_set = RuleSet::new("r", Some(2), vec![]).with_variable("INTEREST_RATE", 21);
        let compiled = RuleSetCompiler::new().compile(&rule_set, &base).unwrap();

        assert_eq!(compiled.variables["INTEREST_RATE"], CellValue::Number(21.0));
        assert_eq!(compiled.variables["DUE_DAYS"], CellValue::Number(30.0));
        // 调用方的规则集不受影响
        assert_eq!(rule_set.variables.len(), 1);
    }

    #[test]
    fn test_validate_empty_id() {
        let rule_set = RuleSet::new("r", None, vec![Rule::batch(" ", vec![])]);
        let err = RuleSetCompiler::validate(&rule_set).unwrap_err();
        assert!(err.to_string().contains("rules[0]"));
    }

    #[test]
    fn test_validate_empty_field() {
        let rule_set = RuleSet::new(
            "r",
            None,
            vec![
                Rule::batch("ok", vec![Operation::new("A", 1)]),
                Rule::batch("bad", vec![Operation::new("", 1)]),
            ],
        );
        let err = RuleSetCompiler::validate(&rule_set).unwrap_err();
        assert!(matches!(err, RuleError::EmptyField(ref p) if p == "rules[1].operations[0]"));
    }

    #[test]
    fn test_validate_branch_order() {
        let else_first = RuleSet::new(
            "r",
            None,
            vec![Rule::conditional("c", vec![ConditionBranch::else_(vec![])])],
        );
        assert!(RuleSetCompiler::validate(&else_first).is_err());

        let else_in_middle = RuleSet::new(
            "r",
            None,
            vec![Rule::conditional(
                "c",
                vec![
                    ConditionBranch::if_("A>0", vec![]),
                    ConditionBranch::else_(vec![]),
                    ConditionBranch::else_if("A<0", vec![]),
                ],
            )],
        );
        let err = RuleSetCompiler::validate(&else_in_middle).unwrap_err();
        assert!(err.to_string().contains("rules[0].conditions[1]"));

        let two_ifs = RuleSet::new(
            "r",
            None,
            vec![Rule::conditional(
                "c",
                vec![
                    ConditionBranch::if_("A>0", vec![]),
                    ConditionBranch::if_("A<0", vec![]),
                ],
            )],
        );
        assert!(RuleSetCompiler::validate(&two_ifs).is_err());

        let empty = RuleSet::new("r", None, vec![Rule::conditional("c", vec![])]);
        assert!(RuleSetCompiler::validate(&empty).is_err());
    }

    #[test]
    fn test_validate_empty_expression_and_action_field() {
        let blank_expression = RuleSet::new(
            "r",
            None,
            vec![Rule::conditional("c", vec![ConditionBranch::if_("  ", vec![])])],
        );
        assert!(RuleSetCompiler::validate(&blank_expression).is_err());

        let blank_action = RuleSet::new(
            "r",
            None,
            vec![Rule::conditional(
                "c",
                vec![ConditionBranch::if_("A>0", vec![Action::new("", 1)])],
            )],
        );
        let err = RuleSetCompiler::validate(&blank_action).unwrap_err();
        assert!(matches!(err, RuleError::EmptyField(ref p) if p == "rules[0].conditions[0].then[0]"));
    }

    #[test]
    fn test_duplicate_ids_are_not_fatal() {
        let rule_set = RuleSet::new(
            "r",
            None,
            vec![
                Rule::batch("same", vec![Operation::new("A", 1)]),
                Rule::batch("same", vec![Operation::new("B", 2)]),
            ],
        );
        let compiled = RuleSetCompiler::new()
            .compile(&rule_set, &VariableTable::new())
            .unwrap();
        assert_eq!(compiled.len(), 2);
    }
}
