//! 规则引擎领域模型
//!
//! 行数据是无模式的标量映射，规则集是声明式 JSON 文档。
//! 数值强制转换集中在 [`CellValue`] 上，业务逻辑不再各自处理空串和 "NULL"。

use crate::error::{Result, RuleError};
use crate::operators::ComparisonOperator;
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

// ==================== 单元格值 ====================

/// 单元格标量值
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

fn numeric_prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?").expect("valid numeric prefix regex")
    })
}

/// 按 parseFloat 语义解析：取开头最长的数字前缀
fn parse_float_prefix(s: &str) -> Option<f64> {
    let trimmed = s.trim_start();
    numeric_prefix_regex()
        .find(trimmed)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|n| n.is_finite())
}

/// 整个字符串是否为数字字面量
pub(crate) fn parse_numeric_literal(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    let m = numeric_prefix_regex().find(trimmed)?;
    if m.end() != trimmed.len() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// 数字的文本形式：整数不带小数点
pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl CellValue {
    /// 数值强制转换
    ///
    /// null、空串、纯空白、"NULL"/"null" 均为 0；否则按数字前缀解析，无法解析时为 0。
    pub fn to_number(&self) -> f64 {
        match self {
            Self::Null => 0.0,
            Self::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Number(n) if n.is_finite() => *n,
            Self::Number(_) => 0.0,
            Self::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() || trimmed == "NULL" || trimmed == "null" {
                    return 0.0;
                }
                parse_float_prefix(trimmed).unwrap_or(0.0)
            }
        }
    }

    /// 严格数值：只有数字或完整的数字字符串才返回 Some
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) if n.is_finite() => Some(*n),
            Self::Text(s) => parse_numeric_literal(s),
            _ => None,
        }
    }

    /// 条件真值
    ///
    /// 数字非零为真；字符串非空且不为 "0"/"false" 为真。
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::Text(s) => !s.is_empty() && s != "0" && s != "false",
        }
    }

    /// 是否为空值（null、空串或纯空白）
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn empty() -> Self {
        Self::Text(String::new())
    }

    /// 从 JSON 值转换，拒绝嵌套结构
    pub fn from_json(field: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            Value::Number(n) => Ok(Self::Number(n.as_f64().unwrap_or(0.0))),
            Value::String(s) => Ok(Self::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => Err(RuleError::NestedValue {
                field: field.to_string(),
            }),
        }
    }

    /// 转换为 JSON 值，整数输出为整数
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                serializer.serialize_i64(*n as i64)
            }
            Self::Number(n) => serializer.serialize_f64(*n),
            Self::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", format_number(*n)),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for CellValue {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<i32> for CellValue {
    fn from(n: i32) -> Self {
        Self::Number(n as f64)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

// ==================== 行与表 ====================

/// 一行计费数据：字段名到标量值的映射
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, CellValue>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&CellValue> {
        self.0.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<CellValue>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<CellValue> {
        self.0.remove(field)
    }

    /// 字段的数值（缺失视为 0）
    pub fn number(&self, field: &str) -> f64 {
        self.get(field).map(CellValue::to_number).unwrap_or(0.0)
    }

    /// 字段的文本形式（缺失视为空串）
    pub fn text(&self, field: &str) -> String {
        self.get(field).map(|v| v.to_string()).unwrap_or_default()
    }

    /// 字段缺失时补一个空串
    pub fn ensure_field(&mut self, field: &str) {
        if !self.contains(field) {
            self.set(field, CellValue::empty());
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &CellValue)> {
        self.0.iter()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut CellValue> {
        self.0.values_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 从 JSON 对象构造行
    pub fn from_json(value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| RuleError::ParseError("行数据必须是 JSON 对象".to_string()))?;

        let mut row = Row::new();
        for (field, v) in map {
            row.set(field.clone(), CellValue::from_json(field, v)?);
        }
        Ok(row)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<CellValue>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// 有序的行集合
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Table(Vec<Row>);

impl Table {
    pub fn new(rows: Vec<Row>) -> Self {
        Self(rows)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Row> {
        self.0.iter_mut()
    }

    pub fn get(&self, index: usize) -> Option<&Row> {
        self.0.get(index)
    }

    pub fn first(&self) -> Option<&Row> {
        self.0.first()
    }

    pub fn push(&mut self, row: Row) {
        self.0.push(row);
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.0
    }

    /// 从 JSON 数组字符串解析
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_json_value(&value)
    }

    /// 从 JSON 数组解析，每个元素必须是扁平对象
    pub fn from_json_value(value: &Value) -> Result<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| RuleError::ParseError("表数据必须是 JSON 数组".to_string()))?;

        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                Row::from_json(item).map_err(|e| RuleError::ParseError(format!("第 {} 行: {}", i + 1, e)))
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    pub fn to_json_value(&self) -> Value {
        Value::Array(self.0.iter().map(Row::to_json).collect())
    }
}

impl std::ops::Index<usize> for Table {
    type Output = Row;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl FromIterator<Row> for Table {
    fn from_iter<I: IntoIterator<Item = Row>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Table {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Table {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// 变量表：规则表达式中 `${NAME}` 的取值
pub type VariableTable = BTreeMap<String, CellValue>;

// ==================== 规则集 ====================

fn default_enabled() -> bool {
    true
}

/// 规则集元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSetMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u8>,
    /// 其余元数据原样保留
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// 规则集定义
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub metadata: RuleSetMetadata,
    #[serde(default)]
    pub variables: VariableTable,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(name: impl Into<String>, step: Option<u8>, rules: Vec<Rule>) -> Self {
        Self {
            metadata: RuleSetMetadata {
                name: name.into(),
                step,
                ..Default::default()
            },
            variables: VariableTable::new(),
            rules,
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// 从 JSON 字符串解析
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 是否没有任何启用的规则
    pub fn has_enabled_rules(&self) -> bool {
        self.rules.iter().any(Rule::enabled)
    }
}

/// 规则节点（批量更新或条件逻辑）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Rule {
    BatchUpdate(BatchUpdateRule),
    ConditionalLogic(ConditionalLogicRule),
}

impl Rule {
    pub fn batch(id: impl Into<String>, operations: Vec<Operation>) -> Self {
        Self::BatchUpdate(BatchUpdateRule {
            id: id.into(),
            description: String::new(),
            enabled: true,
            operations,
        })
    }

    pub fn conditional(id: impl Into<String>, conditions: Vec<ConditionBranch>) -> Self {
        Self::ConditionalLogic(ConditionalLogicRule {
            id: id.into(),
            description: String::new(),
            enabled: true,
            conditions,
        })
    }

    pub fn id(&self) -> &str {
        match self {
            Self::BatchUpdate(r) => &r.id,
            Self::ConditionalLogic(r) => &r.id,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::BatchUpdate(r) => &r.description,
            Self::ConditionalLogic(r) => &r.description,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            Self::BatchUpdate(r) => r.enabled,
            Self::ConditionalLogic(r) => r.enabled,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::BatchUpdate(_) => "batch_update",
            Self::ConditionalLogic(_) => "conditional_logic",
        }
    }

    pub fn disabled(mut self) -> Self {
        match &mut self {
            Self::BatchUpdate(r) => r.enabled = false,
            Self::ConditionalLogic(r) => r.enabled = false,
        }
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        match &mut self {
            Self::BatchUpdate(r) => r.description = description.into(),
            Self::ConditionalLogic(r) => r.description = description.into(),
        }
        self
    }
}

/// 批量更新规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUpdateRule {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

/// 批量更新中的一个赋值操作
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub field: String,
    pub value: CellValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<SimpleCondition>,
}

impl Operation {
    pub fn new(field: impl Into<String>, value: impl Into<CellValue>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            condition: None,
        }
    }

    pub fn when(mut self, condition: SimpleCondition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// 单一比较条件：字段 操作符 值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleCondition {
    pub field: String,
    pub operator: ComparisonOperator,
    pub value: CellValue,
}

impl SimpleCondition {
    pub fn new(
        field: impl Into<String>,
        operator: ComparisonOperator,
        value: impl Into<CellValue>,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

/// 条件逻辑规则
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalLogicRule {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: Vec<ConditionBranch>,
}

/// 条件分支动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub field: String,
    pub value: CellValue,
}

impl Action {
    pub fn new(field: impl Into<String>, value: impl Into<CellValue>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// 条件分支：同一规则内按顺序判断，首个命中的分支生效
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBranch", into = "RawBranch")]
pub enum ConditionBranch {
    If { expression: String, actions: Vec<Action> },
    ElseIf { expression: String, actions: Vec<Action> },
    Else { actions: Vec<Action> },
}

impl ConditionBranch {
    pub fn if_(expression: impl Into<String>, actions: Vec<Action>) -> Self {
        Self::If {
            expression: expression.into(),
            actions,
        }
    }

    pub fn else_if(expression: impl Into<String>, actions: Vec<Action>) -> Self {
        Self::ElseIf {
            expression: expression.into(),
            actions,
        }
    }

    pub fn else_(actions: Vec<Action>) -> Self {
        Self::Else { actions }
    }

    /// 分支的判断表达式，else 分支没有
    pub fn expression(&self) -> Option<&str> {
        match self {
            Self::If { expression, .. } | Self::ElseIf { expression, .. } => Some(expression),
            Self::Else { .. } => None,
        }
    }

    pub fn actions(&self) -> &[Action] {
        match self {
            Self::If { actions, .. } | Self::ElseIf { actions, .. } | Self::Else { actions } => {
                actions
            }
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Self::If { .. } => "if",
            Self::ElseIf { .. } => "elseif",
            Self::Else { .. } => "else",
        }
    }
}

/// 分支表达式的 JSON 形式
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BranchExpression {
    expression: String,
}

/// 分支的 JSON 线格式：`{"if": {...}, "then": [...]}` / `{"elseif": ...}` / `{"else": [...]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawBranch {
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    if_: Option<BranchExpression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    elseif: Option<BranchExpression>,
    #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
    else_: Option<Vec<Action>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    then: Option<Vec<Action>>,
}

impl TryFrom<RawBranch> for ConditionBranch {
    type Error = String;

    fn try_from(raw: RawBranch) -> std::result::Result<Self, Self::Error> {
        match (raw.if_, raw.elseif, raw.else_) {
            (Some(cond), None, None) => Ok(Self::If {
                expression: cond.expression,
                actions: raw.then.unwrap_or_default(),
            }),
            (None, Some(cond), None) => Ok(Self::ElseIf {
                expression: cond.expression,
                actions: raw.then.unwrap_or_default(),
            }),
            (None, None, Some(actions)) => Ok(Self::Else { actions }),
            _ => Err("条件分支必须且只能包含 if / elseif / else 之一".to_string()),
        }
    }
}

impl From<ConditionBranch> for RawBranch {
    fn from(branch: ConditionBranch) -> Self {
        match branch {
            ConditionBranch::If {
                expression,
                actions,
            } => RawBranch {
                if_: Some(BranchExpression { expression }),
                elseif: None,
                else_: None,
                then: Some(actions),
            },
            ConditionBranch::ElseIf {
                expression,
                actions,
            } => RawBranch {
                if_: None,
                elseif: Some(BranchExpression { expression }),
                else_: None,
                then: Some(actions),
            },
            ConditionBranch::Else { actions } => RawBranch {
                if_: None,
                elseif: None,
                else_: Some(actions),
                then: None,
            },
        }
    }
}
