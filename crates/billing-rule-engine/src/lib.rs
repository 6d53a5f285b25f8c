//! 小区物业计费规则引擎
//!
//! 对导入的计费表按步骤执行声明式规则：
//! - 规则集 JSON 定义和校验
//! - 字符串表达式求值（无动态执行）
//! - 批量更新与条件逻辑规则执行
//! - 四步计费流水线（初始化、财务计算、账单生成、导出整理）
//! - 规则文本到 JSON 的转换

pub mod compiler;
pub mod converter;
pub mod diagnostics;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod expression;
pub mod models;
pub mod operators;
pub mod pipeline;
pub mod store;
pub mod words;

pub use compiler::{CompiledRuleSet, RuleSetCompiler};
pub use converter::{ConversionReport, RuleTextConverter};
pub use diagnostics::{Diagnostic, DiagnosticCollector, DiagnosticLevel, DiagnosticSink};
pub use error::{Result, RuleError};
pub use evaluator::{ConditionEvaluator, ExpressionEvaluator};
pub use executor::{ExecutionOutcome, RowFailure, RuleEngine};
pub use models::{
    Action, CellValue, ConditionBranch, Operation, Row, Rule, RuleSet, SimpleCondition, Table,
    VariableTable,
};
pub use operators::ComparisonOperator;
pub use pipeline::{
    BillingPipeline, Clock, FixedClock, PipelineError, Stage, StageContext, StageReport,
    SystemClock, run_stage,
};
pub use store::RuleSetStore;
