//! 四步计费流水线
//!
//! 每一步都是 预处理 → 规则引擎 → 后处理 → 校验。步骤在输入表的副本上执行，
//! 出错时调用方已提交的表保持不变。
//!
//! | 步骤 | 处理器 | 规则 |
//! |------|--------|------|
//! | 1 | [`InitializeStage`] | 必须 |
//! | 2 | [`FinancialStage`] | 必须 |
//! | 3 | [`BillGenerationStage`] | 必须 |
//! | 4 | [`FinalizeStage`] | 可选 |

pub mod dates;

mod billing;
mod finalize;
mod financial;
mod initialize;
mod runner;

pub use billing::BillGenerationStage;
pub use finalize::FinalizeStage;
pub use financial::FinancialStage;
pub use initialize::InitializeStage;
pub use runner::{BillingPipeline, variables_from_config};

use crate::compiler::RuleSetCompiler;
use crate::diagnostics::{Diagnostic, DiagnosticCollector, DiagnosticLevel, DiagnosticSink};
use crate::error::RuleError;
use crate::executor::{RowFailure, RuleEngine};
use crate::models::{RuleSet, Table, VariableTable};
use billing_shared::observability::metrics;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, info_span, warn};

/// 流水线步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Stage {
    Initialize = 1,
    FinancialCalculation = 2,
    BillGeneration = 3,
    Finalize = 4,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Initialize,
        Stage::FinancialCalculation,
        Stage::BillGeneration,
        Stage::Finalize,
    ];

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::Initialize),
            2 => Some(Self::FinancialCalculation),
            3 => Some(Self::BillGeneration),
            4 => Some(Self::Finalize),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn next(self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }

    pub fn previous(self) -> Option<Self> {
        Self::from_number(self.number().wrapping_sub(1))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::FinancialCalculation => "financial_calculation",
            Self::BillGeneration => "bill_generation",
            Self::Finalize => "finalize",
        }
    }

    /// 该步骤的处理器
    pub fn handler(self) -> &'static dyn StageHandler {
        match self {
            Self::Initialize => &InitializeStage,
            Self::FinancialCalculation => &FinancialStage,
            Self::BillGeneration => &BillGenerationStage,
            Self::Finalize => &FinalizeStage,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Step {}", self.number())
    }
}

impl TryFrom<u8> for Stage {
    type Error = String;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        Self::from_number(number).ok_or_else(|| format!("无效的步骤编号: {}", number))
    }
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> Self {
        stage.number()
    }
}

// ==================== 时钟 ====================

/// 日期来源，测试中可固定
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// 系统本地日期
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// 固定日期
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

// ==================== 执行上下文 ====================

/// 默认账单到期天数
pub const DEFAULT_DUE_DAYS: i64 = 30;

/// 单步执行上下文
pub struct StageContext<'a> {
    pub today: NaiveDate,
    /// 配置中的基础变量，规则集变量会覆盖同名项
    pub base_variables: VariableTable,
    pub due_days: i64,
    /// 记录条件逻辑的分支命中，写入 [`StageReport::trace`]
    pub trace: bool,
    pub progress: Option<&'a (dyn Fn(u8) + Send + Sync)>,
}

impl<'a> StageContext<'a> {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today,
            base_variables: VariableTable::new(),
            due_days: DEFAULT_DUE_DAYS,
            trace: false,
            progress: None,
        }
    }

    pub fn with_variables(mut self, variables: VariableTable) -> Self {
        self.base_variables = variables;
        self
    }

    pub fn with_due_days(mut self, due_days: i64) -> Self {
        self.due_days = due_days;
        self
    }

    pub fn with_trace(mut self) -> Self {
        self.trace = true;
        self
    }

    pub fn with_progress(mut self, progress: &'a (dyn Fn(u8) + Send + Sync)) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report_progress(&self, percent: u8) {
        if let Some(progress) = self.progress {
            progress(percent);
        }
    }
}

// ==================== 处理器 ====================

/// 步骤处理器：规则执行前后的固定处理
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    /// 是否必须提供规则
    fn requires_rules(&self) -> bool {
        true
    }

    /// 规则执行前的处理（仅在有规则时调用）
    fn preprocess(&self, _table: &mut Table, _ctx: &StageContext<'_>, _sink: &dyn DiagnosticSink) {}

    /// 规则执行后的处理（总是调用）
    fn postprocess(&self, _table: &mut Table, _ctx: &StageContext<'_>, _sink: &dyn DiagnosticSink) {}

    /// 数据一致性检查，只报告不修改
    fn validate(&self, _table: &Table) -> Vec<ValidationIssue> {
        Vec::new()
    }
}

/// 数据一致性问题
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub level: DiagnosticLevel,
    /// 行号（从 0 开始）
    pub row: usize,
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn warning(row: usize, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            row,
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn error(row: usize, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            ..Self::warning(row, field, message)
        }
    }
}

/// 单步执行报告
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: Stage,
    pub table: Table,
    pub rules_applied: usize,
    pub failed_rows: Vec<RowFailure>,
    pub diagnostics: Vec<Diagnostic>,
    pub validation: Vec<ValidationIssue>,
    /// 分支命中记录，未启用追踪时为空
    pub trace: Vec<String>,
}

impl StageReport {
    pub fn has_errors(&self) -> bool {
        self.validation
            .iter()
            .any(|issue| issue.level == DiagnosticLevel::Error)
    }
}

/// 流水线错误
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Error in step {step}: {reason}")]
    Stage { step: u8, reason: String },

    #[error("Error in step {step}: {source}")]
    Rules {
        step: u8,
        #[source]
        source: RuleError,
    },
}

impl PipelineError {
    pub fn stage(stage: Stage, reason: impl Into<String>) -> Self {
        Self::Stage {
            step: stage.number(),
            reason: reason.into(),
        }
    }

    pub fn step(&self) -> u8 {
        match self {
            Self::Stage { step, .. } | Self::Rules { step, .. } => *step,
        }
    }

    fn rules(stage: Stage, source: RuleError) -> Self {
        Self::Rules {
            step: stage.number(),
            source,
        }
    }
}

/// 执行单个步骤
///
/// 调用方的表不会被修改；成功时返回新表和本步的诊断信息。
pub fn run_stage(
    stage: Stage,
    table: &Table,
    rule_set: Option<&RuleSet>,
    ctx: &StageContext<'_>,
) -> Result<StageReport, PipelineError> {
    let span = info_span!("stage", step = stage.number(), name = stage.name());
    let _enter = span.enter();

    let start = Instant::now();
    let result = execute_stage(stage.handler(), table, rule_set, ctx);
    let elapsed = start.elapsed().as_secs_f64();

    match &result {
        Ok(report) => {
            metrics::record_stage_run(stage.number(), "success", elapsed);
            info!(
                rows = report.table.len(),
                rules = report.rules_applied,
                failed_rows = report.failed_rows.len(),
                diagnostics = report.diagnostics.len(),
                validation_issues = report.validation.len(),
                "步骤执行完成"
            );
        }
        Err(e) => {
            metrics::record_stage_run(stage.number(), "error", elapsed);
            error!(error = %e, "步骤执行失败");
        }
    }

    result
}

fn execute_stage(
    handler: &dyn StageHandler,
    table: &Table,
    rule_set: Option<&RuleSet>,
    ctx: &StageContext<'_>,
) -> Result<StageReport, PipelineError> {
    let stage = handler.stage();

    if table.is_empty() {
        return Err(PipelineError::stage(stage, "No data loaded"));
    }

    let rule_set = rule_set.filter(|r| r.has_enabled_rules());
    if rule_set.is_none() && handler.requires_rules() {
        return Err(PipelineError::stage(
            stage,
            format!("No rule file loaded for {}", stage),
        ));
    }

    let sink = DiagnosticCollector::new();
    let mut working = table.clone();
    let mut rules_applied = 0;
    let mut failed_rows = Vec::new();
    let mut trace = Vec::new();

    if let Some(rule_set) = rule_set {
        let compiled = RuleSetCompiler::new()
            .compile(rule_set, &ctx.base_variables)
            .map_err(|e| PipelineError::rules(stage, e))?;

        handler.preprocess(&mut working, ctx, &sink);
        ctx.report_progress(20);

        let engine = if ctx.trace {
            RuleEngine::new().with_trace()
        } else {
            RuleEngine::new()
        };
        let outcome = engine
            .execute(&working, &compiled, &sink)
            .map_err(|e| PipelineError::rules(stage, e))?;
        working = outcome.table;
        rules_applied = outcome.rules_applied;
        failed_rows = outcome.failed_rows;
        trace = outcome.trace;
    } else {
        ctx.report_progress(20);
    }
    ctx.report_progress(40);

    handler.postprocess(&mut working, ctx, &sink);
    ctx.report_progress(70);

    let validation = handler.validate(&working);
    for issue in &validation {
        metrics::record_validation_issue(&issue.level.to_string());
        match issue.level {
            DiagnosticLevel::Error => {
                error!(row = issue.row, field = %issue.field, "{}", issue.message)
            }
            DiagnosticLevel::Warning => {
                warn!(row = issue.row, field = %issue.field, "{}", issue.message)
            }
        }
    }
    ctx.report_progress(90);

    let mut diagnostics = sink.drain();
    for diagnostic in &mut diagnostics {
        diagnostic.stage.get_or_insert(stage.number());
    }
    ctx.report_progress(100);

    Ok(StageReport {
        stage,
        table: working,
        rules_applied,
        failed_rows,
        diagnostics,
        validation,
        trace,
    })
}

/// 按 floor(x·10^places + 0.5) 规则四舍五入
pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor + 0.5).floor() / factor
}
