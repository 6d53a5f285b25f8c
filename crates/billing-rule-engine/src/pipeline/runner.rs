//! 流水线状态机
//!
//! 保存导入数据和每一步已提交的输出。步骤必须按顺序执行；重跑第 N 步会丢弃其后的输出，
//! 执行失败时已提交的输出保持不变。

use super::{Clock, DEFAULT_DUE_DAYS, PipelineError, Stage, StageContext, StageReport, SystemClock, run_stage};
use crate::error::{Result as RuleResult, RuleError};
use crate::models::{CellValue, RuleSet, Table, VariableTable};
use crate::store::RuleSetStore;
use billing_shared::config::PipelineConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, info_span, warn};
use uuid::Uuid;

type ProgressFn = dyn Fn(u8) + Send + Sync;

/// 配置中的基础变量转换为变量表，嵌套值视为错误
pub fn variables_from_config(config: &PipelineConfig) -> RuleResult<VariableTable> {
    config
        .variables
        .iter()
        .map(|(name, value)| Ok((name.clone(), CellValue::from_json(name, value)?)))
        .collect::<Result<VariableTable, RuleError>>()
}

/// 计费流水线
pub struct BillingPipeline {
    clock: Arc<dyn Clock>,
    base_variables: VariableTable,
    due_days: i64,
    store: Option<Arc<RuleSetStore>>,
    progress: Option<Box<ProgressFn>>,
    input: Option<Table>,
    outputs: BTreeMap<Stage, Table>,
}

impl BillingPipeline {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            base_variables: VariableTable::new(),
            due_days: DEFAULT_DUE_DAYS,
            store: None,
            progress: None,
            input: None,
            outputs: BTreeMap::new(),
        }
    }

    /// 按配置创建：基础变量和到期天数
    pub fn from_config(config: &PipelineConfig) -> RuleResult<Self> {
        Ok(Self::new()
            .with_variables(variables_from_config(config)?)
            .with_due_days(config.due_days))
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_variables(mut self, variables: VariableTable) -> Self {
        self.base_variables = variables;
        self
    }

    pub fn with_due_days(mut self, due_days: i64) -> Self {
        self.due_days = due_days;
        self
    }

    pub fn with_rule_store(mut self, store: Arc<RuleSetStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 进度回调（百分比）
    pub fn with_progress(mut self, progress: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// 载入导入数据，清空所有步骤输出
    pub fn load_table(&mut self, table: Table) {
        info!(rows = table.len(), "载入数据");
        self.input = Some(table);
        self.outputs.clear();
    }

    pub fn input(&self) -> Option<&Table> {
        self.input.as_ref()
    }

    /// 已提交的步骤输出
    pub fn output(&self, stage: Stage) -> Option<&Table> {
        self.outputs.get(&stage)
    }

    /// 最后一个已完成的步骤
    pub fn completed_stage(&self) -> Option<Stage> {
        self.outputs.keys().next_back().copied()
    }

    /// 下一个可执行的步骤；全部完成或未载入数据时为 None
    pub fn next_stage(&self) -> Option<Stage> {
        match self.completed_stage() {
            Some(stage) => stage.next(),
            None => self.input.as_ref().map(|_| Stage::Initialize),
        }
    }

    /// 执行步骤并提交输出
    pub fn run(
        &mut self,
        stage: Stage,
        rule_set: Option<&RuleSet>,
    ) -> Result<StageReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, step = stage.number());
        let _enter = span.enter();

        let input = self.stage_input(stage)?;

        let mut ctx = StageContext::new(self.clock.today())
            .with_variables(self.base_variables.clone())
            .with_due_days(self.due_days);
        if let Some(progress) = self.progress.as_deref() {
            ctx = ctx.with_progress(progress);
        }

        let report = run_stage(stage, input, rule_set, &ctx)?;

        self.discard_from(stage);
        self.outputs.insert(stage, report.table.clone());

        Ok(report)
    }

    /// 使用规则存储中该步骤的规则集执行
    pub fn run_with_store(&mut self, stage: Stage) -> Result<StageReport, PipelineError> {
        let rule_set = self.store.as_ref().and_then(|store| store.get(stage));
        self.run(stage, rule_set.as_deref())
    }

    /// 用户修改已提交的输出，其后的步骤作废
    pub fn edit(&mut self, stage: Stage, table: Table) -> Result<(), PipelineError> {
        if !self.outputs.contains_key(&stage) {
            return Err(PipelineError::stage(
                stage,
                format!("{} has not been completed", stage),
            ));
        }

        if let Some(next) = stage.next() {
            self.discard_from(next);
        }
        self.outputs.insert(stage, table);
        Ok(())
    }

    /// 丢弃该步骤及其后所有步骤的输出
    pub fn discard_from(&mut self, stage: Stage) {
        let discarded = self.outputs.split_off(&stage);
        if !discarded.is_empty() {
            warn!(
                from = stage.number(),
                count = discarded.len(),
                "丢弃已提交的步骤输出"
            );
        }
    }

    fn stage_input(&self, stage: Stage) -> Result<&Table, PipelineError> {
        match stage.previous() {
            None => self
                .input
                .as_ref()
                .ok_or_else(|| PipelineError::stage(stage, "No data loaded")),
            Some(previous) => self.outputs.get(&previous).ok_or_else(|| {
                PipelineError::stage(stage, format!("{} has not been completed", previous))
            }),
        }
    }
}

impl Default for BillingPipeline {
    fn default() -> Self {
        Self::new()
    }
}
