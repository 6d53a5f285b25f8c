//! 第 3 步：生成账单与收据

use super::dates::{format_short, receipt_number};
use super::financial::{REC_AMT, REC_NO};
use super::{Stage, StageContext, StageHandler};
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::models::{CellValue, Table};
use chrono::TimeDelta;

pub const BILL_DATE: &str = "BILL_DATE";
pub const REC_DATE: &str = "REC_DATE";
pub const DUE_DATE: &str = "DUE_DATE";

#[derive(Debug, Default, Clone, Copy)]
pub struct BillGenerationStage;

impl StageHandler for BillGenerationStage {
    fn stage(&self) -> Stage {
        Stage::BillGeneration
    }

    /// 规则可能引用日期和收据号字段，先补齐
    fn preprocess(&self, table: &mut Table, _ctx: &StageContext<'_>, _sink: &dyn DiagnosticSink) {
        for row in table.iter_mut() {
            for field in [BILL_DATE, REC_DATE, DUE_DATE, REC_NO] {
                row.ensure_field(field);
            }
        }
    }

    fn postprocess(&self, table: &mut Table, ctx: &StageContext<'_>, sink: &dyn DiagnosticSink) {
        let bill_date = format_short(ctx.today);

        let due = TimeDelta::try_days(ctx.due_days).and_then(|d| ctx.today.checked_add_signed(d));
        let due_date = match due {
            Some(date) => format_short(date),
            None => {
                sink.record(
                    Diagnostic::warning(format!("到期天数 {} 超出日期范围，使用账单日期", ctx.due_days))
                        .at_stage(Stage::BillGeneration.number()),
                );
                bill_date.clone()
            }
        };

        for (index, row) in table.iter_mut().enumerate() {
            row.set(BILL_DATE, bill_date.as_str());
            row.set(DUE_DATE, due_date.as_str());

            if row.number(REC_AMT) > 0.0 {
                row.set(REC_DATE, bill_date.as_str());
                if row.get(REC_NO).is_none_or(CellValue::is_blank) {
                    row.set(REC_NO, receipt_number(ctx.today, index + 1));
                }
            }
        }
    }
}
