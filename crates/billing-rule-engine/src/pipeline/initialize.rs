//! 第 1 步：初始化新账期
//!
//! 账单号顺延、账期月份前移三个月、跨年时年份加一。

use super::dates::advance_month;
use super::{Stage, StageContext, StageHandler};
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::models::{CellValue, Row, Table};
use tracing::debug;

pub const BILL_NO: &str = "BILL_NO";
pub const PREV_BILL_NO: &str = "PREV_BILL_NO";
pub const MONTH_FROM: &str = "MONTH_FROM";
pub const MONTH_TO: &str = "MONTH_TO";
pub const YEAR: &str = "YEAR";

/// 新财年的起始月份
const FINANCIAL_YEAR_START: &str = "APR";

#[derive(Debug, Default, Clone, Copy)]
pub struct InitializeStage;

impl StageHandler for InitializeStage {
    fn stage(&self) -> Stage {
        Stage::Initialize
    }

    fn preprocess(&self, table: &mut Table, _ctx: &StageContext<'_>, sink: &dyn DiagnosticSink) {
        // 首行前移后落在 APR 即进入新财年，账单号从 1 重新开始
        let new_financial_year = table
            .first()
            .and_then(|row| advance_month(&row.text(MONTH_FROM)))
            .is_some_and(|(month, _)| month == FINANCIAL_YEAR_START);

        let max_bill_no = table
            .iter()
            .map(|row| row.number(BILL_NO))
            .fold(0.0, f64::max);

        debug!(new_financial_year, max_bill_no, "分配账单号");

        for (index, row) in table.iter_mut().enumerate() {
            let position = (index + 1) as f64;
            let previous = row.get(BILL_NO).cloned().unwrap_or_else(CellValue::empty);
            row.set(PREV_BILL_NO, previous);
            row.set(
                BILL_NO,
                if new_financial_year {
                    position
                } else {
                    max_bill_no + position
                },
            );

            let wrapped = advance_month_field(row, MONTH_FROM, index, sink);
            advance_month_field(row, MONTH_TO, index, sink);

            if wrapped {
                increment_year(row, index, sink);
            }
        }
    }
}

/// 前移月份字段，返回是否跨年
fn advance_month_field(row: &mut Row, field: &str, index: usize, sink: &dyn DiagnosticSink) -> bool {
    let current = row.text(field);
    match advance_month(&current) {
        Some((next, wrapped)) => {
            row.set(field, next);
            wrapped
        }
        None => {
            sink.record(
                Diagnostic::warning(format!("{} 的值 '{}' 不是可识别的月份，保持不变", field, current))
                    .at_stage(Stage::Initialize.number())
                    .at_row(index),
            );
            false
        }
    }
}

fn increment_year(row: &mut Row, index: usize, sink: &dyn DiagnosticSink) {
    let year = row
        .get(YEAR)
        .and_then(CellValue::as_number)
        .filter(|y| y.fract() == 0.0);

    match year {
        Some(year) => row.set(YEAR, year + 1.0),
        None => sink.record(
            Diagnostic::warning(format!(
                "YEAR 的值 '{}' 不是整数年份，无法跨年递增",
                row.text(YEAR)
            ))
            .at_stage(Stage::Initialize.number())
            .at_row(index),
        ),
    }
}
