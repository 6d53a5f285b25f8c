//! 第 2 步：财务计算
//!
//! 规则执行前汇总收款金额，执行后生成收款金额大写并清理零收款行的支付信息。

use super::{Stage, StageContext, StageHandler, ValidationIssue};
use crate::diagnostics::DiagnosticSink;
use crate::models::{CellValue, Table};
use crate::words::receipt_words;

pub const RECEIPT_COMPONENTS: [&str; 3] = ["REC_AMT1", "REC_AMT2", "REC_AMT3"];
pub const REC_AMT: &str = "REC_AMT";
pub const REC_WORD: &str = "REC_WORD";
pub const REC_NO: &str = "REC_NO";
pub const BANK_FIELDS: [&str; 3] = ["BANK1", "BANK2", "BANK3"];

const ARREARS: &str = "ARREARS";
const ADVANCE: &str = "ADVANCE";
const OUTST_BAL: &str = "OUTST_BAL";
const GR_TOTAL: &str = "GR_TOTAL";

/// 应收余额允许的误差
const BALANCE_TOLERANCE: f64 = 0.01;

#[derive(Debug, Default, Clone, Copy)]
pub struct FinancialStage;

impl StageHandler for FinancialStage {
    fn stage(&self) -> Stage {
        Stage::FinancialCalculation
    }

    /// 收款分项取非负，REC_AMT 为三项之和
    fn preprocess(&self, table: &mut Table, _ctx: &StageContext<'_>, _sink: &dyn DiagnosticSink) {
        for row in table.iter_mut() {
            let mut total = 0.0;
            for field in RECEIPT_COMPONENTS {
                let amount = row.number(field).max(0.0);
                row.set(field, amount);
                total += amount;
            }
            row.set(REC_AMT, total);
        }
    }

    fn postprocess(&self, table: &mut Table, _ctx: &StageContext<'_>, _sink: &dyn DiagnosticSink) {
        for row in table.iter_mut() {
            let received = row.number(REC_AMT);
            if received > 0.0 {
                row.set(REC_WORD, receipt_words(received));
            } else {
                row.set(REC_WORD, CellValue::empty());
                for field in BANK_FIELDS.iter().chain(std::iter::once(&REC_NO)) {
                    row.set(*field, CellValue::empty());
                }
            }
        }
    }

    fn validate(&self, table: &Table) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for (index, row) in table.iter().enumerate() {
            let arrears = row.number(ARREARS);
            let advance = row.number(ADVANCE);

            if arrears < 0.0 {
                issues.push(ValidationIssue::error(
                    index,
                    ARREARS,
                    format!("欠款为负数 ({})，应转为预付款", arrears),
                ));
            }

            if arrears > 0.0 && advance > 0.0 {
                issues.push(ValidationIssue::warning(
                    index,
                    ADVANCE,
                    format!("欠款 ({}) 与预付款 ({}) 同时为正", arrears, advance),
                ));
            }

            let has_balance = row.get(OUTST_BAL).is_some_and(|v| !v.is_blank());
            let has_total = row.get(GR_TOTAL).is_some_and(|v| !v.is_blank());
            if has_balance && has_total {
                let expected = row.number(GR_TOTAL) - row.number(REC_AMT);
                let actual = row.number(OUTST_BAL);
                if (expected - actual).abs() > BALANCE_TOLERANCE {
                    issues.push(ValidationIssue::warning(
                        index,
                        OUTST_BAL,
                        format!(
                            "应收余额 {} 与 GR_TOTAL - REC_AMT = {} 不一致",
                            actual, expected
                        ),
                    ));
                }
            }
        }

        issues
    }
}
