//! 第 4 步：导出前整理
//!
//! 规则可选。无论是否执行规则，都会统一金额精度、规范日期格式、把 null 换成空串，
//! 并补齐缺失的收款金额大写。

use super::billing::{BILL_DATE, DUE_DATE, REC_DATE};
use super::dates::{format_canonical, parse_date};
use super::financial::{REC_AMT, REC_WORD};
use super::{Stage, StageContext, StageHandler, round_to};
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::models::{CellValue, Row, Table};
use crate::words::receipt_words;

/// 需要统一精度的金额字段
pub const MONETARY_FIELDS: [&str; 8] = [
    "TOTAL",
    "GR_TOTAL",
    "ARREARS",
    "ADVANCE",
    "INTEREST",
    "INT_ARREAR",
    "REC_AMT",
    "OUTST_BAL",
];

/// 需要规范格式的日期字段
pub const DATE_FIELDS: [&str; 3] = [BILL_DATE, DUE_DATE, REC_DATE];

#[derive(Debug, Default, Clone, Copy)]
pub struct FinalizeStage;

impl StageHandler for FinalizeStage {
    fn stage(&self) -> Stage {
        Stage::Finalize
    }

    fn requires_rules(&self) -> bool {
        false
    }

    /// 有规则时先把金额取整，规则在整数金额上计算
    fn preprocess(&self, table: &mut Table, _ctx: &StageContext<'_>, _sink: &dyn DiagnosticSink) {
        for row in table.iter_mut() {
            round_monetary(row, 0);
        }
    }

    fn postprocess(&self, table: &mut Table, _ctx: &StageContext<'_>, sink: &dyn DiagnosticSink) {
        for (index, row) in table.iter_mut().enumerate() {
            round_monetary(row, 2);
            normalize_dates(row, index, sink);

            for value in row.values_mut() {
                if value.is_null() {
                    *value = CellValue::empty();
                }
            }

            let received = row.number(REC_AMT);
            if received > 0.0 && row.get(REC_WORD).is_none_or(CellValue::is_blank) {
                row.set(REC_WORD, receipt_words(received));
            }
        }
    }
}

/// 只处理非空的数值，文本和空值保持原样
fn round_monetary(row: &mut Row, places: i32) {
    for field in MONETARY_FIELDS {
        let Some(amount) = row.get(field).and_then(CellValue::as_number) else {
            continue;
        };
        row.set(field, round_to(amount, places));
    }
}

fn normalize_dates(row: &mut Row, index: usize, sink: &dyn DiagnosticSink) {
    for field in DATE_FIELDS {
        let Some(value) = row.get(field).filter(|v| !v.is_blank()) else {
            continue;
        };

        let text = value.to_string();
        match parse_date(&text) {
            Some(date) => row.set(field, format_canonical(date)),
            None => sink.record(
                Diagnostic::warning(format!("{} 的值 '{}' 无法识别为日期，保持不变", field, text))
                    .at_stage(Stage::Finalize.number())
                    .at_row(index),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticCollector;
    use chrono::NaiveDate;
    use serde_json::json;

    fn ctx() -> StageContext<'static> {
        StageContext::new(NaiveDate::from_ymd_opt(2025, 5, 20).unwrap())
    }

    #[test]
    fn test_preprocess_rounds_to_whole_numbers() {
        let mut table = Table::from_json_value(&json!([
            {"TOTAL": 10.5, "ARREARS": "-2.5", "INTEREST": "", "NAME": "9.7"}
        ]))
        .unwrap();
        FinalizeStage.preprocess(&mut table, &ctx(), &DiagnosticCollector::new());

        assert_eq!(table[0].get("TOTAL"), Some(&CellValue::Number(11.0)));
        assert_eq!(table[0].get("ARREARS"), Some(&CellValue::Number(-2.0)));
        assert_eq!(table[0].text("INTEREST"), "");
        assert_eq!(table[0].text("NAME"), "9.7");
    }

    #[test]
    fn test_postprocess_finalizes_row() {
        let mut table = Table::from_json_value(&json!([{
            "TOTAL": "1234.567",
            "OUTST_BAL": 99.994,
            "BILL_DATE": "20/05/2025",
            "DUE_DATE": "19.06.2025",
            "REC_DATE": "",
            "REMARK": null,
            "REC_AMT": 100,
            "REC_WORD": ""
        }]))
        .unwrap();
        let sink = DiagnosticCollector::new();
        FinalizeStage.postprocess(&mut table, &ctx(), &sink);

        let row = &table[0];
        assert_eq!(row.get("TOTAL"), Some(&CellValue::Number(1234.57)));
        assert_eq!(row.get("OUTST_BAL"), Some(&CellValue::Number(99.99)));
        assert_eq!(row.text("BILL_DATE"), "2025-05-20");
        assert_eq!(row.text("DUE_DATE"), "2025-06-19");
        assert_eq!(row.text("REC_DATE"), "");
        assert_eq!(row.get("REMARK"), Some(&CellValue::empty()));
        assert_eq!(row.text("REC_WORD"), "Rupees One Hundred Only");
        assert!(sink.is_empty());
    }

    #[test]
    fn test_unparseable_date_is_kept_with_warning() {
        let mut table = Table::from_json_value(&json!([{"BILL_DATE": "sometime"}])).unwrap();
        let sink = DiagnosticCollector::new();
        FinalizeStage.postprocess(&mut table, &ctx(), &sink);

        assert_eq!(table[0].text("BILL_DATE"), "sometime");
        let diagnostics = sink.snapshot();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].stage, Some(4));
    }

    #[test]
    fn test_existing_receipt_words_are_kept() {
        let mut table =
            Table::from_json_value(&json!([{"REC_AMT": 100, "REC_WORD": "Rupees Hundred Only"}]))
                .unwrap();
        FinalizeStage.postprocess(&mut table, &ctx(), &DiagnosticCollector::new());
        assert_eq!(table[0].text("REC_WORD"), "Rupees Hundred Only");
    }
}
