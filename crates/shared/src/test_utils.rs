//! 测试工具模块
//!
//! 提供集成测试和基准测试所需的计费行数据生成器。
//! 行数据以 JSON 对象表示，与导入模块产出的格式一致。

use crate::calendar::shift_month;
use serde_json::{Map, Value, json};

/// 测试数据生成器
pub struct TestDataGenerator;

impl TestDataGenerator {
    /// 生成一条会员计费行
    ///
    /// 数值字段以字符串形式给出，模拟表格导入后的原始数据。
    pub fn member_row(flat_no: &str, bill_no: i64, month_from: &str, year: i64) -> Value {
        let month_to = Self::month_after(month_from, 2);
        json!({
            "FLAT_NO": flat_no,
            "NAME": format!("Member {}", flat_no),
            "BILL_NO": bill_no.to_string(),
            "MONTH_FROM": month_from,
            "MONTH_TO": month_to,
            "YEAR": year.to_string(),
            "TOTAL": "1500",
            "INTEREST": "0",
            "ARREARS": "0",
            "INT_ARREAR": "0",
            "ADVANCE": "0",
            "GR_TOTAL": "1500",
            "REC_AMT1": "0",
            "REC_AMT2": "0",
            "REC_AMT3": "0",
            "REC_AMT": "0",
            "BANK1": "",
            "BANK2": "",
            "BANK3": "",
            "REC_NO": "",
            "REC_WORD": "",
            "OUTST_BAL": "0"
        })
    }

    /// 生成一条已付款的会员计费行
    pub fn paid_member_row(flat_no: &str, bill_no: i64, amounts: [f64; 3], bank: &str) -> Value {
        let mut row = Self::member_row(flat_no, bill_no, "JAN", 2025);
        if let Value::Object(map) = &mut row {
            map.insert("REC_AMT1".to_string(), json!(amounts[0].to_string()));
            map.insert("REC_AMT2".to_string(), json!(amounts[1].to_string()));
            map.insert("REC_AMT3".to_string(), json!(amounts[2].to_string()));
            map.insert("BANK1".to_string(), json!(bank));
        }
        row
    }

    /// 生成一张会员表，账单号从 `first_bill_no` 开始递增
    pub fn member_table(rows: usize, first_bill_no: i64, month_from: &str, year: i64) -> Value {
        let rows: Vec<Value> = (0..rows)
            .map(|i| {
                Self::member_row(
                    &format!("A-{:03}", i + 1),
                    first_bill_no + i as i64,
                    month_from,
                    year,
                )
            })
            .collect();
        Value::Array(rows)
    }

    /// 用给定字段覆盖行数据
    pub fn with_fields(mut row: Value, fields: Value) -> Value {
        if let (Value::Object(target), Value::Object(source)) = (&mut row, fields) {
            for (k, v) in source {
                target.insert(k, v);
            }
        }
        row
    }

    /// 生成一个空行
    pub fn empty_row() -> Value {
        Value::Object(Map::new())
    }

    /// 第 2 步典型规则集：计算未结余额、欠款，负欠款转为预付款
    pub fn financial_rule_set() -> Value {
        json!({
            "metadata": {
                "name": "Financial calculation",
                "description": "Outstanding balance, arrears and advance",
                "step": 2
            },
            "variables": {
                "INTEREST_RATE": 21
            },
            "rules": [
                {
                    "id": "outstanding",
                    "type": "batch_update",
                    "description": "Outstanding balance after receipts",
                    "enabled": true,
                    "operations": [
                        { "field": "OUTST_BAL", "value": "GR_TOTAL-REC_AMT" },
                        { "field": "ARREARS", "value": "OUTST_BAL" }
                    ]
                },
                {
                    "id": "advance",
                    "type": "conditional_logic",
                    "description": "Negative arrears become advance",
                    "enabled": true,
                    "conditions": [
                        {
                            "if": { "expression": "ARREARS<0" },
                            "then": [
                                { "field": "ADVANCE", "value": "-(ARREARS)" },
                                { "field": "ARREARS", "value": "0" }
                            ]
                        },
                        {
                            "else": [
                                { "field": "ADVANCE", "value": "0" }
                            ]
                        }
                    ]
                }
            ]
        })
    }

    /// 给定月份之后第 `offset` 个月的缩写，无法识别的月份按 JAN 处理
    fn month_after(month: &str, offset: usize) -> &'static str {
        shift_month(month, offset)
            .or_else(|| shift_month("JAN", offset))
            .map_or("JAN", |(name, _)| name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_after_wraps() {
        assert_eq!(TestDataGenerator::month_after("NOV", 2), "JAN");
        assert_eq!(TestDataGenerator::month_after("jan", 2), "MAR");
        assert_eq!(TestDataGenerator::month_after("???", 2), "MAR");
    }
}
