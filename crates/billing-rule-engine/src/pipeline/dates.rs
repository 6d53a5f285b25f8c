//! 月份与日期工具

use billing_shared::calendar::shift_month;
use chrono::{Datelike, NaiveDate};

/// 账期跨度（月）
pub const BILLING_PERIOD_MONTHS: usize = 3;

/// 可识别的输入日期格式，按顺序尝试
const DATE_FORMATS: [&str; 5] = ["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y-%m-%d", "%Y/%m/%d"];

/// 月份前移一个账期
///
/// 返回新的月份缩写，以及是否跨年。不区分大小写，无法识别时返回 None。
pub fn advance_month(name: &str) -> Option<(&'static str, bool)> {
    shift_month(name, BILLING_PERIOD_MONTHS)
}

/// 短日期格式 `DD/MM/YYYY`
pub fn format_short(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

/// 规范日期格式 `YYYY-MM-DD`
pub fn format_canonical(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// 解析日期文本，带时间部分的值只取日期
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    let date_part = trimmed
        .split(|c| c == 'T' || c == ' ')
        .next()
        .unwrap_or(trimmed);

    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(date_part, format).ok())
}

/// 收据编号：`REC` + 两位年 + 两位月 + 三位序号
pub fn receipt_number(today: NaiveDate, sequence: usize) -> String {
    format!(
        "REC{:02}{:02}{:03}",
        today.year().rem_euclid(100),
        today.month(),
        sequence
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_advance_month_table() {
        let expected = [
            ("JAN", "APR", false),
            ("FEB", "MAY", false),
            ("MAR", "JUN", false),
            ("APR", "JUL", false),
            ("MAY", "AUG", false),
            ("JUN", "SEP", false),
            ("JUL", "OCT", false),
            ("AUG", "NOV", false),
            ("SEP", "DEC", false),
            ("OCT", "JAN", true),
            ("NOV", "FEB", true),
            ("DEC", "MAR", true),
        ];
        for (from, to, wrapped) in expected {
            assert_eq!(advance_month(from), Some((to, wrapped)), "from {}", from);
        }
    }

    #[test]
    fn test_advance_month_case_and_unknown() {
        assert_eq!(advance_month(" oct "), Some(("JAN", true)));
        assert_eq!(advance_month("Sept"), None);
        assert_eq!(advance_month(""), None);
    }

    #[test]
    fn test_formats() {
        let d = date(2025, 5, 3);
        assert_eq!(format_short(d), "03/05/2025");
        assert_eq!(format_canonical(d), "2025-05-03");
    }

    #[test]
    fn test_parse_date_variants() {
        let d = date(2025, 5, 3);
        for input in [
            "03/05/2025",
            "3/5/2025",
            "03-05-2025",
            "03.05.2025",
            "2025-05-03",
            "2025/05/03",
            "2025-05-03T00:00:00Z",
        ] {
            assert_eq!(parse_date(input), Some(d), "input {}", input);
        }
        assert_eq!(parse_date("next week"), None);
        assert_eq!(parse_date("31/02/2025"), None);
    }

    #[test]
    fn test_receipt_number() {
        assert_eq!(receipt_number(date(2025, 5, 20), 1), "REC2505001");
        assert_eq!(receipt_number(date(2031, 12, 1), 42), "REC3112042");
    }
}
