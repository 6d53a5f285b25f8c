//! 月份缩写表
//!
//! 流水线的账期推进和测试数据生成器共用同一张表。

/// 月份缩写，按自然顺序
pub const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// 月份缩写在表中的位置，忽略首尾空白和大小写
pub fn month_index(name: &str) -> Option<usize> {
    let name = name.trim();
    MONTHS.iter().position(|m| m.eq_ignore_ascii_case(name))
}

/// 向后推 `offset` 个月，返回新的缩写以及是否跨年
pub fn shift_month(name: &str, offset: usize) -> Option<(&'static str, bool)> {
    let next = month_index(name)? + offset;
    Some((MONTHS[next % 12], next >= 12))
}
