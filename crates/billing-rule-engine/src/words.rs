//! 金额转英文大写（印度计数法：Crore / Lakh / Thousand / Hundred）

const ONES: [&str; 20] = [
    "", "One", "Two", "Three", "Four", "Five", "Six", "Seven", "Eight", "Nine", "Ten", "Eleven",
    "Twelve", "Thirteen", "Fourteen", "Fifteen", "Sixteen", "Seventeen", "Eighteen", "Nineteen",
];

const TENS: [&str; 10] = [
    "", "", "Twenty", "Thirty", "Forty", "Fifty", "Sixty", "Seventy", "Eighty", "Ninety",
];

fn two_digits(n: u64) -> String {
    debug_assert!(n < 100);
    if n < 20 {
        ONES[n as usize].to_string()
    } else if n % 10 == 0 {
        TENS[(n / 10) as usize].to_string()
    } else {
        format!("{} {}", TENS[(n / 10) as usize], ONES[(n % 10) as usize])
    }
}

fn integer_words(n: u64) -> String {
    if n == 0 {
        return "Zero".to_string();
    }

    let mut parts: Vec<String> = Vec::new();

    let crore = n / 10_000_000;
    let lakh = (n / 100_000) % 100;
    let thousand = (n / 1_000) % 100;
    let hundred = (n / 100) % 10;
    let rest = n % 100;

    if crore > 0 {
        // 超过 99 Crore 时，Crore 前的部分继续按同样规则展开
        parts.push(format!("{} Crore", integer_words(crore)));
    }
    if lakh > 0 {
        parts.push(format!("{} Lakh", two_digits(lakh)));
    }
    if thousand > 0 {
        parts.push(format!("{} Thousand", two_digits(thousand)));
    }
    if hundred > 0 {
        parts.push(format!("{} Hundred", ONES[hundred as usize]));
    }
    if rest > 0 {
        parts.push(two_digits(rest));
    }

    parts.join(" ")
}

/// 金额的英文表示，不带前后缀
///
/// 按分（paise）四舍五入；有分时追加 `and <words> Paise`。
pub fn amount_to_words(amount: f64) -> String {
    if !amount.is_finite() {
        return "Zero".to_string();
    }

    let total_paise = (amount.abs() * 100.0 + 0.5).floor() as u64;
    let rupees = total_paise / 100;
    let paise = total_paise % 100;

    let mut words = integer_words(rupees);
    if paise > 0 {
        words = format!("{} and {} Paise", words, two_digits(paise));
    }

    if amount < 0.0 && total_paise > 0 {
        format!("Minus {}", words)
    } else {
        words
    }
}

/// 收据上的金额大写：`Rupees <words> Only`
pub fn receipt_words(amount: f64) -> String {
    format!("Rupees {} Only", amount_to_words(amount))
}
