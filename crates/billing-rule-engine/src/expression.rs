//! 算术表达式解析器
//!
//! 字段和变量替换完成后，表达式只剩数字字面量和 `+ - * / ( )`。
//! 这里用递归下降求值，不借助任何动态执行能力：
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := unary (('*' | '/') unary)*
//! unary  := ('+' | '-') unary | atom
//! atom   := NUMBER | '(' expr ')'
//! ```

use crate::error::{Result, RuleError};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

/// 是否只包含算术字符
pub fn is_arithmetic(input: &str) -> bool {
    !input.trim().is_empty()
        && input
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_whitespace() || "+-*/().".contains(c))
}

/// 求值算术表达式
///
/// 除零得到 ±∞，由调用方决定如何处理非有限结果。
pub fn eval_arithmetic(input: &str) -> Result<f64> {
    if !is_arithmetic(input) {
        return Err(RuleError::evaluation(input, "包含非算术字符"));
    }

    let tokens = tokenize(input)?;
    let mut parser = Parser {
        source: input,
        tokens: &tokens,
        pos: 0,
    };
    let value = parser.expr()?;

    if parser.pos != tokens.len() {
        return Err(RuleError::evaluation(
            input,
            format!("第 {} 个记号处有多余内容", parser.pos + 1),
        ));
    }

    Ok(value)
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| RuleError::evaluation(input, format!("无效的数字 '{}'", literal)))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_whitespace() => {
                i += 1;
            }
            other => {
                return Err(RuleError::evaluation(
                    input,
                    format!("无法识别的字符 '{}'", other),
                ));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<f64> {
        let mut value = self.term()?;
        while let Some(token) = self.peek() {
            match token {
                Token::Plus => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Token::Minus => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64> {
        let mut value = self.unary()?;
        while let Some(token) = self.peek() {
            match token {
                Token::Star => {
                    self.pos += 1;
                    value *= self.unary()?;
                }
                Token::Slash => {
                    self.pos += 1;
                    value /= self.unary()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<f64> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<f64> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::LParen) => {
                let value = self.expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(RuleError::evaluation(self.source, "缺少右括号")),
                }
            }
            Some(token) => Err(RuleError::evaluation(
                self.source,
                format!("意外的记号 {:?}", token),
            )),
            None => Err(RuleError::evaluation(self.source, "表达式意外结束")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_arithmetic() {
        assert_eq!(eval_arithmetic("5+3").unwrap(), 8.0);
        assert_eq!(eval_arithmetic("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(eval_arithmetic("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(eval_arithmetic("10 / 4").unwrap(), 2.5);
        assert_eq!(eval_arithmetic("10 - 2 - 3").unwrap(), 5.0);
    }

    #[test]
    fn test_unary_minus_after_operator() {
        assert_eq!(eval_arithmetic("100--50").unwrap(), 150.0);
        assert_eq!(eval_arithmetic("-(3)").unwrap(), -3.0);
        assert_eq!(eval_arithmetic("2*-3").unwrap(), -6.0);
        assert_eq!(eval_arithmetic("0-(-50)").unwrap(), 50.0);
    }

    #[test]
    fn test_decimals() {
        let value = eval_arithmetic("1500 * 21 / 100 / 12").unwrap();
        assert!((value - 26.25).abs() < 1e-9);
        assert_eq!(eval_arithmetic(".5 + 1.25").unwrap(), 1.75);
    }

    #[test]
    fn test_division_by_zero_is_infinite() {
        assert!(eval_arithmetic("1/0").unwrap().is_infinite());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(eval_arithmetic("").is_err());
        assert!(eval_arithmetic("2 +").is_err());
        assert!(eval_arithmetic("(2 + 3").is_err());
        assert!(eval_arithmetic("2 3").is_err());
        assert!(eval_arithmetic("1.2.3").is_err());
        assert!(eval_arithmetic("alert(1)").is_err());
    }
}
