//! Line-level lexing helpers
//!
//! The description language is line oriented: `#` starts a comment, blank
//! lines are skipped, and a leading space or tab marks a body line of the
//! current definition. Body lines split on whitespace except that
//! double-quoted substrings survive as single tokens, quotes included.

use crate::error::ParseError;

/// Strip the comment portion of a raw source line.
pub fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(at) => &line[..at],
        None => line,
    }
}

/// Split a body line into tokens, keeping quoted substrings intact.
pub fn tokenize(line: &str, line_no: usize) -> Result<Vec<String>, ParseError> {
    let mut parts = Vec::new();
    let mut rest = line;
    loop {
        let (before, after) = match rest.split_once('"') {
            Some((before, after)) => (before, Some(after)),
            None => (rest, None),
        };
        parts.extend(
            before
                .split_whitespace()
                .filter(|tok| !tok.is_empty())
                .map(str::to_owned),
        );
        let Some(after) = after else { break };
        let Some((inside, tail)) = after.split_once('"') else {
            return Err(ParseError::UnclosedQuote { line: line_no });
        };
        parts.push(format!("\"{inside}\""));
        rest = tail;
    }
    Ok(parts)
}

/// Parse a `0x…`, `0b…` or decimal integer token.
pub fn parse_int(token: &str) -> Option<i64> {
    let (digits, negative) = match token.strip_prefix('-') {
        Some(rest) => (rest, true),
        None => (token, false),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(bin) = digits.strip_prefix("0b") {
        i64::from_str_radix(bin, 2).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if negative { -value } else { value })
}

/// Parse an unsigned integer token, reporting a diagnostic on failure.
pub fn parse_uint(token: &str, line: usize) -> Result<u32, ParseError> {
    match parse_int(token) {
        Some(v) if v >= 0 && v <= u32::MAX as i64 => Ok(v as u32),
        _ => Err(ParseError::BadNumber {
            line,
            token: token.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_strip_mid_line() {
        assert_eq!(strip_comment("a = b # trailing"), "a = b ");
        assert_eq!(strip_comment("# whole line"), "");
        assert_eq!(strip_comment("plain"), "plain");
    }

    #[test]
    fn quoted_tokens_survive() {
        let toks = tokenize("\tccall printf \"%d bytes\" count", 3).unwrap();
        assert_eq!(toks, vec!["ccall", "printf", "\"%d bytes\"", "count"]);
    }

    #[test]
    fn unclosed_quote_is_an_error() {
        assert_eq!(
            tokenize("ccall printf \"oops", 9),
            Err(ParseError::UnclosedQuote { line: 9 })
        );
    }

    #[test]
    fn integer_radixes() {
        assert_eq!(parse_int("0x1f"), Some(31));
        assert_eq!(parse_int("0b101"), Some(5));
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("-3"), Some(-3));
        assert_eq!(parse_int("main"), None);
    }
}
