//! Parsing of control-protocol command lines.
//!
//! A line holds one or more commands separated by `;`. Tokens split on
//! whitespace; `"…"` and `'…'` quote, with C-style escapes inside; outside
//! quotes a backslash escapes the next character so separators can appear
//! in a token.

fn is_white(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\r' | '\n')
}

/// Consumes a quoted string (the leading quote already seen), applying the
/// escape table. Unknown escapes are kept literally as backslash plus the
/// escaped character. An unterminated string ends at the end of input.
fn parse_quoted(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, quote: char) -> String {
    let mut out = String::new();
    while let Some(c) = chars.next() {
        if c == quote {
            break;
        }
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            None => break,
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('f') => out.push('\x0c'),
            Some('v') => out.push('\x0b'),
            Some('b') => out.push('\x08'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('0') => out.push('\0'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    out
}

/// Splits a command line into commands, each an argument vector.
/// Fully empty commands are dropped.
pub fn split_commands(line: &str) -> Vec<Vec<String>> {
    let mut commands = Vec::new();
    let mut args: Vec<String> = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if is_white(c) {
            chars.next();
            continue;
        }
        if c == ';' {
            chars.next();
            if !args.is_empty() {
                commands.push(std::mem::take(&mut args));
            }
            continue;
        }
        if c == '"' || c == '\'' {
            chars.next();
            args.push(parse_quoted(&mut chars, c));
            continue;
        }

        // unquoted token, ends at whitespace or an unescaped ';'
        let mut arg = String::new();
        while let Some(&c) = chars.peek() {
            if c == '\\' {
                chars.next();
                match chars.next() {
                    Some(esc) => arg.push(esc),
                    None => break,
                }
                continue;
            }
            if is_white(c) || c == ';' {
                break;
            }
            arg.push(c);
            chars.next();
        }
        args.push(arg);
    }

    if !args.is_empty() {
        commands.push(args);
    }
    commands
}

/// Parses `1|on|yes|true` and `0|off|no|false`, case-insensitively.
pub fn parse_bool(s: &str) -> Option<bool> {
    if s.eq_ignore_ascii_case("1")
        || s.eq_ignore_ascii_case("on")
        || s.eq_ignore_ascii_case("yes")
        || s.eq_ignore_ascii_case("true")
    {
        Some(true)
    } else if s.eq_ignore_ascii_case("0")
        || s.eq_ignore_ascii_case("off")
        || s.eq_ignore_ascii_case("no")
        || s.eq_ignore_ascii_case("false")
    {
        Some(false)
    } else {
        None
    }
}

fn parse_digits(s: &str) -> Option<u64> {
    let (radix, digits) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (16, hex)
    } else if s.len() > 1 && s.starts_with('0') {
        (8, &s[1..])
    } else {
        (10, s)
    };
    if digits.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for c in digits.chars() {
        let d = c.to_digit(radix)?;
        value = value.checked_mul(radix as u64)?.checked_add(d as u64)?;
    }
    Some(value)
}

fn parse_signed_prefix(s: &str, allow_negative: bool) -> Option<(bool, &str)> {
    let s = s.trim_start_matches([' ', '\t']);
    if let Some(rest) = s.strip_prefix('+') {
        Some((false, rest))
    } else if let Some(rest) = s.strip_prefix('-') {
        if allow_negative {
            Some((true, rest))
        } else {
            None
        }
    } else {
        Some((false, s))
    }
}

/// Parses an unsigned number with `0x` (hex), `0` (octal) or decimal
/// prefix; a leading `+` is allowed.
pub fn parse_u64(s: &str) -> Option<u64> {
    let (_, digits) = parse_signed_prefix(s, false)?;
    parse_digits(digits)
}

/// Like [`parse_u64`] but allows a leading sign.
pub fn parse_i64(s: &str) -> Option<i64> {
    let (negative, digits) = parse_signed_prefix(s, true)?;
    let value = i64::try_from(parse_digits(digits)?).ok()?;
    Some(if negative { -value } else { value })
}
