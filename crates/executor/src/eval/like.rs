//! UTF-8 aware LIKE matching with `%`, `_` and an optional escape
//! character.

use squill_lib_core::errors::{Result, SquillError};

/// One resolved pattern element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    AnyRun,
    AnyOne,
    Literal(char),
}

fn tokenize(pattern: &str, esc: Option<char>) -> Result<Vec<Token>> {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if Some(c) == esc {
            match chars.next() {
                Some(escaped) => tokens.push(Token::Literal(escaped)),
                None => {
                    return Err(SquillError::InvalidDatatype(
                        "LIKE pattern",
                        "escaped character",
                    ));
                }
            }
        } else if c == '%' {
            // Runs of % collapse to one.
            if tokens.last() != Some(&Token::AnyRun) {
                tokens.push(Token::AnyRun);
            }
        } else if c == '_' {
            tokens.push(Token::AnyOne);
        } else {
            tokens.push(Token::Literal(c));
        }
    }
    Ok(tokens)
}

/// Match `src` against `pattern`. Character-wise, so multi-byte text works;
/// `_` consumes exactly one character, `%` any run.
pub fn match_like(src: &str, pattern: &str, esc: Option<char>) -> Result<bool> {
    let tokens = tokenize(pattern, esc)?;
    let chars: Vec<char> = src.chars().collect();

    // Two-pointer walk with backtracking to the last %.
    let mut s = 0usize;
    let mut p = 0usize;
    let mut star: Option<(usize, usize)> = None;
    while s < chars.len() {
        match tokens.get(p) {
            Some(Token::Literal(c)) if *c == chars[s] => {
                s += 1;
                p += 1;
            }
            Some(Token::AnyOne) => {
                s += 1;
                p += 1;
            }
            Some(Token::AnyRun) => {
                star = Some((p, s));
                p += 1;
            }
            _ => match star {
                Some((star_p, star_s)) => {
                    // Let the last % swallow one more character.
                    star = Some((star_p, star_s + 1));
                    s = star_s + 1;
                    p = star_p + 1;
                }
                None => return Ok(false),
            },
        }
    }
    while tokens.get(p) == Some(&Token::AnyRun) {
        p += 1;
    }
    Ok(p == tokens.len())
}
