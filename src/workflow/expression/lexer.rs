//! Tokenizer for workflow expressions

use crate::error::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    Contains,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    Bang,
    AndAnd,
    OrOr,
    Question,
    Colon,
    Dot,
    Comma,
    Pipe,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
}

/// A token plus the byte offset it starts at
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub start: usize,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, ExpressionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (start, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let peek = chars.get(i + 1).map(|(_, c)| *c);
        let two = |token: Token| Spanned { token, start };

        let (token, width) = match (c, peek) {
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('>', Some('=')) => (Token::Gte, 2),
            ('<', Some('=')) => (Token::Lte, 2),
            ('&', Some('&')) => (Token::AndAnd, 2),
            ('|', Some('|')) => (Token::OrOr, 2),
            ('>', _) => (Token::Gt, 1),
            ('<', _) => (Token::Lt, 1),
            ('!', _) => (Token::Bang, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('?', _) => (Token::Question, 1),
            (':', _) => (Token::Colon, 1),
            ('.', _) => (Token::Dot, 1),
            (',', _) => (Token::Comma, 1),
            ('|', _) => (Token::Pipe, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('{', _) => (Token::LBrace, 1),
            ('}', _) => (Token::RBrace, 1),
            ('\'', _) | ('"', _) => {
                let (text, next) = read_string(source, &chars, i)?;
                tokens.push(Spanned {
                    token: Token::Str(text),
                    start,
                });
                i = next;
                continue;
            }
            (d, _) if d.is_ascii_digit() => {
                let (token, next) = read_number(source, &chars, i)?;
                tokens.push(Spanned { token, start });
                i = next;
                continue;
            }
            (a, _) if a.is_alphabetic() || a == '_' => {
                let mut j = i;
                while j < chars.len() && (chars[j].1.is_alphanumeric() || chars[j].1 == '_') {
                    j += 1;
                }
                let end = chars.get(j).map(|(p, _)| *p).unwrap_or(source.len());
                let word = &source[start..end];
                let token = match word {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "contains" => Token::Contains,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push(Spanned { token, start });
                i = j;
                continue;
            }
            (other, _) => {
                return Err(ExpressionError::syntax(
                    source,
                    format!("unexpected character '{}' at offset {}", other, start),
                ))
            }
        };

        tokens.push(two(token));
        i += width;
    }

    Ok(tokens)
}

fn read_string(
    source: &str,
    chars: &[(usize, char)],
    open: usize,
) -> Result<(String, usize), ExpressionError> {
    let quote = chars[open].1;
    let mut out = String::new();
    let mut i = open + 1;

    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\\' {
            let escaped = chars.get(i + 1).map(|(_, c)| *c).ok_or_else(|| {
                ExpressionError::syntax(source, "unterminated escape sequence")
            })?;
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                other => other,
            });
            i += 2;
            continue;
        }
        out.push(c);
        i += 1;
    }

    Err(ExpressionError::syntax(
        &source[chars[open].0..],
        "unterminated string literal",
    ))
}

fn read_number(
    source: &str,
    chars: &[(usize, char)],
    first: usize,
) -> Result<(Token, usize), ExpressionError> {
    let mut i = first;
    let mut is_float = false;

    while i < chars.len() && chars[i].1.is_ascii_digit() {
        i += 1;
    }
    // A dot only continues the number when a digit follows it
    if i + 1 < chars.len() && chars[i].1 == '.' && chars[i + 1].1.is_ascii_digit() {
        is_float = true;
        i += 1;
        while i < chars.len() && chars[i].1.is_ascii_digit() {
            i += 1;
        }
    }
    if i < chars.len() && (chars[i].1 == 'e' || chars[i].1 == 'E') {
        let mut j = i + 1;
        if j < chars.len() && (chars[j].1 == '+' || chars[j].1 == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].1.is_ascii_digit() {
            is_float = true;
            i = j;
            while i < chars.len() && chars[i].1.is_ascii_digit() {
                i += 1;
            }
        }
    }

    let start = chars[first].0;
    let end = chars.get(i).map(|(p, _)| *p).unwrap_or(source.len());
    let text = &source[start..end];

    let token = if is_float {
        text.parse::<f64>().map(Token::Float).ok()
    } else {
        text.parse::<i64>()
            .map(Token::Int)
            .ok()
            .or_else(|| text.parse::<f64>().map(Token::Float).ok())
    };

    token
        .map(|t| (t, i))
        .ok_or_else(|| ExpressionError::syntax(text, "invalid number literal"))
}
