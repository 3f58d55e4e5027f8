use crate::config::types::ConfinedError;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    None,
    True,
    False,
    Del,
    Raise,
    Not,
    And,
    Or,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    Newline,
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub line: usize,
}

pub(crate) fn syntax_error(line: usize, message: impl std::fmt::Display) -> ConfinedError {
    ConfinedError::new("SyntaxError", format!("line {}: {}", line, message))
}

/// Split source into tokens. Newlines inside brackets are not significant.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, ConfinedError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;
    let mut line = 1;
    let mut depth = 0usize;

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            '\n' => {
                if depth == 0 {
                    tokens.push(Spanned {
                        token: Token::Newline,
                        line,
                    });
                }
                line += 1;
                pos += 1;
            }
            ' ' | '\t' | '\r' => pos += 1,
            '\\' if chars.get(pos + 1) == Some(&'\n') => {
                line += 1;
                pos += 2;
            }
            '#' => {
                while pos < chars.len() && chars[pos] != '\n' {
                    pos += 1;
                }
            }
            ';' => {
                tokens.push(Spanned {
                    token: Token::Newline,
                    line,
                });
                pos += 1;
            }
            '"' | '\'' => {
                let (literal, next, lines) = read_string(&chars, pos, line)?;
                tokens.push(Spanned {
                    token: Token::Str(literal),
                    line,
                });
                line += lines;
                pos = next;
            }
            c if c.is_ascii_digit() => {
                let (token, next) = read_number(&chars, pos, line)?;
                tokens.push(Spanned { token, line });
                pos = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
                    pos += 1;
                }
                let word: String = chars[start..pos].iter().collect();
                let token = match word.as_str() {
                    "None" => Token::None,
                    "True" => Token::True,
                    "False" => Token::False,
                    "del" => Token::Del,
                    "raise" => Token::Raise,
                    "not" => Token::Not,
                    "and" => Token::And,
                    "or" => Token::Or,
                    _ => Token::Ident(word),
                };
                tokens.push(Spanned { token, line });
            }
            _ => {
                let next = chars.get(pos + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Eq, 2),
                    ('!', Some('=')) => (Token::Ne, 2),
                    ('<', Some('=')) => (Token::Le, 2),
                    ('>', Some('=')) => (Token::Ge, 2),
                    ('/', Some('/')) => (Token::DoubleSlash, 2),
                    ('=', _) => (Token::Assign, 1),
                    ('<', _) => (Token::Lt, 1),
                    ('>', _) => (Token::Gt, 1),
                    ('+', _) => (Token::Plus, 1),
                    ('-', _) => (Token::Minus, 1),
                    ('*', _) => (Token::Star, 1),
                    ('/', _) => (Token::Slash, 1),
                    ('%', _) => (Token::Percent, 1),
                    (',', _) => (Token::Comma, 1),
                    (':', _) => (Token::Colon, 1),
                    ('.', _) => (Token::Dot, 1),
                    ('(', _) | ('[', _) | ('{', _) => {
                        depth += 1;
                        let token = match c {
                            '(' => Token::LParen,
                            '[' => Token::LBracket,
                            _ => Token::LBrace,
                        };
                        (token, 1)
                    }
                    (')', _) | (']', _) | ('}', _) => {
                        depth = depth
                            .checked_sub(1)
                            .ok_or_else(|| syntax_error(line, format!("unmatched '{}'", c)))?;
                        let token = match c {
                            ')' => Token::RParen,
                            ']' => Token::RBracket,
                            _ => Token::RBrace,
                        };
                        (token, 1)
                    }
                    _ => return Err(syntax_error(line, format!("invalid character '{}'", c))),
                };
                tokens.push(Spanned { token, line });
                pos += width;
            }
        }
    }

    if depth > 0 {
        return Err(syntax_error(line, "unexpected end of input inside brackets"));
    }
    tokens.push(Spanned {
        token: Token::Newline,
        line,
    });
    tokens.push(Spanned {
        token: Token::Eof,
        line,
    });
    Ok(tokens)
}

fn read_string(
    chars: &[char],
    start: usize,
    line: usize,
) -> Result<(String, usize, usize), ConfinedError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut pos = start + 1;
    let mut lines = 0;
    loop {
        let c = *chars
            .get(pos)
            .ok_or_else(|| syntax_error(line, "unterminated string literal"))?;
        pos += 1;
        match c {
            c if c == quote => return Ok((out, pos, lines)),
            '\n' => return Err(syntax_error(line, "unterminated string literal")),
            '\\' => {
                let escaped = *chars
                    .get(pos)
                    .ok_or_else(|| syntax_error(line, "unterminated string literal"))?;
                pos += 1;
                match escaped {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    '\\' | '\'' | '"' => out.push(escaped),
                    '\n' => lines += 1,
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
            }
            other => out.push(other),
        }
    }
}

fn read_number(chars: &[char], start: usize, line: usize) -> Result<(Token, usize), ConfinedError> {
    let mut pos = start;
    let digits = |pos: &mut usize| {
        while *pos < chars.len() && (chars[*pos].is_ascii_digit() || chars[*pos] == '_') {
            *pos += 1;
        }
    };
    digits(&mut pos);
    let mut is_float = false;
    if pos + 1 < chars.len() && chars[pos] == '.' && chars[pos + 1].is_ascii_digit() {
        is_float = true;
        pos += 1;
        digits(&mut pos);
    }
    if pos < chars.len() && (chars[pos] == 'e' || chars[pos] == 'E') {
        let mut probe = pos + 1;
        if probe < chars.len() && (chars[probe] == '+' || chars[probe] == '-') {
            probe += 1;
        }
        if probe < chars.len() && chars[probe].is_ascii_digit() {
            is_float = true;
            pos = probe;
            digits(&mut pos);
        }
    }

    let text: String = chars[start..pos].iter().filter(|c| **c != '_').collect();
    let token = if is_float {
        let value: f64 = text
            .parse()
            .map_err(|_| syntax_error(line, format!("invalid float literal '{}'", text)))?;
        if !value.is_finite() {
            return Err(syntax_error(line, format!("float literal '{}' is out of range", text)));
        }
        Token::Float(value)
    } else {
        Token::Int(
            text.parse()
                .map_err(|_| syntax_error(line, format!("integer literal '{}' is too large", text)))?,
        )
    };
    Ok((token, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn tokenizes_assignment_and_call() {
        assert_eq!(
            kinds("x = f(1, k='a') // 2.5"),
            vec![
                Token::Ident("x".into()),
                Token::Assign,
                Token::Ident("f".into()),
                Token::LParen,
                Token::Int(1),
                Token::Comma,
                Token::Ident("k".into()),
                Token::Assign,
                Token::Str("a".into()),
                Token::RParen,
                Token::DoubleSlash,
                Token::Float(2.5),
                Token::Newline,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn newlines_inside_brackets_are_ignored() {
        let tokens = kinds("[1,\n 2]\n# comment\ny");
        let newlines = tokens.iter().filter(|t| **t == Token::Newline).count();
        assert_eq!(newlines, 3);
    }

    #[test]
    fn string_escapes() {
        assert_eq!(kinds(r#""a\n\"b""#)[0], Token::Str("a\n\"b".into()));
    }

    #[test]
    fn reports_line_of_bad_input() {
        let err = tokenize("x = 1\ny = $").unwrap_err();
        assert_eq!(err.kind, "SyntaxError");
        assert!(err.message.starts_with("line 2"));

        assert_eq!(tokenize("'open").unwrap_err().kind, "SyntaxError");
        assert_eq!(tokenize("99999999999999999999").unwrap_err().kind, "SyntaxError");
        assert_eq!(tokenize("(1").unwrap_err().kind, "SyntaxError");
    }
}
