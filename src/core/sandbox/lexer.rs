use std::fmt;

use num_bigint::BigInt;
use num_traits::ToPrimitive;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    /// Integer literal too wide for 64 bits.
    BigInt(BigInt),
    Float(f64),
    Str(String),
    /// Body of an f-string with escapes already resolved.
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Name(name) => write!(f, "'{}'", name),
            Tok::Int(i) => write!(f, "'{}'", i),
            Tok::BigInt(i) => write!(f, "'{}'", i),
            Tok::Float(v) => write!(f, "'{}'", v),
            Tok::Str(_) | Tok::FStr(_) => write!(f, "string literal"),
            Tok::Op(op) => write!(f, "'{}'", op),
            Tok::Newline => write!(f, "end of line"),
            Tok::Indent => write!(f, "indent"),
            Tok::Dedent => write!(f, "dedent"),
            Tok::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxError {
    pub message: String,
    pub line: usize,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

// Longest first so that "**=" wins over "**" and "*".
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "->", "**", "//", "<<", ">>", "<=", ">=", "==", "!=", "+=", "-=",
    "*=", "/=", "%=", "&=", "|=", "^=", ":=", "+", "-", "*", "/", "%", "@", "&", "|", "^", "~", "<",
    ">", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "=",
];

const TAB_WIDTH: usize = 8;

pub fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
}

fn integer_token(value: BigInt) -> Tok {
    match value.to_i64() {
        Some(i) => Tok::Int(i),
        None => Tok::BigInt(value),
    }
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            depth: 0,
            indents: vec![0],
            tokens: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token { tok, line: self.line });
    }

    fn at_line_start(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent)
        )
    }

    fn run(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut line_start = true;

        while self.pos < self.chars.len() {
            if line_start && self.depth == 0 {
                line_start = false;
                if self.indentation()? {
                    line_start = true;
                    continue;
                }
            }

            let Some(c) = self.peek(0) else { break };
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 && !self.at_line_start() {
                        self.push(Tok::Newline);
                    }
                    self.line += 1;
                    line_start = true;
                }
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\\' if self.peek(1) == Some('\r') && self.peek(2) == Some('\n') => {
                    self.pos += 3;
                    self.line += 1;
                }
                c if c.is_ascii_digit() || (c == '.' && self.peek(1).map_or(false, |n| n.is_ascii_digit())) => {
                    self.number()?
                }
                c if c.is_alphabetic() || c == '_' => {
                    if !self.string_with_prefix()? {
                        self.name();
                    }
                }
                '"' | '\'' => self.string(false, false)?,
                _ => self.operator()?,
            }
        }

        if !self.at_line_start() {
            self.push(Tok::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(self.tokens)
    }

    /// Measures the indentation of a new logical line and emits INDENT or
    /// DEDENT tokens. Returns true when the line is blank or a comment.
    fn indentation(&mut self) -> Result<bool, SyntaxError> {
        let mut width = 0;
        while let Some(c) = self.peek(0) {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / TAB_WIDTH + 1) * TAB_WIDTH,
                '\x0c' | '\r' => {}
                _ => break,
            }
            self.pos += 1;
        }

        match self.peek(0) {
            None => return Ok(true),
            Some('\n') => {
                self.pos += 1;
                self.line += 1;
                return Ok(true);
            }
            Some('#') => {
                self.skip_comment();
                return Ok(false);
            }
            _ => {}
        }

        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent);
        } else if width < current {
            while self.indents.last().map_or(false, |&level| level > width) {
                self.indents.pop();
                self.push(Tok::Dedent);
            }
            if self.indents.last().copied() != Some(width) {
                return Err(SyntaxError::new(
                    "unindent does not match any outer indentation level",
                    self.line,
                ));
            }
        }
        Ok(false)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn name(&mut self) {
        let start = self.pos;
        while let Some(c) = self.peek(0) {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        self.push(Tok::Name(name));
    }

    /// Handles `r"..."`, `f'...'`, `rb"..."` and friends. Returns false when
    /// the identifier is not a string prefix.
    fn string_with_prefix(&mut self) -> Result<bool, SyntaxError> {
        let mut len = 0;
        while let Some(c) = self.peek(len) {
            if c.is_ascii_alphabetic() && len < 2 {
                len += 1;
            } else {
                break;
            }
        }
        if len == 0 || !matches!(self.peek(len), Some('"') | Some('\'')) {
            return Ok(false);
        }
        let prefix: String = self.chars[self.pos..self.pos + len]
            .iter()
            .collect::<String>()
            .to_lowercase();
        let (raw, formatted) = match prefix.as_str() {
            "r" => (true, false),
            "f" => (false, true),
            "b" | "u" => (false, false),
            "rf" | "fr" => (true, true),
            "rb" | "br" => (true, false),
            _ => return Ok(false),
        };
        self.pos += len;
        self.string(raw, formatted)?;
        Ok(true)
    }

    fn string(&mut self, raw: bool, formatted: bool) -> Result<(), SyntaxError> {
        let start_line = self.line;
        let Some(quote) = self.peek(0) else {
            return Err(SyntaxError::new("unterminated string literal", start_line));
        };
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut text = String::new();
        loop {
            let Some(c) = self.peek(0) else {
                let what = if triple {
                    "unterminated triple-quoted string literal"
                } else {
                    "unterminated string literal"
                };
                return Err(SyntaxError::new(what, start_line));
            };

            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            }

            match c {
                '\n' if !triple => {
                    return Err(SyntaxError::new("unterminated string literal", start_line));
                }
                '\n' => {
                    self.line += 1;
                    text.push(c);
                    self.pos += 1;
                }
                '\\' => {
                    self.pos += 1;
                    let Some(next) = self.peek(0) else { continue };
                    if raw {
                        text.push('\\');
                        text.push(next);
                        if next == '\n' {
                            self.line += 1;
                        }
                        self.pos += 1;
                    } else {
                        self.escape(next, &mut text)?;
                    }
                }
                _ => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }

        self.push(if formatted { Tok::FStr(text) } else { Tok::Str(text) });
        Ok(())
    }

    fn escape(&mut self, next: char, text: &mut String) -> Result<(), SyntaxError> {
        self.pos += 1;
        match next {
            '\n' => self.line += 1,
            'n' => text.push('\n'),
            't' => text.push('\t'),
            'r' => text.push('\r'),
            '0' => text.push('\0'),
            'a' => text.push('\x07'),
            'b' => text.push('\x08'),
            'f' => text.push('\x0c'),
            'v' => text.push('\x0b'),
            '\\' => text.push('\\'),
            '\'' => text.push('\''),
            '"' => text.push('"'),
            'x' => text.push(self.hex_escape(2)?),
            'u' => text.push(self.hex_escape(4)?),
            'U' => text.push(self.hex_escape(8)?),
            other => {
                text.push('\\');
                text.push(other);
            }
        }
        Ok(())
    }

    fn hex_escape(&mut self, digits: usize) -> Result<char, SyntaxError> {
        let hex: String = (0..digits).filter_map(|i| self.peek(i)).collect();
        let code = (hex.len() == digits)
            .then(|| u32::from_str_radix(&hex, 16).ok())
            .flatten()
            .and_then(char::from_u32)
            .ok_or_else(|| SyntaxError::new("truncated \\xXX escape", self.line))?;
        self.pos += digits;
        Ok(code)
    }

    fn number(&mut self) -> Result<(), SyntaxError> {
        let line = self.line;
        let start = self.pos;

        if self.peek(0) == Some('0') {
            let radix = match self.peek(1) {
                Some('x') | Some('X') => Some(16),
                Some('o') | Some('O') => Some(8),
                Some('b') | Some('B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                let digits = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
                let cleaned = digits.replace('_', "");
                let value = BigInt::parse_bytes(cleaned.as_bytes(), radix)
                    .ok_or_else(|| SyntaxError::new(format!("invalid number literal '{}'", digits), line))?;
                self.push(integer_token(value));
                return Ok(());
            }
        }

        let mut is_float = false;
        self.take_while(|c| c.is_ascii_digit() || c == '_');
        if self.peek(0) == Some('.') && self.peek(1).map_or(true, |c| c != '.') {
            is_float = true;
            self.pos += 1;
            self.take_while(|c| c.is_ascii_digit() || c == '_');
        }
        if matches!(self.peek(0), Some('e') | Some('E')) {
            let sign = matches!(self.peek(1), Some('+') | Some('-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek(digit_at).map_or(false, |c| c.is_ascii_digit()) {
                is_float = true;
                self.pos += digit_at;
                self.take_while(|c| c.is_ascii_digit());
            }
        }

        let text: String = self.chars[start..self.pos].iter().filter(|&&c| c != '_').collect();
        if self.peek(0).map_or(false, |c| c.is_alphabetic() || c == '_') {
            return Err(SyntaxError::new("invalid decimal literal", line));
        }

        if is_float {
            let value = text
                .parse::<f64>()
                .map_err(|_| SyntaxError::new(format!("invalid number literal '{}'", text), line))?;
            self.push(Tok::Float(value));
        } else {
            let value = text
                .parse::<BigInt>()
                .map_err(|_| SyntaxError::new(format!("invalid number literal '{}'", text), line))?;
            self.push(integer_token(value));
        }
        Ok(())
    }

    fn take_while(&mut self, keep: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while self.peek(0).map_or(false, &keep) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn operator(&mut self) -> Result<(), SyntaxError> {
        for &op in OPERATORS {
            let matches = op
                .chars()
                .enumerate()
                .all(|(i, c)| self.peek(i) == Some(c));
            if matches {
                self.pos += op.chars().count();
                match op {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.push(Tok::Op(op));
                return Ok(());
            }
        }
        let c = self.peek(0).unwrap_or(' ');
        Err(SyntaxError::new(format!("invalid character '{}'", c), self.line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Tok> {
        tokenize(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_indent_and_dedent() {
        let toks = kinds("if x:\n    y = 1\n\n    # note\nz = 2\n");
        assert_eq!(
            toks,
            vec![
                Tok::Name("if".into()),
                Tok::Name("x".into()),
                Tok::Op(":"),
                Tok::Newline,
                Tok::Indent,
                Tok::Name("y".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Newline,
                Tok::Dedent,
                Tok::Name("z".into()),
                Tok::Op("="),
                Tok::Int(2),
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_brackets_join_lines() {
        let toks = kinds("x = [1,\n     2]\n");
        assert!(!toks[..toks.len() - 2].contains(&Tok::Newline));
    }

    #[test]
    fn test_strings_and_prefixes() {
        assert_eq!(kinds("'a\\nb'")[0], Tok::Str("a\nb".into()));
        assert_eq!(kinds("r'a\\nb'")[0], Tok::Str("a\\nb".into()));
        assert_eq!(kinds("f\"{x}\"")[0], Tok::FStr("{x}".into()));
        assert_eq!(kinds("'''one\ntwo'''")[0], Tok::Str("one\ntwo".into()));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("1_000")[0], Tok::Int(1000));
        assert_eq!(kinds("0xff")[0], Tok::Int(255));
        assert_eq!(kinds("2.5e3")[0], Tok::Float(2500.0));
        assert_eq!(kinds(".5")[0], Tok::Float(0.5));
        assert_eq!(kinds("9223372036854775807")[0], Tok::Int(i64::MAX));
        assert_eq!(
            kinds("18446744073709551616")[0],
            Tok::BigInt(BigInt::from(u64::MAX) + 1u32)
        );
        assert_eq!(kinds("0x1_0000_0000_0000_0000")[0], Tok::BigInt(BigInt::from(1u128 << 64)));
    }

    #[test]
    fn test_errors_carry_line() {
        let err = tokenize("x = 1\ny = 'open\n").unwrap_err();
        assert_eq!(err.line, 2);
        let err = tokenize("if x:\n        a\n    b\n").unwrap_err();
        assert!(err.message.contains("unindent"));
    }
}
