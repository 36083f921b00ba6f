use crate::script::ast::BinOp;
use crate::script::error::{ErrorKind, ScriptError};

/// Bracket depth past which a fragment is rejected, keeping the parser's recursion bounded
const MAX_NESTING: usize = 48;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Identifiers and keywords, distinguished in the parser
    Name(String),
    Int(i64),
    Float(f64),
    /// String literal, escapes resolved
    Str(String),
    /// Formatted string literal; placeholders are parsed later
    FStr(String),
    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Dot,
    Arrow,
    At,
    Assign,
    AugAssign(BinOp),
    // Arithmetic operators
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    // Comparison operators
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    // Layout
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub line: u32,
}

const TAB_WIDTH: usize = 8;

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    tokens: Vec<Spanned>,
    indents: Vec<usize>,
    /// Indentation of the first logical line; fragments cut out of prose are often
    /// uniformly indented
    base_indent: Option<usize>,
    brackets: Vec<(char, u32)>,
}

/// Split a fragment into tokens, turning leading whitespace into `Indent`/`Dedent` pairs.
pub fn lex(src: &str) -> Result<Vec<Spanned>, ScriptError> {
    let mut lexer = Lexer {
        chars: src.chars().collect(),
        pos: 0,
        line: 1,
        tokens: Vec::new(),
        indents: vec![0],
        base_indent: None,
        brackets: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, token: Token, line: u32) {
        self.tokens.push(Spanned { token, line });
    }

    fn push_newline(&mut self) {
        if matches!(
            self.tokens.last().map(|t| &t.token),
            Some(tok) if *tok != Token::Newline
        ) {
            self.push(Token::Newline, self.line);
        }
    }

    fn run(&mut self) -> Result<(), ScriptError> {
        let mut at_line_start = true;
        while self.pos < self.chars.len() {
            if at_line_start && self.brackets.is_empty() {
                if self.indentation()? {
                    at_line_start = false;
                }
                continue;
            }
            let c = self.chars[self.pos];
            match c {
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '\n' => {
                    if self.brackets.is_empty() {
                        self.push_newline();
                        at_line_start = true;
                    }
                    self.line += 1;
                    self.pos += 1;
                }
                '#' => self.skip_comment(),
                '\\' => {
                    match (self.peek_at(1), self.peek_at(2)) {
                        (Some('\n'), _) => self.pos += 2,
                        (Some('\r'), Some('\n')) => self.pos += 3,
                        _ => {
                            return Err(ScriptError::syntax(
                                self.line,
                                "unexpected character after line continuation character",
                            ))
                        }
                    }
                    self.line += 1;
                }
                '"' | '\'' => {
                    let line = self.line;
                    let token = self.string("")?;
                    self.push(token, line);
                }
                c if c.is_ascii_digit()
                    || (c == '.' && self.peek_at(1).is_some_and(|n| n.is_ascii_digit())) =>
                {
                    let line = self.line;
                    let token = self.number()?;
                    self.push(token, line);
                }
                c if c.is_alphabetic() || c == '_' => {
                    let line = self.line;
                    let word = self.word();
                    let is_prefix = matches!(
                        word.to_ascii_lowercase().as_str(),
                        "r" | "b" | "u" | "f" | "rb" | "br" | "fr" | "rf"
                    );
                    if is_prefix && matches!(self.peek_at(0), Some('"' | '\'')) {
                        let token = self.string(&word.to_ascii_lowercase())?;
                        self.push(token, line);
                    } else {
                        self.push(Token::Name(word), line);
                    }
                }
                _ => self.punctuation()?,
            }
        }
        if let Some(&(open, line)) = self.brackets.last() {
            return Err(ScriptError::syntax(line, format!("'{open}' was never closed")));
        }
        self.push_newline();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Token::Dedent, self.line);
        }
        self.push(Token::Eof, self.line);
        Ok(())
    }

    /// Measure the indentation of a line. Returns false for blank and comment-only lines.
    fn indentation(&mut self) -> Result<bool, ScriptError> {
        let mut col = 0;
        while let Some(c) = self.peek_at(0) {
            match c {
                ' ' | '\x0c' => col += 1,
                '\t' => col += TAB_WIDTH - col % TAB_WIDTH,
                _ => break,
            }
            self.pos += 1;
        }
        match self.peek_at(0) {
            None => return Ok(false),
            Some('\n') => {
                self.pos += 1;
                self.line += 1;
                return Ok(false);
            }
            Some('\r') => {
                self.pos += 1;
                return Ok(false);
            }
            Some('#') => {
                self.skip_comment();
                return Ok(false);
            }
            Some(_) => {}
        }
        let base = *self.base_indent.get_or_insert(col);
        if col < base {
            return Err(self.indentation_error("unindent does not match any outer indentation level"));
        }
        let col = col - base;
        let current = self.indents.last().copied().unwrap_or(0);
        if col > current {
            self.indents.push(col);
            self.push(Token::Indent, self.line);
        } else {
            while col < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push(Token::Dedent, self.line);
            }
            if col != self.indents.last().copied().unwrap_or(0) {
                return Err(
                    self.indentation_error("unindent does not match any outer indentation level")
                );
            }
        }
        Ok(true)
    }

    fn indentation_error(&self, message: &str) -> ScriptError {
        ScriptError::new(ErrorKind::IndentationError, message).at(self.line)
    }

    fn skip_comment(&mut self) {
        while self.peek_at(0).is_some_and(|c| c != '\n') {
            self.pos += 1;
        }
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while self
            .peek_at(0)
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn number(&mut self) -> Result<Token, ScriptError> {
        let line = self.line;
        if self.peek_at(0) == Some('0') {
            let radix = match self.peek_at(1) {
                Some('x' | 'X') => Some(16),
                Some('o' | 'O') => Some(8),
                Some('b' | 'B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                let digits = self.digits(|c| c.is_digit(radix));
                return i64::from_str_radix(&digits, radix)
                    .map(Token::Int)
                    .map_err(|_| ScriptError::syntax(line, "invalid integer literal"));
            }
        }
        let mut text = self.digits(|c| c.is_ascii_digit());
        let mut is_float = false;
        if self.peek_at(0) == Some('.') && !self.peek_at(1).is_some_and(|c| c == '.') {
            self.pos += 1;
            is_float = true;
            text.push('.');
            text.push_str(&self.digits(|c| c.is_ascii_digit()));
        }
        if matches!(self.peek_at(0), Some('e' | 'E')) {
            let sign = matches!(self.peek_at(1), Some('+' | '-'));
            let exponent_start = if sign { 2 } else { 1 };
            if self.peek_at(exponent_start).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                text.push('e');
                if sign {
                    text.push(self.chars[self.pos + 1]);
                }
                self.pos += exponent_start;
                text.push_str(&self.digits(|c| c.is_ascii_digit()));
            }
        }
        if matches!(self.peek_at(0), Some('j' | 'J')) {
            return Err(ScriptError::syntax(line, "complex literals are not supported"));
        }
        if !is_float {
            if let Ok(n) = text.parse::<i64>() {
                return Ok(Token::Int(n));
            }
        }
        let text = if text.starts_with('.') { format!("0{text}") } else { text };
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|_| ScriptError::syntax(line, format!("invalid number literal '{text}'")))
    }

    fn digits(&mut self, accept: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek_at(0) {
            if accept(c) {
                out.push(c);
            } else if c != '_' {
                break;
            }
            self.pos += 1;
        }
        out
    }

    fn string(&mut self, prefix: &str) -> Result<Token, ScriptError> {
        let start_line = self.line;
        let raw = prefix.contains('r');
        let formatted = prefix.contains('f');
        let quote = self.chars[self.pos];
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };
        let mut s = String::new();
        loop {
            let Some(c) = self.peek_at(0) else {
                return Err(ScriptError::syntax(
                    start_line,
                    if triple {
                        "unterminated triple-quoted string literal"
                    } else {
                        "unterminated string literal"
                    },
                ));
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            }
            if c == '\n' {
                if !triple {
                    return Err(ScriptError::syntax(start_line, "unterminated string literal"));
                }
                self.line += 1;
            }
            if c == '\\' {
                let Some(next) = self.peek_at(1) else {
                    self.pos += 1;
                    continue;
                };
                self.pos += 2;
                if raw {
                    s.push('\\');
                    s.push(next);
                    if next == '\n' {
                        self.line += 1;
                    }
                    continue;
                }
                match next {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    'r' => s.push('\r'),
                    '0' => s.push('\0'),
                    '\\' => s.push('\\'),
                    '\'' => s.push('\''),
                    '"' => s.push('"'),
                    '\n' => self.line += 1,
                    'x' => s.push(self.hex_escape(2, start_line)?),
                    'u' => s.push(self.hex_escape(4, start_line)?),
                    other => {
                        s.push('\\');
                        s.push(other);
                    }
                }
                continue;
            }
            s.push(c);
            self.pos += 1;
        }
        Ok(if formatted { Token::FStr(s) } else { Token::Str(s) })
    }

    fn hex_escape(&mut self, len: usize, line: u32) -> Result<char, ScriptError> {
        let end = (self.pos + len).min(self.chars.len());
        let digits: String = self.chars[self.pos..end].iter().collect();
        self.pos = end;
        u32::from_str_radix(&digits, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| ScriptError::syntax(line, format!("invalid escape '\\x{digits}'")))
    }

    fn punctuation(&mut self) -> Result<(), ScriptError> {
        let line = self.line;
        let c = self.chars[self.pos];
        let next = self.peek_at(1);
        let third = self.peek_at(2);
        let (token, len) = match (c, next, third) {
            ('*', Some('*'), Some('=')) => (Token::AugAssign(BinOp::Pow), 3),
            ('/', Some('/'), Some('=')) => (Token::AugAssign(BinOp::FloorDiv), 3),
            ('*', Some('*'), _) => (Token::DoubleStar, 2),
            ('/', Some('/'), _) => (Token::DoubleSlash, 2),
            ('-', Some('>'), _) => (Token::Arrow, 2),
            ('=', Some('='), _) => (Token::Eq, 2),
            ('!', Some('='), _) => (Token::NotEq, 2),
            ('<', Some('='), _) => (Token::LtE, 2),
            ('>', Some('='), _) => (Token::GtE, 2),
            ('+', Some('='), _) => (Token::AugAssign(BinOp::Add), 2),
            ('-', Some('='), _) => (Token::AugAssign(BinOp::Sub), 2),
            ('*', Some('='), _) => (Token::AugAssign(BinOp::Mul), 2),
            ('/', Some('='), _) => (Token::AugAssign(BinOp::Div), 2),
            ('%', Some('='), _) => (Token::AugAssign(BinOp::Mod), 2),
            ('(', _, _) => (Token::LParen, 1),
            (')', _, _) => (Token::RParen, 1),
            ('[', _, _) => (Token::LBracket, 1),
            (']', _, _) => (Token::RBracket, 1),
            ('{', _, _) => (Token::LBrace, 1),
            ('}', _, _) => (Token::RBrace, 1),
            (',', _, _) => (Token::Comma, 1),
            (':', _, _) => (Token::Colon, 1),
            (';', _, _) => (Token::Semicolon, 1),
            ('.', _, _) => (Token::Dot, 1),
            ('@', _, _) => (Token::At, 1),
            ('=', _, _) => (Token::Assign, 1),
            ('+', _, _) => (Token::Plus, 1),
            ('-', _, _) => (Token::Minus, 1),
            ('*', _, _) => (Token::Star, 1),
            ('/', _, _) => (Token::Slash, 1),
            ('%', _, _) => (Token::Percent, 1),
            ('<', _, _) => (Token::Lt, 1),
            ('>', _, _) => (Token::Gt, 1),
            (other, _, _) => {
                return Err(ScriptError::syntax(
                    line,
                    format!("invalid character '{other}'"),
                ))
            }
        };
        match c {
            '(' | '[' | '{' => {
                if self.brackets.len() >= MAX_NESTING {
                    return Err(ScriptError::syntax(line, "too many nested parentheses"));
                }
                self.brackets.push((c, line))
            }
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match self.brackets.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, _)) => {
                        return Err(ScriptError::syntax(
                            line,
                            format!("closing parenthesis '{c}' does not match opening parenthesis '{open}'"),
                        ))
                    }
                    None => return Err(ScriptError::syntax(line, format!("unmatched '{c}'"))),
                }
            }
            _ => {}
        }
        self.pos += len;
        self.push(token, line);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        lex(src).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn blocks_produce_indent_and_dedent() {
        let tokens = kinds("if x:\n    y = 1\nz = 2\n");
        assert_eq!(
            tokens,
            vec![
                Token::Name("if".into()),
                Token::Name("x".into()),
                Token::Colon,
                Token::Newline,
                Token::Indent,
                Token::Name("y".into()),
                Token::Assign,
                Token::Int(1),
                Token::Newline,
                Token::Dedent,
                Token::Name("z".into()),
                Token::Assign,
                Token::Int(2),
                Token::Newline,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn uniformly_indented_fragments_are_accepted() {
        let tokens = kinds("    a = 1\n    b = 2.5e1\n");
        assert!(!tokens.contains(&Token::Indent));
        assert!(tokens.contains(&Token::Float(25.)));
    }

    #[test]
    fn newlines_inside_brackets_are_ignored() {
        let tokens = kinds("f(1,\n  2)\n");
        assert_eq!(tokens.iter().filter(|t| **t == Token::Newline).count(), 1);
    }

    #[test]
    fn strings_and_prefixes() {
        let tokens = kinds("a = 'x\\ty' + f\"{b:.2f}\" + r'\\d'\n");
        assert!(tokens.contains(&Token::Str("x\ty".into())));
        assert!(tokens.contains(&Token::FStr("{b:.2f}".into())));
        assert!(tokens.contains(&Token::Str("\\d".into())));
    }

    #[test]
    fn unclosed_bracket_reports_its_line() {
        let err = lex("x = (").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SyntaxError);
        assert_eq!(err.line, Some(1));
    }

    #[test]
    fn comments_and_blank_lines_do_not_change_indentation() {
        let tokens = kinds("def f():\n\n    # comment\n    return 1\n");
        assert_eq!(tokens.iter().filter(|t| **t == Token::Indent).count(), 1);
    }
}
