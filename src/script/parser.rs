//! Recursive descent parser producing the [ast](crate::script::ast).
//! Parsing never evaluates anything, so it is safe to run on untrusted text.
use std::rc::Rc;

use crate::script::ast::{
    Alias, Arg, BinOp, BoolOp, CmpOp, CompKind, Constant, Expr, FPart, FunctionDef, Generator,
    Handler, Param, Stmt, StmtKind, Target, UnaryOp,
};
use crate::script::error::{ErrorKind, ScriptError};
use crate::script::lexer::{lex, Spanned, Token};

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Nesting past which an expression or block is rejected, so neither parsing
/// nor evaluating it can exhaust the stack
const MAX_EXPR_DEPTH: usize = 200;

/// Parse a whole fragment.
pub fn parse(src: &str) -> Result<Vec<Stmt>, ScriptError> {
    let tokens = lex(src)?;
    let mut parser = Parser::new(&tokens);
    parser.parse_module()
}

struct Parser<'a> {
    tokens: &'a [Spanned],
    pos: usize,
    /// Open recursive entries: sub-expressions, unary operators, exponents and blocks
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Spanned]) -> Self {
        Parser {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn too_deep(&self) -> ScriptError {
        self.err("expression too deeply nested")
    }

    /// Runs `parse` one nesting level deeper
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T, ScriptError>) -> Result<T, ScriptError> {
        if self.depth >= MAX_EXPR_DEPTH {
            return Err(self.too_deep());
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    /// Left-associative chains grow without recursing, so their depth is measured instead
    fn check_depth(&self, expr: &Expr) -> Result<(), ScriptError> {
        if self.depth + expr_depth(expr) > MAX_EXPR_DEPTH {
            return Err(self.too_deep());
        }
        Ok(())
    }

    fn cur(&self) -> &'a Spanned {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &'a Token {
        &self.cur().token
    }

    fn peek_next(&self) -> &'a Token {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)].token
    }

    fn cur_line(&self) -> u32 {
        self.cur().line
    }

    fn advance(&mut self) -> &'a Spanned {
        let t = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn err(&self, msg: impl Into<String>) -> ScriptError {
        ScriptError::syntax(self.cur_line(), msg)
    }

    fn unexpected(&self) -> ScriptError {
        match self.peek() {
            Token::Eof => self.err("unexpected end of input"),
            Token::Indent => {
                ScriptError::new(ErrorKind::IndentationError, "unexpected indent").at(self.cur_line())
            }
            Token::Newline => self.err("invalid syntax: unexpected end of line"),
            other => self.err(format!("invalid syntax near {}", describe(other))),
        }
    }

    fn is_word(&self, w: &str) -> bool {
        matches!(self.peek(), Token::Name(x) if x == w)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ScriptError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.err(format!(
                "expected {}, got {}",
                describe(&token),
                describe(self.peek())
            )))
        }
    }

    fn expect_word(&mut self, expected: &str) -> Result<(), ScriptError> {
        if self.is_word(expected) {
            self.advance();
            Ok(())
        } else {
            Err(self.err(format!("expected '{}', got {}", expected, describe(self.peek()))))
        }
    }

    fn take_name(&mut self) -> Result<String, ScriptError> {
        match self.peek().clone() {
            Token::Name(w) if !KEYWORDS.contains(&w.as_str()) => {
                self.advance();
                Ok(w)
            }
            _ => Err(self.err(format!("expected identifier, got {}", describe(self.peek())))),
        }
    }

    // -- Statements ----------------------------------------------

    fn parse_module(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut body = Vec::new();
        while self.peek() != &Token::Eof {
            if self.eat(&Token::Newline) {
                continue;
            }
            body.extend(self.parse_statement()?);
        }
        Ok(body)
    }

    fn parse_statement(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let line = self.cur_line();
        let kind = match self.peek() {
            Token::Indent => return Err(self.unexpected()),
            Token::At => return Ok(vec![self.parse_decorated()?]),
            Token::Name(w) => match w.as_str() {
                "if" => {
                    self.advance();
                    self.parse_if_rest()?
                }
                "for" => self.parse_for()?,
                "while" => self.parse_while()?,
                "def" => self.parse_def(Vec::new())?,
                "try" => self.parse_try()?,
                "with" => self.parse_with()?,
                "class" => return Err(self.err("class definitions are not supported")),
                "async" | "await" | "yield" | "nonlocal" => {
                    return Err(self.err(format!("'{w}' is not supported")))
                }
                _ => return self.parse_simple_statements(),
            },
            _ => return self.parse_simple_statements(),
        };
        Ok(vec![Stmt { kind, line }])
    }

    fn parse_simple_statements(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut stmts = Vec::new();
        loop {
            let line = self.cur_line();
            let kind = self.parse_simple()?;
            stmts.push(Stmt { kind, line });
            if self.eat(&Token::Semicolon) {
                if matches!(self.peek(), Token::Newline | Token::Eof) {
                    break;
                }
                continue;
            }
            break;
        }
        if !self.eat(&Token::Newline) && self.peek() != &Token::Eof {
            return Err(self.unexpected());
        }
        Ok(stmts)
    }

    fn parse_simple(&mut self) -> Result<StmtKind, ScriptError> {
        if let Token::Name(w) = self.peek().clone() {
            match w.as_str() {
                "pass" => {
                    self.advance();
                    return Ok(StmtKind::Pass);
                }
                "break" => {
                    self.advance();
                    return Ok(StmtKind::Break);
                }
                "continue" => {
                    self.advance();
                    return Ok(StmtKind::Continue);
                }
                "return" => {
                    self.advance();
                    let value = if self.at_statement_end() {
                        None
                    } else {
                        Some(self.parse_exprlist()?)
                    };
                    return Ok(StmtKind::Return(value));
                }
                "import" => {
                    self.advance();
                    return self.parse_import();
                }
                "from" => {
                    self.advance();
                    return self.parse_from_import();
                }
                "raise" => {
                    self.advance();
                    let exc = if self.at_statement_end() {
                        None
                    } else {
                        Some(self.parse_test()?)
                    };
                    if self.is_word("from") {
                        self.advance();
                        self.parse_test()?;
                    }
                    return Ok(StmtKind::Raise(exc));
                }
                "assert" => {
                    self.advance();
                    let test = self.parse_test()?;
                    let msg = if self.eat(&Token::Comma) {
                        Some(self.parse_test()?)
                    } else {
                        None
                    };
                    return Ok(StmtKind::Assert { test, msg });
                }
                "del" => {
                    self.advance();
                    let targets = match self.parse_exprlist()? {
                        Expr::Tuple(items) => items
                            .into_iter()
                            .map(|e| self.to_target(e))
                            .collect::<Result<_, _>>()?,
                        other => vec![self.to_target(other)?],
                    };
                    return Ok(StmtKind::Del(targets));
                }
                "global" => {
                    self.advance();
                    let mut names = vec![self.take_name()?];
                    while self.eat(&Token::Comma) {
                        names.push(self.take_name()?);
                    }
                    return Ok(StmtKind::Global(names));
                }
                _ => {}
            }
        }
        self.parse_expression_statement()
    }

    fn parse_expression_statement(&mut self) -> Result<StmtKind, ScriptError> {
        let first = self.parse_exprlist()?;
        match self.peek().clone() {
            Token::Assign => {
                let mut targets = vec![self.to_target(first)?];
                loop {
                    self.advance();
                    let expr = self.parse_exprlist()?;
                    if self.peek() == &Token::Assign {
                        targets.push(self.to_target(expr)?);
                    } else {
                        return Ok(StmtKind::Assign {
                            targets,
                            value: expr,
                        });
                    }
                }
            }
            Token::AugAssign(op) => {
                self.advance();
                let target = self.to_target(first)?;
                if matches!(target, Target::Tuple(_) | Target::Starred(_)) {
                    return Err(self.err("illegal expression for augmented assignment"));
                }
                let value = self.parse_exprlist()?;
                Ok(StmtKind::AugAssign { target, op, value })
            }
            Token::Colon => {
                self.advance();
                let target = self.to_target(first)?;
                self.parse_test()?;
                let value = if self.eat(&Token::Assign) {
                    Some(self.parse_exprlist()?)
                } else {
                    None
                };
                Ok(StmtKind::AnnAssign { target, value })
            }
            _ => Ok(StmtKind::Expr(first)),
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.peek(), Token::Newline | Token::Eof | Token::Semicolon)
    }

    fn dotted_name(&mut self) -> Result<String, ScriptError> {
        if self.peek() == &Token::Dot {
            return Err(self.err("relative imports are not supported"));
        }
        let mut name = self.take_name()?;
        while self.eat(&Token::Dot) {
            name.push('.');
            name.push_str(&self.take_name()?);
        }
        Ok(name)
    }

    fn alias_suffix(&mut self) -> Result<Option<String>, ScriptError> {
        if self.is_word("as") {
            self.advance();
            Ok(Some(self.take_name()?))
        } else {
            Ok(None)
        }
    }

    fn parse_import(&mut self) -> Result<StmtKind, ScriptError> {
        let mut aliases = Vec::new();
        loop {
            let name = self.dotted_name()?;
            let asname = self.alias_suffix()?;
            aliases.push(Alias { name, asname });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(StmtKind::Import(aliases))
    }

    fn parse_from_import(&mut self) -> Result<StmtKind, ScriptError> {
        let module = self.dotted_name()?;
        self.expect_word("import")?;
        if self.eat(&Token::Star) {
            return Ok(StmtKind::ImportFrom {
                module,
                names: Vec::new(),
            });
        }
        let parenthesized = self.eat(&Token::LParen);
        let mut names = Vec::new();
        loop {
            if parenthesized && self.peek() == &Token::RParen {
                break;
            }
            let name = self.take_name()?;
            let asname = self.alias_suffix()?;
            names.push(Alias { name, asname });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        if parenthesized {
            self.expect(Token::RParen)?;
        }
        if names.is_empty() {
            return Err(self.err("expected names to import"));
        }
        Ok(StmtKind::ImportFrom { module, names })
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.nested(Self::parse_block_body)
    }

    fn parse_block_body(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect(Token::Colon)?;
        if !self.eat(&Token::Newline) {
            return self.parse_simple_statements();
        }
        if !self.eat(&Token::Indent) {
            return Err(ScriptError::new(
                ErrorKind::IndentationError,
                "expected an indented block",
            )
            .at(self.cur_line()));
        }
        let mut body = Vec::new();
        while !matches!(self.peek(), Token::Dedent | Token::Eof) {
            if self.eat(&Token::Newline) {
                continue;
            }
            body.extend(self.parse_statement()?);
        }
        self.eat(&Token::Dedent);
        Ok(body)
    }

    /// Everything after `if`/`elif`
    fn parse_if_rest(&mut self) -> Result<StmtKind, ScriptError> {
        let test = self.parse_test()?;
        let body = self.parse_block()?;
        let orelse = if self.is_word("elif") {
            let line = self.cur_line();
            self.advance();
            vec![Stmt {
                kind: self.parse_if_rest()?,
                line,
            }]
        } else {
            self.parse_else()?
        };
        Ok(StmtKind::If { test, body, orelse })
    }

    fn parse_else(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        if self.is_word("else") {
            self.advance();
            self.parse_block()
        } else {
            Ok(Vec::new())
        }
    }

    fn parse_for(&mut self) -> Result<StmtKind, ScriptError> {
        self.advance();
        let target = self.parse_target_list()?;
        self.expect_word("in")?;
        let iter = self.parse_exprlist()?;
        let body = self.parse_block()?;
        let orelse = self.parse_else()?;
        Ok(StmtKind::For {
            target,
            iter,
            body,
            orelse,
        })
    }

    fn parse_while(&mut self) -> Result<StmtKind, ScriptError> {
        self.advance();
        let test = self.parse_test()?;
        let body = self.parse_block()?;
        let orelse = self.parse_else()?;
        Ok(StmtKind::While { test, body, orelse })
    }

    fn parse_decorated(&mut self) -> Result<Stmt, ScriptError> {
        let mut decorators = Vec::new();
        while self.eat(&Token::At) {
            decorators.push(self.parse_test()?);
            self.expect(Token::Newline)?;
        }
        let line = self.cur_line();
        if !self.is_word("def") {
            return Err(self.err("decorators are only supported on functions"));
        }
        Ok(Stmt {
            kind: self.parse_def(decorators)?,
            line,
        })
    }

    fn parse_def(&mut self, decorators: Vec<Expr>) -> Result<StmtKind, ScriptError> {
        self.advance();
        let name = self.take_name()?;
        self.expect(Token::LParen)?;
        let (params, vararg, kwarg) = self.parse_params(Token::RParen)?;
        self.expect(Token::RParen)?;
        if self.eat(&Token::Arrow) {
            self.parse_test()?;
        }
        let body = self.parse_block()?;
        Ok(StmtKind::FunctionDef(Rc::new(FunctionDef {
            name,
            params,
            vararg,
            kwarg,
            body,
            decorators,
        })))
    }

    #[allow(clippy::type_complexity)]
    fn parse_params(
        &mut self,
        end: Token,
    ) -> Result<(Vec<Param>, Option<String>, Option<String>), ScriptError> {
        let annotations = end == Token::RParen;
        let mut params = Vec::new();
        let mut vararg = None;
        let mut kwarg = None;
        while self.peek() != &end {
            if self.eat(&Token::DoubleStar) {
                kwarg = Some(self.take_name()?);
                if annotations && self.eat(&Token::Colon) {
                    self.parse_test()?;
                }
            } else if self.eat(&Token::Star) {
                if self.peek() != &Token::Comma {
                    vararg = Some(self.take_name()?);
                    if annotations && self.eat(&Token::Colon) {
                        self.parse_test()?;
                    }
                }
            } else if self.eat(&Token::Slash) {
            } else {
                let name = self.take_name()?;
                if annotations && self.eat(&Token::Colon) {
                    self.parse_test()?;
                }
                let default = if self.eat(&Token::Assign) {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                if default.is_none() && params.iter().any(|p: &Param| p.default.is_some()) {
                    return Err(self.err("non-default argument follows default argument"));
                }
                params.push(Param { name, default });
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok((params, vararg, kwarg))
    }

    fn parse_try(&mut self) -> Result<StmtKind, ScriptError> {
        self.advance();
        let body = self.parse_block()?;
        let mut handlers = Vec::new();
        while self.is_word("except") {
            self.advance();
            let kind = if self.peek() == &Token::Colon {
                None
            } else {
                Some(self.parse_test()?)
            };
            let name = self.alias_suffix()?;
            let body = self.parse_block()?;
            handlers.push(Handler { kind, name, body });
        }
        let orelse = self.parse_else()?;
        let finalbody = if self.is_word("finally") {
            self.advance();
            self.parse_block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.err("expected 'except' or 'finally' block"));
        }
        Ok(StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        })
    }

    fn parse_with(&mut self) -> Result<StmtKind, ScriptError> {
        self.advance();
        let mut items = Vec::new();
        loop {
            let context = self.parse_test()?;
            let target = if self.is_word("as") {
                self.advance();
                let target = self.parse_arith()?;
                Some(self.to_target(target)?)
            } else {
                None
            };
            items.push((context, target));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        let body = self.parse_block()?;
        Ok(StmtKind::With { items, body })
    }

    fn to_target(&self, expr: Expr) -> Result<Target, ScriptError> {
        Ok(match expr {
            Expr::Name(name) => Target::Name(name),
            Expr::Attribute(value, attr) => Target::Attribute(value, attr),
            Expr::Subscript(value, index) => Target::Subscript(value, index),
            Expr::Tuple(items) | Expr::List(items) => Target::Tuple(
                items
                    .into_iter()
                    .map(|e| self.to_target(e))
                    .collect::<Result<_, _>>()?,
            ),
            Expr::Starred(inner) => Target::Starred(Box::new(self.to_target(*inner)?)),
            _ => return Err(self.err("cannot assign to expression")),
        })
    }

    /// Loop variables of `for` statements and comprehensions
    fn parse_target_list(&mut self) -> Result<Target, ScriptError> {
        let mut items = vec![self.parse_target_item()?];
        let mut trailing_comma = false;
        while self.eat(&Token::Comma) {
            trailing_comma = true;
            if self.is_word("in") {
                break;
            }
            items.push(self.parse_target_item()?);
            trailing_comma = false;
        }
        if items.len() == 1 && !trailing_comma {
            let item = items.remove(0);
            return self.to_target(item);
        }
        self.to_target(Expr::Tuple(items))
    }

    fn parse_target_item(&mut self) -> Result<Expr, ScriptError> {
        if self.eat(&Token::Star) {
            return Ok(Expr::Starred(Box::new(self.parse_arith()?)));
        }
        self.parse_arith()
    }

    // -- Expressions ---------------------------------------------

    /// A comma separated list, folded into a tuple when it has a comma
    fn parse_exprlist(&mut self) -> Result<Expr, ScriptError> {
        let first = self.parse_test_or_star()?;
        if self.peek() != &Token::Comma {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if matches!(
                self.peek(),
                Token::Newline
                    | Token::Eof
                    | Token::Assign
                    | Token::AugAssign(_)
                    | Token::Colon
                    | Token::Semicolon
                    | Token::RParen
            ) {
                break;
            }
            items.push(self.parse_test_or_star()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn parse_test_or_star(&mut self) -> Result<Expr, ScriptError> {
        if self.eat(&Token::Star) {
            return Ok(Expr::Starred(Box::new(self.parse_arith()?)));
        }
        self.parse_test()
    }

    pub fn parse_test(&mut self) -> Result<Expr, ScriptError> {
        self.nested(Self::parse_conditional)
    }

    fn parse_conditional(&mut self) -> Result<Expr, ScriptError> {
        if self.is_word("lambda") {
            return self.parse_lambda();
        }
        let body = self.parse_or_test()?;
        if self.is_word("if") {
            self.advance();
            let test = self.parse_or_test()?;
            self.expect_word("else")?;
            let orelse = self.parse_test()?;
            return Ok(Expr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn parse_lambda(&mut self) -> Result<Expr, ScriptError> {
        let line = self.cur_line();
        self.advance();
        let (params, vararg, kwarg) = self.parse_params(Token::Colon)?;
        self.expect(Token::Colon)?;
        let body = self.parse_test()?;
        Ok(Expr::Lambda(Rc::new(FunctionDef {
            name: "<lambda>".to_string(),
            params,
            vararg,
            kwarg,
            body: vec![Stmt {
                kind: StmtKind::Return(Some(body)),
                line,
            }],
            decorators: Vec::new(),
        })))
    }

    fn parse_or_test(&mut self) -> Result<Expr, ScriptError> {
        let first = self.parse_and_test()?;
        if !self.is_word("or") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.is_word("or") {
            self.advance();
            values.push(self.parse_and_test()?);
        }
        Ok(Expr::BoolOp(BoolOp::Or, values))
    }

    fn parse_and_test(&mut self) -> Result<Expr, ScriptError> {
        let first = self.parse_not_test()?;
        if !self.is_word("and") {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.is_word("and") {
            self.advance();
            values.push(self.parse_not_test()?);
        }
        Ok(Expr::BoolOp(BoolOp::And, values))
    }

    fn parse_not_test(&mut self) -> Result<Expr, ScriptError> {
        if self.is_word("not") {
            self.advance();
            let operand = self.nested(Self::parse_not_test)?;
            return Ok(Expr::UnaryOp(UnaryOp::Not, Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ScriptError> {
        let left = self.parse_arith()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.peek() {
                Token::Eq => CmpOp::Eq,
                Token::NotEq => CmpOp::NotEq,
                Token::Lt => CmpOp::Lt,
                Token::LtE => CmpOp::LtE,
                Token::Gt => CmpOp::Gt,
                Token::GtE => CmpOp::GtE,
                Token::Name(w) if w == "in" => CmpOp::In,
                Token::Name(w) if w == "not" && matches!(self.peek_next(), Token::Name(n) if n == "in") => {
                    self.advance();
                    CmpOp::NotIn
                }
                Token::Name(w) if w == "is" => {
                    if matches!(self.peek_next(), Token::Name(n) if n == "not") {
                        self.advance();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.advance();
            ops.push((op, self.parse_arith()?));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), ops))
        }
    }

    fn parse_arith(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_term()?;
            left = Expr::BinOp(Box::new(left), op, Box::new(right));
            self.check_depth(&left)?;
        }
    }

    fn parse_term(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_factor()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::DoubleSlash => BinOp::FloorDiv,
                Token::Percent => BinOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_factor()?;
            left = Expr::BinOp(Box::new(left), op, Box::new(right));
            self.check_depth(&left)?;
        }
    }

    fn parse_factor(&mut self) -> Result<Expr, ScriptError> {
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Plus => UnaryOp::Pos,
            _ => return self.parse_power(),
        };
        self.advance();
        let operand = self.nested(Self::parse_factor)?;
        Ok(match (op, operand) {
            (UnaryOp::Neg, Expr::Constant(Constant::Int(n))) if n != i64::MIN => {
                Expr::Constant(Constant::Int(-n))
            }
            (UnaryOp::Neg, Expr::Constant(Constant::Float(f))) => {
                Expr::Constant(Constant::Float(-f))
            }
            (op, operand) => Expr::UnaryOp(op, Box::new(operand)),
        })
    }

    fn parse_power(&mut self) -> Result<Expr, ScriptError> {
        let base = self.parse_primary()?;
        if self.eat(&Token::DoubleStar) {
            let exponent = self.nested(Self::parse_factor)?;
            return Ok(Expr::BinOp(Box::new(base), BinOp::Pow, Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek() {
                Token::LParen => {
                    self.advance();
                    let args = self.parse_call_args()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                    };
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_subscript()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Subscript(Box::new(expr), Box::new(index));
                }
                Token::Dot => {
                    self.advance();
                    let attr = match self.peek().clone() {
                        Token::Name(w) => {
                            self.advance();
                            w
                        }
                        _ => return Err(self.err("expected attribute name after '.'")),
                    };
                    expr = Expr::Attribute(Box::new(expr), attr);
                }
                _ => return Ok(expr),
            }
            self.check_depth(&expr)?;
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<Arg>, ScriptError> {
        let mut args = Vec::new();
        while self.peek() != &Token::RParen {
            if self.eat(&Token::Star) {
                args.push(Arg::Star(self.parse_test()?));
            } else if self.eat(&Token::DoubleStar) {
                args.push(Arg::DoubleStar(self.parse_test()?));
            } else if matches!(self.peek(), Token::Name(_)) && self.peek_next() == &Token::Assign {
                let name = self.take_name()?;
                self.advance();
                args.push(Arg::Keyword(name, self.parse_test()?));
            } else {
                let value = self.parse_test()?;
                if self.is_word("for") {
                    let generators = self.parse_comp_for()?;
                    args.push(Arg::Positional(Expr::Comprehension {
                        kind: CompKind::Generator,
                        element: Box::new(value),
                        key: None,
                        generators,
                    }));
                } else {
                    if matches!(args.last(), Some(Arg::Keyword(..) | Arg::DoubleStar(_))) {
                        return Err(self.err("positional argument follows keyword argument"));
                    }
                    args.push(Arg::Positional(value));
                }
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen)?;
        Ok(args)
    }

    fn parse_subscript(&mut self) -> Result<Expr, ScriptError> {
        let first = self.parse_slice_item()?;
        if self.peek() != &Token::Comma {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if self.peek() == &Token::RBracket {
                break;
            }
            items.push(self.parse_slice_item()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn parse_slice_item(&mut self) -> Result<Expr, ScriptError> {
        let lower = if self.peek() == &Token::Colon {
            None
        } else {
            let value = self.parse_test_or_star()?;
            if self.peek() != &Token::Colon {
                return Ok(value);
            }
            Some(Box::new(value))
        };
        self.expect(Token::Colon)?;
        let bound_follows =
            |p: &Self| !matches!(p.peek(), Token::Colon | Token::RBracket | Token::Comma);
        let upper = if bound_follows(self) {
            Some(Box::new(self.parse_test()?))
        } else {
            None
        };
        let step = if self.eat(&Token::Colon) && bound_follows(self) {
            Some(Box::new(self.parse_test()?))
        } else {
            None
        };
        Ok(Expr::Slice { lower, upper, step })
    }

    fn parse_comp_for(&mut self) -> Result<Vec<Generator>, ScriptError> {
        let mut generators = Vec::new();
        while self.is_word("for") {
            self.advance();
            let target = self.parse_target_list()?;
            self.expect_word("in")?;
            let iter = self.parse_or_test()?;
            let mut ifs = Vec::new();
            while self.is_word("if") {
                self.advance();
                ifs.push(self.parse_or_test()?);
            }
            generators.push(Generator { target, iter, ifs });
        }
        Ok(generators)
    }

    fn comprehension(
        &mut self,
        kind: CompKind,
        element: Expr,
        key: Option<Expr>,
    ) -> Result<Expr, ScriptError> {
        let generators = self.parse_comp_for()?;
        Ok(Expr::Comprehension {
            kind,
            element: Box::new(element),
            key: key.map(Box::new),
            generators,
        })
    }

    /// Items of a display up to (not including) the closing token
    fn parse_display_items(&mut self, first: Expr, close: &Token) -> Result<Vec<Expr>, ScriptError> {
        let mut items = vec![first];
        while self.eat(&Token::Comma) {
            if self.peek() == close {
                break;
            }
            items.push(self.parse_test_or_star()?);
        }
        Ok(items)
    }

    fn parse_atom(&mut self) -> Result<Expr, ScriptError> {
        match self.peek().clone() {
            Token::Name(w) => {
                let constant = match w.as_str() {
                    "True" => Some(Constant::Bool(true)),
                    "False" => Some(Constant::Bool(false)),
                    "None" => Some(Constant::None),
                    _ => None,
                };
                if let Some(constant) = constant {
                    self.advance();
                    return Ok(Expr::Constant(constant));
                }
                if KEYWORDS.contains(&w.as_str()) {
                    return Err(self.unexpected());
                }
                self.advance();
                Ok(Expr::Name(w))
            }
            Token::Int(n) => {
                self.advance();
                Ok(Expr::Constant(Constant::Int(n)))
            }
            Token::Float(f) => {
                self.advance();
                Ok(Expr::Constant(Constant::Float(f)))
            }
            Token::Str(_) | Token::FStr(_) => self.parse_strings(),
            Token::LParen => {
                self.advance();
                if self.eat(&Token::RParen) {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.parse_test_or_star()?;
                if self.is_word("for") {
                    let comp = self.comprehension(CompKind::Generator, first, None)?;
                    self.expect(Token::RParen)?;
                    return Ok(comp);
                }
                if self.peek() == &Token::Comma {
                    let items = self.parse_display_items(first, &Token::RParen)?;
                    self.expect(Token::RParen)?;
                    return Ok(Expr::Tuple(items));
                }
                self.expect(Token::RParen)?;
                Ok(first)
            }
            Token::LBracket => {
                self.advance();
                if self.eat(&Token::RBracket) {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.parse_test_or_star()?;
                let list = if self.is_word("for") {
                    self.comprehension(CompKind::List, first, None)?
                } else {
                    Expr::List(self.parse_display_items(first, &Token::RBracket)?)
                };
                self.expect(Token::RBracket)?;
                Ok(list)
            }
            Token::LBrace => {
                self.advance();
                if self.eat(&Token::RBrace) {
                    return Ok(Expr::Dict(Vec::new()));
                }
                if self.peek() == &Token::DoubleStar {
                    return Err(self.err("dictionary unpacking is not supported"));
                }
                let first = self.parse_test_or_star()?;
                let display = if self.eat(&Token::Colon) {
                    let value = self.parse_test()?;
                    if self.is_word("for") {
                        self.comprehension(CompKind::Dict, value, Some(first))?
                    } else {
                        let mut entries = vec![(first, value)];
                        while self.eat(&Token::Comma) {
                            if self.peek() == &Token::RBrace {
                                break;
                            }
                            let key = self.parse_test()?;
                            self.expect(Token::Colon)?;
                            entries.push((key, self.parse_test()?));
                        }
                        Expr::Dict(entries)
                    }
                } else if self.is_word("for") {
                    self.comprehension(CompKind::Set, first, None)?
                } else {
                    Expr::Set(self.parse_display_items(first, &Token::RBrace)?)
                };
                self.expect(Token::RBrace)?;
                Ok(display)
            }
            _ => Err(self.unexpected()),
        }
    }

    /// Adjacent literals concatenate, formatted or not
    fn parse_strings(&mut self) -> Result<Expr, ScriptError> {
        let mut parts: Vec<FPart> = Vec::new();
        let mut formatted = false;
        loop {
            let line = self.cur_line();
            match self.peek().clone() {
                Token::Str(s) => {
                    self.advance();
                    push_literal(&mut parts, &s);
                }
                Token::FStr(s) => {
                    self.advance();
                    formatted = true;
                    for part in parse_fstring(&s, line)? {
                        match part {
                            FPart::Literal(text) => push_literal(&mut parts, &text),
                            field => parts.push(field),
                        }
                    }
                }
                _ => break,
            }
        }
        if !formatted {
            let text = match parts.pop() {
                Some(FPart::Literal(text)) => text,
                _ => String::new(),
            };
            return Ok(Expr::Constant(Constant::Str(text)));
        }
        Ok(Expr::JoinedStr(parts))
    }
}

/// Height of the expression tree; a lambda counts as a leaf since its body runs in its own call
fn expr_depth(expr: &Expr) -> usize {
    let deepest = |exprs: &mut dyn Iterator<Item = &Expr>| exprs.map(expr_depth).max().unwrap_or(0);
    let below = match expr {
        Expr::Constant(_) | Expr::Name(_) | Expr::Lambda(_) => 0,
        Expr::JoinedStr(parts) => deepest(&mut parts.iter().filter_map(|part| match part {
            FPart::Field { expr, .. } => Some(&**expr),
            FPart::Literal(_) => None,
        })),
        Expr::Attribute(value, _) | Expr::UnaryOp(_, value) | Expr::Starred(value) => expr_depth(value),
        Expr::Subscript(value, index) | Expr::BinOp(value, _, index) => expr_depth(value).max(expr_depth(index)),
        Expr::Slice { lower, upper, step } => deepest(&mut [lower, upper, step].into_iter().flatten().map(|e| &**e)),
        Expr::Call { func, args } => expr_depth(func).max(deepest(&mut args.iter().map(|arg| match arg {
            Arg::Positional(e) | Arg::Star(e) | Arg::Keyword(_, e) | Arg::DoubleStar(e) => e,
        }))),
        Expr::BoolOp(_, values) | Expr::List(values) | Expr::Tuple(values) | Expr::Set(values) => {
            deepest(&mut values.iter())
        }
        Expr::Compare(left, ops) => expr_depth(left).max(deepest(&mut ops.iter().map(|(_, e)| e))),
        Expr::IfExp { test, body, orelse } => expr_depth(test).max(expr_depth(body)).max(expr_depth(orelse)),
        Expr::Dict(items) => deepest(&mut items.iter().flat_map(|(k, v)| [k, v])),
        Expr::Comprehension {
            element,
            key,
            generators,
            ..
        } => expr_depth(element)
            .max(key.as_deref().map_or(0, expr_depth))
            .max(deepest(&mut generators.iter().flat_map(|g| std::iter::once(&g.iter).chain(&g.ifs)))),
    };
    below + 1
}

fn push_literal(parts: &mut Vec<FPart>, text: &str) {
    if let Some(FPart::Literal(existing)) = parts.last_mut() {
        existing.push_str(text);
    } else {
        parts.push(FPart::Literal(text.to_string()));
    }
}

/// Split the body of an f-string into literal text and `{expr!conv:spec}` fields.
fn parse_fstring(body: &str, line: u32) -> Result<Vec<FPart>, ScriptError> {
    let chars: Vec<char> = body.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut pos = 0;
    while pos < chars.len() {
        let c = chars[pos];
        if c == '{' && chars.get(pos + 1) == Some(&'{') {
            literal.push('{');
            pos += 2;
            continue;
        }
        if c == '}' && chars.get(pos + 1) == Some(&'}') {
            literal.push('}');
            pos += 2;
            continue;
        }
        if c == '}' {
            return Err(ScriptError::syntax(line, "f-string: single '}' is not allowed"));
        }
        if c != '{' {
            literal.push(c);
            pos += 1;
            continue;
        }
        if !literal.is_empty() {
            parts.push(FPart::Literal(std::mem::take(&mut literal)));
        }
        pos += 1;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut expr_text = String::new();
        let mut conversion = None;
        let mut spec = None;
        loop {
            let Some(&c) = chars.get(pos) else {
                return Err(ScriptError::syntax(line, "f-string: expecting '}'"));
            };
            if let Some(q) = quote {
                if c == q {
                    quote = None;
                }
                expr_text.push(c);
                pos += 1;
                continue;
            }
            match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' if depth > 0 => depth -= 1,
                '}' => {
                    pos += 1;
                    break;
                }
                '!' if depth == 0 && chars.get(pos + 1) != Some(&'=') => {
                    conversion = chars.get(pos + 1).copied();
                    pos += 2;
                    continue;
                }
                ':' if depth == 0 => {
                    let mut text = String::new();
                    pos += 1;
                    while let Some(&s) = chars.get(pos) {
                        if s == '}' {
                            break;
                        }
                        text.push(s);
                        pos += 1;
                    }
                    spec = Some(text);
                    continue;
                }
                _ => {}
            }
            expr_text.push(c);
            pos += 1;
        }
        if expr_text.trim().is_empty() {
            return Err(ScriptError::syntax(line, "f-string: empty expression not allowed"));
        }
        let tokens = lex(expr_text.trim()).map_err(|e| ScriptError::syntax(line, e.message))?;
        let mut parser = Parser::new(&tokens);
        let expr = parser
            .parse_exprlist()
            .map_err(|e| ScriptError::syntax(line, format!("f-string: {}", e.message)))?;
        parser.eat(&Token::Newline);
        if parser.peek() != &Token::Eof {
            return Err(ScriptError::syntax(line, "f-string: invalid expression"));
        }
        parts.push(FPart::Field {
            expr: Box::new(expr),
            conversion,
            spec,
        });
    }
    if !literal.is_empty() {
        parts.push(FPart::Literal(literal));
    }
    Ok(parts)
}

fn describe(token: &Token) -> String {
    match token {
        Token::Name(w) => format!("'{w}'"),
        Token::Int(n) => format!("'{n}'"),
        Token::Float(f) => format!("'{f}'"),
        Token::Str(_) | Token::FStr(_) => "string literal".to_string(),
        Token::Newline => "end of line".to_string(),
        Token::Indent => "indent".to_string(),
        Token::Dedent => "dedent".to_string(),
        Token::Eof => "end of input".to_string(),
        Token::LParen => "'('".to_string(),
        Token::RParen => "')'".to_string(),
        Token::LBracket => "'['".to_string(),
        Token::RBracket => "']'".to_string(),
        Token::LBrace => "'{'".to_string(),
        Token::RBrace => "'}'".to_string(),
        Token::Comma => "','".to_string(),
        Token::Colon => "':'".to_string(),
        Token::Semicolon => "';'".to_string(),
        Token::Dot => "'.'".to_string(),
        Token::Arrow => "'->'".to_string(),
        Token::At => "'@'".to_string(),
        Token::Assign => "'='".to_string(),
        Token::AugAssign(op) => format!("'{}='", op.symbol()),
        Token::Plus => "'+'".to_string(),
        Token::Minus => "'-'".to_string(),
        Token::Star => "'*'".to_string(),
        Token::DoubleStar => "'**'".to_string(),
        Token::Slash => "'/'".to_string(),
        Token::DoubleSlash => "'//'".to_string(),
        Token::Percent => "'%'".to_string(),
        Token::Eq => "'=='".to_string(),
        Token::NotEq => "'!='".to_string(),
        Token::Lt => "'<'".to_string(),
        Token::LtE => "'<='".to_string(),
        Token::Gt => "'>'".to_string(),
        Token::GtE => "'>='".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(src: &str) -> StmtKind {
        let mut stmts = parse(src).unwrap();
        assert_eq!(stmts.len(), 1, "{stmts:?}");
        stmts.remove(0).kind
    }

    #[test]
    fn parses_pyomo_style_declarations() {
        let src = "import pyomo.environ as pyo\nmodel = pyo.ConcreteModel()\nmodel.x = pyo.Var(model.I, domain=pyo.NonNegativeReals)\n";
        let stmts = parse(src).unwrap();
        assert_eq!(stmts.len(), 3);
        assert_eq!(
            stmts[0].kind,
            StmtKind::Import(vec![Alias {
                name: "pyomo.environ".into(),
                asname: Some("pyo".into())
            }])
        );
        assert_eq!(stmts[2].line, 3);
    }

    #[test]
    fn augmented_assignment_with_name_tuple() {
        match single("prob += 5 * x1 + 7 * x2 <= 100, \"Resource\"\n") {
            StmtKind::AugAssign {
                op: BinOp::Add,
                value: Expr::Tuple(items),
                ..
            } => {
                assert!(matches!(items[0], Expr::Compare(_, _)));
                assert_eq!(items[1], Expr::Constant(Constant::Str("Resource".into())));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn generator_argument_and_conditional_filter() {
        match single("total = sum(c[i] * x[i] for i in items if i != 'b')\n") {
            StmtKind::Assign { value: Expr::Call { args, .. }, .. } => match &args[0] {
                Arg::Positional(Expr::Comprehension {
                    kind: CompKind::Generator,
                    generators,
                    ..
                }) => assert_eq!(generators[0].ifs.len(), 1),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn functions_with_defaults_and_elif() {
        let src = "def rule(m, i=0):\n    if i > 1:\n        return 1\n    elif i < 0:\n        return -1\n    else:\n        return 0\n";
        match single(src) {
            StmtKind::FunctionDef(def) => {
                assert_eq!(def.params.len(), 2);
                assert!(def.params[1].default.is_some());
                assert!(matches!(def.body[0].kind, StmtKind::If { .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fstrings_split_into_fields() {
        match single("print(f\"{name}: {value:.2f} {{ok}}\")\n") {
            StmtKind::Expr(Expr::Call { args, .. }) => match &args[0] {
                Arg::Positional(Expr::JoinedStr(parts)) => {
                    assert_eq!(parts.len(), 4);
                    assert_eq!(parts[3], FPart::Literal(" {ok}".into()));
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn syntax_errors_carry_lines() {
        let err = parse("x = 1\ny = = 2\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SyntaxError);
        assert_eq!(err.line, Some(2));
        assert!(parse("class A:\n    pass\n").is_err());
        assert!(parse("def f(:\n").is_err());
    }

    #[test]
    fn long_unary_chains_are_rejected() {
        let src = format!("x = {}1\n", "-".repeat(200_000));
        let err = parse(&src).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SyntaxError);
        assert!(err.to_string().contains("too deeply nested"), "{err}");

        assert!(parse(&format!("x = {}True\n", "not ".repeat(50_000))).is_err());
        assert!(parse(&format!("x = 2{}\n", " ** -2".repeat(50_000))).is_err());
        // a handful of signs is ordinary code
        assert!(parse("x = - - + -1\ny = not not True\n").is_ok());
    }

    #[test]
    fn long_operator_chains_are_rejected() {
        let err = parse(&format!("x = {}1\n", "1+".repeat(100_000))).unwrap_err();
        assert!(err.to_string().contains("too deeply nested"), "{err}");
        assert!(parse(&format!("x = y{}\n", ".a".repeat(100_000))).is_err());
        assert!(parse(&format!("x = f{}\n", "()".repeat(100_000))).is_err());

        let fits = format!("x = {}1\n", "1 + 2 * ".repeat(MAX_EXPR_DEPTH / 4));
        assert!(parse(&fits).is_ok());
    }

    #[test]
    fn parsed_expressions_stay_within_the_depth_limit() {
        let src = format!("x = ({}1{})\n", "2 * (".repeat(40), ")".repeat(40));
        let stmts = parse(&src).unwrap();
        let StmtKind::Assign { value, .. } = &stmts[0].kind else {
            panic!("expected an assignment");
        };
        assert!(expr_depth(value) <= MAX_EXPR_DEPTH);
    }

    #[test]
    fn deeply_nested_blocks_are_rejected() {
        let src: String = (0..MAX_EXPR_DEPTH + 10)
            .map(|level| format!("{}if True:\n", " ".repeat(level)))
            .collect::<String>()
            + &" ".repeat(MAX_EXPR_DEPTH + 10)
            + "pass\n";
        assert!(parse(&src).is_err());
    }

    #[test]
    fn slices_and_tuple_subscripts() {
        assert!(parse("a = b[1:3]\nc = d[i, j]\ne = f[::2]\n").is_ok());
    }
}
