use std::sync::Arc;

use super::ast::*;
use super::lexer::{tokenize, SyntaxError, Tok, Token};

/// Deepest allowed nesting of expressions and blocks.
pub const MAX_NESTING: usize = 100;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del",
    "elif", "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda",
    "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield",
];

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

pub fn parse(source: &str) -> Result<Program, SyntaxError> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).program()
}

/// Parses a single expression, as found inside an f-string field.
fn parse_expression(source: &str, line: usize) -> Result<Expr, SyntaxError> {
    let tokens = tokenize(source)
        .map_err(|err| SyntaxError::new(format!("f-string: {}", err.message), line))?
        .into_iter()
        .map(|token| Token { line, ..token })
        .collect();
    let mut parser = Parser::new(tokens);
    let expr = parser.testlist()?;
    while parser.check(&Tok::Newline) {
        parser.advance();
    }
    if !parser.check(&Tok::Eof) {
        return Err(SyntaxError::new("f-string: expecting '}'", line));
    }
    Ok(expr)
}

type ParseResult<T> = Result<T, SyntaxError>;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nesting: usize,
    loops: usize,
    functions: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            nesting: 0,
            loops: 0,
            functions: 0,
        }
    }

    // ---- token helpers ----

    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .or_else(|| self.tokens.last())
            .map_or(&Tok::Eof, |t| &t.tok)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> ParseResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", op)))
        }
    }

    fn check_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.check_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> ParseResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", keyword)))
        }
    }

    fn expect_name(&mut self) -> ParseResult<String> {
        match self.peek().clone() {
            Tok::Name(name) if !is_keyword(&name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!("expected a name, found {}", other))),
        }
    }

    fn expect_newline(&mut self) -> ParseResult<()> {
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(())
            }
            Tok::Eof | Tok::Dedent => Ok(()),
            _ => Err(self.error("invalid syntax")),
        }
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.line())
    }

    fn enter(&mut self) -> ParseResult<()> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            return Err(self.error("too many nested blocks or expressions"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.nesting = self.nesting.saturating_sub(1);
    }

    // ---- statements ----

    fn program(&mut self) -> ParseResult<Program> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => {
                    self.advance();
                }
                Tok::Indent => return Err(self.error("unexpected indent")),
                _ => body.extend(self.statement()?),
            }
        }
        Ok(body)
    }

    fn statement(&mut self) -> ParseResult<Vec<Stmt>> {
        let line = self.line();
        let keyword = match self.peek() {
            Tok::Name(name) => name.clone(),
            Tok::Op("@") => return Err(self.error("decorators are not supported")),
            _ => String::new(),
        };
        let kind = match keyword.as_str() {
            "if" => self.if_statement()?,
            "while" => self.while_statement()?,
            "for" => self.for_statement()?,
            "def" => self.function_def()?,
            "try" => self.try_statement()?,
            "class" | "with" | "async" => {
                return Err(self.error(format!("'{}' statements are not supported", keyword)))
            }
            _ => return self.simple_line(),
        };
        Ok(vec![Stmt { line, kind }])
    }

    fn simple_line(&mut self) -> ParseResult<Vec<Stmt>> {
        let mut stmts = vec![self.simple_statement()?];
        while self.eat_op(";") {
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
            stmts.push(self.simple_statement()?);
        }
        self.expect_newline()?;
        Ok(stmts)
    }

    fn block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect_op(":")?;
        if !self.check(&Tok::Newline) {
            return self.simple_line();
        }
        self.advance();
        if !self.check(&Tok::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.advance();

        self.enter()?;
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Dedent => {
                    self.advance();
                    break;
                }
                Tok::Eof => break,
                Tok::Newline => {
                    self.advance();
                }
                Tok::Indent => return Err(self.error("unexpected indent")),
                _ => body.extend(self.statement()?),
            }
        }
        self.leave();
        Ok(body)
    }

    fn if_statement(&mut self) -> ParseResult<StmtKind> {
        self.advance();
        let test = self.test()?;
        let body = self.block()?;
        let orelse = if self.check_keyword("elif") {
            let line = self.line();
            let nested = self.if_statement()?;
            vec![Stmt { line, kind: nested }]
        } else if self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(StmtKind::If { test, body, orelse })
    }

    fn while_statement(&mut self) -> ParseResult<StmtKind> {
        self.advance();
        let test = self.test()?;
        let body = self.loop_body()?;
        let orelse = if self.eat_keyword("else") { self.block()? } else { Vec::new() };
        Ok(StmtKind::While { test, body, orelse })
    }

    fn for_statement(&mut self) -> ParseResult<StmtKind> {
        self.advance();
        let target = self.target_list()?;
        self.expect_keyword("in")?;
        let iter = self.testlist()?;
        let body = self.loop_body()?;
        let orelse = if self.eat_keyword("else") { self.block()? } else { Vec::new() };
        Ok(StmtKind::For {
            target,
            iter,
            body,
            orelse,
        })
    }

    fn loop_body(&mut self) -> ParseResult<Vec<Stmt>> {
        self.loops += 1;
        let body = self.block();
        self.loops -= 1;
        body
    }

    fn function_def(&mut self) -> ParseResult<StmtKind> {
        self.advance();
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.parameters(")", true)?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.test()?;
        }
        let loops = std::mem::take(&mut self.loops);
        self.functions += 1;
        let body = self.block();
        self.functions -= 1;
        self.loops = loops;
        let body = body?;
        Ok(StmtKind::FunctionDef {
            name,
            params: Arc::new(params),
            body: Arc::new(body),
        })
    }

    fn parameters(&mut self, close: &str, annotations: bool) -> ParseResult<Params> {
        let mut params = Params::default();
        let mut keyword_only = false;

        while !self.check_op(close) {
            if self.eat_op("**") {
                params.varkw = Some(self.expect_name()?);
                if annotations && self.eat_op(":") {
                    self.test()?;
                }
            } else if self.eat_op("*") {
                keyword_only = true;
                if !self.check_op(",") && !self.check_op(close) {
                    params.varargs = Some(self.expect_name()?);
                    if annotations && self.eat_op(":") {
                        self.test()?;
                    }
                }
            } else if self.eat_op("/") {
                // Positional-only marker; every parameter is positional here.
            } else {
                let name = self.expect_name()?;
                if annotations && self.eat_op(":") {
                    self.test()?;
                }
                let default = if self.eat_op("=") { Some(self.test()?) } else { None };
                let param = Param { name, default };
                if keyword_only {
                    params.keyword_only.push(param);
                } else {
                    if default_missing_after_default(&params.positional, &param) {
                        return Err(self.error("non-default argument follows default argument"));
                    }
                    params.positional.push(param);
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }

        let mut seen = std::collections::HashSet::new();
        for name in params.names() {
            if !seen.insert(name) {
                return Err(self.error(format!("duplicate argument '{}' in function definition", name)));
            }
        }
        Ok(params)
    }

    fn try_statement(&mut self) -> ParseResult<StmtKind> {
        self.advance();
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.check_keyword("except") {
            let line = self.line();
            self.advance();
            let (kind, name) = if self.check_op(":") {
                (None, None)
            } else {
                let kind = self.test()?;
                let name = if self.eat_keyword("as") { Some(self.expect_name()?) } else { None };
                (Some(kind), name)
            };
            let body = self.block()?;
            handlers.push(ExceptHandler { line, kind, name, body });
        }
        let orelse = if !handlers.is_empty() && self.eat_keyword("else") {
            self.block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_keyword("finally") { self.block()? } else { Vec::new() };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error("expected 'except' or 'finally' block"));
        }
        Ok(StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        })
    }

    fn simple_statement(&mut self) -> ParseResult<Stmt> {
        let line = self.line();
        let keyword = match self.peek() {
            Tok::Name(name) => name.clone(),
            _ => String::new(),
        };

        let kind = match keyword.as_str() {
            "pass" => {
                self.advance();
                StmtKind::Pass
            }
            "break" | "continue" if self.loops == 0 => {
                return Err(self.error(format!("'{}' outside loop", keyword)))
            }
            "return" if self.functions == 0 => return Err(self.error("'return' outside function")),
            "break" => {
                self.advance();
                StmtKind::Break
            }
            "continue" => {
                self.advance();
                StmtKind::Continue
            }
            "return" => {
                self.advance();
                if self.at_statement_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.testlist()?))
                }
            }
            "import" => {
                self.advance();
                let mut names = Vec::new();
                loop {
                    let name = self.dotted_name()?;
                    let alias = if self.eat_keyword("as") { Some(self.expect_name()?) } else { None };
                    names.push(ImportAlias { name, alias });
                    if !self.eat_op(",") {
                        break;
                    }
                }
                StmtKind::Import(names)
            }
            "from" => self.import_from()?,
            "global" | "nonlocal" => {
                self.advance();
                let mut names = vec![self.expect_name()?];
                while self.eat_op(",") {
                    names.push(self.expect_name()?);
                }
                if keyword == "global" {
                    StmtKind::Global(names)
                } else {
                    StmtKind::Nonlocal(names)
                }
            }
            "del" => {
                self.advance();
                let mut targets = vec![self.bitor()?];
                while self.eat_op(",") {
                    if self.at_statement_end() {
                        break;
                    }
                    targets.push(self.bitor()?);
                }
                for target in &targets {
                    self.check_target(target)?;
                }
                StmtKind::Delete(targets)
            }
            "assert" => {
                self.advance();
                let test = self.test()?;
                let message = if self.eat_op(",") { Some(self.test()?) } else { None };
                StmtKind::Assert { test, message }
            }
            "raise" => {
                self.advance();
                if self.at_statement_end() {
                    StmtKind::Raise(None)
                } else {
                    let exc = self.test()?;
                    if self.eat_keyword("from") {
                        self.test()?;
                    }
                    StmtKind::Raise(Some(exc))
                }
            }
            "yield" | "await" => return Err(self.error(format!("'{}' is not supported", keyword))),
            _ => self.expression_statement()?,
        };
        Ok(Stmt { line, kind })
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent) || self.check_op(";")
    }

    fn dotted_name(&mut self) -> ParseResult<String> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn import_from(&mut self) -> ParseResult<StmtKind> {
        self.advance();
        if self.check_op(".") || self.check_op("...") {
            return Err(self.error("relative imports are not supported"));
        }
        let module = self.dotted_name()?;
        self.expect_keyword("import")?;

        let mut names = Vec::new();
        if self.eat_op("*") {
            names.push(ImportAlias {
                name: "*".to_string(),
                alias: None,
            });
            return Ok(StmtKind::ImportFrom { module, names });
        }

        let parenthesized = self.eat_op("(");
        loop {
            if parenthesized && self.check_op(")") {
                break;
            }
            let name = self.expect_name()?;
            let alias = if self.eat_keyword("as") { Some(self.expect_name()?) } else { None };
            names.push(ImportAlias { name, alias });
            if !self.eat_op(",") {
                break;
            }
        }
        if parenthesized {
            self.expect_op(")")?;
        }
        if names.is_empty() {
            return Err(self.error("expected a name to import"));
        }
        Ok(StmtKind::ImportFrom { module, names })
    }

    fn expression_statement(&mut self) -> ParseResult<StmtKind> {
        let first = self.testlist_star()?;

        if self.eat_op(":") {
            // Annotated assignment; the annotation is ignored.
            self.check_target(&first)?;
            self.test()?;
            if self.eat_op("=") {
                let value = self.testlist_star()?;
                return Ok(StmtKind::Assign {
                    targets: vec![first],
                    value,
                });
            }
            return Ok(StmtKind::Pass);
        }

        if let Some(op) = self.augmented_operator() {
            self.advance();
            if !matches!(first, Expr::Name(_) | Expr::Attribute { .. } | Expr::Subscript { .. }) {
                return Err(self.error("illegal expression for augmented assignment"));
            }
            let value = self.testlist()?;
            return Ok(StmtKind::AugAssign {
                target: first,
                op,
                value,
            });
        }

        if self.check_op("=") {
            let mut targets = vec![first];
            let mut value = None;
            while self.eat_op("=") {
                let next = self.testlist_star()?;
                if let Some(previous) = value.replace(next) {
                    targets.push(previous);
                }
            }
            for target in &targets {
                self.check_target(target)?;
            }
            let value = value.ok_or_else(|| self.error("invalid syntax"))?;
            return Ok(StmtKind::Assign { targets, value });
        }

        if let Expr::Starred(_) = first {
            return Err(self.error("can't use starred expression here"));
        }
        Ok(StmtKind::Expr(first))
    }

    fn augmented_operator(&self) -> Option<BinOp> {
        let Tok::Op(op) = self.peek() else { return None };
        Some(match *op {
            "+=" => BinOp::Add,
            "-=" => BinOp::Sub,
            "*=" => BinOp::Mul,
            "/=" => BinOp::Div,
            "//=" => BinOp::FloorDiv,
            "%=" => BinOp::Mod,
            "**=" => BinOp::Pow,
            "&=" => BinOp::BitAnd,
            "|=" => BinOp::BitOr,
            "^=" => BinOp::BitXor,
            "<<=" => BinOp::LShift,
            ">>=" => BinOp::RShift,
            _ => return None,
        })
    }

    fn check_target(&self, target: &Expr) -> ParseResult<()> {
        match target {
            Expr::Name(name) if is_keyword(name) => Err(self.error(format!("cannot assign to {}", name))),
            Expr::Name(_) | Expr::Attribute { .. } | Expr::Subscript { .. } => Ok(()),
            Expr::Tuple(items) | Expr::List(items) => {
                let starred = items.iter().filter(|i| matches!(i, Expr::Starred(_))).count();
                if starred > 1 {
                    return Err(self.error("multiple starred expressions in assignment"));
                }
                items.iter().try_for_each(|item| self.check_target(item))
            }
            Expr::Starred(inner) => self.check_target(inner),
            Expr::Call { .. } => Err(self.error("cannot assign to function call")),
            Expr::Constant(_) => Err(self.error("cannot assign to literal")),
            _ => Err(self.error("cannot assign to expression")),
        }
    }

    /// Loop and comprehension targets: stops before `in`.
    fn target_list(&mut self) -> ParseResult<Expr> {
        let mut items = vec![self.target_item()?];
        let mut trailing_comma = false;
        while self.eat_op(",") {
            trailing_comma = true;
            if self.check_keyword("in") {
                break;
            }
            items.push(self.target_item()?);
            trailing_comma = false;
        }
        let target = if items.len() == 1 && !trailing_comma {
            items.remove(0)
        } else {
            Expr::Tuple(items)
        };
        self.check_target(&target)?;
        Ok(target)
    }

    fn target_item(&mut self) -> ParseResult<Expr> {
        if self.eat_op("*") {
            return Ok(Expr::Starred(Box::new(self.bitor()?)));
        }
        self.bitor()
    }

    // ---- expressions ----

    fn testlist(&mut self) -> ParseResult<Expr> {
        let first = self.test()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() {
                break;
            }
            items.push(self.test()?);
        }
        Ok(Expr::Tuple(items))
    }

    /// Like `testlist` but allows `*name` items, as on either side of `=`.
    fn testlist_star(&mut self) -> ParseResult<Expr> {
        let first = self.test_or_star()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.starts_expression() && !self.check_op("*") {
                break;
            }
            items.push(self.test_or_star()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn test_or_star(&mut self) -> ParseResult<Expr> {
        if self.eat_op("*") {
            return Ok(Expr::Starred(Box::new(self.bitor()?)));
        }
        self.test()
    }

    fn starts_expression(&self) -> bool {
        match self.peek() {
            Tok::Name(name) => {
                !is_keyword(name) || matches!(name.as_str(), "None" | "True" | "False" | "not" | "lambda")
            }
            Tok::Int(_) | Tok::BigInt(_) | Tok::Float(_) | Tok::Str(_) | Tok::FStr(_) => true,
            Tok::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+" | "~"),
            _ => false,
        }
    }

    fn test(&mut self) -> ParseResult<Expr> {
        self.enter()?;
        let result = self.test_inner();
        self.leave();
        result
    }

    fn test_inner(&mut self) -> ParseResult<Expr> {
        if self.eat_keyword("lambda") {
            let params = self.parameters(":", false)?;
            self.expect_op(":")?;
            let body = self.test()?;
            return Ok(Expr::Lambda {
                params: Arc::new(params),
                body: Arc::new(body),
            });
        }

        let body = self.or_test()?;
        if self.eat_keyword("if") {
            let test = self.or_test()?;
            self.expect_keyword("else")?;
            let orelse = self.test()?;
            return Ok(Expr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn or_test(&mut self) -> ParseResult<Expr> {
        let mut left = self.and_test()?;
        while self.eat_keyword("or") {
            let right = self.and_test()?;
            left = Expr::BoolOp {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_test(&mut self) -> ParseResult<Expr> {
        let mut left = self.not_test()?;
        while self.eat_keyword("and") {
            let right = self.not_test()?;
            left = Expr::BoolOp {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn not_test(&mut self) -> ParseResult<Expr> {
        if self.eat_keyword("not") {
            self.enter()?;
            let operand = self.not_test();
            self.leave();
            return Ok(Expr::UnaryOp {
                op: UnaryOp::Not,
                operand: Box::new(operand?),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let left = self.bitor()?;
        let mut comparisons = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op("==") => CmpOp::Eq,
                Tok::Op("!=") => CmpOp::NotEq,
                Tok::Op("<") => CmpOp::Lt,
                Tok::Op("<=") => CmpOp::LtE,
                Tok::Op(">") => CmpOp::Gt,
                Tok::Op(">=") => CmpOp::GtE,
                Tok::Name(n) if n == "in" => CmpOp::In,
                Tok::Name(n) if n == "is" => {
                    if matches!(self.peek_at(1), Tok::Name(next) if next == "not") {
                        self.advance();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                Tok::Name(n) if n == "not" && matches!(self.peek_at(1), Tok::Name(next) if next == "in") => {
                    self.advance();
                    CmpOp::NotIn
                }
                _ => break,
            };
            self.advance();
            comparisons.push((op, self.bitor()?));
        }
        if comparisons.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                comparisons,
            })
        }
    }

    fn binary_level(
        &mut self,
        operators: &[(&str, BinOp)],
        next: fn(&mut Self) -> ParseResult<Expr>,
    ) -> ParseResult<Expr> {
        let mut left = next(self)?;
        'outer: loop {
            for (symbol, op) in operators {
                if self.eat_op(symbol) {
                    let right = next(self)?;
                    left = Expr::BinOp {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn bitor(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("|", BinOp::BitOr)], Self::bitxor)
    }

    fn bitxor(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("^", BinOp::BitXor)], Self::bitand)
    }

    fn bitand(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("&", BinOp::BitAnd)], Self::shift)
    }

    fn shift(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("<<", BinOp::LShift), (">>", BinOp::RShift)], Self::arith)
    }

    fn arith(&mut self) -> ParseResult<Expr> {
        self.binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::term)
    }

    fn term(&mut self) -> ParseResult<Expr> {
        self.binary_level(
            &[
                ("*", BinOp::Mul),
                ("/", BinOp::Div),
                ("//", BinOp::FloorDiv),
                ("%", BinOp::Mod),
            ],
            Self::factor,
        )
    }

    fn factor(&mut self) -> ParseResult<Expr> {
        let op = match self.peek() {
            Tok::Op("-") => Some(UnaryOp::Neg),
            Tok::Op("+") => Some(UnaryOp::Pos),
            Tok::Op("~") => Some(UnaryOp::Invert),
            _ => None,
        };
        let Some(op) = op else {
            return self.power();
        };
        self.advance();
        self.enter()?;
        let operand = self.factor();
        self.leave();
        let operand = operand?;

        // Fold negative literals so `-9223372036854775808` style values and
        // `-1` stay constants.
        if op == UnaryOp::Neg {
            match operand {
                Expr::Constant(Constant::Int(i)) => {
                    if let Some(negated) = i.checked_neg() {
                        return Ok(Expr::Constant(Constant::Int(negated)));
                    }
                    return Ok(Expr::UnaryOp {
                        op,
                        operand: Box::new(Expr::Constant(Constant::Int(i))),
                    });
                }
                Expr::Constant(Constant::Float(f)) => return Ok(Expr::Constant(Constant::Float(-f))),
                other => {
                    return Ok(Expr::UnaryOp {
                        op,
                        operand: Box::new(other),
                    })
                }
            }
        }
        Ok(Expr::UnaryOp {
            op,
            operand: Box::new(operand),
        })
    }

    fn power(&mut self) -> ParseResult<Expr> {
        let base = self.primary()?;
        if self.eat_op("**") {
            self.enter()?;
            let exponent = self.factor();
            self.leave();
            return Ok(Expr::BinOp {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent?),
            });
        }
        Ok(base)
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                let args = self.call_arguments()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.eat_op("[") {
                let index = self.subscript()?;
                self.expect_op("]")?;
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_op(".") {
                let attr = match self.advance() {
                    Tok::Name(name) => name,
                    other => return Err(self.error(format!("expected attribute name, found {}", other))),
                };
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn call_arguments(&mut self) -> ParseResult<Vec<CallArg>> {
        let mut args = Vec::new();
        while !self.check_op(")") {
            if self.eat_op("**") {
                args.push(CallArg::DoubleStar(self.test()?));
            } else if self.eat_op("*") {
                args.push(CallArg::Star(self.test()?));
            } else if matches!(self.peek(), Tok::Name(n) if !is_keyword(n)) && matches!(self.peek_at(1), Tok::Op("=")) {
                let name = self.expect_name()?;
                self.advance();
                args.push(CallArg::Keyword(name, self.test()?));
            } else {
                let value = self.test()?;
                if self.check_keyword("for") {
                    let generators = self.comprehension_clauses()?;
                    args.push(CallArg::Positional(Expr::ListComp {
                        element: Box::new(value),
                        generators,
                    }));
                } else {
                    args.push(CallArg::Positional(value));
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;

        let mut seen_keyword = false;
        for arg in &args {
            match arg {
                CallArg::Keyword(..) | CallArg::DoubleStar(_) => seen_keyword = true,
                CallArg::Positional(_) if seen_keyword => {
                    return Err(self.error("positional argument follows keyword argument"))
                }
                _ => {}
            }
        }
        Ok(args)
    }

    fn subscript(&mut self) -> ParseResult<Expr> {
        let first = self.slice_item()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("]") {
                break;
            }
            items.push(self.slice_item()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn slice_item(&mut self) -> ParseResult<Expr> {
        let lower = if self.check_op(":") { None } else { Some(self.test()?) };
        if !self.eat_op(":") {
            return lower.ok_or_else(|| self.error("invalid syntax"));
        }
        let upper = if self.check_op(":") || self.check_op("]") || self.check_op(",") {
            None
        } else {
            Some(Box::new(self.test()?))
        };
        let step = if self.eat_op(":") && !self.check_op("]") && !self.check_op(",") {
            Some(Box::new(self.test()?))
        } else {
            None
        };
        Ok(Expr::Slice {
            lower: lower.map(Box::new),
            upper,
            step,
        })
    }

    fn comprehension_clauses(&mut self) -> ParseResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        while self.eat_keyword("for") {
            let target = self.target_list()?;
            self.expect_keyword("in")?;
            let iter = self.or_test()?;
            let mut conditions = Vec::new();
            while self.eat_keyword("if") {
                conditions.push(self.or_test()?);
            }
            generators.push(Comprehension {
                target,
                iter,
                conditions,
            });
        }
        Ok(generators)
    }

    fn atom(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        match self.peek().clone() {
            Tok::Name(name) => {
                self.advance();
                match name.as_str() {
                    "None" => Ok(Expr::Constant(Constant::None)),
                    "True" => Ok(Expr::Constant(Constant::Bool(true))),
                    "False" => Ok(Expr::Constant(Constant::Bool(false))),
                    keyword if is_keyword(keyword) => Err(SyntaxError::new("invalid syntax", line)),
                    _ => Ok(Expr::Name(name)),
                }
            }
            Tok::Int(i) => {
                self.advance();
                Ok(Expr::Constant(Constant::Int(i)))
            }
            Tok::BigInt(i) => {
                self.advance();
                Ok(Expr::Constant(Constant::BigInt(i)))
            }
            Tok::Float(f) => {
                self.advance();
                Ok(Expr::Constant(Constant::Float(f)))
            }
            Tok::Str(_) | Tok::FStr(_) => self.strings(),
            Tok::Op("(") => {
                self.advance();
                self.enter()?;
                let result = self.parenthesized();
                self.leave();
                result
            }
            Tok::Op("[") => {
                self.advance();
                self.enter()?;
                let result = self.list_display();
                self.leave();
                result
            }
            Tok::Op("{") => {
                self.advance();
                self.enter()?;
                let result = self.dict_display();
                self.leave();
                result
            }
            Tok::Indent => Err(SyntaxError::new("unexpected indent", line)),
            other => Err(SyntaxError::new(
                format!("invalid syntax (unexpected {})", other),
                line,
            )),
        }
    }

    fn parenthesized(&mut self) -> ParseResult<Expr> {
        if self.eat_op(")") {
            return Ok(Expr::Tuple(Vec::new()));
        }
        let first = self.test_or_star()?;
        if self.check_keyword("for") {
            let generators = self.comprehension_clauses()?;
            self.expect_op(")")?;
            return Ok(Expr::ListComp {
                element: Box::new(first),
                generators,
            });
        }
        if self.eat_op(")") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op(")") {
                break;
            }
            items.push(self.test_or_star()?);
        }
        self.expect_op(")")?;
        Ok(Expr::Tuple(items))
    }

    fn list_display(&mut self) -> ParseResult<Expr> {
        if self.eat_op("]") {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.test_or_star()?;
        if self.check_keyword("for") {
            let generators = self.comprehension_clauses()?;
            self.expect_op("]")?;
            return Ok(Expr::ListComp {
                element: Box::new(first),
                generators,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("]") {
                break;
            }
            items.push(self.test_or_star()?);
        }
        self.expect_op("]")?;
        Ok(Expr::List(items))
    }

    fn dict_display(&mut self) -> ParseResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        let key = self.test_or_star()?;
        if matches!(key, Expr::Starred(_)) || !self.eat_op(":") {
            return self.set_display(key);
        }
        let value = self.test()?;
        if self.check_keyword("for") {
            let generators = self.comprehension_clauses()?;
            self.expect_op("}")?;
            return Ok(Expr::DictComp {
                key: Box::new(key),
                value: Box::new(value),
                generators,
            });
        }
        let mut pairs = vec![(key, value)];
        while self.eat_op(",") {
            if self.check_op("}") {
                break;
            }
            let key = self.test()?;
            self.expect_op(":")?;
            pairs.push((key, self.test()?));
        }
        self.expect_op("}")?;
        Ok(Expr::Dict(pairs))
    }

    fn set_display(&mut self, first: Expr) -> ParseResult<Expr> {
        if self.check_keyword("for") {
            if matches!(first, Expr::Starred(_)) {
                return Err(self.error("iterable unpacking cannot be used in comprehension"));
            }
            let generators = self.comprehension_clauses()?;
            self.expect_op("}")?;
            return Ok(Expr::SetComp {
                element: Box::new(first),
                generators,
            });
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("}") {
                break;
            }
            items.push(self.test_or_star()?);
        }
        self.expect_op("}")?;
        Ok(Expr::Set(items))
    }

    /// Adjacent literals concatenate; any f-string turns the whole run into
    /// one f-string.
    fn strings(&mut self) -> ParseResult<Expr> {
        let line = self.line();
        let mut parts: Vec<FStringPart> = Vec::new();
        let mut formatted = false;
        loop {
            match self.peek().clone() {
                Tok::Str(text) => {
                    self.advance();
                    push_literal(&mut parts, &text);
                }
                Tok::FStr(text) => {
                    self.advance();
                    formatted = true;
                    for part in split_fstring(&text, line)? {
                        match part {
                            FStringPart::Literal(text) => push_literal(&mut parts, &text),
                            field => parts.push(field),
                        }
                    }
                }
                _ => break,
            }
        }

        if formatted {
            return Ok(Expr::FString(parts));
        }
        let text = match parts.pop() {
            Some(FStringPart::Literal(text)) => text,
            _ => String::new(),
        };
        Ok(Expr::Constant(Constant::Str(text)))
    }
}

fn default_missing_after_default(previous: &[Param], param: &Param) -> bool {
    param.default.is_none() && previous.iter().any(|p| p.default.is_some())
}

fn push_literal(parts: &mut Vec<FStringPart>, text: &str) {
    if let Some(FStringPart::Literal(existing)) = parts.last_mut() {
        existing.push_str(text);
    } else {
        parts.push(FStringPart::Literal(text.to_string()));
    }
}

/// Splits an f-string body into literal text and `{expr!c:spec}` fields.
fn split_fstring(text: &str, line: usize) -> ParseResult<Vec<FStringPart>> {
    let chars: Vec<char> = text.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                literal.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                literal.push('}');
                i += 2;
            }
            '}' => return Err(SyntaxError::new("f-string: single '}' is not allowed", line)),
            '{' => {
                if !literal.is_empty() {
                    parts.push(FStringPart::Literal(std::mem::take(&mut literal)));
                }
                let (field, next) = fstring_field(&chars, i + 1, line)?;
                parts.push(field);
                i = next;
            }
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }
    if !literal.is_empty() {
        parts.push(FStringPart::Literal(literal));
    }
    Ok(parts)
}

/// Parses one replacement field starting just after `{`. Returns the field
/// and the index just past its closing `}`.
fn fstring_field(chars: &[char], start: usize, line: usize) -> ParseResult<(FStringPart, usize)> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut i = start;
    let mut expr_end = None;
    let mut conversion = None;

    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            '}' if depth > 0 => depth -= 1,
            '!' if depth == 0 && chars.get(i + 1) != Some(&'=') => {
                expr_end = Some(i);
                conversion = chars.get(i + 1).copied();
                i += 2;
                break;
            }
            ':' | '}' if depth == 0 => {
                expr_end = Some(i);
                break;
            }
            _ => {}
        }
        i += 1;
    }

    let expr_end = expr_end.ok_or_else(|| SyntaxError::new("f-string: expecting '}'", line))?;
    let source: String = chars[start..expr_end].iter().collect();
    if source.trim().is_empty() {
        return Err(SyntaxError::new("f-string: empty expression not allowed", line));
    }
    if let Some(c) = conversion {
        if !matches!(c, 's' | 'r' | 'a') {
            return Err(SyntaxError::new("f-string: invalid conversion character", line));
        }
    }

    let mut spec = String::new();
    if chars.get(i) == Some(&':') {
        i += 1;
        let mut nested = 0usize;
        while i < chars.len() {
            match chars[i] {
                '{' => nested += 1,
                '}' if nested > 0 => nested -= 1,
                '}' => break,
                _ => {}
            }
            spec.push(chars[i]);
            i += 1;
        }
    }
    if chars.get(i) != Some(&'}') {
        return Err(SyntaxError::new("f-string: expecting '}'", line));
    }

    let expr = parse_expression(source.trim(), line)?;
    Ok((
        FStringPart::Field {
            expr: Box::new(expr),
            conversion,
            spec,
        },
        i + 1,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(source: &str) -> StmtKind {
        let mut program = parse(source).unwrap();
        assert_eq!(program.len(), 1, "{:?}", program);
        program.remove(0).kind
    }

    #[test]
    fn test_precedence() {
        let StmtKind::Expr(expr) = single("1 + 2 * 3 ** 2") else { panic!() };
        let Expr::BinOp { op: BinOp::Add, right, .. } = expr else { panic!("{:?}", expr) };
        let Expr::BinOp { op: BinOp::Mul, right: power, .. } = *right else { panic!() };
        assert!(matches!(*power, Expr::BinOp { op: BinOp::Pow, .. }));
    }

    #[test]
    fn test_tuple_assignment_and_chain() {
        match single("a, b = b, a") {
            StmtKind::Assign { targets, value } => {
                assert!(matches!(&targets[0], Expr::Tuple(items) if items.len() == 2));
                assert!(matches!(value, Expr::Tuple(_)));
            }
            other => panic!("{:?}", other),
        }
        match single("x = y = 0") {
            StmtKind::Assign { targets, .. } => assert_eq!(targets.len(), 2),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_compound_statements() {
        let program = parse(
            "def fib(n):\n    if n <= 1:\n        return n\n    return fib(n-1) + fib(n-2)\n\nfor i in range(3):\n    print(fib(i))\nelse:\n    pass\n",
        )
        .unwrap();
        assert_eq!(program.len(), 2);
        assert!(matches!(program[0].kind, StmtKind::FunctionDef { .. }));
        assert_eq!(program[1].line, 6);
    }

    #[test]
    fn test_comprehension_and_generator_argument() {
        match single("total = sum(x * x for x in range(10) if x % 2)") {
            StmtKind::Assign { value: Expr::Call { args, .. }, .. } => {
                assert!(matches!(&args[0], CallArg::Positional(Expr::ListComp { .. })));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_set_displays() {
        assert!(matches!(single("{1, 2, *rest}"), StmtKind::Expr(Expr::Set(items)) if items.len() == 3));
        assert!(matches!(single("{x for x in y}"), StmtKind::Expr(Expr::SetComp { .. })));
        assert!(matches!(single("{}"), StmtKind::Expr(Expr::Dict(pairs)) if pairs.is_empty()));
        assert!(matches!(single("{1: 2}"), StmtKind::Expr(Expr::Dict(_))));
        assert!(parse("{*a for a in b}").is_err());
    }

    #[test]
    fn test_fstring_fields() {
        let StmtKind::Expr(Expr::FString(parts)) = single("f'Result: {result!r:>10} {{x}}'") else {
            panic!()
        };
        assert_eq!(parts[0], FStringPart::Literal("Result: ".into()));
        match &parts[1] {
            FStringPart::Field { conversion, spec, .. } => {
                assert_eq!(*conversion, Some('r'));
                assert_eq!(spec, ">10");
            }
            other => panic!("{:?}", other),
        }
        assert_eq!(parts[2], FStringPart::Literal(" {x}".into()));
    }

    #[test]
    fn test_imports() {
        match single("from math import sqrt as root, pi") {
            StmtKind::ImportFrom { module, names } => {
                assert_eq!(module, "math");
                assert_eq!(names[0].alias.as_deref(), Some("root"));
            }
            other => panic!("{:?}", other),
        }
        assert!(matches!(single("import os.path"), StmtKind::Import(names) if names[0].name == "os.path"));
    }

    #[test]
    fn test_syntax_errors() {
        let err = parse("x = (1,\n").unwrap_err();
        assert!(err.message.contains("expected"), "{}", err.message);
        let err = parse("def f(:\n    pass\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(parse("if True:\nprint(1)\n").unwrap_err().message.contains("indented block"));
        assert!(parse("class A:\n    pass\n").is_err());
        assert!(parse("1 = x").is_err());
        assert_eq!(parse("x = 1\nbreak\n").unwrap_err().message, "'break' outside loop");
        assert_eq!(parse("return 5").unwrap_err().message, "'return' outside function");
        assert!(parse("while True:\n    def f():\n        break\n").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}1{}", "(".repeat(MAX_NESTING + 5), ")".repeat(MAX_NESTING + 5));
        assert!(parse(&deep).unwrap_err().message.contains("nested"));
    }
}
