use crate::ast::*;
use crate::lexer::Token;

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    eof: Span,
    /// Blocks and expressions currently open.
    depth: usize,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ParseError {
    pub position: usize,
    pub span: Span,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

const MAX_ERRORS: usize = 20;

/// Deepest nesting of blocks and expressions before parsing gives up.
pub const MAX_NESTING: usize = 128;

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>) -> Self {
        let end = tokens.last().map(|(_, s)| s.end).unwrap_or(0);
        Parser { tokens, pos: 0, eof: Span { start: end, end }, depth: 0 }
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("Too much nesting."));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens.get(self.pos).map(|(_, s)| *s).unwrap_or(self.eof)
    }

    fn check(&self, expected: &Token) -> bool {
        self.peek() == Some(expected)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    /// Consume `expected` or fail with the caller's exact message.
    fn expect(&mut self, expected: &Token, message: &str) -> Result<Span> {
        if self.check(expected) {
            let span = self.peek_span();
            self.advance();
            Ok(span)
        } else {
            Err(self.error(message))
        }
    }

    fn expect_ident(&mut self, message: &str) -> Result<String> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(message)),
        }
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError {
            position: self.pos,
            span: self.peek_span(),
            message: message.to_string(),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Span of the previously consumed token.
    fn prev_span(&self) -> Span {
        if self.pos > 0 {
            self.tokens[self.pos - 1].1
        } else {
            Span::UNKNOWN
        }
    }

    fn spanned<T>(&self, node: T, start: Span) -> Spanned<T> {
        Spanned::new(node, start.merge(self.prev_span()))
    }

    // ---- Top-level parsing ----

    pub fn parse_program(&mut self) -> (Program, Vec<ParseError>) {
        let mut statements = Vec::new();
        let mut errors: Vec<ParseError> = Vec::new();

        while !self.at_end() {
            if errors.len() >= MAX_ERRORS {
                break;
            }
            let before = self.pos;
            match self.statement() {
                Ok(stmt) => statements.push(stmt),
                Err(e) => {
                    errors.push(e);
                    self.synchronize();
                    if self.pos == before {
                        self.advance();
                    }
                }
            }
        }

        (Program { statements }, errors)
    }

    /// Skip to the next statement boundary: just past a `;` or an unmatched `}`,
    /// or just before a statement keyword. Nested `{…}` are skipped whole.
    fn synchronize(&mut self) {
        let mut depth: usize = 0;
        while let Some(tok) = self.peek() {
            match tok {
                Token::LBrace => depth += 1,
                Token::RBrace if depth == 0 => {
                    self.advance();
                    return;
                }
                Token::RBrace => depth -= 1,
                Token::Semi if depth == 0 => {
                    self.advance();
                    return;
                }
                Token::Let | Token::Fn | Token::If | Token::While | Token::For
                | Token::Return | Token::Print | Token::Struct | Token::Impl
                | Token::Assert | Token::Use | Token::At
                    if depth == 0 => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- Statements ----

    fn statement(&mut self) -> Result<Stmt> {
        let start = self.peek_span();
        let kind = match self.peek() {
            Some(Token::Let) => {
                let (name, value) = self.let_declaration("Expected ';' after 'let' statement.")?;
                StmtKind::Let { name, value }
            }
            Some(Token::Print) => {
                self.advance();
                let expr = self.expression()?;
                self.expect(&Token::Semi, "Expected ';' after 'print' statement.")?;
                StmtKind::Print(expr)
            }
            Some(Token::Assert) => {
                self.advance();
                let expr = self.expression()?;
                self.expect(&Token::Semi, "Expected ';' after 'assert' statement.")?;
                StmtKind::Assert(expr)
            }
            Some(Token::Return) => {
                self.advance();
                let value = if self.check(&Token::Semi) { None } else { Some(self.expression()?) };
                self.expect(&Token::Semi, "Expected ';' after 'return' statement.")?;
                StmtKind::Return(value)
            }
            Some(Token::Break) => {
                self.advance();
                self.expect(&Token::Semi, "Expected ';' after 'break' statement.")?;
                StmtKind::Break { label: None }
            }
            Some(Token::Continue) => {
                self.advance();
                self.expect(&Token::Semi, "Expected ';' after 'continue' statement.")?;
                StmtKind::Continue { label: None }
            }
            Some(Token::LBrace) => StmtKind::Block(self.block()?),
            Some(Token::If) => self.if_statement()?,
            Some(Token::While) => self.while_statement()?,
            Some(Token::For) => self.for_statement()?,
            Some(Token::Fn) => StmtKind::Fn(self.fn_declaration()?),
            Some(Token::At) => {
                self.advance();
                let decorator = self.expect_ident("Expected identifier after '@'.")?;
                if !self.check(&Token::Fn) {
                    return Err(self.error("Expected 'fn' token."));
                }
                StmtKind::Decorated { decorator, func: self.fn_declaration()? }
            }
            Some(Token::Struct) => self.struct_declaration()?,
            Some(Token::Impl) => self.impl_declaration()?,
            Some(Token::Use) => {
                self.advance();
                let path = match self.peek() {
                    Some(Token::Str(path)) => path.clone(),
                    _ => return Err(self.error("Module path should be a string")),
                };
                self.advance();
                self.expect(&Token::Semi, "Expected ';' after 'use' statement.")?;
                StmtKind::Use { path }
            }
            _ => {
                let expr = self.expression()?;
                self.expect(&Token::Semi, "Expected ';' after expression statement.")?;
                StmtKind::Expr(expr)
            }
        };
        Ok(self.spanned(kind, start))
    }

    /// `let name = expr` followed by `;`, reporting `terminator` when the `;` is missing.
    fn let_declaration(&mut self, terminator: &str) -> Result<(String, Expr)> {
        self.advance();
        let name = self.expect_ident("Expected identifier after 'let'.")?;
        self.expect(&Token::Assign, "Expected '=' after variable name in 'let' statement.")?;
        let value = self.expression()?;
        self.expect(&Token::Semi, terminator)?;
        Ok((name, value))
    }

    /// `{ stmt* }` as the body of a control-flow or function statement.
    fn block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(&Token::LBrace, "Expected '{' token.")?;
        let body = self.nested(|p| {
            let mut body = Vec::new();
            while !p.check(&Token::RBrace) && !p.at_end() {
                body.push(p.statement()?);
            }
            Ok(body)
        })?;
        self.expect(&Token::RBrace, "Expected '}' at the end of the block.")?;
        Ok(body)
    }

    fn if_statement(&mut self) -> Result<StmtKind> {
        self.advance();
        self.expect(&Token::LParen, "Expected '(' after 'if'.")?;
        let condition = self.expression()?;
        self.expect(&Token::RParen, "Expected ')' after 'if' condition.")?;
        let then_branch = self.block()?;
        let else_branch = if self.check(&Token::Else) {
            self.advance();
            if self.check(&Token::If) {
                Some(vec![self.statement()?])
            } else {
                Some(self.block()?)
            }
        } else {
            None
        };
        Ok(StmtKind::If { condition, then_branch, else_branch })
    }

    fn while_statement(&mut self) -> Result<StmtKind> {
        self.advance();
        self.expect(&Token::LParen, "Expected '(' after 'while'.")?;
        let condition = self.expression()?;
        self.expect(&Token::RParen, "Expected ')' after 'while' condition.")?;
        let body = self.block()?;
        Ok(StmtKind::While { label: None, condition, body })
    }

    /// `for (let i = 0; cond; advance) { ... }`
    fn for_statement(&mut self) -> Result<StmtKind> {
        self.advance();
        self.expect(&Token::LParen, "Expected '(' after 'for'.")?;
        if !self.check(&Token::Let) {
            return Err(self.error("Expected 'let' after '(' in 'for' initializer."));
        }
        let init_start = self.peek_span();
        let (name, value) = self.let_declaration("Expected ';' after 'for' initializer.")?;
        let init = Box::new(self.spanned(StmtKind::Let { name, value }, init_start));
        let condition = self.expression()?;
        self.expect(&Token::Semi, "Expected ';' after 'for' condition.")?;
        let advance = self.expression()?;
        self.expect(&Token::RParen, "Expected ')' after 'for' advancement.")?;
        let body = self.block()?;
        Ok(StmtKind::For { label: None, init, condition, advance, body })
    }

    fn fn_declaration(&mut self) -> Result<FnDecl> {
        self.advance();
        let name = self.expect_ident("Expected identifier after 'fn'.")?;
        self.expect(&Token::LParen, "Expected '(' after identifier in 'fn' statement.")?;
        let mut params = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                params.push(self.expect_ident("Expected parameter name after '(' in 'fn' statement.")?);
                if !self.check(&Token::Comma) {
                    break;
                }
                self.advance();
            }
        }
        self.expect(&Token::RParen, "Expected ')' after the parameter list in 'fn' statement.")?;
        let body = self.block()?;
        Ok(FnDecl { name, params, body })
    }

    /// `struct Name { a; b; }`
    fn struct_declaration(&mut self) -> Result<StmtKind> {
        self.advance();
        let name = self.expect_ident("Expected identifier after 'struct'.")?;
        self.expect(&Token::LBrace, "Expected '{' after identifier in 'struct' stmt.")?;
        let mut properties = Vec::new();
        while !self.check(&Token::RBrace) {
            properties.push(self.expect_ident("Expected property name.")?);
            self.expect(&Token::Semi, "Expected semicolon after property name.")?;
        }
        self.advance();
        Ok(StmtKind::Struct { name, properties })
    }

    /// `impl Name { fn method(self, ...) { ... } ... }`
    fn impl_declaration(&mut self) -> Result<StmtKind> {
        self.advance();
        let name = self.expect_ident("Expected identifier after 'impl'.")?;
        self.expect(&Token::LBrace, "Expected '{' after identifier in 'impl' statement.")?;
        let mut methods = Vec::new();
        while !self.check(&Token::RBrace) {
            if !self.check(&Token::Fn) {
                return Err(self.error("Expected 'fn' token."));
            }
            methods.push(self.fn_declaration()?);
        }
        self.advance();
        Ok(StmtKind::Impl { name, methods })
    }

    // ---- Expressions ----

    pub fn expression(&mut self) -> Result<Expr> {
        self.nested(Self::assignment)
    }

    fn assignment_op(&self) -> Option<AssignOp> {
        let op = match self.peek()? {
            Token::Assign => return Some(AssignOp::Plain),
            Token::PlusAssign => BinOp::Add,
            Token::MinusAssign => BinOp::Subtract,
            Token::StarAssign => BinOp::Multiply,
            Token::SlashAssign => BinOp::Divide,
            Token::PercentAssign => BinOp::Modulo,
            Token::AmpAssign => BinOp::BitAnd,
            Token::PipeAssign => BinOp::BitOr,
            Token::CaretAssign => BinOp::BitXor,
            Token::ShlAssign => BinOp::ShiftLeft,
            Token::ShrAssign => BinOp::ShiftRight,
            _ => return None,
        };
        Some(AssignOp::Compound(op))
    }

    /// Right-associative. Any expression is accepted as the target here;
    /// the compiler rejects targets it cannot store into.
    fn assignment(&mut self) -> Result<Expr> {
        let target = self.logical_or()?;
        let Some(op) = self.assignment_op() else {
            return Ok(target);
        };
        self.advance();
        let value = self.assignment()?;
        let span = target.span.merge(value.span);
        Ok(Spanned::new(
            ExprKind::Assign { op, target: Box::new(target), value: Box::new(value) },
            span,
        ))
    }

    /// One left-associative precedence level: `next (op next)*`.
    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Result<Expr>,
        op_for: fn(&Token) -> Option<BinOp>,
    ) -> Result<Expr> {
        let mut left = next(self)?;
        while let Some(op) = self.peek().and_then(op_for) {
            self.advance();
            let right = next(self)?;
            let span = left.span.merge(right.span);
            left = Spanned::new(
                ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) },
                span,
            );
        }
        Ok(left)
    }

    fn logical_or(&mut self) -> Result<Expr> {
        self.binary_level(Self::logical_and, |t| (*t == Token::OrOr).then_some(BinOp::Or))
    }

    fn logical_and(&mut self) -> Result<Expr> {
        self.binary_level(Self::bit_or, |t| (*t == Token::AndAnd).then_some(BinOp::And))
    }

    fn bit_or(&mut self) -> Result<Expr> {
        self.binary_level(Self::bit_xor, |t| (*t == Token::Pipe).then_some(BinOp::BitOr))
    }

    fn bit_xor(&mut self) -> Result<Expr> {
        self.binary_level(Self::bit_and, |t| (*t == Token::Caret).then_some(BinOp::BitXor))
    }

    fn bit_and(&mut self) -> Result<Expr> {
        self.binary_level(Self::equality, |t| (*t == Token::Amp).then_some(BinOp::BitAnd))
    }

    fn equality(&mut self) -> Result<Expr> {
        self.binary_level(Self::comparison, |t| match t {
            Token::EqEq => Some(BinOp::Equals),
            Token::NotEq => Some(BinOp::NotEquals),
            _ => None,
        })
    }

    fn comparison(&mut self) -> Result<Expr> {
        self.binary_level(Self::shift, |t| match t {
            Token::Less => Some(BinOp::LessThan),
            Token::LessEq => Some(BinOp::LessOrEqual),
            Token::Greater => Some(BinOp::GreaterThan),
            Token::GreaterEq => Some(BinOp::GreaterOrEqual),
            _ => None,
        })
    }

    fn shift(&mut self) -> Result<Expr> {
        self.binary_level(Self::term, |t| match t {
            Token::Shl => Some(BinOp::ShiftLeft),
            Token::Shr => Some(BinOp::ShiftRight),
            _ => None,
        })
    }

    fn term(&mut self) -> Result<Expr> {
        self.binary_level(Self::factor, |t| match t {
            Token::Plus => Some(BinOp::Add),
            Token::Minus => Some(BinOp::Subtract),
            Token::PlusPlus => Some(BinOp::Concat),
            _ => None,
        })
    }

    fn factor(&mut self) -> Result<Expr> {
        self.binary_level(Self::unary, |t| match t {
            Token::Star => Some(BinOp::Multiply),
            Token::Slash => Some(BinOp::Divide),
            Token::Percent => Some(BinOp::Modulo),
            _ => None,
        })
    }

    fn unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Some(Token::Minus) => UnaryOp::Negate,
            Some(Token::Bang) => UnaryOp::Not,
            Some(Token::Tilde) => UnaryOp::BitNot,
            Some(Token::Star) => UnaryOp::Deref,
            Some(Token::Amp) => UnaryOp::AddressOf,
            _ => return self.postfix(),
        };
        let start = self.peek_span();
        self.advance();
        let operand = self.nested(Self::unary)?;
        let span = start.merge(operand.span);
        Ok(Spanned::new(ExprKind::Unary { op, operand: Box::new(operand) }, span))
    }

    /// Calls, member access, arrow access and subscripts.
    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            let start = expr.span;
            match self.peek() {
                Some(Token::LParen) => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(&Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if !self.check(&Token::Comma) {
                                break;
                            }
                            self.advance();
                        }
                    }
                    self.expect(&Token::RParen, "Expected ')' after arguments.")?;
                    expr = self.spanned(ExprKind::Call { callee: Box::new(expr), args }, start);
                }
                Some(Token::Dot) | Some(Token::Arrow) => {
                    let (op, message) = if self.check(&Token::Dot) {
                        (MemberOp::Dot, "Expected property name after '.'.")
                    } else {
                        (MemberOp::Arrow, "Expected property name after '->'.")
                    };
                    self.advance();
                    let property = self.expect_ident(message)?;
                    expr = self.spanned(ExprKind::Get { object: Box::new(expr), op, property }, start);
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&Token::RBracket, "Expected ']' after index.")?;
                    expr = self.spanned(
                        ExprKind::Index { object: Box::new(expr), index: Box::new(index) },
                        start,
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let start = self.peek_span();
        let kind = match self.peek().cloned() {
            Some(Token::Number(n)) => {
                self.advance();
                ExprKind::Number(n)
            }
            Some(Token::Str(s)) => {
                self.advance();
                ExprKind::Str(s)
            }
            Some(Token::True) => {
                self.advance();
                ExprKind::Bool(true)
            }
            Some(Token::False) => {
                self.advance();
                ExprKind::Bool(false)
            }
            Some(Token::Null) => {
                self.advance();
                ExprKind::Null
            }
            Some(Token::Ident(name)) => {
                self.advance();
                if self.check(&Token::LBrace) {
                    self.struct_literal(name)?
                } else {
                    ExprKind::Variable(name)
                }
            }
            Some(Token::LParen) => {
                self.advance();
                let inner = self.expression()?;
                self.expect(&Token::RParen, "Expected ')' after expression.")?;
                return Ok(self.spanned(inner.node, start));
            }
            Some(Token::LBracket) => {
                self.advance();
                let mut elements = Vec::new();
                while !self.check(&Token::RBracket) {
                    elements.push(self.expression()?);
                    if !self.check(&Token::Comma) {
                        break;
                    }
                    self.advance();
                }
                self.expect(&Token::RBracket, "Expected ']' after array members.")?;
                ExprKind::Array(elements)
            }
            Some(Token::RParen) => return Err(self.error("Unmatched closing parentheses.")),
            Some(Token::Yield) => return Err(self.error("'yield' is reserved; generators are not supported.")),
            _ => return Err(self.error("Expected expression.")),
        };
        Ok(self.spanned(kind, start))
    }

    /// `Name { prop: expr, ... }`, entered with the `{` as the next token.
    fn struct_literal(&mut self, name: String) -> Result<ExprKind> {
        self.advance();
        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) {
            let prop = self.expect_ident("Expected property name.")?;
            self.expect(&Token::Colon, "Expected ':' after property name.")?;
            let value = self.expression()?;
            fields.push((prop, value));
            if self.check(&Token::Comma) {
                self.advance();
            } else if !self.check(&Token::RBrace) {
                return Err(self.error("Expected ',' after 'key: value' pair."));
            }
        }
        self.expect(&Token::RBrace, "Expected '}' after struct initialization.")?;
        Ok(ExprKind::StructLiteral { name, fields })
    }
}

/// Parse a token stream; every collected error is returned when any occurred.
pub fn parse(tokens: Vec<(Token, Span)>) -> std::result::Result<Program, Vec<ParseError>> {
    let (program, errors) = Parser::new(tokens).parse_program();
    if errors.is_empty() { Ok(program) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;

    fn parse_str(source: &str) -> Program {
        parse(lex(source).unwrap()).unwrap()
    }

    fn first_error(source: &str) -> String {
        parse(lex(source).unwrap()).unwrap_err().remove(0).message
    }

    fn only_expr(source: &str) -> ExprKind {
        let program = parse_str(source);
        match &program.statements[0].node {
            StmtKind::Expr(e) | StmtKind::Print(e) => e.node.clone(),
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn parse_let_and_print() {
        let program = parse_str("let x = 3; print x + 1;");
        assert_eq!(program.statements.len(), 2);
        assert!(matches!(&program.statements[0].node, StmtKind::Let { name, .. } if name == "x"));
        assert!(matches!(
            &program.statements[1].node,
            StmtKind::Print(e) if matches!(e.node, ExprKind::Binary { op: BinOp::Add, .. })
        ));
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let ExprKind::Binary { op, right, .. } = only_expr("1 + 2 * 3;") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinOp::Add);
        assert!(matches!(right.node, ExprKind::Binary { op: BinOp::Multiply, .. }));
    }

    #[test]
    fn bitwise_levels_nest_in_order() {
        // a | b ^ c & d  ==  a | (b ^ (c & d))
        let ExprKind::Binary { op, right, .. } = only_expr("a | b ^ c & d;") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinOp::BitOr);
        let ExprKind::Binary { op, right, .. } = right.node else { panic!("expected xor") };
        assert_eq!(op, BinOp::BitXor);
        assert!(matches!(right.node, ExprKind::Binary { op: BinOp::BitAnd, .. }));
    }

    #[test]
    fn logical_or_is_lowest_binary() {
        let ExprKind::Binary { op, left, .. } = only_expr("a && b || c;") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinOp::Or);
        assert!(matches!(left.node, ExprKind::Binary { op: BinOp::And, .. }));
    }

    #[test]
    fn assignment_is_right_associative() {
        let ExprKind::Assign { value, .. } = only_expr("a = b = 3;") else {
            panic!("expected assignment");
        };
        assert!(matches!(value.node, ExprKind::Assign { .. }));
    }

    #[test]
    fn compound_assignment_desugars_op() {
        let ExprKind::Assign { op, .. } = only_expr("x <<= 2;") else {
            panic!("expected assignment");
        };
        assert_eq!(op, AssignOp::Compound(BinOp::ShiftLeft));
    }

    #[test]
    fn deref_applies_to_whole_member_chain() {
        let ExprKind::Unary { op, operand } = only_expr("*p.x;") else {
            panic!("expected unary");
        };
        assert_eq!(op, UnaryOp::Deref);
        assert!(matches!(operand.node, ExprKind::Get { op: MemberOp::Dot, .. }));
    }

    #[test]
    fn arrow_chain_is_left_nested() {
        let ExprKind::Get { object, op, property } = only_expr("a->b->c;") else {
            panic!("expected get");
        };
        assert_eq!(op, MemberOp::Arrow);
        assert_eq!(property, "c");
        assert!(matches!(object.node, ExprKind::Get { op: MemberOp::Arrow, ref property, .. } if property == "b"));
    }

    #[test]
    fn struct_literal_and_array() {
        let ExprKind::StructLiteral { name, fields } = only_expr("Point { x: 1, y: [2, 3] };") else {
            panic!("expected struct literal");
        };
        assert_eq!(name, "Point");
        assert_eq!(fields.len(), 2);
        assert!(matches!(fields[1].1.node, ExprKind::Array(ref items) if items.len() == 2));
    }

    #[test]
    fn parse_for_loop() {
        let program = parse_str("for (let i = 0; i < 3; i += 1) { print i; }");
        let StmtKind::For { init, body, label, .. } = &program.statements[0].node else {
            panic!("expected for");
        };
        assert!(label.is_none());
        assert!(matches!(init.node, StmtKind::Let { .. }));
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn parse_else_if_chain() {
        let program = parse_str("if (a) { print 1; } else if (b) { print 2; } else { print 3; }");
        let StmtKind::If { else_branch: Some(rest), .. } = &program.statements[0].node else {
            panic!("expected if/else");
        };
        assert!(matches!(rest[0].node, StmtKind::If { else_branch: Some(_), .. }));
    }

    #[test]
    fn parse_decorator_struct_impl_and_use() {
        let program = parse_str(
            "use \"lib.fang\"; struct P { x; y; } impl P { fn sum(self) { return self.x + self.y; } } \
             @twice fn f(n) { return n; }",
        );
        assert!(matches!(&program.statements[0].node, StmtKind::Use { path } if path == "lib.fang"));
        assert!(matches!(&program.statements[1].node, StmtKind::Struct { properties, .. } if properties.len() == 2));
        assert!(matches!(&program.statements[2].node, StmtKind::Impl { methods, .. } if methods.len() == 1));
        assert!(matches!(&program.statements[3].node, StmtKind::Decorated { decorator, .. } if decorator == "twice"));
    }

    #[test]
    fn literal_assignment_is_accepted_by_parser() {
        assert!(matches!(only_expr("3 = 4;"), ExprKind::Assign { .. }));
    }

    #[test]
    fn statement_error_messages() {
        let cases = [
            ("print 1", "Expected ';' after 'print' statement."),
            ("let x = 1", "Expected ';' after 'let' statement."),
            ("let x 1;", "Expected '=' after variable name in 'let' statement."),
            ("let = 1;", "Expected identifier after 'let'."),
            ("assert true", "Expected ';' after 'assert' statement."),
            ("1 + 2", "Expected ';' after expression statement."),
            ("fn f() { return 1 }", "Expected ';' after 'return' statement."),
            ("while (true) { break }", "Expected ';' after 'break' statement."),
            ("while (true) { continue }", "Expected ';' after 'continue' statement."),
            ("while true) {}", "Expected '(' after 'while'."),
            ("while (true {}", "Expected ')' after 'while' condition."),
            ("while (true) print 1;", "Expected '{' token."),
            ("for let i = 0;", "Expected '(' after 'for'."),
            ("for (i = 0; i < 1; i += 1) {}", "Expected 'let' after '(' in 'for' initializer."),
            ("for (let i = 0 i < 1; i += 1) {}", "Expected ';' after 'for' initializer."),
            ("for (let i = 0; i < 1 i += 1) {}", "Expected ';' after 'for' condition."),
            ("for (let i = 0; i < 1; i += 1 {}", "Expected ')' after 'for' advancement."),
            ("if true) {}", "Expected '(' after 'if'."),
            ("if (true {}", "Expected ')' after 'if' condition."),
            ("impl {}", "Expected identifier after 'impl'."),
            ("impl P fn", "Expected '{' after identifier in 'impl' statement."),
            ("impl P { let x = 1; }", "Expected 'fn' token."),
            ("fn (a) {}", "Expected identifier after 'fn'."),
            ("fn f a) {}", "Expected '(' after identifier in 'fn' statement."),
            ("fn f(1) {}", "Expected parameter name after '(' in 'fn' statement."),
            ("fn f(a) print a;", "Expected '{' token."),
            ("fn f(a b) {}", "Expected ')' after the parameter list in 'fn' statement."),
            ("@deco let x = 1;", "Expected 'fn' token."),
            ("@ fn f() {}", "Expected identifier after '@'."),
            ("struct {}", "Expected identifier after 'struct'."),
            ("struct P x; }", "Expected '{' after identifier in 'struct' stmt."),
            ("struct P { 1; }", "Expected property name."),
            ("struct P { x }", "Expected semicolon after property name."),
            ("print 1);", "Expected ';' after 'print' statement."),
            ("print (1;", "Expected ')' after expression."),
            (");", "Unmatched closing parentheses."),
            ("print [1, 2;", "Expected ']' after array members."),
            ("print P { x 1 };", "Expected ':' after property name."),
            ("print P { x: 1 y: 2 };", "Expected ',' after 'key: value' pair."),
            ("use lib;", "Module path should be a string"),
            ("print a.;", "Expected property name after '.'."),
            ("print a->1;", "Expected property name after '->'."),
            ("print a[1;", "Expected ']' after index."),
            ("print f(1;", "Expected ')' after arguments."),
        ];
        for (source, expected) in cases {
            assert_eq!(first_error(source), expected, "source: {source}");
        }
    }

    #[test]
    fn recovery_reports_multiple_errors() {
        let errors = parse(lex("print 1\nlet y = 2;\nlet z 3;\nprint z;").unwrap()).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "Expected ';' after 'print' statement.");
        assert_eq!(errors[1].message, "Expected '=' after variable name in 'let' statement.");
    }

    #[test]
    fn yield_is_reserved() {
        assert_eq!(first_error("let g = yield 1;"), "'yield' is reserved; generators are not supported.");
    }

    #[test]
    fn nesting_limit() {
        let deep = format!("print {}1{};", "(".repeat(MAX_NESTING + 10), ")".repeat(MAX_NESTING + 10));
        assert_eq!(first_error(&deep), "Too much nesting.");

        let blocks = format!("{}{}", "{".repeat(MAX_NESTING + 10), "}".repeat(MAX_NESTING + 10));
        assert_eq!(first_error(&blocks), "Too much nesting.");

        let negations = format!("print {}true;", "!".repeat(MAX_NESTING + 10));
        assert_eq!(first_error(&negations), "Too much nesting.");

        let shallow = format!("print {}1{};", "(".repeat(40), ")".repeat(40));
        assert!(parse(lex(&shallow).unwrap()).is_ok());
    }

    #[test]
    fn stray_closing_brace_does_not_loop() {
        let errors = parse(lex("} } print 1;").unwrap()).unwrap_err();
        assert!(!errors.is_empty());
    }

    #[test]
    fn statement_spans_cover_source() {
        let program = parse_str("let answer = 42;");
        assert_eq!(program.statements[0].span, Span { start: 0, end: 16 });
    }
}
