//! Recursive-descent parser.
//!
//! Statements are `;`-separated; everything is an expression. Binary
//! operators are parsed with one function per precedence level, loosest to
//! tightest: assignment, `catch`, `try`/`throw`, `or`, `and`, `not`,
//! comparisons (`== != < <= > >= in is`), ranges (`:`), `|`, `^`, `&`,
//! shifts, `+ -`, `* / // %`, `as`, unary `- ~`, `**` (right-associative),
//! then call/index/member suffixes.
//!
//! A nesting-depth limit keeps recursion bounded on hostile input.

use bumpalo::Bump;

use super::ast::{BinOp, JumpKind, Literal, MatchCase, Node, SuffixOp, TypeOp, UnOp};
use super::token::{Token, TokenKind, Tokenizer};
use crate::errors::ParseError;

const MAX_DEPTH: usize = 256;

pub struct Parser<'a, 's> {
    arena: &'a Bump,
    tokens: Vec<Token<'s>>,
    /// Decoded payloads for string literals that contained escapes, keyed by
    /// token index.
    decoded: Vec<(usize, String)>,
    pos: usize,
    depth: usize,
}

/// Parse a whole program into arena-allocated statements.
pub fn parse<'a>(arena: &'a Bump, src: &str) -> Result<&'a [&'a Node<'a>], ParseError> {
    let (tokens, decoded) = Tokenizer::tokenize(src)?;
    let mut parser = Parser {
        arena,
        tokens,
        decoded,
        pos: 0,
        depth: 0,
    };
    let stmts = parser.stmt_list(TokenKind::Eof)?;
    parser.expect(TokenKind::Eof)?;
    Ok(stmts)
}

impl<'a, 's> Parser<'a, 's> {
    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn peek(&self) -> TokenKind<'s> {
        self.tokens[self.pos].kind
    }

    fn peek_at(&self, ahead: usize) -> TokenKind<'s> {
        self.tokens
            .get(self.pos + ahead)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn offset(&self) -> u32 {
        self.tokens[self.pos].offset
    }

    fn bump(&mut self) -> Token<'s> {
        let token = self.tokens[self.pos];
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind<'s>) -> bool {
        if self.peek() == kind {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind<'s>) -> Result<Token<'s>, ParseError> {
        if self.peek() == kind {
            Ok(self.bump())
        } else {
            Err(self.unexpected(&format!("expected {}", kind.describe())))
        }
    }

    fn unexpected(&self, what: &str) -> ParseError {
        ParseError::new(
            format!("{what}, found {}", self.peek().describe()),
            self.offset(),
        )
    }

    fn alloc(&self, node: Node<'a>) -> &'a Node<'a> {
        self.arena.alloc(node)
    }

    /// Arena copy of a string literal at a given token index, using the
    /// decoded escape text when there was one.
    fn str_text(&self, token_index: usize, raw: &str) -> &'a str {
        match self.decoded.binary_search_by_key(&token_index, |e| e.0) {
            Ok(i) => self.arena.alloc_str(&self.decoded[i].1),
            Err(_) => self.arena.alloc_str(raw),
        }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ParseError::new(
                "expression nesting exceeds the maximum depth",
                self.offset(),
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn stmt_list(&mut self, end: TokenKind<'s>) -> Result<&'a [&'a Node<'a>], ParseError> {
        let mut stmts = Vec::new();
        loop {
            while self.eat(TokenKind::Semicolon) {}
            if self.peek() == end || self.peek() == TokenKind::Eof {
                break;
            }
            stmts.push(self.stmt()?);
            if self.peek() == end || self.peek() == TokenKind::Eof {
                break;
            }
            self.expect(TokenKind::Semicolon)?;
        }
        Ok(self.arena.alloc_slice_copy(&stmts))
    }

    fn stmt(&mut self) -> Result<&'a Node<'a>, ParseError> {
        match self.peek() {
            TokenKind::Let | TokenKind::Const => self.decl(),
            _ => self.expr(),
        }
    }

    fn decl(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        let mutable = self.bump().kind == TokenKind::Let;
        let pattern = self.pattern(false)?;
        self.expect(TokenKind::Eq)?;
        let value = self.expr()?;
        Ok(self.alloc(Node::Decl {
            mutable,
            pattern,
            value,
            offset,
        }))
    }

    // ------------------------------------------------------------------
    // Expressions, loosest precedence first
    // ------------------------------------------------------------------

    fn expr(&mut self) -> Result<&'a Node<'a>, ParseError> {
        self.enter()?;
        let result = self.assign();
        self.leave();
        result
    }

    fn assign(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let target = self.catch_level()?;
        let op = match self.peek() {
            TokenKind::Eq => None,
            TokenKind::PlusEq => Some(BinOp::Add),
            TokenKind::MinusEq => Some(BinOp::Sub),
            TokenKind::StarEq => Some(BinOp::Mul),
            TokenKind::StarStarEq => Some(BinOp::Pow),
            TokenKind::SlashEq => Some(BinOp::Div),
            TokenKind::SlashSlashEq => Some(BinOp::DivFloor),
            TokenKind::PercentEq => Some(BinOp::Rem),
            TokenKind::ShlEq => Some(BinOp::LShift),
            TokenKind::ShrEq => Some(BinOp::RShift),
            TokenKind::AmpEq => Some(BinOp::BitAnd),
            TokenKind::PipeEq => Some(BinOp::BitOr),
            TokenKind::CaretEq => Some(BinOp::BitXor),
            _ => return Ok(target),
        };
        let offset = self.offset();
        self.bump();
        let value = self.assign()?;
        Ok(self.alloc(Node::Assign {
            target,
            op,
            value,
            offset,
        }))
    }

    fn catch_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let mut expr = self.try_level()?;
        while self.peek() == TokenKind::Catch {
            let offset = self.offset();
            self.bump();
            let binding = if self.eat(TokenKind::Pipe) {
                let b = match self.peek() {
                    TokenKind::Ident(name) => {
                        let offset = self.offset();
                        self.bump();
                        self.alloc(Node::Identifier {
                            name: self.arena.alloc_str(name),
                            offset,
                        })
                    }
                    TokenKind::Underscore => {
                        let offset = self.offset();
                        self.bump();
                        self.alloc(Node::Discard { offset })
                    }
                    _ => return Err(self.unexpected("expected catch binding")),
                };
                self.expect(TokenKind::Pipe)?;
                Some(b)
            } else {
                None
            };
            let handler = self.try_level()?;
            expr = self.alloc(Node::Catch {
                expr,
                binding,
                handler,
                offset,
            });
        }
        Ok(expr)
    }

    fn try_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        match self.peek() {
            TokenKind::Try => {
                let offset = self.offset();
                self.bump();
                let expr = self.try_level()?;
                Ok(self.alloc(Node::Try { expr, offset }))
            }
            TokenKind::Throw => {
                let offset = self.offset();
                self.bump();
                let expr = self.try_level()?;
                Ok(self.alloc(Node::Throw { expr, offset }))
            }
            _ => self.or_level(),
        }
    }

    fn or_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let mut lhs = self.and_level()?;
        while self.peek() == TokenKind::Or {
            let offset = self.offset();
            self.bump();
            let rhs = self.and_level()?;
            lhs = self.alloc(Node::Infix {
                op: BinOp::Or,
                lhs,
                rhs,
                offset,
            });
        }
        Ok(lhs)
    }

    fn and_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let mut lhs = self.not_level()?;
        while self.peek() == TokenKind::And {
            let offset = self.offset();
            self.bump();
            let rhs = self.not_level()?;
            lhs = self.alloc(Node::Infix {
                op: BinOp::And,
                lhs,
                rhs,
                offset,
            });
        }
        Ok(lhs)
    }

    fn not_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        if self.peek() == TokenKind::Not {
            let offset = self.offset();
            self.bump();
            let operand = self.not_level()?;
            return Ok(self.alloc(Node::Prefix {
                op: UnOp::BoolNot,
                operand,
                offset,
            }));
        }
        self.cmp_level()
    }

    fn cmp_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let mut lhs = self.range_level()?;
        loop {
            let op = match self.peek() {
                TokenKind::EqEq => BinOp::Equal,
                TokenKind::NotEq => BinOp::NotEqual,
                TokenKind::Lt => BinOp::Less,
                TokenKind::LtEq => BinOp::LessEq,
                TokenKind::Gt => BinOp::Greater,
                TokenKind::GtEq => BinOp::GreaterEq,
                TokenKind::In => BinOp::In,
                TokenKind::Is => {
                    let offset = self.offset();
                    self.bump();
                    let ty = self.type_name()?;
                    lhs = self.alloc(Node::TypeInfix {
                        op: TypeOp::Is,
                        operand: lhs,
                        ty,
                        offset,
                    });
                    continue;
                }
                _ => return Ok(lhs),
            };
            let offset = self.offset();
            self.bump();
            let rhs = self.range_level()?;
            lhs = self.alloc(Node::Infix {
                op,
                lhs,
                rhs,
                offset,
            });
        }
    }

    fn type_name(&mut self) -> Result<&'a str, ParseError> {
        match self.peek() {
            TokenKind::Ident(name) => {
                self.bump();
                Ok(self.arena.alloc_str(name))
            }
            // `error` and `null` are keywords but also type names.
            TokenKind::Error => {
                self.bump();
                Ok("error")
            }
            TokenKind::Null => {
                self.bump();
                Ok("null")
            }
            _ => Err(self.unexpected("expected type name")),
        }
    }

    fn range_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let mut lhs = self.bitor_level()?;
        if self.peek() == TokenKind::Colon {
            let offset = self.offset();
            self.bump();
            let end = self.bitor_level()?;
            lhs = self.alloc(Node::Infix {
                op: BinOp::Range,
                lhs,
                rhs: end,
                offset,
            });
            if self.peek() == TokenKind::Colon {
                let offset = self.offset();
                self.bump();
                let step = self.bitor_level()?;
                lhs = self.alloc(Node::Infix {
                    op: BinOp::Range,
                    lhs,
                    rhs: step,
                    offset,
                });
            }
        }
        Ok(lhs)
    }

    fn bitor_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        self.binary_level(
            &[(TokenKind::Pipe, BinOp::BitOr)],
            Self::bitxor_level,
        )
    }

    fn bitxor_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        self.binary_level(&[(TokenKind::Caret, BinOp::BitXor)], Self::bitand_level)
    }

    fn bitand_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        self.binary_level(&[(TokenKind::Amp, BinOp::BitAnd)], Self::shift_level)
    }

    fn shift_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        self.binary_level(
            &[(TokenKind::Shl, BinOp::LShift), (TokenKind::Shr, BinOp::RShift)],
            Self::add_level,
        )
    }

    fn add_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        self.binary_level(
            &[(TokenKind::Plus, BinOp::Add), (TokenKind::Minus, BinOp::Sub)],
            Self::mul_level,
        )
    }

    fn mul_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        self.binary_level(
            &[
                (TokenKind::Star, BinOp::Mul),
                (TokenKind::Slash, BinOp::Div),
                (TokenKind::SlashSlash, BinOp::DivFloor),
                (TokenKind::Percent, BinOp::Rem),
            ],
            Self::as_level,
        )
    }

    fn binary_level(
        &mut self,
        table: &[(TokenKind<'s>, BinOp)],
        next: fn(&mut Self) -> Result<&'a Node<'a>, ParseError>,
    ) -> Result<&'a Node<'a>, ParseError> {
        let mut lhs = next(self)?;
        'outer: loop {
            for &(token, op) in table {
                if self.peek() == token {
                    let offset = self.offset();
                    self.bump();
                    let rhs = next(self)?;
                    lhs = self.alloc(Node::Infix {
                        op,
                        lhs,
                        rhs,
                        offset,
                    });
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn as_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let mut operand = self.unary_level()?;
        while self.peek() == TokenKind::As {
            let offset = self.offset();
            self.bump();
            let ty = self.type_name()?;
            operand = self.alloc(Node::TypeInfix {
                op: TypeOp::As,
                operand,
                ty,
                offset,
            });
        }
        Ok(operand)
    }

    fn unary_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let op = match self.peek() {
            TokenKind::Minus => UnOp::Neg,
            TokenKind::Tilde => UnOp::BitNot,
            _ => return self.pow_level(),
        };
        let offset = self.offset();
        self.bump();
        let operand = self.unary_level()?;
        Ok(self.alloc(Node::Prefix {
            op,
            operand,
            offset,
        }))
    }

    fn pow_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let base = self.suffix_level()?;
        if self.peek() == TokenKind::StarStar {
            let offset = self.offset();
            self.bump();
            // Right-associative; the operand may carry a unary minus.
            let rhs = self.unary_level()?;
            return Ok(self.alloc(Node::Infix {
                op: BinOp::Pow,
                lhs: base,
                rhs,
                offset,
            }));
        }
        Ok(base)
    }

    fn suffix_level(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                TokenKind::LParen => {
                    let offset = self.offset();
                    self.bump();
                    let mut args = Vec::new();
                    while self.peek() != TokenKind::RParen {
                        args.push(self.expr()?);
                        if !self.eat(TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(TokenKind::RParen)?;
                    expr = self.alloc(Node::Suffix {
                        op: SuffixOp::Call(self.arena.alloc_slice_copy(&args)),
                        operand: expr,
                        offset,
                    });
                }
                TokenKind::LBracket => {
                    let offset = self.offset();
                    self.bump();
                    let index = self.expr()?;
                    self.expect(TokenKind::RBracket)?;
                    expr = self.alloc(Node::Suffix {
                        op: SuffixOp::Index(index),
                        operand: expr,
                        offset,
                    });
                }
                TokenKind::Dot => {
                    let offset = self.offset();
                    self.bump();
                    let name = match self.peek() {
                        TokenKind::Ident(name) => {
                            self.bump();
                            self.arena.alloc_str(name)
                        }
                        _ => return Err(self.unexpected("expected member name")),
                    };
                    expr = self.alloc(Node::Suffix {
                        op: SuffixOp::Member(name),
                        operand: expr,
                        offset,
                    });
                }
                _ => return Ok(expr),
            }
        }
    }

    // ------------------------------------------------------------------
    // Primaries
    // ------------------------------------------------------------------

    fn primary(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        match self.peek() {
            TokenKind::Int(v) => {
                self.bump();
                Ok(self.alloc(Node::Literal {
                    value: Literal::Int(v),
                    offset,
                }))
            }
            TokenKind::Num(v) => {
                self.bump();
                Ok(self.alloc(Node::Literal {
                    value: Literal::Num(v),
                    offset,
                }))
            }
            TokenKind::Str(raw) => {
                let index = self.pos;
                self.bump();
                Ok(self.alloc(Node::Literal {
                    value: Literal::Str(self.str_text(index, raw)),
                    offset,
                }))
            }
            TokenKind::True | TokenKind::False => {
                let value = self.bump().kind == TokenKind::True;
                Ok(self.alloc(Node::Literal {
                    value: Literal::Bool(value),
                    offset,
                }))
            }
            TokenKind::Null => {
                self.bump();
                Ok(self.alloc(Node::Literal {
                    value: Literal::Null,
                    offset,
                }))
            }
            TokenKind::This => {
                self.bump();
                Ok(self.alloc(Node::Identifier {
                    name: "this",
                    offset,
                }))
            }
            TokenKind::Ident(name) => {
                self.bump();
                Ok(self.alloc(Node::Identifier {
                    name: self.arena.alloc_str(name),
                    offset,
                }))
            }
            TokenKind::Underscore => {
                self.bump();
                Ok(self.alloc(Node::Discard { offset }))
            }
            TokenKind::LParen => self.paren(),
            TokenKind::LBracket => self.list(),
            TokenKind::LBrace => self.block_or_map(),
            TokenKind::Fn => self.func(),
            TokenKind::If => self.if_expr(),
            TokenKind::While => self.while_expr(),
            TokenKind::For => self.for_expr(),
            TokenKind::Match => self.match_expr(),
            TokenKind::Error => self.error_value(),
            TokenKind::At => self.tagged(),
            TokenKind::Import | TokenKind::Native => self.host_ref(),
            TokenKind::Break => {
                self.bump();
                Ok(self.alloc(Node::Jump {
                    kind: JumpKind::Break,
                    offset,
                }))
            }
            TokenKind::Continue => {
                self.bump();
                Ok(self.alloc(Node::Jump {
                    kind: JumpKind::Continue,
                    offset,
                }))
            }
            TokenKind::Return => {
                self.bump();
                let value = if matches!(
                    self.peek(),
                    TokenKind::Semicolon
                        | TokenKind::RBrace
                        | TokenKind::RParen
                        | TokenKind::RBracket
                        | TokenKind::Comma
                        | TokenKind::Else
                        | TokenKind::Eof
                ) {
                    None
                } else {
                    Some(self.expr()?)
                };
                Ok(self.alloc(Node::Jump {
                    kind: JumpKind::Return(value),
                    offset,
                }))
            }
            _ => Err(self.unexpected("expected expression")),
        }
    }

    fn paren(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        self.expect(TokenKind::LParen)?;
        if self.eat(TokenKind::RParen) {
            return Ok(self.alloc(Node::Tuple { items: &[], offset }));
        }
        let first = self.expr()?;
        if self.peek() == TokenKind::Comma {
            let mut items = vec![first];
            while self.eat(TokenKind::Comma) {
                if self.peek() == TokenKind::RParen {
                    break;
                }
                items.push(self.expr()?);
            }
            self.expect(TokenKind::RParen)?;
            return Ok(self.alloc(Node::Tuple {
                items: self.arena.alloc_slice_copy(&items),
                offset,
            }));
        }
        self.expect(TokenKind::RParen)?;
        Ok(self.alloc(Node::Grouped { expr: first, offset }))
    }

    fn list(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        self.expect(TokenKind::LBracket)?;
        let mut items = Vec::new();
        while self.peek() != TokenKind::RBracket {
            items.push(self.expr()?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBracket)?;
        Ok(self.alloc(Node::List {
            items: self.arena.alloc_slice_copy(&items),
            offset,
        }))
    }

    /// `{` opens either a map literal or a block. Maps are detected by a
    /// single-token key followed by `:` (or an immediately closing brace);
    /// identifier keys mean their string.
    fn block_or_map(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        self.expect(TokenKind::LBrace)?;

        if self.eat(TokenKind::RBrace) {
            return Ok(self.alloc(Node::Map { entries: &[], offset }));
        }

        let key_start = matches!(
            self.peek(),
            TokenKind::Ident(_)
                | TokenKind::Str(_)
                | TokenKind::Int(_)
                | TokenKind::Num(_)
                | TokenKind::True
                | TokenKind::False
                | TokenKind::Null
        );
        if key_start && self.peek_at(1) == TokenKind::Colon {
            let mut entries = Vec::new();
            loop {
                let key = self.map_key()?;
                self.expect(TokenKind::Colon)?;
                let value = self.expr()?;
                entries.push((key, value));
                if !self.eat(TokenKind::Comma) {
                    break;
                }
                if self.peek() == TokenKind::RBrace {
                    break;
                }
            }
            self.expect(TokenKind::RBrace)?;
            return Ok(self.alloc(Node::Map {
                entries: self.arena.alloc_slice_copy(&entries),
                offset,
            }));
        }

        let stmts = self.stmt_list(TokenKind::RBrace)?;
        self.expect(TokenKind::RBrace)?;
        Ok(self.alloc(Node::Block { stmts, offset }))
    }

    /// Map keys are single tokens; an identifier key means its string.
    fn map_key(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        let value = match self.peek() {
            TokenKind::Ident(name) => Literal::Str(self.arena.alloc_str(name)),
            TokenKind::Str(raw) => Literal::Str(self.str_text(self.pos, raw)),
            TokenKind::Int(v) => Literal::Int(v),
            TokenKind::Num(v) => Literal::Num(v),
            TokenKind::True => Literal::Bool(true),
            TokenKind::False => Literal::Bool(false),
            TokenKind::Null => Literal::Null,
            _ => return Err(self.unexpected("expected map key")),
        };
        self.bump();
        Ok(self.alloc(Node::Literal { value, offset }))
    }

    fn func(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        self.expect(TokenKind::Fn)?;
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        while self.peek() != TokenKind::RParen {
            let p_offset = self.offset();
            let param = match self.peek() {
                TokenKind::Ident(name) => {
                    self.bump();
                    self.alloc(Node::Identifier {
                        name: self.arena.alloc_str(name),
                        offset: p_offset,
                    })
                }
                TokenKind::Underscore => {
                    self.bump();
                    self.alloc(Node::Discard { offset: p_offset })
                }
                _ => return Err(self.unexpected("expected parameter name")),
            };
            params.push(param);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        let body = self.expr()?;
        Ok(self.alloc(Node::Fn {
            params: self.arena.alloc_slice_copy(&params),
            body,
            offset,
        }))
    }

    fn if_expr(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        self.expect(TokenKind::If)?;
        self.expect(TokenKind::LParen)?;
        let cond = self.expr()?;
        self.expect(TokenKind::RParen)?;
        let then_body = self.expr()?;
        let else_body = if self.eat(TokenKind::Else) {
            Some(self.expr()?)
        } else {
            None
        };
        Ok(self.alloc(Node::If {
            cond,
            then_body,
            else_body,
            offset,
        }))
    }

    fn while_expr(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        self.expect(TokenKind::While)?;
        self.expect(TokenKind::LParen)?;
        let cond = self.expr()?;
        self.expect(TokenKind::RParen)?;
        let body = self.expr()?;
        Ok(self.alloc(Node::While { cond, body, offset }))
    }

    fn for_expr(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        self.expect(TokenKind::For)?;
        let pattern = self.pattern(false)?;
        self.expect(TokenKind::In)?;
        let iterable = self.expr()?;
        let body = self.expr()?;
        Ok(self.alloc(Node::For {
            pattern,
            iterable,
            body,
            offset,
        }))
    }

    fn match_expr(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        self.expect(TokenKind::Match)?;
        self.expect(TokenKind::LParen)?;
        let subject = self.expr()?;
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::LBrace)?;
        let mut cases = Vec::new();
        while self.peek() != TokenKind::RBrace {
            let case_offset = self.offset();
            let pattern = self.pattern(true)?;
            self.expect(TokenKind::FatArrow)?;
            let body = self.expr()?;
            cases.push(MatchCase {
                pattern,
                body,
                offset: case_offset,
            });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(self.alloc(Node::Match {
            subject,
            cases: self.arena.alloc_slice_copy(&cases),
            offset,
        }))
    }

    fn error_value(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        self.expect(TokenKind::Error)?;
        self.expect(TokenKind::LParen)?;
        let value = if self.peek() == TokenKind::RParen {
            None
        } else {
            Some(self.expr()?)
        };
        self.expect(TokenKind::RParen)?;
        Ok(self.alloc(Node::ErrorValue { value, offset }))
    }

    fn tagged(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        self.expect(TokenKind::At)?;
        let name = match self.peek() {
            TokenKind::Ident(name) => {
                self.bump();
                self.arena.alloc_str(name)
            }
            _ => return Err(self.unexpected("expected tag name")),
        };
        let value = if self.eat(TokenKind::LParen) {
            let value = self.expr()?;
            self.expect(TokenKind::RParen)?;
            Some(value)
        } else {
            None
        };
        Ok(self.alloc(Node::Tagged {
            name,
            value,
            offset,
        }))
    }

    /// `import("...")` and `native("...")` take a single string literal.
    fn host_ref(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        let is_import = self.bump().kind == TokenKind::Import;
        self.expect(TokenKind::LParen)?;
        let name = match self.peek() {
            TokenKind::Str(raw) => {
                let text = self.str_text(self.pos, raw);
                self.bump();
                text
            }
            _ => return Err(self.unexpected("expected string literal")),
        };
        self.expect(TokenKind::RParen)?;
        Ok(self.alloc(if is_import {
            Node::Import { path: name, offset }
        } else {
            Node::Native { name, offset }
        }))
    }

    // ------------------------------------------------------------------
    // Patterns
    // ------------------------------------------------------------------

    /// Irrefutable patterns bind (`let`, `const`, `for`); refutable ones
    /// (match cases) additionally allow literal tests.
    fn pattern(&mut self, refutable: bool) -> Result<&'a Node<'a>, ParseError> {
        self.enter()?;
        let result = self.pattern_inner(refutable);
        self.leave();
        result
    }

    fn pattern_inner(&mut self, refutable: bool) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        match self.peek() {
            TokenKind::Underscore => {
                self.bump();
                Ok(self.alloc(Node::Discard { offset }))
            }
            TokenKind::Ident(name) => {
                self.bump();
                Ok(self.alloc(Node::Identifier {
                    name: self.arena.alloc_str(name),
                    offset,
                }))
            }
            // `let name` in a match case is an explicit binding marker.
            TokenKind::Let if refutable => {
                self.bump();
                match self.peek() {
                    TokenKind::Ident(name) => {
                        let offset = self.offset();
                        self.bump();
                        Ok(self.alloc(Node::Identifier {
                            name: self.arena.alloc_str(name),
                            offset,
                        }))
                    }
                    _ => Err(self.unexpected("expected binding name")),
                }
            }
            TokenKind::LParen => {
                self.bump();
                let items = self.pattern_list(TokenKind::RParen, refutable)?;
                self.expect(TokenKind::RParen)?;
                Ok(self.alloc(Node::Tuple { items, offset }))
            }
            TokenKind::LBracket => {
                self.bump();
                let items = self.pattern_list(TokenKind::RBracket, refutable)?;
                self.expect(TokenKind::RBracket)?;
                Ok(self.alloc(Node::List { items, offset }))
            }
            TokenKind::Error => {
                self.bump();
                self.expect(TokenKind::LParen)?;
                let inner = self.pattern(refutable)?;
                self.expect(TokenKind::RParen)?;
                Ok(self.alloc(Node::ErrorValue {
                    value: Some(inner),
                    offset,
                }))
            }
            TokenKind::At => {
                self.bump();
                let name = match self.peek() {
                    TokenKind::Ident(name) => {
                        self.bump();
                        self.arena.alloc_str(name)
                    }
                    _ => return Err(self.unexpected("expected tag name")),
                };
                let value = if self.eat(TokenKind::LParen) {
                    let inner = self.pattern(refutable)?;
                    self.expect(TokenKind::RParen)?;
                    Some(inner)
                } else {
                    None
                };
                Ok(self.alloc(Node::Tagged {
                    name,
                    value,
                    offset,
                }))
            }
            TokenKind::Int(_)
            | TokenKind::Num(_)
            | TokenKind::Str(_)
            | TokenKind::True
            | TokenKind::False
            | TokenKind::Null
            | TokenKind::Minus
                if refutable =>
            {
                self.literal_pattern()
            }
            _ => Err(self.unexpected(if refutable {
                "expected pattern"
            } else {
                "expected binding pattern"
            })),
        }
    }

    fn literal_pattern(&mut self) -> Result<&'a Node<'a>, ParseError> {
        let offset = self.offset();
        let negative = self.eat(TokenKind::Minus);
        let value = match self.peek() {
            TokenKind::Int(v) => Literal::Int(if negative { -v } else { v }),
            TokenKind::Num(v) => Literal::Num(if negative { -v } else { v }),
            TokenKind::Str(raw) if !negative => Literal::Str(self.str_text(self.pos, raw)),
            TokenKind::True if !negative => Literal::Bool(true),
            TokenKind::False if !negative => Literal::Bool(false),
            TokenKind::Null if !negative => Literal::Null,
            _ => return Err(self.unexpected("expected literal pattern")),
        };
        self.bump();
        Ok(self.alloc(Node::Literal { value, offset }))
    }

    fn pattern_list(
        &mut self,
        end: TokenKind<'s>,
        refutable: bool,
    ) -> Result<&'a [&'a Node<'a>], ParseError> {
        let mut items = Vec::new();
        while self.peek() != end {
            items.push(self.pattern(refutable)?);
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        Ok(self.arena.alloc_slice_copy(&items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> usize {
        let arena = Bump::new();
        parse(&arena, src).map(|stmts| stmts.len()).unwrap()
    }

    fn parse_err(src: &str) -> ParseError {
        let arena = Bump::new();
        parse(&arena, src).map(|_| ()).unwrap_err()
    }

    #[test]
    fn parses_the_scenario_programs() {
        assert_eq!(parse_ok("let x = 1 + 2 * 3; x"), 2);
        assert_eq!(parse_ok("let f = fn(a, b) a + b; f(40, 2)"), 2);
        assert_eq!(parse_ok("let acc = []; for x in 1:4 acc.append(x); acc"), 3);
        assert_eq!(parse_ok("let r = try 10 / 0 catch |e| e; r is error"), 2);
        assert_eq!(parse_ok("let mk = fn(n) fn() n; let g = mk(7); g() + g()"), 3);
        assert_eq!(parse_ok("let (a, _, b) = (1, 2, 3); a + b"), 2);
    }

    #[test]
    fn precedence_shapes_arithmetic() {
        let arena = Bump::new();
        let stmts = parse(&arena, "1 + 2 * 3").unwrap();
        match stmts[0] {
            Node::Infix { op: BinOp::Add, rhs, .. } => {
                assert!(matches!(rhs, Node::Infix { op: BinOp::Mul, .. }));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn try_binds_tighter_than_catch() {
        let arena = Bump::new();
        let stmts = parse(&arena, "try 1 / 0 catch |e| e").unwrap();
        match stmts[0] {
            Node::Catch { expr, binding, .. } => {
                assert!(matches!(expr, Node::Try { .. }));
                assert!(matches!(binding, Some(Node::Identifier { name: "e", .. })));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn range_step_nests_in_the_left_operand() {
        let arena = Bump::new();
        let stmts = parse(&arena, "1:10:2").unwrap();
        match stmts[0] {
            Node::Infix { op: BinOp::Range, lhs, .. } => {
                assert!(matches!(lhs, Node::Infix { op: BinOp::Range, .. }));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn braces_disambiguate_blocks_and_maps() {
        let arena = Bump::new();
        let stmts = parse(&arena, "{}; {a: 1, \"b\": 2}; { let x = 1; x }").unwrap();
        assert!(matches!(stmts[0], Node::Map { entries, .. } if entries.is_empty()));
        assert!(matches!(stmts[1], Node::Map { entries, .. } if entries.len() == 2));
        assert!(matches!(stmts[2], Node::Block { .. }));
    }

    #[test]
    fn method_calls_parse_as_member_suffix_calls() {
        let arena = Bump::new();
        let stmts = parse(&arena, "acc.append(x)").unwrap();
        match stmts[0] {
            Node::Suffix { op: SuffixOp::Call(args), operand, .. } => {
                assert_eq!(args.len(), 1);
                assert!(matches!(
                    operand,
                    Node::Suffix { op: SuffixOp::Member("append"), .. }
                ));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn patterns_reject_literals_in_let() {
        assert!(parse_err("let 1 = x").message.contains("binding pattern"));
        // ...but match cases accept them.
        assert_eq!(parse_ok("match (x) { 1 => 2, _ => 3 }"), 1);
    }

    #[test]
    fn match_supports_tag_error_and_sequence_patterns() {
        assert_eq!(
            parse_ok("match (x) { @some(v) => v, @none => 0, error(e) => e, (a, b) => a, let y => y }"),
            1
        );
    }

    #[test]
    fn reports_missing_semicolons() {
        let err = parse_err("let x = 1 let y = 2");
        assert!(err.message.contains(";"));
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut src = String::new();
        for _ in 0..300 {
            src.push('(');
        }
        src.push('1');
        for _ in 0..300 {
            src.push(')');
        }
        assert!(parse_err(&src).message.contains("depth"));
    }
}
