//! Recursive-descent parser for wrapper units

use crate::diagnostics::{Diagnostic, DiagnosticManager};

use super::ast::{
    Expr, ExprKind, FieldDecl, FunctionDecl, Ident, Item, OpaqueDecl, Param, Stmt, StructDecl,
    TypeExpr, Unit,
};
use super::lexer::{tokenize, Token, TokenKind};
use super::span::Span;

/// A parse failure; turned into a diagnostic by the caller
#[derive(Debug, Clone)]
struct ParseError {
    message: String,
    span: Span,
}

type ParseResult<T> = Result<T, ParseError>;

/// The wrapper-unit parser
pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    /// Parse a whole unit, reporting every lexical and syntactic error
    ///
    /// Returns `None` when anything was reported.
    pub fn parse_unit(source: &str, diagnostics: &mut DiagnosticManager) -> Option<Unit> {
        let (tokens, lex_errors) = tokenize(source);
        let mut had_error = false;
        for span in lex_errors {
            let text = source.get(span.as_range()).unwrap_or("?");
            diagnostics.push(Diagnostic::error(format!("unexpected character `{text}`")).with_span(span));
            had_error = true;
        }

        let mut parser = Parser {
            tokens,
            position: 0,
        };
        let mut unit = Unit::default();
        while !parser.check(TokenKind::Eof) {
            match parser.item() {
                Ok(item) => unit.items.push(item),
                Err(error) => {
                    diagnostics.push(Diagnostic::error(error.message).with_span(error.span));
                    had_error = true;
                    parser.synchronize();
                }
            }
        }

        if had_error {
            None
        } else {
            Some(unit)
        }
    }

    // ==================== Token Management ====================

    fn current(&self) -> &Token {
        // The token stream always ends in Eof and we never advance past it
        &self.tokens[self.position.min(self.tokens.len() - 1)]
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current().kind == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if token.kind != TokenKind::Eof {
            self.position += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&kind.to_string()))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let found = self.current();
        let found_text = if found.kind == TokenKind::Eof {
            found.kind.to_string()
        } else {
            format!("`{}`", found.lexeme)
        };
        ParseError {
            message: format!("expected {expected}, found {found_text}"),
            span: found.span,
        }
    }

    fn ident(&mut self) -> ParseResult<Ident> {
        let token = self.expect(TokenKind::Ident)?;
        Ok(Ident::new(token.lexeme, token.span))
    }

    /// Expect a contextual keyword spelled as an identifier
    fn keyword(&mut self, word: &str) -> ParseResult<()> {
        if self.check(TokenKind::Ident) && self.current().lexeme == word {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(&format!("`{word}`")))
        }
    }

    fn integer(&mut self) -> ParseResult<u32> {
        let token = self.expect(TokenKind::Int)?;
        token.lexeme.parse().map_err(|_| ParseError {
            message: format!("integer `{}` is out of range", token.lexeme),
            span: token.span,
        })
    }

    /// Skip to the start of the next item after an error
    fn synchronize(&mut self) {
        self.advance();
        while !matches!(
            self.current().kind,
            TokenKind::Eof | TokenKind::Struct | TokenKind::Opaque | TokenKind::Fn
        ) {
            self.advance();
        }
    }

    // ==================== Items ====================

    fn item(&mut self) -> ParseResult<Item> {
        match self.current().kind {
            TokenKind::Opaque => self.opaque_decl().map(Item::Opaque),
            TokenKind::Struct => self.struct_decl().map(Item::Struct),
            TokenKind::Fn => self.function_decl().map(Item::Function),
            _ => Err(self.unexpected("`struct`, `opaque` or `fn`")),
        }
    }

    fn opaque_decl(&mut self) -> ParseResult<OpaqueDecl> {
        let start = self.expect(TokenKind::Opaque)?.span;
        let name = self.ident()?;
        self.expect(TokenKind::Colon)?;
        self.keyword("size")?;
        let size = self.integer()?;
        self.expect(TokenKind::Comma)?;
        self.keyword("align")?;
        let align = self.integer()?;
        let end = self.expect(TokenKind::Semi)?.span;
        Ok(OpaqueDecl {
            name,
            size,
            align,
            span: start.merge(end),
        })
    }

    fn struct_decl(&mut self) -> ParseResult<StructDecl> {
        let start = self.expect(TokenKind::Struct)?.span;
        let name = self.ident()?;
        self.expect(TokenKind::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(TokenKind::RBrace) {
            let field_name = self.ident()?;
            self.expect(TokenKind::Colon)?;
            let ty = self.type_expr()?;
            fields.push(FieldDecl {
                name: field_name,
                ty,
            });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        let end = self.expect(TokenKind::RBrace)?.span;
        Ok(StructDecl {
            name,
            fields,
            span: start.merge(end),
        })
    }

    fn function_decl(&mut self) -> ParseResult<FunctionDecl> {
        let start = self.expect(TokenKind::Fn)?.span;
        let name = self.ident()?;
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        while !self.check(TokenKind::RParen) {
            let param_name = self.ident()?;
            self.expect(TokenKind::Colon)?;
            let ty = self.type_expr()?;
            params.push(Param {
                name: param_name,
                ty,
            });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::LBrace)?;
        let mut body = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            body.push(self.statement()?);
        }
        let end = self.expect(TokenKind::RBrace)?.span;
        Ok(FunctionDecl {
            name,
            params,
            body,
            span: start.merge(end),
        })
    }

    // ==================== Types ====================

    fn type_expr(&mut self) -> ParseResult<TypeExpr> {
        match self.current().kind {
            TokenKind::Star => {
                let start = self.advance().span;
                let inner = self.type_expr()?;
                let span = start.merge(inner.span());
                Ok(TypeExpr::Pointer(Box::new(inner), span))
            }
            TokenKind::Fn => {
                let start = self.advance().span;
                self.expect(TokenKind::LParen)?;
                let mut params = Vec::new();
                let mut variadic = false;
                while !self.check(TokenKind::RParen) {
                    if self.eat(TokenKind::Ellipsis) {
                        variadic = true;
                        break;
                    }
                    params.push(self.type_expr()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                let mut end = self.expect(TokenKind::RParen)?.span;
                let ret = if self.eat(TokenKind::Arrow) {
                    let ret = self.type_expr()?;
                    end = ret.span();
                    Some(Box::new(ret))
                } else {
                    None
                };
                Ok(TypeExpr::Function {
                    params,
                    variadic,
                    ret,
                    span: start.merge(end),
                })
            }
            TokenKind::Ident => Ok(TypeExpr::Named(self.ident()?)),
            _ => Err(self.unexpected("a type")),
        }
    }

    // ==================== Statements ====================

    fn statement(&mut self) -> ParseResult<Stmt> {
        match self.current().kind {
            TokenKind::Let => {
                let start = self.advance().span;
                let name = self.ident()?;
                self.expect(TokenKind::Eq)?;
                let init = self.expression()?;
                let end = self.expect(TokenKind::Semi)?.span;
                Ok(Stmt::Let {
                    name,
                    init,
                    span: start.merge(end),
                })
            }
            TokenKind::Return => {
                let start = self.advance().span;
                let end = self.expect(TokenKind::Semi)?.span;
                Ok(Stmt::Return(start.merge(end)))
            }
            _ => {
                let expr = self.expression()?;
                if self.eat(TokenKind::Eq) {
                    let value = self.expression()?;
                    let end = self.expect(TokenKind::Semi)?.span;
                    Ok(Stmt::Assign {
                        span: expr.span.merge(end),
                        target: expr,
                        value,
                    })
                } else {
                    self.expect(TokenKind::Semi)?;
                    Ok(Stmt::Expr(expr))
                }
            }
        }
    }

    // ==================== Expressions ====================

    /// `postfix ("as" type)*`
    fn expression(&mut self) -> ParseResult<Expr> {
        let mut expr = self.postfix()?;
        while self.eat(TokenKind::As) {
            let ty = self.type_expr()?;
            let span = expr.span.merge(ty.span());
            expr = Expr {
                kind: ExprKind::Cast(Box::new(expr), ty),
                span,
            };
        }
        Ok(expr)
    }

    /// `primary ("." ident | "(" args ")")*`
    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(TokenKind::Dot) {
                let field = self.ident()?;
                let span = expr.span.merge(field.span);
                expr = Expr {
                    kind: ExprKind::Field(Box::new(expr), field),
                    span,
                };
            } else if self.eat(TokenKind::LParen) {
                let mut args = Vec::new();
                while !self.check(TokenKind::RParen) {
                    args.push(self.expression()?);
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                let end = self.expect(TokenKind::RParen)?.span;
                let span = expr.span.merge(end);
                expr = Expr {
                    kind: ExprKind::Call(Box::new(expr), args),
                    span,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        if self.eat(TokenKind::LParen) {
            let inner = self.expression()?;
            self.expect(TokenKind::RParen)?;
            return Ok(inner);
        }
        let ident = self.ident().map_err(|_| self.unexpected("an expression"))?;
        Ok(Expr {
            span: ident.span,
            kind: ExprKind::Var(ident),
        })
    }
}
