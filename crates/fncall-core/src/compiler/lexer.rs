//! Tokenizer for wrapper source

#![allow(clippy::cast_possible_truncation)] // Wrapper sources are tiny; u32 offsets are plenty

use logos::Logos;

use super::span::Span;

/// The kind of token produced by the lexer
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"([ \t\r\n]+|//[^\n]*)")]
pub enum TokenKind {
    // ========== Keywords ==========
    #[token("struct")]
    Struct,
    #[token("opaque")]
    Opaque,
    #[token("fn")]
    Fn,
    #[token("let")]
    Let,
    #[token("as")]
    As,
    #[token("return")]
    Return,

    // ========== Literals and names ==========
    #[regex(r"[0-9]+")]
    Int,
    /// `$` is accepted so debugger-reserved names survive
    #[regex(r"[A-Za-z_$][A-Za-z0-9_$]*")]
    Ident,

    // ========== Punctuation ==========
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semi,
    #[token("...")]
    Ellipsis,
    #[token(".")]
    Dot,
    #[token("=")]
    Eq,
    #[token("*")]
    Star,
    #[token("->")]
    Arrow,

    /// End of input, never produced by logos
    Eof,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TokenKind::Struct => "`struct`",
            TokenKind::Opaque => "`opaque`",
            TokenKind::Fn => "`fn`",
            TokenKind::Let => "`let`",
            TokenKind::As => "`as`",
            TokenKind::Return => "`return`",
            TokenKind::Int => "integer",
            TokenKind::Ident => "identifier",
            TokenKind::LBrace => "`{`",
            TokenKind::RBrace => "`}`",
            TokenKind::LParen => "`(`",
            TokenKind::RParen => "`)`",
            TokenKind::Comma => "`,`",
            TokenKind::Colon => "`:`",
            TokenKind::Semi => "`;`",
            TokenKind::Ellipsis => "`...`",
            TokenKind::Dot => "`.`",
            TokenKind::Eq => "`=`",
            TokenKind::Star => "`*`",
            TokenKind::Arrow => "`->`",
            TokenKind::Eof => "end of input",
        };
        f.write_str(text)
    }
}

/// A token with its kind, span, and source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    pub lexeme: String,
}

/// Tokenize `source`, returning the tokens (always ending in `Eof`) and the
/// spans of any characters that could not be lexed
#[must_use]
pub fn tokenize(source: &str) -> (Vec<Token>, Vec<Span>) {
    let mut tokens = Vec::new();
    let mut errors = Vec::new();
    let mut lexer = TokenKind::lexer(source);

    while let Some(result) = lexer.next() {
        let span = Span::from_range(lexer.span());
        match result {
            Ok(kind) => tokens.push(Token {
                kind,
                span,
                lexeme: lexer.slice().to_string(),
            }),
            Err(()) => errors.push(span),
        }
    }

    let end = source.len() as u32;
    tokens.push(Token {
        kind: TokenKind::Eof,
        span: Span::new(end, end),
        lexeme: String::new(),
    });
    (tokens, errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).0.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn struct_field_tokens() {
        assert_eq!(
            kinds("fn_ptr: fn(i32, ...) -> i32,"),
            vec![
                TokenKind::Ident,
                TokenKind::Colon,
                TokenKind::Fn,
                TokenKind::LParen,
                TokenKind::Ident,
                TokenKind::Comma,
                TokenKind::Ellipsis,
                TokenKind::RParen,
                TokenKind::Arrow,
                TokenKind::Ident,
                TokenKind::Comma,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn comments_and_whitespace_are_skipped() {
        assert_eq!(
            kinds("// header\nopaque P: size 16;\n"),
            vec![
                TokenKind::Opaque,
                TokenKind::Ident,
                TokenKind::Colon,
                TokenKind::Ident,
                TokenKind::Int,
                TokenKind::Semi,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn invalid_characters_are_reported() {
        let (tokens, errors) = tokenize("let a = #;");
        assert_eq!(errors, vec![Span::new(8, 9)]);
        assert_eq!(tokens.last().map(|t| t.kind), Some(TokenKind::Eof));
    }

    #[test]
    fn dollar_identifiers() {
        let (tokens, _) = tokenize("$__fncall_args");
        assert_eq!(tokens[0].kind, TokenKind::Ident);
        assert_eq!(tokens[0].lexeme, "$__fncall_args");
    }
}
