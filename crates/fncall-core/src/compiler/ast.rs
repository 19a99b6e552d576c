//! Syntax tree for wrapper units
//!
//! A unit is a flat list of items: opaque aggregate declarations, struct
//! definitions and functions. The grammar is intentionally small; it only has
//! to express "unpack a struct and call through a function pointer".

use super::span::Span;

/// A name with its location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

impl Ident {
    #[must_use]
    pub fn new(name: impl Into<String>, span: Span) -> Self {
        Self {
            name: name.into(),
            span,
        }
    }
}

/// A parsed wrapper unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Unit {
    pub items: Vec<Item>,
}

impl Unit {
    /// All function items, in source order
    pub fn functions(&self) -> impl Iterator<Item = &FunctionDecl> {
        self.items.iter().filter_map(|item| match item {
            Item::Function(func) => Some(func),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Opaque(OpaqueDecl),
    Struct(StructDecl),
    Function(FunctionDecl),
}

/// `opaque Name: size N, align N;`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueDecl {
    pub name: Ident,
    pub size: u32,
    pub align: u32,
    pub span: Span,
}

/// `struct Name { field: Type, ... }`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDecl {
    pub name: Ident,
    pub fields: Vec<FieldDecl>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    pub name: Ident,
    pub ty: TypeExpr,
}

/// `fn name(param: Type, ...) { body }`
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: Ident,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: Ident,
    pub ty: TypeExpr,
}

/// A type as written in source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeExpr {
    /// A builtin (`i32`, `ptr`, ...) or a declared struct/opaque name
    Named(Ident),
    Pointer(Box<TypeExpr>, Span),
    Function {
        params: Vec<TypeExpr>,
        variadic: bool,
        ret: Option<Box<TypeExpr>>,
        span: Span,
    },
}

impl TypeExpr {
    #[must_use]
    pub fn span(&self) -> Span {
        match self {
            TypeExpr::Named(ident) => ident.span,
            TypeExpr::Pointer(_, span) | TypeExpr::Function { span, .. } => *span,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `let name = expr;`
    Let { name: Ident, init: Expr, span: Span },
    /// `place = expr;`
    Assign { target: Expr, value: Expr, span: Span },
    /// `expr;`
    Expr(Expr),
    /// `return;`
    Return(Span),
}

impl Stmt {
    #[must_use]
    pub fn span(&self) -> Span {
        match self {
            Stmt::Let { span, .. } | Stmt::Assign { span, .. } | Stmt::Return(span) => *span,
            Stmt::Expr(expr) => expr.span,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Var(Ident),
    /// `base.field`, auto-dereferencing a struct pointer
    Field(Box<Expr>, Ident),
    Call(Box<Expr>, Vec<Expr>),
    Cast(Box<Expr>, TypeExpr),
}
