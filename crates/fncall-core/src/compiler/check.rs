//! Type checking, record layout and lowering to a typed body
//!
//! The checker resolves every type name, computes C-style record layouts for
//! the target's pointer width, and type-checks the wrapper body. Its output is
//! a typed tree with field offsets already resolved, which is all code
//! generation needs.

use std::collections::HashMap;

use crate::diagnostics::{Diagnostic, DiagnosticManager};
use crate::types::{CType, FloatType, FunctionType, IntType, RecordType};

use super::ast::{Expr, ExprKind, FunctionDecl, Ident, Item, Stmt, TypeExpr, Unit};
use super::span::Span;
use super::{ExternalDecl, TypeSystemHelper};

/// A field inside a compiled record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    pub ty: CType,
    pub offset: u32,
    pub size: u32,
    pub align: u32,
}

/// A record as laid out by the compiler
///
/// Opaque declarations have a size and alignment but no fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    pub name: String,
    pub size: u32,
    pub align: u32,
    pub fields: Vec<FieldLayout>,
}

impl RecordLayout {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn as_type(&self) -> RecordType {
        RecordType::new(self.name.clone(), self.size, self.align)
    }
}

/// A type-checked expression
#[derive(Debug, Clone)]
pub(crate) struct TExpr {
    pub ty: CType,
    pub kind: TExprKind,
}

#[derive(Debug, Clone)]
pub(crate) enum TExprKind {
    /// The wrapper's single parameter
    Param,
    Local(usize),
    /// Load `ty` from `base + offset`
    Load { base: Box<TExpr>, offset: u32 },
    Call {
        callee: Box<TExpr>,
        func: FunctionType,
        args: Vec<TExpr>,
    },
    /// Implicit integer width/sign conversion or pointer reinterpretation
    Convert(Box<TExpr>),
}

#[derive(Debug, Clone)]
pub(crate) enum TStmt {
    Let(usize, TExpr),
    Store {
        base: TExpr,
        offset: u32,
        value: TExpr,
    },
    /// Call a function returning a record straight into `base + offset`
    StoreCall {
        base: TExpr,
        offset: u32,
        call: TExpr,
    },
    Eval(TExpr),
    Return,
}

/// The checked wrapper function
#[derive(Debug, Clone)]
pub(crate) struct CheckedFunction {
    pub name: String,
    pub body: Vec<TStmt>,
}

/// Output of the checker
#[derive(Debug, Clone)]
pub(crate) struct CheckedUnit {
    pub records: Vec<RecordLayout>,
    pub wrapper: CheckedFunction,
}

/// How one type converts to another at a call or store
enum Conversion {
    Identity,
    /// Allowed, but worth a warning
    Implicit,
    Incompatible,
}

fn convertibility(from: &CType, to: &CType) -> Conversion {
    if from == to {
        return Conversion::Identity;
    }
    match (from, to) {
        (CType::Int(_), CType::Int(_)) => Conversion::Implicit,
        (CType::Pointer(a), CType::Pointer(b)) if a.is_void() || b.is_void() => Conversion::Identity,
        (CType::Pointer(_), CType::Pointer(_)) => Conversion::Implicit,
        // A function type already denotes a pointer to code
        (CType::Pointer(pointee), func @ CType::Function(_))
        | (func @ CType::Function(_), CType::Pointer(pointee))
            if pointee.is_void() || pointee.as_ref() == func =>
        {
            Conversion::Identity
        }
        _ => Conversion::Incompatible,
    }
}

/// Round `value` up to a multiple of `align`, or `None` on overflow
fn align_to(value: u32, align: u32) -> Option<u32> {
    let align = align.max(1);
    value.div_ceil(align).checked_mul(align)
}

struct Checker<'a> {
    pointer_size: u32,
    helper: &'a dyn TypeSystemHelper,
    diagnostics: &'a mut DiagnosticManager,
    records: HashMap<String, RecordLayout>,
    order: Vec<String>,
    errors: usize,
}

/// Check `unit` for a target with `pointer_size`-byte pointers
///
/// Returns `None` when any error was reported.
pub(crate) fn check_unit(
    unit: &Unit,
    pointer_size: u32,
    helper: &dyn TypeSystemHelper,
    diagnostics: &mut DiagnosticManager,
) -> Option<CheckedUnit> {
    let mut checker = Checker {
        pointer_size,
        helper,
        diagnostics,
        records: HashMap::new(),
        order: Vec::new(),
        errors: 0,
    };
    checker.declare_records(unit);

    let mut functions = unit.functions();
    let wrapper = match (functions.next(), functions.next()) {
        (Some(func), None) => checker.check_function(func),
        (None, _) => {
            checker.error(Diagnostic::error("wrapper unit defines no function"));
            None
        }
        (Some(_), Some(extra)) => {
            checker.error(
                Diagnostic::error("wrapper unit must define exactly one function")
                    .with_span(extra.name.span),
            );
            None
        }
    };

    if checker.errors > 0 {
        return None;
    }
    let wrapper = wrapper?;
    let records = checker
        .order
        .iter()
        .filter_map(|name| checker.records.get(name).cloned())
        .collect();
    Some(CheckedUnit { records, wrapper })
}

impl Checker<'_> {
    fn error(&mut self, diagnostic: Diagnostic) {
        self.errors += 1;
        self.diagnostics.push(diagnostic);
    }

    fn insert_record(&mut self, record: RecordLayout) {
        self.order.push(record.name.clone());
        self.records.insert(record.name.clone(), record);
    }

    // ==================== Records ====================

    fn declare_records(&mut self, unit: &Unit) {
        for item in &unit.items {
            match item {
                Item::Opaque(decl) => {
                    if self.records.contains_key(&decl.name.name) {
                        self.error(
                            Diagnostic::error(format!("type `{}` is defined twice", decl.name.name))
                                .with_span(decl.name.span),
                        );
                        continue;
                    }
                    if decl.align == 0 || !decl.align.is_power_of_two() {
                        self.error(
                            Diagnostic::error(format!(
                                "alignment of `{}` must be a power of two, found {}",
                                decl.name.name, decl.align
                            ))
                            .with_span(decl.span),
                        );
                        continue;
                    }
                    self.insert_record(RecordLayout {
                        name: decl.name.name.clone(),
                        size: decl.size,
                        align: decl.align,
                        fields: Vec::new(),
                    });
                }
                Item::Struct(decl) => {
                    if self.records.contains_key(&decl.name.name) {
                        self.error(
                            Diagnostic::error(format!("type `{}` is defined twice", decl.name.name))
                                .with_span(decl.name.span),
                        );
                        continue;
                    }
                    let mut fields: Vec<FieldLayout> = Vec::new();
                    let mut offset: Option<u32> = Some(0);
                    let mut align = 1;
                    for field in &decl.fields {
                        if fields.iter().any(|f| f.name == field.name.name) {
                            self.error(
                                Diagnostic::error(format!(
                                    "field `{}` is already declared",
                                    field.name.name
                                ))
                                .with_span(field.name.span),
                            );
                            continue;
                        }
                        let Some(ty) = self.resolve_type(&field.ty) else {
                            continue;
                        };
                        let Some((size, field_align)) = self.size_align(&ty, field.ty.span()) else {
                            continue;
                        };
                        let Some(field_offset) = offset.and_then(|o| align_to(o, field_align)) else {
                            offset = None;
                            break;
                        };
                        fields.push(FieldLayout {
                            name: field.name.name.clone(),
                            ty,
                            offset: field_offset,
                            size,
                            align: field_align,
                        });
                        offset = field_offset.checked_add(size);
                        align = align.max(field_align);
                    }
                    let Some(size) = offset.and_then(|o| align_to(o, align)) else {
                        self.error(
                            Diagnostic::error(format!("record `{}` is too large", decl.name.name))
                                .with_span(decl.name.span),
                        );
                        continue;
                    };
                    self.insert_record(RecordLayout {
                        name: decl.name.name.clone(),
                        size,
                        align,
                        fields,
                    });
                }
                Item::Function(_) => {}
            }
        }
    }

    fn size_align(&mut self, ty: &CType, span: Span) -> Option<(u32, u32)> {
        match ty {
            CType::Bool => Some((1, 1)),
            CType::Int(int) => Some((int.bytes(), int.bytes())),
            CType::Float(float) => Some((float.bytes(), float.bytes())),
            CType::Pointer(_) | CType::Function(_) => Some((self.pointer_size, self.pointer_size)),
            CType::Record(record) => Some((record.size, record.align)),
            CType::Void => {
                self.error(Diagnostic::error("field cannot have type `void`").with_span(span));
                None
            }
        }
    }

    // ==================== Types ====================

    fn resolve_type(&mut self, ty: &TypeExpr) -> Option<CType> {
        match ty {
            TypeExpr::Named(ident) => self.resolve_named(ident),
            TypeExpr::Pointer(inner, _) => Some(CType::pointer_to(self.resolve_type(inner)?)),
            TypeExpr::Function {
                params,
                variadic,
                ret,
                ..
            } => {
                let mut resolved = Vec::with_capacity(params.len());
                let mut ok = true;
                for param in params {
                    match self.resolve_type(param) {
                        Some(CType::Record(record)) => {
                            self.by_value_error(&record, param.span());
                            ok = false;
                        }
                        Some(CType::Void) => {
                            self.error(
                                Diagnostic::error("parameter cannot have type `void`")
                                    .with_span(param.span()),
                            );
                            ok = false;
                        }
                        Some(ty) => resolved.push(ty),
                        None => ok = false,
                    }
                }
                // Records may be returned; the call writes them through memory
                let ret = match ret {
                    Some(ret) => self.resolve_type(ret)?,
                    None => CType::Void,
                };
                ok.then(|| {
                    CType::Function(Box::new(FunctionType {
                        ret,
                        params: resolved,
                        variadic: *variadic,
                    }))
                })
            }
        }
    }

    fn by_value_error(&mut self, record: &RecordType, span: Span) {
        self.error(
            Diagnostic::error(format!(
                "aggregate `{}` cannot be passed by value",
                record.name
            ))
            .with_span(span)
            .with_hint(format!("pass `*{}` instead", record.name)),
        );
    }

    fn unstored_record_error(&mut self, record: &RecordType, span: Span) {
        self.error(
            Diagnostic::error(format!(
                "a returned `{}` must be assigned to a field of type `{}`",
                record.name, record.name
            ))
            .with_span(span),
        );
    }

    fn resolve_named(&mut self, ident: &Ident) -> Option<CType> {
        let builtin = match ident.name.as_str() {
            "void" => Some(CType::Void),
            "bool" => Some(CType::Bool),
            "i8" => Some(CType::Int(IntType::I8)),
            "i16" => Some(CType::Int(IntType::I16)),
            "i32" => Some(CType::Int(IntType::I32)),
            "i64" => Some(CType::Int(IntType::I64)),
            "u8" => Some(CType::Int(IntType::U8)),
            "u16" => Some(CType::Int(IntType::U16)),
            "u32" => Some(CType::Int(IntType::U32)),
            "u64" => Some(CType::Int(IntType::U64)),
            "f32" => Some(CType::Float(FloatType::F32)),
            "f64" => Some(CType::Float(FloatType::F64)),
            "ptr" => Some(CType::void_ptr()),
            _ => None,
        };
        if builtin.is_some() {
            return builtin;
        }
        if let Some(record) = self.records.get(&ident.name) {
            return Some(CType::Record(record.as_type()));
        }
        if let Some(ExternalDecl::Opaque { size, align }) = self.helper.resolve_external(&ident.name) {
            let record = RecordLayout {
                name: ident.name.clone(),
                size,
                align,
                fields: Vec::new(),
            };
            let ty = CType::Record(record.as_type());
            self.insert_record(record);
            return Some(ty);
        }
        self.error(
            Diagnostic::error(format!("unknown type `{}`", ident.name))
                .with_span(ident.span)
                .with_hint("declare it with `opaque Name: size N, align N;`"),
        );
        None
    }

    // ==================== Function Bodies ====================

    fn check_function(&mut self, func: &FunctionDecl) -> Option<CheckedFunction> {
        let param = match func.params.as_slice() {
            [param] => param,
            _ => {
                self.error(
                    Diagnostic::error(format!(
                        "wrapper function must take exactly one parameter, found {}",
                        func.params.len()
                    ))
                    .with_span(func.name.span),
                );
                return None;
            }
        };
        let param_ty = self.resolve_type(&param.ty)?;
        if !param_ty.is_pointer() {
            self.error(
                Diagnostic::error(format!(
                    "wrapper parameter must be a pointer, found `{param_ty}`"
                ))
                .with_span(param.ty.span()),
            );
            return None;
        }

        let mut scope = Scope {
            param: (param.name.name.clone(), param_ty),
            locals: Vec::new(),
        };
        let mut body = Vec::new();
        let mut returned = false;
        for stmt in &func.body {
            if returned {
                self.diagnostics
                    .push(Diagnostic::warning("unreachable statement").with_span(stmt.span()));
                break;
            }
            match self.check_stmt(stmt, &mut scope) {
                Some(TStmt::Return) => {
                    returned = true;
                    body.push(TStmt::Return);
                }
                Some(checked) => body.push(checked),
                None => {}
            }
        }

        Some(CheckedFunction {
            name: func.name.name.clone(),
            body,
        })
    }

    fn check_stmt(&mut self, stmt: &Stmt, scope: &mut Scope) -> Option<TStmt> {
        match stmt {
            Stmt::Let { name, init, .. } => {
                let init = self.check_expr(init, scope)?;
                if let CType::Record(record) = &init.ty {
                    self.unstored_record_error(record, name.span);
                    return None;
                }
                if init.ty.is_void() {
                    self.error(
                        Diagnostic::error(format!("`{}` would have type `void`", name.name))
                            .with_span(name.span),
                    );
                    return None;
                }
                let index = scope.locals.len();
                scope.locals.push((name.name.clone(), init.ty.clone()));
                Some(TStmt::Let(index, init))
            }
            Stmt::Assign { target, value, .. } => {
                let ExprKind::Field(base, field) = &target.kind else {
                    self.error(
                        Diagnostic::error("only struct fields can be assigned").with_span(target.span),
                    );
                    return None;
                };
                let base = self.check_expr(base, scope)?;
                let (field_ty, offset) = self.field_of(&base.ty, field)?;
                let value_expr = self.check_expr(value, scope)?;
                if matches!(value_expr.ty, CType::Record(_)) && value_expr.ty == field_ty {
                    return Some(TStmt::StoreCall {
                        base,
                        offset,
                        call: value_expr,
                    });
                }
                let value = self.coerce(value_expr, &field_ty, value.span)?;
                Some(TStmt::Store {
                    base,
                    offset,
                    value,
                })
            }
            Stmt::Expr(expr) => {
                let checked = self.check_expr(expr, scope)?;
                if let CType::Record(record) = &checked.ty {
                    self.unstored_record_error(record, expr.span);
                    return None;
                }
                if !matches!(checked.kind, TExprKind::Call { .. }) {
                    self.diagnostics
                        .push(Diagnostic::warning("expression result is unused").with_span(expr.span));
                }
                Some(TStmt::Eval(checked))
            }
            Stmt::Return(_) => Some(TStmt::Return),
        }
    }

    fn check_expr(&mut self, expr: &Expr, scope: &Scope) -> Option<TExpr> {
        match &expr.kind {
            ExprKind::Var(ident) => match scope.lookup(&ident.name) {
                Some((kind, ty)) => Some(TExpr { ty, kind }),
                None => {
                    self.error(
                        Diagnostic::error(format!("cannot find value `{}`", ident.name))
                            .with_span(ident.span),
                    );
                    None
                }
            },
            ExprKind::Cast(inner, ty) => {
                let value = self.check_expr(inner, scope)?;
                let target = self.resolve_type(ty)?;
                if !value.ty.is_pointer() || !target.is_pointer() {
                    self.error(
                        Diagnostic::error(format!(
                            "cannot cast `{}` as `{target}`; only pointer casts are allowed",
                            value.ty
                        ))
                        .with_span(expr.span),
                    );
                    return None;
                }
                Some(TExpr {
                    ty: target,
                    kind: TExprKind::Convert(Box::new(value)),
                })
            }
            ExprKind::Field(base, field) => {
                let base = self.check_expr(base, scope)?;
                let (ty, offset) = self.field_of(&base.ty, field)?;
                if let CType::Record(record) = &ty {
                    self.by_value_error(record, field.span);
                    return None;
                }
                Some(TExpr {
                    ty,
                    kind: TExprKind::Load {
                        base: Box::new(base),
                        offset,
                    },
                })
            }
            ExprKind::Call(callee, args) => {
                let callee_expr = self.check_expr(callee, scope)?;
                let CType::Function(func) = callee_expr.ty.clone() else {
                    self.error(
                        Diagnostic::error(format!(
                            "`{}` is not a function pointer",
                            callee_expr.ty
                        ))
                        .with_span(callee.span),
                    );
                    return None;
                };
                let fixed = func.params.len();
                let arity_ok = if func.variadic {
                    args.len() >= fixed
                } else {
                    args.len() == fixed
                };
                if !arity_ok {
                    let expected = if func.variadic {
                        format!("at least {fixed}")
                    } else {
                        fixed.to_string()
                    };
                    self.error(
                        Diagnostic::error(format!(
                            "this function takes {expected} argument{} but {} argument{} supplied",
                            if fixed == 1 { "" } else { "s" },
                            args.len(),
                            if args.len() == 1 { " was" } else { "s were" }
                        ))
                        .with_span(expr.span),
                    );
                    return None;
                }

                let mut checked_args = Vec::with_capacity(args.len());
                let mut ok = true;
                for (i, arg) in args.iter().enumerate() {
                    let Some(value) = self.check_expr(arg, scope) else {
                        ok = false;
                        continue;
                    };
                    let converted = match func.params.get(i) {
                        Some(param) => self.coerce(value, param, arg.span),
                        None => Some(value),
                    };
                    match converted {
                        Some(value) => checked_args.push(value),
                        None => ok = false,
                    }
                }
                if !ok {
                    return None;
                }
                Some(TExpr {
                    ty: func.ret.clone(),
                    kind: TExprKind::Call {
                        callee: Box::new(callee_expr),
                        func: *func,
                        args: checked_args,
                    },
                })
            }
        }
    }

    fn field_of(&mut self, base: &CType, field: &Ident) -> Option<(CType, u32)> {
        let record_name = match base {
            CType::Pointer(inner) => match inner.as_ref() {
                CType::Record(record) => Some(record.name.clone()),
                _ => None,
            },
            _ => None,
        };
        let Some(record_name) = record_name else {
            self.error(
                Diagnostic::error(format!(
                    "field access requires a pointer to a struct, found `{base}`"
                ))
                .with_span(field.span),
            );
            return None;
        };
        let found = self
            .records
            .get(&record_name)
            .and_then(|record| record.field(&field.name))
            .map(|f| (f.ty.clone(), f.offset));
        if found.is_none() {
            self.error(
                Diagnostic::error(format!(
                    "no field `{}` on type `{record_name}`",
                    field.name
                ))
                .with_span(field.span),
            );
        }
        found
    }

    fn coerce(&mut self, value: TExpr, to: &CType, span: Span) -> Option<TExpr> {
        match convertibility(&value.ty, to) {
            Conversion::Identity if value.ty == *to => Some(value),
            Conversion::Identity => Some(TExpr {
                ty: to.clone(),
                kind: TExprKind::Convert(Box::new(value)),
            }),
            Conversion::Implicit => {
                self.diagnostics.push(
                    Diagnostic::warning(format!(
                        "implicit conversion from `{}` to `{to}`",
                        value.ty
                    ))
                    .with_span(span),
                );
                Some(TExpr {
                    ty: to.clone(),
                    kind: TExprKind::Convert(Box::new(value)),
                })
            }
            Conversion::Incompatible => {
                self.error(
                    Diagnostic::error(format!(
                        "mismatched types: expected `{to}`, found `{}`",
                        value.ty
                    ))
                    .with_span(span),
                );
                None
            }
        }
    }
}

struct Scope {
    param: (String, CType),
    locals: Vec<(String, CType)>,
}

impl Scope {
    /// Later bindings shadow earlier ones
    fn lookup(&self, name: &str) -> Option<(TExprKind, CType)> {
        if let Some((index, (_, ty))) = self
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, (local, _))| local == name)
        {
            return Some((TExprKind::Local(index), ty.clone()));
        }
        (self.param.0 == name).then(|| (TExprKind::Param, self.param.1.clone()))
    }
}
