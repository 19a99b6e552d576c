//! Semantic type descriptors for called functions
//!
//! These describe argument, return and pointee types the way a debugger's
//! type system sees them. They carry no layout: sizes and offsets are the
//! compiler's business and come back through the extracted struct layout.

use std::fmt;

/// Fixed-width integer kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl IntType {
    /// Width in bits
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            IntType::I8 | IntType::U8 => 8,
            IntType::I16 | IntType::U16 => 16,
            IntType::I32 | IntType::U32 => 32,
            IntType::I64 | IntType::U64 => 64,
        }
    }

    /// Width in bytes
    #[must_use]
    pub const fn bytes(self) -> u32 {
        self.bits() / 8
    }

    #[must_use]
    pub const fn is_signed(self) -> bool {
        matches!(self, IntType::I8 | IntType::I16 | IntType::I32 | IntType::I64)
    }

    /// Spelling in wrapper source
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            IntType::I8 => "i8",
            IntType::I16 => "i16",
            IntType::I32 => "i32",
            IntType::I64 => "i64",
            IntType::U8 => "u8",
            IntType::U16 => "u16",
            IntType::U32 => "u32",
            IntType::U64 => "u64",
        }
    }
}

/// IEEE floating-point kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatType {
    F32,
    F64,
}

impl FloatType {
    #[must_use]
    pub const fn bytes(self) -> u32 {
        match self {
            FloatType::F32 => 4,
            FloatType::F64 => 8,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FloatType::F32 => "f32",
            FloatType::F64 => "f64",
        }
    }
}

/// An aggregate whose contents the facility never interprets
///
/// Only its size and alignment are known. Aggregates cross the call boundary
/// by reference: the bytes live elsewhere in target memory and the argument
/// slot holds their address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordType {
    pub name: String,
    pub size: u32,
    pub align: u32,
}

impl RecordType {
    #[must_use]
    pub fn new(name: impl Into<String>, size: u32, align: u32) -> Self {
        Self {
            name: name.into(),
            size,
            align,
        }
    }
}

/// The type of a callable function
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub ret: CType,
    pub params: Vec<CType>,
    pub variadic: bool,
}

/// A semantic type descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CType {
    Void,
    Bool,
    Int(IntType),
    Float(FloatType),
    /// Pointer to a type; `Pointer(Void)` is the untyped pointer
    Pointer(Box<CType>),
    Function(Box<FunctionType>),
    Record(RecordType),
}

impl CType {
    pub const I8: CType = CType::Int(IntType::I8);
    pub const I16: CType = CType::Int(IntType::I16);
    pub const I32: CType = CType::Int(IntType::I32);
    pub const I64: CType = CType::Int(IntType::I64);
    pub const U8: CType = CType::Int(IntType::U8);
    pub const U16: CType = CType::Int(IntType::U16);
    pub const U32: CType = CType::Int(IntType::U32);
    pub const U64: CType = CType::Int(IntType::U64);
    pub const F32: CType = CType::Float(FloatType::F32);
    pub const F64: CType = CType::Float(FloatType::F64);

    /// The untyped pointer
    #[must_use]
    pub fn void_ptr() -> Self {
        CType::Pointer(Box::new(CType::Void))
    }

    #[must_use]
    pub fn pointer_to(pointee: CType) -> Self {
        CType::Pointer(Box::new(pointee))
    }

    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, CType::Void)
    }

    #[must_use]
    pub fn is_pointer(&self) -> bool {
        matches!(self, CType::Pointer(_))
    }

    /// Integers, floats, bools and pointers: anything that fits a register
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            CType::Bool | CType::Int(_) | CType::Float(_) | CType::Pointer(_)
        )
    }

    /// Collect every record type mentioned anywhere in this type
    pub fn collect_records<'a>(&'a self, out: &mut Vec<&'a RecordType>) {
        match self {
            CType::Record(record) => {
                if !out.iter().any(|r| r.name == record.name) {
                    out.push(record);
                }
            }
            CType::Pointer(inner) => inner.collect_records(out),
            CType::Function(func) => {
                func.ret.collect_records(out);
                for param in &func.params {
                    param.collect_records(out);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CType::Void => write!(f, "void"),
            CType::Bool => write!(f, "bool"),
            CType::Int(int) => write!(f, "{}", int.name()),
            CType::Float(float) => write!(f, "{}", float.name()),
            CType::Pointer(inner) if inner.is_void() => write!(f, "ptr"),
            CType::Pointer(inner) => write!(f, "*{inner}"),
            CType::Function(func) => {
                write!(f, "fn(")?;
                for (i, param) in func.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{param}")?;
                }
                if func.variadic {
                    if func.params.is_empty() {
                        write!(f, "...")?;
                    } else {
                        write!(f, ", ...")?;
                    }
                }
                write!(f, ")")?;
                if !func.ret.is_void() {
                    write!(f, " -> {}", func.ret)?;
                }
                Ok(())
            }
            CType::Record(record) => write!(f, "{}", record.name),
        }
    }
}

/// The function a caller is bound to
///
/// Immutable once built. One caller serves exactly one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    pub return_type: CType,
    pub params: Vec<CType>,
    pub variadic: bool,
    /// Entry address of the function in the target
    pub address: u64,
}

impl FunctionSignature {
    #[must_use]
    pub fn new(return_type: CType, params: Vec<CType>, address: u64) -> Self {
        Self {
            return_type,
            params,
            variadic: false,
            address,
        }
    }

    /// Mark the function as taking variadic arguments after `params`
    #[must_use]
    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    /// The function's type, as the wrapper's function pointer slot sees it
    #[must_use]
    pub fn function_type(&self) -> FunctionType {
        FunctionType {
            ret: self.return_type.clone(),
            params: self.params.clone(),
            variadic: self.variadic,
        }
    }
}
