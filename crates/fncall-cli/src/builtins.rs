//! Demo functions callable from the command line, plus type and value parsing

use anyhow::{anyhow, bail, Context, Result};
use fncall_core::types::{FloatType, IntType};
use fncall_core::{CType, FunctionSignature, Value};

extern "C" fn add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

extern "C" fn mul_add(a: f64, b: f64, c: f64) -> f64 {
    a.mul_add(b, c)
}

extern "C" fn scale(value: i64, factor: f32) -> f64 {
    value as f64 * f64::from(factor)
}

extern "C" fn is_even(value: i64) -> bool {
    value % 2 == 0
}

extern "C" fn noop() {}

/// A function compiled into this binary
pub struct Builtin {
    pub name: &'static str,
    pub about: &'static str,
    ret: CType,
    params: Vec<CType>,
    address: usize,
}

impl Builtin {
    pub fn signature(&self) -> FunctionSignature {
        FunctionSignature::new(self.ret.clone(), self.params.clone(), self.address as u64)
    }
}

pub fn all() -> Vec<Builtin> {
    vec![
        Builtin {
            name: "add",
            about: "wrapping sum of two i32",
            ret: CType::I32,
            params: vec![CType::I32, CType::I32],
            address: add as usize,
        },
        Builtin {
            name: "mul_add",
            about: "a * b + c",
            ret: CType::F64,
            params: vec![CType::F64, CType::F64, CType::F64],
            address: mul_add as usize,
        },
        Builtin {
            name: "scale",
            about: "an i64 scaled by an f32",
            ret: CType::F64,
            params: vec![CType::I64, CType::F32],
            address: scale as usize,
        },
        Builtin {
            name: "is_even",
            about: "whether an i64 is even",
            ret: CType::Bool,
            params: vec![CType::I64],
            address: is_even as usize,
        },
        Builtin {
            name: "noop",
            about: "does nothing",
            ret: CType::Void,
            params: vec![],
            address: noop as usize,
        },
    ]
}

pub fn find(name: &str) -> Result<Builtin> {
    all()
        .into_iter()
        .find(|b| b.name == name)
        .ok_or_else(|| anyhow!("unknown builtin `{name}` (see `fncall builtins`)"))
}

/// Parse a type name as the wrapper language spells it
pub fn parse_type(text: &str) -> Result<CType> {
    let text = text.trim();
    if let Some(pointee) = text.strip_prefix('*') {
        return Ok(CType::pointer_to(parse_type(pointee)?));
    }
    Ok(match text {
        "void" => CType::Void,
        "bool" => CType::Bool,
        "ptr" => CType::void_ptr(),
        "i8" => CType::Int(IntType::I8),
        "i16" => CType::Int(IntType::I16),
        "i32" => CType::Int(IntType::I32),
        "i64" => CType::Int(IntType::I64),
        "u8" => CType::Int(IntType::U8),
        "u16" => CType::Int(IntType::U16),
        "u32" => CType::Int(IntType::U32),
        "u64" => CType::Int(IntType::U64),
        "f32" => CType::Float(FloatType::F32),
        "f64" => CType::Float(FloatType::F64),
        other => bail!("unknown type `{other}`"),
    })
}

/// Parse a signature like `i32(i32, *u8, ...)`
pub fn parse_signature(text: &str, address: u64) -> Result<FunctionSignature> {
    let open = text
        .find('(')
        .ok_or_else(|| anyhow!("expected `ret(params)`, found `{text}`"))?;
    let inner = text[open + 1..]
        .trim_end()
        .strip_suffix(')')
        .ok_or_else(|| anyhow!("missing `)` in `{text}`"))?;
    let ret = parse_type(&text[..open])?;

    let mut params = Vec::new();
    let mut variadic = false;
    for part in inner.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if variadic {
            bail!("`...` must come last");
        }
        if part == "..." {
            variadic = true;
        } else {
            params.push(parse_type(part)?);
        }
    }

    let signature = FunctionSignature::new(ret, params, address);
    Ok(if variadic { signature.variadic() } else { signature })
}

/// Parse a command-line argument as a value of type `ty`
pub fn parse_value(text: &str, ty: &CType) -> Result<Value> {
    let bad = || format!("`{text}` is not a valid {ty}");
    let value = match ty {
        CType::Bool => Value::Bool(text.parse().with_context(bad)?),
        CType::Int(IntType::I8) => Value::I8(text.parse().with_context(bad)?),
        CType::Int(IntType::I16) => Value::I16(text.parse().with_context(bad)?),
        CType::Int(IntType::I32) => Value::I32(text.parse().with_context(bad)?),
        CType::Int(IntType::I64) => Value::I64(text.parse().with_context(bad)?),
        CType::Int(IntType::U8) => Value::U8(text.parse().with_context(bad)?),
        CType::Int(IntType::U16) => Value::U16(text.parse().with_context(bad)?),
        CType::Int(IntType::U32) => Value::U32(text.parse().with_context(bad)?),
        CType::Int(IntType::U64) => Value::U64(text.parse().with_context(bad)?),
        CType::Float(FloatType::F32) => Value::F32(text.parse().with_context(bad)?),
        CType::Float(FloatType::F64) => Value::F64(text.parse().with_context(bad)?),
        CType::Pointer(pointee) => {
            let digits = text.strip_prefix("0x").unwrap_or(text);
            Value::Pointer {
                pointee: (**pointee).clone(),
                address: u64::from_str_radix(digits, 16).with_context(bad)?,
            }
        }
        other => bail!("cannot pass a {other} from the command line"),
    };
    Ok(value)
}
