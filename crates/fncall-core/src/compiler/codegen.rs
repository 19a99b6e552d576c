//! Cranelift code generation for checked wrappers
//!
//! The wrapper is lowered straight to SSA values: it has no control flow and
//! every local is bound exactly once, so no variable bookkeeping is needed.
//! Code is emitted into a fresh [`JITModule`] per wrapper and stays mapped for
//! as long as the returned [`CompiledWrapper`] lives.

use std::sync::Arc;

use cranelift_codegen::ir::{
    types, AbiParam, ArgumentPurpose, Endianness, InstBuilder, MemFlags, Signature, Type,
    UserFuncName, Value,
};
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::diagnostics::DiagnosticManager;
use crate::target::{ByteOrder, TargetInfo};
use crate::types::{CType, FloatType, FunctionType};
use crate::wrapper::WrapperSource;

use super::check::{check_unit, CheckedFunction, TExpr, TExprKind, TStmt};
use super::parser::Parser;
use super::{CompiledWrapper, TypeSystemHelper, WrapperCompiler};

/// Errors raised by the backend itself, as opposed to problems in the source
#[derive(Debug, Clone, Error)]
pub enum JitError {
    /// Host machine not supported by Cranelift
    #[error("host machine is not supported: {0}")]
    UnsupportedHost(String),

    /// Invalid code generator setting
    #[error("invalid code generator setting: {0}")]
    Settings(String),

    /// Cranelift compilation error
    #[error("Cranelift compilation error: {0}")]
    Cranelift(String),

    /// The target process does not match the host this code runs on
    #[error("target ({target}) does not match the host ISA ({host})")]
    TargetMismatch { target: String, host: String },

    /// A construct the backend cannot lower
    #[error("unsupported in generated code: {0}")]
    Unsupported(String),
}

type JitResult<T> = Result<T, JitError>;

/// Largest aggregate a C ABI may return in registers
///
/// Larger ones are returned through a caller-supplied buffer on every ABI
/// Cranelift targets, which is the only form lowered here.
const REGISTER_RETURN_LIMIT: u32 = 16;

/// Cranelift optimization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    fn as_setting(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// Code generator settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenOptions {
    pub opt_level: OptLevel,
    /// Run the Cranelift IR verifier on every wrapper
    pub verify: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Speed,
            verify: true,
        }
    }
}

/// Compiles wrappers to native code in the current process
#[derive(Debug, Clone, Default)]
pub struct JitCompiler {
    options: CodegenOptions,
}

impl JitCompiler {
    #[must_use]
    pub fn new(options: CodegenOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn options(&self) -> &CodegenOptions {
        &self.options
    }

    fn build_isa(&self) -> JitResult<Arc<dyn TargetIsa>> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", self.options.opt_level.as_setting())
            .map_err(|e| JitError::Settings(e.to_string()))?;
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| JitError::Settings(e.to_string()))?;
        let verifier = if self.options.verify { "true" } else { "false" };
        flag_builder
            .set("enable_verifier", verifier)
            .map_err(|e| JitError::Settings(e.to_string()))?;

        let isa_builder =
            cranelift_native::builder().map_err(|msg| JitError::UnsupportedHost(msg.to_string()))?;
        isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::Cranelift(e.to_string()))
    }

    /// Generated code runs in this process, so the target must look like the host
    fn check_target(isa: &dyn TargetIsa, target: &TargetInfo) -> JitResult<()> {
        let host_order = match isa.endianness() {
            Endianness::Big => ByteOrder::Big,
            Endianness::Little => ByteOrder::Little,
        };
        let host_pointer = u32::from(isa.pointer_bytes());
        if host_pointer != target.pointer_size || host_order != target.byte_order {
            return Err(JitError::TargetMismatch {
                target: target.to_string(),
                host: TargetInfo::new(host_pointer, host_order).to_string(),
            });
        }
        Ok(())
    }

    fn emit(
        isa: Arc<dyn TargetIsa>,
        wrapper: &CheckedFunction,
    ) -> JitResult<(JITModule, u64, String)> {
        let mut module = JITModule::new(JITBuilder::with_isa(
            isa,
            cranelift_module::default_libcall_names(),
        ));
        let pointer_type = module.target_config().pointer_type();

        let mut sig = module.make_signature();
        sig.params.push(AbiParam::new(pointer_type));
        let func_id = module
            .declare_function(&wrapper.name, Linkage::Export, &sig)
            .map_err(|e| JitError::Cranelift(e.to_string()))?;

        let mut ctx = module.make_context();
        ctx.func.signature = sig;
        ctx.func.name = UserFuncName::user(0, func_id.as_u32());
        let mut builder_ctx = FunctionBuilderContext::new();

        {
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);
            builder.seal_block(entry);
            let param = builder.block_params(entry)[0];

            let call_conv = module.isa().default_call_conv();
            let mut lowering = FunctionLowering {
                builder: &mut builder,
                pointer_type,
                call_conv,
                param,
                locals: Vec::new(),
            };
            lowering.lower_body(&wrapper.body)?;
            builder.finalize();
        }

        let ir = ctx.func.display().to_string();
        trace!(function = %wrapper.name, "wrapper IR:\n{ir}");

        module
            .define_function(func_id, &mut ctx)
            .map_err(|e| JitError::Cranelift(e.to_string()))?;
        module.clear_context(&mut ctx);
        module
            .finalize_definitions()
            .map_err(|e| JitError::Cranelift(e.to_string()))?;

        let entry = module.get_finalized_function(func_id) as u64;
        Ok((module, entry, ir))
    }
}

impl WrapperCompiler for JitCompiler {
    fn compile(
        &self,
        source: &WrapperSource,
        target: &TargetInfo,
        helper: &dyn TypeSystemHelper,
        diagnostics: &mut DiagnosticManager,
    ) -> Option<CompiledWrapper> {
        let mut unit = Parser::parse_unit(&source.text, diagnostics)?;

        let errors_before = diagnostics.error_count();
        helper.transform(&mut unit, diagnostics);
        if diagnostics.error_count() > errors_before {
            return None;
        }

        let isa = match self.build_isa().and_then(|isa| {
            Self::check_target(isa.as_ref(), target)?;
            Ok(isa)
        }) {
            Ok(isa) => isa,
            Err(e) => {
                diagnostics.put_error(e.to_string());
                return None;
            }
        };

        let pointer_size = u32::from(isa.pointer_bytes());
        let checked = check_unit(&unit, pointer_size, helper, diagnostics)?;

        match Self::emit(isa, &checked.wrapper) {
            Ok((module, entry, ir)) => {
                debug!(
                    function = %checked.wrapper.name,
                    entry = format_args!("{entry:#x}"),
                    "compiled wrapper"
                );
                Some(
                    CompiledWrapper::new(checked.wrapper.name, entry, checked.records)
                        .with_ir(ir)
                        .with_code_owner(Box::new(module)),
                )
            }
            Err(e) => {
                diagnostics.put_error(e.to_string());
                None
            }
        }
    }
}

/// Lowers one checked wrapper body into a function builder
struct FunctionLowering<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    pointer_type: Type,
    call_conv: cranelift_codegen::isa::CallConv,
    param: Value,
    locals: Vec<Value>,
}

impl FunctionLowering<'_, '_> {
    fn lower_body(&mut self, body: &[TStmt]) -> JitResult<()> {
        for stmt in body {
            match stmt {
                TStmt::Let(index, init) => {
                    let value = self.lower_value(init)?;
                    debug_assert_eq!(*index, self.locals.len());
                    self.locals.push(value);
                }
                TStmt::Store {
                    base,
                    offset,
                    value,
                } => {
                    let address = self.lower_value(base)?;
                    let value = self.lower_value(value)?;
                    self.builder
                        .ins()
                        .store(MemFlags::trusted(), value, address, Self::offset(*offset)?);
                }
                TStmt::StoreCall { base, offset, call } => {
                    let address = self.lower_value(base)?;
                    let dest = if *offset == 0 {
                        address
                    } else {
                        self.builder.ins().iadd_imm(address, i64::from(*offset))
                    };
                    self.lower_call(call, Some(dest))?;
                }
                TStmt::Eval(expr) => {
                    self.lower_expr(expr)?;
                }
                TStmt::Return => break,
            }
        }
        self.builder.ins().return_(&[]);
        Ok(())
    }

    fn offset(offset: u32) -> JitResult<i32> {
        i32::try_from(offset)
            .map_err(|_| JitError::Unsupported(format!("field offset {offset} is too large")))
    }

    /// Lower an expression that must produce a value
    fn lower_value(&mut self, expr: &TExpr) -> JitResult<Value> {
        self.lower_expr(expr)?
            .ok_or_else(|| JitError::Unsupported(format!("`{}` has no value", expr.ty)))
    }

    fn lower_expr(&mut self, expr: &TExpr) -> JitResult<Option<Value>> {
        match &expr.kind {
            TExprKind::Param => Ok(Some(self.param)),
            TExprKind::Local(index) => self
                .locals
                .get(*index)
                .copied()
                .map(Some)
                .ok_or_else(|| JitError::Unsupported(format!("local {index} used before definition"))),
            TExprKind::Load { base, offset } => {
                let address = self.lower_value(base)?;
                let ty = self.clif_type(&expr.ty)?;
                let value = self.builder.ins().load(
                    ty,
                    MemFlags::trusted(),
                    address,
                    Self::offset(*offset)?,
                );
                Ok(Some(value))
            }
            TExprKind::Convert(inner) => {
                let value = self.lower_value(inner)?;
                self.convert(value, &inner.ty, &expr.ty).map(Some)
            }
            TExprKind::Call { .. } => self.lower_call(expr, None),
        }
    }

    /// Lower a call, passing `sret` as the buffer for a record result
    fn lower_call(&mut self, expr: &TExpr, sret: Option<Value>) -> JitResult<Option<Value>> {
        let TExprKind::Call { callee, func, args } = &expr.kind else {
            return Err(JitError::Unsupported(format!("`{}` is not a call", expr.ty)));
        };
        let target = self.lower_value(callee)?;
        let mut values = Vec::with_capacity(args.len() + 1);
        match (&func.ret, sret) {
            (CType::Record(_), Some(dest)) => values.push(dest),
            (CType::Record(record), None) => {
                return Err(JitError::Unsupported(format!(
                    "discarding a returned `{}`",
                    record.name
                )))
            }
            _ => {}
        }
        for arg in args {
            values.push(self.lower_value(arg)?);
        }
        let sig = self.call_signature(func)?;
        let sig_ref = self.builder.import_signature(sig);
        let call = self.builder.ins().call_indirect(sig_ref, target, &values);
        Ok(self.builder.inst_results(call).first().copied())
    }

    fn convert(&mut self, value: Value, from: &CType, to: &CType) -> JitResult<Value> {
        match (from, to) {
            (CType::Int(from), CType::Int(to)) => {
                let target = Type::int(to.bits() as u16)
                    .ok_or_else(|| JitError::Unsupported(format!("integer type `{}`", to.name())))?;
                Ok(if to.bits() > from.bits() {
                    if from.is_signed() {
                        self.builder.ins().sextend(target, value)
                    } else {
                        self.builder.ins().uextend(target, value)
                    }
                } else if to.bits() < from.bits() {
                    self.builder.ins().ireduce(target, value)
                } else {
                    value
                })
            }
            (CType::Pointer(_) | CType::Function(_), CType::Pointer(_) | CType::Function(_)) => {
                Ok(value)
            }
            _ => Err(JitError::Unsupported(format!(
                "conversion from `{from}` to `{to}`"
            ))),
        }
    }

    fn call_signature(&self, func: &FunctionType) -> JitResult<Signature> {
        if func.variadic {
            return Err(JitError::Unsupported(
                "calls to variadic functions".to_string(),
            ));
        }
        let mut sig = Signature::new(self.call_conv);
        match &func.ret {
            CType::Void => {}
            CType::Record(record) if record.size > REGISTER_RETURN_LIMIT => {
                sig.params.push(AbiParam::special(
                    self.pointer_type,
                    ArgumentPurpose::StructReturn,
                ));
            }
            CType::Record(record) => {
                return Err(JitError::Unsupported(format!(
                    "returning `{}` by value: {} bytes fit in registers, only aggregates \
                     over {REGISTER_RETURN_LIMIT} bytes are returned through memory",
                    record.name, record.size
                )));
            }
            ret => sig.returns.push(self.abi_param(ret)?),
        }
        for param in &func.params {
            sig.params.push(self.abi_param(param)?);
        }
        Ok(sig)
    }

    fn abi_param(&self, ty: &CType) -> JitResult<AbiParam> {
        let param = AbiParam::new(self.clif_type(ty)?);
        Ok(match ty {
            CType::Bool => param.uext(),
            CType::Int(int) if int.bits() < 32 && int.is_signed() => param.sext(),
            CType::Int(int) if int.bits() < 32 => param.uext(),
            _ => param,
        })
    }

    fn clif_type(&self, ty: &CType) -> JitResult<Type> {
        match ty {
            CType::Bool => Ok(types::I8),
            CType::Int(int) => Type::int(int.bits() as u16)
                .ok_or_else(|| JitError::Unsupported(format!("integer type `{}`", int.name()))),
            CType::Float(FloatType::F32) => Ok(types::F32),
            CType::Float(FloatType::F64) => Ok(types::F64),
            CType::Pointer(_) | CType::Function(_) => Ok(self.pointer_type),
            CType::Void | CType::Record(_) => Err(JitError::Unsupported(format!(
                "values of type `{ty}`"
            ))),
        }
    }
}
