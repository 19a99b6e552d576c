//! Integration tests calling real host functions through JIT-compiled wrappers
//!
//! Each test function is an `extern "C"` oracle: the result of calling it
//! through the facility must match calling it directly.

#![allow(unsafe_code)]

use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use fncall_core::testutil::ScriptedThread;
use fncall_core::{
    CType, CallError, CallOptions, CallerState, DiagnosticManager, ExecutionContext,
    FunctionCaller, FunctionSignature, HostProcess, HostThread, JitCompiler, MemoryError,
    Process, RecordType, StopInfo, StructLocation, Value,
};

extern "C" fn add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

static BUMPS: AtomicU32 = AtomicU32::new(0);

extern "C" fn bump() {
    BUMPS.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn mix(a: i8, b: u16, c: f32, d: f64) -> f64 {
    f64::from(a) + f64::from(b) + f64::from(c) * d
}

#[allow(clippy::too_many_arguments)]
extern "C" fn sum10(a: i64, b: i64, c: i64, d: i64, e: i64, f: i64, g: i64, h: i64, i: i64, j: i64) -> i64 {
    a + 2 * b + 3 * c + 4 * d + 5 * e + 6 * f + 7 * g + 8 * h + 9 * i + 10 * j
}

extern "C" fn sum_bytes(buf: *const u8, len: u64) -> u64 {
    let bytes = unsafe { std::slice::from_raw_parts(buf, len as usize) };
    bytes.iter().map(|&b| u64::from(b)).sum()
}

#[repr(C)]
struct Point {
    x: f64,
    y: f64,
}

extern "C" fn norm2(p: *const Point) -> f64 {
    let p = unsafe { &*p };
    p.x * p.x + p.y * p.y
}

extern "C" fn is_even(v: i32) -> bool {
    v % 2 == 0
}

extern "C" fn negate8(v: i8) -> i8 {
    v.wrapping_neg()
}

extern "C" fn passthrough(p: *const u8) -> *const u8 {
    p
}

extern "C" fn apply(f: extern "C" fn(i32, i32) -> i32, x: i32) -> i32 {
    f(x, x + 1)
}

#[repr(C)]
struct Triple {
    a: i64,
    b: i64,
    c: i64,
}

extern "C" fn spread(seed: i64) -> Triple {
    Triple {
        a: seed,
        b: seed * 2,
        c: -seed,
    }
}

fn address(f: usize) -> u64 {
    f as u64
}

fn host() -> (ExecutionContext, Rc<HostProcess>) {
    let process = Rc::new(HostProcess::new());
    let ctx = ExecutionContext::new(
        process.clone(),
        Rc::new(HostThread),
        Rc::new(JitCompiler::default()),
    );
    (ctx, process)
}

fn add_caller() -> FunctionCaller {
    FunctionCaller::new(
        "add",
        FunctionSignature::new(CType::I32, vec![CType::I32, CType::I32], address(add as usize)),
        vec![Value::I32(3), Value::I32(4)],
    )
}

fn execute(caller: &mut FunctionCaller, ctx: &ExecutionContext) -> Value {
    let mut diags = DiagnosticManager::new();
    match caller.execute_function(ctx, &mut diags, &CallOptions::default()) {
        Ok(value) => value,
        Err(e) => panic!("call failed: {e}\n{}", diags.render(Some(&caller.wrapper_source().text))),
    }
}

#[test]
fn test_add_returns_sum() {
    let (ctx, process) = host();
    let mut caller = add_caller();
    assert_eq!(execute(&mut caller, &ctx), Value::I32(7));
    assert_eq!(caller.state(), CallerState::Ready);
    assert_eq!(process.live_allocations(), 0);
}

#[test]
fn test_void_function_without_arguments() {
    let (ctx, _) = host();
    let mut caller = FunctionCaller::new(
        "bump",
        FunctionSignature::new(CType::Void, vec![], address(bump as usize)),
        vec![],
    );
    let before = BUMPS.load(Ordering::SeqCst);
    assert_eq!(execute(&mut caller, &ctx), Value::Void);
    assert_eq!(BUMPS.load(Ordering::SeqCst), before + 1);

    let layout = caller.layout().unwrap();
    assert_eq!(layout.slot_count(), 1);
    assert!(layout.ret.is_none());
}

#[test]
fn test_mixed_width_and_float_arguments() {
    let (ctx, _) = host();
    let mut caller = FunctionCaller::new(
        "mix",
        FunctionSignature::new(
            CType::F64,
            vec![CType::I8, CType::U16, CType::F32, CType::F64],
            address(mix as usize),
        ),
        vec![Value::I8(-5), Value::U16(60_000), Value::F32(1.5), Value::F64(-2.25)],
    );
    let expected = mix(-5, 60_000, 1.5, -2.25);
    assert!(execute(&mut caller, &ctx).bit_eq(&Value::F64(expected)));
}

#[test]
fn test_arguments_beyond_registers() {
    let (ctx, _) = host();
    let args: Vec<Value> = (1..=10).map(|i| Value::I64(i * 1_000_003)).collect();
    let mut caller = FunctionCaller::new(
        "sum10",
        FunctionSignature::new(CType::I64, vec![CType::I64; 10], address(sum10 as usize)),
        args,
    );
    let n = |i: i64| i * 1_000_003;
    let expected = sum10(n(1), n(2), n(3), n(4), n(5), n(6), n(7), n(8), n(9), n(10));
    assert_eq!(execute(&mut caller, &ctx), Value::I64(expected));
}

#[test]
fn test_pointer_into_target_memory() {
    let (ctx, process) = host();
    let buffer = process.allocate(5, 1).unwrap();
    process.write(buffer, &[1, 2, 3, 4, 250]).unwrap();

    let byte_ptr = CType::pointer_to(CType::U8);
    let mut caller = FunctionCaller::new(
        "sum_bytes",
        FunctionSignature::new(CType::U64, vec![byte_ptr, CType::U64], address(sum_bytes as usize)),
        vec![
            Value::Pointer {
                pointee: CType::U8,
                address: buffer,
            },
            Value::U64(5),
        ],
    );
    assert_eq!(execute(&mut caller, &ctx), Value::U64(260));
    process.free(buffer).unwrap();
}

#[test]
fn test_aggregate_passed_by_reference() {
    let (ctx, process) = host();
    let point = RecordType::new("Point", 16, 8);
    let mut bytes = 3.0f64.to_ne_bytes().to_vec();
    bytes.extend_from_slice(&4.0f64.to_ne_bytes());

    let mut caller = FunctionCaller::new(
        "norm2",
        FunctionSignature::new(
            CType::F64,
            vec![CType::pointer_to(CType::Record(point.clone()))],
            address(norm2 as usize),
        ),
        vec![Value::aggregate(point, bytes)],
    );
    assert!(caller.wrapper_source().text.contains("opaque Point: size 16, align 8;"));
    assert_eq!(execute(&mut caller, &ctx), Value::F64(25.0));
    assert_eq!(process.live_allocations(), 0);
}

#[test]
fn test_bool_and_narrow_returns() {
    let (ctx, _) = host();
    let mut even = FunctionCaller::new(
        "is_even",
        FunctionSignature::new(CType::Bool, vec![CType::I32], address(is_even as usize)),
        vec![Value::I32(10)],
    );
    assert_eq!(execute(&mut even, &ctx), Value::Bool(true));

    let mut diags = DiagnosticManager::new();
    let odd = even
        .execute_function_with(
            &ctx,
            &mut diags,
            &[Value::I32(7)],
            StructLocation::AllocateNew,
            &CallOptions::default(),
        )
        .unwrap();
    assert_eq!(odd, Value::Bool(false));

    let mut negate = FunctionCaller::new(
        "negate8",
        FunctionSignature::new(CType::I8, vec![CType::I8], address(negate8 as usize)),
        vec![Value::I8(-128)],
    );
    assert_eq!(execute(&mut negate, &ctx), Value::I8(negate8(-128)));
}

#[test]
fn test_pointer_return_keeps_pointee() {
    let (ctx, _) = host();
    let byte_ptr = CType::pointer_to(CType::U8);
    let mut caller = FunctionCaller::new(
        "passthrough",
        FunctionSignature::new(byte_ptr.clone(), vec![byte_ptr], address(passthrough as usize)),
        vec![Value::Pointer {
            pointee: CType::U8,
            address: 0xdead_b000,
        }],
    );
    assert_eq!(
        execute(&mut caller, &ctx),
        Value::Pointer {
            pointee: CType::U8,
            address: 0xdead_b000
        }
    );
}

#[test]
fn test_wrong_argument_count_fails_compile() {
    let (ctx, _) = host();
    let mut caller = FunctionCaller::new(
        "add",
        FunctionSignature::new(CType::I32, vec![CType::I32, CType::I32], address(add as usize)),
        vec![Value::I32(3)],
    );
    let mut diags = DiagnosticManager::new();
    let errors = caller.compile(&ctx, &mut diags);
    assert!(errors > 0);
    assert_eq!(caller.state(), CallerState::CompileFailed);
    assert!(diags.render(None).contains("takes 2 arguments but 1 argument was supplied"));
    assert!(caller.compiled().is_none());

    // Never retried
    assert_eq!(caller.compile(&ctx, &mut diags), errors);
    assert!(diags.render(None).contains("not retrying"));

    let result = caller.execute_function(&ctx, &mut diags, &CallOptions::default());
    assert_eq!(result, Err(CallError::Compilation { errors }));
    assert_eq!(
        caller.prepare_call_struct(&ctx, StructLocation::AllocateNew).err(),
        Some(CallError::Compilation { errors })
    );
}

#[test]
fn test_incompatible_argument_type_fails_compile() {
    let (ctx, _) = host();
    let mut caller = FunctionCaller::new(
        "add",
        FunctionSignature::new(CType::I32, vec![CType::I32, CType::I32], address(add as usize)),
        vec![Value::I32(3), Value::F64(4.0)],
    );
    let mut diags = DiagnosticManager::new();
    assert_eq!(caller.compile(&ctx, &mut diags), 1);
    assert!(diags
        .render(None)
        .contains("mismatched types: expected `i32`, found `f64`"));
}

#[test]
fn test_compile_twice_keeps_layout() {
    let (ctx, _) = host();
    let mut caller = add_caller();
    let mut diags = DiagnosticManager::new();
    assert_eq!(caller.compile(&ctx, &mut diags), 0);
    let layout = caller.layout().cloned();
    let entry = caller.compiled().map(|c| c.entry);

    assert_eq!(caller.compile(&ctx, &mut diags), 0);
    assert_eq!(caller.layout().cloned(), layout);
    assert_eq!(caller.compiled().map(|c| c.entry), entry);
    assert!(diags.is_empty());
}

#[test]
fn test_unmapped_struct_is_memory_access() {
    let (ctx, _) = host();
    let mut caller = add_caller();
    let mut diags = DiagnosticManager::new();
    caller.compile(&ctx, &mut diags);
    let layout = caller.layout().cloned();

    let err = caller
        .prepare_call_struct(&ctx, StructLocation::UseExisting(0x10))
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::MemoryAccess(MemoryError::Unmapped { address: 0x10, .. })
    ));

    // The caller is untouched and still usable
    assert_eq!(caller.state(), CallerState::Ready);
    assert_eq!(caller.layout().cloned(), layout);
    assert_eq!(execute(&mut caller, &ctx), Value::I32(7));
}

#[test]
fn test_existing_region_too_small_for_return_slot() {
    let (ctx, process) = host();
    let mut caller = add_caller();
    let mut diags = DiagnosticManager::new();
    caller.compile(&ctx, &mut diags);
    let layout = caller.layout().unwrap().clone();
    let ret = layout.ret.unwrap();

    // Holds everything up to the return slot, which would be written past the end
    let region = process.allocate(u64::from(ret.offset), 8).unwrap();
    let err = caller
        .execute_function_with(
            &ctx,
            &mut diags,
            &[Value::I32(1), Value::I32(2)],
            StructLocation::UseExisting(region),
            &CallOptions::default(),
        )
        .unwrap_err();
    assert_eq!(
        err,
        CallError::MemoryAccess(MemoryError::Unmapped {
            address: region,
            len: layout.size as usize
        })
    );
    assert_eq!(process.read(region, ret.offset as usize).unwrap(), vec![0; ret.offset as usize]);
    process.free(region).unwrap();
}

#[test]
fn test_function_pointer_argument() {
    let (ctx, _) = host();
    let callback = CType::Function(Box::new(
        FunctionSignature::new(CType::I32, vec![CType::I32, CType::I32], 0).function_type(),
    ));
    let signature = FunctionSignature::new(
        CType::I32,
        vec![callback.clone(), CType::I32],
        address(apply as usize),
    );

    let mut typed = FunctionCaller::new(
        "apply",
        signature.clone(),
        vec![
            Value::Pointer {
                pointee: callback,
                address: address(add as usize),
            },
            Value::I32(5),
        ],
    );
    assert_eq!(execute(&mut typed, &ctx), Value::I32(11));

    let mut untyped = FunctionCaller::for_signature("apply", signature);
    let mut diags = DiagnosticManager::new();
    let value = untyped
        .execute_function_with(
            &ctx,
            &mut diags,
            &[Value::pointer(address(add as usize)), Value::I32(20)],
            StructLocation::AllocateNew,
            &CallOptions::default(),
        )
        .unwrap();
    assert_eq!(value, Value::I32(41));
}

#[test]
fn test_large_record_returned_by_value() {
    let (ctx, process) = host();
    let triple = RecordType::new("Triple", 24, 8);
    let mut caller = FunctionCaller::new(
        "spread",
        FunctionSignature::new(CType::Record(triple.clone()), vec![CType::I64], address(spread as usize)),
        vec![Value::I64(7)],
    );

    let expected = spread(7);
    let mut bytes = expected.a.to_ne_bytes().to_vec();
    bytes.extend_from_slice(&expected.b.to_ne_bytes());
    bytes.extend_from_slice(&expected.c.to_ne_bytes());
    assert_eq!(execute(&mut caller, &ctx), Value::aggregate(triple, bytes));
    assert_eq!(caller.layout().and_then(|l| l.ret).map(|r| r.size), Some(24));
    assert_eq!(process.live_allocations(), 0);
}

#[test]
fn test_register_sized_record_return_is_rejected() {
    let (ctx, _) = host();
    let pair = RecordType::new("Pair", 8, 4);
    let mut caller = FunctionCaller::new(
        "pair",
        FunctionSignature::new(CType::Record(pair), vec![], address(add as usize)),
        vec![],
    );
    let mut diags = DiagnosticManager::new();
    assert_eq!(caller.compile(&ctx, &mut diags), 1);
    assert!(diags.render(None).contains("8 bytes fit in registers"));
    assert_eq!(caller.state(), CallerState::CompileFailed);
}

#[test]
fn test_variadic_callee_is_rejected() {
    let (ctx, _) = host();
    let mut caller = FunctionCaller::new(
        "sum",
        FunctionSignature::new(CType::I64, vec![CType::I32], address(sum10 as usize)).variadic(),
        vec![Value::I32(2), Value::I64(1), Value::I64(2)],
    );
    assert!(caller.wrapper_source().text.contains("fn(i32, ...) -> i64"));
    let mut diags = DiagnosticManager::new();
    assert_eq!(caller.compile(&ctx, &mut diags), 1);
    assert!(diags.render(None).contains("calls to variadic functions"));
}

#[test]
fn test_live_records_are_independent() {
    let (ctx, process) = host();
    let mut caller = add_caller();
    let mut diags = DiagnosticManager::new();
    caller.compile(&ctx, &mut diags);
    let size = u64::from(caller.layout().unwrap().size);

    let mut first = caller.prepare_call_struct(&ctx, StructLocation::AllocateNew).unwrap();
    let mut second = caller.prepare_call_struct(&ctx, StructLocation::AllocateNew).unwrap();
    let (a, b) = (first.struct_address(), second.struct_address());
    assert!(a + size <= b || b + size <= a);

    caller.write_arguments(&mut first, &[Value::I32(10), Value::I32(20)]).unwrap();
    caller.write_arguments(&mut second, &[Value::I32(-1), Value::I32(-2)]).unwrap();
    let options = CallOptions::default();
    assert_eq!(caller.run_call(&ctx, &mut second, &options).unwrap(), Value::I32(-3));
    assert_eq!(caller.run_call(&ctx, &mut first, &options).unwrap(), Value::I32(30));
    assert_eq!(first.result(), Some(&Value::I32(30)));
    assert_eq!(
        caller.read_arguments(&first).unwrap(),
        vec![Value::I32(10), Value::I32(20)]
    );

    assert_eq!(process.live_allocations(), 2);
    caller.deallocate(first).unwrap();
    drop(second);
    assert_eq!(process.live_allocations(), 0);
}

#[test]
fn test_existing_struct_is_not_freed() {
    let (ctx, process) = host();
    let mut caller = add_caller();
    let mut diags = DiagnosticManager::new();
    caller.compile(&ctx, &mut diags);
    let layout = caller.layout().unwrap().clone();
    let address = process
        .allocate(u64::from(layout.size), u64::from(layout.align))
        .unwrap();

    let options = CallOptions::default();
    for (a, b) in [(1, 2), (40, 2)] {
        let value = caller
            .execute_function_with(
                &ctx,
                &mut diags,
                &[Value::I32(a), Value::I32(b)],
                StructLocation::UseExisting(address),
                &options,
            )
            .unwrap();
        assert_eq!(value, Value::I32(a + b));
    }

    // The result is still in the caller's struct
    let ret = layout.ret.unwrap();
    let bytes = process.read(address + u64::from(ret.offset), 4).unwrap();
    assert_eq!(i32::from_ne_bytes(bytes.try_into().unwrap()), 42);
    assert_eq!(process.live_allocations(), 1);
    process.free(address).unwrap();
}

#[test]
fn test_interrupted_execution() {
    let process = Rc::new(HostProcess::new());
    let thread = Rc::new(ScriptedThread::new());
    let ctx = ExecutionContext::new(
        process.clone(),
        thread.clone(),
        Rc::new(JitCompiler::default()),
    );
    let mut caller = add_caller();
    let mut diags = DiagnosticManager::new();

    thread.push(StopInfo::Breakpoint { address: 0x1234 });
    let err = caller
        .execute_function(&ctx, &mut diags, &CallOptions::default())
        .unwrap_err();
    assert_eq!(
        err,
        CallError::ExecutionInterrupted(StopInfo::Breakpoint { address: 0x1234 })
    );
    assert!(diags.render(None).contains("hit breakpoint at 0x1234"));
    assert_eq!(process.live_allocations(), 0);

    // Ignored breakpoints fall through to a real run
    thread.push(StopInfo::Breakpoint { address: 0x1234 });
    let options = CallOptions {
        ignore_breakpoints: true,
        ..CallOptions::default()
    };
    assert_eq!(
        caller.execute_function(&ctx, &mut diags, &options).unwrap(),
        Value::I32(7)
    );
    let plans = thread.plans();
    assert_eq!(plans.len(), 2);
    assert!(plans[1].options.ignore_breakpoints);
    assert_eq!(plans[1].function_address, address(add as usize));
}
