//! fncall CLI - inspect call wrappers and call functions through them

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

use fncall_core::testutil::{LayoutOnlyCompiler, ScriptedThread, SparseProcess};
use fncall_core::{
    ByteOrder, CType, CallOptions, DiagnosticManager, ExecutionContext, FncallConfig, FunctionCaller,
    JitCompiler, TargetInfo,
};

mod builtins;

#[derive(Parser)]
#[command(name = "fncall")]
#[command(version = fncall_core::VERSION)]
#[command(about = "Call functions through synthesized wrappers", long_about = None)]
struct Cli {
    /// Log more (repeat for more detail); FNCALL_LOG overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the wrapper synthesized for a signature such as `i32(i32, i32)`
    Wrapper {
        /// Function signature
        signature: String,

        /// Function name used in the wrapper's identifiers
        #[arg(long, default_value = "f")]
        name: String,
    },

    /// Compile a wrapper and print the argument struct layout
    Layout {
        /// Function signature
        signature: String,

        /// Target: host, 32le, 32be, 64le or 64be
        #[arg(long, default_value = "host")]
        target: String,

        /// Also print the generated IR (host target only)
        #[arg(long)]
        ir: bool,
    },

    /// Call a builtin function through a JIT-compiled wrapper
    Call {
        /// Builtin name (see `fncall builtins`)
        builtin: String,

        /// Arguments, parsed by the builtin's parameter types
        args: Vec<String>,

        /// Ignore breakpoints while the call runs
        #[arg(long)]
        ignore_breakpoints: bool,

        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// List the builtin functions
    Builtins,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => FncallConfig::load(path)?,
        None => FncallConfig::load_default()?,
    };
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Commands::Wrapper { signature, name } => {
            let signature = builtins::parse_signature(&signature, 0)?;
            let caller = FunctionCaller::for_signature(name, signature);
            print!("{}", caller.wrapper_source().text);
        }
        Commands::Layout { signature, target, ir } => {
            show_layout(&config, &signature, &target, ir)?;
        }
        Commands::Call {
            builtin,
            args,
            ignore_breakpoints,
            timeout_ms,
        } => {
            let mut options = config.call.clone();
            options.ignore_breakpoints |= ignore_breakpoints;
            if timeout_ms.is_some() {
                options.timeout_ms = timeout_ms;
            }
            call_builtin(&config, &builtin, &args, &options)?;
        }
        Commands::Builtins => {
            for builtin in builtins::all() {
                let ty = CType::Function(Box::new(builtin.signature().function_type())).to_string();
                println!("{:<10} {ty:<32} {}", builtin.name, builtin.about);
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("FNCALL_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_target(text: &str) -> Result<Option<TargetInfo>> {
    let target = match text {
        "host" => return Ok(None),
        "32le" => TargetInfo::new(4, ByteOrder::Little),
        "32be" => TargetInfo::new(4, ByteOrder::Big),
        "64le" => TargetInfo::new(8, ByteOrder::Little),
        "64be" => TargetInfo::new(8, ByteOrder::Big),
        other => bail!("unknown target `{other}`; expected host, 32le, 32be, 64le or 64be"),
    };
    Ok(Some(target))
}

/// Compile `caller`, printing diagnostics, and fail if it did not compile
fn compile(caller: &mut FunctionCaller, ctx: &ExecutionContext) -> Result<()> {
    let mut diags = DiagnosticManager::new();
    let errors = caller.compile(ctx, &mut diags);
    if !diags.is_empty() {
        eprint!("{}", diags.render(Some(&caller.wrapper_source().text)));
    }
    if errors > 0 {
        bail!("wrapper for `{}` failed to compile with {errors} error(s)", caller.name());
    }
    Ok(())
}

fn show_layout(config: &FncallConfig, signature: &str, target: &str, ir: bool) -> Result<()> {
    let signature = builtins::parse_signature(signature, 0)?;
    let ctx = match parse_target(target)? {
        None => ExecutionContext::host(JitCompiler::new(config.codegen)),
        Some(target) => {
            if ir {
                bail!("--ir needs the host target");
            }
            ExecutionContext::new(
                Rc::new(SparseProcess::new(target)),
                Rc::new(ScriptedThread::new()),
                Rc::new(LayoutOnlyCompiler),
            )
        }
    };

    let mut caller = FunctionCaller::for_signature("f", signature);
    compile(&mut caller, &ctx)?;
    let layout = caller.layout().context("compiled caller has no layout")?;
    println!("target {}", ctx.process().target_info());
    print!("{layout}");
    if ir {
        if let Some(compiled) = caller.compiled() {
            println!();
            print!("{}", compiled.ir);
        }
    }
    Ok(())
}

fn call_builtin(
    config: &FncallConfig,
    name: &str,
    args: &[String],
    options: &CallOptions,
) -> Result<()> {
    let builtin = builtins::find(name)?;
    let signature = builtin.signature();
    if args.len() != signature.params.len() {
        bail!(
            "`{name}` takes {} argument(s) but {} were given",
            signature.params.len(),
            args.len()
        );
    }
    let values = args
        .iter()
        .zip(&signature.params)
        .map(|(text, ty)| builtins::parse_value(text, ty))
        .collect::<Result<Vec<_>>>()?;

    let ctx = ExecutionContext::host(JitCompiler::new(config.codegen));
    let mut caller = FunctionCaller::new(name, signature, values);
    compile(&mut caller, &ctx)?;

    let mut diags = DiagnosticManager::new();
    let result = caller.execute_function(&ctx, &mut diags, options);
    if !diags.is_empty() {
        eprint!("{}", diags.render(None));
    }
    println!("{}", result?);
    Ok(())
}
