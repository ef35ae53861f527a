use std::path::{Path, PathBuf};
use std::rc::Rc;

use clap::{Parser, Subcommand};
use miette::{miette, Result};

use exprc::{compile_lambda, CompileOptions, LambdaExpr, TailCalls};
use exprc_runtime::{Machine, Metadata, Program, Type, Value};

#[derive(Debug, Parser)]
#[command(name = "exprc", version, about = "Expression tree compiler")]
struct Cli {
    /// Which calls in tail position are marked as tail calls.
    #[arg(long, value_enum, global = true, default_value_t = TailCalls::Declared)]
    tail_calls: TailCalls,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compile a lambda and report errors only.
    Check { path: PathBuf },
    /// Print the compiled program.
    Disasm { path: PathBuf },
    /// Compile and execute a lambda on the reference machine.
    Run {
        path: PathBuf,
        /// JSON array of arguments.
        #[arg(long)]
        args: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let options = CompileOptions {
        tail_calls: cli.tail_calls,
    };
    let md = Metadata::with_prelude();
    match cli.command {
        Command::Check { path } => {
            compile_file(&md, &path, &options)?;
            println!("ok");
            Ok(())
        }
        Command::Disasm { path } => {
            let program = compile_file(&md, &path, &options)?;
            print!("{program}");
            Ok(())
        }
        Command::Run { path, args } => {
            let program = Rc::new(compile_file(&md, &path, &options)?);
            let params = program.entry_function().params.clone();
            let args = parse_args(args.as_deref(), &params)?;
            let mut machine = Machine::new(&md);
            let result = machine
                .run(&program, args)
                .map_err(|err| miette!("execution failed: {err}"))?;
            if program.entry_function().returns_value() {
                println!("{result}");
            }
            Ok(())
        }
    }
}

fn compile_file(md: &Metadata, path: &Path, options: &CompileOptions) -> Result<Program> {
    let source = std::fs::read_to_string(path)
        .map_err(|err| miette!("failed to read {}: {err}", path.display()))?;
    let lambda: LambdaExpr = serde_json::from_str(&source)
        .map_err(|err| miette!("failed to parse {}: {err}", path.display()))?;
    log::debug!("loaded `{}` from {}", lambda.display_name(), path.display());
    compile_lambda(md, &lambda, options).map_err(miette::Report::new)
}

fn parse_args(source: Option<&str>, params: &[Type]) -> Result<Vec<Value>> {
    let values: Vec<serde_json::Value> = match source {
        Some(source) => {
            serde_json::from_str(source).map_err(|err| miette!("invalid --args: {err}"))?
        }
        None => Vec::new(),
    };
    if values.len() != params.len() {
        return Err(miette!(
            "expected {} arguments, got {}",
            params.len(),
            values.len()
        ));
    }
    values
        .iter()
        .zip(params)
        .map(|(value, ty)| argument(value, ty))
        .collect()
}

fn argument(value: &serde_json::Value, ty: &Type) -> Result<Value> {
    use serde_json::Value as Json;
    let converted = match (value, ty.non_nullable()) {
        (Json::Null, _) if ty.is_nullable() || !ty.is_value_type() => Some(Value::Null),
        (Json::Bool(v), Type::Bool) => Some(Value::Bool(*v)),
        (Json::Number(n), Type::I32) => n.as_i64().and_then(|v| i32::try_from(v).ok()).map(Value::I32),
        (Json::Number(n), Type::I64) => n.as_i64().map(Value::I64),
        (Json::Number(n), Type::F64) => n.as_f64().map(Value::F64),
        (Json::String(s), Type::String | Type::Object) => Some(Value::str(s)),
        _ => None,
    };
    converted.ok_or_else(|| miette!("argument {value} is not a valid `{ty}`"))
}
