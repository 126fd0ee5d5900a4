//! Command line driver: parse a CPU description, write the companion
//! header, and print the generated C module to stdout.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use cinder_codegen::{Dispatch, Generator};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DispatchArg {
    Call,
    Switch,
    Goto,
}

impl From<DispatchArg> for Dispatch {
    fn from(arg: DispatchArg) -> Self {
        match arg {
            DispatchArg::Call => Dispatch::Call,
            DispatchArg::Switch => Dispatch::Switch,
            DispatchArg::Goto => Dispatch::Goto,
        }
    }
}

#[derive(Parser)]
#[command(name = "cinder", about = "CPU emulator DSL compiler", version)]
struct Args {
    /// CPU description source file
    source: PathBuf,
    /// Define a boolean configuration value (NAME or NAME=VALUE)
    #[arg(short = 'D', long = "define")]
    define: Vec<String>,
    /// Dispatch strategy for the emitted interpreter
    #[arg(short = 'd', long = "dispatch", value_enum, default_value = "call")]
    dispatch: DispatchArg,
}

/// `NAME` defines true; `NAME=VALUE` defines the truthiness of the
/// trimmed value string.
fn parse_define(raw: &str) -> (String, bool) {
    match raw.split_once('=') {
        Some((name, value)) => (name.trim().to_owned(), !value.trim().is_empty()),
        None => (raw.trim().to_owned(), true),
    }
}

fn run(args: &Args) -> Result<ExitCode> {
    let source = fs::read_to_string(&args.source)
        .with_context(|| format!("failed to read {}", args.source.display()))?;
    let program = match cinder_dsl::parse(&source) {
        Ok(program) => program,
        Err(errors) => {
            for error in &errors.0 {
                eprintln!("{error}");
            }
            return Ok(ExitCode::FAILURE);
        }
    };
    info!(
        tables = program.tables.len(),
        subroutines = program.subroutines.len(),
        "parsed CPU description"
    );
    let defines: Vec<(String, bool)> = args.define.iter().map(|d| parse_define(d)).collect();
    let mut generator = Generator::new(&program, args.dispatch.into(), &defines)?;
    if let Some(header) = program.info.first("header") {
        println!("#include \"{header}\"");
        generator.write_header(header)?;
        debug!(header, "wrote companion header");
    }
    println!("#include \"util.h\"");
    println!("#include <stdlib.h>");
    println!("{}", generator.build()?);
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();
    match run(&args) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_define;

    #[test]
    fn defines_follow_value_truthiness() {
        assert_eq!(parse_define("fast"), ("fast".to_owned(), true));
        assert_eq!(parse_define("fast=1"), ("fast".to_owned(), true));
        // Any non-empty value is true, including "0".
        assert_eq!(parse_define("fast=0"), ("fast".to_owned(), true));
        assert_eq!(parse_define("fast="), ("fast".to_owned(), false));
    }
}
