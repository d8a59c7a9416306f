use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use ember::jit::{CompiledMethod, Compiler, Progress};
use ember::vm::bytecode::Method;
use ember::JitConfig;

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "ember")]
#[command(about = "A dynamic compiler for a small embedded VM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a method description (JSON) to machine words
    Compile {
        /// The method file to compile
        file: PathBuf,

        /// Tuning config (TOML); missing keys keep their defaults
        #[arg(long)]
        config: Option<PathBuf>,

        /// Compile in slices of this many bytecodes (0 = one pass)
        #[arg(long, default_value = "0")]
        budget: u32,

        /// Output format (text, json)
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Skip the disassembly listing in text output
        #[arg(long)]
        no_disasm: bool,
    },
    /// Validate a method description without compiling it
    Check {
        /// The method file to check
        file: PathBuf,
    },
    /// Print the default tuning config as TOML
    DumpConfig,
}

fn load_method(path: &Path) -> Result<Method, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    serde_json::from_str(&text).map_err(|e| format!("cannot parse {}: {}", path.display(), e))
}

fn load_config(path: Option<&Path>) -> Result<JitConfig, String> {
    match path {
        None => Ok(JitConfig::default()),
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
            JitConfig::from_toml_str(&text)
                .map_err(|e| format!("bad config {}: {}", path.display(), e))
        }
    }
}

/// Run the compilation, in bounded slices when a budget is given so the
/// suspend/resume path is exercised. Returns the result and the number of
/// slices it took.
fn compile(method: &Method, config: JitConfig, budget: u32) -> Result<(CompiledMethod, u32), String> {
    let mut compiler = Compiler::new(method, config).map_err(|e| e.to_string())?;
    let mut slices = 1;
    if budget > 0 {
        while compiler.step(budget).map_err(|e| e.to_string())? == Progress::Suspended {
            slices += 1;
        }
    }
    let compiled = compiler.finish().map_err(|e| e.to_string())?;
    Ok((compiled, slices))
}

fn print_text(compiled: &CompiledMethod, slices: u32, no_disasm: bool) {
    println!("method:  {}", compiled.name());
    println!("code:    {} bytes", compiled.words().len() * 4);
    println!("slices:  {}", slices);
    for &(bci, offset) in compiled.osr_entries() {
        println!("osr:     bci {} at 0x{:x}", bci, offset);
    }
    for &(bci, offset) in compiled.deopt_entries() {
        println!("deopt:   bci {} at 0x{:x}", bci, offset);
    }
    for reloc in compiled.obj_relocs() {
        println!(
            "reloc:   word {} -> obj {} + {}",
            reloc.word_pos, reloc.handle.0, reloc.offset
        );
    }
    if !no_disasm {
        println!();
        print!("{}", compiled.disassemble());
    }
}

fn print_json(compiled: &CompiledMethod, slices: u32) -> Result<(), String> {
    let value = serde_json::json!({
        "name": compiled.name(),
        "code_bytes": compiled.words().len() * 4,
        "slices": slices,
        "words": compiled.words().iter().map(|w| format!("{:08x}", w)).collect::<Vec<_>>(),
        "osr_entries": compiled.osr_entries(),
        "deopt_entries": compiled.deopt_entries(),
        "obj_relocs": compiled.obj_relocs().iter().map(|r| {
            serde_json::json!({ "word_pos": r.word_pos, "handle": r.handle.0, "offset": r.offset })
        }).collect::<Vec<_>>(),
    });
    let text = serde_json::to_string_pretty(&value).map_err(|e| e.to_string())?;
    println!("{}", text);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Compile { file, config, budget, format, no_disasm } => {
            (|| -> Result<(), String> {
                let method = load_method(&file)?;
                let config = load_config(config.as_deref())?;
                let (compiled, slices) = compile(&method, config, budget)?;
                match format {
                    OutputFormat::Text => print_text(&compiled, slices, no_disasm),
                    OutputFormat::Json => print_json(&compiled, slices)?,
                }
                Ok(())
            })()
        }
        Commands::Check { file } => load_method(&file).and_then(|m| {
            m.validate()?;
            println!("{}: ok ({} events)", m.name, m.events.len());
            Ok(())
        }),
        Commands::DumpConfig => toml::to_string_pretty(&JitConfig::default())
            .map_err(|e| e.to_string())
            .map(|text| print!("{}", text)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
