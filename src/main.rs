//! Fixed-point RTL compiler CLI
//!
//! Usage:
//!   fixrtl design.hw --top Acc --inputs stimulus.json --out build/
//!   fixrtl design.hw --top Fir --init-args '[4]' --inputs in.json --json
//!   fixrtl design.hw --top Acc --inputs in.json --config fixrtl.json -v

use clap::Parser as ClapParser;
use colored::Colorize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use fixed_rtl::stimulus::{load_stimulus, parse_arguments};
use fixed_rtl::{parse, CompileError, ConversionConfig, ConvertedDesign, Converter, Instance, Simulator};

#[derive(ClapParser, Debug)]
#[command(name = "fixrtl")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Simulates fixed-point hardware modules and converts them to VHDL")]
struct Args {
    /// Design source file
    #[arg(value_name = "DESIGN")]
    design: PathBuf,

    /// Module class to instantiate as the top level
    #[arg(short = 't', long = "top")]
    top: String,

    /// Constructor arguments as a JSON array
    #[arg(long = "init-args", default_value = "[]")]
    init_args: String,

    /// Stimulus file: JSON array of calls to the entry function
    #[arg(short = 'i', long = "inputs")]
    inputs: Option<PathBuf>,

    /// Conversion configuration (JSON)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Directory for the generated VHDL files
    #[arg(short = 'o', long = "out")]
    out: Option<PathBuf>,

    /// Function that must have been simulated (repeatable)
    #[arg(short = 'r', long = "require")]
    require: Vec<String>,

    /// Fail on fixed-point wraps not marked as expected
    #[arg(long = "strict-wrap")]
    strict_wrap: bool,

    /// Simulate without fixed-point quantization or overflow handling
    #[arg(long = "float-mode")]
    float_mode: bool,

    /// Lower and emit packages on one thread
    #[arg(long = "sequential")]
    sequential: bool,

    /// Output signatures and sources as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn fail(stage: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("{}: {}", stage.red(), err);
    std::process::exit(1);
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => ConversionConfig::from_file(path).unwrap_or_else(|e| fail("Configuration error", e)),
        None => ConversionConfig::default(),
    };
    for function in &args.require {
        config = config.require(function.clone());
    }
    config.strict_wrap |= args.strict_wrap;
    config.float_mode |= args.float_mode;
    config.parallel &= !args.sequential;
    if args.out.is_some() {
        config.output_dir = args.out.clone();
    }

    let source = fs::read_to_string(&args.design).unwrap_or_else(|e| {
        fail("Error", format!("Failed to read '{}': {}", args.design.display(), e))
    });

    if args.verbose {
        println!("{}", "Fixed-Point RTL Compiler".bold().blue());
        println!("{}", "=".repeat(35));
        println!();
        println!("{}: {}", "Design".green(), args.design.display());
        println!("{}: {}", "Top".green(), args.top);
        println!(
            "{}: {} (constructor {})",
            "Entry".green(),
            config.entry,
            config.constructor
        );
        println!();
    }

    let design = Arc::new(parse(&source).unwrap_or_else(|e| fail("Parse error", e)));
    let init_args = parse_arguments(&args.init_args).unwrap_or_else(|e| fail("Argument error", e));
    let inputs = match &args.inputs {
        Some(path) => load_stimulus(path).unwrap_or_else(|e| fail("Stimulus error", e)),
        None => Vec::new(),
    };

    let simulator = Simulator::with_config(design.clone(), &config);
    let mut top = simulator
        .instantiate(&args.top, init_args)
        .unwrap_or_else(|e| fail("Simulation error", e));
    let outputs = top.simulate(inputs).unwrap_or_else(|e| fail("Simulation error", e));
    if args.verbose {
        print_simulation(&top, &outputs);
    }

    let converted = Converter::new(config.clone())
        .convert(&design, &top)
        .unwrap_or_else(|e| fail(stage_name(&e), e));

    if let Some(dir) = &config.output_dir {
        match converted.write_to(dir) {
            Ok(paths) => {
                for path in paths {
                    println!("{} {}", "Wrote".green(), path.display());
                }
            }
            Err(e) => fail("Error", e),
        }
    }

    if args.json_output {
        match converted.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => fail("Error", format!("Failed to serialize to JSON: {}", e)),
        }
    } else if config.output_dir.is_none() {
        print_conversion(&converted, args.verbose);
    }
}

fn stage_name(err: &CompileError) -> &'static str {
    match err {
        CompileError::TypeInference(_) => "Type error",
        CompileError::StateDiscipline(_) => "State error",
        CompileError::Translation(_) => "Translation error",
        _ => "Compilation error",
    }
}

fn print_simulation(top: &Instance, outputs: &[Option<fixed_rtl::Value>]) {
    println!("{}", "Simulation".bold().yellow());
    println!("{}", "-".repeat(50));
    for (cycle, output) in outputs.iter().enumerate() {
        match output {
            Some(value) => println!("  {:>4}: {}", cycle, value),
            None => println!("  {:>4}: -", cycle),
        }
    }
    let diagnostics = top.diagnostics();
    if !diagnostics.is_empty() {
        println!("  {}: {}", "Overflow diagnostics".cyan(), diagnostics.len());
        for diagnostic in diagnostics.iter().take(8) {
            println!("    {} {:?} at {}", "!".yellow(), diagnostic.kind, diagnostic.path);
        }
    }
    println!();
}

fn print_conversion(converted: &ConvertedDesign, verbose: bool) {
    println!("{}", "Conversion Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();
    print!("{}", converted.signatures);
    println!();

    for file in &converted.files {
        println!("{} {} ({} lines)", "File".bold(), file.name.bold(), file.contents.lines().count());
        if verbose {
            println!("{}", "-".repeat(50));
            println!("{}", file.contents);
        }
    }
    if !verbose {
        println!();
        println!("(use --out DIR to write the files, -v to print them)");
    }
}
