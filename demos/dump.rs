//! `pbo-dump`: reads a whitespace-separated opcode stream from stdin,
//! optimizes it, and prints the before/after trees.
//!
//! ```text
//! echo "PUSH_NULL POP" | pbo-dump
//! ```

use std::io::{self, Read};

use clap::Parser;

use peg_bytecode_opt::{optimize_block, OptimizerOptions, Opcode};
use peg_bytecode_opt::print::BlockPrinter;
use peg_bytecode_opt::codec::format;

#[derive(Parser)]
#[command(name = "pbo-dump", about = "Optimize a PEG bytecode stream read from stdin")]
struct Cli {
    /// Disable the block-local dead-slot elimination pass.
    #[arg(long)]
    skip_dead_slot: bool,

    /// Log each outer fixpoint iteration at debug level (set `RUST_LOG` to
    /// see it).
    #[arg(long)]
    log: bool,

    /// Name given to the single rule read from stdin.
    #[arg(long, default_value = "stdin")]
    rule: String,
}

fn parse_stream(input: &str) -> Result<Vec<i64>, String> {
    input
        .split_ascii_whitespace()
        .map(|tok| {
            if let Ok(n) = tok.parse::<i64>() {
                Ok(n)
            } else {
                Opcode::from_name(tok)
                    .map(|op| op as i64)
                    .ok_or_else(|| format!("unrecognized token `{tok}`"))
            }
        })
        .collect()
}

fn main() -> io::Result<()> {
    let cli = Cli::parse();
    if cli.log {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
            .init();
    } else {
        env_logger::init();
    }

    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;

    let flat = match parse_stream(&input) {
        Ok(flat) => flat,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let opts = OptimizerOptions {
        skip_dead_slot: cli.skip_dead_slot,
        log_rules: if cli.log { Some(Default::default()) } else { None },
        ..Default::default()
    };

    match optimize_block(&flat, &cli.rule, None, &opts) {
        Ok(out) => {
            match format(&flat, &cli.rule) {
                Ok(before) => print!("-- before --\n{}", BlockPrinter::new(&before)),
                Err(e) => println!("-- before (raw, unparsed) --\n{flat:?} ({e})"),
            }
            match format(&out, &cli.rule) {
                Ok(after) => print!("-- after --\n{}", BlockPrinter::new(&after)),
                Err(e) => println!("-- after (raw, unparsed) --\n{out:?} ({e})"),
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }

    Ok(())
}
