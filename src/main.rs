use std::env;
use std::fs;
use std::process;

use anyhow::{Context, Result};
use log::LevelFilter;

use rox::VM;

const DEFAULT_VERBOSITY: LevelFilter = LevelFilter::Info;

fn main() -> Result<()> {
    let mut verbosity = DEFAULT_VERBOSITY;
    let mut path = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some(lvl) = arg.strip_prefix("--verbosity=") {
            verbosity = lvl.parse().unwrap_or(DEFAULT_VERBOSITY);
        } else if arg == "--verbosity" {
            if let Some(lvl) = args.next() {
                verbosity = lvl.parse().unwrap_or(DEFAULT_VERBOSITY);
            }
        } else {
            path = Some(arg);
        }
    }

    env_logger::Builder::new().filter_level(verbosity).init();

    let mut vm = VM::new();
    match path {
        None => vm.repl(),
        Some(path) => {
            let src =
                fs::read_to_string(&path).with_context(|| format!("failed to read {path}"))?;
            if let Err(err) = vm.interpret(&src, false) {
                eprintln!("{err}");
                process::exit(1);
            }
        }
    }
    Ok(())
}
