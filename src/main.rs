use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use clap::Parser;
use mocha::{InterpretResult, Vm};

#[derive(Parser)]
#[command(name = "mocha")]
#[command(about = "The Mocha bytecode interpreter", long_about = None)]
struct Cli {
    /// Script to run; starts a REPL when omitted.
    script: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    match cli.script {
        Some(path) => run_file(&path),
        None => repl(),
    }
}

fn repl() {
    let mut vm = Vm::new();
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush().expect("failed to flush stdout");

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                println!();
                break;
            }
            Ok(_) => {
                vm.interpret(&line);
            }
            Err(_) => break,
        }
    }
}

fn run_file(path: &PathBuf) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read \"{}\": {}.", path.display(), err);
            process::exit(74);
        }
    };

    let mut vm = Vm::new();
    match vm.interpret(&source) {
        InterpretResult::InterpretOk => {}
        InterpretResult::InterpretCompileError => process::exit(65),
        InterpretResult::InterpretRuntimeError => process::exit(70),
    }
}
