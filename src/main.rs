#![warn(rust_2018_idioms)]
#![allow(dead_code)]

use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process;

mod compiler;
mod debug;
mod vm;

use vm::{VMError, VM};

fn main() {
    let args: Vec<String> = env::args().collect();
    let mut vm = VM::new();

    match args.len() {
        1 => repl(&mut vm),
        2 => run_file(&mut vm, Path::new(&args[1])),
        _ => {
            eprintln!("Usage: vesper [path]");
            process::exit(64);
        }
    }
}

fn repl(vm: &mut VM) {
    let stdin = io::stdin();
    prompt();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        // The scanner expects a NUL end guard. Errors were already reported;
        // the session keeps going.
        let _ = vm.interpret(&(line + "\x00"));
        prompt();
    }
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

fn run_file(vm: &mut VM, path: &Path) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read {}: {}", path.display(), err);
            process::exit(74);
        }
    };

    match vm.interpret(&(source + "\x00")) {
        Ok(()) => {}
        Err(VMError::CompileError(_)) => process::exit(65),
        Err(_) => process::exit(75),
    }
}
