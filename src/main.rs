mod call_frame;
mod chunk;
mod compiler;
mod debug;
mod gc;
mod io;
mod natives;
mod objects;
mod scanner;
mod table;
mod value;
mod vm;

use clap::Parser;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::{InterpretResult, ReplStatus, VM};

#[derive(Parser)]
#[command(name = "robusta", version, about = "A bytecode VM for the robusta language")]
struct Cli {
    /// Script to run (bytecode with -b); the REPL starts when omitted
    path: Option<String>,

    /// Trace the execution, one line per instruction
    #[arg(short = 'd')]
    trace: bool,

    /// Show the compile result (disassembly) before running
    #[arg(short = 's')]
    show_compile: bool,

    /// Annotate disassembly with jump labels
    #[arg(short = 'l')]
    labels: bool,

    /// Compile only and write the bytecode to the given path
    #[arg(short = 'c', value_name = "OUT")]
    compile_output: Option<String>,

    /// Treat the given file as precompiled bytecode
    #[arg(short = 'b')]
    run_bytecode: bool,
}

fn result_banner(result: InterpretResult) -> i32 {
    match result {
        InterpretResult::InterpretOk => {
            println!("{}", "== execution finished ==".green());
            0
        }
        InterpretResult::InterpretCompileError => {
            println!("{}", "== compile error ==".red());
            1
        }
        InterpretResult::InterpretRuntimeError => {
            println!("{}", "== runtime error ==".red());
            1
        }
        InterpretResult::InterpretIoError => {
            println!("{}", "== io error ==".red());
            1
        }
    }
}

fn run_file(vm: &mut VM, path: &str) -> i32 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("cannot read {}: {}", path, error);
            return result_banner(InterpretResult::InterpretIoError);
        }
    };
    vm.set_main_path(path);
    result_banner(vm.interpret(&source))
}

fn produce_bytecode(vm: &mut VM, source_path: &str, output_path: &str) -> i32 {
    let source = match std::fs::read_to_string(source_path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("cannot read {}: {}", source_path, error);
            return result_banner(InterpretResult::InterpretIoError);
        }
    };
    let result = vm.produce(&source, output_path);
    match result {
        InterpretResult::InterpretOk => {
            println!("{}", "== produce finished ==".green());
            0
        }
        other => result_banner(other),
    }
}

fn run_bytecode(vm: &mut VM, path: &str) -> i32 {
    vm.set_main_path(path);
    result_banner(vm.read_run_bytecode(path))
}

fn repl(vm: &mut VM) -> i32 {
    vm.additional_repl_init();
    println!("You are in the robusta REPL mode. Type help() for more information.\n");

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(error) => {
            eprintln!("cannot start the line editor: {}", error);
            return 1;
        }
    };

    let mut buffer = String::new();
    loop {
        let prompt = if buffer.is_empty() { "> " } else { "... " };
        match editor.readline(prompt) {
            Ok(line) => {
                if !buffer.is_empty() {
                    buffer.push('\n');
                }
                buffer.push_str(&line);
                match vm.interpret_line(&buffer) {
                    ReplStatus::NeedMoreInput => continue,
                    ReplStatus::Done(_) => {
                        editor.add_history_entry(buffer.as_str()).ok();
                        buffer.clear();
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!();
                return 0;
            }
            Err(error) => {
                eprintln!("readline error: {}", error);
                return 1;
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let mut vm = VM::new();
    vm.trace_execution = cli.trace;
    vm.show_compile_result = cli.show_compile;
    vm.show_labels = cli.labels;

    let code = match (&cli.compile_output, cli.run_bytecode, &cli.path) {
        (Some(output), false, Some(source)) => produce_bytecode(&mut vm, source, output),
        (Some(_), false, None) => {
            eprintln!("The output path is specified but the script path is missing.");
            eprintln!("The typical format of compiling is `robusta -c output/path script/path`.");
            1
        }
        (Some(_), true, _) => {
            eprintln!("-c and -b cannot be combined.");
            1
        }
        (None, true, Some(path)) => run_bytecode(&mut vm, path),
        (None, true, None) => {
            eprintln!("-b needs a bytecode file path.");
            1
        }
        (None, false, Some(path)) => run_file(&mut vm, path),
        (None, false, None) => repl(&mut vm),
    };
    std::process::exit(code);
}
