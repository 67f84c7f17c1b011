use macchiato::jvm::{read_class_file, JVMParser};
use macchiato::program::Program;
use macchiato::runtime::{Runtime, RuntimeErrorKind};

use std::env;
use std::path::Path;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("USAGE: {} <class file>", args[0]);
        process::exit(1);
    }

    let path = Path::new(&args[1]);
    let class_file_bytes = match read_class_file(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            eprintln!("failed to open {}: {err}", path.display());
            process::exit(1);
        }
    };
    let class_file = match JVMParser::parse(&class_file_bytes) {
        Ok(class_file) => class_file,
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };
    let program = match Program::new(&class_file) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };

    let mut runtime = Runtime::new(program);
    if let Err(err) = runtime.run() {
        match err.kind() {
            // Boundary errors: report and terminate cleanly.
            RuntimeErrorKind::MissingEntryPoint
            | RuntimeErrorKind::EntryPointReturnedValue(_) => {
                eprintln!("{err}");
                process::exit(1);
            }
            // Execution invariant violations abort through the host
            // panic mechanism.
            _ => panic!("fatal runtime fault: {err}"),
        }
    }
}
