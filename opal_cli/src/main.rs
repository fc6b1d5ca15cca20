//! Opal driver: verify bytecode blobs and emit transpiled native source.

mod args;

use args::{Action, UsageError, USAGE};
use opal_bytecode::BytecodeFile;
use std::path::Path;
use std::process::ExitCode;

/// Successful execution.
const EXIT_SUCCESS: u8 = 0;
/// Load or transpilation error.
const EXIT_ERROR: u8 = 1;
/// Command-line usage error.
const EXIT_USAGE_ERROR: u8 = 2;

fn main() -> ExitCode {
    env_logger::init();
    let action = match args::parse(std::env::args().skip(1)) {
        Ok(a) => a,
        Err(UsageError(msg)) => {
            eprintln!("opal: {}\n{}", msg, USAGE);
            return ExitCode::from(EXIT_USAGE_ERROR);
        }
    };
    match run(action) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(msg) => {
            eprintln!("opal: {}", msg);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run(action: Action) -> Result<(), String> {
    match action {
        Action::PrintHelp => {
            print!("{}", USAGE);
            Ok(())
        }
        Action::PrintVersion => {
            println!(
                "opal {} (bytecode format {})",
                env!("CARGO_PKG_VERSION"),
                opal_bytecode::BYTECODE_FORMAT_VERSION
            );
            Ok(())
        }
        Action::Info(path) => {
            let bcf = load_blob(&path)?;
            print_info(&path, &bcf);
            Ok(())
        }
        Action::Emit { input, mode, output } => {
            let bcf = load_blob(&input)?;
            let natreg = opal_vm::default_registry();
            let src = opal_codegen::generate(&natreg, &bcf, mode).map_err(|e| e.to_string())?;
            match output {
                Some(out) => std::fs::write(&out, src)
                    .map_err(|e| format!("{}: {}", out.display(), e)),
                None => {
                    print!("{}", src);
                    Ok(())
                }
            }
        }
    }
}

fn load_blob(path: &Path) -> Result<BytecodeFile, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    BytecodeFile::load(&bytes).map_err(|e| e.to_string())
}

fn print_info(path: &Path, bcf: &BytecodeFile) {
    println!("{}: ok", path.display());
    println!("  code:           {} words", bcf.code().len());
    println!("  type table:     {} words", bcf.type_table().len());
    println!("  strings:        {}", bcf.num_strings());
    println!("  identifiers:    {} ({} specialised)", bcf.num_idents(), bcf.num_specidents());
    println!("  enums:          {}", bcf.num_enums());
    println!("  classes:        {}", bcf.num_udts());
    println!("  vtable entries: {}", bcf.num_vtable_entries());
    println!("  functions:      {}", bcf.num_functions());
    for i in 0..bcf.num_functions() {
        let f = bcf.function(i);
        println!("    {:6}  {}", f.start_ip, bcf.string(f.name as usize));
    }
}
