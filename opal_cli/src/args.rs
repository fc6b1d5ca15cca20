//! Command-line argument parser.
//!
//! Hand-rolled for zero-overhead startup; the surface is small enough that a
//! parser generator would cost more than it saves.

use opal_codegen::Mode;
use std::path::PathBuf;

/// What the driver should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Verify a blob and print its metadata summary.
    Info(PathBuf),
    /// Transpile a blob to native source.
    Emit {
        input: PathBuf,
        mode: Mode,
        /// Write here instead of stdout.
        output: Option<PathBuf>,
    },
    PrintVersion,
    PrintHelp,
}

/// A bad invocation; exits with the usage error code.
#[derive(Debug, Clone)]
pub struct UsageError(pub String);

pub const USAGE: &str = "\
usage: opal [options] <program.opalb>

options:
  --emit cpp|c    output language for the transpiled source (default: cpp)
  -o <file>       write output to <file> instead of stdout
  --info          verify the blob and print a metadata summary
  -V, --version   print version and exit
  -h, --help      print this help and exit
";

/// Parse everything after argv[0].
pub fn parse(args: impl Iterator<Item = String>) -> Result<Action, UsageError> {
    let mut input: Option<PathBuf> = None;
    let mut mode = Mode::Cpp;
    let mut output = None;
    let mut info = false;

    let mut args = args.peekable();
    while let Some(a) = args.next() {
        match a.as_str() {
            "-h" | "--help" => return Ok(Action::PrintHelp),
            "-V" | "--version" => return Ok(Action::PrintVersion),
            "--info" => info = true,
            "--emit" => {
                let v = args
                    .next()
                    .ok_or_else(|| UsageError("--emit needs a language".into()))?;
                mode = match v.as_str() {
                    "cpp" => Mode::Cpp,
                    "c" => Mode::C,
                    other => {
                        return Err(UsageError(format!("unknown --emit language: {}", other)))
                    }
                };
            }
            "-o" => {
                let v = args
                    .next()
                    .ok_or_else(|| UsageError("-o needs a file".into()))?;
                output = Some(PathBuf::from(v));
            }
            flag if flag.starts_with('-') => {
                return Err(UsageError(format!("unknown option: {}", flag)));
            }
            path => {
                if input.is_some() {
                    return Err(UsageError("more than one input file".into()));
                }
                input = Some(PathBuf::from(path));
            }
        }
    }

    let Some(input) = input else {
        return Err(UsageError("no input file".into()));
    };
    if info {
        Ok(Action::Info(input))
    } else {
        Ok(Action::Emit { input, mode, output })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(args: &[&str]) -> Result<Action, UsageError> {
        parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_emit_defaults() {
        match p(&["prog.opalb"]).unwrap() {
            Action::Emit { input, mode, output } => {
                assert_eq!(input, PathBuf::from("prog.opalb"));
                assert_eq!(mode, Mode::Cpp);
                assert!(output.is_none());
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_emit_c_with_output() {
        match p(&["--emit", "c", "-o", "out.c", "prog.opalb"]).unwrap() {
            Action::Emit { mode, output, .. } => {
                assert_eq!(mode, Mode::C);
                assert_eq!(output, Some(PathBuf::from("out.c")));
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn test_info() {
        assert_eq!(
            p(&["--info", "prog.opalb"]).unwrap(),
            Action::Info(PathBuf::from("prog.opalb"))
        );
    }

    #[test]
    fn test_errors() {
        assert!(p(&[]).is_err());
        assert!(p(&["--emit"]).is_err());
        assert!(p(&["--emit", "fortran", "x"]).is_err());
        assert!(p(&["--wat", "x"]).is_err());
        assert!(p(&["a", "b"]).is_err());
    }

    #[test]
    fn test_help_version_win() {
        assert_eq!(p(&["--help"]).unwrap(), Action::PrintHelp);
        assert_eq!(p(&["-V"]).unwrap(), Action::PrintVersion);
    }
}
