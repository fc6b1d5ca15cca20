//! Instruction set: opcodes, signature families and stream parsing.
//!
//! Every instruction in the stream is `[opcode, regso, imm...]` where all
//! words are 32-bit ints. `regso` is the operand-stack height immediately
//! before the op, recorded by the compiler; the VM helpers never read it,
//! but the native-source transpiler uses it to emit height assertions.

use std::fmt;

/// Arity marker for ops whose immediate count must be read from the stream.
pub const ILUNKNOWN: i32 = -1;

/// Signature family of an opcode. Determines the helper ABI:
///
/// - `Base`: `fn(vm, sp, imm...) -> sp`
/// - `Call`: base plus a trailing continuation function pointer
/// - `VarArg`: `fn(vm, sp, *const i32) -> sp` (pointer into the stream)
/// - `Jump1`: `fn(vm, sp) -> sp`, branch target consumed by codegen
/// - `Jump2`: `fn(vm, sp, default) -> sp`
/// - `Lval`: base signature, writes through the top of stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpFamily {
    Base,
    Call,
    VarArg,
    Jump1,
    Jump2,
    Lval,
}

macro_rules! opcodes {
    ($( $name:ident = $str:literal, $family:ident, $arity:expr; )*) => {
        /// An Opal opcode. Discriminants are the on-disk encoding.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum Opcode {
            $($name,)*
        }

        impl Opcode {
            /// All opcodes in encoding order.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            /// Decode an opcode word. `None` for out-of-range values.
            #[inline]
            pub fn from_i32(v: i32) -> Option<Opcode> {
                if v < 0 || v as usize >= Self::ALL.len() {
                    None
                } else {
                    Some(Self::ALL[v as usize])
                }
            }

            /// Helper/source name of this op (the `u_` suffix).
            pub fn name(self) -> &'static str {
                match self { $(Opcode::$name => $str,)* }
            }

            /// Signature family.
            pub fn family(self) -> OpFamily {
                match self { $(Opcode::$name => OpFamily::$family,)* }
            }

            /// Immediate count following `regso`, or [`ILUNKNOWN`].
            pub fn arity(self) -> i32 {
                match self { $(Opcode::$name => $arity,)* }
            }
        }
    };
}

opcodes! {
    PushInt = "push_int", Base, 1;
    PushInt64 = "push_int64", Base, 2;
    PushFloat = "push_float", Base, 1;
    PushFloat64 = "push_float64", Base, 2;
    PushStr = "push_str", Base, 1;
    PushNil = "push_nil", Base, 0;
    PushVar = "push_var", Base, 1;
    Dup = "dup", Base, 0;
    Drop = "drop", Base, 0;
    DropRef = "drop_ref", Base, 0;
    AddI = "add_i", Base, 0;
    SubI = "sub_i", Base, 0;
    MulI = "mul_i", Base, 0;
    DivI = "div_i", Base, 0;
    ModI = "mod_i", Base, 0;
    AddF = "add_f", Base, 0;
    SubF = "sub_f", Base, 0;
    MulF = "mul_f", Base, 0;
    DivF = "div_f", Base, 0;
    AddS = "add_s", Base, 0;
    EqI = "eq_i", Base, 0;
    NeI = "ne_i", Base, 0;
    LtI = "lt_i", Base, 0;
    GtI = "gt_i", Base, 0;
    LeI = "le_i", Base, 0;
    GeI = "ge_i", Base, 0;
    EqF = "eq_f", Base, 0;
    LtF = "lt_f", Base, 0;
    NotL = "not_l", Base, 0;
    NewVec = "new_vec", Base, 2;
    VIndexI = "v_index_i", Base, 0;
    VLen = "v_len", Base, 0;
    SLen = "s_len", Base, 0;
    NewObject = "new_object", Base, 1;
    PushFld = "push_fld", Base, 1;
    WriteVar = "write_var", Lval, 1;
    WriteVarRef = "write_var_ref", Lval, 1;
    FunStart = "fun_start", VarArg, ILUNKNOWN;
    Call = "call", Base, 1;
    PushFun = "push_fun", Call, 1;
    CallV = "call_v", Base, 0;
    DdCall = "dd_call", Base, 2;
    BCallRet = "bcall_ret", Base, 2;
    Return = "return", Base, 2;
    ReturnAny = "return_any", Base, 1;
    Jump = "jump", Jump1, 1;
    JumpFalse = "jump_false", Jump1, 1;
    JumpTrue = "jump_true", Jump1, 1;
    JumpIfUnwound = "jump_if_unwound", Jump2, 2;
    BlockStart = "block_start", Base, 0;
    JumpTable = "jump_table", VarArg, ILUNKNOWN;
    JumpTableCaseStart = "jump_table_case_start", Base, 0;
    JumpTableEnd = "jump_table_end", Base, 0;
    KeepRef = "keep_ref", Base, 2;
    KeepRefLoop = "keep_ref_loop", Base, 2;
    Exit = "exit", Base, 1;
    Abort = "abort", Base, 0;
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Opcode {
    /// Static operand-stack delta of this op given its immediates, or `None`
    /// when the delta depends on context the stream does not carry (calls,
    /// returns, native calls, object construction).
    pub fn stack_delta(self, args: &[i32]) -> Option<i32> {
        use Opcode::*;
        Some(match self {
            PushInt | PushInt64 | PushFloat | PushFloat64 | PushStr | PushNil | PushVar
            | PushFun | Dup => 1,
            Drop | DropRef => -1,
            AddI | SubI | MulI | DivI | ModI | AddF | SubF | MulF | DivF | AddS | EqI | NeI
            | LtI | GtI | LeI | GeI | EqF | LtF => -1,
            NotL => 0,
            NewVec => 1 - args[1],
            VIndexI => -1,
            VLen | SLen => 0,
            PushFld => 0,
            WriteVar | WriteVarRef => -1,
            JumpFalse | JumpTrue | JumpIfUnwound => -1,
            Jump | BlockStart | JumpTableCaseStart | JumpTableEnd => 0,
            JumpTable => -1,
            KeepRef | KeepRefLoop => 0,
            CallV | DdCall => 0,
            Exit => -1,
            Abort => 0,
            NewObject | Call | BCallRet | Return | ReturnAny | FunStart => return None,
        })
    }
}

/// A malformed instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptOp {
    /// The offending opcode word.
    pub opc: i32,
    /// Word index in the code section.
    pub at: usize,
}

impl fmt::Display for CorruptOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corrupt bytecode: {} at: {}", self.opc, self.at)
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy)]
pub struct ParsedOp {
    pub op: Opcode,
    /// Stack height before the op (compiler-recorded).
    pub regso: i32,
    /// Word index of the first immediate.
    pub args: usize,
    /// Immediate count.
    pub arity: usize,
    /// Word index of the next instruction.
    pub next: usize,
}

/// Decode the instruction at `pos`, resolving variable arities from the
/// stream itself.
pub fn parse_op(code: &[i32], pos: usize) -> Result<ParsedOp, CorruptOp> {
    let word = *code.get(pos).ok_or(CorruptOp { opc: -1, at: pos })?;
    let op = Opcode::from_i32(word).ok_or(CorruptOp { opc: word, at: pos })?;
    let regso = *code.get(pos + 1).ok_or(CorruptOp { opc: word, at: pos })?;
    let args = pos + 2;
    let arity = match op.arity() {
        ILUNKNOWN => match op {
            Opcode::FunStart => funstart_len(code, args).ok_or(CorruptOp { opc: word, at: pos })?,
            Opcode::JumpTable => {
                let mini = *code.get(args).ok_or(CorruptOp { opc: word, at: pos })?;
                let maxi = *code.get(args + 1).ok_or(CorruptOp { opc: word, at: pos })?;
                if maxi < mini {
                    return Err(CorruptOp { opc: word, at: pos });
                }
                // mini, maxi, one target per case, one default target.
                2 + (maxi - mini + 1) as usize + 1
            }
            _ => return Err(CorruptOp { opc: word, at: pos }),
        },
        n => n as usize,
    };
    let next = args + arity;
    if next > code.len() {
        return Err(CorruptOp { opc: word, at: pos });
    }
    Ok(ParsedOp { op, regso, args, arity, next })
}

/// Decoded `FunStart` payload.
///
/// Layout: `[funid, regs_max, nargs, args[nargs], ndef, defs[ndef],
/// nkeepvars, nowned, owned[nowned]]`.
#[derive(Debug, Clone, Copy)]
pub struct FunStartInfo<'a> {
    pub funid: i32,
    pub regs_max: i32,
    /// Specialised-identifier indices of the formals.
    pub args: &'a [i32],
    /// Specialised-identifier indices of the declared locals.
    pub defs: &'a [i32],
    pub nkeepvars: i32,
    /// Specialised-identifier indices of owned locals (dec'd on exit).
    pub owned: &'a [i32],
    /// Total payload length in words.
    pub len: usize,
}

fn funstart_len(code: &[i32], start: usize) -> Option<usize> {
    let nargs = *code.get(start + 2)? as usize;
    let ndef = *code.get(start + 3 + nargs)? as usize;
    let nowned = *code.get(start + 5 + nargs + ndef)? as usize;
    let len = 6 + nargs + ndef + nowned;
    if start + len > code.len() {
        None
    } else {
        Some(len)
    }
}

/// Read a `FunStart` payload beginning at word index `start` (the word after
/// `regso`). The stream must have been verified; malformed payloads return
/// `None`.
pub fn read_funstart(code: &[i32], start: usize) -> Option<FunStartInfo<'_>> {
    let len = funstart_len(code, start)?;
    let funid = code[start];
    let regs_max = code[start + 1];
    let nargs = code[start + 2] as usize;
    let args = &code[start + 3..start + 3 + nargs];
    let ndef = code[start + 3 + nargs] as usize;
    let defs = &code[start + 4 + nargs..start + 4 + nargs + ndef];
    let nkeepvars = code[start + 4 + nargs + ndef];
    let nowned = code[start + 5 + nargs + ndef] as usize;
    let owned = &code[start + 6 + nargs + ndef..start + 6 + nargs + ndef + nowned];
    Some(FunStartInfo { funid, regs_max, args, defs, nkeepvars, owned, len })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(Opcode::from_i32(i as i32), Some(*op));
        }
        assert_eq!(Opcode::from_i32(-1), None);
        assert_eq!(Opcode::from_i32(Opcode::ALL.len() as i32), None);
    }

    #[test]
    fn test_parse_base_op() {
        let code = [Opcode::PushInt as i32, 0, 42];
        let p = parse_op(&code, 0).unwrap();
        assert_eq!(p.op, Opcode::PushInt);
        assert_eq!(p.regso, 0);
        assert_eq!(&code[p.args..p.args + p.arity], &[42]);
        assert_eq!(p.next, 3);
    }

    #[test]
    fn test_parse_jump_table() {
        // selector in 0..=2, three cases plus default.
        let code = [Opcode::JumpTable as i32, 1, 0, 2, 10, 11, 12, 13];
        let p = parse_op(&code, 0).unwrap();
        assert_eq!(p.arity, 6);
        assert_eq!(p.next, 8);
    }

    #[test]
    fn test_parse_funstart() {
        // funid=0 regs_max=4 nargs=1 [7] ndef=2 [8 9] nkeepvars=1 nowned=1 [9]
        let code = [Opcode::FunStart as i32, 0, 0, 4, 1, 7, 2, 8, 9, 1, 1, 9];
        let p = parse_op(&code, 0).unwrap();
        assert_eq!(p.arity, 10);
        let f = read_funstart(&code, p.args).unwrap();
        assert_eq!(f.funid, 0);
        assert_eq!(f.regs_max, 4);
        assert_eq!(f.args, &[7]);
        assert_eq!(f.defs, &[8, 9]);
        assert_eq!(f.nkeepvars, 1);
        assert_eq!(f.owned, &[9]);
        assert_eq!(f.len, 10);
    }

    #[test]
    fn test_parse_corrupt() {
        let code = [999, 0];
        assert!(parse_op(&code, 0).is_err());
        // Truncated immediates.
        let code = [Opcode::PushInt64 as i32, 0, 1];
        assert!(parse_op(&code, 0).is_err());
    }

    #[test]
    fn test_stack_delta() {
        assert_eq!(Opcode::PushInt.stack_delta(&[1]), Some(1));
        assert_eq!(Opcode::AddI.stack_delta(&[]), Some(-1));
        assert_eq!(Opcode::NewVec.stack_delta(&[0, 3]), Some(-2));
        assert_eq!(Opcode::Call.stack_delta(&[0]), None);
    }
}
