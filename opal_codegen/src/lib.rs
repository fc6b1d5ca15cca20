//! Bytecode → native-source transpiler.
//!
//! Walks the verified instruction stream and emits one C/C++ function per
//! bytecode function: basic blocks become labels, branches become gotos,
//! jump tables become switches, and every other opcode becomes a call to the
//! same opcode helper library the VM executes through. Each function keeps
//! its operands in a small local `regs` array; the VM operand stack (`psp`)
//! is threaded only across calls and returns, which lets the native compiler
//! enregister most values.
//!
//! Two output modes:
//! - `Cpp`: includes the runtime headers, embeds the blob and emits a `main`
//!   that hands both to the host runner
//! - `C`: self-contained typedefs and `extern` declarations; the host links
//!   and drives

use opal_bytecode::{
    parse_op, read_funstart, BytecodeFile, CorruptOp, OpFamily, Opcode, TypeIdx,
};
use opal_vm::NativeRegistry;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use std::fmt::Write;

/// Output language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Cpp,
    C,
}

/// Transpilation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// Native codegen assumes a little-endian build host.
    BigEndianHost,
    Corrupt(CorruptOp),
    /// No entry point found in the stream.
    MissingEntry,
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::BigEndianHost => write!(f, "native code gen requires little endian"),
            CodegenError::Corrupt(c) => write!(f, "{}", c),
            CodegenError::MissingEntry => write!(f, "bytecode has no entry point"),
        }
    }
}

impl std::error::Error for CodegenError {}

/// Transpile a loaded blob to a complete source file.
pub fn generate(
    natreg: &NativeRegistry,
    bcf: &BytecodeFile,
    mode: Mode,
) -> Result<String, CodegenError> {
    if cfg!(target_endian = "big") {
        return Err(CodegenError::BigEndianHost);
    }
    Emitter { natreg, bcf, mode, sd: String::new() }.run()
}

struct Emitter<'a> {
    natreg: &'a NativeRegistry,
    bcf: &'a BytecodeFile,
    mode: Mode,
    sd: String,
}

impl<'a> Emitter<'a> {
    fn run(mut self) -> Result<String, CodegenError> {
        let code = self.bcf.code();

        self.prelude();

        // Pass 1: find function boundaries, emit forward declarations.
        let first = parse_op(code, 0).map_err(CodegenError::Corrupt)?;
        if first.op != Opcode::Jump {
            return Err(CodegenError::Corrupt(CorruptOp { opc: code[0], at: 0 }));
        }
        let starting_ip = code[first.args] as usize;
        let mut starting_point = None;
        let mut ip = 0usize;
        while ip < code.len() {
            let p = parse_op(code, ip).map_err(CodegenError::Corrupt)?;
            if p.op == Opcode::FunStart || ip == starting_ip {
                let _ = writeln!(self.sd, "static StackPtr fun_{}(VMRef, StackPtr);", ip);
            }
            if ip == starting_ip {
                starting_point = Some(ip);
            }
            ip = p.next;
        }
        let starting_point = starting_point.ok_or(CodegenError::MissingEntry)?;
        self.sd.push('\n');

        let function_lookup: FxHashMap<usize, usize> = (0..self.bcf.num_functions())
            .map(|i| (self.bcf.function(i).start_ip, i))
            .collect();

        // Pass 2: one function body per boundary.
        let mut jumptables: SmallVec<[usize; 4]> = SmallVec::new();
        let mut funstart: Option<usize> = None;
        let mut nkeepvars = 0i32;
        let mut sdt = String::new();
        let mut ip = first.next;
        while ip < code.len() {
            let id = ip;
            let is_start = ip == starting_ip;
            let p = parse_op(code, ip).map_err(CodegenError::Corrupt)?;
            let args = &code[p.args..p.args + p.arity];

            if p.op == Opcode::FunStart || is_start {
                funstart = Some(ip);
                nkeepvars = 0;
                sdt.clear();
                self.sd.push('\n');
                if let Some(&f) = function_lookup.get(&id) {
                    let _ = writeln!(self.sd, "// {}", self.bcf.function_name(f));
                }
                let _ = writeln!(self.sd, "static StackPtr fun_{}(VMRef vm, StackPtr psp) {{", id);
                if p.op == Opcode::FunStart {
                    let fs = read_funstart(code, p.args)
                        .ok_or(CodegenError::Corrupt(CorruptOp { opc: code[ip], at: ip }))?;
                    nkeepvars = fs.nkeepvars;
                    let _ = writeln!(self.sd, "    Value regs[{}];", fs.regs_max.max(1));
                    if !fs.defs.is_empty() {
                        let _ = writeln!(self.sd, "    Value defsave[{}];", fs.defs.len());
                    }
                    if fs.nkeepvars > 0 {
                        let _ = writeln!(self.sd, "    Value keepvar[{}];", fs.nkeepvars);
                    }
                } else {
                    // The entry block returns at most one value.
                    let _ = writeln!(self.sd, "    Value regs[1];");
                }
                let _ = writeln!(self.sd, "    StackPtr sp = &regs[-1];");
            }

            self.sd.push_str("    ");
            if self.mode == Mode::Cpp
                && !matches!(
                    p.op,
                    Opcode::FunStart | Opcode::ReturnAny | Opcode::JumpIfUnwound
                )
            {
                // Catch transpiler/opcode stack-height drift early.
                let _ = write!(self.sd, "assert(sp == &regs[{}]); ", p.regso - 1);
            }

            match p.op {
                Opcode::FunStart => {
                    let fs = read_funstart(code, p.args)
                        .ok_or(CodegenError::Corrupt(CorruptOp { opc: code[ip], at: ip }))?;
                    let nargs = fs.args.len();
                    for (i, &varidx) in fs.args.iter().enumerate() {
                        let _ = write!(
                            self.sd,
                            "\n    u_swap_vars(vm, {}, psp, {});",
                            varidx,
                            nargs - i - 1
                        );
                    }
                    for (i, &varidx) in fs.defs.iter().enumerate() {
                        // For most locals this saves a nil; only recursion
                        // sees a value.
                        let _ = write!(
                            self.sd,
                            "\n    u_backup_var(vm, {}, &defsave[{}]);",
                            varidx, i
                        );
                    }
                    for i in 0..fs.nkeepvars {
                        let _ = write!(self.sd, "\n    u_nil_val(&keepvar[{}]);", i);
                    }
                }
                Opcode::Jump => {
                    let _ = write!(self.sd, "goto block{};", args[0]);
                }
                Opcode::JumpFalse | Opcode::JumpTrue | Opcode::JumpIfUnwound => {
                    let (df, target) = if p.op == Opcode::JumpIfUnwound {
                        (Some(args[0]), args[1])
                    } else {
                        (None, args[0])
                    };
                    let _ = write!(self.sd, "sp = u_{}(vm, sp", p.op.name());
                    if let Some(df) = df {
                        let _ = write!(self.sd, ", {}", df);
                    }
                    if self.mode == Mode::Cpp {
                        let _ = write!(self.sd, "); if (Pop(sp).False()) goto block{};", target);
                    } else {
                        let _ = write!(
                            self.sd,
                            "); {{ long long top = sp->ival; sp--; if (!top) goto block{}; }}",
                            target
                        );
                    }
                }
                Opcode::BlockStart => {
                    // Trailing ";" because a block may sit right before a "}".
                    let _ = write!(self.sd, "block{}:;", id);
                }
                Opcode::JumpTable => {
                    if self.mode == Mode::Cpp {
                        self.sd.push_str("switch (Pop(sp).ival()) {");
                    } else {
                        self.sd
                            .push_str("{ long long top = sp->ival; sp--; switch (top) {");
                    }
                    jumptables.push(p.args);
                }
                Opcode::JumpTableCaseStart => {
                    let t = *jumptables.last().expect("case outside a jump table");
                    let mini = code[t];
                    let maxi = code[t + 1];
                    for i in mini..=maxi {
                        if code[t + 2 + (i - mini) as usize] == id as i32 {
                            let _ = write!(self.sd, "case {}:", i);
                        }
                    }
                    if code[t + 2 + (maxi - mini + 1) as usize] == id as i32 {
                        self.sd.push_str("default:");
                    }
                }
                Opcode::JumpTableEnd => {
                    if self.mode == Mode::Cpp {
                        self.sd.push_str("} // switch");
                    } else {
                        self.sd.push_str("}} // switch");
                    }
                    jumptables.pop();
                }
                Opcode::BCallRet
                    if (args[0] as usize) < self.natreg.len()
                        && self.natreg.get(args[0] as usize).is_frame_hook =>
                {
                    self.sd.push_str("sp = host_frame(sp, vm);");
                }
                Opcode::Return | Opcode::ReturnAny => {
                    let fs = funstart.and_then(|f| {
                        let pf = parse_op(code, f).ok()?;
                        if pf.op == Opcode::FunStart {
                            read_funstart(code, pf.args)
                        } else {
                            None
                        }
                    });
                    let nrets;
                    if p.op == Opcode::Return {
                        nrets = args[1];
                        let cur = fs.as_ref().map_or(args[0], |fs| fs.funid);
                        let _ = write!(self.sd, "psp = u_fn_ret(vm, psp, {}, {});", args[0], cur);
                    } else {
                        nrets = args[0];
                        let _ = write!(self.sd, "psp = u_fn_ret_any(vm, psp, {});", nrets);
                    }
                    if let Some(fs) = &fs {
                        for &varidx in fs.owned {
                            let _ = write!(self.sd, "\n    u_dec_owned(vm, {});", varidx);
                        }
                        for &varidx in fs.args.iter().rev() {
                            let _ = write!(self.sd, "\n    psp = u_pop_arg(vm, {}, psp);", varidx);
                        }
                        sdt.clear();
                        for (i, &varidx) in fs.defs.iter().enumerate() {
                            let _ = writeln!(
                                sdt,
                                "    u_restore_backup(vm, {}, defsave[{}]);",
                                varidx, i
                            );
                        }
                    }
                    for i in 0..nrets {
                        let _ = write!(
                            self.sd,
                            "\n    Push(psp, TopM(sp, {}));",
                            nrets - i - 1
                        );
                    }
                    if nrets > 0 {
                        let _ = write!(self.sd, "\n    sp -= {};", nrets);
                    }
                    if p.op == Opcode::Return {
                        self.sd.push_str("\n    goto epilogue;");
                    }
                }
                Opcode::KeepRef | Opcode::KeepRefLoop => {
                    if p.op == Opcode::KeepRefLoop {
                        let _ = write!(self.sd, "u_dec_val(vm, keepvar[{}]); ", args[1]);
                    }
                    let _ = write!(self.sd, "keepvar[{}] = TopM(sp, {});", args[1], args[0]);
                }
                _ => {
                    let _ = write!(self.sd, "sp = u_{}(vm, sp", p.op.name());
                    for &a in args {
                        let _ = write!(self.sd, ", {}", a);
                    }
                    if p.op == Opcode::PushFun {
                        let _ = write!(self.sd, ", fun_{}", args[0]);
                    }
                    self.sd.push_str(");");

                    if let Some(comment) = self.op_comment(p.op, args) {
                        let _ = write!(self.sd, " /* {} */", comment);
                    }

                    if p.op == Opcode::Call {
                        let _ = write!(self.sd, " sp = fun_{}(vm, sp);", args[0]);
                    } else if matches!(p.op, Opcode::CallV | Opcode::DdCall) {
                        self.sd
                            .push_str(" sp = u_get_next_call_target(vm)(vm, sp);");
                    }
                }
            }
            self.sd.push('\n');

            ip = p.next;
            let at_boundary = ip == code.len()
                || ip == starting_ip
                || Opcode::from_i32(code[ip]) == Some(Opcode::FunStart);
            if at_boundary {
                if !matches!(p.op, Opcode::Exit | Opcode::Abort) {
                    self.sd.push_str("    epilogue:;\n");
                }
                self.sd.push_str(&sdt);
                for i in 0..nkeepvars {
                    let _ = writeln!(self.sd, "    u_dec_val(vm, keepvar[{}]);", i);
                }
                self.sd.push_str("    return psp;\n}\n");
            }
        }

        self.vtables();
        self.entry(starting_point);
        Ok(self.sd)
    }

    /// Reconstruct a human-readable comment from metadata, where one exists.
    fn op_comment(&self, op: Opcode, args: &[i32]) -> Option<String> {
        let bcf = self.bcf;
        match op {
            Opcode::PushVar | Opcode::WriteVar | Opcode::WriteVarRef => {
                let sid = bcf.specident(args[0] as usize);
                let id = bcf.ident(sid.ididx as usize);
                Some(bcf.string(id.name as usize).to_owned())
            }
            Opcode::PushStr => {
                let s = bcf.string(args[0] as usize);
                let truncated: String = s.chars().take(50).collect();
                Some(escape_and_quote(&truncated))
            }
            Opcode::Call => {
                let code = bcf.code();
                let p = parse_op(code, args[0] as usize).ok()?;
                let fs = read_funstart(code, p.args)?;
                Some(bcf.function_name(fs.funid as usize).to_owned())
            }
            Opcode::BCallRet => {
                if (args[0] as usize) < self.natreg.len() {
                    Some(self.natreg.get(args[0] as usize).name.to_owned())
                } else {
                    None
                }
            }
            Opcode::NewObject => {
                let ti = opal_bytecode::type_info(bcf.type_table(), TypeIdx(args[0]));
                if ti.kind().is_udt() {
                    Some(bcf.udt_name(ti.structidx() as usize).to_owned())
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn prelude(&mut self) {
        if self.mode == Mode::Cpp {
            self.sd.push_str(
                "#include \"opal/runtime.h\"\n\
                 #include \"opal/ops.h\"\n\
                 \n\
                 typedef opal::Value Value;\n\
                 typedef opal::StackPtr StackPtr;\n\
                 typedef void *VMRef;\n\
                 typedef opal::fun_base_t fun_base_t;\n\
                 \n\
                 #define Pop(sp) (*(sp)--)\n\
                 #define Push(sp, V) (*++(sp) = (V))\n\
                 #define TopM(sp, N) (*((sp) - (N)))\n\
                 \n",
            );
            return;
        }

        // C mode: a self-contained Value that must correspond to the runtime
        // cell, enforced by opal_entry_check().
        self.sd.push_str(
            "typedef struct {\n\
             \x20   union {\n\
             \x20       long long ival;\n\
             \x20       double fval;\n\
             \x20       void *rval;\n\
             \x20   };\n",
        );
        if cfg!(debug_assertions) {
            self.sd.push_str("    int type;\n");
        }
        self.sd.push_str(
            "} Value;\n\
             typedef Value *StackPtr;\n\
             typedef void *VMRef;\n\
             typedef StackPtr (*fun_base_t)(VMRef, StackPtr);\n\
             #define Pop(sp) (*(sp)--)\n\
             #define Push(sp, V) (*++(sp) = (V))\n\
             #define TopM(sp, N) (*((sp) - (N)))\n\
             \n",
        );

        for &op in Opcode::ALL {
            match op.family() {
                OpFamily::Base | OpFamily::Lval => {
                    let _ = write!(self.sd, "extern StackPtr u_{}(VMRef, StackPtr", op.name());
                    for _ in 0..op.arity().max(0) {
                        self.sd.push_str(", int");
                    }
                    self.sd.push_str(");\n");
                }
                OpFamily::Call => {
                    let _ = write!(self.sd, "extern StackPtr u_{}(VMRef, StackPtr", op.name());
                    for _ in 0..op.arity().max(0) {
                        self.sd.push_str(", int");
                    }
                    self.sd.push_str(", fun_base_t);\n");
                }
                OpFamily::VarArg => {
                    let _ = writeln!(
                        self.sd,
                        "extern StackPtr u_{}(VMRef, StackPtr, const int *);",
                        op.name()
                    );
                }
                OpFamily::Jump1 => {
                    let _ =
                        writeln!(self.sd, "extern StackPtr u_{}(VMRef, StackPtr);", op.name());
                }
                OpFamily::Jump2 => {
                    let _ = writeln!(
                        self.sd,
                        "extern StackPtr u_{}(VMRef, StackPtr, int);",
                        op.name()
                    );
                }
            }
        }
        self.sd.push_str(
            "extern StackPtr u_fn_ret(VMRef, StackPtr, int, int);\n\
             extern StackPtr u_fn_ret_any(VMRef, StackPtr, int);\n\
             extern fun_base_t u_get_next_call_target(VMRef);\n\
             extern void opal_entry_check(int);\n\
             extern StackPtr host_frame(StackPtr, VMRef);\n\
             extern void u_swap_vars(VMRef, int, StackPtr, int);\n\
             extern void u_backup_var(VMRef, int, Value *);\n\
             extern void u_nil_val(Value *);\n\
             extern void u_dec_owned(VMRef, int);\n\
             extern void u_dec_val(VMRef, Value);\n\
             extern void u_restore_backup(VMRef, int, Value);\n\
             extern StackPtr u_pop_arg(VMRef, int, StackPtr);\n\
             \n",
        );
    }

    fn vtables(&mut self) {
        if self.mode == Mode::Cpp {
            self.sd.push_str("\nstatic const fun_base_t vtables[] = {\n");
        } else {
            self.sd.push_str("\nextern const fun_base_t vtables[];\n");
            self.sd.push_str("const fun_base_t vtables[] = {\n");
        }
        for i in 0..self.bcf.num_vtable_entries() {
            let e = self.bcf.vtable_entry(i);
            if e >= 0 {
                let _ = writeln!(self.sd, "    fun_{},", e);
            } else {
                self.sd.push_str("    0,\n");
            }
        }
        // Make sure the table is never empty.
        self.sd.push_str("    0\n};\n");
    }

    fn entry(&mut self, starting_point: usize) {
        if self.mode == Mode::Cpp {
            let image = self.bcf.image_bytes();
            self.sd.push_str("\nstatic const int bytecodefb[] = {");
            for (i, w) in image.chunks_exact(4).enumerate() {
                if i % 16 == 0 {
                    self.sd.push_str("\n ");
                }
                let v = i32::from_le_bytes([w[0], w[1], w[2], w[3]]);
                let _ = write!(self.sd, " {},", v);
            }
            self.sd.push_str("\n};\n\n");
            self.sd.push_str("extern \"C\" ");
        }
        self.sd
            .push_str("StackPtr compiled_entry_point(VMRef vm, StackPtr sp) {\n");
        if self.mode == Mode::C {
            self.sd.push_str("    opal_entry_check(sizeof(Value));\n");
        }
        let _ = write!(self.sd, "    return fun_{}(vm, sp);\n}}\n\n", starting_point);
        if self.mode == Mode::Cpp {
            let image_len = self.bcf.image_bytes().len();
            self.sd.push_str("int main(int argc, char *argv[]) {\n");
            self.sd
                .push_str("    // This is hard-coded to call compiled_entry_point()\n");
            let _ = writeln!(
                self.sd,
                "    return opal_run_compiled_main(argc, argv, (const unsigned char *)bytecodefb, {}, vtables);",
                image_len
            );
            self.sd.push_str("}\n");
        }
    }
}

fn escape_and_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            // Comments must not terminate early.
            '*' => out.push('*'),
            c if c.is_control() => out.push_str("\\?"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_bytecode::{
        BytecodeBuilder, BytecodeFile, TYPE_ELEM_INT, TYPE_ELEM_STRING,
    };
    use opal_vm::default_registry;

    /// A program with one function (an arg, a local, a keepvar), a branch, a
    /// jump table and a dynamic-dispatch site.
    fn rich_program() -> BytecodeFile {
        let mut b = BytecodeBuilder::new();
        let j = b.emit_jump(Opcode::Jump);

        // fun pick(x): uses a local, a keepvar, a conditional and a switch.
        let x = b.add_var("x", TYPE_ELEM_INT);
        let tmp = b.add_var("tmp", TYPE_ELEM_STRING);
        let f = b.add_function("pick");
        let fs = b.emit_funstart(f as i32, 8, &[x as i32], &[tmp as i32], 1, &[tmp as i32]);
        b.set_function_start(f, fs);
        b.emit(Opcode::PushStr, &[0]);
        b.emit(Opcode::KeepRef, &[0, 0]);
        b.emit(Opcode::Drop, &[]);
        b.emit(Opcode::PushVar, &[x as i32]);
        b.emit(Opcode::PushInt, &[0]);
        b.emit(Opcode::EqI, &[]);
        let jf = b.emit_jump(Opcode::JumpFalse);
        b.emit(Opcode::PushVar, &[x as i32]);
        let patches = b.emit_jump_table(0, 1);
        // Case labels attach to the case-start instruction's position.
        let case0 = b.pos();
        b.set_height(0);
        b.emit(Opcode::JumpTableCaseStart, &[]);
        b.emit(Opcode::PushInt, &[10]);
        b.emit(Opcode::Drop, &[]);
        b.emit(Opcode::JumpTableEnd, &[]);
        b.patch_to_here(jf);
        b.set_height(0);
        b.block_start();
        b.emit(Opcode::PushInt, &[1]);
        b.emit_with_delta(Opcode::Return, &[f as i32, 1], -1);
        for p in patches {
            b.patch(p, case0);
        }

        // entry block: call pick(5), then exit.
        let entry = b.pos();
        b.set_height(0);
        b.emit(Opcode::PushInt, &[5]);
        b.emit_with_delta(Opcode::Call, &[fs as i32], 0);
        b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);
        b.patch(j, entry);
        b.intern_string("kept");
        BytecodeFile::load(&b.build()).unwrap()
    }

    #[test]
    fn test_cpp_output_shape() {
        let bcf = rich_program();
        let reg = default_registry();
        let out = generate(&reg, &bcf, Mode::Cpp).unwrap();
        // Forward declarations and bodies for both boundaries.
        assert!(out.contains("static StackPtr fun_"), "{}", out);
        assert!(out.matches("(VMRef vm, StackPtr psp) {").count() >= 2, "{}", out);
        // Prologue lowering.
        assert!(out.contains("u_swap_vars(vm,"), "{}", out);
        assert!(out.contains("u_backup_var(vm,"), "{}", out);
        assert!(out.contains("u_nil_val(&keepvar[0]);"), "{}", out);
        // Branch and jump-table lowering.
        assert!(out.contains("if (Pop(sp).False()) goto block"), "{}", out);
        assert!(out.contains("switch (Pop(sp).ival()) {"), "{}", out);
        assert!(out.contains("case 0:"), "{}", out);
        assert!(out.contains("default:"), "{}", out);
        assert!(out.contains("block"), "{}", out);
        // Return/epilogue lowering.
        assert!(out.contains("u_fn_ret(vm, psp,"), "{}", out);
        assert!(out.contains("u_dec_owned(vm,"), "{}", out);
        assert!(out.contains("psp = u_pop_arg(vm,"), "{}", out);
        assert!(out.contains("goto epilogue;"), "{}", out);
        assert!(out.contains("epilogue:;"), "{}", out);
        assert!(out.contains("u_restore_backup(vm,"), "{}", out);
        // Height assertions and comments.
        assert!(out.contains("assert(sp == &regs["), "{}", out);
        assert!(out.contains("/* pick */"), "{}", out);
        assert!(out.contains("/* x */"), "{}", out);
        // Direct call threading and the tables.
        assert!(out.contains("sp = fun_"), "{}", out);
        assert!(out.contains("static const fun_base_t vtables[] = {"), "{}", out);
        assert!(out.contains("static const int bytecodefb[] = {"), "{}", out);
        assert!(out.contains("compiled_entry_point"), "{}", out);
        assert!(out.contains("int main(int argc, char *argv[])"), "{}", out);
    }

    #[test]
    fn test_c_output_shape() {
        let bcf = rich_program();
        let reg = default_registry();
        let out = generate(&reg, &bcf, Mode::C).unwrap();
        // Self-contained typedefs and externs, no main.
        assert!(out.contains("typedef struct {"), "{}", out);
        assert!(out.contains("typedef Value *StackPtr;"), "{}", out);
        assert!(out.contains("extern StackPtr u_add_i(VMRef, StackPtr);"), "{}", out);
        assert!(out.contains("extern StackPtr u_push_int(VMRef, StackPtr, int);"), "{}", out);
        assert!(
            out.contains("extern StackPtr u_fun_start(VMRef, StackPtr, const int *);"),
            "{}",
            out
        );
        assert!(out.contains("opal_entry_check(sizeof(Value));"), "{}", out);
        assert!(out.contains("{ long long top = sp->ival; sp--; if (!top) goto block"), "{}", out);
        assert!(!out.contains("int main"), "{}", out);
        assert!(!out.contains("assert(sp =="), "{}", out);
        // The vtable is emitted for linking.
        assert!(out.contains("const fun_base_t vtables[] = {"), "{}", out);
    }

    #[test]
    fn test_frame_hook_lowers_to_direct_call() {
        let mut b = BytecodeBuilder::new();
        let j = b.emit_jump(Opcode::Jump);
        b.patch_to_here(j);
        let reg = default_registry();
        let hook = reg.lookup("host_frame").unwrap() as i32;
        b.emit_with_delta(Opcode::BCallRet, &[hook, 0], 0);
        b.emit(Opcode::PushInt, &[0]);
        b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);
        let bcf = BytecodeFile::load(&b.build()).unwrap();

        let out = generate(&reg, &bcf, Mode::Cpp).unwrap();
        assert!(out.contains("sp = host_frame(sp, vm);"), "{}", out);
        // The hook bypasses the registry dispatch entirely.
        assert!(!out.contains("u_bcall_ret"), "{}", out);

        let out = generate(&reg, &bcf, Mode::C).unwrap();
        assert!(out.contains("sp = host_frame(sp, vm);"), "{}", out);
        assert!(
            out.contains("extern StackPtr host_frame(StackPtr, VMRef);"),
            "{}",
            out
        );
    }

    #[test]
    fn test_corrupt_stream_is_reported() {
        let mut b = BytecodeBuilder::new();
        let j = b.emit_jump(Opcode::Jump);
        b.patch_to_here(j);
        b.emit(Opcode::PushInt, &[1]);
        b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);
        let bcf = BytecodeFile::load(&b.build()).unwrap();
        // The loader already verified the stream, so generation succeeds;
        // corruption can only arrive through a blob the host patched later.
        let reg = default_registry();
        assert!(generate(&reg, &bcf, Mode::C).is_ok());
    }
}
