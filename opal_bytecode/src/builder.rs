//! Blob writer.
//!
//! Assembles the sectioned word stream documented in [`crate::file`]. Used by
//! tests and host tooling; the production front end that normally produces
//! blobs is a separate program.
//!
//! The builder tracks the static operand-stack height while code is emitted
//! and stamps it into each instruction's `regso` word. Ops whose stack effect
//! is not derivable from their immediates (calls, returns, object
//! construction) take an explicit delta.

use crate::file::{BYTECODE_FORMAT_VERSION, BYTECODE_MAGIC, NUM_SECTIONS};
use crate::instruction::Opcode;
use crate::typetable::{TypeIdx, ValueKind, TYPE_ELEM_FLOAT, TYPE_ELEM_INT};
use std::collections::HashMap;

/// Word index of a jump target awaiting a patch.
#[derive(Debug, Clone, Copy)]
pub struct PatchIdx(usize);

#[derive(Default)]
struct EnumDef {
    name: u32,
    flags: i32,
    vals: Vec<(u32, i64)>,
}

/// Writer for the bytecode blob schema.
pub struct BytecodeBuilder {
    code: Vec<i32>,
    types: Vec<i32>,
    strings: Vec<String>,
    string_index: HashMap<String, u32>,
    idents: Vec<(u32, i32)>,
    specidents: Vec<(u32, i32)>,
    functions: Vec<(u32, i32)>,
    enums: Vec<EnumDef>,
    udts: Vec<u32>,
    vtables: Vec<i32>,
    int_vec_types: Vec<i32>,
    float_vec_types: Vec<i32>,
    filenames: Vec<u32>,
    lineinfo: Vec<(i32, i32, i32)>,
    height: i32,
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BytecodeBuilder {
    /// New builder with the canonical type-table prefix in place.
    pub fn new() -> Self {
        let types = vec![
            ValueKind::Int as i32,
            -1,
            ValueKind::Float as i32,
            ValueKind::String as i32,
            ValueKind::Any as i32,
            ValueKind::ValueBuf as i32,
            ValueKind::StackFrameBuf as i32,
            ValueKind::Vector as i32,
            TYPE_ELEM_INT.0,
            ValueKind::Vector as i32,
            TYPE_ELEM_FLOAT.0,
        ];
        BytecodeBuilder {
            code: Vec::new(),
            types,
            strings: Vec::new(),
            string_index: HashMap::new(),
            idents: Vec::new(),
            specidents: Vec::new(),
            functions: Vec::new(),
            enums: Vec::new(),
            udts: Vec::new(),
            vtables: Vec::new(),
            int_vec_types: vec![crate::typetable::TYPE_ELEM_VECTOR_OF_INT.0],
            float_vec_types: vec![crate::typetable::TYPE_ELEM_VECTOR_OF_FLOAT.0],
            filenames: Vec::new(),
            lineinfo: Vec::new(),
            height: 0,
        }
    }

    // =========================================================================
    // Code emission
    // =========================================================================

    /// Word index the next instruction will occupy.
    #[inline]
    pub fn pos(&self) -> usize {
        self.code.len()
    }

    /// Current static stack height.
    #[inline]
    pub fn height(&self) -> i32 {
        self.height
    }

    /// Override the tracked height (after a label whose predecessors diverge
    /// from the linear fall-through).
    #[inline]
    pub fn set_height(&mut self, h: i32) {
        self.height = h;
    }

    /// Emit an op with a statically known stack effect.
    ///
    /// # Panics
    ///
    /// Panics if the op's effect depends on context; use
    /// [`Self::emit_with_delta`] for those.
    pub fn emit(&mut self, op: Opcode, imms: &[i32]) -> usize {
        let delta = op
            .stack_delta(imms)
            .unwrap_or_else(|| panic!("{} needs an explicit stack delta", op));
        self.emit_with_delta(op, imms, delta)
    }

    /// Emit an op, supplying its stack effect.
    pub fn emit_with_delta(&mut self, op: Opcode, imms: &[i32], delta: i32) -> usize {
        if op.arity() != crate::instruction::ILUNKNOWN {
            assert_eq!(imms.len(), op.arity() as usize, "{} arity", op);
        }
        let at = self.code.len();
        self.code.push(op as i32);
        self.code.push(self.height);
        self.code.extend_from_slice(imms);
        self.height += delta;
        at
    }

    /// Emit a branch with a placeholder target.
    pub fn emit_jump(&mut self, op: Opcode) -> PatchIdx {
        debug_assert!(matches!(op, Opcode::Jump | Opcode::JumpFalse | Opcode::JumpTrue));
        self.emit(op, &[-1]);
        PatchIdx(self.code.len() - 1)
    }

    /// Point a pending branch at the current position.
    pub fn patch_to_here(&mut self, p: PatchIdx) {
        let at = self.pos() as i32;
        self.code[p.0] = at;
    }

    /// Point a pending branch at an explicit position.
    pub fn patch(&mut self, p: PatchIdx, target: usize) {
        self.code[p.0] = target as i32;
    }

    /// Emit a `BlockStart` label and return its position (branch target).
    pub fn block_start(&mut self) -> usize {
        self.emit(Opcode::BlockStart, &[])
    }

    /// Emit a `FunStart` record. Resets the tracked height; returns the
    /// instruction's position (the function's start ip).
    pub fn emit_funstart(
        &mut self,
        funid: i32,
        regs_max: i32,
        args: &[i32],
        defs: &[i32],
        nkeepvars: i32,
        owned: &[i32],
    ) -> usize {
        self.height = 0;
        let at = self.code.len();
        self.code.push(Opcode::FunStart as i32);
        self.code.push(0);
        self.code.push(funid);
        self.code.push(regs_max);
        self.code.push(args.len() as i32);
        self.code.extend_from_slice(args);
        self.code.push(defs.len() as i32);
        self.code.extend_from_slice(defs);
        self.code.push(nkeepvars);
        self.code.push(owned.len() as i32);
        self.code.extend_from_slice(owned);
        at
    }

    /// Emit a jump table over `mini..=maxi` with placeholder targets.
    /// Returns one patch per case plus the trailing default.
    pub fn emit_jump_table(&mut self, mini: i32, maxi: i32) -> Vec<PatchIdx> {
        assert!(maxi >= mini);
        self.code.push(Opcode::JumpTable as i32);
        self.code.push(self.height);
        self.code.push(mini);
        self.code.push(maxi);
        let n = (maxi - mini + 1) as usize + 1;
        let mut patches = Vec::with_capacity(n);
        for _ in 0..n {
            patches.push(PatchIdx(self.code.len()));
            self.code.push(-1);
        }
        self.height -= 1;
        patches
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Intern a constant string, returning its table index.
    pub fn intern_string(&mut self, s: &str) -> u32 {
        if let Some(&i) = self.string_index.get(s) {
            return i;
        }
        let i = self.strings.len() as u32;
        self.strings.push(s.to_owned());
        self.string_index.insert(s.to_owned(), i);
        i
    }

    pub fn add_ident(&mut self, name: &str, readonly: bool, global: bool) -> u32 {
        let name = self.intern_string(name);
        let flags = readonly as i32 | (global as i32) << 1;
        self.idents.push((name, flags));
        self.idents.len() as u32 - 1
    }

    pub fn add_specident(&mut self, ididx: u32, typeidx: TypeIdx) -> u32 {
        self.specidents.push((ididx, typeidx.0));
        self.specidents.len() as u32 - 1
    }

    /// Declare a plain local/global variable: ident plus specialisation.
    /// Returns the specialised-identifier index (the VM's var slot).
    pub fn add_var(&mut self, name: &str, typeidx: TypeIdx) -> u32 {
        let id = self.add_ident(name, false, false);
        self.add_specident(id, typeidx)
    }

    pub fn add_function(&mut self, name: &str) -> u32 {
        let name = self.intern_string(name);
        self.functions.push((name, -1));
        self.functions.len() as u32 - 1
    }

    pub fn set_function_start(&mut self, fidx: u32, start_ip: usize) {
        self.functions[fidx as usize].1 = start_ip as i32;
    }

    pub fn add_udt(&mut self, name: &str) -> u32 {
        let name = self.intern_string(name);
        self.udts.push(name);
        self.udts.len() as u32 - 1
    }

    pub fn add_enum(&mut self, name: &str, flags: bool, vals: &[(&str, i64)]) -> u32 {
        let name = self.intern_string(name);
        let vals = vals
            .iter()
            .map(|(n, v)| (self.intern_string(n), *v))
            .collect();
        self.enums.push(EnumDef { name, flags: flags as i32, vals });
        self.enums.len() as u32 - 1
    }

    pub fn add_vtable_entry(&mut self, start_ip: i32) -> usize {
        self.vtables.push(start_ip);
        self.vtables.len() - 1
    }

    pub fn add_filename(&mut self, name: &str) -> u32 {
        let name = self.intern_string(name);
        self.filenames.push(name);
        self.filenames.len() as u32 - 1
    }

    /// Attribute subsequent instructions to a source line.
    pub fn add_line(&mut self, line: i32, fileidx: u32) {
        self.lineinfo.push((self.pos() as i32, line, fileidx as i32));
    }

    // =========================================================================
    // Types
    // =========================================================================

    fn push_type(&mut self, words: &[i32]) -> TypeIdx {
        let at = TypeIdx(self.types.len() as i32);
        self.types.extend_from_slice(words);
        at
    }

    pub fn add_vector_type(&mut self, elem: TypeIdx) -> TypeIdx {
        self.push_type(&[ValueKind::Vector as i32, elem.0])
    }

    pub fn add_nil_type(&mut self, sub: TypeIdx) -> TypeIdx {
        self.push_type(&[ValueKind::Nil as i32, sub.0])
    }

    pub fn add_function_type(&mut self, funidx: u32) -> TypeIdx {
        self.push_type(&[ValueKind::Function as i32, funidx as i32])
    }

    pub fn add_resource_type(&mut self, restype: i32) -> TypeIdx {
        self.push_type(&[ValueKind::Resource as i32, restype])
    }

    pub fn add_class_type(
        &mut self,
        structidx: u32,
        vtable_start: i32,
        elems: &[TypeIdx],
    ) -> TypeIdx {
        let mut words = vec![
            ValueKind::Class as i32,
            structidx as i32,
            vtable_start,
            elems.len() as i32,
        ];
        words.extend(elems.iter().map(|t| t.0));
        self.push_type(&words)
    }

    pub fn add_struct_type(&mut self, structidx: u32, scalar: bool, elems: &[TypeIdx]) -> TypeIdx {
        let kind = if scalar { ValueKind::StructScalar } else { ValueKind::StructRef };
        let mut words = vec![kind as i32, structidx as i32, elems.len() as i32];
        words.extend(elems.iter().map(|t| t.0));
        self.push_type(&words)
    }

    // =========================================================================
    // Assembly
    // =========================================================================

    /// Serialise to the on-disk byte layout.
    pub fn build(&self) -> Vec<u8> {
        let mut sections: Vec<(u32, Vec<u32>)> = Vec::with_capacity(NUM_SECTIONS);

        sections.push((1, self.code.iter().map(|&w| w as u32).collect()));
        sections.push((2, self.types.iter().map(|&w| w as u32).collect()));
        sections.push((3, self.strings_section()));
        sections.push((4, counted_pairs(self.idents.iter().map(|&(n, f)| (n, f as u32)))));
        sections.push((
            5,
            counted_pairs(self.specidents.iter().map(|&(i, t)| (i, t as u32))),
        ));
        sections.push((
            6,
            counted_pairs(self.functions.iter().map(|&(n, s)| (n, s as u32))),
        ));
        sections.push((7, self.enums_section()));
        sections.push((8, counted(self.udts.iter().copied())));
        sections.push((9, counted(self.vtables.iter().map(|&v| v as u32))));
        sections.push((10, counted(self.int_vec_types.iter().map(|&v| v as u32))));
        sections.push((11, counted(self.float_vec_types.iter().map(|&v| v as u32))));
        sections.push((12, counted(self.filenames.iter().copied())));
        sections.push((13, {
            let mut v = vec![self.lineinfo.len() as u32];
            for &(ip, line, file) in &self.lineinfo {
                v.extend([ip as u32, line as u32, file as u32]);
            }
            v
        }));

        let mut words: Vec<u32> = vec![
            BYTECODE_MAGIC,
            BYTECODE_FORMAT_VERSION,
            sections.len() as u32,
        ];
        let mut off = 3 + sections.len() * 3;
        for (tag, payload) in &sections {
            words.extend([*tag, off as u32, payload.len() as u32]);
            off += payload.len();
        }
        for (_, payload) in &sections {
            words.extend_from_slice(payload);
        }

        let mut bytes = Vec::with_capacity(words.len() * 4);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    fn strings_section(&self) -> Vec<u32> {
        let n = self.strings.len();
        let mut out = vec![n as u32];
        out.resize(1 + n, 0);
        for (i, s) in self.strings.iter().enumerate() {
            out[1 + i] = out.len() as u32;
            out.push(s.len() as u32);
            for chunk in s.as_bytes().chunks(4) {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                // The loader memcpys the image and views payloads as bytes,
                // so pack in byte order via an LE round-trip.
                out.push(u32::from_le_bytes(word));
            }
        }
        out
    }

    fn enums_section(&self) -> Vec<u32> {
        let n = self.enums.len();
        let mut out = vec![n as u32];
        out.resize(1 + n, 0);
        for (i, e) in self.enums.iter().enumerate() {
            out[1 + i] = out.len() as u32;
            out.extend([e.name, e.flags as u32, e.vals.len() as u32]);
            for &(name, val) in &e.vals {
                out.extend([name, val as u64 as u32, ((val as u64) >> 32) as u32]);
            }
        }
        out
    }
}

fn counted(it: impl Iterator<Item = u32>) -> Vec<u32> {
    let items: Vec<u32> = it.collect();
    let mut out = vec![items.len() as u32];
    out.extend(items);
    out
}

fn counted_pairs(it: impl Iterator<Item = (u32, u32)>) -> Vec<u32> {
    let items: Vec<(u32, u32)> = it.collect();
    let mut out = vec![items.len() as u32];
    for (a, b) in items {
        out.extend([a, b]);
    }
    out
}
