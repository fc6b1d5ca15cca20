//! The bytecode blob: a verified, sectioned stream of 32-bit words.
//!
//! A blob is one contiguous word array: a header, a section directory, then
//! the sections. All numeric fields are little-endian words; string payloads
//! are raw bytes packed into words. On a little-endian host the code and
//! type-table sections are viewed in place; on a big-endian host both are
//! byte-swapped into owned buffers at load time and every other field goes
//! through an endian-correcting read.
//!
//! Layout:
//!
//! ```text
//! word 0           magic "OPBL"
//! word 1           format version
//! word 2           section count
//! words 3..        directory: (tag, word_offset, word_len) per section
//! words ..         section payloads
//! ```

use crate::instruction::{parse_op, Opcode};
use crate::typetable::{validate_table, TypeIdx};
use std::fmt;

/// `"OPBL"` as a little-endian word.
pub const BYTECODE_MAGIC: u32 = u32::from_le_bytes(*b"OPBL");

/// Version stamped into every blob; loading any other version fails.
pub const BYTECODE_FORMAT_VERSION: u32 = 3;

/// Section tags. Directory order is free; tags are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SectionTag {
    Code = 1,
    TypeTable = 2,
    Strings = 3,
    Idents = 4,
    SpecIdents = 5,
    Functions = 6,
    Enums = 7,
    Udts = 8,
    Vtables = 9,
    IntVecTypes = 10,
    FloatVecTypes = 11,
    Filenames = 12,
    LineInfo = 13,
}

pub(crate) const NUM_SECTIONS: usize = 13;

/// A blob load failure. Fatal before any VM is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Structural verification failed.
    Verification(String),
    /// The blob was produced by another format version.
    VersionMismatch { found: u32, expected: u32 },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Verification(m) => write!(f, "bytecode file failed to verify: {}", m),
            LoadError::VersionMismatch { found, expected } => write!(
                f,
                "bytecode is from a different version (found {}, expected {})",
                found, expected
            ),
        }
    }
}

impl std::error::Error for LoadError {}

fn verify_err<T>(msg: impl Into<String>) -> Result<T, LoadError> {
    Err(LoadError::Verification(msg.into()))
}

/// Ident metadata: name plus declaration flags.
#[derive(Debug, Clone, Copy)]
pub struct IdentInfo {
    pub name: u32,
    pub readonly: bool,
    pub global: bool,
}

/// Specialised identifier: one concrete (identifier, static type) pair.
#[derive(Debug, Clone, Copy)]
pub struct SpecIdentInfo {
    pub ididx: u32,
    pub typeidx: TypeIdx,
}

/// Function metadata: name and the word index of its `FunStart`.
#[derive(Debug, Clone, Copy)]
pub struct FunctionInfo {
    pub name: u32,
    pub start_ip: usize,
}

/// One source position attributed to an instruction range.
#[derive(Debug, Clone, Copy)]
pub struct LineInfo {
    pub line: i32,
    pub fileidx: u32,
}

/// An immutable, verified bytecode blob.
///
/// Shared read-only between worker VMs via `Arc`.
#[derive(Debug)]
pub struct BytecodeFile {
    /// Raw file image; byte order is the file's regardless of host.
    words: Box<[u32]>,
    /// `(word_offset, word_len)` per section, indexed by tag − 1.
    sections: [Option<(usize, usize)>; NUM_SECTIONS],
    #[cfg(target_endian = "big")]
    code_swapped: Box<[i32]>,
    #[cfg(target_endian = "big")]
    typetable_swapped: Box<[i32]>,
}

impl BytecodeFile {
    /// Load and verify a blob. The returned file owns an aligned copy of the
    /// image; all subsequent section access is allocation-free.
    pub fn load(bytes: &[u8]) -> Result<BytecodeFile, LoadError> {
        if bytes.len() % 4 != 0 || bytes.len() < 12 {
            return verify_err("not a whole number of words");
        }
        let words: Box<[u32]> = bytes
            .chunks_exact(4)
            // from_ne_bytes: keep the raw image so byte-view sections (strings)
            // read back exactly; numeric reads apply from_le at access time.
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        if u32::from_le(words[0]) != BYTECODE_MAGIC {
            return verify_err("bad magic");
        }
        let version = u32::from_le(words[1]);
        if version != BYTECODE_FORMAT_VERSION {
            return Err(LoadError::VersionMismatch {
                found: version,
                expected: BYTECODE_FORMAT_VERSION,
            });
        }

        let nsections = u32::from_le(words[2]) as usize;
        let mut sections = [None; NUM_SECTIONS];
        let dir_end = 3 + nsections * 3;
        if dir_end > words.len() {
            return verify_err("section directory out of bounds");
        }
        for s in 0..nsections {
            let tag = u32::from_le(words[3 + s * 3]) as usize;
            let off = u32::from_le(words[4 + s * 3]) as usize;
            let len = u32::from_le(words[5 + s * 3]) as usize;
            if tag == 0 || tag > NUM_SECTIONS {
                return verify_err(format!("unknown section tag {}", tag));
            }
            if off < dir_end || off + len > words.len() {
                return verify_err(format!("section {} out of bounds", tag));
            }
            sections[tag - 1] = Some((off, len));
        }

        #[cfg(target_endian = "big")]
        let (code_swapped, typetable_swapped) = {
            let swap = |range: Option<(usize, usize)>| -> Box<[i32]> {
                let (off, len) = range.unwrap_or((0, 0));
                words[off..off + len].iter().map(|w| u32::from_le(*w) as i32).collect()
            };
            (swap(sections[SectionTag::Code as usize - 1]),
             swap(sections[SectionTag::TypeTable as usize - 1]))
        };

        let file = BytecodeFile {
            words,
            sections,
            #[cfg(target_endian = "big")]
            code_swapped,
            #[cfg(target_endian = "big")]
            typetable_swapped,
        };
        file.verify()?;
        Ok(file)
    }

    // Endian-correct read of one word in a section.
    #[inline]
    fn w(&self, sec: SectionTag, i: usize) -> i32 {
        let (off, len) = self.sections[sec as usize - 1].unwrap_or((0, 0));
        debug_assert!(i < len);
        u32::from_le(self.words[off + i]) as i32
    }

    #[inline]
    fn sec_len(&self, sec: SectionTag) -> usize {
        self.sections[sec as usize - 1].map_or(0, |(_, l)| l)
    }

    fn sec_bytes(&self, sec: SectionTag) -> &[u8] {
        let (off, len) = self.sections[sec as usize - 1].unwrap_or((0, 0));
        let words = &self.words[off..off + len];
        // Safety: u32 -> u8 reinterpretation is always valid; the slice is the
        // raw file image, so bytes come back in file order on any host.
        unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, words.len() * 4) }
    }

    /// The raw blob image, for embedding in transpiled output.
    pub fn image_bytes(&self) -> &[u8] {
        // Safety: u32 -> u8 reinterpretation is always valid; the words are
        // the unmodified file image.
        unsafe {
            std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.words.len() * 4)
        }
    }

    /// The instruction stream. Zero-copy on little-endian hosts.
    #[inline]
    pub fn code(&self) -> &[i32] {
        #[cfg(target_endian = "little")]
        {
            let (off, len) = self.sections[SectionTag::Code as usize - 1].unwrap_or((0, 0));
            let words = &self.words[off..off + len];
            // Safety: i32 and u32 share size and alignment, and on a
            // little-endian host the stored LE words are native values.
            unsafe { std::slice::from_raw_parts(words.as_ptr() as *const i32, words.len()) }
        }
        #[cfg(target_endian = "big")]
        {
            &self.code_swapped
        }
    }

    /// The flat type table. Zero-copy on little-endian hosts.
    #[inline]
    pub fn type_table(&self) -> &[i32] {
        #[cfg(target_endian = "little")]
        {
            let (off, len) = self.sections[SectionTag::TypeTable as usize - 1].unwrap_or((0, 0));
            let words = &self.words[off..off + len];
            // Safety: as in `code`.
            unsafe { std::slice::from_raw_parts(words.as_ptr() as *const i32, words.len()) }
        }
        #[cfg(target_endian = "big")]
        {
            &self.typetable_swapped
        }
    }

    pub fn num_strings(&self) -> usize {
        if self.sec_len(SectionTag::Strings) == 0 {
            0
        } else {
            self.w(SectionTag::Strings, 0) as usize
        }
    }

    /// Constant string by index.
    pub fn string(&self, i: usize) -> &str {
        debug_assert!(i < self.num_strings());
        let entry = self.w(SectionTag::Strings, 1 + i) as usize;
        let byte_len = self.w(SectionTag::Strings, entry) as usize;
        let bytes = self.sec_bytes(SectionTag::Strings);
        let start = (entry + 1) * 4;
        // Safety: entry bounds and UTF-8 validity are checked in `verify`.
        unsafe { std::str::from_utf8_unchecked(&bytes[start..start + byte_len]) }
    }

    pub fn num_idents(&self) -> usize {
        if self.sec_len(SectionTag::Idents) == 0 {
            0
        } else {
            self.w(SectionTag::Idents, 0) as usize
        }
    }

    pub fn ident(&self, i: usize) -> IdentInfo {
        debug_assert!(i < self.num_idents());
        let name = self.w(SectionTag::Idents, 1 + i * 2) as u32;
        let flags = self.w(SectionTag::Idents, 2 + i * 2);
        IdentInfo { name, readonly: flags & 1 != 0, global: flags & 2 != 0 }
    }

    pub fn num_specidents(&self) -> usize {
        if self.sec_len(SectionTag::SpecIdents) == 0 {
            0
        } else {
            self.w(SectionTag::SpecIdents, 0) as usize
        }
    }

    pub fn specident(&self, i: usize) -> SpecIdentInfo {
        debug_assert!(i < self.num_specidents());
        SpecIdentInfo {
            ididx: self.w(SectionTag::SpecIdents, 1 + i * 2) as u32,
            typeidx: TypeIdx(self.w(SectionTag::SpecIdents, 2 + i * 2)),
        }
    }

    pub fn num_functions(&self) -> usize {
        if self.sec_len(SectionTag::Functions) == 0 {
            0
        } else {
            self.w(SectionTag::Functions, 0) as usize
        }
    }

    pub fn function(&self, i: usize) -> FunctionInfo {
        debug_assert!(i < self.num_functions());
        FunctionInfo {
            name: self.w(SectionTag::Functions, 1 + i * 2) as u32,
            start_ip: self.w(SectionTag::Functions, 2 + i * 2) as usize,
        }
    }

    pub fn function_name(&self, i: usize) -> &str {
        self.string(self.function(i).name as usize)
    }

    pub fn num_enums(&self) -> usize {
        if self.sec_len(SectionTag::Enums) == 0 {
            0
        } else {
            self.w(SectionTag::Enums, 0) as usize
        }
    }

    fn enum_entry(&self, i: usize) -> usize {
        self.w(SectionTag::Enums, 1 + i) as usize
    }

    pub fn enum_name(&self, i: usize) -> &str {
        self.string(self.w(SectionTag::Enums, self.enum_entry(i)) as usize)
    }

    /// Whether the enum is a bit-flags set.
    pub fn enum_flags(&self, i: usize) -> bool {
        self.w(SectionTag::Enums, self.enum_entry(i) + 1) != 0
    }

    pub fn enum_num_vals(&self, i: usize) -> usize {
        self.w(SectionTag::Enums, self.enum_entry(i) + 2) as usize
    }

    /// `(name, value)` of one enum member.
    pub fn enum_val(&self, i: usize, j: usize) -> (&str, i64) {
        debug_assert!(j < self.enum_num_vals(i));
        let e = self.enum_entry(i) + 3 + j * 3;
        let name = self.w(SectionTag::Enums, e) as usize;
        let lo = self.w(SectionTag::Enums, e + 1) as u32 as u64;
        let hi = self.w(SectionTag::Enums, e + 2) as u32 as u64;
        (self.string(name), (hi << 32 | lo) as i64)
    }

    pub fn num_udts(&self) -> usize {
        if self.sec_len(SectionTag::Udts) == 0 {
            0
        } else {
            self.w(SectionTag::Udts, 0) as usize
        }
    }

    pub fn udt_name(&self, i: usize) -> &str {
        debug_assert!(i < self.num_udts());
        self.string(self.w(SectionTag::Udts, 1 + i) as usize)
    }

    pub fn num_vtable_entries(&self) -> usize {
        if self.sec_len(SectionTag::Vtables) == 0 {
            0
        } else {
            self.w(SectionTag::Vtables, 0) as usize
        }
    }

    /// Function start ip for a vtable slot, or −1 when absent.
    pub fn vtable_entry(&self, i: usize) -> i32 {
        debug_assert!(i < self.num_vtable_entries());
        self.w(SectionTag::Vtables, 1 + i)
    }

    fn vec_type(&self, sec: SectionTag, dims: usize) -> Option<TypeIdx> {
        if self.sec_len(sec) == 0 {
            return None;
        }
        let n = self.w(sec, 0) as usize;
        if dims >= n {
            return None;
        }
        let t = self.w(sec, 1 + dims);
        if t < 0 {
            None
        } else {
            Some(TypeIdx(t))
        }
    }

    pub fn default_int_vector_type(&self, dims: usize) -> Option<TypeIdx> {
        self.vec_type(SectionTag::IntVecTypes, dims)
    }

    pub fn default_float_vector_type(&self, dims: usize) -> Option<TypeIdx> {
        self.vec_type(SectionTag::FloatVecTypes, dims)
    }

    pub fn num_filenames(&self) -> usize {
        if self.sec_len(SectionTag::Filenames) == 0 {
            0
        } else {
            self.w(SectionTag::Filenames, 0) as usize
        }
    }

    pub fn filename(&self, i: usize) -> &str {
        debug_assert!(i < self.num_filenames());
        self.string(self.w(SectionTag::Filenames, 1 + i) as usize)
    }

    /// Source position of an instruction: the last line record at or before
    /// `ip`.
    pub fn lookup_line(&self, ip: usize) -> Option<LineInfo> {
        let n = if self.sec_len(SectionTag::LineInfo) == 0 {
            0
        } else {
            self.w(SectionTag::LineInfo, 0) as usize
        };
        let mut best = None;
        for i in 0..n {
            let rec_ip = self.w(SectionTag::LineInfo, 1 + i * 3) as usize;
            if rec_ip <= ip {
                best = Some(LineInfo {
                    line: self.w(SectionTag::LineInfo, 2 + i * 3),
                    fileidx: self.w(SectionTag::LineInfo, 3 + i * 3) as u32,
                });
            }
        }
        best
    }

    // =========================================================================
    // Verification
    // =========================================================================

    fn verify(&self) -> Result<(), LoadError> {
        let code = self.code();
        if code.is_empty() {
            return verify_err("empty code section");
        }
        if Opcode::from_i32(code[0]) != Some(Opcode::Jump) {
            return verify_err("program does not start with a jump");
        }
        let mut pos = 0usize;
        while pos < code.len() {
            match parse_op(code, pos) {
                Ok(p) => pos = p.next,
                Err(e) => return verify_err(e.to_string()),
            }
        }

        if !validate_table(self.type_table()) {
            return verify_err("malformed type table");
        }

        // Strings: directory and payload bounds, UTF-8.
        let slen = self.sec_len(SectionTag::Strings);
        let nstrings = self.num_strings();
        if slen > 0 && 1 + nstrings > slen {
            return verify_err("string directory out of bounds");
        }
        for i in 0..nstrings {
            let entry = self.w(SectionTag::Strings, 1 + i) as usize;
            if entry >= slen {
                return verify_err("string entry out of bounds");
            }
            let byte_len = self.w(SectionTag::Strings, entry);
            if byte_len < 0 || entry + 1 + (byte_len as usize + 3) / 4 > slen {
                return verify_err("string payload out of bounds");
            }
            let bytes = self.sec_bytes(SectionTag::Strings);
            let start = (entry + 1) * 4;
            if std::str::from_utf8(&bytes[start..start + byte_len as usize]).is_err() {
                return verify_err("string payload is not UTF-8");
            }
        }

        let check_str = |idx: i32| -> Result<(), LoadError> {
            if idx < 0 || idx as usize >= nstrings {
                verify_err("string index out of bounds")
            } else {
                Ok(())
            }
        };

        for i in 0..self.num_idents() {
            check_str(self.ident(i).name as i32)?;
        }
        let nidents = self.num_idents();
        for i in 0..self.num_specidents() {
            let si = self.specident(i);
            if si.ididx as usize >= nidents {
                return verify_err("specident identifier out of bounds");
            }
            if si.typeidx.0 < 0 || si.typeidx.0 as usize >= self.type_table().len() {
                return verify_err("specident type out of bounds");
            }
        }
        for i in 0..self.num_functions() {
            let f = self.function(i);
            check_str(f.name as i32)?;
            if f.start_ip >= code.len() {
                return verify_err("function start out of bounds");
            }
        }
        for i in 0..self.num_udts() {
            check_str(self.w(SectionTag::Udts, 1 + i))?;
        }
        for i in 0..self.num_filenames() {
            check_str(self.w(SectionTag::Filenames, 1 + i))?;
        }
        for i in 0..self.num_enums() {
            let entry = self.enum_entry(i);
            let elen = self.sec_len(SectionTag::Enums);
            if entry + 3 > elen {
                return verify_err("enum entry out of bounds");
            }
            let nvals = self.enum_num_vals(i);
            if entry + 3 + nvals * 3 > elen {
                return verify_err("enum values out of bounds");
            }
        }
        for i in 0..self.num_vtable_entries() {
            let e = self.vtable_entry(i);
            if e >= 0 && e as usize >= code.len() {
                return verify_err("vtable entry out of bounds");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BytecodeBuilder;
    use crate::typetable::TYPE_ELEM_INT;

    fn minimal_blob() -> Vec<u8> {
        let mut b = BytecodeBuilder::new();
        let j = b.emit_jump(Opcode::Jump);
        b.patch_to_here(j);
        b.emit(Opcode::PushInt, &[1]);
        b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);
        b.build()
    }

    #[test]
    fn test_load_minimal() {
        let blob = minimal_blob();
        let f = BytecodeFile::load(&blob).unwrap();
        assert_eq!(Opcode::from_i32(f.code()[0]), Some(Opcode::Jump));
        assert!(validate_table(f.type_table()));
    }

    #[test]
    fn test_version_mismatch() {
        let mut blob = minimal_blob();
        // Version is word 1.
        blob[4..8].copy_from_slice(&(BYTECODE_FORMAT_VERSION - 1).to_le_bytes());
        let err = BytecodeFile::load(&blob).unwrap_err();
        assert!(matches!(err, LoadError::VersionMismatch { .. }));
        assert!(err.to_string().contains("bytecode is from a different version"));
    }

    #[test]
    fn test_bad_magic() {
        let mut blob = minimal_blob();
        blob[0] = b'X';
        assert!(matches!(
            BytecodeFile::load(&blob),
            Err(LoadError::Verification(_))
        ));
    }

    #[test]
    fn test_truncated() {
        let blob = minimal_blob();
        assert!(BytecodeFile::load(&blob[..8]).is_err());
        assert!(BytecodeFile::load(&blob[..blob.len() - 3]).is_err());
    }

    #[test]
    fn test_corrupt_code_rejected() {
        let mut b = BytecodeBuilder::new();
        let j = b.emit_jump(Opcode::Jump);
        b.patch_to_here(j);
        b.emit(Opcode::PushInt, &[1]);
        b.emit(Opcode::Exit, &[TYPE_ELEM_INT.0]);
        let mut blob = b.build();
        // Stomp the PushInt opcode word (code word 3) with garbage. The code
        // section is the first section, right after the directory.
        assert!(BytecodeFile::load(&blob).is_ok());
        // Word 4 is the first directory entry's offset (the code section).
        let code_off = u32::from_le_bytes(blob[16..20].try_into().unwrap()) as usize;
        let target = (code_off + 3) * 4;
        blob[target..target + 4].copy_from_slice(&999i32.to_le_bytes());
        assert!(BytecodeFile::load(&blob).is_err());
    }
}
