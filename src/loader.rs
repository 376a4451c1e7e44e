use std::path::Path;

use anyhow::anyhow;
use goblin::container::Endian;
use goblin::elf::header::{EM_MIPS, EM_X86_64, ET_DYN, ET_EXEC};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_INTERP, PT_LOAD};
use goblin::elf::Elf;
use unicorn_engine::unicorn_const::Permission;

use crate::errors::{EmulatorError, Result};
use crate::utils::page_align;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadType {
    Exec,
    Dyn,
}

/// An image-local symbol. `end == 0` means the extent is unknown.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

/// One loadable piece of the image: guest address, in-memory size, declared
/// protection and the raw file bytes to place there.
#[derive(Clone, Debug)]
pub struct SegmentData {
    pub addr: u64,
    pub size: u64,
    pub prot: Permission,
    pub data: Vec<u8>,
}

/// What the address-space builder needs from a parsed binary.
pub trait Loader {
    fn arch(&self) -> &str;
    fn os(&self) -> &str;
    fn bits(&self) -> u32;
    fn byte_order(&self) -> Endian;
    fn load_type(&self) -> LoadType;
    fn entry(&self) -> u64;
    fn segments(&self) -> &[SegmentData];
    fn interp(&self) -> Option<&str>;
    fn symbols(&self) -> &[Symbol];
}

/// Translate ELF segment perms to engine protection constants.
pub fn seg_perm_to_uc_prot(perm: u32) -> Permission {
    let mut prot = Permission::NONE;
    if perm & PF_X != 0 {
        prot |= Permission::EXEC;
    }
    if perm & PF_W != 0 {
        prot |= Permission::WRITE;
    }
    if perm & PF_R != 0 {
        prot |= Permission::READ;
    }
    prot
}

/// ELF binary, parsed eagerly so the loader owns everything it hands out.
pub struct ElfLoader {
    arch: &'static str,
    bits: u32,
    endian: Endian,
    load_type: LoadType,
    entry: u64,
    segments: Vec<SegmentData>,
    interp: Option<String>,
    symbols: Vec<Symbol>,
}

impl ElfLoader {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(std::fs::read(path)?)
    }

    pub fn new(data: Vec<u8>) -> Result<Self> {
        let elf = Elf::parse(&data)?;
        let load_type = match elf.header.e_type {
            ET_EXEC => LoadType::Exec,
            ET_DYN => LoadType::Dyn,
            t => return Err(EmulatorError::UnsupportedLoadType(t)),
        };
        let arch = match elf.header.e_machine {
            EM_X86_64 => "x86_64",
            EM_MIPS => "mips",
            m => return Err(EmulatorError::UnsupportedArch(format!("e_machine {}", m))),
        };
        let endian = elf.header.endianness()?;
        let bits = if elf.is_64 { 64 } else { 32 };

        let mut segments = Vec::new();
        let mut interp = None;
        for ph in &elf.program_headers {
            match ph.p_type {
                PT_LOAD => {
                    let start = ph.p_offset as usize;
                    let end = start + ph.p_filesz as usize;
                    let bytes = data
                        .get(start..end)
                        .ok_or_else(|| anyhow!("segment data out of file bounds"))?;
                    segments.push(SegmentData {
                        addr: ph.p_vaddr,
                        size: ph.p_memsz,
                        prot: seg_perm_to_uc_prot(ph.p_flags),
                        data: bytes.to_vec(),
                    });
                }
                PT_INTERP => {
                    interp = elf.interpreter.map(String::from);
                }
                _ => {}
            }
        }

        let mut symbols = Vec::new();
        for sym in elf.syms.iter() {
            if let Some(name) = elf.strtab.get_at(sym.st_name) {
                symbols.push(Symbol {
                    name: name.to_string(),
                    start: sym.st_value,
                    end: if sym.st_size == 0 {
                        0
                    } else {
                        sym.st_value + sym.st_size
                    },
                });
            }
        }
        for sym in elf.dynsyms.iter() {
            if let Some(name) = elf.dynstrtab.get_at(sym.st_name) {
                symbols.push(Symbol {
                    name: name.to_string(),
                    start: sym.st_value,
                    end: if sym.st_size == 0 {
                        0
                    } else {
                        sym.st_value + sym.st_size
                    },
                });
            }
        }

        Ok(Self {
            arch,
            bits,
            endian,
            load_type,
            entry: elf.entry,
            segments,
            interp,
            symbols,
        })
    }
}

impl Loader for ElfLoader {
    fn arch(&self) -> &str {
        self.arch
    }

    fn os(&self) -> &str {
        "linux"
    }

    fn bits(&self) -> u32 {
        self.bits
    }

    fn byte_order(&self) -> Endian {
        self.endian
    }

    fn load_type(&self) -> LoadType {
        self.load_type
    }

    fn entry(&self) -> u64 {
        self.entry
    }

    fn segments(&self) -> &[SegmentData] {
        &self.segments
    }

    fn interp(&self) -> Option<&str> {
        self.interp.as_deref()
    }

    fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }
}

/// A page-aligned guest span with its (possibly merged) protection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
    pub prot: Permission,
}

impl Segment {
    pub fn from_raw(addr: u64, size: u64, prot: Permission) -> Self {
        let (start, size) = page_align(addr, size);
        Self {
            start,
            end: start + size,
            prot,
        }
    }

    pub fn overlaps(&self, other: &Segment) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Union of the spans; protection is the OR of both, keeping the loosest
    /// permission the way ELF semantics expect.
    pub fn merge(&mut self, other: &Segment) {
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
        self.prot |= other.prot;
    }
}

/// Fold segments into a disjoint set by repeatedly unioning overlapping
/// spans. The engine rejects overlapping mappings, so this runs to a fixed
/// point: a union can itself create a new overlap with an earlier span.
pub fn merge_segments(input: Vec<Segment>) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::with_capacity(input.len());
    'outer: for seg in input {
        for m in merged.iter_mut() {
            if m.overlaps(&seg) {
                m.merge(&seg);
                continue 'outer;
            }
        }
        merged.push(seg);
    }
    loop {
        let mut changed = false;
        'scan: for i in 0..merged.len() {
            for j in i + 1..merged.len() {
                if merged[i].overlaps(&merged[j]) {
                    let other = merged.remove(j);
                    merged[i].merge(&other);
                    changed = true;
                    break 'scan;
                }
            }
        }
        if !changed {
            break;
        }
    }
    merged.sort_by_key(|s| s.start);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{build_elf64, ElfSpec, SegSpec};

    fn seg(start: u64, end: u64, prot: Permission) -> Segment {
        Segment { start, end, prot }
    }

    #[test]
    fn test_merge_overlapping_prot_union() {
        let merged = merge_segments(vec![
            seg(0x1000, 0x3000, Permission::READ),
            seg(0x2000, 0x4000, Permission::WRITE),
        ]);
        assert_eq!(
            merged,
            vec![seg(0x1000, 0x4000, Permission::READ | Permission::WRITE)]
        );
    }

    #[test]
    fn test_merge_is_idempotent_and_disjoint() {
        let input = vec![
            seg(0x0000, 0x2000, Permission::READ),
            seg(0x3000, 0x5000, Permission::WRITE),
            seg(0x1000, 0x4000, Permission::EXEC),
            seg(0x8000, 0x9000, Permission::READ),
        ];
        let merged = merge_segments(input);
        for (i, a) in merged.iter().enumerate() {
            for b in &merged[i + 1..] {
                assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
            }
        }
        // the chained overlap collapses into a single span covering the union
        assert_eq!(
            merged,
            vec![
                seg(0x0000, 0x5000, Permission::READ | Permission::WRITE | Permission::EXEC),
                seg(0x8000, 0x9000, Permission::READ),
            ]
        );
        let again = merge_segments(merged.clone());
        assert_eq!(again, merged);
    }

    #[test]
    fn test_adjacent_segments_stay_separate() {
        let merged = merge_segments(vec![
            seg(0x1000, 0x2000, Permission::READ),
            seg(0x2000, 0x3000, Permission::WRITE),
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_elf_loader_parses_minimal_exec() {
        let image = build_elf64(&ElfSpec {
            dynamic: false,
            entry: 0x401000,
            segments: vec![SegSpec {
                vaddr: 0x400000,
                memsz: 0x2000,
                flags: PF_R | PF_W | PF_X,
                data: vec![0x90; 16],
            }],
            interp: None,
        });
        let loader = ElfLoader::new(image).unwrap();
        assert_eq!(loader.arch(), "x86_64");
        assert_eq!(loader.os(), "linux");
        assert_eq!(loader.bits(), 64);
        assert_eq!(loader.byte_order(), Endian::Little);
        assert_eq!(loader.load_type(), LoadType::Exec);
        assert_eq!(loader.entry(), 0x401000);
        assert_eq!(loader.segments().len(), 1);
        let seg = &loader.segments()[0];
        assert_eq!(seg.addr, 0x400000);
        assert_eq!(seg.size, 0x2000);
        assert_eq!(seg.prot, Permission::ALL);
        assert!(loader.interp().is_none());
    }

    #[test]
    fn test_elf_loader_rejects_unknown_type() {
        let mut image = build_elf64(&ElfSpec {
            dynamic: false,
            entry: 0,
            segments: vec![],
            interp: None,
        });
        image[16] = 4; // ET_CORE
        match ElfLoader::new(image) {
            Err(EmulatorError::UnsupportedLoadType(4)) => {}
            other => panic!("expected UnsupportedLoadType, got {:?}", other.err()),
        }
    }
}
