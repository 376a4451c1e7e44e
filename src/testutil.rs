//! Hand-built ELF images for tests. Only what the loader and address-space
//! tests need: a 64-bit little-endian header, PT_LOAD segments, and an
//! optional PT_INTERP.

use byteorder::{LittleEndian, WriteBytesExt};

pub struct SegSpec {
    pub vaddr: u64,
    pub memsz: u64,
    pub flags: u32,
    pub data: Vec<u8>,
}

pub struct ElfSpec {
    pub dynamic: bool,
    pub entry: u64,
    pub segments: Vec<SegSpec>,
    pub interp: Option<String>,
}

const EHSIZE: u64 = 64;
const PHENTSIZE: u64 = 56;

pub fn build_elf64(spec: &ElfSpec) -> Vec<u8> {
    let interp_bytes = spec.interp.as_ref().map(|p| {
        let mut b = p.clone().into_bytes();
        b.push(0);
        b
    });
    let phnum = spec.segments.len() + interp_bytes.is_some() as usize;
    let data_start = EHSIZE + PHENTSIZE * phnum as u64;

    let mut out = Vec::new();
    // e_ident
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    out.write_u16::<LittleEndian>(if spec.dynamic { 3 } else { 2 })
        .unwrap(); // e_type
    out.write_u16::<LittleEndian>(62).unwrap(); // e_machine EM_X86_64
    out.write_u32::<LittleEndian>(1).unwrap(); // e_version
    out.write_u64::<LittleEndian>(spec.entry).unwrap();
    out.write_u64::<LittleEndian>(EHSIZE).unwrap(); // e_phoff
    out.write_u64::<LittleEndian>(0).unwrap(); // e_shoff
    out.write_u32::<LittleEndian>(0).unwrap(); // e_flags
    out.write_u16::<LittleEndian>(EHSIZE as u16).unwrap();
    out.write_u16::<LittleEndian>(PHENTSIZE as u16).unwrap();
    out.write_u16::<LittleEndian>(phnum as u16).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap(); // e_shentsize
    out.write_u16::<LittleEndian>(0).unwrap(); // e_shnum
    out.write_u16::<LittleEndian>(0).unwrap(); // e_shstrndx
    assert_eq!(out.len() as u64, EHSIZE);

    let mut write_phdr = |out: &mut Vec<u8>,
                          p_type: u32,
                          flags: u32,
                          offset: u64,
                          vaddr: u64,
                          filesz: u64,
                          memsz: u64| {
        out.write_u32::<LittleEndian>(p_type).unwrap();
        out.write_u32::<LittleEndian>(flags).unwrap();
        out.write_u64::<LittleEndian>(offset).unwrap();
        out.write_u64::<LittleEndian>(vaddr).unwrap();
        out.write_u64::<LittleEndian>(vaddr).unwrap(); // p_paddr
        out.write_u64::<LittleEndian>(filesz).unwrap();
        out.write_u64::<LittleEndian>(memsz).unwrap();
        out.write_u64::<LittleEndian>(0x1000).unwrap(); // p_align
    };

    let mut offset = data_start;
    for seg in &spec.segments {
        write_phdr(
            &mut out,
            1, // PT_LOAD
            seg.flags,
            offset,
            seg.vaddr,
            seg.data.len() as u64,
            seg.memsz,
        );
        offset += seg.data.len() as u64;
    }
    if let Some(interp) = &interp_bytes {
        write_phdr(&mut out, 3, 4, offset, 0, interp.len() as u64, interp.len() as u64);
    }

    for seg in &spec.segments {
        out.extend_from_slice(&seg.data);
    }
    if let Some(interp) = &interp_bytes {
        out.extend_from_slice(interp);
    }
    out
}
