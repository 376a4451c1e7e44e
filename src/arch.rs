use std::collections::BTreeMap;

use goblin::container::Endian;
use unicorn_engine::unicorn_const::{Arch as UcArch, Mode};
use unicorn_engine::{RegisterMIPS, RegisterX86};

use crate::cc::SyscallCC;
use crate::engine::Engine;
use crate::errors::{EmulatorError, Result};
use crate::kernel::{linux, Kernel};
use crate::utils::register_name_order;

/// One engine register handle plus its dump name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Reg {
    pub enum_: i32,
    pub name: &'static str,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegVal {
    pub reg: Reg,
    pub val: u64,
}

/// An OS personality: a kernel factory bound to a running emulator, the
/// initial-stack layout routine, and the interrupt handler.
#[derive(Clone, Copy)]
pub struct OsPersonality {
    pub name: &'static str,
    pub kernels: fn(&mut Engine<'_>) -> Vec<Box<dyn Kernel>>,
    pub init: fn(&mut Engine<'_>, &[String], &[String]) -> Result<()>,
    pub interrupt: fn(&mut Engine<'_>, u32),
}

/// Static description of a guest architecture: engine identifiers, word
/// width, PC/SP handles, the register map and its dump ordering, the
/// syscall calling convention and the OS personalities registered on it.
#[derive(Clone)]
pub struct ArchSpec {
    pub name: &'static str,
    pub bits: u32,
    /// disassembler tag for the external disassembler seam
    pub dis: &'static str,
    pub default_endian: Endian,
    pub uc_arch: UcArch,
    base_mode: Mode,
    pub pc: i32,
    pub sp: i32,
    pub regs: BTreeMap<&'static str, i32>,
    reg_list: Vec<Reg>,
    pub cc: SyscallCC,
    os: Vec<OsPersonality>,
}

impl ArchSpec {
    #[allow(clippy::too_many_arguments)]
    fn new(
        name: &'static str,
        bits: u32,
        dis: &'static str,
        default_endian: Endian,
        uc_arch: UcArch,
        base_mode: Mode,
        pc: i32,
        sp: i32,
        regs: &[(&'static str, i32)],
        cc: SyscallCC,
    ) -> Self {
        let mut reg_list: Vec<Reg> = regs
            .iter()
            .map(|&(name, enum_)| Reg { enum_, name })
            .collect();
        reg_list.sort_by(|a, b| register_name_order(a.name, b.name));
        Self {
            name,
            bits,
            dis,
            default_endian,
            uc_arch,
            base_mode,
            pc,
            sp,
            regs: regs.iter().copied().collect(),
            reg_list,
            cc,
            os: Vec::new(),
        }
    }

    /// Duplicate names would silently shadow in a registry consulted once
    /// per emulator, so they are rejected outright.
    pub fn register_os(&mut self, os: OsPersonality) {
        if self.os.iter().any(|o| o.name == os.name) {
            panic!("duplicate OS {} on {}", os.name, self.name);
        }
        self.os.push(os);
    }

    pub fn get_os(&self, name: &str) -> Option<OsPersonality> {
        self.os.iter().find(|o| o.name == name).copied()
    }

    /// Registers in dump order (natural sort cached at construction).
    pub fn reg_list(&self) -> &[Reg] {
        &self.reg_list
    }

    /// Engine mode with the image byte order folded in.
    pub fn uc_mode(&self, endian: Endian) -> Mode {
        let mut mode = self.base_mode;
        if self.uc_arch == UcArch::MIPS {
            match endian {
                Endian::Little => {
                    mode |= Mode::LITTLE_ENDIAN;
                }
                Endian::Big => {
                    mode |= Mode::BIG_ENDIAN;
                }
            }
        }
        mode
    }
}

/// Image-derived facts every subsystem needs: byte order and word size.
pub trait ArchInfo {
    fn endian(&self) -> Endian;
    fn pointer_size(&self) -> u8;
    fn bits(&self) -> u32;
}

impl<'a> ArchInfo for Engine<'a> {
    fn endian(&self) -> Endian {
        self.get_data().endian
    }

    fn pointer_size(&self) -> u8 {
        (self.get_data().arch.bits / 8) as u8
    }

    fn bits(&self) -> u32 {
        self.get_data().arch.bits
    }
}

static X86_64_SYSCALL_ARGS: &[i32] = &[
    RegisterX86::RDI as i32,
    RegisterX86::RSI as i32,
    RegisterX86::RDX as i32,
    RegisterX86::R10 as i32,
    RegisterX86::R8 as i32,
    RegisterX86::R9 as i32,
];

fn x86_64() -> ArchSpec {
    let regs: &[(&'static str, i32)] = &[
        ("rax", RegisterX86::RAX as i32),
        ("rbx", RegisterX86::RBX as i32),
        ("rcx", RegisterX86::RCX as i32),
        ("rdx", RegisterX86::RDX as i32),
        ("rsi", RegisterX86::RSI as i32),
        ("rdi", RegisterX86::RDI as i32),
        ("rbp", RegisterX86::RBP as i32),
        ("rsp", RegisterX86::RSP as i32),
        ("r8", RegisterX86::R8 as i32),
        ("r9", RegisterX86::R9 as i32),
        ("r10", RegisterX86::R10 as i32),
        ("r11", RegisterX86::R11 as i32),
        ("r12", RegisterX86::R12 as i32),
        ("r13", RegisterX86::R13 as i32),
        ("r14", RegisterX86::R14 as i32),
        ("r15", RegisterX86::R15 as i32),
    ];
    let mut spec = ArchSpec::new(
        "x86_64",
        64,
        "x86.64",
        Endian::Little,
        UcArch::X86,
        Mode::MODE_64,
        RegisterX86::RIP as i32,
        RegisterX86::RSP as i32,
        regs,
        SyscallCC {
            num_reg: RegisterX86::RAX as i32,
            ret_reg: RegisterX86::RAX as i32,
            err_reg: None,
            arg_regs: X86_64_SYSCALL_ARGS,
            shadow: 0,
        },
    );
    spec.register_os(linux::personality());
    spec
}

static MIPS_SYSCALL_ARGS: &[i32] = &[
    RegisterMIPS::A0 as i32,
    RegisterMIPS::A1 as i32,
    RegisterMIPS::A2 as i32,
    RegisterMIPS::A3 as i32,
];

fn mips() -> ArchSpec {
    let regs: &[(&'static str, i32)] = &[
        ("at", RegisterMIPS::AT as i32),
        ("v0", RegisterMIPS::V0 as i32),
        ("v1", RegisterMIPS::V1 as i32),
        ("a0", RegisterMIPS::A0 as i32),
        ("a1", RegisterMIPS::A1 as i32),
        ("a2", RegisterMIPS::A2 as i32),
        ("a3", RegisterMIPS::A3 as i32),
        ("t0", RegisterMIPS::T0 as i32),
        ("t1", RegisterMIPS::T1 as i32),
        ("t2", RegisterMIPS::T2 as i32),
        ("t3", RegisterMIPS::T3 as i32),
        ("t4", RegisterMIPS::T4 as i32),
        ("t5", RegisterMIPS::T5 as i32),
        ("t6", RegisterMIPS::T6 as i32),
        ("t7", RegisterMIPS::T7 as i32),
        ("t8", RegisterMIPS::T8 as i32),
        ("t9", RegisterMIPS::T9 as i32),
        ("s0", RegisterMIPS::S0 as i32),
        ("s1", RegisterMIPS::S1 as i32),
        ("s2", RegisterMIPS::S2 as i32),
        ("s3", RegisterMIPS::S3 as i32),
        ("s4", RegisterMIPS::S4 as i32),
        ("s5", RegisterMIPS::S5 as i32),
        ("s6", RegisterMIPS::S6 as i32),
        ("s7", RegisterMIPS::S7 as i32),
        ("k0", RegisterMIPS::K0 as i32),
        ("k1", RegisterMIPS::K1 as i32),
        ("gp", RegisterMIPS::GP as i32),
        ("sp", RegisterMIPS::SP as i32),
        ("fp", RegisterMIPS::FP as i32),
        ("ra", RegisterMIPS::RA as i32),
        ("hi", RegisterMIPS::HI as i32),
        ("lo", RegisterMIPS::LO as i32),
    ];
    let mut spec = ArchSpec::new(
        "mips",
        32,
        "mips",
        Endian::Big,
        UcArch::MIPS,
        Mode::MODE_32,
        RegisterMIPS::PC as i32,
        RegisterMIPS::SP as i32,
        regs,
        SyscallCC {
            num_reg: RegisterMIPS::V0 as i32,
            ret_reg: RegisterMIPS::V0 as i32,
            err_reg: Some(RegisterMIPS::A3 as i32),
            arg_regs: MIPS_SYSCALL_ARGS,
            shadow: 4,
        },
    );
    spec.register_os(linux::personality());
    spec
}

/// Resolve a loaded binary's declared ISA + ABI to a concrete CPU
/// configuration and syscall personality.
pub fn get_arch(arch: &str, os: &str) -> Result<(ArchSpec, OsPersonality)> {
    let spec = match arch {
        "x86_64" => x86_64(),
        "mips" => mips(),
        _ => return Err(EmulatorError::UnsupportedArch(arch.to_string())),
    };
    let personality = spec
        .get_os(os)
        .ok_or_else(|| EmulatorError::UnknownOs(os.to_string(), arch.to_string()))?;
    Ok((spec, personality))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_arch() {
        let (spec, os) = get_arch("x86_64", "linux").unwrap();
        assert_eq!(spec.bits, 64);
        assert_eq!(os.name, "linux");

        let (spec, _) = get_arch("mips", "linux").unwrap();
        assert_eq!(spec.bits, 32);
        assert_eq!(spec.default_endian, Endian::Big);

        assert!(get_arch("sparc", "linux").is_err());
        assert!(get_arch("x86_64", "plan9").is_err());
    }

    #[test]
    #[should_panic(expected = "duplicate OS")]
    fn test_duplicate_os_is_fatal() {
        let mut spec = x86_64();
        spec.register_os(linux::personality());
    }

    #[test]
    fn test_register_dump_order() {
        let spec = x86_64();
        let names: Vec<&str> = spec.reg_list().iter().map(|r| r.name).collect();
        // digit-less names first, then natural order among the rest
        let r8 = names.iter().position(|&n| n == "r8").unwrap();
        let r10 = names.iter().position(|&n| n == "r10").unwrap();
        let r15 = names.iter().position(|&n| n == "r15").unwrap();
        let rax = names.iter().position(|&n| n == "rax").unwrap();
        let rsp = names.iter().position(|&n| n == "rsp").unwrap();
        assert!(rax < r8);
        assert!(rsp < r8);
        assert!(r8 < r10);
        assert!(r10 < r15);

        let spec = mips();
        let names: Vec<&str> = spec.reg_list().iter().map(|r| r.name).collect();
        let t2 = names.iter().position(|&n| n == "t2").unwrap();
        let t9 = names.iter().position(|&n| n == "t9").unwrap();
        assert!(t2 < t9);
    }
}
