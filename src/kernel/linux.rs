//! Linux personality: wraps the POSIX set, owns the per-arch syscall
//! number tables, the ELF stack image (argv/env/auxv) and the interrupt
//! path with its ABI-specific return write-back.

use rand::RngCore;
use unicorn_engine::unicorn_const::uc_error;
use unicorn_engine::{InsnSysX86, RegisterMIPS};

use crate::arch::OsPersonality;
use crate::emulator::Emu;
use crate::engine::Engine;
use crate::errors::Result;
use crate::kernel::posix::PosixKernel;
use crate::kernel::{ArgType, Kernel, SysArg, SyscallDef, PACK_FAIL};
use crate::registers::{Registers, StackRegister};
use crate::stack::Stack;
use crate::utils::align;
use crate::PAGE_SIZE;

pub struct LinuxKernel {
    posix: PosixKernel,
}

impl LinuxKernel {
    pub fn new() -> Self {
        Self {
            posix: PosixKernel::new(),
        }
    }
}

impl Default for LinuxKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel for LinuxKernel {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn lookup(&self, name: &str) -> Option<&'static SyscallDef> {
        SYSCALLS
            .iter()
            .find(|d| d.name == name)
            .or_else(|| self.posix.lookup(name))
    }
}

static SYSCALLS: &[SyscallDef] = &[
    SyscallDef {
        name: "exit",
        inputs: &[ArgType::Int],
        handler: exit,
    },
    SyscallDef {
        name: "exit_group",
        inputs: &[ArgType::Int],
        handler: exit,
    },
    SyscallDef {
        name: "set_tid_address",
        inputs: &[ArgType::Ptr],
        handler: set_tid_address,
    },
    SyscallDef {
        name: "set_thread_area",
        inputs: &[ArgType::Ptr],
        handler: set_thread_area,
    },
];

fn exit(u: &mut Engine, args: &[SysArg]) -> u64 {
    u.exit(args[0].int() as i32);
    0
}

fn set_tid_address(_u: &mut Engine, args: &[SysArg]) -> u64 {
    // no thread management; the guest only needs a plausible tid back
    log::debug!("set_tid_address({:#x})", args[0].ptr());
    std::process::id() as u64
}

fn set_thread_area(u: &mut Engine, args: &[SysArg]) -> u64 {
    let u_info_addr = args[0].ptr();
    if u.get_data().arch.name != "mips" {
        return PACK_FAIL;
    }
    const CONFIG3_ULR: u64 = 1 << 13;
    if Registers::write(u, RegisterMIPS::CP0_CONFIG3, CONFIG3_ULR).is_err()
        || Registers::write(u, RegisterMIPS::CP0_USERLOCAL, u_info_addr).is_err()
    {
        return PACK_FAIL;
    }
    log::debug!("set_thread_area({:#x})", u_info_addr);
    0
}

pub fn personality() -> OsPersonality {
    OsPersonality {
        name: "linux",
        kernels,
        init,
        interrupt,
    }
}

fn kernels(_u: &mut Engine) -> Vec<Box<dyn Kernel>> {
    vec![Box::new(LinuxKernel::new())]
}

fn init(u: &mut Engine, args: &[String], env: &[String]) -> Result<()> {
    // x86_64 raises no interrupt for SYSCALL; hook the instruction itself
    if u.get_data().arch.name == "x86_64" {
        u.add_insn_sys_hook(InsnSysX86::SYSCALL, 1, 0, |uc| {
            dispatch(uc);
        })?;
    }
    setup_stack(u, args, env)
}

const AT_NULL: u64 = 0;
const AT_PAGESZ: u64 = 6;
const AT_BASE: u64 = 7;
const AT_ENTRY: u64 = 9;
const AT_UID: u64 = 11;
const AT_EUID: u64 = 12;
const AT_GID: u64 = 13;
const AT_EGID: u64 = 14;
const AT_RANDOM: u64 = 25;

/// Write the ELF process image below SP: argument and environment strings,
/// the auxv, then the envp/argv vectors and argc at the final stack top.
fn setup_stack(u: &mut Engine, args: &[String], env: &[String]) -> Result<()> {
    let mut env_ptrs = Vec::with_capacity(env.len());
    for e in env {
        env_ptrs.push(u.aligned_push_str(e)?);
    }
    let mut arg_ptrs = Vec::with_capacity(args.len());
    for a in args {
        arg_ptrs.push(u.aligned_push_str(a)?);
    }

    let mut seed = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut seed);
    let random_addr = u.aligned_push_bytes(seed, None)?;

    let sp = u.sp()?;
    u.set_sp(align(sp, 16u64))?;

    let (interp_base, bin_entry) = {
        let layout = &u.get_data().layout;
        (layout.interp_base, layout.bin_entry)
    };
    let auxv: &[(u64, u64)] = &[
        (AT_PAGESZ, PAGE_SIZE as u64),
        (AT_BASE, interp_base),
        (AT_ENTRY, bin_entry),
        (AT_UID, 0),
        (AT_EUID, 0),
        (AT_GID, 0),
        (AT_EGID, 0),
        (AT_RANDOM, random_addr),
        (AT_NULL, 0),
    ];

    // keep the final SP 16-byte aligned: argc + vectors + auxv pairs
    let words = 1 + arg_ptrs.len() + 1 + env_ptrs.len() + 1 + auxv.len() * 2;
    if words % 2 == 1 {
        u.stack_push(0)?;
    }

    for &(key, val) in auxv.iter().rev() {
        u.stack_push(val)?;
        u.stack_push(key)?;
    }
    u.stack_push(0)?;
    for &p in env_ptrs.iter().rev() {
        u.stack_push(p)?;
    }
    u.stack_push(0)?;
    for &p in arg_ptrs.iter().rev() {
        u.stack_push(p)?;
    }
    u.stack_push(arg_ptrs.len() as u64)?;
    Ok(())
}

fn interrupt(u: &mut Engine, intno: u32) {
    match u.get_data().arch.name {
        // MIPS EXCP_SYSCALL
        "mips" if intno == 17 => dispatch(u),
        // legacy int 0x80 path
        "x86_64" if intno == 0x80 => dispatch(u),
        _ => log::debug!("unhandled interrupt {}", intno),
    }
}

/// Read the syscall number from the calling convention's register, route it
/// through the kernel personalities, write the result back per the ABI.
pub(crate) fn dispatch(u: &mut Engine) {
    let cc = u.get_data().arch.cc;
    let num = match Registers::read(u, cc.num_reg) {
        Ok(n) => n,
        Err(_) => return,
    };
    let arch = u.get_data().arch.name;
    let name = syscall_name(arch, num).unwrap_or("");
    let ret = match u.do_syscall(num, name) {
        Ok(r) => r,
        Err(e) => {
            log::debug!("syscall {} ({}) failed: {}", name, num, e);
            PACK_FAIL
        }
    };
    let _ = write_return(u, ret);
}

fn write_return(u: &mut Engine, ret: u64) -> std::result::Result<(), uc_error> {
    let cc = u.get_data().arch.cc;
    match cc.err_reg {
        // out-of-band error flag: positive errno plus the flag register
        Some(err_reg) => {
            let signed = ret as i64;
            if signed < 0 && signed > -4096 {
                Registers::write(u, cc.ret_reg, (-signed) as u64)?;
                Registers::write(u, err_reg, 1)
            } else {
                Registers::write(u, cc.ret_reg, ret)?;
                Registers::write(u, err_reg, 0)
            }
        }
        None => Registers::write(u, cc.ret_reg, ret),
    }
}

fn syscall_name(arch: &str, num: u64) -> Option<&'static str> {
    let table: &[(u64, &'static str)] = match arch {
        "x86_64" => X86_64_SYSCALLS,
        "mips" => MIPS_SYSCALLS,
        _ => return None,
    };
    table.iter().find(|(n, _)| *n == num).map(|(_, name)| *name)
}

static X86_64_SYSCALLS: &[(u64, &'static str)] = &[
    (0, "read"),
    (1, "write"),
    (2, "open"),
    (3, "close"),
    (4, "stat"),
    (5, "fstat"),
    (6, "lstat"),
    (8, "lseek"),
    (9, "mmap"),
    (10, "mprotect"),
    (11, "munmap"),
    (12, "brk"),
    (19, "readv"),
    (20, "writev"),
    (21, "access"),
    (32, "dup"),
    (33, "dup2"),
    (39, "getpid"),
    (60, "exit"),
    (63, "uname"),
    (79, "getcwd"),
    (80, "chdir"),
    (86, "link"),
    (88, "symlink"),
    (89, "readlink"),
    (90, "chmod"),
    (161, "chroot"),
    (218, "set_tid_address"),
    (228, "clock_gettime"),
    (231, "exit_group"),
    (257, "openat"),
];

static MIPS_SYSCALLS: &[(u64, &'static str)] = &[
    (4001, "exit"),
    (4003, "read"),
    (4004, "write"),
    (4005, "open"),
    (4006, "close"),
    (4009, "link"),
    (4012, "chdir"),
    (4015, "chmod"),
    (4019, "lseek"),
    (4020, "getpid"),
    (4033, "access"),
    (4041, "dup"),
    (4045, "brk"),
    (4061, "chroot"),
    (4063, "dup2"),
    (4083, "symlink"),
    (4085, "readlink"),
    (4090, "mmap"),
    (4091, "munmap"),
    (4106, "stat"),
    (4107, "lstat"),
    (4108, "fstat"),
    (4122, "uname"),
    (4125, "mprotect"),
    (4145, "readv"),
    (4146, "writev"),
    (4203, "getcwd"),
    (4210, "mmap2"),
    (4246, "exit_group"),
    (4252, "set_tid_address"),
    (4263, "clock_gettime"),
    (4283, "set_thread_area"),
    (4288, "openat"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_wraps_posix() {
        let k = LinuxKernel::new();
        // own table first
        assert!(k.lookup("exit").is_some());
        assert!(k.lookup("set_tid_address").is_some());
        // delegation to the posix base set
        assert!(k.lookup("read").is_some());
        assert!(k.lookup("getcwd").is_some());
        assert!(k.lookup("clone").is_none());
    }

    #[test]
    fn test_number_tables() {
        assert_eq!(syscall_name("x86_64", 0), Some("read"));
        assert_eq!(syscall_name("x86_64", 60), Some("exit"));
        assert_eq!(syscall_name("mips", 4004), Some("write"));
        assert_eq!(syscall_name("mips", 4283), Some("set_thread_area"));
        assert_eq!(syscall_name("x86_64", 9999), None);
        assert_eq!(syscall_name("sparc", 1), None);
    }
}
