pub mod linux;
pub mod posix;

use unicorn_engine::unicorn_const::uc_error;

use crate::engine::Engine;
use crate::errors::Result;
use crate::memory::Memory;
use crate::utils::read_string;

/// Typed argument slots a syscall signature is declared with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArgType {
    Fd,
    Len,
    Off,
    /// guest pointer to a region the call reads from
    Buf,
    /// guest pointer to a region the call writes into
    Obuf,
    Ptr,
    /// NUL-terminated guest string
    Str,
    Int,
}

pub type SyscallFn = fn(&mut Engine<'_>, &[SysArg]) -> u64;

/// One entry of a personality's syscall table.
pub struct SyscallDef {
    pub name: &'static str,
    pub inputs: &'static [ArgType],
    pub handler: SyscallFn,
}

/// A named collection of syscalls. Personalities are consulted in order;
/// the first table carrying the name services the call.
pub trait Kernel {
    fn name(&self) -> &'static str;
    fn lookup(&self, name: &str) -> Option<&'static SyscallDef>;
}

pub fn resolve_syscall(kernels: &[Box<dyn Kernel>], name: &str) -> Option<&'static SyscallDef> {
    kernels.iter().find_map(|k| k.lookup(name))
}

/// Guest pointer to a read-from region.
#[derive(Clone, Copy, Debug)]
pub struct Buf {
    pub addr: u64,
}

impl Buf {
    pub fn unpack(&self, u: &Engine, len: usize) -> std::result::Result<Vec<u8>, uc_error> {
        Memory::read(u, self.addr, len)
    }
}

/// Guest pointer to a write-to region.
#[derive(Clone, Copy, Debug)]
pub struct Obuf {
    pub addr: u64,
}

impl Obuf {
    pub fn pack(&self, u: &mut Engine, data: &[u8]) -> std::result::Result<(), uc_error> {
        Memory::write(u, self.addr, data)
    }
}

/// A marshalled argument. The accessors panic on slot mismatches: a kernel
/// whose table and handler disagree is a programming error, not a guest
/// error.
#[derive(Clone, Debug)]
pub enum SysArg {
    Fd(i32),
    Len(u64),
    Off(i64),
    Buf(Buf),
    Obuf(Obuf),
    Ptr(u64),
    Str(String),
    Int(u64),
}

impl SysArg {
    pub fn fd(&self) -> i32 {
        match self {
            SysArg::Fd(v) => *v,
            other => panic!("syscall argument mismatch: wanted fd, got {:?}", other),
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            SysArg::Len(v) => *v,
            other => panic!("syscall argument mismatch: wanted len, got {:?}", other),
        }
    }

    pub fn off(&self) -> i64 {
        match self {
            SysArg::Off(v) => *v,
            other => panic!("syscall argument mismatch: wanted off, got {:?}", other),
        }
    }

    pub fn buf(&self) -> Buf {
        match self {
            SysArg::Buf(v) => *v,
            other => panic!("syscall argument mismatch: wanted buf, got {:?}", other),
        }
    }

    pub fn obuf(&self) -> Obuf {
        match self {
            SysArg::Obuf(v) => *v,
            other => panic!("syscall argument mismatch: wanted obuf, got {:?}", other),
        }
    }

    pub fn ptr(&self) -> u64 {
        match self {
            SysArg::Ptr(v) => *v,
            other => panic!("syscall argument mismatch: wanted ptr, got {:?}", other),
        }
    }

    pub fn string(&self) -> &str {
        match self {
            SysArg::Str(v) => v,
            other => panic!("syscall argument mismatch: wanted str, got {:?}", other),
        }
    }

    pub fn int(&self) -> u64 {
        match self {
            SysArg::Int(v) => *v,
            other => panic!("syscall argument mismatch: wanted int, got {:?}", other),
        }
    }
}

/// Convert raw argument words into typed slots using the guest word size
/// and byte order.
pub fn marshal_args(u: &mut Engine, inputs: &[ArgType], raw: &[u64]) -> Result<Vec<SysArg>> {
    use crate::arch::ArchInfo;
    let bits = u.bits();
    inputs
        .iter()
        .zip(raw)
        .map(|(t, &r)| {
            Ok(match t {
                ArgType::Fd => SysArg::Fd(r as i32),
                ArgType::Len => SysArg::Len(r),
                ArgType::Off => SysArg::Off(if bits == 32 {
                    r as u32 as i32 as i64
                } else {
                    r as i64
                }),
                ArgType::Buf => SysArg::Buf(Buf { addr: r }),
                ArgType::Obuf => SysArg::Obuf(Obuf { addr: r }),
                ArgType::Ptr => SysArg::Ptr(r),
                ArgType::Str => SysArg::Str(read_string(u, r)?),
                ArgType::Int => SysArg::Int(r),
            })
        })
        .collect()
}

/// Pack/marshal failures without a host errno report as faulted guest
/// memory, the documented stand-in for conditions with no mapping yet.
pub const PACK_FAIL: u64 = -(libc::EFAULT as i64) as u64;

/// The calling host error as the guest return word: negative errno in
/// two's complement, matching the kernel ABI.
pub fn errno_from_host() -> u64 {
    errno_from_io(&std::io::Error::last_os_error())
}

pub fn errno_from_io(e: &std::io::Error) -> u64 {
    (-(e.raw_os_error().unwrap_or(libc::EFAULT) as i64)) as u64
}

/// Map a raw host return to the guest convention: negative results pick up
/// the thread errno, others pass through.
pub fn errno(ret: i64) -> u64 {
    if ret < 0 {
        errno_from_host()
    } else {
        ret as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first(_u: &mut Engine, _args: &[SysArg]) -> u64 {
        1
    }

    fn second(_u: &mut Engine, _args: &[SysArg]) -> u64 {
        2
    }

    static TABLE_A: &[SyscallDef] = &[SyscallDef {
        name: "open",
        inputs: &[ArgType::Str, ArgType::Int, ArgType::Int],
        handler: first,
    }];

    static TABLE_B: &[SyscallDef] = &[
        SyscallDef {
            name: "open",
            inputs: &[ArgType::Str, ArgType::Int, ArgType::Int],
            handler: second,
        },
        SyscallDef {
            name: "close",
            inputs: &[ArgType::Fd],
            handler: second,
        },
    ];

    struct A;
    impl Kernel for A {
        fn name(&self) -> &'static str {
            "a"
        }
        fn lookup(&self, name: &str) -> Option<&'static SyscallDef> {
            TABLE_A.iter().find(|d| d.name == name)
        }
    }

    struct B;
    impl Kernel for B {
        fn name(&self) -> &'static str {
            "b"
        }
        fn lookup(&self, name: &str) -> Option<&'static SyscallDef> {
            TABLE_B.iter().find(|d| d.name == name)
        }
    }

    #[test]
    fn test_dispatch_prefers_first_personality() {
        let kernels: Vec<Box<dyn Kernel>> = vec![Box::new(A), Box::new(B)];
        let def = resolve_syscall(&kernels, "open").unwrap();
        assert_eq!(def.name, "open");
        assert_eq!(def.handler as usize, first as usize);

        // names only the later personality carries still resolve
        let def = resolve_syscall(&kernels, "close").unwrap();
        assert_eq!(def.handler as usize, second as usize);

        assert!(resolve_syscall(&kernels, "ptrace").is_none());
    }

    #[test]
    #[should_panic(expected = "syscall argument mismatch")]
    fn test_slot_mismatch_is_fatal() {
        SysArg::Fd(3).len();
    }
}
