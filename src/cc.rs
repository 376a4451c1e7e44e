use unicorn_engine::unicorn_const::uc_error;

use crate::engine::Engine;
use crate::memory::Memory;
use crate::registers::{Registers, StackRegister};

/// Syscall calling convention: where the number, arguments and return value
/// live. Arguments beyond the register set come from the stack, past the
/// shadow slots the ABI reserves for the register arguments.
#[derive(Clone, Copy, Debug)]
pub struct SyscallCC {
    pub num_reg: i32,
    pub ret_reg: i32,
    /// set on ABIs that report errors out of band (MIPS O32 `a3`)
    pub err_reg: Option<i32>,
    pub arg_regs: &'static [i32],
    pub shadow: usize,
}

impl SyscallCC {
    /// Fetch `n` raw word-sized arguments, masked to the guest word size.
    pub fn get_args(&self, u: &Engine, n: usize, bits: u32) -> Result<Vec<u64>, uc_error> {
        let mask = if bits == 32 { u32::MAX as u64 } else { u64::MAX };
        let word = (bits / 8) as u64;
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let raw = if i < self.arg_regs.len() {
                Registers::read(u, self.arg_regs[i])?
            } else {
                let slot = (self.shadow + (i - self.arg_regs.len())) as u64;
                u.read_ptr(u.sp()? + word * slot, None)?
            };
            out.push(raw & mask);
        }
        Ok(out)
    }
}
