use unicorn_engine::unicorn_const::{uc_error, Permission};

use crate::arch::ArchInfo;
use crate::engine::Engine;
use crate::memory::Memory;
use crate::registers::StackRegister;
use crate::utils::align;

/// Guest stack operations. Every write is checked against the recorded
/// mappings first: a push that would land outside a writable region (off
/// the stack, or in the guard page) fails with the matching memory error
/// instead of faulting the next guest instruction, and SP only moves once
/// the write has landed.
pub trait Stack {
    /// Push a word. Returns the new top of stack.
    fn stack_push(&mut self, value: u64) -> Result<u64, uc_error>;

    /// Pop the word at the top of the stack.
    fn stack_pop(&mut self) -> Result<u64, uc_error>;

    /// Peek a word at a byte offset from the top without moving it.
    fn stack_read(&self, offset: i64) -> Result<u64, uc_error>;
    fn stack_write(&mut self, offset: i64, value: u64) -> Result<(), uc_error>;

    /// Copy bytes below the current top and drop SP onto them, keeping it
    /// aligned. Alignment defaults to the pointer size. Returns the new
    /// top, which is also where the bytes start.
    fn aligned_push_bytes(
        &mut self,
        data: impl AsRef<[u8]>,
        alignment: Option<u32>,
    ) -> Result<u64, uc_error>;

    /// Push a string with its NUL terminator.
    fn aligned_push_str(&mut self, s: &str) -> Result<u64, uc_error>;
}

/// `[addr, addr + len)` must sit inside one recorded writable region.
/// Unmapped targets and protection misses (the stack guard) report as the
/// engine would on access.
fn check_writable(uc: &Engine, addr: u64, len: u64) -> Result<(), uc_error> {
    if len == 0 {
        return Ok(());
    }
    match uc.get_data().memories.region_at(addr) {
        None => Err(uc_error::WRITE_UNMAPPED),
        Some(region) if !region.perms.contains(Permission::WRITE) => Err(uc_error::WRITE_PROT),
        Some(region) if addr + len > region.end => Err(uc_error::WRITE_UNMAPPED),
        Some(_) => Ok(()),
    }
}

impl<'a> Stack for Engine<'a> {
    fn stack_push(&mut self, value: u64) -> Result<u64, uc_error> {
        let word = self.pointer_size() as u64;
        let top = self
            .sp()?
            .checked_sub(word)
            .ok_or(uc_error::WRITE_UNMAPPED)?;
        check_writable(self, top, word)?;
        self.write_ptr(top, value, None)?;
        self.set_sp(top)?;
        Ok(top)
    }

    fn stack_pop(&mut self) -> Result<u64, uc_error> {
        let word = self.pointer_size() as u64;
        let sp = self.sp()?;
        let value = self.read_ptr(sp, None)?;
        self.set_sp(sp + word)?;
        Ok(value)
    }

    fn stack_read(&self, offset: i64) -> Result<u64, uc_error> {
        let addr = self
            .sp()?
            .checked_add_signed(offset)
            .ok_or(uc_error::READ_UNMAPPED)?;
        self.read_ptr(addr, None)
    }

    fn stack_write(&mut self, offset: i64, value: u64) -> Result<(), uc_error> {
        let addr = self
            .sp()?
            .checked_add_signed(offset)
            .ok_or(uc_error::WRITE_UNMAPPED)?;
        check_writable(self, addr, self.pointer_size() as u64)?;
        self.write_ptr(addr, value, None)
    }

    fn aligned_push_bytes(
        &mut self,
        data: impl AsRef<[u8]>,
        alignment: Option<u32>,
    ) -> Result<u64, uc_error> {
        let data = data.as_ref();
        let alignment = alignment.unwrap_or_else(|| self.pointer_size() as u32) as u64;
        let top = self
            .sp()?
            .checked_sub(data.len() as u64)
            .ok_or(uc_error::WRITE_UNMAPPED)?;
        let top = align(top, alignment);
        check_writable(self, top, data.len() as u64)?;
        Memory::write(self, top, data)?;
        self.set_sp(top)?;
        Ok(top)
    }

    fn aligned_push_str(&mut self, s: &str) -> Result<u64, uc_error> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.aligned_push_bytes(bytes, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::get_arch;
    use crate::config::Config;
    use crate::engine::Machine;
    use goblin::container::Endian;

    fn engine_with_stack<'a>() -> Engine<'a> {
        let (arch, os) = get_arch("x86_64", "linux").unwrap();
        let mut uc = Machine::create(
            arch,
            os,
            Endian::Little,
            Config::default(),
            "test".to_string(),
        )
        .unwrap();
        uc.mem_map_prot(
            0x11000,
            0x1000,
            Permission::READ | Permission::WRITE,
            "[stack]",
        )
        .unwrap();
        uc.mem_map_prot(0x12000, 0x1000, Permission::NONE, "[stack guard]")
            .unwrap();
        uc.set_sp(0x12000).unwrap();
        uc
    }

    #[test]
    fn test_push_pop_round_trip() {
        let mut uc = engine_with_stack();
        assert_eq!(uc.stack_push(0x1111).unwrap(), 0x12000 - 8);
        assert_eq!(uc.stack_push(0x2222).unwrap(), 0x12000 - 16);
        assert_eq!(uc.stack_read(0).unwrap(), 0x2222);
        assert_eq!(uc.stack_pop().unwrap(), 0x2222);
        assert_eq!(uc.stack_pop().unwrap(), 0x1111);
        assert_eq!(uc.sp().unwrap(), 0x12000);
    }

    #[test]
    fn test_aligned_push_keeps_sp_aligned() {
        let mut uc = engine_with_stack();
        let top = uc.aligned_push_str("hello").unwrap();
        assert_eq!(top % 8, 0);
        assert_eq!(uc.sp().unwrap(), top);
        let bytes = Memory::read(&uc, top, 6).unwrap();
        assert_eq!(&bytes, b"hello\0");
    }

    #[test]
    fn test_push_off_the_stack_is_rejected() {
        let mut uc = engine_with_stack();
        uc.set_sp(0x11008).unwrap();
        uc.stack_push(1).unwrap();
        // the next slot is below the mapping
        assert_eq!(uc.stack_push(2), Err(uc_error::WRITE_UNMAPPED));
        // SP is untouched by the failed push
        assert_eq!(uc.sp().unwrap(), 0x11000);
    }

    #[test]
    fn test_push_into_guard_page_is_rejected() {
        let mut uc = engine_with_stack();
        uc.set_sp(0x12008).unwrap();
        assert_eq!(uc.stack_push(1), Err(uc_error::WRITE_PROT));
    }
}
