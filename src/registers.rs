use unicorn_engine::unicorn_const::uc_error;

use crate::arch::{Reg, RegVal};
use crate::engine::Engine;

pub trait Registers {
    fn read(&self, reg: impl Into<i32>) -> Result<u64, uc_error>;
    fn write(&mut self, reg: impl Into<i32>, value: u64) -> Result<(), uc_error>;
    fn pc(&self) -> Result<u64, uc_error>;
    fn set_pc(&mut self, value: u64) -> Result<(), uc_error>;
    /// All catalogued registers in dump order.
    fn reg_dump(&self) -> Result<Vec<RegVal>, uc_error>;
}

pub trait StackRegister {
    fn sp(&self) -> Result<u64, uc_error>;
    fn set_sp(&mut self, value: u64) -> Result<(), uc_error>;
}

impl<'a> Registers for Engine<'a> {
    fn read(&self, reg: impl Into<i32>) -> Result<u64, uc_error> {
        self.reg_read(reg.into())
    }

    fn write(&mut self, reg: impl Into<i32>, value: u64) -> Result<(), uc_error> {
        self.reg_write(reg.into(), value)
    }

    fn pc(&self) -> Result<u64, uc_error> {
        self.reg_read(self.get_data().arch.pc)
    }

    fn set_pc(&mut self, value: u64) -> Result<(), uc_error> {
        self.reg_write(self.get_data().arch.pc, value)
    }

    fn reg_dump(&self) -> Result<Vec<RegVal>, uc_error> {
        let regs: Vec<Reg> = self.get_data().arch.reg_list().to_vec();
        regs.into_iter()
            .map(|reg| self.reg_read(reg.enum_).map(|val| RegVal { reg, val }))
            .collect()
    }
}

impl<'a> StackRegister for Engine<'a> {
    fn sp(&self) -> Result<u64, uc_error> {
        self.reg_read(self.get_data().arch.sp)
    }

    fn set_sp(&mut self, value: u64) -> Result<(), uc_error> {
        self.reg_write(self.get_data().arch.sp, value)
    }
}
