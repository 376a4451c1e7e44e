use goblin::container::Endian;
use unicorn_engine::Unicorn;

use crate::arch::{ArchSpec, OsPersonality};
use crate::config::Config;
use crate::errors::Result;
use crate::kernel::Kernel;
use crate::loader::Loader;
use crate::memory::MemoryManager;
use crate::trace::TraceState;

pub type Engine<'a> = Unicorn<'a, Machine>;

/// Guest address-space layout. Built once at load time, extended by brk and
/// mmap afterwards.
#[derive(Debug, Default, Clone, Copy)]
pub struct Layout {
    /// load bias of the main image (0 for fixed-address executables)
    pub base: u64,
    /// load bias of the dynamic linker, or 0
    pub interp_base: u64,
    /// first PC: the interpreter's entry when one is present
    pub entry: u64,
    /// the binary's own entry, kept for reporting
    pub bin_entry: u64,
    /// data-segment high-water mark; never decreases
    pub brk: u64,
    /// page-aligned top of the mapped brk region
    pub brk_page: u64,
    pub stack_base: u64,
}

/// All per-emulator state. It rides inside the engine as its data payload,
/// so hooks reach it through the engine handle they are called with.
pub struct Machine {
    pub arch: ArchSpec,
    pub os: OsPersonality,
    /// byte order of the loaded image (may differ from the arch default)
    pub endian: Endian,
    pub config: Config,
    pub exe: String,
    pub memories: MemoryManager,
    pub kernels: Vec<Box<dyn Kernel>>,
    pub layout: Layout,
    pub loader: Option<Box<dyn Loader>>,
    pub interp_loader: Option<Box<dyn Loader>>,
    pub trace: TraceState,
    pub exit_status: Option<i32>,
}

impl Machine {
    pub fn create<'a>(
        arch: ArchSpec,
        os: OsPersonality,
        endian: Endian,
        config: Config,
        exe: String,
    ) -> Result<Engine<'a>> {
        let uc_arch = arch.uc_arch;
        let mode = arch.uc_mode(endian);
        let data = Machine {
            endian,
            memories: MemoryManager::default(),
            kernels: Vec::new(),
            layout: Layout::default(),
            loader: None,
            interp_loader: None,
            trace: TraceState::new(endian, config.loop_collapse),
            exit_status: None,
            exe,
            config,
            os,
            arch,
        };
        Ok(Unicorn::new_with_data(uc_arch, mode, data)?)
    }
}
