//! The execution driver: builds the address space from a loaded binary,
//! installs the tracing and syscall hooks, and runs the guest to
//! completion.

use std::path::Path;

use log::debug;
use unicorn_engine::unicorn_const::{uc_error, HookType, MemType, Permission};

use crate::arch::{get_arch, ArchInfo};
use crate::config::Config;
use crate::engine::{Engine, Machine};
use crate::errors::{EmulatorError, Result};
use crate::kernel::resolve_syscall;
use crate::loader::{merge_segments, ElfLoader, LoadType, Loader, Segment, Symbol};
use crate::memory::Memory;
use crate::registers::{Registers, StackRegister};
use crate::trace::{self, Changes};
use crate::utils::{align_up, Packer};
use crate::{BINARY_BASE, PAGE_SIZE, STACK_BASE, STACK_SIZE};

/// Open-ended symbols (unknown extent) still match near their start; a
/// page is far enough that unrelated code stops inheriting the name.
const SYMBOL_OPEN_EXTENT: u64 = 0x1000;

pub struct Emulator<'a> {
    core: Engine<'a>,
}

impl<'a> Emulator<'a> {
    /// Load `exe`, pick its architecture and OS personality from the
    /// registry, and map the binary (and its interpreter, if any) into a
    /// fresh engine.
    pub fn new(exe: impl AsRef<Path>, config: Config) -> Result<Self> {
        let exe = std::fs::canonicalize(exe)?;
        let loader = ElfLoader::from_file(&exe)?;
        let (arch, os) = get_arch(loader.arch(), loader.os())?;
        let endian = loader.byte_order();
        let mut core = Machine::create(arch, os, endian, config, exe.display().to_string())?;

        let kernels = (os.kernels)(&mut core);
        core.get_data_mut().kernels = kernels;

        let loader: Box<dyn Loader> = Box::new(loader);
        let (interp_base, entry, base, bin_entry) = map_binary(&mut core, loader.as_ref(), false)?;
        {
            let layout = &mut core.get_data_mut().layout;
            layout.interp_base = interp_base;
            layout.entry = entry;
            layout.base = base;
            layout.bin_entry = bin_entry;
        }

        // seed brk past the highest writable segment
        let mut brk = 0u64;
        for seg in loader.segments() {
            if seg.prot.contains(Permission::WRITE) {
                brk = brk.max(base + seg.addr + seg.size);
            }
        }
        let brk = align_up(brk, PAGE_SIZE);
        {
            let layout = &mut core.get_data_mut().layout;
            layout.brk = brk;
            layout.brk_page = brk;
        }
        core.get_data_mut().loader = Some(loader);
        debug!(
            "loaded image: base=0x{:x} entry=0x{:x} brk=0x{:x}",
            base, entry, brk
        );
        Ok(Self { core })
    }

    pub fn engine(&self) -> &Engine<'a> {
        &self.core
    }

    pub fn engine_mut(&mut self) -> &mut Engine<'a> {
        &mut self.core
    }

    /// Map the stack, lay out the process image, and hand control to the
    /// engine until the guest exits or faults.
    pub fn run(&mut self, args: &[String], env: &[String]) -> Result<()> {
        let uc = &mut self.core;
        add_hooks(uc)?;
        map_stack(uc)?;
        let os = uc.get_data().os;
        (os.init)(uc, args, env)?;

        let entry = uc.get_data().layout.entry;
        let (verbose, trace_reg, trace_exec, trace_mem_batch, bits) = {
            let d = uc.get_data();
            (
                d.config.verbose,
                d.config.trace_reg,
                d.config.trace_exec,
                d.config.trace_mem_batch,
                d.arch.bits,
            )
        };

        if verbose {
            eprintln!("[entry @ 0x{:x}]", entry);
            match uc.disas(entry, 64) {
                Ok(dis) => eprintln!("{}", dis),
                Err(e) => eprintln!("{:?}", e),
            }
            let sp = uc.sp()?;
            let stack_end = uc.get_data().layout.stack_base + STACK_SIZE;
            let mut buf = vec![0u8; (stack_end - sp) as usize];
            uc.read_into(&mut buf, sp)?;
            eprintln!("[stack @ 0x{:x}]", sp);
            for line in trace::hexdump(sp, &buf, bits) {
                eprintln!("{}", line);
            }
        }
        if verbose || trace_reg {
            let dump = uc.reg_dump()?;
            uc.get_data_mut()
                .trace
                .status
                .changes(&dump)
                .print("", bits, false);
        }
        if verbose {
            eprintln!("=====================================");
            eprintln!("==== Program output begins here. ====");
            eprintln!("=====================================");
        }
        if trace_reg || trace_exec {
            let sp = uc.sp()?;
            let sym = uc.symbolicate(entry);
            uc.get_data_mut().trace.stacktrace.update(entry, sp, sym);
        }

        let res = uc.emu_start(entry, u64::MAX, 0, 0);

        if trace_mem_batch {
            let t = &mut uc.get_data_mut().trace;
            if !t.memlog.is_empty() {
                t.memlog.print("", bits);
                t.memlog.reset();
            }
        }
        if let Err(e) = res {
            eprintln!("Registers:");
            if let Ok(dump) = uc.reg_dump() {
                uc.get_data_mut()
                    .trace
                    .status
                    .changes(&dump)
                    .print("", bits, false);
            }
            eprintln!("Stacktrace:");
            uc.get_data().trace.stacktrace.print();
            return Err(e.into());
        }
        if let Some(status) = uc.get_data().exit_status {
            return Err(EmulatorError::ExitStatus(status));
        }
        Ok(())
    }
}

/// Emulator surface exposed to kernels, OS initializers and hooks.
pub trait Emu {
    fn exe(&self) -> String;
    fn base(&self) -> u64;
    fn interp_base(&self) -> u64;
    fn entry(&self) -> u64;
    fn bin_entry(&self) -> u64;
    fn os_name(&self) -> &'static str;

    /// Extend the data segment to `addr` (0 queries). Never shrinks.
    fn brk(&mut self, addr: u64) -> std::result::Result<u64, uc_error>;

    /// Rewrite an absolute path under the emulated root when forced or when
    /// the rewritten path exists. Relative paths pass through.
    fn prefix_path(&self, path: &str, force: bool) -> String;

    /// Nearest-symbol name for an absolute guest address, `name+0xN` when
    /// off the symbol start, empty when nothing is near.
    fn symbolicate(&self, addr: u64) -> String;

    fn disas(&self, addr: u64, len: u64) -> std::result::Result<String, uc_error>;

    /// Route a numbered/named syscall through the kernel personalities and
    /// return the raw result word.
    fn do_syscall(&mut self, num: u64, name: &str) -> Result<u64>;

    /// Record a guest-initiated exit and stop the engine.
    fn exit(&mut self, status: i32);
}

impl<'a> Emu for Engine<'a> {
    fn exe(&self) -> String {
        self.get_data().exe.clone()
    }

    fn base(&self) -> u64 {
        self.get_data().layout.base
    }

    fn interp_base(&self) -> u64 {
        self.get_data().layout.interp_base
    }

    fn entry(&self) -> u64 {
        self.get_data().layout.entry
    }

    fn bin_entry(&self) -> u64 {
        self.get_data().layout.bin_entry
    }

    fn os_name(&self) -> &'static str {
        self.get_data().os.name
    }

    fn brk(&mut self, addr: u64) -> std::result::Result<u64, uc_error> {
        let (cur, page) = {
            let layout = &self.get_data().layout;
            (layout.brk, layout.brk_page)
        };
        if addr == 0 || addr < cur {
            return Ok(cur);
        }
        let top = align_up(addr, PAGE_SIZE);
        if top > page {
            self.mem_map_prot(
                page,
                top - page,
                Permission::READ | Permission::WRITE,
                "[brk]",
            )?;
        }
        let layout = &mut self.get_data_mut().layout;
        layout.brk = addr;
        layout.brk_page = layout.brk_page.max(top);
        Ok(addr)
    }

    fn prefix_path(&self, path: &str, force: bool) -> String {
        prefix_path(self.get_data().config.load_prefix.as_deref(), path, force)
    }

    fn symbolicate(&self, addr: u64) -> String {
        let data = self.get_data();
        let empty: &[Symbol] = &[];
        let main_syms = data.loader.as_ref().map_or(empty, |l| l.symbols());
        let interp_syms = data.interp_loader.as_ref().map_or(empty, |l| l.symbols());
        symbolicate_in(
            addr.wrapping_sub(data.layout.base),
            main_syms,
            addr.wrapping_sub(data.layout.interp_base),
            interp_syms,
            data.config.demangle,
        )
    }

    fn disas(&self, addr: u64, len: u64) -> std::result::Result<String, uc_error> {
        let bytes = Memory::read(self, addr, len as usize)?;
        Ok(trace::dump_code(addr, &bytes, self.bits()))
    }

    fn do_syscall(&mut self, num: u64, name: &str) -> Result<u64> {
        if name.is_empty() {
            panic!("Syscall missing: {}", num);
        }
        let def = match resolve_syscall(&self.get_data().kernels, name) {
            Some(d) => d,
            None => panic!("Kernel not found for syscall '{}'", name),
        };
        let cc = self.get_data().arch.cc;
        let bits = self.bits();
        let raw = cc.get_args(self, def.inputs.len(), bits)?;
        let args = crate::kernel::marshal_args(self, def.inputs, &raw)?;
        let trace_sys = self.get_data().config.trace_sys;
        if trace_sys {
            let depth = self.get_data().trace.stacktrace.len();
            let words: Vec<String> = raw.iter().map(|a| format!("0x{:x}", a)).collect();
            eprint!(
                "{}s {}({})",
                "  ".repeat(depth.saturating_sub(1)),
                name,
                words.join(", ")
            );
        }
        let ret = (def.handler)(self, &args);
        if trace_sys {
            eprintln!(" = 0x{:x}", ret);
        }
        Ok(ret)
    }

    fn exit(&mut self, status: i32) {
        self.get_data_mut().exit_status = Some(status);
        let _ = self.emu_stop();
    }
}

/// Prefix-sandbox path rewrite, pure so it can be exercised directly.
pub fn prefix_path(prefix: Option<&Path>, path: &str, force: bool) -> String {
    if let Some(prefix) = prefix {
        if Path::new(path).is_absolute() {
            let target = prefix.join(path.trim_start_matches('/'));
            if force || target.exists() {
                return target.display().to_string();
            }
        }
    }
    path.to_string()
}

/// Nearest preceding symbol covering `offset`, with its distance.
pub fn nearest_symbol<'s>(offset: u64, symbols: &'s [Symbol]) -> (Option<&'s Symbol>, u64) {
    let mut best: Option<&Symbol> = None;
    let mut min = u64::MAX;
    for sym in symbols {
        if sym.start == 0 || sym.name.is_empty() || offset < sym.start {
            continue;
        }
        let dist = offset - sym.start;
        let covered = if sym.end == 0 {
            dist <= SYMBOL_OPEN_EXTENT
        } else {
            offset <= sym.end
        };
        if covered && dist < min {
            min = dist;
            best = Some(sym);
        }
    }
    (best, min)
}

/// Pick between main-image and interpreter candidates; ties go to the main
/// image.
pub fn symbolicate_in(
    main_offset: u64,
    main_syms: &[Symbol],
    interp_offset: u64,
    interp_syms: &[Symbol],
    demangle: bool,
) -> String {
    let (sym, dist) = nearest_symbol(main_offset, main_syms);
    let (isym, idist) = nearest_symbol(interp_offset, interp_syms);
    let (name, dist) = if (idist < dist && isym.is_some()) || sym.is_none() {
        (isym.map(|s| s.name.as_str()).unwrap_or(""), idist)
    } else {
        (sym.map(|s| s.name.as_str()).unwrap_or(""), dist)
    };
    if name.is_empty() {
        return String::new();
    }
    let name = if demangle {
        rustc_demangle::demangle(name).to_string()
    } else {
        name.to_string()
    };
    if dist > 0 {
        format!("{}+0x{:x}", name, dist)
    } else {
        name
    }
}

/// Map a binary into the guest. Returns
/// `(interp_base, entry, base, bin_entry)`.
pub(crate) fn map_binary(
    uc: &mut Engine,
    l: &dyn Loader,
    is_interp: bool,
) -> Result<(u64, u64, u64, u64)> {
    let dynamic = match l.load_type() {
        LoadType::Exec => false,
        LoadType::Dyn => true,
    };

    // fold page-aligned spans into a disjoint set
    let spans: Vec<Segment> = l
        .segments()
        .iter()
        .filter(|seg| seg.size > 0)
        .map(|seg| Segment::from_raw(seg.addr, seg.size, seg.prot))
        .collect();
    let merged = merge_segments(spans);

    let mut load_bias = if is_interp {
        uc.get_data().config.force_interp_base
    } else {
        uc.get_data().config.force_base
    };
    if dynamic && load_bias == 0 && !merged.is_empty() {
        // one reservation sized to the whole merged span fixes the bias;
        // the per-span maps below fill it in
        let total = merged.last().unwrap().end - merged.first().unwrap().start;
        load_bias = uc.get_data().memories.find_free(BINARY_BASE, total);
    }

    let label = if is_interp { "[interp]" } else { "[binary]" };
    for seg in &merged {
        let prot = if seg.prot == Permission::NONE {
            // loader-encoded "unknown"
            Permission::ALL
        } else {
            seg.prot
        };
        uc.mem_map_prot(load_bias + seg.start, seg.end - seg.start, prot, label)?;
    }
    for seg in l.segments() {
        Memory::write(uc, load_bias + seg.addr, &seg.data)?;
    }
    let entry = load_bias + l.entry();

    if let (Some(interp), false) = (l.interp(), is_interp) {
        let path = uc.prefix_path(interp, true);
        let interp_loader = ElfLoader::from_file(&path)?;
        if interp_loader.arch() != l.arch() {
            return Err(EmulatorError::InterpArchMismatch {
                expected: l.arch().to_string(),
                found: interp_loader.arch().to_string(),
            });
        }
        let (_, ientry, ibias, _) = map_binary(uc, &interp_loader, true)?;
        uc.get_data_mut().interp_loader = Some(Box::new(interp_loader));
        return Ok((ibias, ientry, load_bias, entry));
    }
    Ok((0, entry, load_bias, entry))
}

/// Allocate the stack, point SP at its top, and post a PROT_NONE guard
/// page past the end.
pub(crate) fn map_stack(uc: &mut Engine) -> Result<()> {
    let stack = uc.mmap(STACK_BASE, STACK_SIZE)?;
    uc.get_data_mut().layout.stack_base = stack;
    let stack_end = stack + STACK_SIZE;
    uc.set_sp(stack_end)?;
    uc.mem_map_prot(stack_end, PAGE_SIZE as u64, Permission::NONE, "[stack guard]")?;
    Ok(())
}

fn add_hooks(uc: &mut Engine) -> Result<()> {
    let config = uc.get_data().config.clone();
    if config.trace_exec || config.trace_reg {
        uc.add_block_hook(|uc, addr, _size| {
            on_block(uc, addr);
        })?;
    }
    if config.trace_exec {
        uc.add_code_hook(0, u64::MAX, |uc, addr, size| {
            on_code(uc, addr, size);
        })?;
    }
    if config.trace_mem || config.trace_mem_batch {
        uc.add_mem_hook(
            HookType::MEM_READ | HookType::MEM_WRITE,
            0,
            u64::MAX,
            |uc, access, addr, size, value| {
                on_mem(uc, access, addr, size, value);
                true
            },
        )?;
    }
    uc.add_mem_hook(
        HookType::MEM_UNMAPPED | HookType::MEM_PROT,
        0,
        u64::MAX,
        on_invalid,
    )?;
    uc.add_intr_hook(|uc, intno| {
        let os = uc.get_data().os;
        (os.interrupt)(uc, intno);
    })?;
    Ok(())
}

fn check_trace_match(uc: &Engine, addr: u64, sym: &str) -> bool {
    let data = uc.get_data();
    let patterns = &data.config.trace_match;
    if patterns.is_empty() {
        return true;
    }
    if trace::trace_matches(patterns, addr, sym) {
        return true;
    }
    let stack = &data.trace.stacktrace.stack;
    let l = stack.len();
    for i in 0..data.config.trace_match_depth.min(l) {
        let frame = &stack[l - i - 1];
        if trace::trace_matches(patterns, frame.pc, &frame.sym) {
            return true;
        }
    }
    false
}

fn format_chain(uc: &Engine, chain: &[u64]) -> String {
    let parts: Vec<String> = chain
        .iter()
        .map(|&pc| {
            let sym = uc.symbolicate(pc);
            if sym.is_empty() {
                format!("0x{:x}", pc)
            } else {
                sym
            }
        })
        .collect();
    format!("({})", parts.join(" -> "))
}

fn on_block(uc: &mut Engine, addr: u64) {
    let sym = uc.symbolicate(addr);
    let matched = check_trace_match(uc, addr, &sym);
    uc.get_data_mut().trace.matching = matched;
    if !matched {
        return;
    }
    let depth = uc.get_data().trace.stacktrace.len();
    let indent = if depth > 2 {
        "  ".repeat(depth - 1)
    } else {
        String::new()
    };
    let loop_update = uc
        .get_data_mut()
        .trace
        .blockloop
        .as_mut()
        .map(|bl| bl.update(addr));
    if let Some((suppress, closed)) = loop_update {
        if let Some((chain, count)) = closed {
            let chain = format_chain(uc, &chain);
            eprintln!("{}- ({}) loops over {}", indent, count, chain);
        }
        if suppress {
            uc.get_data_mut().trace.last_block = addr;
            return;
        }
    }
    let (bits, trace_mem_batch, trace_exec, trace_reg) = {
        let d = uc.get_data();
        (
            d.arch.bits,
            d.config.trace_mem_batch,
            d.config.trace_exec,
            d.config.trace_reg,
        )
    };
    if trace_mem_batch {
        let t = &mut uc.get_data_mut().trace;
        if !t.memlog.is_empty() {
            t.memlog.print(&indent, bits);
            t.memlog.reset();
        }
    }
    if let Ok(sp) = uc.sp() {
        let sym = sym.clone();
        uc.get_data_mut().trace.stacktrace.update(addr, sp, sym);
    }
    let depth = uc.get_data().trace.stacktrace.len();
    let indent = "  ".repeat(depth);
    let block_indent = if indent.len() >= 2 {
        &indent[..indent.len() - 2]
    } else {
        indent.as_str()
    };
    let sym_part = if sym.is_empty() {
        String::new()
    } else {
        format!(" ({})", sym)
    };
    let block_line = format!("\n{}+ block{} @0x{:x}", block_indent, sym_part, addr);
    if !trace_exec && trace_reg && uc.get_data().trace.deadlock.count() == 0 {
        if let Ok(dump) = uc.reg_dump() {
            let changes = uc.get_data_mut().trace.status.changes(&dump);
            if changes.count() > 0 {
                eprintln!("{}", block_line);
                changes.print(&indent, bits, false);
            }
        }
    } else {
        eprintln!("{}", block_line);
    }
    uc.get_data_mut().trace.last_block = addr;
}

fn on_code(uc: &mut Engine, addr: u64, size: u32) {
    if !uc.get_data().trace.matching {
        return;
    }
    let (bits, trace_exec, trace_reg) = {
        let d = uc.get_data();
        (d.arch.bits, d.config.trace_exec, d.config.trace_reg)
    };
    let same_pc = uc.get_data().trace.deadlock.last_pc() == Some(addr);
    let changes: Option<Changes> = if same_pc || (trace_reg && trace_exec) {
        uc.reg_dump()
            .ok()
            .map(|dump| uc.get_data_mut().trace.status.changes(&dump))
    } else {
        None
    };
    let loop_active = uc
        .get_data()
        .trace
        .blockloop
        .as_ref()
        .map_or(false, |b| b.active());
    let indent = "  ".repeat(uc.get_data().trace.stacktrace.len());
    if !loop_active {
        let dis = uc.disas(addr, size as u64).unwrap_or_default();
        match &changes {
            Some(ch) if trace_reg && ch.count() > 0 => {
                eprint!("{}{}", indent, dis);
                let pad = 40usize.saturating_sub(dis.len()).max(1);
                ch.print(&" ".repeat(pad), bits, true);
            }
            _ => eprintln!("{}{}", indent, dis),
        }
    }
    let regs_changed = changes.as_ref().map_or(false, |c| c.count() > 0);
    if uc.get_data_mut().trace.deadlock.observe(addr, regs_changed) {
        let sym = uc.symbolicate(addr);
        let sym_part = if sym.is_empty() {
            String::new()
        } else {
            format!(" ({})", sym)
        };
        eprintln!("FATAL: deadlock detected at 0x{:x}{}", addr, sym_part);
        if let Some(ch) = &changes {
            ch.print(&indent, bits, false);
        }
        let _ = uc.emu_stop();
    }
}

fn on_mem(uc: &mut Engine, access: MemType, addr: u64, size: usize, value: i64) {
    if !uc.get_data().trace.matching {
        return;
    }
    let write = access == MemType::WRITE;
    let mut value = value;
    if !write {
        // the hook fires before the read lands; fetch the actual value
        if let Ok(data) = Memory::read(uc, addr, size) {
            value = Packer::new(uc.endian(), size as u8).unpack(data) as i64;
        }
    }
    let (bits, trace_mem, trace_mem_batch, trace_exec, trace_reg) = {
        let d = uc.get_data();
        (
            d.arch.bits,
            d.config.trace_mem,
            d.config.trace_mem_batch,
            d.config.trace_exec,
            d.config.trace_reg,
        )
    };
    if trace_mem {
        let depth = uc.get_data().trace.stacktrace.len();
        let mask = if size >= 8 {
            u64::MAX
        } else {
            (1u64 << (size * 8)) - 1
        };
        eprintln!(
            "{}{} 0x{:0aw$x} 0x{:0vw$x}",
            "  ".repeat(depth.saturating_sub(1)),
            if write { "W" } else { "R" },
            addr,
            (value as u64) & mask,
            aw = (bits / 4) as usize,
            vw = size * 2,
        );
    }
    if trace_mem_batch {
        let adjacent = uc.get_data().trace.memlog.adjacent(addr, write);
        if !(trace_exec || trace_reg) && !adjacent {
            let t = &mut uc.get_data_mut().trace;
            t.memlog.print("", bits);
            t.memlog.reset();
        }
        uc.get_data_mut()
            .trace
            .memlog
            .update(addr, size, value, write);
    }
}

fn on_invalid(_uc: &mut Engine, access: MemType, addr: u64, size: usize, value: i64) -> bool {
    let what = match access {
        MemType::WRITE_UNMAPPED | MemType::WRITE_PROT => "invalid write",
        MemType::READ_UNMAPPED | MemType::READ_PROT => "invalid read",
        MemType::FETCH_UNMAPPED | MemType::FETCH_PROT => "invalid fetch",
        _ => "unknown memory error",
    };
    eprintln!("{}: @0x{:x}, 0x{:x} = 0x{:x}", what, addr, size, value as u64);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Kernel, SysArg};
    use crate::kernel::{linux::LinuxKernel, posix::PosixKernel};
    use crate::testutil::{build_elf64, ElfSpec, SegSpec};
    use goblin::elf::program_header::{PF_R, PF_W, PF_X};
    use std::io::Write;

    fn write_elf(spec: &ElfSpec) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&build_elf64(spec)).unwrap();
        f.flush().unwrap();
        f
    }

    fn exec_spec(entry: u64, code: Vec<u8>) -> ElfSpec {
        ElfSpec {
            dynamic: false,
            entry,
            segments: vec![SegSpec {
                vaddr: 0x400000,
                memsz: 0x2000,
                flags: PF_R | PF_W | PF_X,
                data: code,
            }],
            interp: None,
        }
    }

    #[test]
    fn test_load_exec_layout() {
        let f = write_elf(&exec_spec(0x401000, vec![0x90; 16]));
        let emu = Emulator::new(f.path(), Config::default()).unwrap();
        let data = emu.engine().get_data();
        assert_eq!(data.layout.base, 0);
        assert_eq!(data.layout.entry, 0x401000);
        assert_eq!(data.layout.bin_entry, 0x401000);
        assert_eq!(data.layout.brk, 0x402000);
        // the segment landed at its file-declared address
        let region = data.memories.region_at(0x400000).expect("segment mapped");
        assert_eq!(region.begin, 0x400000);
        assert_eq!(region.end, 0x402000);
    }

    #[test]
    fn test_load_dyn_gets_allocated_bias() {
        let f = write_elf(&ElfSpec {
            dynamic: true,
            entry: 0,
            segments: vec![SegSpec {
                vaddr: 0,
                memsz: 0x1000,
                flags: PF_R | PF_W | PF_X,
                data: vec![0x90; 16],
            }],
            interp: None,
        });
        let emu = Emulator::new(f.path(), Config::default()).unwrap();
        let data = emu.engine().get_data();
        assert!(data.layout.base >= crate::BINARY_BASE);
        assert_eq!(data.layout.base % PAGE_SIZE as u64, 0);
        assert_eq!(data.layout.entry, data.layout.base);
    }

    #[test]
    fn test_interp_entry_selection() {
        let dir = tempfile::tempdir().unwrap();
        let interp_path = dir.path().join("ld.so");
        std::fs::write(
            &interp_path,
            build_elf64(&ElfSpec {
                dynamic: true,
                entry: 0x100,
                segments: vec![SegSpec {
                    vaddr: 0,
                    memsz: 0x1000,
                    flags: PF_R | PF_X,
                    data: vec![0x90; 16],
                }],
                interp: None,
            }),
        )
        .unwrap();

        let mut spec = exec_spec(0x401000, vec![0x90; 16]);
        spec.interp = Some(interp_path.display().to_string());
        let f = write_elf(&spec);
        let emu = Emulator::new(f.path(), Config::default()).unwrap();
        let data = emu.engine().get_data();
        assert_ne!(data.layout.interp_base, 0);
        assert_eq!(data.layout.entry, data.layout.interp_base + 0x100);
        assert_eq!(data.layout.bin_entry, 0x401000);
        assert_eq!(data.layout.base, 0);
    }

    #[test]
    fn test_brk_monotonic() {
        let f = write_elf(&exec_spec(0x401000, vec![0x90; 16]));
        let mut emu = Emulator::new(f.path(), Config::default()).unwrap();
        let uc = emu.engine_mut();
        let seed = Emu::brk(uc, 0).unwrap();
        assert_eq!(seed, 0x402000);

        let grown = Emu::brk(uc, seed + 0x800).unwrap();
        assert_eq!(grown, seed + 0x800);
        assert_eq!(Emu::brk(uc, 0).unwrap(), seed + 0x800);
        // the extension is mapped
        assert!(uc.get_data().memories.region_at(seed).is_some());

        // shrinking is refused
        assert_eq!(Emu::brk(uc, seed).unwrap(), seed + 0x800);
    }

    #[test]
    fn test_stack_guard_page() {
        let f = write_elf(&exec_spec(0x401000, vec![0x90; 16]));
        let mut emu = Emulator::new(f.path(), Config::default()).unwrap();
        let uc = emu.engine_mut();
        map_stack(uc).unwrap();
        let stack_base = uc.get_data().layout.stack_base;
        assert_eq!(uc.sp().unwrap(), stack_base + STACK_SIZE);
        let guard = uc
            .get_data()
            .memories
            .region_at(stack_base + STACK_SIZE)
            .expect("guard mapped");
        assert_eq!(guard.perms, Permission::NONE);
    }

    fn sym(name: &str, start: u64, end: u64) -> Symbol {
        Symbol {
            name: name.to_string(),
            start,
            end,
        }
    }

    #[test]
    fn test_symbolication() {
        let syms = vec![sym("f", 100, 120), sym("g", 200, 0)];
        assert_eq!(symbolicate_in(110, &syms, 110, &[], false), "f+0xa");
        assert_eq!(symbolicate_in(200, &syms, 200, &[], false), "g");
        assert_eq!(symbolicate_in(10000, &syms, 10000, &[], false), "");
        // ties between main and interpreter prefer main
        let interp = vec![sym("ig", 100, 120)];
        assert_eq!(symbolicate_in(110, &syms, 110, &interp, false), "f+0xa");
        // a strictly closer interpreter symbol wins
        let interp = vec![sym("ig", 105, 120)];
        assert_eq!(symbolicate_in(110, &syms, 110, &interp, false), "ig+0x5");
    }

    #[test]
    fn test_prefix_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/x.so"), b"x").unwrap();

        let hit = prefix_path(Some(dir.path()), "/lib/x.so", false);
        assert_eq!(hit, dir.path().join("lib/x.so").display().to_string());

        // missing target stays untouched unless forced
        let miss = prefix_path(Some(dir.path()), "/lib/y.so", false);
        assert_eq!(miss, "/lib/y.so");
        let forced = prefix_path(Some(dir.path()), "/lib/y.so", true);
        assert_eq!(forced, dir.path().join("lib/y.so").display().to_string());

        // relative paths are never rewritten
        let rel = prefix_path(Some(dir.path()), "lib/x.so", true);
        assert_eq!(rel, "lib/x.so");
        assert_eq!(prefix_path(None, "/lib/x.so", true), "/lib/x.so");
    }

    #[test]
    fn test_readlink_proc_self_exe() {
        let f = write_elf(&exec_spec(0x401000, vec![0x90; 16]));
        let mut emu = Emulator::new(f.path(), Config::default()).unwrap();
        let uc = emu.engine_mut();
        uc.get_data_mut().exe = "/tmp/hello".to_string();
        let buf = uc.mmap(0, 0x1000).unwrap();

        let def = PosixKernel::new().lookup("readlink").unwrap();
        let args = vec![
            SysArg::Str("/proc/self/exe".to_string()),
            SysArg::Obuf(crate::kernel::Obuf { addr: buf }),
            SysArg::Len(64),
        ];
        let ret = (def.handler)(uc, &args);
        assert_eq!(ret, 10);
        let out = Memory::read(uc, buf, 11).unwrap();
        assert_eq!(&out, b"/tmp/hello\0");
    }

    #[test]
    fn test_exit_records_status_and_stops() {
        let f = write_elf(&exec_spec(0x401000, vec![0x90; 16]));
        let mut emu = Emulator::new(f.path(), Config::default()).unwrap();
        let uc = emu.engine_mut();
        let def = LinuxKernel::new().lookup("exit").unwrap();
        (def.handler)(uc, &[SysArg::Int(7)]);
        assert_eq!(uc.get_data().exit_status, Some(7));
    }

    #[test]
    fn test_run_surfaces_guest_exit() {
        // mov eax, 60; mov edi, 7; syscall
        let code = vec![
            0xb8, 0x3c, 0x00, 0x00, 0x00, // mov eax, 60
            0xbf, 0x07, 0x00, 0x00, 0x00, // mov edi, 7
            0x0f, 0x05, // syscall
        ];
        let f = write_elf(&exec_spec(0x400000, code));
        let mut emu = Emulator::new(f.path(), Config::default()).unwrap();
        let res = emu.run(&["hello".to_string()], &[]);
        match res {
            Err(EmulatorError::ExitStatus(7)) => {}
            other => panic!("expected ExitStatus(7), got {:?}", other),
        }
    }

    #[test]
    fn test_run_detects_deadlock() {
        // jmp .
        let f = write_elf(&exec_spec(0x400000, vec![0xeb, 0xfe]));
        let config = Config {
            trace_exec: true,
            ..Config::default()
        };
        let mut emu = Emulator::new(f.path(), config).unwrap();
        emu.run(&["spin".to_string()], &[]).unwrap();
        assert!(emu.engine().get_data().trace.deadlock.count() > 2);
        assert_eq!(emu.engine().get_data().exit_status, None);
    }
}
