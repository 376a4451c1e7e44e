use unicorn_engine::unicorn_const::{uc_error, MemRegion, Permission};
use unicorn_engine::Unicorn;

use crate::arch::ArchInfo;
use crate::engine::Machine;
use crate::utils::{align, align_up, Packer};
use crate::{MMAP_BASE, PAGE_SIZE};

pub type PointerSizeT = u8;

#[derive(Debug)]
struct MapInfo {
    info: MemRegion,
    label: String,
}

/// Host-side record of every guest mapping, kept sorted by base address.
/// Region ends are exclusive.
#[derive(Default, Debug)]
pub struct MemoryManager {
    map_info: Vec<MapInfo>,
}

impl MemoryManager {
    pub(crate) fn add_mapinfo(&mut self, mem_info: MemRegion, label: String) {
        self.map_info.push(MapInfo {
            info: mem_info,
            label,
        });
        self.map_info.sort_by_key(|info| info.info.begin);
    }

    /// Lowest page-aligned gap of at least `size` bytes, starting the search
    /// at `hint` (or the anonymous-mapping floor when the hint is 0).
    pub fn find_free(&self, hint: u64, size: u64) -> u64 {
        let hint = if hint == 0 { MMAP_BASE } else { hint };
        let mut addr = align_up(hint, PAGE_SIZE as u64);
        for info in &self.map_info {
            let MemRegion { begin, end, .. } = info.info;
            if end <= addr {
                continue;
            }
            if begin >= addr + size {
                break;
            }
            addr = align_up(end, PAGE_SIZE as u64);
        }
        addr
    }

    pub fn regions(&self) -> impl Iterator<Item = &MemRegion> {
        self.map_info.iter().map(|i| &i.info)
    }

    pub fn region_at(&self, addr: u64) -> Option<&MemRegion> {
        self.map_info
            .iter()
            .map(|i| &i.info)
            .find(|r| r.begin <= addr && addr < r.end)
    }

    /// Regions with the label they were mapped under.
    pub fn labeled_regions(&self) -> impl Iterator<Item = (&str, &MemRegion)> {
        self.map_info.iter().map(|i| (i.label.as_str(), &i.info))
    }
}

pub trait Memory {
    fn pagesize(&self) -> u64 {
        PAGE_SIZE as u64
    }

    /// Reserve and map a page-aligned region of at least `size` bytes near
    /// `hint` with default R|W protection. Returns the actual base.
    fn mmap(&mut self, hint: u64, size: u64) -> Result<u64, uc_error>;

    /// Map `[addr, addr + size)` with exact protection. Both arguments must
    /// be page-aligned.
    fn mem_map_prot(
        &mut self,
        addr: u64,
        size: u64,
        prot: Permission,
        label: &str,
    ) -> Result<(), uc_error>;

    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>, uc_error>;
    fn read_into(&self, buf: &mut [u8], addr: u64) -> Result<(), uc_error>;
    fn write(&mut self, addr: u64, bytes: impl AsRef<[u8]>) -> Result<(), uc_error>;

    /// Read a guest word. `size` of 1, 2, 4 or 8 bytes, `None` for the
    /// native pointer size. Unpacked per the image byte order.
    fn read_ptr(&self, addr: u64, size: Option<PointerSizeT>) -> Result<u64, uc_error>;
    fn write_ptr(
        &mut self,
        addr: u64,
        value: u64,
        size: Option<PointerSizeT>,
    ) -> Result<(), uc_error>;

    fn is_mapped(&self, addr: u64) -> bool;
}

impl<'a> Memory for Unicorn<'a, Machine> {
    fn mmap(&mut self, hint: u64, size: u64) -> Result<u64, uc_error> {
        let size = align_up(size.max(1), PAGE_SIZE as u64);
        let addr = self.get_data().memories.find_free(hint, size);
        self.mem_map_prot(addr, size, Permission::READ | Permission::WRITE, "[mmap]")?;
        Ok(addr)
    }

    fn mem_map_prot(
        &mut self,
        addr: u64,
        size: u64,
        prot: Permission,
        label: &str,
    ) -> Result<(), uc_error> {
        debug_assert_eq!(addr, align(addr, PAGE_SIZE as u64));
        debug_assert_eq!(size, align_up(size, PAGE_SIZE as u64));
        debug_assert!(
            prot & (!Permission::ALL) == Permission::NONE,
            "unexpected permissions mask {:?}",
            prot
        );
        Unicorn::mem_map(self, addr, size as usize, prot)?;
        self.get_data_mut().memories.add_mapinfo(
            MemRegion {
                begin: addr,
                end: addr + size,
                perms: prot,
            },
            label.to_string(),
        );
        Ok(())
    }

    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>, uc_error> {
        self.mem_read_as_vec(addr, size)
    }

    fn read_into(&self, buf: &mut [u8], addr: u64) -> Result<(), uc_error> {
        self.mem_read(addr, buf)
    }

    fn write(&mut self, addr: u64, bytes: impl AsRef<[u8]>) -> Result<(), uc_error> {
        self.mem_write(addr, bytes.as_ref())
    }

    fn read_ptr(&self, addr: u64, size: Option<PointerSizeT>) -> Result<u64, uc_error> {
        let size = size.unwrap_or_else(|| self.pointer_size());
        let data = Memory::read(self, addr, size as usize)?;
        let packer = Packer::new(self.endian(), size);
        Ok(packer.unpack(data))
    }

    fn write_ptr(
        &mut self,
        addr: u64,
        value: u64,
        size: Option<PointerSizeT>,
    ) -> Result<(), uc_error> {
        let size = size.unwrap_or_else(|| self.pointer_size());
        let packer = Packer::new(self.endian(), size);
        Memory::write(self, addr, packer.pack(value))
    }

    fn is_mapped(&self, addr: u64) -> bool {
        self.get_data().memories.region_at(addr).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(begin: u64, end: u64) -> MemRegion {
        MemRegion {
            begin,
            end,
            perms: Permission::ALL,
        }
    }

    #[test]
    fn test_find_free_skips_taken_ranges() {
        let mut mm = MemoryManager::default();
        assert_eq!(mm.find_free(0x1000000, 0x2000), 0x1000000);

        mm.add_mapinfo(region(0x1000000, 0x1002000), "a".into());
        assert_eq!(mm.find_free(0x1000000, 0x2000), 0x1002000);

        mm.add_mapinfo(region(0x1004000, 0x1005000), "b".into());
        // the 0x2000-byte hole between the two regions fits
        assert_eq!(mm.find_free(0x1000000, 0x2000), 0x1002000);
        // a bigger request has to go past the second region
        assert_eq!(mm.find_free(0x1000000, 0x3000), 0x1005000);
    }

    #[test]
    fn test_find_free_defaults_to_mmap_floor() {
        let mm = MemoryManager::default();
        assert_eq!(mm.find_free(0, 0x1000), MMAP_BASE);
    }
}
