use std::cmp::Ordering;
use std::fmt::Debug;

use anyhow::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use goblin::container::Endian;
use num_traits::PrimInt;

use crate::engine::Engine;
use crate::errors::EmulatorError;
use crate::memory::{Memory, PointerSizeT};
use crate::PAGE_SIZE;

/// Align a value down to the specified alignment boundary. If `value` is
/// already aligned, the same value is returned.
pub fn align<T>(value: T, alignment: impl Into<T>) -> T
where
    T: PrimInt + Debug,
{
    let alignment = alignment.into();
    let mask = alignment - T::one();
    debug_assert_eq!(alignment & mask, T::zero());
    value & (!mask)
}

/// Align a value up to the specified alignment boundary.
pub fn align_up<T>(value: T, alignment: impl Into<T>) -> T
where
    T: PrimInt + Debug,
{
    let alignment = alignment.into();
    let mask = alignment - T::one();
    debug_assert_eq!(alignment & mask, T::zero());
    (value + mask) & (!mask)
}

/// Page-aligned span enclosing `[addr, addr + size)`.
/// Returns the aligned start and the aligned length.
pub fn page_align(addr: u64, size: u64) -> (u64, u64) {
    let start = align(addr, PAGE_SIZE);
    let end = align_up(addr + size, PAGE_SIZE);
    (start, end - start)
}

/// Compare strings with embedded digit runs compared numerically,
/// so `x2` sorts before `x10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        if a[i].is_ascii_digit() && b[j].is_ascii_digit() {
            let si = i;
            while i < a.len() && a[i].is_ascii_digit() {
                i += 1;
            }
            let sj = j;
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            let na: u128 = std::str::from_utf8(&a[si..i]).unwrap().parse().unwrap_or(0);
            let nb: u128 = std::str::from_utf8(&b[sj..j]).unwrap().parse().unwrap_or(0);
            match na.cmp(&nb) {
                Ordering::Equal => {}
                ord => return ord,
            }
        } else {
            match a[i].cmp(&b[j]) {
                Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
                ord => return ord,
            }
        }
    }
    (a.len() - i).cmp(&(b.len() - j))
}

/// Register-dump ordering: digit-less names sort before digit-bearing ones,
/// digit-bearing names sort naturally among themselves.
pub fn register_name_order(a: &str, b: &str) -> Ordering {
    let an = a.bytes().any(|c| c.is_ascii_digit());
    let bn = b.bytes().any(|c| c.is_ascii_digit());
    match (an, bn) {
        (true, true) => natural_cmp(a, b),
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        (false, false) => a.cmp(b),
    }
}

/// Read a NUL-terminated string out of guest memory.
pub fn read_string(core: &Engine, address: u64) -> Result<String, EmulatorError> {
    let mut result: Vec<u8> = Vec::new();
    let mut address = address;
    loop {
        let byte = Memory::read(core, address, 1)?[0];
        if byte == 0 {
            break;
        }
        result.push(byte);
        address += 1;
    }
    String::from_utf8(result).map_err(|e| EmulatorError::Custom(Error::new(e)))
}

/// Packs and unpacks guest-sized words honouring the image byte order.
pub struct Packer {
    endian: Endian,
    pointer_size: usize,
}

impl Packer {
    pub fn new(endian: Endian, pointer_size: PointerSizeT) -> Self {
        Self {
            endian,
            pointer_size: pointer_size as usize,
        }
    }

    pub fn pack(&self, v: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self.endian {
            Endian::Little => {
                buf.put_uint_le(v, self.pointer_size);
            }
            Endian::Big => {
                buf.put_uint(v, self.pointer_size);
            }
        }
        buf.to_vec()
    }

    pub fn unpack(&self, data: Vec<u8>) -> u64 {
        let mut data = Bytes::from(data);
        match self.endian {
            Endian::Little => data.get_uint_le(self.pointer_size),
            Endian::Big => data.get_uint(self.pointer_size),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{align, align_up, natural_cmp, page_align, register_name_order, Packer};
    use goblin::container::Endian;
    use std::cmp::Ordering;

    #[test]
    pub fn test_align() {
        let pagesize = 0x1000u64;

        {
            assert_eq!(align(0x0111u64, pagesize), 0x0000);
            assert_eq!(align(0x1000u64, pagesize), 0x1000);
            assert_eq!(align(0x1001u64, pagesize), 0x1000);
            assert_eq!(align(0x1111u64, pagesize), 0x1000);
            assert_eq!(align(0x10000u64, pagesize), 0x10000);
        }

        {
            assert_eq!(align_up(0x0111u64, pagesize), 0x1000);
            assert_eq!(align_up(0x1000u64, pagesize), 0x1000);
            assert_eq!(align_up(0x1001u64, pagesize), 0x2000);
            assert_eq!(align_up(0x2000u64, pagesize), 0x2000);
        }
    }

    #[test]
    fn test_page_align_spans_whole_pages() {
        assert_eq!(page_align(0x400010, 0x20), (0x400000, 0x1000));
        assert_eq!(page_align(0x400000, 0x1001), (0x400000, 0x2000));
        assert_eq!(page_align(0x400ff0, 0x20), (0x400000, 0x2000));
    }

    #[test]
    fn test_natural_order() {
        assert_eq!(natural_cmp("x2", "x10"), Ordering::Less);
        assert_eq!(natural_cmp("r9", "r11"), Ordering::Less);
        assert_eq!(natural_cmp("a1b", "a1c"), Ordering::Less);
        assert_eq!(register_name_order("rax", "r8"), Ordering::Less);
        assert_eq!(register_name_order("r8", "rax"), Ordering::Greater);
        assert_eq!(register_name_order("t2", "t10"), Ordering::Less);
    }

    #[test]
    fn test_packer_byte_order() {
        let le = Packer::new(Endian::Little, 4);
        assert_eq!(le.pack(0x11223344), vec![0x44, 0x33, 0x22, 0x11]);
        assert_eq!(le.unpack(vec![0x44, 0x33, 0x22, 0x11]), 0x11223344);

        let be = Packer::new(Endian::Big, 4);
        assert_eq!(be.pack(0x11223344), vec![0x11, 0x22, 0x33, 0x44]);
        assert_eq!(be.unpack(vec![0x11, 0x22, 0x33, 0x44]), 0x11223344);
    }
}
