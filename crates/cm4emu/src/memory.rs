//! Unified memory subsystem: the single `transfer` chokepoint for every
//! load and store an instruction performs.
//!
//! Address bits \[31:29\] select a region; each region has its own
//! alignment and side-effect rules. This module owns the flash image and
//! SRAM buffers and the small scattered backing stores (NVIC priorities,
//! SCB.CPACR) that the peripheral stub table reads and writes.

use crate::config::CpuVariant;
use crate::console::Console;
use crate::error::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Load,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::W8 => 1,
            Self::W16 => 2,
            Self::W32 => 4,
        }
    }
}

/// Minimal xorshift32 generator backing the RNG peripheral stub.
///
/// The source's RNG stub only needs to return 8 pseudo-random bits on
/// demand; a full CSPRNG crate would be overkill for that.
#[derive(Debug, Clone)]
struct Rng(u32);

impl Rng {
    fn new() -> Self {
        // Any nonzero seed works; xorshift cycles through all nonzero states.
        Self(0x9E37_79B9)
    }

    fn next_byte(&mut self) -> u8 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        (x & 0xff) as u8
    }
}

pub struct Memory {
    image: Vec<u8>,
    image_writable: bool,
    pagesize: usize,
    mem: Vec<u8>,
    nvic_ip: [u8; 8],
    scb_cpacr: u32,
    rng: Rng,
    uicr_pselreset: [u32; 2],
}

impl Memory {
    #[must_use]
    pub fn new(image_size: usize, pagesize: usize, mem_size: usize) -> Self {
        Self {
            image: vec![0xFF; image_size],
            image_writable: false,
            pagesize,
            mem: vec![0u8; mem_size],
            nvic_ip: [0; 8],
            scb_cpacr: 0,
            rng: Rng::new(),
            uicr_pselreset: [0xFFFF_FFFF; 2],
        }
    }

    #[must_use]
    pub fn image_size(&self) -> usize {
        self.image.len()
    }

    /// Overwrite the image from `data`, starting at offset 0.
    pub fn load_image(&mut self, data: &[u8]) {
        self.image[..data.len()].copy_from_slice(data);
    }

    #[must_use]
    pub fn read_image_word(&self, byte_offset: usize) -> u32 {
        u32::from_le_bytes(self.image[byte_offset..byte_offset + 4].try_into().unwrap())
    }

    /// Fetch one instruction halfword directly from the code region,
    /// bypassing the peripheral/NOR-write machinery `transfer` layers in.
    #[must_use]
    pub fn fetch_halfword(&self, byte_offset: u32) -> Option<u16> {
        let offset = byte_offset as usize;
        let bytes = self.image.get(offset..offset + 2)?;
        Some(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Copy `len` bytes starting at `addr` into `out`, for debug reads.
    /// Uses word-aligned `transfer` loads when both `addr` and `len` are
    /// word-aligned, byte reads otherwise — this may trigger peripheral
    /// side effects, per the source's "best-effort debug I/O" note.
    pub fn debug_read(
        &mut self,
        console: &mut dyn Console,
        variant: CpuVariant,
        addr: u32,
        out: &mut [u8],
    ) -> Status {
        if addr % 4 == 0 && out.len() % 4 == 0 {
            for (i, chunk) in out.chunks_mut(4).enumerate() {
                let a = addr.wrapping_add((i * 4) as u32);
                let mut word = 0u32;
                match self.transfer(console, variant, Direction::Load, a, Width::W32, false, &mut word) {
                    Status::Ok => chunk.copy_from_slice(&word.to_le_bytes()),
                    other => return other,
                }
            }
        } else {
            for (i, slot) in out.iter_mut().enumerate() {
                let a = addr.wrapping_add(i as u32);
                let mut word = 0u32;
                match self.transfer(console, variant, Direction::Load, a, Width::W8, false, &mut word) {
                    Status::Ok => *slot = word as u8,
                    other => return other,
                }
            }
        }
        Status::Ok
    }

    /// Perform one load or store. `value` is read for stores and written
    /// for loads (masked to `width` and sign-extended if requested).
    pub fn transfer(
        &mut self,
        console: &mut dyn Console,
        variant: CpuVariant,
        direction: Direction,
        address: u32,
        width: Width,
        signextend: bool,
        value: &mut u32,
    ) -> Status {
        match address >> 29 {
            0 => self.transfer_code(direction, address, width, value),
            1 => self.transfer_sram(variant, direction, address, width, signextend, value),
            2 => self.transfer_peripheral(console, direction, address, width, value),
            7 => self.transfer_ppb(direction, address, width, value),
            _ => Status::Mem,
        }
    }

    fn transfer_code(
        &mut self,
        direction: Direction,
        address: u32,
        width: Width,
        value: &mut u32,
    ) -> Status {
        let offset = address as usize;

        // Undocumented, but somewhere in FICR: read-as-zero stub.
        if offset == 0x1000_0130 {
            if direction == Direction::Load {
                *value = 0;
                return Status::Ok;
            }
            return Status::Mem;
        }

        // UICR.PSELRESET[0..1]: same NOR-AND store semantics as the code
        // region, backed by their own two words rather than the image buffer.
        if let Some(idx) = uicr_pselreset_index(address) {
            if width != Width::W32 {
                return Status::Mem;
            }
            return match direction {
                Direction::Load => {
                    *value = self.uicr_pselreset[idx];
                    Status::Ok
                }
                Direction::Store => {
                    if !self.image_writable {
                        return Status::Mem;
                    }
                    self.uicr_pselreset[idx] &= *value;
                    Status::Ok
                }
            };
        }

        match direction {
            Direction::Load => {
                if offset + width.bytes() > self.image.len() {
                    return Status::Mem;
                }
                *value = read_le(&self.image, offset, width);
                Status::Ok
            }
            Direction::Store => {
                if width != Width::W32 || offset % 4 != 0 {
                    return Status::Mem;
                }
                if !self.image_writable {
                    return Status::Mem;
                }
                if offset + 4 > self.image.len() {
                    return Status::Mem;
                }
                // NOR semantics: a store only ever clears bits.
                let old = read_le(&self.image, offset, Width::W32);
                let new = old & *value;
                self.image[offset..offset + 4].copy_from_slice(&new.to_le_bytes());
                Status::Ok
            }
        }
    }

    fn transfer_sram(
        &mut self,
        variant: CpuVariant,
        direction: Direction,
        address: u32,
        width: Width,
        signextend: bool,
        value: &mut u32,
    ) -> Status {
        let offset = (address & 0x1FFF_FFFF) as usize;
        let unaligned_ok = variant.is_cortex_m4();
        if !unaligned_ok && width != Width::W8 && offset % width.bytes() != 0 {
            return Status::Mem;
        }
        if offset + width.bytes() > self.mem.len() {
            return Status::Mem;
        }
        match direction {
            Direction::Load => {
                let raw = read_le(&self.mem, offset, width);
                *value = if signextend {
                    sign_extend(raw, width)
                } else {
                    raw
                };
                Status::Ok
            }
            Direction::Store => {
                write_le(&mut self.mem, offset, width, *value);
                Status::Ok
            }
        }
    }

    fn transfer_peripheral(
        &mut self,
        console: &mut dyn Console,
        direction: Direction,
        address: u32,
        width: Width,
        value: &mut u32,
    ) -> Status {
        if width != Width::W32 || address % 4 != 0 {
            return Status::Mem;
        }
        match (address, direction) {
            (0x4000_2000, Direction::Store) => Status::Ok, // STARTRX
            (0x4000_2004, Direction::Store) => Status::Ok, // STOPRX
            (0x4000_2008, Direction::Store) => Status::Ok, // STARTTX
            (0x4000_200C, Direction::Store) => Status::Ok, // STOPTX
            (0x4000_2108, Direction::Load) => {
                *value = 1; // RXDRDY
                Status::Ok
            }
            (0x4000_211C, Direction::Load) => {
                *value = 1; // TXDRDY
                Status::Ok
            }
            (0x4000_2124, Direction::Load) => {
                *value = 0; // ERROR
                Status::Ok
            }
            (0x4000_2144, Direction::Load) => {
                *value = 0; // RXTO
                Status::Ok
            }
            (0x4000_2518, Direction::Load) => {
                *value = u32::from(console.getchar().unwrap_or(0));
                Status::Ok
            }
            (0x4000_251C, Direction::Store) => {
                console.putchar(*value as u8);
                Status::Ok
            }
            (0x4000_D100, Direction::Load) => {
                *value = 1; // RNG.VALRDY
                Status::Ok
            }
            (0x4000_D508, Direction::Load) => {
                *value = u32::from(self.rng.next_byte());
                Status::Ok
            }
            (0x4001_E400, Direction::Load) => {
                *value = 1; // NVMC.READY
                Status::Ok
            }
            (0x4001_E504, Direction::Store) => {
                self.image_writable = *value != 0;
                Status::Ok
            }
            (0x4001_E508, Direction::Store) => self.erase_page(*value),
            _ => {
                eprintln!("warning: unknown peripheral address {address:#010x}");
                if direction == Direction::Load {
                    *value = 0;
                }
                Status::Ok
            }
        }
    }

    fn erase_page(&mut self, page_addr: u32) -> Status {
        let offset = page_addr as usize;
        if offset % self.pagesize != 0 || offset + self.pagesize > self.image.len() {
            return Status::Mem;
        }
        self.image[offset..offset + self.pagesize].fill(0xFF);
        Status::Ok
    }

    fn transfer_ppb(
        &mut self,
        direction: Direction,
        address: u32,
        width: Width,
        value: &mut u32,
    ) -> Status {
        if width != Width::W32 || address % 4 != 0 {
            return Status::Mem;
        }
        match (address, direction) {
            (0xE000_E100, Direction::Store) => {
                eprintln!("NVIC ISER <- {value:#010x} (interrupts are not delivered)");
                Status::Ok
            }
            (0xE000_E180, Direction::Store) => {
                eprintln!("NVIC ICER <- {value:#010x} (interrupts are not delivered)");
                Status::Ok
            }
            (0xE000_E400..=0xE000_E41F, _) => {
                let index = ((address - 0xE000_E400) / 4) as usize;
                match direction {
                    Direction::Load => {
                        *value = u32::from(self.nvic_ip[index]);
                    }
                    Direction::Store => {
                        self.nvic_ip[index] = *value as u8;
                    }
                }
                Status::Ok
            }
            (0xE000_ED88, _) => {
                match direction {
                    Direction::Load => *value = self.scb_cpacr,
                    Direction::Store => self.scb_cpacr = *value,
                }
                Status::Ok
            }
            (0xF000_0FE0..=0xF000_0FEC, Direction::Load) => {
                *value = 0;
                Status::Ok
            }
            _ => {
                eprintln!("warning: unknown private-peripheral-bus address {address:#010x}");
                if direction == Direction::Load {
                    *value = 0;
                }
                Status::Ok
            }
        }
    }
}

fn uicr_pselreset_index(address: u32) -> Option<usize> {
    match address {
        0x1000_1200 => Some(0),
        0x1000_1204 => Some(1),
        _ => None,
    }
}

fn read_le(buf: &[u8], offset: usize, width: Width) -> u32 {
    match width {
        Width::W8 => u32::from(buf[offset]),
        Width::W16 => u32::from(u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())),
        Width::W32 => u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()),
    }
}

fn write_le(buf: &mut [u8], offset: usize, width: Width, value: u32) {
    match width {
        Width::W8 => buf[offset] = value as u8,
        Width::W16 => buf[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes()),
        Width::W32 => buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes()),
    }
}

fn sign_extend(raw: u32, width: Width) -> u32 {
    match width {
        Width::W8 => (raw as i8) as i32 as u32,
        Width::W16 => (raw as i16) as i32 as u32,
        Width::W32 => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::NullConsole;

    fn memory() -> Memory {
        Memory::new(64 * 1024, 0x400, 32 * 1024)
    }

    #[test]
    fn sram_round_trip() {
        let mut mem = memory();
        let mut console = NullConsole;
        let mut v = 0x1234_5678;
        let status = mem.transfer(
            &mut console,
            CpuVariant::CortexM4,
            Direction::Store,
            0x2000_0000,
            Width::W32,
            false,
            &mut v,
        );
        assert_eq!(status, Status::Ok);
        let mut out = 0;
        let status = mem.transfer(
            &mut console,
            CpuVariant::CortexM4,
            Direction::Load,
            0x2000_0000,
            Width::W32,
            false,
            &mut out,
        );
        assert_eq!(status, Status::Ok);
        assert_eq!(out, 0x1234_5678);
    }

    #[test]
    fn nor_write_only_clears_bits() {
        let mut mem = memory();
        let mut console = NullConsole;
        let mut on = 1;
        mem.transfer(&mut console, CpuVariant::CortexM4, Direction::Store, 0x4001_E504, Width::W32, false, &mut on);

        let mut v = 0xFFFF_0F0F;
        let status = mem.transfer(&mut console, CpuVariant::CortexM4, Direction::Store, 0, Width::W32, false, &mut v);
        assert_eq!(status, Status::Ok);
        assert_eq!(mem.read_image_word(0), 0xFFFF_0F0F);

        let mut v2 = 0xF0F0_0000;
        mem.transfer(&mut console, CpuVariant::CortexM4, Direction::Store, 0, Width::W32, false, &mut v2);
        assert_eq!(mem.read_image_word(0), 0xF0F0_0000);
    }

    #[test]
    fn write_to_readonly_flash_is_mem_error() {
        let mut mem = memory();
        let mut console = NullConsole;
        let mut v = 0;
        let status = mem.transfer(&mut console, CpuVariant::CortexM4, Direction::Store, 0, Width::W32, false, &mut v);
        assert_eq!(status, Status::Mem);
    }

    #[test]
    fn page_erase_fills_page_with_ff() {
        let mut mem = memory();
        let mut console = NullConsole;
        let mut on = 1;
        mem.transfer(&mut console, CpuVariant::CortexM4, Direction::Store, 0x4001_E504, Width::W32, false, &mut on);
        let mut v = 0xAA;
        mem.transfer(&mut console, CpuVariant::CortexM4, Direction::Store, 0, Width::W32, false, &mut v);
        let mut page = 0;
        let status = mem.transfer(&mut console, CpuVariant::CortexM4, Direction::Store, 0x4001_E508, Width::W32, false, &mut page);
        assert_eq!(status, Status::Ok);
        for b in &mem.image[0..0x400] {
            assert_eq!(*b, 0xFF);
        }
    }

    #[test]
    fn page_erase_rejects_unaligned_address() {
        let mut mem = memory();
        let mut console = NullConsole;
        let mut on = 1;
        mem.transfer(&mut console, CpuVariant::CortexM4, Direction::Store, 0x4001_E504, Width::W32, false, &mut on);
        let mut page = 0x100;
        let status = mem.transfer(&mut console, CpuVariant::CortexM4, Direction::Store, 0x4001_E508, Width::W32, false, &mut page);
        assert_eq!(status, Status::Mem);
    }

    #[test]
    fn uicr_pselreset_reads_erased_then_nor_writes() {
        let mut mem = memory();
        let mut console = NullConsole;
        let mut out = 0;
        let status = mem.transfer(&mut console, CpuVariant::CortexM4, Direction::Load, 0x1000_1200, Width::W32, false, &mut out);
        assert_eq!(status, Status::Ok);
        assert_eq!(out, 0xFFFF_FFFF);

        let mut on = 1;
        mem.transfer(&mut console, CpuVariant::CortexM4, Direction::Store, 0x4001_E504, Width::W32, false, &mut on);

        let mut v = 0x0000_00AA;
        let status = mem.transfer(&mut console, CpuVariant::CortexM4, Direction::Store, 0x1000_1204, Width::W32, false, &mut v);
        assert_eq!(status, Status::Ok);
        let mut out2 = 0;
        mem.transfer(&mut console, CpuVariant::CortexM4, Direction::Load, 0x1000_1204, Width::W32, false, &mut out2);
        assert_eq!(out2, 0x0000_00AA);
    }

    #[test]
    fn ficr_stub_reads_as_zero() {
        let mut mem = memory();
        let mut console = NullConsole;
        let mut v = 0;
        let status = mem.transfer(&mut console, CpuVariant::CortexM4, Direction::Load, 0x1000_0130, Width::W32, false, &mut v);
        assert_eq!(status, Status::Ok);
        assert_eq!(v, 0);
    }
}
