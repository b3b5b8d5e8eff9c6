//! Construction-time configuration for a [`crate::Machine`].

/// CPU variant gate. Thumb-2 32-bit encodings, IT blocks, CBZ/CBNZ and
/// unaligned region-1 accesses are only available on `CortexM4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuVariant {
    /// Plain Thumb core (Cortex-M0-class). No Thumb-2, no IT blocks.
    Base,
    /// Cortex-M4-class core: Thumb-2, IT blocks, CBZ/CBNZ, unaligned SRAM access.
    #[default]
    CortexM4,
}

impl CpuVariant {
    #[must_use]
    pub const fn is_cortex_m4(self) -> bool {
        matches!(self, Self::CortexM4)
    }
}

/// Log verbosity, ordered from least to most chatty.
///
/// Mirrors the source emulator's level scheme: each step up prints
/// progressively richer call traces and register dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    Error,
    Warn,
    Calls,
    CallsSp,
    Instrs,
}

/// Parameters passed to [`crate::Machine::create`].
#[derive(Debug, Clone, Copy)]
pub struct MachineConfig {
    /// Size of the code/flash image in bytes. Must be at least 64.
    pub image_size: usize,
    /// NOR-flash erase granularity in bytes.
    pub pagesize: usize,
    /// Size of the SRAM region in bytes.
    pub mem_size: usize,
    pub loglevel: LogLevel,
    pub variant: CpuVariant,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            image_size: 256 * 1024,
            pagesize: 1024,
            mem_size: 32 * 1024,
            loglevel: LogLevel::Error,
            variant: CpuVariant::CortexM4,
        }
    }
}
