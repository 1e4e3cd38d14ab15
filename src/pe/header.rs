use log::debug;
use scroll::{Pread, Pwrite, SizeWith};

use crate::error;

/// In `winnt.h` and `pe.h`, it's `IMAGE_DOS_HEADER`. Only the two fields the
/// loader still cares about are kept: the magic and `e_lfanew`.
#[derive(Debug, PartialEq, Copy, Clone, Default)]
pub struct DosHeader {
    /// Magic number: `MZ`, little endian
    pub signature: u16,
    /// e_lfanew: pointer to PE header, always read from offset 0x3c
    pub pe_pointer: u32,
}

#[doc(alias("IMAGE_DOS_SIGNATURE"))]
pub const DOS_MAGIC: u16 = 0x5a4d;
pub const PE_POINTER_OFFSET: usize = 0x3c;

impl DosHeader {
    pub fn parse(bytes: &[u8]) -> error::Result<Self> {
        let signature = bytes.pread_with(0, scroll::LE).map_err(|_| {
            error::Error::Malformed(format!("cannot parse DOS signature (offset {:#x})", 0))
        })?;
        if signature != DOS_MAGIC {
            return Err(error::Error::BadMagic(u64::from(signature)));
        }
        let pe_pointer = bytes
            .pread_with(PE_POINTER_OFFSET, scroll::LE)
            .map_err(|_| {
                error::Error::Malformed(format!(
                    "cannot parse PE header pointer (offset {:#x})",
                    PE_POINTER_OFFSET
                ))
            })?;
        if pe_pointer as usize >= bytes.len() {
            return Err(error::Error::Malformed(format!(
                "PE header pointer {:#x} is past the end of the image",
                pe_pointer
            )));
        }
        Ok(DosHeader {
            signature,
            pe_pointer,
        })
    }
}

/// COFF Header
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct CoffHeader {
    /// The machine type
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbol_table: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

pub const SIZEOF_COFF_HEADER: usize = 20;
/// PE\0\0, little endian
pub const PE_MAGIC: u32 = 0x0000_4550;
pub const SIZEOF_PE_MAGIC: usize = 4;

/// Intel 386 or later processors and compatible processors
pub const COFF_MACHINE_X86: u16 = 0x14c;
/// x64
pub const COFF_MACHINE_X86_64: u16 = 0x8664;
/// ARM little endian
pub const COFF_MACHINE_ARM: u16 = 0x1c0;
/// ARM Thumb-2 little endian
pub const COFF_MACHINE_ARMNT: u16 = 0x1c4;
/// ARM64 little endian
pub const COFF_MACHINE_ARM64: u16 = 0xaa64;
/// Intel Itanium processor family
pub const COFF_MACHINE_IA64: u16 = 0x200;
/// EFI byte code
pub const COFF_MACHINE_EBC: u16 = 0xebc;
/// RISC-V 32-bit address space
pub const COFF_MACHINE_RISCV32: u16 = 0x5032;
/// RISC-V 64-bit address space
pub const COFF_MACHINE_RISCV64: u16 = 0x5064;

/// Machine types a Secure Boot image may legitimately carry.
pub const SIGNABLE_MACHINES: &[u16] = &[
    COFF_MACHINE_X86,
    COFF_MACHINE_X86_64,
    COFF_MACHINE_ARM,
    COFF_MACHINE_ARMNT,
    COFF_MACHINE_ARM64,
    COFF_MACHINE_IA64,
    COFF_MACHINE_EBC,
    COFF_MACHINE_RISCV32,
    COFF_MACHINE_RISCV64,
];

pub fn machine_to_str(machine: u16) -> &'static str {
    match machine {
        COFF_MACHINE_X86 => "X86",
        COFF_MACHINE_X86_64 => "X86_64",
        COFF_MACHINE_ARM => "ARM",
        COFF_MACHINE_ARMNT => "ARM_NT",
        COFF_MACHINE_ARM64 => "ARM64",
        COFF_MACHINE_IA64 => "IA64",
        COFF_MACHINE_EBC => "EBC",
        COFF_MACHINE_RISCV32 => "RISC-V_32",
        COFF_MACHINE_RISCV64 => "RISC-V_64",
        _ => "COFF_UNKNOWN",
    }
}

impl CoffHeader {
    pub fn parse(bytes: &[u8], offset: &mut usize) -> error::Result<Self> {
        Ok(bytes.gread_with(offset, scroll::LE)?)
    }
}

#[derive(Debug, PartialEq, Copy, Clone, Default)]
pub struct Header {
    pub dos_header: DosHeader,
    /// PE Magic: PE\0\0, little endian
    pub signature: u32,
    pub coff_header: CoffHeader,
    pub optional_header: Option<super::optional_header::OptionalHeader>,
}

impl Header {
    pub fn parse(bytes: &[u8]) -> error::Result<Self> {
        let dos_header = DosHeader::parse(bytes)?;
        let mut offset = dos_header.pe_pointer as usize;
        let signature = bytes.gread_with(&mut offset, scroll::LE).map_err(|_| {
            error::Error::Malformed(format!("cannot parse PE signature (offset {:#x})", offset))
        })?;
        if signature != PE_MAGIC {
            return Err(error::Error::BadMagic(u64::from(signature)));
        }
        let coff_header = CoffHeader::parse(bytes, &mut offset)?;
        debug!("{:#x?}", coff_header);
        let optional_header = if coff_header.size_of_optional_header > 0 {
            Some(super::optional_header::OptionalHeader::parse(
                bytes,
                &mut offset,
            )?)
        } else {
            None
        };
        Ok(Header {
            dos_header,
            signature,
            coff_header,
            optional_header,
        })
    }
}
