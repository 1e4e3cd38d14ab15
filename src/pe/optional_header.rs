use scroll::{Pread, Pwrite, SizeWith};

use crate::error;
use crate::pe::data_directories::{self, DataDirectories};

/// Standard fields magic number for 32-bit binary
pub const MAGIC_32: u16 = 0x10b;
/// Standard fields magic number for 64-bit binary
pub const MAGIC_64: u16 = 0x20b;

pub const SIZEOF_STANDARD_FIELDS_32: usize = 28;
pub const SIZEOF_STANDARD_FIELDS_64: usize = 24;
pub const SIZEOF_WINDOWS_FIELDS_32: usize = 68;
pub const SIZEOF_WINDOWS_FIELDS_64: usize = 88;

/// Offset of the 4-byte image checksum from the start of the optional header,
/// identical for PE32 and PE32+.
pub const CHECKSUM_FIELD_OFFSET: usize = 64;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct StandardFields32 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    /// absent in PE32+
    pub base_of_data: u32,
}

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct StandardFields64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
}

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct WindowsFields32 {
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct WindowsFields64 {
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

/// Unified 32/64-bit windows fields
#[derive(Debug, PartialEq, Copy, Clone, Default)]
pub struct WindowsFields {
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub number_of_rva_and_sizes: u32,
}

impl From<WindowsFields32> for WindowsFields {
    fn from(w: WindowsFields32) -> Self {
        WindowsFields {
            image_base: u64::from(w.image_base),
            section_alignment: w.section_alignment,
            file_alignment: w.file_alignment,
            size_of_image: w.size_of_image,
            size_of_headers: w.size_of_headers,
            check_sum: w.check_sum,
            subsystem: w.subsystem,
            dll_characteristics: w.dll_characteristics,
            number_of_rva_and_sizes: w.number_of_rva_and_sizes,
        }
    }
}

impl From<WindowsFields64> for WindowsFields {
    fn from(w: WindowsFields64) -> Self {
        WindowsFields {
            image_base: w.image_base,
            section_alignment: w.section_alignment,
            file_alignment: w.file_alignment,
            size_of_image: w.size_of_image,
            size_of_headers: w.size_of_headers,
            check_sum: w.check_sum,
            subsystem: w.subsystem,
            dll_characteristics: w.dll_characteristics,
            number_of_rva_and_sizes: w.number_of_rva_and_sizes,
        }
    }
}

#[derive(Debug, PartialEq, Copy, Clone, Default)]
pub struct OptionalHeader {
    /// `0x10b` for PE32, `0x20b` for PE32+
    pub magic: u16,
    pub windows_fields: WindowsFields,
    pub data_directories: DataDirectories,
    /// Byte offset of this header within the file
    pub file_offset: usize,
}

impl OptionalHeader {
    pub fn is_64(&self) -> bool {
        self.magic == MAGIC_64
    }

    /// Absolute file offset of the 4-byte image checksum field.
    pub fn checksum_offset(&self) -> usize {
        self.file_offset + CHECKSUM_FIELD_OFFSET
    }

    /// Absolute file offset of the first data directory entry.
    pub fn data_directories_offset(&self) -> usize {
        self.file_offset
            + if self.is_64() {
                SIZEOF_STANDARD_FIELDS_64 + SIZEOF_WINDOWS_FIELDS_64
            } else {
                SIZEOF_STANDARD_FIELDS_32 + SIZEOF_WINDOWS_FIELDS_32
            }
    }

    /// Absolute file offset of the certificate table directory entry.
    pub fn certificate_table_entry_offset(&self) -> usize {
        self.data_directories_offset()
            + data_directories::CERTIFICATE_TABLE_INDEX * data_directories::SIZEOF_DATA_DIRECTORY
    }

    pub fn parse(bytes: &[u8], offset: &mut usize) -> error::Result<Self> {
        let file_offset = *offset;
        let magic: u16 = bytes.pread_with(*offset, scroll::LE)?;
        let windows_fields = match magic {
            MAGIC_32 => {
                let _standard: StandardFields32 = bytes.gread_with(offset, scroll::LE)?;
                let windows: WindowsFields32 = bytes.gread_with(offset, scroll::LE)?;
                WindowsFields::from(windows)
            }
            MAGIC_64 => {
                let _standard: StandardFields64 = bytes.gread_with(offset, scroll::LE)?;
                let windows: WindowsFields64 = bytes.gread_with(offset, scroll::LE)?;
                WindowsFields::from(windows)
            }
            magic => return Err(error::Error::BadMagic(u64::from(magic))),
        };
        let data_directories = DataDirectories::parse(
            bytes,
            windows_fields.number_of_rva_and_sizes as usize,
            offset,
        )?;
        Ok(OptionalHeader {
            magic,
            windows_fields,
            data_directories,
            file_offset,
        })
    }
}
