use scroll::{Pread, Pwrite, SizeWith};

use crate::error;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

pub const SIZEOF_DATA_DIRECTORY: usize = 8;
const NUM_DATA_DIRECTORIES: usize = 16;
/// IMAGE_DIRECTORY_ENTRY_SECURITY
pub const CERTIFICATE_TABLE_INDEX: usize = 4;

impl DataDirectory {
    pub fn parse(bytes: &[u8], offset: &mut usize) -> error::Result<Self> {
        Ok(bytes.gread_with(offset, scroll::LE)?)
    }
}

#[derive(Debug, PartialEq, Copy, Clone, Default)]
pub struct DataDirectories {
    pub data_directories: [Option<DataDirectory>; NUM_DATA_DIRECTORIES],
}

impl DataDirectories {
    pub fn parse(bytes: &[u8], count: usize, offset: &mut usize) -> error::Result<Self> {
        let mut data_directories = [None; NUM_DATA_DIRECTORIES];
        if count > NUM_DATA_DIRECTORIES {
            return Err(error::Error::Malformed(format!(
                "data directory count ({}) is greater than maximum number of data directories ({})",
                count, NUM_DATA_DIRECTORIES
            )));
        }
        for dir in data_directories.iter_mut().take(count) {
            let dd = DataDirectory::parse(bytes, offset)?;
            *dir = if dd.virtual_address == 0 && dd.size == 0 {
                None
            } else {
                Some(dd)
            };
        }
        Ok(DataDirectories { data_directories })
    }

    /// The certificate table entry. For the certificate table (and only it)
    /// `virtual_address` is a plain file offset.
    #[inline]
    pub fn get_certificate_table(&self) -> &Option<DataDirectory> {
        &self.data_directories[CERTIFICATE_TABLE_INDEX]
    }
}
