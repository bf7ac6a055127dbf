//! On-disk PE image parsing.
//!
//! [`PeImage`] owns the raw file bytes and exposes typed views over the DOS,
//! NT, and section headers, plus the RVA-to-file-offset translation the
//! mapper needs. Only PE32+ images for the AMD64 machine are accepted.

use std::mem::offset_of;
use std::path::Path;
use std::{fs, slice};

use windows::Win32::System::Diagnostics::Debug::{
    IMAGE_DATA_DIRECTORY, IMAGE_DIRECTORY_ENTRY_IMPORT, IMAGE_FILE_DLL, IMAGE_NT_HEADERS64,
    IMAGE_SECTION_HEADER,
};
use windows::Win32::System::SystemInformation::IMAGE_FILE_MACHINE_AMD64;
use windows::Win32::System::SystemServices::{
    IMAGE_DOS_HEADER, IMAGE_DOS_SIGNATURE, IMAGE_IMPORT_DESCRIPTOR, IMAGE_NT_SIGNATURE,
};

use crate::error::PeError;

const IMAGE_DOS_HEADER_SIZE: usize = size_of::<IMAGE_DOS_HEADER>();
const IMAGE_NT_HEADER_SIZE: usize = size_of::<IMAGE_NT_HEADERS64>();
const IMAGE_SECTION_HEADER_SIZE: usize = size_of::<IMAGE_SECTION_HEADER>();

/// A validated 64-bit PE file image in its on-disk layout.
pub struct PeImage {
    data: Vec<u8>,
    e_lfanew: usize,
    num_sections: usize,
}

impl PeImage {
    /// Reads and parses the PE file at `path`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PeError> {
        Self::parse(fs::read(path)?)
    }

    /// Parses an in-memory copy of a PE file.
    ///
    /// Validation order: DOS header, NT signature, machine type, section
    /// table bounds. The first violation is reported and parsing stops.
    pub fn parse(data: Vec<u8>) -> Result<Self, PeError> {
        if data.len() < IMAGE_DOS_HEADER_SIZE {
            return Err(PeError::InvalidPeFormat);
        }

        let dos_header = unsafe { &*(data.as_ptr() as *const IMAGE_DOS_HEADER) };
        if dos_header.e_magic != IMAGE_DOS_SIGNATURE
            || dos_header.e_lfanew < IMAGE_DOS_HEADER_SIZE as i32
        {
            return Err(PeError::InvalidPeFormat);
        }

        let e_lfanew = dos_header.e_lfanew as usize;
        if data.len() < e_lfanew + IMAGE_NT_HEADER_SIZE {
            return Err(PeError::InvalidPeFormat);
        }

        let nt_header = unsafe { &*(data.as_ptr().add(e_lfanew) as *const IMAGE_NT_HEADERS64) };
        if nt_header.Signature != IMAGE_NT_SIGNATURE {
            return Err(PeError::InvalidPeFormat);
        }

        if nt_header.FileHeader.Machine != IMAGE_FILE_MACHINE_AMD64 {
            return Err(PeError::NotSupportedMachine);
        }

        // Every section header must lie within the buffer.
        let num_sections = nt_header.FileHeader.NumberOfSections as usize;
        let table_offset = e_lfanew
            + offset_of!(IMAGE_NT_HEADERS64, OptionalHeader)
            + nt_header.FileHeader.SizeOfOptionalHeader as usize;
        if data.len() < table_offset + num_sections * IMAGE_SECTION_HEADER_SIZE {
            return Err(PeError::InvalidPeFormat);
        }

        Ok(Self {
            data,
            e_lfanew,
            num_sections,
        })
    }

    /// The raw file bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn dos_header(&self) -> &IMAGE_DOS_HEADER {
        unsafe { &*(self.data.as_ptr() as *const IMAGE_DOS_HEADER) }
    }

    pub fn nt_header(&self) -> &IMAGE_NT_HEADERS64 {
        unsafe { &*(self.data.as_ptr().add(self.e_lfanew) as *const IMAGE_NT_HEADERS64) }
    }

    pub fn section_headers(&self) -> &[IMAGE_SECTION_HEADER] {
        let table_offset = self.e_lfanew
            + offset_of!(IMAGE_NT_HEADERS64, OptionalHeader)
            + self.nt_header().FileHeader.SizeOfOptionalHeader as usize;
        unsafe {
            slice::from_raw_parts(
                self.data.as_ptr().add(table_offset) as *const IMAGE_SECTION_HEADER,
                self.num_sections,
            )
        }
    }

    /// `SizeOfImage`: the extent of the image once laid out in memory.
    pub fn image_size(&self) -> usize {
        self.nt_header().OptionalHeader.SizeOfImage as usize
    }

    /// `SizeOfHeaders`: the extent of the header region in the file,
    /// including the section table.
    pub fn size_of_headers(&self) -> usize {
        self.nt_header().OptionalHeader.SizeOfHeaders as usize
    }

    /// The base address the image was linked for.
    pub fn preferred_base(&self) -> u64 {
        self.nt_header().OptionalHeader.ImageBase
    }

    pub fn entry_point_rva(&self) -> u32 {
        self.nt_header().OptionalHeader.AddressOfEntryPoint
    }

    pub fn is_dll(&self) -> bool {
        (self.nt_header().FileHeader.Characteristics & IMAGE_FILE_DLL).0 != 0
    }

    /// The (RVA, size) pair for a data-directory slot.
    pub fn data_directory(&self, index: usize) -> IMAGE_DATA_DIRECTORY {
        self.nt_header().OptionalHeader.DataDirectory[index]
    }

    /// The first import descriptor in the on-disk layout, or `None` when the
    /// image has no import directory (or its RVA falls outside any section).
    pub fn import_directory(&self) -> Option<&IMAGE_IMPORT_DESCRIPTOR> {
        let directory = self.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT.0 as usize);
        if directory.Size == 0 {
            return None;
        }

        let raw = self.rva_to_raw(directory.VirtualAddress)? as usize;
        if self.data.len() < raw + size_of::<IMAGE_IMPORT_DESCRIPTOR>() {
            return None;
        }

        Some(unsafe { &*(self.data.as_ptr().add(raw) as *const IMAGE_IMPORT_DESCRIPTOR) })
    }

    /// Translates an RVA into a file offset through the section that spans
    /// it. RVAs inside the header region (before the first section) are not
    /// translated; index [`data`](Self::data) directly for those.
    pub fn rva_to_raw(&self, rva: u32) -> Option<u32> {
        self.section_headers()
            .iter()
            .find(|section| {
                let virtual_size = unsafe { section.Misc.VirtualSize };
                rva >= section.VirtualAddress && rva - section.VirtualAddress < virtual_size
            })
            .map(|section| rva - section.VirtualAddress + section.PointerToRawData)
    }
}
