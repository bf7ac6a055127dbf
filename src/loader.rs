//! Manual mapping of a parsed [`PeImage`] into the current process.
//!
//! The mapping bypasses the system loader: a region is reserved, headers and
//! sections are laid out at their RVAs, the import address table is filled
//! in, base relocations are applied, section protections are tightened, and
//! TLS callbacks run. Failure at any stage releases everything acquired so
//! far and yields no module.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::mem::offset_of;

use log::debug;
use windows::Win32::Foundation::{FreeLibrary, ERROR_UNKNOWN_EXCEPTION, HMODULE, WIN32_ERROR};
use windows::Win32::System::Diagnostics::Debug::{
    IMAGE_DATA_DIRECTORY, IMAGE_DIRECTORY_ENTRY_BASERELOC, IMAGE_DIRECTORY_ENTRY_IMPORT,
    IMAGE_DIRECTORY_ENTRY_TLS, IMAGE_NT_HEADERS64, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_WRITE,
    IMAGE_SECTION_HEADER,
};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};
use windows::Win32::System::Memory::{
    VirtualFree, VirtualProtect, MEM_RELEASE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
    PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE,
};
use windows::Win32::System::SystemServices::{
    DLL_PROCESS_ATTACH, IMAGE_BASE_RELOCATION, IMAGE_DOS_HEADER, IMAGE_DOS_SIGNATURE,
    IMAGE_IMPORT_BY_NAME, IMAGE_IMPORT_DESCRIPTOR, IMAGE_NT_SIGNATURE, IMAGE_ORDINAL_FLAG64,
    IMAGE_REL_BASED_DIR64, IMAGE_TLS_DIRECTORY64, PIMAGE_TLS_CALLBACK,
};
use windows_core::PCSTR;

use crate::error::{LoadError, PeError, Result};
use crate::mem::Reservation;
use crate::pe::PeImage;

const IMAGE_DOS_HEADER_SIZE: usize = size_of::<IMAGE_DOS_HEADER>();
const IMAGE_NT_HEADER_SIZE: usize = size_of::<IMAGE_NT_HEADERS64>();
const IMAGE_SECTION_HEADER_SIZE: usize = size_of::<IMAGE_SECTION_HEADER>();
const IMAGE_SIZE_OF_BASE_RELOCATION: usize = size_of::<IMAGE_BASE_RELOCATION>();

/// A manually mapped module.
///
/// Owns the reserved region and the handles of every dependency library the
/// mapping loaded. Both are released on drop: dependencies in reverse
/// acquisition order, then the region itself.
pub struct Module {
    base: *mut c_void,
    image_size: usize,
    e_lfanew: usize,
    num_sections: usize,
    pub(crate) modules: Vec<HMODULE>,
    pub(crate) exports: HashMap<String, u32>,
}

impl Module {
    fn from_reservation(region: Reservation) -> Result<Self> {
        let (base, image_size) = region.into_raw();
        let mut module = Self {
            base,
            image_size,
            e_lfanew: 0,
            num_sections: 0,
            modules: Vec::new(),
            exports: HashMap::new(),
        };
        unsafe { module.parse()? };
        Ok(module)
    }

    /// Validates the headers at the mapped base and rewrites `ImageBase` to
    /// the actual load address. The machine type was already checked when
    /// the source image was parsed.
    unsafe fn parse(&mut self) -> Result<()> {
        if self.image_size < IMAGE_DOS_HEADER_SIZE {
            return Err(LoadError::BadImage(PeError::InvalidPeFormat));
        }

        let dos_header = &*(self.base as *const IMAGE_DOS_HEADER);
        if dos_header.e_magic != IMAGE_DOS_SIGNATURE
            || dos_header.e_lfanew < IMAGE_DOS_HEADER_SIZE as i32
        {
            return Err(LoadError::BadImage(PeError::InvalidPeFormat));
        }

        let e_lfanew = dos_header.e_lfanew as usize;
        if self.image_size < e_lfanew + IMAGE_NT_HEADER_SIZE {
            return Err(LoadError::BadImage(PeError::InvalidPeFormat));
        }

        let nt_header = &mut *((self.base as *mut u8).add(e_lfanew) as *mut IMAGE_NT_HEADERS64);
        if nt_header.Signature != IMAGE_NT_SIGNATURE {
            return Err(LoadError::BadImage(PeError::InvalidPeFormat));
        }

        let num_sections = nt_header.FileHeader.NumberOfSections as usize;
        let table_offset = e_lfanew
            + offset_of!(IMAGE_NT_HEADERS64, OptionalHeader)
            + nt_header.FileHeader.SizeOfOptionalHeader as usize;
        if self.image_size < table_offset + num_sections * IMAGE_SECTION_HEADER_SIZE {
            return Err(LoadError::BadImage(PeError::InvalidPeFormat));
        }

        // The relocation delta is computed against this field later.
        nt_header.OptionalHeader.ImageBase = self.base as u64;

        self.e_lfanew = e_lfanew;
        self.num_sections = num_sections;
        Ok(())
    }

    /// Base address of the mapped region.
    pub fn base(&self) -> *mut c_void {
        self.base
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn dos_header(&self) -> &IMAGE_DOS_HEADER {
        unsafe { &*(self.base as *const IMAGE_DOS_HEADER) }
    }

    pub fn nt_header(&self) -> &IMAGE_NT_HEADERS64 {
        unsafe { &*((self.base as *const u8).add(self.e_lfanew) as *const IMAGE_NT_HEADERS64) }
    }

    pub fn section_headers(&self) -> &[IMAGE_SECTION_HEADER] {
        let table_offset = self.e_lfanew
            + offset_of!(IMAGE_NT_HEADERS64, OptionalHeader)
            + self.nt_header().FileHeader.SizeOfOptionalHeader as usize;
        unsafe {
            std::slice::from_raw_parts(
                (self.base as *const u8).add(table_offset) as *const IMAGE_SECTION_HEADER,
                self.num_sections,
            )
        }
    }

    pub fn data_directory(&self, index: usize) -> IMAGE_DATA_DIRECTORY {
        self.nt_header().OptionalHeader.DataDirectory[index]
    }

    /// Handles of the dependency libraries this mapping loaded.
    pub fn imported_libraries(&self) -> &[HMODULE] {
        &self.modules
    }

    /// Address of the image entry point, if the image declares one.
    pub fn entry_point(&self) -> Option<*const c_void> {
        let rva = self.nt_header().OptionalHeader.AddressOfEntryPoint;
        if rva == 0 {
            return None;
        }
        Some(unsafe { (self.base as *const u8).add(rva as usize) } as *const c_void)
    }

    /// Typed pointer to a directory in the mapped layout. `None` when the
    /// directory is absent or its span does not fit the image; this is the
    /// single bounds check for everything reached through the directory.
    pub(crate) fn directory_ptr<T>(&self, index: usize) -> Option<*mut T> {
        let directory = self.data_directory(index);
        if (directory.Size as usize) < size_of::<T>() {
            return None;
        }
        let start = directory.VirtualAddress as usize;
        let end = start.checked_add(directory.Size as usize)?;
        if end > self.image_size {
            return None;
        }
        Some(unsafe { (self.base as *mut u8).add(start) } as *mut T)
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        for module in self.modules.iter().rev() {
            if !module.is_invalid() {
                unsafe {
                    let _ = FreeLibrary(*module);
                }
            }
        }

        unsafe {
            let _ = VirtualFree(self.base, 0, MEM_RELEASE);
        }
    }
}

/// Maps `pe` into the current process without involving the system loader.
///
/// On success the returned [`Module`] owns the mapped region and the
/// dependency libraries; on failure nothing stays allocated.
///
/// # Safety
///
/// The image's TLS callbacks are executed and its sections become live
/// memory in this process; the caller must trust the file's contents.
pub unsafe fn load(pe: &PeImage) -> Result<Module> {
    let mut region = Reservation::reserve(pe.image_size())?;
    debug!("reserved {:#x} bytes for the image", region.size());

    copy_image(pe, &mut region)?;

    let mut module = Module::from_reservation(region)?;
    debug!("image laid out at {:p}", module.base);

    build_import_table(&mut module)?;

    let delta = (module.base as u64).wrapping_sub(pe.preferred_base()) as i64;
    if delta != 0 {
        debug!("rebasing image (delta {:#x})", delta);
        relocate_base(&module, delta);
    }

    protect_sections(&module)?;

    run_tls_callbacks(&module);

    module.load_exports();

    Ok(module)
}

/// Copies the header region verbatim, then each section body to its RVA.
/// Uninitialised sections need no copy; the fresh region is already zero.
fn copy_image(pe: &PeImage, region: &mut Reservation) -> Result<()> {
    let data = pe.data();
    let headers_size = pe.size_of_headers();
    if headers_size > data.len() {
        return Err(LoadError::Truncated);
    }

    let mut writer = region.writer();
    writer.write(&data[..headers_size])?;

    for section in pe.section_headers() {
        let raw_offset = section.PointerToRawData as usize;
        let raw_size = section.SizeOfRawData as usize;
        if raw_size == 0 {
            continue;
        }

        let raw_end = raw_offset.checked_add(raw_size).ok_or(LoadError::Truncated)?;
        if raw_end > data.len() {
            return Err(LoadError::Truncated);
        }

        writer.seek(section.VirtualAddress as usize)?;
        writer.write(&data[raw_offset..raw_end])?;
    }

    Ok(())
}

fn win32_error(error: &windows_core::Error) -> LoadError {
    LoadError::SystemError(WIN32_ERROR::from_error(error).unwrap_or(ERROR_UNKNOWN_EXCEPTION))
}

/// Loads each dependency library and fills the import address table. The
/// descriptor list ends at the first zero-`Characteristics` entry.
unsafe fn build_import_table(module: &mut Module) -> Result<()> {
    let directory = module.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT.0 as usize);
    let Some(first) =
        module.directory_ptr::<IMAGE_IMPORT_DESCRIPTOR>(IMAGE_DIRECTORY_ENTRY_IMPORT.0 as usize)
    else {
        return Ok(());
    };

    let base = module.base as usize;
    let count = directory.Size as usize / size_of::<IMAGE_IMPORT_DESCRIPTOR>();

    for i in 0..count {
        let descriptor = &*first.add(i);
        if descriptor.Anonymous.Characteristics == 0 {
            break;
        }

        let library = CStr::from_ptr((base + descriptor.Name as usize) as *const c_char);
        let handle =
            LoadLibraryA(PCSTR(library.as_ptr() as *const u8)).map_err(|e| win32_error(&e))?;

        // Recorded before thunk resolution so a failed walk still releases
        // the library on teardown.
        module.modules.push(handle);
        debug!("resolving imports from {}", library.to_string_lossy());

        // When OriginalFirstThunk is zero the IAT doubles as the name table.
        let oft_rva = if descriptor.Anonymous.OriginalFirstThunk != 0 {
            descriptor.Anonymous.OriginalFirstThunk
        } else {
            descriptor.FirstThunk
        };

        let mut thunk = (base + oft_rva as usize) as *const u64;
        let mut slot = (base + descriptor.FirstThunk as usize) as *mut u64;

        while *thunk != 0 {
            let address = if *thunk & IMAGE_ORDINAL_FLAG64 != 0 {
                let ordinal = (*thunk & 0xFFFF) as usize;
                GetProcAddress(handle, PCSTR(ordinal as *const u8))
            } else {
                let by_name = &*((base + *thunk as usize) as *const IMAGE_IMPORT_BY_NAME);
                GetProcAddress(handle, PCSTR(by_name.Name.as_ptr() as *const u8))
            };

            let Some(address) = address else {
                return Err(LoadError::ProcNotFound);
            };

            *slot = address as usize as u64;
            thunk = thunk.add(1);
            slot = slot.add(1);
        }
    }

    Ok(())
}

/// Applies DIR64 fix-ups. Other relocation types (absolute padding included)
/// are ignored; a zero entry ends a block and a zero page RVA ends the walk.
unsafe fn relocate_base(module: &Module, delta: i64) {
    let Some(mut block) =
        module.directory_ptr::<IMAGE_BASE_RELOCATION>(IMAGE_DIRECTORY_ENTRY_BASERELOC.0 as usize)
    else {
        return;
    };

    let base = module.base as usize;

    while (*block).VirtualAddress != 0 {
        let block_size = (*block).SizeOfBlock as usize;
        if block_size < IMAGE_SIZE_OF_BASE_RELOCATION {
            break;
        }

        let entries = (block as *const u8).add(IMAGE_SIZE_OF_BASE_RELOCATION) as *const u16;
        for i in 0..(block_size - IMAGE_SIZE_OF_BASE_RELOCATION) / 2 {
            let entry = *entries.add(i);
            if entry == 0 {
                break;
            }

            if (entry >> 12) as u32 == IMAGE_REL_BASED_DIR64 {
                let target = (base + (*block).VirtualAddress as usize + (entry & 0xFFF) as usize)
                    as *mut u64;
                let value = target.read_unaligned();
                target.write_unaligned(value.wrapping_add(delta as u64));
            }
        }

        block = (block as *const u8).add(block_size) as *mut IMAGE_BASE_RELOCATION;
    }
}

/// Derives each section's final page protection from its write/execute
/// characteristics and applies it over the section's virtual range.
unsafe fn protect_sections(module: &Module) -> Result<()> {
    let base = module.base as usize;

    for section in module.section_headers() {
        let virtual_size = section.Misc.VirtualSize as usize;
        if virtual_size == 0 {
            continue;
        }

        let writable = (section.Characteristics & IMAGE_SCN_MEM_WRITE).0 != 0;
        let executable = (section.Characteristics & IMAGE_SCN_MEM_EXECUTE).0 != 0;
        let protection = match (writable, executable) {
            (false, false) => PAGE_READONLY,
            (false, true) => PAGE_EXECUTE_READ,
            (true, false) => PAGE_READWRITE,
            (true, true) => PAGE_EXECUTE_READWRITE,
        };

        let mut previous = PAGE_PROTECTION_FLAGS(0);
        VirtualProtect(
            (base + section.VirtualAddress as usize) as *const c_void,
            virtual_size,
            protection,
            &mut previous,
        )
        .map_err(|e| win32_error(&e))?;
    }

    Ok(())
}

/// Invokes the TLS initialisation callbacks, in order. `AddressOfCallBacks`
/// holds virtual addresses and has been through relocation already.
unsafe fn run_tls_callbacks(module: &Module) {
    let Some(tls) =
        module.directory_ptr::<IMAGE_TLS_DIRECTORY64>(IMAGE_DIRECTORY_ENTRY_TLS.0 as usize)
    else {
        return;
    };

    if (*tls).AddressOfCallBacks == 0 {
        return;
    }

    let mut callback = (*tls).AddressOfCallBacks as *const PIMAGE_TLS_CALLBACK;
    while let Some(entry) = *callback {
        entry(module.base, DLL_PROCESS_ATTACH, std::ptr::null_mut());
        callback = callback.add(1);
    }
}
