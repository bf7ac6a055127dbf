use std::ffi::{c_char, CStr};
use std::mem;

use windows::Win32::Foundation::FARPROC;
use windows::Win32::System::Diagnostics::Debug::IMAGE_DIRECTORY_ENTRY_EXPORT;
use windows::Win32::System::SystemServices::IMAGE_EXPORT_DIRECTORY;

use crate::loader::Module;

impl Module {
    /// Indexes the export directory by name. Forwarder entries (RVAs inside
    /// the export directory itself) are skipped; resolving them is the
    /// system loader's business.
    pub(crate) unsafe fn load_exports(&mut self) {
        let index = IMAGE_DIRECTORY_ENTRY_EXPORT.0 as usize;
        let Some(directory) = self.directory_ptr::<IMAGE_EXPORT_DIRECTORY>(index) else {
            return;
        };

        let exports = &*directory;
        if exports.NumberOfNames == 0 || exports.NumberOfFunctions == 0 {
            return;
        }

        let span = self.data_directory(index);
        let span = span.VirtualAddress..span.VirtualAddress + span.Size;

        let base = self.base() as usize;
        let names = (base + exports.AddressOfNames as usize) as *const u32;
        let ordinals = (base + exports.AddressOfNameOrdinals as usize) as *const u16;
        let functions = (base + exports.AddressOfFunctions as usize) as *const u32;

        for i in 0..exports.NumberOfNames as usize {
            let name = CStr::from_ptr((base + *names.add(i) as usize) as *const c_char);
            let ordinal = *ordinals.add(i) as usize;
            if ordinal >= exports.NumberOfFunctions as usize {
                continue;
            }

            let rva = *functions.add(ordinal);
            if rva == 0 || span.contains(&rva) {
                continue;
            }

            self.exports
                .insert(String::from_utf8_lossy(name.to_bytes()).into_owned(), rva);
        }
    }

    /// Looks up an export of the mapped module by name.
    pub fn get_proc_address(&self, name: &str) -> FARPROC {
        match self.exports.get(name) {
            Some(rva) => unsafe {
                mem::transmute((self.base() as usize + *rva as usize) as *const std::ffi::c_void)
            },
            None => None,
        }
    }
}
