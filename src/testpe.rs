//! Builders for small synthetic PE32+ images used across the test modules.

pub(crate) const E_LFANEW: usize = 0x80;
pub(crate) const MACHINE_AMD64: u16 = 0x8664;
pub(crate) const MACHINE_I386: u16 = 0x14C;

const SECTION_TABLE: usize = E_LFANEW + 0x108;
const FILE_ALIGNMENT: usize = 0x200;
const SECTION_ALIGNMENT: usize = 0x1000;

const SCN_TEXT: u32 = 0x6000_0020; // code, execute, read
const SCN_DATA: u32 = 0xC000_0040; // initialised data, read, write

pub(crate) fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

pub(crate) struct SectionSpec {
    pub name: &'static [u8],
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub data: Vec<u8>,
    pub characteristics: u32,
}

impl SectionSpec {
    pub(crate) fn text(virtual_address: u32, virtual_size: u32, data: Vec<u8>) -> Self {
        Self {
            name: b".text",
            virtual_address,
            virtual_size,
            data,
            characteristics: SCN_TEXT,
        }
    }

    pub(crate) fn data(virtual_address: u32, virtual_size: u32, data: Vec<u8>) -> Self {
        Self {
            name: b".data",
            virtual_address,
            virtual_size,
            data,
            characteristics: SCN_DATA,
        }
    }
}

pub(crate) struct ImageSpec {
    pub image_base: u64,
    pub entry_rva: u32,
    pub machine: u16,
    pub directories: Vec<(usize, u32, u32)>,
    pub sections: Vec<SectionSpec>,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            image_base: 0x1_8000_0000,
            entry_rva: 0,
            machine: MACHINE_AMD64,
            directories: Vec::new(),
            sections: Vec::new(),
        }
    }
}

impl ImageSpec {
    /// Serialises a structurally valid PE32+ file image.
    pub(crate) fn build(&self) -> Vec<u8> {
        let headers_size = align_up(
            SECTION_TABLE + self.sections.len() * 40,
            FILE_ALIGNMENT,
        );

        let mut raw_offset = headers_size;
        let mut placements = Vec::with_capacity(self.sections.len());
        for section in &self.sections {
            let raw_size = align_up(section.data.len(), FILE_ALIGNMENT);
            placements.push((raw_offset, raw_size));
            raw_offset += raw_size;
        }

        let image_end = self
            .sections
            .iter()
            .map(|s| (s.virtual_address + s.virtual_size) as usize)
            .max()
            .unwrap_or(headers_size);
        let size_of_image = align_up(image_end, SECTION_ALIGNMENT);

        let mut buf = vec![0u8; raw_offset];

        // DOS header
        put_u16(&mut buf, 0, 0x5A4D);
        put_u32(&mut buf, 0x3C, E_LFANEW as u32);

        // NT signature + file header
        put_u32(&mut buf, E_LFANEW, 0x0000_4550);
        put_u16(&mut buf, E_LFANEW + 4, self.machine);
        put_u16(&mut buf, E_LFANEW + 6, self.sections.len() as u16);
        put_u16(&mut buf, E_LFANEW + 20, 0xF0); // SizeOfOptionalHeader
        put_u16(&mut buf, E_LFANEW + 22, 0x0022); // executable, large address aware

        // Optional header (PE32+)
        let opt = E_LFANEW + 24;
        put_u16(&mut buf, opt, 0x020B);
        put_u32(&mut buf, opt + 16, self.entry_rva);
        put_u64(&mut buf, opt + 24, self.image_base);
        put_u32(&mut buf, opt + 32, SECTION_ALIGNMENT as u32);
        put_u32(&mut buf, opt + 36, FILE_ALIGNMENT as u32);
        put_u16(&mut buf, opt + 48, 6); // MajorSubsystemVersion
        put_u32(&mut buf, opt + 56, size_of_image as u32);
        put_u32(&mut buf, opt + 60, headers_size as u32);
        put_u16(&mut buf, opt + 68, 3); // console subsystem
        put_u64(&mut buf, opt + 72, 0x10_0000); // stack reserve
        put_u64(&mut buf, opt + 80, 0x1000); // stack commit
        put_u64(&mut buf, opt + 88, 0x10_0000); // heap reserve
        put_u64(&mut buf, opt + 96, 0x1000); // heap commit
        put_u32(&mut buf, opt + 108, 16); // NumberOfRvaAndSizes
        for &(index, rva, size) in &self.directories {
            put_u32(&mut buf, opt + 112 + index * 8, rva);
            put_u32(&mut buf, opt + 116 + index * 8, size);
        }

        // Section table + section bodies
        for (i, (section, placement)) in self.sections.iter().zip(&placements).enumerate() {
            let (raw_offset, raw_size) = *placement;
            let entry = SECTION_TABLE + i * 40;
            let name_len = section.name.len().min(8);
            buf[entry..entry + name_len].copy_from_slice(&section.name[..name_len]);
            put_u32(&mut buf, entry + 8, section.virtual_size);
            put_u32(&mut buf, entry + 12, section.virtual_address);
            put_u32(&mut buf, entry + 16, raw_size as u32);
            put_u32(&mut buf, entry + 20, raw_offset as u32);
            put_u32(&mut buf, entry + 36, section.characteristics);
            buf[raw_offset..raw_offset + section.data.len()].copy_from_slice(&section.data);
        }

        buf
    }
}
