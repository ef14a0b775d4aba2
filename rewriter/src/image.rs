use std::{mem, path::Path};

use exe::{
    Arch, Buffer, Castable, FileCharacteristics, ImageDirectoryEntry, ImageSectionHeader,
    NTHeaders, PETranslation, SectionCharacteristics, VecPE, PE, RVA,
};
use logger::info;

use crate::error::{Result, RewriteError};

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct RuntimeFunction {
    pub begin_address: u32,
    pub end_address: u32,
    pub unwind_info_address: u32,
}
unsafe impl Castable for RuntimeFunction {}

/// A parsed 64-bit PE image held as its on-disk byte layout.
pub struct Image {
    pe: VecPE,
}

impl Image {
    pub fn open(path: &Path) -> Result<Self> {
        let pe = VecPE::from_disk_file(path)?;
        let image = Self::validate(pe)?;
        info!(
            "Loaded 64-bit image ({:.2} MB)",
            image.pe.len() as f64 / 1_000_000.0
        );
        Ok(image)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::validate(VecPE::from_disk_data(data))
    }

    fn validate(pe: VecPE) -> Result<Self> {
        match pe.get_arch()? {
            Arch::X64 => Ok(Self { pe }),
            _ => Err(RewriteError::UnsupportedMachine),
        }
    }

    pub fn pe(&self) -> &VecPE {
        &self.pe
    }

    pub fn len(&self) -> usize {
        self.pe.len()
    }

    pub fn entry_rva(&self) -> Result<u32> {
        Ok(self.pe.get_entrypoint()?.0)
    }

    pub fn is_dll(&self) -> Result<bool> {
        let characteristics = match self.pe.get_valid_nt_headers()? {
            NTHeaders::NTHeaders64(h64) => h64.file_header.characteristics,
            NTHeaders::NTHeaders32(h32) => h32.file_header.characteristics,
        };
        Ok(characteristics.contains(FileCharacteristics::DLL))
    }

    pub fn sections(&self) -> Result<&[ImageSectionHeader]> {
        Ok(self.pe.get_section_table()?)
    }

    pub fn section_at(&self, rva: u32) -> Option<&ImageSectionHeader> {
        let sections = self.pe.get_section_table().ok()?;
        sections.iter().find(|section| {
            let start = section.virtual_address.0;
            rva >= start && rva < start + section.virtual_size
        })
    }

    pub fn is_executable_rva(&self, rva: u32) -> bool {
        self.section_at(rva).is_some_and(|section| {
            section
                .characteristics
                .contains(SectionCharacteristics::MEM_EXECUTE)
        })
    }

    /// The function table from the exception directory. Empty when the
    /// directory is absent.
    pub fn runtime_functions(&self) -> Result<Vec<RuntimeFunction>> {
        let directory = self.pe.get_data_directory(ImageDirectoryEntry::Exception)?;

        if directory.virtual_address.0 == 0 || directory.size == 0 {
            return Ok(Vec::new());
        }

        let offset = self
            .pe
            .translate(PETranslation::Memory(directory.virtual_address))?;
        let count = directory.size as usize / mem::size_of::<RuntimeFunction>();
        let functions = self
            .pe
            .get_slice_ref::<RuntimeFunction>(offset, count)
            .map_err(|e| RewriteError::Parse(e.to_string()))?;

        Ok(functions.to_vec())
    }

    /// Linear scan over the section table; RVAs inside a section's virtual
    /// range map to its raw data, everything else is unmapped.
    pub fn rva_to_offset(&self, rva: u32) -> Option<usize> {
        let section = self.section_at(rva)?;
        let delta = rva - section.virtual_address.0;
        Some(section.pointer_to_raw_data.0 as usize + delta as usize)
    }

    pub fn read(&self, offset: usize, size: usize) -> Result<&[u8]> {
        self.pe
            .read(offset, size)
            .map_err(|e| RewriteError::Parse(e.to_string()))
    }

    pub fn read_string_at(&self, rva: u32) -> Result<String> {
        let offset = self.pe.translate(PETranslation::Memory(RVA(rva)))?;
        if offset >= self.pe.len() {
            return Err(RewriteError::Parse(format!(
                "string at rva {:#x} is out of bounds",
                rva
            )));
        }
        let tail = self.read(offset, self.pe.len() - offset)?;
        let end = tail.iter().position(|&c| c == 0).unwrap_or(tail.len());
        Ok(String::from_utf8_lossy(&tail[..end]).to_string())
    }

    pub fn section_name(section: &ImageSectionHeader) -> String {
        let bytes = section.name.iter().map(|c| c.0).collect::<Vec<u8>>();
        String::from_utf8_lossy(&bytes)
            .trim_end_matches('\0')
            .to_string()
    }
}
