use exe::{ImageDirectoryEntry, ImportData, ImportDirectory, PE};
use logger::info;

use crate::{
    block::Blocks,
    error::{Result, RewriteError},
    image::Image,
};

/// Host callbacks for binding imports. Handles are opaque to the rewriter;
/// on Windows they are what `LoadLibraryA` returns.
pub trait ImportResolver {
    fn load_module(&mut self, name: &str) -> Option<u64>;
    fn resolve_symbol(&mut self, module: u64, name: &str) -> Option<u64>;
    fn resolve_ordinal(&mut self, module: u64, ordinal: u16) -> Option<u64>;
}

/// Walk the import descriptors and write each resolved address into the
/// IAT slot at its final emitted location. Runs after emission; the IAT
/// lives in a data block by then.
pub fn resolve(image: &Image, blocks: &Blocks, resolver: &mut dyn ImportResolver) -> Result<()> {
    let directory = image.pe().get_data_directory(ImageDirectoryEntry::Import)?;
    if directory.virtual_address.0 == 0 || directory.size == 0 {
        return Ok(());
    }

    let imports = ImportDirectory::parse(image.pe())?;

    let mut resolved = 0usize;
    let mut modules = 0usize;

    for descriptor in imports.descriptors {
        // the descriptor array is null-terminated
        if descriptor.name.0 == 0 {
            break;
        }
        let module_name = image.read_string_at(descriptor.name.0)?;
        let module =
            resolver
                .load_module(&module_name)
                .ok_or_else(|| RewriteError::ImportResolution {
                    module: module_name.clone(),
                    symbol: String::new(),
                })?;
        modules += 1;

        let entries = descriptor.get_imports(image.pe())?;
        for (index, entry) in entries.iter().enumerate() {
            let address = match entry {
                ImportData::Ordinal(ordinal) => resolver
                    .resolve_ordinal(module, *ordinal as u16)
                    .ok_or_else(|| RewriteError::ImportResolution {
                        module: module_name.clone(),
                        symbol: format!("#{}", ordinal),
                    })?,
                ImportData::ImportByName(name) => resolver
                    .resolve_symbol(module, name)
                    .ok_or_else(|| RewriteError::ImportResolution {
                        module: module_name.clone(),
                        symbol: name.to_string(),
                    })?,
            };

            let slot_rva = descriptor.first_thunk.0 + (index as u32) * 8;
            let slot = blocks.rva_to_final_address(slot_rva).ok_or(
                RewriteError::UnresolvableTarget {
                    rva: slot_rva,
                    target: slot_rva,
                },
            )?;

            unsafe { (slot as *mut u64).write_unaligned(address) };
            resolved += 1;
        }
    }

    info!("Resolved {} imports from {} modules", resolved, modules);
    Ok(())
}
