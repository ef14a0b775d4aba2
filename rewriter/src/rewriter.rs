use std::path::Path;

use logger::info;

use crate::{
    block::{Blocks, CodeBlock, DataBlock},
    disasm,
    emit::{self, MemoryRegion, REGION_JUMP_SLOT},
    error::{Result, RewriteError},
    image::Image,
    imports::{self, ImportResolver},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    /// `write` ran but failed; the caller's regions may hold partial output.
    Consumed,
    Written,
}

/// A rewriting session: one source image, decomposed into blocks, waiting
/// for target regions to stream into.
///
/// ```no_run
/// # use rewriter::{ImportResolver, Rewriter};
/// # struct Host;
/// # impl ImportResolver for Host {
/// #     fn load_module(&mut self, _: &str) -> Option<u64> { None }
/// #     fn resolve_symbol(&mut self, _: u64, _: &str) -> Option<u64> { None }
/// #     fn resolve_ordinal(&mut self, _: u64, _: u16) -> Option<u64> { None }
/// # }
/// # fn alloc(_size: usize) -> *mut u8 { std::ptr::null_mut() }
/// let mut session = Rewriter::open("payload.dll".as_ref())?;
/// let code_size = session.code_capacity_hint();
/// let data_size = session.data_capacity_hint();
/// session.add_code_region(alloc(code_size), code_size);
/// session.add_data_region(alloc(data_size), data_size);
/// session.write(&mut Host)?;
/// let entry = session.entry_point();
/// # Ok::<(), rewriter::RewriteError>(())
/// ```
pub struct Rewriter {
    image: Image,
    blocks: Blocks,
    code_regions: Vec<MemoryRegion>,
    data_regions: Vec<MemoryRegion>,
    entry_rva: u32,
    state: SessionState,
}

impl Rewriter {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_image(Image::open(path)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::from_image(Image::from_bytes(data)?)
    }

    fn from_image(image: Image) -> Result<Self> {
        let entry_rva = image.entry_rva()?;
        let blocks = disasm::disassemble(&image)?;

        Ok(Self {
            image,
            blocks,
            code_regions: Vec::new(),
            data_regions: Vec::new(),
            entry_rva,
            state: SessionState::Open,
        })
    }

    /// Register an executable target range. Regions fill in registration
    /// order; all but the last reserve a tail slot for the inter-region
    /// jump.
    pub fn add_code_region(&mut self, base: *mut u8, size: usize) {
        self.code_regions.push(MemoryRegion::new(base, size));
    }

    pub fn add_data_region(&mut self, base: *mut u8, size: usize) {
        self.data_regions.push(MemoryRegion::new(base, size));
    }

    /// Worst-case code bytes `write` can produce in a single region.
    pub fn code_capacity_hint(&self) -> usize {
        let blocks: usize = self
            .blocks
            .code
            .iter()
            .map(|block| block.expected_size)
            .sum();
        blocks + REGION_JUMP_SLOT
    }

    /// Worst-case data bytes `write` can produce in a single region,
    /// including alignment padding.
    pub fn data_capacity_hint(&self) -> usize {
        self.blocks
            .data
            .iter()
            .map(|block| block.virtual_size + 16)
            .sum()
    }

    /// Emit data and code into the registered regions, then bind imports.
    /// Consumes the session either way; a second call fails.
    pub fn write(&mut self, resolver: &mut dyn ImportResolver) -> Result<()> {
        if self.state != SessionState::Open {
            return Err(RewriteError::AlreadyWritten);
        }
        self.state = SessionState::Consumed;

        emit::emit(
            &self.image,
            &mut self.blocks,
            &self.code_regions,
            &self.data_regions,
        )?;
        imports::resolve(&self.image, &self.blocks, resolver)?;

        self.state = SessionState::Written;
        info!("Image rewritten, entry point at rva {:#x}", self.entry_rva);
        Ok(())
    }

    /// Final address of the original entry point; answers only after a
    /// successful `write`.
    pub fn entry_point(&self) -> Option<u64> {
        if self.state != SessionState::Written {
            return None;
        }
        self.blocks.rva_to_final_address(self.entry_rva)
    }

    pub fn rva_to_final_address(&self, rva: u32) -> Option<u64> {
        self.blocks.rva_to_final_address(rva)
    }

    pub fn code_blocks(&self) -> &[CodeBlock] {
        &self.blocks.code
    }

    pub fn data_blocks(&self) -> &[DataBlock] {
        &self.blocks.data
    }

    pub fn image(&self) -> &Image {
        &self.image
    }
}
