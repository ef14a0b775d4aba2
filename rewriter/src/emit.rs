use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    ptr,
};

use logger::{debug, info};

use crate::{
    block::{BlockKind, Blocks, CodeBlock},
    codec::{self, RelativeKind},
    error::{Phase, Result, RewriteError},
    image::Image,
};

/// Bytes reserved at the tail of every code region (except the last) for
/// the jump that chains fall-through into the next region.
pub const REGION_JUMP_SLOT: usize = 5;

const DATA_ALIGN: u64 = 16;

/// A caller-owned range of target memory. The rewriter writes through the
/// pointer but never allocates or frees; the region must stay valid and
/// fixed for the whole session.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub base: *mut u8,
    pub size: usize,
}

impl MemoryRegion {
    pub fn new(base: *mut u8, size: usize) -> Self {
        Self { base, size }
    }
}

/// A deferred displacement patch for a target that had not been emitted
/// yet when its instruction was written. Ordered by target RVA so a
/// min-heap pops them in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Fixup {
    target_rva: u32,
    /// Start of the already-written instruction in target memory.
    address: u64,
    patch_offset: usize,
    width: usize,
    instruction_len: usize,
    source_rva: u32,
}

struct RegionWriter {
    regions: Vec<MemoryRegion>,
    index: usize,
    offset: usize,
}

impl RegionWriter {
    fn new(regions: &[MemoryRegion]) -> Self {
        Self {
            regions: regions.to_vec(),
            index: 0,
            offset: 0,
        }
    }

    fn address(&self) -> u64 {
        self.regions[self.index].base as u64 + self.offset as u64
    }

    fn usable(&self) -> usize {
        let region = &self.regions[self.index];
        if self.index + 1 < self.regions.len() {
            region.size.saturating_sub(REGION_JUMP_SLOT)
        } else {
            region.size
        }
    }

    fn write(&mut self, bytes: &[u8]) -> bool {
        if self.offset + bytes.len() > self.usable() {
            return false;
        }
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.regions[self.index].base.add(self.offset),
                bytes.len(),
            );
        }
        self.offset += bytes.len();
        true
    }

    /// Close the current region with a near jump into the next one so that
    /// fall-through keeps working, then move the cursor. The jump lands in
    /// the reserved tail slot.
    fn advance(&mut self) -> Result<bool> {
        if self.index + 1 >= self.regions.len() {
            return Ok(false);
        }

        let region = self.regions[self.index];
        if self.offset + REGION_JUMP_SLOT > region.size {
            return Err(RewriteError::CapacityExhausted {
                region: self.index,
                needed: REGION_JUMP_SLOT,
            });
        }

        let next = self.regions[self.index + 1];
        let displacement = (next.base as u64)
            .wrapping_sub(self.address() + REGION_JUMP_SLOT as u64) as i64;
        let displacement = i32::try_from(displacement).map_err(|_| {
            RewriteError::RegionSpanTooFar {
                region: self.index,
                next: self.index + 1,
            }
        })?;

        let mut jump = [0u8; REGION_JUMP_SLOT];
        jump[0] = 0xE9;
        jump[1..].copy_from_slice(&displacement.to_le_bytes());
        unsafe {
            ptr::copy_nonoverlapping(
                jump.as_ptr(),
                region.base.add(self.offset),
                REGION_JUMP_SLOT,
            );
        }

        debug!(
            "Region {} closed at offset {:#x}, chaining to region {}",
            self.index,
            self.offset,
            self.index + 1
        );

        self.index += 1;
        self.offset = 0;
        Ok(true)
    }

    /// Advance regions until `len` bytes fit, then return the write
    /// address. Needed before encoding anything whose bytes depend on the
    /// address they land at.
    fn ensure(&mut self, len: usize) -> Result<u64> {
        while self.offset + len > self.usable() {
            if !self.advance()? {
                return Err(RewriteError::CapacityExhausted {
                    region: self.index,
                    needed: len,
                });
            }
        }
        Ok(self.address())
    }

    fn force_write(&mut self, bytes: &[u8]) -> Result<u64> {
        let address = self.ensure(bytes.len())?;
        self.write(bytes);
        Ok(address)
    }
}

/// Stream every block into the caller's regions: data first (code needs
/// final data addresses), then code in ascending RVA order, patching
/// forward references as their targets materialize.
pub fn emit(
    image: &Image,
    blocks: &mut Blocks,
    code_regions: &[MemoryRegion],
    data_regions: &[MemoryRegion],
) -> Result<()> {
    emit_data(image, blocks, data_regions)?;

    if blocks.code.is_empty() {
        return Ok(());
    }
    if code_regions.is_empty() {
        return Err(RewriteError::CapacityExhausted {
            region: 0,
            needed: blocks.code[0].expected_size,
        });
    }

    let mut writer = RegionWriter::new(code_regions);
    let mut fixups: BinaryHeap<Reverse<Fixup>> = BinaryHeap::new();

    for index in 0..blocks.code.len() {
        match blocks.code[index].kind {
            BlockKind::NonRelative => {
                let block = &blocks.code[index];
                let bytes = image.read(block.file_offset, block.size)?;
                let address = writer.force_write(bytes)?;
                let block = &mut blocks.code[index];
                block.final_address = Some(address);
                block.final_size = block.size;
            }
            BlockKind::Relative => {
                emit_relative(image, blocks, index, &mut writer, &mut fixups)?;
            }
        }
        drain_fixups(&mut fixups, &blocks.code[index])?;
    }

    // every forward reference must have been patched by now
    if let Some(Reverse(fixup)) = fixups.peek() {
        return Err(RewriteError::UnresolvableTarget {
            rva: fixup.source_rva,
            target: fixup.target_rva,
        });
    }

    let emitted: usize = blocks.code.iter().map(|block| block.final_size).sum();
    info!(
        "Emitted {} code blocks ({} bytes) into {} region(s)",
        blocks.code.len(),
        emitted,
        code_regions.len()
    );

    Ok(())
}

fn emit_data(image: &Image, blocks: &mut Blocks, regions: &[MemoryRegion]) -> Result<()> {
    if blocks.data.is_empty() {
        return Ok(());
    }

    let mut region = 0usize;
    let mut offset = 0usize;
    let mut emitted = 0usize;

    for block in &mut blocks.data {
        // place the whole block, 16-byte aligned; a block never spans regions
        let address = loop {
            if region >= regions.len() {
                return Err(RewriteError::CapacityExhausted {
                    region: regions.len().saturating_sub(1),
                    needed: block.virtual_size,
                });
            }
            let cursor = regions[region].base as u64 + offset as u64;
            let aligned = (cursor + DATA_ALIGN - 1) & !(DATA_ALIGN - 1);
            let padding = (aligned - cursor) as usize;
            if offset + padding + block.virtual_size <= regions[region].size {
                offset += padding;
                break aligned;
            }
            region += 1;
            offset = 0;
        };

        let present = block.file_size.min(block.virtual_size);
        let source = if present > 0 {
            image.read(block.file_offset, present)?
        } else {
            &[]
        };

        unsafe {
            ptr::write_bytes(address as *mut u8, 0, block.virtual_size);
            if !source.is_empty() {
                ptr::copy_nonoverlapping(source.as_ptr(), address as *mut u8, source.len());
            }
        }

        block.final_address = Some(address);
        offset += block.virtual_size;
        emitted += block.virtual_size;
    }

    info!(
        "Emitted {} data blocks ({} bytes) into {} region(s)",
        blocks.data.len(),
        emitted,
        regions.len()
    );

    Ok(())
}

fn emit_relative(
    image: &Image,
    blocks: &mut Blocks,
    index: usize,
    writer: &mut RegionWriter,
    fixups: &mut BinaryHeap<Reverse<Fixup>>,
) -> Result<()> {
    let block = blocks.code[index].clone();
    let bytes = image.read(block.file_offset, block.size)?.to_vec();

    let decoded = codec::decode(&bytes, block.rva)?;
    if decoded.len() != block.size {
        return Err(RewriteError::Decode { rva: block.rva });
    }
    let kind = codec::relative_kind(&decoded.instruction)?
        .ok_or(RewriteError::Decode { rva: block.rva })?;

    // reserve the worst case first so the address cannot move afterwards
    let address = writer.ensure(block.expected_size)?;

    let target = codec::target_rva(&decoded.instruction, kind);
    let (delta, resolved) = adjusted_target_delta(blocks, index, target, address)?;

    let (out, final_size, fixup) = match kind {
        RelativeKind::MemoryOperand => {
            if decoded.offsets.displacement_size() != 4 {
                return Err(RewriteError::Decode { rva: block.rva });
            }
            let disp_offset = decoded.offsets.displacement_offset();
            // the stored displacement is measured from the instruction end
            let displacement = delta - block.size as i64;
            let displacement = i32::try_from(displacement).map_err(|_| {
                RewriteError::DisplacementOverflow {
                    rva: block.rva,
                    delta: displacement,
                    width: 4,
                    phase: Phase::Emit,
                }
            })?;

            let mut out = bytes.clone();
            if resolved {
                out[disp_offset..disp_offset + 4]
                    .copy_from_slice(&displacement.to_le_bytes());
                (out, block.size, None)
            } else {
                // bytes go out unchanged, the real displacement is patched in later
                let fixup = Fixup {
                    target_rva: target,
                    address,
                    patch_offset: disp_offset,
                    width: 4,
                    instruction_len: block.size,
                    source_rva: block.rva,
                };
                (out, block.size, Some(fixup))
            }
        }
        RelativeKind::Branch => {
            let encoded = codec::reencode_branch(&decoded, delta, address)?;
            let fixup = (!resolved).then(|| Fixup {
                target_rva: target,
                address,
                patch_offset: encoded.len - encoded.operand_size,
                width: encoded.operand_size,
                instruction_len: encoded.len,
                source_rva: block.rva,
            });
            let len = encoded.len;
            (encoded.bytes, len, fixup)
        }
    };

    debug_assert!(final_size <= block.expected_size);
    writer.write(&out[..final_size]);

    if let Some(fixup) = fixup {
        fixups.push(Reverse(fixup));
    }

    let block = &mut blocks.code[index];
    block.final_address = Some(address);
    block.final_size = final_size;
    Ok(())
}

/// Distance from `write_address` to where `target_rva` will live.
///
/// Data targets and backward code targets are exact. Forward code targets
/// cannot be known yet, so the worst-case distance (every intervening
/// block at its `expected_size`) is returned and the caller must queue a
/// fixup; the second element of the pair says which case applied.
fn adjusted_target_delta(
    blocks: &Blocks,
    index: usize,
    target_rva: u32,
    write_address: u64,
) -> Result<(i64, bool)> {
    let current = &blocks.code[index];

    if let Some(block) = blocks.data_block_at(target_rva) {
        let base = block.final_address.ok_or(RewriteError::UnresolvableTarget {
            rva: current.rva,
            target: target_rva,
        })?;
        let target_address = base + (target_rva - block.rva) as u64;
        return Ok((target_address.wrapping_sub(write_address) as i64, true));
    }

    if target_rva < current.rva {
        for block in blocks.code[..index].iter().rev() {
            if !block.contains(target_rva) {
                continue;
            }
            if block.kind == BlockKind::Relative && target_rva != block.rva {
                // mid-instruction landing inside a re-encoded block
                return Err(RewriteError::UnresolvableTarget {
                    rva: current.rva,
                    target: target_rva,
                });
            }
            let base = block.final_address.ok_or(RewriteError::UnresolvableTarget {
                rva: current.rva,
                target: target_rva,
            })?;
            let target_address = base + (target_rva - block.rva) as u64;
            return Ok((target_address.wrapping_sub(write_address) as i64, true));
        }
        return Err(RewriteError::UnresolvableTarget {
            rva: current.rva,
            target: target_rva,
        });
    }

    let mut delta = 0i64;
    for block in &blocks.code[index..] {
        delta += block.expected_size as i64;
        if block.contains(target_rva) {
            return Ok((delta, false));
        }
    }

    Err(RewriteError::UnresolvableTarget {
        rva: current.rva,
        target: target_rva,
    })
}

/// Pop and patch every fixup whose target lives in the block that was just
/// emitted.
fn drain_fixups(fixups: &mut BinaryHeap<Reverse<Fixup>>, block: &CodeBlock) -> Result<()> {
    let end = block.end();

    while let Some(&Reverse(peek)) = fixups.peek() {
        if peek.target_rva >= end {
            break;
        }
        fixups.pop();
        let fixup = peek;

        if fixup.target_rva < block.rva {
            return Err(RewriteError::UnresolvableTarget {
                rva: fixup.source_rva,
                target: fixup.target_rva,
            });
        }
        if block.kind == BlockKind::Relative && fixup.target_rva != block.rva {
            return Err(RewriteError::UnresolvableTarget {
                rva: fixup.source_rva,
                target: fixup.target_rva,
            });
        }

        let base = block.final_address.ok_or(RewriteError::UnresolvableTarget {
            rva: fixup.source_rva,
            target: fixup.target_rva,
        })?;
        let target_address = base + (fixup.target_rva - block.rva) as u64;
        let delta = target_address
            .wrapping_sub(fixup.address + fixup.instruction_len as u64) as i64;

        patch(&fixup, delta)?;
    }

    Ok(())
}

fn patch(fixup: &Fixup, delta: i64) -> Result<()> {
    let destination = (fixup.address + fixup.patch_offset as u64) as *mut u8;
    match fixup.width {
        1 => {
            let value = i8::try_from(delta).map_err(|_| RewriteError::DisplacementOverflow {
                rva: fixup.source_rva,
                delta,
                width: 1,
                phase: Phase::Fixup,
            })?;
            unsafe { destination.write(value as u8) };
        }
        _ => {
            let value = i32::try_from(delta).map_err(|_| RewriteError::DisplacementOverflow {
                rva: fixup.source_rva,
                delta,
                width: 4,
                phase: Phase::Fixup,
            })?;
            unsafe {
                ptr::copy_nonoverlapping(value.to_le_bytes().as_ptr(), destination, 4);
            }
        }
    }
    Ok(())
}
