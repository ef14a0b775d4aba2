use std::collections::HashSet;

use exe::SectionCharacteristics;
use logger::{debug, info, warn};

use crate::{
    block::{BlockKind, Blocks, CodeBlock, DataBlock},
    codec::{self, RelativeKind},
    error::{Result, RewriteError},
    image::Image,
};

/// Ceiling on how much a relative instruction may grow when re-encoded.
pub const RELATIVE_GROWTH_CEILING: usize = 32;

/// Recursive-descent disassembly seeded by the exception directory.
/// Produces the sorted code block list and one data block per
/// non-executable readable section.
pub fn disassemble(image: &Image) -> Result<Blocks> {
    let mut blocks = Blocks::default();
    collect_data_blocks(image, &mut blocks)?;

    let mut worklist = Vec::new();
    for function in image.runtime_functions()? {
        if function.begin_address != function.end_address {
            worklist.push(function.begin_address);
        }
    }
    let seeds = worklist.len();

    let mut visited = HashSet::new();

    while let Some(rva) = worklist.pop() {
        if visited.contains(&rva) || covered(&blocks.code, rva) {
            continue;
        }
        match walk(image, rva, &mut worklist, &mut visited, &mut blocks.code) {
            Ok(()) => {}
            Err(RewriteError::Decode { rva }) => {
                warn!("Abandoned walk at rva {:#x}: invalid instruction", rva);
            }
            Err(error) => return Err(error),
        }
    }

    blocks.sort_and_check()?;

    info!(
        "Disassembled {} code blocks from {} seeds, {} data blocks",
        blocks.code.len(),
        seeds,
        blocks.data.len()
    );

    Ok(blocks)
}

fn collect_data_blocks(image: &Image, blocks: &mut Blocks) -> Result<()> {
    for section in image.sections()? {
        let characteristics = section.characteristics;
        if characteristics.contains(SectionCharacteristics::MEM_EXECUTE) {
            continue;
        }
        if !characteristics.contains(SectionCharacteristics::MEM_READ) {
            continue;
        }
        if section.virtual_size == 0 {
            continue;
        }

        let file_size = section.size_of_raw_data as usize;
        let virtual_size = section.virtual_size as usize;
        let file_offset = section.pointer_to_raw_data.0 as usize;

        if file_offset + file_size.min(virtual_size) > image.len() {
            return Err(RewriteError::Parse(format!(
                "section '{}' raw data is truncated",
                Image::section_name(section)
            )));
        }

        blocks.data.push(DataBlock {
            rva: section.virtual_address.0,
            file_offset,
            file_size,
            virtual_size,
            final_address: None,
        });
    }

    blocks.data.sort_by_key(|block| block.rva);
    Ok(())
}

fn covered(code: &[CodeBlock], rva: u32) -> bool {
    code.iter().any(|block| block.contains(rva))
}

fn close_open(
    code: &mut Vec<CodeBlock>,
    section_offset: usize,
    section_rva: u32,
    open_rva: u32,
    open_size: usize,
) {
    if open_size == 0 {
        return;
    }
    code.push(CodeBlock {
        rva: open_rva,
        file_offset: section_offset + (open_rva - section_rva) as usize,
        size: open_size,
        kind: BlockKind::NonRelative,
        expected_size: open_size,
        final_address: None,
        final_size: 0,
    });
}

/// One linear descent from `start` to the next exit point, already-visited
/// instruction, or end of section. Relative instructions are split out
/// into their own single-instruction blocks as they are met.
fn walk(
    image: &Image,
    start: u32,
    worklist: &mut Vec<u32>,
    visited: &mut HashSet<u32>,
    code: &mut Vec<CodeBlock>,
) -> Result<()> {
    let section = image
        .section_at(start)
        .filter(|section| {
            section
                .characteristics
                .contains(SectionCharacteristics::MEM_EXECUTE)
        })
        .ok_or(RewriteError::Decode { rva: start })?;

    let section_rva = section.virtual_address.0;
    let section_offset = section.pointer_to_raw_data.0 as usize;
    let limit = (section.size_of_raw_data.min(section.virtual_size)) as usize;
    let data = image.read(section_offset, limit)?;

    let mut position = (start - section_rva) as usize;
    let mut rva = start;
    let mut open_rva = start;
    let mut open_size = 0usize;

    debug!("Walking from rva {:#x}", start);

    loop {
        if position >= data.len() || visited.contains(&rva) {
            break;
        }

        let decoded = match codec::decode(&data[position..], rva) {
            Ok(decoded) => decoded,
            Err(error) => {
                close_open(code, section_offset, section_rva, open_rva, open_size);
                return Err(error);
            }
        };
        visited.insert(rva);
        let len = decoded.len();

        let kind = match codec::relative_kind(&decoded.instruction) {
            Ok(kind) => kind,
            Err(error) => {
                close_open(code, section_offset, section_rva, open_rva, open_size);
                return Err(error);
            }
        };

        match kind {
            Some(kind) => {
                if kind == RelativeKind::Branch {
                    let target = codec::target_rva(&decoded.instruction, kind);
                    if !visited.contains(&target) && image.is_executable_rva(target) {
                        worklist.push(target);
                    }
                }
                close_open(code, section_offset, section_rva, open_rva, open_size);
                code.push(CodeBlock {
                    rva,
                    file_offset: section_offset + position,
                    size: len,
                    kind: BlockKind::Relative,
                    expected_size: len + RELATIVE_GROWTH_CEILING,
                    final_address: None,
                    final_size: 0,
                });
                open_rva = rva + len as u32;
                open_size = 0;
            }
            None => {
                open_size += len;
            }
        }

        position += len;
        rva += len as u32;

        if codec::is_exit_point(&decoded.instruction) {
            break;
        }
    }

    close_open(code, section_offset, section_rva, open_rva, open_size);
    Ok(())
}
