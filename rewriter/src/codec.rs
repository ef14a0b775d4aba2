use iced_x86::{
    ConstantOffsets, Decoder, DecoderOptions, Encoder, FlowControl, Instruction, OpKind,
};

use crate::error::{Phase, Result, RewriteError};

const BITNESS: u32 = 64;

/// One decoded instruction plus the byte offsets of its immediate and
/// displacement fields inside the original encoding.
pub struct Decoded {
    pub instruction: Instruction,
    pub offsets: ConstantOffsets,
}

impl Decoded {
    pub fn len(&self) -> usize {
        self.instruction.len()
    }

    pub fn rva(&self) -> u32 {
        self.instruction.ip() as u32
    }
}

/// How an instruction depends on its own address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelativeKind {
    /// Memory operand addressed off RIP.
    MemoryOperand,
    /// CALL/JMP/Jcc with an immediate target.
    Branch,
}

pub fn decode(bytes: &[u8], rva: u32) -> Result<Decoded> {
    let mut decoder = Decoder::with_ip(BITNESS, bytes, rva as u64, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    decoder.decode_out(&mut instruction);

    if instruction.is_invalid() {
        return Err(RewriteError::Decode { rva });
    }

    let offsets = decoder.get_constant_offsets(&instruction);
    Ok(Decoded {
        instruction,
        offsets,
    })
}

pub fn is_near_branch(instruction: &Instruction) -> bool {
    matches!(
        instruction.flow_control(),
        FlowControl::Call | FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch
    ) && matches!(
        instruction.op0_kind(),
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
    )
}

/// An instruction cannot carry both a RIP-relative memory operand and a
/// relative branch immediate; such a decode is rejected.
pub fn relative_kind(instruction: &Instruction) -> Result<Option<RelativeKind>> {
    match (
        instruction.is_ip_rel_memory_operand(),
        is_near_branch(instruction),
    ) {
        (true, true) => Err(RewriteError::Decode {
            rva: instruction.ip() as u32,
        }),
        (true, false) => Ok(Some(RelativeKind::MemoryOperand)),
        (false, true) => Ok(Some(RelativeKind::Branch)),
        (false, false) => Ok(None),
    }
}

pub fn target_rva(instruction: &Instruction, kind: RelativeKind) -> u32 {
    match kind {
        RelativeKind::MemoryOperand => instruction.ip_rel_memory_address() as u32,
        RelativeKind::Branch => instruction.near_branch_target() as u32,
    }
}

/// Control never falls through these; a descent walk ends here.
pub fn is_exit_point(instruction: &Instruction) -> bool {
    matches!(
        instruction.flow_control(),
        FlowControl::Return
            | FlowControl::Interrupt
            | FlowControl::Exception
            | FlowControl::UnconditionalBranch
            | FlowControl::IndirectBranch
    )
}

#[derive(Debug)]
pub struct EncodedBranch {
    pub bytes: Vec<u8>,
    pub len: usize,
    /// Width of the displacement immediate, 1 or 4 bytes.
    pub operand_size: usize,
}

fn fits_rel8(value: i64) -> bool {
    value.abs() <= i8::MAX as i64
}

fn fits_rel32(value: i64) -> bool {
    value.abs() <= i32::MAX as i64
}

/// Re-encode a relative branch for a new location. `delta` is the distance
/// from the start of the re-encoded instruction to its target. Tries the
/// rel8 form first, then the rel32 forms, and checks the encoder against
/// the length each form implies.
pub fn reencode_branch(decoded: &Decoded, delta: i64, new_ip: u64) -> Result<EncodedBranch> {
    let original = &decoded.instruction;
    let rva = decoded.rva();

    // Opcode + immediate length of the original form; whatever remains of
    // the instruction is prefix bytes, and those survive re-encoding.
    let base = if original.is_jcc_short() || original.is_jmp_short() {
        2
    } else if original.is_jcc_near() {
        6
    } else {
        5
    };
    let prefixes = original.len().saturating_sub(base);

    let is_call = original.flow_control() == FlowControl::Call;
    let is_conditional = original.flow_control() == FlowControl::ConditionalBranch;
    // LOOPcc/JCXZ only exist as rel8.
    let short_only = is_conditional && !original.is_jcc_short_or_near();

    let mut request = *original;
    let (predicted, operand_size) = if !is_call && fits_rel8(delta - (prefixes + 2) as i64) {
        if !short_only {
            request.as_short_branch();
        }
        (prefixes + 2, 1)
    } else if short_only {
        return Err(RewriteError::DisplacementOverflow {
            rva,
            delta,
            width: 1,
            phase: Phase::Emit,
        });
    } else if !is_conditional && fits_rel32(delta - (prefixes + 5) as i64) {
        request.as_near_branch();
        (prefixes + 5, 4)
    } else if is_conditional && fits_rel32(delta - (prefixes + 6) as i64) {
        request.as_near_branch();
        (prefixes + 6, 4)
    } else {
        return Err(RewriteError::DisplacementOverflow {
            rva,
            delta,
            width: 4,
            phase: Phase::Emit,
        });
    };

    request.set_near_branch64(new_ip.wrapping_add(delta as u64));

    let mut encoder = Encoder::new(BITNESS);
    let len = encoder
        .encode(&request, new_ip)
        .map_err(|_| RewriteError::DisplacementOverflow {
            rva,
            delta,
            width: operand_size,
            phase: Phase::Emit,
        })?;

    if len != predicted {
        return Err(RewriteError::EncoderMismatch {
            rva,
            predicted,
            actual: len,
        });
    }

    Ok(EncodedBranch {
        bytes: encoder.take_buffer(),
        len,
        operand_size,
    })
}
