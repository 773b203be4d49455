//! Cycle estimates based on the 8086 user's manual timing tables.
//!
//! Estimates are data dependent: a word transfer to an odd address costs an
//! extra bus cycle per transfer, so the same instruction can cost differently
//! depending on register contents when it runs.

use std::fmt;

use crate::instruction::{
    DecodedInstruction, EffectiveAddress, EffectiveAddressExpression, Opcode, Operand, Width,
};
use crate::state::MachineState;

/// Cycle estimate broken down into its parts.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct CycleEstimate {
    pub base: u32,
    /// Effective address calculation.
    pub ea: u32,
    /// Odd-address word transfer penalty.
    pub penalty: u32,
}

impl CycleEstimate {
    pub fn total(&self) -> u32 {
        self.base + self.ea + self.penalty
    }
}

impl fmt::Display for CycleEstimate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.total())?;
        if self.ea > 0 || self.penalty > 0 {
            write!(f, " ({}", self.base)?;
            if self.ea > 0 {
                write!(f, " + {}ea", self.ea)?;
            }
            if self.penalty > 0 {
                write!(f, " + {}p", self.penalty)?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// Effective address calculation clocks (8086 manual, table 2-20).
pub fn ea_cycles(ea: &EffectiveAddress) -> u32 {
    use EffectiveAddressExpression::*;

    match (ea.expression, ea.has_displacement()) {
        (DirectAddress, _) => 6,
        (Bx | Bp | Si | Di, false) => 5,
        (Bx | Bp | Si | Di, true) => 9,
        (BpDi | BxSi, false) => 7,
        (BpSi | BxDi, false) => 8,
        (BpDi | BxSi, true) => 11,
        (BpSi | BxDi, true) => 12,
    }
}

/// Extra clocks for word transfers to an odd address, resolved against the
/// current register values.
pub fn transfer_penalty(state: &MachineState, ea: &EffectiveAddress, transfers: u32) -> u32 {
    if ea.width == Width::Word && ea.resolve(&state.registers) % 2 != 0 {
        4 * transfers
    } else {
        0
    }
}

/// Operand kinds the timing tables distinguish.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum Kind {
    None,
    Register,
    Memory,
    Immediate,
}

impl Kind {
    fn of(operand: &Option<Operand>) -> Self {
        match operand {
            None => Kind::None,
            Some(Operand::Register(_)) => Kind::Register,
            Some(Operand::Memory(_)) => Kind::Memory,
            Some(Operand::Immediate(_)) => Kind::Immediate,
        }
    }
}

/// `mov` between the accumulator and a direct address encoded as A0-A3.
/// The same transfer through the mod/rm form is charged like any other load.
fn is_accumulator_move(instruction: &DecodedInstruction) -> bool {
    instruction.opcode == Opcode::Mov
        && instruction.bytes.first().is_some_and(|byte| byte & 0xfc == 0xa0)
}

/// How an instruction form is charged: base clocks, memory transfers, and
/// whether the effective address calculation is added.
#[derive(Debug, Copy, Clone)]
struct Timing {
    base: u32,
    transfers: u32,
    with_ea: bool,
}

impl Timing {
    const fn flat(base: u32) -> Self {
        Self {
            base,
            transfers: 0,
            with_ea: false,
        }
    }

    const fn memory(base: u32, transfers: u32) -> Self {
        Self {
            base,
            transfers,
            with_ea: true,
        }
    }
}

fn branch(taken: bool, when_taken: u32, otherwise: u32) -> Timing {
    Timing::flat(if taken { when_taken } else { otherwise })
}

fn timing(instruction: &DecodedInstruction, branch_taken: bool) -> Option<Timing> {
    let dest = Kind::of(&instruction.operands[0]);
    let src = Kind::of(&instruction.operands[1]);

    let timing = match instruction.opcode {
        Opcode::Mov if is_accumulator_move(instruction) => Timing {
            base: 10,
            transfers: 1,
            with_ea: false,
        },
        Opcode::Mov => match (dest, src) {
            (Kind::Register, Kind::Register) => Timing::flat(2),
            (Kind::Register, Kind::Memory) => Timing::memory(8, 1),
            (Kind::Memory, Kind::Register) => Timing::memory(9, 1),
            (Kind::Register, Kind::Immediate) => Timing::flat(4),
            (Kind::Memory, Kind::Immediate) => Timing::memory(10, 1),
            _ => return None,
        },
        Opcode::Add | Opcode::Sub => match (dest, src) {
            (Kind::Register, Kind::Register) => Timing::flat(3),
            (Kind::Register, Kind::Memory) => Timing::memory(9, 1),
            (Kind::Memory, Kind::Register) => Timing::memory(16, 2),
            (Kind::Register, Kind::Immediate) => Timing::flat(4),
            (Kind::Memory, Kind::Immediate) => Timing::memory(17, 2),
            _ => return None,
        },
        Opcode::Cmp => match (dest, src) {
            (Kind::Register, Kind::Register) => Timing::flat(3),
            (Kind::Register, Kind::Memory) | (Kind::Memory, Kind::Register) => {
                Timing::memory(9, 1)
            }
            (Kind::Register, Kind::Immediate) => Timing::flat(4),
            (Kind::Memory, Kind::Immediate) => Timing::memory(10, 1),
            _ => return None,
        },
        Opcode::Loop => branch(branch_taken, 17, 5),
        Opcode::Loopz => branch(branch_taken, 18, 6),
        Opcode::Loopnz => branch(branch_taken, 19, 5),
        Opcode::Jcxz => branch(branch_taken, 18, 6),
        op if op.is_conditional_jump() => branch(branch_taken, 16, 4),
        Opcode::Jmp => Timing::flat(15),
        Opcode::Push if dest == Kind::Register => Timing::flat(11),
        Opcode::Push if dest == Kind::Memory => Timing::memory(16, 2),
        Opcode::Pop if dest == Kind::Register => Timing::flat(8),
        Opcode::Pop if dest == Kind::Memory => Timing::memory(17, 2),
        Opcode::Call if instruction.size > 2 => Timing::flat(28),
        Opcode::Call => Timing::flat(19),
        Opcode::Ret => Timing::flat(8),
        _ => return None,
    };
    Some(timing)
}

/// Estimates the clocks `instruction` takes given the current machine state.
/// Forms missing from the timing tables estimate to zero.
pub fn estimate(
    state: &MachineState,
    instruction: &DecodedInstruction,
    branch_taken: bool,
) -> CycleEstimate {
    let Some(timing) = timing(instruction, branch_taken) else {
        tracing::warn!(
            address = instruction.address,
            "no cycle timing for {instruction}"
        );
        return CycleEstimate::default();
    };

    let mut estimate = CycleEstimate {
        base: timing.base,
        ..CycleEstimate::default()
    };
    if let Some(ea) = instruction.memory_operand() {
        if timing.with_ea {
            estimate.ea = ea_cycles(ea);
        }
        estimate.penalty = transfer_penalty(state, ea, timing.transfers);
    }
    estimate
}

pub fn estimate_cycles(
    state: &MachineState,
    instruction: &DecodedInstruction,
    branch_taken: bool,
) -> u32 {
    estimate(state, instruction, branch_taken).total()
}
