use thiserror::Error;

use crate::decoder::Program;
use crate::instruction::Opcode;

/// Raised when the encoding table fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("row {row} ({opcode}) has no bit fields")]
    EmptyRow { row: usize, opcode: Opcode },
    #[error("row {row} ({opcode}): field at bit {bit} straddles a byte boundary")]
    MisalignedField { row: usize, opcode: Opcode, bit: usize },
    #[error("rows {first} ({first_opcode}) and {second} ({second_opcode}) match the same bit pattern")]
    Ambiguous {
        first: usize,
        first_opcode: Opcode,
        second: usize,
        second_opcode: Opcode,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("no encoding matches {} at address {address:#06x}", bits(.bytes))]
    UnmatchedOpcode { address: u16, bytes: Vec<u8> },
    #[error("{opcode} at address {address:#06x} runs past the end of input: {}", bits(.bytes))]
    TruncatedInstruction {
        address: u16,
        opcode: Opcode,
        bytes: Vec<u8>,
    },
    #[error("invalid {field} field value {value:#b} at address {address:#06x}")]
    InvalidField {
        address: u16,
        field: &'static str,
        value: u8,
    },
    #[error("program of {len} bytes does not fit a 16-bit address space")]
    ProgramTooLarge { len: usize },
    #[error(transparent)]
    Table(#[from] TableError),
}

/// A decode error together with everything decoded before it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct DecodeFailure {
    pub partial: Program,
    #[source]
    pub error: DecodeError,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("{opcode} at ip {ip:#06x} has no execution semantics")]
    UnimplementedOpcode { ip: u16, opcode: Opcode },
    #[error("no decoded instruction starts at ip {ip:#06x}")]
    MissingInstructionAtAddress { ip: u16 },
    #[error("pop from empty stack at ip {ip:#06x} (sp = {sp:#06x})")]
    StackUnderflow { ip: u16, sp: u16 },
    #[error("{opcode} at ip {ip:#06x} is missing operand {slot}")]
    MissingOperand { ip: u16, opcode: Opcode, slot: usize },
    #[error("{opcode} at ip {ip:#06x} writes to an immediate")]
    InvalidDestination { ip: u16, opcode: Opcode },
    #[error("program of {len} bytes does not fit memory of {capacity} bytes")]
    ProgramTooLarge { len: usize, capacity: usize },
}

fn bits(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:08b}"))
        .collect::<Vec<_>>()
        .join(" ")
}
