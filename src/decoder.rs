use std::collections::BTreeMap;

use crate::error::{DecodeError, DecodeFailure};
use crate::instruction::{
    DecodedInstruction, EffectiveAddress, EffectiveAddressExpression, InstructionFlags, Opcode,
    Operand, RegisterAccess, Width,
};
use crate::table::{EncodingRow, EncodingTable, FieldTag};

/// How many bytes an unmatched-opcode error reports.
const ERROR_CONTEXT_BYTES: usize = 6;

/// Decoded instructions keyed by the address they start at.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Program {
    instructions: BTreeMap<u16, DecodedInstruction>,
    len: usize,
}

impl Program {
    pub fn get(&self, address: u16) -> Option<&DecodedInstruction> {
        self.instructions.get(&address)
    }

    /// Instructions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &DecodedInstruction> {
        self.instructions.values()
    }

    /// Number of decoded instructions.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Number of bytes covered by the decoded instructions.
    pub fn byte_len(&self) -> usize {
        self.len
    }

    fn insert(&mut self, instruction: DecodedInstruction) {
        self.len += instruction.size as usize;
        self.instructions.insert(instruction.address, instruction);
    }
}

/// Bits of the current byte not yet consumed by a row, most significant first.
struct BitWindow {
    value: u8,
    remaining: u8,
}

impl BitWindow {
    fn new(byte: u8) -> Self {
        Self {
            value: byte,
            remaining: 8,
        }
    }

    fn peek(&self, bits: u8) -> u8 {
        if bits == 0 {
            0
        } else {
            self.value >> (8 - bits)
        }
    }

    fn consume(&mut self, bits: u8) {
        self.value = if bits >= 8 { 0 } else { self.value << bits };
        self.remaining = self.remaining.saturating_sub(bits);
    }
}

/// Field values captured while matching a row.
#[derive(Debug, Default)]
struct Fields {
    d: Option<u8>,
    w: Option<u8>,
    s: Option<u8>,
    mode: Option<u8>,
    reg: Option<u8>,
    rm: Option<u8>,
    has_data: bool,
    is_jump: bool,
}

impl Fields {
    fn set(&mut self, tag: FieldTag, value: u8) {
        match tag {
            FieldTag::D => self.d = Some(value),
            FieldTag::W => self.w = Some(value),
            FieldTag::S => self.s = Some(value),
            FieldTag::Mod => self.mode = Some(value),
            FieldTag::Reg => self.reg = Some(value),
            FieldTag::Rm => self.rm = Some(value),
            FieldTag::Data => self.has_data = true,
            FieldTag::IsJump => self.is_jump = true,
            FieldTag::Literal => {}
        }
    }
}

/// Outcome of matching one row against the input.
enum RowMatch {
    Mismatch,
    /// Every literal seen so far matched but the input ended inside the row.
    Incomplete(Vec<u8>),
    Decoded(DecodedInstruction),
}

/// Reads bytes for one instruction and remembers everything it consumed.
struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    consumed: Vec<u8>,
}

impl<'a> ByteCursor<'a> {
    fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self {
            bytes,
            pos,
            consumed: Vec::with_capacity(6),
        }
    }

    fn read_u8(&mut self) -> Option<u8> {
        let byte = *self.bytes.get(self.pos)?;
        self.pos += 1;
        self.consumed.push(byte);
        Some(byte)
    }

    fn read_u16_le(&mut self) -> Option<u16> {
        let low = self.read_u8()? as u16;
        let high = self.read_u8()? as u16;
        Some(low | (high << 8))
    }
}

pub struct Decoder<'a> {
    table: &'a EncodingTable,
    bytes: &'a [u8],
    pub pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(table: &'a EncodingTable, bytes: &'a [u8]) -> Self {
        Self {
            table,
            bytes,
            pos: 0,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decodes from the current position to the end of input.
    pub fn decode_all(mut self) -> Result<Program, DecodeFailure> {
        let mut program = Program::default();
        if self.bytes.len() > u16::MAX as usize + 1 {
            return Err(DecodeFailure {
                partial: program,
                error: DecodeError::ProgramTooLarge {
                    len: self.bytes.len(),
                },
            });
        }

        while !self.is_eof() {
            match self.decode_next_instruction() {
                Ok(instruction) => program.insert(instruction),
                Err(error) => {
                    tracing::debug!(decoded = program.len(), "decoding stopped: {error}");
                    return Err(DecodeFailure {
                        partial: program,
                        error,
                    });
                }
            }
        }
        Ok(program)
    }

    /// Decodes one instruction at `pos` and advances past it.
    pub fn decode_next_instruction(&mut self) -> Result<DecodedInstruction, DecodeError> {
        let address = self.pos as u16;
        let mut truncated = None;
        for row in self.table.rows() {
            match self.try_row(row, address)? {
                RowMatch::Decoded(instruction) => {
                    self.pos += instruction.size as usize;
                    tracing::trace!(address, size = instruction.size, "decoded {instruction}");
                    return Ok(instruction);
                }
                RowMatch::Incomplete(bytes) => {
                    truncated.get_or_insert(DecodeError::TruncatedInstruction {
                        address,
                        opcode: row.opcode,
                        bytes,
                    });
                }
                RowMatch::Mismatch => {}
            }
        }

        if let Some(error) = truncated {
            return Err(error);
        }
        let end = (self.pos + ERROR_CONTEXT_BYTES).min(self.bytes.len());
        Err(DecodeError::UnmatchedOpcode {
            address,
            bytes: self.bytes[self.pos..end].to_vec(),
        })
    }

    /// Matches `row` at `address`.
    fn try_row(&self, row: &EncodingRow, address: u16) -> Result<RowMatch, DecodeError> {
        let mut cursor = ByteCursor::new(self.bytes, address as usize);
        let Some(first) = cursor.read_u8() else {
            return Ok(RowMatch::Mismatch);
        };
        let mut window = BitWindow::new(first);
        let mut fields = Fields::default();
        let mut matched_literal = false;

        for spec in &row.fields {
            if spec.bits > 0 && window.remaining == 0 {
                match cursor.read_u8() {
                    Some(byte) => window = BitWindow::new(byte),
                    None if matched_literal => return Ok(RowMatch::Incomplete(cursor.consumed)),
                    None => return Ok(RowMatch::Mismatch),
                }
            }

            let bits = window.peek(spec.bits);
            if spec.tag == FieldTag::Literal {
                if bits != spec.value {
                    return Ok(RowMatch::Mismatch);
                }
                matched_literal = true;
            } else {
                fields.set(spec.tag, if spec.forced { spec.value } else { bits });
            }
            window.consume(spec.bits);
        }

        let instruction = self.build(row.opcode, address, fields, &mut cursor)?;
        Ok(RowMatch::Decoded(instruction))
    }

    /// Reads displacement and data bytes and lays out the operands.
    fn build(
        &self,
        opcode: Opcode,
        address: u16,
        fields: Fields,
        cursor: &mut ByteCursor<'_>,
    ) -> Result<DecodedInstruction, DecodeError> {
        let truncated = |cursor: &ByteCursor<'_>| DecodeError::TruncatedInstruction {
            address,
            opcode,
            bytes: cursor.consumed.clone(),
        };

        let w = fields.w == Some(1);
        let sign_extend = fields.s == Some(1);
        let direct_address = fields.mode == Some(0b00) && fields.rm == Some(0b110);

        let displacement = match fields.mode {
            Some(0b01) => Some(cursor.read_u8().ok_or_else(|| truncated(cursor))? as i8 as i32),
            Some(0b10) => Some(cursor.read_u16_le().ok_or_else(|| truncated(cursor))? as i16 as i32),
            Some(0b00) if direct_address => {
                Some(cursor.read_u16_le().ok_or_else(|| truncated(cursor))? as i32)
            }
            _ => None,
        };

        let data = if !fields.has_data {
            None
        } else if w && !sign_extend {
            Some(cursor.read_u16_le().ok_or_else(|| truncated(cursor))? as i16 as i32)
        } else {
            Some(cursor.read_u8().ok_or_else(|| truncated(cursor))? as i8 as i32)
        };

        let register = |field: &'static str, value: u8| {
            RegisterAccess::from_field(value, w)
                .map(Operand::Register)
                .ok_or(DecodeError::InvalidField {
                    address,
                    field,
                    value,
                })
        };

        let mut operands = [None, None];
        let (reg_slot, rm_slot) = if fields.d == Some(1) { (0, 1) } else { (1, 0) };

        if let Some(reg) = fields.reg {
            operands[reg_slot] = Some(register("reg", reg)?);
        }
        if let Some(mode) = fields.mode {
            let rm = fields.rm.unwrap_or(0);
            operands[rm_slot] = Some(if mode == 0b11 {
                register("rm", rm)?
            } else {
                let expression = if direct_address {
                    EffectiveAddressExpression::DirectAddress
                } else {
                    EffectiveAddressExpression::try_from(rm).map_err(|_| DecodeError::InvalidField {
                        address,
                        field: "rm",
                        value: rm,
                    })?
                };
                Operand::Memory(EffectiveAddress {
                    expression,
                    displacement: displacement.unwrap_or(0),
                    width: Width::from_w(w),
                })
            });
        }
        if let Some(value) = data {
            operands[1] = Some(Operand::Immediate(value));
        }

        let mut flags = InstructionFlags::empty();
        flags.set(InstructionFlags::WIDE, w);
        flags.set(InstructionFlags::IS_JUMP, fields.is_jump);

        let bytes = std::mem::take(&mut cursor.consumed);
        Ok(DecodedInstruction {
            address,
            size: bytes.len() as u16,
            bytes,
            opcode,
            operands,
            flags,
        })
    }
}

/// Decodes `bytes` with the standard encoding table.
pub fn decode_all(bytes: &[u8]) -> Result<Program, DecodeFailure> {
    let table = EncodingTable::standard().map_err(|error| DecodeFailure {
        partial: Program::default(),
        error: error.into(),
    })?;
    Decoder::new(&table, bytes).decode_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Register;

    fn decode_one(bytes: &[u8]) -> DecodedInstruction {
        let program = decode_all(bytes).unwrap();
        assert_eq!(program.len(), 1, "expected a single instruction");
        program.get(0).unwrap().clone()
    }

    fn text(bytes: &[u8]) -> String {
        decode_one(bytes).to_string()
    }

    #[test]
    fn test_register_to_register_mov() {
        let instruction = decode_one(&[0x89, 0xd9]);
        assert_eq!(instruction.to_string(), "mov cx, bx");
        assert_eq!(instruction.size, 2);
        assert_eq!(instruction.bytes, vec![0x89, 0xd9]);
        assert!(instruction.is_wide());
        assert!(!instruction.is_jump());
        assert_eq!(
            instruction.operands,
            [
                Some(Operand::Register(Register::C.word())),
                Some(Operand::Register(Register::B.word())),
            ]
        );
    }

    #[test]
    fn test_immediate_to_register_mov() {
        let instruction = decode_one(&[0xbb, 0x0a, 0x00]);
        assert_eq!(instruction.to_string(), "mov bx, 10");
        assert_eq!(instruction.size, 3);
        assert_eq!(text(&[0xb1, 0xf4]), "mov cl, -12");
        assert_eq!(text(&[0xba, 0x6c, 0x0f]), "mov dx, 3948");
    }

    #[test]
    fn test_memory_operands() {
        assert_eq!(text(&[0x8a, 0x00]), "mov al, [bx + si]");
        assert_eq!(text(&[0x8b, 0x56, 0x00]), "mov dx, [bp]");
        assert_eq!(text(&[0x8a, 0x60, 0x04]), "mov ah, [bx + si + 4]");
        assert_eq!(text(&[0x8a, 0x80, 0x87, 0x13]), "mov al, [bx + si + 4999]");
        assert_eq!(text(&[0x89, 0x09]), "mov [bx + di], cx");
        assert_eq!(text(&[0x8b, 0x41, 0xdb]), "mov ax, [bx + di - 37]");
        assert_eq!(text(&[0x89, 0x8c, 0xd4, 0xfe]), "mov [si - 300], cx");
        assert_eq!(text(&[0x8b, 0x2e, 0x05, 0x00]), "mov bp, [5]");
    }

    #[test]
    fn test_immediate_to_memory_uses_width_keyword() {
        assert_eq!(text(&[0xc6, 0x03, 0x07]), "mov byte [bp + di], 7");
        assert_eq!(
            text(&[0xc7, 0x85, 0x85, 0x03, 0x5b, 0x01]),
            "mov word [di + 901], 347"
        );
    }

    #[test]
    fn test_accumulator_direct_address() {
        assert_eq!(text(&[0xa1, 0xfb, 0x09]), "mov ax, [2555]");
        assert_eq!(text(&[0xa3, 0x0f, 0x00]), "mov [15], ax");
        assert_eq!(text(&[0xa0, 0x10, 0x00]), "mov al, [16]");
    }

    #[test]
    fn test_arithmetic_forms() {
        assert_eq!(text(&[0x03, 0x18]), "add bx, [bx + si]");
        assert_eq!(text(&[0x83, 0xc6, 0x02]), "add si, 2");
        assert_eq!(text(&[0x83, 0xc5, 0xfe]), "add bp, -2");
        assert_eq!(text(&[0x81, 0xc1, 0xe8, 0x03]), "add cx, 1000");
        assert_eq!(text(&[0x80, 0x07, 0x22]), "add byte [bx], 34");
        assert_eq!(text(&[0x05, 0xe8, 0x03]), "add ax, 1000");
        assert_eq!(text(&[0x04, 0x09]), "add al, 9");
        assert_eq!(text(&[0x29, 0xd8]), "sub ax, bx");
        assert_eq!(text(&[0x83, 0x2f, 0x1d]), "sub word [bx], 29");
        assert_eq!(text(&[0x2c, 0x05]), "sub al, 5");
        assert_eq!(text(&[0x39, 0xd8]), "cmp ax, bx");
        assert_eq!(text(&[0x83, 0x3e, 0xe2, 0x12, 0x1d]), "cmp word [4834], 29");
        assert_eq!(text(&[0x3c, 0x09]), "cmp al, 9");
    }

    #[test]
    fn test_sign_extended_immediate_is_one_byte() {
        let instruction = decode_one(&[0x83, 0xc6, 0x02]);
        assert_eq!(instruction.size, 3);
        let wide = decode_one(&[0x81, 0xc6, 0x02, 0x00]);
        assert_eq!(wide.size, 4);
        assert_eq!(wide.operands[1], Some(Operand::Immediate(2)));
    }

    #[test]
    fn test_jumps_and_stack_operations() {
        let jne = decode_one(&[0x75, 0xfe]);
        assert!(jne.is_jump());
        assert_eq!(jne.jump_displacement(), Some(-2));
        assert_eq!(jne.to_string(), "jne $+0");
        assert_eq!(text(&[0x74, 0x04]), "je $+6");
        assert_eq!(text(&[0xe2, 0xfc]), "loop $-2");
        assert_eq!(text(&[0xeb, 0x02]), "jmp $+4");
        assert_eq!(text(&[0xe8, 0x10, 0x00]), "call $+19");
        assert_eq!(text(&[0xc3]), "ret");
        assert_eq!(text(&[0x51]), "push cx");
        assert_eq!(text(&[0x5b]), "pop bx");
        assert_eq!(text(&[0xff, 0x37]), "push word [bx]");
        assert_eq!(text(&[0x8f, 0x06, 0x10, 0x00]), "pop word [16]");
    }

    #[test]
    fn test_program_is_keyed_by_address() {
        let program = decode_all(&[0xbb, 0x0a, 0x00, 0x89, 0xd9, 0x75, 0xfe]).unwrap();
        let addresses: Vec<u16> = program.iter().map(|i| i.address).collect();
        assert_eq!(addresses, vec![0, 3, 5]);
        assert_eq!(program.byte_len(), 7);
        assert!(program.get(1).is_none());
    }

    #[test]
    fn test_unmatched_opcode_reports_address_and_partial_program() {
        let failure = decode_all(&[0x89, 0xd9, 0x0f, 0x01]).unwrap_err();
        assert_eq!(
            failure.error,
            DecodeError::UnmatchedOpcode {
                address: 2,
                bytes: vec![0x0f, 0x01],
            }
        );
        assert_eq!(failure.partial.len(), 1);
        assert!(failure.to_string().contains("00001111 00000001"));
    }

    #[test]
    fn test_truncated_instruction() {
        let failure = decode_all(&[0xbb, 0x0a]).unwrap_err();
        assert_eq!(
            failure.error,
            DecodeError::TruncatedInstruction {
                address: 0,
                opcode: Opcode::Mov,
                bytes: vec![0xbb, 0x0a],
            }
        );
    }

    #[test]
    fn test_missing_mod_reg_rm_byte_is_truncated() {
        let failure = decode_all(&[0x89, 0xd9, 0x89]).unwrap_err();
        assert_eq!(
            failure.error,
            DecodeError::TruncatedInstruction {
                address: 2,
                opcode: Opcode::Mov,
                bytes: vec![0x89],
            }
        );
        assert_eq!(failure.partial.len(), 1);

        // the first byte alone never matches a row
        let failure = decode_all(&[0x0f]).unwrap_err();
        assert!(matches!(
            failure.error,
            DecodeError::UnmatchedOpcode { address: 0, .. }
        ));
    }
}
