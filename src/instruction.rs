use std::fmt;

use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use strum_macros::Display;

use crate::state::Registers;

/// The eight general purpose registers. Each is 16 bits wide; `a`..`d` can also be
/// addressed by their low and high bytes.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum Register {
    A,
    B,
    C,
    D,
    Sp,
    Bp,
    Si,
    Di,
}

impl Register {
    pub const ALL: [Register; 8] = [
        Register::A,
        Register::B,
        Register::C,
        Register::D,
        Register::Sp,
        Register::Bp,
        Register::Si,
        Register::Di,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn word(self) -> RegisterAccess {
        RegisterAccess::new(self, 0, Width::Word)
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Width {
    Byte,
    Word,
}

impl Width {
    pub fn from_w(w: bool) -> Self {
        if w {
            Width::Word
        } else {
            Width::Byte
        }
    }

    pub fn bytes(self) -> u16 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
        }
    }

    pub fn mask(self) -> u16 {
        match self {
            Width::Byte => 0x00ff,
            Width::Word => 0xffff,
        }
    }

    pub fn sign_bit(self) -> u16 {
        match self {
            Width::Byte => 0x0080,
            Width::Word => 0x8000,
        }
    }
}

/// A view onto part of a register: `offset` is the byte within the register
/// (0 = low, 1 = high) and `width` how many bytes are read from there.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct RegisterAccess {
    pub register: Register,
    pub offset: u8,
    pub width: Width,
}

/// REG/RM field encoding indexed by `[field][w]`.
const REGISTER_FIELDS: [[RegisterAccess; 2]; 8] = [
    [RegisterAccess::new(Register::A, 0, Width::Byte), RegisterAccess::new(Register::A, 0, Width::Word)],
    [RegisterAccess::new(Register::C, 0, Width::Byte), RegisterAccess::new(Register::C, 0, Width::Word)],
    [RegisterAccess::new(Register::D, 0, Width::Byte), RegisterAccess::new(Register::D, 0, Width::Word)],
    [RegisterAccess::new(Register::B, 0, Width::Byte), RegisterAccess::new(Register::B, 0, Width::Word)],
    [RegisterAccess::new(Register::A, 1, Width::Byte), RegisterAccess::new(Register::Sp, 0, Width::Word)],
    [RegisterAccess::new(Register::C, 1, Width::Byte), RegisterAccess::new(Register::Bp, 0, Width::Word)],
    [RegisterAccess::new(Register::D, 1, Width::Byte), RegisterAccess::new(Register::Si, 0, Width::Word)],
    [RegisterAccess::new(Register::B, 1, Width::Byte), RegisterAccess::new(Register::Di, 0, Width::Word)],
];

impl RegisterAccess {
    pub const fn new(register: Register, offset: u8, width: Width) -> Self {
        Self {
            register,
            offset,
            width,
        }
    }

    /// Looks up the register selected by a 3-bit REG or RM field.
    pub fn from_field(field: u8, w: bool) -> Option<Self> {
        REGISTER_FIELDS
            .get(field as usize)
            .map(|pair| pair[w as usize])
    }
}

impl fmt::Display for RegisterAccess {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match (self.register, self.width, self.offset) {
            (Register::A, Width::Word, _) => "ax",
            (Register::B, Width::Word, _) => "bx",
            (Register::C, Width::Word, _) => "cx",
            (Register::D, Width::Word, _) => "dx",
            (Register::A, Width::Byte, 0) => "al",
            (Register::B, Width::Byte, 0) => "bl",
            (Register::C, Width::Byte, 0) => "cl",
            (Register::D, Width::Byte, 0) => "dl",
            (Register::A, Width::Byte, _) => "ah",
            (Register::B, Width::Byte, _) => "bh",
            (Register::C, Width::Byte, _) => "ch",
            (Register::D, Width::Byte, _) => "dh",
            (Register::Sp, _, _) => "sp",
            (Register::Bp, _, _) => "bp",
            (Register::Si, _, _) => "si",
            (Register::Di, _, _) => "di",
        };
        f.pad(name)
    }
}

/// Addressing-mode expressions. The discriminants match the RM field encoding;
/// `DirectAddress` is selected by `MOD = 00, RM = 110` instead of `bp`.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Display, TryFromPrimitive)]
#[repr(u8)]
pub enum EffectiveAddressExpression {
    #[strum(serialize = "bx + si")]
    BxSi = 0b000,
    #[strum(serialize = "bx + di")]
    BxDi = 0b001,
    #[strum(serialize = "bp + si")]
    BpSi = 0b010,
    #[strum(serialize = "bp + di")]
    BpDi = 0b011,
    #[strum(serialize = "si")]
    Si = 0b100,
    #[strum(serialize = "di")]
    Di = 0b101,
    #[strum(serialize = "bp")]
    Bp = 0b110,
    #[strum(serialize = "bx")]
    Bx = 0b111,
    #[strum(serialize = "direct address")]
    DirectAddress = 0b1000,
}

impl EffectiveAddressExpression {
    /// Base and index registers summed by this expression.
    pub fn registers(self) -> &'static [Register] {
        match self {
            Self::BxSi => &[Register::B, Register::Si],
            Self::BxDi => &[Register::B, Register::Di],
            Self::BpSi => &[Register::Bp, Register::Si],
            Self::BpDi => &[Register::Bp, Register::Di],
            Self::Si => &[Register::Si],
            Self::Di => &[Register::Di],
            Self::Bp => &[Register::Bp],
            Self::Bx => &[Register::B],
            Self::DirectAddress => &[],
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct EffectiveAddress {
    pub expression: EffectiveAddressExpression,
    pub displacement: i32,
    pub width: Width,
}

impl EffectiveAddress {
    /// Computes the memory offset this address refers to right now.
    pub fn resolve(&self, registers: &Registers) -> u16 {
        self.expression
            .registers()
            .iter()
            .fold(self.displacement as u16, |location, register| {
                location.wrapping_add(registers.word(*register))
            })
    }

    pub fn has_displacement(&self) -> bool {
        self.displacement != 0
    }
}

impl fmt::Display for EffectiveAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.expression {
            EffectiveAddressExpression::DirectAddress => write!(f, "[{}]", self.displacement),
            expr if self.displacement > 0 => write!(f, "[{} + {}]", expr, self.displacement),
            expr if self.displacement < 0 => write!(f, "[{} - {}]", expr, -self.displacement),
            expr => write!(f, "[{}]", expr),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum Operand {
    Register(RegisterAccess),
    Memory(EffectiveAddress),
    Immediate(i32),
}

impl Operand {
    pub fn is_register(&self) -> bool {
        matches!(self, Operand::Register(_))
    }

    pub fn memory(&self) -> Option<&EffectiveAddress> {
        match self {
            Operand::Memory(ea) => Some(ea),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Register(reg) => write!(f, "{}", reg),
            Self::Memory(ea) => write!(f, "{}", ea),
            Self::Immediate(value) => write!(f, "{}", value),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Opcode {
    Mov,
    Add,
    Sub,
    Cmp,
    Jo,
    Jno,
    Jb,
    Jnb,
    Je,
    Jne,
    Jbe,
    Ja,
    Js,
    Jns,
    Jp,
    Jnp,
    Jl,
    Jnl,
    Jle,
    Jg,
    Loopnz,
    Loopz,
    Loop,
    Jcxz,
    Jmp,
    Call,
    Ret,
    Push,
    Pop,
}

impl Opcode {
    pub fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            Opcode::Jo
                | Opcode::Jno
                | Opcode::Jb
                | Opcode::Jnb
                | Opcode::Je
                | Opcode::Jne
                | Opcode::Jbe
                | Opcode::Ja
                | Opcode::Js
                | Opcode::Jns
                | Opcode::Jp
                | Opcode::Jnp
                | Opcode::Jl
                | Opcode::Jnl
                | Opcode::Jle
                | Opcode::Jg
        )
    }

    pub fn is_loop(self) -> bool {
        matches!(
            self,
            Opcode::Loopnz | Opcode::Loopz | Opcode::Loop | Opcode::Jcxz
        )
    }

    /// Control-flow opcodes set the instruction pointer themselves.
    pub fn is_control_flow(self) -> bool {
        self.is_conditional_jump()
            || self.is_loop()
            || matches!(self, Opcode::Jmp | Opcode::Call | Opcode::Ret)
    }
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, Default)]
    pub struct InstructionFlags: u8 {
        const WIDE = 0b01;
        const IS_JUMP = 0b10;
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct DecodedInstruction {
    pub address: u16,
    pub size: u16,
    pub bytes: Vec<u8>,
    pub opcode: Opcode,
    pub operands: [Option<Operand>; 2],
    pub flags: InstructionFlags,
}

impl DecodedInstruction {
    pub fn is_wide(&self) -> bool {
        self.flags.contains(InstructionFlags::WIDE)
    }

    pub fn is_jump(&self) -> bool {
        self.flags.contains(InstructionFlags::IS_JUMP)
    }

    pub fn width(&self) -> Width {
        Width::from_w(self.is_wide())
    }

    /// Address of the byte following this instruction.
    pub fn next_address(&self) -> u16 {
        self.address.wrapping_add(self.size)
    }

    /// Relative displacement carried by a jump-class instruction.
    pub fn jump_displacement(&self) -> Option<i32> {
        match self.operands[1] {
            Some(Operand::Immediate(disp)) if self.is_jump() => Some(disp),
            _ => None,
        }
    }

    /// The first memory operand, if any.
    pub fn memory_operand(&self) -> Option<&EffectiveAddress> {
        self.operands.iter().flatten().find_map(Operand::memory)
    }
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(disp) = self.jump_displacement() {
            let target_offset = disp + self.size as i32;
            return write!(f, "{} ${:+}", self.opcode, target_offset);
        }

        write!(f, "{}", self.opcode)?;
        let has_register = self.operands.iter().flatten().any(Operand::is_register);
        let mut first = true;
        for operand in self.operands.iter().flatten() {
            f.write_str(if first { " " } else { ", " })?;
            if !has_register && matches!(operand, Operand::Memory(_)) {
                write!(f, "{} ", self.width())?;
            }
            write!(f, "{}", operand)?;
            first = false;
        }
        Ok(())
    }
}
