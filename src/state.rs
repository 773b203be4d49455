use std::fmt::{self, Display, Formatter};

use crate::error::ExecError;
use crate::instruction::{Register, RegisterAccess, Width};

/// Size of the memory image. Only the first 64 KiB are reachable through 16-bit
/// offsets; the rest is dumped alongside it.
pub const MEMORY_SIZE: usize = 1024 * 1024;

/// Stack pointer value at which the stack is considered empty.
pub const STACK_SENTINEL: u16 = 40_000;

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
struct RegisterRow {
    low: u8,
    high: u8,
}

/// The eight general purpose registers, each stored as a low/high byte pair.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Registers {
    rows: [RegisterRow; 8],
}

impl Registers {
    pub fn word(&self, register: Register) -> u16 {
        let row = self.rows[register.index()];
        u16::from_le_bytes([row.low, row.high])
    }

    pub fn set_word(&mut self, register: Register, value: u16) {
        let [low, high] = value.to_le_bytes();
        self.rows[register.index()] = RegisterRow { low, high };
    }

    pub fn read(&self, access: RegisterAccess) -> u16 {
        match access.width {
            Width::Word => self.word(access.register),
            Width::Byte => {
                let row = self.rows[access.register.index()];
                if access.offset == 0 {
                    row.low as u16
                } else {
                    row.high as u16
                }
            }
        }
    }

    pub fn write(&mut self, access: RegisterAccess, value: u16) {
        match access.width {
            Width::Word => self.set_word(access.register, value),
            Width::Byte => {
                let row = &mut self.rows[access.register.index()];
                if access.offset == 0 {
                    row.low = value as u8;
                } else {
                    row.high = value as u8;
                }
            }
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct Flags {
    pub zero: bool,
    pub sign: bool,
}

impl Flags {
    /// Zero is tested on the full 16-bit `result`; Sign reads the top bit of
    /// the operand width.
    pub fn from_result(result: u16, width: Width) -> Self {
        Self {
            zero: result == 0,
            sign: result & width.sign_bit() != 0,
        }
    }
}

impl Display for Flags {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if self.zero {
            f.write_str("Z")?;
        }
        if self.sign {
            f.write_str("S")?;
        }
        Ok(())
    }
}

/// Registers, flags, instruction pointer and memory of one simulated run.
#[derive(Clone)]
pub struct MachineState {
    pub registers: Registers,
    pub flags: Flags,
    pub ip: u16,
    memory: Box<[u8]>,
    stack_sentinel: u16,
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MachineState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("MachineState")
            .field("registers", &self.registers)
            .field("flags", &self.flags)
            .field("ip", &self.ip)
            .field("stack_sentinel", &self.stack_sentinel)
            .finish_non_exhaustive()
    }
}

impl MachineState {
    pub fn new() -> Self {
        Self {
            registers: Registers::default(),
            flags: Flags::default(),
            ip: 0,
            memory: vec![0; MEMORY_SIZE].into_boxed_slice(),
            stack_sentinel: STACK_SENTINEL,
        }
    }

    /// Replaces the empty-stack guard address.
    pub fn with_stack_sentinel(mut self, sentinel: u16) -> Self {
        self.stack_sentinel = sentinel;
        self
    }

    pub fn stack_sentinel(&self) -> u16 {
        self.stack_sentinel
    }

    /// Copies a program to offset 0. Programs must fit the 16-bit address space.
    pub fn load_program(&mut self, program: &[u8]) -> Result<(), ExecError> {
        let capacity = u16::MAX as usize + 1;
        if program.len() > capacity {
            return Err(ExecError::ProgramTooLarge {
                len: program.len(),
                capacity,
            });
        }
        self.memory[..program.len()].copy_from_slice(program);
        Ok(())
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn read_memory(&self, address: u16, width: Width) -> u16 {
        let index = address as usize;
        match width {
            Width::Byte => self.memory[index] as u16,
            Width::Word => u16::from_le_bytes([self.memory[index], self.memory[index + 1]]),
        }
    }

    pub fn write_memory(&mut self, address: u16, width: Width, value: u16) {
        let index = address as usize;
        match width {
            Width::Byte => self.memory[index] = value as u8,
            Width::Word => {
                let [low, high] = value.to_le_bytes();
                self.memory[index] = low;
                self.memory[index + 1] = high;
            }
        }
    }

    pub fn sp(&self) -> u16 {
        self.registers.word(Register::Sp)
    }

    /// Human readable listing of all registers and flags.
    pub fn register_dump(&self) -> RegisterDump<'_> {
        RegisterDump(self)
    }
}

pub struct RegisterDump<'a>(&'a MachineState);

impl Display for RegisterDump<'_> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let state = self.0;
        writeln!(f, "Final registers:")?;
        for register in Register::ALL {
            let value = state.registers.word(register);
            writeln!(f, "{:>7}: 0x{:04x} ({})", register.word(), value, value)?;
        }
        writeln!(f, "{:>7}: 0x{:04x} ({})", "ip", state.ip, state.ip)?;
        write!(f, "{:>7}: {}", "flags", state.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_registers_alias_word_halves() {
        let mut registers = Registers::default();
        registers.set_word(Register::C, 0x1234);
        assert_eq!(registers.read(RegisterAccess::new(Register::C, 0, Width::Byte)), 0x34);
        assert_eq!(registers.read(RegisterAccess::new(Register::C, 1, Width::Byte)), 0x12);

        registers.write(RegisterAccess::new(Register::C, 1, Width::Byte), 0xabff);
        assert_eq!(registers.word(Register::C), 0xff34);
    }

    #[test]
    fn test_flags_use_width_sized_sign_bit_and_full_width_zero() {
        assert_eq!(
            Flags::from_result(0x0080, Width::Byte),
            Flags { zero: false, sign: true }
        );
        assert_eq!(
            Flags::from_result(0x0080, Width::Word),
            Flags { zero: false, sign: false }
        );
        assert_eq!(
            Flags::from_result(0x0100, Width::Byte),
            Flags { zero: false, sign: false }
        );
        assert_eq!(
            Flags::from_result(0xffff, Width::Byte),
            Flags { zero: false, sign: true }
        );
        assert_eq!(
            Flags::from_result(0, Width::Byte),
            Flags { zero: true, sign: false }
        );
        assert_eq!(Flags { zero: true, sign: true }.to_string(), "ZS");
    }

    #[test]
    fn test_memory_words_are_little_endian() {
        let mut state = MachineState::new();
        state.write_memory(0xffff, Width::Word, 0xbeef);
        assert_eq!(state.memory()[0xffff], 0xef);
        assert_eq!(state.memory()[0x10000], 0xbe);
        assert_eq!(state.read_memory(0xffff, Width::Word), 0xbeef);
        assert_eq!(state.read_memory(0xffff, Width::Byte), 0xef);
    }

    #[test]
    fn test_load_program_rejects_oversized_input() {
        let mut state = MachineState::new();
        state.load_program(&[0x89, 0xd9]).unwrap();
        assert_eq!(&state.memory()[..2], &[0x89, 0xd9]);

        let too_big = vec![0u8; 0x10001];
        assert!(matches!(
            state.load_program(&too_big),
            Err(ExecError::ProgramTooLarge { len: 0x10001, .. })
        ));
    }

    #[test]
    fn test_register_dump_lists_every_register() {
        let mut state = MachineState::new();
        state.registers.set_word(Register::B, 10);
        state.flags.zero = true;
        let dump = state.register_dump().to_string();
        assert!(dump.contains("     bx: 0x000a (10)"));
        assert!(dump.contains("     sp: 0x0000 (0)"));
        assert!(dump.ends_with("  flags: Z"));
    }
}
