use std::fmt::{self, Display, Formatter};

use crate::cycles;
use crate::decoder::Program;
use crate::error::ExecError;
use crate::instruction::{DecodedInstruction, Opcode, Operand, Register, RegisterAccess, Width};
use crate::state::{Flags, MachineState};

// --- Step results ---

/// Where a value lives once an operand has been resolved.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Location {
    Register(RegisterAccess),
    Memory { address: u16, width: Width },
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Location::Register(access) => write!(f, "{}", access),
            Location::Memory { address, .. } => write!(f, "[0x{:x}]", address),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct ValueChange {
    pub location: Location,
    pub old: u16,
    pub new: u16,
}

/// Everything one executed instruction did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTrace {
    pub address: u16,
    pub text: String,
    pub bytes: Vec<u8>,
    pub ip_before: u16,
    pub ip_after: u16,
    /// Writes that changed a register or memory location, in execution order.
    pub changes: Vec<ValueChange>,
    pub flags_before: Flags,
    pub flags_after: Flags,
    pub branch_taken: bool,
    /// Filled in by [`Executor`] when cycle estimation is enabled.
    pub cycles: Option<cycles::CycleEstimate>,
}

impl StepTrace {
    pub fn flags_changed(&self) -> bool {
        self.flags_before != self.flags_after
    }
}

impl Display for StepTrace {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut state_changes = Vec::new();
        for change in &self.changes {
            state_changes.push(format!("{}:0x{:x}->0x{:x}", change.location, change.old, change.new));
        }
        if self.ip_before != self.ip_after {
            state_changes.push(format!("ip:0x{:x}->0x{:x}", self.ip_before, self.ip_after));
        }
        if self.flags_changed() {
            state_changes.push(format!("flags:{}->{}", self.flags_before, self.flags_after));
        }

        write!(f, "{}", self.text)?;
        if !state_changes.is_empty() {
            write!(f, " ; {}", state_changes.join(" "))?;
        }
        Ok(())
    }
}

// --- Execution logic ---

/// Operand resolved against the current state.
#[derive(Debug, Copy, Clone)]
enum Place {
    Location(Location),
    Immediate(u16),
}

/// What the instruction pointer does after a step.
enum Flow {
    Next,
    Branch { taken: bool, target: u16 },
    Jump(u16),
}

struct Step<'a> {
    state: &'a mut MachineState,
    instruction: &'a DecodedInstruction,
    changes: Vec<ValueChange>,
}

impl Step<'_> {
    fn ip(&self) -> u16 {
        self.instruction.address
    }

    fn operand(&self, slot: usize) -> Result<Place, ExecError> {
        let operand = self.instruction.operands[slot].ok_or(ExecError::MissingOperand {
            ip: self.ip(),
            opcode: self.instruction.opcode,
            slot,
        })?;
        Ok(match operand {
            Operand::Register(access) => Place::Location(Location::Register(access)),
            Operand::Memory(ea) => Place::Location(Location::Memory {
                address: ea.resolve(&self.state.registers),
                width: self.instruction.width(),
            }),
            Operand::Immediate(value) => Place::Immediate(value as u16),
        })
    }

    fn destination(&self, slot: usize) -> Result<Location, ExecError> {
        match self.operand(slot)? {
            Place::Location(location) => Ok(location),
            Place::Immediate(_) => Err(ExecError::InvalidDestination {
                ip: self.ip(),
                opcode: self.instruction.opcode,
            }),
        }
    }

    fn read(&self, place: Place) -> u16 {
        match place {
            Place::Immediate(value) => value & self.instruction.width().mask(),
            Place::Location(location) => self.read_location(location),
        }
    }

    fn read_location(&self, location: Location) -> u16 {
        match location {
            Location::Register(access) => self.state.registers.read(access),
            Location::Memory { address, width } => self.state.read_memory(address, width),
        }
    }

    fn write(&mut self, location: Location, value: u16) {
        let old = self.read_location(location);
        match location {
            Location::Register(access) => self.state.registers.write(access, value),
            Location::Memory { address, width } => self.state.write_memory(address, width, value),
        }
        let new = self.read_location(location);
        if old != new {
            self.changes.push(ValueChange { location, old, new });
        }
    }

    fn write_sp(&mut self, value: u16) {
        self.write(Location::Register(Register::Sp.word()), value);
    }

    fn push(&mut self, value: u16) {
        let sp = self.state.sp().wrapping_sub(2);
        self.write_sp(sp);
        self.write(
            Location::Memory {
                address: sp,
                width: Width::Word,
            },
            value,
        );
    }

    fn pop(&mut self) -> Result<u16, ExecError> {
        let sp = self.state.sp();
        if sp == self.state.stack_sentinel() {
            return Err(ExecError::StackUnderflow { ip: self.ip(), sp });
        }
        let value = self.state.read_memory(sp, Width::Word);
        self.write_sp(sp.wrapping_add(2));
        Ok(value)
    }

    fn relative_target(&self) -> Result<u16, ExecError> {
        let displacement = self
            .instruction
            .jump_displacement()
            .ok_or(ExecError::MissingOperand {
                ip: self.ip(),
                opcode: self.instruction.opcode,
                slot: 1,
            })?;
        Ok(self.instruction.next_address().wrapping_add(displacement as u16))
    }

    fn branch(&self, taken: bool) -> Result<Flow, ExecError> {
        Ok(Flow::Branch {
            taken,
            target: self.relative_target()?,
        })
    }

    fn execute(&mut self) -> Result<Flow, ExecError> {
        let flags = self.state.flags;
        match self.instruction.opcode {
            Opcode::Mov => {
                let value = self.read(self.operand(1)?);
                let dest = self.destination(0)?;
                self.write(dest, value);
                Ok(Flow::Next)
            }
            op @ (Opcode::Add | Opcode::Sub | Opcode::Cmp) => {
                self.execute_arithmetic(op)?;
                Ok(Flow::Next)
            }
            Opcode::Je => self.branch(flags.zero),
            Opcode::Jne => self.branch(!flags.zero),
            Opcode::Jl | Opcode::Js => self.branch(flags.sign),
            Opcode::Jnl | Opcode::Jg | Opcode::Jns => self.branch(!flags.sign),
            Opcode::Jle | Opcode::Jbe => self.branch(flags.zero || flags.sign),
            Opcode::Ja => self.branch(!flags.sign && !flags.zero),
            Opcode::Jb => self.branch(flags.sign && !flags.zero),
            Opcode::Jmp => self.branch(true),
            op @ (Opcode::Loop | Opcode::Loopz | Opcode::Loopnz | Opcode::Jcxz) => {
                self.execute_loop(op)
            }
            Opcode::Push => {
                let value = self.read(self.operand(0)?);
                self.push(value);
                Ok(Flow::Next)
            }
            Opcode::Pop => {
                let dest = self.destination(0)?;
                let value = self.pop()?;
                self.write(dest, value);
                Ok(Flow::Next)
            }
            Opcode::Call => {
                let target = self.relative_target()?;
                self.push(self.instruction.next_address());
                Ok(Flow::Jump(target))
            }
            Opcode::Ret => Ok(Flow::Jump(self.pop()?)),
            opcode @ (Opcode::Jo | Opcode::Jno | Opcode::Jnb | Opcode::Jp | Opcode::Jnp) => {
                Err(ExecError::UnimplementedOpcode {
                    ip: self.ip(),
                    opcode,
                })
            }
        }
    }

    fn execute_arithmetic(&mut self, op: Opcode) -> Result<(), ExecError> {
        let width = self.instruction.width();
        let dest = self.destination(0)?;
        let lhs = self.read_location(dest);
        let rhs = self.read(self.operand(1)?);

        let result = match op {
            Opcode::Add => lhs.wrapping_add(rhs),
            _ => lhs.wrapping_sub(rhs),
        };

        self.state.flags = Flags::from_result(result, width);
        if op != Opcode::Cmp {
            self.write(dest, result & width.mask());
        }
        Ok(())
    }

    fn execute_loop(&mut self, op: Opcode) -> Result<Flow, ExecError> {
        let cx = self.state.registers.word(Register::C);
        if op == Opcode::Jcxz {
            return self.branch(cx == 0);
        }

        let new_cx = cx.wrapping_sub(1);
        self.write(Location::Register(Register::C.word()), new_cx);
        let zero = self.state.flags.zero;
        let should_loop = match op {
            Opcode::Loopz => new_cx != 0 && zero,
            Opcode::Loopnz => new_cx != 0 && !zero,
            _ => new_cx != 0,
        };
        self.branch(should_loop)
    }
}

/// Executes the instruction at the current instruction pointer.
pub fn step(state: &mut MachineState, program: &Program) -> Result<StepTrace, ExecError> {
    let ip_before = state.ip;
    let instruction = program
        .get(ip_before)
        .ok_or(ExecError::MissingInstructionAtAddress { ip: ip_before })?;
    let flags_before = state.flags;

    let mut step = Step {
        state,
        instruction,
        changes: Vec::new(),
    };
    let flow = step.execute()?;
    let changes = step.changes;

    let (ip_after, branch_taken) = match flow {
        Flow::Next => (instruction.next_address(), false),
        Flow::Branch { taken: true, target } => (target, true),
        Flow::Branch { taken: false, .. } => (instruction.next_address(), false),
        Flow::Jump(target) => (target, true),
    };
    state.ip = ip_after;

    Ok(StepTrace {
        address: instruction.address,
        text: instruction.to_string(),
        bytes: instruction.bytes.clone(),
        ip_before,
        ip_after,
        changes,
        flags_before,
        flags_after: state.flags,
        branch_taken,
        cycles: None,
    })
}

// --- Executor ---

#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutorConfig {
    /// Annotate every step with its cycle estimate.
    pub estimate_cycles: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub steps: u64,
    pub total_cycles: u64,
}

/// Drives [`step`] until the instruction pointer leaves the decoded program.
pub struct Executor {
    program: Program,
    state: MachineState,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(program: Program, state: MachineState, config: ExecutorConfig) -> Self {
        Self {
            program,
            state,
            config,
        }
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn into_state(self) -> MachineState {
        self.state
    }

    /// Runs until IP leaves `[0, program length)`. Each trace is handed to
    /// `on_step`; on error the state is left as of the failing instruction.
    pub fn run<F>(&mut self, mut on_step: F) -> Result<RunSummary, ExecError>
    where
        F: FnMut(&StepTrace),
    {
        let mut summary = RunSummary::default();
        while (self.state.ip as usize) < self.program.byte_len() {
            let mut trace = step(&mut self.state, &self.program).inspect_err(|err| {
                tracing::error!(ip = self.state.ip, "execution stopped: {err}");
            })?;

            if self.config.estimate_cycles {
                if let Some(instruction) = self.program.get(trace.address) {
                    let estimate = cycles::estimate(&self.state, instruction, trace.branch_taken);
                    summary.total_cycles += estimate.total() as u64;
                    trace.cycles = Some(estimate);
                }
            }
            summary.steps += 1;
            tracing::trace!(ip = trace.ip_before, "{trace}");
            on_step(&trace);
        }
        tracing::debug!(steps = summary.steps, cycles = summary.total_cycles, "run complete");
        Ok(summary)
    }
}
