//! Decoder, cycle estimator and execution engine for a subset of the 8086.

pub mod cycles;
pub mod decoder;
pub mod error;
pub mod executor;
pub mod instruction;
pub mod state;
pub mod table;

pub use cycles::{estimate_cycles, CycleEstimate};
pub use decoder::{decode_all, Decoder, Program};
pub use error::{DecodeError, DecodeFailure, ExecError, TableError};
pub use executor::{step, Executor, ExecutorConfig, RunSummary, StepTrace};
pub use instruction::{DecodedInstruction, Opcode, Operand, Register, Width};
pub use state::{Flags, MachineState};
pub use table::EncodingTable;
