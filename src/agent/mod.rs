//! The per-device control loop: observe, think, act, record.

pub mod runner;
pub mod types;

pub use runner::StepLoop;
pub use types::{
    CancelToken, DeviceIo, ExchangeRecord, ExecutionOutcome, Inference, Observation,
    TerminalStatus,
};
