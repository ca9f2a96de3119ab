//! Instruction metering and cooperative cancellation.
//!
//! The interpreter calls [`ExecutionLimits::tick`] between instructions;
//! the host may flip the stop flag from any thread and the next tick
//! raises the non-catchable termination error.

use crate::errors::{EngineError, InterruptReason};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable handle the host keeps to interrupt a running engine.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct ExecutionLimits {
    stop: Arc<AtomicBool>,
    pub instructions_executed: u64,
    pub instruction_limit: u64,
}

impl ExecutionLimits {
    pub fn new(instruction_limit: u64) -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            instructions_executed: 0,
            instruction_limit,
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    pub fn reset_for_invocation(&mut self) {
        self.instructions_executed = 0;
        self.stop.store(false, Ordering::Relaxed);
    }

    /// One instruction boundary: count, enforce the meter, poll the flag.
    #[inline]
    pub fn tick(&mut self) -> Result<(), EngineError> {
        self.instructions_executed += 1;
        if self.instruction_limit != 0 && self.instructions_executed > self.instruction_limit {
            return Err(EngineError::Interrupted(
                InterruptReason::InstructionLimitExceeded(self.instruction_limit),
            ));
        }
        if self.stop.load(Ordering::Relaxed) {
            return Err(EngineError::Interrupted(InterruptReason::StopRequested));
        }
        Ok(())
    }

    /// Host-boundary crossings poll the flag without consuming the meter.
    pub fn check_stop(&self) -> Result<(), EngineError> {
        if self.stop.load(Ordering::Relaxed) {
            return Err(EngineError::Interrupted(InterruptReason::StopRequested));
        }
        Ok(())
    }
}
