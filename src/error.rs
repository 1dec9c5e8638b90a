//! Error taxonomy and the diagnostic checkpoint stack.
//!
//! Every fallible operation in this crate returns [`Result<T>`], whose error
//! is a single [`Exc`] carrying an [`ErrorKind`] drawn from the taxonomy in
//! the design doc plus a human-readable checkpoint trail. There is no retry
//! anywhere in the engine: a failure always means the current transaction is
//! abandoned and whatever state the host already observed must be rolled
//! back by the caller.
//!
//! The original C++ engine threads a thread-local stack of RAII
//! `Checkpoint` objects and unwinds it via an exception. We replace both the
//! thread-local and the exception with an explicit [`Checkpoints`] stack
//! that the compiler and the processor carry by value and a plain `Result`.

use std::fmt;

/// Coarse failure category, stable across the binary host ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// Malformed WASM: truncated LEB, unknown section, disallowed feature.
    #[error("decode error")]
    Decode,
    /// Unresolved import, bad import signature, missing stack pointer.
    #[error("link error")]
    Link,
    /// Operand-stack type mismatch, bad local/global index, bad block type.
    #[error("validation error")]
    Validate,
    /// Memory access out of range, stack overflow/underflow, bad alignment.
    #[error("bounds error")]
    Bounds,
    /// Division by zero, shift out of range, indirect call OOB, `unreachable`,
    /// exceeded far-call depth.
    #[error("trap")]
    Trap,
    /// `Halt`, missing `RefAdd` target, funds under/overflow, asset refusal.
    #[error("host error")]
    Host,
    /// Nonstandard signed-LEB sign bit observed under `Restrict` mode.
    #[error("conflicting LEB encoding")]
    Conflict,
}

/// A named, nested diagnostic frame ("wasm/parse", "wasm/Run, Ip=1234", ...).
///
/// Pushed on entry to a stage and popped on exit via [`Checkpoints::enter`]'s
/// guard; read only when an [`Exc`] is constructed.
#[derive(Debug, Default, Clone)]
pub struct Checkpoints(Vec<String>);

impl Checkpoints {
    pub fn new() -> Self {
        Checkpoints(Vec::new())
    }

    /// Push a checkpoint label; it is popped when the returned guard drops.
    pub fn enter(&mut self, label: impl Into<String>) -> CheckpointGuard<'_> {
        self.0.push(label.into());
        CheckpointGuard(self)
    }

    /// Build an [`Exc`] from the current trail, innermost checkpoint first.
    pub fn fail(&self, kind: ErrorKind, message: impl Into<String>) -> Exc {
        let mut checkpoints: Vec<String> = self.0.clone();
        checkpoints.reverse();
        Exc {
            kind,
            message: message.into(),
            checkpoints,
        }
    }
}

/// RAII guard popping its [`Checkpoints`] entry on drop.
pub struct CheckpointGuard<'a>(&'a mut Checkpoints);

impl Drop for CheckpointGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.pop();
    }
}

/// The single error type surfaced by this crate.
#[derive(Debug, Clone)]
pub struct Exc {
    pub kind: ErrorKind,
    pub message: String,
    /// Innermost-first trail of checkpoint labels active at the fault.
    pub checkpoints: Vec<String>,
}

impl Exc {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Exc {
            kind,
            message: message.into(),
            checkpoints: Vec::new(),
        }
    }
}

impl fmt::Display for Exc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        for cp in &self.checkpoints {
            write!(f, " <- {}", cp)?;
        }
        Ok(())
    }
}

impl std::error::Error for Exc {}

pub type Result<T> = std::result::Result<T, Exc>;
