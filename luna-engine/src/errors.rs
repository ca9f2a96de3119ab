use crate::value::Value;
use std::fmt;

/// Top-level failure of an API invocation.
///
/// Everything the interpreter, loader, registry, track or host can raise
/// flattens into this one enum before it reaches the transaction boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The bytecode loader rejected its input.
    Compile(CompileError),

    /// The interpreter trapped.
    Runtime(RuntimeError),

    /// Call-depth or value-stack limit exceeded. Not catchable.
    StackOverflow(StackOverflowError),

    /// The storage layer rejected a value or the host rejected a commit.
    Storage(StorageError),

    /// A host primitive reported failure.
    Host(HostError),

    /// A permission rule was violated.
    Policy(PolicyError),

    /// The stop flag or an execution limit fired. Not catchable.
    Interrupted(InterruptReason),

    /// The contract's exported API set disagrees with host metadata.
    Protocol(ProtocolError),
}

impl EngineError {
    /// Whether a protected call (`pcall`/`xpcall`) may observe this error.
    /// Interrupts and stack exhaustion always unwind the whole invocation.
    pub fn is_catchable(&self) -> bool {
        !matches!(
            self,
            EngineError::Interrupted(_) | EngineError::StackOverflow(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    BadSignature,
    UnsupportedVersion(u8),
    UnsupportedFormat(u8),
    CorruptCheckData,
    SizeMismatch { field: &'static str, actual: u8 },
    EndiannessMismatch,
    NumberFormatMismatch,
    TruncatedChunk { needed: usize, remaining: usize },
    TrailingGarbage(usize),
    BadConstantTag(u8),
    PrototypeNestingTooDeep(usize),
    StringTooLong(usize),
    CountOutOfRange { field: &'static str, count: u64 },
    Verify(VerifyError),
}

impl From<VerifyError> for CompileError {
    fn from(error: VerifyError) -> Self {
        CompileError::Verify(error)
    }
}

/// Structural bytecode validation failure; `pc` is the offending
/// instruction index within the rejected prototype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    UnknownOpcode { pc: usize, opcode: u8 },
    OperandOutOfRange { pc: usize, operand: &'static str },
    ConstantIndexOutOfRange { pc: usize, index: usize },
    JumpOutOfRange { pc: usize, target: isize },
    RegisterOutOfRange { pc: usize, register: usize },
    UpvalueIndexOutOfRange { pc: usize, index: usize },
    BadUpvalueDescriptor { index: usize },
    PrototypeIndexOutOfRange { pc: usize, index: usize },
    VarargInNonVarargFunction { pc: usize },
    MissingExtraArg { pc: usize },
    MissingFollowupJump { pc: usize },
    TruncatedCode,
    BadStackSize(usize),
    TooManyParams(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub location: Option<SourceLocation>,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind) -> Self {
        Self {
            kind,
            location: None,
        }
    }

    pub fn at(kind: RuntimeErrorKind, location: SourceLocation) -> Self {
        Self {
            kind,
            location: Some(location),
        }
    }
}

impl From<RuntimeErrorKind> for RuntimeError {
    fn from(kind: RuntimeErrorKind) -> Self {
        RuntimeError::new(kind)
    }
}

impl From<RuntimeErrorKind> for EngineError {
    fn from(kind: RuntimeErrorKind) -> Self {
        EngineError::Runtime(RuntimeError::new(kind))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub source: String,
    pub line: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.line)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    IntegerOverflow,
    DivisionByZero,
    BadExponent,
    ArithOnNonNumber { op: &'static str, type_name: &'static str },
    BitwiseOnNonInteger { type_name: &'static str },
    CompareTypeMismatch { lhs: &'static str, rhs: &'static str },
    ConcatTypeError { type_name: &'static str },
    LengthTypeError { type_name: &'static str },
    IndexNonTable { type_name: &'static str },
    NilTableKey,
    NanTableKey,
    NotCallable { type_name: &'static str },
    MetamethodChainTooLong { event: &'static str },
    ForLoopNonNumeric { what: &'static str, type_name: &'static str },
    ForLoopZeroStep,
    ForLoopInitOutOfRange,
    BadArgument { func: &'static str, index: usize, expected: &'static str, found: &'static str },
    ApiNotFound { api: String },
    YieldAcrossNativeBoundary,
    ResumeNonSuspendedCoroutine { status: &'static str },
    YieldFromOutsideCoroutine,
    /// `error(value)` from contract code; the payload is any engine value.
    ScriptRaised(Value),
    AssertionFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackOverflowError {
    CallDepthLimitExceeded(usize),
    ValueStackLimitExceeded(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    UnencodableValue { type_name: &'static str },
    CyclicValue,
    DepthLimitExceeded(usize),
    NonStringKeyPath,
    /// Two table keys coerced to the same canonical map key.
    DuplicateMapKey(String),
    IntegerOutOfRange(i128),
    Encode(lbor::EncodeError),
    Decode(lbor::DecodeError),
    Diff(lbor::DiffError),
    CommitRejected(HostError),
}

impl From<lbor::EncodeError> for StorageError {
    fn from(error: lbor::EncodeError) -> Self {
        StorageError::Encode(error)
    }
}

impl From<lbor::DecodeError> for StorageError {
    fn from(error: lbor::DecodeError) -> Self {
        StorageError::Decode(error)
    }
}

/// Failure surfaced by the host through a capability call, or injected by
/// the host's `throw`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub code: i64,
    pub message: String,
}

impl HostError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn contract_not_found(identifier: &str) -> Self {
        Self::new(404, format!("contract not found: {}", identifier))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    StorageWriteInStaticCall,
    EventInStaticCall,
    TransferInStaticCall,
    SpecialApiOnNonEntryContract { api: String },
    ReadOnlyTableWrite,
    StorageAccessOutsideContract,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptReason {
    StopRequested,
    InstructionLimitExceeded(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    ModuleDidNotReturnTable,
    ApiSetMismatch { declared: Vec<String>, exported: Vec<String> },
    OfflineApiSetMismatch { declared: Vec<String>, exported: Vec<String> },
    ArgTypeMismatch { api: String, expected: String, found: String },
    BadModuleName(String),
    StreamNotFound(String),
    ContractStateForbidsInvocation { state: String },
}

impl From<CompileError> for EngineError {
    fn from(error: CompileError) -> Self {
        EngineError::Compile(error)
    }
}

impl From<RuntimeError> for EngineError {
    fn from(error: RuntimeError) -> Self {
        EngineError::Runtime(error)
    }
}

impl From<StackOverflowError> for EngineError {
    fn from(error: StackOverflowError) -> Self {
        EngineError::StackOverflow(error)
    }
}

impl From<StorageError> for EngineError {
    fn from(error: StorageError) -> Self {
        EngineError::Storage(error)
    }
}

impl From<HostError> for EngineError {
    fn from(error: HostError) -> Self {
        EngineError::Host(error)
    }
}

impl From<PolicyError> for EngineError {
    fn from(error: PolicyError) -> Self {
        EngineError::Policy(error)
    }
}

impl From<InterruptReason> for EngineError {
    fn from(reason: InterruptReason) -> Self {
        EngineError::Interrupted(reason)
    }
}

impl From<ProtocolError> for EngineError {
    fn from(error: ProtocolError) -> Self {
        EngineError::Protocol(error)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::Compile(e) => write!(f, "CompileError: {:?}", e),
            EngineError::Runtime(e) => match &e.location {
                Some(loc) => write!(f, "RuntimeError: {} ({})", e.kind.describe(), loc),
                None => write!(f, "RuntimeError: {}", e.kind.describe()),
            },
            EngineError::StackOverflow(e) => write!(f, "StackOverflow: {:?}", e),
            EngineError::Storage(e) => write!(f, "StorageError: {:?}", e),
            EngineError::Host(e) => write!(f, "HostError {}: {}", e.code, e.message),
            EngineError::Policy(e) => write!(f, "PolicyError: {:?}", e),
            EngineError::Interrupted(e) => write!(f, "Interrupted: {:?}", e),
            EngineError::Protocol(e) => write!(f, "ProtocolError: {:?}", e),
        }
    }
}

impl RuntimeErrorKind {
    pub fn describe(&self) -> String {
        match self {
            RuntimeErrorKind::IntegerOverflow => "integer overflow".to_owned(),
            RuntimeErrorKind::DivisionByZero => "attempt to perform 'n/0'".to_owned(),
            RuntimeErrorKind::BadExponent => {
                "exponent must be a non-negative integer".to_owned()
            }
            RuntimeErrorKind::ArithOnNonNumber { op, type_name } => {
                format!("attempt to perform arithmetic ('{}') on a {} value", op, type_name)
            }
            RuntimeErrorKind::BitwiseOnNonInteger { type_name } => {
                format!("attempt to perform bitwise operation on a {} value", type_name)
            }
            RuntimeErrorKind::CompareTypeMismatch { lhs, rhs } => {
                format!("attempt to compare {} with {}", lhs, rhs)
            }
            RuntimeErrorKind::ConcatTypeError { type_name } => {
                format!("attempt to concatenate a {} value", type_name)
            }
            RuntimeErrorKind::LengthTypeError { type_name } => {
                format!("attempt to get length of a {} value", type_name)
            }
            RuntimeErrorKind::IndexNonTable { type_name } => {
                format!("attempt to index a {} value", type_name)
            }
            RuntimeErrorKind::NilTableKey => "table index is nil".to_owned(),
            RuntimeErrorKind::NanTableKey => "table index is not representable".to_owned(),
            RuntimeErrorKind::NotCallable { type_name } => {
                format!("attempt to call a {} value", type_name)
            }
            RuntimeErrorKind::MetamethodChainTooLong { event } => {
                format!("'{}' chain too long; possible loop", event)
            }
            RuntimeErrorKind::ForLoopNonNumeric { what, type_name } => {
                format!("'for' {} must be a number, got {}", what, type_name)
            }
            RuntimeErrorKind::ForLoopZeroStep => "'for' step is zero".to_owned(),
            RuntimeErrorKind::ForLoopInitOutOfRange => {
                "'for' initial value out of range".to_owned()
            }
            RuntimeErrorKind::BadArgument {
                func,
                index,
                expected,
                found,
            } => format!(
                "bad argument #{} to '{}' ({} expected, got {})",
                index, func, expected, found
            ),
            RuntimeErrorKind::ApiNotFound { api } => format!("api '{}' not found", api),
            RuntimeErrorKind::YieldAcrossNativeBoundary => {
                "attempt to yield across a native boundary".to_owned()
            }
            RuntimeErrorKind::ResumeNonSuspendedCoroutine { status } => {
                format!("cannot resume {} coroutine", status)
            }
            RuntimeErrorKind::YieldFromOutsideCoroutine => {
                "attempt to yield from outside a coroutine".to_owned()
            }
            RuntimeErrorKind::ScriptRaised(_) => "error raised by contract code".to_owned(),
            RuntimeErrorKind::AssertionFailed => "assertion failed!".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catchability() {
        assert!(EngineError::from(RuntimeErrorKind::IntegerOverflow).is_catchable());
        assert!(EngineError::Policy(PolicyError::ReadOnlyTableWrite).is_catchable());
        assert!(!EngineError::Interrupted(InterruptReason::StopRequested).is_catchable());
        assert!(
            !EngineError::StackOverflow(StackOverflowError::CallDepthLimitExceeded(200))
                .is_catchable()
        );
    }

    #[test]
    fn test_display_carries_location() {
        let err = EngineError::Runtime(RuntimeError::at(
            RuntimeErrorKind::IntegerOverflow,
            SourceLocation {
                source: "token".to_owned(),
                line: 12,
            },
        ));
        assert_eq!(err.to_string(), "RuntimeError: integer overflow (token:12)");
    }
}
