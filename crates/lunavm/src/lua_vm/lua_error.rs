use smol_str::SmolStr;
use thiserror::Error;

use crate::lua_value::{LuaValue, TableError};

pub type LuaResult<T> = Result<T, LuaError>;

/// Classification of recoverable script errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeErrorKind {
    BadArgument,
    NotIndexable,
    Arithmetic,
    NotCallable,
    LoopInIndex,
    LoopInNewIndex,
    Compare,
    InvalidKey,
    CrossScriptLinkage,
    CannotYieldMain,
    YieldAcrossHostBoundary,
    CoroutineState,
    StackOverflow,
    /// Raised by script code through `error(...)`.
    User,
}

/// A recoverable error; `pcall`/`xpcall` handlers receive it as a value.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    /// Bare message without location.
    pub message: String,
    /// Message after location prefixing and pre-unwind decoration.
    pub decorated: Option<String>,
    /// Error object for `error(value)` with a non-string value.
    pub value: Option<LuaValue>,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            decorated: None,
            value: None,
        }
    }

    /// Error raised by `error(value)`. String values get a location prefix
    /// during unwinding; any other value travels untouched.
    pub fn user(value: LuaValue) -> Self {
        match value {
            LuaValue::String(text) => Self::new(RuntimeErrorKind::User, text.as_str()),
            value => {
                let message = format!("(error object is a {} value)", value.type_name());
                Self {
                    kind: RuntimeErrorKind::User,
                    message,
                    decorated: None,
                    value: Some(value),
                }
            }
        }
    }

    pub fn display_message(&self) -> &str {
        self.decorated.as_deref().unwrap_or(&self.message)
    }

    /// Value handed to error handlers: the error object when one was raised,
    /// otherwise the (decorated) message string.
    pub fn handler_value(&self) -> LuaValue {
        match &self.value {
            Some(value) => value.clone(),
            None => LuaValue::String(SmolStr::new(self.display_message())),
        }
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_message())
    }
}

impl std::error::Error for RuntimeError {}

/// Failure to load a binary chunk.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkLoadError {
    #[error("not a precompiled chunk")]
    NotAChunk,
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u8, found: u8 },
    #[error("truncated precompiled chunk")]
    Truncated,
    #[error("malformed precompiled chunk: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error)]
pub enum LuaError {
    #[error("{0}")]
    Runtime(Box<RuntimeError>),
    /// Invariant violation inside the VM; never caught by script handlers.
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Chunk(#[from] ChunkLoadError),
}

impl LuaError {
    pub fn runtime(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        LuaError::Runtime(Box::new(RuntimeError::new(kind, message)))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        LuaError::Internal(message.into())
    }

    pub fn kind(&self) -> Option<RuntimeErrorKind> {
        match self {
            LuaError::Runtime(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn is_runtime(&self) -> bool {
        matches!(self, LuaError::Runtime(_))
    }
}

impl From<RuntimeError> for LuaError {
    fn from(value: RuntimeError) -> Self {
        LuaError::Runtime(Box::new(value))
    }
}

impl From<TableError> for LuaError {
    fn from(value: TableError) -> Self {
        let kind = match value {
            TableError::NilKey | TableError::NaNKey => RuntimeErrorKind::InvalidKey,
            TableError::CrossScriptLinkage => RuntimeErrorKind::CrossScriptLinkage,
        };
        LuaError::runtime(kind, value.to_string())
    }
}
