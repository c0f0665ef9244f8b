#![allow(unsafe_code)]
//! Bridge between a managed runtime and a WBEM-style management provider.
//!
//! The managed side is reached through [`ManagedVm`]/[`ManagedEnv`], the provider through
//! the traits in [`provider`]. [`Bridge`] owns the metadata cache, the session and object
//! registries, and implements the operations the managed service classes call.

mod api;
mod sys;

pub mod bridge;
pub mod log;
pub mod managed;
pub mod marshal;
pub mod metadata;
pub mod native;
pub mod object;
pub mod provider;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod sink;
pub mod value;

pub use bridge::{attach, current, detach, Bridge, BridgeOptions};
pub use log::{LogLevel, Logger, NoOpLogger, TracingLogger};
pub use managed::{AttachGuard, ClassRef, FieldId, JValue, ManagedEnv, ManagedVm, MethodId, ObjectRef};
pub use marshal::Marshaller;
pub use metadata::MetaData;
pub use native::NativeProvider;
pub use object::ObjectRegistry;
pub use provider::{
    ConnectParams, Locator, NativeMethod, NativeObject, NativeProperty, NativeSink,
    ObjectEnumerator, Provider, ProviderConnection, QueryMode,
};
pub use registry::{HandleTable, SessionRegistry};
pub use session::{Session, SessionState};
pub use sink::EventSink;
pub use value::{TaggedValue, ValueType, VarKind};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The managed runtime or the provider shim is missing something the bridge needs.
    #[error("environment integrity failure: {0}")]
    EnvironmentIntegrity(String),

    #[error("connection failed (code {code:#010x}): {message}")]
    Connection { code: i32, message: String },

    #[error("query failed (code {code:#010x}): {message}")]
    Query { code: i32, message: String },

    #[error("marshalling failed: {0}")]
    Marshal(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Raw provider failure, before a session classifies it.
    #[error("provider error (code {code:#010x}): {message}")]
    Provider { code: i32, message: String },

    #[error("managed runtime error: {0}")]
    Managed(String),
}

impl Error {
    /// Native result code, when the failure came from the provider.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Connection { code, .. }
            | Error::Query { code, .. }
            | Error::Provider { code, .. } => Some(*code),
            _ => None,
        }
    }
}
