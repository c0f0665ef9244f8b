//! Downward contract: what the bridge needs from a management provider.
//!
//! The native shim in [`crate::native`] implements these traits over the C ABI; anything
//! else that can enumerate objects and call back a sink can stand in for it.

use std::sync::Arc;

use crate::{value::TaggedValue, Result};

/// Provider result codes (HRESULT layout).
pub mod codes {
    pub const WBEM_S_NO_ERROR: i32 = 0;
    pub const WBEM_S_FALSE: i32 = 1;
    pub const WBEM_E_FAILED: i32 = 0x8004_1001_u32 as i32;
    pub const WBEM_E_NOT_FOUND: i32 = 0x8004_1002_u32 as i32;
    pub const WBEM_E_ACCESS_DENIED: i32 = 0x8004_1003_u32 as i32;
    pub const WBEM_E_TYPE_MISMATCH: i32 = 0x8004_1005_u32 as i32;
    pub const WBEM_E_INVALID_PARAMETER: i32 = 0x8004_1008_u32 as i32;
    pub const WBEM_E_INVALID_QUERY: i32 = 0x8004_1017_u32 as i32;
    pub const WBEM_E_CALL_CANCELLED: i32 = 0x8004_1032_u32 as i32;
    pub const WBEM_E_SHUTTING_DOWN: i32 = 0x8004_1033_u32 as i32;
    pub const DISP_E_BADVARTYPE: i32 = 0x8002_0008_u32 as i32;
    pub const RPC_S_SERVER_UNAVAILABLE: i32 = 0x8007_06BA_u32 as i32;

    pub fn succeeded(code: i32) -> bool {
        code >= 0
    }
}

/// Sink status flags passed to [`NativeSink::set_status`].
pub mod status {
    pub const WBEM_STATUS_COMPLETE: i32 = 0;
    pub const WBEM_STATUS_REQUIREMENTS: i32 = 1;
    pub const WBEM_STATUS_PROGRESS: i32 = 2;

    pub fn is_terminal(flags: i32) -> bool {
        flags == WBEM_STATUS_COMPLETE
    }
}

/// Connection target and credentials.
///
/// Empty strings mean "not given": an empty user/password connects with the caller's
/// identity, an empty host targets the local machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub domain: String,
    pub host: String,
    pub user: String,
    pub password: String,
    pub locale: String,
    pub resource: String,
}

impl ConnectParams {
    /// Full namespace path, `\\host\namespace` when a host is given.
    pub fn network_resource(&self) -> String {
        let resource = self.resource.trim_start_matches('\\');
        if self.host.is_empty() {
            resource.to_string()
        } else {
            format!("\\\\{}\\{}", self.host, resource)
        }
    }

    /// NTLM authority string, `None` without a domain.
    pub fn authority(&self) -> Option<String> {
        (!self.domain.is_empty()).then(|| format!("ntlmdomain:{}", self.domain))
    }

    pub fn user(&self) -> Option<&str> {
        non_empty(&self.user)
    }

    pub fn password(&self) -> Option<&str> {
        non_empty(&self.password)
    }

    pub fn locale(&self) -> Option<&str> {
        non_empty(&self.locale)
    }
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.is_empty()).then_some(s)
}

/// How a synchronous query hands its results back.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueryMode {
    /// The provider call blocks until the whole result set is ready.
    Synchronous,
    /// The provider call returns at once; enumeration blocks per object.
    SemiSynchronous,
}

/// A named, typed property as enumerated from a provider object.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeProperty {
    pub name: String,
    pub cim_type: i32,
    pub value: TaggedValue,
}

/// A method descriptor with its parameter signature objects.
#[derive(Clone)]
pub struct NativeMethod {
    pub name: String,
    pub in_signature: Option<Arc<dyn NativeObject>>,
    pub out_signature: Option<Arc<dyn NativeObject>>,
}

impl std::fmt::Debug for NativeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeMethod")
            .field("name", &self.name)
            .field("in_signature", &self.in_signature.is_some())
            .field("out_signature", &self.out_signature.is_some())
            .finish()
    }
}

/// A provider object: a property bag plus a method bag.
///
/// Enumeration order is whatever the provider reports; callers keep it.
pub trait NativeObject: Send + Sync {
    fn class_name(&self) -> String;
    fn properties(&self) -> Result<Vec<NativeProperty>>;
    fn property(&self, name: &str) -> Result<NativeProperty>;
    fn put_property(&self, name: &str, value: &TaggedValue) -> Result<()>;
    fn methods(&self) -> Result<Vec<NativeMethod>>;
    fn object_text(&self) -> Result<String>;

    /// Lets a provider recover its own concrete type when an object is handed back to it.
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        None
    }
}

/// Receiver of asynchronous results. Called from provider-owned threads.
///
/// Implementations must not panic across this boundary; the return value is the status
/// code handed back to the provider.
pub trait NativeSink: Send + Sync {
    fn indicate(&self, objects: &[Arc<dyn NativeObject>]) -> i32;
    fn set_status(
        &self,
        flags: i32,
        result: i32,
        param: Option<&str>,
        object: Option<Arc<dyn NativeObject>>,
    ) -> i32;
}

/// Forward-only enumerator over a synchronous result set.
pub trait ObjectEnumerator: Send {
    fn next(&mut self) -> Result<Option<Arc<dyn NativeObject>>>;
}

/// Live connection to a provider namespace.
pub trait ProviderConnection: Send + Sync {
    fn exec_query(&self, query: &str, mode: QueryMode) -> Result<Box<dyn ObjectEnumerator>>;

    /// Starts an asynchronous query. Results arrive through `sink` until a terminal
    /// `set_status`. Each call is its own provider call context.
    fn exec_query_async(&self, query: &str, send_status: bool, sink: Arc<dyn NativeSink>)
        -> Result<()>;

    /// Requests cancellation of the call that was started with `sink`.
    fn cancel_async_call(&self, sink: &Arc<dyn NativeSink>) -> Result<()>;
}

/// Connection factory for one session.
pub trait Locator: Send + Sync {
    fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn ProviderConnection>>;
}

/// Entry point into a provider implementation.
pub trait Provider: Send + Sync {
    fn create_locator(&self) -> Result<Arc<dyn Locator>>;
}
