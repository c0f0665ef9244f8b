#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]
use std::os::raw::{c_char, c_int, c_void};

/// Result code returned by every shim entry point (HRESULT layout).
pub type wbem_hresult = i32;

/// VARIANT type tags understood by the shim.
pub const VT_EMPTY: u16 = 0;
pub const VT_NULL: u16 = 1;
pub const VT_I2: u16 = 2;
pub const VT_I4: u16 = 3;
pub const VT_R4: u16 = 4;
pub const VT_R8: u16 = 5;
pub const VT_DATE: u16 = 7;
pub const VT_BSTR: u16 = 8;
pub const VT_BOOL: u16 = 11;
pub const VT_UNKNOWN: u16 = 13;
pub const VT_I1: u16 = 16;
pub const VT_UI1: u16 = 17;
pub const VT_UI2: u16 = 18;
pub const VT_UI4: u16 = 19;
pub const VT_I8: u16 = 20;
pub const VT_UI8: u16 = 21;
pub const VT_ARRAY: u16 = 0x2000;

/// Query flags for `wbem_exec_query`.
pub const WBEM_FLAG_RETURN_IMMEDIATELY: c_int = 0x10;
pub const WBEM_FLAG_FORWARD_ONLY: c_int = 0x20;
/// Async flag for `wbem_exec_query_async`.
pub const WBEM_FLAG_SEND_STATUS: c_int = 0x80;

/// A single tagged value.
///
/// - Integer and boolean tags use `i64_` (`VT_BOOL`: `0` or `-1`).
/// - `VT_R4`, `VT_R8` and `VT_DATE` use `f64_`; dates are OLE automation dates.
/// - `VT_BSTR` points at UTF-8 bytes through `ptr`/`len` (not NUL-terminated).
/// - `VT_UNKNOWN` carries a borrowed `obj`; AddRef it to keep it.
/// - With the `VT_ARRAY` bit set, `items`/`count` hold the elements, each tagged
///   with the base type.
///
/// Variants returned by the shim own their buffers until `wbem_variant_clear`.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct wbem_variant {
    pub vt: u16,
    pub i64_: i64,
    pub f64_: f64,
    pub ptr: *const u8,
    pub len: usize,
    pub obj: *mut wbem_object,
    pub items: *mut wbem_variant,
    pub count: usize,
}

impl wbem_variant {
    pub const fn empty() -> Self {
        Self {
            vt: VT_EMPTY,
            i64_: 0,
            f64_: 0.0,
            ptr: std::ptr::null(),
            len: 0,
            obj: std::ptr::null_mut(),
            items: std::ptr::null_mut(),
            count: 0,
        }
    }
}

/// Borrowed byte slice view (not NUL-terminated).
#[repr(C)]
#[derive(Copy, Clone)]
pub struct wbem_strview {
    pub ptr: *const u8,
    pub len: usize,
}

/// Callback table handed to `wbem_exec_query_async`.
///
/// The shim may call `indicate` and `set_status` from any of its own threads. It
/// calls `release` exactly once, after the last callback for `ctx`.
#[repr(C)]
pub struct wbem_sink_vtbl {
    pub indicate: unsafe extern "C" fn(
        ctx: *mut c_void,
        objects: *const *mut wbem_object,
        count: usize,
    ) -> wbem_hresult,
    pub set_status: unsafe extern "C" fn(
        ctx: *mut c_void,
        flags: c_int,
        result: wbem_hresult,
        param: *const c_char,
        object: *mut wbem_object,
    ) -> wbem_hresult,
    pub release: unsafe extern "C" fn(ctx: *mut c_void),
}

#[repr(C)]
pub struct wbem_locator {
    _private: [u8; 0],
}
#[repr(C)]
pub struct wbem_services {
    _private: [u8; 0],
}
#[repr(C)]
pub struct wbem_enum {
    _private: [u8; 0],
}
#[repr(C)]
pub struct wbem_object {
    _private: [u8; 0],
}
