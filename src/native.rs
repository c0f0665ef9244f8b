//! Provider implementation over the C ABI of the provider shim library.
//!
//! All shim objects are reference counted on the shim side; every wrapper here owns exactly
//! one reference and drops it in `Drop`. Strings returned by the shim are freed with
//! `wbem_string_free`, variants with `wbem_variant_clear`.

use std::{
    any::Any,
    ffi::{CStr, CString},
    os::raw::{c_char, c_int, c_void},
    panic::{catch_unwind, AssertUnwindSafe},
    ptr::{self, NonNull},
    sync::Arc,
};

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use parking_lot::Mutex;

use crate::{
    api::Api,
    provider::{
        codes, ConnectParams, Locator, NativeMethod, NativeObject, NativeProperty, NativeSink,
        ObjectEnumerator, Provider, ProviderConnection, QueryMode,
    },
    runtime::runtime,
    sys::{self as ffi, wbem_variant},
    value::{cim, TaggedValue, VarKind},
    Error, Result,
};

unsafe fn take_string(api: &Api, p: *mut c_char) -> String {
    if p.is_null() {
        return String::new();
    }
    let s = CStr::from_ptr(p).to_string_lossy().into_owned();
    (api.wbem_string_free)(p);
    s
}

fn check(api: &Api, hr: ffi::wbem_hresult, err: *mut c_char) -> Result<()> {
    if codes::succeeded(hr) {
        if !err.is_null() {
            unsafe { (api.wbem_string_free)(err) };
        }
        Ok(())
    } else {
        let message = unsafe { take_string(api, err) };
        Err(Error::Provider { code: hr, message })
    }
}

fn c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::Marshal(format!("string contains a NUL byte: {s:?}")))
}

fn opt_ptr(s: &Option<CString>) -> *const c_char {
    s.as_ref().map_or(ptr::null(), |s| s.as_ptr())
}

unsafe fn view_to_string(view: ffi::wbem_strview) -> String {
    if view.ptr.is_null() || view.len == 0 {
        return String::new();
    }
    String::from_utf8_lossy(std::slice::from_raw_parts(view.ptr, view.len)).into_owned()
}

// -------------------------- Provider / Locator --------------------------

/// Provider backed by the process-wide shim [`runtime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeProvider;

impl NativeProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Provider for NativeProvider {
    fn create_locator(&self) -> Result<Arc<dyn Locator>> {
        let api = &runtime()?.api;
        let mut out: *mut ffi::wbem_locator = ptr::null_mut();
        let mut err: *mut c_char = ptr::null_mut();
        let hr = unsafe { (api.wbem_locator_create)(&mut out, &mut err) };
        check(api, hr, err)?;
        let locator = NonNull::new(out).ok_or_else(|| Error::Provider {
            code: codes::WBEM_E_FAILED,
            message: "shim returned a null locator".into(),
        })?;
        Ok(Arc::new(NativeLocator { api, locator }))
    }
}

struct NativeLocator {
    api: &'static Api,
    locator: NonNull<ffi::wbem_locator>,
}

// The shim's objects are free-threaded.
unsafe impl Send for NativeLocator {}
unsafe impl Sync for NativeLocator {}

impl Locator for NativeLocator {
    fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn ProviderConnection>> {
        let resource = c_string(&params.network_resource())?;
        let user = params.user().map(c_string).transpose()?;
        let password = params.password().map(c_string).transpose()?;
        let locale = params.locale().map(c_string).transpose()?;
        let authority = params.authority().as_deref().map(c_string).transpose()?;

        let mut out: *mut ffi::wbem_services = ptr::null_mut();
        let mut err: *mut c_char = ptr::null_mut();
        let hr = unsafe {
            (self.api.wbem_connect)(
                self.locator.as_ptr(),
                resource.as_ptr(),
                opt_ptr(&user),
                opt_ptr(&password),
                opt_ptr(&locale),
                opt_ptr(&authority),
                &mut out,
                &mut err,
            )
        };
        check(self.api, hr, err)?;
        let services = NonNull::new(out).ok_or_else(|| Error::Provider {
            code: codes::WBEM_E_FAILED,
            message: "shim returned null services".into(),
        })?;
        Ok(Arc::new(NativeServices {
            api: self.api,
            services,
            calls: Arc::new(Mutex::new(Vec::new())),
        }))
    }
}

impl Drop for NativeLocator {
    fn drop(&mut self) {
        unsafe { (self.api.wbem_locator_release)(self.locator.as_ptr()) };
    }
}

// -------------------------- Services --------------------------

/// Outstanding async calls: (sink address, shim context).
type CallTable = Arc<Mutex<Vec<(usize, usize)>>>;

struct NativeServices {
    api: &'static Api,
    services: NonNull<ffi::wbem_services>,
    calls: CallTable,
}

unsafe impl Send for NativeServices {}
unsafe impl Sync for NativeServices {}

fn sink_addr(sink: &Arc<dyn NativeSink>) -> usize {
    Arc::as_ptr(sink) as *const () as usize
}

impl ProviderConnection for NativeServices {
    fn exec_query(&self, query: &str, mode: QueryMode) -> Result<Box<dyn ObjectEnumerator>> {
        let query = c_string(query)?;
        let flags = match mode {
            QueryMode::Synchronous => ffi::WBEM_FLAG_FORWARD_ONLY,
            QueryMode::SemiSynchronous => {
                ffi::WBEM_FLAG_FORWARD_ONLY | ffi::WBEM_FLAG_RETURN_IMMEDIATELY
            }
        };
        let mut out: *mut ffi::wbem_enum = ptr::null_mut();
        let mut err: *mut c_char = ptr::null_mut();
        let hr = unsafe {
            (self.api.wbem_exec_query)(self.services.as_ptr(), query.as_ptr(), flags, &mut out, &mut err)
        };
        check(self.api, hr, err)?;
        Ok(Box::new(NativeEnumerator {
            api: self.api,
            results: NonNull::new(out),
        }))
    }

    fn exec_query_async(
        &self,
        query: &str,
        send_status: bool,
        sink: Arc<dyn NativeSink>,
    ) -> Result<()> {
        let query = c_string(query)?;
        let flags = if send_status {
            ffi::WBEM_FLAG_SEND_STATUS
        } else {
            0
        };
        let addr = sink_addr(&sink);
        let ctx = Box::into_raw(Box::new(CallContext {
            api: self.api,
            sink,
            calls: self.calls.clone(),
        }));
        self.calls.lock().push((addr, ctx as usize));

        let mut err: *mut c_char = ptr::null_mut();
        let hr = unsafe {
            (self.api.wbem_exec_query_async)(
                self.services.as_ptr(),
                query.as_ptr(),
                flags,
                &SINK_VTBL,
                ctx.cast(),
                &mut err,
            )
        };
        if let Err(e) = check(self.api, hr, err) {
            // a refused call never gets a release callback
            self.calls.lock().retain(|&(_, c)| c != ctx as usize);
            drop(unsafe { Box::from_raw(ctx) });
            return Err(e);
        }
        Ok(())
    }

    fn cancel_async_call(&self, sink: &Arc<dyn NativeSink>) -> Result<()> {
        let addr = sink_addr(sink);
        let ctx = self
            .calls
            .lock()
            .iter()
            .find(|&&(a, _)| a == addr)
            .map(|&(_, c)| c);
        let Some(ctx) = ctx else {
            return Err(Error::Provider {
                code: codes::WBEM_E_NOT_FOUND,
                message: "no outstanding call for this sink".into(),
            });
        };
        // ctx is only an identifier to the shim; it may already have completed
        let mut err: *mut c_char = ptr::null_mut();
        let hr = unsafe {
            (self.api.wbem_cancel_async_call)(self.services.as_ptr(), ctx as *mut c_void, &mut err)
        };
        check(self.api, hr, err)
    }
}

impl Drop for NativeServices {
    fn drop(&mut self) {
        unsafe { (self.api.wbem_services_release)(self.services.as_ptr()) };
    }
}

struct NativeEnumerator {
    api: &'static Api,
    results: Option<NonNull<ffi::wbem_enum>>,
}

unsafe impl Send for NativeEnumerator {}

impl ObjectEnumerator for NativeEnumerator {
    fn next(&mut self) -> Result<Option<Arc<dyn NativeObject>>> {
        let Some(results) = self.results else {
            return Ok(None);
        };
        let mut obj: *mut ffi::wbem_object = ptr::null_mut();
        let mut has: c_int = 0;
        let mut err: *mut c_char = ptr::null_mut();
        let hr = unsafe { (self.api.wbem_enum_next)(results.as_ptr(), &mut obj, &mut has, &mut err) };
        check(self.api, hr, err)?;
        if has == 0 {
            if let Some(r) = self.results.take() {
                unsafe { (self.api.wbem_enum_release)(r.as_ptr()) };
            }
            return Ok(None);
        }
        match NativeClassObject::from_owned(self.api, obj) {
            Some(o) => Ok(Some(Arc::new(o))),
            None => Err(Error::Provider {
                code: codes::WBEM_E_FAILED,
                message: "enumerator yielded a null object".into(),
            }),
        }
    }
}

impl Drop for NativeEnumerator {
    fn drop(&mut self) {
        if let Some(r) = self.results.take() {
            unsafe { (self.api.wbem_enum_release)(r.as_ptr()) };
        }
    }
}

// -------------------------- Objects --------------------------

pub(crate) struct NativeClassObject {
    api: &'static Api,
    obj: NonNull<ffi::wbem_object>,
}

unsafe impl Send for NativeClassObject {}
unsafe impl Sync for NativeClassObject {}

impl NativeClassObject {
    /// Takes over a reference the shim handed out.
    fn from_owned(api: &'static Api, obj: *mut ffi::wbem_object) -> Option<Self> {
        NonNull::new(obj).map(|obj| Self { api, obj })
    }

    /// Adds a reference to a borrowed object.
    fn retain(api: &'static Api, obj: *mut ffi::wbem_object) -> Option<Self> {
        let obj = NonNull::new(obj)?;
        unsafe { (api.wbem_object_addref)(obj.as_ptr()) };
        Some(Self { api, obj })
    }

    fn raw(&self) -> *mut ffi::wbem_object {
        self.obj.as_ptr()
    }

    fn wrap_borrowed(&self, obj: *mut ffi::wbem_object) -> Option<Arc<dyn NativeObject>> {
        Self::retain(self.api, obj).map(|o| Arc::new(o) as Arc<dyn NativeObject>)
    }
}

impl NativeObject for NativeClassObject {
    fn class_name(&self) -> String {
        let mut out: *mut c_char = ptr::null_mut();
        let mut err: *mut c_char = ptr::null_mut();
        let hr = unsafe { (self.api.wbem_object_class_name)(self.raw(), &mut out, &mut err) };
        match check(self.api, hr, err) {
            Ok(()) => unsafe { take_string(self.api, out) },
            Err(_) => String::from("<unknown>"),
        }
    }

    fn properties(&self) -> Result<Vec<NativeProperty>> {
        let count = unsafe { (self.api.wbem_object_property_count)(self.raw()) };
        let mut properties = Vec::with_capacity(count);
        for index in 0..count {
            let mut name = ffi::wbem_strview {
                ptr: ptr::null(),
                len: 0,
            };
            let mut cim_type: c_int = 0;
            let mut variant = wbem_variant::empty();
            let mut err: *mut c_char = ptr::null_mut();
            let hr = unsafe {
                (self.api.wbem_object_property_at)(
                    self.raw(),
                    index,
                    &mut name,
                    &mut cim_type,
                    &mut variant,
                    &mut err,
                )
            };
            check(self.api, hr, err)?;
            let name = unsafe { view_to_string(name) };
            let value = unsafe {
                decode_variant(&variant, cim_type, &mut |o: *mut ffi::wbem_object| {
                    self.wrap_borrowed(o)
                })
            };
            unsafe { (self.api.wbem_variant_clear)(&mut variant) };
            properties.push(NativeProperty {
                value: value.map_err(|e| match e {
                    Error::Marshal(m) => Error::Marshal(format!("property '{name}': {m}")),
                    other => other,
                })?,
                name,
                cim_type,
            });
        }
        Ok(properties)
    }

    fn property(&self, name: &str) -> Result<NativeProperty> {
        let c_name = c_string(name)?;
        let mut cim_type: c_int = 0;
        let mut variant = wbem_variant::empty();
        let mut err: *mut c_char = ptr::null_mut();
        let hr = unsafe {
            (self.api.wbem_object_get)(self.raw(), c_name.as_ptr(), &mut cim_type, &mut variant, &mut err)
        };
        check(self.api, hr, err)?;
        let value = unsafe {
            decode_variant(&variant, cim_type, &mut |o: *mut ffi::wbem_object| {
                self.wrap_borrowed(o)
            })
        };
        unsafe { (self.api.wbem_variant_clear)(&mut variant) };
        Ok(NativeProperty {
            name: name.to_string(),
            cim_type,
            value: value?,
        })
    }

    fn put_property(&self, name: &str, value: &TaggedValue) -> Result<()> {
        let c_name = c_string(name)?;
        let encoded = EncodedVariant::new(value)?;
        let mut err: *mut c_char = ptr::null_mut();
        let hr = unsafe {
            (self.api.wbem_object_put)(self.raw(), c_name.as_ptr(), encoded.as_ptr(), &mut err)
        };
        check(self.api, hr, err)
    }

    fn methods(&self) -> Result<Vec<NativeMethod>> {
        let count = unsafe { (self.api.wbem_object_method_count)(self.raw()) };
        let mut methods = Vec::with_capacity(count);
        for index in 0..count {
            let mut name = ffi::wbem_strview {
                ptr: ptr::null(),
                len: 0,
            };
            let mut in_sig: *mut ffi::wbem_object = ptr::null_mut();
            let mut out_sig: *mut ffi::wbem_object = ptr::null_mut();
            let mut err: *mut c_char = ptr::null_mut();
            let hr = unsafe {
                (self.api.wbem_object_method_at)(
                    self.raw(),
                    index,
                    &mut name,
                    &mut in_sig,
                    &mut out_sig,
                    &mut err,
                )
            };
            // take ownership first so the signatures are released on every path
            let in_signature = Self::from_owned(self.api, in_sig)
                .map(|o| Arc::new(o) as Arc<dyn NativeObject>);
            let out_signature = Self::from_owned(self.api, out_sig)
                .map(|o| Arc::new(o) as Arc<dyn NativeObject>);
            check(self.api, hr, err)?;
            methods.push(NativeMethod {
                name: unsafe { view_to_string(name) },
                in_signature,
                out_signature,
            });
        }
        Ok(methods)
    }

    fn object_text(&self) -> Result<String> {
        let mut out: *mut c_char = ptr::null_mut();
        let mut err: *mut c_char = ptr::null_mut();
        let hr = unsafe { (self.api.wbem_object_text)(self.raw(), &mut out, &mut err) };
        check(self.api, hr, err)?;
        Ok(unsafe { take_string(self.api, out) })
    }

    fn as_any(&self) -> Option<&dyn Any> {
        Some(self)
    }
}

impl Drop for NativeClassObject {
    fn drop(&mut self) {
        unsafe { (self.api.wbem_object_release)(self.raw()) };
    }
}

// -------------------------- Variants --------------------------

const MS_PER_DAY: i64 = 86_400_000;

fn ole_epoch() -> DateTime<Utc> {
    // 1899-12-30T00:00:00Z is -2_209_161_600 s from the Unix epoch
    Utc.timestamp_opt(-2_209_161_600, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// OLE automation date (days since 1899-12-30; before the epoch the fraction counts
/// forward from the whole day) to UTC.
pub(crate) fn date_from_ole(days: f64) -> Result<DateTime<Utc>> {
    if !days.is_finite() || days.abs() > 3.0e6 {
        return Err(Error::Marshal(format!("OLE date out of range: {days}")));
    }
    let whole = days.trunc();
    let frac = (days - whole).abs();
    let ms = whole as i64 * MS_PER_DAY + (frac * MS_PER_DAY as f64).round() as i64;
    TimeDelta::try_milliseconds(ms)
        .and_then(|d| ole_epoch().checked_add_signed(d))
        .ok_or_else(|| Error::Marshal(format!("OLE date out of range: {days}")))
}

pub(crate) fn date_to_ole(date: &DateTime<Utc>) -> f64 {
    let ms = date.timestamp_millis() - ole_epoch().timestamp_millis();
    let day = ms.div_euclid(MS_PER_DAY);
    let time = ms.rem_euclid(MS_PER_DAY) as f64 / MS_PER_DAY as f64;
    if day >= 0 {
        day as f64 + time
    } else {
        day as f64 - time
    }
}

fn scalar_kind(vt: u16) -> Result<VarKind> {
    Ok(match vt {
        ffi::VT_I1 | ffi::VT_UI1 => VarKind::Byte,
        ffi::VT_I2 => VarKind::Short,
        ffi::VT_I4 | ffi::VT_UI2 => VarKind::Int,
        ffi::VT_I8 | ffi::VT_UI4 => VarKind::Long,
        ffi::VT_R4 => VarKind::Float,
        ffi::VT_R8 => VarKind::Double,
        ffi::VT_BOOL => VarKind::Boolean,
        ffi::VT_BSTR | ffi::VT_UI8 => VarKind::String,
        ffi::VT_DATE => VarKind::Date,
        ffi::VT_UNKNOWN => VarKind::Object,
        other => return Err(bad_tag(other)),
    })
}

fn bad_tag(vt: u16) -> Error {
    Error::Marshal(format!(
        "unsupported variant type {vt:#06x} (code {:#010x})",
        codes::DISP_E_BADVARTYPE
    ))
}

/// Decodes a shim variant. Embedded objects are handed to `wrap`, which must take its own
/// reference.
///
/// `cim_type` is the declared type of the property the variant was read from, or `0` when
/// unknown. 16-bit tags of a `CHAR16` property decode as [`TaggedValue::Char`].
///
/// # Safety
///
/// `v` must be a variant filled in by the shim and not yet cleared.
pub(crate) unsafe fn decode_variant(
    v: &wbem_variant,
    cim_type: c_int,
    wrap: &mut dyn FnMut(*mut ffi::wbem_object) -> Option<Arc<dyn NativeObject>>,
) -> Result<TaggedValue> {
    let char16 = cim_type & !cim::CIM_FLAG_ARRAY == cim::CIM_CHAR16;
    if v.vt & ffi::VT_ARRAY == 0 {
        return decode_scalar(v, char16, wrap);
    }
    let base = v.vt & !ffi::VT_ARRAY;
    let kind = if char16 && is_16bit(base) {
        VarKind::Char
    } else {
        scalar_kind(base)?
    };
    let raw = if v.items.is_null() || v.count == 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(v.items, v.count)
    };
    let mut items = Vec::with_capacity(raw.len());
    for (i, item) in raw.iter().enumerate() {
        if item.vt != base && item.vt != ffi::VT_NULL && item.vt != ffi::VT_EMPTY {
            return Err(Error::Marshal(format!(
                "array element {i} has type {:#06x}, array is {base:#06x}",
                item.vt
            )));
        }
        items.push(decode_scalar(item, char16, wrap)?);
    }
    Ok(TaggedValue::Array { kind, items })
}

fn is_16bit(vt: u16) -> bool {
    vt == ffi::VT_I2 || vt == ffi::VT_UI2
}

unsafe fn decode_scalar(
    v: &wbem_variant,
    char16: bool,
    wrap: &mut dyn FnMut(*mut ffi::wbem_object) -> Option<Arc<dyn NativeObject>>,
) -> Result<TaggedValue> {
    Ok(match v.vt {
        ffi::VT_EMPTY | ffi::VT_NULL => TaggedValue::Null,
        vt if char16 && is_16bit(vt) => TaggedValue::Char(v.i64_ as u16),
        ffi::VT_I1 | ffi::VT_UI1 => TaggedValue::Byte(v.i64_ as u8),
        ffi::VT_I2 => TaggedValue::Short(v.i64_ as i16),
        ffi::VT_UI2 => TaggedValue::Int(v.i64_ as u16 as i32),
        ffi::VT_I4 => TaggedValue::Int(v.i64_ as i32),
        ffi::VT_UI4 => TaggedValue::Long(v.i64_ as u32 as i64),
        ffi::VT_I8 => TaggedValue::Long(v.i64_),
        ffi::VT_UI8 => TaggedValue::String((v.i64_ as u64).to_string()),
        ffi::VT_R4 => TaggedValue::Float(v.f64_ as f32),
        ffi::VT_R8 => TaggedValue::Double(v.f64_),
        ffi::VT_BOOL => TaggedValue::Boolean(v.i64_ != 0),
        ffi::VT_DATE => TaggedValue::Date(date_from_ole(v.f64_)?),
        ffi::VT_BSTR => TaggedValue::String(view_to_string(ffi::wbem_strview {
            ptr: v.ptr,
            len: v.len,
        })),
        ffi::VT_UNKNOWN => match wrap(v.obj) {
            Some(o) => TaggedValue::Object(o),
            None => TaggedValue::Null,
        },
        other => return Err(bad_tag(other)),
    })
}

/// A variant built from a [`TaggedValue`] together with the buffers it points into.
pub(crate) struct EncodedVariant {
    root: wbem_variant,
    _items: Vec<wbem_variant>,
    _strings: Vec<String>,
}

impl EncodedVariant {
    pub(crate) fn new(value: &TaggedValue) -> Result<Self> {
        let mut strings = Vec::new();
        let (root, items) = match value {
            TaggedValue::Array { kind, items } => {
                let base = vt_of(*kind);
                let mut encoded = Vec::with_capacity(items.len());
                for item in items {
                    encoded.push(encode_scalar(item, &mut strings)?);
                }
                let mut root = wbem_variant::empty();
                root.vt = ffi::VT_ARRAY | base;
                root.count = encoded.len();
                root.items = encoded.as_mut_ptr();
                (root, encoded)
            }
            scalar => (encode_scalar(scalar, &mut strings)?, Vec::new()),
        };
        Ok(Self {
            root,
            _items: items,
            _strings: strings,
        })
    }

    pub(crate) fn as_ptr(&self) -> *const wbem_variant {
        &self.root
    }

    #[cfg(test)]
    pub(crate) fn root(&self) -> &wbem_variant {
        &self.root
    }
}

fn vt_of(kind: VarKind) -> u16 {
    match kind {
        VarKind::Byte => ffi::VT_UI1,
        VarKind::Char => ffi::VT_UI2,
        VarKind::Boolean => ffi::VT_BOOL,
        VarKind::Short => ffi::VT_I2,
        VarKind::Int => ffi::VT_I4,
        VarKind::Long => ffi::VT_I8,
        VarKind::Float => ffi::VT_R4,
        VarKind::Double => ffi::VT_R8,
        VarKind::String => ffi::VT_BSTR,
        VarKind::Date => ffi::VT_DATE,
        VarKind::Object => ffi::VT_UNKNOWN,
    }
}

fn encode_scalar(value: &TaggedValue, strings: &mut Vec<String>) -> Result<wbem_variant> {
    let mut v = wbem_variant::empty();
    match value {
        TaggedValue::Null => v.vt = ffi::VT_NULL,
        TaggedValue::Byte(x) => {
            v.vt = ffi::VT_UI1;
            v.i64_ = *x as i64;
        }
        TaggedValue::Char(x) => {
            v.vt = ffi::VT_UI2;
            v.i64_ = *x as i64;
        }
        TaggedValue::Boolean(x) => {
            v.vt = ffi::VT_BOOL;
            v.i64_ = if *x { -1 } else { 0 };
        }
        TaggedValue::Short(x) => {
            v.vt = ffi::VT_I2;
            v.i64_ = *x as i64;
        }
        TaggedValue::Int(x) => {
            v.vt = ffi::VT_I4;
            v.i64_ = *x as i64;
        }
        TaggedValue::Long(x) => {
            v.vt = ffi::VT_I8;
            v.i64_ = *x;
        }
        TaggedValue::Float(x) => {
            v.vt = ffi::VT_R4;
            v.f64_ = *x as f64;
        }
        TaggedValue::Double(x) => {
            v.vt = ffi::VT_R8;
            v.f64_ = *x;
        }
        TaggedValue::Date(d) => {
            v.vt = ffi::VT_DATE;
            v.f64_ = date_to_ole(d);
        }
        TaggedValue::String(s) => {
            // the heap buffer stays put when `strings` grows
            let kept = s.clone();
            v.vt = ffi::VT_BSTR;
            v.ptr = kept.as_ptr();
            v.len = kept.len();
            strings.push(kept);
        }
        TaggedValue::Object(o) => {
            let native = o
                .as_any()
                .and_then(|a| a.downcast_ref::<NativeClassObject>())
                .ok_or_else(|| {
                    Error::Marshal(format!(
                        "object of class '{}' does not belong to this provider",
                        o.class_name()
                    ))
                })?;
            v.vt = ffi::VT_UNKNOWN;
            v.obj = native.raw();
        }
        TaggedValue::Array { .. } => {
            return Err(Error::Marshal("nested arrays are not supported".into()))
        }
    }
    Ok(v)
}

// -------------------------- Async trampolines --------------------------

struct CallContext {
    api: &'static Api,
    sink: Arc<dyn NativeSink>,
    calls: CallTable,
}

static SINK_VTBL: ffi::wbem_sink_vtbl = ffi::wbem_sink_vtbl {
    indicate: sink_indicate,
    set_status: sink_set_status,
    release: sink_release,
};

unsafe extern "C" fn sink_indicate(
    ctx: *mut c_void,
    objects: *const *mut ffi::wbem_object,
    count: usize,
) -> ffi::wbem_hresult {
    catch_unwind(AssertUnwindSafe(|| {
        let call = &*(ctx as *const CallContext);
        let raw = if objects.is_null() || count == 0 {
            &[][..]
        } else {
            std::slice::from_raw_parts(objects, count)
        };
        let batch: Vec<Arc<dyn NativeObject>> = raw
            .iter()
            .filter_map(|&o| NativeClassObject::retain(call.api, o))
            .map(|o| Arc::new(o) as Arc<dyn NativeObject>)
            .collect();
        call.sink.indicate(&batch)
    }))
    .unwrap_or(codes::WBEM_E_FAILED)
}

unsafe extern "C" fn sink_set_status(
    ctx: *mut c_void,
    flags: c_int,
    result: ffi::wbem_hresult,
    param: *const c_char,
    object: *mut ffi::wbem_object,
) -> ffi::wbem_hresult {
    catch_unwind(AssertUnwindSafe(|| {
        let call = &*(ctx as *const CallContext);
        let param = (!param.is_null()).then(|| CStr::from_ptr(param).to_string_lossy().into_owned());
        let object = NativeClassObject::retain(call.api, object)
            .map(|o| Arc::new(o) as Arc<dyn NativeObject>);
        call.sink.set_status(flags, result, param.as_deref(), object)
    }))
    .unwrap_or(codes::WBEM_E_FAILED)
}

unsafe extern "C" fn sink_release(ctx: *mut c_void) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let call = Box::from_raw(ctx as *mut CallContext);
        call.calls.lock().retain(|&(_, c)| c != ctx as usize);
        drop(call);
    }));
}
