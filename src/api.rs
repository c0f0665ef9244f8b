#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
use crate::sys::*;
use libloading::{Library, Symbol};
use std::os::raw::{c_char, c_int, c_void};

pub struct Api {
    pub wbem_string_free: unsafe extern "C" fn(*mut c_char),
    pub wbem_variant_clear: unsafe extern "C" fn(*mut wbem_variant),
    pub wbem_locator_create:
        unsafe extern "C" fn(*mut *mut wbem_locator, *mut *mut c_char) -> wbem_hresult,
    pub wbem_locator_release: unsafe extern "C" fn(*mut wbem_locator),
    pub wbem_connect: unsafe extern "C" fn(
        *mut wbem_locator,
        *const c_char, // network resource
        *const c_char, // user (nullable)
        *const c_char, // password (nullable)
        *const c_char, // locale (nullable)
        *const c_char, // authority (nullable)
        *mut *mut wbem_services,
        *mut *mut c_char,
    ) -> wbem_hresult,
    pub wbem_services_release: unsafe extern "C" fn(*mut wbem_services),
    pub wbem_exec_query: unsafe extern "C" fn(
        *mut wbem_services,
        *const c_char,
        c_int,
        *mut *mut wbem_enum,
        *mut *mut c_char,
    ) -> wbem_hresult,
    pub wbem_enum_next: unsafe extern "C" fn(
        *mut wbem_enum,
        *mut *mut wbem_object,
        *mut c_int,
        *mut *mut c_char,
    ) -> wbem_hresult,
    pub wbem_enum_release: unsafe extern "C" fn(*mut wbem_enum),
    pub wbem_exec_query_async: unsafe extern "C" fn(
        *mut wbem_services,
        *const c_char,
        c_int,
        *const wbem_sink_vtbl,
        *mut c_void,
        *mut *mut c_char,
    ) -> wbem_hresult,
    pub wbem_cancel_async_call:
        unsafe extern "C" fn(*mut wbem_services, *mut c_void, *mut *mut c_char) -> wbem_hresult,
    pub wbem_object_addref: unsafe extern "C" fn(*mut wbem_object),
    pub wbem_object_release: unsafe extern "C" fn(*mut wbem_object),
    pub wbem_object_class_name: unsafe extern "C" fn(
        *mut wbem_object,
        *mut *mut c_char,
        *mut *mut c_char,
    ) -> wbem_hresult,
    pub wbem_object_property_count: unsafe extern "C" fn(*mut wbem_object) -> usize,
    pub wbem_object_property_at: unsafe extern "C" fn(
        *mut wbem_object,
        usize,
        *mut wbem_strview,
        *mut c_int,
        *mut wbem_variant,
        *mut *mut c_char,
    ) -> wbem_hresult,
    pub wbem_object_get: unsafe extern "C" fn(
        *mut wbem_object,
        *const c_char,
        *mut c_int,
        *mut wbem_variant,
        *mut *mut c_char,
    ) -> wbem_hresult,
    pub wbem_object_put: unsafe extern "C" fn(
        *mut wbem_object,
        *const c_char,
        *const wbem_variant,
        *mut *mut c_char,
    ) -> wbem_hresult,
    pub wbem_object_method_count: unsafe extern "C" fn(*mut wbem_object) -> usize,
    pub wbem_object_method_at: unsafe extern "C" fn(
        *mut wbem_object,
        usize,
        *mut wbem_strview,
        *mut *mut wbem_object,
        *mut *mut wbem_object,
        *mut *mut c_char,
    ) -> wbem_hresult,
    pub wbem_object_text: unsafe extern "C" fn(
        *mut wbem_object,
        *mut *mut c_char,
        *mut *mut c_char,
    ) -> wbem_hresult,
}

impl Api {
    pub unsafe fn load(lib: &Library) -> Result<Self, libloading::Error> {
        unsafe fn get<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T, libloading::Error> {
            let sym: Symbol<T> = lib.get::<T>(name)?;
            Ok(*sym)
        }
        Ok(Self {
            wbem_string_free: get(lib, concat!(stringify!(wbem_string_free), "\0").as_bytes())?,
            wbem_variant_clear: get(
                lib,
                concat!(stringify!(wbem_variant_clear), "\0").as_bytes(),
            )?,
            wbem_locator_create: get(
                lib,
                concat!(stringify!(wbem_locator_create), "\0").as_bytes(),
            )?,
            wbem_locator_release: get(
                lib,
                concat!(stringify!(wbem_locator_release), "\0").as_bytes(),
            )?,
            wbem_connect: get(lib, concat!(stringify!(wbem_connect), "\0").as_bytes())?,
            wbem_services_release: get(
                lib,
                concat!(stringify!(wbem_services_release), "\0").as_bytes(),
            )?,
            wbem_exec_query: get(lib, concat!(stringify!(wbem_exec_query), "\0").as_bytes())?,
            wbem_enum_next: get(lib, concat!(stringify!(wbem_enum_next), "\0").as_bytes())?,
            wbem_enum_release: get(
                lib,
                concat!(stringify!(wbem_enum_release), "\0").as_bytes(),
            )?,
            wbem_exec_query_async: get(
                lib,
                concat!(stringify!(wbem_exec_query_async), "\0").as_bytes(),
            )?,
            wbem_cancel_async_call: get(
                lib,
                concat!(stringify!(wbem_cancel_async_call), "\0").as_bytes(),
            )?,
            wbem_object_addref: get(
                lib,
                concat!(stringify!(wbem_object_addref), "\0").as_bytes(),
            )?,
            wbem_object_release: get(
                lib,
                concat!(stringify!(wbem_object_release), "\0").as_bytes(),
            )?,
            wbem_object_class_name: get(
                lib,
                concat!(stringify!(wbem_object_class_name), "\0").as_bytes(),
            )?,
            wbem_object_property_count: get(
                lib,
                concat!(stringify!(wbem_object_property_count), "\0").as_bytes(),
            )?,
            wbem_object_property_at: get(
                lib,
                concat!(stringify!(wbem_object_property_at), "\0").as_bytes(),
            )?,
            wbem_object_get: get(lib, concat!(stringify!(wbem_object_get), "\0").as_bytes())?,
            wbem_object_put: get(lib, concat!(stringify!(wbem_object_put), "\0").as_bytes())?,
            wbem_object_method_count: get(
                lib,
                concat!(stringify!(wbem_object_method_count), "\0").as_bytes(),
            )?,
            wbem_object_method_at: get(
                lib,
                concat!(stringify!(wbem_object_method_at), "\0").as_bytes(),
            )?,
            wbem_object_text: get(lib, concat!(stringify!(wbem_object_text), "\0").as_bytes())?,
        })
    }
}
