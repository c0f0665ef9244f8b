//! Upward contract: the managed runtime as the bridge sees it.
//!
//! The surface is reflection-shaped: classes, method and field ids looked up by name and
//! signature, boxed arguments. It maps one-to-one onto an embedding API such as JNI.
//! Every [`ManagedEnv`] call is only valid on a thread attached to the runtime.

use std::num::NonZeroU64;

use crate::Result;

macro_rules! opaque_handle {
    ($(#[$m:meta])* $name:ident) => {
        $(#[$m])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// `None` for the null handle.
            pub fn from_raw(raw: u64) -> Option<Self> {
                NonZeroU64::new(raw).map(Self)
            }

            pub fn as_raw(self) -> u64 {
                self.0.get()
            }
        }
    };
}

opaque_handle!(
    /// Reference to a managed object. Managed null is `Option::<ObjectRef>::None`.
    ObjectRef
);
opaque_handle!(
    /// Reference to a managed type descriptor.
    ClassRef
);
opaque_handle!(MethodId);
opaque_handle!(FieldId);

/// Argument or result of a managed call.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum JValue {
    Void,
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(Option<ObjectRef>),
}

impl JValue {
    pub fn null() -> Self {
        JValue::Object(None)
    }

    pub fn object(obj: ObjectRef) -> Self {
        JValue::Object(Some(obj))
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            JValue::Boolean(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(self) -> Option<i32> {
        match self {
            JValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_long(self) -> Option<i64> {
        match self {
            JValue::Long(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(self) -> Option<Option<ObjectRef>> {
        match self {
            JValue::Object(v) => Some(v),
            _ => None,
        }
    }
}

/// Per-thread view of the managed runtime.
///
/// Failures raised by the runtime itself (pending exceptions, bad handles) come back as
/// [`crate::Error::Managed`].
pub trait ManagedEnv {
    fn find_class(&self, name: &str) -> Result<Option<ClassRef>>;
    /// Drops a class reference handed out by [`ManagedEnv::find_class`].
    fn release_class(&self, class: ClassRef);
    fn method_id(&self, class: ClassRef, name: &str, sig: &str) -> Result<Option<MethodId>>;
    fn static_method_id(&self, class: ClassRef, name: &str, sig: &str)
        -> Result<Option<MethodId>>;
    fn field_id(&self, class: ClassRef, name: &str, sig: &str) -> Result<Option<FieldId>>;

    fn new_object(&self, class: ClassRef, ctor: MethodId, args: &[JValue]) -> Result<ObjectRef>;
    fn call_method(&self, obj: ObjectRef, method: MethodId, args: &[JValue]) -> Result<JValue>;
    fn call_static_method(&self, class: ClassRef, method: MethodId, args: &[JValue])
        -> Result<JValue>;
    fn get_field(&self, obj: ObjectRef, field: FieldId) -> Result<JValue>;
    fn set_field(&self, obj: ObjectRef, field: FieldId, value: JValue) -> Result<()>;
    fn is_instance_of(&self, obj: ObjectRef, class: ClassRef) -> Result<bool>;

    fn new_string(&self, value: &str) -> Result<ObjectRef>;
    fn get_string(&self, obj: ObjectRef) -> Result<String>;
    fn new_object_array(&self, element: ClassRef, items: &[Option<ObjectRef>])
        -> Result<ObjectRef>;

    /// Promotes `obj` to a reference that stays valid across threads and calls.
    fn new_global_ref(&self, obj: ObjectRef) -> Result<ObjectRef>;
    fn delete_global_ref(&self, obj: ObjectRef);
    fn delete_local_ref(&self, obj: ObjectRef);
}

/// Process-wide handle on the managed runtime.
pub trait ManagedVm: Send + Sync {
    fn is_current_thread_attached(&self) -> bool;
    fn attach_current_thread(&self) -> Result<()>;
    fn detach_current_thread(&self);
    /// Environment for the calling thread; only usable while it is attached.
    fn env(&self) -> &dyn ManagedEnv;
}

/// Scoped attachment of the current thread to the managed runtime.
///
/// If the thread was already attached the guard borrows that attachment and leaves it in
/// place on drop; otherwise it attaches on acquire and detaches on drop, on every exit
/// path.
pub struct AttachGuard<'vm> {
    vm: &'vm dyn ManagedVm,
    owned: bool,
}

impl<'vm> AttachGuard<'vm> {
    pub fn acquire(vm: &'vm dyn ManagedVm) -> Result<Self> {
        if vm.is_current_thread_attached() {
            return Ok(Self { vm, owned: false });
        }
        vm.attach_current_thread()?;
        Ok(Self { vm, owned: true })
    }

    pub fn env(&self) -> &'vm dyn ManagedEnv {
        self.vm.env()
    }

    /// Whether this guard created the attachment.
    pub fn is_transient(&self) -> bool {
        self.owned
    }
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.vm.detach_current_thread();
        }
    }
}
