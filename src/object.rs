//! Provider object -> managed `WMIObject` conversion, and the registry that keeps the
//! native side of each managed object alive for re-query.

use std::sync::Arc;

use crate::{
    managed::{JValue, ObjectRef},
    marshal::Marshaller,
    provider::{NativeMethod, NativeObject, NativeProperty},
    registry::HandleTable,
    Error, Result,
};

/// Native objects referenced from managed `WMIObject.objectHandle` fields.
#[derive(Default)]
pub struct ObjectRegistry {
    table: HandleTable<Arc<dyn NativeObject>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, object: Arc<dyn NativeObject>) -> u64 {
        self.table.insert(object)
    }

    pub fn lookup(&self, handle: u64) -> Result<Arc<dyn NativeObject>> {
        self.table.get(handle).ok_or_else(|| {
            Error::InvalidState(format!("no live object for handle {handle:#x}"))
        })
    }

    /// Drops the registry's reference. Returns `false` for unknown or stale handles.
    pub fn release(&self, handle: u64) -> bool {
        self.table.remove(handle).is_some()
    }

    pub(crate) fn release_all(&self, handles: &[u64]) {
        for h in handles {
            self.table.remove(*h);
        }
    }

    pub fn clear(&self) -> usize {
        self.table.drain().len()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Marshaller<'_> {
    /// Builds a managed `WMIObject` with its property and method lists.
    ///
    /// All-or-nothing: if any property or method fails to convert, every object handle
    /// registered for this conversion is released again and the error is returned.
    pub fn object_to_managed(&self, object: &Arc<dyn NativeObject>) -> Result<ObjectRef> {
        let mut scope = Vec::new();
        self.object_to_managed_in(object, &mut scope)
            .inspect_err(|_| self.objects.release_all(&scope))
    }

    /// Converts a result batch into a managed `WMIObject[]`, in batch order.
    pub fn objects_to_array(&self, objects: &[Arc<dyn NativeObject>]) -> Result<ObjectRef> {
        let mut scope = Vec::new();
        self.batch_to_array(objects, &mut scope)
            .inspect_err(|_| self.objects.release_all(&scope))
    }

    fn batch_to_array(
        &self,
        objects: &[Arc<dyn NativeObject>],
        scope: &mut Vec<u64>,
    ) -> Result<ObjectRef> {
        let mut converted = Vec::with_capacity(objects.len());
        let mut failure = None;
        for object in objects {
            match self.object_to_managed_in(object, scope) {
                Ok(obj) => converted.push(Some(obj)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let result = match failure {
            Some(e) => Err(e),
            None => self
                .env
                .new_object_array(self.meta.wmi_object_class, &converted),
        };
        for obj in converted.into_iter().flatten() {
            self.env.delete_local_ref(obj);
        }
        result
    }

    pub(crate) fn object_to_managed_in(
        &self,
        object: &Arc<dyn NativeObject>,
        scope: &mut Vec<u64>,
    ) -> Result<ObjectRef> {
        let class_name = object.class_name();
        let properties = object.properties().map_err(|e| shape_error(&class_name, e))?;
        let methods = object.methods().map_err(|e| shape_error(&class_name, e))?;

        let property_list = self.new_list(properties.len())?;
        let method_list = self
            .new_list(methods.len())
            .inspect_err(|_| self.env.delete_local_ref(property_list))?;

        let managed = (|| -> Result<ObjectRef> {
            for property in &properties {
                let record = self
                    .property_to_managed(property, scope)
                    .map_err(|e| member_error(&class_name, &property.name, e))?;
                self.list_add(property_list, Some(record))?;
            }
            for method in &methods {
                let record = self
                    .method_to_managed(method, scope)
                    .map_err(|e| member_error(&class_name, &method.name, e))?;
                self.list_add(method_list, Some(record))?;
            }

            let handle = self.objects.register(object.clone());
            scope.push(handle);
            self.env.new_object(
                self.meta.wmi_object_class,
                self.meta.wmi_object_ctor,
                &[
                    JValue::Long(handle as i64),
                    JValue::object(property_list),
                    JValue::object(method_list),
                ],
            )
        })();
        self.env.delete_local_ref(property_list);
        self.env.delete_local_ref(method_list);
        managed
    }

    fn property_to_managed(
        &self,
        property: &NativeProperty,
        scope: &mut Vec<u64>,
    ) -> Result<ObjectRef> {
        let value = self.value_to_managed(&property.value, scope)?;
        let name = self.env.new_string(&property.name)?;
        let record = self.env.new_object(
            self.meta.wmi_object_property_class,
            self.meta.wmi_object_property_ctor,
            &[
                JValue::object(name),
                JValue::Int(property.cim_type),
                JValue::Object(value),
            ],
        );
        self.env.delete_local_ref(name);
        if let Some(value) = value {
            self.env.delete_local_ref(value);
        }
        record
    }

    fn method_to_managed(&self, method: &NativeMethod, scope: &mut Vec<u64>) -> Result<ObjectRef> {
        let in_sig = method
            .in_signature
            .as_ref()
            .map(|s| self.object_to_managed_in(s, scope))
            .transpose()?;
        let out_sig = method
            .out_signature
            .as_ref()
            .map(|s| self.object_to_managed_in(s, scope))
            .transpose()?;
        let name = self.env.new_string(&method.name)?;
        let record = self.env.new_object(
            self.meta.wmi_object_method_class,
            self.meta.wmi_object_method_ctor,
            &[
                JValue::object(name),
                JValue::Object(in_sig),
                JValue::Object(out_sig),
            ],
        );
        for local in [Some(name), in_sig, out_sig].into_iter().flatten() {
            self.env.delete_local_ref(local);
        }
        record
    }
}

fn shape_error(class_name: &str, e: Error) -> Error {
    match e {
        Error::Marshal(msg) => Error::Marshal(format!("{class_name}: {msg}")),
        Error::Provider { code, message } => Error::Marshal(format!(
            "{class_name}: enumeration failed (code {code:#010x}): {message}"
        )),
        other => other,
    }
}

fn member_error(class_name: &str, member: &str, e: Error) -> Error {
    match e {
        Error::Marshal(msg) => Error::Marshal(format!("{class_name}.{member}: {msg}")),
        other => other,
    }
}
