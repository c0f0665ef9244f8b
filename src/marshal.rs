//! Tagged value <-> boxed managed value conversion.
//!
//! One table drives both directions: each [`VarKind`] maps to exactly one boxed managed
//! type in [`MetaData`]. Arrays map to `java.util.ArrayList` in source order; native null
//! maps to managed null, never to a zero-valued box.

use chrono::{DateTime, TimeZone, Utc};

use crate::{
    managed::{JValue, ManagedEnv, ObjectRef},
    metadata::{BoxedType, MetaData},
    object::ObjectRegistry,
    value::{TaggedValue, ValueType, VarKind},
    Error, Result,
};

/// Conversion context bound to one attached thread.
pub struct Marshaller<'a> {
    pub(crate) env: &'a dyn ManagedEnv,
    pub(crate) meta: &'a MetaData,
    pub(crate) objects: &'a ObjectRegistry,
}

impl<'a> Marshaller<'a> {
    pub fn new(env: &'a dyn ManagedEnv, meta: &'a MetaData, objects: &'a ObjectRegistry) -> Self {
        Self { env, meta, objects }
    }

    pub fn env(&self) -> &'a dyn ManagedEnv {
        self.env
    }

    /// Native -> managed. Embedded objects become `WMIObject`s registered in the object
    /// registry.
    pub fn to_managed(&self, value: &TaggedValue) -> Result<Option<ObjectRef>> {
        let mut scope = Vec::new();
        match self.value_to_managed(value, &mut scope) {
            Ok(obj) => Ok(obj),
            Err(e) => {
                self.objects.release_all(&scope);
                Err(e)
            }
        }
    }

    /// Native -> managed, recording object handles registered on the way in `scope` so a
    /// failing caller can roll them back.
    pub(crate) fn value_to_managed(
        &self,
        value: &TaggedValue,
        scope: &mut Vec<u64>,
    ) -> Result<Option<ObjectRef>> {
        let m = self.meta;
        let obj = match value {
            TaggedValue::Null => return Ok(None),
            TaggedValue::Byte(v) => self.boxed(&m.java_lang_byte, JValue::Byte(*v as i8))?,
            TaggedValue::Char(v) => self.boxed(&m.java_lang_char, JValue::Char(*v))?,
            TaggedValue::Boolean(v) => self.boxed(&m.java_lang_boolean, JValue::Boolean(*v))?,
            TaggedValue::Short(v) => self.boxed(&m.java_lang_short, JValue::Short(*v))?,
            TaggedValue::Int(v) => self.boxed(&m.java_lang_integer, JValue::Int(*v))?,
            TaggedValue::Long(v) => self.boxed(&m.java_lang_long, JValue::Long(*v))?,
            TaggedValue::Float(v) => self.boxed(&m.java_lang_float, JValue::Float(*v))?,
            TaggedValue::Double(v) => self.boxed(&m.java_lang_double, JValue::Double(*v))?,
            TaggedValue::String(v) => self.env.new_string(v)?,
            TaggedValue::Date(v) => {
                self.boxed(&m.java_util_date, JValue::Long(v.timestamp_millis()))?
            }
            TaggedValue::Object(o) => self.object_to_managed_in(o, scope)?,
            TaggedValue::Array { kind, items } => self.array_to_managed(*kind, items, scope)?,
        };
        Ok(Some(obj))
    }

    fn boxed(&self, ty: &BoxedType, value: JValue) -> Result<ObjectRef> {
        self.env.new_object(ty.class, ty.ctor, &[value])
    }

    pub(crate) fn new_list(&self, capacity: usize) -> Result<ObjectRef> {
        self.env.new_object(
            self.meta.java_util_array_list_class,
            self.meta.java_util_array_list_ctor,
            &[JValue::Int(i32::try_from(capacity).unwrap_or(i32::MAX))],
        )
    }

    pub(crate) fn list_add(&self, list: ObjectRef, item: Option<ObjectRef>) -> Result<()> {
        self.env
            .call_method(list, self.meta.java_util_list_add, &[JValue::Object(item)])?;
        if let Some(item) = item {
            self.env.delete_local_ref(item);
        }
        Ok(())
    }

    fn array_to_managed(
        &self,
        kind: VarKind,
        items: &[TaggedValue],
        scope: &mut Vec<u64>,
    ) -> Result<ObjectRef> {
        let list = self.new_list(items.len())?;
        for (i, item) in items.iter().enumerate() {
            match item.value_type() {
                None => {}
                Some(t) if t == ValueType::scalar(kind) => {}
                Some(t) => {
                    return Err(Error::Marshal(format!(
                        "array of {kind:?} holds {t:?} at index {i}"
                    )))
                }
            }
            let converted = self.value_to_managed(item, scope)?;
            self.list_add(list, converted)?;
        }
        Ok(list)
    }

    /// Managed -> native for a value that must have shape `expected`.
    ///
    /// A managed value of any other class fails; nothing is coerced to a string.
    pub fn to_native(&self, value: Option<ObjectRef>, expected: ValueType) -> Result<TaggedValue> {
        let Some(obj) = value else {
            return Ok(TaggedValue::Null);
        };
        if !expected.array {
            return self.scalar_to_native(obj, expected.kind);
        }
        if !self
            .env
            .is_instance_of(obj, self.meta.java_util_list_class)?
        {
            return Err(Error::Marshal(format!(
                "expected a list of {:?}",
                expected.kind
            )));
        }
        let size = self
            .env
            .call_method(obj, self.meta.java_util_list_size, &[])?
            .as_int()
            .ok_or_else(|| Error::Managed("List.size() did not return an int".into()))?;
        let mut items = Vec::with_capacity(size.max(0) as usize);
        for i in 0..size {
            let item = self
                .env
                .call_method(obj, self.meta.java_util_list_get, &[JValue::Int(i)])?
                .as_object()
                .ok_or_else(|| Error::Managed("List.get() did not return an object".into()))?;
            let converted = self.scalar_or_null(item, expected.kind);
            if let Some(item) = item {
                self.env.delete_local_ref(item);
            }
            items.push(converted?);
        }
        Ok(TaggedValue::Array {
            kind: expected.kind,
            items,
        })
    }

    fn scalar_or_null(&self, value: Option<ObjectRef>, kind: VarKind) -> Result<TaggedValue> {
        match value {
            None => Ok(TaggedValue::Null),
            Some(obj) => self.scalar_to_native(obj, kind),
        }
    }

    fn scalar_to_native(&self, obj: ObjectRef, kind: VarKind) -> Result<TaggedValue> {
        let m = self.meta;
        match kind {
            VarKind::String => {
                self.require(obj, m.java_lang_string_class, kind)?;
                Ok(TaggedValue::String(self.env.get_string(obj)?))
            }
            VarKind::Object => {
                self.require(obj, m.wmi_object_class, kind)?;
                let handle = crate::registry::read_handle(self.env, obj, m.wmi_object_handle_field)?;
                let native = self.objects.lookup(handle)?;
                Ok(TaggedValue::Object(native))
            }
            VarKind::Byte => match self.unbox(obj, &m.java_lang_byte, kind)? {
                JValue::Byte(v) => Ok(TaggedValue::Byte(v as u8)),
                other => Err(unexpected(kind, other)),
            },
            VarKind::Char => match self.unbox(obj, &m.java_lang_char, kind)? {
                JValue::Char(v) => Ok(TaggedValue::Char(v)),
                other => Err(unexpected(kind, other)),
            },
            VarKind::Boolean => match self.unbox(obj, &m.java_lang_boolean, kind)? {
                JValue::Boolean(v) => Ok(TaggedValue::Boolean(v)),
                other => Err(unexpected(kind, other)),
            },
            VarKind::Short => match self.unbox(obj, &m.java_lang_short, kind)? {
                JValue::Short(v) => Ok(TaggedValue::Short(v)),
                other => Err(unexpected(kind, other)),
            },
            VarKind::Int => match self.unbox(obj, &m.java_lang_integer, kind)? {
                JValue::Int(v) => Ok(TaggedValue::Int(v)),
                other => Err(unexpected(kind, other)),
            },
            VarKind::Long => match self.unbox(obj, &m.java_lang_long, kind)? {
                JValue::Long(v) => Ok(TaggedValue::Long(v)),
                other => Err(unexpected(kind, other)),
            },
            VarKind::Float => match self.unbox(obj, &m.java_lang_float, kind)? {
                JValue::Float(v) => Ok(TaggedValue::Float(v)),
                other => Err(unexpected(kind, other)),
            },
            VarKind::Double => match self.unbox(obj, &m.java_lang_double, kind)? {
                JValue::Double(v) => Ok(TaggedValue::Double(v)),
                other => Err(unexpected(kind, other)),
            },
            VarKind::Date => match self.unbox(obj, &m.java_util_date, kind)? {
                JValue::Long(ms) => Ok(TaggedValue::Date(date_from_millis(ms)?)),
                other => Err(unexpected(kind, other)),
            },
        }
    }

    fn require(&self, obj: ObjectRef, class: crate::managed::ClassRef, kind: VarKind) -> Result<()> {
        if self.env.is_instance_of(obj, class)? {
            Ok(())
        } else {
            Err(Error::Marshal(format!(
                "managed value is not a boxed {kind:?}"
            )))
        }
    }

    fn unbox(&self, obj: ObjectRef, ty: &BoxedType, kind: VarKind) -> Result<JValue> {
        self.require(obj, ty.class, kind)?;
        self.env.call_method(obj, ty.value, &[])
    }
}

fn unexpected(kind: VarKind, got: JValue) -> Error {
    Error::Managed(format!("unboxing {kind:?} returned {got:?}"))
}

pub(crate) fn date_from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::Marshal(format!("date out of range: {ms} ms")))
}

