//! Resolved managed type shapes.
//!
//! Everything the bridge constructs or reads on the managed side is looked up once, when
//! the bridge attaches to a runtime, and is immutable afterwards. A missing class, method or
//! field is an [`Error::EnvironmentIntegrity`]: the managed half of the bridge does not
//! match this build and nothing can be marshalled safely.

use crate::{
    managed::{ClassRef, FieldId, ManagedEnv, MethodId},
    Error, Result,
};

pub const CLASS_WMI_SERVICE: &str = "org/jkiss/wmi/service/WMIService";
pub const CLASS_WMI_OBJECT: &str = "org/jkiss/wmi/service/WMIObject";
pub const CLASS_WMI_OBJECT_SINK: &str = "org/jkiss/wmi/service/WMIObjectSink";
pub const CLASS_WMI_OBJECT_SINK_STATUS: &str = "org/jkiss/wmi/service/WMIObjectSinkStatus";
pub const CLASS_WMI_OBJECT_PROPERTY: &str = "org/jkiss/wmi/service/WMIObjectProperty";
pub const CLASS_WMI_OBJECT_METHOD: &str = "org/jkiss/wmi/service/WMIObjectMethod";

pub const CLASS_OBJECT: &str = "java/lang/Object";
pub const CLASS_BYTE: &str = "java/lang/Byte";
pub const CLASS_CHARACTER: &str = "java/lang/Character";
pub const CLASS_BOOLEAN: &str = "java/lang/Boolean";
pub const CLASS_SHORT: &str = "java/lang/Short";
pub const CLASS_INTEGER: &str = "java/lang/Integer";
pub const CLASS_LONG: &str = "java/lang/Long";
pub const CLASS_FLOAT: &str = "java/lang/Float";
pub const CLASS_DOUBLE: &str = "java/lang/Double";
pub const CLASS_STRING: &str = "java/lang/String";
pub const CLASS_DATE: &str = "java/util/Date";
pub const CLASS_LIST: &str = "java/util/List";
pub const CLASS_ARRAY_LIST: &str = "java/util/ArrayList";

pub const FIELD_SERVICE_HANDLE: &str = "serviceHandle";
pub const FIELD_OBJECT_HANDLE: &str = "objectHandle";

pub const SIG_OBJECT_CTOR: &str = "(JLjava/util/List;Ljava/util/List;)V";
pub const SIG_SINK_INDICATE: &str = "([Lorg/jkiss/wmi/service/WMIObject;)V";
pub const SIG_SINK_SET_STATUS: &str = "(Lorg/jkiss/wmi/service/WMIObjectSinkStatus;ILjava/lang/String;Lorg/jkiss/wmi/service/WMIObject;)V";
pub const SIG_STATUS_FROM_CODE: &str = "(I)Lorg/jkiss/wmi/service/WMIObjectSinkStatus;";
pub const SIG_PROPERTY_CTOR: &str = "(Ljava/lang/String;ILjava/lang/Object;)V";
pub const SIG_METHOD_CTOR: &str = "(Ljava/lang/String;Lorg/jkiss/wmi/service/WMIObject;Lorg/jkiss/wmi/service/WMIObject;)V";

/// Constructor and accessor of one boxed primitive type.
#[derive(Debug, Copy, Clone)]
pub struct BoxedType {
    pub class: ClassRef,
    pub ctor: MethodId,
    pub value: MethodId,
}

#[derive(Debug)]
pub struct MetaData {
    pub wmi_service_class: ClassRef,
    pub wmi_service_handle_field: FieldId,

    pub wmi_object_class: ClassRef,
    pub wmi_object_ctor: MethodId,
    pub wmi_object_handle_field: FieldId,

    pub wmi_object_sink_class: ClassRef,
    pub wmi_object_sink_indicate: MethodId,
    pub wmi_object_sink_set_status: MethodId,
    pub wmi_object_sink_status_class: ClassRef,
    pub wmi_object_sink_status_from_code: MethodId,
    pub wmi_object_property_class: ClassRef,
    pub wmi_object_property_ctor: MethodId,
    pub wmi_object_method_class: ClassRef,
    pub wmi_object_method_ctor: MethodId,

    pub java_lang_object_class: ClassRef,
    pub java_lang_object_equals: MethodId,
    pub java_lang_byte: BoxedType,
    pub java_lang_char: BoxedType,
    pub java_lang_boolean: BoxedType,
    pub java_lang_short: BoxedType,
    pub java_lang_integer: BoxedType,
    pub java_lang_long: BoxedType,
    pub java_lang_float: BoxedType,
    pub java_lang_double: BoxedType,
    pub java_lang_string_class: ClassRef,
    pub java_util_date: BoxedType,
    pub java_util_list_class: ClassRef,
    pub java_util_list_add: MethodId,
    pub java_util_list_size: MethodId,
    pub java_util_list_get: MethodId,
    pub java_util_array_list_class: ClassRef,
    pub java_util_array_list_ctor: MethodId,
}

impl MetaData {
    /// Looks up every required shape through `env`.
    ///
    /// On failure, class references resolved so far are released before returning.
    pub fn resolve(env: &dyn ManagedEnv) -> Result<Self> {
        let mut resolver = Resolver {
            env,
            classes: Vec::new(),
        };
        match Self::resolve_all(&mut resolver) {
            Ok(meta) => Ok(meta),
            Err(e) => {
                for class in resolver.classes.drain(..) {
                    env.release_class(class);
                }
                Err(e)
            }
        }
    }

    fn resolve_all(r: &mut Resolver<'_>) -> Result<Self> {
        let wmi_service_class = r.class(CLASS_WMI_SERVICE)?;
        let wmi_object_class = r.class(CLASS_WMI_OBJECT)?;
        let wmi_object_sink_class = r.class(CLASS_WMI_OBJECT_SINK)?;
        let wmi_object_sink_status_class = r.class(CLASS_WMI_OBJECT_SINK_STATUS)?;
        let wmi_object_property_class = r.class(CLASS_WMI_OBJECT_PROPERTY)?;
        let wmi_object_method_class = r.class(CLASS_WMI_OBJECT_METHOD)?;
        let java_lang_object_class = r.class(CLASS_OBJECT)?;
        let java_lang_string_class = r.class(CLASS_STRING)?;
        let java_util_list_class = r.class(CLASS_LIST)?;
        let java_util_array_list_class = r.class(CLASS_ARRAY_LIST)?;

        Ok(Self {
            wmi_service_handle_field: r.field(
                wmi_service_class,
                CLASS_WMI_SERVICE,
                FIELD_SERVICE_HANDLE,
                "J",
            )?,
            wmi_service_class,

            wmi_object_ctor: r.method(wmi_object_class, CLASS_WMI_OBJECT, "<init>", SIG_OBJECT_CTOR)?,
            wmi_object_handle_field: r.field(
                wmi_object_class,
                CLASS_WMI_OBJECT,
                FIELD_OBJECT_HANDLE,
                "J",
            )?,
            wmi_object_class,

            wmi_object_sink_indicate: r.method(
                wmi_object_sink_class,
                CLASS_WMI_OBJECT_SINK,
                "indicate",
                SIG_SINK_INDICATE,
            )?,
            wmi_object_sink_set_status: r.method(
                wmi_object_sink_class,
                CLASS_WMI_OBJECT_SINK,
                "setStatus",
                SIG_SINK_SET_STATUS,
            )?,
            wmi_object_sink_class,
            wmi_object_sink_status_from_code: r.static_method(
                wmi_object_sink_status_class,
                CLASS_WMI_OBJECT_SINK_STATUS,
                "fromCode",
                SIG_STATUS_FROM_CODE,
            )?,
            wmi_object_sink_status_class,
            wmi_object_property_ctor: r.method(
                wmi_object_property_class,
                CLASS_WMI_OBJECT_PROPERTY,
                "<init>",
                SIG_PROPERTY_CTOR,
            )?,
            wmi_object_property_class,
            wmi_object_method_ctor: r.method(
                wmi_object_method_class,
                CLASS_WMI_OBJECT_METHOD,
                "<init>",
                SIG_METHOD_CTOR,
            )?,
            wmi_object_method_class,

            java_lang_object_equals: r.method(
                java_lang_object_class,
                CLASS_OBJECT,
                "equals",
                "(Ljava/lang/Object;)Z",
            )?,
            java_lang_object_class,
            java_lang_byte: r.boxed(CLASS_BYTE, "(B)V", "byteValue", "()B")?,
            java_lang_char: r.boxed(CLASS_CHARACTER, "(C)V", "charValue", "()C")?,
            java_lang_boolean: r.boxed(CLASS_BOOLEAN, "(Z)V", "booleanValue", "()Z")?,
            java_lang_short: r.boxed(CLASS_SHORT, "(S)V", "shortValue", "()S")?,
            java_lang_integer: r.boxed(CLASS_INTEGER, "(I)V", "intValue", "()I")?,
            java_lang_long: r.boxed(CLASS_LONG, "(J)V", "longValue", "()J")?,
            java_lang_float: r.boxed(CLASS_FLOAT, "(F)V", "floatValue", "()F")?,
            java_lang_double: r.boxed(CLASS_DOUBLE, "(D)V", "doubleValue", "()D")?,
            java_lang_string_class,
            java_util_date: r.boxed(CLASS_DATE, "(J)V", "getTime", "()J")?,
            java_util_list_add: r.method(
                java_util_list_class,
                CLASS_LIST,
                "add",
                "(Ljava/lang/Object;)Z",
            )?,
            java_util_list_size: r.method(java_util_list_class, CLASS_LIST, "size", "()I")?,
            java_util_list_get: r.method(
                java_util_list_class,
                CLASS_LIST,
                "get",
                "(I)Ljava/lang/Object;",
            )?,
            java_util_list_class,
            java_util_array_list_ctor: r.method(
                java_util_array_list_class,
                CLASS_ARRAY_LIST,
                "<init>",
                "(I)V",
            )?,
            java_util_array_list_class,
        })
    }

    fn classes(&self) -> [ClassRef; 19] {
        [
            self.wmi_service_class,
            self.wmi_object_class,
            self.wmi_object_sink_class,
            self.wmi_object_sink_status_class,
            self.wmi_object_property_class,
            self.wmi_object_method_class,
            self.java_lang_object_class,
            self.java_lang_string_class,
            self.java_util_list_class,
            self.java_util_array_list_class,
            self.java_lang_byte.class,
            self.java_lang_char.class,
            self.java_lang_boolean.class,
            self.java_lang_short.class,
            self.java_lang_integer.class,
            self.java_lang_long.class,
            self.java_lang_float.class,
            self.java_lang_double.class,
            self.java_util_date.class,
        ]
    }

    /// Releases every class reference. The handles must not be used afterwards.
    pub fn release(&self, env: &dyn ManagedEnv) {
        for class in self.classes() {
            env.release_class(class);
        }
    }
}

struct Resolver<'e> {
    env: &'e dyn ManagedEnv,
    classes: Vec<ClassRef>,
}

impl Resolver<'_> {
    fn class(&mut self, name: &str) -> Result<ClassRef> {
        let class = self
            .env
            .find_class(name)?
            .ok_or_else(|| Error::EnvironmentIntegrity(format!("class '{name}' not found")))?;
        self.classes.push(class);
        Ok(class)
    }

    fn method(&self, class: ClassRef, owner: &str, name: &str, sig: &str) -> Result<MethodId> {
        self.env.method_id(class, name, sig)?.ok_or_else(|| {
            Error::EnvironmentIntegrity(format!("method '{owner}.{name}{sig}' not found"))
        })
    }

    fn static_method(
        &self,
        class: ClassRef,
        owner: &str,
        name: &str,
        sig: &str,
    ) -> Result<MethodId> {
        self.env.static_method_id(class, name, sig)?.ok_or_else(|| {
            Error::EnvironmentIntegrity(format!("static method '{owner}.{name}{sig}' not found"))
        })
    }

    fn field(&self, class: ClassRef, owner: &str, name: &str, sig: &str) -> Result<FieldId> {
        self.env.field_id(class, name, sig)?.ok_or_else(|| {
            Error::EnvironmentIntegrity(format!("field '{owner}.{name}' ({sig}) not found"))
        })
    }

    fn boxed(
        &mut self,
        name: &str,
        ctor_sig: &str,
        accessor: &str,
        accessor_sig: &str,
    ) -> Result<BoxedType> {
        let class = self.class(name)?;
        Ok(BoxedType {
            class,
            ctor: self.method(class, name, "<init>", ctor_sig)?,
            value: self.method(class, name, accessor, accessor_sig)?,
        })
    }
}
