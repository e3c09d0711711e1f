//! The runtime reflection surface: reading and writing members of live
//! objects with the same conversion checks the analyzer applies.

use crate::{
    analyzer::conversion::implicit_cast,
    handles::Resolved,
    ids::{FieldId, PropertyId, TypeId},
    value::{Handle, Value},
    vm::{ExceptionKind, ExceptionRaise, ExecutableState, VmError},
};

impl ExecutableState {
    /// The runtime type of a value, used for reflection conversion checks.
    #[must_use]
    pub fn runtime_type_of(&self, value: &Value) -> TypeId {
        let core = &self.module.core;
        match value {
            Value::Boolean(_) => core.boolean(),
            Value::Byte(_) => core.primitive(crate::types::Primitive::Byte),
            Value::Integer(_) => core.integer(),
            Value::DoubleInteger(_) => core.primitive(crate::types::Primitive::DoubleInteger),
            Value::Real(_) => core.real(),
            Value::DoubleReal(_) => core.primitive(crate::types::Primitive::DoubleReal),
            Value::Real2(_) => core.primitive(crate::types::Primitive::Real2),
            Value::Real3(_) => core.primitive(crate::types::Primitive::Real3),
            Value::Real4(_) => core.primitive(crate::types::Primitive::Real4),
            Value::Integer2(_) => core.primitive(crate::types::Primitive::Integer2),
            Value::Integer3(_) => core.primitive(crate::types::Primitive::Integer3),
            Value::Integer4(_) => core.primitive(crate::types::Primitive::Integer4),
            Value::Boolean2(_) => core.primitive(crate::types::Primitive::Boolean2),
            Value::Boolean3(_) => core.primitive(crate::types::Primitive::Boolean3),
            Value::Boolean4(_) => core.primitive(crate::types::Primitive::Boolean4),
            Value::Quaternion(_) => core.primitive(crate::types::Primitive::Quaternion),
            Value::Real3x3(_) => core.primitive(crate::types::Primitive::Real3x3),
            Value::Real4x4(_) => core.primitive(crate::types::Primitive::Real4x4),
            Value::Str(_) => core.string(),
            Value::Handle(handle) => self.dynamic_type(handle).unwrap_or(handle.stored_type),
            Value::Delegate(delegate) => {
                if delegate.function.0 == u32::MAX {
                    core.null
                } else {
                    self.module.function(delegate.function).delegate_type
                }
            }
            Value::Any(_) => core.any,
            Value::TypeRef(_) => core.type_ref,
            Value::MemberRef(_) => core.member_ref,
            Value::Empty => core.null,
        }
    }

    /// Reads an instance field through a handle.
    pub fn get_field_value(&mut self, instance: &Handle, field: FieldId) -> Result<Value, ExceptionRaise> {
        let offset = self.module.field(field).offset;
        self.read_object_field(instance, offset).map_err(unwrap_exception)
    }

    /// Writes an instance field, applying the analyzer's implicit-conversion
    /// rules; incompatible types throw.
    pub fn set_field_value(&mut self, instance: &Handle, field: FieldId, value: Value) -> Result<(), ExceptionRaise> {
        let field_type = self.module.field(field).value_type;
        let offset = self.module.field(field).offset;
        let value = self.convert_for_reflection(value, field_type)?;
        match self.resolve_handle(instance) {
            Resolved::HeapObject(slot) => {
                self.add_reference_value(&value);
                if let Some(object) = self.heap.get_mut(slot) {
                    let old = std::mem::replace(&mut object.fields[offset as usize], value);
                    self.release_value(old);
                }
                Ok(())
            }
            Resolved::StackLocation(slot) => {
                self.add_reference_value(&value);
                let abs = (slot + offset) as usize;
                let old = std::mem::replace(&mut self.stack[abs], value);
                self.release_value(old);
                Ok(())
            }
            Resolved::Null => Err(unwrap_exception(self.raise(
                ExceptionKind::NullReference,
                "attempted to access a member of a null object".to_owned(),
            ))),
        }
    }

    /// Reads a property by invoking its getter.
    pub fn get_property_value(
        &mut self,
        instance: Option<Handle>,
        property: PropertyId,
    ) -> Result<Value, ExceptionRaise> {
        let descriptor = self.module.property(property);
        let Some(getter) = descriptor.get else {
            return Err(unwrap_exception(self.raise(
                ExceptionKind::NotImplemented,
                format!("property '{}' has no getter", self.module.property(property).name),
            )));
        };
        let mut call = self.begin_call(getter).map_err(unwrap_exception)?;
        if let Some(instance) = instance {
            call.set_this(instance).map_err(unwrap_exception)?;
        }
        let result = call.invoke()?;
        Ok(result.unwrap_or_default())
    }

    /// Writes a property by invoking its setter, with the same conversion
    /// check as `set_field_value`.
    pub fn set_property_value(
        &mut self,
        instance: Option<Handle>,
        property: PropertyId,
        value: Value,
    ) -> Result<(), ExceptionRaise> {
        let descriptor = self.module.property(property);
        let value_type = descriptor.value_type;
        let Some(setter) = descriptor.set else {
            return Err(unwrap_exception(self.raise(
                ExceptionKind::NotImplemented,
                format!("property '{}' has no setter", self.module.property(property).name),
            )));
        };
        let value = self.convert_for_reflection(value, value_type)?;
        let mut call = self.begin_call(setter).map_err(unwrap_exception)?;
        call.set_parameter(0, value).map_err(unwrap_exception)?;
        if let Some(instance) = instance {
            call.set_this(instance).map_err(unwrap_exception)?;
        }
        call.invoke()?;
        Ok(())
    }

    /// Reads a static field, running its initializer on first access.
    pub fn get_static_value(&mut self, field: FieldId) -> Result<Value, ExceptionRaise> {
        self.ensure_static_initialized(field).map_err(unwrap_exception)?;
        Ok(self.statics.get(&field).cloned().unwrap_or_default())
    }

    /// Writes a static field with the reflection conversion check.
    pub fn set_static_value(&mut self, field: FieldId, value: Value) -> Result<(), ExceptionRaise> {
        let field_type = self.module.field(field).value_type;
        let value = self.convert_for_reflection(value, field_type)?;
        self.ensure_static_initialized(field).map_err(unwrap_exception)?;
        self.add_reference_value(&value);
        if let Some(old) = self.statics.insert(field, value) {
            self.release_value(old);
        }
        Ok(())
    }

    /// Applies the implicit-conversion rules to a reflected write.
    fn convert_for_reflection(&mut self, value: Value, to: TypeId) -> Result<Value, ExceptionRaise> {
        let from = self.runtime_type_of(&value);
        if from == to {
            return Ok(value);
        }
        let Some(info) = implicit_cast(&self.module, from, to) else {
            let from_name = self.module.types.name_of(from).to_owned();
            let to_name = self.module.types.name_of(to).to_owned();
            return Err(unwrap_exception(self.raise(
                ExceptionKind::InvalidCast,
                format!("cannot convert from '{from_name}' to '{to_name}'"),
            )));
        };
        if info.cost == 0 {
            return Ok(value);
        }
        self.apply_cast(info.operator, value).map_err(unwrap_exception)
    }
}

/// Reflection surfaces report exceptions, never fatal states; a fatal error
/// converts to its report form.
fn unwrap_exception(error: VmError) -> ExceptionRaise {
    match error {
        VmError::Exception(raise) => *raise,
        VmError::Fatal(kind) => ExceptionRaise {
            handle: Handle {
                manager: crate::ids::HandleManagerId::HEAP,
                stored_type: TypeId(0),
                data: crate::value::HandleData::Empty,
            },
            kind: ExceptionKind::Internal,
            message: format!("fatal error: {kind:?}"),
            trace: crate::vm::StackTrace::default(),
            location: None,
        },
    }
}
