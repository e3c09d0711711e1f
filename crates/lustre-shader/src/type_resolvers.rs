//! The type resolver registry: maps each shader-legal language type to a
//! factory that materializes its SPIR-V type on demand.
//!
//! Template instantiations pre-walk their arguments so nested types exist
//! before the outer composite is built; struct (fragment) types pre-walk
//! their fields the same way.

use ahash::AHashMap;

use lustre::{
    Module, TypeId,
    types::{Primitive, TemplateArg, TypeKind},
};

use crate::{
    errors::{ShaderCompilationErrors, ShaderErrorKind, ValidationError},
    intrinsics,
    ir::{IrId, IrNode, IrType, ShaderIrLibrary, TypeKey},
    spirv::StorageClass,
};

/// A factory producing the IR type for one language type.
pub type TypeResolverFn = fn(&mut TypeResolution<'_, '_>, TypeId) -> Option<IrId>;

/// Registry keyed by type name (concrete intrinsics) or template base name.
#[derive(Debug)]
pub struct TypeResolverRegistry {
    resolvers: AHashMap<String, TypeResolverFn>,
}

impl Default for TypeResolverRegistry {
    fn default() -> Self {
        let mut resolvers: AHashMap<String, TypeResolverFn> = AHashMap::new();
        resolvers.insert("FixedArray".to_owned(), resolve_fixed_array as TypeResolverFn);
        resolvers.insert("RuntimeArray".to_owned(), resolve_runtime_array as TypeResolverFn);
        resolvers.insert(intrinsics::IMAGE_2D.to_owned(), resolve_image as TypeResolverFn);
        resolvers.insert(intrinsics::DEPTH_IMAGE_2D.to_owned(), resolve_depth_image as TypeResolverFn);
        resolvers.insert(intrinsics::SAMPLER.to_owned(), resolve_sampler as TypeResolverFn);
        resolvers.insert(
            intrinsics::SAMPLED_IMAGE_2D.to_owned(),
            resolve_sampled_image as TypeResolverFn,
        );
        Self { resolvers }
    }
}

impl TypeResolverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a resolver for a type or template-base name.
    pub fn register(&mut self, name: impl Into<String>, resolver: TypeResolverFn) {
        self.resolvers.insert(name.into(), resolver);
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<TypeResolverFn> {
        self.resolvers.get(name).copied()
    }
}

/// The working context threaded through resolution.
pub struct TypeResolution<'m, 'l> {
    pub module: &'m Module,
    pub registry: &'m TypeResolverRegistry,
    pub library: &'l mut ShaderIrLibrary,
    pub errors: &'l mut ShaderCompilationErrors,
}

impl TypeResolution<'_, '_> {
    /// The IR type for a language type, materializing it (and everything it
    /// references) on first demand.
    pub fn resolve(&mut self, ty: TypeId) -> Option<IrId> {
        if let Some(&cached) = self.library.type_map.get(&ty) {
            return Some(cached);
        }
        let resolved = self.resolve_uncached(ty)?;
        self.library.type_map.insert(ty, resolved);
        Some(resolved)
    }

    fn resolve_uncached(&mut self, ty: TypeId) -> Option<IrId> {
        match &self.module.types.get(ty).kind {
            TypeKind::Void => Some(self.library.intern_type(TypeKey::Void, "void")),
            TypeKind::Primitive(primitive) => self.resolve_primitive(*primitive),
            TypeKind::Bound(bound) => {
                // Template instantiations and named intrinsics go through
                // the registry; anything else is a fragment struct.
                let key_name = bound
                    .template_base
                    .clone()
                    .unwrap_or_else(|| self.module.types.name_of(ty).to_owned());
                if let Some(resolver) = self.registry.find(&key_name) {
                    return resolver(self, ty);
                }
                self.resolve_struct(ty)
            }
            _ => {
                self.unresolved(ty);
                None
            }
        }
    }

    fn resolve_primitive(&mut self, primitive: Primitive) -> Option<IrId> {
        if let Some((component, count)) = primitive.vector_shape() {
            let component = self.resolve_primitive(component)?;
            return Some(self.vector(component, count));
        }
        if let Some((rows, cols)) = primitive.matrix_shape() {
            let float = self.float32();
            let column = self.vector(float, rows);
            return Some(self.library.intern_type(
                TypeKey::Matrix { column, count: cols },
                format!("mat{rows}x{cols}"),
            ));
        }
        match primitive {
            Primitive::Boolean => Some(self.library.intern_type(TypeKey::Bool, "bool")),
            Primitive::Byte | Primitive::Integer => Some(self.int32()),
            Primitive::DoubleInteger => Some(self.library.intern_type(
                TypeKey::Int {
                    width: 64,
                    signed: true,
                },
                "i64",
            )),
            Primitive::Real => Some(self.float32()),
            Primitive::DoubleReal => Some(self.library.intern_type(TypeKey::Float { width: 64 }, "f64")),
            Primitive::Quaternion => {
                let float = self.float32();
                Some(self.vector(float, 4))
            }
            // Strings have no shader representation.
            Primitive::Str => None,
            _ => None,
        }
    }

    /// A fragment/struct type: fields materialize first, then the composite.
    fn resolve_struct(&mut self, ty: TypeId) -> Option<IrId> {
        let name = self.module.types.name_of(ty).to_owned();
        let bound = self.module.types.bound(ty)?;
        let fields: Vec<(String, TypeId)> = bound
            .fields
            .iter()
            .map(|(field_name, &field)| (field_name.clone(), self.module.field(field).value_type))
            .collect();

        let mut members = Vec::with_capacity(fields.len());
        let mut member_names = Vec::with_capacity(fields.len());
        for (field_name, field_type) in fields {
            let member = self.resolve(field_type)?;
            members.push(member);
            member_names.push(field_name);
        }

        let key = TypeKey::Struct { name: name.clone() };
        if let Some(existing) = self.library.find_type(&key) {
            return Some(existing);
        }
        let id = self.library.intern_type(key, name);
        if let IrNode::Type(IrType {
            members: slot_members,
            member_names: slot_names,
            ..
        }) = self.library.node_mut(id)
        {
            *slot_members = members;
            *slot_names = member_names;
        }
        Some(id)
    }

    // --- shared shapes ---

    pub fn float32(&mut self) -> IrId {
        self.library.intern_type(TypeKey::Float { width: 32 }, "f32")
    }

    pub fn int32(&mut self) -> IrId {
        self.library.intern_type(
            TypeKey::Int {
                width: 32,
                signed: true,
            },
            "i32",
        )
    }

    pub fn vector(&mut self, component: IrId, count: u32) -> IrId {
        self.library.intern_type(TypeKey::Vector { component, count }, format!("vec{count}"))
    }

    /// A pointer type in a storage class.
    pub fn pointer(&mut self, pointee: IrId, storage: StorageClass) -> IrId {
        let id = self.library.intern_type(
            TypeKey::Pointer {
                pointee,
                storage: storage as u16,
            },
            format!("ptr<{storage}>"),
        );
        if let IrNode::Type(ir_type) = self.library.node_mut(id) {
            ir_type.storage = storage;
        }
        id
    }

    fn unresolved(&mut self, ty: TypeId) {
        let name = self.module.types.name_of(ty).to_owned();
        self.errors.raise(ValidationError {
            kind: ShaderErrorKind::UnresolvedType,
            short_message: format!("'{name}' is not usable in shaders"),
            full_message: format!("the type '{name}' has no shader representation"),
            location: self
                .module
                .types
                .bound(ty)
                .map(|bound| bound.location.clone())
                .unwrap_or_default(),
            call_stack: Vec::new(),
        });
    }
}

// --- registry entries ---

fn resolve_fixed_array(resolution: &mut TypeResolution<'_, '_>, ty: TypeId) -> Option<IrId> {
    let bound = resolution.module.types.bound(ty)?;
    let [TemplateArg::Type(element), TemplateArg::Constant(lustre::Constant::Integer(length))] =
        bound.template_args.as_slice()
    else {
        missing_template(resolution, ty);
        return None;
    };
    let (element, length) = (*element, *length);
    // Pre-walk: the element type materializes before the array.
    let element = resolution.resolve(element)?;
    Some(resolution.library.intern_type(
        TypeKey::FixedArray {
            element,
            length: u32::try_from(length).ok()?,
        },
        resolution.module.types.name_of(ty).to_owned(),
    ))
}

fn resolve_runtime_array(resolution: &mut TypeResolution<'_, '_>, ty: TypeId) -> Option<IrId> {
    let bound = resolution.module.types.bound(ty)?;
    let [TemplateArg::Type(element)] = bound.template_args.as_slice() else {
        missing_template(resolution, ty);
        return None;
    };
    let element = resolution.resolve(*element)?;
    let id = resolution
        .library
        .intern_type(TypeKey::RuntimeArray { element }, resolution.module.types.name_of(ty).to_owned());
    if let IrNode::Type(ir_type) = resolution.library.node_mut(id) {
        ir_type.storage = StorageClass::StorageBuffer;
    }
    Some(id)
}

fn resolve_image(resolution: &mut TypeResolution<'_, '_>, _ty: TypeId) -> Option<IrId> {
    let sampled_type = resolution.float32();
    Some(resolution.library.intern_type(
        TypeKey::Image {
            sampled_type,
            depth: false,
        },
        "image2d",
    ))
}

fn resolve_depth_image(resolution: &mut TypeResolution<'_, '_>, _ty: TypeId) -> Option<IrId> {
    let sampled_type = resolution.float32();
    Some(resolution.library.intern_type(
        TypeKey::Image {
            sampled_type,
            depth: true,
        },
        "depthImage2d",
    ))
}

fn resolve_sampler(resolution: &mut TypeResolution<'_, '_>, _ty: TypeId) -> Option<IrId> {
    Some(resolution.library.intern_type(TypeKey::Sampler, "sampler"))
}

fn resolve_sampled_image(resolution: &mut TypeResolution<'_, '_>, _ty: TypeId) -> Option<IrId> {
    let image = resolve_image(resolution, _ty)?;
    Some(resolution
        .library
        .intern_type(TypeKey::SampledImage { image }, "sampledImage2d"))
}

fn missing_template(resolution: &mut TypeResolution<'_, '_>, ty: TypeId) {
    let name = resolution.module.types.name_of(ty).to_owned();
    resolution.errors.raise(ValidationError {
        kind: ShaderErrorKind::MissingTemplateType,
        short_message: format!("'{name}' is missing template arguments"),
        full_message: format!("the template type '{name}' was instantiated with unusable arguments"),
        location: Default::default(),
        call_stack: Vec::new(),
    });
}
