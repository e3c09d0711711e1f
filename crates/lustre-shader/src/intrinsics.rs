//! The shader intrinsics library: image/sampler types, the fixed and
//! runtime array templates, and the math intrinsics fragments call.
//!
//! Registered into a module before fragment compilation so fragment sources
//! resolve these names like any other library. Intrinsic functions carry the
//! stage-requirement attributes the gatherer propagates (derivatives are
//! pixel-only, implicit-LOD sampling is pixel-only).

use lustre::{
    function::{Function, FunctionKind},
    ids::{HandleManagerId, LibraryId},
    library::{Library, Module},
    location::CodeLocation,
    members::Attribute,
    types::{BoundType, Primitive, TemplateArg, Type, TypeCopyMode, TypeKind},
};

/// Attribute marking a symbol as requiring the pixel stage.
pub const REQUIRES_PIXEL: &str = "RequiresPixel";
/// Attribute marking a symbol as requiring the vertex stage.
pub const REQUIRES_VERTEX: &str = "RequiresVertex";

/// Intrinsic type names the type resolvers recognize.
pub const IMAGE_2D: &str = "Image2d";
pub const DEPTH_IMAGE_2D: &str = "DepthImage2d";
pub const SAMPLER: &str = "Sampler";
pub const SAMPLED_IMAGE_2D: &str = "SampledImage2d";

/// Registers the intrinsic types, templates, and functions, returning the
/// library's id.
pub fn register_shader_intrinsics(module: &mut Module) -> LibraryId {
    module.register_template_factory("FixedArray", fixed_array_factory);
    module.register_template_factory("RuntimeArray", runtime_array_factory);

    let library_id = LibraryId::from(module.libraries.len());
    let mut library = Library {
        name: "ShaderIntrinsics".to_owned(),
        ..Library::default()
    };

    for name in [IMAGE_2D, DEPTH_IMAGE_2D, SAMPLER, SAMPLED_IMAGE_2D] {
        let id = module.types.add(Type {
            name: name.to_owned(),
            library: library_id,
            kind: TypeKind::Bound(BoundType {
                copy_mode: TypeCopyMode::Reference,
                manager: HandleManagerId::POINTER,
                ..BoundType::default()
            }),
        });
        library.type_names.insert(name.to_owned(), id);
        library.types.push(id);
    }

    let real = module.core.real();
    let real2 = module.core.primitive(Primitive::Real2);
    let real3 = module.core.primitive(Primitive::Real3);
    let real4 = module.core.primitive(Primitive::Real4);

    // The implicit-LOD sample can only run where derivatives exist.
    let sampled_image = library.type_names[SAMPLED_IMAGE_2D];
    let sample = intrinsic_function(
        module,
        "Sample",
        Some(sampled_image),
        &[real2],
        real4,
        &[REQUIRES_PIXEL],
    );
    if let Some(bound) = module.types.bound_mut(sampled_image) {
        bound.functions.entry("Sample".to_owned()).or_default().push(sample);
    }
    library.functions.push(sample);

    // Free math intrinsics.
    let free: [(&str, &[lustre::TypeId], lustre::TypeId, &[&str]); 6] = [
        ("Ddx", &[real], real, &[REQUIRES_PIXEL]),
        ("Ddy", &[real], real, &[REQUIRES_PIXEL]),
        ("Dot", &[real3, real3], real, &[]),
        ("Sqrt", &[real], real, &[]),
        ("Normalize", &[real3, real3], real3, &[]),
        ("Cross", &[real3, real3], real3, &[]),
    ];
    for (name, params, return_type, attributes) in free {
        let id = intrinsic_function(module, name, None, params, return_type, attributes);
        library.function_names.entry(name.to_owned()).or_default().push(id);
        library.functions.push(id);
    }

    module.add_library(library)
}

fn intrinsic_function(
    module: &mut Module,
    name: &str,
    owner: Option<lustre::TypeId>,
    params: &[lustre::TypeId],
    return_type: lustre::TypeId,
    attributes: &[&str],
) -> lustre::FunctionId {
    let signature = module.signature(params, return_type);
    let delegate_type = module.intern_delegate(signature.clone());
    module.add_function(Function {
        name: name.to_owned(),
        owner,
        signature,
        delegate_type,
        kind: FunctionKind::Normal,
        is_static: owner.is_none(),
        is_virtual: false,
        is_override: false,
        attributes: attributes.iter().map(|&attr| Attribute::new(attr)).collect(),
        location: CodeLocation::default(),
        code: None,
        native: None,
    })
}

/// `FixedArray[T, N]`: a value type remembering its element and length
/// through its template arguments.
fn fixed_array_factory(module: &mut Module, args: &[TemplateArg], name: &str) -> Option<lustre::TypeId> {
    let [TemplateArg::Type(element), TemplateArg::Constant(lustre::Constant::Integer(length))] = args else {
        return None;
    };
    if *length <= 0 {
        return None;
    }
    let id = module.types.add(Type {
        name: name.to_owned(),
        library: LibraryId(0),
        kind: TypeKind::Bound(BoundType {
            template_base: Some("FixedArray".to_owned()),
            template_args: vec![
                TemplateArg::Type(*element),
                TemplateArg::Constant(lustre::Constant::Integer(*length)),
            ],
            copy_mode: TypeCopyMode::Value,
            manager: HandleManagerId::POINTER,
            ..BoundType::default()
        }),
    });
    Some(id)
}

/// `RuntimeArray[T]`: storage-buffer backed, length known at run time.
fn runtime_array_factory(module: &mut Module, args: &[TemplateArg], name: &str) -> Option<lustre::TypeId> {
    let [TemplateArg::Type(element)] = args else {
        return None;
    };
    let id = module.types.add(Type {
        name: name.to_owned(),
        library: LibraryId(0),
        kind: TypeKind::Bound(BoundType {
            template_base: Some("RuntimeArray".to_owned()),
            template_args: vec![TemplateArg::Type(*element)],
            copy_mode: TypeCopyMode::Reference,
            manager: HandleManagerId::POINTER,
            ..BoundType::default()
        }),
    });
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_types_and_functions() {
        let mut module = Module::new();
        register_shader_intrinsics(&mut module);
        assert!(module.find_type(SAMPLED_IMAGE_2D).is_some());
        assert!(module.template_factories.contains_key("FixedArray"));
    }

    #[test]
    fn fixed_array_factory_requires_type_and_length() {
        let mut module = Module::new();
        let real = module.core.real();
        let good = fixed_array_factory(
            &mut module,
            &[
                TemplateArg::Type(real),
                TemplateArg::Constant(lustre::Constant::Integer(4)),
            ],
            "FixedArray[Real, 4]",
        );
        assert!(good.is_some());
        let bad = fixed_array_factory(&mut module, &[TemplateArg::Type(real)], "FixedArray[Real]");
        assert!(bad.is_none());
    }
}
