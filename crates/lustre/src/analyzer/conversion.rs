//! Implicit and explicit conversion rules, shared by expression typing,
//! overload resolution, and reflection's `set_value` check.

use crate::{
    ids::TypeId,
    library::Module,
    opcode::CastOperator,
    types::{Primitive, TypeKind},
};

/// Relative widths for scalar numeric widening. A conversion is implicit only
/// when the rank strictly increases.
fn numeric_rank(primitive: Primitive) -> Option<u32> {
    match primitive {
        Primitive::Byte => Some(0),
        Primitive::Integer => Some(1),
        Primitive::DoubleInteger => Some(2),
        Primitive::Real => Some(3),
        Primitive::DoubleReal => Some(4),
        _ => None,
    }
}

/// An applicable conversion plus its cost for overload ranking.
///
/// Costs: `0` is reserved for exact matches (no cast), `1` for the ordinary
/// implicit conversions, `2` for the to-`Any` conversion so a specific
/// overload always beats the top type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CastInfo {
    pub operator: CastOperator,
    pub cost: u32,
}

/// The implicit conversion from `from` to `to`, if one exists.
///
/// Recognized: numeric widening among the scalar numerics, `Null` to any
/// reference type, any type to `Any`, derived handle to base handle, and
/// enum to `Integer`. Error placeholders convert to everything so one failed
/// resolution doesn't cascade.
#[must_use]
pub fn implicit_cast(module: &Module, from: TypeId, to: TypeId) -> Option<CastInfo> {
    if from == to {
        return Some(CastInfo {
            operator: CastOperator::Upcast { to },
            cost: 0,
        });
    }
    if module.is_error_type(from) || module.is_error_type(to) {
        return Some(CastInfo {
            operator: CastOperator::Upcast { to },
            cost: 0,
        });
    }

    let from_kind = &module.types.get(from).kind;
    let to_kind = &module.types.get(to).kind;

    // Any type may be stored into the top type.
    if matches!(to_kind, TypeKind::Any) {
        return Some(CastInfo {
            operator: CastOperator::ToAny { related: from },
            cost: 2,
        });
    }

    // The null literal adopts any reference type.
    if matches!(from_kind, TypeKind::Null) && module.types.is_reference(to) {
        return Some(CastInfo {
            operator: CastOperator::NullToHandle { to },
            cost: 1,
        });
    }

    match (from_kind, to_kind) {
        (TypeKind::Primitive(from_primitive), TypeKind::Primitive(to_primitive)) => {
            let from_rank = numeric_rank(*from_primitive)?;
            let to_rank = numeric_rank(*to_primitive)?;
            (from_rank < to_rank).then_some(CastInfo {
                operator: CastOperator::Primitive {
                    from: *from_primitive,
                    to: *to_primitive,
                },
                cost: 1,
            })
        }
        (TypeKind::Bound(from_bound), TypeKind::Bound(_)) => {
            if from_bound.is_enum && to == module.core.integer() {
                return Some(CastInfo {
                    operator: CastOperator::EnumToInteger,
                    cost: 1,
                });
            }
            module.types.is_subtype_of(from, to).then_some(CastInfo {
                operator: CastOperator::Upcast { to },
                cost: 1,
            })
        }
        (TypeKind::Bound(from_bound), TypeKind::Primitive(Primitive::Integer)) if from_bound.is_enum => {
            Some(CastInfo {
                operator: CastOperator::EnumToInteger,
                cost: 1,
            })
        }
        _ => None,
    }
}

/// The explicit conversion from `from` to `to`, if one exists.
///
/// Everything implicit, plus numeric narrowing, downcasts between related
/// handle types, and extraction from `Any` (checked at runtime).
#[must_use]
pub fn explicit_cast(module: &Module, from: TypeId, to: TypeId) -> Option<CastInfo> {
    if let Some(info) = implicit_cast(module, from, to) {
        return Some(info);
    }

    let from_kind = &module.types.get(from).kind;
    let to_kind = &module.types.get(to).kind;

    match (from_kind, to_kind) {
        // Narrowing (or any scalar-to-scalar) conversion.
        (TypeKind::Primitive(from_primitive), TypeKind::Primitive(to_primitive)) => {
            (numeric_rank(*from_primitive).is_some() && numeric_rank(*to_primitive).is_some()).then_some(CastInfo {
                operator: CastOperator::Primitive {
                    from: *from_primitive,
                    to: *to_primitive,
                },
                cost: 1,
            })
        }
        // Base handle to derived handle, checked against the dynamic type.
        (TypeKind::Bound(_), TypeKind::Bound(_)) if module.types.is_subtype_of(to, from) => Some(CastInfo {
            operator: CastOperator::Downcast { to },
            cost: 1,
        }),
        // Extraction from the top type, checked at runtime.
        (TypeKind::Any, _) => Some(CastInfo {
            operator: CastOperator::FromAny { related: to },
            cost: 1,
        }),
        _ => None,
    }
}

/// The total conversion cost of calling a candidate with the given argument
/// types, or `None` when any argument is inconvertible.
///
/// Exact matches cost nothing; two viable candidates with equal cost are an
/// ambiguity the caller reports.
#[must_use]
pub fn call_cost(module: &Module, parameter_types: &[TypeId], argument_types: &[TypeId]) -> Option<u32> {
    if parameter_types.len() != argument_types.len() {
        return None;
    }
    let mut total = 0;
    for (&param, &arg) in parameter_types.iter().zip(argument_types) {
        if param == arg {
            continue;
        }
        total += implicit_cast(module, arg, param)?.cost;
    }
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Primitive;

    #[test]
    fn widening_is_implicit_narrowing_is_not() {
        let module = Module::new();
        let integer = module.core.integer();
        let real = module.core.real();
        assert!(implicit_cast(&module, integer, real).is_some());
        assert!(implicit_cast(&module, real, integer).is_none());
        assert!(explicit_cast(&module, real, integer).is_some());
    }

    #[test]
    fn null_converts_to_references_only() {
        let module = Module::new();
        let null = module.core.null;
        assert!(implicit_cast(&module, null, module.core.exception).is_some());
        assert!(implicit_cast(&module, null, module.core.integer()).is_none());
    }

    #[test]
    fn anything_converts_to_any_at_higher_cost() {
        let module = Module::new();
        let integer = module.core.integer();
        let to_any = implicit_cast(&module, integer, module.core.any).unwrap();
        let widen = implicit_cast(&module, integer, module.core.real()).unwrap();
        assert!(to_any.cost > widen.cost);
    }

    #[test]
    fn call_cost_prefers_exact() {
        let module = Module::new();
        let integer = module.core.integer();
        let real = module.core.real();
        assert_eq!(call_cost(&module, &[integer], &[integer]), Some(0));
        assert_eq!(call_cost(&module, &[real], &[integer]), Some(1));
        assert_eq!(call_cost(&module, &[integer], &[real]), None);
        assert_eq!(call_cost(&module, &[integer, integer], &[integer]), None);
    }

    #[test]
    fn boolean_never_converts_to_numeric() {
        let module = Module::new();
        let boolean = module.core.boolean();
        assert!(implicit_cast(&module, boolean, module.core.integer()).is_none());
        assert_eq!(
            explicit_cast(&module, boolean, module.core.integer())
                .map(|info| matches!(info.operator, CastOperator::Primitive { from: Primitive::Boolean, .. })),
            None
        );
    }
}
