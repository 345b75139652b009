//! Property-based test generators using proptest.
//!
//! Generated schemas always pass [`Schema::validate`]; generated values
//! always fit the property they were generated for.

use proptest::prelude::*;
use realmkit_core::{ObjectSchema, Property, PropertyType, Schema, Value};

/// Strategy for valid object type and property names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z][A-Za-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for non-link property types.
pub fn scalar_type_strategy() -> impl Strategy<Value = PropertyType> {
    prop_oneof![
        Just(PropertyType::Int),
        Just(PropertyType::Bool),
        Just(PropertyType::Float),
        Just(PropertyType::String),
        Just(PropertyType::Data),
        Just(PropertyType::Date),
    ]
}

/// Strategy for a scalar property, indexed only where the type allows it.
pub fn scalar_property_strategy(name: String) -> impl Strategy<Value = Property> {
    (scalar_type_strategy(), any::<bool>(), any::<bool>()).prop_map(
        move |(property_type, nullable, indexed)| {
            let mut property = Property::new(name.clone(), property_type);
            if nullable {
                property = property.nullable();
            }
            if indexed && property_type.is_indexable() {
                property = property.indexed();
            }
            property
        },
    )
}

/// Strategy for an object type with 1 to 6 distinct scalar properties.
///
/// When the first property can be a primary key it sometimes becomes one.
pub fn object_schema_strategy(name: String) -> impl Strategy<Value = ObjectSchema> {
    prop::collection::btree_set(name_strategy(), 1..6)
        .prop_flat_map(|names| {
            names
                .into_iter()
                .map(scalar_property_strategy)
                .collect::<Vec<_>>()
        })
        .prop_flat_map(move |properties| {
            let name = name.clone();
            any::<bool>().prop_map(move |with_key| {
                let mut properties = properties.clone();
                let keyed = with_key && properties[0].property_type.can_be_primary();
                if keyed {
                    properties[0].is_nullable = false;
                }
                let object = ObjectSchema::new(name.clone(), properties);
                if keyed {
                    let key = object.properties[0].name.clone();
                    object.with_primary_key(key)
                } else {
                    object
                }
            })
        })
}

/// Strategy for a valid schema with 1 to 4 object types.
pub fn schema_strategy() -> impl Strategy<Value = Schema> {
    prop::collection::btree_set(name_strategy(), 1..4)
        .prop_flat_map(|names| {
            names
                .into_iter()
                .map(object_schema_strategy)
                .collect::<Vec<_>>()
        })
        .prop_map(Schema::new)
}

/// Strategy for a value that fits `property`.
pub fn value_strategy(property: &Property) -> BoxedStrategy<Value> {
    let value = match property.property_type {
        PropertyType::Int => any::<i64>().prop_map(Value::Int).boxed(),
        PropertyType::Bool => any::<bool>().prop_map(Value::Bool).boxed(),
        PropertyType::Float => (-1.0e9f64..1.0e9).prop_map(Value::Float).boxed(),
        PropertyType::String => "[a-z ]{0,24}".prop_map(Value::String).boxed(),
        PropertyType::Data => prop::collection::vec(any::<u8>(), 0..64)
            .prop_map(Value::Data)
            .boxed(),
        PropertyType::Date => (0i64..4_102_444_800_000).prop_map(Value::Timestamp).boxed(),
        PropertyType::Object => Just(Value::Null).boxed(),
        PropertyType::Array => Just(Value::LinkList(Vec::new())).boxed(),
    };
    if property.is_nullable {
        prop_oneof![1 => Just(Value::Null), 4 => value].boxed()
    } else {
        value
    }
}

/// Strategy for one row of `object`, as `(property name, value)` pairs.
pub fn row_strategy(object: &ObjectSchema) -> BoxedStrategy<Vec<(String, Value)>> {
    object
        .properties
        .iter()
        .map(|p| {
            let name = p.name.clone();
            value_strategy(p).prop_map(move |v| (name.clone(), v))
        })
        .collect::<Vec<_>>()
        .boxed()
}
