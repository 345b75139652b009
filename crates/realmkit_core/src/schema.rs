//! Object schema model.
//!
//! A [`Schema`] is an ordered set of [`ObjectSchema`]s (one per object type),
//! each listing its [`Property`]s. Schemas are immutable once shared: handles
//! hold them behind an `Arc`, and every handle of one coordinator observes
//! the same instance.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Schema version stamped into a realm file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SchemaVersion {
    /// The file was never initialized with a schema, or an open request
    /// accepts whatever version is already there.
    #[default]
    Unversioned,
    /// An explicit version number.
    Versioned(u64),
}

impl SchemaVersion {
    /// Returns true unless this is the unversioned sentinel.
    #[must_use]
    pub const fn is_versioned(self) -> bool {
        matches!(self, Self::Versioned(_))
    }

    /// Returns the numeric version, if any.
    #[must_use]
    pub const fn number(self) -> Option<u64> {
        match self {
            Self::Versioned(v) => Some(v),
            Self::Unversioned => None,
        }
    }
}

impl From<u64> for SchemaVersion {
    fn from(version: u64) -> Self {
        Self::Versioned(version)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Versioned(v) => write!(f, "{v}"),
            Self::Unversioned => f.write_str("unversioned"),
        }
    }
}

/// Storage type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    /// 64-bit signed integer.
    Int,
    /// Boolean.
    Bool,
    /// 64-bit float.
    Float,
    /// UTF-8 string.
    String,
    /// Opaque bytes.
    Data,
    /// Timestamp in milliseconds since the Unix epoch.
    Date,
    /// Link to a single row of another object type.
    Object,
    /// List of links to rows of another object type.
    Array,
}

impl PropertyType {
    /// Returns true for link types, which need a target object type.
    #[must_use]
    pub const fn is_link(self) -> bool {
        matches!(self, Self::Object | Self::Array)
    }

    /// Returns true for types that may carry an index.
    #[must_use]
    pub const fn is_indexable(self) -> bool {
        matches!(self, Self::Int | Self::String | Self::Bool | Self::Date)
    }

    /// Returns true for types that may serve as primary key.
    #[must_use]
    pub const fn can_be_primary(self) -> bool {
        matches!(self, Self::Int | Self::String)
    }

    /// Returns the lowercase name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Float => "float",
            Self::String => "string",
            Self::Data => "data",
            Self::Date => "date",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One property of an object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    /// Property name, unique within its object type.
    pub name: String,
    /// Storage type.
    pub property_type: PropertyType,
    /// Target object type for [`PropertyType::Object`] and [`PropertyType::Array`].
    pub object_type: Option<String>,
    /// Whether the property carries a search index.
    pub is_indexed: bool,
    /// Whether the property accepts null.
    pub is_nullable: bool,
}

impl Property {
    /// Creates a required, unindexed property.
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            property_type,
            object_type: None,
            is_indexed: false,
            is_nullable: false,
        }
    }

    /// Creates a nullable link to a single `target` row.
    pub fn link(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            object_type: Some(target.into()),
            is_nullable: true,
            ..Self::new(name, PropertyType::Object)
        }
    }

    /// Creates a list of links to `target` rows.
    pub fn list(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            object_type: Some(target.into()),
            ..Self::new(name, PropertyType::Array)
        }
    }

    /// Marks the property nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.is_nullable = true;
        self
    }

    /// Marks the property indexed.
    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.is_indexed = true;
        self
    }

    /// Returns true when `other` describes the same stored column, ignoring
    /// the index flag.
    #[must_use]
    pub fn same_storage(&self, other: &Property) -> bool {
        self.property_type == other.property_type
            && self.object_type == other.object_type
            && self.is_nullable == other.is_nullable
    }
}

/// The definition of one object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSchema {
    /// Object type name.
    pub name: String,
    /// Properties in declaration order.
    pub properties: Vec<Property>,
    /// Name of the primary key property, if any.
    pub primary_key: Option<String>,
}

impl ObjectSchema {
    /// Creates an object type without a primary key.
    pub fn new(name: impl Into<String>, properties: Vec<Property>) -> Self {
        Self {
            name: name.into(),
            properties,
            primary_key: None,
        }
    }

    /// Sets the primary key property.
    #[must_use]
    pub fn with_primary_key(mut self, property: impl Into<String>) -> Self {
        self.primary_key = Some(property.into());
        self
    }

    /// Looks up a property by name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    fn validate_into(&self, schema: &Schema, errors: &mut Vec<String>) {
        let mut seen = HashSet::new();
        for property in &self.properties {
            let location = format!("'{}.{}'", self.name, property.name);
            if !seen.insert(property.name.as_str()) {
                errors.push(format!("property {location} is declared more than once"));
            }

            match (&property.object_type, property.property_type.is_link()) {
                (Some(target), true) => {
                    if schema.find(target).is_none() {
                        errors.push(format!(
                            "property {location} links to unknown object type '{target}'"
                        ));
                    }
                }
                (None, true) => {
                    errors.push(format!("link property {location} has no target object type"));
                }
                (Some(_), false) => {
                    errors.push(format!(
                        "property {location} of type {} cannot have a target object type",
                        property.property_type
                    ));
                }
                (None, false) => {}
            }

            match property.property_type {
                PropertyType::Object if !property.is_nullable => {
                    errors.push(format!("object property {location} must be nullable"));
                }
                PropertyType::Array if property.is_nullable => {
                    errors.push(format!("array property {location} cannot be nullable"));
                }
                _ => {}
            }

            if property.is_indexed && !property.property_type.is_indexable() {
                errors.push(format!(
                    "property {location} of type {} cannot be indexed",
                    property.property_type
                ));
            }
        }

        if let Some(primary) = &self.primary_key {
            match self.property(primary) {
                None => errors.push(format!(
                    "primary key property '{}.{primary}' does not exist",
                    self.name
                )),
                Some(p) if !p.property_type.can_be_primary() => errors.push(format!(
                    "property '{}.{primary}' of type {} cannot be a primary key",
                    self.name, p.property_type
                )),
                Some(_) => {}
            }
        }
    }
}

/// An ordered set of object types.
///
/// Object types are kept sorted by name, so two schemas built from the same
/// types in a different order compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    types: Vec<ObjectSchema>,
}

impl Schema {
    /// Creates a schema from object types in any order.
    #[must_use]
    pub fn new(mut types: Vec<ObjectSchema>) -> Self {
        types.sort_by(|a, b| a.name.cmp(&b.name));
        Self { types }
    }

    /// Looks up an object type by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&ObjectSchema> {
        self.types
            .binary_search_by(|t| t.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.types[i])
    }

    /// Iterates object types in name order.
    pub fn iter(&self) -> std::slice::Iter<'_, ObjectSchema> {
        self.types.iter()
    }

    /// Returns the number of object types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns true when the schema has no object types.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Checks the schema for structural errors.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaValidationFailed`] listing every violation:
    /// duplicate object types or properties, dangling or misplaced link
    /// targets, bad nullability on links, unindexable indexed properties and
    /// invalid primary keys.
    pub fn validate(&self) -> CoreResult<()> {
        let mut errors = Vec::new();
        for pair in self.types.windows(2) {
            if pair[0].name == pair[1].name {
                errors.push(format!(
                    "object type '{}' is declared more than once",
                    pair[0].name
                ));
            }
        }
        for object_schema in &self.types {
            object_schema.validate_into(self, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::SchemaValidationFailed { errors })
        }
    }
}

impl<'a> IntoIterator for &'a Schema {
    type Item = &'a ObjectSchema;
    type IntoIter = std::slice::Iter<'a, ObjectSchema>;

    fn into_iter(self) -> Self::IntoIter {
        self.types.iter()
    }
}
