//! Committed realm state: tables of typed rows.
//!
//! A [`Group`] is what one commit of the log holds. Tables are shared
//! between snapshots behind `Arc`s and cloned on first write, so a write
//! transaction only copies what it touches and the set of changed object
//! types falls out of a pointer comparison.

use crate::error::{CoreError, CoreResult};
use crate::schema::{ObjectSchema, Property, PropertyType, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null, allowed only in nullable columns.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
    /// String.
    String(String),
    /// Bytes.
    Data(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    /// Row index in the target table.
    Link(u64),
    /// Row indices in the target table.
    LinkList(Vec<u64>),
}

impl Value {
    /// Returns the value a new row or column gets for `property`.
    #[must_use]
    pub fn default_for(property: &Property) -> Self {
        if property.is_nullable {
            return Self::Null;
        }
        match property.property_type {
            PropertyType::Int => Self::Int(0),
            PropertyType::Bool => Self::Bool(false),
            PropertyType::Float => Self::Float(0.0),
            PropertyType::String => Self::String(String::new()),
            PropertyType::Data => Self::Data(Vec::new()),
            PropertyType::Date => Self::Timestamp(0),
            PropertyType::Object => Self::Null,
            PropertyType::Array => Self::LinkList(Vec::new()),
        }
    }

    /// Returns true when the value may be stored in `property`.
    #[must_use]
    pub fn fits(&self, property: &Property) -> bool {
        match (self, property.property_type) {
            (Self::Null, _) => property.is_nullable,
            (Self::Bool(_), PropertyType::Bool)
            | (Self::Int(_), PropertyType::Int)
            | (Self::Float(_), PropertyType::Float)
            | (Self::String(_), PropertyType::String)
            | (Self::Data(_), PropertyType::Data)
            | (Self::Timestamp(_), PropertyType::Date)
            | (Self::Link(_), PropertyType::Object)
            | (Self::LinkList(_), PropertyType::Array) => true,
            _ => false,
        }
    }

    /// Returns true for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the integer, if this is one.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string, if this is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the boolean, if this is one.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// Rows of one object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<Property>,
    primary_key: Option<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Creates an empty table with the columns of `object_schema`.
    #[must_use]
    pub fn new(object_schema: &ObjectSchema) -> Self {
        Self {
            columns: object_schema.properties.clone(),
            primary_key: object_schema.primary_key.clone(),
            rows: Vec::new(),
        }
    }

    /// Returns the column definitions.
    #[must_use]
    pub fn columns(&self) -> &[Property] {
        &self.columns
    }

    /// Returns the primary key column name.
    #[must_use]
    pub fn primary_key(&self) -> Option<&str> {
        self.primary_key.as_deref()
    }

    pub(crate) fn set_primary_key(&mut self, primary_key: Option<String>) {
        self.primary_key = primary_key;
    }

    /// Returns the index of the named column.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Appends a row with default values and returns its index.
    pub fn add_row(&mut self) -> usize {
        let row = self.columns.iter().map(Value::default_for).collect();
        self.rows.push(row);
        self.rows.len() - 1
    }

    /// Appends a row, setting the given columns and defaulting the rest.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] for an unknown column and
    /// [`CoreError::InvalidTransactionState`] for a mistyped value; the
    /// table is unchanged on failure.
    pub fn insert(&mut self, values: &[(&str, Value)]) -> CoreResult<usize> {
        let mut row: Vec<Value> = self.columns.iter().map(Value::default_for).collect();
        for (name, value) in values {
            let col = self.checked_column(name, value)?;
            row[col] = value.clone();
        }
        self.rows.push(row);
        Ok(self.rows.len() - 1)
    }

    /// Reads one cell.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] for an unknown row or column.
    pub fn get(&self, row: usize, column: &str) -> CoreResult<&Value> {
        let col = self.column(column)?;
        self.rows
            .get(row)
            .map(|r| &r[col])
            .ok_or_else(|| CoreError::not_found(format!("row {row}")))
    }

    /// Writes one cell.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] for an unknown row or column and
    /// [`CoreError::InvalidTransactionState`] for a mistyped value.
    pub fn set(&mut self, row: usize, column: &str, value: Value) -> CoreResult<()> {
        let col = self.checked_column(column, &value)?;
        let cells = self
            .rows
            .get_mut(row)
            .ok_or_else(|| CoreError::not_found(format!("row {row}")))?;
        cells[col] = value;
        Ok(())
    }

    /// Removes a row, shifting later rows down by one.
    ///
    /// Links into this table are not rewritten.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] for an unknown row.
    pub fn remove_row(&mut self, row: usize) -> CoreResult<()> {
        if row >= self.rows.len() {
            return Err(CoreError::not_found(format!("row {row}")));
        }
        self.rows.remove(row);
        Ok(())
    }

    /// Iterates the values of one column.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] for an unknown column.
    pub fn column_values(&self, column: &str) -> CoreResult<impl Iterator<Item = &Value>> {
        let col = self.column(column)?;
        Ok(self.rows.iter().map(move |r| &r[col]))
    }

    /// Adds a column, filling existing rows with its default value.
    pub fn add_column(&mut self, property: Property) {
        let value = Value::default_for(&property);
        for row in &mut self.rows {
            row.push(value.clone());
        }
        self.columns.push(property);
    }

    /// Removes a column and its values.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] for an unknown column.
    pub fn remove_column(&mut self, name: &str) -> CoreResult<()> {
        let col = self.column(name)?;
        self.columns.remove(col);
        for row in &mut self.rows {
            row.remove(col);
        }
        Ok(())
    }

    /// Updates the index flag of a column.
    pub(crate) fn set_indexed(&mut self, name: &str, indexed: bool) -> CoreResult<()> {
        let col = self.column(name)?;
        self.columns[col].is_indexed = indexed;
        Ok(())
    }

    /// Releases spare capacity.
    pub fn optimize(&mut self) {
        self.columns.shrink_to_fit();
        for row in &mut self.rows {
            row.shrink_to_fit();
        }
        self.rows.shrink_to_fit();
    }

    fn column(&self, name: &str) -> CoreResult<usize> {
        self.column_index(name)
            .ok_or_else(|| CoreError::not_found(format!("column '{name}'")))
    }

    fn checked_column(&self, name: &str, value: &Value) -> CoreResult<usize> {
        let col = self.column(name)?;
        let property = &self.columns[col];
        if !value.fits(property) {
            return Err(CoreError::invalid_transaction(format!(
                "value {value:?} does not fit column '{name}' of type {}{}",
                property.property_type,
                if property.is_nullable { "?" } else { "" }
            )));
        }
        Ok(col)
    }
}

/// The full state of a realm at one commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    schema_version: SchemaVersion,
    tables: BTreeMap<String, Arc<Table>>,
}

impl Group {
    /// Creates an empty, unversioned group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stored schema version.
    #[must_use]
    pub fn schema_version(&self) -> SchemaVersion {
        self.schema_version
    }

    pub(crate) fn set_schema_version(&mut self, version: SchemaVersion) {
        self.schema_version = version;
    }

    /// Returns true when the named table exists.
    #[must_use]
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Returns the named table.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name).map(Arc::as_ref)
    }

    /// Returns the named table for writing, copying it out of shared state.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::NotFound`] for an unknown table.
    pub fn table_mut(&mut self, name: &str) -> CoreResult<&mut Table> {
        self.tables
            .get_mut(name)
            .map(Arc::make_mut)
            .ok_or_else(|| CoreError::not_found(format!("object type '{name}'")))
    }

    /// Iterates tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = (&str, &Table)> {
        self.tables.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// Creates an empty table for `object_schema`, replacing any existing one.
    pub(crate) fn add_table(&mut self, object_schema: &ObjectSchema) -> &mut Table {
        let table = Arc::new(Table::new(object_schema));
        let slot = self
            .tables
            .entry(object_schema.name.clone())
            .and_modify(|t| *t = Arc::clone(&table))
            .or_insert(table);
        Arc::make_mut(slot)
    }

    /// Drops every table and the schema version.
    pub(crate) fn clear(&mut self) {
        self.tables.clear();
        self.schema_version = SchemaVersion::Unversioned;
    }

    /// Names the object types whose tables differ between `self` and `other`.
    ///
    /// Tables untouched since they were shared compare by pointer, so this
    /// is cheap for groups derived from one another.
    #[must_use]
    pub fn changed_tables(&self, other: &Group) -> Vec<String> {
        let mut changed = Vec::new();
        for (name, table) in &self.tables {
            match other.tables.get(name) {
                Some(theirs) if Arc::ptr_eq(table, theirs) || table == theirs => {}
                _ => changed.push(name.clone()),
            }
        }
        for name in other.tables.keys() {
            if !self.tables.contains_key(name) {
                changed.push(name.clone());
            }
        }
        changed.sort();
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> ObjectSchema {
        ObjectSchema::new(
            "Person",
            vec![
                Property::new("id", PropertyType::Int),
                Property::new("nick", PropertyType::String).nullable(),
            ],
        )
    }

    #[test]
    fn rows_get_defaults() {
        let mut table = Table::new(&person());
        let row = table.add_row();
        assert_eq!(table.get(row, "id").unwrap(), &Value::Int(0));
        assert!(table.get(row, "nick").unwrap().is_null());
    }

    #[test]
    fn set_checks_types() {
        let mut table = Table::new(&person());
        let row = table.insert(&[("id", Value::Int(7))]).unwrap();
        assert!(table.set(row, "id", Value::String("x".into())).is_err());
        assert!(table.set(row, "id", Value::Null).is_err());
        table.set(row, "nick", Value::Null).unwrap();
        assert!(matches!(
            table.set(row, "missing", Value::Int(1)),
            Err(CoreError::NotFound { .. })
        ));
        assert_eq!(table.get(row, "id").unwrap().as_int(), Some(7));
    }

    #[test]
    fn columns_can_be_added_and_removed() {
        let mut table = Table::new(&person());
        table.insert(&[("id", Value::Int(1))]).unwrap();
        table.add_column(Property::new("age", PropertyType::Int));
        assert_eq!(table.get(0, "age").unwrap(), &Value::Int(0));

        table.remove_column("nick").unwrap();
        assert_eq!(table.columns().len(), 2);
        assert_eq!(table.get(0, "age").unwrap(), &Value::Int(0));
        assert!(table.get(0, "nick").is_err());
    }

    #[test]
    fn remove_row_shifts() {
        let mut table = Table::new(&person());
        for id in 0..3 {
            table.insert(&[("id", Value::Int(id))]).unwrap();
        }
        table.remove_row(0).unwrap();
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.get(0, "id").unwrap().as_int(), Some(1));
        assert!(table.remove_row(5).is_err());
    }

    #[test]
    fn changed_tables_tracks_copy_on_write() {
        let mut base = Group::new();
        base.add_table(&person());
        base.add_table(&ObjectSchema::new(
            "Dog",
            vec![Property::new("age", PropertyType::Int)],
        ));

        let mut next = base.clone();
        assert!(next.changed_tables(&base).is_empty());

        next.table_mut("Dog").unwrap().add_row();
        assert_eq!(next.changed_tables(&base), vec!["Dog".to_string()]);
        assert_eq!(base.table("Dog").unwrap().row_count(), 0);
    }

    #[test]
    fn clear_resets_version() {
        let mut group = Group::new();
        group.add_table(&person());
        group.set_schema_version(SchemaVersion::Versioned(2));
        group.clear();
        assert!(!group.has_table("Person"));
        assert_eq!(group.schema_version(), SchemaVersion::Unversioned);
    }
}
