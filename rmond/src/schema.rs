//! Runtime table schemas.
//!
//! A [`Schema`] is the runtime descriptor of one management table: its name,
//! its base OID, the ordered list of [`Column`]s it carries, the ordered
//! subset of columns forming the composite row key, and optionally the
//! column that carries the row's lifecycle status. Generic table and
//! transaction code interprets the descriptor; no per-table code exists.
//!
//! # Example
//!
//! ```rust
//! use rmond::schema::{Column, Schema};
//! use rmond::value::{Oid, ProtocolType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = Schema::new(
//!     "ves",
//!     Oid::new([1, 3, 6, 1, 4, 1, 26171, 1, 1, 55]),
//!     vec![
//!         Column::read_only(1, ProtocolType::OctetString),
//!         Column::read_only(2, ProtocolType::OctetString),
//!         Column::read_only(3, ProtocolType::Integer),
//!     ],
//!     vec![1],
//!     None,
//! )?;
//! assert_eq!(schema.metric_oid(3).to_string(), "1.3.6.1.4.1.26171.1.1.55.1.3");
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::error::{Result, SchemaError, TableError};
use crate::table::Key;
use crate::value::{Oid, ProtocolType, Value};

/// One column of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Column {
    /// Column number, unique within its table.
    pub id: u32,
    /// Protocol type of every value stored in the column.
    pub protocol_type: ProtocolType,
    /// Whether management sessions may write the column.
    pub mutable: bool,
}

impl Column {
    /// Creates a column that management sessions can only read.
    pub const fn read_only(id: u32, protocol_type: ProtocolType) -> Self {
        Self {
            id,
            protocol_type,
            mutable: false,
        }
    }

    /// Creates a column that management sessions can write.
    pub const fn read_write(id: u32, protocol_type: ProtocolType) -> Self {
        Self {
            id,
            protocol_type,
            mutable: true,
        }
    }
}

/// Descriptor of a table: columns, composite key and status column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schema {
    name: String,
    oid: Oid,
    columns: Vec<Column>,
    parent_index: Vec<ProtocolType>,
    index: Vec<u32>,
    row_status: Option<u32>,
}

impl Schema {
    /// Creates and validates a schema.
    ///
    /// Columns are kept in ascending id order regardless of declaration
    /// order. `index` lists the key-composing column ids in key order; an
    /// empty index declares a scalar group holding a single row under the
    /// empty key.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if there are no columns, a column id repeats,
    /// an index column is undeclared or mutable, or the RowStatus column is
    /// not a writable, non-index `Integer` column.
    pub fn new(
        name: impl Into<String>,
        oid: Oid,
        mut columns: Vec<Column>,
        index: Vec<u32>,
        row_status: Option<u32>,
    ) -> Result<Self> {
        let name = name.into();
        if columns.is_empty() {
            return Err(SchemaError::NoColumns { name }.into());
        }

        let mut seen = BTreeSet::new();
        for column in &columns {
            if !seen.insert(column.id) {
                return Err(SchemaError::DuplicateColumn {
                    name,
                    column: column.id,
                }
                .into());
            }
        }
        columns.sort_by_key(|c| c.id);

        for &id in &index {
            match columns.iter().find(|c| c.id == id) {
                None => return Err(SchemaError::UnknownIndexColumn { name, column: id }.into()),
                Some(c) if c.mutable => {
                    return Err(SchemaError::MutableIndexColumn { name, column: id }.into());
                }
                Some(_) => {}
            }
        }

        if let Some(id) = row_status {
            let reason = match columns.iter().find(|c| c.id == id) {
                None => Some("column is not declared"),
                Some(c) if c.protocol_type != ProtocolType::Integer => Some("column is not an integer"),
                Some(c) if !c.mutable => Some("column is read-only"),
                Some(_) if index.contains(&id) => Some("column is part of the index"),
                Some(_) => None,
            };
            if let Some(reason) = reason {
                return Err(SchemaError::InvalidRowStatus {
                    name,
                    column: id,
                    reason: reason.to_string(),
                }
                .into());
            }
        }

        Ok(Self {
            name,
            oid,
            columns,
            parent_index: Vec::new(),
            index,
            row_status,
        })
    }

    /// Prefixes the key with components borrowed from a parent table.
    ///
    /// Child tables such as per-guest disks are keyed by the parent's key
    /// followed by their own index columns. The borrowed components are not
    /// columns of the child table.
    #[must_use]
    pub fn with_parent_index(mut self, parts: impl Into<Vec<ProtocolType>>) -> Self {
        self.parent_index = parts.into();
        self
    }

    /// Returns the table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the table's base OID.
    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    /// Returns all columns in ascending id order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Returns the key-composing column ids in key order.
    pub fn index(&self) -> &[u32] {
        &self.index
    }

    /// Returns the types of the key components borrowed from a parent table.
    pub fn parent_index(&self) -> &[ProtocolType] {
        &self.parent_index
    }

    /// Returns the number of key components.
    pub fn key_len(&self) -> usize {
        self.parent_index.len() + self.index.len()
    }

    /// Returns the RowStatus column id, if the table has one.
    pub fn row_status(&self) -> Option<u32> {
        self.row_status
    }

    /// Returns `true` if this schema describes a scalar group.
    pub fn is_scalar(&self) -> bool {
        self.key_len() == 0
    }

    /// Looks up a column by id.
    pub fn column(&self, id: u32) -> Option<&Column> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Returns the position of `column` within the key, if it is an index column.
    pub fn index_position(&self, column: u32) -> Option<usize> {
        self.index
            .iter()
            .position(|&id| id == column)
            .map(|p| p + self.parent_index.len())
    }

    /// Returns the OID naming a whole column.
    ///
    /// Table columns live under the entry arc (`oid.1.column`); scalars sit
    /// directly under the group (`oid.column`).
    pub fn metric_oid(&self, column: u32) -> Oid {
        if self.is_scalar() {
            self.oid.child(column)
        } else {
            self.oid.extend(&[1, column])
        }
    }

    /// Returns the OID naming one cell: the column OID followed by the
    /// encoded key, or by `.0` for a scalar.
    pub fn instance_oid(&self, column: u32, key: &Key) -> Oid {
        let mut suffix = Vec::new();
        if self.is_scalar() {
            suffix.push(0);
        } else {
            for part in key.values() {
                suffix.extend(part.index_sub_ids());
            }
        }
        self.metric_oid(column).extend(&suffix)
    }

    /// Builds a key from index values, validating arity and types.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::InvalidKey`] on arity mismatch and
    /// [`TableError::TypeMismatch`] when a component has the wrong type.
    pub fn key_from(&self, values: Vec<Value>) -> std::result::Result<Key, TableError> {
        self.validate_key(&values)?;
        Ok(Key::new(values))
    }

    /// Checks that `values` form a full key for this schema.
    pub(crate) fn validate_key(&self, values: &[Value]) -> std::result::Result<(), TableError> {
        if values.len() != self.key_len() {
            return Err(TableError::InvalidKey {
                table: self.name.clone(),
                reason: format!(
                    "expected {} components, got {}",
                    self.key_len(),
                    values.len()
                ),
            });
        }
        let (parent, own) = values.split_at(self.parent_index.len());
        for (position, (value, &expected)) in parent.iter().zip(&self.parent_index).enumerate() {
            if value.protocol_type() != expected {
                return Err(TableError::InvalidKey {
                    table: self.name.clone(),
                    reason: format!(
                        "parent component {position} expects {expected}, got {}",
                        value.protocol_type()
                    ),
                });
            }
        }
        for (value, &id) in own.iter().zip(&self.index) {
            if let Some(column) = self.column(id) {
                if column.protocol_type != value.protocol_type() {
                    return Err(TableError::TypeMismatch {
                        table: self.name.clone(),
                        column: id,
                        expected: column.protocol_type,
                        actual: value.protocol_type(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RmondError;

    fn sinx_like() -> Result<Schema> {
        Schema::new(
            "sinx",
            Oid::new([1, 3, 6, 1, 4, 1, 26171, 1, 1, 51]),
            vec![
                Column::read_only(2, ProtocolType::Integer),
                Column::read_only(1, ProtocolType::OctetString),
                Column::read_write(3, ProtocolType::Integer),
                Column::read_write(6, ProtocolType::Integer),
            ],
            vec![1, 2],
            Some(6),
        )
    }

    #[test]
    fn test_schema_sorts_columns() {
        let schema = sinx_like().unwrap();
        let ids: Vec<u32> = schema.columns().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 6]);
        assert_eq!(schema.index_position(2), Some(1));
        assert_eq!(schema.row_status(), Some(6));
        assert!(!schema.is_scalar());
    }

    #[test]
    fn test_schema_rejects_empty() {
        let result = Schema::new("empty", Oid::default(), vec![], vec![], None);
        assert!(matches!(
            result,
            Err(RmondError::Schema(SchemaError::NoColumns { .. }))
        ));
    }

    #[test]
    fn test_schema_rejects_duplicate_column() {
        let result = Schema::new(
            "dup",
            Oid::default(),
            vec![
                Column::read_only(1, ProtocolType::Integer),
                Column::read_only(1, ProtocolType::Integer),
            ],
            vec![],
            None,
        );
        assert!(matches!(
            result,
            Err(RmondError::Schema(SchemaError::DuplicateColumn { column: 1, .. }))
        ));
    }

    #[test]
    fn test_schema_rejects_bad_index() {
        let unknown = Schema::new(
            "t",
            Oid::default(),
            vec![Column::read_only(1, ProtocolType::Integer)],
            vec![9],
            None,
        );
        assert!(matches!(
            unknown,
            Err(RmondError::Schema(SchemaError::UnknownIndexColumn { column: 9, .. }))
        ));

        let mutable = Schema::new(
            "t",
            Oid::default(),
            vec![Column::read_write(1, ProtocolType::Integer)],
            vec![1],
            None,
        );
        assert!(matches!(
            mutable,
            Err(RmondError::Schema(SchemaError::MutableIndexColumn { column: 1, .. }))
        ));
    }

    #[test]
    fn test_schema_rejects_bad_row_status() {
        let result = Schema::new(
            "t",
            Oid::default(),
            vec![
                Column::read_only(1, ProtocolType::Integer),
                Column::read_write(2, ProtocolType::OctetString),
            ],
            vec![1],
            Some(2),
        );
        assert!(matches!(
            result,
            Err(RmondError::Schema(SchemaError::InvalidRowStatus { column: 2, .. }))
        ));
    }

    #[test]
    fn test_key_from_validates() {
        let schema = sinx_like().unwrap();
        let key = schema
            .key_from(vec![Value::from("10.0.0.1"), Value::Integer(162)])
            .unwrap();
        assert_eq!(key.len(), 2);

        assert!(matches!(
            schema.key_from(vec![Value::from("10.0.0.1")]),
            Err(TableError::InvalidKey { .. })
        ));
        assert!(matches!(
            schema.key_from(vec![Value::Integer(1), Value::Integer(162)]),
            Err(TableError::TypeMismatch { column: 1, .. })
        ));
    }

    #[test]
    fn test_parent_index_prefixes_key() {
        let schema = Schema::new(
            "vhds",
            Oid::new([1, 3, 6, 1, 4, 1, 26171, 1, 1, 56]),
            vec![
                Column::read_only(1, ProtocolType::OctetString),
                Column::read_only(2, ProtocolType::Counter64),
            ],
            vec![1],
            None,
        )
        .unwrap()
        .with_parent_index([ProtocolType::OctetString]);

        assert_eq!(schema.key_len(), 2);
        assert_eq!(schema.index_position(1), Some(1));
        let key = schema
            .key_from(vec![Value::from("vm"), Value::from("d")])
            .unwrap();
        assert_eq!(
            schema.instance_oid(2, &key).to_string(),
            "1.3.6.1.4.1.26171.1.1.56.1.2.2.118.109.1.100"
        );
        assert!(matches!(
            schema.key_from(vec![Value::Integer(1), Value::from("d")]),
            Err(TableError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_instance_oid() {
        let schema = sinx_like().unwrap();
        let key = schema
            .key_from(vec![Value::from("h"), Value::Integer(162)])
            .unwrap();
        assert_eq!(
            schema.instance_oid(3, &key).to_string(),
            "1.3.6.1.4.1.26171.1.1.51.1.3.1.104.162"
        );

        let scalar = Schema::new(
            "host",
            Oid::new([1, 3, 6, 1, 4, 1, 26171, 1, 1]),
            vec![Column::read_only(101, ProtocolType::Integer)],
            vec![],
            None,
        )
        .unwrap();
        assert!(scalar.is_scalar());
        assert_eq!(
            scalar.instance_oid(101, &Key::empty()).to_string(),
            "1.3.6.1.4.1.26171.1.1.101.0"
        );
    }
}
