//! Schema-driven, ordered row storage.
//!
//! A [`Table`] maps composite [`Key`]s to shared [`Row`] handles. Every
//! operation takes the table's single internal lock, so operations on one
//! table are linearizable. Callers never see references into the map:
//! lookups hand out [`RowRef`] clones and range queries return point-in-time
//! vectors of them, which can be iterated without holding any lock.
//!
//! Each row guards its own cells with a separate lock. A row's key is fixed
//! at construction; only non-index columns can change afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::TableError;
use crate::schema::Schema;
use crate::value::Value;

/// A composite row key: the ordered tuple of index-column values.
///
/// Keys compare lexicographically, so a key always sorts after every one of
/// its prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Vec<Value>);

impl Key {
    /// Creates a key from its components without validation.
    ///
    /// Use [`Schema::key_from`] to validate against a table's index.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// The empty key, used by scalar groups and as the "before first" cursor.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Returns the key components.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Returns the number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` for the empty key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if `prefix` matches the leading components of this key.
    pub fn starts_with(&self, prefix: &[Value]) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}

impl From<Vec<Value>> for Key {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// A shared handle to a row.
pub type RowRef = Arc<Row>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One table row: an immutable key plus lock-guarded column values.
#[derive(Debug)]
pub struct Row {
    schema: Arc<Schema>,
    key: Key,
    cells: Mutex<BTreeMap<u32, Value>>,
}

impl Row {
    /// Creates a detached row whose non-index columns hold zero values.
    ///
    /// # Errors
    ///
    /// Returns [`TableError`] if `key` does not fit the schema's index.
    pub fn new(schema: Arc<Schema>, key: Key) -> Result<Self, TableError> {
        schema.validate_key(key.values())?;
        let cells = schema
            .columns()
            .iter()
            .filter(|c| schema.index_position(c.id).is_none())
            .map(|c| (c.id, Value::zero(c.protocol_type)))
            .collect();
        Ok(Self {
            schema,
            key,
            cells: Mutex::new(cells),
        })
    }

    /// Returns the row's key.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Returns the schema the row conforms to.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Reads one column. Index columns are answered from the key.
    pub fn get(&self, column: u32) -> Option<Value> {
        if let Some(position) = self.schema.index_position(column) {
            return self.key.values().get(position).cloned();
        }
        lock(&self.cells).get(&column).cloned()
    }

    /// Writes one non-index column, returning its previous value.
    ///
    /// This is the engine's internal write path: read-only columns are
    /// accepted.
    ///
    /// # Errors
    ///
    /// Returns [`TableError`] for unknown columns, index columns and type
    /// mismatches.
    pub fn put(&self, column: u32, value: Value) -> Result<Value, TableError> {
        self.check(column, &value, false)?;
        let mut cells = lock(&self.cells);
        Ok(cells.insert(column, value).unwrap_or_else(|| {
            self.schema
                .column(column)
                .map_or(Value::Integer(0), |c| Value::zero(c.protocol_type))
        }))
    }

    /// Writes one column on behalf of a management session.
    ///
    /// Like [`Row::put`], but read-only columns are rejected too.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::ReadOnlyColumn`] in addition to the errors of
    /// [`Row::put`].
    pub fn set(&self, column: u32, value: Value) -> Result<Value, TableError> {
        self.check(column, &value, true)?;
        self.put(column, value)
    }

    /// Applies several column writes atomically.
    ///
    /// Every write is validated before any is applied; readers observe
    /// either none or all of them.
    ///
    /// # Errors
    ///
    /// Returns the first validation error; the row is then left untouched.
    pub fn update<I>(&self, values: I) -> Result<(), TableError>
    where
        I: IntoIterator<Item = (u32, Value)>,
    {
        let values: Vec<(u32, Value)> = values.into_iter().collect();
        for (column, value) in &values {
            self.check(*column, value, false)?;
        }
        let mut cells = lock(&self.cells);
        cells.extend(values);
        Ok(())
    }

    /// Replaces one column with `f` of its current value under the row lock,
    /// returning the new value. Concurrent writers cannot slip in between
    /// the read and the write.
    ///
    /// # Errors
    ///
    /// Same as [`Row::put`], checked against the value `f` returns; the
    /// column is then left untouched.
    pub fn modify<F>(&self, column: u32, f: F) -> Result<Value, TableError>
    where
        F: FnOnce(&Value) -> Value,
    {
        let mut cells = lock(&self.cells);
        // Every non-index column has a cell from construction on.
        let Some(current) = cells.get(&column) else {
            let table = self.schema.name().to_string();
            return Err(if self.schema.index_position(column).is_some() {
                TableError::IndexColumn { table, column }
            } else {
                TableError::UnknownColumn { table, column }
            });
        };
        let next = f(current);
        self.check(column, &next, false)?;
        cells.insert(column, next.clone());
        Ok(next)
    }

    /// Returns a point-in-time copy of every column, index columns included.
    pub fn values(&self) -> BTreeMap<u32, Value> {
        let mut out = lock(&self.cells).clone();
        let own = &self.key.values()[self.schema.parent_index().len()..];
        for (&id, value) in self.schema.index().iter().zip(own) {
            out.insert(id, value.clone());
        }
        out
    }

    fn check(&self, column: u32, value: &Value, protocol: bool) -> Result<(), TableError> {
        let table = || self.schema.name().to_string();
        let Some(declared) = self.schema.column(column) else {
            return Err(TableError::UnknownColumn {
                table: table(),
                column,
            });
        };
        if self.schema.index_position(column).is_some() {
            return Err(TableError::IndexColumn {
                table: table(),
                column,
            });
        }
        if protocol && !declared.mutable {
            return Err(TableError::ReadOnlyColumn {
                table: table(),
                column,
            });
        }
        if declared.protocol_type != value.protocol_type() {
            return Err(TableError::TypeMismatch {
                table: table(),
                column,
                expected: declared.protocol_type,
                actual: value.protocol_type(),
            });
        }
        Ok(())
    }
}

/// An ordered, thread-safe collection of rows sharing one schema.
#[derive(Debug)]
pub struct Table {
    schema: Arc<Schema>,
    rows: Mutex<BTreeMap<Key, RowRef>>,
}

impl Table {
    /// Creates an empty table.
    pub fn new(schema: Schema) -> Self {
        Self {
            schema: Arc::new(schema),
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the table's schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Returns the table's name.
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    /// Builds a new, not yet inserted, row for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TableError`] if `key` does not fit the schema's index.
    pub fn new_row(&self, key: Key) -> Result<RowRef, TableError> {
        Row::new(Arc::clone(&self.schema), key).map(Arc::new)
    }

    /// Looks up a row.
    pub fn find(&self, key: &Key) -> Option<RowRef> {
        lock(&self.rows).get(key).cloned()
    }

    /// Returns every row whose key starts with `prefix`, in key order.
    pub fn find_by_prefix(&self, prefix: &[Value]) -> Vec<RowRef> {
        let start = Key(prefix.to_vec());
        lock(&self.rows)
            .range(start..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, row)| Arc::clone(row))
            .collect()
    }

    /// Inserts a row built for this table.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::DuplicateKey`] if the key is taken and
    /// [`TableError::InvalidKey`] if the row belongs to another schema.
    pub fn insert(&self, row: RowRef) -> Result<(), TableError> {
        if row.schema.name() != self.schema.name() {
            return Err(TableError::InvalidKey {
                table: self.name().to_string(),
                reason: format!("row belongs to table '{}'", row.schema.name()),
            });
        }
        let mut rows = lock(&self.rows);
        if rows.contains_key(row.key()) {
            return Err(TableError::DuplicateKey {
                table: self.name().to_string(),
                key: row.key().to_string(),
            });
        }
        rows.insert(row.key().clone(), row);
        Ok(())
    }

    /// Removes the row stored under `key`, returning it.
    ///
    /// # Errors
    ///
    /// Returns [`TableError::NotFound`] if no such row exists.
    pub fn erase(&self, key: &Key) -> Result<RowRef, TableError> {
        lock(&self.rows)
            .remove(key)
            .ok_or_else(|| TableError::NotFound {
                table: self.name().to_string(),
                key: key.to_string(),
            })
    }

    /// Removes `row` only if it is still the row stored under its key.
    ///
    /// Returns `true` if the row was removed. A row that was erased and
    /// replaced by another under the same key is left alone.
    pub fn erase_row(&self, row: &RowRef) -> bool {
        let mut rows = lock(&self.rows);
        match rows.get(row.key()) {
            Some(current) if Arc::ptr_eq(current, row) => {
                rows.remove(row.key());
                true
            }
            _ => false,
        }
    }

    /// Removes every row whose key starts with `prefix`, returning how many.
    pub fn erase_by_prefix(&self, prefix: &[Value]) -> usize {
        let mut rows = lock(&self.rows);
        let doomed: Vec<Key> = rows
            .range(Key(prefix.to_vec())..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            rows.remove(key);
        }
        doomed.len()
    }

    /// Returns the first row whose key sorts strictly after `key`.
    pub fn next_after(&self, key: &Key) -> Option<RowRef> {
        lock(&self.rows)
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(_, row)| Arc::clone(row))
    }

    /// Returns the first row in key order.
    pub fn first(&self) -> Option<RowRef> {
        lock(&self.rows).values().next().cloned()
    }

    /// Returns a point-in-time copy of every row, in key order.
    pub fn rows(&self) -> Vec<RowRef> {
        lock(&self.rows).values().cloned().collect()
    }

    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    /// Returns `true` if the table holds no rows.
    pub fn is_empty(&self) -> bool {
        lock(&self.rows).is_empty()
    }
}
