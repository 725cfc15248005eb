//! Typed records and per-column merge.
//!
//! A [`Record`] is one row of a [`Schema`]: an entity id, a time bucket and
//! one [`Cell`] per column. Its key is `"{entity_id}_{time_bucket}"`; two
//! records with the same key are partial updates of the same metric and
//! combine through [`Record::merge_from`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bucket::{self, DownSampling};
use crate::error::{MergeError, MergeResult};
use crate::schema::{Column, MergeOperator, Schema, ValueType};

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    String(String),
    Int(i32),
    Long(i64),
    Double(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::Int(_) => ValueType::Int,
            Value::Long(_) => ValueType::Long,
            Value::Double(_) => ValueType::Double,
            Value::Bool(_) => ValueType::Bool,
            Value::Bytes(_) => ValueType::Bytes,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(f64::from(*v)),
            Value::Long(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// Running average state of an `Avg` column.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Mean {
    pub summation: f64,
    pub count: u64,
}

impl Mean {
    pub fn new(summation: f64, count: u64) -> Self {
        Self { summation, count }
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.summation / self.count as f64
        }
    }

    fn combine(self, other: Mean) -> Mean {
        Mean {
            summation: self.summation + other.summation,
            count: self.count + other.count,
        }
    }
}

/// Storage slot of a column.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cell {
    /// Never written. Identity element of every operator.
    #[default]
    Unset,
    Value(Value),
    /// Only used by `Avg` columns.
    Mean(Mean),
}

impl Cell {
    pub fn is_unset(&self) -> bool {
        matches!(self, Cell::Unset)
    }
}

/// One aggregated row of a schema.
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<Schema>,
    entity_id: String,
    time_bucket: i64,
    key: String,
    cells: Vec<Cell>,
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.schema.id() == other.schema.id() && self.key == other.key && self.cells == other.cells
    }
}

/// Serializable form of a record, identified by schema id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub schema_id: u32,
    pub entity_id: String,
    pub time_bucket: i64,
    pub cells: Vec<Cell>,
}

/// Routing key of an entity in a time bucket.
pub fn record_key(entity_id: &str, time_bucket: i64) -> String {
    format!("{entity_id}_{time_bucket}")
}

impl Record {
    /// Create a record with every column unset.
    pub fn new(schema: Arc<Schema>, entity_id: impl Into<String>, time_bucket: i64) -> Self {
        let entity_id = entity_id.into();
        let key = record_key(&entity_id, time_bucket);
        let cells = vec![Cell::Unset; schema.len()];
        Self {
            schema,
            entity_id,
            time_bucket,
            key,
            cells,
        }
    }

    /// Build a record from raw cells, validating every slot against the schema.
    pub fn from_cells(
        schema: Arc<Schema>,
        entity_id: impl Into<String>,
        time_bucket: i64,
        cells: Vec<Cell>,
    ) -> MergeResult<Self> {
        if cells.len() != schema.len() {
            return Err(MergeError::ColumnCount {
                expected: schema.len(),
                found: cells.len(),
            });
        }
        for (column, cell) in schema.columns().iter().zip(&cells) {
            check_cell(column, cell)?;
        }
        let entity_id = entity_id.into();
        let key = record_key(&entity_id, time_bucket);
        Ok(Self {
            schema,
            entity_id,
            time_bucket,
            key,
            cells,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn schema_id(&self) -> u32 {
        self.schema.id()
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn time_bucket(&self) -> i64 {
        self.time_bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, index: usize) -> Option<&Cell> {
        self.cells.get(index)
    }

    fn column(&self, index: usize) -> MergeResult<&Column> {
        self.schema
            .column(index)
            .ok_or(MergeError::ColumnOutOfRange { index })
    }

    fn index(&self, name: &str) -> MergeResult<usize> {
        self.schema
            .index_of(name)
            .ok_or_else(|| MergeError::UnknownColumn(name.to_string()))
    }

    /// Write a single observation into a column.
    ///
    /// For `Avg` columns the observation becomes a mean of count one.
    pub fn set(&mut self, index: usize, value: impl Into<Value>) -> MergeResult<()> {
        let value = value.into();
        let column = self.column(index)?;
        if value.value_type() != column.value_type {
            return Err(MergeError::TypeMismatch {
                column: column.name.clone(),
                expected: column.value_type,
            });
        }
        let cell = match column.operator {
            MergeOperator::Avg => match value.as_f64() {
                Some(v) => Cell::Mean(Mean::new(v, 1)),
                None => {
                    return Err(MergeError::TypeMismatch {
                        column: column.name.clone(),
                        expected: column.value_type,
                    });
                }
            },
            _ => Cell::Value(value),
        };
        self.cells[index] = cell;
        Ok(())
    }

    pub fn set_by_name(&mut self, name: &str, value: impl Into<Value>) -> MergeResult<()> {
        let index = self.index(name)?;
        self.set(index, value)
    }

    /// Builder-style [`Record::set_by_name`].
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> MergeResult<Self> {
        self.set_by_name(name, value)?;
        Ok(self)
    }

    /// Write pre-aggregated mean state into an `Avg` column.
    pub fn set_mean(&mut self, index: usize, mean: Mean) -> MergeResult<()> {
        let column = self.column(index)?;
        check_cell(column, &Cell::Mean(mean))?;
        self.cells[index] = Cell::Mean(mean);
        Ok(())
    }

    /// Read a column. `Avg` columns return the average in the column type,
    /// using integer division for integral columns.
    pub fn get(&self, index: usize) -> Option<Value> {
        let column = self.schema.column(index)?;
        match self.cells.get(index)? {
            Cell::Unset => None,
            Cell::Value(v) => Some(v.clone()),
            Cell::Mean(mean) => {
                let count = mean.count.max(1);
                Some(match column.value_type {
                    ValueType::Int => Value::Int((mean.summation as i64 / count as i64) as i32),
                    ValueType::Long => Value::Long(mean.summation as i64 / count as i64),
                    _ => Value::Double(mean.average()),
                })
            }
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<Value> {
        self.get(self.schema.index_of(name)?)
    }

    /// Merge `other` into `self`, column by column.
    ///
    /// Both records must share the schema and the key. Every combined cell is
    /// computed before any is stored, so on error `self` is unchanged.
    pub fn merge_from(&mut self, other: &Record) -> MergeResult<()> {
        if self.schema.id() != other.schema.id() {
            return Err(MergeError::SchemaMismatch {
                expected: self.schema.id(),
                found: other.schema.id(),
            });
        }
        if self.key != other.key {
            return Err(MergeError::KeyMismatch {
                existing: self.key.clone(),
                incoming: other.key.clone(),
            });
        }

        let merged = self
            .schema
            .columns()
            .iter()
            .zip(self.cells.iter().zip(&other.cells))
            .map(|(column, (existing, incoming))| combine(column, existing, incoming))
            .collect::<MergeResult<Vec<_>>>()?;
        self.cells = merged;
        Ok(())
    }

    /// Copy this record into a coarser time bucket.
    pub fn rebucket(&self, level: DownSampling) -> MergeResult<Record> {
        let time_bucket = bucket::rebucket(self.time_bucket, level)?;
        Ok(Record {
            schema: Arc::clone(&self.schema),
            entity_id: self.entity_id.clone(),
            time_bucket,
            key: record_key(&self.entity_id, time_bucket),
            cells: self.cells.clone(),
        })
    }

    pub fn to_stored(&self) -> StoredRecord {
        StoredRecord {
            schema_id: self.schema.id(),
            entity_id: self.entity_id.clone(),
            time_bucket: self.time_bucket,
            cells: self.cells.clone(),
        }
    }

    /// Rebuild a record from its stored form. The schema id must match.
    pub fn from_stored(schema: Arc<Schema>, stored: StoredRecord) -> MergeResult<Self> {
        if stored.schema_id != schema.id() {
            return Err(MergeError::SchemaMismatch {
                expected: schema.id(),
                found: stored.schema_id,
            });
        }
        Record::from_cells(schema, stored.entity_id, stored.time_bucket, stored.cells)
    }
}

fn type_mismatch(column: &Column) -> MergeError {
    MergeError::TypeMismatch {
        column: column.name.clone(),
        expected: column.value_type,
    }
}

fn check_cell(column: &Column, cell: &Cell) -> MergeResult<()> {
    let ok = match (cell, column.operator) {
        (Cell::Unset, _) => true,
        (Cell::Mean(_), MergeOperator::Avg) => true,
        (Cell::Mean(_), _) | (Cell::Value(_), MergeOperator::Avg) => false,
        (Cell::Value(v), _) => v.value_type() == column.value_type,
    };
    if ok { Ok(()) } else { Err(type_mismatch(column)) }
}

/// Combine two cells of `column`. An unset side yields the other side.
fn combine(column: &Column, existing: &Cell, incoming: &Cell) -> MergeResult<Cell> {
    let (a, b) = match (existing, incoming) {
        (Cell::Unset, other) | (other, Cell::Unset) => return Ok(other.clone()),
        (a, b) => (a, b),
    };

    match column.operator {
        MergeOperator::Cover => Ok(b.clone()),
        MergeOperator::Avg => match (a, b) {
            (Cell::Mean(x), Cell::Mean(y)) => Ok(Cell::Mean(x.combine(*y))),
            _ => Err(type_mismatch(column)),
        },
        MergeOperator::Sum => {
            let (Cell::Value(x), Cell::Value(y)) = (a, b) else {
                return Err(type_mismatch(column));
            };
            let overflow = || MergeError::Overflow {
                column: column.name.clone(),
            };
            let sum = match (x, y) {
                (Value::Int(x), Value::Int(y)) => Value::Int(x.checked_add(*y).ok_or_else(overflow)?),
                (Value::Long(x), Value::Long(y)) => {
                    Value::Long(x.checked_add(*y).ok_or_else(overflow)?)
                }
                (Value::Double(x), Value::Double(y)) => Value::Double(x + y),
                _ => return Err(type_mismatch(column)),
            };
            Ok(Cell::Value(sum))
        }
        MergeOperator::Min | MergeOperator::Max => {
            let (Cell::Value(x), Cell::Value(y)) = (a, b) else {
                return Err(type_mismatch(column));
            };
            let keep_min = column.operator == MergeOperator::Min;
            let picked = match (x, y) {
                (Value::Int(x), Value::Int(y)) => Value::Int(if keep_min { *x.min(y) } else { *x.max(y) }),
                (Value::Long(x), Value::Long(y)) => {
                    Value::Long(if keep_min { *x.min(y) } else { *x.max(y) })
                }
                (Value::Double(x), Value::Double(y)) => {
                    Value::Double(if keep_min { x.min(*y) } else { x.max(*y) })
                }
                _ => return Err(type_mismatch(column)),
            };
            Ok(Cell::Value(picked))
        }
    }
}
