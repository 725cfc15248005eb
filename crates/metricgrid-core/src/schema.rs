//! Schemas: the fixed column layout shared by every record of a stage.
//!
//! A schema is declared once at startup through [`SchemaBuilder`] and then
//! shared behind an `Arc`. Each column binds a value type to the merge
//! operator used when two partial records for the same key meet.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Type of the values stored in a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Int,
    Long,
    Double,
    Bool,
    Bytes,
}

impl ValueType {
    /// Whether arithmetic operators apply to this type.
    pub fn is_numeric(self) -> bool {
        matches!(self, ValueType::Int | ValueType::Long | ValueType::Double)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::String => "string",
            ValueType::Int => "int",
            ValueType::Long => "long",
            ValueType::Double => "double",
            ValueType::Bool => "bool",
            ValueType::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// How two partial values of one column combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOperator {
    /// Last write by arrival wins; an unset incoming value passes through.
    Cover,
    /// Accumulate.
    Sum,
    /// Keep summation and count, compute the average on read.
    Avg,
    Min,
    Max,
}

impl MergeOperator {
    /// Whether this operator can be bound to a column of `value_type`.
    pub fn supports(self, value_type: ValueType) -> bool {
        match self {
            MergeOperator::Cover => true,
            MergeOperator::Sum
            | MergeOperator::Avg
            | MergeOperator::Min
            | MergeOperator::Max => value_type.is_numeric(),
        }
    }
}

impl fmt::Display for MergeOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeOperator::Cover => "cover",
            MergeOperator::Sum => "sum",
            MergeOperator::Avg => "avg",
            MergeOperator::Min => "min",
            MergeOperator::Max => "max",
        };
        f.write_str(name)
    }
}

/// A single typed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub value_type: ValueType,
    pub operator: MergeOperator,
}

/// Immutable column layout of a stage.
#[derive(Debug, PartialEq, Eq)]
pub struct Schema {
    id: u32,
    name: String,
    columns: Vec<Column>,
}

impl Schema {
    /// Start declaring a schema.
    pub fn builder(id: u32, name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            id,
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    /// Position of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// Builder validating a schema before it is frozen.
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    id: u32,
    name: String,
    columns: Vec<Column>,
}

impl SchemaBuilder {
    /// Append a column.
    pub fn column(
        mut self,
        name: impl Into<String>,
        value_type: ValueType,
        operator: MergeOperator,
    ) -> Self {
        self.columns.push(Column {
            name: name.into(),
            value_type,
            operator,
        });
        self
    }

    /// Validate and freeze the schema.
    pub fn build(self) -> Result<Arc<Schema>, ConfigError> {
        if self.columns.is_empty() {
            return Err(ConfigError::EmptySchema { schema: self.name });
        }

        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(ConfigError::DuplicateColumn {
                    schema: self.name.clone(),
                    column: column.name.clone(),
                });
            }
            if !column.operator.supports(column.value_type) {
                return Err(ConfigError::UnsupportedOperator {
                    schema: self.name.clone(),
                    column: column.name.clone(),
                    value_type: column.value_type,
                    operator: column.operator,
                });
            }
        }

        Ok(Arc::new(Schema {
            id: self.id,
            name: self.name,
            columns: self.columns,
        }))
    }
}
