//! Record ↔ wire message mapping.
//!
//! The mapping is 1:1 over the column slots. Decoding checks the schema id
//! and the column layout against the receiving stage's schema.

use std::sync::Arc;

use metricgrid_core::{Cell, Mean, MergeError, MergeResult, Record, RoleId, Schema, Value};

use crate::proto::{MeanValue, RemoteMessage, TypedValue, typed_value::Kind};

fn encode_cell(cell: &Cell) -> TypedValue {
    let kind = match cell {
        Cell::Unset => None,
        Cell::Mean(m) => Some(Kind::Mean(MeanValue {
            summation: m.summation,
            count: m.count,
        })),
        Cell::Value(v) => Some(match v {
            Value::String(s) => Kind::StringValue(s.clone()),
            Value::Int(i) => Kind::IntValue(*i),
            Value::Long(l) => Kind::LongValue(*l),
            Value::Double(d) => Kind::DoubleValue(*d),
            Value::Bool(b) => Kind::BoolValue(*b),
            Value::Bytes(b) => Kind::BytesValue(b.clone()),
        }),
    };
    TypedValue { kind }
}

fn decode_cell(value: TypedValue) -> Cell {
    match value.kind {
        None => Cell::Unset,
        Some(Kind::Mean(m)) => Cell::Mean(Mean::new(m.summation, m.count)),
        Some(Kind::StringValue(s)) => Cell::Value(Value::String(s)),
        Some(Kind::IntValue(i)) => Cell::Value(Value::Int(i)),
        Some(Kind::LongValue(l)) => Cell::Value(Value::Long(l)),
        Some(Kind::DoubleValue(d)) => Cell::Value(Value::Double(d)),
        Some(Kind::BoolValue(b)) => Cell::Value(Value::Bool(b)),
        Some(Kind::BytesValue(b)) => Cell::Value(Value::Bytes(b)),
    }
}

/// Encode a record addressed to `role`.
pub fn encode(role: RoleId, record: &Record) -> RemoteMessage {
    RemoteMessage {
        worker_role_id: role.raw(),
        schema_id: record.schema_id(),
        entity_id: record.entity_id().to_string(),
        time_bucket: record.time_bucket(),
        columns: record.cells().iter().map(encode_cell).collect(),
        heartbeat: false,
    }
}

/// Decode a message against the schema of the receiving stage.
pub fn decode(schema: &Arc<Schema>, message: RemoteMessage) -> MergeResult<Record> {
    if message.schema_id != schema.id() {
        return Err(MergeError::SchemaMismatch {
            expected: schema.id(),
            found: message.schema_id,
        });
    }
    let cells = message.columns.into_iter().map(decode_cell).collect();
    Record::from_cells(Arc::clone(schema), message.entity_id, message.time_bucket, cells)
}

#[cfg(test)]
mod tests {
    use super::*;
    use metricgrid_core::{MergeOperator, ValueType};

    fn schema(id: u32) -> Arc<Schema> {
        Schema::builder(id, "all_types")
            .column("s", ValueType::String, MergeOperator::Cover)
            .column("i", ValueType::Int, MergeOperator::Max)
            .column("l", ValueType::Long, MergeOperator::Sum)
            .column("d", ValueType::Double, MergeOperator::Avg)
            .column("b", ValueType::Bool, MergeOperator::Cover)
            .column("bytes", ValueType::Bytes, MergeOperator::Cover)
            .column("unset", ValueType::Long, MergeOperator::Sum)
            .build()
            .unwrap()
    }

    #[test]
    fn every_slot_survives_the_wire() {
        let record = Record::new(schema(3), "svc", 202401010000)
            .with("s", "x")
            .unwrap()
            .with("i", 7)
            .unwrap()
            .with("l", 9_i64)
            .unwrap()
            .with("d", 1.5)
            .unwrap()
            .with("b", true)
            .unwrap()
            .with("bytes", vec![1_u8, 2, 3])
            .unwrap();

        let message = encode(RoleId(42), &record);
        assert_eq!(message.worker_role_id, 42);
        assert_eq!(message.columns.len(), 7);
        assert!(message.columns[6].kind.is_none());

        let back = decode(&schema(3), message).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn schema_id_must_match() {
        let record = Record::new(schema(3), "svc", 202401010000);
        let err = decode(&schema(4), encode(RoleId(1), &record)).unwrap_err();
        assert_eq!(err, MergeError::SchemaMismatch { expected: 4, found: 3 });
    }

    #[test]
    fn malformed_layout_is_rejected() {
        let record = Record::new(schema(3), "svc", 202401010000);
        let mut message = encode(RoleId(1), &record);
        message.columns.pop();
        assert!(matches!(
            decode(&schema(3), message),
            Err(MergeError::ColumnCount { .. })
        ));

        let mut message = encode(RoleId(1), &record);
        message.columns[2] = TypedValue {
            kind: Some(Kind::StringValue("not a long".into())),
        };
        assert!(matches!(
            decode(&schema(3), message),
            Err(MergeError::TypeMismatch { .. })
        ));
    }
}
