//! Storage models: where the rows of one schema at one granularity live.

use std::sync::Arc;

use metricgrid_core::{DownSampling, Schema};

/// One logical table.
#[derive(Debug, Clone)]
pub struct Model {
    pub name: String,
    pub schema: Arc<Schema>,
    pub downsampling: DownSampling,
}

impl Model {
    pub fn new(name: impl Into<String>, schema: Arc<Schema>, downsampling: DownSampling) -> Self {
        Self {
            name: name.into(),
            schema,
            downsampling,
        }
    }

    /// Model of a stream at `level`: `<base>`, `<base>_hour` or `<base>_day`.
    pub fn for_level(base: &str, schema: Arc<Schema>, level: DownSampling) -> Self {
        Self::new(format!("{base}{}", level.table_suffix()), schema, level)
    }
}

/// Row id of a record inside a model table.
pub fn row_id(key: &str, time_bucket: i64) -> String {
    format!("{time_bucket}:{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use metricgrid_core::{MergeOperator, ValueType};

    #[test]
    fn level_names() {
        let schema = Schema::builder(1, "service_cpm")
            .column("total", ValueType::Long, MergeOperator::Sum)
            .build()
            .unwrap();
        assert_eq!(Model::for_level("service_cpm", schema.clone(), DownSampling::Minute).name, "service_cpm");
        assert_eq!(Model::for_level("service_cpm", schema.clone(), DownSampling::Hour).name, "service_cpm_hour");
        assert_eq!(Model::for_level("service_cpm", schema, DownSampling::Day).name, "service_cpm_day");
    }
}
