//! Worker roles: the static identity of a stage.

use std::sync::Arc;

use metricgrid_cluster::{Selector, SelectorKind};
use metricgrid_core::{RoleId, Schema};

/// Identity, schema and routing of one stage. Never mutated after startup.
#[derive(Debug)]
pub struct WorkerRole {
    id: RoleId,
    name: String,
    schema: Arc<Schema>,
    selector: Option<Selector>,
}

impl WorkerRole {
    /// A role whose records are always processed locally.
    pub fn new(id: RoleId, name: impl Into<String>, schema: Arc<Schema>) -> Self {
        Self {
            id,
            name: name.into(),
            schema,
            selector: None,
        }
    }

    /// Route records to their owner before processing.
    pub fn routed(mut self, kind: SelectorKind) -> Self {
        self.selector = Some(Selector::new(kind));
        self
    }

    pub fn id(&self) -> RoleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn selector(&self) -> Option<&Selector> {
        self.selector.as_ref()
    }
}
