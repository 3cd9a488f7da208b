//! redb table definitions for the poolscale state store.

use redb::TableDefinition;

/// Autoscaler status keyed by autoscaler name; JSON values.
pub const STATUSES: TableDefinition<&str, &[u8]> = TableDefinition::new("statuses");
