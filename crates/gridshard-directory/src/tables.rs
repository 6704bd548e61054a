//! redb table definitions for the GridShard directory.

use redb::TableDefinition;

/// Instance records keyed by instance name, JSON-serialized.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");
