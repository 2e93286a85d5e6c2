//! redb table definitions.
//!
//! All tables use `&str` keys and `&[u8]` JSON values.

use redb::TableDefinition;

/// Provisioned resources keyed by `{env}/{kind}/{name}`.
pub const RESOURCES: TableDefinition<&str, &[u8]> = TableDefinition::new("resources");

/// Stack outputs keyed by `{env}/{key}`.
pub const OUTPUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("outputs");

/// Last observed target health keyed by `{env}/{target_group}/{target}`.
pub const TARGET_HEALTH: TableDefinition<&str, &[u8]> = TableDefinition::new("target_health");
