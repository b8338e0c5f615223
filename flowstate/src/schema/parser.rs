use super::types::SchemaDefinition;
use crate::error::Result;

/// Parse a schema YAML string into a SchemaDefinition
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let schema: SchemaDefinition = serde_yaml::from_str(content)?;
    Ok(schema)
}
