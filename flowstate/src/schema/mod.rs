pub mod parser;
pub mod registry;
pub mod types;

pub use parser::parse_schema_str;
pub use registry::{IdRules, PatternEntry, PropertyEntry, SchemaEntry, SchemaRegistry};
pub use types::{
    AutoIdStrategy, EntryDefinition, IdConfig, PropertyDefinition, SchemaDefinition, SchemaType,
};
