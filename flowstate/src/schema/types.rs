use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level schema declaration parsed from YAML.
/// Each key names a root path in the store; the entry describes the shape of
/// the data that path may hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub collections: HashMap<String, EntryDefinition>,
}

/// Declaration of a single schema entry (a collection, object, array, or
/// primitive slot). Nested entries compile into deeper registry paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDefinition {
    #[serde(rename = "type")]
    pub entry_type: SchemaType,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
    #[serde(default)]
    pub pattern_properties: HashMap<String, PropertyDefinition>,
    /// Defaults to true when absent.
    #[serde(default)]
    pub additional_properties: Option<bool>,
    #[serde(default)]
    pub items: Option<Box<EntryDefinition>>,
    #[serde(default)]
    pub id: Option<IdConfig>,
    /// Schema path of the collection this value references.
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub unique_items: bool,
}

/// Declaration of a single property on an object entry. Order in the
/// declaration is preserved through compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDefinition {
    /// Property name. Unused (and may be omitted) for pattern properties,
    /// where the pattern itself is the key.
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub property_type: SchemaType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyDefinition>,
    #[serde(default)]
    pub pattern_properties: HashMap<String, PropertyDefinition>,
    #[serde(default)]
    pub additional_properties: Option<bool>,
    #[serde(default)]
    pub items: Option<Box<EntryDefinition>>,
    #[serde(default)]
    pub unique_items: bool,
}

impl PropertyDefinition {
    /// View a compound property as an entry declaration so it can be
    /// compiled at its own sub-path.
    pub(crate) fn as_entry(&self) -> EntryDefinition {
        EntryDefinition {
            entry_type: self.property_type,
            properties: self.properties.clone(),
            pattern_properties: self.pattern_properties.clone(),
            additional_properties: self.additional_properties,
            items: self.items.clone(),
            id: None,
            relation: self.relation.clone(),
            unique_items: self.unique_items,
        }
    }
}

/// Closed set of value shapes the store can validate.
/// `function` and `node` are host-owned handles and are opaque to validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Object,
    Array,
    Collection,
    String,
    Number,
    Boolean,
    Function,
    Node,
}

impl SchemaType {
    pub fn name(&self) -> &'static str {
        match self {
            SchemaType::Object => "object",
            SchemaType::Array => "array",
            SchemaType::Collection => "collection",
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Boolean => "boolean",
            SchemaType::Function => "function",
            SchemaType::Node => "node",
        }
    }
}

/// Configuration for document id generation and affixing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdConfig {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub suffix: Option<String>,
    /// Fixed default id used when the caller supplies none.
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub auto: Option<AutoIdStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoIdStrategy {
    Ulid,
    Uuid,
    Nanoid,
}
