use super::types::{
    AutoIdStrategy, EntryDefinition, IdConfig, PropertyDefinition, SchemaDefinition, SchemaType,
};
use crate::error::{FlowstateError, Result};
use crate::util::yaml_to_json;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

/// A compiled schema entry, keyed by dotted path in the registry
/// (`users`, `users/items`, `users/items/address`, ...).
#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub schema_type: SchemaType,
    /// Declared properties, in declaration order (object entries).
    pub properties: Vec<PropertyEntry>,
    pub pattern_properties: Vec<PatternEntry>,
    pub additional_properties: bool,
    /// Id generation and affix rules (collection entries).
    pub id: Option<IdRules>,
    /// Schema path of the referenced collection, when this entry's values
    /// are relation-bearing ids.
    pub relation: Option<String>,
    pub unique_items: bool,
}

impl SchemaEntry {
    pub fn primitive(schema_type: SchemaType) -> Self {
        SchemaEntry {
            schema_type,
            properties: Vec::new(),
            pattern_properties: Vec::new(),
            additional_properties: true,
            id: None,
            relation: None,
            unique_items: false,
        }
    }
}

/// A compiled object property.
#[derive(Debug, Clone)]
pub struct PropertyEntry {
    pub name: String,
    pub schema_type: SchemaType,
    pub required: bool,
    pub default: Option<Value>,
    pub relation: Option<String>,
}

/// A compiled pattern property. The regex is compiled once at registration.
#[derive(Debug, Clone)]
pub struct PatternEntry {
    pub pattern: Regex,
    pub schema_type: SchemaType,
    pub relation: Option<String>,
}

/// Id rules for a collection.
#[derive(Debug, Clone, Default)]
pub struct IdRules {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub default: Option<String>,
    pub auto: Option<AutoIdStrategy>,
}

impl IdRules {
    fn from_config(config: &IdConfig) -> Self {
        IdRules {
            prefix: config.prefix.clone(),
            suffix: config.suffix.clone(),
            default: config.default.clone(),
            auto: config.auto,
        }
    }

    pub fn has_affixes(&self) -> bool {
        self.prefix.is_some() || self.suffix.is_some()
    }

    /// Wrap an id in this collection's prefix and suffix.
    pub fn affixed(&self, id: &str) -> String {
        format!(
            "{}{}{}",
            self.prefix.as_deref().unwrap_or(""),
            id,
            self.suffix.as_deref().unwrap_or("")
        )
    }
}

/// Path-keyed lookup table of compiled schema entries. Read-only after
/// setup; absence of an entry at a path means "no validation at that path."
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entries: HashMap<String, SchemaEntry>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, path: impl Into<String>, entry: SchemaEntry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn get(&self, path: &str) -> Option<&SchemaEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Compile a parsed declaration into path-keyed entries.
    pub fn load(&mut self, definition: &SchemaDefinition) -> Result<()> {
        for (name, entry) in &definition.collections {
            self.compile_entry(name, entry)?;
        }
        Ok(())
    }

    /// Parse and compile a YAML declaration in one step.
    pub fn load_str(&mut self, yaml: &str) -> Result<()> {
        let definition = super::parser::parse_schema_str(yaml)?;
        self.load(&definition)
    }

    fn compile_entry(&mut self, path: &str, definition: &EntryDefinition) -> Result<()> {
        let mut entry = SchemaEntry {
            schema_type: definition.entry_type,
            properties: Vec::new(),
            pattern_properties: Vec::new(),
            additional_properties: definition.additional_properties.unwrap_or(true),
            id: definition.id.as_ref().map(IdRules::from_config),
            relation: definition.relation.clone(),
            unique_items: definition.unique_items,
        };

        match definition.entry_type {
            SchemaType::Object => {
                for property in &definition.properties {
                    entry.properties.push(self.compile_property(path, property)?);
                }
                for (pattern, property) in &definition.pattern_properties {
                    let regex = Regex::new(pattern).map_err(|e| {
                        FlowstateError::Schema(format!(
                            "Invalid pattern property '{pattern}' at '{path}': {e}"
                        ))
                    })?;
                    entry.pattern_properties.push(PatternEntry {
                        pattern: regex,
                        schema_type: property.property_type,
                        relation: property.relation.clone(),
                    });
                }
            }
            SchemaType::Array | SchemaType::Collection => {
                if let Some(items) = &definition.items {
                    self.compile_entry(&format!("{path}/items"), items)?;
                }
            }
            _ => {}
        }

        self.entries.insert(path.to_string(), entry);
        Ok(())
    }

    fn compile_property(
        &mut self,
        parent_path: &str,
        property: &PropertyDefinition,
    ) -> Result<PropertyEntry> {
        // Compound properties get their own registry entry one level down.
        match property.property_type {
            SchemaType::Object | SchemaType::Array | SchemaType::Collection => {
                let sub_path = format!("{parent_path}/{}", property.name);
                self.compile_entry(&sub_path, &property.as_entry())?;
            }
            _ => {}
        }

        Ok(PropertyEntry {
            name: property.name.clone(),
            schema_type: property.property_type,
            required: property.required,
            default: property.default.as_ref().map(yaml_to_json),
            relation: property.relation.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::parse_schema_str;

    fn registry_from(yaml: &str) -> SchemaRegistry {
        let definition = parse_schema_str(yaml).unwrap();
        let mut registry = SchemaRegistry::new();
        registry.load(&definition).unwrap();
        registry
    }

    #[test]
    fn test_compile_collection_paths() {
        let registry = registry_from(
            r#"
collections:
  users:
    type: collection
    id: { prefix: "usr_", auto: nanoid }
    items:
      type: object
      properties:
        - { name: tag, type: string, required: true, relation: tags/items }
        - name: address
          type: object
          properties:
            - { name: city, type: string, required: true }
      additional_properties: false
"#,
        );

        let users = registry.get("users").unwrap();
        assert_eq!(users.schema_type, SchemaType::Collection);
        let rules = users.id.as_ref().unwrap();
        assert_eq!(rules.prefix.as_deref(), Some("usr_"));
        assert_eq!(rules.auto, Some(AutoIdStrategy::Nanoid));

        let items = registry.get("users/items").unwrap();
        assert_eq!(items.schema_type, SchemaType::Object);
        assert!(!items.additional_properties);
        assert_eq!(items.properties.len(), 2);
        assert_eq!(items.properties[0].name, "tag");
        assert_eq!(items.properties[0].relation.as_deref(), Some("tags/items"));

        let address = registry.get("users/items/address").unwrap();
        assert_eq!(address.schema_type, SchemaType::Object);
        assert_eq!(address.properties[0].name, "city");
    }

    #[test]
    fn test_compile_array_items() {
        let registry = registry_from(
            r#"
collections:
  tags:
    type: collection
    items: { type: string }
  lists:
    type: collection
    items:
      type: object
      properties:
        - name: entries
          type: array
          unique_items: true
          items: { type: string, relation: tags/items }
"#,
        );

        let entries = registry.get("lists/items/entries").unwrap();
        assert_eq!(entries.schema_type, SchemaType::Array);
        assert!(entries.unique_items);

        let element = registry.get("lists/items/entries/items").unwrap();
        assert_eq!(element.schema_type, SchemaType::String);
        assert_eq!(element.relation.as_deref(), Some("tags/items"));
    }

    #[test]
    fn test_pattern_property_compilation() {
        let registry = registry_from(
            r#"
collections:
  settings:
    type: object
    properties:
      - { name: theme, type: string }
    pattern_properties:
      "^x-": { type: string }
    additional_properties: false
"#,
        );

        let settings = registry.get("settings").unwrap();
        assert_eq!(settings.pattern_properties.len(), 1);
        assert!(settings.pattern_properties[0].pattern.is_match("x-custom"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let definition = parse_schema_str(
            r#"
collections:
  settings:
    type: object
    pattern_properties:
      "[": { type: string }
"#,
        )
        .unwrap();
        let mut registry = SchemaRegistry::new();
        assert!(registry.load(&definition).is_err());
    }

    #[test]
    fn test_default_values_converted_to_json() {
        let registry = registry_from(
            r#"
collections:
  users:
    type: collection
    items:
      type: object
      properties:
        - { name: role, type: string, default: member }
        - { name: age, type: number, default: 0 }
"#,
        );

        let items = registry.get("users/items").unwrap();
        assert_eq!(items.properties[0].default, Some(serde_json::json!("member")));
        assert_eq!(items.properties[1].default, Some(serde_json::json!(0)));
    }

    #[test]
    fn test_absent_path_is_none() {
        let registry = registry_from("collections: {}");
        assert!(registry.get("missing").is_none());
    }
}
