use crate::error::{FlowstateError, Result};
use crate::schema::{PropertyEntry, SchemaEntry, SchemaRegistry, SchemaType};
use serde_json::Value;

/// A reference discovered while validating a value: the owning document
/// points at `collection/id`. The store turns these into relation edges
/// after the write is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationTarget {
    pub collection: String,
    pub id: String,
}

impl RelationTarget {
    pub fn from_schema_path(relation: &str, id: &str) -> Self {
        // The relation option names a schema path (`tags/items`); the
        // referenced collection is its first segment.
        let collection = relation.split('/').next().unwrap_or(relation);
        RelationTarget {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

/// Validate a value against the schema entry at `path`, applying property
/// defaults in place and collecting relation targets.
///
/// No entry at `path` means no validation: the value passes unchanged.
/// Any violation aborts before the store mutates anything, so a failed
/// write has no partial effect.
pub fn validate_value(
    registry: &SchemaRegistry,
    path: &str,
    value: &mut Value,
) -> Result<Vec<RelationTarget>> {
    let mut relations = Vec::new();
    validate_at(registry, path, value, &mut relations)?;
    Ok(relations)
}

fn validate_at(
    registry: &SchemaRegistry,
    path: &str,
    value: &mut Value,
    relations: &mut Vec<RelationTarget>,
) -> Result<()> {
    let Some(entry) = registry.get(path) else {
        return Ok(());
    };
    validate_entry(registry, path, entry, value, relations)
}

fn validate_entry(
    registry: &SchemaRegistry,
    path: &str,
    entry: &SchemaEntry,
    value: &mut Value,
    relations: &mut Vec<RelationTarget>,
) -> Result<()> {
    match entry.schema_type {
        SchemaType::String => {
            let Some(s) = value.as_str() else {
                return Err(unexpected(path, "string", value));
            };
            if let Some(relation) = &entry.relation {
                relations.push(RelationTarget::from_schema_path(relation, s));
            }
            Ok(())
        }
        SchemaType::Number => {
            if !value.is_number() {
                return Err(unexpected(path, "number", value));
            }
            Ok(())
        }
        SchemaType::Boolean => {
            if !value.is_boolean() {
                return Err(unexpected(path, "boolean", value));
            }
            Ok(())
        }
        // Host-owned handles; the store treats them as opaque.
        SchemaType::Function | SchemaType::Node => Ok(()),
        SchemaType::Object => validate_object(registry, path, entry, value, relations),
        SchemaType::Array => validate_array(registry, path, entry, value, relations),
        SchemaType::Collection => {
            // A full collection value is a mapping of id -> document.
            let Some(map) = value.as_object_mut() else {
                return Err(unexpected(path, "object", value));
            };
            let items_path = format!("{path}/items");
            for document in map.values_mut() {
                validate_at(registry, &items_path, document, relations)?;
            }
            Ok(())
        }
    }
}

fn validate_object(
    registry: &SchemaRegistry,
    path: &str,
    entry: &SchemaEntry,
    value: &mut Value,
    relations: &mut Vec<RelationTarget>,
) -> Result<()> {
    if !value.is_object() {
        return Err(unexpected(path, "object", value));
    }

    for property in &entry.properties {
        let map = value.as_object_mut().expect("checked above");
        let current = map.get(&property.name);
        let missing = current.is_none() || current == Some(&Value::Null);

        if missing {
            if let Some(default) = &property.default {
                map.insert(property.name.clone(), default.clone());
            } else if property.required {
                return Err(FlowstateError::RequiredProperty {
                    path: path.to_string(),
                    property: property.name.clone(),
                });
            } else {
                continue;
            }
        }

        let mut property_value = map
            .get(&property.name)
            .cloned()
            .expect("present or defaulted");
        validate_property(registry, path, property, &mut property_value, relations)?;
        // Nested validation may have applied defaults of its own.
        value
            .as_object_mut()
            .expect("checked above")
            .insert(property.name.clone(), property_value);
    }

    // Undeclared keys: try pattern properties, then the additional flag.
    let declared: Vec<String> = entry.properties.iter().map(|p| p.name.clone()).collect();
    let map = value.as_object_mut().expect("checked above");
    for (key, val) in map.iter() {
        if declared.iter().any(|name| name == key) {
            continue;
        }
        let pattern = entry
            .pattern_properties
            .iter()
            .find(|p| p.pattern.is_match(key));
        match pattern {
            Some(pattern) => {
                check_primitive(path, key, pattern.schema_type, val)?;
                if let (Some(relation), Some(s)) = (&pattern.relation, val.as_str()) {
                    relations.push(RelationTarget::from_schema_path(relation, s));
                }
            }
            None => {
                if !entry.additional_properties {
                    return Err(FlowstateError::AdditionalProperty {
                        path: path.to_string(),
                        property: key.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

fn validate_property(
    registry: &SchemaRegistry,
    parent_path: &str,
    property: &PropertyEntry,
    value: &mut Value,
    relations: &mut Vec<RelationTarget>,
) -> Result<()> {
    match property.schema_type {
        SchemaType::Object | SchemaType::Array | SchemaType::Collection => {
            let sub_path = format!("{parent_path}/{}", property.name);
            validate_at(registry, &sub_path, value, relations)
        }
        other => {
            check_primitive(parent_path, &property.name, other, value)?;
            if let (Some(relation), Some(s)) = (&property.relation, value.as_str()) {
                relations.push(RelationTarget::from_schema_path(relation, s));
            }
            Ok(())
        }
    }
}

fn validate_array(
    registry: &SchemaRegistry,
    path: &str,
    entry: &SchemaEntry,
    value: &mut Value,
    relations: &mut Vec<RelationTarget>,
) -> Result<()> {
    let Some(items) = value.as_array_mut() else {
        return Err(unexpected(path, "array", value));
    };

    let items_path = format!("{path}/items");
    for item in items.iter_mut() {
        validate_at(registry, &items_path, item, relations)?;
    }

    if entry.unique_items {
        for (index, item) in items.iter().enumerate() {
            if items[..index].contains(item) {
                return Err(FlowstateError::DuplicateItem {
                    path: path.to_string(),
                });
            }
        }
    }

    Ok(())
}

fn check_primitive(
    parent_path: &str,
    name: &str,
    schema_type: SchemaType,
    value: &Value,
) -> Result<()> {
    let ok = match schema_type {
        SchemaType::String => value.is_string(),
        SchemaType::Number => value.is_number(),
        SchemaType::Boolean => value.is_boolean(),
        SchemaType::Function | SchemaType::Node => true,
        // Compound types are validated through their own registry entries.
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(FlowstateError::UnexpectedType {
            path: format!("{parent_path}/{name}"),
            expected: schema_type.name(),
            found: json_type_name(value),
        })
    }
}

fn unexpected(path: &str, expected: &'static str, value: &Value) -> FlowstateError {
    FlowstateError::UnexpectedType {
        path: path.to_string(),
        expected,
        found: json_type_name(value),
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn test_registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .load_str(
                r#"
collections:
  tags:
    type: collection
    items: { type: string }

  users:
    type: collection
    items:
      type: object
      properties:
        - { name: name, type: string, required: true }
        - { name: role, type: string, default: member }
        - { name: tag, type: string, relation: tags/items }
        - name: address
          type: object
          properties:
            - { name: city, type: string, required: true }
        - name: friends
          type: array
          unique_items: true
          items: { type: string, relation: users/items }
      additional_properties: false

  settings:
    type: object
    properties:
      - { name: theme, type: string, required: true }
    pattern_properties:
      "^x-": { type: string }
    additional_properties: false
"#,
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_valid_document() {
        let registry = test_registry();
        let mut value = json!({"name": "Alice", "tag": "t1"});
        let relations = validate_value(&registry, "users/items", &mut value).unwrap();

        // Default applied.
        assert_eq!(value["role"], json!("member"));
        assert_eq!(
            relations,
            vec![RelationTarget {
                collection: "tags".into(),
                id: "t1".into()
            }]
        );
    }

    #[test]
    fn test_missing_required_property() {
        let registry = test_registry();
        let mut value = json!({"role": "admin"});
        let err = validate_value(&registry, "users/items", &mut value).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_REQUIRED");
    }

    #[test]
    fn test_type_mismatch() {
        let registry = test_registry();
        let mut value = json!({"name": 42});
        let err = validate_value(&registry, "users/items", &mut value).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_TYPE");
    }

    #[test]
    fn test_additional_property_rejected() {
        let registry = test_registry();
        let mut value = json!({"name": "Alice", "extra": true});
        let err = validate_value(&registry, "users/items", &mut value).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_ADDITIONAL");
    }

    #[test]
    fn test_nested_object_required() {
        let registry = test_registry();
        let mut value = json!({"name": "Alice", "address": {}});
        let err = validate_value(&registry, "users/items", &mut value).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_REQUIRED");

        let mut value = json!({"name": "Alice", "address": {"city": "Oslo"}});
        assert!(validate_value(&registry, "users/items", &mut value).is_ok());
    }

    #[test]
    fn test_array_items_and_relations() {
        let registry = test_registry();
        let mut value = json!({"name": "Alice", "friends": ["u2", "u3"]});
        let relations = validate_value(&registry, "users/items", &mut value).unwrap();
        assert_eq!(relations.len(), 2);
        assert_eq!(relations[0].collection, "users");
        assert_eq!(relations[0].id, "u2");
    }

    #[test]
    fn test_unique_items_violation() {
        let registry = test_registry();
        let mut value = json!({"name": "Alice", "friends": ["u2", "u2"]});
        let err = validate_value(&registry, "users/items", &mut value).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_UNIQUE");
    }

    #[test]
    fn test_array_element_type_checked() {
        let registry = test_registry();
        let mut value = json!({"name": "Alice", "friends": [42]});
        let err = validate_value(&registry, "users/items", &mut value).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_TYPE");
    }

    #[test]
    fn test_pattern_properties() {
        let registry = test_registry();
        let mut value = json!({"theme": "dark", "x-debug": "on"});
        assert!(validate_value(&registry, "settings", &mut value).is_ok());

        let mut value = json!({"theme": "dark", "x-debug": 42});
        let err = validate_value(&registry, "settings", &mut value).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_TYPE");

        let mut value = json!({"theme": "dark", "unknown": "v"});
        let err = validate_value(&registry, "settings", &mut value).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_ADDITIONAL");
    }

    #[test]
    fn test_unregistered_path_passes() {
        let registry = test_registry();
        let mut value = json!({"anything": ["goes", 1, null]});
        let relations = validate_value(&registry, "unregistered", &mut value).unwrap();
        assert!(relations.is_empty());
    }

    #[test]
    fn test_collection_value_validates_per_document() {
        let registry = test_registry();
        let mut value = json!({"u1": {"name": "Alice"}, "u2": {"role": "admin"}});
        let err = validate_value(&registry, "users", &mut value).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_REQUIRED");
    }
}
