//! Model definition normalization.
//!
//! Turns a raw JSON model definition (merged over the project-wide model
//! defaults) into a [`ModelDef`]. Column types for singular associations are
//! left empty here and filled in once every model is known.

use crate::config::Environment;
use crate::error::{DatastoreError, DsResult};
use crate::models::{
    AttributeDef, AttributeKind, AutoMigrations, DEFAULT_DATASTORE, DatastoreConfig, Meta,
    MigrateStrategy, ModelDef, SCALAR_TYPES,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// Model-level keys that are no longer accepted, with what to do instead.
const REMOVED_MODEL_KEYS: [(&str, &str); 5] = [
    ("connection", "use `datastore` instead"),
    ("autoPK", "declare the primary key attribute and set `primaryKey`"),
    ("autoCreatedAt", "set `autoCreatedAt: true` on an attribute instead"),
    ("autoUpdatedAt", "set `autoUpdatedAt: true` on an attribute instead"),
    ("types", "custom types are not supported; use attribute validation instead"),
];

/// Types that were dropped, with the type and column type to use instead.
const UNSUPPORTED_TYPES: [(&str, &str, &str); 5] = [
    ("array", "json", "array"),
    ("date", "string", "date"),
    ("datetime", "string", "datetime"),
    ("binary", "ref", "binary"),
    ("objectid", "ref", "objectid"),
];

/// Deprecated type names and the type they map to.
const TYPE_ALIASES: [(&str, &str); 5] = [
    ("text", "string"),
    ("mediumtext", "string"),
    ("longtext", "string"),
    ("integer", "number"),
    ("float", "number"),
];

pub fn is_valid_identity(identity: &str) -> bool {
    let mut chars = identity.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Normalize one model definition.
pub fn normalize_model(
    identity: &str,
    definition: &Value,
    defaults: &Meta,
    environment: Environment,
    datastores: &BTreeMap<String, DatastoreConfig>,
) -> DsResult<ModelDef> {
    let invalid = |message: String| DatastoreError::invalid_model(identity, message);

    if !is_valid_identity(identity) {
        return Err(invalid(
            "identity must start with a lowercase letter or underscore and contain only \
             lowercase letters, digits and underscores"
                .to_string(),
        ));
    }

    let Some(definition) = definition.as_object() else {
        return Err(invalid(format!(
            "definition must be an object, got `{}`",
            definition
        )));
    };

    let merged = merge_definition(defaults, definition).map_err(invalid)?;

    for (key, hint) in REMOVED_MODEL_KEYS {
        if merged.contains_key(key) {
            return Err(invalid(format!("`{}` is no longer supported; {}", key, hint)));
        }
    }

    let table_name = match merged.get("tableName") {
        None | Some(Value::Null) => identity.to_string(),
        Some(Value::String(name)) if !name.is_empty() => name.clone(),
        Some(other) => return Err(invalid(format!("`tableName` must be a non-empty string, got `{}`", other))),
    };

    let primary_key = match merged.get("primaryKey") {
        None | Some(Value::Null) => DEFAULT_PRIMARY_KEY.to_string(),
        Some(Value::String(pk)) if !pk.is_empty() => pk.clone(),
        Some(other) => return Err(invalid(format!("`primaryKey` must be a non-empty string, got `{}`", other))),
    };

    let datastore = match merged.get("datastore") {
        None => DEFAULT_DATASTORE.to_string(),
        Some(Value::String(name)) if !name.is_empty() => name.clone(),
        Some(_) => {
            return Err(DatastoreError::ModelHasNoDatastore {
                model: identity.to_string(),
            });
        }
    };
    if !datastores.contains_key(&datastore) {
        return Err(DatastoreError::UnrecognizedDatastore {
            datastore,
            message: format!("referenced by model `{}`", identity),
        });
    }

    // Only the model's own setting; the project-wide one applies per datastore.
    let mut migrate = match definition.get("migrate") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.parse::<MigrateStrategy>().map_err(|e| invalid(e.to_string()))?),
        Some(other) => return Err(invalid(format!("`migrate` must be a string, got `{}`", other))),
    };
    if environment.is_production() && migrate != Some(MigrateStrategy::Safe) {
        debug!(model = %identity, "Forcing `safe` migrations in production");
        migrate = Some(MigrateStrategy::Safe);
    }

    let raw_attributes = match merged.get("attributes") {
        Some(Value::Object(attributes)) => attributes,
        _ => return Err(invalid("`attributes` must be an object".to_string())),
    };

    let mut attributes = BTreeMap::new();
    for (name, raw) in raw_attributes {
        let in_attribute = |message: String| {
            DatastoreError::invalid_model(identity, format!("attribute `{}`: {}", name, message))
        };
        if let Some(attribute) =
            normalize_attribute(name, raw, name == &primary_key).map_err(in_attribute)?
        {
            attributes.insert(name.clone(), attribute);
        }
    }

    match attributes.get(&primary_key) {
        None => {
            return Err(invalid(format!(
                "the primary key is set to `{}`, but no such attribute is defined",
                primary_key
            )));
        }
        Some(attr) if attr.is_collection() => {
            return Err(invalid(format!(
                "the primary key `{}` cannot be a plural association",
                primary_key
            )));
        }
        Some(_) => {}
    }

    Ok(ModelDef {
        identity: identity.to_string(),
        table_name,
        datastore,
        primary_key,
        migrate,
        attributes,
    })
}

/// Project defaults underneath the definition; `attributes` merge key by key.
fn merge_definition(defaults: &Meta, definition: &Meta) -> Result<Meta, String> {
    let mut attributes = object_or_empty(defaults.get("attributes"), "models.attributes")?;
    attributes.extend(object_or_empty(definition.get("attributes"), "attributes")?);

    let mut merged: Meta = defaults
        .iter()
        .chain(definition.iter())
        .filter(|(key, _)| key.as_str() != "attributes")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    merged.insert("attributes".to_string(), Value::Object(attributes));
    Ok(merged)
}

fn object_or_empty(value: Option<&Value>, what: &str) -> Result<Map<String, Value>, String> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(other) => Err(format!("`{}` must be an object, got `{}`", what, other)),
    }
}

/// Normalize one attribute; `Ok(None)` removes it.
pub fn normalize_attribute(
    name: &str,
    raw: &Value,
    is_primary_key: bool,
) -> Result<Option<AttributeDef>, String> {
    let def = match raw {
        Value::Bool(false) => return Ok(None),
        Value::String(kind) => {
            let mut map = Map::new();
            map.insert("type".to_string(), Value::String(kind.clone()));
            map
        }
        Value::Object(map) => map.clone(),
        other => return Err(format!("definition must be an object or a type name, got `{}`", other)),
    };

    if def.contains_key("primaryKey") {
        return Err(format!(
            "`primaryKey` cannot be set on an attribute; set `primaryKey: \"{}\"` on the model",
            name
        ));
    }
    if def.contains_key("protected") {
        return Err("`protected` is no longer supported".to_string());
    }

    let kind = attribute_kind(&def)?;

    let column_name = match (def.get("columnName"), &kind) {
        (Some(_), AttributeKind::Collection { .. }) => {
            return Err("`columnName` is not valid for plural associations".to_string());
        }
        (None | Some(Value::Null), _) => name.to_string(),
        (Some(Value::String(column)), _) if !column.is_empty() => column.clone(),
        (Some(other), _) => return Err(format!("`columnName` must be a non-empty string, got `{}`", other)),
    };

    let flag = |key: &str| -> Result<bool, String> {
        match def.get(key) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(format!("`{}` must be a boolean, got `{}`", key, other)),
        }
    };
    let required = flag("required")?;
    let auto_created_at = flag("autoCreatedAt")?;
    let auto_updated_at = flag("autoUpdatedAt")?;

    let auto_migrations = match &kind {
        AttributeKind::Collection { .. } => None,
        other => {
            let explicit_column_type = match def.get("columnType") {
                None | Some(Value::Null) => None,
                Some(Value::String(t)) if !t.is_empty() => Some(t.clone()),
                Some(other) => return Err(format!("`columnType` must be a non-empty string, got `{}`", other)),
            };
            let column_type = match (explicit_column_type, other) {
                (Some(t), _) => t,
                (None, AttributeKind::Scalar { kind }) if is_primary_key => format!("_{}key", kind),
                (None, AttributeKind::Scalar { kind }) if auto_created_at || auto_updated_at => {
                    format!("_{}timestamp", kind)
                }
                (None, AttributeKind::Scalar { kind }) => format!("_{}", kind),
                // Filled in from the target's primary key later.
                (None, _) => String::new(),
            };
            Some(AutoMigrations {
                column_type,
                unique: flag("unique")? || is_primary_key,
                auto_increment: flag("autoIncrement")?,
            })
        }
    };

    Ok(Some(AttributeDef {
        name: name.to_string(),
        kind,
        column_name,
        required,
        auto_created_at,
        auto_updated_at,
        default_value: def.get("defaultsTo").cloned(),
        auto_migrations,
    }))
}

fn attribute_kind(def: &Map<String, Value>) -> Result<AttributeKind, String> {
    let target = |key: &str| -> Result<Option<String>, String> {
        match def.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(t)) if !t.is_empty() => Ok(Some(t.to_lowercase())),
            Some(other) => Err(format!("`{}` must be a model identity, got `{}`", key, other)),
        }
    };

    match (target("model")?, target("collection")?) {
        (Some(_), Some(_)) => {
            return Err("an attribute cannot declare both `model` and `collection`".to_string());
        }
        (Some(model), None) => return Ok(AttributeKind::Model { model }),
        (None, Some(collection)) => {
            let via = match def.get("via") {
                None | Some(Value::Null) => None,
                Some(Value::String(via)) if !via.is_empty() => Some(via.clone()),
                Some(other) => return Err(format!("`via` must be an attribute name, got `{}`", other)),
            };
            return Ok(AttributeKind::Collection { collection, via });
        }
        (None, None) => {}
    }

    let kind = match def.get("type") {
        Some(Value::String(t)) if !t.is_empty() => t.to_lowercase(),
        _ => {
            return Err(
                "needs a `type` (a non-empty string), a `model` or a `collection`".to_string(),
            );
        }
    };

    if let Some((_, suggest_type, suggest_column)) =
        UNSUPPORTED_TYPES.iter().find(|(t, _, _)| *t == kind)
    {
        return Err(format!(
            "type `{}` is no longer supported; use e.g. {{ type: \"{}\", columnType: \"{}\" }}",
            kind, suggest_type, suggest_column
        ));
    }

    let kind = match TYPE_ALIASES.iter().find(|(alias, _)| *alias == kind) {
        Some((alias, mapped)) => {
            debug!(from = %alias, to = %mapped, "Mapping deprecated attribute type");
            mapped.to_string()
        }
        None => kind,
    };

    if !SCALAR_TYPES.contains(&kind.as_str()) {
        return Err(format!(
            "unknown type `{}` (expected one of {})",
            kind,
            SCALAR_TYPES.join(", ")
        ));
    }

    Ok(AttributeKind::Scalar { kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn datastores() -> BTreeMap<String, DatastoreConfig> {
        let mut map = BTreeMap::new();
        map.insert("default".to_string(), DatastoreConfig::new("default", "memory"));
        map
    }

    fn normalize(identity: &str, definition: Value) -> DsResult<ModelDef> {
        normalize_model(
            identity,
            &definition,
            &Meta::new(),
            Environment::Development,
            &datastores(),
        )
    }

    #[test]
    fn test_identity_rules() {
        assert!(is_valid_identity("user"));
        assert!(is_valid_identity("_user_2"));
        assert!(!is_valid_identity("User"));
        assert!(!is_valid_identity("2user"));
        assert!(!is_valid_identity("user-profile"));
        assert!(!is_valid_identity(""));
    }

    #[test]
    fn test_normalizes_attributes_and_defaults() {
        let model = normalize(
            "user",
            json!({
                "attributes": {
                    "id": {"type": "number", "autoIncrement": true},
                    "name": "STRING",
                    "bio": {"type": "text"},
                    "createdAt": {"type": "number", "autoCreatedAt": true},
                    "email": {"type": "string", "unique": true, "columnName": "email_address"},
                    "legacy": false
                }
            }),
        )
        .unwrap();

        assert_eq!(model.table_name, "user");
        assert_eq!(model.datastore, "default");
        assert_eq!(model.primary_key, "id");
        assert!(model.attribute("legacy").is_none());

        let id = model.attribute("id").unwrap();
        assert_eq!(id.column_type(), Some("_numberkey"));
        let migrations = id.auto_migrations.as_ref().unwrap();
        assert!(migrations.unique);
        assert!(migrations.auto_increment);

        assert_eq!(model.attribute("name").unwrap().type_name(), Some("string"));
        assert_eq!(model.attribute("bio").unwrap().type_name(), Some("string"));
        assert_eq!(
            model.attribute("createdAt").unwrap().column_type(),
            Some("_numbertimestamp")
        );
        let email = model.attribute("email").unwrap();
        assert_eq!(email.column_name, "email_address");
        assert!(email.auto_migrations.as_ref().unwrap().unique);
    }

    #[test]
    fn test_project_defaults_merge_underneath() {
        let defaults = json!({
            "primaryKey": "id",
            "migrate": "alter",
            "attributes": {"id": {"type": "number", "autoIncrement": true}, "updatedAt": {"type": "number", "autoUpdatedAt": true}}
        });
        let model = normalize_model(
            "pet",
            &json!({"tableName": "pets", "attributes": {"name": "string", "updatedAt": false}}),
            defaults.as_object().unwrap(),
            Environment::Development,
            &datastores(),
        )
        .unwrap();

        assert_eq!(model.table_name, "pets");
        assert_eq!(model.migrate, None);
        assert!(model.attribute("id").is_some());
        assert!(model.attribute("updatedAt").is_none());
    }

    #[test]
    fn test_model_migrate_is_its_own() {
        let model = normalize("pet", json!({"migrate": "drop", "attributes": {"id": "number"}})).unwrap();
        assert_eq!(model.migrate, Some(MigrateStrategy::Drop));
    }

    #[test]
    fn test_production_forces_safe() {
        let model = normalize_model(
            "pet",
            &json!({"migrate": "drop", "attributes": {"id": "number"}}),
            &Meta::new(),
            Environment::Production,
            &datastores(),
        )
        .unwrap();
        assert_eq!(model.migrate, Some(MigrateStrategy::Safe));
    }

    #[test]
    fn test_primary_key_must_exist() {
        let err = normalize("user", json!({"attributes": {"name": "string"}})).unwrap_err();
        assert_eq!(err.code(), "E_INVALID_MODEL_DEF");
        assert!(err.to_string().contains("primary key"));
    }

    #[test]
    fn test_datastore_checks() {
        let err = normalize("user", json!({"datastore": "", "attributes": {"id": "number"}}))
            .unwrap_err();
        assert_eq!(err.code(), "E_MODEL_HAS_NO_DATASTORE");

        let err = normalize("user", json!({"datastore": "nope", "attributes": {"id": "number"}}))
            .unwrap_err();
        assert_eq!(err.code(), "E_UNRECOGNIZED_DATASTORE");
    }

    #[test]
    fn test_removed_model_keys_rejected() {
        for key in ["connection", "autoPK", "autoCreatedAt", "types"] {
            let mut def = json!({"attributes": {"id": "number"}});
            def[key] = json!(true);
            let err = normalize("user", def).unwrap_err();
            assert!(err.to_string().contains(key), "{}", err);
        }
    }

    #[test]
    fn test_attribute_rules() {
        let err = |raw: Value| normalize_attribute("field", &raw, false).unwrap_err();

        assert!(err(json!({"type": "date"})).contains("columnType: \"date\""));
        assert!(err(json!({"type": "string", "protected": true})).contains("protected"));
        assert!(err(json!({"type": "string", "primaryKey": true})).contains("primaryKey"));
        assert!(err(json!({"required": true})).contains("needs a `type`"));
        assert!(err(json!({"type": ""})).contains("needs a `type`"));
        assert!(err(json!({"type": "uuid"})).contains("unknown type"));
        assert!(err(json!({"collection": "pet", "columnName": "pets"})).contains("columnName"));
        assert!(err(json!({"model": "pet", "collection": "pet"})).contains("both"));
    }

    #[test]
    fn test_associations() {
        let owner = normalize_attribute("owner", &json!({"model": "User"}), false)
            .unwrap()
            .unwrap();
        assert_eq!(owner.kind, AttributeKind::Model { model: "user".into() });
        assert_eq!(owner.column_type(), None);

        let pets = normalize_attribute("pets", &json!({"collection": "pet", "via": "owner"}), false)
            .unwrap()
            .unwrap();
        assert!(pets.is_collection());
        assert!(pets.auto_migrations.is_none());
    }
}
