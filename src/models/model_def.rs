//! Normalized model definitions and the table layouts derived from them.

use super::datastore::MigrateStrategy;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Scalar attribute types a model may declare.
pub const SCALAR_TYPES: [&str; 5] = ["string", "number", "boolean", "json", "ref"];

/// What an attribute holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum AttributeKind {
    Scalar {
        #[serde(rename = "type")]
        kind: String,
    },
    /// Singular association; stored as a foreign key column.
    Model { model: String },
    /// Plural association; has no column of its own.
    Collection {
        collection: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        via: Option<String>,
    },
}

/// Per-attribute auto-migration metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoMigrations {
    /// Resolved column type; empty for singular associations until the
    /// target primary key type is copied over.
    pub column_type: String,
    pub unique: bool,
    pub auto_increment: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: AttributeKind,
    pub column_name: String,
    pub required: bool,
    pub auto_created_at: bool,
    pub auto_updated_at: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    /// `None` for plural associations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_migrations: Option<AutoMigrations>,
}

impl AttributeDef {
    pub fn is_collection(&self) -> bool {
        matches!(self.kind, AttributeKind::Collection { .. })
    }

    /// Declared scalar type, if this is not an association.
    pub fn type_name(&self) -> Option<&str> {
        match &self.kind {
            AttributeKind::Scalar { kind } => Some(kind),
            _ => None,
        }
    }

    pub fn column_type(&self) -> Option<&str> {
        self.auto_migrations
            .as_ref()
            .map(|m| m.column_type.as_str())
            .filter(|t| !t.is_empty())
    }
}

/// A validated, normalized model bound to one datastore.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDef {
    pub identity: String,
    pub table_name: String,
    pub datastore: String,
    pub primary_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrate: Option<MigrateStrategy>,
    pub attributes: BTreeMap<String, AttributeDef>,
}

impl ModelDef {
    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.get(name)
    }

    pub fn primary_key_attribute(&self) -> Option<&AttributeDef> {
        self.attributes.get(&self.primary_key)
    }

    /// Physical layout used by auto-migration. Plural associations have no column.
    pub fn table_spec(&self) -> TableSpec {
        let columns = self
            .attributes
            .values()
            .filter_map(|attr| {
                let migrations = attr.auto_migrations.as_ref()?;
                Some(ColumnSpec {
                    name: attr.column_name.clone(),
                    column_type: migrations.column_type.clone(),
                    primary_key: attr.name == self.primary_key,
                    unique: migrations.unique,
                    auto_increment: migrations.auto_increment,
                })
            })
            .collect();

        TableSpec {
            name: self.table_name.clone(),
            columns,
        }
    }
}

/// One physical column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: String,
    pub primary_key: bool,
    pub unique: bool,
    pub auto_increment: bool,
}

/// One physical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key(&self) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.primary_key)
    }
}
