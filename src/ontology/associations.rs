//! Cross-model checks, run once every model is normalized.

use crate::error::{DatastoreError, DsResult};
use crate::models::{AttributeKind, ModelDef};
use std::collections::BTreeMap;

/// Every association must point at a known model, and `via` must name an
/// attribute on that model.
pub fn validate_associations(models: &BTreeMap<String, ModelDef>) -> DsResult<()> {
    for model in models.values() {
        for attr in model.attributes.values() {
            let (target, via) = match &attr.kind {
                AttributeKind::Scalar { .. } => continue,
                AttributeKind::Model { model } => (model, None),
                AttributeKind::Collection { collection, via } => (collection, via.as_ref()),
            };

            let Some(target_model) = models.get(target) else {
                return Err(DatastoreError::invalid_model(
                    &model.identity,
                    format!(
                        "attribute `{}` is associated with unknown model `{}`",
                        attr.name, target
                    ),
                ));
            };

            if let Some(via) = via {
                if target_model.attribute(via).is_none() {
                    return Err(DatastoreError::invalid_model(
                        &model.identity,
                        format!(
                            "attribute `{}` is associated via `{}`, which model `{}` does not define",
                            attr.name, via, target
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Give every singular association the column type of its target's primary key.
pub fn copy_primary_key_column_types(models: &mut BTreeMap<String, ModelDef>) -> DsResult<()> {
    let pk_types: BTreeMap<String, String> = models
        .values()
        .filter_map(|model| {
            let column_type = model.primary_key_attribute()?.column_type()?;
            Some((model.identity.clone(), column_type.to_string()))
        })
        .collect();

    for model in models.values_mut() {
        let identity = model.identity.clone();
        for attr in model.attributes.values_mut() {
            let AttributeKind::Model { model: target } = &attr.kind else {
                continue;
            };
            let column_type = pk_types.get(target).ok_or_else(|| {
                DatastoreError::consistency(format!(
                    "model `{}` has no primary key column type to copy onto `{}.{}`",
                    target, identity, attr.name
                ))
            })?;
            if let Some(migrations) = attr.auto_migrations.as_mut() {
                migrations.column_type = column_type.clone();
            }
        }
    }
    Ok(())
}
