//! Auto-migration.
//!
//! Each datastore migrates with exactly one strategy. Datastores run
//! concurrently; one failing does not stop the others, and every failure is
//! reported together once all of them have finished.

use crate::adapters::{Adapter, SchemaMigrator};
use crate::config::Environment;
use crate::driver::Manager;
use crate::error::{DatastoreError, DsResult};
use crate::models::{DatastoreConfig, MigrateStrategy, ModelDef};
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to migrate on one datastore.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub datastore: String,
    pub strategy: MigrateStrategy,
    pub adapter: Arc<dyn Adapter>,
    pub models: Vec<Arc<ModelDef>>,
}

/// Datastore setting, then the project-wide one, then `safe`. Production is always `safe`.
/// A model's own `migrate` still overrides the result for that model.
pub fn resolve_strategy(
    config: &DatastoreConfig,
    project: Option<MigrateStrategy>,
    environment: Environment,
) -> MigrateStrategy {
    if environment.is_production() {
        return MigrateStrategy::Safe;
    }
    config.migrate.or(project).unwrap_or(MigrateStrategy::Safe)
}

pub async fn run_auto_migrations(plans: &[MigrationPlan]) -> DsResult<()> {
    let results = join_all(plans.iter().map(migrate_datastore)).await;

    let failures: Vec<String> = plans
        .iter()
        .zip(results)
        .filter_map(|(plan, result)| {
            result
                .err()
                .map(|e| format!("datastore `{}`: {}", plan.datastore, e))
        })
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(DatastoreError::migration(failures.join("; ")))
    }
}

async fn migrate_datastore(plan: &MigrationPlan) -> DsResult<()> {
    let work: Vec<(&ModelDef, MigrateStrategy)> = plan
        .models
        .iter()
        .map(|model| (model.as_ref(), model.migrate.unwrap_or(plan.strategy)))
        .filter(|(_, strategy)| *strategy != MigrateStrategy::Safe)
        .collect();

    if work.is_empty() {
        debug!(datastore = %plan.datastore, strategy = %plan.strategy, "Skipping auto-migration");
        return Ok(());
    }

    let Some(migrator) = plan.adapter.migrator() else {
        warn!(
            datastore = %plan.datastore,
            adapter = %plan.adapter.manifest().identity,
            strategy = %plan.strategy,
            "Adapter cannot migrate schemas; skipping auto-migration"
        );
        return Ok(());
    };

    let manager = plan
        .adapter
        .datastores()
        .and_then(|table| table.get(&plan.datastore))
        .and_then(|entry| entry.manager)
        .ok_or_else(|| DatastoreError::migration("datastore has no manager to migrate with"))?;

    info!(
        datastore = %plan.datastore,
        strategy = %plan.strategy,
        models = work.len(),
        "Running auto-migration"
    );

    for (model, strategy) in work {
        match strategy {
            MigrateStrategy::Drop => rebuild(migrator, &manager, model).await?,
            MigrateStrategy::Alter => alter(migrator, &manager, model).await?,
            MigrateStrategy::Safe => {}
        }
    }
    Ok(())
}

async fn rebuild(migrator: &dyn SchemaMigrator, manager: &Manager, model: &ModelDef) -> DsResult<()> {
    let spec = model.table_spec();
    if migrator.has_table(manager, &spec.name).await? {
        migrator.drop_table(manager, &spec.name).await?;
    }
    migrator.define_table(manager, &spec).await?;
    debug!(model = %model.identity, table = %spec.name, "Rebuilt table");
    Ok(())
}

/// Rebuild the table, then put back existing records projected onto the new columns.
async fn alter(migrator: &dyn SchemaMigrator, manager: &Manager, model: &ModelDef) -> DsResult<()> {
    let spec = model.table_spec();
    if !migrator.has_table(manager, &spec.name).await? {
        migrator.define_table(manager, &spec).await?;
        debug!(model = %model.identity, table = %spec.name, "Defined missing table");
        return Ok(());
    }

    let records = migrator.fetch_all(manager, &spec.name).await?;
    migrator.drop_table(manager, &spec.name).await?;
    migrator.define_table(manager, &spec).await?;

    let mut restored = 0usize;
    for record in &records {
        match migrator.insert_record(manager, &spec, record).await {
            Ok(()) => restored += 1,
            Err(e) => warn!(
                model = %model.identity,
                table = %spec.name,
                error = %e,
                "Dropping a record that no longer fits the table"
            ),
        }
    }

    info!(
        model = %model.identity,
        table = %spec.name,
        restored,
        lost = records.len() - restored,
        "Altered table"
    );
    Ok(())
}
