use sea_orm::sea_query::{ColumnDef, Index, IndexCreateStatement, Table, TableCreateStatement};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection};

use crate::entity::kv_entries;
use stellar_monitor_domain::storage::{StorageError, StorageResult};

pub async fn run_migrations(db: &DatabaseConnection) -> StorageResult<()> {
    let backend = db.get_database_backend();

    let kv_table = Table::create()
        .if_not_exists()
        .table(kv_entries::Entity)
        .col(
            ColumnDef::new(kv_entries::Column::Key)
                .string_len(255)
                .not_null()
                .primary_key(),
        )
        .col(ColumnDef::new(kv_entries::Column::Value).text().not_null())
        .col(
            ColumnDef::new(kv_entries::Column::ExpiresAtMs)
                .big_integer()
                .null(),
        )
        .to_owned();
    create_table(db, backend, kv_table).await?;

    let expiry_index = Index::create()
        .if_not_exists()
        .name("idx_kv_entries_expires_at_ms")
        .table(kv_entries::Entity)
        .col(kv_entries::Column::ExpiresAtMs)
        .to_owned();
    create_index(db, backend, expiry_index).await?;

    Ok(())
}

async fn create_table(
    db: &DatabaseConnection,
    backend: DatabaseBackend,
    mut statement: TableCreateStatement,
) -> StorageResult<()> {
    statement.if_not_exists();
    db.execute(backend.build(&statement))
        .await
        .map_err(StorageError::from_source)?;
    Ok(())
}

async fn create_index(
    db: &DatabaseConnection,
    backend: DatabaseBackend,
    statement: IndexCreateStatement,
) -> StorageResult<()> {
    db.execute(backend.build(&statement))
        .await
        .map_err(StorageError::from_source)?;
    Ok(())
}
