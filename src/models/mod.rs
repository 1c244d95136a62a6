use anyhow::{Context, Result};
use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use std::path::Path;

pub mod call_log;
pub mod migration;

/// Resolve a SQLite URL into something connectable: file-backed databases
/// get their parent directory created and open in create-if-missing mode.
/// In-memory URLs, non-SQLite URLs and URLs that already carry options pass
/// through untouched.
fn connectable_url(database_url: &str) -> Result<String> {
    let file = match database_url.strip_prefix("sqlite://") {
        Some(rest) if !rest.is_empty() && !rest.starts_with(':') => rest,
        _ => return Ok(database_url.to_string()),
    };
    if file.contains('?') {
        // The caller chose their own connection options; trust them.
        return Ok(database_url.to_string());
    }
    if let Some(dir) = Path::new(file).parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create database directory {}", dir.display()))?;
    }
    Ok(format!("sqlite://{}?mode=rwc", file))
}

/// Open the call-log database, creating it on first use, and bring the
/// schema up to date.
pub async fn open_database(database_url: &str) -> Result<DatabaseConnection> {
    let url = connectable_url(database_url)?;
    let db = Database::connect(&url)
        .await
        .with_context(|| format!("connect call log database {}", database_url))?;

    migration::Migrator::up(&db, None)
        .await
        .context("apply call log schema migrations")?;
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectable_url_leaves_memory_and_options_alone() {
        assert_eq!(
            connectable_url("sqlite::memory:").unwrap(),
            "sqlite::memory:"
        );
        assert_eq!(
            connectable_url("sqlite://:memory:").unwrap(),
            "sqlite://:memory:"
        );
        assert_eq!(
            connectable_url("sqlite://calls.db?mode=ro").unwrap(),
            "sqlite://calls.db?mode=ro"
        );
    }

    #[test]
    fn test_connectable_url_marks_files_create_on_open() {
        assert_eq!(
            connectable_url("sqlite://calls.db").unwrap(),
            "sqlite://calls.db?mode=rwc"
        );
    }

    #[tokio::test]
    async fn test_open_database_in_memory() {
        let db = open_database("sqlite::memory:").await.unwrap();
        assert!(db.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_open_database_creates_file_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("calls.db");
        let url = format!("sqlite://{}", path.display());

        let db = open_database(&url).await.unwrap();
        assert!(db.ping().await.is_ok());
        assert!(path.exists());

        // A second open against the same file must be a no-op migration.
        drop(db);
        let db = open_database(&url).await.unwrap();
        assert!(db.ping().await.is_ok());
    }
}
