use anyhow::Context;
use async_trait::async_trait;
use futures::stream::StreamExt;
use rusqlite::{params, Row};
use rw_types::store::{Store, StoreGroup, StoreHierarchy, StoreRepository, Website};
use serde::Deserialize;
use std::sync::Arc;
use tokio_rusqlite::Connection;
use typesafe_repository::async_ops::{List, Save};
use typesafe_repository::prelude::*;

pub struct SqliteStoreRepository {
    conn: Connection,
}

impl SqliteStoreRepository {
    /// Creates the hierarchy tables and seeds the admin scope and the
    /// default `base` website when they are missing.
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS store_website (
                    website_id INTEGER PRIMARY KEY,
                    code TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    sort_order INTEGER NOT NULL DEFAULT 0,
                    default_group_id INTEGER NOT NULL DEFAULT 0,
                    is_default INTEGER NOT NULL DEFAULT 0
                );
                CREATE TABLE IF NOT EXISTS store_group (
                    group_id INTEGER PRIMARY KEY,
                    website_id INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    root_category_id INTEGER NOT NULL DEFAULT 0,
                    default_store_id INTEGER NOT NULL DEFAULT 0
                );
                CREATE TABLE IF NOT EXISTS store (
                    store_id INTEGER PRIMARY KEY,
                    code TEXT NOT NULL UNIQUE,
                    website_id INTEGER NOT NULL,
                    group_id INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    sort_order INTEGER NOT NULL DEFAULT 0,
                    is_active INTEGER NOT NULL DEFAULT 0
                );
                INSERT OR IGNORE INTO store_website VALUES (0, 'admin', 'Admin', 0, 0, 0);
                INSERT OR IGNORE INTO store_website VALUES (1, 'base', 'Main Website', 0, 1, 1);
                INSERT OR IGNORE INTO store_group VALUES (0, 0, 'Default', 0, 0);
                INSERT OR IGNORE INTO store_group VALUES (1, 1, 'Main Website Store', 2, 1);
                INSERT OR IGNORE INTO store VALUES (0, 'admin', 0, 0, 'Admin', 0, 1);
                INSERT OR IGNORE INTO store VALUES (1, 'default', 1, 1, 'Default Store View', 0, 1);",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn store_from_row(row: &Row) -> rusqlite::Result<Store> {
    Ok(Store {
        id: row.get(0)?,
        code: row.get(1)?,
        website_id: row.get(2)?,
        group_id: row.get(3)?,
        name: row.get(4)?,
        sort_order: row.get(5)?,
        is_active: row.get(6)?,
    })
}

impl Repository<Store> for SqliteStoreRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Save<Store> for SqliteStoreRepository {
    async fn save(&self, s: Store) -> Result<(), Self::Error> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO store (store_id, code, website_id, group_id, name, sort_order, is_active)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(store_id) DO UPDATE SET code=?2, website_id=?3, group_id=?4, name=?5, sort_order=?6, is_active=?7",
                    params![s.id, s.code, s.website_id, s.group_id, s.name, s.sort_order, s.is_active],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl List<Store> for SqliteStoreRepository {
    async fn list(&self) -> Result<Vec<Store>, Self::Error> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT store_id, code, website_id, group_id, name, sort_order, is_active
                     FROM store ORDER BY store_id",
                )?;
                let stores = stmt
                    .query_map([], store_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(stores)
            })
            .await?)
    }
}

#[async_trait]
impl StoreRepository for SqliteStoreRepository {
    async fn save_website(&self, w: Website) -> Result<(), Self::Error> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO store_website (website_id, code, name, sort_order, default_group_id, is_default)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(website_id) DO UPDATE SET code=?2, name=?3, sort_order=?4, default_group_id=?5, is_default=?6",
                    params![w.id, w.code, w.name, w.sort_order, w.default_group_id, w.is_default],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn save_group(&self, g: StoreGroup) -> Result<(), Self::Error> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO store_group (group_id, website_id, name, root_category_id, default_store_id)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(group_id) DO UPDATE SET website_id=?2, name=?3, root_category_id=?4, default_store_id=?5",
                    params![g.id, g.website_id, g.name, g.root_category_id, g.default_store_id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn load_store_hierarchy(&self) -> Result<StoreHierarchy, Self::Error> {
        let (websites, groups) = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT website_id, code, name, sort_order, default_group_id, is_default
                     FROM store_website ORDER BY sort_order, website_id",
                )?;
                let websites = stmt
                    .query_map([], |row| {
                        Ok(Website {
                            id: row.get(0)?,
                            code: row.get(1)?,
                            name: row.get(2)?,
                            sort_order: row.get(3)?,
                            default_group_id: row.get(4)?,
                            is_default: row.get(5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                let mut stmt = conn.prepare(
                    "SELECT group_id, website_id, name, root_category_id, default_store_id
                     FROM store_group ORDER BY group_id",
                )?;
                let groups = stmt
                    .query_map([], |row| {
                        Ok(StoreGroup {
                            id: row.get(0)?,
                            website_id: row.get(1)?,
                            name: row.get(2)?,
                            root_category_id: row.get(3)?,
                            default_store_id: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((websites, groups))
            })
            .await?;
        let stores = self.list().await?;
        Ok(StoreHierarchy::new(websites, groups, stores))
    }
}

/// One store view per line; the website and group columns are repeated for
/// every store view of the group.
#[derive(Deserialize, Debug)]
pub struct StoreEntry {
    website_id: i64,
    website_code: String,
    group_id: i64,
    root_category_id: i64,
    store_id: i64,
    store_code: String,
    #[serde(default)]
    store_name: Option<String>,
    #[serde(default = "default_active")]
    is_active: bool,
}

fn default_active() -> bool {
    true
}

pub async fn import_stores(
    path: &std::path::Path,
    repo: Arc<dyn StoreRepository>,
) -> Result<usize, anyhow::Error> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Unable to read {}", path.display()))?;
    import_stores_from_str(&data, repo).await
}

pub async fn import_stores_from_str(
    data: &str,
    repo: Arc<dyn StoreRepository>,
) -> Result<usize, anyhow::Error> {
    let mut rdr = csv_async::AsyncReaderBuilder::new()
        .delimiter(b',')
        .trim(csv_async::Trim::All)
        .create_deserializer(data.as_bytes());
    let mut records = rdr.deserialize::<StoreEntry>();
    let mut count = 0;
    while let Some(entry) = records.next().await.transpose()? {
        repo.save_website(Website {
            id: entry.website_id,
            code: entry.website_code.clone(),
            name: entry.website_code.clone(),
            sort_order: 0,
            default_group_id: entry.group_id,
            is_default: entry.website_id == 1,
        })
        .await?;
        repo.save_group(StoreGroup {
            id: entry.group_id,
            website_id: entry.website_id,
            name: format!("{} store", entry.website_code),
            root_category_id: entry.root_category_id,
            default_store_id: entry.store_id,
        })
        .await?;
        repo.save(Store {
            id: entry.store_id,
            name: entry
                .store_name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| entry.store_code.clone()),
            code: entry.store_code,
            website_id: entry.website_id,
            group_id: entry.group_id,
            sort_order: 0,
            is_active: entry.is_active,
        })
        .await?;
        count += 1;
    }
    Ok(count)
}
