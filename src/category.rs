use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::stream::StreamExt;
use rusqlite::{params, OptionalExtension, Row};
use rw_types::category::{Category, CategoryRepository, CategoryTree};
use serde::Deserialize;
use std::sync::Arc;
use tokio_rusqlite::Connection;
use typesafe_repository::async_ops::{Get, Save};
use typesafe_repository::prelude::*;

use crate::{empty_string_as_none, empty_string_as_none_parse};

/// Longest ancestor chain followed before the tree is considered corrupt.
const MAX_DEPTH: i64 = 64;

pub struct SqliteCategoryRepository {
    conn: Connection,
}

impl SqliteCategoryRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS catalog_category (
                    id INTEGER PRIMARY KEY,
                    parent_id INTEGER,
                    name TEXT NOT NULL,
                    url_key TEXT,
                    position INTEGER NOT NULL DEFAULT 0
                );
                INSERT OR IGNORE INTO catalog_category VALUES (1, NULL, 'Root Catalog', NULL, 0);
                INSERT OR IGNORE INTO catalog_category VALUES (2, 1, 'Default Category', 'default-category', 1);",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn category_from_row(row: &Row) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        name: row.get(2)?,
        url_key: row.get(3)?,
        position: row.get(4)?,
    })
}

impl Repository<Category> for SqliteCategoryRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Get<Category> for SqliteCategoryRepository {
    async fn get_one(&self, id: &IdentityOf<Category>) -> Result<Option<Category>, Self::Error> {
        let id = *id;
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT id, parent_id, name, url_key, position FROM catalog_category WHERE id = ?1",
                        [id],
                        category_from_row,
                    )
                    .optional()?)
            })
            .await?)
    }
}

#[async_trait]
impl Save<Category> for SqliteCategoryRepository {
    async fn save(&self, c: Category) -> Result<(), Self::Error> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO catalog_category (id, parent_id, name, url_key, position)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET parent_id=?2, name=?3, url_key=?4, position=?5",
                    params![c.id, c.parent_id, c.name, c.url_key, c.position],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CategoryRepository for SqliteCategoryRepository {
    async fn load_category_tree(&self) -> Result<CategoryTree, Self::Error> {
        let categories = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, parent_id, name, url_key, position FROM catalog_category
                     ORDER BY position, id",
                )?;
                let categories = stmt
                    .query_map([], category_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(categories)
            })
            .await?;
        Ok(CategoryTree::new(categories))
    }

    async fn load_category_ancestry_chain(&self, id: i64) -> Result<Vec<String>, Self::Error> {
        let chain = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "WITH RECURSIVE chain(id, parent_id, name, url_key, position, depth) AS (
                        SELECT id, parent_id, name, url_key, position, 0 FROM catalog_category WHERE id = ?1
                        UNION ALL
                        SELECT c.id, c.parent_id, c.name, c.url_key, c.position, chain.depth + 1
                        FROM catalog_category c JOIN chain ON c.id = chain.parent_id
                        WHERE chain.depth < ?2
                    )
                    SELECT id, parent_id, name, url_key, position, depth FROM chain ORDER BY depth DESC",
                )?;
                let chain = stmt
                    .query_map(params![id, MAX_DEPTH], |row| {
                        Ok((category_from_row(row)?, row.get::<_, i64>(5)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(chain)
            })
            .await?;
        match chain.first() {
            None => Err(anyhow!("Category {id} not found")),
            Some((_, depth)) if *depth >= MAX_DEPTH => {
                Err(anyhow!("Ancestor chain of category {id} does not terminate"))
            }
            Some(_) => Ok(chain.into_iter().map(|(c, _)| c.segment()).collect()),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct CategoryEntry {
    id: i64,
    #[serde(default, deserialize_with = "empty_string_as_none_parse")]
    parent_id: Option<i64>,
    name: String,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    url_key: Option<String>,
    #[serde(default)]
    position: i64,
}

pub async fn import_categories(
    path: &std::path::Path,
    repo: Arc<dyn CategoryRepository>,
) -> Result<usize, anyhow::Error> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Unable to read {}", path.display()))?;
    import_categories_from_str(&data, repo).await
}

pub async fn import_categories_from_str(
    data: &str,
    repo: Arc<dyn CategoryRepository>,
) -> Result<usize, anyhow::Error> {
    let mut rdr = csv_async::AsyncReaderBuilder::new()
        .delimiter(b',')
        .trim(csv_async::Trim::All)
        .create_deserializer(data.as_bytes());
    let mut records = rdr.deserialize::<CategoryEntry>();
    let mut count = 0;
    while let Some(entry) = records.next().await.transpose()? {
        repo.save(Category {
            id: entry.id,
            parent_id: entry.parent_id,
            name: entry.name,
            url_key: entry.url_key,
            position: entry.position,
        })
        .await?;
        count += 1;
    }
    Ok(count)
}
