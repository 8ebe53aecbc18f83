use anyhow::{anyhow, Context};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use rw_types::product::{ProductEntity, ProductRepository};
use std::collections::HashMap;
use tokio_rusqlite::Connection;
use typesafe_repository::async_ops::Get;
use typesafe_repository::prelude::*;

pub struct SqliteProductRepository {
    conn: Connection,
}

impl SqliteProductRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS product_entity (
                    entity_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    sku TEXT NOT NULL UNIQUE
                );
                CREATE TABLE IF NOT EXISTS product_url_key (
                    entity_id INTEGER NOT NULL,
                    store_id INTEGER NOT NULL,
                    url_key TEXT NOT NULL,
                    PRIMARY KEY (entity_id, store_id)
                );",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

impl Repository<ProductEntity> for SqliteProductRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Get<ProductEntity> for SqliteProductRepository {
    async fn get_one(
        &self,
        id: &IdentityOf<ProductEntity>,
    ) -> Result<Option<ProductEntity>, Self::Error> {
        let id = *id;
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT entity_id, sku FROM product_entity WHERE entity_id = ?1",
                        [id],
                        |row| {
                            Ok(ProductEntity {
                                entity_id: row.get(0)?,
                                sku: row.get(1)?,
                            })
                        },
                    )
                    .optional()?)
            })
            .await?)
    }
}

#[async_trait]
impl ProductRepository for SqliteProductRepository {
    async fn ensure_by_sku(&self, sku: &str) -> Result<ProductEntity, Self::Error> {
        let sku = sku.trim().to_string();
        if sku.is_empty() {
            return Err(anyhow!("Empty sku"));
        }
        let s = sku.clone();
        let entity_id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO product_entity (sku) VALUES (?1) ON CONFLICT(sku) DO NOTHING",
                    [&s],
                )?;
                Ok(conn.query_row(
                    "SELECT entity_id FROM product_entity WHERE sku = ?1",
                    [&s],
                    |row| row.get::<_, i64>(0),
                )?)
            })
            .await
            .with_context(|| format!("Unable to register product {sku}"))?;
        Ok(ProductEntity { entity_id, sku })
    }

    async fn url_keys(&self, entity_id: i64) -> Result<HashMap<i64, String>, Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT store_id, url_key FROM product_url_key WHERE entity_id = ?1",
                )?;
                let keys = stmt
                    .query_map([entity_id], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<HashMap<_, _>, _>>()?;
                Ok(keys)
            })
            .await?)
    }

    async fn save_url_keys(
        &self,
        entity_id: i64,
        keys: Vec<(i64, String)>,
    ) -> Result<(), Self::Error> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for (store_id, url_key) in &keys {
                    tx.execute(
                        "INSERT INTO product_url_key (entity_id, store_id, url_key) VALUES (?1, ?2, ?3)
                         ON CONFLICT(entity_id, store_id) DO UPDATE SET url_key=?3",
                        params![entity_id, store_id, url_key],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
