use anyhow::anyhow;
use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use rw_types::url_rewrite::{
    ByFamily, ByProduct, FamilyChangeSet, RedirectType, RequestPathTaken, RewriteMetadata,
    UrlRewrite, UrlRewriteProductCategory, UrlRewriteRepository, ENTITY_TYPE_PRODUCT,
};
use tokio_rusqlite::Connection;
use typesafe_repository::async_ops::{Get, Save, Select};
use typesafe_repository::prelude::*;

const COLUMNS: &str = "id, entity_type, entity_id, request_path, target_path, redirect_type, \
                       store_id, description, is_autogenerated, metadata";

pub struct SqliteUrlRewriteRepository {
    conn: Connection,
}

impl SqliteUrlRewriteRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS url_rewrite (
                    id BLOB PRIMARY KEY,
                    entity_type TEXT NOT NULL,
                    entity_id INTEGER NOT NULL,
                    request_path TEXT NOT NULL,
                    target_path TEXT NOT NULL,
                    redirect_type INTEGER NOT NULL DEFAULT 0,
                    store_id INTEGER NOT NULL,
                    description TEXT,
                    is_autogenerated INTEGER NOT NULL DEFAULT 0,
                    metadata TEXT
                );
                CREATE UNIQUE INDEX IF NOT EXISTS url_rewrite_request_path_store
                    ON url_rewrite (request_path, store_id);
                CREATE INDEX IF NOT EXISTS url_rewrite_entity
                    ON url_rewrite (entity_type, entity_id, store_id);
                CREATE TABLE IF NOT EXISTS url_rewrite_product_category (
                    url_rewrite_id BLOB NOT NULL,
                    product_id INTEGER NOT NULL,
                    category_id INTEGER NOT NULL,
                    PRIMARY KEY (url_rewrite_id, product_id, category_id)
                );",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn rewrite_from_row(row: &Row) -> rusqlite::Result<UrlRewrite> {
    let code: i64 = row.get(5)?;
    let redirect_type = RedirectType::from_code(code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            Type::Integer,
            anyhow!("Unknown redirect type {code}").into(),
        )
    })?;
    let metadata = RewriteMetadata::from_db(row.get::<_, Option<String>>(9)?.as_deref())
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, err.into()))?;
    Ok(UrlRewrite {
        id: row.get(0)?,
        entity_type: row.get(1)?,
        entity_id: row.get(2)?,
        request_path: row.get(3)?,
        target_path: row.get(4)?,
        redirect_type,
        store_id: row.get(6)?,
        description: row.get(7)?,
        is_autogenerated: row.get(8)?,
        metadata,
    })
}

fn upsert_rewrite(conn: &rusqlite::Connection, r: &UrlRewrite) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO url_rewrite (id, entity_type, entity_id, request_path, target_path, redirect_type, store_id, description, is_autogenerated, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET entity_type=?2, entity_id=?3, request_path=?4, target_path=?5, redirect_type=?6, store_id=?7, description=?8, is_autogenerated=?9, metadata=?10",
        params![
            r.id,
            r.entity_type,
            r.entity_id,
            r.request_path,
            r.target_path,
            r.redirect_type.code(),
            r.store_id,
            r.description,
            r.is_autogenerated,
            r.metadata.to_db(),
        ],
    )
}

fn is_request_path_taken(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, Some(msg))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                && msg.contains("url_rewrite.request_path")
    )
}

fn insert_link(
    conn: &rusqlite::Connection,
    l: &UrlRewriteProductCategory,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO url_rewrite_product_category (url_rewrite_id, product_id, category_id)
         VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
        params![l.url_rewrite_id, l.product_id, l.category_id],
    )
}

impl Repository<UrlRewrite> for SqliteUrlRewriteRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Get<UrlRewrite> for SqliteUrlRewriteRepository {
    async fn get_one(&self, id: &IdentityOf<UrlRewrite>) -> Result<Option<UrlRewrite>, Self::Error> {
        let id = *id;
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {COLUMNS} FROM url_rewrite WHERE id = ?1"),
                        [id],
                        rewrite_from_row,
                    )
                    .optional()?)
            })
            .await?)
    }
}

#[async_trait]
impl Save<UrlRewrite> for SqliteUrlRewriteRepository {
    async fn save(&self, r: UrlRewrite) -> Result<(), Self::Error> {
        self.conn
            .call(move |conn| {
                upsert_rewrite(conn, &r)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Select<UrlRewrite, ByFamily> for SqliteUrlRewriteRepository {
    async fn select(&self, ByFamily(family): &ByFamily) -> Result<Vec<UrlRewrite>, Self::Error> {
        let family = *family;
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM url_rewrite
                     WHERE entity_type = ?1 AND entity_id = ?2 AND store_id = ?3 AND is_autogenerated = 1
                     ORDER BY rowid"
                ))?;
                let rows = stmt
                    .query_map(
                        params![ENTITY_TYPE_PRODUCT, family.entity_id, family.store_id],
                        rewrite_from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows.into_iter().filter(|r| r.family() == family).collect())
    }
}

#[async_trait]
impl Select<UrlRewrite, ByProduct> for SqliteUrlRewriteRepository {
    async fn select(&self, ByProduct(entity_id): &ByProduct) -> Result<Vec<UrlRewrite>, Self::Error> {
        let entity_id = *entity_id;
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM url_rewrite
                     WHERE entity_type = ?1 AND entity_id = ?2
                     ORDER BY store_id, rowid"
                ))?;
                let rows = stmt
                    .query_map(params![ENTITY_TYPE_PRODUCT, entity_id], rewrite_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?)
    }
}

#[async_trait]
impl UrlRewriteRepository for SqliteUrlRewriteRepository {
    async fn find_by_request_path(
        &self,
        store_id: i64,
        request_path: &str,
    ) -> Result<Option<UrlRewrite>, Self::Error> {
        let request_path = request_path.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "SELECT {COLUMNS} FROM url_rewrite WHERE store_id = ?1 AND request_path = ?2"
                        ),
                        params![store_id, request_path],
                        rewrite_from_row,
                    )
                    .optional()?)
            })
            .await?)
    }

    async fn upsert_product_category_link(
        &self,
        link: UrlRewriteProductCategory,
    ) -> Result<(), Self::Error> {
        self.conn
            .call(move |conn| {
                insert_link(conn, &link)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn product_category_links(
        &self,
        product_id: i64,
    ) -> Result<Vec<UrlRewriteProductCategory>, Self::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT url_rewrite_id, product_id, category_id FROM url_rewrite_product_category
                     WHERE product_id = ?1 ORDER BY rowid",
                )?;
                let links = stmt
                    .query_map([product_id], |row| {
                        Ok(UrlRewriteProductCategory {
                            url_rewrite_id: row.get(0)?,
                            product_id: row.get(1)?,
                            category_id: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(links)
            })
            .await?)
    }

    async fn apply(&self, changes: FamilyChangeSet) -> Result<(), Self::Error> {
        let family = changes.family;
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for r in &changes.rewrites {
                    match upsert_rewrite(&tx, r) {
                        Err(err) if is_request_path_taken(&err) => {
                            return Err(tokio_rusqlite::Error::Other(Box::new(RequestPathTaken {
                                store_id: r.store_id,
                                request_path: r.request_path.clone(),
                            })));
                        }
                        res => res?,
                    };
                }
                for l in &changes.links {
                    insert_link(&tx, l)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(|err| match err {
                tokio_rusqlite::Error::Other(err) => match err.downcast::<RequestPathTaken>() {
                    Ok(taken) => anyhow::Error::new(*taken),
                    Err(err) => anyhow::Error::new(tokio_rusqlite::Error::Other(err))
                        .context(format!("Unable to write rewrites of {family}")),
                },
                err => anyhow::Error::new(err).context(format!("Unable to write rewrites of {family}")),
            })
    }
}
