use actix::prelude::*;
use anyhow::{anyhow, Context as AnyhowContext};
use derive_more::Display;
use futures::stream::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use itertools::Itertools;
use log_error::LogError;
use rw_types::category::{slugify, CategoryRepository};
use rw_types::product::{ProductContext, ProductRepository, StoreOverride, DEFAULT_SCOPE};
use rw_types::store::StoreRepository;
use rw_types::url_rewrite::service::{CatalogSnapshot, ReconciliationResult, UrlRewriteService};
use rw_types::url_rewrite::FamilyKey;
use rw_types::{split_list, ReconcileError};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::empty_string_as_none;
use crate::import_throttle::ImportThrottle;

/// One line of a product import file.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ImportRow {
    pub sku: String,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub store_view_code: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub product_websites: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub url_key: Option<String>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub name: Option<String>,
    /// Comma separated category paths, e.g. `Default Category/Bags`.
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub categories: Option<String>,
}

/// Rows of one sku: the default-scope row and any store view rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductRows {
    pub sku: String,
    pub default: Option<ImportRow>,
    pub store_rows: Vec<ImportRow>,
}

/// Groups rows by sku, keeping the order in which skus first appear.
pub async fn parse_rows(data: &str) -> Result<Vec<ProductRows>, anyhow::Error> {
    let mut rdr = csv_async::AsyncReaderBuilder::new()
        .delimiter(b',')
        .trim(csv_async::Trim::All)
        .create_deserializer(data.as_bytes());
    let mut records = rdr.deserialize::<ImportRow>();
    let mut products: Vec<ProductRows> = vec![];
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut n = 0;
    while let Some(row) = records.next().await {
        n += 1;
        let row = row.with_context(|| format!("Invalid import record {n}"))?;
        let sku = row.sku.trim().to_string();
        if sku.is_empty() {
            log::warn!("Import record {n} has no sku, skipping");
            continue;
        }
        let i = *index.entry(sku.clone()).or_insert_with(|| {
            products.push(ProductRows {
                sku,
                ..Default::default()
            });
            products.len() - 1
        });
        let product = &mut products[i];
        if row.store_view_code.is_some() {
            product.store_rows.push(row);
        } else {
            if product.default.is_some() {
                log::warn!("Duplicate default row of {}, using the last one", product.sku);
            }
            product.default = Some(row);
        }
    }
    Ok(products)
}

fn url_key_of(row: &ImportRow) -> Option<String> {
    row.url_key
        .clone()
        .or_else(|| row.name.as_deref().map(slugify))
        .filter(|k| !k.is_empty())
}

fn category_ids(cell: &str, snapshot: &CatalogSnapshot) -> Result<Vec<i64>, ReconcileError> {
    let mut ids = vec![];
    for path in split_list(cell) {
        let id = snapshot
            .categories
            .find_by_path(path)
            .ok_or_else(|| ReconcileError::UnknownCategoryPath(path.to_string()))?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}

/// Builds the engine input for one sku. `previous` holds the url keys
/// remembered from the last import, keyed by store id.
pub fn build_context(
    rows: &ProductRows,
    entity_id: i64,
    previous: &HashMap<i64, String>,
    snapshot: &CatalogSnapshot,
) -> Result<ProductContext, anyhow::Error> {
    let default = rows
        .default
        .as_ref()
        .ok_or_else(|| anyhow!("No default scope row for {}", rows.sku))?;
    let url_key = url_key_of(default)
        .ok_or_else(|| anyhow!("Neither url_key nor name is set for {}", rows.sku))?;
    let mut product = ProductContext::new(entity_id, rows.sku.clone(), url_key)
        .with_websites(default.product_websites.as_deref().unwrap_or_default())
        .with_categories(category_ids(
            default.categories.as_deref().unwrap_or_default(),
            snapshot,
        )?);
    product.previous_url_key = previous.get(&DEFAULT_SCOPE).cloned();
    for row in &rows.store_rows {
        let Some(code) = row.store_view_code.as_deref() else {
            continue;
        };
        let previous_url_key = snapshot
            .hierarchy
            .store_by_code(code)
            .and_then(|s| previous.get(&s.id))
            .cloned();
        let assigned = row
            .categories
            .as_deref()
            .map(|cell| category_ids(cell, snapshot))
            .transpose()?;
        product = product.with_override(
            code,
            StoreOverride {
                url_key: row.url_key.clone(),
                category_ids: assigned,
                previous_url_key,
            },
        );
    }
    Ok(product)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyFailure {
    pub sku: String,
    pub family: FamilyKey,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Products reconciled without a product-level failure.
    pub products: usize,
    pub created: usize,
    pub promoted: usize,
    pub demoted: usize,
    pub healed: usize,
    pub relinked: usize,
    pub retired: usize,
    pub revived: usize,
    pub renamed: usize,
    pub family_failures: Vec<FamilyFailure>,
    /// `(sku, reason)`
    pub product_failures: Vec<(String, String)>,
    pub cancelled: bool,
}

impl ImportReport {
    fn record(&mut self, sku: &str, r: ReconciliationResult) {
        self.products += 1;
        self.created += r.created_count;
        self.promoted += r.promoted_count;
        self.demoted += r.demoted_count;
        self.healed += r.healed_count;
        self.relinked += r.relinked_count;
        self.retired += r.retired_count;
        self.revived += r.revived_count;
        self.renamed += r.renamed_stores;
        self.family_failures
            .extend(r.family_failures.into_iter().map(|(family, err)| FamilyFailure {
                sku: sku.to_string(),
                family,
                reason: err.to_string(),
            }));
    }

    fn merge(&mut self, o: ImportReport) {
        self.products += o.products;
        self.created += o.created;
        self.promoted += o.promoted;
        self.demoted += o.demoted;
        self.healed += o.healed;
        self.relinked += o.relinked;
        self.retired += o.retired;
        self.revived += o.revived;
        self.renamed += o.renamed;
        self.family_failures.extend(o.family_failures);
        self.product_failures.extend(o.product_failures);
        self.cancelled |= o.cancelled;
    }

    pub fn log(&self, source: &str) {
        log::info!(
            "Imported {source}: {} products, {} rewrites created, {} promoted, {} demoted, {} healed, {} retired, {} renamed",
            self.products,
            self.created,
            self.promoted,
            self.demoted,
            self.healed,
            self.retired,
            self.renamed,
        );
        if !self.family_failures.is_empty() {
            log::warn!(
                "{} rewrite families of {source} were skipped",
                self.family_failures.len()
            );
        }
        if !self.product_failures.is_empty() {
            log::warn!(
                "Failed products of {source}: {}",
                self.product_failures.iter().map(|(sku, _)| sku).join(", ")
            );
        }
        if self.cancelled {
            log::warn!("Import of {source} was cancelled");
        }
    }
}

pub struct ImportRunner {
    service: Arc<UrlRewriteService>,
    products: Arc<dyn ProductRepository>,
    stores: Arc<dyn StoreRepository>,
    categories: Arc<dyn CategoryRepository>,
    throttle: ImportThrottle,
    batch_size: usize,
}

impl ImportRunner {
    pub fn new(
        service: Arc<UrlRewriteService>,
        products: Arc<dyn ProductRepository>,
        stores: Arc<dyn StoreRepository>,
        categories: Arc<dyn CategoryRepository>,
        throttle: ImportThrottle,
        batch_size: usize,
    ) -> Self {
        Self {
            service,
            products,
            stores,
            categories,
            throttle,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn load_snapshot(&self) -> Result<CatalogSnapshot, anyhow::Error> {
        Ok(CatalogSnapshot {
            hierarchy: self
                .stores
                .load_store_hierarchy()
                .await
                .context("Unable to load store hierarchy")?,
            categories: self
                .categories
                .load_category_tree()
                .await
                .context("Unable to load category tree")?,
        })
    }

    pub async fn import_file(
        self: &Arc<Self>,
        path: &Path,
        token: CancellationToken,
        progress: Option<ProgressStyle>,
    ) -> Result<ImportReport, anyhow::Error> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Unable to read {}", path.display()))?;
        self.import_str(&data, token, progress).await
    }

    /// Reconciles every product of `data` against one catalog snapshot.
    pub async fn import_str(
        self: &Arc<Self>,
        data: &str,
        token: CancellationToken,
        progress: Option<ProgressStyle>,
    ) -> Result<ImportReport, anyhow::Error> {
        let products = parse_rows(data).await?;
        let snapshot = Arc::new(self.load_snapshot().await?);
        let pb = progress.map(|s| Arc::new(ProgressBar::new(products.len() as u64).with_style(s)));
        let batches: Vec<Vec<ProductRows>> = products
            .into_iter()
            .chunks(self.batch_size)
            .into_iter()
            .map(Iterator::collect)
            .collect();

        let mut workers = JoinSet::new();
        for batch in batches {
            let runner = self.clone();
            let snapshot = snapshot.clone();
            let token = token.clone();
            let pb = pb.clone();
            workers.spawn(async move { runner.run_batch(batch, &snapshot, token, pb).await });
        }
        let mut report = ImportReport::default();
        while let Some(res) = workers.join_next().await {
            match res {
                Ok(r) => report.merge(r),
                Err(err) => return Err(anyhow!("Import worker failed: {err}")),
            }
        }
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }
        report.cancelled |= token.is_cancelled();
        Ok(report)
    }

    async fn run_batch(
        &self,
        batch: Vec<ProductRows>,
        snapshot: &CatalogSnapshot,
        token: CancellationToken,
        pb: Option<Arc<ProgressBar>>,
    ) -> ImportReport {
        let mut report = ImportReport::default();
        let permit = tokio::select! {
            permit = self.throttle.acquire() => permit,
            _ = token.cancelled() => return report,
        };
        let Some(_permit) = permit.log_error("Unable to start import batch") else {
            return report;
        };
        for rows in batch {
            if token.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.import_product(&rows, snapshot).await {
                Ok(r) => report.record(&rows.sku, r),
                Err(err) => {
                    log::error!("Unable to import {}: {err:#}", rows.sku);
                    report.product_failures.push((rows.sku.clone(), format!("{err:#}")));
                }
            }
            if let Some(pb) = &pb {
                pb.inc(1);
            }
        }
        report
    }

    async fn import_product(
        &self,
        rows: &ProductRows,
        snapshot: &CatalogSnapshot,
    ) -> Result<ReconciliationResult, anyhow::Error> {
        let entity = self.products.ensure_by_sku(&rows.sku).await?;
        let previous = self.products.url_keys(entity.entity_id).await?;
        let product = build_context(rows, entity.entity_id, &previous, snapshot)?;
        let result = self.service.reconcile_product(&product, snapshot).await?;

        let mut keys = vec![(DEFAULT_SCOPE, product.url_key.clone())];
        for (code, o) in &product.store_overrides {
            if let (Some(store), Some(url_key)) =
                (snapshot.hierarchy.store_by_code(code), &o.url_key)
            {
                keys.push((store.id, url_key.clone()));
            }
        }
        self.products
            .save_url_keys(entity.entity_id, keys)
            .await
            .with_context(|| format!("Unable to remember url keys of {}", rows.sku))?;
        Ok(result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum ImportStatus {
    #[display("Idle")]
    Idle,
    #[display("Importing {_0}")]
    InProgress(String),
    #[display("Finished, {} products imported", _0.products)]
    Finished(ImportReport),
    #[display("Failed: {_0}")]
    Failed(String),
}

/// Runs one import at a time. `token` shuts the service down, [`Cancel`]
/// only stops the run in progress.
pub struct ImportService {
    runner: Arc<ImportRunner>,
    token: CancellationToken,
    run: Option<CancellationToken>,
    progress: Option<ProgressStyle>,
    status: ImportStatus,
}

impl ImportService {
    pub fn new(
        runner: Arc<ImportRunner>,
        token: CancellationToken,
        progress: Option<ProgressStyle>,
    ) -> Self {
        Self {
            runner,
            token,
            run: None,
            progress,
            status: ImportStatus::Idle,
        }
    }
}

impl Actor for ImportService {
    type Context = Context<Self>;
}

#[derive(Message)]
#[rtype(result = "Result<ImportReport, anyhow::Error>")]
pub struct RunImport(pub PathBuf);

#[derive(Message)]
#[rtype(result = "ImportStatus")]
pub struct GetStatus;

#[derive(Message)]
#[rtype(result = "()")]
pub struct Cancel;

impl Handler<RunImport> for ImportService {
    type Result = ResponseActFuture<Self, Result<ImportReport, anyhow::Error>>;

    fn handle(&mut self, RunImport(path): RunImport, _ctx: &mut Self::Context) -> Self::Result {
        if let ImportStatus::InProgress(current) = &self.status {
            let err = anyhow!("Import of {current} is already running");
            return Box::pin(async move { Err::<ImportReport, _>(err) }.into_actor(self));
        }
        let source = path.display().to_string();
        self.status = ImportStatus::InProgress(source.clone());
        let runner = self.runner.clone();
        let token = self.token.child_token();
        self.run = Some(token.clone());
        let progress = self.progress.clone();
        let fut = async move { runner.import_file(&path, token, progress).await };
        Box::pin(fut.into_actor(self).map(move |res, act, _ctx| {
            act.run = None;
            act.status = match &res {
                Ok(report) => {
                    report.log(&source);
                    ImportStatus::Finished(report.clone())
                }
                Err(err) => {
                    log::error!("Import of {source} failed: {err:#}");
                    ImportStatus::Failed(format!("{err:#}"))
                }
            };
            res
        }))
    }
}

impl Handler<GetStatus> for ImportService {
    type Result = MessageResult<GetStatus>;

    fn handle(&mut self, _: GetStatus, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.status.clone())
    }
}

impl Handler<Cancel> for ImportService {
    type Result = ();

    fn handle(&mut self, _: Cancel, _ctx: &mut Self::Context) -> Self::Result {
        match &self.run {
            Some(run) => {
                log::warn!("Cancelling import");
                run.cancel();
            }
            None => log::info!("No import to cancel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::{import_categories_from_str, SqliteCategoryRepository};
    use crate::product::SqliteProductRepository;
    use crate::store::{import_stores_from_str, SqliteStoreRepository};
    use crate::url_rewrite::SqliteUrlRewriteRepository;
    use rw_types::url_rewrite::service::RewriteOptions;
    use rw_types::url_rewrite::{ByProduct, RedirectType, UrlRewrite, UrlRewriteRepository};
    use tokio_rusqlite::Connection;
    use typesafe_repository::async_ops::Select;

    const HEADER: &str = "sku,store_view_code,product_websites,url_key,name,categories\n";

    struct Fixture {
        runner: Arc<ImportRunner>,
        rewrites: Arc<SqliteUrlRewriteRepository>,
        products: Arc<SqliteProductRepository>,
    }

    impl Fixture {
        async fn new(two_websites: bool, batch_size: usize) -> Self {
            let conn = Connection::open_in_memory().await.expect("opened");
            let rewrites = Arc::new(
                SqliteUrlRewriteRepository::init(conn.clone())
                    .await
                    .expect("rewrites"),
            );
            let stores = Arc::new(SqliteStoreRepository::init(conn.clone()).await.expect("stores"));
            let categories = Arc::new(
                SqliteCategoryRepository::init(conn.clone())
                    .await
                    .expect("categories"),
            );
            let products = Arc::new(SqliteProductRepository::init(conn).await.expect("products"));
            if two_websites {
                import_stores_from_str(crate::store::tests::TWO_WEBSITES, stores.clone())
                    .await
                    .expect("stores imported");
            }
            import_categories_from_str(crate::category::tests::TEST_CATEGORIES, categories.clone())
                .await
                .expect("categories imported");
            let service = Arc::new(UrlRewriteService::new(
                rewrites.clone(),
                RewriteOptions::default(),
            ));
            let runner = Arc::new(ImportRunner::new(
                service,
                products.clone(),
                stores,
                categories,
                ImportThrottle::new(2),
                batch_size,
            ));
            Self {
                runner,
                rewrites,
                products,
            }
        }

        async fn import(&self, rows: &str) -> ImportReport {
            self.runner
                .import_str(&format!("{HEADER}{rows}"), CancellationToken::new(), None)
                .await
                .expect("imported")
        }

        async fn rewrites_of(&self, sku: &str) -> Vec<UrlRewrite> {
            let entity = self.products.ensure_by_sku(sku).await.expect("product");
            self.rewrites
                .select(&ByProduct(entity.entity_id))
                .await
                .expect("rewrites")
        }
    }

    fn find<'a>(rows: &'a [UrlRewrite], store_id: i64, path: &str) -> &'a UrlRewrite {
        rows.iter()
            .find(|r| r.store_id == store_id && r.request_path == path)
            .expect("rewrite exists")
    }

    #[tokio::test]
    async fn rows_are_grouped_by_sku_in_file_order() {
        let data = format!(
            "{HEADER}b,,base,b-key,B,\na,,base,a-key,A,\nb,default,,b-store,,\n,,base,x,X,\n"
        );
        let products = parse_rows(&data).await.expect("parsed");
        assert_eq!(
            products.iter().map(|p| p.sku.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
        assert_eq!(products[0].store_rows.len(), 1);
        assert_eq!(
            products[0].store_rows[0].url_key.as_deref(),
            Some("b-store")
        );
        assert_eq!(products[0].default.as_ref().and_then(|r| r.categories.clone()), None);
    }

    #[tokio::test]
    async fn single_store_single_import() {
        let f = Fixture::new(false, 100).await;
        let report = f
            .import("24-MB01,,base,joust-duffle-bag-s,Joust Duffle Bag,\n")
            .await;
        assert_eq!((report.products, report.created), (1, 1));
        let entity = f.products.ensure_by_sku("24-MB01").await.expect("product");
        let rows = f.rewrites_of("24-MB01").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].request_path, "joust-duffle-bag-s.html");
        assert_eq!(
            rows[0].target_path,
            format!("catalog/product/view/id/{}", entity.entity_id)
        );
        assert_eq!(rows[0].redirect_type, RedirectType::None);
        assert_eq!(rows[0].store_id, 1);
    }

    #[tokio::test]
    async fn renamed_product_keeps_old_path_as_redirect() {
        let f = Fixture::new(false, 100).await;
        f.import("24-MB01,,base,joust-duffle-bag-s,,\n").await;
        let report = f.import("24-MB01,,base,joust-duffle-bag-s-new,,\n").await;
        assert_eq!((report.created, report.demoted, report.renamed), (1, 1, 1));
        let rows = f.rewrites_of("24-MB01").await;
        assert_eq!(rows.len(), 2);
        let old = find(&rows, 1, "joust-duffle-bag-s.html");
        assert_eq!(old.redirect_type, RedirectType::Permanent);
        assert_eq!(old.target_path, "joust-duffle-bag-s-new.html");
        assert!(find(&rows, 1, "joust-duffle-bag-s-new.html").is_canonical());

        let report = f.import("24-MB01,,base,joust-duffle-bag-s,,\n").await;
        assert_eq!((report.created, report.promoted, report.demoted), (0, 1, 1));
        let rows = f.rewrites_of("24-MB01").await;
        assert_eq!(rows.len(), 2);
        assert!(find(&rows, 1, "joust-duffle-bag-s.html").is_canonical());
        let new = find(&rows, 1, "joust-duffle-bag-s-new.html");
        assert_eq!(new.redirect_type, RedirectType::Permanent);
        assert_eq!(new.target_path, "joust-duffle-bag-s.html");
    }

    #[tokio::test]
    async fn category_path_produces_rooted_rewrite() {
        let f = Fixture::new(false, 100).await;
        let report = f
            .import("24-MB01,,base,joust-duffle-bag-s,,Default Category/Testcategory\n")
            .await;
        assert_eq!(report.created, 2);
        let rows = f.rewrites_of("24-MB01").await;
        let rooted = find(&rows, 1, "testcategory/joust-duffle-bag-s.html");
        assert_eq!(rooted.metadata.category_id, Some(3));
        assert!(rooted.target_path.ends_with("/category/3"));
        let links = f
            .rewrites
            .product_category_links(rooted.entity_id)
            .await
            .expect("links");
        assert_eq!(links.len(), 1);
        assert_eq!((links[0].url_rewrite_id, links[0].category_id), (rooted.id, 3));
    }

    #[tokio::test]
    async fn two_websites_fan_out_to_every_store() {
        let f = Fixture::new(true, 100).await;
        let report = f
            .import("24-MB01,,\"base,ch\",joust-duffle-bag-s,,Default Category/Testcategory\n")
            .await;
        assert_eq!(report.created, 8);
        let rows = f.rewrites_of("24-MB01").await;
        for store_id in 1..=4 {
            assert!(find(&rows, store_id, "joust-duffle-bag-s.html").is_canonical());
            assert!(find(&rows, store_id, "testcategory/joust-duffle-bag-s.html").is_canonical());
        }
    }

    #[tokio::test]
    async fn store_view_row_overrides_url_key() {
        let f = Fixture::new(true, 100).await;
        f.import("24-MB01,,base,bag,,\n24-MB01,default_second,,tasche,,\n")
            .await;
        let rows = f.rewrites_of("24-MB01").await;
        assert_eq!(rows.len(), 2);
        assert!(find(&rows, 1, "bag.html").is_canonical());
        assert!(find(&rows, 2, "tasche.html").is_canonical());

        let report = f
            .import("24-MB01,,base,bag,,\n24-MB01,default_second,,tasche-neu,,\n")
            .await;
        assert_eq!((report.created, report.demoted, report.renamed), (1, 1, 1));
        let rows = f.rewrites_of("24-MB01").await;
        assert_eq!(find(&rows, 2, "tasche.html").target_path, "tasche-neu.html");
    }

    #[tokio::test]
    async fn url_key_falls_back_to_name() {
        let f = Fixture::new(false, 100).await;
        f.import("24-MB01,,base,,Joust Duffle Bag,\n").await;
        let rows = f.rewrites_of("24-MB01").await;
        assert_eq!(rows[0].request_path, "joust-duffle-bag.html");
    }

    #[tokio::test]
    async fn bad_products_do_not_stop_the_run() {
        let f = Fixture::new(false, 1).await;
        let report = f
            .import(
                "a,,base,a,,Default Category/Missing\n\
                 b,,fr,b,,\n\
                 c,,base,c,,\n\
                 d,default_second,,d,,\n",
            )
            .await;
        assert_eq!(report.products, 1);
        let failed: Vec<_> = report
            .product_failures
            .iter()
            .map(|(sku, _)| sku.as_str())
            .sorted()
            .collect();
        assert_eq!(failed, vec!["a", "b", "d"]);
        assert!(f.rewrites_of("a").await.is_empty());
        assert!(f.rewrites_of("b").await.is_empty());
        assert_eq!(f.rewrites_of("c").await.len(), 1);
    }

    #[tokio::test]
    async fn conflicting_family_is_reported() {
        let f = Fixture::new(false, 100).await;
        let report = f.import("a,,base,bag,,\nb,,base,bag,,\n").await;
        assert_eq!(report.products, 2);
        assert_eq!(report.created, 1);
        assert_eq!(report.family_failures.len(), 1);
        assert_eq!(report.family_failures[0].sku, "b");
        assert!(f.rewrites_of("b").await.is_empty());
    }

    #[tokio::test]
    async fn parallel_batches_report_shared_paths_per_family() {
        let f = Fixture::new(false, 1).await;
        let report = f
            .import(
                "a,,base,bag,,Default Category/Testcategory\n\
                 b,,base,bag,,Default Category/Testcategory\n",
            )
            .await;
        assert_eq!(report.products, 2);
        assert!(report.product_failures.is_empty());
        assert_eq!(report.created, 2);
        assert_eq!(report.family_failures.len(), 2);
        for failure in &report.family_failures {
            assert!(failure.reason.contains("is already used by"), "{}", failure.reason);
        }
    }

    #[tokio::test]
    async fn many_batches_import_every_product() {
        let f = Fixture::new(false, 3).await;
        let rows: String = (0..20)
            .map(|i| format!("sku-{i},,base,product-{i},,Default Category/Testcategory\n"))
            .collect();
        let report = f.import(&rows).await;
        assert_eq!(report.products, 20);
        assert_eq!(report.created, 40);
        assert!(report.product_failures.is_empty());
        let again = f.import(&rows).await;
        assert_eq!(again.products, 20);
        assert_eq!(again.created + again.promoted + again.demoted, 0);
    }

    #[tokio::test]
    async fn cancelled_run_imports_nothing() {
        let f = Fixture::new(false, 100).await;
        let token = CancellationToken::new();
        token.cancel();
        let report = f
            .runner
            .import_str(&format!("{HEADER}a,,base,a,,\n"), token, None)
            .await
            .expect("finished");
        assert!(report.cancelled);
        assert_eq!(report.products, 0);
        assert!(f.rewrites_of("a").await.is_empty());
    }

    #[actix_rt::test]
    async fn service_tracks_run_status() {
        let f = Fixture::new(false, 100).await;
        let path = std::env::temp_dir().join(format!("rw-import-{}.csv", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, format!("{HEADER}a,,base,a,,\n"))
            .await
            .expect("written");
        let addr = ImportService::new(f.runner.clone(), CancellationToken::new(), None).start();
        assert_eq!(addr.send(GetStatus).await.expect("status"), ImportStatus::Idle);

        let report = addr
            .send(RunImport(path.clone()))
            .await
            .expect("sent")
            .expect("imported");
        assert_eq!(report.created, 1);
        let status = addr.send(GetStatus).await.expect("status");
        assert_eq!(status, ImportStatus::Finished(report));
        assert_eq!(status.to_string(), "Finished, 1 products imported");

        let missing = path.with_extension("missing");
        assert!(addr.send(RunImport(missing)).await.expect("sent").is_err());
        assert!(matches!(
            addr.send(GetStatus).await.expect("status"),
            ImportStatus::Failed(_)
        ));
        tokio::fs::remove_file(&path).await.log_error("Unable to remove test file");
    }

    #[actix_rt::test]
    async fn cancel_only_stops_current_run() {
        let f = Fixture::new(false, 100).await;
        let path = std::env::temp_dir().join(format!("rw-import-{}.csv", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, format!("{HEADER}a,,base,a,,\n"))
            .await
            .expect("written");
        let shutdown = CancellationToken::new();
        let addr = ImportService::new(f.runner.clone(), shutdown.clone(), None).start();
        addr.send(Cancel).await.expect("cancelled");
        let report = addr
            .send(RunImport(path.clone()))
            .await
            .expect("sent")
            .expect("finished");
        assert!(!report.cancelled);
        assert_eq!(report.products, 1);

        shutdown.cancel();
        let report = addr
            .send(RunImport(path.clone()))
            .await
            .expect("sent")
            .expect("finished");
        assert!(report.cancelled);
        assert_eq!(report.products, 0);
        tokio::fs::remove_file(&path).await.log_error("Unable to remove test file");
    }
}
