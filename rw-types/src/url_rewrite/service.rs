use super::reconcile::{
    apply_changes, conflict, plan_family, plan_retirement, verify_family, DesiredRewrite,
    FamilyCounts, FamilyPlan, RedirectChainPolicy,
};
use super::{ByFamily, ByProduct, FamilyKey, RequestPathTaken, UrlRewrite, UrlRewriteRepository};
use crate::category::{request_path, CategoryTree};
use crate::product::ProductContext;
use crate::store::{resolve_stores, ResolvedStore, StoreHierarchy};
use crate::{ErrorScope, ReconcileError};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use typesafe_repository::async_ops::Select;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RewriteOptions {
    pub url_suffix: String,
    pub chain_policy: RedirectChainPolicy,
    pub retire_unassigned_categories: bool,
    pub link_root_category: bool,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            url_suffix: ".html".to_string(),
            chain_policy: RedirectChainPolicy::Accumulate,
            retire_unassigned_categories: true,
            link_root_category: false,
        }
    }
}

/// Store hierarchy and category tree as of the start of an import run.
#[derive(Clone, Debug, Default)]
pub struct CatalogSnapshot {
    pub hierarchy: StoreHierarchy,
    pub categories: CategoryTree,
}

#[derive(Debug, Default)]
pub struct ReconciliationResult {
    pub created_count: usize,
    pub promoted_count: usize,
    pub demoted_count: usize,
    pub healed_count: usize,
    pub relinked_count: usize,
    pub retired_count: usize,
    pub revived_count: usize,
    pub renamed_stores: usize,
    /// Families skipped because of a request path conflict.
    pub family_failures: Vec<(FamilyKey, ReconcileError)>,
}

impl ReconciliationResult {
    fn absorb(&mut self, c: FamilyCounts) {
        self.created_count += c.created;
        self.promoted_count += c.promoted;
        self.demoted_count += c.demoted;
        self.healed_count += c.healed;
        self.relinked_count += c.relinked;
        self.retired_count += c.retired;
        self.revived_count += c.revived;
    }

    pub fn is_unchanged(&self) -> bool {
        self.created_count
            + self.promoted_count
            + self.demoted_count
            + self.healed_count
            + self.relinked_count
            + self.retired_count
            == 0
    }
}

type LockMap = Arc<Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>>;

/// Exclusive sections keyed by product entity id.
#[derive(Clone, Default)]
pub struct ProductLocks {
    inner: LockMap,
}

pub struct ProductGuard {
    entity_id: i64,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ProductLocks {
    pub async fn acquire(&self, entity_id: i64) -> ProductGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            // entries nobody holds or waits on, left by cancelled waiters
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(entity_id).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        ProductGuard {
            entity_id,
            locks: self.inner.clone(),
            guard: Some(guard),
        }
    }

    /// Number of products currently locked or waited on.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ProductGuard {
    fn drop(&mut self) {
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        if map
            .get(&self.entity_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.entity_id);
        }
    }
}

pub struct UrlRewriteService {
    repo: Arc<dyn UrlRewriteRepository>,
    options: RewriteOptions,
    locks: ProductLocks,
}

impl UrlRewriteService {
    pub fn new(repo: Arc<dyn UrlRewriteRepository>, options: RewriteOptions) -> Self {
        Self {
            repo,
            options,
            locks: ProductLocks::default(),
        }
    }

    pub fn options(&self) -> &RewriteOptions {
        &self.options
    }

    /// Plain family first, then one family per category below the store root.
    pub fn desired_rewrites(
        &self,
        product: &ProductContext,
        store: &ResolvedStore,
        categories: &CategoryTree,
    ) -> Result<Vec<DesiredRewrite>, ReconcileError> {
        let suffix = &self.options.url_suffix;
        let plain = FamilyKey::new(product.entity_id, store.store_id, None);
        let root_link = self
            .options
            .link_root_category
            .then_some(store.root_category_id);
        let mut desired =
            vec![
                DesiredRewrite::new(plain, request_path(&[], &store.url_key, suffix))
                    .with_link(root_link),
            ];
        let mut seen = BTreeSet::new();
        for &category_id in &store.category_ids {
            if !seen.insert(category_id) {
                continue;
            }
            match categories.breadcrumb(category_id, store.root_category_id)? {
                None => log::debug!(
                    "Category {category_id} is outside root {} of store {}, skipping",
                    store.root_category_id,
                    store.store_id
                ),
                Some(segments) if segments.is_empty() => (),
                Some(segments) => desired.push(DesiredRewrite::new(
                    FamilyKey::new(product.entity_id, store.store_id, Some(category_id)),
                    request_path(&segments, &store.url_key, suffix),
                )),
            }
        }
        Ok(desired)
    }

    /// Brings every rewrite family of `product` in line with its current url
    /// keys and category assignments.
    pub async fn reconcile_product(
        &self,
        product: &ProductContext,
        snapshot: &CatalogSnapshot,
    ) -> Result<ReconciliationResult, ReconcileError> {
        let stores = resolve_stores(product, &snapshot.hierarchy)?;
        let mut work = Vec::with_capacity(stores.len());
        for store in &stores {
            work.push((store, self.desired_rewrites(product, store, &snapshot.categories)?));
        }

        let _guard = self.locks.acquire(product.entity_id).await;
        let existing = if self.options.retire_unassigned_categories {
            self.repo.select(&ByProduct(product.entity_id)).await?
        } else {
            vec![]
        };

        let mut result = ReconciliationResult::default();
        for (store, desired) in work {
            if store.renamed {
                log::info!(
                    "Url key of {} changed to {:?} in store {}",
                    product.sku,
                    store.url_key,
                    store.store_id
                );
                result.renamed_stores += 1;
            }
            let mut plain_ok = true;
            for d in &desired {
                match self.reconcile_family(d).await {
                    Ok(counts) => result.absorb(counts),
                    Err(err) if err.scope() == ErrorScope::Family => {
                        log::warn!("Skipping rewrites of {}: {err}", d.family);
                        plain_ok &= d.family.category_id.is_some();
                        result.family_failures.push((d.family, err));
                    }
                    Err(err) => return Err(err),
                }
            }
            if self.options.retire_unassigned_categories && plain_ok {
                let counts = self.retire_unassigned(store, &desired, &existing).await?;
                result.absorb(counts);
            }
        }
        log::debug!(
            "Reconciled {} ({}): {} created, {} promoted, {} demoted, {} retired",
            product.sku,
            product.entity_id,
            result.created_count,
            result.promoted_count,
            result.demoted_count,
            result.retired_count
        );
        Ok(result)
    }

    async fn find_history(&self, family: FamilyKey) -> Result<Vec<UrlRewrite>, ReconcileError> {
        Ok(self.repo.select(&ByFamily(family)).await?)
    }

    async fn reconcile_family(
        &self,
        desired: &DesiredRewrite,
    ) -> Result<FamilyCounts, ReconcileError> {
        let history = self.find_history(desired.family).await?;
        let collision = if history
            .iter()
            .any(|r| r.request_path == desired.request_path)
        {
            None
        } else {
            self.repo
                .find_by_request_path(desired.family.store_id, &desired.request_path)
                .await?
        };
        let plan = plan_family(
            &history,
            desired,
            collision.as_ref(),
            self.options.chain_policy,
        )?;
        self.commit(&history, plan).await
    }

    /// Demotes category families of `store` whose category is no longer
    /// assigned, pointing them at the store's plain canonical path.
    async fn retire_unassigned(
        &self,
        store: &ResolvedStore,
        desired: &[DesiredRewrite],
        existing: &[UrlRewrite],
    ) -> Result<FamilyCounts, ReconcileError> {
        let mut counts = FamilyCounts::default();
        let Some(plain) = desired.first() else {
            return Ok(counts);
        };
        let stale: BTreeSet<FamilyKey> = existing
            .iter()
            .filter(|r| r.is_autogenerated && r.store_id == store.store_id)
            .map(UrlRewrite::family)
            .filter(|f| f.category_id.is_some())
            .filter(|f| !desired.iter().any(|d| d.family == *f))
            .collect();
        for family in stale {
            let history = self.find_history(family).await?;
            let plan = plan_retirement(
                &history,
                family,
                &plain.request_path,
                self.options.chain_policy,
            )?;
            counts += self.commit(&history, plan).await?;
        }
        Ok(counts)
    }

    async fn commit(
        &self,
        history: &[UrlRewrite],
        plan: FamilyPlan,
    ) -> Result<FamilyCounts, ReconcileError> {
        if plan.changes.is_empty() {
            return Ok(plan.counts);
        }
        let family = plan.changes.family;
        verify_family(&apply_changes(history, &plan.changes), family)?;
        if let Err(err) = self.repo.apply(plan.changes).await {
            return Err(match err.downcast::<RequestPathTaken>() {
                Ok(taken) => self.taken_by(taken).await?,
                Err(err) => err.into(),
            });
        }
        log::debug!("Committed {family}: {:?}", plan.counts);
        Ok(plan.counts)
    }

    /// Conflict for a path another import wrote between the collision check
    /// and the commit.
    async fn taken_by(&self, taken: RequestPathTaken) -> Result<ReconcileError, ReconcileError> {
        let owner = self
            .repo
            .find_by_request_path(taken.store_id, &taken.request_path)
            .await?;
        Ok(match owner {
            Some(row) => conflict(&row),
            None => ReconcileError::PersistenceFailure(taken.into()),
        })
    }
}
