//! Per-family redirect graph reconciliation.
//!
//! A family's history holds every request path ever generated for one
//! `(product, store, category)` slot. Exactly one member is canonical and
//! serves the controller target, every other member answers with a 301 that
//! leads, possibly over several hops, to the canonical path. The planners here
//! are pure: they read a history snapshot and return the row writes that
//! bring it to the desired state.

use super::{FamilyChangeSet, FamilyKey, RedirectType, UrlRewrite, UrlRewriteProductCategory};
use crate::ReconcileError;
use std::ops::AddAssign;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RedirectChainPolicy {
    /// Older members keep pointing at whatever was canonical when they were
    /// demoted.
    #[default]
    Accumulate,
    /// Every member is re-pointed at the current canonical path.
    Collapse,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredRewrite {
    pub family: FamilyKey,
    pub request_path: String,
    pub target_path: String,
    /// Category the canonical row is linked to, if any.
    pub link_category_id: Option<i64>,
}

impl DesiredRewrite {
    pub fn new<S: Into<String>>(family: FamilyKey, request_path: S) -> Self {
        Self {
            family,
            request_path: request_path.into(),
            target_path: family.target_path(),
            link_category_id: family.category_id,
        }
    }

    pub fn with_link(mut self, category_id: Option<i64>) -> Self {
        self.link_category_id = category_id;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FamilyCounts {
    pub created: usize,
    pub promoted: usize,
    pub demoted: usize,
    pub healed: usize,
    pub relinked: usize,
    pub retired: usize,
    pub revived: usize,
}

impl AddAssign for FamilyCounts {
    fn add_assign(&mut self, o: Self) {
        self.created += o.created;
        self.promoted += o.promoted;
        self.demoted += o.demoted;
        self.healed += o.healed;
        self.relinked += o.relinked;
        self.retired += o.retired;
        self.revived += o.revived;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FamilyPlan {
    pub changes: FamilyChangeSet,
    pub counts: FamilyCounts,
}

impl FamilyPlan {
    fn new(family: FamilyKey) -> Self {
        Self {
            changes: FamilyChangeSet::new(family),
            counts: FamilyCounts::default(),
        }
    }

    fn link(&mut self, url_rewrite_id: Uuid, category_id: Option<i64>) {
        if let Some(category_id) = category_id {
            self.changes.links.push(UrlRewriteProductCategory {
                url_rewrite_id,
                product_id: self.changes.family.entity_id,
                category_id,
            });
        }
    }

    /// Points every member except `keep` straight at `target`.
    fn collapse(&mut self, history: &[UrlRewrite], keep: Option<Uuid>, target: &str) {
        for row in history {
            if Some(row.id) == keep {
                continue;
            }
            let mut row = self
                .changes
                .rewrites
                .iter()
                .find(|r| r.id == row.id)
                .unwrap_or(row)
                .clone();
            if row.redirect_type == RedirectType::Permanent && row.target_path == target {
                continue;
            }
            row.redirect_to(target);
            self.changes.upsert(row);
            self.counts.relinked += 1;
        }
    }

    /// Re-points members whose redirect leaves the family at `target`, so a
    /// revived family resolves again.
    fn reattach(&mut self, history: &[UrlRewrite], keep: Uuid, target: &str) {
        for row in history {
            if row.id == keep
                || row.target_path == target
                || history.iter().any(|r| r.request_path == row.target_path)
            {
                continue;
            }
            let mut row = row.clone();
            row.redirect_to(target);
            self.changes.upsert(row);
            self.counts.relinked += 1;
        }
    }
}

fn canonical_member(
    history: &[UrlRewrite],
    family: FamilyKey,
) -> Result<Option<&UrlRewrite>, ReconcileError> {
    let mut canonical = history.iter().filter(|r| r.is_canonical());
    let first = canonical.next();
    let rest = canonical.count();
    if rest > 0 {
        return Err(ReconcileError::InvariantViolation {
            family,
            canonical_count: rest + 1,
        });
    }
    Ok(first)
}

pub fn conflict(row: &UrlRewrite) -> ReconcileError {
    if row.is_autogenerated {
        ReconcileError::RequestPathConflict {
            store_id: row.store_id,
            request_path: row.request_path.clone(),
            owner: row.family(),
        }
    } else {
        ReconcileError::ManualRewriteConflict {
            store_id: row.store_id,
            request_path: row.request_path.clone(),
        }
    }
}

/// Plans the writes that make `desired` the canonical member of its family.
///
/// `collision` is whatever row already uses the desired request path in the
/// family's store, if any.
pub fn plan_family(
    history: &[UrlRewrite],
    desired: &DesiredRewrite,
    collision: Option<&UrlRewrite>,
    policy: RedirectChainPolicy,
) -> Result<FamilyPlan, ReconcileError> {
    let family = desired.family;
    let mut plan = FamilyPlan::new(family);
    let current = canonical_member(history, family)?;

    if let Some(current) = current.filter(|c| c.request_path == desired.request_path) {
        if current.target_path != desired.target_path {
            let mut healed = current.clone();
            healed.target_path = desired.target_path.clone();
            plan.changes.upsert(healed);
            plan.counts.healed += 1;
        }
        if policy == RedirectChainPolicy::Collapse {
            plan.collapse(history, Some(current.id), &desired.request_path);
        }
        return Ok(plan);
    }

    if current.is_none() && !history.is_empty() && family.category_id.is_none() {
        return Err(ReconcileError::InvariantViolation {
            family,
            canonical_count: 0,
        });
    }
    if let Some(row) = collision {
        if !history.iter().any(|r| r.id == row.id) {
            return Err(conflict(row));
        }
    }

    let next = match history
        .iter()
        .find(|r| r.request_path == desired.request_path)
    {
        Some(member) => {
            let mut member = member.clone();
            member.redirect_type = RedirectType::None;
            member.target_path = desired.target_path.clone();
            plan.counts.promoted += 1;
            member
        }
        None => {
            plan.counts.created += 1;
            UrlRewrite::canonical(
                family,
                desired.request_path.clone(),
                desired.target_path.clone(),
            )
        }
    };
    let next_id = next.id;
    plan.link(next_id, desired.link_category_id);
    plan.changes.upsert(next);

    match current {
        Some(current) => {
            let mut demoted = current.clone();
            demoted.redirect_to(desired.request_path.clone());
            plan.changes.upsert(demoted);
            plan.counts.demoted += 1;
        }
        None if !history.is_empty() => {
            plan.counts.revived += 1;
            plan.reattach(history, next_id, &desired.request_path);
        }
        None => (),
    }

    if policy == RedirectChainPolicy::Collapse {
        plan.collapse(history, Some(next_id), &desired.request_path);
    }
    Ok(plan)
}

/// Plans demoting the canonical member of a category family whose category
/// is no longer assigned, redirecting it to `redirect_to`.
pub fn plan_retirement(
    history: &[UrlRewrite],
    family: FamilyKey,
    redirect_to: &str,
    policy: RedirectChainPolicy,
) -> Result<FamilyPlan, ReconcileError> {
    let mut plan = FamilyPlan::new(family);
    let Some(current) = canonical_member(history, family)? else {
        return Ok(plan);
    };
    let mut retired = current.clone();
    retired.redirect_to(redirect_to);
    plan.changes.upsert(retired);
    plan.counts.retired += 1;
    if policy == RedirectChainPolicy::Collapse {
        plan.collapse(history, None, redirect_to);
    }
    Ok(plan)
}

/// History as it will look once `changes` are committed.
pub fn apply_changes(history: &[UrlRewrite], changes: &FamilyChangeSet) -> Vec<UrlRewrite> {
    let mut rows = history.to_vec();
    for change in &changes.rewrites {
        match rows.iter_mut().find(|r| r.id == change.id) {
            Some(row) => *row = change.clone(),
            None => rows.push(change.clone()),
        }
    }
    rows
}

#[derive(Debug, PartialEq, Eq)]
pub enum Resolution<'a> {
    Canonical(&'a UrlRewrite),
    /// The chain leaves the family, e.g. a retired category family.
    External(&'a str),
    Unknown,
    Loop,
}

/// Follows redirects from `request_path` through the family's members.
pub fn resolve<'a>(rows: &'a [UrlRewrite], request_path: &str) -> Resolution<'a> {
    let Some(mut row) = rows.iter().find(|r| r.request_path == request_path) else {
        return Resolution::Unknown;
    };
    for _ in 0..=rows.len() {
        if row.is_canonical() {
            return Resolution::Canonical(row);
        }
        match rows.iter().find(|r| r.request_path == row.target_path) {
            Some(next) => row = next,
            None => return Resolution::External(&row.target_path),
        }
    }
    Resolution::Loop
}

/// Checks the family invariant on a complete member list: at most one
/// canonical member, none missing for plain families, and every member
/// reaching the canonical path (or leaving a retired family) without loops.
pub fn verify_family(rows: &[UrlRewrite], family: FamilyKey) -> Result<(), ReconcileError> {
    let canonical = canonical_member(rows, family)?;
    if canonical.is_none() && !rows.is_empty() && family.category_id.is_none() {
        return Err(ReconcileError::InvariantViolation {
            family,
            canonical_count: 0,
        });
    }
    let ok = rows.iter().all(|r| match resolve(rows, &r.request_path) {
        Resolution::Canonical(c) => canonical.is_some_and(|canonical| canonical.id == c.id),
        Resolution::External(_) => canonical.is_none(),
        Resolution::Unknown | Resolution::Loop => false,
    });
    if ok {
        Ok(())
    } else {
        Err(ReconcileError::InvariantViolation {
            family,
            canonical_count: usize::from(canonical.is_some()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAMILY: FamilyKey = FamilyKey {
        entity_id: 7,
        store_id: 1,
        category_id: None,
    };

    fn run(history: &mut Vec<UrlRewrite>, path: &str, policy: RedirectChainPolicy) -> FamilyCounts {
        let desired = DesiredRewrite::new(FAMILY, path);
        let plan = plan_family(history, &desired, None, policy).expect("planned");
        *history = apply_changes(history, &plan.changes);
        verify_family(history, FAMILY).expect("invariant holds");
        plan.counts
    }

    fn row<'a>(history: &'a [UrlRewrite], path: &str) -> &'a UrlRewrite {
        history
            .iter()
            .find(|r| r.request_path == path)
            .expect("row exists")
    }

    #[test]
    fn first_import_creates_canonical() {
        let mut history = vec![];
        let counts = run(&mut history, "bag.html", RedirectChainPolicy::Accumulate);
        assert_eq!(counts.created, 1);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].redirect_type, RedirectType::None);
        assert_eq!(history[0].target_path, "catalog/product/view/id/7");
        assert!(history[0].is_autogenerated);
    }

    #[test]
    fn same_path_is_a_no_op() {
        let mut history = vec![];
        run(&mut history, "bag.html", RedirectChainPolicy::Accumulate);
        let plan = plan_family(
            &history,
            &DesiredRewrite::new(FAMILY, "bag.html"),
            None,
            RedirectChainPolicy::Accumulate,
        )
        .expect("planned");
        assert!(plan.changes.is_empty());
        assert_eq!(plan.counts, FamilyCounts::default());
    }

    #[test]
    fn stale_target_is_healed() {
        let mut history = vec![UrlRewrite::canonical(FAMILY, "bag.html", "catalog/old")];
        let counts = run(&mut history, "bag.html", RedirectChainPolicy::Accumulate);
        assert_eq!(counts.healed, 1);
        assert_eq!(history[0].target_path, "catalog/product/view/id/7");
    }

    #[test]
    fn rename_demotes_and_revert_promotes() {
        let mut history = vec![];
        run(&mut history, "bag.html", RedirectChainPolicy::Accumulate);
        let counts = run(&mut history, "bag-new.html", RedirectChainPolicy::Accumulate);
        assert_eq!((counts.created, counts.demoted), (1, 1));
        assert_eq!(row(&history, "bag.html").redirect_type, RedirectType::Permanent);
        assert_eq!(row(&history, "bag.html").target_path, "bag-new.html");

        let counts = run(&mut history, "bag.html", RedirectChainPolicy::Accumulate);
        assert_eq!((counts.created, counts.promoted, counts.demoted), (0, 1, 1));
        assert_eq!(history.len(), 2);
        assert_eq!(row(&history, "bag.html").redirect_type, RedirectType::None);
        assert_eq!(
            row(&history, "bag.html").target_path,
            "catalog/product/view/id/7"
        );
        assert_eq!(row(&history, "bag-new.html").target_path, "bag.html");
    }

    #[test]
    fn accumulated_chains_still_resolve() {
        let mut history = vec![];
        for path in ["a.html", "b.html", "c.html", "a.html", "d.html", "b.html"] {
            run(&mut history, path, RedirectChainPolicy::Accumulate);
        }
        assert_eq!(history.len(), 4);
        // c was demoted towards a, which was demoted towards d, which points at b
        assert_eq!(row(&history, "c.html").target_path, "a.html");
        for r in &history {
            assert!(matches!(
                resolve(&history, &r.request_path),
                Resolution::Canonical(c) if c.request_path == "b.html"
            ));
        }
    }

    #[test]
    fn collapse_points_every_member_at_canonical() {
        let mut history = vec![];
        for path in ["a.html", "b.html", "c.html", "a.html"] {
            run(&mut history, path, RedirectChainPolicy::Collapse);
        }
        assert_eq!(history.len(), 3);
        for r in history.iter().filter(|r| !r.is_canonical()) {
            assert_eq!(r.target_path, "a.html");
        }
    }

    #[test]
    fn two_canonical_members_are_rejected() {
        let history = vec![
            UrlRewrite::canonical(FAMILY, "a.html", "catalog/product/view/id/7"),
            UrlRewrite::canonical(FAMILY, "b.html", "catalog/product/view/id/7"),
        ];
        let res = plan_family(
            &history,
            &DesiredRewrite::new(FAMILY, "c.html"),
            None,
            RedirectChainPolicy::Accumulate,
        );
        assert!(matches!(
            res,
            Err(ReconcileError::InvariantViolation {
                canonical_count: 2,
                ..
            })
        ));
    }

    #[test]
    fn manual_rewrite_is_not_overwritten() {
        let mut manual = UrlRewrite::canonical(
            FamilyKey::new(0, 1, None),
            "bag.html",
            "cms/page/view/id/3",
        );
        manual.is_autogenerated = false;
        manual.entity_type = "custom".to_string();
        let res = plan_family(
            &[],
            &DesiredRewrite::new(FAMILY, "bag.html"),
            Some(&manual),
            RedirectChainPolicy::Accumulate,
        );
        assert!(matches!(
            res,
            Err(ReconcileError::ManualRewriteConflict { store_id: 1, .. })
        ));

        let foreign = UrlRewrite::canonical(
            FamilyKey::new(8, 1, None),
            "bag.html",
            "catalog/product/view/id/8",
        );
        let res = plan_family(
            &[],
            &DesiredRewrite::new(FAMILY, "bag.html"),
            Some(&foreign),
            RedirectChainPolicy::Accumulate,
        );
        assert!(matches!(
            res,
            Err(ReconcileError::RequestPathConflict { owner, .. }) if owner.entity_id == 8
        ));
    }

    #[test]
    fn category_family_links_new_canonical() {
        let family = FamilyKey::new(7, 1, Some(3));
        let plan = plan_family(
            &[],
            &DesiredRewrite::new(family, "testcategory/bag.html"),
            None,
            RedirectChainPolicy::Accumulate,
        )
        .expect("planned");
        assert_eq!(plan.changes.links.len(), 1);
        let link = &plan.changes.links[0];
        assert_eq!(link.url_rewrite_id, plan.changes.rewrites[0].id);
        assert_eq!((link.product_id, link.category_id), (7, 3));
        assert_eq!(
            plan.changes.rewrites[0].target_path,
            "catalog/product/view/id/7/category/3"
        );
        assert_eq!(plan.changes.rewrites[0].metadata.category_id, Some(3));
    }

    #[test]
    fn retired_family_is_revived() {
        let family = FamilyKey::new(7, 1, Some(3));
        let plan = plan_family(
            &[],
            &DesiredRewrite::new(family, "testcategory/bag.html"),
            None,
            RedirectChainPolicy::Accumulate,
        )
        .expect("planned");
        let history = apply_changes(&[], &plan.changes);

        let plan = plan_retirement(&history, family, "bag.html", RedirectChainPolicy::Accumulate)
            .expect("planned");
        assert_eq!(plan.counts.retired, 1);
        let history = apply_changes(&history, &plan.changes);
        assert_eq!(history[0].redirect_type, RedirectType::Permanent);
        assert_eq!(history[0].target_path, "bag.html");
        verify_family(&history, family).expect("retired family is consistent");
        assert_eq!(
            resolve(&history, "testcategory/bag.html"),
            Resolution::External("bag.html")
        );

        let again = plan_retirement(&history, family, "bag.html", RedirectChainPolicy::Accumulate)
            .expect("planned");
        assert!(again.changes.is_empty());

        let plan = plan_family(
            &history,
            &DesiredRewrite::new(family, "testcategory/bag.html"),
            None,
            RedirectChainPolicy::Accumulate,
        )
        .expect("planned");
        assert_eq!((plan.counts.promoted, plan.counts.revived), (1, 1));
        let history = apply_changes(&history, &plan.changes);
        assert_eq!(history.len(), 1);
        assert!(history[0].is_canonical());
    }

    fn retired(family: FamilyKey, paths: &[&str]) -> Vec<UrlRewrite> {
        let mut history = vec![];
        for path in paths {
            let plan = plan_family(
                &history,
                &DesiredRewrite::new(family, *path),
                None,
                RedirectChainPolicy::Accumulate,
            )
            .expect("planned");
            history = apply_changes(&history, &plan.changes);
        }
        let plan = plan_retirement(&history, family, "bag.html", RedirectChainPolicy::Accumulate)
            .expect("planned");
        apply_changes(&history, &plan.changes)
    }

    #[test]
    fn retired_family_revives_under_new_path() {
        let family = FamilyKey::new(7, 1, Some(3));
        let history = retired(family, &["testcategory/bag.html"]);
        let plan = plan_family(
            &history,
            &DesiredRewrite::new(family, "testcategory/bag2.html"),
            None,
            RedirectChainPolicy::Accumulate,
        )
        .expect("planned");
        assert_eq!(
            (plan.counts.created, plan.counts.revived, plan.counts.relinked),
            (1, 1, 1)
        );
        let history = apply_changes(&history, &plan.changes);
        verify_family(&history, family).expect("revived family is consistent");
        assert_eq!(
            row(&history, "testcategory/bag.html").target_path,
            "testcategory/bag2.html"
        );
        assert!(row(&history, "testcategory/bag2.html").is_canonical());
    }

    #[test]
    fn retired_family_revives_older_member() {
        let family = FamilyKey::new(7, 1, Some(3));
        let history = retired(family, &["testcategory/a.html", "testcategory/b.html"]);
        assert_eq!(row(&history, "testcategory/a.html").target_path, "testcategory/b.html");
        assert_eq!(row(&history, "testcategory/b.html").target_path, "bag.html");

        let plan = plan_family(
            &history,
            &DesiredRewrite::new(family, "testcategory/a.html"),
            None,
            RedirectChainPolicy::Accumulate,
        )
        .expect("planned");
        assert_eq!((plan.counts.promoted, plan.counts.relinked), (1, 1));
        let history = apply_changes(&history, &plan.changes);
        verify_family(&history, family).expect("revived family is consistent");
        assert!(row(&history, "testcategory/a.html").is_canonical());
        assert_eq!(row(&history, "testcategory/b.html").target_path, "testcategory/a.html");
    }

    #[test]
    fn plain_family_without_canonical_is_corrupt() {
        let mut only = UrlRewrite::canonical(FAMILY, "a.html", "catalog/product/view/id/7");
        only.redirect_to("b.html");
        let res = plan_family(
            &[only],
            &DesiredRewrite::new(FAMILY, "c.html"),
            None,
            RedirectChainPolicy::Accumulate,
        );
        assert!(matches!(
            res,
            Err(ReconcileError::InvariantViolation {
                canonical_count: 0,
                ..
            })
        ));
    }
}
