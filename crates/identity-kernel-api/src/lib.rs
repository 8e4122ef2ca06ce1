use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use identity_kernel_core::{
    assemble_contact, find_clusters, load_cluster, resolve_merge_plan, ConsolidatedContact,
    ContactId, ContactRecord, ContactStore, IdentifyRequest, IdentityError, MergeOutcome,
    MergePlan,
};
use identity_kernel_store_sqlite::{classify_error, IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

pub const API_CONTRACT_VERSION: &str = "api.v1";

pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 5;
pub const DEFAULT_MAX_UNAVAILABLE_RETRIES: u32 = 3;
pub const DEFAULT_UNAVAILABLE_BACKOFF_MS: u64 = 50;

/// Retry budget for one identify call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyPolicy {
    pub max_conflict_retries: u32,
    pub max_unavailable_retries: u32,
    /// Sleep before unavailable retry `n` is `n * unavailable_backoff_ms`.
    pub unavailable_backoff_ms: u64,
}

impl Default for IdentifyPolicy {
    fn default() -> Self {
        Self {
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            max_unavailable_retries: DEFAULT_MAX_UNAVAILABLE_RETRIES,
            unavailable_backoff_ms: DEFAULT_UNAVAILABLE_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyResponse {
    pub outcome: MergeOutcome,
    pub contact: ConsolidatedContact,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Delay before unavailable retry `retry` (1-based): `retry * unavailable_backoff_ms`, saturating.
#[must_use]
pub fn unavailable_backoff(policy: &IdentifyPolicy, retry: u32) -> Duration {
    Duration::from_millis(policy.unavailable_backoff_ms.saturating_mul(u64::from(retry)))
}

#[derive(Debug, Default)]
struct RetryBudget {
    conflicts: u32,
    unavailable: u32,
}

impl RetryBudget {
    fn attempt(&self) -> u32 {
        self.conflicts + self.unavailable + 1
    }

    /// Spend one retry on `err`, sleeping for unavailable stores, or hand the error back.
    fn absorb(&mut self, err: IdentityError, policy: &IdentifyPolicy) -> Result<(), IdentityError> {
        let attempt = self.attempt();
        match err {
            IdentityError::Conflict(detail) if self.conflicts < policy.max_conflict_retries => {
                self.conflicts += 1;
                warn!(
                    attempt,
                    conflicts = self.conflicts,
                    %detail,
                    "contact clusters moved; re-reading"
                );
                Ok(())
            }
            IdentityError::StoreUnavailable(detail)
                if self.unavailable < policy.max_unavailable_retries =>
            {
                self.unavailable += 1;
                let backoff = unavailable_backoff(policy, self.unavailable);
                warn!(
                    attempt,
                    unavailable = self.unavailable,
                    ?backoff,
                    %detail,
                    "contact store unavailable; backing off"
                );
                thread::sleep(backoff);
                Ok(())
            }
            err => Err(err),
        }
    }
}

/// Resolve and persist one identify request, re-planning from fresh state on retryable failures.
///
/// # Errors
/// Returns validation errors immediately; conflict and unavailable errors once the policy's retry
/// budget is spent; any other store or invariant error as-is.
pub fn identify_with_store<S>(
    store: &mut S,
    request: &IdentifyRequest,
    policy: &IdentifyPolicy,
) -> Result<IdentifyResponse, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let request = request.normalized()?;
    let mut budget = RetryBudget::default();

    let plan = loop {
        debug!(
            attempt = budget.attempt(),
            email = ?request.email,
            phone = ?request.phone,
            "resolving identify request"
        );
        match plan_and_apply(store, &request) {
            Ok(plan) => break plan,
            Err(err) => budget.absorb(err, policy)?,
        }
    };

    // The plan is committed; only the read of the resulting cluster is retried from here.
    let cluster = loop {
        match load_cluster(store, plan.primary_id) {
            Ok(Some(cluster)) => break cluster,
            Ok(None) => {
                return Err(IdentityError::Invariant(format!(
                    "primary {} vanished after its merge plan was applied",
                    plan.primary_id
                )))
            }
            Err(err) => budget.absorb(err, policy)?,
        }
    };

    debug!(
        outcome = plan.outcome.as_str(),
        primary_id = %cluster.primary.id,
        members = cluster.secondaries.len() + 1,
        "identify request applied"
    );
    Ok(IdentifyResponse { outcome: plan.outcome, contact: assemble_contact(&cluster) })
}

fn plan_and_apply<S>(store: &mut S, request: &IdentifyRequest) -> Result<MergePlan, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let clusters = find_clusters(store, request)?;
    let plan = resolve_merge_plan(request, &clusters, OffsetDateTime::now_utc())?;
    store.apply_merge_plan(&plan)?;
    Ok(plan)
}

#[derive(Debug, Clone)]
pub struct IdentityKernelApi {
    db_path: PathBuf,
    policy: IdentifyPolicy,
}

impl IdentityKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, policy: IdentifyPolicy::default() }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: IdentifyPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn policy(&self) -> &IdentifyPolicy {
        &self.policy
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path).map_err(|err| classify_error(err).into())
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate().map_err(classify_error)?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Reconcile one incoming identity against the stored contacts.
    ///
    /// # Errors
    /// Returns an [`IdentityError`] (downcastable from the returned error) when the request is
    /// invalid, retries are exhausted, or the store fails.
    pub fn identify(&self, request: &IdentifyRequest) -> Result<IdentifyResponse> {
        let mut store = self.open_migrated_store()?;
        Ok(identify_with_store(&mut store, request, &self.policy)?)
    }

    /// Every stored contact record ordered by creation time.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or read.
    pub fn list_contacts(&self) -> Result<Vec<ContactRecord>> {
        let store = self.open_migrated_store()?;
        store.list_contacts().map_err(|err| classify_error(err).into())
    }

    /// Consolidated view of the cluster containing `contact_id`, primary or secondary.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read or the stored links are broken.
    pub fn show_contact(&self, contact_id: ContactId) -> Result<Option<ConsolidatedContact>> {
        let store = self.open_migrated_store()?;
        Ok(load_cluster(&store, contact_id)?.as_ref().map(assemble_contact))
    }

    /// # Errors
    /// Returns an error when any integrity check fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::path::Path;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("identitykernel-api-{}.sqlite3", ContactId::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", db_path.display(), suffix));
        }
    }

    fn request(email: Option<&str>, phone: Option<&str>) -> IdentifyRequest {
        IdentifyRequest {
            email: email.map(ToString::to_string),
            phone: phone.map(ToString::to_string),
            name: None,
        }
    }

    fn no_backoff() -> IdentifyPolicy {
        IdentifyPolicy { unavailable_backoff_ms: 0, ..IdentifyPolicy::default() }
    }

    /// Delegates to an in-memory `SQLite` store, failing the first few plan applications.
    struct FlakyStore {
        inner: SqliteStore,
        conflicts_left: u32,
        unavailable_left: u32,
        apply_calls: u32,
    }

    impl FlakyStore {
        fn new(conflicts_left: u32, unavailable_left: u32) -> Result<Self> {
            let mut inner = SqliteStore::open(Path::new(":memory:"))?;
            inner.migrate()?;
            Ok(Self { inner, conflicts_left, unavailable_left, apply_calls: 0 })
        }
    }

    impl ContactStore for FlakyStore {
        fn find_by_email_or_phone(
            &self,
            email: Option<&str>,
            phone: Option<&str>,
        ) -> Result<Vec<ContactRecord>, IdentityError> {
            self.inner.find_by_email_or_phone(email, phone)
        }

        fn load_cluster_members(
            &self,
            primary_ids: &[ContactId],
        ) -> Result<Vec<ContactRecord>, IdentityError> {
            self.inner.load_cluster_members(primary_ids)
        }

        fn load_contact(&self, id: ContactId) -> Result<Option<ContactRecord>, IdentityError> {
            self.inner.load_contact(id)
        }

        fn apply_merge_plan(&mut self, plan: &MergePlan) -> Result<(), IdentityError> {
            self.apply_calls += 1;
            if self.conflicts_left > 0 {
                self.conflicts_left -= 1;
                return Err(IdentityError::Conflict("injected".to_string()));
            }
            if self.unavailable_left > 0 {
                self.unavailable_left -= 1;
                return Err(IdentityError::StoreUnavailable("injected".to_string()));
            }
            self.inner.apply_merge_plan(plan)
        }
    }

    /// Commits `racer`'s merge on a second connection the first time cluster members are read.
    struct RacingStore {
        inner: SqliteStore,
        racer: Cell<Option<(IdentityKernelApi, IdentifyRequest)>>,
    }

    impl ContactStore for RacingStore {
        fn find_by_email_or_phone(
            &self,
            email: Option<&str>,
            phone: Option<&str>,
        ) -> Result<Vec<ContactRecord>, IdentityError> {
            self.inner.find_by_email_or_phone(email, phone)
        }

        fn load_cluster_members(
            &self,
            primary_ids: &[ContactId],
        ) -> Result<Vec<ContactRecord>, IdentityError> {
            if let Some((api, racing_request)) = self.racer.take() {
                api.identify(&racing_request)
                    .map_err(|err| IdentityError::Store(format!("{err:#}")))?;
            }
            self.inner.load_cluster_members(primary_ids)
        }

        fn load_contact(&self, id: ContactId) -> Result<Option<ContactRecord>, IdentityError> {
            self.inner.load_contact(id)
        }

        fn apply_merge_plan(&mut self, plan: &MergePlan) -> Result<(), IdentityError> {
            self.inner.apply_merge_plan(plan)
        }
    }

    #[test]
    fn identify_succeeds_when_a_merge_commits_between_cluster_reads() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = IdentityKernelApi::new(db_path.clone());
        let p1 = api.identify(&request(Some("a@x.com"), Some("1")))?.contact.primary_contact_id;
        let p2 = api.identify(&request(Some("b@x.com"), Some("2")))?.contact.primary_contact_id;
        let s2 = api.identify(&request(Some("c@x.com"), Some("2")))?;
        assert_eq!(s2.contact.primary_contact_id, p2);

        let mut store = RacingStore {
            inner: SqliteStore::open(&db_path)?,
            racer: Cell::new(Some((api.clone(), request(Some("a@x.com"), Some("2"))))),
        };
        let response =
            identify_with_store(&mut store, &request(Some("c@x.com"), Some("9")), &no_backoff())?;

        assert!(store.racer.take().is_none());
        assert_eq!(response.outcome, MergeOutcome::CreatedSecondary);
        assert_eq!(response.contact.primary_contact_id, p1);
        assert!(response.contact.secondary_contact_ids.contains(&p2));
        assert!(response.contact.phone_numbers.contains(&"9".to_string()));
        assert!(api.integrity_check()?.invariant_violations.is_empty());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn unavailable_backoff_grows_linearly_and_saturates() {
        let policy = IdentifyPolicy { unavailable_backoff_ms: 50, ..IdentifyPolicy::default() };
        assert_eq!(unavailable_backoff(&policy, 1), Duration::from_millis(50));
        assert_eq!(unavailable_backoff(&policy, 3), Duration::from_millis(150));

        let huge = IdentifyPolicy { unavailable_backoff_ms: u64::MAX, ..IdentifyPolicy::default() };
        assert_eq!(unavailable_backoff(&huge, 2), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn identify_retries_conflicts_and_unavailable_store() -> Result<()> {
        let mut store = FlakyStore::new(2, 2)?;
        let response =
            identify_with_store(&mut store, &request(Some("a@x.com"), Some("1")), &no_backoff())?;

        assert_eq!(store.apply_calls, 5);
        assert_eq!(response.outcome, MergeOutcome::CreatedPrimary);
        assert_eq!(store.inner.list_contacts()?.len(), 1);
        Ok(())
    }

    #[test]
    fn identify_gives_up_after_conflict_budget() -> Result<()> {
        let policy = IdentifyPolicy { max_conflict_retries: 2, ..no_backoff() };
        let mut store = FlakyStore::new(10, 0)?;

        let Err(err) = identify_with_store(&mut store, &request(Some("a@x.com"), None), &policy)
        else {
            panic!("exhausted conflict budget should fail");
        };
        assert_eq!(err.kind(), "conflict");
        assert_eq!(store.apply_calls, 3);
        assert!(store.inner.list_contacts()?.is_empty());
        Ok(())
    }

    #[test]
    fn identify_gives_up_after_unavailable_budget() -> Result<()> {
        let policy = IdentifyPolicy { max_unavailable_retries: 1, ..no_backoff() };
        let mut store = FlakyStore::new(0, 5)?;

        let Err(err) = identify_with_store(&mut store, &request(None, Some("1")), &policy) else {
            panic!("exhausted unavailable budget should fail");
        };
        assert_eq!(err.kind(), "store_unavailable");
        assert_eq!(store.apply_calls, 2);
        Ok(())
    }

    #[test]
    fn identify_rejects_requests_without_identifiers_before_touching_store() -> Result<()> {
        let mut store = FlakyStore::new(0, 0)?;
        let blank = IdentifyRequest {
            email: Some("   ".to_string()),
            phone: None,
            name: Some("Nobody".to_string()),
        };

        let Err(err) = identify_with_store(&mut store, &blank, &no_backoff()) else {
            panic!("blank request should be rejected");
        };
        assert_eq!(err.kind(), "validation");
        assert_eq!(store.apply_calls, 0);
        Ok(())
    }

    #[test]
    fn api_identify_walks_new_extend_idempotent_and_show() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = IdentityKernelApi::new(db_path.clone());

        let created = api.identify(&request(Some("a@x.com"), Some("1")))?;
        assert_eq!(created.outcome, MergeOutcome::CreatedPrimary);
        assert_eq!(created.contact.emails, vec!["a@x.com".to_string()]);
        assert_eq!(created.contact.phone_numbers, vec!["1".to_string()]);
        assert!(created.contact.secondary_contact_ids.is_empty());

        let extended = api.identify(&request(Some("a@x.com"), Some("2")))?;
        assert_eq!(extended.outcome, MergeOutcome::CreatedSecondary);
        assert_eq!(extended.contact.primary_contact_id, created.contact.primary_contact_id);
        assert_eq!(extended.contact.phone_numbers, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(extended.contact.secondary_contact_ids.len(), 1);

        let repeated = api.identify(&request(Some("a@x.com"), Some("2")))?;
        assert_eq!(repeated.outcome, MergeOutcome::AlreadyKnown);
        assert_eq!(repeated.contact, extended.contact);
        assert_eq!(api.list_contacts()?.len(), 2);

        let secondary_id = extended.contact.secondary_contact_ids[0];
        assert_eq!(api.show_contact(secondary_id)?, Some(extended.contact));
        assert_eq!(api.show_contact(ContactId::new())?, None);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_identify_merges_clusters_under_earliest_primary() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = IdentityKernelApi::new(db_path.clone());

        let first = api.identify(&request(Some("a@x.com"), Some("1")))?;
        let second = api.identify(&request(Some("b@x.com"), Some("2")))?;
        let second_extra = api.identify(&request(Some("c@x.com"), Some("2")))?;
        assert_eq!(second_extra.contact.primary_contact_id, second.contact.primary_contact_id);

        let merged = api.identify(&request(Some("a@x.com"), Some("2")))?;
        assert_eq!(merged.outcome, MergeOutcome::MergedClusters);
        assert_eq!(merged.contact.primary_contact_id, first.contact.primary_contact_id);
        assert_eq!(
            merged.contact.emails,
            vec!["a@x.com".to_string(), "b@x.com".to_string(), "c@x.com".to_string()]
        );
        assert_eq!(merged.contact.phone_numbers, vec!["1".to_string(), "2".to_string()]);
        assert!(merged.contact.secondary_contact_ids.contains(&second.contact.primary_contact_id));
        assert!(merged
            .contact
            .secondary_contact_ids
            .iter()
            .all(|id| *id != first.contact.primary_contact_id));

        let report = api.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.invariant_violations.is_empty());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_migrate_dry_run_reports_pending_versions() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = IdentityKernelApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn concurrent_merges_and_extends_converge_on_earliest_primary() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = IdentityKernelApi::new(db_path.clone()).with_policy(IdentifyPolicy {
            max_conflict_retries: 100,
            max_unavailable_retries: 10,
            unavailable_backoff_ms: 5,
        });

        let mut primaries = Vec::new();
        for cluster in 0..4 {
            let email = format!("p{cluster}@x.com");
            let created = api.identify(&request(Some(&email), Some(&format!("{cluster}0"))))?;
            primaries.push(created.contact.primary_contact_id);
        }
        let survivor = primaries[0];

        let rounds = 5;
        let handles = (0..4)
            .map(|cluster| {
                let api = api.clone();
                thread::spawn(move || -> Result<Vec<ContactId>> {
                    let own_email = format!("p{cluster}@x.com");
                    let mut bridged_primaries = Vec::new();
                    for round in 0..rounds {
                        let phone = format!("{cluster}-{round}");
                        api.identify(&request(Some(&own_email), Some(&phone)))?;
                        if cluster > 0 {
                            let bridged = api.identify(&request(
                                Some("p0@x.com"),
                                Some(&format!("{cluster}0")),
                            ))?;
                            bridged_primaries.push(bridged.contact.primary_contact_id);
                        }
                    }
                    Ok(bridged_primaries)
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            let Ok(result) = handle.join() else {
                panic!("identify thread panicked");
            };
            assert!(result?.iter().all(|primary| *primary == survivor));
        }

        let contacts = api.list_contacts()?;
        assert_eq!(contacts.len(), 4 + 4 * rounds + 3);
        assert!(contacts
            .iter()
            .filter(|record| record.id != survivor)
            .all(|record| record.linked_id == Some(survivor)));

        let Some(merged) = api.show_contact(primaries[3])? else {
            panic!("absorbed primary should resolve to the merged cluster");
        };
        assert_eq!(merged.primary_contact_id, survivor);
        assert_eq!(merged.secondary_contact_ids.len(), contacts.len() - 1);

        let report = api.integrity_check()?;
        assert!(report.invariant_violations.is_empty());
        assert!(report.foreign_key_violations.is_empty());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn concurrent_identifies_on_same_cluster_keep_both_secondaries() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = IdentityKernelApi::new(db_path.clone())
            .with_policy(IdentifyPolicy { max_conflict_retries: 50, ..IdentifyPolicy::default() });
        let primary = api.identify(&request(Some("shared@x.com"), Some("0")))?;

        let handles = (1..=2)
            .map(|index| {
                let api = api.clone();
                thread::spawn(move || {
                    api.identify(&request(Some("shared@x.com"), Some(&index.to_string())))
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            let Ok(result) = handle.join() else {
                panic!("identify thread panicked");
            };
            let response = result?;
            assert_eq!(response.contact.primary_contact_id, primary.contact.primary_contact_id);
        }

        let Some(contact) = api.show_contact(primary.contact.primary_contact_id)? else {
            panic!("primary should still resolve to a cluster");
        };
        assert_eq!(contact.secondary_contact_ids.len(), 2);
        assert_eq!(
            contact.phone_numbers.iter().filter(|phone| phone.as_str() != "0").count(),
            2
        );

        cleanup(&db_path);
        Ok(())
    }
}
