use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl IdentityError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Store(_) => "store",
            Self::Invariant(_) => "invariant",
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::StoreUnavailable(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContactId(pub Ulid);

impl ContactId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ContactId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContactId {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value.trim())
            .map(Self)
            .map_err(|err| IdentityError::Validation(format!("invalid contact id {value}: {err}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContactRecord {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub name: Option<String>,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
    pub version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ContactRecord {
    #[must_use]
    pub fn new_primary(
        email: Option<String>,
        phone_number: Option<String>,
        name: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: ContactId::new(),
            email,
            phone_number,
            name,
            link_precedence: LinkPrecedence::Primary,
            linked_id: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn new_secondary(
        email: Option<String>,
        phone_number: Option<String>,
        name: Option<String>,
        primary_id: ContactId,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            link_precedence: LinkPrecedence::Secondary,
            linked_id: Some(primary_id),
            ..Self::new_primary(email, phone_number, name, now)
        }
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Id of the primary owning this record, if the record is well-formed.
    #[must_use]
    pub fn owner_id(&self) -> Option<ContactId> {
        match self.link_precedence {
            LinkPrecedence::Primary => Some(self.id),
            LinkPrecedence::Secondary => self.linked_id,
        }
    }

    /// True when every identifier supplied by `request` equals this record's value.
    #[must_use]
    pub fn covers(&self, request: &IdentifyRequest) -> bool {
        let email_ok = request
            .email
            .as_ref()
            .map_or(true, |email| self.email.as_ref() == Some(email));
        let phone_ok = request
            .phone
            .as_ref()
            .map_or(true, |phone| self.phone_number.as_ref() == Some(phone));
        email_ok && phone_ok
    }

    /// Primary precedence order: earliest `created_at` first, ties broken by ascending id.
    #[must_use]
    pub fn precedence_cmp(lhs: &Self, rhs: &Self) -> Ordering {
        lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
    }

    /// Validate per-record linkage and identifier rules.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when the record carries no identifier, when its link
    /// shape contradicts its precedence, or when its version/timestamp metadata is inconsistent.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.email.is_none() && self.phone_number.is_none() {
            return Err(IdentityError::Validation(format!(
                "contact {} MUST carry an email or a phone number",
                self.id
            )));
        }

        match (self.link_precedence, self.linked_id) {
            (LinkPrecedence::Primary, Some(linked_id)) => {
                return Err(IdentityError::Validation(format!(
                    "primary contact {} MUST NOT link to {linked_id}",
                    self.id
                )));
            }
            (LinkPrecedence::Secondary, None) => {
                return Err(IdentityError::Validation(format!(
                    "secondary contact {} MUST link to a primary",
                    self.id
                )));
            }
            (LinkPrecedence::Secondary, Some(linked_id)) if linked_id == self.id => {
                return Err(IdentityError::Validation(format!(
                    "contact {} MUST NOT link to itself",
                    self.id
                )));
            }
            _ => {}
        }

        if self.version == 0 {
            return Err(IdentityError::Validation("version MUST be >= 1".to_string()));
        }

        if self.updated_at < self.created_at {
            return Err(IdentityError::Validation(format!(
                "contact {} updated_at MUST NOT precede created_at",
                self.id
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VersionedId {
    pub id: ContactId,
    pub version: u32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PhoneInput {
    Text(String),
    Number(serde_json::Number),
}

fn deserialize_phone<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<PhoneInput>::deserialize(deserializer)?;
    Ok(value.map(|input| match input {
        PhoneInput::Text(text) => text,
        PhoneInput::Number(number) => number.to_string(),
    }))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(
        default,
        alias = "phoneNumber",
        alias = "phone_number",
        deserialize_with = "deserialize_phone"
    )]
    pub phone: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl IdentifyRequest {
    /// Trim identifiers, drop blank values and require at least one of email/phone.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when neither an email nor a phone number remains.
    pub fn normalized(&self) -> Result<Self, IdentityError> {
        let normalized = Self {
            email: non_blank(self.email.as_deref()),
            phone: non_blank(self.phone.as_deref()),
            name: non_blank(self.name.as_deref()),
        };

        if normalized.email.is_none() && normalized.phone.is_none() {
            return Err(IdentityError::Validation(
                "email or phone number MUST be provided".to_string(),
            ));
        }

        Ok(normalized)
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|value| !value.is_empty()).map(ToString::to_string)
}

/// One primary and every secondary linked to it, secondaries in precedence order.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Cluster {
    pub primary: ContactRecord,
    pub secondaries: Vec<ContactRecord>,
}

impl Cluster {
    pub fn members(&self) -> impl Iterator<Item = &ContactRecord> {
        std::iter::once(&self.primary).chain(self.secondaries.iter())
    }

    #[must_use]
    pub fn covers(&self, request: &IdentifyRequest) -> bool {
        self.members().any(|record| record.covers(request))
    }
}

/// Read side of the contact store as consumed by the merge engine.
pub trait ContactStore {
    /// Every record whose email equals `email` or whose phone number equals `phone`.
    ///
    /// # Errors
    /// Returns [`IdentityError::StoreUnavailable`] or [`IdentityError::Store`] on read failures.
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<ContactRecord>, IdentityError>;

    /// The given primaries plus every record whose `linked_id` is one of them.
    ///
    /// # Errors
    /// Returns [`IdentityError::StoreUnavailable`] or [`IdentityError::Store`] on read failures.
    fn load_cluster_members(
        &self,
        primary_ids: &[ContactId],
    ) -> Result<Vec<ContactRecord>, IdentityError>;

    /// # Errors
    /// Returns [`IdentityError::StoreUnavailable`] or [`IdentityError::Store`] on read failures.
    fn load_contact(&self, id: ContactId) -> Result<Option<ContactRecord>, IdentityError>;

    /// Apply every write of `plan` or none of them.
    ///
    /// # Errors
    /// Returns [`IdentityError::Conflict`] when the matched clusters changed since the plan was
    /// resolved, and store errors when the transaction cannot be committed.
    fn apply_merge_plan(&mut self, plan: &MergePlan) -> Result<(), IdentityError>;
}

/// Resolve matched records to the distinct ids of the primaries owning them.
///
/// # Errors
/// Returns [`IdentityError::Invariant`] when a secondary carries no link.
pub fn owner_ids(matched: &[ContactRecord]) -> Result<Vec<ContactId>, IdentityError> {
    let mut owners = BTreeSet::new();
    for record in matched {
        let owner = record.owner_id().ok_or_else(|| {
            IdentityError::Invariant(format!("secondary contact {} has no linked_id", record.id))
        })?;
        owners.insert(owner);
    }
    Ok(owners.into_iter().collect())
}

/// Group loaded members into clusters keyed by the requested primary ids.
///
/// # Errors
/// Returns [`IdentityError::Invariant`] when a requested owner is missing or is not a primary.
pub fn group_clusters(
    primary_ids: &[ContactId],
    members: Vec<ContactRecord>,
) -> Result<Vec<Cluster>, IdentityError> {
    let wanted = primary_ids.iter().copied().collect::<BTreeSet<_>>();
    let mut primaries: BTreeMap<ContactId, ContactRecord> = BTreeMap::new();
    let mut secondaries: BTreeMap<ContactId, Vec<ContactRecord>> = BTreeMap::new();

    for record in members {
        if wanted.contains(&record.id) {
            if !record.is_primary() {
                return Err(IdentityError::Invariant(format!(
                    "contact {} is referenced as a primary but is secondary of {}",
                    record.id,
                    record.linked_id.map_or_else(|| "nothing".to_string(), |id| id.to_string())
                )));
            }
            primaries.insert(record.id, record);
            continue;
        }

        if let Some(linked_id) = record.linked_id.filter(|id| wanted.contains(id)) {
            secondaries.entry(linked_id).or_default().push(record);
        }
    }

    let mut clusters = Vec::with_capacity(wanted.len());
    for id in wanted {
        let primary = primaries.remove(&id).ok_or_else(|| {
            IdentityError::Invariant(format!("primary contact {id} is missing from the store"))
        })?;
        let mut members = secondaries.remove(&id).unwrap_or_default();
        members.sort_by(ContactRecord::precedence_cmp);
        clusters.push(Cluster { primary, secondaries: members });
    }
    clusters.sort_by(|lhs, rhs| ContactRecord::precedence_cmp(&lhs.primary, &rhs.primary));

    Ok(clusters)
}

/// Re-reads allowed when cluster links move between the anchor read and the member read.
const MAX_CLUSTER_REREADS: usize = 3;

/// Load the clusters owning the records returned by `anchors`.
///
/// The anchor read and the member read are separate store calls. When grouping fails, the anchors
/// are read again: unchanged anchors mean the stored links are broken, changed anchors mean a
/// concurrent write moved them and the read is repeated from the new anchors.
fn read_clusters<S, F>(store: &S, mut anchors: F) -> Result<Vec<Cluster>, IdentityError>
where
    S: ContactStore + ?Sized,
    F: FnMut(&S) -> Result<Vec<ContactRecord>, IdentityError>,
{
    let read_anchors = |anchors: &mut F| -> Result<Vec<ContactRecord>, IdentityError> {
        let mut records = anchors(store)?;
        records.sort_by(ContactRecord::precedence_cmp);
        Ok(records)
    };

    let mut matched = read_anchors(&mut anchors)?;
    let mut rereads = 0;
    loop {
        if matched.is_empty() {
            return Ok(Vec::new());
        }

        let owners = owner_ids(&matched)?;
        let members = store.load_cluster_members(&owners)?;
        let err = match group_clusters(&owners, members) {
            Ok(clusters) => return Ok(clusters),
            Err(err) => err,
        };

        let reread = read_anchors(&mut anchors)?;
        if reread == matched {
            return Err(err);
        }

        rereads += 1;
        if rereads >= MAX_CLUSTER_REREADS {
            return Err(IdentityError::Conflict(format!(
                "cluster links kept changing while being read: {err}"
            )));
        }
        matched = reread;
    }
}

/// Find every cluster sharing the request's email or phone number.
///
/// # Errors
/// Returns [`IdentityError::Validation`] for requests without identifiers, invariant errors for
/// broken links, [`IdentityError::Conflict`] when concurrent merges keep moving the matched
/// clusters, and store errors from the underlying reads.
pub fn find_clusters<S>(store: &S, request: &IdentifyRequest) -> Result<Vec<Cluster>, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let request = request.normalized()?;
    read_clusters(store, |store: &S| {
        store.find_by_email_or_phone(request.email.as_deref(), request.phone.as_deref())
    })
}

/// Load the cluster containing `contact_id`, whichever member it is.
///
/// # Errors
/// Returns invariant errors for broken links, [`IdentityError::Conflict`] when concurrent merges
/// keep moving the cluster, and store errors from the underlying reads.
pub fn load_cluster<S>(store: &S, contact_id: ContactId) -> Result<Option<Cluster>, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let clusters = read_clusters(store, |store: &S| {
        Ok(store.load_contact(contact_id)?.into_iter().collect())
    })?;
    Ok(clusters.into_iter().next())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    CreatedPrimary,
    CreatedSecondary,
    AlreadyKnown,
    MergedClusters,
}

impl MergeOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreatedPrimary => "created_primary",
            Self::CreatedSecondary => "created_secondary",
            Self::AlreadyKnown => "already_known",
            Self::MergedClusters => "merged_clusters",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MatchKeys {
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Demotion {
    pub id: ContactId,
    pub expected_version: u32,
    pub linked_id: ContactId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Relink {
    pub id: ContactId,
    pub from_primary_id: ContactId,
    pub to_primary_id: ContactId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConsolidatedFields {
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub names: Vec<String>,
}

/// Writes computed for one identify request; applied all-or-nothing by the store.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergePlan {
    pub outcome: MergeOutcome,
    pub primary_id: ContactId,
    pub match_keys: MatchKeys,
    /// Matched primaries as read; the store rejects the plan if this set changed.
    pub expected_primaries: Vec<VersionedId>,
    pub refresh_primary: Option<VersionedId>,
    pub demotions: Vec<Demotion>,
    pub relinks: Vec<Relink>,
    pub creations: Vec<ContactRecord>,
    #[serde(with = "time::serde::rfc3339")]
    pub applied_at: OffsetDateTime,
    pub consolidated: ConsolidatedFields,
}

fn push_unique(values: &mut Vec<String>, value: Option<&String>) {
    if let Some(value) = value {
        if !values.contains(value) {
            values.push(value.clone());
        }
    }
}

/// De-duplicated identifiers of `members`, first occurrence wins, input order preserved.
pub fn consolidate_fields<'a, I>(members: I) -> ConsolidatedFields
where
    I: IntoIterator<Item = &'a ContactRecord>,
{
    let mut fields = ConsolidatedFields::default();
    for record in members {
        push_unique(&mut fields.emails, record.email.as_ref());
        push_unique(&mut fields.phone_numbers, record.phone_number.as_ref());
        push_unique(&mut fields.names, record.name.as_ref());
    }
    fields
}

fn ordered_members<'a>(
    primary: &'a ContactRecord,
    others: impl IntoIterator<Item = &'a ContactRecord>,
) -> Vec<&'a ContactRecord> {
    let mut rest = others.into_iter().filter(|record| record.id != primary.id).collect::<Vec<_>>();
    rest.sort_by(|lhs, rhs| ContactRecord::precedence_cmp(lhs, rhs));
    let mut ordered = Vec::with_capacity(rest.len() + 1);
    ordered.push(primary);
    ordered.extend(rest);
    ordered
}

/// Decide how one identify request changes the matched clusters.
///
/// The surviving primary is the matched primary with the earliest `created_at`, ties broken by
/// ascending id. Other matched primaries are demoted under it and their secondaries re-pointed to
/// it. A new record is created only when no existing member covers the request.
///
/// # Errors
/// Returns [`IdentityError::Validation`] when the request carries neither email nor phone.
pub fn resolve_merge_plan(
    request: &IdentifyRequest,
    clusters: &[Cluster],
    now: OffsetDateTime,
) -> Result<MergePlan, IdentityError> {
    let request = request.normalized()?;
    let match_keys = MatchKeys { email: request.email.clone(), phone: request.phone.clone() };

    let mut ordered = clusters.iter().collect::<Vec<_>>();
    ordered.sort_by(|lhs, rhs| ContactRecord::precedence_cmp(&lhs.primary, &rhs.primary));
    ordered.dedup_by_key(|cluster| cluster.primary.id);

    let Some((survivor, absorbed)) = ordered.split_first() else {
        let record = ContactRecord::new_primary(request.email, request.phone, request.name, now);
        let consolidated = consolidate_fields([&record]);
        return Ok(MergePlan {
            outcome: MergeOutcome::CreatedPrimary,
            primary_id: record.id,
            match_keys,
            expected_primaries: Vec::new(),
            refresh_primary: None,
            demotions: Vec::new(),
            relinks: Vec::new(),
            creations: vec![record],
            applied_at: now,
            consolidated,
        });
    };

    let survivor_id = survivor.primary.id;
    let mut demotions = Vec::with_capacity(absorbed.len());
    let mut relinks = Vec::new();
    for cluster in absorbed {
        demotions.push(Demotion {
            id: cluster.primary.id,
            expected_version: cluster.primary.version,
            linked_id: survivor_id,
        });
        relinks.extend(cluster.secondaries.iter().map(|secondary| Relink {
            id: secondary.id,
            from_primary_id: cluster.primary.id,
            to_primary_id: survivor_id,
        }));
    }

    let covered = ordered.iter().any(|cluster| cluster.covers(&request));
    let mut creations = Vec::new();
    if !covered {
        creations.push(ContactRecord::new_secondary(
            request.email,
            request.phone,
            request.name,
            survivor_id,
            now,
        ));
    }

    let outcome = match (absorbed.is_empty(), covered) {
        (false, _) => MergeOutcome::MergedClusters,
        (true, true) => MergeOutcome::AlreadyKnown,
        (true, false) => MergeOutcome::CreatedSecondary,
    };

    let members = ordered_members(
        &survivor.primary,
        ordered.iter().copied().flat_map(Cluster::members).chain(creations.iter()),
    );
    let consolidated = consolidate_fields(members);

    Ok(MergePlan {
        outcome,
        primary_id: survivor_id,
        match_keys,
        expected_primaries: ordered
            .iter()
            .map(|cluster| VersionedId { id: cluster.primary.id, version: cluster.primary.version })
            .collect(),
        refresh_primary: Some(VersionedId { id: survivor_id, version: survivor.primary.version }),
        demotions,
        relinks,
        creations,
        applied_at: now,
        consolidated,
    })
}

/// Keys serialize as `primaryContactId`, `emails`, `phoneNumbers`, `names`, `secondaryContactIds`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedContact {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub names: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

/// Project a cluster into its caller-facing consolidated contact.
#[must_use]
pub fn assemble_contact(cluster: &Cluster) -> ConsolidatedContact {
    let members = ordered_members(&cluster.primary, cluster.secondaries.iter());
    let fields = consolidate_fields(members.iter().copied());
    ConsolidatedContact {
        primary_contact_id: cluster.primary.id,
        emails: fields.emails,
        phone_numbers: fields.phone_numbers,
        names: fields.names,
        secondary_contact_ids: members.iter().skip(1).map(|record| record.id).collect(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct InvariantViolation {
    pub contact_id: ContactId,
    pub rule: String,
    pub detail: String,
}

fn violation(contact_id: ContactId, rule: &str, detail: String) -> InvariantViolation {
    InvariantViolation { contact_id, rule: rule.to_string(), detail }
}

/// Audit a full set of stored contacts against the linkage invariants.
#[must_use]
pub fn audit_contacts(records: &[ContactRecord]) -> Vec<InvariantViolation> {
    let by_id = records.iter().map(|record| (record.id, record)).collect::<BTreeMap<_, _>>();
    let mut violations = Vec::new();
    let mut owners: BTreeMap<ContactId, ContactId> = BTreeMap::new();

    for record in records {
        if let Err(err) = record.validate() {
            violations.push(violation(record.id, "record_shape", err.to_string()));
            continue;
        }

        let Some(linked_id) = record.linked_id else {
            owners.insert(record.id, record.id);
            continue;
        };

        match by_id.get(&linked_id) {
            None => violations.push(violation(
                record.id,
                "dangling_link",
                format!("linked_id {linked_id} does not exist"),
            )),
            Some(target) if !target.is_primary() => violations.push(violation(
                record.id,
                "secondary_chain",
                format!("linked_id {linked_id} is itself a secondary"),
            )),
            Some(target) => {
                if ContactRecord::precedence_cmp(record, target) == Ordering::Less {
                    violations.push(violation(
                        linked_id,
                        "primary_not_earliest",
                        format!("secondary {} predates its primary", record.id),
                    ));
                }
                owners.insert(record.id, linked_id);
            }
        }
    }

    let mut email_owners: BTreeMap<&str, BTreeSet<ContactId>> = BTreeMap::new();
    let mut phone_owners: BTreeMap<&str, BTreeSet<ContactId>> = BTreeMap::new();
    for record in records {
        let Some(owner) = owners.get(&record.id).copied() else {
            continue;
        };
        if let Some(email) = record.email.as_deref() {
            email_owners.entry(email).or_default().insert(owner);
        }
        if let Some(phone) = record.phone_number.as_deref() {
            phone_owners.entry(phone).or_default().insert(owner);
        }
    }

    for (field, index) in [("email", &email_owners), ("phone_number", &phone_owners)] {
        for (value, cluster_ids) in index {
            if cluster_ids.len() < 2 {
                continue;
            }
            let listed = cluster_ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
            for cluster_id in cluster_ids {
                violations.push(violation(
                    *cluster_id,
                    "split_identity",
                    format!("{field} {value} is shared by clusters {listed}"),
                ));
            }
        }
    }

    violations.sort();
    violations.dedup();
    violations
}
