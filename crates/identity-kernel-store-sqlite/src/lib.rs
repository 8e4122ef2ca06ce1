use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use identity_kernel_core::{
    audit_contacts, owner_ids, ContactId, ContactRecord, ContactStore, IdentityError,
    InvariantViolation, LinkPrecedence, MergePlan, VersionedId,
};
use rusqlite::{
    params, params_from_iter, Connection, DatabaseName, ErrorCode, OptionalExtension,
    TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  id TEXT PRIMARY KEY,
  email TEXT,
  phone_number TEXT,
  name TEXT,
  link_precedence TEXT NOT NULL CHECK (link_precedence IN ('primary','secondary')),
  linked_id TEXT,
  version INTEGER NOT NULL CHECK (version >= 1),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  CHECK (email IS NOT NULL OR phone_number IS NOT NULL),
  CHECK (
    (link_precedence = 'primary' AND linked_id IS NULL)
    OR (link_precedence = 'secondary' AND linked_id IS NOT NULL AND linked_id <> id)
  ),
  FOREIGN KEY (linked_id) REFERENCES contacts(id)
);

CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
CREATE INDEX IF NOT EXISTS idx_contacts_phone_number ON contacts(phone_number);
CREATE INDEX IF NOT EXISTS idx_contacts_linked_id ON contacts(linked_id);
";

const CONTACT_COLUMNS: &str = "id, email, phone_number, name, link_precedence, linked_id, version, \
                               created_at, updated_at";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
    pub contact_count: usize,
    pub invariant_violations: Vec<InvariantViolation>,
}

#[derive(Debug)]
struct ContactRow {
    id: String,
    email: Option<String>,
    phone_number: Option<String>,
    name: Option<String>,
    link_precedence: String,
    linked_id: Option<String>,
    version: u32,
    created_at: String,
    updated_at: String,
}

impl ContactRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            phone_number: row.get(2)?,
            name: row.get(3)?,
            link_precedence: row.get(4)?,
            linked_id: row.get(5)?,
            version: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<ContactRecord> {
        let link_precedence = LinkPrecedence::parse(&self.link_precedence)
            .ok_or_else(|| anyhow!("unknown link_precedence: {}", self.link_precedence))?;
        Ok(ContactRecord {
            id: parse_contact_id(&self.id)?,
            email: self.email,
            phone_number: self.phone_number,
            name: self.name,
            link_precedence,
            linked_id: self.linked_id.as_deref().map(parse_contact_id).transpose()?,
            version: self.version,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

impl SqliteStore {
    /// Open a SQLite-backed contact store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Persist one validated contact record as-is.
    ///
    /// # Errors
    /// Returns an error when validation fails or the insert is rejected.
    pub fn insert_contact(&mut self, record: &ContactRecord) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        insert_contact_row(&tx, record)?;
        tx.commit().context("failed to commit contact insert")?;
        Ok(())
    }

    /// Load every stored contact ordered by creation time, then id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded from `SQLite`.
    pub fn list_contacts(&self) -> Result<Vec<ContactRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {CONTACT_COLUMNS} FROM contacts"))
            .context("failed to prepare contact listing")?;
        let rows = stmt.query_map([], ContactRow::from_row)?;
        let mut records = decode_rows(rows)?;
        records.sort_by(ContactRecord::precedence_cmp);
        Ok(records)
    }

    /// Exact-match lookup on email or phone number.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails or rows cannot be decoded.
    pub fn find_contacts(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<ContactRecord>> {
        query_matches(&self.conn, email, phone)
    }

    /// Load the given primaries together with every record linked to them.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails or rows cannot be decoded.
    pub fn cluster_members(&self, primary_ids: &[ContactId]) -> Result<Vec<ContactRecord>> {
        if primary_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (1..=primary_ids.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
             WHERE id IN ({placeholders}) OR linked_id IN ({placeholders})"
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare cluster lookup")?;
        let rows = stmt.query_map(
            params_from_iter(primary_ids.iter().map(ToString::to_string)),
            ContactRow::from_row,
        )?;
        decode_rows(rows)
    }

    /// # Errors
    /// Returns an error when the lookup query fails or the row cannot be decoded.
    pub fn get_contact(&self, id: ContactId) -> Result<Option<ContactRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![id.to_string()],
                ContactRow::from_row,
            )
            .optional()
            .with_context(|| format!("failed to load contact {id}"))?;
        row.map(ContactRow::into_record).transpose()
    }

    /// Apply one merge plan inside a single immediate transaction.
    ///
    /// The matched clusters are re-read under the write lock; if their primaries or versions differ
    /// from the plan's expectation the transaction is abandoned with [`IdentityError::Conflict`].
    ///
    /// # Errors
    /// Returns a conflict error when a guard fails, or any `SQLite` error raised by the writes.
    pub fn commit_merge_plan(&mut self, plan: &MergePlan) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start merge transaction")?;

        verify_expected_primaries(&tx, plan)?;

        let applied_at = rfc3339(plan.applied_at)?;

        for demotion in &plan.demotions {
            let changed = tx
                .execute(
                    "UPDATE contacts
                     SET link_precedence = 'secondary', linked_id = ?2, version = version + 1,
                         updated_at = ?3
                     WHERE id = ?1 AND link_precedence = 'primary' AND version = ?4",
                    params![
                        demotion.id.to_string(),
                        demotion.linked_id.to_string(),
                        applied_at,
                        demotion.expected_version,
                    ],
                )
                .with_context(|| format!("failed to demote contact {}", demotion.id))?;
            if changed != 1 {
                return Err(conflict(format!("contact {} is no longer demotable", demotion.id)));
            }
        }

        for relink in &plan.relinks {
            let changed = tx
                .execute(
                    "UPDATE contacts
                     SET linked_id = ?2, version = version + 1, updated_at = ?3
                     WHERE id = ?1 AND link_precedence = 'secondary' AND linked_id = ?4",
                    params![
                        relink.id.to_string(),
                        relink.to_primary_id.to_string(),
                        applied_at,
                        relink.from_primary_id.to_string(),
                    ],
                )
                .with_context(|| format!("failed to relink contact {}", relink.id))?;
            if changed != 1 {
                return Err(conflict(format!(
                    "contact {} no longer links to {}",
                    relink.id, relink.from_primary_id
                )));
            }
        }

        for demotion in &plan.demotions {
            let orphans: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM contacts WHERE linked_id = ?1",
                    params![demotion.id.to_string()],
                    |row| row.get(0),
                )
                .context("failed to count secondaries of demoted contact")?;
            if orphans != 0 {
                return Err(conflict(format!(
                    "{orphans} secondaries still link to demoted contact {}",
                    demotion.id
                )));
            }
        }

        if let Some(refresh) = plan.refresh_primary {
            let changed = tx
                .execute(
                    "UPDATE contacts SET version = version + 1, updated_at = ?2
                     WHERE id = ?1 AND link_precedence = 'primary' AND version = ?3",
                    params![refresh.id.to_string(), applied_at, refresh.version],
                )
                .with_context(|| format!("failed to refresh primary {}", refresh.id))?;
            if changed != 1 {
                return Err(conflict(format!("primary {} changed concurrently", refresh.id)));
            }
        }

        for record in &plan.creations {
            insert_contact_row(&tx, record)?;
        }

        tx.commit().context("failed to commit merge transaction")?;
        Ok(())
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, schema status, and the contact invariant audit.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let contacts = if schema_status.current_version > 0 {
            self.list_contacts()?
        } else {
            Vec::new()
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
            contact_count: contacts.len(),
            invariant_violations: audit_contacts(&contacts),
        })
    }
}

impl ContactStore for SqliteStore {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<ContactRecord>, IdentityError> {
        self.find_contacts(email, phone).map_err(classify_error)
    }

    fn load_cluster_members(
        &self,
        primary_ids: &[ContactId],
    ) -> Result<Vec<ContactRecord>, IdentityError> {
        self.cluster_members(primary_ids).map_err(classify_error)
    }

    fn load_contact(&self, id: ContactId) -> Result<Option<ContactRecord>, IdentityError> {
        self.get_contact(id).map_err(classify_error)
    }

    fn apply_merge_plan(&mut self, plan: &MergePlan) -> Result<(), IdentityError> {
        self.commit_merge_plan(plan).map_err(classify_error)
    }
}

/// Map a store error onto the identity error taxonomy.
///
/// Busy, locked and unopenable databases are reported as unavailable so callers can back off and
/// retry; identity errors raised by the store keep their kind.
#[must_use]
pub fn classify_error(err: anyhow::Error) -> IdentityError {
    if let Some(identity) = err.chain().find_map(|cause| cause.downcast_ref::<IdentityError>()) {
        return identity.clone();
    }

    let unavailable = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if matches!(
                    failure.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen
                )
        )
    });

    if unavailable {
        IdentityError::StoreUnavailable(format!("{err:#}"))
    } else {
        IdentityError::Store(format!("{err:#}"))
    }
}

fn conflict(message: String) -> anyhow::Error {
    anyhow::Error::new(IdentityError::Conflict(message))
}

fn verify_expected_primaries(conn: &Connection, plan: &MergePlan) -> Result<()> {
    let matched =
        query_matches(conn, plan.match_keys.email.as_deref(), plan.match_keys.phone.as_deref())?;
    let owners = owner_ids(&matched)?;

    let mut current = Vec::with_capacity(owners.len());
    for id in owners {
        let row: Option<(u32, String)> = conn
            .query_row(
                "SELECT version, link_precedence FROM contacts WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to read version of contact {id}"))?;
        match row {
            Some((version, precedence)) if precedence == LinkPrecedence::Primary.as_str() => {
                current.push(VersionedId { id, version });
            }
            _ => return Err(conflict(format!("contact {id} is no longer a primary"))),
        }
    }

    let mut expected = plan.expected_primaries.clone();
    expected.sort();
    current.sort();
    if current != expected {
        return Err(conflict(format!(
            "matched clusters changed since the plan was resolved (expected {}, found {})",
            expected.len(),
            current.len()
        )));
    }

    Ok(())
}

fn query_matches(
    conn: &Connection,
    email: Option<&str>,
    phone: Option<&str>,
) -> Result<Vec<ContactRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE email = ?1 OR phone_number = ?2"
        ))
        .context("failed to prepare contact match query")?;
    let rows = stmt.query_map(params![email, phone], ContactRow::from_row)?;
    decode_rows(rows)
}

fn decode_rows<F>(rows: rusqlite::MappedRows<'_, F>) -> Result<Vec<ContactRecord>>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<ContactRow>,
{
    let mut records = Vec::new();
    for row in rows {
        records.push(row.context("failed to read contact row")?.into_record()?);
    }
    Ok(records)
}

fn insert_contact_row(conn: &Connection, record: &ContactRecord) -> Result<()> {
    record.validate()?;

    conn.execute(
        "INSERT INTO contacts(
            id, email, phone_number, name, link_precedence, linked_id, version,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.id.to_string(),
            record.email,
            record.phone_number,
            record.name,
            record.link_precedence.as_str(),
            record.linked_id.map(|id| id.to_string()),
            record.version,
            rfc3339(record.created_at)?,
            rfc3339(record.updated_at)?,
        ],
    )
    .with_context(|| format!("failed to insert contact {}", record.id))?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_contact_id(raw: &str) -> Result<ContactId> {
    Ok(ContactId::from_str(raw)?)
}
