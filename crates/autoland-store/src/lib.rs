//! Durable state for the autoland pipeline.
//!
//! One SQLite database holds the pipeline's own rows (`branch`,
//! `autoland_request`, `patchset`, `comments`, `complete`); a second,
//! read-only database mirrors the downstream build store the classifier
//! polls. The store is the single source of truth: bus deliveries are
//! at-least-once and duplicate suppression happens here, on the
//! `(bug, source-timestamp)` key for requests and the
//! `(bug, source-timestamp, branch)` key for patchsets.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use autoland_types::{
    Branch, BuildRecord, BuildResult, BuildStatus, Patchset, PatchsetStatus, Request,
    RequestStatus, join_branches, join_ids, parse_branches, parse_ids,
};

fn fmt_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad stored timestamp: {s:?}"))?
        .with_timezone(&Utc))
}

/// A bug comment that could not be posted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingComment {
    pub id: i64,
    pub bug: u64,
    pub body: String,
    pub attempts: u32,
    pub first_seen: DateTime<Utc>,
}

/// A patchset sealed with its final verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPatchset {
    pub patchset_id: i64,
    pub bug_id: u64,
    pub branch: String,
    pub revision: Option<String>,
    pub status: String,
    pub completion_time: DateTime<Utc>,
}

/// The autoland database.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening store {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().context("opening in-memory store")?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS branch (
                 id INTEGER PRIMARY KEY,
                 name TEXT NOT NULL UNIQUE,
                 pull_url TEXT NOT NULL,
                 push_url TEXT NOT NULL,
                 display_name TEXT,
                 enabled INTEGER NOT NULL DEFAULT 0,
                 approval_required INTEGER NOT NULL DEFAULT 0,
                 review_required INTEGER NOT NULL DEFAULT 1,
                 add_try_commit INTEGER NOT NULL DEFAULT 0,
                 use_tree_status INTEGER NOT NULL DEFAULT 0,
                 threshold INTEGER NOT NULL DEFAULT 10
             );
             CREATE TABLE IF NOT EXISTS autoland_request (
                 id INTEGER PRIMARY KEY,
                 bug_id INTEGER NOT NULL,
                 branches TEXT NOT NULL,
                 patches TEXT NOT NULL,
                 status_when TEXT NOT NULL,
                 try_syntax TEXT,
                 status TEXT NOT NULL,
                 dispatch_id TEXT,
                 created_at TEXT NOT NULL,
                 UNIQUE(bug_id, status_when)
             );
             CREATE TABLE IF NOT EXISTS patchset (
                 id INTEGER PRIMARY KEY,
                 request_id INTEGER NOT NULL REFERENCES autoland_request(id),
                 bug_id INTEGER NOT NULL,
                 branch TEXT NOT NULL,
                 patches TEXT NOT NULL,
                 status_when TEXT NOT NULL,
                 try_syntax TEXT,
                 try_run INTEGER NOT NULL DEFAULT 0,
                 author TEXT NOT NULL DEFAULT '',
                 status TEXT NOT NULL,
                 revision TEXT,
                 push_time TEXT,
                 created_at TEXT NOT NULL,
                 UNIQUE(bug_id, status_when, branch)
             );
             CREATE TABLE IF NOT EXISTS comments (
                 id INTEGER PRIMARY KEY,
                 bug INTEGER NOT NULL,
                 body TEXT NOT NULL,
                 attempts INTEGER NOT NULL DEFAULT 0,
                 first_seen TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS complete (
                 id INTEGER PRIMARY KEY,
                 patchset_id INTEGER NOT NULL,
                 bug_id INTEGER NOT NULL,
                 branch TEXT NOT NULL,
                 patches TEXT NOT NULL,
                 revision TEXT,
                 status TEXT NOT NULL,
                 completion_time TEXT NOT NULL
             );",
        )
        .context("creating store schema")?;
        Ok(Self { conn })
    }

    // -- branches -----------------------------------------------------------

    /// Insert or update a branch row by name. Branch rows are administered
    /// out of band; the pipeline itself only reads them.
    pub fn upsert_branch(&self, branch: &Branch) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO branch (name, pull_url, push_url, display_name, enabled,
                                     approval_required, review_required, add_try_commit,
                                     use_tree_status, threshold)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(name) DO UPDATE SET
                     pull_url = excluded.pull_url,
                     push_url = excluded.push_url,
                     display_name = excluded.display_name,
                     enabled = excluded.enabled,
                     approval_required = excluded.approval_required,
                     review_required = excluded.review_required,
                     add_try_commit = excluded.add_try_commit,
                     use_tree_status = excluded.use_tree_status,
                     threshold = excluded.threshold",
                params![
                    branch.name,
                    branch.pull_url,
                    branch.push_url,
                    branch.display_name,
                    branch.enabled,
                    branch.approval_required,
                    branch.review_required,
                    branch.add_try_commit,
                    branch.use_tree_status,
                    branch.threshold,
                ],
            )
            .context("upserting branch")?;
        Ok(())
    }

    fn branch_from_row(row: &Row<'_>) -> rusqlite::Result<Branch> {
        Ok(Branch {
            id: row.get("id")?,
            name: row.get("name")?,
            pull_url: row.get("pull_url")?,
            push_url: row.get("push_url")?,
            display_name: row.get("display_name")?,
            enabled: row.get("enabled")?,
            approval_required: row.get("approval_required")?,
            review_required: row.get("review_required")?,
            add_try_commit: row.get("add_try_commit")?,
            use_tree_status: row.get("use_tree_status")?,
            threshold: row.get("threshold")?,
        })
    }

    pub fn branch(&self, name: &str) -> Result<Option<Branch>> {
        self.conn
            .query_row(
                "SELECT * FROM branch WHERE name = ?1",
                params![name],
                Self::branch_from_row,
            )
            .optional()
            .context("querying branch")
    }

    pub fn enabled_branches(&self) -> Result<Vec<Branch>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM branch WHERE enabled ORDER BY name")?;
        let rows = stmt.query_map([], Self::branch_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing enabled branches")
    }

    // -- requests -----------------------------------------------------------

    /// A request is "already processed" iff a row exists for its
    /// (bug, source-timestamp) pair.
    pub fn request_processed(&self, bug_id: u64, status_when: &DateTime<Utc>) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM autoland_request WHERE bug_id = ?1 AND status_when = ?2",
            params![bug_id, fmt_time(status_when)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Persist a freshly discovered request with status `preprocessed`.
    /// Returns `None` when the (bug, source-timestamp) pair already exists.
    pub fn insert_request(
        &self,
        bug_id: u64,
        branches: &[String],
        patches: &[u64],
        status_when: &DateTime<Utc>,
        try_syntax: Option<&str>,
    ) -> Result<Option<i64>> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO autoland_request
                 (bug_id, branches, patches, status_when, try_syntax, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                bug_id,
                join_branches(branches),
                join_ids(patches),
                fmt_time(status_when),
                try_syntax,
                RequestStatus::Preprocessed.as_str(),
                fmt_time(&Utc::now()),
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(self.conn.last_insert_rowid()))
    }

    pub fn request(&self, id: i64) -> Result<Option<Request>> {
        let raw = self
            .conn
            .query_row(
                "SELECT * FROM autoland_request WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        Request {
                            id: row.get("id")?,
                            bug_id: row.get("bug_id")?,
                            branches: Vec::new(),
                            patches: Vec::new(),
                            status_when: Utc::now(),
                            try_syntax: row.get("try_syntax")?,
                            status: RequestStatus::Preprocessed,
                            dispatch_id: row.get("dispatch_id")?,
                        },
                        row.get::<_, String>("branches")?,
                        row.get::<_, String>("patches")?,
                        row.get::<_, String>("status")?,
                        row.get::<_, String>("status_when")?,
                    ))
                },
            )
            .optional()
            .context("querying request")?;

        let Some((mut request, branches, patches, status, status_when)) = raw else {
            return Ok(None);
        };
        request.branches = parse_branches(&branches);
        request.patches = parse_ids(&patches).map_err(|e| anyhow::anyhow!("{e}"))?;
        request.status = RequestStatus::parse(&status).map_err(|e| anyhow::anyhow!("{e}"))?;
        request.status_when = parse_time(&status_when)?;
        Ok(Some(request))
    }

    /// Single-writer status transition; persisted before the next step.
    pub fn set_request_status(&self, id: i64, status: RequestStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE autoland_request SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    pub fn set_request_dispatch_id(&self, id: i64, dispatch_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE autoland_request SET dispatch_id = ?1 WHERE id = ?2",
            params![dispatch_id, id],
        )?;
        Ok(())
    }

    // -- patchsets ----------------------------------------------------------

    /// Persist one queued patchset for a (request, branch). Returns `None`
    /// when the (bug, source-timestamp, branch) tuple already exists; the
    /// second attempt is a no-op by design.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_patchset(
        &self,
        request_id: i64,
        bug_id: u64,
        branch: &str,
        patches: &[u64],
        status_when: &DateTime<Utc>,
        try_syntax: Option<&str>,
        try_run: bool,
        author: &str,
    ) -> Result<Option<i64>> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO patchset
                 (request_id, bug_id, branch, patches, status_when, try_syntax,
                  try_run, author, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                request_id,
                bug_id,
                branch,
                join_ids(patches),
                fmt_time(status_when),
                try_syntax,
                try_run,
                author,
                PatchsetStatus::Queued.as_str(),
                fmt_time(&Utc::now()),
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(self.conn.last_insert_rowid()))
    }

    fn patchset_from_row(row: &Row<'_>) -> rusqlite::Result<Patchset> {
        let patches: String = row.get("patches")?;
        let status: String = row.get("status")?;
        let status_when: String = row.get("status_when")?;
        let push_time: Option<String> = row.get("push_time")?;
        // defer fallible string parsing; rusqlite rows can't carry anyhow
        Ok(Patchset {
            id: row.get("id")?,
            request_id: row.get("request_id")?,
            bug_id: row.get("bug_id")?,
            branch: row.get("branch")?,
            patches: parse_ids(&patches).unwrap_or_default(),
            status_when: parse_time(&status_when).unwrap_or_else(|_| Utc::now()),
            try_syntax: row.get("try_syntax")?,
            try_run: row.get("try_run")?,
            author: row.get("author")?,
            status: PatchsetStatus::parse(&status).unwrap_or(PatchsetStatus::Queued),
            revision: row.get("revision")?,
            push_time: push_time.and_then(|t| parse_time(&t).ok()),
        })
    }

    pub fn patchset(&self, id: i64) -> Result<Option<Patchset>> {
        self.conn
            .query_row(
                "SELECT * FROM patchset WHERE id = ?1",
                params![id],
                Self::patchset_from_row,
            )
            .optional()
            .context("querying patchset")
    }

    pub fn patchset_by_revision(&self, revision: &str) -> Result<Option<Patchset>> {
        self.conn
            .query_row(
                "SELECT * FROM patchset WHERE revision = ?1",
                params![revision],
                Self::patchset_from_row,
            )
            .optional()
            .context("querying patchset by revision")
    }

    pub fn patchsets_for_request(&self, request_id: i64) -> Result<Vec<Patchset>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM patchset WHERE request_id = ?1 ORDER BY branch")?;
        let rows = stmt.query_map(params![request_id], Self::patchset_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing patchsets for request")
    }

    /// Queued patchsets in creation order, oldest first.
    pub fn queued_patchsets(&self) -> Result<Vec<Patchset>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM patchset WHERE status = 'queued' ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], Self::patchset_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing queued patchsets")
    }

    pub fn mark_in_progress(&self, id: i64, push_time: &DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE patchset SET status = 'in-progress', push_time = ?1 WHERE id = ?2",
            params![fmt_time(push_time), id],
        )?;
        Ok(())
    }

    /// Record a successful push. The revision is set only once and never
    /// overwritten; a redelivered result is a no-op. Returns whether the
    /// row was written.
    pub fn record_push(&self, id: i64, revision: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE patchset SET status = 'pushed', revision = ?1
             WHERE id = ?2 AND revision IS NULL",
            params![revision, id],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_push_failed(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE patchset SET status = 'push-failed' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Number of in-flight patchsets on a branch, for the concurrency
    /// threshold. `count_try` false excludes try runs.
    pub fn running_jobs(&self, branch: &str, count_try: bool) -> Result<u32> {
        let sql = if count_try {
            "SELECT COUNT(*) FROM patchset WHERE branch = ?1 AND status = 'in-progress'"
        } else {
            "SELECT COUNT(*) FROM patchset
             WHERE branch = ?1 AND status = 'in-progress' AND NOT try_run"
        };
        let count: i64 = self.conn.query_row(sql, params![branch], |row| row.get(0))?;
        Ok(count as u32)
    }

    /// Seal a patchset: copy it into `complete` with its verdict and drop
    /// the live row.
    pub fn complete_patchset(&self, id: i64, status: &str) -> Result<()> {
        let Some(ps) = self.patchset(id)? else {
            return Ok(());
        };
        self.conn.execute(
            "INSERT INTO complete
                 (patchset_id, bug_id, branch, patches, revision, status, completion_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ps.id,
                ps.bug_id,
                ps.branch,
                join_ids(&ps.patches),
                ps.revision,
                status,
                fmt_time(&Utc::now()),
            ],
        )?;
        self.conn
            .execute("DELETE FROM patchset WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn completed(&self) -> Result<Vec<CompletedPatchset>> {
        let mut stmt = self.conn.prepare("SELECT * FROM complete ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let completion_time: String = row.get("completion_time")?;
            Ok(CompletedPatchset {
                patchset_id: row.get("patchset_id")?,
                bug_id: row.get("bug_id")?,
                branch: row.get("branch")?,
                revision: row.get("revision")?,
                status: row.get("status")?,
                completion_time: parse_time(&completion_time).unwrap_or_else(|_| Utc::now()),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing completed patchsets")
    }

    // -- comment outbox -----------------------------------------------------

    pub fn queue_comment(&self, bug: u64, body: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO comments (bug, body, attempts, first_seen) VALUES (?1, ?2, 0, ?3)",
            params![bug, body, fmt_time(&Utc::now())],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Oldest pending comments by attempt count, up to `limit`.
    pub fn next_comments(&self, limit: u32) -> Result<Vec<PendingComment>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM comments ORDER BY attempts ASC, id ASC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit], |row| {
            let first_seen: String = row.get("first_seen")?;
            Ok(PendingComment {
                id: row.get("id")?,
                bug: row.get("bug")?,
                body: row.get("body")?,
                attempts: row.get("attempts")?,
                first_seen: parse_time(&first_seen).unwrap_or_else(|_| Utc::now()),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing pending comments")
    }

    pub fn delete_comment(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM comments WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn bump_comment_attempts(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE comments SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }
}

/// The downstream build store. Read-only to the pipeline; the ingest
/// helper exists for fixtures and local deployments where the downstream
/// CI writes into the same file.
pub struct BuildStore {
    conn: Connection,
}

impl BuildStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening build store {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().context("opening in-memory build store")?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS build_requests (
                 id INTEGER PRIMARY KEY,
                 branch TEXT NOT NULL,
                 revision TEXT NOT NULL,
                 buildername TEXT NOT NULL,
                 result TEXT NOT NULL,
                 status TEXT NOT NULL,
                 comments TEXT NOT NULL DEFAULT '',
                 author TEXT,
                 when_timestamp TEXT NOT NULL,
                 finish_time TEXT
             );",
        )
        .context("creating build store schema")?;
        Ok(Self { conn })
    }

    pub fn insert_record(&self, record: &BuildRecord, when: &DateTime<Utc>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO build_requests
                 (branch, revision, buildername, result, status, comments, author,
                  when_timestamp, finish_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.branch,
                record.revision,
                record.buildername,
                format!("{:?}", record.result).to_lowercase(),
                format!("{:?}", record.status).to_lowercase(),
                record.comments,
                record.author,
                fmt_time(when),
                record.finish_time.as_ref().map(fmt_time),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn record_from_row(row: &Row<'_>) -> rusqlite::Result<BuildRecord> {
        let result: String = row.get("result")?;
        let status: String = row.get("status")?;
        let finish_time: Option<String> = row.get("finish_time")?;
        Ok(BuildRecord {
            build_id: row.get("id")?,
            branch: row.get("branch")?,
            revision: row.get("revision")?,
            buildername: row.get("buildername")?,
            result: BuildResult::from_str_lossy(&result),
            status: BuildStatus::from_str_lossy(&status),
            comments: row.get("comments")?,
            author: row.get("author")?,
            finish_time: finish_time.and_then(|t| parse_time(&t).ok()),
        })
    }

    /// All records tied to a revision on a branch. Revisions are matched by
    /// prefix: the store carries full hashes, the pipeline short ones.
    pub fn records_for_revision(&self, branch: &str, revision: &str) -> Result<Vec<BuildRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM build_requests
             WHERE branch LIKE ?1 || '%' AND revision LIKE ?2 || '%'
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![branch, revision], Self::record_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing build records")
    }

    /// Distinct revisions with activity on a branch inside a time window.
    pub fn revisions_between(
        &self,
        branch: &str,
        start: &DateTime<Utc>,
        end: &DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT revision FROM build_requests
             WHERE branch LIKE ?1 || '%' AND when_timestamp >= ?2 AND when_timestamp < ?3
             ORDER BY revision",
        )?;
        let rows = stmt.query_map(params![branch, fmt_time(start), fmt_time(end)], |row| {
            row.get(0)
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("listing revisions in window")
    }
}
