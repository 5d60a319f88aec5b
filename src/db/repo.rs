use super::model::{EntryUpsert, RunOutcome};
use crate::model::{
    CacheEntry, GenerationProgress, GenerationStatus, NaturalKey, PageType, PurgeScope,
    StaleTarget,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::Row;
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;

const ENTRY_COLUMNS: &str =
    "path, page_type, natural_key, html_ref, content_hash, generated_at, is_stale";
const PROGRESS_COLUMNS: &str = "page_type, current_offset, total_count, status, last_error, \
                                started_at, completed_at, updated_at";

/// How long a writer waits for the SQLite write lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL and stricter durability on every pooled connection. Concurrent page
    // types write through separate connections and queue on the write lock.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. Leaves in-memory URLs
/// untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn ping(pool: &Pool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

fn parse_page_type(raw: &str) -> Result<PageType> {
    PageType::parse(raw).ok_or_else(|| anyhow!("unknown page type {} in database", raw))
}

fn entry_from_row(row: &SqliteRow) -> Result<CacheEntry> {
    let page_type: String = row.try_get("page_type")?;
    Ok(CacheEntry {
        path: row.try_get("path")?,
        page_type: parse_page_type(&page_type)?,
        natural_key: NaturalKey(row.try_get("natural_key")?),
        html_ref: row.try_get("html_ref")?,
        content_hash: row.try_get("content_hash")?,
        generated_at: row.try_get("generated_at")?,
        is_stale: row.try_get("is_stale")?,
    })
}

fn progress_from_row(row: &SqliteRow) -> Result<GenerationProgress> {
    let page_type: String = row.try_get("page_type")?;
    let status: String = row.try_get("status")?;
    let current_offset: i64 = row.try_get("current_offset")?;
    let total_count: i64 = row.try_get("total_count")?;
    Ok(GenerationProgress {
        page_type: parse_page_type(&page_type)?,
        current_offset: current_offset.max(0) as u64,
        total_count: total_count.max(0) as u64,
        status: GenerationStatus::parse_status(&status)
            .ok_or_else(|| anyhow!("progress row {} has unknown status {}", page_type, status))?,
        last_error: row.try_get("last_error")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ---------------------------------------------------------------------------
// cache_entries
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn get_entry(pool: &Pool, path: &str) -> Result<Option<CacheEntry>> {
    let row = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE path = ?"
    ))
    .bind(path)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(entry_from_row).transpose()
}

/// Swap the whole row for `path` in one statement and return the handle that
/// was stored before, if any. Readers see either the old row or the new one.
///
/// The old handle is captured by the same `INSERT .. ON CONFLICT` that replaces
/// it, so the write lock is taken before anything is read and two writers of
/// the same path each get back exactly the handle they displaced.
#[instrument(skip_all, fields(path = entry.path))]
pub async fn upsert_entry(pool: &Pool, entry: &EntryUpsert<'_>) -> Result<Option<String>> {
    let replaced: Option<String> = sqlx::query_scalar(
        "INSERT INTO cache_entries (path, page_type, natural_key, html_ref, content_hash, generated_at, is_stale, replaced_ref) \
         VALUES (?, ?, ?, ?, ?, ?, 0, NULL) \
         ON CONFLICT(path) DO UPDATE SET \
             replaced_ref = cache_entries.html_ref, \
             page_type = excluded.page_type, \
             natural_key = excluded.natural_key, \
             html_ref = excluded.html_ref, \
             content_hash = excluded.content_hash, \
             generated_at = excluded.generated_at, \
             is_stale = 0 \
         RETURNING replaced_ref",
    )
    .bind(entry.path)
    .bind(entry.page_type.as_str())
    .bind(entry.natural_key.as_str())
    .bind(entry.html_ref)
    .bind(entry.content_hash)
    .bind(entry.generated_at)
    .fetch_one(pool)
    .await
    .context("failed to upsert cache entry")?;
    Ok(replaced.filter(|old| old != entry.html_ref))
}

#[instrument(skip_all)]
pub async fn list_entries_by_type(
    pool: &Pool,
    page_type: PageType,
    stale_only: bool,
) -> Result<Vec<CacheEntry>> {
    let sql = if stale_only {
        format!(
            "SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE page_type = ? AND is_stale = 1 ORDER BY path"
        )
    } else {
        format!("SELECT {ENTRY_COLUMNS} FROM cache_entries WHERE page_type = ? ORDER BY path")
    };
    let rows = sqlx::query(&sql)
        .bind(page_type.as_str())
        .fetch_all(pool)
        .await?;
    rows.iter().map(entry_from_row).collect()
}

#[instrument(skip_all)]
pub async fn count_entries_by_type(pool: &Pool, page_type: PageType) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries WHERE page_type = ?")
        .bind(page_type.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count.max(0) as u64)
}

/// Counts grouped by page type, one pass over the table.
#[instrument(skip_all)]
pub async fn count_entries_grouped(pool: &Pool) -> Result<Vec<(PageType, u64)>> {
    let rows = sqlx::query(
        "SELECT page_type, COUNT(*) AS cnt FROM cache_entries GROUP BY page_type ORDER BY page_type",
    )
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            let raw: String = row.try_get("page_type")?;
            let cnt: i64 = row.try_get("cnt")?;
            Ok((parse_page_type(&raw)?, cnt.max(0) as u64))
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn count_stale_entries(pool: &Pool) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries WHERE is_stale = 1")
        .fetch_one(pool)
        .await?;
    Ok(count.max(0) as u64)
}

/// Delete matching rows and return the blob handles they pointed at.
#[instrument(skip_all, fields(scope = scope.label()))]
pub async fn delete_entries(pool: &Pool, scope: PurgeScope) -> Result<Vec<String>> {
    let refs: Vec<String> = match scope {
        PurgeScope::All => {
            sqlx::query_scalar("DELETE FROM cache_entries RETURNING html_ref")
                .fetch_all(pool)
                .await?
        }
        PurgeScope::Stale => {
            sqlx::query_scalar("DELETE FROM cache_entries WHERE is_stale = 1 RETURNING html_ref")
                .fetch_all(pool)
                .await?
        }
        PurgeScope::PageType(pt) => {
            sqlx::query_scalar("DELETE FROM cache_entries WHERE page_type = ? RETURNING html_ref")
                .bind(pt.as_str())
                .fetch_all(pool)
                .await?
        }
    };
    Ok(refs)
}

/// Whether any row still points at `html_ref`.
pub async fn html_ref_in_use(pool: &Pool, html_ref: &str) -> Result<bool> {
    let hit: Option<i64> = sqlx::query_scalar("SELECT 1 FROM cache_entries WHERE html_ref = ? LIMIT 1")
        .bind(html_ref)
        .fetch_optional(pool)
        .await?;
    Ok(hit.is_some())
}

#[instrument(skip_all)]
pub async fn mark_stale(pool: &Pool, target: &StaleTarget) -> Result<u64> {
    let res = match target {
        StaleTarget::AllOfType(pt) => {
            sqlx::query("UPDATE cache_entries SET is_stale = 1 WHERE page_type = ?")
                .bind(pt.as_str())
                .execute(pool)
                .await?
        }
        StaleTarget::Key(pt, key) => {
            sqlx::query(
                "UPDATE cache_entries SET is_stale = 1 WHERE page_type = ? AND natural_key = ?",
            )
            .bind(pt.as_str())
            .bind(key.as_str())
            .execute(pool)
            .await?
        }
        StaleTarget::Path(path) => {
            sqlx::query("UPDATE cache_entries SET is_stale = 1 WHERE path = ?")
                .bind(path)
                .execute(pool)
                .await?
        }
    };
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// generation_progress
// ---------------------------------------------------------------------------

/// Create the idle row for `page_type` if it does not exist yet.
#[instrument(skip_all)]
pub async fn ensure_progress_row(pool: &Pool, page_type: PageType) -> Result<()> {
    sqlx::query(
        "INSERT INTO generation_progress (page_type, current_offset, total_count, status, updated_at) \
         VALUES (?, 0, 0, 'idle', ?) ON CONFLICT(page_type) DO NOTHING",
    )
    .bind(page_type.as_str())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_progress(pool: &Pool, page_type: PageType) -> Result<Option<GenerationProgress>> {
    let row = sqlx::query(&format!(
        "SELECT {PROGRESS_COLUMNS} FROM generation_progress WHERE page_type = ?"
    ))
    .bind(page_type.as_str())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(progress_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_progress(pool: &Pool) -> Result<Vec<GenerationProgress>> {
    let rows = sqlx::query(&format!(
        "SELECT {PROGRESS_COLUMNS} FROM generation_progress ORDER BY page_type"
    ))
    .fetch_all(pool)
    .await?;
    rows.iter().map(progress_from_row).collect()
}

/// Compare-and-set into `running`. Succeeds when the row is not running, or
/// when its last heartbeat is older than `stall_cutoff`. Returns whether this
/// caller now owns the row under `run_id`.
#[instrument(skip_all, fields(page_type = %page_type))]
pub async fn claim_progress(
    pool: &Pool,
    page_type: PageType,
    run_id: &str,
    now: DateTime<Utc>,
    stall_cutoff: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE generation_progress \
         SET status = 'running', run_id = ?, started_at = ?, completed_at = NULL, updated_at = ? \
         WHERE page_type = ? AND (status != 'running' OR updated_at < ?)",
    )
    .bind(run_id)
    .bind(now)
    .bind(now)
    .bind(page_type.as_str())
    .bind(stall_cutoff)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Rewind the cursor of a row this run already owns.
#[instrument(skip_all)]
pub async fn rewind_owned(pool: &Pool, page_type: PageType, run_id: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE generation_progress SET current_offset = 0, last_error = NULL, updated_at = ? \
         WHERE page_type = ? AND run_id = ?",
    )
    .bind(Utc::now())
    .bind(page_type.as_str())
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn set_total_owned(
    pool: &Pool,
    page_type: PageType,
    run_id: &str,
    total_count: u64,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE generation_progress SET total_count = ?, updated_at = ? \
         WHERE page_type = ? AND run_id = ?",
    )
    .bind(total_count as i64)
    .bind(Utc::now())
    .bind(page_type.as_str())
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Refresh the watchdog timestamp while the run still owns the row.
pub async fn heartbeat(pool: &Pool, page_type: PageType, run_id: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE generation_progress SET updated_at = ? WHERE page_type = ? AND run_id = ?",
    )
    .bind(Utc::now())
    .bind(page_type.as_str())
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Apply the final write of a run and release the claim. A run that lost its
/// claim (reset or stall takeover) matches no row and changes nothing.
#[instrument(skip_all, fields(page_type = %page_type))]
pub async fn finish_run(
    pool: &Pool,
    page_type: PageType,
    run_id: &str,
    outcome: &RunOutcome,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE generation_progress \
         SET current_offset = ?, status = ?, last_error = ?, completed_at = ?, run_id = NULL, updated_at = ? \
         WHERE page_type = ? AND run_id = ?",
    )
    .bind(outcome.current_offset as i64)
    .bind(outcome.status.as_str())
    .bind(outcome.last_error.as_deref())
    .bind(outcome.completed_at)
    .bind(Utc::now())
    .bind(page_type.as_str())
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Rewind one or all progress rows to idle/offset 0. Clearing `run_id` voids
/// any in-flight run's final write.
#[instrument(skip_all)]
pub async fn reset_progress(pool: &Pool, page_type: Option<PageType>) -> Result<u64> {
    const RESET: &str = "UPDATE generation_progress \
        SET current_offset = 0, total_count = 0, status = 'idle', last_error = NULL, \
            run_id = NULL, started_at = NULL, completed_at = NULL, updated_at = ?";
    let res = match page_type {
        Some(pt) => {
            sqlx::query(&format!("{RESET} WHERE page_type = ?"))
                .bind(Utc::now())
                .bind(pt.as_str())
                .execute(pool)
                .await?
        }
        None => sqlx::query(RESET).bind(Utc::now()).execute(pool).await?,
    };
    Ok(res.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup_pool() -> Pool {
        // Every connection to `sqlite::memory:` is its own database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn upsert<'a>(path: &'a str, key: &'a NaturalKey, html_ref: &'a str) -> EntryUpsert<'a> {
        EntryUpsert {
            path,
            page_type: PageType::City,
            natural_key: key,
            html_ref,
            content_hash: "abc",
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn sqlite_url_gets_create_mode() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        let td = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/x/db.sqlite", td.path().display());
        let out = prepare_sqlite_url(&url);
        assert!(out.ends_with("db.sqlite?mode=rwc"));
        assert!(td.path().join("x").exists());
    }

    #[tokio::test]
    async fn upsert_replaces_row_and_returns_previous_ref() {
        let pool = setup_pool().await;
        let key = NaturalKey::new("dubai/marina");

        let prev = upsert_entry(&pool, &upsert("/dubai/marina/", &key, "ref-1"))
            .await
            .unwrap();
        assert!(prev.is_none());

        mark_stale(&pool, &StaleTarget::Path("/dubai/marina/".into()))
            .await
            .unwrap();
        let prev = upsert_entry(&pool, &upsert("/dubai/marina/", &key, "ref-2"))
            .await
            .unwrap();
        assert_eq!(prev.as_deref(), Some("ref-1"));

        let entry = get_entry(&pool, "/dubai/marina/").await.unwrap().unwrap();
        assert_eq!(entry.html_ref, "ref-2");
        assert!(!entry.is_stale);
        assert_eq!(count_entries_by_type(&pool, PageType::City).await.unwrap(), 1);

        // Same handle again is not reported as replaced.
        let prev = upsert_entry(&pool, &upsert("/dubai/marina/", &key, "ref-2"))
            .await
            .unwrap();
        assert!(prev.is_none());
    }

    #[tokio::test]
    async fn reinsert_after_delete_reports_nothing_replaced() {
        let pool = setup_pool().await;
        let key = NaturalKey::new("dubai/marina");
        upsert_entry(&pool, &upsert("/dubai/marina/", &key, "ref-1"))
            .await
            .unwrap();
        upsert_entry(&pool, &upsert("/dubai/marina/", &key, "ref-2"))
            .await
            .unwrap();
        assert_eq!(
            delete_entries(&pool, PurgeScope::All).await.unwrap(),
            vec!["ref-2".to_string()]
        );

        // The deleted row's displaced handle must not leak into the new row.
        let prev = upsert_entry(&pool, &upsert("/dubai/marina/", &key, "ref-3"))
            .await
            .unwrap();
        assert!(prev.is_none());
    }

    #[tokio::test]
    async fn file_pool_sets_wal_and_busy_timeout() {
        let td = tempfile::tempdir().unwrap();
        let pool = init_pool(&format!("sqlite://{}/cache.db", td.path().display()))
            .await
            .unwrap();
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode, "wal");
        let timeout: i64 = sqlx::query_scalar("PRAGMA busy_timeout")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(timeout, BUSY_TIMEOUT.as_millis() as i64);
    }

    #[tokio::test]
    async fn delete_by_scope_returns_refs() {
        let pool = setup_pool().await;
        let a = NaturalKey::new("a/x");
        let b = NaturalKey::new("a/y");
        upsert_entry(&pool, &upsert("/a/x/", &a, "ref-a")).await.unwrap();
        upsert_entry(&pool, &upsert("/a/y/", &b, "ref-b")).await.unwrap();
        mark_stale(&pool, &StaleTarget::Key(PageType::City, b.clone()))
            .await
            .unwrap();
        assert_eq!(count_stale_entries(&pool).await.unwrap(), 1);

        let refs = delete_entries(&pool, PurgeScope::Stale).await.unwrap();
        assert_eq!(refs, vec!["ref-b".to_string()]);
        let refs = delete_entries(&pool, PurgeScope::PageType(PageType::State))
            .await
            .unwrap();
        assert!(refs.is_empty());
        let refs = delete_entries(&pool, PurgeScope::All).await.unwrap();
        assert_eq!(refs, vec!["ref-a".to_string()]);
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_released_or_stalled() {
        let pool = setup_pool().await;
        ensure_progress_row(&pool, PageType::Service).await.unwrap();
        let now = Utc::now();
        let cutoff = now - Duration::seconds(300);

        assert!(claim_progress(&pool, PageType::Service, "run-1", now, cutoff).await.unwrap());
        assert!(!claim_progress(&pool, PageType::Service, "run-2", now, cutoff).await.unwrap());

        // A cutoff in the future treats the current claim as stalled.
        let later = now + Duration::seconds(1);
        assert!(claim_progress(&pool, PageType::Service, "run-3", later, later + Duration::seconds(1))
            .await
            .unwrap());

        // The superseded run can no longer write.
        let outcome = RunOutcome {
            current_offset: 10,
            status: GenerationStatus::Idle,
            last_error: None,
            completed_at: None,
        };
        assert!(!finish_run(&pool, PageType::Service, "run-1", &outcome).await.unwrap());
        assert!(finish_run(&pool, PageType::Service, "run-3", &outcome).await.unwrap());

        let p = get_progress(&pool, PageType::Service).await.unwrap().unwrap();
        assert_eq!(p.current_offset, 10);
        assert_eq!(p.status, GenerationStatus::Idle);
    }

    #[tokio::test]
    async fn reset_voids_in_flight_run() {
        let pool = setup_pool().await;
        ensure_progress_row(&pool, PageType::City).await.unwrap();
        let now = Utc::now();
        assert!(claim_progress(&pool, PageType::City, "run-1", now, now - Duration::seconds(60))
            .await
            .unwrap());
        assert_eq!(reset_progress(&pool, Some(PageType::City)).await.unwrap(), 1);
        assert!(!heartbeat(&pool, PageType::City, "run-1").await.unwrap());

        let p = get_progress(&pool, PageType::City).await.unwrap().unwrap();
        assert_eq!(p.status, GenerationStatus::Idle);
        assert_eq!(p.current_offset, 0);
    }
}
