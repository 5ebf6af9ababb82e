//! External-PR mirror. `set_prs` is a full replace fed by the poller, but
//! per-PR muted state and interaction history (`last_seen_*`) belong to
//! the user and survive every batch.

use attn_protocol::types::PrInfo;
use chrono::{DateTime, Utc};
use rusqlite::{Row, params};

use crate::{Store, StoreError};

fn row_to_pr(row: &Row<'_>) -> rusqlite::Result<PrInfo> {
    let updated_raw: String = row.get("updated_at")?;
    let head_sha: String = row.get("head_sha")?;
    let ci_status: Option<String> = row.get("ci_status")?;
    let comment_count: i64 = row.get("comment_count")?;
    let last_seen_head: Option<String> = row.get("last_seen_head_sha")?;
    let last_seen_comments: Option<i64> = row.get("last_seen_comment_count")?;
    let last_seen_ci: Option<String> = row.get("last_seen_ci_status")?;

    // A PR is "new" until the user has seen its current head, comment
    // count, and CI verdict.
    let has_new_changes = match (&last_seen_head, last_seen_comments) {
        (Some(seen_head), Some(seen_comments)) => {
            *seen_head != head_sha
                || comment_count > seen_comments
                || last_seen_ci != ci_status
        }
        _ => true,
    };

    Ok(PrInfo {
        id: row.get("id")?,
        repo: row.get("repo")?,
        number: row.get::<_, i64>("number")? as u64,
        title: row.get("title")?,
        author: row.get("author")?,
        url: row.get("url")?,
        head_sha,
        ci_status,
        comment_count: comment_count as u64,
        state: row.get("state")?,
        updated_at: updated_raw
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
        muted: row.get::<_, i64>("muted")? != 0,
        has_new_changes,
    })
}

impl Store {
    /// Replace the PR mirror with a fresh poll batch.
    ///
    /// Preserves per-PR muted state and `last_seen_*` interaction history,
    /// and keeps existing detail fields when the batch carries blanks
    /// (list endpoints are sparser than detail fetches).
    pub fn set_prs(&self, prs: &[PrInfo]) -> Result<(), StoreError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        {
            let ids: Vec<&str> = prs.iter().map(|p| p.id.as_str()).collect();
            // Drop rows absent from the batch (closed/merged PRs).
            let mut stmt = tx.prepare("SELECT id FROM prs")?;
            let existing = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            for id in existing {
                if !ids.contains(&id.as_str()) {
                    tx.execute("DELETE FROM prs WHERE id = ?1", params![id])?;
                }
            }
        }
        for pr in prs {
            tx.execute(
                "INSERT INTO prs (
                    id, repo, number, title, author, url, head_sha, ci_status,
                    comment_count, state, updated_at, muted
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)
                ON CONFLICT(id) DO UPDATE SET
                    repo = excluded.repo,
                    number = excluded.number,
                    title = CASE WHEN excluded.title <> '' THEN excluded.title ELSE prs.title END,
                    author = CASE WHEN excluded.author <> '' THEN excluded.author ELSE prs.author END,
                    url = CASE WHEN excluded.url <> '' THEN excluded.url ELSE prs.url END,
                    head_sha = excluded.head_sha,
                    ci_status = COALESCE(excluded.ci_status, prs.ci_status),
                    comment_count = excluded.comment_count,
                    state = excluded.state,
                    updated_at = excluded.updated_at",
                params![
                    pr.id,
                    pr.repo,
                    pr.number as i64,
                    pr.title,
                    pr.author,
                    pr.url,
                    pr.head_sha,
                    pr.ci_status,
                    pr.comment_count as i64,
                    pr.state,
                    pr.updated_at.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_prs(&self) -> Result<Vec<PrInfo>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM prs ORDER BY updated_at DESC")?;
        let prs = stmt
            .query_map([], row_to_pr)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(prs)
    }

    pub fn set_pr_muted(&self, id: &str, muted: bool) -> Result<bool, StoreError> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE prs SET muted = ?2 WHERE id = ?1",
            params![id, muted as i64],
        )?;
        Ok(n > 0)
    }

    /// Record the current head/comment/CI values as seen by the user.
    pub fn mark_pr_seen(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE prs SET
                last_seen_head_sha = head_sha,
                last_seen_comment_count = comment_count,
                last_seen_ci_status = ci_status
            WHERE id = ?1",
            params![id],
        )?;
        Ok(n > 0)
    }

    pub fn set_repo_muted(&self, repo: &str, muted: bool) -> Result<(), StoreError> {
        let conn = self.lock();
        if muted {
            conn.execute(
                "INSERT OR IGNORE INTO repo_mutes (repo) VALUES (?1)",
                params![repo],
            )?;
        } else {
            conn.execute("DELETE FROM repo_mutes WHERE repo = ?1", params![repo])?;
        }
        Ok(())
    }

    pub fn set_author_muted(&self, author: &str, muted: bool) -> Result<(), StoreError> {
        let conn = self.lock();
        if muted {
            conn.execute(
                "INSERT OR IGNORE INTO author_mutes (author) VALUES (?1)",
                params![author],
            )?;
        } else {
            conn.execute(
                "DELETE FROM author_mutes WHERE author = ?1",
                params![author],
            )?;
        }
        Ok(())
    }

    pub fn list_repo_mutes(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT repo FROM repo_mutes ORDER BY repo")?;
        let repos = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(repos)
    }

    pub fn list_author_mutes(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT author FROM author_mutes ORDER BY author")?;
        let authors = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(authors)
    }
}
