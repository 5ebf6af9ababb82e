//! Review-comment storage consumed by the code-review surfaces.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::{Store, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewComment {
    pub id: i64,
    pub session_id: String,
    pub file: String,
    pub line: Option<u32>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
}

impl Store {
    pub fn add_review_comment(
        &self,
        session_id: &str,
        file: &str,
        line: Option<u32>,
        body: &str,
    ) -> Result<i64, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO review_comments (session_id, file, line, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                file,
                line.map(|l| l as i64),
                body,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_review_comments(
        &self,
        session_id: &str,
    ) -> Result<Vec<ReviewComment>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, file, line, body, created_at, resolved
             FROM review_comments WHERE session_id = ?1 ORDER BY id",
        )?;
        let comments = stmt
            .query_map(params![session_id], |row| {
                let raw: String = row.get(5)?;
                Ok(ReviewComment {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    file: row.get(2)?,
                    line: row.get::<_, Option<i64>>(3)?.map(|l| l as u32),
                    body: row.get(4)?,
                    created_at: raw
                        .parse::<DateTime<Utc>>()
                        .unwrap_or_else(|_| Utc::now()),
                    resolved: row.get::<_, i64>(6)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(comments)
    }

    pub fn resolve_review_comment(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE review_comments SET resolved = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(n > 0)
    }

    pub fn delete_review_comments_for_session(&self, session_id: &str) -> Result<usize, StoreError> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM review_comments WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_list() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .add_review_comment("s1", "src/main.rs", Some(42), "rename this")
            .unwrap();
        let comments = store.list_review_comments("s1").unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].id, id);
        assert_eq!(comments[0].line, Some(42));
        assert!(!comments[0].resolved);
    }

    #[test]
    fn test_resolve() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .add_review_comment("s1", "src/lib.rs", None, "missing docs")
            .unwrap();
        assert!(store.resolve_review_comment(id).unwrap());
        assert!(!store.resolve_review_comment(9999).unwrap());
        assert!(store.list_review_comments("s1").unwrap()[0].resolved);
    }

    #[test]
    fn test_delete_for_session() {
        let store = Store::open_in_memory().unwrap();
        store.add_review_comment("s1", "a.rs", None, "x").unwrap();
        store.add_review_comment("s1", "b.rs", None, "y").unwrap();
        store.add_review_comment("s2", "c.rs", None, "z").unwrap();
        assert_eq!(store.delete_review_comments_for_session("s1").unwrap(), 2);
        assert!(store.list_review_comments("s1").unwrap().is_empty());
        assert_eq!(store.list_review_comments("s2").unwrap().len(), 1);
    }
}
