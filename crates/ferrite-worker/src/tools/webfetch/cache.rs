use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::tools::webfetch::url_utils::normalize_fetch_url;

/// Disk-safe subdirectory name for a URL (first 16 hex of SHA-256).
fn safe_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// Cache keyed by normalized URL: SQLite index plus persisted
/// `raw.html` / `extracted.txt` / `meta.json` per entry. Writes are
/// idempotent and content-addressed; concurrent writers of one URL are
/// last-writer-wins.
pub struct WebFetchCache {
    cache_dir: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl WebFetchCache {
    pub fn open(cache_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(cache_dir)?;
        let conn = Connection::open(cache_dir.join("web_documents.db"))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS web_documents (
                normalized_url TEXT PRIMARY KEY,
                final_url TEXT NOT NULL,
                status_code INTEGER NOT NULL,
                content_type TEXT,
                raw_path TEXT NOT NULL,
                extracted_path TEXT NOT NULL,
                meta_path TEXT NOT NULL,
                stored_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Cache hit returns the canonical fetch shape with `cache_hit=true`
    /// and the artifact paths; a missing row or missing files is a miss.
    pub async fn get(&self, url: &str) -> Option<Value> {
        let norm = normalize_fetch_url(url);
        if norm.is_empty() {
            return None;
        }
        let row = {
            let conn = self.conn.lock().await;
            conn.query_row(
                "SELECT final_url, status_code, content_type, raw_path, extracted_path, meta_path
                 FROM web_documents WHERE normalized_url = ?1",
                params![norm],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .ok()
            .flatten()?
        };
        let (final_url, status_code, content_type, raw_path, extracted_path, meta_path) = row;
        let meta_raw = tokio::fs::read_to_string(&meta_path).await.ok()?;
        let text = tokio::fs::read_to_string(&extracted_path).await.ok()?;
        let meta: Value = serde_json::from_str(&meta_raw).ok()?;

        let mut out = json!({
            "url": norm,
            "final_url": final_url,
            "status_code": status_code,
            "content_type": content_type.unwrap_or_default(),
            "text": text,
            "extracted_text": text,
            "truncated": meta.get("truncated").and_then(|v| v.as_bool()).unwrap_or(false),
            "cache_hit": true,
            "artifact_paths": {
                "raw": raw_path,
                "extracted": extracted_path,
                "meta": meta_path,
            },
        });
        for key in ["title", "extraction_method", "paragraphs_count"] {
            if let Some(value) = meta.get(key) {
                out[key] = value.clone();
            }
        }
        Some(out)
    }

    /// Persist one fetch result: raw bytes, extracted text, meta, and the
    /// index row.
    pub async fn put(&self, url: &str, fetch: &Value, raw_bytes: &[u8]) -> anyhow::Result<()> {
        let norm = normalize_fetch_url(url);
        if norm.is_empty() {
            return Ok(());
        }
        let subdir = self.cache_dir.join(safe_key(&norm));
        tokio::fs::create_dir_all(&subdir).await?;
        let raw_path = subdir.join("raw.html");
        let extracted_path = subdir.join("extracted.txt");
        let meta_path = subdir.join("meta.json");

        tokio::fs::write(&raw_path, raw_bytes).await?;
        let text = fetch
            .get("text")
            .and_then(|v| v.as_str())
            .or_else(|| fetch.get("extracted_text").and_then(|v| v.as_str()))
            .unwrap_or("");
        tokio::fs::write(&extracted_path, text).await?;

        let mut sha = Sha256::new();
        sha.update(raw_bytes);
        let mut meta = json!({
            "url": norm,
            "normalized_url": norm,
            "final_url": fetch.get("final_url").and_then(|v| v.as_str()).unwrap_or(&norm),
            "status_code": fetch.get("status_code").and_then(|v| v.as_i64()).unwrap_or(0),
            "content_type": fetch.get("content_type").and_then(|v| v.as_str()).unwrap_or(""),
            "stored_at": chrono::Utc::now().timestamp().to_string(),
            "sha256": format!("{:x}", sha.finalize()),
            "truncated": fetch.get("truncated").and_then(|v| v.as_bool()).unwrap_or(false),
            "bytes_read": raw_bytes.len(),
            "cache_hit": false,
        });
        for key in ["title", "extraction_method", "paragraphs_count"] {
            if let Some(value) = fetch.get(key) {
                meta[key] = value.clone();
            }
        }
        tokio::fs::write(&meta_path, serde_json::to_vec(&meta)?).await?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO web_documents
             (normalized_url, final_url, status_code, content_type, raw_path, extracted_path, meta_path, stored_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                norm,
                meta["final_url"].as_str().unwrap_or(&norm),
                meta["status_code"].as_i64().unwrap_or(0),
                meta["content_type"].as_str().unwrap_or(""),
                raw_path.to_string_lossy(),
                extracted_path.to_string_lossy(),
                meta_path.to_string_lossy(),
                meta["stored_at"].as_str().unwrap_or(""),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_after_put_round_trips_with_cache_hit() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = WebFetchCache::open(tmp.path()).unwrap();
        let fetch = json!({
            "url": "https://a.com/p?utm_source=x&id=1",
            "final_url": "https://a.com/p?id=1",
            "status_code": 200,
            "content_type": "text/html",
            "text": "extracted body",
            "truncated": false,
            "title": "Page",
            "extraction_method": "readability",
            "paragraphs_count": 3,
        });
        cache
            .put("https://a.com/p?utm_source=x&id=1", &fetch, b"<html>raw</html>")
            .await
            .unwrap();

        // Lookup by a differently-tracked URL normalizing to the same key
        let hit = cache.get("https://a.com/p?id=1&fbclid=zzz").await.unwrap();
        assert_eq!(hit["cache_hit"], true);
        assert_eq!(hit["text"], "extracted body");
        assert_eq!(hit["title"], "Page");
        assert_eq!(hit["extraction_method"], "readability");
        let raw_path = hit["artifact_paths"]["raw"].as_str().unwrap();
        assert_eq!(std::fs::read_to_string(raw_path).unwrap(), "<html>raw</html>");
    }

    #[tokio::test]
    async fn missing_url_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = WebFetchCache::open(tmp.path()).unwrap();
        assert!(cache.get("https://nowhere.example/x").await.is_none());
    }

    #[tokio::test]
    async fn rewrite_is_last_writer_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = WebFetchCache::open(tmp.path()).unwrap();
        let first = json!({"url": "https://a.com/x", "status_code": 200, "content_type": "text/html", "text": "one", "truncated": false});
        let second = json!({"url": "https://a.com/x", "status_code": 200, "content_type": "text/html", "text": "two", "truncated": false});
        cache.put("https://a.com/x", &first, b"1").await.unwrap();
        cache.put("https://a.com/x", &second, b"2").await.unwrap();
        let hit = cache.get("https://a.com/x").await.unwrap();
        assert_eq!(hit["text"], "two");
    }
}
