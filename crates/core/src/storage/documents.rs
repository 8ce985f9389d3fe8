//! Cached document persistence.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension};

use super::connection::Store;
use super::{CachedDocument, DocumentStore};
use crate::Error;
use crate::document::RelationType;

/// Raw column values of a `documents` row before JSON decoding.
struct DocumentRow {
    url: String,
    object_json: String,
    headers_json: String,
    metadata_json: String,
    published: i64,
    received: i64,
    expires: i64,
    revalidates: i64,
    purge_after: i64,
}

impl DocumentRow {
    fn decode(self, urls: Vec<String>) -> Result<CachedDocument, Error> {
        let corrupt = |what: &str, e: serde_json::Error| Error::CorruptRecord(format!("{} {what}: {e}", self.url));

        let object: Value = serde_json::from_str(&self.object_json).map_err(|e| corrupt("object", e))?;
        let headers: BTreeMap<String, String> =
            serde_json::from_str(&self.headers_json).map_err(|e| corrupt("headers", e))?;
        let metadata: Map<String, Value> =
            serde_json::from_str(&self.metadata_json).map_err(|e| corrupt("metadata", e))?;

        Ok(CachedDocument {
            url: self.url,
            urls,
            object,
            headers,
            metadata,
            published: self.published,
            received: self.received,
            expires: self.expires,
            revalidates: self.revalidates,
            purge_after: self.purge_after,
        })
    }
}

#[async_trait]
impl DocumentStore for Store {
    async fn load_document(&self, url: &str) -> Result<Option<CachedDocument>, Error> {
        let url = url.to_string();
        self.conn
            .call(move |conn| -> Result<Option<CachedDocument>, Error> {
                let row = conn
                    .query_row(
                        "SELECT url, object_json, headers_json, metadata_json,
                                published, received, expires, revalidates, purge_after
                         FROM documents
                         WHERE url = COALESCE((SELECT url FROM document_urls WHERE alias = ?1), ?1)",
                        params![url],
                        |row| {
                            Ok(DocumentRow {
                                url: row.get(0)?,
                                object_json: row.get(1)?,
                                headers_json: row.get(2)?,
                                metadata_json: row.get(3)?,
                                published: row.get(4)?,
                                received: row.get(5)?,
                                expires: row.get(6)?,
                                revalidates: row.get(7)?,
                                purge_after: row.get(8)?,
                            })
                        },
                    )
                    .optional()?;

                let Some(row) = row else {
                    return Ok(None);
                };

                let mut stmt = conn.prepare("SELECT alias FROM document_urls WHERE url = ?1 ORDER BY alias")?;
                let urls = stmt
                    .query_map(params![row.url], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;

                row.decode(urls).map(Some)
            })
            .await
            .map_err(Error::from)
    }

    async fn save_document(&self, record: &CachedDocument) -> Result<(), Error> {
        let record = record.clone();
        let object_json = serde_json::to_string(&record.object)?;
        let headers_json = serde_json::to_string(&record.headers)?;
        let metadata_json = serde_json::to_string(&record.metadata)?;
        let relation_type = record.relation_type().map(|kind| kind.as_str());
        let relation_href = record.relation_href().map(str::to_string);

        self.conn
            .call(move |conn| -> Result<(), Error> {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO documents (
                        url, object_json, headers_json, metadata_json, relation_type, relation_href,
                        published, received, expires, revalidates, purge_after
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                    ON CONFLICT(url) DO UPDATE SET
                        object_json = excluded.object_json,
                        headers_json = excluded.headers_json,
                        metadata_json = excluded.metadata_json,
                        relation_type = excluded.relation_type,
                        relation_href = excluded.relation_href,
                        published = excluded.published,
                        received = excluded.received,
                        expires = excluded.expires,
                        revalidates = excluded.revalidates,
                        purge_after = excluded.purge_after",
                    params![
                        &record.url,
                        object_json,
                        headers_json,
                        metadata_json,
                        relation_type,
                        relation_href,
                        record.published,
                        record.received,
                        record.expires,
                        record.revalidates,
                        record.purge_after,
                    ],
                )?;

                let aliases = std::iter::once(&record.url).chain(record.urls.iter());
                for alias in aliases {
                    tx.execute(
                        "INSERT INTO document_urls (alias, url) VALUES (?1, ?2)
                         ON CONFLICT(alias) DO UPDATE SET url = excluded.url",
                        params![alias, &record.url],
                    )?;
                }

                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    async fn count_relations(&self, kind: RelationType, href: &str) -> Result<u64, Error> {
        let href = href.to_string();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM documents WHERE relation_type = ?1 AND relation_href = ?2",
                    params![kind.as_str(), href],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    async fn purge_documents(&self, now: i64) -> Result<u64, Error> {
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute("DELETE FROM documents WHERE purge_after < ?1", params![now])?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }
}
