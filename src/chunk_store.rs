use std::io::{Read, Write};

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

pub const CHUNK_THRESHOLD: usize = 32 * 1024;
pub const CHUNK_SIZE: usize = 16 * 1024;
pub const COMPRESS_MIN: usize = 8 * 1024;
pub const CHUNK_REF_PREFIX: &str = "__CHUNKED__:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkContentType {
    Json,
    Text,
}

impl ChunkContentType {
    fn tag(self) -> &'static str {
        match self {
            ChunkContentType::Json => "json",
            ChunkContentType::Text => "text",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPriority {
    Never,
    Always,
    SizeBased,
}

#[derive(Debug, Clone)]
pub struct FieldChunkRule {
    pub priority: ChunkPriority,
    pub threshold: usize,
}

pub fn should_chunk(len: usize, rule: Option<&FieldChunkRule>) -> bool {
    match rule {
        Some(rule) => match rule.priority {
            ChunkPriority::Never => false,
            ChunkPriority::Always | ChunkPriority::SizeBased => len > rule.threshold,
        },
        None => len > CHUNK_THRESHOLD,
    }
}

pub fn ensure_chunk_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS content_chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            chunk_data TEXT NOT NULL,
            chunk_size INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(content_id, chunk_index)
        );
        CREATE TABLE IF NOT EXISTS chunk_metadata (
            content_id TEXT PRIMARY KEY,
            total_chunks INTEGER NOT NULL,
            original_size INTEGER NOT NULL,
            content_type TEXT NOT NULL,
            compressed INTEGER NOT NULL DEFAULT 0,
            encoding TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_content_chunks_lookup
            ON content_chunks(content_id, chunk_index);
        CREATE INDEX IF NOT EXISTS idx_chunk_metadata_size
            ON chunk_metadata(original_size);
        ",
    )
    .context("Failed to create chunk store tables")
}

/// Splits `content` into chunk rows and returns the opaque reference token.
/// All chunk rows and the metadata row are committed before the token is
/// handed back, so a stored token always resolves.
pub fn store(
    conn: &Connection,
    content: &str,
    content_type: ChunkContentType,
    compress: bool,
) -> Result<String> {
    let content_id = format!("chunk_{}", Uuid::new_v4().simple());
    let original_size = content.len();

    let (bytes, compressed) = if compress && original_size > COMPRESS_MIN {
        match gzip(content.as_bytes()) {
            Ok(packed) if packed.len() < original_size => (packed, true),
            _ => (content.as_bytes().to_vec(), false),
        }
    } else {
        (content.as_bytes().to_vec(), false)
    };

    let encoded = BASE64.encode(&bytes);
    let encoding = if compressed { "gzip+base64" } else { "base64" };
    let now = Utc::now().to_rfc3339();

    let tx = conn.unchecked_transaction()?;
    let mut total_chunks = 0i64;
    for (index, slice) in encoded.as_bytes().chunks(CHUNK_SIZE).enumerate() {
        let chunk = std::str::from_utf8(slice).expect("base64 output is ASCII");
        tx.execute(
            "INSERT INTO content_chunks(content_id, chunk_index, chunk_data, chunk_size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![content_id, index as i64, chunk, chunk.len() as i64, now],
        )?;
        total_chunks += 1;
    }

    tx.execute(
        "INSERT INTO chunk_metadata(content_id, total_chunks, original_size, content_type, compressed, encoding, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            content_id,
            total_chunks,
            original_size as i64,
            content_type.tag(),
            compressed as i64,
            encoding,
            now
        ],
    )?;
    tx.commit()?;

    Ok(format!("{CHUNK_REF_PREFIX}{content_id}"))
}

pub fn token_content_id(cell: &str) -> Option<&str> {
    cell.strip_prefix(CHUNK_REF_PREFIX)
}

/// Reassembles a chunked blob. `Ok(None)` means the metadata record is
/// missing; a chunk-count mismatch is an error.
pub fn retrieve(conn: &Connection, content_id: &str) -> Result<Option<String>> {
    let meta: Option<(i64, i64)> = conn
        .query_row(
            "SELECT total_chunks, compressed FROM chunk_metadata WHERE content_id = ?1",
            params![content_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((total_chunks, compressed)) = meta else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT chunk_data FROM content_chunks WHERE content_id = ?1 ORDER BY chunk_index",
    )?;
    let chunks: Vec<String> = stmt
        .query_map(params![content_id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    if chunks.len() as i64 != total_chunks {
        bail!(
            "corrupt chunk set for {content_id}: expected {total_chunks} chunks, found {}",
            chunks.len()
        );
    }

    let encoded: String = chunks.concat();
    let bytes = BASE64
        .decode(encoded.as_bytes())
        .with_context(|| format!("invalid chunk encoding for {content_id}"))?;

    let raw = if compressed != 0 {
        gunzip(&bytes).with_context(|| format!("failed to decompress {content_id}"))?
    } else {
        bytes
    };

    let text = String::from_utf8(raw)
        .with_context(|| format!("chunked content {content_id} is not UTF-8"))?;
    Ok(Some(text))
}

pub fn stats(conn: &Connection) -> Result<Value> {
    let (total_items, total_original, compressed_items): (i64, i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(original_size), 0), COALESCE(SUM(compressed), 0)
         FROM chunk_metadata",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    let (total_chunks, total_stored): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(chunk_size), 0) FROM content_chunks",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let meta_chunk_total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(total_chunks), 0) FROM chunk_metadata",
        [],
        |row| row.get(0),
    )?;

    let avg_original = if total_items > 0 {
        total_original as f64 / total_items as f64
    } else {
        0.0
    };
    let avg_chunk = if total_chunks > 0 {
        total_stored as f64 / total_chunks as f64
    } else {
        0.0
    };
    let compression_ratio = if total_original > 0 {
        total_stored as f64 / total_original as f64
    } else {
        0.0
    };

    Ok(json!({
        "metadata": {
            "total_chunked_items": total_items,
            "total_original_size": total_original,
            "avg_original_size": avg_original,
            "total_chunks": meta_chunk_total,
            "compressed_items": compressed_items,
        },
        "chunks": {
            "total_chunk_records": total_chunks,
            "total_stored_size": total_stored,
            "avg_chunk_size": avg_chunk,
        },
        "compression_ratio": compression_ratio,
    }))
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::{
        ensure_chunk_tables, retrieve, should_chunk, stats, store, token_content_id,
        ChunkContentType, ChunkPriority, FieldChunkRule, CHUNK_SIZE, CHUNK_THRESHOLD,
    };

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("in-memory db");
        ensure_chunk_tables(&conn).expect("chunk tables");
        conn
    }

    #[test]
    fn roundtrip_preserves_large_text_exactly() {
        let conn = test_conn();
        let content = "lorem ipsum dolor sit amet ".repeat(2_000);
        assert!(content.len() > CHUNK_THRESHOLD);

        let token = store(&conn, &content, ChunkContentType::Text, true).expect("store");
        let content_id = token_content_id(&token).expect("token prefix");
        let restored = retrieve(&conn, content_id).expect("retrieve").expect("present");

        assert_eq!(restored, content);
    }

    #[test]
    fn incompressible_content_falls_back_to_plain_storage() {
        let conn = test_conn();
        let content: String = (0..40_000u32)
            .map(|i| char::from_u32(33 + (i * 7919) % 90).unwrap())
            .collect();

        let token = store(&conn, &content, ChunkContentType::Text, true).expect("store");
        let content_id = token_content_id(&token).expect("token prefix");
        let restored = retrieve(&conn, content_id).expect("retrieve").expect("present");
        assert_eq!(restored, content);
    }

    #[test]
    fn chunk_rows_match_metadata() {
        let conn = test_conn();
        let content = "x".repeat(40_960);
        let token = store(&conn, &content, ChunkContentType::Text, false).expect("store");
        let content_id = token_content_id(&token).unwrap();

        let (total_chunks, original_size): (i64, i64) = conn
            .query_row(
                "SELECT total_chunks, original_size FROM chunk_metadata WHERE content_id = ?1",
                [content_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        let stored: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM content_chunks WHERE content_id = ?1",
                [content_id],
                |row| row.get(0),
            )
            .unwrap();

        assert_eq!(original_size, 40_960);
        assert_eq!(total_chunks, stored);
        // base64 expansion of 40960 bytes, sliced at 16 KiB
        let encoded_len = 40_960usize.div_ceil(3) * 4;
        assert_eq!(total_chunks as usize, encoded_len.div_ceil(CHUNK_SIZE));
    }

    #[test]
    fn missing_metadata_resolves_to_none() {
        let conn = test_conn();
        assert!(retrieve(&conn, "chunk_absent").expect("no error").is_none());
    }

    #[test]
    fn chunk_count_mismatch_is_an_error() {
        let conn = test_conn();
        let content = "y".repeat(40_960);
        let token = store(&conn, &content, ChunkContentType::Text, false).expect("store");
        let content_id = token_content_id(&token).unwrap().to_string();

        conn.execute(
            "DELETE FROM content_chunks WHERE content_id = ?1 AND chunk_index = 1",
            [&content_id],
        )
        .unwrap();

        let err = retrieve(&conn, &content_id).unwrap_err();
        assert!(err.to_string().contains("corrupt chunk set"));
    }

    #[test]
    fn field_rules_override_the_default_threshold() {
        assert!(!should_chunk(CHUNK_THRESHOLD, None));
        assert!(should_chunk(CHUNK_THRESHOLD + 1, None));

        let never = FieldChunkRule {
            priority: ChunkPriority::Never,
            threshold: 0,
        };
        assert!(!should_chunk(1_000_000, Some(&never)));

        let always = FieldChunkRule {
            priority: ChunkPriority::Always,
            threshold: 1_024,
        };
        assert!(should_chunk(2_048, Some(&always)));
        assert!(!should_chunk(512, Some(&always)));
    }

    #[test]
    fn stats_aggregate_metadata_and_chunks() {
        let conn = test_conn();
        store(&conn, &"a".repeat(40_960), ChunkContentType::Text, true).unwrap();
        store(&conn, &"b".repeat(50_000), ChunkContentType::Json, false).unwrap();

        let stats = stats(&conn).expect("stats");
        assert_eq!(stats["metadata"]["total_chunked_items"], 2);
        assert_eq!(stats["metadata"]["total_original_size"], 40_960 + 50_000);
        assert!(stats["chunks"]["total_chunk_records"].as_i64().unwrap() > 0);
    }
}
