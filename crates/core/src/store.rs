//! Persistence contract (§4.5 / C5): a typed schema over a single `rusqlite`
//! connection opened once per process (spec.md §9), covering files, tokens,
//! postings, blocks, line-map, line-cache, co-occurrence, centroids,
//! feedback, and meta.

use crate::error::{Result, XerpError};
use crate::model::{Block, BlockKind, FileRecord, FileType, Posting, TokenKind, TokenRecord};
use crate::varint;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

pub struct Store {
    conn: Connection,
}

const SCHEMA_VERSION: i64 = 1;

impl Store {
    /// Opens (creating if absent) the store at `path`, running migrations.
    /// The connection is held for the lifetime of the `Store` and closed on
    /// drop — the single long-lived handle the design notes call for.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| XerpError::Input(format!("creating {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Store { conn };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store, used by tests that don't need file persistence.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);

            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY,
                rel_path TEXT NOT NULL UNIQUE,
                file_type TEXT NOT NULL,
                mtime INTEGER NOT NULL,
                size INTEGER NOT NULL,
                line_count INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                indexed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tokens (
                id INTEGER PRIMARY KEY,
                text TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                df INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS postings (
                token_id INTEGER NOT NULL REFERENCES tokens(id),
                file_id INTEGER NOT NULL REFERENCES files(id),
                tf INTEGER NOT NULL,
                lines_blob BLOB NOT NULL,
                PRIMARY KEY (token_id, file_id)
            );
            CREATE INDEX IF NOT EXISTS postings_by_file ON postings(file_id);

            CREATE TABLE IF NOT EXISTS blocks (
                id INTEGER PRIMARY KEY,
                file_id INTEGER NOT NULL REFERENCES files(id),
                kind TEXT NOT NULL,
                level INTEGER NOT NULL,
                line_start INTEGER NOT NULL,
                line_end INTEGER NOT NULL,
                parent_block_id INTEGER,
                content_hash TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                header_text TEXT NOT NULL,
                footer_text TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS blocks_by_file ON blocks(file_id);

            CREATE TABLE IF NOT EXISTS line_maps (
                file_id INTEGER PRIMARY KEY REFERENCES files(id),
                blob BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS line_cache (
                file_id INTEGER NOT NULL REFERENCES files(id),
                line_num INTEGER NOT NULL,
                text TEXT NOT NULL,
                PRIMARY KEY (file_id, line_num)
            );

            CREATE TABLE IF NOT EXISTS cooccurrence (
                model_id TEXT NOT NULL,
                token_a INTEGER NOT NULL,
                token_b INTEGER NOT NULL,
                count INTEGER NOT NULL,
                PRIMARY KEY (model_id, token_a, token_b)
            );

            CREATE TABLE IF NOT EXISTS token_vector_norm (
                model_id TEXT NOT NULL,
                token_id INTEGER NOT NULL,
                norm REAL NOT NULL,
                PRIMARY KEY (model_id, token_id)
            );

            CREATE TABLE IF NOT EXISTS token_vectors (
                model_id TEXT NOT NULL,
                token_id INTEGER NOT NULL,
                vector BLOB NOT NULL,
                PRIMARY KEY (model_id, token_id)
            );

            CREATE TABLE IF NOT EXISTS block_centroids (
                block_id INTEGER PRIMARY KEY REFERENCES blocks(id),
                vector BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS feedback_events (
                id INTEGER PRIMARY KEY,
                result_id TEXT NOT NULL,
                score REAL NOT NULL,
                note TEXT,
                file_id INTEGER,
                line_start INTEGER,
                line_end INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS feedback_stats (
                result_id TEXT PRIMARY KEY,
                aggregate REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS feedback_token_stats (
                token_id INTEGER PRIMARY KEY REFERENCES tokens(id),
                useful REAL NOT NULL DEFAULT 0,
                not_useful REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS result_locations (
                result_id TEXT PRIMARY KEY,
                file_id INTEGER NOT NULL REFERENCES files(id),
                line_start INTEGER NOT NULL,
                line_end INTEGER NOT NULL
            );
            "#,
        )?;
        self.set_meta("schema_version", &SCHEMA_VERSION.to_string())?;
        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn transaction(&mut self) -> Result<rusqlite::Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }

    // -- meta -----------------------------------------------------------

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO meta(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?)
    }

    // -- files ------------------------------------------------------------

    pub fn get_file_by_path(conn: &Connection, rel_path: &str) -> Result<Option<FileRecord>> {
        conn.query_row(
            "SELECT id, rel_path, file_type, mtime, size, line_count, content_hash, indexed_at
             FROM files WHERE rel_path = ?1",
            params![rel_path],
            row_to_file,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_file_by_id(conn: &Connection, file_id: i64) -> Result<Option<FileRecord>> {
        conn.query_row(
            "SELECT id, rel_path, file_type, mtime, size, line_count, content_hash, indexed_at
             FROM files WHERE id = ?1",
            params![file_id],
            row_to_file,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn upsert_file(
        conn: &Connection,
        rel_path: &str,
        file_type: FileType,
        mtime: i64,
        size: u64,
        line_count: u32,
        content_hash: &str,
        indexed_at: &str,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO files(rel_path, file_type, mtime, size, line_count, content_hash, indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(rel_path) DO UPDATE SET
                file_type = excluded.file_type, mtime = excluded.mtime, size = excluded.size,
                line_count = excluded.line_count, content_hash = excluded.content_hash,
                indexed_at = excluded.indexed_at",
            params![rel_path, file_type.as_str(), mtime, size as i64, line_count, content_hash, indexed_at],
        )?;
        let id: i64 = conn.query_row("SELECT id FROM files WHERE rel_path = ?1", params![rel_path], |r| r.get(0))?;
        Ok(id)
    }

    pub fn list_all_rel_paths(&self) -> Result<Vec<(i64, String)>> {
        let mut stmt = self.conn.prepare("SELECT id, rel_path FROM files")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn delete_file(conn: &Connection, file_id: i64) -> Result<()> {
        conn.execute("DELETE FROM postings WHERE file_id = ?1", params![file_id])?;
        conn.execute("DELETE FROM blocks WHERE file_id = ?1", params![file_id])?;
        conn.execute("DELETE FROM line_maps WHERE file_id = ?1", params![file_id])?;
        conn.execute("DELETE FROM line_cache WHERE file_id = ?1", params![file_id])?;
        conn.execute("DELETE FROM files WHERE id = ?1", params![file_id])?;
        Ok(())
    }

    /// Clears everything derived from a file's previous indexing pass
    /// (postings, blocks, line-map, line-cache) without deleting the file
    /// row itself — used before re-indexing a changed file.
    pub fn clear_file_derived(conn: &Connection, file_id: i64) -> Result<()> {
        conn.execute("DELETE FROM postings WHERE file_id = ?1", params![file_id])?;
        conn.execute("DELETE FROM blocks WHERE file_id = ?1", params![file_id])?;
        conn.execute("DELETE FROM line_maps WHERE file_id = ?1", params![file_id])?;
        conn.execute("DELETE FROM line_cache WHERE file_id = ?1", params![file_id])?;
        Ok(())
    }

    // -- tokens -------------------------------------------------------------

    pub fn upsert_token(conn: &Connection, text: &str, kind: TokenKind) -> Result<i64> {
        conn.execute(
            "INSERT INTO tokens(text, kind, df) VALUES (?1, ?2, 0)
             ON CONFLICT(text) DO NOTHING",
            params![text, kind.as_str()],
        )?;
        let (id, existing_kind): (i64, String) =
            conn.query_row("SELECT id, kind FROM tokens WHERE text = ?1", params![text], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })?;
        let existing = TokenKind::from_str(&existing_kind).unwrap_or(TokenKind::Op);
        let upgraded = existing.upgrade(kind);
        if upgraded != existing {
            conn.execute("UPDATE tokens SET kind = ?1 WHERE id = ?2", params![upgraded.as_str(), id])?;
        }
        Ok(id)
    }

    pub fn get_token_by_text(conn: &Connection, text: &str) -> Result<Option<TokenRecord>> {
        conn.query_row(
            "SELECT id, text, kind, df FROM tokens WHERE text = ?1",
            params![text],
            row_to_token,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_token_by_id(conn: &Connection, id: i64) -> Result<Option<TokenRecord>> {
        conn.query_row("SELECT id, text, kind, df FROM tokens WHERE id = ?1", params![id], row_to_token)
            .optional()
            .map_err(Into::into)
    }

    pub fn recompute_df(conn: &Connection, token_ids: &[i64]) -> Result<()> {
        for &token_id in token_ids {
            let df: i64 =
                conn.query_row("SELECT COUNT(*) FROM postings WHERE token_id = ?1", params![token_id], |r| {
                    r.get(0)
                })?;
            conn.execute("UPDATE tokens SET df = ?1 WHERE id = ?2", params![df, token_id])?;
        }
        Ok(())
    }

    pub fn sweep_orphaned_tokens(conn: &Connection) -> Result<usize> {
        let n = conn.execute("DELETE FROM tokens WHERE df = 0", [])?;
        Ok(n)
    }

    pub fn file_count(&self) -> Result<u32> {
        Ok(self.conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?)
    }

    // -- postings -----------------------------------------------------------

    pub fn upsert_posting(conn: &Connection, token_id: i64, file_id: i64, lines: &[u32]) -> Result<()> {
        let blob = varint::encode_delta_u32_list(lines);
        conn.execute(
            "INSERT INTO postings(token_id, file_id, tf, lines_blob) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(token_id, file_id) DO UPDATE SET tf = excluded.tf, lines_blob = excluded.lines_blob",
            params![token_id, file_id, lines.len() as i64, blob],
        )?;
        Ok(())
    }

    pub fn get_posting(conn: &Connection, token_id: i64, file_id: i64) -> Result<Option<Posting>> {
        conn.query_row(
            "SELECT token_id, file_id, tf, lines_blob FROM postings WHERE token_id = ?1 AND file_id = ?2",
            params![token_id, file_id],
            row_to_posting,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn postings_for_token(conn: &Connection, token_id: i64) -> Result<Vec<Posting>> {
        let mut stmt = conn.prepare(
            "SELECT token_id, file_id, tf, lines_blob FROM postings WHERE token_id = ?1",
        )?;
        let rows = stmt.query_map(params![token_id], row_to_posting)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn postings_for_file(conn: &Connection, file_id: i64) -> Result<Vec<Posting>> {
        let mut stmt = conn.prepare(
            "SELECT token_id, file_id, tf, lines_blob FROM postings WHERE file_id = ?1",
        )?;
        let rows = stmt.query_map(params![file_id], row_to_posting)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    // -- blocks ---------------------------------------------------------

    /// Inserts a file's blocks, materializing real parent ids from the
    /// flat-index parent references produced by the adapter (spec.md §9).
    pub fn insert_blocks(
        conn: &Connection,
        file_id: i64,
        drafts: &[crate::adapters::BlockDraft],
        content_hashes: &[String],
        token_counts: &[u32],
        footer_texts: &[String],
    ) -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(drafts.len());
        for (i, draft) in drafts.iter().enumerate() {
            conn.execute(
                "INSERT INTO blocks(file_id, kind, level, line_start, line_end, parent_block_id,
                    content_hash, token_count, header_text, footer_text)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7, ?8, ?9)",
                params![
                    file_id,
                    draft.kind.as_str(),
                    draft.level,
                    draft.line_start,
                    draft.line_end,
                    content_hashes[i],
                    token_counts[i],
                    draft.header_text,
                    footer_texts[i],
                ],
            )?;
            ids.push(conn.last_insert_rowid());
        }
        for (i, draft) in drafts.iter().enumerate() {
            if let Some(parent_idx) = draft.parent {
                conn.execute(
                    "UPDATE blocks SET parent_block_id = ?1 WHERE id = ?2",
                    params![ids[parent_idx], ids[i]],
                )?;
            }
        }
        Ok(ids)
    }

    pub fn get_block(conn: &Connection, id: i64) -> Result<Option<Block>> {
        conn.query_row(
            "SELECT id, file_id, kind, level, line_start, line_end, parent_block_id, content_hash,
                token_count, header_text, footer_text FROM blocks WHERE id = ?1",
            params![id],
            row_to_block,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_children(conn: &Connection, block_id: i64) -> Result<Vec<Block>> {
        let mut stmt = conn.prepare(
            "SELECT id, file_id, kind, level, line_start, line_end, parent_block_id, content_hash,
                token_count, header_text, footer_text FROM blocks WHERE parent_block_id = ?1 ORDER BY line_start",
        )?;
        let rows = stmt.query_map(params![block_id], row_to_block)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn blocks_for_file(conn: &Connection, file_id: i64) -> Result<Vec<Block>> {
        let mut stmt = conn.prepare(
            "SELECT id, file_id, kind, level, line_start, line_end, parent_block_id, content_hash,
                token_count, header_text, footer_text FROM blocks WHERE file_id = ?1 ORDER BY line_start",
        )?;
        let rows = stmt.query_map(params![file_id], row_to_block)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Walks the parent chain from `block_id` up to (but not including) the
    /// root, returning ancestors nearest-first.
    pub fn ancestors(conn: &Connection, block_id: i64) -> Result<Vec<Block>> {
        let mut out = Vec::new();
        let mut current = Store::get_block(conn, block_id)?;
        while let Some(block) = current {
            match block.parent_block_id {
                Some(parent_id) => {
                    let parent = Store::get_block(conn, parent_id)?;
                    if let Some(ref p) = parent {
                        out.push(p.clone());
                    }
                    current = parent;
                }
                None => break,
            }
        }
        Ok(out)
    }

    pub fn update_token_count(conn: &Connection, block_id: i64, count: u32) -> Result<()> {
        conn.execute("UPDATE blocks SET token_count = ?1 WHERE id = ?2", params![count, block_id])?;
        Ok(())
    }

    // -- line map / line cache -------------------------------------------

    pub fn write_line_map(conn: &Connection, file_id: i64, block_ids: &[i64]) -> Result<()> {
        let as_u32: Vec<u32> = block_ids.iter().map(|&id| id as u32).collect();
        let blob = varint::encode_u32_list(&as_u32);
        conn.execute(
            "INSERT INTO line_maps(file_id, blob) VALUES (?1, ?2)
             ON CONFLICT(file_id) DO UPDATE SET blob = excluded.blob",
            params![file_id, blob],
        )?;
        Ok(())
    }

    pub fn read_line_map(conn: &Connection, file_id: i64) -> Result<Vec<i64>> {
        let blob: Option<Vec<u8>> = conn
            .query_row("SELECT blob FROM line_maps WHERE file_id = ?1", params![file_id], |r| r.get(0))
            .optional()?;
        Ok(blob.map(|b| varint::decode_u32_list(&b).into_iter().map(|v| v as i64).collect()).unwrap_or_default())
    }

    pub fn write_line_cache(conn: &Connection, file_id: i64, line_num: u32, text: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO line_cache(file_id, line_num, text) VALUES (?1, ?2, ?3)
             ON CONFLICT(file_id, line_num) DO UPDATE SET text = excluded.text",
            params![file_id, line_num, text],
        )?;
        Ok(())
    }

    pub fn read_line_cache(conn: &Connection, file_id: i64, line_num: u32) -> Result<Option<String>> {
        Ok(conn
            .query_row(
                "SELECT text FROM line_cache WHERE file_id = ?1 AND line_num = ?2",
                params![file_id, line_num],
                |r| r.get(0),
            )
            .optional()?)
    }

    // -- co-occurrence / vectors -----------------------------------------

    pub fn clear_model(conn: &Connection, model_id: &str) -> Result<()> {
        conn.execute("DELETE FROM cooccurrence WHERE model_id = ?1", params![model_id])?;
        conn.execute("DELETE FROM token_vector_norm WHERE model_id = ?1", params![model_id])?;
        conn.execute("DELETE FROM token_vectors WHERE model_id = ?1", params![model_id])?;
        Ok(())
    }

    pub fn clear_centroids(conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM block_centroids", [])?;
        Ok(())
    }

    pub fn upsert_cooccurrence(conn: &Connection, model_id: &str, token_a: i64, token_b: i64, count: u32) -> Result<()> {
        conn.execute(
            "INSERT INTO cooccurrence(model_id, token_a, token_b, count) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(model_id, token_a, token_b) DO UPDATE SET count = count + excluded.count",
            params![model_id, token_a, token_b, count],
        )?;
        Ok(())
    }

    pub fn cooccurrences_for_token(conn: &Connection, model_id: &str, token_id: i64) -> Result<Vec<(i64, u32)>> {
        let mut stmt = conn.prepare(
            "SELECT token_b, count FROM cooccurrence WHERE model_id = ?1 AND token_a = ?2
             UNION
             SELECT token_a, count FROM cooccurrence WHERE model_id = ?1 AND token_b = ?2",
        )?;
        let rows = stmt.query_map(params![model_id, token_id], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn write_token_vector(conn: &Connection, model_id: &str, token_id: i64, vector: &[f32], norm: f64) -> Result<()> {
        let blob = vector_to_blob(vector);
        conn.execute(
            "INSERT INTO token_vectors(model_id, token_id, vector) VALUES (?1, ?2, ?3)
             ON CONFLICT(model_id, token_id) DO UPDATE SET vector = excluded.vector",
            params![model_id, token_id, blob],
        )?;
        conn.execute(
            "INSERT INTO token_vector_norm(model_id, token_id, norm) VALUES (?1, ?2, ?3)
             ON CONFLICT(model_id, token_id) DO UPDATE SET norm = excluded.norm",
            params![model_id, token_id, norm],
        )?;
        Ok(())
    }

    pub fn read_token_vector(conn: &Connection, model_id: &str, token_id: i64) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT vector FROM token_vectors WHERE model_id = ?1 AND token_id = ?2",
                params![model_id, token_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(blob.map(|b| blob_to_vector(&b)))
    }

    pub fn all_token_vectors(conn: &Connection, model_id: &str) -> Result<Vec<(i64, Vec<f32>)>> {
        let mut stmt = conn.prepare("SELECT token_id, vector FROM token_vectors WHERE model_id = ?1")?;
        let rows = stmt.query_map(params![model_id], |r| {
            let id: i64 = r.get(0)?;
            let blob: Vec<u8> = r.get(1)?;
            Ok((id, blob))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, blob) = row?;
            out.push((id, blob_to_vector(&blob)));
        }
        Ok(out)
    }

    pub fn write_centroid(conn: &Connection, block_id: i64, vector: &[f32]) -> Result<()> {
        let blob = vector_to_blob(vector);
        conn.execute(
            "INSERT INTO block_centroids(block_id, vector) VALUES (?1, ?2)
             ON CONFLICT(block_id) DO UPDATE SET vector = excluded.vector",
            params![block_id, blob],
        )?;
        Ok(())
    }

    pub fn read_centroid(conn: &Connection, block_id: i64) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> = conn
            .query_row("SELECT vector FROM block_centroids WHERE block_id = ?1", params![block_id], |r| r.get(0))
            .optional()?;
        Ok(blob.map(|b| blob_to_vector(&b)))
    }

    pub fn all_centroids(conn: &Connection) -> Result<Vec<(i64, Vec<f32>)>> {
        let mut stmt = conn.prepare("SELECT block_id, vector FROM block_centroids")?;
        let rows = stmt.query_map([], |r| {
            let id: i64 = r.get(0)?;
            let blob: Vec<u8> = r.get(1)?;
            Ok((id, blob))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, blob) = row?;
            out.push((id, blob_to_vector(&blob)));
        }
        Ok(out)
    }

    // -- feedback ---------------------------------------------------------

    pub fn insert_feedback_event(
        conn: &Connection,
        result_id: &str,
        score: f64,
        note: Option<&str>,
        file_id: Option<i64>,
        line_start: Option<u32>,
        line_end: Option<u32>,
        created_at: &str,
    ) -> Result<i64> {
        conn.execute(
            "INSERT INTO feedback_events(result_id, score, note, file_id, line_start, line_end, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![result_id, score, note, file_id, line_start, line_end, created_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn accumulate_result_feedback(conn: &Connection, result_id: &str, score: f64) -> Result<()> {
        conn.execute(
            "INSERT INTO feedback_stats(result_id, aggregate) VALUES (?1, ?2)
             ON CONFLICT(result_id) DO UPDATE SET aggregate = aggregate + excluded.aggregate",
            params![result_id, score],
        )?;
        Ok(())
    }

    pub fn result_feedback(conn: &Connection, result_id: &str) -> Result<f64> {
        Ok(conn
            .query_row(
                "SELECT aggregate FROM feedback_stats WHERE result_id = ?1",
                params![result_id],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(0.0))
    }

    pub fn accumulate_token_feedback(conn: &Connection, token_id: i64, score: f64) -> Result<()> {
        let (useful, not_useful) = if score >= 0.0 { (score, 0.0) } else { (0.0, -score) };
        conn.execute(
            "INSERT INTO feedback_token_stats(token_id, useful, not_useful) VALUES (?1, ?2, ?3)
             ON CONFLICT(token_id) DO UPDATE SET
                useful = useful + excluded.useful, not_useful = not_useful + excluded.not_useful",
            params![token_id, useful, not_useful],
        )?;
        Ok(())
    }

    pub fn token_feedback(conn: &Connection, token_id: i64) -> Result<(f64, f64)> {
        Ok(conn
            .query_row(
                "SELECT useful, not_useful FROM feedback_token_stats WHERE token_id = ?1",
                params![token_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
            .unwrap_or((0.0, 0.0)))
    }

    /// Remembers where a `result_id` pointed at query time, so a later
    /// `mark` invocation (a fresh process, with only the id on its command
    /// line) can recover the file/line-range needed for per-token feedback
    /// accumulation (§4.7).
    pub fn write_result_location(conn: &Connection, result_id: &str, file_id: i64, line_start: u32, line_end: u32) -> Result<()> {
        conn.execute(
            "INSERT INTO result_locations(result_id, file_id, line_start, line_end) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(result_id) DO UPDATE SET file_id = excluded.file_id,
                line_start = excluded.line_start, line_end = excluded.line_end",
            params![result_id, file_id, line_start, line_end],
        )?;
        Ok(())
    }

    pub fn read_result_location(conn: &Connection, result_id: &str) -> Result<Option<(i64, u32, u32)>> {
        Ok(conn
            .query_row(
                "SELECT file_id, line_start, line_end FROM result_locations WHERE result_id = ?1",
                params![result_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?)
    }

    /// Wipes every file, its derived rows, and the trained vectors/centroids,
    /// leaving an empty schema in place — backs the CLI `index --rebuild`
    /// flag so a full reindex starts from nothing rather than relying on the
    /// incremental `(mtime, content_hash)` comparison.
    pub fn rebuild_all(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM postings;
             DELETE FROM blocks;
             DELETE FROM line_maps;
             DELETE FROM line_cache;
             DELETE FROM files;
             DELETE FROM tokens;
             DELETE FROM cooccurrence;
             DELETE FROM token_vector_norm;
             DELETE FROM token_vectors;
             DELETE FROM block_centroids;
             DELETE FROM result_locations;",
        )?;
        Ok(())
    }

    /// Learned header keywords for the AlgolAdapter's sibling-split tier:
    /// tokens appearing on a block's first or last line at ratio >= 3% with
    /// at least 5 occurrences (§4.3).
    pub fn learned_header_keywords(conn: &Connection) -> Result<std::collections::HashSet<String>> {
        let total_blocks: i64 = conn.query_row("SELECT COUNT(*) FROM blocks", [], |r| r.get(0))?;
        if total_blocks == 0 {
            return Ok(std::collections::HashSet::new());
        }
        let mut stmt = conn.prepare(
            "SELECT header_text, footer_text FROM blocks WHERE header_text != '' OR footer_text != ''",
        )?;
        let lines: Vec<(String, String)> =
            stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?.collect::<std::result::Result<_, _>>()?;
        let mut counts: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        for (header, footer) in &lines {
            // Single-line blocks have header == footer; count that block once.
            let distinct_lines = if header == footer { vec![header] } else { vec![header, footer] };
            for line in distinct_lines {
                if let Some(word) = line.trim().split_whitespace().next() {
                    let cleaned: String = word.chars().filter(|c| c.is_alphanumeric() || *c == '_').collect();
                    if !cleaned.is_empty() {
                        *counts.entry(cleaned.to_lowercase()).or_default() += 1;
                    }
                }
            }
        }
        let threshold = ((total_blocks as f64) * 0.03).max(5.0);
        Ok(counts.into_iter().filter(|(_, count)| *count as f64 >= threshold).map(|(w, _)| w).collect())
    }
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for &v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
}

fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<FileRecord> {
    let file_type_str: String = row.get(2)?;
    Ok(FileRecord {
        id: row.get(0)?,
        rel_path: row.get(1)?,
        file_type: FileType::from_str(&file_type_str).unwrap_or(FileType::Text),
        mtime: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        line_count: row.get(5)?,
        content_hash: row.get(6)?,
        indexed_at: row.get(7)?,
    })
}

fn row_to_token(row: &rusqlite::Row) -> rusqlite::Result<TokenRecord> {
    let kind_str: String = row.get(2)?;
    Ok(TokenRecord {
        id: row.get(0)?,
        text: row.get(1)?,
        kind: TokenKind::from_str(&kind_str).unwrap_or(TokenKind::Op),
        df: row.get(3)?,
    })
}

fn row_to_posting(row: &rusqlite::Row) -> rusqlite::Result<Posting> {
    let blob: Vec<u8> = row.get(3)?;
    Ok(Posting {
        token_id: row.get(0)?,
        file_id: row.get(1)?,
        tf: row.get(2)?,
        lines: varint::decode_delta_u32_list(&blob),
    })
}

fn row_to_block(row: &rusqlite::Row) -> rusqlite::Result<Block> {
    let kind_str: String = row.get(2)?;
    Ok(Block {
        id: row.get(0)?,
        file_id: row.get(1)?,
        kind: BlockKind::from_str(&kind_str).unwrap_or(BlockKind::Layout),
        level: row.get(3)?,
        line_start: row.get(4)?,
        line_end: row.get(5)?,
        parent_block_id: row.get(6)?,
        content_hash: row.get(7)?,
        token_count: row.get(8)?,
        header_text: row.get(9)?,
        footer_text: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_file_is_idempotent_by_rel_path() {
        let store = Store::open_in_memory().unwrap();
        let id1 = Store::upsert_file(store.conn(), "a.rs", FileType::Code, 1, 10, 3, "hash1", "t1").unwrap();
        let id2 = Store::upsert_file(store.conn(), "a.rs", FileType::Code, 2, 20, 4, "hash2", "t2").unwrap();
        assert_eq!(id1, id2);
        let file = Store::get_file_by_path(store.conn(), "a.rs").unwrap().unwrap();
        assert_eq!(file.content_hash, "hash2");
    }

    #[test]
    fn token_kind_upgrades_on_conflicting_upsert() {
        let store = Store::open_in_memory().unwrap();
        let id1 = Store::upsert_token(store.conn(), "len", TokenKind::Str).unwrap();
        let id2 = Store::upsert_token(store.conn(), "len", TokenKind::Ident).unwrap();
        assert_eq!(id1, id2);
        let token = Store::get_token_by_id(store.conn(), id1).unwrap().unwrap();
        assert_eq!(token.kind, TokenKind::Ident);
    }

    #[test]
    fn posting_lines_roundtrip_through_store() {
        let store = Store::open_in_memory().unwrap();
        let file_id = Store::upsert_file(store.conn(), "a.rs", FileType::Code, 1, 10, 5, "hash", "t").unwrap();
        let token_id = Store::upsert_token(store.conn(), "foo", TokenKind::Ident).unwrap();
        Store::upsert_posting(store.conn(), token_id, file_id, &[1, 3, 5]).unwrap();
        let posting = Store::get_posting(store.conn(), token_id, file_id).unwrap().unwrap();
        assert_eq!(posting.lines, vec![1, 3, 5]);
    }

    #[test]
    fn df_reflects_posting_count() {
        let store = Store::open_in_memory().unwrap();
        let f1 = Store::upsert_file(store.conn(), "a.rs", FileType::Code, 1, 10, 5, "h1", "t").unwrap();
        let f2 = Store::upsert_file(store.conn(), "b.rs", FileType::Code, 1, 10, 5, "h2", "t").unwrap();
        let token_id = Store::upsert_token(store.conn(), "foo", TokenKind::Ident).unwrap();
        Store::upsert_posting(store.conn(), token_id, f1, &[1]).unwrap();
        Store::upsert_posting(store.conn(), token_id, f2, &[2]).unwrap();
        Store::recompute_df(store.conn(), &[token_id]).unwrap();
        let token = Store::get_token_by_id(store.conn(), token_id).unwrap().unwrap();
        assert_eq!(token.df, 2);
    }

    #[test]
    fn vector_blob_roundtrips() {
        let store = Store::open_in_memory().unwrap();
        let v = vec![0.1f32, -0.2, 0.3];
        Store::write_token_vector(store.conn(), "line", 1, &v, 1.0).unwrap();
        let back = Store::read_token_vector(store.conn(), "line", 1).unwrap().unwrap();
        for (a, b) in v.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn rebuild_all_clears_files_and_tokens_but_keeps_feedback() {
        let store = Store::open_in_memory().unwrap();
        let file_id = Store::upsert_file(store.conn(), "a.rs", FileType::Code, 1, 10, 5, "h", "t").unwrap();
        let token_id = Store::upsert_token(store.conn(), "foo", TokenKind::Ident).unwrap();
        Store::upsert_posting(store.conn(), token_id, file_id, &[1]).unwrap();
        Store::insert_feedback_event(store.conn(), "rid", 1.0, None, None, None, None, "t").unwrap();
        Store::accumulate_result_feedback(store.conn(), "rid", 1.0).unwrap();

        store.rebuild_all().unwrap();

        assert!(Store::get_file_by_path(store.conn(), "a.rs").unwrap().is_none());
        assert!(Store::get_token_by_text(store.conn(), "foo").unwrap().is_none());
        assert_eq!(Store::result_feedback(store.conn(), "rid").unwrap(), 1.0);
    }
}
