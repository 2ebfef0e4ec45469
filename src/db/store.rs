//! SQLite-backed result store implementation.

use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::schema::{MIGRATIONS, SCHEMA};
use super::{
    bytes_to_embedding, embedding_to_bytes, ContentRecord, LegacyStats, ScanFields, TrendingTag,
};
use crate::capability::CapabilityFlags;

/// Trend buckets older than this many days are folded into the global
/// per-tag counters and deleted.
const TREND_RETENTION_DAYS: u32 = 30;

pub struct ResultStore {
    conn: Mutex<Connection>,
}

impl ResultStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    /// In-memory store, used by tests and the smoke path.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        for migration in MIGRATIONS {
            // Additive ALTERs fail when the column already exists.
            let _ = conn.execute(migration, []);
        }
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("store mutex poisoned: {}", e))
    }

    /// Which capabilities are already recorded for this fingerprint.
    pub fn capabilities_done(&self, fingerprint: &str) -> Result<Option<CapabilityFlags>> {
        let conn = self.conn()?;
        let bits: Option<u32> = conn
            .query_row(
                "SELECT capabilities_done FROM content WHERE fingerprint = ?",
                [fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bits.map(CapabilityFlags::from_bits))
    }

    /// Full stored record with tag associations split into general and
    /// character lists.
    pub fn get_record(&self, fingerprint: &str) -> Result<Option<ContentRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT fingerprint, path, capabilities_done, metadata, risk, faces,
                       embedding, last_scanned
                FROM content
                WHERE fingerprint = ?
                "#,
                [fingerprint],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<Vec<u8>>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((fp, path, bits, metadata, risk, faces, embedding, last_scanned)) = row else {
            return Ok(None);
        };

        let mut record = ContentRecord {
            fingerprint: fp,
            path,
            capabilities_done: CapabilityFlags::from_bits(bits),
            metadata: metadata.and_then(|json| serde_json::from_str(&json).ok()),
            risk,
            faces: faces.and_then(|json| serde_json::from_str(&json).ok()),
            embedding: embedding.map(|bytes| bytes_to_embedding(&bytes)),
            last_scanned,
            tags: Vec::new(),
            characters: Vec::new(),
        };

        let mut stmt = conn.prepare(
            r#"
            SELECT tags.name, tags.is_character
            FROM content_tags
            JOIN tags ON tags.id = content_tags.tag_id
            WHERE content_tags.fingerprint = ?
            ORDER BY content_tags.rowid
            "#,
        )?;
        let rows = stmt.query_map([fingerprint], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
        })?;
        for entry in rows {
            let (name, is_character) = entry?;
            if is_character {
                record.characters.push(name);
            } else {
                record.tags.push(name);
            }
        }

        Ok(Some(record))
    }

    /// Merge a scan result into the store.
    ///
    /// The bitmask is combined with OR and each optional field falls back to
    /// the stored value when absent, so the operation is idempotent and
    /// order-independent across concurrent scans of the same fingerprint.
    /// A path is a location pointer, not an identity: any other fingerprint
    /// previously recorded at the same path is purged first.
    pub fn upsert(
        &self,
        fingerprint: &str,
        path: &str,
        new_bits: CapabilityFlags,
        fields: &ScanFields,
    ) -> Result<()> {
        let metadata_json = fields
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let faces_json = fields
            .faces
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let embedding_bytes = fields.embedding.as_deref().map(embedding_to_bytes);
        let scanned_at = Utc::now().to_rfc3339();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM content WHERE path = ? AND fingerprint != ?",
            rusqlite::params![path, fingerprint],
        )?;
        tx.execute(
            r#"
            INSERT INTO content (
                fingerprint, path, capabilities_done, metadata, risk, faces,
                embedding, last_scanned
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET
                path = excluded.path,
                capabilities_done = content.capabilities_done | excluded.capabilities_done,
                metadata = COALESCE(excluded.metadata, content.metadata),
                risk = COALESCE(excluded.risk, content.risk),
                faces = COALESCE(excluded.faces, content.faces),
                embedding = COALESCE(excluded.embedding, content.embedding),
                last_scanned = excluded.last_scanned
            "#,
            rusqlite::params![
                fingerprint,
                path,
                new_bits.bits(),
                metadata_json,
                fields.risk,
                faces_json,
                embedding_bytes,
                scanned_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Replace all tag associations for a fingerprint.
    ///
    /// Inputs are deduplicated preserving first appearance; tag rows are
    /// created on first sighting with a zero global count.
    pub fn replace_tags(
        &self,
        fingerprint: &str,
        general_tags: &[String],
        character_tags: &[String],
    ) -> Result<()> {
        let general = dedupe(general_tags);
        let characters = dedupe(character_tags);

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM content_tags WHERE fingerprint = ?",
            [fingerprint],
        )?;
        for (tags, is_character) in [(&general, false), (&characters, true)] {
            for tag in tags.iter() {
                let tag_id = ensure_tag(&tx, tag, is_character)?;
                tx.execute(
                    "INSERT INTO content_tags (fingerprint, tag_id, confidence) VALUES (?, ?, ?)",
                    rusqlite::params![fingerprint, tag_id, Option::<f64>::None],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Record one sighting per tag in today's trend bucket.
    ///
    /// Stale buckets are retired in the same transaction so the trend table
    /// stays bounded without a separate maintenance job.
    pub fn record_tag_sightings(&self, tags: &[String]) -> Result<()> {
        let unique = dedupe(tags);
        if unique.is_empty() {
            return Ok(());
        }
        let today = Utc::now().date_naive().to_string();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        retire_stale_buckets(&tx)?;
        for tag in unique.iter() {
            let tag_id = ensure_tag(&tx, tag, false)?;
            tx.execute(
                r#"
                INSERT INTO trend_buckets (date, tag_id, day_count)
                VALUES (?, ?, 1)
                ON CONFLICT(date, tag_id) DO UPDATE SET
                    day_count = day_count + 1
                "#,
                rusqlite::params![today, tag_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Fold all expired trend buckets into the per-tag global counters.
    pub fn retire_stale_trend_buckets(&self) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let retired = retire_stale_buckets(&tx)?;
        tx.commit()?;
        Ok(retired)
    }

    /// Rank tags by recency-weighted sighting counts: last day counts
    /// triple, the rest of the last week counts once, older buckets are
    /// ignored. Ties break on tag name for deterministic output.
    pub fn weighted_trending(&self, limit: usize) -> Result<Vec<TrendingTag>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT tags.name,
                   SUM(
                       CASE
                           WHEN trend_buckets.date >= date('now', '-1 day') THEN trend_buckets.day_count * 3
                           WHEN trend_buckets.date >= date('now', '-7 day') THEN trend_buckets.day_count
                           ELSE 0
                       END
                   ) AS weighted_count
            FROM trend_buckets
            JOIN tags ON tags.id = trend_buckets.tag_id
            WHERE trend_buckets.date >= date('now', '-7 day')
            GROUP BY trend_buckets.tag_id
            HAVING weighted_count > 0
            ORDER BY weighted_count DESC, tags.name ASC
            LIMIT ?
            "#,
        )?;
        let rows = stmt.query_map([limit], |row| {
            Ok(TrendingTag {
                tag: row.get(0)?,
                weighted_count: row.get(1)?,
            })
        })?;
        let mut trending = Vec::new();
        for row in rows {
            trending.push(row?);
        }
        Ok(trending)
    }

    /// Bump the legacy scan counter and per-tag legacy counts.
    pub fn record_legacy_scan(&self, tags: &[String]) -> Result<()> {
        let unique = dedupe(tags);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("UPDATE legacy_stats SET scan_count = scan_count + 1 WHERE id = 1", [])?;
        for tag in unique.iter() {
            tx.execute(
                r#"
                INSERT INTO legacy_tag_counts(tag, count)
                VALUES(?, 1)
                ON CONFLICT(tag) DO UPDATE SET count = count + 1
                "#,
                [tag],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn legacy_stats(&self, top_n: usize) -> Result<LegacyStats> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row("SELECT scan_count FROM legacy_stats WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);
        let mut stmt = conn.prepare(
            "SELECT tag FROM legacy_tag_counts ORDER BY count DESC, tag ASC LIMIT ?",
        )?;
        let rows = stmt.query_map([top_n], |row| row.get::<_, String>(0))?;
        let mut top_tags = Vec::new();
        for row in rows {
            top_tags.push(row?);
        }
        Ok(LegacyStats { count, top_tags })
    }

    /// Global count for one tag. Test and inspection helper.
    pub fn tag_global_count(&self, tag: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT global_count FROM tags WHERE name = ?",
                [tag],
                |row| row.get(0),
            )
            .optional()?)
    }
}

fn ensure_tag(tx: &Transaction<'_>, name: &str, is_character: bool) -> Result<i64> {
    tx.execute(
        "INSERT OR IGNORE INTO tags (name, global_count, is_character) VALUES (?, 0, ?)",
        rusqlite::params![name, is_character],
    )?;
    let id = tx.query_row("SELECT id FROM tags WHERE name = ?", [name], |row| {
        row.get(0)
    })?;
    Ok(id)
}

fn retire_stale_buckets(tx: &Transaction<'_>) -> Result<usize> {
    let cutoff = format!("-{} day", TREND_RETENTION_DAYS);
    let mut stmt = tx.prepare(
        r#"
        SELECT tag_id, SUM(day_count)
        FROM trend_buckets
        WHERE date < date('now', ?)
        GROUP BY tag_id
        "#,
    )?;
    let rows = stmt.query_map([&cutoff], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut retired = 0usize;
    let mut folded: Vec<(i64, i64)> = Vec::new();
    for row in rows {
        folded.push(row?);
    }
    drop(stmt);
    for (tag_id, total) in folded {
        tx.execute(
            "UPDATE tags SET global_count = global_count + ? WHERE id = ?",
            rusqlite::params![total, tag_id],
        )?;
        retired += 1;
    }
    tx.execute(
        "DELETE FROM trend_buckets WHERE date < date('now', ?)",
        [&cutoff],
    )?;
    Ok(retired)
}

fn dedupe(tags: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tags.iter()
        .filter(|tag| !tag.is_empty())
        .filter(|tag| seen.insert(tag.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{FaceBox, FaceGeometry, MediaInfo, PAYLOAD_VERSION};
    use chrono::Days;

    fn store() -> ResultStore {
        ResultStore::open_in_memory().unwrap()
    }

    fn sample_info() -> MediaInfo {
        MediaInfo {
            v: PAYLOAD_VERSION,
            width: 640,
            height: 480,
            format: Some("Png".to_string()),
            size_bytes: 1234,
        }
    }

    fn insert_bucket(store: &ResultStore, tag: &str, days_ago: u64, count: i64) {
        let date = Utc::now()
            .date_naive()
            .checked_sub_days(Days::new(days_ago))
            .unwrap()
            .to_string();
        let mut conn = store.conn().unwrap();
        let tx = conn.transaction().unwrap();
        let tag_id = ensure_tag(&tx, tag, false).unwrap();
        tx.execute(
            "INSERT INTO trend_buckets (date, tag_id, day_count) VALUES (?, ?, ?)
             ON CONFLICT(date, tag_id) DO UPDATE SET day_count = day_count + excluded.day_count",
            rusqlite::params![date, tag_id, count],
        )
        .unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn test_capabilities_done_absent_for_unknown_fingerprint() {
        assert!(store().capabilities_done("missing").unwrap().is_none());
    }

    #[test]
    fn test_upsert_or_merges_bitmask_monotonically() {
        let store = store();
        store
            .upsert("fp", "/a.png", CapabilityFlags::BASIC, &ScanFields::default())
            .unwrap();
        store
            .upsert("fp", "/a.png", CapabilityFlags::RISK, &ScanFields::default())
            .unwrap();
        // Re-applying an old subset never clears bits.
        store
            .upsert("fp", "/a.png", CapabilityFlags::BASIC, &ScanFields::default())
            .unwrap();
        assert_eq!(
            store.capabilities_done("fp").unwrap().unwrap(),
            CapabilityFlags::BASIC | CapabilityFlags::RISK
        );
    }

    #[test]
    fn test_upsert_field_merge_keeps_existing_when_absent() {
        let store = store();
        let fields = ScanFields {
            metadata: Some(sample_info()),
            risk: Some(0.42),
            ..Default::default()
        };
        store
            .upsert("fp", "/a.png", CapabilityFlags::BASIC | CapabilityFlags::RISK, &fields)
            .unwrap();
        // A later partial update with absent fields preserves them.
        let faces_only = ScanFields {
            faces: Some(FaceGeometry::new(vec![FaceBox {
                x1: 1.0,
                y1: 2.0,
                x2: 3.0,
                y2: 4.0,
                confidence: Some(0.9),
            }])),
            ..Default::default()
        };
        store
            .upsert("fp", "/a.png", CapabilityFlags::FACE, &faces_only)
            .unwrap();

        let record = store.get_record("fp").unwrap().unwrap();
        assert_eq!(record.metadata, Some(sample_info()));
        assert_eq!(record.risk, Some(0.42));
        assert_eq!(record.faces.unwrap().boxes.len(), 1);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = store();
        let fields = ScanFields {
            metadata: Some(sample_info()),
            risk: Some(0.1),
            embedding: Some(vec![0.5, -0.5]),
            ..Default::default()
        };
        store
            .upsert("fp", "/a.png", CapabilityFlags::ALL, &fields)
            .unwrap();
        store
            .upsert("fp", "/a.png", CapabilityFlags::ALL, &fields)
            .unwrap();
        let record = store.get_record("fp").unwrap().unwrap();
        assert_eq!(record.capabilities_done, CapabilityFlags::ALL);
        assert_eq!(record.risk, Some(0.1));
        assert_eq!(record.embedding, Some(vec![0.5, -0.5]));
    }

    #[test]
    fn test_upsert_steals_path_from_other_fingerprint() {
        let store = store();
        store
            .upsert("old", "/same.png", CapabilityFlags::BASIC, &ScanFields::default())
            .unwrap();
        store
            .upsert("new", "/same.png", CapabilityFlags::BASIC, &ScanFields::default())
            .unwrap();
        assert!(store.get_record("old").unwrap().is_none());
        let record = store.get_record("new").unwrap().unwrap();
        assert_eq!(record.path.as_deref(), Some("/same.png"));
    }

    #[test]
    fn test_replace_tags_is_full_replacement_and_dedupes() {
        let store = store();
        store
            .upsert("fp", "/a.png", CapabilityFlags::TAGS, &ScanFields::default())
            .unwrap();
        store
            .replace_tags(
                "fp",
                &["sky".into(), "tree".into(), "sky".into(), String::new()],
                &["alice".into()],
            )
            .unwrap();
        let record = store.get_record("fp").unwrap().unwrap();
        assert_eq!(record.tags, vec!["sky", "tree"]);
        assert_eq!(record.characters, vec!["alice"]);

        store
            .replace_tags("fp", &["ocean".into()], &[])
            .unwrap();
        let record = store.get_record("fp").unwrap().unwrap();
        assert_eq!(record.tags, vec!["ocean"]);
        assert!(record.characters.is_empty());
    }

    #[test]
    fn test_sightings_increment_today_bucket_per_call() {
        let store = store();
        store.record_tag_sightings(&["sky".into()]).unwrap();
        store.record_tag_sightings(&["sky".into()]).unwrap();
        let trending = store.weighted_trending(10).unwrap();
        assert_eq!(trending.len(), 1);
        assert_eq!(trending[0].tag, "sky");
        // Two sightings today at triple weight.
        assert_eq!(trending[0].weighted_count, 6.0);
        // Global count untouched until retirement.
        assert_eq!(store.tag_global_count("sky").unwrap(), Some(0));
    }

    #[test]
    fn test_weighted_trending_recency_ordering() {
        let store = store();
        // 5 sightings yesterday => weight 15.
        insert_bucket(&store, "fresh", 1, 5);
        // 10 sightings eight days ago => weight 0, excluded.
        insert_bucket(&store, "stale", 8, 10);
        // 2 sightings four days ago => weight 2.
        insert_bucket(&store, "weekly", 4, 2);

        let trending = store.weighted_trending(10).unwrap();
        let names: Vec<_> = trending.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(names, vec!["fresh", "weekly"]);
        assert_eq!(trending[0].weighted_count, 15.0);
        assert_eq!(trending[1].weighted_count, 2.0);
    }

    #[test]
    fn test_weighted_trending_today_beats_weekly() {
        let store = store();
        insert_bucket(&store, "today", 0, 2); // weight 6
        insert_bucket(&store, "aged", 4, 2); // weight 2
        let trending = store.weighted_trending(10).unwrap();
        assert_eq!(trending[0].tag, "today");
        assert_eq!(trending[0].weighted_count, 6.0);
        assert_eq!(trending[1].tag, "aged");
    }

    #[test]
    fn test_weighted_trending_ties_break_on_name() {
        let store = store();
        insert_bucket(&store, "zebra", 0, 1);
        insert_bucket(&store, "apple", 0, 1);
        let trending = store.weighted_trending(10).unwrap();
        let names: Vec<_> = trending.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(names, vec!["apple", "zebra"]);
    }

    #[test]
    fn test_retirement_folds_into_global_count() {
        let store = store();
        insert_bucket(&store, "old_tag", 31, 7);
        insert_bucket(&store, "old_tag", 45, 3);
        insert_bucket(&store, "live_tag", 2, 4);

        let retired = store.retire_stale_trend_buckets().unwrap();
        assert_eq!(retired, 1);
        assert_eq!(store.tag_global_count("old_tag").unwrap(), Some(10));
        assert_eq!(store.tag_global_count("live_tag").unwrap(), Some(0));

        // Retired buckets no longer influence trending; live ones still do.
        let trending = store.weighted_trending(10).unwrap();
        let names: Vec<_> = trending.iter().map(|t| t.tag.as_str()).collect();
        assert_eq!(names, vec!["live_tag"]);
    }

    #[test]
    fn test_sightings_retire_stale_buckets_inline() {
        let store = store();
        insert_bucket(&store, "ancient", 40, 9);
        store.record_tag_sightings(&["ancient".into()]).unwrap();
        assert_eq!(store.tag_global_count("ancient").unwrap(), Some(9));
    }

    #[test]
    fn test_legacy_stats_roundtrip() {
        let store = store();
        store
            .record_legacy_scan(&["cat".into(), "dog".into()])
            .unwrap();
        store.record_legacy_scan(&["cat".into()]).unwrap();
        let stats = store.legacy_stats(5).unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.top_tags, vec!["cat", "dog"]);
    }
}
