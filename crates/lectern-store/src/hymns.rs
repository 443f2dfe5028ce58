use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use lectern_core::presentation::HymnRecord;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Entry in the hymn picker list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HymnSummary {
    pub id: i64,
    pub title: String,
    pub author: Option<String>,
    pub category: Option<String>,
}

/// A complete hymn with all of its stanzas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HymnDetail {
    pub id: i64,
    pub title: String,
    pub author: Option<String>,
    pub meter: Option<String>,
    pub tune_name: Option<String>,
    pub verses: Vec<String>,
    pub chorus: Option<String>,
    pub added_chorus: Option<String>,
    pub category: Option<String>,
}

impl HymnDetail {
    /// Each stanza as a record ready to be presented.
    pub fn stanzas(&self) -> Vec<HymnRecord> {
        self.verses
            .iter()
            .map(|verse| HymnRecord {
                title: self.title.clone(),
                verse: verse.clone(),
            })
            .collect()
    }
}

/// Shape of a hymn in the JSON export used for seeding. `number` becomes
/// the hymn id.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HymnImport {
    pub number: i64,
    pub title: String,
    pub author: Option<String>,
    pub meter: Option<String>,
    pub tune_name: Option<String>,
    #[serde(default)]
    pub verses: Vec<String>,
    pub chorus: Option<String>,
    pub added_chorus: Option<String>,
    pub category: Option<String>,
}

impl From<HymnImport> for HymnDetail {
    fn from(h: HymnImport) -> Self {
        Self {
            id: h.number,
            title: h.title,
            author: h.author,
            meter: h.meter,
            tune_name: h.tune_name,
            verses: h.verses,
            chorus: h.chorus,
            added_chorus: h.added_chorus,
            category: h.category,
        }
    }
}

const SELECT_DETAIL: &str = "SELECT id, title, author, meter, tune_name, verses, chorus, added_chorus, category FROM hymns";

fn detail_from_row(row: &rusqlite::Row<'_>) -> Result<HymnDetail, StoreError> {
    let raw_verses: String = row_helpers::get(row, 5, "hymns", "verses")?;
    Ok(HymnDetail {
        id: row_helpers::get(row, 0, "hymns", "id")?,
        title: row_helpers::get(row, 1, "hymns", "title")?,
        author: row_helpers::get(row, 2, "hymns", "author")?,
        meter: row_helpers::get(row, 3, "hymns", "meter")?,
        tune_name: row_helpers::get(row, 4, "hymns", "tune_name")?,
        verses: row_helpers::parse_json(&raw_verses, "hymns", "verses")?,
        chorus: row_helpers::get(row, 6, "hymns", "chorus")?,
        added_chorus: row_helpers::get(row, 7, "hymns", "added_chorus")?,
        category: row_helpers::get(row, 8, "hymns", "category")?,
    })
}

pub struct HymnRepo {
    db: Database,
}

impl HymnRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<HymnSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, title, author, category FROM hymns ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(HymnSummary {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        author: row.get(2)?,
                        category: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Case-insensitive title search.
    #[instrument(skip(self))]
    pub fn search(&self, title_fragment: &str) -> Result<Vec<HymnSummary>, StoreError> {
        let pattern = format!("%{}%", row_helpers::escape_like(title_fragment));
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, author, category FROM hymns
                 WHERE title LIKE ?1 ESCAPE '\\' ORDER BY id",
            )?;
            let rows = stmt
                .query_map([pattern], |row| {
                    Ok(HymnSummary {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        author: row.get(2)?,
                        category: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    #[instrument(skip(self))]
    pub fn get(&self, id: i64) -> Result<HymnDetail, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_DETAIL} WHERE id = ?1"))?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => detail_from_row(row),
                None => Err(StoreError::NotFound(format!("hymn {id}"))),
            }
        })
    }

    /// Insert or replace a hymn by id.
    #[instrument(skip(self, hymn), fields(id = hymn.id))]
    pub fn upsert(&self, hymn: &HymnDetail) -> Result<(), StoreError> {
        let verses = serde_json::to_string(&hymn.verses)?;
        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT OR REPLACE INTO hymns
                 (id, title, author, meter, tune_name, verses, chorus, added_chorus, category)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    hymn.id,
                    hymn.title,
                    hymn.author,
                    hymn.meter,
                    hymn.tune_name,
                    verses,
                    hymn.chorus,
                    hymn.added_chorus,
                    hymn.category,
                ],
            )?;
            Ok(())
        })
    }

    /// Replace the hymn table with the contents of a JSON export.
    /// Returns the number of hymns imported.
    #[instrument(skip(self))]
    pub fn import_json(&self, path: &Path) -> Result<usize, StoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Io(format!("read {}: {e}", path.display())))?;
        let hymns: Vec<HymnImport> = serde_json::from_str(&raw)?;
        let count = hymns.len();

        self.db.with_tx(|tx| {
            let _ = tx.execute("DELETE FROM hymns", [])?;
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO hymns
                 (id, title, author, meter, tune_name, verses, chorus, added_chorus, category)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for hymn in hymns {
                let hymn = HymnDetail::from(hymn);
                let verses = serde_json::to_string(&hymn.verses)?;
                let _ = stmt.execute(rusqlite::params![
                    hymn.id,
                    hymn.title,
                    hymn.author,
                    hymn.meter,
                    hymn.tune_name,
                    verses,
                    hymn.chorus,
                    hymn.added_chorus,
                    hymn.category,
                ])?;
            }
            Ok(())
        })?;

        info!(count, path = %path.display(), "hymns imported");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amazing_grace() -> HymnDetail {
        HymnDetail {
            id: 12,
            title: "Amazing Grace".into(),
            author: Some("John Newton".into()),
            meter: Some("8.6.8.6".into()),
            tune_name: Some("New Britain".into()),
            verses: vec![
                "Amazing grace! How sweet the sound\nThat saved a wretch like me!".into(),
                "'Twas grace that taught my heart to fear,\nAnd grace my fears relieved;".into(),
            ],
            chorus: None,
            added_chorus: None,
            category: Some("Grace".into()),
        }
    }

    fn repo() -> HymnRepo {
        HymnRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn upsert_and_get() {
        let repo = repo();
        repo.upsert(&amazing_grace()).unwrap();
        let fetched = repo.get(12).unwrap();
        assert_eq!(fetched, amazing_grace());
    }

    #[test]
    fn stanzas_pair_title_with_each_verse() {
        let stanzas = amazing_grace().stanzas();
        assert_eq!(stanzas.len(), 2);
        assert_eq!(stanzas[1].title, "Amazing Grace");
        assert!(stanzas[1].verse.starts_with("'Twas grace"));
    }

    #[test]
    fn get_missing_is_not_found() {
        assert!(matches!(repo().get(999), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn corrupt_verses_column_reported() {
        let repo = repo();
        repo.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO hymns (id, title, verses) VALUES (1, 'Broken', 'not json')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            repo.get(1),
            Err(StoreError::CorruptRow { table: "hymns", column: "verses", .. })
        ));
    }

    #[test]
    fn list_and_search() {
        let repo = repo();
        repo.upsert(&amazing_grace()).unwrap();
        let mut other = amazing_grace();
        other.id = 3;
        other.title = "100% Yours_Forever".into();
        repo.upsert(&other).unwrap();

        let all = repo.list().unwrap();
        assert_eq!(all.iter().map(|h| h.id).collect::<Vec<_>>(), vec![3, 12]);

        assert_eq!(repo.search("grace").unwrap().len(), 1);
        assert_eq!(repo.search("GRACE").unwrap()[0].id, 12);
        assert_eq!(repo.search("100%").unwrap()[0].id, 3);
        assert_eq!(repo.search("s_F").unwrap().len(), 1);
        assert!(repo.search("x%y").unwrap().is_empty());
    }

    #[test]
    fn import_json_replaces_table() {
        let repo = repo();
        repo.upsert(&amazing_grace()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged_hymns.json");
        std::fs::write(
            &path,
            r#"[
                {"number": 1, "title": "Holy, Holy, Holy", "tuneName": "Nicaea",
                 "verses": ["Holy, holy, holy!\nLord God Almighty!"]},
                {"number": 2, "title": "Be Thou My Vision", "verses": []}
            ]"#,
        )
        .unwrap();

        assert_eq!(repo.import_json(&path).unwrap(), 2);
        let all = repo.list().unwrap();
        assert_eq!(all.len(), 2);
        assert!(matches!(repo.get(12), Err(StoreError::NotFound(_))));

        let holy = repo.get(1).unwrap();
        assert_eq!(holy.tune_name.as_deref(), Some("Nicaea"));
        assert_eq!(holy.verses.len(), 1);
    }

    #[test]
    fn import_invalid_json_leaves_table_untouched() {
        let repo = repo();
        repo.upsert(&amazing_grace()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "[{").unwrap();

        assert!(matches!(repo.import_json(&path), Err(StoreError::Serialization(_))));
        assert_eq!(repo.list().unwrap().len(), 1);
    }
}
