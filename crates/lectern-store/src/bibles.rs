use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use lectern_core::presentation::VerseRecord;

use crate::database::Database;
use crate::error::StoreError;

/// One Bible translation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BibleRow {
    pub id: i64,
    pub name: String,
    pub shortname: String,
    pub lang: String,
}

pub struct BibleRepo {
    db: Database,
}

impl BibleRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// List every available translation.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<BibleRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name, shortname, lang FROM bibles ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(BibleRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        shortname: row.get(2)?,
                        lang: row.get(3)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    #[instrument(skip(self))]
    pub fn get_by_shortname(&self, shortname: &str) -> Result<BibleRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, shortname, lang FROM bibles WHERE shortname = ?1",
                [shortname],
                |row| {
                    Ok(BibleRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        shortname: row.get(2)?,
                        lang: row.get(3)?,
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StoreError::NotFound(format!("bible {shortname}"))
                }
                other => other.into(),
            })
        })
    }

    /// All verses of a translation in storage order.
    #[instrument(skip(self))]
    pub fn verses(&self, shortname: &str) -> Result<Vec<VerseRecord>, StoreError> {
        let bible = self.get_by_shortname(shortname)?;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT book_name, book_number, chapter, verse, text
                 FROM verses WHERE bible_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([bible.id], |row| {
                    Ok(VerseRecord {
                        book_name: row.get(0)?,
                        book: row.get(1)?,
                        chapter: row.get(2)?,
                        verse: row.get(3)?,
                        text: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Insert or replace one translation and all of its verses atomically.
    #[instrument(skip(self, bible), fields(verses = bible.verses.len()))]
    pub fn upsert(&self, bible: &BibleImport, fallback_shortname: &str) -> Result<BibleRow, StoreError> {
        self.db.with_tx(|tx| replace_bible(tx, bible, fallback_shortname))
    }

    /// Load a Bible JSON export, or every `*.json` under a directory, in a
    /// single transaction. Each translation is keyed by `metadata.shortname`,
    /// falling back to the file stem, and replaces any earlier copy.
    #[instrument(skip(self))]
    pub fn import_path(&self, path: &Path) -> Result<Vec<BibleRow>, StoreError> {
        let mut parsed = Vec::new();
        for file in json_files(path)? {
            let raw = std::fs::read_to_string(&file)
                .map_err(|e| StoreError::Io(format!("read {}: {e}", file.display())))?;
            let bible: BibleImport = serde_json::from_str(&raw).map_err(|e| {
                StoreError::Serialization(format!("{}: {e}", file.display()))
            })?;
            let stem = file
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            parsed.push((bible, stem));
        }

        let rows = self.db.with_tx(|tx| {
            parsed
                .iter()
                .map(|(bible, stem)| replace_bible(tx, bible, stem))
                .collect::<Result<Vec<_>, _>>()
        })?;

        for row in &rows {
            info!(shortname = %row.shortname, lang = %row.lang, "bible imported");
        }
        Ok(rows)
    }
}

/// Header of a Bible export.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BibleMetadata {
    pub name: Option<String>,
    pub shortname: Option<String>,
    pub lang: Option<String>,
}

/// One Bible export file: `{ "metadata": {...}, "verses": [...] }`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BibleImport {
    #[serde(default)]
    pub metadata: BibleMetadata,
    #[serde(default)]
    pub verses: Vec<VerseRecord>,
}

fn json_files(path: &Path) -> Result<Vec<PathBuf>, StoreError> {
    if !path.is_dir() {
        return Ok(vec![path.to_owned()]);
    }
    let pattern = path.join("**").join("*.json");
    let pattern = pattern
        .to_str()
        .ok_or_else(|| StoreError::Io(format!("non UTF-8 path: {}", path.display())))?;
    let mut files = glob::glob(pattern)
        .map_err(|e| StoreError::Io(format!("bad pattern {pattern}: {e}")))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StoreError::Io(e.to_string()))?;
    files.sort();
    Ok(files)
}

fn replace_bible(
    tx: &rusqlite::Transaction<'_>,
    bible: &BibleImport,
    fallback_shortname: &str,
) -> Result<BibleRow, StoreError> {
    let shortname = bible
        .metadata
        .shortname
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback_shortname)
        .to_string();
    if shortname.is_empty() {
        return Err(StoreError::Serialization("bible has no shortname".into()));
    }
    let name = bible.metadata.name.clone().unwrap_or_else(|| shortname.clone());
    let lang = bible.metadata.lang.clone().unwrap_or_default();

    let _ = tx.execute(
        "DELETE FROM verses WHERE bible_id IN (SELECT id FROM bibles WHERE shortname = ?1)",
        [&shortname],
    )?;
    let _ = tx.execute("DELETE FROM bibles WHERE shortname = ?1", [&shortname])?;
    let _ = tx.execute(
        "INSERT INTO bibles (name, shortname, lang) VALUES (?1, ?2, ?3)",
        rusqlite::params![name, shortname, lang],
    )?;
    let id = tx.last_insert_rowid();

    let mut stmt = tx.prepare(
        "INSERT INTO verses (bible_id, book_name, book_number, chapter, verse, text)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for v in &bible.verses {
        let _ = stmt.execute(rusqlite::params![id, v.book_name, v.book, v.chapter, v.verse, v.text])?;
    }

    Ok(BibleRow {
        id,
        name,
        shortname,
        lang,
    })
}
