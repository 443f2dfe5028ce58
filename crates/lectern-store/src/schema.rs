/// SQL DDL for the lookup database.
/// Bible text and hymns are read-only at runtime; they are loaded by import.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS bibles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    shortname TEXT NOT NULL UNIQUE,
    lang TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS verses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bible_id INTEGER NOT NULL REFERENCES bibles(id),
    book_name TEXT NOT NULL,
    book_number INTEGER NOT NULL,
    chapter INTEGER NOT NULL,
    verse INTEGER NOT NULL,
    text TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS hymns (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    author TEXT,
    meter TEXT,
    tune_name TEXT,
    verses TEXT NOT NULL,
    chorus TEXT,
    added_chorus TEXT,
    category TEXT
);

CREATE INDEX IF NOT EXISTS idx_verses_bible ON verses(bible_id);
CREATE INDEX IF NOT EXISTS idx_hymns_title ON hymns(title);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
