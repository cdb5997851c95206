mod scanner;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{Album, Track};
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition,
    TableError, TransactionError, WriteTransaction,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use scanner::{FailureReason, ScanFailure, ScanMode, ScanResult};

const INDEX_VERSION: u32 = 2;
const KEY_SEP: char = '\x1f';

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const ALBUMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("albums");
const ALBUMS_BY_NAME_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("albums_by_name");
const TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks");
const ALBUM_TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("album_tracks");
const PLAY_COUNTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("play_counts");

const META_VERSION_KEY: &str = "version";

/// Handle on the music root and its index. Cloning is cheap; all clones share
/// one database, and every album reconciliation is its own write transaction.
#[derive(Clone)]
pub struct Library {
    root: PathBuf,
    db: Arc<Database>,
}

impl Library {
    pub fn open(root: PathBuf, db_path: PathBuf) -> Result<Self, LibraryError> {
        let db = Self::open_db(&db_path)?;
        info!("Opened index at {:?}", db_path);
        Self::with_db(root, db)
    }

    pub fn with_db(root: PathBuf, db: Arc<Database>) -> Result<Self, LibraryError> {
        ensure_schema(&db)?;
        Ok(Self { root, db })
    }

    pub fn open_db(path: &Path) -> Result<Arc<Database>, LibraryError> {
        let db = open_or_create_db(path)?;
        Ok(Arc::new(db))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scan(&self, mode: ScanMode) -> Result<ScanResult, LibraryError> {
        scanner::run_scan(&self.root, &self.db, mode)
    }

    pub fn stats(&self) -> Result<LibraryStats, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let albums = read_txn.open_table(ALBUMS_TABLE)?.len()?;
        let tracks = read_txn.open_table(TRACKS_TABLE)?.len()?;
        Ok(LibraryStats {
            albums: albums as usize,
            tracks: tracks as usize,
        })
    }

    pub fn get_track(&self, track_id: &str) -> Result<Option<Track>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRACKS_TABLE)?;
        let track = match table.get(track_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(track)
    }

    pub fn get_album(&self, album_id: &str) -> Result<Option<Album>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ALBUMS_TABLE)?;
        let album = match table.get(album_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(album)
    }

    /// Directory mtime recorded the last time the album at `relpath` was
    /// indexed.
    pub fn album_watermark(&self, relpath: &str) -> Result<Option<u64>, LibraryError> {
        let album_id = common::stable_id(relpath);
        Ok(self.get_album(&album_id)?.map(|album| album.last_modified_ns))
    }

    pub fn get_album_tracks(&self, album_id: &str) -> Result<Vec<Track>, LibraryError> {
        read_album_tracks(&self.db, album_id)
    }

    pub fn list_albums(
        &self,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Album>, usize), LibraryError> {
        let search = search
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_lowercase());

        let read_txn = self.db.begin_read()?;
        let name_table = read_txn.open_table(ALBUMS_BY_NAME_TABLE)?;
        let album_table = read_txn.open_table(ALBUMS_TABLE)?;

        let mut total = 0usize;
        let mut items = Vec::new();

        for entry in name_table.iter()? {
            let entry = entry?;
            let key = entry.0.value();
            let (name_key, album_id) = split_key_last(key)?;
            if let Some(search) = &search {
                if !name_key.contains(search.as_str()) {
                    continue;
                }
            }

            total += 1;
            if total <= offset {
                continue;
            }
            if items.len() >= limit {
                continue;
            }

            if let Some(value) = album_table.get(album_id)? {
                let album: Album = decode_value(value.value())?;
                items.push(album);
            }
        }

        Ok((items, total))
    }

    /// Tracks whose title or artist contains `search`, ordered by title.
    pub fn search_tracks(
        &self,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Track>, usize), LibraryError> {
        let search = search
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| value.to_lowercase());

        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRACKS_TABLE)?;
        let mut matches: Vec<(String, Track)> = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let track: Track = decode_value(entry.1.value())?;
            let title = track.title.to_lowercase();
            if let Some(search) = &search {
                let artist_hit = track
                    .artist
                    .as_deref()
                    .is_some_and(|artist| artist.to_lowercase().contains(search.as_str()));
                if !title.contains(search.as_str()) && !artist_hit {
                    continue;
                }
            }
            matches.push((title, track));
        }
        matches.sort_by(|a, b| (&a.0, &a.1.id).cmp(&(&b.0, &b.1.id)));

        let total = matches.len();
        let items = matches
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, track)| track)
            .collect();
        Ok((items, total))
    }

    pub fn play_stats(&self, track_id: &str) -> Result<PlayStats, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PLAY_COUNTS_TABLE)?;
        let stats = match table.get(track_id)? {
            Some(value) => decode_value(value.value())?,
            None => PlayStats::default(),
        };
        Ok(stats)
    }

    /// Counts one play of an indexed track. Unknown ids are left alone and
    /// yield `None`.
    pub fn increment_play_count(
        &self,
        track_id: &str,
    ) -> Result<Option<PlayStats>, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let stats = {
            let tracks = write_txn.open_table(TRACKS_TABLE)?;
            if tracks.get(track_id)?.is_none() {
                return Ok(None);
            }
            let mut plays = write_txn.open_table(PLAY_COUNTS_TABLE)?;
            let mut stats: PlayStats = match plays.get(track_id)? {
                Some(value) => decode_value(value.value())?,
                None => PlayStats::default(),
            };
            stats.play_count += 1;
            stats.last_played = Some(now_secs());
            plays.insert(track_id, encode_value(&stats)?.as_slice())?;
            stats
        };
        write_txn.commit()?;
        Ok(Some(stats))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayStats {
    pub play_count: u64,
    /// Unix seconds of the most recent play.
    pub last_played: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryStats {
    pub albums: usize,
    pub tracks: usize,
}

#[derive(Debug)]
pub enum LibraryError {
    Io(std::io::Error),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    KeyParse(String),
    RootUnavailable(PathBuf),
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Io(err) => write!(f, "io error: {}", err),
            LibraryError::Redb(err) => write!(f, "db error: {}", err),
            LibraryError::Bincode(err) => write!(f, "bincode error: {}", err),
            LibraryError::KeyParse(value) => write!(f, "key parse error: {}", value),
            LibraryError::RootUnavailable(path) => {
                write!(f, "music root unavailable: {}", path.display())
            }
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err)
    }
}

impl From<redb::Error> for LibraryError {
    fn from(err: redb::Error) -> Self {
        LibraryError::Redb(err)
    }
}

impl From<DatabaseError> for LibraryError {
    fn from(err: DatabaseError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TableError> for LibraryError {
    fn from(err: TableError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TransactionError> for LibraryError {
    fn from(err: TransactionError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<StorageError> for LibraryError {
    fn from(err: StorageError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<CommitError> for LibraryError {
    fn from(err: CommitError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for LibraryError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        LibraryError::Bincode(err)
    }
}

fn open_or_create_db(path: &Path) -> Result<Database, LibraryError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn read_version(db: &Database) -> Result<Option<u32>, LibraryError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(META_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let version = match table.get(META_VERSION_KEY)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(version)
}

/// Creates every table up front so readers never see `TableDoesNotExist`.
/// An index from another version is dropped and rebuilt by the next scan.
fn ensure_schema(db: &Database) -> Result<(), LibraryError> {
    let version = read_version(db)?;
    if version == Some(INDEX_VERSION) {
        return Ok(());
    }

    let write_txn = db.begin_write()?;
    if let Some(version) = version {
        warn!("Index version mismatch ({}); clearing index", version);
        clear_table(&write_txn, META_TABLE)?;
        clear_table(&write_txn, ALBUMS_TABLE)?;
        clear_table(&write_txn, ALBUMS_BY_NAME_TABLE)?;
        clear_table(&write_txn, TRACKS_TABLE)?;
        clear_table(&write_txn, ALBUM_TRACKS_TABLE)?;
        clear_table(&write_txn, PLAY_COUNTS_TABLE)?;
    }
    {
        let mut meta = write_txn.open_table(META_TABLE)?;
        meta.insert(META_VERSION_KEY, encode_value(&INDEX_VERSION)?.as_slice())?;
        write_txn.open_table(ALBUMS_TABLE)?;
        write_txn.open_table(ALBUMS_BY_NAME_TABLE)?;
        write_txn.open_table(TRACKS_TABLE)?;
        write_txn.open_table(ALBUM_TRACKS_TABLE)?;
        write_txn.open_table(PLAY_COUNTS_TABLE)?;
    }
    write_txn.commit()?;
    Ok(())
}

fn read_album_tracks(db: &Database, album_id: &str) -> Result<Vec<Track>, LibraryError> {
    let read_txn = db.begin_read()?;
    let index = read_txn.open_table(ALBUM_TRACKS_TABLE)?;
    let tracks = read_txn.open_table(TRACKS_TABLE)?;

    let prefix = prefix_key(album_id);
    let end = prefix_end(&prefix);
    let mut out = Vec::new();
    for entry in index.range(prefix.as_str()..end.as_str())? {
        let entry = entry?;
        let (_, track_id) = split_key_last(entry.0.value())?;
        if let Some(value) = tracks.get(track_id)? {
            out.push(decode_value(value.value())?);
        }
    }
    Ok(out)
}

fn read_all_albums(db: &Database) -> Result<Vec<Album>, LibraryError> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(ALBUMS_TABLE)?;
    let mut albums = Vec::new();
    for entry in table.iter()? {
        let entry = entry?;
        albums.push(decode_value(entry.1.value())?);
    }
    Ok(albums)
}

fn clear_table(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
) -> Result<(), LibraryError> {
    match txn.delete_table(table) {
        Ok(_) => Ok(()),
        Err(TableError::TableDoesNotExist(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}

fn album_name_key(album: &Album) -> String {
    let mut out = String::new();
    out.push_str(album.artist.as_deref().unwrap_or("").trim().to_lowercase().as_str());
    out.push(KEY_SEP);
    out.push_str(&album.name.to_lowercase());
    out.push(KEY_SEP);
    out.push_str(&album.id);
    out
}

fn album_track_key(album_id: &str, order: usize, track_id: &str) -> String {
    let mut out = String::new();
    out.push_str(album_id);
    out.push(KEY_SEP);
    out.push_str(&format!("{:08}", order));
    out.push(KEY_SEP);
    out.push_str(track_id);
    out
}

fn prefix_key(prefix: &str) -> String {
    let mut out = String::new();
    out.push_str(prefix);
    out.push(KEY_SEP);
    out
}

fn prefix_end(prefix: &str) -> String {
    let mut end = prefix.to_string();
    end.push('\u{10ffff}');
    end
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

fn split_key_last(value: &str) -> Result<(&str, &str), LibraryError> {
    let idx = value
        .rfind(KEY_SEP)
        .ok_or_else(|| LibraryError::KeyParse(value.to_string()))?;
    let next = idx + KEY_SEP.len_utf8();
    Ok((&value[..idx], &value[next..]))
}
