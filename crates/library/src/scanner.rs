use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use common::{
    is_image_file, join_relpath, relpath_from, stable_id, Album, AudioFormat, SegmentRef, Track,
};
use metadata::{extract, parse_cue, CueSheet, Extraction, TagInfo};
use redb::{Database, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    album_name_key, album_track_key, decode_value, encode_value, now_secs, prefix_end,
    prefix_key, read_album_tracks, read_all_albums, split_key_last, LibraryError,
    ALBUMS_BY_NAME_TABLE, ALBUMS_TABLE, ALBUM_TRACKS_TABLE, PLAY_COUNTS_TABLE, TRACKS_TABLE,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Skip albums whose directory mtime matches the stored watermark.
    Incremental,
    /// Recompute every album; unchanged albums are still not rewritten.
    Full,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub albums_added: usize,
    pub albums_updated: usize,
    pub albums_removed: usize,
    pub albums_unchanged: usize,
    pub tracks_added: usize,
    pub tracks_updated: usize,
    pub tracks_removed: usize,
    pub failures: Vec<ScanFailure>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanFailure {
    pub path: String,
    pub reason: FailureReason,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    DirectoryUnreadable,
    TagUnreadable,
    CueUnparseable,
    CueImageMissing,
    CueImageDuplicate,
    SegmentInvalid,
}

impl ScanResult {
    fn fail(&mut self, root: &Path, path: &Path, reason: FailureReason, detail: String) {
        let path = relpath_from(root, path).unwrap_or_else(|| path.display().to_string());
        warn!("Scan failure {:?} at {}: {}", reason, path, detail);
        self.failures.push(ScanFailure {
            path,
            reason,
            detail,
        });
    }
}

struct AlbumScan {
    album: Album,
    tracks: Vec<Track>,
}

enum AlbumChange {
    Added,
    Updated,
}

struct TrackCounts {
    added: usize,
    updated: usize,
    removed: usize,
}

pub(crate) fn run_scan(
    root: &Path,
    db: &Database,
    mode: ScanMode,
) -> Result<ScanResult, LibraryError> {
    let root = fs::canonicalize(root)
        .ok()
        .filter(|path| path.is_dir())
        .ok_or_else(|| LibraryError::RootUnavailable(root.to_path_buf()))?;
    if fs::read_dir(&root).is_err() {
        return Err(LibraryError::RootUnavailable(root));
    }

    let mut result = ScanResult::default();
    let AlbumWalk {
        album_dirs,
        unreadable,
    } = collect_album_dirs(&root, &mut result);
    info!("Found {} album folders under {:?}", album_dirs.len(), root);

    let stored: HashMap<String, Album> = read_all_albums(db)?
        .into_iter()
        .map(|album| (album.relpath.clone(), album))
        .collect();
    let mut seen: HashSet<String> = HashSet::new();

    for dir in album_dirs {
        let relpath = match relpath_from(&root, &dir) {
            Some(rel) => rel,
            None => continue,
        };
        let previous = stored.get(&relpath);

        let mtime_ns = match dir_mtime_ns(&dir) {
            Ok(mtime) => mtime,
            Err(err) => {
                seen.insert(relpath);
                result.fail(&root, &dir, FailureReason::DirectoryUnreadable, err.to_string());
                continue;
            }
        };
        if mode == ScanMode::Incremental {
            if let Some(previous) = previous {
                if previous.last_modified_ns == mtime_ns {
                    seen.insert(relpath);
                    result.albums_unchanged += 1;
                    continue;
                }
            }
        }

        let date_added = previous.map(|album| album.date_added).unwrap_or_else(now_secs);
        let scan = match scan_album(&root, &dir, &relpath, mtime_ns, date_added, &mut result) {
            Some(scan) => scan,
            None => {
                // Unreadable listing: keep whatever was indexed before.
                seen.insert(relpath);
                continue;
            }
        };
        if scan.tracks.is_empty() {
            continue;
        }
        seen.insert(relpath);

        if album_is_current(db, &scan, previous)? {
            result.albums_unchanged += 1;
            continue;
        }

        let (change, counts) = reconcile_album(db, &scan, previous)?;
        match change {
            AlbumChange::Added => result.albums_added += 1,
            AlbumChange::Updated => result.albums_updated += 1,
        }
        result.tracks_added += counts.added;
        result.tracks_updated += counts.updated;
        result.tracks_removed += counts.removed;
        debug!(
            "Indexed {} ({} tracks)",
            scan.album.relpath,
            scan.tracks.len()
        );
    }

    // Albums under a directory the walk could not read are kept as they are.
    for relpath in stored.keys() {
        let path = join_relpath(&root, relpath);
        if unreadable.iter().any(|dir| path.starts_with(dir)) {
            seen.insert(relpath.clone());
        }
    }

    for (relpath, album) in &stored {
        if seen.contains(relpath) {
            continue;
        }
        let removed = remove_album(db, album)?;
        result.albums_removed += 1;
        result.tracks_removed += removed;
        info!("Removed album {} ({} tracks)", relpath, removed);
    }

    info!(
        "Scan finished: {} added, {} updated, {} removed, {} unchanged, {} failures",
        result.albums_added,
        result.albums_updated,
        result.albums_removed,
        result.albums_unchanged,
        result.failures.len()
    );
    Ok(result)
}

fn album_is_current(
    db: &Database,
    scan: &AlbumScan,
    previous: Option<&Album>,
) -> Result<bool, LibraryError> {
    match previous {
        Some(previous) if *previous == scan.album => {
            Ok(read_album_tracks(db, &scan.album.id)? == scan.tracks)
        }
        _ => Ok(false),
    }
}

/// Replaces the album row and its whole track set in one write transaction.
fn reconcile_album(
    db: &Database,
    scan: &AlbumScan,
    previous: Option<&Album>,
) -> Result<(AlbumChange, TrackCounts), LibraryError> {
    let album = &scan.album;
    let write_txn = db.begin_write()?;
    let counts = {
        let mut albums = write_txn.open_table(ALBUMS_TABLE)?;
        let mut albums_by_name = write_txn.open_table(ALBUMS_BY_NAME_TABLE)?;
        let mut tracks = write_txn.open_table(TRACKS_TABLE)?;
        let mut album_tracks = write_txn.open_table(ALBUM_TRACKS_TABLE)?;
        let mut plays = write_txn.open_table(PLAY_COUNTS_TABLE)?;

        let prefix = prefix_key(&album.id);
        let end = prefix_end(&prefix);
        let mut index_keys = Vec::new();
        let mut old_ids = Vec::new();
        for entry in album_tracks.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            let (_, track_id) = split_key_last(&key)?;
            old_ids.push(track_id.to_string());
            index_keys.push(key);
        }
        for key in &index_keys {
            album_tracks.remove(key.as_str())?;
        }

        if let Some(previous) = previous {
            albums_by_name.remove(album_name_key(previous).as_str())?;
        }
        albums.insert(album.id.as_str(), encode_value(album)?.as_slice())?;
        albums_by_name.insert(album_name_key(album).as_str(), album.id.as_bytes())?;

        let new_ids: HashSet<&str> = scan.tracks.iter().map(|t| t.id.as_str()).collect();
        let mut counts = TrackCounts {
            added: 0,
            updated: 0,
            removed: 0,
        };
        for old_id in &old_ids {
            if !new_ids.contains(old_id.as_str()) {
                tracks.remove(old_id.as_str())?;
                plays.remove(old_id.as_str())?;
                counts.removed += 1;
            }
        }

        for (order, track) in scan.tracks.iter().enumerate() {
            let stored: Option<Track> = match tracks.get(track.id.as_str())? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            match stored {
                None => counts.added += 1,
                Some(stored) if stored != *track => counts.updated += 1,
                Some(_) => {}
            }
            tracks.insert(track.id.as_str(), encode_value(track)?.as_slice())?;
            album_tracks.insert(
                album_track_key(&album.id, order, &track.id).as_str(),
                track.id.as_bytes(),
            )?;
        }
        counts
    };
    write_txn.commit()?;

    let change = if previous.is_some() {
        AlbumChange::Updated
    } else {
        AlbumChange::Added
    };
    Ok((change, counts))
}

fn remove_album(db: &Database, album: &Album) -> Result<usize, LibraryError> {
    let write_txn = db.begin_write()?;
    let removed = {
        let mut albums = write_txn.open_table(ALBUMS_TABLE)?;
        let mut albums_by_name = write_txn.open_table(ALBUMS_BY_NAME_TABLE)?;
        let mut tracks = write_txn.open_table(TRACKS_TABLE)?;
        let mut album_tracks = write_txn.open_table(ALBUM_TRACKS_TABLE)?;
        let mut plays = write_txn.open_table(PLAY_COUNTS_TABLE)?;

        let prefix = prefix_key(&album.id);
        let end = prefix_end(&prefix);
        let mut index_keys = Vec::new();
        for entry in album_tracks.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            index_keys.push(entry.0.value().to_string());
        }
        for key in &index_keys {
            let (_, track_id) = split_key_last(key)?;
            tracks.remove(track_id)?;
            plays.remove(track_id)?;
            album_tracks.remove(key.as_str())?;
        }
        albums_by_name.remove(album_name_key(album).as_str())?;
        albums.remove(album.id.as_str())?;
        index_keys.len()
    };
    write_txn.commit()?;
    Ok(removed)
}

struct AlbumWalk {
    /// Leaf directories: those holding audio files with no audio anywhere below.
    album_dirs: Vec<PathBuf>,
    /// Directories whose contents could not be listed.
    unreadable: Vec<PathBuf>,
}

fn collect_album_dirs(root: &Path, result: &mut ScanResult) -> AlbumWalk {
    let mut dirs_with_audio = HashSet::new();
    let mut unreadable = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf());
                result.fail(root, &path, FailureReason::DirectoryUnreadable, err.to_string());
                unreadable.push(path);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if AudioFormat::from_path(entry.path()).is_some() {
            if let Some(parent) = entry.path().parent() {
                dirs_with_audio.insert(parent.to_path_buf());
            }
        }
    }

    let mut has_descendant_audio = HashSet::new();
    for dir in &dirs_with_audio {
        let mut ancestor = dir.parent();
        while let Some(current) = ancestor {
            if !current.starts_with(root) {
                break;
            }
            has_descendant_audio.insert(current.to_path_buf());
            if current == root {
                break;
            }
            ancestor = current.parent();
        }
    }

    let mut album_dirs: Vec<PathBuf> = dirs_with_audio
        .into_iter()
        .filter(|dir| !has_descendant_audio.contains(dir))
        .collect();
    album_dirs.sort();
    AlbumWalk {
        album_dirs,
        unreadable,
    }
}

fn dir_mtime_ns(dir: &Path) -> std::io::Result<u64> {
    let modified = fs::metadata(dir)?.modified()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).unwrap_or_default();
    Ok(since_epoch.as_nanos() as u64)
}

fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn is_cue_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("cue"))
        .unwrap_or(false)
}

/// A cue sheet that resolved to an image and lowered cleanly.
struct Disc {
    sheet: CueSheet,
    image: PathBuf,
    image_relpath: String,
    format: AudioFormat,
    tags: TagInfo,
    bounds: Vec<(f64, Option<f64>)>,
}

fn scan_album(
    root: &Path,
    dir: &Path,
    relpath: &str,
    mtime_ns: u64,
    date_added: u64,
    result: &mut ScanResult,
) -> Option<AlbumScan> {
    let files = match list_files(dir) {
        Ok(files) => files,
        Err(err) => {
            result.fail(root, dir, FailureReason::DirectoryUnreadable, err.to_string());
            return None;
        }
    };

    let mut discs: Vec<Disc> = Vec::new();
    let mut claimed: HashSet<PathBuf> = HashSet::new();
    for cue_path in files.iter().filter(|path| is_cue_file(path)) {
        if let Some(disc) = load_disc(root, cue_path, &files, &claimed, result) {
            claimed.insert(disc.image.clone());
            discs.push(disc);
        }
    }

    let mut plain: Vec<(PathBuf, String, TagInfo)> = Vec::new();
    for path in &files {
        if claimed.contains(path) {
            continue;
        }
        let file_relpath = match relpath_from(root, path) {
            Some(rel) => rel,
            None => continue,
        };
        let tags = match extract(path) {
            Ok(Extraction::Audio(tags)) => tags,
            Ok(Extraction::NotAudio) => continue,
            Err(err) => {
                result.fail(root, path, FailureReason::TagUnreadable, err.to_string());
                TagInfo::default()
            }
        };
        plain.push((path.clone(), file_relpath, tags));
    }

    let first_tags = discs
        .iter()
        .map(|disc| &disc.tags)
        .chain(plain.iter().map(|(_, _, tags)| tags));
    let album_name = discs
        .iter()
        .find_map(|disc| disc.sheet.title.clone())
        .or_else(|| first_tags.clone().find_map(|tags| tags.album.clone()))
        .or_else(|| {
            dir.file_name()
                .map(|name| name.to_string_lossy().to_string())
        })
        .unwrap_or_else(|| "Unknown Album".to_string());
    let album_artist = discs
        .iter()
        .find_map(|disc| disc.sheet.performer.clone())
        .or_else(|| first_tags.clone().find_map(|tags| tags.album_artist.clone()))
        .or_else(|| first_tags.clone().find_map(|tags| tags.artist.clone()));
    let cover_relpath = files
        .iter()
        .find(|path| is_image_file(path))
        .and_then(|path| relpath_from(root, path));

    let album_id = stable_id(relpath);
    let numbered_discs = discs.len() > 1;
    let mut tracks = Vec::new();

    for (disc_idx, disc) in discs.iter().enumerate() {
        let disc_no = if numbered_discs {
            Some(disc_idx as u16 + 1)
        } else {
            None
        };
        for (cue_track, (start, end)) in disc.sheet.tracks.iter().zip(&disc.bounds) {
            let source_key = Track::segment_key(&disc.image_relpath, cue_track.number);
            let segment = SegmentRef {
                start_secs: *start,
                end_secs: *end,
            };
            tracks.push(Track {
                id: stable_id(&source_key),
                album_id: album_id.clone(),
                source_key,
                file_relpath: disc.image_relpath.clone(),
                title: cue_track
                    .title
                    .clone()
                    .unwrap_or_else(|| format!("Track {:02}", cue_track.number)),
                artist: cue_track
                    .performer
                    .clone()
                    .or_else(|| album_artist.clone()),
                duration_secs: segment.length_secs(),
                track_no: cue_track.number,
                disc_no,
                format: disc.format,
                bitrate_kbps: disc.tags.bitrate_kbps,
                segment: Some(segment),
            });
        }
    }

    let mut plain_tracks = Vec::new();
    for (position, (path, file_relpath, tags)) in plain.into_iter().enumerate() {
        let format = match AudioFormat::from_path(&path) {
            Some(format) => format,
            None => continue,
        };
        plain_tracks.push(Track {
            id: stable_id(&file_relpath),
            album_id: album_id.clone(),
            source_key: file_relpath.clone(),
            file_relpath,
            title: tags.title.unwrap_or_else(|| file_stem(&path)),
            artist: tags.artist.or_else(|| album_artist.clone()),
            duration_secs: tags.duration_secs,
            track_no: tags.track_no.unwrap_or(position as u16 + 1),
            disc_no: tags.disc_no,
            format,
            bitrate_kbps: tags.bitrate_kbps,
            segment: None,
        });
    }
    plain_tracks.sort_by(|a, b| {
        (a.disc_no.unwrap_or(0), a.track_no, &a.file_relpath).cmp(&(
            b.disc_no.unwrap_or(0),
            b.track_no,
            &b.file_relpath,
        ))
    });
    tracks.extend(plain_tracks);

    Some(AlbumScan {
        album: Album {
            id: album_id,
            relpath: relpath.to_string(),
            name: album_name,
            artist: album_artist,
            last_modified_ns: mtime_ns,
            date_added,
            cover_relpath,
        },
        tracks,
    })
}

fn load_disc(
    root: &Path,
    cue_path: &Path,
    files: &[PathBuf],
    claimed: &HashSet<PathBuf>,
    result: &mut ScanResult,
) -> Option<Disc> {
    let sheet = match parse_cue(cue_path) {
        Ok(sheet) => sheet,
        Err(err) => {
            result.fail(root, cue_path, FailureReason::CueUnparseable, err.to_string());
            return None;
        }
    };
    let (image, format) = match resolve_image(cue_path, &sheet, files) {
        Some(found) => found,
        None => {
            let detail = match &sheet.file {
                Some(file) => format!("image '{}' not found", file),
                None => "no FILE entry and no image with the sheet's name".to_string(),
            };
            result.fail(root, cue_path, FailureReason::CueImageMissing, detail);
            return None;
        }
    };
    if claimed.contains(&image) {
        let detail = format!("image {:?} already claimed by another sheet", image.file_name());
        result.fail(root, cue_path, FailureReason::CueImageDuplicate, detail);
        return None;
    }
    let image_relpath = relpath_from(root, &image)?;

    let tags = match extract(&image) {
        Ok(Extraction::Audio(tags)) => tags,
        Ok(Extraction::NotAudio) => TagInfo::default(),
        Err(err) => {
            result.fail(root, &image, FailureReason::TagUnreadable, err.to_string());
            TagInfo::default()
        }
    };
    let bounds = match segment_bounds(&sheet, tags.duration_secs) {
        Ok(bounds) => bounds,
        Err(detail) => {
            result.fail(root, cue_path, FailureReason::SegmentInvalid, detail);
            return None;
        }
    };

    Some(Disc {
        sheet,
        image,
        image_relpath,
        format,
        tags,
        bounds,
    })
}

/// The sheet's `FILE` next to the sheet, then any disc image sharing the
/// `FILE` stem, then one sharing the sheet's own stem. Names compare
/// case-insensitively.
fn resolve_image(
    cue_path: &Path,
    sheet: &CueSheet,
    files: &[PathBuf],
) -> Option<(PathBuf, AudioFormat)> {
    let as_image =
        |path: &PathBuf| AudioFormat::from_path(path).map(|format| (path.clone(), format));
    let disc_image_with_stem = |stem: &OsStr| {
        files
            .iter()
            .filter(|path| path.file_stem().is_some_and(|own| same_name(own, stem)))
            .filter_map(as_image)
            .find(|(_, format)| format.can_be_disc_image())
    };

    if let (Some(file), Some(dir)) = (&sheet.file, cue_path.parent()) {
        let named = dir.join(file);
        if let Some(name) = named.file_name() {
            let exact = files
                .iter()
                .filter(|path| path.parent() == named.parent())
                .find(|path| path.file_name().is_some_and(|own| same_name(own, name)))
                .and_then(as_image);
            if exact.is_some() {
                return exact;
            }
        }
        if let Some(found) = named.file_stem().and_then(disc_image_with_stem) {
            return Some(found);
        }
    }

    cue_path.file_stem().and_then(disc_image_with_stem)
}

fn same_name(a: &OsStr, b: &OsStr) -> bool {
    a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
}

/// Lowers cue offsets into contiguous windows over `[0, duration)`.
fn segment_bounds(
    sheet: &CueSheet,
    duration: Option<f64>,
) -> Result<Vec<(f64, Option<f64>)>, String> {
    if let Some(duration) = duration {
        if let Some(track) = sheet.tracks.iter().find(|t| t.start_secs >= duration) {
            return Err(format!(
                "track {} starts at {:.3}s, past the image end at {:.3}s",
                track.number, track.start_secs, duration
            ));
        }
    }

    let count = sheet.tracks.len();
    let bounds = sheet
        .tracks
        .iter()
        .enumerate()
        .map(|(idx, track)| {
            let start = if idx == 0 { 0.0 } else { track.start_secs };
            let end = if idx + 1 == count {
                duration
            } else {
                track.end_secs
            };
            (start, end)
        })
        .collect();
    Ok(bounds)
}
