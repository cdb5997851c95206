pub mod cue;

use std::path::Path;

use common::AudioFormat;
use lofty::error::LoftyError;
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};

pub use cue::{parse_cue, parse_cue_str, CueError, CueSheet, CueTrack};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TagInfo {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub track_no: Option<u16>,
    pub disc_no: Option<u16>,
    pub duration_secs: Option<f64>,
    pub bitrate_kbps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Audio(TagInfo),
    NotAudio,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Best-effort tag read. Files without an audio extension are `NotAudio`;
/// an audio file whose container cannot be parsed is an error.
pub fn extract(path: &Path) -> Result<Extraction, MetadataError> {
    let format = match AudioFormat::from_path(path) {
        Some(format) => format,
        None => return Ok(Extraction::NotAudio),
    };
    if !has_tag_reader(format) {
        return Ok(Extraction::Audio(TagInfo::default()));
    }
    read_tags(path).map(Extraction::Audio)
}

fn has_tag_reader(format: AudioFormat) -> bool {
    !matches!(format, AudioFormat::Tta)
}

fn read_tags(path: &Path) -> Result<TagInfo, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut info = TagInfo::default();

    let duration = properties.duration().as_secs_f64();
    if duration > 0.0 {
        info.duration_secs = Some(duration);
    }
    info.bitrate_kbps = properties.audio_bitrate().or(properties.overall_bitrate());

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.title = non_empty(tag.get_string(&ItemKey::TrackTitle));
        info.album = non_empty(tag.get_string(&ItemKey::AlbumTitle));
        info.album_artist = non_empty(tag.get_string(&ItemKey::AlbumArtist));
        info.artist = non_empty(tag.get_string(&ItemKey::TrackArtist));
        info.track_no = tag
            .get_string(&ItemKey::TrackNumber)
            .and_then(parse_u16);
        info.disc_no = tag
            .get_string(&ItemKey::DiscNumber)
            .and_then(parse_u16);
    }

    Ok(info)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_u16(text: &str) -> Option<u16> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn track_numbers_accept_totals() {
        assert_eq!(parse_u16("3/12"), Some(3));
        assert_eq!(parse_u16(" 7 "), Some(7));
        assert_eq!(parse_u16("A"), None);
    }

    #[test]
    fn non_audio_extensions_are_not_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "liner notes").unwrap();
        assert_eq!(extract(&path).unwrap(), Extraction::NotAudio);
    }

    #[test]
    fn broken_audio_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.flac");
        fs::write(&path, "definitely not flac").unwrap();
        assert!(extract(&path).is_err());
    }

    #[test]
    fn unsupported_containers_yield_empty_tags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.tta");
        fs::write(&path, [0u8; 16]).unwrap();
        assert_eq!(
            extract(&path).unwrap(),
            Extraction::Audio(TagInfo::default())
        );
    }
}
