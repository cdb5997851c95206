use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub relpath: String,
    pub name: String,
    pub artist: Option<String>,
    /// Directory mtime observed when the album was last indexed.
    pub last_modified_ns: u64,
    pub date_added: u64,
    pub cover_relpath: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub album_id: String,
    /// Reconciliation key: the file relpath, or `image#NN` for cue segments.
    pub source_key: String,
    pub file_relpath: String,
    pub title: String,
    pub artist: Option<String>,
    pub duration_secs: Option<f64>,
    pub track_no: u16,
    pub disc_no: Option<u16>,
    pub format: AudioFormat,
    pub bitrate_kbps: Option<u32>,
    pub segment: Option<SegmentRef>,
}

/// Window of a disc image that makes up one cue track. The image itself is
/// the owning track's `file_relpath`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentRef {
    pub start_secs: f64,
    /// `None` only for the last segment of an image with unknown duration.
    pub end_secs: Option<f64>,
}

impl SegmentRef {
    pub fn length_secs(&self) -> Option<f64> {
        self.end_secs.map(|end| end - self.start_secs)
    }
}

impl Track {
    pub fn is_segment(&self) -> bool {
        self.segment.is_some()
    }

    pub fn segment_key(image_relpath: &str, track_no: u16) -> String {
        format!("{}#{:02}", image_relpath, track_no)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Flac,
    Ogg,
    Opus,
    M4a,
    Wav,
    Tta,
    Ape,
    WavPack,
}

impl AudioFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
        match ext.as_str() {
            "mp3" => Some(AudioFormat::Mp3),
            "flac" => Some(AudioFormat::Flac),
            "ogg" | "oga" => Some(AudioFormat::Ogg),
            "opus" => Some(AudioFormat::Opus),
            "m4a" => Some(AudioFormat::M4a),
            "wav" => Some(AudioFormat::Wav),
            "tta" => Some(AudioFormat::Tta),
            "ape" => Some(AudioFormat::Ape),
            "wv" => Some(AudioFormat::WavPack),
            _ => None,
        }
    }

    pub fn is_lossless(self) -> bool {
        matches!(
            self,
            AudioFormat::Flac
                | AudioFormat::Wav
                | AudioFormat::Tta
                | AudioFormat::Ape
                | AudioFormat::WavPack
        )
    }

    pub fn can_be_disc_image(self) -> bool {
        self.is_lossless()
    }

    /// Container name as understood by the converter's `-f` flag.
    pub fn container(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Flac => "flac",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Opus => "opus",
            AudioFormat::M4a => "ipod",
            AudioFormat::Wav => "wav",
            AudioFormat::Tta => "tta",
            AudioFormat::Ape => "ape",
            AudioFormat::WavPack => "wv",
        }
    }
}

pub fn is_image_file(path: &Path) -> bool {
    let ext = match path.extension() {
        Some(ext) => ext.to_string_lossy().to_ascii_lowercase(),
        None => return false,
    };
    matches!(
        ext.as_str(),
        "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp"
    )
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

pub fn relpath_from(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(path_to_slash_string(rel))
}

pub fn join_relpath(root: &Path, relpath: &str) -> PathBuf {
    let mut out = PathBuf::from(root);
    for part in relpath.split('/') {
        if part.is_empty() {
            continue;
        }
        out.push(part);
    }
    out
}

fn path_to_slash_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    parts.join("/")
}
