use std::fs;
use std::path::Path;

const FRAMES_PER_SECOND: f64 = 75.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CueSheet {
    pub title: Option<String>,
    pub performer: Option<String>,
    pub genre: Option<String>,
    pub date: Option<String>,
    pub file: Option<String>,
    pub tracks: Vec<CueTrack>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CueTrack {
    pub number: u16,
    pub title: Option<String>,
    pub performer: Option<String>,
    pub start_secs: f64,
    /// Start of the following track; `None` for the last track.
    pub end_secs: Option<f64>,
}

#[derive(Debug)]
pub enum CueError {
    Io(std::io::Error),
    InvalidTrack { line: usize },
    InvalidTime { line: usize, value: String },
    MissingIndex { track: u16 },
    MultipleFiles { line: usize },
    NonIncreasing { track: u16 },
    Empty,
}

impl std::fmt::Display for CueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CueError::Io(err) => write!(f, "io error: {}", err),
            CueError::InvalidTrack { line } => write!(f, "invalid TRACK on line {}", line),
            CueError::InvalidTime { line, value } => {
                write!(f, "invalid INDEX time '{}' on line {}", value, line)
            }
            CueError::MissingIndex { track } => write!(f, "track {} has no INDEX 01", track),
            CueError::MultipleFiles { line } => {
                write!(f, "second FILE entry on line {}; one image per sheet", line)
            }
            CueError::NonIncreasing { track } => {
                write!(f, "track {} does not start after the previous track", track)
            }
            CueError::Empty => write!(f, "cue sheet has no tracks"),
        }
    }
}

impl std::error::Error for CueError {}

impl From<std::io::Error> for CueError {
    fn from(err: std::io::Error) -> Self {
        CueError::Io(err)
    }
}

pub fn parse_cue(path: &Path) -> Result<CueSheet, CueError> {
    let bytes = fs::read(path)?;
    parse_cue_str(&decode_text(&bytes))
}

pub fn parse_cue_str(input: &str) -> Result<CueSheet, CueError> {
    let mut sheet = CueSheet::default();
    let mut current: Option<PendingTrack> = None;
    let mut pending: Vec<PendingTrack> = Vec::new();

    for (idx, raw) in input.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = split_command(line);
        match command.to_ascii_uppercase().as_str() {
            "TITLE" => {
                let value = unquote(rest);
                match current.as_mut() {
                    Some(track) => track.title = value,
                    None => sheet.title = value,
                }
            }
            "PERFORMER" => {
                let value = unquote(rest);
                match current.as_mut() {
                    Some(track) => track.performer = value,
                    None => sheet.performer = value,
                }
            }
            "FILE" => {
                if sheet.file.is_some() {
                    return Err(CueError::MultipleFiles { line: line_no });
                }
                sheet.file = parse_file_name(rest);
            }
            "REM" => {
                let (key, value) = split_command(rest);
                match key.to_ascii_uppercase().as_str() {
                    "GENRE" => sheet.genre = unquote(value),
                    "DATE" => sheet.date = unquote(value),
                    _ => {}
                }
            }
            "TRACK" => {
                if let Some(track) = current.take() {
                    pending.push(track);
                }
                let number = rest
                    .split_whitespace()
                    .next()
                    .and_then(|value| value.parse::<u16>().ok())
                    .ok_or(CueError::InvalidTrack { line: line_no })?;
                current = Some(PendingTrack::new(number));
            }
            "INDEX" => {
                let mut parts = rest.split_whitespace();
                let index = parts.next().unwrap_or("");
                let time = parts.next().unwrap_or("");
                if index != "01" && index != "1" {
                    continue;
                }
                let start = parse_time(time).ok_or_else(|| CueError::InvalidTime {
                    line: line_no,
                    value: time.to_string(),
                })?;
                if let Some(track) = current.as_mut() {
                    track.start_secs = Some(start);
                }
            }
            _ => {}
        }
    }
    if let Some(track) = current.take() {
        pending.push(track);
    }
    if pending.is_empty() {
        return Err(CueError::Empty);
    }

    let mut tracks: Vec<CueTrack> = Vec::with_capacity(pending.len());
    for track in pending {
        let start_secs = track
            .start_secs
            .ok_or(CueError::MissingIndex {
                track: track.number,
            })?;
        if let Some(prev) = tracks.last_mut() {
            if start_secs <= prev.start_secs {
                return Err(CueError::NonIncreasing {
                    track: track.number,
                });
            }
            prev.end_secs = Some(start_secs);
        }
        tracks.push(CueTrack {
            number: track.number,
            title: track.title,
            performer: track.performer,
            start_secs,
            end_secs: None,
        });
    }
    sheet.tracks = tracks;
    Ok(sheet)
}

/// `mm:ss:ff` with 75 frames per second.
pub fn parse_time(value: &str) -> Option<f64> {
    let mut parts = value.trim().split(':');
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    let frames: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || seconds >= 60 || frames >= 75 {
        return None;
    }
    let whole = minutes.checked_mul(60)?.checked_add(seconds)?;
    Some(whole as f64 + frames as f64 / FRAMES_PER_SECOND)
}

struct PendingTrack {
    number: u16,
    title: Option<String>,
    performer: Option<String>,
    start_secs: Option<f64>,
}

impl PendingTrack {
    fn new(number: u16) -> Self {
        Self {
            number,
            title: None,
            performer: None,
            start_secs: None,
        }
    }
}

fn split_command(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(idx) => (&line[..idx], line[idx..].trim()),
        None => (line, ""),
    }
}

fn unquote(value: &str) -> Option<String> {
    let value = value.trim();
    let inner = if let Some(stripped) = value.strip_prefix('"') {
        match stripped.find('"') {
            Some(end) => &stripped[..end],
            None => stripped,
        }
    } else {
        value
    };
    let inner = inner.trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

fn parse_file_name(rest: &str) -> Option<String> {
    let rest = rest.trim();
    if rest.starts_with('"') {
        return unquote(rest);
    }
    // Unquoted names keep inner spaces; the trailing word is the file type.
    match rest.rfind(char::is_whitespace) {
        Some(idx) => unquote(&rest[..idx]),
        None => unquote(rest),
    }
}

fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE_TRACKS: &str = "REM GENRE Rock\r\nREM DATE 1999\r\nPERFORMER \"The Band\"\r\nTITLE \"Live Disc\"\r\nFILE \"Live Disc.flac\" WAVE\r\n  TRACK 01 AUDIO\r\n    TITLE \"Opening\"\r\n    INDEX 01 00:00:00\r\n  TRACK 02 AUDIO\r\n    TITLE \"Middle\"\r\n    PERFORMER \"Guest\"\r\n    INDEX 00 04:58:00\r\n    INDEX 01 05:00:00\r\n  TRACK 03 AUDIO\r\n    TITLE \"Closing\"\r\n    INDEX 01 10:20:00\r\n";

    #[test]
    fn parses_frames_as_seventy_fifths() {
        assert_eq!(parse_time("00:00:00"), Some(0.0));
        assert_eq!(parse_time("01:02:15"), Some(62.2));
        assert_eq!(parse_time("74:59:74"), Some(4499.0 + 74.0 / 75.0));
        assert_eq!(parse_time("00:61:00"), None);
        assert_eq!(parse_time("00:00:75"), None);
        assert_eq!(parse_time("1:2"), None);
    }

    #[test]
    fn parses_sheet_and_chains_end_offsets() {
        let sheet = parse_cue_str(THREE_TRACKS).unwrap();
        assert_eq!(sheet.title.as_deref(), Some("Live Disc"));
        assert_eq!(sheet.performer.as_deref(), Some("The Band"));
        assert_eq!(sheet.genre.as_deref(), Some("Rock"));
        assert_eq!(sheet.date.as_deref(), Some("1999"));
        assert_eq!(sheet.file.as_deref(), Some("Live Disc.flac"));

        let bounds: Vec<(u16, f64, Option<f64>)> = sheet
            .tracks
            .iter()
            .map(|t| (t.number, t.start_secs, t.end_secs))
            .collect();
        assert_eq!(
            bounds,
            vec![
                (1, 0.0, Some(300.0)),
                (2, 300.0, Some(620.0)),
                (3, 620.0, None),
            ]
        );
        assert_eq!(sheet.tracks[1].performer.as_deref(), Some("Guest"));
        assert_eq!(sheet.tracks[2].title.as_deref(), Some("Closing"));
    }

    #[test]
    fn unquoted_file_names_drop_the_type() {
        let sheet =
            parse_cue_str("FILE my disc.wav WAVE\nTRACK 1 AUDIO\nINDEX 01 00:00:00\n").unwrap();
        assert_eq!(sheet.file.as_deref(), Some("my disc.wav"));
    }

    #[test]
    fn rejects_track_without_index() {
        let err = parse_cue_str("FILE \"a.flac\" WAVE\nTRACK 01 AUDIO\nTITLE \"x\"\n").unwrap_err();
        assert!(matches!(err, CueError::MissingIndex { track: 1 }));
    }

    #[test]
    fn rejects_bad_times_loudly() {
        let err =
            parse_cue_str("FILE \"a.flac\" WAVE\nTRACK 01 AUDIO\nINDEX 01 0a:00:00\n").unwrap_err();
        assert!(matches!(err, CueError::InvalidTime { line: 3, .. }));
    }

    #[test]
    fn oversized_minutes_are_invalid_times() {
        assert_eq!(parse_time("307445734561825862:00:00"), None);
        assert_eq!(parse_time("18446744073709551615:00:00"), None);
        let err = parse_cue_str(
            "FILE \"a.flac\" WAVE\nTRACK 01 AUDIO\nINDEX 01 307445734561825862:00:00\n",
        )
        .unwrap_err();
        assert!(matches!(err, CueError::InvalidTime { line: 3, .. }));
    }

    #[test]
    fn rejects_non_increasing_starts() {
        let input = "FILE \"a.flac\" WAVE\nTRACK 01 AUDIO\nINDEX 01 01:00:00\nTRACK 02 AUDIO\nINDEX 01 01:00:00\n";
        let err = parse_cue_str(input).unwrap_err();
        assert!(matches!(err, CueError::NonIncreasing { track: 2 }));
    }

    #[test]
    fn rejects_multi_file_sheets() {
        let input = "FILE \"a.flac\" WAVE\nTRACK 01 AUDIO\nINDEX 01 00:00:00\nFILE \"b.flac\" WAVE\nTRACK 02 AUDIO\nINDEX 01 00:00:00\n";
        let err = parse_cue_str(input).unwrap_err();
        assert!(matches!(err, CueError::MultipleFiles { line: 4 }));
    }

    #[test]
    fn rejects_empty_sheets() {
        assert!(matches!(
            parse_cue_str("TITLE \"nothing\"\n").unwrap_err(),
            CueError::Empty
        ));
    }

    #[test]
    fn decodes_latin1_and_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"TITLE \"ok\"");
        assert_eq!(decode_text(&bytes), "TITLE \"ok\"");
        assert_eq!(decode_text(&[b'C', 0xE9]), "C\u{e9}");
    }
}
