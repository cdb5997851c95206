use std::path::Path;
use std::process::{ExitStatus, Stdio};

use common::Track;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Preset {
    pub name: &'static str,
    /// Converter muxer name, compared against the source container for
    /// passthrough.
    pub container: &'static str,
    pub codec: &'static str,
    pub bitrate_kbps: Option<u32>,
    pub mime: &'static str,
}

pub const PRESETS: &[Preset] = &[
    Preset {
        name: "lossless",
        container: "flac",
        codec: "flac",
        bitrate_kbps: None,
        mime: "audio/flac",
    },
    Preset {
        name: "mp3_320",
        container: "mp3",
        codec: "libmp3lame",
        bitrate_kbps: Some(320),
        mime: "audio/mpeg",
    },
    Preset {
        name: "mp3_192",
        container: "mp3",
        codec: "libmp3lame",
        bitrate_kbps: Some(192),
        mime: "audio/mpeg",
    },
    Preset {
        name: "mp3_128",
        container: "mp3",
        codec: "libmp3lame",
        bitrate_kbps: Some(128),
        mime: "audio/mpeg",
    },
    Preset {
        name: "ogg_256",
        container: "ogg",
        codec: "libvorbis",
        bitrate_kbps: Some(256),
        mime: "audio/ogg",
    },
    Preset {
        name: "ogg_128",
        container: "ogg",
        codec: "libvorbis",
        bitrate_kbps: Some(128),
        mime: "audio/ogg",
    },
];

pub fn find_preset(name: &str) -> Option<&'static Preset> {
    let name = name.trim();
    let name = if name.eq_ignore_ascii_case("raw") {
        "lossless"
    } else {
        name
    };
    PRESETS
        .iter()
        .find(|preset| preset.name.eq_ignore_ascii_case(name))
}

impl Preset {
    /// Stream copy is only safe for whole files already in this preset's
    /// container; cue segments must be cut by re-encoding.
    pub fn allows_passthrough(&self, track: &Track) -> bool {
        if track.is_segment() || track.format.container() != self.container {
            return false;
        }
        match self.bitrate_kbps {
            None => true,
            Some(limit) => track.bitrate_kbps.map(|rate| rate <= limit).unwrap_or(false),
        }
    }
}

pub struct ConversionRequest<'a> {
    pub source: &'a Path,
    pub start_secs: f64,
    pub length_secs: Option<f64>,
    pub preset: &'a Preset,
    pub passthrough: bool,
}

pub fn build_args(global_args: &[String], request: &ConversionRequest<'_>) -> Vec<String> {
    let mut args: Vec<String> = global_args.to_vec();
    args.extend(
        ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .iter()
            .map(|value| value.to_string()),
    );
    args.push("-ss".to_string());
    args.push(format!("{:.3}", request.start_secs));
    args.push("-i".to_string());
    args.push(request.source.to_string_lossy().to_string());
    if let Some(length) = request.length_secs {
        args.push("-t".to_string());
        args.push(format!("{:.3}", length));
    }
    args.extend(
        ["-map", "0:a:0", "-vn"]
            .iter()
            .map(|value| value.to_string()),
    );
    args.push("-c:a".to_string());
    if request.passthrough {
        args.push("copy".to_string());
    } else {
        args.push(request.preset.codec.to_string());
        if let Some(bitrate) = request.preset.bitrate_kbps {
            args.push("-b:a".to_string());
            args.push(format!("{}k", bitrate));
        }
    }
    args.push("-f".to_string());
    args.push(request.preset.container.to_string());
    args.push("pipe:1".to_string());
    args
}

/// One running converter. The child is killed when this handle drops, so
/// every exit path of its owner reaps it.
pub struct ConversionProcess {
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

impl ConversionProcess {
    pub fn spawn(program: &str, args: &[String]) -> std::io::Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut collected = Vec::new();
                let _ = pipe.read_to_end(&mut collected).await;
                let start = collected.len().saturating_sub(STDERR_TAIL_BYTES);
                String::from_utf8_lossy(&collected[start..]).trim().to_string()
            })
        });

        Ok(Self { child, stderr })
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Kills the child and waits until it has been reaped.
    pub async fn terminate(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    pub async fn stderr_tail(&mut self) -> String {
        match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AudioFormat, SegmentRef};

    fn track(format: AudioFormat, bitrate: Option<u32>) -> Track {
        Track {
            id: "t".to_string(),
            album_id: "a".to_string(),
            source_key: "A/01.x".to_string(),
            file_relpath: "A/01.x".to_string(),
            title: "One".to_string(),
            artist: None,
            duration_secs: Some(200.0),
            track_no: 1,
            disc_no: None,
            format,
            bitrate_kbps: bitrate,
            segment: None,
        }
    }

    #[test]
    fn presets_resolve_by_name_and_alias() {
        assert_eq!(find_preset("raw").unwrap().name, "lossless");
        assert_eq!(find_preset("MP3_192").unwrap().bitrate_kbps, Some(192));
        assert!(find_preset("aac_256").is_none());
    }

    #[test]
    fn passthrough_needs_matching_container_and_bitrate() {
        let lossless = find_preset("lossless").unwrap();
        let mp3_192 = find_preset("mp3_192").unwrap();
        let ogg_128 = find_preset("ogg_128").unwrap();

        assert!(lossless.allows_passthrough(&track(AudioFormat::Flac, Some(900))));
        assert!(mp3_192.allows_passthrough(&track(AudioFormat::Mp3, Some(128))));
        assert!(!mp3_192.allows_passthrough(&track(AudioFormat::Mp3, Some(320))));
        assert!(!mp3_192.allows_passthrough(&track(AudioFormat::Mp3, None)));
        assert!(!ogg_128.allows_passthrough(&track(AudioFormat::Flac, Some(900))));

        let mut segment = track(AudioFormat::Flac, Some(900));
        segment.segment = Some(SegmentRef {
            start_secs: 0.0,
            end_secs: Some(10.0),
        });
        assert!(!lossless.allows_passthrough(&segment));
    }

    #[test]
    fn args_carry_window_and_codec() {
        let preset = find_preset("mp3_320").unwrap();
        let request = ConversionRequest {
            source: Path::new("/music/A/disc.flac"),
            start_secs: 310.0,
            length_secs: Some(310.0),
            preset,
            passthrough: false,
        };
        let args = build_args(&["-threads".to_string(), "1".to_string()], &request);
        let joined = args.join(" ");
        assert!(joined.starts_with("-threads 1 -hide_banner"));
        assert!(joined.contains("-ss 310.000 -i /music/A/disc.flac -t 310.000"));
        assert!(joined.ends_with("-c:a libmp3lame -b:a 320k -f mp3 pipe:1"));

        let copy = build_args(
            &[],
            &ConversionRequest {
                length_secs: None,
                passthrough: true,
                start_secs: 0.0,
                ..request
            },
        );
        assert!(!copy.contains(&"-t".to_string()));
        assert!(copy.join(" ").contains("-c:a copy -f mp3"));
    }
}
