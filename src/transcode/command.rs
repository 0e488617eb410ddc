//! ffmpeg argument builders per media profile

use std::ffi::OsString;
use std::path::Path;

use super::{AudioFormat, MediaProfile, TranscodeSpec};

/// Per-resolution encode settings
struct ResolutionSettings {
    width: u32,
    height: u32,
    maxrate: &'static str,
    bufsize: &'static str,
}

fn resolution_settings(profile: &MediaProfile) -> Option<ResolutionSettings> {
    match profile {
        MediaProfile::Video720p => Some(ResolutionSettings {
            width: 1280,
            height: 720,
            maxrate: "2000k",
            bufsize: "4000k",
        }),
        MediaProfile::Video480p => Some(ResolutionSettings {
            width: 854,
            height: 480,
            maxrate: "1000k",
            bufsize: "2000k",
        }),
        MediaProfile::Video360p => Some(ResolutionSettings {
            width: 640,
            height: 360,
            maxrate: "500k",
            bufsize: "1000k",
        }),
        _ => None,
    }
}

/// Build the ffmpeg argument list for a transcode invocation
///
/// `-y` overwrites a partial output left by a prior attempt, `-nostdin`
/// keeps ffmpeg from blocking on a terminal that isn't there. The relaxed
/// flag trades quality for speed (faster preset, higher CRF) and is used on
/// the single timeout retry.
pub(super) fn build_args(spec: &TranscodeSpec) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-nostdin".into(),
        "-i".into(),
        spec.input.as_os_str().to_os_string(),
    ];

    match &spec.profile {
        MediaProfile::Video720p | MediaProfile::Video480p | MediaProfile::Video360p => {
            // resolution_settings covers every video profile matched here
            if let Some(settings) = resolution_settings(&spec.profile) {
                let (preset, crf) = if spec.relaxed {
                    ("veryfast", "28")
                } else {
                    ("medium", "23")
                };
                args.extend::<Vec<OsString>>(vec![
                    "-vf".into(),
                    format!("scale={}:{}", settings.width, settings.height).into(),
                    "-c:v".into(),
                    "libx264".into(),
                    "-preset".into(),
                    preset.into(),
                    "-crf".into(),
                    crf.into(),
                    "-maxrate".into(),
                    settings.maxrate.into(),
                    "-bufsize".into(),
                    settings.bufsize.into(),
                    "-pix_fmt".into(),
                    "yuv420p".into(),
                    "-c:a".into(),
                    "aac".into(),
                    "-b:a".into(),
                    "128k".into(),
                    "-ar".into(),
                    "44100".into(),
                    "-movflags".into(),
                    "+faststart".into(),
                    "-f".into(),
                    "mp4".into(),
                ]);
            }
        }
        MediaProfile::AudioExtract { format, bitrate } => {
            let codec = match format {
                AudioFormat::Mp3 => "libmp3lame",
                AudioFormat::Ogg => "libvorbis",
                AudioFormat::Wav => "pcm_s16le",
            };
            args.extend::<Vec<OsString>>(vec![
                "-vn".into(),
                "-c:a".into(),
                codec.into(),
                "-b:a".into(),
                bitrate.clone().into(),
                "-ar".into(),
                "44100".into(),
                "-ac".into(),
                "2".into(),
                "-f".into(),
                format.container().into(),
            ]);
        }
        MediaProfile::Remux => {
            args.extend::<Vec<OsString>>(vec![
                "-c".into(),
                "copy".into(),
                "-movflags".into(),
                "+faststart".into(),
                "-f".into(),
                "mp4".into(),
            ]);
        }
    }

    args.push(spec.output.as_os_str().to_os_string());
    args
}

/// Whether a profile would change the source at all
///
/// A remux of a file already in the target container is a pass-through: the
/// transcode phase is skipped entirely and the staged source is uploaded
/// as-is.
pub fn is_passthrough(profile: &MediaProfile, input: &Path) -> bool {
    match profile {
        MediaProfile::Remux => {
            let ext = input
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            matches!(ext.as_deref(), Some("mp4") | Some("m4v"))
        }
        _ => false,
    }
}
