//! Audio assembly — joins per-chunk segments into the final narration.
//!
//! Two [`Assembler`]s ship with the crate:
//!
//! * [`FfmpegConcat`] hands the segments to `ffmpeg`'s concat demuxer with
//!   stream copy (`-c copy`).  No re-encoding happens, which is only valid
//!   because every segment comes from the same synthesizer with one fixed
//!   output format.
//! * [`WavJoin`] appends the samples of same-format WAV segments in process with
//!   `hound`, for providers configured to emit WAV.
//!
//! ## Scratch protocol (ffmpeg)
//!
//! 1. Create a private temporary directory.
//! 2. Write every segment as `segment-NNNNNN.<ext>` (zero-padded index).
//! 3. Sort the written names and write `segments.txt`, one `file '…'` line each.
//! 4. Run `ffmpeg -f concat -safe 0 -i segments.txt -c copy narration.<ext>`.
//! 5. Read the output into memory.
//!
//! The directory is removed afterwards whether or not any step failed.

use std::{
    borrow::Cow,
    io::Cursor,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::synth::AudioFormat;

/// Encoded audio for one chunk; `index` is the 0-based chunk position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSegment {
    pub index: usize,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("no audio segments to assemble")]
    NoSegments,

    #[error("scratch file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot run '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("concatenation tool exited with {status}: {stderr}")]
    Tool { status: String, stderr: String },

    #[error("concatenation produced no audio")]
    EmptyOutput,

    #[error("WAV segment {index} does not match the first segment's format")]
    FormatMismatch { index: usize },

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("assembly task failed: {0}")]
    Task(String),
}

/// Merges ordered, same-format audio segments into one buffer.
#[async_trait]
pub trait Assembler: Send + Sync {
    async fn concatenate(&self, segments: Vec<AudioSegment>) -> Result<Vec<u8>, AssemblyError>;
}

/// Put segments in chunk order and reject an empty list.
fn ordered(mut segments: Vec<AudioSegment>) -> Result<Vec<AudioSegment>, AssemblyError> {
    if segments.is_empty() {
        return Err(AssemblyError::NoSegments);
    }
    segments.sort_by_key(|s| s.index);
    Ok(segments)
}

// ─────────────────────────────────────────────────────────────────────────────
// ffmpeg concat demuxer
// ─────────────────────────────────────────────────────────────────────────────

/// Stream-copy concatenation through an external `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegConcat {
    program: PathBuf,
    program_args: Vec<String>,
    format: AudioFormat,
    scratch_root: Option<PathBuf>,
}

impl FfmpegConcat {
    pub fn new(program: impl Into<PathBuf>, format: AudioFormat) -> Self {
        Self { program: program.into(), program_args: Vec::new(), format, scratch_root: None }
    }

    /// Arguments placed before the concat arguments, for wrapper programs.
    pub fn with_program_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Create scratch directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    fn scratch_dir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("narrate-");
        match &self.scratch_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
    }

    async fn run_in(&self, dir: &Path, segments: &[AudioSegment]) -> Result<Vec<u8>, AssemblyError> {
        let ext = self.format.extension();

        let mut names = Vec::with_capacity(segments.len());
        for segment in segments {
            let name = format!("segment-{:06}.{ext}", segment.index);
            tokio::fs::write(dir.join(&name), &segment.bytes).await?;
            names.push(name);
        }
        // Directory listing order is unspecified; the manifest order is ours.
        names.sort();

        let manifest = dir.join("segments.txt");
        tokio::fs::write(&manifest, manifest_contents(dir, &names)).await?;

        let output = dir.join(format!("narration.{ext}"));
        let result = Command::new(&self.program)
            .args(&self.program_args)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-f", "concat", "-safe", "0", "-i"])
            .arg(&manifest)
            .args(["-c", "copy"])
            .arg(&output)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| AssemblyError::Spawn { program: self.program.display().to_string(), source })?;

        if !result.status.success() {
            return Err(AssemblyError::Tool {
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        let audio = tokio::fs::read(&output).await?;
        if audio.is_empty() {
            return Err(AssemblyError::EmptyOutput);
        }
        Ok(audio)
    }
}

/// concat demuxer manifest; single quotes in paths are escaped as `'\''`.
fn manifest_contents(dir: &Path, names: &[String]) -> String {
    names
        .iter()
        .map(|name| {
            let path = dir.join(name).display().to_string().replace('\'', r"'\''");
            format!("file '{path}'\n")
        })
        .collect()
}

#[async_trait]
impl Assembler for FfmpegConcat {
    async fn concatenate(&self, segments: Vec<AudioSegment>) -> Result<Vec<u8>, AssemblyError> {
        let mut segments = ordered(segments)?;
        if segments.len() == 1 {
            return Ok(segments.remove(0).bytes);
        }

        let scratch = self.scratch_dir()?;
        let result = self.run_in(scratch.path(), &segments).await;
        drop(segments);

        let dir = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to remove scratch directory");
        }

        if let Ok(audio) = &result {
            tracing::debug!(bytes = audio.len(), "ffmpeg concat finished");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process WAV join
// ─────────────────────────────────────────────────────────────────────────────

/// Appends the samples of WAV segments that share one `hound::WavSpec`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WavJoin;

fn read_u32_le(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Rewrites the RIFF and `data` sizes of a streamed WAV to the real payload.
///
/// Streaming providers write `0xFFFFFFFF` (or `0`) for both when the length
/// is unknown at header time, which `hound` refuses to read.  Well-formed
/// input is returned untouched.
fn with_exact_sizes(bytes: &[u8]) -> Cow<'_, [u8]> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Cow::Borrowed(bytes);
    }

    let mut block_align = 1usize;
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let declared = read_u32_le(bytes, pos + 4) as usize;
        let body = pos + 8;
        let available = bytes.len() - body;

        if id == b"fmt " && available >= 14 {
            block_align = usize::from(u16::from_le_bytes([bytes[body + 12], bytes[body + 13]])).max(1);
        }

        if id == b"data" {
            let riff = read_u32_le(bytes, 4);
            let unknown_data = declared == 0 || declared > available;
            if !unknown_data && riff != 0 && riff != u32::MAX {
                return Cow::Borrowed(bytes);
            }

            let data_len = if unknown_data { available - available % block_align } else { declared };
            let riff_len = u32::try_from(body + data_len - 8).unwrap_or(u32::MAX);
            let data_len = u32::try_from(data_len).unwrap_or(u32::MAX);

            let mut patched = bytes.to_vec();
            patched[4..8].copy_from_slice(&riff_len.to_le_bytes());
            patched[pos + 4..pos + 8].copy_from_slice(&data_len.to_le_bytes());
            return Cow::Owned(patched);
        }

        // Chunks are padded to an even length.
        match body.checked_add(declared + (declared & 1)) {
            Some(next) => pos = next,
            None => break,
        }
    }
    Cow::Borrowed(bytes)
}

fn join_wav(segments: &[AudioSegment]) -> Result<Vec<u8>, AssemblyError> {
    let first = hound::WavReader::new(Cursor::new(with_exact_sizes(&segments[0].bytes)))?;
    let spec = first.spec();
    drop(first);

    let mut out = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut out, spec)?;

    for segment in segments {
        let mut reader = hound::WavReader::new(Cursor::new(with_exact_sizes(&segment.bytes)))?;
        if reader.spec() != spec {
            return Err(AssemblyError::FormatMismatch { index: segment.index });
        }
        match spec.sample_format {
            hound::SampleFormat::Float => {
                for sample in reader.samples::<f32>() {
                    writer.write_sample(sample?)?;
                }
            }
            hound::SampleFormat::Int => {
                for sample in reader.samples::<i32>() {
                    writer.write_sample(sample?)?;
                }
            }
        }
    }

    writer.finalize()?;
    Ok(out.into_inner())
}

#[async_trait]
impl Assembler for WavJoin {
    async fn concatenate(&self, segments: Vec<AudioSegment>) -> Result<Vec<u8>, AssemblyError> {
        let mut segments = ordered(segments)?;
        if segments.len() == 1 {
            return Ok(segments.remove(0).bytes);
        }
        tokio::task::spawn_blocking(move || join_wav(&segments))
            .await
            .map_err(|e| AssemblyError::Task(e.to_string()))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(index: usize, bytes: &[u8]) -> AudioSegment {
        AudioSegment { index, bytes: bytes.to_vec() }
    }

    fn wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut out = Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut out, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        out.into_inner()
    }

    #[test]
    fn test_manifest_lists_files_in_order_and_escapes_quotes() {
        let dir = Path::new("/tmp/it's here");
        let names = vec!["segment-000000.mp3".to_string(), "segment-000001.mp3".to_string()];
        assert_eq!(
            manifest_contents(dir, &names),
            "file '/tmp/it'\\''s here/segment-000000.mp3'\nfile '/tmp/it'\\''s here/segment-000001.mp3'\n"
        );
    }

    #[tokio::test]
    async fn test_empty_segment_list_is_rejected() {
        let err = WavJoin.concatenate(Vec::new()).await.unwrap_err();
        assert!(matches!(err, AssemblyError::NoSegments));
        let err = FfmpegConcat::new("ffmpeg", AudioFormat::Mp3).concatenate(Vec::new()).await.unwrap_err();
        assert!(matches!(err, AssemblyError::NoSegments));
    }

    #[tokio::test]
    async fn test_single_segment_skips_the_tool() {
        let concat = FfmpegConcat::new("/nonexistent/ffmpeg", AudioFormat::Mp3);
        let audio = concat.concatenate(vec![seg(0, &[7, 8, 9])]).await.unwrap();
        assert_eq!(audio, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn test_wav_join_appends_samples_in_index_order() {
        let segments = vec![seg(1, &wav(&[3, 4], 24_000)), seg(0, &wav(&[1, 2], 24_000))];
        let joined = WavJoin.concatenate(segments).await.unwrap();

        let mut reader = hound::WavReader::new(Cursor::new(joined)).unwrap();
        assert_eq!(reader.spec().sample_rate, 24_000);
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples, vec![1, 2, 3, 4]);
    }

    /// Header sizes as written by a provider that streams its response.
    fn streamed(mut bytes: Vec<u8>, size: u32) -> Vec<u8> {
        let data = bytes.windows(4).position(|w| w == b"data").unwrap();
        bytes[4..8].copy_from_slice(&size.to_le_bytes());
        bytes[data + 4..data + 8].copy_from_slice(&size.to_le_bytes());
        bytes
    }

    #[tokio::test]
    async fn test_wav_join_accepts_streamed_headers() {
        let segments = vec![
            seg(0, &streamed(wav(&[1, 2], 24_000), u32::MAX)),
            seg(1, &streamed(wav(&[3, 4, 5], 24_000), 0)),
        ];
        let joined = WavJoin.concatenate(segments).await.unwrap();

        let mut reader = hound::WavReader::new(Cursor::new(joined)).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_exact_sizes_leaves_well_formed_wav_alone() {
        let bytes = wav(&[1, 2, 3], 24_000);
        assert!(matches!(with_exact_sizes(&bytes), Cow::Borrowed(_)));
        assert!(matches!(with_exact_sizes(b"not a wav"), Cow::Borrowed(_)));
    }

    #[tokio::test]
    async fn test_wav_join_rejects_mismatched_specs() {
        let segments = vec![seg(0, &wav(&[1], 24_000)), seg(1, &wav(&[2], 16_000))];
        let err = WavJoin.concatenate(segments).await.unwrap_err();
        assert!(matches!(err, AssemblyError::FormatMismatch { index: 1 }));
    }

    #[tokio::test]
    async fn test_wav_join_rejects_garbage() {
        let segments = vec![seg(0, b"not a wav"), seg(1, b"nor this")];
        assert!(matches!(WavJoin.concatenate(segments).await, Err(AssemblyError::Wav(_))));
    }

    #[cfg(unix)]
    mod ffmpeg_stub {
        use super::*;

        /// Stands in for ffmpeg: cats the manifest's files into the last argument.
        const FAKE_FFMPEG: &str = r#"
manifest=""; out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -i) manifest="$2"; shift 2 ;;
    *) out="$1"; shift ;;
  esac
done
sed -e "s/^file '\(.*\)'$/\1/" "$manifest" | while read -r f; do cat "$f"; done > "$out"
"#;

        const FAILING_FFMPEG: &str = "echo 'Invalid data found' >&2; exit 3";

        fn tool(script: &str, root: &Path) -> FfmpegConcat {
            FfmpegConcat::new("sh", AudioFormat::Mp3)
                .with_program_args(["-c", script, "ffmpeg"])
                .with_scratch_root(root)
        }

        fn is_empty_dir(dir: &Path) -> bool {
            std::fs::read_dir(dir).unwrap().next().is_none()
        }

        #[tokio::test]
        async fn test_concat_preserves_chunk_order() {
            let root = tempfile::tempdir().unwrap();
            let segments = vec![seg(2, &[0x03]), seg(0, &[0x01]), seg(1, &[0x02])];
            let audio = tool(FAKE_FFMPEG, root.path()).concatenate(segments).await.unwrap();
            assert_eq!(audio, vec![0x01, 0x02, 0x03]);
            assert!(is_empty_dir(root.path()), "scratch directory left behind");
        }

        #[tokio::test]
        async fn test_tool_failure_cleans_up() {
            let root = tempfile::tempdir().unwrap();
            let segments = vec![seg(0, &[0x01]), seg(1, &[0x02])];
            let err = tool(FAILING_FFMPEG, root.path()).concatenate(segments).await.unwrap_err();
            match err {
                AssemblyError::Tool { stderr, .. } => assert_eq!(stderr, "Invalid data found"),
                other => panic!("unexpected error: {other}"),
            }
            assert!(is_empty_dir(root.path()), "scratch directory left behind");
        }

        #[tokio::test]
        async fn test_missing_program_cleans_up() {
            let root = tempfile::tempdir().unwrap();
            let concat = FfmpegConcat::new("/nonexistent/ffmpeg", AudioFormat::Mp3).with_scratch_root(root.path());
            let err = concat.concatenate(vec![seg(0, &[1]), seg(1, &[2])]).await.unwrap_err();
            assert!(matches!(err, AssemblyError::Spawn { .. }));
            assert!(is_empty_dir(root.path()), "scratch directory left behind");
        }
    }
}
