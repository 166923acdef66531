//! ffmpeg transcoder
//!
//! Builds the ffmpeg argument list for a session and spawns it with stdin/stderr piped.

use std::io;
use std::process::{Command, Stdio};

use super::{ExitOutcome, ProcessControl, TranscodeError, TranscodeProcess, Transcoder};
use crate::outbound::{build_outbound_url_with_default, downgrade_to_rtmp, UrlError};
use crate::protocol::{InputFormat, SessionConfig};

/// Everything needed to start one transcoder process
///
/// Derived purely from a session's configuration; `output_url` is always the
/// normalized outbound URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeSpec {
    pub input_format: InputFormat,
    pub fps: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub preset: String,
    pub output_url: String,
}

impl TranscodeSpec {
    /// Build the spec for a session, normalizing its destination
    ///
    /// Fails with the normalizer's error rather than producing a spec with a bad URL.
    pub fn for_session(
        config: &SessionConfig,
        preset: &str,
        default_endpoint: &str,
        rtmps_supported: bool,
    ) -> Result<Self, UrlError> {
        let mut output_url =
            build_outbound_url_with_default(&config.endpoint, &config.stream_key, default_endpoint)?;
        if !rtmps_supported {
            output_url = downgrade_to_rtmp(&output_url);
        }

        Ok(Self {
            input_format: config.input_format,
            fps: config.fps,
            video_bitrate_kbps: config.video_bitrate_kbps,
            audio_bitrate_kbps: config.audio_bitrate_kbps,
            width: config.width,
            height: config.height,
            preset: preset.to_string(),
            output_url,
        })
    }

    /// Keyframe interval: one keyframe at least every two seconds
    pub fn gop_size(&self) -> u32 {
        self.fps * 2
    }
}

/// Build the ffmpeg command for a spec
///
/// Creates a Command configured with:
/// - Input read from stdin in the session's container format
/// - x264 with zero-latency tuning, fixed GOP and no B-frames
/// - CBR-style bitrate, maxrate and a 2x buffer
/// - AAC audio (synthesized silence for elementary H.264 input, none for MJPEG)
/// - FLV output to the outbound URL
pub fn build_ffmpeg_command(program: &str, spec: &TranscodeSpec) -> Command {
    let mut cmd = Command::new(program);
    let fps = spec.fps.to_string();

    cmd.arg("-hide_banner");

    match spec.input_format {
        InputFormat::Webm => {
            cmd.args(["-f", "webm", "-thread_queue_size", "512"]);
            cmd.args(["-fflags", "+genpts+igndts", "-avoid_negative_ts", "make_zero"]);
            cmd.args(["-i", "pipe:0"]);
            cmd.args(["-map", "0:v:0?", "-map", "0:a:0?"]);
        }
        InputFormat::H264 => {
            cmd.args(["-f", "h264", "-framerate", &fps, "-thread_queue_size", "512"]);
            cmd.args(["-fflags", "+genpts", "-i", "pipe:0"]);
            // Destinations reject streams without audio
            cmd.args(["-f", "lavfi", "-i", "anullsrc=channel_layout=stereo:sample_rate=44100"]);
            cmd.args(["-map", "0:v:0", "-map", "1:a:0", "-shortest"]);
        }
        InputFormat::Mjpeg => {
            cmd.args(["-f", "image2pipe", "-framerate", &fps, "-i", "pipe:0"]);
            cmd.args(["-map", "0:v:0"]);
        }
    }

    if let (Some(w), Some(h)) = (spec.width, spec.height) {
        cmd.arg("-vf").arg(format!("scale={}:{}", w, h));
    }

    cmd.args(["-c:v", "libx264", "-pix_fmt", "yuv420p"]);
    cmd.arg("-preset").arg(&spec.preset);
    cmd.args(["-tune", "zerolatency", "-profile:v", "baseline"]);
    cmd.arg("-r").arg(&fps);
    cmd.arg("-g").arg(spec.gop_size().to_string());
    cmd.arg("-keyint_min").arg(&fps);
    cmd.args(["-sc_threshold", "0", "-bf", "0"]);
    cmd.arg("-b:v").arg(format!("{}k", spec.video_bitrate_kbps));
    cmd.arg("-maxrate").arg(format!("{}k", spec.video_bitrate_kbps));
    cmd.arg("-bufsize").arg(format!("{}k", spec.video_bitrate_kbps * 2));

    match spec.input_format {
        InputFormat::Mjpeg => {
            cmd.arg("-an");
        }
        InputFormat::Webm | InputFormat::H264 => {
            cmd.args(["-c:a", "aac"]);
            cmd.arg("-b:a").arg(format!("{}k", spec.audio_bitrate_kbps));
            cmd.args(["-ar", "44100", "-ac", "2"]);
        }
    }

    cmd.args(["-f", "flv", "-flvflags", "no_duration_filesize"]);
    cmd.arg(&spec.output_url);

    cmd
}

/// [`Transcoder`] that runs a real ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: String,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Transcoder for FfmpegTranscoder {
    fn spawn(&self, spec: &TranscodeSpec) -> Result<TranscodeProcess, TranscodeError> {
        let mut cmd = tokio::process::Command::from(build_ffmpeg_command(&self.program, spec));
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| TranscodeError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let input = child.stdin.take().ok_or(TranscodeError::MissingPipe("stdin"))?;
        let diagnostics = child.stderr.take().ok_or(TranscodeError::MissingPipe("stderr"))?;
        let pid = child.id();

        Ok(TranscodeProcess {
            pid,
            input: Box::new(input),
            diagnostics: Box::new(diagnostics),
            control: Box::new(ChildControl::new(child)),
        })
    }
}

/// [`ProcessControl`] over a tokio child process
pub struct ChildControl {
    child: tokio::process::Child,
}

impl ChildControl {
    pub fn new(child: tokio::process::Child) -> Self {
        Self { child }
    }

    pub fn into_inner(self) -> tokio::process::Child {
        self.child
    }
}

impl ProcessControl for ChildControl {
    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| ExitOutcome { code: status.code() }))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // Already reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}
