//! Transcoder diagnostic output parsing
//!
//! ffmpeg rewrites its status line in place with carriage returns, so lines are split on
//! `\r` as well as `\n`.

use serde::{Deserialize, Serialize};

/// Throughput indicators from a status line such as
/// `frame=  301 fps= 30 q=23.0 size=    1536kB time=00:00:10.00 bitrate=1258.3kbits/s speed=1.00x`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub frame: u64,
    pub fps: f32,
    pub bitrate_kbps: Option<f32>,
    pub speed: Option<f32>,
}

/// Drain every complete line from `buf`, leaving any trailing partial line in place
///
/// Empty lines are skipped and invalid UTF-8 is replaced.
pub fn split_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    let mut start = 0;

    for i in 0..buf.len() {
        if buf[i] == b'\n' || buf[i] == b'\r' {
            let line = String::from_utf8_lossy(&buf[start..i]);
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
            start = i + 1;
        }
    }

    buf.drain(..start);
    lines
}

/// Parse a status line; `None` for anything that is not one
pub fn parse_progress(line: &str) -> Option<Progress> {
    let frame = field(line, "frame")?.parse::<u64>().ok()?;
    let fps = field(line, "fps")
        .and_then(|v| v.parse::<f32>().ok())
        .unwrap_or(0.0);
    let bitrate_kbps = field(line, "bitrate")
        .and_then(|v| v.trim_end_matches("kbits/s").parse::<f32>().ok());
    let speed = field(line, "speed").and_then(|v| v.trim_end_matches('x').parse::<f32>().ok());

    Some(Progress {
        frame,
        fps,
        bitrate_kbps,
        speed,
    })
}

/// Value after `key=`, skipping the padding ffmpeg inserts after the `=`
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let mut search_from = 0;
    while let Some(pos) = line[search_from..].find(key) {
        let start = search_from + pos;
        let after_key = start + key.len();
        let at_word_start = start == 0 || line.as_bytes()[start - 1] == b' ';
        if at_word_start && line[after_key..].starts_with('=') {
            return line[after_key + 1..].split_whitespace().next();
        }
        search_from = after_key;
    }
    None
}

/// Engine messages that mean the input cannot be decoded at all
pub fn is_fatal_input_error(line: &str) -> bool {
    const MARKERS: &[&str] = &[
        "Invalid data found when processing input",
        "EBML header parsing failed",
        "moov atom not found",
    ];
    MARKERS.iter().any(|m| line.contains(m))
}
