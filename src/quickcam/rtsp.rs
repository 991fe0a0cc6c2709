//! X1-family variant: X1 printers don't expose the framed-JPEG socket, only
//! an RTSPS stream, so frames are pulled out of an `ffmpeg` subprocess that
//! re-muxes the stream to an `image2pipe` of raw JPEGs on stdout.

use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::warn;

use super::QuickCam;

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const BUFFER_DESYNC_LIMIT: usize = 50_000;
const STDERR_TAIL_LIMIT: usize = 4_096;
const TEARDOWN_WAIT: Duration = Duration::from_secs(10);
const JPEG_SOI: [u8; 6] = [0xFF, 0xD8, 0xFF, 0xFE, 0x00, 0x10];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub async fn stream(cam: &Arc<QuickCam>) -> Result<(), BoxError> {
    let url = format!(
        "rtsps://bblp:{}@{}:322/streaming/live/1",
        cam.access_code, cam.ip
    );
    let log_level = if cam.debug { "trace" } else { "warning" };

    let mut child = Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            log_level,
            "-rtsp_transport",
            "udp",
            "-use_wallclock_as_timestamps",
            "1",
            "-i",
            &url,
            "-vf",
            "fps=15",
            "-movflags",
            "+faststart",
            "-f",
            "image2pipe",
            "-",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn ffmpeg: {e}"))?;

    let stdout = child.stdout.take().expect("ffmpeg stdout was piped");
    let stderr = child.stderr.take().expect("ffmpeg stderr was piped");

    let stderr_tail = Arc::new(StdMutex::new(String::new()));
    let stderr_task = tokio::spawn(drain_stderr(stderr, stderr_tail.clone()));

    let result = read_frames(cam, stdout, &stderr_tail).await;

    stderr_task.abort();
    teardown(&mut child).await;

    result
}

async fn read_frames(
    cam: &Arc<QuickCam>,
    mut stdout: ChildStdout,
    stderr_tail: &Arc<StdMutex<String>>,
) -> Result<(), BoxError> {
    let mut buffer = BytesMut::new();
    let mut chunk = [0u8; 65536];
    let mut last_frame_at = Instant::now();

    loop {
        if cam.should_stop().await {
            return Ok(());
        }

        let read = match tokio::time::timeout(READ_TIMEOUT, stdout.read(&mut chunk)).await {
            Ok(Ok(0)) => return Err(ffmpeg_error("ffmpeg exited", stderr_tail)),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ffmpeg_error(&format!("stdout read error: {e}"), stderr_tail)),
            Err(_) => return Err(ffmpeg_error("no frame within timeout", stderr_tail)),
        };
        buffer.extend_from_slice(&chunk[..read]);

        while let Some(eoi_at) = find(&buffer, &JPEG_EOI) {
            let frame_end = eoi_at + JPEG_EOI.len();
            let starts_with_soi =
                buffer.len() >= JPEG_SOI.len() && buffer[..JPEG_SOI.len()] == JPEG_SOI;
            let frame = buffer.split_to(frame_end);
            if starts_with_soi {
                cam.on_frame(frame.freeze());
                last_frame_at = Instant::now();
            }
            // else: desynced mid-stream, drop the partial frame and keep scanning
        }

        if buffer.len() > BUFFER_DESYNC_LIMIT {
            warn!(serial = %cam.serial, "quickcam rtsp buffer exceeded desync limit, resetting");
            buffer.clear();
        }
        if last_frame_at.elapsed() > READ_TIMEOUT {
            return Err(ffmpeg_error("no frame decoded within timeout", stderr_tail));
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn ffmpeg_error(context: &str, stderr_tail: &Arc<StdMutex<String>>) -> BoxError {
    let tail = stderr_tail.lock().unwrap().clone();
    format!("{context}; ffmpeg stderr tail: {tail}").into()
}

async fn drain_stderr(mut stderr: ChildStderr, tail: Arc<StdMutex<String>>) {
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]);
                let mut tail = tail.lock().unwrap();
                tail.push_str(&text);
                if tail.len() > STDERR_TAIL_LIMIT {
                    let excess = tail.len() - STDERR_TAIL_LIMIT;
                    tail.drain(..excess);
                }
            }
        }
    }
}

/// SIGINT first so ffmpeg can flush and exit cleanly, then a `q` on stdin
/// as a fallback for builds that ignore SIGINT while muxing, then SIGKILL
/// if neither gets it to exit within the wait window.
async fn teardown(child: &mut Child) {
    if let Some(id) = child.id() {
        let _ = signal::kill(Pid::from_raw(id as i32), Signal::SIGINT);
    }

    let exited = tokio::time::timeout(TEARDOWN_WAIT, async {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(b"q\r\n").await;
        }
        let _ = child.wait().await;
    })
    .await;

    if exited.is_err() {
        let _ = child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_eoi_marker_inside_buffer() {
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&JPEG_SOI);
        data.extend_from_slice(b"...");
        data.extend_from_slice(&JPEG_EOI);
        assert_eq!(find(&data, &JPEG_EOI), Some(data.len() - 2));
    }

    #[test]
    fn missing_marker_returns_none() {
        assert_eq!(find(b"no markers here", &JPEG_EOI), None);
    }
}
