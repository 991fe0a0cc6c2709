//! Webcam pump (C6): keeps one JPEG frame source alive per printer and
//! fans it out to snapshot and MJPEG-stream callers without either of them
//! needing to know which of the two wire protocols the printer actually
//! speaks.
//!
//! P1/A1-family printers serve a proprietary framed-JPEG stream over a
//! TLS socket on port 6000 ([`websocket_jpeg`]); X1-family printers only
//! expose RTSP, so frames are pulled out of an `ffmpeg` subprocess
//! ([`rtsp`]). Which one applies is read off the printer's own reported
//! state (`rtsp_url` present vs. absent) rather than configured up front,
//! since a single agent may be managing both families at once.

mod rtsp;
mod websocket_jpeg;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use tokio::sync::{broadcast, Notify};
use tracing::{info, warn};

use crate::printer_manager::PrinterManager;

/// How long a capture task keeps running with no snapshot/stream requester
/// before giving up, unless the printer is actively printing.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long `snapshot()` waits for a frame before giving up on a cold start.
const SNAPSHOT_WAIT: Duration = Duration::from_secs(4);
const SNAPSHOT_KICK_ATTEMPTS: u32 = 2;
const VARIANT_SELECT_POLL: Duration = Duration::from_secs(2);
const VARIANT_SELECT_ATTEMPTS: u32 = 5;
const MAX_STREAM_FAILURES: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Per-printer webcam frame source. Cheap to hold onto: the capture task
/// only actually runs while something is asking for frames.
pub struct QuickCam {
    serial: String,
    ip: String,
    access_code: String,
    printer_manager: Arc<PrinterManager>,
    current_image: ArcSwapOption<Bytes>,
    image_ready: Notify,
    last_requester: StdMutex<Instant>,
    capture_running: AtomicBool,
    frames: broadcast::Sender<Bytes>,
    pub debug: bool,
}

impl QuickCam {
    pub fn new(
        serial: String,
        ip: String,
        access_code: String,
        printer_manager: Arc<PrinterManager>,
        debug: bool,
    ) -> Arc<Self> {
        let (frames, _) = broadcast::channel(4);
        Arc::new(Self {
            serial,
            ip,
            access_code,
            printer_manager,
            current_image: ArcSwapOption::empty(),
            image_ready: Notify::new(),
            last_requester: StdMutex::new(Instant::now()),
            capture_running: AtomicBool::new(false),
            frames,
            debug,
        })
    }

    /// Current frame, starting capture if idle and waiting briefly for the
    /// first frame to arrive on a cold start.
    pub async fn snapshot(self: &Arc<Self>) -> Option<Bytes> {
        self.touch();
        if let Some(img) = self.current_image.load_full() {
            return Some((*img).clone());
        }
        for _ in 0..SNAPSHOT_KICK_ATTEMPTS {
            self.ensure_capture_running();
            let _ = tokio::time::timeout(SNAPSHOT_WAIT, self.image_ready.notified()).await;
            if let Some(img) = self.current_image.load_full() {
                return Some((*img).clone());
            }
        }
        None
    }

    /// Subscribe to the live frame stream, starting capture if idle.
    pub fn subscribe(self: &Arc<Self>) -> broadcast::Receiver<Bytes> {
        self.touch();
        self.ensure_capture_running();
        self.frames.subscribe()
    }

    fn touch(&self) {
        *self.last_requester.lock().unwrap() = Instant::now();
    }

    fn ensure_capture_running(self: &Arc<Self>) {
        if self.capture_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let me = self.clone();
        tokio::spawn(async move {
            me.capture_loop().await;
        });
    }

    async fn capture_loop(self: Arc<Self>) {
        info!(serial = %self.serial, "quickcam capture starting");
        let mut failures = 0u32;

        while failures < MAX_STREAM_FAILURES {
            if self.should_stop().await {
                break;
            }

            let use_rtsp = self.select_variant().await;
            let result = if use_rtsp {
                rtsp::stream(&self).await
            } else {
                websocket_jpeg::stream(&self).await
            };

            match result {
                Ok(()) => break,
                Err(e) => {
                    failures += 1;
                    warn!(
                        serial = %self.serial,
                        attempt = failures,
                        error = %e,
                        "quickcam stream ended, retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }

        self.current_image.store(None);
        self.capture_running.store(false, Ordering::SeqCst);
        info!(serial = %self.serial, "quickcam capture stopped");
    }

    /// X1-family printers report a non-`None` `rtsp_url` (empty string means
    /// LAN streaming is disabled but the model is still X1-family); P1/A1
    /// never populate the field at all.
    async fn select_variant(&self) -> bool {
        for attempt in 0..VARIANT_SELECT_ATTEMPTS {
            if let Some(state) = self.printer_manager.get_state(&self.serial).await {
                return state.rtsp_url.is_some();
            }
            if attempt + 1 >= VARIANT_SELECT_ATTEMPTS {
                break;
            }
            tokio::time::sleep(VARIANT_SELECT_POLL).await;
        }
        warn!(serial = %self.serial, "quickcam couldn't read printer state, defaulting to websocket variant");
        false
    }

    async fn should_stop(&self) -> bool {
        let idle = self.last_requester.lock().unwrap().elapsed() > IDLE_TIMEOUT;
        if !idle {
            return false;
        }
        let printing = self
            .printer_manager
            .get_state(&self.serial)
            .await
            .map(|s| s.is_printing(true))
            .unwrap_or(false);
        !printing
    }

    fn on_frame(&self, frame: Bytes) {
        self.current_image.store(Some(Arc::new(frame.clone())));
        self.image_ready.notify_waiters();
        if self.frames.receiver_count() > 0 {
            // Live stream subscribers keep the capture loop's idle clock
            // refreshed on every frame, not just on subscribe/snapshot calls.
            self.touch();
        }
        let _ = self.frames.send(frame);
    }
}
