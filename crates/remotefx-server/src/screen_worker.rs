//! Editor capture, diff encoding and input relay.
//!
//! The worker is idle until an editor is shown, then captures it on a fixed
//! interval and sends only the rectangle that changed since the last frame.
//! It holds the editor weakly: the owning processor may tear its editor down
//! at any time, and the worker notices on the next capture and forgets it.

use crate::error::{CaptureError, Result};
use crate::host::{EditorSurface, Frame, Modifiers, WindowSystem};
use arc_swap::ArcSwapOption;
use remotefx_protocol::screen::rle_encode;
use remotefx_protocol::{write_message, Message, MouseEvent, ScreenFrame, MAX_PAYLOAD_SIZE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Room for the fixed `ScreenFrame` fields around the pixel data.
const FRAME_OVERHEAD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenState {
    Idle,
    Capturing,
}

struct EditorTarget {
    index: usize,
    surface: Weak<dyn EditorSurface>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

impl Rect {
    fn full(frame: &Frame) -> Self {
        Self {
            x: 0,
            y: 0,
            width: frame.width,
            height: frame.height,
        }
    }
}

/// Bounding box of all pixels that differ. Frames must be the same size.
fn dirty_rect(prev: &Frame, cur: &Frame) -> Option<Rect> {
    let w = cur.width as usize;
    let mut bounds: Option<(usize, usize, usize, usize)> = None;

    for (y, (a, b)) in prev.pixels.chunks(w).zip(cur.pixels.chunks(w)).enumerate() {
        if a == b {
            continue;
        }
        let first = a.iter().zip(b).position(|(p, q)| p != q).unwrap_or(0);
        let last = w - 1 - a.iter().rev().zip(b.iter().rev()).position(|(p, q)| p != q).unwrap_or(0);
        bounds = Some(match bounds {
            None => (first, y, last, y),
            Some((x0, y0, x1, _)) => (x0.min(first), y0, x1.max(last), y),
        });
    }

    bounds.map(|(x0, y0, x1, y1)| Rect {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0 + 1) as u32,
        height: (y1 - y0 + 1) as u32,
    })
}

fn extract(frame: &Frame, rect: Rect) -> Vec<u32> {
    let mut out = Vec::with_capacity(rect.width as usize * rect.height as usize);
    for row in rect.y..rect.y + rect.height {
        let start = (row * frame.width + rect.x) as usize;
        out.extend_from_slice(&frame.pixels[start..start + rect.width as usize]);
    }
    out
}

/// Turns successive captures into the frames worth sending.
pub struct FrameDiffer {
    previous: Option<Frame>,
    diff_detection: bool,
}

impl FrameDiffer {
    pub fn new(diff_detection: bool) -> Self {
        Self {
            previous: None,
            diff_detection,
        }
    }

    /// Forget history; the next frame goes out in full.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    /// `None` when nothing changed (or the frame is unusable).
    pub fn next(&mut self, frame: Frame) -> Option<ScreenFrame> {
        if frame.width == 0 || frame.height == 0 {
            return None;
        }

        let rect = match &self.previous {
            Some(prev) if prev.width == frame.width && prev.height == frame.height => {
                let dirty = dirty_rect(prev, &frame)?;
                if self.diff_detection {
                    dirty
                } else {
                    Rect::full(&frame)
                }
            }
            _ => Rect::full(&frame),
        };

        let data = rle_encode(&extract(&frame, rect));
        if data.len() + FRAME_OVERHEAD > MAX_PAYLOAD_SIZE {
            warn!(
                bytes = data.len(),
                width = frame.width,
                height = frame.height,
                "encoded frame too large, dropping"
            );
            self.previous = None;
            return None;
        }

        let encoded = ScreenFrame {
            width: frame.width,
            height: frame.height,
            x: rect.x,
            y: rect.y,
            rect_width: rect.width,
            rect_height: rect.height,
            data,
        };
        self.previous = Some(frame);
        Some(encoded)
    }
}

pub struct ScreenWorker {
    windows: Arc<dyn WindowSystem>,
    interval: Duration,
    diff_detection: bool,
    target: ArcSwapOption<EditorTarget>,
    hidden_pending: AtomicBool,
    reset_pending: AtomicBool,
    shutdown: AtomicBool,
}

impl ScreenWorker {
    pub fn new(windows: Arc<dyn WindowSystem>, interval: Duration, diff_detection: bool) -> Self {
        Self {
            windows,
            interval,
            diff_detection,
            target: ArcSwapOption::empty(),
            hidden_pending: AtomicBool::new(false),
            reset_pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ScreenState {
        if self.target.load().is_some() {
            ScreenState::Capturing
        } else {
            ScreenState::Idle
        }
    }

    /// Chain index of the editor being captured.
    pub fn editor_index(&self) -> Option<usize> {
        self.target.load_full().map(|t| t.index)
    }

    pub fn show_editor(&self, index: usize, editor: &Arc<dyn EditorSurface>) {
        self.windows.show_editor(editor);
        self.target.store(Some(Arc::new(EditorTarget {
            index,
            surface: Arc::downgrade(editor),
        })));
        self.hidden_pending.store(false, Ordering::Release);
        self.reset_pending.store(true, Ordering::Release);
        debug!(index, "editor shown");
    }

    pub fn hide_editor(&self) {
        if let Some(target) = self.target.swap(None) {
            if let Some(surface) = target.surface.upgrade() {
                self.windows.hide_editor(&surface);
            }
            debug!(index = target.index, "editor hidden");
        }
        self.hidden_pending.store(true, Ordering::Release);
    }

    /// The editor vanished underneath us. Drop the target without asking the
    /// window system to hide it again.
    fn forget_editor(&self, expected: &Option<Arc<EditorTarget>>) {
        self.target.compare_and_swap(expected, None::<Arc<EditorTarget>>);
        self.hidden_pending.store(true, Ordering::Release);
    }

    pub fn mouse_event(&self, ev: &MouseEvent) {
        let Some(surface) = self.live_surface() else {
            debug!("mouse event without editor");
            return;
        };
        let (x, y) = surface.local_to_global(ev.x, ev.y);
        let modifiers = Modifiers {
            shift: ev.shift,
            ctrl: ev.ctrl,
            alt: ev.alt,
        };
        self.windows.mouse_event(ev.kind, x, y, modifiers);
    }

    pub fn key_event(&self, codes: &[u16]) {
        if self.live_surface().is_some() {
            self.windows.key_event(codes);
        } else {
            debug!("key event without editor");
        }
    }

    fn live_surface(&self) -> Option<Arc<dyn EditorSurface>> {
        self.target.load_full().and_then(|t| t.surface.upgrade())
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// One capture step. Returns the frame to send, if any.
    pub fn tick(&self, differ: &mut FrameDiffer) -> Option<ScreenFrame> {
        if self.reset_pending.swap(false, Ordering::AcqRel) {
            differ.reset();
        }

        let current = self.target.load_full();
        let Some(target) = current.as_ref() else {
            return self.take_hidden(differ);
        };

        let Some(surface) = target.surface.upgrade() else {
            info!(index = target.index, "editor destroyed by processor, forgetting");
            self.forget_editor(&current);
            return self.take_hidden(differ);
        };

        match self.windows.capture(&surface) {
            Ok(frame) => differ.next(frame),
            Err(CaptureError::NotShown) => {
                info!(index = target.index, "editor displaced by another one, going idle");
                self.forget_editor(&current);
                self.take_hidden(differ)
            }
            Err(e) => {
                warn!(index = target.index, error = %e, "capture failed, going idle");
                self.forget_editor(&current);
                self.take_hidden(differ)
            }
        }
    }

    fn take_hidden(&self, differ: &mut FrameDiffer) -> Option<ScreenFrame> {
        if self.hidden_pending.swap(false, Ordering::AcqRel) {
            differ.reset();
            Some(ScreenFrame::hidden())
        } else {
            None
        }
    }

    /// Capture loop; stops on shutdown or when the stream fails.
    pub async fn run<W: AsyncWrite + Unpin>(self: Arc<Self>, mut writer: W) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut differ = FrameDiffer::new(self.diff_detection);

        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }
            if let Some(frame) = self.tick(&mut differ) {
                write_message(&mut writer, &Message::ScreenCapture(frame)).await?;
            }
        }
    }
}
