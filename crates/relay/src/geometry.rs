//! Stream geometry discovery
//!
//! ffmpeg prints a description of its input before it starts transcoding:
//!
//! ```text
//! Input #0, rtsp, from 'rtsp://camera/stream':
//!   Stream #0:0: Video: h264 (Main), yuvj420p(pc), 1280x720, 25 fps
//! Output #0, mpegts, to 'pipe:':
//! ```
//!
//! Width and height are taken from the first `<digits>x<digits>` inside that
//! input block. Each dimension is set once and never changes afterwards.

use regex::Regex;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;

/// Marks the start of the input description
const INPUT_MARKER: &str = "Input #";

/// Marks the start of the output description
const OUTPUT_MARKER: &str = "Output #";

fn dimensions_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)x(\d+)").expect("dimension pattern is valid"))
}

/// Find the first `<digits>x<digits>` in `text`
///
/// Returns None if there is no match or the first match does not fit the
/// 16-bit header fields.
pub fn find_dimensions(text: &str) -> Option<(u16, u16)> {
    let caps = dimensions_pattern().captures(text)?;
    let width = caps.get(1)?.as_str().parse::<u16>().ok()?;
    let height = caps.get(2)?.as_str().parse::<u16>().ok()?;
    Some((width, height))
}

/// Width and height of a stream, shared between the scanner and the gateway
///
/// Zero means unknown. A dimension can only go from unknown to known.
#[derive(Debug, Default)]
pub struct StreamGeometry {
    width: AtomicU16,
    height: AtomicU16,
}

impl StreamGeometry {
    /// Create with optional explicitly configured dimensions
    pub fn new(width: Option<u16>, height: Option<u16>) -> Self {
        Self {
            width: AtomicU16::new(width.unwrap_or(0)),
            height: AtomicU16::new(height.unwrap_or(0)),
        }
    }

    pub fn width(&self) -> u16 {
        self.width.load(Ordering::Acquire)
    }

    pub fn height(&self) -> u16 {
        self.height.load(Ordering::Acquire)
    }

    /// Current (width, height), zero where unknown
    pub fn dimensions(&self) -> (u16, u16) {
        (self.width(), self.height())
    }

    /// True once both dimensions are known
    pub fn is_complete(&self) -> bool {
        self.width() != 0 && self.height() != 0
    }

    /// Fill in whichever dimensions are still unknown
    ///
    /// Returns true if anything changed.
    pub fn offer(&self, width: u16, height: u16) -> bool {
        let w = set_once(&self.width, width);
        let h = set_once(&self.height, height);
        w || h
    }
}

fn set_once(slot: &AtomicU16, value: u16) -> bool {
    value != 0
        && slot
            .compare_exchange(0, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
}

/// Where the scanner is in the diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Waiting for an input description
    SeekingInput,
    /// Inside an input description, looking for dimensions
    InInput,
    /// Geometry is complete, nothing left to do
    Done,
}

/// Feeds diagnostic chunks, one at a time and in order, into a [`StreamGeometry`]
#[derive(Debug)]
pub struct GeometryScanner {
    state: ScanState,
}

impl GeometryScanner {
    pub fn new(geometry: &StreamGeometry) -> Self {
        let state = if geometry.is_complete() {
            ScanState::Done
        } else {
            ScanState::SeekingInput
        };
        Self { state }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Process one diagnostic chunk
    pub fn feed(&mut self, chunk: &[u8], geometry: &StreamGeometry) -> ScanState {
        if self.state == ScanState::Done {
            return self.state;
        }

        let text = String::from_utf8_lossy(chunk);
        if text.contains(INPUT_MARKER) {
            self.state = ScanState::InInput;
        }
        // A chunk holding both markers ends the section
        if text.contains(OUTPUT_MARKER) {
            self.state = ScanState::SeekingInput;
        }

        if self.state == ScanState::InInput {
            if let Some((width, height)) = find_dimensions(&text) {
                if geometry.offer(width, height) {
                    tracing::debug!(
                        width = geometry.width(),
                        height = geometry.height(),
                        "Stream geometry discovered"
                    );
                }
            }
        }

        if geometry.is_complete() {
            self.state = ScanState::Done;
        }
        self.state
    }
}
