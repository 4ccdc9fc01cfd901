use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

use super::{CaptureBackend, CaptureConnection, CaptureError, Frame};

/// SMPTE-style bars: white, yellow, cyan, green, magenta, red, blue.
const BARS: [[u8; 3]; 7] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
];

/// Synthetic camera producing scrolling colour bars at a fixed rate.
///
/// Used for `test://` URLs so the relay can run without camera hardware.
#[derive(Debug, Clone)]
pub struct TestPatternBackend {
    width: u32,
    height: u32,
    fps: u32,
}

impl TestPatternBackend {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
        }
    }
}

impl CaptureBackend for TestPatternBackend {
    fn open(&mut self, url: &str) -> Result<Box<dyn CaptureConnection>, CaptureError> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::SourceUnavailable(format!(
                "invalid test pattern size {}x{}",
                self.width, self.height
            )));
        }

        info!(
            url = %url,
            resolution = %format!("{}x{}", self.width, self.height),
            fps = self.fps,
            "Opening test pattern source"
        );

        Ok(Box::new(TestPatternConnection {
            width: self.width,
            height: self.height,
            interval: Duration::from_secs(1) / self.fps,
            next_due: Instant::now(),
            offset: 0,
        }))
    }
}

struct TestPatternConnection {
    width: u32,
    height: u32,
    interval: Duration,
    next_due: Instant,
    offset: u32,
}

impl TestPatternConnection {
    fn render(&self) -> Vec<u8> {
        let width = self.width as usize;
        let mut pixels = Vec::with_capacity(width * self.height as usize * 3);
        for _ in 0..self.height {
            for x in 0..self.width {
                let column = (x + self.offset) % self.width;
                let bar = (column as usize * BARS.len()) / width;
                pixels.extend_from_slice(&BARS[bar]);
            }
        }
        pixels
    }
}

impl CaptureConnection for TestPatternConnection {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let now = Instant::now();
        if self.next_due > now {
            thread::sleep(self.next_due - now);
        }
        self.next_due = self.next_due.max(now) + self.interval;

        let frame = Frame::new(self.width, self.height, self.render());
        self.offset = (self.offset + 4) % self.width;
        Ok(frame)
    }
}
