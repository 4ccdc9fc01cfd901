//! GStreamer-backed upstream decode (`uridecodebin` → RGB appsink).

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::source::redact;
use super::{CaptureBackend, CaptureConnection, CaptureError, Frame};

/// Opens any URL GStreamer can decode (`rtsp://`, `http://`, `file://`).
pub struct GstBackend {
    open_timeout: Duration,
    read_timeout: Duration,
}

impl GstBackend {
    pub fn new(open_timeout: Duration, read_timeout: Duration) -> Result<Self, CaptureError> {
        gst::init().map_err(|e| CaptureError::Fatal(format!("GStreamer init failed: {}", e)))?;
        Ok(Self {
            open_timeout,
            read_timeout,
        })
    }

    /// Assemble `uridecodebin ! queue ! videoconvert ! RGB capsfilter ! appsink`.
    ///
    /// The URL is only ever set as the `uri` property, never parsed as launch
    /// syntax. A missing element factory is the only failure here and is fatal.
    fn build_pipeline(url: &str) -> Result<(gst::Pipeline, gst_app::AppSink), CaptureError> {
        let pipeline = gst::Pipeline::builder().name("relay-source").build();

        let decode = gst::ElementFactory::make("uridecodebin")
            .name("decode")
            .property("uri", url)
            .build()
            .map_err(missing_factory("uridecodebin"))?;

        let queue = gst::ElementFactory::make("queue")
            .property("max-size-buffers", 2u32)
            .property_from_str("leaky", "downstream")
            .build()
            .map_err(missing_factory("queue"))?;

        let videoconvert = gst::ElementFactory::make("videoconvert")
            .build()
            .map_err(missing_factory("videoconvert"))?;

        let caps = gst::Caps::builder("video/x-raw").field("format", "RGB").build();
        let capsfilter = gst::ElementFactory::make("capsfilter")
            .property("caps", &caps)
            .build()
            .map_err(missing_factory("capsfilter"))?;

        let appsink = gst_app::AppSink::builder()
            .name("sink")
            .max_buffers(1)
            .drop(true)
            .sync(false)
            .build();

        let linked = [&queue, &videoconvert, &capsfilter, appsink.upcast_ref()];
        pipeline
            .add_many([&decode, &queue, &videoconvert, &capsfilter, appsink.upcast_ref()])
            .map_err(|e| CaptureError::Fatal(format!("failed to assemble pipeline: {}", e)))?;
        gst::Element::link_many(linked)
            .map_err(|e| CaptureError::Fatal(format!("failed to link pipeline: {}", e)))?;

        // uridecodebin exposes pads once the stream is typed; take the first video one
        let queue_weak = queue.downgrade();
        decode.connect_pad_added(move |_, src_pad| {
            let Some(queue) = queue_weak.upgrade() else {
                return;
            };
            let Some(sink_pad) = queue.static_pad("sink") else {
                return;
            };
            if sink_pad.is_linked() {
                return;
            }

            let caps = src_pad
                .current_caps()
                .unwrap_or_else(|| src_pad.query_caps(None));
            let is_video = caps
                .structure(0)
                .map(|s| s.name().as_str().starts_with("video/"))
                .unwrap_or(false);
            if !is_video {
                debug!(pad = %src_pad.name(), "Ignoring non-video pad");
                return;
            }

            if let Err(e) = src_pad.link(&sink_pad) {
                warn!(error = ?e, "Failed to link decoded video pad");
            }
        });

        Ok((pipeline, appsink))
    }
}

impl CaptureBackend for GstBackend {
    fn open(&mut self, url: &str) -> Result<Box<dyn CaptureConnection>, CaptureError> {
        debug!(url = %redact(url), "Creating GStreamer pipeline");
        let (pipeline, appsink) = Self::build_pipeline(url)?;

        let connection = GstConnection {
            pipeline,
            appsink,
            read_timeout: self.read_timeout,
        };

        connection
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|_| CaptureError::SourceUnavailable(connection.bus_error_or("failed to start pipeline")))?;

        let timeout = gst::ClockTime::from_mseconds(self.open_timeout.as_millis() as u64);
        let (result, current, _pending) = connection.pipeline.state(timeout);
        if result.is_err() || current != gst::State::Playing {
            return Err(CaptureError::SourceUnavailable(
                connection.bus_error_or("pipeline did not reach PLAYING"),
            ));
        }

        info!(url = %redact(url), "GStreamer pipeline playing");
        Ok(Box::new(connection))
    }
}

fn missing_factory(factory: &'static str) -> impl FnOnce(gst::glib::BoolError) -> CaptureError {
    move |e| CaptureError::Fatal(format!("failed to create {}: {}", factory, e))
}

struct GstConnection {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    read_timeout: Duration,
}

impl GstConnection {
    /// First error or EOS queued on the bus, if any.
    fn poll_bus(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        while let Some(message) = bus.timed_pop(gst::ClockTime::ZERO) {
            use gst::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Some(format!(
                        "{} (from {})",
                        err.error(),
                        err.src()
                            .map(|s| s.path_string().to_string())
                            .unwrap_or_else(|| "unknown".into())
                    ));
                }
                MessageView::Eos(..) => return Some("end of stream".to_string()),
                _ => {}
            }
        }
        None
    }

    fn bus_error_or(&self, fallback: &str) -> String {
        self.poll_bus().unwrap_or_else(|| fallback.to_string())
    }
}

impl CaptureConnection for GstConnection {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if let Some(reason) = self.poll_bus() {
            return Err(CaptureError::FrameReadFailed(reason));
        }

        let timeout = gst::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);
        let sample = match self.appsink.try_pull_sample(timeout) {
            Some(sample) => sample,
            None if self.appsink.is_eos() => {
                return Err(CaptureError::FrameReadFailed("end of stream".to_string()))
            }
            None => {
                return Err(CaptureError::FrameReadFailed(
                    self.bus_error_or("timed out waiting for frame"),
                ))
            }
        };

        sample_to_frame(&sample)
    }
}

impl Drop for GstConnection {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Copy a sample into a tightly packed RGB frame, dropping row padding.
fn sample_to_frame(sample: &gst::Sample) -> Result<Frame, CaptureError> {
    let fail = |what: &str| CaptureError::FrameReadFailed(what.to_string());

    let buffer = sample.buffer().ok_or_else(|| fail("sample had no buffer"))?;
    let caps = sample.caps().ok_or_else(|| fail("sample had no caps"))?;
    let info = gst_video::VideoInfo::from_caps(caps).map_err(|_| fail("unparseable video caps"))?;

    let width = info.width();
    let height = info.height();
    let row_bytes = width as usize * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().map_err(|_| fail("unable to map buffer"))?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data.get(..len).ok_or_else(|| fail("short buffer"))?;
        return Ok(Frame::new(width, height, pixels.to_vec()));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let line = data
            .get(start..start + row_bytes)
            .ok_or_else(|| fail("short buffer"))?;
        pixels.extend_from_slice(line);
    }
    Ok(Frame::new(width, height, pixels))
}
