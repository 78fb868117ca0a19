//! Audio output using the `cpal` library
use std::sync::{Arc, Mutex};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    BuildStreamError, Device, OutputCallbackInfo, SampleFormat, Stream, StreamConfig,
    SupportedBufferSize,
};

use super::{AudioBackendManager, RenderThreadInit};

use crate::context::BridgeOptions;
use crate::render::BridgeRenderer;
use crate::AtomicF64;

mod private {
    use super::*;

    #[derive(Clone)]
    pub struct ThreadSafeClosableStream(Arc<Mutex<Option<Stream>>>);

    impl ThreadSafeClosableStream {
        pub fn new(stream: Stream) -> Self {
            Self(Arc::new(Mutex::new(Some(stream))))
        }

        pub fn close(&self) {
            if let Ok(mut stream) = self.0.lock() {
                stream.take(); // will Drop
            }
        }

        pub fn resume(&self) -> bool {
            match self.0.lock().as_deref() {
                Ok(Some(s)) => match s.play() {
                    Ok(()) => true,
                    Err(e) => {
                        log::error!("Error resuming cpal stream: {:?}", e);
                        false
                    }
                },
                _ => false,
            }
        }

        pub fn suspend(&self) -> bool {
            match self.0.lock().as_deref() {
                Ok(Some(s)) => match s.pause() {
                    Ok(()) => true,
                    Err(e) => {
                        log::error!("Error suspending cpal stream: {:?}", e);
                        false
                    }
                },
                _ => false,
            }
        }
    }

    // SAFETY:
    // The cpal `Stream` is marked !Sync and !Send because some platforms are not thread-safe
    // https://github.com/RustAudio/cpal/commit/33ddf749548d87bf54ce18eb342f954cec1465b2
    // Since we wrap the Stream in a Mutex, we should be fine
    unsafe impl Sync for ThreadSafeClosableStream {}
    unsafe impl Send for ThreadSafeClosableStream {}
}
use private::ThreadSafeClosableStream;

/// Audio backend using the `cpal` library
pub(crate) struct CpalBackend {
    stream: ThreadSafeClosableStream,
    output_latency: Arc<AtomicF64>,
    sample_rate: f32,
    number_of_channels: usize,
    frame_count: usize,
    sink_id: String,
}

impl AudioBackendManager for CpalBackend {
    fn build_output(options: BridgeOptions, render_thread_init: RenderThreadInit) -> Self
    where
        Self: Sized,
    {
        let host = cpal::default_host();
        log::info!("Host: {:?}", host.id());

        let device = if options.sink_id.is_empty() {
            host.default_output_device()
        } else {
            host.output_devices().ok().and_then(|mut devices| {
                devices.find(|d| d.name().map(|n| n == options.sink_id).unwrap_or(false))
            })
        }
        .expect("no output device available");

        log::info!("Output device: {:?}", device.name());

        let supported = device
            .default_output_config()
            .expect("error while querying config");

        let mut prefered: StreamConfig = supported.clone().into();

        // set specific sample rate if requested
        if let Some(sample_rate) = options.sample_rate {
            crate::assert_valid_sample_rate(sample_rate);
            prefered.sample_rate.0 = sample_rate as u32;
        }

        // the bridge renders the requested channel layout, the device decides how many it plays
        prefered.channels = options.number_of_channels as u16;

        // always try to set a decent buffer size
        let frame_count = super::buffer_size_for_latency_category(
            options.latency_hint,
            prefered.sample_rate.0 as f32,
        )
        .min(options.max_frame_count);

        let clamped_buffer_size: u32 = match supported.buffer_size() {
            SupportedBufferSize::Unknown => frame_count as u32,
            SupportedBufferSize::Range { min, max } => (frame_count as u32).clamp(*min, *max),
        };

        prefered.buffer_size = cpal::BufferSize::Fixed(clamped_buffer_size);

        let output_latency = Arc::new(AtomicF64::new(0.));
        let mut number_of_channels = usize::from(prefered.channels);
        let mut sample_rate = prefered.sample_rate.0 as f32;

        let renderer = BridgeRenderer::new(
            sample_rate,
            number_of_channels,
            frame_count,
            options.max_frame_count,
            render_thread_init.clone(),
        );

        log::debug!(
            "Attempt output stream with prefered config: {:?}",
            &prefered
        );
        let spawned = spawn_output_stream(
            &device,
            supported.sample_format(),
            &prefered,
            renderer,
            Arc::clone(&output_latency),
        );

        let stream = match spawned {
            Ok(stream) => {
                log::debug!("Output stream set up successfully");
                stream
            }
            Err(e) => {
                log::warn!("Output stream build failed with prefered config: {}", e);

                let supported_config: StreamConfig = supported.clone().into();
                number_of_channels = usize::from(supported_config.channels);
                sample_rate = supported_config.sample_rate.0 as f32;

                log::debug!(
                    "Attempt output stream with fallback config: {:?}",
                    &supported_config
                );

                let renderer = BridgeRenderer::new(
                    sample_rate,
                    number_of_channels,
                    frame_count,
                    options.max_frame_count,
                    render_thread_init,
                );

                let spawned = spawn_output_stream(
                    &device,
                    supported.sample_format(),
                    &supported_config,
                    renderer,
                    Arc::clone(&output_latency),
                );
                spawned.expect("OutputStream build failed with default config")
            }
        };

        if let Err(e) = stream.play() {
            log::error!("Stream refused to play: {}", e);
        }

        CpalBackend {
            stream: ThreadSafeClosableStream::new(stream),
            output_latency,
            sample_rate,
            number_of_channels,
            frame_count,
            sink_id: options.sink_id,
        }
    }

    fn resume(&self) -> bool {
        self.stream.resume()
    }

    fn suspend(&self) -> bool {
        self.stream.suspend()
    }

    fn close(&self) {
        self.stream.close()
    }

    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn number_of_channels(&self) -> usize {
        self.number_of_channels
    }

    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn output_latency(&self) -> f64 {
        self.output_latency.load()
    }

    fn sink_id(&self) -> &str {
        self.sink_id.as_str()
    }
}

fn latency_in_seconds(infos: &OutputCallbackInfo) -> f64 {
    let timestamp = infos.timestamp();
    match timestamp.playback.duration_since(&timestamp.callback) {
        Some(delta) => delta.as_secs() as f64 + delta.subsec_nanos() as f64 * 1e-9,
        None => 0.,
    }
}

/// Creates an output stream
///
/// # Arguments:
///
/// * `device` - the output audio device on which the stream is created
/// * `sample_format` - audio sample format of the stream
/// * `config` - stream configuration
/// * `render` - the real-time side of the bridge
fn spawn_output_stream(
    device: &Device,
    sample_format: SampleFormat,
    config: &StreamConfig,
    mut render: BridgeRenderer,
    output_latency: Arc<AtomicF64>,
) -> Result<Stream, BuildStreamError> {
    let err_fn = |err| log::error!("an error occurred on the output audio stream: {}", err);

    macro_rules! build {
        ($t:ty) => {
            device.build_output_stream(
                config,
                move |d: &mut [$t], i: &OutputCallbackInfo| {
                    render.render(d);
                    output_latency.store(latency_in_seconds(i));
                },
                err_fn,
                None,
            )
        };
    }

    match sample_format {
        SampleFormat::F32 => build!(f32),
        SampleFormat::F64 => build!(f64),
        SampleFormat::U8 => build!(u8),
        SampleFormat::U16 => build!(u16),
        SampleFormat::U32 => build!(u32),
        SampleFormat::U64 => build!(u64),
        SampleFormat::I8 => build!(i8),
        SampleFormat::I16 => build!(i16),
        SampleFormat::I32 => build!(i32),
        SampleFormat::I64 => build!(i64),
        _ => Err(BuildStreamError::StreamConfigNotSupported),
    }
}
