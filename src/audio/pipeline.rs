//! Capture & encoding pipeline.
//!
//! A dedicated worker thread polls the audio source, feeds the analysis tap,
//! cuts 100 ms frames, encodes them and forwards them to the channel. Frames
//! produced while the channel is closed or the microphone is muted are
//! dropped on the spot; nothing is buffered for later.

use crate::audio::convert::{StreamResampler, i16_slice_to_f32};
use crate::audio::encoder::{Codec, FrameAssembler, FrameEncoder, build_encoder};
use crate::audio::recorder::{AudioSource, CaptureConstraints};
use crate::audio::tap::AnalysisTap;
use crate::channel::ChannelManager;
use crate::defaults;
use crate::error::{Result, SharedError, VoiceLinkError};
use crate::events::{Registry, Subscription};
use crate::sync::lock;
use crossbeam_channel::{Receiver, Sender, bounded, select, tick};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Where encoded frames go.
pub trait FrameSink: Send + Sync {
    fn is_open(&self) -> bool;

    /// Returns false if the frame was not sent.
    fn send_frame(&self, frame: Vec<u8>) -> bool;
}

impl<M> FrameSink for ChannelManager<M>
where
    M: DeserializeOwned + Send + Sync + 'static,
{
    fn is_open(&self) -> bool {
        ChannelManager::is_open(self)
    }

    fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.send_binary(frame)
    }
}

/// Opens the microphone for one capture session.
pub type SourceFactory =
    Arc<dyn Fn(&CaptureConstraints) -> Result<Box<dyn AudioSource>> + Send + Sync>;

/// Configuration for the capture pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rate of outbound frames; sources at other rates are resampled.
    pub sample_rate: u32,
    pub codec: Codec,
    pub constraints: CaptureConstraints,
    /// Polling interval of the capture worker.
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: defaults::CAPTURE_SAMPLE_RATE,
            codec: Codec::default(),
            constraints: CaptureConstraints::default(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Frame counters for the current process.
#[derive(Debug, Default)]
pub struct PipelineStats {
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl PipelineStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Assembles, gates, encodes and forwards captured samples.
///
/// Owned by the worker thread; split out so the gating is testable without
/// threads.
struct Forwarder {
    assembler: FrameAssembler,
    encoder: Box<dyn FrameEncoder>,
    sink: Arc<dyn FrameSink>,
    tap: Arc<AnalysisTap>,
    muted: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    resampler: StreamResampler,
}

impl Forwarder {
    fn process(&mut self, samples: &[i16]) {
        let resampled;
        let samples = if self.resampler.is_passthrough() {
            samples
        } else {
            resampled = self.resampler.process_i16(samples);
            &resampled
        };

        self.tap.push(&i16_slice_to_f32(samples));

        for frame in self.assembler.push(samples) {
            if self.muted.load(Ordering::Relaxed) || !self.sink.is_open() {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match self.encoder.encode(&frame.samples) {
                Ok(bytes) => {
                    if self.sink.send_frame(bytes) {
                        self.stats.sent.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    tracing::warn!(sequence = frame.sequence, "Dropping frame: {}", e);
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

struct Worker {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
    source: Arc<Mutex<Box<dyn AudioSource>>>,
    /// Set by the worker once it has given up on a capture error and
    /// released the source.
    exited: Arc<AtomicBool>,
}

impl Worker {
    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// Microphone capture that streams encoded frames to a [`FrameSink`].
pub struct CapturePipeline {
    config: PipelineConfig,
    sink: Arc<dyn FrameSink>,
    source_factory: SourceFactory,
    tap: Arc<AnalysisTap>,
    muted: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
    worker: Mutex<Option<Worker>>,
    on_error: Registry<SharedError>,
}

impl CapturePipeline {
    pub fn new(config: PipelineConfig, sink: Arc<dyn FrameSink>, source_factory: SourceFactory) -> Self {
        Self {
            config,
            sink,
            source_factory,
            tap: Arc::new(AnalysisTap::default()),
            muted: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(PipelineStats::default()),
            worker: Mutex::new(None),
            on_error: Registry::new("capture.error"),
        }
    }

    /// Acquire the microphone and start streaming. No-op if already running.
    ///
    /// A worker that stopped on a capture error is replaced.
    ///
    /// # Errors
    /// Returns `VoiceLinkError::MicrophoneAccess` (also published to error
    /// subscribers) if the device cannot be opened; nothing stays allocated.
    pub fn start_mic(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        match worker.as_ref() {
            Some(current) if !current.has_exited() => return Ok(()),
            Some(_) => {
                // Already released its source; dropping the handle detaches
                // a thread that may still be publishing the error.
                tracing::debug!("Replacing capture worker that stopped on error");
                *worker = None;
            }
            None => {}
        }
        match self.spawn_worker() {
            Ok(started) => {
                *worker = Some(started);
                Ok(())
            }
            Err(error) => {
                drop(worker);
                tracing::error!("Microphone unavailable: {}", error);
                self.on_error.emit(&Arc::new(error.duplicate()));
                Err(error)
            }
        }
    }

    fn spawn_worker(&self) -> Result<Worker> {
        let encoder = build_encoder(self.config.codec, self.config.sample_rate)?;
        let mut source = (self.source_factory)(&self.config.constraints).map_err(as_access_error)?;
        source.start().map_err(as_access_error)?;
        source.set_enabled(!self.muted.load(Ordering::Relaxed));

        tracing::info!(
            codec = encoder.name(),
            source_rate = source.sample_rate(),
            "Microphone started"
        );

        let mut forwarder = Forwarder {
            assembler: FrameAssembler::new(self.config.sample_rate),
            encoder,
            sink: Arc::clone(&self.sink),
            tap: Arc::clone(&self.tap),
            muted: Arc::clone(&self.muted),
            stats: Arc::clone(&self.stats),
            resampler: StreamResampler::new(source.sample_rate(), self.config.sample_rate),
        };
        let source = Arc::new(Mutex::new(source));
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(self.config.poll_interval);
        let errors = self.on_error.clone();
        let worker_source = Arc::clone(&source);
        let exited = Arc::new(AtomicBool::new(false));
        let worker_exited = Arc::clone(&exited);

        let thread = thread::Builder::new()
            .name("voicelink-capture".to_string())
            .spawn(move || {
                let Some(error) = capture_loop(&worker_source, &mut forwarder, &stop_rx, &ticker)
                else {
                    return;
                };
                tracing::error!("Audio capture error: {}", error);
                let stopped = lock(&worker_source).stop();
                if let Err(stop_err) = stopped {
                    tracing::debug!("Failed to release microphone: {}", stop_err);
                }
                forwarder.tap.clear();
                worker_exited.store(true, Ordering::SeqCst);
                // No locks held: handlers may stop, restart or mute the pipeline.
                errors.emit(&Arc::new(error));
            })
            .map_err(|e| {
                if let Err(stop_err) = lock(&source).stop() {
                    tracing::debug!("Failed to release microphone: {}", stop_err);
                }
                VoiceLinkError::AudioCapture {
                    message: format!("Failed to spawn capture thread: {}", e),
                }
            })?;

        Ok(Worker {
            stop_tx,
            thread,
            source,
            exited,
        })
    }

    /// Stop streaming and release the microphone.
    ///
    /// Returns once the worker has exited. Idempotent; safe when never started.
    pub fn stop_mic(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        worker.stop_tx.send(()).ok();
        if worker.has_exited() {
            // Died on a capture error and already released the source; the
            // thread may still be publishing that error, possibly to us.
            tracing::debug!("Capture worker already stopped on error");
        } else {
            if worker.thread.thread().id() == thread::current().id() {
                tracing::debug!("Capture worker stopping from its own thread");
            } else if worker.thread.join().is_err() {
                tracing::error!("Capture thread panicked");
            }
            let stopped = lock(&worker.source).stop();
            if let Err(e) = stopped {
                tracing::warn!("Failed to stop audio source: {}", e);
            }
        }
        self.tap.clear();
        tracing::info!(
            sent = self.stats.sent(),
            dropped = self.stats.dropped(),
            "Microphone stopped"
        );
    }

    /// Mute or unmute. A muted source yields silence and frames are dropped.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        if let Some(worker) = lock(&self.worker).as_ref() {
            lock(&worker.source).set_enabled(!muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// True while a worker is capturing. False once it stopped on an error.
    pub fn is_running(&self) -> bool {
        lock(&self.worker).as_ref().is_some_and(|w| !w.has_exited())
    }

    pub fn tap(&self) -> Arc<AnalysisTap> {
        Arc::clone(&self.tap)
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SharedError) + Send + Sync + 'static,
    {
        self.on_error.subscribe(handler)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop_mic();
    }
}

/// Device-open failures surface as access errors, except a missing device.
fn as_access_error(error: VoiceLinkError) -> VoiceLinkError {
    match error {
        VoiceLinkError::MicrophoneAccess { .. } | VoiceLinkError::AudioDeviceNotFound { .. } => {
            error
        }
        other => VoiceLinkError::MicrophoneAccess {
            message: other.to_string(),
        },
    }
}

/// Poll the source until told to stop. Returns the read error that ended
/// capture, if any.
fn capture_loop(
    source: &Mutex<Box<dyn AudioSource>>,
    forwarder: &mut Forwarder,
    stop_rx: &Receiver<()>,
    ticker: &Receiver<std::time::Instant>,
) -> Option<VoiceLinkError> {
    loop {
        select! {
            recv(stop_rx) -> _ => return None,
            recv(ticker) -> _ => {
                let read = lock(source).read_samples();
                match read {
                    Ok(samples) if !samples.is_empty() => forwarder.process(&samples),
                    Ok(_) => {}
                    Err(e) => return Some(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encoder::Pcm16Encoder;
    use crate::audio::recorder::MockAudioSource;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingSink {
        open: AtomicBool,
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingSink {
        fn opened() -> Arc<Self> {
            let sink = Arc::new(Self::default());
            sink.open.store(true, Ordering::SeqCst);
            sink
        }

        fn count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    impl FrameSink for RecordingSink {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn send_frame(&self, frame: Vec<u8>) -> bool {
            if !self.is_open() {
                return false;
            }
            self.frames.lock().unwrap().push(frame);
            true
        }
    }

    fn forwarder(sink: Arc<RecordingSink>) -> Forwarder {
        Forwarder {
            assembler: FrameAssembler::new(16000),
            encoder: Box::new(Pcm16Encoder),
            sink,
            tap: Arc::new(AnalysisTap::default()),
            muted: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(PipelineStats::default()),
            resampler: StreamResampler::new(16000, 16000),
        }
    }

    fn factory(source: MockAudioSource) -> SourceFactory {
        Arc::new(move |_: &CaptureConstraints| {
            Ok(Box::new(source.clone()) as Box<dyn AudioSource>)
        })
    }

    /// The first source dies after three reads; later ones stay healthy.
    fn flaky_factory(opened: Arc<AtomicUsize>) -> SourceFactory {
        Arc::new(move |_: &CaptureConstraints| {
            let source = MockAudioSource::new().with_samples(vec![500i16; 1600]);
            let source = if opened.fetch_add(1, Ordering::SeqCst) == 0 {
                source.with_read_failure_after(3)
            } else {
                source
            };
            Ok(Box::new(source) as Box<dyn AudioSource>)
        })
    }

    fn collect_errors(pipeline: &CapturePipeline) -> Arc<Mutex<Vec<String>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = Arc::clone(&errors);
            pipeline.on_error(move |e| errors.lock().unwrap().push(e.to_string()));
        }
        errors
    }

    fn wait_for(deadline: Duration, condition: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_closed_channel_drops_without_backlog() {
        let sink = Arc::new(RecordingSink::default());
        let mut fwd = forwarder(Arc::clone(&sink));

        fwd.process(&vec![100i16; 1600 * 3]);
        assert_eq!(sink.count(), 0);
        assert_eq!(fwd.stats.dropped(), 3);

        sink.open.store(true, Ordering::SeqCst);
        fwd.process(&vec![100i16; 1600]);

        assert_eq!(sink.count(), 1);
        assert_eq!(fwd.stats.sent(), 1);
    }

    #[test]
    fn test_muted_frames_are_dropped() {
        let sink = RecordingSink::opened();
        let mut fwd = forwarder(Arc::clone(&sink));
        fwd.muted.store(true, Ordering::SeqCst);

        fwd.process(&vec![100i16; 3200]);
        assert_eq!(sink.count(), 0);

        fwd.muted.store(false, Ordering::SeqCst);
        fwd.process(&vec![100i16; 1600]);
        assert_eq!(sink.count(), 1);
    }

    #[test]
    fn test_frames_preserve_capture_order() {
        let sink = RecordingSink::opened();
        let mut fwd = forwarder(Arc::clone(&sink));

        fwd.process(&vec![1i16; 1600]);
        fwd.process(&vec![2i16; 800]);
        fwd.process(&vec![3i16; 800]);

        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][..2], [1, 0]);
        assert_eq!(frames[1][..2], [2, 0]);
        assert_eq!(frames[1][frames[1].len() - 2..], [3, 0]);
        assert_eq!(frames[0].len(), 3200);
    }

    #[test]
    fn test_tap_receives_samples_even_when_closed() {
        let sink = Arc::new(RecordingSink::default());
        let mut fwd = forwarder(sink);
        fwd.process(&[16384i16; 10]);
        assert_eq!(fwd.tap.snapshot(), vec![0.5; 10]);
    }

    #[test]
    fn test_source_rate_is_resampled() {
        let sink = RecordingSink::opened();
        let mut fwd = forwarder(Arc::clone(&sink));
        fwd.resampler = StreamResampler::new(48000, 16000);

        fwd.process(&vec![100i16; 4800]);

        assert_eq!(sink.count(), 1);
        assert_eq!(sink.frames.lock().unwrap()[0].len(), 3200);
    }

    #[test]
    fn test_start_failure_reports_access_error_and_allocates_nothing() {
        let sink = RecordingSink::opened();
        let pipeline = CapturePipeline::new(
            PipelineConfig::default(),
            sink,
            factory(MockAudioSource::new().with_start_failure()),
        );
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = Arc::clone(&errors);
            pipeline.on_error(move |e| errors.lock().unwrap().push(e.to_string()));
        }

        let result = pipeline.start_mic();

        assert!(matches!(result, Err(VoiceLinkError::MicrophoneAccess { .. })));
        assert!(!pipeline.is_running());
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_factory_failure_is_access_error() {
        let sink = RecordingSink::opened();
        let failing: SourceFactory = Arc::new(|_: &CaptureConstraints| {
            Err(VoiceLinkError::AudioCapture {
                message: "no backend".to_string(),
            })
        });
        let pipeline = CapturePipeline::new(PipelineConfig::default(), sink, failing);

        assert!(matches!(
            pipeline.start_mic(),
            Err(VoiceLinkError::MicrophoneAccess { .. })
        ));
    }

    #[test]
    fn test_worker_streams_and_stops() {
        let sink = RecordingSink::opened();
        let pipeline = CapturePipeline::new(
            PipelineConfig::default(),
            Arc::clone(&sink) as Arc<dyn FrameSink>,
            factory(MockAudioSource::new().with_samples(vec![500i16; 1600])),
        );

        pipeline.start_mic().unwrap();
        pipeline.start_mic().unwrap();
        assert!(pipeline.is_running());
        assert!(wait_for(Duration::from_secs(2), || sink.count() >= 3));

        pipeline.stop_mic();
        let after_stop = sink.count();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(sink.count(), after_stop);
        assert!(!pipeline.is_running());
        assert!(pipeline.tap().is_empty());
        pipeline.stop_mic();
    }

    #[test]
    fn test_mute_stops_forwarding() {
        let sink = RecordingSink::opened();
        let pipeline = CapturePipeline::new(
            PipelineConfig::default(),
            Arc::clone(&sink) as Arc<dyn FrameSink>,
            factory(MockAudioSource::new().with_samples(vec![500i16; 1600])),
        );
        pipeline.start_mic().unwrap();
        assert!(wait_for(Duration::from_secs(2), || sink.count() >= 1));

        pipeline.set_muted(true);
        thread::sleep(Duration::from_millis(30));
        let muted_count = sink.count();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(sink.count(), muted_count);
        assert!(pipeline.stats().dropped() > 0);
        // The disabled source feeds silence to the tap.
        assert!(wait_for(Duration::from_secs(1), || {
            pipeline.tap().snapshot().iter().rev().take(100).all(|&s| s == 0.0)
        }));

        pipeline.set_muted(false);
        assert!(wait_for(Duration::from_secs(2), || sink.count() > muted_count));
        pipeline.stop_mic();
    }

    #[test]
    fn test_stop_when_never_started() {
        let pipeline = CapturePipeline::new(
            PipelineConfig::default(),
            RecordingSink::opened(),
            factory(MockAudioSource::new()),
        );
        pipeline.stop_mic();
        pipeline.set_muted(true);
        assert!(pipeline.is_muted());
    }

    #[test]
    fn test_read_failure_mid_session_stops_worker() {
        let sink = RecordingSink::opened();
        let pipeline = CapturePipeline::new(
            PipelineConfig::default(),
            Arc::clone(&sink) as Arc<dyn FrameSink>,
            factory(
                MockAudioSource::new()
                    .with_samples(vec![500i16; 1600])
                    .with_read_failure_after(3),
            ),
        );
        let errors = collect_errors(&pipeline);

        pipeline.start_mic().unwrap();
        assert!(wait_for(Duration::from_secs(2), || {
            !errors.lock().unwrap().is_empty()
        }));

        assert!(!pipeline.is_running());
        assert!(pipeline.tap().is_empty());
        assert_eq!(sink.count(), 3);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("mock audio error"), "got: {}", errors[0]);
    }

    #[test]
    fn test_restart_after_read_failure() {
        let sink = RecordingSink::opened();
        let opened = Arc::new(AtomicUsize::new(0));
        let pipeline = CapturePipeline::new(
            PipelineConfig::default(),
            Arc::clone(&sink) as Arc<dyn FrameSink>,
            flaky_factory(Arc::clone(&opened)),
        );
        let errors = collect_errors(&pipeline);

        pipeline.start_mic().unwrap();
        assert!(wait_for(Duration::from_secs(2), || !pipeline.is_running()));
        let before = sink.count();

        pipeline.start_mic().unwrap();
        assert!(pipeline.is_running());
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        assert!(wait_for(Duration::from_secs(2), || sink.count() >= before + 3));
        assert_eq!(errors.lock().unwrap().len(), 1);

        pipeline.stop_mic();
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_error_subscriber_can_mute_and_stop() {
        let pipeline = Arc::new(CapturePipeline::new(
            PipelineConfig::default(),
            RecordingSink::opened(),
            factory(MockAudioSource::new().with_read_failure_after(1)),
        ));
        let handled = Arc::new(AtomicBool::new(false));
        {
            let weak = Arc::downgrade(&pipeline);
            let handled = Arc::clone(&handled);
            pipeline.on_error(move |_| {
                if let Some(pipeline) = weak.upgrade() {
                    pipeline.set_muted(true);
                    pipeline.stop_mic();
                    handled.store(true, Ordering::SeqCst);
                }
            });
        }

        pipeline.start_mic().unwrap();

        assert!(wait_for(Duration::from_secs(2), || handled.load(Ordering::SeqCst)));
        assert!(pipeline.is_muted());
        assert!(!pipeline.is_running());
        pipeline.stop_mic();
    }
}
