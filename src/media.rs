use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::media::Sample as MediaSample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::MediaConfig;
use crate::error::{Error, Result};

/// Roughly two seconds of 20ms chunks.
const MAX_BUFFERED_CHUNKS: usize = 100;

/// G.711 runs at 8 kHz mono whatever the device delivers.
const PCMU_RATE: u32 = 8_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    /// Media-line order of every peer connection. Video lines always precede
    /// audio lines and the order never changes for the life of a connection.
    pub const LINE_ORDER: [TrackKind; 2] = [TrackKind::Video, TrackKind::Audio];

    pub fn mime_type(self) -> &'static str {
        match self {
            TrackKind::Video => MIME_TYPE_VP8,
            TrackKind::Audio => MIME_TYPE_PCMU,
        }
    }

    pub fn codec_type(self) -> RTPCodecType {
        match self {
            TrackKind::Video => RTPCodecType::Video,
            TrackKind::Audio => RTPCodecType::Audio,
        }
    }

    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Video => Some(TrackKind::Video),
            RTPCodecType::Audio => Some(TrackKind::Audio),
            _ => None,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// One captured track. Clones share the underlying RTP track and the
/// enabled flag, so muting is visible to every peer session at once.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: kind.mime_type().to_owned(),
                ..Default::default()
            },
            kind.to_string(),
            stream_id.to_owned(),
        ));
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Samples written while the track is disabled are dropped.
    pub async fn write_sample(&self, sample: &MediaSample) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.track.write_sample(sample).await?;
        Ok(())
    }

    fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.track, &other.track)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// The set of local tracks offered to every peer.
#[derive(Clone, Default, Debug)]
pub struct LocalMedia {
    video: Option<LocalTrack>,
    audio: Option<LocalTrack>,
}

impl LocalMedia {
    pub fn new(video: Option<LocalTrack>, audio: Option<LocalTrack>) -> Self {
        Self { video, audio }
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Video => self.video.as_ref(),
            TrackKind::Audio => self.audio.as_ref(),
        }
    }

    pub fn set_track(&mut self, kind: TrackKind, track: Option<LocalTrack>) {
        match kind {
            TrackKind::Video => self.video = track,
            TrackKind::Audio => self.audio = track,
        }
    }

    /// Tracks in media-line order.
    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        TrackKind::LINE_ORDER
            .iter()
            .filter_map(move |kind| self.track(*kind))
    }

    pub fn kinds(&self) -> Vec<TrackKind> {
        self.tracks().map(LocalTrack::kind).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }

    /// Whether both sets carry the same tracks per kind.
    pub fn same_tracks(&self, other: &LocalMedia) -> bool {
        TrackKind::LINE_ORDER.iter().all(|kind| {
            match (self.track(*kind), other.track(*kind)) {
                (Some(a), Some(b)) => a.same_track(b),
                (None, None) => true,
                _ => false,
            }
        })
    }
}

/// Acquires the local audio/video source.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire(&mut self) -> Result<LocalMedia>;
    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool);
    fn release(&mut self);
}

struct AudioChunk {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl AudioChunk {
    fn duration(&self) -> Duration {
        let frames = self.samples.len() / usize::from(self.channels.max(1));
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate.max(1)))
    }

    /// Downmixes, resamples to 8 kHz by picking the nearest earlier frame,
    /// and mu-law encodes.
    fn to_pcmu(&self) -> Bytes {
        let channels = usize::from(self.channels.max(1));
        let frames = self.samples.len() / channels;
        let rate = u64::from(self.sample_rate.max(1));
        let out_len = (frames as u64 * u64::from(PCMU_RATE) / rate) as usize;

        let mut out = Vec::with_capacity(out_len);
        for i in 0..out_len {
            let start = (i as u64 * rate / u64::from(PCMU_RATE)) as usize * channels;
            let mono = self.samples[start..start + channels].iter().sum::<f32>() / channels as f32;
            let value = (mono.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
            out.push(linear_to_ulaw(value));
        }
        Bytes::from(out)
    }
}

fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32_635;

    let mut magnitude = i32::from(sample);
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0
    };
    magnitude = magnitude.min(CLIP) + BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

struct AudioPump {
    stop: std::sync::mpsc::Sender<()>,
    thread: std::thread::JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Captures the default microphone with cpal and feeds it into the local
/// audio track. The video track is created here but frames are pushed by
/// the embedding application through [`LocalTrack::write_sample`].
pub struct DeviceCapture {
    config: MediaConfig,
    stream_id: String,
    media: Option<LocalMedia>,
    audio: Option<AudioPump>,
}

impl DeviceCapture {
    pub fn new(config: MediaConfig, stream_id: impl Into<String>) -> Self {
        Self {
            config,
            stream_id: stream_id.into(),
            media: None,
            audio: None,
        }
    }

    async fn start_audio(track: LocalTrack) -> Result<AudioPump> {
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<AudioChunk>(MAX_BUFFERED_CHUNKS);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        // cpal streams are not Send, so the stream lives and dies on its own thread.
        let thread = std::thread::Builder::new()
            .name("meshcall-audio".to_string())
            .spawn(move || {
                let stream = match open_input_stream(chunk_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| Error::MediaUnavailable(format!("audio thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| Error::MediaUnavailable("audio thread exited".to_string()))??;

        let writer = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                let sample = MediaSample {
                    data: chunk.to_pcmu(),
                    duration: chunk.duration(),
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    warn!("Failed to write audio sample: {}", e);
                }
            }
        });

        Ok(AudioPump {
            stop: stop_tx,
            thread,
            writer,
        })
    }
}

#[async_trait]
impl MediaCapture for DeviceCapture {
    async fn acquire(&mut self) -> Result<LocalMedia> {
        if let Some(media) = &self.media {
            return Ok(media.clone());
        }
        if !self.config.audio && !self.config.video {
            return Err(Error::MediaUnavailable(
                "both audio and video are disabled".to_string(),
            ));
        }

        let audio = if self.config.audio {
            let track = LocalTrack::new(TrackKind::Audio, &self.stream_id);
            self.audio = Some(Self::start_audio(track.clone()).await?);
            Some(track)
        } else {
            None
        };
        let video = self
            .config
            .video
            .then(|| LocalTrack::new(TrackKind::Video, &self.stream_id));

        let media = LocalMedia::new(video, audio);
        info!(kinds = ?media.kinds(), "local media acquired");
        self.media = Some(media.clone());
        Ok(media)
    }

    fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) {
        match self.media.as_ref().and_then(|media| media.track(kind)) {
            Some(track) => {
                track.set_enabled(enabled);
                debug!(%kind, enabled, "local track toggled");
            }
            None => debug!(%kind, "no local track to toggle"),
        }
    }

    fn release(&mut self) {
        if let Some(pump) = self.audio.take() {
            let _ = pump.stop.send(());
            pump.writer.abort();
            if pump.thread.join().is_err() {
                warn!("audio capture thread panicked");
            }
        }
        if self.media.take().is_some() {
            info!("local media released");
        }
    }
}

impl Drop for DeviceCapture {
    fn drop(&mut self) {
        self.release();
    }
}

fn open_input_stream(chunks: mpsc::Sender<AudioChunk>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::MediaUnavailable("no input device available".to_string()))?;
    let supported = device
        .default_input_config()
        .map_err(|e| Error::MediaUnavailable(e.to_string()))?;
    debug!(config = ?supported, "input config");

    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let stream = match format {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config, chunks)?,
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config, chunks)?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config, chunks)?,
        other => {
            return Err(Error::MediaUnavailable(format!(
                "unsupported sample format: {:?}",
                other
            )))
        }
    };
    stream
        .play()
        .map_err(|e| Error::MediaUnavailable(e.to_string()))?;
    Ok(stream)
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    chunks: mpsc::Sender<AudioChunk>,
) -> Result<cpal::Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let sample_rate = config.sample_rate.0;
    let channels = config.channels;
    let err_fn = |err| warn!("An error occurred on the input audio stream: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
                // full buffer means the writer is behind; drop rather than block the device
                let _ = chunks.try_send(AudioChunk {
                    samples,
                    sample_rate,
                    channels,
                });
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::MediaUnavailable(e.to_string()))
}
