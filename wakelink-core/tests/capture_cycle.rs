use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use wakelink_core::container;
use wakelink_core::transport::{Connection, Method, Request, ResponseHead};
use wakelink_core::{
    DeviceIo, EngineConfig, EngineStatus, EngineStatusEvent, LocationInfo, Result, SampleSink,
    Transport, WakeEngine, WakeError, WavFileSource,
};

const RATE: u32 = 16_000;
const CHUNK: usize = 1_600;

#[derive(Default)]
struct Seen {
    requests: Vec<Request>,
    upload_body: Vec<u8>,
}

/// Answers the upload with a JSON reply and the download with a short tone.
struct ServiceStub {
    seen: Arc<Mutex<Seen>>,
    reply: Vec<u8>,
    reply_audio: Vec<u8>,
}

struct StubConnection {
    seen: Arc<Mutex<Seen>>,
    is_upload: bool,
    status: u16,
    body: VecDeque<u8>,
}

impl Transport for ServiceStub {
    fn open(&self, request: &Request) -> Result<Box<dyn Connection>> {
        self.seen.lock().requests.push(request.clone());
        let body = match request.method {
            Method::Post => self.reply.clone(),
            Method::Get => self.reply_audio.clone(),
        };
        Ok(Box::new(StubConnection {
            seen: Arc::clone(&self.seen),
            is_upload: request.method == Method::Post,
            status: 200,
            body: body.into(),
        }))
    }
}

impl Connection for StubConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.is_upload {
            self.seen.lock().upload_body.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn fetch_headers(&mut self, _wait: Duration) -> Result<Option<ResponseHead>> {
        Ok(Some(ResponseHead {
            status: self.status,
            content_length: Some(self.body.len() as u64),
        }))
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.body.len());
        for (dst, src) in buf.iter_mut().zip(self.body.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

struct RecordingSink(Arc<Mutex<Vec<(usize, u32)>>>);

impl SampleSink for RecordingSink {
    fn play(&mut self, samples: &[i16], sample_rate: u32) -> Result<()> {
        self.0.lock().push((samples.len(), sample_rate));
        Ok(())
    }
}

fn syllable() -> Vec<i16> {
    let mut chunk: Vec<i16> = (0..640)
        .map(|i| if i % 2 == 0 { 8_000 } else { -8_000 })
        .collect();
    chunk.resize(CHUNK, 0);
    chunk
}

/// Quiet lead-in, a two-chunk wake candidate, then enough quiet audio for the
/// 3 s recording and the 3 s cooldown.
fn wake_signal() -> Vec<i16> {
    let mut out = vec![0i16; CHUNK * 5];
    out.extend(syllable());
    out.extend(syllable());
    out.extend(vec![0i16; CHUNK * 80]);
    out
}

fn reply_wav(samples: usize) -> Vec<u8> {
    let mut out = container::build_header(samples as u32 * 2, 22_050).to_vec();
    for i in 0..samples {
        out.extend_from_slice(&((i as i16) * 10).to_le_bytes());
    }
    out
}

async fn wait_for_status(
    rx: &mut broadcast::Receiver<EngineStatusEvent>,
    wanted: EngineStatus,
) -> Vec<EngineStatus> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Ok(event)) => {
                seen.push(event.status);
                if event.status == wanted {
                    return seen;
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
            Err(_) => continue,
        }
    }
    panic!("never saw {wanted:?}; saw {seen:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wake_upload_reply_and_playback() {
    let seen = Arc::new(Mutex::new(Seen::default()));
    let played = Arc::new(Mutex::new(Vec::new()));

    let mut config = EngineConfig::default();
    config.endpoints.upload_url = "http://svc/upload".into();
    config.endpoints.reply_audio_url = "http://svc/voice.wav".into();
    config.api_key = "k-123".into();
    config.location = Some(LocationInfo {
        city: "Hsinchu".into(),
        country_code: "TW".into(),
        ..Default::default()
    });
    config.upload.inter_chunk_delay = Duration::ZERO;

    let engine = WakeEngine::new(config, None);
    let mut status_rx = engine.subscribe_status();
    let mut wake_rx = engine.subscribe_wakes();
    let mut exchange_rx = engine.subscribe_exchanges();

    let io_seen = Arc::clone(&seen);
    let io_played = Arc::clone(&played);
    engine
        .start_with(move |config: &EngineConfig| {
            Ok(DeviceIo {
                source: Box::new(WavFileSource::from_samples(wake_signal(), config.sample_rate)),
                sink: Box::new(RecordingSink(io_played)),
                transport: Box::new(ServiceStub {
                    seen: io_seen,
                    reply: br#"{"stt_text":"turn on the lights","ai_reply":"Okay.\nDone.","tts_saved":true}"#
                        .to_vec(),
                    reply_audio: reply_wav(300),
                }),
            })
        })
        .expect("engine start");

    let statuses = wait_for_status(&mut status_rx, EngineStatus::Stopped).await;
    assert_eq!(
        statuses,
        vec![
            EngineStatus::Listening,
            EngineStatus::Collecting,
            EngineStatus::Recording,
            EngineStatus::Uploading,
            EngineStatus::Playing,
            EngineStatus::Cooldown,
            EngineStatus::Listening,
            EngineStatus::Stopped,
        ]
    );

    let wake = wake_rx.try_recv().expect("wake event");
    assert_eq!(wake.duration_ms, 200);

    let exchange = exchange_rx.try_recv().expect("exchange event");
    assert!(exchange.ok, "exchange failed: {:?}", exchange.error);
    assert_eq!(exchange.transcript.as_deref(), Some("turn on the lights"));
    assert_eq!(exchange.reply.as_deref(), Some("Okay.\nDone."));
    assert!(exchange.reply_audio_played);

    let seen = seen.lock();
    assert_eq!(seen.requests.len(), 2);
    let upload = &seen.requests[0];
    assert_eq!(upload.method, Method::Post);
    assert_eq!(upload.header_value("x-api-key"), Some("k-123"));
    assert_eq!(upload.header_value("content-type"), Some("audio/wav"));
    assert!(upload
        .header_value("x-esp32-loc")
        .is_some_and(|v| v.contains("Hsinchu")));

    let header = container::validate(&seen.upload_body).expect("valid upload container");
    assert_eq!(header.sample_rate, RATE);
    assert_eq!(header.data_len as usize, RATE as usize * 3 * 2);
    assert_eq!(seen.upload_body.len(), container::HEADER_LEN + RATE as usize * 3 * 2);
    assert_eq!(upload.content_length, Some(seen.upload_body.len() as u64));

    assert_eq!(seen.requests[1].method, Method::Get);
    assert_eq!(&*played.lock(), &vec![(300, 22_050)]);

    let snap = engine.diagnostics_snapshot();
    assert_eq!(snap.detections, 1);
    assert_eq!(snap.replies_played, 1);
    assert!(!engine.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_start_is_rejected_and_stop_ends_the_pipeline() {
    struct Idle;
    impl wakelink_core::SampleSource for Idle {
        fn read(&mut self, _buf: &mut [i16], timeout: Duration) -> Result<usize> {
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            Ok(0)
        }
        fn sample_rate(&self) -> u32 {
            RATE
        }
    }

    let engine = WakeEngine::new(EngineConfig::default(), None);
    let mut status_rx = engine.subscribe_status();
    let open = |_config: &EngineConfig| -> Result<DeviceIo> {
        Ok(DeviceIo {
            source: Box::new(Idle),
            sink: Box::new(wakelink_core::audio::NullSink),
            transport: Box::new(ServiceStub {
                seen: Arc::default(),
                reply: Vec::new(),
                reply_audio: Vec::new(),
            }),
        })
    };
    engine.start_with(open).expect("first start");
    assert!(matches!(
        engine.start_with(open),
        Err(WakeError::AlreadyRunning)
    ));

    engine.stop().expect("stop");
    let statuses = wait_for_status(&mut status_rx, EngineStatus::Stopped).await;
    assert_eq!(statuses.first(), Some(&EngineStatus::Listening));
    assert!(matches!(engine.stop(), Err(WakeError::NotRunning)));
}
