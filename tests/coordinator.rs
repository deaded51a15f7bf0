use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use imgq::{
    Codec, OutputFormat, QueueConfig, QueueEvent, QueueHandle, Settings, SourceFile, Status,
    TransformError, TransformOutput, TransformRequest, UploadError,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Fake codec: waits for a permit per transform (or runs freely once the gate
/// is dropped) and encodes `source|format|quality` so tests can see which
/// bytes and settings a result came from.
struct GatedCodec {
    permits: Mutex<mpsc::Receiver<()>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl Codec for GatedCodec {
    fn transform(&self, request: &TransformRequest) -> Result<TransformOutput, TransformError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let source = String::from_utf8_lossy(&request.source).into_owned();
        self.seen.lock().unwrap().push(source.clone());
        let _ = self.permits.lock().unwrap().recv();

        self.active.fetch_sub(1, Ordering::SeqCst);
        if source.starts_with("bad") {
            return Err(TransformError::Decode {
                mime: request.mime.clone(),
                message: "corrupt data".into(),
            });
        }
        Ok(TransformOutput {
            bytes: Bytes::from(format!(
                "{}|{}|{}",
                source, request.settings.format, request.settings.quality
            )),
            width: 64,
            height: 48,
        })
    }
}

struct Session {
    handle: QueueHandle,
    events: UnboundedReceiver<QueueEvent>,
    codec: Arc<GatedCodec>,
    gate: Option<mpsc::Sender<()>>,
    token: CancellationToken,
    join: Option<JoinHandle<Result<(), anyhow::Error>>>,
}

impl Session {
    fn start(config: QueueConfig) -> Self {
        let (gate, permits) = mpsc::channel();
        let codec = Arc::new(GatedCodec {
            permits: Mutex::new(permits),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let token = CancellationToken::new();
        let (handle, events, join) = QueueHandle::spawn(token.clone(), config, codec.clone());
        Self {
            handle,
            events,
            codec,
            gate: Some(gate),
            token,
            join: Some(join),
        }
    }

    fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            for _ in 0..n {
                gate.send(()).unwrap();
            }
        }
    }

    /// Lets every current and future transform run without waiting.
    fn open_gate(&mut self) {
        self.gate.take();
    }

    fn upload(&self, names: &[&str]) -> Vec<Uuid> {
        let files = names
            .iter()
            .map(|name| SourceFile::new(format!("{name}.png"), "image/png", Bytes::from(name.to_string())))
            .collect();
        let report = self.handle.upload(files).unwrap();
        assert!(report.rejected.is_empty());
        report.accepted
    }

    async fn wait_for(&mut self, wanted: QueueEvent) -> Vec<QueueEvent> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}, saw {seen:?}"))
                .expect("event channel closed");
            let done = event == wanted;
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn seen_sources(&self) -> Vec<String> {
        self.codec.seen.lock().unwrap().clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.gate.take();
        self.token.cancel();
    }
}

fn processing_order(events: &[QueueEvent]) -> Vec<Uuid> {
    events
        .iter()
        .filter_map(|event| match event {
            QueueEvent::Processing(id) => Some(*id),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn processes_uploads_in_fifo_order_one_at_a_time() {
    let mut session = Session::start(QueueConfig::default());
    session.open_gate();
    let ids = session.upload(&["a", "b", "c"]);

    let events = session.wait_for(QueueEvent::Idle).await;
    assert_eq!(processing_order(&events), ids);

    // every item settles before the next one starts
    for id in &ids {
        let started = events.iter().position(|e| *e == QueueEvent::Processing(*id)).unwrap();
        let finished = events.iter().position(|e| *e == QueueEvent::Done(*id)).unwrap();
        assert!(started < finished);
        if let Some(next) = events[started + 1..]
            .iter()
            .position(|e| matches!(e, QueueEvent::Processing(_)))
        {
            assert!(finished < started + 1 + next);
        }
    }
    assert_eq!(session.codec.max_active.load(Ordering::SeqCst), 1);

    let items = session.handle.items().await.unwrap();
    assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), ids);
    assert!(items.iter().all(|i| i.status == Status::Done));
    assert!(items.iter().all(|i| (i.width, i.height) == (64, 48)));
    assert_eq!(session.handle.done_count().await.unwrap(), 3);
}

#[tokio::test]
async fn never_two_items_processing_at_once() {
    let mut session = Session::start(QueueConfig::default());
    let ids = session.upload(&["a", "b", "c"]);
    session.wait_for(QueueEvent::Processing(ids[0])).await;

    for expected in 0..3 {
        let items = session.handle.items().await.unwrap();
        let processing = items.iter().filter(|i| i.status == Status::Processing).count();
        assert_eq!(processing, 1);
        session.release(1);
        if expected < 2 {
            session.wait_for(QueueEvent::Processing(ids[expected + 1])).await;
        }
    }
    session.wait_for(QueueEvent::Idle).await;
    assert_eq!(session.codec.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deleting_a_pending_item_cancels_it() {
    let mut session = Session::start(QueueConfig::default());
    let ids = session.upload(&["f1", "f2", "f3"]);
    let mut events = session.wait_for(QueueEvent::Processing(ids[0])).await;

    session.handle.delete(ids[1]).unwrap();
    session.open_gate();
    events.extend(session.wait_for(QueueEvent::Idle).await);

    assert!(!events.contains(&QueueEvent::Processing(ids[1])));
    assert!(events.contains(&QueueEvent::Removed(ids[1])));
    assert_eq!(session.seen_sources(), vec!["f1", "f3"]);

    let items = session.handle.items().await.unwrap();
    let remaining: Vec<(Uuid, Status)> = items.iter().map(|i| (i.id, i.status)).collect();
    assert_eq!(remaining, vec![(ids[0], Status::Done), (ids[2], Status::Done)]);
}

#[tokio::test]
async fn deleting_an_in_flight_item_discards_its_reply() {
    let mut session = Session::start(QueueConfig::default());
    let ids = session.upload(&["f1"]);
    session.wait_for(QueueEvent::Processing(ids[0])).await;

    session.handle.delete(ids[0]).unwrap();
    session.wait_for(QueueEvent::Removed(ids[0])).await;
    session.release(1);
    let events = session.wait_for(QueueEvent::Idle).await;

    assert!(!events.contains(&QueueEvent::Done(ids[0])));
    assert!(session.handle.items().await.unwrap().is_empty());
    assert!(session.handle.download_all().await.unwrap().is_none());
}

#[tokio::test]
async fn settings_change_during_processing_converges_to_new_settings() {
    let mut session = Session::start(QueueConfig::default());
    let ids = session.upload(&["f1"]);
    session.wait_for(QueueEvent::Processing(ids[0])).await;

    let avif = Settings::new(OutputFormat::Avif, 50);
    session.handle.update_settings(avif).unwrap();
    session.wait_for(QueueEvent::SettingsChanged(avif)).await;
    let items = session.handle.items().await.unwrap();
    assert_eq!(items[0].status, Status::Queued);

    session.open_gate();
    session.wait_for(QueueEvent::Idle).await;

    let item = &session.handle.items().await.unwrap()[0];
    assert_eq!(item.status, Status::Done);
    assert_eq!(item.result_format, Some(OutputFormat::Avif));
    assert_eq!(item.result_quality, Some(50));
    assert_eq!(session.handle.settings().await.unwrap(), avif);
    // both runs started from the uploaded bytes
    assert_eq!(session.seen_sources(), vec!["f1", "f1"]);
}

#[tokio::test]
async fn two_quick_settings_changes_leave_everything_on_the_last_one() {
    let mut session = Session::start(QueueConfig::default());
    session.open_gate();
    let ids = session.upload(&["a", "b", "c"]);
    session.wait_for(QueueEvent::Idle).await;

    session
        .handle
        .update_settings(Settings::new(OutputFormat::Avif, 50))
        .unwrap();
    let last = Settings::new(OutputFormat::Jpeg, 30);
    session.handle.update_settings(last).unwrap();
    session.wait_for(QueueEvent::SettingsChanged(last)).await;
    session.wait_for(QueueEvent::Idle).await;

    let items = session.handle.items().await.unwrap();
    assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), ids);
    for item in &items {
        assert_eq!(item.status, Status::Done);
        assert_eq!(item.result_format, Some(OutputFormat::Jpeg));
        assert_eq!(item.result_quality, Some(30));
    }
    // re-processing always starts from the original upload, never a result
    assert!(session
        .seen_sources()
        .iter()
        .all(|source| ["a", "b", "c"].contains(&source.as_str())));
}

#[tokio::test]
async fn failures_stay_on_their_item_and_are_not_retried() {
    let mut session = Session::start(QueueConfig::default());
    session.open_gate();
    let ids = session.upload(&["bad", "good"]);
    let events = session.wait_for(QueueEvent::Idle).await;

    assert!(events.iter().any(|e| matches!(e, QueueEvent::Failed(id, msg) if *id == ids[0] && msg.contains("corrupt data"))));
    assert!(events.contains(&QueueEvent::Done(ids[1])));

    session
        .handle
        .update_settings(Settings::new(OutputFormat::Png, 90))
        .unwrap();
    let events = session.wait_for(QueueEvent::Idle).await;
    assert_eq!(processing_order(&events), vec![ids[1]]);

    let items = session.handle.items().await.unwrap();
    assert_eq!(items[0].status, Status::Error);
    assert!(items[0].error.as_deref().unwrap().contains("corrupt data"));
    assert_eq!(items[1].status, Status::Done);
    assert_eq!(items[1].result_format, Some(OutputFormat::Png));
}

#[tokio::test]
async fn unsupported_files_never_reach_the_queue() {
    let session = Session::start(QueueConfig::default());
    let report = session
        .handle
        .upload(vec![
            SourceFile::new("anim.gif", "image/gif", Bytes::from_static(b"GIF89a")),
            SourceFile::new("ok.webp", "image/webp", Bytes::from_static(b"ok")),
        ])
        .unwrap();

    assert_eq!(report.accepted.len(), 1);
    assert!(matches!(
        report.rejected.as_slice(),
        [UploadError::UnsupportedFormat { name, mime }] if name == "anim.gif" && mime == "image/gif"
    ));
    let items = session.handle.items().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "ok.webp");
}

#[tokio::test]
async fn download_all_packages_done_items() {
    let mut session = Session::start(QueueConfig::default());
    session.open_gate();
    session.upload(&["cat", "bad", "dog"]);
    session.wait_for(QueueEvent::Idle).await;

    let archive = session.handle.download_all().await.unwrap().unwrap();
    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
    let mut names: Vec<String> = zip.file_names().map(str::to_owned).collect();
    names.sort();
    assert_eq!(names, vec!["cat-opt.webp", "dog-opt.webp"]);

    let mut contents = String::new();
    std::io::Read::read_to_string(&mut zip.by_name("cat-opt.webp").unwrap(), &mut contents).unwrap();
    assert_eq!(contents, "cat|webp|80");
}

#[tokio::test]
async fn resized_export_uses_original_bytes_and_current_settings() {
    let mut session = Session::start(QueueConfig::default());
    session.open_gate();
    let ids = session.upload(&["cat"]);
    session.wait_for(QueueEvent::Idle).await;

    let export = session.handle.export_resized(ids[0], "tablet").await.unwrap();
    assert_eq!(export.file_name, "cat-opt-tablet.webp");
    assert_eq!(export.width, 768);
    assert_eq!(&export.bytes[..], b"cat|webp|80");

    assert!(session.handle.export_resized(ids[0], "watch").await.is_err());
    assert!(session.handle.export_resized(Uuid::new_v4(), "mobile").await.is_err());
    // the export does not go through the queue
    assert_eq!(session.handle.items().await.unwrap()[0].status, Status::Done);
}

/// Hangs on sources starting with `hang` until the sender side is dropped;
/// everything else finishes immediately.
struct HangingCodec {
    hold: Mutex<mpsc::Receiver<()>>,
}

impl Codec for HangingCodec {
    fn transform(&self, request: &TransformRequest) -> Result<TransformOutput, TransformError> {
        if request.source.starts_with(b"hang") {
            let _ = self.hold.lock().unwrap().recv();
        }
        Ok(TransformOutput {
            bytes: request.source.clone(),
            width: 1,
            height: 1,
        })
    }
}

#[tokio::test]
async fn timed_out_transform_does_not_stall_the_rest_of_the_queue() {
    let (hold, held) = mpsc::channel::<()>();
    let token = CancellationToken::new();
    let config = QueueConfig {
        transform_timeout: Some(Duration::from_millis(200)),
        ..QueueConfig::default()
    };
    let codec = Arc::new(HangingCodec {
        hold: Mutex::new(held),
    });
    let (handle, mut events, _join) = QueueHandle::spawn(token.clone(), config, codec);

    let files = ["hang", "b", "c"]
        .iter()
        .map(|name| SourceFile::new(format!("{name}.png"), "image/png", Bytes::from(name.to_string())))
        .collect();
    let ids = handle.upload(files).unwrap().accepted;

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("queue never drained")
            .unwrap();
        if event == QueueEvent::Idle {
            break;
        }
        seen.push(event);
    }

    assert!(seen.iter().any(|e| matches!(e, QueueEvent::Failed(id, msg) if *id == ids[0] && msg.contains("timed out"))));
    let statuses: Vec<Status> = handle.items().await.unwrap().iter().map(|i| i.status).collect();
    assert_eq!(statuses, vec![Status::Error, Status::Done, Status::Done]);

    token.cancel();
    drop(hold);
}

#[tokio::test]
async fn cancelled_session_rejects_further_requests() {
    let mut session = Session::start(QueueConfig::default());
    session.token.cancel();
    session.join.take().unwrap().await.unwrap().unwrap();

    assert!(session.handle.items().await.is_err());
    assert!(session.handle.delete(Uuid::new_v4()).is_err());
}
