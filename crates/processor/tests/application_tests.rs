//! End-to-end tests of the processing loop over the in-memory broker.
//!
//! Covers:
//! 1. Offset storage for processed and filtered rows
//! 2. Error routing through callbacks (pipeline, delivery, deserialization)
//! 3. State persistence and changelog recovery after loss or a wiped state dir
//! 4. Local state ahead of the committed offset

use parking_lot::Mutex;
use rowstream::config::AutoOffsetReset;
use rowstream::error::{ProcessingError, ProcessorError, StateError};
use rowstream::kafka::memory::{ConsumerControl, InMemoryBroker};
use rowstream::kafka::ProducerRecord;
use rowstream::pipeline::{from_fn, PipelineOutcome};
use rowstream::state::{PartitionConfig, StorePartition};
use rowstream::{Application, ApplicationConfig, Callbacks, Row, StopHandle, TopicPartition};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const GROUP: &str = "it-group";
const INPUT: &str = "input";
const STORE: &str = "counts";
const CHANGELOG: &str = "changelog__it-group--input--counts";

fn input_tp() -> TopicPartition {
    TopicPartition::new(INPUT, 0)
}

fn app_config(dir: &TempDir) -> ApplicationConfig {
    let mut config = ApplicationConfig::default();
    config.consumer_group = GROUP.to_string();
    config.consumer_poll_timeout_ms = 5;
    config.loglevel = None;
    config.state.dir = dir.path().to_path_buf();
    config
}

fn broker() -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.create_topic(INPUT, 1);
    broker.create_topic("output", 1);
    broker
}

/// Stops the application after `limit` processed messages and records
/// which offsets were processed. Optionally suppresses every error.
struct Recorder {
    stop: StopHandle,
    limit: usize,
    suppress: bool,
    processed: Mutex<Vec<i64>>,
    on_processed: Option<Box<dyn Fn(i64) + Send + Sync>>,
}

impl Recorder {
    fn new(stop: StopHandle, limit: usize) -> Self {
        Self {
            stop,
            limit,
            suppress: false,
            processed: Mutex::new(Vec::new()),
            on_processed: None,
        }
    }

    fn suppressing(mut self) -> Self {
        self.suppress = true;
        self
    }

    fn on_processed(mut self, hook: impl Fn(i64) + Send + Sync + 'static) -> Self {
        self.on_processed = Some(Box::new(hook));
        self
    }
}

impl Callbacks for Recorder {
    fn on_consumer_error(
        &self,
        _error: &rowstream::kafka::KafkaError,
        _message: Option<&rowstream::kafka::ConsumedMessage>,
    ) -> bool {
        self.suppress
    }

    fn on_processing_error(&self, _error: &ProcessingError, _row: &Row) -> bool {
        self.suppress
    }

    fn on_producer_error(&self, _error: &rowstream::kafka::KafkaError, _row: Option<&Row>) -> bool {
        self.suppress
    }

    fn on_message_processed(&self, _topic: &str, _partition: i32, offset: i64) {
        let count = {
            let mut processed = self.processed.lock();
            processed.push(offset);
            processed.len()
        };
        if let Some(hook) = &self.on_processed {
            hook(offset);
        }
        if count >= self.limit {
            self.stop.stop();
        }
    }
}

/// Counts messages per key in the `counts` store. Rows with `"skip": true`
/// are filtered before touching state, rows with `"fail": true` error out.
fn counting_app(
    dir: &TempDir,
    broker: &InMemoryBroker,
    auto_commit: bool,
) -> (Application, ConsumerControl) {
    let consumer = broker.consumer(GROUP, AutoOffsetReset::Earliest, auto_commit);
    let control = consumer.control();
    let app = Application::new(app_config(dir), consumer, Arc::new(broker.producer()))
        .unwrap()
        .with_admin(Arc::new(broker.clone()))
        .with_signal_handling(false)
        .with_store(INPUT, STORE)
        .unwrap()
        .with_pipeline(
            INPUT,
            from_fn(|value, ctx| {
                if value["skip"] == json!(true) {
                    return Ok(PipelineOutcome::Filtered);
                }
                if value["fail"] == json!(true) {
                    return Err(ProcessingError::pipeline(anyhow::anyhow!("bad row")));
                }
                let mut state = ctx.state(STORE)?;
                let count: u64 = state.get_or("count", 0)?;
                state.set("count", &(count + 1))?;
                Ok(PipelineOutcome::Continue)
            }),
        );
    (app, control)
}

async fn run(app: &mut Application) -> rowstream::Result<()> {
    tokio::time::timeout(Duration::from_secs(10), app.run())
        .await
        .expect("application did not stop")
}

fn append(broker: &InMemoryBroker, key: &str, value: serde_json::Value) -> i64 {
    broker
        .append_json(INPUT, 0, Some(key.as_bytes()), &value)
        .unwrap()
}

fn open_store(path: &Path) -> StorePartition {
    StorePartition::open(&PartitionConfig::new(path)).unwrap()
}

fn stored_count(store: &StorePartition, key: &str) -> Option<u64> {
    let raw_key = format!("{key}|\"count\"");
    store
        .get(raw_key.as_bytes())
        .unwrap()
        .map(|raw| serde_json::from_slice(&raw).unwrap())
}

#[tokio::test]
async fn test_processed_and_filtered_rows_store_next_offset() {
    let dir = TempDir::new().unwrap();
    let broker = broker();
    append(&broker, "a", json!({"n": 1}));
    append(&broker, "a", json!({"skip": true}));

    let (app, control) = counting_app(&dir, &broker, false);
    let recorder = Arc::new(Recorder::new(app.stop_handle(), 2));
    let mut app = app.with_callbacks(Arc::clone(&recorder));

    run(&mut app).await.unwrap();

    assert_eq!(*recorder.processed.lock(), vec![0, 1]);
    assert_eq!(control.committed_offset(&input_tp()), Some(2));

    let stats = app.stats();
    assert_eq!(stats.messages_processed, 2);
    assert_eq!(stats.rows_processed, 1);
    assert_eq!(stats.rows_filtered, 1);
    assert_eq!(stats.changelog_produced, 1);

    // the filtered row produced no changelog record
    assert_eq!(broker.messages(&TopicPartition::new(CHANGELOG, 0)).len(), 1);

    let path = app.state_manager().partition_path(STORE, 0);
    drop(app);
    let store = open_store(&path);
    assert_eq!(stored_count(&store, "a"), Some(1));
    assert_eq!(store.processed_offset().unwrap(), Some(1));
    assert_eq!(store.changelog_offset().unwrap(), Some(0));
}

#[tokio::test]
async fn test_unsuppressed_pipeline_error_stops_before_storing_offset() {
    let dir = TempDir::new().unwrap();
    let broker = broker();
    append(&broker, "a", json!({"n": 1}));
    append(&broker, "a", json!({"fail": true}));
    append(&broker, "a", json!({"n": 2}));

    let (mut app, control) = counting_app(&dir, &broker, false);

    let err = run(&mut app).await.unwrap_err();
    match err {
        ProcessorError::Processing { topic, offset, .. } => {
            assert_eq!(topic, INPUT);
            assert_eq!(offset, 1);
        }
        other => panic!("unexpected error: {other}"),
    }

    // offset 1 is not acknowledged and its state changes are discarded
    assert_eq!(control.committed_offset(&input_tp()), Some(1));
    assert_eq!(app.stats().processing_errors, 1);

    let path = app.state_manager().partition_path(STORE, 0);
    drop(app);
    let store = open_store(&path);
    assert_eq!(stored_count(&store, "a"), Some(1));
    assert_eq!(store.processed_offset().unwrap(), Some(0));
}

#[tokio::test]
async fn test_suppressed_pipeline_error_skips_row() {
    let dir = TempDir::new().unwrap();
    let broker = broker();
    append(&broker, "a", json!({"fail": true}));
    append(&broker, "a", json!({"n": 1}));

    let (app, control) = counting_app(&dir, &broker, false);
    let recorder = Arc::new(Recorder::new(app.stop_handle(), 2).suppressing());
    let mut app = app.with_callbacks(Arc::clone(&recorder));

    run(&mut app).await.unwrap();

    assert_eq!(*recorder.processed.lock(), vec![0, 1]);
    assert_eq!(control.committed_offset(&input_tp()), Some(2));
    let stats = app.stats();
    assert_eq!(stats.processing_errors, 1);
    assert_eq!(stats.suppressed_errors, 1);
    assert_eq!(stats.rows_processed, 1);
}

#[tokio::test]
async fn test_delivery_failure_stops_loop_unless_suppressed() {
    let broker = broker();
    broker.fail_deliveries("output", "broker unavailable");
    append(&broker, "a", json!({"n": 1}));
    append(&broker, "a", json!({"n": 2}));

    let forward = || {
        from_fn(|value, ctx| {
            ctx.produce_json("output", &value)?;
            Ok(PipelineOutcome::Continue)
        })
    };

    // default callbacks
    let dir = TempDir::new().unwrap();
    let consumer = broker.consumer("forwarder", AutoOffsetReset::Earliest, false);
    let mut app = Application::new(app_config(&dir), consumer, Arc::new(broker.producer()))
        .unwrap()
        .with_signal_handling(false)
        .with_pipeline(INPUT, forward());

    let err = run(&mut app).await.unwrap_err();
    assert!(matches!(err, ProcessorError::Producer { .. }));

    // suppressing callbacks
    let dir = TempDir::new().unwrap();
    let consumer = broker.consumer("forwarder-suppressing", AutoOffsetReset::Earliest, false);
    let app = Application::new(app_config(&dir), consumer, Arc::new(broker.producer()))
        .unwrap()
        .with_signal_handling(false)
        .with_pipeline(INPUT, forward());
    let recorder = Arc::new(Recorder::new(app.stop_handle(), 2).suppressing());
    let mut app = app.with_callbacks(Arc::clone(&recorder));

    run(&mut app).await.unwrap();
    assert_eq!(*recorder.processed.lock(), vec![0, 1]);
    assert_eq!(app.stats().suppressed_errors, 2);
    assert!(broker.messages(&TopicPartition::new("output", 0)).is_empty());
}

#[tokio::test]
async fn test_unencodable_output_is_routed_to_producer_callback() {
    let broker = broker();
    append(&broker, "a", json!({"n": 1}));

    let encode_map = || {
        from_fn(|_value, ctx| {
            let bad: HashMap<Vec<i32>, i32> = HashMap::from([(vec![1], 1)]);
            ctx.produce_json("output", &bad)?;
            Ok(PipelineOutcome::Continue)
        })
    };

    let dir = TempDir::new().unwrap();
    let consumer = broker.consumer("encoder", AutoOffsetReset::Earliest, false);
    let mut app = Application::new(app_config(&dir), consumer, Arc::new(broker.producer()))
        .unwrap()
        .with_signal_handling(false)
        .with_pipeline(INPUT, encode_map());
    let err = run(&mut app).await.unwrap_err();
    assert!(matches!(
        err,
        ProcessorError::Processing {
            source: ProcessingError::Produce(_),
            ..
        }
    ));

    let dir = TempDir::new().unwrap();
    let consumer = broker.consumer("encoder-suppressing", AutoOffsetReset::Earliest, false);
    let app = Application::new(app_config(&dir), consumer, Arc::new(broker.producer()))
        .unwrap()
        .with_signal_handling(false)
        .with_pipeline(INPUT, encode_map());
    let recorder = Arc::new(Recorder::new(app.stop_handle(), 1).suppressing());
    let mut app = app.with_callbacks(Arc::clone(&recorder));

    run(&mut app).await.unwrap();
    assert_eq!(*recorder.processed.lock(), vec![0]);
    assert_eq!(app.stats().suppressed_errors, 1);
    assert!(broker.messages(&TopicPartition::new("output", 0)).is_empty());
}

#[tokio::test]
async fn test_tombstone_is_acknowledged_without_rows() {
    let dir = TempDir::new().unwrap();
    let broker = broker();
    broker
        .append(
            &ProducerRecord::new(INPUT)
                .with_partition(0)
                .with_key(b"a".to_vec()),
        )
        .unwrap();
    append(&broker, "a", json!({"n": 1}));

    let (app, control) = counting_app(&dir, &broker, false);
    let recorder = Arc::new(Recorder::new(app.stop_handle(), 2));
    let mut app = app.with_callbacks(Arc::clone(&recorder));

    run(&mut app).await.unwrap();

    assert_eq!(*recorder.processed.lock(), vec![0, 1]);
    assert_eq!(control.committed_offset(&input_tp()), Some(2));
    let stats = app.stats();
    assert_eq!(stats.messages_processed, 2);
    assert_eq!(stats.rows_processed, 1);
    // only the second message touched state
    assert_eq!(stats.changelog_produced, 1);
}

#[tokio::test]
async fn test_deserialization_errors_are_routed_to_callbacks() {
    let broker = broker();
    broker
        .append(
            &ProducerRecord::new(INPUT)
                .with_partition(0)
                .with_key(b"a".to_vec())
                .with_value(b"not json".to_vec()),
        )
        .unwrap();
    append(&broker, "a", json!({"n": 1}));

    let dir = TempDir::new().unwrap();
    let (mut app, control) = counting_app(&dir, &broker, false);
    let err = run(&mut app).await.unwrap_err();
    assert!(matches!(err, ProcessorError::Consumer { .. }));
    assert_eq!(control.committed_offset(&input_tp()), None);

    let dir = TempDir::new().unwrap();
    let (app, control) = counting_app(&dir, &broker, false);
    let recorder = Arc::new(Recorder::new(app.stop_handle(), 1).suppressing());
    let mut app = app.with_callbacks(Arc::clone(&recorder));

    run(&mut app).await.unwrap();
    assert_eq!(*recorder.processed.lock(), vec![1]);
    assert_eq!(control.committed_offset(&input_tp()), Some(2));
    assert_eq!(app.stats().suppressed_errors, 1);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let broker = broker();
    append(&broker, "a", json!({"n": 1}));
    append(&broker, "b", json!({"n": 1}));

    let (app, _) = counting_app(&dir, &broker, false);
    let recorder = Arc::new(Recorder::new(app.stop_handle(), 2));
    let mut app = app.with_callbacks(recorder);
    run(&mut app).await.unwrap();
    drop(app);

    append(&broker, "a", json!({"n": 2}));
    let (app, _) = counting_app(&dir, &broker, false);
    let recorder = Arc::new(Recorder::new(app.stop_handle(), 1));
    let mut app = app.with_callbacks(Arc::clone(&recorder));
    run(&mut app).await.unwrap();

    assert_eq!(*recorder.processed.lock(), vec![2]);
    // local state was up to date with its changelog
    assert_eq!(app.stats().changelog_recovered, 0);

    let path = app.state_manager().partition_path(STORE, 0);
    drop(app);
    let store = open_store(&path);
    assert_eq!(stored_count(&store, "a"), Some(2));
    assert_eq!(stored_count(&store, "b"), Some(1));
}

#[tokio::test]
async fn test_cleared_state_is_rebuilt_from_changelog() {
    let dir = TempDir::new().unwrap();
    let broker = broker();
    for n in 0..3 {
        append(&broker, "a", json!({ "n": n }));
    }

    let (app, _) = counting_app(&dir, &broker, false);
    let recorder = Arc::new(Recorder::new(app.stop_handle(), 3));
    let mut app = app.with_callbacks(recorder);
    run(&mut app).await.unwrap();
    app.clear_state().unwrap();
    let path = app.state_manager().partition_path(STORE, 0);
    drop(app);
    assert!(!path.exists());

    append(&broker, "a", json!({"n": 3}));
    let (app, control) = counting_app(&dir, &broker, false);
    let recorder = Arc::new(Recorder::new(app.stop_handle(), 1));
    let mut app = app.with_callbacks(Arc::clone(&recorder));
    run(&mut app).await.unwrap();

    assert_eq!(*recorder.processed.lock(), vec![3]);
    assert_eq!(app.stats().changelog_recovered, 3);
    assert!(!control.is_paused(&input_tp()));
    drop(app);

    let store = open_store(&path);
    assert_eq!(stored_count(&store, "a"), Some(4));
    assert_eq!(store.processed_offset().unwrap(), Some(3));
}

#[tokio::test]
async fn test_lost_partition_is_rebuilt_on_reassignment() {
    let dir = TempDir::new().unwrap();
    let broker = broker();
    for n in 0..3 {
        append(&broker, "a", json!({ "n": n }));
    }

    let (app, control) = counting_app(&dir, &broker, true);
    let hook_control = control.clone();
    let recorder = Arc::new(Recorder::new(app.stop_handle(), 3).on_processed(move |offset| {
        if offset == 1 {
            hook_control.lose(vec![input_tp()]);
            hook_control.assign(vec![input_tp()]);
        }
    }));
    let mut app = app.with_callbacks(Arc::clone(&recorder));

    run(&mut app).await.unwrap();

    // the group offset survived the loss, so nothing was processed twice
    assert_eq!(*recorder.processed.lock(), vec![0, 1, 2]);
    assert_eq!(app.stats().changelog_recovered, 2);
    assert_eq!(control.committed_offset(&input_tp()), Some(3));

    let path = app.state_manager().partition_path(STORE, 0);
    drop(app);
    let store = open_store(&path);
    assert_eq!(stored_count(&store, "a"), Some(3));
    assert!(!store.is_recovery_required().unwrap());
}

#[tokio::test]
async fn test_local_state_ahead_of_committed_offset_warns_and_resumes() {
    let dir = TempDir::new().unwrap();
    let broker = broker();
    for n in 0..3 {
        append(&broker, "a", json!({ "n": n }));
    }

    let (app, _) = counting_app(&dir, &broker, false);
    let recorder = Arc::new(Recorder::new(app.stop_handle(), 3));
    let mut app = app.with_callbacks(recorder);
    run(&mut app).await.unwrap();
    drop(app);

    // the group offset falls behind the state, e.g. a lost commit
    broker.commit(GROUP, &input_tp(), 1);

    let (app, _) = counting_app(&dir, &broker, false);
    let recorder = Arc::new(Recorder::new(app.stop_handle(), 2));
    let mut app = app.with_callbacks(Arc::clone(&recorder));
    run(&mut app).await.unwrap();

    assert_eq!(app.stats().offset_ahead_warnings, 1);
    assert_eq!(*recorder.processed.lock(), vec![1, 2]);
}

#[tokio::test]
async fn test_missing_changelog_topic_is_fatal() {
    let dir = TempDir::new().unwrap();
    let broker = broker();
    append(&broker, "a", json!({"n": 1}));

    let mut config = app_config(&dir);
    config.auto_create_topics = false;
    let consumer = broker.consumer(GROUP, AutoOffsetReset::Earliest, false);
    let mut app = Application::new(config, consumer, Arc::new(broker.producer()))
        .unwrap()
        .with_signal_handling(false)
        .with_store(INPUT, STORE)
        .unwrap()
        .with_pipeline(INPUT, from_fn(|_, _| Ok(PipelineOutcome::Continue)));

    let err = run(&mut app).await.unwrap_err();
    assert!(matches!(
        err,
        ProcessorError::State(StateError::ChangelogMissing { .. })
    ));
    assert!(!broker.topic_exists(CHANGELOG));
}

#[tokio::test]
async fn test_stop_handle_ends_idle_loop() {
    let dir = TempDir::new().unwrap();
    let broker = broker();
    let consumer = broker.consumer(GROUP, AutoOffsetReset::Earliest, false);
    let mut app = Application::new(app_config(&dir), consumer, Arc::new(broker.producer()))
        .unwrap()
        .with_signal_handling(false)
        .with_pipeline(INPUT, from_fn(|_, _| Ok(PipelineOutcome::Continue)));

    let stop = app.stop_handle();
    let calls = Arc::new(AtomicUsize::new(0));
    let stopper_calls = Arc::clone(&calls);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper_calls.fetch_add(1, Ordering::SeqCst);
        stop.stop();
    });

    run(&mut app).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!app.is_running());
    assert_eq!(app.stats().messages_processed, 0);
}
