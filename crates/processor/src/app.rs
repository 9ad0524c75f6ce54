//! Application runtime
//!
//! [`Application`] ties the consumer, the producer, the state stores and the
//! user pipelines together and runs the processing loop:
//!
//! 1. service producer delivery reports
//! 2. replay changelogs while any assigned partition is recovering
//! 3. otherwise poll the consumer and dispatch the event: rebalances go to
//!    the state manager, messages are deserialized and passed row by row
//!    through the topic's pipeline inside one transaction scope
//! 4. commit the scope and store the next offset
//!
//! The loop runs until [`StopHandle::stop`] is called, a signal is received
//! or an error is not suppressed by the [`Callbacks`].
//!
//! # Example
//!
//! ```rust,no_run
//! use rowstream::app::Application;
//! use rowstream::config::ApplicationConfig;
//! use rowstream::pipeline::{from_fn, PipelineOutcome};
//!
//! # async fn example() -> rowstream::error::Result<()> {
//! let config = ApplicationConfig::load(None)?;
//! let mut app = Application::from_config(config)?
//!     .with_store("orders", "totals")?
//!     .with_pipeline("orders", from_fn(|value, ctx| {
//!         let mut state = ctx.state("totals")?;
//!         let count: u64 = state.get_or("count", 0)?;
//!         state.set("count", &(count + 1))?;
//!         if value["amount"].as_f64().unwrap_or(0.0) <= 0.0 {
//!             return Ok(PipelineOutcome::Filtered);
//!         }
//!         ctx.produce_json("large-orders", &value)?;
//!         Ok(PipelineOutcome::Continue)
//!     }));
//!
//! app.run().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::callbacks::{Callbacks, DefaultCallbacks};
use crate::config::ApplicationConfig;
use crate::core::{Row, TopicPartition};
use crate::error::{ProcessorError, Result};
use crate::kafka::{
    ConsumedMessage, Consumer, ConsumerEvent, JsonDeserializer, KafkaAdmin, KafkaConsumer,
    KafkaConsumerConfig, KafkaProducer, KafkaProducerConfig, Producer, RebalanceEvent,
    RowDeserializer, TopicAdmin, TopicSpec,
};
use crate::logging::init_logging;
use crate::metrics::{ApplicationStats, MetricsRegistry, RuntimeMetrics};
use crate::pipeline::{Pipeline, PipelineOutcome, ProcessingContext};
use crate::state::StateStoreManager;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Cloneable handle that stops a running [`Application`].
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    /// Ask the loop to exit after the current iteration.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }
}

/// The stream processing application.
pub struct Application {
    id: Uuid,
    config: ApplicationConfig,
    consumer: Box<dyn Consumer>,
    producer: Arc<dyn Producer>,
    admin: Option<Arc<dyn TopicAdmin>>,
    deserializer: Arc<dyn RowDeserializer>,
    callbacks: Arc<dyn Callbacks>,
    pipelines: BTreeMap<String, Arc<dyn Pipeline>>,
    state: StateStoreManager,
    metrics: RuntimeMetrics,
    registry: MetricsRegistry,
    stop: StopHandle,
    handle_signals: bool,
    running: bool,
}

impl Application {
    /// Build an application over the given clients.
    pub fn new(
        config: ApplicationConfig,
        consumer: impl Consumer + 'static,
        producer: Arc<dyn Producer>,
    ) -> Result<Self> {
        config.validate()?;

        let state = StateStoreManager::new(config.consumer_group.clone(), config.state.clone())
            .with_changelog_producer(Arc::clone(&producer))
            .with_timeouts(config.consumer_poll_timeout(), METADATA_TIMEOUT);

        let registry = MetricsRegistry::with_prefix("rowstream");
        let metrics = RuntimeMetrics::new();
        metrics.register(&registry);

        Ok(Self {
            id: Uuid::new_v4(),
            config,
            consumer: Box::new(consumer),
            producer,
            admin: None,
            deserializer: Arc::new(JsonDeserializer::new()),
            callbacks: Arc::new(DefaultCallbacks),
            pipelines: BTreeMap::new(),
            state,
            metrics,
            registry,
            stop: StopHandle::default(),
            handle_signals: true,
            running: false,
        })
    }

    /// Build an application with rdkafka clients and set up logging.
    pub fn from_config(config: ApplicationConfig) -> Result<Self> {
        init_logging(config.loglevel.as_deref());

        let consumer = KafkaConsumer::new(KafkaConsumerConfig::from_app(&config))?;
        let producer = KafkaProducer::new(KafkaProducerConfig::from_app(&config))?;
        let admin = KafkaAdmin::new(&config.broker_address, METADATA_TIMEOUT)?;

        Ok(Self::new(config, consumer, Arc::new(producer))?.with_admin(Arc::new(admin)))
    }

    /// Admin client used to create changelog topics.
    pub fn with_admin(mut self, admin: Arc<dyn TopicAdmin>) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn with_deserializer(mut self, deserializer: impl RowDeserializer + 'static) -> Self {
        self.deserializer = Arc::new(deserializer);
        self
    }

    pub fn with_callbacks(mut self, callbacks: impl Callbacks + 'static) -> Self {
        self.callbacks = Arc::new(callbacks);
        self
    }

    /// Process `topic` with `pipeline`. Replaces any previous pipeline.
    pub fn with_pipeline(mut self, topic: &str, pipeline: impl Pipeline + 'static) -> Self {
        self.pipelines.insert(topic.to_string(), Arc::new(pipeline));
        self
    }

    /// Declare a state store on `topic`.
    pub fn with_store(mut self, topic: &str, store: &str) -> Result<Self> {
        self.state.register_store(topic, store)?;
        Ok(self)
    }

    /// Install SIGINT/SIGTERM handlers while running (default: on).
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn config(&self) -> &ApplicationConfig {
        &self.config
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Request the loop to exit.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn state_manager(&self) -> &StateStoreManager {
        &self.state
    }

    pub fn metrics_registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    pub fn stats(&self) -> ApplicationStats {
        self.metrics.snapshot()
    }

    /// Remove this group's local state. Fails while the application runs.
    pub fn clear_state(&self) -> Result<()> {
        if self.running {
            return Err(ProcessorError::State(crate::error::StateError::StoresInUse {
                reason: "application is running".to_string(),
            }));
        }
        self.state.clear_stores()?;
        Ok(())
    }

    /// Run the processing loop until stopped or a fatal error occurs.
    ///
    /// Resources are released before returning, whatever the outcome.
    pub async fn run(&mut self) -> Result<()> {
        self.stop.reset();
        self.running = true;
        info!(
            instance_id = %self.id,
            group = %self.config.consumer_group,
            topics = ?self.pipelines.keys().collect::<Vec<_>>(),
            "Starting application"
        );

        let signals = self
            .handle_signals
            .then(|| spawn_signal_listener(self.stop.clone()));

        let result = self.run_loop().await;
        if let Some(handle) = signals {
            handle.abort();
        }

        let shutdown = self.shutdown().await;
        self.running = false;

        match (&result, &shutdown) {
            (Err(e), _) => warn!(instance_id = %self.id, error = %e, "Application stopped with error"),
            (Ok(()), Err(e)) => warn!(instance_id = %self.id, error = %e, "Shutdown failed"),
            (Ok(()), Ok(())) => info!(instance_id = %self.id, "Application stopped"),
        }
        result.and(shutdown)
    }

    async fn run_loop(&mut self) -> Result<()> {
        if self.pipelines.is_empty() {
            return Err(ProcessorError::configuration("no topics to process"));
        }
        self.setup_topics().await?;

        let topics: Vec<String> = self.pipelines.keys().cloned().collect();
        self.consumer.subscribe(&topics)?;

        let poll_timeout = self.config.consumer_poll_timeout();
        let producer_poll_timeout = self.config.producer_poll_timeout();

        while !self.stop.is_stopped() {
            self.service_deliveries(producer_poll_timeout).await?;

            if self.state.recovery_required() {
                let outcome = self.state.do_recovery(self.consumer.as_mut()).await?;
                self.metrics.changelog_recovered.inc_by(outcome.applied);
                self.metrics
                    .partitions_recovering
                    .set(self.state.partitions_recovering() as i64);
                if let Some(event) = outcome.event {
                    self.dispatch(event).await?;
                }
                continue;
            }

            match self.consumer.poll(poll_timeout).await {
                Ok(Some(event)) => self.dispatch(event).await?,
                Ok(None) => {}
                Err(err) => {
                    self.metrics.processing_errors.inc();
                    // configuration errors never go to the callback
                    if err.is_fatal() || !self.callbacks.on_consumer_error(&err, None) {
                        return Err(ProcessorError::Consumer { source: err });
                    }
                    self.metrics.suppressed_errors.inc();
                    warn!(error = %err, "Consumer error suppressed");
                }
            }
        }
        Ok(())
    }

    /// Create missing changelog topics with the source topic's partition count.
    async fn setup_topics(&mut self) -> Result<()> {
        let Some(admin) = &self.admin else {
            return Ok(());
        };
        if !self.config.auto_create_topics {
            return Ok(());
        }

        for (source, changelog) in self.state.changelog_topics() {
            let partitions = admin.partition_count(&source).await?.ok_or_else(|| {
                ProcessorError::configuration(format!("source topic '{source}' does not exist"))
            })?;

            match admin.partition_count(&changelog).await? {
                Some(existing) if existing != partitions => warn!(
                    changelog = %changelog,
                    existing,
                    expected = partitions,
                    "Changelog partition count differs from source topic"
                ),
                Some(_) => debug!(changelog = %changelog, "Changelog topic exists"),
                None => {
                    admin
                        .create_topic(&TopicSpec::compacted(changelog.clone(), partitions))
                        .await?;
                    info!(changelog = %changelog, partitions, "Changelog topic created");
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, event: ConsumerEvent) -> Result<()> {
        match event {
            ConsumerEvent::Rebalance(RebalanceEvent::Assigned(partitions)) => {
                self.on_assign(partitions).await
            }
            ConsumerEvent::Rebalance(RebalanceEvent::Revoked(partitions)) => {
                self.on_revoke(partitions).await
            }
            ConsumerEvent::Rebalance(RebalanceEvent::Lost(partitions)) => self.on_lost(partitions),
            ConsumerEvent::Message(message) => self.process_message(message).await,
        }
    }

    async fn on_assign(&mut self, partitions: Vec<TopicPartition>) -> Result<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        info!(partitions = ?partitions, "Partitions assigned");

        for tp in &partitions {
            let stores = self
                .state
                .on_partition_assign(tp, self.consumer.as_mut())
                .await?;
            if stores.is_empty() {
                continue;
            }

            let committed = self
                .consumer
                .committed(std::slice::from_ref(tp), METADATA_TIMEOUT)
                .await?
                .into_iter()
                .find(|(committed_tp, _)| committed_tp == tp)
                .and_then(|(_, offset)| offset);
            let Some(committed) = committed else {
                continue;
            };

            let mut processed = None;
            for store in &stores {
                processed = processed.max(store.processed_offset()?);
            }
            if let Some(processed) = processed {
                if processed + 1 > committed {
                    warn!(
                        topic = %tp.topic,
                        partition = tp.partition,
                        processed_offset = processed,
                        committed_offset = committed,
                        "Local state is ahead of the committed offset, resuming from the committed offset"
                    );
                    self.metrics.offset_ahead_warnings.inc();
                }
            }
        }

        self.metrics
            .partitions_recovering
            .set(self.state.partitions_recovering() as i64);
        Ok(())
    }

    /// Runs on the next `poll` after the client has already unassigned the
    /// partitions, so the flush below happens after the group moved on. Any
    /// record still in flight for these partitions may be redelivered to the
    /// new owner, which the at-least-once contract allows.
    async fn on_revoke(&mut self, partitions: Vec<TopicPartition>) -> Result<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        info!(partitions = ?partitions, "Partitions revoked");

        self.flush_producer().await?;
        for tp in &partitions {
            self.state.on_partition_revoke(tp, self.consumer.as_mut())?;
        }
        self.metrics
            .partitions_recovering
            .set(self.state.partitions_recovering() as i64);
        Ok(())
    }

    fn on_lost(&mut self, partitions: Vec<TopicPartition>) -> Result<()> {
        if partitions.is_empty() {
            return Ok(());
        }
        warn!(partitions = ?partitions, "Partitions lost");

        for tp in &partitions {
            self.state.on_partition_lost(tp, self.consumer.as_mut())?;
        }
        self.metrics
            .partitions_recovering
            .set(self.state.partitions_recovering() as i64);
        Ok(())
    }

    /// Run one message through its topic's pipeline.
    ///
    /// A message that decodes to zero rows (a tombstone, or an empty array
    /// with array splitting on) is still acknowledged: its offset is stored
    /// and `on_message_processed` fires, so the partition does not stall on
    /// it. No store is touched for it.
    async fn process_message(&mut self, message: ConsumedMessage) -> Result<()> {
        let tp = message.topic_partition();

        if self.state.is_recovering(&tp) {
            debug!(partition = %tp, offset = message.offset, "Partition is recovering, rewinding");
            self.consumer
                .seek(&tp, message.offset, METADATA_TIMEOUT)
                .await?;
            return Ok(());
        }

        let Some(pipeline) = self.pipelines.get(&message.topic).cloned() else {
            debug!(topic = %message.topic, "No pipeline for topic, skipping message");
            return Ok(());
        };

        let values = match self.deserializer.deserialize(&message) {
            Ok(values) => values,
            Err(err) => {
                self.metrics.processing_errors.inc();
                if !self.callbacks.on_consumer_error(&err, Some(&message)) {
                    return Err(ProcessorError::Consumer { source: err });
                }
                self.metrics.suppressed_errors.inc();
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %err,
                    "Deserialization error suppressed"
                );
                self.consumer
                    .store_offsets(&[(tp, message.offset + 1)])?;
                return Ok(());
            }
        };

        let context = message.context();
        let mut scope =
            self.state
                .start_store_transaction(&message.topic, message.partition, message.offset)?;

        for value in values {
            let row = Row::new(value, context.clone());
            let mut ctx = ProcessingContext::new(
                &row,
                &mut scope,
                self.producer.as_ref(),
                self.callbacks.as_ref(),
            );
            let result = pipeline.process(row.value.clone(), &mut ctx);
            let suppressed = ctx.suppressed();
            self.metrics.suppressed_errors.inc_by(suppressed);

            match result {
                Ok(PipelineOutcome::Continue) => {
                    self.metrics.rows_processed.inc();
                }
                Ok(PipelineOutcome::Filtered) => {
                    self.metrics.rows_filtered.inc();
                }
                Err(err) => {
                    self.metrics.processing_errors.inc();
                    if err.is_suppressible() && self.callbacks.on_processing_error(&err, &row) {
                        self.metrics.suppressed_errors.inc();
                        warn!(
                            topic = %row.topic(),
                            partition = row.partition(),
                            offset = row.offset(),
                            error = %err,
                            "Processing error suppressed"
                        );
                        continue;
                    }
                    scope.discard();
                    return Err(ProcessorError::Processing {
                        topic: message.topic.clone(),
                        partition: message.partition,
                        offset: message.offset,
                        source: err,
                    });
                }
            }
        }

        let produced = scope.commit()?;
        self.metrics.changelog_produced.inc_by(produced as u64);

        self.consumer
            .store_offsets(&[(tp, message.offset + 1)])?;
        self.metrics.messages_processed.inc();
        debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "Message processed"
        );
        self.callbacks
            .on_message_processed(&message.topic, message.partition, message.offset);
        Ok(())
    }

    /// Drain delivery reports: record changelog offsets, route failures.
    async fn service_deliveries(&mut self, timeout: Duration) -> Result<()> {
        for report in self.producer.poll(timeout).await {
            match (&report.error, report.offset) {
                (None, Some(offset)) => {
                    self.state
                        .on_changelog_delivered(&report.topic_partition(), offset)?;
                }
                (None, None) => {}
                (Some(err), _) => {
                    self.metrics.processing_errors.inc();
                    if !self.callbacks.on_producer_error(err, None) {
                        return Err(ProcessorError::Producer {
                            source: err.clone(),
                        });
                    }
                    self.metrics.suppressed_errors.inc();
                    warn!(topic = %report.topic, error = %err, "Delivery error suppressed");
                }
            }
        }
        Ok(())
    }

    async fn flush_producer(&mut self) -> Result<()> {
        self.producer.flush(self.config.shutdown_timeout()).await?;
        self.service_deliveries(Duration::ZERO).await
    }

    /// Release resources in reverse order of acquisition.
    async fn shutdown(&mut self) -> Result<()> {
        info!(instance_id = %self.id, "Stopping application");
        let mut first_error: Option<ProcessorError> = None;

        if let Err(e) = self.flush_producer().await {
            warn!(error = %e, "Failed to flush producer");
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.state.close() {
            warn!(error = %e, "Failed to close state stores");
            first_error.get_or_insert(e.into());
        }
        if let Err(e) = self.consumer.close().await {
            warn!(error = %e, "Failed to close consumer");
            first_error.get_or_insert(e.into());
        }
        self.metrics.partitions_recovering.set(0);

        first_error.map_or(Ok(()), Err)
    }
}

fn spawn_signal_listener(stop: StopHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            result = ctrl_c => match result {
                Ok(()) => info!("Interrupt received, stopping"),
                Err(e) => {
                    warn!(error = %e, "Failed to listen for interrupts");
                    return;
                }
            },
            _ = terminate => info!("Termination requested, stopping"),
        }
        stop.stop();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt received, exiting immediately");
            std::process::exit(130);
        }
    })
}
