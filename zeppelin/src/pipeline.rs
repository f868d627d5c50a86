use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info};

use crate::config::{BrokerConfig, PipelineConfig, ServiceConfig};
use crate::metrics::Metrics;
use crate::processor::Processor;
use crate::queue::{self, QueueReceiver, QueueSender};
use crate::transport::{self, Transport};

/// One source → processor → destination unit with its own queue and worker
/// thread. Construction validates everything that can be validated without
/// touching a broker; the broker connections happen on the worker.
pub struct Pipeline {
    name: String,
    interval: Duration,
    topics: Vec<String>,
    source_broker: BrokerConfig,
    destination_broker: BrokerConfig,
    processor: Option<Processor>,
    queue_tx: QueueSender,
    queue_rx: Option<QueueReceiver>,
    metrics: Arc<Metrics>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Pipeline {
    pub fn build(
        config: &ServiceConfig,
        pipeline: &PipelineConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Pipeline> {
        info!("pipeline({})", pipeline.name);

        let processor = Processor::build(config, pipeline, metrics.clone())
            .with_context(|| format!("processor init failed for pipeline({})", pipeline.name))?;

        let topics = pipeline
            .source_broker
            .topic
            .as_ref()
            .map(|topics| topics.to_vec())
            .unwrap_or_default();

        let (queue_tx, queue_rx) = queue::queue();

        Ok(Pipeline {
            name: pipeline.name.clone(),
            interval: Duration::from_secs_f64(pipeline.thread_interval_sec.max(0.0)),
            topics,
            source_broker: pipeline.source_broker.clone(),
            destination_broker: pipeline.destination_broker.clone(),
            processor: Some(processor),
            queue_tx,
            queue_rx: Some(queue_rx),
            metrics,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        })
    }

    /// A handle for pushing into this pipeline's inbound queue. The source
    /// transport gets one on start; tests use it to inject messages.
    pub fn queue(&self) -> QueueSender {
        self.queue_tx.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&mut self) -> Result<()> {
        let processor = self
            .processor
            .take()
            .context("pipeline was already started")?;
        let queue_rx = self
            .queue_rx
            .take()
            .context("pipeline was already started")?;

        self.running.store(true, Ordering::SeqCst);

        let worker = Worker {
            name: self.name.clone(),
            interval: self.interval,
            topics: self.topics.clone(),
            source_broker: self.source_broker.clone(),
            destination_broker: self.destination_broker.clone(),
            queue_tx: self.queue_tx.clone(),
            queue_rx,
            metrics: self.metrics.clone(),
            running: self.running.clone(),
        };

        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker.run(processor))
            .with_context(|| format!("unable to spawn worker for pipeline({})", self.name))?;
        self.thread = Some(thread);

        Ok(())
    }

    /// Ask the worker to wind down. Idempotent; pair with [`Pipeline::join`].
    pub fn stop(&self) {
        info!("{} thread stop requested", self.name);
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn join(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        if let Err(cause) = handle.join() {
            if let Some(text) = cause.downcast_ref::<&'static str>() {
                error!("pipeline({}) worker panicked: {text}", self.name);
            } else if let Some(text) = cause.downcast_ref::<String>() {
                error!("pipeline({}) worker panicked: {text}", self.name);
            } else {
                error!("pipeline({}) worker panicked", self.name);
            }
        }
    }
}

struct Worker {
    name: String,
    interval: Duration,
    topics: Vec<String>,
    source_broker: BrokerConfig,
    destination_broker: BrokerConfig,
    queue_tx: QueueSender,
    queue_rx: QueueReceiver,
    metrics: Arc<Metrics>,
    running: Arc<AtomicBool>,
}

impl Worker {
    fn run(self, mut processor: Processor) {
        info!("{} thread started", self.name);

        let Some((source, destination)) = self.open_brokers(&mut processor) else {
            self.running.store(false, Ordering::SeqCst);
            error!("{} cannot open brokers", self.name);
            return;
        };

        while self.running.load(Ordering::SeqCst) {
            while let Ok(msg) = self.queue_rx.try_recv() {
                self.metrics.rx_message_total.inc();
                processor.handle(&msg, destination.as_ref());
            }

            if !self.interval.is_zero() {
                thread::sleep(self.interval);
            }
        }

        source.disconnect();
        destination.disconnect();

        info!("{} thread stopped", self.name);
    }

    fn open_brokers(
        &self,
        processor: &mut Processor,
    ) -> Option<(Box<dyn Transport>, Box<dyn Transport>)> {
        let source = match transport::create(&self.source_broker) {
            Ok(source) => source,
            Err(e) => {
                error!(
                    "cannot create source broker from configuration({:?}): {e:#}",
                    self.source_broker.class
                );
                return None;
            }
        };

        processor.core.device_id = source.get_device_id();
        info!("device_id({})", processor.core.device_id);
        source.set_metrics(self.metrics.clone());

        let destination = match transport::create(&self.destination_broker) {
            Ok(destination) => destination,
            Err(e) => {
                error!(
                    "cannot create destination broker from configuration({:?}): {e:#}",
                    self.destination_broker.class
                );
                return None;
            }
        };

        if !source.start_listening(&self.topics, self.queue_tx.clone()) {
            error!("{} source broker refused to listen", self.name);
        }

        Some((source, destination))
    }
}
