use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS, SubscribeFilter,
    TlsConfiguration,
};
use serde_json::Value;
use tokio::runtime::Runtime;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::metrics::Metrics;
use crate::queue::{InboundMessage, QueueSender};
use crate::throttle::Throttle;

use super::{payload_bytes, PublishOptions, Transport};

const CONNECT_MAX_RETRY: u32 = 10;
const CONNECT_INTERVAL: Duration = Duration::from_secs(5);

struct Listener {
    topics: Vec<String>,
    queue: QueueSender,
}

struct Shared {
    id: String,
    qos: QoS,
    throttle: Throttle,
    metrics: Mutex<Option<Arc<Metrics>>>,
    listener: Mutex<Option<Listener>>,
    connected: AtomicBool,
}

/// A plain MQTT broker binding. The rumqttc event loop runs on an owned
/// single-worker runtime; the public API is synchronous and blocks on that
/// runtime at the seam.
pub struct MqttTransport {
    runtime: Runtime,
    client: AsyncClient,
    retain: bool,
    shared: Arc<Shared>,
    cancellation: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    pub fn new(config: &MqttConfig) -> Result<Self> {
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| format!("zeppelin-{}", uuid::Uuid::new_v4()));

        let mut options = MqttOptions::new(&id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        if let Some(ca_path) = &config.ca_certs {
            let ca = fs::read(ca_path)
                .with_context(|| format!("unable to read CA certificate {ca_path}"))?;

            let client_auth = match (&config.certfile, &config.keyfile) {
                (Some(certfile), Some(keyfile)) => {
                    let cert = fs::read(certfile)
                        .with_context(|| format!("unable to read client certificate {certfile}"))?;
                    let key = fs::read(keyfile)
                        .with_context(|| format!("unable to read client key {keyfile}"))?;
                    Some((cert, key))
                }
                _ => None,
            };

            options.set_transport(rumqttc::Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .context("Unable to build tokio runtime")?;

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        info!(
            "id({id}) connecting to broker({}:{}) keepalive({})",
            config.host, config.port, config.keepalive
        );
        runtime.block_on(wait_until_connected(&mut eventloop, &id))?;
        info!("id({id}) connected to broker({}:{})", config.host, config.port);

        let shared = Arc::new(Shared {
            id,
            qos: qos_level(config.qos),
            throttle: Throttle::new(10, 1.0),
            metrics: Mutex::new(None),
            listener: Mutex::new(None),
            connected: AtomicBool::new(true),
        });

        let cancellation = CancellationToken::new();
        let task = runtime.spawn(run_eventloop(
            shared.clone(),
            client.clone(),
            eventloop,
            cancellation.clone(),
        ));

        Ok(MqttTransport {
            runtime,
            client,
            retain: config.retain,
            shared,
            cancellation,
            task: Mutex::new(Some(task)),
        })
    }

    fn subscribe_filters(&self, topics: &[String]) -> Vec<SubscribeFilter> {
        topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), self.shared.qos))
            .collect()
    }
}

impl Transport for MqttTransport {
    fn publish_opts(&self, topic: &str, payload: &Value, opts: PublishOptions) -> bool {
        if !self.shared.connected.load(Ordering::SeqCst) {
            error!("id({}) not connected", self.shared.id);
            return false;
        }

        let qos = opts.qos.map(qos_level).unwrap_or(self.shared.qos);
        let retain = opts.retain.unwrap_or(self.retain);
        let data = payload_bytes(payload);

        info!(
            "id({}) Tx msg to ({topic}): {:.300}...",
            self.shared.id,
            String::from_utf8_lossy(&data)
        );

        match self
            .runtime
            .block_on(self.client.publish(topic, qos, retain, data))
        {
            Ok(()) => true,
            Err(e) => {
                error!("id({}) message not sent to ({topic}): {e}", self.shared.id);
                false
            }
        }
    }

    fn start_listening(&self, topics: &[String], queue: QueueSender) -> bool {
        // listening on everything when no topic is configured
        let topics = if topics.is_empty() {
            vec!["#".to_owned()]
        } else {
            topics.to_vec()
        };

        info!("id({}) Listening on topics {topics:?}", self.shared.id);

        let filters = self.subscribe_filters(&topics);
        *self.shared.listener.lock().expect("listener lock poisoned") =
            Some(Listener { topics, queue });

        match self.runtime.block_on(self.client.subscribe_many(filters)) {
            Ok(()) => true,
            Err(e) => {
                error!("id({}) unable to subscribe: {e}", self.shared.id);
                false
            }
        }
    }

    fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.runtime.block_on(self.client.disconnect()) {
            debug!("id({}) disconnect failed: {e}", self.shared.id);
        }
    }

    fn set_metrics(&self, metrics: Arc<Metrics>) {
        *self.shared.metrics.lock().expect("metrics lock poisoned") = Some(metrics);
    }

    fn set_max_msg_sec(&self, max_msg_sec: u32) {
        self.shared.throttle.set_max_msg_sec(max_msg_sec);
    }

    fn set_sleep_sec(&self, sleep_sec: f64) {
        self.shared.throttle.set_sleep_sec(sleep_sec);
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.cancellation.cancel();
        if let Some(task) = self.task.lock().expect("task lock poisoned").take() {
            if let Err(e) = self.runtime.block_on(task) {
                error!("id({}) event loop task failed: {e}", self.shared.id);
            }
        }
    }
}

/// Poll until the broker accepts the connection, giving up after the bounded
/// initial retries.
pub(crate) async fn wait_until_connected(eventloop: &mut EventLoop, id: &str) -> Result<()> {
    let mut retry = 0;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                retry += 1;
                if retry >= CONNECT_MAX_RETRY {
                    bail!("Cannot connect to MQTT broker: {e}");
                }
                info!("id({id}) connect retry({retry})");
                tokio::time::sleep(CONNECT_INTERVAL).await;
            }
        }
    }
}

/// The long-lived receive loop. Reconnection is driven by polling again after
/// an error; every fresh CONNACK re-applies the subscriptions.
async fn run_eventloop(
    shared: Arc<Shared>,
    client: AsyncClient,
    mut eventloop: EventLoop,
    cancellation: CancellationToken,
) {
    loop {
        select! {
            _ = cancellation.cancelled() => {
                debug!("id({}) stopping MQTT loop because of cancellation", shared.id);
                break;
            }
            notification = eventloop.poll() => match notification {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handle_publish(&shared, &publish);
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    shared.connected.store(true, Ordering::SeqCst);
                    resubscribe(&shared, &client).await;
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("id({}) stopping MQTT loop because of disconnect", shared.id);
                    cancellation.cancel();
                }
                Ok(_) => {}
                Err(e) => {
                    shared.connected.store(false, Ordering::SeqCst);
                    if cancellation.is_cancelled() {
                        break;
                    }
                    warn!("id({}) connection error, retrying: {e}", shared.id);
                    tokio::time::sleep(CONNECT_INTERVAL).await;
                }
            }
        }
    }
}

async fn resubscribe(shared: &Shared, client: &AsyncClient) {
    let filters = {
        let listener = shared.listener.lock().expect("listener lock poisoned");
        let Some(listener) = listener.as_ref() else {
            return;
        };
        listener
            .topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), shared.qos))
            .collect::<Vec<_>>()
    };

    info!("id({}) re-applying {} subscriptions", shared.id, filters.len());
    if let Err(e) = client.subscribe_many(filters).await {
        error!("id({}) unable to re-subscribe: {e}", shared.id);
    }
}

fn handle_publish(shared: &Shared, publish: &Publish) {
    {
        let listener = shared.listener.lock().expect("listener lock poisoned");
        let Some(listener) = listener.as_ref() else {
            warn!("id({}) no listener, discarding message", shared.id);
            return;
        };

        info!(
            "id({}) Rx msg from topic({}): {:.300}...",
            shared.id,
            publish.topic,
            String::from_utf8_lossy(&publish.payload)
        );

        let msg = InboundMessage::from_bytes(&publish.topic, &publish.payload);
        if listener.queue.send(msg).is_err() {
            warn!("id({}) pipeline queue closed, dropping message", shared.id);
            return;
        }
    }

    // the sleep must not hold the listener lock
    if shared.throttle.throttle() {
        let metrics = shared.metrics.lock().expect("metrics lock poisoned");
        if let Some(metrics) = metrics.as_ref() {
            metrics.throttle_total.inc();
        }
    }
}

fn qos_level(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}
