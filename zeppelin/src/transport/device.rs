use std::collections::HashMap;
use std::env;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, Event, MqttOptions, Outgoing, Packet, Publish, QoS, SubscribeFilter,
    TlsConfiguration,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::runtime::Runtime;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;
use crate::queue::{InboundMessage, QueueSender};
use crate::throttle::Throttle;

use super::mqtt::wait_until_connected;
use super::{payload_bytes, property_bag, sas, PublishOptions, Transport};

/// Cloud-to-device messages have no topic of their own; senders put the
/// logical topic into the `src_topic` custom property, and messages without
/// one land here.
const DEFAULT_SOURCE_TOPIC: &str = "none";
const CONNECT_INTERVAL: Duration = Duration::from_secs(5);
const TOKEN_TTL: Duration = Duration::from_secs(24 * 3600);

/// One hub device connection per process; pipelines share it along with the
/// topic routing table.
static SHARED_CORE: Mutex<Option<Arc<DeviceCore>>> = Mutex::new(None);

fn shared_core() -> Result<Arc<DeviceCore>> {
    let mut holder = SHARED_CORE.lock().expect("device core lock poisoned");

    if let Some(core) = holder.as_ref() {
        if core.connected.load(Ordering::SeqCst) {
            return Ok(core.clone());
        }
    }

    let core = DeviceCore::connect()?;
    *holder = Some(core.clone());
    Ok(core)
}

#[derive(Deserialize)]
struct IdentityFile {
    provisioning: Option<Provisioning>,
}

#[derive(Deserialize)]
struct Provisioning {
    connection_string: Option<String>,
}

/// The device connection string lives in the identity TOML file exposed to
/// the container; its location comes from `AZIOT_CONFIG_PATH`.
fn load_connection_string() -> Result<String> {
    let path = env::var("AZIOT_CONFIG_PATH").unwrap_or_else(|_| "/aziot_config.toml".to_owned());
    info!("Loading connection string from {path}");

    let text =
        fs::read_to_string(&path).with_context(|| format!("unable to read identity file {path}"))?;
    let identity: IdentityFile =
        toml::from_str(&text).with_context(|| format!("invalid identity file {path}"))?;

    identity
        .provisioning
        .and_then(|p| p.connection_string)
        .filter(|cs| !cs.is_empty())
        .with_context(|| format!("no connection string in {path}; did you set AZIOT_CONFIG_PATH?"))
}

struct DeviceCore {
    device_id: String,
    devicebound_prefix: String,
    events_prefix: String,
    runtime: Runtime,
    client: AsyncClient,
    topics: Mutex<HashMap<String, QueueSender>>,
    throttle: Throttle,
    metrics: Mutex<Option<Arc<Metrics>>>,
    connected: AtomicBool,
    cancellation: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceCore {
    fn connect() -> Result<Arc<DeviceCore>> {
        let connection_string = load_connection_string()?;
        let cs = sas::ConnectionString::parse(&connection_string)?;

        let device_id = cs.device_id.clone().context("connection string has no DeviceId")?;
        let key = cs
            .shared_access_key
            .as_deref()
            .context("connection string has no SharedAccessKey")?;

        let username = format!("{}/{device_id}/?api-version=2018-06-30", cs.host_name);
        let resource = format!("{}/devices/{device_id}", cs.host_name);
        let password = sas::sas_token(&resource, key, None, TOKEN_TTL)?;

        let mut options = MqttOptions::new(&device_id, &cs.host_name, 8883);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_credentials(username, password);
        options.set_transport(rumqttc::Transport::Tls(TlsConfiguration::Native));
        options.set_clean_session(false);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .context("Unable to build tokio runtime")?;

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        info!("id({device_id}) connecting to hub({})", cs.host_name);
        runtime.block_on(wait_until_connected(&mut eventloop, &device_id))?;
        info!("id({device_id}) connected to hub({})", cs.host_name);

        let devicebound_prefix = format!("devices/{device_id}/messages/devicebound/");
        let events_prefix = format!("devices/{device_id}/messages/events/");

        let cancellation = CancellationToken::new();
        let core = Arc::new(DeviceCore {
            device_id,
            devicebound_prefix,
            events_prefix,
            runtime,
            client: client.clone(),
            topics: Mutex::new(HashMap::new()),
            throttle: Throttle::new(10, 1.0),
            metrics: Mutex::new(None),
            connected: AtomicBool::new(true),
            cancellation: cancellation.clone(),
            task: Mutex::new(None),
        });

        core.runtime
            .block_on(core.subscribe_devicebound())
            .context("unable to subscribe to cloud-to-device messages")?;

        let task = core.runtime.spawn(run_eventloop(
            Arc::downgrade(&core),
            eventloop,
            cancellation,
        ));
        *core.task.lock().expect("task lock poisoned") = Some(task);

        Ok(core)
    }

    async fn subscribe_devicebound(&self) -> Result<()> {
        let filter = SubscribeFilter::new(
            format!("{}#", self.devicebound_prefix),
            QoS::AtLeastOnce,
        );
        self.client.subscribe_many(vec![filter]).await?;
        Ok(())
    }
}

impl Drop for DeviceCore {
    fn drop(&mut self) {
        self.cancellation.cancel();
        if let Some(task) = self.task.lock().expect("task lock poisoned").take() {
            if let Err(e) = self.runtime.block_on(task) {
                error!("device event loop task failed: {e}");
            }
        }
    }
}

async fn run_eventloop(
    core: Weak<DeviceCore>,
    mut eventloop: rumqttc::EventLoop,
    cancellation: CancellationToken,
) {
    loop {
        let notification = select! {
            _ = cancellation.cancelled() => {
                debug!("stopping device loop because of cancellation");
                break;
            }
            notification = eventloop.poll() => notification,
        };

        let Some(core) = core.upgrade() else {
            break;
        };

        match notification {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                handle_devicebound(&core, &publish);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                core.connected.store(true, Ordering::SeqCst);
                if let Err(e) = core.subscribe_devicebound().await {
                    error!("unable to re-subscribe after reconnect: {e}");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                cancellation.cancel();
            }
            Ok(_) => {}
            Err(e) => {
                core.connected.store(false, Ordering::SeqCst);
                if cancellation.is_cancelled() {
                    break;
                }
                warn!("hub connection error, retrying: {e}");
                tokio::time::sleep(CONNECT_INTERVAL).await;
            }
        }
    }
}

fn handle_devicebound(core: &DeviceCore, publish: &Publish) {
    let Some(bag) = publish.topic.strip_prefix(&core.devicebound_prefix) else {
        warn!("ignoring message on unexpected topic({})", publish.topic);
        return;
    };

    let props = match property_bag::parse(bag) {
        Ok(props) => props,
        Err(e) => {
            error!("failed parsing devicebound topic `{}`: {e:?}", publish.topic);
            return;
        }
    };

    let topic = props
        .get("src_topic")
        .map(String::as_str)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_SOURCE_TOPIC)
        .to_owned();

    info!("Received message from topic({topic})");

    let queue = {
        let topics = core.topics.lock().expect("topics lock poisoned");
        topics.get(&topic).cloned()
    };

    let Some(queue) = queue else {
        warn!("no destination queue found. discard message topic({topic}) props({props:?})");
        return;
    };

    let msg = InboundMessage::from_bytes(&topic, &publish.payload).with_props(props);
    if queue.send(msg).is_err() {
        warn!("pipeline queue closed, dropping message from topic({topic})");
        return;
    }

    if core.throttle.throttle() {
        let metrics = core.metrics.lock().expect("metrics lock poisoned");
        if let Some(metrics) = metrics.as_ref() {
            metrics.throttle_total.inc();
        }
    }
}

/// Device-side hub binding, used to receive cloud-to-device messages on the
/// edge and to send device-to-cloud telemetry.
pub struct CloudDeviceTransport {
    core: Arc<DeviceCore>,
}

impl CloudDeviceTransport {
    pub fn new() -> Result<Self> {
        Ok(CloudDeviceTransport {
            core: shared_core()?,
        })
    }
}

impl Transport for CloudDeviceTransport {
    fn publish_opts(&self, topic: &str, payload: &Value, _opts: PublishOptions) -> bool {
        if !self.core.connected.load(Ordering::SeqCst) {
            warn!("Not connected to the hub!");
            return false;
        }

        let data = payload_bytes(payload);
        info!(
            "Sending message to topic({topic}) data({:.150})...",
            String::from_utf8_lossy(&data)
        );

        let bag = property_bag::build(&[
            ("$.ct", "application/json"),
            ("$.ce", "utf-8"),
            ("src_topic", topic),
        ]);
        let full_topic = format!("{}{bag}", self.core.events_prefix);

        match self
            .core
            .runtime
            .block_on(self.core.client.publish(full_topic, QoS::AtLeastOnce, false, data))
        {
            Ok(()) => true,
            Err(e) => {
                error!("unable to publish to hub: {e}");
                false
            }
        }
    }

    fn start_listening(&self, topics: &[String], queue: QueueSender) -> bool {
        let topics = if topics.is_empty() {
            vec![DEFAULT_SOURCE_TOPIC.to_owned()]
        } else {
            topics.to_vec()
        };

        info!("Listening on topics {topics:?}");
        let mut map = self.core.topics.lock().expect("topics lock poisoned");
        for topic in topics {
            map.insert(topic, queue.clone());
        }

        true
    }

    fn disconnect(&self) {
        if !self.core.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.core.runtime.block_on(self.core.client.disconnect()) {
            debug!("hub disconnect failed: {e}");
        }
    }

    fn set_metrics(&self, metrics: Arc<Metrics>) {
        *self.core.metrics.lock().expect("metrics lock poisoned") = Some(metrics);
    }

    fn set_max_msg_sec(&self, max_msg_sec: u32) {
        self.core.throttle.set_max_msg_sec(max_msg_sec);
    }

    fn set_sleep_sec(&self, sleep_sec: f64) {
        self.core.throttle.set_sleep_sec(sleep_sec);
    }
}
