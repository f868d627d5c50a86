use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, Event, MqttOptions, Outgoing, Packet, Publish, QoS, SubscribeFilter,
    TlsConfiguration,
};
use serde_json::{json, Value};
use tokio::runtime::Runtime;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EdgeConfig;
use crate::metrics::Metrics;
use crate::queue::{InboundMessage, QueueSender};
use crate::throttle::Throttle;

use super::mqtt::wait_until_connected;
use super::{payload_bytes, property_bag, sas, PublishOptions, Transport};

const METHODS_PREFIX: &str = "$iothub/methods/POST/";
const CONNECT_INTERVAL: Duration = Duration::from_secs(5);
const TOKEN_TTL: Duration = Duration::from_secs(24 * 3600);

/// The edge hub allows a single module connection per process, so every
/// pipeline using this variant shares one connection and one routing table.
static SHARED_CORE: Mutex<Option<Arc<EdgeCore>>> = Mutex::new(None);

fn shared_core() -> Result<Arc<EdgeCore>> {
    let mut holder = SHARED_CORE.lock().expect("edge core lock poisoned");

    if let Some(core) = holder.as_ref() {
        if core.connected.load(Ordering::SeqCst) {
            return Ok(core.clone());
        }
    }

    let core = EdgeCore::connect()?;
    *holder = Some(core.clone());
    Ok(core)
}

#[derive(Default)]
struct Routes {
    /// input name → pipeline queue
    topics: HashMap<String, QueueSender>,
    /// direct method name → pipeline queue
    methods: HashMap<String, QueueSender>,
    /// fallback when a method was enabled before its pipeline started listening
    default_method: Option<String>,
    default_queue: Option<QueueSender>,
}

struct EdgeCore {
    device_id: String,
    inputs_prefix: String,
    events_prefix: String,
    runtime: Runtime,
    client: AsyncClient,
    routes: Mutex<Routes>,
    throttle: Throttle,
    metrics: Mutex<Option<Arc<Metrics>>>,
    connected: AtomicBool,
    cancellation: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EdgeCore {
    fn connect() -> Result<Arc<EdgeCore>> {
        let connection_string = env::var("EDGEHUB_CONNECTION_STRING")
            .or_else(|_| env::var("IOTHUB_CONNECTION_STRING"))
            .context("neither EDGEHUB_CONNECTION_STRING nor IOTHUB_CONNECTION_STRING is defined")?;
        let cs = sas::ConnectionString::parse(&connection_string)?;

        let device_id = cs.device_id.clone().context("connection string has no DeviceId")?;
        let module_id = cs
            .module_id
            .clone()
            .or_else(|| env::var("MODULE_ID").ok())
            .unwrap_or_else(|| "zeppelin".to_owned());
        let key = cs
            .shared_access_key
            .as_deref()
            .context("connection string has no SharedAccessKey")?;

        let broker = cs.gateway_host_name.as_deref().unwrap_or(&cs.host_name);
        let username = format!(
            "{}/{device_id}/{module_id}/?api-version=2018-06-30",
            cs.host_name
        );
        let resource = format!("{}/devices/{device_id}/modules/{module_id}", cs.host_name);
        let password = sas::sas_token(&resource, key, None, TOKEN_TTL)?;

        let client_id = format!("{device_id}/{module_id}");
        let mut options = MqttOptions::new(&client_id, broker, 8883);
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

        info!("id({client_id}) connecting to edge hub({broker})");
        runtime.block_on(wait_until_connected(&mut eventloop, &client_id))?;
        info!("id({client_id}) connected to edge hub({broker})");

        let inputs_prefix = format!("devices/{device_id}/modules/{module_id}/inputs/");
        let events_prefix = format!("devices/{device_id}/modules/{module_id}/messages/events/");

        let cancellation = CancellationToken::new();
        let core = Arc::new(EdgeCore {
            device_id,
            inputs_prefix,
            events_prefix,
            runtime,
            client: client.clone(),
            routes: Mutex::new(Routes::default()),
            throttle: Throttle::new(10, 1.0),
            metrics: Mutex::new(None),
            connected: AtomicBool::new(true),
            cancellation: cancellation.clone(),
            task: Mutex::new(None),
        });

        core.runtime
            .block_on(core.subscribe_all())
            .context("unable to subscribe to edge hub topics")?;

        // the task must not keep the core alive, or its drop (which joins the
        // task) could run on the runtime's own worker thread
        let task = core.runtime.spawn(run_eventloop(
            Arc::downgrade(&core),
            client,
            eventloop,
            cancellation,
        ));
        *core.task.lock().expect("task lock poisoned") = Some(task);

        Ok(core)
    }

    async fn subscribe_all(&self) -> Result<()> {
        let filters = vec![
            SubscribeFilter::new(format!("{}#", self.inputs_prefix), QoS::AtLeastOnce),
            SubscribeFilter::new(format!("{METHODS_PREFIX}#"), QoS::AtLeastOnce),
        ];
        self.client.subscribe_many(filters).await?;
        Ok(())
    }
}

impl Drop for EdgeCore {
    fn drop(&mut self) {
        self.cancellation.cancel();
        if let Some(task) = self.task.lock().expect("task lock poisoned").take() {
            if let Err(e) = self.runtime.block_on(task) {
                error!("edge event loop task failed: {e}");
            }
        }
    }
}

async fn run_eventloop(
    core: std::sync::Weak<EdgeCore>,
    client: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    cancellation: CancellationToken,
) {
    loop {
        let notification = select! {
            _ = cancellation.cancelled() => {
                debug!("stopping edge loop because of cancellation");
                break;
            }
            notification = eventloop.poll() => notification,
        };

        let Some(core) = core.upgrade() else {
            break;
        };

        match notification {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                handle_publish(&core, &client, &publish);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                core.connected.store(true, Ordering::SeqCst);
                if let Err(e) = core.subscribe_all().await {
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
                warn!("edge hub connection error, retrying: {e}");
                tokio::time::sleep(CONNECT_INTERVAL).await;
            }
        }
    }
}

fn handle_publish(core: &EdgeCore, client: &AsyncClient, publish: &Publish) {
    if publish.topic.starts_with(METHODS_PREFIX) {
        handle_method_request(core, client, publish);
    } else if let Some(rest) = publish.topic.strip_prefix(&core.inputs_prefix) {
        handle_input(core, rest, publish);
    } else {
        warn!("ignoring message on unexpected topic({})", publish.topic);
    }
}

fn handle_input(core: &EdgeCore, rest: &str, publish: &Publish) {
    let input = rest.split('/').next().unwrap_or(rest);
    info!("Received message from topic({input})");

    let queue = {
        let routes = core.routes.lock().expect("routes lock poisoned");
        routes.topics.get(input).cloned()
    };

    let Some(queue) = queue else {
        warn!("discard message from topic({input})");
        return;
    };

    let msg = InboundMessage::from_bytes(input, &publish.payload);
    if queue.send(msg).is_err() {
        warn!("pipeline queue closed, dropping message from topic({input})");
        return;
    }

    if core.throttle.throttle() {
        let metrics = core.metrics.lock().expect("metrics lock poisoned");
        if let Some(metrics) = metrics.as_ref() {
            metrics.throttle_total.inc();
        }
    }
}

/// Turn a direct method request into a queued message and answer with the
/// JSON status the caller expects: 200 on success, 400 on a bad request, 500
/// when queueing failed internally.
fn handle_method_request(core: &EdgeCore, client: &AsyncClient, publish: &Publish) {
    // The topic reads `$iothub/methods/POST/{method name}/?$rid={request id}`
    // and the method name may itself contain slashes, so the request id is
    // found from the right.
    let topic_without_prefix = &publish.topic[METHODS_PREFIX.len()..];
    let Some(last_slash) = topic_without_prefix.rfind('/') else {
        error!("method call topic({}) misses its request id", publish.topic);
        return;
    };
    let method_name = &topic_without_prefix[..last_slash];

    let properties = match property_bag::parse(&topic_without_prefix[last_slash + 1..]) {
        Ok(properties) => properties,
        Err(e) => {
            error!("failed parsing method call topic `{}`: {e:?}", publish.topic);
            return;
        }
    };

    let Some(request_id) = properties.get("$rid") else {
        error!("request id missing in method call on topic `{}`", publish.topic);
        return;
    };

    info!(
        "Received method request({method_name}) request_id({request_id}) payload({:.300})",
        String::from_utf8_lossy(&publish.payload)
    );

    let queue = {
        let routes = core.routes.lock().expect("routes lock poisoned");
        routes.methods.get(method_name).cloned().or_else(|| {
            if routes.default_method.as_deref() == Some(method_name) {
                routes.default_queue.clone()
            } else {
                None
            }
        })
    };

    let (status, response) = match queue {
        None => (400, json!({"Error": format!("Invalid method {method_name}")})),
        Some(queue) => match serde_json::from_slice::<Value>(&publish.payload) {
            Ok(value) if !value.is_null() => {
                let msg = InboundMessage::from_value(method_name, value);
                if queue.send(msg).is_ok() {
                    (200, json!({"Response": "Message received with success"}))
                } else {
                    (500, json!({"Exception": "pipeline queue closed"}))
                }
            }
            _ => (400, json!({"Error": "Invalid payload"})),
        },
    };

    info!(
        "Sending method response({method_name}) request_id({request_id}) status({status})"
    );
    let response_topic = format!("$iothub/methods/res/{status}/?$rid={request_id}");
    if let Err(e) = client.try_publish(
        response_topic,
        QoS::AtLeastOnce,
        false,
        response.to_string(),
    ) {
        error!("unable to send method response: {e}");
    }
}

/// One pipeline's handle on the shared edge hub connection.
pub struct EdgeHubTransport {
    core: Arc<EdgeCore>,
    direct_method_name: Option<String>,
}

impl EdgeHubTransport {
    pub fn new(config: &EdgeConfig) -> Result<Self> {
        let mut direct_method_name = None;
        if config.enable_direct_method {
            match &config.direct_method_name {
                None => error!("direct_method_name attribute not defined"),
                Some(name) => {
                    info!("Direct method enabled with direct_method_name({name})");
                    direct_method_name = Some(name.clone());
                }
            }
        }

        let core = shared_core()?;

        if let Some(name) = &direct_method_name {
            let mut routes = core.routes.lock().expect("routes lock poisoned");
            routes.default_method = Some(name.clone());
        }

        Ok(EdgeHubTransport {
            core,
            direct_method_name,
        })
    }
}

impl Transport for EdgeHubTransport {
    fn publish_opts(&self, topic: &str, payload: &Value, _opts: PublishOptions) -> bool {
        if !self.core.connected.load(Ordering::SeqCst) {
            warn!("Not connected to the edge hub!");
            return false;
        }

        let data = payload_bytes(payload);
        info!(
            "Sending message to topic({topic}) data({:.150})...",
            String::from_utf8_lossy(&data)
        );

        let bag = property_bag::build(&[
            ("$.on", topic),
            ("$.ct", "application/json"),
            ("$.ce", "utf-8"),
        ]);
        let full_topic = format!("{}{bag}", self.core.events_prefix);

        match self
            .core
            .runtime
            .block_on(self.core.client.publish(full_topic, QoS::AtLeastOnce, false, data))
        {
            Ok(()) => true,
            Err(e) => {
                error!("unable to publish to output({topic}): {e}");
                false
            }
        }
    }

    fn start_listening(&self, topics: &[String], queue: QueueSender) -> bool {
        let mut routes = self.core.routes.lock().expect("routes lock poisoned");

        info!("Listening on topics {topics:?}");
        for topic in topics {
            routes.topics.insert(topic.clone(), queue.clone());
        }
        routes.default_queue = Some(queue.clone());

        if let Some(name) = &self.direct_method_name {
            routes.methods.insert(name.clone(), queue);
            info!("Direct method {name} associated with queue");
        }

        true
    }

    fn disconnect(&self) {
        if !self.core.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.core.runtime.block_on(self.core.client.disconnect()) {
            debug!("edge hub disconnect failed: {e}");
        }
    }

    fn get_device_id(&self) -> String {
        let from_env = super::edge_device_id();
        if from_env.is_empty() {
            self.core.device_id.clone()
        } else {
            from_env
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
