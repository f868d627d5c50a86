use std::env;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{error, info};
use serde_json::{json, Value};

use crate::config::HubConfig;
use crate::metrics::Metrics;
use crate::queue::QueueSender;
use crate::throttle::Throttle;

use super::{sas, PublishOptions, Transport};

const METHOD_API_VERSION: &str = "2021-04-12";
const TOKEN_TTL: Duration = Duration::from_secs(3600);
const CONNECT_MAX_RETRY: u32 = 10;
const CONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Cloud-side sender: publishing means invoking the configured direct method
/// on the target device's module, with the topic standing in for the device
/// id. Receiving is not a thing on this side.
pub struct CloudHubTransport {
    host: String,
    key: String,
    key_name: Option<String>,
    method_name: String,
    module_id: String,
    default_device_id: Option<String>,
    connection_timeout: Duration,
    response_timeout: Duration,
    agent: ureq::Agent,
    throttle: Throttle,
    metrics: Mutex<Option<Arc<Metrics>>>,
}

impl CloudHubTransport {
    pub fn new(config: &HubConfig) -> Result<Self> {
        let connection_string =
            env::var("IOTHUB_CONNECTION_STRING").context("IOTHUB_CONNECTION_STRING not defined")?;
        let cs = sas::ConnectionString::parse(&connection_string)?;
        let key = cs
            .shared_access_key
            .clone()
            .context("connection string has no SharedAccessKey")?;

        let module_id = config
            .module_id
            .clone()
            .or_else(|| env::var("MODULE_ID").ok())
            .unwrap_or_else(|| "zeppelin".to_owned());

        let connection_timeout = Duration::from_secs_f64(config.connection_timeout_sec);
        let response_timeout = Duration::from_secs_f64(config.response_timeout_sec);

        info!(
            "method_name({}) module_id({module_id}) connection_timeout_sec({}) response_timeout_sec({})",
            config.direct_method_name, config.connection_timeout_sec, config.response_timeout_sec
        );

        let transport = CloudHubTransport {
            host: cs.host_name,
            key,
            key_name: cs.shared_access_key_name,
            method_name: config.direct_method_name.clone(),
            module_id,
            default_device_id: config.default_device_id.clone(),
            connection_timeout,
            response_timeout,
            agent: ureq::AgentBuilder::new()
                .timeout_connect(connection_timeout)
                .timeout(connection_timeout + response_timeout)
                .build(),
            throttle: Throttle::new(10, 1.0),
            metrics: Mutex::new(None),
        };

        let mut retry = 0;
        let mut connected = transport.connect();

        while !connected && retry < CONNECT_MAX_RETRY {
            thread::sleep(CONNECT_INTERVAL);
            retry += 1;
            info!("connect retry({retry})");
            connected = transport.connect();
        }

        if !connected {
            bail!("Cannot connect to IoT hub({})!", transport.host);
        }

        Ok(transport)
    }

    /// One authenticated probe of the hub's service API.
    fn connect(&self) -> bool {
        let token = match sas::sas_token(&self.host, &self.key, self.key_name.as_deref(), TOKEN_TTL)
        {
            Ok(token) => token,
            Err(e) => {
                error!("unable to build hub token: {e:#}");
                return false;
            }
        };

        let url = format!(
            "https://{}/statistics/service?api-version={METHOD_API_VERSION}",
            self.host
        );

        match self.agent.get(&url).set("Authorization", &token).call() {
            Ok(_) => true,
            Err(e) => {
                error!("cannot reach hub({}): {e}", self.host);
                false
            }
        }
    }
}

impl Transport for CloudHubTransport {
    fn publish_opts(&self, topic: &str, payload: &Value, _opts: PublishOptions) -> bool {
        let device_id = if topic.is_empty() {
            self.default_device_id.as_deref()
        } else {
            Some(topic)
        };
        let Some(device_id) = device_id else {
            error!("no destination device id");
            return false;
        };

        info!(
            "publish to device({device_id}) module_id({}) method({})",
            self.module_id, self.method_name
        );

        let token = match sas::sas_token(
            &self.host,
            &self.key,
            self.key_name.as_deref(),
            TOKEN_TTL,
        ) {
            Ok(token) => token,
            Err(e) => {
                error!("unable to build hub token: {e:#}");
                return false;
            }
        };

        let url = format!(
            "https://{}/twins/{device_id}/modules/{}/methods?api-version={METHOD_API_VERSION}",
            self.host, self.module_id
        );

        let request = json!({
            "methodName": self.method_name,
            "payload": payload,
            "responseTimeoutInSeconds": self.response_timeout.as_secs(),
            "connectTimeoutInSeconds": self.connection_timeout.as_secs(),
        });

        match self
            .agent
            .post(&url)
            .set("Authorization", &token)
            .send_json(request)
        {
            Ok(response) => {
                info!("Result status({})", response.status());
                true
            }
            Err(e) => {
                error!("direct method invocation failed for device({device_id}): {e}");
                false
            }
        }
    }

    fn start_listening(&self, _topics: &[String], _queue: QueueSender) -> bool {
        error!("start_listening not supported on the hub service side");
        false
    }

    fn disconnect(&self) {}

    fn set_metrics(&self, metrics: Arc<Metrics>) {
        *self.metrics.lock().expect("metrics lock poisoned") = Some(metrics);
    }

    fn set_max_msg_sec(&self, max_msg_sec: u32) {
        self.throttle.set_max_msg_sec(max_msg_sec);
    }

    fn set_sleep_sec(&self, sleep_sec: f64) {
        self.throttle.set_sleep_sec(sleep_sec);
    }
}
