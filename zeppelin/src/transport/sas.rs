use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use urlencoding::encode;

/// An IoT hub connection string, split into its `key=value` fields.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectionString {
    pub host_name: String,
    pub gateway_host_name: Option<String>,
    pub device_id: Option<String>,
    pub module_id: Option<String>,
    pub shared_access_key: Option<String>,
    pub shared_access_key_name: Option<String>,
}

impl ConnectionString {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parsed = ConnectionString::default();

        for field in text.split(';') {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            let value = value.to_owned();
            match key {
                "HostName" => parsed.host_name = value,
                "GatewayHostName" => parsed.gateway_host_name = Some(value),
                "DeviceId" => parsed.device_id = Some(value),
                "ModuleId" => parsed.module_id = Some(value),
                "SharedAccessKey" => {
                    // base64 keys may contain '=' padding; keep the raw tail
                    let start = field.find('=').unwrap_or(0) + 1;
                    parsed.shared_access_key = Some(field[start..].to_owned());
                }
                "SharedAccessKeyName" => parsed.shared_access_key_name = Some(value),
                _ => {}
            }
        }

        if parsed.host_name.is_empty() {
            bail!("connection string has no HostName");
        }

        Ok(parsed)
    }
}

/// Build a `SharedAccessSignature` for the given resource from a base64 key.
pub(crate) fn sas_token(
    resource_uri: &str,
    key: &str,
    key_name: Option<&str>,
    ttl: Duration,
) -> Result<String> {
    let expiry = (SystemTime::now() + ttl)
        .duration_since(UNIX_EPOCH)
        .context("token expiry predates the epoch")?
        .as_secs();

    let encoded_uri = encode(resource_uri);
    let to_sign = format!("{encoded_uri}\n{expiry}");

    let key = BASE64
        .decode(key)
        .context("shared access key is not valid base64")?;
    let mut mac =
        Hmac::<Sha256>::new_from_slice(&key).context("shared access key has invalid length")?;
    mac.update(to_sign.as_bytes());
    let signature = encode_signature(&mac.finalize().into_bytes());

    let mut token = format!("SharedAccessSignature sr={encoded_uri}&sig={signature}&se={expiry}");
    if let Some(name) = key_name {
        token.push_str("&skn=");
        token.push_str(name);
    }

    Ok(token)
}

fn encode_signature(raw: &[u8]) -> String {
    encode(&BASE64.encode(raw)).into_owned()
}
