use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use edgelink_object::{Error, Kv, Result, Value, json, map_get};

use crate::connection::Connection;
use crate::streams::{StreamEvents, SubscriptionHandle};

const PUBLISH_TO_IOT_CORE: &str = "aws.greengrass#PublishToIoTCore";
const PUBLISH_TO_IOT_CORE_MODEL: &str = "aws.greengrass#PublishToIoTCoreRequest";
const SUBSCRIBE_TO_IOT_CORE: &str = "aws.greengrass#SubscribeToIoTCore";
const SUBSCRIBE_TO_IOT_CORE_MODEL: &str = "aws.greengrass#SubscribeToIoTCoreRequest";

/// MQTT delivery guarantee for cloud-broker operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

impl Qos {
    const fn as_str(self) -> &'static str {
        match self {
            Self::AtMostOnce => "0",
            Self::AtLeastOnce => "1",
        }
    }
}

impl Connection {
    /// Publishes an MQTT message to the cloud broker.
    pub fn publish_to_iot_core(&self, topic_name: &str, payload: &[u8], qos: Qos) -> Result<()> {
        let encoded = BASE64.encode(payload);
        self.publish_to_iot_core_wrapped(topic_name, encoded.as_bytes(), qos)
    }

    /// Publishes an already base64-encoded MQTT payload to the cloud broker.
    pub fn publish_to_iot_core_b64(
        &self,
        topic_name: &str,
        b64_payload: &[u8],
        qos: Qos,
    ) -> Result<()> {
        self.publish_to_iot_core_wrapped(topic_name, b64_payload, qos)
    }

    fn publish_to_iot_core_wrapped(&self, topic_name: &str, b64: &[u8], qos: Qos) -> Result<()> {
        let params = [
            Kv::new(b"topicName", Value::Buf(topic_name.as_bytes())),
            Kv::new(b"qos", Value::Buf(qos.as_str().as_bytes())),
            Kv::new(b"payload", Value::Buf(b64)),
        ];
        self.call_no_reply(PUBLISH_TO_IOT_CORE, PUBLISH_TO_IOT_CORE_MODEL, &params, None)
    }

    /// Subscribes to MQTT messages from the cloud broker on topics matching
    /// `topic_filter`. The callback receives `(topic, payload, handle)` with
    /// the payload base64-decoded.
    pub fn subscribe_to_iot_core(
        &self,
        topic_filter: &str,
        qos: Qos,
        callback: impl FnMut(&[u8], &[u8], SubscriptionHandle) + Send + 'static,
    ) -> Result<SubscriptionHandle> {
        let params = [
            Kv::new(b"topicName", Value::Buf(topic_filter.as_bytes())),
            Kv::new(b"qos", Value::Buf(qos.as_str().as_bytes())),
        ];
        self.open_subscription(
            SUBSCRIBE_TO_IOT_CORE,
            SUBSCRIBE_TO_IOT_CORE_MODEL,
            &params,
            Box::new(IotCoreEvents { callback }),
            None,
        )
    }
}

struct IotCoreEvents<F> {
    callback: F,
}

impl<F> StreamEvents for IotCoreEvents<F>
where
    F: FnMut(&[u8], &[u8], SubscriptionHandle) + Send,
{
    fn on_event(&mut self, payload: &[u8], handle: SubscriptionHandle) -> Result<()> {
        let mut owned = payload.to_vec();
        let value = json::decode_destructive(&mut owned)?;
        let pairs = value.as_map().ok_or(Error::Parse)?;
        let message = map_get(pairs, b"message").and_then(|v| v.as_map()).ok_or(Error::Parse)?;

        let topic = map_get(message, b"topicName").and_then(|v| v.as_buf()).ok_or(Error::Parse)?;
        let b64 = map_get(message, b"payload").and_then(|v| v.as_buf()).ok_or(Error::Parse)?;
        let bytes = BASE64.decode(b64).map_err(|_| Error::Parse)?;

        (self.callback)(topic, &bytes, handle);
        Ok(())
    }
}
