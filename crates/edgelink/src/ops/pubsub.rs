use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use edgelink_object::{Error, Kv, Result, Value, json, map_get};

use crate::connection::Connection;
use crate::streams::{StreamEvents, SubscriptionHandle};

const PUBLISH_TO_TOPIC: &str = "aws.greengrass#PublishToTopic";
const PUBLISH_TO_TOPIC_MODEL: &str = "aws.greengrass#PublishToTopicRequest";
const SUBSCRIBE_TO_TOPIC: &str = "aws.greengrass#SubscribeToTopic";
const SUBSCRIBE_TO_TOPIC_MODEL: &str = "aws.greengrass#SubscribeToTopicRequest";

/// Payload delivered to a topic subscription callback.
#[derive(Debug)]
pub enum TopicMessage<'a> {
    /// The publisher sent structured JSON.
    Json(&'a Value<'a>),
    /// The publisher sent raw bytes (already base64-decoded).
    Binary(&'a [u8]),
}

impl Connection {
    /// Publishes a JSON message to a local pub/sub topic.
    pub fn publish_to_topic_json(&self, topic: &str, payload: &[Kv<'_>]) -> Result<()> {
        let publish = Value::Map(vec![Kv::new(
            b"jsonMessage",
            Value::Map(vec![Kv::new(b"message", Value::Map(payload.to_vec()))]),
        )]);
        let params =
            [Kv::new(b"topic", Value::Buf(topic.as_bytes())), Kv::new(b"publishMessage", publish)];
        self.call_no_reply(PUBLISH_TO_TOPIC, PUBLISH_TO_TOPIC_MODEL, &params, None)
    }

    /// Publishes raw bytes to a local pub/sub topic (base64-wrapped on the
    /// wire).
    pub fn publish_to_topic_binary(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let encoded = BASE64.encode(payload);
        self.publish_to_topic_wrapped(topic, encoded.as_bytes())
    }

    /// Publishes an already base64-encoded payload to a local pub/sub topic,
    /// skipping the encode pass.
    pub fn publish_to_topic_binary_b64(&self, topic: &str, b64_payload: &[u8]) -> Result<()> {
        self.publish_to_topic_wrapped(topic, b64_payload)
    }

    fn publish_to_topic_wrapped(&self, topic: &str, b64: &[u8]) -> Result<()> {
        let publish = Value::Map(vec![Kv::new(
            b"binaryMessage",
            Value::Map(vec![Kv::new(b"message", Value::Buf(b64))]),
        )]);
        let params =
            [Kv::new(b"topic", Value::Buf(topic.as_bytes())), Kv::new(b"publishMessage", publish)];
        self.call_no_reply(PUBLISH_TO_TOPIC, PUBLISH_TO_TOPIC_MODEL, &params, None)
    }

    /// Subscribes to a local pub/sub topic. The callback receives
    /// `(topic, message, handle)`; JSON publications arrive decoded, binary
    /// ones as raw bytes.
    pub fn subscribe_to_topic(
        &self,
        topic: &str,
        callback: impl FnMut(&[u8], TopicMessage<'_>, SubscriptionHandle) + Send + 'static,
    ) -> Result<SubscriptionHandle> {
        let params = [Kv::new(b"topic", Value::Buf(topic.as_bytes()))];
        self.open_subscription(
            SUBSCRIBE_TO_TOPIC,
            SUBSCRIBE_TO_TOPIC_MODEL,
            &params,
            Box::new(TopicEvents { topic: topic.to_owned(), callback }),
            None,
        )
    }
}

struct TopicEvents<F> {
    /// Subscribed topic, used when an event carries no context topic.
    topic: String,
    callback: F,
}

fn context_topic<'v, 'a>(message: &'v [Kv<'a>]) -> Option<&'a [u8]> {
    map_get(message, b"context")
        .and_then(|v| v.as_map())
        .and_then(|ctx| map_get(ctx, b"topic"))
        .and_then(|v| v.as_buf())
}

impl<F> StreamEvents for TopicEvents<F>
where
    F: FnMut(&[u8], TopicMessage<'_>, SubscriptionHandle) + Send,
{
    fn on_event(&mut self, payload: &[u8], handle: SubscriptionHandle) -> Result<()> {
        let mut owned = payload.to_vec();
        let value = json::decode_destructive(&mut owned)?;
        let pairs = value.as_map().ok_or(Error::Parse)?;

        if let Some(message) = map_get(pairs, b"jsonMessage").and_then(|v| v.as_map()) {
            let body = map_get(message, b"message").ok_or(Error::Parse)?;
            let topic = context_topic(message).unwrap_or_else(|| self.topic.as_bytes());
            (self.callback)(topic, TopicMessage::Json(body), handle);
            return Ok(());
        }

        if let Some(message) = map_get(pairs, b"binaryMessage").and_then(|v| v.as_map()) {
            let b64 = map_get(message, b"message").and_then(|v| v.as_buf()).ok_or(Error::Parse)?;
            let bytes = BASE64.decode(b64).map_err(|_| Error::Parse)?;
            let topic = context_topic(message).unwrap_or_else(|| self.topic.as_bytes());
            (self.callback)(topic, TopicMessage::Binary(&bytes), handle);
            return Ok(());
        }

        Err(Error::Parse)
    }
}
