use std::time::{SystemTime, UNIX_EPOCH};

use edgelink_object::{Arena, Error, Kv, MAX_OBJECT_DEPTH, Result, Value, json, map_get};
use tracing::debug;

use crate::connection::Connection;
use crate::remote::RemoteError;
use crate::streams::{StreamEvents, SubscriptionHandle};

const GET_CONFIGURATION: &str = "aws.greengrass#GetConfiguration";
const GET_CONFIGURATION_MODEL: &str = "aws.greengrass#GetConfigurationRequest";
const UPDATE_CONFIGURATION: &str = "aws.greengrass#UpdateConfiguration";
const UPDATE_CONFIGURATION_MODEL: &str = "aws.greengrass#UpdateConfigurationRequest";
const SUBSCRIBE_TO_CONFIGURATION_UPDATE: &str = "aws.greengrass#SubscribeToConfigurationUpdate";
const SUBSCRIBE_TO_CONFIGURATION_UPDATE_MODEL: &str =
    "aws.greengrass#SubscribeToConfigurationUpdateRequest";

fn key_path_values<'a>(key_path: &[&'a str]) -> Result<Vec<Value<'a>>> {
    if key_path.len() > MAX_OBJECT_DEPTH {
        return Err(Error::NoMem);
    }
    Ok(key_path.iter().map(|key| Value::Buf(key.as_bytes())).collect())
}

/// Picks the reply's `value`, applying the classic unwrap: a one-entry map
/// keyed by the final path element yields that entry's value, unless the
/// entry is itself a map.
fn select_config_value<'v, 'a>(resp: &'v Value<'a>, key_path: &[&str]) -> Result<&'v Value<'a>> {
    let pairs = resp.as_map().ok_or(Error::Invalid)?;
    let value = map_get(pairs, b"value").ok_or(Error::Invalid)?;
    let value_pairs = value.as_map().ok_or(Error::Invalid)?;

    if let Some(final_key) = key_path.last() {
        if value_pairs.len() == 1
            && value_pairs[0].key == final_key.as_bytes()
            && !matches!(value_pairs[0].value, Value::Map(_))
        {
            return Ok(&value_pairs[0].value);
        }
    }
    Ok(value)
}

impl Connection {
    /// Reads configuration under `key_path` (empty for the whole config),
    /// decoding the result into `alloc`.
    ///
    /// Remote failures fold into the taxonomy: a missing key is `NoEntry`.
    pub fn get_config<'m>(
        &self,
        key_path: &[&str],
        component_name: Option<&str>,
        alloc: &mut Arena<'m>,
    ) -> Result<Value<'m>> {
        let mut raw = self.get_config_raw(key_path, component_name)?;
        let resp = json::decode_destructive(&mut raw)?;
        select_config_value(&resp, key_path)?.claim(alloc)
    }

    /// String-typed configuration read; `Parse` if the value is not a string.
    pub fn get_config_str(&self, key_path: &[&str], component_name: Option<&str>) -> Result<String> {
        let mut raw = self.get_config_raw(key_path, component_name)?;
        let resp = json::decode_destructive(&mut raw)?;
        match select_config_value(&resp, key_path)? {
            Value::Buf(bytes) => String::from_utf8(bytes.to_vec()).map_err(|_| Error::Parse),
            _ => Err(Error::Parse),
        }
    }

    pub fn get_config_i64(&self, key_path: &[&str], component_name: Option<&str>) -> Result<i64> {
        let mut raw = self.get_config_raw(key_path, component_name)?;
        let resp = json::decode_destructive(&mut raw)?;
        select_config_value(&resp, key_path)?.as_i64().ok_or(Error::Parse)
    }

    pub fn get_config_f64(&self, key_path: &[&str], component_name: Option<&str>) -> Result<f64> {
        let mut raw = self.get_config_raw(key_path, component_name)?;
        let resp = json::decode_destructive(&mut raw)?;
        select_config_value(&resp, key_path)?.as_f64().ok_or(Error::Parse)
    }

    pub fn get_config_bool(&self, key_path: &[&str], component_name: Option<&str>) -> Result<bool> {
        let mut raw = self.get_config_raw(key_path, component_name)?;
        let resp = json::decode_destructive(&mut raw)?;
        select_config_value(&resp, key_path)?.as_bool().ok_or(Error::Parse)
    }

    fn get_config_raw(&self, key_path: &[&str], component_name: Option<&str>) -> Result<Vec<u8>> {
        let keys = key_path_values(key_path)?;
        let mut params = vec![Kv::new(b"keyPath", Value::List(keys))];
        if let Some(name) = component_name {
            params.push(Kv::new(b"componentName", Value::Buf(name.as_bytes())));
        }

        let mut remote = RemoteError::default();
        match self.call_raw(GET_CONFIGURATION, GET_CONFIGURATION_MODEL, &params, Some(&mut remote))
        {
            Ok(raw) if raw.is_empty() => Err(Error::Parse),
            Ok(raw) => Ok(raw),
            Err(Error::Remote) => {
                debug!(code = ?remote.code, message = %remote.message, "configuration read rejected");
                Err(remote.code.as_error())
            }
            Err(err) => Err(err),
        }
    }

    /// Merges `value_to_merge` into this component's configuration at
    /// `key_path`. `timestamp` defaults to now.
    pub fn update_config(
        &self,
        key_path: &[&str],
        timestamp: Option<SystemTime>,
        value_to_merge: &Value<'_>,
    ) -> Result<()> {
        let keys = key_path_values(key_path)?;
        let seconds = timestamp
            .unwrap_or_else(SystemTime::now)
            .duration_since(UNIX_EPOCH)
            .map_err(|_| Error::Invalid)?
            .as_secs_f64();

        let params = vec![
            Kv::new(b"keyPath", Value::List(keys)),
            Kv::new(b"timestamp", Value::F64(seconds)),
            Kv::new(b"valueToMerge", value_to_merge.clone()),
        ];

        let mut remote = RemoteError::default();
        match self.call_no_reply(
            UPDATE_CONFIGURATION,
            UPDATE_CONFIGURATION_MODEL,
            &params,
            Some(&mut remote),
        ) {
            Err(Error::Remote) => {
                debug!(code = ?remote.code, message = %remote.message, "configuration update rejected");
                Err(remote.code.as_error())
            }
            other => other,
        }
    }

    /// Subscribes to configuration changes under `key_path`. The callback
    /// receives `(component_name, changed_key_path, handle)`.
    pub fn subscribe_to_configuration_update(
        &self,
        component_name: Option<&str>,
        key_path: &[&str],
        callback: impl FnMut(&[u8], &[&[u8]], SubscriptionHandle) + Send + 'static,
    ) -> Result<SubscriptionHandle> {
        let keys = key_path_values(key_path)?;
        let mut params = vec![Kv::new(b"keyPath", Value::List(keys))];
        if let Some(name) = component_name {
            params.push(Kv::new(b"componentName", Value::Buf(name.as_bytes())));
        }

        self.open_subscription(
            SUBSCRIBE_TO_CONFIGURATION_UPDATE,
            SUBSCRIBE_TO_CONFIGURATION_UPDATE_MODEL,
            &params,
            Box::new(ConfigurationUpdateEvents { callback }),
            None,
        )
    }
}

struct ConfigurationUpdateEvents<F> {
    callback: F,
}

impl<F> StreamEvents for ConfigurationUpdateEvents<F>
where
    F: FnMut(&[u8], &[&[u8]], SubscriptionHandle) + Send,
{
    fn on_event(&mut self, payload: &[u8], handle: SubscriptionHandle) -> Result<()> {
        let mut owned = payload.to_vec();
        let value = json::decode_destructive(&mut owned)?;
        let pairs = value.as_map().ok_or(Error::Parse)?;
        let event = map_get(pairs, b"configurationUpdateEvent")
            .and_then(|v| v.as_map())
            .ok_or(Error::Parse)?;

        let component =
            map_get(event, b"componentName").and_then(|v| v.as_buf()).ok_or(Error::Parse)?;
        let key_list = map_get(event, b"keyPath").and_then(|v| v.as_list()).ok_or(Error::Parse)?;
        let key_path: Vec<&[u8]> = key_list
            .iter()
            .map(|item| item.as_buf().ok_or(Error::Parse))
            .collect::<Result<_>>()?;

        (self.callback)(component, &key_path, handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(value: Value<'static>) -> Value<'static> {
        Value::Map(vec![
            Kv::new(b"value", value),
            Kv::new(b"componentName", Value::Buf(b"MyComponent")),
        ])
    }

    #[test]
    fn unwrap_fires_for_matching_final_key() {
        let reply = resp(Value::Map(vec![Kv::new(b"key", Value::Buf(b"Hello World!"))]));
        let selected = select_config_value(&reply, &["config", "key"]).unwrap();
        assert_eq!(selected, &Value::Buf(b"Hello World!"));
    }

    #[test]
    fn unwrap_skipped_for_empty_path() {
        let inner = Value::Map(vec![Kv::new(b"key", Value::Buf(b"Hello World!"))]);
        let reply = resp(inner.clone());
        let selected = select_config_value(&reply, &[]).unwrap();
        assert_eq!(selected, &inner);
    }

    #[test]
    fn unwrap_skipped_when_key_differs() {
        let inner = Value::Map(vec![Kv::new(b"other", Value::Buf(b"x"))]);
        let reply = resp(inner.clone());
        let selected = select_config_value(&reply, &["config", "key"]).unwrap();
        assert_eq!(selected, &inner);
    }

    #[test]
    fn unwrap_skipped_when_map_has_multiple_entries() {
        let inner = Value::Map(vec![
            Kv::new(b"key", Value::Buf(b"x")),
            Kv::new(b"more", Value::Buf(b"y")),
        ]);
        let reply = resp(inner.clone());
        let selected = select_config_value(&reply, &["key"]).unwrap();
        assert_eq!(selected, &inner);
    }

    #[test]
    fn unwrap_skipped_when_inner_value_is_map() {
        let inner = Value::Map(vec![Kv::new(
            b"key",
            Value::Map(vec![Kv::new(b"nested", Value::I64(1))]),
        )]);
        let reply = resp(inner.clone());
        let selected = select_config_value(&reply, &["key"]).unwrap();
        assert_eq!(selected, &inner);
    }

    #[test]
    fn missing_value_field_is_invalid() {
        let reply = Value::Map(vec![Kv::new(b"componentName", Value::Buf(b"c"))]);
        assert_eq!(select_config_value(&reply, &[]).unwrap_err(), Error::Invalid);

        let reply = resp(Value::Buf(b"not a map"));
        assert_eq!(select_config_value(&reply, &[]).unwrap_err(), Error::Invalid);
    }

    #[test]
    fn deep_key_paths_rejected() {
        let too_deep: Vec<&str> = (0..=MAX_OBJECT_DEPTH).map(|_| "k").collect();
        assert_eq!(key_path_values(&too_deep).unwrap_err(), Error::NoMem);
    }
}
