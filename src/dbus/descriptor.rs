//! Connection descriptor (`a{sa{sv}}`) handed over by NetworkManager

use crate::error::{PluginError, PluginResult};
use crate::provider::{Settings, StartRequest};
use std::collections::HashMap;
use zvariant::{OwnedValue, Value};

/// Setting group -> key -> value, as sent to Connect/ConnectInteractive
pub type ConnectionDescriptor = HashMap<String, HashMap<String, OwnedValue>>;

fn field<'a>(descriptor: &'a ConnectionDescriptor, group: &str, key: &str) -> PluginResult<&'a OwnedValue> {
    descriptor
        .get(group)
        .and_then(|settings| settings.get(key))
        .ok_or_else(|| PluginError::InvalidSettings(format!("Connection is missing '{}.{}'", group, key)))
}

fn string_field(descriptor: &ConnectionDescriptor, group: &str, key: &str) -> PluginResult<String> {
    let value = Value::try_clone(field(descriptor, group, key)?)?;
    Ok(String::try_from(value)?)
}

/// Pull uuid, name and `vpn.data` out of a descriptor
pub fn start_request(descriptor: &ConnectionDescriptor) -> PluginResult<StartRequest> {
    let uuid = string_field(descriptor, "connection", "uuid")?;
    let name = string_field(descriptor, "connection", "id")?;
    let data = Value::try_clone(field(descriptor, "vpn", "data")?)?;
    let data = HashMap::<String, String>::try_from(data)?;

    Ok(StartRequest {
        uuid,
        name,
        settings: Settings::new(data),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn owned(value: Value<'_>) -> OwnedValue {
        OwnedValue::try_from(value).unwrap()
    }

    pub(crate) fn descriptor(uuid: &str, id: &str, data: &[(&str, &str)]) -> ConnectionDescriptor {
        let data: HashMap<String, String> = data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let mut connection = HashMap::new();
        connection.insert("uuid".to_string(), owned(Value::from(uuid)));
        connection.insert("id".to_string(), owned(Value::from(id)));
        connection.insert("type".to_string(), owned(Value::from("vpn")));
        let mut vpn = HashMap::new();
        vpn.insert("data".to_string(), owned(Value::from(data)));
        vpn.insert(
            "service-type".to_string(),
            owned(Value::from("org.freedesktop.NetworkManager.n2n")),
        );

        let mut descriptor = HashMap::new();
        descriptor.insert("connection".to_string(), connection);
        descriptor.insert("vpn".to_string(), vpn);
        descriptor
    }

    #[test]
    fn test_start_request() {
        let request = start_request(&descriptor(
            "9b8e6c4a-1111-4d2e-a3f0-000000000001",
            "Home mesh",
            &[("community", "home"), ("encryption-key", "k")],
        ))
        .unwrap();
        assert_eq!(request.uuid, "9b8e6c4a-1111-4d2e-a3f0-000000000001");
        assert_eq!(request.name, "Home mesh");
        assert_eq!(request.settings.get("community"), Some("home"));
        assert_eq!(request.settings.get("encryption-key"), Some("k"));
    }

    #[test]
    fn test_missing_fields() {
        let mut d = descriptor("u", "n", &[]);
        d.remove("vpn");
        assert!(matches!(
            start_request(&d),
            Err(PluginError::InvalidSettings(msg)) if msg.contains("vpn.data")
        ));
        assert!(start_request(&HashMap::new()).is_err());
    }

    #[test]
    fn test_wrong_types() {
        let mut d = descriptor("u", "n", &[]);
        if let Some(connection) = d.get_mut("connection") {
            connection.insert("uuid".to_string(), owned(Value::from(42u32)));
        }
        assert!(matches!(start_request(&d), Err(PluginError::InvalidSettings(_))));
    }
}
