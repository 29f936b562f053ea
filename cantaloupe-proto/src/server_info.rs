use alloc::{string::String, vec::Vec};
use core::num::NonZeroU32;

use serde::Deserialize;

use crate::ServerAddr;

/// The JSON body of the `INFO` command
///
/// Sent by the server immediately after the connection is established
/// and, at protocol level 1, at any later point to update the client's
/// view of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct ServerInfo {
    #[serde(rename = "server_id")]
    pub id: String,
    #[serde(default, rename = "server_name")]
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// The maximum accepted payload size, in bytes
    pub max_payload: NonZeroU32,
    #[serde(rename = "proto")]
    pub protocol_version: u32,
    #[serde(default, rename = "headers")]
    pub supports_headers: bool,
    #[serde(default)]
    pub client_id: Option<u64>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub tls_verify: bool,
    #[serde(default)]
    pub tls_available: bool,
    /// Other cluster members the client may reconnect to
    #[serde(default)]
    pub connect_urls: Vec<ServerAddr>,
    /// The server is shutting down and asks clients to migrate
    #[serde(default, rename = "ldm")]
    pub lame_duck_mode: bool,
    #[serde(default, rename = "jetstream")]
    pub supports_jetstream: bool,
    #[serde(default)]
    pub client_ip: Option<String>,
    /// Random nonce the client must sign when using nkey authentication
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default, rename = "cluster")]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::ServerInfo;

    #[test]
    fn deserialize_minimal() {
        let info = serde_json::from_str::<ServerInfo>(
            r#"{"server_id":"srv1","max_payload":1048576,"proto":1}"#,
        )
        .unwrap();
        assert_eq!(info.id, "srv1");
        assert_eq!(info.max_payload.get(), 1024 * 1024);
        assert_eq!(info.protocol_version, 1);
        assert!(!info.supports_headers);
        assert!(info.connect_urls.is_empty());
    }

    #[test]
    fn deserialize_cluster() {
        let info = serde_json::from_str::<ServerInfo>(
            r#"{
                "server_id":"srv1","server_name":"n1","version":"2.10.17",
                "max_payload":1048576,"proto":1,"headers":true,
                "connect_urls":["nats://10.0.0.2:4222","nats://10.0.0.3:4222"],
                "ldm":true,"jetstream":true
            }"#,
        )
        .unwrap();
        assert!(info.supports_headers);
        assert!(info.lame_duck_mode);
        assert!(info.supports_jetstream);
        assert_eq!(info.connect_urls.len(), 2);
    }
}
