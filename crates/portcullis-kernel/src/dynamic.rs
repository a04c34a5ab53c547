//! Canonical dynamic configuration exchanged with configuration providers.
//!
//! Router, service and middleware bodies are kept as raw JSON values; this
//! layer only needs to route them, not interpret them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named configuration elements of one kind.
pub type Elements = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfiguration {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: Elements,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: Elements,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub middlewares: Elements,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub servers_transports: Elements,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpConfiguration {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: Elements,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: Elements,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub middlewares: Elements,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub servers_transports: Elements,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UdpConfiguration {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: Elements,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: Elements,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsConfiguration {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub certificates: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: Elements,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stores: Elements,
}

/// A configuration snapshot tagged with the provider that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigMessage {
    pub provider_name: String,
    pub configuration: Configuration,
}
