use crate::namespace::Namespace;
use crate::util::{append_query, join_url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Body of a successful `GET /configs/{appId}/{cluster}/{namespace}` response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfigResponse {
    #[serde(rename = "appId")]
    pub app_id: String,
    pub cluster: String,
    #[serde(rename = "namespaceName")]
    pub namespace_name: String,
    pub configurations: HashMap<String, String>,
    #[serde(rename = "releaseKey")]
    pub release_key: String,
}

/// One element of the notification list sent to, and received from, the
/// long-poll endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationMessage {
    #[serde(rename = "namespaceName")]
    pub namespace_name: String,
    #[serde(rename = "notificationId")]
    pub notification_id: i64,
}

/// Parameters beyond the path identity triple that qualify a config fetch:
/// the last-seen release key (for conditional `304` semantics), and the
/// caller's local IP / data center / last-delivered messages, each
/// optional and omitted from the query entirely when absent.
#[derive(Debug, Clone, Default)]
pub struct ConfigRequestParams<'a> {
    pub release_key: Option<&'a str>,
    pub local_ip: Option<&'a str>,
    pub data_center: Option<&'a str>,
    pub messages_json: Option<&'a str>,
}

/// Builds `GET /configs/{appId}/{cluster}/{namespace}`, optionally
/// constrained with the last known release key so the server can reply
/// `304 Not Modified`, and carrying the caller's IP / data center / last
/// delivered messages for the server's grey-release and diagnostics use.
pub fn config_url(endpoint: &str, namespace: &Namespace, params: &ConfigRequestParams) -> String {
    let path = format!(
        "configs/{}/{}/{}",
        encode_path_segment(&namespace.app_id),
        encode_path_segment(&namespace.cluster),
        encode_path_segment(&namespace.name),
    );
    let url = join_url(endpoint, &path);

    let mut query = Vec::with_capacity(4);
    if let Some(key) = params.release_key.filter(|k| !k.is_empty()) {
        query.push(("releaseKey", key));
    }
    if let Some(ip) = params.local_ip {
        query.push(("ip", ip));
    }
    if let Some(dc) = params.data_center {
        query.push(("dataCenter", dc));
    }
    if let Some(messages) = params.messages_json {
        query.push(("messages", messages));
    }
    append_query(&url, &query)
}

/// Builds `GET /notifications/v2`, carrying the caller's current
/// notification ids as a JSON-encoded query parameter.
pub fn long_poll_url(
    endpoint: &str,
    app_id: &str,
    cluster: &str,
    data_center: Option<&str>,
    local_ip: Option<&str>,
    notifications: &[NotificationMessage],
) -> crate::error::Result<String> {
    let url = join_url(endpoint, "notifications/v2");
    let notifications_json = serde_json::to_string(notifications)?;

    let mut query = vec![("appId", app_id), ("cluster", cluster)];
    if let Some(dc) = data_center {
        query.push(("dataCenter", dc));
    }
    if let Some(ip) = local_ip {
        query.push(("ip", ip));
    }
    query.push(("notifications", &notifications_json));

    Ok(append_query(&url, &query))
}

/// One element of `GET /services/config`, the meta-server endpoint the
/// Service Locator (C1) polls to discover config service instances.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetaServerEntry {
    #[serde(rename = "homepageUrl")]
    pub homepage_url: String,
    #[serde(rename = "instanceId", default)]
    pub instance_id: Option<String>,
}

pub fn meta_server_url(endpoint: &str) -> String {
    join_url(endpoint, "services/config")
}

fn encode_path_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}
