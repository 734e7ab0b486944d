use std::collections::HashMap;

use serde::Deserialize;

/// Envelope of `kubectl get <kind> --output=json` list responses.
#[derive(Debug, Deserialize)]
pub struct GetResource<T> {
    #[serde(rename = "items")]
    pub items: Vec<T>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
/// https://github.com/kubernetes/community/blob/master/contributors/devel/sig-architecture/api-conventions.md#metadata
pub struct ResourceMetadata {
    pub name: String,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub creation_timestamp: Option<time::OffsetDateTime>,

    #[serde(default)]
    pub labels: HashMap<String, String>,
}
