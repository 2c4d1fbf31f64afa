use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Version;

/// A named, versioned collection of endpoints served by a set of nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    /// The major version, e.g. `"1"`.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Service {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Service {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn major(&self) -> Option<u32> {
        Version::parse_major(&self.version)
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }
}

/// A reachable process instance of a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// Precise semver of the running instance.
    #[serde(default)]
    pub version: String,
    pub address: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        version: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Node {
            id: id.into(),
            version: version.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    /// Whether this node serves a client at `client`. Malformed versions or
    /// bounds never match.
    pub fn accepts(&self, client: &Version) -> bool {
        let exact = match self.version.parse::<Version>() {
            Ok(v) => v,
            Err(_) => return false,
        };
        let bound = |b: &Option<String>| match b {
            Some(s) => s.parse::<Version>().map(Some),
            None => Ok(None),
        };
        match (bound(&self.min), bound(&self.max)) {
            (Ok(min), Ok(max)) => client.within(min, max, exact),
            _ => false,
        }
    }
}

/// A named operation exposed by a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    /// Codec token the endpoint decodes requests with; empty accepts any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request: String,
    /// Codec token the endpoint encodes responses with; empty accepts any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, rename = "primaryKey")]
    pub primary_key: bool,
    #[serde(default)]
    pub internal: bool,
}

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Endpoint {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_codecs(mut self, request: impl Into<String>, response: impl Into<String>) -> Self {
        self.request = request.into();
        self.response = response.into();
        self
    }

    pub fn with_primary_key(mut self, primary_key: bool) -> Self {
        self.primary_key = primary_key;
        self
    }

    pub fn with_internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }
}
