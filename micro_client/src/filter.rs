//! Filters narrowing the candidate services of a call.

use std::sync::Arc;

use micro_protocol::{content_type_matches, ContentType, Error, Result, ID_CLIENT_SELECTOR};
use micro_registry::{Endpoint, Service, Version};

use crate::{Filter, Request};

/// Keeps services of the same major version as `version`, and within them the
/// nodes whose bounds admit it.
pub fn version_filter(version: Version) -> Filter {
    Arc::new(move |services| {
        Ok(services
            .into_iter()
            .filter(|s| s.major() == Some(version.major))
            .map(|mut s| {
                s.nodes.retain(|n| n.accepts(&version));
                s
            })
            .collect())
    })
}

/// Keeps the node with id `id` only.
pub fn node_filter(id: impl Into<String>) -> Filter {
    let id = id.into();
    Arc::new(move |services| {
        Ok(services
            .into_iter()
            .map(|mut s| {
                s.nodes.retain(|n| n.id == id);
                s
            })
            .collect())
    })
}

/// What a call requires of the endpoint it targets.
#[derive(Debug, Clone)]
pub struct EndpointCheck {
    pub endpoint: String,
    pub content_type: ContentType,
    pub accept: ContentType,
    pub primary_key: bool,
    pub allow_internal: bool,
}

impl EndpointCheck {
    pub fn for_request(req: &Request, allow_internal: bool) -> Self {
        EndpointCheck {
            endpoint: req.endpoint().to_owned(),
            content_type: req.content_type(),
            accept: req.accept(),
            primary_key: req.primary_key().is_some(),
            allow_internal,
        }
    }

    fn check(&self, service: &Service) -> Result<()> {
        let ep = match service.endpoint(&self.endpoint) {
            Some(ep) => ep,
            None => {
                return Err(Error::not_found(
                    ID_CLIENT_SELECTOR,
                    format!("endpoint {} not found on {}", self.endpoint, service.name),
                ))
            }
        };
        self.check_codecs(ep)?;
        if ep.internal && !self.allow_internal {
            return Err(Error::forbidden(
                ID_CLIENT_SELECTOR,
                format!("endpoint {} is internal", ep.name),
            ));
        }
        if ep.primary_key != self.primary_key {
            let detail = if ep.primary_key {
                format!("endpoint {} requires a primary key", ep.name)
            } else {
                format!("endpoint {} takes no primary key", ep.name)
            };
            return Err(Error::bad_request(ID_CLIENT_SELECTOR, detail));
        }
        Ok(())
    }

    // an endpoint without declared codecs accepts any
    fn check_codecs(&self, ep: &Endpoint) -> Result<()> {
        let mismatch = |declared: &str, negotiated: ContentType| {
            !declared.is_empty() && !content_type_matches(declared, negotiated.as_ref())
        };
        if mismatch(&ep.request, self.content_type) {
            return Err(Error::bad_request(
                ID_CLIENT_SELECTOR,
                format!(
                    "endpoint {} takes {}, request is {}",
                    ep.name, ep.request, self.content_type
                ),
            ));
        }
        if mismatch(&ep.response, self.accept) {
            return Err(Error::bad_request(
                ID_CLIENT_SELECTOR,
                format!(
                    "endpoint {} returns {}, request accepts {}",
                    ep.name, ep.response, self.accept
                ),
            ));
        }
        Ok(())
    }
}

/// Fails the selection when any candidate service exposes the endpoint in a
/// way the call cannot use.
pub fn endpoint_filter(check: EndpointCheck) -> Filter {
    Arc::new(move |services| {
        for service in &services {
            check.check(service)?;
        }
        Ok(services)
    })
}

/// The filter every call starts with: version, then endpoint, then nodes.
pub fn standard_filter(req: &Request, allow_internal: bool, node: Option<&str>) -> Filter {
    let version = req.version().copied();
    let check = EndpointCheck::for_request(req, allow_internal);
    let node = node.map(str::to_owned);
    Arc::new(move |mut services: Vec<Service>| {
        if let Some(version) = version {
            services.retain(|s| s.major() == Some(version.major));
        }
        for service in &services {
            check.check(service)?;
        }
        for service in services.iter_mut() {
            match (&node, version) {
                (Some(id), _) => service.nodes.retain(|n| &n.id == id),
                (None, Some(version)) => service.nodes.retain(|n| n.accepts(&version)),
                (None, None) => {}
            }
        }
        Ok(services)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use micro_protocol::ErrorKind;
    use micro_registry::Node;
    use serde_json::json;

    fn login() -> Endpoint {
        Endpoint::new("Login").with_codecs("application/grpc+json", "application/grpc+json")
    }

    fn services() -> Vec<Service> {
        vec![
            Service::new("auth", "1")
                .with_endpoint(login())
                .with_node(Node::new("v1-a", "1.0.0", "h:1")),
            Service::new("auth", "2")
                .with_endpoint(login())
                .with_node(Node::new("v2-a", "2.0.0", "h:2"))
                .with_node(Node::new("v2-b", "2.3.0", "h:3")),
        ]
    }

    fn node_ids(services: &[Service]) -> Vec<&str> {
        services
            .iter()
            .flat_map(|s| s.nodes.iter().map(|n| n.id.as_str()))
            .collect()
    }

    fn request() -> Request {
        Request::new("auth", "Login", json!({}))
    }

    #[test]
    fn version_constraint_picks_major() {
        let req = request().with_version(Version::new(2, 0).unwrap());
        let out = standard_filter(&req, false, None)(services()).unwrap();
        assert_eq!(vec!["v2-a"], node_ids(&out));

        let out = version_filter(Version::new(2, 3).unwrap())(services()).unwrap();
        assert_eq!(vec!["v2-b"], node_ids(&out));
    }

    #[test]
    fn no_constraint_keeps_everything() {
        let out = standard_filter(&request(), false, None)(services()).unwrap();
        assert_eq!(vec!["v1-a", "v2-a", "v2-b"], node_ids(&out));
    }

    #[test]
    fn pinned_node_wins() {
        let req = request().with_version(Version::new(2, 0).unwrap());
        let out = standard_filter(&req, false, Some("v2-b"))(services()).unwrap();
        assert_eq!(vec!["v2-b"], node_ids(&out));
        let out = node_filter("v1-a")(services()).unwrap();
        assert_eq!(vec!["v1-a"], node_ids(&out));
    }

    #[test]
    fn endpoint_errors_are_distinct() {
        let missing = Request::new("auth", "Logout", json!({}));
        let err = standard_filter(&missing, false, None)(services()).unwrap_err();
        assert_eq!(ErrorKind::NotFound, err.kind());

        let proto = vec![Service::new("auth", "1").with_endpoint(
            Endpoint::new("Login").with_codecs("application/grpc+proto", "application/grpc+proto"),
        )];
        let err = standard_filter(&request(), false, None)(proto).unwrap_err();
        assert_eq!(ErrorKind::BadRequest, err.kind());

        let aliased = vec![Service::new("auth", "1")
            .with_endpoint(Endpoint::new("Login").with_codecs("application/json", ""))];
        assert!(standard_filter(&request(), false, None)(aliased).is_ok());

        let internal = vec![Service::new("auth", "1")
            .with_endpoint(Endpoint::new("Login").with_internal(true))];
        let err = standard_filter(&request(), false, None)(internal.clone()).unwrap_err();
        assert_eq!(ErrorKind::Forbidden, err.kind());
        assert!(standard_filter(&request(), true, None)(internal).is_ok());
    }

    #[test]
    fn primary_key_must_agree() {
        let keyed = vec![Service::new("auth", "1")
            .with_endpoint(Endpoint::new("Login").with_primary_key(true))];
        let err = standard_filter(&request(), false, None)(keyed.clone()).unwrap_err();
        assert_eq!(ErrorKind::BadRequest, err.kind());
        let req = request().with_primary_key("42");
        assert!(standard_filter(&req, false, None)(keyed).is_ok());

        let err = endpoint_filter(EndpointCheck::for_request(&req, false))(services()).unwrap_err();
        assert_eq!(ErrorKind::BadRequest, err.kind());
    }
}
