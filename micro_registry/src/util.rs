//! Merging of service lists by (name, version).

use crate::{Node, Service};

fn same(a: &Service, b: &Service) -> bool {
    a.name == b.name && a.version == b.version
}

/// Nodes of `old` updated with `new`; a node id present in both takes the
/// `new` record. Every id appears once.
pub fn merge_nodes(old: &[Node], new: &[Node]) -> Vec<Node> {
    let mut nodes: Vec<Node> = Vec::with_capacity(old.len() + new.len());
    for node in old.iter().chain(new.iter()) {
        match nodes.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => *existing = node.clone(),
            None => nodes.push(node.clone()),
        }
    }
    nodes
}

/// Folds `nlist` into `olist`. Services sharing (name, version) have their
/// nodes merged; endpoints and metadata follow the newer record when present.
pub fn merge(olist: &[Service], nlist: &[Service]) -> Vec<Service> {
    let mut services: Vec<Service> = Vec::with_capacity(olist.len() + nlist.len());
    for svc in olist.iter().chain(nlist.iter()) {
        match services.iter_mut().find(|s| same(s, svc)) {
            Some(existing) => {
                existing.nodes = merge_nodes(&existing.nodes, &svc.nodes);
                if !svc.endpoints.is_empty() {
                    existing.endpoints = svc.endpoints.clone();
                }
                if !svc.metadata.is_empty() {
                    existing.metadata = svc.metadata.clone();
                }
            }
            None => {
                let mut svc = svc.clone();
                svc.nodes = merge_nodes(&[], &svc.nodes);
                services.push(svc);
            }
        }
    }
    services
}

/// Removes the nodes of `dlist` from `olist`, discarding services left
/// without nodes. A deletion without a version applies to every version.
pub fn remove(olist: &[Service], dlist: &[Service]) -> Vec<Service> {
    olist
        .iter()
        .filter_map(|svc| {
            let dels: Vec<&Service> = dlist
                .iter()
                .filter(|d| same(d, svc) || (d.name == svc.name && d.version.is_empty()))
                .collect();
            let mut svc = svc.clone();
            for del in dels {
                svc.nodes.retain(|n| !del.nodes.iter().any(|d| d.id == n.id));
            }
            if svc.nodes.is_empty() {
                None
            } else {
                Some(svc)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str, version: &str, ids: &[&str]) -> Service {
        let mut s = Service::new(name, version);
        for id in ids {
            s.nodes.push(Node::new(*id, format!("{}.0.0", version), "127.0.0.1:1"));
        }
        s
    }

    fn ids(s: &Service) -> Vec<&str> {
        s.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn merge_disjoint_is_union() {
        let a = vec![svc("foo", "1", &["a1", "a2"]), svc("bar", "1", &["b1"])];
        let b = vec![svc("foo", "1", &["a3"]), svc("foo", "2", &["c1"])];
        let merged = merge(&a, &b);

        assert_eq!(3, merged.len());
        assert_eq!(vec!["a1", "a2", "a3"], ids(&merged[0]));
        assert_eq!(vec!["b1"], ids(&merged[1]));
        assert_eq!(vec!["c1"], ids(&merged[2]));

        let total: usize = merged.iter().map(|s| s.nodes.len()).sum();
        assert_eq!(6, total);
    }

    #[test]
    fn merge_replaces_same_node() {
        let a = vec![svc("foo", "1", &["a1"])];
        let mut b = vec![svc("foo", "1", &["a1"])];
        b[0].nodes[0].address = "10.0.0.1:9".to_owned();
        let merged = merge(&a, &b);
        assert_eq!(1, merged[0].nodes.len());
        assert_eq!("10.0.0.1:9", merged[0].nodes[0].address);
    }

    #[test]
    fn merge_collapses_duplicates_within_input() {
        let merged = merge(&[], &[svc("foo", "1", &["a1", "a1"])]);
        assert_eq!(vec!["a1"], ids(&merged[0]));
    }

    #[test]
    fn remove_drops_empty_services() {
        let a = vec![svc("foo", "1", &["a1", "a2"]), svc("foo", "2", &["c1"])];
        let left = remove(&a, &[svc("foo", "2", &["c1"]), svc("foo", "1", &["a2"])]);
        assert_eq!(1, left.len());
        assert_eq!(vec!["a1"], ids(&left[0]));
    }

    #[test]
    fn versionless_delete_covers_every_version() {
        let a = vec![
            svc("foo", "1", &["a1", "a2"]),
            svc("foo", "2", &["c1"]),
            svc("bar", "1", &["a1"]),
        ];
        let left = remove(&a, &[svc("foo", "", &["a2", "c1"])]);
        assert_eq!(2, left.len());
        assert_eq!(("foo", vec!["a1"]), (left[0].name.as_str(), ids(&left[0])));
        assert_eq!(("bar", vec!["a1"]), (left[1].name.as_str(), ids(&left[1])));
    }
}
