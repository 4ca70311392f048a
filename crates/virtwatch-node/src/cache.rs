//! Read-only local mirrors of cluster objects
//!
//! The controller only ever reads from its caches; every mutation goes
//! through the remote API. Caches may lag behind the API server, which is why
//! the decisive VM and pod enumeration in a cycle uses fresh list calls.

use std::hash::Hash;
use std::sync::Arc;

use kube::runtime::reflector::{ObjectRef, Store};
use kube::Resource;

/// Point-in-time lookup into a local mirror of `K` objects
pub trait ObjectCache<K>: Send + Sync {
    /// Look up an object by name (and namespace for namespaced kinds)
    fn lookup(&self, name: &str, namespace: Option<&str>) -> Option<Arc<K>>;
}

impl<K> ObjectCache<K> for Store<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    fn lookup(&self, name: &str, namespace: Option<&str>) -> Option<Arc<K>> {
        let key = match namespace {
            Some(ns) => ObjectRef::new(name).within(ns),
            None => ObjectRef::new(name),
        };
        self.get(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{healthy_node, running_vm, store_with};
    use k8s_openapi::api::core::v1::Node;
    use kube::runtime::watcher;
    use virtwatch_common::crd::VirtualMachine;

    #[test]
    fn cluster_scoped_lookup() {
        let (store, _writer) = store_with(vec![healthy_node("node01")]);
        let cache: &dyn ObjectCache<Node> = &store;

        assert!(cache.lookup("node01", None).is_some());
        assert!(cache.lookup("node02", None).is_none());
    }

    #[test]
    fn namespaced_lookup_requires_matching_namespace() {
        let node = healthy_node("node01");
        let (store, _writer) = store_with(vec![running_vm("vm1", &node)]);
        let cache: &dyn ObjectCache<VirtualMachine> = &store;

        assert!(cache.lookup("vm1", Some("default")).is_some());
        assert!(cache.lookup("vm1", Some("other")).is_none());
    }

    #[test]
    fn deleted_objects_disappear() {
        let node = healthy_node("node01");
        let (store, mut writer) = store_with(vec![node.clone()]);
        writer.apply_watcher_event(&watcher::Event::Delete(node));

        assert!(store.lookup("node01", None).is_none());
    }
}
