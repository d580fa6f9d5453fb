//! Groups sandbox pods by ingress key.
//!
//! The index is owned by a single watch task, the only writer, while request handlers hold
//! short read locks to look up a session's pods.

use crate::pod::PodRecord;
use ahash::AHashMap as HashMap;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, instrument, trace};

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Debug)]
pub struct Index {
    /// The pod label whose value is the session's ingress key.
    label_key: String,

    /// Pods by ingress key, then by pod name.
    by_key: HashMap<String, HashMap<String, PodRecord>>,

    /// The ingress key under which each pod is currently indexed, used to handle deletions and
    /// relabeling.
    key_by_pod: HashMap<String, String>,
}

// === impl Index ===

impl Index {
    pub fn new(label_key: impl ToString) -> Self {
        Self {
            label_key: label_key.to_string(),
            by_key: HashMap::default(),
            key_by_pod: HashMap::default(),
        }
    }

    pub fn shared(label_key: impl ToString) -> SharedIndex {
        Arc::new(RwLock::new(Self::new(label_key)))
    }

    /// Returns all pods for `ingress_key` that are running and have an IP, in no particular
    /// order.
    pub fn get_eligible(&self, ingress_key: &str) -> Vec<&PodRecord> {
        self.by_key
            .get(ingress_key)
            .into_iter()
            .flat_map(|pods| pods.values())
            .filter(|pod| pod.is_eligible())
            .collect()
    }

    /// Returns the number of indexed pods, eligible or not.
    pub fn len(&self) -> usize {
        self.key_by_pod.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_by_pod.is_empty()
    }

    /// Inserts or replaces a pod's record.
    ///
    /// A pod that no longer carries the ingress label is removed.
    pub fn upsert(&mut self, record: PodRecord) {
        let key = match record.labels.get(&self.label_key) {
            Some(key) if !key.is_empty() => key.clone(),
            _ => {
                trace!(pod = %record.name, "no ingress key");
                self.remove(&record.name);
                return;
            }
        };

        if let Some(prior) = self.key_by_pod.get(&record.name) {
            if *prior != key {
                debug!(pod = %record.name, from = %prior, to = %key, "ingress key changed");
                self.remove(&record.name);
            }
        }

        debug!(
            pod = %record.name,
            %key,
            ip = %record.ip,
            phase = ?record.phase,
            "indexed"
        );
        self.key_by_pod.insert(record.name.clone(), key.clone());
        self.by_key
            .entry(key)
            .or_default()
            .insert(record.name.clone(), record);
    }

    /// Drops a pod from the index. Returns the removed record, if the pod was indexed.
    pub fn remove(&mut self, pod: &str) -> Option<PodRecord> {
        let key = self.key_by_pod.remove(pod)?;
        let pods = self.by_key.get_mut(&key)?;
        let removed = pods.remove(pod);
        if pods.is_empty() {
            self.by_key.remove(&key);
        }
        debug!(%pod, %key, "removed");
        removed
    }
}

impl kubert::index::IndexNamespacedResource<Pod> for Index {
    #[instrument(skip_all, fields(ns = ?pod.metadata.namespace, name = %pod.name_unchecked()))]
    fn apply(&mut self, pod: Pod) {
        self.upsert(PodRecord::from(pod));
    }

    #[instrument(skip(self))]
    fn delete(&mut self, namespace: String, name: String) {
        self.remove(&name);
    }
}
