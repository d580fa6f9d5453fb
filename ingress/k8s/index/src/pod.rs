use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// The parts of a pod that matter for routing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRecord {
    pub name: String,
    pub namespace: String,
    pub ip: String,
    pub phase: PodPhase,
    pub labels: BTreeMap<String, String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

// === impl PodRecord ===

impl PodRecord {
    /// A pod may receive traffic only once it is running and has been assigned an IP.
    pub fn is_eligible(&self) -> bool {
        self.phase == PodPhase::Running && !self.ip.is_empty()
    }
}

impl From<Pod> for PodRecord {
    fn from(pod: Pod) -> Self {
        let name = pod.name_unchecked();
        let namespace = pod.namespace().unwrap_or_default();
        let labels = pod.metadata.labels.unwrap_or_default();
        let (ip, phase) = pod
            .status
            .map(|status| {
                let phase = status.phase.as_deref().map(PodPhase::from).unwrap_or_default();
                (status.pod_ip.unwrap_or_default(), phase)
            })
            .unwrap_or_default();
        Self {
            name,
            namespace,
            ip,
            phase,
            labels,
        }
    }
}

// === impl PodPhase ===

impl From<&str> for PodPhase {
    fn from(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}
