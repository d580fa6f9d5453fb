use super::*;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kubert::index::IndexNamespacedResource;
use opensandbox_ingress_core::{ResolveBackend, RoutingOutcome};

const LABEL: &str = "sandbox.opensandbox.io/ingress-key";

fn mk_pod(name: &str, ip: &str, phase: &str, key: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some("sandboxes".to_string()),
            name: Some(name.to_string()),
            labels: key.map(|key| maplit::btreemap! { LABEL.to_string() => key.to_string() }),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            pod_ip: Some(ip.to_string()).filter(|ip| !ip.is_empty()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn eligible_names(index: &Index, key: &str) -> Vec<String> {
    let mut names = index
        .get_eligible(key)
        .into_iter()
        .map(|p| p.name.clone())
        .collect::<Vec<_>>();
    names.sort();
    names
}

#[test]
fn only_running_pods_with_ips_are_eligible() {
    let mut index = Index::new(LABEL);
    index.apply(mk_pod("running", "10.0.0.1", "Running", Some("s1")));
    index.apply(mk_pod("pending", "", "Pending", Some("s1")));
    index.apply(mk_pod("no-ip", "", "Running", Some("s1")));
    index.apply(mk_pod("failed", "10.0.0.4", "Failed", Some("s1")));
    index.apply(mk_pod("unlabeled", "10.0.0.5", "Running", None));

    assert_eq!(index.len(), 4, "unlabeled pods are not indexed");
    assert_eq!(eligible_names(&index, "s1"), vec!["running"]);
    assert!(index.get_eligible("s2").is_empty());

    let pod = index.get_eligible("s1")[0];
    assert_eq!(pod.phase, PodPhase::Running);
    assert_eq!(pod.namespace, "sandboxes");
    assert_eq!(pod.labels.get(LABEL).map(String::as_str), Some("s1"));
}

#[test]
fn updates_replace_records() {
    let mut index = Index::new(LABEL);
    index.apply(mk_pod("pod-0", "", "Pending", Some("s1")));
    assert!(index.get_eligible("s1").is_empty());

    index.apply(mk_pod("pod-0", "10.0.0.1", "Running", Some("s1")));
    assert_eq!(eligible_names(&index, "s1"), vec!["pod-0"]);
    assert_eq!(index.len(), 1);

    index.apply(mk_pod("pod-0", "10.0.0.1", "Succeeded", Some("s1")));
    assert!(index.get_eligible("s1").is_empty());
}

#[test]
fn relabeling_moves_pods() {
    let mut index = Index::new(LABEL);
    index.apply(mk_pod("pod-0", "10.0.0.1", "Running", Some("s1")));
    index.apply(mk_pod("pod-0", "10.0.0.1", "Running", Some("s2")));
    assert!(index.get_eligible("s1").is_empty());
    assert_eq!(eligible_names(&index, "s2"), vec!["pod-0"]);

    index.apply(mk_pod("pod-0", "10.0.0.1", "Running", None));
    assert!(index.get_eligible("s2").is_empty());
    assert!(index.is_empty());
}

#[test]
fn deletes_remove_pods() {
    let mut index = Index::new(LABEL);
    index.apply(mk_pod("pod-0", "10.0.0.1", "Running", Some("s1")));
    index.apply(mk_pod("pod-1", "10.0.0.2", "Running", Some("s1")));

    index.delete("sandboxes".to_string(), "pod-0".to_string());
    assert_eq!(eligible_names(&index, "s1"), vec!["pod-1"]);

    // Unknown pods are ignored.
    index.delete("sandboxes".to_string(), "pod-9".to_string());
    assert_eq!(index.len(), 1);

    index.delete("sandboxes".to_string(), "pod-1".to_string());
    assert!(index.is_empty());
}

#[test]
fn routes_to_unique_backend() {
    let index = Index::shared(LABEL);
    let router = Router::new(index.clone());

    assert_eq!(router.resolve("s1", "8080"), RoutingOutcome::NotFound);

    index
        .write()
        .apply(mk_pod("pod-0", "10.0.0.1", "Running", Some("s1")));
    assert_eq!(
        router.resolve("s1", "8080"),
        RoutingOutcome::Unique("10.0.0.1:8080".to_string())
    );

    index
        .write()
        .apply(mk_pod("pod-1", "10.0.0.2", "Running", Some("s1")));
    assert_eq!(router.resolve("s1", "8080"), RoutingOutcome::Conflict(2));

    // A non-running claimant does not cause a conflict.
    index
        .write()
        .apply(mk_pod("pod-1", "10.0.0.2", "Failed", Some("s1")));
    assert_eq!(
        router.resolve("s1", "8080"),
        RoutingOutcome::Unique("10.0.0.1:8080".to_string())
    );
}

#[test]
fn brackets_ipv6_backends() {
    let index = Index::shared(LABEL);
    index
        .write()
        .apply(mk_pod("pod-0", "fd00::12", "Running", Some("s1")));
    assert_eq!(
        Router::new(index).resolve("s1", "443"),
        RoutingOutcome::Unique("[fd00::12]:443".to_string())
    );
}

#[tokio::test]
async fn consumes_watch_events() {
    use kube::runtime::watcher::Event;

    let index = Index::shared(LABEL);
    let events = futures::stream::iter(vec![
        Event::Init,
        Event::InitApply(mk_pod("pod-0", "10.0.0.1", "Running", Some("s1"))),
        Event::InitApply(mk_pod("pod-1", "10.0.0.2", "Running", Some("s2"))),
        Event::InitDone,
        Event::Apply(mk_pod("pod-2", "10.0.0.3", "Running", Some("s2"))),
        Event::Delete(mk_pod("pod-1", "10.0.0.2", "Running", Some("s2"))),
    ]);
    kubert::index::namespaced(index.clone(), events).await;

    let router = Router::new(index);
    assert_eq!(
        router.resolve("s1", "80"),
        RoutingOutcome::Unique("10.0.0.1:80".to_string())
    );
    assert_eq!(
        router.resolve("s2", "80"),
        RoutingOutcome::Unique("10.0.0.3:80".to_string())
    );
}

#[tokio::test]
async fn relists_drop_missing_pods() {
    use kube::runtime::watcher::Event;

    let index = Index::shared(LABEL);
    let events = futures::stream::iter(vec![
        Event::Init,
        Event::InitApply(mk_pod("pod-0", "10.0.0.1", "Running", Some("s1"))),
        Event::InitApply(mk_pod("pod-1", "10.0.0.2", "Running", Some("s2"))),
        Event::InitDone,
        // The watch restarts and pod-0 is gone.
        Event::Init,
        Event::InitApply(mk_pod("pod-1", "10.0.0.2", "Running", Some("s2"))),
        Event::InitDone,
    ]);
    kubert::index::namespaced(index.clone(), events).await;

    let router = Router::new(index.clone());
    assert_eq!(router.resolve("s1", "80"), RoutingOutcome::NotFound);
    assert_eq!(
        router.resolve("s2", "80"),
        RoutingOutcome::Unique("10.0.0.2:80".to_string())
    );
    assert_eq!(index.read().len(), 1);
}
