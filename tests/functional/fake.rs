//! In-memory fakes for the platform and etcd membership seams.
//!
//! `FakePlatform` stores child objects, the cluster status and finalizers.
//! `FakeEtcd` holds a member list. Both append every write they receive to a
//! shared call log so tests can assert on the order of side effects.
//!
//! Pods are derived from the StatefulSet replica count: ordinals below the
//! replica count have a pod with an IP, and a pod is Ready once its etcd
//! member has started. `World::advance` simulates the time between passes.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;

use etcd_operator::client::{
    MemberInfo, MembershipClient, MembershipClients, MembershipConnector, MembershipError,
};
use etcd_operator::config::OperatorConfig;
use etcd_operator::controller::cluster_reconciler::reconcile;
use etcd_operator::controller::common::cluster_key;
use etcd_operator::controller::context::Context;
use etcd_operator::controller::error::{Error, Result};
use etcd_operator::controller::platform::{ChildKind, ChildObject, PlatformApi};
use etcd_operator::controller::resource_reconciler::statefulset_replicas;
use etcd_operator::crd::{ClusterPhase, EtcdCluster, EtcdClusterStatus};
use etcd_operator::health::HealthState;
use etcd_operator::resources::common::{member_name, peer_url};

/// A side effect observed by the fakes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    CreateChild(ChildKind),
    ReplaceChild(ChildKind),
    PatchReplicas(i32),
    PatchStatus(ClusterPhase),
    AddFinalizer,
    RemoveFinalizer,
    DeletePvcs,
    AddMember(String),
    RemoveMember(u64),
}

impl Call {
    pub fn is_membership_change(&self) -> bool {
        matches!(self, Call::AddMember(_) | Call::RemoveMember(_))
    }
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

/// An event published on the cluster.
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub warning: bool,
    pub reason: String,
    pub note: Option<String>,
}

// ============================================================================
// Platform
// ============================================================================

#[derive(Default)]
struct PlatformState {
    children: BTreeMap<(String, String), ChildObject>,
    status: Option<EtcdClusterStatus>,
    finalizers: Vec<String>,
    events: Vec<RecordedEvent>,
    next_version: u64,
}

/// `PlatformApi` over in-memory state.
pub struct FakePlatform {
    state: Mutex<PlatformState>,
    etcd: Arc<FakeEtcd>,
    log: CallLog,
    /// Kinds whose create or replace fails with a 422.
    pub rejected_kinds: Mutex<HashSet<ChildKind>>,
    /// API error returned by the next status write instead of applying it.
    status_patch_failure: Mutex<Option<(u16, String)>>,
}

fn key(kind: ChildKind, name: &str) -> (String, String) {
    (kind.as_str().to_string(), name.to_string())
}

fn with_resource_version(object: &ChildObject, version: u64) -> ChildObject {
    object.clone().with_resource_version(Some(version.to_string()))
}

fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(
        kube::core::Status::failure(&format!("fake {reason}"), reason)
            .with_code(code)
            .boxed(),
    ))
}

impl FakePlatform {
    pub fn new(etcd: Arc<FakeEtcd>, log: CallLog) -> Self {
        Self {
            state: Mutex::new(PlatformState::default()),
            etcd,
            log,
            rejected_kinds: Mutex::new(HashSet::new()),
            status_patch_failure: Mutex::new(None),
        }
    }

    /// Fail the next status write with `code`, as when the resourceVersion
    /// it was read at is stale.
    pub fn fail_next_status_patch(&self, code: u16, reason: &str) {
        *self.status_patch_failure.lock().unwrap() = Some((code, reason.to_string()));
    }

    fn record(&self, call: Call) {
        self.log.lock().unwrap().push(call);
    }

    /// Replica count of the stored StatefulSet, 0 when it does not exist.
    pub fn replicas(&self) -> i32 {
        let state = self.state.lock().unwrap();
        state
            .children
            .values()
            .find_map(statefulset_replicas)
            .unwrap_or(0)
    }

    pub fn child(&self, kind: ChildKind, name: &str) -> Option<ChildObject> {
        self.state.lock().unwrap().children.get(&key(kind, name)).cloned()
    }

    pub fn child_count(&self) -> usize {
        self.state.lock().unwrap().children.len()
    }

    pub fn status(&self) -> Option<EtcdClusterStatus> {
        self.state.lock().unwrap().status.clone()
    }

    pub fn finalizers(&self) -> Vec<String> {
        self.state.lock().unwrap().finalizers.clone()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().unwrap().events.clone()
    }

    fn pod(cluster: &EtcdCluster, ordinal: i32, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(member_name(cluster, ordinal)),
                namespace: cluster.namespace(),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: Some(format!("10.0.0.{}", ordinal + 10)),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Pods as the API server would list them for `cluster`.
    pub fn pods_for(&self, cluster: &EtcdCluster) -> Vec<Pod> {
        (0..self.replicas())
            .map(|ordinal| Self::pod(cluster, ordinal, self.etcd.has_started(cluster, ordinal)))
            .collect()
    }

    fn check_rejected(&self, kind: ChildKind) -> Result<()> {
        if self.rejected_kinds.lock().unwrap().contains(&kind) {
            return Err(api_error(422, "Invalid"));
        }
        Ok(())
    }
}

/// The fake needs the cluster to derive pods, so it is handed one per pass.
pub struct PassPlatform {
    inner: Arc<FakePlatform>,
    cluster: EtcdCluster,
}

#[async_trait]
impl PlatformApi for PassPlatform {
    async fn get_child(
        &self,
        _namespace: &str,
        kind: ChildKind,
        name: &str,
    ) -> Result<Option<ChildObject>> {
        Ok(self.inner.child(kind, name))
    }

    async fn create_child(&self, _namespace: &str, object: &ChildObject) -> Result<ChildObject> {
        self.inner.check_rejected(object.kind())?;
        let mut state = self.inner.state.lock().unwrap();
        let k = key(object.kind(), &object.name());
        if state.children.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists"));
        }
        state.next_version += 1;
        let stored = with_resource_version(object, state.next_version);
        state.children.insert(k, stored.clone());
        drop(state);
        self.inner.record(Call::CreateChild(object.kind()));
        Ok(stored)
    }

    async fn replace_child(&self, _namespace: &str, object: &ChildObject) -> Result<ChildObject> {
        self.inner.check_rejected(object.kind())?;
        let mut state = self.inner.state.lock().unwrap();
        let k = key(object.kind(), &object.name());
        let current = state
            .children
            .get(&k)
            .and_then(ChildObject::resource_version);
        if current != object.resource_version() {
            return Err(api_error(409, "Conflict"));
        }
        state.next_version += 1;
        let stored = with_resource_version(object, state.next_version);
        state.children.insert(k, stored.clone());
        drop(state);
        self.inner.record(Call::ReplaceChild(object.kind()));
        Ok(stored)
    }

    async fn patch_statefulset_replicas(
        &self,
        _namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        let Some(ChildObject::StatefulSet(sts)) =
            state.children.get_mut(&key(ChildKind::StatefulSet, name))
        else {
            return Err(api_error(404, "NotFound"));
        };
        if let Some(spec) = sts.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
        drop(state);
        self.inner.record(Call::PatchReplicas(replicas));
        Ok(())
    }

    async fn list_pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<Pod>> {
        Ok(self.inner.pods_for(&self.cluster))
    }

    async fn patch_status(&self, _cluster: &EtcdCluster, status: &EtcdClusterStatus) -> Result<()> {
        if let Some((code, reason)) = self.inner.status_patch_failure.lock().unwrap().take() {
            return Err(api_error(code, &reason));
        }
        self.inner.state.lock().unwrap().status = Some(status.clone());
        self.inner.record(Call::PatchStatus(status.phase));
        Ok(())
    }

    async fn add_finalizer(&self, _cluster: &EtcdCluster, finalizer: &str) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if !state.finalizers.iter().any(|f| f == finalizer) {
            state.finalizers.push(finalizer.to_string());
        }
        drop(state);
        self.inner.record(Call::AddFinalizer);
        Ok(())
    }

    async fn remove_finalizer(&self, _cluster: &EtcdCluster, finalizer: &str) -> Result<()> {
        self.inner
            .state
            .lock()
            .unwrap()
            .finalizers
            .retain(|f| f != finalizer);
        self.inner.record(Call::RemoveFinalizer);
        Ok(())
    }

    async fn delete_pvcs(&self, _namespace: &str, _selector: &str) -> Result<usize> {
        self.inner.record(Call::DeletePvcs);
        Ok(usize::try_from(self.inner.replicas()).unwrap_or(0))
    }

    async fn publish_event(
        &self,
        _cluster: &EtcdCluster,
        event_type: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.inner.state.lock().unwrap().events.push(RecordedEvent {
            warning: matches!(event_type, EventType::Warning),
            reason: reason.to_string(),
            note,
        });
    }
}

// ============================================================================
// etcd
// ============================================================================

#[derive(Default)]
struct EtcdState {
    members: Vec<MemberInfo>,
    next_id: u64,
    unhealthy: HashSet<String>,
    /// Members whose process never comes up.
    stuck: HashSet<u64>,
    unreachable: bool,
}

/// In-memory etcd member list.
pub struct FakeEtcd {
    state: Mutex<EtcdState>,
    log: CallLog,
}

impl FakeEtcd {
    pub fn new(log: CallLog) -> Self {
        Self {
            state: Mutex::new(EtcdState {
                next_id: 0x1000,
                ..Default::default()
            }),
            log,
        }
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.state.lock().unwrap().members.clone()
    }

    /// Whether the member for `ordinal` is in the list and has started.
    pub fn has_started(&self, cluster: &EtcdCluster, ordinal: i32) -> bool {
        let name = member_name(cluster, ordinal);
        let peer = peer_url(cluster, ordinal);
        self.state
            .lock()
            .unwrap()
            .members
            .iter()
            .any(|m| m.name == name && m.has_peer_url(&peer))
    }

    /// Insert a member directly, bypassing the call log. An unstarted
    /// member never starts.
    pub fn seed(&self, cluster: &EtcdCluster, ordinal: i32, started: bool) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        if !started {
            state.stuck.insert(id);
        }
        state.members.push(MemberInfo {
            id,
            name: if started {
                member_name(cluster, ordinal)
            } else {
                String::new()
            },
            peer_urls: vec![peer_url(cluster, ordinal)],
            client_urls: Vec::new(),
        });
        id
    }

    /// Start every added member whose pod exists.
    pub fn start_members(&self, cluster: &EtcdCluster, replicas: i32) {
        let mut state = self.state.lock().unwrap();
        let EtcdState { members, stuck, .. } = &mut *state;
        for ordinal in 0..replicas {
            let peer = peer_url(cluster, ordinal);
            for member in members.iter_mut() {
                if member.is_unstarted()
                    && member.has_peer_url(&peer)
                    && !stuck.contains(&member.id)
                {
                    member.name = member_name(cluster, ordinal);
                }
            }
        }
    }

    pub fn set_unhealthy(&self, endpoint: impl Into<String>) {
        self.state.lock().unwrap().unhealthy.insert(endpoint.into());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    fn check_reachable(&self) -> std::result::Result<(), MembershipError> {
        if self.state.lock().unwrap().unreachable {
            return Err(MembershipError::Connection("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MembershipClient for FakeEtcd {
    async fn list_members(&self) -> std::result::Result<Vec<MemberInfo>, MembershipError> {
        self.check_reachable()?;
        Ok(self.members())
    }

    async fn add_member(&self, peer_url: &str) -> std::result::Result<MemberInfo, MembershipError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let member = MemberInfo {
            id: state.next_id,
            name: String::new(),
            peer_urls: vec![peer_url.to_string()],
            client_urls: Vec::new(),
        };
        state.members.push(member.clone());
        drop(state);
        self.log
            .lock()
            .unwrap()
            .push(Call::AddMember(peer_url.to_string()));
        Ok(member)
    }

    async fn remove_member(&self, id: u64) -> std::result::Result<(), MembershipError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        let before = state.members.len();
        state.members.retain(|m| m.id != id);
        if state.members.len() == before {
            return Err(MembershipError::MemberNotFound(id));
        }
        drop(state);
        self.log.lock().unwrap().push(Call::RemoveMember(id));
        Ok(())
    }

    async fn health_check(&self, endpoint: &str) -> bool {
        let state = self.state.lock().unwrap();
        !state.unreachable && !state.unhealthy.contains(endpoint)
    }
}

/// Connector handing out the shared fake.
pub struct FakeConnector {
    etcd: Arc<FakeEtcd>,
}

#[async_trait]
impl MembershipConnector for FakeConnector {
    async fn connect(
        &self,
        _endpoints: &[String],
    ) -> std::result::Result<Arc<dyn MembershipClient>, MembershipError> {
        self.etcd.check_reachable()?;
        Ok(self.etcd.clone())
    }
}

// ============================================================================
// World
// ============================================================================

/// A cluster object plus the fakes it is reconciled against.
pub struct World {
    pub cluster: EtcdCluster,
    pub platform: Arc<FakePlatform>,
    pub etcd: Arc<FakeEtcd>,
    pub log: CallLog,
    pub health: Arc<HealthState>,
    membership: Arc<MembershipClients>,
}

impl World {
    pub fn new(cluster: EtcdCluster) -> Self {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let etcd = Arc::new(FakeEtcd::new(log.clone()));
        let platform = Arc::new(FakePlatform::new(etcd.clone(), log.clone()));
        let membership = Arc::new(MembershipClients::new(Arc::new(FakeConnector {
            etcd: etcd.clone(),
        })));
        Self {
            cluster,
            platform,
            etcd,
            log,
            health: Arc::new(HealthState::new()),
            membership,
        }
    }

    fn context(&self) -> Arc<Context> {
        Arc::new(Context::new(
            Arc::new(PassPlatform {
                inner: self.platform.clone(),
                cluster: self.cluster.clone(),
            }),
            self.membership.clone(),
            OperatorConfig::default(),
            Some(self.health.clone()),
        ))
    }

    /// Run one reconcile pass and fold the written status and finalizers
    /// back into the cluster object.
    pub async fn reconcile(&mut self) -> Result<Action> {
        let result = reconcile(Arc::new(self.cluster.clone()), self.context()).await;
        self.cluster.status = self.platform.status();
        let finalizers = self.platform.finalizers();
        self.cluster.metadata.finalizers = (!finalizers.is_empty()).then_some(finalizers);
        result
    }

    /// Simulate the time between passes: the seed member bootstraps once its
    /// pod exists and added members start.
    pub fn advance(&self) {
        let replicas = self.platform.replicas();
        if replicas > 0 && self.etcd.members().is_empty() {
            self.etcd.seed(&self.cluster, 0, true);
        }
        self.etcd.start_members(&self.cluster, replicas);
    }

    /// Drop pooled etcd clients, as an operator restart does.
    pub async fn restart_operator(&self) {
        self.membership.release(&cluster_key(&self.cluster)).await;
    }

    /// Reconcile then advance, `passes` times.
    pub async fn run(&mut self, passes: usize) {
        for _ in 0..passes {
            self.reconcile().await.unwrap();
            self.advance();
        }
    }

    /// Reconcile until `phase` is reached. Returns the number of passes.
    pub async fn run_until(&mut self, phase: ClusterPhase, max_passes: usize) -> usize {
        for pass in 1..=max_passes {
            self.reconcile().await.unwrap();
            self.advance();
            if self.phase() == phase {
                return pass;
            }
        }
        panic!(
            "cluster did not reach {phase} within {max_passes} passes, stuck in {}",
            self.phase()
        );
    }

    pub fn phase(&self) -> ClusterPhase {
        self.cluster
            .status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    pub fn status(&self) -> EtcdClusterStatus {
        self.cluster.status.clone().unwrap_or_default()
    }

    /// Change the desired member count the way an edit would.
    pub fn set_members(&mut self, members: i32) {
        self.cluster.spec.members = members;
        self.cluster.metadata.generation = Some(self.cluster.metadata.generation.unwrap_or(1) + 1);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.log.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// Calls recorded after the first `from` entries.
    pub fn calls_since(&self, from: usize) -> Vec<Call> {
        self.log.lock().unwrap().get(from..).unwrap_or_default().to_vec()
    }
}
