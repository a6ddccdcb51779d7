//! In-Memory Appliance
//!
//! Implements the appliance management API in process: datasets, zvols,
//! snapshots, clones, replication jobs and iSCSI objects, with token
//! authentication and fault injection. Used by the test suite and by the
//! binary's `--simulate` mode.

use super::transport::{ApiRequest, ApiResponse, ApplianceTransport, Authorization, HttpMethod};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::debug;

const GIB: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Configuration & Faults
// =============================================================================

/// Settings for a simulated appliance
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// API key accepted by `auth/generate_token`
    pub api_key: String,
    /// Username/password accepted by `auth/generate_token`
    pub username: String,
    pub password: String,
    /// Filesystem created at start-up (with its pool)
    pub parent: String,
    /// Pool capacity in bytes
    pub capacity_bytes: u64,
    /// Artificial latency added to every request
    pub latency_ms: u64,
    /// Job polls answered with RUNNING before a job finishes
    pub job_polls: u32,
    pub iscsi_basename: String,
    pub portal_ip: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            api_key: "1-simulated-key".to_string(),
            username: "root".to_string(),
            password: "simulated".to_string(),
            parent: "tank/cinder".to_string(),
            capacity_bytes: 100 * GIB,
            latency_ms: 0,
            job_polls: 2,
            iscsi_basename: "iqn.2005-10.org.freenas.ctl".to_string(),
            portal_ip: "0.0.0.0".to_string(),
        }
    }
}

/// Injected failure
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Connection failure before the request is applied
    Transient,
    /// Request is applied, then the response is lost
    TransientAfterApply,
    /// 401 regardless of the presented credentials
    Unauthorized,
    /// Arbitrary status with a `{"message": ...}` body
    Status(u16, String),
}

/// Fault applied to requests matching a method and path fragment
#[derive(Debug, Clone)]
pub struct FaultRule {
    method: HttpMethod,
    path_contains: String,
    fault: Fault,
    remaining: u32,
}

impl FaultRule {
    pub fn new(method: HttpMethod, path_contains: impl Into<String>, fault: Fault) -> Self {
        Self {
            method,
            path_contains: path_contains.into(),
            fault,
            remaining: 1,
        }
    }

    /// Number of matching requests the fault applies to
    pub fn times(mut self, times: u32) -> Self {
        self.remaining = times;
        self
    }

    fn matches(&self, request: &ApiRequest) -> bool {
        self.remaining > 0
            && self.method == request.method
            && request.path.contains(&self.path_contains)
    }
}

// =============================================================================
// State
// =============================================================================

/// Simulated dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDataset {
    pub zvol: bool,
    pub volsize: u64,
    pub refreservation: u64,
    pub origin: Option<String>,
}

impl SimDataset {
    fn filesystem() -> Self {
        Self {
            zvol: false,
            volsize: 0,
            refreservation: 0,
            origin: None,
        }
    }

    fn used(&self) -> u64 {
        self.refreservation
    }
}

#[derive(Debug, Clone)]
struct Transfer {
    source: String,
    target: String,
    snapshot: String,
}

#[derive(Debug, Clone)]
struct SimJob {
    polls_remaining: u32,
    transfer: Transfer,
    state: &'static str,
    error: Option<String>,
}

#[derive(Default)]
struct State {
    datasets: BTreeMap<String, SimDataset>,
    snapshots: BTreeMap<String, u64>,
    jobs: BTreeMap<u64, SimJob>,
    targets: BTreeMap<u64, String>,
    extents: BTreeMap<u64, (String, String)>,
    targetextents: BTreeMap<u64, (u64, u64)>,
    tokens: HashSet<String>,
    next_id: u64,
    auth_count: u64,
    log: Vec<(HttpMethod, String)>,
    faults: Vec<FaultRule>,
    replication_failure: Option<String>,
    capacity_bytes: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn available(&self) -> u64 {
        let used: u64 = self.datasets.values().map(SimDataset::used).sum();
        self.capacity_bytes.saturating_sub(used)
    }

    fn has_dependent_clones(&self, prefix: &str) -> bool {
        self.datasets
            .values()
            .filter_map(|d| d.origin.as_deref())
            .any(|origin| origin.starts_with(prefix))
    }

    fn dataset_json(&self, id: &str, dataset: &SimDataset) -> Value {
        let available = self.available();
        let mut value = json!({
            "id": id,
            "name": id,
            "pool": id.split('/').next().unwrap_or(id),
            "type": if dataset.zvol { "VOLUME" } else { "FILESYSTEM" },
            "used": property(self.used_below(id)),
            "available": property(available),
            "origin": {
                "value": dataset.origin.clone().unwrap_or_default(),
                "rawvalue": dataset.origin.clone().unwrap_or_default(),
            },
        });
        if dataset.zvol {
            value["volsize"] = property(dataset.volsize);
            value["refreservation"] = property(dataset.refreservation);
        }
        value
    }

    fn used_below(&self, id: &str) -> u64 {
        let prefix = format!("{}/", id);
        self.datasets
            .iter()
            .filter(|(name, _)| name.as_str() == id || name.starts_with(&prefix))
            .map(|(_, d)| d.used())
            .sum()
    }
}

fn property(bytes: u64) -> Value {
    json!({
        "value": format!("{}", bytes),
        "rawvalue": bytes.to_string(),
        "parsed": bytes,
    })
}

fn ok(value: Value) -> ApiResponse {
    ApiResponse::json(200, &value)
}

fn rejected(message: impl Into<String>) -> ApiResponse {
    ApiResponse::json(422, &json!({ "null": [{ "message": message.into(), "errno": 22 }] }))
}

fn missing(what: &str) -> ApiResponse {
    ApiResponse::json(404, &json!({ "message": format!("{} does not exist", what) }))
}

fn decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

fn body_str<'a>(body: &'a Value, key: &str) -> &'a str {
    body.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn body_u64(body: &Value, key: &str) -> u64 {
    body.get(key).and_then(Value::as_u64).unwrap_or_default()
}

/// Literal snapshot name from an anchored, escaped `name_regex`
fn literal_from_regex(regex: &str) -> String {
    let trimmed = regex.trim_start_matches('^').trim_end_matches('$');
    let mut literal = String::with_capacity(trimmed.len());
    let mut escaped = false;
    for c in trimmed.chars() {
        if c == '\\' && !escaped {
            escaped = true;
            continue;
        }
        escaped = false;
        literal.push(c);
    }
    literal
}

// =============================================================================
// Simulated Appliance
// =============================================================================

/// In-memory appliance
pub struct InMemoryAppliance {
    config: SimulatorConfig,
    state: Mutex<State>,
}

impl InMemoryAppliance {
    pub fn new(config: SimulatorConfig) -> Self {
        let mut state = State {
            capacity_bytes: config.capacity_bytes,
            ..Default::default()
        };

        let mut path = String::new();
        for component in config.parent.split('/').filter(|c| !c.is_empty()) {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(component);
            state.datasets.insert(path.clone(), SimDataset::filesystem());
        }

        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Register a fault
    pub fn inject(&self, rule: FaultRule) {
        self.state.lock().faults.push(rule);
    }

    /// Invalidate every issued session token
    pub fn expire_sessions(&self) {
        self.state.lock().tokens.clear();
    }

    /// Make subsequent replication jobs fail with the given error
    pub fn fail_replication(&self, message: impl Into<String>) {
        self.state.lock().replication_failure = Some(message.into());
    }

    pub fn set_capacity(&self, bytes: u64) {
        self.state.lock().capacity_bytes = bytes;
    }

    /// Create a zvol outside of the driver, e.g. for manage tests
    pub fn insert_zvol(&self, path: &str, volsize: u64) {
        self.state.lock().datasets.insert(
            path.to_string(),
            SimDataset {
                zvol: true,
                volsize,
                refreservation: 0,
                origin: None,
            },
        );
    }

    pub fn dataset(&self, path: &str) -> Option<SimDataset> {
        self.state.lock().datasets.get(path).cloned()
    }

    pub fn snapshot_exists(&self, path: &str) -> bool {
        self.state.lock().snapshots.contains_key(path)
    }

    /// Number of snapshots whose dataset is `dataset`
    pub fn snapshot_count(&self, dataset: &str) -> usize {
        let prefix = format!("{}@", dataset);
        self.state
            .lock()
            .snapshots
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .count()
    }

    pub fn target_count(&self) -> usize {
        self.state.lock().targets.len()
    }

    pub fn extent_count(&self) -> usize {
        self.state.lock().extents.len()
    }

    pub fn targetextent_count(&self) -> usize {
        self.state.lock().targetextents.len()
    }

    /// Number of successful token exchanges
    pub fn auth_count(&self) -> u64 {
        self.state.lock().auth_count
    }

    /// Requests received with the given method whose path contains `fragment`
    pub fn request_count(&self, method: HttpMethod, fragment: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(m, path)| *m == method && path.contains(fragment))
            .count()
    }

    fn handle(&self, request: &ApiRequest, auth: &Authorization) -> Result<ApiResponse> {
        let mut state = self.state.lock();
        state.log.push((request.method, request.path.clone()));

        let fault = match state.faults.iter_mut().find(|rule| rule.matches(request)) {
            Some(rule) => {
                rule.remaining -= 1;
                Some(rule.fault.clone())
            }
            None => None,
        };

        match fault {
            Some(Fault::Transient) => {
                return Err(Error::TransientNetwork(format!(
                    "connection reset during {} {}",
                    request.method, request.path
                )))
            }
            Some(Fault::Unauthorized) => {
                return Ok(ApiResponse::json(401, &json!({"message": "Not authenticated"})))
            }
            Some(Fault::Status(status, message)) => {
                return Ok(ApiResponse::json(status, &json!({ "message": message })))
            }
            Some(Fault::TransientAfterApply) | None => {}
        }

        let response = if request.path == "auth/generate_token" {
            self.generate_token(&mut state, auth)
        } else {
            match auth {
                Authorization::Token(token) if state.tokens.contains(token) => {
                    route(&mut state, &self.config, request)
                }
                _ => ApiResponse::json(401, &json!({"message": "Not authenticated"})),
            }
        };

        if fault == Some(Fault::TransientAfterApply) {
            return Err(Error::TransientNetwork(format!(
                "response lost for {} {}",
                request.method, request.path
            )));
        }
        Ok(response)
    }

    fn generate_token(&self, state: &mut State, auth: &Authorization) -> ApiResponse {
        let accepted = match auth {
            Authorization::Bearer(key) => *key == self.config.api_key,
            Authorization::Basic { username, password } => {
                *username == self.config.username && *password == self.config.password
            }
            Authorization::Token(token) => state.tokens.contains(token),
        };
        if !accepted {
            return ApiResponse::json(401, &json!({"message": "Invalid credentials"}));
        }

        let id = state.next_id();
        let token = format!("sim-token-{}", id);
        state.tokens.insert(token.clone());
        state.auth_count += 1;
        ok(Value::String(token))
    }
}

#[async_trait]
impl ApplianceTransport for InMemoryAppliance {
    async fn send(&self, request: &ApiRequest, auth: &Authorization) -> Result<ApiResponse> {
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }
        debug!("simulated {} {}", request.method, request.path);
        self.handle(request, auth)
    }
}

// =============================================================================
// Routing
// =============================================================================

fn route(state: &mut State, config: &SimulatorConfig, request: &ApiRequest) -> ApiResponse {
    let body = request.body.clone().unwrap_or(Value::Null);
    let path = request.path.as_str();

    if let Some(id) = path.strip_prefix("pool/dataset/id/") {
        let id = decode(id);
        return match request.method {
            HttpMethod::Get => get_dataset(state, &id),
            HttpMethod::Put => resize_zvol(state, &id, body_u64(&body, "volsize")),
            HttpMethod::Delete => delete_dataset(state, &id, body["recursive"].as_bool().unwrap_or(false)),
            HttpMethod::Post => ApiResponse::new(405, "method not allowed"),
        };
    }
    if let Some(id) = path.strip_prefix("zfs/snapshot/id/") {
        let id = decode(id);
        return match request.method {
            HttpMethod::Get => get_snapshot(state, &id),
            HttpMethod::Delete => delete_snapshot(state, &id),
            _ => ApiResponse::new(405, "method not allowed"),
        };
    }
    if let Some(id) = path.strip_prefix("iscsi/portal/id/") {
        return match id.parse::<u64>() {
            Ok(1) => ok(json!({
                "id": 1,
                "listen": [{ "ip": config.portal_ip, "port": 3260 }],
            })),
            _ => missing("portal"),
        };
    }
    if let Some(id) = path.strip_prefix("iscsi/target/id/") {
        let id = id.parse::<u64>().unwrap_or_default();
        return match state.targets.remove(&id) {
            Some(_) => {
                state.targetextents.retain(|_, (target, _)| *target != id);
                ok(Value::Bool(true))
            }
            None => rejected(format!("Target {} does not exist", id)),
        };
    }
    if let Some(id) = path.strip_prefix("iscsi/extent/id/") {
        let id = id.parse::<u64>().unwrap_or_default();
        return match state.extents.remove(&id) {
            Some(_) => {
                state.targetextents.retain(|_, (_, extent)| *extent != id);
                ok(Value::Bool(true))
            }
            None => rejected(format!("Extent {} does not exist", id)),
        };
    }

    match (request.method, path) {
        (HttpMethod::Post, "pool/dataset") => create_zvol(state, &body),
        (HttpMethod::Post, "zfs/snapshot") => create_snapshot(state, &body),
        (HttpMethod::Post, "zfs/snapshot/clone") => clone_snapshot(state, &body),
        (HttpMethod::Post, "replication/run_onetime") => start_replication(state, config, &body),
        (HttpMethod::Get, "core/get_jobs") => {
            let id = request
                .query
                .iter()
                .find(|(k, _)| k == "id")
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or_default();
            get_job(state, id)
        }
        (HttpMethod::Get, "iscsi/global") => ok(json!({
            "id": 1,
            "basename": config.iscsi_basename,
        })),
        (HttpMethod::Post, "iscsi/target") => create_target(state, &body),
        (HttpMethod::Post, "iscsi/extent") => create_extent(state, &body),
        (HttpMethod::Post, "iscsi/targetextent") => create_targetextent(state, &body),
        _ => ApiResponse::new(404, "Not Found"),
    }
}

fn get_dataset(state: &State, id: &str) -> ApiResponse {
    match state.datasets.get(id) {
        Some(dataset) => ok(state.dataset_json(id, dataset)),
        None => missing(id),
    }
}

fn create_zvol(state: &mut State, body: &Value) -> ApiResponse {
    let name = body_str(body, "name").to_string();
    let volsize = body_u64(body, "volsize");
    let sparse = body["sparse"].as_bool().unwrap_or(false);

    if state.datasets.contains_key(&name) {
        return rejected(format!("Path {} already exists", name));
    }
    let parent = name.rsplit_once('/').map(|(p, _)| p).unwrap_or_default();
    match state.datasets.get(parent) {
        Some(d) if !d.zvol => {}
        _ => return rejected(format!("Parent dataset {} does not exist", parent)),
    }
    if volsize == 0 {
        return rejected("volsize must be greater than zero");
    }
    if !sparse && volsize > state.available() {
        return rejected(format!("Failed to create {}: out of space", name));
    }

    let dataset = SimDataset {
        zvol: true,
        volsize,
        refreservation: if sparse { 0 } else { volsize },
        origin: None,
    };
    let value = state.dataset_json(&name, &dataset);
    state.datasets.insert(name, dataset);
    ok(value)
}

fn resize_zvol(state: &mut State, id: &str, volsize: u64) -> ApiResponse {
    let available = state.available();
    let Some(dataset) = state.datasets.get_mut(id) else {
        return rejected(format!("{} does not exist", id));
    };
    if !dataset.zvol {
        return rejected(format!("{} is not a volume", id));
    }
    if volsize < dataset.volsize {
        return rejected("volsize cannot be reduced");
    }
    if dataset.refreservation > 0 {
        if volsize - dataset.volsize > available {
            return rejected(format!("Failed to resize {}: out of space", id));
        }
        dataset.refreservation = volsize;
    }
    dataset.volsize = volsize;
    let dataset = dataset.clone();
    ok(state.dataset_json(id, &dataset))
}

fn delete_dataset(state: &mut State, id: &str, recursive: bool) -> ApiResponse {
    if !state.datasets.contains_key(id) {
        return rejected(format!("{} does not exist", id));
    }
    let snapshot_prefix = format!("{}@", id);
    if state.has_dependent_clones(&snapshot_prefix) {
        return rejected(format!("cannot destroy '{}': filesystem has dependent clones", id));
    }
    let child_prefix = format!("{}/", id);
    let has_children = state.datasets.keys().any(|k| k.starts_with(&child_prefix))
        || state.snapshots.keys().any(|k| k.starts_with(&snapshot_prefix));
    if has_children && !recursive {
        return rejected(format!("cannot destroy '{}': filesystem has children", id));
    }

    state.datasets.remove(id);
    state.snapshots.retain(|k, _| !k.starts_with(&snapshot_prefix));
    ok(Value::Bool(true))
}

fn snapshot_json(id: &str) -> Value {
    let (dataset, name) = id.split_once('@').unwrap_or((id, ""));
    json!({
        "id": id,
        "name": id,
        "dataset": dataset,
        "snapshot_name": name,
        "pool": dataset.split('/').next().unwrap_or(dataset),
    })
}

fn get_snapshot(state: &State, id: &str) -> ApiResponse {
    if state.snapshots.contains_key(id) {
        ok(snapshot_json(id))
    } else {
        missing(id)
    }
}

fn create_snapshot(state: &mut State, body: &Value) -> ApiResponse {
    let dataset = body_str(body, "dataset");
    let name = body_str(body, "name");
    let id = format!("{}@{}", dataset, name);

    let Some(source) = state.datasets.get(dataset) else {
        return rejected(format!("dataset {} does not exist", dataset));
    };
    if state.snapshots.contains_key(&id) {
        return rejected(format!("snapshot {} already exists", id));
    }
    let size = source.volsize;
    state.snapshots.insert(id.clone(), size);
    ok(snapshot_json(&id))
}

fn delete_snapshot(state: &mut State, id: &str) -> ApiResponse {
    if !state.snapshots.contains_key(id) {
        return rejected(format!("snapshot {} does not exist", id));
    }
    if state.datasets.values().any(|d| d.origin.as_deref() == Some(id)) {
        return rejected(format!("cannot destroy snapshot {}: snapshot has dependent clones", id));
    }
    state.snapshots.remove(id);
    ok(Value::Bool(true))
}

fn clone_snapshot(state: &mut State, body: &Value) -> ApiResponse {
    let snapshot = body_str(body, "snapshot").to_string();
    let target = body_str(body, "dataset_dst").to_string();

    let Some(&volsize) = state.snapshots.get(&snapshot) else {
        return rejected(format!("snapshot {} does not exist", snapshot));
    };
    if state.datasets.contains_key(&target) {
        return rejected(format!("dataset {} already exists", target));
    }
    state.datasets.insert(
        target,
        SimDataset {
            zvol: true,
            volsize,
            refreservation: 0,
            origin: Some(snapshot),
        },
    );
    ok(Value::Bool(true))
}

fn start_replication(state: &mut State, config: &SimulatorConfig, body: &Value) -> ApiResponse {
    let source = body["source_datasets"][0].as_str().unwrap_or_default().to_string();
    let target = body_str(body, "target_dataset").to_string();
    let snapshot = literal_from_regex(body_str(body, "name_regex"));

    if !state.snapshots.contains_key(&format!("{}@{}", source, snapshot)) {
        return rejected(format!("snapshot {}@{} does not exist", source, snapshot));
    }
    if state.datasets.contains_key(&target) {
        return rejected(format!("target dataset {} already exists", target));
    }

    let id = state.next_id();
    state.jobs.insert(
        id,
        SimJob {
            polls_remaining: config.job_polls,
            transfer: Transfer {
                source,
                target,
                snapshot,
            },
            state: "RUNNING",
            error: None,
        },
    );
    ok(json!(id))
}

fn get_job(state: &mut State, id: u64) -> ApiResponse {
    let Some(mut job) = state.jobs.get(&id).cloned() else {
        return ok(json!([]));
    };

    if job.state == "RUNNING" {
        if job.polls_remaining > 0 {
            job.polls_remaining -= 1;
        } else if let Some(message) = state.replication_failure.clone() {
            job.state = "FAILED";
            job.error = Some(message);
        } else {
            let Transfer {
                source,
                target,
                snapshot,
            } = job.transfer.clone();
            let origin = state.datasets.get(&source).cloned();
            match origin {
                Some(source_dataset) => {
                    state.datasets.insert(
                        target.clone(),
                        SimDataset {
                            zvol: true,
                            volsize: source_dataset.volsize,
                            refreservation: source_dataset.refreservation,
                            origin: None,
                        },
                    );
                    state
                        .snapshots
                        .insert(format!("{}@{}", target, snapshot), source_dataset.volsize);
                    job.state = "SUCCESS";
                }
                None => {
                    job.state = "FAILED";
                    job.error = Some(format!("source dataset {} does not exist", source));
                }
            }
        }
    }

    let percent = if job.state == "RUNNING" {
        50.0
    } else {
        100.0
    };
    let value = json!([{
        "id": id,
        "method": "replication.run_onetime",
        "state": job.state,
        "progress": { "percent": percent, "description": "Sending" },
        "error": job.error,
    }]);
    state.jobs.insert(id, job);
    ok(value)
}

fn create_target(state: &mut State, body: &Value) -> ApiResponse {
    let name = body_str(body, "name").to_string();
    if state.targets.values().any(|n| *n == name) {
        return rejected(format!("Target name {} already exists", name));
    }
    let id = state.next_id();
    state.targets.insert(id, name.clone());
    ok(json!({ "id": id, "name": name }))
}

fn create_extent(state: &mut State, body: &Value) -> ApiResponse {
    let name = body_str(body, "name").to_string();
    let disk = body_str(body, "disk").to_string();
    if state.extents.values().any(|(n, _)| *n == name) {
        return rejected(format!("Extent name {} already exists", name));
    }
    let zvol = disk.strip_prefix("zvol/").unwrap_or_default();
    if !state.datasets.get(zvol).map_or(false, |d| d.zvol) {
        return rejected(format!("Disk {} does not exist", disk));
    }
    let id = state.next_id();
    state.extents.insert(id, (name.clone(), disk));
    ok(json!({ "id": id, "name": name }))
}

fn create_targetextent(state: &mut State, body: &Value) -> ApiResponse {
    let target = body_u64(body, "target");
    let extent = body_u64(body, "extent");
    if !state.targets.contains_key(&target) || !state.extents.contains_key(&extent) {
        return rejected("target or extent does not exist");
    }
    let id = state.next_id();
    state.targetextents.insert(id, (target, extent));
    ok(json!({ "id": id, "target": target, "extent": extent, "lunid": 0 }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(appliance: &InMemoryAppliance) -> Authorization {
        let request = ApiRequest::new(HttpMethod::Post, "auth/generate_token");
        let response = appliance
            .handle(&request, &Authorization::Bearer(appliance.config().api_key.clone()))
            .unwrap();
        let value: Value = serde_json::from_str(&response.body).unwrap();
        Authorization::Token(value.as_str().unwrap().to_string())
    }

    #[test]
    fn test_literal_from_regex() {
        assert_eq!(literal_from_regex("^fullcopy-b\\.1$"), "fullcopy-b.1");
        assert_eq!(literal_from_regex("plain"), "plain");
    }

    #[test]
    fn test_requires_token() {
        let appliance = InMemoryAppliance::new(SimulatorConfig::default());
        let request = ApiRequest::new(HttpMethod::Get, "pool/dataset/id/tank");
        let response = appliance
            .handle(&request, &Authorization::Token("forged".into()))
            .unwrap();
        assert_eq!(response.status, 401);

        let auth = token(&appliance);
        let response = appliance.handle(&request, &auth).unwrap();
        assert_eq!(response.status, 200);
    }

    #[test]
    fn test_thick_create_respects_capacity() {
        let appliance = InMemoryAppliance::new(SimulatorConfig {
            capacity_bytes: 5 * GIB,
            ..Default::default()
        });
        let auth = token(&appliance);
        let request = ApiRequest::new(HttpMethod::Post, "pool/dataset").with_body(json!({
            "name": "tank/cinder/volume-a",
            "type": "VOLUME",
            "volsize": 10 * GIB,
            "sparse": false,
        }));
        let response = appliance.handle(&request, &auth).unwrap();
        assert_eq!(response.status, 422);
        assert!(response.body.contains("out of space"));
        assert!(appliance.dataset("tank/cinder/volume-a").is_none());
    }

    #[test]
    fn test_snapshot_with_clone_cannot_be_deleted() {
        let appliance = InMemoryAppliance::new(SimulatorConfig::default());
        appliance.insert_zvol("tank/cinder/volume-a", GIB);
        let auth = token(&appliance);

        let create = ApiRequest::new(HttpMethod::Post, "zfs/snapshot")
            .with_body(json!({"dataset": "tank/cinder/volume-a", "name": "s"}));
        assert_eq!(appliance.handle(&create, &auth).unwrap().status, 200);

        let clone = ApiRequest::new(HttpMethod::Post, "zfs/snapshot/clone").with_body(json!({
            "snapshot": "tank/cinder/volume-a@s",
            "dataset_dst": "tank/cinder/volume-b",
        }));
        assert_eq!(appliance.handle(&clone, &auth).unwrap().status, 200);

        let delete = ApiRequest::new(HttpMethod::Delete, "zfs/snapshot/id/tank%2Fcinder%2Fvolume-a%40s");
        let response = appliance.handle(&delete, &auth).unwrap();
        assert_eq!(response.status, 422);
        assert!(response.body.contains("dependent clones"));
    }

    #[test]
    fn test_fault_rules_are_consumed() {
        let appliance = InMemoryAppliance::new(SimulatorConfig::default());
        let auth = token(&appliance);
        appliance.inject(FaultRule::new(HttpMethod::Get, "pool/dataset", Fault::Transient));

        let request = ApiRequest::new(HttpMethod::Get, "pool/dataset/id/tank");
        assert!(appliance.handle(&request, &auth).is_err());
        assert!(appliance.handle(&request, &auth).is_ok());
        assert_eq!(appliance.request_count(HttpMethod::Get, "pool/dataset/id/"), 2);
    }
}
