//! Klipper / Moonraker driver.
//!
//! Polls the Moonraker HTTP API. Spool assignments come either from the
//! Spoolman integration (single tool) or from Klipper `save_variables`
//! named `t{N}__spool_id` (multi tool). Values are diffed against the last
//! seen ones so an unchanged printer produces no events.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    CameraConfig, CameraCredentials, Driver, DriverCommand, DriverContext, DriverEvent, DriverHealth, Identifiers,
    SlotRef,
};
use crate::error::{Result, SyncError};
use crate::slots::{AmsUnitState, ManualConflict, SlotState};

const STATE_UNKNOWN: &str = "unknown";
const STATE_UNREACHABLE: &str = "unreachable";
const SPOOLMAN_PREFIX: &str = "spoolman:";
const EVENT_SOURCE: &str = "klipper_poll";
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Prefix `http://` when the host has no scheme and drop trailing slashes.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

/// `t{N}__spool_id` value as a spool id. Empty, zero and garbage mean "no spool".
pub fn parse_spool_id(raw: Option<&Value>) -> Option<i64> {
    let id = match raw? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().trim_matches('"').parse().ok(),
        _ => None,
    }?;
    (id > 0).then_some(id)
}

fn spool_var(tool_index: i64) -> String {
    format!("t{}__spool_id", tool_index)
}

/// Last seen spool id per slot number.
#[derive(Debug, Default)]
pub struct SlotTracker {
    last: BTreeMap<i64, Option<i64>>,
}

impl SlotTracker {
    /// Record an observation. Returns the new value when it differs from
    /// the previous one; a never-seen slot counts as empty.
    pub fn observe(&mut self, slot_no: i64, spool_id: Option<i64>) -> Option<Option<i64>> {
        let previous = self.last.get(&slot_no).copied().flatten();
        self.last.insert(slot_no, spool_id);
        (previous != spool_id).then_some(spool_id)
    }

    /// Changes in the `save_variables` map for tools `0..slots`.
    pub fn diff_variables(&mut self, variables: &Map<String, Value>, slots: i64) -> Vec<(i64, Option<i64>)> {
        (0..slots)
            .filter_map(|tool_index| {
                let slot_no = tool_index + 1;
                let spool_id = parse_spool_id(variables.get(&spool_var(tool_index)));
                self.observe(slot_no, spool_id).map(|change| (slot_no, change))
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.last.clear();
    }
}

/// Print-job fields for health reporting from an objects query `status`.
pub fn print_state_from_status(status: &Value) -> Map<String, Value> {
    let ps = &status["print_stats"];
    let ext = &status["extruder"];
    let bed = &status["heater_bed"];
    let disp = &status["display_status"];

    let progress = disp["progress"].as_f64().unwrap_or(0.0);
    let mut state = Map::new();
    state.insert("state".into(), json!(ps["state"].as_str().unwrap_or("standby")));
    state.insert("filename".into(), json!(ps["filename"].as_str().unwrap_or("")));
    state.insert("total_duration".into(), json!(ps["total_duration"].as_f64().unwrap_or(0.0)));
    state.insert("print_duration".into(), json!(ps["print_duration"].as_f64().unwrap_or(0.0)));
    state.insert("progress".into(), json!((progress * 100.0).round() as i64));
    state.insert("message".into(), json!(disp["message"].as_str().unwrap_or("")));
    state.insert("nozzle_temp".into(), ext["temperature"].clone());
    state.insert("nozzle_target".into(), ext["target"].clone());
    state.insert("bed_temp".into(), bed["temperature"].clone());
    state.insert("bed_target".into(), bed["target"].clone());
    state
}

/// Thin client over the Moonraker endpoints this driver uses.
#[derive(Clone)]
struct MoonrakerApi {
    client: reqwest::Client,
    base: String,
}

impl MoonrakerApi {
    fn new(base: String, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|e| SyncError::Config(format!("Invalid api_key header value: {}", e)))?;
            headers.insert("X-Api-Key", value);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .default_headers(headers)
            .build()?;
        Ok(Self { client, base })
    }

    /// `result` field of a GET, or `None` on a non-200 answer.
    async fn get_result(&self, path: &str) -> Result<Option<Value>> {
        let resp = self.client.get(format!("{}{}", self.base, path)).send().await?;
        if !resp.status().is_success() {
            debug!("Moonraker {} returned {}", path, resp.status());
            return Ok(None);
        }
        let body: Value = resp.json().await?;
        Ok(Some(body["result"].clone()))
    }

    async fn printer_state(&self) -> Result<Option<String>> {
        Ok(self
            .get_result("/printer/info")
            .await?
            .map(|info| info["state"].as_str().unwrap_or(STATE_UNKNOWN).to_string()))
    }

    async fn print_state(&self) -> Result<Option<Map<String, Value>>> {
        Ok(self
            .get_result("/printer/objects/query?print_stats&extruder&heater_bed&display_status")
            .await?
            .map(|result| print_state_from_status(&result["status"])))
    }

    async fn save_variables(&self) -> Result<Option<Map<String, Value>>> {
        Ok(self
            .get_result("/printer/objects/query?save_variables")
            .await?
            .map(|result| {
                result["status"]["save_variables"]["variables"]
                    .as_object()
                    .cloned()
                    .unwrap_or_default()
            }))
    }

    async fn active_spool_id(&self) -> Result<Option<i64>> {
        Ok(self
            .get_result("/server/spoolman/spool_id")
            .await?
            .and_then(|result| parse_spool_id(result.get("spool_id"))))
    }

    async fn run_gcode(&self, script: &str) -> Result<bool> {
        let resp = self
            .client
            .post(format!("{}/printer/gcode/script", self.base))
            .json(&json!({ "script": script }))
            .send()
            .await?;
        if resp.status().is_success() {
            return Ok(true);
        }
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        warn!(
            "Moonraker rejected '{}' with {}: {}",
            script,
            status,
            text.chars().take(200).collect::<String>()
        );
        Ok(false)
    }
}

/// State shared between the driver handle and its poll task.
struct PollState {
    running: AtomicBool,
    printer_state: Mutex<String>,
    print_state: Mutex<Map<String, Value>>,
    tracker: Mutex<SlotTracker>,
}

pub struct KlipperDriver {
    ctx: DriverContext,
    state: Arc<PollState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl KlipperDriver {
    pub fn new(ctx: DriverContext) -> Self {
        Self {
            ctx,
            state: Arc::new(PollState {
                running: AtomicBool::new(false),
                printer_state: Mutex::new(STATE_UNKNOWN.to_string()),
                print_state: Mutex::new(Map::new()),
                tracker: Mutex::new(SlotTracker::default()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Configured tool count; anything below 2 means single-slot mode.
    fn slots(&self) -> i64 {
        self.ctx.config_i64("slots").unwrap_or(1).max(1)
    }

    fn api(&self) -> Result<MoonrakerApi> {
        let host = self.ctx.require_str("host", "Moonraker URL")?;
        MoonrakerApi::new(
            normalize_host(host),
            self.ctx.config_str("api_key"),
            Duration::from_secs(self.ctx.settings.klipper.request_timeout_secs),
        )
    }

    fn poller(&self) -> Result<Poller> {
        Ok(Poller {
            ctx: self.ctx.clone(),
            api: self.api()?,
            state: Arc::clone(&self.state),
            slots: self.slots(),
            interval: Duration::from_secs(self.ctx.settings.klipper.poll_interval_secs).max(MIN_POLL_INTERVAL),
        })
    }

    async fn write_spool_var(&self, tool_index: i64, spool_id: Option<i64>) -> bool {
        let api = match self.api() {
            Ok(api) => api,
            Err(e) => {
                warn!("Klipper printer {}: {}", self.ctx.printer_id, e);
                return false;
            }
        };
        let value = spool_id.map(|id| id.to_string()).unwrap_or_else(|| "\"\"".to_string());
        let script = format!("SAVE_VARIABLE VARIABLE={} VALUE={}", spool_var(tool_index), value);

        match api.run_gcode(&script).await {
            Ok(true) => {
                // Keep our own write from showing up as an external change.
                self.state.tracker.lock().unwrap().observe(tool_index + 1, spool_id);
                info!(
                    "Klipper printer {}: set {}={}",
                    self.ctx.printer_id,
                    spool_var(tool_index),
                    value
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(
                    "Klipper printer {}: error setting {}: {}",
                    self.ctx.printer_id,
                    spool_var(tool_index),
                    e
                );
                false
            }
        }
    }
}

#[async_trait]
impl Driver for KlipperDriver {
    fn driver_key(&self) -> &'static str {
        "klipper"
    }

    fn validate_config(&self) -> Result<()> {
        let host = self.ctx.require_str("host", "Moonraker URL")?;
        Url::parse(&normalize_host(host))
            .map_err(|e| SyncError::Config(format!("Invalid Klipper host '{}': {}", host, e)))?;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if self.state.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let poller = match self.poller() {
            Ok(poller) => poller,
            Err(e) => {
                self.state.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        self.state.tracker.lock().unwrap().clear();
        *self.state.printer_state.lock().unwrap() = STATE_UNKNOWN.to_string();
        *self.task.lock().unwrap() = Some(tokio::spawn(poller.run()));

        info!(
            "Klipper driver started for printer {} ({} slot(s))",
            self.ctx.printer_id,
            self.slots()
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.running.store(false, Ordering::SeqCst);
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("Klipper driver stopped for printer {}", self.ctx.printer_id);
        }
        Ok(())
    }

    fn health(&self) -> DriverHealth {
        let running = self.state.running.load(Ordering::SeqCst);
        let printer_state = self.state.printer_state.lock().unwrap().clone();
        let print_state = self.state.print_state.lock().unwrap().clone();
        let connected = printer_state != STATE_UNKNOWN && printer_state != STATE_UNREACHABLE;

        DriverHealth::new(self.driver_key(), self.ctx.printer_id, running, connected)
            .with_detail("printer_state", printer_state)
            .with_detail("print_state", Value::Object(print_state))
    }

    async fn send_command(&self, command: &DriverCommand) -> bool {
        match command {
            DriverCommand::SetSpool { tool_index, spool_id } => {
                self.write_spool_var(*tool_index, Some(*spool_id)).await
            }
            DriverCommand::ClearSpool { tool_index } => self.write_spool_var(*tool_index, None).await,
            other => {
                warn!(
                    "Klipper driver: unknown command '{}' for printer {}",
                    other.name(),
                    self.ctx.printer_id
                );
                false
            }
        }
    }

    fn camera_config(&self) -> Option<CameraConfig> {
        let camera_type = self.ctx.config_str("camera_type").unwrap_or("none");
        if camera_type == "none" {
            return None;
        }
        let url = self.ctx.config_str("camera_url")?;
        let credentials = match (
            self.ctx.config_str("camera_username"),
            self.ctx.config_str("camera_password"),
        ) {
            (Some(username), Some(password)) => Some(CameraCredentials {
                username: username.to_string(),
                password: password.to_string(),
            }),
            _ => None,
        };
        Some(CameraConfig {
            camera_type: camera_type.to_string(),
            url: url.to_string(),
            credentials,
        })
    }

    fn compensation_command(&self, conflict: &ManualConflict) -> Option<DriverCommand> {
        let tool_index = conflict.slot_no - 1;
        let spool_id = conflict
            .spool_external_id
            .as_deref()
            .and_then(|ext| ext.strip_prefix(SPOOLMAN_PREFIX))
            .and_then(|id| id.parse().ok())
            .or(conflict.spool_id);
        Some(match spool_id {
            Some(spool_id) => DriverCommand::SetSpool { tool_index, spool_id },
            None => DriverCommand::ClearSpool { tool_index },
        })
    }
}

/// Background poll loop for one printer.
struct Poller {
    ctx: DriverContext,
    api: MoonrakerApi,
    state: Arc<PollState>,
    slots: i64,
    interval: Duration,
}

impl Poller {
    async fn run(self) {
        if self.slots > 1 {
            self.emit_initial_state().await;
        }

        while self.state.running.load(Ordering::SeqCst) {
            self.poll_once().await;
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Create the printer's slots before any assignment exists.
    async fn emit_initial_state(&self) {
        let unit = AmsUnitState {
            ams_unit_no: 0,
            slots_total: self.slots,
            slots: (1..=self.slots).map(SlotState::empty).collect(),
        };
        self.ctx.sink.emit(DriverEvent::AmsState { ams_units: vec![unit] }).await;
        info!(
            "Klipper initialized {} slots for printer {}",
            self.slots, self.ctx.printer_id
        );
    }

    /// One poll cycle. Every query fails on its own, so a broken status
    /// query never holds back slot resolution.
    async fn poll_once(&self) {
        match self.api.printer_state().await {
            Ok(Some(state)) => *self.state.printer_state.lock().unwrap() = state,
            Ok(None) => {}
            Err(e) => self.query_failed("printer info", &e),
        }

        match self.api.print_state().await {
            Ok(Some(print_state)) => *self.state.print_state.lock().unwrap() = print_state,
            Ok(None) => {}
            Err(e) => self.query_failed("print status", &e),
        }

        let changes = if self.slots > 1 {
            match self.api.save_variables().await {
                Ok(Some(variables)) => self.multi_slot_changes(&variables),
                Ok(None) => {
                    debug!("Klipper printer {}: save_variables unavailable", self.ctx.printer_id);
                    return;
                }
                Err(e) => {
                    self.query_failed("save_variables", &e);
                    return;
                }
            }
        } else {
            match self.api.active_spool_id().await {
                Ok(spool_id) => self.single_slot_change(spool_id),
                Err(e) => {
                    self.query_failed("active spool", &e);
                    return;
                }
            }
        };

        for (slot, spool_id) in changes {
            self.ctx.sink.emit(slot_event(slot, spool_id)).await;
            info!(
                "Klipper printer {} slot {}: {}",
                self.ctx.printer_id,
                slot.slot_no,
                spool_id
                    .map(|id| format!("spool {}{}", SPOOLMAN_PREFIX, id))
                    .unwrap_or_else(|| "empty".to_string())
            );
        }
    }

    /// Transport failures mark the printer unreachable until the next
    /// successful printer info answer.
    fn query_failed(&self, what: &str, error: &SyncError) {
        if is_transport_error(error) {
            *self.state.printer_state.lock().unwrap() = STATE_UNREACHABLE.to_string();
        }
        debug!(
            "Klipper printer {}: {} query failed: {}",
            self.ctx.printer_id, what, error
        );
    }

    fn multi_slot_changes(&self, variables: &Map<String, Value>) -> Vec<(SlotRef, Option<i64>)> {
        let mut tracker = self.state.tracker.lock().unwrap();
        tracker
            .diff_variables(variables, self.slots)
            .into_iter()
            .map(|(slot_no, spool_id)| (SlotRef::in_unit(0, slot_no), spool_id))
            .collect()
    }

    fn single_slot_change(&self, spool_id: Option<i64>) -> Vec<(SlotRef, Option<i64>)> {
        let mut tracker = self.state.tracker.lock().unwrap();
        tracker
            .observe(1, spool_id)
            .map(|change| vec![(SlotRef::standalone(1), change)])
            .unwrap_or_default()
    }
}

fn is_transport_error(error: &SyncError) -> bool {
    matches!(error, SyncError::Http(e) if e.is_connect() || e.is_timeout() || e.is_request())
}

fn slot_event(slot: SlotRef, spool_id: Option<i64>) -> DriverEvent {
    let meta = Some(json!({ "source": EVENT_SOURCE }));
    match spool_id {
        Some(id) => DriverEvent::SpoolInserted {
            slot,
            identifiers: Identifiers::external(format!("{}{}", SPOOLMAN_PREFIX, id)),
            meta,
        },
        None => DriverEvent::SpoolRemoved { slot, meta },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{testing, PrinterEvent};
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Local Moonraker stand-in answering by path prefix: (prefix, status, body).
    /// Unmatched paths get a 404.
    fn moonraker(routes: Vec<(&'static str, u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&request);
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let (status, body) = routes
                    .iter()
                    .find(|(prefix, _, _)| path.starts_with(prefix))
                    .map(|(_, status, body)| (*status, *body))
                    .unwrap_or((404, "{}"));
                let response = format!(
                    "HTTP/1.1 {} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{}", addr)
    }

    fn driver_for(host: &str) -> (KlipperDriver, tokio::sync::mpsc::Receiver<PrinterEvent>) {
        let (ctx, rx) = testing::context(3, json!({ "host": host }));
        (KlipperDriver::new(ctx), rx)
    }

    #[tokio::test]
    async fn test_broken_status_query_does_not_block_slots() {
        let host = moonraker(vec![
            ("/printer/info", 200, r#"{"result": {"state": "ready"}}"#),
            ("/printer/objects/query?print_stats", 200, "<html>bad gateway</html>"),
            ("/server/spoolman/spool_id", 200, r#"{"result": {"spool_id": 3}}"#),
        ]);
        let (driver, mut rx) = driver_for(&host);

        driver.poller().unwrap().poll_once().await;

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event.event,
            DriverEvent::SpoolInserted {
                slot: SlotRef::standalone(1),
                identifiers: Identifiers::external("spoolman:3"),
                meta: Some(json!({"source": "klipper_poll"})),
            }
        );
        let health = driver.health();
        assert_eq!(health.details["printer_state"], "ready");
        assert!(health.connected);
    }

    #[tokio::test]
    async fn test_connection_failure_marks_unreachable() {
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let (driver, mut rx) = driver_for(&format!("http://{}", addr));

        driver.poller().unwrap().poll_once().await;

        assert!(rx.try_recv().is_err());
        let health = driver.health();
        assert_eq!(health.details["printer_state"], "unreachable");
        assert!(!health.connected);
    }

    #[test]
    fn test_poll_interval_has_a_floor() {
        let (mut ctx, _rx) = testing::context(1, json!({"host": "voron"}));
        ctx.settings.klipper.poll_interval_secs = 0;
        assert_eq!(KlipperDriver::new(ctx).poller().unwrap().interval, MIN_POLL_INTERVAL);

        let (mut ctx, _rx) = testing::context(1, json!({"host": "voron"}));
        ctx.settings.klipper.poll_interval_secs = 15;
        assert_eq!(
            KlipperDriver::new(ctx).poller().unwrap().interval,
            Duration::from_secs(15)
        );
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("voron.local"), "http://voron.local");
        assert_eq!(normalize_host("http://10.0.0.9:7125/"), "http://10.0.0.9:7125");
        assert_eq!(normalize_host("https://printer.example.com"), "https://printer.example.com");
    }

    #[test]
    fn test_parse_spool_id() {
        assert_eq!(parse_spool_id(Some(&json!(12))), Some(12));
        assert_eq!(parse_spool_id(Some(&json!("7"))), Some(7));
        assert_eq!(parse_spool_id(Some(&json!(""))), None);
        assert_eq!(parse_spool_id(Some(&json!(0))), None);
        assert_eq!(parse_spool_id(Some(&json!("abc"))), None);
        assert_eq!(parse_spool_id(Some(&json!(null))), None);
        assert_eq!(parse_spool_id(None), None);
    }

    #[test]
    fn test_tracker_only_reports_changes() {
        let mut tracker = SlotTracker::default();
        let vars = json!({"t0__spool_id": 3, "t1__spool_id": "", "t2__spool_id": "9"});
        let vars = vars.as_object().unwrap();

        let first = tracker.diff_variables(vars, 3);
        assert_eq!(first, vec![(1, Some(3)), (3, Some(9))]);

        // Identical poll results: nothing to emit.
        assert!(tracker.diff_variables(vars, 3).is_empty());
        assert!(tracker.diff_variables(vars, 3).is_empty());

        let changed = json!({"t0__spool_id": "", "t1__spool_id": 4, "t2__spool_id": "9"});
        let changes = tracker.diff_variables(changed.as_object().unwrap(), 3);
        assert_eq!(changes, vec![(1, None), (2, Some(4))]);
    }

    #[test]
    fn test_own_write_is_not_an_external_change() {
        let mut tracker = SlotTracker::default();
        tracker.observe(2, Some(15));
        let vars = json!({"t1__spool_id": 15});
        assert!(tracker.diff_variables(vars.as_object().unwrap(), 2).is_empty());
    }

    #[test]
    fn test_print_state_from_status() {
        let status = json!({
            "print_stats": {"state": "printing", "filename": "benchy.gcode", "print_duration": 120.5},
            "extruder": {"temperature": 215.2, "target": 215.0},
            "heater_bed": {"temperature": 60.1, "target": 60.0},
            "display_status": {"progress": 0.426, "message": null}
        });
        let state = print_state_from_status(&status);
        assert_eq!(state["state"], "printing");
        assert_eq!(state["progress"], 43);
        assert_eq!(state["nozzle_target"], 215.0);
        assert_eq!(state["message"], "");

        let empty = print_state_from_status(&json!({}));
        assert_eq!(empty["state"], "standby");
        assert_eq!(empty["nozzle_temp"], Value::Null);
    }

    #[test]
    fn test_validate_config() {
        let (ctx, _rx) = testing::context(1, json!({}));
        assert!(matches!(KlipperDriver::new(ctx).validate_config(), Err(SyncError::Config(_))));

        let (ctx, _rx) = testing::context(1, json!({"host": "voron.local:7125"}));
        assert!(KlipperDriver::new(ctx).validate_config().is_ok());
    }

    #[test]
    fn test_camera_config() {
        let (ctx, _rx) = testing::context(1, json!({"host": "voron", "camera_type": "none", "camera_url": "x"}));
        assert!(KlipperDriver::new(ctx).camera_config().is_none());

        let (ctx, _rx) = testing::context(1, json!({"host": "voron", "camera_type": "mjpeg"}));
        assert!(KlipperDriver::new(ctx).camera_config().is_none());

        let (ctx, _rx) = testing::context(
            1,
            json!({"host": "voron", "camera_type": "mjpeg", "camera_url": "http://voron/webcam/?action=stream"}),
        );
        let cam = KlipperDriver::new(ctx).camera_config().unwrap();
        assert_eq!(cam.camera_type, "mjpeg");
        assert!(cam.credentials.is_none());
    }

    #[test]
    fn test_compensation_prefers_spoolman_id() {
        let (ctx, _rx) = testing::context(1, json!({"host": "voron"}));
        let driver = KlipperDriver::new(ctx);
        let mut conflict = ManualConflict {
            printer_id: 1,
            slot_id: 10,
            ams_unit_no: Some(0),
            slot_no: 2,
            spool_id: Some(5),
            spool_external_id: Some("spoolman:42".into()),
            assignment_meta: None,
            reported: SlotState::empty(2),
        };
        assert_eq!(
            driver.compensation_command(&conflict),
            Some(DriverCommand::SetSpool { tool_index: 1, spool_id: 42 })
        );

        conflict.spool_external_id = None;
        assert_eq!(
            driver.compensation_command(&conflict),
            Some(DriverCommand::SetSpool { tool_index: 1, spool_id: 5 })
        );
    }
}
