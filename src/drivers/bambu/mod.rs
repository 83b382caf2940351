//! Bambu Lab driver.
//!
//! Talks to the printer's LAN MQTT broker (TLS, port 8883). The rumqttc
//! blocking client runs on its own OS thread; AMS reports are parsed there
//! and handed to the dispatcher through `EventSink::blocking_emit`.

pub mod materials;
pub mod report;
mod tls;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{Client, Event, MqttOptions, Packet, QoS, RecvTimeoutError, Transport};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{CameraConfig, CameraCredentials, Driver, DriverCommand, DriverContext, DriverEvent, DriverHealth, EventSink};
use crate::error::{Result, SyncError};
use crate::slots::ManualConflict;

const MQTT_PORT: u16 = 8883;
const MQTT_USERNAME: &str = "bblp";
const MAX_PACKET_SIZE: usize = 1024 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_millis(500);
const RECONNECT_TICK: Duration = Duration::from_millis(100);

/// State shared between the driver handle and its MQTT thread.
#[derive(Default)]
struct Shared {
    running: AtomicBool,
    connected: AtomicBool,
    client: Mutex<Option<Client>>,
    last_ams_hash: Mutex<Option<String>>,
    print_state: Mutex<Map<String, Value>>,
}

pub struct BambuDriver {
    ctx: DriverContext,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BambuDriver {
    pub fn new(ctx: DriverContext) -> Self {
        Self {
            ctx,
            shared: Arc::new(Shared::default()),
            thread: Mutex::new(None),
        }
    }

    fn session(&self) -> Result<MqttSession> {
        Ok(MqttSession {
            printer_id: self.ctx.printer_id,
            host: self.ctx.require_str("host", "printer IP")?.to_string(),
            access_code: self.ctx.require_str("access_code", "LAN access code")?.to_string(),
            serial: self.ctx.require_str("serial_number", "printer serial")?.to_string(),
            reconnect_delay: Duration::from_secs(self.ctx.settings.bambu.reconnect_delay_secs),
            sink: self.ctx.sink.clone(),
            shared: Arc::clone(&self.shared),
        })
    }

    fn request_topic(&self) -> Option<String> {
        self.ctx
            .config_str("serial_number")
            .map(|serial| format!("device/{}/request", serial))
    }
}

#[async_trait]
impl Driver for BambuDriver {
    fn driver_key(&self) -> &'static str {
        "bambu"
    }

    fn validate_config(&self) -> Result<()> {
        self.session().map(|_| ())
    }

    async fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.shared.last_ams_hash.lock().unwrap() = None;

        let spawned = self.session().and_then(|session| {
            thread::Builder::new()
                .name(format!("bambu-mqtt-{}", self.ctx.printer_id))
                .spawn(move || session.run())
                .map_err(SyncError::from)
        });
        match spawned {
            Ok(handle) => {
                *self.thread.lock().unwrap() = Some(handle);
                info!("Bambu driver started for printer {}", self.ctx.printer_id);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(client) = self.shared.client.lock().unwrap().take() {
            let _ = client.try_disconnect();
        }

        let handle = self.thread.lock().unwrap().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        let timeout = Duration::from_secs(self.ctx.settings.bambu.stop_timeout_secs);
        let join = tokio::task::spawn_blocking(move || handle.join());
        match tokio::time::timeout(timeout, join).await {
            Ok(_) => info!("Bambu driver stopped for printer {}", self.ctx.printer_id),
            Err(_) => warn!(
                "Bambu MQTT thread for printer {} did not exit within {:?}, leaving it to finish",
                self.ctx.printer_id, timeout
            ),
        }
        Ok(())
    }

    fn health(&self) -> DriverHealth {
        let running = self.shared.running.load(Ordering::SeqCst);
        let connected = self.shared.connected.load(Ordering::SeqCst);
        let print_state = self.shared.print_state.lock().unwrap().clone();

        DriverHealth::new(self.driver_key(), self.ctx.printer_id, running, connected)
            .with_detail("mqtt_connected", connected)
            .with_detail("print_state", Value::Object(print_state))
    }

    async fn send_command(&self, command: &DriverCommand) -> bool {
        let DriverCommand::SetFilament {
            ams_unit_no,
            slot_no,
            filament_type,
            color_hex,
            nozzle_temp_min,
            nozzle_temp_max,
        } = command
        else {
            warn!(
                "Bambu driver: unknown command '{}' for printer {}",
                command.name(),
                self.ctx.printer_id
            );
            return false;
        };

        if !self.shared.connected.load(Ordering::SeqCst) {
            warn!("Bambu printer {}: not connected, cannot set filament", self.ctx.printer_id);
            return false;
        }
        let Some(filament) = materials::lookup(filament_type) else {
            warn!(
                "Bambu printer {}: unknown filament type '{}'",
                self.ctx.printer_id, filament_type
            );
            return false;
        };
        let (Some(topic), Some(client)) = (self.request_topic(), self.shared.client.lock().unwrap().clone()) else {
            return false;
        };

        let payload = materials::filament_setting_payload(
            *ams_unit_no,
            *slot_no,
            &filament,
            color_hex,
            *nozzle_temp_min,
            *nozzle_temp_max,
        );
        match client.try_publish(topic, QoS::AtMostOnce, false, payload.to_string()) {
            Ok(()) => {
                info!(
                    "Bambu printer {}: set AMS {} slot {} to {} ({})",
                    self.ctx.printer_id, ams_unit_no, slot_no, filament.tray_type, filament.code
                );
                true
            }
            Err(e) => {
                warn!("Bambu printer {}: publish failed: {}", self.ctx.printer_id, e);
                false
            }
        }
    }

    /// X1-series printers stream RTSPS on port 322 with the LAN credentials.
    fn camera_config(&self) -> Option<CameraConfig> {
        let camera_type = self.ctx.config_str("camera_type").unwrap_or("none");
        if camera_type == "none" {
            return None;
        }
        let host = self.ctx.config_str("host")?;
        let access_code = self.ctx.config_str("access_code")?;
        Some(CameraConfig {
            camera_type: camera_type.to_string(),
            url: format!("rtsps://{}:322/streaming/live/1", host),
            credentials: Some(CameraCredentials {
                username: MQTT_USERNAME.to_string(),
                password: access_code.to_string(),
            }),
        })
    }

    fn compensation_command(&self, conflict: &ManualConflict) -> Option<DriverCommand> {
        let material = conflict.meta_str("material").filter(|m| !m.is_empty())?;
        Some(DriverCommand::SetFilament {
            ams_unit_no: conflict.ams_unit_no.unwrap_or(0),
            slot_no: conflict.slot_no,
            filament_type: material.to_string(),
            color_hex: conflict.meta_str("color_hex").unwrap_or("").to_string(),
            nozzle_temp_min: None,
            nozzle_temp_max: None,
        })
    }
}

/// Connection parameters and handles owned by the MQTT thread.
struct MqttSession {
    printer_id: i64,
    host: String,
    access_code: String,
    serial: String,
    reconnect_delay: Duration,
    sink: EventSink,
    shared: Arc<Shared>,
}

impl MqttSession {
    fn running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn run(self) {
        while self.running() {
            if let Err(e) = self.connect_once() {
                warn!("Bambu MQTT error for printer {}: {}", self.printer_id, e);
            }
            self.shared.connected.store(false, Ordering::SeqCst);

            if !self.running() {
                break;
            }
            info!(
                "Bambu reconnecting in {:?} for printer {}",
                self.reconnect_delay, self.printer_id
            );
            let mut waited = Duration::ZERO;
            while waited < self.reconnect_delay && self.running() {
                thread::sleep(RECONNECT_TICK);
                waited += RECONNECT_TICK;
            }
        }
        debug!("Bambu MQTT thread for printer {} exiting", self.printer_id);
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(format!("spoolsync-{}", self.printer_id), &self.host, MQTT_PORT);
        options.set_credentials(MQTT_USERNAME, &self.access_code);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        options.set_transport(Transport::tls_with_config(rumqttc::TlsConfiguration::Rustls(
            tls::printer_tls_config(),
        )));
        options
    }

    /// One broker session; returns when the connection drops or the driver stops.
    fn connect_once(&self) -> Result<()> {
        let (client, mut connection) = Client::new(self.options(), 16);
        *self.shared.client.lock().unwrap() = Some(client.clone());

        let report_topic = format!("device/{}/report", self.serial);
        let request_topic = format!("device/{}/request", self.serial);

        while self.running() {
            match connection.recv_timeout(RECV_TIMEOUT) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    self.shared.connected.store(true, Ordering::SeqCst);
                    info!("Bambu MQTT connected for printer {}", self.printer_id);
                    client
                        .try_subscribe(report_topic.as_str(), QoS::AtMostOnce)
                        .map_err(|e| SyncError::Driver(format!("subscribe failed: {}", e)))?;
                    client
                        .try_publish(
                            request_topic.as_str(),
                            QoS::AtMostOnce,
                            false,
                            materials::pushall_payload().to_string(),
                        )
                        .map_err(|e| SyncError::Driver(format!("pushall failed: {}", e)))?;
                }
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    handle_report(&self.shared, &self.sink, &publish.payload);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    info!("Bambu MQTT disconnected for printer {}: {}", self.printer_id, e);
                    return Err(SyncError::Driver(e.to_string()));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SyncError::Driver("MQTT event loop closed".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Handle one report message. Returns true when an `ams_state` event was queued.
fn handle_report(shared: &Shared, sink: &EventSink, payload: &[u8]) -> bool {
    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            debug!("Printer {}: dropping malformed report: {}", sink.printer_id(), e);
            return false;
        }
    };

    report::merge_print_state(&mut shared.print_state.lock().unwrap(), &value);

    let Some(units_raw) = report::ams_units_raw(&value) else {
        return false;
    };
    let hash = report::ams_hash(units_raw);
    {
        let mut last = shared.last_ams_hash.lock().unwrap();
        if last.as_deref() == Some(hash.as_str()) {
            return false;
        }
        *last = Some(hash);
    }

    let ams_units = report::parse_ams_units(units_raw);
    if ams_units.is_empty() {
        return false;
    }
    sink.blocking_emit(DriverEvent::AmsState { ams_units })
}
