use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tracing::{debug, info, warn};

use hearth_common::{
    config::NetworkConfig,
    input::{map_button_event, Button, ButtonEvent, InputAction},
    safety::error_code,
    ActuatorError, AdaptiveInputs, BlobStore, ControlEvent, ControlInput, ControllerStatus,
    HeaterActuator, LocalTime, ManualSetpoint, ModeController, PreviewDirection, PwmDecision,
    RelayGate, RuntimeConfig, SafetyError, SensorSnapshot, StoreError, SystemMode, WeekSchedule,
    TOPIC_CMD_BUTTON_DOWN, TOPIC_CMD_BUTTON_UP, TOPIC_CMD_HEAT_RATE, TOPIC_CMD_MODE,
    TOPIC_CMD_SETPOINT, TOPIC_CONTROLLER_RELAY, TOPIC_CONTROLLER_STATE, TOPIC_SENSOR_OUTSIDE,
    TOPIC_SENSOR_PRESENCE, TOPIC_SENSOR_RADIATOR, TOPIC_SENSOR_ROOM, TOPIC_SENSOR_STATUS,
};

use crate::{
    adaptive_task::{AdaptiveError, AdaptiveService},
    blob_store::{open_store, with_store},
    buttons::{ButtonEdge, ButtonPanel},
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const CONTROL_PERIOD: Duration = Duration::from_secs(1);
const STATE_PUBLISH_PERIOD: Duration = Duration::from_secs(10);
const BUTTON_POLL_PERIOD: Duration = Duration::from_millis(100);
const BUTTON_QUEUE_DEPTH: usize = 32;
/// 2024-01-01T00:00:00Z; an earlier wall clock has not been set yet.
const MIN_PLAUSIBLE_EPOCH: i64 = 1_704_067_200;

/// Heater relay driven over MQTT; the retained topic carries `ON`/`OFF`.
struct MqttHeater {
    mqtt: AsyncClient,
}

impl HeaterActuator for MqttHeater {
    fn set_heater(&mut self, on: bool) -> Result<(), ActuatorError> {
        let payload = if on { "ON" } else { "OFF" };
        self.mqtt
            .try_publish(TOPIC_CONTROLLER_RELAY, QoS::AtLeastOnce, true, payload)
            .map_err(|err| ActuatorError::Rejected(err.to_string()))
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<Mutex<RuntimeConfig>>,
    sensors: Arc<Mutex<SensorSnapshot>>,
    controller: Arc<Mutex<ModeController<MqttHeater>>>,
    manual: Arc<Mutex<ManualSetpoint>>,
    schedule: Arc<Mutex<WeekSchedule>>,
    adaptive: AdaptiveService,
    blobs: Arc<dyn BlobStore>,
    buttons: mpsc::Sender<ButtonEdge>,
    mqtt: AsyncClient,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    #[serde(rename = "clockValid")]
    clock_valid: bool,
    timezone: String,
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
    #[serde(rename = "localTime")]
    local_time: String,
}

#[derive(Debug, Serialize)]
struct ConfigView {
    #[serde(flatten)]
    config: RuntimeConfig,
    #[serde(rename = "mqttPassSet")]
    mqtt_pass_set: bool,
}

#[derive(Debug, Serialize)]
struct ConfigUpdateResponse {
    #[serde(rename = "restartRequired")]
    restart_required: bool,
    config: ConfigView,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("HEARTH_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.hearth"));

    let store = AppStore::new(&data_dir);
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    if runtime.timezone.parse::<Tz>().is_err() {
        warn!("unknown timezone {:?}, falling back to UTC", runtime.timezone);
        runtime.timezone = "UTC".to_string();
    }

    let blobs = open_store(&data_dir.join("blobs")).await;

    let (manual, err) = with_store(&blobs, ManualSetpoint::load)
        .await
        .context("failed to load manual setpoint")?;
    if let Some(err) = err {
        warn!("failed to load manual setpoint: {err}");
    }
    let (schedule, err) = with_store(&blobs, WeekSchedule::load)
        .await
        .context("failed to load schedule")?;
    if let Some(err) = err {
        warn!("failed to load schedule: {err}");
    }

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("hearth-controller", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let relay = RelayGate::new(MqttHeater { mqtt: mqtt.clone() })
        .context("failed to switch the heater off at startup")?;
    let now_ms = monotonic_ms();
    let mut controller = ModeController::new(&runtime.control, relay, now_ms);
    log_control_events(&controller.start(now_ms));

    let adaptive = AdaptiveService::start(blobs.clone(), runtime.control.limits).await;
    let (button_tx, button_rx) = mpsc::channel(BUTTON_QUEUE_DEPTH);

    let app_state = AppState {
        config: Arc::new(Mutex::new(runtime)),
        sensors: Arc::new(Mutex::new(SensorSnapshot::default())),
        controller: Arc::new(Mutex::new(controller)),
        manual: Arc::new(Mutex::new(manual)),
        schedule: Arc::new(Mutex::new(schedule)),
        adaptive,
        blobs,
        buttons: button_tx,
        mqtt,
        store,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone());
    spawn_button_loop(app_state.clone(), button_rx);
    spawn_state_publish_loop(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/mode", post(handle_set_mode))
        .route("/api/mode/select", post(handle_enter_mode_select))
        .route("/api/mode/preview", post(handle_cycle_preview))
        .route("/api/emergency/ack", post(handle_ack_emergency))
        .route("/api/setpoint", post(handle_set_setpoint))
        .route(
            "/api/schedule",
            get(handle_get_schedule).put(handle_put_schedule),
        )
        .route("/api/heat-rate", post(handle_set_heat_rate))
        .route("/api/config", get(handle_get_config).put(handle_put_config))
        .route("/api/time", get(handle_get_time))
        .with_state(app_state.clone());

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("controller shutting down");
    app_state.adaptive.deinit().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    let topics = [
        TOPIC_SENSOR_ROOM,
        TOPIC_SENSOR_RADIATOR,
        TOPIC_SENSOR_OUTSIDE,
        TOPIC_SENSOR_PRESENCE,
        TOPIC_SENSOR_STATUS,
        TOPIC_CMD_MODE,
        TOPIC_CMD_SETPOINT,
        TOPIC_CMD_HEAT_RATE,
        TOPIC_CMD_BUTTON_UP,
        TOPIC_CMD_BUTTON_DOWN,
    ];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce)
            .await
            .with_context(|| format!("failed to subscribe to {topic}"))?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CONTROL_PERIOD);
        loop {
            interval.tick().await;
            run_control_tick(&app_state).await;
        }
    });
}

async fn run_control_tick(state: &AppState) {
    let now_ms = monotonic_ms();
    let config = state.config.lock().await.clone();

    let local_now = now_in_timezone(&config.timezone)
        .unwrap_or_else(|| Utc::now().with_timezone(&chrono_tz::UTC));
    let local_time = LocalTime::from_datetime(&local_now);

    let snapshot = *state.sensors.lock().await;
    if !snapshot.has_control_readings() {
        debug!("control tick skipped, waiting for room and radiator readings");
        return;
    }
    let room_temp = snapshot.room_or_nan(now_ms, config.safety.sensor_stale_timeout_ms);
    let radiator_temp = snapshot.radiator_or_nan(now_ms, config.safety.sensor_stale_timeout_ms);
    let outside_temp = snapshot.outside_if_fresh(now_ms, config.safety.weather_stale_timeout_ms);

    let manual_setpoint = state.manual.lock().await.get();
    let schedule = state.schedule.lock().await.clone();
    let adaptive_setpoint = state.adaptive.setpoint().await;

    let input = ControlInput {
        room_temp,
        radiator_temp,
        outside_temp,
        manual_setpoint,
        adaptive_setpoint,
        schedule: &schedule,
        local_time,
        now_ms,
    };
    let report = state.controller.lock().await.tick(&input, &config);
    log_control_events(&report.events);

    if report.safe {
        state
            .adaptive
            .notify_sensor(AdaptiveInputs {
                room_temp,
                outside_temp,
                presence: snapshot.presence,
                time: local_time,
            })
            .await;
    }
}

fn spawn_button_loop(app_state: AppState, mut edges: mpsc::Receiver<ButtonEdge>) {
    tokio::spawn(async move {
        let mut panel = ButtonPanel::default();
        let mut interval = tokio::time::interval(BUTTON_POLL_PERIOD);
        loop {
            tokio::select! {
                edge = edges.recv() => match edge {
                    Some(edge) => panel.edge(edge, monotonic_ms()),
                    None => break,
                },
                _ = interval.tick() => {
                    for event in panel.poll(monotonic_ms()) {
                        handle_button_event(&app_state, event).await;
                    }
                }
            }
        }
    });
}

async fn handle_button_event(state: &AppState, event: ButtonEvent) {
    debug!("button {} {:?}", event.button.as_str(), event.kind);
    let mode = state.controller.lock().await.mode();
    if let Some(action) = map_button_event(event, mode) {
        apply_input_action(state, action).await;
    }
}

async fn apply_input_action(state: &AppState, action: InputAction) {
    let now_ms = monotonic_ms();
    match action {
        InputAction::StepManual(steps) => {
            match update_manual_setpoint(state, move |manual, store| manual.step(steps, store)).await
            {
                Ok(value) => info!("manual setpoint {value:.2}C"),
                Err(err) => warn!("failed to persist manual setpoint: {err}"),
            }
        }
        InputAction::CyclePreview(direction) => {
            let event = state
                .controller
                .lock()
                .await
                .cycle_preview(direction, now_ms);
            if let Some(event) = event {
                log_control_events(&[event]);
            }
        }
        InputAction::ChangeMode(mode) => {
            let events = state.controller.lock().await.change_mode(mode, now_ms);
            log_control_events(&events);
        }
    }
}

/// Applies a change to the manual setpoint and persists it on the blocking
/// pool. The lock is held until the new value is stored back, so
/// concurrent steps queue up instead of overwriting each other.
async fn update_manual_setpoint<F>(state: &AppState, apply: F) -> Result<f32, StoreError>
where
    F: FnOnce(&mut ManualSetpoint, &dyn BlobStore) -> Result<f32, StoreError> + Send + 'static,
{
    let mut manual = state.manual.lock().await;
    let mut next = *manual;
    let (next, result) = with_store(&state.blobs, move |store| {
        let result = apply(&mut next, store);
        (next, result)
    })
    .await?;
    *manual = next;
    result
}

fn log_control_events(events: &[ControlEvent]) {
    for event in events {
        match event {
            ControlEvent::ModeChanged { from, to } => {
                info!("mode {} -> {}", from.as_str(), to.as_str());
            }
            ControlEvent::PreviewChanged(mode) => info!("mode preview {}", mode.as_str()),
            ControlEvent::SafetyTrip(error) => {
                warn!("safety trip (code {}): {error}", error.code());
            }
            ControlEvent::WeatherDegraded => debug!("no fresh weather data"),
            ControlEvent::Pwm(PwmDecision::Cutoff {
                radiator_temp,
                limit,
            }) => warn!("radiator {radiator_temp:.1}C at or above {limit:.1}C, heater off"),
            ControlEvent::Pwm(PwmDecision::Cycle {
                new_cycle: true,
                on_duration_s,
                cycle_s,
                ..
            }) => debug!("pwm window started: on {on_duration_s}s of {cycle_s}s"),
            ControlEvent::Pwm(_) => {}
            ControlEvent::ActuatorFailed(err) => warn!("heater command failed: {err}"),
        }
    }
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATE_PUBLISH_PERIOD);
        loop {
            interval.tick().await;

            let status = build_status(&app_state).await;
            match serde_json::to_vec(&status) {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller state serialization failed: {err}"),
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let now_ms = monotonic_ms();

    match topic.as_str() {
        TOPIC_SENSOR_ROOM => {
            if let Some(temp) = parse_temperature(&message) {
                app_state.sensors.lock().await.update_room(temp, now_ms);
            }
        }
        TOPIC_SENSOR_RADIATOR => {
            if let Some(temp) = parse_temperature(&message) {
                app_state.sensors.lock().await.update_radiator(temp, now_ms);
            }
        }
        TOPIC_SENSOR_OUTSIDE => {
            if let Some(temp) = parse_temperature(&message) {
                app_state.sensors.lock().await.update_outside(temp, now_ms);
            }
        }
        TOPIC_SENSOR_PRESENCE => {
            let Some(present) = parse_flag(&message) else {
                anyhow::bail!("invalid presence payload {message:?}");
            };
            let mut sensors = app_state.sensors.lock().await;
            if sensors.presence != present {
                debug!("presence input {}", if present { "on" } else { "off" });
            }
            sensors.set_presence(present);
        }
        TOPIC_SENSOR_STATUS => info!("sensor node {}", message.trim()),
        TOPIC_CMD_MODE => {
            let Some(mode) = SystemMode::parse_requested(&message) else {
                anyhow::bail!("unknown mode request {message:?}");
            };
            let events = app_state.controller.lock().await.change_mode(mode, now_ms);
            log_control_events(&events);
        }
        TOPIC_CMD_SETPOINT => {
            let value = message
                .trim()
                .parse::<f32>()
                .context("invalid setpoint payload")?;
            let stored =
                update_manual_setpoint(app_state, move |manual, store| manual.set(value, store))
                    .await?;
            info!("manual setpoint {stored:.2}C");
        }
        TOPIC_CMD_HEAT_RATE => {
            let rate = message
                .trim()
                .parse::<f32>()
                .context("invalid heat rate payload")?;
            app_state.adaptive.set_heat_rate(rate).await?;
            info!("heat rate set to {rate:.2}C/h");
        }
        TOPIC_CMD_BUTTON_UP | TOPIC_CMD_BUTTON_DOWN => {
            let button = if topic == TOPIC_CMD_BUTTON_UP {
                Button::Up
            } else {
                Button::Down
            };
            let Some(edge) = ButtonEdge::parse(button, &message) else {
                anyhow::bail!("invalid button payload {message:?}");
            };
            if let Err(err) = app_state.buttons.try_send(edge) {
                warn!("button edge dropped: {err}");
            }
        }
        _ => {}
    }

    Ok(())
}

async fn build_status(state: &AppState) -> ControllerStatus {
    let timezone = state.config.lock().await.timezone.clone();
    let snapshot = *state.sensors.lock().await;

    let (mode, preview, relay_on, setpoint, latched_error) = {
        let controller = state.controller.lock().await;
        (
            controller.mode(),
            controller.preview(),
            controller.relay_on(),
            controller.last_setpoint(),
            controller.latched_error(),
        )
    };

    let manual_setpoint = state.manual.lock().await.get();
    let adaptive = state.adaptive.status().await;
    let next_schedule_event_epoch = {
        let schedule = state.schedule.lock().await;
        now_in_timezone(&timezone).and_then(|now| schedule.next_change_epoch(&now))
    };

    ControllerStatus {
        mode: mode.as_str(),
        preview_mode: preview.map(SystemMode::as_str),
        room_temp: snapshot.room_temp_c,
        radiator_temp: snapshot.radiator_temp_c,
        outside_temp: snapshot.outside_temp_c,
        presence: snapshot.presence,
        relay_on,
        setpoint,
        manual_setpoint,
        adaptive_setpoint: adaptive.setpoint,
        heat_rate: adaptive.heat_rate,
        presence_valid: adaptive.presence_valid,
        preheat_active: adaptive.preheat,
        absence_timeout_minutes: adaptive.absence_timeout_minutes,
        error_code: error_code(latched_error),
        error: latched_error.map(SafetyError::as_str),
        next_schedule_event_epoch,
        timezone,
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(build_status(&state).await)
}

async fn handle_set_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(mode) = SystemMode::parse_requested(value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid mode. Use OFF, MANUAL, ADAPTIVE, PROGRAMMED, ANTI_FREEZE or MODE_SELECT",
        );
    };

    let events = state
        .controller
        .lock()
        .await
        .change_mode(mode, monotonic_ms());
    log_control_events(&events);

    handle_get_status(State(state)).await.into_response()
}

async fn handle_enter_mode_select(State(state): State<AppState>) -> impl IntoResponse {
    let events = state
        .controller
        .lock()
        .await
        .change_mode(SystemMode::ModeSelect, monotonic_ms());
    log_control_events(&events);

    handle_get_status(State(state)).await.into_response()
}

async fn handle_cycle_preview(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let direction = match params.get("direction").map(|value| value.to_ascii_lowercase()) {
        Some(value) if value == "up" => PreviewDirection::Up,
        Some(value) if value == "down" => PreviewDirection::Down,
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Invalid direction. Use 'up' or 'down'",
            )
        }
    };

    let event = state
        .controller
        .lock()
        .await
        .cycle_preview(direction, monotonic_ms());
    let Some(event) = event else {
        return error_response(StatusCode::CONFLICT, "Mode selection is not active");
    };
    log_control_events(&[event]);

    handle_get_status(State(state)).await.into_response()
}

async fn handle_ack_emergency(State(state): State<AppState>) -> impl IntoResponse {
    let events = state
        .controller
        .lock()
        .await
        .acknowledge_emergency(monotonic_ms());
    if events.is_empty() {
        return error_response(StatusCode::CONFLICT, "No emergency to acknowledge");
    }
    log_control_events(&events);

    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_setpoint(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(target) = value.parse::<f32>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };
    if !target.is_finite() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    }

    if let Err(err) =
        update_manual_setpoint(&state, move |manual, store| manual.set(target, store)).await
    {
        warn!("failed to persist manual setpoint: {err}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist manual setpoint",
        );
    }

    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_schedule(State(state): State<AppState>) -> impl IntoResponse {
    let schedule = state.schedule.lock().await.clone();
    Json(schedule)
}

async fn handle_put_schedule(
    State(state): State<AppState>,
    Json(schedule): Json<WeekSchedule>,
) -> impl IntoResponse {
    if let Err(err) = schedule.validate() {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }

    let persisted = {
        let mut active = state.schedule.lock().await;
        let snapshot = schedule.clone();
        let persisted = with_store(&state.blobs, move |store| snapshot.persist(store))
            .await
            .and_then(|result| result);
        *active = schedule;
        persisted
    };
    info!("schedule replaced");

    if let Err(err) = persisted {
        warn!("failed to persist schedule update: {err}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist schedule",
        );
    }

    handle_get_schedule(State(state)).await.into_response()
}

async fn handle_set_heat_rate(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(rate) = value.parse::<f32>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid heat rate value");
    };

    match state.adaptive.set_heat_rate(rate).await {
        Ok(()) => info!("heat rate set to {rate:.2}C/h"),
        Err(AdaptiveError::InvalidHeatRate) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Heat rate must be a positive number of degrees per hour",
            )
        }
        Err(AdaptiveError::Busy) => {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "Adaptive engine busy")
        }
    }

    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.lock().await.clone();
    Json(build_config_view(config))
}

async fn handle_put_config(
    State(state): State<AppState>,
    Json(mut update): Json<RuntimeConfig>,
) -> impl IntoResponse {
    if update.timezone.parse::<Tz>().is_err() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid timezone value");
    }
    if update.network.mqtt_host.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "mqtt_host cannot be empty");
    }
    if update.network.mqtt_port == 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "mqtt_port must be between 1 and 65535",
        );
    }
    update.sanitize();

    let previous = state.config.lock().await.clone();
    // An empty password keeps the stored one.
    if update.network.mqtt_pass.is_empty() {
        update.network.mqtt_pass = previous.network.mqtt_pass.clone();
    }

    if let Err(err) = state.store.save_runtime_config(&update).await {
        warn!("failed to persist runtime config update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }

    let restart_required = previous.control.pid != update.control.pid
        || network_restart_required(&previous.network, &update.network);
    state.adaptive.set_limits(update.control.limits);
    *state.config.lock().await = update.clone();
    info!("runtime config updated (restart required: {restart_required})");

    Json(ConfigUpdateResponse {
        restart_required,
        config: build_config_view(update),
    })
    .into_response()
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    let timezone = state.config.lock().await.timezone.clone();
    let now = Utc::now();
    let local_time = timezone
        .parse::<Tz>()
        .map(|tz| now.with_timezone(&tz).format("%a %H:%M").to_string())
        .unwrap_or_default();
    Json(TimeStatus {
        clock_valid: clock_is_plausible(now),
        timezone,
        now_epoch: now.timestamp(),
        local_time,
    })
}

impl AppStore {
    fn new(data_dir: &Path) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn build_config_view(mut config: RuntimeConfig) -> ConfigView {
    let mqtt_pass_set = !config.network.mqtt_pass.is_empty();
    config.network.mqtt_pass.clear();
    ConfigView {
        config,
        mqtt_pass_set,
    }
}

fn network_restart_required(previous: &NetworkConfig, current: &NetworkConfig) -> bool {
    previous.mqtt_host != current.mqtt_host
        || previous.mqtt_port != current.mqtt_port
        || previous.mqtt_user != current.mqtt_user
        || previous.mqtt_pass != current.mqtt_pass
}

fn parse_temperature(message: &str) -> Option<f32> {
    message
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|value| value.is_finite())
}

fn parse_flag(message: &str) -> Option<bool> {
    match message.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" => Some(true),
        "0" | "off" | "false" => Some(false),
        _ => None,
    }
}

fn now_in_timezone(timezone: &str) -> Option<DateTime<Tz>> {
    let tz: Tz = timezone.parse().ok()?;
    Some(Utc::now().with_timezone(&tz))
}

fn clock_is_plausible(now: DateTime<Utc>) -> bool {
    now.timestamp() >= MIN_PLAUSIBLE_EPOCH
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use hearth_common::MemoryStore;
    use tempfile::TempDir;

    use super::*;

    async fn test_state() -> (AppState, rumqttc::EventLoop, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let runtime = RuntimeConfig::default();
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryStore::new());

        let options = MqttOptions::new("hearth-controller-test", "localhost", 1883);
        let (mqtt, eventloop) = AsyncClient::new(options, 64);
        let relay = RelayGate::new(MqttHeater { mqtt: mqtt.clone() }).unwrap();
        let mut controller = ModeController::new(&runtime.control, relay, monotonic_ms());
        controller.start(monotonic_ms());

        let adaptive = AdaptiveService::start(blobs.clone(), runtime.control.limits).await;
        let (buttons, _) = mpsc::channel(BUTTON_QUEUE_DEPTH);

        let state = AppState {
            config: Arc::new(Mutex::new(runtime)),
            sensors: Arc::new(Mutex::new(SensorSnapshot::default())),
            controller: Arc::new(Mutex::new(controller)),
            manual: Arc::new(Mutex::new(ManualSetpoint::default())),
            schedule: Arc::new(Mutex::new(WeekSchedule::default())),
            adaptive,
            blobs,
            buttons,
            mqtt,
            store: AppStore::new(dir.path()),
        };
        (state, eventloop, dir)
    }

    async fn feed_readings(state: &AppState, room: f32, radiator: f32) {
        let now_ms = monotonic_ms();
        let mut sensors = state.sensors.lock().await;
        sensors.update_room(room, now_ms);
        sensors.update_radiator(radiator, now_ms);
        sensors.set_presence(true);
    }

    #[test]
    fn parses_sensor_payloads() {
        assert_eq!(parse_temperature(" 21.5\n"), Some(21.5));
        assert_eq!(parse_temperature("nan"), None);
        assert_eq!(parse_temperature("warm"), None);

        assert_eq!(parse_flag("ON"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn password_is_hidden_in_config_view() {
        let mut config = RuntimeConfig::default();
        config.network.mqtt_pass = "secret".to_string();

        let view = build_config_view(config);
        assert!(view.mqtt_pass_set);
        assert!(view.config.network.mqtt_pass.is_empty());

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["mqttPassSet"], true);
        assert_eq!(json["timezone"], "Europe/Kyiv");
    }

    #[test]
    fn broker_changes_need_restart() {
        let previous = NetworkConfig::default();
        let mut current = previous.clone();
        assert!(!network_restart_required(&previous, &current));

        current.mqtt_port = 8883;
        assert!(network_restart_required(&previous, &current));
    }

    #[test]
    fn clock_before_2024_is_not_valid() {
        assert!(!clock_is_plausible(Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 5).unwrap()));
        assert!(!clock_is_plausible(
            Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap()
        ));
        assert!(clock_is_plausible(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn unsafe_tick_keeps_readings_from_adaptive_engine() {
        let (state, _eventloop, _dir) = test_state().await;
        feed_readings(&state, 200.0, 40.0).await;

        run_control_tick(&state).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let status = build_status(&state).await;
        assert_eq!(status.mode, "EMERGENCY");
        assert_eq!(status.presence_valid, Some(false));
        state.adaptive.deinit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn safe_tick_forwards_readings_to_adaptive_engine() {
        let (state, _eventloop, _dir) = test_state().await;
        feed_readings(&state, 20.0, 40.0).await;

        run_control_tick(&state).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let status = build_status(&state).await;
        assert_eq!(status.mode, "OFF");
        assert_eq!(status.presence_valid, Some(true));
        assert_eq!(status.preheat_active, Some(false));
        state.adaptive.deinit().await;
    }

    #[tokio::test]
    async fn concurrent_manual_steps_are_not_lost() {
        let (state, _eventloop, _dir) = test_state().await;

        let (first, second) = tokio::join!(
            update_manual_setpoint(&state, |manual, store| manual.step(1, store)),
            update_manual_setpoint(&state, |manual, store| manual.step(1, store)),
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(state.manual.lock().await.get(), 21.5);
        let (reloaded, err) = ManualSetpoint::load(state.blobs.as_ref());
        assert!(err.is_none());
        assert_eq!(reloaded.get(), 21.5);
        state.adaptive.deinit().await;
    }
}
