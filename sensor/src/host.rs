use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::{debug, info, warn};

use hearth_common::{
    acquisition::{ChannelFilter, SensorSource},
    TOPIC_SENSOR_OUTSIDE, TOPIC_SENSOR_PRESENCE, TOPIC_SENSOR_RADIATOR, TOPIC_SENSOR_ROOM,
    TOPIC_SENSOR_STATUS,
};

const ACQUISITION_PERIOD: Duration = Duration::from_millis(500);

/// Deterministic stand-in for the board's temperature sensors. Every seventh read fails
/// so the oversampling path sees invalid samples.
#[derive(Debug, Default)]
struct SimulatedSensors {
    cycle: u64,
    reads: u64,
}

impl SimulatedSensors {
    fn advance(&mut self) {
        self.cycle = self.cycle.wrapping_add(1);
    }

    fn wave(&mut self, base: f32, amplitude: f32, period: u64) -> f32 {
        self.reads = self.reads.wrapping_add(1);
        if self.reads % 7 == 0 {
            return f32::NAN;
        }
        let phase = (self.cycle % period) as f32 / period as f32;
        base + amplitude * (1.0 - 2.0 * (2.0 * phase - 1.0).abs())
    }
}

impl SensorSource for SimulatedSensors {
    fn read_room_temperature(&mut self) -> f32 {
        self.wave(20.5, 0.8, 1_200)
    }

    fn read_radiator_temperature(&mut self) -> f32 {
        self.wave(38.0, 6.0, 600)
    }

    fn read_outside_temperature(&mut self) -> f32 {
        self.wave(2.0, 5.0, 7_200)
    }

    fn read_presence(&mut self) -> bool {
        (self.cycle / 1_200) % 2 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Reading {
    room: Option<f32>,
    radiator: Option<f32>,
    outside: Option<f32>,
    presence: bool,
}

/// Filters for the three temperature channels plus the presence input.
#[derive(Debug, Default)]
struct Acquisition {
    room: ChannelFilter,
    radiator: ChannelFilter,
    outside: ChannelFilter,
}

impl Acquisition {
    fn sample(&mut self, source: &mut impl SensorSource) -> Reading {
        Reading {
            room: self.room.sample(|| source.read_room_temperature()),
            radiator: self.radiator.sample(|| source.read_radiator_temperature()),
            outside: self.outside.sample(|| source.read_outside_temperature()),
            presence: source.read_presence(),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("hearth-sensor", mqtt_host, mqtt_port);

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    mqtt.publish(TOPIC_SENSOR_STATUS, QoS::AtLeastOnce, true, "online")
        .await
        .context("failed to publish sensor online status")?;

    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("sensor mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    info!("sensor publisher started");

    // Hardware integration point: swap in the board's sensor drivers here.
    let mut source = SimulatedSensors::default();
    let mut acquisition = Acquisition::default();
    let mut last_presence = None;
    let mut interval = tokio::time::interval(ACQUISITION_PERIOD);

    loop {
        interval.tick().await;
        source.advance();

        let reading = acquisition.sample(&mut source);
        let channels = [
            (TOPIC_SENSOR_ROOM, reading.room),
            (TOPIC_SENSOR_RADIATOR, reading.radiator),
            (TOPIC_SENSOR_OUTSIDE, reading.outside),
        ];
        for (topic, value) in channels {
            match value {
                Some(temp) => mqtt
                    .publish(topic, QoS::AtLeastOnce, true, format!("{temp:.2}"))
                    .await
                    .with_context(|| format!("failed to publish {topic}"))?,
                None => debug!("no valid samples for {topic} this cycle"),
            }
        }

        if last_presence != Some(reading.presence) {
            let payload = if reading.presence { "1" } else { "0" };
            mqtt.publish(TOPIC_SENSOR_PRESENCE, QoS::AtLeastOnce, true, payload)
                .await
                .context("failed to publish presence")?;
            last_presence = Some(reading.presence);
        }
    }
}
