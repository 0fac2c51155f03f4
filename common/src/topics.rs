pub const TOPIC_SENSOR_ROOM: &str = "hearth/sensor/room";
pub const TOPIC_SENSOR_RADIATOR: &str = "hearth/sensor/radiator";
pub const TOPIC_SENSOR_OUTSIDE: &str = "hearth/sensor/outside";
pub const TOPIC_SENSOR_PRESENCE: &str = "hearth/sensor/presence";
pub const TOPIC_SENSOR_STATUS: &str = "hearth/sensor/status";

pub const TOPIC_CONTROLLER_STATE: &str = "hearth/controller/state";
pub const TOPIC_CONTROLLER_RELAY: &str = "hearth/controller/relay";

pub const TOPIC_CMD_MODE: &str = "hearth/cmnd/mode";
pub const TOPIC_CMD_SETPOINT: &str = "hearth/cmnd/setpoint";
pub const TOPIC_CMD_HEAT_RATE: &str = "hearth/cmnd/heat_rate";
pub const TOPIC_CMD_BUTTON_UP: &str = "hearth/cmnd/button/up";
pub const TOPIC_CMD_BUTTON_DOWN: &str = "hearth/cmnd/button/down";
