use hearth_common::input::{Button, ButtonEvent, ButtonFsm};

/// Raw level change of one button, as delivered by the input source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEdge {
    pub button: Button,
    pub pressed: bool,
}

impl ButtonEdge {
    /// Parses an MQTT button payload (`1`/`0`, `ON`/`OFF`, `PRESSED`/`RELEASED`).
    pub fn parse(button: Button, payload: &str) -> Option<Self> {
        let pressed = match payload.trim().to_ascii_uppercase().as_str() {
            "1" | "ON" | "PRESSED" | "DOWN" => true,
            "0" | "OFF" | "RELEASED" | "UP" => false,
            _ => return None,
        };
        Some(Self { button, pressed })
    }
}

/// Debounce and long-press state for both front-panel buttons.
#[derive(Debug, Clone)]
pub struct ButtonPanel {
    up: ButtonFsm,
    down: ButtonFsm,
}

impl Default for ButtonPanel {
    fn default() -> Self {
        Self {
            up: ButtonFsm::new(Button::Up),
            down: ButtonFsm::new(Button::Down),
        }
    }
}

impl ButtonPanel {
    pub fn edge(&mut self, edge: ButtonEdge, now_ms: u64) {
        self.fsm_mut(edge.button).edge(edge.pressed, now_ms);
    }

    pub fn poll(&mut self, now_ms: u64) -> Vec<ButtonEvent> {
        let mut events = self.up.poll(now_ms);
        events.extend(self.down.poll(now_ms));
        events
    }

    fn fsm_mut(&mut self, button: Button) -> &mut ButtonFsm {
        match button {
            Button::Up => &mut self.up,
            Button::Down => &mut self.down,
        }
    }
}
