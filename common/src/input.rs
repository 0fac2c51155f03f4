//! Push-button classification and mapping to controller actions.
//!
//! Raw edges are debounced; a settled press that is released before the
//! long-press threshold yields [`ButtonEventKind::Pressed`], otherwise the
//! press yields `LongPressStart` while held and `LongPressEnd` on release.

use crate::{mode::PreviewDirection, types::SystemMode};

pub const DEBOUNCE_MS: u64 = 50;
pub const LONG_PRESS_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Up,
    Down,
}

impl Button {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEventKind {
    Pressed,
    LongPressStart,
    LongPressEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEvent {
    pub button: Button,
    pub kind: ButtonEventKind,
}

#[derive(Debug, Clone, Copy)]
struct PendingEdge {
    level: bool,
    at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ButtonFsm {
    button: Button,
    /// Debounced raw level, i.e. what the pin read before the pending edge.
    settled_level: bool,
    pending: Option<PendingEdge>,
    pressed: bool,
    pressed_at_ms: u64,
    long_elapsed: bool,
    ready: Vec<ButtonEvent>,
}

impl ButtonFsm {
    pub fn new(button: Button) -> Self {
        Self {
            button,
            settled_level: false,
            pending: None,
            pressed: false,
            pressed_at_ms: 0,
            long_elapsed: false,
            ready: Vec::new(),
        }
    }

    /// Records a raw level change; restarts the debounce window.
    pub fn edge(&mut self, level: bool, now_ms: u64) {
        self.advance(now_ms);
        self.pending = Some(PendingEdge {
            level,
            at_ms: now_ms,
        });
    }

    /// Returns every event whose timer expired up to `now_ms`.
    pub fn poll(&mut self, now_ms: u64) -> Vec<ButtonEvent> {
        self.advance(now_ms);
        std::mem::take(&mut self.ready)
    }

    /// Fires expired debounce and long-press timers, oldest first.
    fn advance(&mut self, now_ms: u64) {
        loop {
            let debounce_due = self.pending.map(|edge| edge.at_ms + DEBOUNCE_MS);
            let long_due = (self.pressed && !self.long_elapsed)
                .then_some(self.pressed_at_ms + LONG_PRESS_MS);

            match (debounce_due, long_due) {
                (_, Some(long)) if long <= now_ms && debounce_due.map_or(true, |d| long < d) => {
                    self.long_elapsed = true;
                    if self.level_at(long) {
                        self.ready.push(self.event(ButtonEventKind::LongPressStart));
                    }
                }
                (Some(debounce), _) if debounce <= now_ms => self.settle(debounce),
                _ => break,
            }
        }
    }

    fn level_at(&self, at_ms: u64) -> bool {
        match self.pending {
            Some(edge) if edge.at_ms <= at_ms => edge.level,
            _ => self.settled_level,
        }
    }

    fn settle(&mut self, at_ms: u64) {
        let Some(edge) = self.pending.take() else {
            return;
        };
        self.settled_level = edge.level;

        if edge.level && !self.pressed {
            self.pressed = true;
            self.pressed_at_ms = at_ms;
            self.long_elapsed = false;
        } else if !edge.level && self.pressed {
            self.pressed = false;
            let kind = if self.long_elapsed {
                ButtonEventKind::LongPressEnd
            } else {
                ButtonEventKind::Pressed
            };
            self.ready.push(self.event(kind));
        }
    }

    fn event(&self, kind: ButtonEventKind) -> ButtonEvent {
        ButtonEvent {
            button: self.button,
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputAction {
    /// Adjust the manual setpoint by this many steps.
    StepManual(i8),
    CyclePreview(PreviewDirection),
    ChangeMode(SystemMode),
}

pub fn map_button_event(event: ButtonEvent, mode: SystemMode) -> Option<InputAction> {
    match (event.button, event.kind) {
        (Button::Up, ButtonEventKind::Pressed) => match mode {
            SystemMode::Manual => Some(InputAction::StepManual(1)),
            SystemMode::ModeSelect => Some(InputAction::CyclePreview(PreviewDirection::Up)),
            _ => None,
        },
        (Button::Down, ButtonEventKind::Pressed) => match mode {
            SystemMode::Manual => Some(InputAction::StepManual(-1)),
            SystemMode::ModeSelect => Some(InputAction::CyclePreview(PreviewDirection::Down)),
            _ => None,
        },
        (Button::Up, ButtonEventKind::LongPressStart) => {
            Some(InputAction::ChangeMode(SystemMode::Off))
        }
        (Button::Down, ButtonEventKind::LongPressStart) => (mode != SystemMode::ModeSelect)
            .then_some(InputAction::ChangeMode(SystemMode::ModeSelect)),
        (_, ButtonEventKind::LongPressEnd) => None,
    }
}
