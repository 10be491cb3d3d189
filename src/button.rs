/*!
    button event classifier

    raw electrical debouncing lives outside the crate: a debounce library
    feeds clean press/release [Edge]s with timestamps into [ButtonBank::feed].
    the classifier turns edge timing into click/double/triple/long events and
    publishes every event into the button's analog-input register (of type
    [DataType::Button][crate::value::DataType::Button]).
*/

use bilge::prelude::*;
use heapless::Vec;
use log::*;

use crate::config::*;
use crate::pack_enum;
use crate::registers::{RegisterKind, RegisterStore};
use crate::value::Value;


/// classified button event, as published in the button's register
#[bitsize(8)]
#[derive(Copy, Clone, Default, FromBits, Debug, PartialEq, Eq)]
pub enum ButtonEvent {
    #[default]
    None = 0,
    Pressed = 1,
    Released = 2,
    Click = 3,
    DoubleClick = 4,
    TripleClick = 5,
    LongClick = 6,
    LongLongClick = 7,

    #[fallback]
    Unknown = 255,
}
pack_enum!(ButtonEvent);

/// debounced edge from the board's button library
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Edge {
    Pressed,
    Released,
}

/// classification thresholds, milliseconds
#[derive(Copy, Clone, Debug)]
pub struct ButtonConfig {
    /// wait for a second (or third) click this long after a release
    pub dblclick_delay: u64,
    /// a press held at least this long releases as a long click
    pub lngclick_delay: u64,
    /// a press held at least this long is a long-long click
    pub lnglngclick_delay: u64,
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            dblclick_delay: BUTTON_DBLCLICK_DELAY,
            lngclick_delay: BUTTON_LNGCLICK_DELAY,
            lnglngclick_delay: BUTTON_LNGLNGCLICK_DELAY,
        }
    }
}

struct Button {
    /// analog-input register receiving the event codes
    register: u8,
    pressed_at: Option<u64>,
    clicks: u8,
    /// deadline of the running double-click window
    window: Option<u64>,
    /// a long-long click already fired while this press is still held
    long_fired: bool,
}

/// all buttons of the node
pub struct ButtonBank {
    buttons: Vec<Button, MAX_BUTTONS>,
    config: ButtonConfig,
}

impl ButtonBank {
    pub fn new(config: ButtonConfig) -> Self {
        Self { buttons: Vec::new(), config }
    }

    /// declare a button publishing into the given analog-input register
    pub fn add(&mut self, register: u8) -> Result<u8, &'static str> {
        let button = Button {
            register,
            pressed_at: None,
            clicks: 0,
            window: None,
            long_fired: false,
        };
        if self.buttons.push(button).is_err() {
            return Err("too many buttons");
        }
        Ok(self.buttons.len() as u8 - 1)
    }

    /// feed one debounced edge for button `index` observed at `now`
    pub fn feed(&mut self, store: &mut RegisterStore, index: u8, edge: Edge, now: u64) {
        let Some(button) = self.buttons.get_mut(usize::from(index)) else {
            warn!("edge for unknown button {}", index);
            return;
        };
        match edge {
            Edge::Pressed => {
                button.pressed_at = Some(now);
                button.long_fired = false;
                publish(store, button.register, ButtonEvent::Pressed);
            }
            Edge::Released => {
                publish(store, button.register, ButtonEvent::Released);
                let held = button.pressed_at.take().map(|start| now - start);
                if button.long_fired {
                    // already classified from tick while held
                    button.clicks = 0;
                    button.window = None;
                    return;
                }
                let Some(held) = held else { return };
                if held >= self.config.lnglngclick_delay {
                    button.clicks = 0;
                    button.window = None;
                    publish(store, button.register, ButtonEvent::LongLongClick);
                }
                else if held >= self.config.lngclick_delay {
                    button.clicks = 0;
                    button.window = None;
                    publish(store, button.register, ButtonEvent::LongClick);
                }
                else {
                    button.clicks += 1;
                    if button.clicks >= 3 {
                        button.clicks = 0;
                        button.window = None;
                        publish(store, button.register, ButtonEvent::TripleClick);
                    }
                    else {
                        button.window = Some(now + self.config.dblclick_delay);
                    }
                }
            }
        }
    }

    /// expire click windows and detect still-held long-long presses
    pub fn tick(&mut self, store: &mut RegisterStore, now: u64) {
        for button in &mut self.buttons {
            if let Some(deadline) = button.window
                && now >= deadline
            {
                let event = match button.clicks {
                    1 => ButtonEvent::Click,
                    2 => ButtonEvent::DoubleClick,
                    _ => ButtonEvent::None,
                };
                button.clicks = 0;
                button.window = None;
                if event != ButtonEvent::None {
                    publish(store, button.register, event);
                }
            }
            if let Some(start) = button.pressed_at
                && !button.long_fired
                && now - start >= self.config.lnglngclick_delay
            {
                button.long_fired = true;
                button.clicks = 0;
                button.window = None;
                publish(store, button.register, ButtonEvent::LongLongClick);
            }
        }
    }
}

fn publish(store: &mut RegisterStore, register: u8, event: ButtonEvent) {
    debug!("button register {} <- {:?}", register, event);
    if let Err(error) = store.write(RegisterKind::AnalogInput, register, Value::Button(event)) {
        warn!("button register {} rejected event: {}", register, error);
    }
}
