/*!
    relay bank

    each relay is bound to one digital-output register: the protocol engine
    (or anything else) writes the commanded status into the register, and the
    bank applies it through its state machine. on/off delays, pulse reverts,
    latching pulses, flood protection and deferred state saves all happen
    here, never by driving the pin directly.
*/

use heapless::Vec;
use log::*;

use crate::config::*;
use crate::io::{DrivePin, Storage};
use crate::registers::{RegisterKind, RegisterStore};
use crate::value::Value;


/// how the pin realizes a status
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RelayType {
    /// pin level follows the status
    Normal,
    /// pin level is the inverted status
    Inverse,
    /// bistable coil, pulsed on every change
    Latched,
    /// bistable coil pulsed with the opposite polarity
    LatchedInverse,
}

/// initial status applied at boot
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootMode {
    Off,
    On,
    /// whatever was persisted before the reboot
    RestoreLast,
    /// inverse of the persisted status
    Toggle,
}

/// automatic return to a resting status after [RelayConfig::pulse_time]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PulseMode {
    /// stays where it was put
    None,
    /// rests off, a turn-on reverts by itself
    NormallyOff,
    /// rests on, a turn-off reverts by itself
    NormallyOn,
}

/// constraint over the statuses of the whole bank
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncMode {
    Any,
    NoneOrOne,
    ExactlyOne,
    Same,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("no relay at this index")]
    NoSuchRelay,
    #[error("requested status violates the bank's sync mode")]
    SyncConflict,
}

/// per-relay settings
#[derive(Copy, Clone, Debug)]
pub struct RelayConfig {
    pub relay_type: RelayType,
    pub boot_mode: BootMode,
    /// digital-output register commanding this relay
    pub register: u8,
    /// persistent-storage key for the last applied status
    pub storage_key: Option<u16>,
    /// delay before applying an off→on change, milliseconds
    pub delay_on: u64,
    /// delay before applying an on→off change, milliseconds
    pub delay_off: u64,
    pub pulse_mode: PulseMode,
    /// time away from the resting status before the automatic revert
    pub pulse_time: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_type: RelayType::Normal,
            boot_mode: BootMode::Off,
            register: 0,
            storage_key: None,
            delay_on: 0,
            delay_off: 0,
            pulse_mode: PulseMode::None,
            pulse_time: RELAY_PULSE_TIME,
        }
    }
}

struct Relay<P> {
    pin: P,
    config: RelayConfig,
    current: bool,
    target: bool,
    /// due time of a scheduled change
    due: Option<u64>,
    /// due time for releasing a latching pulse
    pulse_release: Option<u64>,
    /// due time for a pulse-mode revert to the resting status
    revert_due: Option<u64>,
    /// due time for persisting the current status
    save_due: Option<u64>,
    flood_start: u64,
    flood_count: u8,
}

/// all relays of the node, plus the bank-wide limits
pub struct RelayBank<P> {
    relays: Vec<Relay<P>, MAX_RELAYS>,
    sync: SyncMode,
    /// flood protection window, milliseconds
    pub flood_window: u64,
    /// applied changes allowed per flood window
    pub flood_changes: u8,
    /// latching pulse width, milliseconds
    pub latching_pulse: u64,
    /// quiet time before persisting a status
    pub save_delay: u64,
}

impl<P: DrivePin> RelayBank<P> {
    pub fn new(sync: SyncMode) -> Self {
        Self {
            relays: Vec::new(),
            sync,
            flood_window: RELAY_FLOOD_WINDOW,
            flood_changes: RELAY_FLOOD_CHANGES,
            latching_pulse: RELAY_LATCHING_PULSE,
            save_delay: RELAY_SAVE_DELAY,
        }
    }

    pub fn add(&mut self, pin: P, config: RelayConfig) -> Result<u8, &'static str> {
        let relay = Relay {
            pin,
            config,
            current: false,
            target: false,
            due: None,
            pulse_release: None,
            revert_due: None,
            save_due: None,
            flood_start: 0,
            flood_count: 0,
        };
        if self.relays.push(relay).is_err() {
            return Err("too many relays");
        }
        Ok(self.relays.len() as u8 - 1)
    }

    /// applied (physical) status of a relay
    pub fn status(&self, index: u8) -> Option<bool> {
        self.relays.get(usize::from(index)).map(|relay| relay.current)
    }

    /// apply every relay's boot mode, drive the pins to a known level and
    /// mirror the statuses into the registers
    pub fn boot(&mut self, store: &mut RegisterStore, storage: &mut impl Storage, now: u64) {
        for relay in &mut self.relays {
            let last = last_status(storage, &relay.config);
            let status = match relay.config.boot_mode {
                BootMode::Off => false,
                BootMode::On => true,
                BootMode::RestoreLast => last,
                BootMode::Toggle => !last,
            };
            relay.target = status;
            relay.current = status;
            match relay.config.relay_type {
                RelayType::Normal => relay.pin.drive(status),
                RelayType::Inverse => relay.pin.drive(!status),
                // a single pin cannot aim a bistable coil, leave it idle
                RelayType::Latched => relay.pin.drive(false),
                RelayType::LatchedInverse => relay.pin.drive(true),
            }
            if relay.config.boot_mode == BootMode::Toggle {
                relay.save_due = Some(now + self.save_delay);
            }
            if let Err(error) =
                store.write(RegisterKind::DigitalOutput, relay.config.register, Value::Bool(status))
            {
                warn!("relay register {} unusable: {}", relay.config.register, error);
            }
            info!("relay register {} boots {}", relay.config.register, status);
        }
    }

    /// request a status change directly, bypassing the register
    ///
    /// the register is updated to match, so bus reads stay truthful
    pub fn request(
        &mut self,
        store: &mut RegisterStore,
        index: u8,
        status: bool,
        now: u64,
    ) -> Result<(), RelayError> {
        if usize::from(index) >= self.relays.len() {
            return Err(RelayError::NoSuchRelay);
        }
        if !self.permitted(index, status) {
            return Err(RelayError::SyncConflict);
        }
        let relay = &mut self.relays[usize::from(index)];
        let register = relay.config.register;
        schedule(relay, status, now);
        let _ = store.write(RegisterKind::DigitalOutput, register, Value::Bool(status));
        Ok(())
    }

    /// observe the registers and run every relay's state machine
    pub fn tick(&mut self, store: &mut RegisterStore, storage: &mut impl Storage, now: u64) {
        for index in 0 .. self.relays.len() {
            // pick up commands written into the register by the bus
            let register = self.relays[index].config.register;
            if let Ok(Value::Bool(commanded)) = store.read(RegisterKind::DigitalOutput, register)
                && commanded != self.relays[index].target
            {
                if self.permitted(index as u8, commanded) {
                    schedule(&mut self.relays[index], commanded, now);
                }
                else {
                    warn!("relay register {} change rejected by sync mode", register);
                    let current = self.relays[index].target;
                    let _ = store.write(RegisterKind::DigitalOutput, register, Value::Bool(current));
                }
            }

            let relay = &mut self.relays[index];

            // release a running latching pulse
            if let Some(release) = relay.pulse_release
                && now >= release
            {
                relay.pulse_release = None;
                match relay.config.relay_type {
                    RelayType::Latched => relay.pin.drive(false),
                    RelayType::LatchedInverse => relay.pin.drive(true),
                    _ => {}
                }
            }

            // revert a pulse-mode relay that stayed away from rest long enough
            if let Some(revert) = relay.revert_due
                && now >= revert
            {
                relay.revert_due = None;
                let resting = relay.config.pulse_mode == PulseMode::NormallyOn;
                debug!("relay register {} pulse over, reverting", relay.config.register);
                schedule(relay, resting, now);
                let _ = store.write(
                    RegisterKind::DigitalOutput,
                    relay.config.register,
                    Value::Bool(resting),
                );
            }

            // apply a due change, unless the flood window is exhausted
            if let Some(due) = relay.due
                && now >= due
            {
                if now.saturating_sub(relay.flood_start) >= self.flood_window {
                    relay.flood_count = 0;
                }
                if relay.flood_count >= self.flood_changes {
                    trace!("relay register {} change deferred by flood protection", relay.config.register);
                }
                else {
                    if relay.flood_count == 0 {
                        relay.flood_start = now;
                    }
                    relay.flood_count += 1;
                    relay.due = None;
                    relay.current = relay.target;
                    debug!("relay register {} -> {}", relay.config.register, relay.current);
                    match relay.config.relay_type {
                        RelayType::Normal => relay.pin.drive(relay.current),
                        RelayType::Inverse => relay.pin.drive(!relay.current),
                        RelayType::Latched => {
                            relay.pin.drive(true);
                            relay.pulse_release = Some(now + self.latching_pulse);
                        }
                        RelayType::LatchedInverse => {
                            relay.pin.drive(false);
                            relay.pulse_release = Some(now + self.latching_pulse);
                        }
                    }
                    relay.revert_due = match relay.config.pulse_mode {
                        PulseMode::NormallyOff if relay.current => {
                            Some(now + relay.config.pulse_time)
                        }
                        PulseMode::NormallyOn if !relay.current => {
                            Some(now + relay.config.pulse_time)
                        }
                        _ => None,
                    };
                    if relay.config.storage_key.is_some() {
                        relay.save_due = Some(now + self.save_delay);
                    }
                }
            }

            // persist once the status stayed quiet long enough
            if let Some(save) = relay.save_due
                && now >= save
            {
                relay.save_due = None;
                if let Some(key) = relay.config.storage_key {
                    storage.write(key, &[relay.current as u8]);
                    debug!("relay register {} status persisted", relay.config.register);
                }
            }
        }
    }

    /// check a proposed status against the bank's sync mode
    fn permitted(&self, index: u8, status: bool) -> bool {
        let proposed = |i: usize| {
            if i == usize::from(index) { status } else { self.relays[i].target }
        };
        let on = (0 .. self.relays.len()).filter(|&i| proposed(i)).count();
        match self.sync {
            SyncMode::Any => true,
            SyncMode::NoneOrOne => on <= 1,
            SyncMode::ExactlyOne => on == 1,
            SyncMode::Same => on == 0 || on == self.relays.len(),
        }
    }
}

/// state machine entry: a request equal to the applied status collapses to a
/// no-op and cancels any pending change
fn schedule<P>(relay: &mut Relay<P>, status: bool, now: u64) {
    relay.target = status;
    if status == relay.current {
        relay.due = None;
        return;
    }
    let delay = if status { relay.config.delay_on } else { relay.config.delay_off };
    relay.due = Some(now + delay);
}

fn last_status(storage: &mut impl Storage, config: &RelayConfig) -> bool {
    let Some(key) = config.storage_key else { return false };
    let mut value = [0];
    match storage.read(key, &mut value) {
        Some(length) if length >= 1 => value[0] != 0,
        _ => false,
    }
}
