/*!
    status LEDs

    LEDs render the node's link status: fast blink while the node is still
    hunting for an address, a short flash on traffic once addressed. pure
    function of (mode, link snapshot, time), so the bank stays testable
    without a clock.
*/

use heapless::Vec;

use crate::config::*;
use crate::io::DrivePin;
use crate::node::LinkStatus;


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LedMode {
    /// blink while unaddressed, flash on traffic once addressed
    Bus,
    /// slow identification blink
    FindMe,
    /// FindMe while unaddressed, Bus behavior once addressed
    FindMeBus,
    On,
    Off,
}

#[derive(Copy, Clone, Debug)]
pub struct LedConfig {
    pub mode: LedMode,
    /// pin level is inverted (LED wired to vcc)
    pub inverse: bool,
}

struct Led<P> {
    pin: P,
    config: LedConfig,
    lit: Option<bool>,
}

/// all status LEDs of the node
pub struct LedBank<P> {
    leds: Vec<Led<P>, MAX_LEDS>,
}

impl<P: DrivePin> LedBank<P> {
    pub fn new() -> Self {
        Self { leds: Vec::new() }
    }

    pub fn add(&mut self, pin: P, config: LedConfig) -> Result<u8, &'static str> {
        if self.leds.push(Led { pin, config, lit: None }).is_err() {
            return Err("too many leds");
        }
        Ok(self.leds.len() as u8 - 1)
    }

    pub fn tick(&mut self, link: LinkStatus, now: u64) {
        for led in &mut self.leds {
            let lit = match led.config.mode {
                LedMode::On => true,
                LedMode::Off => false,
                LedMode::FindMe => blink(now, LED_FINDME_BLINK),
                LedMode::Bus => bus_pattern(link, now),
                LedMode::FindMeBus => {
                    if link.addressed { bus_pattern(link, now) } else { blink(now, LED_FINDME_BLINK) }
                }
            };
            // only touch the pin on actual changes
            if led.lit != Some(lit) {
                led.lit = Some(lit);
                led.pin.drive(lit != led.config.inverse);
            }
        }
    }
}

impl<P: DrivePin> Default for LedBank<P> {
    fn default() -> Self {
        Self::new()
    }
}

fn bus_pattern(link: LinkStatus, now: u64) -> bool {
    if !link.addressed {
        return blink(now, LED_BUS_BLINK);
    }
    match link.last_activity {
        Some(at) => now.saturating_sub(at) < LED_ACTIVITY_FLASH,
        None => false,
    }
}

fn blink(now: u64, period: u64) -> bool {
    (now / period) % 2 == 0
}
