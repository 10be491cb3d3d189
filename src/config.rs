/*!
    capacities and timing defaults

    capacities bound memory at compile time, actual table sizes are chosen at
    startup and never grow. timings are defaults only, every driver config
    can override them.
*/

/// largest frame on the wire, header and checksum included
pub const MAX_FRAME: usize = 80;

/// register table capacities, per kind
pub const MAX_DIGITAL_INPUTS: usize = 16;
pub const MAX_DIGITAL_OUTPUTS: usize = 16;
pub const MAX_ANALOG_INPUTS: usize = 16;
pub const MAX_ANALOG_OUTPUTS: usize = 16;
pub const MAX_ATTRIBUTES: usize = 16;

/// driver bank capacities
pub const MAX_RELAYS: usize = 8;
pub const MAX_BUTTONS: usize = 8;
pub const MAX_LEDS: usize = 8;

/// pub/sub capacities
pub const MAX_SUBSCRIPTIONS: usize = 8;
pub const MAX_CONDITIONS: usize = 4;
pub const MAX_ACTIONS: usize = 4;

/// time between address request retries, jitter comes on top
pub const ADDRESSING_TIMEOUT: u64 = 4000;

/// time to wait for a second (or third) click
pub const BUTTON_DBLCLICK_DELAY: u64 = 500;
/// holding the button down this long gives a long click
pub const BUTTON_LNGCLICK_DELAY: u64 = 1000;
/// holding the button down this long gives a long-long click
pub const BUTTON_LNGLNGCLICK_DELAY: u64 = 5000;

/// sliding window for relay flood protection
pub const RELAY_FLOOD_WINDOW: u64 = 3000;
/// applied changes allowed inside one flood window
pub const RELAY_FLOOD_CHANGES: u8 = 5;
/// pulse width for a latched relay
pub const RELAY_LATCHING_PULSE: u64 = 10;
/// time a pulse-mode relay may stay away from its resting status
pub const RELAY_PULSE_TIME: u64 = 1000;
/// do not persist relay state before this much quiet time
pub const RELAY_SAVE_DELAY: u64 = 1000;

/// LED blink periods
pub const LED_BUS_BLINK: u64 = 100;
pub const LED_FINDME_BLINK: u64 = 500;
/// how long the bus LED stays lit after a frame for this node
pub const LED_ACTIVITY_FLASH: u64 = 50;
