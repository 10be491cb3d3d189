/*!
    interfaces to the board support layer

    the core never owns hardware. the UART (or any framed transport), the
    persistent store and the output pins are supplied through these traits
    and driven from the board's own loop.
*/

/// non-blocking frame transport, one frame per call
pub trait BusChannel {
    type Error;

    /// queue a complete frame for transmission
    fn send(&mut self, frame: &[u8]) -> Result<(), Self::Error>;
    /// fetch the next received frame if any, returning its length
    fn receive(&mut self, frame: &mut [u8]) -> Result<Option<usize>, Self::Error>;
}

/// key-addressed persistent byte store (eeprom, flash page, ...)
///
/// treated as unreliable but synchronous: a read may come back empty after
/// power loss, a write takes effect before the call returns
pub trait Storage {
    /// read the value stored under `key` into `value`, returning the stored length
    fn read(&mut self, key: u16, value: &mut [u8]) -> Option<usize>;
    /// store `value` under `key`, replacing any previous value
    fn write(&mut self, key: u16, value: &[u8]);
}

/// one output pin, as seen by relays and LEDs
pub trait DrivePin {
    fn drive(&mut self, level: bool);
}

impl<T: DrivePin> DrivePin for &mut T {
    fn drive(&mut self, level: bool) {
        (**self).drive(level)
    }
}
