/*!
    firmware core for a bus-connected I/O slave node

    the crate contains everything between the UART and the pins: the frame
    codec, the addressing/dispatch engine, the typed register store and the
    relay/button/LED state machines. the board support layer supplies the
    transport, the persistent store and the pins through the traits in [io],
    and drives everything from one cooperative loop:

    ```ignore
    loop {
        let now = clock.millis();
        node.tick(&mut storage, now)?;
        relays.tick(node.registers_mut(), &mut storage, now);
        buttons.tick(node.registers_mut(), now);
        subscriptions.run(node.registers_mut());
        leds.tick(node.link(), now);
    }
    ```
*/
#![no_std]
#[cfg(any(feature = "std", test))]
extern crate std;

mod utils;

pub mod config;
pub mod io;
pub mod value;
pub mod registers;
pub mod packet;
pub mod profile;
pub mod node;
pub mod relay;
pub mod button;
pub mod led;
pub mod pubsub;

pub use io::{BusChannel, DrivePin, Storage};
pub use value::{DataType, Value};
pub use registers::{RegisterError, RegisterKind, RegisterStore};
pub use profile::{PacketKind, Profile};
pub use node::{DeviceState, Identity, LinkStatus, Node, NodeConfig, StatusCode};
