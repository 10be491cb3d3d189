/*!
    the protocol engine

    owns the bus addressing lifecycle and the request dispatch of one slave
    node. everything is driven from [Node::tick]: received frames are decoded,
    filtered by address, dispatched to the register store, and answered in the
    same pass; addressing deadlines are checked with the same `now`.

    the engine never talks to pins: output writes land in the register store,
    where the relay bank picks them up on its own tick.
*/

use bilge::prelude::*;
use heapless::Vec;
use log::*;
use packbytes::FromBytes;
use rand::{Rng, SeedableRng, rngs::SmallRng};

use crate::config::{ADDRESSING_TIMEOUT, MAX_FRAME};
use crate::io::{BusChannel, Storage};
use crate::packet::{self, MAX_PAYLOAD};
use crate::profile::{PacketKind, Profile};
use crate::registers::{RegisterError, RegisterKind, RegisterStore};
use crate::value::{DataType, Value};


/// lifecycle state reported to the master
#[bitsize(8)]
#[derive(Copy, Clone, Default, FromBits, Debug, PartialEq, Eq)]
pub enum DeviceState {
    #[default]
    #[fallback]
    Unknown = 0,
    Running = 1,
    Stopped = 2,
    /// still acquiring a bus address
    Pairing = 3,
    Error = 4,
    StoppedByOperator = 5,
}

/// per-operation result byte carried in write responses
#[bitsize(8)]
#[derive(Copy, Clone, Default, FromBits, Debug, PartialEq, Eq)]
pub enum StatusCode {
    #[default]
    Ok = 0,
    OutOfRange = 1,
    TypeMismatch = 2,
    SizeMismatch = 3,
    InvalidRange = 4,
    NotSettable = 5,
    /// device is stopped, writes refused
    NotRunning = 6,

    #[fallback]
    Unknown = 255,
}

impl From<RegisterError> for StatusCode {
    fn from(error: RegisterError) -> Self {
        match error {
            RegisterError::OutOfRange => Self::OutOfRange,
            RegisterError::TypeMismatch => Self::TypeMismatch,
            RegisterError::SizeMismatch => Self::SizeMismatch,
            RegisterError::TableFull | RegisterError::Unsupported => Self::Unknown,
        }
    }
}

/// static description of the node, served one field per describe request
#[derive(Copy, Clone, Debug)]
pub struct Identity {
    pub serial: &'static str,
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub hardware_version: &'static str,
    pub firmware_version: &'static str,
}

#[derive(Copy, Clone, Debug)]
pub struct NodeConfig {
    /// time between address request retries, jitter on top
    pub addressing_timeout: u64,
    /// persist the acquired address across reboots
    pub store_address: bool,
    /// storage key holding the persisted address
    pub address_key: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            addressing_timeout: ADDRESSING_TIMEOUT,
            store_address: true,
            address_key: 0,
        }
    }
}

/// snapshot of the link for status LEDs
#[derive(Copy, Clone, Debug)]
pub struct LinkStatus {
    pub addressed: bool,
    /// timestamp of the last frame concerning this node
    pub last_activity: Option<u64>,
}

enum Addressing {
    Unaddressed { retry_at: u64 },
    Requesting { deadline: u64 },
    Addressed { address: u8 },
}

/// a slave node on the bus
pub struct Node<B> {
    bus: B,
    profile: Profile,
    identity: Identity,
    config: NodeConfig,
    registers: RegisterStore,
    /// state commanded by the master, [DeviceState::Pairing] is derived
    state: DeviceState,
    addressing: Addressing,
    rng: SmallRng,
    last_activity: Option<u64>,
    receive: [u8; MAX_FRAME],
    send: [u8; MAX_FRAME],
}

// payload pieces, see the dispatch arms for their framing
#[derive(Copy, Clone, FromBytes)]
struct RangeQuery {
    start: u8,
    count: u8,
}
#[derive(Copy, Clone, FromBytes)]
struct DigitalWrite {
    index: u8,
    value: u8,
}
#[derive(Copy, Clone, FromBytes)]
struct AnalogWrite {
    index: u8,
    ty: DataType,
    value: [u8; 4],
}

impl<B: BusChannel> Node<B> {
    /// `seed` feeds the retry jitter, any per-device value does (serial hash,
    /// adc noise, ...)
    pub fn new(
        bus: B,
        profile: Profile,
        identity: Identity,
        config: NodeConfig,
        registers: RegisterStore,
        seed: u64,
    ) -> Self {
        Self {
            bus,
            profile,
            identity,
            config,
            registers,
            state: DeviceState::Running,
            addressing: Addressing::Unaddressed { retry_at: 0 },
            rng: SmallRng::seed_from_u64(seed),
            last_activity: None,
            receive: [0; MAX_FRAME],
            send: [0; MAX_FRAME],
        }
    }

    pub fn registers(&self) -> &RegisterStore {
        &self.registers
    }
    pub fn registers_mut(&mut self) -> &mut RegisterStore {
        &mut self.registers
    }

    /// assigned bus address, `None` until confirmed by the master
    pub fn address(&self) -> Option<u8> {
        match self.addressing {
            Addressing::Addressed { address } => Some(address),
            _ => None,
        }
    }

    pub fn device_state(&self) -> DeviceState {
        if self.address().is_none() { DeviceState::Pairing } else { self.state }
    }

    pub fn link(&self) -> LinkStatus {
        LinkStatus {
            addressed: self.address().is_some(),
            last_activity: self.last_activity,
        }
    }

    /// restore a persisted address and announce the node on the bus
    pub fn boot(&mut self, storage: &mut impl Storage, now: u64) -> Result<(), B::Error> {
        if self.config.store_address {
            let mut value = [0];
            if let Some(length) = storage.read(self.config.address_key, &mut value)
                && length >= 1
                && self.plausible_address(value[0])
            {
                info!("restored bus address {}", value[0]);
                self.addressing = Addressing::Addressed { address: value[0] };
                let mut payload = Vec::<u8, MAX_PAYLOAD>::new();
                let _ = payload.push(value[0]);
                let _ = payload.extend_from_slice(self.identity.serial.as_bytes());
                return self.respond(self.profile.gateway, PacketKind::Hello, &payload);
            }
        }
        self.addressing = Addressing::Unaddressed { retry_at: now };
        Ok(())
    }

    /// service the bus: decode and dispatch everything received, then run
    /// the addressing timers
    pub fn tick(&mut self, storage: &mut impl Storage, now: u64) -> Result<(), B::Error> {
        loop {
            let Some(length) = self.bus.receive(&mut self.receive)? else { break };
            if length > MAX_FRAME {
                debug!("oversized frame, dropped");
                continue;
            }
            // frames are small, a copy frees the receive buffer for dispatch
            let mut raw = [0; MAX_FRAME];
            raw[.. length].copy_from_slice(&self.receive[.. length]);
            self.handle(storage, &raw[.. length], now)?;
        }
        self.addressing_tick(now)
    }

    fn handle(&mut self, storage: &mut impl Storage, raw: &[u8], now: u64) -> Result<(), B::Error> {
        let Some(frame) = packet::decode(&self.profile, raw) else { return Ok(()) };

        let to_me = self.address() == Some(frame.receiver);
        let broadcast = frame.receiver == self.profile.broadcast;
        let to_unassigned = frame.receiver == self.profile.unassigned && self.address().is_none();
        if !(to_me || broadcast || to_unassigned) {
            trace!("frame for {} ignored", frame.receiver);
            return Ok(());
        }
        self.last_activity = Some(now);
        debug!("dispatching {:?} from {}", frame.kind, frame.sender);

        let sender = frame.sender;
        let payload = frame.payload;
        match frame.kind {
            // ---- addressing lifecycle, served in any state ----
            PacketKind::AddressConfirm => self.on_confirm(storage, payload),
            PacketKind::AddressNegate => {
                if to_me {
                    info!("bus address discarded by master");
                    self.discard_address(storage, now);
                }
                Ok(())
            }
            PacketKind::AddressRefresh if to_me => {
                self.respond_with_address(sender, PacketKind::AddressRefresh)
            }
            PacketKind::AddressList => {
                if self.address().is_some() {
                    self.respond_with_address(sender, PacketKind::AddressList)
                } else {
                    Ok(())
                }
            }

            // ---- everything else requires an address and a direct frame ----
            _ if !to_me => Ok(()),

            PacketKind::DescribeSerial => {
                self.respond(sender, frame.kind, self.identity.serial.as_bytes())
            }
            PacketKind::DescribeManufacturer => {
                self.respond(sender, frame.kind, self.identity.manufacturer.as_bytes())
            }
            PacketKind::DescribeModel => {
                self.respond(sender, frame.kind, self.identity.model.as_bytes())
            }
            PacketKind::DescribeHardwareVersion => {
                self.respond(sender, frame.kind, self.identity.hardware_version.as_bytes())
            }
            PacketKind::DescribeFirmwareVersion => {
                self.respond(sender, frame.kind, self.identity.firmware_version.as_bytes())
            }
            PacketKind::DescribeRegisterSizes => {
                let sizes = [
                    self.registers.size(RegisterKind::DigitalInput),
                    self.registers.size(RegisterKind::DigitalOutput),
                    self.registers.size(RegisterKind::AnalogInput),
                    self.registers.size(RegisterKind::AnalogOutput),
                    self.registers.size(RegisterKind::Attribute),
                ];
                self.respond(sender, frame.kind, &sizes)
            }
            PacketKind::SetState => {
                let &[byte] = payload else {
                    debug!("malformed state command, dropped");
                    return Ok(());
                };
                let state = DeviceState::from(byte);
                match state {
                    DeviceState::Running
                    | DeviceState::Stopped
                    | DeviceState::StoppedByOperator
                    | DeviceState::Error => {
                        info!("device state commanded to {:?}", state);
                        self.state = state;
                        self.respond(sender, frame.kind, &[byte])
                    }
                    _ => {
                        debug!("unknown state command {}, dropped", byte);
                        Ok(())
                    }
                }
            }
            PacketKind::Ping => {
                self.respond(sender, PacketKind::Pong, &[u8::from(self.device_state())])
            }

            PacketKind::ReadDigitalInputs => self.read_registers(sender, frame.kind, RegisterKind::DigitalInput, payload),
            PacketKind::ReadDigitalOutputs => self.read_registers(sender, frame.kind, RegisterKind::DigitalOutput, payload),
            PacketKind::ReadAnalogInputs => self.read_registers(sender, frame.kind, RegisterKind::AnalogInput, payload),
            PacketKind::ReadAnalogOutputs => self.read_registers(sender, frame.kind, RegisterKind::AnalogOutput, payload),
            PacketKind::ReadAttributes => self.read_registers(sender, frame.kind, RegisterKind::Attribute, payload),

            PacketKind::WriteDigitalOutput => self.write_digital(sender, payload),
            PacketKind::WriteAnalogOutput => self.write_analog(storage, sender, PacketKind::WriteAnalogOutput, payload),
            PacketKind::WriteAttribute => self.write_analog(storage, sender, PacketKind::WriteAttribute, payload),
            PacketKind::WriteMultiDigitalOutputs => self.write_multi_digital(sender, payload),
            PacketKind::WriteMultiAnalogOutputs => self.write_multi_analog(sender, payload),

            // master-side kinds, nothing for a slave to do
            PacketKind::AddressRequest
            | PacketKind::AddressRefresh
            | PacketKind::Pong
            | PacketKind::Hello => Ok(()),
        }
    }

    // ---- addressing ----

    fn on_confirm(&mut self, storage: &mut impl Storage, payload: &[u8]) -> Result<(), B::Error> {
        let Some((&address, serial)) = payload.split_first() else {
            debug!("malformed address confirm, dropped");
            return Ok(());
        };
        if serial != self.identity.serial.as_bytes() {
            trace!("address confirm for another node");
            return Ok(());
        }
        if !self.plausible_address(address) {
            debug!("refusing reserved address {}", address);
            return Ok(());
        }
        match self.addressing {
            Addressing::Addressed { address: held } if held != address => {
                // first confirm wins until discarded
                debug!("ignoring confirm for {} while holding {}", address, held);
            }
            Addressing::Addressed { .. } => {}
            _ => {
                info!("assigned bus address {}", address);
                self.addressing = Addressing::Addressed { address };
                if self.config.store_address {
                    storage.write(self.config.address_key, &[address]);
                }
            }
        }
        Ok(())
    }

    fn discard_address(&mut self, storage: &mut impl Storage, now: u64) {
        self.addressing = Addressing::Unaddressed { retry_at: now + self.jitter() };
        if self.config.store_address {
            storage.write(self.config.address_key, &[]);
        }
    }

    fn addressing_tick(&mut self, now: u64) -> Result<(), B::Error> {
        match self.addressing {
            Addressing::Unaddressed { retry_at } if now >= retry_at => self.request_address(now),
            Addressing::Requesting { deadline } if now >= deadline => {
                debug!("address request timed out, retrying");
                self.request_address(now)
            }
            _ => Ok(()),
        }
    }

    fn request_address(&mut self, now: u64) -> Result<(), B::Error> {
        info!("requesting bus address");
        self.addressing = Addressing::Requesting {
            deadline: now + self.config.addressing_timeout + self.jitter(),
        };
        let serial = self.identity.serial;
        self.respond(self.profile.gateway, PacketKind::AddressRequest, serial.as_bytes())
    }

    fn respond_with_address(&mut self, receiver: u8, kind: PacketKind) -> Result<(), B::Error> {
        let Some(address) = self.address() else { return Ok(()) };
        let mut payload = Vec::<u8, MAX_PAYLOAD>::new();
        let _ = payload.push(address);
        let _ = payload.extend_from_slice(self.identity.serial.as_bytes());
        self.respond(receiver, kind, &payload)
    }

    fn plausible_address(&self, address: u8) -> bool {
        address != self.profile.broadcast
            && address != self.profile.gateway
            && address != self.profile.unassigned
    }

    fn jitter(&mut self) -> u64 {
        self.rng.random_range(0 ..= self.config.addressing_timeout / 4)
    }

    // ---- register access ----

    fn read_registers(
        &mut self,
        receiver: u8,
        kind: PacketKind,
        table: RegisterKind,
        payload: &[u8],
    ) -> Result<(), B::Error> {
        let Ok(bytes) = payload.try_into() else {
            debug!("malformed read query, dropped");
            return Ok(());
        };
        let query = RangeQuery::from_be_bytes(bytes);

        let entry = match table {
            RegisterKind::DigitalInput | RegisterKind::DigitalOutput => 1,
            RegisterKind::AnalogInput | RegisterKind::AnalogOutput => 5,
            RegisterKind::Attribute => 6,
        };
        let size = self.registers.size(table);
        let fits = ((MAX_PAYLOAD - 2) / entry) as u8;
        let actual = query.count.min(size.saturating_sub(query.start)).min(fits);
        if actual < query.count {
            // reported through truncation, the valid prefix still goes out
            debug!(
                "read range {}+{} exceeds {:?} table of {}",
                query.start, query.count, table, size,
            );
        }

        let mut reply = Vec::<u8, MAX_PAYLOAD>::new();
        let _ = reply.push(query.start);
        let _ = reply.push(actual);
        for index in query.start .. query.start + actual {
            match table {
                RegisterKind::DigitalInput | RegisterKind::DigitalOutput => {
                    let status = match self.registers.read(table, index) {
                        Ok(Value::Bool(status)) => status,
                        _ => false,
                    };
                    let _ = reply.push(status as u8);
                }
                _ => {
                    let Ok((ty, bytes)) = self.registers.read_bytes(table, index) else {
                        continue;
                    };
                    let _ = reply.push(u8::from(ty));
                    if table == RegisterKind::Attribute {
                        let settable = self.registers.attribute_settable(index).unwrap_or(false);
                        let _ = reply.push(settable as u8);
                    }
                    let _ = reply.extend_from_slice(bytes);
                    for _ in bytes.len() .. 4 {
                        let _ = reply.push(0);
                    }
                }
            }
        }
        self.respond(receiver, kind, &reply)
    }

    fn write_digital(&mut self, receiver: u8, payload: &[u8]) -> Result<(), B::Error> {
        let Ok(bytes) = payload.try_into() else {
            debug!("malformed digital write, dropped");
            return Ok(());
        };
        let write = DigitalWrite::from_be_bytes(bytes);
        let status = self.apply_digital(write);
        let applied = match self.registers.read(RegisterKind::DigitalOutput, write.index) {
            Ok(Value::Bool(status)) => status as u8,
            _ => 0,
        };
        self.respond(
            receiver,
            PacketKind::WriteDigitalOutput,
            &[write.index, u8::from(status), applied],
        )
    }

    fn write_multi_digital(&mut self, receiver: u8, payload: &[u8]) -> Result<(), B::Error> {
        let Some((&count, entries)) = payload.split_first() else {
            debug!("malformed multi write, dropped");
            return Ok(());
        };
        if entries.len() != usize::from(count) * 2 {
            debug!("multi write length disagrees with count, dropped");
            return Ok(());
        }
        let mut applied = 0u8;
        let mut failed = Vec::<u8, MAX_PAYLOAD>::new();
        for chunk in entries.chunks_exact(2) {
            let write = DigitalWrite::from_be_bytes(chunk.try_into().unwrap());
            // partial-failure semantics: a bad entry fails alone
            if self.apply_digital(write) == StatusCode::Ok {
                applied += 1;
            } else {
                let _ = failed.push(write.index);
            }
        }
        self.respond_multi(receiver, PacketKind::WriteMultiDigitalOutputs, applied, &failed)
    }

    fn write_multi_analog(&mut self, receiver: u8, payload: &[u8]) -> Result<(), B::Error> {
        let Some((&count, entries)) = payload.split_first() else {
            debug!("malformed multi write, dropped");
            return Ok(());
        };
        if entries.len() != usize::from(count) * 6 {
            debug!("multi write length disagrees with count, dropped");
            return Ok(());
        }
        let mut applied = 0u8;
        let mut failed = Vec::<u8, MAX_PAYLOAD>::new();
        for chunk in entries.chunks_exact(6) {
            let write = AnalogWrite::from_be_bytes(chunk.try_into().unwrap());
            if self.apply_analog(RegisterKind::AnalogOutput, write) == StatusCode::Ok {
                applied += 1;
            } else {
                let _ = failed.push(write.index);
            }
        }
        self.respond_multi(receiver, PacketKind::WriteMultiAnalogOutputs, applied, &failed)
    }

    fn write_analog(
        &mut self,
        storage: &mut impl Storage,
        receiver: u8,
        kind: PacketKind,
        payload: &[u8],
    ) -> Result<(), B::Error> {
        let Ok(bytes) = payload.try_into() else {
            debug!("malformed analog write, dropped");
            return Ok(());
        };
        let write = AnalogWrite::from_be_bytes(bytes);
        let table = match kind {
            PacketKind::WriteAttribute => RegisterKind::Attribute,
            _ => RegisterKind::AnalogOutput,
        };
        let status = match (kind, self.registers.attribute_settable(write.index)) {
            // attributes must be settable, other tables always accept
            (PacketKind::WriteAttribute, Ok(false)) => StatusCode::NotSettable,
            (PacketKind::WriteAttribute, Err(error)) => error.into(),
            _ => self.apply_analog(table, write),
        };
        if status == StatusCode::Ok
            && kind == PacketKind::WriteAttribute
            && let Ok(Some(key)) = self.registers.attribute_key(write.index)
        {
            let width = write.ty.width().unwrap_or(0);
            storage.write(key, &write.value[.. width]);
        }

        let mut reply = Vec::<u8, MAX_PAYLOAD>::new();
        let _ = reply.push(write.index);
        let _ = reply.push(u8::from(status));
        match self.registers.read_bytes(table, write.index) {
            Ok((ty, bytes)) => {
                let _ = reply.push(u8::from(ty));
                let _ = reply.extend_from_slice(bytes);
                for _ in bytes.len() .. 4 {
                    let _ = reply.push(0);
                }
            }
            Err(_) => {
                let _ = reply.extend_from_slice(&[0; 5]);
            }
        }
        self.respond(receiver, kind, &reply)
    }

    fn apply_digital(&mut self, write: DigitalWrite) -> StatusCode {
        if self.device_state() != DeviceState::Running {
            return StatusCode::NotRunning;
        }
        match self.registers.write(
            RegisterKind::DigitalOutput,
            write.index,
            Value::Bool(write.value != 0),
        ) {
            Ok(()) => StatusCode::Ok,
            Err(error) => error.into(),
        }
    }

    fn apply_analog(&mut self, table: RegisterKind, write: AnalogWrite) -> StatusCode {
        if self.device_state() != DeviceState::Running {
            return StatusCode::NotRunning;
        }
        // an unstorable type tag can never match a slot's type
        let width = write.ty.width().unwrap_or(4);
        match self.registers.write_bytes(table, write.index, write.ty, &write.value[.. width]) {
            Ok(()) => StatusCode::Ok,
            Err(error) => error.into(),
        }
    }

    fn respond_multi(
        &mut self,
        receiver: u8,
        kind: PacketKind,
        applied: u8,
        failed: &[u8],
    ) -> Result<(), B::Error> {
        let mut reply = Vec::<u8, MAX_PAYLOAD>::new();
        let _ = reply.push(applied);
        let _ = reply.push(failed.len() as u8);
        let _ = reply.extend_from_slice(failed);
        self.respond(receiver, kind, &reply)
    }

    fn respond(&mut self, receiver: u8, kind: PacketKind, payload: &[u8]) -> Result<(), B::Error> {
        let sender = self.address().unwrap_or(self.profile.unassigned);
        let Some(length) =
            packet::encode(&self.profile, sender, receiver, kind, payload, &mut self.send)
        else {
            return Ok(());
        };
        self.bus.send(&self.send[.. length])
    }
}
