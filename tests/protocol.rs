/*!
    end-to-end protocol tests: a scripted master exchanges frames with a
    [Node] over an in-memory bus
*/

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::rc::Rc;

use busnode::config::MAX_FRAME;
use busnode::packet;
use busnode::{
    BusChannel, DataType, DeviceState, Identity, Node, NodeConfig, PacketKind, Profile,
    RegisterKind, RegisterStore, StatusCode, Storage, Value,
};


const IDENTITY: Identity = Identity {
    serial: "SN-0001",
    manufacturer: "acme",
    model: "io-8",
    hardware_version: "1.0",
    firmware_version: "0.1.0",
};
const ADDRESS: u8 = 7;

#[derive(Default)]
struct BusState {
    inbox: VecDeque<Vec<u8>>,
    outbox: VecDeque<Vec<u8>>,
}

/// both ends of an in-memory bus; the node owns one clone, the master the other
#[derive(Clone, Default)]
struct MockBus(Rc<RefCell<BusState>>);

impl BusChannel for MockBus {
    type Error = Infallible;

    fn send(&mut self, frame: &[u8]) -> Result<(), Infallible> {
        self.0.borrow_mut().outbox.push_back(frame.to_vec());
        Ok(())
    }
    fn receive(&mut self, frame: &mut [u8]) -> Result<Option<usize>, Infallible> {
        match self.0.borrow_mut().inbox.pop_front() {
            Some(raw) => {
                frame[.. raw.len()].copy_from_slice(&raw);
                Ok(Some(raw.len()))
            }
            None => Ok(None),
        }
    }
}

#[derive(Default)]
struct MemStorage(HashMap<u16, Vec<u8>>);

impl Storage for MemStorage {
    fn read(&mut self, key: u16, value: &mut [u8]) -> Option<usize> {
        let stored = self.0.get(&key)?;
        let length = stored.len().min(value.len());
        value[.. length].copy_from_slice(&stored[.. length]);
        Some(stored.len())
    }
    fn write(&mut self, key: u16, value: &[u8]) {
        self.0.insert(key, value.to_vec());
    }
}

struct Response {
    sender: u8,
    receiver: u8,
    kind: PacketKind,
    payload: Vec<u8>,
}

/// the scripted master side of the exchange
struct Master {
    profile: Profile,
    bus: MockBus,
}

impl Master {
    fn send(&self, receiver: u8, kind: PacketKind, payload: &[u8]) {
        let mut wire = [0; MAX_FRAME];
        let length = packet::encode(
            &self.profile,
            self.profile.gateway,
            receiver,
            kind,
            payload,
            &mut wire,
        )
        .unwrap();
        self.bus.0.borrow_mut().inbox.push_back(wire[.. length].to_vec());
    }

    fn inject_raw(&self, raw: &[u8]) {
        self.bus.0.borrow_mut().inbox.push_back(raw.to_vec());
    }

    fn take(&self) -> Option<Response> {
        let raw = self.bus.0.borrow_mut().outbox.pop_front()?;
        let frame = packet::decode(&self.profile, &raw).expect("node sent an undecodable frame");
        Some(Response {
            sender: frame.sender,
            receiver: frame.receiver,
            kind: frame.kind,
            payload: frame.payload.to_vec(),
        })
    }
}

/// a node with 2 DI, 2 DO, 1 AI (button-less U16 here), 2 AO, 2 attributes
fn setup(profile: Profile) -> (Node<MockBus>, Master, MemStorage) {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut registers = RegisterStore::new();
    registers.add_digital_input().unwrap();
    registers.add_digital_input().unwrap();
    registers.add_digital_output().unwrap();
    registers.add_digital_output().unwrap();
    registers.add_analog_input(DataType::U16).unwrap();
    registers.add_analog_output(DataType::U16).unwrap();
    registers.add_analog_output(DataType::F32).unwrap();
    registers.add_attribute(DataType::U8, true, Some(0x10)).unwrap();
    registers.add_attribute(DataType::U32, false, None).unwrap();

    let bus = MockBus::default();
    let master = Master { profile: profile.clone(), bus: bus.clone() };
    let node = Node::new(bus, profile, IDENTITY, NodeConfig::default(), registers, 42);
    (node, master, MemStorage::default())
}

/// run the addressing handshake up to a confirmed address
fn pair(node: &mut Node<MockBus>, master: &Master, storage: &mut MemStorage) {
    node.tick(storage, 0).unwrap();
    let request = master.take().expect("no address request on first tick");
    assert_eq!(request.kind, PacketKind::AddressRequest);
    assert_eq!(request.sender, master.profile.unassigned);
    assert_eq!(request.payload, IDENTITY.serial.as_bytes());

    let mut confirm = vec![ADDRESS];
    confirm.extend_from_slice(IDENTITY.serial.as_bytes());
    master.send(master.profile.unassigned, PacketKind::AddressConfirm, &confirm);
    node.tick(storage, 10).unwrap();
    assert_eq!(node.address(), Some(ADDRESS));
}


#[test]
fn pairs_and_answers_ping() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    assert_eq!(node.device_state(), DeviceState::Pairing);
    pair(&mut node, &master, &mut storage);
    assert_eq!(node.device_state(), DeviceState::Running);

    master.send(ADDRESS, PacketKind::Ping, &[]);
    node.tick(&mut storage, 20).unwrap();
    let pong = master.take().unwrap();
    assert_eq!(pong.kind, PacketKind::Pong);
    assert_eq!(pong.sender, ADDRESS);
    assert_eq!(pong.receiver, master.profile.gateway);
    assert_eq!(pong.payload, [u8::from(DeviceState::Running)]);
}

#[test]
fn first_confirm_wins() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    pair(&mut node, &master, &mut storage);

    let mut confirm = vec![9];
    confirm.extend_from_slice(IDENTITY.serial.as_bytes());
    master.send(master.profile.broadcast, PacketKind::AddressConfirm, &confirm);
    node.tick(&mut storage, 20).unwrap();
    assert_eq!(node.address(), Some(ADDRESS));
}

#[test]
fn confirm_for_another_serial_is_ignored() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    node.tick(&mut storage, 0).unwrap();
    master.take().unwrap();

    let mut confirm = vec![ADDRESS];
    confirm.extend_from_slice(b"SN-9999");
    master.send(master.profile.unassigned, PacketKind::AddressConfirm, &confirm);
    node.tick(&mut storage, 10).unwrap();
    assert_eq!(node.address(), None);
}

#[test]
fn negate_discards_the_address_and_restarts_pairing() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    pair(&mut node, &master, &mut storage);
    assert_eq!(storage.0.get(&0).map(Vec::as_slice), Some(&[ADDRESS][..]));

    master.send(ADDRESS, PacketKind::AddressNegate, &[]);
    node.tick(&mut storage, 100).unwrap();
    assert_eq!(node.address(), None);
    assert_eq!(node.device_state(), DeviceState::Pairing);
    assert_eq!(storage.0.get(&0).map(Vec::as_slice), Some(&[][..]));

    // retry is jittered by at most a quarter of the timeout
    let timeout = NodeConfig::default().addressing_timeout;
    node.tick(&mut storage, 100 + timeout / 4 + 1).unwrap();
    let request = master.take().unwrap();
    assert_eq!(request.kind, PacketKind::AddressRequest);
}

#[test]
fn request_retries_after_timeout() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    node.tick(&mut storage, 0).unwrap();
    assert!(master.take().is_some());

    let timeout = NodeConfig::default().addressing_timeout;
    node.tick(&mut storage, timeout - 1).unwrap();
    assert!(master.take().is_none());
    node.tick(&mut storage, timeout + timeout / 4 + 1).unwrap();
    let request = master.take().unwrap();
    assert_eq!(request.kind, PacketKind::AddressRequest);
}

#[test]
fn boot_restores_the_stored_address_and_announces() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    storage.write(0, &[ADDRESS]);

    node.boot(&mut storage, 0).unwrap();
    assert_eq!(node.address(), Some(ADDRESS));
    let hello = master.take().unwrap();
    assert_eq!(hello.kind, PacketKind::Hello);
    assert_eq!(hello.receiver, master.profile.gateway);
    let mut expected = vec![ADDRESS];
    expected.extend_from_slice(IDENTITY.serial.as_bytes());
    assert_eq!(hello.payload, expected);

    // no address request follows, the node is already paired
    node.tick(&mut storage, 10_000).unwrap();
    assert!(master.take().is_none());
}

#[test]
fn describe_sequence() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    pair(&mut node, &master, &mut storage);

    let fields = [
        (PacketKind::DescribeSerial, IDENTITY.serial),
        (PacketKind::DescribeManufacturer, IDENTITY.manufacturer),
        (PacketKind::DescribeModel, IDENTITY.model),
        (PacketKind::DescribeHardwareVersion, IDENTITY.hardware_version),
        (PacketKind::DescribeFirmwareVersion, IDENTITY.firmware_version),
    ];
    for (kind, expected) in fields {
        master.send(ADDRESS, kind, &[]);
        node.tick(&mut storage, 20).unwrap();
        let response = master.take().unwrap();
        assert_eq!(response.kind, kind);
        assert_eq!(response.payload, expected.as_bytes());
    }

    master.send(ADDRESS, PacketKind::DescribeRegisterSizes, &[]);
    node.tick(&mut storage, 20).unwrap();
    let sizes = master.take().unwrap();
    assert_eq!(sizes.payload, [2, 2, 1, 2, 2]);
}

#[test]
fn digital_write_and_read_back() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    pair(&mut node, &master, &mut storage);

    master.send(ADDRESS, PacketKind::WriteDigitalOutput, &[0, 1]);
    node.tick(&mut storage, 20).unwrap();
    let response = master.take().unwrap();
    assert_eq!(response.kind, PacketKind::WriteDigitalOutput);
    assert_eq!(response.payload, [0, u8::from(StatusCode::Ok), 1]);
    assert_eq!(node.registers().read(RegisterKind::DigitalOutput, 0), Ok(Value::Bool(true)));

    master.send(ADDRESS, PacketKind::ReadDigitalOutputs, &[0, 2]);
    node.tick(&mut storage, 30).unwrap();
    let response = master.take().unwrap();
    // [start][actual][values...]
    assert_eq!(response.payload, [0, 2, 1, 0]);
}

#[test]
fn out_of_range_read_is_truncated() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    pair(&mut node, &master, &mut storage);

    master.send(ADDRESS, PacketKind::ReadDigitalOutputs, &[1, 5]);
    node.tick(&mut storage, 20).unwrap();
    let response = master.take().unwrap();
    assert_eq!(response.payload, [1, 1, 0]);

    master.send(ADDRESS, PacketKind::ReadDigitalOutputs, &[4, 2]);
    node.tick(&mut storage, 30).unwrap();
    let response = master.take().unwrap();
    assert_eq!(response.payload, [4, 0]);
}

#[test]
fn analog_write_with_type_check() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    pair(&mut node, &master, &mut storage);

    // U16 slot takes the value, left-aligned in the 4-byte field
    let write = [0, u8::from(DataType::U16), 0x01, 0x02, 0, 0];
    master.send(ADDRESS, PacketKind::WriteAnalogOutput, &write);
    node.tick(&mut storage, 20).unwrap();
    let response = master.take().unwrap();
    assert_eq!(
        response.payload,
        [0, u8::from(StatusCode::Ok), u8::from(DataType::U16), 0x01, 0x02, 0, 0],
    );
    assert_eq!(node.registers().read(RegisterKind::AnalogOutput, 0), Ok(Value::U16(0x0102)));

    // wrong type tag is refused, the slot keeps its value
    let write = [0, u8::from(DataType::U8), 9, 0, 0, 0];
    master.send(ADDRESS, PacketKind::WriteAnalogOutput, &write);
    node.tick(&mut storage, 30).unwrap();
    let response = master.take().unwrap();
    assert_eq!(response.payload[1], u8::from(StatusCode::TypeMismatch));
    assert_eq!(node.registers().read(RegisterKind::AnalogOutput, 0), Ok(Value::U16(0x0102)));
}

#[test]
fn multi_write_applies_the_valid_entries() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    pair(&mut node, &master, &mut storage);

    // [count][index value]*: five valid entries and one for an index that
    // does not exist
    master.send(
        ADDRESS,
        PacketKind::WriteMultiDigitalOutputs,
        &[6, 0, 1, 1, 1, 0, 0, 9, 1, 1, 0, 0, 1],
    );
    node.tick(&mut storage, 20).unwrap();
    let response = master.take().unwrap();
    // [applied][failed count][failed indices...]
    assert_eq!(response.payload, [5, 1, 9]);
    // the last committed entries win
    assert_eq!(node.registers().read(RegisterKind::DigitalOutput, 0), Ok(Value::Bool(true)));
    assert_eq!(node.registers().read(RegisterKind::DigitalOutput, 1), Ok(Value::Bool(false)));
}

#[test]
fn attribute_writes_respect_settable_and_persist() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    pair(&mut node, &master, &mut storage);

    let write = [0, u8::from(DataType::U8), 42, 0, 0, 0];
    master.send(ADDRESS, PacketKind::WriteAttribute, &write);
    node.tick(&mut storage, 20).unwrap();
    let response = master.take().unwrap();
    assert_eq!(response.payload[1], u8::from(StatusCode::Ok));
    assert_eq!(node.registers().read(RegisterKind::Attribute, 0), Ok(Value::U8(42)));
    // the attribute is backed by key 0x10
    assert_eq!(storage.0.get(&0x10).map(Vec::as_slice), Some(&[42][..]));

    let write = [1, u8::from(DataType::U32), 0, 0, 0, 1];
    master.send(ADDRESS, PacketKind::WriteAttribute, &write);
    node.tick(&mut storage, 30).unwrap();
    let response = master.take().unwrap();
    assert_eq!(response.payload[1], u8::from(StatusCode::NotSettable));
    assert_eq!(node.registers().read(RegisterKind::Attribute, 1), Ok(Value::U32(0)));
}

#[test]
fn stopped_node_refuses_writes_but_serves_reads() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    pair(&mut node, &master, &mut storage);

    master.send(ADDRESS, PacketKind::SetState, &[u8::from(DeviceState::Stopped)]);
    node.tick(&mut storage, 20).unwrap();
    let response = master.take().unwrap();
    assert_eq!(response.kind, PacketKind::SetState);
    assert_eq!(node.device_state(), DeviceState::Stopped);

    master.send(ADDRESS, PacketKind::WriteDigitalOutput, &[0, 1]);
    node.tick(&mut storage, 30).unwrap();
    let response = master.take().unwrap();
    assert_eq!(response.payload, [0, u8::from(StatusCode::NotRunning), 0]);
    assert_eq!(node.registers().read(RegisterKind::DigitalOutput, 0), Ok(Value::Bool(false)));

    master.send(ADDRESS, PacketKind::ReadDigitalInputs, &[0, 2]);
    node.tick(&mut storage, 40).unwrap();
    let response = master.take().unwrap();
    assert_eq!(response.payload, [0, 2, 0, 0]);

    master.send(ADDRESS, PacketKind::SetState, &[u8::from(DeviceState::Running)]);
    node.tick(&mut storage, 50).unwrap();
    master.take().unwrap();
    master.send(ADDRESS, PacketKind::WriteDigitalOutput, &[0, 1]);
    node.tick(&mut storage, 60).unwrap();
    let response = master.take().unwrap();
    assert_eq!(response.payload[1], u8::from(StatusCode::Ok));
}

#[test]
fn corrupted_frames_are_dropped_silently() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    pair(&mut node, &master, &mut storage);

    let mut wire = [0; MAX_FRAME];
    let length = packet::encode(
        &master.profile,
        master.profile.gateway,
        ADDRESS,
        PacketKind::Ping,
        &[],
        &mut wire,
    )
    .unwrap();
    wire[1] ^= 0x10;
    master.inject_raw(&wire[.. length]);

    node.tick(&mut storage, 20).unwrap();
    assert!(master.take().is_none());
}

#[test]
fn frames_for_other_nodes_are_ignored() {
    let (mut node, master, mut storage) = setup(Profile::v1());
    pair(&mut node, &master, &mut storage);

    master.send(9, PacketKind::Ping, &[]);
    master.send(9, PacketKind::WriteDigitalOutput, &[0, 1]);
    node.tick(&mut storage, 20).unwrap();
    assert!(master.take().is_none());
    assert_eq!(node.registers().read(RegisterKind::DigitalOutput, 0), Ok(Value::Bool(false)));
}

#[test]
fn address_list_is_answered_by_paired_nodes_only() {
    let (mut node, master, mut storage) = setup(Profile::v1());

    master.send(master.profile.broadcast, PacketKind::AddressList, &[]);
    node.tick(&mut storage, 0).unwrap();
    // only the address request goes out, no list entry
    let only = master.take().unwrap();
    assert_eq!(only.kind, PacketKind::AddressRequest);
    assert!(master.take().is_none());

    let mut confirm = vec![ADDRESS];
    confirm.extend_from_slice(IDENTITY.serial.as_bytes());
    master.send(master.profile.unassigned, PacketKind::AddressConfirm, &confirm);
    master.send(master.profile.broadcast, PacketKind::AddressList, &[]);
    node.tick(&mut storage, 10).unwrap();
    let entry = master.take().unwrap();
    assert_eq!(entry.kind, PacketKind::AddressList);
    let mut expected = vec![ADDRESS];
    expected.extend_from_slice(IDENTITY.serial.as_bytes());
    assert_eq!(entry.payload, expected);
}

#[test]
fn legacy_profile_interop() {
    let (mut node, master, mut storage) = setup(Profile::legacy());
    pair(&mut node, &master, &mut storage);

    master.send(ADDRESS, PacketKind::Ping, &[]);
    node.tick(&mut storage, 20).unwrap();
    let pong = master.take().unwrap();
    assert_eq!(pong.kind, PacketKind::Pong);

    // a v1 frame on a legacy bus never decodes
    let mut wire = [0; MAX_FRAME];
    let v1 = Profile::v1();
    let length = packet::encode(&v1, v1.gateway, ADDRESS, PacketKind::Ping, &[], &mut wire).unwrap();
    master.inject_raw(&wire[.. length]);
    node.tick(&mut storage, 30).unwrap();
    assert!(master.take().is_none());
}
