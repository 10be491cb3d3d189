/*!
    protocol profiles

    the packet-kind numbering changed between firmware revisions of the bus,
    so the kind table is configuration rather than constants: a [Profile]
    carries the kind↔byte table, the start marker, the special addresses and
    the CRC switch. the engine and the tests can target any revision by
    swapping the profile.
*/

/// every request/response the bus knows, independent of its wire byte
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    // addressing lifecycle
    AddressRequest,
    AddressConfirm,
    AddressRefresh,
    AddressNegate,
    AddressList,
    // node description, one field per request
    DescribeSerial,
    DescribeManufacturer,
    DescribeModel,
    DescribeHardwareVersion,
    DescribeFirmwareVersion,
    DescribeRegisterSizes,
    SetState,
    // register reads, multi by start+count
    ReadDigitalInputs,
    ReadDigitalOutputs,
    ReadAnalogInputs,
    ReadAnalogOutputs,
    ReadAttributes,
    // register writes
    WriteDigitalOutput,
    WriteAnalogOutput,
    WriteMultiDigitalOutputs,
    WriteMultiAnalogOutputs,
    WriteAttribute,
    // misc
    Ping,
    Pong,
    Hello,
}

impl PacketKind {
    pub const ALL: [PacketKind; 25] = [
        Self::AddressRequest,
        Self::AddressConfirm,
        Self::AddressRefresh,
        Self::AddressNegate,
        Self::AddressList,
        Self::DescribeSerial,
        Self::DescribeManufacturer,
        Self::DescribeModel,
        Self::DescribeHardwareVersion,
        Self::DescribeFirmwareVersion,
        Self::DescribeRegisterSizes,
        Self::SetState,
        Self::ReadDigitalInputs,
        Self::ReadDigitalOutputs,
        Self::ReadAnalogInputs,
        Self::ReadAnalogOutputs,
        Self::ReadAttributes,
        Self::WriteDigitalOutput,
        Self::WriteAnalogOutput,
        Self::WriteMultiDigitalOutputs,
        Self::WriteMultiAnalogOutputs,
        Self::WriteAttribute,
        Self::Ping,
        Self::Pong,
        Self::Hello,
    ];
}

/// one protocol revision: kind numbering, framing marker, special addresses
#[derive(Clone, Debug)]
pub struct Profile {
    /// frame start marker
    pub start: u8,
    /// address every node listens to
    pub broadcast: u8,
    /// the master/gateway address
    pub gateway: u8,
    /// sender address of a node that holds no address yet
    pub unassigned: u8,
    /// append and verify the trailing CRC
    pub crc: bool,
    kinds: [u8; PacketKind::ALL.len()],
}

impl Profile {
    /// current revision: kinds grouped in ranges (addressing 0x01..,
    /// describe 0x11.., reads 0x21.., writes 0x31.., misc 0x71..)
    pub const fn v1() -> Self {
        Self {
            start: 0xaa,
            broadcast: 0,
            gateway: 254,
            unassigned: 255,
            crc: true,
            kinds: [
                0x01, 0x02, 0x03, 0x04, 0x05,
                0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17,
                0x21, 0x22, 0x23, 0x24, 0x25,
                0x31, 0x32, 0x33, 0x34, 0x35,
                0x71, 0x72, 0x73,
            ],
        }
    }

    /// pre-revision flat numbering, kept for interop with deployed nodes
    pub const fn legacy() -> Self {
        Self {
            start: 0x7e,
            broadcast: 0,
            gateway: 254,
            unassigned: 255,
            crc: true,
            kinds: [
                0x01, 0x0c, 0x0d, 0x0e, 0x0f,
                0x41, 0x42, 0x03, 0x43, 0x44, 0x45, 0x46,
                0x04, 0x05, 0x06, 0x07, 0x47,
                0x08, 0x09, 0x0a, 0x0b, 0x48,
                0x02, 0x49, 0x4a,
            ],
        }
    }

    /// renumber one kind, for custom/interop tables
    pub const fn with_kind(mut self, kind: PacketKind, byte: u8) -> Self {
        self.kinds[kind as usize] = byte;
        self
    }

    /// wire byte of a kind under this profile
    pub fn byte(&self, kind: PacketKind) -> u8 {
        self.kinds[kind as usize]
    }

    /// kind of a wire byte under this profile, `None` for unknown bytes
    pub fn kind(&self, byte: u8) -> Option<PacketKind> {
        PacketKind::ALL
            .iter()
            .copied()
            .find(|&kind| self.kinds[kind as usize] == byte)
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::v1()
    }
}
