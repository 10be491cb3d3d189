/*!
    the register store

    fixed-capacity tables of typed value slots, one table per register kind.
    pure data and validation, no I/O: the protocol engine and the drivers
    both talk to the store, never to each other.

    table sizes are chosen while building the store and never change, so any
    register address stays a constant-time lookup for the device's lifetime.
*/

use heapless::Vec;
use log::*;

use crate::config::*;
use crate::value::{DataType, Value};


/// which table a register lives in
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegisterKind {
    DigitalInput,
    DigitalOutput,
    AnalogInput,
    AnalogOutput,
    Attribute,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("no register at this index")]
    OutOfRange,
    #[error("value type differs from the register's declared type")]
    TypeMismatch,
    #[error("byte count differs from the type's canonical width")]
    SizeMismatch,
    #[error("register table is full")]
    TableFull,
    #[error("data type cannot be held by a register slot")]
    Unsupported,
}

#[derive(Clone)]
struct Slot {
    ty: DataType,
    value: [u8; 4],
    dirty: bool,
}

impl Slot {
    fn new(ty: DataType) -> Self {
        Self { ty, value: [0; 4], dirty: false }
    }
}

#[derive(Clone)]
struct AttributeSlot {
    slot: Slot,
    settable: bool,
    key: Option<u16>,
}

/// typed, fixed-capacity register tables
#[derive(Default)]
pub struct RegisterStore {
    digital_inputs: Vec<Slot, MAX_DIGITAL_INPUTS>,
    digital_outputs: Vec<Slot, MAX_DIGITAL_OUTPUTS>,
    analog_inputs: Vec<Slot, MAX_ANALOG_INPUTS>,
    analog_outputs: Vec<Slot, MAX_ANALOG_OUTPUTS>,
    attributes: Vec<AttributeSlot, MAX_ATTRIBUTES>,
}

impl RegisterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// append a digital input register (always [DataType::Bool])
    pub fn add_digital_input(&mut self) -> Result<u8, RegisterError> {
        push(&mut self.digital_inputs, Slot::new(DataType::Bool))
    }
    /// append a digital output register (always [DataType::Bool])
    pub fn add_digital_output(&mut self) -> Result<u8, RegisterError> {
        push(&mut self.digital_outputs, Slot::new(DataType::Bool))
    }
    /// append an analog input register of the given type
    pub fn add_analog_input(&mut self, ty: DataType) -> Result<u8, RegisterError> {
        storable(ty)?;
        push(&mut self.analog_inputs, Slot::new(ty))
    }
    /// append an analog output register of the given type
    pub fn add_analog_output(&mut self, ty: DataType) -> Result<u8, RegisterError> {
        storable(ty)?;
        push(&mut self.analog_outputs, Slot::new(ty))
    }
    /// append an attribute register, optionally settable and/or persisted under `key`
    pub fn add_attribute(&mut self, ty: DataType, settable: bool, key: Option<u16>)
        -> Result<u8, RegisterError>
    {
        storable(ty)?;
        if self.attributes.push(AttributeSlot { slot: Slot::new(ty), settable, key }).is_err() {
            return Err(RegisterError::TableFull);
        }
        Ok(self.attributes.len() as u8 - 1)
    }

    /// number of registers in the kind's table
    pub fn size(&self, kind: RegisterKind) -> u8 {
        let len = match kind {
            RegisterKind::DigitalInput => self.digital_inputs.len(),
            RegisterKind::DigitalOutput => self.digital_outputs.len(),
            RegisterKind::AnalogInput => self.analog_inputs.len(),
            RegisterKind::AnalogOutput => self.analog_outputs.len(),
            RegisterKind::Attribute => self.attributes.len(),
        };
        len as u8
    }

    /// declared type of a register
    pub fn data_type(&self, kind: RegisterKind, index: u8) -> Result<DataType, RegisterError> {
        Ok(self.slot(kind, index)?.ty)
    }

    /// current typed value of a register
    pub fn read(&self, kind: RegisterKind, index: u8) -> Result<Value, RegisterError> {
        let slot = self.slot(kind, index)?;
        let width = slot.ty.width().ok_or(RegisterError::Unsupported)?;
        // width was validated when the slot was created
        Value::decode(slot.ty, &slot.value[.. width]).ok_or(RegisterError::Unsupported)
    }

    /// current raw value of a register, trimmed to the type's canonical width
    pub fn read_bytes(&self, kind: RegisterKind, index: u8)
        -> Result<(DataType, &[u8]), RegisterError>
    {
        let slot = self.slot(kind, index)?;
        let width = slot.ty.width().ok_or(RegisterError::Unsupported)?;
        Ok((slot.ty, &slot.value[.. width]))
    }

    /// overwrite a register with a typed value, marking it dirty
    pub fn write(&mut self, kind: RegisterKind, index: u8, value: Value)
        -> Result<(), RegisterError>
    {
        let slot = self.slot_mut(kind, index)?;
        if value.data_type() != slot.ty {
            return Err(RegisterError::TypeMismatch);
        }
        let (_, encoded) = value.encode();
        slot.value = encoded;
        slot.dirty = true;
        Ok(())
    }

    /// overwrite a register from wire bytes, validating type and width
    pub fn write_bytes(&mut self, kind: RegisterKind, index: u8, ty: DataType, bytes: &[u8])
        -> Result<(), RegisterError>
    {
        let slot = self.slot_mut(kind, index)?;
        if ty != slot.ty {
            return Err(RegisterError::TypeMismatch);
        }
        let width = ty.width().ok_or(RegisterError::Unsupported)?;
        if bytes.len() != width {
            return Err(RegisterError::SizeMismatch);
        }
        slot.value = [0; 4];
        slot.value[.. width].copy_from_slice(bytes);
        slot.dirty = true;
        Ok(())
    }

    /// whether an attribute accepts writes from the bus
    pub fn attribute_settable(&self, index: u8) -> Result<bool, RegisterError> {
        let attr = self.attributes.get(usize::from(index)).ok_or(RegisterError::OutOfRange)?;
        Ok(attr.settable)
    }

    /// persistent-storage key backing an attribute, if any
    pub fn attribute_key(&self, index: u8) -> Result<Option<u16>, RegisterError> {
        let attr = self.attributes.get(usize::from(index)).ok_or(RegisterError::OutOfRange)?;
        Ok(attr.key)
    }

    /// move pending dirty marks into `out`, clearing them
    ///
    /// marks that do not fit stay set and surface on the next drain
    pub fn drain_dirty<const N: usize>(&mut self, out: &mut Vec<(RegisterKind, u8), N>) {
        for kind in [
            RegisterKind::DigitalInput,
            RegisterKind::DigitalOutput,
            RegisterKind::AnalogInput,
            RegisterKind::AnalogOutput,
            RegisterKind::Attribute,
        ] {
            for index in 0 .. self.size(kind) {
                let slot = match self.slot_mut(kind, index) {
                    Ok(slot) => slot,
                    Err(_) => continue,
                };
                if slot.dirty {
                    if out.push((kind, index)).is_err() {
                        trace!("dirty drain buffer full, deferring");
                        return;
                    }
                    slot.dirty = false;
                }
            }
        }
    }

    fn slot(&self, kind: RegisterKind, index: u8) -> Result<&Slot, RegisterError> {
        let index = usize::from(index);
        match kind {
            RegisterKind::DigitalInput => self.digital_inputs.get(index),
            RegisterKind::DigitalOutput => self.digital_outputs.get(index),
            RegisterKind::AnalogInput => self.analog_inputs.get(index),
            RegisterKind::AnalogOutput => self.analog_outputs.get(index),
            RegisterKind::Attribute => self.attributes.get(index).map(|attr| &attr.slot),
        }
        .ok_or(RegisterError::OutOfRange)
    }

    fn slot_mut(&mut self, kind: RegisterKind, index: u8) -> Result<&mut Slot, RegisterError> {
        let index = usize::from(index);
        match kind {
            RegisterKind::DigitalInput => self.digital_inputs.get_mut(index),
            RegisterKind::DigitalOutput => self.digital_outputs.get_mut(index),
            RegisterKind::AnalogInput => self.analog_inputs.get_mut(index),
            RegisterKind::AnalogOutput => self.analog_outputs.get_mut(index),
            RegisterKind::Attribute => self.attributes.get_mut(index).map(|attr| &mut attr.slot),
        }
        .ok_or(RegisterError::OutOfRange)
    }
}

fn storable(ty: DataType) -> Result<(), RegisterError> {
    match ty.width() {
        Some(_) => Ok(()),
        None => Err(RegisterError::Unsupported),
    }
}

fn push<const N: usize>(table: &mut Vec<Slot, N>, slot: Slot) -> Result<u8, RegisterError> {
    if table.push(slot).is_err() {
        return Err(RegisterError::TableFull);
    }
    Ok(table.len() as u8 - 1)
}
