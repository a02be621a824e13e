use uuid::Uuid;

use crate::Address;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

// Const so apps can declare well known service Uuids as constants
pub const fn uuid_from_u16(v: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}

/// A Low Energy device seen while discovering
///
/// Devices are keyed by address. When the same address is reported again
/// the adapter merges the new advertisement into what it already knows,
/// so a `Device` reflects everything seen so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub(crate) address: Address,
    pub(crate) name: Option<String>,
    pub(crate) service_uuids: Vec<Uuid>,
    pub(crate) bluetooth_class: u32,
    pub(crate) paired: bool,
    pub(crate) rssi: Option<i16>,
}

impl Device {
    pub(crate) fn new(address: Address) -> Self {
        Device {
            address,
            name: None,
            service_uuids: vec![],
            bluetooth_class: 0,
            paired: false,
            rssi: None,
        }
    }

    // Platforms report a missing name as an empty string
    pub(crate) fn with_name(mut self, name: &str) -> Self {
        self.name = if name.is_empty() { None } else { Some(name.to_string()) };
        self
    }

    pub(crate) fn with_service_uuids(mut self, uuids: &[Uuid]) -> Self {
        self.service_uuids = uuids.to_vec();
        self
    }

    pub(crate) fn with_bluetooth_class(mut self, bluetooth_class: u32) -> Self {
        self.bluetooth_class = bluetooth_class;
        self
    }

    pub(crate) fn with_paired(mut self, paired: bool) -> Self {
        self.paired = paired;
        self
    }

    pub(crate) fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub(crate) fn merge(&mut self, update: Device) {
        debug_assert_eq!(self.address, update.address);

        if update.name.is_some() {
            self.name = update.name;
        }
        for uuid in update.service_uuids {
            if !self.service_uuids.contains(&uuid) {
                self.service_uuids.push(uuid);
            }
        }
        self.bluetooth_class = update.bluetooth_class;
        self.paired = update.paired;
        if update.rssi.is_some() {
            self.rssi = update.rssi;
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Service Uuids advertised by the device, in the order first seen
    pub fn service_uuids(&self) -> &[Uuid] {
        &self.service_uuids
    }

    pub fn has_service_id(&self, uuid: Uuid) -> bool {
        self.service_uuids.contains(&uuid)
    }

    /// The Bluetooth "class of device" field (0 if unknown)
    pub fn bluetooth_class(&self) -> u32 {
        self.bluetooth_class
    }

    pub fn is_paired(&self) -> bool {
        self.paired
    }

    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }
}
