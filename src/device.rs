//! USB device object model. Grounded on the `Device`/`Hub` classes in
//! `usb_private.h`. Descriptor parsing, configuration selection and the
//! explore/hotplug thread that walks hub port status are out of scope —
//! this module only carries the shape `BusManager`/`Hcd` need to address
//! a device and reach its default control pipe.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::object::{Object, ObjectState};
use crate::pipe::Pipe;
use crate::stack::Stack;
use crate::UsbSpeed;

/// Trimmed to the fields this core actually reads (route-string/MPS
/// decisions); string descriptor indices are left for the device-class
/// layer to resolve.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size_0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub num_configurations: u8,
}

/// Where a device sits in the topology, needed to build an xHCI route
/// string and to know which EHCI companion/TT applies. `None` for a
/// device hanging directly off a root port.
#[derive(Debug, Clone, Copy)]
pub struct HubPosition {
    pub hub_address: u8,
    pub hub_port: u8,
    /// The transaction-translator port for a low/full-speed device below
    /// a high-speed hub (EHCI split transactions).
    pub tt_port: u8,
}

pub struct Device {
    object: ObjectState,
    address: u8,
    speed: UsbSpeed,
    port: u8,
    hub_position: Option<HubPosition>,
    descriptor: Option<DeviceDescriptor>,
    default_pipe: Arc<Pipe>,
    children: Vec<Arc<Device>>,
}

impl Device {
    pub fn new(
        stack: Arc<Stack>,
        address: u8,
        speed: UsbSpeed,
        port: u8,
        hub_position: Option<HubPosition>,
        default_pipe: Arc<Pipe>,
    ) -> Self {
        Device {
            object: ObjectState::new(stack),
            address,
            speed,
            port,
            hub_position,
            descriptor: None,
            default_pipe,
            children: Vec::new(),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn speed(&self) -> UsbSpeed {
        self.speed
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn hub_position(&self) -> Option<HubPosition> {
        self.hub_position
    }

    pub fn default_pipe(&self) -> &Arc<Pipe> {
        &self.default_pipe
    }

    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn set_descriptor(&mut self, descriptor: DeviceDescriptor) {
        self.descriptor = Some(descriptor);
    }

    /// xHCI route string: one nibble per hub tier between the root port
    /// and this device, root-port-attached devices get an
    /// all-zero route string regardless of their root port number.
    pub fn route_string(&self, ancestry: &[HubPosition]) -> u32 {
        let mut route = 0u32;
        for (i, pos) in ancestry.iter().rev().take(5).enumerate() {
            route |= (pos.hub_port as u32 & 0xF) << (4 * i);
        }
        route
    }
}

impl Object for Device {
    fn object_state(&self) -> &ObjectState {
        &self.object
    }
}
