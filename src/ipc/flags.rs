//! IPC flag field: three tri-state instructions packed into a `u32`
//!
//! Each logical flag owns two bits, one for "set" and one for "unset".
//! Neither bit present means "leave unchanged".

use bitflags::bitflags;

bitflags! {
    /// Flag field transferred from a delegate to the owner
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct IpcFlags: u32 {
        const ENABLE = 0x0000_0001;
        const DISABLE = 0x0000_0002;
        const SET_SYSTEM = 0x0000_0010;
        const UNSET_SYSTEM = 0x0000_0020;
        const SET_DISPLAY = 0x0000_0100;
        const UNSET_DISPLAY = 0x0000_0200;
    }
}

/// Requested change for each of the three power flags
///
/// `None` leaves the corresponding boolean untouched on the receiving side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlagOverrides {
    pub enable: Option<bool>,
    pub system: Option<bool>,
    pub display: Option<bool>,
}

impl FlagOverrides {
    pub fn is_empty(&self) -> bool {
        self.enable.is_none() && self.system.is_none() && self.display.is_none()
    }
}

fn pick(value: Option<bool>, set: IpcFlags, unset: IpcFlags) -> IpcFlags {
    match value {
        Some(true) => set,
        Some(false) => unset,
        None => IpcFlags::empty(),
    }
}

/// Resolve one flag pair. "Set" wins when a sender sets both bits.
fn resolve(flags: IpcFlags, set: IpcFlags, unset: IpcFlags) -> Option<bool> {
    let mut value = None;
    if flags.contains(unset) {
        value = Some(false);
    }
    if flags.contains(set) {
        value = Some(true);
    }
    value
}

impl IpcFlags {
    /// Sender side: pack the optional booleans
    pub fn encode(overrides: FlagOverrides) -> Self {
        pick(overrides.enable, Self::ENABLE, Self::DISABLE)
            | pick(overrides.system, Self::SET_SYSTEM, Self::UNSET_SYSTEM)
            | pick(overrides.display, Self::SET_DISPLAY, Self::UNSET_DISPLAY)
    }

    /// Receiver side: unpack into optional booleans
    ///
    /// Unknown bits are ignored.
    pub fn decode(self) -> FlagOverrides {
        FlagOverrides {
            enable: resolve(self, Self::ENABLE, Self::DISABLE),
            system: resolve(self, Self::SET_SYSTEM, Self::UNSET_SYSTEM),
            display: resolve(self, Self::SET_DISPLAY, Self::UNSET_DISPLAY),
        }
    }

    /// Build from a raw wire value, keeping unknown bits out of the field
    pub fn from_wire(raw: u32) -> Self {
        Self::from_bits_truncate(raw)
    }

    pub fn to_le_bytes(self) -> [u8; 4] {
        self.bits().to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self::from_wire(u32::from_le_bytes(bytes))
    }
}
