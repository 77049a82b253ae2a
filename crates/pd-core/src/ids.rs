use core::fmt;

/// Index of a heating zone within a controller, in configuration order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ZoneId(u16);

impl ZoneId {
    pub fn from_index(index: usize) -> Self {
        Self(index as u16)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Zone({})", self.0)
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zone {}", self.0)
    }
}

/// Hardware channel number on the gateway.
///
/// Sensor channels index the temperature list returned by the board, actuator
/// channels are PWM output numbers. Both use the same numbering space per kind.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ChannelId(u16);

impl ChannelId {
    pub const fn new(channel: u16) -> Self {
        Self(channel)
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u16> for ChannelId {
    fn from(channel: u16) -> Self {
        Self(channel)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ch({})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_id_round_trip_index() {
        for i in [0_usize, 1, 3, 42] {
            assert_eq!(ZoneId::from_index(i).index(), i);
        }
    }

    #[test]
    fn channel_display_is_bare_number() {
        let ch = ChannelId::new(3);
        assert_eq!(format!("{ch}"), "3");
        assert_eq!(format!("{ch:?}"), "Ch(3)");
        assert_eq!(ch.index(), 3);
    }
}
