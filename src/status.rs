//! Device and system readiness flags.
//!
//! A [`StatusFlags`] value describes what a device (or the whole engine) can do right
//! now. The empty set is the *dead* state. Flags are only ever produced by the
//! constructors below, by union/intersection of device-reported flags, or by an explicit
//! reset to [`StatusFlags::DEAD`].
//!
//! # Aggregation
//!
//! Bits fall into two groups when the engine folds the statuses of several devices:
//!
//! | Bit | Group | Combination |
//! |-----|-------|-------------|
//! | `LOADED`, `BOOTED`, `CAN_BOOT`, `CAN_RUN` | structural | AND over loaded devices |
//! | `CAN_OSCILLOSCOPE` | capability | OR over loaded devices |
//!
//! The engine therefore only reports itself booted/runnable when *every* configured
//! device is, while it can show a preview as soon as *any* device can.

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Readiness/capability bit set of a device or of the engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusFlags: u8 {
        /// Driver is loaded and has its setting definitions.
        const LOADED = 1 << 0;
        /// Hardware is online.
        const BOOTED = 1 << 1;
        /// A boot attempt is permitted.
        const CAN_BOOT = 1 << 2;
        /// Streaming acquisition may be started.
        const CAN_RUN = 1 << 3;
        /// Oscilloscope-style previews are available.
        const CAN_OSCILLOSCOPE = 1 << 4;
    }
}

/// Capabilities that can be queried with [`StatusFlags::can`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// May attempt to boot.
    Boot,
    /// May stream spills.
    Run,
    /// May produce preview traces.
    Oscilloscope,
}

impl Capability {
    fn flag(self) -> StatusFlags {
        match self {
            Capability::Boot => StatusFlags::CAN_BOOT,
            Capability::Run => StatusFlags::CAN_RUN,
            Capability::Oscilloscope => StatusFlags::CAN_OSCILLOSCOPE,
        }
    }
}

impl StatusFlags {
    /// Explicit dead state (no bits).
    pub const DEAD: StatusFlags = StatusFlags::empty();

    const STRUCTURAL: StatusFlags = StatusFlags::LOADED
        .union(StatusFlags::BOOTED)
        .union(StatusFlags::CAN_BOOT)
        .union(StatusFlags::CAN_RUN);

    const CAPABILITIES: StatusFlags = StatusFlags::CAN_OSCILLOSCOPE;

    /// A freshly constructed device: loaded and allowed to boot.
    pub const fn loaded() -> Self {
        StatusFlags::LOADED.union(StatusFlags::CAN_BOOT)
    }

    /// A successfully booted device.
    ///
    /// This is the only constructor that yields `CAN_RUN`, and it always carries
    /// `LOADED | BOOTED` alongside it.
    pub const fn booted() -> Self {
        StatusFlags::LOADED
            .union(StatusFlags::BOOTED)
            .union(StatusFlags::CAN_RUN)
    }

    /// No bits set.
    pub fn is_dead(&self) -> bool {
        self.is_empty()
    }

    /// `LOADED` is set.
    pub fn is_loaded(&self) -> bool {
        self.contains(StatusFlags::LOADED)
    }

    /// `BOOTED` is set.
    pub fn is_booted(&self) -> bool {
        self.contains(StatusFlags::BOOTED)
    }

    /// Loaded, booted and able to stream.
    pub fn is_ready(&self) -> bool {
        self.contains(StatusFlags::booted())
    }

    /// Whether the given capability bit is set.
    pub fn can(&self, capability: Capability) -> bool {
        self.contains(capability.flag())
    }

    /// Same flags with a capability added.
    pub fn with_capability(self, capability: Capability) -> Self {
        match capability {
            // CAN_RUN is only legal on top of a booted state
            Capability::Run if !self.contains(StatusFlags::LOADED | StatusFlags::BOOTED) => self,
            other => self | other.flag(),
        }
    }

    /// Same flags with a capability removed.
    pub fn without_capability(self, capability: Capability) -> Self {
        self.difference(capability.flag())
    }

    /// Fold per-device statuses into one engine-wide status.
    ///
    /// Devices that are not `LOADED` are ignored. Structural bits are AND-combined,
    /// capability bits OR-combined. No loaded device yields [`StatusFlags::DEAD`].
    pub fn aggregate<I>(statuses: I) -> StatusFlags
    where
        I: IntoIterator<Item = StatusFlags>,
    {
        let mut structural = StatusFlags::STRUCTURAL;
        let mut capabilities = StatusFlags::empty();
        let mut any_loaded = false;

        for status in statuses.into_iter().filter(StatusFlags::is_loaded) {
            any_loaded = true;
            structural &= status;
            capabilities |= status & StatusFlags::CAPABILITIES;
        }

        if any_loaded {
            structural | capabilities
        } else {
            StatusFlags::DEAD
        }
    }
}

impl fmt::Display for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dead() {
            return write!(f, "dead");
        }
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        write!(f, "{}", names.join("|").to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_booted_implies_loaded() {
        let status = StatusFlags::booted();
        assert!(status.is_loaded());
        assert!(status.is_booted());
        assert!(status.is_ready());
        assert!(!status.can(Capability::Boot));
    }

    #[test]
    fn test_can_run_requires_booted() {
        let status = StatusFlags::loaded().with_capability(Capability::Run);
        assert!(!status.can(Capability::Run));

        let status = StatusFlags::booted().without_capability(Capability::Run);
        assert!(status.with_capability(Capability::Run).can(Capability::Run));
    }

    #[test]
    fn test_aggregate_and_structural_or_capabilities() {
        let a = StatusFlags::booted() | StatusFlags::CAN_OSCILLOSCOPE;
        let b = StatusFlags::loaded();

        let total = StatusFlags::aggregate([a, b]);
        assert!(total.is_loaded());
        assert!(!total.is_booted());
        assert!(!total.can(Capability::Run));
        assert!(total.can(Capability::Oscilloscope));
    }

    #[test]
    fn test_aggregate_all_booted() {
        let total = StatusFlags::aggregate([StatusFlags::booted(), StatusFlags::booted()]);
        assert!(total.is_ready());
    }

    #[test]
    fn test_aggregate_ignores_unloaded_devices() {
        let total = StatusFlags::aggregate([StatusFlags::booted(), StatusFlags::DEAD]);
        assert!(total.is_ready());
        assert!(StatusFlags::aggregate(Vec::new()).is_dead());
    }

    #[test]
    fn test_display() {
        assert_eq!(StatusFlags::DEAD.to_string(), "dead");
        assert_eq!(StatusFlags::loaded().to_string(), "loaded|can_boot");
    }
}
