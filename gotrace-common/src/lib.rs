#![cfg_attr(not(feature = "user"), no_std)]

/// Event kind value for a function entry probe
pub const EVENT_ENTER: u8 = 0;

/// Event kind value for a function return probe
pub const EVENT_EXIT: u8 = 1;

/// Function index reserved for the synthetic root frame of every goroutine stack
pub const ROOT_FUNCTION_INDEX: u32 = u32::MAX;

/// Largest timestamp accepted from the tracer; durations are signed nanoseconds
pub const MAX_TIMESTAMP: u64 = i64::MAX as u64;

/// Size in bytes of one encoded `RawEvent` frame
pub const RAW_EVENT_SIZE: usize = 24;

/// Event frame emitted by the uprobe handlers, one per probe firing.
///
/// Frames are written little-endian in field order. The layout is shared
/// with the kernel-side program so both ends agree on the ring buffer record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawEvent {
    /// Dense function index assigned during probe resolution
    pub func_id: u32,
    /// `EVENT_ENTER` or `EVENT_EXIT`
    pub kind: u8,
    /// 1 when the probe fired on a stack-growth frame
    pub growth: u8,
    pub pad: u16,
    /// Goroutine id read from the runtime `g` struct
    pub goid: i64,
    /// Monotonic timestamp in nanoseconds
    pub timestamp: u64,
}

#[cfg(feature = "user")]
pub mod user {
    extern crate std;
    use super::*;
    use std::fmt;

    /// Direction of a probe firing
    #[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
    pub enum EventKind {
        Enter,
        Exit,
    }

    impl EventKind {
        pub fn from_raw(value: u8) -> Option<Self> {
            match value {
                EVENT_ENTER => Some(EventKind::Enter),
                EVENT_EXIT => Some(EventKind::Exit),
                _ => None,
            }
        }

        pub fn as_raw(self) -> u8 {
            match self {
                EventKind::Enter => EVENT_ENTER,
                EventKind::Exit => EVENT_EXIT,
            }
        }
    }

    /// Decoded probe firing
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Event {
        pub function_index: u32,
        pub kind: EventKind,
        pub is_growth_frame: bool,
        pub goroutine_id: i64,
        pub timestamp: u64,
    }

    impl Event {
        pub fn enter(function_index: u32, goroutine_id: i64, timestamp: u64) -> Self {
            Self {
                function_index,
                kind: EventKind::Enter,
                is_growth_frame: false,
                goroutine_id,
                timestamp,
            }
        }

        pub fn exit(function_index: u32, goroutine_id: i64, timestamp: u64) -> Self {
            Self {
                function_index,
                kind: EventKind::Exit,
                is_growth_frame: false,
                goroutine_id,
                timestamp,
            }
        }

        /// Marks the event as fired on a stack-growth frame
        pub fn growth(mut self) -> Self {
            self.is_growth_frame = true;
            self
        }
    }

    /// Field of a `RawEvent` that holds a value outside its domain
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum InvalidField {
        Kind(u8),
        Growth(u8),
        Timestamp(u64),
    }

    impl fmt::Display for InvalidField {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                InvalidField::Kind(v) => write!(f, "event kind {} is neither enter nor exit", v),
                InvalidField::Growth(v) => write!(f, "growth flag {} is not 0 or 1", v),
                InvalidField::Timestamp(v) => write!(f, "timestamp {} exceeds {}", v, MAX_TIMESTAMP),
            }
        }
    }

    impl TryFrom<RawEvent> for Event {
        type Error = InvalidField;

        fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
            let kind = EventKind::from_raw(raw.kind).ok_or(InvalidField::Kind(raw.kind))?;
            let is_growth_frame = match raw.growth {
                0 => false,
                1 => true,
                other => return Err(InvalidField::Growth(other)),
            };
            if raw.timestamp > MAX_TIMESTAMP {
                return Err(InvalidField::Timestamp(raw.timestamp));
            }
            Ok(Event {
                function_index: raw.func_id,
                kind,
                is_growth_frame,
                goroutine_id: raw.goid,
                timestamp: raw.timestamp,
            })
        }
    }

    impl From<Event> for RawEvent {
        fn from(event: Event) -> Self {
            RawEvent {
                func_id: event.function_index,
                kind: event.kind.as_raw(),
                growth: event.is_growth_frame as u8,
                pad: 0,
                goid: event.goroutine_id,
                timestamp: event.timestamp,
            }
        }
    }

}
