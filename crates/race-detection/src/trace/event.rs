use anyhow::{Error, anyhow};

// ============================================================================
// An event occupies one 64-bit word: the type tag in the three most significant
// bits, the program counter or address in the remaining ones.
const PAYLOAD_NUM_BITS: u32 = 61;
const TYPE_BIT_OFFSET: u32 = PAYLOAD_NUM_BITS;

pub(crate) const PAYLOAD_MASK: u64 = (1 << PAYLOAD_NUM_BITS) - 1;
// ============================================================================

/// The kind of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// A memory access at the given pc.
    Mop,
    /// A call from the given pc.
    FuncEnter,
    /// A return from the current function. The payload is unused.
    FuncExit,
    /// The write lock of the mutex at the given address was acquired.
    Lock,
    /// The write lock of the mutex at the given address was released.
    Unlock,
    /// A read lock of the mutex at the given address was acquired.
    RLock,
    /// A read lock of the mutex at the given address was released.
    RUnlock,
}

impl EventType {
    /// Returns the 3-bit tag identifying the type of the event.
    pub fn id(&self) -> u8 {
        match self {
            EventType::Mop => 0,
            EventType::FuncEnter => 1,
            EventType::FuncExit => 2,
            EventType::Lock => 3,
            EventType::Unlock => 4,
            EventType::RLock => 5,
            EventType::RUnlock => 6,
        }
    }

    pub fn try_from_id(id: u8) -> Result<Self, Error> {
        match id {
            0 => Ok(EventType::Mop),
            1 => Ok(EventType::FuncEnter),
            2 => Ok(EventType::FuncExit),
            3 => Ok(EventType::Lock),
            4 => Ok(EventType::Unlock),
            5 => Ok(EventType::RLock),
            6 => Ok(EventType::RUnlock),
            _ => Err(anyhow!("Event type {id} was not recognized")),
        }
    }
}

/// A packed trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Event(u64);

impl Event {
    /// Packs `typ` and `payload`. Payload bits beyond the 61 available ones are
    /// dropped.
    pub fn new(typ: EventType, payload: u64) -> Self {
        Self((u64::from(typ.id()) << TYPE_BIT_OFFSET) | (payload & PAYLOAD_MASK))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn payload(self) -> u64 {
        self.0 & PAYLOAD_MASK
    }

    /// Splits the event into its type and payload.
    ///
    /// # Errors
    ///
    /// Fails if the type tag does not name an [`EventType`].
    pub fn decode(self) -> Result<(EventType, u64), Error> {
        let typ = EventType::try_from_id((self.0 >> TYPE_BIT_OFFSET) as u8)?;
        Ok((typ, self.payload()))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Error;

    use super::{Event, EventType, PAYLOAD_MASK};

    #[test]
    fn fail_on_invalid_event_type() {
        EventType::try_from_id(7).unwrap_err();
        Event::from_raw(u64::MAX).decode().unwrap_err();
    }

    #[test]
    fn validate_event_type_ids() {
        use EventType::*;

        for (id, typ) in [Mop, FuncEnter, FuncExit, Lock, Unlock, RLock, RUnlock]
            .into_iter()
            .enumerate()
        {
            assert_eq!(typ.id(), id as u8);
            assert_eq!(EventType::try_from_id(id as u8).unwrap(), typ);
        }
    }

    #[test]
    #[allow(clippy::unusual_byte_groupings)]
    fn tag_lives_in_top_bits() -> Result<(), Error> {
        let event = Event::new(EventType::RLock, 0x1234);
        assert_eq!(
            event.raw(),
            0b101_0000000000000000000000000000000000000000000000001001000110100
        );
        assert_eq!(event.decode()?, (EventType::RLock, 0x1234));

        let clipped = Event::new(EventType::Unlock, u64::MAX);
        assert_eq!(clipped.decode()?, (EventType::Unlock, PAYLOAD_MASK));

        Ok(())
    }
}
