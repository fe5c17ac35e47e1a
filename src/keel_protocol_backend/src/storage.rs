//! Stable-memory event log. Events are appended on every committed state
//! mutation and replayed on upgrade; the log is the only persistent state
//! the canister keeps.

use crate::event::Event;
use ic_stable_structures::{
    log::Log as StableLog,
    memory_manager::{MemoryId, MemoryManager, VirtualMemory},
    storable::Bound,
    DefaultMemoryImpl, Storable,
};
use std::borrow::Cow;
use std::cell::RefCell;

const LOG_INDEX_MEMORY_ID: MemoryId = MemoryId::new(0);
const LOG_DATA_MEMORY_ID: MemoryId = MemoryId::new(1);

type VMem = VirtualMemory<DefaultMemoryImpl>;
type EventLog = StableLog<Cbor<Event>, VMem, VMem>;

struct Cbor<T>(T);

impl<T: serde::Serialize + serde::de::DeserializeOwned> Storable for Cbor<T> {
    const BOUND: Bound = Bound::Unbounded;

    fn to_bytes(&self) -> Cow<[u8]> {
        let mut buf = vec![];
        ciborium::ser::into_writer(&self.0, &mut buf)
            .expect("bug: failed to serialize an event");
        Cow::Owned(buf)
    }

    fn from_bytes(bytes: Cow<[u8]>) -> Self {
        Self(
            ciborium::de::from_reader(bytes.as_ref())
                .expect("bug: failed to deserialize an event"),
        )
    }
}

thread_local! {
    static MEMORY_MANAGER: RefCell<MemoryManager<DefaultMemoryImpl>> =
        RefCell::new(MemoryManager::init(DefaultMemoryImpl::default()));

    static EVENTS: RefCell<EventLog> = MEMORY_MANAGER.with(|m| {
        RefCell::new(
            EventLog::init(
                m.borrow().get(LOG_INDEX_MEMORY_ID),
                m.borrow().get(LOG_DATA_MEMORY_ID),
            )
            .expect("bug: failed to initialize the stable event log"),
        )
    });
}

/// Appends the event to the stable log. Traps when stable memory is
/// exhausted; that failure must abort the whole message.
pub fn record_event(event: &Event) {
    EVENTS.with(|events| {
        events
            .borrow()
            .append(&Cbor(event.clone()))
            .expect("bug: failed to append an event to the stable log")
    });
}

pub fn count_events() -> u64 {
    EVENTS.with(|events| events.borrow().len())
}

/// Runs `f` over an iterator of all recorded events.
pub fn with_event_iter<F, R>(f: F) -> R
where
    F: for<'a> FnOnce(Box<dyn Iterator<Item = Event> + 'a>) -> R,
{
    EVENTS.with(|events| f(Box::new(events.borrow().iter().map(|Cbor(e)| e))))
}
