mod marking;
mod object;
mod process;
mod refqueue;

pub use marking::{
    DEFAULT_BUFFER_CAPACITY, ForeignCall, KeptObjects, MarkerProxy, MarkerStack,
    MarkingCreateInfo, MarkingService, MarkingSettings,
};
pub use object::{ObjectRef, WeakObj};
pub use process::EntryList;
pub use refqueue::{ReferenceQueue, ServiceKind, Token};
