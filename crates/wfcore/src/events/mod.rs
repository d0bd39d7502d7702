mod bus;

pub use bus::{EventBus, EventEmitter, ExecutionEvent, ExecutionId, NodeEvent};
