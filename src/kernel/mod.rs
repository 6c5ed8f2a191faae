pub mod dispatcher;
pub mod image;
pub mod lifecycle;
pub mod queue;
pub mod slab;
pub mod task;
pub mod traits;


pub use dispatcher::{EventSender, Kernel, INTERNAL_EVENT_SLOTS};
pub use lifecycle::AppInfo;
pub use queue::{QueuedEvent, EVENT_QUEUE_DEPTH};
pub use task::{TaskImage, MAX_EMBEDDED_EVT_SUBS, MAX_TASKS};
pub use traits::{
    AppHost, AppId, AppIdSelector, AppInstance, EventData, EventFreeFn, FreeInfo, LoadError,
    MgmtStatus, SensorApp, Tid, EVENT_TYPE_BIT_DISCARDABLE, EVT_APP_START,
    EVT_NO_FIRST_USER_EVENT,
};
