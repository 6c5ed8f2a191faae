use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::kernel::dispatcher::Kernel;
use crate::kernel::slab::SlabHandle;

// =============================================================================
// TASK & APP IDENTITY
// =============================================================================

/// Task identifier. Nonzero for live tasks; assigned from a rotating counter
/// that skips values still in use.
pub type Tid = u32;

/// First TID handed out after boot.
pub const FIRST_VALID_TID: Tid = 1;

/// Last TID before the rotating counter wraps back to [`FIRST_VALID_TID`].
pub const LAST_VALID_TID: Tid = 0x0FFF_FFFF;

/// 64-bit application identity: a 40-bit vendor code in the high bits and a
/// 24-bit sequence id in the low bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppId(pub u64);

/// Number of bits in the sequence-id part of an [`AppId`].
pub const APP_SEQ_ID_BITS: u32 = 24;

impl AppId {
    /// Compose an app id from its vendor and sequence parts.
    pub fn from_parts(vendor: u64, seq_id: u32) -> Self {
        AppId((vendor << APP_SEQ_ID_BITS) | u64::from(seq_id & 0x00FF_FFFF))
    }

    /// The 40-bit vendor code.
    pub fn vendor(&self) -> u64 {
        self.0 >> APP_SEQ_ID_BITS
    }

    /// The 24-bit sequence id.
    pub fn seq_id(&self) -> u32 {
        (self.0 & 0x00FF_FFFF) as u32
    }
}

impl fmt::Debug for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppId({:#018x})", self.0)
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// App-id selector used by the lifecycle batch operations. Either part may be
/// a wildcard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppIdSelector {
    /// Vendor to match, or `None` for any vendor.
    pub vendor: Option<u64>,
    /// Sequence id to match, or `None` for any sequence id.
    pub seq_id: Option<u32>,
}

impl AppIdSelector {
    /// Selector matching every app.
    pub fn any() -> Self {
        AppIdSelector { vendor: None, seq_id: None }
    }

    /// Selector matching exactly one app id.
    pub fn exact(app_id: AppId) -> Self {
        AppIdSelector {
            vendor: Some(app_id.vendor()),
            seq_id: Some(app_id.seq_id()),
        }
    }

    /// Whether `app_id` satisfies this selector.
    pub fn matches(&self, app_id: AppId) -> bool {
        self.vendor.map_or(true, |v| v == app_id.vendor())
            && self.seq_id.map_or(true, |s| s == app_id.seq_id())
    }
}

// =============================================================================
// EVENT TYPES
// =============================================================================

/// Internal event: apply a pending subscription.
pub const EVT_SUBSCRIBE_TO_EVT: u32 = 0x0000_0000;
/// Internal event: apply a pending unsubscription.
pub const EVT_UNSUBSCRIBE_TO_EVT: u32 = 0x0000_0001;
/// Internal event: run a deferred callback inside the dispatcher.
pub const EVT_DEFERRED_CALLBACK: u32 = 0x0000_0002;
/// Internal event: deliver a wrapped event to a single task.
pub const EVT_PRIVATE_EVT: u32 = 0x0000_0003;

/// First event type delivered to subscribed tasks; everything below is
/// reserved for the kernel.
pub const EVT_NO_FIRST_USER_EVENT: u32 = 0x0000_0100;

/// Broadcast once after boot, when all boot-time apps have been started.
pub const EVT_APP_START: u32 = EVT_NO_FIRST_USER_EVENT;

/// Producers may set this bit to mark an event as droppable under queue
/// pressure. It is masked off before delivery.
pub const EVENT_TYPE_BIT_DISCARDABLE: u32 = 0x8000_0000;

// =============================================================================
// EVENT DATA & FREE INFO
// =============================================================================

/// Payload attached to a queued event.
#[derive(Clone)]
pub enum EventData {
    /// No payload.
    None,
    /// An internal descriptor living in the kernel's slab.
    Internal(SlabHandle),
    /// An opaque app/driver payload.
    User(Arc<dyn Any + Send + Sync>),
}

impl EventData {
    /// Wrap a user payload.
    pub fn user<T: Any + Send + Sync>(value: T) -> Self {
        EventData::User(Arc::new(value))
    }

    /// Borrow the user payload as `T`, if that is what it is.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            EventData::User(data) => data.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl fmt::Debug for EventData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventData::None => write!(f, "EventData::None"),
            EventData::Internal(h) => write!(f, "EventData::Internal({:?})", h),
            EventData::User(_) => write!(f, "EventData::User(..)"),
        }
    }
}

/// Release hook for a user payload. Receives the payload that was attached to
/// the event.
pub type EventFreeFn = Arc<dyn Fn(EventData) + Send + Sync>;

/// The tagged free-info reference carried by every queued event. Exactly one
/// release action fires per event unless ownership is transferred through the
/// retention protocol.
#[derive(Clone)]
pub enum FreeInfo {
    /// Nothing to release.
    None,
    /// The payload descriptor returns to the kernel's internal slab.
    Slab,
    /// Call a release hook with the payload.
    Callback(EventFreeFn),
    /// The app with this TID owns the payload and is invoked to free it.
    OwningTask(Tid),
}

impl FreeInfo {
    /// True when no release action is required.
    pub fn is_none(&self) -> bool {
        matches!(self, FreeInfo::None)
    }
}

impl fmt::Debug for FreeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeInfo::None => write!(f, "FreeInfo::None"),
            FreeInfo::Slab => write!(f, "FreeInfo::Slab"),
            FreeInfo::Callback(_) => write!(f, "FreeInfo::Callback(..)"),
            FreeInfo::OwningTask(tid) => write!(f, "FreeInfo::OwningTask({})", tid),
        }
    }
}

/// Callback queued by [`Kernel::defer`]; runs synchronously inside the
/// dispatcher loop with full kernel access.
pub type DeferredCallback = Box<dyn FnOnce(&mut Kernel)>;

// =============================================================================
// APP ENTRY POINTS & HOST
// =============================================================================

/// Entry points of a hosted sensor app.
///
/// All methods run on the single dispatcher thread and run to completion
/// before the next event is dispatched. The kernel reference allows apps to
/// call the public kernel API (subscribe, enqueue, retain, ...), all of which
/// defer their effect by posting events.
pub trait SensorApp {
    /// Called once after the task is created and a TID assigned. Returning
    /// `false` rolls the task back.
    fn init(&mut self, kernel: &mut Kernel, tid: Tid) -> bool;

    /// Deliver one event. `evt_type` has the discardable bit already masked.
    fn handle(&mut self, kernel: &mut Kernel, evt_type: u32, data: &EventData);

    /// Called when the task is stopped, before it is unloaded.
    fn end(&mut self, kernel: &mut Kernel);

    /// Free a payload this app owns (the free-info was [`FreeInfo::OwningTask`]).
    fn free_event(&mut self, kernel: &mut Kernel, evt_type: u32, data: &EventData) {
        let _ = (kernel, evt_type, data);
    }
}

/// A loaded app instance. Shared between the task table and the dispatcher
/// while a handler runs; the kernel is single-threaded.
pub type AppInstance = Rc<RefCell<dyn SensorApp>>;

/// Why an app image could not be turned into a running instance.
#[derive(Debug)]
pub enum LoadError {
    /// The host has no code for this app id.
    UnknownApp(AppId),
    /// The image payload does not match what the host expects.
    BadImage(AppId),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::UnknownApp(id) => write!(f, "no loadable code for app {}", id),
            LoadError::BadImage(id) => write!(f, "malformed image for app {}", id),
        }
    }
}

/// The host capability that resolves app images into running instances.
///
/// This stands in for the platform's CPU/ABI glue: entry-point resolution and
/// per-app memory setup are the host's business, not the kernel's.
pub trait AppHost {
    /// Load an external app from its image payload.
    fn load(
        &mut self,
        header: &crate::kernel::image::AppHeader,
        payload: &[u8],
    ) -> Result<AppInstance, LoadError>;

    /// Load an internal (ROM) app; these have no flash payload.
    fn load_internal(
        &mut self,
        header: &crate::kernel::image::AppHeader,
    ) -> Result<AppInstance, LoadError>;

    /// Release host resources for an app that stopped (or never ran).
    fn unload(&mut self, header: &crate::kernel::image::AppHeader, instance: &AppInstance);
}

// =============================================================================
// MGMT STATUS
// =============================================================================

/// Packed result of a lifecycle batch operation: four saturating 8-bit
/// counters in one word, `op | erase | task | app` from low to high.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MgmtStatus(pub u32);

impl MgmtStatus {
    /// Pack four counters, each saturating at 255.
    pub fn from_counts(apps: u32, tasks: u32, ops: u32, erasures: u32) -> Self {
        let sat = |v: u32| v.min(255);
        MgmtStatus(sat(ops) | (sat(erasures) << 8) | (sat(tasks) << 16) | (sat(apps) << 24))
    }

    /// Valid app images seen by the operation.
    pub fn apps(&self) -> u32 {
        (self.0 >> 24) & 0xFF
    }

    /// Live tasks found for those images.
    pub fn tasks(&self) -> u32 {
        (self.0 >> 16) & 0xFF
    }

    /// Primary operations (starts or stops) that succeeded.
    pub fn ops(&self) -> u32 {
        self.0 & 0xFF
    }

    /// Image erasures that succeeded.
    pub fn erasures(&self) -> u32 {
        (self.0 >> 8) & 0xFF
    }
}

impl fmt::Display for MgmtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "app={} task={} op={} erase={}",
            self.apps(),
            self.tasks(),
            self.ops(),
            self.erasures()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_id_parts_roundtrip() {
        let id = AppId::from_parts(0x476F_6F67_6C, 0x00_1234);
        assert_eq!(id.vendor(), 0x476F_6F67_6C);
        assert_eq!(id.seq_id(), 0x1234);
    }

    #[test]
    fn test_selector_wildcards() {
        let id = AppId::from_parts(42, 7);
        assert!(AppIdSelector::any().matches(id));
        assert!(AppIdSelector::exact(id).matches(id));

        let vendor_only = AppIdSelector { vendor: Some(42), seq_id: None };
        assert!(vendor_only.matches(id));
        assert!(vendor_only.matches(AppId::from_parts(42, 99)));
        assert!(!vendor_only.matches(AppId::from_parts(43, 7)));

        let seq_only = AppIdSelector { vendor: None, seq_id: Some(7) };
        assert!(seq_only.matches(AppId::from_parts(1, 7)));
        assert!(!seq_only.matches(AppId::from_parts(1, 8)));
    }

    #[test]
    fn test_mgmt_status_packing() {
        let status = MgmtStatus::from_counts(2, 1, 1, 1);
        assert_eq!(status.apps(), 2);
        assert_eq!(status.tasks(), 1);
        assert_eq!(status.ops(), 1);
        assert_eq!(status.erasures(), 1);
        assert_eq!(status.0, 0x0201_0101);
    }

    #[test]
    fn test_mgmt_status_saturates() {
        let status = MgmtStatus::from_counts(1000, 300, 256, 255);
        assert_eq!(status.apps(), 255);
        assert_eq!(status.tasks(), 255);
        assert_eq!(status.ops(), 255);
        assert_eq!(status.erasures(), 255);
    }
}
