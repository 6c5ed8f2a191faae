//! Task table and per-task subscription sets.
//!
//! Pointers into the table may move (slot deletion swaps with the last
//! entry); TIDs never do. Everything that crosses a dispatch boundary refers
//! to tasks by TID and re-resolves.

use crate::kernel::image::{AppHeader, FrameInfo};
use crate::kernel::traits::{AppId, AppInstance, Tid, FIRST_VALID_TID, LAST_VALID_TID};

/// Upper bound on concurrently live tasks.
pub const MAX_TASKS: usize = 16;

/// Subscription slots a task gets without growing.
pub const MAX_EMBEDDED_EVT_SUBS: usize = 6;

// =============================================================================
// SUBSCRIPTION SET
// =============================================================================

/// Set of event types a task receives. Starts at the embedded capacity and
/// grows by 1.5x (rounded up) when full. Holds no duplicates.
#[derive(Debug)]
pub struct SubscriptionList {
    events: Vec<u32>,
    limit: usize,
}

impl SubscriptionList {
    pub fn new() -> Self {
        SubscriptionList {
            events: Vec::with_capacity(MAX_EMBEDDED_EVT_SUBS),
            limit: MAX_EMBEDDED_EVT_SUBS,
        }
    }

    pub fn contains(&self, evt_type: u32) -> bool {
        self.events.iter().any(|&e| e == evt_type)
    }

    /// Add `evt_type` if absent. Adding an already-present type is a no-op.
    pub fn subscribe(&mut self, evt_type: u32) {
        if self.contains(evt_type) {
            return;
        }
        if self.events.len() == self.limit {
            self.limit = (self.limit * 3 + 1) / 2;
            self.events.reserve(self.limit - self.events.len());
        }
        self.events.push(evt_type);
    }

    /// Remove `evt_type` if present (swap-remove; order is not meaningful).
    pub fn unsubscribe(&mut self, evt_type: u32) {
        if let Some(pos) = self.events.iter().position(|&e| e == evt_type) {
            self.events.swap_remove(pos);
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Current growth limit; `len() <= capacity()` always holds.
    pub fn capacity(&self) -> usize {
        self.limit
    }
}

// =============================================================================
// TASK
// =============================================================================

/// Which image a task was started from.
#[derive(Clone, Debug)]
pub enum TaskImage {
    /// One of the host-provided boot apps; not present in the shared region.
    Internal { header: AppHeader },
    /// An image in the shared flash region; the frame identifies the exact
    /// image the task was started from.
    External { header: AppHeader, frame: FrameInfo },
}

impl TaskImage {
    pub fn header(&self) -> &AppHeader {
        match self {
            TaskImage::Internal { header } => header,
            TaskImage::External { header, .. } => header,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, TaskImage::Internal { .. })
    }

    /// Offset of the header in the shared region, for external images.
    pub fn hdr_offset(&self) -> Option<usize> {
        match self {
            TaskImage::Internal { .. } => None,
            TaskImage::External { frame, .. } => Some(frame.payload_offset),
        }
    }
}

/// One live task.
pub struct Task {
    pub tid: Tid,
    pub image: TaskImage,
    pub instance: AppInstance,
    pub subscriptions: SubscriptionList,
}

impl Task {
    pub fn app_id(&self) -> AppId {
        self.image.header().app_id
    }
}

// =============================================================================
// TASK TABLE
// =============================================================================

/// Bounded table of live tasks plus the rotating TID counter.
pub struct TaskTable {
    tasks: Vec<Task>,
    next_tid: Tid,
}

impl TaskTable {
    pub fn new() -> Self {
        TaskTable {
            tasks: Vec::with_capacity(MAX_TASKS),
            next_tid: FIRST_VALID_TID,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_full(&self) -> bool {
        self.tasks.len() >= MAX_TASKS
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    pub fn find_by_tid(&self, tid: Tid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.tid != 0 && t.tid == tid)
    }

    pub fn find_by_tid_mut(&mut self, tid: Tid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.tid != 0 && t.tid == tid)
    }

    pub fn find_by_app_id(&self, app_id: AppId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.app_id() == app_id)
    }

    /// Clone out the app instance for `tid`, releasing the table borrow so
    /// the dispatcher can call into the app with the kernel available.
    pub fn instance_by_tid(&self, tid: Tid) -> Option<AppInstance> {
        self.find_by_tid(tid).map(|t| t.instance.clone())
    }

    /// Next unused TID. Rotates through the valid range, skipping TIDs of
    /// live tasks.
    pub fn alloc_tid(&mut self) -> Tid {
        loop {
            if self.next_tid == LAST_VALID_TID {
                self.next_tid = FIRST_VALID_TID;
            } else {
                self.next_tid += 1;
            }
            if self.find_by_tid(self.next_tid).is_none() {
                return self.next_tid;
            }
        }
    }

    /// Insert a task. The caller must have checked [`TaskTable::is_full`].
    pub fn add(&mut self, task: Task) -> Result<(), Task> {
        if self.is_full() {
            return Err(task);
        }
        self.tasks.push(task);
        Ok(())
    }

    /// Remove the task with `tid`, swapping the last slot into its position.
    pub fn remove_by_tid(&mut self, tid: Tid) -> Option<Task> {
        let pos = self.tasks.iter().position(|t| t.tid == tid)?;
        Some(self.tasks.swap_remove(pos))
    }
}
