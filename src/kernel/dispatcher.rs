//! The dispatcher: single-threaded event loop at the heart of the kernel.
//!
//! Locking around listener lists and task state is hard to get right when
//! mutation can start in interrupt context, so nothing mutates shared state
//! inline: every public kernel call posts an event, and the mutation happens
//! here when the event reaches the front of the queue. The dispatcher thread
//! is the only writer of the task table, the subscription sets, and the
//! current-event retention slot.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::error;

use crate::kernel::queue::{EventQueue, QueuedEvent, EVENT_QUEUE_DEPTH};
use crate::kernel::slab::SlabAllocator;
use crate::kernel::task::TaskTable;
use crate::kernel::traits::{
    AppHost, DeferredCallback, EventData, EventFreeFn, FreeInfo, Tid, EVENT_TYPE_BIT_DISCARDABLE,
    EVT_DEFERRED_CALLBACK, EVT_NO_FIRST_USER_EVENT, EVT_PRIVATE_EVT, EVT_SUBSCRIBE_TO_EVT,
    EVT_UNSUBSCRIBE_TO_EVT,
};
use crate::kernel::image::SharedArea;

/// Concurrent internal descriptors (subscriptions, deferred callbacks,
/// private-event wrappers) the kernel will hold before its API calls start
/// returning `false`.
pub const INTERNAL_EVENT_SLOTS: usize = 64;

/// Descriptors the kernel posts to itself through the event queue.
pub(crate) enum InternalEvent {
    EvtSub {
        tid: Tid,
        evt_type: u32,
    },
    EvtUnsub {
        tid: Tid,
        evt_type: u32,
    },
    Deferred {
        callback: DeferredCallback,
    },
    Private {
        evt_type: u32,
        data: EventData,
        free_info: FreeInfo,
        to_tid: Tid,
    },
}

/// Cloneable producer handle for interrupt-context code. Events sent here are
/// pulled into the bounded queue by the dispatcher; the channel is the only
/// boundary between interrupt and task context.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<QueuedEvent>,
}

impl EventSender {
    /// Post an event from interrupt context.
    pub fn send(&self, evt_type: u32, data: EventData, free: Option<EventFreeFn>) -> bool {
        let free_info = free.map(FreeInfo::Callback).unwrap_or(FreeInfo::None);
        self.tx.send(QueuedEvent { evt_type, data, free_info }).is_ok()
    }
}

/// The kernel: event queue, internal-descriptor slab, task table, shared
/// flash region, and the app host capability.
pub struct Kernel {
    pub(crate) events: EventQueue,
    pub(crate) slab: SlabAllocator<InternalEvent>,
    pub(crate) tasks: TaskTable,
    pub(crate) shared: SharedArea,
    pub(crate) host: Box<dyn AppHost>,
    /// Free-info of the event currently being dispatched. `Some` until the
    /// dispatcher performs the release action itself; taken by
    /// [`Kernel::retain_current_event`] to transfer ownership.
    cur_evt_free_info: Option<FreeInfo>,
    irq_tx: Sender<QueuedEvent>,
    irq_rx: Receiver<QueuedEvent>,
}

impl Kernel {
    /// Create a kernel over a shared flash region and an app host.
    pub fn new(shared: SharedArea, host: Box<dyn AppHost>) -> Self {
        let (irq_tx, irq_rx) = unbounded();
        Kernel {
            events: EventQueue::new(EVENT_QUEUE_DEPTH),
            slab: SlabAllocator::new(INTERNAL_EVENT_SLOTS),
            tasks: TaskTable::new(),
            shared,
            host,
            cur_evt_free_info: None,
            irq_tx,
            irq_rx,
        }
    }

    /// Producer handle for interrupt-context code.
    pub fn event_sender(&self) -> EventSender {
        EventSender { tx: self.irq_tx.clone() }
    }

    /// The shared flash region (read-only; writes go through the lifecycle
    /// operations).
    pub fn shared(&self) -> &SharedArea {
        &self.shared
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    // =========================================================================
    // PUBLIC KERNEL API — all effects are deferred through the queue
    // =========================================================================

    /// Ask for `tid` to start receiving `evt_type`. Takes effect when the
    /// request reaches the front of the queue. Returns `false` only when the
    /// internal slab or queue is exhausted.
    pub fn subscribe(&mut self, tid: Tid, evt_type: u32) -> bool {
        self.enqueue_internal(
            EVT_SUBSCRIBE_TO_EVT,
            InternalEvent::EvtSub { tid, evt_type },
            false,
        )
    }

    /// Undo a subscription; same deferral and failure contract as
    /// [`Kernel::subscribe`].
    pub fn unsubscribe(&mut self, tid: Tid, evt_type: u32) -> bool {
        self.enqueue_internal(
            EVT_UNSUBSCRIBE_TO_EVT,
            InternalEvent::EvtUnsub { tid, evt_type },
            false,
        )
    }

    /// Broadcast an event to every subscribed task.
    pub fn enqueue(&mut self, evt_type: u32, data: EventData, free: Option<EventFreeFn>) -> bool {
        let free_info = free.map(FreeInfo::Callback).unwrap_or(FreeInfo::None);
        self.enqueue_event(evt_type, data, free_info, false)
    }

    /// Like [`Kernel::enqueue`], but performs the release action immediately
    /// when the queue refuses the event.
    pub fn enqueue_or_free(
        &mut self,
        evt_type: u32,
        data: EventData,
        free: Option<EventFreeFn>,
    ) -> bool {
        let free_info = free.map(FreeInfo::Callback).unwrap_or(FreeInfo::None);
        if self.enqueue_event(evt_type, data.clone(), free_info.clone(), false) {
            return true;
        }
        self.handle_event_freeing(evt_type, &data, free_info);
        false
    }

    /// Broadcast an event whose payload is owned by the posting app: the app
    /// is invoked to free it after delivery.
    pub fn enqueue_as_app(&mut self, evt_type: u32, data: EventData, from_tid: Tid) -> bool {
        self.enqueue_event(evt_type, data, FreeInfo::OwningTask(from_tid), false)
    }

    /// Run `callback` inside the dispatcher loop. Urgent callbacks jump the
    /// queue and run before already-queued events.
    pub fn defer<F>(&mut self, callback: F, urgent: bool) -> bool
    where
        F: FnOnce(&mut Kernel) + 'static,
    {
        self.enqueue_internal(
            EVT_DEFERRED_CALLBACK,
            InternalEvent::Deferred { callback: Box::new(callback) },
            urgent,
        )
    }

    /// Deliver an event to exactly one task, bypassing subscriptions.
    pub fn enqueue_private(
        &mut self,
        evt_type: u32,
        data: EventData,
        free: Option<EventFreeFn>,
        to_tid: Tid,
    ) -> bool {
        let free_info = free.map(FreeInfo::Callback).unwrap_or(FreeInfo::None);
        self.enqueue_private_ex(evt_type, data, free_info, to_tid)
    }

    /// Private delivery with an app-owned payload.
    pub fn enqueue_private_as_app(
        &mut self,
        evt_type: u32,
        data: EventData,
        from_tid: Tid,
        to_tid: Tid,
    ) -> bool {
        self.enqueue_private_ex(evt_type, data, FreeInfo::OwningTask(from_tid), to_tid)
    }

    /// Transfer ownership of the in-flight event's release action to the
    /// caller. Returns `None` when there is no current event, the event is
    /// not retainable, or it was already retained.
    pub fn retain_current_event(&mut self) -> Option<FreeInfo> {
        self.cur_evt_free_info.take()
    }

    /// Perform the release action for an event retained earlier. This is
    /// exactly what the dispatcher would have done at the end of dispatch.
    pub fn free_retained_event(&mut self, evt_type: u32, data: &EventData, free_info: FreeInfo) {
        self.handle_event_freeing(evt_type, data, free_info);
    }

    // =========================================================================
    // DISPATCH LOOP
    // =========================================================================

    /// Dispatch a single event. Returns `false` when the queue is empty.
    pub fn dispatch_one(&mut self) -> bool {
        self.drain_irq_events();
        self.release_discarded();

        let Some(QueuedEvent { evt_type, data, free_info }) = self.events.dequeue() else {
            return false;
        };

        // By default the dispatcher releases the payload when dispatch ends;
        // a handler may take the slot to defer that.
        self.cur_evt_free_info = Some(free_info);

        if evt_type < EVT_NO_FIRST_USER_EVENT {
            self.handle_internal_event(&data);
        } else {
            let masked = evt_type & !EVENT_TYPE_BIT_DISCARDABLE;
            let receivers: Vec<Tid> = self
                .tasks
                .iter()
                .filter(|t| t.subscriptions.contains(masked))
                .map(|t| t.tid)
                .collect();
            for tid in receivers {
                // Re-resolve: an earlier handler may have stopped this task.
                if let Some(instance) = self.tasks.instance_by_tid(tid) {
                    instance.borrow_mut().handle(self, masked, &data);
                }
            }
        }

        if let Some(free_info) = self.cur_evt_free_info.take() {
            self.handle_event_freeing(evt_type, &data, free_info);
        }
        true
    }

    /// Dispatch until the queue runs dry. Returns the number of events
    /// handled.
    pub fn run_until_idle(&mut self) -> usize {
        let mut handled = 0;
        while self.dispatch_one() {
            handled += 1;
        }
        handled
    }

    /// Suspension point: sleep until a producer posts an event or `timeout`
    /// elapses. Returns `true` when there is work to dispatch.
    pub fn wait_for_event(&mut self, timeout: Duration) -> bool {
        if !self.events.is_empty() {
            return true;
        }
        match self.irq_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.admit_external(event);
                true
            }
            Err(_) => false,
        }
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn enqueue_event(
        &mut self,
        evt_type: u32,
        data: EventData,
        free_info: FreeInfo,
        urgent: bool,
    ) -> bool {
        self.events
            .enqueue(QueuedEvent { evt_type, data, free_info }, urgent)
            .is_ok()
    }

    /// Allocate an internal descriptor and queue it. The descriptor returns
    /// to the slab either when it is handled or when the event is dropped.
    fn enqueue_internal(&mut self, evt_type: u32, event: InternalEvent, urgent: bool) -> bool {
        let Some(handle) = self.slab.alloc(event) else {
            return false;
        };
        let queued = QueuedEvent {
            evt_type,
            data: EventData::Internal(handle),
            free_info: FreeInfo::Slab,
        };
        match self.events.enqueue(queued, urgent) {
            Ok(()) => true,
            Err(_rejected) => {
                self.slab.take(handle);
                false
            }
        }
    }

    fn enqueue_private_ex(
        &mut self,
        evt_type: u32,
        data: EventData,
        free_info: FreeInfo,
        to_tid: Tid,
    ) -> bool {
        let Some(handle) = self.slab.alloc(InternalEvent::Private {
            evt_type,
            data: data.clone(),
            free_info: free_info.clone(),
            to_tid,
        }) else {
            return false;
        };
        let queued = QueuedEvent {
            evt_type: EVT_PRIVATE_EVT,
            data: EventData::Internal(handle),
            free_info: FreeInfo::Slab,
        };
        match self.events.enqueue(queued, false) {
            Ok(()) => true,
            Err(_rejected) => {
                self.slab.take(handle);
                // The wrapped payload never got queued; release it now.
                self.handle_event_freeing(evt_type, &data, free_info);
                false
            }
        }
    }

    fn handle_internal_event(&mut self, data: &EventData) {
        let EventData::Internal(handle) = data else {
            return;
        };
        // Taking the descriptor frees its slot; the FreeInfo::Slab release at
        // the end of dispatch then finds it already gone.
        let Some(event) = self.slab.take(*handle) else {
            return;
        };

        match event {
            InternalEvent::EvtSub { tid, evt_type } => self.apply_subscription(tid, evt_type, true),
            InternalEvent::EvtUnsub { tid, evt_type } => {
                self.apply_subscription(tid, evt_type, false)
            }
            InternalEvent::Deferred { callback } => callback(self),
            InternalEvent::Private { evt_type, data, free_info, to_tid } => {
                if let Some(instance) = self.tasks.instance_by_tid(to_tid) {
                    // Private events cannot be retained: park the retention
                    // slot across the app call.
                    let saved = self.cur_evt_free_info.take();
                    instance.borrow_mut().handle(self, evt_type, &data);
                    self.cur_evt_free_info = saved;
                }
                // Whether or not the task was found, the payload is released.
                self.handle_event_freeing(evt_type, &data, free_info);
            }
        }
    }

    fn apply_subscription(&mut self, tid: Tid, evt_type: u32, subscribe: bool) {
        let Some(task) = self.tasks.find_by_tid_mut(tid) else {
            return;
        };
        if subscribe {
            task.subscriptions.subscribe(evt_type);
        } else {
            task.subscriptions.unsubscribe(evt_type);
        }
    }

    /// Perform an event's release action exactly once.
    pub(crate) fn handle_event_freeing(
        &mut self,
        evt_type: u32,
        data: &EventData,
        free_info: FreeInfo,
    ) {
        match free_info {
            FreeInfo::None => {}
            FreeInfo::Slab => {
                if let EventData::Internal(handle) = data {
                    self.slab.take(*handle);
                }
            }
            FreeInfo::Callback(free) => free(data.clone()),
            FreeInfo::OwningTask(tid) => match self.tasks.instance_by_tid(tid) {
                Some(instance) => instance.borrow_mut().free_event(self, evt_type, data),
                None => error!(
                    "no app with tid {} to free event {:#010x}; payload dropped in place",
                    tid, evt_type
                ),
            },
        }
    }

    /// Pull interrupt-context events into the bounded queue.
    fn drain_irq_events(&mut self) {
        while let Ok(event) = self.irq_rx.try_recv() {
            self.admit_external(event);
        }
    }

    fn admit_external(&mut self, event: QueuedEvent) {
        if let Err(rejected) = self.events.enqueue(event, false) {
            let QueuedEvent { evt_type, data, free_info } = rejected;
            self.handle_event_freeing(evt_type, &data, free_info);
        }
    }

    /// Release events the queue dropped under overflow pressure.
    fn release_discarded(&mut self) {
        for event in self.events.take_discarded() {
            let QueuedEvent { evt_type, data, free_info } = event;
            self.handle_event_freeing(evt_type, &data, free_info);
        }
    }
}
