//! App lifecycle: boot enumeration, start/stop/erase batches over app-id
//! selectors, and the info queries.
//!
//! All of these run in dispatcher context, so no two operations ever race on
//! a frame's marker. Readers of the shared region tolerate markers flipping
//! VALID -> DELETED between reads.

use log::{debug, info, warn};

use crate::kernel::dispatcher::Kernel;
use crate::kernel::image::{
    AppHeader, FrameCursor, FrameInfo, APP_HDR_VER_CUR, MARKER_DELETED, MARKER_INTERNAL,
};
use crate::kernel::task::{SubscriptionList, Task, TaskImage};
use crate::kernel::traits::{
    AppId, AppIdSelector, EventData, MgmtStatus, Tid, EVT_APP_START,
};

/// Result of the info queries: where a running app sits in the task table
/// and what image it came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppInfo {
    pub index: usize,
    pub app_id: AppId,
    pub app_version: u32,
    pub app_size: u32,
}

impl Kernel {
    // =========================================================================
    // BOOT
    // =========================================================================

    /// Start the host-provided internal apps, then every valid external app
    /// in the shared region, and broadcast the start event.
    pub fn boot(&mut self, internal_apps: &[AppHeader]) -> MgmtStatus {
        debug!("starting internal apps");
        for header in internal_apps {
            if header.format_version != APP_HDR_VER_CUR {
                warn!(
                    "unexpected header version {} on internal app {}; ignored",
                    header.format_version, header.app_id
                );
                continue;
            }
            if header.marker != MARKER_INTERNAL {
                warn!(
                    "invalid marker {:#06x} on internal app {}; ignored",
                    header.marker, header.app_id
                );
                continue;
            }
            if self.tasks.find_by_app_id(header.app_id).is_some() {
                warn!(
                    "internal app {} attempts to update an already-loaded app; ignored",
                    header.app_id
                );
                continue;
            }
            self.start_app(TaskImage::Internal { header: *header });
        }
        let internal_count = self.tasks.len();

        debug!("starting external apps");
        let status = self.start_apps(AppIdSelector::any());
        info!(
            "started {} internal apps; {} total; external status: {}",
            internal_count,
            self.tasks.len(),
            status
        );

        // Let every already-loaded app know the world is up.
        self.enqueue(EVT_APP_START, EventData::None, None);
        status
    }

    // =========================================================================
    // BATCH OPERATIONS
    // =========================================================================

    /// Stop every running task whose image matches the selector.
    pub fn stop_apps(&mut self, selector: AppIdSelector) -> MgmtStatus {
        self.stop_erase_apps(selector, false)
    }

    /// Stop matching tasks, then flip their images' markers to DELETED.
    pub fn erase_apps(&mut self, selector: AppIdSelector) -> MgmtStatus {
        self.stop_erase_apps(selector, true)
    }

    /// Start the most recent valid image of every matching app id, erasing
    /// superseded duplicates along the way.
    pub fn start_apps(&mut self, selector: AppIdSelector) -> MgmtStatus {
        let mut apps = 0u32;
        let mut tasks = 0u32;
        let mut starts = 0u32;
        let mut erasures = 0u32;

        let mut cursor = FrameCursor::new();
        while let Some((frame, header)) = self.next_matching_frame(&mut cursor, selector) {
            // Skip erased or malformed images.
            if self.shared.valid_app_at(&frame).is_none() {
                continue;
            }
            apps += 1;

            // Find the most recent copy of this app id; erase each one it
            // supersedes so later passes skip them.
            let mut best_frame = frame;
            let mut best_header = header;
            let mut lookahead = cursor;
            while let Some((dup_frame, dup_header)) =
                self.next_matching_frame(&mut lookahead, AppIdSelector::exact(best_header.app_id))
            {
                if self.erase_frame(&best_frame) {
                    erasures += 1;
                }
                best_frame = dup_frame;
                best_header = dup_header;
            }

            if self.tasks.find_by_app_id(best_header.app_id).is_some() {
                // Either the freshest external copy already runs, or an
                // internal app owns this id; leave it alone.
                tasks += 1;
                continue;
            }

            if self.start_app(TaskImage::External { header: best_header, frame: best_frame }) {
                starts += 1;
            }
        }

        MgmtStatus::from_counts(apps, tasks, starts, erasures)
    }

    fn stop_erase_apps(&mut self, selector: AppIdSelector, do_erase: bool) -> MgmtStatus {
        let mut apps = 0u32;
        let mut tasks = 0u32;
        let mut stops = 0u32;
        let mut erasures = 0u32;

        let mut cursor = FrameCursor::new();
        while let Some((frame, header)) = self.next_matching_frame(&mut cursor, selector) {
            if self.shared.valid_app_at(&frame).is_none() {
                continue;
            }
            apps += 1;

            let running = self
                .tasks
                .find_by_app_id(header.app_id)
                .map(|t| (t.tid, t.image.hdr_offset()));
            let Some((tid, hdr_offset)) = running else {
                continue;
            };
            tasks += 1;

            // Only stop the task if it runs this exact image (the marker is
            // still VALID per the validity check above).
            if hdr_offset != Some(frame.payload_offset) {
                continue;
            }
            if self.stop_task(tid) {
                stops += 1;
            } else {
                continue;
            }
            if do_erase && self.erase_frame(&frame) {
                erasures += 1;
            }
        }

        MgmtStatus::from_counts(apps, tasks, stops, erasures)
    }

    // =========================================================================
    // SINGLE-TASK OPERATIONS
    // =========================================================================

    /// Load an image, create its task, and run the app's init entry. Any
    /// failure rolls the slot back.
    pub(crate) fn start_app(&mut self, image: TaskImage) -> bool {
        if self.tasks.is_full() {
            warn!(
                "app {} cannot be started: too many apps already exist",
                image.header().app_id
            );
            return false;
        }

        let load_result = match &image {
            TaskImage::Internal { header } => self.host.load_internal(header),
            TaskImage::External { header, frame } => {
                let payload = self.shared.payload_at(frame).to_vec();
                self.host.load(header, &payload)
            }
        };
        let instance = match load_result {
            Ok(instance) => instance,
            Err(err) => {
                warn!("app {} failed to load: {}", image.header().app_id, err);
                return false;
            }
        };

        let tid = self.tasks.alloc_tid();
        let app_id = image.header().app_id;
        let task = Task {
            tid,
            image,
            instance: instance.clone(),
            subscriptions: SubscriptionList::new(),
        };
        if self.tasks.add(task).is_err() {
            return false;
        }

        if !instance.borrow_mut().init(self, tid) {
            warn!("app {} failed to init", app_id);
            self.unload_task(tid);
            return false;
        }
        true
    }

    /// Stop a running task: run its end entry, then unload it. In-flight
    /// events addressed to its TID will resolve to "task not found" and be
    /// dropped with their release actions honored.
    pub fn stop_task(&mut self, tid: Tid) -> bool {
        let Some(instance) = self.tasks.instance_by_tid(tid) else {
            return false;
        };
        // A task stopping itself from inside its own handler is already
        // borrowed; skip the end entry in that case.
        if let Ok(mut app) = instance.try_borrow_mut() {
            app.end(self);
        }
        self.unload_task(tid);
        true
    }

    fn unload_task(&mut self, tid: Tid) {
        if let Some(task) = self.tasks.remove_by_tid(tid) {
            self.host.unload(task.image.header(), &task.instance);
        }
    }

    fn erase_frame(&mut self, frame: &FrameInfo) -> bool {
        self.shared
            .program(frame.marker_offset(), &MARKER_DELETED.to_le_bytes())
    }

    /// Next frame whose app id matches the selector. Validity is the
    /// caller's concern; a frame too short to carry a header never matches.
    fn next_matching_frame(
        &self,
        cursor: &mut FrameCursor,
        selector: AppIdSelector,
    ) -> Option<(FrameInfo, AppHeader)> {
        while let Some(frame) = self.shared.next_app_frame(cursor) {
            if let Some(header) = self.shared.header_at(&frame) {
                if selector.matches(header.app_id) {
                    return Some((frame, header));
                }
            }
        }
        None
    }

    // =========================================================================
    // INFO QUERIES
    // =========================================================================

    /// TID of the running app with this id.
    pub fn tid_by_id(&self, app_id: AppId) -> Option<Tid> {
        self.tasks.find_by_app_id(app_id).map(|t| t.tid)
    }

    pub fn app_info_by_id(&self, app_id: AppId) -> Option<AppInfo> {
        self.tasks
            .iter()
            .enumerate()
            .find(|(_, t)| t.app_id() == app_id)
            .map(|(index, t)| AppInfo {
                index,
                app_id,
                app_version: t.image.header().app_version,
                app_size: t.image.header().image_end,
            })
    }

    pub fn app_info_by_index(&self, index: usize) -> Option<AppInfo> {
        self.tasks.get(index).map(|t| AppInfo {
            index,
            app_id: t.app_id(),
            app_version: t.image.header().app_version,
            app_size: t.image.header().image_end,
        })
    }
}
