//! Shared flash region: app image framing, header layout, and the protected
//! region writer.
//!
//! The region is a concatenation of framed records:
//!
//! ```text
//! offset 0: byte   [id2 << 4 | id1]
//! offset 1: uint24 BE payload length in bytes
//! offset 4: payload, padded to 4-byte alignment
//! then:     uint32 LE CRC-32C over header + padded payload
//! ```
//!
//! A frame carries an app iff `id1 == id2` or `id1` is the flash-loader id;
//! other nibble combinations are legacy records and are skipped. Erased
//! flash reads 0xFF, which parses as an impossibly long frame and ends the
//! walk naturally.

use crate::kernel::traits::AppId;

/// Frame prefix (id byte + 24-bit length).
pub const FRAME_HDR_SIZE: usize = 4;

/// Frame footer (CRC-32C, little endian).
pub const FRAME_CRC_SIZE: usize = 4;

/// Frame id nibble reserved for images written by the flash loader.
pub const FLASH_LOADER_FRAME_ID: u8 = 0x01;

/// App header magic.
pub const APP_HDR_MAGIC: [u8; 8] = *b"HubApp\0\0";

/// Current app header format version; anything else is skipped.
pub const APP_HDR_VER_CUR: u32 = 1;

/// Marker of a runnable external image.
pub const MARKER_VALID: u16 = 0xFF00;
/// Marker of a boot app; only legal on host-provided internal headers.
pub const MARKER_INTERNAL: u16 = 0xFF01;
/// Marker of a logically erased image. Reachable from VALID by clearing bits.
pub const MARKER_DELETED: u16 = 0x0000;

/// Serialized app header size.
pub const APP_HEADER_SIZE: usize = 32;

/// Byte offset of the marker field within the header.
pub const MARKER_OFFSET: usize = 12;

// =============================================================================
// APP HEADER
// =============================================================================

/// The fixed prefix of every app image payload.
///
/// # Layout (little endian)
/// | Offset | Field          | Size |
/// |--------|----------------|------|
/// | 0      | magic          | 8    |
/// | 8      | format_version | 4    |
/// | 12     | marker         | 2    |
/// | 14     | reserved       | 2    |
/// | 16     | app_id         | 8    |
/// | 24     | app_version    | 4    |
/// | 28     | image_end      | 4    |
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AppHeader {
    pub magic: [u8; 8],
    pub format_version: u32,
    /// The only mutable field of an image: VALID may transition to DELETED
    /// through the protected writer.
    pub marker: u16,
    pub app_id: AppId,
    pub app_version: u32,
    /// End offset of the image relative to the header; doubles as the image
    /// size reported by the info queries.
    pub image_end: u32,
}

impl AppHeader {
    pub fn new(app_id: AppId, app_version: u32, marker: u16) -> Self {
        AppHeader {
            magic: APP_HDR_MAGIC,
            format_version: APP_HDR_VER_CUR,
            marker,
            app_id,
            app_version,
            image_end: APP_HEADER_SIZE as u32,
        }
    }

    pub fn as_bytes(&self) -> [u8; APP_HEADER_SIZE] {
        let mut bytes = [0u8; APP_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.magic);
        bytes[8..12].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[12..14].copy_from_slice(&self.marker.to_le_bytes());
        // bytes[14..16] reserved (zeros)
        bytes[16..24].copy_from_slice(&self.app_id.0.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.app_version.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.image_end.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < APP_HEADER_SIZE {
            return None;
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&bytes[0..8]);
        Some(AppHeader {
            magic,
            format_version: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            marker: u16::from_le_bytes([bytes[12], bytes[13]]),
            app_id: AppId(u64::from_le_bytes([
                bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21], bytes[22],
                bytes[23],
            ])),
            app_version: u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
            image_end: u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]),
        })
    }
}

// =============================================================================
// FRAMES
// =============================================================================

/// One frame found in the shared region.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameInfo {
    /// Offset of the frame prefix byte.
    pub frame_offset: usize,
    /// Offset of the payload (and app header, if this is an app).
    pub payload_offset: usize,
    /// Unpadded payload length in bytes.
    pub payload_len: usize,
}

impl FrameInfo {
    /// Offset of the marker field of the app header in this frame.
    pub fn marker_offset(&self) -> usize {
        self.payload_offset + MARKER_OFFSET
    }
}

/// Walk position within the shared region. Cheap to clone, which is how the
/// lifecycle manager forks a lookahead scan for duplicate images.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameCursor {
    offset: usize,
}

impl FrameCursor {
    pub fn new() -> Self {
        FrameCursor { offset: 0 }
    }
}

fn padded_len(payload_len: usize) -> usize {
    (payload_len + 3) & !3
}

/// Total on-flash size of a frame with the given payload length.
pub fn frame_size(payload_len: usize) -> usize {
    FRAME_HDR_SIZE + padded_len(payload_len) + FRAME_CRC_SIZE
}

// =============================================================================
// SHARED AREA
// =============================================================================

/// The shared flash region plus the protected-region writer.
///
/// Programming obeys NOR flash semantics: bits may only be cleared. That is
/// exactly enough to flip a marker from VALID to DELETED and makes the
/// reverse transition unrepresentable.
pub struct SharedArea {
    bytes: Vec<u8>,
}

impl SharedArea {
    pub fn new(bytes: Vec<u8>) -> Self {
        SharedArea { bytes }
    }

    /// An erased region of `size` bytes (all 0xFF).
    pub fn erased(size: usize) -> Self {
        SharedArea { bytes: vec![0xFF; size] }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Advance to the next frame that carries an app, skipping legacy
    /// records. Returns `None` at the end of the region.
    pub fn next_app_frame(&self, cursor: &mut FrameCursor) -> Option<FrameInfo> {
        loop {
            let offset = cursor.offset;
            if offset + FRAME_HDR_SIZE > self.bytes.len() {
                return None;
            }
            let id_byte = self.bytes[offset];
            let id1 = id_byte & 0x0F;
            let id2 = (id_byte >> 4) & 0x0F;
            let payload_len = (usize::from(self.bytes[offset + 1]) << 16)
                | (usize::from(self.bytes[offset + 2]) << 8)
                | usize::from(self.bytes[offset + 3]);
            let total = frame_size(payload_len);
            if offset + total > self.bytes.len() {
                return None;
            }
            cursor.offset = offset + total;
            if id1 == id2 || id1 == FLASH_LOADER_FRAME_ID {
                return Some(FrameInfo {
                    frame_offset: offset,
                    payload_offset: offset + FRAME_HDR_SIZE,
                    payload_len,
                });
            }
        }
    }

    /// Parse the app header of a frame, if the payload is large enough to
    /// hold one.
    pub fn header_at(&self, frame: &FrameInfo) -> Option<AppHeader> {
        if frame.payload_len < APP_HEADER_SIZE {
            return None;
        }
        AppHeader::from_bytes(&self.bytes[frame.payload_offset..])
    }

    /// The frame's payload bytes (unpadded).
    pub fn payload_at(&self, frame: &FrameInfo) -> &[u8] {
        &self.bytes[frame.payload_offset..frame.payload_offset + frame.payload_len]
    }

    /// Header of the frame, but only when the frame is a valid app: large
    /// enough, right magic, current format version, marker VALID.
    pub fn valid_app_at(&self, frame: &FrameInfo) -> Option<AppHeader> {
        let header = self.header_at(frame)?;
        if header.magic == APP_HDR_MAGIC
            && header.format_version == APP_HDR_VER_CUR
            && header.marker == MARKER_VALID
        {
            Some(header)
        } else {
            None
        }
    }

    /// Verify the frame's CRC footer.
    pub fn frame_crc_ok(&self, frame: &FrameInfo) -> bool {
        let covered_end = frame.payload_offset + padded_len(frame.payload_len);
        let crc = crc32c::crc32c(&self.bytes[frame.frame_offset..covered_end]);
        let stored = u32::from_le_bytes([
            self.bytes[covered_end],
            self.bytes[covered_end + 1],
            self.bytes[covered_end + 2],
            self.bytes[covered_end + 3],
        ]);
        crc == stored
    }

    /// Program `data` at `offset` through the protected writer. Fails on
    /// out-of-bounds writes and on any attempt to set a cleared bit.
    pub fn program(&mut self, offset: usize, data: &[u8]) -> bool {
        let Some(target) = self.bytes.get(offset..offset + data.len()) else {
            return false;
        };
        if target.iter().zip(data).any(|(old, new)| (*new & !*old) != 0) {
            return false;
        }
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        true
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Assembles a shared region image, frame by frame. Used by the demo harness
/// and tests; on a device this is the flash loader's job.
pub struct SharedAreaBuilder {
    bytes: Vec<u8>,
}

impl SharedAreaBuilder {
    pub fn new() -> Self {
        SharedAreaBuilder { bytes: Vec::new() }
    }

    /// Append a raw frame with the given id nibbles.
    pub fn frame(mut self, id1: u8, id2: u8, payload: &[u8]) -> Self {
        let start = self.bytes.len();
        self.bytes.push((id2 << 4) | (id1 & 0x0F));
        let len = payload.len();
        self.bytes.push(((len >> 16) & 0xFF) as u8);
        self.bytes.push(((len >> 8) & 0xFF) as u8);
        self.bytes.push((len & 0xFF) as u8);
        self.bytes.extend_from_slice(payload);
        self.bytes.resize(start + FRAME_HDR_SIZE + padded_len(len), 0x00);
        let crc = crc32c::crc32c(&self.bytes[start..]);
        self.bytes.extend_from_slice(&crc.to_le_bytes());
        self
    }

    /// Append an app image frame: header followed by `body`.
    pub fn app(self, header: &AppHeader, body: &[u8]) -> Self {
        let mut payload = header.as_bytes().to_vec();
        payload.extend_from_slice(body);
        let id = FLASH_LOADER_FRAME_ID;
        self.frame(id, id, &payload)
    }

    /// Finish the region, padding to `total_size` with erased flash.
    pub fn build(mut self, total_size: usize) -> SharedArea {
        assert!(self.bytes.len() <= total_size, "region overflow");
        self.bytes.resize(total_size, 0xFF);
        SharedArea::new(self.bytes)
    }
}
