//! Scatter lists and the non-owning views units carry into them.
//!
//! A [`ScatterList`] is the command's data buffer: a list of independently locked
//! segments. Splitting a command never copies data; each unit gets a [`BufferView`]
//! naming `(segment, offset, len)` triples. A segment that straddles a unit boundary
//! shows up truncated in one view and continued in the next.

use std::sync::Arc;

use parking_lot::Mutex;

/// One contiguous piece of a data buffer.
pub struct Segment {
    bytes: Mutex<Vec<u8>>,
}

impl Segment {
    fn new(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(bytes),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A command's data buffer. Cloning shares the segments.
#[derive(Clone, Default)]
pub struct ScatterList {
    segments: Vec<Arc<Segment>>,
    len: usize,
}

impl ScatterList {
    /// Single segment list around `bytes`.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self::from_segments(vec![bytes])
    }

    pub fn from_segments(segments: Vec<Vec<u8>>) -> Self {
        let len = segments.iter().map(Vec::len).sum();
        Self {
            segments: segments.into_iter().map(Segment::new).collect(),
            len,
        }
    }

    /// Zero-filled list of `len` bytes cut into `segment_size` pieces.
    pub fn zeroed(len: usize, segment_size: usize) -> Self {
        let segment_size = segment_size.max(1);
        let mut segments = Vec::with_capacity(len.div_ceil(segment_size));
        let mut remaining = len;
        while remaining > 0 {
            let this = remaining.min(segment_size);
            segments.push(vec![0u8; this]);
            remaining -= this;
        }
        Self::from_segments(segments)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Copies the whole list out.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for segment in &self.segments {
            out.extend_from_slice(&segment.bytes.lock());
        }
        out
    }

    /// A view over `[offset, offset + len)`. The range is clamped to the list.
    pub fn view(&self, offset: usize, len: usize) -> BufferView {
        let end = offset.saturating_add(len).min(self.len);
        let mut entries = Vec::new();
        let mut base = 0usize;
        for segment in &self.segments {
            let seg_len = segment.len();
            let seg_end = base + seg_len;
            if seg_end > offset && base < end {
                let start = offset.max(base);
                let stop = end.min(seg_end);
                entries.push(ViewEntry {
                    segment: Arc::clone(segment),
                    offset: start - base,
                    len: stop - start,
                });
            }
            if seg_end >= end {
                break;
            }
            base = seg_end;
        }
        BufferView {
            entries,
            len: end.saturating_sub(offset),
        }
    }
}

impl std::fmt::Debug for ScatterList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScatterList")
            .field("len", &self.len)
            .field("segments", &self.segments.len())
            .finish()
    }
}

/// A `(segment, offset, len)` triple inside a [`BufferView`].
#[derive(Clone)]
pub struct ViewEntry {
    segment: Arc<Segment>,
    offset: usize,
    len: usize,
}

impl ViewEntry {
    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A unit's window into its command's [`ScatterList`].
#[derive(Clone, Default)]
pub struct BufferView {
    entries: Vec<ViewEntry>,
    len: usize,
}

impl BufferView {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn entries(&self) -> &[ViewEntry] {
        &self.entries
    }

    /// Fills the view from `src` (a Data-In transfer). Returns the bytes written.
    pub fn copy_from_slice(&self, src: &[u8]) -> usize {
        let mut written = 0;
        for entry in &self.entries {
            if written >= src.len() {
                break;
            }
            let n = entry.len.min(src.len() - written);
            let mut bytes = entry.segment.bytes.lock();
            bytes[entry.offset..entry.offset + n].copy_from_slice(&src[written..written + n]);
            written += n;
        }
        written
    }

    /// Drains the view into `dst` (a Data-Out transfer). Returns the bytes read.
    pub fn copy_to_slice(&self, dst: &mut [u8]) -> usize {
        let mut read = 0;
        for entry in &self.entries {
            if read >= dst.len() {
                break;
            }
            let n = entry.len.min(dst.len() - read);
            let bytes = entry.segment.bytes.lock();
            dst[read..read + n].copy_from_slice(&bytes[entry.offset..entry.offset + n]);
            read += n;
        }
        read
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.copy_to_slice(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straddling_segment_is_split_between_views() {
        let sgl = ScatterList::from_segments(vec![vec![1; 6], vec![2; 6]]);
        let first = sgl.view(0, 4);
        let second = sgl.view(4, 4);
        let third = sgl.view(8, 4);

        assert_eq!(first.entries().len(), 1);
        assert_eq!(second.entries().len(), 2);
        assert_eq!(second.entries()[0].offset(), 4);
        assert_eq!(second.entries()[0].len(), 2);
        assert_eq!(second.entries()[1].offset(), 0);
        assert_eq!(second.entries()[1].len(), 2);
        assert_eq!(second.to_vec(), vec![1, 1, 2, 2]);
        assert_eq!(third.to_vec(), vec![2; 4]);
    }

    #[test]
    fn views_share_segments() {
        let sgl = ScatterList::zeroed(8, 8);
        let view = sgl.view(2, 4);
        assert!(Arc::ptr_eq(view.entries()[0].segment(), &sgl.segments[0]));
        view.copy_from_slice(&[9, 9, 9, 9]);
        assert_eq!(sgl.to_vec(), vec![0, 0, 9, 9, 9, 9, 0, 0]);
    }

    #[test]
    fn zeroed_cuts_segments() {
        let sgl = ScatterList::zeroed(10, 4);
        assert_eq!(sgl.segment_count(), 3);
        assert_eq!(sgl.len(), 10);
        assert!(ScatterList::zeroed(0, 4).is_empty());
    }

    #[test]
    fn view_is_clamped_to_list() {
        let sgl = ScatterList::from_vec(vec![7; 4]);
        let view = sgl.view(2, 10);
        assert_eq!(view.len(), 2);
        assert_eq!(view.to_vec(), vec![7, 7]);
    }
}
