//! Shared regions for the parallel path.
//!
//! A [`SharedRegion`] is built once per parallel invocation. Operands are
//! copied in once and then shared read-only by every chunk task through
//! [`Operands`]. The result buffer is handed out as [`OutputChunk`]s whose
//! ranges are checked to be pairwise disjoint when the region is split, so a
//! task can only ever write its own slice. Once every chunk has been dropped
//! the [`OutputCollector`] takes the buffer back without copying.

use crate::{EngineError, EngineResult};
use std::fmt;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;

// ============================================================================
// Operands
// ============================================================================

/// Read-only operand storage shared by all chunk tasks of one invocation.
#[derive(Clone)]
pub struct Operands {
    data: Arc<[f64]>,
    spans: Arc<[Range<usize>]>,
}

impl Operands {
    /// Copy `operands` into one contiguous block.
    #[must_use]
    pub fn new(operands: &[&[f64]]) -> Self {
        let total = operands.iter().map(|o| o.len()).sum();
        let mut data = Vec::with_capacity(total);
        let mut spans = Vec::with_capacity(operands.len());
        for operand in operands {
            let start = data.len();
            data.extend_from_slice(operand);
            spans.push(start..data.len());
        }
        Self {
            data: data.into(),
            spans: spans.into(),
        }
    }

    /// Operand `index`, or an empty slice if there is no such operand.
    #[must_use]
    pub fn get(&self, index: usize) -> &[f64] {
        self.spans
            .get(index)
            .map_or(&[][..], |span| &self.data[span.clone()])
    }

    /// Number of operands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Whether there are no operands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

impl fmt::Debug for Operands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operands")
            .field("spans", &self.spans)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Output buffer
// ============================================================================

struct OutputBuffer {
    ptr: NonNull<f64>,
    len: usize,
}

// Safety: the buffer is plain f64 storage. Writers only reach it through
// `OutputChunk`s, whose ranges are disjoint, and the collector only reads it
// back after every chunk is gone.
unsafe impl Send for OutputBuffer {}
unsafe impl Sync for OutputBuffer {}

impl OutputBuffer {
    fn zeroed(len: usize) -> Self {
        let boxed: Box<[f64]> = vec![0.0; len].into_boxed_slice();
        let len = boxed.len();
        let raw = Box::into_raw(boxed).cast::<f64>();
        Self {
            // Safety: Box::into_raw never returns null.
            ptr: unsafe { NonNull::new_unchecked(raw) },
            len,
        }
    }

    fn into_vec(self) -> Vec<f64> {
        let this = std::mem::ManuallyDrop::new(self);
        let slice = std::ptr::slice_from_raw_parts_mut(this.ptr.as_ptr(), this.len);
        // Safety: ptr/len came from Box::into_raw in `zeroed` and ownership
        // is transferred exactly once because Drop is suppressed.
        unsafe { Box::from_raw(slice) }.into_vec()
    }
}

impl Drop for OutputBuffer {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // Safety: see `into_vec`; this is the only other place ownership is
        // reclaimed.
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// Exclusive write access to one slice of a region's result buffer.
pub struct OutputChunk {
    buffer: Arc<OutputBuffer>,
    range: Range<usize>,
}

impl OutputChunk {
    /// The slice of the result buffer this chunk covers.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    /// Number of values in the chunk.
    #[must_use]
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Whether the chunk is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// The chunk's values.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        // Safety: `range` lies inside the buffer and no other chunk of the
        // same region overlaps it (checked in `SharedRegion::split`). The
        // returned borrow is tied to `&mut self`, so it cannot be aliased.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.buffer.ptr.as_ptr().add(self.range.start),
                self.range.len(),
            )
        }
    }
}

impl fmt::Debug for OutputChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OutputChunk").field(&self.range).finish()
    }
}

/// Takes the result buffer back once every chunk has been dropped.
pub struct OutputCollector {
    buffer: Arc<OutputBuffer>,
}

impl OutputCollector {
    /// The complete result, or `None` while some chunk is still alive.
    #[must_use]
    pub fn finish(self) -> Option<Vec<f64>> {
        Arc::try_unwrap(self.buffer).ok().map(OutputBuffer::into_vec)
    }
}

impl fmt::Debug for OutputCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputCollector")
            .field("len", &self.buffer.len)
            .field("outstanding", &(Arc::strong_count(&self.buffer) - 1))
            .finish()
    }
}

// ============================================================================
// Shared region
// ============================================================================

/// Operands plus a result buffer for one parallel invocation.
pub struct SharedRegion {
    operands: Operands,
    output: OutputBuffer,
}

impl SharedRegion {
    /// Copy `operands` in and reserve a zeroed result of `output_len` values.
    #[must_use]
    pub fn new(operands: &[&[f64]], output_len: usize) -> Self {
        Self {
            operands: Operands::new(operands),
            output: OutputBuffer::zeroed(output_len),
        }
    }

    /// Operand storage.
    #[must_use]
    pub fn operands(&self) -> &Operands {
        &self.operands
    }

    /// Length of the result buffer.
    #[must_use]
    pub fn output_len(&self) -> usize {
        self.output.len
    }

    /// Hand out the result buffer as one chunk per range.
    ///
    /// Ranges must be in bounds and pairwise disjoint; they need not cover
    /// the whole buffer.
    pub fn split(
        self,
        ranges: &[Range<usize>],
    ) -> EngineResult<(Operands, Vec<OutputChunk>, OutputCollector)> {
        let len = self.output.len;
        let mut sorted: Vec<&Range<usize>> = ranges.iter().collect();
        sorted.sort_by_key(|r| r.start);
        for range in &sorted {
            if range.start > range.end || range.end > len {
                return Err(EngineError::ShapeMismatch {
                    op: "split",
                    detail: format!("chunk {range:?} outside result of {len} values"),
                });
            }
        }
        for pair in sorted.windows(2) {
            if pair[0].end > pair[1].start {
                return Err(EngineError::ShapeMismatch {
                    op: "split",
                    detail: format!("chunks {:?} and {:?} overlap", pair[0], pair[1]),
                });
            }
        }

        let buffer = Arc::new(self.output);
        let chunks = ranges
            .iter()
            .map(|range| OutputChunk {
                buffer: Arc::clone(&buffer),
                range: range.clone(),
            })
            .collect();
        Ok((self.operands, chunks, OutputCollector { buffer }))
    }
}

impl fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("operands", &self.operands)
            .field("output_len", &self.output.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_operands_layout() {
        let ops = Operands::new(&[&[1.0, 2.0], &[], &[3.0]]);
        assert_eq!(ops.len(), 3);
        assert_eq!(ops.get(0), &[1.0, 2.0]);
        assert!(ops.get(1).is_empty());
        assert_eq!(ops.get(2), &[3.0]);
        assert!(ops.get(3).is_empty());
    }

    #[test]
    fn test_chunks_write_disjoint_slices_across_threads() {
        let region = SharedRegion::new(&[&[1.0, 2.0, 3.0, 4.0, 5.0]], 5);
        let (operands, chunks, collector) = region.split(&[0..2, 2..4, 4..5]).unwrap();

        let workers: Vec<_> = chunks
            .into_iter()
            .map(|mut chunk| {
                let operands = operands.clone();
                thread::spawn(move || {
                    let range = chunk.range();
                    let src = &operands.get(0)[range];
                    for (out, x) in chunk.as_mut_slice().iter_mut().zip(src) {
                        *out = x * 10.0;
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(collector.finish().unwrap(), vec![10.0, 20.0, 30.0, 40.0, 50.0]);
    }

    #[test]
    fn test_finish_waits_for_chunks() {
        let region = SharedRegion::new(&[], 4);
        let (_, chunks, collector) = region.split(&[0..4]).unwrap();
        let pending = OutputCollector {
            buffer: Arc::clone(&collector.buffer),
        };
        assert!(pending.finish().is_none());
        drop(chunks);
        assert_eq!(collector.finish().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_overlapping_chunks_rejected() {
        let region = SharedRegion::new(&[], 10);
        assert!(matches!(
            region.split(&[0..6, 5..10]),
            Err(EngineError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_out_of_bounds_chunk_rejected() {
        let region = SharedRegion::new(&[], 3);
        assert!(region.split(&[0..4]).is_err());
    }

    #[test]
    fn test_empty_output() {
        let region = SharedRegion::new(&[&[1.0]], 0);
        let (_, chunks, collector) = region.split(&[]).unwrap();
        assert!(chunks.is_empty());
        assert!(collector.finish().unwrap().is_empty());
    }
}
