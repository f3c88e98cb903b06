use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — shape + strides + offset.
//
// The layout decouples a tensor's logical shape from how its data sits in
// flat storage, which is what makes transpose, narrow, and broadcast views
// free (no data copy, just different strides/offset):
//
//   - transpose: swap shape entries and strides
//   - narrow: bump the offset, shrink one dimension
//   - broadcast: stride 0 along a repeated dimension — reading never
//     advances, so the single element is reused
//
// A layout is contiguous when offset is 0 and the strides equal the
// row-major strides of its shape; non-contiguous tensors are copied into
// contiguous storage before ops that need flat memory.

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Create a new contiguous (row-major) layout for the given shape.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Create a layout with explicit strides and offset (for views).
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Whether this layout is a dense row-major view starting at offset 0.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// Swap two dimensions. No data movement.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                axis: dim0.max(dim1),
                rank,
            });
        }
        let mut new_dims = self.shape.dims().to_vec();
        let mut new_strides = self.strides.clone();
        new_dims.swap(dim0, dim1);
        new_strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(new_dims), new_strides, self.offset))
    }

    /// Slice along a dimension: same storage, adjusted shape and offset.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Layout> {
        let rank = self.rank();
        if axis >= rank {
            return Err(Error::DimOutOfRange { axis, rank });
        }
        let axis_size = self.shape.dims()[axis];
        if start + len > axis_size {
            return Err(Error::NarrowOutOfBounds {
                axis,
                start,
                len,
                axis_size,
            });
        }
        let mut new_dims = self.shape.dims().to_vec();
        new_dims[axis] = len;
        let new_offset = self.offset + start * self.strides[axis];
        Ok(Layout::new(
            Shape::new(new_dims),
            self.strides.clone(),
            new_offset,
        ))
    }

    /// Broadcast view of this layout to `target`, right-aligned.
    ///
    /// Every source dimension must equal the corresponding target dimension
    /// or be 1 (stride set to 0); missing leading dimensions get stride 0.
    /// The result reuses the same storage.
    pub fn broadcast_to(&self, target: &Shape) -> Result<Layout> {
        let src_dims = self.dims();
        let dst_dims = target.dims();
        if src_dims.len() > dst_dims.len() {
            return Err(Error::invalid(format!(
                "cannot broadcast {} to lower-rank shape {}",
                self.shape, target
            )));
        }
        let lead = dst_dims.len() - src_dims.len();
        let mut strides = vec![0usize; dst_dims.len()];
        for (i, (&sd, &dd)) in src_dims.iter().zip(dst_dims[lead..].iter()).enumerate() {
            if sd == dd {
                strides[lead + i] = self.strides[i];
            } else if sd == 1 {
                strides[lead + i] = 0;
            } else {
                return Err(Error::invalid(format!(
                    "cannot broadcast {} to {} (dim {}: {} vs {})",
                    self.shape,
                    target,
                    i,
                    sd,
                    dd
                )));
            }
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// Flat storage index of a multi-dimensional index.
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let mut flat = self.offset;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx * self.strides[i];
        }
        flat
    }

    /// Iterator over all flat storage indices of this layout, in logical
    /// row-major order. Handles non-contiguous and broadcast views.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Iterator that yields flat storage indices for each element of a Layout.
///
/// For a contiguous layout this counts 0, 1, 2, ...; for a transposed or
/// broadcast view it follows the strides.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            offset: layout.offset(),
            remaining: layout.elem_count(),
            started: false,
        }
    }

    fn flat_index(&self) -> usize {
        let mut idx = self.offset;
        for i in 0..self.current.len() {
            idx += self.current[i] * self.strides[i];
        }
        idx
    }

    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat_index())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    #[test]
    fn test_contiguous_layout() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        assert!(layout.is_contiguous());
        assert_eq!(layout.strides(), &[3, 1]);
        let idx: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(idx, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_transpose_indices() {
        // [2,3] transposed reads column-major: 0, 3, 1, 4, 2, 5
        let layout = Layout::contiguous(Shape::from((2, 3)));
        let t = layout.transpose(0, 1).unwrap();
        assert_eq!(t.dims(), &[3, 2]);
        assert!(!t.is_contiguous());
        let idx: Vec<usize> = t.strided_indices().collect();
        assert_eq!(idx, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_narrow() {
        let layout = Layout::contiguous(Shape::from((4, 6)));
        let n = layout.narrow(1, 2, 3).unwrap();
        assert_eq!(n.dims(), &[4, 3]);
        assert_eq!(n.offset(), 2);
        assert_eq!(n.strides(), &[6, 1]);
        assert!(layout.narrow(1, 5, 3).is_err());
    }

    #[test]
    fn test_broadcast_same_rank() {
        // [1, 3] broadcast to [4, 3]: dim 0 repeats via stride 0
        let layout = Layout::contiguous(Shape::from((1, 3)));
        let b = layout.broadcast_to(&Shape::from((4, 3))).unwrap();
        assert_eq!(b.dims(), &[4, 3]);
        assert_eq!(b.strides(), &[0, 1]);
        let idx: Vec<usize> = b.strided_indices().collect();
        assert_eq!(idx, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_broadcast_rank_promotion() {
        // [3] broadcast to [2, 3]: new leading dim gets stride 0
        let layout = Layout::contiguous(Shape::from(3));
        let b = layout.broadcast_to(&Shape::from((2, 3))).unwrap();
        assert_eq!(b.strides(), &[0, 1]);
    }

    #[test]
    fn test_broadcast_incompatible() {
        let layout = Layout::contiguous(Shape::from(3));
        assert!(layout.broadcast_to(&Shape::from((2, 4))).is_err());
    }

    #[test]
    fn test_flat_index() {
        let layout = Layout::contiguous(Shape::from((2, 3, 4)));
        assert_eq!(layout.flat_index(&[1, 2, 3]), 23);
        assert_eq!(layout.flat_index(&[0, 0, 0]), 0);
    }
}
