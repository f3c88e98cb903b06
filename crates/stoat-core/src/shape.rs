use std::fmt;

// Shape — ordered sequence of dimension sizes.
//
// A scalar is Shape([]) with one element; a [2, 3] matrix has 6 elements.
// The shape determines the element count, the default row-major strides,
// and broadcast compatibility between operands.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Contiguous (row-major) strides for this shape.
    ///
    /// For [2, 3, 4] the strides are [12, 4, 1]: the last dimension is
    /// contiguous in memory.
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, axis: usize) -> crate::Result<usize> {
        self.0
            .get(axis)
            .copied()
            .ok_or(crate::Error::DimOutOfRange {
                axis,
                rank: self.rank(),
            })
    }

    /// Compute the broadcast output shape of two input shapes.
    ///
    /// NumPy rules: align from the right; dimensions are compatible when
    /// equal or when one of them is 1; missing leading dimensions count
    /// as 1.
    ///
    ///   [3, 4] ⊕ [4]       → [3, 4]
    ///   [2, 1] ⊕ [1, 3]    → [2, 3]
    ///   [3] ⊕ [4]          → error
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> crate::Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else if rd == 1 {
                result.push(ld);
            } else {
                return Err(crate::Error::invalid(format!(
                    "shapes {:?} and {:?} are not broadcast-compatible (dim {} from right: {} vs {})",
                    l, r, i, ld, rd
                )));
            }
        }

        result.reverse();
        Ok(Shape::new(result))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    /// Scalar shape (0 dimensions).
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    /// 1-D shape.
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize,)> for Shape {
    fn from((d0,): (usize,)) -> Self {
        Shape(vec![d0])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::from(());
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert_eq!(s.stride_contiguous(), Vec::<usize>::new());
    }

    #[test]
    fn test_matrix_shape() {
        let s = Shape::from((3, 4));
        assert_eq!(s.rank(), 2);
        assert_eq!(s.elem_count(), 12);
        assert_eq!(s.stride_contiguous(), vec![4, 1]);
    }

    #[test]
    fn test_zero_extent() {
        let s = Shape::from((3, 0, 4));
        assert_eq!(s.elem_count(), 0);
    }

    #[test]
    fn test_broadcast_shape() {
        let a = Shape::from((3, 4));
        let b = Shape::from(4);
        assert_eq!(Shape::broadcast_shape(&a, &b).unwrap(), Shape::from((3, 4)));

        let a = Shape::from((2, 1));
        let b = Shape::from((1, 3));
        assert_eq!(Shape::broadcast_shape(&a, &b).unwrap(), Shape::from((2, 3)));

        let a = Shape::from(3);
        let b = Shape::from(4);
        assert!(Shape::broadcast_shape(&a, &b).is_err());
    }

    #[test]
    fn test_display() {
        let s = Shape::from((3, 4));
        assert_eq!(format!("{}", s), "[3, 4]");
    }
}
