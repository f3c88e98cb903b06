// Fused select programs — memoized per (dtype, device) pair
//
// The masked-select kernel is specialized by element type and by the
// device it runs on. Building that specialization has a fixed cost, so
// programs are cached in a process-wide table: the first `where_` call
// for a given (dtype, device) pair constructs the program, every later
// call reuses the same Arc. The cache only ever grows; the number of
// distinct (dtype, device) pairs in a process is small and bounded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use stoat_core::{Backend, DType, Result, Tensor};

/// A select routine specialized for one element type on one device.
///
/// Executes `mask ? x : y` element-wise. The mask must be `Bool`; `x`
/// and `y` must both have the program's dtype and live on the program's
/// device. Callers obtain instances through [`select_program`], never
/// by constructing them directly, so two calls with the same key always
/// share one program.
#[derive(Debug)]
pub struct SelectProgram {
    dtype: DType,
    device: String,
}

impl SelectProgram {
    fn new(dtype: DType, device: String) -> Self {
        SelectProgram { dtype, device }
    }

    /// Element type this program selects over.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Name of the device this program was built for.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Run the select: `out[i] = if mask[i] { x[i] } else { y[i] }`.
    ///
    /// All three tensors must already share one shape; broadcasting is
    /// the caller's job. Gradients flow to `x` and `y` through the
    /// mask routing; the mask itself receives none.
    pub fn execute<B: Backend>(
        &self,
        mask: &Tensor<B>,
        x: &Tensor<B>,
        y: &Tensor<B>,
    ) -> Result<Tensor<B>> {
        debug_assert_eq!(x.dtype(), self.dtype);
        Tensor::fused_select(mask, x, y)
    }
}

static PROGRAMS: Lazy<Mutex<HashMap<(DType, String), Arc<SelectProgram>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Fetch the select program for `(dtype, device)`, building it on first
/// use. Later calls with the same key return the same Arc.
pub fn select_program(dtype: DType, device: &str) -> Arc<SelectProgram> {
    let mut table = PROGRAMS.lock().unwrap_or_else(|e| e.into_inner());
    table
        .entry((dtype, device.to_string()))
        .or_insert_with(|| Arc::new(SelectProgram::new(dtype, device.to_string())))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn programs_are_memoized() {
        let a = select_program(DType::F32, "cpu");
        let b = select_program(DType::F32, "cpu");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.dtype(), DType::F32);
        assert_eq!(a.device(), "cpu");
    }

    #[test]
    fn distinct_keys_get_distinct_programs() {
        let a = select_program(DType::F32, "cpu");
        let b = select_program(DType::I32, "cpu");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
