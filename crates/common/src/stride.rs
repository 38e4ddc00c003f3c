use crate::error::{NumStoreError, Result};
use crate::BSize;

/// A caller-supplied slice expression with Python-like presence bits:
/// `arr[start:stop:step]` where any of the three may be omitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserStride {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl UserStride {
    pub fn full() -> Self {
        Self::default()
    }
}

/// A fully-resolved, always-valid stride over an array of length `arrlen`
/// (spec §3.1, §8.1 invariant 1): `start` in `[0, arrlen]`, `step > 0`,
/// and every produced index `start + k*step` for `k < nelems` lies in
/// `[0, arrlen)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stride {
    pub start: BSize,
    pub step: u32,
    pub nelems: BSize,
}

impl Stride {
    /// Resolve a user-supplied stride against a concrete array length.
    ///
    /// Negative `start`/`stop` are interpreted relative to `arrlen` before
    /// clamping to `[0, arrlen]`. `step` must resolve to a positive value;
    /// a zero or negative step is `ERR_INVALID_ARGUMENT`.
    pub fn resolve(src: UserStride, arrlen: BSize) -> Result<Stride> {
        let step = src.step.unwrap_or(1);
        if step <= 0 {
            return Err(NumStoreError::InvalidArgument(format!(
                "stride step must be positive, got {step}"
            )));
        }

        Ok(Self::resolve_unchecked(src, arrlen, step as u64))
    }

    fn resolve_unchecked(src: UserStride, arrlen: BSize, step: u64) -> Stride {
        if arrlen == 0 {
            return Stride {
                start: 0,
                step: step as u32,
                nelems: 0,
            };
        }

        let clamp = |v: i64| -> i64 {
            let v = if v < 0 { v + arrlen as i64 } else { v };
            v.clamp(0, arrlen as i64)
        };

        let start = src.start.map(clamp).unwrap_or(0);
        let stop = src.stop.map(clamp).unwrap_or(arrlen as i64);

        let nelems = if stop <= start {
            0
        } else {
            let span = (stop - start) as u64;
            (span + step - 1) / step
        };

        Stride {
            start: start as u64,
            step: step as u32,
            nelems,
        }
    }

    /// Iterate the resolved byte/element indices this stride selects.
    pub fn indices(&self) -> impl Iterator<Item = BSize> + '_ {
        (0..self.nelems).map(move |k| self.start + k * self.step as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.nelems == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn us(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> UserStride {
        UserStride { start, stop, step }
    }

    #[test]
    fn full_slice() {
        let r = Stride::resolve(UserStride::full(), 10).unwrap();
        assert_eq!((r.start, r.step, r.nelems), (0, 1, 10));
    }

    #[test]
    fn step_only() {
        let r = Stride::resolve(us(None, None, Some(2)), 10).unwrap();
        assert_eq!((r.start, r.step, r.nelems), (0, 2, 5));
    }

    #[test]
    fn start_only() {
        let r = Stride::resolve(us(Some(5), None, None), 10).unwrap();
        assert_eq!((r.start, r.step, r.nelems), (5, 1, 5));
    }

    #[test]
    fn stop_only() {
        let r = Stride::resolve(us(None, Some(5), None), 10).unwrap();
        assert_eq!((r.start, r.step, r.nelems), (0, 1, 5));
    }

    #[test]
    fn start_stop_range() {
        let r = Stride::resolve(us(Some(2), Some(8), None), 10).unwrap();
        assert_eq!((r.start, r.step, r.nelems), (2, 1, 6));
    }

    #[test]
    fn start_stop_step() {
        let r = Stride::resolve(us(Some(1), Some(9), Some(2)), 10).unwrap();
        assert_eq!((r.start, r.step, r.nelems), (1, 2, 4));
        let indices: Vec<_> = r.indices().collect();
        assert_eq!(indices, vec![1, 3, 5, 7]);
    }

    #[test]
    fn negative_start() {
        let r = Stride::resolve(us(Some(-3), None, None), 10).unwrap();
        assert_eq!((r.start, r.step, r.nelems), (7, 1, 3));
    }

    #[test]
    fn negative_stop() {
        let r = Stride::resolve(us(None, Some(-2), None), 10).unwrap();
        assert_eq!((r.start, r.step, r.nelems), (0, 1, 8));
    }

    #[test]
    fn both_negative() {
        let r = Stride::resolve(us(Some(-5), Some(-2), None), 10).unwrap();
        assert_eq!((r.start, r.step, r.nelems), (5, 1, 3));
    }

    #[test]
    fn out_of_bounds_start_clamps() {
        let r = Stride::resolve(us(Some(20), None, None), 10).unwrap();
        assert_eq!((r.start, r.step, r.nelems), (10, 1, 0));
    }

    #[test]
    fn empty_when_stop_before_start() {
        let r = Stride::resolve(us(Some(5), Some(2), None), 10).unwrap();
        assert!(r.is_empty());
    }

    #[test]
    fn empty_array() {
        let r = Stride::resolve(UserStride::full(), 0).unwrap();
        assert_eq!((r.start, r.step, r.nelems), (0, 1, 0));
    }

    #[test]
    fn zero_step_rejected() {
        let err = Stride::resolve(us(None, None, Some(0)), 10).unwrap_err();
        assert!(matches!(err, NumStoreError::InvalidArgument(_)));
    }

    #[test]
    fn negative_step_rejected() {
        let err = Stride::resolve(us(None, None, Some(-1)), 10).unwrap_err();
        assert!(matches!(err, NumStoreError::InvalidArgument(_)));
    }

    #[test]
    fn every_index_in_bounds() {
        for arrlen in [0u64, 1, 7, 100] {
            for step in [1i64, 2, 3, 17] {
                let r = Stride::resolve(us(None, None, Some(step)), arrlen).unwrap();
                assert!(r.start <= arrlen);
                for idx in r.indices() {
                    assert!(idx < arrlen);
                }
            }
        }
    }
}
