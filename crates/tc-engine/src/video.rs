use tc_codec::FrameRange;
use tc_types::{slice_indices, IndexEntry, TypeError};

use crate::error::EngineResult;

/// Turn the frame-axis entry of an index into an ascending frame range.
///
/// A negative step selects the same frames as its ascending counterpart
/// with `reverse` set.
pub fn normalize_index(entry: Option<&IndexEntry>, nframes: usize) -> EngineResult<FrameRange> {
    match entry {
        None => Ok(FrameRange {
            start: 0,
            stop: nframes,
            step: 1,
            reverse: false,
        }),
        Some(&IndexEntry::Int(i)) => {
            let resolved = if i < 0 { i + nframes as i64 } else { i };
            if resolved < 0 || resolved >= nframes as i64 {
                return Err(TypeError::IndexOutOfBounds {
                    index: i,
                    axis: 0,
                    size: nframes,
                }
                .into());
            }
            let frame = resolved as usize;
            Ok(FrameRange {
                start: frame,
                stop: frame + 1,
                step: 1,
                reverse: false,
            })
        }
        Some(&IndexEntry::Slice { start, stop, step }) => {
            let positions = slice_indices(nframes, start, stop, step)?;
            let step = step.unwrap_or(1);
            let (Some(&first), Some(&last)) = (positions.first(), positions.last()) else {
                return Ok(FrameRange {
                    start: 0,
                    stop: 0,
                    step: 1,
                    reverse: false,
                });
            };
            if step > 0 {
                Ok(FrameRange {
                    start: first,
                    stop: last + 1,
                    step: step as usize,
                    reverse: false,
                })
            } else {
                Ok(FrameRange {
                    start: last,
                    stop: first + 1,
                    step: step.unsigned_abs() as usize,
                    reverse: true,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    fn slice(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> IndexEntry {
        IndexEntry::Slice { start, stop, step }
    }

    #[test]
    fn whole_video() {
        let r = normalize_index(None, 10).unwrap();
        assert_eq!(r.frames(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn single_frame() {
        assert_eq!(normalize_index(Some(&IndexEntry::Int(-1)), 10).unwrap().frames(), vec![9]);
        assert!(normalize_index(Some(&IndexEntry::Int(10)), 10).is_err());
    }

    #[test]
    fn out_of_range_frame_keeps_its_sign() {
        let err = normalize_index(Some(&IndexEntry::Int(-12)), 10).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Type(TypeError::IndexOutOfBounds {
                index: -12,
                axis: 0,
                size: 10
            })
        ));
        assert!(err.to_string().contains("-12"));
    }

    #[test]
    fn reversed_slice_is_ascending_with_flag() {
        let r = normalize_index(Some(&slice(None, None, Some(-3))), 10).unwrap();
        assert!(r.reverse);
        assert!(r.start < r.stop);
        assert_eq!(r.frames(), vec![9, 6, 3, 0]);
    }

    #[test]
    fn stepped_slice() {
        let r = normalize_index(Some(&slice(Some(1), Some(8), Some(3))), 10).unwrap();
        assert_eq!(r.frames(), vec![1, 4, 7]);
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn empty_slice() {
        let r = normalize_index(Some(&slice(Some(5), Some(2), None)), 10).unwrap();
        assert!(r.is_empty());
    }

    #[test]
    fn zero_step_rejected() {
        assert!(normalize_index(Some(&slice(None, None, Some(0))), 10).is_err());
    }
}
