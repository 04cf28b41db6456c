/// Read-ahead of patches on a background thread
///
/// Reading a patch from a mapped volume pages data in from disk. The reader
/// thread stays at most `depth` patches ahead of inference, so memory use is
/// bounded regardless of the plan length.

use crossbeam_channel::bounded;
use ndarray::ArrayD;

use crate::error::ScanResult;
use crate::scan::ScanPlan;

/// Visit every planned patch in row-major order
///
/// `read` turns an origin into a patch and may run on the reader thread.
/// `visit` always runs on the calling thread, in plan order. The first error
/// from either side stops the scan and is returned.
pub fn for_each_patch<R, F>(plan: &ScanPlan, depth: usize, read: R, mut visit: F) -> ScanResult<()>
where
    R: Fn(&[usize]) -> ScanResult<ArrayD<f32>> + Sync,
    F: FnMut(Vec<usize>, ArrayD<f32>) -> ScanResult<()>,
{
    if depth == 0 {
        for origin in plan.cursor() {
            let patch = read(&origin)?;
            visit(origin, patch)?;
        }
        return Ok(());
    }

    let (sender, receiver) = bounded::<(Vec<usize>, ScanResult<ArrayD<f32>>)>(depth);
    let read = &read;

    std::thread::scope(|scope| {
        scope.spawn(move || {
            for origin in plan.cursor() {
                let patch = read(&origin);
                let failed = patch.is_err();
                // Receiver gone means the consumer stopped early
                if sender.send((origin, patch)).is_err() || failed {
                    break;
                }
            }
        });

        let mut result = Ok(());
        for (origin, patch) in receiver.iter() {
            if let Err(e) = patch.and_then(|patch| visit(origin, patch)) {
                result = Err(e);
                break;
            }
        }
        // Unblocks a reader waiting on a full channel before the scope joins it
        drop(receiver);
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::invalid_config;
    use crate::scan::{plan, BlendKernel, StridePolicy};
    use ndarray::IxDyn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_plan() -> ScanPlan {
        let stride = StridePolicy::uniform_overlap(2, 0.5, BlendKernel::Uniform);
        plan(&[8, 8], &[4, 4], &stride).expect("Failed to plan")
    }

    fn origin_patch(origin: &[usize]) -> ScanResult<ArrayD<f32>> {
        Ok(ArrayD::from_elem(IxDyn(&[1]), (origin[0] * 100 + origin[1]) as f32))
    }

    #[test]
    fn test_prefetch_preserves_plan_order() {
        let plan = small_plan();
        let expected: Vec<Vec<usize>> = plan.cursor().collect();

        for depth in [0, 1, 3] {
            let mut seen = Vec::new();
            for_each_patch(&plan, depth, origin_patch, |origin, patch| {
                assert_eq!(patch[[0]], (origin[0] * 100 + origin[1]) as f32);
                seen.push(origin);
                Ok(())
            })
            .expect("Failed to visit patches");
            assert_eq!(seen, expected, "depth {}", depth);
        }
    }

    #[test]
    fn test_consumer_error_stops_reader() {
        let plan = small_plan();
        let reads = AtomicUsize::new(0);
        let result = for_each_patch(
            &plan,
            1,
            |origin| {
                reads.fetch_add(1, Ordering::SeqCst);
                origin_patch(origin)
            },
            |_, _| Err(invalid_config("stop")),
        );
        assert!(result.is_err());
        // One visited, at most one queued and one in flight
        assert!(reads.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_reader_error_is_returned() {
        let plan = small_plan();
        let mut visited = 0;
        let result = for_each_patch(
            &plan,
            2,
            |origin| {
                if origin == [4, 0] {
                    Err(invalid_config("unreadable"))
                } else {
                    origin_patch(origin)
                }
            },
            |_, _| {
                visited += 1;
                Ok(())
            },
        );
        assert!(result.is_err());
        assert_eq!(visited, 6);
    }
}
