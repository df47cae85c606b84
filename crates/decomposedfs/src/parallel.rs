//! Bounded fan-out over blocking work.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{FsError, FsResult};

/// Applies `f` to every item using at most `workers` threads.
///
/// Never starts more threads than there are items. The first error stops
/// all workers from picking up new items and is returned; results of a
/// successful run keep no particular order.
pub fn parallel_map<T, R, F>(items: Vec<T>, workers: usize, f: F) -> FsResult<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> FsResult<R> + Sync,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let workers = workers.clamp(1, items.len());
    let queue: Mutex<Vec<T>> = Mutex::new(items);
    let results: Mutex<Vec<R>> = Mutex::new(Vec::new());
    let failed = AtomicBool::new(false);
    let first_error: Mutex<Option<FsError>> = Mutex::new(None);
    let processed = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| loop {
                if failed.load(Ordering::Acquire) {
                    return;
                }
                let Some(item) = queue.lock().pop() else {
                    return;
                };
                match f(item) {
                    Ok(r) => {
                        results.lock().push(r);
                        processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        if !failed.swap(true, Ordering::AcqRel) {
                            *first_error.lock() = Some(e);
                        }
                        return;
                    }
                }
            });
        }
    });

    if let Some(e) = first_error.into_inner() {
        return Err(e);
    }
    tracing::trace!(processed = processed.load(Ordering::Relaxed), workers, "parallel map done");
    Ok(results.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread::ThreadId;

    #[test]
    fn test_maps_every_item() {
        let mut out = parallel_map((0..100).collect(), 5, |i: i32| Ok(i * 2)).unwrap();
        out.sort();
        assert_eq!(out, (0..100).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_input() {
        let out: Vec<i32> = parallel_map(Vec::<i32>::new(), 5, Ok).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_worker_count_is_bounded_by_items() {
        let seen: Mutex<HashSet<ThreadId>> = Mutex::new(HashSet::new());
        parallel_map(vec![1, 2], 16, |i| {
            seen.lock().insert(std::thread::current().id());
            std::thread::sleep(std::time::Duration::from_millis(10));
            Ok(i)
        })
        .unwrap();
        assert!(seen.lock().len() <= 2);
    }

    #[test]
    fn test_first_error_wins() {
        let calls = AtomicUsize::new(0);
        let res = parallel_map((0..1000).collect(), 4, |i: i32| {
            calls.fetch_add(1, Ordering::SeqCst);
            if i == 990 {
                Err(FsError::Internal("boom".to_string()))
            } else {
                Ok(i)
            }
        });
        match res {
            Err(FsError::Internal(m)) => assert_eq!(m, "boom"),
            other => panic!("expected Internal, got {:?}", other.map(|v| v.len())),
        }
        assert!(calls.load(Ordering::SeqCst) < 1000);
    }
}
