use core::{
    marker::PhantomData,
    num::NonZero,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    slice,
};

use crate::RetrieveRunAllocator;

/// A pointer type that uniquely owns one run of contiguous frames.
///
/// The run is freed back to the allocator when the box is dropped.
pub struct RunBox<A, const RUN_SIZE: usize>
where
    A: RetrieveRunAllocator<RUN_SIZE>,
{
    ptr: NonNull<u8>,
    _allocator: PhantomData<A>,
}

unsafe impl<A, const RUN_SIZE: usize> Send for RunBox<A, RUN_SIZE> where
    A: RetrieveRunAllocator<RUN_SIZE>
{
}

impl<A, const RUN_SIZE: usize> RunBox<A, RUN_SIZE>
where
    A: RetrieveRunAllocator<RUN_SIZE>,
{
    /// Allocates a zeroed run, returning `None` if no run is available.
    pub fn try_new_zeroed() -> Option<Self> {
        let mut allocator = A::retrieve_allocator();
        let ptr = allocator.alloc_run_zeroed()?;
        Some(Self {
            ptr,
            _allocator: PhantomData,
        })
    }

    /// Returns the address of the run.
    pub fn addr(this: &Self) -> NonZero<usize> {
        this.ptr.addr()
    }
}

impl<A, const RUN_SIZE: usize> Deref for RunBox<A, RUN_SIZE>
where
    A: RetrieveRunAllocator<RUN_SIZE>,
{
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), RUN_SIZE) }
    }
}

impl<A, const RUN_SIZE: usize> DerefMut for RunBox<A, RUN_SIZE>
where
    A: RetrieveRunAllocator<RUN_SIZE>,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), RUN_SIZE) }
    }
}

impl<A, const RUN_SIZE: usize> Drop for RunBox<A, RUN_SIZE>
where
    A: RetrieveRunAllocator<RUN_SIZE>,
{
    fn drop(&mut self) {
        let mut allocator = A::retrieve_allocator();
        unsafe {
            allocator.free_run(self.ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::UnsafeCell;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    use super::*;
    use crate::{FRAME_SIZE, FrameRunAllocator};

    const RUN_SIZE: usize = FRAME_SIZE * 2;
    const NUM_RUNS: usize = 8;

    static ALLOCATOR: OnceLock<Mutex<FrameRunAllocator<RUN_SIZE>>> = OnceLock::new();

    #[repr(align(8192))]
    struct Heap(UnsafeCell<[u8; RUN_SIZE * NUM_RUNS]>);
    unsafe impl Sync for Heap {}

    static HEAP: Heap = Heap(UnsafeCell::new([0; RUN_SIZE * NUM_RUNS]));

    struct Retriever;
    impl RetrieveRunAllocator<RUN_SIZE> for Retriever {
        type AllocatorRef = MutexGuard<'static, FrameRunAllocator<RUN_SIZE>>;

        fn retrieve_allocator() -> Self::AllocatorRef {
            ALLOCATOR
                .get_or_init(|| {
                    Mutex::new(unsafe {
                        FrameRunAllocator::new((*HEAP.0.get()).as_mut_ptr_range())
                    })
                })
                .lock()
                .unwrap()
        }
    }

    type MyRunBox = RunBox<Retriever, RUN_SIZE>;

    #[test]
    fn test_run_box() {
        let run = MyRunBox::try_new_zeroed().unwrap();
        assert_eq!(RunBox::addr(&run).get() % RUN_SIZE, 0);
        assert_eq!(run.len(), RUN_SIZE);
        assert!(run.iter().all(|&b| b == 0));
        drop(run); // run must be freed.

        let mut runs = vec![];
        for i in 0..NUM_RUNS {
            let mut run = MyRunBox::try_new_zeroed().unwrap();
            run[0] = i as u8;
            runs.push(run);
        }
        assert!(MyRunBox::try_new_zeroed().is_none());

        runs.pop();
        assert!(MyRunBox::try_new_zeroed().is_some());
    }
}
