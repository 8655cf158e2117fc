use crate::constants::memory::{BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY};
use core::slice;
use log::{debug, warn};
use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use super::{bump_allocator::BumpAllocator, physical::PhysicalMemory, MemoryError};

/// Physical frame allocator with one bit per frame (1 = owned, 0 = free).
///
/// The bitmap itself lives in placement memory and is reached through the
/// `PhysicalMemory` handle.
pub struct BitmapFrameAllocator<M: PhysicalMemory> {
    memory: M,
    bitmap: PhysAddr,
    bitmap_words: usize,
    total_frames: usize,
    free_frames: usize,
}

impl<M: PhysicalMemory> BitmapFrameAllocator<M> {
    /// Sizes the bitmap for `memory_size` bytes of physical memory, places it
    /// with `placement` and marks every frame free.
    pub fn init(
        memory: M,
        placement: &mut BumpAllocator,
        memory_size: usize,
    ) -> Result<Self, MemoryError> {
        let total_frames = memory_size / FRAME_SIZE;
        let bitmap_words = total_frames.div_ceil(BITMAP_ENTRY_SIZE);
        let bitmap = placement.alloc(bitmap_words * (BITMAP_ENTRY_SIZE / 8))?;

        debug!(
            "frame bitmap at {:#x}: {} frames in {} words",
            bitmap.as_u64(),
            total_frames,
            bitmap_words
        );

        let mut allocator = Self {
            memory,
            bitmap,
            bitmap_words,
            total_frames,
            free_frames: total_frames,
        };

        allocator.words_mut().fill(0);

        // bits past the last frame must never look free
        let tail_bits = total_frames % BITMAP_ENTRY_SIZE;
        if tail_bits != 0 {
            allocator.words_mut()[bitmap_words - 1] = FULL_BITMAP_ENTRY << tail_bits;
        }

        Ok(allocator)
    }

    /// Bitmap words, lowest frames first.
    pub fn words(&self) -> &[u64] {
        // SAFETY: the placement allocation covers `bitmap_words` aligned words
        // and nothing else hands out that range.
        unsafe { slice::from_raw_parts(self.memory.as_mut_ptr::<u64>(self.bitmap), self.bitmap_words) }
    }

    fn words_mut(&mut self) -> &mut [u64] {
        // SAFETY: see `words`; `&mut self` keeps the view unique.
        unsafe {
            slice::from_raw_parts_mut(self.memory.as_mut_ptr::<u64>(self.bitmap), self.bitmap_words)
        }
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Marks every frame overlapping `[start, end)` as used.
    pub fn reserve_range(&mut self, start: PhysAddr, end: PhysAddr) {
        let first = start.as_u64() as usize / FRAME_SIZE;
        let last = (end.as_u64() as usize).div_ceil(FRAME_SIZE).min(self.total_frames);
        for frame_index in first..last {
            self.set_bit(frame_index);
        }
    }

    /// Check if frame is used. input: PhysFrame, output: bool
    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        let frame_index = frame.start_address().as_u64() as usize / FRAME_SIZE;
        frame_index < self.total_frames && self.is_bit_set(frame_index)
    }

    /// Lowest free frame index, if any.
    fn first_free_frame(&self) -> Option<usize> {
        self.words()
            .iter()
            .enumerate()
            .find(|(_, word)| **word != FULL_BITMAP_ENTRY)
            .map(|(word_index, word)| word_index * BITMAP_ENTRY_SIZE + word.trailing_ones() as usize)
    }

    /// set a particular bit (1), taking in frame_index (usize)
    fn set_bit(&mut self, frame_index: usize) {
        let (word, mask) = Self::locate(frame_index);
        let words = self.words_mut();
        if words[word] & mask == 0 {
            words[word] |= mask;
            self.free_frames -= 1;
        }
    }

    /// clear a particular bit (0), taking in frame_index (usize)
    fn clear_bit(&mut self, frame_index: usize) {
        let (word, mask) = Self::locate(frame_index);
        let words = self.words_mut();
        if words[word] & mask != 0 {
            words[word] &= !mask;
            self.free_frames += 1;
        }
    }

    /// check if bit is set at frame_index. returns true if bit == 1, false otherwise
    fn is_bit_set(&self, frame_index: usize) -> bool {
        let (word, mask) = Self::locate(frame_index);
        self.words()[word] & mask != 0
    }

    fn locate(frame_index: usize) -> (usize, u64) {
        (
            frame_index / BITMAP_ENTRY_SIZE,
            1 << (frame_index % BITMAP_ENTRY_SIZE),
        )
    }
}

unsafe impl<M: PhysicalMemory> FrameAllocator<Size4KiB> for BitmapFrameAllocator<M> {
    /// allocates the lowest free frame
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame_index = self.first_free_frame()?;
        self.set_bit(frame_index);
        let addr = (frame_index * FRAME_SIZE) as u64;
        Some(PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

impl<M: PhysicalMemory> FrameDeallocator<Size4KiB> for BitmapFrameAllocator<M> {
    /// Releases a frame. The caller guarantees nothing still uses it.
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let frame_index = frame.start_address().as_u64() as usize / FRAME_SIZE;
        if frame_index >= self.total_frames {
            warn!("ignoring free of frame {:#x} past end of memory", frame.start_address().as_u64());
            return;
        }
        self.clear_bit(frame_index);
    }
}
