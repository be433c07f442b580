pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

pub const GC_HEAP_GROW_FACTOR: usize = 2;
pub const GC_FIRST_THRESHOLD: usize = 1024 * 1024;
