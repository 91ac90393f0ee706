//! Progress bar utilities for long-running allocation loops.

use kdam::{Animation, Bar, BarExt};

/// Bar shown while the initial chunks are fallocated and hashed.
pub fn allocation_bar(total: usize) -> Bar {
    kdam::tqdm!(
        total = total,
        desc = "allocating",
        animation = Animation::Classic,
        unit = " chunks"
    )
}

/// Advance the bar by one; display errors are ignored.
pub fn tick(bar: &mut Bar) {
    let _ = bar.update(1);
}
