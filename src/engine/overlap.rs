use crate::model::*;

/// Free sub-windows of `window` after removing `busy`.
///
/// `busy` may be unsorted and self-overlapping; spans outside the window
/// or merely touching its edges are ignored. The result is sorted and
/// disjoint.
pub fn subtract(window: Span, busy: &[Span]) -> Vec<Span> {
    let mut inside: Vec<Span> = busy.iter().copied().filter(|b| b.overlaps(&window)).collect();
    inside.sort_unstable_by_key(|b| b.start);

    let mut free = Vec::new();
    let mut cursor = window.start;
    for b in inside {
        if b.start > cursor {
            free.push(Span::new(cursor, b.start));
        }
        cursor = cursor.max(b.end);
        if cursor >= window.end {
            return free;
        }
    }
    free.push(Span::new(cursor, window.end));
    free
}
