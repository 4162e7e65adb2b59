//! Static 2D KD index over projected points.
//!
//! Built once, queried many times: the clustering hierarchy creates one
//! index per zoom level. Leaves hold up to `node_size` points and are
//! scanned linearly.

#[derive(Debug, Clone, Copy)]
struct Entry {
  id: usize,
  x: f64,
  y: f64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct KdIndex {
  entries: Vec<Entry>,
  node_size: usize,
}

impl KdIndex {
  pub const DEFAULT_NODE_SIZE: usize = 64;

  /// Index `(x, y)` pairs. Query results refer to positions in `points`.
  pub fn build<I>(points: I, node_size: usize) -> Self
  where
    I: IntoIterator<Item = (f64, f64)>,
  {
    let mut entries: Vec<Entry> = points
      .into_iter()
      .enumerate()
      .map(|(id, (x, y))| Entry { id, x, y })
      .collect();
    let node_size = node_size.max(1);
    split(&mut entries, node_size, 0);
    Self { entries, node_size }
  }

  /// Ids of points inside the axis-aligned box.
  pub fn range(&self, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Vec<usize> {
    self.search(
      |e| e.x >= min_x && e.x <= max_x && e.y >= min_y && e.y <= max_y,
      |axis, pivot| {
        let (lo, hi) = if axis == 0 { (min_x, max_x) } else { (min_y, max_y) };
        (lo <= pivot, hi >= pivot)
      },
    )
  }

  /// Ids of points within `r` of `(qx, qy)`.
  pub fn within(&self, qx: f64, qy: f64, r: f64) -> Vec<usize> {
    let r2 = r * r;
    self.search(
      |e| {
        let dx = e.x - qx;
        let dy = e.y - qy;
        dx * dx + dy * dy <= r2
      },
      |axis, pivot| {
        let q = if axis == 0 { qx } else { qy };
        (q - r <= pivot, q + r >= pivot)
      },
    )
  }

  fn search<F, G>(&self, hit: F, descend: G) -> Vec<usize>
  where
    F: Fn(&Entry) -> bool,
    G: Fn(usize, f64) -> (bool, bool),
  {
    let mut result = Vec::new();
    if self.entries.is_empty() {
      return result;
    }

    // (start, end exclusive, axis)
    let mut stack = vec![(0usize, self.entries.len(), 0usize)];
    while let Some((start, end, axis)) = stack.pop() {
      let slice = &self.entries[start..end];
      if slice.len() <= self.node_size {
        result.extend(slice.iter().filter(|e| hit(*e)).map(|e| e.id));
        continue;
      }

      let m = slice.len() / 2;
      let pivot = &slice[m];
      if hit(pivot) {
        result.push(pivot.id);
      }

      let (go_left, go_right) = descend(axis, if axis == 0 { pivot.x } else { pivot.y });
      if go_left {
        stack.push((start, start + m, 1 - axis));
      }
      if go_right {
        stack.push((start + m + 1, end, 1 - axis));
      }
    }
    result
  }
}

fn split(entries: &mut [Entry], node_size: usize, axis: usize) {
  if entries.len() <= node_size {
    return;
  }
  let m = entries.len() / 2;
  if axis == 0 {
    entries.select_nth_unstable_by(m, |a, b| a.x.total_cmp(&b.x));
  } else {
    entries.select_nth_unstable_by(m, |a, b| a.y.total_cmp(&b.y));
  }
  let (left, rest) = entries.split_at_mut(m);
  split(left, node_size, 1 - axis);
  split(&mut rest[1..], node_size, 1 - axis);
}
