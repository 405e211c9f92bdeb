//! Footprint-based miss-ratio-curve profiling and slab reallocation.
//!
//! A fixed-capacity circular buffer records recent `(key, class)`
//! accesses. From one window the profiler derives, per class:
//!
//! - the footprint `fp(w)` — the expected number of distinct keys in a
//!   random window of `w` accesses:
//!
//!   ```text
//!   fp(w) = m - (F(w) + L(w) + R(w)) / (n - w + 1)
//!   F(w)  = sum of max(0, f_i - w)   over 1-indexed first accesses
//!   L(w)  = sum of max(0, l_i - w)   over reversed last accesses
//!   R(w)  = sum of (t - w) * hist[t] over reuse times t > w
//!   ```
//!
//! - the miss-ratio curve over slab counts: an access with reuse time
//!   `t` hits iff `fp(t)` fits in the cache, so
//!   `mrc[s] = 1 - hits(s * allocs_per_slab) / n`, and
//!
//! - a dynamic program that splits a fixed slab budget across classes to
//!   minimize total misses, plus the slab-by-slab move plan to get from
//!   the current allocation to the optimal one.
//!
//! `feed` is called from request threads; the mutex covers the buffer
//! write and the snapshot copy, never the analysis.

use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;

use parking_lot::Mutex;

use cache_core::ClassId;

/// One class's miss-ratio curve over slab counts.
#[derive(Debug, Clone, Default)]
pub struct ClassMrc {
    /// `points[s]` is the miss ratio with `s` slabs, for `s` in
    /// `0..=max_slab_count`.
    pub points: Vec<f64>,
    /// `delta[s] = points[s-1] - points[s]`; `delta[0]` is zero.
    pub delta: Vec<f64>,
    /// Accesses this class contributed to the window.
    pub access_freq: u64,
}

/// Result of [`FootprintMrc::solve_slab_reallocation`].
#[derive(Debug, Clone, Default)]
pub struct ReallocationPlan {
    /// Window miss rate under the current allocation.
    pub mr_old: f64,
    /// Window miss rate under the optimal allocation.
    pub mr_new: f64,
    /// Optimal slab count per class; covers every class named by either
    /// input map.
    pub optimal: BTreeMap<ClassId, u64>,
    /// One (victim, receiver) entry per slab that has to move.
    pub moves: Vec<(ClassId, ClassId)>,
    /// Window access count per profiled class.
    pub access_freq: BTreeMap<ClassId, u64>,
}

struct Window {
    buf: Vec<(u64, ClassId)>,
    head: usize,
    size: usize,
}

/// Per-class window statistics extracted from one snapshot.
struct ClassWindow {
    first_access: HashMap<u64, usize>,
    last_access: HashMap<u64, usize>,
    reuse_hist: Vec<u64>,
    n: usize,
    m: usize,
}

/// Thread-safe access recorder with footprint-based MRC analysis.
pub struct FootprintMrc {
    window: Mutex<Window>,
    capacity: usize,
    hasher: ahash::RandomState,
}

impl FootprintMrc {
    /// Default window capacity: twenty million accesses.
    pub const DEFAULT_CAPACITY: usize = 20_000_000;

    /// Create a profiler whose window holds `capacity` accesses.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "window capacity must be at least 1");
        Self {
            window: Mutex::new(Window {
                buf: Vec::new(),
                head: 0,
                size: 0,
            }),
            capacity,
            hasher: ahash::RandomState::new(),
        }
    }

    /// Record an access. ASCII-decimal keys are used as integers
    /// directly; anything else is hashed.
    pub fn feed(&self, key: &[u8], class: ClassId) {
        let key_int = std::str::from_utf8(key)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or_else(|| self.hasher.hash_one(key));
        self.feed_id(key_int, class);
    }

    /// Record an access for an already-resolved integer key.
    pub fn feed_id(&self, key: u64, class: ClassId) {
        let mut window = self.window.lock();
        if window.buf.is_empty() {
            let capacity = self.capacity;
            window.buf.resize(capacity, (0, 0));
        }
        let head = window.head;
        window.buf[head] = (key, class);
        window.head = (head + 1) % self.capacity;
        if window.size < self.capacity {
            window.size += 1;
        }
    }

    /// Accesses currently in the window.
    pub fn len(&self) -> usize {
        self.window.lock().size
    }

    /// Whether the window holds no accesses.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the recorded window and start a fresh one.
    pub fn reset_window_analysis(&self) {
        let mut window = self.window.lock();
        window.size = 0;
        window.head = 0;
    }

    /// Copy the window, oldest access first. The lock covers only the
    /// copy; analysis runs on the snapshot.
    fn snapshot(&self) -> Vec<(u64, ClassId)> {
        let window = self.window.lock();
        let start = if window.size < self.capacity {
            0
        } else {
            window.head
        };
        (0..window.size)
            .map(|i| window.buf[(start + i) % self.capacity])
            .collect()
    }

    /// Per-class first/last access times, reuse-time histogram, and
    /// access/unique counts for one snapshot.
    fn window_stats(snapshot: &[(u64, ClassId)]) -> BTreeMap<ClassId, ClassWindow> {
        // Pass 1: per-class access counts size the histograms exactly.
        let mut counts: BTreeMap<ClassId, usize> = BTreeMap::new();
        for &(_, class) in snapshot {
            *counts.entry(class).or_default() += 1;
        }

        let mut stats: BTreeMap<ClassId, ClassWindow> = counts
            .into_iter()
            .map(|(class, n)| {
                (
                    class,
                    ClassWindow {
                        first_access: HashMap::new(),
                        last_access: HashMap::new(),
                        reuse_hist: vec![0; n],
                        n,
                        m: 0,
                    },
                )
            })
            .collect();

        // Pass 2: fill access times and reuse distances, counted in
        // per-class logical time.
        let mut cursor: BTreeMap<ClassId, usize> = BTreeMap::new();
        for &(key, class) in snapshot {
            let index = {
                let c = cursor.entry(class).or_default();
                let index = *c;
                *c += 1;
                index
            };
            let win = stats.get_mut(&class).expect("class counted in pass 1");
            win.first_access.entry(key).or_insert(index);
            if let Some(prev) = win.last_access.insert(key, index) {
                win.reuse_hist[index - prev] += 1;
            }
        }
        for win in stats.values_mut() {
            win.m = win.first_access.len();
        }
        stats
    }

    /// Footprint values `fp(0..=n)` for one class, by a single sweep
    /// over `w` with suffix sums. O(n) after the two sorts.
    fn fp_values(win: &ClassWindow) -> Vec<f64> {
        let n = win.n;
        if n == 0 {
            return Vec::new();
        }
        let m = win.m as f64;
        let max_t = n - 1;

        // Suffix sums over the reuse histogram: sum of t * hist[t] and
        // sum of hist[t] for t >= w.
        let mut sum_tr_suffix = vec![0.0; max_t + 2];
        let mut sum_r_suffix = vec![0.0; max_t + 2];
        for (t, &count) in win.reuse_hist.iter().enumerate() {
            if count > 0 && t > 0 && t <= max_t {
                sum_tr_suffix[t] = t as f64 * count as f64;
                sum_r_suffix[t] = count as f64;
            }
        }
        for t in (1..=max_t).rev() {
            sum_tr_suffix[t] += sum_tr_suffix[t + 1];
            sum_r_suffix[t] += sum_r_suffix[t + 1];
        }

        // 1-indexed first-access times and reversed last-access times.
        let mut first: Vec<usize> = win.first_access.values().map(|&t| t + 1).collect();
        let mut last: Vec<usize> = win.last_access.values().map(|&t| n - t).collect();
        first.sort_unstable();
        last.sort_unstable();

        let mut first_sum: f64 = first.iter().map(|&v| v as f64).sum();
        let mut last_sum: f64 = last.iter().map(|&v| v as f64).sum();
        let mut first_count = first.len();
        let mut last_count = last.len();
        let mut first_ptr = 0;
        let mut last_ptr = 0;

        let mut fp = vec![0.0; n + 1];
        for w in 1..=n {
            while first_ptr < first.len() && first[first_ptr] <= w {
                first_sum -= first[first_ptr] as f64;
                first_count -= 1;
                first_ptr += 1;
            }
            let f_w = first_sum - (w * first_count) as f64;

            while last_ptr < last.len() && last[last_ptr] <= w {
                last_sum -= last[last_ptr] as f64;
                last_count -= 1;
                last_ptr += 1;
            }
            let l_w = last_sum - (w * last_count) as f64;

            let r_w = if w + 1 <= max_t {
                sum_tr_suffix[w + 1] - w as f64 * sum_r_suffix[w + 1]
            } else {
                0.0
            };

            let denominator = (n - w + 1) as f64;
            fp[w] = m - (f_w + l_w + r_w) / denominator;
        }
        fp
    }

    /// Miss-ratio curves over `0..=max_slab_count` slabs for every class
    /// present both in the window and in `allocs_per_slab`. Empty when
    /// the window is empty.
    pub fn query_mrc(
        &self,
        allocs_per_slab: &BTreeMap<ClassId, u64>,
        max_slab_count: u64,
    ) -> BTreeMap<ClassId, ClassMrc> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return BTreeMap::new();
        }
        let stats = Self::window_stats(&snapshot);

        let mut result = BTreeMap::new();
        for (&class, &allocs) in allocs_per_slab {
            if allocs == 0 {
                continue;
            }
            let Some(win) = stats.get(&class) else {
                continue;
            };
            let fp = Self::fp_values(win);
            let n = win.n as u64;

            let mut points = Vec::with_capacity(max_slab_count as usize + 1);
            let mut delta = Vec::with_capacity(max_slab_count as usize + 1);
            let mut prev_miss = 1.0;
            for slab_count in 0..=max_slab_count {
                let cache_size = (slab_count * allocs) as f64;
                let mut miss_ratio = 1.0;
                if n > 0 && cache_size > 0.0 {
                    let mut hits = 0u64;
                    for (t, &count) in win.reuse_hist.iter().enumerate() {
                        if count == 0 {
                            continue;
                        }
                        let fp_at_t = if t > 0 && t < fp.len() { fp[t] } else { 0.0 };
                        if fp_at_t < cache_size {
                            hits += count;
                        }
                    }
                    miss_ratio = (1.0 - hits as f64 / n as f64).clamp(0.0, 1.0);
                }
                delta.push(if slab_count > 0 {
                    prev_miss - miss_ratio
                } else {
                    0.0
                });
                points.push(miss_ratio);
                prev_miss = miss_ratio;
            }

            result.insert(
                class,
                ClassMrc {
                    points,
                    delta,
                    access_freq: n,
                },
            );
        }
        result
    }

    /// Split the current total slab budget across classes to minimize
    /// window misses.
    ///
    /// The DP fills `F[i][j]` = minimal misses using the first `i`
    /// classes and `j` slabs, with `B[i][j]` recording the slab count
    /// given to class `i`; backtracking yields the optimal allocation.
    /// The move plan pairs victims (classes losing slabs, cheapest
    /// accesses-per-slab first) with receivers one slab at a time.
    pub fn solve_slab_reallocation(
        &self,
        allocs_per_slab: &BTreeMap<ClassId, u64>,
        current_alloc: &BTreeMap<ClassId, u64>,
    ) -> ReallocationPlan {
        let total_slabs: u64 = current_alloc.values().sum();
        let mrc = self.query_mrc(allocs_per_slab, total_slabs);
        if mrc.is_empty() {
            return ReallocationPlan::default();
        }

        let class_ids: Vec<ClassId> = mrc.keys().copied().collect();
        let num_classes = class_ids.len();
        let budget = total_slabs as usize;

        let miss_ratio = |class: ClassId, slabs: u64| -> f64 {
            match mrc.get(&class) {
                None => 0.0,
                Some(curve) => {
                    if slabs == 0 {
                        1.0
                    } else {
                        let index = (slabs as usize).min(curve.points.len() - 1);
                        curve.points[index]
                    }
                }
            }
        };

        let mut cost = vec![vec![0.0f64; budget + 1]; num_classes];
        for (i, &class) in class_ids.iter().enumerate() {
            let freq = mrc[&class].access_freq as f64;
            for (j, slot) in cost[i].iter_mut().enumerate() {
                *slot = freq * miss_ratio(class, j as u64);
            }
        }

        let mut table = vec![vec![f64::INFINITY; budget + 1]; num_classes + 1];
        let mut back = vec![vec![0usize; budget + 1]; num_classes + 1];
        table[0][0] = 0.0;
        for i in 1..=num_classes {
            for j in 0..=budget {
                for k in 0..=j {
                    if table[i - 1][j - k].is_finite() {
                        let candidate = table[i - 1][j - k] + cost[i - 1][k];
                        if candidate < table[i][j] {
                            table[i][j] = candidate;
                            back[i][j] = k;
                        }
                    }
                }
            }
        }

        let mut optimal: BTreeMap<ClassId, u64> = BTreeMap::new();
        let mut remaining = budget;
        for i in (1..=num_classes).rev() {
            let slabs = back[i][remaining];
            optimal.insert(class_ids[i - 1], slabs as u64);
            remaining -= slabs;
        }
        for &class in current_alloc.keys() {
            optimal.entry(class).or_insert(0);
        }

        let access_freq: BTreeMap<ClassId, u64> = class_ids
            .iter()
            .map(|&class| (class, mrc[&class].access_freq))
            .collect();
        let total_requests: u64 = access_freq.values().sum();

        let misses_old: f64 = current_alloc
            .iter()
            .filter(|(class, _)| mrc.contains_key(class))
            .map(|(&class, &slabs)| mrc[&class].access_freq as f64 * miss_ratio(class, slabs))
            .sum();
        let misses_new: f64 = optimal
            .iter()
            .filter(|(class, _)| mrc.contains_key(class))
            .map(|(&class, &slabs)| mrc[&class].access_freq as f64 * miss_ratio(class, slabs))
            .sum();

        let (mr_old, mr_new) = if total_requests > 0 {
            (
                misses_old / total_requests as f64,
                misses_new / total_requests as f64,
            )
        } else {
            (0.0, 0.0)
        };

        // One entry per slab that must move. Victims drain cheapest
        // accesses-per-slab first.
        let mut victims: Vec<ClassId> = Vec::new();
        let mut receivers: Vec<ClassId> = Vec::new();
        for (&class, &opt) in &optimal {
            let current = current_alloc.get(&class).copied().unwrap_or(0);
            if opt < current {
                victims.extend(std::iter::repeat(class).take((current - opt) as usize));
            } else if opt > current {
                receivers.extend(std::iter::repeat(class).take((opt - current) as usize));
            }
        }
        let per_slab_value = |class: ClassId| -> f64 {
            let slabs = current_alloc.get(&class).copied().unwrap_or(0);
            match (access_freq.get(&class), slabs) {
                (Some(&freq), s) if s > 0 => freq as f64 / s as f64,
                _ => f64::MAX,
            }
        };
        victims.sort_by(|&a, &b| {
            per_slab_value(a)
                .partial_cmp(&per_slab_value(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let moves: Vec<(ClassId, ClassId)> = victims
            .into_iter()
            .zip(receivers)
            .collect();

        ReallocationPlan {
            mr_old,
            mr_new,
            optimal,
            moves,
            access_freq,
        }
    }
}
