//! Cycle detection via trial deletion with tricolor marking
//!
//! Rare operation for circular reference chains that refcounting can't handle.
//! Based on Bacon & Rajan's synchronous cycle collector.
//!
//! A pass pins every traced object in the requested generations, then:
//! 1. Traces each pinned object to find its outgoing edges
//! 2. Counts references that come from inside the pinned set
//! 3. Marks objects with outside references gray and propagates to black
//! 4. Condemns everything left white, rescuing objects a weak handle
//!    upgraded in the meantime
//! 5. Breaks the cycles of the condemned
//!
//! Survivors are promoted one generation.
//!
//! The pass works on a snapshot of traced edges. Edges added while it runs
//! only make objects look more reachable, but an edge removed from a traced
//! object mid-pass can make a still-referenced target look unreachable.
//! Counts stay exact either way; run full passes while traced graphs are
//! quiescent.

use super::backend::{CollectOutcome, TracingBackend};
use super::control::MAX_GENERATION;
use super::heap::{Heap, HeapObject};
use super::hooks::ObjectId;
use crate::error::GcResult;
use crate::logging::{debug, log_gc_mark, log_gc_start, log_gc_sweep, trace};
use rayon::prelude::*;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Tricolor marking states for cycle detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White, // Unreachable (potential garbage)
    Gray,  // Reachable, children not yet scanned
    Black, // Reachable, children scanned
}

type Edges = SmallVec<[ObjectId; 8]>;

/// Default tracing backend
#[derive(Debug, Default)]
pub struct TrialDeletion {
    passes: AtomicUsize,
    reclaimed: AtomicUsize,
}

impl TrialDeletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Passes that actually scanned the heap
    pub fn passes(&self) -> usize {
        self.passes.load(Ordering::Relaxed)
    }

    /// Objects whose cycles were broken, across all passes
    pub fn reclaimed(&self) -> usize {
        self.reclaimed.load(Ordering::Relaxed)
    }
}

impl TracingBackend for TrialDeletion {
    fn name(&self) -> &'static str {
        "trial-deletion"
    }

    fn collect(&self, heap: &Heap, generation: usize) -> GcResult<CollectOutcome> {
        // No decrement left a traced object alive since the last full pass,
        // so no new garbage cycle can exist.
        if !heap.has_candidates() {
            trace!("No cycle candidates, skipping scan");
            return Ok(CollectOutcome::default());
        }

        log_gc_start(generation, heap.candidate_count());
        self.passes.fetch_add(1, Ordering::Relaxed);

        // A full pass sees every garbage cycle that exists right now.
        // Decrements from here on register again for the next pass.
        if generation >= MAX_GENERATION {
            heap.clear_candidates();
        }

        let pinned = heap.traced_objects(generation);
        let mut scan = Scan::new(&pinned, heap.concurrent());

        trace!("Phase 2: Counting internal references");
        scan.count_internal();

        trace!("Phase 3: Marking from externally referenced objects");
        scan.mark_external();
        scan.propagate();

        trace!("Phase 4: Condemning unreachable objects");
        scan.condemn_white();
        log_gc_mark(pinned.len(), scan.reachable());

        trace!("Phase 5: Breaking unreachable cycles");
        let garbage = scan.sweep();

        let outcome = CollectOutcome {
            objects_scanned: pinned.len(),
            objects_reclaimed: garbage,
        };

        // Releasing the pins lets reference counting destroy broken cycles
        drop(pinned);

        self.reclaimed.fetch_add(garbage, Ordering::Relaxed);
        log_gc_sweep(garbage);
        debug!(
            event = "gc_cycle_complete",
            scanned = outcome.objects_scanned,
            collected = outcome.objects_reclaimed
        );

        Ok(outcome)
    }
}

/// Working state of one pass over pinned objects
struct Scan<'a> {
    objects: &'a [HeapObject],
    edges: Vec<Edges>,
    index: HashMap<ObjectId, usize>,
    internal: Vec<usize>,
    colors: Vec<Color>,
    condemned: Vec<bool>,
    gray: VecDeque<usize>,
}

impl<'a> Scan<'a> {
    /// Phase 1: trace every pinned object
    fn new(objects: &'a [HeapObject], concurrent: bool) -> Self {
        trace!(objects = objects.len(), concurrent, "Phase 1: Tracing pinned objects");

        let edges: Vec<Edges> = if concurrent {
            objects.par_iter().map(HeapObject::trace).collect()
        } else {
            objects.iter().map(HeapObject::trace).collect()
        };

        let index = objects
            .iter()
            .enumerate()
            .map(|(i, object)| (object.id(), i))
            .collect();

        Self {
            objects,
            edges,
            index,
            internal: vec![0; objects.len()],
            colors: vec![Color::White; objects.len()],
            condemned: vec![false; objects.len()],
            gray: VecDeque::with_capacity(256),
        }
    }

    fn count_internal(&mut self) {
        for targets in &self.edges {
            for id in targets {
                if let Some(&j) = self.index.get(id) {
                    self.internal[j] += 1;
                }
            }
        }
    }

    /// References not explained by the pin or by pinned objects
    fn external(&self, i: usize, strong: usize) -> usize {
        strong.saturating_sub(1 + self.internal[i])
    }

    fn mark_gray(&mut self, i: usize) {
        if self.colors[i] == Color::White {
            self.colors[i] = Color::Gray;
            self.gray.push_back(i);
        }
    }

    fn mark_external(&mut self) {
        for i in 0..self.objects.len() {
            if self.external(i, self.objects[i].strong_count()) > 0 {
                self.mark_gray(i);
            }
        }
    }

    /// Gray -> black, children white -> gray
    fn propagate(&mut self) {
        while let Some(i) = self.gray.pop_front() {
            self.colors[i] = Color::Black;
            if self.condemned[i] {
                self.objects[i].pardon();
                self.condemned[i] = false;
            }
            for k in 0..self.edges[i].len() {
                if let Some(&j) = self.index.get(&self.edges[i][k]) {
                    self.mark_gray(j);
                }
            }
        }
    }

    /// Condemn every white object, then re-check its count. Once condemned
    /// an object refuses weak upgrades, so one that gained a reference since
    /// marking shows up here and is reachable after all, along with
    /// everything it references.
    fn condemn_white(&mut self) {
        let mut observed = Vec::new();
        for i in 0..self.objects.len() {
            if self.colors[i] == Color::White {
                self.condemned[i] = true;
                observed.push((i, self.objects[i].condemn()));
            }
        }

        for (i, strong) in observed {
            if self.external(i, strong) > 0 {
                trace!(object = ?self.objects[i].id(), "Object resurrected during scan");
                self.mark_gray(i);
            }
        }
        self.propagate();
    }

    fn reachable(&self) -> usize {
        self.colors.iter().filter(|&&c| c == Color::Black).count()
    }

    /// Break white cycles, promote black survivors
    fn sweep(&self) -> usize {
        let mut garbage = 0;
        for (object, color) in self.objects.iter().zip(&self.colors) {
            match color {
                Color::White => {
                    trace!(
                        object = ?object.id(),
                        type_name = object.type_name(),
                        "Detected unreachable cycle member"
                    );
                    object.clear_references();
                    garbage += 1;
                }
                _ => object.promote(),
            }
        }
        garbage
    }
}
