//! Tests for handles, control blocks and the collector

use super::*;
use crate::config::CollectorConfig;
use crate::error::GcError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

/// Increments a shared counter when dropped
struct DropCounter {
    value: u64,
    drops: Arc<AtomicUsize>,
}

impl DropCounter {
    fn new(value: u64, drops: &Arc<AtomicUsize>) -> Self {
        Self {
            value,
            drops: Arc::clone(drops),
        }
    }
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Traced node that can form cycles
struct Node {
    next: Mutex<Option<StrongHandle<Node>>>,
    drops: Arc<AtomicUsize>,
}

impl Node {
    fn new(drops: &Arc<AtomicUsize>) -> Self {
        Self {
            next: Mutex::new(None),
            drops: Arc::clone(drops),
        }
    }

    fn link(&self, next: &StrongHandle<Node>) {
        *self.next.lock() = Some(next.clone());
    }
}

impl Managed for Node {
    const TRACED: bool = true;

    fn trace(&self, tracer: &mut Tracer) {
        if let Some(next) = &*self.next.lock() {
            tracer.visit(next);
        }
    }

    fn clear_references(&self) {
        let _next = self.next.lock().take();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

fn quiet_collector() -> Collector {
    Collector::with_config(CollectorConfig {
        logging: false,
        ..CollectorConfig::default()
    })
}

#[cfg(test)]
mod refcount_tests {
    use super::*;

    #[test]
    fn test_allocate_starts_at_one() {
        let collector = quiet_collector();
        let handle = collector.allocate(5u32).unwrap();

        assert_eq!(handle.use_count(), 1);
        assert_eq!(handle.weak_count(), 0);
        assert_eq!(*handle, 5);
        assert_eq!(collector.heap().live_objects(), 1);
    }

    #[test]
    fn test_clone_and_drop() {
        let collector = quiet_collector();
        let drops = Arc::new(AtomicUsize::new(0));
        let h1 = collector.allocate(DropCounter::new(1, &drops)).unwrap();

        let h2 = h1.clone();
        assert_eq!(h1.use_count(), 2);
        assert!(h1.ptr_eq(&h2));

        drop(h2);
        assert_eq!(h1.use_count(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(h1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(collector.heap().live_objects(), 0);
        assert_eq!(collector.heap().live_blocks(), 0);
    }

    #[test]
    fn test_weak_lifecycle() {
        // Object A with a clone and one observer
        let collector = quiet_collector();
        let drops = Arc::new(AtomicUsize::new(0));

        let a = collector.allocate(DropCounter::new(7, &drops)).unwrap();
        assert_eq!(a.use_count(), 1);
        let a2 = a.clone();
        assert_eq!(a.use_count(), 2);
        let w = a.get_weak_handle();
        assert_eq!(w.weak_count(), 1);

        drop(a);
        drop(a2);

        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(w.expired());
        assert!(w.lock().is_null());
        assert_eq!(w.use_count(), 0);
        assert_eq!(w.weak_count(), 1);
        assert_eq!(collector.heap().live_blocks(), 1);

        drop(w);
        assert_eq!(collector.heap().live_blocks(), 0);
    }

    #[test]
    fn test_weak_round_trip() {
        let collector = quiet_collector();
        let strong = collector.allocate(String::from("round trip")).unwrap();

        let weak = StrongHandle::downgrade(&strong);
        let again = weak.lock();

        assert!(again.ptr_eq(&strong));
        assert_eq!(again.as_str(), "round trip");
        assert_eq!(strong.use_count(), 2);
    }

    #[test]
    fn test_try_upgrade_errors() {
        let collector = quiet_collector();
        let empty: WeakHandle<u8> = WeakHandle::new();
        assert_eq!(empty.try_upgrade().unwrap_err(), GcError::NullHandle);

        let strong = collector.allocate(1u8).unwrap();
        let weak = strong.get_weak_handle();
        assert!(weak.try_upgrade().is_ok());
        drop(strong);
        assert_eq!(weak.try_upgrade().unwrap_err(), GcError::Expired);
    }

    #[test]
    fn test_null_handle_checked_access() {
        let handle: StrongHandle<u32> = StrongHandle::default();
        assert!(handle.is_null());
        assert!(handle.get().is_none());
        assert_eq!(handle.try_get().unwrap_err(), GcError::NullHandle);
        assert_eq!(handle.use_count(), 0);
        assert!(handle.get_weak_handle().expired());
        assert!(handle.as_stack_ref().is_none());
    }

    #[test]
    #[should_panic(expected = "dereferenced a null StrongHandle")]
    fn test_null_handle_deref_panics() {
        let handle: StrongHandle<u32> = StrongHandle::null();
        let _ = *handle;
    }

    #[test]
    fn test_take_and_reset() {
        let collector = quiet_collector();
        let drops = Arc::new(AtomicUsize::new(0));
        let mut h = collector.allocate(DropCounter::new(3, &drops)).unwrap();

        let moved = h.take();
        assert!(h.is_null());
        assert_eq!(moved.use_count(), 1);

        let mut moved = moved;
        moved.reset();
        assert!(moved.is_null());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_mut_requires_unique() {
        let collector = quiet_collector();
        let mut handle = collector.allocate(vec![1u32]).unwrap();

        StrongHandle::get_mut(&mut handle).unwrap().push(2);
        assert_eq!(handle.len(), 2);

        let clone = handle.clone();
        assert!(StrongHandle::get_mut(&mut handle).is_none());
        drop(clone);

        let weak = handle.get_weak_handle();
        assert!(StrongHandle::get_mut(&mut handle).is_none());
        drop(weak);
        assert!(StrongHandle::get_mut(&mut handle).is_some());

        let drops = Arc::new(AtomicUsize::new(0));
        let mut node = collector.allocate_managed(Node::new(&drops)).unwrap();
        assert!(StrongHandle::get_mut(&mut node).is_none());
    }

    #[test]
    fn test_zero_sized_objects() {
        let collector = quiet_collector();
        let a = collector.allocate(()).unwrap();
        let b = collector.allocate(()).unwrap();

        assert!(!a.ptr_eq(&b));
        assert_eq!(collector.heap().live_objects(), 2);
        drop(a);
        drop(b);
        assert_eq!(collector.heap().live_objects(), 0);
    }

    #[test]
    fn test_adopt_box() {
        let collector = quiet_collector();
        let drops = Arc::new(AtomicUsize::new(0));
        let handle = collector.adopt(Box::new(DropCounter::new(9, &drops))).unwrap();

        assert_eq!(handle.value, 9);
        drop(handle);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_into_raw_from_raw() {
        let collector = quiet_collector();
        let handle = collector.allocate(11u64).unwrap();
        let (ptr, block) = handle.into_raw().unwrap();

        let handle = unsafe { StrongHandle::from_raw(ptr, block) };
        assert_eq!(*handle, 11);
        assert_eq!(handle.use_count(), 1);
    }
}

#[cfg(test)]
mod concurrency_tests {
    use super::*;

    #[test]
    fn test_concurrent_release_destroys_once() {
        for _ in 0..200 {
            let collector = quiet_collector();
            let drops = Arc::new(AtomicUsize::new(0));
            let h1 = collector.allocate(DropCounter::new(0, &drops)).unwrap();
            let h2 = h1.clone();
            assert_eq!(h1.use_count(), 2);

            let barrier = Arc::new(Barrier::new(2));
            let threads: Vec<_> = [h1, h2]
                .into_iter()
                .map(|h| {
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        drop(h);
                    })
                })
                .collect();

            for t in threads {
                t.join().unwrap();
            }

            assert_eq!(drops.load(Ordering::SeqCst), 1);
            assert_eq!(collector.heap().live_blocks(), 0);
        }
    }

    #[test]
    fn test_concurrent_clone_drop() {
        let collector = quiet_collector();
        let drops = Arc::new(AtomicUsize::new(0));
        let root = collector.allocate(DropCounter::new(42, &drops)).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let local = root.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let c = local.clone();
                        assert_eq!(c.value, 42);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(root.use_count(), 1);
        drop(root);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lock_races_last_release() {
        for _ in 0..200 {
            let collector = quiet_collector();
            let drops = Arc::new(AtomicUsize::new(0));
            let strong = collector.allocate(DropCounter::new(99, &drops)).unwrap();
            let weak = strong.get_weak_handle();
            let barrier = Arc::new(Barrier::new(2));

            let releaser = {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    drop(strong);
                })
            };

            let locker = {
                let barrier = Arc::clone(&barrier);
                let weak = weak.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        let locked = weak.lock();
                        if let Some(object) = locked.get() {
                            assert_eq!(object.value, 99);
                        }
                    }
                })
            };

            releaser.join().unwrap();
            locker.join().unwrap();

            assert!(weak.expired());
            assert_eq!(drops.load(Ordering::SeqCst), 1);
            drop(weak);
            assert_eq!(collector.heap().live_blocks(), 0);
        }
    }

    #[test]
    fn test_handles_cross_threads() {
        let collector = quiet_collector();
        let handle = collector.allocate(Mutex::new(Vec::<u32>::new())).unwrap();

        let threads: Vec<_> = (0..4)
            .map(|i| {
                let h = handle.clone();
                thread::spawn(move || h.lock().push(i))
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(handle.lock().len(), 4);
    }
}

#[cfg(test)]
mod finalizer_tests {
    use super::*;

    struct Hooked {
        finalized: Arc<AtomicUsize>,
        destroyed: Arc<AtomicUsize>,
    }

    impl Managed for Hooked {
        fn finalize(&mut self) {
            self.finalized.fetch_add(1, Ordering::SeqCst);
        }

        fn on_destroy(&mut self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn hooked(collector: &Collector) -> (StrongHandle<Hooked>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let finalized = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let handle = collector
            .allocate_managed(Hooked {
                finalized: Arc::clone(&finalized),
                destroyed: Arc::clone(&destroyed),
            })
            .unwrap();
        (handle, finalized, destroyed)
    }

    #[test]
    fn test_hooks_run_once() {
        let collector = quiet_collector();
        let (handle, finalized, destroyed) = hooked(&collector);
        let clone = handle.clone();

        drop(handle);
        assert_eq!(finalized.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_suppress_finalize_idempotent() {
        let collector = quiet_collector();
        let (handle, finalized, destroyed) = hooked(&collector);

        collector.suppress_finalize(&handle);
        collector.suppress_finalize(&handle);
        assert!(handle.is_finalize_suppressed());

        drop(handle);
        assert_eq!(finalized.load(Ordering::SeqCst), 0);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_re_register_restores_finalizer() {
        let collector = quiet_collector();
        let (handle, finalized, _) = hooked(&collector);

        collector.suppress_finalize(&handle);
        collector.re_register_for_finalize(&handle);
        collector.re_register_for_finalize(&handle);
        assert!(!handle.is_finalize_suppressed());

        drop(handle);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    struct Panicky {
        destroyed: Arc<AtomicBool>,
    }

    impl Managed for Panicky {
        fn finalize(&mut self) {
            panic!("finalizer failure");
        }

        fn on_destroy(&mut self) {
            self.destroyed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_finalizer_panic_is_swallowed() {
        let collector = quiet_collector();
        let destroyed = Arc::new(AtomicBool::new(false));
        let handle = collector
            .allocate_managed(Panicky {
                destroyed: Arc::clone(&destroyed),
            })
            .unwrap();

        drop(handle);

        assert!(destroyed.load(Ordering::SeqCst));
        assert_eq!(collector.statistics().finalizer_failures, 1);
        assert_eq!(collector.heap().live_objects(), 0);
    }

    /// Observes its own weak handle from inside the finalizer
    struct SelfObserver {
        me: Mutex<WeakHandle<SelfObserver>>,
        expired_in_finalizer: Arc<AtomicBool>,
    }

    impl Managed for SelfObserver {
        fn finalize(&mut self) {
            let me = self.me.get_mut();
            let expired = me.expired() && me.lock().is_null();
            self.expired_in_finalizer.store(expired, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_destroyed_visible_before_finalizer() {
        let collector = quiet_collector();
        let flag = Arc::new(AtomicBool::new(false));
        let handle = collector
            .allocate_managed(SelfObserver {
                me: Mutex::new(WeakHandle::new()),
                expired_in_finalizer: Arc::clone(&flag),
            })
            .unwrap();
        *handle.me.lock() = handle.get_weak_handle();

        drop(handle);
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(collector.heap().live_blocks(), 0);
    }

    #[test]
    fn test_queued_finalizers_drain() {
        let collector = Arc::new(quiet_collector());
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            collector.register_finalizer(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(collector.statistics().pending_finalizers, 3);

        // A finalizer that queues another is drained in the same call
        let chained = Arc::clone(&ran);
        let inner = Arc::clone(&collector);
        collector.register_finalizer(move || {
            inner.register_finalizer(move || {
                chained.fetch_add(10, Ordering::SeqCst);
            });
        });

        assert_eq!(collector.wait_for_pending_finalizers(), 5);
        assert_eq!(ran.load(Ordering::SeqCst), 13);
        assert_eq!(collector.statistics().pending_finalizers, 0);
        assert_eq!(collector.statistics().finalizers_run, 5);
    }

    #[test]
    fn test_queued_finalizer_panic_counted() {
        let collector = quiet_collector();
        collector.register_finalizer(|| panic!("queued failure"));
        collector.register_finalizer(|| {});

        assert_eq!(collector.wait_for_pending_finalizers(), 2);
        let stats = collector.statistics();
        assert_eq!(stats.finalizers_run, 2);
        assert_eq!(stats.finalizer_failures, 1);
    }
}

#[cfg(test)]
mod cycle_tests {
    use super::*;

    #[test]
    fn test_collect_two_node_cycle() {
        let collector = quiet_collector();
        let drops = Arc::new(AtomicUsize::new(0));

        let a = collector.allocate_managed(Node::new(&drops)).unwrap();
        let b = collector.allocate_managed(Node::new(&drops)).unwrap();
        a.link(&b);
        b.link(&a);
        let observer = a.get_weak_handle();

        drop(a);
        drop(b);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert!(!observer.expired());

        let report = collector.collect().unwrap();
        assert_eq!(report.objects_scanned, 2);
        assert_eq!(report.objects_reclaimed, 2);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert!(observer.expired());
        assert_eq!(collector.heap().live_objects(), 0);
    }

    #[test]
    fn test_self_cycle() {
        let collector = quiet_collector();
        let drops = Arc::new(AtomicUsize::new(0));

        let a = collector.allocate_managed(Node::new(&drops)).unwrap();
        a.link(&a);
        drop(a);

        collector.collect().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reachable_cycle_survives_and_promotes() {
        let collector = quiet_collector();
        let drops = Arc::new(AtomicUsize::new(0));

        let a = collector.allocate_managed(Node::new(&drops)).unwrap();
        let b = collector.allocate_managed(Node::new(&drops)).unwrap();
        a.link(&b);
        b.link(&a);
        drop(b);

        let report = collector.collect().unwrap();
        assert_eq!(report.objects_reclaimed, 0);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(a.generation(), Some(1));
        assert_eq!(a.use_count(), 2);
    }

    #[test]
    fn test_young_collection_skips_old_objects() {
        let collector = quiet_collector();
        let drops = Arc::new(AtomicUsize::new(0));

        let a = collector.allocate_managed(Node::new(&drops)).unwrap();
        let b = collector.allocate_managed(Node::new(&drops)).unwrap();
        a.link(&b);
        b.link(&a);
        drop(b);

        // Survive one pass, moving both to generation 1
        collector.collect().unwrap();
        drop(a);

        let young = collector.collect_generation(0).unwrap();
        assert_eq!(young.objects_reclaimed, 0);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        let full = collector.collect().unwrap();
        assert_eq!(full.objects_reclaimed, 2);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_untraced_objects_not_scanned() {
        let collector = quiet_collector();
        let _plain = collector.allocate(String::from("not traced")).unwrap();

        let report = collector.collect().unwrap();
        assert_eq!(report.objects_scanned, 0);
        assert_eq!(collector.heap().live_objects(), 1);
    }

    #[test]
    fn test_acyclic_chain_freed_by_counting() {
        let collector = quiet_collector();
        let drops = Arc::new(AtomicUsize::new(0));

        let head = collector.allocate_managed(Node::new(&drops)).unwrap();
        let mut tail = head.clone();
        for _ in 0..10 {
            let next = collector.allocate_managed(Node::new(&drops)).unwrap();
            tail.link(&next);
            tail = next;
        }
        drop(tail);
        drop(head);

        assert_eq!(drops.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_concurrent_tracing() {
        let collector = Collector::with_config(CollectorConfig {
            logging: false,
            concurrent: true,
            ..CollectorConfig::default()
        });
        let drops = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let a = collector.allocate_managed(Node::new(&drops)).unwrap();
            let b = collector.allocate_managed(Node::new(&drops)).unwrap();
            a.link(&b);
            b.link(&a);
        }

        let report = collector.collect().unwrap();
        assert_eq!(report.objects_reclaimed, 100);
        assert_eq!(drops.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_release_racing_full_pass_is_collected_next_time() {
        let collector = quiet_collector();
        let drops = Arc::new(AtomicUsize::new(0));

        for round in 1..=200 {
            let a = collector.allocate_managed(Node::new(&drops)).unwrap();
            let b = collector.allocate_managed(Node::new(&drops)).unwrap();
            a.link(&b);
            b.link(&a);
            drop(b);

            let barrier = Arc::new(Barrier::new(2));
            let releaser = {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    drop(a);
                })
            };

            barrier.wait();
            collector.collect().unwrap();
            releaser.join().unwrap();

            // Whichever way the release fell, the stranded cycle is found now
            collector.collect().unwrap();
            assert_eq!(drops.load(Ordering::SeqCst), 2 * round);
        }

        assert_eq!(collector.heap().live_objects(), 0);
        assert!(!collector.heap().has_candidates());
    }

    /// Cycle member that tries to revive its peer while being broken up
    struct Reviver {
        next: Mutex<Option<StrongHandle<Reviver>>>,
        peer: Mutex<Option<WeakHandle<Reviver>>>,
        revived: Arc<Mutex<Vec<StrongHandle<Reviver>>>>,
        drops: Arc<AtomicUsize>,
    }

    impl Reviver {
        fn new(revived: &Arc<Mutex<Vec<StrongHandle<Reviver>>>>, drops: &Arc<AtomicUsize>) -> Self {
            Self {
                next: Mutex::new(None),
                peer: Mutex::new(None),
                revived: Arc::clone(revived),
                drops: Arc::clone(drops),
            }
        }
    }

    impl Managed for Reviver {
        const TRACED: bool = true;

        fn trace(&self, tracer: &mut Tracer) {
            if let Some(next) = &*self.next.lock() {
                tracer.visit(next);
            }
        }

        fn clear_references(&self) {
            let _next = self.next.lock().take();
            let peer = self.peer.lock().take();
            if let Some(strong) = peer.and_then(|weak| weak.upgrade()) {
                self.revived.lock().push(strong);
            }
        }
    }

    impl Drop for Reviver {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_weak_upgrade_refused_while_cycle_is_broken() {
        let collector = quiet_collector();
        let revived = Arc::new(Mutex::new(Vec::new()));
        let drops = Arc::new(AtomicUsize::new(0));

        let a = collector.allocate_managed(Reviver::new(&revived, &drops)).unwrap();
        let b = collector.allocate_managed(Reviver::new(&revived, &drops)).unwrap();
        *a.next.lock() = Some(b.clone());
        *b.next.lock() = Some(a.clone());
        *a.peer.lock() = Some(b.get_weak_handle());
        let observer = b.get_weak_handle();
        drop(a);
        drop(b);

        let report = collector.collect().unwrap();
        assert_eq!(report.objects_reclaimed, 2);
        assert!(revived.lock().is_empty());
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert!(observer.expired());
        assert_eq!(collector.heap().live_objects(), 0);
    }

    #[test]
    fn test_weak_upgrades_racing_collection() {
        let collector = Collector::with_config(CollectorConfig {
            logging: false,
            concurrent: true,
            ..CollectorConfig::default()
        });
        let drops = Arc::new(AtomicUsize::new(0));

        for round in 1..=50 {
            let a = collector.allocate_managed(Node::new(&drops)).unwrap();
            let b = collector.allocate_managed(Node::new(&drops)).unwrap();
            a.link(&b);
            b.link(&a);
            let observer = b.get_weak_handle();
            drop(a);
            drop(b);

            let upgrader = thread::spawn(move || {
                // A revived node must still reach its partner
                for _ in 0..1000 {
                    let Some(node) = observer.upgrade() else { break };
                    let next = node.next.lock().clone();
                    assert!(next.is_some(), "live node had its references cleared");
                    if let Some(next) = next {
                        assert!(next.next.lock().is_some());
                    }
                }
            });

            collector.collect().unwrap();
            upgrader.join().unwrap();
            // Survivors of a pass that raced the upgrader are found now
            collector.collect().unwrap();
            assert_eq!(drops.load(Ordering::SeqCst), 2 * round);
        }

        assert_eq!(drops.load(Ordering::SeqCst), 100);
        assert_eq!(collector.heap().live_objects(), 0);
    }

    struct Reentrant {
        collector: Arc<Collector>,
        next: Mutex<Option<StrongHandle<Reentrant>>>,
        nested: Arc<Mutex<Option<CollectionReport>>>,
    }

    impl Managed for Reentrant {
        const TRACED: bool = true;

        fn finalize(&mut self) {
            *self.nested.lock() = self.collector.collect().ok();
        }

        fn trace(&self, tracer: &mut Tracer) {
            if let Some(next) = &*self.next.lock() {
                tracer.visit(next);
            }
        }

        fn clear_references(&self) {
            let _next = self.next.lock().take();
        }
    }

    #[test]
    fn test_collect_from_finalizer_is_skipped() {
        let collector = Arc::new(quiet_collector());
        let nested = Arc::new(Mutex::new(None));

        let a = collector
            .allocate_managed(Reentrant {
                collector: Arc::clone(&collector),
                next: Mutex::new(None),
                nested: Arc::clone(&nested),
            })
            .unwrap();
        *a.next.lock() = Some(a.clone());
        drop(a);

        let report = collector.collect().unwrap();
        assert_eq!(report.objects_reclaimed, 1);

        let inner = nested.lock().take().unwrap();
        assert!(inner.skipped);
    }
}

#[cfg(test)]
mod collector_tests {
    use super::*;

    #[test]
    fn test_generation_counts() {
        let collector = quiet_collector();

        collector.collect_generation(0).unwrap();
        assert_eq!(collector.collection_count(0), 1);
        assert_eq!(collector.collection_count(1), 0);

        collector.collect_generation(1).unwrap();
        collector.collect().unwrap();
        assert_eq!(collector.collection_count(0), 3);
        assert_eq!(collector.collection_count(1), 2);
        assert_eq!(collector.collection_count(2), 1);
        assert_eq!(collector.collection_count(7), 0);
    }

    #[test]
    fn test_invalid_generation() {
        let collector = quiet_collector();
        let err = collector.collect_generation(MAX_GENERATION + 1).unwrap_err();
        assert_eq!(
            err,
            GcError::InvalidGeneration {
                requested: MAX_GENERATION + 1,
                max: MAX_GENERATION
            }
        );
        assert_eq!(collector.statistics().collections, 0);
    }

    #[test]
    fn test_statistics_and_reset() {
        let collector = quiet_collector();
        let keep = collector.allocate([0u8; 16]).unwrap();
        drop(collector.allocate([0u8; 16]).unwrap());
        collector.collect().unwrap();

        let stats = collector.statistics();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.deallocations, 1);
        assert_eq!(stats.bytes_allocated, 32);
        assert_eq!(stats.live_objects, 1);
        assert_eq!(stats.live_bytes, 16);
        assert_eq!(stats.collections, 1);

        collector.reset_statistics();
        let stats = collector.statistics();
        assert_eq!(stats.allocations, 0);
        assert_eq!(stats.collections, 0);
        assert_eq!(stats.live_objects, 1);
        drop(keep);
    }

    #[test]
    fn test_get_total_memory() {
        let collector = quiet_collector();
        let _a = collector.allocate([0u64; 4]).unwrap();
        assert_eq!(collector.get_total_memory(false).unwrap(), 32);

        let drops = Arc::new(AtomicUsize::new(0));
        let n = collector.allocate_managed(Node::new(&drops)).unwrap();
        n.link(&n);
        drop(n);

        assert_eq!(collector.get_total_memory(true).unwrap(), 32);
        assert_eq!(collector.collection_count(2), 1);
    }

    #[test]
    fn test_heap_limit() {
        let collector = quiet_collector();
        collector.set_heap_limit(Some(64)).unwrap();

        let a = collector.allocate([0u8; 32]).unwrap();
        let _b = collector.allocate([0u8; 32]).unwrap();
        let err = collector.allocate([0u8; 32]).unwrap_err();
        assert_eq!(
            err,
            GcError::HeapLimitExceeded {
                requested: 32,
                live: 64,
                limit: 64
            }
        );

        drop(a);
        assert!(collector.allocate([0u8; 32]).is_ok());
    }

    #[test]
    fn test_heap_limit_collects_garbage_cycles() {
        let collector = quiet_collector();
        let node_size = std::mem::size_of::<Node>();
        collector.set_heap_limit(Some(node_size * 2)).unwrap();

        let drops = Arc::new(AtomicUsize::new(0));
        let a = collector.allocate_managed(Node::new(&drops)).unwrap();
        let b = collector.allocate_managed(Node::new(&drops)).unwrap();
        a.link(&b);
        b.link(&a);
        drop(a);
        drop(b);

        let c = collector.allocate_managed(Node::new(&drops));
        assert!(c.is_ok());
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert_eq!(collector.collection_count(2), 1);
    }

    #[test]
    fn test_zero_heap_limit_rejected() {
        let collector = quiet_collector();
        assert!(collector.set_heap_limit(Some(0)).is_err());
        assert!(collector
            .configure(CollectorConfig {
                heap_limit: Some(0),
                ..CollectorConfig::default()
            })
            .is_err());
        assert_eq!(collector.config().heap_limit, None);
    }

    #[test]
    fn test_runtime_setters() {
        let collector = quiet_collector();
        collector.set_concurrent(true);
        collector.set_logging(true);
        collector.set_heap_limit(Some(1 << 20)).unwrap();

        let config = collector.config();
        assert!(config.concurrent);
        assert!(config.logging);
        assert_eq!(config.heap_limit, Some(1 << 20));
    }

    #[test]
    fn test_memory_pressure() {
        let collector = quiet_collector();
        assert_eq!(collector.add_memory_pressure(0), Err(GcError::InvalidMemoryPressure));
        assert_eq!(collector.remove_memory_pressure(0), Err(GcError::InvalidMemoryPressure));

        assert_eq!(collector.add_memory_pressure(100), Ok(100));
        assert_eq!(collector.add_memory_pressure(50), Ok(150));
        assert_eq!(collector.statistics().memory_pressure, 150);

        assert_eq!(collector.remove_memory_pressure(500), Ok(0));
        assert_eq!(collector.memory_pressure(), 0);
    }

    struct FailingInit;

    impl TracingBackend for FailingInit {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn init(&self) -> crate::error::GcResult<()> {
            Err(GcError::backend("failing", "no heap available"))
        }

        fn collect(&self, _heap: &Heap, _generation: usize) -> crate::error::GcResult<CollectOutcome> {
            Ok(CollectOutcome::default())
        }
    }

    #[test]
    fn test_backend_init_failure_is_reported() {
        let collector = Collector::with_backend(CollectorConfig::default(), FailingInit);

        let err = collector.initialize().unwrap_err();
        assert!(matches!(err, GcError::BackendInit { backend: "failing", .. }));
        assert!(err.is_fatal());
        assert!(collector.collect().is_err());
        assert!(!collector.is_initialized());

        // Counting keeps working without a backend
        let handle = collector.allocate(1u32).unwrap();
        assert_eq!(handle.use_count(), 1);
    }

    struct FailingCollect;

    impl TracingBackend for FailingCollect {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn collect(&self, _heap: &Heap, _generation: usize) -> crate::error::GcResult<CollectOutcome> {
            Err(GcError::backend("flaky", "scan aborted"))
        }
    }

    #[test]
    fn test_backend_collect_failure_propagates() {
        let collector = Collector::with_backend(CollectorConfig::default(), FailingCollect);
        let err = collector.collect().unwrap_err();
        assert!(matches!(err, GcError::Backend { backend: "flaky", .. }));
        assert_eq!(collector.collection_count(0), 0);

        // The collecting flag is cleared after a failed pass
        assert!(collector.collect().is_err());
    }

    #[test]
    fn test_counting_only_backend_leaks_cycles() {
        let collector = Collector::with_backend(
            CollectorConfig {
                logging: false,
                ..CollectorConfig::default()
            },
            CountingOnly,
        );
        let drops = Arc::new(AtomicUsize::new(0));
        let a = collector.allocate_managed(Node::new(&drops)).unwrap();
        a.link(&a);
        let weak = a.get_weak_handle();
        drop(a);

        collector.collect().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        // Break it by hand so the test does not leak
        let a = weak.lock();
        a.clear_references();
        drop(a);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}

#[cfg(test)]
mod cast_tests {
    use super::*;
    use std::any::Any;

    trait Shape {
        fn area(&self) -> f64;
    }

    struct Square(f64);

    impl Shape for Square {
        fn area(&self) -> f64 {
            self.0 * self.0
        }
    }

    #[test]
    fn test_upcast_to_trait_object() {
        let collector = quiet_collector();
        let square = collector.allocate(Square(3.0)).unwrap();

        let shape: StrongHandle<dyn Shape + Send + Sync> = crate::upcast!(square => dyn Shape + Send + Sync);
        assert_eq!(shape.area(), 9.0);
        assert_eq!(square.use_count(), 2);

        drop(square);
        assert_eq!(shape.use_count(), 1);
        assert_eq!(shape.area(), 9.0);
    }

    #[test]
    fn test_downcast() {
        let collector = quiet_collector();
        let any = collector.allocate(Square(2.0)).unwrap().into_any();
        assert_eq!(any.use_count(), 1);

        assert!(any.is::<Square>());
        assert!(any.downcast::<u32>().is_none());
        assert_eq!(any.use_count(), 1);

        let square = any.downcast::<Square>().unwrap();
        assert_eq!(square.area(), 4.0);
        assert_eq!(any.use_count(), 2);
    }

    #[test]
    fn test_null_casts() {
        let null: StrongHandle<Square> = StrongHandle::null();
        let shape: StrongHandle<dyn Shape + Send + Sync> = crate::upcast!(null => dyn Shape + Send + Sync);
        assert!(shape.is_null());

        let any: StrongHandle<dyn Any + Send + Sync> = StrongHandle::<Square>::null().into_any();
        assert!(any.downcast::<Square>().is_none());
    }
}

#[cfg(test)]
mod stack_ref_tests {
    use super::*;

    #[test]
    fn test_from_handle_carries_no_count() {
        let collector = quiet_collector();
        let handle = collector.allocate(21u32).unwrap();

        let borrowed = handle.as_stack_ref().unwrap();
        assert_eq!(*borrowed, 21);
        assert!(borrowed.has_block());
        assert_eq!(handle.use_count(), 1);

        let promoted = borrowed.to_strong_in(&collector).unwrap();
        assert!(promoted.ptr_eq(&handle));
        assert_eq!(handle.use_count(), 2);
    }

    #[test]
    fn test_from_ref_finds_managed_object() {
        let collector = quiet_collector();
        let handle = collector.allocate(String::from("managed")).unwrap();

        let borrowed = StackRef::from_ref(&*handle);
        assert!(!borrowed.has_block());

        let promoted = borrowed.to_strong_in(&collector).unwrap();
        assert!(promoted.ptr_eq(&handle));
        assert_eq!(promoted.as_str(), "managed");
    }

    #[test]
    fn test_from_ref_unmanaged_object() {
        let collector = quiet_collector();
        let local = String::from("on the stack");
        let borrowed: StackRef<'_, String> = StackRef::from(&local);

        assert!(borrowed.to_strong_in(&collector).is_none());
        assert_eq!(borrowed.len(), local.len());
    }

    #[test]
    fn test_from_raw_null() {
        let null: *const u32 = std::ptr::null();
        assert!(unsafe { StackRef::from_raw(null) }.is_none());
    }

    fn sum(values: StackRef<'_, Vec<u32>>) -> u32 {
        values.iter().sum()
    }

    #[test]
    fn test_parameter_passing() {
        let collector = quiet_collector();
        let handle = collector.allocate(vec![1, 2, 3]).unwrap();
        assert_eq!(sum(handle.as_stack_ref().unwrap()), 6);
        assert_eq!(handle.use_count(), 1);
    }
}
