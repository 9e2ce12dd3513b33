//! Batch applicator: resumable element-wise application of function specs.
//!
//! Flow:
//! Function specs → provision arrays → global resume point → iterate items →
//! compute → write element → commit watermark

use crate::models::{AstackError, FunctionSpec, Result};
use crate::store::{ArrayHandle, ArrayLayout, ArrayStore, DEFAULT_CHUNK_LEN};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Options for a run.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Resume existing arrays (true) or overwrite them (false)
    pub append: bool,
    /// Show a progress bar
    pub progress: bool,
    /// Chunk hint for newly created arrays
    pub chunk_len: u64,
    /// Growth bound for newly created arrays
    pub max_len: Option<u64>,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            append: true,
            progress: true,
            chunk_len: DEFAULT_CHUNK_LEN,
            max_len: None,
        }
    }
}

/// What provisioning did to an output array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionAction {
    /// No array existed, a fresh one was created
    Created,
    /// Existing array kept as is
    Appended,
    /// Existing array kept and grown to the sequence length
    Resized,
    /// Existing array deleted and recreated
    Overwritten,
}

/// Provisioning outcome for one function spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provisioned {
    pub dataset: String,
    pub action: ProvisionAction,
    /// Watermark the spec resumes from
    pub resume_point: u64,
}

/// Statistics for a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyStats {
    /// Sequence length
    pub total_items: u64,
    /// Index the loop started from
    pub start_index: u64,
    /// Function calls whose results were written
    pub computed: u64,
    /// (spec, index) pairs skipped because they were already processed
    pub skipped: u64,
    /// Final watermark per output array
    pub watermarks: BTreeMap<String, u64>,
    /// Provisioning outcome per output array
    pub provisioned: Vec<Provisioned>,
    /// Total runtime in seconds
    pub runtime_secs: f64,
    /// Items per second over the part of the sequence actually visited
    pub items_per_sec: f64,
}

impl ApplyStats {
    /// Calculate derived stats.
    pub fn finalize(&mut self) {
        let visited = self.total_items.saturating_sub(self.start_index);
        if self.runtime_secs > 0.0 {
            self.items_per_sec = visited as f64 / self.runtime_secs;
        }
    }
}

/// Applies function specs to every item of a sequence, resuming where the
/// output arrays left off.
pub struct Applicator<'s, S: ArrayStore + ?Sized> {
    store: &'s mut S,
    options: ApplyOptions,
}

impl<'s, S: ArrayStore + ?Sized> Applicator<'s, S> {
    /// Create an applicator with default options (append, progress bar).
    pub fn new(store: &'s mut S) -> Self {
        Self {
            store,
            options: ApplyOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Ensure every spec has a correctly sized array and return its resume point.
    pub fn provision<T>(&mut self, len: u64, defs: &[FunctionSpec<T>]) -> Result<Vec<Provisioned>> {
        let mut seen = HashSet::new();
        for spec in defs {
            if !seen.insert(spec.name.as_str()) {
                return Err(AstackError::InvalidInput(format!(
                    "output '{}' is declared more than once",
                    spec.name
                )));
            }
        }

        defs.iter()
            .map(|spec| {
                self.provision_one(spec, len)
                    .map_err(|e| match e {
                        e @ AstackError::Provisioning { .. } => e,
                        e => AstackError::provisioning(&spec.name, e),
                    })
            })
            .collect()
    }

    fn provision_one<T>(&mut self, spec: &FunctionSpec<T>, len: u64) -> Result<Provisioned> {
        let exists = self.store.contains(&spec.name)?;

        if exists && self.options.append {
            info!(dataset = %spec.name, "Appending to dataset");
            let mut handle = ArrayHandle::open(&mut *self.store, &spec.name)?;

            if handle.dtype() != spec.dtype || handle.item_shape() != spec.item_shape.as_slice() {
                warn!(
                    dataset = %spec.name,
                    stored = %handle.dtype(),
                    stored_shape = ?handle.item_shape(),
                    declared = %spec.dtype,
                    declared_shape = ?spec.item_shape,
                    "Declared layout differs from stored array, keeping stored layout"
                );
            }

            let resume_point = handle.processed();
            let mut action = ProvisionAction::Appended;
            if handle.len() < len {
                info!(dataset = %spec.name, from = handle.len(), to = len, "Attempting to resize");
                if let Err(e) = handle.resize(len) {
                    error!(dataset = %spec.name, error = %e, "Couldn't resize dataset");
                    return Err(AstackError::provisioning(&spec.name, e));
                }
                action = ProvisionAction::Resized;
            }

            debug!(dataset = %spec.name, resume_point, "Resuming dataset");
            return Ok(Provisioned {
                dataset: spec.name.clone(),
                action,
                resume_point,
            });
        }

        let action = if exists {
            info!(dataset = %spec.name, "Writing over old dataset");
            self.store.delete(&spec.name)?;
            ProvisionAction::Overwritten
        } else {
            info!(dataset = %spec.name, "Creating new dataset");
            ProvisionAction::Created
        };

        let layout = ArrayLayout {
            dtype: spec.dtype,
            item_shape: spec.item_shape.clone(),
            len,
            max_len: self.options.max_len,
            chunk_len: self.options.chunk_len,
        };
        self.store.create(&spec.name, &layout)?;
        self.store.set_processed(&spec.name, 0)?;

        Ok(Provisioned {
            dataset: spec.name.clone(),
            action,
            resume_point: 0,
        })
    }

    /// Run every spec over `items`, resuming from the stored watermarks.
    ///
    /// The first failing item aborts the whole run. Its index is not marked
    /// processed, so the next run recomputes it.
    pub fn run<T>(&mut self, items: &[T], defs: &[FunctionSpec<T>]) -> Result<ApplyStats> {
        let start = Instant::now();
        let total = items.len() as u64;

        let mut stats = ApplyStats {
            total_items: total,
            ..Default::default()
        };

        if defs.is_empty() {
            info!("No function definitions, nothing to do");
            return Ok(stats);
        }

        let provisioned = self.provision(total, defs)?;
        let start_index = provisioned
            .iter()
            .map(|p| p.resume_point)
            .min()
            .unwrap_or(0)
            .min(total);
        stats.start_index = start_index;
        stats.provisioned = provisioned;

        info!(
            total_items = total,
            start_index,
            functions = defs.len(),
            "Starting batch application"
        );

        let pb = self.progress_bar(total, start_index);
        let result = self.run_from(items, defs, start_index, &pb, &mut stats);
        match &result {
            Ok(()) => pb.finish_with_message("done"),
            Err(_) => pb.abandon(),
        }
        result?;

        self.store.flush()?;
        for spec in defs {
            stats
                .watermarks
                .insert(spec.name.clone(), self.store.processed(&spec.name)?);
        }

        stats.runtime_secs = start.elapsed().as_secs_f64();
        stats.finalize();

        info!(
            computed = stats.computed,
            skipped = stats.skipped,
            throughput = format!("{:.1}/s", stats.items_per_sec),
            "Batch application complete"
        );

        Ok(stats)
    }

    fn run_from<T>(
        &mut self,
        items: &[T],
        defs: &[FunctionSpec<T>],
        start_index: u64,
        pb: &ProgressBar,
        stats: &mut ApplyStats,
    ) -> Result<()> {
        for (offset, item) in items[start_index as usize..].iter().enumerate() {
            let index = start_index + offset as u64;

            for spec in defs {
                let mut handle = ArrayHandle::open(&mut *self.store, &spec.name)?;
                if handle.is_done(index) {
                    stats.skipped += 1;
                    continue;
                }

                let value = match spec.call(item) {
                    Ok(value) => value,
                    Err(source) => {
                        error!(dataset = %spec.name, index, error = %source, "Encountered error while running");
                        return Err(AstackError::Computation {
                            dataset: spec.name.clone(),
                            index,
                            source,
                        });
                    }
                };

                match handle.set(index, &value) {
                    Ok(()) => {}
                    Err(AstackError::Type(source)) => {
                        error!(dataset = %spec.name, index, error = %source, "Encountered error while running");
                        return Err(AstackError::Computation {
                            dataset: spec.name.clone(),
                            index,
                            source: Box::new(source),
                        });
                    }
                    Err(e) => return Err(e),
                }
                handle.commit_watermark(index)?;
                stats.computed += 1;
            }

            pb.inc(1);
        }
        Ok(())
    }

    fn progress_bar(&self, total: u64, start_index: u64) -> ProgressBar {
        if !self.options.progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        pb.set_position(start_index);
        pb
    }
}

/// Apply `defs` to every item of `items`, persisting results in `store`.
///
/// `append = true` resumes existing arrays; `append = false` recreates them.
pub fn apply<T, S: ArrayStore + ?Sized>(
    items: &[T],
    store: &mut S,
    defs: &[FunctionSpec<T>],
    append: bool,
) -> Result<ApplyStats> {
    Applicator::new(store)
        .with_options(ApplyOptions {
            append,
            ..Default::default()
        })
        .run(items, defs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DType, FunctionError, Kwargs, Value};
    use crate::store::{DirStore, MemoryStore};
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn quiet(append: bool) -> ApplyOptions {
        ApplyOptions {
            append,
            progress: false,
            ..Default::default()
        }
    }

    fn run(store: &mut MemoryStore, items: &[i64], defs: &[FunctionSpec<i64>], append: bool) -> Result<ApplyStats> {
        Applicator::new(store).with_options(quiet(append)).run(items, defs)
    }

    fn double() -> FunctionSpec<i64> {
        FunctionSpec::new("double", DType::Int64, |x: &i64, _: &Kwargs| Ok(Value::Int(x * 2)))
    }

    fn add() -> FunctionSpec<i64> {
        FunctionSpec::new("add", DType::Int64, |x: &i64, kw: &Kwargs| {
            let by = kw.get("by").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(Value::Int(x + by))
        })
        .with_kwarg("by", 100)
    }

    /// A spec that records which indices it was called for.
    fn recording(name: &str, calls: Rc<RefCell<Vec<i64>>>) -> FunctionSpec<i64> {
        FunctionSpec::new(name, DType::Int64, move |x: &i64, _: &Kwargs| {
            calls.borrow_mut().push(*x);
            Ok(Value::Int(*x))
        })
    }

    fn failing_at(name: &str, bad: i64) -> FunctionSpec<i64> {
        FunctionSpec::new(name, DType::Int64, move |x: &i64, _: &Kwargs| {
            if *x == bad {
                Err::<Value, FunctionError>(format!("cannot handle {x}").into())
            } else {
                Ok(Value::Int(*x))
            }
        })
    }

    fn ints(store: &MemoryStore, name: &str) -> Vec<i64> {
        store
            .values(name)
            .unwrap()
            .into_iter()
            .map(|v| match v {
                Value::Int(i) => i,
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_fresh_run_fills_all_arrays() {
        let mut store = MemoryStore::new();
        let items: Vec<i64> = (0..5).collect();
        let stats = run(&mut store, &items, &[double(), add()], true).unwrap();

        assert_eq!(ints(&store, "double"), vec![0, 2, 4, 6, 8]);
        assert_eq!(ints(&store, "add"), vec![100, 101, 102, 103, 104]);
        assert_eq!(store.processed("double").unwrap(), 4);
        assert_eq!(store.processed("add").unwrap(), 4);
        assert_eq!(stats.start_index, 0);
        assert_eq!(stats.computed, 10);
        assert_eq!(stats.skipped, 0);
        assert_eq!(stats.watermarks["double"], 4);
        assert!(stats
            .provisioned
            .iter()
            .all(|p| p.action == ProvisionAction::Created));
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let items: Vec<i64> = (0..6).collect();

        let mut once = MemoryStore::new();
        run(&mut once, &items, &[double(), add()], true).unwrap();

        let mut twice = MemoryStore::new();
        run(&mut twice, &items, &[double(), add()], true).unwrap();
        let stats = run(&mut twice, &items, &[double(), add()], true).unwrap();

        assert_eq!(ints(&once, "double"), ints(&twice, "double"));
        assert_eq!(ints(&once, "add"), ints(&twice, "add"));
        // Only the item at the watermark is recomputed.
        assert_eq!(stats.start_index, 5);
        assert_eq!(stats.computed, 2);
        assert!(stats
            .provisioned
            .iter()
            .all(|p| p.action == ProvisionAction::Appended));
    }

    #[test]
    fn test_independent_spec_resume() {
        let mut store = MemoryStore::new();
        let items: Vec<i64> = (0..10).collect();
        for name in ["a", "b"] {
            store
                .create(name, &ArrayLayout::new(DType::Int64, vec![], 10))
                .unwrap();
        }
        store.set_processed("a", 5).unwrap();
        store.set_processed("b", 2).unwrap();

        let calls_a = Rc::new(RefCell::new(Vec::new()));
        let calls_b = Rc::new(RefCell::new(Vec::new()));
        let defs = [
            recording("a", Rc::clone(&calls_a)),
            recording("b", Rc::clone(&calls_b)),
        ];
        let stats = run(&mut store, &items, &defs, true).unwrap();

        assert_eq!(stats.start_index, 2);
        assert_eq!(*calls_a.borrow(), vec![5, 6, 7, 8, 9]);
        assert_eq!(*calls_b.borrow(), (2..10).collect::<Vec<_>>());
        assert_eq!(stats.skipped, 3);
        assert_eq!(store.processed("a").unwrap(), 9);
        assert_eq!(store.processed("b").unwrap(), 9);
    }

    #[test]
    fn test_overwrite_resets_watermark() {
        let mut store = MemoryStore::new();
        let items: Vec<i64> = (0..10).collect();
        store
            .create("a", &ArrayLayout::new(DType::Int64, vec![], 10))
            .unwrap();
        store.write("a", 3, &Value::Int(-1)).unwrap();
        store.set_processed("a", 7).unwrap();

        let calls = Rc::new(RefCell::new(Vec::new()));
        let stats = run(&mut store, &items, &[recording("a", Rc::clone(&calls))], false).unwrap();

        assert_eq!(stats.provisioned[0].action, ProvisionAction::Overwritten);
        assert_eq!(stats.provisioned[0].resume_point, 0);
        assert_eq!(*calls.borrow(), items);
        assert_eq!(ints(&store, "a"), items);
        assert_eq!(store.processed("a").unwrap(), 9);
    }

    #[test]
    fn test_grow_on_longer_sequence() {
        let mut store = MemoryStore::new();
        store
            .create("a", &ArrayLayout::new(DType::Int64, vec![], 5))
            .unwrap();
        for i in 0..5 {
            store.write("a", i, &Value::Int(-(i as i64))).unwrap();
        }
        store.set_processed("a", 5).unwrap();

        let items: Vec<i64> = (0..8).collect();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let stats = run(&mut store, &items, &[recording("a", Rc::clone(&calls))], true).unwrap();

        assert_eq!(stats.provisioned[0].action, ProvisionAction::Resized);
        assert_eq!(store.info("a").unwrap().len, 8);
        assert_eq!(*calls.borrow(), vec![5, 6, 7]);
        assert_eq!(ints(&store, "a"), vec![0, -1, -2, -3, -4, 5, 6, 7]);
        assert_eq!(store.processed("a").unwrap(), 7);
    }

    #[test]
    fn test_failure_stops_before_checkpoint() {
        let mut store = MemoryStore::new();
        let items: Vec<i64> = (0..10).collect();
        let err = run(&mut store, &items, &[double(), failing_at("flaky", 6)], true).unwrap_err();

        assert_eq!(err.dataset(), Some("flaky"));
        assert!(matches!(err, AstackError::Computation { index: 6, .. }));
        assert_eq!(store.processed("flaky").unwrap(), 5);
        // The earlier spec already finished index 6 before the failure.
        assert_eq!(store.processed("double").unwrap(), 6);

        let source = err.into_function_error().unwrap();
        assert_eq!(source.to_string(), "cannot handle 6");

        // After a fix the failed index is recomputed.
        let calls = Rc::new(RefCell::new(Vec::new()));
        let defs = [double(), recording("flaky", Rc::clone(&calls))];
        let stats = run(&mut store, &items, &defs, true).unwrap();
        assert_eq!(stats.start_index, 5);
        assert_eq!(*calls.borrow(), vec![5, 6, 7, 8, 9]);
        assert_eq!(store.processed("flaky").unwrap(), 9);
    }

    #[test]
    fn test_type_mismatch_is_computation_failure() {
        let mut store = MemoryStore::new();
        let items: Vec<i64> = vec![1, 2, 300];
        let narrow = FunctionSpec::new("narrow", DType::UInt8, |x: &i64, _: &Kwargs| Ok(Value::Int(*x)));
        let err = run(&mut store, &items, &[narrow], true).unwrap_err();

        assert!(matches!(
            err,
            AstackError::Computation { ref dataset, index: 2, .. } if dataset == "narrow"
        ));
        assert_eq!(store.processed("narrow").unwrap(), 1);
    }

    #[test]
    fn test_resize_failure_aborts_before_any_item() {
        let mut store = MemoryStore::new();
        let layout = ArrayLayout {
            max_len: Some(3),
            ..ArrayLayout::new(DType::Int64, vec![], 3)
        };
        store.create("a", &layout).unwrap();

        let calls = Rc::new(RefCell::new(Vec::new()));
        let items: Vec<i64> = (0..5).collect();
        let err = run(&mut store, &items, &[recording("a", Rc::clone(&calls))], true).unwrap_err();

        match err {
            AstackError::Provisioning { dataset, source } => {
                assert_eq!(dataset, "a");
                assert!(matches!(*source, AstackError::ResizeExceedsBound { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(calls.borrow().is_empty());
        assert_eq!(store.info("a").unwrap().len, 3);
    }

    #[test]
    fn test_watermarks_are_monotonic_across_runs() {
        let mut store = MemoryStore::new();
        let mut last = 0;
        for len in [3i64, 3, 7, 7, 10] {
            let items: Vec<i64> = (0..len).collect();
            run(&mut store, &items, &[double()], true).unwrap();
            let processed = store.processed("double").unwrap();
            assert!(processed >= last);
            last = processed;
        }
        assert_eq!(last, 9);
    }

    #[test]
    fn test_shorter_sequence_does_not_index_past_end() {
        let mut store = MemoryStore::new();
        let long: Vec<i64> = (0..8).collect();
        run(&mut store, &long, &[double()], true).unwrap();

        let short: Vec<i64> = (0..4).collect();
        let stats = run(&mut store, &short, &[double()], true).unwrap();
        assert_eq!(stats.start_index, 4);
        assert_eq!(stats.computed, 0);
        assert_eq!(store.processed("double").unwrap(), 7);
    }

    #[test]
    fn test_empty_inputs() {
        let mut store = MemoryStore::new();
        let stats = run(&mut store, &[], &[double()], true).unwrap();
        assert_eq!(stats.computed, 0);
        assert_eq!(store.info("double").unwrap().len, 0);

        let stats = run(&mut store, &[1, 2], &[], true).unwrap();
        assert_eq!(stats.total_items, 2);
        assert!(stats.provisioned.is_empty());
    }

    #[test]
    fn test_duplicate_outputs_rejected() {
        let mut store = MemoryStore::new();
        let err = run(&mut store, &[1], &[double(), double()], true).unwrap_err();
        assert!(matches!(err, AstackError::InvalidInput(_)));
        assert!(store.names().unwrap().is_empty());
    }

    #[test]
    fn test_resume_from_disk_after_failure() {
        let temp_dir = TempDir::new().unwrap();
        let items: Vec<i64> = (0..6).collect();

        {
            let mut store = DirStore::open(temp_dir.path()).unwrap();
            let err = apply_quiet(&mut store, &items, &[failing_at("v", 4)]).unwrap_err();
            assert!(matches!(err, AstackError::Computation { index: 4, .. }));
        }

        let mut store = DirStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.processed("v").unwrap(), 3);
        let stats = apply_quiet(&mut store, &items, &[failing_at("v", -1)]).unwrap();
        assert_eq!(stats.start_index, 3);
        assert_eq!(stats.computed, 3);
        for i in 0..6u64 {
            assert_eq!(store.read("v", i).unwrap(), Value::Int(i as i64));
        }
    }

    #[test]
    fn test_stats_serialize_to_json() {
        let mut store = MemoryStore::new();
        let stats = run(&mut store, &[1, 2, 3], &[double()], true).unwrap();

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total_items"], 3);
        assert_eq!(json["watermarks"]["double"], 2);
        assert_eq!(json["provisioned"][0]["action"], "created");
        assert_eq!(json["provisioned"][0]["dataset"], "double");
    }

    #[test]
    fn test_zero_width_outputs_read_back_from_disk() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = DirStore::open(temp_dir.path()).unwrap();
        let empty = FunctionSpec::new("z", DType::Float64, |_: &i64, _: &Kwargs| {
            Ok(Value::from(vec![Vec::<f64>::new(), Vec::new()]))
        })
        .with_shape(vec![2, 0]);

        let stats = apply_quiet(&mut store, &[1, 2], &[empty]).unwrap();
        assert_eq!(stats.watermarks["z"], 1);
        assert_eq!(
            store.read("z", 0).unwrap(),
            Value::List(vec![Value::List(vec![]), Value::List(vec![])])
        );
    }

    #[test]
    fn test_oversized_shape_is_provisioning_failure() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = DirStore::open(temp_dir.path()).unwrap();
        let huge = double().with_shape(vec![usize::MAX, 4]);

        match apply_quiet(&mut store, &[1], &[huge]).unwrap_err() {
            AstackError::Provisioning { dataset, source } => {
                assert_eq!(dataset, "double");
                assert!(matches!(*source, AstackError::InvalidInput(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!store.contains("double").unwrap());
    }

    fn apply_quiet<S: ArrayStore + ?Sized>(
        store: &mut S,
        items: &[i64],
        defs: &[FunctionSpec<i64>],
    ) -> Result<ApplyStats> {
        Applicator::new(store).with_options(quiet(true)).run(items, defs)
    }
}
