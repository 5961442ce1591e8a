//! End-to-end runs through the public API, inline and on a worker pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use xylem::{
    Collector, Environment, ExecuteError, FailureListener, IterReader, MapError, Mapping,
    MappingChain, Output, ReadError, Reader, RetryError, TaskFailure, from_fn,
};

type Key = &'static str;

/// Reader that counts calls to `close`.
struct CountingReader {
    inner: IterReader<Key, i64>,
    closes: Arc<AtomicUsize>,
}

fn counting_reader(records: Vec<(Key, i64)>) -> (CountingReader, Arc<AtomicUsize>) {
    let closes = Arc::new(AtomicUsize::new(0));
    let reader = CountingReader {
        inner: IterReader::new(records),
        closes: Arc::clone(&closes),
    };
    (reader, closes)
}

impl Reader for CountingReader {
    type Key = Key;
    type Value = i64;

    fn advance(&mut self) -> Result<bool, ReadError> {
        self.inner.advance()
    }

    fn current_key(&self) -> Option<&Key> {
        self.inner.current_key()
    }

    fn current_value(&self) -> Option<&i64> {
        self.inner.current_value()
    }

    fn close(&mut self) -> Result<(), ReadError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

fn environments() -> Vec<(&'static str, Environment)> {
    let mut envs = vec![("inline", Environment::new())];
    #[cfg(feature = "parallel")]
    envs.push((
        "pool",
        Environment::new().with_executor(xylem::PoolExecutor::new(4).unwrap()),
    ));
    envs
}

fn abc() -> Vec<(Key, i64)> {
    vec![("a", 1), ("b", 2), ("c", 3)]
}

fn double() -> impl Mapping<Key, i64, OutKey = Key, OutValue = i64> {
    from_fn(|k: &Key, v: &i64, out: &dyn Output<Key, i64>| {
        out.write(*k, v * 2)?;
        Ok(())
    })
}

fn double_except(bad: Key) -> impl Mapping<Key, i64, OutKey = Key, OutValue = i64> {
    from_fn(move |k: &Key, v: &i64, out: &dyn Output<Key, i64>| {
        if *k == bad {
            return Err(MapError::failed(format!("cannot process {k}")));
        }
        out.write(*k, v * 2)?;
        Ok(())
    })
}

fn sorted(output: &Collector<Key, i64>) -> Vec<(Key, i64)> {
    let mut records = output.records();
    records.sort();
    records
}

#[test]
fn test_doubling_scenario() {
    for (name, env) in environments() {
        let (reader, closes) = counting_reader(abc());
        let output = Arc::new(Collector::new());

        let summary = env
            .execute(reader, double(), Arc::clone(&output), Vec::new())
            .unwrap();

        assert_eq!(sorted(&output), vec![("a", 2), ("b", 4), ("c", 6)], "{name}");
        assert_eq!(output.len(), 3, "{name}");
        assert_eq!(summary.succeeded, 3, "{name}");
        assert_eq!(closes.load(Ordering::SeqCst), 1, "{name}");
    }
}

#[test]
fn test_failure_scenario_with_dropping_listener() {
    for (name, env) in environments() {
        let (reader, closes) = counting_reader(abc());
        let output = Arc::new(Collector::new());
        let failed_keys = Arc::new(Collector::new());

        let listener: Arc<dyn FailureListener<Key, i64>> = {
            let failed_keys = Arc::clone(&failed_keys);
            Arc::new(move |failure: &TaskFailure<Key, i64>| {
                failed_keys.write(*failure.key(), *failure.value()).unwrap();
                failure.discard();
            })
        };

        let summary = env
            .with_drop_failed_tasks(true)
            .execute(reader, double_except("b"), Arc::clone(&output), vec![listener])
            .unwrap();

        assert_eq!(sorted(&output), vec![("a", 2), ("c", 6)], "{name}");
        assert_eq!(failed_keys.records(), vec![("b", 2)], "{name}");
        assert_eq!(summary.failed, 1, "{name}");
        assert_eq!(summary.dropped, 1, "{name}");
        assert_eq!(closes.load(Ordering::SeqCst), 1, "{name}");
    }
}

#[test]
fn test_drop_policy_without_listeners_raises_nothing() {
    for (name, env) in environments() {
        let records: Vec<(Key, i64)> = (0..50)
            .map(|i| if i == 17 { ("poison", i) } else { ("ok", i) })
            .collect();
        let output = Arc::new(Collector::new());

        let summary = env
            .with_drop_failed_tasks(true)
            .execute(
                IterReader::new(records),
                double_except("poison"),
                Arc::clone(&output),
                Vec::new(),
            )
            .unwrap();

        assert_eq!(output.len(), 49, "{name}");
        assert!(output.records().iter().all(|(k, _)| *k == "ok"), "{name}");
        assert_eq!(summary.dropped, 1, "{name}");
    }
}

#[test]
fn test_chain_output_matches_sequential_walk() {
    let chain = MappingChain::new()
        .stage(double())
        .stage(from_fn(|k: &Key, v: &i64, out: &dyn Output<Key, i64>| {
            if v % 3 != 0 {
                out.write(*k, *v)?;
                out.write(*k, v + 100)?;
            }
            Ok(())
        }));
    let records: Vec<(Key, i64)> = (0..40).map(|i| ("k", i)).collect();

    let expected = Collector::new();
    for (k, v) in &records {
        chain.map(k, v, &expected).unwrap();
    }
    let mut expected = expected.into_records();
    expected.sort();

    for (name, env) in environments() {
        let output = Arc::new(Collector::new());
        env.execute(
            IterReader::new(records.clone()),
            chain.clone(),
            Arc::clone(&output),
            Vec::new(),
        )
        .unwrap();

        assert_eq!(sorted(&output), expected, "{name}");
    }
}

#[test]
fn test_retry_keeps_one_entry_per_job() {
    for (name, env) in environments() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mapping = {
            let attempts = Arc::clone(&attempts);
            from_fn(move |k: &Key, v: &i64, out: &dyn Output<Key, i64>| {
                if *k == "b" && attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(MapError::failed("not yet"));
                }
                out.write(*k, v * 2)?;
                Ok(())
            })
        };
        let output = Arc::new(Collector::new());
        let mut run = env.start(IterReader::new(abc()), mapping, Arc::clone(&output));

        let first = match run.execute() {
            Err(ExecuteError::Task(failure)) => failure,
            other => panic!("{name}: expected a task failure, got {other:?}"),
        };
        first.retry().unwrap();
        assert!(
            matches!(first.retry(), Err(RetryError::NotFailed(_))),
            "{name}"
        );
        assert!(run.failures().is_empty(), "{name}");

        let second = run.execute().unwrap_err().into_failure().unwrap();
        assert_eq!(second.job_id(), first.job_id(), "{name}");
        assert_eq!(run.failures().len(), 1, "{name}");
        second.retry().unwrap();

        let summary = run.execute().unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3, "{name}");
        assert_eq!(summary.retried, 2, "{name}");
        assert_eq!(summary.failed, 2, "{name}");
        assert_eq!(sorted(&output), vec![("a", 2), ("b", 4), ("c", 6)], "{name}");
    }
}

#[test]
fn test_listener_can_defer_decision() {
    for (name, env) in environments() {
        let held = Arc::new(std::sync::Mutex::new(Vec::new()));
        let output = Arc::new(Collector::new());

        let mut run = env
            .start(IterReader::new(abc()), double_except("c"), Arc::clone(&output))
            .with_listener({
                let held = Arc::clone(&held);
                move |failure: &TaskFailure<Key, i64>| {
                    held.lock().unwrap().push(failure.clone());
                }
            });

        let stalled = match run.execute() {
            Err(ExecuteError::Stalled(failures)) => failures,
            other => panic!("{name}: expected a stall, got {other:?}"),
        };
        assert_eq!(stalled.len(), 1, "{name}");
        assert_eq!(*stalled[0].key(), "c", "{name}");

        let deferred = held.lock().unwrap().pop().unwrap();
        assert_eq!(deferred.job_id(), stalled[0].job_id(), "{name}");
        assert!(deferred.discard(), "{name}");
        assert!(stalled[0].is_resolved(), "{name}");

        let summary = run.execute().unwrap();
        assert_eq!(summary.dropped, 1, "{name}");
        assert_eq!(sorted(&output), vec![("a", 2), ("b", 4)], "{name}");
    }
}
