//! Integration tests for the full deferral pipeline.
//!
//! Tests: promote → PriorityRegistry → BatchDriver → DeferredExecutor →
//! QueryEngine → result cache → demote
//!
//! Verifies:
//! - Results land in the result cache under the descriptor's target key
//! - Skip/force semantics hold end-to-end
//! - Demotion is by the observed score, also under concurrent promotions

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use serde_json::{json, Value as JsonValue};

    use deferq_core::{
        CachedDeferredQuery, DeferredQuery, ExecuteStatus, ParamValue, QueryParameter,
        SweepSummary,
    };

    use crate::engine::{EngineError, ScriptedQueryEngine};
    use crate::executor::{DeferredExecutor, ExecuteDeferred};
    use crate::registry::{Demotion, PriorityRegistry, RegistryConfig};
    use crate::store::{InMemoryPrioritySet, InMemoryTtlCache, PrioritySet, TtlCache};
    use crate::sweep::BatchDriver;

    type Registry = PriorityRegistry<Arc<InMemoryTtlCache>, Arc<InMemoryPrioritySet>>;
    type Executor =
        DeferredExecutor<Arc<InMemoryTtlCache>, Arc<InMemoryPrioritySet>, Arc<ScriptedQueryEngine>>;

    const SET: &str = "deferred_queries";

    struct Pipeline {
        registry: Arc<Registry>,
        cache: Arc<InMemoryTtlCache>,
        scores: Arc<InMemoryPrioritySet>,
        engine: Arc<ScriptedQueryEngine>,
        executor: Arc<Executor>,
    }

    impl Pipeline {
        fn driver(&self) -> BatchDriver<Arc<InMemoryTtlCache>, Arc<InMemoryPrioritySet>, Arc<Executor>> {
            BatchDriver::new(self.registry.clone(), self.executor.clone())
        }
    }

    fn setup() -> Pipeline {
        let cache = Arc::new(InMemoryTtlCache::new());
        let scores = Arc::new(InMemoryPrioritySet::new());
        let registry = Arc::new(PriorityRegistry::new(
            cache.clone(),
            scores.clone(),
            RegistryConfig::default(),
        ));
        let engine = Arc::new(ScriptedQueryEngine::new());
        let executor = Arc::new(DeferredExecutor::new(registry.clone(), engine.clone()));
        Pipeline {
            registry,
            cache,
            scores,
            engine,
            executor,
        }
    }

    fn descriptor(key: &str, sql: &str) -> DeferredQuery {
        DeferredQuery::new(key, sql)
            .unwrap()
            .with_result_ttl(Duration::from_secs(600))
    }

    #[test]
    fn repeated_promotions_enumerate_once_with_summed_score() {
        let p = setup();
        let q = descriptor("K1", "SELECT 1");
        for _ in 0..3 {
            p.registry.promote(&q).unwrap();
        }

        let entries: Vec<CachedDeferredQuery> = p
            .registry
            .enumerate()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].query().target_cache_key(), "K1");
        assert_eq!(entries[0].score(), 3);
    }

    #[test]
    fn cached_value_is_skipped_without_running_the_query() {
        let p = setup();
        let q = descriptor("K2", "SELECT 2");
        p.registry.promote(&q).unwrap();
        p.engine.respond("SELECT 2", json!(2));
        p.cache.save("K2", &json!("fresh"), Duration::ZERO).unwrap();

        let row = p.executor.execute(&q, Duration::from_secs(1), 1, false).unwrap();

        assert_eq!(row.status, ExecuteStatus::Skipped);
        assert_eq!(p.engine.run_count(), 0);
        assert_eq!(p.cache.fetch("K2").unwrap(), Some(json!("fresh")));
    }

    #[test]
    fn executed_result_lands_in_result_cache() {
        let p = setup();
        let q = descriptor("K3", "SELECT 7");
        p.registry.promote(&q).unwrap();
        p.engine.respond("SELECT 7", json!(7));

        let row = p.executor.execute(&q, Duration::from_secs(1), 1, false).unwrap();

        assert_eq!(row.status, ExecuteStatus::Done);
        assert_eq!(row.query, "SELECT 7");
        assert_eq!(p.cache.fetch("K3").unwrap(), Some(json!(7)));
    }

    #[test]
    fn engine_failure_caches_null_sentinel() {
        let p = setup();
        let q = descriptor("K4", "SELECT broken");
        p.registry.promote(&q).unwrap();
        p.engine.fail("SELECT broken", EngineError::Execution("syntax error".to_string()));

        let row = p.executor.execute(&q, Duration::from_secs(1), 1, false).unwrap();

        assert_eq!(row.status, ExecuteStatus::Failed);
        assert_eq!(p.cache.fetch("K4").unwrap(), Some(JsonValue::Null));
    }

    #[test]
    fn stale_overshooting_demotion_evicts_entry_and_payload() {
        let p = setup();
        let q = descriptor("K5", "SELECT 5");
        for _ in 0..50 {
            p.registry.promote(&q).unwrap();
        }

        let demotion = p
            .registry
            .demote(&CachedDeferredQuery::new(q, 70))
            .unwrap();

        assert_eq!(demotion, Demotion::Evicted);
        assert_eq!(p.scores.score(SET, "K5"), None);
        assert_eq!(p.cache.fetch("provision_K5").unwrap(), None);
    }

    #[test]
    fn promotion_after_observation_survives_demotion() {
        let p = setup();
        let q = descriptor("K6", "SELECT 6");
        for _ in 0..3 {
            p.registry.promote(&q).unwrap();
        }
        let observed = p.registry.enumerate().unwrap().next().unwrap().unwrap();

        p.registry.promote(&q).unwrap();
        p.registry.demote(&observed).unwrap();

        assert_eq!(p.scores.score(SET, "K6"), Some(1));
        let again = p.registry.enumerate().unwrap().next().unwrap().unwrap();
        assert_eq!(again.score(), 1);
    }

    #[test]
    fn enumerated_descriptor_equals_promoted_descriptor() {
        let p = setup();
        let q = DeferredQuery::new("K7", "SELECT * FROM orders WHERE owner_id = :owner AND day = :day")
            .unwrap()
            .with_parameter(QueryParameter::new("owner", ParamValue::entity("user", 42)))
            .unwrap()
            .with_parameter(QueryParameter::new("day", ParamValue::scalar("2024-03-01")).with_type("date"))
            .unwrap()
            .with_hint("fetch_mode", "eager")
            .with_hint("limits", json!({"rows": 500}))
            .with_result_ttl(Duration::from_secs(1800));
        p.registry.promote(&q).unwrap();

        let entry = p.registry.enumerate().unwrap().next().unwrap().unwrap();

        assert_eq!(entry.query(), &q);
        assert_eq!(entry.into_query().result_ttl(), Duration::from_secs(1800));
    }

    #[test]
    fn sweep_executes_everything_forced_and_clears_the_registry() {
        let p = setup();
        let hot = descriptor("hot", "SELECT hot");
        let cold = descriptor("cold", "SELECT cold");
        let broken = descriptor("broken", "SELECT broken");
        let cached = descriptor("cached", "SELECT cached");
        for _ in 0..4 {
            p.registry.promote(&hot).unwrap();
        }
        p.registry.promote(&cold).unwrap();
        p.registry.promote(&broken).unwrap();
        p.registry.promote(&cached).unwrap();

        p.engine.respond("SELECT hot", json!([{"n": 1}]));
        p.engine.respond("SELECT cold", json!([]));
        p.engine.fail("SELECT broken", EngineError::Timeout);
        p.cache.save("cached", &json!("kept"), Duration::ZERO).unwrap();

        let summary = p.driver().run_sweep().unwrap();

        assert_eq!(summary, SweepSummary::new(2, 1, 1));
        assert_eq!(p.registry.enumerate().unwrap().count(), 0);
        assert_eq!(p.cache.fetch("hot").unwrap(), Some(json!([{"n": 1}])));
        assert_eq!(p.cache.fetch("cold").unwrap(), Some(json!([])));
        assert_eq!(p.cache.fetch("broken").unwrap(), Some(JsonValue::Null));
        assert_eq!(p.cache.fetch("cached").unwrap(), Some(json!("kept")));

        let runs = p.engine.runs();
        assert_eq!(runs[0].query, "SELECT hot");
        assert_eq!(runs[0].timeout, Some(Duration::from_secs(4 * 300)));
        assert!(runs[1..].iter().all(|r| r.timeout == Some(Duration::from_secs(300))));
        assert_eq!(p.engine.current_timeout(), None);
    }

    #[test]
    fn forced_sweep_retries_a_cached_failure() {
        let p = setup();
        let q = descriptor("flaky", "SELECT flaky");
        p.registry.promote(&q).unwrap();
        p.engine.fail("SELECT flaky", EngineError::Timeout);

        assert_eq!(p.driver().run_sweep().unwrap(), SweepSummary::new(0, 0, 1));

        // Not retried on a plain request...
        let row = p.executor.execute(&q, Duration::from_secs(1), 1, false).unwrap();
        assert_eq!(row.status, ExecuteStatus::Skipped);

        // ...but the next sweep forces it.
        p.engine.respond("SELECT flaky", json!(3));
        p.registry.promote(&q).unwrap();
        assert_eq!(p.driver().run_sweep().unwrap(), SweepSummary::new(1, 0, 0));
        assert_eq!(p.cache.fetch("flaky").unwrap(), Some(json!(3)));
    }

    #[test]
    fn sweep_survives_malformed_and_expired_payloads() {
        let p = setup();
        p.registry.promote(&descriptor("good", "SELECT good")).unwrap();
        p.engine.respond("SELECT good", json!(1));
        p.scores.increment_score(SET, "orphan", 9).unwrap();
        p.scores.increment_score(SET, "garbage", 8).unwrap();
        p.cache
            .save("provision_garbage", &json!([1, 2, 3]), Duration::ZERO)
            .unwrap();

        let summary = p.driver().run_sweep().unwrap();

        assert_eq!(summary, SweepSummary::new(1, 0, 0));
        // Unloadable entries are never demoted.
        assert_eq!(p.scores.score(SET, "orphan"), Some(9));
        assert_eq!(p.scores.score(SET, "garbage"), Some(8));
    }

    #[test]
    fn stopping_early_leaves_lower_priority_entries_untouched() {
        let p = setup();
        for _ in 0..2 {
            p.registry.promote(&descriptor("first", "SELECT 1")).unwrap();
        }
        p.registry.promote(&descriptor("second", "SELECT 2")).unwrap();
        p.engine.respond("SELECT 1", json!(1));

        let entry = p.registry.enumerate().unwrap().next().unwrap().unwrap();
        p.executor
            .execute(entry.query(), Duration::from_secs(1), entry.score(), true)
            .unwrap();
        p.registry.demote(&entry).unwrap();

        assert_eq!(p.scores.score(SET, "first"), None);
        assert_eq!(p.scores.score(SET, "second"), Some(1));
        assert_eq!(p.cache.fetch("second").unwrap(), None);
    }

    #[test]
    fn concurrent_promotions_are_not_lost_to_a_demotion() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 250;

        let p = setup();
        let q = descriptor("race", "SELECT race");
        for _ in 0..10 {
            p.registry.promote(&q).unwrap();
        }
        let observed = p.registry.enumerate().unwrap().next().unwrap().unwrap();
        assert_eq!(observed.score(), 10);
        // One promotion after the observation keeps the entry alive whatever
        // the interleaving below.
        p.registry.promote(&q).unwrap();

        let promoters: Vec<_> = (0..THREADS)
            .map(|_| {
                let registry = p.registry.clone();
                let q = q.clone();
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        registry.promote(&q).unwrap();
                    }
                })
            })
            .collect();

        let demotion = p.registry.demote(&observed).unwrap();
        assert!(matches!(demotion, Demotion::Retained { score } if score >= 1));

        for h in promoters {
            h.join().unwrap();
        }

        let expected = (THREADS * PER_THREAD + 1) as i64;
        assert_eq!(p.scores.score(SET, "race"), Some(expected));
        assert!(p.cache.fetch("provision_race").unwrap().is_some());
    }
}
