#![forbid(unsafe_code)]

use kmm::AllocPolicy;
use kmm_harness::{
    AllocStressConfig, CacheStressConfig, run_alloc_stress, run_cache_stress,
};

#[test]
fn cache_stress_smoke() {
    let config = CacheStressConfig {
        threads: 4,
        ops_per_thread: 500,
        blocks: 16,
        shards: 5,
        buffers_per_shard: 4,
        seed: 1,
    };
    let report = run_cache_stress(&config).expect("stress");

    assert_eq!(report.total_ops, 2_000);
    assert_eq!(report.reads + report.writes, 2_000);
    assert_eq!(
        report.stats.hits + report.stats.misses,
        2_000,
        "every op is one cache lookup"
    );
    assert_eq!(report.stats.disk_writes, report.writes);
}

#[test]
fn cache_stress_rejects_undersized_shards() {
    let config = CacheStressConfig {
        threads: 8,
        buffers_per_shard: 4,
        ..CacheStressConfig::default()
    };
    assert!(run_cache_stress(&config).is_err());
}

#[test]
fn alloc_stress_per_core() {
    let config = AllocStressConfig {
        policy: AllocPolicy::PerCore,
        cores: 4,
        pages: 16,
        ops_per_thread: 1_000,
        seed: 2,
    };
    let report = run_alloc_stress(&config).expect("stress");

    assert_eq!(report.policy, "per-core");
    assert_eq!(report.final_free_pages, 16);
    assert_eq!(
        report.stats.allocations, report.stats.releases,
        "every allocation is eventually released"
    );
}

#[test]
fn alloc_stress_ref_counted() {
    let config = AllocStressConfig {
        policy: AllocPolicy::RefCounted,
        cores: 4,
        pages: 16,
        ops_per_thread: 1_000,
        seed: 3,
    };
    let report = run_alloc_stress(&config).expect("stress");

    assert_eq!(report.policy, "ref-counted");
    assert_eq!(report.final_free_pages, 16);
    assert_eq!(report.stats.steals, 0, "no stealing on the global list");
}

#[test]
fn reports_serialize_to_json() {
    let report = run_alloc_stress(&AllocStressConfig {
        cores: 2,
        pages: 8,
        ops_per_thread: 100,
        ..AllocStressConfig::default()
    })
    .expect("stress");

    let json = serde_json::to_string(&report).expect("serialize");
    assert!(json.contains("\"final_free_pages\":8"));
}
