//! Prometheus metrics.
//!
//! Per-block allocator metrics are labelled with the block (`clusterCIDR`)
//! and the owning pool (`clusterCIDRName`).

use crate::registry::Pool;
use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
    exponential_buckets,
};
use tracing::debug;

const SUBSYSTEM: &str = "node_ipam_controller";
const POOL_LABELS: [&str; 2] = ["clusterCIDR", "clusterCIDRName"];

/// Controller metrics and the registry they are exposed from
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    allocations: IntCounterVec,
    releases: IntCounterVec,
    max_cidrs: IntGaugeVec,
    usage_cidrs: GaugeVec,
    allocation_tries: HistogramVec,
    not_available: IntCounterVec,
    sync_failures: IntCounterVec,
}

impl Metrics {
    /// Creates and registers every metric.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if a metric is malformed or registered twice.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let allocations = IntCounterVec::new(
            Opts::new("multicidrset_cidrs_allocations_total", "Counter measuring total number of CIDR allocations.")
                .subsystem(SUBSYSTEM),
            &POOL_LABELS,
        )?;
        let releases = IntCounterVec::new(
            Opts::new("multicidrset_cidrs_releases_total", "Counter measuring total number of CIDR releases.")
                .subsystem(SUBSYSTEM),
            &POOL_LABELS,
        )?;
        let max_cidrs = IntGaugeVec::new(
            Opts::new("multicidrset_max_cidrs", "Maximum number of CIDRs that can be allocated.")
                .subsystem(SUBSYSTEM),
            &POOL_LABELS,
        )?;
        let usage_cidrs = GaugeVec::new(
            Opts::new("multicidrset_usage_cidrs", "Gauge measuring percentage of allocated CIDRs.")
                .subsystem(SUBSYSTEM),
            &POOL_LABELS,
        )?;
        let allocation_tries = HistogramVec::new(
            HistogramOpts::new(
                "multicidrset_allocation_tries_per_request",
                "Histogram measuring CIDR allocation tries per request.",
            )
            .subsystem(SUBSYSTEM)
            .buckets(exponential_buckets(1.0, 5.0, 5)?),
            &POOL_LABELS,
        )?;
        let not_available = IntCounterVec::new(
            Opts::new("cidr_not_available_total", "Node syncs that found no ClusterCIDR with free space.")
                .subsystem(SUBSYSTEM),
            &["reason"],
        )?;
        let sync_failures = IntCounterVec::new(
            Opts::new("sync_failures_total", "Reconciliations given up on after exhausting their retries.")
                .subsystem(SUBSYSTEM),
            &["controller"],
        )?;

        registry.register(Box::new(allocations.clone()))?;
        registry.register(Box::new(releases.clone()))?;
        registry.register(Box::new(max_cidrs.clone()))?;
        registry.register(Box::new(usage_cidrs.clone()))?;
        registry.register(Box::new(allocation_tries.clone()))?;
        registry.register(Box::new(not_available.clone()))?;
        registry.register(Box::new(sync_failures.clone()))?;

        Ok(Self {
            registry,
            allocations,
            releases,
            max_cidrs,
            usage_cidrs,
            allocation_tries,
            not_available,
            sync_failures,
        })
    }

    /// Publishes capacity and usage of a newly registered pool
    pub fn pool_registered(&self, pool: &Pool) {
        for family in pool.families() {
            let block = family.set.block().to_string();
            let labels = [block.as_str(), pool.name()];
            self.max_cidrs
                .with_label_values(&labels)
                .set(i64::try_from(family.set.max_count()).unwrap_or(i64::MAX));
        }
        self.update_usage(pool);
    }

    /// Drops every series of a removed pool
    pub fn pool_removed(&self, pool: &Pool) {
        for family in pool.families() {
            let block = family.set.block().to_string();
            let labels = [block.as_str(), pool.name()];
            for result in [
                self.allocations.remove_label_values(&labels),
                self.releases.remove_label_values(&labels),
                self.max_cidrs.remove_label_values(&labels),
                self.usage_cidrs.remove_label_values(&labels),
                self.allocation_tries.remove_label_values(&labels),
            ] {
                if let Err(e) = result {
                    debug!("No {} series for ClusterCIDR {}: {}", block, pool.name(), e);
                }
            }
        }
    }

    /// Counts one sub-block handed out per family
    pub fn record_allocation(&self, pool: &Pool, tries: u32) {
        for family in pool.families() {
            let block = family.set.block().to_string();
            let labels = [block.as_str(), pool.name()];
            self.allocations.with_label_values(&labels).inc();
            self.allocation_tries
                .with_label_values(&labels)
                .observe(f64::from(tries));
        }
        self.update_usage(pool);
    }

    /// Counts one sub-block taken back per family
    pub fn record_release(&self, pool: &Pool) {
        for family in pool.families() {
            let block = family.set.block().to_string();
            self.releases
                .with_label_values(&[block.as_str(), pool.name()])
                .inc();
        }
        self.update_usage(pool);
    }

    /// Refreshes usage after ranges nodes already carried were marked taken
    pub fn record_adoption(&self, pool: &Pool) {
        self.update_usage(pool);
    }

    /// Counts a node left without ranges
    pub fn record_not_available(&self, reason: &str) {
        self.not_available.with_label_values(&[reason]).inc();
    }

    /// Counts an object given up on after its last retry
    pub fn record_sync_failure(&self, controller: &str) {
        self.sync_failures.with_label_values(&[controller]).inc();
    }

    /// Renders every metric in the text exposition format
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if encoding fails.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }

    fn update_usage(&self, pool: &Pool) {
        for family in pool.families() {
            let block = family.set.block().to_string();
            self.usage_cidrs
                .with_label_values(&[block.as_str(), pool.name()])
                .set(family.set.usage().ratio());
        }
    }
}
