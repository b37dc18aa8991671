// Instruments - the metric sinks collectors publish into
//
// Unlabeled totals are plain `prometheus::Gauge`s. Labeled values go
// through `LabeledGauge`, which forgets label combinations that vanish
// from the database. Age distributions use `SnapshotHistogram`, which is
// rebuilt from scratch on every refresh.

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::warn;

/// Bucket boundaries for age histograms: 1h, 1d, 1w, 30d, 90d
pub const AGE_BUCKETS: [f64; 5] = [3600.0, 86400.0, 604800.0, 2592000.0, 7776000.0];

/// Label values paired with the gauge value to publish for them
pub type LabeledValues = Vec<(Vec<String>, f64)>;

/// Creates and registers an unlabeled gauge
pub fn register_gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge, prometheus::Error> {
    let gauge = Gauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// A gauge partitioned by a fixed set of label names
///
/// Each `replace` call describes the complete current state: combinations
/// it does not mention are removed from the exposition. New values are
/// written before stale ones are removed, so a scrape never sees the
/// instrument empty in between.
pub struct LabeledGauge {
    vec: GaugeVec,
    published: Mutex<HashSet<Vec<String>>>,
}

impl LabeledGauge {
    pub fn register(
        registry: &Registry,
        name: &str,
        help: &str,
        labels: &[&str],
    ) -> Result<Self, prometheus::Error> {
        let vec = GaugeVec::new(Opts::new(name, help), labels)?;
        registry.register(Box::new(vec.clone()))?;
        Ok(LabeledGauge {
            vec,
            published: Mutex::new(HashSet::new()),
        })
    }

    /// Publishes `values` as the full set of label combinations
    ///
    /// Entries sharing the same label values are summed, e.g. a NULL column
    /// rendered as "unknown" next to a real "unknown".
    pub fn replace(&self, values: LabeledValues) {
        let mut published = self
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut merged: HashMap<Vec<String>, f64> = HashMap::with_capacity(values.len());
        for (labels, value) in values {
            *merged.entry(labels).or_default() += value;
        }

        let mut current = HashSet::with_capacity(merged.len());
        for (labels, value) in merged {
            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            match self.vec.get_metric_with_label_values(&refs) {
                Ok(gauge) => {
                    gauge.set(value);
                    current.insert(labels);
                }
                Err(e) => warn!("Skipping label set {:?}: {}", labels, e),
            }
        }

        for stale in published.difference(&current) {
            let refs: Vec<&str> = stale.iter().map(String::as_str).collect();
            // Removing an absent child is not an error worth reporting
            let _ = self.vec.remove_label_values(&refs);
        }

        *published = current;
    }
}

#[cfg(test)]
impl LabeledGauge {
    /// Current value for a label combination, if it is published
    pub fn get(&self, labels: &[&str]) -> Option<f64> {
        let key: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        let published = self
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !published.contains(&key) {
            return None;
        }
        self.vec
            .get_metric_with_label_values(labels)
            .ok()
            .map(|gauge| gauge.get())
    }

    /// Number of label combinations currently published
    pub fn len(&self) -> usize {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A histogram describing the current population only
///
/// Scrapes read whichever histogram was swapped in last; `replace` builds
/// a new one from the given observations and swaps it in whole.
#[derive(Clone)]
pub struct SnapshotHistogram {
    inner: Arc<SnapshotInner>,
}

struct SnapshotInner {
    opts: HistogramOpts,
    // Only used to describe the metric to the registry
    template: Histogram,
    current: RwLock<Histogram>,
}

impl SnapshotHistogram {
    pub fn register(
        registry: &Registry,
        name: &str,
        help: &str,
        buckets: &[f64],
    ) -> Result<Self, prometheus::Error> {
        let opts = HistogramOpts::new(name, help).buckets(buckets.to_vec());
        let template = Histogram::with_opts(opts.clone())?;
        let current = Histogram::with_opts(opts.clone())?;

        let histogram = SnapshotHistogram {
            inner: Arc::new(SnapshotInner {
                opts,
                template,
                current: RwLock::new(current),
            }),
        };
        registry.register(Box::new(histogram.clone()))?;
        Ok(histogram)
    }

    /// Replaces the distribution with `observations`
    pub fn replace<I>(&self, observations: I) -> Result<(), prometheus::Error>
    where
        I: IntoIterator<Item = f64>,
    {
        let fresh = Histogram::with_opts(self.inner.opts.clone())?;
        for value in observations {
            fresh.observe(value);
        }

        *self
            .inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }
}

#[cfg(test)]
impl SnapshotHistogram {
    /// Number of observations in the current distribution
    pub fn sample_count(&self) -> u64 {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get_sample_count()
    }
}

impl Collector for SnapshotHistogram {
    fn desc(&self) -> Vec<&Desc> {
        self.inner.template.desc()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .collect()
    }
}
