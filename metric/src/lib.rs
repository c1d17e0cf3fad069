//! A small metric abstraction for the stream consumer.
//!
//! Requirements, in order of importance:
//!
//! 1. Minimal dependencies so any crate can be instrumented
//! 2. Metric names appear in-the-plain and can be grepped for
//! 3. Recording is cheap: an atomic add on a pre-resolved recorder
//! 4. Tests can assert on recorded values without an exporter
//!
//! A [`Registry`] stores [`Instrument`]s by name. A [`Metric<T>`]
//! maintains one observer `T` per set of [`Attributes`] and hands out
//! recorders via [`Metric::recorder`]. [`RawReporter`] buffers
//! observations for assertions in tests; production exporters plug in
//! by implementing [`Reporter`].

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Mutex;
use std::any::Any;
use std::borrow::Cow;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

mod counter;
mod gauge;

pub use counter::*;
pub use gauge::*;

/// A `Registry` stores a map of metric names to [`Instrument`]s.
#[derive(Debug, Default)]
pub struct Registry {
    /// Instruments indexed by metric name.
    ///
    /// A BTreeMap is used to provide a consistent ordering.
    instruments: Mutex<BTreeMap<&'static str, Box<dyn Instrument>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new [`Metric`] with the provided name and description,
    /// or return the existing one registered under that name.
    ///
    /// `&'static str` is intentional: the metric name should appear
    /// in-the-plain so it can be searched for within the codebase.
    ///
    /// # Panics
    ///
    /// If an instrument has already been registered with this name but a
    /// different type.
    pub fn register_metric<T>(&self, name: &'static str, description: &'static str) -> Metric<T>
    where
        T: MetricObserver,
    {
        let mut instruments = self.instruments.lock();
        match instruments.entry(name) {
            Entry::Occupied(o) => o
                .get()
                .as_any()
                .downcast_ref::<Metric<T>>()
                .expect("instrument already registered with a different type")
                .clone(),
            Entry::Vacant(v) => {
                let metric = Metric::<T>::new(name, description);
                v.insert(Box::new(metric.clone()));
                metric
            }
        }
    }

    /// Returns the already-registered instrument with the given name and
    /// type, if any.
    pub fn get_instrument<T: Instrument + Clone>(&self, name: &'static str) -> Option<T> {
        self.instruments
            .lock()
            .get(name)
            .and_then(|i| i.as_any().downcast_ref::<T>())
            .cloned()
    }

    /// Report the current observations of every registered instrument,
    /// in alphabetical order of name.
    pub fn report(&self, reporter: &mut dyn Reporter) {
        for instrument in self.instruments.lock().values() {
            instrument.report(reporter)
        }
    }
}

/// A set of key-value pairs associated with recorded observations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    pub fn iter(&self) -> impl Iterator<Item = (&&'static str, &Cow<'static, str>)> {
        self.0.iter()
    }
}

impl<'a, const N: usize> From<&'a [(&'static str, &'static str); N]> for Attributes {
    fn from(iterator: &'a [(&'static str, &'static str); N]) -> Self {
        Self(
            iterator
                .iter()
                .map(|(k, v)| (*k, Cow::Borrowed(*v)))
                .collect(),
        )
    }
}

impl<const N: usize> From<[(&'static str, String); N]> for Attributes {
    fn from(iterator: [(&'static str, String); N]) -> Self {
        Self(
            iterator
                .into_iter()
                .map(|(k, v)| (k, Cow::Owned(v)))
                .collect(),
        )
    }
}

/// A single recorded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    U64Counter(u64),
    U64Gauge(u64),
}

/// An object that knows how to write its observations to a [`Reporter`].
pub trait Instrument: std::fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    fn report(&self, reporter: &mut dyn Reporter);
}

/// Sink for observations; implemented by exporters and [`RawReporter`].
pub trait Reporter {
    fn start_metric(&mut self, metric_name: &'static str, description: &'static str);

    fn report_observation(&mut self, attributes: &Attributes, observation: Observation);

    fn finish_metric(&mut self);
}

/// An observer of a single series of a metric; e.g. [`U64Counter`].
pub trait MetricObserver:
    std::fmt::Debug + Default + Clone + Send + Sync + 'static
{
    fn observe(&self) -> Observation;
}

/// `Metric<T>` keeps one `T` per registered set of [`Attributes`] and
/// reports all of them under a single metric name.
#[derive(Debug)]
pub struct Metric<T> {
    shared: Arc<MetricShared<T>>,
}

#[derive(Debug)]
struct MetricShared<T> {
    name: &'static str,
    description: &'static str,
    observers: Mutex<BTreeMap<Attributes, T>>,
}

impl<T> Clone for Metric<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: MetricObserver> Metric<T> {
    fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            shared: Arc::new(MetricShared {
                name,
                description,
                observers: Mutex::new(Default::default()),
            }),
        }
    }

    /// Returns the recorder for the provided attribute set, registering
    /// it on first use. The returned value can be cached to avoid
    /// repeated attribute manipulation.
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> T {
        self.shared
            .observers
            .lock()
            .entry(attributes.into())
            .or_default()
            .clone()
    }

    /// Returns the observer for the given attributes, if one has been
    /// registered via [`Metric::recorder`].
    pub fn get_observer(&self, attributes: &Attributes) -> Option<T> {
        self.shared.observers.lock().get(attributes).cloned()
    }
}

impl<T: MetricObserver> Instrument for Metric<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn report(&self, reporter: &mut dyn Reporter) {
        reporter.start_metric(self.shared.name, self.shared.description);
        for (attributes, observer) in self.shared.observers.lock().iter() {
            reporter.report_observation(attributes, observer.observe())
        }
        reporter.finish_metric()
    }
}

/// All observations reported for one metric name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservationSet {
    pub metric_name: &'static str,
    pub description: &'static str,
    pub observations: Vec<(Attributes, Observation)>,
}

impl ObservationSet {
    /// Returns the observation for the given attributes, if any.
    pub fn observation(&self, attributes: impl Into<Attributes>) -> Option<&Observation> {
        let attributes = attributes.into();
        self.observations
            .iter()
            .find_map(|(a, o)| if a == &attributes { Some(o) } else { None })
    }
}

/// A [`Reporter`] that buffers observations, useful for testing.
#[derive(Debug, Default)]
pub struct RawReporter {
    completed: Vec<ObservationSet>,
    in_progress: Option<ObservationSet>,
}

impl RawReporter {
    /// Returns the observation set for the given metric name, if any.
    pub fn metric(&self, metric_name: &str) -> Option<&ObservationSet> {
        self.observations()
            .iter()
            .find(|s| s.metric_name == metric_name)
    }

    /// Returns a list of [`ObservationSet`] for all completed metrics.
    pub fn observations(&self) -> &Vec<ObservationSet> {
        assert!(self.in_progress.is_none(), "metric observation in progress");
        &self.completed
    }
}

impl Reporter for RawReporter {
    fn start_metric(&mut self, metric_name: &'static str, description: &'static str) {
        assert!(self.in_progress.is_none(), "metric observation in progress");
        self.in_progress = Some(ObservationSet {
            metric_name,
            description,
            observations: Default::default(),
        })
    }

    fn report_observation(&mut self, attributes: &Attributes, observation: Observation) {
        self.in_progress
            .as_mut()
            .expect("no metric observation in progress")
            .observations
            .push((attributes.clone(), observation))
    }

    fn finish_metric(&mut self) {
        let completed = self
            .in_progress
            .take()
            .expect("no metric observation in progress");
        self.completed.push(completed)
    }
}
