use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};

#[derive(Clone, Debug)]
pub struct EvaluationMetrics {
    evaluations: Family<ResultLabels, Counter>,
    duration: Histogram,
    in_flight: Gauge,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ResultLabels {
    result: &'static str,
}

impl EvaluationMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let evaluations = Family::<ResultLabels, Counter>::default();
        reg.register(
            "evaluations",
            "Total number of policy evaluation passes, by result",
            evaluations.clone(),
        );

        let duration = Histogram::new([0.01, 0.1, 1.0, 10.0, 60.0]);
        reg.register_with_unit(
            "evaluation_duration",
            "Histogram of policy evaluation pass durations",
            Unit::Seconds,
            duration.clone(),
        );

        let in_flight = Gauge::default();
        reg.register(
            "evaluations_in_flight",
            "Number of policy evaluation passes in flight",
            in_flight.clone(),
        );

        Self {
            evaluations,
            duration,
            in_flight,
        }
    }

    pub(crate) fn started(&self) {
        self.in_flight.inc();
    }

    pub(crate) fn finished(&self, result: &'static str, elapsed: std::time::Duration) {
        self.in_flight.dec();
        self.duration.observe(elapsed.as_secs_f64());
        self.evaluations
            .get_or_create(&ResultLabels { result })
            .inc();
    }

    pub(crate) fn aborted(&self) {
        self.in_flight.dec();
        self.evaluations
            .get_or_create(&ResultLabels { result: "aborted" })
            .inc();
    }
}

impl Default for EvaluationMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}
