use crate::SharedIndex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let mut policies_encoder = encoder.encode_descriptor(
            "policy_index_size",
            "The number of configuration policies in index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, count) in this.policies_by_ns() {
            let labels = [("namespace", ns)];
            let policies = ConstGauge::new(count as u32);
            let policies_encoder = policies_encoder.encode_family(&labels)?;
            policies.encode(policies_encoder)?;
        }

        let related = ConstGauge::new(this.related_len() as u32);
        related.encode(encoder.encode_descriptor(
            "related_object_index_size",
            "The number of related objects linked to policies",
            None,
            MetricType::Gauge,
        )?)?;

        let namespaces = ConstGauge::new(this.namespaces_len() as u32);
        namespaces.encode(encoder.encode_descriptor(
            "namespace_index_size",
            "The number of namespaces in index",
            None,
            MetricType::Gauge,
        )?)?;

        let kinds = ConstGauge::new(this.kinds_len() as u32);
        kinds.encode(encoder.encode_descriptor(
            "watched_kinds",
            "The number of object kinds watched on behalf of policies",
            None,
            MetricType::Gauge,
        )?)?;

        Ok(())
    }
}
