//! Prometheus text exposition format.
//!
//! Renders every registered family with a `metricgrid_` prefix for
//! scraping by a Prometheus server or compatible agent.

use std::fmt::Write;

use crate::registry::{MetricKind, MetricsRegistry, Series};

const PREFIX: &str = "metricgrid_";

fn render_labels(labels: &[(String, String)], extra: Option<(&str, String)>) -> String {
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape(v)))
        .collect();
    if let Some((k, v)) = extra {
        parts.push(format!("{k}=\"{v}\""));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", parts.join(","))
    }
}

fn escape(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn format_bound(bound: f64) -> String {
    if bound.is_infinite() {
        "+Inf".to_string()
    } else {
        format!("{bound}")
    }
}

/// Render the registry into Prometheus text format.
pub fn render_prometheus(registry: &MetricsRegistry) -> String {
    let mut out = String::new();
    registry.with_families(|families| {
        for (name, family) in families {
            let full = format!("{PREFIX}{name}");
            let kind = match family.kind {
                MetricKind::Counter => "counter",
                MetricKind::Gauge => "gauge",
                MetricKind::Histogram => "histogram",
            };
            let _ = writeln!(out, "# HELP {full} {}", family.help);
            let _ = writeln!(out, "# TYPE {full} {kind}");

            for (labels, series) in &family.series {
                match series {
                    Series::Counter(c) => {
                        let _ = writeln!(out, "{full}{} {}", render_labels(labels, None), c.get());
                    }
                    Series::Gauge(g) => {
                        let _ = writeln!(out, "{full}{} {}", render_labels(labels, None), g.get());
                    }
                    Series::Histogram(h) => {
                        for (bound, count) in h.cumulative() {
                            let l = render_labels(labels, Some(("le", format_bound(bound))));
                            let _ = writeln!(out, "{full}_bucket{l} {count}");
                        }
                        let l = render_labels(labels, None);
                        let _ = writeln!(out, "{full}_sum{l} {:.3}", h.sum());
                        let _ = writeln!(out, "{full}_count{l} {}", h.count());
                    }
                }
            }
        }
    });
    out
}
