//! Prometheus text exposition format.

use crate::gauges::RunnerGauges;

/// Render the runner gauges into Prometheus text format.
pub fn render_prometheus(gauges: &RunnerGauges) -> String {
    let mut out = String::new();

    out.push_str("# HELP kiln_runners_total Total number of runner instances.\n");
    out.push_str("# TYPE kiln_runners_total gauge\n");
    out.push_str(&format!("kiln_runners_total {}\n", gauges.total()));

    out.push_str("# HELP kiln_runners_starting Runner instances in starting state.\n");
    out.push_str("# TYPE kiln_runners_starting gauge\n");
    out.push_str(&format!("kiln_runners_starting {}\n", gauges.starting()));

    out.push_str("# HELP kiln_runners_idle Runner instances in idle state.\n");
    out.push_str("# TYPE kiln_runners_idle gauge\n");
    out.push_str(&format!("kiln_runners_idle {}\n", gauges.idle()));

    out.push_str("# HELP kiln_runners_active Runner instances executing a job.\n");
    out.push_str("# TYPE kiln_runners_active gauge\n");
    out.push_str(&format!("kiln_runners_active {}\n", gauges.active()));

    out.push_str("# HELP kiln_runners_preparing Instances running for image preparation.\n");
    out.push_str("# TYPE kiln_runners_preparing gauge\n");
    out.push_str(&format!("kiln_runners_preparing {}\n", gauges.preparing()));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::RunnerDisposition;

    #[test]
    fn render_zeroed_gauges() {
        let output = render_prometheus(&RunnerGauges::new());
        assert!(output.contains("# HELP kiln_runners_total"));
        assert!(output.contains("# TYPE kiln_runners_total gauge\n"));
        assert!(output.contains("kiln_runners_total 0\n"));
        assert!(output.contains("kiln_runners_preparing 0\n"));
    }

    #[test]
    fn render_reflects_the_current_disposition() {
        let gauges = RunnerGauges::new();
        gauges.record_disposition(&RunnerDisposition {
            preparing: 0,
            starting: 1,
            idle: 2,
            active: 1,
            stopped: 0,
        });
        let _guard = gauges.begin_preparing();

        let output = render_prometheus(&gauges);
        assert!(output.contains("kiln_runners_total 4\n"));
        assert!(output.contains("kiln_runners_starting 1\n"));
        assert!(output.contains("kiln_runners_idle 2\n"));
        assert!(output.contains("kiln_runners_active 1\n"));
        assert!(output.contains("kiln_runners_preparing 1\n"));
    }

    #[test]
    fn every_metric_line_has_help_and_type() {
        let output = render_prometheus(&RunnerGauges::new());
        for line in output.lines() {
            if line.starts_with('#') {
                continue;
            }
            let name = line.split(' ').next().unwrap();
            assert!(output.contains(&format!("# HELP {name} ")), "missing HELP for {name}");
            assert!(output.contains(&format!("# TYPE {name} gauge")), "missing TYPE for {name}");
        }
    }
}
