//! Per-shader compile statistics.

use std::fmt::Write;
use std::time::Duration;

use serde::Serialize;
use shadegraph_core::EntryPoint;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    /// Instructions in the whole program, header and terminator included.
    pub num_svm_nodes: usize,
    pub peak_stack_usage: u32,
    pub time_finalize: Duration,
    pub time_generate_surface: Duration,
    pub time_generate_bump: Duration,
    pub time_generate_volume: Duration,
    pub time_generate_displacement: Duration,
    pub time_total: Duration,
    pub failed: Vec<EntryPoint>,
}

impl Summary {
    pub(crate) fn record_time(&mut self, entry: EntryPoint, elapsed: Duration) {
        let slot = match entry {
            EntryPoint::Surface => &mut self.time_generate_surface,
            EntryPoint::Bump => &mut self.time_generate_bump,
            EntryPoint::Volume => &mut self.time_generate_volume,
            EntryPoint::Displacement => &mut self.time_generate_displacement,
        };
        *slot += elapsed;
    }

    pub fn time_generate(&self) -> Duration {
        self.time_generate_surface
            + self.time_generate_bump
            + self.time_generate_volume
            + self.time_generate_displacement
    }

    /// Multi-line human-readable report.
    pub fn full_report(&self) -> String {
        let mut report = String::new();
        let secs = |d: Duration| d.as_secs_f64();
        let _ = writeln!(report, "Number of SVM nodes: {}", self.num_svm_nodes);
        let _ = writeln!(report, "Peak stack usage:    {}", self.peak_stack_usage);
        let _ = writeln!(report);
        let _ = writeln!(report, "Time (in seconds):");
        let _ = writeln!(report, "Finalize:            {:.6}", secs(self.time_finalize));
        let _ = writeln!(report, "  Surface:           {:.6}", secs(self.time_generate_surface));
        let _ = writeln!(report, "  Bump:              {:.6}", secs(self.time_generate_bump));
        let _ = writeln!(report, "  Volume:            {:.6}", secs(self.time_generate_volume));
        let _ = writeln!(report, "  Displacement:      {:.6}", secs(self.time_generate_displacement));
        let _ = writeln!(report, "Generate:            {:.6}", secs(self.time_generate()));
        let _ = writeln!(report, "Total:               {:.6}", secs(self.time_total));
        if !self.failed.is_empty() {
            let names: Vec<_> = self.failed.iter().map(|e| e.name()).collect();
            let _ = writeln!(report, "Failed entry points: {}", names.join(", "));
        }
        report
    }
}
