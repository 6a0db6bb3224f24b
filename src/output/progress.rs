use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use super::styling::{bright, bright_green, bright_red, bright_yellow};

/// Progress tracking for the sync, analysis and report phases
pub struct PhaseProgress {
    pb: ProgressBar,
    label: &'static str,
}

impl PhaseProgress {
    pub fn start_sync() -> Self {
        eprintln!("{}  {}", bright("⚙️"), bright("Phases").underlined());
        Self::start("Phase 1/3: Syncing build cache")
    }

    pub fn finish_sync_start_analysis(self, new_builds: Option<usize>) -> Self {
        let done = match new_builds {
            Some(count) => format!("Phase 1/3: Synced build cache, {count} new or updated ✓"),
            None => "Phase 1/3: Build cache is fresh, fetch skipped ✓".to_string(),
        };
        self.pb.finish_with_message(bright_green(done).to_string());
        Self::start("Phase 2/3: Analyzing build stability")
    }

    pub fn finish_analysis_start_report(self) -> Self {
        self.pb
            .finish_with_message(bright_green("Phase 2/3: Analysis complete ✓").to_string());
        Self::start("Phase 3/3: Writing report")
    }

    pub fn finish_report(self) {
        self.pb
            .finish_with_message(bright_green("Phase 3/3: Report written ✓").to_string());
        eprintln!("\n");
    }

    /// Marks the running phase as failed and leaves the line on screen.
    pub fn fail(self) {
        self.pb
            .abandon_with_message(bright_red(format!("{} ✗", self.label)).to_string());
    }

    fn start(label: &'static str) -> Self {
        Self {
            pb: create_spinner(bright_yellow(label).to_string()),
            label,
        }
    }
}

fn create_spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("  {msg} {spinner}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}
