use indicatif::{ProgressBar, ProgressStyle};
use onesnap_core::{Phase, Progress};
use std::path::Path;
use std::time::Duration;

/// Terminal progress for create, restore and verify runs.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new_spinner()
        };
        Self { bar }
    }

    fn spinner(&self, message: &'static str) {
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
            self.bar.set_style(style);
        }
        self.bar.enable_steady_tick(Duration::from_millis(120));
        self.bar.set_message(message);
    }
}

impl Progress for BarProgress {
    fn phase(&self, phase: Phase) {
        match phase {
            Phase::Locking => self.spinner("Acquiring bucket lock..."),
            Phase::Walking => self.spinner("Scanning files..."),
            Phase::Finalizing => self.spinner("Finalizing..."),
            Phase::Idle | Phase::Transferring | Phase::Released => {}
        }
    }

    fn begin(&self, total: u64) {
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {pos:>7}/{len:7} [{elapsed_precise}] {wide_msg}")
        {
            self.bar.set_style(style.progress_chars("#>-"));
        }
        self.bar.set_length(total);
        self.bar.set_position(0);
    }

    fn advance(&self, path: &Path, _bytes: u64) {
        self.bar.inc(1);
        self.bar.set_message(path.display().to_string());
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
