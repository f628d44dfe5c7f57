//! Upload progress for `put`
//!
//! A bar over the files of one transfer, drawn on stderr. Hidden when stderr
//! is not a terminal so scripted sessions and tests stay quiet.

use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::time::Instant;

pub struct UploadProgress {
    bar: ProgressBar,
    start_time: Instant,
    bytes: u64,
}

impl UploadProgress {
    pub fn new(files: u64) -> Self {
        let bar = if std::io::stderr().is_terminal() {
            ProgressBar::new(files)
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        Self {
            bar,
            start_time: Instant::now(),
            bytes: 0,
        }
    }

    /// A block for `name` is about to go out.
    pub fn sending(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    pub fn sent(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.bar.inc(1);
    }

    /// Print a line above the bar without tearing it.
    pub fn note(&self, msg: &str) {
        self.bar.suspend(|| eprintln!("{msg}"));
    }

    pub fn finish(&self) {
        let elapsed = self.start_time.elapsed();
        self.bar.finish_with_message(format!(
            "{} files ({:.1} KB) in {:.1}s",
            self.bar.position(),
            self.bytes as f64 / 1024.0,
            elapsed.as_secs_f64()
        ));
    }

    pub fn abandon(&self, msg: &str) {
        self.bar.abandon_with_message(msg.to_string());
    }
}
