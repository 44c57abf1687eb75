use std::io::{self, Write};

/// Per-epoch stderr progress bar with a trailing metrics message.
pub struct ProgressBar {
    total: usize,
    current: usize,
    prefix: String,
    message: String,
    width: usize,
    visible: bool,
}

impl ProgressBar {
    #[must_use]
    pub fn new(total: usize, prefix: &str) -> Self {
        Self {
            total,
            current: 0,
            prefix: prefix.to_string(),
            message: String::new(),
            width: 30,
            visible: true,
        }
    }

    /// A bar that tracks progress but never draws.
    #[must_use]
    pub fn hidden(total: usize) -> Self {
        let mut bar = Self::new(total, "");
        bar.visible = false;
        bar
    }

    pub fn position(&self) -> usize {
        self.current
    }

    /// Advance by one step, replacing the metrics shown after the bar.
    pub fn inc_with(&mut self, message: impl Into<String>) {
        self.message = message.into();
        self.current += 1;
        self.render();
    }

    pub fn inc(&mut self) {
        self.current += 1;
        self.render();
    }

    /// End the line so later output starts fresh.
    pub fn finish(&mut self) {
        if self.visible {
            eprintln!();
            let _ = io::stderr().flush();
            self.visible = false;
        }
    }

    fn render(&self) {
        if !self.visible {
            return;
        }
        let (percent, filled) = if self.total > 0 {
            (
                self.current * 100 / self.total,
                (self.current * self.width / self.total).min(self.width),
            )
        } else {
            (0, 0)
        };
        let bar: String = "█".repeat(filled) + &"░".repeat(self.width - filled);
        eprint!(
            "\r{} [{}] {:3}% ({}/{}) {}",
            self.prefix, bar, percent, self.current, self.total, self.message
        );
        let _ = io::stderr().flush();
    }
}

impl Drop for ProgressBar {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_bar_still_counts() {
        let mut bar = ProgressBar::hidden(3);
        assert!(!bar.visible);
        assert_eq!(bar.total, 3);
        bar.inc();
        bar.inc_with("loss 0.1");
        assert_eq!(bar.position(), 2);
    }
}
