use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg}\n[{elapsed_precise}] [{bar:40.green/white}] {bytes}/{total_bytes} @ {bytes_per_sec}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// One progress bar per URL, created lazily on the first progress report.
#[derive(Clone)]
pub struct ProgressManager {
    multi: MultiProgress,
    bars: Arc<Mutex<HashMap<String, ProgressBar>>>,
    disabled: bool,
}

impl ProgressManager {
    pub fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            disabled: false,
        }
    }

    pub fn new_disabled(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            disabled: true,
        }
    }

    pub fn update(&self, url: &str, received: u64, expected: Option<u64>) {
        if self.disabled {
            return;
        }
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };

        let bar = bars.entry(url.to_string()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(0));
            bar.set_style(download_style());
            bar.set_message(format!("Downloading {url}"));
            bar.enable_steady_tick(Duration::from_millis(500));
            bar
        });
        if let Some(total) = expected {
            bar.set_length(total);
        }
        bar.set_position(received);
    }

    pub fn finish(&self, url: &str, message: impl Into<String>) {
        if self.disabled {
            return;
        }
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        if let Some(bar) = bars.remove(url) {
            bar.finish_with_message(message.into());
        }
    }

    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}
