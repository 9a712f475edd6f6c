use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use tokio::{sync::Mutex, time::Instant};

use crate::utils::to_human_readable;

/// Exponential Moving Average (EMA) smoothing factor
/// Higher values = more responsive to changes, lower values = smoother
const EMA_ALPHA: f64 = 0.3;

/// Progress of one download, shared by the writers and the progress line.
#[derive(Debug)]
pub struct Counter {
    pub total_downloaded: AtomicU64,
    /// Expected size of the file, negative when unknown.
    pub file_length: AtomicI64,
    pub download_rate: AtomicU64,

    window_downloaded: AtomicU64,
    last_update: Mutex<Instant>,
    ema_download: Mutex<f64>,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            total_downloaded: AtomicU64::new(0),
            file_length: AtomicI64::new(-1),
            download_rate: AtomicU64::new(0),
            window_downloaded: AtomicU64::new(0),
            last_update: Mutex::new(Instant::now()),
            ema_download: Mutex::new(0.0),
        }
    }
}

impl Counter {
    pub fn new(file_length: i64) -> Self {
        let counter = Self::default();
        counter.file_length.store(file_length, Ordering::Relaxed);
        counter
    }

    pub fn record_download(&self, bytes: u64) {
        self.total_downloaded.fetch_add(bytes, Ordering::Relaxed);
        self.window_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Forget everything written so far, after the piece size changed.
    pub fn reset(&self) {
        self.total_downloaded.store(0, Ordering::Relaxed);
        self.window_downloaded.store(0, Ordering::Relaxed);
    }

    /// Update the rate with EMA smoothing
    pub async fn update_rates(&self) {
        let now = Instant::now();
        let mut last_update = self.last_update.lock().await;
        let elapsed = now.duration_since(*last_update).as_secs_f64();

        if elapsed < 0.001 {
            return;
        }

        let downloaded = self.window_downloaded.swap(0, Ordering::Relaxed);
        let rate = downloaded as f64 / elapsed;

        let mut ema = self.ema_download.lock().await;
        *ema = if *ema == 0.0 {
            rate
        } else {
            EMA_ALPHA * rate + (1.0 - EMA_ALPHA) * *ema
        };

        self.download_rate.store(*ema as u64, Ordering::Relaxed);
        *last_update = now;
    }

    /// `{done}/{total} {rate}/s`
    pub fn progress_line(&self) -> String {
        let done = self.total_downloaded.load(Ordering::Relaxed);
        let total = self.file_length.load(Ordering::Relaxed);
        let rate = self.download_rate.load(Ordering::Relaxed);

        let total = if total < 0 {
            "?".to_owned()
        } else {
            to_human_readable(total as u64)
        };

        format!(
            "{}/{} {}/s",
            to_human_readable(done),
            total,
            to_human_readable(rate)
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use super::*;

    #[tokio::test]
    async fn test_counter_rates() {
        let counter = Counter::new(10_000);

        counter.record_download(1000);
        time::sleep(Duration::from_millis(100)).await;
        counter.update_rates().await;

        // ≈10,000 ±10%
        let r1 = counter.download_rate.load(Ordering::Relaxed);
        assert!((9000..=11000).contains(&r1));

        // double the data, the EMA moves 30% of the way
        counter.record_download(2000);
        time::sleep(Duration::from_millis(100)).await;
        counter.update_rates().await;

        let r2 = counter.download_rate.load(Ordering::Relaxed);
        assert!((11700..=14300).contains(&r2));
        assert_eq!(counter.total_downloaded.load(Ordering::Relaxed), 3000);
    }

    #[test]
    fn progress() {
        let counter = Counter::new(-1);
        counter.record_download(500);
        assert_eq!(counter.progress_line(), "500 B/? 0 B/s");

        counter.file_length.store(2_000_000, Ordering::Relaxed);
        counter.reset();
        counter.record_download(1_500_000);
        assert_eq!(counter.progress_line(), "1.50 MB/2.00 MB 0 B/s");
    }
}
