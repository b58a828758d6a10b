use wifitop::config::{DirectionConfig, EngineConfig};

const MB: u64 = 1_000_000;

/// The knobs editable from the settings view, layered over the engine config
/// the binary was started with.
#[derive(Debug, Clone)]
pub struct Settings {
    pub ping_count: usize,
    pub download_size_mb: u64,
    pub upload_size_mb: u64,
    base: EngineConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(EngineConfig::default())
    }
}

impl Settings {
    pub fn from_config(base: EngineConfig) -> Self {
        Self {
            ping_count: base.latency.probe_count,
            download_size_mb: first_block_mb(&base.download),
            upload_size_mb: first_block_mb(&base.upload),
            base,
        }
    }

    /// Engine config for the next run. A schedule edited in the settings view
    /// grows from the chosen first block as 1x, 1.5x and 2x; an untouched one
    /// is passed through as configured.
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = self.base.clone();
        config.latency.probe_count = self.ping_count;
        if self.download_size_mb != first_block_mb(&self.base.download) {
            config.download = config
                .download
                .with_scaled_blocks(self.download_size_mb * MB, block_timeout_ms(self.download_size_mb));
        }
        if self.upload_size_mb != first_block_mb(&self.base.upload) {
            config.upload = config
                .upload
                .with_scaled_blocks(self.upload_size_mb * MB, block_timeout_ms(self.upload_size_mb));
        }
        config
    }
}

fn first_block_mb(direction: &DirectionConfig) -> u64 {
    direction.blocks.first().map(|b| b.bytes / MB).unwrap_or(50).max(1)
}

/// Enough for the first block at roughly 15 Mbps, kept within 15s to 90s.
fn block_timeout_ms(first_mb: u64) -> u64 {
    (first_mb * 8 * 1_000 / 15).clamp(15_000, 90_000)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsField {
    PingCount,
    DownloadSize,
    UploadSize,
}

impl SettingsField {
    pub fn next(self) -> Self {
        match self {
            SettingsField::PingCount => SettingsField::DownloadSize,
            SettingsField::DownloadSize => SettingsField::UploadSize,
            SettingsField::UploadSize => SettingsField::PingCount,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            SettingsField::PingCount => SettingsField::UploadSize,
            SettingsField::DownloadSize => SettingsField::PingCount,
            SettingsField::UploadSize => SettingsField::DownloadSize,
        }
    }
}
