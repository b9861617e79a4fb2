//! Typed configuration, constructed programmatically rather than parsed
//! from a CLI (CLI and config-file loading are out of scope per spec §1;
//! the core only needs the values, not the loading mechanism).

use std::time::Duration;

use fleet_common::constants;

#[derive(Clone, Debug)]
pub struct CoreConfig {
    pub update_download_expiry: Duration,
    pub image_generation_expiry: Duration,
    pub upload_intent_idle_timeout: Duration,
    pub deployment_scan_page_size: i64,
    pub device_search_page_size: i64,
    pub ingestion_pipe_buffer_bytes: usize,
}

impl CoreConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        self.upload_intent_idle_timeout / 2
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            update_download_expiry: constants::UPDATE_DOWNLOAD_EXPIRY,
            image_generation_expiry: constants::IMAGE_GENERATION_EXPIRY,
            upload_intent_idle_timeout: constants::UPLOAD_INTENT_IDLE_TIMEOUT,
            deployment_scan_page_size: constants::DEPLOYMENT_SCAN_PAGE_SIZE,
            device_search_page_size: constants::DEVICE_SEARCH_PAGE_SIZE,
            ingestion_pipe_buffer_bytes: 64 * 1024,
        }
    }
}
