//! Magic numbers named in the core's operations. Kept here rather than
//! buried in the modules that use them so the whole ambient budget is
//! visible in one place, the way `shuttle-common` centralizes shared
//! constants.

use std::time::Duration;

/// Expiry for a signed GET issued to a device for an update download.
pub const UPDATE_DOWNLOAD_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Expiry for the signed GET/DELETE issued over a staged `GenerateImage` upload.
pub const IMAGE_GENERATION_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// An upload intent left in `processing` without a heartbeat refresh for
/// this long is eligible for reaping by an external janitor.
pub const UPLOAD_INTENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// The heartbeat that keeps an in-flight `CompleteUpload` alive fires at
/// half the idle timeout.
pub fn upload_heartbeat_interval() -> Duration {
    UPLOAD_INTENT_IDLE_TIMEOUT / 2
}

/// Page size used when scanning for newly-applicable deployments.
pub const DEPLOYMENT_SCAN_PAGE_SIZE: i64 = 100;

/// Page size used when expanding a group or "all devices" target into an
/// explicit device list at deployment-creation time.
pub const DEVICE_SEARCH_PAGE_SIZE: i64 = 100;

/// Suffix appended to a staged (not yet verified) upload's object key.
pub const STAGED_UPLOAD_SUFFIX: &str = ".tmp";

/// Object key prefix artifacts are stored under.
pub const ARTIFACT_KEY_PREFIX: &str = "images";
