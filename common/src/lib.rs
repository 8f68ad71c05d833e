pub mod app;
pub mod compose;
pub mod container;
pub mod deployment;
pub mod event;
pub mod host;
pub mod log;

use uuid::Uuid;

pub use log::Item as LogItem;

pub type AppId = Uuid;
pub type DeploymentId = Uuid;
pub type HostId = Uuid;

/// Name of the shared overlay network every deployed container joins.
pub const OVERLAY_NETWORK: &str = "paasdeploy";

/// Name of the contract file read from the root of an app's working directory.
pub const APP_CONTRACT_FILE: &str = "paasdeploy.json";

/// Length a commit sha is shortened to when used as an image tag.
pub const IMAGE_TAG_SHA_LEN: usize = 12;

/// Build the image tag for an app at a given commit.
pub fn image_tag(registry_prefix: &str, app_name: &str, commit_sha: &str) -> String {
    let short = &commit_sha[..commit_sha.len().min(IMAGE_TAG_SHA_LEN)];
    format!("{registry_prefix}/{app_name}:{short}")
}

#[cfg(test)]
mod tests {
    use super::image_tag;

    #[test]
    fn image_tag_shortens_sha() {
        assert_eq!(
            image_tag("registry.local", "api", "abc123abc123def456"),
            "registry.local/api:abc123abc123"
        );
        assert_eq!(image_tag("r", "web", "abc"), "r/web:abc");
    }
}
