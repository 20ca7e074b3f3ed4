use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// Defines the application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format!(
        "{}-{}{}",
        env!("IMAGE_VERSION"),
        BUILD_INFO.commit_sha1.unwrap_or("unknown"),
        if BUILD_INFO.git_dirty { "-dirty" } else { "" }
    )
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_starts_with_image_tag() {
        assert!(VERSION.starts_with(env!("IMAGE_VERSION")));
    }
}
