//! git metadata captured by the build script

pub(crate) struct BuildInfo {
    pub commit_sha1: Option<&'static str>,
    pub git_dirty: bool,
}

pub(crate) static BUILD_INFO: BuildInfo = BuildInfo {
    commit_sha1: option_env!("VERGEN_GIT_SHA"),
    git_dirty: is_true(option_env!("VERGEN_GIT_DIRTY")),
};

// byte-wise since `str` equality is not available in const fns
const fn is_true(value: Option<&str>) -> bool {
    match value {
        Some(v) => {
            let b = v.as_bytes();
            b.len() == 4 && b[0] == b't' && b[1] == b'r' && b[2] == b'u' && b[3] == b'e'
        }
        None => false,
    }
}
