use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;

use crate::error::ProxyError;

pub const IN_PROGRESS_SUFFIX: &str = ".in-progress";

/// Store location of a cacheable resource: the decoded, normalized request path joined under the cache root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    path: PathBuf,
}

impl CacheKey {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file the body is written to before it is published.
    pub fn temp_path(&self) -> PathBuf {
        let mut raw = self.path.clone().into_os_string();
        raw.push(IN_PROGRESS_SUFFIX);
        PathBuf::from(raw)
    }
}

/// Maps a request path (no query string) onto the store.
///
/// The path is percent-decoded and lexically normalized. Rejected: `..` segments that would climb above
/// the root, NUL bytes and backslashes, undecodable sequences, and paths naming a temp file.
pub fn resolve(root: &Path, request_path: &str) -> Result<CacheKey, ProxyError> {
    let decoded = percent_decode_str(request_path)
        .decode_utf8()
        .map_err(|_| ProxyError::BadPath(request_path.to_string()))?;
    if decoded.contains(['\0', '\\']) {
        return Err(ProxyError::BadPath(request_path.to_string()));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(ProxyError::BadPath(request_path.to_string()));
                }
            }
            other => segments.push(other),
        }
    }

    if segments
        .last()
        .is_some_and(|name| name.ends_with(IN_PROGRESS_SUFFIX))
    {
        return Err(ProxyError::BadPath(request_path.to_string()));
    }

    let mut path = root.to_path_buf();
    path.extend(segments);
    Ok(CacheKey { path })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/var/cache/hoard")
    }

    #[test]
    fn joins_plain_paths_under_root() {
        let key = resolve(&root(), "/img/hello.png").unwrap();
        assert_eq!(key.path(), Path::new("/var/cache/hoard/img/hello.png"));
        assert_eq!(
            key.temp_path(),
            PathBuf::from("/var/cache/hoard/img/hello.png.in-progress")
        );
    }

    #[test]
    fn decodes_percent_escapes() {
        let key = resolve(&root(), "/a%20b/c%2Ed.png").unwrap();
        assert_eq!(key.path(), Path::new("/var/cache/hoard/a b/c.d.png"));
    }

    #[test]
    fn collapses_dot_segments() {
        let key = resolve(&root(), "/a/./b/../c//d.png").unwrap();
        assert_eq!(key.path(), Path::new("/var/cache/hoard/a/c/d.png"));
    }

    #[test]
    fn rejects_escape_attempts() {
        assert!(matches!(resolve(&root(), "/../etc/passwd"), Err(ProxyError::BadPath(_))));
        assert!(matches!(resolve(&root(), "/a/../../x.png"), Err(ProxyError::BadPath(_))));
        assert!(matches!(resolve(&root(), "/%2e%2e/x.png"), Err(ProxyError::BadPath(_))));
        assert!(matches!(resolve(&root(), "/..%2fx.png"), Err(ProxyError::BadPath(_))));
    }

    #[test]
    fn rejects_backslashes() {
        assert!(matches!(resolve(&root(), "/..%5cx.png"), Err(ProxyError::BadPath(_))));
        assert!(matches!(resolve(&root(), "/a%5Cb.png"), Err(ProxyError::BadPath(_))));
        assert!(matches!(resolve(&root(), "/a\\b.png"), Err(ProxyError::BadPath(_))));
        assert_eq!(
            resolve(&root(), "/a/b.png").unwrap().path(),
            Path::new("/var/cache/hoard/a/b.png")
        );
    }

    #[test]
    fn rejects_undecodable_paths() {
        assert!(matches!(resolve(&root(), "/%ff%fe.png"), Err(ProxyError::BadPath(_))));
        assert!(matches!(resolve(&root(), "/a%00.png"), Err(ProxyError::BadPath(_))));
    }

    #[test]
    fn rejects_temp_file_names() {
        assert!(matches!(
            resolve(&root(), "/hello.png.in-progress"),
            Err(ProxyError::BadPath(_))
        ));
    }

    #[test]
    fn root_path_resolves_to_root() {
        let key = resolve(&root(), "/").unwrap();
        assert_eq!(key.path(), root().as_path());
    }
}
