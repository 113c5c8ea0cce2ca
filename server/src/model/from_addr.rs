use std::sync::Arc;
use url::Url;

use super::MemoryModel;
use crate::Error;

/// Constructs a model from a URL. `memory://` is the only scheme shipped
/// in-tree; deployments with a relational store register their own
/// constructor in the binary.
pub fn from_addr(uri: &str, root_user_id: &str) -> Result<Arc<MemoryModel>, Error> {
    let url = Url::parse(uri)
        .map_err(|e| Error::InvalidRequest(format!("unable to parse url: {}", e)))?;

    match url.scheme() {
        "memory" => {
            if url.has_host() || !url.path().is_empty() {
                return Err(Error::InvalidRequest(
                    "memory:// doesn't take a host or path".to_string(),
                ));
            }
            Ok(Arc::new(MemoryModel::new(root_user_id)))
        }
        scheme => Err(Error::InvalidRequest(format!(
            "unknown scheme: {}",
            scheme
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::from_addr;
    use rstest::rstest;

    #[rstest]
    #[case::memory("memory://", true)]
    #[case::memory_with_host("memory://foo", false)]
    #[case::unknown("sqlite:///tmp/db", false)]
    #[case::garbage("not a url", false)]
    fn test_from_addr(#[case] uri: &str, #[case] is_ok: bool) {
        assert_eq!(from_addr(uri, "0").is_ok(), is_ok);
    }
}
