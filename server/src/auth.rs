use longshore_bundle::BundleInfo;

/// The permission predicate consumed by the manager. Denials surface as
/// bundle failures (staging) or worker skips (scheduling), never as loop
/// errors.
pub trait Authorizer: Send + Sync {
    /// Whether `user_id` may read all of `parent_uuids`. On denial the
    /// returned message becomes the child bundle's failure message.
    fn can_read(&self, user_id: &str, parent_uuids: &[String]) -> Result<(), String>;

    /// Whether a worker owned by `worker_user_id` may run `bundle`.
    fn can_run(&self, worker_user_id: &str, bundle: &BundleInfo) -> bool;
}

/// Grants everything; the default for deployments doing authorization at
/// the API layer.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn can_read(&self, _user_id: &str, _parent_uuids: &[String]) -> Result<(), String> {
        Ok(())
    }

    fn can_run(&self, _worker_user_id: &str, _bundle: &BundleInfo) -> bool {
        true
    }
}
