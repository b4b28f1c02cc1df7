//! Image layer identification.

use url::Url;

/// The rootfs URL a container spec requests, e.g. `docker:///library/ubuntu#latest`
/// or `local://` for the overlay provider.
#[derive(Debug, Clone)]
pub struct ImageRef(pub Url);

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
